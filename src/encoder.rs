//! Event encoder and sequencer
//!
//! Turns a request to log something into a sequenced [`Event`]: payload
//! normalization first, then sequence allocation. Payload problems are detected
//! before a number is taken, so rejected events never leave gaps.

use crate::config::PipelineConfig;
use crate::error::TelemetryError;
use crate::types::{Event, EventData, EventType};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

/// Rules for what an event payload may carry
#[derive(Debug, Clone)]
pub struct PayloadPolicy {
    max_token_len: usize,
    free_text_keys: Vec<String>,
}

impl PayloadPolicy {
    pub fn new(max_token_len: usize, free_text_keys: Vec<String>) -> Self {
        Self {
            max_token_len,
            free_text_keys: free_text_keys
                .into_iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_token_len, config.free_text_keys.clone())
    }

    /// A short identifier-like string: bounded length, no whitespace
    pub fn is_token(&self, value: &str) -> bool {
        !value.is_empty()
            && value.chars().count() <= self.max_token_len
            && !value.chars().any(char::is_whitespace)
    }

    /// Strip free text and reject anything that is not a scalar
    pub fn normalize(&self, data: EventData) -> Result<EventData, TelemetryError> {
        let mut normalized = EventData::new();

        for (key, value) in data {
            if self.free_text_keys.contains(&key.to_ascii_lowercase()) {
                debug!(field = %key, "Stripped free-text payload field");
                continue;
            }

            match value {
                Value::Null | Value::Bool(_) | Value::Number(_) => {
                    normalized.insert(key, value);
                }
                Value::String(s) => {
                    if self.is_token(&s) {
                        normalized.insert(key, Value::String(s));
                    } else {
                        debug!(field = %key, len = s.len(), "Stripped free-text payload value");
                    }
                }
                Value::Array(_) | Value::Object(_) => {
                    return Err(TelemetryError::MalformedEvent(format!(
                        "field `{}` is not a scalar",
                        key
                    )));
                }
            }
        }

        Ok(normalized)
    }

    /// Keep a target only if it is a token
    pub fn normalize_target(&self, target: Option<String>) -> Option<String> {
        let target = target?;
        let trimmed = target.trim();
        if self.is_token(trimmed) {
            Some(trimmed.to_string())
        } else {
            debug!(len = target.len(), "Dropped non-token event target");
            None
        }
    }
}

/// Convert a metric to a JSON number, rejecting NaN and infinities
pub fn finite_number(field: &str, value: f64) -> Result<Value, TelemetryError> {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| {
            TelemetryError::MalformedEvent(format!("field `{}` is not a finite number", field))
        })
}

/// Monotonic per-session counter
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    counter: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Last allocated number (0 before the first event)
    pub fn current(&self) -> u64 {
        self.counter
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

/// Request to record one event, before sequencing
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub target: Option<String>,
    pub data: EventData,
    pub section_context: Option<String>,
}

impl EventDraft {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            target: None,
            data: EventData::new(),
            section_context: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn section(mut self, section: Option<&str>) -> Self {
        self.section_context = section.map(str::to_string);
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// Normalizes and sequences events for one session
#[derive(Debug, Clone)]
pub struct EventEncoder {
    policy: PayloadPolicy,
    sequencer: Sequencer,
}

impl EventEncoder {
    pub fn new(policy: PayloadPolicy) -> Self {
        Self {
            policy,
            sequencer: Sequencer::new(),
        }
    }

    pub fn encode(
        &mut self,
        session_id: &str,
        principal_id: Option<&str>,
        draft: EventDraft,
        now: DateTime<Utc>,
    ) -> Result<Event, TelemetryError> {
        let data = self.policy.normalize(draft.data)?;
        let target = self.policy.normalize_target(draft.target);

        Ok(Event {
            session_id: session_id.to_string(),
            principal_id: principal_id.map(str::to_string),
            sequence_num: self.sequencer.next(),
            event_type: draft.event_type,
            target,
            data,
            section_context: draft.section_context,
            client_timestamp: now,
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequencer.current()
    }

    pub fn reset(&mut self) {
        self.sequencer.reset();
    }
}
