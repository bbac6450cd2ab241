//! Pipeline configuration
//!
//! All knobs have defaults, so an empty JSON object is a valid configuration.

use crate::error::TelemetryError;
use crate::stuck::StuckRules;
use crate::types::EventType;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Default periodic flush interval
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Default window in which repeat clicks on one target are merged
pub const DEFAULT_CLICK_MERGE_MS: u64 = 500;

/// Default scroll bucket width in percent
pub const DEFAULT_SCROLL_THRESHOLD_PCT: u32 = 10;

/// Default endpoint for best-effort delivery at unload
pub const DEFAULT_UNLOAD_ENDPOINT: &str = "/api/log-events";

/// Longest string value kept in an event payload
pub const DEFAULT_MAX_TOKEN_LEN: usize = 64;

/// Tunables for a [`crate::pipeline::Pipeline`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Periodic flush interval in milliseconds
    pub flush_interval_ms: u64,
    /// Click merge window in milliseconds
    pub click_merge_ms: u64,
    /// Scroll depth bucket width in percent (1-100)
    pub scroll_threshold_pct: u32,
    /// Event types that trigger a flush as soon as they are logged
    pub immediate_flush: Vec<EventType>,
    /// Endpoint handed to the best-effort transport on unload
    pub unload_endpoint: String,
    /// String payload values longer than this are treated as free text
    pub max_token_len: usize,
    /// Payload keys that always carry free text and are stripped
    pub free_text_keys: Vec<String>,
    /// Stuck-detection thresholds
    pub stuck: StuckRules,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            click_merge_ms: DEFAULT_CLICK_MERGE_MS,
            scroll_threshold_pct: DEFAULT_SCROLL_THRESHOLD_PCT,
            immediate_flush: vec![EventType::ProblemAttempt, EventType::SessionEnd],
            unload_endpoint: DEFAULT_UNLOAD_ENDPOINT.to_string(),
            max_token_len: DEFAULT_MAX_TOKEN_LEN,
            free_text_keys: [
                "text", "content", "message", "body", "note", "passage", "selection", "answer",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
            stuck: StuckRules::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, TelemetryError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, TelemetryError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.flush_interval_ms == 0 {
            return Err(TelemetryError::InvalidConfig(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.scroll_threshold_pct == 0 || self.scroll_threshold_pct > 100 {
            return Err(TelemetryError::InvalidConfig(format!(
                "scroll_threshold_pct must be within 1..=100, got {}",
                self.scroll_threshold_pct
            )));
        }
        if self.unload_endpoint.trim().is_empty() {
            return Err(TelemetryError::InvalidConfig(
                "unload_endpoint must not be empty".to_string(),
            ));
        }
        if self.max_token_len == 0 {
            return Err(TelemetryError::InvalidConfig(
                "max_token_len must be greater than zero".to_string(),
            ));
        }
        self.stuck.validate()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::milliseconds(self.flush_interval_ms as i64)
    }

    pub fn click_merge_window(&self) -> Duration {
        Duration::milliseconds(self.click_merge_ms as i64)
    }

    pub fn is_immediate(&self, event_type: &EventType) -> bool {
        self.immediate_flush.contains(event_type)
    }
}
