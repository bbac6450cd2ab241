//! lumen.ui_signal.v1 schema definition
//!
//! One record per thing the host observed: a session boundary, a raw click or
//! scroll, a problem being opened or answered, a lifecycle change.

use crate::dedup::ClickTarget;
use crate::lifecycle::LifecycleEvent;
use crate::types::EventData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version
pub const SCHEMA_VERSION: &str = "lumen.ui_signal.v1";

/// Signal body, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalKind {
    /// Open a session; a missing principal provisions a guest
    SessionStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        principal_id: Option<String>,
    },
    SessionEnd,
    /// Navigation to a page/section; resets click and scroll filters
    PageView {
        page: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        referrer: Option<String>,
    },
    Click {
        #[serde(default)]
        target: ClickTarget,
        x: f64,
        y: f64,
    },
    Scroll {
        depth_percent: f64,
    },
    /// A problem became the one the learner is working on
    ProblemOpen {
        problem_id: String,
    },
    ProblemAttempt {
        problem_id: String,
        is_correct: bool,
        time_spent_ms: u64,
        #[serde(default)]
        hint_used: bool,
        /// Grader flagged a unit conversion mistake
        #[serde(default)]
        unit_error: bool,
    },
    HintRequest {
        problem_id: String,
        #[serde(default)]
        hint_index: u32,
    },
    ChatMessage {
        turn_number: u32,
        message_length: usize,
        is_user: bool,
    },
    HighlightCreate {
        text_length: usize,
        #[serde(default)]
        has_note: bool,
    },
    Interaction {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default)]
        data: EventData,
    },
    Lifecycle {
        event: LifecycleEvent,
    },
    /// Host-defined event, logged as-is
    Custom {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default)]
        data: EventData,
    },
}

impl SignalKind {
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::SessionStart { .. } => "session_start",
            SignalKind::SessionEnd => "session_end",
            SignalKind::PageView { .. } => "page_view",
            SignalKind::Click { .. } => "click",
            SignalKind::Scroll { .. } => "scroll",
            SignalKind::ProblemOpen { .. } => "problem_open",
            SignalKind::ProblemAttempt { .. } => "problem_attempt",
            SignalKind::HintRequest { .. } => "hint_request",
            SignalKind::ChatMessage { .. } => "chat_message",
            SignalKind::HighlightCreate { .. } => "highlight_create",
            SignalKind::Interaction { .. } => "interaction",
            SignalKind::Lifecycle { .. } => "lifecycle",
            SignalKind::Custom { .. } => "custom",
        }
    }
}

/// One raw UI signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiSignal {
    /// Schema version (must be "lumen.ui_signal.v1")
    pub schema_version: String,
    /// Optional host-assigned id, echoed in validation results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    /// When the host observed the signal (UTC)
    pub timestamp: DateTime<Utc>,
    /// Section/page the signal belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(flatten)]
    pub signal: SignalKind,
}

impl UiSignal {
    pub fn new(timestamp: DateTime<Utc>, signal: SignalKind) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            signal_id: None,
            timestamp,
            section: None,
            signal,
        }
    }

    pub fn in_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Validate one signal on its own
    pub fn validate(&self) -> Result<(), SignalValidationError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(SignalValidationError::InvalidSchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                actual: self.schema_version.clone(),
            });
        }

        match &self.signal {
            SignalKind::Click { x, y, .. } => {
                require_finite("x", *x)?;
                require_finite("y", *y)
            }
            SignalKind::Scroll { depth_percent } => require_finite("depth_percent", *depth_percent),
            SignalKind::PageView { page, .. } => require_non_empty("page", page),
            SignalKind::ProblemOpen { problem_id }
            | SignalKind::ProblemAttempt { problem_id, .. }
            | SignalKind::HintRequest { problem_id, .. } => {
                require_non_empty("problem_id", problem_id)
            }
            SignalKind::Interaction { action, .. } => require_non_empty("action", action),
            SignalKind::Custom { name, .. } => require_non_empty("name", name),
            _ => Ok(()),
        }
    }
}

fn require_finite(field: &str, value: f64) -> Result<(), SignalValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SignalValidationError::NonFiniteValue {
            field: field.to_string(),
        })
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), SignalValidationError> {
    if value.trim().is_empty() {
        Err(SignalValidationError::EmptyField {
            field: field.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Validation errors for UI signals
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalValidationError {
    #[error("Invalid schema version: expected {expected}, got {actual}")]
    InvalidSchemaVersion { expected: String, actual: String },

    #[error("Field `{field}` is not a finite number")]
    NonFiniteValue { field: String },

    #[error("Field `{field}` must not be empty")]
    EmptyField { field: String },

    #[error("Timestamp goes backwards: {timestamp} is before {previous}")]
    TimestampRegression {
        previous: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}
