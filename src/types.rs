//! Core telemetry records
//!
//! Types here are what the pipeline hands to the durable store: sessions, their
//! end-of-session patch, and sequenced events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event payload: a flat map of derived scalar metrics
pub type EventData = serde_json::Map<String, serde_json::Value>;

/// Kinds of events the pipeline records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Click,
    Scroll,
    PageView,
    ProblemAttempt,
    HintRequest,
    ChatMessage,
    HighlightCreate,
    Interaction,
    StuckDetected,
    SessionEnd,
    /// Host-defined event kinds
    #[serde(untagged)]
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Click => "click",
            EventType::Scroll => "scroll",
            EventType::PageView => "page_view",
            EventType::ProblemAttempt => "problem_attempt",
            EventType::HintRequest => "hint_request",
            EventType::ChatMessage => "chat_message",
            EventType::HighlightCreate => "highlight_create",
            EventType::Interaction => "interaction",
            EventType::StuckDetected => "stuck_detected",
            EventType::SessionEnd => "session_end",
            EventType::Custom(name) => name.as_str(),
        }
    }

    /// Parse a wire name, falling back to `Custom`
    pub fn from_name(name: &str) -> Self {
        match name {
            "click" => EventType::Click,
            "scroll" => EventType::Scroll,
            "page_view" => EventType::PageView,
            "problem_attempt" => EventType::ProblemAttempt,
            "hint_request" => EventType::HintRequest,
            "chat_message" => EventType::ChatMessage,
            "highlight_create" => EventType::HighlightCreate,
            "interaction" => EventType::Interaction,
            "stuck_detected" => EventType::StuckDetected,
            "session_end" => EventType::SessionEnd,
            other => EventType::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized, timestamped, sequenced record of one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Owning session
    pub session_id: String,
    /// Principal the event is attributed to. `None` while unresolved.
    pub principal_id: Option<String>,
    /// Strictly increasing per session, starting at 1
    pub sequence_num: u64,
    pub event_type: EventType,
    /// Stable identifier of the UI element or domain object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Derived scalar metrics only
    #[serde(default)]
    pub data: EventData,
    /// Section or page the event happened in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_context: Option<String>,
    /// Client-side capture time
    pub client_timestamp: DateTime<Utc>,
}

/// Host/device description stored with the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl DeviceInfo {
    /// Best description of the current process, without any UI information
    pub fn detect() -> Self {
        Self {
            platform: Some(format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)),
            user_agent: Some(format!("{}/{}", crate::PRODUCER_NAME, crate::LUMEN_VERSION)),
            language: std::env::var("LANG").ok().filter(|l| !l.is_empty()),
            timezone: std::env::var("TZ").ok().filter(|tz| !tz.is_empty()),
            ..Self::default()
        }
    }
}

/// One continuous interaction period for one principal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub principal_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub device_info: DeviceInfo,
    pub total_event_count: u64,
}

/// Update applied to a session record when it ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub ended_at: DateTime<Utc>,
    pub total_event_count: u64,
}

/// Where the pipeline stands on attributing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalState {
    /// Authenticated or provisioned principal is known
    Resolved,
    /// Provisioning failed; events queue but are not flushed
    Unresolved,
}

/// Flush counters kept per session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub events_delivered: u64,
}

/// Read-only diagnostic snapshot of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub sequence_counter: u64,
    pub principal_id: Option<String>,
    pub principal_state: Option<PrincipalState>,
    pub queued_events: usize,
    pub in_flight_events: usize,
    pub flush_timer_active: bool,
    pub session_persisted: bool,
    pub flush_stats: FlushStats,
}
