//! Stuck-detection rules
//!
//! Pure transitions over [`StuckContext`]. Every function takes the current
//! context by reference and returns the next one; nothing here can fail.

use crate::error::TelemetryError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Thresholds for each stuck rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckRules {
    /// Consecutive incorrect answers
    pub consecutive_wrong: u32,
    /// Unit conversion errors
    pub unit_error_count: u32,
    /// Hint requests
    pub hint_click_count: u32,
    /// Time without any input, in milliseconds
    pub idle_timeout_ms: u64,
}

impl Default for StuckRules {
    fn default() -> Self {
        Self {
            consecutive_wrong: 2,
            unit_error_count: 2,
            hint_click_count: 2,
            idle_timeout_ms: 90_000,
        }
    }
}

impl StuckRules {
    pub fn idle_timeout(&self) -> Duration {
        Duration::milliseconds(self.idle_timeout_ms as i64)
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.consecutive_wrong == 0
            || self.unit_error_count == 0
            || self.hint_click_count == 0
            || self.idle_timeout_ms == 0
        {
            return Err(TelemetryError::InvalidConfig(
                "stuck thresholds must all be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-problem learner state the rules are evaluated against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckContext {
    pub consecutive_wrong: u32,
    pub unit_errors: u32,
    pub hint_clicks: u32,
    pub last_input_time: DateTime<Utc>,
    pub problem_id: Option<String>,
    pub section_id: Option<String>,
}

/// Why a learner was judged stuck
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StuckReason {
    ConsecutiveWrong { count: u32 },
    UnitErrors { count: u32 },
    HintClicks { count: u32 },
    Idle { idle_ms: i64 },
}

impl StuckReason {
    /// Short machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            StuckReason::ConsecutiveWrong { .. } => "consecutive_wrong",
            StuckReason::UnitErrors { .. } => "unit_errors",
            StuckReason::HintClicks { .. } => "hint_clicks",
            StuckReason::Idle { .. } => "idle",
        }
    }
}

impl std::fmt::Display for StuckReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StuckReason::ConsecutiveWrong { count } => {
                write!(f, "{} consecutive incorrect answers", count)
            }
            StuckReason::UnitErrors { .. } => write!(f, "Repeated unit conversion errors"),
            StuckReason::HintClicks { .. } => {
                write!(f, "Multiple hint requests indicate difficulty")
            }
            StuckReason::Idle { .. } => write!(f, "Extended period without answering"),
        }
    }
}

/// Intervention signal derived from a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckEvent {
    pub problem_id: Option<String>,
    pub section_id: Option<String>,
    pub reason: StuckReason,
    pub timestamp: DateTime<Utc>,
}

/// Result of one rule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Context after any counter reset caused by the firing rule
    pub context: StuckContext,
    /// At most one event per evaluation
    pub event: Option<StuckEvent>,
}

/// Fresh context for a section and optional problem
pub fn create_context(
    section_id: Option<String>,
    problem_id: Option<String>,
    now: DateTime<Utc>,
) -> StuckContext {
    StuckContext {
        consecutive_wrong: 0,
        unit_errors: 0,
        hint_clicks: 0,
        last_input_time: now,
        problem_id,
        section_id,
    }
}

/// Apply a graded answer
pub fn update_after_answer(
    context: &StuckContext,
    is_correct: bool,
    has_unit_error: bool,
    now: DateTime<Utc>,
) -> StuckContext {
    let (consecutive_wrong, unit_errors) = if is_correct {
        (0, context.unit_errors)
    } else if has_unit_error {
        (context.consecutive_wrong + 1, context.unit_errors + 1)
    } else {
        (context.consecutive_wrong + 1, context.unit_errors)
    };

    StuckContext {
        consecutive_wrong,
        unit_errors,
        last_input_time: now,
        ..context.clone()
    }
}

/// Apply a hint request
pub fn update_after_hint(context: &StuckContext, now: DateTime<Utc>) -> StuckContext {
    StuckContext {
        hint_clicks: context.hint_clicks + 1,
        last_input_time: now,
        ..context.clone()
    }
}

/// Evaluate the rules in priority order and return the first match only.
///
/// The firing counter is reset in the returned context so the same condition
/// does not fire again on the next evaluation. The idle rule resets nothing;
/// it clears when new input moves `last_input_time`. Unit errors are reset
/// only when their own rule fires.
pub fn detect_stuck_event(
    context: &StuckContext,
    rules: &StuckRules,
    now: DateTime<Utc>,
) -> Detection {
    let mut next = context.clone();

    let reason = if context.consecutive_wrong >= rules.consecutive_wrong {
        next.consecutive_wrong = 0;
        Some(StuckReason::ConsecutiveWrong {
            count: context.consecutive_wrong,
        })
    } else if context.unit_errors >= rules.unit_error_count {
        next.unit_errors = 0;
        Some(StuckReason::UnitErrors {
            count: context.unit_errors,
        })
    } else if context.hint_clicks >= rules.hint_click_count {
        next.hint_clicks = 0;
        Some(StuckReason::HintClicks {
            count: context.hint_clicks,
        })
    } else {
        let idle = now - context.last_input_time;
        if idle >= rules.idle_timeout() {
            Some(StuckReason::Idle {
                idle_ms: idle.num_milliseconds(),
            })
        } else {
            None
        }
    };

    let event = reason.map(|reason| StuckEvent {
        problem_id: context.problem_id.clone(),
        section_id: context.section_id.clone(),
        reason,
        timestamp: now,
    });

    Detection {
        context: next,
        event,
    }
}
