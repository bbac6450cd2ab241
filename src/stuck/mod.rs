//! Stuck detection
//!
//! Decides when a learner needs help from answer outcomes, hint requests, and
//! idle time. The rules are pure; the monitor adds the idle-watch timer.

pub mod detector;
pub mod monitor;

pub use detector::{
    create_context, detect_stuck_event, update_after_answer, update_after_hint, Detection,
    StuckContext, StuckEvent, StuckReason, StuckRules,
};
pub use monitor::StuckMonitor;
