//! Lumen Telemetry - client-side behavioral telemetry for learning applications
//!
//! Lumen captures fine-grained interaction events with strict per-session
//! ordering and delivers them to a durable store through a deterministic
//! pipeline: dedup/debounce → normalization and sequencing → delivery queue →
//! flush with retry. A separate rule engine watches answer outcomes, hint
//! requests and idle time to decide when a learner is stuck.
//!
//! ## Modules
//!
//! - **Pipeline**: session lifecycle, event logging, flush and retry
//! - **Stuck detection**: pure rules plus a monitor that owns the idle watch
//! - **Signals**: the `lumen.ui_signal.v1` schema and a replayer for recorded streams

pub mod clock;
pub mod config;
pub mod dedup;
pub mod encoder;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod principal;
pub mod queue;
pub mod scheduler;
pub mod signals;
pub mod stuck;
pub mod transport;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PipelineConfig;
pub use dedup::ClickTarget;
pub use error::TelemetryError;
pub use lifecycle::{HookRegistry, LifecycleEvent, LifecycleSignals};
pub use pipeline::Pipeline;
pub use principal::{Principal, PrincipalKind};
pub use queue::QueueBatch;
pub use scheduler::{DeadlineScheduler, TaskScheduler};
pub use transport::{BestEffortTransport, EventStore, MemoryStore, NdjsonStore};
pub use types::{Event, EventData, EventType, SessionInfo, SessionRecord};

// Stuck detection exports
pub use stuck::{
    create_context, detect_stuck_event, update_after_answer, update_after_hint, StuckContext,
    StuckEvent, StuckMonitor, StuckReason, StuckRules,
};

// Signal schema exports
pub use signals::{Replayer, SignalAdapter, UiSignal, SCHEMA_VERSION};

/// Library version, reported in device info
pub const LUMEN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported in device info
pub const PRODUCER_NAME: &str = "lumen-telemetry";
