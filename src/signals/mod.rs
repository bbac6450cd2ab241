//! lumen.ui_signal.v1 schema
//!
//! Raw UI signals as emitted by host adapters, before dedup and sequencing.
//! A recorded signal stream can be validated and replayed through a pipeline
//! and a stuck monitor on a simulated clock.

mod replay;
mod ui_signal;

pub use replay::*;
pub use ui_signal::*;
