//! Error types for Lumen Telemetry
//!
//! None of these reach the UI layer through the pipeline API. They travel between
//! the pipeline and its collaborators (stores, identity providers) and surface
//! directly only from configuration loading, the FFI layer, and the CLI.

use thiserror::Error;

/// Errors that can occur while capturing or delivering telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Store rejected request: {0}")]
    StoreRejected(String),

    #[error("Principal provisioning failed: {0}")]
    PrincipalProvisioning(String),

    #[error("Malformed event data: {0}")]
    MalformedEvent(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse input: {0}")]
    ParseError(String),
}

impl TelemetryError {
    /// Whether the failure came from the delivery path and is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TelemetryError::Transport(_) | TelemetryError::StoreRejected(_) | TelemetryError::Io(_)
        )
    }
}
