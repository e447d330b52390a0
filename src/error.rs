//! Error types for the command scheduler.
//!
//! Per-command failures never escape the scheduler tick as `Err`; they end
//! the command in `Error` or `Abort` and reach the caller through `wait`.
//! The variants here are for the calls that can fail synchronously:
//! submission, configuration parsing, ring setup and register access.

use thiserror::Error;

/// Scheduler error.
#[derive(Debug, Error)]
pub enum SchedError {
    /// No free slot, CU, or ring entry. Retried on the next tick.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Already configured, unsupported parameter, or malformed request.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The device returned data that does not follow the protocol.
    #[error("device protocol error: {0}")]
    DeviceProtocol(String),

    /// Register access port failure.
    #[error("register access at 0x{addr:x} failed: {reason}")]
    Port {
        /// Address of the failed access.
        addr: u64,
        /// Port-specific reason.
        reason: String,
    },

    /// Only a configure command is accepted before configuration.
    #[error("scheduler is not configured")]
    NotConfigured,

    /// Handle is not outstanding (never submitted or already collected).
    #[error("unknown command handle {0}")]
    UnknownHandle(u64),

    /// A synchronous command was not acknowledged in time.
    #[error("command {0} timed out")]
    Timeout(u64),

    /// The scheduler or service has been stopped.
    #[error("scheduler has shut down")]
    Shutdown,

    /// Worker thread could not be created.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SchedError>;

impl SchedError {
    /// True for errors that leave the command queued for retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}
