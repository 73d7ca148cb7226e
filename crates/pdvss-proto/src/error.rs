//! Unified error type for all PDVSS components.
//!
//! Every per-request failure flows back to the processing loop, which logs
//! it and moves on to the next queued request; only adapter discovery
//! failures terminate the agent. The variants therefore mirror the failure
//! points of one snapshot pass rather than the OS error space.

use crate::wire::ReturnCode;

/// Result type alias for PDVSS operations.
pub type PdResult<T> = Result<T, PdError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PdError {
    /// No SCSI adapter carrying persistent disks was found. Fatal at
    /// startup; the agent declines to run without one.
    #[error("no matching host adapter found")]
    NoAdapter,

    /// The adapter IOCTL itself failed (OS-level failure or a mangled
    /// completion frame).
    #[error("adapter ioctl failed")]
    Ioctl,

    /// The driver completed the IOCTL with a non-success code.
    #[error("driver rejected request: {0}")]
    Driver(ReturnCode),

    /// A pending request was released by a discard (shutdown path).
    #[error("request cancelled")]
    Cancelled,

    /// Wire status outside the defined 0..=4 range.
    #[error("status value {0} out of range")]
    InvalidStatus(u64),

    /// A device id did not resolve to a known persistent disk.
    #[error("device not recognised as a persistent disk")]
    UnknownDevice,

    /// Volume or disk topology lookup failed.
    #[error("topology lookup failed: {0}")]
    Topology(String),

    /// A gate event could not be created or opened.
    #[error("gate event unavailable: {0}")]
    Gate(String),

    /// A coordinator call failed outright.
    #[error("coordinator call failed: {0}")]
    Coordinator(String),

    /// An asynchronous coordinator operation completed with a status other
    /// than "finished".
    #[error("coordinator operation did not finish")]
    AsyncIncomplete,

    /// A selected writer reported one of the failed states.
    #[error("selected writer in failed state: {0}")]
    WriterFailed(String),

    /// The provider vetoed the snapshot set: an interface call arrived out
    /// of order, with a mismatched snapshot-set id, or for a LUN the
    /// provider never prepared.
    #[error("provider vetoed the snapshot set")]
    ProviderVeto,

    /// Catch-all for broken invariants in external collaborators.
    #[error("unexpected failure")]
    Unexpected,

    /// OS-level I/O failure outside the adapter path.
    #[error("I/O error")]
    Io,
}

impl From<std::io::Error> for PdError {
    fn from(_: std::io::Error) -> Self {
        PdError::Io
    }
}
