//! # pdvss-proto
//!
//! Protocol types and constants for the persistent-disk snapshot agent.
//!
//! This crate defines the SCSI miniport control frame exchanged with the
//! para-virtual adapter driver, the device and provider identity tokens,
//! the gate-event naming convention, and the error types shared by all
//! PDVSS components.

pub mod error;
pub mod identity;
pub mod wire;

// Re-export commonly used types at the crate root
pub use error::{PdError, PdResult};
pub use wire::{ProceedStatus, ReturnCode, SnapshotCommand, SnapshotFrame, SnapshotTarget};
