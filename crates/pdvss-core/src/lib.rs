//! # pdvss-core
//!
//! Platform seams and shared machinery for the PDVSS snapshot agent.
//!
//! The agent and the in-process snapshot provider touch the operating
//! system in three places: the para-virtual SCSI adapter (IOCTL channel),
//! the disk/volume topology, and the named gate events the two sides
//! rendezvous on. Each is a trait here, with the Windows implementation
//! behind `cfg(windows)` and in-memory fakes behind the `testing` feature.
//! The volume-snapshot coordinator SDK is likewise consumed only through
//! the traits in [`coordinator`].

pub mod coordinator;
pub mod platform;
pub mod resolver;

#[cfg(windows)]
pub mod windows;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use platform::{Adapter, AdapterChannel, DiskTopology, Gate, GateEvents, ScsiAddress};
