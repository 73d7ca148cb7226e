//! # pdvss-agent
//!
//! Guest agent coordinating application-consistent persistent-disk
//! snapshots.
//!
//! The storage host signals its intent to snapshot a disk through the
//! para-virtual SCSI driver; this agent quiesces the application stack on
//! the volumes that disk backs (via the OS volume-snapshot coordinator),
//! tells the host when it is safe to copy, thaws the writers, and reports
//! the outcome. Two long-lived workers do the job: a listener parked in
//! the driver and a processor that runs one snapshot session at a time —
//! see [`service::AgentService`].

pub mod events;
pub mod service;
pub mod session;
pub mod writers;
