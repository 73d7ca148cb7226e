//! # pdvss-provider
//!
//! In-process hardware snapshot provider for persistent disks.
//!
//! The volume-snapshot coordinator loads this provider during the freeze
//! window and drives it through three interface families: LUN support
//! queries, the snapshot-set creation phases, and load/unload
//! notifications. All of them funnel into [`HwProvider`], a single value
//! guarding one state machine behind one mutex. The transport that
//! dispatches the vendor SDK's calls onto this value lives outside this
//! repository; everything observable — the per-set state machine and the
//! "proceed" IOCTL released at commit — is here.
//!
//! The provider is registered under the fixed identity in
//! [`pdvss_proto::identity`]: GUID `b5719000-454a-4dd0-8afd-e57facd5d900`,
//! name "Google PDVSS HW Provider".

mod fsm;
mod lun;

pub use fsm::{HwProvider, SnapshotEntry, SnapshotState};
pub use lun::{BusType, LunDescriptor, StorageId, StorageIdCodeSet, StorageIdKind};
