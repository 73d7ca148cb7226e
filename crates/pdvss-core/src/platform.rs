//! Operating-system seams.
//!
//! One handle per [`AdapterChannel`]: the miniport driver admits a single
//! outstanding IOCTL per handle, so the listener parks on its own channel
//! while status reports and discards each open a fresh one.

use pdvss_proto::wire::{ProceedStatus, SnapshotTarget};
use pdvss_proto::PdResult;

/// SCSI address of a physical disk: adapter port, bus target, logical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScsiAddress {
    pub port: u32,
    pub target: u8,
    pub lun: u8,
}

/// Factory for channels to the para-virtual SCSI host adapter.
///
/// Discovery of the adapter happens once per process; `port_number` is the
/// memoised result.
pub trait Adapter: Send + Sync + 'static {
    /// Port number of the discovered adapter. Together with a bus target
    /// and lun it uniquely identifies a disk.
    fn port_number(&self) -> u32;

    /// Open a fresh channel (one OS handle) to the adapter.
    fn open_channel(&self) -> PdResult<Box<dyn AdapterChannel>>;
}

/// One open handle to the adapter. All calls are blocking.
pub trait AdapterChannel: Send {
    /// Park inside the driver until the host requests a snapshot, then
    /// return the addressed disk. Completes with a cancellation error when
    /// a discard on another channel released the pending request.
    fn wait_request(&self) -> PdResult<SnapshotTarget>;

    /// Report a quiesce status for `target` back to the host.
    fn report(&self, target: SnapshotTarget, status: ProceedStatus) -> PdResult<()>;

    /// Cancel any in-flight `wait_request` pending on a *different*
    /// channel. Benign success when nothing is pending.
    fn discard(&self) -> PdResult<()>;
}

/// Disk and volume topology of the guest.
pub trait DiskTopology: Send + Sync + 'static {
    /// All fixed-type volumes, canonical volume names, enumeration order.
    fn fixed_volumes(&self) -> PdResult<Vec<String>>;

    /// Physical disk numbers backing a volume's extents.
    fn disks_for_volume(&self, volume: &str) -> PdResult<Vec<u32>>;

    /// SCSI address of a physical disk.
    fn scsi_address_for_disk(&self, disk: u32) -> PdResult<ScsiAddress>;

    /// Environment-expand a writer-declared path. No separator handling.
    fn expand_path(&self, path: &str) -> String;

    /// Canonical volume name containing `path`, if resolvable.
    fn volume_for_path(&self, path: &str) -> Option<String>;

    /// Resolve a page-0x83 device identity to the `(target, lun)` of the
    /// persistent disk carrying it.
    fn target_lun_for_device_id(&self, device_id: &[u8]) -> PdResult<(u8, u8)>;
}

/// Named manual-reset events used as per-disk gates between the agent and
/// the provider. The handle returned by `create` keeps the event alive;
/// dropping it closes the handle.
pub trait GateEvents: Send + Sync + 'static {
    /// Create the gate (manual-reset, initially non-signaled, access
    /// restricted to the owner and administrators).
    fn create(&self, name: &str) -> PdResult<Box<dyn Gate>>;

    /// True when the gate can be opened with full access — the provider's
    /// check that the request originated from this agent.
    fn exists(&self, name: &str) -> bool;
}

/// An open gate handle. Closed on drop.
pub trait Gate: Send {}
