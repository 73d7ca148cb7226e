//! The per-snapshot-set state machine.
//!
//! The coordinator calls arrive on its own threads, re-entrantly and in
//! whatever order the coordinator chooses; one mutex guards the whole
//! state. On the happy path a set advances
//! `Preparing → Prepared → PreCommitted → Committed → Created`; any
//! out-of-order call or snapshot-set-id mismatch lands in `Aborted` with
//! the entry list cleared and the call vetoed. The commit step is the
//! side-effectful one: it releases the host by sending the "proceed"
//! IOCTL for every prepared LUN, and it must do so while still holding
//! the mutex so an abort cannot interleave.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use uuid::Uuid;

use pdvss_core::platform::{Adapter, DiskTopology, GateEvents};
use pdvss_proto::identity::{self, PRODUCT_ID};
use pdvss_proto::wire::{ProceedStatus, SnapshotTarget};
use pdvss_proto::{PdError, PdResult};

use crate::lun::LunDescriptor;

/// Lifecycle of the current snapshot set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Unknown,
    Preparing,
    Prepared,
    PreCommitted,
    Committed,
    Created,
    Aborted,
}

/// One LUN recorded for the current set.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// Identity of the original LUN.
    pub orig_lun_id: Uuid,
    /// Freshly allocated identity for the snapshot LUN.
    pub snap_lun_id: Uuid,
    /// Opaque device identity used to reach the disk's `(target, lun)`.
    pub device_id: Vec<u8>,
}

struct ProviderInner {
    state: SnapshotState,
    snapshot_set_id: Option<Uuid>,
    entries: Vec<SnapshotEntry>,
}

/// The hardware snapshot provider.
pub struct HwProvider {
    adapter: Arc<dyn Adapter>,
    topology: Arc<dyn DiskTopology>,
    gates: Arc<dyn GateEvents>,
    inner: Mutex<ProviderInner>,
}

impl HwProvider {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        topology: Arc<dyn DiskTopology>,
        gates: Arc<dyn GateEvents>,
    ) -> Self {
        Self {
            adapter,
            topology,
            gates,
            inner: Mutex::new(ProviderInner {
                state: SnapshotState::Unknown,
                snapshot_set_id: None,
                entries: Vec::new(),
            }),
        }
    }

    /// Current FSM state.
    pub fn state(&self) -> SnapshotState {
        self.lock().state
    }

    /// Snapshot of the recorded entries.
    pub fn entries(&self) -> Vec<SnapshotEntry> {
        self.lock().entries.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ProviderInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn abort_locked(inner: &mut ProviderInner, reason: &str) -> PdError {
        warn!(reason, "snapshot set aborted");
        inner.entries.clear();
        inner.state = SnapshotState::Aborted;
        PdError::ProviderVeto
    }

    /// Resolve a recorded device id to its `(target, lun)`.
    fn target_for_device_id(&self, device_id: &[u8]) -> PdResult<SnapshotTarget> {
        let (target, lun) = self.topology.target_lun_for_device_id(device_id)?;
        Ok(SnapshotTarget::new(target, lun))
    }

    // -- LUN support queries ------------------------------------------------

    /// Whether every LUN in the set is one of ours. A LUN qualifies when it
    /// carries the persistent-disk product token, its first device
    /// identifier resolves to a `(target, lun)`, and the agent's gate event
    /// for that disk can be opened — the last check is how snapshot
    /// requests from foreign requesters are rejected.
    pub fn are_luns_supported(&self, luns: &[LunDescriptor]) -> PdResult<bool> {
        let _guard = self.lock();
        for lun in luns {
            if !self.lun_supported(lun) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn lun_supported(&self, lun: &LunDescriptor) -> bool {
        if lun.product_id != PRODUCT_ID {
            debug!(product = %lun.product_id, "wrong product id");
            return false;
        }
        let Some(device_id) = lun.device_id() else {
            debug!("no device id found");
            return false;
        };
        let target = match self.target_for_device_id(device_id) {
            Ok(target) => target,
            Err(e) => {
                debug!(error = %e, "device id did not resolve");
                return false;
            }
        };
        let gate = identity::gate_event_name(target.target, target.lun);
        if !self.gates.exists(&gate) {
            debug!(gate = %gate, "gate event missing, likely a foreign requester");
            return false;
        }
        true
    }

    /// Announce the snapshot LUNs for the set. Every source LUN must have
    /// been recorded by `begin_prepare_snapshot`; an unknown LUN vetoes
    /// the call.
    pub fn get_target_luns(&self, source_luns: &[LunDescriptor]) -> PdResult<Vec<LunDescriptor>> {
        let inner = self.lock();
        let mut out = Vec::with_capacity(source_luns.len());
        for lun in source_luns {
            if !inner
                .entries
                .iter()
                .any(|e| e.orig_lun_id == lun.disk_signature)
            {
                warn!(serial = %lun.serial_number, "target luns requested for unknown LUN");
                return Err(PdError::ProviderVeto);
            }
            out.push(lun.snapshot_descriptor());
        }
        Ok(out)
    }

    // -- Snapshot-set creation phases ---------------------------------------

    /// Record the LUNs of a (possibly new) snapshot set and enter
    /// `Preparing`. Repeat calls with the same set id accumulate LUNs;
    /// a different id starts over.
    pub fn begin_prepare_snapshot(
        &self,
        snapshot_set_id: Uuid,
        luns: &[LunDescriptor],
    ) -> PdResult<()> {
        let mut inner = self.lock();
        match inner.state {
            SnapshotState::Unknown | SnapshotState::Created | SnapshotState::Aborted => {
                inner.entries.clear();
            }
            SnapshotState::Preparing => {
                if inner.snapshot_set_id != Some(snapshot_set_id) {
                    debug!(%snapshot_set_id, "new set id while preparing, starting over");
                    inner.entries.clear();
                }
            }
            _ => return Err(Self::abort_locked(&mut inner, "begin prepare out of order")),
        }

        for lun in luns {
            if inner
                .entries
                .iter()
                .any(|e| e.orig_lun_id == lun.disk_signature)
            {
                continue;
            }
            let Some(device_id) = lun.device_id() else {
                return Err(Self::abort_locked(&mut inner, "lun carries no device id"));
            };
            let entry = SnapshotEntry {
                orig_lun_id: lun.disk_signature,
                snap_lun_id: Uuid::new_v4(),
                device_id: device_id.to_vec(),
            };
            debug!(snap_lun_id = %entry.snap_lun_id, "snapshot id created");
            inner.entries.push(entry);
        }
        inner.snapshot_set_id = Some(snapshot_set_id);
        inner.state = SnapshotState::Preparing;
        Ok(())
    }

    pub fn end_prepare_snapshots(&self, snapshot_set_id: Uuid) -> PdResult<()> {
        self.advance(
            snapshot_set_id,
            SnapshotState::Preparing,
            SnapshotState::Prepared,
            "end prepare",
        )
    }

    pub fn pre_commit_snapshots(&self, snapshot_set_id: Uuid) -> PdResult<()> {
        self.advance(
            snapshot_set_id,
            SnapshotState::Prepared,
            SnapshotState::PreCommitted,
            "pre-commit",
        )
    }

    /// The freeze-window release: report every prepared disk ready so the
    /// host performs the hardware copy. Runs entirely under the state
    /// mutex; an abort arriving concurrently waits until the proceed
    /// IOCTLs are on the wire.
    pub fn commit_snapshots(&self, snapshot_set_id: Uuid) -> PdResult<()> {
        let mut inner = self.lock();
        if inner.state != SnapshotState::PreCommitted
            || inner.snapshot_set_id != Some(snapshot_set_id)
        {
            return Err(Self::abort_locked(&mut inner, "commit out of order"));
        }

        let entries = inner.entries.clone();
        for entry in &entries {
            let result = self
                .target_for_device_id(&entry.device_id)
                .and_then(|target| {
                    debug!(%target, "reporting guest ready for snapshot");
                    self.adapter
                        .open_channel()?
                        .report(target, ProceedStatus::PrepareComplete)
                });
            if let Err(e) = result {
                warn!(error = %e, "reporting snapshot ready failed");
                return Err(Self::abort_locked(&mut inner, "proceed report failed"));
            }
            info!("reported guest ready for snapshot");
        }
        inner.state = SnapshotState::Committed;
        Ok(())
    }

    pub fn post_commit_snapshots(&self, snapshot_set_id: Uuid) -> PdResult<()> {
        self.advance(
            snapshot_set_id,
            SnapshotState::Committed,
            SnapshotState::Created,
            "post-commit",
        )
    }

    /// Abort the current set. Aborts after creation are ignored.
    pub fn abort_snapshots(&self) -> PdResult<()> {
        let mut inner = self.lock();
        match inner.state {
            SnapshotState::Created => {}
            _ => {
                debug!("aborting snapshot set");
                inner.entries.clear();
                inner.state = SnapshotState::Aborted;
            }
        }
        Ok(())
    }

    fn advance(
        &self,
        snapshot_set_id: Uuid,
        from: SnapshotState,
        to: SnapshotState,
        what: &str,
    ) -> PdResult<()> {
        let mut inner = self.lock();
        if inner.state != from || inner.snapshot_set_id != Some(snapshot_set_id) {
            return Err(Self::abort_locked(&mut inner, what));
        }
        debug!(?from, ?to, "snapshot set advanced");
        inner.state = to;
        Ok(())
    }

    // -- Notifications -------------------------------------------------------

    /// Nothing significant on load.
    pub fn on_load(&self) -> PdResult<()> {
        Ok(())
    }

    /// Unloading mid-flight is treated as an abort; the FSM returns to
    /// `Unknown` either way.
    pub fn on_unload(&self) -> PdResult<()> {
        let mut inner = self.lock();
        match inner.state {
            SnapshotState::Unknown | SnapshotState::Created | SnapshotState::Aborted => {}
            _ => inner.entries.clear(),
        }
        inner.state = SnapshotState::Unknown;
        Ok(())
    }

    /// A snapshot LUN became empty. Nothing to do for now.
    pub fn on_lun_empty(&self, _lun: &LunDescriptor) -> PdResult<()> {
        Ok(())
    }

    /// Never expected for persistent-disk snapshots.
    pub fn locate_luns(&self, _luns: &[LunDescriptor]) -> PdResult<()> {
        debug!("locate_luns called, unexpected for persistent disks");
        Ok(())
    }

    /// Never expected for persistent-disk snapshots.
    pub fn fill_in_lun_info(&self, _device: &str) -> PdResult<()> {
        debug!("fill_in_lun_info called, unexpected for persistent disks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdvss_core::platform::ScsiAddress;
    use pdvss_core::testing::{FakeAdapter, FakeGateEvents, FakeTopology};
    use crate::lun::{BusType, StorageId, StorageIdCodeSet, StorageIdKind};

    fn lun(signature: Uuid, device_id: &[u8]) -> LunDescriptor {
        LunDescriptor {
            vendor_id: "Google".to_string(),
            product_id: PRODUCT_ID.to_string(),
            product_revision: "1".to_string(),
            serial_number: format!("disk-{signature}"),
            bus_type: BusType::Scsi,
            disk_signature: signature,
            storage_ids: vec![StorageId {
                code_set: StorageIdCodeSet::Binary,
                kind: StorageIdKind::VendorSpecific,
                payload: device_id.to_vec(),
            }],
        }
    }

    struct Fixture {
        adapter: FakeAdapter,
        gates: FakeGateEvents,
        provider: HwProvider,
    }

    /// Provider wired to one known disk: device id `[7]` → (1, 0).
    fn fixture() -> Fixture {
        let adapter = FakeAdapter::new(2);
        let gates = FakeGateEvents::new();
        let mut topology = FakeTopology::new();
        topology.map_device_id(&[7], 1, 0);
        topology.set_disk_address(0, ScsiAddress { port: 2, target: 1, lun: 0 });
        let provider = HwProvider::new(
            Arc::new(adapter.clone()),
            Arc::new(topology),
            Arc::new(gates.clone()),
        );
        Fixture {
            adapter,
            gates,
            provider,
        }
    }

    fn run_to_precommitted(f: &Fixture, set_id: Uuid, luns: &[LunDescriptor]) {
        f.provider.begin_prepare_snapshot(set_id, luns).unwrap();
        f.provider.end_prepare_snapshots(set_id).unwrap();
        f.provider.pre_commit_snapshots(set_id).unwrap();
    }

    #[test]
    fn test_happy_path_reaches_created() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        let luns = [lun(Uuid::new_v4(), &[7])];

        run_to_precommitted(&f, set_id, &luns);
        assert_eq!(f.provider.state(), SnapshotState::PreCommitted);

        f.provider.commit_snapshots(set_id).unwrap();
        assert_eq!(f.provider.state(), SnapshotState::Committed);
        assert_eq!(
            f.adapter.reports(),
            vec![(SnapshotTarget::new(1, 0), ProceedStatus::PrepareComplete)]
        );

        f.provider.post_commit_snapshots(set_id).unwrap();
        assert_eq!(f.provider.state(), SnapshotState::Created);
    }

    #[test]
    fn test_commit_opens_fresh_channel_per_entry() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        f.provider
            .begin_prepare_snapshot(set_id, &[lun(Uuid::new_v4(), &[7])])
            .unwrap();
        f.provider.end_prepare_snapshots(set_id).unwrap();
        f.provider.pre_commit_snapshots(set_id).unwrap();

        let before = f.adapter.channels_opened();
        f.provider.commit_snapshots(set_id).unwrap();
        assert_eq!(f.adapter.channels_opened(), before + 1);
    }

    #[test]
    fn test_out_of_order_end_prepare_aborts() {
        let f = fixture();
        let err = f.provider.end_prepare_snapshots(Uuid::new_v4());
        assert_eq!(err, Err(PdError::ProviderVeto));
        assert_eq!(f.provider.state(), SnapshotState::Aborted);
        assert!(f.provider.entries().is_empty());
    }

    #[test]
    fn test_set_id_mismatch_aborts() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        f.provider
            .begin_prepare_snapshot(set_id, &[lun(Uuid::new_v4(), &[7])])
            .unwrap();
        let err = f.provider.end_prepare_snapshots(Uuid::new_v4());
        assert_eq!(err, Err(PdError::ProviderVeto));
        assert_eq!(f.provider.state(), SnapshotState::Aborted);
    }

    #[test]
    fn test_begin_prepare_same_id_accumulates() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        let first = lun(Uuid::new_v4(), &[7]);
        let second = lun(Uuid::new_v4(), &[8]);

        f.provider.begin_prepare_snapshot(set_id, &[first.clone()]).unwrap();
        f.provider.begin_prepare_snapshot(set_id, &[second]).unwrap();
        assert_eq!(f.provider.entries().len(), 2);

        // The same LUN again is skipped, not duplicated.
        f.provider.begin_prepare_snapshot(set_id, &[first]).unwrap();
        assert_eq!(f.provider.entries().len(), 2);
    }

    #[test]
    fn test_begin_prepare_new_id_resets_entries() {
        let f = fixture();
        let old_id = Uuid::new_v4();
        f.provider
            .begin_prepare_snapshot(old_id, &[lun(Uuid::new_v4(), &[7])])
            .unwrap();

        let new_id = Uuid::new_v4();
        let fresh = lun(Uuid::new_v4(), &[8]);
        f.provider.begin_prepare_snapshot(new_id, &[fresh.clone()]).unwrap();
        let entries = f.provider.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].orig_lun_id, fresh.disk_signature);
    }

    #[test]
    fn test_commit_failure_aborts_with_veto() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        run_to_precommitted(&f, set_id, &[lun(Uuid::new_v4(), &[7])]);

        f.adapter.fail_reports(true);
        assert_eq!(f.provider.commit_snapshots(set_id), Err(PdError::ProviderVeto));
        assert_eq!(f.provider.state(), SnapshotState::Aborted);
        assert!(f.provider.entries().is_empty());
    }

    #[test]
    fn test_commit_with_unresolvable_device_aborts() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        // Device id [9] is not mapped in the fixture topology.
        run_to_precommitted(&f, set_id, &[lun(Uuid::new_v4(), &[9])]);
        assert_eq!(f.provider.commit_snapshots(set_id), Err(PdError::ProviderVeto));
        assert_eq!(f.provider.state(), SnapshotState::Aborted);
    }

    #[test]
    fn test_abort_after_created_is_noop() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        run_to_precommitted(&f, set_id, &[lun(Uuid::new_v4(), &[7])]);
        f.provider.commit_snapshots(set_id).unwrap();
        f.provider.post_commit_snapshots(set_id).unwrap();

        f.provider.abort_snapshots().unwrap();
        assert_eq!(f.provider.state(), SnapshotState::Created);
        assert_eq!(f.provider.entries().len(), 1);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        f.provider
            .begin_prepare_snapshot(set_id, &[lun(Uuid::new_v4(), &[7])])
            .unwrap();

        f.provider.abort_snapshots().unwrap();
        assert_eq!(f.provider.state(), SnapshotState::Aborted);
        f.provider.abort_snapshots().unwrap();
        assert_eq!(f.provider.state(), SnapshotState::Aborted);
        assert!(f.provider.entries().is_empty());
    }

    #[test]
    fn test_unload_mid_flight_clears_entries() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        run_to_precommitted(&f, set_id, &[lun(Uuid::new_v4(), &[7])]);

        f.provider.on_unload().unwrap();
        assert_eq!(f.provider.state(), SnapshotState::Unknown);
        assert!(f.provider.entries().is_empty());
    }

    #[test]
    fn test_begin_prepare_after_created_starts_fresh() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        run_to_precommitted(&f, set_id, &[lun(Uuid::new_v4(), &[7])]);
        f.provider.commit_snapshots(set_id).unwrap();
        f.provider.post_commit_snapshots(set_id).unwrap();

        let next_id = Uuid::new_v4();
        f.provider
            .begin_prepare_snapshot(next_id, &[lun(Uuid::new_v4(), &[8])])
            .unwrap();
        assert_eq!(f.provider.state(), SnapshotState::Preparing);
        assert_eq!(f.provider.entries().len(), 1);
    }

    #[test]
    fn test_begin_prepare_from_prepared_aborts() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        f.provider
            .begin_prepare_snapshot(set_id, &[lun(Uuid::new_v4(), &[7])])
            .unwrap();
        f.provider.end_prepare_snapshots(set_id).unwrap();

        let err = f.provider.begin_prepare_snapshot(set_id, &[lun(Uuid::new_v4(), &[8])]);
        assert_eq!(err, Err(PdError::ProviderVeto));
        assert_eq!(f.provider.state(), SnapshotState::Aborted);
    }

    #[test]
    fn test_luns_supported_requires_gate() {
        let f = fixture();
        let luns = [lun(Uuid::new_v4(), &[7])];

        // No gate event: a foreign requester started this snapshot.
        assert_eq!(f.provider.are_luns_supported(&luns), Ok(false));

        f.gates.add_existing(&identity::gate_event_name(1, 0));
        assert_eq!(f.provider.are_luns_supported(&luns), Ok(true));
    }

    #[test]
    fn test_luns_supported_rejects_wrong_product() {
        let f = fixture();
        f.gates.add_existing(&identity::gate_event_name(1, 0));
        let mut foreign = lun(Uuid::new_v4(), &[7]);
        foreign.product_id = "EphemeralDisk".to_string();
        assert_eq!(f.provider.are_luns_supported(&[foreign]), Ok(false));
    }

    #[test]
    fn test_luns_supported_rejects_unknown_device() {
        let f = fixture();
        f.gates.add_existing(&identity::gate_event_name(1, 0));
        assert_eq!(
            f.provider.are_luns_supported(&[lun(Uuid::new_v4(), &[99])]),
            Ok(false)
        );
    }

    #[test]
    fn test_luns_supported_all_or_nothing() {
        let f = fixture();
        f.gates.add_existing(&identity::gate_event_name(1, 0));
        let good = lun(Uuid::new_v4(), &[7]);
        let bad = lun(Uuid::new_v4(), &[99]);
        assert_eq!(f.provider.are_luns_supported(&[good, bad]), Ok(false));
    }

    #[test]
    fn test_get_target_luns_known_lun() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        let source = lun(Uuid::new_v4(), &[7]);
        f.provider.begin_prepare_snapshot(set_id, &[source.clone()]).unwrap();

        let targets = f.provider.get_target_luns(&[source]).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].bus_type, BusType::Scsi);
        assert!(
            pdvss_proto::identity::parse_storage_id_payload(&targets[0].storage_ids[0].payload)
                .is_some()
        );
    }

    #[test]
    fn test_get_target_luns_unknown_lun_vetoes() {
        let f = fixture();
        let set_id = Uuid::new_v4();
        f.provider
            .begin_prepare_snapshot(set_id, &[lun(Uuid::new_v4(), &[7])])
            .unwrap();

        let stranger = lun(Uuid::new_v4(), &[8]);
        assert_eq!(
            f.provider.get_target_luns(&[stranger]),
            Err(PdError::ProviderVeto)
        );
        // A veto here does not abort the set.
        assert_eq!(f.provider.state(), SnapshotState::Preparing);
    }
}
