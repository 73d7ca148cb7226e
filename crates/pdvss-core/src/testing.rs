//! In-memory fakes for the platform and coordinator seams.
//!
//! Everything here is deterministic and synchronous apart from the fake
//! adapter, whose `wait_request` genuinely parks on a condition variable
//! so agent-loop tests exercise the same release-by-discard protocol the
//! driver enforces.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use pdvss_proto::wire::{ProceedStatus, SnapshotTarget};
use pdvss_proto::{PdError, PdResult};

use crate::coordinator::{
    AsyncStatus, BackupSession, ComponentKind, ComponentMetadata, Coordinator, CoordinatorAsync,
    DescriptorKind, FileSpec, SessionContext, WriterMetadata, WriterState, WriterStatus,
};
use crate::platform::{Adapter, AdapterChannel, DiskTopology, Gate, GateEvents, ScsiAddress};

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AdapterQueue {
    pending: VecDeque<SnapshotTarget>,
    cancel_pending: bool,
}

struct AdapterState {
    queue: Mutex<AdapterQueue>,
    cond: Condvar,
    reports: Mutex<Vec<(SnapshotTarget, ProceedStatus)>>,
    discards: AtomicUsize,
    channels: AtomicUsize,
    fail_reports: AtomicBool,
}

/// Fake host adapter. Channels share one request queue; a discard releases
/// the (single) parked `wait_request`, mirroring the driver contract.
#[derive(Clone)]
pub struct FakeAdapter {
    port: u32,
    state: Arc<AdapterState>,
}

impl FakeAdapter {
    pub fn new(port: u32) -> Self {
        Self {
            port,
            state: Arc::new(AdapterState {
                queue: Mutex::new(AdapterQueue::default()),
                cond: Condvar::new(),
                reports: Mutex::new(Vec::new()),
                discards: AtomicUsize::new(0),
                channels: AtomicUsize::new(0),
                fail_reports: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a host snapshot request.
    pub fn push_request(&self, target: SnapshotTarget) {
        self.state.queue.lock().unwrap().pending.push_back(target);
        self.state.cond.notify_all();
    }

    /// Make every subsequent `report` fail at the IOCTL level.
    pub fn fail_reports(&self, fail: bool) {
        self.state.fail_reports.store(fail, Ordering::SeqCst);
    }

    /// All `(target, status)` pairs reported so far, in order.
    pub fn reports(&self) -> Vec<(SnapshotTarget, ProceedStatus)> {
        self.state.reports.lock().unwrap().clone()
    }

    pub fn discard_count(&self) -> usize {
        self.state.discards.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels.load(Ordering::SeqCst)
    }
}

impl Adapter for FakeAdapter {
    fn port_number(&self) -> u32 {
        self.port
    }

    fn open_channel(&self) -> PdResult<Box<dyn AdapterChannel>> {
        self.state.channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChannel {
            state: self.state.clone(),
        }))
    }
}

struct FakeChannel {
    state: Arc<AdapterState>,
}

impl AdapterChannel for FakeChannel {
    fn wait_request(&self) -> PdResult<SnapshotTarget> {
        let mut queue = self.state.queue.lock().unwrap();
        loop {
            if queue.cancel_pending {
                queue.cancel_pending = false;
                return Err(PdError::Cancelled);
            }
            if let Some(target) = queue.pending.pop_front() {
                return Ok(target);
            }
            queue = self.state.cond.wait(queue).unwrap();
        }
    }

    fn report(&self, target: SnapshotTarget, status: ProceedStatus) -> PdResult<()> {
        if self.state.fail_reports.load(Ordering::SeqCst) {
            return Err(PdError::Ioctl);
        }
        self.state.reports.lock().unwrap().push((target, status));
        Ok(())
    }

    fn discard(&self) -> PdResult<()> {
        // Always a benign success; the next parked (or arriving)
        // `wait_request` completes cancelled.
        self.state.discards.fetch_add(1, Ordering::SeqCst);
        self.state.queue.lock().unwrap().cancel_pending = true;
        self.state.cond.notify_all();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Fake disk/volume topology backed by lookup tables.
#[derive(Default)]
pub struct FakeTopology {
    volumes: Vec<(String, Vec<u32>)>,
    broken: HashSet<String>,
    addresses: HashMap<u32, ScsiAddress>,
    env: HashMap<String, String>,
    path_volumes: HashMap<String, String>,
    device_ids: HashMap<Vec<u8>, (u8, u8)>,
}

impl FakeTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&mut self, name: &str, disks: &[u32]) {
        self.volumes.push((name.to_string(), disks.to_vec()));
    }

    pub fn break_volume(&mut self, name: &str) {
        self.broken.insert(name.to_string());
    }

    pub fn set_disk_address(&mut self, disk: u32, addr: ScsiAddress) {
        self.addresses.insert(disk, addr);
    }

    pub fn set_env(&mut self, var: &str, value: &str) {
        self.env.insert(var.to_string(), value.to_string());
    }

    pub fn map_path(&mut self, path: &str, volume: &str) {
        self.path_volumes.insert(path.to_string(), volume.to_string());
    }

    pub fn map_device_id(&mut self, device_id: &[u8], target: u8, lun: u8) {
        self.device_ids.insert(device_id.to_vec(), (target, lun));
    }
}

impl DiskTopology for FakeTopology {
    fn fixed_volumes(&self) -> PdResult<Vec<String>> {
        Ok(self.volumes.iter().map(|(name, _)| name.clone()).collect())
    }

    fn disks_for_volume(&self, volume: &str) -> PdResult<Vec<u32>> {
        if self.broken.contains(volume) {
            return Err(PdError::Topology(format!("no extents for {volume}")));
        }
        self.volumes
            .iter()
            .find(|(name, _)| name == volume)
            .map(|(_, disks)| disks.clone())
            .ok_or_else(|| PdError::Topology(format!("unknown volume {volume}")))
    }

    fn scsi_address_for_disk(&self, disk: u32) -> PdResult<ScsiAddress> {
        self.addresses
            .get(&disk)
            .copied()
            .ok_or_else(|| PdError::Topology(format!("no address for disk {disk}")))
    }

    fn expand_path(&self, path: &str) -> String {
        let mut expanded = path.to_string();
        for (var, value) in &self.env {
            expanded = expanded.replace(&format!("%{var}%"), value);
        }
        expanded
    }

    fn volume_for_path(&self, path: &str) -> Option<String> {
        self.path_volumes.get(path).cloned()
    }

    fn target_lun_for_device_id(&self, device_id: &[u8]) -> PdResult<(u8, u8)> {
        self.device_ids
            .get(device_id)
            .copied()
            .ok_or(PdError::UnknownDevice)
    }
}

// ---------------------------------------------------------------------------
// Gate events
// ---------------------------------------------------------------------------

struct GateTable {
    existing: Mutex<HashSet<String>>,
    created: Mutex<Vec<String>>,
    fail_create: AtomicBool,
}

/// Fake named-event namespace. Creating a gate makes it openable until the
/// returned handle is dropped.
#[derive(Clone)]
pub struct FakeGateEvents {
    state: Arc<GateTable>,
}

impl Default for FakeGateEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateEvents {
    pub fn new() -> Self {
        Self {
            state: Arc::new(GateTable {
                existing: Mutex::new(HashSet::new()),
                created: Mutex::new(Vec::new()),
                fail_create: AtomicBool::new(false),
            }),
        }
    }

    /// Pre-seed an event created by some other process.
    pub fn add_existing(&self, name: &str) {
        self.state.existing.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Names of every gate created through this namespace, in order.
    pub fn created(&self) -> Vec<String> {
        self.state.created.lock().unwrap().clone()
    }
}

impl GateEvents for FakeGateEvents {
    fn create(&self, name: &str) -> PdResult<Box<dyn Gate>> {
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(PdError::Gate(name.to_string()));
        }
        self.state.existing.lock().unwrap().insert(name.to_string());
        self.state.created.lock().unwrap().push(name.to_string());
        Ok(Box::new(FakeGate {
            state: self.state.clone(),
            name: name.to_string(),
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.state.existing.lock().unwrap().contains(name)
    }
}

struct FakeGate {
    state: Arc<GateTable>,
    name: String,
}

impl Gate for FakeGate {}

impl Drop for FakeGate {
    fn drop(&mut self) {
        self.state.existing.lock().unwrap().remove(&self.name);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Scripted result of an asynchronous coordinator operation.
pub struct FakeAsync {
    error: Option<PdError>,
    status: AsyncStatus,
}

impl FakeAsync {
    pub fn finished() -> Self {
        Self {
            error: None,
            status: AsyncStatus::Finished,
        }
    }

    pub fn with_status(status: AsyncStatus) -> Self {
        Self {
            error: None,
            status,
        }
    }

    pub fn failing(error: PdError) -> Self {
        Self {
            error: Some(error),
            status: AsyncStatus::Finished,
        }
    }
}

#[async_trait]
impl CoordinatorAsync for FakeAsync {
    async fn wait(&mut self) -> PdResult<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn status(&self) -> PdResult<AsyncStatus> {
        Ok(self.status)
    }
}

/// Phases of a fake session that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateSession,
    GatherMetadata,
    StartSnapshotSet,
    AddToSnapshotSet,
    AddComponent,
    PrepareForBackup,
    DoSnapshotSet,
    GatherStatus,
    BackupComplete,
}

type FreezeHook = Box<dyn Fn() -> PdResult<()> + Send + Sync>;

struct CoordinatorState {
    writers: Mutex<Vec<WriterMetadata>>,
    states: Mutex<HashMap<Uuid, WriterState>>,
    fail: Mutex<HashSet<FailPoint>>,
    calls: Mutex<Vec<String>>,
    contexts: Mutex<Vec<SessionContext>>,
    freeze_hook: Mutex<Option<FreezeHook>>,
    aborted: AtomicUsize,
}

/// Scripted coordinator: configurable writer population, per-phase failure
/// injection, a freeze-window hook, and a call log for ordering checks.
#[derive(Clone)]
pub struct FakeCoordinator {
    state: Arc<CoordinatorState>,
}

impl Default for FakeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CoordinatorState {
                writers: Mutex::new(Vec::new()),
                states: Mutex::new(HashMap::new()),
                fail: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
                contexts: Mutex::new(Vec::new()),
                freeze_hook: Mutex::new(None),
                aborted: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_writers(&self, writers: Vec<WriterMetadata>) {
        *self.state.writers.lock().unwrap() = writers;
    }

    /// Override the status-gather state for one writer instance.
    pub fn set_writer_state(&self, instance_id: Uuid, state: WriterState) {
        self.state.states.lock().unwrap().insert(instance_id, state);
    }

    pub fn fail_at(&self, point: FailPoint) {
        self.state.fail.lock().unwrap().insert(point);
    }

    /// Hook invoked inside `do_snapshot_set`, standing in for the
    /// coordinator's synchronous calls into the hardware provider.
    pub fn set_freeze_hook<F>(&self, hook: F)
    where
        F: Fn() -> PdResult<()> + Send + Sync + 'static,
    {
        *self.state.freeze_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn abort_count(&self) -> usize {
        self.state.aborted.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<SessionContext> {
        self.state.contexts.lock().unwrap().clone()
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.state.fail.lock().unwrap().contains(&point)
    }
}

impl Coordinator for FakeCoordinator {
    fn create_session(&self, context: SessionContext) -> PdResult<Box<dyn BackupSession>> {
        if self.fails(FailPoint::CreateSession) {
            return Err(PdError::Coordinator("initialize".to_string()));
        }
        self.state.contexts.lock().unwrap().push(context);
        Ok(Box::new(FakeSession {
            coordinator: self.clone(),
        }))
    }
}

struct FakeSession {
    coordinator: FakeCoordinator,
}

impl FakeSession {
    fn log(&self, entry: String) {
        self.coordinator.state.calls.lock().unwrap().push(entry);
    }

    fn async_op(&self, point: FailPoint, label: &str) -> Box<dyn CoordinatorAsync> {
        if self.coordinator.fails(point) {
            Box::new(FakeAsync::failing(PdError::Coordinator(label.to_string())))
        } else {
            Box::new(FakeAsync::finished())
        }
    }
}

impl BackupSession for FakeSession {
    fn gather_writer_metadata(&mut self) -> PdResult<Box<dyn CoordinatorAsync>> {
        self.log("gather_writer_metadata".to_string());
        Ok(self.async_op(FailPoint::GatherMetadata, "gather writer metadata"))
    }

    fn writer_metadata(&self) -> PdResult<Vec<WriterMetadata>> {
        Ok(self.coordinator.state.writers.lock().unwrap().clone())
    }

    fn start_snapshot_set(&mut self) -> PdResult<Uuid> {
        if self.coordinator.fails(FailPoint::StartSnapshotSet) {
            return Err(PdError::Coordinator("start snapshot set".to_string()));
        }
        let id = Uuid::new_v4();
        self.log(format!("start_snapshot_set:{id}"));
        Ok(id)
    }

    fn add_to_snapshot_set(&mut self, volume: &str, provider_id: Uuid) -> PdResult<Uuid> {
        if self.coordinator.fails(FailPoint::AddToSnapshotSet) {
            return Err(PdError::Coordinator("add to snapshot set".to_string()));
        }
        self.log(format!("add_volume:{volume}:{provider_id}"));
        Ok(Uuid::new_v4())
    }

    fn add_component(
        &mut self,
        instance_id: Uuid,
        _writer_id: Uuid,
        _kind: ComponentKind,
        logical_path: &str,
        name: &str,
    ) -> PdResult<()> {
        if self.coordinator.fails(FailPoint::AddComponent) {
            return Err(PdError::Coordinator("add component".to_string()));
        }
        self.log(format!("add_component:{instance_id}:{logical_path}:{name}"));
        Ok(())
    }

    fn prepare_for_backup(&mut self) -> PdResult<Box<dyn CoordinatorAsync>> {
        self.log("prepare_for_backup".to_string());
        Ok(self.async_op(FailPoint::PrepareForBackup, "prepare for backup"))
    }

    fn do_snapshot_set(&mut self) -> PdResult<Box<dyn CoordinatorAsync>> {
        self.log("do_snapshot_set".to_string());
        if let Some(hook) = self.coordinator.state.freeze_hook.lock().unwrap().as_ref() {
            if let Err(e) = hook() {
                return Ok(Box::new(FakeAsync::failing(e)));
            }
        }
        Ok(self.async_op(FailPoint::DoSnapshotSet, "do snapshot set"))
    }

    fn gather_writer_status(&mut self) -> PdResult<Box<dyn CoordinatorAsync>> {
        self.log("gather_writer_status".to_string());
        Ok(self.async_op(FailPoint::GatherStatus, "gather writer status"))
    }

    fn writer_status(&self) -> PdResult<Vec<WriterStatus>> {
        let states = self.coordinator.state.states.lock().unwrap();
        Ok(self
            .coordinator
            .state
            .writers
            .lock()
            .unwrap()
            .iter()
            .map(|w| WriterStatus {
                instance_id: w.instance_id,
                writer_id: w.writer_id,
                name: w.name.clone(),
                state: states
                    .get(&w.instance_id)
                    .copied()
                    .unwrap_or(WriterState::Stable),
            })
            .collect())
    }

    fn set_backup_succeeded(
        &mut self,
        _instance_id: Uuid,
        _writer_id: Uuid,
        _kind: ComponentKind,
        logical_path: &str,
        name: &str,
        succeeded: bool,
    ) -> PdResult<()> {
        self.log(format!("set_backup_succeeded:{logical_path}:{name}:{succeeded}"));
        Ok(())
    }

    fn backup_complete(&mut self) -> PdResult<Box<dyn CoordinatorAsync>> {
        self.log("backup_complete".to_string());
        Ok(self.async_op(FailPoint::BackupComplete, "backup complete"))
    }

    fn abort_backup(&mut self) -> PdResult<()> {
        self.log("abort_backup".to_string());
        self.coordinator.state.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Metadata builders
// ---------------------------------------------------------------------------

/// Shorthand writer constructor for tests.
pub fn writer(name: &str, components: Vec<ComponentMetadata>) -> WriterMetadata {
    WriterMetadata {
        instance_id: Uuid::new_v4(),
        writer_id: Uuid::new_v4(),
        name: name.to_string(),
        components,
    }
}

/// Shorthand component constructor for tests.
pub fn component(
    name: &str,
    logical_path: &str,
    selectable: bool,
    files: Vec<FileSpec>,
) -> ComponentMetadata {
    ComponentMetadata {
        name: name.to_string(),
        logical_path: logical_path.to_string(),
        kind: ComponentKind::FileGroup,
        selectable,
        files,
    }
}

/// Shorthand file-spec constructor for tests.
pub fn file_spec(path: &str) -> FileSpec {
    FileSpec {
        kind: DescriptorKind::FileList,
        path: path.to_string(),
        filespec: "*".to_string(),
        recursive: false,
    }
}
