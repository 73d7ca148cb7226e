//! Interfaces to the OS volume-snapshot coordinator.
//!
//! The coordinator SDK is an external collaborator; the agent drives it
//! only through these traits. Writer metadata and status come back as
//! plain value types so the selection and orchestration logic stays
//! testable without the vendor stack.

use async_trait::async_trait;
use uuid::Uuid;

use pdvss_proto::{PdError, PdResult};

/// Kind of a writer-declared backup component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Database,
    FileGroup,
}

/// Kind of a file descriptor attached to a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Exclude,
    FileList,
    Database,
    DatabaseLog,
}

/// A file set declared by a writer component, as reported by the
/// coordinator: an unexpanded path, a file spec, and a recursion flag.
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub kind: DescriptorKind,
    pub path: String,
    pub filespec: String,
    pub recursive: bool,
}

/// Component metadata as reported by the coordinator.
#[derive(Debug, Clone)]
pub struct ComponentMetadata {
    pub name: String,
    pub logical_path: String,
    pub kind: ComponentKind,
    pub selectable: bool,
    pub files: Vec<FileSpec>,
}

/// Writer metadata as reported by the coordinator.
#[derive(Debug, Clone)]
pub struct WriterMetadata {
    /// Per-run writer instance identity.
    pub instance_id: Uuid,
    /// Stable writer identity.
    pub writer_id: Uuid,
    pub name: String,
    pub components: Vec<ComponentMetadata>,
}

/// Writer states reported by a status gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriterState {
    Unknown,
    Stable,
    WaitingForFreeze,
    WaitingForThaw,
    WaitingForPostSnapshot,
    WaitingForBackupComplete,
    FailedAtIdentify,
    FailedAtPrepareBackup,
    FailedAtPrepareSnapshot,
    FailedAtFreeze,
    FailedAtThaw,
    FailedAtPostSnapshot,
    FailedAtBackupComplete,
    FailedAtPreRestore,
    FailedAtPostRestore,
}

impl WriterState {
    /// True for the nine failure states; any of them aborts the session.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::FailedAtIdentify
                | Self::FailedAtPrepareBackup
                | Self::FailedAtPrepareSnapshot
                | Self::FailedAtFreeze
                | Self::FailedAtThaw
                | Self::FailedAtPostSnapshot
                | Self::FailedAtBackupComplete
                | Self::FailedAtPreRestore
                | Self::FailedAtPostRestore
        )
    }
}

/// One writer's entry in a status gather.
#[derive(Debug, Clone)]
pub struct WriterStatus {
    pub instance_id: Uuid,
    pub writer_id: Uuid,
    pub name: String,
    pub state: WriterState,
}

/// Context flags applied to a backup session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub app_rollback: bool,
    pub transportable: bool,
    pub no_auto_recovery: bool,
}

impl SessionContext {
    /// The context the agent uses for every host-initiated snapshot.
    pub fn snapshot_default() -> Self {
        Self {
            app_rollback: true,
            transportable: true,
            no_auto_recovery: true,
        }
    }
}

/// Terminal status of an asynchronous coordinator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    Finished,
    Pending,
    Cancelled,
}

/// Handle to an in-flight asynchronous coordinator operation.
#[async_trait]
pub trait CoordinatorAsync: Send {
    /// Wait for the operation to complete.
    async fn wait(&mut self) -> PdResult<()>;

    /// Query the terminal status after `wait` returned.
    fn status(&self) -> PdResult<AsyncStatus>;
}

/// Wait for an asynchronous operation and verify it actually finished.
///
/// Anything other than [`AsyncStatus::Finished`] is promoted to an error
/// even when the wait itself succeeded — as we wait and check, the
/// operation is expected to have finished always.
pub async fn wait_and_check(mut op: Box<dyn CoordinatorAsync>) -> PdResult<()> {
    op.wait().await?;
    match op.status()? {
        AsyncStatus::Finished => Ok(()),
        _ => Err(PdError::AsyncIncomplete),
    }
}

/// One backup-components session with the coordinator.
///
/// Call order follows the requester contract: gather metadata, start the
/// set, add volumes and components, prepare, snapshot, complete or abort.
pub trait BackupSession: Send {
    /// Submit the writer-metadata gather.
    fn gather_writer_metadata(&mut self) -> PdResult<Box<dyn CoordinatorAsync>>;

    /// Writer metadata collected by the last gather.
    fn writer_metadata(&self) -> PdResult<Vec<WriterMetadata>>;

    /// Start a snapshot set; returns the set identity.
    fn start_snapshot_set(&mut self) -> PdResult<Uuid>;

    /// Add a volume to the set under the given provider identity; returns
    /// the per-volume snapshot id.
    fn add_to_snapshot_set(&mut self, volume: &str, provider_id: Uuid) -> PdResult<Uuid>;

    /// Register a component for backup.
    fn add_component(
        &mut self,
        instance_id: Uuid,
        writer_id: Uuid,
        kind: ComponentKind,
        logical_path: &str,
        name: &str,
    ) -> PdResult<()>;

    /// Submit prepare-for-backup (freezes nothing yet; writers get their
    /// prepare events).
    fn prepare_for_backup(&mut self) -> PdResult<Box<dyn CoordinatorAsync>>;

    /// Submit the snapshot proper. The freeze window: the coordinator
    /// calls into the registered hardware provider during this operation.
    fn do_snapshot_set(&mut self) -> PdResult<Box<dyn CoordinatorAsync>>;

    /// Submit a writer-status gather.
    fn gather_writer_status(&mut self) -> PdResult<Box<dyn CoordinatorAsync>>;

    /// Writer statuses collected by the last gather.
    fn writer_status(&self) -> PdResult<Vec<WriterStatus>>;

    /// Record per-component backup outcome.
    fn set_backup_succeeded(
        &mut self,
        instance_id: Uuid,
        writer_id: Uuid,
        kind: ComponentKind,
        logical_path: &str,
        name: &str,
        succeeded: bool,
    ) -> PdResult<()>;

    /// Submit backup-complete (thaw notification to writers).
    fn backup_complete(&mut self) -> PdResult<Box<dyn CoordinatorAsync>>;

    /// Abort the backup.
    fn abort_backup(&mut self) -> PdResult<()>;
}

/// Entry point to the coordinator: creates initialized backup sessions.
pub trait Coordinator: Send + Sync + 'static {
    /// Create a session, initialize it for backup, apply `context`, and
    /// set the backup state (full backup, component selection, bootable
    /// state, no partial files).
    fn create_session(&self, context: SessionContext) -> PdResult<Box<dyn BackupSession>>;
}
