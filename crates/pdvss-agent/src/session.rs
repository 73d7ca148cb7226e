//! One snapshot session against the volume-snapshot coordinator.
//!
//! The session owns the coordinator handle for the lifetime of one
//! host-initiated snapshot: gather writer metadata, select components,
//! build the snapshot set, freeze, and finally thaw by completing or
//! aborting. Every fallible step short-circuits with `?`; the
//! abort-on-failure side effect happens once, in [`SnapshotSession::finish`].

use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use pdvss_core::coordinator::{wait_and_check, Coordinator, BackupSession, SessionContext};
use pdvss_core::platform::DiskTopology;
use pdvss_proto::identity::PROVIDER_ID;
use pdvss_proto::{PdError, PdResult};

use crate::writers::{select_components, WriterRecord};

/// A coordinator backup session plus the local writer records derived
/// from its metadata.
pub struct SnapshotSession {
    session: Box<dyn BackupSession>,
    topology: Arc<dyn DiskTopology>,
    snapshot_set_id: Option<Uuid>,
    snapshot_ids: Vec<Uuid>,
    writers: Vec<WriterRecord>,
    /// Armed once `prepare_for_backup` succeeds; gates the abort call.
    abort_on_failure: bool,
}

impl SnapshotSession {
    /// Create and initialize the coordinator session with the snapshot
    /// context (application rollback, transportable, no auto-recovery).
    pub fn new(
        coordinator: &dyn Coordinator,
        topology: Arc<dyn DiskTopology>,
    ) -> PdResult<Self> {
        debug!("creating coordinator backup session");
        let session = coordinator.create_session(SessionContext::snapshot_default())?;
        Ok(Self {
            session,
            topology,
            snapshot_set_id: None,
            snapshot_ids: Vec::new(),
            writers: Vec::new(),
            abort_on_failure: false,
        })
    }

    /// Identity of the started snapshot set, once started.
    pub fn snapshot_set_id(&self) -> Option<Uuid> {
        self.snapshot_set_id
    }

    /// Per-volume snapshot ids recorded while building the set.
    pub fn snapshot_ids(&self) -> &[Uuid] {
        &self.snapshot_ids
    }

    /// Writer records with their selection state.
    pub fn writers(&self) -> &[WriterRecord] {
        &self.writers
    }

    /// Gather writer metadata and build the local records.
    pub async fn gather_writer_metadata(&mut self) -> PdResult<()> {
        debug!("gathering writer metadata");
        let op = self.session.gather_writer_metadata()?;
        wait_and_check(op).await?;
        let metadata = self.session.writer_metadata()?;
        debug!(count = metadata.len(), "writers reported");
        self.writers = metadata
            .iter()
            .map(|m| WriterRecord::from_metadata(m, self.topology.as_ref()))
            .collect();
        Ok(())
    }

    /// Build the snapshot set for `volumes`: select components, start the
    /// set, add volumes under the fixed provider identity, register the
    /// explicitly included components, and prepare for backup.
    pub async fn prepare_snapshot_set(&mut self, volumes: &[String]) -> PdResult<()> {
        select_components(&mut self.writers, volumes);

        let set_id = self.session.start_snapshot_set()?;
        debug!(%set_id, "snapshot set started");
        self.snapshot_set_id = Some(set_id);

        for volume in volumes {
            debug!(volume = %volume, "adding volume to the snapshot set");
            let snapshot_id = self.session.add_to_snapshot_set(volume, PROVIDER_ID)?;
            self.snapshot_ids.push(snapshot_id);
        }

        self.add_selected_components()?;

        debug!("preparing for backup");
        let op = self.session.prepare_for_backup()?;
        wait_and_check(op).await?;
        self.abort_on_failure = true;
        self.check_selected_writer_status().await
    }

    /// The freeze window. The coordinator synchronously drives the
    /// hardware provider inside this call; the provider's commit step is
    /// what releases the host.
    pub async fn do_snapshot_set(&mut self) -> PdResult<()> {
        debug!("creating the snapshot set");
        let op = self.session.do_snapshot_set()?;
        wait_and_check(op).await?;
        self.check_selected_writer_status().await
    }

    /// Notify writers of the backup outcome and complete the session.
    /// With no selected writer components this is a no-op success.
    pub async fn backup_complete(&mut self, succeeded: bool) -> PdResult<()> {
        if self.selected_component_count() == 0 {
            debug!("no writer components in this backup");
            return Ok(());
        }
        for writer in self.writers.iter().filter(|w| !w.excluded) {
            for comp in writer.components.iter().filter(|c| c.is_explicitly_included) {
                self.session.set_backup_succeeded(
                    writer.instance_id,
                    writer.id,
                    comp.kind,
                    &comp.logical_path,
                    &comp.name,
                    succeeded,
                )?;
            }
        }
        debug!("completing the backup");
        let op = self.session.backup_complete()?;
        wait_and_check(op).await
    }

    /// Abort the coordinator session. A no-op until `prepare_for_backup`
    /// has succeeded; calling it twice is equivalent to once.
    pub fn abort_backup(&mut self) -> PdResult<()> {
        if self.abort_on_failure {
            debug!("aborting backup");
            self.abort_on_failure = false;
            self.session.abort_backup()?;
        }
        Ok(())
    }

    /// The thaw tail: complete on success, abort on failure.
    pub async fn finish(&mut self, succeeded: bool) -> PdResult<()> {
        if succeeded {
            let result = self.backup_complete(true).await;
            if result.is_ok() {
                info!("snapshot creation done");
            }
            result
        } else {
            info!("the snapshot was not successful");
            self.abort_backup()
        }
    }

    fn selected_component_count(&self) -> usize {
        self.writers
            .iter()
            .filter(|w| !w.excluded)
            .flat_map(|w| &w.components)
            .filter(|c| c.is_explicitly_included)
            .count()
    }

    fn add_selected_components(&mut self) -> PdResult<()> {
        for writer in self.writers.iter().filter(|w| !w.excluded) {
            for comp in writer.components.iter().filter(|c| c.is_explicitly_included) {
                debug!(component = %comp.full_path, writer = %writer.name, "adding component");
                self.session.add_component(
                    writer.instance_id,
                    writer.id,
                    comp.kind,
                    &comp.logical_path,
                    &comp.name,
                )?;
            }
        }
        Ok(())
    }

    /// Fail when any selected writer reports a failed state.
    async fn check_selected_writer_status(&mut self) -> PdResult<()> {
        let op = self.session.gather_writer_status()?;
        wait_and_check(op).await?;
        for status in self.session.writer_status()? {
            let selected = self
                .writers
                .iter()
                .any(|w| w.instance_id == status.instance_id && !w.excluded);
            if !selected {
                continue;
            }
            if status.state.is_failed() {
                error!(
                    writer = %status.name,
                    state = ?status.state,
                    writer_id = %status.writer_id,
                    instance_id = %status.instance_id,
                    "selected writer is in failed state"
                );
                return Err(PdError::WriterFailed(format!(
                    "{} ({:?})",
                    status.name, status.state
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdvss_core::coordinator::WriterState;
    use pdvss_core::testing::{
        component, file_spec, writer, FailPoint, FakeCoordinator, FakeTopology,
    };

    fn topology() -> Arc<FakeTopology> {
        let mut topo = FakeTopology::new();
        topo.map_path("C:\\data\\", "\\\\?\\Volume{cccc}\\");
        topo.map_path("D:\\logs\\", "\\\\?\\Volume{dddd}\\");
        Arc::new(topo)
    }

    fn target_volumes() -> Vec<String> {
        vec!["\\\\?\\Volume{cccc}\\".to_string()]
    }

    fn coordinator_with_one_writer() -> FakeCoordinator {
        let coordinator = FakeCoordinator::new();
        coordinator.set_writers(vec![writer(
            "sql",
            vec![component("db", "", true, vec![file_spec("C:\\data")])],
        )]);
        coordinator
    }

    async fn prepared_session(
        coordinator: &FakeCoordinator,
    ) -> (SnapshotSession, Vec<String>) {
        let mut session = SnapshotSession::new(coordinator, topology()).unwrap();
        session.gather_writer_metadata().await.unwrap();
        let volumes = target_volumes();
        session.prepare_snapshot_set(&volumes).await.unwrap();
        (session, volumes)
    }

    #[tokio::test]
    async fn test_prepare_adds_volumes_and_components_in_order() {
        let coordinator = coordinator_with_one_writer();
        let (session, _) = prepared_session(&coordinator).await;

        assert!(session.snapshot_set_id().is_some());
        assert_eq!(session.snapshot_ids().len(), 1);

        let calls = coordinator.calls();
        let order: Vec<&str> = calls
            .iter()
            .map(|c| c.split(':').next().unwrap())
            .collect();
        assert_eq!(
            order,
            vec![
                "gather_writer_metadata",
                "start_snapshot_set",
                "add_volume",
                "add_component",
                "prepare_for_backup",
                "gather_writer_status",
            ]
        );
        // Volumes carry the fixed provider identity.
        assert!(calls[2].contains(&PROVIDER_ID.to_string()));
    }

    #[tokio::test]
    async fn test_context_flags_applied() {
        let coordinator = coordinator_with_one_writer();
        let _ = prepared_session(&coordinator).await;
        assert_eq!(
            coordinator.contexts(),
            vec![SessionContext {
                app_rollback: true,
                transportable: true,
                no_auto_recovery: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_writer_at_prepare_is_fatal() {
        let coordinator = FakeCoordinator::new();
        let sql = writer(
            "sql",
            vec![component("db", "", true, vec![file_spec("C:\\data")])],
        );
        coordinator.set_writer_state(sql.instance_id, WriterState::FailedAtPrepareSnapshot);
        coordinator.set_writers(vec![sql]);

        let mut session = SnapshotSession::new(&coordinator, topology()).unwrap();
        session.gather_writer_metadata().await.unwrap();
        let err = session.prepare_snapshot_set(&target_volumes()).await;
        assert!(matches!(err, Err(PdError::WriterFailed(_))));

        // The failure arrived after prepare-for-backup, so the abort fires.
        session.abort_backup().unwrap();
        assert_eq!(coordinator.abort_count(), 1);
    }

    #[tokio::test]
    async fn test_excluded_writer_failure_is_ignored() {
        let coordinator = FakeCoordinator::new();
        coordinator.set_writers(vec![
            writer(
                "sql",
                vec![component("db", "", true, vec![file_spec("C:\\data")])],
            ),
            writer(
                "other",
                vec![component("out", "", true, vec![file_spec("D:\\logs")])],
            ),
        ]);
        let mut session = SnapshotSession::new(&coordinator, topology()).unwrap();
        session.gather_writer_metadata().await.unwrap();
        let excluded_instance = session.writers()[1].instance_id;
        coordinator.set_writer_state(excluded_instance, WriterState::FailedAtFreeze);

        session.prepare_snapshot_set(&target_volumes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_failure_skips_abort() {
        let coordinator = coordinator_with_one_writer();
        coordinator.fail_at(FailPoint::PrepareForBackup);

        let mut session = SnapshotSession::new(&coordinator, topology()).unwrap();
        session.gather_writer_metadata().await.unwrap();
        assert!(session.prepare_snapshot_set(&target_volumes()).await.is_err());

        // abort_on_failure never armed: the abort is silently skipped.
        session.abort_backup().unwrap();
        assert_eq!(coordinator.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_backup_is_idempotent() {
        let coordinator = coordinator_with_one_writer();
        let (mut session, _) = prepared_session(&coordinator).await;

        session.abort_backup().unwrap();
        session.abort_backup().unwrap();
        assert_eq!(coordinator.abort_count(), 1);
    }

    #[tokio::test]
    async fn test_backup_complete_marks_selected_components() {
        let coordinator = coordinator_with_one_writer();
        let (mut session, _) = prepared_session(&coordinator).await;
        session.do_snapshot_set().await.unwrap();
        session.finish(true).await.unwrap();

        let calls = coordinator.calls();
        assert!(calls.iter().any(|c| c == "set_backup_succeeded::db:true"));
        assert_eq!(calls.last().unwrap(), "backup_complete");
        assert_eq!(coordinator.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_backup_complete_with_no_components_is_noop() {
        let coordinator = FakeCoordinator::new();
        coordinator.set_writers(vec![]);
        let (mut session, _) = prepared_session(&coordinator).await;

        session.backup_complete(true).await.unwrap();
        let calls = coordinator.calls();
        assert!(!calls.iter().any(|c| c == "backup_complete"));
        assert!(!calls.iter().any(|c| c.starts_with("set_backup_succeeded")));
    }

    #[tokio::test]
    async fn test_finish_failure_aborts() {
        let coordinator = coordinator_with_one_writer();
        let (mut session, _) = prepared_session(&coordinator).await;
        coordinator.fail_at(FailPoint::DoSnapshotSet);
        assert!(session.do_snapshot_set().await.is_err());

        session.finish(false).await.unwrap();
        assert_eq!(coordinator.abort_count(), 1);
        assert!(!coordinator.calls().iter().any(|c| c == "backup_complete"));
    }

    #[tokio::test]
    async fn test_async_status_other_than_finished_is_error() {
        let coordinator = coordinator_with_one_writer();
        coordinator.fail_at(FailPoint::GatherMetadata);
        let mut session = SnapshotSession::new(&coordinator, topology()).unwrap();
        assert!(session.gather_writer_metadata().await.is_err());
    }
}
