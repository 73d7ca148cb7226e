//! Structured completion events.
//!
//! Every processed host request emits exactly one outcome event carrying
//! the addressed disk and the volume set it mapped to.

use tracing::{error, info};

use pdvss_proto::wire::SnapshotTarget;

/// Emit the snapshot outcome for one processed request.
pub fn emit_outcome(succeeded: bool, st: SnapshotTarget, volumes: &[String]) {
    if succeeded {
        info!(
            event = "snapshot_succeeded",
            target = st.target,
            lun = st.lun,
            volume_count = volumes.len(),
            volumes = ?volumes,
            "snapshot succeeded"
        );
    } else {
        error!(
            event = "snapshot_failed",
            target = st.target,
            lun = st.lun,
            volume_count = volumes.len(),
            volumes = ?volumes,
            "snapshot failed"
        );
    }
}
