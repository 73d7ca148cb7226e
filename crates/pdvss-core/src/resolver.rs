//! Mapping from a host-addressed disk to the volumes it backs.

use tracing::{debug, warn};

use pdvss_proto::wire::SnapshotTarget;
use pdvss_proto::PdResult;

use crate::platform::DiskTopology;

/// Resolve the set of volumes backed by the disk at `(port, target, lun)`.
///
/// Walks every fixed volume, resolves each backing disk's SCSI address,
/// and accepts the volume when any extent lands on the addressed disk.
/// A volume appears at most once, in enumeration order. Per-volume lookup
/// failures are logged and the volume skipped; an empty result is valid
/// (a disk with no mountable volume still gets a host notification).
pub fn resolve_volumes(
    topology: &dyn DiskTopology,
    port: u32,
    st: SnapshotTarget,
) -> PdResult<Vec<String>> {
    let mut volumes = Vec::new();
    for volume in topology.fixed_volumes()? {
        let disks = match topology.disks_for_volume(&volume) {
            Ok(disks) => disks,
            Err(e) => {
                warn!(volume = %volume, error = %e, "failed to resolve disk extents");
                continue;
            }
        };
        let matched = disks.iter().any(|&disk| {
            match topology.scsi_address_for_disk(disk) {
                Ok(addr) => addr.port == port && addr.target == st.target && addr.lun == st.lun,
                Err(e) => {
                    warn!(disk, error = %e, "failed to resolve SCSI address");
                    false
                }
            }
        });
        if matched && !volumes.contains(&volume) {
            debug!(volume = %volume, %st, "volume backed by requested disk");
            volumes.push(volume);
        }
    }
    Ok(volumes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ScsiAddress;
    use crate::testing::FakeTopology;

    fn addr(port: u32, target: u8, lun: u8) -> ScsiAddress {
        ScsiAddress { port, target, lun }
    }

    #[test]
    fn test_resolves_matching_volumes_in_order() {
        let mut topo = FakeTopology::new();
        topo.add_volume("\\\\?\\Volume{aaaa}\\", &[0]);
        topo.add_volume("\\\\?\\Volume{bbbb}\\", &[1]);
        topo.add_volume("\\\\?\\Volume{cccc}\\", &[2]);
        topo.set_disk_address(0, addr(2, 1, 0));
        topo.set_disk_address(1, addr(2, 4, 0));
        topo.set_disk_address(2, addr(2, 1, 0));

        let vols = resolve_volumes(&topo, 2, SnapshotTarget::new(1, 0)).unwrap();
        assert_eq!(vols, vec!["\\\\?\\Volume{aaaa}\\", "\\\\?\\Volume{cccc}\\"]);
    }

    #[test]
    fn test_wrong_port_is_not_matched() {
        let mut topo = FakeTopology::new();
        topo.add_volume("\\\\?\\Volume{aaaa}\\", &[0]);
        topo.set_disk_address(0, addr(3, 1, 0));

        let vols = resolve_volumes(&topo, 2, SnapshotTarget::new(1, 0)).unwrap();
        assert!(vols.is_empty());
    }

    #[test]
    fn test_broken_volume_is_skipped() {
        let mut topo = FakeTopology::new();
        topo.add_volume("\\\\?\\Volume{aaaa}\\", &[0]);
        topo.add_volume("\\\\?\\Volume{bbbb}\\", &[1]);
        topo.set_disk_address(0, addr(2, 1, 0));
        topo.set_disk_address(1, addr(2, 1, 0));
        topo.break_volume("\\\\?\\Volume{aaaa}\\");

        let vols = resolve_volumes(&topo, 2, SnapshotTarget::new(1, 0)).unwrap();
        assert_eq!(vols, vec!["\\\\?\\Volume{bbbb}\\"]);
    }

    #[test]
    fn test_multi_extent_volume_appears_once() {
        let mut topo = FakeTopology::new();
        // Spanned volume with two extents on the same disk.
        topo.add_volume("\\\\?\\Volume{aaaa}\\", &[0, 0, 1]);
        topo.set_disk_address(0, addr(2, 1, 0));
        topo.set_disk_address(1, addr(2, 9, 0));

        let vols = resolve_volumes(&topo, 2, SnapshotTarget::new(1, 0)).unwrap();
        assert_eq!(vols, vec!["\\\\?\\Volume{aaaa}\\"]);
    }

    #[test]
    fn test_no_volumes_is_valid() {
        let topo = FakeTopology::new();
        let vols = resolve_volumes(&topo, 2, SnapshotTarget::new(2, 3)).unwrap();
        assert!(vols.is_empty());
    }
}
