//! LUN descriptors exchanged with the coordinator.
//!
//! A trimmed-down rendition of the coordinator's LUN information block:
//! the inquiry strings, the bus type, the disk signature, and the
//! page-0x83 storage identifiers. The vendor SDK owns the real allocation
//! rules; here descriptors are plain owned values so the provider logic
//! never touches an allocator boundary.

use uuid::Uuid;

use pdvss_proto::identity;

/// Storage-identifier code sets (page 0x83).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageIdCodeSet {
    Binary,
    Ascii,
}

/// Storage-identifier types (page 0x83).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageIdKind {
    VendorSpecific,
    VendorId,
    Eui64,
    FcphName,
}

/// One storage identifier from a device's identification page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageId {
    pub code_set: StorageIdCodeSet,
    pub kind: StorageIdKind,
    pub payload: Vec<u8>,
}

/// Interconnect bus type of a LUN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Unknown,
    Scsi,
    Ata,
    Iscsi,
}

/// Coordinator-visible description of one LUN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunDescriptor {
    pub vendor_id: String,
    pub product_id: String,
    pub product_revision: String,
    pub serial_number: String,
    pub bus_type: BusType,
    /// Identity of the original LUN within a snapshot set.
    pub disk_signature: Uuid,
    pub storage_ids: Vec<StorageId>,
}

impl LunDescriptor {
    /// The opaque device identity the agent's driver stack reports for
    /// this disk: the first identifier's raw bytes.
    pub fn device_id(&self) -> Option<&[u8]> {
        self.storage_ids.first().map(|id| id.payload.as_slice())
    }

    /// Synthesize the descriptor announced for the snapshot LUN: same
    /// basic inquiry strings, SCSI bus type, a cleared disk signature, and
    /// a single fresh vendor-id identifier (ASCII code set, vendor token
    /// followed by a newly generated GUID) guaranteeing uniqueness.
    pub fn snapshot_descriptor(&self) -> LunDescriptor {
        LunDescriptor {
            vendor_id: self.vendor_id.clone(),
            product_id: self.product_id.clone(),
            product_revision: self.product_revision.clone(),
            serial_number: self.serial_number.clone(),
            bus_type: BusType::Scsi,
            disk_signature: Uuid::nil(),
            storage_ids: vec![StorageId {
                code_set: StorageIdCodeSet::Ascii,
                kind: StorageIdKind::VendorId,
                payload: identity::storage_id_payload(Uuid::new_v4()).to_vec(),
            }],
        }
    }
}
