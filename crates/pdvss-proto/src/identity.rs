//! Device and provider identity.
//!
//! The agent and the snapshot provider recognise "their" hardware by two
//! ASCII tokens burned into the virtual SCSI inquiry data, and announce
//! themselves to the volume-snapshot coordinator under a fixed provider
//! GUID and name. The storage-identifier payload format here is the
//! page-0x83 device identity the persistent-disk backend exposes.

use uuid::Uuid;

/// SCSI inquiry vendor token.
pub const VENDOR_ID: &str = "Google";
/// SCSI inquiry / storage-property product token.
pub const PRODUCT_ID: &str = "PersistentDisk";

/// Fixed identity of the in-process hardware provider:
/// `b5719000-454a-4dd0-8afd-e57facd5d900`.
pub const PROVIDER_ID: Uuid = Uuid::from_u128(0xb5719000_454a_4dd0_8afd_e57facd5d900);
/// Human-readable provider name registered with the coordinator.
pub const PROVIDER_NAME: &str = "Google PDVSS HW Provider";
/// Provider version string.
pub const PROVIDER_VERSION: &str = "1.0";
/// Provider version id: `00561d00-0472-4fbc-b738-3d2634104500`.
pub const PROVIDER_VERSION_ID: Uuid = Uuid::from_u128(0x00561d00_0472_4fbc_b738_3d2634104500);

/// Width of the inquiry vendor field.
pub const VENDOR_FIELD_LEN: usize = 8;
/// Width of the inquiry product field.
pub const PRODUCT_FIELD_LEN: usize = 16;

/// Length of the vendor prefix in a storage-id payload.
pub const STORAGE_ID_VENDOR_LEN: usize = 8;
/// Total length of a synthesized storage-id payload: vendor prefix + GUID.
pub const STORAGE_ID_PAYLOAD_LEN: usize = STORAGE_ID_VENDOR_LEN + 16;

/// Match a fixed-width inquiry field against an ASCII token.
///
/// The comparison is null-terminated at the token's width: the field byte
/// at the token's length is treated as the terminator, so padding beyond
/// the token never participates.
pub fn field_matches(field: &[u8], token: &str) -> bool {
    let token = token.as_bytes();
    field.len() > token.len() && &field[..token.len()] == token
}

/// Build a page-0x83 style storage-id payload: the vendor token padded
/// with NULs to eight bytes, followed by the GUID in device byte order.
pub fn storage_id_payload(id: Uuid) -> [u8; STORAGE_ID_PAYLOAD_LEN] {
    let mut payload = [0u8; STORAGE_ID_PAYLOAD_LEN];
    payload[..VENDOR_ID.len()].copy_from_slice(VENDOR_ID.as_bytes());
    payload[STORAGE_ID_VENDOR_LEN..].copy_from_slice(&id.to_bytes_le());
    payload
}

/// Parse a payload previously built by [`storage_id_payload`]. Returns
/// `None` when the length or the vendor prefix does not match.
pub fn parse_storage_id_payload(payload: &[u8]) -> Option<Uuid> {
    if payload.len() != STORAGE_ID_PAYLOAD_LEN {
        return None;
    }
    let mut vendor = [0u8; STORAGE_ID_VENDOR_LEN];
    vendor[..VENDOR_ID.len()].copy_from_slice(VENDOR_ID.as_bytes());
    if payload[..STORAGE_ID_VENDOR_LEN] != vendor {
        return None;
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&payload[STORAGE_ID_VENDOR_LEN..]);
    Some(Uuid::from_bytes_le(raw))
}

/// Name of the gate event both sides rendezvous on for one disk.
///
/// The agent creates the event before starting a session; the provider
/// refuses any coordinator request whose disks have no open gate.
pub fn gate_event_name(target: u8, lun: u8) -> String {
    format!("Global\\PDVSS-{}-{}", target, lun)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_matches_truncates_at_token() {
        // Inquiry data pads with spaces; only the token-width prefix counts.
        assert!(field_matches(b"Google  ", VENDOR_ID));
        assert!(field_matches(b"Google\0\0", VENDOR_ID));
        assert!(!field_matches(b"Goggle  ", VENDOR_ID));
        assert!(field_matches(b"PersistentDisk\0\0", PRODUCT_ID));
        assert!(!field_matches(b"EphemeralDisk\0\0\0", PRODUCT_ID));
        // A field no wider than the token cannot carry the terminator.
        assert!(!field_matches(b"Google", VENDOR_ID));
    }

    #[test]
    fn test_storage_id_round_trip() {
        let id = Uuid::new_v4();
        let payload = storage_id_payload(id);
        assert_eq!(payload.len(), 24);
        assert_eq!(&payload[..6], b"Google");
        assert_eq!(&payload[6..8], &[0, 0]);
        assert_eq!(parse_storage_id_payload(&payload), Some(id));
    }

    #[test]
    fn test_storage_id_rejects_foreign_payload() {
        let mut payload = storage_id_payload(Uuid::new_v4());
        payload[0] = b'X';
        assert_eq!(parse_storage_id_payload(&payload), None);
        assert_eq!(parse_storage_id_payload(&payload[..20]), None);
    }

    #[test]
    fn test_gate_event_name() {
        assert_eq!(gate_event_name(5, 2), "Global\\PDVSS-5-2");
        assert_eq!(gate_event_name(0, 0), "Global\\PDVSS-0-0");
        assert_eq!(gate_event_name(255, 255), "Global\\PDVSS-255-255");
    }
}
