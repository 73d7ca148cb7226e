//! SCSI miniport control frames for the snapshot handshake.
//!
//! The para-virtual adapter driver multiplexes the snapshot protocol over
//! the generic miniport IOCTL: every exchange is one 40-byte frame made of
//! the standard `SRB_IO_CONTROL` header followed by the snapshot payload
//! (`target`, `lun`, `status`). Fields are little-endian as laid out by the
//! driver ABI; `zerocopy` keeps the struct free of implicit padding so the
//! frame can be reinterpreted as raw bytes in both directions.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{PdError, PdResult};

/// Signature carried by every snapshot control frame.
pub const FRAME_SIGNATURE: [u8; 8] = *b"GOOOGVSS";

/// Timeout hint (seconds) passed to the driver with each frame.
pub const FRAME_TIMEOUT_SECS: u32 = 10;

/// Device-type selectors for the three snapshot functions.
pub const SNAPSHOT_REQUESTED: u32 = 0xE000;
pub const SNAPSHOT_CAN_PROCEED: u32 = 0xE010;
pub const SNAPSHOT_DISCARD: u32 = 0xE020;

const METHOD_NEITHER: u32 = 3;
const FILE_ANY_ACCESS: u32 = 0;
const SNAPSHOT_FUNCTION: u32 = 0x8FF;

/// Build a control code the way the kernel's `CTL_CODE` macro does.
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// Control codes for the snapshot functions of the driver.
pub const IOCTL_SNAPSHOT_REQUESTED: u32 =
    ctl_code(SNAPSHOT_REQUESTED, SNAPSHOT_FUNCTION, METHOD_NEITHER, FILE_ANY_ACCESS);
pub const IOCTL_SNAPSHOT_CAN_PROCEED: u32 =
    ctl_code(SNAPSHOT_CAN_PROCEED, SNAPSHOT_FUNCTION, METHOD_NEITHER, FILE_ANY_ACCESS);
pub const IOCTL_SNAPSHOT_DISCARD: u32 =
    ctl_code(SNAPSHOT_DISCARD, SNAPSHOT_FUNCTION, METHOD_NEITHER, FILE_ANY_ACCESS);

/// The three commands the agent can send down the adapter channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotCommand {
    /// Park in the driver until the host requests a snapshot.
    Requested,
    /// Report a quiesce status for a `(target, lun)` back to the host.
    CanProceed,
    /// Cancel a pending `Requested` on another channel.
    Discard,
}

impl SnapshotCommand {
    /// The control code the driver dispatches on.
    pub const fn control_code(self) -> u32 {
        match self {
            Self::Requested => IOCTL_SNAPSHOT_REQUESTED,
            Self::CanProceed => IOCTL_SNAPSHOT_CAN_PROCEED,
            Self::Discard => IOCTL_SNAPSHOT_DISCARD,
        }
    }
}

/// Driver completion codes carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ReturnCode {
    #[error("operation succeeded")]
    Succeed,
    #[error("backend failed to create snapshot")]
    BackendFailed,
    #[error("invalid target or lun")]
    InvalidDevice,
    #[error("malformed request")]
    InvalidRequest,
    #[error("operation cancelled")]
    Cancelled,
    #[error("unknown driver code {0}")]
    Unknown(u32),
}

impl ReturnCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Succeed,
            1 => Self::BackendFailed,
            2 => Self::InvalidDevice,
            3 => Self::InvalidRequest,
            4 => Self::Cancelled,
            other => Self::Unknown(other),
        }
    }

    pub fn to_code(self) -> u32 {
        match self {
            Self::Succeed => 0,
            Self::BackendFailed => 1,
            Self::InvalidDevice => 2,
            Self::InvalidRequest => 3,
            Self::Cancelled => 4,
            Self::Unknown(other) => other,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Succeed
    }
}

/// Quiesce status reported to the host with `CanProceed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProceedStatus {
    /// Writers are quiesced; the host may copy the disk.
    PrepareComplete,
    /// Quiesce machinery is not available for this disk.
    PrepareUnavailable,
    /// Quiesce was attempted and failed.
    PrepareError,
    /// The whole snapshot sequence finished successfully.
    Complete,
    /// The snapshot sequence failed after the freeze window.
    Error,
}

impl ProceedStatus {
    /// Decode a wire status. The field is 64 bits wide but only 0..=4 are
    /// defined; anything else is rejected.
    pub fn from_wire(status: u64) -> PdResult<Self> {
        match status {
            0 => Ok(Self::PrepareComplete),
            1 => Ok(Self::PrepareUnavailable),
            2 => Ok(Self::PrepareError),
            3 => Ok(Self::Complete),
            4 => Ok(Self::Error),
            other => Err(PdError::InvalidStatus(other)),
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            Self::PrepareComplete => 0,
            Self::PrepareUnavailable => 1,
            Self::PrepareError => 2,
            Self::Complete => 3,
            Self::Error => 4,
        }
    }
}

/// A host-addressed disk: SCSI target and logical unit on the adapter bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotTarget {
    pub target: u8,
    pub lun: u8,
}

impl SnapshotTarget {
    pub const fn new(target: u8, lun: u8) -> Self {
        Self { target, lun }
    }
}

impl std::fmt::Display for SnapshotTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "target {}, lun {}", self.target, self.lun)
    }
}

/// `SRB_IO_CONTROL` — the generic miniport IOCTL header.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SrbIoControl {
    pub header_length: U32,
    pub signature: [u8; 8],
    pub timeout: U32,
    pub control_code: U32,
    pub return_code: U32,
    pub length: U32,
}

/// Full snapshot control frame: header plus payload.
///
/// Payload layout matches the driver ABI: `status` sits at offset 32, two
/// reserved bytes keep it eight-byte aligned.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SnapshotFrame {
    pub header: SrbIoControl,
    pub target: u8,
    pub lun: u8,
    reserved: [u8; 2],
    pub status: U64,
}

/// Size of the header as reported in `header_length`.
pub const FRAME_HEADER_LEN: u32 = std::mem::size_of::<SrbIoControl>() as u32;

/// Size of the payload as reported in `length`.
pub const FRAME_PAYLOAD_LEN: u32 =
    (std::mem::size_of::<SnapshotFrame>() - std::mem::size_of::<SrbIoControl>()) as u32;

impl SnapshotFrame {
    /// Build an outbound frame for `command`.
    pub fn new(command: SnapshotCommand, target: SnapshotTarget, status: u64) -> Self {
        Self {
            header: SrbIoControl {
                header_length: U32::new(FRAME_HEADER_LEN),
                signature: FRAME_SIGNATURE,
                timeout: U32::new(FRAME_TIMEOUT_SECS),
                control_code: U32::new(command.control_code()),
                return_code: U32::new(0),
                length: U32::new(FRAME_PAYLOAD_LEN),
            },
            target: target.target,
            lun: target.lun,
            reserved: [0; 2],
            status: U64::new(status),
        }
    }

    /// The driver's completion code for this frame.
    pub fn return_code(&self) -> ReturnCode {
        ReturnCode::from_code(self.header.return_code.get())
    }

    /// The `(target, lun)` the driver filled in (meaningful after a
    /// completed `Requested`).
    pub fn snapshot_target(&self) -> SnapshotTarget {
        SnapshotTarget::new(self.target, self.lun)
    }

    /// Validate an inbound frame: signature must match and the completion
    /// code must be success, otherwise the driver-reported code is
    /// surfaced as an error.
    pub fn check(&self) -> PdResult<()> {
        if self.header.signature != FRAME_SIGNATURE {
            return Err(PdError::Ioctl);
        }
        match self.return_code() {
            ReturnCode::Succeed => Ok(()),
            ReturnCode::Cancelled => Err(PdError::Cancelled),
            other => Err(PdError::Driver(other)),
        }
    }
}
