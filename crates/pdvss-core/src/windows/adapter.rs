//! SCSI miniport adapter discovery and snapshot IOCTL channels.

use std::sync::OnceLock;

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::Storage::IscsiDisc::{
    IOCTL_SCSI_GET_INQUIRY_DATA, IOCTL_SCSI_MINIPORT, SCSI_ADAPTER_BUS_INFO, SCSI_INQUIRY_DATA,
};
use windows_sys::Win32::System::IO::DeviceIoControl;
use zerocopy::IntoBytes;

use pdvss_proto::identity::{field_matches, PRODUCT_ID, VENDOR_ID};
use pdvss_proto::wire::{ProceedStatus, SnapshotCommand, SnapshotFrame, SnapshotTarget};
use pdvss_proto::{PdError, PdResult};

use super::{wide, OwnedHandle};
use crate::platform::{Adapter, AdapterChannel};

/// Bounded adapter scan: `\\.\scsi0:` .. `\\.\scsi14:`.
const MAX_SCSI_PORTS: u32 = 15;

const INQUIRY_BUFFER_SIZE: usize = 2048;

/// Standard INQUIRY data: vendor id at bytes 8..16, product id at 16..32.
const INQUIRY_VENDOR_OFFSET: usize = 8;
const INQUIRY_PRODUCT_OFFSET: usize = 16;

static DISCOVERED_PORT: OnceLock<Option<u32>> = OnceLock::new();

/// The para-virtual SCSI adapter hosting persistent disks.
///
/// Discovery runs once per process and is memoised; each channel opened
/// afterwards is its own OS handle, because the port driver admits only
/// one outstanding miniport IOCTL per handle.
pub struct ScsiAdapter {
    port: u32,
}

impl ScsiAdapter {
    /// Discover the adapter. Fails with [`PdError::NoAdapter`] when no
    /// adapter carries the expected vendor and product tokens.
    pub fn discover() -> PdResult<Self> {
        let port = *DISCOVERED_PORT.get_or_init(scan_adapters);
        match port {
            Some(port) => Ok(Self { port }),
            None => Err(PdError::NoAdapter),
        }
    }
}

impl Adapter for ScsiAdapter {
    fn port_number(&self) -> u32 {
        self.port
    }

    fn open_channel(&self) -> PdResult<Box<dyn AdapterChannel>> {
        let handle = open_port(self.port).ok_or(PdError::Ioctl)?;
        Ok(Box::new(ScsiChannel { handle }))
    }
}

struct ScsiChannel {
    handle: OwnedHandle,
}

impl ScsiChannel {
    /// Exchange one snapshot frame with the driver. The same buffer is
    /// both input and output; the driver fills `target`/`lun` and the
    /// completion code.
    fn exchange(&self, mut frame: SnapshotFrame) -> PdResult<SnapshotFrame> {
        let mut bytes_returned = 0u32;
        let len = std::mem::size_of::<SnapshotFrame>() as u32;
        let buf = frame.as_mut_bytes().as_mut_ptr();
        // SAFETY: `buf` points at a plain repr(C) buffer of `len` bytes,
        // alive for the whole (synchronous) call.
        let ok = unsafe {
            DeviceIoControl(
                self.handle.0,
                IOCTL_SCSI_MINIPORT,
                buf.cast(),
                len,
                buf.cast(),
                len,
                &mut bytes_returned,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(PdError::Ioctl);
        }
        frame.check()?;
        Ok(frame)
    }
}

impl AdapterChannel for ScsiChannel {
    fn wait_request(&self) -> PdResult<SnapshotTarget> {
        let frame = SnapshotFrame::new(SnapshotCommand::Requested, SnapshotTarget::new(0, 0), 0);
        let completed = self.exchange(frame)?;
        Ok(completed.snapshot_target())
    }

    fn report(&self, target: SnapshotTarget, status: ProceedStatus) -> PdResult<()> {
        let frame = SnapshotFrame::new(SnapshotCommand::CanProceed, target, status.to_wire());
        self.exchange(frame).map(|_| ())
    }

    fn discard(&self) -> PdResult<()> {
        let frame = SnapshotFrame::new(SnapshotCommand::Discard, SnapshotTarget::new(0, 0), 0);
        self.exchange(frame).map(|_| ())
    }
}

fn open_port(port: u32) -> Option<OwnedHandle> {
    let name = wide(&format!("\\\\.\\scsi{port}:"));
    // SAFETY: `name` is NUL-terminated and outlives the call.
    let raw = unsafe {
        CreateFileW(
            name.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            std::ptr::null_mut(),
        )
    };
    OwnedHandle::new(raw)
}

/// Walk the first [`MAX_SCSI_PORTS`] adapters and return the first whose
/// inquiry data carries the persistent-disk vendor and product tokens.
fn scan_adapters() -> Option<u32> {
    for port in 0..MAX_SCSI_PORTS {
        let Some(handle) = open_port(port) else {
            continue;
        };
        match adapter_matches(&handle) {
            Ok(true) => {
                debug!(port, "persistent-disk adapter found");
                return Some(port);
            }
            Ok(false) => {}
            Err(e) => warn!(port, error = %e, "inquiry failed"),
        }
    }
    None
}

fn adapter_matches(handle: &OwnedHandle) -> PdResult<bool> {
    let mut buffer = vec![0u8; INQUIRY_BUFFER_SIZE];
    let mut bytes_returned = 0u32;
    // SAFETY: output buffer is writable for INQUIRY_BUFFER_SIZE bytes.
    let ok = unsafe {
        DeviceIoControl(
            handle.0,
            IOCTL_SCSI_GET_INQUIRY_DATA,
            std::ptr::null(),
            0,
            buffer.as_mut_ptr().cast(),
            INQUIRY_BUFFER_SIZE as u32,
            &mut bytes_returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(PdError::Ioctl);
    }

    // SAFETY: the driver wrote a SCSI_ADAPTER_BUS_INFO at the start of the
    // buffer; reads below stay within the returned byte range.
    let bus_info = unsafe { &*(buffer.as_ptr() as *const SCSI_ADAPTER_BUS_INFO) };
    for bus in 0..bus_info.NumberOfBuses as usize {
        // SAFETY: BusData is declared [_; 1] but the driver lays out
        // NumberOfBuses entries contiguously.
        let bus_data = unsafe { *bus_info.BusData.as_ptr().add(bus) };
        let mut offset = bus_data.InquiryDataOffset as usize;
        while offset != 0 && offset + std::mem::size_of::<SCSI_INQUIRY_DATA>() <= buffer.len() {
            // SAFETY: offset was produced by the driver and checked above.
            let inquiry = unsafe { &*(buffer.as_ptr().add(offset) as *const SCSI_INQUIRY_DATA) };
            let data_start = offset
                + std::mem::offset_of!(SCSI_INQUIRY_DATA, InquiryData);
            let data_len = inquiry.InquiryDataLength as usize;
            if data_start + data_len <= buffer.len() && data_len >= INQUIRY_PRODUCT_OFFSET + 16 {
                let data = &buffer[data_start..data_start + data_len];
                let vendor = &data[INQUIRY_VENDOR_OFFSET..INQUIRY_VENDOR_OFFSET + 8];
                let product = &data[INQUIRY_PRODUCT_OFFSET..INQUIRY_PRODUCT_OFFSET + 16];
                if field_matches(vendor, VENDOR_ID) && field_matches(product, PRODUCT_ID) {
                    return Ok(true);
                }
            }
            offset = inquiry.NextInquiryDataOffset as usize;
        }
    }
    Ok(false)
}
