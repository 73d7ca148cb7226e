//! Disk and volume topology lookups.

use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{GENERIC_READ, MAX_PATH};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FindFirstVolumeW, FindNextVolumeW, FindVolumeClose, GetDriveTypeW,
    GetVolumeNameForVolumeMountPointW, GetVolumePathNameW, DRIVE_FIXED, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::Storage::IscsiDisc::{IOCTL_SCSI_GET_ADDRESS, SCSI_ADDRESS};
use windows_sys::Win32::System::Environment::ExpandEnvironmentStringsW;
use windows_sys::Win32::System::Ioctl::{
    PropertyStandardQuery, StorageDeviceIdProperty, StorageDeviceProperty,
    IOCTL_STORAGE_QUERY_PROPERTY, IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, STORAGE_DEVICE_DESCRIPTOR,
    STORAGE_DEVICE_ID_DESCRIPTOR, STORAGE_IDENTIFIER, STORAGE_PROPERTY_QUERY,
    VOLUME_DISK_EXTENTS,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

use pdvss_proto::identity::{field_matches, PRODUCT_ID};
use pdvss_proto::{PdError, PdResult};

use super::{wide, OwnedHandle};
use crate::platform::{DiskTopology, ScsiAddress};

/// Bounded physical-drive scan for device-id resolution.
const MAX_PHYSICAL_DRIVES: u32 = 64;

const PROPERTY_BUFFER_SIZE: usize = 8192;

/// Topology over the live system: volume enumeration, disk extents, SCSI
/// addresses, and persistent-disk identity lookups.
pub struct WindowsTopology;

impl WindowsTopology {
    fn open_readable(path: &str) -> Option<OwnedHandle> {
        let wname = wide(path);
        // SAFETY: `wname` is NUL-terminated and outlives the call.
        let raw = unsafe {
            CreateFileW(
                wname.as_ptr(),
                GENERIC_READ,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                std::ptr::null(),
                OPEN_EXISTING,
                0,
                std::ptr::null_mut(),
            )
        };
        OwnedHandle::new(raw)
    }

    fn open_disk(disk: u32) -> PdResult<OwnedHandle> {
        Self::open_readable(&format!("\\\\.\\PhysicalDrive{disk}"))
            .ok_or_else(|| PdError::Topology(format!("cannot open disk {disk}")))
    }
}

impl DiskTopology for WindowsTopology {
    fn fixed_volumes(&self) -> PdResult<Vec<String>> {
        let mut name = [0u16; MAX_PATH as usize];
        // SAFETY: `name` is writable for MAX_PATH characters.
        let find = unsafe { FindFirstVolumeW(name.as_mut_ptr(), name.len() as u32) };
        if find.is_null() || find == windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE {
            return Err(PdError::Topology("volume enumeration failed".to_string()));
        }

        let mut volumes = Vec::new();
        loop {
            // SAFETY: `name` holds a NUL-terminated volume name here.
            let is_fixed = unsafe { GetDriveTypeW(name.as_ptr()) } == DRIVE_FIXED;
            if is_fixed {
                volumes.push(utf16_to_string(&name));
            }
            // SAFETY: `find` is a live find handle; `name` is writable.
            let more = unsafe { FindNextVolumeW(find, name.as_mut_ptr(), name.len() as u32) };
            if more == 0 {
                break;
            }
        }
        // SAFETY: `find` came from FindFirstVolumeW above.
        unsafe { FindVolumeClose(find) };
        Ok(volumes)
    }

    fn disks_for_volume(&self, volume: &str) -> PdResult<Vec<u32>> {
        // Volume functions want the trailing separator; CreateFileW is the
        // exception and would open the root directory with it.
        let trimmed = volume.trim_end_matches('\\');
        let handle = Self::open_readable(trimmed)
            .ok_or_else(|| PdError::Topology(format!("cannot open volume {volume}")))?;

        let mut buffer = vec![0u8; 4096];
        let mut bytes_returned = 0u32;
        // SAFETY: output buffer is writable for its full length.
        let ok = unsafe {
            DeviceIoControl(
                handle.0,
                IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS,
                std::ptr::null(),
                0,
                buffer.as_mut_ptr().cast(),
                buffer.len() as u32,
                &mut bytes_returned,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(PdError::Topology(format!("no disk extents for {volume}")));
        }

        // SAFETY: the driver wrote a VOLUME_DISK_EXTENTS header followed by
        // NumberOfDiskExtents entries; reads below are bounds-checked.
        let extents = unsafe { &*(buffer.as_ptr() as *const VOLUME_DISK_EXTENTS) };
        let count = extents.NumberOfDiskExtents as usize;
        let base = std::mem::offset_of!(VOLUME_DISK_EXTENTS, Extents);
        let stride = std::mem::size_of::<windows_sys::Win32::System::Ioctl::DISK_EXTENT>();
        let mut disks = Vec::with_capacity(count);
        for i in 0..count {
            let offset = base + i * stride;
            if offset + stride > buffer.len() {
                break;
            }
            // SAFETY: in-bounds, DISK_EXTENT starts with DiskNumber: u32.
            let disk = unsafe {
                std::ptr::read_unaligned(buffer.as_ptr().add(offset) as *const u32)
            };
            disks.push(disk);
        }
        Ok(disks)
    }

    fn scsi_address_for_disk(&self, disk: u32) -> PdResult<ScsiAddress> {
        let handle = Self::open_disk(disk)?;
        let mut address = unsafe { std::mem::zeroed::<SCSI_ADDRESS>() };
        let mut bytes_returned = 0u32;
        // SAFETY: `address` is writable for its full size.
        let ok = unsafe {
            DeviceIoControl(
                handle.0,
                IOCTL_SCSI_GET_ADDRESS,
                std::ptr::null(),
                0,
                (&mut address as *mut SCSI_ADDRESS).cast(),
                std::mem::size_of::<SCSI_ADDRESS>() as u32,
                &mut bytes_returned,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(PdError::Topology(format!("no SCSI address for disk {disk}")));
        }
        Ok(ScsiAddress {
            port: address.PortNumber as u32,
            target: address.TargetId,
            lun: address.Lun,
        })
    }

    fn expand_path(&self, path: &str) -> String {
        let wpath = wide(path);
        let mut buffer = [0u16; MAX_PATH as usize];
        // SAFETY: `wpath` is NUL-terminated; `buffer` is writable.
        let written = unsafe {
            ExpandEnvironmentStringsW(wpath.as_ptr(), buffer.as_mut_ptr(), buffer.len() as u32)
        };
        if written == 0 || written as usize > buffer.len() {
            return path.to_string();
        }
        utf16_to_string(&buffer)
    }

    fn volume_for_path(&self, path: &str) -> Option<String> {
        let wpath = wide(path);
        let mut mount_point = [0u16; MAX_PATH as usize];
        // SAFETY: buffers are writable for MAX_PATH characters.
        let ok = unsafe {
            GetVolumePathNameW(wpath.as_ptr(), mount_point.as_mut_ptr(), mount_point.len() as u32)
        };
        if ok == 0 {
            return None;
        }
        let mut volume = [0u16; MAX_PATH as usize];
        // SAFETY: `mount_point` is NUL-terminated; `volume` is writable.
        let ok = unsafe {
            GetVolumeNameForVolumeMountPointW(
                mount_point.as_ptr(),
                volume.as_mut_ptr(),
                volume.len() as u32,
            )
        };
        if ok == 0 {
            return None;
        }
        Some(utf16_to_string(&volume))
    }

    fn target_lun_for_device_id(&self, device_id: &[u8]) -> PdResult<(u8, u8)> {
        for disk in 0..MAX_PHYSICAL_DRIVES {
            let Ok(handle) = Self::open_disk(disk) else {
                continue;
            };
            if !is_persistent_disk(&handle) {
                continue;
            }
            match device_unique_id(&handle) {
                Ok(id) if id == device_id => {
                    let address = self.scsi_address_for_disk(disk)?;
                    debug!(disk, target = address.target, lun = address.lun,
                        "device id resolved");
                    return Ok((address.target, address.lun));
                }
                Ok(_) => {}
                Err(e) => warn!(disk, error = %e, "device id query failed"),
            }
        }
        Err(PdError::UnknownDevice)
    }
}

fn utf16_to_string(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}

fn query_storage_property(
    handle: &OwnedHandle,
    property_id: i32,
    buffer: &mut [u8],
) -> PdResult<()> {
    let mut query = unsafe { std::mem::zeroed::<STORAGE_PROPERTY_QUERY>() };
    query.PropertyId = property_id;
    query.QueryType = PropertyStandardQuery;
    let mut bytes_returned = 0u32;
    // SAFETY: `query` and `buffer` are valid for their stated sizes.
    let ok = unsafe {
        DeviceIoControl(
            handle.0,
            IOCTL_STORAGE_QUERY_PROPERTY,
            (&query as *const STORAGE_PROPERTY_QUERY).cast(),
            std::mem::size_of::<STORAGE_PROPERTY_QUERY>() as u32,
            buffer.as_mut_ptr().cast(),
            buffer.len() as u32,
            &mut bytes_returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(PdError::Topology("storage property query failed".to_string()));
    }
    Ok(())
}

/// Check the storage device descriptor's product token.
fn is_persistent_disk(handle: &OwnedHandle) -> bool {
    let mut buffer = vec![0u8; PROPERTY_BUFFER_SIZE];
    if query_storage_property(handle, StorageDeviceProperty, &mut buffer).is_err() {
        return false;
    }
    // SAFETY: the driver wrote a STORAGE_DEVICE_DESCRIPTOR at the start.
    let descriptor = unsafe { &*(buffer.as_ptr() as *const STORAGE_DEVICE_DESCRIPTOR) };
    let offset = descriptor.ProductIdOffset as usize;
    if offset == 0 || offset + PRODUCT_ID.len() >= buffer.len() {
        return false;
    }
    field_matches(&buffer[offset..], PRODUCT_ID)
}

/// Read the single page-0x83 identifier a persistent disk carries.
fn device_unique_id(handle: &OwnedHandle) -> PdResult<Vec<u8>> {
    let mut buffer = vec![0u8; PROPERTY_BUFFER_SIZE];
    query_storage_property(handle, StorageDeviceIdProperty, &mut buffer)?;
    // SAFETY: the driver wrote a STORAGE_DEVICE_ID_DESCRIPTOR at the start.
    let descriptor = unsafe { &*(buffer.as_ptr() as *const STORAGE_DEVICE_ID_DESCRIPTOR) };
    if descriptor.NumberOfIdentifiers != 1 {
        // Persistent disks carry exactly one device-id type.
        return Err(PdError::UnknownDevice);
    }
    let base = std::mem::offset_of!(STORAGE_DEVICE_ID_DESCRIPTOR, Identifiers);
    // SAFETY: the first STORAGE_IDENTIFIER begins at `base`.
    let identifier = unsafe { &*(buffer.as_ptr().add(base) as *const STORAGE_IDENTIFIER) };
    let data_start = base + std::mem::offset_of!(STORAGE_IDENTIFIER, Identifier);
    let data_len = identifier.IdentifierSize as usize;
    if data_start + data_len > buffer.len() {
        return Err(PdError::UnknownDevice);
    }
    Ok(buffer[data_start..data_start + data_len].to_vec())
}
