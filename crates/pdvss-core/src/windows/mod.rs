//! Windows implementations of the platform seams.
//!
//! Thin FFI over `windows-sys`; every OS handle is a scoped acquisition
//! released on drop. The coordinator seam has no implementation here —
//! the vendor SDK transport lives outside this repository.

mod adapter;
mod gate;
mod topology;

pub use adapter::ScsiAdapter;
pub use gate::NamedGateEvents;
pub use topology::WindowsTopology;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};

/// Owned OS handle, closed on drop.
pub(crate) struct OwnedHandle(pub(crate) HANDLE);

impl OwnedHandle {
    /// Wrap a handle returned by an open call; `INVALID_HANDLE_VALUE` and
    /// null both mean the open failed.
    pub(crate) fn new(raw: HANDLE) -> Option<Self> {
        if raw == INVALID_HANDLE_VALUE || raw.is_null() {
            None
        } else {
            Some(Self(raw))
        }
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned open by the OS and is owned
        // exclusively by this wrapper.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

// SAFETY: kernel handles are process-global tokens; ownership transfers
// between threads freely.
unsafe impl Send for OwnedHandle {}

/// NUL-terminated UTF-16 for the W-suffixed APIs.
pub(crate) fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}
