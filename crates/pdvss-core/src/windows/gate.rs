//! Named manual-reset events used as per-disk gates.

use tracing::debug;
use windows_sys::Win32::System::Threading::{CreateEventW, OpenEventW, EVENT_ALL_ACCESS};

use pdvss_proto::{PdError, PdResult};

use super::{wide, OwnedHandle};
use crate::platform::{Gate, GateEvents};

/// Gate events in the global kernel namespace.
///
/// Events are created with the default security descriptor, which for a
/// local-system service restricts access to the owner and administrators.
pub struct NamedGateEvents;

impl GateEvents for NamedGateEvents {
    fn create(&self, name: &str) -> PdResult<Box<dyn Gate>> {
        let wname = wide(name);
        // SAFETY: `wname` is NUL-terminated and outlives the call. Manual
        // reset, initially non-signaled, default security descriptor.
        let raw = unsafe { CreateEventW(std::ptr::null(), 1, 0, wname.as_ptr()) };
        match OwnedHandle::new(raw) {
            Some(handle) => {
                debug!(name, "gate event created");
                Ok(Box::new(NamedGate { _handle: handle }))
            }
            None => Err(PdError::Gate(name.to_string())),
        }
    }

    fn exists(&self, name: &str) -> bool {
        let wname = wide(name);
        // SAFETY: `wname` is NUL-terminated and outlives the call.
        let raw = unsafe { OpenEventW(EVENT_ALL_ACCESS, 0, wname.as_ptr()) };
        OwnedHandle::new(raw).is_some()
    }
}

struct NamedGate {
    _handle: OwnedHandle,
}

impl Gate for NamedGate {}
