//! Guest communication service registration.
//!
//! A host service becomes dialable from guests once its service GUID is
//! registered under the Hyper-V guest-communication-services registry key.
//! The `ElementName` value is the human-readable service name shown by
//! management tooling.

use crate::error::{Error, Result};
use crate::guid::Guid;
use std::ptr::{null, null_mut};
use windows_sys::Win32::System::Registry::{
    RegCloseKey, RegCreateKeyExW, RegDeleteKeyW, RegSetValueExW, HKEY, HKEY_LOCAL_MACHINE,
    KEY_WRITE, REG_OPENED_EXISTING_KEY, REG_OPTION_NON_VOLATILE, REG_SZ,
};

const SERVICES_KEY: &str =
    r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Virtualization\GuestCommunicationServices";

fn service_key(service_id: &Guid) -> String {
    format!("{SERVICES_KEY}\\{service_id}")
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Registers `service_id` with the Hyper-V host so guests may connect to
/// it, naming it `name`. Re-registering an existing service is a no-op.
pub fn register_service(service_id: &Guid, name: &str) -> Result<()> {
    let path = wide(&service_key(service_id));
    let mut key: HKEY = null_mut();
    let mut disposition = 0u32;
    let rc = unsafe {
        RegCreateKeyExW(
            HKEY_LOCAL_MACHINE,
            path.as_ptr(),
            0,
            null(),
            REG_OPTION_NON_VOLATILE,
            KEY_WRITE,
            null(),
            &mut key,
            &mut disposition,
        )
    };
    if rc != 0 {
        return Err(Error::syscall_code("RegCreateKeyEx", rc));
    }

    let result = if disposition == REG_OPENED_EXISTING_KEY {
        // Already registered; leave the existing name alone.
        Ok(())
    } else {
        let value = wide(name);
        let rc = unsafe {
            RegSetValueExW(
                key,
                wide("ElementName").as_ptr(),
                0,
                REG_SZ,
                value.as_ptr().cast(),
                (value.len() * 2) as u32,
            )
        };
        if rc != 0 {
            Err(Error::syscall_code("RegSetValueEx", rc))
        } else {
            tracing::debug!(service = %service_id, name, "hvsock service registered");
            Ok(())
        }
    };
    unsafe { RegCloseKey(key) };
    result
}

/// Deletes the registration created by [`register_service`].
pub fn unregister_service(service_id: &Guid) -> Result<()> {
    let path = wide(&service_key(service_id));
    let rc = unsafe { RegDeleteKeyW(HKEY_LOCAL_MACHINE, path.as_ptr()) };
    if rc != 0 {
        return Err(Error::syscall_code("RegDeleteKey", rc));
    }
    tracing::debug!(service = %service_id, "hvsock service unregistered");
    Ok(())
}
