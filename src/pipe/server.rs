//! Server-side pipe instance creation.
//!
//! Server pipes are created through `NtCreateNamedPipeFile` rather than
//! `CreateNamedPipeW` so the first instance can be opened with
//! `SYNCHRONIZE`-only access: the pipe name then exists in the named-pipe
//! file system but stays disconnected, gating client traffic until a
//! listener worker opens a real instance. The Win32 path is converted to
//! its NT form (`\??\pipe\...`) with `RtlDosPathNameToNtPathName_U`.
//!
//! The ntdll entry points are resolved at first use via `GetProcAddress`.

use crate::error::{Error, Result};
use crate::pipe::PipeListenerConfig;
use std::ffi::c_void;
use std::ptr::{null, null_mut};
use std::sync::OnceLock;
use windows_sys::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE};
use windows_sys::Win32::Security::Authorization::ConvertStringSecurityDescriptorToSecurityDescriptorW;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

// NT constants used by the create call.
const SYNCHRONIZE: u32 = 0x0010_0000;
const FILE_SHARE_READ_WRITE: u32 = 0x3;
const FILE_OPEN: u32 = 0x1;
const FILE_CREATE: u32 = 0x2;
const FILE_PIPE_MESSAGE_TYPE: u32 = 0x1;
const FILE_PIPE_REJECT_REMOTE_CLIENTS: u32 = 0x2;
const OBJ_CASE_INSENSITIVE: u32 = 0x40;
const SE_DACL_PRESENT: u16 = 0x4;
const SDDL_REVISION_1: u32 = 1;

/// Default timeout stamped into new pipe instances: 50 ms in relative
/// 100 ns ticks.
const PIPE_DEFAULT_TIMEOUT: i64 = -50 * 10_000;

#[link(name = "kernel32")]
extern "system" {
    fn LocalFree(hmem: *mut c_void) -> *mut c_void;
}

// =============================================================================
// NT Structures
// =============================================================================

#[repr(C)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: *mut u16,
}

#[repr(C)]
struct ObjectAttributes {
    length: u32,
    root_directory: usize,
    object_name: *mut UnicodeString,
    attributes: u32,
    security_descriptor: *const c_void,
    security_qos: *const c_void,
}

#[repr(C)]
struct IoStatusBlock {
    status: usize,
    information: usize,
}

/// Absolute-form SECURITY_DESCRIPTOR used to carry the default DACL.
#[repr(C)]
struct SecurityDescriptor {
    revision: u8,
    sbz1: u8,
    control: u16,
    owner: usize,
    group: usize,
    sacl: usize,
    dacl: usize,
}

// =============================================================================
// ntdll Imports
// =============================================================================

type NtCreateNamedPipeFileFn = unsafe extern "system" fn(
    handle: *mut usize,
    access: u32,
    object_attributes: *mut ObjectAttributes,
    io_status: *mut IoStatusBlock,
    share: u32,
    disposition: u32,
    options: u32,
    pipe_type: u32,
    read_mode: u32,
    completion_mode: u32,
    max_instances: u32,
    inbound_quota: u32,
    outbound_quota: u32,
    default_timeout: *const i64,
) -> i32;

type RtlNtStatusToDosErrorNoTebFn = unsafe extern "system" fn(status: i32) -> u32;

type RtlDosPathNameToNtPathNameFn = unsafe extern "system" fn(
    dos_name: *const u16,
    nt_name: *mut UnicodeString,
    file_part: usize,
    reserved: usize,
) -> u8;

type RtlDefaultNpAclFn = unsafe extern "system" fn(dacl: *mut *mut c_void) -> i32;

type RtlFreeUnicodeStringFn = unsafe extern "system" fn(s: *mut UnicodeString);

struct Ntdll {
    nt_create_named_pipe_file: NtCreateNamedPipeFileFn,
    rtl_nt_status_to_dos_error: RtlNtStatusToDosErrorNoTebFn,
    rtl_dos_path_to_nt_path: RtlDosPathNameToNtPathNameFn,
    rtl_default_np_acl: RtlDefaultNpAclFn,
    rtl_free_unicode_string: RtlFreeUnicodeStringFn,
}

fn ntdll() -> Result<&'static Ntdll> {
    static NTDLL: OnceLock<Option<Ntdll>> = OnceLock::new();
    NTDLL
        .get_or_init(|| unsafe {
            let module = GetModuleHandleW(wide("ntdll.dll").as_ptr());
            if module.is_null() {
                return None;
            }
            macro_rules! import {
                ($name:literal) => {{
                    let f = GetProcAddress(module, concat!($name, "\0").as_ptr())?;
                    std::mem::transmute(f)
                }};
            }
            Some(Ntdll {
                nt_create_named_pipe_file: import!("NtCreateNamedPipeFile"),
                rtl_nt_status_to_dos_error: import!("RtlNtStatusToDosErrorNoTeb"),
                rtl_dos_path_to_nt_path: import!("RtlDosPathNameToNtPathName_U"),
                rtl_default_np_acl: import!("RtlDefaultNpAcl"),
                rtl_free_unicode_string: import!("RtlFreeUnicodeString"),
            })
        })
        .as_ref()
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "required ntdll entry points unavailable",
            ))
        })
}

/// NUL-terminated UTF-16.
pub(crate) fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn nt_status_err(ntdll: &Ntdll, name: &'static str, status: i32) -> Error {
    let code = unsafe { (ntdll.rtl_nt_status_to_dos_error)(status) };
    Error::syscall_code(name, code)
}

// =============================================================================
// Security Descriptors
// =============================================================================

/// A `LocalAlloc`-backed allocation returned by a Win32 API.
struct LocalBuffer(*mut c_void);

impl Drop for LocalBuffer {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { LocalFree(self.0) };
        }
    }
}

/// Converts caller-provided SDDL into a self-relative security descriptor.
fn sddl_to_descriptor(sddl: &str) -> Result<LocalBuffer> {
    let text = wide(sddl);
    let mut descriptor: *mut c_void = null_mut();
    let mut size = 0u32;
    let ok = unsafe {
        ConvertStringSecurityDescriptorToSecurityDescriptorW(
            text.as_ptr(),
            SDDL_REVISION_1,
            &mut descriptor,
            &mut size,
        )
    };
    if ok == 0 {
        return Err(Error::syscall(
            "ConvertStringSecurityDescriptorToSecurityDescriptor",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(LocalBuffer(descriptor))
}

// =============================================================================
// Pipe Instance Creation
// =============================================================================

/// Creates one server pipe instance at `path`.
///
/// The first instance reserves the name (`FILE_CREATE`) with
/// `SYNCHRONIZE`-only access and carries the pipe's security descriptor;
/// later instances open the existing name (`FILE_OPEN`) with full access.
/// Returns the raw handle.
pub(crate) fn make_server_pipe_handle(
    path: &str,
    config: &PipeListenerConfig,
    first: bool,
) -> Result<usize> {
    let ntdll = ntdll()?;

    let dos_path = wide(path);
    let mut nt_path = UnicodeString {
        length: 0,
        maximum_length: 0,
        buffer: null_mut(),
    };
    let ok = unsafe { (ntdll.rtl_dos_path_to_nt_path)(dos_path.as_ptr(), &mut nt_path, 0, 0) };
    if ok == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot convert {path} to an NT path"),
        )));
    }

    let result = create_with_nt_path(ntdll, &mut nt_path, config, first);
    unsafe { (ntdll.rtl_free_unicode_string)(&mut nt_path) };
    result
}

fn create_with_nt_path(
    ntdll: &Ntdll,
    nt_path: &mut UnicodeString,
    config: &PipeListenerConfig,
    first: bool,
) -> Result<usize> {
    let mut attributes = ObjectAttributes {
        length: std::mem::size_of::<ObjectAttributes>() as u32,
        root_directory: 0,
        object_name: nt_path,
        attributes: OBJ_CASE_INSENSITIVE,
        security_descriptor: null(),
        security_qos: null(),
    };

    // The security descriptor is only needed for the first instance; the
    // rest inherit through the pipe name.
    let mut _sddl_buffer = None;
    let mut _default_dacl = None;
    let mut default_descriptor;
    if first {
        if let Some(sddl) = config.security_descriptor.as_deref() {
            let descriptor = sddl_to_descriptor(sddl)?;
            attributes.security_descriptor = descriptor.0;
            _sddl_buffer = Some(descriptor);
        } else {
            let mut dacl: *mut c_void = null_mut();
            let status = unsafe { (ntdll.rtl_default_np_acl)(&mut dacl) };
            if status < 0 {
                return Err(nt_status_err(ntdll, "RtlDefaultNpAcl", status));
            }
            _default_dacl = Some(LocalBuffer(dacl));
            default_descriptor = SecurityDescriptor {
                revision: 1,
                sbz1: 0,
                control: SE_DACL_PRESENT,
                owner: 0,
                group: 0,
                sacl: 0,
                dacl: dacl as usize,
            };
            attributes.security_descriptor = &mut default_descriptor as *mut _ as *const c_void;
        }
    }

    let mut pipe_type = FILE_PIPE_REJECT_REMOTE_CLIENTS;
    if config.message_mode {
        pipe_type |= FILE_PIPE_MESSAGE_TYPE;
    }

    let (disposition, access) = if first {
        // No read or write access: the named-pipe file system leaves this
        // instance disconnected, blocking clients until a worker opens a
        // connectable instance.
        (FILE_CREATE, SYNCHRONIZE)
    } else {
        (FILE_OPEN, GENERIC_READ | GENERIC_WRITE | SYNCHRONIZE)
    };

    let timeout = PIPE_DEFAULT_TIMEOUT;
    let mut handle = 0usize;
    let mut io_status = IoStatusBlock {
        status: 0,
        information: 0,
    };
    let status = unsafe {
        (ntdll.nt_create_named_pipe_file)(
            &mut handle,
            access,
            &mut attributes,
            &mut io_status,
            FILE_SHARE_READ_WRITE,
            disposition,
            0,
            pipe_type,
            0,
            0,
            u32::MAX,
            config.input_buffer_size,
            config.output_buffer_size,
            &timeout,
        )
    };
    if status < 0 {
        return Err(nt_status_err(ntdll, "NtCreateNamedPipeFile", status));
    }
    Ok(handle)
}
