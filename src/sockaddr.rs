//! Raw Winsock plumbing shared by socket transports.
//!
//! Wraps `bind`/`listen`/`getsockname`/`setsockopt` over encoded sockaddr
//! bytes and loads the `AcceptEx`/`ConnectEx` extension entry points, which
//! Winsock only exposes through `WSAIoctl`. Function pointers are resolved
//! once and cached for the life of the process.

use crate::error::{Error, Result};
use std::ffi::c_void;
use std::ptr::{null, null_mut};
use std::sync::{Once, OnceLock};
use windows_sys::Win32::Networking::WinSock::{
    bind as wsa_bind, getsockname, listen as wsa_listen, setsockopt, shutdown as wsa_shutdown,
    WSAGetLastError, WSAIoctl, WSASocketW, INVALID_SOCKET, SIO_GET_EXTENSION_FUNCTION_POINTER,
    SOCKADDR, SOCKET, SOL_SOCKET, WSAID_ACCEPTEX, WSAID_CONNECTEX, WSA_FLAG_OVERLAPPED,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

pub(crate) type AcceptExFn = unsafe extern "system" fn(
    SOCKET,
    SOCKET,
    *mut c_void,
    u32,
    u32,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

pub(crate) type ConnectExFn = unsafe extern "system" fn(
    SOCKET,
    *const SOCKADDR,
    i32,
    *const c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

/// Ensures Winsock is initialized. The standard library performs the
/// `WSAStartup` dance when any socket is created through it, so one
/// throwaway UDP bind makes raw Winsock calls safe here.
pub(crate) fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = std::net::UdpSocket::bind("127.0.0.1:0");
    });
}

fn wsa_err(name: &'static str) -> Error {
    Error::syscall_code(name, unsafe { WSAGetLastError() } as u32)
}

/// Creates an overlapped socket for the given family/type/protocol.
pub(crate) fn socket(family: i32, kind: i32, protocol: i32) -> Result<SOCKET> {
    init();
    let sock = unsafe {
        WSASocketW(family, kind, protocol, null(), 0, WSA_FLAG_OVERLAPPED)
    };
    if sock == INVALID_SOCKET {
        return Err(wsa_err("socket"));
    }
    Ok(sock)
}

/// Binds a socket to an encoded sockaddr.
pub(crate) fn bind(sock: SOCKET, addr: &[u8]) -> Result<()> {
    validate_sockaddr(addr.as_ptr(), addr.len())?;
    let rc = unsafe { wsa_bind(sock, addr.as_ptr() as *const SOCKADDR, addr.len() as i32) };
    if rc != 0 {
        return Err(wsa_err("bind"));
    }
    Ok(())
}

/// Starts listening with the given backlog.
pub(crate) fn listen(sock: SOCKET, backlog: i32) -> Result<()> {
    let rc = unsafe { wsa_listen(sock, backlog) };
    if rc != 0 {
        return Err(wsa_err("listen"));
    }
    Ok(())
}

/// Fetches the socket's bound address as raw sockaddr bytes.
pub(crate) fn get_sock_name(sock: SOCKET, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut out_len = buf.len() as i32;
    let rc = unsafe { getsockname(sock, buf.as_mut_ptr() as *mut SOCKADDR, &mut out_len) };
    if rc != 0 {
        return Err(wsa_err("getsockname"));
    }
    buf.truncate(out_len as usize);
    Ok(buf)
}

/// Half- or full-closes a socket at the transport level.
pub(crate) fn shutdown(sock: SOCKET, how: i32) -> Result<()> {
    let rc = unsafe { wsa_shutdown(sock, how) };
    if rc != 0 {
        return Err(wsa_err("shutdown"));
    }
    Ok(())
}

/// `setsockopt(SOL_SOCKET, ...)` with a raw value buffer.
pub(crate) fn set_sock_opt(sock: SOCKET, option: i32, value: &[u8]) -> Result<()> {
    let ptr = if value.is_empty() {
        null()
    } else {
        value.as_ptr()
    };
    let rc = unsafe { setsockopt(sock, SOL_SOCKET, option, ptr, value.len() as i32) };
    if rc != 0 {
        return Err(wsa_err("setsockopt"));
    }
    Ok(())
}

/// Validates the raw-sockaddr contract shared with kernel-filled buffers.
pub(crate) fn validate_sockaddr(ptr: *const u8, len: usize) -> Result<()> {
    if ptr.is_null() {
        return Err(Error::InvalidPointer);
    }
    if len < 1 {
        return Err(Error::BufferSize { got: len, want: 1 });
    }
    Ok(())
}

// =============================================================================
// Extension Entry Points
// =============================================================================

fn load_extension<F: Copy>(sock: SOCKET, guid: windows_sys::core::GUID) -> Result<F> {
    let mut func: Option<F> = None;
    let mut returned = 0u32;
    let rc = unsafe {
        WSAIoctl(
            sock,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            &guid as *const _ as *const c_void,
            std::mem::size_of_val(&guid) as u32,
            &mut func as *mut _ as *mut c_void,
            std::mem::size_of::<F>() as u32,
            &mut returned,
            null_mut(),
            None,
        )
    };
    if rc != 0 {
        return Err(wsa_err("WSAIoctl"));
    }
    func.ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "extension function not available",
        ))
    })
}

/// Resolves `AcceptEx`, caching the pointer process-wide.
pub(crate) fn accept_ex(sock: SOCKET) -> Result<AcceptExFn> {
    static ACCEPT_EX: OnceLock<AcceptExFn> = OnceLock::new();
    if let Some(f) = ACCEPT_EX.get() {
        return Ok(*f);
    }
    let f = load_extension::<AcceptExFn>(sock, WSAID_ACCEPTEX)?;
    Ok(*ACCEPT_EX.get_or_init(|| f))
}

/// Resolves `ConnectEx`, caching the pointer process-wide.
pub(crate) fn connect_ex(sock: SOCKET) -> Result<ConnectExFn> {
    static CONNECT_EX: OnceLock<ConnectExFn> = OnceLock::new();
    if let Some(f) = CONNECT_EX.get() {
        return Ok(*f);
    }
    let f = load_extension::<ConnectExFn>(sock, WSAID_CONNECTEX)?;
    Ok(*CONNECT_EX.get_or_init(|| f))
}
