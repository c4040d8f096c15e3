//! Process-wide completion port and dispatcher.
//!
//! Every handle the engine wraps is bound to one I/O completion port. A
//! dedicated OS thread sits in `GetQueuedCompletionStatus` and routes each
//! packet to the operation that submitted it, keyed by the `OVERLAPPED`
//! pointer the kernel echoes back. The routing map is populated at submit
//! time and consumed exactly once per packet.
//!
//! The map also underwrites the memory-safety contract: if an operation's
//! future is dropped before its packet arrives, the heap block the kernel
//! may still write into (`OVERLAPPED` + staging buffer) is parked in the
//! map ("orphaned") and freed only when the packet is delivered.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ptr::null_mut;
use std::sync::{Mutex, OnceLock};
use tokio::sync::oneshot;
use windows_sys::Win32::Foundation::{GetLastError, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

const INFINITE: u32 = 0xffff_ffff;

/// Result of one overlapped operation as posted to the port.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    /// Bytes transferred.
    pub bytes: u32,
    /// Win32 error code; zero on success.
    pub code: u32,
}

// =============================================================================
// IoPacket
// =============================================================================

/// Heap block for one overlapped operation: the `OVERLAPPED` the kernel
/// updates plus the staging buffer it reads or writes. Address-stable for
/// the whole kernel lifetime of the operation.
#[repr(C)]
pub(crate) struct IoPacket {
    overlapped: OVERLAPPED,
    buf: Vec<u8>,
}

// OVERLAPPED carries raw pointers, but the packet is plain data owned by
// exactly one party at a time (request, routing map, or kernel).
unsafe impl Send for IoPacket {}

impl IoPacket {
    pub(crate) fn new(buf: Vec<u8>) -> Box<Self> {
        Box::new(Self {
            // OVERLAPPED is plain data; zero is its documented initial state.
            overlapped: unsafe { std::mem::zeroed() },
            buf,
        })
    }

    /// Pointer passed to the kernel; also the routing key. Stable for the
    /// packet's lifetime because the packet is heap-allocated.
    pub(crate) fn overlapped_ptr(&mut self) -> *mut OVERLAPPED {
        &mut self.overlapped
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub(crate) fn into_buf(self) -> Vec<u8> {
        self.buf
    }
}

// =============================================================================
// Routing Map
// =============================================================================

enum Route {
    /// An operation is awaiting this packet.
    Waiting(oneshot::Sender<Completion>),
    /// The awaiting future was dropped; free the block on delivery.
    Orphaned(#[allow(dead_code)] Box<IoPacket>),
}

fn routes() -> std::sync::MutexGuard<'static, HashMap<usize, Route>> {
    static ROUTES: OnceLock<Mutex<HashMap<usize, Route>>> = OnceLock::new();
    // The map carries no invariant a panicking holder could break, so a
    // poisoned lock is taken over rather than propagated: routing must
    // keep working for every other operation in the process.
    ROUTES
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Registers the completion channel for an operation about to be submitted.
pub(crate) fn register(key: usize, tx: oneshot::Sender<Completion>) {
    routes().insert(key, Route::Waiting(tx));
}

/// Removes the route for an operation whose submission failed terminally;
/// no packet will arrive for it.
pub(crate) fn deregister(key: usize) {
    routes().remove(&key);
}

/// Parks an in-flight packet whose future is being dropped. Returns the
/// packet if its completion was already delivered (the kernel is done with
/// the memory and the caller may free it).
pub(crate) fn orphan(key: usize, packet: Box<IoPacket>) -> Option<Box<IoPacket>> {
    let mut routes = routes();
    if routes.contains_key(&key) {
        routes.insert(key, Route::Orphaned(packet));
        None
    } else {
        Some(packet)
    }
}

fn deliver(key: usize, completion: Completion) {
    let mut routes = routes();
    match routes.remove(&key) {
        Some(Route::Waiting(tx)) => {
            // A failed send means the waiter got dropped while we held the
            // packet out of the map; the request frees its own block then.
            let _ = tx.send(completion);
        }
        Some(Route::Orphaned(packet)) => drop(packet),
        None => {
            tracing::warn!(key, "completion packet for unknown operation");
        }
    }
}

// =============================================================================
// Completion Port
// =============================================================================

static PORT: OnceLock<std::result::Result<usize, i32>> = OnceLock::new();

fn port() -> Result<usize> {
    let init = PORT.get_or_init(|| {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, null_mut(), 0, 1) };
        if port.is_null() {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        let port = port as usize;
        std::thread::Builder::new()
            .name("hvlink-iocp".to_string())
            .spawn(move || dispatcher(port))
            .map_err(|e| e.raw_os_error().unwrap_or(0))?;
        Ok(port)
    });
    match init {
        Ok(port) => Ok(*port),
        Err(code) => Err(Error::syscall_code("CreateIoCompletionPort", *code as u32)),
    }
}

/// Binds a handle to the process completion port so its overlapped
/// completions are routed through the dispatcher.
pub(crate) fn bind_handle(handle: usize) -> Result<()> {
    let port = port()?;
    let out = unsafe { CreateIoCompletionPort(handle as _, port as _, 0, 0) };
    if out.is_null() {
        return Err(Error::syscall(
            "CreateIoCompletionPort",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// The dispatcher loop. Owns its thread; blocks only on the port.
fn dispatcher(port: usize) {
    tracing::debug!("completion dispatcher running");
    loop {
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(port as _, &mut bytes, &mut key, &mut overlapped, INFINITE)
        };
        if overlapped.is_null() {
            // No packet: a port-level failure or a bare wakeup.
            if ok == 0 {
                let code = unsafe { GetLastError() };
                tracing::warn!(code, "completion port wait failed");
            }
            continue;
        }
        let code = if ok != 0 { 0 } else { unsafe { GetLastError() } };
        deliver(overlapped as usize, Completion { bytes, code });
    }
}
