//! Queue-based multi-worker pipe listener.
//!
//! The listener holds no per-worker handles. Accept callers enqueue a
//! one-shot response channel on a bounded queue; a pool of `queue_size`
//! workers services the queue, each creating one unbound server pipe
//! instance and waiting for a client through the engine. Lifecycle is two
//! broadcast signals: `shutdown_started` aborts the workers, and
//! `shutdown_finished` fires after the dispatcher has joined them and
//! closed the first-instance handle.

use super::server::make_server_pipe_handle;
use super::{connect_pipe, PipeConnection, PipeListenerConfig};
use crate::engine::OverlappedFile;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use windows_sys::Win32::Foundation::{CloseHandle, ERROR_NO_DATA};

type AcceptResponse = Result<OverlappedFile>;
type ResponseSender = oneshot::Sender<AcceptResponse>;

struct Shared {
    path: String,
    config: PipeListenerConfig,
    accept_tx: mpsc::Sender<ResponseSender>,
    shutdown_started: watch::Sender<bool>,
    shutdown_finished: watch::Sender<bool>,
    close_lock: Mutex<()>,
}

/// A listener for a named-pipe path.
pub struct PipeListener {
    shared: Arc<Shared>,
}

/// Creates a listener on `path` (e.g. `\\.\pipe\name`). The pipe must not
/// already exist.
///
/// The first pipe instance is created immediately with no read/write
/// access, so the name resolves but clients block until a worker is ready.
/// The worker pool runs on the ambient Tokio runtime, so this must be
/// called from within one.
pub fn listen_pipe(path: &str, config: PipeListenerConfig) -> Result<PipeListener> {
    let mut config = config;
    if config.queue_size < 1 {
        // Legacy callers leave this zero: one unbound instance at a time.
        config.queue_size = 1;
    }
    let queue_size = config.queue_size as usize;

    let first_handle =
        make_server_pipe_handle(path, &config, true).map_err(|e| e.wrap("listen", path))?;

    let (accept_tx, accept_rx) = mpsc::channel::<ResponseSender>(queue_size);
    let (shutdown_started, _) = watch::channel(false);
    let (shutdown_finished, _) = watch::channel(false);

    let shared = Arc::new(Shared {
        path: path.to_string(),
        config,
        accept_tx,
        shutdown_started,
        shutdown_finished,
        close_lock: Mutex::new(()),
    });

    let accept_rx = Arc::new(Mutex::new(accept_rx));
    let mut workers = Vec::with_capacity(queue_size);
    for worker in 0..queue_size {
        let shared = shared.clone();
        let accept_rx = accept_rx.clone();
        workers.push(tokio::spawn(listener_worker(worker, shared, accept_rx)));
    }
    tokio::spawn(listener_dispatcher(shared.clone(), workers, first_handle));

    tracing::debug!(path, queue_size, "pipe listener started");
    Ok(PipeListener { shared })
}

/// Joins the worker pool, then closes the reserving handle and signals
/// that shutdown is complete.
async fn listener_dispatcher(
    shared: Arc<Shared>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    first_handle: usize,
) {
    for worker in workers {
        let _ = worker.await;
    }
    // All workers have exited, which implies shutdown_started was
    // signalled. Release the name and wake Close()/accept() waiters.
    unsafe { CloseHandle(first_handle as _) };
    let _ = shared.shutdown_finished.send(true);
    tracing::debug!(path = %shared.path, "pipe listener shut down");
}

/// One worker: pop a response channel, stand up a pipe instance, wait for
/// a client, respond.
async fn listener_worker(
    worker: usize,
    shared: Arc<Shared>,
    accept_rx: Arc<Mutex<mpsc::Receiver<ResponseSender>>>,
) {
    let mut started = shared.shutdown_started.subscribe();
    loop {
        let response_tx = tokio::select! {
            () = wait_signal(&mut started) => break,
            request = async { accept_rx.lock().await.recv().await } => match request {
                Some(tx) => tx,
                None => break,
            },
        };
        let response = serve_one(&shared, &mut started).await;
        let _ = response_tx.send(response);
    }
    tracing::trace!(worker, "listener worker stopped");
}

/// Creates an unbound server pipe and waits for a client, aborting if
/// shutdown starts mid-wait.
async fn serve_one(shared: &Shared, started: &mut watch::Receiver<bool>) -> AcceptResponse {
    let handle = make_server_pipe_handle(&shared.path, &shared.config, false)
        .map_err(|e| e.wrap("accept", &shared.path))?;
    let file = match OverlappedFile::wrap(handle) {
        Ok(file) => file,
        Err(err) => {
            unsafe { CloseHandle(handle as _) };
            return Err(err.wrap("accept", &shared.path));
        }
    };

    tokio::select! {
        result = connect_pipe(&file) => match result {
            Ok(()) => Ok(file),
            Err(err) => {
                let _ = file.close().await;
                Err(err)
            }
        },
        () = wait_signal(started) => {
            // Close the instance to abort the kernel wait, collecting the
            // cancelled operation before reporting shutdown.
            let _ = file.close().await;
            Err(Error::PipeListenerClosed)
        }
    }
}

/// Resolves once the watch value becomes true (or its sender is gone).
async fn wait_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl PipeListener {
    /// The listener's pipe path.
    #[must_use]
    pub fn addr(&self) -> String {
        self.shared.path.clone()
    }

    /// Waits for the next client connection.
    ///
    /// Clients that connect and hang up before the handshake completes are
    /// retried silently rather than surfaced as dead connections.
    pub async fn accept(&self) -> Result<PipeConnection> {
        let mut started = self.shared.shutdown_started.subscribe();
        let mut finished = self.shared.shutdown_finished.subscribe();
        loop {
            let (response_tx, response_rx) = oneshot::channel();

            tokio::select! {
                permit = self.shared.accept_tx.reserve() => match permit {
                    Ok(permit) => permit.send(response_tx),
                    Err(_) => return Err(Error::PipeListenerClosed),
                },
                () = wait_signal(&mut finished) => return Err(Error::PipeListenerClosed),
                // A shutdown in progress: don't bother scheduling.
                () = wait_signal(&mut started) => return Err(Error::PipeListenerClosed),
            }

            // Request queued. Wait only on the response and final shutdown;
            // shutdown_started must not preempt this select because the
            // worker holding our channel reports through it.
            let response = tokio::select! {
                response = response_rx => response,
                () = wait_signal(&mut finished) => return Err(Error::PipeListenerClosed),
            };

            match response {
                // Worker dropped the channel during shutdown.
                Err(_) => return Err(Error::PipeListenerClosed),
                Ok(Err(err)) if matches!(err, Error::PipeListenerClosed) => {
                    return Err(Error::PipeListenerClosed)
                }
                Ok(Err(err)) if err.raw_os_error() == Some(ERROR_NO_DATA as i32) => {
                    // Client connected and immediately hung up; retry.
                    tracing::trace!(path = %self.shared.path, "client vanished before accept");
                    continue;
                }
                Ok(Err(err)) => return Err(err),
                Ok(Ok(file)) => {
                    return Ok(PipeConnection::new(
                        file,
                        self.shared.path.clone(),
                        self.shared.config.message_mode,
                    ))
                }
            }
        }
    }

    /// Shuts the listener down: stops the workers, closes the reserving
    /// handle, and fails pending `accept` calls with
    /// [`Error::PipeListenerClosed`]. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.shared.close_lock.lock().await;
        let already_finished = *self.shared.shutdown_finished.subscribe().borrow();
        if already_finished {
            return Ok(());
        }
        let _ = self.shared.shutdown_started.send(true);
        let mut finished = self.shared.shutdown_finished.subscribe();
        wait_signal(&mut finished).await;
        Ok(())
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        // Dropping without close(): begin shutdown so the worker pool and
        // the reserving handle are released in the background.
        let _ = self.shared.shutdown_started.send(true);
    }
}
