//! # Hyper-V Socket Transport Tests
//!
//! Exercises the hvsock listener/dialer pair over the loopback VM ID.
//! Loopback hvsock requires a Hyper-V-enabled host; tests skip gracefully
//! when the listener cannot bind.

#![cfg(windows)]

use hvlink::hvsock::VMID_LOOPBACK;
use hvlink::{listen_hvsock, vsock_service_id, Error, HvsockAddr, HvsockDialer, HvsockListener};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A loopback address with a port unique to this process and call.
fn loopback_addr() -> HvsockAddr {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let salt = NEXT.fetch_add(1, Ordering::Relaxed);
    let port = std::process::id().wrapping_mul(0x9e37).wrapping_add(salt) | 0x4000_0000;
    HvsockAddr::new(VMID_LOOPBACK, vsock_service_id(port))
}

/// Binds a loopback listener or skips the test on hosts without hvsock
/// loopback support.
fn listener_or_skip(addr: &HvsockAddr) -> Option<HvsockListener> {
    match listen_hvsock(addr) {
        Ok(listener) => Some(listener),
        Err(err) => {
            eprintln!("skipping: hvsock loopback unavailable here: {err}");
            None
        }
    }
}

async fn expect_read(conn: &hvlink::HvsockConnection, want: &[u8]) {
    let mut got = vec![0u8; want.len()];
    let mut filled = 0;
    while filled < want.len() {
        let n = conn.read(&mut got[filled..]).await.expect("read failed");
        assert!(n > 0, "unexpected EOF at {filled}/{} bytes", want.len());
        filled += n;
    }
    assert_eq!(got, want);
}

#[tokio::test]
async fn loopback_round_trip_with_half_close() {
    let addr = loopback_addr();
    let Some(listener) = listener_or_skip(&addr) else {
        return;
    };

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        expect_read(&conn, b"hello ").await;
        conn.write(b"world!").await.unwrap();
        expect_read(&conn, b"ping").await;
        conn.write(b"pong").await.unwrap();

        // After the client's half-close we observe EOF, not an error.
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

        listener.close().await.unwrap();
        conn
    });

    let dialer = HvsockDialer::new().with_deadline(Instant::now() + Duration::from_secs(5));
    let client = dialer.dial(&addr).await.unwrap();
    assert_eq!(client.remote_addr(), addr);

    client.write(b"hello ").await.unwrap();
    expect_read(&client, b"world!").await;
    client.write(b"ping").await.unwrap();
    expect_read(&client, b"pong").await;

    client.close_write().unwrap();
    // close_write is idempotent at the socket level.
    client.close_write().unwrap();

    let server_conn = server.await.unwrap();
    server_conn.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn accepted_connection_reports_listener_address_as_local() {
    let addr = loopback_addr();
    let Some(listener) = listener_or_skip(&addr) else {
        return;
    };

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let local = conn.local_addr();
        (listener, conn, local)
    });

    let client = HvsockDialer::new()
        .with_deadline(Instant::now() + Duration::from_secs(5))
        .dial(&addr)
        .await
        .unwrap();

    let (listener, server_conn, local) = server.await.unwrap();
    // The accepted socket's local address is the listener's bound address
    // by design; getsockname output varies across OS builds there.
    assert_eq!(local, addr);
    assert_eq!(listener.addr(), addr);

    server_conn.close().await.unwrap();
    client.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn close_fails_pending_accept_with_file_closed() {
    let addr = loopback_addr();
    let Some(listener) = listener_or_skip(&addr) else {
        return;
    };
    let listener = Arc::new(listener);

    let acceptor = listener.clone();
    let pending = tokio::spawn(async move { acceptor.accept().await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    listener.close().await.unwrap();

    let result = pending.await.unwrap();
    match result {
        Err(err) if err.is_closed() => {}
        other => panic!("want FileClosed-shaped error, got {other:?}"),
    }
    assert!(
        !matches!(result, Err(Error::Timeout)),
        "a closed listener must not report Timeout"
    );
}

#[tokio::test]
async fn read_deadline_fires_on_idle_connection() {
    let addr = loopback_addr();
    let Some(listener) = listener_or_skip(&addr) else {
        return;
    };

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        (listener, conn)
    });

    let client = HvsockDialer::new()
        .with_deadline(Instant::now() + Duration::from_secs(5))
        .dial(&addr)
        .await
        .unwrap();
    let (listener, server_conn) = server.await.unwrap();

    client.set_read_deadline(Some(Instant::now() + Duration::from_millis(10)));
    let mut buf = [0u8; 4];
    let err = client.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "want Timeout, got {err}");

    // Deadline cleared, traffic flows again.
    client.set_read_deadline(None);
    server_conn.write(b"late").await.unwrap();
    expect_read(&client, b"late").await;

    client.close().await.unwrap();
    server_conn.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn half_close_after_close_reports_file_closed() {
    let addr = loopback_addr();
    let Some(listener) = listener_or_skip(&addr) else {
        return;
    };

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        (listener, conn)
    });

    let client = HvsockDialer::new()
        .with_deadline(Instant::now() + Duration::from_secs(5))
        .dial(&addr)
        .await
        .unwrap();
    let (listener, server_conn) = server.await.unwrap();

    client.close().await.unwrap();
    assert!(matches!(client.close_read(), Err(Error::FileClosed)));
    assert!(matches!(client.close_write(), Err(Error::FileClosed)));
    assert!(matches!(client.close().await, Err(Error::FileClosed)));

    server_conn.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn dial_with_retries_gives_up_on_refused() {
    // Nothing listens on this address; the dialer must fail without
    // classifying the refusal as a timeout.
    let addr = loopback_addr();
    let dialer = HvsockDialer::new()
        .with_retries(1)
        .with_retry_wait(Duration::from_millis(5));
    let started = Instant::now();
    let err = dialer.dial(&addr).await.unwrap_err();
    assert!(!matches!(err, Error::Timeout), "refusal is not a timeout: {err}");
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "dial with one retry took too long"
    );
}
