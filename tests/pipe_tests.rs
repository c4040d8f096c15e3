//! # Named-Pipe Transport Tests
//!
//! End-to-end tests for the pipe dialer, listener, deadlines, and the
//! message-mode half-close convention. These run against the real
//! named-pipe file system and are Windows-only.

#![cfg(windows)]

use hvlink::pipe::{dial_pipe, dial_pipe_deadline, listen_pipe, PipeListenerConfig};
use hvlink::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A pipe path unique to this process and test.
fn pipe_name(tag: &str) -> String {
    init_tracing();
    format!(r"\\.\pipe\hvlink-{}-{}", std::process::id(), tag)
}

/// Opt-in logging for debugging flaky runs: `RUST_LOG=hvlink=trace`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn message_config() -> PipeListenerConfig {
    PipeListenerConfig {
        message_mode: true,
        ..Default::default()
    }
}

async fn read_until(conn: &hvlink::PipeConnection, stop: u8) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = conn.read(&mut buf).await.expect("read failed");
        assert!(n > 0, "unexpected EOF while waiting for delimiter");
        out.extend_from_slice(&buf[..n]);
        if out.ends_with(&[stop]) {
            return out;
        }
    }
}

#[tokio::test]
async fn echo_round_trip_byte_mode() {
    let path = pipe_name("echo");
    let listener = listen_pipe(&path, PipeListenerConfig::default()).unwrap();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let line = read_until(&conn, b'\n').await;
        let mut reply = b"got ".to_vec();
        reply.extend_from_slice(&line);
        conn.write(&reply).await.unwrap();
        // Buffered pipe data survives handle close; only Disconnect
        // discards it, so no flush is needed before shutdown.
        listener.close().await.unwrap();
    });

    let client = dial_pipe(&path).await.unwrap();
    client.write(b"hello world\n").await.unwrap();
    let reply = read_until(&client, b'\n').await;
    assert_eq!(reply, b"got hello world\n");

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn dial_times_out_when_no_accept_is_pending() {
    let path = pipe_name("dial-timeout");
    let listener = listen_pipe(&path, PipeListenerConfig::default()).unwrap();

    // No accept is pending, so only the disconnected first instance
    // exists and the dial spends its whole window on ERROR_PIPE_BUSY.
    let err = dial_pipe_deadline(&path, Instant::now() + Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "want timeout-shaped error, got {err}");

    // The listener survives the timed-out dial.
    let listener = Arc::new(listener);
    let acceptor = listener.clone();
    let server = tokio::spawn(async move { acceptor.accept().await });
    let client = dial_pipe(&path).await.unwrap();
    let conn = server.await.unwrap().unwrap();
    conn.write(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(client.read(&mut buf).await.unwrap(), 2);

    client.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn close_aborts_pending_accept() {
    let path = pipe_name("close-accept");
    let listener = Arc::new(listen_pipe(&path, PipeListenerConfig::default()).unwrap());

    let acceptor = listener.clone();
    let pending = tokio::spawn(async move { acceptor.accept().await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    listener.close().await.unwrap();

    let result = pending.await.unwrap();
    assert!(
        matches!(result, Err(Error::PipeListenerClosed)),
        "want PipeListenerClosed, got {result:?}"
    );
}

#[tokio::test]
async fn accept_after_close_fails() {
    let path = pipe_name("accept-after-close");
    let listener = listen_pipe(&path, PipeListenerConfig::default()).unwrap();
    listener.close().await.unwrap();

    let result = listener.accept().await;
    assert!(matches!(result, Err(Error::PipeListenerClosed)));
}

#[tokio::test]
async fn closing_twice_is_safe() {
    let path = pipe_name("double-close");
    let listener = listen_pipe(&path, PipeListenerConfig::default()).unwrap();
    listener.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn message_mode_half_close_reads_as_eof() {
    let path = pipe_name("msg-half-close");
    let listener = listen_pipe(&path, message_config()).unwrap();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        conn.write(b"from server").await.unwrap();
        conn.close_write().await.unwrap();

        // The half-close latches: a second close_write is an error.
        let again = conn.close_write().await;
        assert!(matches!(again, Err(Error::PipeWriteClosed)));
        // As is writing.
        let write = conn.write(b"more").await;
        assert!(matches!(write, Err(Error::PipeWriteClosed)));

        // Hold the connection until the client has read everything.
        conn
    });

    let client = dial_pipe(&path).await.unwrap();
    assert!(client.message_mode());

    let mut got = Vec::new();
    let mut buf = [0u8; 32];
    loop {
        let n = client.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"from server");

    // EOF is sticky.
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);

    let server_conn = server.await.unwrap();
    server_conn.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn zero_byte_write_is_ignored_in_message_mode() {
    let path = pipe_name("msg-zero-write");
    let listener = listen_pipe(&path, message_config()).unwrap();

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        // A regular zero-byte write must NOT half-close the pipe.
        assert_eq!(conn.write(b"").await.unwrap(), 0);
        conn.write(b"payload").await.unwrap();
        conn
    });

    let client = dial_pipe(&path).await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"payload");

    server.await.unwrap().close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn read_deadline_cancels_pending_read() {
    let path = pipe_name("read-deadline");
    let listener = Arc::new(listen_pipe(&path, PipeListenerConfig::default()).unwrap());

    let acceptor = listener.clone();
    let server = tokio::spawn(async move { acceptor.accept().await.unwrap() });
    let client = dial_pipe(&path).await.unwrap();
    let server_conn = server.await.unwrap();

    client.set_read_deadline(Some(Instant::now() + Duration::from_millis(10)));
    let mut buf = [0u8; 8];
    let started = Instant::now();
    let err = client.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "want Timeout, got {err}");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "timeout took unreasonably long"
    );

    // Clearing the deadline makes the connection usable again.
    client.set_read_deadline(None);
    server_conn.write(b"late").await.unwrap();
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"late");

    client.close().await.unwrap();
    server_conn.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn past_deadline_fails_immediately() {
    let path = pipe_name("past-deadline");
    let listener = Arc::new(listen_pipe(&path, PipeListenerConfig::default()).unwrap());

    let acceptor = listener.clone();
    let server = tokio::spawn(async move { acceptor.accept().await.unwrap() });
    let client = dial_pipe(&path).await.unwrap();
    let _server_conn = server.await.unwrap();

    client.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)));
    let mut buf = [0u8; 8];
    let err = client.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));

    client.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn double_close_reports_file_closed() {
    let path = pipe_name("conn-double-close");
    let listener = Arc::new(listen_pipe(&path, PipeListenerConfig::default()).unwrap());

    let acceptor = listener.clone();
    let server = tokio::spawn(async move { acceptor.accept().await.unwrap() });
    let client = dial_pipe(&path).await.unwrap();
    let server_conn = server.await.unwrap();

    client.close().await.unwrap();
    let second = client.close().await;
    assert!(matches!(second, Err(Error::FileClosed)));

    server_conn.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn peer_close_reads_as_eof() {
    let path = pipe_name("peer-close");
    let listener = Arc::new(listen_pipe(&path, PipeListenerConfig::default()).unwrap());

    let acceptor = listener.clone();
    let server = tokio::spawn(async move { acceptor.accept().await.unwrap() });
    let client = dial_pipe(&path).await.unwrap();
    let server_conn = server.await.unwrap();

    server_conn.write(b"bye").await.unwrap();
    server_conn.close().await.unwrap();

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"bye");
    assert_eq!(client.read(&mut buf).await.unwrap(), 0, "want EOF after peer close");

    client.close().await.unwrap();
    listener.close().await.unwrap();
}

#[tokio::test]
async fn dial_unknown_pipe_fails_without_retry() {
    let path = pipe_name("no-such-pipe");
    let started = Instant::now();
    let err = dial_pipe(&path).await.unwrap_err();
    assert!(!err.is_timeout(), "missing pipe must not look like a timeout: {err}");
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "dial of a missing pipe should fail immediately"
    );
}

#[tokio::test]
async fn queue_size_listener_accepts_many_clients() {
    let path = pipe_name("queue");
    let config = PipeListenerConfig {
        queue_size: 4,
        ..Default::default()
    };
    let listener = Arc::new(listen_pipe(&path, config).unwrap());

    const CLIENTS: usize = 8;
    let acceptor = listener.clone();
    let server = tokio::spawn(async move {
        for _ in 0..CLIENTS {
            let conn = acceptor.accept().await.unwrap();
            let mut buf = [0u8; 1];
            let n = conn.read(&mut buf).await.unwrap();
            assert_eq!(n, 1);
            conn.write(&buf).await.unwrap();
            conn.close().await.unwrap();
        }
    });

    for i in 0..CLIENTS {
        let client = dial_pipe(&path).await.unwrap();
        let byte = [i as u8];
        client.write(&byte).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buf, byte);
        client.close().await.unwrap();
    }

    server.await.unwrap();
    listener.close().await.unwrap();
}
