
use std::time::Duration;

use harness::{
    client_hello, read_to_close, tls_client_connect, EchoOnceBackend, ForwarderHandle,
    RecordingBackend, TlsBackend,
};
use sni_forward::SniffConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn client_hello_forwarded_before_relay() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let forwarder = ForwarderHandle::spawn(backend.addr.port(), |r| {
        r.allowed_suffixes = Some(vec!["localhost".into()]);
    })
    .await
    .unwrap();

    let hello = client_hello("LocalHost.");
    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(forwarder.listen_addr).await?;
        stream.write_all(&hello).await?;
        stream.write_all(b"ping").await?;
        stream.flush().await?;

        let mut buf = vec![0u8; hello.len() + 4];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await;

    match result {
        Ok(Ok(echoed)) => {
            assert_eq!(&echoed[..hello.len()], &hello[..]);
            assert_eq!(&echoed[hello.len()..], b"ping");
        }
        Ok(Err(e)) => panic!("Relay failed: {}", e),
        Err(_) => panic!("Relay timed out"),
    }

    let received = backend.received();
    assert!(received.starts_with(&hello), "upstream must see the ClientHello first");
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(forwarder.stat(|s| &s.sessions_relayed), 1);
}

#[tokio::test]
async fn tls_handshake_passes_through_untouched() {
    let backend = TlsBackend::spawn("localhost", "tls-ok").await.unwrap();
    let forwarder = ForwarderHandle::spawn(backend.addr.port(), |r| {
        r.allowed_suffixes = Some(vec!["localhost".into()]);
        r.reject_if_no_valid_sni = true;
    })
    .await
    .unwrap();

    let result = timeout(TEST_TIMEOUT, async {
        let mut tls = tls_client_connect(forwarder.listen_addr, "localhost", &backend.cert_der).await?;
        tls.write_all(b"hello").await?;
        tls.flush().await?;

        let mut buf = vec![0u8; 64];
        let n = tls.read(&mut buf).await?;
        Ok::<_, std::io::Error>(buf[..n].to_vec())
    })
    .await;

    match result {
        Ok(Ok(data)) => assert_eq!(data, backend.marker.as_bytes()),
        Ok(Err(e)) => panic!("TLS through forwarder failed: {}", e),
        Err(_) => panic!("TLS through forwarder timed out"),
    }
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn disallowed_sni_dropped_when_rejecting() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let forwarder = ForwarderHandle::spawn(backend.addr.port(), |r| {
        r.allowed_suffixes = Some(vec!["example.test".into()]);
        r.default_upstream_host = Some("127.0.0.1".into());
        r.reject_if_no_valid_sni = true;
    })
    .await
    .unwrap();

    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(forwarder.listen_addr).await?;
        stream.write_all(&client_hello("localhost")).await?;
        read_to_close(&mut stream).await
    })
    .await;

    match result {
        Ok(Ok(None)) => {}
        Ok(Ok(Some(data))) => panic!("Expected close, got {} bytes", data.len()),
        Ok(Err(e)) => panic!("Unexpected error: {}", e),
        Err(_) => panic!("Connection was not closed"),
    }

    assert_eq!(backend.connection_count(), 0);
    assert_eq!(forwarder.stat(|s| &s.connections_dropped), 1);
}

#[tokio::test]
async fn disallowed_sni_falls_back_to_default_host() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let forwarder = ForwarderHandle::spawn(backend.addr.port(), |r| {
        r.allowed_suffixes = Some(vec!["example.test".into()]);
        r.default_upstream_host = Some("127.0.0.1".into());
    })
    .await
    .unwrap();

    let hello = client_hello("localhost");
    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(forwarder.listen_addr).await?;
        stream.write_all(&hello).await?;
        let mut buf = vec![0u8; hello.len()];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await;

    match result {
        Ok(Ok(echoed)) => assert_eq!(echoed, hello),
        Ok(Err(e)) => panic!("Fallback relay failed: {}", e),
        Err(_) => panic!("Fallback relay timed out"),
    }
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn plain_bytes_without_sni_use_default_host() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let forwarder = ForwarderHandle::spawn(backend.addr.port(), |r| {
        r.allowed_suffixes = Some(vec!["example.test".into()]);
        r.default_upstream_host = Some("127.0.0.1".into());
        r.reject_if_no_valid_sni = true;
    })
    .await
    .unwrap();

    let payload = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(forwarder.listen_addr).await?;
        stream.write_all(payload).await?;
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await;

    match result {
        Ok(Ok(echoed)) => assert_eq!(&echoed[..], &payload[..]),
        Ok(Err(e)) => panic!("Plain relay failed: {}", e),
        Err(_) => panic!("Plain relay timed out"),
    }
    assert_eq!(backend.received(), payload.to_vec());
}

#[tokio::test]
async fn sniff_timeout_keeps_partial_bytes() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let sniff = SniffConfig {
        timeout: Duration::from_millis(200),
        ..SniffConfig::default()
    };
    let forwarder = ForwarderHandle::spawn_with_sniff(backend.addr.port(), sniff, |r| {
        r.default_upstream_host = Some("127.0.0.1".into());
    })
    .await
    .unwrap();

    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(forwarder.listen_addr).await?;
        stream.write_all(b"abc").await?;
        tokio::time::sleep(Duration::from_millis(400)).await;
        stream.write_all(b"def").await?;

        let mut buf = vec![0u8; 6];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await;

    match result {
        Ok(Ok(echoed)) => assert_eq!(echoed, b"abcdef"),
        Ok(Err(e)) => panic!("Relay after sniff timeout failed: {}", e),
        Err(_) => panic!("Relay after sniff timeout timed out"),
    }
    assert_eq!(forwarder.stat(|s| &s.sniff_failed), 1);
}

#[tokio::test]
async fn unreachable_upstream_closes_client() {
    let temp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = temp_listener.local_addr().unwrap().port();
    drop(temp_listener);

    let forwarder = ForwarderHandle::spawn(dead_port, |r| {
        r.allowed_suffixes = Some(vec!["localhost".into()]);
    })
    .await
    .unwrap();

    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(forwarder.listen_addr).await?;
        stream.write_all(&client_hello("localhost")).await?;
        read_to_close(&mut stream).await
    })
    .await;

    match result {
        Ok(Ok(None)) => {}
        Ok(Ok(Some(data))) => panic!("Expected close, got {} bytes", data.len()),
        Ok(Err(e)) => panic!("Unexpected error: {}", e),
        Err(_) => panic!("Connection was not closed"),
    }
    assert_eq!(forwarder.stat(|s| &s.upstream_failed), 1);
}

#[tokio::test]
async fn stop_closes_inflight_sessions() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let mut forwarder = ForwarderHandle::spawn(backend.addr.port(), |r| {
        r.allowed_suffixes = Some(vec!["localhost".into()]);
    })
    .await
    .unwrap();

    let hello = client_hello("localhost");
    let mut stream = TcpStream::connect(forwarder.listen_addr).await.unwrap();
    stream.write_all(&hello).await.unwrap();
    let mut buf = vec![0u8; hello.len()];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("relay should be established")
        .unwrap();

    timeout(TEST_TIMEOUT, forwarder.stop())
        .await
        .expect("stop should wait for sessions and return");

    let closed = timeout(TEST_TIMEOUT, read_to_close(&mut stream))
        .await
        .expect("client should see the session close");
    assert!(matches!(closed, Ok(None)));

    assert!(TcpStream::connect(forwarder.listen_addr).await.is_err());
}

#[tokio::test]
async fn bad_client_does_not_stop_listener() {
    let backend = RecordingBackend::spawn().await.unwrap();
    let forwarder = ForwarderHandle::spawn(backend.addr.port(), |r| {
        r.allowed_suffixes = Some(vec!["localhost".into()]);
    })
    .await
    .unwrap();

    // Truncated record header, then close.
    let mut bad = TcpStream::connect(forwarder.listen_addr).await.unwrap();
    bad.write_all(&[0x16, 0x03]).await.unwrap();
    drop(bad);

    let hello = client_hello("localhost");
    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(forwarder.listen_addr).await?;
        stream.write_all(&hello).await?;
        let mut buf = vec![0u8; hello.len()];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await;

    match result {
        Ok(Ok(echoed)) => assert_eq!(echoed, hello),
        Ok(Err(e)) => panic!("Second client failed: {}", e),
        Err(_) => panic!("Second client timed out"),
    }
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn upstream_close_ends_session() {
    let hello = client_hello("localhost");
    let backend = EchoOnceBackend::spawn(hello.len()).await.unwrap();
    let forwarder = ForwarderHandle::spawn(backend.addr.port(), |r| {
        r.allowed_suffixes = Some(vec!["localhost".into()]);
    })
    .await
    .unwrap();

    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(forwarder.listen_addr).await?;
        stream.write_all(&hello).await?;
        read_to_close(&mut stream).await
    })
    .await;

    match result {
        Ok(Ok(Some(echoed))) => assert_eq!(echoed, hello),
        Ok(Ok(None)) => panic!("Session closed before the echo arrived"),
        Ok(Err(e)) => panic!("Unexpected error: {}", e),
        Err(_) => panic!("Upstream close did not end the session"),
    }

    // The session task updates counters just after the client sees EOF.
    timeout(TEST_TIMEOUT, async {
        while forwarder.stat(|s| &s.connections_active) != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session should be reaped");

    assert_eq!(forwarder.stat(|s| &s.connections_closed), 1);
    assert_eq!(forwarder.stat(|s| &s.sessions_relayed), 1);
    assert_eq!(backend.connection_count(), 1);
}
