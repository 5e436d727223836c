use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::handler::{RESPONSE_200_CONNECT, RESPONSE_403};
use crate::{ProxyConfig, ProxyServer, SharedConfig, ShutdownHandle, Stats};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const UPSTREAM_REPLY: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/html\r\n\
Content-Length: 33\r\n\
Connection: close\r\n\
\r\n\
<html><body>Test OK</body></html>";

// -- Test helpers --

fn test_config() -> ProxyConfig {
    ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        timeout: 5,
        idle_ticks: 40,
        tick_interval_ms: 50,
        ..ProxyConfig::default()
    }
}

async fn spawn_proxy(config: ProxyConfig) -> (SocketAddr, Arc<Stats>, JoinHandle<()>) {
    let stats = Arc::new(Stats::new());
    let server = ProxyServer::bind(SharedConfig::new(config), stats.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let task = tokio::spawn(server.serve());
    (addr, stats, task)
}

async fn spawn_proxy_with_shutdown(
    config: ProxyConfig,
) -> (SocketAddr, ShutdownHandle, JoinHandle<()>) {
    let server = ProxyServer::bind(SharedConfig::new(config), Arc::new(Stats::new()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let task = tokio::spawn(server.serve());
    (addr, handle, task)
}

async fn bind_upstream() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Reads until the end of an HTTP header block.
async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "peer closed before end of headers");
        head.extend_from_slice(&buf[..n]);
    }
    head
}

async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut out))
        .await
        .expect("connection was not closed")
        .unwrap();
    out
}

// -- End-to-end scenarios --

#[tokio::test]
async fn test_http_request_is_replayed_verbatim() {
    let (proxy_addr, stats, _proxy) = spawn_proxy(test_config()).await;
    let (upstream, port) = bind_upstream().await;

    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        stream.write_all(UPSTREAM_REPLY).await.unwrap();
        head
    });

    let request = format!(
        "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"
    );
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();

    let reply = read_all(&mut client).await;
    assert_eq!(reply, UPSTREAM_REPLY);

    let forwarded = upstream_task.await.unwrap();
    assert_eq!(forwarded, request.as_bytes());

    let s = stats.snapshot();
    assert_eq!(s.bytes_in, UPSTREAM_REPLY.len() as u64);
    assert_eq!(s.blocked, 0);
}

#[tokio::test]
async fn test_connect_tunnel() {
    let (proxy_addr, _stats, _proxy) = spawn_proxy(test_config()).await;
    let (upstream, port) = bind_upstream().await;

    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        // server speaks first, so ordering against the 200 is observable
        stream.write_all(b"hello").await.unwrap();

        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).await.unwrap();
        stream.write_all(b"pong").await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        (ping, rest)
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut established = vec![0u8; RESPONSE_200_CONNECT.len() + 5];
    timeout(TEST_TIMEOUT, client.read_exact(&mut established))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&established[..RESPONSE_200_CONNECT.len()], RESPONSE_200_CONNECT);
    assert_eq!(&established[RESPONSE_200_CONNECT.len()..], b"hello");

    client.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    timeout(TEST_TIMEOUT, client.read_exact(&mut pong))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&pong, b"pong");

    drop(client);

    let (ping, rest) = timeout(TEST_TIMEOUT, upstream_task).await.unwrap().unwrap();
    // the CONNECT envelope never reaches the upstream
    assert_eq!(&ping, b"ping");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_connect_tunnel_large_payload() {
    let mut config = test_config();
    config.buffer_size = 1024;
    let (proxy_addr, stats, _proxy) = spawn_proxy(config).await;
    let (upstream, port) = bind_upstream().await;

    tokio::spawn(async move {
        let (stream, _) = upstream.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let client = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut reader, mut writer) = client.into_split();
    writer
        .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut established = vec![0u8; RESPONSE_200_CONNECT.len()];
    reader.read_exact(&mut established).await.unwrap();
    assert_eq!(established, RESPONSE_200_CONNECT);

    let payload: Vec<u8> = (0..48_000u32).map(|i| (i % 241) as u8).collect();
    let expected = payload.clone();

    let write_task = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut echoed = vec![0u8; expected.len()];
    timeout(TEST_TIMEOUT, reader.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, expected);

    let writer = write_task.await.unwrap();
    drop(writer);
    drop(reader);

    // closing the client ends the session and accounts its bytes
    timeout(TEST_TIMEOUT, async {
        let total = expected.len() as u64;
        while stats.snapshot().bytes_out < total || stats.snapshot().bytes_in < total {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_blocked_host_never_dialed() {
    let mut config = test_config();
    config.domains.blocked_domains = vec!["127.0.0".to_string()];
    let (proxy_addr, stats, _proxy) = spawn_proxy(config).await;
    let (upstream, port) = bind_upstream().await;

    for request in [
        format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n"),
        format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n"),
    ] {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();
        assert_eq!(read_all(&mut client).await, RESPONSE_403);
    }

    assert!(timeout(Duration::from_millis(200), upstream.accept())
        .await
        .is_err());
    assert_eq!(stats.snapshot().blocked, 2);
}

#[tokio::test]
async fn test_direct_domain_is_still_dialed() {
    let mut config = test_config();
    config.domains.direct_domains = vec!["127.0.0.1".to_string()];
    let (proxy_addr, stats, _proxy) = spawn_proxy(config).await;
    let (upstream, port) = bind_upstream().await;

    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        read_head(&mut stream).await;
        stream.write_all(UPSTREAM_REPLY).await.unwrap();
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    assert_eq!(read_all(&mut client).await, UPSTREAM_REPLY);
    assert_eq!(stats.snapshot().direct, 1);
}

#[tokio::test]
async fn test_missing_host_closes_silently() {
    let (proxy_addr, _stats, _proxy) = spawn_proxy(test_config()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n")
        .await
        .unwrap();

    assert!(read_all(&mut client).await.is_empty());
}

#[tokio::test]
async fn test_malformed_port_closes_silently() {
    let (proxy_addr, _stats, _proxy) = spawn_proxy(test_config()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:https HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    assert!(read_all(&mut client).await.is_empty());
}

#[tokio::test]
async fn test_unreachable_upstream_gets_no_tunnel() {
    let (proxy_addr, stats, _proxy) = spawn_proxy(test_config()).await;
    let (upstream, port) = bind_upstream().await;
    drop(upstream);

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    assert!(read_all(&mut client).await.is_empty());

    timeout(TEST_TIMEOUT, async {
        while stats.snapshot().failed == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_idle_tunnel_is_closed() {
    let mut config = test_config();
    config.idle_ticks = 2;
    let (proxy_addr, _stats, _proxy) = spawn_proxy(config).await;
    let (upstream, port) = bind_upstream().await;

    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    // nothing moves after the 200, so both ends get closed by the proxy
    assert_eq!(read_all(&mut client).await, RESPONSE_200_CONNECT);
    let rest = timeout(TEST_TIMEOUT, upstream_task).await.unwrap().unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_client_closing_without_request() {
    let (proxy_addr, stats, _proxy) = spawn_proxy(test_config()).await;

    let client = TcpStream::connect(proxy_addr).await.unwrap();
    drop(client);

    timeout(TEST_TIMEOUT, async {
        while stats.snapshot().total == 0 || stats.snapshot().active > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(stats.snapshot().failed, 0);
}

#[tokio::test]
async fn test_silent_client_times_out_on_first_read() {
    let mut config = test_config();
    config.timeout = 1;
    let (proxy_addr, stats, _proxy) = spawn_proxy(config).await;

    let started = Instant::now();
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();

    // never sends a byte; the proxy gives up and closes without a reply
    assert!(read_all(&mut client).await.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(1));

    timeout(TEST_TIMEOUT, async {
        while stats.snapshot().total == 0 || stats.snapshot().active > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(stats.snapshot().failed, 0);
}

#[tokio::test]
async fn test_shutdown_stops_accepting_and_drains_open_tunnel() {
    let (proxy_addr, handle, proxy) = spawn_proxy_with_shutdown(test_config()).await;
    let (upstream, port) = bind_upstream().await;

    tokio::spawn(async move {
        let (stream, _) = upstream.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut established = vec![0u8; RESPONSE_200_CONNECT.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut established))
        .await
        .unwrap()
        .unwrap();

    let drain = tokio::spawn(async move { handle.shutdown(TEST_TIMEOUT).await });

    // the accept loop exits and the listen socket is closed
    timeout(TEST_TIMEOUT, proxy).await.unwrap().unwrap();
    assert!(TcpStream::connect(proxy_addr).await.is_err());

    // the tunnel opened before shutdown keeps working
    client.write_all(b"still here").await.unwrap();
    let mut echoed = [0u8; 10];
    timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"still here");
    assert!(!drain.is_finished());

    drop(client);
    assert!(timeout(TEST_TIMEOUT, drain).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_shutdown_deadline_expires_with_open_tunnel() {
    let mut config = test_config();
    config.idle_ticks = 1_000;
    let (proxy_addr, handle, _proxy) = spawn_proxy_with_shutdown(config).await;
    let (upstream, port) = bind_upstream().await;

    let _upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut established = vec![0u8; RESPONSE_200_CONNECT.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut established))
        .await
        .unwrap()
        .unwrap();

    let started = Instant::now();
    assert!(!handle.shutdown(Duration::from_millis(100)).await);
    assert!(started.elapsed() >= Duration::from_millis(100));
}
