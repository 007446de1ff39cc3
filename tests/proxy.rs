//! End-to-end tests driving a real listener with stub upstreams

use netgate::accesslog::AccessLog;
use netgate::config::{Action, Config, RuleConfig, SpecialHost};
use netgate::filter::RuleEngine;
use netgate::proxy::{ProxyServer, ProxyState};
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

struct TestProxy {
    addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    log_writer: tokio::task::JoinHandle<()>,
    state: Arc<ProxyState>,
    log_path: PathBuf,
    _dir: TempDir,
}

impl TestProxy {
    async fn start(mut config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("proxy.log");
        config.logging.path = log_path.clone();

        let engine = RuleEngine::from_config(&config).unwrap();
        let (access_log, log_writer) = AccessLog::spawn(&config.logging, config.log_fields).unwrap();

        let state = Arc::new(ProxyState {
            config,
            engine,
            access_log,
        });
        let shutdown = CancellationToken::new();

        let server = ProxyServer::bind(state.clone(), shutdown.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server = tokio::spawn(async move {
            server.run().await.unwrap();
        });

        Self {
            addr,
            shutdown,
            server,
            log_writer,
            state,
            log_path,
            _dir: dir,
        }
    }

    /// Stop the proxy, flush the access log, and return its contents.
    async fn stop(self) -> String {
        self.shutdown.cancel();
        self.server.await.unwrap();
        drop(self.state);
        self.log_writer.await.unwrap();
        std::fs::read_to_string(&self.log_path).unwrap()
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.timeout = 2;
    config.server.buffer_size = 1024;
    config
}

fn rule(name: &str, networks: &[&str], action: Action) -> RuleConfig {
    RuleConfig {
        name: name.to_string(),
        networks: networks.iter().map(|s| s.to_string()).collect(),
        action,
        whitelist_file: None,
        blacklist_file: None,
    }
}

/// Upstream that reads until the end of the request head, answers with a
/// fixed response, and closes.
async fn start_http_upstream(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut seen = Vec::new();
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            seen.extend_from_slice(&buf[..n]);
                            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Upstream that echoes one read back and closes.
async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                if let Ok(n) = socket.read(&mut buf).await {
                    if n > 0 {
                        let _ = socket.write_all(&buf[..n]).await;
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Upstream that accepts and reads forever without answering.
async fn start_sink_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_allowed_request_is_forwarded() {
    let upstream = start_http_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    )
    .await;

    let mut config = test_config();
    config
        .access_control
        .rules
        .push(rule("loopback", &["127.0.0.0/8"], Action::Allow));
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream.port(),
        upstream.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    assert!(response.ends_with("hello"));

    let log = proxy.stop().await;
    assert!(log.contains("STATUS=200"), "log: {}", log);
    assert!(log.contains("METHOD=GET"));
    assert_eq!(log.lines().count(), 1);
}

#[tokio::test]
async fn test_denied_client_gets_403() {
    let mut config = test_config();
    config
        .access_control
        .rules
        .push(rule("loopback", &["127.0.0.0/8"], Action::Deny));
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 403 Forbidden"));

    let log = proxy.stop().await;
    assert!(log.contains("STATUS=403"), "log: {}", log);
}

#[tokio::test]
async fn test_whitelisted_client_passes_deny_rule() {
    let upstream =
        start_http_upstream(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;

    let mut whitelist = tempfile::NamedTempFile::new().unwrap();
    writeln!(whitelist, "127.0.0.1").unwrap();
    whitelist.flush().unwrap();

    let mut config = test_config();
    let mut deny_rule = rule("loopback", &["127.0.0.0/8"], Action::Deny);
    deny_rule.whitelist_file = Some(whitelist.path().to_path_buf());
    config.access_control.rules.push(deny_rule);
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        upstream.port(),
        upstream.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 204"));

    let log = proxy.stop().await;
    assert!(log.contains("STATUS=204"), "log: {}", log);
}

#[tokio::test]
async fn test_connect_tunnel_round_trip() {
    let upstream = start_echo_upstream().await;

    let mut config = test_config();
    config
        .access_control
        .rules
        .push(rule("loopback", &["127.0.0.0/8"], Action::Allow));
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream.port());
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut established = [0u8; 39];
    client.read_exact(&mut established).await.unwrap();
    assert_eq!(&established, b"HTTP/1.1 200 Connection established\r\n\r\n");

    client.write_all(b"ping through the tunnel").await.unwrap();
    let mut echoed = [0u8; 23];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping through the tunnel");

    drop(client);
    let log = proxy.stop().await;
    assert!(log.contains("URL=127.0.0.1:"), "log: {}", log);
    assert!(log.contains("METHOD=CONNECT"));
}

#[tokio::test]
async fn test_special_host_bypasses_deny_and_force_closes() {
    let upstream = start_echo_upstream().await;

    // Everything is denied; only the special destination goes through
    let mut config = test_config();
    config.special_hosts.push(SpecialHost {
        host: "127.0.0.1".to_string(),
        description: "internal server with forced connection close".to_string(),
        force_close: true,
        direct_connection: true,
    });
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream.port());
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut established = [0u8; 39];
    client.read_exact(&mut established).await.unwrap();
    client.write_all(b"one exchange").await.unwrap();

    // The upstream answers once and closes; with force_close the proxy
    // tears the session down without waiting for the client's EOF.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(&rest, b"one exchange");

    let log = proxy.stop().await;
    assert!(log.contains("METHOD=CONNECT"), "log: {}", log);
}

#[tokio::test]
async fn test_tunnel_body_cap_terminates_connection() {
    let upstream = start_sink_upstream().await;

    let mut config = test_config();
    config.limits.max_body_size_kb = 1;
    config
        .access_control
        .rules
        .push(rule("loopback", &["127.0.0.0/8"], Action::Allow));
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream.port());
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut established = [0u8; 39];
    client.read_exact(&mut established).await.unwrap();

    // Push well past the 1 KiB budget; the proxy terminates the session
    let _ = client.write_all(&[0u8; 4096]).await;
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;

    let log = proxy.stop().await;
    assert!(log.contains("STATUS=413"), "log: {}", log);
}

#[tokio::test]
async fn test_idle_tunnel_times_out_with_one_record() {
    let upstream = start_sink_upstream().await;

    let mut config = test_config();
    config.server.timeout = 1;
    config
        .access_control
        .rules
        .push(rule("loopback", &["127.0.0.0/8"], Action::Allow));
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let connect = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream.port());
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut established = [0u8; 39];
    client.read_exact(&mut established).await.unwrap();

    // No traffic in either direction: the forwarder closes the session
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let log = proxy.stop().await;
    let timeout_records = log
        .lines()
        .filter(|line| line.contains("STATUS=504"))
        .count();
    assert_eq!(timeout_records, 1, "log: {}", log);
}

#[tokio::test]
async fn test_unreachable_upstream_yields_502() {
    // Bind a port and drop the listener so nothing is listening there
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut config = test_config();
    config
        .access_control
        .rules
        .push(rule("loopback", &["127.0.0.0/8"], Action::Allow));
    let proxy = TestProxy::start(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        closed_port, closed_port
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502 Bad Gateway"));

    let log = proxy.stop().await;
    assert!(log.contains("STATUS=502"), "log: {}", log);
}
