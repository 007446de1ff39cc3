//! Per-connection handling
//!
//! Each accepted connection runs: parse the request head, evaluate the
//! decision engine, then reject, tunnel (CONNECT), or forward (plain HTTP).
//! Whatever happens, exactly one access record is emitted when the
//! connection closes.

use crate::accesslog::{AccessLog, AccessRecord};
use crate::config::Config;
use crate::filter::RuleEngine;
use crate::proxy::forward::{forward, RelayOptions, RelayOutcome};
use crate::proxy::http::{self, Request};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Deadline for reading the request head
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream response bytes retained for status derivation when the
/// response log fields are disabled
const RESPONSE_PEEK_BYTES: usize = 8192;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state handed to every connection task, constructed once at
/// startup and read-only afterwards.
pub struct ProxyState {
    pub config: Config,
    pub engine: RuleEngine,
    pub access_log: AccessLog,
}

/// Handle one client connection end to end and emit its access record.
pub async fn handle_client(stream: TcpStream, peer: SocketAddr, state: Arc<ProxyState>) {
    let started = Instant::now();
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let mut record = AccessRecord::new(id, peer.ip());

    serve(stream, peer, &state, &mut record).await;

    record.duration_ms = Some(started.elapsed().as_millis() as u64);
    state.access_log.emit(record);
}

async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ProxyState>,
    record: &mut AccessRecord,
) {
    let (request, extra) =
        match tokio::time::timeout(REQUEST_HEAD_TIMEOUT, http::read_request(&mut stream)).await {
            Err(_) => {
                debug!(conn = record.id, peer = %peer, "timeout reading request head");
                record.status_code = Some(408);
                let _ = http::send_status(&mut stream, 408, "Request Timeout").await;
                return;
            }
            Ok(Err(e)) => {
                debug!(conn = record.id, peer = %peer, "bad request: {}", e);
                record.status_code = Some(400);
                let _ = http::send_status(&mut stream, 400, "Bad Request").await;
                return;
            }
            Ok(Ok(parsed)) => parsed,
        };

    record.method = Some(request.method.clone());
    record.url = Some(request.target.clone());
    if state.config.log_fields.headers {
        record.headers = Some(format_headers(&request.headers));
    }

    let decision = state.engine.decide(peer.ip(), &request.host);
    if decision.is_denied() {
        warn!(
            conn = record.id,
            client = %peer.ip(),
            host = %request.host,
            "access denied"
        );
        record.status_code = Some(403);
        let _ = http::send_status(&mut stream, 403, "Forbidden").await;
        return;
    }

    let connect_timeout = Duration::from_secs(state.config.server.timeout);
    let upstream = match tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((request.host.as_str(), request.port)),
    )
    .await
    {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            warn!(
                conn = record.id,
                host = %request.host,
                port = request.port,
                "upstream connect failed: {}",
                e
            );
            record.status_code = Some(502);
            let _ = http::send_status(&mut stream, 502, "Bad Gateway").await;
            return;
        }
        Err(_) => {
            warn!(
                conn = record.id,
                host = %request.host,
                port = request.port,
                "upstream connect timed out"
            );
            record.status_code = Some(502);
            let _ = http::send_status(&mut stream, 502, "Bad Gateway").await;
            return;
        }
    };

    if request.is_connect() {
        tunnel(stream, upstream, extra, decision.force_close, state, record).await;
    } else {
        forward_http(stream, upstream, request, extra, state, record).await;
    }
}

/// CONNECT tunneling: acknowledge, replay any pipelined bytes, then relay
/// raw bytes until one side is done.
async fn tunnel(
    mut stream: TcpStream,
    mut upstream: TcpStream,
    extra: Vec<u8>,
    force_close: bool,
    state: &Arc<ProxyState>,
    record: &mut AccessRecord,
) {
    if http::send_connect_established(&mut stream).await.is_err() {
        debug!(conn = record.id, "client went away before tunnel start");
        return;
    }

    // The 200 is already on the wire; a failure from here on just closes
    if !extra.is_empty() && upstream.write_all(&extra).await.is_err() {
        record.status_code = Some(502);
        return;
    }

    let summary = forward(
        stream,
        upstream,
        RelayOptions {
            buffer_size: state.config.server.buffer_size,
            timeout: Duration::from_secs(state.config.server.timeout),
            max_body_bytes: state.config.limits.max_body_bytes(),
            one_shot: force_close,
            capture_limit: 0,
        },
    )
    .await;

    debug!(
        conn = record.id,
        sent = summary.client_to_upstream,
        received = summary.upstream_to_client,
        "tunnel closed"
    );
    record.status_code = Some(status_from_outcome(summary.outcome, 200));
}

/// Plain-HTTP forwarding: bounded body read, request rewrite with forced
/// `Connection: close`, then a single-exchange relay of the response.
async fn forward_http(
    mut stream: TcpStream,
    mut upstream: TcpStream,
    request: Request,
    extra: Vec<u8>,
    state: &Arc<ProxyState>,
    record: &mut AccessRecord,
) {
    let max_body = state.config.limits.max_body_bytes();
    let io_timeout = Duration::from_secs(state.config.server.timeout);

    if request.content_length as u64 > max_body {
        debug!(conn = record.id, "request body too large");
        record.status_code = Some(413);
        let _ = http::send_status(&mut stream, 413, "Request Entity Too Large").await;
        return;
    }

    let mut body = extra;
    body.truncate(request.content_length.min(body.len()));
    if body.len() < request.content_length {
        let mut rest = vec![0u8; request.content_length - body.len()];
        match tokio::time::timeout(io_timeout, stream.read_exact(&mut rest)).await {
            Err(_) => {
                record.status_code = Some(408);
                let _ = http::send_status(&mut stream, 408, "Request Timeout").await;
                return;
            }
            Ok(Err(e)) => {
                debug!(conn = record.id, "failed to read request body: {}", e);
                record.status_code = Some(400);
                let _ = http::send_status(&mut stream, 400, "Bad Request").await;
                return;
            }
            Ok(Ok(_)) => body.extend_from_slice(&rest),
        }
    }

    if state.config.log_fields.body && !body.is_empty() {
        record.body = Some(String::from_utf8_lossy(&body).into_owned());
    }

    let head = build_upstream_request(&request);
    let send = async {
        upstream.write_all(&head).await?;
        if !body.is_empty() {
            upstream.write_all(&body).await?;
        }
        upstream.flush().await
    };
    match tokio::time::timeout(io_timeout, send).await {
        Ok(Ok(())) => {}
        _ => {
            record.status_code = Some(502);
            let _ = http::send_status(&mut stream, 502, "Bad Gateway").await;
            return;
        }
    }

    let capture_limit = if state.config.log_fields.response_body {
        max_body as usize
    } else {
        RESPONSE_PEEK_BYTES
    };

    let summary = forward(
        stream,
        upstream,
        RelayOptions {
            buffer_size: state.config.server.buffer_size,
            timeout: io_timeout,
            max_body_bytes: max_body,
            // One request/response cycle per connection; the rewritten
            // request already told the upstream to close.
            one_shot: true,
            capture_limit,
        },
    )
    .await;

    let status = if summary.outcome == RelayOutcome::Complete {
        parse_status_line(&summary.response_head).unwrap_or(200)
    } else {
        status_from_outcome(summary.outcome, 200)
    };
    record.status_code = Some(status);

    if !summary.response_head.is_empty() {
        let (response_headers, response_body) = split_response(&summary.response_head);
        if state.config.log_fields.response_headers {
            record.response_headers = Some(response_headers);
        }
        if state.config.log_fields.response_body && !response_body.is_empty() {
            record.response_body = Some(response_body);
        }
    }

    debug!(
        conn = record.id,
        status,
        sent = summary.client_to_upstream,
        received = summary.upstream_to_client,
        "request completed"
    );
}

/// Rebuild the request head for the upstream: origin-form target, original
/// headers minus hop-by-hop connection control, forced close.
fn build_upstream_request(request: &Request) -> Vec<u8> {
    let target = if request.path.is_empty() {
        "/"
    } else {
        request.path.as_str()
    };

    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, target);
    head.push_str("Connection: close\r\n");

    let mut has_host = false;
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("proxy-connection")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    if !has_host {
        head.push_str(&format!("Host: {}:{}\r\n", request.host, request.port));
    }

    head.push_str("\r\n");
    head.into_bytes()
}

fn status_from_outcome(outcome: RelayOutcome, ok: u16) -> u16 {
    match outcome {
        RelayOutcome::Complete => ok,
        RelayOutcome::IdleTimeout => 504,
        RelayOutcome::LimitExceeded => 413,
        RelayOutcome::PeerError => 502,
    }
}

/// Extract the status code from a captured `HTTP/1.x NNN ...` status line
fn parse_status_line(response_head: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(response_head.get(..64.min(response_head.len()))?).ok()?;
    let mut parts = text.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn split_response(response_head: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(response_head);
    match text.split_once("\r\n\r\n") {
        Some((head, body)) => (head.to_string(), body.to_string()),
        None => (text.into_owned(), String::new()),
    }
}

fn format_headers(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join("; ")
}
