//! Minimal HTTP request parsing for the proxy surface
//!
//! Handles the two inbound shapes a forward proxy sees:
//! - CONNECT method (HTTPS tunneling): CONNECT host:port HTTP/1.1\r\n\r\n
//! - Regular HTTP method: GET http://host:port/path HTTP/1.1\r\nHost: host\r\n\r\n
//!   (absolute-form, or origin-form resolved via the Host header)

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use url::Url;

/// Safety limit for the request head
pub const MAX_HEADER_BYTES: usize = 16384;

/// Parsed request metadata needed for access control, logging, and
/// upstream connection setup. Nothing more.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Raw target as the client sent it, for logging
    pub target: String,
    pub host: String,
    pub port: u16,
    /// Origin-form path and query for upstream rewrite (empty for CONNECT)
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub content_length: usize,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read the request head from a stream.
///
/// Returns the parsed request plus any bytes buffered beyond the headers
/// (pipelined data, or the start of the body). The stream is borrowed so
/// the caller can still answer on it when parsing fails.
pub async fn read_request<S>(stream: &mut S) -> anyhow::Result<(Request, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(MAX_HEADER_BYTES, stream);
    let mut head = Vec::new();

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;

        if n == 0 {
            anyhow::bail!("connection closed before request received");
        }

        head.extend_from_slice(&line);

        if head.ends_with(b"\r\n\r\n") {
            break;
        }

        if head.len() > MAX_HEADER_BYTES {
            anyhow::bail!("HTTP headers too large (>{}B)", MAX_HEADER_BYTES);
        }
    }

    let head_str = String::from_utf8_lossy(&head);
    let request = parse_request_head(&head_str)?;

    // Bytes already read past the header terminator
    let buffered_extra = reader.buffer().to_vec();

    Ok((request, buffered_extra))
}

/// Parse a complete request head (request line plus headers)
pub fn parse_request_head(head: &str) -> anyhow::Result<Request> {
    let first_line = head
        .lines()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty request"))?;

    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 3 || !parts[2].starts_with("HTTP/") {
        anyhow::bail!("invalid request line: {:?}", first_line);
    }

    let method = parts[0].to_string();
    let target = parts[1].to_string();
    let headers = parse_headers(head);

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    if method.eq_ignore_ascii_case("CONNECT") {
        // Authority-form: host:port
        let (host, port_str) = target
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid host:port format: {}", target))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid port number: {}", port_str))?;

        return Ok(Request {
            method,
            host: host.to_string(),
            port,
            path: String::new(),
            headers,
            content_length,
            target,
        });
    }

    let (host, mut port, path) = parse_target(&target, &headers)?;

    // The Host header's port wins over the URL default when present
    if let Some(host_value) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.as_str())
    {
        if let Some((_, port_str)) = host_value.rsplit_once(':') {
            if let Ok(p) = port_str.parse::<u16>() {
                port = p;
            }
        }
    }

    Ok(Request {
        method,
        host,
        port,
        path,
        headers,
        content_length,
        target,
    })
}

/// Resolve host, port, and origin-form path for a non-CONNECT target
fn parse_target(target: &str, headers: &[(String, String)]) -> anyhow::Result<(String, u16, String)> {
    // Absolute-form: http://host:port/path?query
    if let Ok(url) = Url::parse(target) {
        if url.has_host() {
            let host = url
                .host_str()
                .ok_or_else(|| anyhow::anyhow!("no host in URL"))?
                .to_string();
            let port = url
                .port_or_known_default()
                .ok_or_else(|| anyhow::anyhow!("unknown URL scheme: {}", url.scheme()))?;

            let mut path = url.path().to_string();
            if path.is_empty() {
                path.push('/');
            }
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }

            return Ok((host, port, path));
        }
    }

    // Origin-form: path only, host comes from the Host header
    if target.starts_with('/') {
        let host_value = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("origin-form request without Host header"))?;

        let (host, port) = match host_value.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h.to_string(), port),
                Err(_) => (host_value.to_string(), 80),
            },
            None => (host_value.to_string(), 80),
        };

        return Ok((host, port, target.to_string()));
    }

    anyhow::bail!("cannot determine host and port from target: {}", target)
}

/// Parse header lines following the request line
fn parse_headers(head: &str) -> Vec<(String, String)> {
    head.lines()
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Send a minimal status-line response and nothing else; internal error
/// detail never reaches the client.
pub async fn send_status<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: u16,
    reason: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Send HTTP 200 to acknowledge an established CONNECT tunnel
pub async fn send_connect_established<W: AsyncWrite + Unpin>(
    stream: &mut W,
) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    stream.flush().await
}
