//! Bidirectional byte pump between client and upstream
//!
//! Streams both directions concurrently with the configured buffer size.
//! Each leg carries its own inactivity timeout and byte budget; the pump
//! reports per-direction byte counts and the terminal cause so the handler
//! can derive a status code for the access record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub buffer_size: usize,
    /// Inactivity timeout applied to each leg independently
    pub timeout: Duration,
    /// Per-direction byte budget; exceeding it terminates the connection
    pub max_body_bytes: u64,
    /// Terminate the relay as soon as the first leg completes, instead of
    /// draining the other leg. Used for forced-close sessions and
    /// single-exchange HTTP forwards.
    pub one_shot: bool,
    /// How many leading upstream-to-client bytes to retain for logging
    pub capture_limit: usize,
}

/// Why the relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Complete,
    IdleTimeout,
    LimitExceeded,
    PeerError,
}

/// How a single leg ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegEnd {
    Eof,
    Timeout,
    Limit,
    Error,
    Cancelled,
}

#[derive(Debug)]
pub struct FlowSummary {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub outcome: RelayOutcome,
    /// Leading bytes of the upstream response, up to `capture_limit`
    pub response_head: Vec<u8>,
}

/// Relay bytes between the two endpoints until EOF, inactivity timeout,
/// or the byte budget is exhausted.
///
/// A leg ending in EOF lets the other leg drain; any other ending tears
/// the whole connection down immediately.
pub async fn forward<C, U>(client: C, upstream: U, opts: RelayOptions) -> FlowSummary
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (upstream_rd, upstream_wr) = tokio::io::split(upstream);

    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);
    let captured = Mutex::new(Vec::new());

    let (up_end, down_end) = {
        let uplink = pump(client_rd, upstream_wr, &opts, &sent, None);
        let downlink = pump(upstream_rd, client_wr, &opts, &received, Some(&captured));
        tokio::pin!(uplink, downlink);

        tokio::select! {
            end = &mut uplink => {
                if opts.one_shot || end != LegEnd::Eof {
                    (end, LegEnd::Cancelled)
                } else {
                    (end, downlink.await)
                }
            }
            end = &mut downlink => {
                if opts.one_shot || end != LegEnd::Eof {
                    (LegEnd::Cancelled, end)
                } else {
                    (uplink.await, end)
                }
            }
        }
    };

    FlowSummary {
        client_to_upstream: sent.load(Ordering::Relaxed),
        upstream_to_client: received.load(Ordering::Relaxed),
        outcome: combine(up_end, down_end),
        response_head: captured.into_inner().unwrap_or_default(),
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    opts: &RelayOptions,
    total: &AtomicU64,
    capture: Option<&Mutex<Vec<u8>>>,
) -> LegEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; opts.buffer_size];

    let end = loop {
        let n = match tokio::time::timeout(opts.timeout, reader.read(&mut buf)).await {
            Err(_) => break LegEnd::Timeout,
            Ok(Err(_)) => break LegEnd::Error,
            Ok(Ok(0)) => break LegEnd::Eof,
            Ok(Ok(n)) => n,
        };

        // Relay at most the remaining budget, then stop the leg
        let relayed = total.load(Ordering::Relaxed);
        let allowed = opts.max_body_bytes.saturating_sub(relayed).min(n as u64) as usize;

        if allowed > 0 {
            let write = async {
                writer.write_all(&buf[..allowed]).await?;
                writer.flush().await
            };
            match tokio::time::timeout(opts.timeout, write).await {
                Err(_) => break LegEnd::Timeout,
                Ok(Err(_)) => break LegEnd::Error,
                Ok(Ok(())) => {}
            }

            total.fetch_add(allowed as u64, Ordering::Relaxed);

            if let Some(capture) = capture {
                if let Ok(mut captured) = capture.lock() {
                    let room = opts.capture_limit.saturating_sub(captured.len());
                    captured.extend_from_slice(&buf[..allowed.min(room)]);
                }
            }
        }

        if allowed < n {
            break LegEnd::Limit;
        }
    };

    let _ = writer.shutdown().await;
    end
}

fn combine(up: LegEnd, down: LegEnd) -> RelayOutcome {
    use LegEnd::*;
    match (up, down) {
        (Limit, _) | (_, Limit) => RelayOutcome::LimitExceeded,
        (Timeout, _) | (_, Timeout) => RelayOutcome::IdleTimeout,
        (Error, _) | (_, Error) => RelayOutcome::PeerError,
        _ => RelayOutcome::Complete,
    }
}
