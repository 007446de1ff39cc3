//! TCP accept loop and process lifecycle

use crate::error::{ProxyError, Result};
use crate::proxy::handler::{handle_client, ProxyState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// The proxy server: a bound listener running one task per accepted
/// connection until shutdown.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Bind the configured listen address. An unbindable address is fatal.
    pub async fn bind(state: Arc<ProxyState>, shutdown: CancellationToken) -> Result<Self> {
        let addr = format!(
            "{}:{}",
            state.config.server.host, state.config.server.port
        );
        let listener = TcpListener::bind(&addr).await.map_err(|e| ProxyError::Bind {
            addr: addr.clone(),
            source: e,
        })?;

        info!("proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state,
            shutdown,
        })
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until the shutdown token fires, then drain in-flight
    /// connections before returning.
    pub async fn run(self) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            debug!("client connected: {}", peer);
                            let state = self.state.clone();
                            tracker.spawn(handle_client(socket, peer, state));
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }
        }

        info!("shutting down, draining {} connection(s)", tracker.len());
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

/// Reload every rule's whitelist/blacklist snapshot on SIGHUP.
/// Decisions in flight keep reading the snapshot they started with.
#[cfg(unix)]
pub fn spawn_list_reload(state: Arc<ProxyState>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot install SIGHUP handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received, reloading access lists");
                    state.engine.reload_lists();
                }
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_list_reload(_state: Arc<ProxyState>, _shutdown: CancellationToken) {}
