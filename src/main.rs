use clap::Parser;
use netgate::accesslog::AccessLog;
use netgate::config::{ConfigLoader, ConfigValidator};
use netgate::filter::RuleEngine;
use netgate::proxy::{spawn_list_reload, ProxyServer, ProxyState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netgate")]
#[command(about = "Forward proxy with network access control and structured access logging")]
struct Args {
    /// Config file path
    #[arg(long, short = 'c', env = "NETGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::load_or_default(args.config)?;

    // RUST_LOG wins; otherwise the config's level, or debug with -v
    let default_level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    ConfigValidator::validate(&config)?;
    let engine = RuleEngine::from_config(&config)?;
    let (access_log, log_handle) = AccessLog::spawn(&config.logging, config.log_fields)?;

    let state = Arc::new(ProxyState {
        config,
        engine,
        access_log,
    });
    let shutdown = CancellationToken::new();

    spawn_list_reload(state.clone(), shutdown.clone());
    spawn_shutdown_listener(shutdown.clone());

    let result = match ProxyServer::bind(state.clone(), shutdown.clone()).await {
        Ok(server) => server.run().await,
        Err(e) => Err(e),
    };

    // Release every access-log sender so the writer can flush and exit
    shutdown.cancel();
    drop(state);
    log_handle.await?;

    result?;
    tracing::info!("proxy stopped");
    Ok(())
}

/// Cancel the shutdown token on SIGINT or SIGTERM
fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}
