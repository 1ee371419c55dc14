mod broadcast;
mod config;
mod http;
mod relay;
mod store;

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use chrono::Utc;
use relay_common::LogSource;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::relay::Relay;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = config::load_from_env();

    let store = match config.data_dir.as_deref() {
        Some(dir) => Store::open(dir, config.log_capacity)
            .await
            .with_context(|| format!("failed to open store in {dir}"))?,
        None => {
            info!("no RELAY_DATA_DIR set, state is kept in memory only");
            Store::in_memory(config.log_capacity)
        }
    };

    let web_root = config
        .web_root
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(http::default_web_root);
    let port = config.port;
    let persistent = store.is_persistent();

    let relay = Relay::new(store, config);
    relay
        .record(LogSource::Srv, "Server started", Utc::now())
        .await
        .context("failed to record startup")?;

    spawn_liveness_loop(relay.clone());

    let app = http::router(relay.clone(), web_root);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay server at {addr}"))?;

    info!(
        persistent,
        timeout_ms = relay.config().heartbeat_timeout_ms,
        "relay listening on http://{addr}"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("relay stopped");
    Ok(())
}

fn spawn_liveness_loop(relay: Relay) {
    tokio::spawn(async move {
        let period = Duration::from_millis(relay.config().liveness_check_interval_ms);
        let mut interval = tokio::time::interval(period);
        let mut online = false;

        loop {
            interval.tick().await;
            match relay.check_liveness(online, Utc::now()).await {
                Ok(now_online) => {
                    if now_online != online {
                        info!(online = now_online, "device liveness changed");
                    }
                    online = now_online;
                }
                Err(err) => warn!("liveness check failed: {err}"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
