//! Background daemon that keeps the agent current and reports its status.
//!
//! Heavy lifting lives in warden-core and is synchronous; every core call is
//! pushed through `spawn_blocking` so the status endpoint stays responsive
//! during a fetch or an elevated write.

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::{
    net::TcpListener,
    select, signal,
    sync::watch,
    task::spawn_blocking,
    time::interval,
};
use warden_core::{
    config::DEFAULT_CONFIG_PATH, logging, privilege, UpdateController, WardenConfig,
};

/// Last observed update state, published to the status endpoint.
#[derive(Debug, Clone, Serialize, Default)]
struct StatusSnapshot {
    version: String,
    update_available: bool,
    remote_version: Option<String>,
    last_check_error: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let config_path =
        std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config_path = PathBuf::from(config_path);
    let config = Arc::new(
        WardenConfig::load_or_bootstrap(&config_path)
            .with_context(|| format!("load config {}", config_path.display()))?,
    );

    privilege::ensure_privilege_support().map_err(anyhow::Error::new)?;

    if config.path != config_path {
        warn!(
            "configuration missing at {}; using bootstrap at {}",
            config_path.display(),
            config.path.display()
        );
    }

    info!("warden daemon booting (config: {})", config.path.display());

    let controller = Arc::new(UpdateController::new(config.clone()));
    info!("running version: {}", controller.current_version());

    let (status_tx, status_rx) = watch::channel(StatusSnapshot {
        version: controller.current_version(),
        ..StatusSnapshot::default()
    });

    let check_handle = tokio::spawn(periodic_check(
        controller.clone(),
        config.clone(),
        status_tx,
    ));
    let status_handle = tokio::spawn(status_server(status_rx));

    select! {
        res = check_handle => res??,
        res = status_handle => res??,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Poll the remote source on the configured interval and publish findings.
///
/// Checking is non-mutating; applying stays an explicit operator action
/// through the CLI.
async fn periodic_check(
    controller: Arc<UpdateController>,
    config: Arc<WardenConfig>,
    status_tx: watch::Sender<StatusSnapshot>,
) -> Result<()> {
    if config.update.source_url.trim().is_empty() {
        warn!("update.source_url not configured; update checks disabled");
        // Stay pending: completing this task would resolve the select! in
        // run() and take the status endpoint down with it.
        std::future::pending::<()>().await;
    }

    let mut ticker = interval(config.check_interval());
    loop {
        ticker.tick().await;
        let checker = controller.clone();
        let result = spawn_blocking(move || checker.check_for_update()).await?;

        let snapshot = match result {
            Ok(outcome) => {
                if outcome.available {
                    info!(
                        "update available: {} -> {}",
                        controller.current_version(),
                        outcome.remote_version.as_deref().unwrap_or("?")
                    );
                } else {
                    info!("no update available ({:?})", outcome.verdict);
                }
                StatusSnapshot {
                    version: controller.current_version(),
                    update_available: outcome.available,
                    remote_version: outcome.remote_version,
                    last_check_error: None,
                }
            }
            Err(err) => {
                warn!("update check failed: {err}");
                StatusSnapshot {
                    version: controller.current_version(),
                    update_available: false,
                    remote_version: None,
                    last_check_error: Some(err.to_string()),
                }
            }
        };

        let _ = status_tx.send(snapshot);
    }
}

/// Expose a bare-bones HTTP endpoint serving the latest status snapshot.
async fn status_server(status_rx: watch::Receiver<StatusSnapshot>) -> Result<()> {
    let addr: SocketAddr = std::env::var("WARDEN_STATUS_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse()
        .context("parse WARDEN_STATUS_ADDR")?;

    let listener = TcpListener::bind(addr).await?;
    info!("status endpoint listening on http://{addr}");

    loop {
        let (mut stream, peer) = listener.accept().await?;
        let snapshot = status_rx.borrow().clone();
        let body = serde_json::to_string(&snapshot)?;
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        if let Err(err) = stream.write_all(response.as_bytes()).await {
            warn!("failed to respond to {peer}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_source_url_keeps_check_task_pending() {
        let config = Arc::new(WardenConfig::default());
        let controller = Arc::new(UpdateController::new(config.clone()));
        let (status_tx, _status_rx) = watch::channel(StatusSnapshot::default());

        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            periodic_check(controller, config, status_tx),
        )
        .await;
        assert!(outcome.is_err(), "disabled checks must not finish the task");
    }
}
