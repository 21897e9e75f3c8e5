use std::net::SocketAddr;

use kube::Client;
use tokio::{task::JoinHandle, try_join};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{config::OperatorConfig, controller::run_controller, web::run_http_server};

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &OperatorConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Spawn the Kubernetes controller loop.
pub fn spawn_controller(
    client: Client,
    cfg: OperatorConfig,
    shutdown: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let res = run_controller(client, cfg, shutdown.clone()).await;
        // The controller only returns on shutdown; take the HTTP server with it
        shutdown.cancel();
        res
    })
}

/// Spawn the liveness HTTP server.
pub fn spawn_http(addr: SocketAddr, shutdown: CancellationToken) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_http_server(addr, shutdown).await })
}

/// Cancel `shutdown` on ctrl-c so in-flight reconciles stop.
pub fn spawn_signal_handler(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    return;
                }
                info!("shutdown requested");
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    })
}

/// Start controller and HTTP server and wait until both finish.
pub async fn run_all(client: Client, cfg: OperatorConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let http_addr = compute_http_addr(&cfg);

    let signals = spawn_signal_handler(shutdown.clone());
    let controller = spawn_controller(client, cfg, shutdown.clone());
    let http = spawn_http(http_addr, shutdown.clone());

    let (c_res, h_res) = try_join!(controller, http)?;
    shutdown.cancel();
    signals.await?;
    c_res?;
    h_res?;
    Ok(())
}
