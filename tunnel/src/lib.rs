pub mod config;
pub mod context;
pub mod cors;
pub mod destination;
pub mod envelope;
pub mod errors;
pub mod forwarder;
pub mod metrics_defs;
pub mod pipeline;
pub mod service;
pub mod trust;

#[cfg(test)]
mod testutils;

use crate::config::Config;
use crate::errors::TunnelError;
use crate::metrics_defs::ALL_METRICS;
use crate::service::TunnelService;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Runs the tunnel and admin listeners until `shutdown` resolves.
///
/// On shutdown `/ready` starts failing right away, both listeners stop
/// accepting and in-flight requests get `shutdown_timeout_secs` to finish.
pub async fn run(
    config: Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), TunnelError> {
    config.validate()?;

    if config.trusted_dsns.is_empty() {
        tracing::warn!("trusted_dsns is empty, envelopes will be forwarded to any destination");
    }
    if config.allowed_origins.is_empty() {
        tracing::warn!("allowed_origins is empty, any origin may call the tunnel");
    }

    shared::metrics_defs::describe_metrics(ALL_METRICS);

    let tunnel_service = TunnelService::new(&config)?;

    let ready = Arc::new(AtomicBool::new(true));
    let ready_flag = ready.clone();
    let admin_service = AdminService::new(move || ready_flag.load(Ordering::Relaxed));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        tracing::info!("shutdown requested");
        ready.store(false, Ordering::Relaxed);
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        path = %config.path,
        trusted_dsns = config.trusted_dsns.len(),
        "starting tunnel"
    );

    let tunnel_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        tunnel_service,
        wait_for(shutdown_rx.clone()),
        config.shutdown_timeout(),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
        wait_for(shutdown_rx),
        config.shutdown_timeout(),
    );

    tokio::try_join!(tunnel_task, admin_task)?;
    tracing::info!("tunnel stopped");
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens after it fired
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
