use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use torrotate_common::{RotateError, RotatorConfig};
use torrotate_core::circuit::StreamEventLogger;
use torrotate_core::control::{ControlSession, TorControl};
use torrotate_core::diagnostics::{system_resolver, DiagnosticsReporter};
use torrotate_core::rotation::{HttpExitProbe, RotationScheduler, RotationSettings};
use torrotate_core::supervisor::{LaunchConfig, ProcessSupervisor};
use tracing::{info, warn};

/// Launch Tor, take its control port and rotate until told to stop.
///
/// Launch and authentication failures, and losing the control connection
/// later on, come back as fatal `RotateError`s.
pub async fn run(config: RotatorConfig) -> Result<()> {
    info!(
        tor = %config.tor_binary.display(),
        socks = %config.socks_addr(),
        control = %config.control_addr(),
        lifetime_secs = config.ip_lifetime_secs,
        exit_nodes = %config.exit_node_locales,
        "Starting torrotate v{}",
        env!("CARGO_PKG_VERSION")
    );

    let supervisor = ProcessSupervisor::system(LaunchConfig::from_config(&config));
    let tor = supervisor.start().await.map_err(RotateError::from)?;

    let session = ControlSession::connect(&config.control_addr(), config.query_timeout())
        .await
        .map_err(RotateError::from)?;
    session.authenticate().await.map_err(RotateError::from)?;
    let session = Arc::new(session);

    match session.pid().await {
        Ok(pid) => info!(launched = tor.pid(), reported = pid, "Tor process"),
        Err(e) => warn!(launched = tor.pid(), error = %e, "Tor did not report its pid"),
    }

    let settings = RotationSettings::from_config(&config);
    let diagnostics = DiagnosticsReporter::new(session.clone(), tor.pid(), Some(system_resolver()));
    let mut scheduler = RotationScheduler::new(session.clone(), settings)
        .with_diagnostics(diagnostics)
        .with_event_handler(Arc::new(StreamEventLogger::new(session.clone())));

    if settings.verify_exit_ip {
        match HttpExitProbe::from_config(&config) {
            Ok(probe) => {
                info!(url = %probe.url(), "Exit IP verification enabled");
                scheduler = scheduler.with_probe(Arc::new(probe));
            }
            Err(e) => warn!(error = %e, "Exit IP verification disabled"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Signal handler failed, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let outcome = scheduler.run(shutdown_rx).await;

    session.close().await;
    tor.disown();
    outcome.map_err(RotateError::from)?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")
}
