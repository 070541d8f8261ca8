//! The long-running daemon behind `socktun run`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socktun_engine::{
    run_blocking, CommandEngine, Config, ControlServer, EngineConfig, EngineKind, JsonProfileStore,
    ProfileStore, SessionController, SessionState, Status, TunnelEngine,
};
use socktun_tun::TunPlatform;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::recorder::StoreRecorder;

/// Grace period for the control server after shutdown
const SERVER_DRAIN: Duration = Duration::from_millis(100);

pub async fn run(config: Config) -> Result<()> {
    info!("Starting socktun daemon...");

    let platform = platform()?;
    let engine = engine(&config.engine)?;
    let store: Arc<dyn ProfileStore> = Arc::new(JsonProfileStore::new(&config.store.path));
    let recorder = Arc::new(StoreRecorder::new(store.clone()));

    let controller = SessionController::builder(config.tunnel.clone(), platform, engine)
        .event_handler(recorder.clone())
        .build();

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let server = Arc::new(
        ControlServer::new(&config.control.socket, controller.clone())
            .with_store(store.clone())
            .with_shutdown(shutdown_tx),
    );
    let listener = server
        .bind()
        .with_context(|| format!("Failed to bind control socket {:?}", config.control.socket))?;
    let server_handle = tokio::spawn(server.serve(listener));

    if config.auto_connect {
        auto_connect(&controller, &store).await;
    }

    tokio::select! {
        result = wait_for_signal() => result?,
        _ = shutdown_rx.recv() => info!("Shutdown requested over control socket"),
    }

    info!("Shutting down...");
    recorder.freeze();
    controller.shutdown().await;

    server_handle.abort();
    let _ = tokio::time::timeout(SERVER_DRAIN, server_handle).await;

    Ok(())
}

/// Reconnect the selected profile if it was up when the daemon last stopped
async fn auto_connect(controller: &SessionController, store: &Arc<dyn ProfileStore>) {
    let selected = match run_blocking(store, |store| store.selected()).await {
        Ok(Some(selected)) => selected,
        Ok(None) => {
            info!("No selected profile, skipping auto-connect");
            return;
        }
        Err(e) => {
            warn!("Cannot read profile store: {}", e);
            return;
        }
    };

    if selected.status != Some(Status::Connected) {
        info!("Selected profile was not connected, skipping auto-connect");
        return;
    }

    info!("Auto-connecting to {}", selected.endpoint);
    let controller = controller.clone();
    tokio::spawn(async move {
        match controller.connect(selected.endpoint).await {
            Ok(SessionState::Failed(reason)) => error!("Auto-connect failed: {}", reason),
            Ok(_) => {}
            Err(e) => error!("Auto-connect rejected: {}", e),
        }
    });
}

#[cfg(target_os = "linux")]
fn platform() -> Result<Arc<dyn TunPlatform>> {
    if !socktun_tun::linux::is_tun_available() {
        warn!("/dev/net/tun not found; connects will fail until the tun module is loaded");
    }
    Ok(Arc::new(socktun_tun::LinuxPlatform::new()))
}

#[cfg(not(target_os = "linux"))]
fn platform() -> Result<Arc<dyn TunPlatform>> {
    anyhow::bail!("no tunnel platform is available for this operating system")
}

fn engine(config: &EngineConfig) -> Result<Arc<dyn TunnelEngine>> {
    match config.kind {
        EngineKind::Command => {
            info!("Using engine command {:?}", config.program);
            Ok(Arc::new(
                CommandEngine::new(&config.program).with_args(config.args.clone()),
            ))
        }
        EngineKind::Native => native_engine(),
    }
}

#[cfg(feature = "native-engine")]
fn native_engine() -> Result<Arc<dyn TunnelEngine>> {
    info!("Using linked tun2socks engine");
    Ok(Arc::new(socktun_engine::NativeEngine::new()))
}

#[cfg(not(feature = "native-engine"))]
fn native_engine() -> Result<Arc<dyn TunnelEngine>> {
    anyhow::bail!("engine kind \"native\" requires a build with the native-engine feature")
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
