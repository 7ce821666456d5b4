use anyhow::{Context, Result};
use rollcall_core::{embedder, Gallery, Ledger, OnnxEmbedder, RecognitionLoop};
use rollcall_hw::V4lSource;
use std::sync::{Arc, PoisonError, RwLock};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod state;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env();
    let autostart = config.autostart;
    let system_bus = config.system_bus;

    // Model loading and the initial gallery scan block; keep them off the runtime.
    let state = tokio::task::spawn_blocking(move || build_state(&config))
        .await
        .context("startup task failed")??;
    let state = Arc::new(state);

    let builder = if system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(Arc::clone(&state)))?
        .build()
        .await
        .with_context(|| format!("failed to claim {BUS_NAME} on the {} bus", if system_bus { "system" } else { "session" }))?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    if autostart {
        let state = Arc::clone(&state);
        let started = tokio::task::spawn_blocking(move || state.start()).await?;
        if let Err(e) = started {
            tracing::warn!(error = %e, "autostart failed, recognition idle");
        }
    }

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    tokio::task::spawn_blocking(move || state.stop()).await?;
    Ok(())
}

fn build_state(config: &Config) -> Result<AppState> {
    let onnx = OnnxEmbedder::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .with_context(|| format!("failed to load face models from {}", config.model_dir.display()))?;
    let embedder = embedder::shared(onnx);

    let mut gallery = Gallery::new(&config.enrollment_dir);
    {
        let mut embedder = embedder.lock().unwrap_or_else(PoisonError::into_inner);
        gallery
            .load(&mut **embedder)
            .with_context(|| format!("failed to load known faces from {}", config.enrollment_dir.display()))?;
    }
    let gallery = Arc::new(RwLock::new(gallery));

    let ledger = Arc::new(Ledger::new(&config.ledger_path, config.min_shift()));
    tracing::info!(
        path = %config.ledger_path.display(),
        min_shift_secs = config.min_shift().num_seconds(),
        "attendance ledger configured"
    );

    let source = Arc::new(V4lSource::new(
        config.camera_device.clone(),
        config.capture_width,
        config.capture_height,
    ));
    let recognition = RecognitionLoop::new(
        source,
        Arc::clone(&embedder),
        Arc::clone(&gallery),
        Arc::clone(&ledger),
        config.loop_policy(),
    );

    Ok(AppState::new(gallery, embedder, ledger, recognition))
}
