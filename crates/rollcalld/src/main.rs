use anyhow::Result;
use rollcall_store::Store;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod service;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::{EngineControl, EngineSettings};
use service::Attendance;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        device = %config.camera_device,
        db = %config.db_path.display(),
        threshold = config.similarity_threshold,
        "configuration loaded"
    );

    for dir in [config.db_path.parent(), Some(config.image_dir.as_path())]
        .into_iter()
        .flatten()
    {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "could not create directory");
        }
    }

    let store = match Store::open(&config.db_path).await {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!(error = %e, "store unavailable; running with in-memory state only");
            None
        }
    };

    let service = Arc::new(Attendance::new(store));
    service.load_gallery().await;

    let engine = Arc::new(EngineControl::new(
        EngineSettings {
            camera_device: config.camera_device.clone(),
            detector_model: config.detector_model_path(),
            warmup_frames: config.warmup_frames,
            tick_interval: config.tick_interval,
            threshold: config.similarity_threshold,
        },
        Arc::clone(&service),
    ));

    if config.autostart {
        if let Err(e) = engine.start().await {
            tracing::warn!(error = %e, "camera not started; call Start once it is available");
        }
    }

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(
            OBJECT_PATH,
            AttendanceService::new(Arc::clone(&service), Arc::clone(&engine), config),
        )?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    engine.stop().await;

    Ok(())
}
