use anyhow::{Context, Result};
use emosense_models::{Collaborators, FileAsset, HttpUpdateBackend, ModelManager, SysfsConditions};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::{ModelService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("emosensed starting");

    let config = Config::load().context("failed to load configuration")?;
    let models = &config.models;

    let backend = HttpUpdateBackend::new(models).context("failed to build update backend")?;
    let conditions = SysfsConditions::new(
        models.data_dir.clone(),
        models.min_free_storage_mb,
        models.low_battery_percent,
    );
    let manager = ModelManager::new(
        models.clone(),
        Collaborators {
            backend: Arc::new(backend),
            bundled: Arc::new(FileAsset::new(config.bundled_model.clone())),
            conditions: Arc::new(conditions),
        },
    )
    .context("failed to open model store")?;

    manager
        .initialize()
        .await
        .context("failed to install the bundled model")?;

    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, ModelService::new(manager.clone()))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(
        bus = BUS_NAME,
        path = OBJECT_PATH,
        model = %manager.model_file().display(),
        "emosensed ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("emosensed shutting down");
    manager.shutdown();

    Ok(())
}
