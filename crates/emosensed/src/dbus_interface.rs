use emosense_models::{ModelManager, ModelVersion};
use zbus::interface;

pub const BUS_NAME: &str = "org.emosense.Models1";
pub const OBJECT_PATH: &str = "/org/emosense/Models1";

/// D-Bus interface for the Emosense model daemon.
///
/// Bus name: org.emosense.Models1
/// Object path: /org/emosense/Models1
pub struct ModelService {
    manager: ModelManager,
}

impl ModelService {
    pub fn new(manager: ModelManager) -> Self {
        Self { manager }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.emosense.Models1")]
impl ModelService {
    /// Installed model snapshot as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.manager.status().map_err(failed)?;
        serde_json::to_string(&status).map_err(failed)
    }

    /// Ask the backend whether a newer model exists. Does not download.
    async fn check_for_updates(&self, force: bool) -> zbus::fdo::Result<bool> {
        tracing::info!(force, "check_for_updates requested");
        self.manager.check_for_updates(force).await.map_err(failed)
    }

    /// Start (or restart) the background download of `version`.
    async fn download_model(&self, version: u32, url: &str) -> zbus::fdo::Result<()> {
        if url.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("download url is empty".into()));
        }
        self.manager.download_model(ModelVersion(version), url);
        Ok(())
    }

    async fn cancel_download(&self, version: u32) -> zbus::fdo::Result<bool> {
        Ok(self.manager.cancel_download(ModelVersion(version)))
    }

    /// Latest progress value: fraction while running, 1.0 done, -1.0 failed,
    /// 0.0 for versions never requested.
    async fn download_progress(&self, version: u32) -> zbus::fdo::Result<f64> {
        Ok(self
            .manager
            .download_info(ModelVersion(version))
            .map_or(0.0, |info| f64::from(info.progress_value())))
    }

    /// Lower-case state name of the download of `version`, `idle` if unknown.
    async fn download_state(&self, version: u32) -> zbus::fdo::Result<String> {
        Ok(self
            .manager
            .download_info(ModelVersion(version))
            .map_or_else(|| "idle".to_string(), |info| format!("{:?}", info.state).to_lowercase()))
    }

    async fn model_version(&self) -> zbus::fdo::Result<u32> {
        self.manager.model_version().map(|v| v.0).map_err(failed)
    }

    async fn model_path(&self) -> zbus::fdo::Result<String> {
        Ok(self.manager.model_file().to_string_lossy().into_owned())
    }
}
