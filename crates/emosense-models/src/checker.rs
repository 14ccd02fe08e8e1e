//! Update checks against the model backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::ManagerConfig;
use crate::error::{CheckError, ManagerError};
use crate::types::{ModelVersion, UpdateDecision, UpdateInfo};
use crate::version_store::VersionStore;

/// Backend answering "is there a model newer than `current`?".
#[async_trait]
pub trait UpdateBackend: Send + Sync {
    async fn check_model_update(&self, current: ModelVersion) -> Result<UpdateInfo, CheckError>;
}

/// JSON-over-HTTP backend: `GET <endpoint>?currentVersion=N`.
pub struct HttpUpdateBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUpdateBackend {
    pub fn new(config: &ManagerConfig) -> Result<Self, ManagerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout() + config.read_timeout())
            .user_agent(concat!("emosense/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.update_endpoint.clone(),
        })
    }
}

#[async_trait]
impl UpdateBackend for HttpUpdateBackend {
    async fn check_model_update(&self, current: ModelVersion) -> Result<UpdateInfo, CheckError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("currentVersion", current.0)])
            .send()
            .await
            .map_err(|e| CheckError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CheckError::Transient(format!("backend returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(CheckError::Permanent(format!("backend returned HTTP {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CheckError::Transient(e.to_string()))?;
        serde_json::from_slice(&body)
            .map_err(|e| CheckError::Permanent(format!("malformed update payload: {e}")))
    }
}

#[derive(Debug, Clone)]
struct LastCheck {
    /// Installed version the decision was computed against.
    current: ModelVersion,
    at: Instant,
    wall: DateTime<Utc>,
    decision: UpdateDecision,
}

/// Compares the installed version against the backend.
pub struct UpdateChecker {
    backend: Arc<dyn UpdateBackend>,
    versions: Arc<dyn VersionStore>,
    recheck_after: Duration,
    last: Mutex<Option<LastCheck>>,
}

impl UpdateChecker {
    pub fn new(
        backend: Arc<dyn UpdateBackend>,
        versions: Arc<dyn VersionStore>,
        recheck_after: Duration,
    ) -> Self {
        Self {
            backend,
            versions,
            recheck_after,
            last: Mutex::new(None),
        }
    }

    fn last(&self) -> MutexGuard<'_, Option<LastCheck>> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wall-clock time of the last successful check.
    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.last().as_ref().map(|l| l.wall)
    }

    /// Ask the backend for a newer model.
    ///
    /// Without `force`, a decision younger than the recheck window is reused
    /// as long as the installed version has not changed since.
    pub async fn check_for_updates(&self, force: bool) -> Result<UpdateDecision, CheckError> {
        let current = self.versions.get_version()?;

        if !force {
            if let Some(last) = self.last().as_ref() {
                if last.current == current && last.at.elapsed() < self.recheck_after {
                    tracing::debug!(%current, "reusing recent update decision");
                    return Ok(last.decision.clone());
                }
            }
        }

        tracing::info!(%current, force, "checking for model update");
        let info = self.backend.check_model_update(current).await?;
        let decision = decide(current, info)?;

        match &decision {
            UpdateDecision::NoUpdate => tracing::info!(%current, "model is up to date"),
            UpdateDecision::UpdateAvailable { version, url, .. } => {
                tracing::info!(%current, available = %version, url = %url, "model update available")
            }
        }

        *self.last() = Some(LastCheck {
            current,
            at: Instant::now(),
            wall: Utc::now(),
            decision: decision.clone(),
        });
        Ok(decision)
    }
}

fn decide(current: ModelVersion, info: UpdateInfo) -> Result<UpdateDecision, CheckError> {
    if !info.has_update {
        return Ok(UpdateDecision::NoUpdate);
    }
    if info.download_url.trim().is_empty() {
        return Err(CheckError::Permanent(format!(
            "update to {} advertised without a download url",
            info.version
        )));
    }
    if info.version <= current {
        tracing::warn!(%current, offered = %info.version, "backend offered a version that is not newer; ignoring");
        return Ok(UpdateDecision::NoUpdate);
    }
    Ok(UpdateDecision::UpdateAvailable {
        version: info.version,
        url: info.download_url,
        sha256: info.sha256.filter(|s| !s.trim().is_empty()),
    })
}
