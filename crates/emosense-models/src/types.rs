use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Backend-assigned model version. Monotonic, not necessarily contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelVersion(pub u32);

impl ModelVersion {
    /// Version of the model shipped inside the application bundle.
    pub const BUNDLED: ModelVersion = ModelVersion(1);
}

impl Default for ModelVersion {
    fn default() -> Self {
        Self::BUNDLED
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Payload returned by the update-check backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub has_update: bool,
    pub version: ModelVersion,
    #[serde(default)]
    pub download_url: String,
    /// Hex-encoded SHA-256 of the artifact, when the backend publishes one.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Outcome of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    NoUpdate,
    UpdateAvailable {
        version: ModelVersion,
        url: String,
        sha256: Option<String>,
    },
}

impl UpdateDecision {
    pub fn is_available(&self) -> bool {
        matches!(self, UpdateDecision::UpdateAvailable { .. })
    }
}

/// Cooperative cancellation signal shared between a unit of work and its owner.
///
/// Polled at chunk boundaries; [`cancelled`](Self::cancelled) lets sleepers
/// (backoff, constraint waits) wake up early.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One download attempt for a specific model version.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub version: ModelVersion,
    pub url: String,
    pub sha256: Option<String>,
    pub cancel: CancelFlag,
}

impl DownloadTask {
    pub fn new(version: ModelVersion, url: impl Into<String>) -> Self {
        Self {
            version,
            url: url.into(),
            sha256: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_sha256(mut self, sha256: Option<String>) -> Self {
        self.sha256 = sha256;
        self
    }

    /// Scheduler uniqueness key; one in-flight download per version.
    pub fn unique_key(&self) -> String {
        download_work_name(self.version)
    }
}

/// Uniqueness key for the download of `version`.
pub fn download_work_name(version: ModelVersion) -> String {
    format!("download_{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_info_wire_format() {
        let json = r#"{"hasUpdate":true,"version":5,"downloadUrl":"https://cdn/m5.onnx"}"#;
        let info: UpdateInfo = serde_json::from_str(json).unwrap();
        assert!(info.has_update);
        assert_eq!(info.version, ModelVersion(5));
        assert_eq!(info.download_url, "https://cdn/m5.onnx");
        assert_eq!(info.sha256, None);
    }

    #[test]
    fn test_update_info_without_url() {
        let info: UpdateInfo = serde_json::from_str(r#"{"hasUpdate":false,"version":3}"#).unwrap();
        assert!(!info.has_update);
        assert!(info.download_url.is_empty());
    }

    #[test]
    fn test_unique_key_per_version() {
        let a = DownloadTask::new(ModelVersion(5), "http://a");
        let b = DownloadTask::new(ModelVersion(5), "http://b");
        assert_eq!(a.unique_key(), "download_5");
        assert_eq!(a.unique_key(), b.unique_key());
    }

    #[test]
    fn test_default_version_is_bundled() {
        assert_eq!(ModelVersion::default(), ModelVersion(1));
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiter() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::task::yield_now().await;
        flag.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(flag.is_cancelled());
    }
}
