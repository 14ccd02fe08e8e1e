//! Streaming model download into the scratch area, followed by atomic install.

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

use crate::config::ManagerConfig;
use crate::error::{DownloadError, ManagerError};
use crate::file_store::{discard_scratch, ModelFileStore};
use crate::types::{DownloadTask, ModelVersion};
use crate::version_store::{PendingInstall, VersionStore};

/// Fetches model artifacts and swaps them into the active path.
pub struct DownloadExecutor {
    client: reqwest::Client,
    store: ModelFileStore,
    journal: Arc<dyn VersionStore>,
    progress_interval: Duration,
}

impl DownloadExecutor {
    pub fn new(
        config: &ManagerConfig,
        store: ModelFileStore,
        journal: Arc<dyn VersionStore>,
    ) -> Result<Self, ManagerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .user_agent(concat!("emosense/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            store,
            journal,
            progress_interval: config.progress_interval(),
        })
    }

    /// Download `task`, install it as the active model and record its version.
    ///
    /// `on_progress` receives the downloaded fraction (0.0 when the length is
    /// unknown), at most once per progress interval. On success the returned
    /// path is the active model path and `task.version` is recorded. On any
    /// error before the rename the active model and recorded version are
    /// untouched; the scratch file is removed unless the journal still points
    /// at it.
    pub async fn execute<F>(&self, task: &DownloadTask, on_progress: F) -> Result<PathBuf, DownloadError>
    where
        F: Fn(f32),
    {
        let temp_path = self.fetch(task, &on_progress).await?;

        let _install = self.store.install_lock().lock().await;
        if task.cancel.is_cancelled() {
            discard_scratch(&temp_path);
            return Err(DownloadError::Cancelled);
        }
        self.install(task.version, &temp_path)
    }

    /// Stream `task.url` into a fresh scratch file and return its path.
    async fn fetch<F>(&self, task: &DownloadTask, on_progress: &F) -> Result<PathBuf, DownloadError>
    where
        F: Fn(f32),
    {
        let (temp_path, file) = self.store.create_scratch(&task.unique_key())?;
        let file = tokio::fs::File::from_std(file);

        match self.stream_to(file, task, on_progress).await {
            Ok(bytes) => {
                tracing::info!(
                    version = %task.version,
                    bytes,
                    path = %temp_path.display(),
                    "download finished"
                );
                Ok(temp_path)
            }
            Err(e) => {
                discard_scratch(&temp_path);
                Err(e)
            }
        }
    }

    async fn stream_to<F>(
        &self,
        mut file: tokio::fs::File,
        task: &DownloadTask,
        on_progress: &F,
    ) -> Result<u64, DownloadError>
    where
        F: Fn(f32),
    {
        if task.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        tracing::info!(version = %task.version, url = %task.url, "download started");
        let response = self.client.get(&task.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Transport(format!(
                "HTTP {status} for {}",
                task.url
            )));
        }

        let total = response.content_length().filter(|&n| n > 0);
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut last_emit = Instant::now();
        on_progress(0.0);

        loop {
            // Cooperative cancellation at every chunk boundary.
            if task.cancel.is_cancelled() {
                tracing::info!(version = %task.version, downloaded, "download cancelled");
                return Err(DownloadError::Cancelled);
            }

            let Some(chunk) = stream.next().await else {
                break;
            };
            let chunk = chunk?;

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::Transport(format!("write failed: {e}")))?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if last_emit.elapsed() >= self.progress_interval {
                last_emit = Instant::now();
                on_progress(fraction(downloaded, total));
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::Transport(format!("flush failed: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::Transport(format!("sync failed: {e}")))?;

        if downloaded == 0 {
            return Err(DownloadError::EmptyArtifact);
        }
        if let Some(total) = total {
            if downloaded < total {
                return Err(DownloadError::Transport(format!(
                    "truncated body: {downloaded} of {total} bytes"
                )));
            }
        }
        if let Some(expected) = &task.sha256 {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(DownloadError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        on_progress(fraction(downloaded, total));
        Ok(downloaded)
    }

    /// Journal the install, rename the scratch file over the active model,
    /// then commit the version. Callers hold the install lock.
    fn install(&self, version: ModelVersion, temp_path: &Path) -> Result<PathBuf, DownloadError> {
        let pending = PendingInstall {
            version,
            scratch_path: temp_path.to_path_buf(),
        };
        if let Err(e) = self.journal.stage(&pending) {
            discard_scratch(temp_path);
            return Err(e.into());
        }

        if let Err(e) = self.store.replace(temp_path) {
            tracing::error!(%version, error = %e, "install failed; previous model kept");
            if let Err(journal_err) = self.journal.clear_staged() {
                // Recovery discards a staged install whose scratch file still exists.
                tracing::error!(
                    %version,
                    error = %journal_err,
                    scratch = %temp_path.display(),
                    "failed to clear install journal; scratch file kept for recovery"
                );
                return Err(journal_err.into());
            }
            discard_scratch(temp_path);
            return Err(e.into());
        }

        if let Err(e) = self.journal.set_version(version) {
            // The journal still names this version; recovery commits it on next start.
            tracing::error!(%version, error = %e, "failed to record installed version");
            return Err(e.into());
        }
        tracing::info!(%version, "model update installed");
        Ok(self.store.active_model_path().to_path_buf())
    }
}

fn fraction(downloaded: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) => (downloaded as f64 / total as f64).min(1.0) as f32,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ArtifactServer;
    use crate::error::VersionStoreError;
    use crate::version_store::SqliteVersionStore;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    /// Journal whose `clear_staged` always fails.
    struct StuckJournal(SqliteVersionStore);

    impl VersionStore for StuckJournal {
        fn get_version(&self) -> Result<ModelVersion, VersionStoreError> {
            self.0.get_version()
        }
        fn set_version(&self, version: ModelVersion) -> Result<(), VersionStoreError> {
            self.0.set_version(version)
        }
        fn updated_at(&self) -> Result<Option<DateTime<Utc>>, VersionStoreError> {
            self.0.updated_at()
        }
        fn stage(&self, pending: &PendingInstall) -> Result<(), VersionStoreError> {
            self.0.stage(pending)
        }
        fn staged(&self) -> Result<Option<PendingInstall>, VersionStoreError> {
            self.0.staged()
        }
        fn clear_staged(&self) -> Result<(), VersionStoreError> {
            Err(VersionStoreError::Corrupt {
                key: "pending_install",
                value: "database is locked".into(),
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ModelFileStore,
        journal: Arc<SqliteVersionStore>,
        executor: DownloadExecutor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ManagerConfig::with_data_dir(dir.path());
        config.progress_interval_ms = 0;
        let store = ModelFileStore::new(config.active_model_path(), config.scratch_dir());
        store.ensure_default_present(&b"bundled".to_vec()).unwrap();
        let journal = Arc::new(SqliteVersionStore::open_in_memory().unwrap());
        let executor = DownloadExecutor::new(&config, store.clone(), journal.clone()).unwrap();
        Fixture {
            _dir: dir,
            store,
            journal,
            executor,
        }
    }

    fn scratch_is_empty(store: &ModelFileStore) -> bool {
        std::fs::read_dir(store.scratch_dir())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[test]
    fn test_fraction() {
        assert_eq!(fraction(512, Some(1024)), 0.5);
        assert_eq!(fraction(2048, Some(1024)), 1.0);
        assert_eq!(fraction(512, None), 0.0);
    }

    #[tokio::test]
    async fn test_successful_download_replaces_model() {
        let fx = fixture();
        let server = ArtifactServer::start().await;
        let progress = Mutex::new(Vec::new());

        let task = DownloadTask::new(ModelVersion(5), server.url("/model/5"));
        let path = fx
            .executor
            .execute(&task, |p| progress.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(path, fx.store.active_model_path());
        assert_eq!(std::fs::read(&path).unwrap(), ArtifactServer::artifact(5));
        assert_eq!(progress.lock().unwrap().last().copied(), Some(1.0));
        assert!(scratch_is_empty(&fx.store));
        assert_eq!(fx.journal.get_version().unwrap(), ModelVersion(5));
        assert!(fx.journal.staged().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_error_is_transient_and_keeps_model() {
        let fx = fixture();
        let server = ArtifactServer::start().await;

        let task = DownloadTask::new(ModelVersion(6), server.url("/status/500"));
        let err = fx.executor.execute(&task, |_| {}).await.unwrap_err();

        assert!(matches!(err, DownloadError::Transport(_)));
        assert!(err.is_transient());
        assert_eq!(std::fs::read(fx.store.active_model_path()).unwrap(), b"bundled");
        assert!(scratch_is_empty(&fx.store));
        assert!(fx.journal.staged().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_body_rejected() {
        let fx = fixture();
        let server = ArtifactServer::start().await;

        let task = DownloadTask::new(ModelVersion(7), server.url("/empty"));
        let err = fx.executor.execute(&task, |_| {}).await.unwrap_err();

        assert!(matches!(err, DownloadError::EmptyArtifact));
        assert_eq!(std::fs::read(fx.store.active_model_path()).unwrap(), b"bundled");
        assert!(scratch_is_empty(&fx.store));
    }

    #[tokio::test]
    async fn test_checksum_verified() {
        let fx = fixture();
        let server = ArtifactServer::start().await;
        let good = format!("{:x}", Sha256::digest(ArtifactServer::artifact(5)));

        let task = DownloadTask::new(ModelVersion(5), server.url("/model/5"))
            .with_sha256(Some(good.to_uppercase()));
        fx.executor.execute(&task, |_| {}).await.unwrap();

        let task = DownloadTask::new(ModelVersion(8), server.url("/model/8"))
            .with_sha256(Some(good));
        let err = fx.executor.execute(&task, |_| {}).await.unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(!err.is_transient());
        assert_eq!(
            std::fs::read(fx.store.active_model_path()).unwrap(),
            ArtifactServer::artifact(5)
        );
        assert!(scratch_is_empty(&fx.store));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let fx = fixture();
        let task = DownloadTask::new(ModelVersion(9), "http://127.0.0.1:9/model");
        let err = fx.executor.execute(&task, |_| {}).await.unwrap_err();
        assert!(matches!(err, DownloadError::Transport(_)));
        assert!(scratch_is_empty(&fx.store));
    }

    #[tokio::test]
    async fn test_precancelled_task_never_touches_network() {
        let fx = fixture();
        let server = ArtifactServer::start().await;
        let task = DownloadTask::new(ModelVersion(5), server.url("/model/5"));
        task.cancel.cancel();

        let err = fx.executor.execute(&task, |_| {}).await.unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(server.hits(), 0);
        assert!(scratch_is_empty(&fx.store));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_cleans_up() {
        let fx = fixture();
        let server = ArtifactServer::start().await;
        let task = DownloadTask::new(ModelVersion(5), server.url("/slow/5"));
        let cancel = task.cancel.clone();

        let err = fx
            .executor
            .execute(&task, |p| {
                if p >= 0.4 {
                    cancel.cancel();
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(std::fs::read(fx.store.active_model_path()).unwrap(), b"bundled");
        assert!(scratch_is_empty(&fx.store));
        assert!(fx.journal.staged().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_failure_is_store_failure() {
        let fx = fixture();
        let server = ArtifactServer::start().await;
        // A directory at the active path makes rename(2) fail.
        std::fs::remove_file(fx.store.active_model_path()).unwrap();
        std::fs::create_dir_all(fx.store.active_model_path().join("occupied")).unwrap();

        let task = DownloadTask::new(ModelVersion(5), server.url("/model/5"));
        let err = fx.executor.execute(&task, |_| {}).await.unwrap_err();

        assert!(matches!(err, DownloadError::StoreFailure(_)));
        assert!(!err.is_transient());
        assert!(fx.store.active_model_path().join("occupied").is_dir());
        assert!(scratch_is_empty(&fx.store));
        assert!(fx.journal.staged().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_replace_with_stuck_journal_keeps_scratch_for_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let config = ManagerConfig::with_data_dir(dir.path());
        let store = ModelFileStore::new(config.active_model_path(), config.scratch_dir());
        std::fs::create_dir_all(store.active_model_path().join("occupied")).unwrap();
        let journal = Arc::new(StuckJournal(SqliteVersionStore::open_in_memory().unwrap()));
        let executor = DownloadExecutor::new(&config, store.clone(), journal.clone()).unwrap();
        let server = ArtifactServer::start().await;

        let task = DownloadTask::new(ModelVersion(5), server.url("/model/5"));
        let err = executor.execute(&task, |_| {}).await.unwrap_err();
        assert!(matches!(err, DownloadError::Journal(_)));

        // The leftover record must read as "rename never happened".
        let pending = journal.staged().unwrap().unwrap();
        assert_eq!(pending.version, ModelVersion(5));
        assert!(pending.scratch_path.exists());
        assert_eq!(journal.get_version().unwrap(), ModelVersion::BUNDLED);
    }

    #[tokio::test]
    async fn test_install_waits_for_lock_and_rechecks_cancel() {
        let fx = fixture();
        let server = ArtifactServer::start().await;
        let task = DownloadTask::new(ModelVersion(5), server.url("/model/5"));

        let held = fx.store.install_lock().lock().await;
        let cancel = task.cancel.clone();
        let release = async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
            drop(held);
        };
        let (result, ()) = tokio::join!(fx.executor.execute(&task, |_| {}), release);

        assert!(matches!(result.unwrap_err(), DownloadError::Cancelled));
        assert_eq!(server.hits(), 1);
        assert_eq!(std::fs::read(fx.store.active_model_path()).unwrap(), b"bundled");
        assert_eq!(fx.journal.get_version().unwrap(), ModelVersion::BUNDLED);
        assert!(scratch_is_empty(&fx.store));
    }
}
