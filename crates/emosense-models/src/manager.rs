//! Public entry point: owns the (active model file, recorded version) pair.

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::checker::{UpdateBackend, UpdateChecker};
use crate::conditions::DeviceConditions;
use crate::config::ManagerConfig;
use crate::download::DownloadExecutor;
use crate::error::{CheckError, DownloadError, ManagerError, VersionStoreError};
use crate::file_store::{discard_scratch, ByteSource, ModelFileStore};
use crate::scheduler::{Constraints, Scheduler, WorkInfo, WorkOutcome, WorkRequest};
use crate::types::{download_work_name, DownloadTask, ModelVersion, UpdateDecision};
use crate::version_store::{SqliteVersionStore, VersionStore};

/// Unique name of the recurring update check.
pub const UPDATE_CHECK_WORK: &str = "model_update_check";

/// External collaborators the manager is wired with.
pub struct Collaborators {
    pub backend: Arc<dyn UpdateBackend>,
    pub bundled: Arc<dyn ByteSource>,
    pub conditions: Arc<dyn DeviceConditions>,
}

/// Serializable snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub version: ModelVersion,
    pub model_path: PathBuf,
    pub model_present: bool,
    pub model_size_bytes: Option<u64>,
    pub version_updated_at: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
}

struct Inner {
    config: ManagerConfig,
    store: ModelFileStore,
    versions: Arc<dyn VersionStore>,
    checker: UpdateChecker,
    executor: DownloadExecutor,
    scheduler: Scheduler,
    bundled: Arc<dyn ByteSource>,
    recovered: AtomicBool,
}

/// Clone-safe handle to the model lifecycle.
#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

impl ModelManager {
    /// Open the version database under `config.data_dir` and wire the components.
    pub fn new(config: ManagerConfig, collaborators: Collaborators) -> Result<Self, ManagerError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| crate::error::StoreError::io(&config.data_dir, e))?;
        let versions: Arc<dyn VersionStore> = Arc::new(SqliteVersionStore::open(&config.db_path())?);
        Self::with_version_store(config, collaborators, versions)
    }

    pub fn with_version_store(
        config: ManagerConfig,
        collaborators: Collaborators,
        versions: Arc<dyn VersionStore>,
    ) -> Result<Self, ManagerError> {
        let store = ModelFileStore::new(config.active_model_path(), config.scratch_dir());
        let checker = UpdateChecker::new(
            collaborators.backend,
            versions.clone(),
            config.recheck_after(),
        );
        let executor = DownloadExecutor::new(&config, store.clone(), versions.clone())?;
        let scheduler = Scheduler::new(collaborators.conditions, config.constraint_poll());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                versions,
                checker,
                executor,
                scheduler,
                bundled: collaborators.bundled,
                recovered: AtomicBool::new(false),
            }),
        })
    }

    /// Make sure a usable model exists and start the periodic update check.
    ///
    /// Idempotent: a present model is never overwritten and the periodic
    /// schedule is replaced rather than duplicated. Must be called from
    /// within a Tokio runtime.
    pub async fn initialize(&self) -> Result<(), ManagerError> {
        if !self.inner.recovered.swap(true, Ordering::SeqCst) {
            let _install = self.inner.store.install_lock().lock().await;
            self.recover_interrupted_install()?;
            self.inner.store.clear_scratch()?;
        }

        let store = self.inner.store.clone();
        let bundled = self.inner.bundled.clone();
        let versions = self.inner.versions.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ManagerError> {
            let _install = store.install_lock().blocking_lock();
            if store.ensure_default_present(bundled.as_ref())? {
                versions.set_version(ModelVersion::BUNDLED)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Task(e.to_string()))??;

        self.schedule_update_checks();
        tracing::info!(
            version = %self.inner.versions.get_version()?,
            path = %self.model_file().display(),
            "model manager initialized"
        );
        Ok(())
    }

    /// Reconcile a journal entry left by a crash between rename and version commit.
    fn recover_interrupted_install(&self) -> Result<(), ManagerError> {
        let Some(pending) = self.inner.versions.staged()? else {
            return Ok(());
        };

        if pending.scratch_path.exists() {
            // The rename never happened: the active file still matches the recorded version.
            tracing::warn!(
                version = %pending.version,
                scratch = %pending.scratch_path.display(),
                "discarding install interrupted before replace"
            );
            discard_scratch(&pending.scratch_path);
            self.inner.versions.clear_staged()?;
        } else if self.inner.store.has_active_model() {
            tracing::warn!(version = %pending.version, "committing install interrupted after replace");
            self.inner.versions.set_version(pending.version)?;
        } else {
            self.inner.versions.clear_staged()?;
        }
        Ok(())
    }

    fn schedule_update_checks(&self) {
        let weak = Arc::downgrade(&self.inner);
        let request = WorkRequest::periodic(UPDATE_CHECK_WORK, self.inner.config.check_interval(), move |_ctx| {
            let weak = weak.clone();
            async move {
                match upgrade(&weak) {
                    Some(manager) => manager.run_update_check().await,
                    None => WorkOutcome::Cancelled,
                }
            }
        })
        .with_constraints(Constraints::update_check())
        .with_retry(self.inner.config.retry_policy());

        tracing::info!(interval = ?self.inner.config.check_interval(), "scheduling periodic update check");
        self.inner.scheduler.enqueue_unique(request);
    }

    async fn run_update_check(&self) -> WorkOutcome {
        match self.inner.checker.check_for_updates(false).await {
            Ok(UpdateDecision::NoUpdate) => WorkOutcome::Success,
            Ok(UpdateDecision::UpdateAvailable {
                version,
                url,
                sha256,
            }) => {
                self.enqueue_download(DownloadTask::new(version, url).with_sha256(sha256));
                WorkOutcome::Success
            }
            Err(e) if e.is_transient() => WorkOutcome::Retry(e.to_string()),
            Err(e) => WorkOutcome::Failure(e.to_string()),
        }
    }

    /// Query the backend; returns whether a newer model is available. Does not download.
    pub async fn check_for_updates(&self, force: bool) -> Result<bool, CheckError> {
        Ok(self
            .inner
            .checker
            .check_for_updates(force)
            .await?
            .is_available())
    }

    /// Download `version` from `url` in the background, superseding any
    /// in-flight download of the same version.
    pub fn download_model(&self, version: ModelVersion, url: impl Into<String>) {
        self.enqueue_download(DownloadTask::new(version, url));
    }

    fn enqueue_download(&self, task: DownloadTask) {
        let name = task.unique_key();
        let weak = Arc::downgrade(&self.inner);
        tracing::info!(version = %task.version, url = %task.url, "download requested");

        let request = WorkRequest::one_shot(name, move |ctx| {
            let weak = weak.clone();
            let mut task = task.clone();
            async move {
                let Some(manager) = upgrade(&weak) else {
                    return WorkOutcome::Cancelled;
                };
                task.cancel = ctx.cancel_flag().clone();
                manager.run_download(&task, |p| ctx.set_progress(p)).await
            }
        })
        .with_constraints(Constraints::download())
        .with_retry(self.inner.config.retry_policy());

        self.inner.scheduler.enqueue_unique(request);
    }

    async fn run_download<F>(&self, task: &DownloadTask, on_progress: F) -> WorkOutcome
    where
        F: Fn(f32),
    {
        match self.is_installed(task.version) {
            Ok(true) => {
                tracing::info!(version = %task.version, "model already installed; skipping download");
                return WorkOutcome::Success;
            }
            Ok(false) => {}
            Err(e) => return WorkOutcome::Failure(e.to_string()),
        }

        match self.inner.executor.execute(task, on_progress).await {
            Ok(_) => WorkOutcome::Success,
            Err(DownloadError::Cancelled) => WorkOutcome::Cancelled,
            Err(e) if e.is_transient() => WorkOutcome::Retry(e.to_string()),
            Err(e) => WorkOutcome::Failure(e.to_string()),
        }
    }

    fn is_installed(&self, version: ModelVersion) -> Result<bool, VersionStoreError> {
        Ok(self.inner.versions.get_version()? == version && self.inner.store.has_active_model())
    }

    /// Cancel the in-flight download of `version`. Returns whether one was running.
    pub fn cancel_download(&self, version: ModelVersion) -> bool {
        self.inner.scheduler.cancel_unique(&download_work_name(version))
    }

    /// Never-ending progress stream for `version`, replaying the latest value:
    /// running fraction, `1.0` on success, `-1.0` on failure, `0.0` otherwise.
    pub fn get_download_progress(&self, version: ModelVersion) -> impl Stream<Item = f32> + Send + Unpin + 'static {
        WatchStream::new(self.watch_download(version)).map(|info| info.progress_value())
    }

    /// Full state of the download of `version`.
    pub fn watch_download(&self, version: ModelVersion) -> tokio::sync::watch::Receiver<WorkInfo> {
        self.inner.scheduler.watch(&download_work_name(version))
    }

    /// Latest state of the download of `version`, if one is known. Unlike
    /// [`watch_download`](Self::watch_download) this never registers `version`.
    pub fn download_info(&self, version: ModelVersion) -> Option<WorkInfo> {
        self.inner.scheduler.info(&download_work_name(version))
    }

    /// Wait for the download of `version` to finish, returning its final state.
    pub async fn wait_for_download(&self, version: ModelVersion) -> WorkInfo {
        self.inner
            .scheduler
            .wait_terminal(&download_work_name(version))
            .await
    }

    /// Record `version` as installed. Only valid after a successful replace;
    /// waits for any install in progress.
    pub async fn update_model_version(&self, version: ModelVersion) -> Result<(), VersionStoreError> {
        let _install = self.inner.store.install_lock().lock().await;
        self.inner.versions.set_version(version)
    }

    /// Absolute path handed to the classifier.
    pub fn model_file(&self) -> &Path {
        self.inner.store.active_model_path()
    }

    pub fn model_version(&self) -> Result<ModelVersion, VersionStoreError> {
        self.inner.versions.get_version()
    }

    pub fn status(&self) -> Result<ModelStatus, VersionStoreError> {
        let path = self.model_file().to_path_buf();
        let size = std::fs::metadata(&path).ok().map(|m| m.len());
        Ok(ModelStatus {
            version: self.model_version()?,
            model_present: size.is_some(),
            model_size_bytes: size,
            model_path: path,
            version_updated_at: self.inner.versions.updated_at()?,
            last_checked: self.inner.checker.last_checked(),
        })
    }

    /// Cancel every scheduled unit of work.
    pub fn shutdown(&self) {
        tracing::info!("model manager shutting down");
        self.inner.scheduler.cancel_all();
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<ModelManager> {
    weak.upgrade().map(|inner| ModelManager { inner })
}
