//! emosense-models: model lifecycle for the on-device emotion classifier.
//!
//! Keeps exactly one complete model artifact at a fixed path, records its
//! version, checks a backend for newer versions and installs them through a
//! cancellable background download followed by an atomic rename.

pub mod checker;
pub mod conditions;
pub mod config;
pub mod download;
pub mod error;
pub mod file_store;
pub mod manager;
pub mod scheduler;
pub mod types;
pub mod version_store;

#[cfg(test)]
mod testutil;

pub use checker::{HttpUpdateBackend, UpdateBackend, UpdateChecker};
pub use conditions::{DeviceConditions, SysfsConditions, Unconstrained};
pub use config::{default_data_dir, ManagerConfig};
pub use error::{CheckError, DownloadError, ManagerError, StoreError, VersionStoreError};
pub use file_store::{ByteSource, FileAsset, ModelFileStore};
pub use manager::{Collaborators, ModelManager, ModelStatus};
pub use scheduler::{Scheduler, WorkInfo, WorkState};
pub use types::{CancelFlag, DownloadTask, ModelVersion, UpdateDecision, UpdateInfo};
pub use version_store::{SqliteVersionStore, VersionStore};
