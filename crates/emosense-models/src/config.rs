use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::{Backoff, RetryPolicy};

/// Model lifecycle configuration, passed explicitly to [`ModelManager::new`](crate::ModelManager::new).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Private storage root; the model, scratch area and database live below it.
    pub data_dir: PathBuf,
    /// File name of the active model inside `<data_dir>/models`.
    pub model_file_name: String,
    /// Backend endpoint answering update checks.
    pub update_endpoint: String,
    /// Interval of the periodic update check.
    pub check_interval_secs: u64,
    /// Non-forced checks inside this window reuse the previous decision.
    pub recheck_after_secs: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Minimum spacing between progress updates of a running download.
    pub progress_interval_ms: u64,
    /// Attempts per unit of work before a transient failure becomes terminal.
    pub max_attempts: u32,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    /// How often a unit blocked on device constraints re-checks them.
    pub constraint_poll_secs: u64,
    /// Storage is "low" below this many free mebibytes.
    pub min_free_storage_mb: u64,
    /// Battery is "low" at or below this percentage while discharging.
    pub low_battery_percent: u8,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            model_file_name: "emotion_model.onnx".to_string(),
            update_endpoint: "http://localhost:8080/api/model/update".to_string(),
            check_interval_secs: 24 * 60 * 60,
            recheck_after_secs: 60 * 60,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            progress_interval_ms: 100,
            max_attempts: 3,
            backoff_initial_secs: 30,
            backoff_max_secs: 5 * 60 * 60,
            constraint_poll_secs: 60,
            min_free_storage_mb: 200,
            low_battery_percent: 15,
        }
    }
}

impl ManagerConfig {
    /// Configuration rooted at `data_dir`, all other values default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn model_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Fixed location of the model handed to the classifier.
    pub fn active_model_path(&self) -> PathBuf {
        self.model_dir().join(&self.model_file_name)
    }

    /// Download staging area. Same filesystem as the active model so rename stays atomic.
    pub fn scratch_dir(&self) -> PathBuf {
        self.model_dir().join(".scratch")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("models.db")
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn recheck_after(&self) -> Duration {
        Duration::from_secs(self.recheck_after_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn constraint_poll(&self) -> Duration {
        Duration::from_secs(self.constraint_poll_secs)
    }

    /// Retry policy applied to update checks and downloads.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(self.backoff_initial_secs),
                max: Duration::from_secs(self.backoff_max_secs),
            },
            max_attempts: self.max_attempts.max(1),
        }
    }
}

/// `$XDG_DATA_HOME/emosense`, falling back to `~/.local/share/emosense`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("emosense")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let config = ManagerConfig::with_data_dir("/var/lib/emo");
        assert_eq!(config.model_dir(), PathBuf::from("/var/lib/emo/models"));
        assert_eq!(
            config.active_model_path(),
            PathBuf::from("/var/lib/emo/models/emotion_model.onnx")
        );
        assert_eq!(config.scratch_dir(), PathBuf::from("/var/lib/emo/models/.scratch"));
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/emo/models.db"));
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.check_interval(), Duration::from_secs(86_400));
        assert_eq!(config.progress_interval(), Duration::from_millis(100));
        assert_eq!(config.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ManagerConfig = toml::from_str(
            r#"
            data_dir = "/data/emo"
            check_interval_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/data/emo"));
        assert_eq!(config.check_interval_secs, 3600);
        assert_eq!(config.model_file_name, "emotion_model.onnx");
        assert_eq!(config.read_timeout_secs, 30);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let config = ManagerConfig {
            max_attempts: 0,
            ..ManagerConfig::default()
        };
        assert_eq!(config.retry_policy().max_attempts, 1);
    }
}
