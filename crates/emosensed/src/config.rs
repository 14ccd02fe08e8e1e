use anyhow::{Context, Result};
use emosense_models::ManagerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration: optional TOML file, then `EMOSENSE_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model shipped with the package, copied into place on first run.
    pub bundled_model: PathBuf,
    /// Model lifecycle settings (`[models]` table).
    pub models: ManagerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bundled_model: PathBuf::from("/usr/share/emosense/emotion_model.onnx"),
            models: ManagerConfig::default(),
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("EMOSENSE_DATA_DIR") {
            self.models.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("EMOSENSE_UPDATE_URL") {
            self.models.update_endpoint = url;
        }
        self.models.check_interval_secs = parse_or(
            lookup("EMOSENSE_CHECK_INTERVAL_SECS"),
            self.models.check_interval_secs,
        );
        if let Some(path) = lookup("EMOSENSE_BUNDLED_MODEL") {
            self.bundled_model = PathBuf::from(path);
        }
    }
}

/// `$EMOSENSE_CONFIG`, else `$XDG_CONFIG_HOME/emosense/config.toml`.
fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("EMOSENSE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()
        .map(|dir| dir.join("emosense/config.toml"))
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
