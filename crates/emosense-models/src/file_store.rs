//! On-disk home of the active model.
//!
//! The active file is only ever produced by `rename(2)` from the scratch
//! directory, which lives next to it on the same filesystem. Readers holding
//! the path therefore see either the old artifact or the new one, never a
//! partially written file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::StoreError;

const SCRATCH_EXTENSION: &str = "part";

/// Readable source of model bytes (the bundled default).
pub trait ByteSource: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>>;
}

/// Model asset shipped as a file next to the application.
#[derive(Debug, Clone)]
pub struct FileAsset {
    path: PathBuf,
}

impl FileAsset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileAsset {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

impl ByteSource for Vec<u8> {
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(self.as_slice()))
    }
}

/// Location and replacement rules for the active model file.
///
/// Clones share one install lock.
#[derive(Debug, Clone)]
pub struct ModelFileStore {
    active_path: PathBuf,
    scratch_dir: PathBuf,
    install_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ModelFileStore {
    pub fn new(active_path: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            active_path: active_path.into(),
            scratch_dir: scratch_dir.into(),
            install_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Held from journal stage through version commit, so the active file and
    /// the recorded version change together.
    pub fn install_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.install_lock
    }

    /// Fixed location of the usable model, stable for the process lifetime.
    pub fn active_model_path(&self) -> &Path {
        &self.active_path
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn has_active_model(&self) -> bool {
        self.active_path.is_file()
    }

    /// Create a uniquely named scratch file for `key`.
    pub fn create_scratch(&self, key: &str) -> Result<(PathBuf, File), StoreError> {
        fs::create_dir_all(&self.scratch_dir).map_err(|e| StoreError::io(&self.scratch_dir, e))?;
        let path = self
            .scratch_dir
            .join(format!("{key}-{}.{SCRATCH_EXTENSION}", uuid::Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        Ok((path, file))
    }

    /// Atomically move `temp_path` over the active model.
    ///
    /// On failure the previous active file is untouched.
    pub fn replace(&self, temp_path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = self.active_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        fs::rename(temp_path, &self.active_path).map_err(|source| StoreError::RenameFailed {
            from: temp_path.to_path_buf(),
            to: self.active_path.clone(),
            source,
        })?;

        // Persist the directory entry so the rename survives a crash.
        if let Some(parent) = self.active_path.parent() {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                tracing::warn!(dir = %parent.display(), error = %e, "directory sync failed");
            }
        }

        tracing::info!(
            from = %temp_path.display(),
            to = %self.active_path.display(),
            "active model replaced"
        );
        Ok(())
    }

    /// Install the bundled default if no active model exists.
    ///
    /// Returns `true` when the default was copied, `false` when a model was
    /// already present (whatever its version).
    pub fn ensure_default_present(&self, bundled: &dyn ByteSource) -> Result<bool, StoreError> {
        if self.has_active_model() {
            tracing::debug!(path = %self.active_path.display(), "active model present");
            return Ok(false);
        }

        let (temp_path, mut file) = self.create_scratch("bundled")?;
        let copied = bundled
            .open()
            .and_then(|mut src| io::copy(&mut src, &mut file))
            .and_then(|n| file.flush().and_then(|()| file.sync_all()).map(|()| n));
        drop(file);

        let bytes = match copied {
            Ok(n) => n,
            Err(e) => {
                discard_scratch(&temp_path);
                return Err(StoreError::io(&temp_path, e));
            }
        };

        if let Err(e) = self.replace(&temp_path) {
            discard_scratch(&temp_path);
            return Err(e);
        }
        tracing::info!(bytes, path = %self.active_path.display(), "bundled model installed");
        Ok(true)
    }

    /// Delete every scratch file left behind by an interrupted download.
    pub fn clear_scratch(&self) -> Result<usize, StoreError> {
        let entries = match fs::read_dir(&self.scratch_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(&self.scratch_dir, e)),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == SCRATCH_EXTENSION) {
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, dir = %self.scratch_dir.display(), "orphaned scratch files removed");
        }
        Ok(removed)
    }
}

/// Remove a scratch file, ignoring one that is already gone.
pub(crate) fn discard_scratch(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "scratch file removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch file"),
    }
}
