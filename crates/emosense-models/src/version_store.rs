//! Durable record of the installed model version.
//!
//! Besides the version itself the store keeps an install journal: the
//! download executor stages `(version, scratch path)` before renaming the
//! scratch file over the active model, and [`VersionStore::set_version`]
//! clears that record in the same transaction that writes the version.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::VersionStoreError;
use crate::types::ModelVersion;

const KEY_MODEL_VERSION: &str = "model_version";
const KEY_PENDING_INSTALL: &str = "pending_install";

/// An install that has been staged but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInstall {
    pub version: ModelVersion,
    pub scratch_path: PathBuf,
}

pub trait VersionStore: Send + Sync {
    /// Installed version; [`ModelVersion::BUNDLED`] if never written.
    fn get_version(&self) -> Result<ModelVersion, VersionStoreError>;

    /// Durably record `version` and drop any staged install.
    fn set_version(&self, version: ModelVersion) -> Result<(), VersionStoreError>;

    /// When the version was last written, if ever.
    fn updated_at(&self) -> Result<Option<DateTime<Utc>>, VersionStoreError>;

    fn stage(&self, pending: &PendingInstall) -> Result<(), VersionStoreError>;

    fn staged(&self) -> Result<Option<PendingInstall>, VersionStoreError>;

    fn clear_staged(&self) -> Result<(), VersionStoreError>;
}

/// SQLite-backed key-value store (`preferences` table).
pub struct SqliteVersionStore {
    conn: Mutex<Connection>,
}

impl SqliteVersionStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, VersionStoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, VersionStoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, VersionStoreError> {
        // A committed version must survive power loss before the task reports success.
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS preferences (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self, key: &str) -> Result<Option<(String, String)>, VersionStoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT value, updated_at FROM preferences WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }
}

fn upsert(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, Utc::now().to_rfc3339()],
    )
}

impl VersionStore for SqliteVersionStore {
    fn get_version(&self) -> Result<ModelVersion, VersionStoreError> {
        match self.read(KEY_MODEL_VERSION)? {
            None => Ok(ModelVersion::BUNDLED),
            Some((value, _)) => value
                .parse()
                .map(ModelVersion)
                .map_err(|_| VersionStoreError::Corrupt {
                    key: KEY_MODEL_VERSION,
                    value,
                }),
        }
    }

    fn set_version(&self, version: ModelVersion) -> Result<(), VersionStoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        upsert(&tx, KEY_MODEL_VERSION, &version.to_string())?;
        tx.execute(
            "DELETE FROM preferences WHERE key = ?1",
            params![KEY_PENDING_INSTALL],
        )?;
        tx.commit()?;
        tracing::debug!(%version, "model version recorded");
        Ok(())
    }

    fn updated_at(&self) -> Result<Option<DateTime<Utc>>, VersionStoreError> {
        let Some((_, updated_at)) = self.read(KEY_MODEL_VERSION)? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| VersionStoreError::Corrupt {
                key: KEY_MODEL_VERSION,
                value: updated_at,
            })
    }

    fn stage(&self, pending: &PendingInstall) -> Result<(), VersionStoreError> {
        let value = serde_json::to_string(pending).map_err(|e| VersionStoreError::Corrupt {
            key: KEY_PENDING_INSTALL,
            value: e.to_string(),
        })?;
        upsert(&self.conn(), KEY_PENDING_INSTALL, &value)?;
        Ok(())
    }

    fn staged(&self) -> Result<Option<PendingInstall>, VersionStoreError> {
        let Some((value, _)) = self.read(KEY_PENDING_INSTALL)? else {
            return Ok(None);
        };
        serde_json::from_str(&value)
            .map(Some)
            .map_err(|_| VersionStoreError::Corrupt {
                key: KEY_PENDING_INSTALL,
                value,
            })
    }

    fn clear_staged(&self) -> Result<(), VersionStoreError> {
        self.conn().execute(
            "DELETE FROM preferences WHERE key = ?1",
            params![KEY_PENDING_INSTALL],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(version: u32) -> PendingInstall {
        PendingInstall {
            version: ModelVersion(version),
            scratch_path: PathBuf::from("/tmp/download_5-x.part"),
        }
    }

    #[test]
    fn test_default_version_when_unset() {
        let store = SqliteVersionStore::open_in_memory().unwrap();
        assert_eq!(store.get_version().unwrap(), ModelVersion(1));
        assert!(store.updated_at().unwrap().is_none());
    }

    #[test]
    fn test_set_and_get_version() {
        let store = SqliteVersionStore::open_in_memory().unwrap();
        store.set_version(ModelVersion(7)).unwrap();
        assert_eq!(store.get_version().unwrap(), ModelVersion(7));
        assert!(store.updated_at().unwrap().is_some());
    }

    #[test]
    fn test_version_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.db");
        SqliteVersionStore::open(&path)
            .unwrap()
            .set_version(ModelVersion(12))
            .unwrap();
        let reopened = SqliteVersionStore::open(&path).unwrap();
        assert_eq!(reopened.get_version().unwrap(), ModelVersion(12));
    }

    #[test]
    fn test_set_version_clears_staged_install() {
        let store = SqliteVersionStore::open_in_memory().unwrap();
        store.stage(&pending(5)).unwrap();
        assert_eq!(store.staged().unwrap(), Some(pending(5)));

        store.set_version(ModelVersion(5)).unwrap();
        assert_eq!(store.staged().unwrap(), None);
    }

    #[test]
    fn test_clear_staged_keeps_version() {
        let store = SqliteVersionStore::open_in_memory().unwrap();
        store.set_version(ModelVersion(4)).unwrap();
        store.stage(&pending(5)).unwrap();
        store.clear_staged().unwrap();
        assert_eq!(store.staged().unwrap(), None);
        assert_eq!(store.get_version().unwrap(), ModelVersion(4));
    }

    #[test]
    fn test_corrupt_version_reported() {
        let store = SqliteVersionStore::open_in_memory().unwrap();
        upsert(&store.conn(), KEY_MODEL_VERSION, "not-a-number").unwrap();
        assert!(matches!(
            store.get_version(),
            Err(VersionStoreError::Corrupt { key: "model_version", .. })
        ));
    }
}
