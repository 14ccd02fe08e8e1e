//! Device preconditions for background work (network, battery, storage).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const SYS_CLASS_NET: &str = "/sys/class/net";
const SYS_POWER_SUPPLY: &str = "/sys/class/power_supply";

/// Snapshot queries the scheduler uses to evaluate work constraints.
pub trait DeviceConditions: Send + Sync {
    fn network_connected(&self) -> bool;
    fn battery_low(&self) -> bool;
    fn storage_low(&self) -> bool;
}

/// Conditions that are always satisfied.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconstrained;

impl DeviceConditions for Unconstrained {
    fn network_connected(&self) -> bool {
        true
    }

    fn battery_low(&self) -> bool {
        false
    }

    fn storage_low(&self) -> bool {
        false
    }
}

/// Linux host conditions read from sysfs and `statvfs(3)`.
#[derive(Debug, Clone)]
pub struct SysfsConditions {
    data_dir: PathBuf,
    min_free_bytes: u64,
    low_battery_percent: u8,
}

impl SysfsConditions {
    pub fn new(data_dir: impl Into<PathBuf>, min_free_mb: u64, low_battery_percent: u8) -> Self {
        Self {
            data_dir: data_dir.into(),
            min_free_bytes: min_free_mb.saturating_mul(1024 * 1024),
            low_battery_percent,
        }
    }
}

impl DeviceConditions for SysfsConditions {
    fn network_connected(&self) -> bool {
        let Ok(entries) = std::fs::read_dir(SYS_CLASS_NET) else {
            // No sysfs (container, non-Linux): don't block work on an unknown.
            return true;
        };
        entries.flatten().any(|entry| {
            entry.file_name() != "lo"
                && read_trimmed(&entry.path().join("operstate")).as_deref() == Some("up")
        })
    }

    fn battery_low(&self) -> bool {
        let Ok(entries) = std::fs::read_dir(SYS_POWER_SUPPLY) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let dir = entry.path();
            if read_trimmed(&dir.join("type")).as_deref() != Some("Battery") {
                return false;
            }
            let capacity = read_trimmed(&dir.join("capacity")).and_then(|c| c.parse::<u8>().ok());
            let status = read_trimmed(&dir.join("status"));
            battery_is_low(capacity, status.as_deref(), self.low_battery_percent)
        })
    }

    fn storage_low(&self) -> bool {
        match free_bytes(&self.data_dir) {
            Some(free) => free < self.min_free_bytes,
            None => {
                tracing::debug!(dir = %self.data_dir.display(), "statvfs unavailable; assuming storage ok");
                false
            }
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn battery_is_low(capacity: Option<u8>, status: Option<&str>, threshold: u8) -> bool {
    match (capacity, status) {
        (Some(capacity), Some("Discharging")) => capacity <= threshold,
        _ => false,
    }
}

/// Free bytes available to unprivileged users on the filesystem holding `path`.
///
/// Walks up to the nearest existing ancestor so it works before the data
/// directory has been created.
fn free_bytes(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists())?;
    let c_path = CString::new(existing.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs is plain-old-data; zeroed is a valid initial value.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconstrained_always_satisfied() {
        let c = Unconstrained;
        assert!(c.network_connected());
        assert!(!c.battery_low());
        assert!(!c.storage_low());
    }

    #[test]
    fn test_battery_low_only_while_discharging() {
        assert!(battery_is_low(Some(10), Some("Discharging"), 15));
        assert!(battery_is_low(Some(15), Some("Discharging"), 15));
        assert!(!battery_is_low(Some(16), Some("Discharging"), 15));
        assert!(!battery_is_low(Some(5), Some("Charging"), 15));
        assert!(!battery_is_low(None, Some("Discharging"), 15));
    }

    #[test]
    fn test_free_bytes_of_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_bytes(dir.path()).is_some());
        // Not-yet-created subdirectory resolves to its existing ancestor.
        assert!(free_bytes(&dir.path().join("a/b/c")).is_some());
    }

    #[test]
    fn test_storage_low_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let roomy = SysfsConditions::new(dir.path(), 0, 15);
        assert!(!roomy.storage_low());
        let greedy = SysfsConditions::new(dir.path(), u64::MAX / (1024 * 1024), 15);
        assert!(greedy.storage_low());
    }
}
