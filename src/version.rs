//! Build Version Manager - Persisted Build Counter
//!
//! An unreadable counter must never block a build: any read failure counts
//! as "no prior version" and numbering restarts above zero.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct BuildVersionManager {
    path: PathBuf,
    current: u64,
}

impl BuildVersionManager {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            current: 0,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Adopt an explicit build-number override without touching the counter.
    pub fn set_current(&mut self, version: u64) {
        self.current = version;
    }

    /// Persisted value (0 on any read failure, including a missing file)
    /// plus one. The result becomes the manager's current version.
    pub fn get_next_version(&mut self) -> u64 {
        let stored = fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .unwrap_or(0);
        self.current = stored + 1;
        self.current
    }

    /// Overwrite the persisted value with the current in-memory version.
    pub fn save_current_version(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, self.current.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_counter_file_yields_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = BuildVersionManager::new(&dir.path().join("BUILD_VERSION"));
        assert_eq!(manager.get_next_version(), 1);
    }

    #[test]
    fn saved_version_increments_on_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BUILD_VERSION");

        let mut manager = BuildVersionManager::new(&path);
        manager.set_current(7);
        manager.save_current_version().unwrap();

        let mut next_run = BuildVersionManager::new(&path);
        assert_eq!(next_run.get_next_version(), 8);
    }

    #[test]
    fn garbage_counter_file_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BUILD_VERSION");
        fs::write(&path, "not a number").unwrap();

        let mut manager = BuildVersionManager::new(&path);
        assert_eq!(manager.get_next_version(), 1);
    }

    #[test]
    fn override_does_not_touch_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BUILD_VERSION");
        fs::write(&path, "41").unwrap();

        let mut manager = BuildVersionManager::new(&path);
        manager.set_current(900);
        assert_eq!(manager.current(), 900);
        assert_eq!(fs::read_to_string(&path).unwrap(), "41");
    }
}
