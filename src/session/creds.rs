//! Credential persistence
//!
//! Each instance keeps one opaque credential blob. Writes go to a primary
//! and a backup directory; reads fall back to the backup and restore the
//! primary when it is missing.

use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

/// Two-directory credential store
#[derive(Debug, Clone)]
pub struct CredsStore {
    primary: PathBuf,
    backup: PathBuf,
}

impl CredsStore {
    #[must_use]
    pub fn new<P: Into<PathBuf>, B: Into<PathBuf>>(primary: P, backup: B) -> Self {
        Self {
            primary: primary.into(),
            backup: backup.into(),
        }
    }

    fn blob_path(dir: &Path, instance_id: &str) -> PathBuf {
        // instance ids come from callers; keep the filename tame
        let safe: String = instance_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{safe}.creds"))
    }

    /// Persist a credential blob to both directories
    ///
    /// # Errors
    ///
    /// Returns error if the primary write fails; a failed backup write is
    /// only logged
    pub fn save(&self, instance_id: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.primary)?;
        fs::write(Self::blob_path(&self.primary, instance_id), bytes)?;

        if let Err(e) = fs::create_dir_all(&self.backup)
            .and_then(|()| fs::write(Self::blob_path(&self.backup, instance_id), bytes))
        {
            tracing::warn!(instance_id, error = %e, "credential backup write failed");
        }
        Ok(())
    }

    /// Load a credential blob, restoring the primary from backup when the
    /// primary copy is gone
    ///
    /// # Errors
    ///
    /// Returns error if a restore write fails
    pub fn load(&self, instance_id: &str) -> Result<Option<Vec<u8>>> {
        let primary = Self::blob_path(&self.primary, instance_id);
        if let Ok(bytes) = fs::read(&primary) {
            return Ok(Some(bytes));
        }

        let backup = Self::blob_path(&self.backup, instance_id);
        match fs::read(&backup) {
            Ok(bytes) => {
                tracing::warn!(instance_id, "restoring credentials from backup");
                fs::create_dir_all(&self.primary)?;
                fs::write(&primary, &bytes)?;
                Ok(Some(bytes))
            }
            Err(_) => Ok(None),
        }
    }

    /// Remove credential blobs not written to for the given duration
    ///
    /// Returns how many blobs were removed across both directories.
    ///
    /// # Errors
    ///
    /// Returns error if a directory listing or removal fails
    pub fn clean_older_than(&self, max_age: std::time::Duration) -> Result<u32> {
        let mut removed = 0;
        let cutoff = std::time::SystemTime::now() - max_age;

        for dir in [&self.primary, &self.backup] {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "creds") {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                if modified < cutoff {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Remove both copies of a credential blob
    ///
    /// # Errors
    ///
    /// Never fails for already-missing files
    pub fn wipe(&self, instance_id: &str) -> Result<()> {
        for dir in [&self.primary, &self.backup] {
            match fs::remove_file(Self::blob_path(dir, instance_id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (CredsStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CredsStore::new(dir.path().join("primary"), dir.path().join("backup"));
        (store, dir)
    }

    #[test]
    fn save_load_wipe_round_trip() {
        let (store, _dir) = store();
        assert!(store.load("inst-1").unwrap().is_none());

        store.save("inst-1", b"secret").unwrap();
        assert_eq!(store.load("inst-1").unwrap().unwrap(), b"secret");

        store.wipe("inst-1").unwrap();
        assert!(store.load("inst-1").unwrap().is_none());
        // wiping again is fine
        store.wipe("inst-1").unwrap();
    }

    #[test]
    fn load_restores_primary_from_backup() {
        let (store, dir) = store();
        store.save("inst-1", b"secret").unwrap();

        std::fs::remove_file(dir.path().join("primary").join("inst-1.creds")).unwrap();
        assert_eq!(store.load("inst-1").unwrap().unwrap(), b"secret");
        // primary is back
        assert!(dir.path().join("primary").join("inst-1.creds").exists());
    }

    #[test]
    fn clean_removes_only_stale_blobs() {
        let (store, _dir) = store();
        store.save("inst-1", b"secret").unwrap();

        // a generous age keeps a fresh blob
        assert_eq!(store.clean_older_than(std::time::Duration::from_secs(3600)).unwrap(), 0);
        assert!(store.load("inst-1").unwrap().is_some());

        std::thread::sleep(std::time::Duration::from_millis(50));
        let removed = store.clean_older_than(std::time::Duration::from_millis(1)).unwrap();
        // primary and backup copy
        assert_eq!(removed, 2);
        assert!(store.load("inst-1").unwrap().is_none());
    }

    #[test]
    fn hostile_instance_ids_cannot_escape_the_dir() {
        let (store, dir) = store();
        store.save("../evil", b"x").unwrap();
        assert!(dir.path().join("primary").join("___evil.creds").exists());
    }
}
