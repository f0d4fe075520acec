use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const APP_SETTINGS_KEY: &str = "appSettings";
pub const CURRENT_USER_KEY: &str = "currentUser";
pub const USER_FILTERS_KEY: &str = "userFilters";

const KNOWN_KEYS: [&str; 3] = [APP_SETTINGS_KEY, CURRENT_USER_KEY, USER_FILTERS_KEY];

/// Client-local key/value blobs, one JSON file per key.
///
/// Another process writing the same directory is noticed through
/// [`LocalStorage::poll_changes`]; writes made through this handle are not
/// reported back to it.
#[derive(Debug)]
pub struct LocalStorage {
    dir: PathBuf,
    seen: BTreeMap<String, Option<SystemTime>>,
}

impl LocalStorage {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let dir = data_dir.join("local");
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        info!(dir = %dir.display(), "opened local storage");

        let mut storage = Self {
            dir,
            seen: BTreeMap::new(),
        };
        for key in KNOWN_KEYS {
            let stamp = storage.modified(key);
            storage.seen.insert(key.to_string(), stamp);
        }
        Ok(storage)
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn modified(&self, key: &str) -> Option<SystemTime> {
        fs::metadata(self.path(key)).and_then(|m| m.modified()).ok()
    }

    /// Reads a key. Unreadable or malformed values are reported and treated
    /// as absent.
    #[tracing::instrument(skip(self))]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed reading local storage");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "failed parsing local storage value");
                None
            }
        }
    }

    #[tracing::instrument(skip(self, value))]
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> anyhow::Result<()> {
        let path = self.path(key);
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut temp, value)?;
        temp.flush()?;
        temp.persist(&path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

        debug!(key, "stored local value");
        self.remember(key);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => debug!(key, "removed local value"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed removing {}", path.display()));
            }
        }
        self.remember(key);
        Ok(())
    }

    fn remember(&mut self, key: &str) {
        let stamp = self.modified(key);
        self.seen.insert(key.to_string(), stamp);
    }

    /// Whether [`LocalStorage::poll_changes`] would report anything,
    /// without marking the changes as seen.
    pub fn has_changes(&self) -> bool {
        KNOWN_KEYS
            .iter()
            .any(|key| self.seen.get(*key).copied().flatten() != self.modified(key))
    }

    /// Resolves once another process has changed a key, checking every
    /// `every`.
    pub async fn wait_for_change(&self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.has_changes() {
                return;
            }
        }
    }

    /// Keys whose backing file changed since the last look.
    pub fn poll_changes(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for key in KNOWN_KEYS {
            let stamp = self.modified(key);
            let previous = self.seen.insert(key.to_string(), stamp);
            if previous.flatten() != stamp {
                changed.push(key.to_string());
            }
        }
        if !changed.is_empty() {
            debug!(?changed, "local storage changed externally");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn set_get_remove() {
        let temp = tempdir().expect("tempdir");
        let mut storage = LocalStorage::open(temp.path()).expect("open");

        assert_eq!(storage.get::<Vec<String>>(USER_FILTERS_KEY), None);
        storage
            .set(USER_FILTERS_KEY, &vec!["u1".to_string()])
            .expect("set");
        assert_eq!(
            storage.get::<Vec<String>>(USER_FILTERS_KEY),
            Some(vec!["u1".to_string()])
        );

        storage.remove(USER_FILTERS_KEY).expect("remove");
        storage.remove(USER_FILTERS_KEY).expect("remove twice");
        assert_eq!(storage.get::<Vec<String>>(USER_FILTERS_KEY), None);
    }

    #[test]
    fn malformed_value_reads_as_absent() {
        let temp = tempdir().expect("tempdir");
        let storage = LocalStorage::open(temp.path()).expect("open");
        fs::write(storage.path(USER_FILTERS_KEY), "{not json").expect("write");
        assert_eq!(storage.get::<Vec<String>>(USER_FILTERS_KEY), None);
    }

    #[test]
    fn only_foreign_writes_are_reported() {
        let temp = tempdir().expect("tempdir");
        let mut mine = LocalStorage::open(temp.path()).expect("open");
        let mut other = LocalStorage::open(temp.path()).expect("open");

        mine.set(APP_SETTINGS_KEY, &serde_json::json!({"language": "en"}))
            .expect("set");
        assert!(!mine.has_changes());
        assert!(mine.poll_changes().is_empty());

        assert!(other.has_changes());
        assert!(other.has_changes());
        assert_eq!(other.poll_changes(), vec![APP_SETTINGS_KEY.to_string()]);
        assert!(!other.has_changes());
        assert!(other.poll_changes().is_empty());
    }
}
