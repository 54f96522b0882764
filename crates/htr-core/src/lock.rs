//! Cross-process device locks (the "kettle").
//!
//! Every running instance registers itself in `kettle.json` inside the lock
//! directory and lists the target ids it holds. All reads and writes of that
//! file happen under an exclusive `fs2` lock on `glock.lock`, so concurrent
//! `htr` invocations on one host never race on it.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const KETTLE_FILE: &str = "kettle.json";
pub const GLOBAL_LOCK_FILE: &str = "glock.lock";
pub const DEFAULT_LOCK_DIR: &str = ".htr";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock registry I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Lock registry is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One running instance and the targets it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KettleEntry {
    pub start_time: DateTime<Utc>,
    pub cwd: PathBuf,
    pub pid: u32,
    #[serde(default)]
    pub locks: Vec<String>,
}

pub type KettleData = BTreeMap<String, KettleEntry>;

#[derive(Debug, Clone)]
pub struct Kettle {
    dir: PathBuf,
    instance_id: String,
    stale_after: Option<Duration>,
}

impl Kettle {
    /// Kettle in `dir` with a fresh instance id.
    pub fn new(dir: impl Into<PathBuf>, stale_after: Option<Duration>) -> Self {
        Self::with_instance_id(dir, Uuid::new_v4().to_string(), stale_after)
    }

    pub fn with_instance_id(
        dir: impl Into<PathBuf>,
        instance_id: impl Into<String>,
        stale_after: Option<Duration>,
    ) -> Self {
        Self {
            dir: dir.into(),
            instance_id: instance_id.into(),
            stale_after,
        }
    }

    /// `~/.htr`, or `./.htr` when no home directory is known.
    pub fn default_dir() -> PathBuf {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_LOCK_DIR)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Add this instance to the registry with no locks.
    pub fn register(&self) -> Result<(), LockError> {
        self.with_registry(|data| {
            self.own_entry(data);
        })
    }

    /// Claim `target_id` unless another live instance holds it.
    pub fn acquire(&self, target_id: &str) -> Result<bool, LockError> {
        let acquired = self.with_registry(|data| self.claim(data, target_id))?;
        if acquired {
            debug!(target_id, instance = %self.instance_id, "Target locked");
        }
        Ok(acquired)
    }

    /// Claim the first free target in `target_ids`.
    pub fn acquire_from_list(&self, target_ids: &[String]) -> Result<Option<String>, LockError> {
        self.with_registry(|data| {
            target_ids
                .iter()
                .find(|id| self.claim(data, id))
                .cloned()
        })
    }

    pub fn release(&self, target_id: &str) -> Result<(), LockError> {
        self.with_registry(|data| {
            if let Some(entry) = data.get_mut(&self.instance_id) {
                entry.locks.retain(|id| id != target_id);
            }
        })?;
        debug!(target_id, instance = %self.instance_id, "Target released");
        Ok(())
    }

    /// Whether any live instance, this one included, holds `target_id`.
    pub fn is_held(&self, target_id: &str) -> Result<bool, LockError> {
        self.with_registry(|data| holder(data, target_id).is_some())
    }

    /// Drop this instance's entry and every lock it held.
    pub fn clean(&self) -> Result<(), LockError> {
        self.with_registry(|data| {
            data.remove(&self.instance_id);
        })?;
        info!(instance = %self.instance_id, "Kettle entry removed");
        Ok(())
    }

    pub fn entries(&self) -> Result<KettleData, LockError> {
        self.with_registry(|data| data.clone())
    }

    /// Human-readable table of live instances.
    pub fn info(&self) -> Result<String, LockError> {
        let data = self.entries()?;
        let mut out = String::new();
        let _ = writeln!(out, "Kettle: {}", self.dir.join(KETTLE_FILE).display());
        let _ = writeln!(
            out,
            "{:<36}  {:>7}  {:<20}  {:<24}  cwd",
            "instance", "pid", "started", "locks"
        );
        let _ = writeln!(out, "{}", "-".repeat(100));
        for (id, entry) in &data {
            let _ = writeln!(
                out,
                "{:<36}  {:>7}  {:<20}  {:<24}  {}",
                id,
                entry.pid,
                entry.start_time.format("%Y-%m-%d %H:%M:%S"),
                entry.locks.join(","),
                entry.cwd.display()
            );
        }
        Ok(out)
    }

    fn claim(&self, data: &mut KettleData, target_id: &str) -> bool {
        match holder(data, target_id) {
            Some(owner) if owner != self.instance_id => false,
            Some(_) => true,
            None => {
                self.own_entry(data).locks.push(target_id.to_string());
                true
            }
        }
    }

    fn own_entry<'d>(&self, data: &'d mut KettleData) -> &'d mut KettleEntry {
        data.entry(self.instance_id.clone()).or_insert_with(|| KettleEntry {
            start_time: Utc::now(),
            cwd: std::env::current_dir().unwrap_or_default(),
            pid: std::process::id(),
            locks: Vec::new(),
        })
    }

    /// Run `f` on the registry while holding the global lock, then persist.
    fn with_registry<T>(&self, f: impl FnOnce(&mut KettleData) -> T) -> Result<T, LockError> {
        fs::create_dir_all(&self.dir)?;
        let glock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(GLOBAL_LOCK_FILE))?;
        glock.lock_exclusive()?;

        let result = self.update(f);
        if let Err(e) = FileExt::unlock(&glock) {
            warn!(error = %e, "Failed to release global lock");
        }
        result
    }

    fn update<T>(&self, f: impl FnOnce(&mut KettleData) -> T) -> Result<T, LockError> {
        let mut data = self.load()?;
        self.prune(&mut data);
        let out = f(&mut data);
        self.store(&data)?;
        Ok(out)
    }

    fn load(&self) -> Result<KettleData, LockError> {
        let path = self.dir.join(KETTLE_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(KettleData::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(data) => Ok(data),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Discarding unreadable kettle");
                Ok(KettleData::new())
            }
        }
    }

    /// Write via a temp file and rename so readers never see half a file.
    fn store(&self, data: &KettleData) -> Result<(), LockError> {
        let tmp = self.dir.join(format!("{KETTLE_FILE}.{}.tmp", self.instance_id));
        {
            let file = File::create(&tmp)?;
            serde_json::to_writer_pretty(&file, data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(KETTLE_FILE))?;
        Ok(())
    }

    fn prune(&self, data: &mut KettleData) {
        let Some(stale_after) = self.stale_after else {
            return;
        };
        let Ok(stale_after) = chrono::Duration::from_std(stale_after) else {
            return;
        };
        let cutoff = Utc::now() - stale_after;
        data.retain(|id, entry| {
            let live = *id == self.instance_id || entry.start_time >= cutoff;
            if !live {
                warn!(instance = %id, locks = ?entry.locks, "Pruning stale kettle entry");
            }
            live
        });
    }
}

fn holder<'d>(data: &'d KettleData, target_id: &str) -> Option<&'d str> {
    data.iter()
        .find(|(_, entry)| entry.locks.iter().any(|id| id == target_id))
        .map(|(id, _)| id.as_str())
}

/// Registers an instance and removes its entry again when dropped.
#[derive(Debug)]
pub struct KettleGuard {
    kettle: Kettle,
}

impl KettleGuard {
    pub fn register(kettle: Kettle) -> Result<Self, LockError> {
        kettle.register()?;
        Ok(Self { kettle })
    }

    pub fn kettle(&self) -> &Kettle {
        &self.kettle
    }
}

impl Drop for KettleGuard {
    fn drop(&mut self) {
        if let Err(e) = self.kettle.clean() {
            warn!(error = %e, "Failed to clean kettle entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_acquire_release_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let kettle = Kettle::with_instance_id(dir.path(), "001", None);
        kettle.register().unwrap();

        let data = kettle.entries().unwrap();
        assert_eq!(data["001"].locks, Vec::<String>::new());
        assert_eq!(data["001"].pid, std::process::id());

        assert!(kettle.acquire("999").unwrap());
        assert!(kettle.is_held("999").unwrap());
        // Re-acquiring our own lock is fine.
        assert!(kettle.acquire("999").unwrap());
        assert_eq!(kettle.entries().unwrap()["001"].locks, vec!["999".to_string()]);

        kettle.release("999").unwrap();
        assert!(!kettle.is_held("999").unwrap());

        let got = kettle.acquire_from_list(&["999".to_string()]).unwrap();
        assert_eq!(got.as_deref(), Some("999"));

        let info = kettle.info().unwrap();
        assert!(info.contains("001"));
        assert!(info.contains("999"));

        kettle.clean().unwrap();
        assert!(kettle.entries().unwrap().is_empty());
    }

    #[test]
    fn test_other_instance_blocks_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let a = Kettle::with_instance_id(dir.path(), "a", None);
        let b = Kettle::with_instance_id(dir.path(), "b", None);
        assert!(a.acquire("T1").unwrap());
        assert!(!b.acquire("T1").unwrap());

        let ids = vec!["T1".to_string(), "T2".to_string()];
        assert_eq!(b.acquire_from_list(&ids).unwrap().as_deref(), Some("T2"));
        assert_eq!(a.acquire_from_list(&ids).unwrap().as_deref(), Some("T1"));
    }

    #[test]
    fn test_concurrent_acquire_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let kettle = Kettle::with_instance_id(dir.path(), format!("inst-{i}"), None);
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    kettle.acquire("shared").unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_stale_entries_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = KettleData::new();
        data.insert(
            "crashed".into(),
            KettleEntry {
                start_time: Utc::now() - chrono::Duration::hours(48),
                cwd: PathBuf::from("/tmp"),
                pid: 1,
                locks: vec!["T1".into()],
            },
        );
        fs::write(
            dir.path().join(KETTLE_FILE),
            serde_json::to_string(&data).unwrap(),
        )
        .unwrap();

        let strict = Kettle::with_instance_id(dir.path(), "new", None);
        assert!(!strict.acquire("T1").unwrap());

        let lenient =
            Kettle::with_instance_id(dir.path(), "new", Some(Duration::from_secs(3600)));
        assert!(lenient.acquire("T1").unwrap());
        assert!(!lenient.entries().unwrap().contains_key("crashed"));
    }

    #[test]
    fn test_guard_cleans_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let kettle = Kettle::with_instance_id(dir.path(), "g", None);
        {
            let guard = KettleGuard::register(kettle.clone()).unwrap();
            assert!(guard.kettle().acquire("T9").unwrap());
        }
        assert!(!kettle.is_held("T9").unwrap());
    }

    #[test]
    fn test_corrupt_kettle_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(KETTLE_FILE), "not json").unwrap();
        let kettle = Kettle::with_instance_id(dir.path(), "x", None);
        assert!(kettle.acquire("T1").unwrap());
    }
}
