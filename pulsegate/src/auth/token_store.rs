//! In-memory API token list with durable, transactional persistence.
//!
//! Mutations (create, rotate, delete) are serialized by a persistence lock. Each one writes the
//! resulting list to disk first and only then applies the change in memory, so a failed save
//! leaves the in-memory list untouched and readers never observe a token that is not also on
//! disk. Saving does not hold the record lock, so token validation never waits on disk I/O.

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::tokens::ApiTokenRecord;
use crate::crypto;
use crate::errors::Error;

/// Durable storage for token records.
pub trait TokenPersistence: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<ApiTokenRecord>>;
    fn save(&self, records: &[ApiTokenRecord]) -> anyhow::Result<()>;
}

/// JSON file storage, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileTokenPersistence {
    path: PathBuf,
}

impl FileTokenPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenPersistence for FileTokenPersistence {
    fn load(&self) -> anyhow::Result<Vec<ApiTokenRecord>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("parse {}", self.path.display()))
    }

    fn save(&self, records: &[ApiTokenRecord]) -> anyhow::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

        let body = serde_json::to_vec_pretty(records).context("serialize API tokens")?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = open_private(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)
}

/// Volatile storage, used when no data directory is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryTokenPersistence {
    saved: RwLock<Vec<ApiTokenRecord>>,
}

impl TokenPersistence for MemoryTokenPersistence {
    fn load(&self) -> anyhow::Result<Vec<ApiTokenRecord>> {
        Ok(self.saved.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, records: &[ApiTokenRecord]) -> anyhow::Result<()> {
        *self.saved.write().unwrap_or_else(PoisonError::into_inner) = records.to_vec();
        Ok(())
    }
}

pub struct TokenStore {
    records: RwLock<Vec<ApiTokenRecord>>,
    persistence: Arc<dyn TokenPersistence>,
    /// Held across snapshot, save and apply
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").field("count", &self.len()).finish()
    }
}

impl TokenStore {
    /// Empty store backed by `persistence` (nothing is read from it)
    pub fn new(persistence: Arc<dyn TokenPersistence>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            persistence,
            persist_lock: Mutex::new(()),
        }
    }

    /// Store initialized from whatever `persistence` holds
    pub fn load(persistence: Arc<dyn TokenPersistence>) -> anyhow::Result<Self> {
        let records = persistence.load()?;
        tracing::info!(count = records.len(), "Loaded API tokens");
        Ok(Self {
            records: RwLock::new(records),
            persistence,
            persist_lock: Mutex::new(()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ApiTokenRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ApiTokenRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persisting(&self) -> MutexGuard<'_, ()> {
        self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, newest first
    pub fn list(&self) -> Vec<ApiTokenRecord> {
        let mut records = self.read().clone();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn get(&self, id: &str) -> Option<ApiTokenRecord> {
        self.read().iter().find(|r| r.id == id).cloned()
    }

    /// Look up the live record matching `raw_token` and stamp its last use.
    ///
    /// Every stored hash is compared so the time taken does not depend on which record matched.
    pub fn validate(&self, raw_token: &str) -> Option<ApiTokenRecord> {
        self.validate_at(raw_token, Utc::now())
    }

    fn validate_at(&self, raw_token: &str, now: DateTime<Utc>) -> Option<ApiTokenRecord> {
        if raw_token.is_empty() {
            return None;
        }

        let mut records = self.write();
        let mut matched = None;
        for (idx, record) in records.iter().enumerate() {
            if crypto::matches_sha256(raw_token, &record.hash) && matched.is_none() {
                matched = Some(idx);
            }
        }

        let record = records.get_mut(matched?)?;
        if record.is_expired(now) {
            tracing::debug!(token_id = %record.id, "Rejected expired API token");
            return None;
        }
        record.last_used_at = Some(now);
        Some(record.clone())
    }

    /// Persist a list with `record` added, then add it in memory.
    ///
    /// This blocks on disk I/O; async callers run it on the blocking pool.
    pub fn insert(&self, record: ApiTokenRecord) -> Result<ApiTokenRecord, Error> {
        let _persisting = self.persisting();
        let mut snapshot = self.read().clone();
        snapshot.push(record.clone());
        self.persistence.save(&snapshot).map_err(persist_error)?;

        self.write().push(record.clone());
        tracing::info!(token_id = %record.id, name = %record.name, "Created API token");
        Ok(record)
    }

    /// Remove a record. Returns `Ok(None)` for unknown IDs.
    pub fn delete(&self, id: &str) -> Result<Option<ApiTokenRecord>, Error> {
        let _persisting = self.persisting();
        let mut snapshot = self.read().clone();
        let Some(idx) = snapshot.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        let removed = snapshot.remove(idx);
        self.persistence.save(&snapshot).map_err(persist_error)?;

        self.write().retain(|r| r.id != id);
        tracing::info!(token_id = %removed.id, "Deleted API token");
        Ok(Some(removed))
    }

    /// Replace the secret of `id` with `new_raw_token`, preserving name, scopes, org binding and
    /// expiry. The rotated record gets a new ID. Returns `Ok(None)` for unknown IDs.
    pub fn rotate(&self, id: &str, new_raw_token: &str) -> Result<Option<(ApiTokenRecord, ApiTokenRecord)>, Error> {
        let _persisting = self.persisting();
        let mut snapshot = self.read().clone();
        let Some(idx) = snapshot.iter().position(|r| r.id == id) else {
            return Ok(None);
        };

        let old = snapshot[idx].clone();
        let mut rotated = ApiTokenRecord::new(new_raw_token, &old.name, old.scopes.clone())?;
        rotated.org_ids = old.org_ids.clone();
        rotated.expires_at = old.expires_at;
        snapshot[idx] = rotated.clone();
        self.persistence.save(&snapshot).map_err(persist_error)?;

        // Mutations are serialized, so the record is still where the snapshot found it
        let mut records = self.write();
        if let Some(slot) = records.iter_mut().find(|r| r.id == id) {
            *slot = rotated.clone();
        }
        drop(records);
        tracing::info!(old_token_id = %old.id, token_id = %rotated.id, "Rotated API token");
        Ok(Some((old, rotated)))
    }
}

fn persist_error(e: anyhow::Error) -> Error {
    Error::Internal {
        operation: format!("persist API tokens: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::SCOPE_MONITORING_READ;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Persistence that fails on demand
    #[derive(Default)]
    struct FlakyPersistence {
        fail: AtomicBool,
        inner: MemoryTokenPersistence,
    }

    impl TokenPersistence for FlakyPersistence {
        fn load(&self) -> anyhow::Result<Vec<ApiTokenRecord>> {
            self.inner.load()
        }

        fn save(&self, records: &[ApiTokenRecord]) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.save(records)
        }
    }

    fn record(raw: &str) -> ApiTokenRecord {
        ApiTokenRecord::new(raw, "test", vec![SCOPE_MONITORING_READ.to_string()]).unwrap()
    }

    #[test]
    fn test_validate_matches_and_stamps_last_use() {
        let store = TokenStore::new(Arc::new(MemoryTokenPersistence::default()));
        store.insert(record("first-token")).unwrap();
        let second = store.insert(record("second-token")).unwrap();

        let found = store.validate("second-token").unwrap();
        assert_eq!(found.id, second.id);
        assert!(found.last_used_at.is_some());
        assert!(store.get(&second.id).unwrap().last_used_at.is_some());

        assert!(store.validate("wrong-token").is_none());
        assert!(store.validate("").is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let store = TokenStore::new(Arc::new(MemoryTokenPersistence::default()));
        let mut rec = record("expiring");
        rec.expires_at = Some(Utc::now() - Duration::minutes(1));
        store.insert(rec).unwrap();

        assert!(store.validate("expiring").is_none());
    }

    #[test]
    fn test_insert_rolls_back_on_persist_failure() {
        let persistence = Arc::new(FlakyPersistence::default());
        let store = TokenStore::new(persistence.clone());
        persistence.fail.store(true, Ordering::SeqCst);

        assert!(store.insert(record("never-saved")).is_err());
        assert!(store.is_empty());
        assert!(store.validate("never-saved").is_none());
    }

    #[test]
    fn test_delete_rolls_back_on_persist_failure() {
        let persistence = Arc::new(FlakyPersistence::default());
        let store = TokenStore::new(persistence.clone());
        let a = store.insert(record("a-token")).unwrap();
        let b = store.insert(record("b-token")).unwrap();

        persistence.fail.store(true, Ordering::SeqCst);
        assert!(store.delete(&a.id).is_err());

        // Nothing changed in memory, order included
        let ids: Vec<_> = store.records.read().unwrap().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

        persistence.fail.store(false, Ordering::SeqCst);
        assert!(store.delete(&a.id).unwrap().is_some());
        assert!(store.delete(&a.id).unwrap().is_none());
        assert_eq!(persistence.inner.load().unwrap().len(), 1);
    }

    #[test]
    fn test_rotate_preserves_metadata() {
        let store = TokenStore::new(Arc::new(MemoryTokenPersistence::default()));
        let mut rec = record("old-secret");
        rec.name = "ci runner".to_string();
        rec.org_ids = vec!["acme".to_string()];
        let expiry = Utc::now() + Duration::days(30);
        rec.expires_at = Some(expiry);
        let original = store.insert(rec).unwrap();

        let (old, rotated) = store.rotate(&original.id, "new-secret").unwrap().unwrap();
        assert_eq!(old.id, original.id);
        assert_ne!(rotated.id, original.id);
        assert_eq!(rotated.name, "ci runner");
        assert_eq!(rotated.scopes, original.scopes);
        assert_eq!(rotated.org_ids, vec!["acme"]);
        assert_eq!(rotated.expires_at, Some(expiry));

        assert!(store.validate("old-secret").is_none());
        assert_eq!(store.validate("new-secret").unwrap().id, rotated.id);
        assert!(store.rotate("missing", "x").unwrap().is_none());
    }

    #[test]
    fn test_rotate_rolls_back_on_persist_failure() {
        let persistence = Arc::new(FlakyPersistence::default());
        let store = TokenStore::new(persistence.clone());
        let original = store.insert(record("keep-me")).unwrap();

        persistence.fail.store(true, Ordering::SeqCst);
        assert!(store.rotate(&original.id, "lost").is_err());

        assert!(store.validate("keep-me").is_some());
        assert!(store.validate("lost").is_none());
    }

    /// Persistence whose save blocks until the test releases it
    struct GatedPersistence {
        started: std::sync::mpsc::SyncSender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl TokenPersistence for GatedPersistence {
        fn load(&self) -> anyhow::Result<Vec<ApiTokenRecord>> {
            Ok(Vec::new())
        }

        fn save(&self, _records: &[ApiTokenRecord]) -> anyhow::Result<()> {
            let _ = self.started.send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(())
        }
    }

    #[test]
    fn test_validate_does_not_wait_for_save() {
        let (started_tx, started_rx) = std::sync::mpsc::sync_channel(1);
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let store = Arc::new(TokenStore::new(Arc::new(GatedPersistence {
            started: started_tx,
            release: Mutex::new(release_rx),
        })));
        store.write().push(record("existing-token"));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || store.insert(record("pending-token")))
        };
        started_rx.recv().unwrap();

        // The save is in flight: existing tokens still validate, the new one is not visible yet
        assert!(store.validate("existing-token").is_some());
        assert!(store.validate("pending-token").is_none());

        release_tx.send(()).unwrap();
        writer.join().unwrap().unwrap();
        assert!(store.validate("pending-token").is_some());
    }

    #[test]
    fn test_file_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("api_tokens.json");
        let persistence = Arc::new(FileTokenPersistence::new(&path));

        assert!(persistence.load().unwrap().is_empty());

        let store = TokenStore::new(persistence.clone());
        let created = store.insert(record("persisted-token")).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("persisted-token"));

        let reloaded = TokenStore::load(persistence).unwrap();
        assert_eq!(reloaded.validate("persisted-token").unwrap().id, created.id);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_persistence_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_tokens.json");
        FileTokenPersistence::new(&path).save(&[record("x-token")]).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_tokens.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(TokenStore::load(Arc::new(FileTokenPersistence::new(&path))).is_err());
    }
}
