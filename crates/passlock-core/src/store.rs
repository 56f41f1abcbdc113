//! Encrypted store adapter.
//!
//! One store file: a fixed-size cleartext header (format version, derivation
//! parameters, salt, key-verification tag, last-rotation timestamp) followed
//! by a JSON record table. Each record payload is sealed individually with a
//! fresh nonce and the record id as associated data, so a ciphertext cannot
//! be reattached to another id.
//!
//! Opening checks the key-verification tag in constant time and fails with
//! `StoreError::Auth` before touching any record. A tampered record fails
//! `get`/`list` with `StoreError::Integrity`, keeping "wrong master key" and
//! "corrupted record" distinguishable for the session manager.
//!
//! All writes go through a staging file plus atomic rename; key rotation
//! re-encrypts everything into a shadow file and commits with one rename, so
//! a crash mid-rotation leaves the original store untouched.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, NONCE_LEN};
use crate::error::{StoreError, StoreResult};
use crate::kdf::{KdfAlgorithm, KdfParams, MasterKey, SALT_LEN};
use crate::record::{CredentialRecord, RecordMetadata, RecordPayload, StoredRecord};

pub const STORE_MAGIC: &[u8] = b"PLOCK01\0";
pub const STORE_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;

/// Cleartext parameter record at the head of the store file. Contains no
/// secret material; readable without any key.
#[derive(Debug, Clone)]
pub struct StoreHeader {
    pub version: u32,
    pub params: KdfParams,
    pub key_check: [u8; 32],
    pub rotated_at: i64,
}

impl StoreHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..STORE_MAGIC.len()].copy_from_slice(STORE_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.params.algorithm.id().to_le_bytes());
        buf[16..20].copy_from_slice(&self.params.time_cost.to_le_bytes());
        buf[20..24].copy_from_slice(&self.params.memory_kib.to_le_bytes());
        buf[24..28].copy_from_slice(&self.params.parallelism.to_le_bytes());
        buf[28..60].copy_from_slice(&self.params.salt);
        buf[60..92].copy_from_slice(&self.key_check);
        buf[92..100].copy_from_slice(&self.rotated_at.to_le_bytes());
        // remaining bytes stay zero
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> StoreResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::Format("truncated header".into()));
        }
        if &buf[..STORE_MAGIC.len()] != STORE_MAGIC {
            return Err(StoreError::Format("bad magic".into()));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().expect("slice length"));
        if version != STORE_VERSION {
            return Err(StoreError::Format(format!(
                "unsupported store version {version}"
            )));
        }
        let algorithm = KdfAlgorithm::from_id(u32::from_le_bytes(
            buf[12..16].try_into().expect("slice length"),
        ))?;
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[28..60]);
        let mut key_check = [0u8; 32];
        key_check.copy_from_slice(&buf[60..92]);
        Ok(Self {
            version,
            params: KdfParams {
                algorithm,
                time_cost: u32::from_le_bytes(buf[16..20].try_into().expect("slice length")),
                memory_kib: u32::from_le_bytes(buf[20..24].try_into().expect("slice length")),
                parallelism: u32::from_le_bytes(buf[24..28].try_into().expect("slice length")),
                salt,
            },
            key_check,
            rotated_at: i64::from_le_bytes(buf[92..100].try_into().expect("slice length")),
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordTable {
    records: BTreeMap<Uuid, StoredRecord>,
}

struct StoreInner {
    header: StoreHeader,
    key: MasterKey,
    records: BTreeMap<Uuid, StoredRecord>,
}

/// Handle to an open (decryptable) store. All access is serialized through
/// an internal lock; rotation holds it exclusively and flags concurrent
/// callers off with `StoreError::Busy`.
pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
    rotating: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create a new store file. Fails if one already exists at `path`.
    pub fn create(path: impl AsRef<Path>, key: &MasterKey, params: KdfParams) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        params.validate()?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(path));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let header = StoreHeader {
            version: STORE_VERSION,
            params,
            key_check: key.verification_tag(),
            rotated_at: Utc::now().timestamp(),
        };
        let store = Self {
            path,
            inner: Mutex::new(StoreInner {
                header,
                key: key.clone(),
                records: BTreeMap::new(),
            }),
            rotating: AtomicBool::new(false),
        };
        {
            let inner = store.inner.lock();
            store.persist(&inner)?;
        }
        info!(path = %store.path.display(), "created credential store");
        Ok(store)
    }

    /// Read only the cleartext header, without any key.
    pub fn read_header(path: impl AsRef<Path>) -> StoreResult<StoreHeader> {
        let bytes = fs::read(path.as_ref())?;
        StoreHeader::from_bytes(&bytes)
    }

    /// Open an existing store. Fails fast with `StoreError::Auth` if the
    /// key-verification tag does not match, before any record is touched.
    pub fn open(path: impl AsRef<Path>, key: &MasterKey) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        cleanup_stale_files(&path);

        let bytes = fs::read(&path)?;
        let header = StoreHeader::from_bytes(&bytes)?;
        if !key.matches_tag(&header.key_check) {
            return Err(StoreError::Auth);
        }
        let table: RecordTable = serde_json::from_slice(&bytes[HEADER_SIZE..])?;
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner {
                header,
                key: key.clone(),
                records: table.records,
            }),
            rotating: AtomicBool::new(false),
        })
    }

    /// Constant-time check of a candidate key against the stored tag.
    pub fn check_key(&self, key: &MasterKey) -> StoreResult<()> {
        let inner = self.inner.lock();
        if key.matches_tag(&inner.header.key_check) {
            Ok(())
        } else {
            Err(StoreError::Auth)
        }
    }

    pub fn kdf_params(&self) -> KdfParams {
        self.inner.lock().header.params.clone()
    }

    pub fn rotated_at(&self) -> DateTime<Utc> {
        let ts = self.inner.lock().header.rotated_at;
        DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub(crate) fn master_key(&self) -> MasterKey {
        self.inner.lock().key.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a record. Timestamps are persisted exactly as given.
    pub fn put(&self, record: &CredentialRecord) -> StoreResult<()> {
        let mut inner = self.lock_excluding_rotation()?;
        let stored = seal_record(&inner.key, record)?;
        inner.records.insert(record.id, stored);
        self.persist(&inner)
    }

    pub fn get(&self, id: Uuid) -> StoreResult<CredentialRecord> {
        let inner = self.lock_excluding_rotation()?;
        let stored = inner.records.get(&id).ok_or(StoreError::NotFound(id))?;
        open_record(&inner.key, id, stored)
    }

    pub fn delete(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock_excluding_rotation()?;
        if inner.records.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        self.persist(&inner)
    }

    pub fn delete_all(&self) -> StoreResult<()> {
        let mut inner = self.lock_excluding_rotation()?;
        inner.records.clear();
        self.persist(&inner)
    }

    /// Metadata of every record, ordered by label. A fresh, finite sequence
    /// per call. Labels live inside the ciphertext, so ordering requires
    /// decrypting each record; a tampered one fails the whole listing with
    /// `StoreError::Integrity`.
    pub fn list(&self) -> StoreResult<impl Iterator<Item = RecordMetadata>> {
        let inner = self.lock_excluding_rotation()?;
        let mut entries = Vec::with_capacity(inner.records.len());
        for (id, stored) in &inner.records {
            entries.push(open_record(&inner.key, *id, stored)?.metadata());
        }
        entries.sort_by(|a, b| {
            a.label
                .to_lowercase()
                .cmp(&b.label.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(entries.into_iter())
    }

    /// Case-insensitive substring search over labels.
    pub fn search(&self, query: &str) -> StoreResult<Vec<RecordMetadata>> {
        let needle = query.to_lowercase();
        Ok(self
            .list()?
            .filter(|m| m.label.to_lowercase().contains(&needle))
            .collect())
    }

    /// Decrypt every record, for backup export.
    pub fn export_all(&self) -> StoreResult<Vec<CredentialRecord>> {
        let inner = self.lock_excluding_rotation()?;
        let mut out = Vec::with_capacity(inner.records.len());
        for (id, stored) in &inner.records {
            out.push(open_record(&inner.key, *id, stored)?);
        }
        Ok(out)
    }

    /// Re-encrypt every record under `new_key`/`new_params` and atomically
    /// swap the store file. On any failure the original file is untouched.
    /// Concurrent operations fail with `StoreError::Busy` for the duration.
    pub fn rotate(&self, new_key: &MasterKey, new_params: KdfParams) -> StoreResult<()> {
        new_params.validate()?;
        if self
            .rotating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StoreError::Busy);
        }
        let _guard = RotationGuard(&self.rotating);

        let mut inner = self.inner.lock();

        // Decrypt everything with the old key first; abort before any write
        // if a record is corrupt.
        let mut reencrypted = BTreeMap::new();
        for (id, stored) in &inner.records {
            let record = open_record(&inner.key, *id, stored)?;
            reencrypted.insert(*id, seal_record(new_key, &record)?);
        }

        let new_header = StoreHeader {
            version: STORE_VERSION,
            params: new_params,
            key_check: new_key.verification_tag(),
            rotated_at: Utc::now().timestamp(),
        };

        // Shadow write, then one rename as the commit point.
        let shadow = rotation_shadow_path(&self.path);
        write_file_durable(&shadow, &new_header, &reencrypted)?;
        fs::rename(&shadow, &self.path)?;
        if let Some(parent) = self.path.parent() {
            fsync_dir(parent)?;
        }

        inner.header = new_header;
        inner.key = new_key.clone();
        inner.records = reencrypted;
        info!(path = %self.path.display(), "store key rotated");
        Ok(())
    }

    // ── Private helpers ─────────────────────────────────────────────────────

    fn not_rotating(&self) -> StoreResult<()> {
        if self.rotating.load(Ordering::SeqCst) {
            Err(StoreError::Busy)
        } else {
            Ok(())
        }
    }

    /// Acquire the store lock, refusing while a rotation is in flight. The
    /// flag is re-checked after acquisition so an operation that raced the
    /// start of a rotation fails with `Busy` instead of queuing behind it.
    fn lock_excluding_rotation(&self) -> StoreResult<MutexGuard<'_, StoreInner>> {
        self.not_rotating()?;
        let inner = self.inner.lock();
        self.not_rotating()?;
        Ok(inner)
    }

    fn persist(&self, inner: &StoreInner) -> StoreResult<()> {
        let staging = self
            .path
            .with_file_name(format!("{}.staging-{}", file_name(&self.path), Uuid::new_v4()));
        write_file_durable(&staging, &inner.header, &inner.records)?;
        fs::rename(&staging, &self.path)?;
        if let Some(parent) = self.path.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }
}

struct RotationGuard<'a>(&'a AtomicBool);

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn seal_record(key: &MasterKey, record: &CredentialRecord) -> StoreResult<StoredRecord> {
    let payload = RecordPayload::from_record(record);
    let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
    let nonce = crypto::generate_nonce();
    let ciphertext = crypto::seal(key.as_bytes(), &nonce, record.id.as_bytes(), &plaintext)
        .map_err(|_| StoreError::Crypto)?;
    Ok(StoredRecord {
        created_at: record.created_at,
        modified_at: record.modified_at,
        nonce: general_purpose::STANDARD.encode(nonce),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
    })
}

fn open_record(key: &MasterKey, id: Uuid, stored: &StoredRecord) -> StoreResult<CredentialRecord> {
    let nonce_bytes = general_purpose::STANDARD
        .decode(&stored.nonce)
        .map_err(|_| StoreError::Integrity(id))?;
    let nonce: [u8; NONCE_LEN] = nonce_bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Integrity(id))?;
    let ciphertext = general_purpose::STANDARD
        .decode(&stored.ciphertext)
        .map_err(|_| StoreError::Integrity(id))?;

    let plaintext = Zeroizing::new(
        crypto::open(key.as_bytes(), &nonce, id.as_bytes(), &ciphertext)
            .map_err(|_| StoreError::Integrity(id))?,
    );
    let payload: RecordPayload =
        serde_json::from_slice(&plaintext).map_err(|_| StoreError::Integrity(id))?;
    Ok(CredentialRecord {
        id,
        label: payload.label.clone(),
        username: payload.username.clone(),
        secret: payload.secret.clone(),
        notes: payload.notes.clone(),
        created_at: stored.created_at,
        modified_at: stored.modified_at,
    })
}

fn write_file_durable(
    path: &Path,
    header: &StoreHeader,
    records: &BTreeMap<Uuid, StoredRecord>,
) -> StoreResult<()> {
    let table = RecordTable {
        records: records.clone(),
    };
    let body = serde_json::to_vec(&table)?;
    // Owner-only from the first byte; no window with default permissions.
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(&header.to_bytes())?;
    file.write_all(&body)?;
    file.sync_all()?;
    Ok(())
}

fn rotation_shadow_path(path: &Path) -> PathBuf {
    path.with_file_name(format!("{}.rotate", file_name(path)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string())
}

/// Remove leftover staging/shadow files from a previous crash. A shadow file
/// that was never renamed over the store is an aborted rotation; the original
/// remains the source of truth.
fn cleanup_stale_files(path: &Path) {
    let name = file_name(path);
    let Some(parent) = path.parent() else { return };
    let Ok(entries) = fs::read_dir(parent) else { return };
    for entry in entries.flatten() {
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        if entry_name.starts_with(&format!("{name}.staging-"))
            || entry_name == format!("{name}.rotate")
        {
            warn!(file = %entry.path().display(), "removing stale store file");
            let _ = fs::remove_file(entry.path());
        }
    }
}

fn fsync_dir(path: &Path) -> StoreResult<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf;
    use tempfile::tempdir;

    fn test_params() -> KdfParams {
        // Cheap costs so tests stay fast; validity is unaffected.
        let mut params = KdfParams::generate();
        params.memory_kib = 64;
        params.time_cost = 1;
        params.parallelism = 1;
        params
    }

    fn open_test_store(dir: &Path) -> (Store, MasterKey) {
        let params = test_params();
        let key = kdf::derive("test passphrase", &params).unwrap();
        let store = Store::create(dir.join("store.plock"), &key, params).unwrap();
        (store, key)
    }

    #[test]
    fn create_put_get_round_trip() {
        let dir = tempdir().unwrap();
        let (store, key) = open_test_store(dir.path());

        let mut record = CredentialRecord::new("example.com", "alice", "hunter2");
        record.notes = Some("work account".into());
        store.put(&record).unwrap();

        let fetched = store.get(record.id).unwrap();
        assert_eq!(fetched, record);

        // Survives reopen.
        drop(store);
        let reopened = Store::open(dir.path().join("store.plock"), &key).unwrap();
        assert_eq!(reopened.get(record.id).unwrap(), record);
    }

    #[test]
    fn wrong_key_fails_auth_at_open() {
        let dir = tempdir().unwrap();
        let (store, _key) = open_test_store(dir.path());
        let params = store.kdf_params();
        drop(store);

        let wrong = kdf::derive("not the passphrase", &params).unwrap();
        let err = Store::open(dir.path().join("store.plock"), &wrong).unwrap_err();
        assert!(matches!(err, StoreError::Auth));
    }

    #[test]
    fn get_missing_record_is_not_found() {
        let dir = tempdir().unwrap();
        let (store, _) = open_test_store(dir.path());
        let id = Uuid::new_v4();
        assert!(matches!(store.get(id), Err(StoreError::NotFound(got)) if got == id));
    }

    #[test]
    fn tampered_ciphertext_fails_integrity() {
        let dir = tempdir().unwrap();
        let (store, _) = open_test_store(dir.path());
        let record = CredentialRecord::new("example.com", "alice", "hunter2");
        store.put(&record).unwrap();

        {
            let mut inner = store.inner.lock();
            let stored = inner.records.get_mut(&record.id).unwrap();
            let mut raw = general_purpose::STANDARD.decode(&stored.ciphertext).unwrap();
            raw[0] ^= 0x01;
            stored.ciphertext = general_purpose::STANDARD.encode(raw);
        }
        assert!(matches!(
            store.get(record.id),
            Err(StoreError::Integrity(id)) if id == record.id
        ));
        assert!(matches!(store.list(), Err(StoreError::Integrity(_))));
    }

    #[test]
    fn ciphertext_bound_to_record_id() {
        let dir = tempdir().unwrap();
        let (store, _) = open_test_store(dir.path());
        let a = CredentialRecord::new("a.com", "alice", "secret-a");
        let b = CredentialRecord::new("b.com", "bob", "secret-b");
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        // Swap ciphertexts between the two records.
        {
            let mut inner = store.inner.lock();
            let sa = inner.records.get(&a.id).unwrap().clone();
            let sb = inner.records.get(&b.id).unwrap().clone();
            inner.records.insert(a.id, sb);
            inner.records.insert(b.id, sa);
        }
        assert!(matches!(store.get(a.id), Err(StoreError::Integrity(_))));
        assert!(matches!(store.get(b.id), Err(StoreError::Integrity(_))));
    }

    #[test]
    fn list_is_sorted_by_label_and_restartable() {
        let dir = tempdir().unwrap();
        let (store, _) = open_test_store(dir.path());
        for (label, user) in [("zeta.org", "z"), ("alpha.com", "a"), ("Mid.net", "m")] {
            store.put(&CredentialRecord::new(label, user, "pw")).unwrap();
        }
        let labels: Vec<String> = store.list().unwrap().map(|m| m.label).collect();
        assert_eq!(labels, vec!["alpha.com", "Mid.net", "zeta.org"]);

        // A second call yields the full sequence again.
        assert_eq!(store.list().unwrap().count(), 3);
    }

    #[test]
    fn search_filters_by_label_substring() {
        let dir = tempdir().unwrap();
        let (store, _) = open_test_store(dir.path());
        store.put(&CredentialRecord::new("github.com", "a", "p")).unwrap();
        store.put(&CredentialRecord::new("gitlab.com", "b", "p")).unwrap();
        store.put(&CredentialRecord::new("example.org", "c", "p")).unwrap();

        let hits = store.search("GIT").unwrap();
        assert_eq!(hits.len(), 2);
        assert!(store.search("bitbucket").unwrap().is_empty());
    }

    #[test]
    fn delete_and_delete_all() {
        let dir = tempdir().unwrap();
        let (store, _) = open_test_store(dir.path());
        let record = CredentialRecord::new("example.com", "alice", "pw");
        store.put(&record).unwrap();
        store.delete(record.id).unwrap();
        assert!(matches!(store.delete(record.id), Err(StoreError::NotFound(_))));

        store.put(&CredentialRecord::new("x", "y", "z")).unwrap();
        store.put(&CredentialRecord::new("p", "q", "r")).unwrap();
        store.delete_all().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn operations_fail_busy_while_rotation_flag_is_set() {
        let dir = tempdir().unwrap();
        let (store, _) = open_test_store(dir.path());
        let record = CredentialRecord::new("example.com", "alice", "hunter2");
        store.put(&record).unwrap();

        // Hold the store in the rotating state, as `rotate` does for its
        // duration, and verify nothing queues behind it.
        store.rotating.store(true, Ordering::SeqCst);
        assert!(matches!(store.put(&record), Err(StoreError::Busy)));
        assert!(matches!(store.get(record.id), Err(StoreError::Busy)));
        assert!(matches!(store.delete(record.id), Err(StoreError::Busy)));
        assert!(matches!(store.delete_all(), Err(StoreError::Busy)));
        assert!(matches!(store.list().map(|_| ()), Err(StoreError::Busy)));
        assert!(matches!(store.export_all(), Err(StoreError::Busy)));

        store.rotating.store(false, Ordering::SeqCst);
        assert_eq!(store.get(record.id).unwrap(), record);
    }

    #[test]
    fn rotation_reencrypts_under_new_key() {
        let dir = tempdir().unwrap();
        let (store, old_key) = open_test_store(dir.path());
        let record = CredentialRecord::new("example.com", "alice", "hunter2");
        store.put(&record).unwrap();

        let new_params = test_params();
        let new_key = kdf::derive("new passphrase", &new_params).unwrap();
        store.rotate(&new_key, new_params).unwrap();

        // Live handle keeps working.
        assert_eq!(store.get(record.id).unwrap(), record);
        drop(store);

        let path = dir.path().join("store.plock");
        assert!(matches!(Store::open(&path, &old_key), Err(StoreError::Auth)));
        let reopened = Store::open(&path, &new_key).unwrap();
        assert_eq!(reopened.get(record.id).unwrap(), record);
    }

    #[test]
    fn rotation_aborts_on_corrupt_record_leaving_store_valid() {
        let dir = tempdir().unwrap();
        let (store, old_key) = open_test_store(dir.path());
        let record = CredentialRecord::new("example.com", "alice", "hunter2");
        store.put(&record).unwrap();

        // Corrupt in memory only; the file on disk still holds the good copy.
        {
            let mut inner = store.inner.lock();
            let stored = inner.records.get_mut(&record.id).unwrap();
            stored.ciphertext = general_purpose::STANDARD.encode(b"garbage");
        }
        let new_params = test_params();
        let new_key = kdf::derive("new passphrase", &new_params).unwrap();
        assert!(matches!(
            store.rotate(&new_key, new_params),
            Err(StoreError::Integrity(_))
        ));
        drop(store);

        let reopened = Store::open(dir.path().join("store.plock"), &old_key).unwrap();
        assert_eq!(reopened.get(record.id).unwrap(), record);
    }

    #[test]
    fn orphaned_shadow_is_discarded_at_open() {
        let dir = tempdir().unwrap();
        let (store, key) = open_test_store(dir.path());
        let record = CredentialRecord::new("example.com", "alice", "hunter2");
        store.put(&record).unwrap();
        drop(store);

        // Simulate a crash after the shadow write, before the swap.
        let path = dir.path().join("store.plock");
        let shadow = rotation_shadow_path(&path);
        fs::write(&shadow, b"half-finished rotation").unwrap();

        let reopened = Store::open(&path, &key).unwrap();
        assert_eq!(reopened.get(record.id).unwrap(), record);
        assert!(!shadow.exists());
    }

    #[test]
    fn header_round_trip() {
        let params = test_params();
        let key = kdf::derive("pw", &params).unwrap();
        let header = StoreHeader {
            version: STORE_VERSION,
            params: params.clone(),
            key_check: key.verification_tag(),
            rotated_at: Utc::now().timestamp(),
        };
        let parsed = StoreHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.params, params);
        assert_eq!(parsed.key_check, header.key_check);
        assert_eq!(parsed.rotated_at, header.rotated_at);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(b"NOTMAGIC");
        assert!(matches!(
            StoreHeader::from_bytes(&buf),
            Err(StoreError::Format(_))
        ));
    }
}
