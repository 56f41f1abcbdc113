//! Session manager: the only surface collaborators talk to.
//!
//! State machine `Locked -> Unlocking -> Unlocked -> Locked`, plus
//! `Locked -> LockedOut -> Locked` after a cooldown. The master key lives
//! only inside the open store handle; every exit from `Unlocked` drops the
//! handle, zeroizing the key. Key derivation and the biometric prompt run on
//! the blocking pool so the caller's context is never stalled; dropping an
//! unlock future mid-flight restores the exact pre-attempt state.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::backup;
use crate::biometric::BiometricGate;
use crate::error::{SessionError, SessionResult, StoreError};
use crate::kdf::{self, KdfParams};
use crate::record::{CredentialRecord, RecordMetadata};
use crate::rotation::RotationPolicy;
use crate::store::Store;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCKOUT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Locked,
    Unlocking,
    Unlocked,
    LockedOut,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle window after which the session re-locks; re-armed by every
    /// successful store operation. Monotonic clock.
    pub idle_timeout: Duration,
    /// Consecutive failed unlock attempts before lockout.
    pub max_attempts: u32,
    /// How long a lockout lasts before attempts are accepted again.
    pub lockout_cooldown: Duration,
    pub rotation: RotationPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout_cooldown: DEFAULT_LOCKOUT_COOLDOWN,
            rotation: RotationPolicy::default(),
        }
    }
}

struct Inner {
    state: SessionState,
    store: Option<Arc<Store>>,
    failed_attempts: u32,
    lockout_until: Option<Instant>,
    last_activity: Instant,
}

/// Explicit session context; constructed per store, never ambient.
pub struct SessionManager {
    store_path: PathBuf,
    config: SessionConfig,
    gate: Option<Arc<BiometricGate>>,
    inner: Arc<Mutex<Inner>>,
}

impl SessionManager {
    pub fn new(
        store_path: impl AsRef<Path>,
        gate: Option<BiometricGate>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store_path: store_path.as_ref().to_path_buf(),
            config,
            gate: gate.map(Arc::new),
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Locked,
                store: None,
                failed_attempts: 0,
                lockout_until: None,
                last_activity: Instant::now(),
            })),
        }
    }

    pub fn store_exists(&self) -> bool {
        self.store_path.exists()
    }

    pub fn state(&self) -> SessionState {
        let mut inner = self.inner.lock();
        self.expire_idle(&mut inner);
        self.expire_lockout(&mut inner);
        inner.state
    }

    pub fn is_locked(&self) -> bool {
        self.state() != SessionState::Unlocked
    }

    /// Create a new store protected by `passphrase` and enter `Unlocked`.
    pub async fn create_with_passphrase(&self, passphrase: &str) -> SessionResult<()> {
        let _attempt = self.begin_attempt()?;
        let path = self.store_path.clone();
        let pass = Zeroizing::new(passphrase.to_owned());
        let result = tokio::task::spawn_blocking(move || -> SessionResult<Store> {
            let params = KdfParams::generate();
            let key = kdf::derive(&pass, &params)?;
            Ok(Store::create(&path, &key, params)?)
        })
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?;
        self.finish_attempt(result)
    }

    /// Unlock with the master passphrase. Derivation runs on the blocking
    /// pool; a wrong passphrase counts toward the lockout threshold.
    pub async fn unlock_with_passphrase(&self, passphrase: &str) -> SessionResult<()> {
        if self.state() == SessionState::Unlocked {
            return Ok(());
        }
        let _attempt = self.begin_attempt()?;
        let path = self.store_path.clone();
        let pass = Zeroizing::new(passphrase.to_owned());
        let result = tokio::task::spawn_blocking(move || -> SessionResult<Store> {
            let header = Store::read_header(&path)?;
            let key = kdf::derive(&pass, &header.params)?;
            Ok(Store::open(&path, &key)?)
        })
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?;
        self.finish_attempt(result)
    }

    /// Unlock via the biometric gate. `UserCancelled` leaves all counters
    /// and state exactly as before the attempt.
    pub async fn unlock_with_biometric(&self) -> SessionResult<()> {
        let gate = self
            .gate
            .clone()
            .ok_or_else(|| SessionError::Internal("no biometric gate configured".into()))?;
        if self.state() == SessionState::Unlocked {
            return Ok(());
        }
        let _attempt = self.begin_attempt()?;
        let path = self.store_path.clone();
        let result = tokio::task::spawn_blocking(move || -> SessionResult<Store> {
            let key = gate.unlock()?;
            Ok(Store::open(&path, &key)?)
        })
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?;
        self.finish_attempt(result)
    }

    /// Drop the master key and return to `Locked`.
    pub fn lock(&self) {
        let mut inner = self.inner.lock();
        if inner.store.take().is_some() {
            info!("session locked");
        }
        if inner.state == SessionState::Unlocked {
            inner.state = SessionState::Locked;
        }
    }

    // ── Guarded store pass-through ──────────────────────────────────────────

    pub fn put(&self, record: &CredentialRecord) -> SessionResult<()> {
        self.guarded(|store| store.put(record))
    }

    pub fn get(&self, id: Uuid) -> SessionResult<CredentialRecord> {
        self.guarded(|store| store.get(id))
    }

    pub fn delete(&self, id: Uuid) -> SessionResult<()> {
        self.guarded(|store| store.delete(id))
    }

    pub fn delete_all(&self) -> SessionResult<()> {
        self.guarded(|store| store.delete_all())
    }

    pub fn list(&self) -> SessionResult<Vec<RecordMetadata>> {
        self.guarded(|store| Ok(store.list()?.collect()))
    }

    pub fn search(&self, query: &str) -> SessionResult<Vec<RecordMetadata>> {
        self.guarded(|store| store.search(query))
    }

    /// Export every record to a standalone passphrase-encrypted backup file.
    pub fn export_backup(&self, path: impl AsRef<Path>, passphrase: &str) -> SessionResult<()> {
        let path = path.as_ref().to_path_buf();
        self.guarded(|store| {
            let records = store.export_all()?;
            backup::export(&path, &records, passphrase)
        })
    }

    /// Import records from a backup file, reassigning ids that collide.
    /// Returns the number of records imported.
    pub fn import_backup(&self, path: impl AsRef<Path>, passphrase: &str) -> SessionResult<usize> {
        let path = path.as_ref().to_path_buf();
        self.guarded(|store| {
            let records = backup::import(&path, passphrase)?;
            let count = records.len();
            for mut record in records {
                if store.get(record.id).is_ok() {
                    record.id = Uuid::new_v4();
                }
                store.put(&record)?;
            }
            Ok(count)
        })
    }

    // ── Rotation ────────────────────────────────────────────────────────────

    /// Whether the scheduled re-key interval has elapsed.
    pub fn rotation_due(&self) -> SessionResult<bool> {
        let policy = self.config.rotation.clone();
        self.guarded(|store| Ok(policy.is_due(store.rotated_at())))
    }

    /// Re-key the store: verify the old passphrase, derive a new key with a
    /// fresh salt, re-encrypt everything atomically, and re-wrap the
    /// biometric enrollment if present. Requires an unlocked session.
    pub async fn rotate_passphrase(&self, old: &str, new: &str) -> SessionResult<()> {
        let store = self.unlocked_store()?;
        let old_pass = Zeroizing::new(old.to_owned());
        let new_pass = Zeroizing::new(new.to_owned());
        let gate = self.gate.clone();

        let store_for_task = Arc::clone(&store);
        tokio::task::spawn_blocking(move || -> SessionResult<()> {
            let old_key = kdf::derive(&old_pass, &store_for_task.kdf_params())?;
            store_for_task.check_key(&old_key)?;

            let new_params = KdfParams::generate();
            let new_key = kdf::derive(&new_pass, &new_params)?;
            store_for_task.rotate(&new_key, new_params)?;

            if let Some(gate) = gate {
                if gate.is_enrolled() {
                    gate.enroll(&new_key)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))??;

        self.touch();
        Ok(())
    }

    /// Enroll biometric unlock for the currently open store.
    pub fn enroll_biometric(&self) -> SessionResult<()> {
        let gate = self
            .gate
            .clone()
            .ok_or_else(|| SessionError::Internal("no biometric gate configured".into()))?;
        let store = self.unlocked_store()?;
        gate.enroll(&store.master_key())?;
        self.touch();
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Transition into `Unlocking`, or explain why an attempt is refused.
    /// The returned guard restores `Locked` if the attempt never completes
    /// (cancellation via dropped future included).
    fn begin_attempt(&self) -> SessionResult<AttemptGuard> {
        let mut inner = self.inner.lock();
        self.expire_idle(&mut inner);
        self.expire_lockout(&mut inner);
        match inner.state {
            SessionState::LockedOut => {
                let remaining = inner
                    .lockout_until
                    .map(|t| t.saturating_duration_since(Instant::now()).as_secs())
                    .unwrap_or(0);
                Err(SessionError::LockedOut(remaining))
            }
            SessionState::Unlocking => Err(SessionError::UnlockInProgress),
            SessionState::Unlocked => {
                Err(SessionError::Internal("session already unlocked".into()))
            }
            SessionState::Locked => {
                inner.state = SessionState::Unlocking;
                Ok(AttemptGuard {
                    inner: Arc::clone(&self.inner),
                })
            }
        }
    }

    /// Apply the outcome of an unlock attempt to the state machine.
    fn finish_attempt(&self, result: SessionResult<Store>) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        match result {
            Ok(store) => {
                inner.state = SessionState::Unlocked;
                inner.store = Some(Arc::new(store));
                inner.failed_attempts = 0;
                inner.lockout_until = None;
                inner.last_activity = Instant::now();
                info!("session unlocked");
                Ok(())
            }
            Err(err) => {
                if counts_as_failed_attempt(&err) {
                    inner.failed_attempts += 1;
                    if inner.failed_attempts >= self.config.max_attempts {
                        inner.state = SessionState::LockedOut;
                        inner.lockout_until = Some(Instant::now() + self.config.lockout_cooldown);
                        warn!(
                            attempts = inner.failed_attempts,
                            "unlock attempt threshold reached, session locked out"
                        );
                        return Err(err);
                    }
                }
                inner.state = SessionState::Locked;
                Err(err)
            }
        }
    }

    fn guarded<T>(&self, op: impl FnOnce(&Store) -> Result<T, StoreError>) -> SessionResult<T> {
        let store = self.unlocked_store()?;
        let value = op(&store)?;
        self.touch();
        Ok(value)
    }

    fn unlocked_store(&self) -> SessionResult<Arc<Store>> {
        let mut inner = self.inner.lock();
        self.expire_idle(&mut inner);
        match inner.state {
            SessionState::Unlocked => inner
                .store
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| SessionError::Internal("unlocked session without store".into())),
            SessionState::LockedOut => {
                let remaining = inner
                    .lockout_until
                    .map(|t| t.saturating_duration_since(Instant::now()).as_secs())
                    .unwrap_or(0);
                Err(SessionError::LockedOut(remaining))
            }
            _ => Err(SessionError::Locked),
        }
    }

    fn touch(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Unlocked {
            inner.last_activity = Instant::now();
        }
    }

    fn expire_idle(&self, inner: &mut Inner) {
        if inner.state == SessionState::Unlocked
            && inner.last_activity.elapsed() >= self.config.idle_timeout
        {
            inner.store = None;
            inner.state = SessionState::Locked;
            info!("idle timeout elapsed, session locked");
        }
    }

    fn expire_lockout(&self, inner: &mut Inner) {
        if inner.state == SessionState::LockedOut {
            let elapsed = inner
                .lockout_until
                .map(|t| Instant::now() >= t)
                .unwrap_or(true);
            if elapsed {
                inner.state = SessionState::Locked;
                inner.failed_attempts = 0;
                inner.lockout_until = None;
                info!("lockout cooldown elapsed");
            }
        }
    }
}

/// Wrong credentials count toward lockout; cancellation, missing enrollment
/// and infrastructure failures do not.
fn counts_as_failed_attempt(err: &SessionError) -> bool {
    match err {
        SessionError::Store(StoreError::Auth) => true,
        SessionError::Biometric(crate::error::BiometricError::Platform(_)) => true,
        SessionError::Biometric(crate::error::BiometricError::LockedOut) => true,
        _ => false,
    }
}

/// Restores `Locked` if an unlock attempt never reaches `finish_attempt`,
/// which is exactly the dropped-future cancellation case.
struct AttemptGuard {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Unlocking {
            inner.state = SessionState::Locked;
        }
    }
}
