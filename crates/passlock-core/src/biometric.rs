//! Biometric-gated access to the master key.
//!
//! The platform biometric subsystem is a consumed capability, injected as a
//! trait so the core stays testable with a fake. At enrollment the gate
//! generates a random device-bound wrapping key, hands it to the platform,
//! and persists the master key wrapped under it. The platform never sees the
//! master key; the master key never touches disk unwrapped.

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, NONCE_LEN};
use crate::error::BiometricError;
use crate::kdf::{MasterKey, KEY_LEN};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

const WRAP_AAD: &[u8] = b"passlock.biometric.v1";
const KEYRING_SERVICE: &str = "Passlock";

/// Platform biometric capability: holds a device-bound secret and releases it
/// only after the user passes platform verification. `authenticate` is
/// interactive and may block; callers run it off their primary context.
pub trait BiometricPlatform: Send + Sync {
    fn is_available(&self) -> bool;
    fn enroll(&self, account: &str, secret: &[u8]) -> Result<(), BiometricError>;
    fn authenticate(&self, account: &str) -> Result<Vec<u8>, BiometricError>;
    fn remove(&self, account: &str) -> Result<(), BiometricError>;
}

/// Production platform backed by the OS keyring. Access policy (biometric
/// prompt on read) is attached to the keyring item by the OS.
pub struct KeyringPlatform {
    service: String,
}

impl KeyringPlatform {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn entry(&self, account: &str) -> Result<Entry, BiometricError> {
        Entry::new(&self.service, account)
            .map_err(|e| BiometricError::Platform(format!("keyring init: {e}")))
    }
}

impl Default for KeyringPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl BiometricPlatform for KeyringPlatform {
    fn is_available(&self) -> bool {
        // The keyring itself is the device-bound secret holder; a missing
        // backend surfaces as a Platform error at enroll time.
        true
    }

    fn enroll(&self, account: &str, secret: &[u8]) -> Result<(), BiometricError> {
        let encoded = general_purpose::STANDARD.encode(secret);
        self.entry(account)?
            .set_password(&encoded)
            .map_err(|e| BiometricError::Platform(format!("store wrapping key: {e}")))
    }

    fn authenticate(&self, account: &str) -> Result<Vec<u8>, BiometricError> {
        let encoded = self.entry(account)?.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => BiometricError::NotEnrolled,
            other => BiometricError::Platform(format!("load wrapping key: {other}")),
        })?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BiometricError::Platform(format!("decode wrapping key: {e}")))
    }

    fn remove(&self, account: &str) -> Result<(), BiometricError> {
        match self.entry(account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(BiometricError::Platform(format!("delete wrapping key: {e}"))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WrappedKeyBlob {
    nonce: String,
    ciphertext: String,
}

/// Mediates master-key release through platform biometric verification.
pub struct BiometricGate {
    platform: Arc<dyn BiometricPlatform>,
    blob_path: PathBuf,
    account: String,
    failure_threshold: u32,
    failures: AtomicU32,
}

impl BiometricGate {
    pub fn new(
        platform: Arc<dyn BiometricPlatform>,
        data_dir: impl AsRef<Path>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            blob_path: data_dir.as_ref().join("biometric.blob"),
            account: account.into(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failures: AtomicU32::new(0),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn is_available(&self) -> bool {
        self.platform.is_available()
    }

    pub fn is_enrolled(&self) -> bool {
        self.blob_path.exists()
    }

    /// Wrap the master key under a fresh device-bound key and persist the
    /// blob. Re-enrolling (e.g. after rotation) replaces the previous blob.
    pub fn enroll(&self, master_key: &MasterKey) -> Result<(), BiometricError> {
        if !self.platform.is_available() {
            return Err(BiometricError::Hardware("no biometric backend".into()));
        }
        let mut wrap_key = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut *wrap_key);
        self.platform.enroll(&self.account, &*wrap_key)?;

        let nonce = crypto::generate_nonce();
        let ciphertext = crypto::seal(&wrap_key, &nonce, WRAP_AAD, master_key.as_bytes())
            .map_err(|_| BiometricError::Platform("wrap master key".into()))?;
        let blob = WrappedKeyBlob {
            nonce: general_purpose::STANDARD.encode(nonce),
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
        };
        let json = serde_json::to_vec(&blob)
            .map_err(|e| BiometricError::Platform(format!("encode key blob: {e}")))?;
        if let Some(parent) = self.blob_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BiometricError::Platform(format!("create data dir: {e}")))?;
        }
        fs::write(&self.blob_path, json)
            .map_err(|e| BiometricError::Platform(format!("write key blob: {e}")))?;
        self.failures.store(0, Ordering::SeqCst);
        info!(account = %self.account, "biometric unlock enrolled");
        Ok(())
    }

    /// Release the master key after platform verification. Consecutive
    /// failures up to the threshold lock the gate; lockout is reported
    /// upward and does not touch the underlying store.
    pub fn unlock(&self) -> Result<MasterKey, BiometricError> {
        if self.failures.load(Ordering::SeqCst) >= self.failure_threshold {
            return Err(BiometricError::LockedOut);
        }
        if !self.is_enrolled() {
            return Err(BiometricError::NotEnrolled);
        }

        let wrap_key = match self.platform.authenticate(&self.account) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(BiometricError::UserCancelled) => return Err(BiometricError::UserCancelled),
            Err(BiometricError::NotEnrolled) => return Err(BiometricError::NotEnrolled),
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(failures, "biometric authentication failed");
                if failures >= self.failure_threshold {
                    return Err(BiometricError::LockedOut);
                }
                return Err(e);
            }
        };
        let wrap_key: [u8; KEY_LEN] = wrap_key
            .as_slice()
            .try_into()
            .map_err(|_| BiometricError::Platform("wrapping key length invalid".into()))?;

        let json = fs::read(&self.blob_path)
            .map_err(|e| BiometricError::Platform(format!("read key blob: {e}")))?;
        let blob: WrappedKeyBlob = serde_json::from_slice(&json)
            .map_err(|e| BiometricError::Platform(format!("parse key blob: {e}")))?;
        let nonce_bytes = general_purpose::STANDARD
            .decode(&blob.nonce)
            .map_err(|e| BiometricError::Platform(format!("decode key blob: {e}")))?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| BiometricError::Platform("key blob nonce invalid".into()))?;
        let ciphertext = general_purpose::STANDARD
            .decode(&blob.ciphertext)
            .map_err(|e| BiometricError::Platform(format!("decode key blob: {e}")))?;

        let unwrapped = crypto::open(&wrap_key, &nonce, WRAP_AAD, &ciphertext)
            .map_err(|_| BiometricError::Platform("wrapped key blob corrupt".into()))?;
        let key_bytes: [u8; KEY_LEN] = Zeroizing::new(unwrapped)
            .as_slice()
            .try_into()
            .map_err(|_| BiometricError::Platform("wrapped key length invalid".into()))?;

        self.failures.store(0, Ordering::SeqCst);
        Ok(MasterKey::from_bytes(key_bytes))
    }

    /// Remove the blob and the platform-held wrapping key.
    pub fn unenroll(&self) -> Result<(), BiometricError> {
        if self.blob_path.exists() {
            fs::remove_file(&self.blob_path)
                .map_err(|e| BiometricError::Platform(format!("remove key blob: {e}")))?;
        }
        self.platform.remove(&self.account)?;
        self.failures.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// In-memory platform; `fail_next` simulates a failed verification.
    struct FakePlatform {
        secrets: Mutex<HashMap<String, Vec<u8>>>,
        fail_next: Mutex<Option<BiometricError>>,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                secrets: Mutex::new(HashMap::new()),
                fail_next: Mutex::new(None),
            }
        }

        fn fail_with(&self, err: BiometricError) {
            *self.fail_next.lock() = Some(err);
        }
    }

    impl BiometricPlatform for FakePlatform {
        fn is_available(&self) -> bool {
            true
        }

        fn enroll(&self, account: &str, secret: &[u8]) -> Result<(), BiometricError> {
            self.secrets.lock().insert(account.to_string(), secret.to_vec());
            Ok(())
        }

        fn authenticate(&self, account: &str) -> Result<Vec<u8>, BiometricError> {
            if let Some(err) = self.fail_next.lock().take() {
                return Err(err);
            }
            self.secrets
                .lock()
                .get(account)
                .cloned()
                .ok_or(BiometricError::NotEnrolled)
        }

        fn remove(&self, account: &str) -> Result<(), BiometricError> {
            self.secrets.lock().remove(account);
            Ok(())
        }
    }

    fn gate_with_fake(dir: &Path) -> (BiometricGate, Arc<FakePlatform>) {
        let platform = Arc::new(FakePlatform::new());
        let gate = BiometricGate::new(platform.clone(), dir, "test-store");
        (gate, platform)
    }

    #[test]
    fn enroll_unlock_round_trip() {
        let dir = tempdir().unwrap();
        let (gate, _) = gate_with_fake(dir.path());
        let key = MasterKey::from_bytes([42u8; KEY_LEN]);

        assert!(!gate.is_enrolled());
        gate.enroll(&key).unwrap();
        assert!(gate.is_enrolled());

        let released = gate.unlock().unwrap();
        assert_eq!(released.as_bytes(), key.as_bytes());
    }

    #[test]
    fn unlock_without_enrollment_fails() {
        let dir = tempdir().unwrap();
        let (gate, _) = gate_with_fake(dir.path());
        assert!(matches!(gate.unlock(), Err(BiometricError::NotEnrolled)));
    }

    #[test]
    fn cancellation_does_not_count_as_failure() {
        let dir = tempdir().unwrap();
        let (gate, platform) = gate_with_fake(dir.path());
        gate.enroll(&MasterKey::from_bytes([1u8; KEY_LEN])).unwrap();

        for _ in 0..10 {
            platform.fail_with(BiometricError::UserCancelled);
            assert!(matches!(gate.unlock(), Err(BiometricError::UserCancelled)));
        }
        // Still unlockable: cancellations never trip the lockout.
        assert!(gate.unlock().is_ok());
    }

    #[test]
    fn consecutive_failures_lock_the_gate() {
        let dir = tempdir().unwrap();
        let (gate, platform) = gate_with_fake(dir.path());
        let gate = gate.with_failure_threshold(3);
        gate.enroll(&MasterKey::from_bytes([1u8; KEY_LEN])).unwrap();

        for _ in 0..2 {
            platform.fail_with(BiometricError::Platform("no match".into()));
            assert!(matches!(gate.unlock(), Err(BiometricError::Platform(_))));
        }
        platform.fail_with(BiometricError::Platform("no match".into()));
        assert!(matches!(gate.unlock(), Err(BiometricError::LockedOut)));
        // Locked even with a would-be-successful verification.
        assert!(matches!(gate.unlock(), Err(BiometricError::LockedOut)));

        gate.reset_failures();
        assert!(gate.unlock().is_ok());
    }

    #[test]
    fn successful_unlock_resets_failure_count() {
        let dir = tempdir().unwrap();
        let (gate, platform) = gate_with_fake(dir.path());
        let gate = gate.with_failure_threshold(3);
        gate.enroll(&MasterKey::from_bytes([1u8; KEY_LEN])).unwrap();

        platform.fail_with(BiometricError::Platform("no match".into()));
        assert!(gate.unlock().is_err());
        assert!(gate.unlock().is_ok());

        // Counter was reset; two more failures do not lock.
        for _ in 0..2 {
            platform.fail_with(BiometricError::Platform("no match".into()));
            assert!(matches!(gate.unlock(), Err(BiometricError::Platform(_))));
        }
        assert!(gate.unlock().is_ok());
    }

    #[test]
    fn unenroll_removes_blob_and_platform_secret() {
        let dir = tempdir().unwrap();
        let (gate, platform) = gate_with_fake(dir.path());
        gate.enroll(&MasterKey::from_bytes([1u8; KEY_LEN])).unwrap();
        gate.unenroll().unwrap();
        assert!(!gate.is_enrolled());
        assert!(platform.secrets.lock().is_empty());
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let dir = tempdir().unwrap();
        let (gate, _) = gate_with_fake(dir.path());
        gate.enroll(&MasterKey::from_bytes([1u8; KEY_LEN])).unwrap();

        let json = fs::read(&gate.blob_path).unwrap();
        let mut blob: WrappedKeyBlob = serde_json::from_slice(&json).unwrap();
        let mut raw = general_purpose::STANDARD.decode(&blob.ciphertext).unwrap();
        raw[0] ^= 0x01;
        blob.ciphertext = general_purpose::STANDARD.encode(raw);
        fs::write(&gate.blob_path, serde_json::to_vec(&blob).unwrap()).unwrap();

        assert!(matches!(gate.unlock(), Err(BiometricError::Platform(_))));
    }
}
