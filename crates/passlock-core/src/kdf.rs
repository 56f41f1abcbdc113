//! Passphrase-based key derivation.
//!
//! Argon2id with a per-store random salt turns the master passphrase into the
//! symmetric key protecting the store. The work factor targets >=100ms on
//! desktop-class hardware; it is the primary defense against offline brute
//! force if the store file is exfiltrated.

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::KdfError;

pub const KDF_MEMORY_KIB: u32 = 65536; // 64 MiB
pub const KDF_TIME_COST: u32 = 3;
pub const KDF_PARALLELISM: u32 = 4;
pub const KEY_LEN: usize = 32;
// Spec floor is 16 bytes; we use 32 throughout.
pub const SALT_LEN: usize = 32;

const KEY_CHECK_CONTEXT: &[u8] = b"passlock.key-check.v1";

/// Identifier for the derivation algorithm, persisted in the store header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfAlgorithm {
    Argon2id,
}

impl KdfAlgorithm {
    pub fn id(self) -> u32 {
        match self {
            KdfAlgorithm::Argon2id => 1,
        }
    }

    pub fn from_id(id: u32) -> Result<Self, KdfError> {
        match id {
            1 => Ok(KdfAlgorithm::Argon2id),
            other => Err(KdfError::Parameter(format!("unknown algorithm id {other}"))),
        }
    }
}

/// Cleartext derivation parameters, persisted alongside the ciphertext so the
/// same passphrase re-derives the same key. Immutable except under rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub memory_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub salt: [u8; SALT_LEN],
}

impl KdfParams {
    /// Fresh parameters with a random salt and the default work factor.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: KDF_MEMORY_KIB,
            time_cost: KDF_TIME_COST,
            parallelism: KDF_PARALLELISM,
            salt,
        }
    }

    pub fn validate(&self) -> Result<(), KdfError> {
        if self.time_cost == 0 {
            return Err(KdfError::Parameter("time cost must be non-zero".into()));
        }
        if self.parallelism == 0 {
            return Err(KdfError::Parameter("parallelism must be non-zero".into()));
        }
        // Argon2 requires at least 8 KiB per lane.
        if self.memory_kib < 8 * self.parallelism {
            return Err(KdfError::Parameter(format!(
                "memory cost {} KiB too small for {} lanes",
                self.memory_kib, self.parallelism
            )));
        }
        Ok(())
    }
}

/// Symmetric key protecting the store. Held only in volatile memory and
/// zeroized on drop; never serialized in recoverable form.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Non-secret tag used for the fail-fast key check at store open.
    pub fn verification_tag(&self) -> [u8; 32] {
        let mut mac = Hmac::<Sha256>::new_from_slice(&*self.0)
            .expect("hmac accepts any key length");
        mac.update(KEY_CHECK_CONTEXT);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time comparison against a stored verification tag.
    pub fn matches_tag(&self, tag: &[u8; 32]) -> bool {
        let mut mac = Hmac::<Sha256>::new_from_slice(&*self.0)
            .expect("hmac accepts any key length");
        mac.update(KEY_CHECK_CONTEXT);
        mac.verify_slice(tag).is_ok()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Derive the master key from a passphrase. Deterministic for identical
/// inputs, across calls and process restarts.
pub fn derive(passphrase: &str, params: &KdfParams) -> Result<MasterKey, KdfError> {
    if passphrase.is_empty() {
        return Err(KdfError::WeakInput);
    }
    params.validate()?;

    let argon_params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| KdfError::Parameter(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(passphrase.as_bytes(), &params.salt, &mut *key)
        .map_err(|e| KdfError::Parameter(e.to_string()))?;
    Ok(MasterKey(key))
}
