//! Passphrase-encrypted backup files.
//!
//! A backup is a standalone artifact: it embeds its own derivation
//! parameters and salt, so it can be restored on any device knowing only
//! the backup passphrase. The backup passphrase is independent of the
//! store's master passphrase. Every record travels inside one sealed
//! payload; a wrong passphrase surfaces as `StoreError::Auth`.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::{self, NONCE_LEN};
use crate::error::{StoreError, StoreResult};
use crate::kdf::{self, KdfParams};
use crate::record::CredentialRecord;

const BACKUP_FORMAT: &str = "passlock-backup";
const BACKUP_VERSION: u32 = 1;
const BACKUP_AAD: &[u8] = b"passlock.backup.v1";

#[derive(Serialize, Deserialize)]
struct BackupEnvelope {
    format: String,
    version: u32,
    kdf: BackupKdf,
    nonce: String,
    ciphertext: String,
}

#[derive(Serialize, Deserialize)]
struct BackupKdf {
    time_cost: u32,
    memory_kib: u32,
    parallelism: u32,
    salt: String,
}

/// Write all `records` to `path`, sealed under a key derived from
/// `passphrase` with fresh parameters.
pub fn export(path: &Path, records: &[CredentialRecord], passphrase: &str) -> StoreResult<()> {
    let params = KdfParams::generate();
    let key = kdf::derive(passphrase, &params)?;

    let plaintext = Zeroizing::new(serde_json::to_vec(records)?);
    let nonce = crypto::generate_nonce();
    let ciphertext = crypto::seal(key.as_bytes(), &nonce, BACKUP_AAD, &plaintext)
        .map_err(|_| StoreError::Crypto)?;

    let envelope = BackupEnvelope {
        format: BACKUP_FORMAT.to_string(),
        version: BACKUP_VERSION,
        kdf: BackupKdf {
            time_cost: params.time_cost,
            memory_kib: params.memory_kib,
            parallelism: params.parallelism,
            salt: general_purpose::STANDARD.encode(params.salt),
        },
        nonce: general_purpose::STANDARD.encode(nonce),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
    };
    fs::write(path, serde_json::to_vec_pretty(&envelope)?)?;
    info!(path = %path.display(), records = records.len(), "backup exported");
    Ok(())
}

/// Decrypt the backup at `path` with `passphrase` and return its records.
pub fn import(path: &Path, passphrase: &str) -> StoreResult<Vec<CredentialRecord>> {
    let bytes = fs::read(path)?;
    let envelope: BackupEnvelope =
        serde_json::from_slice(&bytes).map_err(|_| StoreError::Format("not a backup file".into()))?;
    if envelope.format != BACKUP_FORMAT {
        return Err(StoreError::Format("not a backup file".into()));
    }
    if envelope.version != BACKUP_VERSION {
        return Err(StoreError::Format(format!(
            "unsupported backup version {}",
            envelope.version
        )));
    }

    let salt_bytes = general_purpose::STANDARD
        .decode(&envelope.kdf.salt)
        .map_err(|_| StoreError::Format("bad salt encoding".into()))?;
    let salt = salt_bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Format("bad salt length".into()))?;
    let params = KdfParams {
        algorithm: crate::kdf::KdfAlgorithm::Argon2id,
        time_cost: envelope.kdf.time_cost,
        memory_kib: envelope.kdf.memory_kib,
        parallelism: envelope.kdf.parallelism,
        salt,
    };
    let key = kdf::derive(passphrase, &params)?;

    let nonce_bytes = general_purpose::STANDARD
        .decode(&envelope.nonce)
        .map_err(|_| StoreError::Format("bad nonce encoding".into()))?;
    let nonce: [u8; NONCE_LEN] = nonce_bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Format("bad nonce length".into()))?;
    let ciphertext = general_purpose::STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|_| StoreError::Format("bad ciphertext encoding".into()))?;

    // Authentication failure means a wrong passphrase or a tampered file;
    // both are indistinguishable by construction.
    let plaintext = Zeroizing::new(
        crypto::open(key.as_bytes(), &nonce, BACKUP_AAD, &ciphertext)
            .map_err(|_| StoreError::Auth)?,
    );
    let records: Vec<CredentialRecord> = serde_json::from_slice(&plaintext)?;
    info!(path = %path.display(), records = records.len(), "backup imported");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<CredentialRecord> {
        vec![
            CredentialRecord::new("example.com", "alice", "hunter2"),
            CredentialRecord::new("github.com", "bob", "correct horse"),
        ]
    }

    #[test]
    fn export_import_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.plb");
        let records = sample_records();

        export(&path, &records, "backup passphrase").unwrap();
        let restored = import(&path, "backup passphrase").unwrap();
        assert_eq!(restored, records);
    }

    #[test]
    fn wrong_passphrase_fails_auth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.plb");
        export(&path, &sample_records(), "right").unwrap();
        assert!(matches!(import(&path, "wrong"), Err(StoreError::Auth)));
    }

    #[test]
    fn garbage_file_is_rejected_as_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.plb");
        fs::write(&path, b"not json at all").unwrap();
        assert!(matches!(import(&path, "pw"), Err(StoreError::Format(_))));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.plb");
        export(&path, &sample_records(), "pw").unwrap();

        let mut envelope: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let mut raw = general_purpose::STANDARD
            .decode(envelope["ciphertext"].as_str().unwrap())
            .unwrap();
        raw[0] ^= 0x01;
        envelope["ciphertext"] = general_purpose::STANDARD.encode(raw).into();
        fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        assert!(matches!(import(&path, "pw"), Err(StoreError::Auth)));
    }
}
