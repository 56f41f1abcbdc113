//! Error taxonomy for the credential store.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors from key derivation.
#[derive(Debug, Error)]
pub enum KdfError {
    #[error("passphrase must not be empty")]
    WeakInput,

    #[error("invalid derivation parameters: {0}")]
    Parameter(String),
}

/// Errors from the encrypted store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("wrong master key for this store")]
    Auth,

    #[error("record {0} is corrupt or was tampered with")]
    Integrity(Uuid),

    #[error("record not found: {0}")]
    NotFound(Uuid),

    #[error("store is busy with a key rotation")]
    Busy,

    #[error("store already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("store file malformed: {0}")]
    Format(String),

    #[error("encryption failure")]
    Crypto,

    #[error(transparent)]
    Kdf(#[from] KdfError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from the biometric gate.
#[derive(Debug, Error)]
pub enum BiometricError {
    #[error("user cancelled biometric authentication")]
    UserCancelled,

    #[error("biometric hardware unavailable: {0}")]
    Hardware(String),

    #[error("too many failed biometric attempts")]
    LockedOut,

    #[error("no biometric enrollment for this store")]
    NotEnrolled,

    #[error("biometric platform error: {0}")]
    Platform(String),
}

/// Errors surfaced by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is locked")]
    Locked,

    #[error("locked out for {0} more seconds")]
    LockedOut(u64),

    #[error("an unlock attempt is already in progress")]
    UnlockInProgress,

    #[error("internal session failure: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Biometric(#[from] BiometricError),

    #[error(transparent)]
    Kdf(#[from] KdfError),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type SessionResult<T> = Result<T, SessionError>;
