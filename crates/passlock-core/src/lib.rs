//! Encrypted local credential store.
//!
//! The crate is organized around four components:
//!
//! - [`kdf`]: Argon2id passphrase derivation with per-store salts and a
//!   constant-time key-verification tag.
//! - [`store`]: the encrypted record store. One file per store, cleartext
//!   parameter header, individually sealed records, atomic writes, and
//!   whole-store key rotation.
//! - [`biometric`]: an optional gate that wraps the master key under a
//!   platform-held secret so unlocking does not require the passphrase.
//! - [`session`]: the state machine callers actually use. Everything else
//!   is reachable through an unlocked [`session::SessionManager`].
//!
//! Backups ([`backup`]) are standalone passphrase-encrypted files,
//! independent of any store's master key.

pub mod backup;
pub mod biometric;
pub mod crypto;
pub mod error;
pub mod kdf;
pub mod paths;
pub mod record;
pub mod rotation;
pub mod session;
pub mod store;

pub use biometric::{BiometricGate, BiometricPlatform, KeyringPlatform};
pub use error::{BiometricError, KdfError, SessionError, StoreError};
pub use kdf::{KdfParams, MasterKey};
pub use record::{CredentialRecord, RecordMetadata};
pub use rotation::RotationPolicy;
pub use session::{SessionConfig, SessionManager, SessionState};
pub use store::Store;
