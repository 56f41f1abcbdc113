//! Credential records and their on-disk representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A decrypted credential. Exists only inside an unlocked session; never
/// persisted or transmitted in this form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub label: String,
    pub username: String,
    pub secret: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn new(label: impl Into<String>, username: impl Into<String>, secret: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            username: username.into(),
            secret: secret.into(),
            notes: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    pub fn metadata(&self) -> RecordMetadata {
        RecordMetadata {
            id: self.id,
            label: self.label.clone(),
            username: self.username.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

/// Listing view of a record. The secret value is deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordMetadata {
    pub id: Uuid,
    pub label: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// The part of a record that is sealed. Label and username are inside the
/// ciphertext too: the store file leaks nothing but ids and timestamps.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct RecordPayload {
    pub label: String,
    pub username: String,
    pub secret: String,
    pub notes: Option<String>,
}

impl RecordPayload {
    pub fn from_record(record: &CredentialRecord) -> Self {
        Self {
            label: record.label.clone(),
            username: record.username.clone(),
            secret: record.secret.clone(),
            notes: record.notes.clone(),
        }
    }
}

/// On-disk form of a single record: cleartext id/timestamps plus an
/// individually sealed payload. Nonce and ciphertext are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub nonce: String,
    pub ciphertext: String,
}
