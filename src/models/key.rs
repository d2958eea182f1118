use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// The tier a key occupies in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Passphrase-derived root, wrapped by itself.
    Master,
    /// Ephemeral key wrapped by a master key.
    Session,
    /// Data key wrapped by a session key.
    Data,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Master => "master",
            KeyType::Session => "session",
            KeyType::Data => "data",
        }
    }

    /// The type a parent of this key must have, if any.
    pub fn parent_type(&self) -> Option<KeyType> {
        match self {
            KeyType::Master => None,
            KeyType::Session => Some(KeyType::Master),
            KeyType::Data => Some(KeyType::Session),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(KeyType::Master),
            "session" => Ok(KeyType::Session),
            "data" => Ok(KeyType::Data),
            other => Err(AppError::MissingData(format!("unknown key_type '{}'", other))),
        }
    }
}

/// A persisted key record. `wrapped_key_bytes` is never usable on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKey {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub key_type: KeyType,
    /// The key this one is wrapped under. `None` for self-wrapped master keys.
    pub parent_key_id: Option<Uuid>,
    #[serde(skip_serializing)]
    pub wrapped_key_bytes: Vec<u8>,
    #[serde(skip_serializing)]
    pub iv: Vec<u8>,
    /// PBKDF2 salt, master keys only.
    #[serde(skip_serializing)]
    pub salt: Option<Vec<u8>>,
    pub kdf_iterations: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl EncryptionKey {
    /// Returns `true` once `now` has passed `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    /// Returns `true` if the key may be used for new encryption or wrapping.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }
}

/// The output of a single AEAD encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub key_id: Uuid,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
}
