//! Core domain types used by the ledger
//!
//! This module defines strongly-typed identifiers, the creator record, and
//! shared serde helpers that are used across the ledger implementation. The
//! goal is to avoid "naked" strings and byte buffers in public APIs and
//! instead use domain-specific newtypes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Block record, canonical hash input, and proof-of-work helpers.
pub mod block;

pub use block::{Block, BlockDraft, BlockHash, EncryptedEnvelope, GENESIS_SENTINEL};

/// Length in hex characters of all SHA-256 hashes carried by the ledger.
pub const HASH_HEX_LEN: usize = 64;

/// Length in bytes of the AES-GCM IV attached to every block.
pub const DATA_IV_LEN: usize = 16;

/// Length in bytes of the AES-GCM authentication tag; `encrypted_data`
/// always ends with the tag, so it can never be shorter than this.
pub const AUTH_TAG_LEN: usize = 16;

/// Strongly-typed creator identifier.
///
/// Creators are the signing principals of the ledger; each block references
/// exactly one. The identifier is opaque to the core and is rendered in its
/// hyphenated lowercase textual form wherever the canonical hash input
/// needs it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CreatorId(pub Uuid);

impl CreatorId {
    /// Mints a fresh random creator identifier.
    pub fn generate() -> Self {
        CreatorId(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for CreatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly-typed block identifier.
///
/// Distinct from [`block::BlockHash`]: the identifier is a database-level
/// handle, while the hash is the content address used by proof-of-work and
/// chain linking.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub Uuid);

impl BlockId {
    /// Mints a fresh random block identifier.
    pub fn generate() -> Self {
        BlockId(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered creator: a named principal identified by an RSA public key.
///
/// The core treats this record as read-mostly. Registration validates the
/// display name and the key modulus once; afterwards blocks only ever
/// reference the creator by id and verify signatures against
/// `public_key_pem`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Creator {
    pub creator_id: CreatorId,
    pub display_name: String,
    /// PEM-encoded RSA public key, modulus >= 2048 bits.
    pub public_key_pem: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creator registration.
#[derive(Clone, Debug, Deserialize)]
pub struct NewCreator {
    pub display_name: String,
    pub public_key_pem: String,
}

/// A creator together with the number of blocks it has sealed.
#[derive(Clone, Debug)]
pub struct CreatorOverview {
    pub creator: Creator,
    pub block_count: u64,
}

/// Checks a display name against the registration rules: 3 to 255
/// characters, alphanumeric plus `_` and `-`.
pub fn valid_display_name(name: &str) -> bool {
    let len = name.chars().count();
    (3..=255).contains(&len)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Serde adapter that transports byte fields as lowercase hex strings.
///
/// The core keeps one internal representation (raw bytes) and coerces at
/// each boundary; this module is the boundary coercion for JSON, used both
/// by the HTTP surface and the peer gossip protocol.
pub mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
