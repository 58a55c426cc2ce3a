// ledger/src/types/block.rs

//! Block types and canonical hashing.
//!
//! This module defines the core block record, together with the canonical
//! hash-input routine that clients and servers must reproduce byte for
//! byte, and helpers for the proof-of-work prefix rule.
//!
//! The canonical hash input is a single ASCII string of eight fields
//! joined with `'|'`:
//!
//! 1. `previous_hash`, or the genesis sentinel when absent,
//! 2. lowercase hex of `encrypted_data`,
//! 3. lowercase hex of `data_iv`,
//! 4. lowercase hex of `encrypted_data_key`,
//! 5. decimal `nonce`,
//! 6. `created_at` in canonical ISO-8601 form (millisecond precision
//!    and `Z` suffix, the rendering of `Date#toISOString`),
//! 7. textual `creator_id`, or the empty string when absent,
//! 8. decimal `difficulty`.
//!
//! `block_hash` is the lowercase hex SHA-256 of the UTF-8 bytes of that
//! string. Any deviation breaks proof-of-work verification on peers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{serde_hex, BlockId, CreatorId};

/// The literal 64-character string of `'0'` used wherever `previous_hash`
/// is absent, specifically in the canonical hash input of the genesis
/// block.
pub const GENESIS_SENTINEL: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Strongly-typed block hash: lowercase hex SHA-256 of the canonical hash
/// input.
///
/// Wrapping the hex string keeps hash comparisons and the proof-of-work
/// prefix rule in one place instead of scattering string logic around.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHash(pub String);

impl BlockHash {
    /// Computes the block hash for a canonical hash input string.
    pub fn compute(hash_input: &str) -> Self {
        let digest = Sha256::digest(hash_input.as_bytes());
        BlockHash(hex::encode(digest))
    }

    /// Returns the hex string backing this hash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Counts the leading `'0'` hex characters of the hash.
    pub fn leading_zeros(&self) -> u32 {
        self.0.chars().take_while(|c| *c == '0').count() as u32
    }

    /// Returns `true` if the hash satisfies the proof-of-work rule for
    /// `difficulty` (at least that many leading `'0'` characters).
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        self.leading_zeros() >= difficulty
    }

    /// Returns `true` if this is the genesis sentinel.
    pub fn is_genesis_sentinel(&self) -> bool {
        self.0 == GENESIS_SENTINEL
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockHash {
    fn from(s: &str) -> Self {
        BlockHash(s.to_string())
    }
}

/// Renders a timestamp in the canonical form used by the hash input:
/// RFC 3339 with exactly millisecond precision and a literal `Z`.
///
/// This matches the string produced by the browser client; a commit whose
/// `created_at` deviates from this form fails hash recomputation.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Joins the eight canonical fields with the `'|'` delimiter.
fn join_hash_input(
    previous_hash: Option<&BlockHash>,
    encrypted_data: &[u8],
    data_iv: &[u8],
    encrypted_data_key: &[u8],
    nonce: u64,
    created_at: &DateTime<Utc>,
    creator_id: Option<&CreatorId>,
    difficulty: u32,
) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        previous_hash.map(BlockHash::as_str).unwrap_or(GENESIS_SENTINEL),
        hex::encode(encrypted_data),
        hex::encode(data_iv),
        hex::encode(encrypted_data_key),
        nonce,
        canonical_timestamp(created_at),
        creator_id.map(CreatorId::to_string).unwrap_or_default(),
        difficulty,
    )
}

/// A fully persisted block: one append-only record containing an encrypted
/// payload, its proof-of-work, its signature, and its position in the
/// chain.
///
/// Byte fields serialize as lowercase hex so the same record shape flows
/// over the peer protocol and the HTTP surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub block_id: BlockId,
    /// Monotonically increasing position, genesis is 1.
    pub block_number: u64,
    pub creator_id: Option<CreatorId>,
    /// Hash of the prior block; `None` only for the genesis block.
    pub previous_hash: Option<BlockHash>,
    pub block_hash: BlockHash,
    pub nonce: u64,
    /// Required count of leading `'0'` hex digits in `block_hash`.
    pub difficulty: u32,
    /// AES-256-GCM ciphertext with the 16-byte auth tag appended.
    #[serde(with = "serde_hex")]
    pub encrypted_data: Vec<u8>,
    /// 16-byte AES-GCM IV.
    #[serde(with = "serde_hex")]
    pub data_iv: Vec<u8>,
    /// The AES key wrapped under the creator's RSA key with OAEP/SHA-256.
    #[serde(with = "serde_hex")]
    pub encrypted_data_key: Vec<u8>,
    /// Declared total size of ciphertext + IV + wrapped key, in bytes.
    pub data_size: u64,
    /// RSA-SHA256 signature over the ASCII hex `block_hash`.
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    /// Client-reported mining duration; informational only.
    pub mining_duration_ms: Option<u64>,
}

impl Block {
    /// Rebuilds the canonical hash input for this block.
    pub fn canonical_hash_input(&self) -> String {
        join_hash_input(
            self.previous_hash.as_ref(),
            &self.encrypted_data,
            &self.data_iv,
            &self.encrypted_data_key,
            self.nonce,
            &self.created_at,
            self.creator_id.as_ref(),
            self.difficulty,
        )
    }

    /// Recomputes the block hash from the canonical hash input.
    pub fn compute_hash(&self) -> BlockHash {
        BlockHash::compute(&self.canonical_hash_input())
    }

    /// Sum of the stored byte lengths the client declared in `data_size`.
    pub fn measured_size(&self) -> u64 {
        (self.encrypted_data.len() + self.data_iv.len() + self.encrypted_data_key.len()) as u64
    }

    /// Projects the fields a client needs to decrypt this block offline.
    pub fn envelope(&self) -> EncryptedEnvelope {
        EncryptedEnvelope {
            block_id: self.block_id,
            block_number: self.block_number,
            block_hash: self.block_hash.clone(),
            created_at: self.created_at,
            encrypted_data: self.encrypted_data.clone(),
            data_iv: self.data_iv.clone(),
            encrypted_data_key: self.encrypted_data_key.clone(),
            data_size: self.data_size,
            verified: self.verified,
        }
    }
}

/// A block proposed for appending, before the store assigns its
/// identifier and position.
///
/// Drafts come from two places: the commit pipeline (which always has a
/// creator) and the gossip `BLOCK` path (which re-appends a peer's record
/// locally, letting the store assign the position). `previous_hash` of
/// `None` stands for the genesis sentinel; the store turns it into a NULL
/// column for block number 1.
#[derive(Clone, Debug)]
pub struct BlockDraft {
    pub creator_id: Option<CreatorId>,
    pub previous_hash: Option<BlockHash>,
    pub block_hash: BlockHash,
    pub nonce: u64,
    pub difficulty: u32,
    pub encrypted_data: Vec<u8>,
    pub data_iv: Vec<u8>,
    pub encrypted_data_key: Vec<u8>,
    pub data_size: u64,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub mining_duration_ms: Option<u64>,
}

impl BlockDraft {
    /// Rebuilds the canonical hash input for this draft.
    pub fn canonical_hash_input(&self) -> String {
        join_hash_input(
            self.previous_hash.as_ref(),
            &self.encrypted_data,
            &self.data_iv,
            &self.encrypted_data_key,
            self.nonce,
            &self.created_at,
            self.creator_id.as_ref(),
            self.difficulty,
        )
    }

    /// Recomputes the block hash from the canonical hash input.
    pub fn compute_hash(&self) -> BlockHash {
        BlockHash::compute(&self.canonical_hash_input())
    }

    /// Sum of the actual byte lengths declared in `data_size`.
    pub fn measured_size(&self) -> u64 {
        (self.encrypted_data.len() + self.data_iv.len() + self.encrypted_data_key.len()) as u64
    }
}

impl From<Block> for BlockDraft {
    /// Strips the store-assigned fields so a peer's block can be appended
    /// locally; the receiving store re-derives position and verification
    /// state.
    fn from(block: Block) -> Self {
        BlockDraft {
            creator_id: block.creator_id,
            previous_hash: block.previous_hash,
            block_hash: block.block_hash,
            nonce: block.nonce,
            difficulty: block.difficulty,
            encrypted_data: block.encrypted_data,
            data_iv: block.data_iv,
            encrypted_data_key: block.encrypted_data_key,
            data_size: block.data_size,
            signature: block.signature,
            created_at: block.created_at,
            mining_duration_ms: block.mining_duration_ms,
        }
    }
}

/// The minimal fields a client needs to decrypt a block offline.
#[derive(Clone, Debug)]
pub struct EncryptedEnvelope {
    pub block_id: BlockId,
    pub block_number: u64,
    pub block_hash: BlockHash,
    pub created_at: DateTime<Utc>,
    pub encrypted_data: Vec<u8>,
    pub data_iv: Vec<u8>,
    pub encrypted_data_key: Vec<u8>,
    pub data_size: u64,
    pub verified: bool,
}
