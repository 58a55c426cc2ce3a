//! Block-local validity checks.
//!
//! Each check is a small deterministic predicate over one block (plus its
//! predecessor for the link check). The commit pipeline runs them in its
//! specified order and maps failures onto its error codes; the verifier
//! runs the same predicates against stored blocks.

use std::fmt;

use rsa::RsaPublicKey;

use crate::crypto;
use crate::types::{Block, BlockHash, AUTH_TAG_LEN, DATA_IV_LEN};

/// Permitted slack, in bytes, between the declared `data_size` and the
/// measured sum of ciphertext + IV + wrapped key.
pub const DATA_SIZE_TOLERANCE: u64 = 128;

/// Error type returned when a block fails a validity check.
#[derive(Debug)]
pub enum BlockCheckError {
    /// `block_hash` does not have the required leading-zero prefix.
    PowFailed { difficulty: u32, leading_zeros: u32 },
    /// Recomputing the canonical hash input did not reproduce `block_hash`.
    HashMismatch,
    /// A byte field has the wrong length or the declared size is off.
    ShapeInvalid(String),
    /// The signature did not verify under the creator's public key.
    SignatureInvalid,
    /// `previous_hash` does not match the predecessor, or the genesis
    /// shape is wrong.
    BrokenLink(String),
}

impl fmt::Display for BlockCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockCheckError::PowFailed {
                difficulty,
                leading_zeros,
            } => write!(
                f,
                "proof-of-work failed: {leading_zeros} leading zeros, difficulty {difficulty}"
            ),
            BlockCheckError::HashMismatch => {
                write!(f, "block hash does not match the canonical hash input")
            }
            BlockCheckError::ShapeInvalid(msg) => write!(f, "invalid block shape: {msg}"),
            BlockCheckError::SignatureInvalid => write!(f, "block signature verification failed"),
            BlockCheckError::BrokenLink(msg) => write!(f, "broken chain link: {msg}"),
        }
    }
}

impl std::error::Error for BlockCheckError {}

/// Checks the proof-of-work prefix rule.
pub fn check_pow(block_hash: &BlockHash, difficulty: u32) -> Result<(), BlockCheckError> {
    if block_hash.meets_difficulty(difficulty) {
        Ok(())
    } else {
        Err(BlockCheckError::PowFailed {
            difficulty,
            leading_zeros: block_hash.leading_zeros(),
        })
    }
}

/// Recomputes the canonical hash input and compares in constant time.
pub fn check_hash(expected: &BlockHash, canonical_input: &str) -> Result<(), BlockCheckError> {
    let recomputed = BlockHash::compute(canonical_input);
    if crypto::ct_eq(recomputed.as_str(), expected.as_str()) {
        Ok(())
    } else {
        Err(BlockCheckError::HashMismatch)
    }
}

/// Checks the byte-field shape of a block.
///
/// `expected_key_len` is the creator's RSA modulus size in bytes when the
/// creator is known; chain validation passes `None` for blocks whose
/// creator is not registered locally.
pub fn check_shape(
    encrypted_data: &[u8],
    data_iv: &[u8],
    encrypted_data_key: &[u8],
    declared_size: u64,
    expected_key_len: Option<usize>,
) -> Result<(), BlockCheckError> {
    if data_iv.len() != DATA_IV_LEN {
        return Err(BlockCheckError::ShapeInvalid(format!(
            "data_iv must be {DATA_IV_LEN} bytes, got {}",
            data_iv.len()
        )));
    }
    if encrypted_data.len() < AUTH_TAG_LEN {
        return Err(BlockCheckError::ShapeInvalid(format!(
            "encrypted_data of {} bytes cannot contain the {AUTH_TAG_LEN}-byte auth tag",
            encrypted_data.len()
        )));
    }
    if let Some(key_len) = expected_key_len {
        if encrypted_data_key.len() != key_len {
            return Err(BlockCheckError::ShapeInvalid(format!(
                "encrypted_data_key must be {key_len} bytes for this creator, got {}",
                encrypted_data_key.len()
            )));
        }
    }

    let measured = (encrypted_data.len() + data_iv.len() + encrypted_data_key.len()) as u64;
    if declared_size.abs_diff(measured) > DATA_SIZE_TOLERANCE {
        return Err(BlockCheckError::ShapeInvalid(format!(
            "declared data_size {declared_size} deviates from measured {measured} by more than {DATA_SIZE_TOLERANCE}"
        )));
    }
    Ok(())
}

/// Verifies the block signature under the creator's public key.
pub fn check_signature(
    key: &RsaPublicKey,
    block_hash: &BlockHash,
    signature: &[u8],
) -> Result<(), BlockCheckError> {
    crypto::verify_block_signature(key, block_hash, signature)
        .map_err(|_| BlockCheckError::SignatureInvalid)
}

/// Checks the chain link of a stored block against its predecessor.
///
/// For block number 1 the predecessor must be absent and `previous_hash`
/// must be the stored NULL (or the genesis sentinel when it travelled over
/// the wire); for every other block `previous_hash` must equal the
/// predecessor's `block_hash`.
pub fn check_link(block: &Block, predecessor: Option<&Block>) -> Result<(), BlockCheckError> {
    match (block.block_number, predecessor) {
        (1, None) => match &block.previous_hash {
            None => Ok(()),
            Some(h) if h.is_genesis_sentinel() => Ok(()),
            Some(h) => Err(BlockCheckError::BrokenLink(format!(
                "genesis block carries previous_hash {h}"
            ))),
        },
        (1, Some(_)) => Err(BlockCheckError::BrokenLink(
            "block number 1 has a predecessor".to_string(),
        )),
        (n, None) => Err(BlockCheckError::BrokenLink(format!(
            "block {n} has no predecessor in the store"
        ))),
        (n, Some(prev)) => {
            if prev.block_number + 1 != n {
                return Err(BlockCheckError::BrokenLink(format!(
                    "block {n} follows block {}",
                    prev.block_number
                )));
            }
            match &block.previous_hash {
                Some(h) if h == &prev.block_hash => Ok(()),
                Some(h) => Err(BlockCheckError::BrokenLink(format!(
                    "previous_hash {h} does not match block {} hash {}",
                    prev.block_number, prev.block_hash
                ))),
                None => Err(BlockCheckError::BrokenLink(format!(
                    "block {n} is missing previous_hash"
                ))),
            }
        }
    }
}
