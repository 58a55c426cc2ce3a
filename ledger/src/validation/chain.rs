//! Whole-chain validation for the replacement path.
//!
//! A `CHAIN` message from a peer is only allowed to replace the local
//! chain after every candidate block has been re-validated: hash
//! recomputation, proof-of-work, numbering and hash links, shape, and the
//! signature whenever the creator is registered locally. Unconditional
//! replacement of a longer chain would let a single bad peer rewrite
//! history.

use std::collections::HashMap;
use std::fmt;

use rsa::RsaPublicKey;

use crate::types::{Block, CreatorId};

use super::block::{check_hash, check_link, check_pow, check_shape, check_signature, BlockCheckError};

/// Error describing which candidate block failed which check.
#[derive(Debug)]
pub struct ChainValidationError {
    /// `block_number` of the offending block.
    pub block_number: u64,
    pub source: BlockCheckError,
}

impl fmt::Display for ChainValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "candidate block {} is invalid: {}", self.block_number, self.source)
    }
}

impl std::error::Error for ChainValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Validates a full candidate chain in ascending order.
///
/// `keys` maps locally registered creators to their parsed public keys;
/// blocks whose creator is unknown here skip the signature check (creator
/// records replicate out of band) and are left for the verifier to settle
/// once the creator appears.
pub fn validate_chain(
    blocks: &[Block],
    keys: &HashMap<CreatorId, RsaPublicKey>,
) -> Result<(), ChainValidationError> {
    let mut predecessor: Option<&Block> = None;

    for block in blocks {
        let fail = |source| ChainValidationError {
            block_number: block.block_number,
            source,
        };

        check_link(block, predecessor).map_err(fail)?;
        check_hash(&block.block_hash, &block.canonical_hash_input()).map_err(fail)?;
        check_pow(&block.block_hash, block.difficulty).map_err(fail)?;

        let key = block.creator_id.as_ref().and_then(|id| keys.get(id));
        let expected_key_len = key.map(crate::crypto::key_size_bytes);
        check_shape(
            &block.encrypted_data,
            &block.data_iv,
            &block.encrypted_data_key,
            block.data_size,
            expected_key_len,
        )
        .map_err(fail)?;

        if let Some(key) = key {
            check_signature(key, &block.block_hash, &block.signature).map_err(fail)?;
        }

        predecessor = Some(block);
    }

    Ok(())
}
