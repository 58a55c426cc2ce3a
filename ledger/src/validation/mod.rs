//! Block validity predicates for the ledger.
//!
//! This module implements the deterministic checks that the commit
//! pipeline, the background verifier, and the chain-replacement path all
//! share:
//!
//! - [`block`]: block-local checks (proof-of-work, hash recomputation,
//!   shape, signature) and the chain-link check against a predecessor.
//! - [`chain`]: whole-chain validation used before a wholesale
//!   replacement.

pub mod block;
pub mod chain;

pub use block::{
    check_hash, check_link, check_pow, check_shape, check_signature, BlockCheckError,
    DATA_SIZE_TOLERANCE,
};
pub use chain::{validate_chain, ChainValidationError};
