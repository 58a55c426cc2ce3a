//! Chain store: the persistent ordered block log.
//!
//! This module defines the storage abstraction the rest of the node is
//! generic over, plus the outcome and query types shared by its
//! implementations:
//!
//! - [`postgres::PgLedgerStore`]: the production backend, enforcing the
//!   append-only invariants with database constraints and a trigger.
//! - [`mem::MemLedgerStore`]: an in-memory backend with the same
//!   semantics, used by tests and small simulations.
//!
//! The store keeps an in-memory view of the chain as a cached
//! optimization; writes always re-derive the tip inside their own
//! transaction, and the cache is refreshed only after a successful write.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    Block, BlockDraft, BlockId, Creator, CreatorId, CreatorOverview, EncryptedEnvelope, NewCreator,
};

pub mod mem;
pub mod postgres;

pub use mem::MemLedgerStore;
pub use postgres::PgLedgerStore;

/// Storage-level error type.
#[derive(Debug)]
pub enum StoreError {
    /// Infrastructure failure (connection, transaction, timeout).
    Database(String),
    /// A uniqueness conflict outside the block-append path, e.g. a taken
    /// display name.
    Conflict(String),
    /// The store returned data the domain layer cannot interpret.
    Corrupted(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(msg) => write!(f, "database error: {msg}"),
            StoreError::Conflict(what) => write!(f, "conflict: {what}"),
            StoreError::Corrupted(msg) => write!(f, "corrupted record: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of an append attempt.
///
/// `Duplicate` and `Rejected` are terminal, idempotent outcomes; neither
/// is fatal to the cluster.
#[derive(Debug)]
pub enum AppendOutcome {
    /// The block was inserted and is the new tip.
    Inserted(Block),
    /// A block with the same `block_hash` already exists; it is returned.
    Duplicate(Block),
    /// A store invariant rejected the insert; carries the constraint name.
    Rejected(String),
}

/// Constraint name reported when a draft's `previous_hash` no longer
/// matches the tip inside the append transaction.
pub const REJECT_STALE_TIP: &str = "stale-tip";

/// Constraint name reported when the genesis shape is violated (sentinel
/// against a non-empty chain, or a linked first block).
pub const REJECT_GENESIS_SHAPE: &str = "genesis-shape";

/// Result of a wholesale chain replacement attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The candidate chain replaced the local one atomically.
    Accepted,
    /// The candidate was not strictly longer (or otherwise unacceptable);
    /// the local chain is untouched.
    Rejected(String),
}

/// Verification verdict recorded by the verifier.
///
/// Applying it is the only permitted mutation of a stored block, and the
/// audit record is written in the same transaction.
#[derive(Clone, Debug)]
pub struct VerificationOutcome {
    pub verified: bool,
    /// Failure reason, `None` on success.
    pub reason: Option<String>,
}

/// Audit event kinds written to the append-only audit log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditKind {
    BlockAppended,
    BlockVerifiedOk,
    BlockVerifiedFail,
    ChainReplaced,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::BlockAppended => "BLOCK_APPENDED",
            AuditKind::BlockVerifiedOk => "BLOCK_VERIFIED_OK",
            AuditKind::BlockVerifiedFail => "BLOCK_VERIFIED_FAIL",
            AuditKind::ChainReplaced => "CHAIN_REPLACED",
        }
    }
}

/// One audit log record.
#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub block_id: Option<BlockId>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Filter on the `verified` flag for paginated reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VerifiedFilter {
    #[default]
    All,
    Verified,
    Pending,
}

/// Sort order for paginated reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockSort {
    /// Highest `block_number` first.
    #[default]
    Newest,
    /// Lowest `block_number` first.
    Oldest,
    /// Ascending `block_number`, the canonical chain order.
    ByNumber,
}

/// Query parameters for a paginated chain read.
#[derive(Clone, Copy, Debug)]
pub struct BlockQuery {
    /// 1-based page index.
    pub page: u32,
    pub limit: u32,
    pub verified: VerifiedFilter,
    pub sort: BlockSort,
}

/// One page of blocks plus pagination totals.
#[derive(Clone, Debug)]
pub struct BlockPage {
    pub blocks: Vec<Block>,
    pub page: u32,
    pub limit: u32,
    pub total_blocks: u64,
    pub total_pages: u64,
}

/// Aggregate chain statistics.
#[derive(Clone, Debug, Default)]
pub struct ChainStats {
    pub total_blocks: u64,
    pub verified_blocks: u64,
    pub pending_blocks: u64,
    pub avg_mining_time_ms: Option<f64>,
    pub total_data_bytes: u64,
    pub latest_block_number: Option<u64>,
}

/// Persistent store for blocks, creators, and the audit log.
///
/// Implementations must make `append_block` and `replace_chain` atomic:
/// either the whole operation lands or the prior state is untouched. Once
/// a block row exists, only `(verified, verified_at)` may ever change.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Loads the full chain ordered by ascending `block_number`.
    async fn load_chain(&self) -> Result<Vec<Block>, StoreError>;

    /// Returns the tip from the in-memory view.
    ///
    /// This is a hint for read paths; writers re-derive the tip inside
    /// their own transaction.
    async fn latest_block(&self) -> Option<Block>;

    /// Fetches one block by its chain position.
    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, StoreError>;

    /// Atomically appends a draft, assigning `block_number` and the
    /// stored `previous_hash` from the tip read inside the transaction.
    async fn append_block(&self, draft: BlockDraft) -> Result<AppendOutcome, StoreError>;

    /// Atomically replaces the whole chain with `candidate` if it is
    /// strictly longer than the current chain.
    ///
    /// Structural validation of the candidate happens in the gossip layer
    /// before this is called; the store enforces the length rule and its
    /// own constraints.
    async fn replace_chain(&self, candidate: Vec<Block>) -> Result<ReplaceOutcome, StoreError>;

    /// Paginated chain read for external queries.
    async fn blocks_page(&self, query: BlockQuery) -> Result<BlockPage, StoreError>;

    /// The encrypted envelopes a creator needs to decrypt offline.
    async fn blocks_for_creator(
        &self,
        creator_id: CreatorId,
    ) -> Result<Vec<EncryptedEnvelope>, StoreError>;

    /// Aggregate chain statistics.
    async fn chain_stats(&self) -> Result<ChainStats, StoreError>;

    /// Up to `limit` unverified blocks, oldest position first, optionally
    /// only those created before `older_than`.
    async fn pending_blocks(
        &self,
        limit: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Block>, StoreError>;

    /// Applies a verification verdict to `(verified, verified_at)` and
    /// writes the audit record in the same transaction.
    async fn record_verification(
        &self,
        block_id: BlockId,
        outcome: VerificationOutcome,
    ) -> Result<(), StoreError>;

    /// Registers a creator; duplicate display names yield
    /// [`StoreError::Conflict`].
    async fn create_creator(&self, new: NewCreator) -> Result<Creator, StoreError>;

    async fn creator_by_id(&self, creator_id: CreatorId) -> Result<Option<Creator>, StoreError>;

    async fn creator_by_display_name(&self, name: &str) -> Result<Option<Creator>, StoreError>;

    /// Active creators with their block counts.
    async fn list_creators(&self) -> Result<Vec<CreatorOverview>, StoreError>;

    /// Number of blocks currently stored; used by liveness reporting.
    async fn block_count(&self) -> Result<u64, StoreError>;

    /// Cheap reachability probe for liveness reporting.
    async fn ping(&self) -> bool;
}
