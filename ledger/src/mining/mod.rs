//! Mining coordinator: the two-phase mine-and-commit protocol.
//!
//! Phase one (`prepare_mining`) hands a client everything it needs to
//! work offline: the creator's public key, the current tip hash (or the
//! genesis sentinel), and the difficulty. Phase two (`commit_block`)
//! validates the finished block in a fixed order and asks the chain store
//! to append it:
//!
//! 1. creator existence, 2. signature, 3. proof-of-work, 4. hash
//! recomputation, 5. shape, 6. previous-hash freshness, 7. append.
//!
//! Per commit attempt the states are `received -> validated -> appended |
//! duplicate | rejected`; `duplicate` and `rejected` are terminal and
//! idempotent, and only `appended` triggers a broadcast (done by the
//! caller, which owns the gossip handle).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::crypto;
use crate::store::{AppendOutcome, LedgerStore, StoreError, REJECT_STALE_TIP};
use crate::types::{Block, BlockDraft, BlockHash, CreatorId, GENESIS_SENTINEL};
use crate::validation::{check_hash, check_pow, check_shape, check_signature, BlockCheckError};

/// Result of `prepare_mining`: the pre-image material a client mines
/// against.
#[derive(Clone, Debug)]
pub struct MiningPreparation {
    pub creator_id: CreatorId,
    pub public_key_pem: String,
    /// Tip hash, or the genesis sentinel on an empty chain.
    pub previous_hash: BlockHash,
    pub difficulty: u32,
}

/// The full block payload a client submits in phase two.
///
/// `nonce` and `created_at` arrive in their textual wire form; the
/// pipeline parses them and rebuilds the canonical hash input from the
/// parsed values, so any non-canonical rendering fails hash recomputation
/// deterministically.
#[derive(Clone, Debug)]
pub struct CommitPayload {
    pub creator_id: CreatorId,
    /// May equal the genesis sentinel.
    pub previous_hash: BlockHash,
    pub block_hash: BlockHash,
    /// String-encoded 64-bit nonce.
    pub nonce: String,
    pub difficulty: u32,
    pub encrypted_data: Vec<u8>,
    pub data_iv: Vec<u8>,
    pub encrypted_data_key: Vec<u8>,
    pub data_size: u64,
    pub signature: Vec<u8>,
    /// ISO-8601 timestamp exactly as the client rendered it for hashing.
    pub created_at: String,
    pub mining_duration_ms: Option<u64>,
}

/// Successful commit: the appended (or already present) block.
#[derive(Clone, Debug)]
pub struct CommitOutcome {
    pub block: Block,
    /// `true` when the payload replayed an existing block; clients treat
    /// this as success.
    pub duplicate: bool,
}

/// Failures of `prepare_mining`.
#[derive(Debug)]
pub enum PrepareError {
    CreatorMissing,
    DataTooLarge { size: usize, max: usize },
    Store(StoreError),
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrepareError::CreatorMissing => write!(f, "no active creator with that display name"),
            PrepareError::DataTooLarge { size, max } => {
                write!(f, "plaintext of {size} bytes exceeds the {max}-byte limit")
            }
            PrepareError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PrepareError {}

impl From<StoreError> for PrepareError {
    fn from(e: StoreError) -> Self {
        PrepareError::Store(e)
    }
}

/// Failures of `commit_block`, one variant per pipeline error code.
#[derive(Debug)]
pub enum CommitError {
    /// No active creator under the payload's `creator_id`.
    CreatorMissing,
    /// The signature does not verify over the ASCII block hash.
    SignatureInvalid,
    /// The block hash lacks the required leading-zero prefix.
    PowFailed,
    /// Recomputing the canonical hash input did not reproduce the hash.
    HashMismatch,
    /// A byte field has the wrong length or the declared size is off.
    ShapeInvalid(String),
    /// The tip moved since the client prepared; it must re-prepare.
    TipMoved,
    /// The payload's textual fields did not parse.
    InvalidPayload(String),
    /// The store rejected the insert; carries the constraint name.
    Rejected(String),
    Store(StoreError),
}

impl CommitError {
    /// Stable machine-readable error code for the API surface.
    pub fn code(&self) -> &'static str {
        match self {
            CommitError::CreatorMissing => "creator-missing",
            CommitError::SignatureInvalid => "signature-invalid",
            CommitError::PowFailed => "pow-failed",
            CommitError::HashMismatch => "hash-mismatch",
            CommitError::ShapeInvalid(_) => "shape-invalid",
            CommitError::TipMoved => "tip-moved",
            CommitError::InvalidPayload(_) => "invalid-payload",
            CommitError::Rejected(_) => "constraint-rejected",
            CommitError::Store(_) => "database-error",
        }
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::CreatorMissing => write!(f, "no active creator under that creator_id"),
            CommitError::SignatureInvalid => {
                write!(f, "signature does not verify over the block hash")
            }
            CommitError::PowFailed => write!(f, "block hash does not satisfy the difficulty"),
            CommitError::HashMismatch => {
                write!(f, "block hash does not match the canonical hash input")
            }
            CommitError::ShapeInvalid(msg) => write!(f, "invalid block shape: {msg}"),
            CommitError::TipMoved => {
                write!(f, "the chain tip moved since prepare; re-run prepare-mining")
            }
            CommitError::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            CommitError::Rejected(constraint) => {
                write!(f, "store rejected the block: {constraint}")
            }
            CommitError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<StoreError> for CommitError {
    fn from(e: StoreError) -> Self {
        CommitError::Store(e)
    }
}

/// Serves the two-phase mine/commit protocol on top of a chain store.
pub struct MiningCoordinator<S> {
    store: Arc<S>,
    difficulty: u32,
    max_data_size: usize,
}

impl<S> MiningCoordinator<S>
where
    S: LedgerStore,
{
    pub fn new(store: Arc<S>, difficulty: u32, max_data_size: usize) -> Self {
        Self {
            store,
            difficulty,
            max_data_size,
        }
    }

    /// Phase one: resolve the creator and capture the mining target.
    ///
    /// No side effects on the chain; the returned tip is a snapshot that
    /// `commit_block` re-checks.
    pub async fn prepare_mining(
        &self,
        display_name: &str,
        data_text_len: usize,
    ) -> Result<MiningPreparation, PrepareError> {
        if data_text_len > self.max_data_size {
            return Err(PrepareError::DataTooLarge {
                size: data_text_len,
                max: self.max_data_size,
            });
        }

        let creator = self
            .store
            .creator_by_display_name(display_name)
            .await?
            .filter(|c| c.active)
            .ok_or(PrepareError::CreatorMissing)?;

        let previous_hash = self
            .store
            .latest_block()
            .await
            .map(|tip| tip.block_hash)
            .unwrap_or_else(|| BlockHash::from(GENESIS_SENTINEL));

        Ok(MiningPreparation {
            creator_id: creator.creator_id,
            public_key_pem: creator.public_key_pem,
            previous_hash,
            difficulty: self.difficulty,
        })
    }

    /// Phase two: validate the finished block and append it.
    pub async fn commit_block(&self, payload: CommitPayload) -> Result<CommitOutcome, CommitError> {
        // 1. Creator existence.
        let creator = self
            .store
            .creator_by_id(payload.creator_id)
            .await?
            .filter(|c| c.active)
            .ok_or(CommitError::CreatorMissing)?;
        let public_key = crypto::parse_public_key_pem(&creator.public_key_pem)
            .map_err(|e| CommitError::Store(StoreError::Corrupted(e.to_string())))?;

        // 2. Signature over the ASCII block hash.
        check_signature(&public_key, &payload.block_hash, &payload.signature)
            .map_err(|_| CommitError::SignatureInvalid)?;

        // 3. Proof-of-work prefix.
        check_pow(&payload.block_hash, payload.difficulty).map_err(|_| CommitError::PowFailed)?;

        // 4. Hash recomputation from the parsed payload.
        let draft = self.parse_draft(&payload)?;
        check_hash(&draft.block_hash, &draft.canonical_hash_input())
            .map_err(|_| CommitError::HashMismatch)?;

        // 5. Shape checks against the creator's modulus.
        check_shape(
            &draft.encrypted_data,
            &draft.data_iv,
            &draft.encrypted_data_key,
            draft.data_size,
            Some(crypto::key_size_bytes(&public_key)),
        )
        .map_err(|e| match e {
            BlockCheckError::ShapeInvalid(msg) => CommitError::ShapeInvalid(msg),
            other => CommitError::ShapeInvalid(other.to_string()),
        })?;

        // 6. Previous-hash freshness against the current tip.
        match (self.store.latest_block().await, &draft.previous_hash) {
            (Some(tip), Some(prev)) if prev != &tip.block_hash => {
                return Err(CommitError::TipMoved);
            }
            (None, Some(_)) => return Err(CommitError::TipMoved),
            _ => {}
        }

        // 7. Append; the store re-checks the tip inside its transaction.
        match self.store.append_block(draft).await? {
            AppendOutcome::Inserted(block) => Ok(CommitOutcome {
                block,
                duplicate: false,
            }),
            AppendOutcome::Duplicate(block) => Ok(CommitOutcome {
                block,
                duplicate: true,
            }),
            AppendOutcome::Rejected(constraint) if constraint == REJECT_STALE_TIP => {
                Err(CommitError::TipMoved)
            }
            AppendOutcome::Rejected(constraint) => Err(CommitError::Rejected(constraint)),
        }
    }

    fn parse_draft(&self, payload: &CommitPayload) -> Result<BlockDraft, CommitError> {
        let nonce: u64 = payload
            .nonce
            .parse()
            .map_err(|_| CommitError::InvalidPayload(format!("nonce {:?} is not a u64", payload.nonce)))?;

        let created_at: DateTime<Utc> = payload
            .created_at
            .parse::<DateTime<chrono::FixedOffset>>()
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| {
                CommitError::InvalidPayload(format!("created_at is not ISO-8601: {e}"))
            })?;

        let previous_hash = if payload.previous_hash.is_genesis_sentinel() {
            None
        } else {
            Some(payload.previous_hash.clone())
        };

        Ok(BlockDraft {
            creator_id: Some(payload.creator_id),
            previous_hash,
            block_hash: payload.block_hash.clone(),
            nonce,
            difficulty: payload.difficulty,
            encrypted_data: payload.encrypted_data.clone(),
            data_iv: payload.data_iv.clone(),
            encrypted_data_key: payload.encrypted_data_key.clone(),
            data_size: payload.data_size,
            signature: payload.signature.clone(),
            created_at,
            mining_duration_ms: payload.mining_duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::client::{seal_and_mine, sign_block_hash};
    use crate::crypto::testkeys;
    use crate::store::MemLedgerStore;
    use crate::types::block::canonical_timestamp;
    use crate::types::{Creator, NewCreator};
    use chrono::Utc;

    const MAX_DATA: usize = 1024 * 1024;

    async fn coordinator() -> (Arc<MemLedgerStore>, MiningCoordinator<MemLedgerStore>, Creator) {
        let store = Arc::new(MemLedgerStore::new());
        let creator = store
            .create_creator(NewCreator {
                display_name: "alice".to_string(),
                public_key_pem: testkeys::public_key_pem(),
            })
            .await
            .expect("register creator");
        let coordinator = MiningCoordinator::new(store.clone(), 1, MAX_DATA);
        (store, coordinator, creator)
    }

    fn payload_from_draft(draft: &BlockDraft) -> CommitPayload {
        CommitPayload {
            creator_id: draft.creator_id.expect("draft has creator"),
            previous_hash: draft
                .previous_hash
                .clone()
                .unwrap_or_else(|| BlockHash::from(GENESIS_SENTINEL)),
            block_hash: draft.block_hash.clone(),
            nonce: draft.nonce.to_string(),
            difficulty: draft.difficulty,
            encrypted_data: draft.encrypted_data.clone(),
            data_iv: draft.data_iv.clone(),
            encrypted_data_key: draft.encrypted_data_key.clone(),
            data_size: draft.data_size,
            signature: draft.signature.clone(),
            created_at: canonical_timestamp(&draft.created_at),
            mining_duration_ms: draft.mining_duration_ms,
        }
    }

    async fn mine_for(
        coordinator: &MiningCoordinator<MemLedgerStore>,
        display_name: &str,
        plaintext: &[u8],
    ) -> CommitPayload {
        let (private, public) = testkeys::keypair();
        let prep = coordinator
            .prepare_mining(display_name, plaintext.len())
            .await
            .expect("prepare");

        let previous = if prep.previous_hash.is_genesis_sentinel() {
            None
        } else {
            Some(prep.previous_hash.clone())
        };
        let draft = seal_and_mine(
            plaintext,
            prep.creator_id,
            public,
            private,
            previous,
            prep.difficulty,
            Utc::now(),
        )
        .expect("mine");
        payload_from_draft(&draft)
    }

    #[tokio::test]
    async fn genesis_mine_and_commit() {
        let (store, coordinator, creator) = coordinator().await;

        let prep = coordinator.prepare_mining("alice", 5).await.expect("prepare");
        assert_eq!(prep.creator_id, creator.creator_id);
        assert!(prep.previous_hash.is_genesis_sentinel());
        assert_eq!(prep.difficulty, 1);

        let payload = mine_for(&coordinator, "alice", b"hello").await;
        let outcome = coordinator.commit_block(payload.clone()).await.expect("commit");
        assert!(!outcome.duplicate);
        assert_eq!(outcome.block.block_number, 1);
        assert!(outcome.block.previous_hash.is_none());
        assert!(!outcome.block.verified);

        let tip = store.latest_block().await.expect("tip");
        assert_eq!(tip.block_hash, payload.block_hash);
    }

    #[tokio::test]
    async fn prepare_rejects_unknown_creator_and_oversized_data() {
        let (_, coordinator, _) = coordinator().await;

        assert!(matches!(
            coordinator.prepare_mining("nobody", 5).await,
            Err(PrepareError::CreatorMissing)
        ));

        assert!(coordinator.prepare_mining("alice", MAX_DATA).await.is_ok());
        assert!(matches!(
            coordinator.prepare_mining("alice", MAX_DATA + 1).await,
            Err(PrepareError::DataTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn commit_rejects_unknown_creator() {
        let (_, coordinator, _) = coordinator().await;
        let mut payload = mine_for(&coordinator, "alice", b"x").await;
        payload.creator_id = CreatorId::generate();

        // The signature check never runs for a creator the store does not
        // know.
        assert!(matches!(
            coordinator.commit_block(payload).await,
            Err(CommitError::CreatorMissing)
        ));
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected_without_append() {
        let (store, coordinator, _) = coordinator().await;
        let mut payload = mine_for(&coordinator, "alice", b"x").await;
        payload.signature[3] ^= 0x01;

        assert!(matches!(
            coordinator.commit_block(payload).await,
            Err(CommitError::SignatureInvalid)
        ));
        assert_eq!(store.block_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn forged_pow_is_rejected() {
        let (store, coordinator, creator) = coordinator().await;
        let (private, _) = testkeys::keypair();

        // A correctly signed hash that has no leading zero at all.
        let mut payload = mine_for(&coordinator, "alice", b"x").await;
        let forged = BlockHash::from(
            "f000000000000000000000000000000000000000000000000000000000000001",
        );
        payload.block_hash = forged.clone();
        payload.signature = sign_block_hash(private, &forged).expect("sign forged hash");
        payload.creator_id = creator.creator_id;

        assert!(matches!(
            coordinator.commit_block(payload).await,
            Err(CommitError::PowFailed)
        ));
        assert_eq!(store.block_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn altered_payload_fails_hash_recomputation() {
        let (_, coordinator, _) = coordinator().await;
        let mut payload = mine_for(&coordinator, "alice", b"x").await;
        // Signature and PoW still pass (the hash is untouched), but the
        // nonce no longer reproduces it.
        payload.nonce = (payload.nonce.parse::<u64>().unwrap() + 1).to_string();

        assert!(matches!(
            coordinator.commit_block(payload).await,
            Err(CommitError::HashMismatch)
        ));
    }

    #[tokio::test]
    async fn non_canonical_timestamp_fails_hash_recomputation() {
        let (_, coordinator, _) = coordinator().await;
        let mut payload = mine_for(&coordinator, "alice", b"x").await;
        // Same instant, second precision instead of milliseconds.
        let parsed: DateTime<Utc> = payload.created_at.parse().unwrap();
        payload.created_at = parsed.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        assert!(matches!(
            coordinator.commit_block(payload).await,
            Err(CommitError::HashMismatch)
        ));
    }

    #[tokio::test]
    async fn replayed_commit_returns_duplicate() {
        let (store, coordinator, _) = coordinator().await;
        let payload = mine_for(&coordinator, "alice", b"x").await;

        let first = coordinator.commit_block(payload.clone()).await.expect("first commit");
        let replay = coordinator.commit_block(payload).await.expect("replay commit");

        assert!(replay.duplicate);
        assert_eq!(replay.block.block_id, first.block.block_id);
        assert_eq!(store.block_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_prepare_gets_tip_moved() {
        let (_, coordinator, _) = coordinator().await;
        let genesis = mine_for(&coordinator, "alice", b"genesis").await;
        coordinator.commit_block(genesis).await.expect("genesis");

        // Both clients prepare against the same tip (block 1).
        let payload_a = mine_for(&coordinator, "alice", b"from a").await;
        let payload_b = mine_for(&coordinator, "alice", b"from b").await;

        coordinator.commit_block(payload_a).await.expect("first commit wins");
        assert!(matches!(
            coordinator.commit_block(payload_b).await,
            Err(CommitError::TipMoved)
        ));
    }

    #[tokio::test]
    async fn sentinel_against_nonempty_chain_is_constraint_rejected() {
        // A sentinel previous_hash with an existing tip slips past the
        // freshness check by design and dies on the genesis-shape
        // constraint instead.
        let (_, coordinator, _) = coordinator().await;
        let genesis = mine_for(&coordinator, "alice", b"genesis").await;
        coordinator.commit_block(genesis).await.expect("genesis");

        let late_genesis = mine_for_sentinel(&coordinator).await;
        assert!(matches!(
            coordinator.commit_block(late_genesis).await,
            Err(CommitError::Rejected(c)) if c == "genesis-shape"
        ));
    }

    /// Mines a payload that claims the genesis sentinel regardless of the
    /// current tip.
    async fn mine_for_sentinel(
        coordinator: &MiningCoordinator<MemLedgerStore>,
    ) -> CommitPayload {
        let (private, public) = testkeys::keypair();
        let prep = coordinator.prepare_mining("alice", 4).await.expect("prepare");
        let draft = seal_and_mine(
            b"late",
            prep.creator_id,
            public,
            private,
            None,
            prep.difficulty,
            Utc::now(),
        )
        .expect("mine");
        payload_from_draft(&draft)
    }

    #[tokio::test]
    async fn second_block_extends_the_chain() {
        let (store, coordinator, _) = coordinator().await;

        let first = mine_for(&coordinator, "alice", b"one").await;
        coordinator.commit_block(first).await.expect("commit one");

        let second = mine_for(&coordinator, "alice", b"two").await;
        let outcome = coordinator.commit_block(second).await.expect("commit two");

        assert_eq!(outcome.block.block_number, 2);
        let chain = store.load_chain().await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain[1].previous_hash.as_ref(),
            Some(&chain[0].block_hash)
        );
    }

    #[tokio::test]
    async fn invalid_nonce_and_timestamp_are_payload_errors() {
        let (_, coordinator, _) = coordinator().await;

        let mut payload = mine_for(&coordinator, "alice", b"x").await;
        payload.nonce = "not-a-number".to_string();
        assert!(matches!(
            coordinator.commit_block(payload).await,
            Err(CommitError::InvalidPayload(_))
        ));

        let mut payload = mine_for(&coordinator, "alice", b"x").await;
        payload.created_at = "yesterday".to_string();
        assert!(matches!(
            coordinator.commit_block(payload).await,
            Err(CommitError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn error_codes_are_stable() {
        assert_eq!(CommitError::CreatorMissing.code(), "creator-missing");
        assert_eq!(CommitError::SignatureInvalid.code(), "signature-invalid");
        assert_eq!(CommitError::PowFailed.code(), "pow-failed");
        assert_eq!(CommitError::HashMismatch.code(), "hash-mismatch");
        assert_eq!(CommitError::TipMoved.code(), "tip-moved");
    }
}
