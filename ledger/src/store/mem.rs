//! In-memory ledger store.
//!
//! This implementation is useful for unit tests and small simulations. It
//! enforces the same append-only semantics as the Postgres backend in
//! code: the conflict key on `block_hash`, the genesis shape, the
//! tip-link re-check inside the "transaction" (here: one lock scope), and
//! the rule that only `(verified, verified_at)` ever change on a stored
//! block.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    Block, BlockDraft, BlockId, Creator, CreatorId, CreatorOverview, EncryptedEnvelope, NewCreator,
    AUTH_TAG_LEN, DATA_IV_LEN,
};

use super::{
    AppendOutcome, AuditEvent, AuditKind, BlockPage, BlockQuery, BlockSort, ChainStats,
    LedgerStore, ReplaceOutcome, StoreError, VerificationOutcome, VerifiedFilter,
    REJECT_GENESIS_SHAPE, REJECT_STALE_TIP,
};

#[derive(Default)]
struct Inner {
    /// Blocks in ascending `block_number` order.
    blocks: Vec<Block>,
    creators: Vec<Creator>,
    audit: Vec<AuditEvent>,
}

/// In-memory implementation of [`LedgerStore`].
#[derive(Default)]
pub struct MemLedgerStore {
    inner: RwLock<Inner>,
}

impl MemLedgerStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the audit log, for tests and tooling.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.read().expect("store lock poisoned").audit.clone()
    }

    fn record_audit(inner: &mut Inner, kind: AuditKind, block_id: Option<BlockId>, detail: Option<String>) {
        inner.audit.push(AuditEvent {
            kind,
            block_id,
            detail,
            recorded_at: Utc::now(),
        });
    }

    /// Mirrors the Postgres column constraints; returns the violated
    /// constraint name.
    fn check_row_constraints(draft: &BlockDraft) -> Option<&'static str> {
        if !(1..=10).contains(&draft.difficulty) {
            return Some("blocks_difficulty_range");
        }
        if draft.data_size == 0 {
            return Some("blocks_data_size_positive");
        }
        if draft.data_iv.len() != DATA_IV_LEN {
            return Some("blocks_data_iv_length");
        }
        if draft.encrypted_data.len() < AUTH_TAG_LEN {
            return Some("blocks_encrypted_data_min");
        }
        None
    }
}

#[async_trait]
impl LedgerStore for MemLedgerStore {
    async fn load_chain(&self) -> Result<Vec<Block>, StoreError> {
        Ok(self.inner.read().expect("store lock poisoned").blocks.clone())
    }

    async fn latest_block(&self) -> Option<Block> {
        self.inner.read().expect("store lock poisoned").blocks.last().cloned()
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.blocks.iter().find(|b| b.block_number == number).cloned())
    }

    async fn append_block(&self, draft: BlockDraft) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        if let Some(existing) = inner.blocks.iter().find(|b| b.block_hash == draft.block_hash) {
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }
        if let Some(constraint) = Self::check_row_constraints(&draft) {
            return Ok(AppendOutcome::Rejected(constraint.to_string()));
        }

        // Re-derive the tip under the write lock, the in-memory equivalent
        // of re-reading it inside the append transaction.
        let (block_number, previous_hash) = match (inner.blocks.last(), &draft.previous_hash) {
            (None, None) => (1, None),
            (None, Some(_)) => return Ok(AppendOutcome::Rejected(REJECT_GENESIS_SHAPE.to_string())),
            (Some(_), None) => return Ok(AppendOutcome::Rejected(REJECT_GENESIS_SHAPE.to_string())),
            (Some(tip), Some(prev)) => {
                if prev != &tip.block_hash {
                    return Ok(AppendOutcome::Rejected(REJECT_STALE_TIP.to_string()));
                }
                (tip.block_number + 1, Some(prev.clone()))
            }
        };

        let block = Block {
            block_id: BlockId::generate(),
            block_number,
            creator_id: draft.creator_id,
            previous_hash,
            block_hash: draft.block_hash,
            nonce: draft.nonce,
            difficulty: draft.difficulty,
            encrypted_data: draft.encrypted_data,
            data_iv: draft.data_iv,
            encrypted_data_key: draft.encrypted_data_key,
            data_size: draft.data_size,
            signature: draft.signature,
            created_at: draft.created_at,
            verified: false,
            verified_at: None,
            mining_duration_ms: draft.mining_duration_ms,
        };

        inner.blocks.push(block.clone());
        Self::record_audit(
            &mut inner,
            AuditKind::BlockAppended,
            Some(block.block_id),
            Some(format!("block {} appended", block.block_number)),
        );
        Ok(AppendOutcome::Inserted(block))
    }

    async fn replace_chain(&self, candidate: Vec<Block>) -> Result<ReplaceOutcome, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        if candidate.len() <= inner.blocks.len() {
            return Ok(ReplaceOutcome::Rejected(format!(
                "candidate of {} blocks is not longer than the local {}",
                candidate.len(),
                inner.blocks.len()
            )));
        }

        let detail = format!(
            "chain of {} blocks replaced by {}",
            inner.blocks.len(),
            candidate.len()
        );
        inner.blocks = candidate;
        Self::record_audit(&mut inner, AuditKind::ChainReplaced, None, Some(detail));
        Ok(ReplaceOutcome::Accepted)
    }

    async fn blocks_page(&self, query: BlockQuery) -> Result<BlockPage, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");

        let mut filtered: Vec<Block> = inner
            .blocks
            .iter()
            .filter(|b| match query.verified {
                VerifiedFilter::All => true,
                VerifiedFilter::Verified => b.verified,
                VerifiedFilter::Pending => !b.verified,
            })
            .cloned()
            .collect();

        match query.sort {
            BlockSort::Newest => filtered.sort_by(|a, b| b.block_number.cmp(&a.block_number)),
            BlockSort::Oldest | BlockSort::ByNumber => {
                filtered.sort_by_key(|b| b.block_number)
            }
        }

        let limit = query.limit.max(1);
        let total_blocks = filtered.len() as u64;
        let total_pages = total_blocks.div_ceil(limit as u64);
        let offset = (query.page.max(1) as usize - 1).saturating_mul(limit as usize);
        let blocks = filtered.into_iter().skip(offset).take(limit as usize).collect();

        Ok(BlockPage {
            blocks,
            page: query.page.max(1),
            limit,
            total_blocks,
            total_pages,
        })
    }

    async fn blocks_for_creator(
        &self,
        creator_id: CreatorId,
    ) -> Result<Vec<EncryptedEnvelope>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .blocks
            .iter()
            .filter(|b| b.creator_id == Some(creator_id))
            .map(Block::envelope)
            .collect())
    }

    async fn chain_stats(&self) -> Result<ChainStats, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        let total_blocks = inner.blocks.len() as u64;
        let verified_blocks = inner.blocks.iter().filter(|b| b.verified).count() as u64;

        let durations: Vec<u64> = inner
            .blocks
            .iter()
            .filter_map(|b| b.mining_duration_ms)
            .collect();
        let avg_mining_time_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
        };

        Ok(ChainStats {
            total_blocks,
            verified_blocks,
            pending_blocks: total_blocks - verified_blocks,
            avg_mining_time_ms,
            total_data_bytes: inner.blocks.iter().map(|b| b.data_size).sum(),
            latest_block_number: inner.blocks.last().map(|b| b.block_number),
        })
    }

    async fn pending_blocks(
        &self,
        limit: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Block>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .blocks
            .iter()
            .filter(|b| !b.verified)
            .filter(|b| older_than.map(|cutoff| b.created_at < cutoff).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_verification(
        &self,
        block_id: BlockId,
        outcome: VerificationOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        let block = inner
            .blocks
            .iter_mut()
            .find(|b| b.block_id == block_id)
            .ok_or_else(|| StoreError::Corrupted(format!("verification for unknown block {block_id}")))?;

        block.verified = outcome.verified;
        block.verified_at = Some(Utc::now());

        let kind = if outcome.verified {
            AuditKind::BlockVerifiedOk
        } else {
            AuditKind::BlockVerifiedFail
        };
        Self::record_audit(&mut inner, kind, Some(block_id), outcome.reason);
        Ok(())
    }

    async fn create_creator(&self, new: NewCreator) -> Result<Creator, StoreError> {
        let mut inner = self.inner.write().expect("store lock poisoned");

        if inner.creators.iter().any(|c| c.display_name == new.display_name) {
            return Err(StoreError::Conflict("display-name-taken".to_string()));
        }

        let creator = Creator {
            creator_id: CreatorId::generate(),
            display_name: new.display_name,
            public_key_pem: new.public_key_pem,
            active: true,
            created_at: Utc::now(),
        };
        inner.creators.push(creator.clone());
        Ok(creator)
    }

    async fn creator_by_id(&self, creator_id: CreatorId) -> Result<Option<Creator>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.creators.iter().find(|c| c.creator_id == creator_id).cloned())
    }

    async fn creator_by_display_name(&self, name: &str) -> Result<Option<Creator>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner.creators.iter().find(|c| c.display_name == name).cloned())
    }

    async fn list_creators(&self) -> Result<Vec<CreatorOverview>, StoreError> {
        let inner = self.inner.read().expect("store lock poisoned");
        Ok(inner
            .creators
            .iter()
            .filter(|c| c.active)
            .map(|c| CreatorOverview {
                creator: c.clone(),
                block_count: inner
                    .blocks
                    .iter()
                    .filter(|b| b.creator_id == Some(c.creator_id))
                    .count() as u64,
            })
            .collect())
    }

    async fn block_count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.read().expect("store lock poisoned").blocks.len() as u64)
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHash;

    fn dummy_draft(tag: &str, previous_hash: Option<BlockHash>) -> BlockDraft {
        BlockDraft {
            creator_id: Some(CreatorId::generate()),
            previous_hash,
            block_hash: BlockHash::compute(tag),
            nonce: 0,
            difficulty: 1,
            encrypted_data: vec![0u8; 48],
            data_iv: vec![0u8; DATA_IV_LEN],
            encrypted_data_key: vec![0u8; 16],
            data_size: 80,
            signature: vec![],
            created_at: Utc::now(),
            mining_duration_ms: Some(5),
        }
    }

    async fn append_ok(store: &MemLedgerStore, draft: BlockDraft) -> Block {
        match store.append_block(draft).await.expect("append") {
            AppendOutcome::Inserted(b) => b,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn genesis_append_and_tip() {
        let store = MemLedgerStore::new();
        assert!(store.latest_block().await.is_none());

        let block = append_ok(&store, dummy_draft("g", None)).await;
        assert_eq!(block.block_number, 1);
        assert!(block.previous_hash.is_none());
        assert!(!block.verified);

        let tip = store.latest_block().await.expect("tip after append");
        assert_eq!(tip.block_hash, block.block_hash);
    }

    #[tokio::test]
    async fn duplicate_hash_returns_existing_block() {
        let store = MemLedgerStore::new();
        let first = append_ok(&store, dummy_draft("g", None)).await;

        let replay = dummy_draft("g", None);
        match store.append_block(replay).await.expect("append") {
            AppendOutcome::Duplicate(existing) => assert_eq!(existing.block_id, first.block_id),
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(store.block_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_tip_and_genesis_shape_rejections() {
        let store = MemLedgerStore::new();
        let genesis = append_ok(&store, dummy_draft("g", None)).await;

        // Sentinel draft against a non-empty chain.
        match store.append_block(dummy_draft("late-genesis", None)).await.unwrap() {
            AppendOutcome::Rejected(c) => assert_eq!(c, REJECT_GENESIS_SHAPE),
            other => panic!("expected rejection, got {other:?}"),
        }

        // Linked draft against an empty chain.
        let empty = MemLedgerStore::new();
        match empty
            .append_block(dummy_draft("x", Some(genesis.block_hash.clone())))
            .await
            .unwrap()
        {
            AppendOutcome::Rejected(c) => assert_eq!(c, REJECT_GENESIS_SHAPE),
            other => panic!("expected rejection, got {other:?}"),
        }

        // Draft linked to a hash that is not the tip.
        match store
            .append_block(dummy_draft("y", Some(BlockHash::compute("stale"))))
            .await
            .unwrap()
        {
            AppendOutcome::Rejected(c) => assert_eq!(c, REJECT_STALE_TIP),
            other => panic!("expected rejection, got {other:?}"),
        }

        // Properly linked draft extends the chain.
        let second = append_ok(&store, dummy_draft("b2", Some(genesis.block_hash.clone()))).await;
        assert_eq!(second.block_number, 2);
    }

    #[tokio::test]
    async fn row_constraints_reject_bad_values() {
        let store = MemLedgerStore::new();

        let mut bad_difficulty = dummy_draft("d", None);
        bad_difficulty.difficulty = 11;
        assert!(matches!(
            store.append_block(bad_difficulty).await.unwrap(),
            AppendOutcome::Rejected(c) if c == "blocks_difficulty_range"
        ));

        let mut bad_iv = dummy_draft("iv", None);
        bad_iv.data_iv = vec![0u8; 15];
        assert!(matches!(
            store.append_block(bad_iv).await.unwrap(),
            AppendOutcome::Rejected(c) if c == "blocks_data_iv_length"
        ));

        let mut short_data = dummy_draft("short", None);
        short_data.encrypted_data = vec![0u8; 15];
        assert!(matches!(
            store.append_block(short_data).await.unwrap(),
            AppendOutcome::Rejected(c) if c == "blocks_encrypted_data_min"
        ));

        let mut zero_size = dummy_draft("zero", None);
        zero_size.data_size = 0;
        assert!(matches!(
            store.append_block(zero_size).await.unwrap(),
            AppendOutcome::Rejected(c) if c == "blocks_data_size_positive"
        ));

        assert_eq!(store.block_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_chain_applies_longest_rule() {
        let store = MemLedgerStore::new();
        let genesis = append_ok(&store, dummy_draft("g", None)).await;
        let second = append_ok(&store, dummy_draft("b2", Some(genesis.block_hash.clone()))).await;

        // Equal length: rejected, local chain unchanged.
        let equal = vec![genesis.clone(), second.clone()];
        assert!(matches!(
            store.replace_chain(equal).await.unwrap(),
            ReplaceOutcome::Rejected(_)
        ));
        assert_eq!(store.block_count().await.unwrap(), 2);

        // Strictly longer: accepted and the store equals the candidate.
        let other = MemLedgerStore::new();
        let og = append_ok(&other, dummy_draft("og", None)).await;
        let o2 = append_ok(&other, dummy_draft("o2", Some(og.block_hash.clone()))).await;
        let o3 = append_ok(&other, dummy_draft("o3", Some(o2.block_hash.clone()))).await;
        let candidate = other.load_chain().await.unwrap();

        assert_eq!(store.replace_chain(candidate.clone()).await.unwrap(), ReplaceOutcome::Accepted);
        let replaced = store.load_chain().await.unwrap();
        assert_eq!(replaced.len(), 3);
        assert_eq!(replaced[2].block_hash, o3.block_hash);
        assert_eq!(
            store.latest_block().await.unwrap().block_hash,
            o3.block_hash
        );
    }

    #[tokio::test]
    async fn verification_is_the_only_mutation() {
        let store = MemLedgerStore::new();
        let block = append_ok(&store, dummy_draft("g", None)).await;

        store
            .record_verification(
                block.block_id,
                VerificationOutcome {
                    verified: true,
                    reason: None,
                },
            )
            .await
            .expect("record verification");

        let after = store.latest_block().await.unwrap();
        assert!(after.verified);
        assert!(after.verified_at.is_some());
        // Everything else is untouched.
        assert_eq!(after.block_hash, block.block_hash);
        assert_eq!(after.block_number, block.block_number);
        assert_eq!(after.encrypted_data, block.encrypted_data);

        let audit = store.audit_events();
        assert!(audit.iter().any(|e| e.kind == AuditKind::BlockAppended));
        assert!(audit.iter().any(|e| e.kind == AuditKind::BlockVerifiedOk));
    }

    #[tokio::test]
    async fn pagination_filters_and_sorts() {
        let store = MemLedgerStore::new();
        let mut prev: Option<BlockHash> = None;
        for i in 0..5 {
            let b = append_ok(&store, dummy_draft(&format!("b{i}"), prev.clone())).await;
            prev = Some(b.block_hash.clone());
        }
        let first = store.block_by_number(1).await.unwrap().unwrap();
        store
            .record_verification(first.block_id, VerificationOutcome { verified: true, reason: None })
            .await
            .unwrap();

        let page = store
            .blocks_page(BlockQuery {
                page: 1,
                limit: 2,
                verified: VerifiedFilter::All,
                sort: BlockSort::Newest,
            })
            .await
            .unwrap();
        assert_eq!(page.total_blocks, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.blocks[0].block_number, 5);

        let pending = store
            .blocks_page(BlockQuery {
                page: 1,
                limit: 10,
                verified: VerifiedFilter::Pending,
                sort: BlockSort::ByNumber,
            })
            .await
            .unwrap();
        assert_eq!(pending.total_blocks, 4);
        assert_eq!(pending.blocks[0].block_number, 2);
    }

    #[tokio::test]
    async fn creators_are_unique_by_display_name() {
        let store = MemLedgerStore::new();
        store
            .create_creator(NewCreator {
                display_name: "alice".to_string(),
                public_key_pem: "pem".to_string(),
            })
            .await
            .expect("first registration");

        let err = store
            .create_creator(NewCreator {
                display_name: "alice".to_string(),
                public_key_pem: "pem2".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn creator_overviews_count_blocks() {
        let store = MemLedgerStore::new();
        let alice = store
            .create_creator(NewCreator {
                display_name: "alice".to_string(),
                public_key_pem: "pem".to_string(),
            })
            .await
            .unwrap();

        let mut draft = dummy_draft("g", None);
        draft.creator_id = Some(alice.creator_id);
        append_ok(&store, draft).await;

        let overviews = store.list_creators().await.unwrap();
        assert_eq!(overviews.len(), 1);
        assert_eq!(overviews[0].block_count, 1);

        let envelopes = store.blocks_for_creator(alice.creator_id).await.unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].block_number, 1);
    }
}
