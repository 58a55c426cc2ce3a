//! Background verifier: periodic re-verification of stored blocks.
//!
//! Each tick reads up to a batch of pending blocks (`verified = false`)
//! in ascending `block_number` order and re-runs the full validity
//! predicate against the store: hash recomputation, proof-of-work, the
//! chain link to the predecessor, the signature under the creator's
//! current public key, and a best-effort shape check. The verdict is the
//! only mutation ever applied to a block, and the store writes the audit
//! record in the same transaction.
//!
//! Per-block failures never abort the tick; tick-level failures are
//! logged and retried on the next tick.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::VerifierConfig;
use crate::crypto;
use crate::store::{LedgerStore, StoreError, VerificationOutcome};
use crate::types::Block;
use crate::validation::{check_hash, check_link, check_pow, check_shape, check_signature};

/// Counters for one verifier tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub processed: usize,
    pub verified: usize,
    pub failed: usize,
}

/// Periodic verifier over a chain store.
pub struct Verifier<S> {
    store: Arc<S>,
    config: VerifierConfig,
}

impl<S> Verifier<S>
where
    S: LedgerStore,
{
    pub fn new(store: Arc<S>, config: VerifierConfig) -> Self {
        Self { store, config }
    }

    /// Runs the verifier loop until the owning task is aborted.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            period_secs = self.config.period.as_secs(),
            batch = self.config.batch_size,
            "verifier running"
        );

        loop {
            interval.tick().await;
            match self.run_tick().await {
                Ok(summary) if summary.processed > 0 => {
                    info!(
                        processed = summary.processed,
                        verified = summary.verified,
                        failed = summary.failed,
                        "verifier tick finished"
                    );
                }
                Ok(_) => debug!("verifier tick found no pending blocks"),
                Err(e) => warn!("verifier tick failed: {e}"),
            }
        }
    }

    /// Processes one batch of pending blocks.
    pub async fn run_tick(&self) -> Result<TickSummary, StoreError> {
        let older_than = if self.config.min_age.is_zero() {
            None
        } else {
            Utc::now()
                .checked_sub_signed(chrono::Duration::from_std(self.config.min_age).unwrap_or_default())
        };

        let pending = self.store.pending_blocks(self.config.batch_size, older_than).await?;
        let mut summary = TickSummary {
            processed: pending.len(),
            ..TickSummary::default()
        };

        for block in pending {
            let outcome = self.verify_block(&block).await;
            if outcome.verified {
                summary.verified += 1;
            } else {
                summary.failed += 1;
                warn!(
                    block_number = block.block_number,
                    reason = outcome.reason.as_deref().unwrap_or("unknown"),
                    "block failed verification"
                );
            }

            if let Err(e) = self.store.record_verification(block.block_id, outcome).await {
                // Keep going; the block stays pending and is retried.
                warn!(block_number = block.block_number, "failed to record verification: {e}");
            }
        }

        Ok(summary)
    }

    /// Runs the five checks against one stored block.
    async fn verify_block(&self, block: &Block) -> VerificationOutcome {
        let fail = |reason: String| VerificationOutcome {
            verified: false,
            reason: Some(reason),
        };

        if let Err(e) = check_hash(&block.block_hash, &block.canonical_hash_input()) {
            return fail(e.to_string());
        }
        if let Err(e) = check_pow(&block.block_hash, block.difficulty) {
            return fail(e.to_string());
        }

        // Chain link against the stored predecessor.
        let predecessor = if block.block_number > 1 {
            match self.store.block_by_number(block.block_number - 1).await {
                Ok(prev) => prev,
                Err(e) => return fail(format!("predecessor lookup failed: {e}")),
            }
        } else {
            None
        };
        if let Err(e) = check_link(block, predecessor.as_ref()) {
            return fail(e.to_string());
        }

        // Signature under the creator's current public key.
        let creator = match block.creator_id {
            None => return fail("block has no creator".to_string()),
            Some(id) => match self.store.creator_by_id(id).await {
                Ok(Some(c)) => c,
                Ok(None) => return fail(format!("creator {id} is not registered")),
                Err(e) => return fail(format!("creator lookup failed: {e}")),
            },
        };
        let key = match crypto::parse_public_key_pem(&creator.public_key_pem) {
            Ok(key) => key,
            Err(e) => return fail(format!("creator key unusable: {e}")),
        };
        if let Err(e) = check_signature(&key, &block.block_hash, &block.signature) {
            return fail(e.to_string());
        }

        // Best-effort shape check.
        if let Err(e) = check_shape(
            &block.encrypted_data,
            &block.data_iv,
            &block.encrypted_data_key,
            block.data_size,
            Some(crypto::key_size_bytes(&key)),
        ) {
            return fail(e.to_string());
        }

        VerificationOutcome {
            verified: true,
            reason: None,
        }
    }
}
