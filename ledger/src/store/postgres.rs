// ledger/src/store/postgres.rs

//! PostgreSQL-backed ledger store.
//!
//! The database owns the hard invariants: `block_hash` uniqueness, the
//! genesis shape, value ranges, and the append-only trigger that permits
//! only `(verified, verified_at)` updates. This module adds:
//!
//! - a transaction-scoped advisory lock that serializes appends and
//!   replacements, so the tip re-read inside each transaction is
//!   authoritative,
//! - a cached in-memory view of the chain, warmed at connect time and
//!   refreshed only after successful writes,
//! - mapping of constraint violations onto [`AppendOutcome::Rejected`]
//!   with the violated constraint's name.
//!
//! Queries use the runtime string API rather than the compile-time
//! checked macros, so builds do not need a live database.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::types::{
    Block, BlockDraft, BlockHash, BlockId, Creator, CreatorId, CreatorOverview, EncryptedEnvelope,
    NewCreator,
};

use super::{
    AppendOutcome, AuditKind, BlockPage, BlockQuery, BlockSort, ChainStats, LedgerStore,
    ReplaceOutcome, StoreError, VerificationOutcome, VerifiedFilter, REJECT_GENESIS_SHAPE,
    REJECT_STALE_TIP,
};

/// Advisory lock key serializing chain writes on one database.
const CHAIN_WRITE_LOCK: i64 = 0x6c65_6467_6572_0001;

const BLOCK_COLUMNS: &str = "block_id, block_number, creator_id, previous_hash, block_hash, \
     nonce, difficulty, encrypted_data, data_iv, encrypted_data_key, data_size, signature, \
     created_at, verified, verified_at, mining_duration_ms";

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.constraint() == Some("creators_display_name_unique") => {
                StoreError::Conflict("display-name-taken".to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupted(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// PostgreSQL implementation of [`LedgerStore`].
pub struct PgLedgerStore {
    pool: PgPool,
    /// Cached chain view in ascending `block_number` order. An
    /// optimization only: writers re-derive the tip inside their own
    /// transaction.
    chain: RwLock<Vec<Block>>,
}

impl PgLedgerStore {
    /// Connects to the database, runs embedded migrations, and warms the
    /// in-memory chain view.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // Bound tail latency of every query on this connection.
                    sqlx::query("SET statement_timeout = '30s'")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;

        let store = Self {
            pool,
            chain: RwLock::new(Vec::new()),
        };
        store.refresh_cache().await?;
        Ok(store)
    }

    async fn load_chain_rows(&self) -> Result<Vec<Block>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY block_number ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_block).collect()
    }

    /// Reloads the cached view from the database.
    async fn refresh_cache(&self) -> Result<(), StoreError> {
        let chain = self.load_chain_rows().await?;
        *self.chain.write().expect("chain cache poisoned") = chain;
        Ok(())
    }

    async fn insert_audit(
        tx: &mut Transaction<'_, Postgres>,
        kind: AuditKind,
        block_id: Option<BlockId>,
        detail: Option<String>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO audit.events (event_type, block_id, detail) VALUES ($1, $2, $3)")
            .bind(kind.as_str())
            .bind(block_id.map(|id| *id.as_uuid()))
            .bind(detail)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn take_write_lock(tx: &mut Transaction<'_, Postgres>) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CHAIN_WRITE_LOCK)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn row_to_block(row: &PgRow) -> Result<Block, StoreError> {
    Ok(Block {
        block_id: BlockId(row.try_get::<Uuid, _>("block_id")?),
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        creator_id: row.try_get::<Option<Uuid>, _>("creator_id")?.map(CreatorId),
        previous_hash: row.try_get::<Option<String>, _>("previous_hash")?.map(BlockHash),
        block_hash: BlockHash(row.try_get("block_hash")?),
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        difficulty: row.try_get::<i32, _>("difficulty")? as u32,
        encrypted_data: row.try_get("encrypted_data")?,
        data_iv: row.try_get("data_iv")?,
        encrypted_data_key: row.try_get("encrypted_data_key")?,
        data_size: row.try_get::<i64, _>("data_size")? as u64,
        signature: row.try_get("signature")?,
        created_at: row.try_get("created_at")?,
        verified: row.try_get("verified")?,
        verified_at: row.try_get("verified_at")?,
        mining_duration_ms: row
            .try_get::<Option<i64>, _>("mining_duration_ms")?
            .map(|ms| ms as u64),
    })
}

fn row_to_creator(row: &PgRow) -> Result<Creator, StoreError> {
    Ok(Creator {
        creator_id: CreatorId(row.try_get::<Uuid, _>("creator_id")?),
        display_name: row.try_get("display_name")?,
        public_key_pem: row.try_get("public_key_pem")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn load_chain(&self) -> Result<Vec<Block>, StoreError> {
        let chain = self.load_chain_rows().await?;
        *self.chain.write().expect("chain cache poisoned") = chain.clone();
        Ok(chain)
    }

    async fn latest_block(&self) -> Option<Block> {
        self.chain.read().expect("chain cache poisoned").last().cloned()
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE block_number = $1"
        ))
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_block).transpose()
    }

    async fn append_block(&self, draft: BlockDraft) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::take_write_lock(&mut tx).await?;

        // Conflict key: an identical hash is a benign replay.
        let existing = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE block_hash = $1"
        ))
        .bind(draft.block_hash.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            return Ok(AppendOutcome::Duplicate(row_to_block(&row)?));
        }

        // Authoritative tip, re-read inside the transaction.
        let tip = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY block_number DESC LIMIT 1"
        ))
        .fetch_optional(&mut *tx)
        .await?;
        let tip = tip.as_ref().map(row_to_block).transpose()?;

        let (block_number, previous_hash) = match (tip, &draft.previous_hash) {
            (None, None) => (1u64, None),
            (None, Some(_)) | (Some(_), None) => {
                return Ok(AppendOutcome::Rejected(REJECT_GENESIS_SHAPE.to_string()));
            }
            (Some(tip), Some(prev)) => {
                if prev != &tip.block_hash {
                    drop(tx);
                    // The cached view may be behind whoever moved the tip.
                    self.refresh_cache().await?;
                    return Ok(AppendOutcome::Rejected(REJECT_STALE_TIP.to_string()));
                }
                (tip.block_number + 1, Some(prev.clone()))
            }
        };

        let block_id = BlockId::generate();
        let inserted = sqlx::query(&format!(
            "INSERT INTO blocks (block_id, block_number, creator_id, previous_hash, block_hash, \
             nonce, difficulty, encrypted_data, data_iv, encrypted_data_key, data_size, \
             signature, created_at, verified, verified_at, mining_duration_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, FALSE, NULL, $14) \
             RETURNING {BLOCK_COLUMNS}"
        ))
        .bind(*block_id.as_uuid())
        .bind(block_number as i64)
        .bind(draft.creator_id.map(|id| *id.as_uuid()))
        .bind(previous_hash.as_ref().map(|h| h.as_str().to_string()))
        .bind(draft.block_hash.as_str())
        .bind(draft.nonce as i64)
        .bind(draft.difficulty as i32)
        .bind(&draft.encrypted_data)
        .bind(&draft.data_iv)
        .bind(&draft.encrypted_data_key)
        .bind(draft.data_size as i64)
        .bind(&draft.signature)
        .bind(draft.created_at)
        .bind(draft.mining_duration_ms.map(|ms| ms as i64))
        .fetch_one(&mut *tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(sqlx::Error::Database(db)) => {
                let constraint = db.constraint().unwrap_or("blocks-insert").to_string();
                return Ok(AppendOutcome::Rejected(constraint));
            }
            Err(e) => return Err(e.into()),
        };
        let block = row_to_block(&row)?;

        Self::insert_audit(
            &mut tx,
            AuditKind::BlockAppended,
            Some(block.block_id),
            Some(format!("block {} appended", block.block_number)),
        )
        .await?;
        tx.commit().await?;

        self.chain.write().expect("chain cache poisoned").push(block.clone());
        Ok(AppendOutcome::Inserted(block))
    }

    async fn replace_chain(&self, candidate: Vec<Block>) -> Result<ReplaceOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::take_write_lock(&mut tx).await?;

        let current: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
            .fetch_one(&mut *tx)
            .await?;
        if candidate.len() as i64 <= current {
            return Ok(ReplaceOutcome::Rejected(format!(
                "candidate of {} blocks is not longer than the local {current}",
                candidate.len()
            )));
        }

        // Open the append-only gate for this transaction only.
        sqlx::query("SELECT set_config('ledger.allow_chain_swap', 'on', true)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM blocks").execute(&mut *tx).await?;

        for block in &candidate {
            sqlx::query(
                "INSERT INTO blocks (block_id, block_number, creator_id, previous_hash, \
                 block_hash, nonce, difficulty, encrypted_data, data_iv, encrypted_data_key, \
                 data_size, signature, created_at, verified, verified_at, mining_duration_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            )
            .bind(*block.block_id.as_uuid())
            .bind(block.block_number as i64)
            .bind(block.creator_id.map(|id| *id.as_uuid()))
            .bind(block.previous_hash.as_ref().map(|h| h.as_str().to_string()))
            .bind(block.block_hash.as_str())
            .bind(block.nonce as i64)
            .bind(block.difficulty as i32)
            .bind(&block.encrypted_data)
            .bind(&block.data_iv)
            .bind(&block.encrypted_data_key)
            .bind(block.data_size as i64)
            .bind(&block.signature)
            .bind(block.created_at)
            .bind(block.verified)
            .bind(block.verified_at)
            .bind(block.mining_duration_ms.map(|ms| ms as i64))
            .execute(&mut *tx)
            .await?;
        }

        Self::insert_audit(
            &mut tx,
            AuditKind::ChainReplaced,
            None,
            Some(format!("chain of {current} blocks replaced by {}", candidate.len())),
        )
        .await?;
        tx.commit().await?;

        *self.chain.write().expect("chain cache poisoned") = candidate;
        Ok(ReplaceOutcome::Accepted)
    }

    async fn blocks_page(&self, query: BlockQuery) -> Result<BlockPage, StoreError> {
        let filter = match query.verified {
            VerifiedFilter::All => "",
            VerifiedFilter::Verified => "WHERE verified",
            VerifiedFilter::Pending => "WHERE NOT verified",
        };
        let order = match query.sort {
            BlockSort::Newest => "block_number DESC",
            BlockSort::Oldest | BlockSort::ByNumber => "block_number ASC",
        };

        let limit = query.limit.max(1);
        let page = query.page.max(1);
        let offset = (page - 1) as i64 * limit as i64;

        let total_blocks: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM blocks {filter}"))
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks {filter} ORDER BY {order} LIMIT $1 OFFSET $2"
        ))
        .bind(limit as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let blocks = rows.iter().map(row_to_block).collect::<Result<Vec<_>, _>>()?;

        Ok(BlockPage {
            blocks,
            page,
            limit,
            total_blocks: total_blocks as u64,
            total_pages: (total_blocks as u64).div_ceil(limit as u64),
        })
    }

    async fn blocks_for_creator(
        &self,
        creator_id: CreatorId,
    ) -> Result<Vec<EncryptedEnvelope>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE creator_id = $1 ORDER BY block_number ASC"
        ))
        .bind(*creator_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row_to_block(row).map(|b| b.envelope()))
            .collect()
    }

    async fn chain_stats(&self) -> Result<ChainStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE verified) AS verified, \
                    AVG(mining_duration_ms)::float8 AS avg_ms, \
                    COALESCE(SUM(data_size), 0)::bigint AS total_bytes, \
                    MAX(block_number) AS latest \
             FROM blocks",
        )
        .fetch_one(&self.pool)
        .await?;

        let total = row.try_get::<i64, _>("total")? as u64;
        let verified = row.try_get::<i64, _>("verified")? as u64;
        Ok(ChainStats {
            total_blocks: total,
            verified_blocks: verified,
            pending_blocks: total - verified,
            avg_mining_time_ms: row.try_get::<Option<f64>, _>("avg_ms")?,
            total_data_bytes: row.try_get::<i64, _>("total_bytes")? as u64,
            latest_block_number: row.try_get::<Option<i64>, _>("latest")?.map(|n| n as u64),
        })
    }

    async fn pending_blocks(
        &self,
        limit: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Block>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks \
             WHERE NOT verified AND ($2::timestamptz IS NULL OR created_at < $2) \
             ORDER BY block_number ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_block).collect()
    }

    async fn record_verification(
        &self,
        block_id: BlockId,
        outcome: VerificationOutcome,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "UPDATE blocks SET verified = $2, verified_at = now() \
             WHERE block_id = $1 RETURNING {BLOCK_COLUMNS}"
        ))
        .bind(*block_id.as_uuid())
        .bind(outcome.verified)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::Corrupted(format!("verification for unknown block {block_id}")))?;
        let block = row_to_block(&row)?;

        let kind = if outcome.verified {
            AuditKind::BlockVerifiedOk
        } else {
            AuditKind::BlockVerifiedFail
        };
        Self::insert_audit(&mut tx, kind, Some(block_id), outcome.reason).await?;
        tx.commit().await?;

        let mut chain = self.chain.write().expect("chain cache poisoned");
        if let Some(cached) = chain.iter_mut().find(|b| b.block_id == block_id) {
            cached.verified = block.verified;
            cached.verified_at = block.verified_at;
        }
        Ok(())
    }

    async fn create_creator(&self, new: NewCreator) -> Result<Creator, StoreError> {
        let row = sqlx::query(
            "INSERT INTO creators (creator_id, display_name, public_key_pem, active) \
             VALUES ($1, $2, $3, TRUE) \
             RETURNING creator_id, display_name, public_key_pem, active, created_at",
        )
        .bind(*CreatorId::generate().as_uuid())
        .bind(&new.display_name)
        .bind(&new.public_key_pem)
        .fetch_one(&self.pool)
        .await?;
        row_to_creator(&row)
    }

    async fn creator_by_id(&self, creator_id: CreatorId) -> Result<Option<Creator>, StoreError> {
        let row = sqlx::query(
            "SELECT creator_id, display_name, public_key_pem, active, created_at \
             FROM creators WHERE creator_id = $1 AND active",
        )
        .bind(*creator_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_creator).transpose()
    }

    async fn creator_by_display_name(&self, name: &str) -> Result<Option<Creator>, StoreError> {
        let row = sqlx::query(
            "SELECT creator_id, display_name, public_key_pem, active, created_at \
             FROM creators WHERE display_name = $1 AND active",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_creator).transpose()
    }

    async fn list_creators(&self) -> Result<Vec<CreatorOverview>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.creator_id, c.display_name, c.public_key_pem, c.active, c.created_at, \
                    COUNT(b.block_id) AS block_count \
             FROM creators c \
             LEFT JOIN blocks b ON b.creator_id = c.creator_id \
             WHERE c.active \
             GROUP BY c.creator_id, c.display_name, c.public_key_pem, c.active, c.created_at \
             ORDER BY c.created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CreatorOverview {
                    creator: row_to_creator(row)?,
                    block_count: row.try_get::<i64, _>("block_count")? as u64,
                })
            })
            .collect()
    }

    async fn block_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
