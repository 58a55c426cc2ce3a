//! Chain read, prepare-mining, and commit routes.

use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledger::mining::CommitPayload;
use ledger::store::{BlockQuery, BlockSort, LedgerStore, VerifiedFilter};
use ledger::types::{Block, BlockHash, CreatorId};

use crate::error::ApiError;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub verified: Option<String>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
}

#[derive(Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total_blocks: u64,
    pub total_pages: u64,
}

#[derive(Serialize)]
pub struct BlocksResponse {
    pub blocks: Vec<Block>,
    pub pagination: Pagination,
}

/// `GET /blocks`
///
/// Paginated chain view; byte fields render as lowercase hex through the
/// block's own serialization.
pub async fn list<S: LedgerStore>(
    State(state): State<SharedState<S>>,
    Query(params): Query<ListParams>,
) -> Result<Json<BlocksResponse>, ApiError> {
    let verified = match params.verified.as_deref() {
        None | Some("all") => VerifiedFilter::All,
        Some("true") => VerifiedFilter::Verified,
        Some("false") => VerifiedFilter::Pending,
        Some(other) => {
            return Err(ApiError::validation(format!(
                "verified must be all|true|false, got {other:?}"
            )));
        }
    };
    let sort = match params.sort_by.as_deref() {
        None | Some("newest") => BlockSort::Newest,
        Some("oldest") => BlockSort::Oldest,
        Some("block_number") => BlockSort::ByNumber,
        Some(other) => {
            return Err(ApiError::validation(format!(
                "sortBy must be newest|oldest|block_number, got {other:?}"
            )));
        }
    };

    let query = BlockQuery {
        page: params.page.unwrap_or(1).max(1),
        limit: params.limit.unwrap_or(20).clamp(1, 100),
        verified,
        sort,
    };

    let page = state.store.blocks_page(query).await?;
    Ok(Json(BlocksResponse {
        pagination: Pagination {
            page: page.page,
            limit: page.limit,
            total_blocks: page.total_blocks,
            total_pages: page.total_pages,
        },
        blocks: page.blocks,
    }))
}

#[derive(Deserialize)]
pub struct PrepareRequest {
    pub display_name: String,
    pub data_text: String,
}

#[derive(Serialize)]
pub struct PrepareResponse {
    pub creator_id: String,
    pub public_key_pem: String,
    pub previous_hash: String,
    pub difficulty: u32,
}

/// `POST /blocks/prepare-mining`
///
/// Phase one of the protocol: no chain side effects.
pub async fn prepare_mining<S: LedgerStore>(
    State(state): State<SharedState<S>>,
    Json(body): Json<PrepareRequest>,
) -> Result<Json<PrepareResponse>, ApiError> {
    let prep = state
        .coordinator
        .prepare_mining(&body.display_name, body.data_text.len())
        .await?;

    Ok(Json(PrepareResponse {
        creator_id: prep.creator_id.to_string(),
        public_key_pem: prep.public_key_pem,
        previous_hash: prep.previous_hash.as_str().to_string(),
        difficulty: prep.difficulty,
    }))
}

/// `POST /blocks/commit` body; byte fields as lowercase hex.
#[derive(Deserialize)]
pub struct CommitRequest {
    pub creator_id: String,
    pub previous_hash: String,
    pub block_hash: String,
    pub nonce: String,
    pub difficulty: u32,
    pub encrypted_data: String,
    pub data_iv: String,
    pub encrypted_data_key: String,
    pub data_size: u64,
    pub signature: String,
    pub created_at: String,
    pub mining_duration_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct CommitResponse {
    pub status: &'static str,
    /// `true` when the payload replayed an already appended block.
    pub duplicate: bool,
    pub block: Block,
}

fn hex_field(name: &'static str, value: &str) -> Result<Vec<u8>, ApiError> {
    hex::decode(value).map_err(|_| ApiError::validation(format!("{name} is not valid hex")))
}

/// `POST /blocks/commit`
///
/// Phase two: validates the finished block, appends it, and broadcasts a
/// fresh insert to the peers.
pub async fn commit<S: LedgerStore>(
    State(state): State<SharedState<S>>,
    Json(body): Json<CommitRequest>,
) -> Result<(StatusCode, Json<CommitResponse>), ApiError> {
    let creator_id = body
        .creator_id
        .parse::<Uuid>()
        .map(CreatorId)
        .map_err(|_| ApiError::validation("creator_id is not a UUID"))?;

    let payload = CommitPayload {
        creator_id,
        previous_hash: BlockHash(body.previous_hash),
        block_hash: BlockHash(body.block_hash),
        nonce: body.nonce,
        difficulty: body.difficulty,
        encrypted_data: hex_field("encrypted_data", &body.encrypted_data)?,
        data_iv: hex_field("data_iv", &body.data_iv)?,
        encrypted_data_key: hex_field("encrypted_data_key", &body.encrypted_data_key)?,
        data_size: body.data_size,
        signature: hex_field("signature", &body.signature)?,
        created_at: body.created_at,
        mining_duration_ms: body.mining_duration_ms,
    };

    let started = Instant::now();
    let outcome = match state.coordinator.commit_block(payload).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.metrics.ledger.commits_rejected.inc();
            return Err(e.into());
        }
    };
    state
        .metrics
        .ledger
        .commit_validation_seconds
        .observe(started.elapsed().as_secs_f64());

    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        state.gossip.broadcast_block(&outcome.block);
        state.metrics.ledger.blocks_appended.inc();
        state
            .metrics
            .ledger
            .chain_height
            .set(outcome.block.block_number as i64);
        tracing::info!(
            block_number = outcome.block.block_number,
            hash = %outcome.block.block_hash,
            "block committed"
        );
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(CommitResponse {
            status: "ok",
            duplicate: outcome.duplicate,
            block: outcome.block,
        }),
    ))
}

#[derive(Serialize)]
pub struct ChainStatsBody {
    pub total_blocks: u64,
    pub verified_blocks: u64,
    pub pending_blocks: u64,
    pub avg_mining_time_ms: Option<f64>,
    pub total_data_bytes: u64,
    pub latest_block_number: Option<u64>,
}

#[derive(Serialize)]
pub struct ChainStatsResponse {
    pub stats: ChainStatsBody,
}

/// `GET /blocks/stats/summary`
pub async fn stats<S: LedgerStore>(
    State(state): State<SharedState<S>>,
) -> Result<Json<ChainStatsResponse>, ApiError> {
    let stats = state.store.chain_stats().await?;
    Ok(Json(ChainStatsResponse {
        stats: ChainStatsBody {
            total_blocks: stats.total_blocks,
            verified_blocks: stats.verified_blocks,
            pending_blocks: stats.pending_blocks,
            avg_mining_time_ms: stats.avg_mining_time_ms,
            total_data_bytes: stats.total_data_bytes,
            latest_block_number: stats.latest_block_number,
        },
    }))
}
