//! Creator registration and lookup routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ledger::crypto;
use ledger::store::LedgerStore;
use ledger::types::{valid_display_name, CreatorOverview, NewCreator};

use crate::error::ApiError;
use crate::state::SharedState;

/// Public view of a creator.
#[derive(Serialize)]
pub struct CreatorSummary {
    pub creator_id: String,
    pub display_name: String,
    /// RSA modulus size in bits, when the stored key parses.
    pub key_size: Option<usize>,
    pub key_algorithm: &'static str,
    pub created_at: DateTime<Utc>,
    pub block_count: u64,
}

impl From<&CreatorOverview> for CreatorSummary {
    fn from(overview: &CreatorOverview) -> Self {
        let key_size = crypto::parse_public_key_pem(&overview.creator.public_key_pem)
            .map(|key| crypto::key_bits(&key))
            .ok();
        Self {
            creator_id: overview.creator.creator_id.to_string(),
            display_name: overview.creator.display_name.clone(),
            key_size,
            key_algorithm: "RSA",
            created_at: overview.creator.created_at,
            block_count: overview.block_count,
        }
    }
}

#[derive(Serialize)]
pub struct CreatorsResponse {
    pub creators: Vec<CreatorSummary>,
}

/// `GET /creators`
pub async fn list<S: LedgerStore>(
    State(state): State<SharedState<S>>,
) -> Result<Json<CreatorsResponse>, ApiError> {
    let overviews = state.store.list_creators().await?;
    Ok(Json(CreatorsResponse {
        creators: overviews.iter().map(CreatorSummary::from).collect(),
    }))
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub display_name: String,
    pub public_key_pem: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub creator: CreatorSummary,
}

/// `POST /creators`
///
/// Validates the display name and the RSA modulus before touching the
/// store; registration is the only moment key material is inspected.
pub async fn register<S: LedgerStore>(
    State(state): State<SharedState<S>>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    if !valid_display_name(&body.display_name) {
        return Err(ApiError::validation(
            "display_name must be 3-255 characters of [A-Za-z0-9_-]",
        ));
    }
    let key = crypto::parse_registration_key(&body.public_key_pem)
        .map_err(|e| ApiError::validation(e.to_string()))?;
    let key_size = crypto::key_bits(&key);

    let creator = state
        .store
        .create_creator(NewCreator {
            display_name: body.display_name,
            public_key_pem: body.public_key_pem,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            creator: CreatorSummary {
                creator_id: creator.creator_id.to_string(),
                display_name: creator.display_name,
                key_size: Some(key_size),
                key_algorithm: "RSA",
                created_at: creator.created_at,
                block_count: 0,
            },
        }),
    ))
}

#[derive(Serialize)]
pub struct PublicKeyResponse {
    pub creator_id: String,
    pub public_key_pem: String,
}

/// `GET /creators/{display_name}/public-key`
pub async fn public_key<S: LedgerStore>(
    State(state): State<SharedState<S>>,
    Path(display_name): Path<String>,
) -> Result<Json<PublicKeyResponse>, ApiError> {
    let creator = state
        .store
        .creator_by_display_name(&display_name)
        .await?
        .filter(|c| c.active)
        .ok_or_else(|| ApiError::not_found(format!("no active creator named {display_name:?}")))?;

    Ok(Json(PublicKeyResponse {
        creator_id: creator.creator_id.to_string(),
        public_key_pem: creator.public_key_pem,
    }))
}

#[derive(Serialize)]
pub struct CreatorStats {
    pub total_creators: usize,
    pub avg_key_size: Option<f64>,
    pub total_blocks_signed: u64,
}

#[derive(Serialize)]
pub struct CreatorStatsResponse {
    pub stats: CreatorStats,
}

/// `GET /creators/stats/summary`
pub async fn stats<S: LedgerStore>(
    State(state): State<SharedState<S>>,
) -> Result<Json<CreatorStatsResponse>, ApiError> {
    let overviews = state.store.list_creators().await?;

    let key_sizes: Vec<usize> = overviews
        .iter()
        .filter_map(|o| {
            crypto::parse_public_key_pem(&o.creator.public_key_pem)
                .map(|key| crypto::key_bits(&key))
                .ok()
        })
        .collect();
    let avg_key_size = if key_sizes.is_empty() {
        None
    } else {
        Some(key_sizes.iter().sum::<usize>() as f64 / key_sizes.len() as f64)
    };

    Ok(Json(CreatorStatsResponse {
        stats: CreatorStats {
            total_creators: overviews.len(),
            avg_key_size,
            total_blocks_signed: overviews.iter().map(|o| o.block_count).sum(),
        },
    }))
}
