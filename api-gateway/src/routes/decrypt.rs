//! Encrypted envelope export for offline decryption.
//!
//! The server hands back exactly what a client with the matching private
//! key needs; possession of that key is the only access control, and the
//! payloads travel base64-encoded on this route.

use axum::extract::{Path, State};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use ledger::store::LedgerStore;
use ledger::types::{CreatorId, EncryptedEnvelope};

use crate::error::ApiError;
use crate::state::SharedState;

#[derive(Serialize)]
pub struct EnvelopeBody {
    pub block_id: String,
    pub block_number: u64,
    pub block_hash: String,
    pub created_at: DateTime<Utc>,
    /// AES-256-GCM ciphertext + tag, base64.
    pub encrypted_data: String,
    /// 16-byte IV, base64.
    pub data_iv: String,
    /// OAEP-wrapped AES key, base64.
    pub encrypted_data_key: String,
    pub data_size: u64,
    pub verified: bool,
}

impl From<&EncryptedEnvelope> for EnvelopeBody {
    fn from(envelope: &EncryptedEnvelope) -> Self {
        Self {
            block_id: envelope.block_id.to_string(),
            block_number: envelope.block_number,
            block_hash: envelope.block_hash.as_str().to_string(),
            created_at: envelope.created_at,
            encrypted_data: BASE64.encode(&envelope.encrypted_data),
            data_iv: BASE64.encode(&envelope.data_iv),
            encrypted_data_key: BASE64.encode(&envelope.encrypted_data_key),
            data_size: envelope.data_size,
            verified: envelope.verified,
        }
    }
}

#[derive(Serialize)]
pub struct EnvelopesResponse {
    pub creator_id: String,
    pub blocks: Vec<EnvelopeBody>,
}

/// `GET /decrypt/blocks/{creator_id}`
pub async fn blocks_for_creator<S: LedgerStore>(
    State(state): State<SharedState<S>>,
    Path(creator_id): Path<String>,
) -> Result<Json<EnvelopesResponse>, ApiError> {
    let creator_id = creator_id
        .parse::<Uuid>()
        .map(CreatorId)
        .map_err(|_| ApiError::validation("creator_id is not a UUID"))?;

    state
        .store
        .creator_by_id(creator_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no creator {creator_id}")))?;

    let envelopes = state.store.blocks_for_creator(creator_id).await?;
    Ok(Json(EnvelopesResponse {
        creator_id: creator_id.to_string(),
        blocks: envelopes.iter().map(EnvelopeBody::from).collect(),
    }))
}
