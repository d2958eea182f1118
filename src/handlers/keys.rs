use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::key::{EncryptedEnvelope, EncryptionKey},
    models::session::Session,
    state::AppState,
};

#[derive(Deserialize)]
pub struct PassphraseRequest {
    pub passphrase: String,
}

#[derive(Deserialize)]
pub struct SessionKeyRequest {
    pub master_key_id: Uuid,
}

#[derive(Deserialize)]
pub struct DataKeyRequest {
    pub session_key_id: Uuid,
}

#[derive(Deserialize)]
pub struct EncryptRequest {
    pub key_id: Uuid,
    /// Base64 (standard alphabet).
    pub plaintext: String,
}

#[derive(Serialize)]
pub struct DecryptResponse {
    /// Base64 (standard alphabet).
    pub plaintext: String,
}

#[derive(Serialize)]
pub struct KeyActionResponse {
    pub success: bool,
    pub key_id: Uuid,
}

/// An [`EncryptedEnvelope`] with its byte fields base64-encoded.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnvelopePayload {
    pub ciphertext: String,
    pub iv: String,
    pub key_id: Uuid,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
}

impl From<EncryptedEnvelope> for EnvelopePayload {
    fn from(envelope: EncryptedEnvelope) -> Self {
        Self {
            ciphertext: STANDARD.encode(&envelope.ciphertext),
            iv: STANDARD.encode(&envelope.iv),
            key_id: envelope.key_id,
            algorithm: envelope.algorithm,
            created_at: envelope.created_at,
        }
    }
}

impl TryFrom<EnvelopePayload> for EncryptedEnvelope {
    type Error = AppError;

    fn try_from(payload: EnvelopePayload) -> Result<Self> {
        Ok(Self {
            ciphertext: decode_field("ciphertext", &payload.ciphertext)?,
            iv: decode_field("iv", &payload.iv)?,
            key_id: payload.key_id,
            algorithm: payload.algorithm,
            created_at: payload.created_at,
        })
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|_| AppError::Validation(format!("Field '{}' is not valid base64", name)))
}

/// Loads a key and checks the caller owns it. Keys of other owners are
/// reported as missing.
async fn owned_key(state: &AppState, session: &Session, key_id: Uuid) -> Result<EncryptionKey> {
    let key = state.keys.get_key(key_id).await?;
    if key.owner_id != session.user_id {
        tracing::warn!(%key_id, user_id = %session.user_id, "❌ Key access by non-owner");
        return Err(AppError::KeyNotFound);
    }
    Ok(key)
}

/// Lists the caller's keys.
pub async fn list_keys(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<EncryptionKey>>> {
    Ok(Json(state.keys.list_keys(session.user_id).await?))
}

/// Derives a new master key for the caller from a passphrase.
pub async fn create_master_key(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<PassphraseRequest>,
) -> Result<Response> {
    let key = state
        .keys
        .generate_master_key(session.user_id, &payload.passphrase)
        .await?;
    Ok((StatusCode::CREATED, Json(key)).into_response())
}

/// Makes a stored master key usable again, e.g. after a restart.
pub async fn unlock_master_key(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(key_id): Path<Uuid>,
    Json(payload): Json<PassphraseRequest>,
) -> Result<Response> {
    owned_key(&state, &session, key_id).await?;
    state.keys.unlock_master_key(key_id, &payload.passphrase).await?;

    let response = KeyActionResponse { success: true, key_id };
    Ok((StatusCode::OK, Json(response)).into_response())
}

pub async fn create_session_key(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<SessionKeyRequest>,
) -> Result<Response> {
    let key = state
        .keys
        .generate_session_key(session.user_id, payload.master_key_id)
        .await?;
    Ok((StatusCode::CREATED, Json(key)).into_response())
}

pub async fn create_data_key(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<DataKeyRequest>,
) -> Result<Response> {
    let key = state
        .keys
        .generate_data_key(session.user_id, payload.session_key_id)
        .await?;
    Ok((StatusCode::CREATED, Json(key)).into_response())
}

pub async fn deactivate_key(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(key_id): Path<Uuid>,
) -> Result<Response> {
    owned_key(&state, &session, key_id).await?;
    let changed = state.keys.deactivate_key(key_id).await?;

    let response = KeyActionResponse { success: changed, key_id };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Encrypts a base64 payload and returns the envelope.
pub async fn encrypt(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<EncryptRequest>,
) -> Result<Json<EnvelopePayload>> {
    owned_key(&state, &session, payload.key_id).await?;
    let plaintext = zeroize::Zeroizing::new(decode_field("plaintext", &payload.plaintext)?);

    let envelope = state.keys.encrypt(&plaintext, payload.key_id).await?;
    Ok(Json(envelope.into()))
}

/// Opens an envelope and returns the plaintext as base64.
pub async fn decrypt(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<EnvelopePayload>,
) -> Result<Json<DecryptResponse>> {
    let envelope = EncryptedEnvelope::try_from(payload)?;
    owned_key(&state, &session, envelope.key_id).await?;

    let plaintext = state.keys.decrypt(&envelope).await?;
    Ok(Json(DecryptResponse {
        plaintext: STANDARD.encode(plaintext.as_slice()),
    }))
}
