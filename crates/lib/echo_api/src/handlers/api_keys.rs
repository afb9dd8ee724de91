//! API key management for the calling user and app.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use echo_core::auth::api_keys;
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::Principal;
use crate::models::{ApiKeySummary, CreateApiKeyRequest, CreateApiKeyResponse};

/// `POST /v1/api-keys`: the plaintext key is only ever returned here.
pub async fn create_api_key_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateApiKeyRequest>,
) -> AppResult<(StatusCode, Json<CreateApiKeyResponse>)> {
    let name = body.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let (key, record) = api_keys::create_api_key(
        &state.pool,
        &state.config.api_key_salt,
        principal.user_id,
        principal.echo_app_id,
        name,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            id: record.id,
            key,
            key_prefix: record.key_prefix,
            name: record.name,
            echo_app_id: record.echo_app_id,
            created_at: record.created_at,
        }),
    ))
}

/// `GET /v1/api-keys`
pub async fn list_api_keys_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> AppResult<Json<Vec<ApiKeySummary>>> {
    let keys = api_keys::list_api_keys(&state.pool, principal.user_id, principal.echo_app_id).await?;
    Ok(Json(keys.into_iter().map(ApiKeySummary::from).collect()))
}

/// `DELETE /v1/api-keys/{id}`: deactivate one of the caller's keys.
pub async fn revoke_api_key_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(key_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    if api_keys::deactivate_api_key(&state.pool, key_id, principal.user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("API key not found".into()))
    }
}
