//! Spend pool administration. Owners and admins only.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use echo_core::auth::queries;
use echo_core::billing::spend_pool;
use echo_core::models::auth::MembershipStatus;
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::Principal;
use crate::models::{CreateSpendPoolRequest, SpendPoolResponse};

/// `POST /v1/apps/{id}/spend-pools`: ensure the default pool, or create a named one.
pub async fn create_spend_pool_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app_id): Path<Uuid>,
    Json(body): Json<CreateSpendPoolRequest>,
) -> AppResult<(StatusCode, Json<SpendPoolResponse>)> {
    require_manager(&state, &principal, app_id).await?;

    if body
        .per_user_spend_limit
        .is_some_and(|l| l.is_sign_negative())
    {
        return Err(AppError::Validation(
            "per_user_spend_limit must not be negative".into(),
        ));
    }

    let pool = match body.name.as_deref() {
        None => {
            let mut conn = state.pool.acquire().await?;
            spend_pool::ensure_default_pool(&mut conn, app_id, body.per_user_spend_limit).await?
        }
        Some(name) => {
            spend_pool::create_named_pool(&state.pool, app_id, name, body.per_user_spend_limit)
                .await?
        }
    };

    Ok((StatusCode::CREATED, Json(pool.into())))
}

/// `GET /v1/apps/{id}/spend-pools`
pub async fn list_spend_pools_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app_id): Path<Uuid>,
) -> AppResult<Json<Vec<SpendPoolResponse>>> {
    require_manager(&state, &principal, app_id).await?;
    let pools = spend_pool::list_active_pools(&state.pool, app_id).await?;
    Ok(Json(pools.into_iter().map(SpendPoolResponse::from).collect()))
}

async fn require_manager(state: &AppState, principal: &Principal, app_id: Uuid) -> AppResult<()> {
    if app_id != principal.echo_app_id {
        return Err(AppError::Forbidden(
            "Credential was not issued for this app".into(),
        ));
    }
    let membership = queries::find_membership(&state.pool, principal.user_id, app_id).await?;
    match membership {
        Some(m) if m.status == MembershipStatus::Active && m.role.can_manage() => Ok(()),
        _ => Err(AppError::Forbidden(
            "Only app owners and admins manage spend pools".into(),
        )),
    }
}
