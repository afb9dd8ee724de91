//! Bearer-authenticated account resources.

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use echo_core::auth::queries;
use echo_core::billing::{ledger, spend_pool};
use echo_core::models::billing::Transaction;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::Principal;
use crate::models::{AppResponse, BalanceResponse, SpendPoolBalance, UserResponse};

const DEFAULT_TRANSACTION_PAGE: i64 = 50;
const MAX_TRANSACTION_PAGE: i64 = 500;

/// `GET /v1/balance`: personal balance plus what the app's pools still offer this user.
pub async fn balance_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> AppResult<Json<BalanceResponse>> {
    let user = queries::find_user(&state.pool, principal.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    let mut spend_pools = Vec::new();
    for pool in spend_pool::list_active_pools(&state.pool, principal.echo_app_id).await? {
        let spent = spend_pool::user_usage(&state.pool, user.id, pool.id).await?;
        spend_pools.push(SpendPoolBalance {
            id: pool.id,
            balance: pool.balance(),
            user_remaining: pool.per_user_remaining(spent),
        });
    }

    Ok(Json(BalanceResponse {
        total_paid: user.total_paid,
        total_spent: user.total_spent,
        balance: user.balance(),
        spend_pools,
    }))
}

/// `GET /v1/user`: the caller's profile.
pub async fn user_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> AppResult<Json<UserResponse>> {
    let user = queries::find_user(&state.pool, principal.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;
    Ok(Json(UserResponse {
        id: user.id,
        email: user.email,
        name: user.name,
        echo_app_id: principal.echo_app_id,
    }))
}

/// `GET /v1/apps/{id}`: the app the credential was issued for.
pub async fn app_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(app_id): Path<Uuid>,
) -> AppResult<Json<AppResponse>> {
    if app_id != principal.echo_app_id {
        return Err(AppError::Forbidden(
            "Credential was not issued for this app".into(),
        ));
    }
    let app = queries::find_active_app(&state.pool, app_id)
        .await?
        .ok_or_else(|| AppError::NotFound("App not found".into()))?;
    let membership = queries::find_membership(&state.pool, principal.user_id, app_id).await?;

    Ok(Json(AppResponse {
        id: app.id,
        name: app.name,
        description: app.description,
        markup_rate: app.markup_rate,
        role: membership.as_ref().map(|m| m.role),
        total_spent: membership.map_or(Decimal::ZERO, |m| m.total_spent),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionQuery {
    pub limit: Option<i64>,
}

/// `GET /v1/transactions`: the caller's most recent metered calls in this app.
pub async fn transactions_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<TransactionQuery>,
) -> AppResult<Json<Vec<Transaction>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRANSACTION_PAGE)
        .clamp(1, MAX_TRANSACTION_PAGE);
    let rows =
        ledger::list_transactions(&state.pool, principal.user_id, principal.echo_app_id, limit)
            .await?;
    Ok(Json(rows))
}
