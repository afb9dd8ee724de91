//! OAuth 2.0 endpoints: authorize, token, revoke.

use axum::Json;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION, PRAGMA, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use echo_core::auth::queries;
use echo_core::models::auth::DeviceInfo;
use echo_core::oauth::OAuthError;
use echo_core::oauth::authorize::{self, AuthorizeRequest};
use echo_core::oauth::token_service::{self, CodeExchange, TokenPair};
use serde::de::DeserializeOwned;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{AuthorizeQuery, RevokeRequest, TokenRequest, TokenResponse};
use crate::services::dashboard;

/// `GET /oauth/authorize`: redirect back to the client with a code.
pub async fn authorize_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(query): Query<AuthorizeQuery>,
) -> AppResult<Response> {
    let session = dashboard::session_from_request(
        &jar,
        &headers,
        state.config.dashboard_session_secret.as_bytes(),
    )?;

    let req = AuthorizeRequest {
        client_id: required(query.client_id, "client_id")?,
        redirect_uri: required(query.redirect_uri, "redirect_uri")?,
        response_type: query.response_type,
        state: query.state,
        code_challenge: required(query.code_challenge, "code_challenge")?,
        code_challenge_method: required(query.code_challenge_method, "code_challenge_method")?,
        scope: query.scope,
    };

    let user = queries::ensure_user(
        &state.pool,
        session.user_id,
        &session.email,
        session.name.as_deref(),
    )
    .await
    .map_err(OAuthError::from)?;
    let redirect = authorize::authorize(&state.pool, &state.codec, user.id, &req).await?;

    Ok((StatusCode::FOUND, [(LOCATION, redirect.redirect_url)]).into_response())
}

/// `POST /oauth/token`: `authorization_code` and `refresh_token` grants.
///
/// Accepts `application/x-www-form-urlencoded` (RFC 6749) or JSON.
pub async fn token_handler(State(state): State<AppState>, request: Request) -> AppResult<Response> {
    let device = device_info(request.headers());
    let body: TokenRequest = parse_body(request, &state).await?;
    let device = DeviceInfo {
        device_name: body.device_name.clone(),
        ..device
    };

    let pair = match body.grant_type.as_deref() {
        Some("authorization_code") => {
            let exchange = CodeExchange {
                code: required(body.code, "code")?,
                code_verifier: required(body.code_verifier, "code_verifier")?,
                client_id: required(body.client_id, "client_id")?,
                redirect_uri: required(body.redirect_uri, "redirect_uri")?,
                device,
            };
            token_service::exchange_authorization_code(&state.pool, &state.codec, &exchange).await?
        }
        Some("refresh_token") => {
            let refresh_token = required(body.refresh_token, "refresh_token")?;
            token_service::refresh(&state.pool, &state.codec, &refresh_token, &device).await?
        }
        Some(other) => {
            return Err(OAuthError::UnsupportedGrantType(format!(
                "grant_type '{other}' is not supported"
            ))
            .into());
        }
        None => return Err(OAuthError::InvalidRequest("grant_type is required".into()).into()),
    };

    Ok((
        [(CACHE_CONTROL, "no-store"), (PRAGMA, "no-cache")],
        Json(token_response(pair)),
    )
        .into_response())
}

/// `POST /oauth/revoke`: sign out the session behind a refresh token.
pub async fn revoke_handler(State(state): State<AppState>, request: Request) -> AppResult<StatusCode> {
    let body: RevokeRequest = parse_body(request, &state).await?;
    let token = body
        .token
        .or(body.refresh_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| OAuthError::InvalidRequest("token is required".into()))?;
    token_service::revoke(&state.pool, &token).await?;
    Ok(StatusCode::OK)
}

fn token_response(pair: TokenPair) -> TokenResponse {
    TokenResponse {
        access_token: pair.access_token,
        token_type: "Bearer".into(),
        expires_in: pair.expires_in,
        refresh_token: pair.refresh_token,
        refresh_token_expires_in: pair.refresh_token_expires_in,
        scope: pair.scope,
        user: (&pair.user).into(),
        echo_app: (&pair.echo_app).into(),
    }
}

async fn parse_body<T>(request: Request, state: &AppState) -> Result<T, AppError>
where
    T: DeserializeOwned + Send + 'static,
{
    let is_json = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    if is_json {
        let Json(body) = Json::<T>::from_request(request, state)
            .await
            .map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;
        Ok(body)
    } else {
        let axum::Form(body) = axum::Form::<T>::from_request(request, state)
            .await
            .map_err(|e| OAuthError::InvalidRequest(e.body_text()))?;
        Ok(body)
    }
}

fn device_info(headers: &HeaderMap) -> DeviceInfo {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    DeviceInfo {
        device_name: None,
        user_agent: header(USER_AGENT.as_str()),
        ip_address: header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string())),
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, AppError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::InvalidRequest(format!("{name} is required")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_parameter_is_invalid_request() {
        let err = required(None, "code").unwrap_err();
        assert!(matches!(err, AppError::OAuth(OAuthError::InvalidRequest(ref m)) if m == "code is required"));
        assert!(required(Some(String::new()), "code").is_err());
        assert_eq!(required(Some("x".into()), "code").unwrap(), "x");
    }

    #[test]
    fn device_info_takes_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        headers.insert(USER_AGENT, HeaderValue::from_static("echo-sdk/1.0"));
        let device = device_info(&headers);
        assert_eq!(device.ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(device.user_agent.as_deref(), Some("echo-sdk/1.0"));
        assert!(device.device_name.is_none());
    }
}
