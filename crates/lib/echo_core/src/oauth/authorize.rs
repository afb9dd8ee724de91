//! `/oauth/authorize`: validate the request and mint a signed code.
//!
//! Codes are JWTs rather than rows, so issuing one costs a single app lookup.
//! The flip side is that a code cannot be revoked before it expires, which is
//! why its TTL is minutes.

use sqlx::PgPool;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::OAuthError;
use super::pkce;
use super::redirect::is_authorized_redirect;
use crate::auth::queries;
use crate::auth::token::{AuthorizationGrant, TokenCodec};
use crate::models::auth::MembershipStatus;
use crate::uuid::parse_id;

/// Scope granted when the client does not ask for one.
pub const DEFAULT_SCOPE: &str = "llm:invoke offline_access";

/// Length of a base64url-encoded SHA-256 digest.
const S256_CHALLENGE_LEN: usize = 43;

/// Query parameters of an authorization request.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: Option<String>,
    /// Opaque to the server; forwarded untouched.
    pub state: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scope: Option<String>,
}

/// Where to send the user agent, plus the code embedded in it.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub redirect_url: String,
    pub code: String,
}

/// Validate `req` for the signed-in `user_id` and mint an authorization code.
pub async fn authorize(
    pool: &PgPool,
    codec: &TokenCodec,
    user_id: Uuid,
    req: &AuthorizeRequest,
) -> Result<AuthorizationRedirect, OAuthError> {
    if let Some(response_type) = req.response_type.as_deref()
        && response_type != "code"
    {
        return Err(OAuthError::UnsupportedResponseType(format!(
            "response_type '{response_type}' is not supported"
        )));
    }

    let app_id = parse_id(&req.client_id)
        .ok_or_else(|| OAuthError::InvalidClient("Unknown client_id".into()))?;
    let app = queries::find_active_app(pool, app_id)
        .await?
        .ok_or_else(|| OAuthError::InvalidClient("Unknown or inactive client_id".into()))?;

    if !is_authorized_redirect(&req.redirect_uri, &app.authorized_callback_urls) {
        return Err(OAuthError::InvalidGrant("redirect_uri is not authorized".into()));
    }

    pkce::validate_challenge_method(&req.code_challenge_method)?;
    if req.code_challenge.len() != S256_CHALLENGE_LEN {
        return Err(OAuthError::InvalidRequest("code_challenge is malformed".into()));
    }

    if let Some(membership) = queries::find_membership(pool, user_id, app.id).await?
        && membership.status == MembershipStatus::Revoked
    {
        return Err(OAuthError::AccessDenied("Access to this app was revoked".into()));
    }

    let scope = req
        .scope
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_SCOPE);

    let code = codec.issue_authorization_code(&AuthorizationGrant {
        client_id: req.client_id.clone(),
        redirect_uri: req.redirect_uri.clone(),
        code_challenge: req.code_challenge.clone(),
        code_challenge_method: req.code_challenge_method.clone(),
        scope: scope.to_string(),
        user_id,
    })?;

    let redirect_url = build_redirect_url(&req.redirect_uri, &code, req.state.as_deref())?;
    debug!(%user_id, echo_app_id = %app.id, "issued authorization code");

    Ok(AuthorizationRedirect { redirect_url, code })
}

/// Append `code` and, if present, `state` to the client's redirect URI.
fn build_redirect_url(
    redirect_uri: &str,
    code: &str,
    state: Option<&str>,
) -> Result<String, OAuthError> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|_| OAuthError::InvalidRequest("redirect_uri is not a valid URL".into()))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", code);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    Ok(url.into())
}
