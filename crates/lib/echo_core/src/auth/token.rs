//! JWT codec for authorization codes and access tokens.
//!
//! The two token kinds are signed with unrelated HS256 secrets, so a code can
//! never be replayed as an access token (or the reverse). Verification is
//! purely cryptographic plus an expiry check; it never touches the database.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::TokenError;
use crate::config::TokenSettings;
use crate::models::auth::{AccessTokenClaims, AuthCodeClaims};

/// Tolerated clock skew when checking `exp`, in seconds. Never applied to signatures.
pub const CLOCK_SKEW_LEEWAY_SECS: u64 = 5;

/// Length of the random `jti` attached to every token.
const JTI_LEN: usize = 16;

/// Parameters bound into an authorization code.
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scope: String,
    pub user_id: Uuid,
}

/// Signs and verifies both token kinds. Read-only after construction.
#[derive(Clone)]
pub struct TokenCodec {
    code_encoding: EncodingKey,
    code_decoding: DecodingKey,
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    settings: TokenSettings,
}

impl TokenCodec {
    pub fn new(code_secret: &[u8], access_secret: &[u8], settings: TokenSettings) -> Self {
        Self {
            code_encoding: EncodingKey::from_secret(code_secret),
            code_decoding: DecodingKey::from_secret(code_secret),
            access_encoding: EncodingKey::from_secret(access_secret),
            access_decoding: DecodingKey::from_secret(access_secret),
            settings,
        }
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    /// Mint an access token for `user_id` on `app_id`.
    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        app_id: Uuid,
        scope: &str,
        session_id: Option<Uuid>,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            aud: app_id.to_string(),
            user_id: user_id.to_string(),
            app_id: app_id.to_string(),
            scope: scope.to_string(),
            key_version: self.settings.key_version,
            sid: session_id.map(|s| s.to_string()),
            jti: generate_jti(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.settings.access_token_ttl_secs)).timestamp(),
        };
        sign(&claims, &self.access_encoding)
    }

    /// Verify an access token, returning its claims.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let claims: AccessTokenClaims =
            verify(token, &self.access_decoding, &["exp", "sub", "aud"])?;
        if claims.key_version != self.settings.key_version {
            return Err(TokenError::InvalidToken(format!(
                "key version {} is no longer accepted",
                claims.key_version
            )));
        }
        if claims.sub != claims.user_id || claims.aud != claims.app_id {
            return Err(TokenError::InvalidToken("subject/audience mismatch".into()));
        }
        Ok(claims)
    }

    /// Encode an authorization grant into a short-lived signed code.
    pub fn issue_authorization_code(&self, grant: &AuthorizationGrant) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = AuthCodeClaims {
            client_id: grant.client_id.clone(),
            redirect_uri: grant.redirect_uri.clone(),
            code_challenge: grant.code_challenge.clone(),
            code_challenge_method: grant.code_challenge_method.clone(),
            scope: grant.scope.clone(),
            user_id: grant.user_id.to_string(),
            code: generate_jti(),
            jti: generate_jti(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.settings.auth_code_ttl_secs)).timestamp(),
        };
        sign(&claims, &self.code_encoding)
    }

    /// Verify and decode an authorization code.
    pub fn verify_authorization_code(&self, code: &str) -> Result<AuthCodeClaims, TokenError> {
        verify(code, &self.code_decoding, &["exp"])
    }
}

fn sign<C: Serialize>(claims: &C, key: &EncodingKey) -> Result<String, TokenError> {
    encode(&Header::new(Algorithm::HS256), claims, key)
        .map_err(|e| TokenError::Signing(format!("jwt encode: {e}")))
}

fn verify<C: DeserializeOwned>(
    token: &str,
    key: &DecodingKey,
    required: &[&str],
) -> Result<C, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = CLOCK_SKEW_LEEWAY_SECS;
    validation.validate_exp = true;
    // Audience is checked by the caller against the app it is acting for.
    validation.validate_aud = false;
    validation.set_required_spec_claims(required);

    decode::<C>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::ExpiredToken,
            _ => TokenError::InvalidToken(e.to_string()),
        })
}

/// Random 16-character token id.
fn generate_jti() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(JTI_LEN)
        .map(char::from)
        .collect()
}
