use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PollError, PollResult};
use crate::models::{AuthPayload, Poll};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Claims {
    pub sub: String,
    pub user_id: String,
    pub poll_id: String,
    pub name: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies access tokens, and answers "is this caller the admin".
#[derive(Clone)]
pub struct IdentityGate {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
}

impl IdentityGate {
    pub fn new(secret: &str, token_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
            token_ttl,
        }
    }

    pub fn sign(&self, payload: &AuthPayload) -> PollResult<String> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: payload.user_id.clone(),
            user_id: payload.user_id.clone(),
            poll_id: payload.poll_id.clone(),
            name: payload.name.clone(),
            iat: now,
            exp: now.saturating_add(ttl),
        };

        debug!("Creating token for poll {} and user {}", payload.poll_id, payload.user_id);

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| PollError::Internal(format!("Failed to sign token: {}", e)))
    }

    /// Fails closed on a bad signature, a malformed token, or an expired one.
    pub fn verify(&self, token: &str) -> PollResult<AuthPayload> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            warn!("Rejected access token: {}", e);
            PollError::from(e)
        })?;

        let claims = data.claims;
        Ok(AuthPayload { user_id: claims.user_id, poll_id: claims.poll_id, name: claims.name })
    }

    /// Token for a socket handshake: `token` header, `Authorization: Bearer`, or
    /// the `token` query parameter, in that order.
    pub fn handshake_token(headers: &HeaderMap, query_token: Option<&str>) -> PollResult<String> {
        let from_header = headers
            .get("token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let from_bearer = || {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        };

        from_header
            .or_else(from_bearer)
            .or_else(|| query_token.map(str::to_string))
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| PollError::Unauthenticated("No token provided".to_string()))
    }
}

/// Refuses unless `identity` is the admin of `poll` as currently stored.
pub fn ensure_admin(identity: &AuthPayload, poll: &Poll) -> PollResult<()> {
    if identity.poll_id != poll.id || identity.user_id != poll.admin_id {
        warn!("User {} is not the admin of poll {}", identity.user_id, poll.id);
        return Err(PollError::Forbidden("You are not an admin".to_string()));
    }
    Ok(())
}
