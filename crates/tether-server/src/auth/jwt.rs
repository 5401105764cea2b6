//! HS256 JWT [`AuthGate`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tether_core::AuthError;
use tracing::debug;

use super::{AuthClaims, AuthGate};

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(default, alias = "tid")]
    tenant_id: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default, alias = "sid", skip_serializing_if = "Option::is_none")]
    session_hint: Option<String>,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aud: Option<String>,
}

/// Validates bearer tokens signed with a shared HS256 secret.
///
/// Required claims: `sub` (user), `tenant_id` (or `tid`), `exp`. Optional:
/// `roles`, `session_hint` (or `sid`).
pub struct JwtAuthGate {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwtAuthGate {
    /// Gate for `secret`, optionally pinning `iss` and `aud`.
    pub fn new(secret: &str, issuer: Option<String>, audience: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(iss) = &issuer {
            validation.set_issuer(&[iss]);
        }
        match &audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer,
            audience,
        }
    }

    /// Sign a token for `claims` valid for `ttl`.
    pub fn issue(&self, claims: &AuthClaims, ttl: Duration) -> Result<String, AuthError> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let body = JwtClaims {
            sub: claims.user_id.to_string(),
            tenant_id: Some(claims.tenant_id.to_string()),
            roles: claims.roles.clone(),
            session_hint: claims.session_hint.clone(),
            exp: Utc::now().timestamp().saturating_add(ttl),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        encode(&Header::default(), &body, &self.encoding)
            .map_err(|e| AuthError::Unavailable(format!("token signing failed: {e}")))
    }
}

#[async_trait]
impl AuthGate for JwtAuthGate {
    async fn validate(&self, token: &str) -> Result<AuthClaims, AuthError> {
        let data = decode::<JwtClaims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!(error = %e, "jwt rejected");
            AuthError::Rejected(e.to_string())
        })?;
        let claims = data.claims;
        let tenant_id = claims
            .tenant_id
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Rejected("missing tenant_id claim".into()))?;
        if claims.sub.is_empty() {
            return Err(AuthError::Rejected("empty sub claim".into()));
        }
        Ok(AuthClaims {
            user_id: claims.sub.into(),
            tenant_id: tenant_id.into(),
            roles: claims.roles,
            session_hint: claims.session_hint.filter(|s| !s.is_empty()),
        })
    }
}
