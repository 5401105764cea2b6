//! Authentication seam.
//!
//! Token validation is delegated to an [`AuthGate`]; the core only bounds the
//! call with a timeout and fails closed. [`JwtAuthGate`] is the bundled HS256
//! adapter. [`ResumeTokenSigner`] mints and checks the resume tokens handed to
//! clients so they can reattach to a session after a drop.

mod jwt;
mod resume;

pub use jwt::JwtAuthGate;
pub use resume::{ResumeGrant, ResumeTokenSigner};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_core::{AuthError, TenantId, UserId};
use tracing::warn;

/// Identity returned by a successful validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Authenticated user.
    pub user_id: UserId,
    /// Tenant the user belongs to.
    pub tenant_id: TenantId,
    /// Roles granted by the issuer.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Client-chosen session key (device ID or similar).
    #[serde(default)]
    pub session_hint: Option<String>,
}

/// External token validator.
#[async_trait]
pub trait AuthGate: Send + Sync {
    /// Validate a bearer token.
    async fn validate(&self, token: &str) -> Result<AuthClaims, AuthError>;
}

/// Call `gate` with an upper bound on how long it may take.
///
/// An empty token is rejected without calling the gate. Timeouts fail closed.
pub async fn validate_with_timeout(
    gate: &dyn AuthGate,
    token: &str,
    timeout: Duration,
) -> Result<AuthClaims, AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::MissingToken);
    }
    match tokio::time::timeout(timeout, gate.validate(token)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis(), "auth gate timed out");
            Err(AuthError::Timeout(timeout))
        }
    }
}
