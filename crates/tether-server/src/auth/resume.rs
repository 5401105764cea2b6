//! Resume tokens.
//!
//! A token is `base64url(session_id|epoch|expiry_ms) "." base64url(hmac)`,
//! HMAC-SHA256 under the instance-shared resume key. It proves the bearer
//! held the session at `epoch`; the coordinator rejects tokens whose epoch
//! is behind the stored one.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tether_core::{AuthError, SessionId};

type HmacSha256 = Hmac<Sha256>;

/// What a verified resume token grants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeGrant {
    /// Session the token was issued for.
    pub session_id: SessionId,
    /// Fencing epoch held when the token was issued.
    pub epoch: u64,
    /// Token expiry.
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies resume tokens.
#[derive(Clone)]
pub struct ResumeTokenSigner {
    mac: HmacSha256,
    ttl: chrono::Duration,
}

impl std::fmt::Debug for ResumeTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeTokenSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ResumeTokenSigner {
    /// Signer keyed by `secret`; tokens live for `ttl`.
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, AuthError> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| AuthError::Unavailable(format!("resume key: {e}")))?;
        Ok(Self {
            mac,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365)),
        })
    }

    /// Token for `session_id` at `epoch`, issued now.
    pub fn issue(&self, session_id: &SessionId, epoch: u64) -> String {
        self.issue_at(session_id, epoch, Utc::now())
    }

    /// Token issued at `now`.
    pub fn issue_at(&self, session_id: &SessionId, epoch: u64, now: DateTime<Utc>) -> String {
        let expiry = (now + self.ttl).timestamp_millis();
        let payload = format!("{session_id}|{epoch}|{expiry}");
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let sig = mac.finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(sig)
        )
    }

    /// Verify `token` now.
    pub fn verify(&self, token: &str) -> Result<ResumeGrant, AuthError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify `token` at `now`: signature, shape, then expiry.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<ResumeGrant, AuthError> {
        let invalid = |why: &str| AuthError::InvalidResumeToken(why.to_owned());

        let (payload_b64, sig_b64) = token.split_once('.').ok_or_else(|| invalid("malformed"))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| invalid("malformed"))?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| invalid("malformed"))?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&sig).map_err(|_| invalid("bad signature"))?;

        let payload = String::from_utf8(payload).map_err(|_| invalid("malformed"))?;
        // session IDs may contain '|', so split from the right
        let mut parts = payload.rsplitn(3, '|');
        let expiry = parts.next().and_then(|s| s.parse::<i64>().ok());
        let epoch = parts.next().and_then(|s| s.parse::<u64>().ok());
        let session_id = parts.next().filter(|s| !s.is_empty());
        let (Some(expiry), Some(epoch), Some(session_id)) = (expiry, epoch, session_id) else {
            return Err(invalid("malformed"));
        };

        let expires_at = Utc
            .timestamp_millis_opt(expiry)
            .single()
            .ok_or_else(|| invalid("malformed"))?;
        if now >= expires_at {
            return Err(invalid("expired"));
        }

        Ok(ResumeGrant {
            session_id: session_id.into(),
            epoch,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn signer() -> ResumeTokenSigner {
        ResumeTokenSigner::new(b"resume-key", Duration::from_secs(600)).unwrap()
    }

    #[test]
    fn issued_token_verifies() {
        let s = signer();
        let now = Utc::now();
        let token = s.issue_at(&"sess_1".into(), 4, now);
        let grant = s.verify_at(&token, now).unwrap();
        assert_eq!(grant.session_id.as_str(), "sess_1");
        assert_eq!(grant.epoch, 4);
    }

    #[test]
    fn session_id_with_separator_survives() {
        let s = signer();
        let token = s.issue(&"tenant|device".into(), 1);
        assert_eq!(s.verify(&token).unwrap().session_id.as_str(), "tenant|device");
    }

    #[test]
    fn expired_token_is_rejected() {
        let s = signer();
        let now = Utc::now();
        let token = s.issue_at(&"sess_1".into(), 1, now);
        let later = now + chrono::Duration::seconds(601);
        assert_matches!(s.verify_at(&token, later), Err(AuthError::InvalidResumeToken(m)) if m == "expired");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let s = signer();
        let token = s.issue(&"sess_1".into(), 1);
        let (_, sig) = token.split_once('.').unwrap();
        let forged = format!("{}.{sig}", URL_SAFE_NO_PAD.encode("sess_1|9|99999999999999"));
        assert_matches!(s.verify(&forged), Err(AuthError::InvalidResumeToken(m)) if m == "bad signature");
    }

    #[test]
    fn other_key_is_rejected() {
        let token = signer().issue(&"sess_1".into(), 1);
        let other = ResumeTokenSigner::new(b"other", Duration::from_secs(600)).unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let s = signer();
        for junk in ["", "abc", "a.b", "!!!.???"] {
            assert_matches!(s.verify(junk), Err(AuthError::InvalidResumeToken(_)));
        }
    }
}
