//! Survival token codec - stateless proofs for confirmation links
//!
//! Encodes `(message_id, owner_id, issued_at)` into an opaque signed string
//! that rides inside a one-click "I'm still here" link. There is no
//! server-side token table: a token is valid exactly when its signature
//! checks out and the referenced record still has a matching owner and a
//! non-terminal phase, so replaying an old link is harmless once the record
//! has moved on.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Result type alias
pub type Result<T> = std::result::Result<T, TokenError>;

/// Token decode failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Not two dot-separated base64url segments, or claims not parseable
    #[error("malformed token")]
    Malformed,
    /// Claims parse but the signature does not match
    #[error("token signature mismatch")]
    BadSignature,
}

/// The claims carried by a survival token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurvivalToken {
    /// Message the token halts escalation for
    pub message_id: Uuid,
    /// Owner the record must still match at redemption time
    pub owner_id: String,
    /// When the token was minted (informational, not an expiry)
    pub issued_at: DateTime<Utc>,
}

impl SurvivalToken {
    pub fn new(message_id: Uuid, owner_id: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            message_id,
            owner_id: owner_id.into(),
            issued_at,
        }
    }
}

/// Encoder/decoder bound to one signing key
#[derive(Clone)]
pub struct TokenCodec {
    key: Vec<u8>,
}

impl TokenCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    /// Encode claims as `base64url(json).base64url(hmac-sha256)`
    pub fn encode(&self, token: &SurvivalToken) -> String {
        // serde_json cannot fail on this struct
        let payload = serde_json::to_vec(token).unwrap_or_default();
        let sig = self.sign(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(sig)
        )
    }

    /// Decode and verify a token string
    pub fn decode(&self, raw: &str) -> Result<SurvivalToken> {
        let (payload_b64, sig_b64) = raw.split_once('.').ok_or(TokenError::Malformed)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(&payload);
        mac.verify_slice(&sig)
            .map_err(|_| TokenError::BadSignature)?;

        serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
