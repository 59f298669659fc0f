//! Library-backed backend built on the `web-push` crate.
//!
//! Same contracts as the hand-rolled [`Aes128GcmEncryptor`] and
//! [`EcdsaSigner`], so the dispatcher can swap one for the other. Only the
//! crate's crypto is used; delivery still goes through our own transport.
//!
//! [`Aes128GcmEncryptor`]: super::ece::Aes128GcmEncryptor
//! [`EcdsaSigner`]: super::vapid::EcdsaSigner

// Rust guideline compliant 2026-02

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use web_push::{
    ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushError, WebPushMessageBuilder,
};

use super::ece::{EncryptedRecord, SubscriberKeys};
use super::error::CryptoError;
use super::vapid::{Assertion, ServerIdentity, ASSERTION_LIFETIME_SECS, DEFAULT_SUBJECT};
use super::{AssertionSigner, PayloadEncryptor};

/// `WebPushMessageBuilder` wants an endpoint even though encryption never
/// looks at it.
const UNUSED_ENDPOINT: &str = "https://push.invalid/";

/// Largest plaintext `web-push` will encrypt. The crate caps the payload
/// below what a single 4096-byte record could carry.
pub const WEB_PUSH_MAX_PLAINTEXT_LEN: usize = 3052;

/// RFC 8291 encryption via `web-push`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebPushEncryptor;

impl PayloadEncryptor for WebPushEncryptor {
    fn encrypt(&self, plaintext: &[u8], keys: &SubscriberKeys) -> Result<EncryptedRecord, CryptoError> {
        let too_large = || CryptoError::PayloadTooLarge {
            size: plaintext.len(),
            max: WEB_PUSH_MAX_PLAINTEXT_LEN,
        };
        if plaintext.len() > WEB_PUSH_MAX_PLAINTEXT_LEN {
            return Err(too_large());
        }

        let p256dh = BASE64URL.encode(keys.public_key());
        let auth = BASE64URL.encode(keys.auth_secret());
        let sub_info = SubscriptionInfo::new(UNUSED_ENDPOINT, p256dh.as_str(), auth.as_str());

        let mut builder = WebPushMessageBuilder::new(&sub_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, plaintext);
        let message = builder.build().map_err(|e| match e {
            WebPushError::PayloadTooLarge => too_large(),
            other => CryptoError::InvalidSubscriberKey(other.to_string()),
        })?;

        let payload = message
            .payload
            .ok_or_else(|| CryptoError::Encryption("web-push produced no payload".to_string()))?;
        Ok(EncryptedRecord::from_bytes(payload.content))
    }

    fn max_plaintext_len(&self) -> usize {
        WEB_PUSH_MAX_PLAINTEXT_LEN
    }
}

/// VAPID signing via `web-push`.
#[derive(Debug, Clone)]
pub struct WebPushSigner {
    subject: String,
}

impl WebPushSigner {
    /// Signer that puts `subject` in the `sub` claim.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

impl Default for WebPushSigner {
    fn default() -> Self {
        Self::new(DEFAULT_SUBJECT)
    }
}

impl AssertionSigner for WebPushSigner {
    fn sign(&self, audience: &str, identity: &ServerIdentity) -> Result<Assertion, CryptoError> {
        // The builder derives `aud` from the endpoint; the origin itself is a
        // valid endpoint for that purpose.
        let sub_info = SubscriptionInfo::new(audience, "", "");
        let private_key = identity.private_key_base64url();
        let issued_at = chrono::Utc::now().timestamp();

        // The crate sets exp itself; aud is pinned so non-default ports survive
        let mut builder = VapidSignatureBuilder::from_base64(&private_key, &sub_info)
            .map_err(|e| CryptoError::Signing(format!("failed to load VAPID key: {e}")))?;
        builder.add_claim("sub", self.subject.as_str());
        builder.add_claim("aud", audience);
        let signature = builder
            .build()
            .map_err(|e| CryptoError::Signing(format!("failed to sign VAPID JWT: {e}")))?;

        if signature.auth_k.as_slice() != identity.public_key().as_slice() {
            return Err(CryptoError::Signing(
                "web-push derived a different public key".to_string(),
            ));
        }
        let expires_at =
            token_expiry(&signature.auth_t).unwrap_or(issued_at + ASSERTION_LIFETIME_SECS);
        Ok(Assertion::new(signature.auth_t, audience.to_string(), expires_at))
    }
}

/// The `exp` claim of an unverified compact JWT.
fn token_expiry(token: &str) -> Option<i64> {
    let claims_b64 = token.split('.').nth(1)?;
    let claims: serde_json::Value = serde_json::from_slice(&BASE64URL.decode(claims_b64).ok()?).ok()?;
    claims.get("exp")?.as_i64()
}
