//! VAPID server identity and assertions for Web Push (RFC 8292).
//!
//! The server identity is a P-256 ECDSA keypair loaded once at startup and
//! shared read-only by every dispatch. Assertions are compact ES256 JWTs
//! bound to one push service origin and valid for 12 hours.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Mutex;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use p256::ecdsa::{signature::Signer, signature::Verifier, Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::rand_core::OsRng;
use serde::{Deserialize, Serialize};

use super::error::{ConfigError, CryptoError};
use super::signature::normalize_signature;
use super::{decode_base64_any, AssertionSigner};

/// Length of an uncompressed SEC1 P-256 point (`0x04 || x || y`).
pub const PUBLIC_KEY_LEN: usize = 65;

/// Length of a raw P-256 private scalar.
pub const PRIVATE_KEY_LEN: usize = 32;

/// Assertion lifetime (12 hours).
pub const ASSERTION_LIFETIME_SECS: i64 = 12 * 60 * 60;

/// Cached assertions are re-signed once less than this much validity remains.
pub const ASSERTION_REFRESH_MARGIN_SECS: i64 = 60 * 60;

/// Contact identifier placed in the `sub` claim when none is configured.
pub const DEFAULT_SUBJECT: &str = "mailto:admin@scripture.app";

/// Server identity (VAPID keypair).
///
/// Immutable after construction. The public key is cached in its
/// uncompressed form because every request sends it as the `k=` parameter.
#[derive(Clone)]
pub struct ServerIdentity {
    signing_key: SigningKey,
    public_key: [u8; PUBLIC_KEY_LEN],
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("public_key", &self.public_key_base64url())
            .finish_non_exhaustive()
    }
}

impl ServerIdentity {
    /// Generate a fresh VAPID keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        // SEC1 uncompressed public key (65 bytes: 0x04 || x || y)
        let encoded = signing_key.verifying_key().to_encoded_point(false);
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(encoded.as_bytes());
        Self {
            signing_key,
            public_key,
        }
    }

    /// Reconstruct from base64url-encoded keys (deployment secrets).
    ///
    /// The private key may be the raw 32-byte scalar or a legacy SEC1 / PKCS#8
    /// DER encoding. The public key must be the matching uncompressed point.
    pub fn from_base64url(public_key_b64: &str, private_key_b64: &str) -> Result<Self, ConfigError> {
        let public_bytes = decode_base64_any(public_key_b64).map_err(|e| {
            ConfigError::InvalidIdentity(format!("public key is not base64: {e}"))
        })?;
        if public_bytes.len() != PUBLIC_KEY_LEN || public_bytes[0] != 0x04 {
            return Err(ConfigError::InvalidIdentity(
                "public key must be a 65-byte uncompressed P-256 point".to_string(),
            ));
        }

        let private_bytes = decode_base64_any(private_key_b64).map_err(|e| {
            ConfigError::InvalidIdentity(format!("private key is not base64: {e}"))
        })?;
        let identity = Self::from_private_key(&private_bytes)?;

        if identity.public_key.as_slice() != public_bytes.as_slice() {
            return Err(ConfigError::InvalidIdentity(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(identity)
    }

    /// Build from private key bytes: raw scalar, SEC1 DER, or PKCS#8 DER.
    pub fn from_private_key(private_bytes: &[u8]) -> Result<Self, ConfigError> {
        if private_bytes.len() == PRIVATE_KEY_LEN {
            let signing_key = SigningKey::from_slice(private_bytes).map_err(|e| {
                ConfigError::InvalidIdentity(format!("private key is not a valid P-256 scalar: {e}"))
            })?;
            return Ok(Self::from_signing_key(signing_key));
        }

        // Try SEC1 DER first (~121 bytes), then PKCS8 DER (~138 bytes)
        let signing_key = if let Ok(sk) = p256::SecretKey::from_sec1_der(private_bytes) {
            SigningKey::from(sk)
        } else {
            use p256::pkcs8::DecodePrivateKey;
            SigningKey::from_pkcs8_der(private_bytes).map_err(|e| {
                ConfigError::InvalidIdentity(format!(
                    "private key is not a 32-byte scalar, SEC1 DER, or PKCS8 DER: {e}"
                ))
            })?
        };

        log::info!(
            "[Vapid] Converted legacy DER private key ({} bytes) to raw scalar",
            private_bytes.len()
        );
        Ok(Self::from_signing_key(signing_key))
    }

    /// Uncompressed public key bytes (65 bytes).
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    /// Base64url-encoded uncompressed public key.
    ///
    /// This is the browser's `applicationServerKey` and the `k=` parameter of
    /// the `Authorization` header.
    pub fn public_key_base64url(&self) -> String {
        BASE64URL.encode(self.public_key)
    }

    /// Base64url-encoded raw 32-byte private scalar.
    pub fn private_key_base64url(&self) -> String {
        BASE64URL.encode(self.signing_key.to_bytes().as_slice())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Serializable form, as written to `identity.json` and printed by
    /// `herald keys generate`.
    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            public_key: self.public_key_base64url(),
            private_key: self.private_key_base64url(),
        }
    }
}

/// On-disk / wire form of a server identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIdentity {
    /// Uncompressed public key (base64url, 65 bytes decoded).
    pub public_key: String,
    /// Raw 32-byte private scalar (base64url).
    pub private_key: String,
}

impl StoredIdentity {
    /// Parse into a validated [`ServerIdentity`].
    pub fn into_identity(self) -> Result<ServerIdentity, ConfigError> {
        ServerIdentity::from_base64url(&self.public_key, &self.private_key)
    }
}

/// JOSE header. Field order matters only for byte-exact comparisons.
#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    typ: String,
    alg: String,
}

/// VAPID JWT claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Origin of the push service (`scheme://host[:port]`).
    pub aud: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
    /// Contact identifier (`mailto:` or `https:` URI).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

/// A signed VAPID assertion bound to one audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    token: String,
    audience: String,
    expires_at: i64,
}

impl Assertion {
    /// Wrap an already-signed token.
    pub fn new(token: String, audience: String, expires_at: i64) -> Self {
        Self {
            token,
            audience,
            expires_at,
        }
    }

    /// The compact JWT (`header.claims.signature`).
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Audience the token is bound to.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Expiry, seconds since the Unix epoch.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Whether the token may still be reused at `now`.
    pub fn is_reusable_at(&self, now: i64) -> bool {
        self.expires_at - now > ASSERTION_REFRESH_MARGIN_SECS
    }

    /// `Authorization` header value: `vapid t=<jwt>, k=<public key>`.
    pub fn authorization_header(&self, identity: &ServerIdentity) -> String {
        format!("vapid t={}, k={}", self.token, identity.public_key_base64url())
    }

    /// Verify the token signature under `public_key` and return its claims.
    pub fn verify(&self, public_key: &[u8]) -> Result<Claims, CryptoError> {
        let invalid = CryptoError::InvalidAssertion;

        let mut parts = self.token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected three dot-separated segments".to_string()));
        };

        let header_json = BASE64URL
            .decode(header_b64)
            .map_err(|e| invalid(format!("header is not base64url: {e}")))?;
        let header: JwtHeader = serde_json::from_slice(&header_json)
            .map_err(|e| invalid(format!("header is not JSON: {e}")))?;
        if header.alg != "ES256" {
            return Err(invalid(format!("unexpected algorithm {}", header.alg)));
        }

        let sig_bytes = BASE64URL
            .decode(sig_b64)
            .map_err(|e| invalid(format!("signature is not base64url: {e}")))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| invalid(format!("signature is not raw r||s: {e}")))?;
        let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| invalid(format!("public key is not a P-256 point: {e}")))?;

        let signing_input = format!("{header_b64}.{claims_b64}");
        verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|e| invalid(format!("signature does not verify: {e}")))?;

        let claims_json = BASE64URL
            .decode(claims_b64)
            .map_err(|e| invalid(format!("claims are not base64url: {e}")))?;
        serde_json::from_slice(&claims_json).map_err(|e| invalid(format!("claims are not JSON: {e}")))
    }
}

/// Sign an ES256 assertion for `audience`, issued at `now`.
pub fn sign_assertion(
    audience: &str,
    subject: &str,
    identity: &ServerIdentity,
    now: i64,
) -> Result<Assertion, CryptoError> {
    let header = JwtHeader {
        typ: "JWT".to_string(),
        alg: "ES256".to_string(),
    };
    let claims = Claims {
        aud: audience.to_string(),
        exp: now + ASSERTION_LIFETIME_SECS,
        sub: Some(subject.to_string()),
    };

    let header_json =
        serde_json::to_vec(&header).map_err(|e| CryptoError::Signing(e.to_string()))?;
    let claims_json =
        serde_json::to_vec(&claims).map_err(|e| CryptoError::Signing(e.to_string()))?;
    let signing_input = format!(
        "{}.{}",
        BASE64URL.encode(header_json),
        BASE64URL.encode(claims_json)
    );

    // ES256 over SHA-256, RFC 6979 nonces. DER goes through the normalizer so
    // the raw form is produced by one code path regardless of backend.
    let signature: Signature = identity.signing_key().sign(signing_input.as_bytes());
    let raw = normalize_signature(signature.to_der().as_bytes())?;

    let token = format!("{signing_input}.{}", BASE64URL.encode(raw));
    Ok(Assertion::new(token, audience.to_string(), claims.exp))
}

/// Hand-rolled assertion signer (p256 ECDSA).
#[derive(Debug, Clone)]
pub struct EcdsaSigner {
    subject: String,
}

impl EcdsaSigner {
    /// Signer that puts `subject` in the `sub` claim.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

impl Default for EcdsaSigner {
    fn default() -> Self {
        Self::new(DEFAULT_SUBJECT)
    }
}

impl AssertionSigner for EcdsaSigner {
    fn sign(&self, audience: &str, identity: &ServerIdentity) -> Result<Assertion, CryptoError> {
        sign_assertion(audience, &self.subject, identity, chrono::Utc::now().timestamp())
    }
}

/// Per-audience assertion cache shared by dispatch workers.
///
/// Holds at most one entry per push service origin, and entries that can no
/// longer be reused are dropped whenever a new one is stored. A poisoned lock
/// degrades to signing on every call.
#[derive(Debug, Default)]
pub struct AssertionCache {
    entries: Mutex<HashMap<String, Assertion>>,
}

impl AssertionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a reusable cached assertion for `audience`, or sign a new one.
    pub fn get_or_sign(
        &self,
        audience: &str,
        signer: &dyn AssertionSigner,
        identity: &ServerIdentity,
    ) -> Result<Assertion, CryptoError> {
        self.get_or_sign_at(audience, signer, identity, chrono::Utc::now().timestamp())
    }

    fn get_or_sign_at(
        &self,
        audience: &str,
        signer: &dyn AssertionSigner,
        identity: &ServerIdentity,
        now: i64,
    ) -> Result<Assertion, CryptoError> {
        if let Ok(entries) = self.entries.lock() {
            if let Some(cached) = entries.get(audience).filter(|a| a.is_reusable_at(now)) {
                return Ok(cached.clone());
            }
        }

        let fresh = signer.sign(audience, identity)?;
        log::debug!("[Vapid] Signed assertion for {}", audience);
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, cached| cached.is_reusable_at(now));
            entries.insert(audience.to_string(), fresh.clone());
        }
        Ok(fresh)
    }

    /// Number of cached audiences.
    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    /// Whether the cache holds no assertions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
