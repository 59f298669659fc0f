//! Error taxonomy for the push pipeline.
//!
//! Only [`DispatchError`] aborts a whole dispatch. Everything else is scoped
//! to a single subscriber and ends up as a [`DeliveryOutcome`] detail.
//!
//! [`DeliveryOutcome`]: super::dispatch::DeliveryOutcome

use thiserror::Error;

/// Server identity and configuration failures.
///
/// These are startup-fatal: a dispatcher cannot be built without a valid
/// identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No VAPID keypair was supplied.
    #[error("server identity is not configured")]
    MissingIdentity,

    /// The VAPID keypair could not be parsed or does not match.
    #[error("server identity is malformed: {0}")]
    InvalidIdentity(String),

    /// A configuration value is out of range or unparseable.
    #[error("invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

/// Per-subscriber cryptographic failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Signature bytes are neither raw `r || s` nor a DER `SEQUENCE`.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// Subscriber public key or auth secret is unusable.
    #[error("invalid subscriber key: {0}")]
    InvalidSubscriberKey(String),

    /// Subscriber auth secret is not 16 bytes of base64.
    #[error("invalid shared secret: {0}")]
    InvalidSharedSecret(String),

    /// Plaintext does not fit in a single record.
    #[error("payload of {size} bytes exceeds the {max} byte record limit")]
    PayloadTooLarge {
        /// Plaintext length in bytes.
        size: usize,
        /// Largest plaintext accepted.
        max: usize,
    },

    /// AEAD sealing or key derivation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Record could not be opened (tests and diagnostics).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Assertion could not be produced.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Assertion failed verification.
    #[error("invalid assertion: {0}")]
    InvalidAssertion(String),
}

/// Subscription store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file is not valid JSON.
    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A previous writer panicked while holding the lock.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Network-level delivery failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The push service did not answer within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Any other client-side failure.
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Failures that abort an entire dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Server identity or configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The subscriber list could not be read.
    #[error("failed to fetch subscriptions: {0}")]
    Store(#[from] StoreError),

    /// The notification could not be turned into a plaintext payload.
    #[error("invalid notification payload: {0}")]
    Payload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_errors_do_not_leak_key_material() {
        let err = CryptoError::InvalidSubscriberKey("expected 65 bytes, got 12".to_string());
        let msg = err.to_string();
        assert!(msg.starts_with("invalid subscriber key"));
        assert!(!msg.contains("BP4z"));
    }

    #[test]
    fn test_payload_too_large_message() {
        let err = CryptoError::PayloadTooLarge { size: 5000, max: 4079 };
        assert_eq!(
            err.to_string(),
            "payload of 5000 bytes exceeds the 4079 byte record limit"
        );
    }

    #[test]
    fn test_dispatch_error_wraps_config() {
        let err: DispatchError = ConfigError::MissingIdentity.into();
        assert_eq!(err.to_string(), "server identity is not configured");
    }
}
