//! Web push dispatch infrastructure.
//!
//! Turns one notification into an encrypted, VAPID-authenticated delivery to
//! every stored browser subscription, then deletes the subscriptions the
//! push services reported as gone.
//!
//! # Architecture
//!
//! ```text
//! PushService::send(request)
//!     ↓ list_all()
//! Dispatcher (bounded fan-out, one task per subscription)
//!     ├── AssertionCache → AssertionSigner  (VAPID JWT per push service origin)
//!     ├── PayloadEncryptor                  (RFC 8291 aes128gcm record)
//!     └── PushTransport                     (HTTP POST to the endpoint)
//!     ↓ DeliveryOutcome per subscription
//! Reconciler (one delete_many for every PermanentlyInvalid id)
//! ```
//!
//! # Backends
//!
//! Encryption and signing sit behind [`PayloadEncryptor`] and
//! [`AssertionSigner`]. The hand-rolled backend ([`ece`], [`vapid`]) builds
//! both from p256 / HKDF / AES-GCM primitives; [`library`] wraps the
//! `web-push` crate. Either can be plugged into the [`Dispatcher`].
//!
//! # Server identity
//!
//! The VAPID keypair is loaded once at startup into a [`ServerIdentity`] and
//! shared read-only (`Arc`) by all workers.

// Rust guideline compliant 2026-02

pub mod dispatch;
pub mod ece;
pub mod error;
pub mod library;
pub mod payload;
pub mod push;
pub mod reconcile;
pub mod service;
pub mod signature;
pub mod vapid;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};

pub use dispatch::{
    Classification, DeliveryOutcome, DispatchReport, DispatchResponse, Dispatcher, HttpTransport,
    PushRequest, PushResponse, PushTransport,
};
pub use ece::{Aes128GcmEncryptor, EncryptedRecord, SubscriberKeys};
pub use error::{ConfigError, CryptoError, DispatchError, StoreError, TransportError};
pub use library::{WebPushEncryptor, WebPushSigner};
pub use payload::{Notification, NotificationDefaults, NotificationRequest};
pub use push::{
    FileStore, MemoryStore, Registration, Subscription, SubscriptionId, SubscriptionStore,
};
pub use reconcile::{ReconcileSummary, Reconciler};
pub use service::PushService;
pub use vapid::{Assertion, AssertionCache, EcdsaSigner, ServerIdentity};

/// Encrypts a plaintext payload for one subscriber.
pub trait PayloadEncryptor: Send + Sync {
    /// Produce a self-contained `aes128gcm` record for `keys`.
    fn encrypt(&self, plaintext: &[u8], keys: &SubscriberKeys) -> Result<EncryptedRecord, CryptoError>;

    /// Largest plaintext this backend accepts.
    fn max_plaintext_len(&self) -> usize {
        ece::MAX_PLAINTEXT_LEN
    }
}

/// Issues VAPID assertions.
pub trait AssertionSigner: Send + Sync {
    /// Sign a token bound to `audience` (a push service origin).
    fn sign(&self, audience: &str, identity: &ServerIdentity) -> Result<Assertion, CryptoError>;
}

/// Decode base64 in either alphabet, with or without padding.
///
/// Browsers hand out URL-safe keys; some registration flows re-encode them
/// with the standard alphabet.
pub(crate) fn decode_base64_any(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let normalized: String = input
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    BASE64URL.decode(normalized)
}
