//! Herald - web push dispatch engine.
//!
//! Sends one notification to every stored browser push subscription:
//! payloads are encrypted per subscriber (RFC 8291, `aes128gcm`), requests
//! carry a VAPID assertion (RFC 8292), deliveries fan out with bounded
//! concurrency, and subscriptions the push services report as gone are
//! deleted afterwards.
//!
//! # Modules
//!
//! - [`notifications`] - Encryption, signing, dispatch, and subscription stores
//! - [`config`] - Configuration loading/saving
//! - [`server`] - HTTP dispatch endpoint

pub mod config;
pub mod notifications;
pub mod server;

// Re-export commonly used types
pub use config::{Backend, Config};
pub use notifications::{
    DispatchReport, DispatchResponse, Dispatcher, FileStore, MemoryStore, NotificationRequest,
    PushService, ServerIdentity, Subscription, SubscriptionStore,
};
