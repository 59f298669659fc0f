//! Shared helpers for integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use herald::notifications::{
    Dispatcher, HttpTransport, MemoryStore, NotificationDefaults, PushService, Registration,
    ServerIdentity, Subscription, SubscriptionStore,
};
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use std::sync::Arc;
use std::time::Duration;

/// A browser-side subscriber: the private half never leaves the test.
pub struct Browser {
    pub private_key: SecretKey,
    pub auth: [u8; 16],
}

impl Browser {
    pub fn new() -> Self {
        Self {
            private_key: SecretKey::random(&mut OsRng),
            auth: rand::random(),
        }
    }

    pub fn registration(&self, endpoint: &str) -> Registration {
        let public = self.private_key.public_key().to_encoded_point(false);
        Registration {
            endpoint: endpoint.to_string(),
            p256dh: URL_SAFE_NO_PAD.encode(public.as_bytes()),
            auth: URL_SAFE_NO_PAD.encode(self.auth),
            owner: None,
        }
    }

    /// Open a record delivered to this browser.
    pub fn open(&self, record: &[u8]) -> Vec<u8> {
        herald::notifications::ece::decrypt(record, &self.private_key, &self.auth).unwrap()
    }
}

pub fn http_transport() -> Arc<HttpTransport> {
    Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap())
}

pub fn dispatcher(identity: &Arc<ServerIdentity>) -> Dispatcher {
    Dispatcher::builder(Arc::clone(identity), http_transport()).build()
}

/// Store `endpoints`, each with a fresh browser. Returns the browsers and
/// stored subscriptions in the same order.
pub async fn register_all(
    store: &dyn SubscriptionStore,
    endpoints: &[String],
) -> (Vec<Browser>, Vec<Subscription>) {
    let mut browsers = Vec::new();
    let mut subscriptions = Vec::new();
    for endpoint in endpoints {
        let browser = Browser::new();
        subscriptions.push(store.upsert(browser.registration(endpoint)).await.unwrap());
        browsers.push(browser);
    }
    (browsers, subscriptions)
}

pub fn memory_service(identity: &Arc<ServerIdentity>) -> (Arc<MemoryStore>, PushService) {
    let store = Arc::new(MemoryStore::new());
    let service = PushService::new(
        Arc::clone(&store) as Arc<dyn SubscriptionStore>,
        dispatcher(identity),
        NotificationDefaults::default(),
    );
    (store, service)
}
