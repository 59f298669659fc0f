//! End-to-end send: load subscriptions, dispatch, reconcile.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::dispatch::{DispatchReport, Dispatcher, HttpTransport};
use super::ece::Aes128GcmEncryptor;
use super::error::{ConfigError, DispatchError};
use super::library::{WebPushEncryptor, WebPushSigner};
use super::payload::{Notification, NotificationDefaults, NotificationRequest};
use super::push::SubscriptionStore;
use super::reconcile::Reconciler;
use super::vapid::EcdsaSigner;
use crate::config::{Backend, Config};

/// Push pipeline bound to one subscription store.
pub struct PushService {
    store: Arc<dyn SubscriptionStore>,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    defaults: NotificationDefaults,
}

impl std::fmt::Debug for PushService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushService")
            .field("dispatcher", &self.dispatcher)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl PushService {
    /// Assemble a service.
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        dispatcher: Dispatcher,
        defaults: NotificationDefaults,
    ) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&store));
        Self {
            store,
            dispatcher,
            reconciler,
            defaults,
        }
    }

    /// Build the service described by `config` over `store`.
    ///
    /// Fails if the configuration is invalid or the server identity is
    /// missing or malformed.
    pub fn from_config(config: &Config, store: Arc<dyn SubscriptionStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        let identity = Arc::new(config.identity()?);
        let transport = HttpTransport::new(config.request_timeout()).map_err(|e| ConfigError::InvalidValue {
            key: "request_timeout",
            message: format!("failed to build HTTP client: {e}"),
        })?;

        let builder = Dispatcher::builder(identity, Arc::new(transport))
            .ttl(config.ttl)
            .concurrency(config.concurrency);
        let builder = match config.backend {
            Backend::Native => builder
                .encryptor(Arc::new(Aes128GcmEncryptor))
                .signer(Arc::new(EcdsaSigner::new(config.subject.clone()))),
            Backend::WebPush => builder
                .encryptor(Arc::new(WebPushEncryptor))
                .signer(Arc::new(WebPushSigner::new(config.subject.clone()))),
        };
        log::info!(
            "[Push] Using {} backend, concurrency {}, TTL {}s",
            config.backend,
            config.concurrency,
            config.ttl
        );

        Ok(Self::new(store, builder.build(), config.notification.clone()))
    }

    /// The backing subscription store.
    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Send one notification to every stored subscription.
    ///
    /// Fails only if the subscriber list cannot be read or the notification
    /// cannot be encoded. A failed cleanup is logged and reported as
    /// `cleaned == 0`; the delivery counts stand.
    pub async fn send(
        &self,
        request: NotificationRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let notification = Notification::from_request(request, &self.defaults);

        let subscriptions = self.store.list_all().await.map_err(|e| {
            log::error!("[Push] Error fetching subscriptions: {}", e);
            DispatchError::Store(e)
        })?;
        log::info!("[Push] Found {} subscription(s)", subscriptions.len());

        let mut report = self
            .dispatcher
            .dispatch(&notification, subscriptions, cancel)
            .await?;

        let invalid = report.permanently_invalid();
        match self.reconciler.reconcile(&invalid).await {
            Ok(summary) => report.cleaned = summary.requested,
            Err(e) => log::error!(
                "[Push] Failed to clean up {} invalid subscription(s): {}",
                invalid.len(),
                e
            ),
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::dispatch::{PushRequest, PushResponse, PushTransport};
    use crate::notifications::error::{StoreError, TransportError};
    use crate::notifications::push::{MemoryStore, Registration, Subscription, SubscriptionId};
    use crate::notifications::vapid::ServerIdentity;
    use async_trait::async_trait;

    struct AlwaysGone;

    #[async_trait]
    impl PushTransport for AlwaysGone {
        async fn send(&self, _request: PushRequest) -> Result<PushResponse, TransportError> {
            Ok(PushResponse {
                status: 410,
                body: String::new(),
            })
        }
    }

    /// Lists fine, refuses to delete.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl SubscriptionStore for ReadOnlyStore {
        async fn upsert(&self, registration: Registration) -> Result<Subscription, StoreError> {
            self.inner.upsert(registration).await
        }

        async fn delete_many(&self, _ids: &[SubscriptionId]) -> Result<usize, StoreError> {
            Err(StoreError::Io(std::io::Error::other("read-only")))
        }

        async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
            self.inner.list_all().await
        }
    }

    fn registration(endpoint: &str) -> Registration {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        use p256::elliptic_curve::rand_core::OsRng;
        use p256::elliptic_curve::sec1::ToEncodedPoint;

        let point = p256::SecretKey::random(&mut OsRng)
            .public_key()
            .to_encoded_point(false);
        Registration {
            endpoint: endpoint.to_string(),
            p256dh: URL_SAFE_NO_PAD.encode(point.as_bytes()),
            auth: URL_SAFE_NO_PAD.encode([5u8; 16]),
            owner: None,
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::builder(Arc::new(ServerIdentity::generate()), Arc::new(AlwaysGone)).build()
    }

    #[tokio::test]
    async fn test_send_cleans_gone_subscriptions() {
        let store = Arc::new(MemoryStore::new());
        store.upsert(registration("https://push.example.com/1")).await.unwrap();
        store.upsert(registration("https://push.example.com/2")).await.unwrap();

        let service = PushService::new(store.clone(), dispatcher(), NotificationDefaults::default());
        let report = service
            .send(NotificationRequest::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!((report.sent, report.total, report.cleaned), (0, 2, 2));
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_from_config_requires_identity() {
        let store: Arc<dyn SubscriptionStore> = Arc::new(MemoryStore::new());
        let err = PushService::from_config(&Config::default(), Arc::clone(&store)).unwrap_err();
        assert_eq!(err, ConfigError::MissingIdentity);

        let identity = ServerIdentity::generate();
        let config = Config {
            vapid_public_key: Some(identity.public_key_base64url()),
            vapid_private_key: Some(identity.private_key_base64url()),
            backend: Backend::WebPush,
            ..Config::default()
        };
        let service = PushService::from_config(&config, store).unwrap();
        assert_eq!(service.dispatcher().identity().public_key(), identity.public_key());
    }

    #[tokio::test]
    async fn test_failed_cleanup_keeps_counts() {
        let store = Arc::new(ReadOnlyStore::default());
        store.upsert(registration("https://push.example.com/1")).await.unwrap();

        let service = PushService::new(store.clone(), dispatcher(), NotificationDefaults::default());
        let report = service
            .send(NotificationRequest::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.total, 1);
        assert_eq!(report.cleaned, 0);
        assert_eq!(report.permanently_invalid().len(), 1);
    }
}
