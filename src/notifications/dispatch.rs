//! Fan-out delivery of one notification to many subscriptions.
//!
//! Every subscription is handled by its own task: sign (cached per push
//! service origin), encrypt, POST, classify. A semaphore bounds how many run
//! at once. Failures never cross task boundaries; one bad subscriber cannot
//! affect another's outcome.
//!
//! Status classification:
//!
//! | Response                              | Classification        |
//! |---------------------------------------|-----------------------|
//! | 2xx                                   | `Delivered`           |
//! | 404, 410                              | `PermanentlyInvalid`  |
//! | any other status, timeout, I/O error  | `TransientFailure`    |
//! | bad endpoint, bad keys, crypto error  | `TransientFailure`    |
//!
//! Only `PermanentlyInvalid` leads to deletion.

// Rust guideline compliant 2026-02

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::ece::Aes128GcmEncryptor;
use super::error::{CryptoError, DispatchError, TransportError};
use super::payload::Notification;
use super::push::{truncate_endpoint, Subscription, SubscriptionId};
use super::vapid::{AssertionCache, EcdsaSigner, ServerIdentity};
use super::{AssertionSigner, PayloadEncryptor};

/// Seconds a push service may hold an undelivered message.
pub const DEFAULT_TTL_SECS: u32 = 86_400;

/// Default number of deliveries in flight.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a single delivery attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// The push service accepted the message.
    Delivered,
    /// The subscription no longer exists; it should be deleted.
    PermanentlyInvalid,
    /// Anything else. The subscription is kept.
    TransientFailure,
}

impl Classification {
    /// Classify an HTTP status code from a push service.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Delivered,
            404 | 410 => Self::PermanentlyInvalid,
            _ => Self::TransientFailure,
        }
    }
}

/// Result of delivering to one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    /// Subscription the attempt was for.
    pub subscription_id: SubscriptionId,
    /// How it ended.
    pub classification: Classification,
    /// Status line or error text; empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl DeliveryOutcome {
    fn transient(subscription_id: SubscriptionId, detail: impl Into<String>) -> Self {
        Self {
            subscription_id,
            classification: Classification::TransientFailure,
            detail: detail.into(),
        }
    }
}

/// Aggregate result of a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Deliveries classified `Delivered`.
    pub sent: usize,
    /// Subscriptions considered, including any skipped by cancellation.
    pub total: usize,
    /// Ids submitted to a successful reconcile.
    pub cleaned: usize,
    /// Whether the dispatch stopped early.
    pub cancelled: bool,
    /// One entry per attempted subscription, in completion order.
    pub outcomes: Vec<DeliveryOutcome>,
}

impl DispatchReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        if outcome.classification == Classification::Delivered {
            self.sent += 1;
        }
        self.outcomes.push(outcome);
    }

    /// Ids the push services reported as gone.
    pub fn permanently_invalid(&self) -> Vec<SubscriptionId> {
        self.outcomes
            .iter()
            .filter(|o| o.classification == Classification::PermanentlyInvalid)
            .map(|o| o.subscription_id)
            .collect()
    }

    /// Outcomes other than `Delivered`.
    pub fn failures(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.classification != Classification::Delivered)
    }

    /// Summary returned to callers of the dispatch endpoint.
    pub fn to_response(&self) -> DispatchResponse {
        DispatchResponse {
            success: !self.cancelled,
            message: (self.total == 0).then(|| "No subscriptions".to_string()),
            sent: self.sent,
            total: self.total,
            cleaned: self.cleaned,
            failures: self.failures().cloned().collect(),
        }
    }
}

/// Wire form of a [`DispatchReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResponse {
    /// False only when the dispatch was cancelled.
    pub success: bool,
    /// Informational note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Successful deliveries.
    pub sent: usize,
    /// Subscriptions considered.
    pub total: usize,
    /// Subscriptions deleted as permanently invalid.
    pub cleaned: usize,
    /// Non-delivered outcomes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<DeliveryOutcome>,
}

/// A fully prepared push message.
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Subscriber endpoint URL.
    pub endpoint: String,
    /// Encrypted record.
    pub body: Bytes,
    /// Value of the `Authorization` header.
    pub authorization: String,
    /// Value of the `Content-Encoding` header.
    pub content_encoding: &'static str,
    /// Value of the `TTL` header.
    pub ttl: u32,
}

/// What came back from the push service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, read only for non-2xx statuses.
    pub body: String,
}

/// Sends prepared push messages.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// POST `request` to its endpoint.
    async fn send(&self, request: PushRequest) -> Result<PushResponse, TransportError>;
}

/// reqwest-backed transport with a per-request timeout.
///
/// Holds one client so connections to the same push service are pooled.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PushTransport for HttpTransport {
    async fn send(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        let response = self
            .client
            .post(&request.endpoint)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_ENCODING, request.content_encoding)
            .header(CONTENT_LENGTH, request.body.len())
            .header("TTL", request.ttl)
            .header(AUTHORIZATION, request.authorization)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        Ok(PushResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// Per-subscriber failures, flattened into [`DeliveryOutcome::detail`].
#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Shared state of one dispatcher, cloned into every task by `Arc`.
struct DeliveryWorker {
    identity: Arc<ServerIdentity>,
    encryptor: Arc<dyn PayloadEncryptor>,
    signer: Arc<dyn AssertionSigner>,
    transport: Arc<dyn PushTransport>,
    assertions: AssertionCache,
    ttl: u32,
}

impl DeliveryWorker {
    async fn deliver(&self, subscription: Subscription, payload: Bytes) -> DeliveryOutcome {
        let id = subscription.id;
        let endpoint_hint = truncate_endpoint(&subscription.endpoint);

        let result = match self.prepare(&subscription, &payload) {
            Ok(request) => self.transport.send(request).await.map_err(DeliveryError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                let classification = Classification::from_status(response.status);
                match classification {
                    Classification::Delivered => {
                        log::info!("[Push] Notification sent to: {}", endpoint_hint);
                    }
                    Classification::PermanentlyInvalid => {
                        log::info!(
                            "[Push] Subscription gone (HTTP {}): {}",
                            response.status,
                            endpoint_hint
                        );
                    }
                    Classification::TransientFailure => {
                        log::error!(
                            "[Push] Push failed (HTTP {}): {}",
                            response.status,
                            response.body
                        );
                    }
                }
                let detail = if classification == Classification::Delivered {
                    String::new()
                } else {
                    format!("HTTP {}", response.status)
                };
                DeliveryOutcome {
                    subscription_id: id,
                    classification,
                    detail,
                }
            }
            Err(e) => {
                log::error!("[Push] Failed to send to {}: {}", endpoint_hint, e);
                DeliveryOutcome::transient(id, e.to_string())
            }
        }
    }

    fn prepare(&self, subscription: &Subscription, payload: &[u8]) -> Result<PushRequest, DeliveryError> {
        let audience = audience_for(&subscription.endpoint)?;
        let keys = subscription.keys()?;
        let assertion =
            self.assertions
                .get_or_sign(&audience, self.signer.as_ref(), &self.identity)?;
        let record = self.encryptor.encrypt(payload, &keys)?;

        Ok(PushRequest {
            endpoint: subscription.endpoint.clone(),
            content_encoding: record.content_encoding(),
            body: record.into_body(),
            authorization: assertion.authorization_header(&self.identity),
            ttl: self.ttl,
        })
    }
}

/// The VAPID audience of an endpoint: its `scheme://host[:port]` origin.
fn audience_for(endpoint: &str) -> Result<String, DeliveryError> {
    let url = reqwest::Url::parse(endpoint).map_err(|e| DeliveryError::InvalidEndpoint(e.to_string()))?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err(DeliveryError::InvalidEndpoint(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(DeliveryError::InvalidEndpoint("missing host".to_string()));
    }
    Ok(url.origin().ascii_serialization())
}

/// Bounded-concurrency fan-out engine.
///
/// Built with [`Dispatcher::builder`]. Holds the server identity, the
/// encryption and signing backends, the transport, and an assertion cache
/// that lives as long as the dispatcher.
pub struct Dispatcher {
    worker: Arc<DeliveryWorker>,
    concurrency: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("concurrency", &self.concurrency)
            .field("ttl", &self.worker.ttl)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Start building a dispatcher. Defaults: hand-rolled backend, TTL
    /// 86400 s, 16 deliveries in flight.
    pub fn builder(identity: Arc<ServerIdentity>, transport: Arc<dyn PushTransport>) -> DispatcherBuilder {
        DispatcherBuilder {
            identity,
            transport,
            encryptor: Arc::new(Aes128GcmEncryptor),
            signer: Arc::new(EcdsaSigner::default()),
            ttl: DEFAULT_TTL_SECS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// The server identity used to sign assertions.
    pub fn identity(&self) -> &ServerIdentity {
        &self.worker.identity
    }

    /// Deliver `notification` to every subscription.
    ///
    /// Empty input returns immediately without touching the backends. The
    /// only error is a payload that cannot be encoded or is larger than the
    /// encryption backend accepts; per-subscriber
    /// problems are reported as outcomes. Cancelling `cancel` stops new
    /// deliveries from starting; those already started run to completion
    /// and are included in the report.
    pub async fn dispatch(
        &self,
        notification: &Notification,
        subscriptions: Vec<Subscription>,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let total = subscriptions.len();
        if total == 0 {
            log::info!("[Push] No subscriptions");
            return Ok(DispatchReport::default());
        }

        let payload = notification.to_payload()?;
        let limit = self.worker.encryptor.max_plaintext_len();
        if payload.len() > limit {
            let err = CryptoError::PayloadTooLarge {
                size: payload.len(),
                max: limit,
            };
            log::error!("[Push] Not dispatching: {}", err);
            return Err(DispatchError::Payload(err.to_string()));
        }
        log::info!(
            "[Push] Dispatching {} byte payload to {} subscription(s)",
            payload.len(),
            total
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut cancelled = false;

        for subscription in subscriptions {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                cancelled = true;
                break;
            };

            let worker = Arc::clone(&self.worker);
            let payload = payload.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.deliver(subscription, payload).await
            });
        }

        let mut report = DispatchReport {
            total,
            cancelled,
            ..DispatchReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => log::error!("[Push] Delivery task failed: {}", e),
            }
        }

        if cancelled {
            log::warn!(
                "[Push] Dispatch cancelled after {} of {} subscription(s)",
                report.outcomes.len(),
                total
            );
        }
        log::info!("[Push] Sent {}/{} notification(s)", report.sent, total);
        Ok(report)
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    identity: Arc<ServerIdentity>,
    transport: Arc<dyn PushTransport>,
    encryptor: Arc<dyn PayloadEncryptor>,
    signer: Arc<dyn AssertionSigner>,
    ttl: u32,
    concurrency: usize,
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("ttl", &self.ttl)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl DispatcherBuilder {
    /// Use a different encryption backend.
    pub fn encryptor(mut self, encryptor: Arc<dyn PayloadEncryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    /// Use a different signing backend.
    pub fn signer(mut self, signer: Arc<dyn AssertionSigner>) -> Self {
        self.signer = signer;
        self
    }

    /// TTL header value in seconds.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Maximum deliveries in flight. Zero is treated as one.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Finish.
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            worker: Arc::new(DeliveryWorker {
                identity: self.identity,
                encryptor: self.encryptor,
                signer: self.signer,
                transport: self.transport,
                assertions: AssertionCache::new(),
                ttl: self.ttl,
            }),
            concurrency: self.concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::payload::{NotificationDefaults, NotificationRequest};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_classification_from_status() {
        assert_eq!(Classification::from_status(200), Classification::Delivered);
        assert_eq!(Classification::from_status(201), Classification::Delivered);
        assert_eq!(Classification::from_status(404), Classification::PermanentlyInvalid);
        assert_eq!(Classification::from_status(410), Classification::PermanentlyInvalid);
        for status in [301, 400, 403, 413, 429, 500, 502, 503] {
            assert_eq!(Classification::from_status(status), Classification::TransientFailure);
        }
    }

    #[test]
    fn test_audience_is_origin() {
        assert_eq!(
            audience_for("https://fcm.googleapis.com/fcm/send/abc123").unwrap(),
            "https://fcm.googleapis.com"
        );
        assert_eq!(
            audience_for("https://updates.push.services.mozilla.com:443/wpush/v2/x").unwrap(),
            "https://updates.push.services.mozilla.com"
        );
        assert_eq!(
            audience_for("http://127.0.0.1:8080/push/1?q=2").unwrap(),
            "http://127.0.0.1:8080"
        );
        assert!(audience_for("not a url").is_err());
        assert!(audience_for("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_report_response() {
        let id = SubscriptionId::new();
        let mut report = DispatchReport {
            total: 2,
            ..DispatchReport::default()
        };
        report.record(DeliveryOutcome {
            subscription_id: SubscriptionId::new(),
            classification: Classification::Delivered,
            detail: String::new(),
        });
        report.record(DeliveryOutcome {
            subscription_id: id,
            classification: Classification::PermanentlyInvalid,
            detail: "HTTP 410".to_string(),
        });
        report.cleaned = 1;

        assert_eq!(report.permanently_invalid(), vec![id]);
        let response = report.to_response();
        assert!(response.success);
        assert_eq!((response.sent, response.total, response.cleaned), (1, 2, 1));
        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.message, None);

        let json = serde_json::to_value(DispatchReport::default().to_response()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"success": true, "message": "No subscriptions", "sent": 0, "total": 0, "cleaned": 0})
        );
    }

    /// Records requests and answers with a status chosen per endpoint.
    #[derive(Default)]
    struct ScriptedTransport {
        requests: Mutex<Vec<PushRequest>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        started: tokio::sync::Notify,
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn send(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let status = if request.endpoint.ends_with("/gone") {
                410
            } else if request.endpoint.ends_with("/timeout") {
                return Err(TransportError::Timeout);
            } else {
                201
            };
            self.requests.lock().unwrap().push(request);
            Ok(PushResponse {
                status,
                body: String::new(),
            })
        }
    }

    fn subscription(endpoint: &str) -> Subscription {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        use p256::elliptic_curve::rand_core::OsRng;
        use p256::elliptic_curve::sec1::ToEncodedPoint;

        let ua_public = p256::SecretKey::random(&mut OsRng)
            .public_key()
            .to_encoded_point(false);
        Subscription {
            id: SubscriptionId::new(),
            owner: None,
            endpoint: endpoint.to_string(),
            p256dh: URL_SAFE_NO_PAD.encode(ua_public.as_bytes()),
            auth: URL_SAFE_NO_PAD.encode([3u8; 16]),
            created_at: chrono::Utc::now(),
        }
    }

    fn notification() -> Notification {
        Notification::from_request(NotificationRequest::default(), &NotificationDefaults::default())
    }

    fn outcome_for(report: &DispatchReport, id: SubscriptionId) -> &DeliveryOutcome {
        report
            .outcomes
            .iter()
            .find(|o| o.subscription_id == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_classifies_each_subscription() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Dispatcher::builder(Arc::new(ServerIdentity::generate()), transport.clone()).build();

        let ok = subscription("https://push.example.com/ok");
        let gone = subscription("https://push.example.com/gone");
        let slow = subscription("https://push.example.com/timeout");
        let mut bad_keys = subscription("https://push.example.com/ok2");
        bad_keys.p256dh = "AAAA".to_string();
        let bad_endpoint = subscription("not a url");

        let ids = [ok.id, gone.id, slow.id, bad_keys.id, bad_endpoint.id];
        let report = dispatcher
            .dispatch(
                &notification(),
                vec![ok, gone, slow, bad_keys, bad_endpoint],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.total, 5);
        assert_eq!(report.sent, 1);
        assert!(!report.cancelled);
        assert_eq!(outcome_for(&report, ids[0]).classification, Classification::Delivered);
        assert_eq!(outcome_for(&report, ids[1]).classification, Classification::PermanentlyInvalid);
        assert_eq!(outcome_for(&report, ids[2]).detail, "request timed out");
        assert_eq!(outcome_for(&report, ids[3]).classification, Classification::TransientFailure);
        assert!(outcome_for(&report, ids[4]).detail.starts_with("invalid endpoint"));
        assert_eq!(report.permanently_invalid(), vec![ids[1]]);

        // Neither the bad-key nor the bad-endpoint subscriber reached the wire
        assert_eq!(transport.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Dispatcher::builder(Arc::new(ServerIdentity::generate()), transport.clone())
            .concurrency(2)
            .build();

        let subs: Vec<_> = (0..8)
            .map(|i| subscription(&format!("https://push.example.com/{i}")))
            .collect();
        let report = dispatcher
            .dispatch(&notification(), subs, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.sent, 8);
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Dispatcher::builder(Arc::new(ServerIdentity::generate()), transport.clone()).build();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let subs = vec![
            subscription("https://push.example.com/a"),
            subscription("https://push.example.com/b"),
        ];
        let report = dispatcher.dispatch(&notification(), subs, &cancel).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.total, 2);
        assert!(report.outcomes.is_empty());
        assert!(!report.to_response().success);
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_dispatch_keeps_in_flight_result() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Dispatcher::builder(Arc::new(ServerIdentity::generate()), transport.clone())
            .concurrency(1)
            .build();

        let subs: Vec<_> = (0..4)
            .map(|i| subscription(&format!("https://push.example.com/{i}")))
            .collect();
        let first = subs[0].id;

        // Cancel as soon as the first send is on the wire
        let cancel = CancellationToken::new();
        let trigger = {
            let transport = Arc::clone(&transport);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                transport.started.notified().await;
                cancel.cancel();
            })
        };

        let report = dispatcher.dispatch(&notification(), subs, &cancel).await.unwrap();
        trigger.await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.total, 4);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(outcome_for(&report, first).classification, Classification::Delivered);
        assert_eq!(report.sent, 1);
        assert_eq!(transport.requests.lock().unwrap().len(), 1);

        let response = report.to_response();
        assert!(!response.success);
        assert_eq!((response.sent, response.total), (1, 4));
    }

    #[tokio::test]
    async fn test_payload_over_backend_limit_fails_before_fan_out() {
        use crate::notifications::library::{WebPushEncryptor, WEB_PUSH_MAX_PLAINTEXT_LEN};

        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Dispatcher::builder(Arc::new(ServerIdentity::generate()), transport.clone())
            .encryptor(Arc::new(WebPushEncryptor))
            .build();

        // Fits a native record, not the library backend
        let request = NotificationRequest {
            body: Some("x".repeat(3500)),
            ..NotificationRequest::default()
        };
        let notification = Notification::from_request(request, &NotificationDefaults::default());
        let payload_len = notification.to_payload().unwrap().len();
        assert!(payload_len > WEB_PUSH_MAX_PLAINTEXT_LEN);

        let subs = vec![
            subscription("https://push.example.com/a"),
            subscription("https://push.example.com/b"),
        ];
        let err = dispatcher
            .dispatch(&notification, subs, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DispatchError::Payload(msg) => {
                assert!(msg.contains(&format!("exceeds the {WEB_PUSH_MAX_PLAINTEXT_LEN} byte")));
            }
            other => panic!("expected payload error, got {other}"),
        }
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_carries_push_headers() {
        let transport = Arc::new(ScriptedTransport::default());
        let identity = Arc::new(ServerIdentity::generate());
        let dispatcher = Dispatcher::builder(Arc::clone(&identity), transport.clone())
            .ttl(600)
            .build();

        dispatcher
            .dispatch(
                &notification(),
                vec![subscription("https://push.example.com/ok")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let requests = transport.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.ttl, 600);
        assert_eq!(request.content_encoding, "aes128gcm");
        assert!(request.authorization.starts_with("vapid t="));
        assert!(request
            .authorization
            .ends_with(&format!(", k={}", identity.public_key_base64url())));
    }
}
