//! Push subscriptions and the stores that hold them.
//!
//! A subscription is what a browser hands out from `PushManager.subscribe()`:
//! an endpoint URL plus the `p256dh` / `auth` keys. Endpoints are unique per
//! store; registering a known endpoint again updates the existing record.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ece::SubscriberKeys;
use super::error::{CryptoError, StoreError};

/// Stable identifier of a stored subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SubscriptionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A stored browser push subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Store-assigned id.
    pub id: SubscriptionId,
    /// Opaque reference to whoever registered it (user id, device label).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Push service endpoint URL.
    pub endpoint: String,
    /// Browser's P-256 ECDH public key (base64, either alphabet).
    pub p256dh: String,
    /// Shared auth secret (base64, either alphabet).
    pub auth: String,
    /// When the endpoint was first registered.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Decode the subscriber's keys.
    pub fn keys(&self) -> Result<SubscriberKeys, CryptoError> {
        SubscriberKeys::from_base64(&self.p256dh, &self.auth)
    }
}

/// What a registration flow submits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Push service endpoint URL.
    pub endpoint: String,
    /// Browser's P-256 ECDH public key.
    pub p256dh: String,
    /// Shared auth secret.
    pub auth: String,
    /// Optional owner reference.
    #[serde(default)]
    pub owner: Option<String>,
}

/// Persistence seam for subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert, or update the record that already holds this endpoint.
    async fn upsert(&self, registration: Registration) -> Result<Subscription, StoreError>;

    /// Delete every listed id. Unknown ids are ignored. Returns how many
    /// records were actually removed.
    async fn delete_many(&self, ids: &[SubscriptionId]) -> Result<usize, StoreError>;

    /// Snapshot of all subscriptions, oldest first.
    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError>;
}

/// In-memory subscription table shared by the store implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionTable {
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl SubscriptionTable {
    /// Add a subscription, or refresh keys and owner of the one already
    /// registered for this endpoint. The existing id is kept.
    pub fn upsert(&mut self, registration: Registration) -> Subscription {
        if let Some(existing) = self
            .subscriptions
            .values_mut()
            .find(|s| s.endpoint == registration.endpoint)
        {
            log::info!(
                "[Store] Replacing keys for existing endpoint {}",
                truncate_endpoint(&existing.endpoint)
            );
            existing.p256dh = registration.p256dh;
            existing.auth = registration.auth;
            existing.owner = registration.owner;
            return existing.clone();
        }

        let subscription = Subscription {
            id: SubscriptionId::new(),
            owner: registration.owner,
            endpoint: registration.endpoint,
            p256dh: registration.p256dh,
            auth: registration.auth,
            created_at: Utc::now(),
        };
        self.subscriptions
            .insert(subscription.id, subscription.clone());
        subscription
    }

    /// Remove the listed ids, returning how many existed.
    pub fn remove_many(&mut self, ids: &[SubscriptionId]) -> usize {
        ids.iter()
            .filter(|id| self.subscriptions.remove(*id).is_some())
            .count()
    }

    /// All subscriptions, oldest first.
    pub fn all(&self) -> Vec<Subscription> {
        let mut all: Vec<Subscription> = self.subscriptions.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Look up the subscription registered for `endpoint`.
    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<&Subscription> {
        self.subscriptions.values().find(|s| s.endpoint == endpoint)
    }

    /// Number of stored subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Drop duplicate endpoints, keeping the newest record of each.
    ///
    /// Only hand-edited files can violate endpoint uniqueness; this repairs
    /// them on load. Returns the number of records removed.
    pub fn dedup_by_endpoint(&mut self) -> usize {
        let mut newest: HashMap<&str, &Subscription> = HashMap::new();
        for sub in self.subscriptions.values() {
            let keep = match newest.get(sub.endpoint.as_str()) {
                Some(current) => sub.created_at > current.created_at,
                None => true,
            };
            if keep {
                newest.insert(sub.endpoint.as_str(), sub);
            }
        }

        let stale: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|s| newest.get(s.endpoint.as_str()).is_some_and(|n| n.id != s.id))
            .map(|s| s.id)
            .collect();
        self.remove_many(&stale)
    }
}

/// Non-persistent store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<SubscriptionTable>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, SubscriptionTable>, StoreError> {
        self.table.lock().map_err(|e| {
            log::error!("[Store] Lock poisoned: {e}");
            StoreError::Poisoned
        })
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn upsert(&self, registration: Registration) -> Result<Subscription, StoreError> {
        Ok(self.table()?.upsert(registration))
    }

    async fn delete_many(&self, ids: &[SubscriptionId]) -> Result<usize, StoreError> {
        Ok(self.table()?.remove_many(ids))
    }

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.table()?.all())
    }
}

/// JSON-file store.
///
/// Every mutation is staged on a copy of the table, written through a
/// temporary file and a rename, and only then made visible. A failed write
/// leaves both the file and the in-memory table unchanged. The file is
/// created with mode 0600 on Unix.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    table: tokio::sync::Mutex<SubscriptionTable>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut table = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str::<SubscriptionTable>(&content)?
        } else {
            SubscriptionTable::default()
        };

        let removed = table.dedup_by_endpoint();
        if removed > 0 {
            log::warn!("[Store] Dropped {} duplicate endpoint(s) from {:?}", removed, path);
        }
        log::info!("[Store] Loaded {} subscription(s) from {:?}", table.len(), path);

        Ok(Self {
            path,
            table: tokio::sync::Mutex::new(table),
        })
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `table` off the async runtime; hands it back once it is on disk.
    async fn persist(&self, table: SubscriptionTable) -> Result<SubscriptionTable, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_table(&path, &table).map(|()| table))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

fn write_table(path: &Path, table: &SubscriptionTable) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(table)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp_path, path)?;
    log::debug!("[Store] Saved {} subscription(s) to {:?}", table.len(), path);
    Ok(())
}

#[async_trait]
impl SubscriptionStore for FileStore {
    async fn upsert(&self, registration: Registration) -> Result<Subscription, StoreError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let subscription = next.upsert(registration);
        *table = self.persist(next).await?;
        Ok(subscription)
    }

    async fn delete_many(&self, ids: &[SubscriptionId]) -> Result<usize, StoreError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let removed = next.remove_many(ids);
        if removed > 0 {
            *table = self.persist(next).await?;
        }
        Ok(removed)
    }

    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.table.lock().await.all())
    }
}

/// Endpoint prefix safe to put in logs.
pub(crate) fn truncate_endpoint(endpoint: &str) -> String {
    endpoint.chars().take(60).collect()
}
