//! Removal of subscriptions the push services reported as gone.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::error::StoreError;
use super::push::{SubscriptionId, SubscriptionStore};

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Distinct ids submitted for deletion.
    pub requested: usize,
    /// Ids that still existed and were removed.
    pub removed: usize,
}

/// Deletes permanently invalid subscriptions in a single batch.
///
/// Deleting an id that is already gone is a no-op, so repeating a pass is
/// safe.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn SubscriptionStore>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Reconciler over `store`.
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Delete `ids` with one store call. An empty list makes no call.
    pub async fn reconcile(&self, ids: &[SubscriptionId]) -> Result<ReconcileSummary, StoreError> {
        let unique: Vec<SubscriptionId> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if unique.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        let removed = self.store.delete_many(&unique).await?;
        log::info!(
            "[Push] Cleaned up {} invalid subscription(s) ({} removed)",
            unique.len(),
            removed
        );
        Ok(ReconcileSummary {
            requested: unique.len(),
            removed,
        })
    }
}
