/// Subscribers attached to a live query.
///
/// Every registration gets its own subscriber, even when the underlying
/// query is shared. A subscriber owns its change predicate, its diff
/// callback, the snapshot of rows it has been told about, and the sending
/// side of its handle's error channel.
use crate::diff::RowsDiff;
use crate::error::{BoxError, LiveError};
use crate::notifier::TriggerFn;
use crate::types::CachedRow;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback receiving the diff of a refresh.
pub type DiffCallback = Arc<dyn Fn(&RowsDiff) -> Result<(), BoxError> + Send + Sync>;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Rows a subscriber has seen, shared with the canonical cache.
pub(crate) type Snapshot = Arc<Vec<Arc<CachedRow>>>;

pub(crate) struct Subscriber {
    pub id: SubscriptionId,
    pub trigger: TriggerFn,
    pub callback: DiffCallback,
    pub snapshot: Snapshot,
    /// A change matched this subscriber since its last delivery.
    pub triggered: bool,
    errors: mpsc::UnboundedSender<LiveError>,
}

impl Subscriber {
    pub fn new(
        id: SubscriptionId,
        trigger: TriggerFn,
        callback: DiffCallback,
        errors: mpsc::UnboundedSender<LiveError>,
    ) -> Self {
        Self {
            id,
            trigger,
            callback,
            snapshot: Arc::new(Vec::new()),
            triggered: false,
            errors,
        }
    }

    /// Send an error to the handle. A dropped handle is ignored.
    pub fn report(&self, error: LiveError) {
        let _ = self.errors.send(error);
    }

    pub fn error_sender(&self) -> mpsc::UnboundedSender<LiveError> {
        self.errors.clone()
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("rows", &self.snapshot.len())
            .field("triggered", &self.triggered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::TableChange;

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(7).to_string(), "sub-7");
    }

    #[tokio::test]
    async fn test_report_reaches_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = Subscriber::new(
            SubscriptionId(1),
            Arc::new(|_: &TableChange| true),
            Arc::new(|_: &RowsDiff| Ok(())),
            tx,
        );
        sub.report(LiveError::StoreError("boom".to_string()));
        assert!(matches!(rx.recv().await, Some(LiveError::StoreError(_))));

        drop(rx);
        // Should not panic once the handle is gone
        sub.report(LiveError::StoreError("again".to_string()));
    }
}
