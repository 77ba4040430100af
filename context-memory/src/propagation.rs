//! Best-effort propagation of shared context to registered consumers.
//!
//! Delivery is at-most-once and unordered: every (consumer, item) pair is
//! attempted once on a background task, failures are logged and dropped, and
//! no ordering holds across categories or consumers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::MemoryResult;
use crate::record::{ContextCategory, SharedContextItem};

/// Component notified when context is shared.
#[async_trait]
pub trait ContextConsumer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether the consumer wants items of `category`.
    fn interested_in(&self, _category: ContextCategory) -> bool {
        true
    }

    /// Receives a read-only view of an item stored under bucket `key`.
    async fn on_context_shared(&self, key: &str, item: Arc<SharedContextItem>) -> MemoryResult<()>;
}

/// Item and bucket key handed to consumers.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Bucket the item was stored in.
    pub key: String,
    /// The stored item.
    pub item: Arc<SharedContextItem>,
}

/// Tally of one propagation round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Deliveries the consumer accepted.
    pub delivered: usize,
    /// Deliveries the consumer rejected.
    pub failed: usize,
}

/// Registry of consumers plus the fan-out logic.
#[derive(Default)]
pub struct Propagator {
    consumers: RwLock<Vec<Arc<dyn ContextConsumer>>>,
}

impl std::fmt::Debug for Propagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Propagator")
            .field("consumers", &"dyn ContextConsumer")
            .finish()
    }
}

impl Propagator {
    /// Creates a propagator with no consumers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer.
    pub async fn register(&self, consumer: Arc<dyn ContextConsumer>) {
        debug!(consumer = consumer.name(), "registered context consumer");
        self.consumers.write().await.push(consumer);
    }

    /// Number of registered consumers.
    pub async fn len(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Returns `true` when no consumer is registered.
    pub async fn is_empty(&self) -> bool {
        self.consumers.read().await.is_empty()
    }

    /// Spawns delivery of `deliveries` and returns immediately.
    ///
    /// Returns `None` when there is nothing to deliver.
    pub async fn propagate(&self, deliveries: Vec<Delivery>) -> Option<JoinHandle<PropagationReport>> {
        if deliveries.is_empty() {
            return None;
        }
        let consumers = self.consumers.read().await.clone();
        if consumers.is_empty() {
            return None;
        }
        Some(tokio::spawn(deliver(consumers, deliveries)))
    }
}

async fn deliver(
    consumers: Vec<Arc<dyn ContextConsumer>>,
    deliveries: Vec<Delivery>,
) -> PropagationReport {
    let mut pending = FuturesUnordered::new();
    for consumer in &consumers {
        for delivery in &deliveries {
            if !consumer.interested_in(delivery.item.category()) {
                continue;
            }
            let consumer = Arc::clone(consumer);
            let delivery = delivery.clone();
            pending.push(async move {
                let result = consumer
                    .on_context_shared(&delivery.key, delivery.item)
                    .await;
                (consumer, delivery.key, result)
            });
        }
    }

    let mut report = PropagationReport::default();
    while let Some((consumer, key, result)) = pending.next().await {
        match result {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                report.failed += 1;
                warn!(consumer = consumer.name(), key = %key, ?err, "context propagation failed");
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryError;
    use tokio::sync::Mutex;

    struct Recorder {
        name: &'static str,
        only: Option<ContextCategory>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContextConsumer for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn interested_in(&self, category: ContextCategory) -> bool {
            self.only.is_none_or(|only| only == category)
        }

        async fn on_context_shared(&self, key: &str, _item: Arc<SharedContextItem>) -> MemoryResult<()> {
            self.seen.lock().await.push(key.to_owned());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ContextConsumer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_context_shared(&self, _key: &str, _item: Arc<SharedContextItem>) -> MemoryResult<()> {
            Err(MemoryError::consumer("offline"))
        }
    }

    fn delivery(key: &str, category: ContextCategory) -> Delivery {
        Delivery {
            key: key.to_owned(),
            item: Arc::new(SharedContextItem::builder(category, key).build().unwrap()),
        }
    }

    #[tokio::test]
    async fn delivers_to_interested_consumers_and_tolerates_failures() {
        let propagator = Propagator::new();
        let everything = Arc::new(Recorder {
            name: "all",
            only: None,
            seen: Mutex::new(Vec::new()),
        });
        let financial_only = Arc::new(Recorder {
            name: "financial",
            only: Some(ContextCategory::Financial),
            seen: Mutex::new(Vec::new()),
        });
        propagator.register(everything.clone()).await;
        propagator.register(financial_only.clone()).await;
        propagator.register(Arc::new(Failing)).await;

        let report = propagator
            .propagate(vec![
                delivery("financial", ContextCategory::Financial),
                delivery("document", ContextCategory::Document),
            ])
            .await
            .expect("consumers registered")
            .await
            .unwrap();

        assert_eq!(report, PropagationReport { delivered: 3, failed: 2 });
        let mut all = everything.seen.lock().await.clone();
        all.sort();
        assert_eq!(all, ["document", "financial"]);
        assert_eq!(*financial_only.seen.lock().await, ["financial"]);
    }

    #[tokio::test]
    async fn nothing_to_do_without_consumers() {
        let propagator = Propagator::new();
        assert!(propagator.is_empty().await);
        assert!(
            propagator
                .propagate(vec![delivery("x", ContextCategory::Workflow)])
                .await
                .is_none()
        );
    }
}
