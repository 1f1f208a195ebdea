//! Cache consumer.
//!
//! Drains the event queue, plans the batch and runs the invalidations
//! against the cache, cascading term tags through the ancestor resolver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::events::EventQueue;
use super::hierarchy::AncestorResolver;
use super::keys::Tag;
use super::planner::ConsumptionPlan;
use super::service::TagCache;

const METRIC_CONSUME_MS: &str = "tagcache_consume_ms";

/// What one consumption pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumeSummary {
    pub events: usize,
    pub flushed: bool,
    pub removed: usize,
}

pub struct CacheConsumer<V> {
    config: CacheConfig,
    cache: Arc<TagCache<V>>,
    queue: Arc<EventQueue>,
    resolver: Arc<dyn AncestorResolver>,
}

impl<V> CacheConsumer<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(
        config: CacheConfig,
        cache: Arc<TagCache<V>>,
        queue: Arc<EventQueue>,
        resolver: Arc<dyn AncestorResolver>,
    ) -> Self {
        Self {
            config,
            cache,
            queue,
            resolver,
        }
    }

    /// Consume up to one batch of pending events.
    ///
    /// Returns `None` when the queue was empty.
    #[instrument(skip(self))]
    pub fn consume(&self) -> Option<ConsumeSummary> {
        let started_at = Instant::now();
        let events = self.queue.drain(self.config.consume_batch_limit.max(1));
        if events.is_empty() {
            return None;
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = ConsumptionPlan::from_events(events);

        info!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Cache consumption starting"
        );

        let summary = if plan.flush_all {
            if let Err(err) = self.cache.flush_all() {
                warn!(error = %err, "Flush left backing records behind");
            }
            ConsumeSummary {
                events: event_count,
                removed: 0,
                flushed: true,
            }
        } else {
            ConsumeSummary {
                events: event_count,
                removed: self.execute(&plan),
                flushed: false,
            }
        };

        info!(
            event_count,
            removed = summary.removed,
            flushed = summary.flushed,
            "Cache consumption complete"
        );
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        Some(summary)
    }

    /// Keep consuming until the queue is empty.
    pub fn consume_all(&self) -> Vec<ConsumeSummary> {
        std::iter::from_fn(|| self.consume()).collect()
    }

    fn execute(&self, plan: &ConsumptionPlan) -> usize {
        let cascaded: usize = plan
            .cascade_terms
            .iter()
            .map(|term_id| {
                self.cache
                    .invalidate_with_ancestors(&Tag::term(*term_id), self.resolver.as_ref())
            })
            .sum();
        let direct: usize = plan
            .invalidate_tags
            .iter()
            .map(|tag| self.cache.invalidate_tag(tag))
            .sum();
        cascaded + direct
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<TagCache<V>> {
        &self.cache
    }
}

impl<V> CacheConsumer<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Consume on a fixed interval until the returned handle is aborted.
    pub fn spawn_interval(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                self.consume_all();
            }
        })
    }
}
