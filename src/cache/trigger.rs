//! Cache trigger service.
//!
//! Convenience publishers for the owning application layer to call when it
//! observes a domain change.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::config::CacheConfig;
use super::consumer::{CacheConsumer, ConsumeSummary};
use super::events::{EventKind, EventQueue};

/// Publishes cache events and optionally consumes them on the spot.
///
/// ```ignore
/// // After a category is edited:
/// trigger.term_saved(term.id);
/// ```
pub struct CacheTrigger<V> {
    config: CacheConfig,
    queue: Arc<EventQueue>,
    consumer: Arc<CacheConsumer<V>>,
}

impl<V> CacheTrigger<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(config: CacheConfig, queue: Arc<EventQueue>, consumer: Arc<CacheConsumer<V>>) -> Self {
        Self {
            config,
            queue,
            consumer,
        }
    }

    /// Publish `kind`; with `consume_now` the pending queue is drained
    /// before returning.
    pub fn trigger(&self, kind: EventKind, consume_now: bool) -> Vec<ConsumeSummary> {
        if !self.config.enabled {
            debug!(event_kind = ?kind, "Cache trigger skipped: cache disabled");
            return Vec::new();
        }

        self.queue.publish(kind);

        if consume_now {
            self.consumer.consume_all()
        } else {
            Vec::new()
        }
    }

    pub fn term_saved(&self, term_id: u64) {
        self.trigger(EventKind::TermSaved { term_id }, true);
    }

    pub fn term_deleted(&self, term_id: u64) {
        self.trigger(EventKind::TermDeleted { term_id }, true);
    }

    pub fn term_meta_updated(&self, term_id: u64, meta_key: &str) {
        self.trigger(
            EventKind::TermMetaUpdated {
                term_id,
                meta_key: meta_key.to_string(),
            },
            true,
        );
    }

    pub fn product_updated(&self, product_id: u64, term_ids: Vec<u64>) {
        self.trigger(
            EventKind::ProductUpdated {
                product_id,
                term_ids,
            },
            true,
        );
    }

    pub fn grid_saved(&self, slug: &str) {
        self.trigger(
            EventKind::GridSaved {
                slug: slug.to_string(),
            },
            true,
        );
    }

    pub fn grid_deleted(&self, slug: &str) {
        self.trigger(
            EventKind::GridDeleted {
                slug: slug.to_string(),
            },
            true,
        );
    }

    pub fn settings_updated(&self) {
        self.trigger(EventKind::SettingsUpdated, true);
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn consumer(&self) -> &Arc<CacheConsumer<V>> {
        &self.consumer
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::hierarchy::NoAncestors;
    use crate::cache::keys::Tag;
    use crate::cache::service::TagCache;

    fn create_trigger(config: CacheConfig) -> CacheTrigger<String> {
        let cache = Arc::new(TagCache::new(config.clone()));
        let queue = Arc::new(EventQueue::new());
        let consumer = Arc::new(CacheConsumer::new(
            config.clone(),
            cache,
            queue.clone(),
            Arc::new(NoAncestors),
        ));
        CacheTrigger::new(config, queue, consumer)
    }

    #[test]
    fn trigger_without_consume_leaves_event_queued() {
        let trigger = create_trigger(CacheConfig::default());
        assert!(trigger.trigger(EventKind::SettingsUpdated, false).is_empty());
        assert_eq!(trigger.queue.len(), 1);
    }

    #[test]
    fn disabled_cache_publishes_nothing() {
        let trigger = create_trigger(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        trigger.term_saved(1);
        assert!(trigger.queue.is_empty());
    }

    #[test]
    fn convenience_methods_consume_immediately() {
        let trigger = create_trigger(CacheConfig::default());
        let cache = trigger.consumer().cache().clone();
        cache
            .set("grid", "html".to_string(), Duration::from_secs(60), [Tag::grid("home")])
            .expect("memory set");

        trigger.grid_saved("home");
        assert!(!cache.contains("grid"));

        trigger.term_saved(1);
        trigger.term_deleted(1);
        trigger.term_meta_updated(1, "thumbnail_id");
        trigger.product_updated(2, vec![1]);
        trigger.grid_deleted("home");
        trigger.settings_updated();
        assert!(trigger.queue.is_empty());
    }
}
