//! The tag cache facade.
//!
//! Combines the in-memory store, an optional backing tier and an injectable
//! clock behind one API. Construct it once at startup and share it with
//! `Arc`; there is no global instance.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::error::{BackingStoreError, CacheError};

use super::backing::{BackingStore, PersistedRecord};
use super::clock::{Clock, SystemClock, saturating_add};
use super::config::CacheConfig;
use super::hierarchy::AncestorResolver;
use super::keys::Tag;
use super::store::{Entry, Lookup, MemoryStore};

const METRIC_HIT: &str = "tagcache_hit_total";
const METRIC_MISS: &str = "tagcache_miss_total";
const METRIC_EXPIRED: &str = "tagcache_expired_total";
const METRIC_INVALIDATED: &str = "tagcache_invalidated_total";
const METRIC_BACKING_ERROR: &str = "tagcache_backing_error_total";

/// Keyed cache with tag-based invalidation.
pub struct TagCache<V> {
    config: CacheConfig,
    memory: MemoryStore<V>,
    backing: Option<Arc<dyn BackingStore>>,
    clock: Arc<dyn Clock>,
    version: AtomicU64,
}

impl<V> TagCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Memory-only cache on the system clock.
    pub fn new(config: CacheConfig) -> Self {
        let version = AtomicU64::new(config.version);
        Self {
            config,
            memory: MemoryStore::new(),
            backing: None,
            clock: Arc::new(SystemClock),
            version,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a persistent tier consulted when memory misses.
    pub fn with_backing(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.backing = Some(backing);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Current version stamp for new keys.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Advance the version stamp. Keys built with older stamps are never
    /// requested again and age out through their TTL.
    pub fn bump_version(&self) -> u64 {
        let next = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(version = next, "Cache version bumped");
        next
    }

    // ========================================================================
    // Store operations
    // ========================================================================

    /// Fetch a live value, falling back to the backing tier on a memory miss.
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.config.enabled {
            return None;
        }

        let now = self.clock.now();
        match self.memory.get(key, now) {
            Lookup::Hit(value) => {
                counter!(METRIC_HIT, "tier" => "memory").increment(1);
                return Some(value);
            }
            Lookup::Expired => {
                counter!(METRIC_EXPIRED).increment(1);
                debug!(key, "Evicted expired entry on read");
            }
            Lookup::Absent => {}
        }

        if let Some(value) = self.fallback_get(key, now) {
            counter!(METRIC_HIT, "tier" => "backing").increment(1);
            return Some(value);
        }

        counter!(METRIC_MISS).increment(1);
        None
    }

    fn fallback_get(&self, key: &str, now: OffsetDateTime) -> Option<V> {
        let backing = self.backing.as_ref()?;
        let generation = self.memory.generation();

        let record = match backing.get(key) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) if err.is_corrupt() => {
                warn!(key, error = %err, "Discarding corrupt backing record");
                counter!(METRIC_BACKING_ERROR, "op" => "get").increment(1);
                self.backing_delete("get.corrupt", key);
                return None;
            }
            Err(err) => {
                self.backing_failed("get", &err);
                return None;
            }
        };

        if !record.is_live(now) {
            counter!(METRIC_EXPIRED).increment(1);
            self.backing_delete("get.expired", key);
            return None;
        }

        match serde_json::from_slice::<V>(&record.value) {
            Ok(value) => {
                let entry = Entry {
                    value: value.clone(),
                    expires_at: record.expires_at,
                };
                if !self
                    .memory
                    .promote(key, entry, record.tags, generation, now)
                {
                    debug!(key, "Backing record raced a removal; treating as a miss");
                    return None;
                }
                debug!(key, "Promoted backing record into memory");
                Some(value)
            }
            Err(err) => {
                warn!(key, error = %err, "Discarding undecodable backing record");
                self.backing_delete("get.undecodable", key);
                None
            }
        }
    }

    /// Insert or replace `key`, expiring after `ttl`. A `ttl` past the
    /// representable range expires at the last representable instant.
    ///
    /// The memory write always happens; an error only reports that the
    /// backing tier did not receive it.
    pub fn set<T>(&self, key: &str, value: V, ttl: Duration, tags: T) -> Result<(), CacheError>
    where
        T: IntoIterator<Item = Tag>,
    {
        if !self.config.enabled {
            return Ok(());
        }

        let expires_at = saturating_add(self.clock.now(), ttl);
        let tags: BTreeSet<Tag> = tags.into_iter().collect();
        let encoded = self
            .backing
            .as_ref()
            .map(|_| serde_json::to_vec(&value).map(Bytes::from));

        self.memory.insert(
            key,
            Entry {
                value,
                expires_at,
            },
            tags.clone(),
        );

        let (Some(backing), Some(encoded)) = (self.backing.as_ref(), encoded) else {
            return Ok(());
        };
        let record = PersistedRecord {
            key: key.to_string(),
            value: encoded.map_err(CacheError::Encode)?,
            expires_at,
            tags,
        };
        backing.set(&record).map_err(|err| {
            self.backing_failed("set", &err);
            CacheError::backing("set", err)
        })
    }

    /// Return the cached value or populate it from `loader`.
    ///
    /// A loader returning `None` leaves the cache untouched. Persistence
    /// failures are logged; the loaded value is still returned.
    pub fn get_or_insert_with<T, F>(&self, key: &str, ttl: Duration, tags: T, loader: F) -> Option<V>
    where
        T: IntoIterator<Item = Tag>,
        F: FnOnce() -> Option<V>,
    {
        if let Some(value) = self.get(key) {
            return Some(value);
        }

        let value = loader()?;
        if let Err(err) = self.set(key, value.clone(), ttl, tags) {
            warn!(key, error = %err, "Populated entry was not persisted");
        }
        Some(value)
    }

    /// Remove `key` from both tiers. Missing keys are not an error.
    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.memory.remove(key);

        let result = match self.backing.as_ref() {
            Some(backing) => backing.delete(key).map_err(|err| {
                self.backing_failed("delete", &err);
                CacheError::backing("delete", err)
            }),
            None => Ok(()),
        };
        self.memory.release(&[key.to_string()]);
        result
    }

    /// Clear every entry and the whole tag index.
    ///
    /// Backing records are removed for the keys memory knew about; the first
    /// backing failure is returned after all deletions were attempted.
    pub fn flush_all(&self) -> Result<(), CacheError> {
        let keys = self.memory.clear();
        info!(flushed = keys.len(), "Cache flushed");

        let mut first_error = None;
        if let Some(backing) = self.backing.as_ref() {
            for key in &keys {
                if let Err(err) = backing.delete(key) {
                    self.backing_failed("flush_all", &err);
                    first_error.get_or_insert(err);
                }
            }
        }
        self.memory.release(&keys);

        match first_error {
            Some(err) => Err(CacheError::backing("flush_all", err)),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Remove every entry tagged with `tag`. Returns the number of live
    /// entries removed; expired leftovers are cleaned up but not counted.
    pub fn invalidate_tag(&self, tag: &Tag) -> usize {
        let sweep = self.memory.remove_tag(tag, self.clock.now());
        for key in sweep.live.iter().chain(&sweep.expired) {
            self.backing_delete("invalidate_tag", key);
        }
        self.memory.release(&sweep.live);
        self.memory.release(&sweep.expired);

        let removed = sweep.live.len();
        counter!(METRIC_INVALIDATED, "cause" => "tag").increment(removed as u64);
        debug!(tag = %tag, removed, expired = sweep.expired.len(), "Tag invalidated");
        removed
    }

    /// Invalidate `tag`, then each ancestor in the order the resolver
    /// returns them.
    #[instrument(skip_all, fields(tag = %tag))]
    pub fn invalidate_with_ancestors(&self, tag: &Tag, resolver: &dyn AncestorResolver) -> usize {
        let mut seen = HashSet::from([tag.clone()]);
        let mut removed = self.invalidate_tag(tag);

        for ancestor in resolver.ancestors(tag) {
            if seen.insert(ancestor.clone()) {
                removed += self.invalidate_tag(&ancestor);
            }
        }

        info!(removed, "Tag and ancestors invalidated");
        removed
    }

    /// Remove every live entry whose value satisfies `predicate`.
    ///
    /// This is a linear scan over all entries. Prefer tags; keep this for
    /// small caches or one-off repairs.
    pub fn invalidate_by_predicate<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&V) -> bool,
    {
        let removed = self
            .memory
            .remove_where(self.clock.now(), |_, value| predicate(value));
        self.finish_scan("predicate", &removed)
    }

    /// Remove every live key starting with `prefix`. Also a linear scan.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let removed = self
            .memory
            .remove_where(self.clock.now(), |key, _| key.starts_with(prefix));
        self.finish_scan("prefix", &removed)
    }

    fn finish_scan(&self, cause: &'static str, removed: &[String]) -> usize {
        for key in removed {
            self.backing_delete(cause, key);
        }
        self.memory.release(removed);
        counter!(METRIC_INVALIDATED, "cause" => cause).increment(removed.len() as u64);
        debug!(cause, removed = removed.len(), "Scan invalidation complete");
        removed.len()
    }

    fn backing_delete(&self, op: &'static str, key: &str) {
        if let Some(backing) = self.backing.as_ref()
            && let Err(err) = backing.delete(key)
        {
            self.backing_failed(op, &err);
        }
    }

    fn backing_failed(&self, op: &'static str, err: &BackingStoreError) {
        warn!(
            op,
            error = %err,
            result = "degraded",
            "Backing store operation failed; continuing in memory"
        );
        counter!(METRIC_BACKING_ERROR, "op" => op).increment(1);
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn contains(&self, key: &str) -> bool {
        self.memory.contains(key, self.clock.now())
    }

    pub fn keys_for_tag(&self, tag: &Tag) -> HashSet<String> {
        self.memory.keys_for_tag(tag)
    }

    pub fn tags_for_key(&self, key: &str) -> BTreeSet<Tag> {
        self.memory.tags_for_key(key)
    }

    pub fn index_snapshot(&self) -> HashMap<Tag, HashSet<String>> {
        self.memory.index_snapshot()
    }

    /// Entries held in memory, including expired ones not yet observed.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn tag_count(&self) -> usize {
        self.memory.tag_count()
    }
}
