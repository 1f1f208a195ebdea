//! In-memory entry storage.
//!
//! Entries and the tag index sit behind one `RwLock`, so a reader never sees
//! an entry whose tag memberships are only half written.
//!
//! Every removal marks its keys as retiring until the caller releases them,
//! and bumps a generation counter. Promotions from the backing tier are
//! refused while a key is retiring or when the generation moved since the
//! backing read started, so a removed entry cannot be copied back from a
//! backing record that is still waiting to be deleted.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use time::OffsetDateTime;

use super::index::TagIndex;
use super::keys::Tag;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// A stored value and the instant it stops being live.
#[derive(Debug, Clone)]
pub struct Entry<V> {
    pub value: V,
    pub expires_at: OffsetDateTime,
}

impl<V> Entry<V> {
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

/// Outcome of a memory lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Hit(V),
    /// The entry had expired and has now been evicted.
    Expired,
    Absent,
}

/// Keys removed by a tag sweep, split by whether they were still live.
#[derive(Debug, Default)]
pub struct TagSweep {
    pub live: Vec<String>,
    pub expired: Vec<String>,
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    index: TagIndex,
    retiring: HashMap<String, usize>,
    generation: u64,
}

impl<V> Inner<V> {
    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        self.index.unregister(key);
        self.entries.remove(key)
    }

    fn retire<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            *self.retiring.entry(key.clone()).or_default() += 1;
        }
        self.generation += 1;
    }
}

/// Primary in-process store.
#[derive(Debug)]
pub struct MemoryStore<V> {
    inner: RwLock<Inner<V>>,
}

impl<V: Clone> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                index: TagIndex::new(),
                retiring: HashMap::new(),
                generation: 0,
            }),
        }
    }

    /// Look up a key, evicting it when its expiry has passed.
    pub fn get(&self, key: &str, now: OffsetDateTime) -> Lookup<V> {
        {
            let inner = rw_read(&self.inner, SOURCE, "get");
            match inner.entries.get(key) {
                None => return Lookup::Absent,
                Some(entry) if entry.is_live(now) => return Lookup::Hit(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Re-check under the write guard: a writer may have replaced the entry.
        let mut inner = rw_write(&self.inner, SOURCE, "get.evict");
        match inner.entries.get(key) {
            None => Lookup::Absent,
            Some(entry) if entry.is_live(now) => Lookup::Hit(entry.value.clone()),
            Some(_) => {
                inner.remove(key);
                Lookup::Expired
            }
        }
    }

    /// Insert or replace an entry and its tag memberships.
    pub fn insert(&self, key: &str, entry: Entry<V>, tags: BTreeSet<Tag>) {
        let mut inner = rw_write(&self.inner, SOURCE, "insert");
        inner.index.register(key, tags);
        inner.entries.insert(key.to_string(), entry);
    }

    /// Insert a record read from the backing tier.
    ///
    /// Refused when `key` is retiring, when any removal happened after
    /// `observed` was taken, or when a live entry is already present.
    pub fn promote(
        &self,
        key: &str,
        entry: Entry<V>,
        tags: BTreeSet<Tag>,
        observed: u64,
        now: OffsetDateTime,
    ) -> bool {
        let mut inner = rw_write(&self.inner, SOURCE, "promote");
        if inner.generation != observed
            || inner.retiring.contains_key(key)
            || inner.entries.get(key).is_some_and(|current| current.is_live(now))
        {
            return false;
        }
        inner.index.register(key, tags);
        inner.entries.insert(key.to_string(), entry);
        true
    }

    /// Removal generation; compare against it with [`MemoryStore::promote`].
    pub fn generation(&self) -> u64 {
        rw_read(&self.inner, SOURCE, "generation").generation
    }

    /// End the retiring window opened by a removal of `keys`.
    pub fn release(&self, keys: &[String]) {
        let mut inner = rw_write(&self.inner, SOURCE, "release");
        for key in keys {
            if let Some(count) = inner.retiring.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    inner.retiring.remove(key);
                }
            }
        }
        inner.generation += 1;
    }

    pub fn is_retiring(&self, key: &str) -> bool {
        rw_read(&self.inner, SOURCE, "is_retiring")
            .retiring
            .contains_key(key)
    }

    /// Remove an entry and mark `key` retiring. Returns the removed entry,
    /// live or not.
    pub fn remove(&self, key: &str) -> Option<Entry<V>> {
        let mut inner = rw_write(&self.inner, SOURCE, "remove");
        let key = key.to_string();
        inner.retire([&key]);
        inner.remove(&key)
    }

    /// Remove every entry tagged with `tag` and mark the keys retiring.
    pub fn remove_tag(&self, tag: &Tag, now: OffsetDateTime) -> TagSweep {
        let mut inner = rw_write(&self.inner, SOURCE, "remove_tag");
        let keys = inner.index.take_tag(tag);

        let mut sweep = TagSweep::default();
        for key in keys {
            match inner.remove(&key) {
                Some(entry) if entry.is_live(now) => sweep.live.push(key),
                Some(_) => sweep.expired.push(key),
                None => {}
            }
        }
        inner.retire(sweep.live.iter().chain(&sweep.expired));
        sweep
    }

    /// Remove every live entry accepted by `predicate`.
    ///
    /// Walks all entries while holding the write guard: O(entries), suitable
    /// for small caches only.
    pub fn remove_where<F>(&self, now: OffsetDateTime, mut predicate: F) -> Vec<String>
    where
        F: FnMut(&str, &V) -> bool,
    {
        let mut inner = rw_write(&self.inner, SOURCE, "remove_where");
        let matched: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && predicate(key.as_str(), &entry.value))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matched {
            inner.remove(key);
        }
        inner.retire(&matched);
        matched
    }

    /// Drop everything, returning the keys that were stored. The keys stay
    /// retiring until released.
    pub fn clear(&self) -> Vec<String> {
        let mut inner = rw_write(&self.inner, SOURCE, "clear");
        let keys: Vec<String> = inner.entries.drain().map(|(key, _)| key).collect();
        inner.index.clear();
        inner.retire(&keys);
        keys
    }

    pub fn contains(&self, key: &str, now: OffsetDateTime) -> bool {
        rw_read(&self.inner, SOURCE, "contains")
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    pub fn keys_for_tag(&self, tag: &Tag) -> HashSet<String> {
        rw_read(&self.inner, SOURCE, "keys_for_tag")
            .index
            .keys_for_tag(tag)
    }

    pub fn tags_for_key(&self, key: &str) -> BTreeSet<Tag> {
        rw_read(&self.inner, SOURCE, "tags_for_key")
            .index
            .tags_for_key(key)
    }

    /// Snapshot of the tag index as tag → keys.
    pub fn index_snapshot(&self) -> HashMap<Tag, HashSet<String>> {
        let inner = rw_read(&self.inner, SOURCE, "index_snapshot");
        inner
            .index
            .tags()
            .map(|tag| (tag.clone(), inner.index.keys_for_tag(tag)))
            .collect()
    }

    /// Stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        rw_read(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tag_count(&self) -> usize {
        rw_read(&self.inner, SOURCE, "tag_count").index.tag_count()
    }
}

impl<V: Clone> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
