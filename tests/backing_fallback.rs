//! Two-tier behavior: memory misses fall back to the persistent tier and
//! tier failures degrade to memory-only operation.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tagcache::cache::{
    BackingStore, CacheConfig, FsBackingStore, ManualClock, PersistedRecord, Tag, TagCache,
};
use tagcache::error::{BackingStoreError, CacheError};
use tempfile::TempDir;

const TTL: Duration = Duration::from_secs(1800);

fn disk_cache(dir: &TempDir, clock: Arc<ManualClock>) -> TagCache<String> {
    let store = FsBackingStore::open(dir.path()).expect("open backing store");
    TagCache::new(CacheConfig::default())
        .with_clock(clock)
        .with_backing(Arc::new(store))
}

/// A backing store that is always down.
#[derive(Default)]
struct UnavailableStore {
    calls: AtomicUsize,
}

impl BackingStore for UnavailableStore {
    fn get(&self, _key: &str) -> Result<Option<PersistedRecord>, BackingStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackingStoreError::unavailable("connection refused"))
    }

    fn set(&self, _record: &PersistedRecord) -> Result<(), BackingStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackingStoreError::unavailable("connection refused"))
    }

    fn delete(&self, _key: &str) -> Result<(), BackingStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackingStoreError::unavailable("connection refused"))
    }
}

#[test]
fn restart_serves_from_disk_and_restores_tags() {
    let dir = TempDir::new().expect("temp dir");
    let clock = Arc::new(ManualClock::default());

    let first = disk_cache(&dir, clock.clone());
    first
        .set(
            "grid_abc",
            "<ul/>".to_string(),
            TTL,
            [Tag::term(5), Tag::term(9)],
        )
        .expect("write through");
    drop(first);

    let second = disk_cache(&dir, clock.clone());
    assert!(!second.contains("grid_abc"));
    assert_eq!(second.get("grid_abc").as_deref(), Some("<ul/>"));

    assert!(second.contains("grid_abc"));
    assert_eq!(
        second.tags_for_key("grid_abc"),
        BTreeSet::from([Tag::term(5), Tag::term(9)])
    );

    assert_eq!(second.invalidate_tag(&Tag::term(5)), 1);
    drop(second);

    let third = disk_cache(&dir, clock);
    assert_eq!(third.get("grid_abc"), None);
}

#[test]
fn promoted_entry_keeps_its_remaining_ttl() {
    let dir = TempDir::new().expect("temp dir");
    let clock = Arc::new(ManualClock::default());

    disk_cache(&dir, clock.clone())
        .set("k", "v".to_string(), Duration::from_secs(100), Vec::<Tag>::new())
        .expect("write through");

    clock.advance(Duration::from_secs(60));
    let cache = disk_cache(&dir, clock.clone());
    assert_eq!(cache.get("k").as_deref(), Some("v"));

    clock.advance(Duration::from_secs(40));
    assert_eq!(cache.get("k"), None);
}

#[test]
fn expired_disk_record_is_a_miss_and_is_removed() {
    let dir = TempDir::new().expect("temp dir");
    let clock = Arc::new(ManualClock::default());

    disk_cache(&dir, clock.clone())
        .set("k", "v".to_string(), Duration::from_secs(10), Vec::<Tag>::new())
        .expect("write through");

    clock.advance(Duration::from_secs(10));
    let cache = disk_cache(&dir, clock);
    assert_eq!(cache.get("k"), None);

    let store = FsBackingStore::open(dir.path()).expect("reopen store");
    assert!(store.get("k").expect("read store").is_none());
}

#[test]
fn delete_and_flush_reach_the_disk() {
    let dir = TempDir::new().expect("temp dir");
    let clock = Arc::new(ManualClock::default());
    let cache = disk_cache(&dir, clock.clone());

    cache.set("a", "1".to_string(), TTL, Vec::<Tag>::new()).expect("set a");
    cache.set("b", "2".to_string(), TTL, Vec::<Tag>::new()).expect("set b");
    cache.delete("a").expect("delete a");
    cache.flush_all().expect("flush");
    cache.flush_all().expect("second flush is a no-op");

    let reopened = disk_cache(&dir, clock);
    assert_eq!(reopened.get("a"), None);
    assert_eq!(reopened.get("b"), None);
}

#[test]
fn unavailable_backing_degrades_to_memory() {
    let store = Arc::new(UnavailableStore::default());
    let cache: TagCache<String> =
        TagCache::new(CacheConfig::default()).with_backing(store.clone());

    let err = cache
        .set("k", "v".to_string(), TTL, [Tag::grid("home")])
        .expect_err("backing write fails");
    assert!(matches!(
        err,
        CacheError::BackingStoreUnavailable { op: "set", .. }
    ));

    assert_eq!(cache.get("k").as_deref(), Some("v"));
    assert_eq!(cache.get("missing"), None);

    assert_eq!(cache.invalidate_tag(&Tag::grid("home")), 1);
    assert!(!cache.contains("k"));

    cache.set("j", "w".to_string(), TTL, Vec::<Tag>::new()).ok();
    assert!(cache.delete("j").is_err());
    assert!(!cache.contains("j"));

    cache.set("f", "x".to_string(), TTL, Vec::<Tag>::new()).ok();
    assert!(cache.flush_all().is_err());
    assert!(cache.is_empty());

    assert!(store.calls.load(Ordering::SeqCst) > 0);
}

#[test]
fn memory_only_cache_never_errors() {
    let cache: TagCache<String> = TagCache::new(CacheConfig::default());
    cache.set("k", "v".to_string(), TTL, Vec::<Tag>::new()).expect("set");
    cache.delete("k").expect("delete");
    cache.delete("k").expect("delete missing");
    cache.flush_all().expect("flush");
}

/// Reads the key back through the cache at the start of every delete, the
/// way a concurrent reader interleaves with an invalidation.
#[derive(Default)]
struct ReadDuringDeleteStore {
    records: Mutex<HashMap<String, PersistedRecord>>,
    cache: OnceLock<Weak<TagCache<String>>>,
    reads: Mutex<Vec<Option<String>>>,
}

impl BackingStore for ReadDuringDeleteStore {
    fn get(&self, key: &str) -> Result<Option<PersistedRecord>, BackingStoreError> {
        Ok(self.records.lock().expect("records lock").get(key).cloned())
    }

    fn set(&self, record: &PersistedRecord) -> Result<(), BackingStoreError> {
        self.records
            .lock()
            .expect("records lock")
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BackingStoreError> {
        if let Some(cache) = self.cache.get().and_then(Weak::upgrade) {
            let read = cache.get(key);
            self.reads.lock().expect("reads lock").push(read);
        }
        self.records.lock().expect("records lock").remove(key);
        Ok(())
    }
}

#[test]
fn read_between_memory_and_backing_removal_does_not_restore_entry() {
    let store = Arc::new(ReadDuringDeleteStore::default());
    let cache: Arc<TagCache<String>> =
        Arc::new(TagCache::new(CacheConfig::default()).with_backing(store.clone()));
    assert!(store.cache.set(Arc::downgrade(&cache)).is_ok());

    cache
        .set("grid_abc", "<html>".to_string(), TTL, [Tag::term(5)])
        .expect("write through");
    assert_eq!(cache.invalidate_tag(&Tag::term(5)), 1);

    assert_eq!(*store.reads.lock().expect("reads lock"), vec![None]);
    assert_eq!(cache.get("grid_abc"), None);
    assert!(cache.keys_for_tag(&Tag::term(5)).is_empty());
    assert!(!cache.contains("grid_abc"));
}

#[test]
fn read_during_delete_and_flush_does_not_restore_entry() {
    let store = Arc::new(ReadDuringDeleteStore::default());
    let cache: Arc<TagCache<String>> =
        Arc::new(TagCache::new(CacheConfig::default()).with_backing(store.clone()));
    assert!(store.cache.set(Arc::downgrade(&cache)).is_ok());

    cache.set("a", "1".to_string(), TTL, [Tag::term(1)]).expect("set a");
    cache.set("b", "2".to_string(), TTL, [Tag::term(2)]).expect("set b");
    cache.delete("a").expect("delete a");
    cache.flush_all().expect("flush");

    assert!(store.reads.lock().expect("reads lock").iter().all(Option::is_none));
    assert!(cache.is_empty());
    assert!(cache.index_snapshot().is_empty());
}

#[test]
fn huge_ttl_round_trips_through_disk() {
    let dir = TempDir::new().expect("temp dir");
    let clock = Arc::new(ManualClock::default());

    disk_cache(&dir, clock.clone())
        .set("k", "v".to_string(), Duration::from_secs(u64::MAX / 2), [Tag::term(1)])
        .expect("write through");

    let cache = disk_cache(&dir, clock);
    assert_eq!(cache.get("k").as_deref(), Some("v"));
    assert_eq!(cache.tags_for_key("k"), BTreeSet::from([Tag::term(1)]));
}
