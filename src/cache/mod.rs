//! Tag-indexed invalidation cache.
//!
//! Entries are stored with an expiry and a set of tags. Invalidating a tag
//! removes every entry carrying it; term tags can cascade to ancestor terms
//! through an [`AncestorResolver`]. An optional [`BackingStore`] serves as a
//! second tier that memory misses fall back to.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `tagcache.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! version = 1
//! grid_ttl_seconds = 1800
//! # ... see config.rs for all options
//! ```

mod backing;
mod clock;
mod config;
mod consumer;
mod events;
mod hierarchy;
mod index;
mod keys;
mod lock;
mod planner;
mod service;
mod store;
mod trigger;

pub use backing::{BackingStore, FsBackingStore, PersistedRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use consumer::{CacheConsumer, ConsumeSummary};
pub use events::{CacheEvent, Epoch, EventKind, EventQueue, THUMBNAIL_META_KEY};
pub use hierarchy::{AncestorResolver, NoAncestors, TermHierarchy};
pub use index::TagIndex;
pub use keys::{KeyBuilder, SettingValue, Tag};
pub use planner::ConsumptionPlan;
pub use service::TagCache;
pub use store::{Entry, Lookup, MemoryStore, TagSweep};
pub use trigger::CacheTrigger;
