//! Tag-indexed invalidation cache.
//!
//! Entries are keyed by deterministic strings and declare the tags they
//! depend on. Invalidation can target a single key, a tag, a tag and all of
//! its ancestors, a key prefix or a value predicate.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod replay;
pub mod telemetry;
