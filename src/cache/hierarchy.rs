//! Ancestor lookup for cascading invalidation.
//!
//! The cache never owns hierarchy data. Callers hand it a resolver that
//! knows how tags relate, typically backed by a taxonomy.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::keys::Tag;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::hierarchy";

/// Returns the ancestors of a tag, nearest first.
pub trait AncestorResolver: Send + Sync {
    fn ancestors(&self, tag: &Tag) -> Vec<Tag>;
}

impl<F> AncestorResolver for F
where
    F: Fn(&Tag) -> Vec<Tag> + Send + Sync,
{
    fn ancestors(&self, tag: &Tag) -> Vec<Tag> {
        self(tag)
    }
}

/// Resolver for trees without any hierarchy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAncestors;

impl AncestorResolver for NoAncestors {
    fn ancestors(&self, _tag: &Tag) -> Vec<Tag> {
        Vec::new()
    }
}

/// Term tree stored as child → parent links.
#[derive(Debug, Default)]
pub struct TermHierarchy {
    parents: RwLock<HashMap<u64, u64>>,
}

impl TermHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_links<I>(links: I) -> Self
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        Self {
            parents: RwLock::new(links.into_iter().collect()),
        }
    }

    pub fn set_parent(&self, term_id: u64, parent_id: u64) {
        rw_write(&self.parents, SOURCE, "set_parent").insert(term_id, parent_id);
    }

    pub fn remove(&self, term_id: u64) {
        rw_write(&self.parents, SOURCE, "remove").remove(&term_id);
    }

    /// Ancestor term ids, nearest first. A cycle ends the walk.
    pub fn ancestor_ids(&self, term_id: u64) -> Vec<u64> {
        let parents = rw_read(&self.parents, SOURCE, "ancestor_ids");
        let mut seen = HashSet::from([term_id]);
        let mut chain = Vec::new();
        let mut current = term_id;

        while let Some(&parent) = parents.get(&current) {
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }
}

impl AncestorResolver for TermHierarchy {
    fn ancestors(&self, tag: &Tag) -> Vec<Tag> {
        match tag.term_id() {
            Some(term_id) => self
                .ancestor_ids(term_id)
                .into_iter()
                .map(Tag::term)
                .collect(),
            None => Vec::new(),
        }
    }
}
