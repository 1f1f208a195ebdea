//! Bidirectional tag index.
//!
//! Tracks tag → keys and key → tags so that both tag invalidation and entry
//! removal stay cheap. The index has no lock of its own; the memory store
//! mutates it under the same guard as its entries.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::keys::Tag;

#[derive(Debug, Default)]
pub struct TagIndex {
    tag_to_keys: HashMap<Tag, HashSet<String>>,
    key_to_tags: HashMap<String, BTreeSet<Tag>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `key` with exactly `tags`, dropping any previous associations.
    pub fn register(&mut self, key: &str, tags: BTreeSet<Tag>) {
        self.unregister(key);
        if tags.is_empty() {
            return;
        }

        for tag in &tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_to_tags.insert(key.to_string(), tags);
    }

    /// Remove every association of `key`, pruning tags left without keys.
    pub fn unregister(&mut self, key: &str) -> BTreeSet<Tag> {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return BTreeSet::new();
        };

        for tag in &tags {
            if let Some(keys) = self.tag_to_keys.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(tag);
                }
            }
        }
        tags
    }

    /// Detach a tag and return the keys it covered.
    ///
    /// The keys keep their other tags; callers remove the entries themselves
    /// and then `unregister` each key.
    pub fn take_tag(&mut self, tag: &Tag) -> HashSet<String> {
        self.tag_to_keys.remove(tag).unwrap_or_default()
    }

    pub fn keys_for_tag(&self, tag: &Tag) -> HashSet<String> {
        self.tag_to_keys.get(tag).cloned().unwrap_or_default()
    }

    pub fn tags_for_key(&self, key: &str) -> BTreeSet<Tag> {
        self.key_to_tags.get(key).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }

    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tag_to_keys.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> BTreeSet<Tag> {
        names.iter().map(|name| Tag::from(*name)).collect()
    }

    #[test]
    fn register_and_lookup() {
        let mut index = TagIndex::new();
        index.register("grid_a", tags(&["cat_5", "cat_9"]));

        assert!(index.keys_for_tag(&Tag::term(5)).contains("grid_a"));
        assert!(index.keys_for_tag(&Tag::term(9)).contains("grid_a"));
        assert_eq!(index.tags_for_key("grid_a"), tags(&["cat_5", "cat_9"]));
    }

    #[test]
    fn reregister_replaces_old_tags() {
        let mut index = TagIndex::new();
        index.register("grid_a", tags(&["cat_5", "cat_9"]));
        index.register("grid_a", tags(&["cat_9", "cat_11"]));

        assert!(index.keys_for_tag(&Tag::term(5)).is_empty());
        assert!(index.keys_for_tag(&Tag::term(11)).contains("grid_a"));
        assert_eq!(index.tag_count(), 2);
    }

    #[test]
    fn unregister_prunes_empty_tags() {
        let mut index = TagIndex::new();
        index.register("grid_a", tags(&["cat_5"]));
        index.register("grid_b", tags(&["cat_5", "cat_6"]));

        index.unregister("grid_b");
        assert_eq!(index.tag_count(), 1);
        assert_eq!(index.key_count(), 1);

        index.unregister("grid_a");
        assert_eq!(index.tag_count(), 0);
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn take_tag_returns_covered_keys() {
        let mut index = TagIndex::new();
        index.register("grid_a", tags(&["cat_5"]));
        index.register("grid_b", tags(&["cat_5", "cat_6"]));

        let keys = index.take_tag(&Tag::term(5));
        assert_eq!(keys.len(), 2);
        assert!(index.keys_for_tag(&Tag::term(5)).is_empty());
        assert!(index.keys_for_tag(&Tag::term(6)).contains("grid_b"));
    }

    #[test]
    fn untagged_keys_are_not_tracked() {
        let mut index = TagIndex::new();
        index.register("plain", BTreeSet::new());
        assert_eq!(index.key_count(), 0);
        assert!(index.unregister("plain").is_empty());
    }
}
