//! Consumption plan generation.
//!
//! Merges a batch of events into one set of invalidation actions.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use super::events::{CacheEvent, EventKind, THUMBNAIL_META_KEY};
use super::keys::Tag;

/// Invalidations to run for a batch of events.
///
/// Terms and tags are kept in ordered sets, so the actions, including every
/// ancestor lookup, are the same whatever order the events arrived in.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConsumptionPlan {
    /// Drop every entry; makes the other actions redundant.
    pub flush_all: bool,
    /// Terms to invalidate together with their ancestors.
    pub cascade_terms: BTreeSet<u64>,
    /// Tags to invalidate without cascading.
    pub invalidate_tags: BTreeSet<Tag>,
    /// Events ignored because they cannot affect cached data.
    pub skipped: usize,
}

impl fmt::Display for ConsumptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConsumptionPlan {{ flush_all: {}, cascade_terms: {}, invalidate_tags: {}, skipped: {} }}",
            self.flush_all,
            self.cascade_terms.len(),
            self.invalidate_tags.len(),
            self.skipped,
        )
    }
}

impl ConsumptionPlan {
    pub fn from_events(events: Vec<CacheEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();

        for event in events.into_iter().filter(|e| seen_ids.insert(e.id)) {
            match event.kind {
                EventKind::TermSaved { term_id } | EventKind::TermDeleted { term_id } => {
                    plan.cascade_terms.insert(term_id);
                }
                EventKind::TermMetaUpdated { term_id, meta_key } => {
                    if meta_key == THUMBNAIL_META_KEY {
                        plan.cascade_terms.insert(term_id);
                    } else {
                        plan.skipped += 1;
                    }
                }
                EventKind::ProductUpdated {
                    product_id,
                    term_ids,
                } => {
                    plan.cascade_terms.extend(term_ids);
                    plan.invalidate_tags.insert(Tag::product(product_id));
                }
                EventKind::GridSaved { slug } | EventKind::GridDeleted { slug } => {
                    plan.invalidate_tags.insert(Tag::grid(&slug));
                }
                EventKind::SettingsUpdated => plan.flush_all = true,
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        !self.flush_all && self.cascade_terms.is_empty() && self.invalidate_tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, epoch: u64) -> CacheEvent {
        CacheEvent::new(kind, epoch)
    }

    #[test]
    fn term_events_cascade() {
        let plan = ConsumptionPlan::from_events(vec![
            event(EventKind::TermSaved { term_id: 5 }, 0),
            event(EventKind::TermDeleted { term_id: 9 }, 1),
            event(EventKind::TermSaved { term_id: 5 }, 2),
        ]);
        assert_eq!(plan.cascade_terms, BTreeSet::from([5, 9]));
        assert!(plan.invalidate_tags.is_empty());
    }

    #[test]
    fn only_thumbnail_meta_matters() {
        let plan = ConsumptionPlan::from_events(vec![
            event(
                EventKind::TermMetaUpdated {
                    term_id: 5,
                    meta_key: "thumbnail_id".to_string(),
                },
                0,
            ),
            event(
                EventKind::TermMetaUpdated {
                    term_id: 6,
                    meta_key: "order".to_string(),
                },
                1,
            ),
        ]);
        assert_eq!(plan.cascade_terms, BTreeSet::from([5]));
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn product_update_touches_terms_and_product() {
        let plan = ConsumptionPlan::from_events(vec![event(
            EventKind::ProductUpdated {
                product_id: 12,
                term_ids: vec![3, 4],
            },
            0,
        )]);
        assert_eq!(plan.cascade_terms, BTreeSet::from([3, 4]));
        assert_eq!(plan.invalidate_tags, BTreeSet::from([Tag::product(12)]));
    }

    #[test]
    fn grid_events_invalidate_grid_tag() {
        let plan = ConsumptionPlan::from_events(vec![
            event(
                EventKind::GridSaved {
                    slug: "home".to_string(),
                },
                0,
            ),
            event(
                EventKind::GridDeleted {
                    slug: "sale".to_string(),
                },
                1,
            ),
        ]);
        assert_eq!(
            plan.invalidate_tags,
            BTreeSet::from([Tag::grid("home"), Tag::grid("sale")])
        );
    }

    #[test]
    fn event_order_does_not_change_plan() {
        let kinds = [
            EventKind::TermSaved { term_id: 2 },
            EventKind::GridSaved {
                slug: "home".to_string(),
            },
            EventKind::TermSaved { term_id: 1 },
        ];
        let forward = ConsumptionPlan::from_events(
            kinds.iter().cloned().enumerate().map(|(i, k)| event(k, i as u64)).collect(),
        );
        let backward = ConsumptionPlan::from_events(
            kinds
                .iter()
                .rev()
                .cloned()
                .enumerate()
                .map(|(i, k)| event(k, i as u64))
                .collect(),
        );
        assert_eq!(forward, backward);
    }

    #[test]
    fn duplicate_event_ids_are_merged() {
        let original = event(EventKind::TermSaved { term_id: 1 }, 0);
        let plan = ConsumptionPlan::from_events(vec![original.clone(), original]);
        assert_eq!(plan.cascade_terms.len(), 1);
    }

    #[test]
    fn settings_update_flushes() {
        let plan = ConsumptionPlan::from_events(vec![event(EventKind::SettingsUpdated, 0)]);
        assert!(plan.flush_all);
        assert!(!plan.is_empty());
        assert!(ConsumptionPlan::default().is_empty());
    }
}
