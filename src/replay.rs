//! Scripted cache sessions.
//!
//! A script lists cache operations against a manually driven clock; each
//! step produces one JSON result line. Scripts make invalidation behavior
//! reproducible from the command line.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::cache::{
    BackingStore, CacheConfig, CacheConsumer, EventKind, EventQueue, ManualClock, Tag, TagCache,
    TermHierarchy,
};
use crate::catalog::{CatalogCache, CatalogFetch, GridSettings, OutputContext};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read or write replay data: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse replay script: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("step {step}: `{tag}` is not a term tag")]
    UnknownTag { step: usize, tag: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Script {
    /// Term tree as child → parent links.
    pub hierarchy: HashMap<u64, u64>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Set {
        key: String,
        value: Value,
        /// Falls back to the configured default TTL.
        #[serde(default)]
        ttl_seconds: Option<u64>,
        #[serde(default)]
        tags: Vec<Tag>,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
    Flush,
    InvalidateTag {
        tag: Tag,
    },
    InvalidateAncestors {
        tag: Tag,
    },
    InvalidatePrefix {
        prefix: String,
    },
    Advance {
        seconds: u64,
    },
    Publish {
        event: EventKind,
    },
    Consume,
    BumpVersion,
    /// Fetch a grid, storing `value` on a miss.
    Grid {
        slug: String,
        #[serde(default)]
        settings: GridSettings,
        #[serde(default)]
        term_ids: Vec<u64>,
        value: Value,
    },
    /// Fetch rendered output, storing `value` on a miss.
    Output {
        slug: String,
        #[serde(default)]
        settings: GridSettings,
        #[serde(default)]
        context: OutputContext,
        #[serde(default)]
        term_ids: Vec<u64>,
        value: Value,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Get { .. } => "get",
            Self::Delete { .. } => "delete",
            Self::Flush => "flush",
            Self::InvalidateTag { .. } => "invalidate_tag",
            Self::InvalidateAncestors { .. } => "invalidate_ancestors",
            Self::InvalidatePrefix { .. } => "invalidate_prefix",
            Self::Advance { .. } => "advance",
            Self::Publish { .. } => "publish",
            Self::Consume => "consume",
            Self::BumpVersion => "bump_version",
            Self::Grid { .. } => "grid",
            Self::Output { .. } => "output",
        }
    }
}

pub fn parse_script(raw: &str) -> Result<Script, ReplayError> {
    Ok(serde_json::from_str(raw)?)
}

pub fn load_script(path: &Path) -> Result<Script, ReplayError> {
    let raw = std::fs::read_to_string(path)?;
    parse_script(&raw)
}

/// A cache, its event pipeline and a clock that only moves on `advance`.
pub struct Session {
    catalog: CatalogCache<Value>,
    clock: Arc<ManualClock>,
    hierarchy: Arc<TermHierarchy>,
    consumer: Arc<CacheConsumer<Value>>,
}

impl Session {
    pub fn new(
        config: CacheConfig,
        hierarchy: &HashMap<u64, u64>,
        backing: Option<Arc<dyn BackingStore>>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
        let mut cache = TagCache::new(config.clone()).with_clock(clock.clone());
        if let Some(backing) = backing {
            cache = cache.with_backing(backing);
        }
        let cache = Arc::new(cache);
        let hierarchy = Arc::new(TermHierarchy::from_links(
            hierarchy.iter().map(|(child, parent)| (*child, *parent)),
        ));
        let queue = Arc::new(EventQueue::new_with_limit(
            config.event_queue_limit_non_zero(),
        ));
        let consumer = Arc::new(CacheConsumer::new(
            config,
            cache.clone(),
            queue,
            hierarchy.clone(),
        ));

        Self {
            catalog: CatalogCache::new(cache),
            clock,
            hierarchy,
            consumer,
        }
    }

    pub fn cache(&self) -> &Arc<TagCache<Value>> {
        self.catalog.cache()
    }

    /// Consumer wired to this session's cache, queue and term hierarchy.
    pub fn consumer(&self) -> &Arc<CacheConsumer<Value>> {
        &self.consumer
    }

    /// Run every step, writing one JSON line per step to `out`.
    pub fn run<W: Write>(&self, steps: &[Step], out: &mut W) -> Result<Vec<Value>, ReplayError> {
        let mut results = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let result = self.run_step(index, step)?;
            serde_json::to_writer(&mut *out, &result)?;
            out.write_all(b"\n")?;
            results.push(result);
        }
        info!(steps = steps.len(), entries = self.cache().len(), "Replay finished");
        Ok(results)
    }

    pub fn run_step(&self, index: usize, step: &Step) -> Result<Value, ReplayError> {
        debug!(step = index, op = step.name(), "Replaying step");

        let result = match step {
            Step::Set {
                key,
                value,
                ttl_seconds,
                tags,
            } => {
                let ttl = ttl_seconds
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.cache().config().default_ttl());
                match self.cache().set(key, value.clone(), ttl, tags.iter().cloned()) {
                    Ok(()) => json!({ "ok": true }),
                    Err(err) => json!({ "error": err.to_string(), "ok": false }),
                }
            }
            Step::Get { key } => {
                let value = self.cache().get(key);
                json!({ "hit": value.is_some(), "value": value })
            }
            Step::Delete { key } => match self.cache().delete(key) {
                Ok(()) => json!({ "ok": true }),
                Err(err) => json!({ "error": err.to_string(), "ok": false }),
            },
            Step::Flush => match self.cache().flush_all() {
                Ok(()) => json!({ "ok": true }),
                Err(err) => json!({ "error": err.to_string(), "ok": false }),
            },
            Step::InvalidateTag { tag } => {
                json!({ "removed": self.cache().invalidate_tag(tag) })
            }
            Step::InvalidateAncestors { tag } => {
                if tag.term_id().is_none() {
                    return Err(ReplayError::UnknownTag {
                        step: index,
                        tag: tag.to_string(),
                    });
                }
                let removed = self
                    .cache()
                    .invalidate_with_ancestors(tag, self.hierarchy.as_ref());
                json!({ "removed": removed })
            }
            Step::InvalidatePrefix { prefix } => {
                json!({ "removed": self.cache().invalidate_prefix(prefix) })
            }
            Step::Advance { seconds } => {
                self.clock.advance(Duration::from_secs(*seconds));
                json!({ "advanced_seconds": seconds })
            }
            Step::Publish { event } => {
                self.consumer.queue().publish(event.clone());
                json!({ "queued": self.consumer.queue().len() })
            }
            Step::Consume => json!({ "batches": self.consumer.consume_all() }),
            Step::BumpVersion => json!({ "version": self.cache().bump_version() }),
            Step::Grid {
                slug,
                settings,
                term_ids,
                value,
            } => fetch_result(
                self.catalog
                    .grid(slug, settings, term_ids, || Some(value.clone())),
            ),
            Step::Output {
                slug,
                settings,
                context,
                term_ids,
                value,
            } => fetch_result(self.catalog.output(
                slug,
                settings,
                context,
                term_ids,
                || Some(value.clone()),
            )),
        };

        Ok(json!({
            "entries": self.cache().len(),
            "op": step.name(),
            "result": result,
            "step": index,
        }))
    }
}

fn fetch_result(fetch: CatalogFetch<Value>) -> Value {
    json!({ "key": fetch.key, "loaded": fetch.loaded, "value": fetch.value })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"{
        "hierarchy": { "3": 2, "2": 1 },
        "steps": [
            { "op": "set", "key": "grid_abc", "value": {"html": "<ul/>"}, "ttl_seconds": 1800,
              "tags": ["cat_1", "cat_2"] },
            { "op": "set", "key": "leaf", "value": 1, "tags": ["cat_3"] },
            { "op": "get", "key": "grid_abc" },
            { "op": "invalidate_tag", "tag": "cat_1" },
            { "op": "get", "key": "grid_abc" },
            { "op": "invalidate_ancestors", "tag": "cat_3" },
            { "op": "bump_version" }
        ]
    }"#;

    fn session(script: &Script) -> Session {
        Session::new(CacheConfig::default(), &script.hierarchy, None)
    }

    #[test]
    fn script_runs_and_reports_each_step() {
        let script = parse_script(SCRIPT).expect("valid script");
        let session = session(&script);
        let mut out = Vec::new();

        let results = session.run(&script.steps, &mut out).expect("replay");

        assert_eq!(results.len(), 7);
        assert_eq!(results[2]["result"]["hit"], json!(true));
        assert_eq!(results[2]["result"]["value"], json!({"html": "<ul/>"}));
        assert_eq!(results[3]["result"]["removed"], json!(1));
        assert_eq!(results[4]["result"]["hit"], json!(false));
        assert_eq!(results[5]["result"]["removed"], json!(1));
        assert_eq!(results[6]["result"]["version"], json!(2));

        let text = String::from_utf8(out).expect("utf8 output");
        assert_eq!(text.lines().count(), 7);
    }

    #[test]
    fn advance_expires_entries() {
        let script = parse_script(
            r#"{ "steps": [
                { "op": "set", "key": "k", "value": "v", "ttl_seconds": 10 },
                { "op": "advance", "seconds": 10 },
                { "op": "get", "key": "k" }
            ] }"#,
        )
        .expect("valid script");
        let results = session(&script)
            .run(&script.steps, &mut std::io::sink())
            .expect("replay");
        assert_eq!(results[2]["result"]["hit"], json!(false));
    }

    #[test]
    fn published_events_apply_on_consume() {
        let script = parse_script(
            r#"{ "hierarchy": { "5": 4 }, "steps": [
                { "op": "set", "key": "parent", "value": 1, "tags": ["cat_4"] },
                { "op": "publish", "event": { "kind": "term_saved", "term_id": 5 } },
                { "op": "get", "key": "parent" },
                { "op": "consume" },
                { "op": "get", "key": "parent" }
            ] }"#,
        )
        .expect("valid script");
        let results = session(&script)
            .run(&script.steps, &mut std::io::sink())
            .expect("replay");

        assert_eq!(results[1]["result"]["queued"], json!(1));
        assert_eq!(results[2]["result"]["hit"], json!(true));
        assert_eq!(results[3]["result"]["batches"][0]["removed"], json!(1));
        assert_eq!(results[4]["result"]["hit"], json!(false));
    }

    #[test]
    fn ancestors_of_non_term_tag_is_an_error() {
        let script = parse_script(
            r#"{ "steps": [ { "op": "invalidate_ancestors", "tag": "grid_home" } ] }"#,
        )
        .expect("valid script");
        let err = session(&script)
            .run(&script.steps, &mut std::io::sink())
            .expect_err("non-term tag");
        assert!(matches!(err, ReplayError::UnknownTag { step: 0, .. }));
    }

    #[test]
    fn catalog_steps_populate_and_invalidate_by_term() {
        let script = parse_script(
            r#"{ "hierarchy": { "7": 3 }, "steps": [
                { "op": "grid", "slug": "home", "term_ids": [3], "value": ["a"] },
                { "op": "grid", "slug": "home", "term_ids": [3], "value": ["b"] },
                { "op": "output", "slug": "home", "term_ids": [3], "value": "<ul/>",
                  "context": { "roles": ["editor"] } },
                { "op": "publish", "event": { "kind": "term_saved", "term_id": 7 } },
                { "op": "consume" },
                { "op": "grid", "slug": "home", "term_ids": [3], "value": ["c"] }
            ] }"#,
        )
        .expect("valid script");
        let results = session(&script)
            .run(&script.steps, &mut std::io::sink())
            .expect("replay");

        assert_eq!(results[0]["result"]["loaded"], json!(true));
        assert_eq!(results[1]["result"]["loaded"], json!(false));
        assert_eq!(results[1]["result"]["value"], json!(["a"]));
        assert_eq!(results[1]["result"]["key"], results[0]["result"]["key"]);
        assert_eq!(results[4]["result"]["batches"][0]["removed"], json!(2));
        assert_eq!(results[5]["result"]["value"], json!(["c"]));
    }

    #[test]
    fn huge_ttl_and_advance_do_not_overflow() {
        let script = parse_script(
            r#"{ "steps": [
                { "op": "set", "key": "k", "value": 1, "ttl_seconds": 9223372036854775807 },
                { "op": "advance", "seconds": 18446744073709551615 },
                { "op": "get", "key": "k" }
            ] }"#,
        )
        .expect("valid script");
        let results = session(&script)
            .run(&script.steps, &mut std::io::sink())
            .expect("replay");
        assert_eq!(results[0]["result"]["ok"], json!(true));
        assert_eq!(results[2]["result"]["hit"], json!(false));
    }

    #[tokio::test]
    async fn seeded_session_consumer_drains_events_on_interval() {
        let seed = parse_script(
            r#"{ "hierarchy": { "2": 1 }, "steps": [
                { "op": "set", "key": "root", "value": 1, "tags": ["cat_1"] },
                { "op": "set", "key": "other", "value": 2, "tags": ["cat_9"] }
            ] }"#,
        )
        .expect("valid seed");
        let session = session(&seed);
        session.run(&seed.steps, &mut std::io::sink()).expect("seed");

        let consumer = session.consumer().clone();
        consumer
            .queue()
            .publish(EventKind::TermSaved { term_id: 2 });
        let handle = consumer.clone().spawn_interval(Duration::from_millis(5));
        for _ in 0..200 {
            if !session.cache().contains("root") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();

        assert!(consumer.queue().is_empty());
        assert!(!session.cache().contains("root"));
        assert!(session.cache().contains("other"));
    }

    #[test]
    fn malformed_script_is_a_parse_error() {
        assert!(matches!(
            parse_script(r#"{ "steps": [ { "op": "teleport" } ] }"#),
            Err(ReplayError::Parse(_))
        ));
    }
}
