//! Keys and tags for catalog data.
//!
//! Grids render category terms; each cached grid variant is keyed by its
//! slug and display settings and tagged with the grid and every term shown.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::{KeyBuilder, SettingValue, Tag, TagCache};

const GRID_FIELDS: [&str; 4] = [
    "desktop_columns",
    "mobile_columns",
    "carousel_mobile",
    "image_size",
];
const OUTPUT_FIELDS: [&str; 6] = [
    "desktop_columns",
    "mobile_columns",
    "carousel_mobile",
    "image_size",
    "language",
    "roles",
];

const DEFAULT_DESKTOP_COLUMNS: u32 = 3;
const DEFAULT_MOBILE_COLUMNS: u32 = 2;
const DEFAULT_IMAGE_SIZE: &str = "medium";
const DEFAULT_LANGUAGE: &str = "default";
const GUEST_ROLE: &str = "guest";

/// Display settings of a grid. Unset fields fall back to the defaults only
/// when rendering output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    pub desktop_columns: Option<u32>,
    pub mobile_columns: Option<u32>,
    pub carousel_mobile: bool,
    pub image_size: Option<String>,
}

impl GridSettings {
    /// Only the fields that were set.
    fn explicit(&self) -> Vec<(&'static str, SettingValue)> {
        let mut settings = Vec::new();
        if let Some(columns) = self.desktop_columns {
            settings.push(("desktop_columns", SettingValue::from(columns)));
        }
        if let Some(columns) = self.mobile_columns {
            settings.push(("mobile_columns", SettingValue::from(columns)));
        }
        settings.push(("carousel_mobile", SettingValue::from(self.carousel_mobile)));
        if let Some(size) = &self.image_size {
            settings.push(("image_size", SettingValue::from(size.as_str())));
        }
        settings
    }

    /// Every field, defaults filled in.
    fn resolved(&self) -> Vec<(&'static str, SettingValue)> {
        let carousel = if self.carousel_mobile { "on" } else { "off" };
        vec![
            (
                "desktop_columns",
                SettingValue::from(self.desktop_columns.unwrap_or(DEFAULT_DESKTOP_COLUMNS)),
            ),
            (
                "mobile_columns",
                SettingValue::from(self.mobile_columns.unwrap_or(DEFAULT_MOBILE_COLUMNS)),
            ),
            ("carousel_mobile", SettingValue::from(carousel)),
            (
                "image_size",
                SettingValue::from(self.image_size.as_deref().unwrap_or(DEFAULT_IMAGE_SIZE)),
            ),
        ]
    }
}

/// Request context that changes rendered output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputContext {
    pub language: Option<String>,
    pub roles: Vec<String>,
}

impl OutputContext {
    fn language(&self) -> &str {
        self.language
            .as_deref()
            .filter(|lang| !lang.is_empty())
            .unwrap_or(DEFAULT_LANGUAGE)
    }

    /// Sorted, deduplicated roles; anonymous visitors are `guest`.
    fn roles(&self) -> String {
        let mut roles: Vec<&str> = self
            .roles
            .iter()
            .map(String::as_str)
            .filter(|role| !role.is_empty())
            .collect();
        roles.sort_unstable();
        roles.dedup();
        if roles.is_empty() {
            GUEST_ROLE.to_string()
        } else {
            roles.join(",")
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogKeys {
    grid: KeyBuilder,
    output: KeyBuilder,
    plain: KeyBuilder,
}

impl CatalogKeys {
    pub fn new() -> Self {
        Self {
            grid: KeyBuilder::new(GRID_FIELDS),
            output: KeyBuilder::new(OUTPUT_FIELDS),
            plain: KeyBuilder::new(Vec::<String>::new()),
        }
    }

    /// Builder used for a known key kind.
    pub fn builder(&self, kind: &str) -> Option<&KeyBuilder> {
        match kind {
            "grid" => Some(&self.grid),
            "output" => Some(&self.output),
            "term" | "product" => Some(&self.plain),
            _ => None,
        }
    }

    /// Key for a grid's computed data.
    pub fn grid_key(&self, slug: &str, settings: &GridSettings, version: u64) -> String {
        self.grid.build("grid", slug, &settings.explicit(), version)
    }

    /// Key for a grid's rendered output as seen by one audience.
    pub fn output_key(
        &self,
        slug: &str,
        settings: &GridSettings,
        context: &OutputContext,
        version: u64,
    ) -> String {
        let mut parts = settings.resolved();
        parts.push(("language", SettingValue::from(context.language())));
        parts.push(("roles", SettingValue::from(context.roles())));
        self.output.build("output", slug, &parts, version)
    }

    pub fn term_key(&self, term_id: u64, version: u64) -> String {
        let none: [(&str, SettingValue); 0] = [];
        self.plain.build("term", &term_id.to_string(), &none, version)
    }

    pub fn product_key(&self, product_id: u64, version: u64) -> String {
        let none: [(&str, SettingValue); 0] = [];
        self.plain
            .build("product", &product_id.to_string(), &none, version)
    }
}

impl Default for CatalogKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Tags for a grid entry showing `term_ids`.
pub fn grid_tags<I>(slug: &str, term_ids: I) -> Vec<Tag>
where
    I: IntoIterator<Item = u64>,
{
    std::iter::once(Tag::grid(slug))
        .chain(term_ids.into_iter().map(Tag::term))
        .collect()
}

/// Result of a catalog fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFetch<V> {
    pub key: String,
    pub value: Option<V>,
    /// True when the loader ran.
    pub loaded: bool,
}

/// Grid and output lookups that populate on miss with the configured
/// `grid_ttl` and `output_ttl`.
pub struct CatalogCache<V> {
    cache: Arc<TagCache<V>>,
    keys: CatalogKeys,
}

impl<V> CatalogCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(cache: Arc<TagCache<V>>) -> Self {
        Self {
            cache,
            keys: CatalogKeys::new(),
        }
    }

    pub fn cache(&self) -> &Arc<TagCache<V>> {
        &self.cache
    }

    /// Computed grid data, tagged with the grid and every term it shows.
    pub fn grid<F>(
        &self,
        slug: &str,
        settings: &GridSettings,
        term_ids: &[u64],
        loader: F,
    ) -> CatalogFetch<V>
    where
        F: FnOnce() -> Option<V>,
    {
        let key = self.keys.grid_key(slug, settings, self.cache.version());
        let ttl = self.cache.config().grid_ttl();
        self.fetch(key, ttl, grid_tags(slug, term_ids.iter().copied()), loader)
    }

    /// Rendered output for one audience, invalidated with the same tags as
    /// the grid it renders.
    pub fn output<F>(
        &self,
        slug: &str,
        settings: &GridSettings,
        context: &OutputContext,
        term_ids: &[u64],
        loader: F,
    ) -> CatalogFetch<V>
    where
        F: FnOnce() -> Option<V>,
    {
        let key = self
            .keys
            .output_key(slug, settings, context, self.cache.version());
        let ttl = self.cache.config().output_ttl();
        self.fetch(key, ttl, grid_tags(slug, term_ids.iter().copied()), loader)
    }

    fn fetch<F>(
        &self,
        key: String,
        ttl: Duration,
        tags: Vec<Tag>,
        loader: F,
    ) -> CatalogFetch<V>
    where
        F: FnOnce() -> Option<V>,
    {
        let mut loaded = false;
        let value = self.cache.get_or_insert_with(&key, ttl, tags, || {
            loaded = true;
            loader()
        });
        CatalogFetch { key, value, loaded }
    }
}
