//! Cache key and tag definitions.
//!
//! `KeyBuilder` turns a logical identity plus a settings list into a stable
//! string key. `Tag` names the things an entry depends on.

use std::borrow::Borrow;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters of the digest kept in a key.
const DIGEST_HEX_LEN: usize = 32;

/// Identifier an entry declares a dependency on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Tag for a product category term.
    pub fn term(term_id: u64) -> Self {
        Self(format!("cat_{term_id}"))
    }

    /// Tag for every cached variant of a grid.
    pub fn grid(slug: &str) -> Self {
        Self(format!("grid_{slug}"))
    }

    /// Tag for data derived from a single product.
    pub fn product(product_id: u64) -> Self {
        Self(format!("product_{product_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the term id back out of a `cat_<id>` tag.
    pub fn term_id(&self) -> Option<u64> {
        self.0.strip_prefix("cat_")?.parse().ok()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for Tag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A single setting value feeding key normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl SettingValue {
    /// Empty values (`false`, `0`, `""`) are left out of keys.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bool(value) => !value,
            Self::Int(value) => *value == 0,
            Self::Text(value) => value.is_empty() || value == "0",
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("on"),
            Self::Bool(false) => f.write_str("off"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for SettingValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl FromStr for SettingValue {
    type Err = Infallible;

    /// `true`/`false` and `on`/`off` become booleans, integers stay integers,
    /// anything else is text.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw {
            "true" | "on" => Self::Bool(true),
            "false" | "off" => Self::Bool(false),
            _ => match raw.parse::<i64>() {
                Ok(value) => Self::Int(value),
                Err(_) => Self::Text(raw.to_string()),
            },
        })
    }
}

/// Feed `part` with a length prefix so no two part sequences share a digest.
fn update_framed(hasher: &mut Sha256, part: &str) {
    hasher.update((part.len() as u64).to_be_bytes());
    hasher.update(part.as_bytes());
}

/// Builds deterministic cache keys.
///
/// The field order is fixed at construction, so two settings lists holding
/// the same values in a different order normalize to the same key. Fields
/// outside the order are ignored.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    field_order: Vec<String>,
}

impl KeyBuilder {
    pub fn new<I, S>(field_order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field_order: field_order.into_iter().map(Into::into).collect(),
        }
    }

    pub fn field_order(&self) -> &[String] {
        &self.field_order
    }

    /// Normalized `name=value` parts in field order, skipping empty values.
    pub fn normalize<N>(&self, settings: &[(N, SettingValue)]) -> Vec<String>
    where
        N: AsRef<str>,
    {
        self.field_order
            .iter()
            .filter_map(|field| {
                settings
                    .iter()
                    .find(|(name, _)| name.as_ref() == field)
                    .filter(|(_, value)| !value.is_empty())
                    .map(|(_, value)| format!("{field}={value}"))
            })
            .collect()
    }

    /// Build `<kind>_<digest>_v<version>`.
    pub fn build<N>(
        &self,
        kind: &str,
        identity: &str,
        settings: &[(N, SettingValue)],
        version: u64,
    ) -> String
    where
        N: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        update_framed(&mut hasher, identity);
        for part in self.normalize(settings) {
            update_framed(&mut hasher, &part);
        }
        let digest = hex::encode(hasher.finalize());

        format!("{kind}_{}_v{version}", &digest[..DIGEST_HEX_LEN])
    }
}
