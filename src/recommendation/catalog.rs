//! Item Metadata Index
//!
//! Turns raw catalog rows (category, sub-type, title) into weighted labels.
//! Category segments weigh 1.0, sub-type segments 0.8, and the first keyword
//! rule whose keyword appears in the title contributes its own labels.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

use super::interactions::ItemId;
use crate::error::{Error, Result};

/// Label → weight
pub type LabelWeights = BTreeMap<String, f64>;

const CATEGORY_WEIGHT: f64 = 1.0;
const SUB_TYPE_WEIGHT: f64 = 0.8;

/// One catalog row as read from a collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(alias = "id")]
    pub item_id: ItemId,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "video_type")]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Derived labels for one item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemLabels {
    pub labels: LabelWeights,
    /// Label used for category matching
    pub primary: Option<String>,
}

/// A title keyword rule: any keyword hit attaches all of `labels`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keywords: Vec<String>,
    pub labels: LabelWeights,
}

/// Ordered keyword rules; the first matching rule wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordTable {
    #[serde(default, rename = "rule")]
    pub rules: Vec<KeywordRule>,
}

impl Default for KeywordTable {
    fn default() -> Self {
        let rule = |keywords: &[&str], labels: &[(&str, f64)]| KeywordRule {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            labels: labels.iter().map(|(l, w)| (l.to_string(), *w)).collect(),
        };

        Self {
            rules: vec![
                rule(
                    &["python", "pandas", "numpy"],
                    &[("python", 1.0), ("programming", 0.8)],
                ),
                rule(
                    &["二次元", "动漫", "漫展", "cos"],
                    &[("acg", 1.0), ("anime", 0.8)],
                ),
            ],
        }
    }
}

impl KeywordTable {
    /// Parse a table from TOML:
    ///
    /// ```toml
    /// [[rule]]
    /// keywords = ["python", "pandas"]
    /// labels = { python = 1.0, programming = 0.8 }
    /// ```
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let table = Self::from_toml(&text)?;
        info!(path = %path.display(), rules = table.rules.len(), "Loaded keyword table");
        Ok(table)
    }

    /// Labels of the first rule with a keyword contained in `title`
    pub fn match_title(&self, title: &str) -> Option<&LabelWeights> {
        let title = title.to_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|k| !k.is_empty() && title.contains(&k.to_lowercase()))
            })
            .map(|rule| &rule.labels)
    }
}

/// How catalog rows become labels
#[derive(Debug, Clone)]
pub struct LabelPolicy {
    pub delimiter: String,
    pub keywords: KeywordTable,
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self {
            delimiter: "/".to_string(),
            keywords: KeywordTable::default(),
        }
    }
}

impl LabelPolicy {
    pub fn new(delimiter: impl Into<String>, keywords: KeywordTable) -> Self {
        Self {
            delimiter: delimiter.into(),
            keywords,
        }
    }

    fn segments<'a>(&'a self, value: Option<&'a str>) -> impl Iterator<Item = String> + 'a {
        value
            .into_iter()
            .flat_map(|v| v.split(self.delimiter.as_str()))
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }

    pub fn derive(&self, entry: &CatalogEntry) -> ItemLabels {
        let mut labels = LabelWeights::new();
        let mut add = |label: String, weight: f64| {
            let slot = labels.entry(label).or_insert(weight);
            *slot = slot.max(weight);
        };

        let categories: Vec<String> = self.segments(entry.category.as_deref()).collect();
        let sub_types: Vec<String> = self.segments(entry.sub_type.as_deref()).collect();

        for label in &categories {
            add(label.clone(), CATEGORY_WEIGHT);
        }
        for label in &sub_types {
            add(label.clone(), SUB_TYPE_WEIGHT);
        }
        if let Some(rule_labels) = entry
            .title
            .as_deref()
            .and_then(|t| self.keywords.match_title(t))
        {
            for (label, weight) in rule_labels {
                add(label.to_lowercase(), *weight);
            }
        }

        let primary = categories
            .first()
            .or(sub_types.first())
            .cloned()
            .or_else(|| {
                labels
                    .iter()
                    .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(a.0)))
                    .map(|(label, _)| label.clone())
            });

        ItemLabels { labels, primary }
    }
}

/// Item → labels lookup, preloaded before any scoring
#[derive(Debug, Clone, Default)]
pub struct ItemMetadata {
    items: HashMap<ItemId, ItemLabels>,
}

impl ItemMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive labels for every entry; later entries for the same item replace earlier ones
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = &'a CatalogEntry>,
        policy: &LabelPolicy,
    ) -> Self {
        let mut metadata = Self::new();
        for entry in entries {
            metadata.insert(entry.item_id.clone(), policy.derive(entry));
        }
        debug!(items = metadata.len(), "Built item metadata index");
        metadata
    }

    pub fn insert(&mut self, item_id: ItemId, labels: ItemLabels) {
        self.items.insert(item_id, labels);
    }

    /// Labels of an item, empty when the item is unknown
    pub fn labels_for(&self, item_id: &str) -> &LabelWeights {
        static EMPTY: LabelWeights = BTreeMap::new();
        self.items
            .get(item_id)
            .map(|item| &item.labels)
            .unwrap_or(&EMPTY)
    }

    pub fn primary_label(&self, item_id: &str) -> Option<&str> {
        self.items.get(item_id).and_then(|item| item.primary.as_deref())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
