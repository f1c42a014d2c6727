//! Interaction Store
//!
//! Holds the sparse user → {item: weight} matrix split into a training set and
//! a held-out set. Every record is assigned independently: training with
//! probability `split_ratio`, held-out otherwise.

use once_cell::sync::OnceCell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub type UserId = String;
pub type ItemId = String;

/// Inverted index: item → users who interacted with it in the training set
pub type ItemIndex = HashMap<ItemId, BTreeSet<UserId>>;

/// A single (user, item, weight) signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub weight: f64,
}

/// Why an input row was rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("expected 3 fields, found {found}")]
    FieldCount { found: usize },
    #[error("empty user id")]
    EmptyUser,
    #[error("empty item id")]
    EmptyItem,
    #[error("invalid weight '{value}'")]
    InvalidWeight { value: String },
    #[error("unreadable row: {message}")]
    Unreadable { message: String },
}

impl RecordError {
    /// Short label for counters
    pub fn kind(&self) -> &'static str {
        match self {
            RecordError::FieldCount { .. } => "field_count",
            RecordError::EmptyUser => "empty_user",
            RecordError::EmptyItem => "empty_item",
            RecordError::InvalidWeight { .. } => "invalid_weight",
            RecordError::Unreadable { .. } => "unreadable",
        }
    }
}

impl InteractionRecord {
    pub fn new(user_id: impl Into<UserId>, item_id: impl Into<ItemId>, weight: f64) -> Self {
        Self {
            user_id: user_id.into(),
            item_id: item_id.into(),
            weight,
        }
    }

    /// Build a record, trimming ids. Weights must be finite and greater than zero.
    pub fn checked(user: &str, item: &str, weight: f64) -> std::result::Result<Self, RecordError> {
        let user = user.trim();
        let item = item.trim();
        if user.is_empty() {
            return Err(RecordError::EmptyUser);
        }
        if item.is_empty() {
            return Err(RecordError::EmptyItem);
        }
        if !(weight.is_finite() && weight > 0.0) {
            return Err(RecordError::InvalidWeight {
                value: weight.to_string(),
            });
        }
        Ok(Self::new(user, item, weight))
    }

    /// Build a record from raw text fields
    pub fn from_fields(
        user: &str,
        item: &str,
        weight: &str,
    ) -> std::result::Result<Self, RecordError> {
        let raw = weight.trim();
        let parsed = raw.parse::<f64>().unwrap_or(f64::NAN);
        Self::checked(user, item, parsed).map_err(|err| match err {
            RecordError::InvalidWeight { .. } => RecordError::InvalidWeight {
                value: raw.to_string(),
            },
            other => other,
        })
    }

    /// Build a record from one `user,item,weight` CSV row
    pub fn from_csv_record(record: &csv::StringRecord) -> std::result::Result<Self, RecordError> {
        match (record.len(), record.get(0), record.get(1), record.get(2)) {
            (3, Some(user), Some(item), Some(weight)) => Self::from_fields(user, item, weight),
            (found, ..) => Err(RecordError::FieldCount { found }),
        }
    }
}

/// One side of the split: user → item → weight
#[derive(Debug, Clone, Default)]
pub struct RatingSet {
    ratings: HashMap<UserId, BTreeMap<ItemId, f64>>,
}

impl RatingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; a repeated (user, item) pair keeps the latest weight
    pub fn insert(&mut self, record: InteractionRecord) {
        self.ratings
            .entry(record.user_id)
            .or_default()
            .insert(record.item_id, record.weight);
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.ratings.len()
    }

    /// Number of distinct (user, item) pairs
    pub fn pair_count(&self) -> usize {
        self.ratings.values().map(BTreeMap::len).sum()
    }

    pub fn contains_user(&self, user: &str) -> bool {
        self.ratings.contains_key(user)
    }

    /// Items of a user with their weights, in item order
    pub fn items_of(&self, user: &str) -> Option<&BTreeMap<ItemId, f64>> {
        self.ratings.get(user)
    }

    pub fn weight(&self, user: &str, item: &str) -> Option<f64> {
        self.ratings.get(user).and_then(|items| items.get(item)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &BTreeMap<ItemId, f64>)> {
        self.ratings.iter()
    }

    /// All users, sorted
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.ratings.keys().cloned().collect();
        users.sort();
        users
    }

    /// Distinct items referenced by any user
    pub fn items(&self) -> BTreeSet<ItemId> {
        self.ratings
            .values()
            .flat_map(|items| items.keys().cloned())
            .collect()
    }
}

impl FromIterator<InteractionRecord> for RatingSet {
    fn from_iter<I: IntoIterator<Item = InteractionRecord>>(iter: I) -> Self {
        let mut set = RatingSet::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

/// Counters from one load
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadStats {
    pub training_records: usize,
    pub holdout_records: usize,
    pub skipped: usize,
    pub skipped_by_kind: BTreeMap<&'static str, usize>,
}

/// How records are split between training and held-out
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitConfig {
    /// Probability that a record lands in the training set
    pub ratio: f64,
    /// Fixed seed for reproducible splits; entropy when `None`
    pub seed: Option<u64>,
}

impl SplitConfig {
    pub fn new(ratio: f64) -> Self {
        Self { ratio, seed: None }
    }

    pub fn seeded(ratio: f64, seed: u64) -> Self {
        Self {
            ratio,
            seed: Some(seed),
        }
    }

    /// Everything goes to training
    pub fn training_only() -> Self {
        Self::new(1.0)
    }
}

/// Training/held-out interaction matrix for one run
#[derive(Debug, Default)]
pub struct InteractionStore {
    training: RatingSet,
    holdout: RatingSet,
    stats: LoadStats,
    item_index: OnceCell<ItemIndex>,
}

impl InteractionStore {
    /// Split a stream of parsed rows into training and held-out sets.
    ///
    /// Rejected rows are counted in [`LoadStats`] and never abort the load.
    pub fn load<I>(records: I, split: SplitConfig) -> Result<Self>
    where
        I: IntoIterator<Item = std::result::Result<InteractionRecord, RecordError>>,
    {
        if !(0.0..=1.0).contains(&split.ratio) {
            return Err(Error::InvalidConfig {
                key: "REC_SPLIT_RATIO",
                message: format!("split ratio {} is outside [0, 1]", split.ratio).into(),
            });
        }

        let mut rng = match split.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut store = Self::default();
        for record in records {
            match record {
                Ok(record) => {
                    if rng.gen::<f64>() < split.ratio {
                        store.stats.training_records += 1;
                        store.training.insert(record);
                    } else {
                        store.stats.holdout_records += 1;
                        store.holdout.insert(record);
                    }
                }
                Err(err) => {
                    debug!("Skipping malformed interaction: {}", err);
                    store.stats.skipped += 1;
                    *store.stats.skipped_by_kind.entry(err.kind()).or_insert(0) += 1;
                    metrics::counter!("vidrec_records_skipped_total", "kind" => err.kind())
                        .increment(1);
                }
            }
        }

        info!(
            training_records = store.stats.training_records,
            training_users = store.training.user_count(),
            holdout_records = store.stats.holdout_records,
            holdout_users = store.holdout.user_count(),
            skipped = store.stats.skipped,
            "Interaction store loaded"
        );

        Ok(store)
    }

    /// Build a store directly from a training set (no held-out data)
    pub fn from_training(training: RatingSet) -> Self {
        Self::from_split(training, RatingSet::new())
    }

    /// Build a store from an already split pair of rating sets
    pub fn from_split(training: RatingSet, holdout: RatingSet) -> Self {
        Self {
            stats: LoadStats {
                training_records: training.pair_count(),
                holdout_records: holdout.pair_count(),
                ..LoadStats::default()
            },
            training,
            holdout,
            ..Self::default()
        }
    }

    pub fn training(&self) -> &RatingSet {
        &self.training
    }

    pub fn holdout(&self) -> &RatingSet {
        &self.holdout
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    /// Inverted item → users index over the training set, built on first use
    pub fn item_index(&self) -> &ItemIndex {
        self.item_index.get_or_init(|| {
            let mut index: ItemIndex = HashMap::new();
            for (user, items) in self.training.iter() {
                for item in items.keys() {
                    index.entry(item.clone()).or_default().insert(user.clone());
                }
            }
            debug!(items = index.len(), "Built inverted item index");
            index
        })
    }

    /// Items ranked by how many training users interacted with them,
    /// most popular first, ties by item id
    pub fn popularity(&self) -> Vec<(ItemId, usize)> {
        let mut ranked: Vec<(ItemId, usize)> = self
            .item_index()
            .iter()
            .map(|(item, users)| (item.clone(), users.len()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(user: &str, item: &str, weight: f64) -> std::result::Result<InteractionRecord, RecordError> {
        Ok(InteractionRecord::new(user, item, weight))
    }

    fn row(fields: &[&str]) -> csv::StringRecord {
        csv::StringRecord::from(fields.to_vec())
    }

    #[test]
    fn test_csv_record_accepts_trimmed_fields() {
        let record = InteractionRecord::from_csv_record(&row(&[" 25 ", " 104", "5 "])).unwrap();
        assert_eq!(record, InteractionRecord::new("25", "104", 5.0));
    }

    #[test]
    fn test_csv_record_rejects_malformed_rows() {
        assert_eq!(
            InteractionRecord::from_csv_record(&row(&["25", "104"])),
            Err(RecordError::FieldCount { found: 2 })
        );
        assert_eq!(
            InteractionRecord::from_csv_record(&row(&["", "104", "5"])),
            Err(RecordError::EmptyUser)
        );
        assert_eq!(
            InteractionRecord::from_csv_record(&row(&["25", " ", "5"])),
            Err(RecordError::EmptyItem)
        );
        assert!(matches!(
            InteractionRecord::from_csv_record(&row(&["25", "104", "five"])),
            Err(RecordError::InvalidWeight { .. })
        ));
        assert!(matches!(
            InteractionRecord::from_csv_record(&row(&["25", "104", "-1"])),
            Err(RecordError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn test_load_skips_and_counts_bad_rows() {
        let rows = vec![
            ok("u1", "a", 5.0),
            Err(RecordError::EmptyUser),
            ok("u2", "a", 3.0),
            Err(RecordError::InvalidWeight {
                value: "x".to_string(),
            }),
            Err(RecordError::EmptyUser),
        ];
        let store = InteractionStore::load(rows, SplitConfig::training_only()).unwrap();

        assert_eq!(store.stats().training_records, 2);
        assert_eq!(store.stats().skipped, 3);
        assert_eq!(store.stats().skipped_by_kind.get("empty_user"), Some(&2));
        assert_eq!(store.training().user_count(), 2);
    }

    #[test]
    fn test_repeated_pair_keeps_latest_weight() {
        let rows = vec![ok("u1", "a", 5.0), ok("u1", "a", 3.0)];
        let store = InteractionStore::load(rows, SplitConfig::training_only()).unwrap();
        assert_eq!(store.training().weight("u1", "a"), Some(3.0));
        assert_eq!(store.training().pair_count(), 1);
    }

    #[test]
    fn test_split_extremes() {
        let rows = || (0..50).map(|i| ok(&format!("u{}", i % 7), &format!("i{}", i), 1.0));

        let all_train = InteractionStore::load(rows(), SplitConfig::new(1.0)).unwrap();
        assert_eq!(all_train.stats().training_records, 50);
        assert!(all_train.holdout().is_empty());

        let all_holdout = InteractionStore::load(rows(), SplitConfig::new(0.0)).unwrap();
        assert_eq!(all_holdout.stats().holdout_records, 50);
        assert!(all_holdout.training().is_empty());
        assert!(all_holdout.item_index().is_empty());
    }

    #[test]
    fn test_seeded_split_is_reproducible() {
        let rows = || (0..200).map(|i| ok(&format!("u{}", i % 13), &format!("i{}", i), 1.0));
        let first = InteractionStore::load(rows(), SplitConfig::seeded(0.8, 42)).unwrap();
        let second = InteractionStore::load(rows(), SplitConfig::seeded(0.8, 42)).unwrap();

        assert_eq!(first.stats(), second.stats());
        assert_eq!(first.training().items(), second.training().items());
        assert!(first.stats().training_records > 0);
        assert!(first.stats().holdout_records > 0);
    }

    #[test]
    fn test_invalid_split_ratio_is_rejected() {
        let err = InteractionStore::load(Vec::new(), SplitConfig::new(1.5)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { key: "REC_SPLIT_RATIO", .. }));
    }

    #[test]
    fn test_item_index_covers_exactly_training_items() {
        let training: RatingSet = vec![
            InteractionRecord::new("u1", "a", 5.0),
            InteractionRecord::new("u1", "b", 3.0),
            InteractionRecord::new("u2", "a", 5.0),
        ]
        .into_iter()
        .collect();
        let store = InteractionStore::from_training(training);

        let index = store.item_index();
        assert_eq!(index.len(), 2);
        assert_eq!(index["a"].len(), 2);
        assert!(index["b"].contains("u1"));
        assert!(!index.contains_key("c"));
    }

    #[test]
    fn test_popularity_ties_break_by_item_id() {
        let training: RatingSet = vec![
            InteractionRecord::new("u1", "b", 1.0),
            InteractionRecord::new("u2", "a", 1.0),
            InteractionRecord::new("u3", "c", 1.0),
            InteractionRecord::new("u4", "c", 1.0),
        ]
        .into_iter()
        .collect();
        let store = InteractionStore::from_training(training);

        let ranked = store.popularity();
        assert_eq!(
            ranked,
            vec![
                ("c".to_string(), 2),
                ("a".to_string(), 1),
                ("b".to_string(), 1)
            ]
        );
    }
}
