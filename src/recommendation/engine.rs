//! Recommendation Engine
//!
//! Ranks unseen items for a user from the interactions of their most similar
//! neighbors, optionally re-weighted by category affinity and merged with a
//! content-based candidate list. Users without usable signal get the
//! popularity fallback.
//!
//! Every non-fallback list is normalized so that its top item scores exactly
//! [`MAX_SCORE`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use super::catalog::ItemMetadata;
use super::interactions::{InteractionStore, ItemId, UserId};
use super::profiles::{ProfileSet, UserProfile};
use super::similarity::{
    Neighbor, SimilarityContext, SimilarityMatrix, SimilarityMetric, SimilarityStats,
};
use crate::config::RecommendationConfig;

/// Score given to the best item of every list
pub const MAX_SCORE: f64 = 5.0;

/// An item with its score in `[0, MAX_SCORE]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub item_id: ItemId,
    pub score: f64,
}

/// A persisted recommendation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl ScoredItem {
    pub fn into_recommendation(self, user_id: &str, created_at: DateTime<Utc>) -> Recommendation {
        Recommendation {
            user_id: user_id.to_string(),
            item_id: self.item_id,
            score: self.score,
            created_at,
        }
    }
}

/// Which branch produced a user's list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPath {
    /// No training interactions: popular items
    ColdStart,
    /// Interactions but no similar users: popular unseen items
    NoNeighbors,
    /// Neighbors found but nothing new to offer: popular unseen items
    NoCandidates,
    /// Collaborative and content candidates, normalized
    Ranked,
}

impl RecommendationPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationPath::ColdStart => "cold_start",
            RecommendationPath::NoNeighbors => "no_neighbors",
            RecommendationPath::NoCandidates => "no_candidates",
            RecommendationPath::Ranked => "ranked",
        }
    }

    pub fn is_fallback(&self) -> bool {
        !matches!(self, RecommendationPath::Ranked)
    }
}

/// What happened while recommending for one user
#[derive(Debug, Clone, Serialize)]
pub struct RecommendationTrace {
    pub user_id: UserId,
    pub path: RecommendationPath,
    /// Neighbors actually used
    pub neighbors: Vec<Neighbor>,
    /// Collaborative scores before normalization, after boosts
    pub collaborative: BTreeMap<ItemId, f64>,
    /// Content match scores before normalization
    pub content: BTreeMap<ItemId, f64>,
}

/// Post-processing multiplier applied to each neighbor contribution
pub trait CandidateBoost: Send + Sync {
    fn name(&self) -> &'static str;

    fn multiplier(
        &self,
        user: &UserProfile,
        neighbor: &UserProfile,
        item: &str,
        metadata: &ItemMetadata,
    ) -> f64;
}

/// Boost items whose primary label is among the user's (or the neighbor's) top labels
#[derive(Debug, Clone)]
pub struct CategoryBoost {
    pub own: f64,
    pub neighbor: f64,
    pub top_labels: usize,
}

impl Default for CategoryBoost {
    fn default() -> Self {
        Self {
            own: 2.0,
            neighbor: 1.5,
            top_labels: 5,
        }
    }
}

impl CategoryBoost {
    fn in_top(&self, profile: &UserProfile, label: &str) -> bool {
        profile.top_labels(self.top_labels).contains(&label)
    }
}

impl CandidateBoost for CategoryBoost {
    fn name(&self) -> &'static str {
        "category"
    }

    fn multiplier(
        &self,
        user: &UserProfile,
        neighbor: &UserProfile,
        item: &str,
        metadata: &ItemMetadata,
    ) -> f64 {
        match metadata.primary_label(item) {
            Some(label) if self.in_top(user, label) => self.own,
            Some(label) if self.in_top(neighbor, label) => self.neighbor,
            _ => 1.0,
        }
    }
}

/// Scoring knobs
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Merge content-based candidates into the collaborative list
    pub content_blend: bool,
    /// Multiplier for candidates only the content list produced
    pub content_discount: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            content_blend: true,
            content_discount: 0.5,
        }
    }
}

impl From<&RecommendationConfig> for EngineOptions {
    fn from(config: &RecommendationConfig) -> Self {
        Self {
            content_blend: config.content_blend,
            content_discount: config.content_discount,
        }
    }
}

/// Per-run recommendation engine over a fixed training set
pub struct RecommendationEngine {
    store: InteractionStore,
    metadata: ItemMetadata,
    profiles: ProfileSet,
    matrix: SimilarityMatrix,
    options: EngineOptions,
    boosts: Vec<Box<dyn CandidateBoost>>,
    /// Training items ranked by distinct users
    popularity: Vec<(ItemId, usize)>,
    /// label → training items carrying it
    label_index: HashMap<String, Vec<ItemId>>,
}

impl RecommendationEngine {
    pub fn new(
        store: InteractionStore,
        metadata: ItemMetadata,
        profiles: ProfileSet,
        matrix: SimilarityMatrix,
        options: EngineOptions,
    ) -> Self {
        let popularity = store.popularity();

        let mut label_index: HashMap<String, Vec<ItemId>> = HashMap::new();
        for (item, _) in &popularity {
            for label in metadata.labels_for(item).keys() {
                label_index.entry(label.clone()).or_default().push(item.clone());
            }
        }

        Self {
            store,
            metadata,
            profiles,
            matrix,
            options,
            boosts: Vec::new(),
            popularity,
            label_index,
        }
    }

    /// Build profiles and the similarity matrix over every training user
    pub fn build(
        store: InteractionStore,
        metadata: ItemMetadata,
        metric: &SimilarityMetric,
        options: EngineOptions,
    ) -> (Self, SimilarityStats) {
        let profiles = ProfileSet::build(store.training(), &metadata);
        let (matrix, stats) = {
            let ctx = SimilarityContext::new(store.training(), store.item_index(), &profiles);
            ctx.build_matrix(&store.training().users(), metric)
        };
        (Self::new(store, metadata, profiles, matrix, options), stats)
    }

    /// Append a re-ranking step
    pub fn with_boost(mut self, boost: impl CandidateBoost + 'static) -> Self {
        self.boosts.push(Box::new(boost));
        self
    }

    pub fn store(&self) -> &InteractionStore {
        &self.store
    }

    pub fn matrix(&self) -> &SimilarityMatrix {
        &self.matrix
    }

    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    /// Top `n` items for `user` using up to `k` neighbors
    pub fn recommend(&self, user: &str, k: usize, n: usize) -> Vec<ScoredItem> {
        self.recommend_traced(user, k, n).0
    }

    /// Like [`recommend`](Self::recommend), also returning how the list was produced
    pub fn recommend_traced(
        &self,
        user: &str,
        k: usize,
        n: usize,
    ) -> (Vec<ScoredItem>, RecommendationTrace) {
        let mut trace = RecommendationTrace {
            user_id: user.to_string(),
            path: RecommendationPath::ColdStart,
            neighbors: Vec::new(),
            collaborative: BTreeMap::new(),
            content: BTreeMap::new(),
        };

        let watched = match self.store.training().items_of(user) {
            Some(items) if !items.is_empty() => items,
            _ => return self.finish(self.popular_fallback(&BTreeSet::new(), n), trace),
        };
        let watched_ids: BTreeSet<&str> = watched.keys().map(String::as_str).collect();

        if !self.matrix.contains_user(user) {
            trace.path = RecommendationPath::NoNeighbors;
            return self.finish(self.popular_fallback(&watched_ids, n), trace);
        }

        let neighbors = self.matrix.top_k(user, k);
        let user_profile = self.profiles.get(user);

        for neighbor in neighbors {
            let Some(items) = self.store.training().items_of(&neighbor.user_id) else {
                continue;
            };
            let neighbor_profile = self.profiles.get(&neighbor.user_id);
            for (item, weight) in items {
                if watched.contains_key(item) {
                    continue;
                }
                let boost: f64 = self
                    .boosts
                    .iter()
                    .map(|b| b.multiplier(user_profile, neighbor_profile, item, &self.metadata))
                    .product();
                *trace.collaborative.entry(item.clone()).or_insert(0.0) +=
                    neighbor.similarity * weight * boost;
            }
        }
        trace.neighbors = neighbors.to_vec();

        if self.options.content_blend {
            trace.content = self.content_candidates(user_profile, &watched_ids);
        }

        let merged = self.merge(&trace.collaborative, &trace.content);
        if merged.is_empty() {
            trace.path = RecommendationPath::NoCandidates;
            return self.finish(self.popular_fallback(&watched_ids, n), trace);
        }

        trace.path = RecommendationPath::Ranked;
        let ranked = rank(normalize(merged), n);
        self.finish(ranked, trace)
    }

    fn finish(
        &self,
        items: Vec<ScoredItem>,
        trace: RecommendationTrace,
    ) -> (Vec<ScoredItem>, RecommendationTrace) {
        metrics::counter!("vidrec_recommendations_total", "path" => trace.path.as_str())
            .increment(1);
        debug!(
            user = %trace.user_id,
            path = trace.path.as_str(),
            neighbors = trace.neighbors.len(),
            collaborative = trace.collaborative.len(),
            content = trace.content.len(),
            returned = items.len(),
            "Recommended"
        );
        (items, trace)
    }

    /// Profile match score of every unseen training item sharing a label with the user
    fn content_candidates(
        &self,
        profile: &UserProfile,
        watched: &BTreeSet<&str>,
    ) -> BTreeMap<ItemId, f64> {
        let candidates: BTreeSet<&ItemId> = profile
            .weights()
            .keys()
            .filter_map(|label| self.label_index.get(label))
            .flatten()
            .filter(|item| !watched.contains(item.as_str()))
            .collect();

        candidates
            .into_iter()
            .map(|item| (item.clone(), profile.match_score(self.metadata.labels_for(item))))
            .filter(|(_, score)| *score > 0.0)
            .collect()
    }

    /// Both lists are scaled to `MAX_SCORE` first; shared items keep the larger
    /// score and content-only items are discounted
    fn merge(
        &self,
        collaborative: &BTreeMap<ItemId, f64>,
        content: &BTreeMap<ItemId, f64>,
    ) -> BTreeMap<ItemId, f64> {
        let mut merged: BTreeMap<ItemId, f64> = collaborative
            .iter()
            .filter(|(_, s)| **s > 0.0)
            .map(|(item, s)| (item.clone(), *s))
            .collect();
        if content.is_empty() {
            return merged;
        }

        merged = normalize(merged);
        for (item, score) in normalize(content.clone()) {
            match merged.get_mut(&item) {
                Some(existing) => *existing = existing.max(score),
                None => {
                    let discounted = score * self.options.content_discount;
                    if discounted > 0.0 {
                        merged.insert(item, discounted);
                    }
                }
            }
        }
        merged
    }

    /// Most popular training items not in `excluded`, top count scaled to `MAX_SCORE`
    pub fn popular_fallback(&self, excluded: &BTreeSet<&str>, n: usize) -> Vec<ScoredItem> {
        let kept: Vec<&(ItemId, usize)> = self
            .popularity
            .iter()
            .filter(|(item, _)| !excluded.contains(item.as_str()))
            .take(n)
            .collect();

        let Some(top) = kept.first().map(|(_, count)| *count as f64) else {
            return Vec::new();
        };

        kept.into_iter()
            .map(|(item, count)| ScoredItem {
                item_id: item.clone(),
                score: *count as f64 / top * MAX_SCORE,
            })
            .collect()
    }
}

/// Divide by the maximum and scale to `MAX_SCORE`
fn normalize(scores: BTreeMap<ItemId, f64>) -> BTreeMap<ItemId, f64> {
    let max = scores.values().copied().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return BTreeMap::new();
    }
    scores
        .into_iter()
        .map(|(item, s)| (item, s / max * MAX_SCORE))
        .collect()
}

/// Score descending, item id ascending, truncated to `n`
fn rank(scores: BTreeMap<ItemId, f64>, n: usize) -> Vec<ScoredItem> {
    let mut ranked: Vec<ScoredItem> = scores
        .into_iter()
        .map(|(item_id, score)| ScoredItem { item_id, score })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommendation::catalog::{CatalogEntry, LabelPolicy};
    use crate::recommendation::interactions::{InteractionRecord, RatingSet};

    const EPS: f64 = 1e-9;

    fn training(rows: &[(&str, &str, f64)]) -> RatingSet {
        rows.iter()
            .map(|(u, i, w)| InteractionRecord::new(*u, *i, *w))
            .collect()
    }

    fn catalog(entries: &[(&str, &str)]) -> ItemMetadata {
        let entries: Vec<CatalogEntry> = entries
            .iter()
            .map(|(id, category)| CatalogEntry {
                item_id: id.to_string(),
                category: Some(category.to_string()),
                sub_type: None,
                title: None,
            })
            .collect();
        ItemMetadata::from_entries(&entries, &LabelPolicy::default())
    }

    fn engine(
        rows: &[(&str, &str, f64)],
        metadata: ItemMetadata,
        metric: SimilarityMetric,
        options: EngineOptions,
    ) -> RecommendationEngine {
        let store = InteractionStore::from_training(training(rows));
        RecommendationEngine::build(store, metadata, &metric, options).0
    }

    fn scenario_rows() -> Vec<(&'static str, &'static str, f64)> {
        vec![
            ("u1", "a", 5.0),
            ("u1", "b", 3.0),
            ("u2", "a", 5.0),
            ("u2", "c", 4.0),
            ("u3", "b", 3.0),
        ]
    }

    fn ids(items: &[ScoredItem]) -> Vec<&str> {
        items.iter().map(|i| i.item_id.as_str()).collect()
    }

    #[test]
    fn test_scenario_surfaces_c_at_top_score() {
        let engine = engine(
            &scenario_rows(),
            ItemMetadata::new(),
            SimilarityMetric::Cooccurrence,
            EngineOptions::default(),
        );

        let (items, trace) = engine.recommend_traced("u1", 2, 2);
        assert_eq!(ids(&items), vec!["c"]);
        assert!((items[0].score - MAX_SCORE).abs() < EPS);
        assert_eq!(trace.path, RecommendationPath::Ranked);
        assert_eq!(trace.neighbors.len(), 2);
        // 0.5 similarity × weight 4
        assert!((trace.collaborative["c"] - 2.0).abs() < EPS);
    }

    #[test]
    fn test_top_score_and_ordering() {
        let rows = [
            ("u1", "a", 5.0),
            ("u1", "b", 5.0),
            ("u2", "a", 5.0),
            ("u2", "c", 5.0),
            ("u2", "d", 5.0),
            ("u3", "b", 5.0),
            ("u3", "d", 3.0),
            ("u3", "e", 5.0),
        ];
        let engine = engine(
            &rows,
            ItemMetadata::new(),
            SimilarityMetric::Cooccurrence,
            EngineOptions::default(),
        );

        let first = engine.recommend("u1", 5, 10);
        let second = engine.recommend("u1", 5, 10);
        assert_eq!(first, second);

        assert!((first[0].score - MAX_SCORE).abs() < EPS);
        for pair in first.windows(2) {
            assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score && pair[0].item_id < pair[1].item_id)
            );
        }
        // c and e tie (one neighbor each, weight 5, similarity 1/sqrt(6))
        assert_eq!(ids(&first), vec!["d", "c", "e"]);
    }

    #[test]
    fn test_watched_items_never_returned() {
        let engine = engine(
            &scenario_rows(),
            catalog(&[("a", "x"), ("b", "y"), ("c", "x")]),
            SimilarityMetric::default(),
            EngineOptions::default(),
        )
        .with_boost(CategoryBoost::default());

        for user in ["u1", "u2", "u3"] {
            let watched = engine.store().training().items_of(user).unwrap();
            for item in engine.recommend(user, 5, 10) {
                assert!(!watched.contains_key(&item.item_id));
            }
        }
    }

    #[test]
    fn test_user_without_neighbors_gets_popular_fallback() {
        let mut rows = scenario_rows();
        rows.push(("u4", "z", 1.0));
        let engine = engine(
            &rows,
            ItemMetadata::new(),
            SimilarityMetric::Cooccurrence,
            EngineOptions::default(),
        );

        let watched: BTreeSet<&str> = ["z"].into_iter().collect();
        let (items, trace) = engine.recommend_traced("u4", 5, 3);
        assert_eq!(trace.path, RecommendationPath::NoNeighbors);
        assert_eq!(items, engine.popular_fallback(&watched, 3));
        // a and b have 2 users each, c has 1
        assert_eq!(ids(&items), vec!["a", "b", "c"]);
        assert!((items[2].score - 2.5).abs() < EPS);
    }

    #[test]
    fn test_cold_start_user() {
        let engine = engine(
            &scenario_rows(),
            ItemMetadata::new(),
            SimilarityMetric::Cooccurrence,
            EngineOptions::default(),
        );
        let (items, trace) = engine.recommend_traced("stranger", 5, 2);
        assert_eq!(trace.path, RecommendationPath::ColdStart);
        assert_eq!(ids(&items), vec!["a", "b"]);
        assert_eq!(items[0].score, MAX_SCORE);
    }

    #[test]
    fn test_no_candidates_falls_back() {
        // u2 only repeats what u1 already watched
        let rows = [("u1", "a", 1.0), ("u1", "b", 1.0), ("u2", "a", 1.0), ("u3", "c", 1.0)];
        let engine = engine(
            &rows,
            ItemMetadata::new(),
            SimilarityMetric::Cooccurrence,
            EngineOptions::default(),
        );
        let (items, trace) = engine.recommend_traced("u1", 5, 5);
        assert_eq!(trace.path, RecommendationPath::NoCandidates);
        assert_eq!(ids(&items), vec!["c"]);
    }

    #[test]
    fn test_empty_training_set() {
        let engine = engine(
            &[],
            ItemMetadata::new(),
            SimilarityMetric::default(),
            EngineOptions::default(),
        );
        assert!(engine.recommend("anyone", 5, 5).is_empty());
        assert!(engine.matrix().is_empty());
    }

    #[test]
    fn test_zero_neighbors_uses_content_only() {
        let engine = engine(
            &scenario_rows(),
            catalog(&[("a", "x"), ("b", "y"), ("c", "x")]),
            SimilarityMetric::Cooccurrence,
            EngineOptions::default(),
        );
        let (items, trace) = engine.recommend_traced("u1", 0, 5);
        assert!(trace.neighbors.is_empty());
        assert!(trace.collaborative.is_empty());
        assert_eq!(trace.path, RecommendationPath::Ranked);
        assert_eq!(ids(&items), vec!["c"]);
        assert_eq!(items[0].score, MAX_SCORE);
    }

    #[test]
    fn test_content_only_items_are_discounted() {
        // u1 shares only item a with u2; d is never watched by a neighbor but
        // matches u1's category through the catalog
        let rows = [
            ("u1", "a", 1.0),
            ("u2", "a", 1.0),
            ("u2", "b", 1.0),
            ("u3", "d", 1.0),
        ];
        let engine = engine(
            &rows,
            catalog(&[("a", "x"), ("b", "y"), ("d", "x")]),
            SimilarityMetric::Cooccurrence,
            EngineOptions::default(),
        );

        let (items, trace) = engine.recommend_traced("u1", 5, 5);
        assert_eq!(ids(&items), vec!["b", "d"]);
        assert_eq!(items[0].score, MAX_SCORE);
        assert!((items[1].score - 2.5).abs() < EPS);
        assert!(trace.content.contains_key("d"));
        assert!(!trace.collaborative.contains_key("d"));
    }

    #[test]
    fn test_content_blend_can_be_disabled() {
        let rows = [
            ("u1", "a", 1.0),
            ("u2", "a", 1.0),
            ("u2", "b", 1.0),
            ("u3", "d", 1.0),
        ];
        let engine = engine(
            &rows,
            catalog(&[("a", "x"), ("b", "y"), ("d", "x")]),
            SimilarityMetric::Cooccurrence,
            EngineOptions {
                content_blend: false,
                ..EngineOptions::default()
            },
        );
        let (items, trace) = engine.recommend_traced("u1", 5, 5);
        assert_eq!(ids(&items), vec!["b"]);
        assert!(trace.content.is_empty());
    }

    #[test]
    fn test_category_boost_reorders() {
        // Both neighbors are equally similar; b matches u1's category
        let rows = [
            ("u1", "a", 1.0),
            ("u2", "a", 1.0),
            ("u2", "b", 1.0),
            ("u3", "a", 1.0),
            ("u3", "c", 1.0),
        ];
        let metadata = catalog(&[("a", "x"), ("b", "x"), ("c", "y")]);
        let plain = engine(
            &rows,
            metadata.clone(),
            SimilarityMetric::Cooccurrence,
            EngineOptions {
                content_blend: false,
                ..EngineOptions::default()
            },
        );
        let boosted = engine(
            &rows,
            metadata,
            SimilarityMetric::Cooccurrence,
            EngineOptions {
                content_blend: false,
                ..EngineOptions::default()
            },
        )
        .with_boost(CategoryBoost::default());

        let plain = plain.recommend("u1", 5, 5);
        assert_eq!(plain[0].score, plain[1].score);

        let (items, trace) = boosted.recommend_traced("u1", 5, 5);
        assert_eq!(ids(&items), vec!["b", "c"]);
        // own-category ×2.0 against neighbor-category ×1.5
        assert!((trace.collaborative["b"] / trace.collaborative["c"] - 2.0 / 1.5).abs() < EPS);
        assert!((items[1].score - MAX_SCORE * 1.5 / 2.0).abs() < EPS);
    }

    #[test]
    fn test_category_boost_top_label_cutoff() {
        let profile = UserProfile::from_raw(
            [("a", 3.0), ("b", 2.0), ("c", 1.0)]
                .iter()
                .map(|(l, w)| (l.to_string(), *w))
                .collect(),
        );
        let boost = CategoryBoost {
            top_labels: 2,
            ..CategoryBoost::default()
        };
        assert!(boost.in_top(&profile, "a"));
        assert!(boost.in_top(&profile, "b"));
        assert!(!boost.in_top(&profile, "c"));
        assert!(!boost.in_top(&profile, "zzz"));
    }

    #[test]
    fn test_items_outside_training_are_never_ranked() {
        // q is catalog-only and h was only seen in the held-out split; both share label x
        let metadata = catalog(&[("a", "x"), ("b", "y"), ("c", "x"), ("q", "x"), ("h", "x")]);
        let holdout = training(&[("u1", "h", 5.0), ("u5", "h", 5.0)]);
        let store = InteractionStore::from_split(training(&scenario_rows()), holdout);
        let engine = RecommendationEngine::build(
            store,
            metadata,
            &SimilarityMetric::default(),
            EngineOptions::default(),
        )
        .0
        .with_boost(CategoryBoost::default());

        let unknown = ["q", "h"];
        for user in ["u1", "u2", "u3", "u5", "stranger"] {
            for k in [0, 5] {
                let (items, trace) = engine.recommend_traced(user, k, 10);
                assert!(items.iter().all(|i| !unknown.contains(&i.item_id.as_str())));
                assert!(trace.content.keys().all(|i| !unknown.contains(&i.as_str())));
            }
        }

        let popular = engine.popular_fallback(&BTreeSet::new(), 10);
        assert_eq!(ids(&popular), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_popular_fallback_on_empty_training() {
        let engine = engine(
            &[],
            ItemMetadata::new(),
            SimilarityMetric::Cooccurrence,
            EngineOptions::default(),
        );
        assert!(engine.popular_fallback(&BTreeSet::new(), 10).is_empty());
    }
}
