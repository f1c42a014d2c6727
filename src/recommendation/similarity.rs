//! Similarity Engine
//!
//! Builds the sparse user × user similarity matrix for one run.
//!
//! ## Metrics
//!
//! - **Co-occurrence**: `common / sqrt(|items(u)| * |items(v)|)`, clipped to 1.0
//! - **Jaccard**: `common / union` over watched-item sets
//! - **Pearson**: correlation over co-rated weights, requires `min_common`
//!   shared items, weighted by `1 + ln(1 + common)` and floored at 0
//! - **Content cosine**: cosine between two user profiles over shared labels
//! - **Blended**: convex combination of a behavioral and a content metric
//!
//! ## Build
//!
//! Candidate pairs come from an inverted index (items for behavioral metrics,
//! profile labels for content): every bucket increments a counter for each
//! unordered pair of its users. Buckets are folded into per-worker maps and
//! reduced, then each candidate pair is scored independently. Pairs that never
//! share a bucket have no signal and are only counted.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use super::interactions::{ItemId, ItemIndex, RatingSet, UserId};
use super::profiles::ProfileSet;

/// Default minimum number of co-rated items for Pearson
pub const DEFAULT_MIN_COMMON: usize = 2;

/// Similarity metric, selected by configuration
#[derive(Debug, Clone, PartialEq)]
pub enum SimilarityMetric {
    Cooccurrence,
    Jaccard,
    Pearson {
        min_common: usize,
    },
    ContentCosine,
    Blended {
        behavioral: Box<SimilarityMetric>,
        content: Box<SimilarityMetric>,
        behavioral_weight: f64,
        content_weight: f64,
    },
}

impl Default for SimilarityMetric {
    fn default() -> Self {
        Self::blended(Self::Jaccard, Self::ContentCosine, 0.7, 0.3)
    }
}

impl SimilarityMetric {
    pub fn blended(
        behavioral: SimilarityMetric,
        content: SimilarityMetric,
        behavioral_weight: f64,
        content_weight: f64,
    ) -> Self {
        Self::Blended {
            behavioral: Box::new(behavioral),
            content: Box::new(content),
            behavioral_weight,
            content_weight,
        }
    }

    /// Set the Pearson threshold wherever Pearson appears
    pub fn with_min_common(self, min_common: usize) -> Self {
        match self {
            Self::Pearson { .. } => Self::Pearson { min_common },
            Self::Blended {
                behavioral,
                content,
                behavioral_weight,
                content_weight,
            } => Self::Blended {
                behavioral: Box::new(behavioral.with_min_common(min_common)),
                content: Box::new(content.with_min_common(min_common)),
                behavioral_weight,
                content_weight,
            },
            other => other,
        }
    }

    /// Whether the metric reads user profiles
    pub fn uses_profiles(&self) -> bool {
        match self {
            Self::ContentCosine => true,
            Self::Blended {
                behavioral,
                content,
                ..
            } => behavioral.uses_profiles() || content.uses_profiles(),
            _ => false,
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooccurrence => write!(f, "cooccurrence"),
            Self::Jaccard => write!(f, "jaccard"),
            Self::Pearson { min_common } => write!(f, "pearson(min_common={})", min_common),
            Self::ContentCosine => write!(f, "content"),
            Self::Blended {
                behavioral,
                content,
                behavioral_weight,
                content_weight,
            } => write!(
                f,
                "blended({}*{} + {}*{})",
                behavioral_weight, behavioral, content_weight, content
            ),
        }
    }
}

impl FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cooccurrence" | "co-occurrence" | "cosine" => Ok(Self::Cooccurrence),
            "jaccard" => Ok(Self::Jaccard),
            "pearson" => Ok(Self::Pearson {
                min_common: DEFAULT_MIN_COMMON,
            }),
            "content" | "content-cosine" | "content_cosine" => Ok(Self::ContentCosine),
            "blended" | "hybrid" => Ok(Self::default()),
            other => Err(format!(
                "unknown metric '{}', expected cooccurrence, jaccard, pearson, content or blended",
                other
            )),
        }
    }
}

/// Outcome of scoring one pair of users
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairSimilarity {
    Scored(f64),
    /// Pearson pair with too few co-rated items
    BelowMinCommon { common: usize },
    /// No shared items
    NoOverlap,
    /// Pearson pair where one side has constant weights
    ZeroVariance,
    /// Content pair with an empty profile or no shared label
    NoSharedLabels,
}

impl PairSimilarity {
    /// Effective similarity; every non-scored outcome is 0
    pub fn score(&self) -> f64 {
        match self {
            PairSimilarity::Scored(s) => *s,
            _ => 0.0,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            PairSimilarity::Scored(_) => "scored",
            PairSimilarity::BelowMinCommon { .. } => "below_min_common",
            PairSimilarity::NoOverlap => "no_overlap",
            PairSimilarity::ZeroVariance => "zero_variance",
            PairSimilarity::NoSharedLabels => "no_shared_labels",
        }
    }
}

/// Per-outcome pair counters for one build (unordered pairs)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimilarityStats {
    pub users: usize,
    pub pairs: usize,
    pub scored: usize,
    pub below_min_common: usize,
    pub no_overlap: usize,
    pub zero_variance: usize,
    pub no_shared_labels: usize,
    /// Pairs stored in the matrix (similarity > 0)
    pub retained: usize,
}

impl SimilarityStats {
    fn tally(&mut self, outcome: &PairSimilarity, count: usize) {
        match outcome {
            PairSimilarity::Scored(_) => self.scored += count,
            PairSimilarity::BelowMinCommon { .. } => self.below_min_common += count,
            PairSimilarity::NoOverlap => self.no_overlap += count,
            PairSimilarity::ZeroVariance => self.zero_variance += count,
            PairSimilarity::NoSharedLabels => self.no_shared_labels += count,
        }
    }

    fn record_metrics(&self) {
        for (outcome, count) in [
            ("scored", self.scored),
            ("below_min_common", self.below_min_common),
            ("no_overlap", self.no_overlap),
            ("zero_variance", self.zero_variance),
            ("no_shared_labels", self.no_shared_labels),
            ("retained", self.retained),
        ] {
            metrics::counter!("vidrec_similarity_pairs_total", "outcome" => outcome)
                .increment(count as u64);
        }
    }
}

/// A similar user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub user_id: UserId,
    pub similarity: f64,
}

/// Sparse per-user adjacency lists, each sorted by similarity descending
/// then user id ascending. Only entries above 0 are stored, never self-pairs.
#[derive(Debug, Clone, Default)]
pub struct SimilarityMatrix {
    rows: HashMap<UserId, Vec<Neighbor>>,
}

impl SimilarityMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from directed `(user, neighbor, similarity)` entries
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (UserId, UserId, f64)>,
    {
        let mut matrix = Self::new();
        for (user, neighbor, similarity) in entries {
            matrix.push(user, neighbor, similarity);
        }
        matrix.sort_rows();
        matrix
    }

    fn push(&mut self, user: UserId, neighbor: UserId, similarity: f64) {
        if user == neighbor || !(similarity > 0.0) {
            return;
        }
        self.rows.entry(user).or_default().push(Neighbor {
            user_id: neighbor,
            similarity,
        });
    }

    fn sort_rows(&mut self) {
        for row in self.rows.values_mut() {
            row.sort_by(|a, b| {
                b.similarity
                    .total_cmp(&a.similarity)
                    .then_with(|| a.user_id.cmp(&b.user_id))
            });
        }
    }

    /// All neighbors of a user, most similar first
    pub fn neighbors(&self, user: &str) -> &[Neighbor] {
        self.rows.get(user).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The `k` most similar neighbors (all of them when fewer exist)
    pub fn top_k(&self, user: &str, k: usize) -> &[Neighbor] {
        let row = self.neighbors(user);
        &row[..k.min(row.len())]
    }

    pub fn get(&self, user: &str, neighbor: &str) -> Option<f64> {
        self.neighbors(user)
            .iter()
            .find(|n| n.user_id == neighbor)
            .map(|n| n.similarity)
    }

    pub fn contains_user(&self, user: &str) -> bool {
        self.rows.contains_key(user)
    }

    pub fn user_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of directed entries
    pub fn entry_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

type PairKey = (u32, u32);

fn pair_key(a: u32, b: u32) -> PairKey {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Everything a metric may read, preloaded in memory
#[derive(Debug, Clone, Copy)]
pub struct SimilarityContext<'a> {
    pub training: &'a RatingSet,
    pub item_index: &'a ItemIndex,
    pub profiles: &'a ProfileSet,
}

impl<'a> SimilarityContext<'a> {
    pub fn new(
        training: &'a RatingSet,
        item_index: &'a ItemIndex,
        profiles: &'a ProfileSet,
    ) -> Self {
        Self {
            training,
            item_index,
            profiles,
        }
    }

    /// Score a single pair of users with `metric`
    pub fn pair_similarity(&self, metric: &SimilarityMetric, u: &str, v: &str) -> PairSimilarity {
        match metric {
            SimilarityMetric::Cooccurrence | SimilarityMetric::Jaccard => {
                let (a, b) = match (self.training.items_of(u), self.training.items_of(v)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return PairSimilarity::NoOverlap,
                };
                let common = a.keys().filter(|item| b.contains_key(*item)).count();
                set_similarity(metric, common, a.len(), b.len())
            }
            SimilarityMetric::Pearson { min_common } => {
                match (self.training.items_of(u), self.training.items_of(v)) {
                    (Some(a), Some(b)) => pearson(a, b, *min_common),
                    _ => PairSimilarity::NoOverlap,
                }
            }
            SimilarityMetric::ContentCosine => self.content_cosine(u, v),
            SimilarityMetric::Blended {
                behavioral,
                content,
                behavioral_weight,
                content_weight,
            } => {
                let b = self.pair_similarity(behavioral, u, v);
                let c = self.pair_similarity(content, u, v);
                blend(b, c, *behavioral_weight, *content_weight)
            }
        }
    }

    fn content_cosine(&self, u: &str, v: &str) -> PairSimilarity {
        match self.profiles.get(u).cosine(self.profiles.get(v)) {
            Some(s) => PairSimilarity::Scored(s),
            None => PairSimilarity::NoSharedLabels,
        }
    }

    /// Build the similarity matrix over `users`.
    ///
    /// Users without training interactions have no row. Duplicates are ignored.
    pub fn build_matrix(
        &self,
        users: &[UserId],
        metric: &SimilarityMetric,
    ) -> (SimilarityMatrix, SimilarityStats) {
        let mut ids: Vec<&UserId> = users
            .iter()
            .filter(|u| self.training.contains_user(u))
            .collect();
        ids.sort();
        ids.dedup();

        let n = ids.len();
        let mut stats = SimilarityStats {
            users: n,
            pairs: n * n.saturating_sub(1) / 2,
            ..SimilarityStats::default()
        };
        if n < 2 {
            return (SimilarityMatrix::new(), stats);
        }

        let outcomes = self.pair_outcomes(&ids, metric);
        let mut scores: HashMap<PairKey, f64> = HashMap::new();
        for (key, outcome) in &outcomes {
            stats.tally(outcome, 1);
            if outcome.score() > 0.0 {
                scores.insert(*key, outcome.score());
            }
        }
        // Pairs that never met in a bucket
        stats.tally(&unseen_outcome(metric), stats.pairs - outcomes.len());
        stats.retained = scores.len();
        stats.record_metrics();

        let matrix = SimilarityMatrix::from_entries(scores.into_iter().flat_map(|((a, b), s)| {
            let (u, v) = (ids[a as usize].clone(), ids[b as usize].clone());
            [(u.clone(), v.clone(), s), (v, u, s)]
        }));

        info!(
            metric = %metric,
            users = stats.users,
            pairs = stats.pairs,
            scored = stats.scored,
            below_min_common = stats.below_min_common,
            no_overlap = stats.no_overlap,
            zero_variance = stats.zero_variance,
            no_shared_labels = stats.no_shared_labels,
            retained = stats.retained,
            "Similarity matrix built"
        );

        (matrix, stats)
    }

    /// Outcome of every candidate pair; pairs absent from the map never shared a bucket
    fn pair_outcomes(
        &self,
        ids: &[&UserId],
        metric: &SimilarityMetric,
    ) -> HashMap<PairKey, PairSimilarity> {
        if let SimilarityMetric::Blended {
            behavioral,
            content,
            behavioral_weight,
            content_weight,
        } = metric
        {
            let b_outcomes = self.pair_outcomes(ids, behavioral);
            let c_outcomes = self.pair_outcomes(ids, content);
            let keys: HashSet<PairKey> =
                b_outcomes.keys().chain(c_outcomes.keys()).copied().collect();

            return keys
                .into_iter()
                .map(|key| {
                    let b = b_outcomes
                        .get(&key)
                        .copied()
                        .unwrap_or_else(|| unseen_outcome(behavioral));
                    let c = c_outcomes
                        .get(&key)
                        .copied()
                        .unwrap_or_else(|| unseen_outcome(content));
                    (key, blend(b, c, *behavioral_weight, *content_weight))
                })
                .collect();
        }

        let candidates = self.candidate_pairs(ids, metric);
        let outcomes: HashMap<PairKey, PairSimilarity> = candidates
            .par_iter()
            .map(|(&(a, b), &common)| {
                let (u, v) = (ids[a as usize].as_str(), ids[b as usize].as_str());
                let outcome = match metric {
                    SimilarityMetric::Cooccurrence | SimilarityMetric::Jaccard => {
                        let len = |user: &str| self.training.items_of(user).map_or(0, BTreeMap::len);
                        set_similarity(metric, common, len(u), len(v))
                    }
                    _ => self.pair_similarity(metric, u, v),
                };
                ((a, b), outcome)
            })
            .collect();

        debug!(metric = %metric, candidates = outcomes.len(), "Scored candidate pairs");
        outcomes
    }

    /// Unordered pairs sharing at least one bucket, with their shared-bucket count
    fn candidate_pairs(&self, ids: &[&UserId], metric: &SimilarityMetric) -> HashMap<PairKey, usize> {
        let position: HashMap<&str, u32> = ids
            .iter()
            .enumerate()
            .map(|(i, u)| (u.as_str(), i as u32))
            .collect();

        let buckets: Vec<Vec<u32>> = if *metric == SimilarityMetric::ContentCosine {
            let mut by_label: HashMap<&str, Vec<u32>> = HashMap::new();
            for (i, user) in ids.iter().enumerate() {
                for label in self.profiles.get(user).weights().keys() {
                    by_label.entry(label.as_str()).or_default().push(i as u32);
                }
            }
            by_label.into_values().collect()
        } else {
            self.item_index
                .values()
                .map(|users| {
                    users
                        .iter()
                        .filter_map(|u| position.get(u.as_str()).copied())
                        .collect::<Vec<u32>>()
                })
                .filter(|bucket| bucket.len() > 1)
                .collect()
        };

        buckets
            .par_iter()
            .fold(HashMap::new, |mut acc: HashMap<PairKey, usize>, bucket| {
                for (i, &a) in bucket.iter().enumerate() {
                    for &b in &bucket[i + 1..] {
                        *acc.entry(pair_key(a, b)).or_insert(0) += 1;
                    }
                }
                acc
            })
            .reduce(HashMap::new, |left, right| {
                if left.len() < right.len() {
                    merge_counts(right, left)
                } else {
                    merge_counts(left, right)
                }
            })
    }
}

fn merge_counts(mut into: HashMap<PairKey, usize>, from: HashMap<PairKey, usize>) -> HashMap<PairKey, usize> {
    for (key, count) in from {
        *into.entry(key).or_insert(0) += count;
    }
    into
}

/// Outcome of a pair that shares no item (or no label for content metrics)
fn unseen_outcome(metric: &SimilarityMetric) -> PairSimilarity {
    match metric {
        SimilarityMetric::ContentCosine => PairSimilarity::NoSharedLabels,
        SimilarityMetric::Blended { behavioral, .. } => unseen_outcome(behavioral),
        _ => PairSimilarity::NoOverlap,
    }
}

/// Weighted sum of two outcomes; scored when either side scored, else the behavioral reason
fn blend(b: PairSimilarity, c: PairSimilarity, b_weight: f64, c_weight: f64) -> PairSimilarity {
    match (b, c) {
        (PairSimilarity::Scored(_), _) | (_, PairSimilarity::Scored(_)) => {
            PairSimilarity::Scored(b_weight * b.score() + c_weight * c.score())
        }
        (b, _) => b,
    }
}

/// Co-occurrence or Jaccard from set sizes
fn set_similarity(metric: &SimilarityMetric, common: usize, len_u: usize, len_v: usize) -> PairSimilarity {
    if common == 0 || len_u == 0 || len_v == 0 {
        return PairSimilarity::NoOverlap;
    }
    let common = common as f64;
    let score = match metric {
        SimilarityMetric::Jaccard => common / ((len_u + len_v) as f64 - common),
        _ => (common / ((len_u * len_v) as f64).sqrt()).min(1.0),
    };
    PairSimilarity::Scored(score)
}

/// Support-weighted Pearson correlation over co-rated items
fn pearson(a: &BTreeMap<ItemId, f64>, b: &BTreeMap<ItemId, f64>, min_common: usize) -> PairSimilarity {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .filter_map(|(item, wa)| b.get(item).map(|wb| (*wa, *wb)))
        .collect();

    let n = pairs.len();
    if n == 0 {
        return PairSimilarity::NoOverlap;
    }
    if n < min_common.max(1) {
        return PairSimilarity::BelowMinCommon { common: n };
    }

    let nf = n as f64;
    let (mut sum1, mut sum2, mut sum1_sq, mut sum2_sq, mut p_sum) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        sum1 += x;
        sum2 += y;
        sum1_sq += x * x;
        sum2_sq += y * y;
        p_sum += x * y;
    }

    let num = p_sum - sum1 * sum2 / nf;
    let den = ((sum1_sq - sum1 * sum1 / nf) * (sum2_sq - sum2 * sum2 / nf)).sqrt();
    if !(den > f64::EPSILON) {
        return PairSimilarity::ZeroVariance;
    }

    let weighted = (num / den) * (1.0 + nf.ln_1p());
    PairSimilarity::Scored(weighted.clamp(0.0, 1.0))
}
