//! User interest profiles
//!
//! A profile accumulates `label_weight * interaction_weight` over every item a
//! user interacted with in the training set, then scales so the dominant
//! interest is exactly 1.0. Profiles are rebuilt on every run.

use serde::Serialize;
use std::collections::HashMap;

use super::catalog::{ItemMetadata, LabelWeights};
use super::interactions::{RatingSet, UserId};

/// Normalized label → interest weight for one user
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserProfile {
    weights: LabelWeights,
}

impl UserProfile {
    /// Build from raw accumulated weights, dividing by the maximum
    pub fn from_raw(raw: LabelWeights) -> Self {
        let max = raw.values().copied().fold(0.0_f64, f64::max);
        if max <= 0.0 {
            return Self::default();
        }
        let weights = raw
            .into_iter()
            .filter(|(_, w)| *w > 0.0)
            .map(|(label, w)| (label, w / max))
            .collect();
        Self { weights }
    }

    pub fn weights(&self) -> &LabelWeights {
        &self.weights
    }

    pub fn weight(&self, label: &str) -> f64 {
        self.weights.get(label).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// The `n` strongest labels, heaviest first, ties by label
    pub fn top_labels(&self, n: usize) -> Vec<&str> {
        let mut ranked: Vec<(&String, &f64)> = self.weights.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().take(n).map(|(l, _)| l.as_str()).collect()
    }

    /// Dot product over shared labels divided by the product of both norms.
    ///
    /// `None` when either profile is empty or no label is shared.
    pub fn cosine(&self, other: &UserProfile) -> Option<f64> {
        if self.is_empty() || other.is_empty() {
            return None;
        }

        let (small, large) = if self.weights.len() <= other.weights.len() {
            (&self.weights, &other.weights)
        } else {
            (&other.weights, &self.weights)
        };

        let mut shared = 0usize;
        let mut dot = 0.0;
        for (label, w) in small {
            if let Some(o) = large.get(label) {
                shared += 1;
                dot += w * o;
            }
        }
        if shared == 0 {
            return None;
        }

        let norm = |p: &LabelWeights| p.values().map(|w| w * w).sum::<f64>().sqrt();
        let denom = norm(&self.weights) * norm(&other.weights);
        if denom == 0.0 {
            return None;
        }
        Some((dot / denom).min(1.0))
    }

    /// Content match of an item: Σ over shared labels of profile weight × label weight
    pub fn match_score(&self, labels: &LabelWeights) -> f64 {
        labels
            .iter()
            .map(|(label, weight)| self.weight(label) * weight)
            .sum()
    }
}

/// Profiles of every training user that touched at least one labelled item
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    profiles: HashMap<UserId, UserProfile>,
}

impl ProfileSet {
    pub fn build(training: &RatingSet, metadata: &ItemMetadata) -> Self {
        if metadata.is_empty() {
            return Self::default();
        }

        let mut profiles = HashMap::new();
        for (user, items) in training.iter() {
            let mut raw = LabelWeights::new();
            for (item, weight) in items {
                for (label, label_weight) in metadata.labels_for(item) {
                    *raw.entry(label.clone()).or_insert(0.0) += label_weight * weight;
                }
            }
            let profile = UserProfile::from_raw(raw);
            if !profile.is_empty() {
                profiles.insert(user.clone(), profile);
            }
        }

        Self { profiles }
    }

    /// Profile of a user; empty for users without labelled items
    pub fn get(&self, user: &str) -> &UserProfile {
        static EMPTY: UserProfile = UserProfile {
            weights: LabelWeights::new(),
        };
        self.profiles.get(user).unwrap_or(&EMPTY)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommendation::catalog::{CatalogEntry, LabelPolicy};
    use crate::recommendation::interactions::InteractionRecord;

    fn labels(pairs: &[(&str, f64)]) -> LabelWeights {
        pairs.iter().map(|(l, w)| (l.to_string(), *w)).collect()
    }

    #[test]
    fn test_profile_normalizes_to_one() {
        let profile = UserProfile::from_raw(labels(&[("music", 10.0), ("game", 4.0)]));
        assert_eq!(profile.weight("music"), 1.0);
        assert!((profile.weight("game") - 0.4).abs() < 1e-9);
        assert_eq!(profile.top_labels(1), vec!["music"]);
    }

    #[test]
    fn test_top_labels_ties_by_name() {
        let profile = UserProfile::from_raw(labels(&[("b", 1.0), ("a", 1.0), ("c", 0.5)]));
        assert_eq!(profile.top_labels(2), vec!["a", "b"]);
        assert_eq!(profile.top_labels(10).len(), 3);
    }

    #[test]
    fn test_cosine_uses_full_norms() {
        let u = UserProfile::from_raw(labels(&[("a", 1.0), ("b", 1.0)]));
        let v = UserProfile::from_raw(labels(&[("a", 1.0), ("c", 1.0)]));
        // dot = 1, norms = sqrt(2) each
        assert!((u.cosine(&v).unwrap() - 0.5).abs() < 1e-9);
        assert!((u.cosine(&u).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_without_shared_labels() {
        let u = UserProfile::from_raw(labels(&[("a", 1.0)]));
        let v = UserProfile::from_raw(labels(&[("b", 1.0)]));
        assert_eq!(u.cosine(&v), None);
        assert_eq!(u.cosine(&UserProfile::default()), None);
    }

    #[test]
    fn test_build_accumulates_interaction_weight() {
        let policy = LabelPolicy::default();
        let metadata = ItemMetadata::from_entries(
            &[
                CatalogEntry {
                    item_id: "v1".to_string(),
                    category: Some("game".to_string()),
                    sub_type: None,
                    title: None,
                },
                CatalogEntry {
                    item_id: "v2".to_string(),
                    category: Some("music".to_string()),
                    sub_type: None,
                    title: None,
                },
            ],
            &policy,
        );
        let training: RatingSet = vec![
            InteractionRecord::new("u1", "v1", 5.0),
            InteractionRecord::new("u1", "v2", 1.0),
            InteractionRecord::new("u2", "unknown", 3.0),
        ]
        .into_iter()
        .collect();

        let profiles = ProfileSet::build(&training, &metadata);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles.get("u1").weight("game"), 1.0);
        assert!((profiles.get("u1").weight("music") - 0.2).abs() < 1e-9);
        assert!(profiles.get("u2").is_empty());
    }
}
