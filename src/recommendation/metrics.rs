//! Run metrics and held-out evaluation
//!
//! Phase timers feed the `vidrec_phase_duration_ms` histogram; the evaluation
//! report scores a finished batch against the interactions held out of
//! training. Neither affects what gets recommended.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use super::engine::Recommendation;
use super::interactions::{RatingSet, UserId};

/// Phases slower than this are logged at warn
pub const SLOW_PHASE_MS: u64 = 30_000;

/// Times one phase of a run; reports on drop
pub struct PerformanceTimer {
    start: Instant,
    phase: &'static str,
    threshold_ms: u64,
}

impl PerformanceTimer {
    pub fn new(phase: &'static str) -> Self {
        Self::with_threshold(phase, SLOW_PHASE_MS)
    }

    pub fn with_threshold(phase: &'static str, threshold_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            phase,
            threshold_ms,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn is_slow(&self) -> bool {
        self.elapsed_ms() > self.threshold_ms
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed_ms();
        metrics::histogram!("vidrec_phase_duration_ms", "phase" => self.phase)
            .record(elapsed as f64);

        if elapsed > self.threshold_ms {
            tracing::warn!(
                "⚠️ Slow phase: {} took {}ms (threshold: {}ms)",
                self.phase,
                elapsed,
                self.threshold_ms
            );
        } else {
            tracing::debug!("⏱️ {} completed in {}ms", self.phase, elapsed);
        }
    }
}

/// Quality of one batch measured on held-out interactions
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationReport {
    /// Users with at least one held-out item
    pub users_evaluated: usize,
    /// Recommended items that were in the user's held-out set
    pub hits: usize,
    pub recommended: usize,
    pub held_out: usize,
    pub precision: f64,
    pub recall: f64,
    /// Distinct recommended items over distinct training items
    pub coverage: f64,
    /// Users served by a popularity fallback over users served
    pub fallback_share: f64,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Score `batch` against `holdout`.
///
/// Precision and recall only consider users that have held-out items;
/// coverage and fallback share consider every user in the batch.
pub fn evaluate(
    batch: &BTreeMap<UserId, Vec<Recommendation>>,
    holdout: &RatingSet,
    training_item_count: usize,
    fallback_users: usize,
) -> EvaluationReport {
    let mut report = EvaluationReport::default();

    for (user, held) in holdout.iter() {
        if held.is_empty() {
            continue;
        }
        report.users_evaluated += 1;
        report.held_out += held.len();

        let Some(recs) = batch.get(user) else {
            continue;
        };
        report.recommended += recs.len();
        report.hits += recs
            .iter()
            .filter(|rec| held.contains_key(&rec.item_id))
            .count();
    }

    let distinct: BTreeSet<&str> = batch
        .values()
        .flatten()
        .map(|rec| rec.item_id.as_str())
        .collect();

    report.precision = ratio(report.hits, report.recommended);
    report.recall = ratio(report.hits, report.held_out);
    report.coverage = ratio(distinct.len(), training_item_count);
    report.fallback_share = ratio(fallback_users, batch.len());
    report
}
