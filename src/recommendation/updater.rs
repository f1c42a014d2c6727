//! Batch Runner
//!
//! One scheduled run: fetch inputs, build the engine, recommend for every
//! user, evaluate against the held-out split, then replace the stored
//! recommendations. The sink is only touched in the last phase, so a run
//! cancelled earlier leaves the previous recommendations intact.

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::catalog::{ItemMetadata, LabelPolicy};
use super::engine::{CategoryBoost, EngineOptions, Recommendation, RecommendationEngine};
use super::interactions::{InteractionStore, LoadStats, SplitConfig, UserId};
use super::metrics::{evaluate, EvaluationReport, PerformanceTimer};
use super::similarity::{SimilarityMetric, SimilarityStats};
use super::sink::{PersistReport, RecommendationSink};
use super::sources::{CatalogSource, InteractionSource};
use crate::config::RecommendationConfig;
use crate::error::{Error, Result};

/// Recommendations grouped by user, plus how many users took each path
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    pub recommendations: BTreeMap<UserId, Vec<Recommendation>>,
    pub paths: BTreeMap<&'static str, usize>,
    pub fallback_users: usize,
}

/// Recommend for every user in `users` with up to `k` neighbors and `n` items.
///
/// Every row of one batch carries the same timestamp.
pub fn run_batch(
    engine: &RecommendationEngine,
    users: &[UserId],
    k: usize,
    n: usize,
) -> BTreeMap<UserId, Vec<Recommendation>> {
    recommend_all(engine, users, k, n).recommendations
}

fn recommend_all(engine: &RecommendationEngine, users: &[UserId], k: usize, n: usize) -> BatchOutput {
    let created_at = Utc::now();

    let results: Vec<_> = users
        .par_iter()
        .map(|user| {
            let (items, trace) = engine.recommend_traced(user, k, n);
            let recs: Vec<Recommendation> = items
                .into_iter()
                .map(|item| item.into_recommendation(user, created_at))
                .collect();
            (user.clone(), recs, trace.path)
        })
        .collect();

    let mut output = BatchOutput::default();
    for (user, recs, path) in results {
        if output.recommendations.insert(user, recs).is_some() {
            continue;
        }
        *output.paths.entry(path.as_str()).or_insert(0) += 1;
        if path.is_fallback() {
            output.fallback_users += 1;
        }
    }
    output
}

/// Everything needed to turn inputs into an engine
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub neighbors: usize,
    pub limit: usize,
    pub split: SplitConfig,
    pub metric: SimilarityMetric,
    pub options: EngineOptions,
    /// Category re-ranking layer, when enabled
    pub category_boost: Option<CategoryBoost>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from(&RecommendationConfig::default())
    }
}

impl From<&RecommendationConfig> for BatchSettings {
    fn from(config: &RecommendationConfig) -> Self {
        let split = match config.split_seed {
            Some(seed) => SplitConfig::seeded(config.split_ratio, seed),
            None => SplitConfig::new(config.split_ratio),
        };
        let category_boost = config.category_boost.then(|| CategoryBoost {
            own: config.boost_own,
            neighbor: config.boost_neighbor,
            top_labels: config.top_labels,
        });

        Self {
            neighbors: config.neighbors,
            limit: config.limit,
            split,
            metric: config.metric.clone(),
            options: EngineOptions::from(config),
            category_boost,
        }
    }
}

/// Summary of one finished run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub load: LoadStats,
    pub catalog_items: usize,
    pub similarity: SimilarityStats,
    pub users: usize,
    pub rows: usize,
    pub paths: BTreeMap<&'static str, usize>,
    pub evaluation: EvaluationReport,
    pub persisted: PersistReport,
    pub elapsed_ms: u64,
}

/// Drives one batch run against injected sources and sink
pub struct BatchRunner {
    interactions: Arc<dyn InteractionSource>,
    catalog: Arc<dyn CatalogSource>,
    sink: Arc<dyn RecommendationSink>,
    policy: LabelPolicy,
    settings: BatchSettings,
    cancel: CancellationToken,
}

impl BatchRunner {
    pub fn new(
        interactions: Arc<dyn InteractionSource>,
        catalog: Arc<dyn CatalogSource>,
        sink: Arc<dyn RecommendationSink>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            interactions,
            catalog,
            sink,
            policy: LabelPolicy::default(),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_label_policy(mut self, policy: LabelPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that aborts the run at the next phase boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn checkpoint(&self, phase: &'static str) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!(phase, "Batch run cancelled");
            return Err(Error::Cancelled { phase });
        }
        Ok(())
    }

    /// Run once. `users` limits who gets recommendations; by default every
    /// user seen in either split is served.
    #[instrument(skip_all, fields(
        interactions = self.interactions.name(),
        catalog = self.catalog.name(),
        sink = self.sink.name(),
    ))]
    pub async fn run(&self, users: Option<Vec<UserId>>) -> Result<BatchReport> {
        let started = Instant::now();

        // ====================================================================
        // Fetch
        // ====================================================================
        self.checkpoint("fetch")?;
        let (records, entries) = {
            let _timer = PerformanceTimer::new("fetch");
            tokio::try_join!(self.interactions.fetch(), self.catalog.fetch())?
        };

        // ====================================================================
        // Build store, profiles and similarity matrix
        // ====================================================================
        self.checkpoint("build")?;
        let settings = self.settings.clone();
        let policy = self.policy.clone();
        let (engine, similarity, catalog_items) = {
            let _timer = PerformanceTimer::new("build");
            tokio::task::spawn_blocking(move || -> Result<_> {
                let store = InteractionStore::load(records, settings.split)?;
                let metadata = ItemMetadata::from_entries(&entries, &policy);
                let catalog_items = metadata.len();

                let (mut engine, similarity) =
                    RecommendationEngine::build(store, metadata, &settings.metric, settings.options);
                if let Some(boost) = settings.category_boost {
                    engine = engine.with_boost(boost);
                }
                Ok((engine, similarity, catalog_items))
            })
            .await??
        };

        let load = engine.store().stats().clone();
        info!(
            training = load.training_records,
            holdout = load.holdout_records,
            skipped = load.skipped,
            catalog_items,
            "📥 Interactions loaded"
        );

        // ====================================================================
        // Recommend
        // ====================================================================
        self.checkpoint("recommend")?;
        let engine = Arc::new(engine);
        let users = match users {
            Some(users) => users,
            None => {
                let store = engine.store();
                let mut all: BTreeSet<UserId> = store.training().users().into_iter().collect();
                all.extend(store.holdout().users());
                all.into_iter().collect()
            }
        };
        let (k, n) = (self.settings.neighbors, self.settings.limit);
        let output = {
            let _timer = PerformanceTimer::new("recommend");
            let engine = Arc::clone(&engine);
            tokio::task::spawn_blocking(move || recommend_all(&engine, &users, k, n)).await?
        };

        let rows: Vec<Recommendation> = output
            .recommendations
            .values()
            .flatten()
            .cloned()
            .collect();
        info!(
            users = output.recommendations.len(),
            rows = rows.len(),
            fallback = output.fallback_users,
            "🎯 Recommendations generated"
        );

        // ====================================================================
        // Evaluate
        // ====================================================================
        let evaluation = evaluate(
            &output.recommendations,
            engine.store().holdout(),
            engine.store().training().items().len(),
            output.fallback_users,
        );
        info!(
            users = evaluation.users_evaluated,
            precision = evaluation.precision,
            recall = evaluation.recall,
            coverage = evaluation.coverage,
            fallback_share = evaluation.fallback_share,
            "📊 Held-out evaluation"
        );

        // ====================================================================
        // Persist
        // ====================================================================
        self.checkpoint("persist")?;
        let persisted = {
            let _timer = PerformanceTimer::new("persist");
            self.sink.replace_all(&rows).await?
        };

        let report = BatchReport {
            load,
            catalog_items,
            similarity,
            users: output.recommendations.len(),
            rows: rows.len(),
            paths: output.paths,
            evaluation,
            persisted,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            users = report.users,
            rows = report.rows,
            elapsed_ms = report.elapsed_ms,
            "✅ Batch run complete"
        );
        Ok(report)
    }
}
