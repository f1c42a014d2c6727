//! Recommendation Module
//!
//! User-based collaborative filtering over video interactions.
//!
//! ## Architecture
//!
//! 1. **Interactions** - Parse records and split them into training and held-out sets
//! 2. **Catalog** - Derive weighted labels for items from category, sub-type and title
//! 3. **Profiles** - Aggregate item labels into per-user interest profiles
//! 4. **Similarity** - Build the sparse user × user similarity matrix
//! 5. **Engine** - Rank unseen items from the nearest neighbors, with fallbacks
//! 6. **Updater** - Run the whole pipeline once and replace the stored results
//!
//! ## Scoring Overview
//!
//! Each neighbor contributes `similarity × weight` for every item the user has
//! not seen, optionally boosted when the item's category matches the user's or
//! the neighbor's top labels. Content matches are merged in at a discount and
//! the final list is scaled so its best item scores 5.0. Users with no usable
//! signal get the most popular unseen items instead.

pub mod catalog;
pub mod engine;
pub mod interactions;
pub mod metrics;
pub mod profiles;
pub mod similarity;
pub mod sink;
pub mod sources;
pub mod updater;

pub use catalog::{CatalogEntry, ItemMetadata, KeywordTable, LabelPolicy};
pub use engine::{
    CandidateBoost, CategoryBoost, EngineOptions, Recommendation, RecommendationEngine,
    RecommendationPath, RecommendationTrace, ScoredItem, MAX_SCORE,
};
pub use interactions::{InteractionRecord, InteractionStore, RatingSet, RecordError, SplitConfig};
pub use metrics::{evaluate, EvaluationReport};
pub use similarity::{SimilarityMatrix, SimilarityMetric, SimilarityStats};
pub use sink::{InMemorySink, PgRecommendationSink, RecommendationSink};
pub use sources::{
    CatalogSource, CsvInteractionSource, EmptyCatalogSource, InteractionSource,
    JsonCatalogSource, PgCatalogSource, PgInteractionSource,
};
pub use updater::{run_batch, BatchReport, BatchRunner, BatchSettings};
