//! Ingestion collaborators
//!
//! Everything the engine reads is loaded up front through these sources, so
//! no I/O happens while similarities or recommendations are computed.

use sqlx::PgPool;
use std::path::PathBuf;
use tracing::{info, instrument};

use super::catalog::CatalogEntry;
use super::interactions::{InteractionRecord, RecordError};
use crate::database::{with_retry, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};
use crate::error::{Error, Result};

/// One parsed input row, or why it was rejected
pub type RecordResult = std::result::Result<InteractionRecord, RecordError>;

/// Supplies (user, item, weight) rows
#[async_trait::async_trait]
pub trait InteractionSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch every row; malformed rows are returned as errors, not dropped
    async fn fetch(&self) -> Result<Vec<RecordResult>>;
}

/// Supplies catalog rows for label derivation
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self) -> Result<Vec<CatalogEntry>>;
}

// ============================================================================
// CSV / in-memory interactions
// ============================================================================

/// `user,item,weight` file with one header line
#[derive(Debug, Clone)]
pub struct CsvInteractionSource {
    path: PathBuf,
}

impl CsvInteractionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Parse `user,item,weight` CSV with one header row.
///
/// Rows with the wrong number of fields are kept as errors so the store can
/// count them.
pub fn parse_csv<R: std::io::Read>(input: R) -> Vec<RecordResult> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input)
        .records()
        .map(|row| match row {
            Ok(record) => InteractionRecord::from_csv_record(&record),
            Err(e) => Err(RecordError::Unreadable {
                message: e.to_string(),
            }),
        })
        .collect()
}

#[async_trait::async_trait]
impl InteractionSource for CsvInteractionSource {
    fn name(&self) -> &'static str {
        "csv"
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn fetch(&self) -> Result<Vec<RecordResult>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        let rows = parse_csv(bytes.as_slice());
        info!(rows = rows.len(), "Read interactions from CSV");
        Ok(rows)
    }
}

/// Fixed rows held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryInteractionSource {
    rows: Vec<InteractionRecord>,
}

impl MemoryInteractionSource {
    pub fn new(rows: Vec<InteractionRecord>) -> Self {
        Self { rows }
    }
}

#[async_trait::async_trait]
impl InteractionSource for MemoryInteractionSource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self) -> Result<Vec<RecordResult>> {
        Ok(self.rows.iter().cloned().map(Ok).collect())
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

const WISHLIST_QUERY: &str =
    "SELECT user_id::TEXT AS user_id, video_id::TEXT AS video_id FROM myapp_wishlist";

const CATALOG_QUERY: &str = "SELECT id::TEXT AS item_id, category, video_type AS sub_type, title \
     FROM study_clean WHERE category IS NOT NULL";

#[derive(Debug, sqlx::FromRow)]
struct WishlistRow {
    user_id: Option<String>,
    video_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct CatalogRow {
    item_id: String,
    category: Option<String>,
    sub_type: Option<String>,
    title: Option<String>,
}

/// Wishlist table; every row is an interaction of fixed weight
#[derive(Clone)]
pub struct PgInteractionSource {
    pool: PgPool,
    weight: f64,
}

impl PgInteractionSource {
    pub fn new(pool: PgPool, weight: f64) -> Self {
        Self { pool, weight }
    }

    fn to_record(&self, row: WishlistRow) -> RecordResult {
        match (row.user_id, row.video_id) {
            (Some(user), Some(item)) => InteractionRecord::checked(&user, &item, self.weight),
            (None, _) => Err(RecordError::EmptyUser),
            (_, None) => Err(RecordError::EmptyItem),
        }
    }
}

#[async_trait::async_trait]
impl InteractionSource for PgInteractionSource {
    fn name(&self) -> &'static str {
        "database"
    }

    #[instrument(skip(self))]
    async fn fetch(&self) -> Result<Vec<RecordResult>> {
        let pool = &self.pool;
        let rows: Vec<WishlistRow> = with_retry(
            move || async move {
                sqlx::query_as::<_, WishlistRow>(WISHLIST_QUERY)
                    .fetch_all(pool)
                    .await
                    .map_err(Error::from)
            },
            DEFAULT_MAX_RETRIES,
            DEFAULT_RETRY_DELAY,
        )
        .await?;

        info!(rows = rows.len(), "Read wishlist interactions");
        Ok(rows.into_iter().map(|row| self.to_record(row)).collect())
    }
}

/// Video catalog table
#[derive(Clone)]
pub struct PgCatalogSource {
    pool: PgPool,
}

impl PgCatalogSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CatalogSource for PgCatalogSource {
    fn name(&self) -> &'static str {
        "database"
    }

    #[instrument(skip(self))]
    async fn fetch(&self) -> Result<Vec<CatalogEntry>> {
        let pool = &self.pool;
        let rows: Vec<CatalogRow> = with_retry(
            move || async move {
                sqlx::query_as::<_, CatalogRow>(CATALOG_QUERY)
                    .fetch_all(pool)
                    .await
                    .map_err(Error::from)
            },
            DEFAULT_MAX_RETRIES,
            DEFAULT_RETRY_DELAY,
        )
        .await?;

        info!(rows = rows.len(), "Read video catalog");
        Ok(rows
            .into_iter()
            .map(|row| CatalogEntry {
                item_id: row.item_id,
                category: row.category,
                sub_type: row.sub_type,
                title: row.title,
            })
            .collect())
    }
}

// ============================================================================
// JSON / empty catalog
// ============================================================================

/// JSON array of catalog entries
#[derive(Debug, Clone)]
pub struct JsonCatalogSource {
    path: PathBuf,
}

impl JsonCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl CatalogSource for JsonCatalogSource {
    fn name(&self) -> &'static str {
        "json"
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn fetch(&self) -> Result<Vec<CatalogEntry>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&text)?;
        info!(entries = entries.len(), "Read catalog from JSON");
        Ok(entries)
    }
}

/// No catalog: content signals stay empty
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCatalogSource;

#[async_trait::async_trait]
impl CatalogSource for EmptyCatalogSource {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn fetch(&self) -> Result<Vec<CatalogEntry>> {
        Ok(Vec::new())
    }
}
