//! Persistence collaborators
//!
//! A sink replaces every stored recommendation with a new batch. Readers see
//! either the old set or the new one, never a mix.

use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use super::engine::Recommendation;
use crate::database::Transaction;
use crate::error::{Error, Result};

/// Postgres allows at most 65535 bind parameters per statement; each row binds 4
const MAX_ROWS_PER_STATEMENT: usize = u16::MAX as usize / 4;

/// Outcome of one replace-all write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    /// Rows discarded from the previous run
    pub deleted: u64,
    pub inserted: u64,
    pub batches: usize,
}

/// Replace-all store for recommendations
#[async_trait::async_trait]
pub trait RecommendationSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Atomically discard all previous rows and write `recommendations`
    async fn replace_all(&self, recommendations: &[Recommendation]) -> Result<PersistReport>;
}

/// `video_recommendations` table, rewritten inside one transaction
#[derive(Clone)]
pub struct PgRecommendationSink {
    pool: PgPool,
    batch_size: usize,
}

impl PgRecommendationSink {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.clamp(1, MAX_ROWS_PER_STATEMENT),
        }
    }

    async fn write(
        &self,
        tx: &mut Transaction<'_>,
        recommendations: &[Recommendation],
    ) -> Result<PersistReport> {
        let deleted = sqlx::query("DELETE FROM video_recommendations")
            .execute(tx.conn())
            .await?
            .rows_affected();

        let mut report = PersistReport {
            deleted,
            ..PersistReport::default()
        };

        for (batch, chunk) in recommendations.chunks(self.batch_size).enumerate() {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO video_recommendations (user_id, item_id, score, created_at) ",
            );
            query.push_values(chunk, |mut row, rec| {
                row.push_bind(rec.user_id.as_str())
                    .push_bind(rec.item_id.as_str())
                    .push_bind(rec.score)
                    .push_bind(rec.created_at);
            });

            let result = query
                .build()
                .execute(tx.conn())
                .await
                .map_err(|e| Error::persistence(batch, chunk.len(), e))?;

            report.inserted += result.rows_affected();
            report.batches += 1;
        }

        Ok(report)
    }
}

#[async_trait::async_trait]
impl RecommendationSink for PgRecommendationSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, recommendations), fields(rows = recommendations.len()))]
    async fn replace_all(&self, recommendations: &[Recommendation]) -> Result<PersistReport> {
        let mut tx = Transaction::begin(&self.pool).await?;

        match self.write(&mut tx, recommendations).await {
            Ok(report) => {
                tx.commit().await?;
                info!(
                    deleted = report.deleted,
                    inserted = report.inserted,
                    batches = report.batches,
                    "Recommendations replaced"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Recommendation write failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Keeps the latest batch in memory
#[derive(Debug, Default)]
pub struct InMemorySink {
    rows: Mutex<Vec<Recommendation>>,
    batch_size: usize,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::with_batch_size(1000)
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
        }
    }

    /// Copy of the stored rows
    pub async fn snapshot(&self) -> Vec<Recommendation> {
        self.rows.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl RecommendationSink for InMemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn replace_all(&self, recommendations: &[Recommendation]) -> Result<PersistReport> {
        let mut rows = self.rows.lock().await;
        let deleted = rows.len() as u64;
        *rows = recommendations.to_vec();

        Ok(PersistReport {
            deleted,
            inserted: recommendations.len() as u64,
            batches: recommendations.len().div_ceil(self.batch_size.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rec(user: &str, item: &str, score: f64) -> Recommendation {
        Recommendation {
            user_id: user.to_string(),
            item_id: item.to_string(),
            score,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_sink_replaces_everything() {
        let sink = InMemorySink::with_batch_size(2);

        let first = sink
            .replace_all(&[rec("u1", "a", 5.0), rec("u2", "b", 5.0), rec("u2", "c", 2.5)])
            .await
            .unwrap();
        assert_eq!(first.deleted, 0);
        assert_eq!(first.inserted, 3);
        assert_eq!(first.batches, 2);

        let second = sink.replace_all(&[rec("u3", "d", 5.0)]).await.unwrap();
        assert_eq!(second.deleted, 3);

        let rows = sink.snapshot().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, "u3");
    }

    #[test]
    fn test_in_memory_sink_empty_batch() {
        let sink = InMemorySink::new();
        tokio_test::block_on(async {
            sink.replace_all(&[rec("u1", "a", 5.0)]).await.unwrap();
            let report = sink.replace_all(&[]).await.unwrap();
            assert_eq!(report.batches, 0);
            assert!(sink.snapshot().await.is_empty());
        });
    }

    #[tokio::test]
    async fn test_batch_size_is_clamped() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/vidrec_test")
            .unwrap();
        assert_eq!(PgRecommendationSink::new(pool.clone(), 0).batch_size, 1);
        assert_eq!(
            PgRecommendationSink::new(pool, 1_000_000).batch_size,
            MAX_ROWS_PER_STATEMENT
        );
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_postgres_sink_rolls_back_failed_batch() {
        let pool = PgPool::connect(&std::env::var("DATABASE_URL").unwrap())
            .await
            .unwrap();
        crate::database::run_migrations(&pool).await.unwrap();
        let sink = PgRecommendationSink::new(pool.clone(), 1);

        sink.replace_all(&[rec("u1", "a", 5.0), rec("u1", "b", 2.0)])
            .await
            .unwrap();

        // Postgres rejects NUL bytes in text, so the third batch fails
        let err = sink
            .replace_all(&[rec("u2", "c", 5.0), rec("u2", "d", 4.0), rec("u2\0", "e", 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence { batch: 2, rows: 1, .. }));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM video_recommendations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
