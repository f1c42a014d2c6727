use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use vidrec::recommendation::{
    BatchRunner, BatchSettings, CsvInteractionSource, EmptyCatalogSource, EngineOptions,
    InMemorySink, JsonCatalogSource, Recommendation, RecommendationSink, SimilarityMetric,
    SplitConfig,
};
use vidrec::recommendation::sink::PersistReport;
use vidrec::{Error, Result};

const EPS: f64 = 1e-9;

fn csv_file(lines: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "user_id,video_id,rating").unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file
}

fn settings(metric: SimilarityMetric) -> BatchSettings {
    BatchSettings {
        neighbors: 2,
        limit: 2,
        split: SplitConfig::training_only(),
        metric,
        options: EngineOptions::default(),
        category_boost: None,
    }
}

struct FailingSink;

#[async_trait::async_trait]
impl RecommendationSink for FailingSink {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn replace_all(&self, recommendations: &[Recommendation]) -> Result<PersistReport> {
        Err(Error::persistence(
            0,
            recommendations.len(),
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        ))
    }
}

#[tokio::test]
async fn csv_to_memory_sink() {
    let csv = csv_file(&["u1,a,5", "u1,b,3", "u2,a,5", "u2,c,4", "u3,b,3", "bad,row", "u4,,2"]);
    let sink = Arc::new(InMemorySink::new());

    let report = BatchRunner::new(
        Arc::new(CsvInteractionSource::new(csv.path())),
        Arc::new(EmptyCatalogSource),
        sink.clone(),
        settings(SimilarityMetric::Cooccurrence),
    )
    .run(None)
    .await
    .unwrap();

    assert_eq!(report.load.training_records, 5);
    assert_eq!(report.load.skipped, 2);
    assert_eq!(report.users, 3);

    let rows = sink.snapshot().await;
    let u1: Vec<_> = rows.iter().filter(|r| r.user_id == "u1").collect();
    assert_eq!(u1.len(), 1);
    assert_eq!(u1[0].item_id, "c");
    assert!((u1[0].score - 5.0).abs() < EPS);

    // Watched items never come back
    for row in &rows {
        let watched = match row.user_id.as_str() {
            "u1" => &["a", "b"][..],
            "u2" => &["a", "c"][..],
            "u3" => &["b"][..],
            other => panic!("unexpected user {other}"),
        };
        assert!(!watched.contains(&row.item_id.as_str()));
    }

    let stamps: BTreeSet<_> = rows.iter().map(|r| r.created_at).collect();
    assert_eq!(stamps.len(), 1);
}

#[tokio::test]
async fn catalog_labels_feed_content_similarity() {
    let csv = csv_file(&["u1,1,5", "u2,2,5", "u2,3,5"]);
    let mut catalog = tempfile::NamedTempFile::new().unwrap();
    write!(
        catalog,
        r#"[
            {{"id": "1", "category": "游戏"}},
            {{"id": "2", "category": "游戏"}},
            {{"id": "3", "category": "音乐"}}
        ]"#
    )
    .unwrap();
    let sink = Arc::new(InMemorySink::new());

    let report = BatchRunner::new(
        Arc::new(CsvInteractionSource::new(csv.path())),
        Arc::new(JsonCatalogSource::new(catalog.path())),
        sink.clone(),
        settings(SimilarityMetric::ContentCosine),
    )
    .run(None)
    .await
    .unwrap();

    assert_eq!(report.catalog_items, 3);
    assert_eq!(report.similarity.retained, 1);

    let rows = sink.snapshot().await;
    let top_for_u1 = rows.iter().find(|r| r.user_id == "u1").unwrap();
    assert_eq!(top_for_u1.item_id, "2");
    assert!((top_for_u1.score - 5.0).abs() < EPS);
}

#[tokio::test]
async fn failing_sink_surfaces_persistence_error() {
    let csv = csv_file(&["u1,a,5", "u2,a,5", "u2,b,1"]);

    let err = BatchRunner::new(
        Arc::new(CsvInteractionSource::new(csv.path())),
        Arc::new(EmptyCatalogSource),
        Arc::new(FailingSink),
        settings(SimilarityMetric::Jaccard),
    )
    .run(None)
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Persistence { batch: 0, .. }));
    assert_eq!(err.error_code(), "PERSISTENCE_ERROR");
}

#[tokio::test]
async fn cancellation_never_reaches_the_sink() {
    let csv = csv_file(&["u1,a,5"]);
    let runner = BatchRunner::new(
        Arc::new(CsvInteractionSource::new(csv.path())),
        Arc::new(EmptyCatalogSource),
        Arc::new(FailingSink),
        settings(SimilarityMetric::default()),
    );
    runner.cancellation_token().cancel();

    let err = runner.run(None).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
}

#[tokio::test]
async fn empty_input_writes_nothing() {
    let csv = csv_file(&[]);
    let sink = Arc::new(InMemorySink::new());

    let report = BatchRunner::new(
        Arc::new(CsvInteractionSource::new(csv.path())),
        Arc::new(EmptyCatalogSource),
        sink.clone(),
        settings(SimilarityMetric::Pearson { min_common: 2 }),
    )
    .run(None)
    .await
    .unwrap();

    assert_eq!(report.users, 0);
    assert_eq!(report.rows, 0);
    assert_eq!(report.persisted.inserted, 0);
    assert!(sink.snapshot().await.is_empty());
}
