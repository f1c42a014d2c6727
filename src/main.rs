//! VidRec batch engine
//!
//! Computes personalized video recommendations once and replaces the stored
//! set. Meant to be invoked by a scheduler.
//!
//! # Pipeline
//!
//! - **Fetch**: wishlist interactions (or a CSV) and the video catalog
//! - **Build**: training/held-out split, label profiles, similarity matrix
//! - **Recommend**: top-N per user from the K nearest neighbors
//! - **Persist**: replace `video_recommendations` in one transaction
//!
//! # Graceful Shutdown
//!
//! SIGTERM and SIGINT cancel the run at the next phase boundary. The stored
//! recommendations are only replaced in the final phase, so an aborted run
//! leaves them untouched.

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vidrec::config::{CatalogSourceKind, Config, InteractionSourceKind, LogFormat};
use vidrec::database::{self, Database};
use vidrec::recommendation::{
    BatchReport, BatchRunner, BatchSettings, CatalogSource, CsvInteractionSource,
    EmptyCatalogSource, InMemorySink, InteractionSource, JsonCatalogSource, KeywordTable,
    LabelPolicy, PgCatalogSource, PgInteractionSource, PgRecommendationSink, RecommendationSink,
};
use vidrec::{Error, Result};

#[tokio::main]
async fn main() {
    // Loading the config first picks up LOG_FORMAT from .env or FFOLDER
    let config = Config::from_env();
    init_tracing(match &config {
        Ok(config) => config.log_format,
        Err(_) => LogFormat::from_env(),
    });

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 VidRec Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(report) => {
            info!("  Users served:      {}", report.users);
            info!("  Rows written:      {}", report.persisted.inserted);
            info!("  Held-out precision {:.4}", report.evaluation.precision);
            info!("  Held-out recall    {:.4}", report.evaluation.recall);
            info!("═══════════════════════════════════════════════════════════════");
            info!("👋 VidRec Engine finished in {}ms", report.elapsed_ms);
        }
        Err(e) => {
            error!(code = e.error_code(), "❌ Batch run failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<BatchReport> {
    config.log_summary();
    info!("✅ Configuration loaded and validated");

    let db = if config.needs_database() {
        let db = Database::new(&config.database).await?;
        info!("✅ Database connection pool established");
        if config.database.run_migrations {
            info!("📦 Running database migrations...");
            database::run_migrations(db.pool()).await?;
            info!("✅ Database migrations applied");
        }
        Some(db)
    } else {
        info!("💾 No database collaborators configured");
        None
    };

    let runner = build_runner(&config, db.as_ref())?;
    let cancel = runner.cancellation_token();

    let signal_watcher = tokio::spawn(async move {
        shutdown_signal().await;
        info!("📴 Shutdown signal received, cancelling at the next phase");
        cancel.cancel();
    });

    let result = runner.run(None).await;
    signal_watcher.abort();

    if let Some(db) = db {
        db.close().await;
    }
    result
}

fn build_runner(config: &Config, db: Option<&Database>) -> Result<BatchRunner> {
    let pool = || {
        db.map(|db| db.pool().clone())
            .ok_or_else(|| Error::config("database collaborator configured without a pool"))
    };

    let interactions: Arc<dyn InteractionSource> = match config.ingestion.interactions {
        InteractionSourceKind::Database => Arc::new(PgInteractionSource::new(
            pool()?,
            config.ingestion.wishlist_weight,
        )),
        InteractionSourceKind::Csv => {
            Arc::new(CsvInteractionSource::new(&config.ingestion.interactions_csv))
        }
    };

    let catalog: Arc<dyn CatalogSource> = match config.ingestion.catalog {
        CatalogSourceKind::Database => Arc::new(PgCatalogSource::new(pool()?)),
        CatalogSourceKind::Json => Arc::new(JsonCatalogSource::new(&config.ingestion.catalog_json)),
        CatalogSourceKind::None => Arc::new(EmptyCatalogSource),
    };

    let sink: Arc<dyn RecommendationSink> = if config.persistence.dry_run {
        warn!("🧪 Dry run: recommendations stay in memory");
        Arc::new(InMemorySink::with_batch_size(config.persistence.batch_size))
    } else {
        Arc::new(PgRecommendationSink::new(pool()?, config.persistence.batch_size))
    };

    let keywords = match &config.ingestion.keyword_table {
        Some(path) => KeywordTable::from_file(path)?,
        None => KeywordTable::default(),
    };
    let policy = LabelPolicy::new(config.ingestion.category_delimiter.clone(), keywords);

    info!(
        "🔧 Sources: interactions={}, catalog={}, sink={}",
        interactions.name(),
        catalog.name(),
        sink.name()
    );

    Ok(BatchRunner::new(
        interactions,
        catalog,
        sink,
        BatchSettings::from(&config.recommendation),
    )
    .with_label_policy(policy))
}

/// Initialize structured logging with tracing
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("vidrec=debug,vidrec_engine=debug,sqlx=warn,info")
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(std::env::var("NO_COLOR").is_err()),
            )
            .init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
