//! Configuration management for the VidRec engine
//!
//! Strongly-typed configuration loaded from environment variables, with
//! validation and defaults suitable for a nightly batch run.
//!
//! # Example
//! ```no_run
//! use vidrec::Config;
//! let config = Config::from_env().expect("failed to load config");
//! println!("neighbors: {}", config.recommendation.neighbors);
//! ```

use crate::error::{Error, Result};
use crate::recommendation::similarity::SimilarityMetric;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Where interactions and catalog entries come from
    pub ingestion: IngestionConfig,
    /// Similarity and scoring parameters
    pub recommendation: RecommendationConfig,
    /// Where recommendations are written
    pub persistence: PersistenceConfig,
    /// Log output format
    pub log_format: LogFormat,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Minimum connections to keep open
    pub min_connections: u32,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Idle timeout for connections
    pub idle_timeout: Duration,
    /// Maximum lifetime for connections
    pub max_lifetime: Duration,
    /// Statement cache capacity per connection
    pub statement_cache_size: usize,
    /// Apply bundled migrations on startup
    pub run_migrations: bool,
}

/// Interaction source selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionSourceKind {
    Database,
    Csv,
}

/// Catalog source selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSourceKind {
    Database,
    Json,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Ingestion configuration
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub interactions: InteractionSourceKind,
    /// CSV path used when `interactions` is `Csv`
    pub interactions_csv: PathBuf,
    /// Weight assigned to every wishlist row
    pub wishlist_weight: f64,
    pub catalog: CatalogSourceKind,
    /// JSON path used when `catalog` is `Json`
    pub catalog_json: PathBuf,
    /// Optional TOML file replacing the default keyword table
    pub keyword_table: Option<PathBuf>,
    /// Delimiter for compound category strings
    pub category_delimiter: String,
}

/// Recommendation engine configuration
#[derive(Debug, Clone)]
pub struct RecommendationConfig {
    /// Neighbors per user (K)
    pub neighbors: usize,
    /// Recommendations per user (N)
    pub limit: usize,
    /// Probability that a record lands in the training set
    pub split_ratio: f64,
    /// Optional seed for a reproducible split
    pub split_seed: Option<u64>,
    /// Similarity metric, fully resolved
    pub metric: SimilarityMetric,
    /// Merge content-based candidates into the collaborative list
    pub content_blend: bool,
    /// Discount applied to content-only candidates
    pub content_discount: f64,
    /// Apply the category re-ranking layer
    pub category_boost: bool,
    pub boost_own: f64,
    pub boost_neighbor: f64,
    /// Size of the "top labels" sets used by the category boost
    pub top_labels: usize,
}

/// Persistence configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Rows per bulk insert statement
    pub batch_size: usize,
    /// Compute and evaluate, but keep results in memory
    pub dry_run: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Does not log; call [`log_summary`](Self::log_summary) once tracing is up.
    pub fn from_env() -> Result<Self> {
        // Platforms that mount secrets as files point FFOLDER at a directory
        // where each file name is a variable name and its contents the value.
        if let Ok(folder) = std::env::var("FFOLDER") {
            load_env_folder(&folder);
        } else {
            // Try to load .env file (ignore if not found)
            dotenvy::dotenv().ok();
        }

        let config = Self {
            database: DatabaseConfig::from_env()?,
            ingestion: IngestionConfig::from_env()?,
            recommendation: RecommendationConfig::from_env()?,
            persistence: PersistenceConfig::from_env()?,
            log_format: LogFormat::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Whether any configured collaborator needs a database connection
    pub fn needs_database(&self) -> bool {
        self.ingestion.interactions == InteractionSourceKind::Database
            || self.ingestion.catalog == CatalogSourceKind::Database
            || !self.persistence.dry_run
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections < self.database.min_connections {
            return Err(Error::InvalidConfig {
                key: "DB_MAX_CONNECTIONS",
                message: "max_connections must be >= min_connections".into(),
            });
        }

        let rec = &self.recommendation;
        if !(0.0..=1.0).contains(&rec.split_ratio) {
            return Err(Error::InvalidConfig {
                key: "REC_SPLIT_RATIO",
                message: format!("{} is outside [0, 1]", rec.split_ratio).into(),
            });
        }

        validate_metric(&rec.metric)?;

        if !(rec.content_discount >= 0.0 && rec.content_discount.is_finite()) {
            return Err(Error::InvalidConfig {
                key: "REC_CONTENT_DISCOUNT",
                message: "discount must be a non-negative number".into(),
            });
        }

        for (key, boost) in [
            ("REC_BOOST_OWN", rec.boost_own),
            ("REC_BOOST_NEIGHBOR", rec.boost_neighbor),
        ] {
            if !(boost >= 1.0 && boost.is_finite()) {
                return Err(Error::InvalidConfig {
                    key,
                    message: format!("boost {} must be >= 1.0", boost).into(),
                });
            }
        }

        if !(self.ingestion.wishlist_weight > 0.0 && self.ingestion.wishlist_weight.is_finite()) {
            return Err(Error::InvalidConfig {
                key: "WISHLIST_WEIGHT",
                message: "weight must be positive".into(),
            });
        }

        if self.ingestion.category_delimiter.is_empty() {
            return Err(Error::InvalidConfig {
                key: "REC_CATEGORY_DELIMITER",
                message: "delimiter cannot be empty".into(),
            });
        }

        if self.persistence.batch_size == 0 {
            return Err(Error::InvalidConfig {
                key: "REC_PERSIST_BATCH_SIZE",
                message: "batch size must be at least 1".into(),
            });
        }

        Ok(())
    }

    /// Log configuration summary (without sensitive data)
    pub fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  Database:");
        info!("    URL: {}", mask_url(&self.database.url));
        info!(
            "    Pool Size: {}-{}",
            self.database.min_connections, self.database.max_connections
        );
        info!("  Ingestion:");
        info!("    Interactions: {:?}", self.ingestion.interactions);
        info!("    Catalog: {:?}", self.ingestion.catalog);
        info!("  Recommendation:");
        info!("    Metric: {}", self.recommendation.metric);
        info!(
            "    K={} N={} split={}",
            self.recommendation.neighbors,
            self.recommendation.limit,
            self.recommendation.split_ratio
        );
        info!(
            "    Content blend: {}, category boost: {}",
            self.recommendation.content_blend, self.recommendation.category_boost
        );
        info!("  Persistence:");
        info!("    Batch size: {}", self.persistence.batch_size);
        info!("    Dry run: {}", self.persistence.dry_run);
    }
}

/// Blend weights must be non-negative and sum to 1
fn validate_metric(metric: &SimilarityMetric) -> Result<()> {
    if let SimilarityMetric::Blended {
        behavioral,
        content,
        behavioral_weight,
        content_weight,
    } = metric
    {
        if *behavioral_weight < 0.0
            || *content_weight < 0.0
            || (behavioral_weight + content_weight - 1.0).abs() > 1e-9
        {
            return Err(Error::InvalidConfig {
                key: "REC_BLEND_WEIGHTS",
                message: format!(
                    "weights {},{} must be non-negative and sum to 1",
                    behavioral_weight, content_weight
                )
                .into(),
            });
        }
        validate_metric(behavioral)?;
        validate_metric(content)?;
    }
    Ok(())
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let url = get_env("DATABASE_URL").unwrap_or_else(|_| {
            let user = std::env::var("USER").unwrap_or_else(|_| "postgres".to_string());
            format!("postgres://{}@localhost/vidrec_dev", user)
        });

        Ok(Self {
            url,
            max_connections: get_env_parsed_or("DB_MAX_CONNECTIONS", 10)?,
            min_connections: get_env_parsed_or("DB_MIN_CONNECTIONS", 1)?,
            connect_timeout: Duration::from_secs(get_env_parsed_or("DB_CONNECT_TIMEOUT_SECS", 30)?),
            idle_timeout: Duration::from_secs(get_env_parsed_or("DB_IDLE_TIMEOUT_SECS", 600)?),
            max_lifetime: Duration::from_secs(get_env_parsed_or("DB_MAX_LIFETIME_SECS", 3600)?),
            statement_cache_size: get_env_parsed_or("DB_STATEMENT_CACHE_SIZE", 100)?,
            run_migrations: get_env_parsed_or("DB_RUN_MIGRATIONS", true)?,
        })
    }
}

impl IngestionConfig {
    fn from_env() -> Result<Self> {
        let interactions = match get_env_or("INTERACTIONS_SOURCE", "database")
            .to_lowercase()
            .as_str()
        {
            "database" | "db" => InteractionSourceKind::Database,
            "csv" => InteractionSourceKind::Csv,
            other => {
                return Err(Error::InvalidConfig {
                    key: "INTERACTIONS_SOURCE",
                    message: format!("unknown source '{}', expected database or csv", other)
                        .into(),
                })
            }
        };

        let catalog = match get_env_or("CATALOG_SOURCE", "database").to_lowercase().as_str() {
            "database" | "db" => CatalogSourceKind::Database,
            "json" => CatalogSourceKind::Json,
            "none" | "" => CatalogSourceKind::None,
            other => {
                return Err(Error::InvalidConfig {
                    key: "CATALOG_SOURCE",
                    message: format!("unknown source '{}', expected database, json or none", other)
                        .into(),
                })
            }
        };

        let keyword_table = {
            let s = get_env_or("REC_KEYWORD_TABLE", "");
            if s.is_empty() {
                None
            } else {
                Some(PathBuf::from(s))
            }
        };

        Ok(Self {
            interactions,
            interactions_csv: PathBuf::from(get_env_or("INTERACTIONS_CSV", "rating.csv")),
            wishlist_weight: get_env_parsed_or("WISHLIST_WEIGHT", 5.0)?,
            catalog,
            catalog_json: PathBuf::from(get_env_or("CATALOG_JSON", "catalog.json")),
            keyword_table,
            category_delimiter: get_env_or("REC_CATEGORY_DELIMITER", "/"),
        })
    }
}

impl RecommendationConfig {
    fn from_env() -> Result<Self> {
        let split_seed = match std::env::var("REC_SPLIT_SEED") {
            Ok(s) if !s.trim().is_empty() => Some(parse_value("REC_SPLIT_SEED", &s)?),
            _ => None,
        };

        Ok(Self {
            neighbors: get_env_parsed_or("REC_NEIGHBORS", 5)?,
            limit: get_env_parsed_or("REC_LIMIT", 8)?,
            split_ratio: get_env_parsed_or("REC_SPLIT_RATIO", 0.85)?,
            split_seed,
            metric: metric_from_env()?,
            content_blend: get_env_parsed_or("REC_CONTENT_BLEND", true)?,
            content_discount: get_env_parsed_or("REC_CONTENT_DISCOUNT", 0.5)?,
            category_boost: get_env_parsed_or("REC_CATEGORY_BOOST", true)?,
            boost_own: get_env_parsed_or("REC_BOOST_OWN", 2.0)?,
            boost_neighbor: get_env_parsed_or("REC_BOOST_NEIGHBOR", 1.5)?,
            top_labels: get_env_parsed_or("REC_TOP_LABELS", 5)?,
        })
    }
}

/// Resolve `REC_METRIC` and the knobs that parameterise it
fn metric_from_env() -> Result<SimilarityMetric> {
    let min_common: usize = get_env_parsed_or("REC_MIN_COMMON", 2)?;
    let base: SimilarityMetric = get_env_parsed_or("REC_METRIC", SimilarityMetric::default())?;

    let metric = match base {
        SimilarityMetric::Blended { content, .. } => {
            let behavioral: SimilarityMetric = get_env_parsed_or(
                "REC_BLEND_BEHAVIORAL",
                SimilarityMetric::Jaccard,
            )?;
            let (behavioral_weight, content_weight) =
                parse_weights(&get_env_or("REC_BLEND_WEIGHTS", "0.7,0.3"))?;
            SimilarityMetric::Blended {
                behavioral: Box::new(behavioral),
                content,
                behavioral_weight,
                content_weight,
            }
        }
        other => other,
    };

    Ok(metric.with_min_common(min_common))
}

fn parse_weights(value: &str) -> Result<(f64, f64)> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [b, c] => Ok((
            parse_value("REC_BLEND_WEIGHTS", b)?,
            parse_value("REC_BLEND_WEIGHTS", c)?,
        )),
        _ => Err(Error::InvalidConfig {
            key: "REC_BLEND_WEIGHTS",
            message: format!("expected 'behavioral,content', got '{}'", value).into(),
        }),
    }
}

impl PersistenceConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            batch_size: get_env_parsed_or("REC_PERSIST_BATCH_SIZE", 1000)?,
            dry_run: get_env_parsed_or("REC_DRY_RUN", false)?,
        })
    }
}

impl LogFormat {
    /// Read `LOG_FORMAT`
    pub fn from_env() -> Self {
        Self::from_name(&get_env_or("LOG_FORMAT", "text"))
    }

    /// Anything other than `json` means plain text
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            neighbors: 5,
            limit: 8,
            split_ratio: 0.85,
            split_seed: None,
            metric: SimilarityMetric::default(),
            content_blend: true,
            content_discount: 0.5,
            category_boost: true,
            boost_own: 2.0,
            boost_neighbor: 1.5,
            top_labels: 5,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            dry_run: false,
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Export every regular file in `folder` as an environment variable,
/// without overriding variables that are already set
fn load_env_folder(folder: &str) {
    let path = std::path::Path::new(folder);
    if !path.is_dir() {
        log::warn!("FFOLDER {} is not a directory", folder);
        return;
    }

    match std::fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let file = entry.path();
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if !file.is_file() || std::env::var(&name).is_ok() {
                    continue;
                }
                if let Ok(contents) = std::fs::read_to_string(&file) {
                    std::env::set_var(&name, contents.trim());
                }
            }
            log::info!("Loaded configuration from FFOLDER={}", folder);
        }
        Err(err) => {
            log::warn!("Failed to read FFOLDER {}: {}", folder, err);
        }
    }
}

/// Get required environment variable
fn get_env(key: &'static str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::MissingEnvVar { var: key })
}

/// Get environment variable with default
fn get_env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get and parse an optional environment variable.
///
/// Unset or blank falls back to `default`; a value that does not parse is an error.
fn get_env_parsed_or<T: FromStr>(key: &'static str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => parse_value(key, &value),
        _ => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| Error::InvalidConfig {
        key,
        message: format!("Invalid value '{}': {}", value, e).into(),
    })
}

/// Mask sensitive parts of URL
fn mask_url(url: &str) -> String {
    // Mask password if present
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let (before, after) = url.split_at(colon_pos + 1);
            let (_, rest) = after.split_at(at_pos - colon_pos - 1);
            return format!("{}****{}", before, rest);
        }
    }
    url.to_string()
}
