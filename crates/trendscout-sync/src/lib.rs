//! Scout run orchestration: fetch the top items, then persist them in one write.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, info_span, Instrument};
use trendscout_adapters::{
    fetch_top_trends, HackerNewsSource, ItemSource, DEFAULT_TOP_COUNT, HN_API_BASE,
};
use trendscout_core::Trend;
use trendscout_storage::{
    connect_pool, insert_trends, run_migrations, verify_schema, HttpClientConfig, HttpFetcher,
    PgConfig, SchemaReport,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendscout-sync";

#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub database_url: String,
    pub api_base: String,
    pub top_count: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
}

impl ScoutConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "postgres://blog:pw@localhost/blog".to_string()),
            api_base: lookup("HN_API_BASE").unwrap_or_else(|| HN_API_BASE.to_string()),
            top_count: parse_or(&lookup, "TRENDSCOUT_COUNT", DEFAULT_TOP_COUNT),
            user_agent: lookup("TRENDSCOUT_USER_AGENT")
                .unwrap_or_else(|| "trendscout/0.1".to_string()),
            http_timeout_secs: parse_or(&lookup, "TRENDSCOUT_HTTP_TIMEOUT_SECS", 20),
            db_max_connections: parse_or(&lookup, "TRENDSCOUT_DB_MAX_CONNECTIONS", 5),
            db_acquire_timeout_secs: parse_or(&lookup, "TRENDSCOUT_DB_ACQUIRE_TIMEOUT_SECS", 10),
        }
    }

    fn pg_config(&self) -> PgConfig {
        PgConfig {
            database_url: self.database_url.clone(),
            max_connections: self.db_max_connections,
            acquire_timeout: Duration::from_secs(self.db_acquire_timeout_secs),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoutRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub requested: usize,
    pub fetched: usize,
    pub inserted: u64,
    pub skipped: u64,
    pub dry_run: bool,
    pub trends: Vec<Trend>,
}

pub struct ScoutPipeline {
    config: ScoutConfig,
    source: Box<dyn ItemSource>,
}

impl ScoutPipeline {
    pub fn new(config: ScoutConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = HackerNewsSource::new(http, config.api_base.clone());
        Ok(Self {
            config,
            source: Box::new(source),
        })
    }

    pub fn with_source(mut self, source: Box<dyn ItemSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &ScoutConfig {
        &self.config
    }

    /// Fetch the top items and persist them with insert-or-skip.
    ///
    /// The pool is opened before any network call and closed on every exit path.
    pub async fn run_once(&self) -> Result<ScoutRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("scout_run", %run_id, n = self.config.top_count);

        let (trends, outcome) = self
            .with_pool(|pool| async move {
                let trends = fetch_top_trends(self.source.as_ref(), self.config.top_count)
                    .await
                    .context("fetching top items")?;
                let outcome = insert_trends(&pool, &trends)
                    .await
                    .context("persisting trends")?;
                Ok::<_, anyhow::Error>((trends, outcome))
            })
            .instrument(span)
            .await?;

        let summary = ScoutRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: self.source.source_id().to_string(),
            requested: self.config.top_count,
            fetched: trends.len(),
            inserted: outcome.inserted,
            skipped: outcome.skipped(),
            dry_run: false,
            trends,
        };
        info!(
            %run_id,
            fetched = summary.fetched,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "scout run complete"
        );
        Ok(summary)
    }

    /// Fetch only. No database connection is opened.
    pub async fn dry_run(&self) -> Result<ScoutRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("scout_dry_run", %run_id, n = self.config.top_count);

        let trends = fetch_top_trends(self.source.as_ref(), self.config.top_count)
            .instrument(span)
            .await
            .context("fetching top items")?;
        info!(%run_id, fetched = trends.len(), "dry run fetched trends");

        Ok(ScoutRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: self.source.source_id().to_string(),
            requested: self.config.top_count,
            fetched: trends.len(),
            inserted: 0,
            skipped: 0,
            dry_run: true,
            trends,
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        self.with_pool(|pool| async move {
            run_migrations(&pool).await.context("applying trends schema")
        })
        .await
    }

    pub async fn verify_schema(&self) -> Result<SchemaReport> {
        self.with_pool(|pool| async move {
            verify_schema(&pool).await.context("verifying trends schema")
        })
        .await
    }

    async fn with_pool<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pool = connect_pool(&self.config.pg_config())
            .await
            .context("opening postgres pool")?;
        let result = work(pool.clone()).await;
        pool.close().await;
        result
    }
}

/// Run one scout pass configured from the environment, with optional overrides.
pub async fn run_scout_once_from_env(
    count: Option<usize>,
    dry_run: bool,
) -> Result<ScoutRunSummary> {
    let mut config = ScoutConfig::from_env();
    if let Some(count) = count {
        config.top_count = count;
    }
    let pipeline = ScoutPipeline::new(config)?;
    if dry_run {
        pipeline.dry_run().await
    } else {
        pipeline.run_once().await
    }
}
