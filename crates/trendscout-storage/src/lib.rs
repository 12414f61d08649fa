//! Postgres persistence + HTTP fetch utilities for Trend Scout.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use trendscout_core::Trend;

pub const CRATE_NAME: &str = "trendscout-storage";

pub const TRENDS_TABLE: &str = "trends";

/// Columns the writer and downstream readers depend on, in table order.
pub const EXPECTED_COLUMNS: [&str; 7] = [
    "id",
    "title",
    "url",
    "source",
    "score",
    "ts",
    "created_at",
];

/// Single bulk insert-or-skip statement. Column arrays keep it valid for an
/// empty batch, where it inserts nothing.
pub const INSERT_TRENDS_SQL: &str = r#"
INSERT INTO trends (id, title, url, source, score, ts)
SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::int4[], $6::timestamptz[])
ON CONFLICT (id) DO NOTHING
"#;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connecting to postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] MigrateError),
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("table {table} is missing columns: {columns:?}")]
    MissingColumns { table: String, columns: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct PgConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

// The DSN may carry credentials; keep it out of logs.
pub async fn connect_pool(config: &PgConfig) -> Result<PgPool, StorageError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .map_err(StorageError::Connect)?;
    info!(max_connections = config.max_connections, "postgres pool ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StorageError> {
    MIGRATOR.run(pool).await?;
    info!("trends schema migrations applied");
    Ok(())
}

/// Column-major view of a batch, one vector per `trends` column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendColumns {
    pub ids: Vec<String>,
    pub titles: Vec<String>,
    pub urls: Vec<Option<String>>,
    pub sources: Vec<String>,
    pub scores: Vec<i32>,
    pub timestamps: Vec<DateTime<Utc>>,
}

impl TrendColumns {
    pub fn from_trends(trends: &[Trend]) -> Self {
        let mut columns = Self {
            ids: Vec::with_capacity(trends.len()),
            titles: Vec::with_capacity(trends.len()),
            urls: Vec::with_capacity(trends.len()),
            sources: Vec::with_capacity(trends.len()),
            scores: Vec::with_capacity(trends.len()),
            timestamps: Vec::with_capacity(trends.len()),
        };
        for trend in trends {
            let (id, title, url, source, score, ts) = trend.as_row();
            columns.ids.push(id.to_string());
            columns.titles.push(title.to_string());
            columns.urls.push(url.map(str::to_string));
            columns.sources.push(source.to_string());
            columns.scores.push(score);
            columns.timestamps.push(ts);
        }
        columns
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub attempted: usize,
    pub inserted: u64,
}

impl InsertOutcome {
    pub fn skipped(&self) -> u64 {
        (self.attempted as u64).saturating_sub(self.inserted)
    }
}

/// Insert every trend whose id is not yet stored; existing rows are left untouched.
///
/// Holds one pooled connection for the duration of the statement. The
/// connection goes back to the pool when the guard drops, on success or error.
pub async fn insert_trends(pool: &PgPool, trends: &[Trend]) -> Result<InsertOutcome, StorageError> {
    let columns = TrendColumns::from_trends(trends);
    let span = info_span!("insert_trends", rows = columns.len());

    async move {
        let mut conn = pool.acquire().await?;
        let result = sqlx::query(INSERT_TRENDS_SQL)
            .bind(&columns.ids)
            .bind(&columns.titles)
            .bind(&columns.urls)
            .bind(&columns.sources)
            .bind(&columns.scores)
            .bind(&columns.timestamps)
            .execute(&mut *conn)
            .await?;

        let outcome = InsertOutcome {
            attempted: columns.len(),
            inserted: result.rows_affected(),
        };
        info!(
            inserted = outcome.inserted,
            skipped = outcome.skipped(),
            "bulk insert-or-skip finished"
        );
        Ok::<_, StorageError>(outcome)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<String>,
}

impl SchemaReport {
    pub fn missing_columns(&self) -> Vec<String> {
        EXPECTED_COLUMNS
            .iter()
            .filter(|expected| !self.columns.iter().any(|c| c.name == **expected))
            .map(|c| c.to_string())
            .collect()
    }
}

/// Inspect the `trends` table from the catalog and fail if it is absent or incomplete.
pub async fn verify_schema(pool: &PgPool) -> Result<SchemaReport, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT column_name::text AS column_name,
               data_type::text AS data_type,
               is_nullable::text AS is_nullable
          FROM information_schema.columns
         WHERE table_name::text = $1
         ORDER BY ordinal_position
        "#,
    )
    .bind(TRENDS_TABLE)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Err(StorageError::MissingTable(TRENDS_TABLE.to_string()));
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let nullable: String = row.try_get("is_nullable")?;
        columns.push(ColumnInfo {
            name: row.try_get("column_name")?,
            data_type: row.try_get("data_type")?,
            nullable: nullable == "YES",
        });
    }

    let indexes = sqlx::query(
        r#"
        SELECT indexname::text AS indexname
          FROM pg_indexes
         WHERE tablename::text = $1
           AND indexname <> 'trends_pkey'
         ORDER BY indexname
        "#,
    )
    .bind(TRENDS_TABLE)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| row.try_get::<String, _>("indexname"))
    .collect::<Result<Vec<_>, _>>()?;

    let report = SchemaReport { columns, indexes };
    let missing = report.missing_columns();
    if !missing.is_empty() {
        return Err(StorageError::MissingColumns {
            table: TRENDS_TABLE.to_string(),
            columns: missing,
        });
    }
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared client for single-shot GETs. No retries: a failed request is final.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok::<_, HttpError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trend(native_id: u64, title: &str, url: Option<&str>, score: i32) -> Trend {
        Trend::from_native(native_id, title.into(), url.map(Into::into), score, 1640995200)
            .expect("valid trend")
    }

    #[test]
    fn columns_follow_batch_order() {
        let batch = vec![
            trend(1, "First", Some("https://a.example"), 100),
            trend(2, "Second", None, 75),
            trend(3, "Third", Some("https://c.example"), 50),
        ];
        let columns = TrendColumns::from_trends(&batch);

        assert_eq!(columns.len(), 3);
        assert_eq!(columns.ids, batch.iter().map(|t| t.id.clone()).collect::<Vec<_>>());
        assert_eq!(columns.titles, vec!["First", "Second", "Third"]);
        assert_eq!(
            columns.urls,
            vec![Some("https://a.example".to_string()), None, Some("https://c.example".to_string())]
        );
        assert_eq!(columns.sources, vec!["hn"; 3]);
        assert_eq!(columns.scores, vec![100, 75, 50]);
        let expected_ts = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).single().unwrap();
        assert!(columns.timestamps.iter().all(|ts| *ts == expected_ts));
    }

    #[test]
    fn empty_batch_yields_empty_columns() {
        let columns = TrendColumns::from_trends(&[]);
        assert!(columns.is_empty());
        assert_eq!(columns, TrendColumns::default());
    }

    #[test]
    fn insert_statement_skips_conflicts_on_id() {
        assert!(INSERT_TRENDS_SQL
            .contains("INSERT INTO trends (id, title, url, source, score, ts)"));
        assert!(INSERT_TRENDS_SQL.contains("ON CONFLICT (id) DO NOTHING"));
        assert!(INSERT_TRENDS_SQL.contains("UNNEST("));
        assert!(!INSERT_TRENDS_SQL.contains("DO UPDATE"));
    }

    fn array_type_name<T: sqlx::Type<sqlx::Postgres>>(_: &T) -> String {
        use sqlx::TypeInfo;
        T::type_info().name().to_ascii_lowercase()
    }

    fn placeholder_cast(sql: &str, index: usize) -> String {
        let marker = format!("${index}::");
        let start = sql.find(&marker).expect("placeholder present") + marker.len();
        sql[start..]
            .split([',', ')'])
            .next()
            .expect("cast")
            .trim()
            .to_string()
    }

    #[test]
    fn bound_columns_match_statement_casts() {
        let batch = vec![
            trend(1, "First", Some("https://a.example"), 100),
            trend(2, "Ask HN: Second?", None, 75),
            trend(3, "Third", Some("https://c.example"), 50),
        ];
        let columns = TrendColumns::from_trends(&batch);

        let bound = [
            array_type_name(&columns.ids),
            array_type_name(&columns.titles),
            array_type_name(&columns.urls),
            array_type_name(&columns.sources),
            array_type_name(&columns.scores),
            array_type_name(&columns.timestamps),
        ];
        for (position, bound_type) in bound.iter().enumerate() {
            assert_eq!(
                placeholder_cast(INSERT_TRENDS_SQL, position + 1),
                *bound_type,
                "column ${} is bound with a mismatched type",
                position + 1
            );
        }
        assert!(!INSERT_TRENDS_SQL.contains("$7"));
        assert_eq!(columns.urls[1], None);
        assert!(columns.ids.iter().all(|id| id.len() == trendscout_core::DERIVED_ID_LEN));
    }

    #[test]
    fn outcome_reports_skipped_rows() {
        let outcome = InsertOutcome {
            attempted: 3,
            inserted: 1,
        };
        assert_eq!(outcome.skipped(), 2);
        assert_eq!(InsertOutcome { attempted: 0, inserted: 0 }.skipped(), 0);
    }

    #[test]
    fn schema_report_lists_missing_columns() {
        let report = SchemaReport {
            columns: ["id", "title", "url", "source", "score"]
                .iter()
                .map(|name| ColumnInfo {
                    name: name.to_string(),
                    data_type: "text".into(),
                    nullable: false,
                })
                .collect(),
            indexes: vec![],
        };
        assert_eq!(report.missing_columns(), vec!["ts", "created_at"]);
    }

    #[tokio::test]
    async fn refused_connection_is_a_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: Some("trendscout-test".into()),
        })
        .expect("client");
        let err = fetcher
            .fetch_bytes(&format!("http://{addr}/topstories.json"))
            .await
            .expect_err("nothing is listening");
        assert!(matches!(err, HttpError::Request(_)));
    }
}
