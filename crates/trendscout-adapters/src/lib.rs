//! Source adapter contract, Hacker News adapter, and the concurrent top-items fetcher.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use trendscout_core::{Trend, TrendError};
use trendscout_storage::{HttpError, HttpFetcher};

pub const CRATE_NAME: &str = "trendscout-adapters";

pub const HN_API_BASE: &str = "https://hacker-news.firebaseio.com/v0";

pub const DEFAULT_TOP_COUNT: usize = 30;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decoding {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("item {id} not found")]
    MissingItem { id: u64 },
    #[error("item {id} is missing mandatory field `{field}`")]
    MissingField { id: u64, field: &'static str },
    #[error("requested item {requested} but payload carries id {received}")]
    IdMismatch { requested: u64, received: u64 },
    #[error("item {id} is invalid: {source}")]
    Invalid {
        id: u64,
        #[source]
        source: TrendError,
    },
}

/// Detail payload as served by the item endpoint. Every field is optional on
/// the wire so a missing mandatory one surfaces as [`FetchError::MissingField`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPayload {
    pub id: Option<u64>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub score: Option<i32>,
    pub time: Option<i64>,
}

impl ItemPayload {
    pub fn into_trend(self, requested: u64) -> Result<Trend, FetchError> {
        let missing = |field: &'static str| FetchError::MissingField {
            id: requested,
            field,
        };

        let received = self.id.ok_or_else(|| missing("id"))?;
        if received != requested {
            return Err(FetchError::IdMismatch {
                requested,
                received,
            });
        }
        let title = self.title.ok_or_else(|| missing("title"))?;
        let score = self.score.ok_or_else(|| missing("score"))?;
        let time = self.time.ok_or_else(|| missing("time"))?;

        Trend::from_native(requested, title, self.url, score, time).map_err(|source| {
            FetchError::Invalid {
                id: requested,
                source,
            }
        })
    }
}

#[async_trait]
pub trait ItemSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Ranked item ids, best first.
    async fn top_story_ids(&self) -> Result<Vec<u64>, FetchError>;

    /// `Ok(None)` when the source answers but has no such item.
    async fn item(&self, id: u64) -> Result<Option<ItemPayload>, FetchError>;
}

/// Fetch the first `n` ranked items and normalize them, all or nothing.
///
/// Detail requests run concurrently. The result keeps ranking order. The first
/// failure fails the batch and drops the requests still in flight.
pub async fn fetch_top_trends(source: &dyn ItemSource, n: usize) -> Result<Vec<Trend>, FetchError> {
    let span = info_span!("fetch_top_trends", source = source.source_id(), n);
    async move {
        let ids = source.top_story_ids().await?;
        let ids = ids.into_iter().take(n).collect::<Vec<_>>();
        info!(listed = ids.len(), "fetching item details");

        let trends = try_join_all(ids.into_iter().map(|id| fetch_one(source, id))).await?;
        info!(fetched = trends.len(), "items normalized");
        Ok::<_, FetchError>(trends)
    }
    .instrument(span)
    .await
}

async fn fetch_one(source: &dyn ItemSource, id: u64) -> Result<Trend, FetchError> {
    let payload = source
        .item(id)
        .await?
        .ok_or(FetchError::MissingItem { id })?;
    let trend = payload.into_trend(id)?;
    debug!(id, score = trend.score, has_url = trend.url.is_some(), "item normalized");
    Ok(trend)
}

#[derive(Debug, Clone)]
pub struct HackerNewsSource {
    http: HttpFetcher,
    base_url: String,
}

impl HackerNewsSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn top_stories_url(&self) -> String {
        format!("{}/topstories.json", self.base_url)
    }

    pub fn item_url(&self, id: u64) -> String {
        format!("{}/item/{id}.json", self.base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.http.fetch_bytes(url).await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }
}

#[async_trait]
impl ItemSource for HackerNewsSource {
    fn source_id(&self) -> &'static str {
        trendscout_core::HN_SOURCE
    }

    async fn top_story_ids(&self) -> Result<Vec<u64>, FetchError> {
        self.get_json(&self.top_stories_url()).await
    }

    async fn item(&self, id: u64) -> Result<Option<ItemPayload>, FetchError> {
        self.get_json(&self.item_url(id)).await
    }
}
