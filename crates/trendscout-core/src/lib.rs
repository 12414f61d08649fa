//! Core trend record and identity derivation for Trend Scout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use md5::{Digest, Md5};
use thiserror::Error;

pub const CRATE_NAME: &str = "trendscout-core";

/// Source tag stamped on every record produced by the Hacker News fetcher.
pub const HN_SOURCE: &str = "hn";

/// Hex length of a derived id (MD5, 16 bytes).
pub const DERIVED_ID_LEN: usize = 32;

/// Row tuple in `trends` column order: `(id, title, url, source, score, ts)`.
pub type TrendRow<'a> = (
    &'a str,
    &'a str,
    Option<&'a str>,
    &'a str,
    i32,
    DateTime<Utc>,
);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrendError {
    #[error("title is empty")]
    EmptyTitle,
    #[error("epoch seconds {0} out of range")]
    TimestampOutOfRange(i64),
}

/// Content-addressed id for a native source id.
///
/// Hashes the decimal string form of `native_id`, so the same item always maps
/// to the same primary key across runs.
pub fn derive_id(native_id: u64) -> String {
    let mut hasher = Md5::new();
    hasher.update(native_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Interpret Unix epoch seconds as a UTC point in time.
pub fn utc_from_epoch(secs: i64) -> Result<DateTime<Utc>, TrendError> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or(TrendError::TimestampOutOfRange(secs))
}

/// Normalized unit of ingestion. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trend {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub source: String,
    pub score: i32,
    pub ts: DateTime<Utc>,
}

impl Trend {
    /// Build a Hacker News trend from the native item fields.
    pub fn from_native(
        native_id: u64,
        title: String,
        url: Option<String>,
        score: i32,
        epoch_secs: i64,
    ) -> Result<Self, TrendError> {
        if title.is_empty() {
            return Err(TrendError::EmptyTitle);
        }
        Ok(Self {
            id: derive_id(native_id),
            title,
            url,
            source: HN_SOURCE.to_string(),
            score,
            ts: utc_from_epoch(epoch_secs)?,
        })
    }

    pub fn as_row(&self) -> TrendRow<'_> {
        (
            &self.id,
            &self.title,
            self.url.as_deref(),
            &self.source,
            self.score,
            self.ts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn jan_first() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn derive_id_is_stable() {
        assert_eq!(derive_id(1001), derive_id(1001));
        assert_eq!(derive_id(1), "c4ca4238a0b923820dcc509a6f75849b");
        assert_eq!(derive_id(2), "c81e728d9d4c2f636f067f89cc14862c");
        assert_eq!(derive_id(1001).len(), DERIVED_ID_LEN);
    }

    #[test]
    fn distinct_native_ids_do_not_collide() {
        let ids = (1..=1000u64).map(derive_id).collect::<std::collections::HashSet<_>>();
        assert_eq!(ids.len(), 1000);
        assert_ne!(derive_id(1001), derive_id(2002));
    }

    #[test]
    fn epoch_is_read_as_utc() {
        assert_eq!(utc_from_epoch(1640995200).unwrap(), jan_first());
        assert_eq!(
            utc_from_epoch(1640995200).unwrap().to_rfc3339(),
            "2022-01-01T00:00:00+00:00"
        );
        assert_eq!(
            utc_from_epoch(i64::MAX),
            Err(TrendError::TimestampOutOfRange(i64::MAX))
        );
    }

    #[test]
    fn from_native_fills_every_column() {
        let trend = Trend::from_native(
            1,
            "Show HN: a thing".into(),
            Some("https://example.com/thing".into()),
            100,
            1640995200,
        )
        .unwrap();

        assert_eq!(trend.id, derive_id(1));
        assert_eq!(trend.source, HN_SOURCE);
        assert_eq!(trend.score, 100);
        assert_eq!(trend.ts, jan_first());
        assert_eq!(
            trend.as_row(),
            (
                derive_id(1).as_str(),
                "Show HN: a thing",
                Some("https://example.com/thing"),
                "hn",
                100,
                jan_first(),
            )
        );
    }

    #[test]
    fn ask_hn_without_url_keeps_url_absent() {
        let trend = Trend::from_native(7, "Ask HN: X?".into(), None, 45, 1640995400).unwrap();
        assert_eq!(trend.url, None);
        assert_eq!(trend.as_row().2, None);
    }

    #[test]
    fn empty_title_is_rejected() {
        assert_eq!(
            Trend::from_native(1, String::new(), None, 1, 0),
            Err(TrendError::EmptyTitle)
        );
    }

    #[test]
    fn whitespace_title_is_kept_verbatim() {
        let trend = Trend::from_native(1, "   ".into(), None, 1, 0).unwrap();
        assert_eq!(trend.title, "   ");
    }

    #[test]
    fn zero_and_large_scores_pass_through() {
        let zero = Trend::from_native(2, "Zero".into(), None, 0, 0).unwrap();
        let viral = Trend::from_native(3, "Viral".into(), None, 9999, 0).unwrap();
        assert_eq!(zero.score, 0);
        assert_eq!(viral.score, 9999);
    }

    #[test]
    fn url_defaults_to_none_when_deserializing() {
        let trend: Trend = serde_json::from_str(
            r#"{"id":"abc","title":"Default URL Test","source":"hn","score":75,
                "ts":"2022-01-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(trend.url, None);
        assert_eq!(trend.score, 75);
    }
}
