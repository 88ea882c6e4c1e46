// =============================================================================
// Historical Price Client — daily/hourly series with caching and call spacing
// =============================================================================
//
// `GET /defi/history_price?address&type&time_from&time_to` returns
// `{items: [{value, unixTime}]}` (some deployments nest it under `data`).
// Series are cached for 30 minutes and calls are spaced at least 2 seconds
// apart, so the risk manager's 7 d / 30 d lookups stay well under the feed's
// rate limit.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{BotError, BotResult};

/// Cached series lifetime.
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
/// Minimum spacing between outbound calls.
const MIN_SPACING: Duration = Duration::from_secs(2);

/// One point of a historical price series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub value: f64,
    pub unix_time: i64,
}

struct CacheEntry {
    points: Vec<PricePoint>,
    fetched_at: Instant,
}

/// Rate-limited, caching client for the historical price feed.
pub struct HistoryClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    last_call: Mutex<Option<Instant>>,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: base_url.into(),
            api_key,
            cache: RwLock::new(HashMap::new()),
            last_call: Mutex::new(None),
        }
    }

    /// Fetch a price series for `mint` over the trailing `days`, at the given
    /// granularity (`"1D"` daily, `"1H"` hourly).
    pub async fn history(&self, mint: &str, interval: &str, days: u32) -> BotResult<Vec<PricePoint>> {
        let key = format!("{mint}:{interval}:{days}");

        if let Some(entry) = self.cache.read().get(&key) {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                debug!(mint, interval, days, "history served from cache");
                return Ok(entry.points.clone());
            }
        }

        // Enforce the spacing without holding the lock across the sleep.
        let wait = {
            let last = self.last_call.lock();
            (*last)
                .map(|t| MIN_SPACING.saturating_sub(t.elapsed()))
                .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let now = chrono::Utc::now().timestamp();
        let from = now - (days as i64) * 86_400;
        let url = format!(
            "{}/defi/history_price?address={}&address_type=token&type={}&time_from={}&time_to={}",
            self.base_url, mint, interval, from, now
        );

        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }

        let response = request.send().await?;
        *self.last_call.lock() = Some(Instant::now());

        if response.status().as_u16() == 429 {
            return Err(BotError::RateLimited("history feed returned 429".to_string()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BotError::NetworkTransient(format!("history response undecodable: {e}")))?;

        let points = parse_history(&body);
        if points.is_empty() {
            warn!(mint, interval, "history feed returned no points");
        }

        self.cache.write().insert(
            key,
            CacheEntry {
                points: points.clone(),
                fetched_at: Instant::now(),
            },
        );
        debug!(mint, interval, days, count = points.len(), "history fetched");
        Ok(points)
    }
}

impl std::fmt::Debug for HistoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("cached_series", &self.cache.read().len())
            .finish()
    }
}

/// Extract `{value, unixTime}` items from either the flat or the
/// `data`-nested response form.
fn parse_history(body: &Value) -> Vec<PricePoint> {
    let items = body
        .pointer("/data/items")
        .or_else(|| body.get("items"))
        .and_then(|v| v.as_array());

    match items {
        Some(items) => items
            .iter()
            .filter_map(|item| {
                let value = item["value"].as_f64()?;
                let unix_time = item["unixTime"].as_i64()?;
                Some(PricePoint { value, unix_time })
            })
            .collect(),
        None => Vec::new(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_items() {
        let body = json!({"items": [
            {"value": 1.5, "unixTime": 1_700_000_000},
            {"value": 1.7, "unixTime": 1_700_086_400}
        ]});
        let points = parse_history(&body);
        assert_eq!(points.len(), 2);
        assert!((points[1].value - 1.7).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_data_nested_items() {
        let body = json!({"data": {"items": [{"value": 0.3, "unixTime": 1}]}, "success": true});
        let points = parse_history(&body);
        assert_eq!(points.len(), 1);
        assert!((points[0].value - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_rows_are_dropped() {
        let body = json!({"items": [
            {"value": 1.0, "unixTime": 1},
            {"value": "not a number", "unixTime": 2},
            {"unixTime": 3}
        ]});
        assert_eq!(parse_history(&body).len(), 1);
    }

    #[test]
    fn empty_on_missing_items() {
        assert!(parse_history(&json!({"success": false})).is_empty());
    }
}
