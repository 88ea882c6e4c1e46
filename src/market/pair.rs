// =============================================================================
// DEX Pair Feed — typed client for the screener pair endpoint
// =============================================================================
//
// `GET /latest/dex/tokens/{mint}` returns every pool the token trades in;
// the first entry is the primary pair. Numeric fields arrive as strings in
// places, so decoding tolerates both forms.
// =============================================================================

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::errors::{BotError, BotResult};
use crate::types::{MarketMetrics, TokenCandidate, TxCounts};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceChangeWindows {
    #[serde(default)]
    pub m5: f64,
    #[serde(default)]
    pub h1: f64,
    #[serde(default)]
    pub h6: f64,
    #[serde(default)]
    pub h24: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeWindows {
    #[serde(default)]
    pub h1: f64,
    #[serde(default)]
    pub h24: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiquidityInfo {
    #[serde(default)]
    pub usd: f64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TxnWindow {
    #[serde(default)]
    pub buys: u64,
    #[serde(default)]
    pub sells: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxnWindows {
    #[serde(default)]
    pub h1: TxnWindow,
    #[serde(default)]
    pub h24: TxnWindow,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BaseToken {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub symbol: String,
}

/// One liquidity-pool record for a token against a reference asset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairSnapshot {
    #[serde(default)]
    pub chain_id: String,
    #[serde(default)]
    pub dex_id: String,
    #[serde(default)]
    pub base_token: BaseToken,
    /// Price arrives as a decimal string.
    #[serde(default)]
    pub price_usd: Option<String>,
    #[serde(default)]
    pub price_change: PriceChangeWindows,
    #[serde(default)]
    pub volume: VolumeWindows,
    #[serde(default)]
    pub liquidity: Option<LiquidityInfo>,
    #[serde(default)]
    pub fdv: Option<f64>,
    /// Pool creation time, unix milliseconds.
    #[serde(default)]
    pub pair_created_at: Option<i64>,
    #[serde(default)]
    pub txns: TxnWindows,
}

#[derive(Debug, Deserialize)]
struct TokenPairsResponse {
    #[serde(default)]
    pairs: Option<Vec<PairSnapshot>>,
}

impl PairSnapshot {
    /// Parsed USD price; 0.0 when the feed omitted it.
    pub fn price(&self) -> f64 {
        self.price_usd
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    pub fn liquidity_usd(&self) -> f64 {
        self.liquidity.as_ref().map(|l| l.usd).unwrap_or(0.0)
    }

    /// Age of the pool in hours (0 when the feed omitted the creation time).
    pub fn age_hours(&self) -> f64 {
        match self.pair_created_at {
            Some(ms) if ms > 0 => {
                let created = ms as f64 / 1000.0;
                let now = chrono::Utc::now().timestamp() as f64;
                ((now - created) / 3600.0).max(0.0)
            }
            _ => 0.0,
        }
    }

    /// Project the pair into an immutable candidate snapshot.
    pub fn to_candidate(&self) -> TokenCandidate {
        TokenCandidate {
            address: self.base_token.address.clone(),
            dex_id: self.dex_id.clone(),
            liquidity_usd: self.liquidity_usd(),
            volume_24h_usd: self.volume.h24,
            volume_1h_usd: self.volume.h1,
            price_usd: self.price(),
            price_change_24h_pct: self.price_change.h24,
            tx_counts: TxCounts {
                buys_1h: self.txns.h1.buys,
                sells_1h: self.txns.h1.sells,
                buys_24h: self.txns.h24.buys,
                sells_24h: self.txns.h24.sells,
            },
            rug_score: None,
        }
    }

    /// Derive the enriched metrics view used by the strategy and risk layers.
    pub fn to_metrics(&self) -> MarketMetrics {
        let liq = self.liquidity_usd();
        let hourly_avg = self.volume.h24 / 24.0;
        MarketMetrics {
            rvol: if hourly_avg > 0.0 {
                self.volume.h1 / hourly_avg
            } else {
                0.0
            },
            rsi: None,
            bullish_divergence: false,
            age_hours: self.age_hours(),
            fdv_to_liq_ratio: match (self.fdv, liq > 0.0) {
                (Some(fdv), true) => fdv / liq,
                _ => 0.0,
            },
            volume_to_liq_ratio: if liq > 0.0 { self.volume.h24 / liq } else { 0.0 },
            price_change_5m_pct: self.price_change.m5,
            price_change_1h_pct: self.price_change.h1,
            price_change_6h_pct: self.price_change.h6,
            price_change_24h_pct: self.price_change.h24,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the screener pair endpoint.
pub struct PairClient {
    http: reqwest::Client,
    base_url: String,
}

impl PairClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Fetch every pair for `mint` (primary pair first, as the feed orders
    /// them by liquidity).
    pub async fn token_pairs(&self, mint: &str) -> BotResult<Vec<PairSnapshot>> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, mint);
        let resp = self.http.get(&url).send().await?;

        if resp.status().as_u16() == 429 {
            return Err(BotError::RateLimited("pair feed returned 429".to_string()));
        }

        let body: TokenPairsResponse = resp
            .json()
            .await
            .map_err(|e| BotError::NetworkTransient(format!("pair response undecodable: {e}")))?;

        let pairs = body.pairs.unwrap_or_default();
        debug!(mint, count = pairs.len(), "pairs fetched");
        Ok(pairs)
    }

    /// The token's primary pair, or `PriceUnavailable` when it has none.
    pub async fn primary_pair(&self, mint: &str) -> BotResult<PairSnapshot> {
        self.token_pairs(mint)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BotError::PriceUnavailable(mint.to_string()))
    }

    /// Current USD price from the primary pair.
    pub async fn price(&self, mint: &str) -> BotResult<f64> {
        let pair = self.primary_pair(mint).await?;
        let price = pair.price();
        if price > 0.0 {
            Ok(price)
        } else {
            Err(BotError::PriceUnavailable(mint.to_string()))
        }
    }
}

impl std::fmt::Debug for PairClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pair_json() -> &'static str {
        r#"{
            "dexId": "raydium",
            "baseToken": {"address": "Mint111", "symbol": "TEST"},
            "priceUsd": "0.004200",
            "priceChange": {"m5": 1.2, "h1": 4.0, "h6": 11.0, "h24": 18.0},
            "volume": {"h1": 25000.0, "h24": 240000.0},
            "liquidity": {"usd": 200000.0},
            "fdv": 800000.0,
            "pairCreatedAt": 1700000000000,
            "txns": {"h1": {"buys": 120, "sells": 80}, "h24": {"buys": 900, "sells": 700}}
        }"#
    }

    #[test]
    fn pair_decodes_and_projects_candidate() {
        let pair: PairSnapshot = serde_json::from_str(sample_pair_json()).unwrap();
        assert!((pair.price() - 0.0042).abs() < 1e-12);
        assert!((pair.liquidity_usd() - 200_000.0).abs() < f64::EPSILON);

        let candidate = pair.to_candidate();
        assert_eq!(candidate.address, "Mint111");
        assert_eq!(candidate.dex_id, "raydium");
        assert_eq!(candidate.tx_counts.buys_1h, 120);
        assert!((candidate.rvol() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn metrics_ratios() {
        let pair: PairSnapshot = serde_json::from_str(sample_pair_json()).unwrap();
        let metrics = pair.to_metrics();
        assert!((metrics.rvol - 2.5).abs() < 1e-9);
        assert!((metrics.fdv_to_liq_ratio - 4.0).abs() < 1e-9);
        assert!((metrics.volume_to_liq_ratio - 1.2).abs() < 1e-9);
        assert!((metrics.price_change_1h_pct - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_fields_default() {
        let pair: PairSnapshot = serde_json::from_str(r#"{"dexId": "orca"}"#).unwrap();
        assert_eq!(pair.price(), 0.0);
        assert_eq!(pair.liquidity_usd(), 0.0);
        assert_eq!(pair.age_hours(), 0.0);
    }
}
