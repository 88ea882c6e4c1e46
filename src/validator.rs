// =============================================================================
// Base Validator — rug/liquidity/volume gate with whitelist fast-path
// =============================================================================
//
// Whitelisted mints pass immediately. Everything else gets a concurrent
// rug-score + primary-pair fetch, then fail-closed threshold gates. An
// optional technical pass computes 14-period RSI over 7 days of hourly
// prices and flags bullish divergence.
//
// Verdicts are cached for CACHE_TTL so a mint resurfacing across scan
// cycles does not repeat the work.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::errors::{BotError, BotResult};
use crate::indicators;
use crate::market::history::HistoryClient;
use crate::market::pair::{PairClient, PairSnapshot};

/// Verdict lifetime in the cache.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// RSI period for the technical pass.
const RSI_PERIOD: usize = 14;
/// Divergence window over the hourly series.
const DIVERGENCE_WINDOW: usize = 24;

/// Outcome of validating one mint.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    pub reason: Option<String>,
    pub rug_score: Option<f64>,
    pub pair: Option<PairSnapshot>,
    pub rsi: Option<f64>,
    pub bullish_divergence: bool,
    pub whitelisted: bool,
}

impl ValidationReport {
    fn whitelisted() -> Self {
        Self {
            passed: true,
            reason: None,
            rug_score: None,
            pair: None,
            rsi: None,
            bullish_divergence: false,
            whitelisted: true,
        }
    }

    fn failed(reason: String, rug_score: Option<f64>, pair: Option<PairSnapshot>) -> Self {
        Self {
            passed: false,
            reason: Some(reason),
            rug_score,
            pair,
            rsi: None,
            bullish_divergence: false,
            whitelisted: false,
        }
    }
}

/// Liquidity/volume/rug gate in front of the strategy ensemble.
pub struct BaseValidator {
    http: reqwest::Client,
    rug_api_url: String,
    pairs: Arc<PairClient>,
    history: Arc<HistoryClient>,
    whitelist: HashSet<String>,
    max_rug_score: f64,
    min_liquidity_usd: f64,
    min_volume_24h_usd: f64,
    cache: RwLock<HashMap<String, (Instant, ValidationReport)>>,
}

impl BaseValidator {
    pub fn new(
        settings: &Settings,
        pairs: Arc<PairClient>,
        history: Arc<HistoryClient>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            rug_api_url: settings.rug_api_url.clone(),
            pairs,
            history,
            whitelist: settings.whitelist_mints.iter().cloned().collect(),
            max_rug_score: settings.max_rug_score,
            min_liquidity_usd: settings.min_liquidity_usd,
            min_volume_24h_usd: settings.min_volume_24h_usd,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Validate one mint. Cached verdicts are reused for CACHE_TTL.
    pub async fn validate(&self, mint: &str) -> BotResult<ValidationReport> {
        if self.whitelist.contains(mint) {
            debug!(mint, "whitelist fast-path");
            return Ok(ValidationReport::whitelisted());
        }

        if let Some((at, report)) = self.cache.read().get(mint) {
            if at.elapsed() < CACHE_TTL {
                debug!(mint, passed = report.passed, "validation served from cache");
                return Ok(report.clone());
            }
        }

        let report = self.validate_fresh(mint).await?;
        self.cache
            .write()
            .insert(mint.to_string(), (Instant::now(), report.clone()));
        Ok(report)
    }

    async fn validate_fresh(&self, mint: &str) -> BotResult<ValidationReport> {
        let (rug, pair) = tokio::join!(self.fetch_rug_score(mint), self.pairs.primary_pair(mint));

        // A missing rug score degrades to "unknown"; a score above the cap
        // fails closed.
        let rug_score = match rug {
            Ok(score) => Some(score),
            Err(e) => {
                debug!(mint, error = %e, "rug score unavailable — continuing without");
                None
            }
        };

        let pair = match pair {
            Ok(p) => p,
            Err(BotError::PriceUnavailable(_)) => {
                return Ok(ValidationReport::failed(
                    "no tradable pair".to_string(),
                    rug_score,
                    None,
                ))
            }
            Err(e) => return Err(e),
        };

        if let Some(score) = rug_score {
            if score > self.max_rug_score {
                return Ok(ValidationReport::failed(
                    format!("rug score {score:.0} > {:.0}", self.max_rug_score),
                    rug_score,
                    Some(pair),
                ));
            }
        }

        let liquidity = pair.liquidity_usd();
        if liquidity < self.min_liquidity_usd {
            return Ok(ValidationReport::failed(
                format!("liquidity {liquidity:.0} < {:.0}", self.min_liquidity_usd),
                rug_score,
                Some(pair),
            ));
        }

        if pair.volume.h24 < self.min_volume_24h_usd {
            return Ok(ValidationReport::failed(
                format!(
                    "volume {:.0} < {:.0}",
                    pair.volume.h24, self.min_volume_24h_usd
                ),
                rug_score,
                Some(pair),
            ));
        }

        // Technical pass (best-effort): 7 d of hourly closes.
        let (rsi, divergence) = match self.history.history(mint, "1H", 7).await {
            Ok(points) if points.len() > RSI_PERIOD => {
                let closes: Vec<f64> = points.iter().map(|p| p.value).collect();
                (
                    indicators::latest_rsi(&closes, RSI_PERIOD),
                    indicators::bullish_divergence(&closes, RSI_PERIOD, DIVERGENCE_WINDOW),
                )
            }
            Ok(_) => (None, false),
            Err(e) => {
                debug!(mint, error = %e, "hourly history unavailable — skipping technical pass");
                (None, false)
            }
        };

        debug!(mint, rug = ?rug_score, rsi = ?rsi, divergence, "validation passed");
        Ok(ValidationReport {
            passed: true,
            reason: None,
            rug_score,
            pair: Some(pair),
            rsi,
            bullish_divergence: divergence,
            whitelisted: false,
        })
    }

    /// `GET /tokens/{mint}/report/summary` → `{score}`.
    async fn fetch_rug_score(&self, mint: &str) -> BotResult<f64> {
        let url = format!("{}/tokens/{}/report/summary", self.rug_api_url, mint);
        let resp = self.http.get(&url).send().await?;

        if resp.status().as_u16() == 429 {
            return Err(BotError::RateLimited("rug feed returned 429".to_string()));
        }
        if !resp.status().is_success() {
            return Err(BotError::NetworkTransient(format!(
                "rug feed returned {}",
                resp.status()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| BotError::NetworkTransient(format!("rug response undecodable: {e}")))?;

        body["score"]
            .as_f64()
            .or_else(|| body["score_normalised"].as_f64())
            .ok_or_else(|| {
                warn!(mint, "rug response missing score");
                BotError::NetworkTransient("rug response missing score".to_string())
            })
    }
}

impl std::fmt::Debug for BaseValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseValidator")
            .field("whitelist", &self.whitelist.len())
            .field("max_rug_score", &self.max_rug_score)
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn validator_with_whitelist(mints: &[&str]) -> BaseValidator {
        let mut settings = Settings::default();
        settings.whitelist_mints = mints.iter().map(|s| s.to_string()).collect();
        // Point every endpoint at a dead address; only offline paths run.
        settings.rug_api_url = "http://127.0.0.1:1".to_string();
        let pairs = Arc::new(PairClient::new("http://127.0.0.1:1"));
        let history = Arc::new(HistoryClient::new("http://127.0.0.1:1", None));
        BaseValidator::new(&settings, pairs, history)
    }

    #[tokio::test]
    async fn whitelist_fast_path_skips_network() {
        let validator = validator_with_whitelist(&["TrustedMint"]);
        let report = validator.validate("TrustedMint").await.unwrap();
        assert!(report.passed);
        assert!(report.whitelisted);
    }

    #[tokio::test]
    async fn unreachable_pair_feed_fails_closed() {
        let validator = validator_with_whitelist(&[]);
        // Dead endpoints: the rug score degrades to None, but the pair fetch
        // error is a transport failure and propagates.
        let result = validator.validate("UnknownMint").await;
        assert!(result.is_err());
    }
}
