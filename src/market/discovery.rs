// =============================================================================
// Discovery Aggregator — merge, deduplicate, and gate candidate tokens
// =============================================================================
//
// Four heterogeneous sources are queried concurrently; each degrades to an
// empty list on failure so one dead feed never stalls a scan:
//   1. Configured whitelist mints (pair lookup per mint)
//   2. Chain-filtered pair search
//   3. Boosted-token feed
//   4. Latest token-profiles feed
//
// Results are unioned by address (first occurrence wins), pushed through the
// threshold gate, sorted by 24 h volume, and truncated to MAX_CANDIDATES.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::market::pair::{PairClient, PairSnapshot};
use crate::types::TokenCandidate;

/// Cap on the candidate list handed to the pipeline.
const MAX_CANDIDATES: usize = 100;

/// Cap on per-feed address lookups (boosts/profiles list addresses only, so
/// each one costs a pair fetch).
const MAX_FEED_LOOKUPS: usize = 15;

/// Price floor; anything below is dust or a broken feed row.
const MIN_PRICE_USD: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Threshold gate
// ---------------------------------------------------------------------------

/// Configurable admission thresholds for discovered candidates.
#[derive(Debug, Clone)]
pub struct DiscoveryGate {
    pub min_liquidity_usd: f64,
    pub min_volume_24h_usd: f64,
    pub max_change_24h_pct: f64,
    pub min_rvol: f64,
    pub dex_whitelist: Vec<String>,
}

impl DiscoveryGate {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            min_liquidity_usd: settings.min_liquidity_usd,
            min_volume_24h_usd: settings.min_volume_24h_usd,
            max_change_24h_pct: settings.max_change_24h_pct,
            min_rvol: settings.min_rvol,
            dex_whitelist: settings.dex_whitelist.clone(),
        }
    }

    /// Check one candidate. Returns the failed criterion on rejection.
    pub fn check(&self, c: &TokenCandidate) -> Result<(), String> {
        if !self.dex_whitelist.iter().any(|d| d == &c.dex_id) {
            return Err(format!("dex '{}' not whitelisted", c.dex_id));
        }
        if c.liquidity_usd < self.min_liquidity_usd {
            return Err(format!(
                "liquidity {:.0} < {:.0}",
                c.liquidity_usd, self.min_liquidity_usd
            ));
        }
        if c.volume_24h_usd < self.min_volume_24h_usd {
            return Err(format!(
                "volume {:.0} < {:.0}",
                c.volume_24h_usd, self.min_volume_24h_usd
            ));
        }
        if c.price_change_24h_pct.abs() > self.max_change_24h_pct {
            return Err(format!(
                "24h change {:.1}% beyond ±{:.0}%",
                c.price_change_24h_pct, self.max_change_24h_pct
            ));
        }
        let rvol = c.rvol();
        if rvol < self.min_rvol {
            return Err(format!("rvol {:.2} < {:.2}", rvol, self.min_rvol));
        }
        if c.price_usd < MIN_PRICE_USD {
            return Err(format!("price {:.2e} below floor", c.price_usd));
        }
        Ok(())
    }
}

/// Union by address (first occurrence wins), apply the gate, sort by 24 h
/// volume descending, truncate.
pub fn merge_and_filter(
    sources: Vec<Vec<TokenCandidate>>,
    gate: &DiscoveryGate,
) -> Vec<TokenCandidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged: Vec<TokenCandidate> = Vec::new();

    for source in sources {
        for candidate in source {
            if seen.insert(candidate.address.clone()) {
                merged.push(candidate);
            }
        }
    }

    let mut passed: Vec<TokenCandidate> = Vec::new();
    for candidate in merged {
        match gate.check(&candidate) {
            Ok(()) => passed.push(candidate),
            Err(reason) => debug!(mint = %candidate.address, reason, "candidate gated out"),
        }
    }

    passed.sort_by(|a, b| {
        b.volume_24h_usd
            .partial_cmp(&a.volume_24h_usd)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    passed.truncate(MAX_CANDIDATES);
    passed
}

// ---------------------------------------------------------------------------
// Feed wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedTokenRef {
    #[serde(default)]
    chain_id: String,
    #[serde(default)]
    token_address: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pairs: Option<Vec<PairSnapshot>>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Concurrent multi-source token discovery.
pub struct DiscoveryAggregator {
    http: reqwest::Client,
    base_url: String,
    pairs: Arc<PairClient>,
    gate: DiscoveryGate,
    whitelist_mints: Vec<String>,
}

impl DiscoveryAggregator {
    pub fn new(settings: &Settings, pairs: Arc<PairClient>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: settings.pair_api_url.clone(),
            pairs,
            gate: DiscoveryGate::from_settings(settings),
            whitelist_mints: settings.whitelist_mints.clone(),
        }
    }

    /// Run one discovery pass across all sources.
    pub async fn discover(&self) -> Vec<TokenCandidate> {
        let (whitelist, search, boosts, profiles) = tokio::join!(
            self.whitelist_source(),
            self.search_source(),
            self.feed_source("token-boosts/latest/v1", "boosts"),
            self.feed_source("token-profiles/latest/v1", "profiles"),
        );

        let candidates = merge_and_filter(vec![whitelist, search, boosts, profiles], &self.gate);
        info!(count = candidates.len(), "discovery pass complete");
        candidates
    }

    /// Pair lookups for the operator-configured whitelist mints.
    async fn whitelist_source(&self) -> Vec<TokenCandidate> {
        let lookups = self
            .whitelist_mints
            .iter()
            .map(|mint| self.pairs.primary_pair(mint));

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|result| result.ok())
            .map(|pair| pair.to_candidate())
            .collect()
    }

    /// Chain-filtered pair search — one call that returns full pair rows.
    async fn search_source(&self) -> Vec<TokenCandidate> {
        let url = format!("{}/latest/dex/search?q=SOL", self.base_url);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "search feed unreachable — skipping");
                return Vec::new();
            }
        };

        let body: SearchResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "search feed undecodable — skipping");
                return Vec::new();
            }
        };

        body.pairs
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.chain_id == "solana")
            .map(|p| p.to_candidate())
            .collect()
    }

    /// Boost/profile feeds list bare addresses; resolve each through the pair
    /// client (bounded, concurrent).
    async fn feed_source(&self, path: &str, label: &str) -> Vec<TokenCandidate> {
        let url = format!("{}/{}", self.base_url, path);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(feed = label, error = %e, "feed unreachable — skipping");
                return Vec::new();
            }
        };

        let refs: Vec<FeedTokenRef> = match response.json().await {
            Ok(r) => r,
            Err(e) => {
                warn!(feed = label, error = %e, "feed undecodable — skipping");
                return Vec::new();
            }
        };

        let addresses: Vec<String> = refs
            .into_iter()
            .filter(|r| r.chain_id == "solana" && !r.token_address.is_empty())
            .map(|r| r.token_address)
            .take(MAX_FEED_LOOKUPS)
            .collect();

        let lookups = addresses.iter().map(|mint| self.pairs.primary_pair(mint));
        let candidates: Vec<TokenCandidate> = join_all(lookups)
            .await
            .into_iter()
            .filter_map(|result| result.ok())
            .map(|pair| pair.to_candidate())
            .collect();

        debug!(feed = label, count = candidates.len(), "feed resolved");
        candidates
    }
}

impl std::fmt::Debug for DiscoveryAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryAggregator")
            .field("base_url", &self.base_url)
            .field("whitelist_mints", &self.whitelist_mints.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxCounts;

    fn gate() -> DiscoveryGate {
        DiscoveryGate {
            min_liquidity_usd: 20_000.0,
            min_volume_24h_usd: 50_000.0,
            max_change_24h_pct: 500.0,
            min_rvol: 1.5,
            dex_whitelist: vec!["raydium".to_string(), "orca".to_string()],
        }
    }

    fn candidate(address: &str, liquidity: f64, volume_24h: f64, volume_1h: f64) -> TokenCandidate {
        TokenCandidate {
            address: address.to_string(),
            dex_id: "raydium".to_string(),
            liquidity_usd: liquidity,
            volume_24h_usd: volume_24h,
            volume_1h_usd: volume_1h,
            price_usd: 0.01,
            price_change_24h_pct: 12.0,
            tx_counts: TxCounts::default(),
            rug_score: None,
        }
    }

    #[test]
    fn gate_passes_healthy_candidate() {
        // rvol = 10_000 / (120_000/24) = 2.0
        let c = candidate("A", 100_000.0, 120_000.0, 10_000.0);
        assert!(gate().check(&c).is_ok());
    }

    #[test]
    fn gate_rejects_each_threshold() {
        let g = gate();

        let mut c = candidate("A", 10_000.0, 120_000.0, 10_000.0);
        assert!(g.check(&c).unwrap_err().contains("liquidity"));

        c = candidate("A", 100_000.0, 30_000.0, 10_000.0);
        assert!(g.check(&c).unwrap_err().contains("volume"));

        c = candidate("A", 100_000.0, 120_000.0, 1_000.0);
        assert!(g.check(&c).unwrap_err().contains("rvol"));

        c = candidate("A", 100_000.0, 120_000.0, 10_000.0);
        c.price_change_24h_pct = 900.0;
        assert!(g.check(&c).unwrap_err().contains("24h change"));

        c = candidate("A", 100_000.0, 120_000.0, 10_000.0);
        c.dex_id = "unknown-dex".to_string();
        assert!(g.check(&c).unwrap_err().contains("not whitelisted"));

        c = candidate("A", 100_000.0, 120_000.0, 10_000.0);
        c.price_usd = 1e-9;
        assert!(g.check(&c).unwrap_err().contains("below floor"));
    }

    #[test]
    fn merge_dedupes_first_occurrence_wins() {
        let mut from_whitelist = candidate("A", 100_000.0, 120_000.0, 10_000.0);
        from_whitelist.price_usd = 1.0;
        let mut from_search = candidate("A", 100_000.0, 999_000.0, 99_000.0);
        from_search.price_usd = 2.0;

        let merged = merge_and_filter(vec![vec![from_whitelist], vec![from_search]], &gate());
        assert_eq!(merged.len(), 1);
        assert!((merged[0].price_usd - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn output_sorted_by_volume_and_truncated() {
        let many: Vec<TokenCandidate> = (0..150)
            .map(|i| {
                candidate(
                    &format!("M{i}"),
                    100_000.0,
                    100_000.0 + i as f64 * 1_000.0,
                    20_000.0,
                )
            })
            .collect();

        let merged = merge_and_filter(vec![many], &gate());
        assert_eq!(merged.len(), 100);
        assert!(merged[0].volume_24h_usd >= merged[99].volume_24h_usd);
        assert_eq!(merged[0].address, "M149");
    }
}
