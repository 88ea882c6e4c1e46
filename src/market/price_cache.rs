// =============================================================================
// Price Cache — volatility-adaptive TTL with context-aware bypass
// =============================================================================
//
// Two read contexts:
//   Critical   — entry/exit decisions. Always fetches fresh, then updates
//                the cache.
//   Monitoring — dashboards, periodic checks. Serves the cached price while
//                its age is under ttl(volatility).
//
// The TTL interpolates linearly between MAX_TTL (quiet token, σ ≤ 1 %) and
// MIN_TTL (violent token, σ ≥ 5 %). Unknown tokens get MIN_TTL.
//
// On a refresh failure the stale value is served with a warning; only a
// token with no prior value surfaces `PriceUnavailable`.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{BotError, BotResult};
use crate::market::pair::PairClient;

/// TTL floor, applied at σ ≥ 5 % and to unknown tokens.
pub const MIN_TTL: Duration = Duration::from_secs(15);
/// TTL ceiling, applied at σ ≤ 1 %.
pub const MAX_TTL: Duration = Duration::from_secs(60);

/// Volatility endpoints for the interpolation (fractions, not percent).
const SIGMA_LOW: f64 = 0.01;
const SIGMA_HIGH: f64 = 0.05;

/// Rolling window length per token.
const WINDOW: usize = 20;
/// Volatility is recomputed every this many writes.
const VOL_RECOMPUTE_EVERY: u8 = 5;

/// Why the price is being read. Critical reads must not trade on stale data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceContext {
    Critical,
    Monitoring,
}

struct PriceEntry {
    price: f64,
    fetched_at: Instant,
    source: String,
    recent: VecDeque<f64>,
    volatility: Option<f64>,
    writes_since_vol: u8,
}

/// Disk form of one cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    price: f64,
    age_secs: u64,
    #[serde(default)]
    source: String,
    #[serde(default)]
    recent: Vec<f64>,
    #[serde(default)]
    volatility: Option<f64>,
}

/// Thread-safe price cache in front of the pair feed.
pub struct PriceCache {
    entries: RwLock<HashMap<String, PriceEntry>>,
    pairs: Arc<PairClient>,
}

impl PriceCache {
    pub fn new(pairs: Arc<PairClient>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            pairs,
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Read a price under the given context.
    pub async fn price(&self, mint: &str, context: PriceContext) -> BotResult<f64> {
        if context == PriceContext::Monitoring {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(mint) {
                let ttl = ttl_for(entry.volatility);
                let age = entry.fetched_at.elapsed();
                if age < ttl {
                    debug!(
                        mint,
                        price = entry.price,
                        age_ms = age.as_millis() as u64,
                        ttl_ms = ttl.as_millis() as u64,
                        "price served from cache"
                    );
                    return Ok(entry.price);
                }
            }
        }

        // Critical context, cache miss, or expired entry: fetch fresh.
        match self.pairs.price(mint).await {
            Ok(price) => {
                self.record(mint, price, "pair-feed");
                Ok(price)
            }
            Err(e) => {
                // Stale fallback — better a dated price than none, except when
                // we never had one.
                let entries = self.entries.read();
                match entries.get(mint) {
                    Some(entry) => {
                        warn!(
                            mint,
                            stale_price = entry.price,
                            age_secs = entry.fetched_at.elapsed().as_secs(),
                            error = %e,
                            "price refresh failed — serving stale value"
                        );
                        Ok(entry.price)
                    }
                    None => Err(BotError::PriceUnavailable(mint.to_string())),
                }
            }
        }
    }

    /// Last known volatility for a token (fraction).
    pub fn volatility(&self, mint: &str) -> Option<f64> {
        self.entries.read().get(mint).and_then(|e| e.volatility)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Record a fresh price into the rolling window.
    pub fn record(&self, mint: &str, price: f64, source: &str) {
        let mut entries = self.entries.write();
        let entry = entries.entry(mint.to_string()).or_insert_with(|| PriceEntry {
            price,
            fetched_at: Instant::now(),
            source: source.to_string(),
            recent: VecDeque::with_capacity(WINDOW),
            volatility: None,
            writes_since_vol: 0,
        });

        entry.price = price;
        entry.fetched_at = Instant::now();
        entry.source = source.to_string();

        entry.recent.push_back(price);
        while entry.recent.len() > WINDOW {
            entry.recent.pop_front();
        }

        entry.writes_since_vol += 1;
        if entry.writes_since_vol >= VOL_RECOMPUTE_EVERY {
            entry.writes_since_vol = 0;
            let window: Vec<f64> = entry.recent.iter().copied().collect();
            entry.volatility = relative_stddev(&window);
            debug!(mint, volatility = ?entry.volatility, "volatility recomputed");
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot persistence
    // -------------------------------------------------------------------------

    /// Write the cache to a JSON snapshot (atomic tmp + rename). Ages are
    /// stored as seconds so a restart can rebuild the entries.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let snapshot: HashMap<String, PersistedEntry> = self
            .entries
            .read()
            .iter()
            .map(|(mint, entry)| {
                (
                    mint.clone(),
                    PersistedEntry {
                        price: entry.price,
                        age_secs: entry.fetched_at.elapsed().as_secs(),
                        source: entry.source.clone(),
                        recent: entry.recent.iter().copied().collect(),
                        volatility: entry.volatility,
                    },
                )
            })
            .collect();

        let content = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialise price cache")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {}", path.display()))?;
        Ok(())
    }

    /// Rebuild entries from a snapshot file; a missing or unreadable file is
    /// ignored. Restored entries keep their recorded age, so anything past
    /// its TTL serves only as a stale fallback.
    pub fn restore(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let snapshot: HashMap<String, PersistedEntry> = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "price cache snapshot unparsable — ignored");
                    return;
                }
            },
            Err(_) => return,
        };

        let mut entries = self.entries.write();
        for (mint, saved) in snapshot {
            entries.insert(
                mint,
                PriceEntry {
                    price: saved.price,
                    fetched_at: Instant::now() - Duration::from_secs(saved.age_secs),
                    source: saved.source,
                    recent: saved.recent.into_iter().collect(),
                    volatility: saved.volatility,
                    writes_since_vol: 0,
                },
            );
        }
        debug!(count = entries.len(), "price cache restored from snapshot");
    }

    #[cfg(test)]
    fn age_entry(&self, mint: &str, age: Duration) {
        if let Some(entry) = self.entries.write().get_mut(mint) {
            entry.fetched_at = Instant::now() - age;
        }
    }

    #[cfg(test)]
    fn set_volatility(&self, mint: &str, vol: f64) {
        if let Some(entry) = self.entries.write().get_mut(mint) {
            entry.volatility = Some(vol);
        }
    }
}

impl std::fmt::Debug for PriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceCache")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

/// TTL as a function of volatility: MAX_TTL at σ ≤ 1 %, MIN_TTL at σ ≥ 5 %,
/// linear in between. `None` (unknown token) maps to MIN_TTL.
pub fn ttl_for(volatility: Option<f64>) -> Duration {
    let sigma = match volatility {
        Some(v) => v,
        None => return MIN_TTL,
    };

    if sigma <= SIGMA_LOW {
        return MAX_TTL;
    }
    if sigma >= SIGMA_HIGH {
        return MIN_TTL;
    }

    let span = MAX_TTL.as_secs_f64() - MIN_TTL.as_secs_f64();
    let fraction = (sigma - SIGMA_LOW) / (SIGMA_HIGH - SIGMA_LOW);
    Duration::from_secs_f64(MAX_TTL.as_secs_f64() - fraction * span)
}

/// Standard deviation of consecutive relative differences over the window.
/// Needs at least three prices to say anything.
pub fn relative_stddev(prices: &[f64]) -> Option<f64> {
    if prices.len() < 3 {
        return None;
    }

    let diffs: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if diffs.len() < 2 {
        return None;
    }

    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
    let variance = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / diffs.len() as f64;
    Some(variance.sqrt())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_endpoints() {
        assert_eq!(ttl_for(Some(0.01)), MAX_TTL);
        assert_eq!(ttl_for(Some(0.005)), MAX_TTL);
        assert_eq!(ttl_for(Some(0.05)), MIN_TTL);
        assert_eq!(ttl_for(Some(0.10)), MIN_TTL);
        assert_eq!(ttl_for(None), MIN_TTL, "unknown tokens get the floor");
    }

    #[test]
    fn ttl_interpolates_linearly() {
        // σ = 3 % is the midpoint: 60 - 0.5 * 45 = 37.5 s.
        let ttl = ttl_for(Some(0.03));
        assert!((ttl.as_secs_f64() - 37.5).abs() < 1e-9);
    }

    #[test]
    fn stddev_of_constant_series_is_zero() {
        let vol = relative_stddev(&[1.0, 1.0, 1.0, 1.0]).unwrap();
        assert!(vol.abs() < 1e-12);
    }

    #[test]
    fn stddev_needs_three_prices() {
        assert!(relative_stddev(&[1.0, 1.1]).is_none());
        assert!(relative_stddev(&[1.0, 1.1, 1.2]).is_some());
    }

    #[tokio::test]
    async fn monitoring_hit_within_ttl() {
        let cache = PriceCache::new(Arc::new(PairClient::new("http://127.0.0.1:1")));
        for _ in 0..5 {
            cache.record("Mint111", 1.0, "test");
        }
        cache.set_volatility("Mint111", 0.01); // quiet token → 60 s TTL
        cache.age_entry("Mint111", Duration::from_secs(30));

        // 30 s old with a 60 s TTL — served from cache, no network touched
        // (the pair client points at a dead address).
        let price = cache
            .price("Mint111", PriceContext::Monitoring)
            .await
            .unwrap();
        assert!((price - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn expired_entry_falls_back_to_stale_on_network_failure() {
        let cache = PriceCache::new(Arc::new(PairClient::new("http://127.0.0.1:1")));
        cache.record("Mint111", 2.5, "test");
        cache.age_entry("Mint111", Duration::from_secs(600));

        // Refresh fails (dead endpoint) — the stale value is returned.
        let price = cache
            .price("Mint111", PriceContext::Monitoring)
            .await
            .unwrap();
        assert!((price - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unknown_token_with_dead_feed_is_unavailable() {
        let cache = PriceCache::new(Arc::new(PairClient::new("http://127.0.0.1:1")));
        let err = cache
            .price("Unknown", PriceContext::Critical)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::PriceUnavailable(_)));
    }

    #[test]
    fn snapshot_roundtrip_preserves_entries() {
        let path = std::env::temp_dir().join(format!(
            "helios-price-cache-{}.json",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();

        let cache = PriceCache::new(Arc::new(PairClient::new("http://127.0.0.1:1")));
        for _ in 0..5 {
            cache.record("Mint111", 2.0, "test");
        }
        cache.save(&path).unwrap();

        let restored = PriceCache::new(Arc::new(PairClient::new("http://127.0.0.1:1")));
        restored.restore(&path);
        {
            let entries = restored.entries.read();
            let entry = entries.get("Mint111").unwrap();
            assert!((entry.price - 2.0).abs() < f64::EPSILON);
            assert_eq!(entry.recent.len(), 5);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn window_is_bounded() {
        let cache = PriceCache::new(Arc::new(PairClient::new("http://127.0.0.1:1")));
        for i in 0..50 {
            cache.record("Mint111", 1.0 + i as f64 * 0.01, "test");
        }
        let entries = cache.entries.read();
        assert_eq!(entries.get("Mint111").unwrap().recent.len(), WINDOW);
    }
}
