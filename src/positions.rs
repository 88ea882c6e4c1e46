// =============================================================================
// Position Store — cached token-holdings view with entry-price persistence
// =============================================================================
//
// The wallet's SPL token accounts are refreshed at most once per CACHE_TTL;
// a refresh declined by the budget governor serves the cached view. Entry
// prices live in a JSON map written atomically on every confirmed buy and
// sell. Only non-zero positions are reported.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info, warn};

use crate::rpc::{RpcGateway, TokenAccountView};
use crate::types::SOL_MINT;

/// Token-account view lifetime.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// One held token position joined with its tracked metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub mint: String,
    pub amount: f64,
    pub decimals: u8,
    pub entry_price: Option<f64>,
    /// Worst unrealised P&L seen since open (≤ 0, percent).
    #[serde(default)]
    pub max_drawdown_pct: f64,
    #[serde(default)]
    pub doubling_count: u32,
    /// Entry pattern recorded by the strategy that opened the position.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Token liquidity at entry time (USD).
    #[serde(default)]
    pub liquidity_usd: f64,
    /// Token 24 h volume at entry time (USD).
    #[serde(default)]
    pub volume_24h_usd: f64,
    /// Entry size as a percentage of capital.
    #[serde(default)]
    pub position_size_pct: f64,
    /// Whether the risk manager saw the token as extended at entry.
    #[serde(default)]
    pub entered_extended: bool,
    pub opened_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PositionMeta {
    #[serde(default)]
    max_drawdown_pct: f64,
    #[serde(default)]
    doubling_count: u32,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    liquidity_usd: f64,
    #[serde(default)]
    volume_24h_usd: f64,
    #[serde(default)]
    position_size_pct: f64,
    #[serde(default)]
    entered_extended: bool,
    #[serde(default)]
    opened_at: String,
}

struct CachedView {
    accounts: Vec<TokenAccountView>,
    fetched_at: Instant,
}

/// Thread-safe store for holdings, entry prices, and per-position metadata.
pub struct PositionStore {
    rpc: Arc<RpcGateway>,
    wallet: Pubkey,
    cache: RwLock<Option<CachedView>>,
    entry_prices: RwLock<HashMap<String, f64>>,
    meta: RwLock<HashMap<String, PositionMeta>>,
    entry_path: PathBuf,
}

impl PositionStore {
    /// Load the entry-price map from `entry_path` (missing file = empty map).
    pub fn load(rpc: Arc<RpcGateway>, wallet: Pubkey, entry_path: impl Into<PathBuf>) -> Self {
        let entry_path = entry_path.into();
        let entry_prices: HashMap<String, f64> = match std::fs::read_to_string(&entry_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %entry_path.display(), error = %e, "entry-price file unparsable — starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        info!(
            path = %entry_path.display(),
            entries = entry_prices.len(),
            "position store initialised"
        );

        Self {
            rpc,
            wallet,
            cache: RwLock::new(None),
            entry_prices: RwLock::new(entry_prices),
            meta: RwLock::new(HashMap::new()),
            entry_path,
        }
    }

    // -------------------------------------------------------------------------
    // Holdings view
    // -------------------------------------------------------------------------

    /// Current non-zero positions. Refreshes the token-account view when the
    /// cache is stale and the budget allows; otherwise serves cached data.
    pub async fn positions(&self) -> Vec<Position> {
        self.refresh_if_stale().await;

        let cache = self.cache.read();
        let accounts = match cache.as_ref() {
            Some(view) => &view.accounts,
            None => return Vec::new(),
        };

        let entries = self.entry_prices.read();
        let meta = self.meta.read();

        accounts
            .iter()
            .filter(|a| a.ui_amount > 0.0 && a.mint != SOL_MINT)
            .map(|a| {
                let m = meta.get(&a.mint).cloned().unwrap_or_default();
                Position {
                    mint: a.mint.clone(),
                    amount: a.ui_amount,
                    decimals: a.decimals,
                    entry_price: entries.get(&a.mint).copied(),
                    max_drawdown_pct: m.max_drawdown_pct,
                    doubling_count: m.doubling_count,
                    pattern: m.pattern,
                    liquidity_usd: m.liquidity_usd,
                    volume_24h_usd: m.volume_24h_usd,
                    position_size_pct: m.position_size_pct,
                    entered_extended: m.entered_extended,
                    opened_at: m.opened_at,
                }
            })
            .collect()
    }

    /// Look up one position by mint.
    pub async fn position(&self, mint: &str) -> Option<Position> {
        self.positions().await.into_iter().find(|p| p.mint == mint)
    }

    /// On-chain token amount for a mint, bypassing the 5-minute cache.
    /// Used by the executor to size the second leg of a round trip.
    pub async fn fresh_amount(&self, mint: &str) -> Option<(f64, u8)> {
        match self.rpc.get_parsed_token_accounts(&self.wallet).await {
            Ok(accounts) => {
                self.store_view(accounts.clone());
                accounts
                    .into_iter()
                    .find(|a| a.mint == mint)
                    .map(|a| (a.ui_amount, a.decimals))
            }
            Err(e) => {
                debug!(mint, error = %e, "fresh amount lookup failed");
                None
            }
        }
    }

    /// Force the next `positions()` call to refresh.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    async fn refresh_if_stale(&self) {
        let stale = {
            let cache = self.cache.read();
            match cache.as_ref() {
                Some(view) => view.fetched_at.elapsed() > CACHE_TTL,
                None => true,
            }
        };
        if !stale {
            return;
        }

        match self.rpc.get_parsed_token_accounts(&self.wallet).await {
            Ok(accounts) => self.store_view(accounts),
            Err(e) => {
                // Budget declined or transport failed — the cached view (or
                // emptiness) stands.
                debug!(error = %e, "token-account refresh unavailable — serving cache");
            }
        }
    }

    fn store_view(&self, accounts: Vec<TokenAccountView>) {
        *self.cache.write() = Some(CachedView {
            accounts,
            fetched_at: Instant::now(),
        });
    }

    // -------------------------------------------------------------------------
    // Entry prices
    // -------------------------------------------------------------------------

    pub fn entry_price(&self, mint: &str) -> Option<f64> {
        self.entry_prices.read().get(mint).copied()
    }

    /// Record the entry price after a confirmed buy and persist synchronously.
    pub fn set_entry_price(&self, mint: &str, price: f64) {
        {
            let mut entries = self.entry_prices.write();
            entries.insert(mint.to_string(), price);
        }
        {
            let mut meta = self.meta.write();
            let m = meta.entry(mint.to_string()).or_default();
            if m.opened_at.is_empty() {
                m.opened_at = chrono::Utc::now().to_rfc3339();
            }
        }
        if let Err(e) = self.persist_entries() {
            warn!(mint, error = %e, "failed to persist entry prices");
        }
        debug!(mint, price, "entry price recorded");
    }

    /// Remove a position's entry after a confirmed sell.
    pub fn remove_entry(&self, mint: &str) {
        self.entry_prices.write().remove(mint);
        self.meta.write().remove(mint);
        if let Err(e) = self.persist_entries() {
            warn!(mint, error = %e, "failed to persist entry prices");
        }
        self.invalidate();
        debug!(mint, "entry removed");
    }

    /// Mints currently held without a recorded entry price.
    pub async fn missing_entry_mints(&self) -> Vec<String> {
        self.positions()
            .await
            .into_iter()
            .filter(|p| p.entry_price.is_none())
            .map(|p| p.mint)
            .collect()
    }

    fn persist_entries(&self) -> Result<()> {
        let entries = self.entry_prices.read().clone();
        let content =
            serde_json::to_string_pretty(&entries).context("failed to serialise entry prices")?;

        if let Some(parent) = self.entry_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let tmp = self.entry_path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.entry_path)
            .with_context(|| format!("failed to rename {}", self.entry_path.display()))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Per-position metadata
    // -------------------------------------------------------------------------

    /// Track the worst drawdown seen for a position (pct ≤ 0).
    pub fn note_drawdown(&self, mint: &str, pnl_pct: f64) {
        let mut meta = self.meta.write();
        let m = meta.entry(mint.to_string()).or_default();
        if pnl_pct < m.max_drawdown_pct {
            m.max_drawdown_pct = pnl_pct;
        }
    }

    /// Bump the doubling counter after a scale-in.
    pub fn record_doubling(&self, mint: &str) {
        let mut meta = self.meta.write();
        meta.entry(mint.to_string()).or_default().doubling_count += 1;
    }

    /// Remember the entry pattern for learner feedback at exit time.
    pub fn set_pattern(&self, mint: &str, pattern: &str) {
        let mut meta = self.meta.write();
        meta.entry(mint.to_string()).or_default().pattern = Some(pattern.to_string());
    }

    /// Record the market context the position was entered under. The learner
    /// keys its state-action table and risk aggregates off these at exit.
    pub fn set_entry_context(
        &self,
        mint: &str,
        liquidity_usd: f64,
        volume_24h_usd: f64,
        position_size_pct: f64,
        entered_extended: bool,
    ) {
        let mut meta = self.meta.write();
        let m = meta.entry(mint.to_string()).or_default();
        m.liquidity_usd = liquidity_usd;
        m.volume_24h_usd = volume_24h_usd;
        m.position_size_pct = position_size_pct;
        m.entered_extended = entered_extended;
    }

    #[cfg(test)]
    fn seed_view(&self, accounts: Vec<TokenAccountView>) {
        self.store_view(accounts);
    }
}

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStore")
            .field("entry_prices", &self.entry_prices.read().len())
            .field("cached", &self.cache.read().is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::BudgetGovernor;
    use std::str::FromStr;

    fn store(name: &str) -> PositionStore {
        let budget_path =
            std::env::temp_dir().join(format!("helios-pos-budget-{name}-{}.json", std::process::id()));
        std::fs::remove_file(&budget_path).ok();
        let budget = Arc::new(BudgetGovernor::load(budget_path, 0));
        let rpc = Arc::new(RpcGateway::new("http://127.0.0.1:1", budget));
        let entry_path =
            std::env::temp_dir().join(format!("helios-pos-entries-{name}-{}.json", std::process::id()));
        std::fs::remove_file(&entry_path).ok();
        PositionStore::load(rpc, Pubkey::from_str("11111111111111111111111111111111").unwrap(), entry_path)
    }

    fn account(mint: &str, amount: f64) -> TokenAccountView {
        TokenAccountView {
            mint: mint.to_string(),
            ui_amount: amount,
            decimals: 6,
        }
    }

    #[tokio::test]
    async fn budget_declined_refresh_serves_cache() {
        let store = store("cache");
        store.seed_view(vec![account("MintA", 100.0), account("MintB", 0.0)]);

        // Budget base is 0 so the refresh is declined; the seeded view stands
        // and the zero-amount account is filtered out.
        let positions = store.positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].mint, "MintA");
    }

    #[tokio::test]
    async fn entry_price_roundtrip_persists() {
        let store = store("entries");
        store.set_entry_price("MintA", 0.042);
        assert_eq!(store.entry_price("MintA"), Some(0.042));

        // Reload from the same file.
        let path = store.entry_path.clone();
        let raw = std::fs::read_to_string(&path).unwrap();
        let map: HashMap<String, f64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(map.get("MintA"), Some(&0.042));

        store.remove_entry("MintA");
        assert_eq!(store.entry_price("MintA"), None);
        let raw = std::fs::read_to_string(&path).unwrap();
        let map: HashMap<String, f64> = serde_json::from_str(&raw).unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn drawdown_is_monotone_worst() {
        let store = store("drawdown");
        store.seed_view(vec![account("MintA", 10.0)]);
        store.note_drawdown("MintA", -5.0);
        store.note_drawdown("MintA", -2.0); // better — must not overwrite
        store.note_drawdown("MintA", -9.0);

        let positions = store.positions().await;
        assert!((positions[0].max_drawdown_pct + 9.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn entry_context_survives_to_position_view() {
        let store = store("context");
        store.seed_view(vec![account("MintA", 10.0)]);
        store.set_entry_context("MintA", 200_000.0, 150_000.0, 22.5, false);

        let positions = store.positions().await;
        assert!((positions[0].liquidity_usd - 200_000.0).abs() < f64::EPSILON);
        assert!((positions[0].volume_24h_usd - 150_000.0).abs() < f64::EPSILON);
        assert!((positions[0].position_size_pct - 22.5).abs() < f64::EPSILON);
        assert!(!positions[0].entered_extended);
    }

    #[tokio::test]
    async fn missing_entries_reported() {
        let store = store("missing");
        store.seed_view(vec![account("MintA", 10.0), account("MintB", 5.0)]);
        store.set_entry_price("MintA", 1.0);

        let missing = store.missing_entry_mints().await;
        assert_eq!(missing, vec!["MintB".to_string()]);
    }
}
