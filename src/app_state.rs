// =============================================================================
// Application State — the fully constructed service bundle
// =============================================================================
//
// Everything the engine needs is built here in one startup sequence and
// handed out as Arc references. The orchestrator owns the lifetime; other
// tasks only borrow. Besides the managers, AppState carries the small
// cross-cutting collections: the decision audit ring, the recently-analysed
// TTL set, and the validation blacklist.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::info;

use crate::config::{load_keypair, SecretStore, Settings};
use crate::errors::BotResult;
use crate::exec::{Executor, JupiterClient};
use crate::learner::AdaptiveLearner;
use crate::ledger::BalanceLedger;
use crate::llm::LlmValidator;
use crate::market::{DiscoveryAggregator, HistoryClient, PairClient, PriceCache};
use crate::notify::Notifier;
use crate::position_manager::PositionManager;
use crate::positions::PositionStore;
use crate::risk::RiskManager;
use crate::rpc::{BudgetGovernor, RpcGateway, SubscriptionMultiplexer};
use crate::strategy::StrategyEnsemble;
use crate::types::DecisionRecord;
use crate::validator::BaseValidator;

/// Decision audit ring size.
const MAX_RECENT_DECISIONS: usize = 100;
/// Blacklist entry lifetime.
const BLACKLIST_TTL: Duration = Duration::from_secs(3600);

pub struct AppState {
    pub settings: Settings,
    pub secrets: Arc<SecretStore>,

    // ── Resource layer ──────────────────────────────────────────────────
    pub budget: Arc<BudgetGovernor>,
    pub rpc: Arc<RpcGateway>,
    pub subscriptions: Arc<SubscriptionMultiplexer>,
    pub pairs: Arc<PairClient>,
    pub price_cache: Arc<PriceCache>,
    pub history: Arc<HistoryClient>,
    pub ledger: Arc<BalanceLedger>,
    pub positions: Arc<PositionStore>,

    // ── Decision layer ──────────────────────────────────────────────────
    pub discovery: Arc<DiscoveryAggregator>,
    pub validator: Arc<BaseValidator>,
    pub ensemble: Arc<StrategyEnsemble>,
    pub risk: Arc<RiskManager>,
    pub learner: Arc<AdaptiveLearner>,
    pub llm: Arc<LlmValidator>,

    // ── Execution layer ─────────────────────────────────────────────────
    pub executor: Arc<Executor>,
    pub position_manager: Arc<PositionManager>,
    pub notifier: Arc<Notifier>,

    // ── Cross-cutting state ─────────────────────────────────────────────
    pub recent_decisions: RwLock<Vec<DecisionRecord>>,
    recently_analysed: RwLock<HashMap<String, Instant>>,
    blacklist: RwLock<HashMap<String, Instant>>,
    pub baseline_balance_sol: RwLock<f64>,
    pub start_time: Instant,
}

impl AppState {
    /// One startup sequence building every manager. Fails only on the
    /// startup-fatal errors (bad key material, unreachable baseline
    /// balance, exhausted budget at boot).
    pub async fn init(settings: Settings, secrets: Arc<SecretStore>) -> Result<Arc<Self>> {
        let budget = Arc::new(BudgetGovernor::load(
            settings.state_path("rpc_budget.json"),
            settings.rpc_budget_base,
        ));
        budget
            .ensure_available_at_startup()
            .context("RPC budget exhausted at startup")?;

        let rpc = Arc::new(RpcGateway::new(settings.rpc_url.clone(), budget.clone()));
        let subscriptions = SubscriptionMultiplexer::new(settings.rpc_ws_url.clone());
        let pairs = Arc::new(PairClient::new(settings.pair_api_url.clone()));
        let price_cache = Arc::new(PriceCache::new(pairs.clone()));
        price_cache.restore(settings.state_path("price_cache.json"));
        let history = Arc::new(HistoryClient::new(
            settings.history_api_url.clone(),
            secrets.get_sensitive("HISTORY_API_KEY", "state-init"),
        ));

        let keypair = load_keypair(&secrets).context("failed to load wallet keypair")?;
        let wallet = solana_sdk::signer::Signer::pubkey(&keypair);
        info!(wallet = %wallet, "wallet loaded");

        let ledger = Arc::new(
            BalanceLedger::init(rpc.clone(), wallet)
                .await
                .context("failed to read the initial SOL balance")?,
        );
        let positions = Arc::new(PositionStore::load(
            rpc.clone(),
            wallet,
            settings.state_path("entry_prices.json"),
        ));

        let discovery = Arc::new(DiscoveryAggregator::new(&settings, pairs.clone()));
        let validator = Arc::new(BaseValidator::new(&settings, pairs.clone(), history.clone()));
        let ensemble = Arc::new(StrategyEnsemble::from_settings(&settings));
        let risk = Arc::new(RiskManager::new(&settings, history.clone()));
        let learner = Arc::new(AdaptiveLearner::load(settings.state_path("learner.json")));
        let llm = Arc::new(LlmValidator::new(
            settings.llm_api_url.clone(),
            secrets.get_sensitive("LLM_API_KEY", "state-init"),
            settings.llm_model.clone(),
        ));

        let executor = Arc::new(Executor::new(
            JupiterClient::new(settings.aggregator_url.clone()),
            rpc.clone(),
            ledger.clone(),
            positions.clone(),
            keypair,
            settings.clone(),
        ));

        let notifier = Arc::new(Notifier::new(
            secrets.get_sensitive("TELEGRAM_BOT_TOKEN", "state-init"),
            std::env::var("TELEGRAM_CHAT_ID").ok(),
        ));

        let position_manager = PositionManager::new(
            positions.clone(),
            price_cache.clone(),
            pairs.clone(),
            executor.clone(),
            learner.clone(),
            notifier.clone(),
            settings.clone(),
        );

        let baseline = ledger.local_balance();

        Ok(Arc::new(Self {
            settings,
            secrets,
            budget,
            rpc,
            subscriptions,
            pairs,
            price_cache,
            history,
            ledger,
            positions,
            discovery,
            validator,
            ensemble,
            risk,
            learner,
            llm,
            executor,
            position_manager,
            notifier,
            recent_decisions: RwLock::new(Vec::new()),
            recently_analysed: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashMap::new()),
            baseline_balance_sol: RwLock::new(baseline),
            start_time: Instant::now(),
        }))
    }

    // -------------------------------------------------------------------------
    // Decision audit
    // -------------------------------------------------------------------------

    pub fn push_decision(&self, record: DecisionRecord) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(record);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
    }

    // -------------------------------------------------------------------------
    // Recently-analysed TTL set
    // -------------------------------------------------------------------------

    /// True when this mint was analysed inside the TTL window. A token is
    /// never in the pipeline twice simultaneously.
    pub fn recently_analysed(&self, mint: &str) -> bool {
        let ttl = Duration::from_secs(self.settings.seen_ttl_mins * 60);
        let map = self.recently_analysed.read();
        map.get(mint).map(|t| t.elapsed() < ttl).unwrap_or(false)
    }

    pub fn mark_analysed(&self, mint: &str) {
        let ttl = Duration::from_secs(self.settings.seen_ttl_mins * 60);
        let mut map = self.recently_analysed.write();
        map.retain(|_, t| t.elapsed() < ttl);
        map.insert(mint.to_string(), Instant::now());
    }

    // -------------------------------------------------------------------------
    // Blacklist
    // -------------------------------------------------------------------------

    pub fn blacklisted(&self, mint: &str) -> bool {
        self.blacklist
            .read()
            .get(mint)
            .map(|t| t.elapsed() < BLACKLIST_TTL)
            .unwrap_or(false)
    }

    pub fn blacklist(&self, mint: &str) {
        let mut map = self.blacklist.write();
        map.retain(|_, t| t.elapsed() < BLACKLIST_TTL);
        map.insert(mint.to_string(), Instant::now());
    }

    // -------------------------------------------------------------------------
    // Status snapshot
    // -------------------------------------------------------------------------

    /// Human-readable snapshot for the periodic status notification.
    pub async fn status_report(&self) -> String {
        let uptime_mins = self.start_time.elapsed().as_secs() / 60;
        let balance = self.ledger.local_balance();
        let baseline = *self.baseline_balance_sol.read();
        let open = self.positions.positions().await.len();
        let budget = self.budget.snapshot();
        let (patterns, history, exploration) = self.learner.summary();

        let recent = {
            let decisions = self.recent_decisions.read();
            let entered = decisions
                .iter()
                .filter(|d| d.final_decision == "ENTER")
                .count();
            format!("{} evaluated, {} entered", decisions.len(), entered)
        };

        format!(
            "uptime {uptime_mins}m | balance {balance:.4} SOL (baseline {baseline:.4}) | \
             {open} open positions | rpc {}/{} | learner: {patterns} patterns, \
             {history} trades, ε={exploration:.3} | recent: {recent}",
            budget.calls_used,
            self.budget.total_budget(),
        )
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("dry_run", &self.settings.dry_run)
            .field("decisions", &self.recent_decisions.read().len())
            .finish()
    }
}

/// Convenience: total capital reads go through the ledger.
impl AppState {
    pub async fn capital_sol(&self) -> f64 {
        self.ledger.get_balance().await
    }

    /// SOL value of an existing position, estimated from the monitoring
    /// price and the current SOL price. Degrades to zero when either price
    /// is unavailable — concentration then gates on the requested size only.
    pub async fn position_value_sol(&self, mint: &str) -> BotResult<f64> {
        use crate::market::PriceContext;
        use crate::types::SOL_MINT;

        let Some(position) = self.positions.position(mint).await else {
            return Ok(0.0);
        };

        let token_price = self
            .price_cache
            .price(mint, PriceContext::Monitoring)
            .await?;
        let sol_price = self
            .price_cache
            .price(SOL_MINT, PriceContext::Monitoring)
            .await?;
        if sol_price <= 0.0 {
            return Ok(0.0);
        }
        Ok(position.amount * token_price / sol_price)
    }
}
