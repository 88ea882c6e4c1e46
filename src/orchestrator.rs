// =============================================================================
// Orchestrator — scan loop, candidate pipeline, periodic jobs, shutdown
// =============================================================================
//
// Lifecycle: INIT (AppState::init + the startup work here) → RUNNING (scan
// loop plus spawned jobs) → STOPPING (signal-driven teardown in main).
//
// Per candidate, the order is fixed:
//   discovery → base validation → strategy ensemble → risk gate →
//   learner confidence adjustment → LLM gate → executor
//
// Candidate processing is sequential inside a scan cycle to bound RPC
// pressure; the per-candidate I/O fan-out happens inside the components.
// Transient failure kinds skip the candidate, validation failures
// blacklist it, fatal kinds propagate.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::errors::BotError;
use crate::llm::dynamic_profit_target;
use crate::market::PriceContext;
use crate::rpc::subscriptions::{Observer, SubKey};
use crate::strategy::candlestick::detect_pattern;
use crate::strategy::TradeAction;
use crate::types::{DecisionRecord, DecisionStage, MarketMetrics, MarketState, TokenCandidate};

/// Raydium AMM v4 — the program whose logs announce new pools.
const NEW_POOL_PROGRAM: &str = "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8";

pub struct Orchestrator {
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
    jobs: Vec<tokio::task::JoinHandle<()>>,
    /// Wakes the scan loop early when the pool subscription sees activity.
    scan_nudge: Option<Arc<tokio::sync::Notify>>,
}

impl Orchestrator {
    pub fn new(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            state,
            shutdown,
            jobs: Vec::new(),
            scan_nudge: None,
        }
    }

    // -------------------------------------------------------------------------
    // INIT work beyond AppState construction
    // -------------------------------------------------------------------------

    pub async fn startup(&mut self) -> Result<()> {
        let state = &self.state;

        // Baseline balance and optional profit-multiplier target.
        let baseline = state.ledger.get_balance().await;
        *state.baseline_balance_sol.write() = baseline;
        if let Some(mult) = state.settings.target_mult {
            info!(
                baseline,
                target = baseline * mult,
                "profit-multiplier target armed"
            );
        }

        // Repair positions with missing entry prices by sampling the current
        // price; TP sells refuse unknown entries, so this keeps them eligible.
        for mint in state.positions.missing_entry_mints().await {
            match state.price_cache.price(&mint, PriceContext::Critical).await {
                Ok(price) => {
                    warn!(mint = %mint, price, "missing entry price — repaired from current price");
                    state.positions.set_entry_price(&mint, price);
                }
                Err(e) => warn!(mint = %mint, error = %e, "cannot repair entry price"),
            }
        }

        // Subscribe to new-pool events; the observer requests an early scan.
        let notify = Arc::new(tokio::sync::Notify::new());
        let observer_notify = notify.clone();
        let observer: Observer = Arc::new(move |event| {
            debug!(slot = event["context"]["slot"].as_u64().unwrap_or(0), "new-pool log event");
            observer_notify.notify_one();
            Ok(())
        });
        state.subscriptions.subscribe(
            SubKey::Logs {
                program_id: NEW_POOL_PROGRAM.to_string(),
                commitment: "processed".to_string(),
            },
            observer,
        );
        self.scan_nudge = Some(notify);

        // Periodic jobs.
        if state.settings.auto_tp {
            let pm = state.position_manager.clone();
            self.jobs.push(tokio::spawn(pm.run_take_profit_loop()));
        }
        if state.settings.auto_sl {
            let pm = state.position_manager.clone();
            self.jobs.push(tokio::spawn(pm.run_stop_loss_loop()));
        }

        // Balance verifier, every 60 s.
        let ledger = state.ledger.clone();
        self.jobs.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = ledger.verify("periodic").await {
                    debug!(error = %e, "periodic balance verify skipped");
                }
            }
        }));

        // Status snapshot job.
        let status_state = state.clone();
        let status_mins = state.settings.status_interval_mins.max(1);
        self.jobs.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(status_mins * 60));
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let report = status_state.status_report().await;
                status_state.notifier.send_status_update(report);
            }
        }));

        info!(jobs = self.jobs.len(), "orchestrator startup complete");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // RUNNING — the scan loop
    // -------------------------------------------------------------------------

    pub async fn run(&mut self) -> Result<()> {
        let scan_interval = Duration::from_secs(self.state.settings.scan_interval_secs);
        let deadline = self
            .state
            .settings
            .run_hours
            .map(|h| Instant::now() + Duration::from_secs_f64(h * 3600.0));

        info!(
            interval_secs = scan_interval.as_secs(),
            once = self.state.settings.once,
            "scan loop running"
        );

        loop {
            self.scan_cycle().await;

            if self.state.settings.once {
                info!("single-cycle mode — done");
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    info!("run-hours deadline reached — stopping");
                    break;
                }
            }
            if self.target_reached().await {
                info!("profit-multiplier target reached — stopping");
                self.state
                    .notifier
                    .send_general_alert("profit target reached — shutting down");
                break;
            }

            // Sleep until the next cycle, an early nudge from the pool
            // subscription, or shutdown.
            let nudge = self.scan_nudge.clone();
            tokio::select! {
                _ = tokio::time::sleep(scan_interval) => {}
                _ = async {
                    match &nudge {
                        Some(n) => n.notified().await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    debug!("scan nudged by subscription event");
                }
                _ = self.shutdown.changed() => {
                    info!("shutdown signal — leaving scan loop");
                    break;
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    async fn target_reached(&self) -> bool {
        let Some(mult) = self.state.settings.target_mult else {
            return false;
        };
        let baseline = *self.state.baseline_balance_sol.read();
        baseline > 0.0 && self.state.ledger.local_balance() >= baseline * mult
    }

    async fn scan_cycle(&self) {
        let state = &self.state;
        debug!("scan cycle start");

        // Refresh the holdings view once per cycle.
        let open = state.positions.positions().await;
        debug!(open_positions = open.len(), "positions refreshed");

        // Forced-token mode evaluates exactly one mint, bypassing discovery.
        let candidates: Vec<TokenCandidate> = match &state.settings.forced_token {
            Some(mint) => match state.pairs.primary_pair(mint).await {
                Ok(pair) => vec![pair.to_candidate()],
                Err(e) => {
                    warn!(mint = %mint, error = %e, "forced token has no pair");
                    state.push_decision(DecisionRecord::blocked(
                        mint,
                        DecisionStage::Discovery,
                        format!("no tradable pair: {e}"),
                        0.0,
                    ));
                    Vec::new()
                }
            },
            None => state.discovery.discover().await,
        };

        // Sequential on purpose: bounds RPC pressure.
        for candidate in candidates {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.process_candidate(&candidate).await {
                if e.fatal_at_startup() {
                    error!(error = %e, "fatal error in candidate pipeline");
                    state
                        .notifier
                        .send_error_alert(format!("fatal pipeline error: {e}"));
                } else {
                    debug!(mint = %candidate.address, error = %e, "candidate skipped on error");
                }
            }
        }

        debug!("scan cycle end");
    }

    // -------------------------------------------------------------------------
    // Candidate pipeline
    // -------------------------------------------------------------------------

    async fn process_candidate(&self, candidate: &TokenCandidate) -> Result<(), BotError> {
        let state = &self.state;
        let mint = candidate.address.clone();

        if state.recently_analysed(&mint) {
            debug!(mint = %mint, "recently analysed — skipping");
            return Ok(());
        }
        if state.blacklisted(&mint) {
            debug!(mint = %mint, "blacklisted — skipping");
            return Ok(());
        }
        state.mark_analysed(&mint);

        // ── Base validation ──────────────────────────────────────────────
        let mut metrics: MarketMetrics;
        if state.settings.skip_validate {
            metrics = state
                .pairs
                .primary_pair(&mint)
                .await
                .map(|p| p.to_metrics())
                .unwrap_or_default();
        } else {
            let report = state.validator.validate(&mint).await?;
            if !report.passed {
                let reason = report.reason.unwrap_or_else(|| "validation failed".to_string());
                state.blacklist(&mint);
                state.push_decision(DecisionRecord::blocked(
                    &mint,
                    DecisionStage::Validator,
                    &reason,
                    0.0,
                ));
                return Err(BotError::ValidationFailed(reason));
            }
            metrics = match &report.pair {
                Some(pair) => pair.to_metrics(),
                None => state
                    .pairs
                    .primary_pair(&mint)
                    .await
                    .map(|p| p.to_metrics())
                    .unwrap_or_default(),
            };
            metrics.rsi = report.rsi;
            metrics.bullish_divergence = report.bullish_divergence;
        }

        // ── Strategy ensemble ────────────────────────────────────────────
        let existing = state.positions.position(&mint).await;
        let (mut combined, votes) = state
            .ensemble
            .evaluate(candidate, &metrics, existing.as_ref());

        // HOLD escape hatch: an explicitly enabled operator override lets a
        // strong suppressed Buy through.
        if combined.action == TradeAction::Hold && state.settings.allow_hold_buys {
            if let Some(best_buy) = votes
                .iter()
                .filter(|v| v.signal.action == TradeAction::Buy)
                .max_by(|a, b| {
                    a.signal
                        .confidence
                        .partial_cmp(&b.signal.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
            {
                if best_buy.signal.confidence >= state.settings.min_hold_confidence {
                    info!(
                        mint = %mint,
                        strategy = best_buy.name,
                        confidence = best_buy.signal.confidence,
                        "hold override engaged"
                    );
                    combined = best_buy.signal.clone();
                }
            }
        }

        if combined.action != TradeAction::Buy {
            state.push_decision(DecisionRecord::blocked(
                &mint,
                DecisionStage::Strategy,
                &combined.reason,
                combined.confidence,
            ));
            return Ok(());
        }

        // When several buy votes carry distinct patterns, let UCB1 pick the
        // label the learner wants explored, with an ε-greedy random override.
        let buy_patterns: Vec<&str> = votes
            .iter()
            .filter(|v| v.signal.action == TradeAction::Buy)
            .filter_map(|v| v.signal.pattern.as_deref())
            .collect();
        if buy_patterns.len() > 1 {
            use rand::Rng;
            let chosen = if rand::thread_rng().gen::<f64>() < state.learner.exploration_rate() {
                let idx = rand::thread_rng().gen_range(0..buy_patterns.len());
                debug!(mint = %mint, pattern = buy_patterns[idx], "exploration pick");
                Some(buy_patterns[idx].to_string())
            } else {
                state.learner.select_pattern(&buy_patterns)
            };
            if chosen.is_some() {
                combined.pattern = chosen;
            }
        }

        // ── Learner confidence adjustment ────────────────────────────────
        let market_state = MarketState::classify(candidate, &metrics);
        let (adjusted, reasons) = state.learner.adjust_confidence(
            combined.confidence,
            combined.pattern.as_deref(),
            &market_state,
        );
        if !reasons.is_empty() {
            debug!(mint = %mint, base = combined.confidence, adjusted, ?reasons, "confidence adjusted");
        }
        combined.confidence = adjusted;

        if combined.confidence < state.settings.min_confidence_threshold {
            state.push_decision(DecisionRecord::blocked(
                &mint,
                DecisionStage::Strategy,
                "confidence fell below floor after learner adjustment",
                combined.confidence,
            ));
            return Ok(());
        }

        // ── Risk gate ────────────────────────────────────────────────────
        let capital = state.capital_sol().await;
        let requested = combined
            .amount_sol
            .unwrap_or(state.settings.amount_sol)
            .clamp(state.settings.min_trade_sol, state.settings.max_trade_sol);
        let exposure = state.position_value_sol(&mint).await.unwrap_or(0.0);

        let assessment = state
            .risk
            .assess_entry(candidate, &metrics, capital, requested, exposure)
            .await;
        if !assessment.allowed {
            let reason = assessment
                .block_reason
                .unwrap_or_else(|| "risk blocked".to_string());
            state.push_decision(DecisionRecord::blocked(
                &mint,
                DecisionStage::Risk,
                &reason,
                combined.confidence,
            ));
            return Err(BotError::RiskBlocked(reason));
        }

        // Doubling into an existing position gets its own gate.
        if let Some(position) = &existing {
            let pnl_pct = position
                .entry_price
                .filter(|e| *e > 0.0)
                .map(|e| (candidate.price_usd - e) / e * 100.0)
                .unwrap_or(0.0);
            if let Err(reason) = state.risk.assess_doubling(position, pnl_pct) {
                state.push_decision(DecisionRecord::blocked(
                    &mint,
                    DecisionStage::Risk,
                    &reason,
                    combined.confidence,
                ));
                return Err(BotError::RiskBlocked(reason));
            }
        }

        combined.confidence *= assessment.confidence_multiplier;
        let size_sol = assessment.max_position_size_sol;

        // ── LLM gate ─────────────────────────────────────────────────────
        let pattern_hit = detect_pattern(&metrics);
        let verdict = state
            .llm
            .validate_entry(candidate, &metrics, &combined, pattern_hit.as_ref())
            .await;
        if !verdict.approved {
            state.push_decision(DecisionRecord::blocked(
                &mint,
                DecisionStage::Llm,
                &verdict.reason,
                combined.confidence,
            ));
            return Ok(());
        }

        // Dynamic profit target for the position manager.
        let (target_pct, target_reasons) = dynamic_profit_target(
            candidate.price_change_24h_pct,
            metrics.rvol,
            candidate.volume_24h_usd,
            candidate.liquidity_usd,
            verdict.confidence,
            0,
        );
        debug!(mint = %mint, target_pct, ?target_reasons, "dynamic profit target");

        // ── Execute ──────────────────────────────────────────────────────
        let outcome = if state.settings.roundtrip {
            state.executor.execute_round_trip(&mint, size_sol).await?
        } else if state.settings.multi_input {
            state.executor.execute_multi_input(&mint, size_sol).await?
        } else {
            state.executor.execute(&mint, size_sol).await?
        };

        if !outcome.success {
            let reason = outcome.reason.unwrap_or_else(|| "executor rejected".to_string());
            state.push_decision(DecisionRecord::blocked(
                &mint,
                DecisionStage::Executor,
                &reason,
                combined.confidence,
            ));
            return Ok(());
        }

        // ── Post-trade bookkeeping ───────────────────────────────────────
        state.position_manager.set_dynamic_target(&mint, target_pct);
        if !outcome.dry_run {
            let entry_price = state
                .price_cache
                .price(&mint, PriceContext::Critical)
                .await
                .unwrap_or(candidate.price_usd);
            state.positions.set_entry_price(&mint, entry_price);
            if let Some(pattern) = &combined.pattern {
                state.positions.set_pattern(&mint, pattern);
            }
            let size_pct = if capital > 0.0 {
                size_sol / capital * 100.0
            } else {
                0.0
            };
            state.positions.set_entry_context(
                &mint,
                candidate.liquidity_usd,
                candidate.volume_24h_usd,
                size_pct,
                assessment.extended,
            );
            if existing.is_some() {
                state.positions.record_doubling(&mint);
            }
        }

        state.push_decision(DecisionRecord::entered(&mint, combined.confidence));
        state.notifier.send_trade_alert(format!(
            "{} {} with {:.4} SOL (confidence {:.2}, target {:.1}%, impact {:.2}%){}",
            if outcome.dry_run { "DRY-RUN BUY" } else { "BOUGHT" },
            mint,
            size_sol,
            combined.confidence,
            target_pct,
            outcome.price_impact_pct,
            outcome
                .signature
                .as_deref()
                .map(|s| format!(" sig {s}"))
                .unwrap_or_default(),
        ));

        Ok(())
    }

    // -------------------------------------------------------------------------
    // STOPPING
    // -------------------------------------------------------------------------

    async fn teardown(&mut self) {
        let state = &self.state;
        info!("orchestrator teardown");

        state.subscriptions.unsubscribe_all();
        for job in self.jobs.drain(..) {
            job.abort();
        }

        let report = state.status_report().await;
        state
            .notifier
            .send_general_alert(format!("shutting down — final status: {report}"));

        if let Err(e) = state.budget.persist() {
            warn!(error = %e, "failed to persist budget on shutdown");
        }
        if let Err(e) = state.learner.persist() {
            warn!(error = %e, "failed to persist learner on shutdown");
        }
        if let Err(e) = state
            .price_cache
            .save(state.settings.state_path("price_cache.json"))
        {
            warn!(error = %e, "failed to persist price cache on shutdown");
        }
        if let Err(e) = state
            .ledger
            .save(state.settings.state_path("balance_ledger.json"))
        {
            warn!(error = %e, "failed to persist ledger on shutdown");
        }

        // Grace window for in-flight notifications.
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
