// =============================================================================
// Position Manager — take-profit and stop-loss loops with an AI exit overlay
// =============================================================================
//
// Two independent interval tasks walk the open positions. A shared
// in-flight set serialises the TP and SL checks for the same mint, so one
// tick cannot double-sell.
//
// Exit precedence per position:
//   1. AI overlay — emergency levels, candlestick reversal, learned-average
//      profit capture, stagnation, fast-pump capture.
//   2. Take-profit against the LLM's dynamic target (else the configured
//      minimum), guarded by impact and minimum-output checks.
//   3. Stop-loss below entry · (1 − SL%/100).
//
// Positions without a recorded entry price are never sold here; the
// orchestrator repairs those at startup.
//
// On a confirmed sell the executor settles the ledger; this module removes
// the entry price, notifies, and feeds the full outcome to the learner.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use solana_sdk::native_token::lamports_to_sol;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::exec::Executor;
use crate::learner::{AdaptiveLearner, TradeOutcome};
use crate::market::pair::PairClient;
use crate::market::{PriceCache, PriceContext};
use crate::notify::Notifier;
use crate::positions::{Position, PositionStore};
use crate::strategy::candlestick::{detect_pattern, CandlePattern};
use crate::types::{MarketMetrics, Regime};

/// AI overlay emergency thresholds.
const EMERGENCY_LOSS_PCT: f64 = -25.0;
const EMERGENCY_PROFIT_PCT: f64 = 75.0;
/// Reversal exits need this much pattern strength plus volume confirmation.
const REVERSAL_MIN_STRENGTH: f64 = 0.7;
const REVERSAL_MIN_RVOL: f64 = 1.5;
/// Capture once this share of the learned average profit is reached.
const LEARNED_CAPTURE_FRACTION: f64 = 0.9;
/// Stagnation heuristic: this old with P&L inside ±1 %.
const STAGNANT_HOURS: f64 = 6.0;
const STAGNANT_BAND_PCT: f64 = 1.0;
/// Fast-pump heuristic: this young with P&L at least this high.
const FAST_PUMP_MAX_MINUTES: f64 = 30.0;
const FAST_PUMP_MIN_PCT: f64 = 25.0;
/// TP execution guards.
const TP_MAX_IMPACT_PCT: f64 = 5.0;
const TP_MIN_OUT_SOL: f64 = 0.001;

/// Why a position is being closed.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    TakeProfit { target_pct: f64 },
    StopLoss,
    Emergency(String),
    Reversal(String),
    LearnedTarget { avg_pct: f64 },
    Stagnant,
    FastPump,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit { target_pct } => write!(f, "take-profit at {target_pct:.1}% target"),
            Self::StopLoss => write!(f, "stop-loss"),
            Self::Emergency(detail) => write!(f, "emergency exit: {detail}"),
            Self::Reversal(detail) => write!(f, "reversal exit: {detail}"),
            Self::LearnedTarget { avg_pct } => {
                write!(f, "learned target (90% of avg {avg_pct:.1}%)")
            }
            Self::Stagnant => write!(f, "stagnant position"),
            Self::FastPump => write!(f, "fast pump capture"),
        }
    }
}

/// AI overlay decision, independent of TP/SL settings.
pub fn ai_exit_reason(
    pnl_pct: f64,
    hold_minutes: f64,
    metrics: &MarketMetrics,
    learned_avg_profit: Option<f64>,
) -> Option<ExitReason> {
    if pnl_pct <= EMERGENCY_LOSS_PCT {
        return Some(ExitReason::Emergency(format!("drawdown {pnl_pct:.1}%")));
    }
    if pnl_pct >= EMERGENCY_PROFIT_PCT {
        return Some(ExitReason::Emergency(format!("windfall {pnl_pct:.1}%")));
    }

    if let Some(hit) = detect_pattern(metrics) {
        if hit.pattern == CandlePattern::ShootingStar
            && hit.strength >= REVERSAL_MIN_STRENGTH
            && metrics.rvol >= REVERSAL_MIN_RVOL
        {
            return Some(ExitReason::Reversal(format!(
                "{} strength {:.2}, rvol {:.2}",
                hit.pattern, hit.strength, metrics.rvol
            )));
        }
    }

    if let Some(avg) = learned_avg_profit {
        if avg > 0.0 && pnl_pct >= avg * LEARNED_CAPTURE_FRACTION {
            return Some(ExitReason::LearnedTarget { avg_pct: avg });
        }
    }

    if hold_minutes >= STAGNANT_HOURS * 60.0 && pnl_pct.abs() < STAGNANT_BAND_PCT {
        return Some(ExitReason::Stagnant);
    }
    if hold_minutes <= FAST_PUMP_MAX_MINUTES && pnl_pct >= FAST_PUMP_MIN_PCT {
        return Some(ExitReason::FastPump);
    }

    None
}

/// TP guard: target reached AND the exit is actually executable.
pub fn tp_should_sell(pnl_pct: f64, target_pct: f64, impact_pct: f64, est_out_sol: f64) -> bool {
    pnl_pct >= target_pct && impact_pct <= TP_MAX_IMPACT_PCT && est_out_sol >= TP_MIN_OUT_SOL
}

/// SL guard: `current < entry · (1 − sl_pct/100)`.
pub fn sl_should_sell(current_price: f64, entry_price: f64, sl_pct: f64) -> bool {
    current_price < entry_price * (1.0 - sl_pct / 100.0)
}

pub struct PositionManager {
    positions: Arc<PositionStore>,
    price_cache: Arc<PriceCache>,
    pairs: Arc<PairClient>,
    executor: Arc<Executor>,
    learner: Arc<AdaptiveLearner>,
    notifier: Arc<Notifier>,
    settings: Settings,
    /// Dynamic per-mint TP targets provided by the LLM at entry time.
    dynamic_targets: RwLock<HashMap<String, f64>>,
    /// Mints currently mid-check; serialises TP vs SL for the same tick.
    in_flight: Mutex<HashSet<String>>,
}

impl PositionManager {
    pub fn new(
        positions: Arc<PositionStore>,
        price_cache: Arc<PriceCache>,
        pairs: Arc<PairClient>,
        executor: Arc<Executor>,
        learner: Arc<AdaptiveLearner>,
        notifier: Arc<Notifier>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            positions,
            price_cache,
            pairs,
            executor,
            learner,
            notifier,
            settings,
            dynamic_targets: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Record the LLM's dynamic profit target for a fresh entry.
    pub fn set_dynamic_target(&self, mint: &str, target_pct: f64) {
        self.dynamic_targets
            .write()
            .insert(mint.to_string(), target_pct);
        debug!(mint, target_pct, "dynamic profit target set");
    }

    // -------------------------------------------------------------------------
    // Loops
    // -------------------------------------------------------------------------

    /// Take-profit loop. Spawn once; runs until the task is aborted.
    pub async fn run_take_profit_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.settings.tp_interval_ms));
        info!(
            interval_ms = self.settings.tp_interval_ms,
            "take-profit loop started"
        );
        loop {
            ticker.tick().await;
            self.take_profit_tick().await;
        }
    }

    /// Stop-loss loop. Spawn once; runs until the task is aborted.
    pub async fn run_stop_loss_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.settings.sl_interval_ms));
        info!(
            interval_ms = self.settings.sl_interval_ms,
            "stop-loss loop started"
        );
        loop {
            ticker.tick().await;
            self.stop_loss_tick().await;
        }
    }

    async fn take_profit_tick(&self) {
        for position in self.positions.positions().await {
            let Some(_guard) = self.claim(&position.mint) else {
                continue;
            };

            let Some(entry) = position.entry_price else {
                debug!(mint = %position.mint, "no entry price — TP refuses to sell");
                continue;
            };

            let Some((pnl_pct, metrics)) = self.position_state(&position, entry).await else {
                continue;
            };
            self.positions.note_drawdown(&position.mint, pnl_pct);

            // AI overlay first — it can fire well before the TP target.
            let hold_minutes = hold_minutes(&position);
            let learned_avg = position
                .pattern
                .as_deref()
                .and_then(|p| self.learner.average_profit(p));
            if let Some(reason) = ai_exit_reason(pnl_pct, hold_minutes, &metrics, learned_avg) {
                self.close_position(&position, pnl_pct, &metrics, reason).await;
                continue;
            }

            let target = self
                .dynamic_targets
                .read()
                .get(&position.mint)
                .copied()
                .unwrap_or(self.settings.tp_min_pct);
            if pnl_pct < target {
                continue;
            }

            // Target reached — confirm the exit is executable.
            let raw = raw_amount(&position);
            match self.executor.preview_sell(&position.mint, raw).await {
                Ok(quote) => {
                    let est_out_sol = lamports_to_sol(quote.out_amount);
                    if tp_should_sell(pnl_pct, target, quote.price_impact_pct, est_out_sol) {
                        self.close_position(
                            &position,
                            pnl_pct,
                            &metrics,
                            ExitReason::TakeProfit { target_pct: target },
                        )
                        .await;
                    } else {
                        debug!(
                            mint = %position.mint,
                            pnl_pct,
                            impact = quote.price_impact_pct,
                            est_out_sol,
                            "TP target met but exit not executable"
                        );
                    }
                }
                Err(e) => debug!(mint = %position.mint, error = %e, "TP preview failed"),
            }
        }
    }

    async fn stop_loss_tick(&self) {
        for position in self.positions.positions().await {
            let Some(_guard) = self.claim(&position.mint) else {
                continue;
            };

            let Some(entry) = position.entry_price else {
                continue;
            };

            let Some((pnl_pct, metrics)) = self.position_state(&position, entry).await else {
                continue;
            };
            self.positions.note_drawdown(&position.mint, pnl_pct);

            let hold_minutes = hold_minutes(&position);
            let learned_avg = position
                .pattern
                .as_deref()
                .and_then(|p| self.learner.average_profit(p));
            if let Some(reason) = ai_exit_reason(pnl_pct, hold_minutes, &metrics, learned_avg) {
                self.close_position(&position, pnl_pct, &metrics, reason).await;
                continue;
            }

            let current = entry * (1.0 + pnl_pct / 100.0);
            if sl_should_sell(current, entry, self.settings.sl_pct) {
                self.close_position(&position, pnl_pct, &metrics, ExitReason::StopLoss)
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Monitoring price + pair metrics for a held position.
    async fn position_state(
        &self,
        position: &Position,
        entry: f64,
    ) -> Option<(f64, MarketMetrics)> {
        let price = match self
            .price_cache
            .price(&position.mint, PriceContext::Monitoring)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                debug!(mint = %position.mint, error = %e, "no price for position check");
                return None;
            }
        };
        if entry <= 0.0 || price <= 0.0 {
            return None;
        }
        let pnl_pct = (price - entry) / entry * 100.0;

        let metrics = match self.pairs.primary_pair(&position.mint).await {
            Ok(pair) => pair.to_metrics(),
            Err(_) => MarketMetrics::default(),
        };
        Some((pnl_pct, metrics))
    }

    async fn close_position(
        &self,
        position: &Position,
        pnl_pct: f64,
        metrics: &MarketMetrics,
        reason: ExitReason,
    ) {
        info!(
            mint = %position.mint,
            pnl_pct,
            reason = %reason,
            "closing position"
        );

        let raw = raw_amount(position);
        let outcome = match self.executor.execute_sell(&position.mint, raw).await {
            Ok(o) => o,
            Err(e) => {
                warn!(mint = %position.mint, error = %e, "sell failed");
                self.notifier
                    .send_error_alert(format!("sell failed for {}: {e}", position.mint));
                return;
            }
        };

        if !outcome.success {
            warn!(
                mint = %position.mint,
                reason = ?outcome.reason,
                "sell not executed"
            );
            return;
        }

        // The executor already credited the ledger; finish the lifecycle.
        let entry = position.entry_price.unwrap_or(0.0);
        let exit_price = entry * (1.0 + pnl_pct / 100.0);
        self.positions.remove_entry(&position.mint);
        self.dynamic_targets.write().remove(&position.mint);

        let regime = regime_from_metrics(metrics);
        let trade = TradeOutcome {
            mint: position.mint.clone(),
            entry_price: entry,
            exit_price,
            profit_pct: pnl_pct,
            hold_minutes: hold_minutes(position),
            volume_24h: position.volume_24h_usd,
            liquidity: position.liquidity_usd,
            rvol: metrics.rvol,
            pattern: position.pattern.clone(),
            regime,
            ai_confidence: 0.0,
            signals: vec![reason.to_string()],
            position_size_pct: position.position_size_pct,
            max_drawdown_pct: position.max_drawdown_pct,
            entered_extended: position.entered_extended,
            doublings: position.doubling_count,
            closed_at: chrono::Utc::now().to_rfc3339(),
        };
        self.learner.record_trade(&trade);

        self.notifier.send_trade_alert(format!(
            "SOLD {} at {pnl_pct:+.1}% ({reason}){}",
            position.mint,
            outcome
                .signature
                .as_deref()
                .map(|s| format!(" sig {s}"))
                .unwrap_or_default(),
        ));
    }

    /// Claim a mint for this tick. Returns `None` when the other loop holds it.
    fn claim(&self, mint: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock();
        if set.insert(mint.to_string()) {
            Some(InFlightGuard {
                manager: self,
                mint: mint.to_string(),
            })
        } else {
            debug!(mint, "position check already in flight — skipping");
            None
        }
    }
}

struct InFlightGuard<'a> {
    manager: &'a PositionManager,
    mint: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.manager.in_flight.lock().remove(&self.mint);
    }
}

fn raw_amount(position: &Position) -> u64 {
    (position.amount * 10f64.powi(position.decimals as i32)) as u64
}

fn hold_minutes(position: &Position) -> f64 {
    chrono::DateTime::parse_from_rfc3339(&position.opened_at)
        .map(|t| {
            let secs = (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds();
            (secs as f64 / 60.0).max(0.0)
        })
        .unwrap_or(0.0)
}

fn regime_from_metrics(metrics: &MarketMetrics) -> Regime {
    let change = metrics.price_change_24h_pct;
    if change.abs() > 40.0 {
        Regime::Volatile
    } else if change > 10.0 {
        Regime::Bull
    } else if change < -10.0 {
        Regime::Bear
    } else {
        Regime::Sideways
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("dynamic_targets", &self.dynamic_targets.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tp_guard_conditions() {
        // Scenario: entry $1.000, dynamic target 12%, current $1.121 → sells.
        assert!(tp_should_sell(12.1, 12.0, 0.9, 0.05));

        // Below target.
        assert!(!tp_should_sell(11.9, 12.0, 0.9, 0.05));
        // Impact too high.
        assert!(!tp_should_sell(12.1, 12.0, 5.1, 0.05));
        // Dust output.
        assert!(!tp_should_sell(12.1, 12.0, 0.9, 0.0009));
    }

    #[test]
    fn sl_guard_is_strict_inequality() {
        // entry 1.0, sl 15% → boundary at 0.85.
        assert!(!sl_should_sell(0.85, 1.0, 15.0));
        assert!(sl_should_sell(0.8499, 1.0, 15.0));
        assert!(!sl_should_sell(0.86, 1.0, 15.0));
    }

    #[test]
    fn ai_overlay_emergency_levels() {
        let m = MarketMetrics::default();
        assert!(matches!(
            ai_exit_reason(-25.0, 60.0, &m, None),
            Some(ExitReason::Emergency(_))
        ));
        assert!(matches!(
            ai_exit_reason(75.0, 60.0, &m, None),
            Some(ExitReason::Emergency(_))
        ));
        assert!(ai_exit_reason(5.0, 60.0, &m, None).is_none());
    }

    #[test]
    fn ai_overlay_reversal_requires_volume() {
        // Strong shooting star: 1h +8% with 5m rolling over.
        let mut m = MarketMetrics {
            price_change_5m_pct: -1.5,
            price_change_1h_pct: 8.0,
            rvol: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            ai_exit_reason(10.0, 60.0, &m, None),
            Some(ExitReason::Reversal(_))
        ));

        // Same shape on dead volume: no exit.
        m.rvol = 0.5;
        assert!(ai_exit_reason(10.0, 60.0, &m, None).is_none());
    }

    #[test]
    fn ai_overlay_learned_capture() {
        let m = MarketMetrics::default();
        // Learned average 20% → capture from 18%.
        assert!(matches!(
            ai_exit_reason(18.0, 60.0, &m, Some(20.0)),
            Some(ExitReason::LearnedTarget { .. })
        ));
        assert!(ai_exit_reason(17.9, 60.0, &m, Some(20.0)).is_none());
    }

    #[test]
    fn ai_overlay_stagnant_and_fast_pump() {
        let m = MarketMetrics::default();
        assert!(matches!(
            ai_exit_reason(0.5, 7.0 * 60.0, &m, None),
            Some(ExitReason::Stagnant)
        ));
        assert!(matches!(
            ai_exit_reason(30.0, 15.0, &m, None),
            Some(ExitReason::FastPump)
        ));
        // Young but modest: neither fires.
        assert!(ai_exit_reason(5.0, 15.0, &m, None).is_none());
    }
}
