// =============================================================================
// Momentum Quality Strategy — confirmation-stacked breakout entries
// =============================================================================
//
// Entry wants the boring stuff first (liquidity, volume, sane price action),
// then at least two independent confirmations: deep liquidity, active
// trading, a clean rug score, an oversold RSI, or a volume spike. A cheap
// composite risk score must stay under 0.3.
//
// Exits: fixed take-profit and stop-loss, a trailing exit when conditions
// deteriorate while in profit, and a time exit for stale positions sitting
// on a token that went nowhere.
// =============================================================================

use super::{position_age_hours, position_pnl_pct, Signal, Strategy};
use crate::positions::Position;
use crate::types::{MarketMetrics, TokenCandidate};

/// Confirmations required on top of the quality gate.
const MIN_CONFIRMATIONS: usize = 2;
/// Composite risk ceiling.
const MAX_RISK_SCORE: f64 = 0.3;

pub struct MomentumStrategy {
    base_amount_sol: f64,
    tp_pct: f64,
    sl_pct: f64,
    max_hold_hours: f64,
    time_exit_max_gain_pct: f64,
}

impl MomentumStrategy {
    pub fn new(base_amount_sol: f64) -> Self {
        Self {
            base_amount_sol,
            tp_pct: 12.0,
            sl_pct: 8.0,
            max_hold_hours: 24.0,
            time_exit_max_gain_pct: 2.0,
        }
    }

    fn confirmations(&self, c: &TokenCandidate, m: &MarketMetrics) -> (usize, Vec<&'static str>) {
        let mut hits = Vec::new();
        if c.liquidity_usd >= 250_000.0 {
            hits.push("deep liquidity");
        }
        if c.tx_counts.total_1h() >= 100 {
            hits.push("active trading");
        }
        if matches!(c.rug_score, Some(score) if score < 300.0) {
            hits.push("clean rug score");
        }
        if matches!(m.rsi, Some(rsi) if rsi < 35.0) {
            hits.push("oversold RSI");
        }
        if m.rvol >= 3.0 {
            hits.push("volume spike");
        }
        (hits.len(), hits)
    }

    /// Cheap composite: rug weight + day-move weight + thin-liquidity weight.
    fn risk_score(&self, c: &TokenCandidate) -> f64 {
        let rug = c.rug_score.unwrap_or(500.0) / 1000.0;
        let swing = (c.price_change_24h_pct.abs() / 100.0).min(1.0);
        let thinness = (50_000.0 / c.liquidity_usd.max(1.0)).min(1.0);
        rug * 0.4 + swing * 0.3 + thinness * 0.3
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn analyse(
        &self,
        candidate: &TokenCandidate,
        metrics: &MarketMetrics,
        position: Option<&Position>,
    ) -> Signal {
        // ── Exit management for an existing position ─────────────────────
        if let Some(pos) = position {
            let Some(pnl) = position_pnl_pct(pos, candidate.price_usd) else {
                return Signal::hold("position has no entry price");
            };

            if pnl <= -self.sl_pct {
                return Signal::sell(0.95, format!("stop loss at {pnl:.1}%"));
            }
            if pnl >= self.tp_pct {
                return Signal::sell(0.9, format!("take profit at {pnl:.1}%"));
            }
            // Trailing exit: in profit but conditions rolling over.
            if pnl > 0.0 && metrics.price_change_1h_pct < -5.0 && metrics.rvol < 1.0 {
                return Signal::sell(
                    0.7,
                    format!("deteriorating conditions with {pnl:.1}% unrealised"),
                );
            }
            // Time exit: aged out with nothing to show.
            let age = position_age_hours(pos);
            if age > self.max_hold_hours && pnl > 0.0 && pnl < self.time_exit_max_gain_pct {
                return Signal::sell(0.6, format!("time exit after {age:.0}h at {pnl:.1}%"));
            }
            return Signal::hold(format!("holding at {pnl:.1}%"));
        }

        // ── Entry path ───────────────────────────────────────────────────
        if candidate.liquidity_usd < 50_000.0 {
            return Signal::hold("liquidity below quality floor");
        }
        if candidate.volume_24h_usd < 50_000.0 {
            return Signal::hold("volume below quality floor");
        }
        if candidate.price_usd <= 0.0 {
            return Signal::hold("no price");
        }
        if candidate.price_change_24h_pct.abs() > 200.0 {
            return Signal::hold("day move too wild for a momentum entry");
        }

        let (count, hits) = self.confirmations(candidate, metrics);
        if count < MIN_CONFIRMATIONS {
            return Signal::hold(format!("only {count} confirmation(s)"));
        }

        let risk = self.risk_score(candidate);
        if risk >= MAX_RISK_SCORE {
            return Signal::hold(format!("risk score {risk:.2} too high"));
        }

        let confidence = (0.55 + 0.1 * count as f64).min(0.95);
        let pattern = if metrics.rvol >= 3.0 && candidate.price_change_24h_pct > 15.0 {
            "FAST_PUMP"
        } else {
            "MOMENTUM_QUALITY"
        };

        Signal::buy(
            confidence,
            format!("{count} confirmations ({}), risk {risk:.2}", hits.join(", ")),
            pattern,
        )
        .with_amount(self.base_amount_sol)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::TradeAction;
    use crate::types::TxCounts;

    fn candidate() -> TokenCandidate {
        TokenCandidate {
            address: "M".to_string(),
            dex_id: "raydium".to_string(),
            liquidity_usd: 200_000.0,
            volume_24h_usd: 150_000.0,
            volume_1h_usd: 15_625.0,
            price_usd: 0.01,
            price_change_24h_pct: 18.0,
            tx_counts: TxCounts {
                buys_1h: 120,
                sells_1h: 80,
                ..Default::default()
            },
            rug_score: Some(50.0),
        }
    }

    fn metrics() -> MarketMetrics {
        MarketMetrics {
            rvol: 2.5,
            price_change_1h_pct: 4.0,
            price_change_24h_pct: 18.0,
            ..Default::default()
        }
    }

    fn position(entry: f64) -> Position {
        Position {
            mint: "M".to_string(),
            amount: 1000.0,
            decimals: 6,
            entry_price: Some(entry),
            max_drawdown_pct: 0.0,
            doubling_count: 0,
            pattern: None,
            liquidity_usd: 200_000.0,
            volume_24h_usd: 150_000.0,
            position_size_pct: 5.0,
            entered_extended: false,
            opened_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn two_confirmations_buy() {
        let s = MomentumStrategy::new(0.05);
        // active trading + clean rug = 2 confirmations.
        let signal = s.analyse(&candidate(), &metrics(), None);
        assert_eq!(signal.action, TradeAction::Buy);
        assert!((signal.confidence - 0.75).abs() < 1e-9);
        assert_eq!(signal.pattern.as_deref(), Some("MOMENTUM_QUALITY"));
    }

    #[test]
    fn fast_pump_pattern_on_volume_spike() {
        let s = MomentumStrategy::new(0.05);
        let mut m = metrics();
        m.rvol = 3.5;
        let signal = s.analyse(&candidate(), &m, None);
        assert_eq!(signal.pattern.as_deref(), Some("FAST_PUMP"));
    }

    #[test]
    fn one_confirmation_holds() {
        let s = MomentumStrategy::new(0.05);
        let mut c = candidate();
        c.rug_score = Some(400.0); // loses "clean rug score"
        let signal = s.analyse(&c, &metrics(), None);
        assert_eq!(signal.action, TradeAction::Hold);
    }

    #[test]
    fn stop_loss_and_take_profit() {
        let s = MomentumStrategy::new(0.05);
        let mut c = candidate();

        c.price_usd = 0.0091; // -9% from 0.01
        let signal = s.analyse(&c, &metrics(), Some(&position(0.01)));
        assert_eq!(signal.action, TradeAction::Sell);
        assert!(signal.reason.contains("stop loss"));

        c.price_usd = 0.0113; // +13%
        let signal = s.analyse(&c, &metrics(), Some(&position(0.01)));
        assert_eq!(signal.action, TradeAction::Sell);
        assert!(signal.reason.contains("take profit"));
    }

    #[test]
    fn unknown_entry_price_never_sells() {
        let s = MomentumStrategy::new(0.05);
        let mut pos = position(0.01);
        pos.entry_price = None;
        let signal = s.analyse(&candidate(), &metrics(), Some(&pos));
        assert_eq!(signal.action, TradeAction::Hold);
    }
}
