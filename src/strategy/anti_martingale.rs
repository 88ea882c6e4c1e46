// =============================================================================
// Anti-Martingale Strategy — pyramid into strength, never into weakness
// =============================================================================
//
// Size doubles after each profit milestone while the uptrend holds, up to
// the doubling cap. The take-profit ladder widens with each scale-in
// (10 % / 15 % / 20 %); the stop stays tight at −8 %.
// =============================================================================

use super::{position_pnl_pct, Signal, Strategy};
use crate::positions::Position;
use crate::types::{MarketMetrics, TokenCandidate};

/// Take-profit ladder indexed by doubling count.
const TP_LADDER_PCT: [f64; 3] = [10.0, 15.0, 20.0];
/// Fixed stop.
const SL_PCT: f64 = -8.0;
/// Profit milestone required before doubling #n (n = doubling_count + 1).
const MILESTONE_STEP_PCT: f64 = 5.0;

pub struct AntiMartingaleStrategy {
    base_amount_sol: f64,
    max_doublings: u32,
}

impl AntiMartingaleStrategy {
    pub fn new(base_amount_sol: f64, max_doublings: u32) -> Self {
        Self {
            base_amount_sol,
            max_doublings,
        }
    }

    fn uptrend(&self, c: &TokenCandidate, m: &MarketMetrics) -> bool {
        c.price_change_24h_pct > 10.0
            && m.price_change_1h_pct > 2.0
            && m.price_change_5m_pct >= 0.0
    }
}

impl Strategy for AntiMartingaleStrategy {
    fn name(&self) -> &'static str {
        "anti-martingale"
    }

    fn analyse(
        &self,
        candidate: &TokenCandidate,
        metrics: &MarketMetrics,
        position: Option<&Position>,
    ) -> Signal {
        if let Some(pos) = position {
            let Some(pnl) = position_pnl_pct(pos, candidate.price_usd) else {
                return Signal::hold("position has no entry price");
            };

            if pnl <= SL_PCT {
                return Signal::sell(0.95, format!("stop loss at {pnl:.1}%"));
            }

            let tp = TP_LADDER_PCT
                .get(pos.doubling_count.min(2) as usize)
                .copied()
                .unwrap_or(20.0);
            if pnl >= tp {
                return Signal::sell(
                    0.85,
                    format!("ladder take-profit {tp:.0}% reached at {pnl:.1}%"),
                );
            }

            // Scale in: milestone reached, momentum intact, cap not hit.
            let milestone = MILESTONE_STEP_PCT * (pos.doubling_count + 1) as f64;
            if pnl >= milestone
                && pos.doubling_count < self.max_doublings
                && metrics.price_change_1h_pct > 0.0
                && metrics.price_change_5m_pct >= 0.0
            {
                // Double the base each round: 2x, 4x, 8x of the opener.
                let add = self.base_amount_sol * 2f64.powi(pos.doubling_count as i32 + 1)
                    - self.base_amount_sol * 2f64.powi(pos.doubling_count as i32);
                return Signal::buy(
                    0.7,
                    format!(
                        "doubling #{} at +{pnl:.1}% (milestone {milestone:.0}%)",
                        pos.doubling_count + 1
                    ),
                    "TREND_CONTINUATION",
                )
                .with_amount(add);
            }

            return Signal::hold(format!("riding at {pnl:.1}%"));
        }

        // Fresh entry: confirmed uptrend with real participation.
        if !self.uptrend(candidate, metrics) {
            return Signal::hold("no confirmed uptrend");
        }
        if metrics.rvol < 1.8 {
            return Signal::hold(format!("rvol {:.2} too quiet for momentum", metrics.rvol));
        }
        if candidate.liquidity_usd < 50_000.0 {
            return Signal::hold("liquidity too thin to pyramid");
        }

        Signal::buy(
            0.6,
            format!(
                "uptrend +{:.1}%/24h, +{:.1}%/1h, rvol {:.2}",
                candidate.price_change_24h_pct, metrics.price_change_1h_pct, metrics.rvol
            ),
            "TREND_CONTINUATION",
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

    fn trending_candidate() -> TokenCandidate {
        TokenCandidate {
            address: "M".to_string(),
            dex_id: "raydium".to_string(),
            liquidity_usd: 150_000.0,
            volume_24h_usd: 200_000.0,
            volume_1h_usd: 20_000.0,
            price_usd: 0.01,
            price_change_24h_pct: 18.0,
            tx_counts: TxCounts::default(),
            rug_score: Some(80.0),
        }
    }

    fn trending_metrics() -> MarketMetrics {
        MarketMetrics {
            rvol: 2.4,
            price_change_5m_pct: 0.5,
            price_change_1h_pct: 4.0,
            price_change_24h_pct: 18.0,
            ..Default::default()
        }
    }

    fn position(entry: f64, doublings: u32) -> Position {
        Position {
            mint: "M".to_string(),
            amount: 1000.0,
            decimals: 6,
            entry_price: Some(entry),
            max_drawdown_pct: -2.0,
            doubling_count: doublings,
            pattern: Some("TREND_CONTINUATION".to_string()),
            liquidity_usd: 150_000.0,
            volume_24h_usd: 200_000.0,
            position_size_pct: 5.0,
            entered_extended: false,
            opened_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn enters_confirmed_uptrend() {
        let s = AntiMartingaleStrategy::new(0.05, 3);
        let signal = s.analyse(&trending_candidate(), &trending_metrics(), None);
        assert_eq!(signal.action, TradeAction::Buy);
    }

    #[test]
    fn doubles_at_milestone_with_momentum() {
        let s = AntiMartingaleStrategy::new(0.05, 3);
        let mut c = trending_candidate();
        c.price_usd = 0.01 * 1.06; // +6% ≥ first 5% milestone

        let signal = s.analyse(&c, &trending_metrics(), Some(&position(0.01, 0)));
        assert_eq!(signal.action, TradeAction::Buy);
        // First doubling adds 2x - 1x = one extra base unit.
        assert!((signal.amount_sol.unwrap() - 0.05).abs() < 1e-12);
        assert!(signal.reason.contains("doubling #1"));
    }

    #[test]
    fn doubling_respects_cap() {
        let s = AntiMartingaleStrategy::new(0.05, 3);
        let mut c = trending_candidate();
        c.price_usd = 0.01 * 1.5;
        // At 3 doublings the ladder TP (20%) fires instead of another double.
        let signal = s.analyse(&c, &trending_metrics(), Some(&position(0.01, 3)));
        assert_eq!(signal.action, TradeAction::Sell);
    }

    #[test]
    fn ladder_tp_widens_with_doublings() {
        let s = AntiMartingaleStrategy::new(0.05, 3);
        let mut c = trending_candidate();
        c.price_usd = 0.01 * 1.12; // +12%

        // 0 doublings → TP at 10% → sell.
        let signal = s.analyse(&c, &trending_metrics(), Some(&position(0.01, 0)));
        assert_eq!(signal.action, TradeAction::Sell);

        // 1 doubling → TP at 15% → +12% keeps riding (next milestone is 10%,
        // already passed, so it tries to double again instead).
        let signal = s.analyse(&c, &trending_metrics(), Some(&position(0.01, 1)));
        assert_eq!(signal.action, TradeAction::Buy);
    }

    #[test]
    fn tight_stop() {
        let s = AntiMartingaleStrategy::new(0.05, 3);
        let mut c = trending_candidate();
        c.price_usd = 0.01 * 0.91; // -9%
        let signal = s.analyse(&c, &trending_metrics(), Some(&position(0.01, 1)));
        assert_eq!(signal.action, TradeAction::Sell);
        assert!(signal.reason.contains("stop loss"));
    }
}
