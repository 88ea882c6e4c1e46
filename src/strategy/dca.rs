// =============================================================================
// DCA Strategy — incremental entries into quality dips
// =============================================================================
//
// Opens on a controlled pull-back in an otherwise healthy token, then adds
// smaller tranches if the dip deepens, capped per token. Exits at the
// profit target or once the token has absorbed its full allocation.
// =============================================================================

use super::{position_pnl_pct, Signal, Strategy};
use crate::positions::Position;
use crate::types::{MarketMetrics, TokenCandidate};

/// Acceptable 24 h pull-back band for a fresh entry.
const DIP_MIN_PCT: f64 = -30.0;
const DIP_MAX_PCT: f64 = -5.0;
/// Further drawdown that triggers the next tranche.
const LADDER_TRIGGER_PCT: f64 = -12.0;
/// Tranches after the first shrink by this factor.
const LADDER_SIZE_FACTOR: f64 = 0.8;
/// Maximum tranches per token.
const MAX_ROUNDS: u32 = 3;

pub struct DcaStrategy {
    base_amount_sol: f64,
    profit_target_pct: f64,
}

impl DcaStrategy {
    pub fn new(base_amount_sol: f64) -> Self {
        Self {
            base_amount_sol,
            profit_target_pct: 10.0,
        }
    }

    fn quality(&self, c: &TokenCandidate, m: &MarketMetrics) -> bool {
        c.liquidity_usd >= 50_000.0
            && c.volume_24h_usd >= 50_000.0
            && m.rvol >= 1.2
            // A dip where sellers overwhelm buyers is a falling knife.
            && c.tx_counts.buys_1h as f64 >= c.tx_counts.sells_1h as f64 * 0.8
    }
}

impl Strategy for DcaStrategy {
    fn name(&self) -> &'static str {
        "dca"
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

            if pnl >= self.profit_target_pct {
                return Signal::sell(0.8, format!("DCA profit target at {pnl:.1}%"));
            }
            if pos.doubling_count >= MAX_ROUNDS {
                return Signal::hold("max DCA allocation reached");
            }
            if pnl <= LADDER_TRIGGER_PCT && self.quality(candidate, metrics) {
                let tranche = self.base_amount_sol
                    * LADDER_SIZE_FACTOR.powi(pos.doubling_count as i32 + 1);
                return Signal::buy(
                    0.6,
                    format!(
                        "DCA tranche #{} at {pnl:.1}%",
                        pos.doubling_count + 2
                    ),
                    "QUALITY_DIP",
                )
                .with_amount(tranche);
            }
            return Signal::hold(format!("DCA holding at {pnl:.1}%"));
        }

        // Fresh entry: a contained dip in a token that still trades well.
        let change = candidate.price_change_24h_pct;
        if !(DIP_MIN_PCT..=DIP_MAX_PCT).contains(&change) {
            return Signal::hold(format!("24h change {change:.1}% not a workable dip"));
        }
        if !self.quality(candidate, metrics) {
            return Signal::hold("dip lacks quality backing");
        }

        Signal::buy(
            0.65,
            format!("quality dip {change:.1}% with rvol {:.2}", metrics.rvol),
            "QUALITY_DIP",
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

    fn dip_candidate(change: f64) -> TokenCandidate {
        TokenCandidate {
            address: "M".to_string(),
            dex_id: "raydium".to_string(),
            liquidity_usd: 120_000.0,
            volume_24h_usd: 90_000.0,
            volume_1h_usd: 6_000.0,
            price_usd: 0.008,
            price_change_24h_pct: change,
            tx_counts: TxCounts {
                buys_1h: 60,
                sells_1h: 55,
                ..Default::default()
            },
            rug_score: Some(100.0),
        }
    }

    fn metrics() -> MarketMetrics {
        MarketMetrics {
            rvol: 1.6,
            ..Default::default()
        }
    }

    fn position(entry: f64, rounds: u32) -> Position {
        Position {
            mint: "M".to_string(),
            amount: 1000.0,
            decimals: 6,
            entry_price: Some(entry),
            max_drawdown_pct: -5.0,
            doubling_count: rounds,
            pattern: Some("QUALITY_DIP".to_string()),
            liquidity_usd: 120_000.0,
            volume_24h_usd: 90_000.0,
            position_size_pct: 5.0,
            entered_extended: false,
            opened_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn enters_on_contained_dip() {
        let s = DcaStrategy::new(0.05);
        let signal = s.analyse(&dip_candidate(-15.0), &metrics(), None);
        assert_eq!(signal.action, TradeAction::Buy);
        assert_eq!(signal.pattern.as_deref(), Some("QUALITY_DIP"));
    }

    #[test]
    fn rejects_crash_and_green_day() {
        let s = DcaStrategy::new(0.05);
        assert_eq!(
            s.analyse(&dip_candidate(-45.0), &metrics(), None).action,
            TradeAction::Hold
        );
        assert_eq!(
            s.analyse(&dip_candidate(8.0), &metrics(), None).action,
            TradeAction::Hold
        );
    }

    #[test]
    fn ladder_tranches_shrink_and_cap() {
        let s = DcaStrategy::new(0.05);

        // -15% from entry 0.008 → current below trigger.
        let mut c = dip_candidate(-15.0);
        c.price_usd = 0.008 * 0.85;
        let signal = s.analyse(&c, &metrics(), Some(&position(0.008, 0)));
        assert_eq!(signal.action, TradeAction::Buy);
        let tranche = signal.amount_sol.unwrap();
        assert!((tranche - 0.05 * 0.8).abs() < 1e-12);

        // At the cap: no more tranches.
        let signal = s.analyse(&c, &metrics(), Some(&position(0.008, 3)));
        assert_eq!(signal.action, TradeAction::Hold);
        assert!(signal.reason.contains("max DCA"));
    }

    #[test]
    fn sells_at_target() {
        let s = DcaStrategy::new(0.05);
        let mut c = dip_candidate(-10.0);
        c.price_usd = 0.008 * 1.11;
        let signal = s.analyse(&c, &metrics(), Some(&position(0.008, 1)));
        assert_eq!(signal.action, TradeAction::Sell);
    }
}
