// =============================================================================
// Trend Reversal Strategy — oversold RSI + volume spike + bullish divergence
// =============================================================================

use super::{position_age_hours, position_pnl_pct, Signal, Strategy};
use crate::positions::Position;
use crate::types::{MarketMetrics, TokenCandidate};

const RSI_OVERSOLD: f64 = 30.0;
const MIN_SPIKE_RVOL: f64 = 2.5;
const TP_PCT: f64 = 12.0;
const SL_PCT: f64 = -8.0;
const MAX_HOLD_HOURS: f64 = 12.0;

pub struct ReversalStrategy {
    base_amount_sol: f64,
}

impl ReversalStrategy {
    pub fn new(base_amount_sol: f64) -> Self {
        Self { base_amount_sol }
    }
}

impl Strategy for ReversalStrategy {
    fn name(&self) -> &'static str {
        "reversal"
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
            if pnl >= TP_PCT {
                return Signal::sell(0.85, format!("reversal played out at +{pnl:.1}%"));
            }
            // The reversal thesis has a shelf life.
            let age = position_age_hours(pos);
            if age > MAX_HOLD_HOURS {
                return Signal::sell(0.6, format!("thesis expired after {age:.0}h at {pnl:.1}%"));
            }
            return Signal::hold(format!("reversal in progress at {pnl:.1}%"));
        }

        // All three legs of the setup must be present.
        let Some(rsi) = metrics.rsi else {
            return Signal::hold("no RSI data");
        };
        if rsi >= RSI_OVERSOLD {
            return Signal::hold(format!("RSI {rsi:.0} not oversold"));
        }
        if metrics.rvol < MIN_SPIKE_RVOL {
            return Signal::hold(format!("rvol {:.2} lacks a spike", metrics.rvol));
        }
        if !metrics.bullish_divergence {
            return Signal::hold("no bullish divergence");
        }
        if candidate.liquidity_usd < 50_000.0 {
            return Signal::hold("liquidity too thin");
        }

        // The deeper the oversold reading, the stronger the signal.
        let depth = ((RSI_OVERSOLD - rsi) / RSI_OVERSOLD).clamp(0.0, 1.0);
        Signal::buy(
            (0.6 + 0.25 * depth).min(0.9),
            format!("oversold RSI {rsi:.0} with divergence and rvol {:.2}", metrics.rvol),
            "OVERSOLD_REVERSAL",
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
            liquidity_usd: 120_000.0,
            volume_24h_usd: 100_000.0,
            volume_1h_usd: 12_000.0,
            price_usd: 0.02,
            price_change_24h_pct: -12.0,
            tx_counts: TxCounts::default(),
            rug_score: Some(100.0),
        }
    }

    fn setup_metrics() -> MarketMetrics {
        MarketMetrics {
            rvol: 3.0,
            rsi: Some(22.0),
            bullish_divergence: true,
            ..Default::default()
        }
    }

    #[test]
    fn full_setup_buys() {
        let s = ReversalStrategy::new(0.05);
        let signal = s.analyse(&candidate(), &setup_metrics(), None);
        assert_eq!(signal.action, TradeAction::Buy);
        assert_eq!(signal.pattern.as_deref(), Some("OVERSOLD_REVERSAL"));
        assert!(signal.confidence > 0.6);
    }

    #[test]
    fn each_missing_leg_holds() {
        let s = ReversalStrategy::new(0.05);

        let mut m = setup_metrics();
        m.rsi = None;
        assert_eq!(s.analyse(&candidate(), &m, None).action, TradeAction::Hold);

        m = setup_metrics();
        m.rsi = Some(45.0);
        assert_eq!(s.analyse(&candidate(), &m, None).action, TradeAction::Hold);

        m = setup_metrics();
        m.rvol = 1.0;
        assert_eq!(s.analyse(&candidate(), &m, None).action, TradeAction::Hold);

        m = setup_metrics();
        m.bullish_divergence = false;
        assert_eq!(s.analyse(&candidate(), &m, None).action, TradeAction::Hold);
    }
}
