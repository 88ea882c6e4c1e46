// =============================================================================
// Candlestick Strategy — wick-rejection pin bars from change-window data
// =============================================================================
//
// The pair feed gives price-change windows, not OHLC, so the hourly move is
// treated as the bar's range and the 5-minute move as its closing thrust.
// A pin bar needs the rejected range to be at least twice the closing body:
//
//   hammer         — hour down hard, last 5 minutes snapping back up
//   shooting star  — hour up hard, last 5 minutes rolling over
//
// Entries additionally want RVOL confirmation and a supportive context
// score. The pattern detector is shared with the LLM prompt builder and
// the AI exit overlay.
// =============================================================================

use serde::Serialize;

use super::{position_pnl_pct, Signal, Strategy};
use crate::positions::Position;
use crate::types::{MarketMetrics, TokenCandidate};

/// Minimum hourly move to consider the bar meaningful.
const MIN_RANGE_PCT: f64 = 3.0;
/// Minimum closing thrust in the last 5 minutes.
const MIN_BODY_PCT: f64 = 0.8;
/// Wick-to-body ratio floor.
const MIN_WICK_RATIO: f64 = 2.0;
/// RVOL confirmation floor for entries.
const MIN_RVOL: f64 = 1.5;
/// Context score floor (out of 3).
const MIN_CONTEXT: u32 = 2;

/// Recognised pin-bar shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandlePattern {
    Hammer,
    ShootingStar,
}

impl std::fmt::Display for CandlePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hammer => write!(f, "HAMMER"),
            Self::ShootingStar => write!(f, "SHOOTING_STAR"),
        }
    }
}

/// A detected pattern with a strength in [0, 1].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PatternHit {
    pub pattern: CandlePattern,
    pub strength: f64,
}

/// Detect a wick-rejection pin bar from the change windows.
pub fn detect_pattern(metrics: &MarketMetrics) -> Option<PatternHit> {
    let range = metrics.price_change_1h_pct;
    let body = metrics.price_change_5m_pct;

    // Hammer: hour sold off, close thrusting back up, wick ≥ 2× body.
    if range <= -MIN_RANGE_PCT && body >= MIN_BODY_PCT {
        let ratio = range.abs() / body.max(0.4);
        if ratio >= MIN_WICK_RATIO {
            return Some(PatternHit {
                pattern: CandlePattern::Hammer,
                strength: (range.abs() / 10.0).min(1.0),
            });
        }
    }

    // Shooting star: hour ramped, close rolling over.
    if range >= MIN_RANGE_PCT && body <= -MIN_BODY_PCT {
        let ratio = range / body.abs().max(0.4);
        if ratio >= MIN_WICK_RATIO {
            return Some(PatternHit {
                pattern: CandlePattern::ShootingStar,
                strength: (range / 10.0).min(1.0),
            });
        }
    }

    None
}

pub struct CandlestickStrategy {
    base_amount_sol: f64,
}

impl CandlestickStrategy {
    pub fn new(base_amount_sol: f64) -> Self {
        Self { base_amount_sol }
    }

    /// Crude context score: reversal room, real liquidity, buyers present.
    fn context_score(&self, c: &TokenCandidate) -> u32 {
        let mut score = 0;
        if (-40.0..=20.0).contains(&c.price_change_24h_pct) {
            score += 1;
        }
        if c.liquidity_usd >= 100_000.0 {
            score += 1;
        }
        if c.tx_counts.buys_1h >= c.tx_counts.sells_1h {
            score += 1;
        }
        score
    }
}

impl Strategy for CandlestickStrategy {
    fn name(&self) -> &'static str {
        "candlestick"
    }

    fn analyse(
        &self,
        candidate: &TokenCandidate,
        metrics: &MarketMetrics,
        position: Option<&Position>,
    ) -> Signal {
        let hit = detect_pattern(metrics);

        if let Some(pos) = position {
            let pnl = position_pnl_pct(pos, candidate.price_usd);

            // Exit on a reversal pattern against the position.
            if let Some(hit) = hit {
                if hit.pattern == CandlePattern::ShootingStar {
                    return Signal::sell(
                        (0.6 + 0.3 * hit.strength).min(0.9),
                        format!(
                            "reversal pattern {} (strength {:.2})",
                            hit.pattern, hit.strength
                        ),
                    );
                }
            }
            return match pnl {
                Some(pnl) => Signal::hold(format!("no reversal pattern at {pnl:.1}%")),
                None => Signal::hold("no reversal pattern"),
            };
        }

        // Entry: hammer + volume confirmation + context.
        let Some(hit) = hit else {
            return Signal::hold("no pin bar");
        };
        if hit.pattern != CandlePattern::Hammer {
            return Signal::hold("bearish pattern — nothing to buy");
        }
        if metrics.rvol < MIN_RVOL {
            return Signal::hold(format!("rvol {:.2} below confirmation floor", metrics.rvol));
        }
        let context = self.context_score(candidate);
        if context < MIN_CONTEXT {
            return Signal::hold(format!("context score {context}/3 too weak"));
        }

        Signal::buy(
            (0.55 + 0.3 * hit.strength).min(0.9),
            format!(
                "hammer strength {:.2}, rvol {:.2}, context {context}/3",
                hit.strength, metrics.rvol
            ),
            "HAMMER",
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
            liquidity_usd: 150_000.0,
            volume_24h_usd: 100_000.0,
            volume_1h_usd: 8_000.0,
            price_usd: 0.01,
            price_change_24h_pct: -10.0,
            tx_counts: TxCounts {
                buys_1h: 70,
                sells_1h: 50,
                ..Default::default()
            },
            rug_score: Some(100.0),
        }
    }

    fn hammer_metrics() -> MarketMetrics {
        MarketMetrics {
            rvol: 2.0,
            price_change_5m_pct: 1.5,
            price_change_1h_pct: -5.0,
            price_change_24h_pct: -10.0,
            ..Default::default()
        }
    }

    #[test]
    fn detects_hammer_and_star() {
        let hit = detect_pattern(&hammer_metrics()).unwrap();
        assert_eq!(hit.pattern, CandlePattern::Hammer);

        let star = MarketMetrics {
            price_change_5m_pct: -1.5,
            price_change_1h_pct: 6.0,
            ..Default::default()
        };
        let hit = detect_pattern(&star).unwrap();
        assert_eq!(hit.pattern, CandlePattern::ShootingStar);
    }

    #[test]
    fn weak_wick_ratio_is_no_pattern() {
        // Range 3.2 vs body 2.0 → ratio 1.6 < 2.0.
        let weak = MarketMetrics {
            price_change_5m_pct: 2.0,
            price_change_1h_pct: -3.2,
            ..Default::default()
        };
        assert!(detect_pattern(&weak).is_none());
    }

    #[test]
    fn hammer_with_confirmation_buys() {
        let s = CandlestickStrategy::new(0.05);
        let signal = s.analyse(&candidate(), &hammer_metrics(), None);
        assert_eq!(signal.action, TradeAction::Buy);
        assert_eq!(signal.pattern.as_deref(), Some("HAMMER"));
    }

    #[test]
    fn quiet_tape_holds() {
        let s = CandlestickStrategy::new(0.05);
        let mut m = hammer_metrics();
        m.rvol = 1.0;
        assert_eq!(s.analyse(&candidate(), &m, None).action, TradeAction::Hold);
    }

    #[test]
    fn shooting_star_exits_position() {
        let s = CandlestickStrategy::new(0.05);
        let star = MarketMetrics {
            price_change_5m_pct: -1.5,
            price_change_1h_pct: 6.0,
            ..Default::default()
        };
        let pos = Position {
            mint: "M".to_string(),
            amount: 1000.0,
            decimals: 6,
            entry_price: Some(0.009),
            max_drawdown_pct: 0.0,
            doubling_count: 0,
            pattern: Some("HAMMER".to_string()),
            liquidity_usd: 150_000.0,
            volume_24h_usd: 100_000.0,
            position_size_pct: 5.0,
            entered_extended: false,
            opened_at: chrono::Utc::now().to_rfc3339(),
        };
        let signal = s.analyse(&candidate(), &star, Some(&pos));
        assert_eq!(signal.action, TradeAction::Sell);
        assert!(signal.reason.contains("SHOOTING_STAR"));
    }
}
