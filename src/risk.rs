// =============================================================================
// Risk Manager — extension detection, concentration, and doubling limits
// =============================================================================
//
// Multi-timeframe gains come from real 7 d / 30 d history when the feed has
// it; otherwise rough estimates are derived from the pair's change windows
// and the fdv/volume/age ratios. A token matching any one of the six
// extension conditions is refused outright.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::market::history::HistoryClient;
use crate::positions::Position;
use crate::types::{MarketMetrics, TokenCandidate};

/// Progressive P&L floor (percent) required before each doubling.
const DOUBLING_PNL_STEPS: [f64; 3] = [5.0, 10.0, 15.0];
/// Positions that drew down past this are never doubled.
const DOUBLING_MAX_DRAWDOWN_PCT: f64 = -10.0;

/// Multi-timeframe price extension view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeframeMetrics {
    pub gain_1h_pct: f64,
    pub gain_4h_pct: f64,
    pub gain_24h_pct: f64,
    pub gain_7d_pct: f64,
    pub dist_from_month_high_pct: f64,
    pub dist_from_7d_low_pct: f64,
    /// True when the 7 d / 30 d figures are heuristic estimates.
    pub estimated: bool,
}

/// First extension condition the token trips, if any.
pub fn extension_reason(tf: &TimeframeMetrics) -> Option<String> {
    if tf.gain_1h_pct > 15.0 {
        return Some(format!("Parabolic 1h move (+{:.1}%)", tf.gain_1h_pct));
    }
    if tf.gain_4h_pct > 30.0 {
        return Some(format!("Parabolic 4h move (+{:.1}%)", tf.gain_4h_pct));
    }
    if tf.gain_24h_pct > 50.0 {
        return Some(format!("Parabolic 24h move (+{:.1}%)", tf.gain_24h_pct));
    }
    if tf.gain_7d_pct > 200.0 {
        return Some(format!("Parabolic 7d move (+{:.1}%)", tf.gain_7d_pct));
    }
    if tf.dist_from_month_high_pct < 5.0 {
        return Some(format!(
            "At monthly high ({:.1}% below peak)",
            tf.dist_from_month_high_pct
        ));
    }
    if tf.dist_from_7d_low_pct > 100.0 && tf.gain_7d_pct < 200.0 {
        return Some(format!(
            "Far above 7d low (+{:.1}%)",
            tf.dist_from_7d_low_pct
        ));
    }
    None
}

/// Verdict handed back to the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub allowed: bool,
    /// Largest additional position size the concentration cap permits.
    pub max_position_size_sol: f64,
    pub confidence_multiplier: f64,
    pub warnings: Vec<String>,
    pub extended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

/// Pre-trade risk gate.
pub struct RiskManager {
    history: Arc<HistoryClient>,
    max_position_pct: f64,
    max_doublings: u32,
}

impl RiskManager {
    pub fn new(settings: &Settings, history: Arc<HistoryClient>) -> Self {
        Self {
            history,
            max_position_pct: settings.max_position_pct,
            max_doublings: settings.max_doublings,
        }
    }

    // -------------------------------------------------------------------------
    // Entry assessment
    // -------------------------------------------------------------------------

    /// Assess a proposed entry of `requested_sol` on top of any existing
    /// exposure (`current_position_sol`), against total capital.
    pub async fn assess_entry(
        &self,
        candidate: &TokenCandidate,
        metrics: &MarketMetrics,
        capital_sol: f64,
        requested_sol: f64,
        current_position_sol: f64,
    ) -> RiskAssessment {
        let mut warnings = Vec::new();

        let timeframes = self.timeframes(candidate, metrics).await;
        if timeframes.estimated {
            warnings.push("timeframe metrics are heuristic estimates".to_string());
        }

        if let Some(reason) = extension_reason(&timeframes) {
            debug!(mint = %candidate.address, reason = %reason, "entry blocked — token extended");
            return RiskAssessment {
                allowed: false,
                max_position_size_sol: 0.0,
                confidence_multiplier: 0.0,
                warnings,
                extended: true,
                block_reason: Some(reason),
            };
        }

        // Concentration cap: one token may hold at most max_position_pct of
        // capital, existing exposure included.
        let cap_sol = capital_sol * self.max_position_pct / 100.0;
        let headroom = (cap_sol - current_position_sol).max(0.0);

        if headroom <= 0.0 {
            return RiskAssessment {
                allowed: false,
                max_position_size_sol: 0.0,
                confidence_multiplier: 0.0,
                warnings,
                extended: false,
                block_reason: Some(format!(
                    "position at concentration cap ({:.1}% of capital)",
                    self.max_position_pct
                )),
            };
        }

        let mut confidence_multiplier = 1.0;
        if requested_sol > headroom {
            warnings.push(format!(
                "size clamped to concentration headroom {headroom:.4} SOL"
            ));
            confidence_multiplier = 0.85;
        }
        if timeframes.estimated {
            confidence_multiplier *= 0.95;
        }

        RiskAssessment {
            allowed: true,
            max_position_size_sol: requested_sol.min(headroom),
            confidence_multiplier,
            warnings,
            extended: false,
            block_reason: None,
        }
    }

    // -------------------------------------------------------------------------
    // Doubling gate
    // -------------------------------------------------------------------------

    /// Whether an existing position may be scaled up. The P&L requirement
    /// rises with each doubling and a deep historical drawdown disqualifies.
    pub fn assess_doubling(&self, position: &Position, pnl_pct: f64) -> Result<(), String> {
        if position.doubling_count >= self.max_doublings {
            return Err(format!(
                "doubling limit reached ({}/{})",
                position.doubling_count, self.max_doublings
            ));
        }

        let step = DOUBLING_PNL_STEPS
            .get(position.doubling_count as usize)
            .copied()
            .unwrap_or(f64::INFINITY);
        if pnl_pct < step {
            return Err(format!(
                "P&L {pnl_pct:.1}% below the {step:.0}% requirement for doubling #{}",
                position.doubling_count + 1
            ));
        }

        if position.max_drawdown_pct < DOUBLING_MAX_DRAWDOWN_PCT {
            return Err(format!(
                "drawdown {:.1}% disqualifies doubling",
                position.max_drawdown_pct
            ));
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Timeframe metrics
    // -------------------------------------------------------------------------

    async fn timeframes(
        &self,
        candidate: &TokenCandidate,
        metrics: &MarketMetrics,
    ) -> TimeframeMetrics {
        let now_price = candidate.price_usd;

        let daily = self.history.history(&candidate.address, "1D", 30).await;
        let hourly = self.history.history(&candidate.address, "1H", 7).await;

        match (daily, now_price > 0.0) {
            (Ok(days), true) if days.len() >= 8 => {
                let values: Vec<f64> = days.iter().map(|p| p.value).collect();

                let price_7d_ago = values[values.len().saturating_sub(8)];
                let gain_7d = pct_gain(price_7d_ago, now_price);

                let month_high = values.iter().cloned().fold(f64::MIN, f64::max).max(now_price);
                let dist_month_high = if month_high > 0.0 {
                    (month_high - now_price) / month_high * 100.0
                } else {
                    100.0
                };

                let week_slice = &values[values.len().saturating_sub(8)..];
                let week_low = week_slice
                    .iter()
                    .cloned()
                    .fold(f64::MAX, f64::min)
                    .min(now_price);
                let dist_7d_low = if week_low > 0.0 {
                    (now_price - week_low) / week_low * 100.0
                } else {
                    0.0
                };

                let gain_4h = match hourly {
                    Ok(hours) if hours.len() >= 5 => {
                        pct_gain(hours[hours.len() - 5].value, now_price)
                    }
                    _ => metrics.price_change_6h_pct * 0.75,
                };

                TimeframeMetrics {
                    gain_1h_pct: metrics.price_change_1h_pct,
                    gain_4h_pct: gain_4h,
                    gain_24h_pct: metrics.price_change_24h_pct,
                    gain_7d_pct: gain_7d,
                    dist_from_month_high_pct: dist_month_high,
                    dist_from_7d_low_pct: dist_7d_low,
                    estimated: false,
                }
            }
            _ => {
                debug!(mint = %candidate.address, "no usable history — estimating timeframes");
                estimate_timeframes(metrics)
            }
        }
    }
}

/// Heuristic timeframe estimates for tokens the history feed does not know.
/// Derived from the pair's own change windows and turnover ratios.
pub fn estimate_timeframes(metrics: &MarketMetrics) -> TimeframeMetrics {
    let gain_24h = metrics.price_change_24h_pct;

    // Young pools move more per unit of turnover; scale the 24 h move out to
    // a 7 d guess, clamped to something plausible.
    let turnover_factor = 1.0 + (metrics.volume_to_liq_ratio / 10.0).min(1.0);
    let age_factor = if metrics.age_hours > 0.0 && metrics.age_hours < 168.0 {
        // The pool is younger than a week: its whole life is the window.
        1.0
    } else {
        2.0
    };
    let gain_7d = (gain_24h * age_factor * turnover_factor).clamp(-90.0, 400.0);

    // A heavily-bid token (high fdv against liquidity, rising day) is
    // assumed near its highs; a red day is assumed well off them.
    let dist_month_high = if gain_24h >= 20.0 || metrics.fdv_to_liq_ratio > 20.0 {
        3.0
    } else if gain_24h >= 0.0 {
        15.0
    } else {
        35.0
    };

    let dist_7d_low = gain_7d.max(0.0);

    TimeframeMetrics {
        gain_1h_pct: metrics.price_change_1h_pct,
        gain_4h_pct: metrics.price_change_6h_pct * 0.75,
        gain_24h_pct: gain_24h,
        gain_7d_pct: gain_7d,
        dist_from_month_high_pct: dist_month_high,
        dist_from_7d_low_pct: dist_7d_low,
        estimated: true,
    }
}

fn pct_gain(from: f64, to: f64) -> f64 {
    if from > 0.0 {
        (to - from) / from * 100.0
    } else {
        0.0
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("max_position_pct", &self.max_position_pct)
            .field("max_doublings", &self.max_doublings)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxCounts;

    fn calm_timeframes() -> TimeframeMetrics {
        TimeframeMetrics {
            gain_1h_pct: 2.0,
            gain_4h_pct: 5.0,
            gain_24h_pct: 10.0,
            gain_7d_pct: 30.0,
            dist_from_month_high_pct: 25.0,
            dist_from_7d_low_pct: 40.0,
            estimated: false,
        }
    }

    #[test]
    fn extension_fires_on_each_condition_alone() {
        assert!(extension_reason(&calm_timeframes()).is_none());

        let mut tf = calm_timeframes();
        tf.gain_1h_pct = 15.1;
        assert!(extension_reason(&tf).unwrap().contains("1h"));

        tf = calm_timeframes();
        tf.gain_4h_pct = 30.1;
        assert!(extension_reason(&tf).unwrap().contains("4h"));

        tf = calm_timeframes();
        tf.gain_24h_pct = 50.1;
        assert!(extension_reason(&tf).unwrap().contains("24h"));

        tf = calm_timeframes();
        tf.gain_7d_pct = 200.1;
        assert!(extension_reason(&tf).unwrap().contains("7d move"));

        tf = calm_timeframes();
        tf.dist_from_month_high_pct = 4.9;
        assert!(extension_reason(&tf).unwrap().contains("monthly high"));

        tf = calm_timeframes();
        tf.dist_from_7d_low_pct = 100.1;
        assert!(extension_reason(&tf).unwrap().contains("7d low"));

        // The sixth condition requires gain_7d < 200 — at 200+ the parabolic
        // 7d rule fires first instead.
        tf = calm_timeframes();
        tf.dist_from_7d_low_pct = 150.0;
        tf.gain_7d_pct = 250.0;
        assert!(extension_reason(&tf).unwrap().contains("7d move"));
    }

    fn manager() -> RiskManager {
        let settings = Settings::default();
        RiskManager::new(
            &settings,
            Arc::new(HistoryClient::new("http://127.0.0.1:1", None)),
        )
    }

    fn candidate(change_24h: f64) -> TokenCandidate {
        TokenCandidate {
            address: "Mint111".to_string(),
            dex_id: "raydium".to_string(),
            liquidity_usd: 200_000.0,
            volume_24h_usd: 150_000.0,
            volume_1h_usd: 15_000.0,
            price_usd: 0.01,
            price_change_24h_pct: change_24h,
            tx_counts: TxCounts::default(),
            rug_score: Some(50.0),
        }
    }

    fn metrics(change_24h: f64) -> MarketMetrics {
        MarketMetrics {
            rvol: 2.4,
            price_change_1h_pct: 3.0,
            price_change_6h_pct: 8.0,
            price_change_24h_pct: change_24h,
            volume_to_liq_ratio: 0.75,
            age_hours: 300.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn parabolic_day_blocks_entry() {
        let assessment = manager()
            .assess_entry(&candidate(62.0), &metrics(62.0), 10.0, 0.1, 0.0)
            .await;
        assert!(!assessment.allowed);
        assert!(assessment.extended);
        assert!(assessment.block_reason.unwrap().contains("Parabolic 24h move"));
    }

    #[tokio::test]
    async fn concentration_clamps_and_blocks() {
        let m = manager();

        // 10 SOL capital, 30% cap = 3 SOL. Existing 2.5 SOL → 0.5 headroom.
        let assessment = m
            .assess_entry(&candidate(10.0), &metrics(10.0), 10.0, 1.0, 2.5)
            .await;
        assert!(assessment.allowed);
        assert!((assessment.max_position_size_sol - 0.5).abs() < 1e-9);
        assert!(!assessment.warnings.is_empty());

        // At the cap → blocked.
        let assessment = m
            .assess_entry(&candidate(10.0), &metrics(10.0), 10.0, 1.0, 3.0)
            .await;
        assert!(!assessment.allowed);
        assert!(assessment
            .block_reason
            .unwrap()
            .contains("concentration cap"));
    }

    fn position(doublings: u32, drawdown: f64) -> Position {
        Position {
            mint: "Mint111".to_string(),
            amount: 1000.0,
            decimals: 6,
            entry_price: Some(1.0),
            max_drawdown_pct: drawdown,
            doubling_count: doublings,
            pattern: None,
            liquidity_usd: 200_000.0,
            volume_24h_usd: 150_000.0,
            position_size_pct: 5.0,
            entered_extended: false,
            opened_at: String::new(),
        }
    }

    #[test]
    fn doubling_progressive_requirements() {
        let m = manager();

        // First doubling needs +5%.
        assert!(m.assess_doubling(&position(0, -2.0), 4.9).is_err());
        assert!(m.assess_doubling(&position(0, -2.0), 5.0).is_ok());

        // Second needs +10%, third +15%.
        assert!(m.assess_doubling(&position(1, -2.0), 9.0).is_err());
        assert!(m.assess_doubling(&position(1, -2.0), 12.0).is_ok());
        assert!(m.assess_doubling(&position(2, -2.0), 14.0).is_err());
        assert!(m.assess_doubling(&position(2, -2.0), 16.0).is_ok());

        // Cap at max_doublings.
        assert!(m.assess_doubling(&position(3, -2.0), 50.0).is_err());

        // Deep drawdown disqualifies regardless of P&L.
        assert!(m.assess_doubling(&position(0, -10.1), 20.0).is_err());
    }

    #[test]
    fn heuristic_estimates_are_flagged() {
        let tf = estimate_timeframes(&metrics(10.0));
        assert!(tf.estimated);
        assert!((tf.gain_4h_pct - 6.0).abs() < 1e-9);
    }
}
