// =============================================================================
// Strategy Ensemble — five variants behind one contract, plus the combiner
// =============================================================================
//
// Every variant implements `Strategy::analyse(candidate, metrics, position)`
// and returns a `Signal`. The ensemble runs all of them and folds the votes
// through the configured combiner policy; anything below the confidence
// floor is forced to Hold.
// =============================================================================

pub mod anti_martingale;
pub mod candlestick;
pub mod combiner;
pub mod dca;
pub mod momentum;
pub mod reversal;

use tracing::debug;

use crate::config::Settings;
use crate::positions::Position;
use crate::types::{MarketMetrics, TokenCandidate};

pub use combiner::CombinerMode;

/// What a strategy wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    /// Direction for weighted scoring: +1 buy, -1 sell, 0 hold.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
            Self::Hold => 0.0,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// One strategy's verdict on a token.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Signal {
    pub action: TradeAction,
    /// In [0, 1].
    pub confidence: f64,
    pub reason: String,
    /// Requested size; the caller clamps it to risk limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_sol: Option<f64>,
    /// Entry pattern label handed to the learner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Signal {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Hold,
            confidence: 0.0,
            reason: reason.into(),
            amount_sol: None,
            pattern: None,
        }
    }

    pub fn buy(confidence: f64, reason: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Buy,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            amount_sol: None,
            pattern: Some(pattern.into()),
        }
    }

    pub fn sell(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Sell,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            amount_sol: None,
            pattern: None,
        }
    }

    pub fn with_amount(mut self, amount_sol: f64) -> Self {
        self.amount_sol = Some(amount_sol);
        self
    }
}

/// Common contract for all strategy variants.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Voting weight in the ensemble combiner.
    fn weight(&self) -> f64 {
        1.0
    }

    fn analyse(
        &self,
        candidate: &TokenCandidate,
        metrics: &MarketMetrics,
        position: Option<&Position>,
    ) -> Signal;
}

/// A strategy's vote, labelled for the combiner and the audit trail.
#[derive(Debug, Clone)]
pub struct NamedSignal {
    pub name: &'static str,
    pub weight: f64,
    pub signal: Signal,
}

/// The full variant set plus the combiner policy.
pub struct StrategyEnsemble {
    strategies: Vec<Box<dyn Strategy>>,
    mode: CombinerMode,
    min_confidence: f64,
}

impl StrategyEnsemble {
    pub fn from_settings(settings: &Settings) -> Self {
        let strategies: Vec<Box<dyn Strategy>> = vec![
            Box::new(momentum::MomentumStrategy::new(settings.amount_sol)),
            Box::new(dca::DcaStrategy::new(settings.amount_sol)),
            Box::new(anti_martingale::AntiMartingaleStrategy::new(
                settings.amount_sol,
                settings.max_doublings,
            )),
            Box::new(reversal::ReversalStrategy::new(settings.amount_sol)),
            Box::new(candlestick::CandlestickStrategy::new(settings.amount_sol)),
        ];

        Self {
            strategies,
            mode: CombinerMode::parse(&settings.strategy_mode),
            min_confidence: settings.min_confidence_threshold,
        }
    }

    /// Run every variant and combine. Returns the final signal and the
    /// individual votes for the audit trail.
    pub fn evaluate(
        &self,
        candidate: &TokenCandidate,
        metrics: &MarketMetrics,
        position: Option<&Position>,
    ) -> (Signal, Vec<NamedSignal>) {
        let votes: Vec<NamedSignal> = self
            .strategies
            .iter()
            .map(|s| NamedSignal {
                name: s.name(),
                weight: s.weight(),
                signal: s.analyse(candidate, metrics, position),
            })
            .collect();

        for vote in &votes {
            debug!(
                mint = %candidate.address,
                strategy = vote.name,
                action = %vote.signal.action,
                confidence = vote.signal.confidence,
                reason = %vote.signal.reason,
                "strategy vote"
            );
        }

        let mut combined = combiner::combine(&votes, self.mode);

        // Confidence floor: anything weaker than the threshold is a Hold.
        if combined.action != TradeAction::Hold && combined.confidence < self.min_confidence {
            combined = Signal::hold(format!(
                "combined confidence {:.2} below floor {:.2} ({} suppressed)",
                combined.confidence, self.min_confidence, combined.action
            ));
        }

        (combined, votes)
    }
}

impl std::fmt::Debug for StrategyEnsemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEnsemble")
            .field("variants", &self.strategies.len())
            .field("mode", &self.mode)
            .field("min_confidence", &self.min_confidence)
            .finish()
    }
}

// =============================================================================
// Shared helpers for variants
// =============================================================================

/// Unrealised P&L percent for a position with a known entry.
pub(crate) fn position_pnl_pct(position: &Position, current_price: f64) -> Option<f64> {
    let entry = position.entry_price?;
    if entry <= 0.0 || current_price <= 0.0 {
        return None;
    }
    Some((current_price - entry) / entry * 100.0)
}

/// Hours since the position opened (0 when the timestamp is missing).
pub(crate) fn position_age_hours(position: &Position) -> f64 {
    chrono::DateTime::parse_from_rfc3339(&position.opened_at)
        .map(|t| {
            let secs = (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds();
            (secs as f64 / 3600.0).max(0.0)
        })
        .unwrap_or(0.0)
}

// =============================================================================
// Tests — full-ensemble scenarios
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxCounts;

    fn healthy_candidate() -> TokenCandidate {
        TokenCandidate {
            address: "Mint111".to_string(),
            dex_id: "raydium".to_string(),
            liquidity_usd: 200_000.0,
            volume_24h_usd: 150_000.0,
            volume_1h_usd: 15_625.0, // rvol = 2.5
            price_usd: 0.01,
            price_change_24h_pct: 18.0,
            tx_counts: TxCounts {
                buys_1h: 120,
                sells_1h: 80,
                buys_24h: 900,
                sells_24h: 700,
            },
            rug_score: Some(50.0),
        }
    }

    fn healthy_metrics() -> MarketMetrics {
        MarketMetrics {
            rvol: 2.5,
            rsi: None,
            bullish_divergence: false,
            age_hours: 72.0,
            fdv_to_liq_ratio: 4.0,
            volume_to_liq_ratio: 0.75,
            price_change_5m_pct: 1.2,
            price_change_1h_pct: 4.0,
            price_change_6h_pct: 11.0,
            price_change_24h_pct: 18.0,
        }
    }

    #[test]
    fn healthy_candidate_clears_entry_floor() {
        let mut settings = Settings::default();
        settings.strategy_mode = "ensemble".to_string();
        settings.min_confidence_threshold = 0.6;
        let ensemble = StrategyEnsemble::from_settings(&settings);

        let (signal, votes) = ensemble.evaluate(&healthy_candidate(), &healthy_metrics(), None);
        assert_eq!(votes.len(), 5);
        assert_eq!(signal.action, TradeAction::Buy);
        assert!(
            signal.confidence >= 0.65,
            "expected ≥ 0.65 confidence, got {:.3}",
            signal.confidence
        );
    }

    #[test]
    fn confidence_floor_forces_hold() {
        let mut settings = Settings::default();
        settings.min_confidence_threshold = 0.99;
        let ensemble = StrategyEnsemble::from_settings(&settings);

        let (signal, _) = ensemble.evaluate(&healthy_candidate(), &healthy_metrics(), None);
        assert_eq!(signal.action, TradeAction::Hold);
        assert!(signal.reason.contains("below floor"));
    }

    #[test]
    fn pnl_helper() {
        let pos = Position {
            mint: "M".to_string(),
            amount: 100.0,
            decimals: 6,
            entry_price: Some(1.0),
            max_drawdown_pct: 0.0,
            doubling_count: 0,
            pattern: None,
            liquidity_usd: 150_000.0,
            volume_24h_usd: 100_000.0,
            position_size_pct: 5.0,
            entered_extended: false,
            opened_at: chrono::Utc::now().to_rfc3339(),
        };
        assert!((position_pnl_pct(&pos, 1.121).unwrap() - 12.1).abs() < 1e-9);

        let no_entry = Position {
            entry_price: None,
            ..pos
        };
        assert!(position_pnl_pct(&no_entry, 1.1).is_none());
    }
}
