// =============================================================================
// Shared types used across the Helios trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Mint address of wrapped SOL, the quote side of every swap.
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Buy/sell transaction counts reported by the pair feed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TxCounts {
    #[serde(default)]
    pub buys_1h: u64,
    #[serde(default)]
    pub sells_1h: u64,
    #[serde(default)]
    pub buys_24h: u64,
    #[serde(default)]
    pub sells_24h: u64,
}

impl TxCounts {
    /// Total transactions over the last hour.
    pub fn total_1h(&self) -> u64 {
        self.buys_1h + self.sells_1h
    }
}

/// Immutable snapshot of a discovered token. Produced by the discovery
/// aggregator, consumed read-only by every downstream stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCandidate {
    /// Token mint address (base-58).
    pub address: String,
    /// DEX identifier the primary pair trades on (e.g. "raydium").
    pub dex_id: String,
    pub liquidity_usd: f64,
    pub volume_24h_usd: f64,
    pub volume_1h_usd: f64,
    pub price_usd: f64,
    pub price_change_24h_pct: f64,
    #[serde(default)]
    pub tx_counts: TxCounts,
    /// Rug-risk score when a source supplies one (higher is worse).
    #[serde(default)]
    pub rug_score: Option<f64>,
}

impl TokenCandidate {
    /// Relative volume: last hour's volume against the 24 h hourly average.
    pub fn rvol(&self) -> f64 {
        let hourly_avg = self.volume_24h_usd / 24.0;
        if hourly_avg > 0.0 {
            self.volume_1h_usd / hourly_avg
        } else {
            0.0
        }
    }
}

/// Enriched view of a candidate, derived on demand from the primary pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketMetrics {
    pub rvol: f64,
    pub rsi: Option<f64>,
    /// Price low more recent than RSI low over the technical window.
    #[serde(default)]
    pub bullish_divergence: bool,
    pub age_hours: f64,
    pub fdv_to_liq_ratio: f64,
    pub volume_to_liq_ratio: f64,
    pub price_change_5m_pct: f64,
    pub price_change_1h_pct: f64,
    pub price_change_6h_pct: f64,
    pub price_change_24h_pct: f64,
}

// =============================================================================
// Discretised market state (reinforcement-learning key)
// =============================================================================

/// Coarse market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
    Volatile,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "BULL"),
            Self::Bear => write!(f, "BEAR"),
            Self::Sideways => write!(f, "SIDEWAYS"),
            Self::Volatile => write!(f, "VOLATILE"),
        }
    }
}

/// Relative-volume bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RvolBucket {
    Low,
    Med,
    High,
}

impl RvolBucket {
    pub fn from_rvol(rvol: f64) -> Self {
        if rvol >= 5.0 {
            Self::High
        } else if rvol >= 2.0 {
            Self::Med
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for RvolBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Med => write!(f, "MED"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Liquidity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LiqBucket {
    Low,
    Med,
    High,
}

impl LiqBucket {
    pub fn from_liquidity(liquidity_usd: f64) -> Self {
        if liquidity_usd >= 500_000.0 {
            Self::High
        } else if liquidity_usd >= 100_000.0 {
            Self::Med
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for LiqBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Med => write!(f, "MED"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Discretised market state used to key the learner's state-action table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketState {
    pub regime: Regime,
    pub rvol_bucket: RvolBucket,
    pub liq_bucket: LiqBucket,
}

impl MarketState {
    /// Classify a candidate + metrics into a discrete state.
    ///
    /// Large absolute 24 h swings dominate (VOLATILE), then the direction of
    /// the 24 h move with ±10 % as the trend threshold.
    pub fn classify(candidate: &TokenCandidate, metrics: &MarketMetrics) -> Self {
        let change = candidate.price_change_24h_pct;
        let regime = if change.abs() > 40.0 {
            Regime::Volatile
        } else if change > 10.0 {
            Regime::Bull
        } else if change < -10.0 {
            Regime::Bear
        } else {
            Regime::Sideways
        };

        Self {
            regime,
            rvol_bucket: RvolBucket::from_rvol(metrics.rvol),
            liq_bucket: LiqBucket::from_liquidity(candidate.liquidity_usd),
        }
    }

    /// Stable string key for persistence ("BULL|MED|HIGH").
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.regime, self.rvol_bucket, self.liq_bucket)
    }
}

// =============================================================================
// Decision audit record
// =============================================================================

/// Pipeline stage that produced a verdict for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionStage {
    Discovery,
    Validator,
    Strategy,
    Risk,
    Llm,
    Executor,
}

impl std::fmt::Display for DecisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovery => write!(f, "Discovery"),
            Self::Validator => write!(f, "Validator"),
            Self::Strategy => write!(f, "Strategy"),
            Self::Risk => write!(f, "Risk"),
            Self::Llm => write!(f, "LLM"),
            Self::Executor => write!(f, "Executor"),
        }
    }
}

/// Auditable record of every candidate evaluation, kept in a ring buffer
/// for the periodic status report.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub mint: String,
    /// "ENTER", "SKIP", or "BLOCK".
    pub final_decision: String,
    /// Stage that blocked the candidate, when blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_stage: Option<DecisionStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Combined strategy confidence at the time of the decision.
    pub confidence: f64,
    /// ISO 8601 timestamp.
    pub created_at: String,
}

impl DecisionRecord {
    /// Record an approved entry.
    pub fn entered(mint: impl Into<String>, confidence: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mint: mint.into(),
            final_decision: "ENTER".to_string(),
            blocking_stage: None,
            reason: None,
            confidence,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Record a candidate blocked at `stage`.
    pub fn blocked(
        mint: impl Into<String>,
        stage: DecisionStage,
        reason: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mint: mint.into(),
            final_decision: "BLOCK".to_string(),
            blocking_stage: Some(stage),
            reason: Some(reason.into()),
            confidence,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rvol_buckets_at_boundaries() {
        assert_eq!(RvolBucket::from_rvol(1.99), RvolBucket::Low);
        assert_eq!(RvolBucket::from_rvol(2.0), RvolBucket::Med);
        assert_eq!(RvolBucket::from_rvol(4.99), RvolBucket::Med);
        assert_eq!(RvolBucket::from_rvol(5.0), RvolBucket::High);
    }

    #[test]
    fn liq_buckets_at_boundaries() {
        assert_eq!(LiqBucket::from_liquidity(99_999.0), LiqBucket::Low);
        assert_eq!(LiqBucket::from_liquidity(100_000.0), LiqBucket::Med);
        assert_eq!(LiqBucket::from_liquidity(500_000.0), LiqBucket::High);
    }

    #[test]
    fn rvol_from_candidate() {
        let c = TokenCandidate {
            address: "M".into(),
            dex_id: "raydium".into(),
            liquidity_usd: 200_000.0,
            volume_24h_usd: 240_000.0,
            volume_1h_usd: 25_000.0,
            price_usd: 0.5,
            price_change_24h_pct: 18.0,
            tx_counts: TxCounts::default(),
            rug_score: None,
        };
        // 25_000 / (240_000 / 24) = 2.5
        assert!((c.rvol() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn state_key_is_stable() {
        let state = MarketState {
            regime: Regime::Bull,
            rvol_bucket: RvolBucket::Med,
            liq_bucket: LiqBucket::High,
        };
        assert_eq!(state.key(), "BULL|MED|HIGH");
    }
}
