// =============================================================================
// Error taxonomy shared across the Helios trading engine
// =============================================================================
//
// Component boundaries return `Result<T, BotError>` so that the orchestrator
// can route each failure kind: transient kinds skip the current candidate,
// fatal kinds abort startup, rate limits back off and retry.
// =============================================================================

use thiserror::Error;

/// All failure kinds the engine distinguishes at component boundaries.
#[derive(Debug, Error)]
pub enum BotError {
    /// Configuration or key material could not be loaded/decoded.
    #[error("config error: {0}")]
    Config(String),

    /// The daily RPC call budget is exhausted; serve stale data instead.
    #[error("rpc call budget exhausted ({used}/{total})")]
    BudgetExhausted { used: u64, total: u64 },

    /// The chain RPC node returned an error.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The swap aggregator returned an error or an undecodable payload.
    #[error("aggregator error: {0}")]
    Aggregator(String),

    /// No price could be obtained and no cached value exists.
    #[error("price unavailable for {0}")]
    PriceUnavailable(String),

    /// The candidate failed a validation gate (rug score, liquidity, volume).
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The risk manager blocked the trade.
    #[error("risk blocked: {0}")]
    RiskBlocked(String),

    /// Not enough SOL to cover the trade plus the reserve.
    #[error("insufficient balance: need {needed:.4} SOL, have {available:.4} SOL")]
    InsufficientBalance { needed: f64, available: f64 },

    /// An upstream service returned HTTP 429.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A transient transport failure (timeout, DNS, connection reset).
    #[error("network error: {0}")]
    NetworkTransient(String),
}

impl BotError {
    /// Failure kinds that skip the current candidate but keep the engine
    /// running. Everything else is either retried in place or fatal.
    pub fn skips_candidate(&self) -> bool {
        matches!(
            self,
            Self::BudgetExhausted { .. }
                | Self::PriceUnavailable(_)
                | Self::Aggregator(_)
                | Self::NetworkTransient(_)
                | Self::ValidationFailed(_)
                | Self::RiskBlocked(_)
        )
    }

    /// Kinds that are fatal when raised during startup.
    pub fn fatal_at_startup(&self) -> bool {
        matches!(self, Self::Config(_) | Self::InsufficientBalance { .. })
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(429) {
            Self::RateLimited(e.to_string())
        } else {
            Self::NetworkTransient(e.to_string())
        }
    }
}

/// Convenience alias used throughout the engine.
pub type BotResult<T> = Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_skip_candidate() {
        assert!(BotError::PriceUnavailable("X".into()).skips_candidate());
        assert!(BotError::Aggregator("down".into()).skips_candidate());
        assert!(BotError::BudgetExhausted { used: 10, total: 10 }.skips_candidate());
        assert!(!BotError::Config("bad key".into()).skips_candidate());
    }

    #[test]
    fn startup_fatal_kinds() {
        assert!(BotError::Config("missing".into()).fatal_at_startup());
        assert!(BotError::InsufficientBalance { needed: 1.0, available: 0.1 }.fatal_at_startup());
        assert!(!BotError::Rpc("hiccup".into()).fatal_at_startup());
    }
}
