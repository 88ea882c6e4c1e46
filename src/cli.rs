// =============================================================================
// Command-line interface — per-run overrides on top of Settings
// =============================================================================
//
// SAFETY: live trading requires BOTH --live and --confirm-live. Either flag
// alone leaves the engine in dry-run.
// =============================================================================

use clap::Parser;

use crate::config::Settings;

/// Autonomous Solana trading agent.
#[derive(Debug, Parser)]
#[command(name = "helios-bot", version, about)]
pub struct CliArgs {
    /// Disable dry-run and send real transactions (requires --confirm-live).
    #[arg(long)]
    pub live: bool,

    /// Second confirmation required for live trading.
    #[arg(long)]
    pub confirm_live: bool,

    /// Run for N hours, then shut down cleanly.
    #[arg(long, value_name = "N")]
    pub hours: Option<f64>,

    /// Run a single scan cycle and exit.
    #[arg(long)]
    pub once: bool,

    /// Evaluate one specific mint instead of the discovery feed.
    #[arg(long, value_name = "MINT")]
    pub token: Option<String>,

    /// SOL amount per entry.
    #[arg(long, value_name = "N")]
    pub amount_sol: Option<f64>,

    /// Swap slippage in basis points.
    #[arg(long, value_name = "N")]
    pub slippage_bps: Option<u32>,

    /// Minimum round-trip profit percentage.
    #[arg(long, value_name = "N")]
    pub min_profit: Option<f64>,

    /// Maximum acceptable price impact percentage.
    #[arg(long, value_name = "N")]
    pub risk: Option<f64>,

    /// Minimum SOL per trade.
    #[arg(long, value_name = "N")]
    pub min_trade: Option<f64>,

    /// Maximum SOL per trade.
    #[arg(long, value_name = "N")]
    pub max_trade: Option<f64>,

    /// Combiner policy: ensemble, consensus, best, conservative.
    #[arg(long, value_name = "NAME")]
    pub strategy_mode: Option<String>,

    /// Route candidates through the strategy ensemble.
    #[arg(long)]
    pub use_strategies: bool,

    /// Allow HOLD signals with very high confidence to enter anyway.
    #[arg(long)]
    pub allow_hold_buys: bool,

    /// Confidence floor for --allow-hold-buys.
    #[arg(long, value_name = "N")]
    pub min_hold_confidence: Option<f64>,

    /// Enable the automatic take-profit loop.
    #[arg(long)]
    pub auto_tp: bool,

    /// Minimum take-profit percentage when no dynamic target exists.
    #[arg(long, value_name = "N")]
    pub tp_min_pct: Option<f64>,

    /// Take-profit check interval in milliseconds.
    #[arg(long, value_name = "N")]
    pub tp_interval_ms: Option<u64>,

    /// Enable the automatic stop-loss loop.
    #[arg(long)]
    pub auto_sl: bool,

    /// Stop-loss percentage below entry.
    #[arg(long, value_name = "N")]
    pub sl_pct: Option<f64>,

    /// Stop-loss check interval in milliseconds.
    #[arg(long, value_name = "N")]
    pub sl_interval_ms: Option<u64>,

    /// Allow funding swaps from held non-stable tokens.
    #[arg(long)]
    pub multi_input: bool,

    /// Probe a full round trip before entering.
    #[arg(long)]
    pub roundtrip: bool,

    /// Minutes a mint stays in the recently-analysed set.
    #[arg(long, value_name = "N")]
    pub seen_ttl_mins: Option<u64>,

    /// Stop once balance reaches N times the starting balance.
    #[arg(long, value_name = "N")]
    pub target_mult: Option<f64>,

    /// Skip the base validator (whitelisted flows only).
    #[arg(long)]
    pub skip_validate: bool,
}

impl CliArgs {
    /// Overlay the parsed flags onto loaded settings.
    pub fn apply(&self, settings: &mut Settings) {
        if self.live && self.confirm_live {
            settings.dry_run = false;
        } else if self.live {
            tracing::warn!("--live given without --confirm-live — staying in dry-run");
        }

        settings.run_hours = self.hours.or(settings.run_hours);
        settings.once |= self.once;
        if self.token.is_some() {
            settings.forced_token = self.token.clone();
        }
        if let Some(v) = self.amount_sol {
            settings.amount_sol = v;
        }
        if let Some(v) = self.slippage_bps {
            settings.slippage_bps = v;
        }
        if let Some(v) = self.min_profit {
            settings.min_profit_threshold_pct = v;
        }
        if let Some(v) = self.risk {
            settings.max_impact_pct = v;
        }
        if let Some(v) = self.min_trade {
            settings.min_trade_sol = v;
        }
        if let Some(v) = self.max_trade {
            settings.max_trade_sol = v;
        }
        if let Some(mode) = &self.strategy_mode {
            settings.strategy_mode = mode.clone();
        }
        settings.use_strategies |= self.use_strategies;
        settings.allow_hold_buys |= self.allow_hold_buys;
        if let Some(v) = self.min_hold_confidence {
            settings.min_hold_confidence = v;
        }
        settings.auto_tp |= self.auto_tp;
        if let Some(v) = self.tp_min_pct {
            settings.tp_min_pct = v;
        }
        if let Some(v) = self.tp_interval_ms {
            settings.tp_interval_ms = v;
        }
        settings.auto_sl |= self.auto_sl;
        if let Some(v) = self.sl_pct {
            settings.sl_pct = v;
        }
        if let Some(v) = self.sl_interval_ms {
            settings.sl_interval_ms = v;
        }
        settings.multi_input |= self.multi_input;
        settings.roundtrip |= self.roundtrip;
        if let Some(v) = self.seen_ttl_mins {
            settings.seen_ttl_mins = v;
        }
        if self.target_mult.is_some() {
            settings.target_mult = self.target_mult;
        }
        settings.skip_validate |= self.skip_validate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_requires_confirmation() {
        let mut settings = Settings::default();
        let args = CliArgs::parse_from(["helios-bot", "--live"]);
        args.apply(&mut settings);
        assert!(settings.dry_run, "--live alone must not disable dry-run");

        let args = CliArgs::parse_from(["helios-bot", "--live", "--confirm-live"]);
        args.apply(&mut settings);
        assert!(!settings.dry_run);
    }

    #[test]
    fn numeric_overrides_apply() {
        let mut settings = Settings::default();
        let args = CliArgs::parse_from([
            "helios-bot",
            "--amount-sol",
            "0.2",
            "--slippage-bps",
            "100",
            "--tp-min-pct",
            "4.5",
            "--seen-ttl-mins",
            "20",
        ]);
        args.apply(&mut settings);
        assert!((settings.amount_sol - 0.2).abs() < f64::EPSILON);
        assert_eq!(settings.slippage_bps, 100);
        assert!((settings.tp_min_pct - 4.5).abs() < f64::EPSILON);
        assert_eq!(settings.seen_ttl_mins, 20);
    }

    #[test]
    fn forced_token_mode() {
        let mut settings = Settings::default();
        let args = CliArgs::parse_from(["helios-bot", "--token", "Mint111", "--once"]);
        args.apply(&mut settings);
        assert_eq!(settings.forced_token.as_deref(), Some("Mint111"));
        assert!(settings.once);
    }
}
