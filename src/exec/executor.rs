// =============================================================================
// Order Executor — dry-run probe, single-leg, round-trip, multi-input swaps
// =============================================================================
//
// Every order follows the same spine: validate the mint, check the sliding
// one-minute send window, check the ledger balance, fetch a quote (with
// exponential backoff on 429s and transient faults), gate on price impact,
// then either report the probe (dry-run) or build/sign/send/confirm and
// settle the ledger.
//
// Business rejections (impact too high, window full, round trip unprofitable)
// come back as `success: false` outcomes; transport and chain faults are
// errors. A dry-run probe with the network down may return a synthetic
// outcome so offline pipelines keep moving.
// =============================================================================

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::native_token::{lamports_to_sol, sol_to_lamports};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::errors::{BotError, BotResult};
use crate::exec::jupiter::{JupiterClient, Quote};
use crate::ledger::{BalanceLedger, TxKind};
use crate::positions::PositionStore;
use crate::rpc::RpcGateway;
use crate::types::SOL_MINT;

/// Flat per-signature fee assumption (lamports) for probes.
const DEFAULT_FEE_LAMPORTS: u64 = 5_000;
/// Base delay for the retry backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Sliding send-window length.
const SEND_WINDOW: Duration = Duration::from_secs(60);
/// Stable mints never used as multi-input funding sources.
const STABLE_MINTS: &[&str] = &[
    "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v", // USDC
    "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB", // USDT
];
/// Multi-input funding must beat the SOL route by this factor.
const MULTI_INPUT_EDGE: f64 = 1.05;

/// Result of one execution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount_sol: f64,
    /// Output in the output token's base units.
    pub est_out_amount: u64,
    pub price_impact_pct: f64,
    pub estimated_fee_sol: f64,
    pub price_impact_loss_sol: f64,
    pub total_cost_sol: f64,
    /// Total cost as a fraction of the input.
    pub cost_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExecutionOutcome {
    fn rejected(input_mint: &str, output_mint: &str, dry_run: bool, reason: String) -> Self {
        Self {
            success: false,
            dry_run,
            signature: None,
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount_sol: 0.0,
            est_out_amount: 0,
            price_impact_pct: 0.0,
            estimated_fee_sol: 0.0,
            price_impact_loss_sol: 0.0,
            total_cost_sol: 0.0,
            cost_percent: 0.0,
            reason: Some(reason),
        }
    }
}

/// Probe cost breakdown for a quoted input.
fn probe_costs(amount_sol: f64, impact_pct: f64) -> (f64, f64, f64, f64) {
    let fee = lamports_to_sol(DEFAULT_FEE_LAMPORTS);
    let impact_loss = amount_sol * impact_pct / 100.0;
    let total = fee + impact_loss;
    let cost_fraction = if amount_sol > 0.0 { total / amount_sol } else { 0.0 };
    (fee, impact_loss, total, cost_fraction)
}

/// Round-trip verdict: net percent gained, or the rejection reason.
pub fn round_trip_decision(
    in_sol: f64,
    out_sol: f64,
    fee_sol: f64,
    min_profit_pct: f64,
) -> Result<f64, String> {
    if in_sol <= 0.0 {
        return Err("zero input".to_string());
    }
    let net = out_sol - fee_sol;
    let net_pct = (net - in_sol) / in_sol * 100.0;
    if net_pct < min_profit_pct {
        Err(format!(
            "Insufficient round-trip profit: net {net_pct:.2}% < {min_profit_pct:.2}%"
        ))
    } else {
        Ok(net_pct)
    }
}

pub struct Executor {
    jupiter: JupiterClient,
    rpc: Arc<RpcGateway>,
    ledger: Arc<BalanceLedger>,
    positions: Arc<PositionStore>,
    keypair: Keypair,
    settings: Settings,
    sent: Mutex<VecDeque<Instant>>,
}

impl Executor {
    pub fn new(
        jupiter: JupiterClient,
        rpc: Arc<RpcGateway>,
        ledger: Arc<BalanceLedger>,
        positions: Arc<PositionStore>,
        keypair: Keypair,
        settings: Settings,
    ) -> Self {
        Self {
            jupiter,
            rpc,
            ledger,
            positions,
            keypair,
            settings,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn wallet(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    // -------------------------------------------------------------------------
    // Buy: SOL → token
    // -------------------------------------------------------------------------

    pub async fn execute(&self, target_mint: &str, sol_amount: f64) -> BotResult<ExecutionOutcome> {
        Pubkey::from_str(target_mint)
            .map_err(|_| BotError::ValidationFailed(format!("invalid mint {target_mint}")))?;

        if let Some(reason) = self.window_full() {
            return Ok(ExecutionOutcome::rejected(
                SOL_MINT,
                target_mint,
                self.settings.dry_run,
                reason,
            ));
        }

        let balance = self.ledger.get_balance().await;
        let needed = self.settings.min_balance_sol + sol_amount;
        if balance < needed {
            return Err(BotError::InsufficientBalance {
                needed,
                available: balance,
            });
        }

        let lamports = sol_to_lamports(sol_amount);
        let quote = match self
            .quote_with_retries(SOL_MINT, target_mint, lamports)
            .await
        {
            Ok(q) => q,
            Err(BotError::NetworkTransient(e)) if self.settings.dry_run => {
                // Offline probe: hand back a synthetic fill so dry-run
                // pipelines can be exercised without connectivity.
                warn!(mint = target_mint, error = %e, "network unreachable — synthetic dry-run result");
                let (fee, loss, total, fraction) = probe_costs(sol_amount, 0.0);
                return Ok(ExecutionOutcome {
                    success: true,
                    dry_run: true,
                    signature: None,
                    input_mint: SOL_MINT.to_string(),
                    output_mint: target_mint.to_string(),
                    in_amount_sol: sol_amount,
                    est_out_amount: 0,
                    price_impact_pct: 0.0,
                    estimated_fee_sol: fee,
                    price_impact_loss_sol: loss,
                    total_cost_sol: total,
                    cost_percent: fraction,
                    reason: Some("synthetic result: aggregator unreachable".to_string()),
                });
            }
            Err(e) => return Err(e),
        };

        self.settle_quote(quote, sol_amount, TxKind::Buy).await
    }

    // -------------------------------------------------------------------------
    // Sell: token → SOL
    // -------------------------------------------------------------------------

    /// Sell `raw_amount` base units of `mint` back to SOL.
    pub async fn execute_sell(&self, mint: &str, raw_amount: u64) -> BotResult<ExecutionOutcome> {
        Pubkey::from_str(mint)
            .map_err(|_| BotError::ValidationFailed(format!("invalid mint {mint}")))?;

        if let Some(reason) = self.window_full() {
            return Ok(ExecutionOutcome::rejected(
                mint,
                SOL_MINT,
                self.settings.dry_run,
                reason,
            ));
        }

        let quote = self.quote_with_retries(mint, SOL_MINT, raw_amount).await?;
        let est_sol = lamports_to_sol(quote.out_amount);
        self.settle_quote(quote, est_sol, TxKind::Sell).await
    }

    /// Quote-only view of a sell, for TP/SL sizing checks.
    pub async fn preview_sell(&self, mint: &str, raw_amount: u64) -> BotResult<Quote> {
        self.quote_with_retries(mint, SOL_MINT, raw_amount).await
    }

    // -------------------------------------------------------------------------
    // Round trip: SOL → token → SOL
    // -------------------------------------------------------------------------

    pub async fn execute_round_trip(
        &self,
        mint: &str,
        sol_amount: f64,
    ) -> BotResult<ExecutionOutcome> {
        Pubkey::from_str(mint)
            .map_err(|_| BotError::ValidationFailed(format!("invalid mint {mint}")))?;

        let lamports = sol_to_lamports(sol_amount);

        // Preview both legs; leg 2 is fed the conservative (post-slippage)
        // output of leg 1.
        let leg1 = self.quote_with_retries(SOL_MINT, mint, lamports).await?;
        let leg2 = self
            .quote_with_retries(mint, SOL_MINT, leg1.other_amount_threshold)
            .await?;

        let fee_sol = lamports_to_sol(DEFAULT_FEE_LAMPORTS) * 2.0;
        let out_sol = lamports_to_sol(leg2.out_amount);

        let net_pct = match round_trip_decision(
            sol_amount,
            out_sol,
            fee_sol,
            self.settings.min_profit_threshold_pct,
        ) {
            Ok(pct) => pct,
            Err(reason) => {
                info!(mint, reason = %reason, "round trip rejected at preview — no order sent");
                return Ok(ExecutionOutcome::rejected(
                    SOL_MINT,
                    mint,
                    self.settings.dry_run,
                    reason,
                ));
            }
        };

        info!(mint, net_pct, "round-trip preview profitable");

        if self.settings.dry_run {
            let (fee, loss, total, fraction) = probe_costs(sol_amount, leg1.price_impact_pct);
            return Ok(ExecutionOutcome {
                success: true,
                dry_run: true,
                signature: None,
                input_mint: SOL_MINT.to_string(),
                output_mint: mint.to_string(),
                in_amount_sol: sol_amount,
                est_out_amount: leg2.out_amount,
                price_impact_pct: leg1.price_impact_pct,
                estimated_fee_sol: fee,
                price_impact_loss_sol: loss,
                total_cost_sol: total,
                cost_percent: fraction,
                reason: Some(format!("round-trip preview net {net_pct:.2}%")),
            });
        }

        // Leg 1 live.
        let buy = self.settle_quote(leg1, sol_amount, TxKind::Buy).await?;
        if !buy.success {
            return Ok(buy);
        }

        // Size leg 2 from the actual on-chain fill, not the quote.
        let (ui_amount, decimals) = self
            .positions
            .fresh_amount(mint)
            .await
            .ok_or_else(|| BotError::Rpc(format!("no token balance visible for {mint} after leg 1")))?;
        let raw = (ui_amount * 10f64.powi(decimals as i32)) as u64;

        let leg2_live = self.quote_with_retries(mint, SOL_MINT, raw).await?;
        let est_sol = lamports_to_sol(leg2_live.out_amount);
        self.settle_quote(leg2_live, est_sol, TxKind::Sell).await
    }

    // -------------------------------------------------------------------------
    // Multi-input: fund the buy from a held non-stable token when its route
    // beats the SOL route by more than 5 %.
    // -------------------------------------------------------------------------

    pub async fn execute_multi_input(
        &self,
        target_mint: &str,
        sol_amount: f64,
    ) -> BotResult<ExecutionOutcome> {
        Pubkey::from_str(target_mint)
            .map_err(|_| BotError::ValidationFailed(format!("invalid mint {target_mint}")))?;

        let lamports = sol_to_lamports(sol_amount);
        let baseline = self
            .quote_with_retries(SOL_MINT, target_mint, lamports)
            .await?;
        let baseline_score = baseline.out_amount as f64 / sol_amount;

        let holdings = self.positions.positions().await;
        let mut best: Option<(String, u64, Quote, f64)> = None;

        for position in holdings.iter().filter(|p| {
            p.mint != target_mint && p.mint != SOL_MINT && !STABLE_MINTS.contains(&p.mint.as_str())
        }) {
            let raw = (position.amount * 10f64.powi(position.decimals as i32)) as u64;
            if raw == 0 {
                continue;
            }

            // Value the holding in SOL, then score its direct route.
            let to_sol = match self.quote_with_retries(&position.mint, SOL_MINT, raw).await {
                Ok(q) => q,
                Err(e) => {
                    debug!(mint = %position.mint, error = %e, "multi-input valuation failed — skipping");
                    continue;
                }
            };
            let value_sol = lamports_to_sol(to_sol.out_amount);
            if value_sol <= 0.0 {
                continue;
            }

            let direct = match self
                .quote_with_retries(&position.mint, target_mint, raw)
                .await
            {
                Ok(q) => q,
                Err(e) => {
                    debug!(mint = %position.mint, error = %e, "multi-input route failed — skipping");
                    continue;
                }
            };

            let score = direct.out_amount as f64 / value_sol;
            if score > baseline_score * MULTI_INPUT_EDGE {
                let improvement = score / baseline_score;
                if best.as_ref().map(|(_, _, _, s)| score > *s).unwrap_or(true) {
                    debug!(
                        funding = %position.mint,
                        improvement = format!("{:.1}%", (improvement - 1.0) * 100.0),
                        "multi-input route beats SOL"
                    );
                    best = Some((position.mint.clone(), raw, direct, score));
                }
            }
        }

        match best {
            Some((funding_mint, _raw, quote, _)) => {
                let value_sol = sol_amount; // ledger effect approximated at the SOL-equivalent
                info!(funding = %funding_mint, target = target_mint, "executing multi-input swap");
                let outcome = self.settle_quote(quote, value_sol, TxKind::Fee).await?;
                Ok(outcome)
            }
            None => {
                debug!(target = target_mint, "no funding token beats SOL — using SOL route");
                self.settle_quote(baseline, sol_amount, TxKind::Buy).await
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shared spine
    // -------------------------------------------------------------------------

    /// Impact gate, then dry-run probe or live build/sign/send/confirm.
    async fn settle_quote(
        &self,
        quote: Quote,
        in_amount_sol: f64,
        kind: TxKind,
    ) -> BotResult<ExecutionOutcome> {
        if quote.price_impact_pct > self.settings.max_impact_pct {
            return Ok(ExecutionOutcome::rejected(
                &quote.input_mint,
                &quote.output_mint,
                self.settings.dry_run,
                format!(
                    "price impact {:.2}% > {:.2}%",
                    quote.price_impact_pct, self.settings.max_impact_pct
                ),
            ));
        }

        let (fee, loss, total, fraction) = probe_costs(in_amount_sol, quote.price_impact_pct);

        if self.settings.dry_run {
            debug!(
                input = %quote.input_mint,
                output = %quote.output_mint,
                impact_pct = quote.price_impact_pct,
                cost_percent = fraction,
                "dry-run probe complete"
            );
            return Ok(ExecutionOutcome {
                success: true,
                dry_run: true,
                signature: None,
                input_mint: quote.input_mint.clone(),
                output_mint: quote.output_mint.clone(),
                in_amount_sol,
                est_out_amount: quote.out_amount,
                price_impact_pct: quote.price_impact_pct,
                estimated_fee_sol: fee,
                price_impact_loss_sol: loss,
                total_cost_sol: total,
                cost_percent: fraction,
                reason: None,
            });
        }

        // Live path.
        let built = self.jupiter.build_swap(&quote, &self.keypair.pubkey()).await?;
        let signed = VersionedTransaction::try_new(built.transaction.message, &[&self.keypair])
            .map_err(|e| BotError::Rpc(format!("signing failed: {e}")))?;

        let signature = self.rpc.send_transaction(&signed).await?;
        self.sent.lock().push_back(Instant::now());

        let confirmed = self.rpc.confirm_transaction(&signature).await?;
        if !confirmed {
            // Unconfirmed sends never mutate the ledger.
            return Ok(ExecutionOutcome::rejected(
                &quote.input_mint,
                &quote.output_mint,
                false,
                format!("transaction {signature} not confirmed in time"),
            ));
        }

        self.ledger.record_tx(kind, in_amount_sol, fee).await;
        self.positions.invalidate();

        info!(
            signature = %signature,
            input = %quote.input_mint,
            output = %quote.output_mint,
            in_amount_sol,
            "swap confirmed"
        );

        Ok(ExecutionOutcome {
            success: true,
            dry_run: false,
            signature: Some(signature.to_string()),
            input_mint: quote.input_mint,
            output_mint: quote.output_mint,
            in_amount_sol,
            est_out_amount: quote.out_amount,
            price_impact_pct: quote.price_impact_pct,
            estimated_fee_sol: fee,
            price_impact_loss_sol: loss,
            total_cost_sol: total,
            cost_percent: fraction,
            reason: None,
        })
    }

    /// Quote with exponential backoff. Rate limits exhaust into transient
    /// errors so the candidate loop can skip rather than abort.
    async fn quote_with_retries(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
    ) -> BotResult<Quote> {
        let mut last_err: Option<BotError> = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let delay = BACKOFF_BASE * 2u32.pow(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "quote retry backoff");
                tokio::time::sleep(delay).await;
            }

            match self
                .jupiter
                .get_quote(input_mint, output_mint, amount, self.settings.slippage_bps)
                .await
            {
                Ok(quote) => return Ok(quote),
                Err(e @ (BotError::RateLimited(_) | BotError::NetworkTransient(_))) => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        // Retries exhausted: a persistent 429 degrades to transient.
        Err(match last_err {
            Some(BotError::RateLimited(msg)) => BotError::NetworkTransient(format!(
                "rate limited after {} retries: {msg}",
                self.settings.max_retries
            )),
            Some(e) => e,
            None => BotError::NetworkTransient("quote failed".to_string()),
        })
    }

    /// Reason string when the sliding send window is full.
    fn window_full(&self) -> Option<String> {
        let mut sent = self.sent.lock();
        let now = Instant::now();
        while let Some(front) = sent.front() {
            if now.duration_since(*front) > SEND_WINDOW {
                sent.pop_front();
            } else {
                break;
            }
        }
        if sent.len() >= self.settings.max_tx_per_min as usize {
            Some(format!(
                "send window full: {} tx in the last minute (cap {})",
                sent.len(),
                self.settings.max_tx_per_min
            ))
        } else {
            None
        }
    }

    #[cfg(test)]
    fn seed_window(&self, count: usize) {
        let mut sent = self.sent.lock();
        for _ in 0..count {
            sent.push_back(Instant::now());
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("wallet", &self.keypair.pubkey().to_string())
            .field("dry_run", &self.settings.dry_run)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::BudgetGovernor;

    fn executor(name: &str, dry_run: bool) -> Executor {
        let budget_path = std::env::temp_dir().join(format!(
            "helios-exec-budget-{name}-{}.json",
            std::process::id()
        ));
        std::fs::remove_file(&budget_path).ok();
        let budget = Arc::new(BudgetGovernor::load(budget_path, 1000));
        let rpc = Arc::new(RpcGateway::new("http://127.0.0.1:1", budget));

        let entry_path = std::env::temp_dir().join(format!(
            "helios-exec-entries-{name}-{}.json",
            std::process::id()
        ));
        std::fs::remove_file(&entry_path).ok();

        let keypair = Keypair::new();
        let wallet = keypair.pubkey();
        let ledger = Arc::new(BalanceLedger::new(rpc.clone(), wallet, 10.0));
        let positions = Arc::new(PositionStore::load(rpc.clone(), wallet, entry_path));

        let mut settings = Settings::default();
        settings.dry_run = dry_run;
        settings.max_retries = 0;

        Executor::new(
            JupiterClient::new("http://127.0.0.1:1"),
            rpc,
            ledger,
            positions,
            keypair,
            settings,
        )
    }

    const VALID_MINT: &str = "So11111111111111111111111111111111111111112";

    #[test]
    fn round_trip_decision_threshold() {
        // 0.4% net against a 1.0% threshold: rejected.
        let err = round_trip_decision(1.0, 1.004, 0.0, 1.0).unwrap_err();
        assert!(err.contains("Insufficient round-trip profit"));

        // 1.5% net clears it.
        let pct = round_trip_decision(1.0, 1.015, 0.0, 1.0).unwrap();
        assert!((pct - 1.5).abs() < 1e-9);

        // Fees count against the trip.
        assert!(round_trip_decision(1.0, 1.012, 0.01, 1.0).is_err());
    }

    #[test]
    fn probe_cost_math() {
        let (fee, loss, total, fraction) = probe_costs(1.0, 0.9);
        assert!((fee - 0.000005).abs() < 1e-12);
        assert!((loss - 0.009).abs() < 1e-12);
        assert!((total - 0.009005).abs() < 1e-12);
        assert!((fraction - 0.009005).abs() < 1e-12);
    }

    #[tokio::test]
    async fn invalid_mint_rejected() {
        let exec = executor("badmint", true);
        let err = exec.execute("not-a-pubkey", 0.1).await.unwrap_err();
        assert!(matches!(err, BotError::ValidationFailed(_)));

        // Every entry path fails fast on a malformed mint.
        let err = exec
            .execute_multi_input("not-a-pubkey", 0.1)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::ValidationFailed(_)));

        let err = exec
            .execute_round_trip("not-a-pubkey", 0.1)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn full_window_blocks_send() {
        let exec = executor("window", true);
        exec.seed_window(5);
        let outcome = exec.execute(VALID_MINT, 0.1).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("send window full"));
    }

    #[tokio::test]
    async fn insufficient_balance_is_an_error() {
        let exec = executor("balance", true);
        // Ledger holds 10 SOL; ask for more than 10 - min_balance.
        let err = exec.execute(VALID_MINT, 20.0).await.unwrap_err();
        assert!(matches!(err, BotError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn offline_dry_run_returns_synthetic() {
        let exec = executor("synthetic", true);
        let outcome = exec.execute(VALID_MINT, 0.1).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.dry_run);
        assert!(outcome.reason.unwrap().contains("synthetic"));
    }

    #[tokio::test]
    async fn offline_live_mode_errors_instead() {
        let exec = executor("liveerr", false);
        let result = exec.execute(VALID_MINT, 0.1).await;
        assert!(result.is_err(), "live mode must not fabricate results");
    }
}
