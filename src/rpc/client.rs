// =============================================================================
// Chain RPC Gateway — JSON-RPC 2.0 over HTTP, gated by the budget governor
// =============================================================================
//
// Every method checks `may_call` before issuing the request and `record`s the
// call after. A declined call surfaces as `BudgetExhausted` so callers can
// fall back to cached data.
//
// Transactions are versioned, signed locally, serialised with bincode, and
// shipped base-64. Preferred commitment is `processed`.
// =============================================================================

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use tracing::{debug, warn};

use crate::errors::{BotError, BotResult};
use crate::rpc::budget::BudgetGovernor;

/// SPL token program id (owner filter for token-account queries).
const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

/// Poll attempts before a confirmation is reported as timed out.
const CONFIRM_ATTEMPTS: u32 = 30;
/// Delay between confirmation polls.
const CONFIRM_POLL: Duration = Duration::from_secs(2);

/// One parsed SPL token account from the wallet's view.
#[derive(Debug, Clone)]
pub struct TokenAccountView {
    pub mint: String,
    pub ui_amount: f64,
    pub decimals: u8,
}

/// JSON-RPC gateway to the chain node.
pub struct RpcGateway {
    http: reqwest::Client,
    url: String,
    budget: Arc<BudgetGovernor>,
    request_id: AtomicU64,
}

impl RpcGateway {
    pub fn new(url: impl Into<String>, budget: Arc<BudgetGovernor>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            url: url.into(),
            budget,
            request_id: AtomicU64::new(1),
        }
    }

    // -------------------------------------------------------------------------
    // Core JSON-RPC call
    // -------------------------------------------------------------------------

    async fn call(&self, method: &str, params: Value) -> BotResult<Value> {
        if !self.budget.may_call(method) {
            return Err(self.budget.exhausted_error());
        }

        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self.http.post(&self.url).json(&body).send().await?;
        self.budget.record(method);

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(BotError::RateLimited(format!("rpc {method} returned 429")));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| BotError::Rpc(format!("{method}: undecodable response: {e}")))?;

        if let Some(err) = payload.get("error") {
            if !err.is_null() {
                return Err(BotError::Rpc(format!("{method}: {err}")));
            }
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| BotError::Rpc(format!("{method}: response missing 'result'")))
    }

    // -------------------------------------------------------------------------
    // Balances & accounts
    // -------------------------------------------------------------------------

    /// Lamport balance of `pubkey` at `processed` commitment.
    pub async fn get_balance(&self, pubkey: &Pubkey) -> BotResult<u64> {
        let result = self
            .call(
                "getBalance",
                json!([pubkey.to_string(), {"commitment": "processed"}]),
            )
            .await?;

        result["value"]
            .as_u64()
            .ok_or_else(|| BotError::Rpc("getBalance: missing value".to_string()))
    }

    /// All non-zero SPL token accounts owned by `owner` (jsonParsed view).
    pub async fn get_parsed_token_accounts(
        &self,
        owner: &Pubkey,
    ) -> BotResult<Vec<TokenAccountView>> {
        let result = self
            .call(
                "getTokenAccountsByOwner",
                json!([
                    owner.to_string(),
                    {"programId": TOKEN_PROGRAM_ID},
                    {"encoding": "jsonParsed", "commitment": "processed"}
                ]),
            )
            .await?;

        let entries = result["value"].as_array().cloned().unwrap_or_default();
        let mut accounts = Vec::new();
        for entry in &entries {
            let info = &entry["account"]["data"]["parsed"]["info"];
            let mint = match info["mint"].as_str() {
                Some(m) => m.to_string(),
                None => continue,
            };
            let amount = &info["tokenAmount"];
            let ui_amount = amount["uiAmount"].as_f64().unwrap_or(0.0);
            let decimals = amount["decimals"].as_u64().unwrap_or(0) as u8;

            if ui_amount > 0.0 {
                accounts.push(TokenAccountView {
                    mint,
                    ui_amount,
                    decimals,
                });
            }
        }

        debug!(owner = %owner, count = accounts.len(), "token accounts fetched");
        Ok(accounts)
    }

    /// jsonParsed account info for a single account (e.g. a mint).
    pub async fn get_parsed_account_info(&self, pubkey: &Pubkey) -> BotResult<Value> {
        self.call(
            "getAccountInfo",
            json!([pubkey.to_string(), {"encoding": "jsonParsed", "commitment": "processed"}]),
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Most recent blockhash at `processed` commitment.
    pub async fn get_latest_blockhash(&self) -> BotResult<Hash> {
        let result = self
            .call("getLatestBlockhash", json!([{"commitment": "processed"}]))
            .await?;

        let blockhash = result["value"]["blockhash"]
            .as_str()
            .ok_or_else(|| BotError::Rpc("getLatestBlockhash: missing blockhash".to_string()))?;

        Hash::from_str(blockhash)
            .map_err(|e| BotError::Rpc(format!("getLatestBlockhash: bad hash: {e}")))
    }

    /// Fee in lamports for a base-64 serialised message, when the node can
    /// price it.
    pub async fn get_fee_for_message(&self, message_b64: &str) -> BotResult<Option<u64>> {
        let result = self
            .call(
                "getFeeForMessage",
                json!([message_b64, {"commitment": "processed"}]),
            )
            .await?;
        Ok(result["value"].as_u64())
    }

    /// Serialise, base-64 encode, and submit a signed versioned transaction.
    pub async fn send_transaction(&self, tx: &VersionedTransaction) -> BotResult<Signature> {
        use base64::Engine as _;

        let wire = bincode::serialize(tx)
            .map_err(|e| BotError::Rpc(format!("transaction serialisation failed: {e}")))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(wire);

        let result = self
            .call(
                "sendTransaction",
                json!([encoded, {"encoding": "base64", "preflightCommitment": "processed"}]),
            )
            .await?;

        let sig = result
            .as_str()
            .ok_or_else(|| BotError::Rpc("sendTransaction: missing signature".to_string()))?;
        Signature::from_str(sig)
            .map_err(|e| BotError::Rpc(format!("sendTransaction: bad signature: {e}")))
    }

    /// Poll signature status until the transaction reaches `processed` (or
    /// better), fails, or the poll budget runs out.
    pub async fn confirm_transaction(&self, signature: &Signature) -> BotResult<bool> {
        for attempt in 0..CONFIRM_ATTEMPTS {
            let result = self
                .call(
                    "getSignatureStatuses",
                    json!([[signature.to_string()], {"searchTransactionHistory": false}]),
                )
                .await?;

            if let Some(status) = result["value"].get(0).filter(|s| !s.is_null()) {
                if let Some(err) = status.get("err").filter(|e| !e.is_null()) {
                    return Err(BotError::Rpc(format!(
                        "transaction {signature} failed on chain: {err}"
                    )));
                }
                if status["confirmationStatus"].as_str().is_some() {
                    debug!(signature = %signature, attempt, "transaction confirmed");
                    return Ok(true);
                }
            }

            tokio::time::sleep(CONFIRM_POLL).await;
        }

        warn!(signature = %signature, "confirmation timed out");
        Ok(false)
    }
}

impl std::fmt::Debug for RpcGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGateway")
            .field("url", &self.url)
            .field("budget", &self.budget)
            .finish()
    }
}
