// =============================================================================
// Aggregator Client — quote and swap-build over the Jupiter-style HTTP API
// =============================================================================
//
//   GET  /swap/v1/quote?inputMint&outputMint&amount&slippageBps
//   POST /swap/v1/swap {quoteResponse, userPublicKey, wrapAndUnwrapSol}
//
// Amount fields arrive as decimal strings; priceImpactPct arrives as either
// a string or a number depending on the deployment. The raw quote JSON is
// kept verbatim because the swap build endpoint wants it echoed back.
// =============================================================================

use std::time::Duration;

use base64::Engine as _;
use serde_json::{json, Value};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::VersionedTransaction;
use tracing::debug;

use crate::errors::{BotError, BotResult};

/// A decoded quote, with the raw payload retained for the swap build.
#[derive(Debug, Clone)]
pub struct Quote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    pub out_amount: u64,
    /// Worst-case output after slippage.
    pub other_amount_threshold: u64,
    pub price_impact_pct: f64,
    pub route_hops: usize,
    pub raw: Value,
}

/// A built swap ready for local signing.
#[derive(Debug)]
pub struct BuiltSwap {
    pub transaction: VersionedTransaction,
    pub last_valid_block_height: Option<u64>,
}

pub struct JupiterClient {
    http: reqwest::Client,
    base_url: String,
}

impl JupiterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Quote
    // -------------------------------------------------------------------------

    pub async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u32,
    ) -> BotResult<Quote> {
        let url = format!(
            "{}/swap/v1/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.base_url, input_mint, output_mint, amount, slippage_bps
        );

        let resp = self.http.get(&url).send().await?;
        if resp.status().as_u16() == 429 {
            return Err(BotError::RateLimited("aggregator returned 429".to_string()));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| BotError::Aggregator(format!("quote undecodable: {e}")))?;

        if let Some(err) = body.get("error") {
            if !err.is_null() {
                return Err(BotError::Aggregator(format!("quote error: {err}")));
            }
        }

        let quote = parse_quote(input_mint, output_mint, body)?;
        debug!(
            input = input_mint,
            output = output_mint,
            in_amount = quote.in_amount,
            out_amount = quote.out_amount,
            impact_pct = quote.price_impact_pct,
            hops = quote.route_hops,
            "quote received"
        );
        Ok(quote)
    }

    // -------------------------------------------------------------------------
    // Swap build
    // -------------------------------------------------------------------------

    /// Ask the aggregator to assemble the transaction for a quote. The
    /// returned transaction still needs the user's signature.
    pub async fn build_swap(&self, quote: &Quote, user: &Pubkey) -> BotResult<BuiltSwap> {
        let body = json!({
            "quoteResponse": quote.raw,
            "userPublicKey": user.to_string(),
            "wrapAndUnwrapSol": true,
        });

        let resp = self
            .http
            .post(format!("{}/swap/v1/swap", self.base_url))
            .json(&body)
            .send()
            .await?;

        if resp.status().as_u16() == 429 {
            return Err(BotError::RateLimited("aggregator returned 429".to_string()));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| BotError::Aggregator(format!("swap response undecodable: {e}")))?;

        let tx_b64 = payload["swapTransaction"]
            .as_str()
            .ok_or_else(|| BotError::Aggregator("swap response missing swapTransaction".to_string()))?;

        let wire = base64::engine::general_purpose::STANDARD
            .decode(tx_b64)
            .map_err(|e| BotError::Aggregator(format!("swapTransaction not base64: {e}")))?;

        let transaction: VersionedTransaction = bincode::deserialize(&wire)
            .map_err(|e| BotError::Aggregator(format!("swapTransaction undecodable: {e}")))?;

        Ok(BuiltSwap {
            transaction,
            last_valid_block_height: payload["lastValidBlockHeight"].as_u64(),
        })
    }
}

impl std::fmt::Debug for JupiterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JupiterClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Decode the quote body's stringly-typed numeric fields.
fn parse_quote(input_mint: &str, output_mint: &str, body: Value) -> BotResult<Quote> {
    let in_amount = amount_field(&body, "inAmount")?;
    let out_amount = amount_field(&body, "outAmount")?;
    let other_amount_threshold =
        amount_field(&body, "otherAmountThreshold").unwrap_or(out_amount);

    let price_impact_pct = match &body["priceImpactPct"] {
        Value::String(s) => s.parse::<f64>().unwrap_or(0.0) * 100.0,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) * 100.0,
        _ => 0.0,
    };

    let route_hops = body["routePlan"].as_array().map(|a| a.len()).unwrap_or(0);

    Ok(Quote {
        input_mint: input_mint.to_string(),
        output_mint: output_mint.to_string(),
        in_amount,
        out_amount,
        other_amount_threshold,
        price_impact_pct,
        route_hops,
        raw: body,
    })
}

fn amount_field(body: &Value, key: &str) -> BotResult<u64> {
    match &body[key] {
        Value::String(s) => s
            .parse::<u64>()
            .map_err(|_| BotError::Aggregator(format!("quote field {key} unparsable: {s}"))),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| BotError::Aggregator(format!("quote field {key} not a u64"))),
        _ => Err(BotError::Aggregator(format!("quote missing field {key}"))),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn quote_body() -> Value {
        serde_json::json!({
            "inAmount": "50000000",
            "outAmount": "123456789",
            "otherAmountThreshold": "120000000",
            "priceImpactPct": "0.009",
            "routePlan": [{"swapInfo": {}}, {"swapInfo": {}}]
        })
    }

    #[test]
    fn parses_string_amounts_and_impact() {
        let q = parse_quote("So111", "Mint111", quote_body()).unwrap();
        assert_eq!(q.in_amount, 50_000_000);
        assert_eq!(q.out_amount, 123_456_789);
        assert_eq!(q.other_amount_threshold, 120_000_000);
        assert!((q.price_impact_pct - 0.9).abs() < 1e-9);
        assert_eq!(q.route_hops, 2);
    }

    #[test]
    fn numeric_impact_also_accepted() {
        let mut body = quote_body();
        body["priceImpactPct"] = serde_json::json!(0.012);
        let q = parse_quote("A", "B", body).unwrap();
        assert!((q.price_impact_pct - 1.2).abs() < 1e-9);
    }

    #[test]
    fn missing_amount_is_an_error() {
        let mut body = quote_body();
        body.as_object_mut().unwrap().remove("outAmount");
        assert!(parse_quote("A", "B", body).is_err());
    }

    #[test]
    fn threshold_defaults_to_out_amount() {
        let mut body = quote_body();
        body.as_object_mut().unwrap().remove("otherAmountThreshold");
        let q = parse_quote("A", "B", body).unwrap();
        assert_eq!(q.other_amount_threshold, q.out_amount);
    }
}
