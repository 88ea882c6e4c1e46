// =============================================================================
// LLM Validator — final entry gate and dynamic profit-target calculator
// =============================================================================
//
// The entry gate posts the combined strategy view plus the candlestick
// analysis to a chat-completions endpoint with a strict-JSON system prompt,
// and parses the first balanced `{...}` out of the reply.
//
// The model is advisory: any failure (no key, timeout, undecodable reply)
// degrades to a deterministic ladder on the combined signal and the token's
// liquidity/volume, so the pipeline never stalls on the LLM.
//
// The profit-target calculator is fully deterministic — a scoring rubric,
// not a model call — clamped to [3, 40] percent.
// =============================================================================

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::strategy::candlestick::PatternHit;
use crate::strategy::Signal;
use crate::types::{MarketMetrics, TokenCandidate};

/// Target bounds (percent).
const TARGET_MIN_PCT: f64 = 3.0;
const TARGET_MAX_PCT: f64 = 40.0;

/// Degradation ladder thresholds.
const DEGRADE_FULL_SIGNAL: f64 = 0.65;
const DEGRADE_CAUTIOUS_SIGNAL: f64 = 0.55;
const DEGRADE_MIN_LIQUIDITY: f64 = 100_000.0;
const DEGRADE_MIN_VOLUME: f64 = 50_000.0;

/// Verdict from the gate (model-backed or degraded).
#[derive(Debug, Clone)]
pub struct LlmDecision {
    pub approved: bool,
    pub confidence: f64,
    pub risk_level: String,
    pub reason: String,
    /// True when the model was unavailable and the ladder decided.
    pub degraded: bool,
}

/// Final gate in front of the executor.
pub struct LlmValidator {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl LlmValidator {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Entry gate
    // -------------------------------------------------------------------------

    /// Ask the model for a yes/no entry verdict with a risk level.
    pub async fn validate_entry(
        &self,
        candidate: &TokenCandidate,
        metrics: &MarketMetrics,
        combined: &Signal,
        pattern: Option<&PatternHit>,
    ) -> LlmDecision {
        let Some(api_key) = &self.api_key else {
            debug!("no LLM key configured — using degradation ladder");
            return self.degrade(candidate, combined);
        };

        let candle_context = match pattern {
            Some(hit) => format!("{} (strength {:.2})", hit.pattern, hit.strength),
            None => "no notable pattern".to_string(),
        };

        let system = "You are a trading risk analyst. Respond with STRICT JSON only, no prose: \
                      {\"enter\": bool, \"confidence\": number 0-1, \"risk_level\": \
                      \"low\"|\"medium\"|\"high\", \"reason\": string}";
        let user = format!(
            "Token {}: price ${:.8}, liquidity ${:.0}, 24h volume ${:.0}, 24h change {:+.1}%, \
             1h change {:+.1}%, RVOL {:.2}, pool age {:.0}h. Candlestick: {}. \
             Combined strategy signal: {} with confidence {:.2} ({}). Enter?",
            candidate.address,
            candidate.price_usd,
            candidate.liquidity_usd,
            candidate.volume_24h_usd,
            candidate.price_change_24h_pct,
            metrics.price_change_1h_pct,
            metrics.rvol,
            metrics.age_hours,
            candle_context,
            combined.action,
            combined.confidence,
            combined.reason,
        );

        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
            "max_tokens": 300,
        });

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await;

        let payload: Value = match response {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "LLM response undecodable — degrading");
                    return self.degrade(candidate, combined);
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "LLM endpoint error — degrading");
                return self.degrade(candidate, combined);
            }
            Err(e) => {
                warn!(error = %e, "LLM unreachable — degrading");
                return self.degrade(candidate, combined);
            }
        };

        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        match extract_first_json(content) {
            Some(verdict) => {
                let approved = verdict["enter"].as_bool().unwrap_or(false);
                let confidence = verdict["confidence"].as_f64().unwrap_or(0.5).clamp(0.0, 1.0);
                let risk_level = verdict["risk_level"].as_str().unwrap_or("medium").to_string();
                let reason = verdict["reason"].as_str().unwrap_or("").to_string();
                debug!(
                    mint = %candidate.address,
                    approved,
                    confidence,
                    risk_level = %risk_level,
                    "LLM verdict"
                );
                LlmDecision {
                    approved,
                    confidence,
                    risk_level,
                    reason,
                    degraded: false,
                }
            }
            None => {
                warn!(mint = %candidate.address, "no JSON object in LLM reply — degrading");
                self.degrade(candidate, combined)
            }
        }
    }

    /// The deterministic ladder used when the model cannot answer.
    fn degrade(&self, candidate: &TokenCandidate, combined: &Signal) -> LlmDecision {
        let liq = candidate.liquidity_usd;
        let vol = candidate.volume_24h_usd;
        let signal = combined.confidence;

        if signal >= DEGRADE_FULL_SIGNAL && liq >= DEGRADE_MIN_LIQUIDITY && vol >= DEGRADE_MIN_VOLUME
        {
            return LlmDecision {
                approved: true,
                confidence: signal * 0.8,
                risk_level: "medium".to_string(),
                reason: "LLM unavailable; approved on strong signal + deep market".to_string(),
                degraded: true,
            };
        }
        if signal >= DEGRADE_CAUTIOUS_SIGNAL && liq >= DEGRADE_MIN_LIQUIDITY {
            return LlmDecision {
                approved: true,
                confidence: signal * 0.7,
                risk_level: "high".to_string(),
                reason: "LLM unavailable; cautious approval on adequate signal".to_string(),
                degraded: true,
            };
        }
        LlmDecision {
            approved: false,
            confidence: signal,
            risk_level: "high".to_string(),
            reason: "LLM unavailable; signal too weak to approve blind".to_string(),
            degraded: true,
        }
    }
}

impl std::fmt::Debug for LlmValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmValidator")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// Dynamic profit target
// =============================================================================

/// Deterministic profit-target rubric. Returns the target percent in
/// [3, 40] with the contributing reasons.
///
/// Points: RVOL +0..10, momentum +0..8, volume +0..3, AI confidence +0..5,
/// thin-liquidity penalty to −3, win/loss streak ±3.
pub fn dynamic_profit_target(
    price_change_24h_pct: f64,
    rvol: f64,
    volume_24h: f64,
    liquidity: f64,
    ai_confidence: f64,
    win_streak: i32,
) -> (f64, Vec<String>) {
    let mut target = TARGET_MIN_PCT;
    let mut reasons = Vec::new();

    let rvol_pts = ((rvol - 1.0).max(0.0) * 2.5).min(10.0);
    if rvol_pts > 0.0 {
        target += rvol_pts;
        reasons.push(format!("rvol {rvol:.2} → +{rvol_pts:.1}"));
    }

    let momentum_pts = (price_change_24h_pct.max(0.0) / 5.0).min(8.0);
    if momentum_pts > 0.0 {
        target += momentum_pts;
        reasons.push(format!("momentum {price_change_24h_pct:+.1}% → +{momentum_pts:.1}"));
    }

    let volume_pts = (volume_24h / 100_000.0).min(3.0);
    if volume_pts > 0.0 {
        target += volume_pts;
        reasons.push(format!("volume ${volume_24h:.0} → +{volume_pts:.1}"));
    }

    let confidence_pts = (ai_confidence.clamp(0.0, 1.0)) * 5.0;
    if confidence_pts > 0.0 {
        target += confidence_pts;
        reasons.push(format!("AI confidence {ai_confidence:.2} → +{confidence_pts:.1}"));
    }

    let liq_penalty = if liquidity < 50_000.0 {
        3.0
    } else if liquidity < 100_000.0 {
        1.5
    } else {
        0.0
    };
    if liq_penalty > 0.0 {
        target -= liq_penalty;
        reasons.push(format!("thin liquidity ${liquidity:.0} → -{liq_penalty:.1}"));
    }

    let streak_pts = (win_streak as f64).clamp(-3.0, 3.0);
    if streak_pts != 0.0 {
        target += streak_pts;
        reasons.push(format!("streak {win_streak} → {streak_pts:+.1}"));
    }

    (target.clamp(TARGET_MIN_PCT, TARGET_MAX_PCT), reasons)
}

/// First balanced `{...}` substring of `text`, parsed as JSON. String
/// escapes are honoured so braces inside quoted values do not miscount.
pub fn extract_first_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxCounts;

    fn candidate(liquidity: f64, volume: f64) -> TokenCandidate {
        TokenCandidate {
            address: "Mint111".to_string(),
            dex_id: "raydium".to_string(),
            liquidity_usd: liquidity,
            volume_24h_usd: volume,
            volume_1h_usd: volume / 20.0,
            price_usd: 0.01,
            price_change_24h_pct: 12.0,
            tx_counts: TxCounts::default(),
            rug_score: Some(50.0),
        }
    }

    fn signal(confidence: f64) -> Signal {
        Signal::buy(confidence, "test", "FAST_PUMP")
    }

    #[test]
    fn extracts_json_from_prose() {
        let text = "Sure! Here's my analysis: {\"enter\": true, \"confidence\": 0.8, \
                    \"risk_level\": \"low\", \"reason\": \"strong {setup}\"} hope it helps";
        let v = extract_first_json(text).unwrap();
        assert_eq!(v["enter"], true);
        assert!((v["confidence"].as_f64().unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(v["reason"], "strong {setup}");
    }

    #[test]
    fn extract_handles_nested_and_missing() {
        let nested = "{\"a\": {\"b\": 1}}";
        assert!(extract_first_json(nested).is_some());
        assert!(extract_first_json("no json here").is_none());
        assert!(extract_first_json("{broken").is_none());
    }

    #[tokio::test]
    async fn degradation_ladder() {
        let llm = LlmValidator::new("http://127.0.0.1:1", None, "test-model");
        let metrics = MarketMetrics::default();

        // Strong signal + deep market → approved, reduced confidence.
        let d = llm
            .validate_entry(&candidate(150_000.0, 80_000.0), &metrics, &signal(0.7), None)
            .await;
        assert!(d.approved);
        assert!(d.degraded);
        assert!((d.confidence - 0.56).abs() < 1e-9);

        // Adequate signal, decent liquidity, thin volume → cautious approval.
        let d = llm
            .validate_entry(&candidate(120_000.0, 30_000.0), &metrics, &signal(0.58), None)
            .await;
        assert!(d.approved);
        assert_eq!(d.risk_level, "high");

        // Weak signal → rejected.
        let d = llm
            .validate_entry(&candidate(150_000.0, 80_000.0), &metrics, &signal(0.5), None)
            .await;
        assert!(!d.approved);

        // Strong signal but shallow market → rejected.
        let d = llm
            .validate_entry(&candidate(50_000.0, 80_000.0), &metrics, &signal(0.9), None)
            .await;
        assert!(!d.approved);
    }

    #[test]
    fn profit_target_bounds() {
        // Everything maxed: 3 + 10 + 8 + 3 + 5 + 3 = 32, inside the cap.
        let (target, reasons) = dynamic_profit_target(100.0, 10.0, 500_000.0, 200_000.0, 1.0, 5);
        assert!((target - 32.0).abs() < 1e-9);
        assert!(reasons.len() >= 5);

        // Nothing scores: floor at 3.
        let (target, _) = dynamic_profit_target(-10.0, 0.5, 0.0, 200_000.0, 0.0, 0);
        assert!((target - TARGET_MIN_PCT).abs() < 1e-9);

        // Thin liquidity cannot drag below the floor.
        let (target, _) = dynamic_profit_target(0.0, 1.0, 0.0, 10_000.0, 0.0, -3);
        assert!((target - TARGET_MIN_PCT).abs() < 1e-9);
    }

    #[test]
    fn profit_target_example() {
        // rvol 2.5 → +3.75; +18% day → +3.6; $150k vol → +1.5; conf 0.7 → +3.5.
        let (target, _) = dynamic_profit_target(18.0, 2.5, 150_000.0, 200_000.0, 0.7, 0);
        assert!((target - (3.0 + 3.75 + 3.6 + 1.5 + 3.5)).abs() < 1e-9);
    }
}
