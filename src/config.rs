// =============================================================================
// Configuration & Key Store — settings file, secrets, signing-key decoding
// =============================================================================
//
// Non-sensitive settings load from an optional JSON file with serde defaults
// (every field has one, so old files keep loading after new fields appear)
// and may be overridden per-run by CLI flags.
//
// SECURITY: sensitive values (wallet key, API tokens) never live in Settings.
// They are pulled from the process environment (populated by dotenv) into a
// dedicated SecretStore, optionally overridden from a keyring file, accessed
// only via `get_sensitive(name, calling_context)`, and scrubbed on shutdown.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use solana_sdk::signer::keypair::{keypair_from_seed, Keypair};
use tracing::{debug, info, warn};

use crate::errors::{BotError, BotResult};

/// Environment keys treated as sensitive and held in the SecretStore.
const SENSITIVE_KEYS: &[&str] = &[
    "WALLET_PRIVATE_KEY",
    "LLM_API_KEY",
    "TELEGRAM_BOT_TOKEN",
    "HISTORY_API_KEY",
];

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_rpc_url() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}

fn default_rpc_ws_url() -> String {
    "wss://api.mainnet-beta.solana.com".to_string()
}

fn default_aggregator_url() -> String {
    "https://quote-api.jup.ag".to_string()
}

fn default_pair_api_url() -> String {
    "https://api.dexscreener.com".to_string()
}

fn default_rug_api_url() -> String {
    "https://api.rugcheck.xyz/v1".to_string()
}

fn default_llm_api_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_history_api_url() -> String {
    "https://public-api.birdeye.so".to_string()
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_amount_sol() -> f64 {
    0.05
}

fn default_min_trade_sol() -> f64 {
    0.01
}

fn default_max_trade_sol() -> f64 {
    0.5
}

fn default_slippage_bps() -> u32 {
    250
}

fn default_max_impact_pct() -> f64 {
    5.0
}

fn default_max_tx_per_min() -> u32 {
    5
}

fn default_min_balance_sol() -> f64 {
    0.05
}

fn default_min_profit_pct() -> f64 {
    1.0
}

fn default_min_liquidity_usd() -> f64 {
    20_000.0
}

fn default_min_volume_24h_usd() -> f64 {
    50_000.0
}

fn default_max_change_24h_pct() -> f64 {
    500.0
}

fn default_min_rvol() -> f64 {
    1.5
}

fn default_max_rug_score() -> f64 {
    600.0
}

fn default_dex_whitelist() -> Vec<String> {
    vec![
        "raydium".to_string(),
        "orca".to_string(),
        "meteora".to_string(),
    ]
}

fn default_strategy_mode() -> String {
    "ensemble".to_string()
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_min_hold_confidence() -> f64 {
    0.8
}

fn default_tp_min_pct() -> f64 {
    2.0
}

fn default_tp_interval_ms() -> u64 {
    60_000
}

fn default_sl_pct() -> f64 {
    15.0
}

fn default_sl_interval_ms() -> u64 {
    45_000
}

fn default_scan_interval_secs() -> u64 {
    30
}

fn default_status_interval_mins() -> u64 {
    30
}

fn default_seen_ttl_mins() -> u64 {
    15
}

fn default_max_position_pct() -> f64 {
    30.0
}

fn default_max_doublings() -> u32 {
    3
}

fn default_rpc_budget_base() -> u64 {
    2_500_000
}

fn default_max_retries() -> u32 {
    3
}

// =============================================================================
// Settings
// =============================================================================

/// Non-sensitive engine settings. Loaded from `settings.json` when present,
/// otherwise defaults; CLI flags overlay individual fields afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Endpoints -----------------------------------------------------------
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_rpc_ws_url")]
    pub rpc_ws_url: String,
    #[serde(default = "default_aggregator_url")]
    pub aggregator_url: String,
    #[serde(default = "default_pair_api_url")]
    pub pair_api_url: String,
    #[serde(default = "default_rug_api_url")]
    pub rug_api_url: String,
    #[serde(default = "default_llm_api_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_history_api_url")]
    pub history_api_url: String,

    /// Directory for persisted JSON state (budget, entry prices, learner).
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    // --- Execution -----------------------------------------------------------
    /// SAFETY: dry-run is the default; live trading requires --live.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_amount_sol")]
    pub amount_sol: f64,
    #[serde(default = "default_min_trade_sol")]
    pub min_trade_sol: f64,
    #[serde(default = "default_max_trade_sol")]
    pub max_trade_sol: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    #[serde(default = "default_max_impact_pct")]
    pub max_impact_pct: f64,
    #[serde(default = "default_max_tx_per_min")]
    pub max_tx_per_min: u32,
    #[serde(default = "default_min_balance_sol")]
    pub min_balance_sol: f64,
    #[serde(default = "default_min_profit_pct")]
    pub min_profit_threshold_pct: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub multi_input: bool,
    #[serde(default)]
    pub roundtrip: bool,

    // --- Discovery gate ------------------------------------------------------
    #[serde(default = "default_min_liquidity_usd")]
    pub min_liquidity_usd: f64,
    #[serde(default = "default_min_volume_24h_usd")]
    pub min_volume_24h_usd: f64,
    #[serde(default = "default_max_change_24h_pct")]
    pub max_change_24h_pct: f64,
    #[serde(default = "default_min_rvol")]
    pub min_rvol: f64,
    #[serde(default = "default_max_rug_score")]
    pub max_rug_score: f64,
    #[serde(default = "default_dex_whitelist")]
    pub dex_whitelist: Vec<String>,
    /// Mints that bypass validation entirely.
    #[serde(default)]
    pub whitelist_mints: Vec<String>,
    #[serde(default)]
    pub skip_validate: bool,

    // --- Strategy ------------------------------------------------------------
    #[serde(default = "default_true")]
    pub use_strategies: bool,
    /// Combiner policy: "ensemble", "consensus", "best", "conservative".
    #[serde(default = "default_strategy_mode")]
    pub strategy_mode: String,
    #[serde(default = "default_min_confidence")]
    pub min_confidence_threshold: f64,
    #[serde(default)]
    pub allow_hold_buys: bool,
    #[serde(default = "default_min_hold_confidence")]
    pub min_hold_confidence: f64,

    // --- Position management -------------------------------------------------
    #[serde(default = "default_true")]
    pub auto_tp: bool,
    #[serde(default = "default_tp_min_pct")]
    pub tp_min_pct: f64,
    #[serde(default = "default_tp_interval_ms")]
    pub tp_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_sl: bool,
    #[serde(default = "default_sl_pct")]
    pub sl_pct: f64,
    #[serde(default = "default_sl_interval_ms")]
    pub sl_interval_ms: u64,
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    #[serde(default = "default_max_doublings")]
    pub max_doublings: u32,

    // --- Orchestration -------------------------------------------------------
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_status_interval_mins")]
    pub status_interval_mins: u64,
    #[serde(default = "default_seen_ttl_mins")]
    pub seen_ttl_mins: u64,
    #[serde(default = "default_rpc_budget_base")]
    pub rpc_budget_base: u64,
    /// Stop once total balance reaches `baseline * target_mult`.
    #[serde(default)]
    pub target_mult: Option<f64>,
    /// Run for N hours then shut down.
    #[serde(default)]
    pub run_hours: Option<f64>,
    /// Run one scan cycle then exit.
    #[serde(default)]
    pub once: bool,
    /// Evaluate a single forced mint instead of discovery output.
    #[serde(default)]
    pub forced_token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty settings deserialise from defaults")
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no settings file — using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(
            path = %path.display(),
            dry_run = settings.dry_run,
            strategy_mode = %settings.strategy_mode,
            "settings loaded"
        );
        Ok(settings)
    }

    /// Path of a persisted state file under the state directory.
    pub fn state_path(&self, file: &str) -> std::path::PathBuf {
        Path::new(&self.state_dir).join(file)
    }
}

// =============================================================================
// Secret store
// =============================================================================

/// In-memory store for sensitive values. Populated once at startup, read via
/// `get_sensitive`, and scrubbed before the process exits.
pub struct SecretStore {
    values: RwLock<HashMap<String, String>>,
}

impl SecretStore {
    /// Build the store from the process environment, then opportunistically
    /// overlay values from the keyring file named by `BOT_KEYRING_FILE`
    /// (a JSON string map). Keyring failures are logged and ignored.
    pub fn from_env() -> Self {
        let mut values = HashMap::new();
        for key in SENSITIVE_KEYS {
            if let Ok(val) = std::env::var(key) {
                if !val.is_empty() {
                    values.insert(key.to_string(), val);
                }
            }
        }

        if let Ok(keyring_path) = std::env::var("BOT_KEYRING_FILE") {
            match std::fs::read_to_string(&keyring_path) {
                Ok(content) => match serde_json::from_str::<HashMap<String, String>>(&content) {
                    Ok(overrides) => {
                        for key in SENSITIVE_KEYS {
                            if let Some(val) = overrides.get(*key) {
                                values.insert(key.to_string(), val.clone());
                                debug!(key, "sensitive value overridden from keyring");
                            }
                        }
                    }
                    Err(e) => warn!(path = %keyring_path, error = %e, "keyring file unparsable — ignored"),
                },
                Err(e) => warn!(path = %keyring_path, error = %e, "keyring file unreadable — ignored"),
            }
        }

        info!(count = values.len(), "secret store initialised");
        Self {
            values: RwLock::new(values),
        }
    }

    /// Fetch a sensitive value. Every access is logged with the calling
    /// context; the value itself never reaches a log line.
    pub fn get_sensitive(&self, name: &str, calling_context: &str) -> Option<String> {
        let guard = self.values.read();
        let found = guard.get(name).cloned();
        debug!(
            name,
            calling_context,
            present = found.is_some(),
            "sensitive value accessed"
        );
        found
    }

    /// Overwrite and drop every stored secret. Called on shutdown and from
    /// the panic/signal paths.
    pub fn scrub(&self) {
        let mut guard = self.values.write();
        for (_, value) in guard.iter_mut() {
            // Overwrite the buffer before freeing so the plaintext does not
            // linger in the allocation.
            let len = value.len();
            value.clear();
            value.push_str(&"\0".repeat(len));
        }
        guard.clear();
        info!("secret store scrubbed");
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("keys", &self.values.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Signing-key decoding
// =============================================================================

/// Decode signing-key material from any supported text format.
///
/// Attempts, in fixed order: base-58, base-64, JSON numeric array,
/// comma-separated decimal bytes. The first decode yielding a 32-byte seed
/// or a 64-byte expanded secret wins.
pub fn decode_signing_key(raw: &str) -> BotResult<Vec<u8>> {
    let raw = raw.trim();

    if let Ok(bytes) = bs58::decode(raw).into_vec() {
        if bytes.len() == 32 || bytes.len() == 64 {
            return Ok(bytes);
        }
    }

    {
        use base64::Engine as _;
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw) {
            if bytes.len() == 32 || bytes.len() == 64 {
                return Ok(bytes);
            }
        }
    }

    if raw.starts_with('[') {
        if let Ok(bytes) = serde_json::from_str::<Vec<u8>>(raw) {
            if bytes.len() == 32 || bytes.len() == 64 {
                return Ok(bytes);
            }
        }
    }

    if raw.contains(',') {
        let parsed: Result<Vec<u8>, _> = raw.split(',').map(|s| s.trim().parse::<u8>()).collect();
        if let Ok(bytes) = parsed {
            if bytes.len() == 32 || bytes.len() == 64 {
                return Ok(bytes);
            }
        }
    }

    Err(BotError::Config(
        "signing key is not a 32- or 64-byte buffer in base-58, base-64, JSON array, \
         or comma-separated decimal form"
            .to_string(),
    ))
}

/// Load the wallet keypair from the secret store.
///
/// A 64-byte buffer is the full expanded secret key; a 32-byte buffer is an
/// ed25519 seed and is expanded.
pub fn load_keypair(secrets: &SecretStore) -> BotResult<Keypair> {
    let raw = secrets
        .get_sensitive("WALLET_PRIVATE_KEY", "wallet-load")
        .ok_or_else(|| BotError::Config("WALLET_PRIVATE_KEY not set".to_string()))?;

    let bytes = decode_signing_key(&raw)?;
    match bytes.len() {
        64 => Keypair::from_bytes(&bytes)
            .map_err(|e| BotError::Config(format!("invalid 64-byte secret key: {e}"))),
        32 => keypair_from_seed(&bytes)
            .map_err(|e| BotError::Config(format!("invalid 32-byte seed: {e}"))),
        n => Err(BotError::Config(format!("decoded key has {n} bytes"))),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signer::Signer;

    #[test]
    fn settings_defaults_are_safe() {
        let s = Settings::default();
        assert!(s.dry_run, "dry-run must be the default");
        assert!((s.tp_min_pct - 2.0).abs() < f64::EPSILON);
        assert!((s.max_position_pct - 30.0).abs() < f64::EPSILON);
        assert_eq!(s.max_doublings, 3);
        assert_eq!(s.rpc_budget_base, 2_500_000);
        assert_eq!(s.seen_ttl_mins, 15);
    }

    #[test]
    fn settings_partial_json_fills_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{ "dry_run": false, "amount_sol": 0.1 }"#).unwrap();
        assert!(!s.dry_run);
        assert!((s.amount_sol - 0.1).abs() < f64::EPSILON);
        assert_eq!(s.slippage_bps, 250);
        assert_eq!(s.strategy_mode, "ensemble");
    }

    #[test]
    fn decode_base58_roundtrip() {
        let kp = Keypair::new();
        let encoded = bs58::encode(kp.to_bytes()).into_string();
        let decoded = decode_signing_key(&encoded).unwrap();
        assert_eq!(decoded, kp.to_bytes().to_vec());
    }

    #[test]
    fn decode_base64_roundtrip() {
        use base64::Engine as _;
        let kp = Keypair::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode(kp.to_bytes());
        let decoded = decode_signing_key(&encoded).unwrap();
        assert_eq!(decoded, kp.to_bytes().to_vec());
    }

    #[test]
    fn decode_json_array_roundtrip() {
        let kp = Keypair::new();
        let encoded = serde_json::to_string(&kp.to_bytes().to_vec()).unwrap();
        let decoded = decode_signing_key(&encoded).unwrap();
        assert_eq!(decoded, kp.to_bytes().to_vec());
    }

    #[test]
    fn decode_csv_roundtrip() {
        let kp = Keypair::new();
        let encoded = kp
            .to_bytes()
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let decoded = decode_signing_key(&encoded).unwrap();
        assert_eq!(decoded, kp.to_bytes().to_vec());
    }

    #[test]
    fn decode_32_byte_seed() {
        let seed = [7u8; 32];
        let encoded = bs58::encode(seed).into_string();
        let decoded = decode_signing_key(&encoded).unwrap();
        assert_eq!(decoded.len(), 32);
        // A seed must expand into a working keypair.
        let kp = keypair_from_seed(&decoded).unwrap();
        assert_ne!(kp.pubkey().to_string(), "");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_signing_key("not a key").is_err());
        assert!(decode_signing_key("1,2,3").is_err());
        assert!(decode_signing_key("[1,2,3]").is_err());
    }

    #[test]
    fn secret_store_scrub_empties() {
        std::env::set_var("LLM_API_KEY", "sk-test-123");
        let store = SecretStore::from_env();
        assert!(store.get_sensitive("LLM_API_KEY", "test").is_some());
        store.scrub();
        assert!(store.get_sensitive("LLM_API_KEY", "test").is_none());
        std::env::remove_var("LLM_API_KEY");
    }
}
