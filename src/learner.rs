// =============================================================================
// Adaptive Learner — Q-learning over discretised market states
// =============================================================================
//
// Every closed trade updates:
//   - per-pattern EMA win rate (α = 0.3) and EMA profit
//   - per-pattern Q:          Q += 0.1 · (r − Q),  r = clamp((pct+50)/100, 0, 1)
//   - per-(state,pattern) Q:  same rule with r = pct/100
//   - per-pattern regret:     Σ max(0, max_Q − Q)   (monotone non-decreasing)
//   - risk aggregates: extended-entry, large-position, and doubling win rates
//   - exploration rate: ε ← max(0.05, ε · 0.995) from a base of 0.15
//
// Pattern selection uses UCB1 with untried patterns scoring +∞. History
// older than 14 days is evicted. State persists to JSON atomically.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{MarketState, Regime};

const PATTERN_EMA_ALPHA: f64 = 0.3;
const Q_ALPHA: f64 = 0.1;
const EXPLORATION_BASE: f64 = 0.15;
const EXPLORATION_FLOOR: f64 = 0.05;
const EXPLORATION_DECAY: f64 = 0.995;
const HISTORY_RETENTION_DAYS: i64 = 14;
/// Entries at or above this share of capital count as "large".
const LARGE_POSITION_PCT: f64 = 20.0;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Immutable record of one closed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub mint: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub profit_pct: f64,
    pub hold_minutes: f64,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub rvol: f64,
    #[serde(default)]
    pub pattern: Option<String>,
    pub regime: Regime,
    #[serde(default)]
    pub ai_confidence: f64,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub position_size_pct: f64,
    #[serde(default)]
    pub max_drawdown_pct: f64,
    #[serde(default)]
    pub entered_extended: bool,
    #[serde(default)]
    pub doublings: u32,
    pub closed_at: String,
}

/// Per-pattern aggregates. Invariant: `wins + losses = total`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternStats {
    pub q_value: f64,
    pub ema_win_rate: f64,
    pub ema_profit: f64,
    pub wins: u64,
    pub losses: u64,
    pub total: u64,
    pub regret: f64,
    pub confidence: f64,
    #[serde(default)]
    pub last_seen: String,
}

impl PatternStats {
    pub fn win_rate(&self) -> f64 {
        if self.total > 0 {
            self.wins as f64 / self.total as f64
        } else {
            0.0
        }
    }
}

/// One `(state, pattern)` cell of the Q-table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateActionValue {
    pub q_value: f64,
    pub visits: u64,
    pub ema_reward: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RiskAggregates {
    extended_wins: u64,
    extended_total: u64,
    large_wins: u64,
    large_total: u64,
    doubling_wins: u64,
    doubling_total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HourStats {
    wins: u64,
    total: u64,
}

fn default_exploration() -> f64 {
    EXPLORATION_BASE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LearnerState {
    #[serde(default = "default_exploration")]
    exploration_rate: f64,
    #[serde(default)]
    patterns: HashMap<String, PatternStats>,
    /// Keyed "`state_key`|`pattern`".
    #[serde(default)]
    q_table: HashMap<String, StateActionValue>,
    #[serde(default)]
    trade_history: Vec<TradeOutcome>,
    #[serde(default)]
    risk: RiskAggregates,
    #[serde(default)]
    hourly: HashMap<u8, HourStats>,
}

impl Default for LearnerState {
    fn default() -> Self {
        Self {
            exploration_rate: EXPLORATION_BASE,
            patterns: HashMap::new(),
            q_table: HashMap::new(),
            trade_history: Vec::new(),
            risk: RiskAggregates::default(),
            hourly: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Learner
// ---------------------------------------------------------------------------

/// Reinforcement-learning feedback loop over closed trades.
pub struct AdaptiveLearner {
    state: RwLock<LearnerState>,
    path: PathBuf,
}

impl AdaptiveLearner {
    /// Load persisted state (missing/unreadable file starts fresh).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "learner state unparsable — starting fresh");
                LearnerState::default()
            }),
            Err(_) => LearnerState::default(),
        };

        info!(
            path = %path.display(),
            patterns = state.patterns.len(),
            history = state.trade_history.len(),
            exploration = state.exploration_rate,
            "adaptive learner initialised"
        );

        Self {
            state: RwLock::new(state),
            path,
        }
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Fold one closed trade into every table.
    pub fn record_trade(&self, outcome: &TradeOutcome) {
        let mut state = self.state.write();
        let won = outcome.profit_pct > 0.0;

        // ── Pattern stats ────────────────────────────────────────────────
        if let Some(pattern) = &outcome.pattern {
            let stats = state.patterns.entry(pattern.clone()).or_default();

            stats.total += 1;
            if won {
                stats.wins += 1;
            } else {
                stats.losses += 1;
            }

            let win_sample = if won { 1.0 } else { 0.0 };
            if stats.total == 1 {
                stats.ema_win_rate = win_sample;
                stats.ema_profit = outcome.profit_pct;
            } else {
                stats.ema_win_rate =
                    PATTERN_EMA_ALPHA * win_sample + (1.0 - PATTERN_EMA_ALPHA) * stats.ema_win_rate;
                stats.ema_profit = PATTERN_EMA_ALPHA * outcome.profit_pct
                    + (1.0 - PATTERN_EMA_ALPHA) * stats.ema_profit;
            }

            let reward = ((outcome.profit_pct + 50.0) / 100.0).clamp(0.0, 1.0);
            stats.q_value = (stats.q_value + Q_ALPHA * (reward - stats.q_value)).clamp(-1.0, 1.0);

            stats.confidence = (stats.total as f64 / 20.0).min(1.0) * stats.ema_win_rate;
            stats.last_seen = outcome.closed_at.clone();

            // ── State-action Q ───────────────────────────────────────────
            let state_key = MarketState {
                regime: outcome.regime,
                rvol_bucket: crate::types::RvolBucket::from_rvol(outcome.rvol),
                liq_bucket: crate::types::LiqBucket::from_liquidity(outcome.liquidity),
            }
            .key();
            let cell = state
                .q_table
                .entry(format!("{state_key}|{pattern}"))
                .or_default();
            let sa_reward = outcome.profit_pct / 100.0;
            cell.q_value += Q_ALPHA * (sa_reward - cell.q_value);
            cell.visits += 1;
            cell.ema_reward = if cell.visits == 1 {
                sa_reward
            } else {
                PATTERN_EMA_ALPHA * sa_reward + (1.0 - PATTERN_EMA_ALPHA) * cell.ema_reward
            };

            // ── Regret for the chosen pattern ────────────────────────────
            let max_q = state
                .patterns
                .values()
                .map(|s| s.q_value)
                .fold(f64::MIN, f64::max);
            let chosen_q = state.patterns[pattern].q_value;
            let regret_increment = (max_q - chosen_q).max(0.0);
            state
                .patterns
                .get_mut(pattern)
                .expect("pattern just inserted")
                .regret += regret_increment;
        }

        // ── Risk aggregates ──────────────────────────────────────────────
        if outcome.entered_extended {
            state.risk.extended_total += 1;
            if won {
                state.risk.extended_wins += 1;
            }
        }
        if outcome.position_size_pct >= LARGE_POSITION_PCT {
            state.risk.large_total += 1;
            if won {
                state.risk.large_wins += 1;
            }
        }
        if outcome.doublings > 0 {
            state.risk.doubling_total += 1;
            if won {
                state.risk.doubling_wins += 1;
            }
        }

        // ── Hour-of-day stats ────────────────────────────────────────────
        if let Ok(t) = chrono::DateTime::parse_from_rfc3339(&outcome.closed_at) {
            let hour = t.with_timezone(&Utc).hour() as u8;
            let slot = state.hourly.entry(hour).or_default();
            slot.total += 1;
            if won {
                slot.wins += 1;
            }
        }

        // ── Exploration decay, history, eviction ─────────────────────────
        state.exploration_rate =
            (state.exploration_rate * EXPLORATION_DECAY).max(EXPLORATION_FLOOR);
        state.trade_history.push(outcome.clone());
        Self::evict_old(&mut state);

        debug!(
            mint = %outcome.mint,
            profit_pct = outcome.profit_pct,
            pattern = ?outcome.pattern,
            exploration = state.exploration_rate,
            "trade outcome recorded"
        );
        drop(state);

        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist learner state");
        }
    }

    fn evict_old(state: &mut LearnerState) {
        let cutoff = Utc::now() - chrono::Duration::days(HISTORY_RETENTION_DAYS);
        state.trade_history.retain(|t| {
            chrono::DateTime::parse_from_rfc3339(&t.closed_at)
                .map(|ts| ts.with_timezone(&Utc) > cutoff)
                .unwrap_or(false)
        });
    }

    // -------------------------------------------------------------------------
    // Selection — UCB1
    // -------------------------------------------------------------------------

    /// UCB1 score: `Q(p) + 2·√(ln N / n(p))`, `+∞` for a never-tried pattern.
    pub fn ucb_score(&self, pattern: &str) -> f64 {
        let state = self.state.read();
        let trials: u64 = state.patterns.values().map(|s| s.total).sum();
        match state.patterns.get(pattern) {
            Some(stats) if stats.total > 0 => {
                let exploration =
                    2.0 * ((trials.max(1) as f64).ln() / stats.total as f64).sqrt();
                stats.q_value + exploration
            }
            _ => f64::INFINITY,
        }
    }

    /// Pick the highest-UCB pattern out of `candidates`.
    pub fn select_pattern(&self, candidates: &[&str]) -> Option<String> {
        candidates
            .iter()
            .max_by(|a, b| {
                self.ucb_score(a)
                    .partial_cmp(&self.ucb_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|s| s.to_string())
    }

    /// Current exploration rate (ε-greedy callers roll against this).
    pub fn exploration_rate(&self) -> f64 {
        self.state.read().exploration_rate
    }

    // -------------------------------------------------------------------------
    // Confidence adjustment
    // -------------------------------------------------------------------------

    /// Adjust a base confidence using everything learned so far. Returns the
    /// adjusted value and the applied reasons.
    pub fn adjust_confidence(
        &self,
        base: f64,
        pattern: Option<&str>,
        market_state: &MarketState,
    ) -> (f64, Vec<String>) {
        let state = self.state.read();
        let mut adjusted = base;
        let mut reasons = Vec::new();

        if let Some(pattern) = pattern {
            // Q-based adjustment, clamped to ±0.3.
            if let Some(stats) = state.patterns.get(pattern) {
                if stats.total > 0 {
                    let q_adj = (stats.q_value * 0.5).clamp(-0.3, 0.3);
                    if q_adj.abs() > 1e-9 {
                        adjusted += q_adj;
                        reasons.push(format!("pattern Q {:.2} → {q_adj:+.2}", stats.q_value));
                    }
                }
            }

            // Condition adjustment from the state-action cell, clamped ±0.15.
            let key = format!("{}|{pattern}", market_state.key());
            if let Some(cell) = state.q_table.get(&key) {
                if cell.visits > 0 {
                    let cond_adj = (cell.q_value * 0.5).clamp(-0.15, 0.15);
                    if cond_adj.abs() > 1e-9 {
                        adjusted += cond_adj;
                        reasons.push(format!(
                            "state {} Q {:.2} → {cond_adj:+.2}",
                            market_state.key(),
                            cell.q_value
                        ));
                    }
                }
            }
        }

        // Time-of-day boost: ±0.08 when the current hour has a learned edge.
        let hour = Utc::now().hour() as u8;
        if let Some(slot) = state.hourly.get(&hour) {
            if slot.total >= 3 {
                let rate = slot.wins as f64 / slot.total as f64;
                if rate > 0.6 {
                    adjusted += 0.08;
                    reasons.push(format!("preferred hour {hour} (win rate {rate:.2}) → +0.08"));
                } else if rate < 0.4 {
                    adjusted -= 0.08;
                    reasons.push(format!("weak hour {hour} (win rate {rate:.2}) → -0.08"));
                }
            }
        }

        // Risk appetite from the trailing 24 h, clamped to ±0.2 by the rule.
        if let Some(rate) = Self::win_rate_24h(&state) {
            if rate >= 0.7 {
                adjusted += 0.15;
                reasons.push(format!("hot 24h win rate {rate:.2} → +0.15"));
            } else if rate < 0.3 {
                adjusted -= 0.2;
                reasons.push(format!("cold 24h win rate {rate:.2} → -0.20"));
            }
        }

        (adjusted.clamp(0.0, 1.0), reasons)
    }

    fn win_rate_24h(state: &LearnerState) -> Option<f64> {
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let recent: Vec<&TradeOutcome> = state
            .trade_history
            .iter()
            .filter(|t| {
                chrono::DateTime::parse_from_rfc3339(&t.closed_at)
                    .map(|ts| ts.with_timezone(&Utc) > cutoff)
                    .unwrap_or(false)
            })
            .collect();
        if recent.is_empty() {
            return None;
        }
        let wins = recent.iter().filter(|t| t.profit_pct > 0.0).count();
        Some(wins as f64 / recent.len() as f64)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// EMA profit for a pattern (drives the "90 % of learned average" exit).
    pub fn average_profit(&self, pattern: &str) -> Option<f64> {
        let state = self.state.read();
        state
            .patterns
            .get(pattern)
            .filter(|s| s.total >= 3)
            .map(|s| s.ema_profit)
    }

    /// Copy of a pattern's stats.
    pub fn pattern_stats(&self, pattern: &str) -> Option<PatternStats> {
        self.state.read().patterns.get(pattern).cloned()
    }

    /// (pattern count, trades retained, exploration rate) for status reports.
    pub fn summary(&self) -> (usize, usize, f64) {
        let state = self.state.read();
        (
            state.patterns.len(),
            state.trade_history.len(),
            state.exploration_rate,
        )
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn persist(&self) -> Result<()> {
        let state = self.state.read().clone();
        let content =
            serde_json::to_string_pretty(&state).context("failed to serialise learner state")?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename {}", self.path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for AdaptiveLearner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (patterns, history, exploration) = self.summary();
        f.debug_struct("AdaptiveLearner")
            .field("patterns", &patterns)
            .field("history", &history)
            .field("exploration_rate", &exploration)
            .finish()
    }
}
