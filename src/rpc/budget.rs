// =============================================================================
// RPC Budget Governor — daily call budget with rollover bank
// =============================================================================
//
// Every RPC caller asks `may_call(method)` before issuing a request and
// `record(method)` immediately after. The day's unused calls roll into a
// capped bank at the UTC day boundary, so a quiet day buys headroom for a
// busy one.
//
// Persistence is a small JSON file written atomically (tmp + rename). The
// file is rewritten every PERSIST_EVERY records and on explicit `persist()`
// at shutdown, so a crash loses at most a sliver of the used counter.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{BotError, BotResult};

/// Ceiling on the rollover bank.
pub const MAX_BANK: u64 = 5_000_000;

/// Fraction of the total budget at which a single warning is emitted.
const WARN_FRACTION: f64 = 0.8;

/// Persist the state file every this many recorded calls.
const PERSIST_EVERY: u64 = 100;

/// Persisted budget state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    /// UTC calendar date this state belongs to ("%Y-%m-%d").
    pub date: String,
    #[serde(default)]
    pub calls_used: u64,
    #[serde(default)]
    pub per_method: HashMap<String, u64>,
    #[serde(default)]
    pub rollover_bank: u64,
}

impl BudgetState {
    fn fresh(date: String) -> Self {
        Self {
            date,
            calls_used: 0,
            per_method: HashMap::new(),
            rollover_bank: 0,
        }
    }
}

struct Inner {
    state: BudgetState,
    warned_today: bool,
    records_since_persist: u64,
}

/// Per-process governor for the daily RPC call budget.
pub struct BudgetGovernor {
    inner: RwLock<Inner>,
    base: u64,
    path: PathBuf,
}

impl BudgetGovernor {
    /// Load persisted state from `path` (or start fresh) with the given base
    /// daily budget.
    pub fn load(path: impl Into<PathBuf>, base: u64) -> Self {
        let path = path.into();
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BudgetState>(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "budget state unparsable — starting fresh");
                    BudgetState::fresh(today.clone())
                }
            },
            Err(_) => BudgetState::fresh(today.clone()),
        };

        let governor = Self {
            inner: RwLock::new(Inner {
                state,
                warned_today: false,
                records_since_persist: 0,
            }),
            base,
            path,
        };
        governor.roll_if_needed();

        let snap = governor.snapshot();
        info!(
            date = %snap.date,
            calls_used = snap.calls_used,
            rollover_bank = snap.rollover_bank,
            total_budget = governor.total_budget(),
            "RPC budget governor initialised"
        );
        governor
    }

    /// `base + rollover_bank` for the current day.
    pub fn total_budget(&self) -> u64 {
        self.base + self.inner.read().state.rollover_bank
    }

    /// Admission predicate. Returns `false` when the day's budget is spent.
    /// Emits a single warning per day once usage crosses 80 %.
    pub fn may_call(&self, method: &str) -> bool {
        self.roll_if_needed();

        let mut inner = self.inner.write();
        let total = self.base + inner.state.rollover_bank;
        let used = inner.state.calls_used;

        if !inner.warned_today && (used as f64) >= WARN_FRACTION * (total as f64) {
            inner.warned_today = true;
            warn!(
                used,
                total,
                "RPC budget above 80% — dependent components will start serving stale data soon"
            );
        }

        let allowed = used < total;
        if !allowed {
            debug!(method, used, total, "RPC call declined — budget exhausted");
        }
        allowed
    }

    /// Record a completed call against the budget.
    pub fn record(&self, method: &str) {
        self.roll_if_needed();

        let should_persist = {
            let mut inner = self.inner.write();
            inner.state.calls_used += 1;
            *inner.state.per_method.entry(method.to_string()).or_insert(0) += 1;
            inner.records_since_persist += 1;
            if inner.records_since_persist >= PERSIST_EVERY {
                inner.records_since_persist = 0;
                true
            } else {
                false
            }
        };

        if should_persist {
            if let Err(e) = self.persist() {
                warn!(error = %e, "failed to persist budget state");
            }
        }
    }

    /// Error carrying the current usage, for callers that must fail instead
    /// of serving stale data.
    pub fn exhausted_error(&self) -> BotError {
        let inner = self.inner.read();
        BotError::BudgetExhausted {
            used: inner.state.calls_used,
            total: self.base + inner.state.rollover_bank,
        }
    }

    /// Startup gate: a process that boots with an exhausted budget exits
    /// non-zero rather than limping along on stale data all day.
    pub fn ensure_available_at_startup(&self) -> BotResult<()> {
        if self.may_call("startup-probe") {
            Ok(())
        } else {
            Err(self.exhausted_error())
        }
    }

    /// Copy of the current persisted state.
    pub fn snapshot(&self) -> BudgetState {
        self.inner.read().state.clone()
    }

    /// Write the state file atomically.
    pub fn persist(&self) -> Result<()> {
        let state = self.inner.read().state.clone();
        let content =
            serde_json::to_string_pretty(&state).context("failed to serialise budget state")?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename {}", self.path.display()))?;

        debug!(path = %self.path.display(), "budget state persisted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Day boundary
    // -------------------------------------------------------------------------

    /// Roll the day if the UTC date has changed: unused calls join the bank
    /// (capped at MAX_BANK) and the counters reset.
    fn roll_if_needed(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let inner = self.inner.read();
            if inner.state.date == today {
                return;
            }
        }

        let mut inner = self.inner.write();
        // Double-check after acquiring the write lock.
        if inner.state.date == today {
            return;
        }

        let yesterday_total = self.base + inner.state.rollover_bank;
        let unused = yesterday_total.saturating_sub(inner.state.calls_used);
        let new_bank = (inner.state.rollover_bank + unused).min(MAX_BANK);

        info!(
            old_date = %inner.state.date,
            new_date = %today,
            unused,
            rollover_bank = new_bank,
            total_budget = self.base + new_bank,
            "UTC day rolled — RPC budget reset"
        );

        inner.state = BudgetState {
            date: today,
            calls_used: 0,
            per_method: HashMap::new(),
            rollover_bank: new_bank,
        };
        inner.warned_today = false;
        drop(inner);

        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist budget state after day roll");
        }
    }

    #[cfg(test)]
    fn force_state(&self, state: BudgetState) {
        self.inner.write().state = state;
    }
}

impl std::fmt::Debug for BudgetGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("BudgetGovernor")
            .field("date", &inner.state.date)
            .field("calls_used", &inner.state.calls_used)
            .field("rollover_bank", &inner.state.rollover_bank)
            .field("base", &self.base)
            .finish()
    }
}
