//! Usage ledger
//!
//! Persisted quota and health state: per-(key, target) rolling-minute and
//! daily usage counters, plus per-key failure history (strikes and
//! cooldown release time). One JSON document on disk, atomic writes, a
//! tokio Mutex serializing all access.
//!
//! Every mutation here is a read-modify-write executed inside the lock
//! and persisted before it returns. The pool never computes new counter
//! values itself: it asks the ledger to record an event and gets the
//! post-update row back, so two concurrent reporters cannot under-count
//! a window.
//!
//! Rolling-minute counters are only meaningful while `now - window_start`
//! is under a minute; daily counters only while `day_key` matches the
//! current UTC day. Readers treat stale counters as zero via the `*_at`
//! accessors; the stale row itself is reset lazily by the next write.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::escalation;
use crate::persist::write_atomic;

/// Length of the rolling request/token window, in milliseconds.
pub const WINDOW_MS: u64 = 60_000;

/// Usage counters for one key against one backend target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Start of the current rolling-minute window, unix millis.
    pub window_start: u64,
    pub requests_in_window: u32,
    pub tokens_in_window: u64,
    /// UTC day the daily counter belongs to, "YYYY-MM-DD".
    pub day_key: String,
    pub requests_today: u32,
}

impl UsageRecord {
    /// Whether the rolling-minute counters still apply at `now`.
    pub fn window_live(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) < WINDOW_MS
    }

    /// Requests in the current window; zero if the window expired.
    pub fn requests_at(&self, now: u64) -> u32 {
        if self.window_live(now) {
            self.requests_in_window
        } else {
            0
        }
    }

    /// Tokens in the current window; zero if the window expired.
    pub fn tokens_at(&self, now: u64) -> u64 {
        if self.window_live(now) {
            self.tokens_in_window
        } else {
            0
        }
    }

    /// Requests today; zero if the UTC day rolled over.
    pub fn requests_today_at(&self, now: u64) -> u32 {
        if self.day_key == day_key(now) {
            self.requests_today
        } else {
            0
        }
    }
}

/// Failure history for one key, shared across all targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyHealth {
    pub strikes: u32,
    /// Unix millis until which the key is held out of rotation.
    /// 0 = not on cooldown.
    pub release_at: u64,
}

/// The ledger document as persisted.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    /// key name → target id → usage counters
    usage: HashMap<String, HashMap<String, UsageRecord>>,
    /// key name → failure history
    health: HashMap<String, KeyHealth>,
}

/// Thread-safe usage ledger file manager.
pub struct UsageLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl UsageLedger {
    /// Load the ledger from the given file path, creating it empty if
    /// missing.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading usage ledger: {e}")))?;
            let state: LedgerState = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing usage ledger: {e}")))?;
            info!(
                path = %path.display(),
                keys = state.health.len(),
                "loaded usage ledger"
            );
            state
        } else {
            info!(path = %path.display(), "usage ledger not found, starting empty");
            let state = LedgerState::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Usage row for (key, target), if one exists yet.
    pub async fn usage(&self, key: &str, target: &str) -> Option<UsageRecord> {
        let state = self.state.lock().await;
        state.usage.get(key).and_then(|targets| targets.get(target)).cloned()
    }

    /// Failure history for a key. Absent rows read as zero strikes.
    pub async fn health(&self, key: &str) -> KeyHealth {
        let state = self.state.lock().await;
        state.health.get(key).cloned().unwrap_or_default()
    }

    /// Snapshot of every key's failure history, for pool rebuilds.
    pub async fn all_health(&self) -> HashMap<String, KeyHealth> {
        let state = self.state.lock().await;
        state.health.clone()
    }

    /// Record a completed call: advance the (key, target) counters,
    /// resetting the window or day first if stale, and clear the key's
    /// strikes. Returns the post-update row.
    pub async fn record_success(
        &self,
        key: &str,
        target: &str,
        tokens: u64,
        now: u64,
    ) -> Result<UsageRecord> {
        let mut state = self.state.lock().await;

        let record = state
            .usage
            .entry(key.to_string())
            .or_default()
            .entry(target.to_string())
            .or_default();

        if record.window_live(now) {
            record.requests_in_window += 1;
            record.tokens_in_window += tokens;
        } else {
            record.window_start = now;
            record.requests_in_window = 1;
            record.tokens_in_window = tokens;
        }

        let today = day_key(now);
        if record.day_key == today {
            record.requests_today += 1;
        } else {
            record.day_key = today;
            record.requests_today = 1;
        }
        let snapshot = record.clone();

        // A success clears prior failure history for this key.
        state.health.entry(key.to_string()).or_default().strikes = 0;

        write_atomic(&self.path, &*state).await?;
        debug!(
            key,
            target,
            requests_in_window = snapshot.requests_in_window,
            tokens_in_window = snapshot.tokens_in_window,
            requests_today = snapshot.requests_today,
            "recorded success"
        );
        Ok(snapshot)
    }

    /// Record a hard failure: increment the key's strikes and set its
    /// cooldown release from the escalation table. Returns the new
    /// health so the caller can decide between cooldown and retirement.
    pub async fn record_strike(&self, key: &str, now: u64) -> Result<KeyHealth> {
        let mut state = self.state.lock().await;
        let health = state.health.entry(key.to_string()).or_default();
        health.strikes += 1;
        health.release_at = now + escalation::cooldown_for(health.strikes).as_millis() as u64;
        let snapshot = health.clone();

        write_atomic(&self.path, &*state).await?;
        warn!(
            key,
            strikes = snapshot.strikes,
            release_in_secs = snapshot.release_at.saturating_sub(now) / 1000,
            "recorded strike"
        );
        Ok(snapshot)
    }

    /// Mark a key's credential as rejected: strikes jump to the fatal
    /// sentinel and the key is out of rotation until an operator reset.
    pub async fn mark_fatal(&self, key: &str) -> Result<KeyHealth> {
        let mut state = self.state.lock().await;
        let health = state.health.entry(key.to_string()).or_default();
        health.strikes = escalation::FATAL_STRIKES;
        let snapshot = health.clone();

        write_atomic(&self.path, &*state).await?;
        warn!(key, "marked key fatal");
        Ok(snapshot)
    }

    /// Operator reset: zero strikes, no cooldown. Usage counters are
    /// left alone; quota spent is still spent.
    pub async fn clear_health(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.health.insert(key.to_string(), KeyHealth::default());
        write_atomic(&self.path, &*state).await?;
        info!(key, "cleared key health");
        Ok(())
    }

    /// Drop all rows for a removed key.
    pub async fn forget(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let had_usage = state.usage.remove(key).is_some();
        let had_health = state.health.remove(key).is_some();
        if had_usage || had_health {
            write_atomic(&self.path, &*state).await?;
            debug!(key, "forgot key ledger rows");
        }
        Ok(())
    }
}

/// UTC day key ("YYYY-MM-DD") for a unix-millis timestamp.
pub fn day_key(now: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(now as i64)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Seconds from `now` until the next UTC day boundary.
pub fn secs_until_next_day(now: u64) -> u64 {
    let Some(dt) = DateTime::<Utc>::from_timestamp_millis(now as i64) else {
        return 0;
    };
    let next_midnight = dt
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis() as u64)
        .unwrap_or(now);
    next_midnight.saturating_sub(now).div_ceil(1000)
}
