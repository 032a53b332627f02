//! Pool state machine and quota-aware key selection
//!
//! The broker owns the runtime view of the key fleet (an available
//! rotation, a cooldown map, and a dead set), rebuilt from the registry
//! and ledger at startup and after any registry mutation. The ledger
//! stays the single source of truth: the pool reads usage rows at
//! selection time and its in-memory state is always reconstructible from
//! durable state, so a crash loses nothing but the rotation order.
//!
//! `acquire` never blocks on capacity: it returns a usable key or a wait
//! hint, and the caller decides whether to sleep and retry. Selection is
//! first-fit over the rotation, which keeps latency low and spreads load
//! through the re-enqueue order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use gemini_keys::{
    KeyRecord, KeyRegistry, Tier, UsageLedger, WINDOW_MS, is_dead, secs_until_next_day,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, ModelConfig};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;

/// Floor for wait hints, so callers never spin on a sub-second wait.
const MIN_WAIT_SECS: u64 = 1;

/// Severity of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Transient server-side error, not the key's fault. The key goes
    /// straight back into rotation with no penalty.
    Soft,
    /// The provider rejected this key's traffic. Strike and cooldown.
    Hard,
}

/// A key handed out by `acquire`, ready for one upstream call.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Registry name of the key, for the report-back calls.
    pub key: String,
    /// The API key itself. Redacted from Debug output.
    pub secret: Secret<String>,
    /// Backend model identifier to send on the wire.
    pub target_id: String,
}

/// Outcome of an acquire call.
///
/// Capacity conditions are first-class values, not errors: callers must
/// be able to tell "wait and retry" from "this request can never be
/// served" from "no key of this tier exists at all".
#[derive(Debug)]
pub enum Acquisition {
    /// A key within budget. Use it, then report the outcome.
    Ready(Lease),
    /// The token estimate alone exceeds the configuration's per-minute
    /// budget. Retrying cannot help.
    Fatal,
    /// Every eligible key is over budget or cooling down. Retry after
    /// `wait`.
    Exhausted { wait: Duration },
    /// No live key of the required tier exists. Operator attention, not
    /// a retry loop.
    NoCandidates,
}

/// Per-key data the pool caches from the registry between rebuilds.
#[derive(Debug, Clone)]
struct KeyMeta {
    secret: Secret<String>,
    tier: Tier,
}

/// Runtime pool state. Never persisted; a cache of the stores.
#[derive(Default)]
struct PoolState {
    /// Rotation of usable keys, deduplicated.
    available: VecDeque<String>,
    /// key name → unix millis at which it rejoins the rotation.
    cooldown: HashMap<String, u64>,
    /// Keys permanently out (fatal strikes).
    dead: HashSet<String>,
    /// Registry snapshot for tier/secret lookups during selection.
    meta: HashMap<String, KeyMeta>,
}

/// Pool behavior switches.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Whether paid keys may serve free-tier configurations. On by
    /// default; turning it off isolates paid spend from free traffic.
    pub paid_serves_free: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            paid_serves_free: true,
        }
    }
}

/// Quota-aware key broker.
///
/// Owns the runtime pool state behind a single lock; the registry and
/// ledger are shared via `Arc` and remain the durable source of truth.
/// One broker per process, passed by reference to callers.
pub struct Broker {
    catalog: Catalog,
    registry: Arc<KeyRegistry>,
    ledger: Arc<UsageLedger>,
    options: PoolOptions,
    state: Mutex<PoolState>,
}

impl Broker {
    /// Build a broker and perform the initial Cold → Warm rebuild.
    pub async fn load(
        catalog: Catalog,
        registry: Arc<KeyRegistry>,
        ledger: Arc<UsageLedger>,
        options: PoolOptions,
    ) -> Self {
        let broker = Self {
            catalog,
            registry,
            ledger,
            options,
            state: Mutex::new(PoolState::default()),
        };
        broker.rebuild().await;
        broker
    }

    /// Assemble stores, catalog, and broker from a loaded `Config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = Arc::new(KeyRegistry::load(config.store.keys_path.clone()).await?);
        let ledger = Arc::new(UsageLedger::load(config.store.ledger_path.clone()).await?);
        let catalog = match &config.pool.catalog_path {
            Some(path) => Catalog::load(path)?,
            None => Catalog::builtin(),
        };
        let options = PoolOptions {
            paid_serves_free: config.pool.paid_serves_free,
        };
        Ok(Self::load(catalog, registry, ledger, options).await)
    }

    /// Rebuild the runtime pool from the registry and ledger.
    ///
    /// Runs at startup and after every registry mutation. Fatal strikes
    /// win over any release time; a future release time puts the key on
    /// cooldown; everything else joins the rotation in (priority, name)
    /// order.
    pub async fn rebuild(&self) {
        self.rebuild_at(now_millis()).await;
    }

    async fn rebuild_at(&self, now: u64) {
        let keys = self.registry.list().await;
        let health = self.ledger.all_health().await;

        let mut next = PoolState::default();
        for (name, record) in keys {
            let key_health = health.get(&name).cloned().unwrap_or_default();
            next.meta.insert(
                name.clone(),
                KeyMeta {
                    secret: record.secret,
                    tier: record.tier,
                },
            );
            if is_dead(key_health.strikes) {
                next.dead.insert(name);
            } else if key_health.release_at > now {
                next.cooldown.insert(name, key_health.release_at);
            } else {
                next.available.push_back(name);
            }
        }

        info!(
            available = next.available.len(),
            cooling = next.cooldown.len(),
            dead = next.dead.len(),
            "pool rebuilt"
        );
        *self.state.lock().await = next;
    }

    /// Acquire a key for `config_id`, with `estimated_tokens` as the
    /// rough size of the pending request.
    ///
    /// Returns a tagged outcome rather than raising for capacity
    /// conditions; only an unknown config id is an error. A `Ready` key
    /// is re-enqueued at the back of the rotation immediately; the
    /// caller's report call settles the real accounting.
    pub async fn acquire(&self, config_id: &str, estimated_tokens: u64) -> Result<Acquisition> {
        self.acquire_at(config_id, estimated_tokens, now_millis())
            .await
    }

    async fn acquire_at(
        &self,
        config_id: &str,
        estimated_tokens: u64,
        now: u64,
    ) -> Result<Acquisition> {
        let config = self
            .catalog
            .get(config_id)
            .ok_or_else(|| Error::UnknownConfig(config_id.to_string()))?;

        // Structural reject before touching the pool: the estimate alone
        // can never fit in this configuration's minute budget.
        if estimated_tokens > config.limits.tpm {
            warn!(
                config_id,
                estimated_tokens,
                tpm = config.limits.tpm,
                "request exceeds per-minute token budget"
            );
            metrics::record_acquire("fatal");
            return Ok(Acquisition::Fatal);
        }

        let mut state = self.state.lock().await;
        reclaim(&mut state, now);

        let mut best_wait: Option<u64> = None;

        // Bounded first-fit scan: each key is examined at most once.
        let rotation_len = state.available.len();
        for _ in 0..rotation_len {
            let Some(name) = state.available.pop_front() else {
                break;
            };

            if state.dead.contains(&name) {
                // Retired keys fall out of the rotation here.
                continue;
            }
            let Some(key_meta) = state.meta.get(&name) else {
                warn!(key = %name, "key in rotation but not in registry, dropping");
                continue;
            };
            let key_tier = key_meta.tier;
            let secret = key_meta.secret.clone();

            if !self.tier_allows(key_tier, config.tier) {
                state.available.push_back(name);
                continue;
            }

            match self.check_limits(&name, config, estimated_tokens, now).await {
                None => {
                    // First fit: hand it out and re-enqueue at the back.
                    let lease = Lease {
                        key: name.clone(),
                        secret,
                        target_id: config.target_id.clone(),
                    };
                    state.available.push_back(name);
                    debug!(key = %lease.key, config_id, "key acquired");
                    metrics::record_acquire("ready");
                    return Ok(Acquisition::Ready(lease));
                }
                Some(wait) => {
                    best_wait = Some(best_wait.map_or(wait, |w| w.min(wait)));
                    state.available.push_back(name);
                }
            }
        }

        // Nothing usable in the rotation. Cooling keys of the right tier
        // still count as candidates: report the soonest release.
        for (name, release_at) in &state.cooldown {
            let Some(key_meta) = state.meta.get(name) else {
                continue;
            };
            if !self.tier_allows(key_meta.tier, config.tier) {
                continue;
            }
            let wait = release_at
                .saturating_sub(now)
                .div_ceil(1000)
                .max(MIN_WAIT_SECS);
            best_wait = Some(best_wait.map_or(wait, |w| w.min(wait)));
        }

        match best_wait {
            Some(wait) => {
                debug!(config_id, wait_secs = wait, "all keys over budget for config");
                metrics::record_acquire("exhausted");
                Ok(Acquisition::Exhausted {
                    wait: Duration::from_secs(wait),
                })
            }
            None => {
                warn!(config_id, "no live key of the required tier");
                metrics::record_acquire("no_candidates");
                Ok(Acquisition::NoCandidates)
            }
        }
    }

    /// Record a completed upstream call against (key, target).
    ///
    /// Always books the usage, even for a key that has since been cooled
    /// down or retired; the spend happened. A success also clears the
    /// key's strikes.
    pub async fn report_success(&self, key: &str, target_id: &str, actual_tokens: u64) -> Result<()> {
        self.report_success_at(key, target_id, actual_tokens, now_millis())
            .await
    }

    async fn report_success_at(
        &self,
        key: &str,
        target_id: &str,
        actual_tokens: u64,
        now: u64,
    ) -> Result<()> {
        let record = self
            .ledger
            .record_success(key, target_id, actual_tokens, now)
            .await?;
        debug!(
            key,
            target_id,
            requests_in_window = record.requests_in_window,
            tokens_in_window = record.tokens_in_window,
            "success recorded"
        );
        Ok(())
    }

    /// Report a failed upstream call.
    ///
    /// Soft failures carry no penalty. Hard failures escalate through
    /// the cooldown table and retire the key once it collects
    /// `MAX_STRIKES`; the strike is persisted before this returns, so a
    /// concurrent `acquire` observes the cooldown.
    pub async fn report_failure(&self, key: &str, severity: Severity) -> Result<()> {
        self.report_failure_at(key, severity, now_millis()).await
    }

    async fn report_failure_at(&self, key: &str, severity: Severity, now: u64) -> Result<()> {
        match severity {
            Severity::Soft => {
                metrics::record_failure("soft");
                let mut state = self.state.lock().await;
                let known = state.meta.contains_key(key);
                if known
                    && !state.dead.contains(key)
                    && !state.cooldown.contains_key(key)
                    && !state.available.iter().any(|n| n == key)
                {
                    state.available.push_back(key.to_string());
                }
                debug!(key, "soft failure, no penalty");
                Ok(())
            }
            Severity::Hard => {
                metrics::record_failure("hard");
                let health = self.ledger.record_strike(key, now).await?;
                let mut state = self.state.lock().await;
                state.available.retain(|n| n != key);
                if is_dead(health.strikes) {
                    state.cooldown.remove(key);
                    state.dead.insert(key.to_string());
                    metrics::record_retirement();
                    warn!(key, strikes = health.strikes, "key retired after repeated failures");
                } else {
                    state.cooldown.insert(key.to_string(), health.release_at);
                    info!(
                        key,
                        strikes = health.strikes,
                        release_in_secs = health.release_at.saturating_sub(now) / 1000,
                        "key cooling down"
                    );
                }
                Ok(())
            }
        }
    }

    /// Permanently retire a key whose credential the upstream rejected.
    ///
    /// No automatic recovery; an operator must `reset_key` after
    /// rotating the credential.
    pub async fn report_fatal(&self, key: &str) -> Result<()> {
        let health = self.ledger.mark_fatal(key).await?;
        let mut state = self.state.lock().await;
        state.available.retain(|n| n != key);
        state.cooldown.remove(key);
        state.dead.insert(key.to_string());
        metrics::record_retirement();
        warn!(key, strikes = health.strikes, "key retired (credential rejected)");
        Ok(())
    }

    /// Register a new key and rebuild the pool.
    pub async fn add_key(&self, name: &str, secret: String, tier: Tier, priority: u32) -> Result<()> {
        self.registry
            .add(name.to_string(), secret, tier, priority)
            .await?;
        info!(key = name, tier = tier.label(), "key added");
        self.rebuild().await;
        Ok(())
    }

    /// Change a key's tier and rebuild the pool.
    pub async fn update_tier(&self, name: &str, tier: Tier) -> Result<()> {
        self.registry.update_tier(name, tier).await?;
        self.rebuild().await;
        Ok(())
    }

    /// Change a key's rotation priority and rebuild the pool.
    pub async fn update_priority(&self, name: &str, priority: u32) -> Result<()> {
        self.registry.update_priority(name, priority).await?;
        self.rebuild().await;
        Ok(())
    }

    /// Remove a key. Its ledger rows go with it.
    pub async fn remove_key(&self, name: &str) -> Result<()> {
        let removed = self.registry.remove(name).await?;
        if removed.is_some() {
            self.ledger.forget(name).await?;
            info!(key = name, "key removed");
        }
        self.rebuild().await;
        Ok(())
    }

    /// Operator reset: clear a key's strikes and cooldown, returning it
    /// to rotation. Usage counters are left alone; quota spent is
    /// still spent.
    pub async fn reset_key(&self, name: &str) -> Result<()> {
        self.ledger.clear_health(name).await?;
        info!(key = name, "key health reset");
        self.rebuild().await;
        Ok(())
    }

    /// List registered keys. Secrets stay wrapped.
    pub async fn list_keys(&self) -> Vec<(String, KeyRecord)> {
        self.registry.list().await
    }

    /// Pool status summary.
    ///
    /// Returns a JSON value with per-key state and overall pool health.
    /// Status mapping: all keys in rotation → healthy, some → degraded,
    /// none → unhealthy.
    pub async fn status(&self) -> serde_json::Value {
        self.status_at(now_millis()).await
    }

    async fn status_at(&self, now: u64) -> serde_json::Value {
        let state = self.state.lock().await;

        let mut entries: Vec<(&String, &KeyMeta)> = state.meta.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut keys = Vec::new();
        let mut available_count = 0usize;
        let mut cooling_count = 0usize;
        let mut dead_count = 0usize;

        for (name, key_meta) in entries {
            let cooling_until = state
                .cooldown
                .get(name.as_str())
                .copied()
                .filter(|release_at| *release_at > now);
            if state.dead.contains(name.as_str()) {
                dead_count += 1;
                keys.push(serde_json::json!({
                    "name": name,
                    "tier": key_meta.tier.label(),
                    "status": "dead"
                }));
            } else if let Some(release_at) = cooling_until {
                cooling_count += 1;
                keys.push(serde_json::json!({
                    "name": name,
                    "tier": key_meta.tier.label(),
                    "status": "cooling_down",
                    "cooldown_remaining_secs": release_at.saturating_sub(now) / 1000
                }));
            } else {
                available_count += 1;
                keys.push(serde_json::json!({
                    "name": name,
                    "tier": key_meta.tier.label(),
                    "status": "available"
                }));
            }
        }

        let total = state.meta.len();
        let pool_status = if available_count == total && total > 0 {
            "healthy"
        } else if available_count > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "keys_total": total,
            "keys_available": available_count,
            "keys_cooling_down": cooling_count,
            "keys_dead": dead_count,
            "keys": keys
        })
    }

    /// Tier rule: free keys serve only free configs; paid keys serve
    /// everything unless the paid-serves-free fallback is off.
    fn tier_allows(&self, key_tier: Tier, required: Tier) -> bool {
        if key_tier == Tier::Paid && required == Tier::Free && !self.options.paid_serves_free {
            return false;
        }
        key_tier.can_serve(required)
    }

    /// Check one key's ledger row against the configuration's limits.
    ///
    /// Returns `None` when the key can take the request now, otherwise
    /// the seconds until the relevant budget frees up. Stale window and
    /// day counters read as zero without writing; the next report
    /// resets them.
    async fn check_limits(
        &self,
        key: &str,
        config: &ModelConfig,
        estimated_tokens: u64,
        now: u64,
    ) -> Option<u64> {
        let Some(record) = self.ledger.usage(key, &config.target_id).await else {
            return None; // first use, nothing spent yet
        };
        let limits = &config.limits;

        if record.window_live(now) {
            let elapsed = now.saturating_sub(record.window_start);
            let window_wait = (WINDOW_MS - elapsed).div_ceil(1000).max(MIN_WAIT_SECS);
            if record.requests_in_window >= limits.rpm {
                return Some(window_wait);
            }
            if record.tokens_in_window + estimated_tokens > limits.tpm {
                return Some(window_wait);
            }
        }

        if record.requests_today_at(now) >= limits.rpd {
            return Some(secs_until_next_day(now).max(MIN_WAIT_SECS));
        }

        None
    }
}

/// Move any key whose cooldown has expired back into the rotation.
fn reclaim(state: &mut PoolState, now: u64) {
    let released: Vec<String> = state
        .cooldown
        .iter()
        .filter(|(_, release_at)| **release_at <= now)
        .map(|(name, _)| name.clone())
        .collect();
    for name in released {
        state.cooldown.remove(&name);
        if !state.available.contains(&name) {
            info!(key = %name, "cooldown expired, key back in rotation");
            state.available.push_back(name);
        }
    }
}

/// Current unix time in milliseconds.
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
