//! Durable key registry
//!
//! Manages a JSON file mapping key names to API key records. All writes
//! use atomic temp-file + rename to prevent corruption on crash. A tokio
//! Mutex serializes concurrent writers.
//!
//! The registry is the single source of truth for which keys exist and
//! what tier and priority each carries; the runtime pool replays it on
//! every rebuild. Secrets stay wrapped in `Secret<String>` from load to
//! hand-out.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::persist::write_atomic;

/// Access class of a key, restricting which configurations it may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Paid,
}

impl Tier {
    /// Whether a key of this tier may serve a configuration requiring
    /// `required`. Paid keys cover both tiers; free keys never touch
    /// paid configurations.
    pub fn can_serve(self, required: Tier) -> bool {
        match (self, required) {
            (Tier::Paid, _) => true,
            (Tier::Free, Tier::Free) => true,
            (Tier::Free, Tier::Paid) => false,
        }
    }

    /// Tier label for status output and logging.
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Paid => "paid",
        }
    }
}

/// A single registered API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// The API key itself. Redacted from Debug output.
    pub secret: Secret<String>,
    pub tier: Tier,
    /// Rotation tie-break: lower values are tried first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub added_at: DateTime<Utc>,
}

fn default_priority() -> u32 {
    10
}

/// Thread-safe key registry file manager.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to
/// clone the in-memory state, so selection-time reads don't block on
/// operator writes.
pub struct KeyRegistry {
    path: PathBuf,
    state: Mutex<HashMap<String, KeyRecord>>,
}

impl KeyRegistry {
    /// Load the registry from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with
    /// zero keys). The pool will report `unhealthy` until keys are added.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading key registry: {e}")))?;
            let keys: HashMap<String, KeyRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing key registry: {e}")))?;
            info!(path = %path.display(), keys = keys.len(), "loaded key registry");
            keys
        } else {
            info!(path = %path.display(), "key registry not found, starting empty");
            let keys = HashMap::new();
            // Create the empty file so future loads don't need the cold-start path
            write_atomic(&path, &keys).await?;
            keys
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Get a clone of a specific key record.
    pub async fn get(&self, name: &str) -> Option<KeyRecord> {
        let state = self.state.lock().await;
        state.get(name).cloned()
    }

    /// List all keys ordered by priority, then name.
    pub async fn list(&self) -> Vec<(String, KeyRecord)> {
        let state = self.state.lock().await;
        let mut entries: Vec<(String, KeyRecord)> = state
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();
        entries.sort_by(|a, b| {
            a.1.priority
                .cmp(&b.1.priority)
                .then_with(|| a.0.cmp(&b.0))
        });
        entries
    }

    /// Register a new key and persist to disk.
    ///
    /// Key names are unique; re-adding an existing name is an error
    /// rather than a silent overwrite.
    pub async fn add(&self, name: String, secret: String, tier: Tier, priority: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.contains_key(&name) {
            return Err(Error::Duplicate(name));
        }
        state.insert(
            name.clone(),
            KeyRecord {
                secret: Secret::new(secret),
                tier,
                priority,
                added_at: Utc::now(),
            },
        );
        debug!(key = %name, tier = tier.label(), "added key");
        write_atomic(&self.path, &*state).await
    }

    /// Change a key's tier and persist to disk.
    pub async fn update_tier(&self, name: &str, tier: Tier) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        record.tier = tier;
        debug!(key = name, tier = tier.label(), "updated key tier");
        write_atomic(&self.path, &*state).await
    }

    /// Change a key's rotation priority and persist to disk.
    pub async fn update_priority(&self, name: &str, priority: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        record.priority = priority;
        debug!(key = name, priority, "updated key priority");
        write_atomic(&self.path, &*state).await
    }

    /// Replace a key's secret (credential rotation) and persist to disk.
    pub async fn update_secret(&self, name: &str, secret: String) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        record.secret = Secret::new(secret);
        record.added_at = Utc::now();
        debug!(key = name, "updated key secret");
        write_atomic(&self.path, &*state).await
    }

    /// Remove a key and persist to disk.
    ///
    /// Returns the removed record if it existed.
    pub async fn remove(&self, name: &str) -> Result<Option<KeyRecord>> {
        let mut state = self.state.lock().await;
        let removed = state.remove(name);
        if removed.is_some() {
            debug!(key = name, "removed key");
            write_atomic(&self.path, &*state).await?;
        }
        Ok(removed)
    }

    /// Number of registered keys.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
