//! Model configuration catalog
//!
//! The static table of named configurations callers request by id. Each
//! maps to the backend model identifier sent on the wire, the key tier
//! it requires, and its per-key limits (requests/minute, tokens/minute,
//! requests/day). The same physical model can appear under two ids with
//! different tiers and limits; paid keys buy higher ceilings.
//!
//! Loaded once at startup, either from the built-in table or from a TOML
//! file. An unknown config id is an error at acquire time, never a
//! silent default.

use std::collections::HashMap;
use std::path::Path;

use gemini_keys::Tier;
use serde::Deserialize;

/// Per-key limits for one configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Limits {
    /// Requests per rolling minute.
    pub rpm: u32,
    /// Tokens per rolling minute.
    pub tpm: u64,
    /// Requests per UTC day.
    pub rpd: u32,
}

/// One named configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Backend model identifier sent on the wire.
    pub target_id: String,
    /// Human-readable name for status output.
    pub display: String,
    /// Key tier this configuration requires.
    pub tier: Tier,
    pub limits: Limits,
}

/// The set of configurations callers may request.
#[derive(Debug, Clone)]
pub struct Catalog {
    configs: HashMap<String, ModelConfig>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    /// The stock Gemini/Gemma catalog.
    pub fn builtin() -> Self {
        let mut configs = HashMap::new();
        let mut insert = |id: &str, target: &str, display: &str, tier, rpm, tpm, rpd| {
            configs.insert(
                id.to_string(),
                ModelConfig {
                    target_id: target.to_string(),
                    display: display.to_string(),
                    tier,
                    limits: Limits { rpm, tpm, rpd },
                },
            );
        };

        // Paid tier: higher ceilings, paid keys only
        insert(
            "gemini-3-pro-paid",
            "gemini-3-pro-preview",
            "Gemini 3 Pro (Paid)",
            Tier::Paid,
            25,
            1_000_000,
            250,
        );
        insert(
            "gemini-3-flash-paid",
            "gemini-3-flash-preview",
            "Gemini 3 Flash (Paid)",
            Tier::Paid,
            1000,
            4_000_000,
            250,
        );

        // Free tier: stock limits
        insert(
            "gemini-3-flash-free",
            "gemini-3-flash-preview",
            "Gemini 3 Flash (Free)",
            Tier::Free,
            10,
            250_000,
            20,
        );
        insert(
            "gemini-2.5-flash-free",
            "gemini-2.5-flash",
            "Gemini 2.5 Flash (Free)",
            Tier::Free,
            10,
            250_000,
            20,
        );
        insert(
            "gemini-2.5-flash-lite-free",
            "gemini-2.5-flash-lite",
            "Gemini 2.5 Flash-Lite (Free)",
            Tier::Free,
            15,
            250_000,
            20,
        );

        // Gemma family
        insert(
            "gemma-3-27b",
            "gemma-3-27b-it",
            "Gemma 3 27B",
            Tier::Free,
            30,
            15_000,
            10_000,
        );
        insert(
            "gemma-3-12b",
            "gemma-3-12b-it",
            "Gemma 3 12B",
            Tier::Free,
            30,
            15_000,
            10_000,
        );

        Self { configs }
    }

    /// Load a catalog from a TOML file.
    ///
    /// One table per config id:
    ///
    /// ```toml
    /// [gemini-3-pro-paid]
    /// target_id = "gemini-3-pro-preview"
    /// display = "Gemini 3 Pro (Paid)"
    /// tier = "paid"
    /// limits = { rpm = 25, tpm = 1000000, rpd = 250 }
    /// ```
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a TOML catalog document.
    pub fn from_toml_str(contents: &str) -> common::Result<Self> {
        let configs: HashMap<String, ModelConfig> = toml::from_str(contents)?;

        if configs.is_empty() {
            return Err(common::Error::Config(
                "catalog has no configurations".into(),
            ));
        }
        for (id, config) in &configs {
            if config.target_id.is_empty() {
                return Err(common::Error::Config(format!(
                    "config {id}: target_id must not be empty"
                )));
            }
            if config.limits.rpm == 0 {
                return Err(common::Error::Config(format!(
                    "config {id}: rpm must be greater than 0"
                )));
            }
            if config.limits.tpm == 0 {
                return Err(common::Error::Config(format!(
                    "config {id}: tpm must be greater than 0"
                )));
            }
            if config.limits.rpd == 0 {
                return Err(common::Error::Config(format!(
                    "config {id}: rpd must be greater than 0"
                )));
            }
        }

        Ok(Self { configs })
    }

    /// Look up a configuration by id.
    pub fn get(&self, config_id: &str) -> Option<&ModelConfig> {
        self.configs.get(config_id)
    }

    /// All config ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.configs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of configurations.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Rough token estimate for a request body: about four characters per
/// token, rounded up. Callers with a real tokenizer should prefer it.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    text.len() as u64 / 4 + 1
}
