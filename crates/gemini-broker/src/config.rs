//! Broker configuration loading
//!
//! Config precedence: env vars > config file > defaults. Store paths may
//! be overridden with GEMINI_KEYS_PATH / GEMINI_LEDGER_PATH so deployments
//! can relocate the durable files without editing the TOML.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Durable store locations
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key registry file.
    pub keys_path: PathBuf,
    /// Usage ledger file.
    pub ledger_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            keys_path: PathBuf::from("keys.json"),
            ledger_path: PathBuf::from("ledger.json"),
        }
    }
}

/// Pool behavior settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Whether paid keys may serve free-tier configurations.
    pub paid_serves_free: bool,
    /// Catalog TOML path; the built-in catalog is used when unset.
    pub catalog_path: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            paid_serves_free: true,
            catalog_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(p) = std::env::var("GEMINI_KEYS_PATH") {
            config.store.keys_path = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("GEMINI_LEDGER_PATH") {
            config.store.ledger_path = PathBuf::from(p);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        // Both stores are whole-file JSON documents; sharing a path would
        // have each clobbering the other on every write.
        if self.store.keys_path == self.store.ledger_path {
            return Err(common::Error::Config(format!(
                "keys_path and ledger_path must differ, both are {}",
                self.store.keys_path.display()
            )));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or GEMINI_BROKER_CONFIG env
    /// var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("GEMINI_BROKER_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-broker.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables,
    /// preventing data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[store]
keys_path = "/var/lib/gemini/keys.json"
ledger_path = "/var/lib/gemini/ledger.json"

[pool]
paid_serves_free = false
"#
    }

    #[test]
    fn load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("GEMINI_KEYS_PATH") };
        unsafe { remove_env("GEMINI_LEDGER_PATH") };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.store.keys_path,
            PathBuf::from("/var/lib/gemini/keys.json")
        );
        assert!(!config.pool.paid_serves_free);
        assert!(config.pool.catalog_path.is_none());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("GEMINI_KEYS_PATH") };
        unsafe { remove_env("GEMINI_LEDGER_PATH") };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.keys_path, PathBuf::from("keys.json"));
        assert_eq!(config.store.ledger_path, PathBuf::from("ledger.json"));
        assert!(config.pool.paid_serves_free);
    }

    #[test]
    fn load_missing_file_errors() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_invalid_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid {{{{ toml").unwrap();

        let result = Config::load(&path);
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides_store_paths() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        unsafe { set_env("GEMINI_KEYS_PATH", "/srv/keys.json") };
        unsafe { set_env("GEMINI_LEDGER_PATH", "/srv/ledger.json") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.keys_path, PathBuf::from("/srv/keys.json"));
        assert_eq!(config.store.ledger_path, PathBuf::from("/srv/ledger.json"));
        unsafe { remove_env("GEMINI_KEYS_PATH") };
        unsafe { remove_env("GEMINI_LEDGER_PATH") };
    }

    #[test]
    fn same_store_path_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("GEMINI_KEYS_PATH") };
        unsafe { remove_env("GEMINI_LEDGER_PATH") };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[store]
keys_path = "state.json"
ledger_path = "state.json"
"#,
        )
        .unwrap();

        let result = Config::load(&path);
        assert!(result.is_err(), "shared store path must be rejected");
        let err = format!("{}", result.unwrap_err());
        assert!(err.contains("must differ"), "got: {err}");
    }

    #[test]
    fn resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("GEMINI_BROKER_CONFIG", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("GEMINI_BROKER_CONFIG") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("GEMINI_BROKER_CONFIG") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("gemini-broker.toml"));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("GEMINI_BROKER_CONFIG", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over GEMINI_BROKER_CONFIG"
        );
        unsafe { remove_env("GEMINI_BROKER_CONFIG") };
    }
}
