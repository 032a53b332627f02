//! Quota-aware key broker for the Gemini generation API
//!
//! Hands out API keys that are currently within budget for a requested
//! model configuration, tracks usage per (key, target) pair, escalates
//! cooldowns on failure, retires keys that fail unrecoverably, and
//! survives restarts by rebuilding from the durable registry and ledger
//! in `gemini-keys`.
//!
//! Key lifecycle:
//! 1. Operator adds a key → registry row, key joins the rotation
//! 2. Caller acquires for a config → first key within rpm/tpm/rpd budget
//! 3. Caller reports success → ledger counters advance, strikes clear
//! 4. Caller reports a hard failure → strike, escalating cooldown
//! 5. Caller reports fatal (credential rejected) → retired until reset
//! 6. Cooldown expires → key rejoins the rotation automatically
//!
//! The broker never performs the upstream call itself: callers take a
//! `Lease`, talk to the API out-of-band, and report the outcome back.

pub mod catalog;
pub mod classify;
pub mod config;
pub mod error;
mod metrics;
pub mod pool;

pub use catalog::{Catalog, Limits, ModelConfig, estimate_tokens};
pub use classify::{FailureKind, classify_400, classify_status};
pub use config::{Config, PoolConfig, StoreConfig};
pub use error::{Error, Result};
pub use pool::{Acquisition, Broker, Lease, PoolOptions, Severity};
