//! Durable state for the Gemini key broker
//!
//! Two JSON-backed stores make up the broker's source of truth. The key
//! registry holds which keys exist (name, secret, tier, priority); the
//! usage ledger holds what they have spent (rolling-minute and daily
//! counters per backend target) and how they have failed (strikes and
//! cooldown release). The runtime pool is a cache of these two stores
//! and is rebuilt from them at startup, so a crash loses nothing but the
//! rotation order.
//!
//! All ledger mutations are read-modify-write operations executed inside
//! the ledger lock and persisted before they return. Two concurrent
//! success reports can never read the same pre-increment counter.

pub mod error;
pub mod escalation;
pub mod ledger;
mod persist;
pub mod registry;

pub use error::{Error, Result};
pub use escalation::{FATAL_STRIKES, MAX_STRIKES, cooldown_for, is_dead};
pub use ledger::{KeyHealth, UsageLedger, UsageRecord, WINDOW_MS, day_key, secs_until_next_day};
pub use registry::{KeyRecord, KeyRegistry, Tier};
