//! Strike escalation schedule
//!
//! Hard failures attributable to a key escalate through a fixed cooldown
//! table. Strike counts past the end of the table reuse the last entry.
//! A key that collects `MAX_STRIKES` is retired from rotation entirely;
//! `FATAL_STRIKES` marks a key whose credential the upstream rejected
//! outright.

use std::time::Duration;

/// Cooldown applied at each consecutive strike, in order.
const COOLDOWN_STEPS: [Duration; 4] = [
    Duration::from_secs(10),
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(3600),
];

/// Strike count at which a key is permanently retired.
pub const MAX_STRIKES: u32 = 5;

/// Strike value recorded for keys whose credential was rejected.
pub const FATAL_STRIKES: u32 = 999;

/// Cooldown for the given strike count (1-based). Counts beyond the
/// table clamp to its last entry.
pub fn cooldown_for(strikes: u32) -> Duration {
    let idx = (strikes.max(1) as usize - 1).min(COOLDOWN_STEPS.len() - 1);
    COOLDOWN_STEPS[idx]
}

/// Whether a strike count permanently excludes the key from rotation,
/// regardless of any cooldown release time.
pub fn is_dead(strikes: u32) -> bool {
    strikes >= MAX_STRIKES
}
