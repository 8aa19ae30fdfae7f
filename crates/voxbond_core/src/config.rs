//! # Group Configuration
//!
//! Tuning knobs for group maintenance. Loaded once at startup, usually as the
//! `[groups]` table of the simulation config file.

use serde::{Deserialize, Serialize};

/// Configuration for group maintenance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Largest spatial map (in cells) a rebuild may allocate.
    pub max_map_cells: usize,
    /// Attempts made on a contended lock before deferring.
    pub lock_spin_limit: u32,
    /// Rebuild passes per call before leaving late dirtying to the next step.
    pub max_rebuild_passes: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            // 256^3: a 64 MiB map of handles at worst
            max_map_cells: 1 << 24,
            lock_spin_limit: 64,
            max_rebuild_passes: 4,
        }
    }
}

impl GroupConfig {
    /// Config for tests that want contention to surface immediately.
    #[must_use]
    pub const fn no_spin() -> Self {
        Self {
            max_map_cells: 1 << 24,
            lock_spin_limit: 1,
            max_rebuild_passes: 4,
        }
    }
}
