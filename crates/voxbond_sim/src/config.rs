//! # Simulation Configuration
//!
//! Loaded once at startup from TOML:
//!
//! ```toml
//! worker_threads = 8
//! attach_retry_limit = 3
//!
//! [groups]
//! max_map_cells = 1048576
//! lock_spin_limit = 32
//! ```
//!
//! Every key is optional; missing keys take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use voxbond_core::GroupConfig;

use crate::error::{SimError, SimResult};

/// Configuration for the step driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// OS threads the per-voxel workers are fanned out over.
    pub worker_threads: usize,
    /// Steps an attach request is attempted before it is dropped.
    pub attach_retry_limit: u32,
    /// Group maintenance settings.
    pub groups: GroupConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            attach_retry_limit: 3,
            groups: GroupConfig::default(),
        }
    }
}

impl SimConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// [`SimError::Config`] on malformed TOML or out-of-range values.
    pub fn from_toml_str(text: &str) -> SimResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SimError::Config(e.to_string()))?;
        config.validate()
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`SimError::ConfigIo`] if the file cannot be read, otherwise as
    /// [`SimConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SimError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), ?config, "config loaded");
        Ok(config)
    }

    fn validate(self) -> SimResult<Self> {
        if self.worker_threads == 0 {
            return Err(SimError::Config("worker_threads must be at least 1".into()));
        }
        if self.attach_retry_limit == 0 {
            return Err(SimError::Config("attach_retry_limit must be at least 1".into()));
        }
        if self.groups.max_map_cells == 0 {
            return Err(SimError::Config("groups.max_map_cells must be at least 1".into()));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        assert_eq!(SimConfig::from_toml_str("").unwrap(), SimConfig::default());
    }

    #[test]
    fn test_nested_group_table() {
        let config = SimConfig::from_toml_str(
            r"
            worker_threads = 8

            [groups]
            lock_spin_limit = 16
            ",
        )
        .unwrap();

        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.attach_retry_limit, 3);
        assert_eq!(config.groups.lock_spin_limit, 16);
        assert_eq!(config.groups.max_map_cells, GroupConfig::default().max_map_cells);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            SimConfig::from_toml_str("worker_threads = 0"),
            Err(SimError::Config(_))
        ));
        assert!(matches!(
            SimConfig::from_toml_str("worker_threads = \"many\""),
            Err(SimError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("voxbond_sim_{}.toml", std::process::id()));
        std::fs::write(&path, "attach_retry_limit = 5\n[groups]\nmax_rebuild_passes = 2\n").unwrap();

        let config = SimConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.attach_retry_limit, 5);
        assert_eq!(config.groups.max_rebuild_passes, 2);
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn test_missing_file() {
        let err = SimConfig::load("/definitely/not/here/voxbond.toml").unwrap_err();
        assert!(matches!(err, SimError::ConfigIo { .. }));
    }
}
