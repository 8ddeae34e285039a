//! Cache Configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{DEFAULT_DISK_CAPACITY, DEFAULT_MEMORY_CAPACITY, DEFAULT_WORKER_THREADS};
use crate::error::{Error, Result};

/// Cache configuration
///
/// Immutable once handed to a cache. Re-initializing with a new config
/// destroys both tiers; see [`TicketCache::reinit`](super::TicketCache::reinit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Memory tier capacity in bytes
    pub memory_capacity_bytes: u64,
    /// Directory holding disk tier files
    pub disk_directory: PathBuf,
    /// Disk tier capacity in bytes
    pub disk_capacity_bytes: u64,
    /// Worker threads for disk writes and async pops
    pub worker_threads: usize,
    /// Keep and re-index ticket files found at startup instead of deleting them
    pub recover_on_open: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: DEFAULT_MEMORY_CAPACITY,
            disk_directory: std::env::temp_dir().join("ticketstore"),
            disk_capacity_bytes: DEFAULT_DISK_CAPACITY,
            worker_threads: DEFAULT_WORKER_THREADS,
            recover_on_open: false,
        }
    }
}

impl CacheConfig {
    /// Config with the three required settings and defaults for the rest
    pub fn new(
        memory_capacity_bytes: u64,
        disk_directory: impl Into<PathBuf>,
        disk_capacity_bytes: u64,
    ) -> Self {
        Self {
            memory_capacity_bytes,
            disk_directory: disk_directory.into(),
            disk_capacity_bytes,
            ..Default::default()
        }
    }

    /// Load a config from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
        Self::from_yaml_str(&raw)
    }

    /// Parse a config from YAML text
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the tiers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memory_capacity_bytes == 0 {
            return Err(Error::Config("memory_capacity_bytes must be > 0".to_string()));
        }
        if self.disk_capacity_bytes == 0 {
            return Err(Error::Config("disk_capacity_bytes must be > 0".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be > 0".to_string()));
        }
        if self.disk_directory.as_os_str().is_empty() {
            return Err(Error::Config("disk_directory must not be empty".to_string()));
        }
        Ok(())
    }
}
