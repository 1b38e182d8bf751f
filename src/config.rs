//! Run configuration for saving and loading tool limits.
//!
//! Everything here has a sensible default, so a missing `--config` file is not
//! an error. Values are validated before a queue is started.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Smallest copy chunk a move may use.
const MIN_CHUNK_SIZE: u64 = 4096;

/// Largest copy chunk a move may use; bounds memory held per chunk.
const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Per-tool time budgets, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolTimeouts {
    /// `sfdisk` reads and writes
    pub table_secs: u64,
    /// `lsblk` and other device queries
    pub query_secs: u64,
    pub mkfs_secs: u64,
    pub fsck_secs: u64,
    pub resize_secs: u64,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            table_secs: 60,
            query_secs: 30,
            mkfs_secs: 600,
            fsck_secs: 3600,
            resize_secs: 3600,
        }
    }
}

impl ToolTimeouts {
    pub fn table(&self) -> Duration {
        Duration::from_secs(self.table_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn mkfs(&self) -> Duration {
        Duration::from_secs(self.mkfs_secs)
    }

    pub fn fsck(&self) -> Duration {
        Duration::from_secs(self.fsck_secs)
    }

    pub fn resize(&self) -> Duration {
        Duration::from_secs(self.resize_secs)
    }
}

/// Configuration for one partjob run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub timeouts: ToolTimeouts,
    /// Bytes copied per step when moving a filesystem
    pub copy_chunk_size: u64,
    /// Re-read every device before the queue starts
    pub rescan_before_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeouts: ToolTimeouts::default(),
            copy_chunk_size: 1024 * 1024,
            rescan_before_run: true,
        }
    }
}

impl RunConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load from `path` if given, defaults otherwise. Always validated.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        for (name, secs) in [
            ("table", t.table_secs),
            ("query", t.query_secs),
            ("mkfs", t.mkfs_secs),
            ("fsck", t.fsck_secs),
            ("resize", t.resize_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("Timeout for {} tools must be at least one second", name);
            }
        }

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.copy_chunk_size) {
            anyhow::bail!(
                "Copy chunk size must be between {} and {} bytes (got {})",
                MIN_CHUNK_SIZE,
                MAX_CHUNK_SIZE,
                self.copy_chunk_size
            );
        }
        // Chunks must cover whole sectors for both common sector sizes
        if self.copy_chunk_size % 4096 != 0 {
            anyhow::bail!("Copy chunk size must be a multiple of 4096 bytes");
        }

        Ok(())
    }
}
