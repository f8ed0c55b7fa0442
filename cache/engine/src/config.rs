//! Cache configuration loaded from TOML or built in code.

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::line::{MAX_SECTORS_PER_LINE, SECTOR_SIZE};

/// Cache configuration.
///
/// `lines` is the collision-table size: the number of cache-line slots on
/// the cache device. The hash-bucket count is `2^hash_power`; when unset
/// it is derived so that the table is at least as large as the line count.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache-line size in bytes. Power of two, at most 64 sectors.
    #[serde(default = "default_line_size")]
    pub line_size: u64,

    /// Number of cache-line slots.
    pub lines: u32,

    /// Hash-bucket count exponent (buckets = 2^hash_power).
    #[serde(default)]
    pub hash_power: Option<u8>,

    /// Error count at which the cache trips into pass-through mode.
    /// `None` disables the fallback entirely.
    #[serde(default)]
    pub fallback_error_threshold: Option<u32>,

    /// User partitions. Partition 0 is the default target.
    #[serde(default = "default_partitions")]
    pub partitions: Vec<PartitionConfig>,
}

/// Per-partition configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    /// Partition name, used in logs only.
    pub name: String,

    /// Maximum number of cache lines the partition may own.
    #[serde(default = "default_part_max")]
    pub max_lines: u32,

    /// Whether requests targeting this partition may allocate.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_line_size() -> u64 {
    16 * 1024
}

fn default_part_max() -> u32 {
    u32::MAX
}

fn default_true() -> bool {
    true
}

fn default_partitions() -> Vec<PartitionConfig> {
    vec![PartitionConfig {
        name: "default".to_string(),
        max_lines: u32::MAX,
        enabled: true,
    }]
}

impl CacheConfig {
    /// Create a configuration with default geometry for `lines` slots.
    pub fn new(lines: u32) -> Self {
        Self {
            line_size: default_line_size(),
            lines,
            hash_power: None,
            fallback_error_threshold: None,
            partitions: default_partitions(),
        }
    }

    /// Sectors per cache line.
    #[inline]
    pub fn sectors_per_line(&self) -> u8 {
        (self.line_size / SECTOR_SIZE) as u8
    }

    /// Number of hash buckets.
    pub fn hash_buckets(&self) -> usize {
        match self.hash_power {
            Some(power) => 1usize << power,
            None => (self.lines.max(1) as usize).next_power_of_two(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.lines == 0 {
            return Err(EngineError::Config("lines must be non-zero"));
        }
        if self.lines == u32::MAX {
            return Err(EngineError::Config("line count reserves the sentinel"));
        }
        if !self.line_size.is_power_of_two() {
            return Err(EngineError::Config("line_size must be a power of two"));
        }
        if self.line_size < SECTOR_SIZE
            || self.line_size > SECTOR_SIZE * MAX_SECTORS_PER_LINE as u64
        {
            return Err(EngineError::Config(
                "line_size must be between one sector and 64 sectors",
            ));
        }
        if let Some(power) = self.hash_power {
            if power == 0 || power > 31 {
                return Err(EngineError::Config("hash_power must be in 1..=31"));
            }
        }
        if self.partitions.is_empty() {
            return Err(EngineError::Config("at least one partition is required"));
        }
        Ok(())
    }
}
