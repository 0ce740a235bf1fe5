use crate::async_io::IoPriority;
use crate::LoaderResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The smallest read the precaching reader will issue, matching a DVD ECC block
pub const DEFAULT_MIN_PRECACHE_BLOCK_SIZE: u64 = 32 * 1024;

/// What the IO worker does when a compressed stream fails validation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorruptionPolicy {
    /// Log the details and terminate the process
    Abort,
    /// Log the details and attach a `Corrupted` error to the request's buffer
    Report,
}

impl Default for CorruptionPolicy {
    fn default() -> Self {
        CorruptionPolicy::Abort
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// 0 disables throttling
    pub bandwidth_limit_mb_per_sec: f32,
    pub suspended_idle_sleep_ms: u64,
    pub corruption_policy: CorruptionPolicy,
    /// Decompress each chunk inline instead of overlapping it with the next chunk's read
    pub synchronous_decompression: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            bandwidth_limit_mb_per_sec: 0.0,
            suspended_idle_sleep_ms: 5,
            corruption_policy: CorruptionPolicy::Abort,
            synchronous_decompression: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub min_precache_block_size: u64,
    pub precache_priority: IoPriority,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            min_precache_block_size: DEFAULT_MIN_PRECACHE_BLOCK_SIZE,
            precache_priority: IoPriority::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadingConfig {
    /// Minimum IO priority serviced while flushing, so background reads can't starve a flush.
    /// Clamped to `ReaderConfig::precache_priority` when higher.
    pub flush_min_priority: IoPriority,
    /// A single unit of work taking longer than this multiple of the tick's time limit is logged
    pub slow_operation_multiplier: f32,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        LoadingConfig {
            flush_min_priority: IoPriority::Normal,
            slow_operation_multiplier: 2.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub spin_iterations: u32,
    pub initial_sleep_us: u64,
    pub max_sleep_us: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            spin_iterations: 64,
            initial_sleep_us: 50,
            max_sleep_us: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub io: IoConfig,
    pub reader: ReaderConfig,
    pub loading: LoadingConfig,
    pub poll: PollConfig,
}

impl StreamingConfig {
    pub fn from_json_str(json: &str) -> LoaderResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load_from_file(path: &Path) -> LoaderResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = StreamingConfig::from_json_str(
            r#"{ "io": { "bandwidth_limit_mb_per_sec": 8.0, "corruption_policy": "Report" } }"#,
        )
        .unwrap();
        assert_eq!(config.io.bandwidth_limit_mb_per_sec, 8.0);
        assert_eq!(config.io.corruption_policy, CorruptionPolicy::Report);
        assert_eq!(config.io.suspended_idle_sleep_ms, 5);
        assert_eq!(config.reader, ReaderConfig::default());
        assert_eq!(config.loading.flush_min_priority, IoPriority::Normal);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(StreamingConfig::from_json_str("{ io: ").is_err());
    }
}
