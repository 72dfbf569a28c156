//! Engine-wide configuration: how many `TransactionContext`s to shard
//! transactions across, how big each one's redo buffer is, and how the
//! replication replay engine sizes its worker pool.

#![allow(dead_code)]

use crate::durability::DurabilityMode;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

/// Default size (in bytes) of a single `TransactionContext`'s redo buffer.
pub const DEFAULT_REDO_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum key length accepted by `redoStoreAutoCommit`/`redoStore` and
/// friends. Keys longer than this are rejected before any encoding happens.
pub const MAX_KEY_LENGTH: usize = 2048;

/// The bounded-queue depth of a single `WorkerGroup` worker.
pub const DEFAULT_WORKER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error, Clone)]
pub enum EngineConfigError {
    #[error("invalid engine configuration: {0}")]
    Invalid(String),
}

/// Engine-wide configuration. Context count and worker-pool size are
/// validated/derived at construction, not re-derived on every access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder)]
#[getset(get = "pub", set = "pub")]
pub struct EngineConfig {
    /// Number of `TransactionContext` shards. Must be a power of two.
    #[builder(default = EngineConfig::default_context_count())]
    pub context_count: usize,

    /// Redo buffer size per context, in bytes.
    #[builder(default = DEFAULT_REDO_BUFFER_SIZE)]
    pub redo_buffer_size: usize,

    /// Default durability mode for calls that don't specify one.
    #[builder(default)]
    pub default_durability: DurabilityMode,

    /// Requested worker-pool size for `ReplRedoEngine`. `0` or negative
    /// values mean "derive from the number of processors" per spec.md §6;
    /// a negative value multiplies the processor count.
    #[builder(default = 1)]
    pub max_threads: i64,

    /// Bounded queue depth per worker.
    #[builder(default = DEFAULT_WORKER_QUEUE_DEPTH)]
    pub worker_queue_depth: usize,
}

impl EngineConfig {
    /// Picks a small power-of-two context count based on the available
    /// parallelism, mirroring spec.md §4.1 ("a small power of two chosen by
    /// processor count").
    pub fn default_context_count() -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cores.next_power_of_two().clamp(1, 16)
    }

    /// Resolves `max_threads` (spec.md §6: zero/negative derive from
    /// processor count, negative multiplies it) into a concrete worker
    /// count, always at least 1.
    pub fn resolved_worker_count(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as i64)
            .unwrap_or(1);
        let n = if self.max_threads == 0 {
            cores
        } else if self.max_threads < 0 {
            cores * self.max_threads.unsigned_abs() as i64
        } else {
            self.max_threads
        };
        n.max(1) as usize
    }

    pub fn validate(&self) -> Result<(), EngineConfigError> {
        if self.context_count == 0 || !self.context_count.is_power_of_two() {
            return Err(EngineConfigError::Invalid(format!(
                "context_count must be a power of two, got {}",
                self.context_count
            )));
        }
        if self.redo_buffer_size == 0 {
            return Err(EngineConfigError::Invalid(
                "redo_buffer_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Loads configuration from an optional TOML file, overridden by
    /// `ENGINE__*` environment variables, falling back to defaults for
    /// anything unset.
    pub fn load_from_file_and_env(file_path: &str) -> Result<Self, EngineConfigError> {
        let builder = ConfigBuilder::<config::builder::DefaultState>::default()
            .set_default("context_count", Self::default_context_count() as i64)
            .map_err(|e| EngineConfigError::Invalid(e.to_string()))?
            .set_default("redo_buffer_size", DEFAULT_REDO_BUFFER_SIZE as i64)
            .map_err(|e| EngineConfigError::Invalid(e.to_string()))?
            .set_default("max_threads", 1i64)
            .map_err(|e| EngineConfigError::Invalid(e.to_string()))?
            .set_default("worker_queue_depth", DEFAULT_WORKER_QUEUE_DEPTH as i64)
            .map_err(|e| EngineConfigError::Invalid(e.to_string()))?
            .add_source(File::new(file_path, FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("ENGINE").separator("__"))
            .build()
            .map_err(|e| EngineConfigError::Invalid(e.to_string()))?;

        let partial: RawConfig = builder
            .try_deserialize()
            .map_err(|e| EngineConfigError::Invalid(e.to_string()))?;

        let config = EngineConfig::builder()
            .context_count(partial.context_count as usize)
            .redo_buffer_size(partial.redo_buffer_size as usize)
            .max_threads(partial.max_threads)
            .worker_queue_depth(partial.worker_queue_depth as usize)
            .build();
        config.validate()?;
        Ok(config)
    }
}

/// Mirrors `EngineConfig`'s numeric fields so `config`'s deserializer can
/// parse them regardless of source (TOML ints vs. env-var strings).
#[derive(Debug, Deserialize)]
struct RawConfig {
    context_count: i64,
    redo_buffer_size: i64,
    max_threads: i64,
    worker_queue_depth: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::builder().build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_context_count() {
        let config = EngineConfig::builder().context_count(3).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolves_zero_max_threads_to_processor_count() {
        let config = EngineConfig::builder().max_threads(0).build();
        assert!(config.resolved_worker_count() >= 1);
    }

    #[test]
    fn resolves_negative_max_threads_as_multiplier() {
        let config = EngineConfig::builder().max_threads(-2).build();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(config.resolved_worker_count(), cores * 2);
    }

    #[test]
    fn load_from_file_and_env_applies_file_values() {
        let mut temp_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
            context_count = 4
            redo_buffer_size = 131072
            max_threads = 4
            worker_queue_depth = 512
            "#
        )
        .unwrap();
        let path = temp_file.path().to_str().unwrap();

        let config = EngineConfig::load_from_file_and_env(path).unwrap();
        assert_eq!(config.context_count, 4);
        assert_eq!(config.redo_buffer_size, 131072);
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.worker_queue_depth, 512);
    }
}
