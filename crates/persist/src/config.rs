//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Physical chunk size used when copying block payloads.
pub const DEFAULT_BLOCK_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest chunk size `validate` will accept.
pub const MIN_BLOCK_CHUNK_SIZE: usize = 1024;

/// Compiler-generated name fragments that never enter the type id space.
///
/// Double underscores only count at the start of a path segment (`::__Anon0`, `.__Anon0`),
/// so ordinary names that merely contain `__` still register.
pub const DEFAULT_TYPE_NAME_DENY_LIST: &[&str] = &["{{closure}}", "{{impl}}", "{{constant}}", "<>", "::__", ".__"];

/// Persistence engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Chunk size in bytes for physical block reads and writes.
    pub block_chunk_size: usize,
    /// How often `wait_for_drain` re-checks the pending list. Kept below 50 ms.
    pub drain_poll_interval_ms: u64,
    /// A drain still waiting after this many seconds gets logged (and logged again each period).
    pub drain_warn_after_secs: u64,
    /// zstd level for save files; `None` stores them uncompressed.
    pub compression_level: Option<i32>,
    /// Substrings that exclude a name from bulk type registration.
    pub type_name_deny_list: Vec<String>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            block_chunk_size: DEFAULT_BLOCK_CHUNK_SIZE,
            drain_poll_interval_ms: 25,
            drain_warn_after_secs: 30,
            compression_level: None,
            type_name_deny_list: DEFAULT_TYPE_NAME_DENY_LIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PersistConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        Ok(config.validate())
    }

    /// Clamp out-of-range values into their supported ranges.
    pub fn validate(mut self) -> Self {
        if self.block_chunk_size < MIN_BLOCK_CHUNK_SIZE {
            tracing::warn!(
                requested = self.block_chunk_size,
                min = MIN_BLOCK_CHUNK_SIZE,
                "block chunk size too small, clamping"
            );
            self.block_chunk_size = MIN_BLOCK_CHUNK_SIZE;
        }
        self.drain_poll_interval_ms = self.drain_poll_interval_ms.clamp(1, 49);
        if let Some(level) = self.compression_level {
            self.compression_level = Some(level.clamp(1, 22));
        }
        self
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn drain_warn_after(&self) -> Duration {
        Duration::from_secs(self.drain_warn_after_secs.max(1))
    }

    pub fn with_compression(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self.validate()
    }
}
