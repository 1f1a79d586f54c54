use crate::error::DbError;
use crate::wal::frame::MAX_FRAME_BODY_BYTES;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync after every flushed batch or feed append.
    Full,
    OsBuffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Strict,
    Permissive,
}

/// Runtime configuration shared by every database opened through one host.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Upper bound for any log, table or feed read.
    pub read_timeout_ms: u64,
    /// Quiet period after the last append before a watch callback fires.
    pub indexing_debounce_ms: u64,
    pub blob_chunk_size: usize,
    pub durability_mode: DurabilityMode,
    pub recovery_mode: RecoveryMode,
    pub max_batch_bytes: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            indexing_debounce_ms: 5_000,
            blob_chunk_size: 64 * 1024,
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
            max_batch_bytes: 16 * 1024 * 1024,
        }
    }
}

impl DbConfig {
    pub fn development() -> Self {
        Self {
            durability_mode: DurabilityMode::OsBuffered,
            recovery_mode: RecoveryMode::Permissive,
            indexing_debounce_ms: 500,
            ..Self::default()
        }
    }

    /// Short timers for tests that exercise the debounce and timeout paths.
    pub fn testing() -> Self {
        Self {
            read_timeout_ms: 1_000,
            indexing_debounce_ms: 50,
            durability_mode: DurabilityMode::OsBuffered,
            ..Self::default()
        }
    }

    pub fn with_blob_chunk_size(mut self, size: usize) -> Self {
        self.blob_chunk_size = size;
        self
    }

    pub fn with_indexing_debounce_ms(mut self, ms: u64) -> Self {
        self.indexing_debounce_ms = ms;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn indexing_debounce(&self) -> Duration {
        Duration::from_millis(self.indexing_debounce_ms)
    }

    pub fn strict_recovery(&self) -> bool {
        matches!(self.recovery_mode, RecoveryMode::Strict)
    }

    pub fn sync_writes(&self) -> bool {
        matches!(self.durability_mode, DurabilityMode::Full)
    }
}

pub(crate) fn validate_config(config: &DbConfig) -> Result<(), DbError> {
    if config.read_timeout_ms == 0 {
        return Err(DbError::InvalidConfig {
            message: "read_timeout_ms must be > 0".into(),
        });
    }
    if config.blob_chunk_size == 0 {
        return Err(DbError::InvalidConfig {
            message: "blob_chunk_size must be > 0".into(),
        });
    }
    if config.blob_chunk_size > MAX_FRAME_BODY_BYTES / 2 {
        return Err(DbError::InvalidConfig {
            message: format!(
                "blob_chunk_size must be <= {} to fit WAL frame bounds",
                MAX_FRAME_BODY_BYTES / 2
            ),
        });
    }
    if config.max_batch_bytes == 0 || config.max_batch_bytes > MAX_FRAME_BODY_BYTES / 2 {
        return Err(DbError::InvalidConfig {
            message: format!(
                "max_batch_bytes must be > 0 and <= {}",
                MAX_FRAME_BODY_BYTES / 2
            ),
        });
    }
    Ok(())
}
