use crate::storage::DurabilityMode;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Table handle pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of handles checked out at once
    pub max_tables: usize,

    /// Number of idle handles created when the pool opens
    pub min_tables: usize,

    /// How long `take` waits for a free handle before failing
    pub acquire_timeout: Duration,

    /// Idle handles older than this are recycled instead of reused
    pub idle_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            max_tables: 32,
            min_tables: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
        }
    }

    /// Set maximum checked-out handles
    pub fn max_tables(mut self, max: usize) -> Self {
        self.max_tables = max;
        self
    }

    /// Set number of pre-created handles
    pub fn min_tables(mut self, min: usize) -> Self {
        self.min_tables = min;
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_tables == 0 {
            return Err("max_tables must be > 0".to_string());
        }

        if self.min_tables > self.max_tables {
            return Err("min_tables cannot exceed max_tables".to_string());
        }

        if self.acquire_timeout.is_zero() {
            return Err("acquire_timeout must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of one replicated table
///
/// The store for a partition lives at
/// `<work_directory>/<partition id>/journal/<store_file_stem>.{wal,snapshot}`.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Root directory shared by all partitions hosted by this process
    pub work_directory: PathBuf,

    /// File stem of the physical store files
    pub store_file_stem: String,

    /// When commits reach disk
    pub durability: DurabilityMode,

    /// WAL entries after which a flush compacts the store
    pub compaction_threshold: usize,

    /// Handle pool settings
    pub pool: PoolConfig,
}

impl TableConfig {
    pub fn new(work_directory: impl AsRef<Path>) -> Self {
        Self {
            work_directory: work_directory.as_ref().to_path_buf(),
            store_file_stem: "db".to_string(),
            durability: DurabilityMode::default(),
            compaction_threshold: 1000,
            pool: PoolConfig::default(),
        }
    }

    pub fn store_file_stem(mut self, stem: &str) -> Self {
        self.store_file_stem = stem.to_string();
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Directory holding the store of `partition_id`.
    pub fn partition_directory(&self, partition_id: &str) -> PathBuf {
        self.work_directory.join(partition_id).join("journal")
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.work_directory.as_os_str().is_empty() {
            return Err("work_directory cannot be empty".to_string());
        }

        if self.store_file_stem.is_empty()
            || self.store_file_stem.contains(['/', '\\'])
        {
            return Err("store_file_stem must be a plain file name".to_string());
        }

        if self.compaction_threshold == 0 {
            return Err("compaction_threshold must be > 0".to_string());
        }

        self.pool.validate()
    }
}
