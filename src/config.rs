//! Configuration types for the store engine.

use crate::codec::RecordLayout;
use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for async callback workers.
pub const MAX_ASYNC_THREADS: usize = 64;

/// Main configuration for a store engine.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Persistence pipeline configuration.
    pub persist: PersistConfig,

    /// Replication configuration.
    pub ha: HaConfig,

    /// Generation memory configuration.
    pub memory: MemoryConfig,
}

impl StoreConfig {
    /// Create a configuration rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            persist: PersistConfig::new(root),
            ..Default::default()
        }
    }

    /// Set persistence configuration.
    pub fn with_persist_config(mut self, persist: PersistConfig) -> Self {
        self.persist = persist;
        self
    }

    /// Set replication configuration.
    pub fn with_ha_config(mut self, ha: HaConfig) -> Self {
        self.ha = ha;
        self
    }

    /// Set memory configuration.
    pub fn with_memory_config(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.persist.validate()?;
        self.ha.validate()?;
        self.memory.validate()?;
        if self.ha.buffer_size > self.persist.stream_buffer_size {
            return Err(Error::Config(format!(
                "ha buffer size {} exceeds stream buffer size {}",
                self.ha.buffer_size, self.persist.stream_buffer_size
            )));
        }
        Ok(())
    }
}

/// How the persist thread wakes callers blocked on a completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPolicy {
    /// The persist thread broadcasts directly and yields between rounds.
    Yield,
    /// A dedicated signal thread does the wakeups.
    SignalThread,
    /// No dedicated wakeups; callers poll with short timed waits.
    None,
}

/// Persistence pipeline configuration.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Directory holding ST, checkpoint and PState files.
    pub root: PathBuf,

    /// Wakeup policy of the persist thread.
    pub thread_policy: ThreadPolicy,

    /// Number of async callback workers.
    pub async_threads: usize,

    /// Number of async callback workers reserved for high-performance streams.
    pub high_perf_threads: usize,

    /// Number of HA transmit threads.
    pub ha_tx_threads: usize,

    /// Ready-callback high watermark (raises `CbqAlertOn`).
    pub cb_hwm: usize,

    /// Per-stream pending buffer size in bytes.
    pub stream_buffer_size: usize,

    /// Maximum pending callbacks per stream before writers block.
    pub max_stream_callbacks: usize,

    /// Size at which an ST file is considered full and the file flip runs.
    pub file_size: u64,

    /// Disk transfer block size; records are padded to it.
    pub block_size: usize,

    /// Upper bound of one write batch.
    pub write_batch_size: usize,

    /// On-disk fragment layout.
    pub layout: RecordLayout,

    /// Compress checkpoint files with LZ4.
    pub compress_checkpoints: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./store"),
            thread_policy: ThreadPolicy::Yield,
            async_threads: 4,
            high_perf_threads: 1,
            ha_tx_threads: 1,
            cb_hwm: 64 * 1024,
            stream_buffer_size: 1024 * 1024,
            max_stream_callbacks: 1024,
            file_size: 64 * 1024 * 1024,
            block_size: 4096,
            write_batch_size: 4 * 1024 * 1024,
            layout: RecordLayout::Current,
            compress_checkpoints: true,
        }
    }
}

impl PersistConfig {
    /// Create a persistence configuration rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Set the wakeup policy.
    pub fn with_thread_policy(mut self, policy: ThreadPolicy) -> Self {
        self.thread_policy = policy;
        self
    }

    /// Set the number of async callback workers.
    pub fn with_async_threads(mut self, n: usize) -> Self {
        self.async_threads = n;
        self
    }

    /// Set the number of HA transmit threads.
    pub fn with_ha_tx_threads(mut self, n: usize) -> Self {
        self.ha_tx_threads = n;
        self
    }

    /// Set the callback high watermark.
    pub fn with_cb_hwm(mut self, hwm: usize) -> Self {
        self.cb_hwm = hwm;
        self
    }

    /// Set the per-stream buffer size.
    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    /// Set the ST file size.
    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = size;
        self
    }

    /// Set the disk block size.
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the record layout.
    pub fn with_layout(mut self, layout: RecordLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Ready-callback low watermark (clears `CbqAlertOn`).
    pub fn cb_lwm(&self) -> usize {
        (self.cb_hwm / 16).max(1)
    }

    /// Workers serving normal (not high-performance) streams.
    pub fn normal_threads(&self) -> usize {
        self.async_threads.saturating_sub(self.high_perf_threads).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.async_threads == 0 || self.async_threads > MAX_ASYNC_THREADS {
            return Err(Error::Config(format!(
                "async threads must be in 1..={}, got {}",
                MAX_ASYNC_THREADS, self.async_threads
            )));
        }
        if self.high_perf_threads >= self.async_threads && self.async_threads > 1 {
            return Err(Error::Config(
                "high performance threads must leave at least one normal worker".into(),
            ));
        }
        if self.ha_tx_threads == 0 {
            return Err(Error::Config("at least one HA transmit thread is required".into()));
        }
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(Error::Config(format!(
                "block size must be a power of two >= 512, got {}",
                self.block_size
            )));
        }
        if self.stream_buffer_size < 4096 {
            return Err(Error::Config("stream buffer size must be at least 4096".into()));
        }
        if self.write_batch_size < self.stream_buffer_size {
            return Err(Error::Config(
                "write batch size must hold at least one stream buffer".into(),
            ));
        }
        if self.cb_hwm == 0 {
            return Err(Error::Config("callback high watermark must be positive".into()));
        }
        Ok(())
    }
}

/// Replication configuration.
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// Whether replication is enabled at all.
    pub enabled: bool,

    /// Fragments a sender may have outstanding before it waits for an ack.
    pub tx_q_depth: u32,

    /// Whether the flow-control window is enforced.
    pub flow_control: bool,

    /// Maximum fragment size including the header.
    pub buffer_size: usize,

    /// Memory budget for generations in flight during sync.
    pub sync_max_mem: u64,

    /// Time the sync spends on disk generations before locking the store.
    pub sync_max_time: Duration,

    /// Store-lock attempts during sync before the node shuts down.
    pub lock_attempts: u32,

    /// Timeout of one store-lock attempt.
    pub lock_timeout: Duration,

    /// Poll interval used while the admin channel is busy.
    pub admin_poll: Duration,

    /// Bound on one blocking ack wait.
    pub ack_timeout: Duration,

    /// Whether sync completion waits for the admin layer's state transfer.
    pub admin_transfer: bool,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tx_q_depth: 64,
            flow_control: true,
            buffer_size: 64 * 1024,
            sync_max_mem: 256 * 1024 * 1024,
            sync_max_time: Duration::from_secs(600),
            lock_attempts: 3,
            lock_timeout: Duration::from_millis(3300),
            admin_poll: Duration::from_millis(10),
            ack_timeout: Duration::from_secs(30),
            admin_transfer: false,
        }
    }
}

impl HaConfig {
    /// Enabled replication with default settings.
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Set the flow-control window.
    pub fn with_tx_q_depth(mut self, depth: u32) -> Self {
        self.tx_q_depth = depth;
        self
    }

    /// Enable or disable flow control.
    pub fn with_flow_control(mut self, enabled: bool) -> Self {
        self.flow_control = enabled;
        self
    }

    /// Set the fragment buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the sync memory budget.
    pub fn with_sync_max_mem(mut self, bytes: u64) -> Self {
        self.sync_max_mem = bytes;
        self
    }

    /// Set the sync time budget.
    pub fn with_sync_max_time(mut self, d: Duration) -> Self {
        self.sync_max_time = d;
        self
    }

    /// Set the store-lock retry policy used by sync.
    pub fn with_lock_policy(mut self, attempts: u32, timeout: Duration) -> Self {
        self.lock_attempts = attempts;
        self.lock_timeout = timeout;
        self
    }

    /// Set the blocking ack wait bound.
    pub fn with_ack_timeout(mut self, d: Duration) -> Self {
        self.ack_timeout = d;
        self
    }

    /// Gate sync completion on the admin layer's state transfer.
    pub fn with_admin_transfer(mut self, enabled: bool) -> Self {
        self.admin_transfer = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.tx_q_depth == 0 {
            return Err(Error::Config("tx queue depth must be positive".into()));
        }
        if self.buffer_size < 1024 {
            return Err(Error::Config(format!(
                "ha buffer size must be at least 1024, got {}",
                self.buffer_size
            )));
        }
        if self.lock_attempts == 0 {
            return Err(Error::Config("lock attempts must be positive".into()));
        }
        Ok(())
    }
}

/// Granule pool layout of one generation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Granule size in bytes, including the descriptor.
    pub granule_size: u32,

    /// Share of the generation's pool area, in percent.
    pub percent: u8,
}

/// Generation memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Size of each in-memory data generation.
    pub gen_size: u64,

    /// Size of the management generation.
    pub mgmt_size: u64,

    /// Pools of data generations. Pool 0 holds reference chunks.
    pub gen_pools: Vec<PoolConfig>,

    /// Pools of the management generation. Pool 1 is the small pool.
    pub mgmt_pools: Vec<PoolConfig>,

    /// Number of owner-bucket mutexes.
    pub lock_count: usize,

    /// References per reference chunk.
    pub refs_per_chunk: u32,

    /// States per state chunk.
    pub states_per_chunk: u16,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            gen_size: 16 * 1024 * 1024,
            mgmt_size: 8 * 1024 * 1024,
            gen_pools: vec![
                PoolConfig { granule_size: 512, percent: 60 },
                PoolConfig { granule_size: 2048, percent: 40 },
            ],
            mgmt_pools: vec![
                PoolConfig { granule_size: 512, percent: 70 },
                PoolConfig { granule_size: 128, percent: 30 },
            ],
            lock_count: 1024,
            refs_per_chunk: 24,
            states_per_chunk: 48,
        }
    }
}

impl MemoryConfig {
    /// A compact layout for tests and embedded use.
    pub fn small() -> Self {
        Self {
            gen_size: 256 * 1024,
            mgmt_size: 256 * 1024,
            lock_count: 64,
            refs_per_chunk: 8,
            states_per_chunk: 16,
            ..Default::default()
        }
    }

    /// Set the data generation size.
    pub fn with_gen_size(mut self, size: u64) -> Self {
        self.gen_size = size;
        self
    }

    /// Set the management generation size.
    pub fn with_mgmt_size(mut self, size: u64) -> Self {
        self.mgmt_size = size;
        self
    }

    /// Set the owner-bucket mutex count.
    pub fn with_lock_count(mut self, n: usize) -> Self {
        self.lock_count = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_count == 0 {
            return Err(Error::Config("lock count must be positive".into()));
        }
        for (what, pools) in [("gen", &self.gen_pools), ("mgmt", &self.mgmt_pools)] {
            if pools.len() < 2 {
                return Err(Error::Config(format!("{} generation needs two pools", what)));
            }
            let total: u32 = pools.iter().map(|p| p.percent as u32).sum();
            if total > 100 {
                return Err(Error::Config(format!(
                    "{} pool shares add up to {}%",
                    what, total
                )));
            }
            if pools.iter().any(|p| p.granule_size < 128 || p.granule_size % 8 != 0) {
                return Err(Error::Config(format!(
                    "{} granule sizes must be multiples of 8 and at least 128",
                    what
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert!(!config.ha.enabled);
        assert_eq!(config.persist.thread_policy, ThreadPolicy::Yield);
        assert_eq!(config.ha.lock_attempts, 3);
        assert_eq!(config.ha.lock_timeout, Duration::from_millis(3300));
        assert_eq!(config.ha.sync_max_time, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::new("/tmp/store")
            .with_ha_config(HaConfig::new().with_tx_q_depth(8).with_sync_max_mem(1024))
            .with_memory_config(MemoryConfig::small());

        assert_eq!(config.persist.root, PathBuf::from("/tmp/store"));
        assert!(config.ha.enabled);
        assert_eq!(config.ha.tx_q_depth, 8);
        assert_eq!(config.ha.sync_max_mem, 1024);
        assert_eq!(config.memory.gen_size, 256 * 1024);
    }

    #[test]
    fn test_watermarks() {
        let config = PersistConfig::default().with_cb_hwm(64);
        assert_eq!(config.cb_lwm(), 4);
        let config = PersistConfig::default().with_cb_hwm(3);
        assert_eq!(config.cb_lwm(), 1);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(PersistConfig::default().with_async_threads(0).validate().is_err());
        assert!(PersistConfig::default().with_async_threads(65).validate().is_err());
        assert!(PersistConfig::default().with_block_size(1000).validate().is_err());
        assert!(HaConfig::new().with_tx_q_depth(0).validate().is_err());
        assert!(MemoryConfig::default().with_lock_count(0).validate().is_err());
    }
}
