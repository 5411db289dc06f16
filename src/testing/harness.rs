//! Engines over temporary directories, alone or as a primary/standby pair
//! joined by the in-process transport.

use crate::config::{HaConfig, MemoryConfig, PersistConfig, StoreConfig};
use crate::engine::StoreEngine;
use crate::error::{DiskError, Result};
use crate::ha::ops::StoreOp;
use crate::ha::transport::{HaTransport, LocalTransport};
use crate::memory::{data_type, NoWriteBack};
use crate::testing::failpoint::FailpointRegistry;
use crate::types::{Handle, StreamId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub(crate) const WAIT: Duration = Duration::from_secs(10);

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub(crate) fn store_config(root: &Path) -> StoreConfig {
    StoreConfig::new(root)
        .with_persist_config(
            PersistConfig::new(root)
                .with_block_size(512)
                .with_async_threads(2)
                .with_ha_tx_threads(2),
        )
        .with_ha_config(HaConfig::new().with_buffer_size(4096).with_ack_timeout(Duration::from_secs(5)))
        .with_memory_config(MemoryConfig::small())
}

/// One engine with its own failpoints.
pub(crate) struct Node {
    pub engine: Arc<StoreEngine>,
    pub failpoints: Arc<FailpointRegistry>,
    pub root: PathBuf,
}

impl Node {
    pub fn open(config: StoreConfig) -> Result<Self> {
        let failpoints = Arc::new(FailpointRegistry::new());
        let root = config.persist.root.clone();
        let engine = Arc::new(StoreEngine::with_parts(
            config,
            failpoints.clone(),
            None,
            Arc::new(NoWriteBack),
        )?);
        Ok(Self {
            engine,
            failpoints,
            root,
        })
    }

    pub fn primary(config: StoreConfig) -> Result<Self> {
        let node = Self::open(config)?;
        node.engine.start_primary()?;
        Ok(node)
    }

    /// Allocate and commit a record, waiting for its callback.
    pub fn create_record(&self, stream: StreamId, fill: u8, len: usize) -> Result<Handle> {
        let h = self.engine.allocate(0, fill as u64, 0, &vec![fill; len])?;
        self.engine.commit_sync(
            stream,
            &[StoreOp::CreateRecord {
                handle: h,
                data_type: data_type::USER_BASE,
            }],
            WAIT,
        )?;
        Ok(h)
    }

    pub fn set_state(&self, stream: StreamId, handle: Handle, state: u64) -> Result<()> {
        self.engine
            .commit_sync(stream, &[StoreOp::UpdateRecordState { handle, state }], WAIT)
    }
}

/// A primary replicating to a standby.
pub(crate) struct Pair {
    pub primary: Node,
    pub standby: Node,
    pub primary_link: Arc<LocalTransport>,
    pub standby_link: Arc<LocalTransport>,
    _dirs: (TempDir, TempDir),
}

impl Pair {
    pub fn start() -> Result<Self> {
        Self::start_with(|c| c)
    }

    /// Start both nodes, adjusting each config with `tune`, and wait for
    /// the sync to finish.
    pub fn start_with(tune: impl Fn(StoreConfig) -> StoreConfig) -> Result<Self> {
        init_tracing();
        let pd = TempDir::new().map_err(DiskError::Io)?;
        let primary = Node::primary(tune(store_config(pd.path())))?;
        Self::join(primary, pd, tune)
    }

    /// Bring up a standby next to a running primary and sync it.
    pub fn join(primary: Node, primary_dir: TempDir, tune: impl Fn(StoreConfig) -> StoreConfig) -> Result<Self> {
        let sd = TempDir::new().map_err(DiskError::Io)?;
        let standby = Node::open(tune(store_config(sd.path())))?;
        let (primary_link, standby_link) = LocalTransport::pair();
        standby.engine.start_standby(standby_link.clone(), None)?;
        primary.engine.attach_standby(primary_link.clone())?;
        let pair = Self {
            primary,
            standby,
            primary_link,
            standby_link,
            _dirs: (primary_dir, sd),
        };
        assert!(pair.primary.engine.wait_standby(WAIT), "standby did not attach");
        assert!(pair.standby.engine.wait_synced(WAIT), "standby did not sync");
        Ok(pair)
    }

    /// Replace the standby with a fresh engine over the same directory.
    pub fn restart_standby(&mut self) -> Result<()> {
        self.standby.engine.shutdown();
        self.standby_link.disconnect();
        let config = store_config(&self.standby.root);
        self.standby = Node::open(config)?;
        let (primary_link, standby_link) = LocalTransport::pair();
        self.standby.engine.start_standby(standby_link.clone(), None)?;
        self.primary.engine.attach_standby(primary_link.clone())?;
        self.primary_link = primary_link;
        self.standby_link = standby_link;
        assert!(self.primary.engine.wait_standby(WAIT), "standby did not attach");
        assert!(self.standby.engine.wait_synced(WAIT), "standby did not sync");
        Ok(())
    }

    /// Everything committed so far is applied on the standby.
    pub fn settle(&self) -> Result<()> {
        self.primary.engine.flush(true, WAIT)
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.primary.engine.shutdown();
        self.standby.engine.shutdown();
    }
}
