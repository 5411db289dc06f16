//! Generation-based object store with write-ahead persistence and
//! primary/standby replication.
//!
//! Objects live in fixed-size memory *generations*. One generation is active
//! for allocation at a time; a closed generation is written to disk as a
//! whole and evicted. Every change is committed as a store-transaction on a
//! *stream*: the persist thread appends it to the write-ahead log (ST file),
//! forwards it to the standby when one is attached, and completes the
//! caller's callback once both are done.
//!
//! # Example
//!
//! ```rust,no_run
//! use genstore::{StoreConfig, StoreEngine, StoreOp, data_type};
//! use std::time::Duration;
//!
//! fn main() -> genstore::Result<()> {
//!     let engine = StoreEngine::new(StoreConfig::new("./store"))?;
//!     let report = engine.start_primary()?;
//!     println!("cold start: {}", report.cold_start);
//!
//!     let stream = engine.open_stream(false)?;
//!     let handle = engine.allocate(0, 0, 0, b"hello")?;
//!     engine.commit_sync(
//!         stream,
//!         &[StoreOp::CreateRecord { handle, data_type: data_type::USER_BASE }],
//!         Duration::from_secs(5),
//!     )?;
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 StoreEngine                  │
//! │ start_primary / start_standby / promote      │
//! │ open_stream / allocate / commit / checkpoint │
//! └──────┬───────────────┬───────────────┬───────┘
//!        ▼               ▼               ▼
//! ┌────────────┐  ┌─────────────┐  ┌───────────┐
//! │  memory    │  │  persist    │  │    ha     │
//! │ generations│  │ ST log, CP  │  │ sync, fwd │
//! │ + mgmt gen │  │ recovery    │  │ receiver  │
//! └────────────┘  └─────────────┘  └───────────┘
//!        │               │               │
//!        ▼               ▼               ▼
//!   disk (gen files)  PState + sets   transport (local / TCP)
//! ```
//!
//! # Recovery
//!
//! A node that stopped cleanly or crashed restarts from the checkpoint set
//! named in its `PState` file and replays the ST log written since. Torn
//! records at the end of the log are dropped; everything before them is
//! applied. A standby keeps no log of its own and resynchronizes from the
//! primary instead.

pub mod codec;
pub mod config;
pub mod disk;
pub mod engine;
pub mod error;
pub mod ha;
pub mod memory;
pub mod metrics;
pub mod network;
pub mod persist;
pub mod testing;
pub mod types;

pub use config::{HaConfig, MemoryConfig, PersistConfig, PoolConfig, StoreConfig, ThreadPolicy};
pub use engine::StoreEngine;
pub use error::{Error, Result, ReturnCode};
pub use types::{
    CommitCallback, EventSink, GenId, GenToken, Handle, HaRole, NodeId, StoreEvent, StreamId,
};

pub use codec::RecordLayout;
pub use disk::{DiskTasks, FileDiskTasks};
pub use ha::{AdminClient, AdminHandler, HaContext, HaTransport, HaView, LocalTransport, StoreOp};
pub use memory::{data_type, MemoryStore, NoWriteBack, WriteBack};
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot, MetricsSnapshot, StoreMetrics};
pub use network::TcpTransport;
pub use persist::{PipelineStatus, RecoveryReport};
pub use testing::{FailpointAction, FailpointRegistry};
