//! Write-ahead persistence of store transactions.
//!
//! # Architecture
//!
//! ```text
//!  engine threads                       persist thread
//! ┌──────────────┐  push   ┌────────┐  take  ┌──────────────────────────┐
//! │ commit(ops)  │────────▶│ stream │───────▶│ frame record ─▶ ST file  │
//! └──────────────┘         └────────┘        │ forward ─▶ HA tx workers │
//!        ▲                                   │ file flip / gen tran     │
//!        │ rc                                └────────────┬─────────────┘
//! ┌──────┴───────┐          dispatch                      │
//! │ cb workers   │◀───────────────────────────────────────┘
//! └──────────────┘
//! ```
//!
//! On disk a node keeps one `PState` file and, per generation slot, two
//! checkpoint sets. A set is a management checkpoint (`CPM`), a generation
//! checkpoint (`CPG`) and the ST log written since (`ST`). Recovery loads
//! the set `PState` names and replays its log.

pub mod callbacks;
pub mod checkpoint;
pub mod files;
pub mod forward;
pub mod pipeline;
pub mod record;
pub mod recovery;
pub mod replay;
pub mod state;
pub mod stream;
pub mod transition;

pub use callbacks::CallbackPool;
pub use checkpoint::{read_checkpoint, write_checkpoint, CheckpointHeader};
pub use files::{FileKind, LogWriter, PersistDir};
pub use forward::Forwarder;
pub use pipeline::{PersistPipeline, PipelineStatus};
pub use record::{RecordHead, RecordReader, StopReason};
pub use recovery::{fresh_start, recover, Recovered, RecoveryReport};
pub use replay::{replay_log, ReplayStats};
pub use state::PState;
pub use stream::{encode_message, PersistStream, StreamLimits};
