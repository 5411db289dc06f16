//! Generation memory: the arena the replication and persistence layers read
//! from and apply operations to.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       MemoryStore                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐    │
//! │  │ mgmt gen (1) │  │   slot 0     │  │   slot 1     │    │
//! │  │ owners,      │  │ active or    │  │ next/closing │    │
//! │  │ states       │  │ closing gen  │  │ generation   │    │
//! │  └──────────────┘  └──────────────┘  └──────────────┘    │
//! │   MgmtHeader (gen map)   owner buckets   recovery images  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod generation;
pub mod layout;
pub mod lock;
pub mod store;

pub use generation::{GenHeader, GenState, Generation, PoolDesc};
pub use layout::{data_type, Descriptor, DESCRIPTOR_SIZE};
pub use lock::{StoreGate, StoreLock};
pub use store::{GenMapEntry, HaSyncState, MemoryStore, MgmtHeader, NoWriteBack, WriteBack, MGMT_SMALL_POOL};
