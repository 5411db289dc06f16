//! Disk task API consumed by replication and persistence.
//!
//! Generation files are written, read, compacted and deleted through
//! [`DiskTasks`]. Long-running tasks complete through callbacks; tasks marked
//! `cancel_on_term` are dropped with [`DiskError::Cancelled`] when the store
//! shuts down.
//!
//! [`DiskError::Cancelled`]: crate::error::DiskError::Cancelled

mod files;

pub use files::FileDiskTasks;

use crate::error::Result;
use crate::types::GenId;

/// Result of a completed generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGenInfo {
    pub gen_id: GenId,
    /// Size of the file after the task.
    pub size: u64,
}

/// Completion callback of an asynchronous disk task.
pub type DiskCallback = Box<dyn FnOnce(Result<DiskGenInfo>) + Send + 'static>;

/// Work executed on the disk worker by [`DiskTasks::run_task`]; returns the
/// number of bytes it wrote.
pub type DiskWork = Box<dyn FnOnce() -> Result<u64> + Send + 'static>;

/// Per-task parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskParams {
    pub gen_id: GenId,
    /// Drop the task instead of running it once termination started.
    pub cancel_on_term: bool,
    /// Higher runs first among queued tasks.
    pub priority: u8,
}

impl TaskParams {
    pub fn new(gen_id: GenId) -> Self {
        Self {
            gen_id,
            cancel_on_term: false,
            priority: 0,
        }
    }

    pub fn cancel_on_term(mut self) -> Self {
        self.cancel_on_term = true;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Asynchronous disk operations on generation files.
pub trait DiskTasks: Send + Sync {
    /// Write a compacted generation image.
    fn write_generation(&self, params: TaskParams, image: Vec<u8>, cb: DiskCallback);

    /// Read a generation image.
    fn read_generation(&self, gen_id: GenId) -> Result<Vec<u8>>;

    /// Rewrite a generation file keeping only granules live in `bitmaps`.
    fn compact_generation(&self, params: TaskParams, bitmaps: Vec<Vec<u8>>, cb: DiskCallback);

    /// Delete a generation file. Missing files are not an error.
    fn delete_generation(&self, gen_id: GenId) -> Result<()>;

    /// Size of a generation file, if it exists.
    fn generation_size(&self, gen_id: GenId) -> Result<Option<u64>>;

    /// Every generation file with its size.
    fn list_generations(&self) -> Result<Vec<DiskGenInfo>>;

    /// Run arbitrary file work on the disk worker.
    fn run_task(&self, params: TaskParams, work: DiskWork, cb: DiskCallback);

    /// Stop accepting tasks; cancel-on-term tasks are dropped, the rest run.
    fn terminate(&self);
}
