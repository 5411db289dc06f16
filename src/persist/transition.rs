//! File flips and generation transitions.
//!
//! Both run on the persist thread as state machines stepped between write
//! rounds. Each one takes the store lock without blocking, drains every
//! stream into the current ST file, snapshots memory into the other
//! checkpoint set and switches `PState` once the checkpoint files are
//! durable. The lock is held from the drain until the switch.
//!
//! ```text
//! FileFlip:  Idle ─▶ Lock ─▶ (drain, snapshot) ─▶ Await ─▶ (PState, new ST) ─▶ Idle
//! GenTran:   Idle ─▶ Lock ─▶ (drain, new gen, snapshot) ─▶ Await ─▶ (PState, write old gen) ─▶ Idle
//! ```
//!
//! A generation transition leaves `genTr` set. The old generation is
//! written by the disk tasks; once that completes a file flip evicts it,
//! tells the standby and clears `genTr`.

use crate::disk::{DiskGenInfo, TaskParams};
use crate::error::{DiskError, Error, Result};
use crate::ha::gen_msg::{GenMessage, MapKind};
use crate::ha::message::MsgType;
use crate::memory::{GenState, MemoryStore, StoreLock};
use crate::persist::checkpoint::write_checkpoint;
use crate::persist::files::{FileKind, LogWriter, PersistDir};
use crate::persist::pipeline::{Injected, Persister, Round, Shared};
use crate::testing::failpoint::points;
use crate::types::{GenId, MGMT_GEN_ID};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LOCK_RETRY: Duration = Duration::from_millis(300);
const LOCK_WARN_EVERY: u32 = 10;
const CHECKPOINT_PRIORITY: u8 = 8;

/// Memory images that make up one checkpoint pair.
#[derive(Debug)]
pub struct SetImage {
    pub mgmt: Vec<u8>,
    pub gen_id: GenId,
    pub gen: Vec<u8>,
}

impl SetImage {
    /// Snapshot the management generation and the active generation.
    /// Callers hold the store lock.
    pub fn capture(store: &MemoryStore) -> Result<Self> {
        let (gen_id, _) = store.active();
        Self::capture_gen(store, gen_id)
    }

    /// Same, for any resident generation.
    pub fn capture_gen(store: &MemoryStore, gen_id: GenId) -> Result<Self> {
        Ok(Self {
            mgmt: store.mgmt_image()?,
            gen_id,
            gen: store.compact(gen_id)?,
        })
    }
}

/// Write a checkpoint pair and sync it.
pub fn write_set(dir: &PersistDir, slot: u8, file: u8, cycle_id: u32, image: &SetImage, compress: bool) -> Result<()> {
    write_checkpoint(
        &dir.path(FileKind::MgmtCheckpoint, slot, file),
        cycle_id,
        MGMT_GEN_ID,
        &image.mgmt,
        compress,
    )?;
    write_checkpoint(
        &dir.path(FileKind::GenCheckpoint, slot, file),
        cycle_id,
        image.gen_id,
        &image.gen,
        compress,
    )?;
    debug!(slot, file, cycle_id, "checkpoint set written");
    Ok(())
}

/// Checkpoint files being written by the disk tasks.
pub(crate) struct CheckpointJob {
    pending: AtomicUsize,
    failed: Mutex<Option<Error>>,
}

impl CheckpointJob {
    fn start(shared: &Arc<Shared>, slot: u8, file: u8, cycle_id: u32, image: SetImage) -> Arc<Self> {
        let job = Arc::new(Self {
            pending: AtomicUsize::new(2),
            failed: Mutex::new(None),
        });
        let compress = shared.config.compress_checkpoints;
        let parts = [
            (FileKind::MgmtCheckpoint, MGMT_GEN_ID, image.mgmt),
            (FileKind::GenCheckpoint, image.gen_id, image.gen),
        ];
        for (kind, gen_id, bytes) in parts {
            let path = shared.dir.path(kind, slot, file);
            let failpoints = shared.ctx.failpoints.clone();
            let work = Box::new(move || -> Result<u64> {
                crate::fail_point!(failpoints, points::CHECKPOINT_WRITE, return Err(DiskError::Fatal.into()));
                write_checkpoint(&path, cycle_id, gen_id, &bytes, compress).map(|info| info.file_size)
            });
            let (job2, shared2) = (job.clone(), shared.clone());
            let cb = Box::new(move |res: Result<DiskGenInfo>| {
                if let Err(e) = res {
                    error!(?kind, slot, file, error = %e, "checkpoint write failed");
                    job2.failed.lock().get_or_insert(e);
                }
                job2.pending.fetch_sub(1, Ordering::AcqRel);
                shared2.kick();
            });
            shared
                .ctx
                .disk
                .run_task(TaskParams::new(gen_id).with_priority(CHECKPOINT_PRIORITY), work, cb);
        }
        job
    }

    fn is_done(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    fn take_error(&self) -> Option<Error> {
        self.failed.lock().take()
    }
}

/// The old generation reached disk and can leave memory.
#[derive(Debug)]
pub(crate) struct WrittenGen {
    pub gen_id: GenId,
    pub index: u8,
    pub size: u64,
    pub free_maps: Vec<Vec<u8>>,
}

/// Checkpoint set a transition switches to.
pub(crate) struct NextSet {
    slot: u8,
    file: u8,
    cycle_id: u32,
    log: LogWriter,
    job: Arc<CheckpointJob>,
}

pub(crate) enum FileFlip {
    Idle,
    Lock {
        attempts: u32,
        next_try: Instant,
        written: Option<WrittenGen>,
    },
    Await {
        lock: StoreLock,
        next: NextSet,
        clear_gen_tr: bool,
    },
}

pub(crate) enum GenTran {
    Idle,
    Lock {
        attempts: u32,
        next_try: Instant,
    },
    Await {
        lock: StoreLock,
        next: NextSet,
        old_gen: GenId,
        old_index: u8,
    },
}

/// One non-blocking lock attempt of a transition.
fn try_lock(shared: &Shared, attempts: &mut u32, next_try: &mut Instant, what: &str) -> Option<StoreLock> {
    let now = Instant::now();
    if now < *next_try {
        return None;
    }
    match shared.ctx.store.gate().try_lock() {
        Some(lock) => Some(lock),
        None => {
            *attempts += 1;
            *next_try = now + LOCK_RETRY;
            if *attempts % LOCK_WARN_EVERY == 0 {
                warn!(attempts = *attempts, "{} still waiting for the store lock", what);
            }
            None
        }
    }
}

impl Persister {
    pub(crate) fn transitions_idle(&self) -> bool {
        matches!(self.flip, FileFlip::Idle) && matches!(self.gen_tran, GenTran::Idle)
    }

    pub(crate) fn start_file_flip(&mut self, written: Option<WrittenGen>) {
        debug!(evict = ?written.as_ref().map(|w| w.gen_id), "file flip started");
        self.flip = FileFlip::Lock {
            attempts: 0,
            next_try: Instant::now(),
            written,
        };
    }

    pub(crate) fn start_gen_tran(&mut self) {
        debug!("generation transition started");
        self.gen_tran = GenTran::Lock {
            attempts: 0,
            next_try: Instant::now(),
        };
    }

    /// Advance whichever transition is running.
    pub(crate) fn step_transitions(&mut self) -> Result<()> {
        self.step_flip()?;
        self.step_gen_tran()
    }

    fn step_flip(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.flip, FileFlip::Idle) {
            FileFlip::Idle => {}
            FileFlip::Lock {
                mut attempts,
                mut next_try,
                written,
            } => match try_lock(&self.shared, &mut attempts, &mut next_try, "file flip") {
                Some(lock) => {
                    let clear_gen_tr = written.is_some();
                    if let Some(w) = written {
                        self.finish_gen_write(w)?;
                    }
                    if !self.drain()? {
                        return Ok(());
                    }
                    let slot = self.pstate.start_gen;
                    let file = self.pstate.current_file() ^ 1;
                    let next = self.begin_set(slot, file)?;
                    self.flip = FileFlip::Await {
                        lock,
                        next,
                        clear_gen_tr,
                    };
                }
                None => {
                    self.flip = FileFlip::Lock {
                        attempts,
                        next_try,
                        written,
                    }
                }
            },
            FileFlip::Await {
                lock,
                next,
                clear_gen_tr,
            } => {
                if !next.job.is_done() {
                    self.flip = FileFlip::Await {
                        lock,
                        next,
                        clear_gen_tr,
                    };
                    return Ok(());
                }
                let slot = next.slot;
                let file = next.file;
                if !self.commit_set(next, |p| {
                    p.start_file[slot as usize] = file;
                    if clear_gen_tr {
                        p.gen_tr = false;
                    }
                })? {
                    return Ok(());
                }
                if clear_gen_tr {
                    self.shared.gen_tr.store(false, Ordering::Release);
                }
                drop(lock);
                info!(
                    slot,
                    file,
                    cycle_id = self.pstate.cycle_id,
                    gen_tr = self.pstate.gen_tr,
                    "file flip complete"
                );
            }
        }
        Ok(())
    }

    fn step_gen_tran(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.gen_tran, GenTran::Idle) {
            GenTran::Idle => {}
            GenTran::Lock {
                mut attempts,
                mut next_try,
            } => match try_lock(&self.shared, &mut attempts, &mut next_try, "generation transition") {
                Some(lock) => {
                    if !self.drain()? {
                        return Ok(());
                    }
                    let (old_gen, old_index) = match self.activate_next_generation() {
                        Ok(v) => v,
                        Err(e @ Error::NotAvailable(_)) => {
                            warn!(error = %e, "generation transition skipped");
                            self.shared.gen_tr.store(false, Ordering::Release);
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    };
                    let slot = old_index ^ 1;
                    let file = self.pstate.start_file[slot as usize] ^ 1;
                    let next = self.begin_set(slot, file)?;
                    self.gen_tran = GenTran::Await {
                        lock,
                        next,
                        old_gen,
                        old_index,
                    };
                }
                None => self.gen_tran = GenTran::Lock { attempts, next_try },
            },
            GenTran::Await {
                lock,
                next,
                old_gen,
                old_index,
            } => {
                if !next.job.is_done() {
                    self.gen_tran = GenTran::Await {
                        lock,
                        next,
                        old_gen,
                        old_index,
                    };
                    return Ok(());
                }
                let slot = next.slot;
                let file = next.file;
                if !self.commit_set(next, |p| {
                    p.start_gen = slot;
                    p.start_file[slot as usize] = file;
                    p.gen_tr = true;
                })? {
                    return Ok(());
                }
                let image = self.shared.ctx.store.compact(old_gen)?;
                let free_maps = free_maps(&self.shared.ctx.store, old_gen)?;
                drop(lock);
                info!(old_gen, slot, file, cycle_id = self.pstate.cycle_id, "generation transition complete");
                self.shared.schedule_gen_write(old_gen, old_index, image, free_maps);
            }
        }
        Ok(())
    }

    /// Write everything pending. `false` when the thread is going down.
    fn drain(&mut self) -> Result<bool> {
        loop {
            match self.write_round()? {
                Round::Wrote => continue,
                Round::Idle => return Ok(true),
                Round::Crashed => return Ok(false),
            }
        }
    }

    /// Create the next generation in the other slot and activate it.
    fn activate_next_generation(&mut self) -> Result<(GenId, u8)> {
        let store = &self.shared.ctx.store;
        let (old_gen, old_index) = store.active();
        let index = old_index ^ 1;
        if let Some(busy) = store.with_slot(index, |g| g.map(|g| g.id())) {
            return Err(Error::NotAvailable(format!(
                "slot {} still holds generation {}",
                index, busy
            )));
        }
        let gen_id = store.header().next_gen_id;
        store.create_generation(index, gen_id)?;
        store.activate_generation(gen_id, index)?;
        store.set_gen_state(old_gen, GenState::WritePending)?;
        info!(old_gen, gen_id, index, "new generation active");

        if let Some(fwd) = self.shared.forwarder() {
            let header = store.with_gen(gen_id, |g| Ok(g.header().clone()))?;
            let mgmt = store.header_snapshot();
            let create = GenMessage::new(gen_id, index)
                .with_gen_header(header)
                .with_mgmt_header(mgmt.clone());
            let res = fwd
                .send_gen(MsgType::CreateGen, create)
                .and_then(|_| fwd.send_gen(MsgType::ActivateGen, GenMessage::new(gen_id, index).with_mgmt_header(mgmt)));
            if let Err(e) = res {
                fwd.mark_lost(&e);
            }
        }
        Ok((old_gen, old_index))
    }

    /// Evict a written generation and tell the standby to write its copy.
    fn finish_gen_write(&mut self, w: WrittenGen) -> Result<()> {
        let store = &self.shared.ctx.store;
        store.evict(w.gen_id, w.size)?;
        info!(gen_id = w.gen_id, size = w.size, "generation evicted");
        if let Some(fwd) = self.shared.forwarder() {
            let msg = GenMessage::new(w.gen_id, w.index)
                .with_maps(MapKind::Free, w.free_maps)
                .with_mgmt_header(store.header_snapshot());
            fwd.post_gen(MsgType::WriteGen, msg);
        }
        Ok(())
    }

    /// Snapshot memory and start writing it as set `(slot, file)`.
    fn begin_set(&mut self, slot: u8, file: u8) -> Result<NextSet> {
        let cycle_id = self.pstate.cycle_id + 1;
        let image = SetImage::capture(&self.shared.ctx.store)?;
        let log = LogWriter::create(&self.shared.dir, slot, file, cycle_id)?;
        let job = CheckpointJob::start(&self.shared, slot, file, cycle_id, image);
        Ok(NextSet {
            slot,
            file,
            cycle_id,
            log,
            job,
        })
    }

    /// Switch `PState` and the ST file to a completed set. `false` when a
    /// simulated crash stopped the switch.
    fn commit_set(&mut self, next: NextSet, update: impl FnOnce(&mut crate::persist::state::PState)) -> Result<bool> {
        if let Some(e) = next.job.take_error() {
            return Err(e);
        }
        match self.shared.injected(points::CHECKPOINT_BEFORE_PSTATE) {
            Injected::Continue => {}
            Injected::Crash => {
                self.shared.crash();
                return Ok(false);
            }
            Injected::Fail => return Err(DiskError::Fatal.into()),
        }
        let mut pstate = self.pstate.clone();
        pstate.cycle_id = next.cycle_id;
        update(&mut pstate);
        pstate.store(&self.shared.dir.pstate())?;
        self.pstate = pstate;
        self.log = next.log;
        self.shared.ctx.metrics.checkpoints_written.inc();
        Ok(true)
    }
}

/// Free-granule bitmaps of every pool of a generation.
pub(crate) fn free_maps(store: &MemoryStore, gen_id: GenId) -> Result<Vec<Vec<u8>>> {
    store.with_gen(gen_id, |g| (0..g.pool_count()).map(|p| g.free_bitmap(p as u8)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::{data_type, NoWriteBack};
    use crate::persist::checkpoint::read_checkpoint;
    use tempfile::TempDir;

    #[test]
    fn test_write_set_round_trip() {
        let tmp = TempDir::new().unwrap();
        let dir = PersistDir::open(tmp.path()).unwrap();
        let store = MemoryStore::new(MemoryConfig::small(), Arc::new(NoWriteBack)).unwrap();
        let gen = store.bootstrap().unwrap();
        store
            .allocate(gen, 0, data_type::USER_BASE, 0, 0, b"checkpointed")
            .unwrap();

        let image = SetImage::capture(&store).unwrap();
        write_set(&dir, 1, 0, 9, &image, true).unwrap();

        let (mgmt_header, mgmt) = read_checkpoint(&dir.path(FileKind::MgmtCheckpoint, 1, 0)).unwrap();
        assert_eq!(mgmt_header.cycle_id, 9);
        assert_eq!(mgmt_header.gen_id, MGMT_GEN_ID);
        assert_eq!(mgmt, image.mgmt);
        let (gen_header, body) = read_checkpoint(&dir.path(FileKind::GenCheckpoint, 1, 0)).unwrap();
        assert_eq!(gen_header.gen_id, gen);
        assert_eq!(body, image.gen);
    }

    #[test]
    fn test_free_maps_cover_every_pool() {
        let store = MemoryStore::new(MemoryConfig::small(), Arc::new(NoWriteBack)).unwrap();
        let gen = store.bootstrap().unwrap();
        let pools = store.with_gen(gen, |g| Ok(g.pool_count())).unwrap();
        assert_eq!(free_maps(&store, gen).unwrap().len(), pools);
    }
}
