//! Startup of the persistence layer: cold start or replay of the last
//! checkpoint set.
//!
//! A warm start loads the checkpoint pair named by `PState` and replays
//! its ST file. When `genTr` is set the previous generation slot is
//! restored first from its own set, since its generation file may not
//! exist yet. Either way the recovered memory is written as a fresh
//! checkpoint set before the store accepts work, so the next crash never
//! depends on a log written by an earlier run.

use crate::codec::RecordLayout;
use crate::config::PersistConfig;
use crate::disk::DiskTasks;
use crate::error::{DiskError, Result};
use crate::memory::{GenState, Generation, MemoryStore};
use crate::persist::checkpoint::read_checkpoint;
use crate::persist::files::{FileKind, LogWriter, PersistDir};
use crate::persist::replay::{replay_log, ReplayStats};
use crate::persist::state::PState;
use crate::persist::transition::{write_set, SetImage};
use crate::types::{GenId, StreamId};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What recovery found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub cold_start: bool,
    /// The previous run recorded a clean stop.
    pub clean_stop: bool,
    /// A generation transition was still open.
    pub gen_transition: bool,
    /// One entry per replayed ST file, oldest first.
    pub replays: Vec<ReplayStats>,
    /// Generations the map places on disk whose files are missing.
    pub missing_generations: Vec<GenId>,
    /// Cycle the store runs in after recovery.
    pub cycle_id: u32,
}

/// Recovered state handed to the persist thread.
#[derive(Debug)]
pub struct Recovered {
    pub pstate: PState,
    pub log: LogWriter,
    pub layout: RecordLayout,
    /// Next `msgSqn` per stream seen in the replayed logs.
    pub next_msg_sqn: BTreeMap<StreamId, u64>,
    /// A resident generation whose write was interrupted.
    pub pending_write: Option<(GenId, u8)>,
    pub report: RecoveryReport,
}

/// Bring `store` to the last persisted state, or cold start it.
pub fn recover(store: &MemoryStore, disk: &dyn DiskTasks, dir: &PersistDir, config: &PersistConfig) -> Result<Recovered> {
    let previous = match PState::load(&dir.pstate())? {
        Some(p) if p.is_standby => {
            warn!("directory was last used by a standby, starting cold");
            None
        }
        other => other,
    };
    match previous {
        None => {
            store.bootstrap()?;
            let mut recovered = fresh_start(store, dir, config, None)?;
            recovered.report.cold_start = true;
            Ok(recovered)
        }
        Some(pstate) => warm_start(store, disk, dir, config, pstate),
    }
}

/// Persist the current memory as a new checkpoint set and open its ST
/// file. Used for cold starts and when a standby takes over.
pub fn fresh_start(
    store: &MemoryStore,
    dir: &PersistDir,
    config: &PersistConfig,
    previous: Option<&PState>,
) -> Result<Recovered> {
    let (_, slot) = store.active();
    let mut pstate = PState::new(config.layout);
    if let Some(prev) = previous {
        pstate.cycle_id = prev.cycle_id + 1;
        pstate.start_file = prev.start_file;
        pstate.start_file[slot as usize] ^= 1;
    }
    pstate.start_gen = slot;
    // A promoted standby may still hold a closed generation in memory.
    let pending_write = closing_generation(store).filter(|(_, index)| *index != slot);
    if let Some(closing) = pending_write {
        let cycle = pstate.cycle_id;
        checkpoint_closing(store, dir, config, &mut pstate, cycle, closing)?;
        pstate.gen_tr = true;
    }
    let file = pstate.current_file();
    let image = SetImage::capture(store)?;
    write_set(dir, slot, file, pstate.cycle_id, &image, config.compress_checkpoints)?;
    let log = LogWriter::create(dir, slot, file, pstate.cycle_id)?;
    pstate.mark_started();
    pstate.store(&dir.pstate())?;
    info!(cycle_id = pstate.cycle_id, slot, file, "persistence initialized");
    Ok(Recovered {
        report: RecoveryReport {
            cycle_id: pstate.cycle_id,
            ..Default::default()
        },
        layout: config.layout,
        pstate,
        log,
        next_msg_sqn: BTreeMap::new(),
        pending_write,
    })
}

fn warm_start(
    store: &MemoryStore,
    disk: &dyn DiskTasks,
    dir: &PersistDir,
    config: &PersistConfig,
    mut pstate: PState,
) -> Result<Recovered> {
    let layout = pstate.layout()?;
    let block = config.block_size;
    let cur = pstate.start_gen & 1;
    let cur_file = pstate.current_file();
    let mut report = RecoveryReport {
        clean_stop: pstate.clean_stop,
        gen_transition: pstate.gen_tr,
        ..Default::default()
    };
    let mut next_msg_sqn = BTreeMap::new();
    info!(
        cycle_id = pstate.cycle_id,
        slot = cur,
        file = cur_file,
        gen_tr = pstate.gen_tr,
        clean_stop = pstate.clean_stop,
        "recovering store"
    );

    let mut old_gen = None;
    if pstate.gen_tr {
        let prev = cur ^ 1;
        let prev_file = pstate.start_file[prev as usize];
        let cycle_id = load_set(store, dir, prev, prev_file)?;
        let stats = replay_log(store, &dir.read_log(prev, prev_file)?, cycle_id, block, layout)?;
        merge_sqns(&mut next_msg_sqn, &stats);
        report.replays.push(stats);
        old_gen = store.take_slot(prev).map(|g| (prev, g));
    }

    let cycle_id = load_set(store, dir, cur, cur_file)?;
    if cycle_id != pstate.cycle_id {
        warn!(pstate = pstate.cycle_id, checkpoint = cycle_id, "checkpoint cycle differs from PState");
    }
    if let Some((index, gen)) = old_gen {
        reinstall(store, index, gen)?;
    }
    let stats = replay_log(store, &dir.read_log(cur, cur_file)?, cycle_id, block, layout)?;
    merge_sqns(&mut next_msg_sqn, &stats);
    report.replays.push(stats);

    let pending_write = closing_generation(store);
    for (gen_id, entry) in &store.header_snapshot().gen_map {
        match (entry.mem_index, entry.state) {
            (None, GenState::WritePending | GenState::WriteCompleted) => {
                if disk.generation_size(*gen_id)?.is_none() {
                    warn!(gen_id, "generation file missing");
                    report.missing_generations.push(*gen_id);
                }
            }
            _ => {}
        }
    }

    let next_cycle = pstate.cycle_id.max(cycle_id) + 1;
    match pending_write {
        Some(closing) if pstate.gen_tr => {
            checkpoint_closing(store, dir, config, &mut pstate, next_cycle, closing)?;
        }
        None if pstate.gen_tr => {
            warn!("generation transition open without a closed generation in memory");
            pstate.gen_tr = false;
        }
        _ => {}
    }
    let next_file = cur_file ^ 1;
    let image = SetImage::capture(store)?;
    write_set(dir, cur, next_file, next_cycle, &image, config.compress_checkpoints)?;
    let log = LogWriter::create(dir, cur, next_file, next_cycle)?;
    pstate.start_file[cur as usize] = next_file;
    pstate.cycle_id = next_cycle;
    pstate.mark_started();
    pstate.store(&dir.pstate())?;
    report.cycle_id = next_cycle;
    info!(
        cycle_id = next_cycle,
        replayed = report.replays.iter().map(|r| r.messages).sum::<usize>(),
        pending_write = ?pending_write.map(|(g, _)| g),
        "store recovered"
    );

    Ok(Recovered {
        pstate,
        log,
        layout,
        next_msg_sqn,
        pending_write,
        report,
    })
}

/// A resident generation that was closed but not written yet.
fn closing_generation(store: &MemoryStore) -> Option<(GenId, u8)> {
    store
        .header()
        .gen_map
        .iter()
        .find_map(|(gen_id, e)| match (e.mem_index, e.state) {
            (Some(index), GenState::WritePending) => Some((*gen_id, index)),
            _ => None,
        })
}

/// Rewrite the set of a closed generation's slot with its current content
/// and an empty log. Operations on it are logged in the active slot's ST
/// file, so its old set goes stale once that file is replaced.
fn checkpoint_closing(
    store: &MemoryStore,
    dir: &PersistDir,
    config: &PersistConfig,
    pstate: &mut PState,
    cycle_id: u32,
    (gen_id, index): (GenId, u8),
) -> Result<()> {
    let file = pstate.start_file[index as usize] ^ 1;
    let image = SetImage::capture_gen(store, gen_id)?;
    write_set(dir, index, file, cycle_id, &image, config.compress_checkpoints)?;
    LogWriter::create(dir, index, file, cycle_id)?;
    pstate.start_file[index as usize] = file;
    debug!(gen_id, slot = index, file, "closed generation checkpointed");
    Ok(())
}

/// Load a checkpoint pair into memory. Returns the cycle its ST file was
/// written in.
fn load_set(store: &MemoryStore, dir: &PersistDir, slot: u8, file: u8) -> Result<u32> {
    let (mgmt_header, mgmt) = read_checkpoint(&dir.path(FileKind::MgmtCheckpoint, slot, file))?;
    store.load_mgmt_image(&mgmt)?;
    let path = dir.path(FileKind::GenCheckpoint, slot, file);
    let (gen_header, image) = read_checkpoint(&path)?;
    let gen = Generation::expand(&image)?;
    if gen.id() != gen_header.gen_id {
        return Err(DiskError::Corrupt {
            file: path.display().to_string(),
            reason: format!("holds generation {}, header says {}", gen.id(), gen_header.gen_id),
        }
        .into());
    }
    reinstall(store, slot, gen)?;
    Ok(mgmt_header.cycle_id)
}

/// Put a generation back into its slot with the state the map records.
fn reinstall(store: &MemoryStore, index: u8, gen: Generation) -> Result<()> {
    let gen_id = gen.id();
    let state = store.header().gen_map.get(&gen_id).map(|e| e.state);
    store.install(index, gen)?;
    if let Some(state) = state {
        store.set_gen_state(gen_id, state)?;
    }
    Ok(())
}

fn merge_sqns(into: &mut BTreeMap<StreamId, u64>, stats: &ReplayStats) {
    for (stream, next) in &stats.next_msg_sqn {
        let e = into.entry(*stream).or_insert(0);
        *e = (*e).max(*next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::disk::FileDiskTasks;
    use crate::ha::message::MsgType;
    use crate::ha::ops::{Operation, StoreOp};
    use crate::memory::{data_type, NoWriteBack};
    use crate::persist::record::{frame_record, RecordHead};
    use crate::persist::stream::{encode_message, PersistStream, StreamLimits, StreamShared};
    use crate::types::Handle;
    use bytes::BytesMut;
    use std::sync::Arc;
    use tempfile::TempDir;

    const BLOCK: usize = 512;

    fn config(tmp: &TempDir) -> PersistConfig {
        PersistConfig::new(tmp.path().join("wal")).with_block_size(BLOCK)
    }

    fn store() -> MemoryStore {
        MemoryStore::new(MemoryConfig::small(), Arc::new(NoWriteBack)).unwrap()
    }

    fn disk(tmp: &TempDir) -> FileDiskTasks {
        FileDiskTasks::open(tmp.path().join("generations")).unwrap()
    }

    /// Stamp messages through a stream and frame them as one record.
    fn append(log: &mut LogWriter, stream: &PersistStream, ops: Vec<Operation>) {
        for op in ops {
            let msg = encode_message(MsgType::StoreTran, stream.id(), &[op], 4096);
            stream.push(msg, None, || None).unwrap();
        }
        let batch = stream.take().unwrap();
        stream.done();
        let mut out = BytesMut::new();
        let head = RecordHead {
            timestamp: 1,
            cycle_id: log.cycle_id(),
            len: batch.data.len() as u32,
            st_count: 1,
        };
        frame_record(&mut out, head, &batch.data, BLOCK);
        log.append(&out).unwrap();
    }

    fn create(store: &MemoryStore, fill: u8) -> (Handle, Operation) {
        let (gen, _) = store.active();
        let h = store
            .allocate(gen, 1, data_type::NEWLY_HATCHED, 0, 0, &[fill; 300])
            .unwrap();
        let op = StoreOp::CreateRecord {
            handle: h,
            data_type: data_type::USER_BASE,
        }
        .expand(store)
        .unwrap();
        op.apply(store).unwrap();
        (h, op)
    }

    #[test]
    fn test_cold_start_writes_first_set() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let dir = PersistDir::open(&config.root).unwrap();
        let s = store();
        let recovered = recover(&s, &disk(&tmp), &dir, &config).unwrap();
        assert!(recovered.report.cold_start);
        assert_eq!(recovered.pstate.cycle_id, 1);
        assert!(dir.path(FileKind::MgmtCheckpoint, 0, 0).exists());
        assert!(dir.path(FileKind::GenCheckpoint, 0, 0).exists());
        assert!(recovered.log.is_empty());

        let stored = PState::load(&dir.pstate()).unwrap().unwrap();
        assert!(!stored.clean_stop);
        assert_eq!(stored.cycle_id, 1);
    }

    #[test]
    fn test_warm_start_replays_log() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let dir = PersistDir::open(&config.root).unwrap();
        let primary = store();
        let mut recovered = recover(&primary, &disk(&tmp), &dir, &config).unwrap();

        let stream = PersistStream::new(
            StreamShared::new(3, 0, false),
            StreamLimits {
                buffer_size: 1 << 20,
                max_callbacks: 16,
            },
        );
        let (h, op) = create(&primary, 5);
        append(&mut recovered.log, &stream, vec![op]);
        let state = Operation::UpdateRecordState { handle: h, state: 42 };
        state.apply(&primary).unwrap();
        append(&mut recovered.log, &stream, vec![state]);
        let expected = primary.fingerprint().unwrap();
        drop(recovered);

        let replica = store();
        let again = recover(&replica, &disk(&tmp), &dir, &config).unwrap();
        assert!(!again.report.cold_start);
        assert!(!again.report.clean_stop);
        assert_eq!(again.report.replays.len(), 1);
        assert_eq!(again.report.replays[0].messages, 2);
        assert_eq!(again.next_msg_sqn.get(&3), Some(&2));
        assert_eq!(replica.fingerprint().unwrap(), expected);
        replica.validate().unwrap();

        // The recovered state was checkpointed into the other file.
        assert_eq!(again.pstate.cycle_id, 2);
        assert_eq!(again.pstate.current_file(), 1);
        assert!(again.log.is_empty());
    }

    #[test]
    fn test_torn_record_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let dir = PersistDir::open(&config.root).unwrap();
        let primary = store();
        let mut recovered = recover(&primary, &disk(&tmp), &dir, &config).unwrap();
        let stream = PersistStream::new(
            StreamShared::new(1, 0, false),
            StreamLimits {
                buffer_size: 1 << 20,
                max_callbacks: 16,
            },
        );
        let (_, op) = create(&primary, 1);
        append(&mut recovered.log, &stream, vec![op]);
        let expected = primary.fingerprint().unwrap();

        // Half of a second record reached the disk.
        let (_, op) = create(&primary, 2);
        let msg = encode_message(MsgType::StoreTran, 1, &[op], 4096);
        let mut out = BytesMut::new();
        let head = RecordHead {
            timestamp: 2,
            cycle_id: recovered.log.cycle_id(),
            len: msg.len() as u32,
            st_count: 1,
        };
        frame_record(&mut out, head, &msg, BLOCK);
        recovered.log.append(&out[..out.len() / 2]).unwrap();
        drop(recovered);

        let replica = store();
        let again = recover(&replica, &disk(&tmp), &dir, &config).unwrap();
        assert_eq!(again.report.replays[0].records, 1);
        assert_eq!(replica.fingerprint().unwrap(), expected);
    }

    #[test]
    fn test_standby_directory_starts_cold() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let dir = PersistDir::open(&config.root).unwrap();
        let mut pstate = PState::new(RecordLayout::Current);
        pstate.is_standby = true;
        pstate.store(&dir.pstate()).unwrap();

        let s = store();
        let recovered = recover(&s, &disk(&tmp), &dir, &config).unwrap();
        assert!(recovered.report.cold_start);
        assert!(!recovered.pstate.is_standby);
    }
}
