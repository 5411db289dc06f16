//! End-to-end scenarios over real engines: sync and replication, crashes,
//! generation transitions and damaged logs.

use super::harness::{init_tracing, store_config, wait_for, Node, Pair, WAIT};
use crate::config::{HaConfig, StoreConfig};
use crate::disk::TaskParams;
use crate::error::ReturnCode;
use crate::ha::channel::{AckingPolicy, HaChannel};
use crate::ha::message::MsgType;
use crate::ha::ops::{OpType, StoreOp};
use crate::ha::sync::Proposal;
use crate::ha::transport::{HaTransport, LocalTransport};
use crate::memory::generation::Generation;
use crate::metrics::StoreMetrics;
use crate::persist::record::{RecordReader, HEAD_SIZE};
use crate::persist::{FileKind, PState, PersistDir, StopReason};
use crate::testing::failpoint::{points, FailpointAction};
use crate::types::{GenToken, HaRole, SYNC_CHANNEL};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_sync_then_replicate() {
    let pair = Pair::start().unwrap();
    assert_eq!(pair.standby.engine.role(), HaRole::Standby);
    assert_eq!(pair.primary.engine.context().info.sync_rc(), ReturnCode::Ok);

    let stream = pair.primary.engine.open_stream(false).unwrap();
    let a = pair.primary.create_record(stream, 0xa1, 100).unwrap();
    let b = pair.primary.create_record(stream, 0xb2, 900).unwrap();
    pair.primary.set_state(stream, a, 4).unwrap();
    pair.primary
        .engine
        .commit_sync(stream, &[StoreOp::DeleteRecord { handle: b }], WAIT)
        .unwrap();
    pair.settle().unwrap();

    let primary = pair.primary.engine.store();
    let standby = pair.standby.engine.store();
    assert!(wait_for(WAIT, || {
        standby.fingerprint().ok() == primary.fingerprint().ok()
    }));
    standby.validate().unwrap();
}

#[test]
fn test_sync_with_small_memory_budget() {
    init_tracing();
    let pd = TempDir::new().unwrap();
    let tune = |mut c: StoreConfig| {
        c.ha = c.ha.with_sync_max_mem(1024);
        c
    };
    let primary = Node::primary(tune(store_config(pd.path()))).unwrap();
    let stream = primary.engine.open_stream(false).unwrap();
    for i in 0..8u8 {
        primary.create_record(stream, i, 300).unwrap();
    }
    let old = primary.engine.store().active().0;
    primary.engine.close_active_generation().unwrap();
    assert!(wait_for(WAIT, || !primary.engine.generation_transition_pending()));
    primary.create_record(stream, 0xee, 64).unwrap();

    let pair = Pair::join(primary, pd, tune).unwrap();
    let info = &pair.primary.engine.context().info;
    assert_eq!(info.sync_rc(), ReturnCode::Ok);
    assert!(info.has_standby());
    let standby = pair.standby.engine.context();
    assert!(standby.disk.generation_size(old).unwrap().is_some());
    assert_eq!(
        standby.store.fingerprint().unwrap(),
        pair.primary.engine.store().fingerprint().unwrap()
    );
}

#[test]
fn test_crash_before_write_recovers_committed_state() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let committed = {
        let node = Node::primary(store_config(tmp.path())).unwrap();
        let stream = node.engine.open_stream(false).unwrap();
        let h = node.create_record(stream, 1, 200).unwrap();
        node.set_state(stream, h, 2).unwrap();
        let fp = node.engine.store().fingerprint().unwrap();

        node.failpoints
            .enable(points::PERSIST_BEFORE_WRITE, FailpointAction::Return);
        let res = node.engine.commit_sync(
            stream,
            &[StoreOp::UpdateRecordState { handle: h, state: 3 }],
            Duration::from_secs(2),
        );
        assert!(res.is_err());
        assert!(wait_for(WAIT, || node.engine.pipeline_status()
            == Some(crate::persist::PipelineStatus::Stopped)));
        node.engine.shutdown();
        fp
    };

    let node = Node::open(store_config(tmp.path())).unwrap();
    let report = node.engine.start_primary().unwrap();
    assert!(!report.cold_start);
    assert!(!report.clean_stop);
    assert_eq!(node.engine.store().fingerprint().unwrap(), committed);
    node.engine.store().validate().unwrap();
}

#[test]
fn test_generation_transition_survives_restart() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let (old, fp) = {
        let node = Node::primary(store_config(tmp.path())).unwrap();
        let stream = node.engine.open_stream(false).unwrap();
        node.create_record(stream, 7, 500).unwrap();
        let old = node.engine.store().active().0;
        node.engine.close_active_generation().unwrap();
        assert!(wait_for(WAIT, || !node.engine.generation_transition_pending()));
        assert_ne!(node.engine.store().active().0, old);
        node.create_record(stream, 8, 80).unwrap();
        let fp = node.engine.store().fingerprint().unwrap();
        node.engine.shutdown();
        (old, fp)
    };

    let node = Node::open(store_config(tmp.path())).unwrap();
    let report = node.engine.start_primary().unwrap();
    assert!(report.clean_stop);
    assert!(report.missing_generations.is_empty());
    assert_ne!(node.engine.store().active().0, old);
    assert!(!node.engine.store().is_resident(old));
    assert_eq!(node.engine.store().fingerprint().unwrap(), fp);
}

#[test]
fn test_shutdown_right_after_transition_request() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let old = {
        let node = Node::primary(store_config(tmp.path())).unwrap();
        let stream = node.engine.open_stream(false).unwrap();
        node.create_record(stream, 3, 256).unwrap();
        let old = node.engine.store().active().0;
        node.engine.close_active_generation().unwrap();
        node.engine.shutdown();
        old
    };

    let node = Node::open(store_config(tmp.path())).unwrap();
    node.engine.start_primary().unwrap();
    assert!(wait_for(WAIT, || !node.engine.generation_transition_pending()));
    let store = node.engine.store();
    if store.active().0 != old {
        assert!(wait_for(WAIT, || !store.is_resident(old)));
    }
    store.validate().unwrap();

    let stream = node.engine.open_stream(false).unwrap();
    node.create_record(stream, 4, 64).unwrap();
}

#[test]
fn test_torn_log_tail_keeps_earlier_records() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let fp = {
        let node = Node::primary(store_config(tmp.path())).unwrap();
        let stream = node.engine.open_stream(false).unwrap();
        node.create_record(stream, 1, 100).unwrap();
        node.create_record(stream, 2, 100).unwrap();
        let fp = node.engine.store().fingerprint().unwrap();
        node.create_record(stream, 3, 700).unwrap();
        node.engine.shutdown();
        fp
    };

    let dir = PersistDir::open(tmp.path()).unwrap();
    let pstate = PState::load(&dir.pstate()).unwrap().unwrap();
    let path = dir.path(FileKind::Log, pstate.start_gen, pstate.current_file());
    let buf = std::fs::read(&path).unwrap();
    let last = RecordReader::new(&buf, pstate.cycle_id, 512).last().unwrap();
    // Cut the last record inside its tail.
    let cut = last.offset + HEAD_SIZE + last.head.len as usize + 4;
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(cut as u64)
        .unwrap();

    let node = Node::open(store_config(tmp.path())).unwrap();
    let report = node.engine.start_primary().unwrap();
    let replay = report.replays.last().unwrap();
    assert_eq!(replay.records, 2);
    assert_eq!(replay.stop, Some(StopReason::Truncated));
    assert_eq!(node.engine.store().fingerprint().unwrap(), fp);
    node.engine.store().validate().unwrap();
}

/// Play the primary's side of a generation list exchange by hand and return
/// the generation ids the standby asked for.
fn request_list(link: &LocalTransport, proposals: &[Proposal]) -> Vec<u16> {
    let chan = HaChannel::new(
        link.open_channel(SYNC_CHANNEL).unwrap(),
        HaConfig::new(),
        AckingPolicy::AfterProcessing,
        Arc::new(StoreMetrics::new()),
    );
    let ack = chan
        .request(MsgType::SyncList, |w| {
            for p in proposals {
                w.put_op(OpType::Null.as_u16(), &p.encode())?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(ack.rc, ReturnCode::Ok);

    let res = chan.receive_message(WAIT).unwrap().unwrap();
    assert_eq!(res.msg_type, MsgType::SyncListRes);
    res.ops()
        .map(|op| u16::from_be_bytes(op.unwrap().payload[..2].try_into().unwrap()))
        .collect()
}

#[test]
fn test_sync_list_never_requests_empty_generations() {
    init_tracing();
    let sd = TempDir::new().unwrap();
    let standby = Node::open(store_config(sd.path())).unwrap();
    let (primary_link, standby_link) = LocalTransport::pair();
    standby.engine.start_standby(standby_link, None).unwrap();

    let proposals = [
        Proposal {
            gen_id: 1,
            token: GenToken::generate(),
            disk_size: 0,
        },
        Proposal {
            gen_id: 5,
            token: GenToken::generate(),
            disk_size: 0,
        },
        Proposal {
            gen_id: 4,
            token: GenToken::generate(),
            disk_size: 64 * 1024,
        },
    ];
    assert_eq!(request_list(&primary_link, &proposals), vec![4]);
    assert_eq!(standby.engine.role(), HaRole::Unsync);
    primary_link.disconnect();
}

#[test]
fn test_unset_token_never_matches_local_copy() {
    init_tracing();
    let sd = TempDir::new().unwrap();
    let config = store_config(sd.path());
    let memory = config.memory.clone();
    let standby = Node::open(config).unwrap();

    // A local file whose token was never set.
    let mut gen = Generation::new(4, memory.gen_size, &memory.gen_pools).unwrap();
    gen.header_mut().token = GenToken::default();
    let image = gen.compact().unwrap();
    let size = image.len() as u64;
    let (tx, rx) = crossbeam::channel::bounded(1);
    standby.engine.context().disk.write_generation(
        TaskParams::new(4),
        image,
        Box::new(move |res| {
            let _ = tx.send(res.is_ok());
        }),
    );
    assert!(rx.recv_timeout(WAIT).unwrap());

    let (primary_link, standby_link) = LocalTransport::pair();
    standby.engine.start_standby(standby_link, None).unwrap();
    let proposals = [Proposal {
        gen_id: 4,
        token: GenToken::default(),
        disk_size: size,
    }];
    assert_eq!(request_list(&primary_link, &proposals), vec![4]);
    assert!(standby.engine.store().recovery_ids().is_empty());
    primary_link.disconnect();
}

#[test]
fn test_resync_reads_matching_generation_ahead() {
    let mut pair = Pair::start().unwrap();
    let stream = pair.primary.engine.open_stream(false).unwrap();
    pair.primary.create_record(stream, 0x11, 400).unwrap();
    let old = pair.primary.engine.store().active().0;
    pair.primary.engine.close_active_generation().unwrap();
    assert!(wait_for(WAIT, || !pair.primary.engine.generation_transition_pending()));
    let disk = pair.standby.engine.context().disk.clone();
    assert!(wait_for(WAIT, || matches!(disk.generation_size(old), Ok(Some(_)))));

    pair.restart_standby().unwrap();
    let standby = pair.standby.engine.store();
    assert!(standby.recovery_ids().contains(&old));
    assert!(!standby.is_resident(old));
    assert!(wait_for(WAIT, || {
        standby.fingerprint().ok() == pair.primary.engine.store().fingerprint().ok()
    }));
}

#[test]
fn test_callbacks_keep_stream_order_with_standby() {
    let pair = Pair::start().unwrap();
    let engine = &pair.primary.engine;
    let h = pair
        .primary
        .create_record(engine.open_stream(false).unwrap(), 9, 32)
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let streams = [engine.open_stream(false).unwrap(), engine.open_stream(true).unwrap()];
    for i in 0..40u64 {
        let stream = streams[(i % 2) as usize];
        let order = order.clone();
        engine
            .commit(
                stream,
                &[StoreOp::UpdateRecordAttr {
                    handle: h,
                    attribute: i,
                }],
                Some(Box::new(move |rc| order.lock().push((stream, i, rc)))),
            )
            .unwrap();
    }
    pair.settle().unwrap();
    assert!(wait_for(WAIT, || order.lock().len() == 40));

    let order = order.lock();
    assert!(order.iter().all(|(_, _, rc)| *rc == ReturnCode::Ok));
    for s in streams {
        let seen: Vec<u64> = order.iter().filter(|(st, _, _)| *st == s).map(|(_, i, _)| *i).collect();
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
        assert_eq!(seen.len(), 20);
    }
}

#[test]
fn test_standby_shutdown_message_terminates_receiver() {
    let pair = Pair::start().unwrap();
    pair.primary.engine.stop_standby().unwrap();
    let info = &pair.standby.engine.context().info;
    assert!(info
        .wait_role(WAIT, |r| r == HaRole::Terminating)
        .is_some());
    assert!(!pair.primary.engine.context().info.has_standby());
}

#[test]
fn test_promoted_standby_serves_and_recovers() {
    let pair = Pair::start().unwrap();
    let stream = pair.primary.engine.open_stream(false).unwrap();
    let h = pair.primary.create_record(stream, 0x5a, 600).unwrap();
    pair.primary.set_state(stream, h, 11).unwrap();
    pair.settle().unwrap();
    let expected = pair.primary.engine.store().fingerprint().unwrap();
    pair.primary.engine.shutdown();

    let standby = &pair.standby.engine;
    assert!(wait_for(WAIT, || standby.view().active_nodes < 2));
    standby.promote().unwrap();
    assert_eq!(standby.role(), HaRole::Primary);
    assert_eq!(standby.store().fingerprint().unwrap(), expected);

    let stream = standby.open_stream(false).unwrap();
    pair.standby.set_state(stream, h, 12).unwrap();
    let fp = standby.store().fingerprint().unwrap();
    standby.shutdown();

    let node = Node::open(store_config(&pair.standby.root)).unwrap();
    let report = node.engine.start_primary().unwrap();
    assert!(!report.cold_start);
    assert_eq!(node.engine.store().fingerprint().unwrap(), fp);
}

/// A primary holding one closed generation on disk, ready for a standby.
fn primary_with_disk_generation(tune: impl Fn(StoreConfig) -> StoreConfig) -> (Node, TempDir) {
    let pd = TempDir::new().unwrap();
    let primary = Node::primary(tune(store_config(pd.path()))).unwrap();
    let stream = primary.engine.open_stream(false).unwrap();
    primary.create_record(stream, 0x42, 300).unwrap();
    let old = primary.engine.store().active().0;
    primary.engine.close_active_generation().unwrap();
    assert!(wait_for(WAIT, || !primary.engine.generation_transition_pending()));
    assert!(wait_for(WAIT, || !primary.engine.store().is_resident(old)));
    (primary, pd)
}

#[test]
fn test_failed_disk_phase_reports_to_both_sides() {
    init_tracing();
    let (primary, _pd) = primary_with_disk_generation(|c| c);
    let sd = TempDir::new().unwrap();
    let standby = Node::open(store_config(sd.path())).unwrap();
    let (primary_link, standby_link) = LocalTransport::pair();
    standby.engine.start_standby(standby_link, None).unwrap();

    primary
        .failpoints
        .enable(points::SYNC_DISK_GEN, FailpointAction::Return);
    primary.engine.attach_standby(primary_link.clone()).unwrap();
    assert!(!primary.engine.wait_standby(WAIT));

    let info = &primary.engine.context().info;
    assert_eq!(info.sync_rc(), ReturnCode::DiskError);
    assert!(!info.has_standby());
    assert_eq!(primary.engine.role(), HaRole::Primary);

    let standby_info = &standby.engine.context().info;
    assert!(wait_for(WAIT, || standby_info.sync_rc() == ReturnCode::DiskError));
    assert_ne!(standby.engine.role(), HaRole::Standby);

    // The primary keeps serving.
    let stream = primary.engine.open_stream(false).unwrap();
    primary.create_record(stream, 0x43, 64).unwrap();
    primary_link.disconnect();
    standby.engine.shutdown();
    primary.engine.shutdown();
}

#[test]
fn test_sync_lock_timeout_leaves_primary_serving() {
    init_tracing();
    let tune = |mut c: StoreConfig| {
        c.ha = c.ha.with_lock_policy(2, Duration::from_millis(50));
        c
    };
    let (primary, pd) = primary_with_disk_generation(tune);
    let sd = TempDir::new().unwrap();
    let standby = Node::open(tune(store_config(sd.path()))).unwrap();
    let (primary_link, standby_link) = LocalTransport::pair();
    standby.engine.start_standby(standby_link, None).unwrap();

    let held = primary.engine.store().gate().try_lock().unwrap();
    primary.engine.attach_standby(primary_link.clone()).unwrap();
    assert!(!primary.engine.wait_standby(WAIT));
    drop(held);

    let info = &primary.engine.context().info;
    assert_eq!(info.sync_rc(), ReturnCode::ConnectionBroke);
    assert!(!info.has_standby());
    assert_eq!(primary.engine.role(), HaRole::Primary);
    assert_ne!(standby.engine.role(), HaRole::Standby);

    let stream = primary.engine.open_stream(false).unwrap();
    primary.create_record(stream, 0x44, 64).unwrap();

    // A later attempt with the store free succeeds.
    primary_link.disconnect();
    standby.engine.shutdown();
    let pair = Pair::join(primary, pd, tune).unwrap();
    assert_eq!(pair.primary.engine.context().info.sync_rc(), ReturnCode::Ok);
    assert_eq!(
        pair.standby.engine.store().fingerprint().unwrap(),
        pair.primary.engine.store().fingerprint().unwrap()
    );
}
