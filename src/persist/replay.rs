//! Replay of ST files into the memory store.
//!
//! Records are read in order until the first one that does not belong to
//! the expected cycle or fails its head/tail check. Fragments are
//! reassembled per `(stream, msgSqn)` and must arrive with consecutive
//! `fragSqn` from 0; a message is applied once its last
//! fragment was seen, through the same decoder the standby uses for live
//! traffic. Messages whose tail never reached disk are dropped.

use crate::codec::{OpIter, RecordLayout};
use crate::error::{ProtocolError, Result};
use crate::ha::message::MsgType;
use crate::ha::ops::apply_ops;
use crate::memory::MemoryStore;
use crate::persist::record::{RecordReader, StopReason};
use crate::types::StreamId;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// What one replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: usize,
    pub messages: usize,
    pub ops: usize,
    /// Messages whose last fragment is missing.
    pub incomplete: usize,
    /// Bytes covered by valid records.
    pub valid_len: usize,
    pub stop: Option<StopReason>,
    /// One past the highest `msgSqn` seen, per stream.
    pub next_msg_sqn: BTreeMap<StreamId, u64>,
}

/// Replay the valid prefix of one ST file.
pub fn replay_log(
    store: &MemoryStore,
    buf: &[u8],
    cycle_id: u32,
    block_size: usize,
    layout: RecordLayout,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut open: HashMap<(StreamId, u64), Vec<(&[u8], u32)>> = HashMap::new();
    let mut reader = RecordReader::new(buf, cycle_id, block_size);

    for record in reader.by_ref() {
        stats.records += 1;
        for frag in layout.fragments(record.payload) {
            let frag = frag?;
            let key = (frag.stream, frag.header.msg_sqn);
            let mut parts = open.remove(&key).unwrap_or_default();
            let expected = parts.len() as u32;
            if frag.header.frag_sqn != expected {
                return Err(ProtocolError::FragSqnGap {
                    expected,
                    got: frag.header.frag_sqn,
                }
                .into());
            }
            parts.push((frag.body, frag.header.op_count));
            if !frag.header.is_last() {
                open.insert(key, parts);
                continue;
            }
            match MsgType::from_u16(frag.header.msg_type)? {
                MsgType::StoreTran | MsgType::UpdateActiveOid => {
                    let ops = parts.iter().flat_map(|(body, n)| OpIter::new(body, *n));
                    stats.ops += apply_ops(store, ops)?;
                }
                other => debug!(msg_type = ?other, "skipping logged message"),
            }
            stats.messages += 1;
            let next = stats.next_msg_sqn.entry(frag.stream).or_insert(0);
            *next = (*next).max(frag.header.msg_sqn + 1);
        }
    }

    stats.incomplete = open.len();
    stats.valid_len = reader.valid_len();
    stats.stop = reader.stop_reason();
    match stats.stop {
        Some(StopReason::TailMismatch) | Some(StopReason::Truncated) => warn!(
            offset = stats.valid_len,
            reason = ?stats.stop,
            "incomplete trailing write, replay stops here"
        ),
        Some(StopReason::BadHead) => warn!(offset = stats.valid_len, "unreadable record head, replay stops here"),
        _ => {}
    }
    if stats.incomplete > 0 {
        warn!(messages = stats.incomplete, "dropping messages without their last fragment");
    }
    info!(
        cycle_id,
        records = stats.records,
        messages = stats.messages,
        ops = stats.ops,
        "log replayed"
    );
    Ok(stats)
}
