//! Persistence streams: per-writer buffers of encoded store-transactions
//! waiting for the persist thread.
//!
//! A stream owns a monotonically increasing `msgSqn`. Its pending buffer
//! holds complete current-layout fragments in `msgSqn` order together with
//! the callbacks of those messages. The persist thread takes the whole
//! buffer at once and marks the stream working until the batch is durable;
//! writers block while the buffer is full and a batch is in flight.

use crate::codec::wire::patch_u64;
use crate::codec::{split_fragment, OpenFragment, FLAG_LAST, FLAG_NO_ACK, OP_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::ha::message::MsgType;
use crate::ha::ops::Operation;
use crate::types::{CommitCallback, StreamId, INTERNAL_STREAM};
use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MSG_SQN_OFFSET: usize = 6;
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// State of a stream the callback workers and HA transmitters read.
#[derive(Debug)]
pub struct StreamShared {
    pub id: StreamId,
    /// Callback worker serving this stream.
    pub worker: usize,
    pub high_perf: bool,
    /// One past the highest `msgSqn` the standby acked.
    ack_sqn: AtomicU64,
}

impl StreamShared {
    pub fn new(id: StreamId, worker: usize, high_perf: bool) -> Self {
        Self {
            id,
            worker,
            high_perf,
            ack_sqn: AtomicU64::new(0),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.id == INTERNAL_STREAM
    }

    pub fn ack_sqn(&self) -> u64 {
        self.ack_sqn.load(Ordering::Acquire)
    }

    /// Record the standby's ack of `msg_sqn`.
    pub fn acked(&self, msg_sqn: u64) {
        self.ack_sqn.fetch_max(msg_sqn + 1, Ordering::AcqRel);
    }

    pub(crate) fn reset_ack_sqn(&self, next: u64) {
        self.ack_sqn.store(next, Ordering::Release);
    }
}

/// A commit callback waiting for durability and, with a standby, its ack.
pub struct PendingCallback {
    pub stream: Arc<StreamShared>,
    /// Released once `ack_sqn >= gate` (or without a standby).
    pub gate: u64,
    pub callback: CommitCallback,
    pub committed_at: Instant,
}

impl std::fmt::Debug for PendingCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCallback")
            .field("stream", &self.stream.id)
            .field("gate", &self.gate)
            .finish()
    }
}

/// Flow-control limits of one stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub buffer_size: usize,
    pub max_callbacks: usize,
}

/// A batch taken by the persist thread.
#[derive(Debug)]
pub struct StreamBatch {
    pub stream: Arc<StreamShared>,
    pub data: BytesMut,
    pub callbacks: Vec<PendingCallback>,
    /// Messages in `data` start at this `msgSqn`.
    pub first_msg_sqn: u64,
}

#[derive(Debug, Default)]
struct Buffers {
    pending: BytesMut,
    callbacks: Vec<PendingCallback>,
    /// `msgSqn` of the first message in `pending`.
    first_msg_sqn: u64,
    next_msg_sqn: u64,
    working: bool,
    closed: bool,
    /// Messages below this were never forwarded to the current standby.
    forward_from: u64,
}

#[derive(Debug)]
pub struct PersistStream {
    shared: Arc<StreamShared>,
    limits: StreamLimits,
    buffers: Mutex<Buffers>,
    changed: Condvar,
}

impl PersistStream {
    pub fn new(shared: StreamShared, limits: StreamLimits) -> Self {
        Self {
            shared: Arc::new(shared),
            limits,
            buffers: Mutex::new(Buffers::default()),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub fn next_msg_sqn(&self) -> u64 {
        self.buffers.lock().next_msg_sqn
    }

    /// Continue numbering after replay.
    pub(crate) fn set_next_msg_sqn(&self, next: u64) {
        let mut b = self.buffers.lock();
        b.next_msg_sqn = next;
        b.first_msg_sqn = next;
    }

    /// Queue encoded fragments (built with `msgSqn` 0) as the next message.
    /// Blocks while the stream is over its limits; `halted` aborts the wait.
    pub fn push(
        &self,
        mut fragments: BytesMut,
        callback: Option<CommitCallback>,
        halted: impl Fn() -> Option<Error>,
    ) -> Result<u64> {
        let mut b = self.buffers.lock();
        loop {
            if b.closed {
                return Err(Error::NotAvailable(format!("stream {} is closed", self.shared.id)));
            }
            if let Some(e) = halted() {
                return Err(e);
            }
            let over_buffer = !b.pending.is_empty()
                && b.pending.len() + fragments.len() > self.limits.buffer_size
                && b.working;
            let over_callbacks = b.callbacks.len() >= self.limits.max_callbacks;
            if !over_buffer && !over_callbacks {
                break;
            }
            self.changed.wait_for(&mut b, WAIT_SLICE);
        }
        let msg_sqn = b.next_msg_sqn;
        stamp_msg_sqn(&mut fragments, msg_sqn)?;
        if b.pending.is_empty() {
            b.first_msg_sqn = msg_sqn;
        }
        b.pending.unsplit(fragments);
        b.next_msg_sqn += 1;
        if let Some(callback) = callback {
            b.callbacks.push(PendingCallback {
                stream: self.shared.clone(),
                gate: msg_sqn + 1,
                callback,
                committed_at: Instant::now(),
            });
        }
        Ok(msg_sqn)
    }

    /// Queue a callback without data. It completes after every message
    /// already pushed.
    pub fn push_callback(&self, callback: CommitCallback) -> Result<()> {
        let mut b = self.buffers.lock();
        if b.closed {
            return Err(Error::NotAvailable(format!("stream {} is closed", self.shared.id)));
        }
        let gate = b.next_msg_sqn;
        b.callbacks.push(PendingCallback {
            stream: self.shared.clone(),
            gate,
            callback,
            committed_at: Instant::now(),
        });
        Ok(())
    }

    /// Take everything pending and mark the stream working.
    pub fn take(&self) -> Option<StreamBatch> {
        let mut b = self.buffers.lock();
        if b.pending.is_empty() && b.callbacks.is_empty() {
            return None;
        }
        b.working = true;
        let first_msg_sqn = b.first_msg_sqn;
        b.first_msg_sqn = b.next_msg_sqn;
        Some(StreamBatch {
            stream: self.shared.clone(),
            data: b.pending.split(),
            callbacks: std::mem::take(&mut b.callbacks),
            first_msg_sqn,
        })
    }

    /// The batch taken last is durable.
    pub fn done(&self) {
        self.release();
        self.changed.notify_all();
    }

    /// Like [`PersistStream::done`], leaving the wakeup to someone else.
    pub fn release(&self) {
        self.buffers.lock().working = false;
    }

    /// Wake writers blocked on this stream.
    pub fn wake(&self) {
        self.changed.notify_all();
    }

    pub fn has_pending(&self) -> bool {
        let b = self.buffers.lock();
        !b.pending.is_empty() || !b.callbacks.is_empty() || b.working
    }

    /// Start forwarding to a standby from the next message on.
    pub(crate) fn attach_standby(&self) -> u64 {
        let mut b = self.buffers.lock();
        b.forward_from = b.next_msg_sqn;
        // Messages not yet taken are forwarded with the next batch.
        if !b.pending.is_empty() {
            b.forward_from = b.first_msg_sqn;
        }
        self.shared.reset_ack_sqn(b.forward_from);
        b.forward_from
    }

    pub(crate) fn forward_from(&self) -> u64 {
        self.buffers.lock().forward_from
    }

    /// Refuse new messages and drop whatever was not taken yet.
    pub fn close(&self) -> Vec<PendingCallback> {
        let mut b = self.buffers.lock();
        b.closed = true;
        b.pending.clear();
        let left = std::mem::take(&mut b.callbacks);
        drop(b);
        self.changed.notify_all();
        left
    }

    /// Wait until everything pushed so far is durable.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut b = self.buffers.lock();
        while !b.pending.is_empty() || b.working {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.changed.wait_for(&mut b, (deadline - now).min(WAIT_SLICE));
        }
        true
    }
}

/// Encode one message as persisted fragments of at most `max_fragment`
/// bytes. Every fragment carries the stream id and `NO_ACK`; the last one
/// also carries `LAST`. The `msgSqn` is stamped when the message is pushed.
pub fn encode_message(msg_type: MsgType, stream: StreamId, ops: &[Operation], max_fragment: usize) -> BytesMut {
    let mut buf = BytesMut::new();
    let mut payload = BytesMut::new();
    let mut frag_sqn = 0;
    let mut frag = OpenFragment::begin(&mut buf, msg_type.as_u16(), 0, frag_sqn, stream);
    for op in ops {
        if !frag.is_empty() && frag.len(&buf) + OP_HEADER_SIZE + op.encoded_len() > max_fragment {
            frag.finish(&mut buf, FLAG_NO_ACK);
            frag_sqn += 1;
            frag = OpenFragment::begin(&mut buf, msg_type.as_u16(), 0, frag_sqn, stream);
        }
        payload.clear();
        op.encode(&mut payload);
        frag.put_op(&mut buf, op.op_type().as_u16(), &payload);
    }
    frag.finish(&mut buf, FLAG_NO_ACK | FLAG_LAST);
    buf
}

/// Write `msg_sqn` into every fragment of one message.
fn stamp_msg_sqn(buf: &mut BytesMut, msg_sqn: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let (header, _) = split_fragment(&buf[pos..])?;
        patch_u64(buf, pos + MSG_SQN_OFFSET, msg_sqn);
        pos += header.total_len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{OpenFragment, FLAG_LAST};
    use crate::error::ReturnCode;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn message(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut frag = OpenFragment::begin(&mut buf, 2, 0, 0, 4);
        frag.put_op(&mut buf, 1, payload);
        frag.finish(&mut buf, FLAG_LAST);
        buf
    }

    fn stream(buffer_size: usize) -> PersistStream {
        PersistStream::new(
            StreamShared::new(4, 0, false),
            StreamLimits {
                buffer_size,
                max_callbacks: 16,
            },
        )
    }

    #[test]
    fn test_push_numbers_messages() {
        let s = stream(4096);
        assert_eq!(s.push(message(b"a"), None, || None).unwrap(), 0);
        assert_eq!(s.push(message(b"b"), None, || None).unwrap(), 1);

        let batch = s.take().unwrap();
        assert_eq!(batch.first_msg_sqn, 0);
        let sqns: Vec<u64> = crate::codec::RecordLayout::Current
            .fragments(&batch.data)
            .map(|f| f.unwrap().header.msg_sqn)
            .collect();
        assert_eq!(sqns, vec![0, 1]);
        assert!(s.has_pending());
        s.done();
        assert!(!s.has_pending());
    }

    #[test]
    fn test_callback_gates() {
        let s = stream(4096);
        let cb: CommitCallback = Box::new(|_rc: ReturnCode| {});
        s.push(message(b"a"), Some(cb), || None).unwrap();
        s.push_callback(Box::new(|_rc: ReturnCode| {})).unwrap();
        let batch = s.take().unwrap();
        let gates: Vec<u64> = batch.callbacks.iter().map(|c| c.gate).collect();
        assert_eq!(gates, vec![1, 1]);
    }

    #[test]
    fn test_full_buffer_blocks_until_done() {
        let s = Arc::new(stream(64));
        s.push(message(&[0u8; 30]), None, || None).unwrap();
        s.take().unwrap();
        s.push(message(&[0u8; 30]), None, || None).unwrap();

        let pushed = Arc::new(AtomicUsize::new(0));
        let (s2, p2) = (s.clone(), pushed.clone());
        let writer = thread::spawn(move || {
            s2.push(message(&[0u8; 30]), None, || None).unwrap();
            p2.store(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pushed.load(Ordering::SeqCst), 0);
        s.done();
        writer.join().unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_halt_releases_writer() {
        let s = stream(64);
        s.push(message(&[0u8; 30]), None, || None).unwrap();
        s.take().unwrap();
        s.push(message(&[0u8; 30]), None, || None).unwrap();
        let err = s
            .push(message(&[0u8; 30]), None, || Some(Error::StoreTerm))
            .unwrap_err();
        assert!(matches!(err, Error::StoreTerm));
    }

    #[test]
    fn test_encode_message_splits_fragments() {
        use crate::types::Handle;
        let ops: Vec<Operation> = (0..20)
            .map(|i| Operation::UpdateRecord {
                handle: Handle::new(2, 4096 + i * 128),
                attribute: i,
                state: 0,
            })
            .collect();
        let buf = encode_message(MsgType::StoreTran, 9, &ops, 200);
        let frags: Vec<_> = crate::codec::RecordLayout::Current
            .fragments(&buf)
            .map(|f| f.unwrap())
            .collect();
        assert!(frags.len() > 1);
        assert!(frags.iter().all(|f| f.stream == 9 && f.header.no_ack()));
        assert!(frags.iter().all(|f| f.header.total_len() <= 200));
        assert_eq!(frags.iter().filter(|f| f.header.is_last()).count(), 1);
        assert!(frags.last().unwrap().header.is_last());
        let sqns: Vec<u32> = frags.iter().map(|f| f.header.frag_sqn).collect();
        assert_eq!(sqns, (0..frags.len() as u32).collect::<Vec<_>>());
        let ops_total: u32 = frags.iter().map(|f| f.header.op_count).sum();
        assert_eq!(ops_total, 20);
    }

    #[test]
    fn test_attach_standby_resets_ack_sqn() {
        let s = stream(4096);
        s.push(message(b"a"), None, || None).unwrap();
        s.take().unwrap();
        s.done();
        s.push(message(b"b"), None, || None).unwrap();
        assert_eq!(s.attach_standby(), 1);
        assert_eq!(s.shared().ack_sqn(), 1);
        s.shared().acked(3);
        assert_eq!(s.shared().ack_sqn(), 4);
    }
}
