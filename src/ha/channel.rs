//! HA channel: fragmentation, flow control, acks and reassembly over one
//! [`HaLink`].
//!
//! ```text
//!  sender                                   receiver
//!  MessageWriter ──frag 0──────────────────▶ reassembly
//!                ──frag 1 (flowCtrlAck)────▶ ──▶ flow ack (immediate)
//!                ◀───────────────flow ack──
//!                ──frag 2 (last)───────────▶ message queue ──▶ ack
//! ```
//!
//! Fragments of one message carry strictly increasing `fragSqn` from 0 and
//! messages strictly increasing `msgSqn`; any gap aborts the message.

use crate::codec::{
    split_fragment, FragmentHeader, OpIter, OpenFragment, FLAG_FLOW_CTRL_ACK, FLAG_LAST, FLAG_NO_ACK,
    FRAGMENT_HEADER_SIZE, OP_HEADER_SIZE,
};
use crate::config::HaConfig;
use crate::error::{Error, ProtocolError, Result, ReturnCode, TransportError};
use crate::ha::message::{Ack, Body, Message, MsgType};
use crate::ha::transport::HaLink;
use crate::metrics::StoreMetrics;
use crate::types::ChannelId;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Slice of a receive wait spent on the link before re-checking queues.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// When a receiver acks a message relative to processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckingPolicy {
    /// Ack on receipt, then process.
    BeforeProcessing,
    /// Process, then ack with the processing result.
    AfterProcessing,
}

struct TxState {
    msg_sqn: u64,
    unacked_frags: u32,
}

struct Reassembly {
    msg_type: MsgType,
    msg_sqn: u64,
    next_frag: u32,
    body: Body,
    filled: usize,
}

impl Reassembly {
    fn start(msg_type: MsgType, header: &FragmentHeader, frame: &Bytes) -> Result<Self> {
        let mut r = Self {
            msg_type,
            msg_sqn: header.msg_sqn,
            next_frag: 0,
            body: Body::Fragments(Vec::new()),
            filled: 0,
        };
        if msg_type.is_coalesced() {
            let body = &frame[FRAGMENT_HEADER_SIZE..header.total_len()];
            let mut ops = OpIter::new(body, header.op_count);
            let head = ops
                .next()
                .ok_or_else(|| ProtocolError::Malformed(format!("{:?} without head op", msg_type)))??;
            if head.payload.len() < 8 {
                return Err(ProtocolError::BadLength {
                    what: "coalesced head",
                    len: head.payload.len(),
                }
                .into());
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&head.payload[..8]);
            let len = u64::from_be_bytes(len) as usize;
            let mut data = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|_| Error::Allocate(format!("{} bytes for {:?}", len, msg_type)))?;
            data.resize(len, 0);
            r.body = Body::Coalesced {
                head: head.payload.to_vec(),
                data,
            };
        }
        Ok(r)
    }

    fn add(&mut self, header: &FragmentHeader, frame: Bytes) -> Result<()> {
        let body = frame.slice(FRAGMENT_HEADER_SIZE..header.total_len());
        let first = self.next_frag == 0;
        self.next_frag += 1;
        match &mut self.body {
            Body::Fragments(frags) => frags.push((body, header.op_count)),
            Body::Coalesced { data, .. } => {
                for (i, op) in OpIter::new(&body, header.op_count).enumerate() {
                    let op = op?;
                    if first && i == 0 {
                        continue;
                    }
                    if op.payload.len() < 8 {
                        return Err(ProtocolError::BadLength {
                            what: "coalesced data op",
                            len: op.payload.len(),
                        }
                        .into());
                    }
                    let mut off = [0u8; 8];
                    off.copy_from_slice(&op.payload[..8]);
                    let off = u64::from_be_bytes(off) as usize;
                    let bytes = &op.payload[8..];
                    let dst = off
                        .checked_add(bytes.len())
                        .and_then(|end| data.get_mut(off..end))
                        .ok_or_else(|| ProtocolError::BadLength {
                            what: "coalesced data offset",
                            len: off.saturating_add(bytes.len()),
                        })?;
                    dst.copy_from_slice(bytes);
                    self.filled += bytes.len();
                }
            }
        }
        Ok(())
    }

    fn finish(self, header: &FragmentHeader) -> Result<Message> {
        if let Body::Coalesced { data, .. } = &self.body {
            if self.filled != data.len() {
                return Err(ProtocolError::Malformed(format!(
                    "{:?} announced {} bytes, carried {}",
                    self.msg_type,
                    data.len(),
                    self.filled
                ))
                .into());
            }
        }
        Ok(Message {
            msg_type: self.msg_type,
            msg_sqn: self.msg_sqn,
            last_frag_sqn: header.frag_sqn,
            flags: header.flags,
            body: self.body,
        })
    }
}

#[derive(Default)]
struct RxState {
    expected: Option<u64>,
    assembling: Option<Reassembly>,
    messages: VecDeque<Message>,
    acks: VecDeque<Ack>,
    flow_acks: u64,
    closed: bool,
}

/// One logical HA channel.
pub struct HaChannel {
    id: ChannelId,
    link: Arc<dyn HaLink>,
    config: HaConfig,
    policy: AckingPolicy,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    metrics: Arc<StoreMetrics>,
}

impl std::fmt::Debug for HaChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaChannel")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .finish()
    }
}

impl HaChannel {
    pub fn new(link: Arc<dyn HaLink>, config: HaConfig, policy: AckingPolicy, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            id: link.channel_id(),
            link,
            config,
            policy,
            tx: Mutex::new(TxState {
                msg_sqn: 0,
                unacked_frags: 0,
            }),
            rx: Mutex::new(RxState::default()),
            metrics,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn policy(&self) -> AckingPolicy {
        self.policy
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Start a message. The channel's send side stays locked until the
    /// writer is finished or dropped.
    pub fn writer(&self, msg_type: MsgType) -> MessageWriter<'_> {
        let tx = self.tx.lock();
        let msg_sqn = tx.msg_sqn;
        let mut w = MessageWriter {
            chan: self,
            tx,
            msg_type,
            msg_sqn,
            frag_sqn: 0,
            buf: BytesMut::with_capacity(self.config.buffer_size),
            frag: None,
            extra_flags: 0,
        };
        w.open();
        w
    }

    fn send_frame(&self, frame: Bytes) -> Result<()> {
        match self.link.send(frame) {
            Ok(()) => {
                self.metrics.frags_sent.inc();
                Ok(())
            }
            Err(e) if e.is_connection_broke() => {
                trace!(channel = self.id, "send on broken connection");
                Err(e)
            }
            Err(e) => {
                error!(channel = self.id, error = %e, "failed to send HA fragment");
                Err(e)
            }
        }
    }

    /// Send already framed current-layout fragments, applying flow control.
    pub fn send_fragments(&self, data: &[u8]) -> Result<usize> {
        let mut tx = self.tx.lock();
        let mut pos = 0;
        let mut sent = 0;
        while pos < data.len() {
            let (header, _) = split_fragment(&data[pos..])?;
            let len = header.total_len();
            let mut frame = BytesMut::from(&data[pos..pos + len]);
            tx.unacked_frags += 1;
            let flow = self.config.flow_control && tx.unacked_frags >= self.config.tx_q_depth;
            let mark = flow.then(|| self.rx.lock().flow_acks);
            if flow {
                frame[18] |= FLAG_FLOW_CTRL_ACK;
            }
            self.send_frame(frame.freeze())?;
            if let Some(mark) = mark {
                self.wait_flow_ack(mark)?;
                tx.unacked_frags = 0;
            }
            pos += len;
            sent += 1;
        }
        Ok(sent)
    }

    fn wait_flow_ack(&self, mark: u64) -> Result<()> {
        let got = self.pump(self.config.ack_timeout, |rx| (rx.flow_acks > mark).then_some(()))?;
        got.ok_or(Error::Timeout)
    }

    /// Read frames until `take` yields or `timeout` passes.
    fn pump<T>(&self, timeout: Duration, mut take: impl FnMut(&mut RxState) -> Option<T>) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.rx.lock();
        loop {
            if let Some(v) = take(&mut *rx) {
                return Ok(Some(v));
            }
            if rx.closed {
                return Err(Error::CloseChannel);
            }
            let now = Instant::now();
            let wait = deadline.saturating_duration_since(now).min(POLL_SLICE);
            match self.link.recv(wait)? {
                Some(frame) => {
                    if let Err(e) = self.ingest(&mut *rx, frame) {
                        rx.assembling = None;
                        rx.expected = None;
                        return Err(e);
                    }
                }
                None if Instant::now() >= deadline => return Ok(None),
                None => {
                    // Let other waiters on this channel read.
                    MutexGuard::bump(&mut rx);
                }
            }
        }
    }

    fn ingest(&self, rx: &mut RxState, frame: Bytes) -> Result<()> {
        let (header, body) = split_fragment(&frame)?;
        self.metrics.frags_received.inc();
        let msg_type = MsgType::from_u16(header.msg_type)?;
        match msg_type {
            MsgType::Ack => {
                let ack = Ack::decode(&header, body)?;
                self.metrics.acks_received.inc();
                if ack.flow_ctrl {
                    rx.flow_acks += 1;
                } else {
                    rx.acks.push_back(ack);
                }
                return Ok(());
            }
            MsgType::CloseChannel => {
                debug!(channel = self.id, "peer closed channel");
                rx.closed = true;
                return Ok(());
            }
            _ => {}
        }
        if header.wants_flow_ctrl_ack() {
            let mut ack = Ack::new(header.msg_sqn, header.frag_sqn, header.msg_type, ReturnCode::Ok);
            ack.flow_ctrl = true;
            self.send_ack(&ack)?;
        }
        let mut r = match rx.assembling.take() {
            None => {
                if header.frag_sqn != 0 {
                    return Err(ProtocolError::FragSqnGap {
                        expected: 0,
                        got: header.frag_sqn,
                    }
                    .into());
                }
                if let Some(expected) = rx.expected {
                    if header.msg_sqn != expected {
                        return Err(ProtocolError::MsgSqnGap {
                            expected,
                            got: header.msg_sqn,
                        }
                        .into());
                    }
                }
                Reassembly::start(msg_type, &header, &frame)?
            }
            Some(r) => {
                if header.msg_sqn != r.msg_sqn {
                    return Err(ProtocolError::MsgSqnGap {
                        expected: r.msg_sqn,
                        got: header.msg_sqn,
                    }
                    .into());
                }
                if header.frag_sqn != r.next_frag {
                    return Err(ProtocolError::FragSqnGap {
                        expected: r.next_frag,
                        got: header.frag_sqn,
                    }
                    .into());
                }
                r
            }
        };
        r.add(&header, frame.clone())?;
        if header.is_last() {
            rx.expected = Some(header.msg_sqn + 1);
            rx.messages.push_back(r.finish(&header)?);
        } else {
            rx.assembling = Some(r);
        }
        Ok(())
    }

    /// Next complete message, or `None` after `timeout`. A peer close
    /// surfaces as [`Error::CloseChannel`].
    pub fn receive_message(&self, timeout: Duration) -> Result<Option<Message>> {
        self.pump(timeout, |rx| rx.messages.pop_front())
    }

    /// Next message ack. Non-blocking calls fail with `WouldBlock` when none
    /// is waiting; blocking calls wait up to the configured ack timeout.
    pub fn receive_ack(&self, block: bool) -> Result<Ack> {
        let timeout = if block { self.config.ack_timeout } else { Duration::ZERO };
        match self.pump(timeout, |rx| rx.acks.pop_front())? {
            Some(ack) => Ok(ack),
            None if block => Err(Error::Timeout),
            None => Err(TransportError::WouldBlock.into()),
        }
    }

    /// Wait for the ack of message `msg_sqn`, dropping older ones.
    pub fn wait_ack(&self, msg_sqn: u64) -> Result<Ack> {
        loop {
            let ack = self.receive_ack(true)?;
            if ack.ack_sqn == msg_sqn {
                return Ok(ack);
            }
            if ack.ack_sqn > msg_sqn {
                return Err(ProtocolError::MsgSqnGap {
                    expected: msg_sqn,
                    got: ack.ack_sqn,
                }
                .into());
            }
            warn!(channel = self.id, stale = ack.ack_sqn, msg_sqn, "dropping stale ack");
        }
    }

    pub fn send_ack(&self, ack: &Ack) -> Result<()> {
        let mut buf = BytesMut::new();
        ack.encode(&mut buf, 0);
        self.send_frame(buf.freeze())?;
        self.metrics.acks_sent.inc();
        Ok(())
    }

    /// Send a message and wait for its ack.
    pub fn request(
        &self,
        msg_type: MsgType,
        build: impl FnOnce(&mut MessageWriter<'_>) -> Result<()>,
    ) -> Result<Ack> {
        let mut w = self.writer(msg_type);
        build(&mut w)?;
        let sqn = w.finish()?;
        self.wait_ack(sqn)
    }

    pub fn is_closed(&self) -> bool {
        self.rx.lock().closed
    }

    /// Tell the peer the channel is done, then drop the link.
    pub fn close(&self) {
        let mut buf = BytesMut::new();
        let msg_sqn = self.tx.lock().msg_sqn;
        let frag = OpenFragment::begin(&mut buf, MsgType::CloseChannel.as_u16(), msg_sqn, 0, 0);
        frag.finish(&mut buf, FLAG_LAST | FLAG_NO_ACK);
        if let Err(e) = self.link.send(buf.freeze()) {
            trace!(channel = self.id, error = %e, "close not delivered");
        }
        self.link.close();
        self.rx.lock().closed = true;
    }
}

/// Builds one message, sending a fragment whenever the buffer fills.
pub struct MessageWriter<'a> {
    chan: &'a HaChannel,
    tx: MutexGuard<'a, TxState>,
    msg_type: MsgType,
    msg_sqn: u64,
    frag_sqn: u32,
    buf: BytesMut,
    frag: Option<OpenFragment>,
    extra_flags: u8,
}

impl<'a> MessageWriter<'a> {
    fn open(&mut self) {
        self.frag = Some(OpenFragment::begin(
            &mut self.buf,
            self.msg_type.as_u16(),
            self.msg_sqn,
            self.frag_sqn,
            0,
        ));
    }

    /// Mark the message as not to be acked.
    pub fn no_ack(&mut self) {
        self.extra_flags |= FLAG_NO_ACK;
    }

    pub fn msg_sqn(&self) -> u64 {
        self.msg_sqn
    }

    fn used(&self) -> usize {
        self.frag.as_ref().map(|f| f.len(&self.buf)).unwrap_or(0)
    }

    /// Payload bytes one more op can carry in the current fragment.
    pub fn room(&self) -> usize {
        self.chan
            .config
            .buffer_size
            .saturating_sub(self.used() + OP_HEADER_SIZE)
    }

    /// Make room for an op of `required` payload bytes, sending the current
    /// fragment if it would overflow.
    pub fn ensure(&mut self, required: usize) -> Result<()> {
        let has_ops = self.frag.as_ref().map(|f| !f.is_empty()).unwrap_or(false);
        if has_ops && self.used() + OP_HEADER_SIZE + required > self.chan.config.buffer_size {
            self.flush(false)?;
        }
        Ok(())
    }

    /// Send the current fragment, if it holds any op, and start a new one.
    pub fn break_fragment(&mut self) -> Result<()> {
        let has_ops = self.frag.as_ref().map(|f| !f.is_empty()).unwrap_or(false);
        if has_ops {
            self.flush(false)?;
        }
        Ok(())
    }

    pub fn put_op(&mut self, op_type: u16, payload: &[u8]) -> Result<()> {
        self.ensure(payload.len())?;
        if let Some(frag) = self.frag.as_mut() {
            frag.put_op(&mut self.buf, op_type, payload);
        }
        Ok(())
    }

    /// Append `data` as `[offset:8][bytes]` ops, split across fragments.
    pub fn put_data(&mut self, op_type: u16, base: u64, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            if self.room() < 8 + 64 {
                self.break_fragment()?;
            }
            let n = self.room().saturating_sub(8).max(1).min(data.len() - pos);
            if let Some(frag) = self.frag.as_mut() {
                let at = frag.begin_op(&mut self.buf, op_type);
                self.buf.put_u64(base + pos as u64);
                self.buf.put_slice(&data[pos..pos + n]);
                frag.end_op(&mut self.buf, at);
            }
            pos += n;
        }
        Ok(())
    }

    fn flush(&mut self, last: bool) -> Result<()> {
        let Some(frag) = self.frag.take() else {
            return Ok(());
        };
        let mut flags = self.extra_flags;
        if last {
            flags |= FLAG_LAST;
        }
        self.tx.unacked_frags += 1;
        let cfg = &self.chan.config;
        let flow = cfg.flow_control && !last && self.tx.unacked_frags >= cfg.tx_q_depth;
        if flow {
            flags |= FLAG_FLOW_CTRL_ACK;
        }
        let mark = flow.then(|| self.chan.rx.lock().flow_acks);
        frag.finish(&mut self.buf, flags);
        let frame = self.buf.split().freeze();
        self.chan.send_frame(frame)?;
        self.frag_sqn += 1;
        if let Some(mark) = mark {
            self.chan.wait_flow_ack(mark)?;
            self.tx.unacked_frags = 0;
        }
        if !last {
            self.open();
        }
        Ok(())
    }

    /// Send the last fragment. Returns the message sequence number.
    pub fn finish(mut self) -> Result<u64> {
        self.flush(true)?;
        self.tx.msg_sqn += 1;
        if self.tx.unacked_frags >= self.chan.config.tx_q_depth {
            self.tx.unacked_frags = 0;
        }
        Ok(self.msg_sqn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ha::ops::OpType;
    use crate::ha::transport::{HaTransport, LocalTransport};

    fn pair(config: HaConfig) -> (HaChannel, HaChannel) {
        let (a, b) = LocalTransport::pair();
        let la = a.open_channel(7).unwrap();
        let lb = b.accept_channel(Duration::from_secs(1)).unwrap().unwrap();
        let metrics = Arc::new(StoreMetrics::new());
        (
            HaChannel::new(la, config.clone(), AckingPolicy::AfterProcessing, metrics.clone()),
            HaChannel::new(lb, config, AckingPolicy::AfterProcessing, metrics),
        )
    }

    fn small() -> HaConfig {
        HaConfig::new()
            .with_buffer_size(128)
            .with_tx_q_depth(2)
            .with_flow_control(false)
    }

    #[test]
    fn test_multi_fragment_message_keeps_op_order() {
        let (tx, rx) = pair(small());
        let mut w = tx.writer(MsgType::StoreTran);
        for i in 0u8..20 {
            w.put_op(OpType::Null.as_u16(), &[i; 30]).unwrap();
        }
        assert_eq!(w.finish().unwrap(), 0);

        let msg = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(msg.msg_type, MsgType::StoreTran);
        assert!(msg.last_frag_sqn > 0);
        let ops: Vec<_> = msg.ops().collect::<Result<_>>().unwrap();
        assert_eq!(ops.len(), 20);
        for (i, op) in ops.iter().enumerate() {
            assert_eq!(op.payload, &[i as u8; 30][..]);
        }
    }

    #[test]
    fn test_coalesced_message_equals_concatenation() {
        let (tx, rx) = pair(small());
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let mut w = tx.writer(MsgType::SyncDiskGen);
        let mut head = Vec::new();
        head.extend_from_slice(&(data.len() as u64).to_be_bytes());
        head.extend_from_slice(&5u16.to_be_bytes());
        w.put_op(OpType::Null.as_u16(), &head).unwrap();
        w.put_data(OpType::Null.as_u16(), 0, &data).unwrap();
        w.finish().unwrap();

        let msg = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(msg.head().unwrap(), &head[..]);
        assert_eq!(msg.data().unwrap(), &data[..]);
    }

    #[test]
    fn test_ack_round_trip_and_wouldblock() {
        let (tx, rx) = pair(small());
        assert!(tx.receive_ack(false).unwrap_err().is_would_block());
        let sqn = {
            let mut w = tx.writer(MsgType::CreateGen);
            w.put_op(OpType::Null.as_u16(), &[0, 2, 0]).unwrap();
            w.finish().unwrap()
        };
        let msg = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        rx.send_ack(&msg.ack(ReturnCode::Ok)).unwrap();
        let ack = tx.wait_ack(sqn).unwrap();
        assert_eq!(ack.src_msg_type, MsgType::CreateGen.as_u16());
        assert!(ack.rc.is_ok());
    }

    #[test]
    fn test_flow_control_waits_for_window() {
        let cfg = small().with_flow_control(true);
        let (tx, rx) = pair(cfg);
        let rx = Arc::new(rx);
        let reader = {
            let rx = rx.clone();
            std::thread::spawn(move || rx.receive_message(Duration::from_secs(5)).unwrap().unwrap())
        };
        let mut w = tx.writer(MsgType::StoreTran);
        for _ in 0..30 {
            w.put_op(OpType::Null.as_u16(), &[1u8; 40]).unwrap();
        }
        w.finish().unwrap();
        let msg = reader.join().unwrap();
        assert_eq!(msg.ops().count(), 30);
    }

    #[test]
    fn test_fragment_gap_is_protocol_error() {
        let (tx, rx) = pair(small());
        let mut buf = BytesMut::new();
        let mut frag = OpenFragment::begin(&mut buf, MsgType::StoreTran.as_u16(), 0, 1, 0);
        frag.put_op(&mut buf, 0, b"x");
        frag.finish(&mut buf, FLAG_LAST);
        tx.link.send(buf.freeze()).unwrap();
        let err = rx.receive_message(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::FragSqnGap { expected: 0, got: 1 })));
        assert_eq!(err.return_code(), ReturnCode::SystemError);
    }

    #[test]
    fn test_coalesced_offset_overflow_is_protocol_error() {
        let (tx, rx) = pair(small());
        let mut buf = BytesMut::new();
        let mut frag = OpenFragment::begin(&mut buf, MsgType::SyncDiskGen.as_u16(), 0, 0, 0);
        frag.put_op(&mut buf, 0, &16u64.to_be_bytes());
        let mut op = u64::MAX.to_be_bytes().to_vec();
        op.extend_from_slice(b"abcd");
        frag.put_op(&mut buf, 0, &op);
        frag.finish(&mut buf, FLAG_LAST);
        tx.link.send(buf.freeze()).unwrap();
        let err = rx.receive_message(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::BadLength { .. })));
        assert_eq!(err.return_code(), ReturnCode::SystemError);
    }

    #[test]
    fn test_close_channel_is_clean_signal() {
        let (tx, rx) = pair(small());
        tx.close();
        assert!(matches!(
            rx.receive_message(Duration::from_secs(1)),
            Err(Error::CloseChannel)
        ));
    }

    #[test]
    fn test_send_fragments_forwards_prebuilt_buffer() {
        let (tx, rx) = pair(small());
        let mut buf = BytesMut::new();
        for sqn in 10..12u64 {
            let mut frag = OpenFragment::begin(&mut buf, MsgType::StoreTran.as_u16(), sqn, 0, 3);
            frag.put_op(&mut buf, 0, &sqn.to_be_bytes());
            frag.finish(&mut buf, FLAG_LAST);
        }
        assert_eq!(tx.send_fragments(&buf).unwrap(), 2);
        let a = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        let b = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!((a.msg_sqn, b.msg_sqn), (10, 11));
    }
}
