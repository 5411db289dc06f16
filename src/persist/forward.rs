//! Forwarding of persisted store-transactions to the standby.
//!
//! ```text
//! persist thread ──(stream % M)──▶ ha-tx-0 .. ha-tx-M ──▶ channel <streamId>
//!                                      │ poll acks ─▶ StreamShared::acked
//!                                      └──────────────▶ CallbackPool::notify
//! persist thread ──▶ ha-gen ──▶ internal channel (CreateGen, ActivateGen, WriteGen)
//! ```
//!
//! Disk durability and replication run side by side: the persist thread
//! hands a copy of each batch to a transmit worker and moves on. A broken
//! link marks the forwarder lost; `HasStandby` drops and every waiting
//! callback becomes ready.

use crate::codec::{clear_no_ack, split_fragment};
use crate::error::{Error, Result};
use crate::ha::channel::HaChannel;
use crate::ha::gen_msg::{self, GenMessage};
use crate::ha::message::MsgType;
use crate::ha::transport::HaTransport;
use crate::ha::HaContext;
use crate::persist::callbacks::CallbackPool;
use crate::persist::stream::StreamShared;
use crate::types::{ChannelId, StreamId, INTERNAL_CHANNEL};
use bytes::BytesMut;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const ACK_POLL: Duration = Duration::from_millis(2);
const GEN_POLL: Duration = Duration::from_millis(50);

/// Offset of the flags byte in a fragment header.
const FLAGS_OFFSET: usize = 18;

struct Batch {
    stream: Arc<StreamShared>,
    chan: Arc<HaChannel>,
    data: BytesMut,
}

struct GenJob {
    msg_type: MsgType,
    msg: GenMessage,
    reply: Option<Sender<Result<()>>>,
}

/// Sends persisted data and generation messages to one standby.
pub struct Forwarder {
    ctx: HaContext,
    transport: Arc<dyn HaTransport>,
    callbacks: Arc<CallbackPool>,
    channels: Mutex<HashMap<StreamId, Arc<HaChannel>>>,
    internal: Arc<HaChannel>,
    workers: Vec<Sender<Batch>>,
    gen_tx: Sender<GenJob>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    lost: AtomicBool,
    stop: AtomicBool,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("workers", &self.workers.len())
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl Forwarder {
    /// Open the internal channel and start `tx_threads` transmit workers.
    pub fn start(
        ctx: HaContext,
        transport: Arc<dyn HaTransport>,
        callbacks: Arc<CallbackPool>,
        tx_threads: usize,
    ) -> Result<Arc<Self>> {
        let internal = Arc::new(ctx.channel(transport.open_channel(INTERNAL_CHANNEL)?));
        let mut worker_rx = Vec::new();
        let mut workers = Vec::new();
        for _ in 0..tx_threads.max(1) {
            let (tx, rx) = unbounded();
            workers.push(tx);
            worker_rx.push(rx);
        }
        let (gen_tx, gen_rx) = unbounded();
        let fwd = Arc::new(Self {
            ctx,
            transport,
            callbacks,
            channels: Mutex::new(HashMap::new()),
            internal,
            workers,
            gen_tx,
            threads: Mutex::new(Vec::new()),
            lost: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });
        for (i, rx) in worker_rx.into_iter().enumerate() {
            let f = fwd.clone();
            let handle = thread::Builder::new()
                .name(format!("ha-tx-{}", i))
                .spawn(move || f.run_tx(rx))
                .map_err(|e| Error::Internal(format!("failed to spawn HA transmit thread: {}", e)))?;
            fwd.threads.lock().push(handle);
        }
        let f = fwd.clone();
        let handle = thread::Builder::new()
            .name("ha-gen".into())
            .spawn(move || f.run_gen(gen_rx))
            .map_err(|e| Error::Internal(format!("failed to spawn HA generation thread: {}", e)))?;
        fwd.threads.lock().push(handle);
        info!(tx_threads = fwd.workers.len(), "forwarding to standby");
        Ok(fwd)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Open the standby channel of a stream.
    pub fn attach_stream(&self, stream: StreamId) -> Result<()> {
        self.channel(stream).map(|_| ())
    }

    fn channel(&self, stream: StreamId) -> Result<Arc<HaChannel>> {
        if let Some(chan) = self.channels.lock().get(&stream) {
            return Ok(chan.clone());
        }
        let link = self.transport.open_channel(stream as ChannelId)?;
        let chan = Arc::new(self.ctx.channel(link));
        self.channels.lock().insert(stream, chan.clone());
        debug!(stream, "stream channel opened");
        Ok(chan)
    }

    /// Queue the fragments of one persisted batch. Messages below
    /// `forward_from` are skipped; the last fragment of every
    /// store-transaction on a user stream asks for an ack.
    pub fn forward(&self, stream: &Arc<StreamShared>, data: &[u8], forward_from: u64) -> Result<()> {
        if self.is_lost() || data.is_empty() {
            return Ok(());
        }
        let mut out = BytesMut::with_capacity(data.len());
        let mut pos = 0;
        while pos < data.len() {
            let (header, _) = split_fragment(&data[pos..])?;
            let len = header.total_len();
            if header.msg_sqn >= forward_from {
                let start = out.len();
                out.extend_from_slice(&data[pos..pos + len]);
                let acked = header.msg_type == MsgType::StoreTran.as_u16() && !stream.is_internal();
                if header.is_last() && acked {
                    clear_no_ack(&mut out, start + FLAGS_OFFSET);
                }
            }
            pos += len;
        }
        if out.is_empty() {
            return Ok(());
        }
        let chan = match self.channel(stream.id) {
            Ok(chan) => chan,
            Err(e) => {
                self.mark_lost(&e);
                return Ok(());
            }
        };
        let worker = &self.workers[stream.id as usize % self.workers.len()];
        let batch = Batch {
            stream: stream.clone(),
            chan,
            data: out,
        };
        if worker.send(batch).is_err() {
            trace!(stream = stream.id, "transmit worker gone");
        }
        Ok(())
    }

    /// Send a generation message and wait until the standby acked it.
    pub fn send_gen(&self, msg_type: MsgType, msg: GenMessage) -> Result<()> {
        if self.is_lost() {
            return Ok(());
        }
        let (tx, rx) = bounded(1);
        self.gen_tx
            .send(GenJob {
                msg_type,
                msg,
                reply: Some(tx),
            })
            .map_err(|_| Error::NotAvailable("generation sender stopped".into()))?;
        match rx.recv_timeout(self.ctx.config.ack_timeout) {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Queue a generation message without waiting for its ack.
    pub fn post_gen(&self, msg_type: MsgType, msg: GenMessage) {
        if self.is_lost() {
            return;
        }
        let _ = self.gen_tx.send(GenJob {
            msg_type,
            msg,
            reply: None,
        });
    }

    /// Give up on the standby after `e`.
    pub(crate) fn mark_lost(&self, e: &Error) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        if e.is_connection_broke() {
            warn!("standby connection lost, continuing without replication");
        } else {
            error!(error = %e, "replication to standby failed, continuing without it");
        }
        self.ctx.info.set_has_standby(false);
        self.ctx.metrics.has_standby.set(0);
        self.callbacks.notify_all();
    }

    fn run_tx(self: Arc<Self>, rx: Receiver<Batch>) {
        let mut served: HashMap<StreamId, (Arc<StreamShared>, Arc<HaChannel>)> = HashMap::new();
        while !self.stop.load(Ordering::Acquire) && !self.is_lost() {
            match rx.recv_timeout(ACK_POLL) {
                Ok(batch) => {
                    served
                        .entry(batch.stream.id)
                        .or_insert_with(|| (batch.stream.clone(), batch.chan.clone()));
                    if let Err(e) = batch.chan.send_fragments(&batch.data) {
                        self.mark_lost(&e);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            for (stream, chan) in served.values() {
                if let Err(e) = self.drain_acks(stream, chan) {
                    self.mark_lost(&e);
                    break;
                }
            }
        }
        trace!("transmit worker done");
    }

    fn drain_acks(&self, stream: &StreamShared, chan: &HaChannel) -> Result<()> {
        let mut advanced = false;
        loop {
            match chan.receive_ack(false) {
                Ok(ack) if ack.rc.is_ok() => {
                    stream.acked(ack.ack_sqn);
                    advanced = true;
                }
                Ok(ack) => {
                    return Err(Error::Internal(format!(
                        "standby failed to apply message {} of stream {}: {:?}",
                        ack.ack_sqn, stream.id, ack.rc
                    )))
                }
                Err(e) if e.is_would_block() => break,
                Err(Error::CloseChannel) => return Err(crate::error::TransportError::ConnectionBroke.into()),
                Err(e) => return Err(e),
            }
        }
        if advanced {
            self.callbacks.notify(stream.worker);
        }
        Ok(())
    }

    fn run_gen(self: Arc<Self>, rx: Receiver<GenJob>) {
        while !self.stop.load(Ordering::Acquire) {
            let job = match rx.recv_timeout(GEN_POLL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let res = if self.is_lost() {
                Ok(())
            } else {
                gen_msg::send(&self.internal, job.msg_type, &job.msg)
            };
            if let Err(e) = &res {
                if e.is_connection_broke() || matches!(e, Error::CloseChannel) {
                    self.mark_lost(e);
                } else {
                    error!(msg_type = ?job.msg_type, gen_id = job.msg.gen_id, error = %e, "standby rejected generation message");
                }
            }
            if let Some(reply) = job.reply {
                let _ = reply.send(res);
            }
        }
        trace!("generation sender done");
    }

    /// Stop the workers and close every channel.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let current = thread::current().id();
        let threads: Vec<_> = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            if t.thread().id() != current {
                let _ = t.join();
            }
        }
        for chan in self.channels.lock().drain().map(|(_, c)| c) {
            chan.close();
        }
        self.internal.close();
        debug!("forwarder stopped");
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HaConfig, MemoryConfig, PersistConfig};
    use crate::disk::FileDiskTasks;
    use crate::ha::info::HaInfo;
    use crate::ha::message::Ack;
    use crate::ha::ops::Operation;
    use crate::ha::transport::LocalTransport;
    use crate::memory::{MemoryStore, NoWriteBack};
    use crate::metrics::StoreMetrics;
    use crate::persist::stream::encode_message;
    use crate::testing::failpoint::FailpointRegistry;
    use crate::types::Handle;
    use crate::error::ReturnCode;
    use tempfile::TempDir;

    fn context(tmp: &TempDir) -> HaContext {
        HaContext {
            store: Arc::new(MemoryStore::new(MemoryConfig::small(), Arc::new(NoWriteBack)).unwrap()),
            disk: Arc::new(FileDiskTasks::open(tmp.path()).unwrap()),
            info: Arc::new(HaInfo::new()),
            config: HaConfig::new(),
            metrics: Arc::new(StoreMetrics::new()),
            failpoints: Arc::new(FailpointRegistry::new()),
        }
    }

    fn message(stream: StreamId, sqn: u64) -> BytesMut {
        let op = Operation::UpdateRecordState {
            handle: Handle::new(2, 4096),
            state: sqn,
        };
        let mut msg = encode_message(MsgType::StoreTran, stream, &[op], 4096);
        crate::codec::wire::patch_u64(&mut msg, 6, sqn);
        msg
    }

    #[test]
    fn test_forward_skips_old_messages_and_collects_acks() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let config = PersistConfig::new(tmp.path()).with_async_threads(2);
        let callbacks = Arc::new(
            CallbackPool::start(&config, ctx.info.clone(), ctx.metrics.clone(), None).unwrap(),
        );
        let (primary, standby) = LocalTransport::pair();
        let fwd = Forwarder::start(ctx.clone(), primary, callbacks.clone(), 1).unwrap();
        let internal = standby.accept_channel(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(internal.channel_id(), INTERNAL_CHANNEL);

        let stream = Arc::new(StreamShared::new(7, 1, false));
        let mut data = message(7, 3);
        data.extend_from_slice(&message(7, 4));
        data.extend_from_slice(&message(7, 5));
        fwd.forward(&stream, &data, 4).unwrap();

        let link = standby.accept_channel(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(link.channel_id(), 7);
        let rx = ctx.channel(link);
        let first = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        let second = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!((first.msg_sqn, second.msg_sqn), (4, 5));
        assert!(!first.no_ack());

        rx.send_ack(&second.ack(ReturnCode::Ok)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while stream.ack_sqn() < 6 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stream.ack_sqn(), 6);

        fwd.shutdown();
        callbacks.stop(Duration::ZERO);
    }

    #[test]
    fn test_failed_ack_marks_standby_lost() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        ctx.info.set_has_standby(true);
        let config = PersistConfig::new(tmp.path());
        let callbacks = Arc::new(
            CallbackPool::start(&config, ctx.info.clone(), ctx.metrics.clone(), None).unwrap(),
        );
        let (primary, standby) = LocalTransport::pair();
        let fwd = Forwarder::start(ctx.clone(), primary, callbacks.clone(), 2).unwrap();
        let _internal = standby.accept_channel(Duration::from_secs(1)).unwrap().unwrap();

        let stream = Arc::new(StreamShared::new(3, 0, false));
        fwd.forward(&stream, &message(3, 0), 0).unwrap();
        let rx = ctx.channel(standby.accept_channel(Duration::from_secs(1)).unwrap().unwrap());
        let msg = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        rx.send_ack(&Ack {
            rc: ReturnCode::SystemError,
            ..msg.ack(ReturnCode::Ok)
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fwd.is_lost() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(fwd.is_lost());
        assert!(!ctx.info.has_standby());
        fwd.shutdown();
        callbacks.stop(Duration::ZERO);
    }
}
