//! The persist thread and the API writers use to reach it.
//!
//! ```text
//! writers ──push──▶ PersistStream (one per writer)
//!                        │ take
//!                        ▼
//!                  persist thread ──record──▶ ST_<g>_<f> (sync_data)
//!                        │                 └─▶ Forwarder ──▶ standby
//!                        ├─▶ CallbackPool (callbacks of the batch)
//!                        ├─▶ wakeup (Yield | SignalThread | None)
//!                        └─▶ FileFlip / GenTran between rounds
//! ```
//!
//! One round takes every stream's pending buffer, frames the fragments
//! into a single record and appends it. A failed write is fatal: the
//! pipeline fails every pending callback with a disk error and refuses
//! new work.

use crate::codec::{split_fragment, RecordLayout};
use crate::config::{PersistConfig, ThreadPolicy};
use crate::disk::{DiskGenInfo, TaskParams};
use crate::error::{DiskError, Error, ReturnCode, Result};
use crate::ha::HaContext;
use crate::persist::callbacks::{CallbackPool, STOP_DRAIN};
use crate::persist::files::{LogWriter, PersistDir};
use crate::persist::forward::Forwarder;
use crate::persist::record::{frame_record, RecordHead};
use crate::persist::recovery::Recovered;
use crate::persist::state::PState;
use crate::persist::stream::{PersistStream, StreamBatch, StreamLimits, StreamShared};
use crate::persist::transition::{free_maps, FileFlip, GenTran, WrittenGen};
use crate::testing::failpoint::{points, FailpointResult};
use crate::types::{now_millis, CommitCallback, EventSink, GenId, StoreEvent, StreamId, INTERNAL_STREAM};
use bytes::BytesMut;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const IDLE_WAIT: Duration = Duration::from_millis(10);
const ACK_POLL: Duration = Duration::from_millis(1);

/// Lifecycle of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineStatus {
    Running = 0,
    Terminating = 1,
    /// A write failed; nothing is persisted anymore.
    Fatal = 2,
    Stopped = 3,
}

impl PipelineStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Terminating,
            2 => Self::Fatal,
            _ => Self::Stopped,
        }
    }
}

/// Outcome of one write round.
pub(crate) enum Round {
    Idle,
    Wrote,
    /// A simulated crash stopped the thread.
    Crashed,
}

/// What an injected failure asks for.
pub(crate) enum Injected {
    Continue,
    Crash,
    Fail,
}

struct GenWriteResult {
    gen_id: GenId,
    index: u8,
    free_maps: Vec<Vec<u8>>,
    result: Result<DiskGenInfo>,
}

#[derive(Default)]
struct Requests {
    kicked: bool,
    file_flip: bool,
    gen_tran: bool,
    written: VecDeque<GenWriteResult>,
}

/// State shared by the persist thread, writers and disk callbacks.
pub(crate) struct Shared {
    pub(crate) config: PersistConfig,
    pub(crate) ctx: HaContext,
    pub(crate) dir: PersistDir,
    streams: RwLock<BTreeMap<StreamId, Arc<PersistStream>>>,
    callbacks: Arc<CallbackPool>,
    status: AtomicU8,
    requests: Mutex<Requests>,
    wake: Condvar,
    forwarder: RwLock<Option<Arc<Forwarder>>>,
    events: Option<EventSink>,
    /// Mirrors `PState.genTr`, also set while a transition is requested.
    pub(crate) gen_tr: AtomicBool,
    crashed: AtomicBool,
    next_stream: AtomicU32,
}

impl Shared {
    fn status(&self) -> PipelineStatus {
        PipelineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Wake the persist thread.
    pub(crate) fn kick(&self) {
        self.requests.lock().kicked = true;
        self.wake.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut r = self.requests.lock();
        if !r.kicked {
            self.wake.wait_for(&mut r, timeout);
        }
        r.kicked = false;
    }

    pub(crate) fn forwarder(&self) -> Option<Arc<Forwarder>> {
        self.forwarder.read().clone()
    }

    pub(crate) fn injected(&self, name: &str) -> Injected {
        if !(cfg!(feature = "failpoints") || cfg!(test)) {
            return Injected::Continue;
        }
        match self.ctx.failpoints.check(name) {
            FailpointResult::Continue => Injected::Continue,
            FailpointResult::Return => Injected::Crash,
            FailpointResult::Error => Injected::Fail,
        }
    }

    /// Stop the persist thread as if the process died here.
    pub(crate) fn crash(&self) {
        warn!("persist thread stopped by injected crash");
        self.crashed.store(true, Ordering::Release);
        for stream in self.streams.read().values() {
            stream.wake();
        }
    }

    fn halted(&self) -> Option<Error> {
        if self.crashed.load(Ordering::Acquire) {
            return Some(Error::StoreTerm);
        }
        match self.status() {
            PipelineStatus::Running => None,
            PipelineStatus::Fatal => Some(DiskError::Fatal.into()),
            PipelineStatus::Terminating | PipelineStatus::Stopped => Some(Error::StoreTerm),
        }
    }

    /// Write a generation file; the completion is handled by the persist
    /// thread.
    pub(crate) fn schedule_gen_write(self: &Arc<Self>, gen_id: GenId, index: u8, image: Vec<u8>, free_maps: Vec<Vec<u8>>) {
        debug!(gen_id, index, bytes = image.len(), "writing generation");
        let shared = self.clone();
        self.ctx.disk.write_generation(
            TaskParams::new(gen_id).cancel_on_term(),
            image,
            Box::new(move |result: Result<DiskGenInfo>| {
                shared.requests.lock().written.push_back(GenWriteResult {
                    gen_id,
                    index,
                    free_maps,
                    result,
                });
                shared.kick();
            }),
        );
    }

    fn fatal(&self, e: &Error) {
        let prev = self.status.swap(PipelineStatus::Fatal as u8, Ordering::AcqRel);
        if prev == PipelineStatus::Fatal as u8 {
            return;
        }
        error!(error = %e, "persistence failed, refusing further store-transactions");
        if let Some(sink) = &self.events {
            sink(StoreEvent::DiskError);
        }
        for stream in self.streams.read().values() {
            if let Some(batch) = stream.take() {
                self.callbacks
                    .dispatch(batch.stream.worker, batch.callbacks, ReturnCode::DiskError);
            }
            stream.done();
        }
    }

    fn drop_lost_forwarder(&self) {
        let lost = {
            let mut slot = self.forwarder.write();
            match slot.as_ref() {
                Some(fwd) if fwd.is_lost() => slot.take(),
                _ => None,
            }
        };
        if let Some(fwd) = lost {
            fwd.shutdown();
            info!("standby detached");
        }
    }
}

/// State owned by the persist thread.
pub(crate) struct Persister {
    pub(crate) shared: Arc<Shared>,
    pub(crate) pstate: PState,
    pub(crate) log: LogWriter,
    pub(crate) flip: FileFlip,
    pub(crate) gen_tran: GenTran,
    layout: RecordLayout,
    payload: BytesMut,
    record: BytesMut,
    cursor: usize,
    signal: Option<Sender<Vec<Arc<PersistStream>>>>,
}

impl Persister {
    fn run(mut self) {
        info!(
            cycle_id = self.pstate.cycle_id,
            slot = self.pstate.start_gen,
            file = self.pstate.current_file(),
            "persist thread started"
        );
        loop {
            match self.cycle() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.shared.fatal(&e);
                    break;
                }
            }
        }
        let clean = !self.shared.crashed.load(Ordering::Acquire) && self.shared.status() == PipelineStatus::Terminating;
        if clean {
            self.pstate.mark_clean_stop();
            match self.pstate.store(&self.shared.dir.pstate()) {
                Ok(()) => info!(cycle_id = self.pstate.cycle_id, "persist thread stopped cleanly"),
                Err(e) => error!(error = %e, "failed to record clean stop"),
            }
        }
    }

    /// One pass of the thread loop. `false` once the thread should exit.
    fn cycle(&mut self) -> Result<bool> {
        self.handle_requests()?;
        self.step_transitions()?;
        if self.shared.crashed.load(Ordering::Acquire) {
            return Ok(false);
        }
        match self.write_round()? {
            Round::Crashed => return Ok(false),
            Round::Wrote => return Ok(true),
            Round::Idle => {}
        }
        if self.shared.status() != PipelineStatus::Running && self.transitions_idle() {
            return Ok(false);
        }
        self.shared.wait(IDLE_WAIT);
        Ok(true)
    }

    fn handle_requests(&mut self) -> Result<()> {
        if !self.transitions_idle() {
            return Ok(());
        }
        let mut r = self.shared.requests.lock();
        if self.shared.status() != PipelineStatus::Running {
            r.file_flip = false;
            r.gen_tran = false;
            return Ok(());
        }
        if let Some(w) = r.written.pop_front() {
            drop(r);
            match w.result {
                Ok(info) => self.start_file_flip(Some(WrittenGen {
                    gen_id: w.gen_id,
                    index: w.index,
                    size: info.size,
                    free_maps: w.free_maps,
                })),
                Err(Error::Disk(DiskError::Cancelled)) => {
                    debug!(gen_id = w.gen_id, "generation write cancelled, left for recovery")
                }
                Err(e) => return Err(e),
            }
        } else if r.gen_tran {
            r.gen_tran = false;
            drop(r);
            self.start_gen_tran();
        } else if r.file_flip && !self.pstate.gen_tr {
            // The closed generation's log must stay until its file is written.
            r.file_flip = false;
            drop(r);
            self.start_file_flip(None);
        }
        Ok(())
    }

    /// Persist what every stream has pending as one record.
    pub(crate) fn write_round(&mut self) -> Result<Round> {
        let mut streams: Vec<Arc<PersistStream>> = self.shared.streams.read().values().cloned().collect();
        if streams.is_empty() {
            return Ok(Round::Idle);
        }
        self.cursor = self.cursor.wrapping_add(1);
        let start = self.cursor % streams.len();
        streams.rotate_left(start);

        self.payload.clear();
        let mut st_count = 0u32;
        let mut batches = Vec::new();
        for stream in streams {
            if self.payload.len() >= self.shared.config.write_batch_size {
                break;
            }
            let Some(batch) = stream.take() else { continue };
            let mut pos = 0;
            while pos < batch.data.len() {
                let (header, _) = split_fragment(&batch.data[pos..])?;
                let len = header.total_len();
                self.layout.convert(&batch.data[pos..pos + len], &mut self.payload)?;
                if header.is_last() {
                    st_count += 1;
                }
                pos += len;
            }
            batches.push((stream, batch));
        }
        if batches.is_empty() {
            return Ok(Round::Idle);
        }

        let outcome = if self.payload.is_empty() {
            Ok(true)
        } else {
            self.write_record(st_count)
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                self.fail_batches(batches, ReturnCode::StoreTerm);
                return Ok(Round::Crashed);
            }
            Err(e) => {
                self.fail_batches(batches, ReturnCode::DiskError);
                return Err(e);
            }
        }

        if let Some(fwd) = self.shared.forwarder() {
            if fwd.is_lost() {
                self.shared.drop_lost_forwarder();
            } else {
                for (stream, batch) in &batches {
                    fwd.forward(&batch.stream, &batch.data, stream.forward_from())?;
                }
            }
        }

        let mut written = Vec::with_capacity(batches.len());
        for (stream, batch) in batches {
            if !batch.callbacks.is_empty() {
                self.shared
                    .callbacks
                    .dispatch(batch.stream.worker, batch.callbacks, ReturnCode::Ok);
            }
            written.push(stream);
        }
        self.wake_writers(written);

        if self.log.len() >= self.shared.config.file_size && matches!(self.flip, FileFlip::Idle) {
            self.shared.requests.lock().file_flip = true;
        }
        Ok(Round::Wrote)
    }

    /// Frame the round's payload and append it. `false` after an injected
    /// crash.
    fn write_record(&mut self, st_count: u32) -> Result<bool> {
        let head = RecordHead {
            timestamp: now_millis(),
            cycle_id: self.log.cycle_id(),
            len: self.payload.len() as u32,
            st_count,
        };
        self.record.clear();
        frame_record(&mut self.record, head, &self.payload, self.shared.config.block_size);
        match self.shared.injected(points::PERSIST_BEFORE_WRITE) {
            Injected::Continue => {}
            Injected::Crash => {
                self.shared.crash();
                return Ok(false);
            }
            Injected::Fail => return Err(DiskError::Fatal.into()),
        }
        let started = Instant::now();
        self.log.append(&self.record)?;
        let metrics = &self.shared.ctx.metrics;
        metrics.batch_write.observe_since(started);
        if let Injected::Fail = self.shared.injected(points::PERSIST_AFTER_WRITE) {
            return Err(DiskError::Fatal.into());
        }
        metrics.bytes_written.inc_by(self.record.len() as u64);
        metrics.records_written.inc();
        metrics.sts_committed.inc_by(st_count as u64);
        trace!(bytes = self.record.len(), st_count, "record written");
        Ok(true)
    }

    fn fail_batches(&self, batches: Vec<(Arc<PersistStream>, StreamBatch)>, rc: ReturnCode) {
        for (stream, batch) in batches {
            if !batch.callbacks.is_empty() {
                self.shared.callbacks.dispatch(batch.stream.worker, batch.callbacks, rc);
            }
            stream.done();
        }
    }

    fn wake_writers(&mut self, streams: Vec<Arc<PersistStream>>) {
        match self.shared.config.thread_policy {
            ThreadPolicy::Yield => {
                for s in &streams {
                    s.done();
                }
                thread::yield_now();
            }
            ThreadPolicy::SignalThread => match &self.signal {
                Some(tx) => {
                    if let Err(e) = tx.send(streams) {
                        for s in e.into_inner() {
                            s.done();
                        }
                    }
                }
                None => streams.iter().for_each(|s| s.done()),
            },
            ThreadPolicy::None => streams.iter().for_each(|s| s.release()),
        }
    }
}

fn run_signal(rx: Receiver<Vec<Arc<PersistStream>>>) {
    for streams in rx {
        for s in streams {
            s.done();
        }
    }
    trace!("signal thread done");
}

/// Handle on the running persistence pipeline.
pub struct PersistPipeline {
    shared: Arc<Shared>,
    limits: StreamLimits,
    thread: Mutex<Option<JoinHandle<()>>>,
    signal: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PersistPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistPipeline")
            .field("status", &self.status())
            .field("streams", &self.shared.streams.read().len())
            .finish()
    }
}

impl PersistPipeline {
    /// Start the persist thread on top of a recovered state.
    pub fn start(
        config: PersistConfig,
        ctx: HaContext,
        dir: PersistDir,
        recovered: Recovered,
        events: Option<EventSink>,
    ) -> Result<Arc<Self>> {
        let callbacks = Arc::new(CallbackPool::start(
            &config,
            ctx.info.clone(),
            ctx.metrics.clone(),
            events.clone(),
        )?);
        let limits = StreamLimits {
            buffer_size: config.stream_buffer_size,
            max_callbacks: config.max_stream_callbacks,
        };
        let first_stream = recovered
            .next_msg_sqn
            .keys()
            .max()
            .map(|id| id + 1)
            .unwrap_or(1)
            .max(1);

        let internal = PersistStream::new(
            StreamShared::new(INTERNAL_STREAM, callbacks.assign(true), true),
            limits,
        );
        if let Some(next) = recovered.next_msg_sqn.get(&INTERNAL_STREAM) {
            internal.set_next_msg_sqn(*next);
        }
        let mut streams = BTreeMap::new();
        streams.insert(INTERNAL_STREAM, Arc::new(internal));

        let shared = Arc::new(Shared {
            config: config.clone(),
            ctx,
            dir,
            streams: RwLock::new(streams),
            callbacks,
            status: AtomicU8::new(PipelineStatus::Running as u8),
            requests: Mutex::new(Requests::default()),
            wake: Condvar::new(),
            forwarder: RwLock::new(None),
            events,
            gen_tr: AtomicBool::new(recovered.pstate.gen_tr),
            crashed: AtomicBool::new(false),
            next_stream: AtomicU32::new(first_stream),
        });

        let (signal_tx, signal) = if config.thread_policy == ThreadPolicy::SignalThread {
            let (tx, rx) = unbounded();
            let handle = thread::Builder::new()
                .name("persist-signal".into())
                .spawn(move || run_signal(rx))
                .map_err(|e| Error::Internal(format!("failed to spawn signal thread: {}", e)))?;
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let layout = recovered.layout;
        let persister = Persister {
            shared: shared.clone(),
            pstate: recovered.pstate,
            log: recovered.log,
            flip: FileFlip::Idle,
            gen_tran: GenTran::Idle,
            layout,
            payload: BytesMut::with_capacity(config.write_batch_size),
            record: BytesMut::with_capacity(config.write_batch_size),
            cursor: 0,
            signal: signal_tx,
        };
        let thread = thread::Builder::new()
            .name("persist".into())
            .spawn(move || persister.run())
            .map_err(|e| Error::Internal(format!("failed to spawn persist thread: {}", e)))?;

        if let Some((gen_id, index)) = recovered.pending_write {
            let store = &shared.ctx.store;
            let image = store.compact(gen_id)?;
            let maps = free_maps(store, gen_id)?;
            info!(gen_id, "rescheduling interrupted generation write");
            shared.schedule_gen_write(gen_id, index, image, maps);
        }

        Ok(Arc::new(Self {
            shared,
            limits,
            thread: Mutex::new(Some(thread)),
            signal: Mutex::new(signal),
        }))
    }

    pub fn status(&self) -> PipelineStatus {
        if self.shared.crashed.load(Ordering::Acquire) {
            return PipelineStatus::Stopped;
        }
        self.shared.status()
    }

    /// Whether an injected crash stopped the persist thread.
    pub fn crashed(&self) -> bool {
        self.shared.crashed.load(Ordering::Acquire)
    }

    pub fn callbacks(&self) -> &Arc<CallbackPool> {
        &self.shared.callbacks
    }

    /// Fail with the reason new work is refused, if it is.
    pub fn check_running(&self) -> Result<()> {
        match self.shared.halted() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether a generation transition is requested, running or waiting
    /// for the old generation to reach disk.
    pub fn gen_transition_pending(&self) -> bool {
        self.shared.gen_tr.load(Ordering::Acquire)
    }

    pub fn open_stream(&self, high_perf: bool) -> Result<StreamId> {
        self.check_running()?;
        let id = self.shared.next_stream.fetch_add(1, Ordering::AcqRel);
        let worker = self.shared.callbacks.assign(high_perf);
        let stream = Arc::new(PersistStream::new(StreamShared::new(id, worker, high_perf), self.limits));
        if let Some(fwd) = self.shared.forwarder() {
            stream.attach_standby();
            fwd.attach_stream(id)?;
        }
        self.shared.streams.write().insert(id, stream);
        debug!(stream = id, high_perf, worker, "stream opened");
        Ok(id)
    }

    pub fn stream(&self, id: StreamId) -> Result<Arc<PersistStream>> {
        self.shared
            .streams
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotAvailable(format!("stream {} is not open", id)))
    }

    /// Queue one encoded message on a stream.
    pub fn submit(&self, stream: StreamId, fragments: BytesMut, callback: Option<CommitCallback>) -> Result<u64> {
        let s = self.stream(stream)?;
        let shared = &self.shared;
        let sqn = s.push(fragments, callback, || shared.halted())?;
        shared.kick();
        Ok(sqn)
    }

    /// Queue a callback behind everything already submitted on a stream.
    pub fn submit_callback(&self, stream: StreamId, callback: CommitCallback) -> Result<()> {
        self.check_running()?;
        self.stream(stream)?.push_callback(callback)?;
        self.shared.kick();
        Ok(())
    }

    /// Wait until the stream's messages are durable, then close it.
    pub fn close_stream(&self, id: StreamId, timeout: Duration) -> Result<()> {
        if id == INTERNAL_STREAM {
            return Err(Error::Config("the internal stream cannot be closed".into()));
        }
        let stream = self.stream(id)?;
        if !stream.wait_idle(timeout) {
            warn!(stream = id, "closing stream with unwritten messages");
        }
        self.shared.streams.write().remove(&id);
        let left = stream.close();
        if !left.is_empty() {
            self.shared
                .callbacks
                .dispatch(stream.shared().worker, left, ReturnCode::StoreTerm);
        }
        debug!(stream = id, "stream closed");
        Ok(())
    }

    /// Ask for a file flip at the next opportunity.
    pub fn request_file_flip(&self) -> Result<()> {
        self.check_running()?;
        self.shared.requests.lock().file_flip = true;
        self.shared.kick();
        Ok(())
    }

    /// Close the active generation and open a new one.
    pub fn request_gen_transition(&self) -> Result<()> {
        self.check_running()?;
        if self.shared.gen_tr.swap(true, Ordering::AcqRel) {
            return Err(Error::NotAvailable("a generation transition is in progress".into()));
        }
        self.shared.requests.lock().gen_tran = true;
        self.shared.kick();
        Ok(())
    }

    /// Start forwarding to a freshly synced standby. Called with the store
    /// lock held so no message slips between the sync and the forwarding.
    pub fn attach_forwarder(&self, fwd: Arc<Forwarder>) -> Result<()> {
        let streams: Vec<_> = self.shared.streams.read().values().cloned().collect();
        for stream in streams {
            let from = stream.attach_standby();
            if !stream.shared().is_internal() {
                fwd.attach_stream(stream.id())?;
            }
            trace!(stream = stream.id(), from, "stream forwarding");
        }
        let prev = self.shared.forwarder.write().replace(fwd);
        if let Some(prev) = prev {
            prev.shutdown();
        }
        Ok(())
    }

    pub fn forwarder(&self) -> Option<Arc<Forwarder>> {
        self.shared.forwarder()
    }

    /// Stop forwarding, e.g. when the standby is taken away.
    pub fn detach_forwarder(&self) {
        if let Some(fwd) = self.shared.forwarder.write().take() {
            fwd.shutdown();
        }
        self.shared.ctx.info.set_has_standby(false);
        self.shared.ctx.metrics.has_standby.set(0);
        self.shared.callbacks.notify_all();
    }

    /// Wait until everything submitted is durable and, with
    /// `wait_for_ack`, acked by the standby.
    pub fn flush(&self, wait_for_ack: bool, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let streams: Vec<_> = self.shared.streams.read().values().cloned().collect();
        for s in &streams {
            self.check_running()?;
            if !s.wait_idle(deadline.saturating_duration_since(Instant::now())) {
                return Err(Error::Timeout);
            }
        }
        if !wait_for_ack {
            return Ok(());
        }
        for s in streams.iter().filter(|s| !s.shared().is_internal()) {
            while self.shared.ctx.info.has_standby() && s.shared().ack_sqn() < s.next_msg_sqn() {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
                thread::sleep(ACK_POLL);
            }
        }
        Ok(())
    }

    /// Drain, finish running transitions, record a clean stop and stop
    /// every pipeline thread.
    pub fn stop(&self) {
        let _ = self.shared.status.compare_exchange(
            PipelineStatus::Running as u8,
            PipelineStatus::Terminating as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shared.kick();
        if let Some(h) = self.thread.lock().take() {
            if h.join().is_err() {
                error!("persist thread panicked");
            }
        }
        if let Some(h) = self.signal.lock().take() {
            let _ = h.join();
        }
        let rc = if self.shared.status() == PipelineStatus::Fatal {
            ReturnCode::DiskError
        } else {
            ReturnCode::StoreTerm
        };
        let streams: Vec<_> = std::mem::take(&mut *self.shared.streams.write()).into_values().collect();
        for stream in streams {
            let left = stream.close();
            if !left.is_empty() {
                self.shared.callbacks.dispatch(stream.shared().worker, left, rc);
            }
        }
        if let Some(fwd) = self.shared.forwarder.write().take() {
            fwd.shutdown();
        }
        self.shared.callbacks.stop(STOP_DRAIN);
        if self.shared.status() != PipelineStatus::Fatal {
            self.shared
                .status
                .store(PipelineStatus::Stopped as u8, Ordering::Release);
        }
        info!("persistence pipeline stopped");
    }
}

impl Drop for PersistPipeline {
    fn drop(&mut self) {
        if self.thread.lock().is_some() {
            self.stop();
        }
    }
}
