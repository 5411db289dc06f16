//! Asynchronous commit callback delivery.
//!
//! Each stream is bound to one worker when it opens, so its callbacks run
//! in commit order. A callback is ready once its batch is durable and, with
//! a standby attached, the standby acked the message. A worker skips a
//! stream whose head callback is not ready instead of waiting on it, so a
//! slow stream never holds back the others.
//!
//! Workers `0..high_perf_threads` serve high-performance streams; the rest
//! serve normal streams. Streams are assigned round-robin within each group.

use crate::config::PersistConfig;
use crate::error::{Error, ReturnCode, Result};
use crate::ha::HaInfo;
use crate::metrics::StoreMetrics;
use crate::persist::stream::PendingCallback;
use crate::types::{EventSink, StoreEvent, StreamId};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const IDLE_WAIT: Duration = Duration::from_millis(100);
const READY_POLL: Duration = Duration::from_millis(1);

/// How long `stop` lets workers drain before failing what is left.
pub const STOP_DRAIN: Duration = Duration::from_secs(2);

enum Delivery {
    Callbacks(Vec<PendingCallback>, ReturnCode),
    Wake,
    Stop(Instant),
}

struct PoolShared {
    queued: AtomicUsize,
    hwm: usize,
    lwm: usize,
    alert: AtomicBool,
    info: Arc<HaInfo>,
    events: Option<EventSink>,
    metrics: Arc<StoreMetrics>,
}

impl PoolShared {
    fn ready(&self, cb: &PendingCallback, rc: ReturnCode) -> bool {
        !rc.is_ok() || cb.stream.is_internal() || !self.info.has_standby() || cb.stream.ack_sqn() >= cb.gate
    }

    fn enqueued(&self, n: usize) {
        let q = self.queued.fetch_add(n, Ordering::AcqRel) + n;
        self.metrics.cbq_depth.add(n as i64);
        if q >= self.hwm && !self.alert.swap(true, Ordering::AcqRel) {
            warn!(queued = q, hwm = self.hwm, "callback queue above high watermark");
            self.emit(StoreEvent::CbqAlertOn);
        }
    }

    fn released(&self) {
        let q = self.queued.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.metrics.cbq_depth.sub(1);
        if q <= self.lwm && self.alert.swap(false, Ordering::AcqRel) {
            info!(queued = q, "callback queue below low watermark");
            self.emit(StoreEvent::CbqAlertOff);
        }
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }

    fn deliver(&self, cb: PendingCallback, rc: ReturnCode, delivered: &AtomicU64) {
        self.metrics.cb_latency.observe_since(cb.committed_at);
        (cb.callback)(rc);
        delivered.fetch_add(1, Ordering::Relaxed);
        self.metrics.callbacks_delivered.inc();
        self.released();
    }
}

struct Worker {
    tx: Sender<Delivery>,
    handle: Mutex<Option<JoinHandle<()>>>,
    delivered: Arc<AtomicU64>,
}

/// The async callback workers.
pub struct CallbackPool {
    workers: Vec<Worker>,
    shared: Arc<PoolShared>,
    high_perf: usize,
    next_high: AtomicUsize,
    next_normal: AtomicUsize,
}

impl std::fmt::Debug for CallbackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackPool")
            .field("workers", &self.workers.len())
            .field("queued", &self.queued())
            .finish()
    }
}

impl CallbackPool {
    pub fn start(
        config: &PersistConfig,
        info: Arc<HaInfo>,
        metrics: Arc<StoreMetrics>,
        events: Option<EventSink>,
    ) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            queued: AtomicUsize::new(0),
            hwm: config.cb_hwm,
            lwm: config.cb_lwm(),
            alert: AtomicBool::new(false),
            info,
            events,
            metrics,
        });
        let mut workers = Vec::with_capacity(config.async_threads);
        for i in 0..config.async_threads.max(1) {
            let (tx, rx) = unbounded();
            let delivered = Arc::new(AtomicU64::new(0));
            let (s, d) = (shared.clone(), delivered.clone());
            let handle = thread::Builder::new()
                .name(format!("store-cb-{}", i))
                .spawn(move || run_worker(rx, s, d))
                .map_err(|e| Error::Internal(format!("failed to spawn callback worker: {}", e)))?;
            workers.push(Worker {
                tx,
                handle: Mutex::new(Some(handle)),
                delivered,
            });
        }
        let high_perf = config.high_perf_threads.min(workers.len().saturating_sub(1));
        debug!(workers = workers.len(), high_perf, "callback workers started");
        Ok(Self {
            workers,
            shared,
            high_perf,
            next_high: AtomicUsize::new(0),
            next_normal: AtomicUsize::new(0),
        })
    }

    /// Pick the worker for a new stream.
    pub fn assign(&self, high_perf: bool) -> usize {
        if high_perf && self.high_perf > 0 {
            self.next_high.fetch_add(1, Ordering::Relaxed) % self.high_perf
        } else {
            let normal = self.workers.len() - self.high_perf;
            self.high_perf + self.next_normal.fetch_add(1, Ordering::Relaxed) % normal
        }
    }

    /// Hand callbacks of one stream to its worker.
    pub fn dispatch(&self, worker: usize, callbacks: Vec<PendingCallback>, rc: ReturnCode) {
        if callbacks.is_empty() {
            return;
        }
        self.shared.enqueued(callbacks.len());
        let w = &self.workers[worker % self.workers.len()];
        if let Err(e) = w.tx.send(Delivery::Callbacks(callbacks, rc)) {
            // Worker already gone; complete inline so nobody waits forever.
            if let Delivery::Callbacks(callbacks, _) = e.into_inner() {
                for cb in callbacks {
                    self.shared.deliver(cb, ReturnCode::StoreTerm, &w.delivered);
                }
            }
        }
    }

    /// Re-check readiness after acks arrived.
    pub fn notify(&self, worker: usize) {
        let _ = self.workers[worker % self.workers.len()].tx.send(Delivery::Wake);
    }

    pub fn notify_all(&self) {
        for w in &self.workers {
            let _ = w.tx.send(Delivery::Wake);
        }
    }

    /// Callbacks dispatched but not yet delivered.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> Vec<u64> {
        self.workers.iter().map(|w| w.delivered.load(Ordering::Relaxed)).collect()
    }

    pub fn alert(&self) -> bool {
        self.shared.alert.load(Ordering::Acquire)
    }

    /// Drain for up to `drain`, then fail whatever is left with `StoreTerm`.
    pub fn stop(&self, drain: Duration) {
        let deadline = Instant::now() + drain;
        for w in &self.workers {
            let _ = w.tx.send(Delivery::Stop(deadline));
        }
        for w in &self.workers {
            if let Some(h) = w.handle.lock().take() {
                let _ = h.join();
            }
        }
        debug!(delivered = ?self.delivered(), "callback workers stopped");
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        if self.workers.iter().any(|w| w.handle.lock().is_some()) {
            self.stop(Duration::ZERO);
        }
    }
}

fn run_worker(rx: Receiver<Delivery>, shared: Arc<PoolShared>, delivered: Arc<AtomicU64>) {
    let mut queue: VecDeque<(PendingCallback, ReturnCode)> = VecDeque::new();
    let mut deadline: Option<Instant> = None;
    loop {
        let wait = if queue.is_empty() { IDLE_WAIT } else { READY_POLL };
        match rx.recv_timeout(wait) {
            Ok(d) => absorb(d, &mut queue, &mut deadline),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                deadline.get_or_insert_with(Instant::now);
            }
        }
        for d in rx.try_iter() {
            absorb(d, &mut queue, &mut deadline);
        }

        let mut blocked: HashSet<StreamId> = HashSet::new();
        let mut waiting = VecDeque::with_capacity(queue.len());
        for (cb, rc) in queue.drain(..) {
            let id = cb.stream.id;
            if blocked.contains(&id) || !shared.ready(&cb, rc) {
                blocked.insert(id);
                waiting.push_back((cb, rc));
                continue;
            }
            shared.deliver(cb, rc, &delivered);
        }
        queue = waiting;

        if let Some(at) = deadline {
            if queue.is_empty() || Instant::now() >= at {
                if !queue.is_empty() {
                    warn!(left = queue.len(), "failing callbacks left at shutdown");
                }
                for (cb, _) in queue.drain(..) {
                    shared.deliver(cb, ReturnCode::StoreTerm, &delivered);
                }
                break;
            }
        }
    }
}

fn absorb(d: Delivery, queue: &mut VecDeque<(PendingCallback, ReturnCode)>, deadline: &mut Option<Instant>) {
    match d {
        Delivery::Callbacks(cbs, rc) => queue.extend(cbs.into_iter().map(|cb| (cb, rc))),
        Delivery::Wake => {}
        Delivery::Stop(at) => *deadline = Some(at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::stream::StreamShared;
    use crate::types::CommitCallback;

    fn pool(threads: usize, hwm: usize, info: Arc<HaInfo>, events: Option<EventSink>) -> CallbackPool {
        let config = PersistConfig::default().with_async_threads(threads).with_cb_hwm(hwm);
        CallbackPool::start(&config, info, Arc::new(StoreMetrics::new()), events).unwrap()
    }

    fn pending(stream: &Arc<StreamShared>, gate: u64, log: &Arc<Mutex<Vec<(StreamId, u64, ReturnCode)>>>) -> PendingCallback {
        let (log, id) = (log.clone(), stream.id);
        let callback: CommitCallback = Box::new(move |rc| log.lock().push((id, gate, rc)));
        PendingCallback {
            stream: stream.clone(),
            gate,
            callback,
            committed_at: Instant::now(),
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_round_robin_assignment() {
        let config = PersistConfig::default().with_async_threads(4);
        let p = CallbackPool::start(&config, Arc::new(HaInfo::new()), Arc::new(StoreMetrics::new()), None).unwrap();
        let normal: Vec<usize> = (0..6).map(|_| p.assign(false)).collect();
        assert_eq!(normal, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(p.assign(true), 0);
        p.stop(Duration::from_millis(100));
    }

    #[test]
    fn test_per_stream_order_and_ack_gating() {
        let info = Arc::new(HaInfo::new());
        info.set_has_standby(true);
        let p = pool(1, 1000, info.clone(), None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow = Arc::new(StreamShared::new(1, 0, false));
        let fast = Arc::new(StreamShared::new(2, 0, false));

        p.dispatch(0, vec![pending(&slow, 1, &log)], ReturnCode::Ok);
        p.dispatch(0, vec![pending(&slow, 2, &log)], ReturnCode::DiskError);
        p.dispatch(0, vec![pending(&fast, 1, &log)], ReturnCode::Ok);
        fast.acked(0);
        assert!(wait_until(|| log.lock().len() == 1));
        assert_eq!(log.lock()[0].0, 2);

        // The failed callback is ready but queued behind an unacked one.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(log.lock().len(), 1);
        slow.acked(0);
        p.notify(0);
        assert!(wait_until(|| log.lock().len() == 3));
        let order: Vec<(StreamId, u64, ReturnCode)> = log.lock().clone();
        assert_eq!(
            order,
            vec![
                (2, 1, ReturnCode::Ok),
                (1, 1, ReturnCode::Ok),
                (1, 2, ReturnCode::DiskError)
            ]
        );
        p.stop(Duration::from_millis(100));
    }

    #[test]
    fn test_watermark_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: EventSink = Arc::new(move |e| sink_events.lock().push(e));
        let info = Arc::new(HaInfo::new());
        info.set_has_standby(true);
        let p = pool(1, 32, info, Some(sink));
        let log = Arc::new(Mutex::new(Vec::new()));
        let stream = Arc::new(StreamShared::new(7, 0, false));
        let cbs: Vec<_> = (1..=40).map(|g| pending(&stream, g, &log)).collect();
        p.dispatch(0, cbs, ReturnCode::Ok);
        assert!(p.alert());
        assert_eq!(events.lock().as_slice(), &[StoreEvent::CbqAlertOn]);

        stream.acked(39);
        p.notify(0);
        assert!(wait_until(|| log.lock().len() == 40));
        assert!(!p.alert());
        assert_eq!(events.lock().as_slice(), &[StoreEvent::CbqAlertOn, StoreEvent::CbqAlertOff]);
        p.stop(Duration::from_millis(100));
    }

    #[test]
    fn test_stop_fails_unacked_callbacks() {
        let info = Arc::new(HaInfo::new());
        info.set_has_standby(true);
        let p = pool(2, 1000, info, None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let stream = Arc::new(StreamShared::new(3, 1, false));
        p.dispatch(1, vec![pending(&stream, 5, &log)], ReturnCode::Ok);
        p.stop(Duration::from_millis(50));
        assert_eq!(log.lock().as_slice(), &[(3, 5, ReturnCode::StoreTerm)]);
        assert_eq!(p.queued(), 0);
    }

    #[test]
    fn test_errors_are_delivered_immediately() {
        let info = Arc::new(HaInfo::new());
        info.set_has_standby(true);
        let p = pool(1, 1000, info, None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let stream = Arc::new(StreamShared::new(3, 0, false));
        p.dispatch(0, vec![pending(&stream, 9, &log)], ReturnCode::DiskError);
        assert!(wait_until(|| log.lock().len() == 1));
        assert_eq!(log.lock()[0].2, ReturnCode::DiskError);
        p.stop(Duration::from_millis(100));
    }
}
