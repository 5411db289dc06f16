//! The store engine: one explicitly constructed context owning memory,
//! persistence and replication of a node.

use crate::config::StoreConfig;
use crate::disk::{DiskTasks, FileDiskTasks};
use crate::error::{Error, Result, ReturnCode};
use crate::ha::admin::{AdminClient, AdminHandler};
use crate::ha::gen_msg::GenMessage;
use crate::ha::info::{HaInfo, HaView};
use crate::ha::message::MsgType;
use crate::ha::ops::{active_oid_handle, Operation, StoreOp};
use crate::ha::receiver::Receiver;
use crate::ha::sync;
use crate::ha::transport::HaTransport;
use crate::ha::HaContext;
use crate::memory::{data_type, MemoryStore, NoWriteBack, WriteBack};
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::persist::forward::Forwarder;
use crate::persist::recovery::{fresh_start, recover, RecoveryReport};
use crate::persist::{PState, PersistDir, PersistPipeline, PipelineStatus};
use crate::persist::stream::encode_message;
use crate::testing::failpoint::FailpointRegistry;
use crate::types::{CommitCallback, EventSink, Handle, HaRole, StoreEvent, StreamId, ADMIN_CHANNEL, INTERNAL_STREAM};
use crossbeam::channel::bounded;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for streams to drain.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(5);

/// A store node.
///
/// Created closed; [`StoreEngine::start_primary`] recovers and starts
/// persistence, [`StoreEngine::start_standby`] waits for a primary to sync
/// it. A standby becomes primary through [`StoreEngine::promote`].
pub struct StoreEngine {
    config: StoreConfig,
    ctx: HaContext,
    dir: PersistDir,
    events: Option<EventSink>,

    pipeline: RwLock<Option<Arc<PersistPipeline>>>,
    report: Mutex<Option<RecoveryReport>>,

    /// Connection to the standby, on a primary.
    peer: Mutex<Option<Arc<dyn HaTransport>>>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
    sync_stop: Arc<AtomicBool>,
    admin: Mutex<Option<Arc<AdminClient>>>,

    receiver: Mutex<Option<Arc<Receiver>>>,
}

impl std::fmt::Debug for StoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEngine")
            .field("root", &self.dir.root())
            .field("role", &self.ctx.info.role())
            .finish()
    }
}

impl StoreEngine {
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(FailpointRegistry::new()), None, Arc::new(NoWriteBack))
    }

    /// Build an engine with its collaborators supplied by the caller.
    pub fn with_parts(
        config: StoreConfig,
        failpoints: Arc<FailpointRegistry>,
        events: Option<EventSink>,
        write_back: Arc<dyn WriteBack>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = PersistDir::open(&config.persist.root)?;
        let disk: Arc<dyn DiskTasks> = Arc::new(FileDiskTasks::open(dir.generations())?);
        let ctx = HaContext {
            store: Arc::new(MemoryStore::new(config.memory.clone(), write_back)?),
            disk,
            info: Arc::new(HaInfo::new()),
            config: config.ha.clone(),
            metrics: Arc::new(StoreMetrics::new()),
            failpoints,
        };
        info!(root = %dir.root().display(), "store engine created");
        Ok(Self {
            config,
            ctx,
            dir,
            events,
            pipeline: RwLock::new(None),
            report: Mutex::new(None),
            peer: Mutex::new(None),
            sync_thread: Mutex::new(None),
            sync_stop: Arc::new(AtomicBool::new(false)),
            admin: Mutex::new(None),
            receiver: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.ctx.store
    }

    pub fn context(&self) -> &HaContext {
        &self.ctx
    }

    pub fn failpoints(&self) -> &Arc<FailpointRegistry> {
        &self.ctx.failpoints
    }

    pub fn role(&self) -> HaRole {
        self.ctx.info.role()
    }

    pub fn view(&self) -> HaView {
        self.ctx.info.view()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// What the last recovery did, once the node runs as primary.
    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.report.lock().clone()
    }

    pub fn pipeline_status(&self) -> Option<PipelineStatus> {
        self.pipeline.read().as_ref().map(|p| p.status())
    }

    fn set_role(&self, role: HaRole) -> Result<()> {
        let old = self.ctx.info.set_role(role)?;
        if old != role {
            self.emit(StoreEvent::RoleChanged { old, new: role });
        }
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }

    fn pipeline(&self) -> Result<Arc<PersistPipeline>> {
        self.pipeline
            .read()
            .clone()
            .ok_or_else(|| Error::NotAvailable("the store is not running as primary".into()))
    }

    /// Recover the persisted state and start as primary.
    pub fn start_primary(&self) -> Result<RecoveryReport> {
        self.set_role(HaRole::Init)?;
        let recovered = recover(&self.ctx.store, self.ctx.disk.as_ref(), &self.dir, &self.config.persist)?;
        let report = recovered.report.clone();
        let pipeline = PersistPipeline::start(
            self.config.persist.clone(),
            self.ctx.clone(),
            self.dir.clone(),
            recovered,
            self.events.clone(),
        )?;
        *self.pipeline.write() = Some(pipeline);
        *self.report.lock() = Some(report.clone());
        self.set_role(HaRole::Primary)?;
        info!(
            cold_start = report.cold_start,
            cycle_id = report.cycle_id,
            "store started as primary"
        );
        Ok(report)
    }

    /// Wait for a primary to open channels on `transport` and sync this node.
    pub fn start_standby(&self, transport: Arc<dyn HaTransport>, admin: Option<Arc<dyn AdminHandler>>) -> Result<()> {
        self.set_role(HaRole::Init)?;
        self.ctx.store.reset()?;
        // A standby keeps no log; its directory cannot be recovered from.
        let mut pstate = PState::new(self.config.persist.layout);
        pstate.is_standby = true;
        pstate.store(&self.dir.pstate())?;
        let receiver = Receiver::start(self.ctx.clone(), transport, admin)?;
        *self.receiver.lock() = Some(receiver);
        info!("store started as standby");
        Ok(())
    }

    /// Take over as primary with the replicated state.
    pub fn promote(&self) -> Result<()> {
        if self.ctx.info.role() != HaRole::Standby {
            return Err(Error::NotAvailable(format!(
                "cannot promote from role {:?}",
                self.ctx.info.role()
            )));
        }
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.stop();
        }
        let previous = PState::load(&self.dir.pstate())?;
        let recovered = fresh_start(&self.ctx.store, &self.dir, &self.config.persist, previous.as_ref())?;
        let report = recovered.report.clone();
        let pipeline = PersistPipeline::start(
            self.config.persist.clone(),
            self.ctx.clone(),
            self.dir.clone(),
            recovered,
            self.events.clone(),
        )?;
        *self.pipeline.write() = Some(pipeline);
        *self.report.lock() = Some(report);
        self.set_role(HaRole::Primary)?;
        info!("standby promoted to primary");
        Ok(())
    }

    /// Sync a standby reachable over `transport` and start replicating to
    /// it. Runs on a background thread; see [`StoreEngine::wait_standby`].
    pub fn attach_standby(self: &Arc<Self>, transport: Arc<dyn HaTransport>) -> Result<()> {
        let pipeline = self.pipeline()?;
        if !self.ctx.config.enabled {
            return Err(Error::Config("replication is disabled".into()));
        }
        let mut slot = self.sync_thread.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(Error::NotAvailable("a standby sync is already running".into()));
        }
        if let Some(old) = slot.take() {
            let _ = old.join();
        }
        pipeline.detach_forwarder();
        self.admin.lock().take();
        *self.peer.lock() = Some(transport.clone());
        self.sync_stop.store(false, Ordering::Release);

        let engine = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("ha-sync".into())
            .spawn(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.run_sync(pipeline, transport);
                }
            })
            .map_err(|e| Error::Internal(format!("failed to spawn sync thread: {}", e)))?;
        *slot = Some(handle);
        Ok(())
    }

    fn run_sync(&self, pipeline: Arc<PersistPipeline>, transport: Arc<dyn HaTransport>) {
        let ctx = &self.ctx;
        let tx_threads = self.config.persist.ha_tx_threads;
        let attach = || -> Result<()> {
            let fwd = Forwarder::start(ctx.clone(), transport.clone(), pipeline.callbacks().clone(), tx_threads)?;
            pipeline.attach_forwarder(fwd)
        };
        match sync::run_primary(ctx, transport.as_ref(), &self.sync_stop, attach) {
            Ok(()) => {
                if let Some(node) = transport.peer_node() {
                    self.emit(StoreEvent::StandbySynced { node });
                }
            }
            Err(e) => {
                warn!(error = %e, rc = ?e.return_code(), "standby not attached");
                pipeline.detach_forwarder();
            }
        }
    }

    /// Wait until a standby is attached and replicating.
    pub fn wait_standby(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.ctx.info.has_standby() {
                return true;
            }
            if self.sync_thread.lock().as_ref().is_some_and(|h| h.is_finished()) {
                return self.ctx.info.has_standby();
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.ctx.info.has_standby()
    }

    /// Wait until this standby finished its sync.
    pub fn wait_synced(&self, timeout: Duration) -> bool {
        sync::wait_synced(&self.ctx, timeout)
    }

    /// The admin channel to the standby, opened on first use.
    pub fn admin_client(&self) -> Result<Arc<AdminClient>> {
        let mut admin = self.admin.lock();
        if let Some(client) = admin.as_ref() {
            return Ok(client.clone());
        }
        if !self.ctx.info.has_standby() {
            return Err(Error::NotAvailable("no standby attached".into()));
        }
        let transport = self
            .peer
            .lock()
            .clone()
            .ok_or_else(|| Error::NotAvailable("no standby attached".into()))?;
        let chan = Arc::new(self.ctx.channel(transport.open_channel(ADMIN_CHANNEL)?));
        let client = Arc::new(AdminClient::new(chan, self.ctx.config.admin_poll));
        *admin = Some(client.clone());
        Ok(client)
    }

    /// Tell the admin layer of the standby that its state transfer ended.
    pub fn transfer_state_completed(&self, ok: bool) {
        self.ctx.info.transfer_state_completed(ok);
    }

    pub fn open_stream(&self, high_perf: bool) -> Result<StreamId> {
        self.pipeline()?.open_stream(high_perf)
    }

    pub fn close_stream(&self, stream: StreamId, timeout: Duration) -> Result<()> {
        self.pipeline()?.close_stream(stream, timeout)
    }

    /// Allocate a record in the active generation. It stays invisible to
    /// recovery and the standby until a `CreateRecord` commits it.
    pub fn allocate(&self, pool_id: u8, attribute: u64, state: u64, payload: &[u8]) -> Result<Handle> {
        let _entry = self.ctx.store.gate().enter();
        let (gen_id, _) = self.ctx.store.active();
        self.ctx
            .store
            .allocate(gen_id, pool_id, data_type::NEWLY_HATCHED, attribute, state, payload)
    }

    /// Apply a store-transaction to memory and queue it for persistence.
    /// `callback` runs once it is durable and, with a standby, acked.
    ///
    /// An empty transaction only queues its callback behind the stream's
    /// earlier transactions and returns `MsgUnsent`.
    pub fn commit(&self, stream: StreamId, ops: &[StoreOp], callback: Option<CommitCallback>) -> Result<u64> {
        let pipeline = self.pipeline()?;
        pipeline.check_running()?;
        if stream == INTERNAL_STREAM {
            return Err(Error::Config("store-transactions cannot use the internal stream".into()));
        }
        if ops.is_empty() {
            if let Some(cb) = callback {
                pipeline.submit_callback(stream, cb)?;
            }
            return Err(Error::MsgUnsent);
        }
        let _entry = self.ctx.store.gate().enter();
        let mut applied = Vec::with_capacity(ops.len());
        for op in ops {
            let op = op.expand(&self.ctx.store)?;
            op.apply(&self.ctx.store)?;
            applied.push(op);
        }
        let msg = encode_message(MsgType::StoreTran, stream, &applied, self.ctx.config.buffer_size);
        let sqn = pipeline.submit(stream, msg, callback)?;
        debug!(stream, msg_sqn = sqn, ops = applied.len(), "store-transaction committed");
        Ok(sqn)
    }

    /// [`StoreEngine::commit`] and wait for the callback.
    pub fn commit_sync(&self, stream: StreamId, ops: &[StoreOp], timeout: Duration) -> Result<()> {
        let (tx, rx) = bounded(1);
        let cb: CommitCallback = Box::new(move |rc| {
            let _ = tx.send(rc);
        });
        match self.commit(stream, ops, Some(cb)) {
            Ok(_) | Err(Error::MsgUnsent) => {}
            Err(e) => return Err(e),
        }
        match rx.recv_timeout(timeout) {
            Ok(rc) => rc.into_result(),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Record the minimum active order id of an owner. Replicated without
    /// an ack.
    pub fn update_active_oid(&self, owner: Handle, oid: u64) -> Result<()> {
        let pipeline = self.pipeline()?;
        let _entry = self.ctx.store.gate().enter();
        let op = Operation::UpdateActiveOid {
            handle: active_oid_handle(owner),
            oid,
        };
        op.apply(&self.ctx.store)?;
        let msg = encode_message(MsgType::UpdateActiveOid, INTERNAL_STREAM, &[op], self.ctx.config.buffer_size);
        pipeline.submit(INTERNAL_STREAM, msg, None)?;
        Ok(())
    }

    /// Close the active generation and open the next one. The closed
    /// generation is written to disk in the background.
    pub fn close_active_generation(&self) -> Result<()> {
        self.pipeline()?.request_gen_transition()
    }

    pub fn generation_transition_pending(&self) -> bool {
        self.pipeline
            .read()
            .as_ref()
            .is_some_and(|p| p.gen_transition_pending())
    }

    /// Start a new checkpoint set and ST file.
    pub fn checkpoint(&self) -> Result<()> {
        self.pipeline()?.request_file_flip()
    }

    pub fn flush(&self, wait_for_ack: bool, timeout: Duration) -> Result<()> {
        self.pipeline()?.flush(wait_for_ack, timeout)
    }

    /// Ask the standby to terminate.
    pub fn stop_standby(&self) -> Result<()> {
        let pipeline = self.pipeline()?;
        let fwd = pipeline
            .forwarder()
            .ok_or_else(|| Error::NotAvailable("no standby attached".into()))?;
        let (gen_id, index) = self.ctx.store.active();
        let token = self.ctx.store.with_gen(gen_id, |g| Ok(g.token()))?;
        fwd.send_gen(MsgType::Shutdown, GenMessage::new(gen_id, index).with_token(token))?;
        pipeline.detach_forwarder();
        Ok(())
    }

    /// Stop every thread of the node. Persistence drains first so the next
    /// start finds a clean stop.
    pub fn shutdown(&self) {
        if self.ctx.info.role() == HaRole::Closed {
            return;
        }
        if let Err(e) = self.ctx.info.set_role(HaRole::Terminating) {
            debug!(error = %e, "role change on shutdown refused");
        }
        self.sync_stop.store(true, Ordering::Release);
        if let Some(h) = self.sync_thread.lock().take() {
            if h.thread().id() != thread::current().id() && h.join().is_err() {
                error!("sync thread panicked");
            }
        }
        self.admin.lock().take();
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.stop();
        }
        if let Some(pipeline) = self.pipeline.write().take() {
            if pipeline.status() == PipelineStatus::Running {
                if let Err(e) = pipeline.flush(false, SHUTDOWN_FLUSH) {
                    warn!(error = %e, "streams not drained before shutdown");
                }
            }
            pipeline.stop();
        }
        if let Some(peer) = self.peer.lock().take() {
            peer.disconnect();
        }
        if let Err(e) = self.ctx.info.set_role(HaRole::Closed) {
            debug!(error = %e, "role change on shutdown refused");
        }
        self.ctx.metrics.has_standby.set(0);
        self.ctx.metrics.log_summary();
        info!("store engine stopped");
    }

    /// Return code the engine reports for new work.
    pub fn health(&self) -> ReturnCode {
        match self.pipeline.read().as_ref() {
            Some(p) => match p.check_running() {
                Ok(()) => ReturnCode::Ok,
                Err(e) => e.return_code(),
            },
            None if self.ctx.info.role() == HaRole::Standby => ReturnCode::Ok,
            None => ReturnCode::NotAvailable,
        }
    }
}

impl Drop for StoreEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
