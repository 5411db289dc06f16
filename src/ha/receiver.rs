//! Standby side of replication: accepts the primary's channels and applies
//! what arrives on them.
//!
//! Each accepted channel is served by its own thread. A message is acked
//! before processing on the internal channel and after processing anywhere
//! else, except for messages whose ack waits on a disk task.

use crate::error::{Error, Result, ReturnCode};
use crate::fail_point;
use crate::ha::admin::{self, AdminHandler};
use crate::ha::channel::{AckingPolicy, HaChannel};
use crate::ha::gen_msg::{self, Applied};
use crate::ha::message::{Ack, Message, MsgType};
use crate::ha::ops::{apply_ops, OpType, Operation};
use crate::ha::sync;
use crate::ha::transport::HaTransport;
use crate::ha::HaContext;
use crate::testing::failpoint::points;
use crate::types::HaRole;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const RECEIVE_POLL: Duration = Duration::from_millis(100);
const GEN_WAIT: Duration = Duration::from_secs(2);
const GEN_POLL: Duration = Duration::from_millis(2);

/// What the serving loop does after a message was processed.
enum Reply {
    Ack(Option<Vec<u8>>),
    /// Acked later by a disk completion, or not at all.
    Silent,
    Terminate,
}

/// Standby receiver.
pub struct Receiver {
    ctx: HaContext,
    transport: Arc<dyn HaTransport>,
    admin: Option<Arc<dyn AdminHandler>>,
    stop: AtomicBool,
    peer_lost: AtomicBool,
    applied: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .field("peer_lost", &self.peer_lost.load(Ordering::Relaxed))
            .finish()
    }
}

impl Receiver {
    /// Start accepting channels from the primary.
    pub fn start(
        ctx: HaContext,
        transport: Arc<dyn HaTransport>,
        admin: Option<Arc<dyn AdminHandler>>,
    ) -> Result<Arc<Self>> {
        let receiver = Arc::new(Self {
            ctx,
            transport,
            admin,
            stop: AtomicBool::new(false),
            peer_lost: AtomicBool::new(false),
            applied: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
        });
        let r = receiver.clone();
        let handle = thread::Builder::new()
            .name("ha-accept".into())
            .spawn(move || r.accept_loop())
            .map_err(|e| Error::Internal(format!("failed to spawn HA accept thread: {}", e)))?;
        receiver.threads.lock().push(handle);
        info!(local = %receiver.transport.local_node(), "standby receiver started");
        Ok(receiver)
    }

    /// Store-transactions applied so far.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// True once the primary went away.
    pub fn peer_lost(&self) -> bool {
        self.peer_lost.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Stop serving and join every receiver thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let current = thread::current().id();
        let threads: Vec<_> = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            if t.thread().id() != current {
                let _ = t.join();
            }
        }
    }

    fn accept_loop(self: Arc<Self>) {
        while !self.is_stopped() {
            match self.transport.accept_channel(ACCEPT_POLL) {
                Ok(Some(link)) => {
                    let chan = Arc::new(self.ctx.channel(link));
                    debug!(channel = chan.id(), policy = ?chan.policy(), "channel accepted");
                    let r = self.clone();
                    let name = format!("ha-rx-{}", chan.id());
                    match thread::Builder::new().name(name).spawn(move || r.serve(chan)) {
                        Ok(h) => self.threads.lock().push(h),
                        Err(e) => error!(error = %e, "failed to spawn HA receive thread"),
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.on_link_error(&e);
                    break;
                }
            }
        }
        trace!("accept loop done");
    }

    fn on_link_error(&self, e: &Error) {
        if e.is_connection_broke() {
            if !self.peer_lost.swap(true, Ordering::AcqRel) {
                warn!("connection to primary lost");
                self.ctx.info.set_active_nodes(1);
            }
        } else {
            error!(error = %e, "HA receive failed");
        }
    }

    fn serve(self: Arc<Self>, chan: Arc<HaChannel>) {
        while !self.is_stopped() {
            let msg = match chan.receive_message(RECEIVE_POLL) {
                Ok(Some(msg)) => msg,
                Ok(None) => continue,
                Err(Error::CloseChannel) => {
                    debug!(channel = chan.id(), "channel closed by primary");
                    break;
                }
                Err(e) if e.is_connection_broke() => {
                    self.on_link_error(&e);
                    break;
                }
                Err(Error::Protocol(e)) => {
                    // Only the message in reassembly is lost.
                    error!(channel = chan.id(), error = %e, "dropping malformed message");
                    continue;
                }
                Err(e) => {
                    error!(channel = chan.id(), error = %e, "HA receive failed");
                    break;
                }
            };
            match self.handle(&chan, msg) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.is_connection_broke() => {
                    self.on_link_error(&e);
                    break;
                }
                Err(e) => error!(channel = chan.id(), error = %e, "failed to answer message"),
            }
        }
        trace!(channel = chan.id(), "receive loop done");
    }

    /// Process one message; false ends the serving loop.
    fn handle(&self, chan: &Arc<HaChannel>, msg: Message) -> Result<bool> {
        let msg_type = msg.msg_type;
        let ack = msg.ack(ReturnCode::Ok);
        let no_ack = msg.no_ack();
        let wants_ack = !no_ack && !defers_ack(msg_type);
        let early = wants_ack && chan.policy() == AckingPolicy::BeforeProcessing;
        if early {
            chan.send_ack(&ack)?;
        }
        let reply = self.dispatch(chan, msg);
        match reply {
            Ok(Reply::Ack(payload)) => {
                if wants_ack && !early {
                    let ack = match payload {
                        Some(p) => ack.with_payload(p),
                        None => ack,
                    };
                    chan.send_ack(&ack)?;
                }
                Ok(true)
            }
            Ok(Reply::Silent) => Ok(true),
            Ok(Reply::Terminate) => {
                if wants_ack && !early {
                    chan.send_ack(&ack)?;
                }
                if let Err(e) = self.ctx.info.set_role(HaRole::Terminating) {
                    warn!(error = %e, "cannot enter terminating role");
                }
                self.stop.store(true, Ordering::Release);
                Ok(false)
            }
            Err(e) => {
                let rc = e.return_code();
                if e.is_connection_broke() {
                    return Err(e);
                }
                error!(channel = chan.id(), msg_type = ?msg_type, rc = ?rc, error = %e, "failed to apply message");
                // A deferred ack is still owed when the disk task never started.
                let owes_ack = !no_ack && (defers_ack(msg_type) || !early);
                if owes_ack {
                    chan.send_ack(&Ack { rc, ..ack })?;
                }
                if matches!(msg_type, MsgType::SyncList | MsgType::SyncMemGen | MsgType::SyncComplete) {
                    self.ctx.info.set_sync_rc(rc);
                }
                Ok(true)
            }
        }
    }

    fn dispatch(&self, chan: &Arc<HaChannel>, msg: Message) -> Result<Reply> {
        let ctx = &self.ctx;
        match msg.msg_type {
            MsgType::StoreTran | MsgType::UpdateActiveOid => {
                self.apply_store_tran(&msg)?;
                Ok(Reply::Ack(None))
            }
            t if t.is_generation() => match gen_msg::apply(ctx, chan, &msg)? {
                Applied::Done => Ok(Reply::Ack(None)),
                Applied::Deferred => Ok(Reply::Silent),
                Applied::Terminate => Ok(Reply::Terminate),
            },
            MsgType::SyncList => {
                if ctx.info.role() == HaRole::Init {
                    ctx.info.set_role(HaRole::Unsync)?;
                }
                sync::on_sync_list(ctx, chan, &msg)?;
                Ok(Reply::Ack(None))
            }
            MsgType::SyncDiskGen => match sync::on_disk_gen(ctx, chan, msg)? {
                Applied::Terminate => Ok(Reply::Terminate),
                _ => Ok(Reply::Silent),
            },
            MsgType::SyncMemGen => {
                sync::on_mem_gen(ctx, &msg)?;
                Ok(Reply::Ack(None))
            }
            MsgType::SyncComplete => {
                sync::on_complete(ctx)?;
                Ok(Reply::Ack(None))
            }
            MsgType::SyncError => {
                sync::on_error(ctx, &msg)?;
                Ok(Reply::Silent)
            }
            MsgType::Admin | MsgType::AdminFile => {
                let response = admin::handle(self.admin.as_deref(), &msg)?;
                Ok(Reply::Ack(Some(response)))
            }
            other => {
                warn!(channel = chan.id(), msg_type = ?other, "unexpected message on standby");
                Err(crate::error::ProtocolError::UnknownMessage(other.as_u16()).into())
            }
        }
    }

    fn apply_store_tran(&self, msg: &Message) -> Result<()> {
        fail_point!(
            self.ctx.failpoints,
            points::STANDBY_APPLY,
            return Err(Error::Internal("store-transaction apply failed".into()))
        );
        self.wait_for_generations(msg)?;
        let n = apply_ops(&self.ctx.store, msg.ops())?;
        self.applied.fetch_add(1, Ordering::Relaxed);
        trace!(msg_sqn = msg.msg_sqn, ops = n, "store-transaction applied");
        Ok(())
    }
}

impl Receiver {
    /// Generation messages are acked before they are applied, so a
    /// store-transaction can reach a new generation ahead of its CreateGen.
    fn wait_for_generations(&self, msg: &Message) -> Result<()> {
        let mut gens = Vec::new();
        for op in msg.ops() {
            let op = op?;
            if op.op_type == OpType::Null.as_u16() {
                continue;
            }
            if let Some(gen_id) = Operation::decode(&op)?.gen_id() {
                if !gens.contains(&gen_id) {
                    gens.push(gen_id);
                }
            }
        }
        let deadline = Instant::now() + GEN_WAIT;
        for gen_id in gens {
            while !self.ctx.store.is_resident(gen_id) {
                if Instant::now() >= deadline || self.is_stopped() {
                    // Let apply report the handle.
                    return Ok(());
                }
                thread::sleep(GEN_POLL);
            }
        }
        Ok(())
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Messages whose ack is sent by a disk completion.
fn defers_ack(msg_type: MsgType) -> bool {
    matches!(msg_type, MsgType::WriteGen | MsgType::CompactGen | MsgType::SyncDiskGen)
}
