//! New standby synchronization.
//!
//! ```text
//!  primary (sync thread)                         standby
//!  SyncList (genId, token, diskSize)* ─────────▶ compare with local files,
//!                                                read ahead matching ones
//!            ◀─────────────────────── SyncListRes (genId)*
//!  ┌ disk phase: reader ──budget──▶ sender
//!  │ SyncDiskGen [len][genId] + data ──────────▶ write file ─▶ ack
//!  └ (time budget exhausted: lock early)
//!  lock store (3 × 3.3s, else abort the sync)
//!  SyncMemGen mgmt, then resident gens ────────▶ load / install ─▶ ack
//!  wait for admin state transfer
//!  SyncComplete ──────────────────────────────▶ validate, role Standby
//!  HasStandby = true, unlock
//! ```
//!
//! Any failure records `SyncRC` and sends a best-effort `SyncError`.

use crate::codec::WireReader;
use crate::disk::{DiskGenInfo, TaskParams};
use crate::error::{Error, ProtocolError, Result, ReturnCode, SyncError, TransportError};
use crate::fail_point;
use crate::ha::channel::{AckingPolicy, HaChannel};
use crate::ha::gen_msg::Applied;
use crate::ha::info::sync_state;
use crate::ha::message::{Ack, Message, MsgType};
use crate::ha::ops::OpType;
use crate::ha::transport::HaTransport;
use crate::ha::HaContext;
use crate::memory::generation::Generation;
use crate::memory::{HaSyncState, StoreLock};
use crate::testing::failpoint::points;
use crate::types::{GenId, GenToken, HaRole, MGMT_GEN_ID, SYNC_CHANNEL};
use bytes::{BufMut, BytesMut};
use crossbeam::channel::bounded;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Disk size difference under which a standby keeps its own copy of a
/// generation with a matching token.
pub const SYNC_DIFF: u64 = 100 * 1024 * 1024;

/// One generation proposed by the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub gen_id: GenId,
    pub token: GenToken,
    pub disk_size: u64,
}

impl Proposal {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut b = BytesMut::with_capacity(2 + GenToken::SIZE + 8);
        b.put_u16(self.gen_id);
        b.put_slice(&self.token.to_bytes());
        b.put_u64(self.disk_size);
        b.to_vec()
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let p = Self {
            gen_id: r.u16()?,
            token: r.token()?,
            disk_size: r.u64()?,
        };
        r.finish("sync proposal")?;
        Ok(p)
    }
}

/// Run a full sync towards a newly joined standby. `on_synced` runs while
/// the store is still locked, right before `HasStandby` is raised.
pub fn run_primary(
    ctx: &HaContext,
    transport: &dyn HaTransport,
    stop: &AtomicBool,
    on_synced: impl FnOnce() -> Result<()>,
) -> Result<()> {
    ctx.info.begin_sync();
    ctx.metrics.sync_attempts.inc();
    info!(peer = ?transport.peer_node(), "standby sync started");

    let chan = HaChannel::new(
        transport.open_channel(SYNC_CHANNEL)?,
        ctx.config.clone(),
        AckingPolicy::AfterProcessing,
        ctx.metrics.clone(),
    );
    let session = Session {
        ctx,
        transport,
        chan: &chan,
        stop,
        started: Instant::now(),
        lock: None,
    };
    let result = session.run(on_synced);
    if let Err(e) = &result {
        let rc = e.return_code();
        ctx.info.set_sync_rc(rc);
        ctx.metrics.sync_failures.inc();
        if e.is_connection_broke() {
            debug!("sync aborted, connection broke");
        } else {
            error!(error = %e, "standby sync failed");
            send_sync_error(&chan, rc);
        }
    }
    reset_sync_states(ctx);
    chan.close();
    ctx.info.end_sync();
    result
}

fn send_sync_error(chan: &HaChannel, rc: ReturnCode) {
    let mut w = chan.writer(MsgType::SyncError);
    w.no_ack();
    let sent = w
        .put_op(OpType::Null.as_u16(), &rc.as_u32().to_be_bytes())
        .and_then(|_| w.finish());
    if let Err(e) = sent {
        debug!(error = %e, "SyncError not delivered");
    }
}

fn reset_sync_states(ctx: &HaContext) {
    for e in ctx.store.header().gen_map.values_mut() {
        e.sync_state = HaSyncState::Empty;
        e.sync_len = 0;
    }
}

fn set_sync_state(ctx: &HaContext, gen_id: GenId, state: HaSyncState, len: u64) -> Result<()> {
    let mut header = ctx.store.header();
    if let Some(e) = header.gen_map.get_mut(&gen_id) {
        e.set_sync_state(gen_id, state)?;
        e.sync_len = len;
    }
    Ok(())
}

struct Session<'a> {
    ctx: &'a HaContext,
    transport: &'a dyn HaTransport,
    chan: &'a HaChannel,
    stop: &'a AtomicBool,
    started: Instant,
    lock: Option<StoreLock>,
}

impl Session<'_> {
    fn check_alive(&self) -> Result<()> {
        if self.stop.load(Ordering::Acquire) || self.transport.active_nodes() < 2 {
            return Err(TransportError::ConnectionBroke.into());
        }
        Ok(())
    }

    fn set_state(&self, gen_id: GenId, state: HaSyncState, len: u64) -> Result<()> {
        set_sync_state(self.ctx, gen_id, state, len)
    }

    fn run(mut self, on_synced: impl FnOnce() -> Result<()>) -> Result<()> {
        let proposals = self.propose()?;
        let requested = self.exchange_list(&proposals)?;

        self.ctx.info.add_sync_state(sync_state::DISK_GENS);
        let mut sent: BTreeSet<GenId> = BTreeSet::new();
        let work: Vec<(GenId, u64)> = proposals
            .iter()
            .filter(|p| requested.contains(&p.gen_id))
            .map(|p| (p.gen_id, p.disk_size))
            .collect();
        self.transfer_disk_gens(&work, &mut sent)?;

        self.lock_store()?;
        // Generations written to disk while the disk phase ran.
        let late: Vec<(GenId, u64)> = self
            .ctx
            .store
            .header_snapshot()
            .gen_map
            .iter()
            .filter(|(id, e)| {
                e.disk_size > 0 && e.mem_index.is_none() && !proposals.iter().any(|p| p.gen_id == **id)
            })
            .map(|(id, e)| (*id, e.disk_size))
            .collect();
        if !late.is_empty() {
            debug!(count = late.len(), "sending generations written during sync");
            self.transfer_disk_gens(&late, &mut sent)?;
        }
        self.ctx.info.add_sync_state(sync_state::DISK_DONE);

        self.transfer_mem_gens()?;
        self.ctx.info.add_sync_state(sync_state::MEM_DONE);

        if self.ctx.config.admin_transfer {
            self.ctx
                .info
                .wait_admin(self.ctx.config.admin_poll, || self.check_alive().is_err())?;
        }

        let ack = self.chan.request(MsgType::SyncComplete, |w| {
            w.put_op(OpType::Null.as_u16(), &(sent.len() as u32).to_be_bytes())
        })?;
        ack.rc.into_result()?;

        on_synced()?;
        self.ctx.info.set_has_standby(true);
        self.ctx.metrics.has_standby.set(1);
        self.lock.take();
        info!(
            disk_gens = sent.len(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "standby synchronized"
        );
        Ok(())
    }

    fn propose(&self) -> Result<Vec<Proposal>> {
        let mut header = self.ctx.store.header();
        let mut proposals = vec![Proposal {
            gen_id: MGMT_GEN_ID,
            token: header.token,
            disk_size: 0,
        }];
        for (gen_id, e) in header.gen_map.iter_mut() {
            e.sync_state = HaSyncState::Empty;
            e.set_sync_state(*gen_id, HaSyncState::Proposed)?;
            proposals.push(Proposal {
                gen_id: *gen_id,
                token: e.token,
                disk_size: if e.mem_index.is_none() { e.disk_size } else { 0 },
            });
        }
        Ok(proposals)
    }

    fn exchange_list(&self, proposals: &[Proposal]) -> Result<BTreeSet<GenId>> {
        self.check_alive()?;
        let ack = self.chan.request(MsgType::SyncList, |w| {
            for p in proposals {
                w.put_op(OpType::Null.as_u16(), &p.encode())?;
            }
            Ok(())
        })?;
        ack.rc.into_result()?;

        let res = self
            .chan
            .receive_message(self.ctx.config.ack_timeout)?
            .ok_or(Error::Timeout)?;
        if res.msg_type != MsgType::SyncListRes {
            return Err(ProtocolError::UnknownMessage(res.msg_type.as_u16()).into());
        }
        let mut requested = BTreeSet::new();
        for op in res.ops() {
            let mut r = WireReader::new(op?.payload);
            let gen_id = r.u16()?;
            match proposals.iter().find(|p| p.gen_id == gen_id) {
                Some(p) if p.disk_size > 0 => {
                    self.set_state(gen_id, HaSyncState::Requested, p.disk_size)?;
                    requested.insert(gen_id);
                }
                _ => warn!(gen_id, "standby requested a generation that was not offered"),
            }
        }
        info!(
            proposed = proposals.len(),
            requested = requested.len(),
            "generation list exchanged"
        );
        Ok(requested)
    }

    fn lock_store(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        let attempts = self.ctx.config.lock_attempts;
        match self.try_lock_store() {
            Ok(lock) => {
                self.lock = Some(lock);
                Ok(())
            }
            Err(e) => {
                error!(attempts, error = %e, "could not lock the store for sync, aborting the sync");
                Err(TransportError::ConnectionBroke.into())
            }
        }
    }

    fn try_lock_store(&self) -> Result<StoreLock> {
        fail_point!(self.ctx.failpoints, points::SYNC_BEFORE_LOCK, return Err(Error::Timeout));
        let cfg = &self.ctx.config;
        self.ctx
            .store
            .gate()
            .lock_with_retry(cfg.lock_attempts, cfg.lock_timeout, "sync")
    }

    /// Read generations on a helper thread, bounded by the memory budget,
    /// and send each one, waiting for its ack before the next.
    fn transfer_disk_gens(&mut self, work: &[(GenId, u64)], sent: &mut BTreeSet<GenId>) -> Result<()> {
        if work.is_empty() {
            return Ok(());
        }
        let ctx = self.ctx;
        let budget = ctx.info.budget();
        let max = ctx.config.sync_max_mem;
        let stop = self.stop;
        let abort = AtomicBool::new(false);
        let (tx, rx) = bounded::<Result<(GenId, u64, Arc<Vec<u8>>)>>(work.len());

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut reserved = 0u64;
                for &(gen_id, size) in work {
                    let halted = || abort.load(Ordering::Acquire) || stop.load(Ordering::Acquire);
                    if !budget.acquire(size, max, halted) {
                        break;
                    }
                    reserved += size;
                    let item = set_sync_state(ctx, gen_id, HaSyncState::Reading, size)
                        .and_then(|_| match ctx.store.recovery_image(gen_id) {
                            Some(image) => Ok(image),
                            None => ctx.disk.read_generation(gen_id).map(Arc::new),
                        })
                        .and_then(|image| {
                            set_sync_state(ctx, gen_id, HaSyncState::Available, image.len() as u64)?;
                            Ok((gen_id, size, image))
                        });
                    let failed = item.is_err();
                    if tx.send(item).is_err() || failed {
                        break;
                    }
                }
                drop(tx);
                reserved
            });

            let mut released = 0u64;
            let mut outcome = Ok(());
            for item in rx.iter() {
                let step = item.and_then(|(gen_id, size, image)| {
                    let r = self.send_disk_gen(gen_id, &image);
                    budget.release(size);
                    released += size;
                    r.map(|_| gen_id)
                });
                match step {
                    Ok(gen_id) => {
                        sent.insert(gen_id);
                    }
                    Err(e) => {
                        outcome = Err(e);
                        abort.store(true, Ordering::Release);
                        break;
                    }
                }
            }
            drop(rx);
            let reserved = reader.join().unwrap_or(released);
            budget.release(reserved.saturating_sub(released));
            outcome
        })
    }

    fn send_disk_gen(&mut self, gen_id: GenId, image: &[u8]) -> Result<()> {
        self.check_alive()?;
        if self.lock.is_none() && self.started.elapsed() > self.ctx.config.sync_max_time {
            info!(gen_id, "sync time budget exhausted, locking the store");
            self.lock_store()?;
        }
        fail_point!(
            self.ctx.failpoints,
            points::SYNC_DISK_GEN,
            return Err(SyncError::Local {
                phase: "disk",
                rc: ReturnCode::DiskError
            }
            .into())
        );
        self.set_state(gen_id, HaSyncState::Sending, image.len() as u64)?;
        let ack = self.chan.request(MsgType::SyncDiskGen, |w| {
            let mut head = BytesMut::with_capacity(10);
            head.put_u64(image.len() as u64);
            head.put_u16(gen_id);
            w.put_op(OpType::Null.as_u16(), &head)?;
            w.put_data(OpType::Null.as_u16(), 0, image)
        })?;
        if !ack.rc.is_ok() {
            return Err(SyncError::Remote(ack.rc).into());
        }
        self.set_state(gen_id, HaSyncState::Sent, image.len() as u64)?;
        debug!(gen_id, len = image.len(), "disk generation sent");
        Ok(())
    }

    fn transfer_mem_gens(&self) -> Result<()> {
        let store = &self.ctx.store;
        self.send_mem_gen(MGMT_GEN_ID, 0, &store.mgmt_image()?)?;
        let resident: Vec<(GenId, u8)> = store
            .header_snapshot()
            .gen_map
            .iter()
            .filter_map(|(id, e)| e.mem_index.map(|i| (*id, i)))
            .collect();
        for (gen_id, index) in resident {
            let image = store.compact(gen_id)?;
            self.send_mem_gen(gen_id, index, &image)?;
        }
        Ok(())
    }

    fn send_mem_gen(&self, gen_id: GenId, index: u8, image: &[u8]) -> Result<()> {
        self.check_alive()?;
        let ack = self.chan.request(MsgType::SyncMemGen, |w| {
            let mut head = BytesMut::with_capacity(11);
            head.put_u64(image.len() as u64);
            head.put_u16(gen_id);
            head.put_u8(index);
            w.put_op(OpType::Null.as_u16(), &head)?;
            w.put_data(OpType::Null.as_u16(), 0, image)
        })?;
        if !ack.rc.is_ok() {
            return Err(SyncError::Remote(ack.rc).into());
        }
        debug!(gen_id, index, len = image.len(), "memory generation sent");
        Ok(())
    }
}

// Standby side.

/// Answer the primary's generation list. Matching local generations are
/// read ahead instead of requested.
pub fn on_sync_list(ctx: &HaContext, chan: &HaChannel, msg: &Message) -> Result<()> {
    ctx.info.begin_sync();
    ctx.store.reset()?;
    let mut requested = Vec::new();
    for op in msg.ops() {
        let p = Proposal::decode(op?.payload)?;
        if p.disk_size == 0 {
            continue;
        }
        if read_ahead(ctx, &p)? {
            debug!(gen_id = p.gen_id, "generation matches local copy");
            continue;
        }
        requested.push(p.gen_id);
    }
    info!(requested = requested.len(), "requesting generations from primary");
    let mut w = chan.writer(MsgType::SyncListRes);
    w.no_ack();
    for gen_id in &requested {
        w.put_op(OpType::Null.as_u16(), &gen_id.to_be_bytes())?;
    }
    w.finish()?;
    Ok(())
}

fn read_ahead(ctx: &HaContext, p: &Proposal) -> Result<bool> {
    if p.token.timestamp == 0 {
        return Ok(false);
    }
    let Some(local) = ctx.disk.generation_size(p.gen_id)? else {
        return Ok(false);
    };
    if local.abs_diff(p.disk_size) >= SYNC_DIFF {
        return Ok(false);
    }
    let image = ctx.disk.read_generation(p.gen_id)?;
    if Generation::image_header(&image)?.token != p.token {
        return Ok(false);
    }
    ctx.store.add_recovery(p.gen_id, image);
    Ok(true)
}

fn coalesced_head(msg: &Message) -> Result<WireReader<'_>> {
    let head = msg
        .head()
        .ok_or_else(|| Error::malformed(format!("{:?} without head", msg.msg_type)))?;
    let mut r = WireReader::new(head);
    r.skip(8)?;
    Ok(r)
}

/// Store a disk generation; acked once the file is written.
pub fn on_disk_gen(ctx: &HaContext, chan: &Arc<HaChannel>, msg: Message) -> Result<Applied> {
    let gen_id = coalesced_head(&msg)?.u16()?;
    let ack = msg.ack(ReturnCode::Ok);
    let image = msg.into_data().unwrap_or_default();
    debug!(gen_id, len = image.len(), "disk generation received");
    let chan = chan.clone();
    ctx.disk.write_generation(
        TaskParams::new(gen_id).cancel_on_term(),
        image,
        Box::new(move |res: Result<DiskGenInfo>| {
            let rc = match res {
                Ok(_) => ReturnCode::Ok,
                Err(e) => {
                    error!(gen_id, error = %e, "failed to store synced generation");
                    e.return_code()
                }
            };
            let ack = Ack { rc, ..ack };
            if let Err(e) = chan.send_ack(&ack) {
                debug!(gen_id, error = %e, "sync ack not delivered");
            }
        }),
    );
    Ok(Applied::Deferred)
}

/// Install the management generation or a resident data generation.
pub fn on_mem_gen(ctx: &HaContext, msg: &Message) -> Result<()> {
    let mut r = coalesced_head(msg)?;
    let gen_id = r.u16()?;
    let index = r.u8()?;
    let image = msg.data().unwrap_or_default();
    if gen_id == MGMT_GEN_ID {
        ctx.store.load_mgmt_image(image)?;
    } else {
        ctx.store.take_recovery(gen_id);
        ctx.store.install(index, Generation::expand(image)?)?;
    }
    debug!(gen_id, index, len = image.len(), "memory generation installed");
    Ok(())
}

/// Final handshake: the standby's copy must be consistent.
pub fn on_complete(ctx: &HaContext) -> Result<()> {
    ctx.store.validate()?;
    ctx.info
        .add_sync_state(sync_state::DISK_DONE | sync_state::MEM_DONE | sync_state::ADMIN_DONE);
    ctx.info.set_role(HaRole::Standby)?;
    ctx.info.end_sync();
    info!(fingerprint = ctx.store.fingerprint()?, "synchronized with primary");
    Ok(())
}

pub fn on_error(ctx: &HaContext, msg: &Message) -> Result<()> {
    let rc = match msg.ops().next() {
        Some(op) => ReturnCode::from_u32(WireReader::new(op?.payload).u32()?),
        None => ReturnCode::SystemError,
    };
    warn!(rc = ?rc, "primary aborted sync");
    ctx.info.set_sync_rc(rc);
    ctx.info.end_sync();
    Ok(())
}

/// Wait until the standby role is reached or `timeout` passes.
pub fn wait_synced(ctx: &HaContext, timeout: Duration) -> bool {
    ctx.info.wait_role(timeout, |r| r == HaRole::Standby).is_some()
}
