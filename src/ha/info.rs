//! Replication role, view and synchronization bookkeeping of one store node.

use crate::error::{Error, Result, ReturnCode};
use crate::types::{now_millis, HaRole};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Bits of the sync progress mask.
pub mod sync_state {
    pub const START: u32 = 0x1;
    pub const DISK_GENS: u32 = 0x2;
    pub const DISK_DONE: u32 = 0x4;
    pub const MEM_DONE: u32 = 0x8;
    pub const ADMIN_DONE: u32 = 0x40;
    pub const ADMIN_ABORTED: u32 = 0x80;
}

/// Admin-visible replication view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaView {
    pub role: HaRole,
    pub active_nodes: usize,
    pub has_standby: bool,
    pub sync_state: u32,
    pub sync_rc: ReturnCode,
    pub sync_attempts: u64,
    /// Start and end of the last sync attempt, in epoch milliseconds.
    pub sync_started_at: Option<u64>,
    pub sync_finished_at: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    role: HaRole,
    active_nodes: usize,
    sync_state: u32,
    sync_rc: ReturnCode,
    sync_attempts: u64,
    sync_started_at: Option<u64>,
    sync_finished_at: Option<u64>,
}

/// Role state machine and sync counters, shared by every HA thread.
#[derive(Debug)]
pub struct HaInfo {
    inner: Mutex<Inner>,
    changed: Condvar,
    has_standby: AtomicBool,
    budget: SyncBudget,
}

impl Default for HaInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl HaInfo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                role: HaRole::Closed,
                active_nodes: 1,
                sync_state: 0,
                sync_rc: ReturnCode::Ok,
                sync_attempts: 0,
                sync_started_at: None,
                sync_finished_at: None,
            }),
            changed: Condvar::new(),
            has_standby: AtomicBool::new(false),
            budget: SyncBudget::default(),
        }
    }

    pub fn role(&self) -> HaRole {
        self.inner.lock().role
    }

    /// Move to `next`, returning the previous role.
    pub fn set_role(&self, next: HaRole) -> Result<HaRole> {
        let mut inner = self.inner.lock();
        let old = inner.role;
        if !can_move(old, next) {
            return Err(Error::Internal(format!("role cannot move from {:?} to {:?}", old, next)));
        }
        inner.role = next;
        if old != next {
            info!(old = ?old, new = ?next, "replication role changed");
        }
        self.changed.notify_all();
        Ok(old)
    }

    /// Wait until the role satisfies `pred`.
    pub fn wait_role(&self, timeout: Duration, pred: impl Fn(HaRole) -> bool) -> Option<HaRole> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !pred(inner.role) {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return pred(inner.role).then_some(inner.role);
            }
        }
        Some(inner.role)
    }

    pub fn set_active_nodes(&self, n: usize) {
        self.inner.lock().active_nodes = n;
    }

    pub fn has_standby(&self) -> bool {
        self.has_standby.load(Ordering::Acquire)
    }

    pub fn set_has_standby(&self, v: bool) {
        self.has_standby.store(v, Ordering::Release);
    }

    /// Reset the sync mask and counters for a new attempt.
    pub fn begin_sync(&self) {
        let mut inner = self.inner.lock();
        inner.sync_state = sync_state::START;
        inner.sync_rc = ReturnCode::Ok;
        inner.sync_attempts += 1;
        inner.sync_started_at = Some(now_millis());
        inner.sync_finished_at = None;
        self.changed.notify_all();
    }

    pub fn end_sync(&self) {
        self.inner.lock().sync_finished_at = Some(now_millis());
    }

    pub fn add_sync_state(&self, bits: u32) {
        self.inner.lock().sync_state |= bits;
        self.changed.notify_all();
    }

    pub fn sync_state(&self) -> u32 {
        self.inner.lock().sync_state
    }

    /// Record a sync failure. The first failure wins.
    pub fn set_sync_rc(&self, rc: ReturnCode) {
        let mut inner = self.inner.lock();
        if inner.sync_rc.is_ok() && !rc.is_ok() {
            warn!(rc = ?rc, "sync failed");
            inner.sync_rc = rc;
        }
        self.changed.notify_all();
    }

    pub fn sync_rc(&self) -> ReturnCode {
        self.inner.lock().sync_rc
    }

    /// Called by the admin layer once its own state transfer finished.
    pub fn transfer_state_completed(&self, ok: bool) {
        self.add_sync_state(if ok {
            sync_state::ADMIN_DONE
        } else {
            sync_state::ADMIN_ABORTED
        });
    }

    /// Wait for the admin state transfer, polling `stop` every `poll`.
    pub fn wait_admin(&self, poll: Duration, stop: impl Fn() -> bool) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            if inner.sync_state & sync_state::ADMIN_ABORTED != 0 {
                return Err(crate::error::SyncError::AdminAborted.into());
            }
            if inner.sync_state & sync_state::ADMIN_DONE != 0 {
                return Ok(());
            }
            if !inner.sync_rc.is_ok() || stop() {
                return Err(Error::NotAvailable("sync stopped while waiting for admin".into()));
            }
            self.changed.wait_for(&mut inner, poll);
        }
    }

    pub fn budget(&self) -> &SyncBudget {
        &self.budget
    }

    pub fn view(&self) -> HaView {
        let inner = self.inner.lock();
        HaView {
            role: inner.role,
            active_nodes: inner.active_nodes,
            has_standby: self.has_standby(),
            sync_state: inner.sync_state,
            sync_rc: inner.sync_rc,
            sync_attempts: inner.sync_attempts,
            sync_started_at: inner.sync_started_at,
            sync_finished_at: inner.sync_finished_at,
        }
    }
}

fn can_move(from: HaRole, to: HaRole) -> bool {
    use HaRole::*;
    from == to
        || matches!(
            (from, to),
            (Closed, Init)
                | (Init, Unsync)
                | (Init, Primary)
                | (Init, Standby)
                | (Unsync, Standby)
                | (Unsync, Primary)
                | (Standby, Primary)
                | (Standby, Unsync)
                | (_, Terminating)
                | (_, Error)
                | (Terminating, Closed)
                | (Error, Closed)
        )
}

/// Memory budget for generations read ahead of transmission during sync.
///
/// A reservation that does not fit waits until memory is released, except
/// when nothing is reserved: one generation always fits, however large.
#[derive(Debug, Default)]
pub struct SyncBudget {
    in_use: Mutex<u64>,
    freed: Condvar,
}

impl SyncBudget {
    /// Reserve `size` bytes of a `max` budget. Returns false if `stop`
    /// became true while waiting.
    pub fn acquire(&self, size: u64, max: u64, stop: impl Fn() -> bool) -> bool {
        let mut in_use = self.in_use.lock();
        while *in_use != 0 && *in_use + size > max {
            if stop() {
                return false;
            }
            self.freed.wait_for(&mut in_use, Duration::from_millis(50));
        }
        *in_use += size;
        true
    }

    pub fn release(&self, size: u64) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(size);
        self.freed.notify_all();
    }

    pub fn in_use(&self) -> u64 {
        *self.in_use.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_role_transitions() {
        let info = HaInfo::new();
        assert_eq!(info.role(), HaRole::Closed);
        info.set_role(HaRole::Init).unwrap();
        info.set_role(HaRole::Unsync).unwrap();
        assert!(info.set_role(HaRole::Closed).is_err());
        info.set_role(HaRole::Standby).unwrap();
        assert_eq!(info.set_role(HaRole::Primary).unwrap(), HaRole::Standby);
        info.set_role(HaRole::Terminating).unwrap();
        info.set_role(HaRole::Closed).unwrap();
    }

    #[test]
    fn test_first_sync_failure_wins() {
        let info = HaInfo::new();
        info.begin_sync();
        info.set_sync_rc(ReturnCode::DiskError);
        info.set_sync_rc(ReturnCode::Timeout);
        assert_eq!(info.sync_rc(), ReturnCode::DiskError);
        info.begin_sync();
        assert_eq!(info.sync_rc(), ReturnCode::Ok);
        assert_eq!(info.view().sync_attempts, 2);
    }

    #[test]
    fn test_wait_admin() {
        let info = Arc::new(HaInfo::new());
        info.begin_sync();
        let i2 = info.clone();
        let h = thread::spawn(move || i2.wait_admin(Duration::from_millis(10), || false));
        thread::sleep(Duration::from_millis(30));
        info.transfer_state_completed(true);
        h.join().unwrap().unwrap();
        assert_ne!(info.sync_state() & sync_state::ADMIN_DONE, 0);

        info.begin_sync();
        info.transfer_state_completed(false);
        assert!(info.wait_admin(Duration::from_millis(10), || false).is_err());
    }

    #[test]
    fn test_budget_admits_one_oversized_reservation() {
        let budget = Arc::new(SyncBudget::default());
        assert!(budget.acquire(500, 100, || false));
        let b2 = budget.clone();
        let h = thread::spawn(move || b2.acquire(10, 100, || false));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(budget.in_use(), 500);
        budget.release(500);
        assert!(h.join().unwrap());
        assert_eq!(budget.in_use(), 10);
    }

    #[test]
    fn test_wait_role() {
        let info = Arc::new(HaInfo::new());
        info.set_role(HaRole::Init).unwrap();
        let i2 = info.clone();
        let h = thread::spawn(move || i2.wait_role(Duration::from_secs(2), |r| r == HaRole::Standby));
        info.set_role(HaRole::Unsync).unwrap();
        info.set_role(HaRole::Standby).unwrap();
        assert_eq!(h.join().unwrap(), Some(HaRole::Standby));
    }
}
