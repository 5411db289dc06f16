//! Failpoints for crash and fault injection.
//!
//! A [`FailpointRegistry`] is owned by each engine and handed to the threads
//! that check it; there is no process-wide registry, so several engines in
//! one test process are isolated from each other.
//!
//! ```rust,ignore
//! let registry = FailpointRegistry::new();
//! registry.enable(points::PERSIST_BEFORE_WRITE, FailpointAction::Return);
//! // in the persist thread:
//! fail_point!(registry, points::PERSIST_BEFORE_WRITE, return);
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Named points checked by the store.
pub mod points {
    /// Persist thread, batch assembled, before the log write.
    pub const PERSIST_BEFORE_WRITE: &str = "persist_before_write";
    /// Persist thread, log write done, before callbacks are released.
    pub const PERSIST_AFTER_WRITE: &str = "persist_after_write";
    /// Checkpoint files written, before `PState` is updated.
    pub const CHECKPOINT_BEFORE_PSTATE: &str = "checkpoint_before_pstate";
    /// Checkpoint file write.
    pub const CHECKPOINT_WRITE: &str = "checkpoint_write";
    /// Sync thread, before the store is locked for in-memory generations.
    pub const SYNC_BEFORE_LOCK: &str = "sync_before_lock";
    /// Sync thread, between two disk generations.
    pub const SYNC_DISK_GEN: &str = "sync_disk_gen";
    /// Standby receiver, before applying a store-transaction.
    pub const STANDBY_APPLY: &str = "standby_apply";
}

/// What a failpoint does when hit.
#[derive(Clone)]
pub enum FailpointAction {
    /// Unwind the calling thread's work loop at this point.
    Return,
    /// Fail the guarded operation.
    Error,
    Sleep(Duration),
    Callback(Arc<dyn Fn() + Send + Sync>),
    /// Run `action` from the `after`-th hit on.
    After(u64, Box<FailpointAction>),
    /// Run `action` with probability `p`.
    Probability(f64, Box<FailpointAction>),
    /// Run `action` on the first hit only.
    Once(Box<FailpointAction>),
}

impl std::fmt::Debug for FailpointAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Return => write!(f, "Return"),
            Self::Error => write!(f, "Error"),
            Self::Sleep(d) => write!(f, "Sleep({:?})", d),
            Self::Callback(_) => write!(f, "Callback(..)"),
            Self::After(n, a) => write!(f, "After({}, {:?})", n, a),
            Self::Probability(p, a) => write!(f, "Probability({}, {:?})", p, a),
            Self::Once(a) => write!(f, "Once({:?})", a),
        }
    }
}

/// Outcome of checking a failpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailpointResult {
    Continue,
    Return,
    Error,
}

struct FailpointState {
    action: FailpointAction,
    hits: AtomicU64,
    triggered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailpointStats {
    pub hits: u64,
    pub triggered: u64,
}

#[derive(Default)]
pub struct FailpointRegistry {
    points: RwLock<HashMap<String, Arc<FailpointState>>>,
}

impl std::fmt::Debug for FailpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailpointRegistry")
            .field("points", &self.list())
            .finish()
    }
}

impl FailpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, name: &str, action: FailpointAction) {
        self.points.write().insert(
            name.to_string(),
            Arc::new(FailpointState {
                action,
                hits: AtomicU64::new(0),
                triggered: AtomicU64::new(0),
            }),
        );
    }

    pub fn disable(&self, name: &str) {
        self.points.write().remove(name);
    }

    pub fn disable_all(&self) {
        self.points.write().clear();
    }

    pub fn check(&self, name: &str) -> FailpointResult {
        let Some(state) = self.points.read().get(name).cloned() else {
            return FailpointResult::Continue;
        };
        let hit = state.hits.fetch_add(1, Ordering::Relaxed) + 1;
        let result = Self::run(&state.action, hit);
        if result != FailpointResult::Continue || matches!(state.action, FailpointAction::Sleep(_)) {
            state.triggered.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(failpoint = name, hit, ?result, "failpoint triggered");
        }
        result
    }

    fn run(action: &FailpointAction, hit: u64) -> FailpointResult {
        match action {
            FailpointAction::Return => FailpointResult::Return,
            FailpointAction::Error => FailpointResult::Error,
            FailpointAction::Sleep(d) => {
                std::thread::sleep(*d);
                FailpointResult::Continue
            }
            FailpointAction::Callback(cb) => {
                cb();
                FailpointResult::Continue
            }
            FailpointAction::After(n, inner) if hit >= *n => Self::run(inner, hit),
            FailpointAction::Probability(p, inner) if rand::random::<f64>() < *p => Self::run(inner, hit),
            FailpointAction::Once(inner) if hit == 1 => Self::run(inner, hit),
            FailpointAction::After(..) | FailpointAction::Probability(..) | FailpointAction::Once(_) => {
                FailpointResult::Continue
            }
        }
    }

    pub fn stats(&self, name: &str) -> Option<FailpointStats> {
        self.points.read().get(name).map(|s| FailpointStats {
            hits: s.hits.load(Ordering::Relaxed),
            triggered: s.triggered.load(Ordering::Relaxed),
        })
    }

    pub fn list(&self) -> Vec<String> {
        self.points.read().keys().cloned().collect()
    }
}

/// Check a failpoint. Compiled to nothing outside tests unless the
/// `failpoints` feature is on.
///
/// ```rust,ignore
/// fail_point!(registry, "name");
/// fail_point!(registry, "name", return);
/// fail_point!(registry, "name", return Err(DiskError::Fatal.into()));
/// ```
#[macro_export]
macro_rules! fail_point {
    ($registry:expr, $name:expr) => {
        if cfg!(feature = "failpoints") || cfg!(test) {
            let _ = $registry.check($name);
        }
    };

    ($registry:expr, $name:expr, return) => {
        if cfg!(feature = "failpoints") || cfg!(test) {
            if $registry.check($name) != $crate::testing::failpoint::FailpointResult::Continue {
                return;
            }
        }
    };

    ($registry:expr, $name:expr, return $val:expr) => {
        if cfg!(feature = "failpoints") || cfg!(test) {
            if $registry.check($name) != $crate::testing::failpoint::FailpointResult::Continue {
                return $val;
            }
        }
    };
}

pub use fail_point;
