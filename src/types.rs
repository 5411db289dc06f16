//! Core types used throughout the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generation identifier.
pub type GenId = u16;

/// Persistence stream identifier.
pub type StreamId = u32;

/// Logical HA channel identifier. Negative values are reserved.
pub type ChannelId = i32;

/// Identity of a store node.
pub type NodeId = uuid::Uuid;

/// The management generation holds owner records, states and the generation map.
pub const MGMT_GEN_ID: GenId = 1;

/// First id handed to a data generation.
pub const FIRST_DATA_GEN_ID: GenId = 2;

/// The internal stream skips HA acking and is used for generation messages.
pub const INTERNAL_STREAM: StreamId = 0;

/// Channel ids of the well-known HA channels.
pub const INTERNAL_CHANNEL: ChannelId = -1;
pub const SYNC_CHANNEL: ChannelId = -2;
pub const ADMIN_CHANNEL: ChannelId = -3;

const OFFSET_BITS: u32 = 48;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Store handle: a generation id plus a byte offset into that generation.
///
/// Handles stay valid across restarts and remaps; resolving one into memory
/// always goes through a bounds-checked lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn new(gen_id: GenId, offset: u64) -> Self {
        Self(((gen_id as u64) << OFFSET_BITS) | (offset & OFFSET_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn gen_id(self) -> GenId {
        (self.0 >> OFFSET_BITS) as GenId
    }

    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Handle at a byte distance from this one, in the same generation.
    pub fn add(self, delta: u64) -> Self {
        Self::new(self.gen_id(), self.offset() + delta)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}:{:#x})", self.gen_id(), self.offset())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Identifies one incarnation of a generation. Two copies of a generation are
/// interchangeable only if their tokens are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GenToken {
    /// Creation time in milliseconds; zero means "never written".
    pub timestamp: u64,
    pub random: u64,
}

impl GenToken {
    pub const SIZE: usize = 16;

    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1)
            .max(1);
        Self {
            timestamp,
            random: rand::random(),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..].copy_from_slice(&self.random.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let mut ts = [0u8; 8];
        let mut rnd = [0u8; 8];
        ts.copy_from_slice(&buf[..8]);
        rnd.copy_from_slice(&buf[8..]);
        Self {
            timestamp: u64::from_be_bytes(ts),
            random: u64::from_be_bytes(rnd),
        }
    }
}

/// Replication role of a store node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaRole {
    Closed,
    Init,
    Unsync,
    Standby,
    Primary,
    Terminating,
    Error,
}

/// Notifications the store raises towards the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Ready callbacks crossed the high watermark; producers should slow down.
    CbqAlertOn,
    /// Ready callbacks fell below the low watermark.
    CbqAlertOff,
    /// Persistence failed fatally.
    DiskError,
    /// The node changed replication role.
    RoleChanged { old: HaRole, new: HaRole },
    /// A new standby finished synchronizing.
    StandbySynced { node: NodeId },
}

/// Receives store events. Called from store threads; must not block.
pub type EventSink = std::sync::Arc<dyn Fn(StoreEvent) + Send + Sync>;

/// Per-stream completion callback invoked once an ST is durable (and, when
/// replicated, acknowledged by the standby).
pub type CommitCallback = Box<dyn FnOnce(crate::error::ReturnCode) + Send + 'static>;

/// Current time in milliseconds since the epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_parts() {
        let h = Handle::new(7, 0x1234);
        assert_eq!(h.gen_id(), 7);
        assert_eq!(h.offset(), 0x1234);
        assert_eq!(h.add(8).offset(), 0x123c);
        assert!(Handle::NULL.is_null());
        assert!(!h.is_null());
    }

    #[test]
    fn test_gen_token_bytes() {
        let t = GenToken::generate();
        assert!(t.timestamp > 0);
        assert_eq!(GenToken::from_bytes(&t.to_bytes()), t);
    }
}
