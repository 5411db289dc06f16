//! High-availability replication between a primary and one standby.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── primary ────────────────────────┐
//! │ persist thread ──▶ HA tx workers ──▶ per-stream channels │
//! │ engine ──────────▶ internal channel (-1): gen messages   │
//! │ sync thread ─────▶ sync channel (-2)                     │
//! │ admin client ────▶ admin channel (-3)                    │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ HaTransport (local or TCP)
//! ┌──────────────────────────▼─────────── standby ──────────┐
//! │ Receiver: one thread per accepted channel                │
//! │   StoreTran / UpdateActiveOid ──▶ ops::apply_ops         │
//! │   CreateGen .. Shutdown ────────▶ gen_msg::apply         │
//! │   SyncList .. SyncComplete ─────▶ sync::on_*             │
//! │   Admin / AdminFile ────────────▶ AdminHandler           │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod channel;
pub mod gen_msg;
pub mod info;
pub mod message;
pub mod ops;
pub mod receiver;
pub mod sync;
pub mod transport;

pub use admin::{AdminClient, AdminHandler};
pub use channel::{AckingPolicy, HaChannel, MessageWriter};
pub use gen_msg::{Applied, GenMessage, MapKind};
pub use info::{sync_state, HaInfo, HaView, SyncBudget};
pub use message::{Ack, Message, MsgType};
pub use ops::{OpType, Operation, StoreOp};
pub use receiver::Receiver;
pub use transport::{HaLink, HaTransport, LocalTransport};

use crate::config::HaConfig;
use crate::disk::DiskTasks;
use crate::memory::MemoryStore;
use crate::metrics::StoreMetrics;
use crate::testing::failpoint::FailpointRegistry;
use std::sync::Arc;

/// Everything the replication threads of one node share.
#[derive(Clone)]
pub struct HaContext {
    pub store: Arc<MemoryStore>,
    pub disk: Arc<dyn DiskTasks>,
    pub info: Arc<HaInfo>,
    pub config: HaConfig,
    pub metrics: Arc<StoreMetrics>,
    pub failpoints: Arc<FailpointRegistry>,
}

impl std::fmt::Debug for HaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaContext")
            .field("role", &self.info.role())
            .field("config", &self.config)
            .finish()
    }
}

impl HaContext {
    /// Acking policy of a channel: the internal channel acks on receipt.
    pub fn policy_for(channel: crate::types::ChannelId) -> AckingPolicy {
        if channel == crate::types::INTERNAL_CHANNEL {
            AckingPolicy::BeforeProcessing
        } else {
            AckingPolicy::AfterProcessing
        }
    }

    /// Wrap a link in a channel configured for this node.
    pub fn channel(&self, link: Arc<dyn HaLink>) -> HaChannel {
        let policy = Self::policy_for(link.channel_id());
        HaChannel::new(link, self.config.clone(), policy, self.metrics.clone())
    }
}
