//! Replication transport: logical channels between the primary and standby.
//!
//! A transport carries opaque frames (one HA fragment each) on numbered
//! channels. The side that opens a channel sees it from
//! [`HaTransport::open_channel`], the peer from
//! [`HaTransport::accept_channel`]. Frames on one channel arrive in order.

use crate::error::{Result, TransportError};
use crate::types::{ChannelId, NodeId};
use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// One end of a logical channel.
pub trait HaLink: Send + Sync {
    fn channel_id(&self) -> ChannelId;

    /// Send one frame. `ConnectionBroke` once the peer is gone.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Wait up to `timeout` for a frame; `Ok(None)` on timeout.
    fn recv(&self, timeout: Duration) -> Result<Option<Bytes>>;

    fn close(&self);
}

/// A connection to the peer node.
pub trait HaTransport: Send + Sync {
    fn local_node(&self) -> NodeId;

    fn peer_node(&self) -> Option<NodeId>;

    fn open_channel(&self, channel: ChannelId) -> Result<Arc<dyn HaLink>>;

    /// Wait up to `timeout` for the peer to open a channel.
    fn accept_channel(&self, timeout: Duration) -> Result<Option<Arc<dyn HaLink>>>;

    /// Number of nodes in the current view, 2 while the peer is reachable.
    fn active_nodes(&self) -> usize;

    /// Drop the connection; every channel fails with `ConnectionBroke`.
    fn disconnect(&self);
}

struct Shared {
    connected: AtomicBool,
}

/// In-process transport pair over crossbeam channels.
pub struct LocalTransport {
    node: NodeId,
    peer: NodeId,
    shared: Arc<Shared>,
    to_peer: Sender<Arc<LocalLink>>,
    incoming: Receiver<Arc<LocalLink>>,
}

impl LocalTransport {
    /// Two connected ends.
    pub fn pair() -> (Arc<LocalTransport>, Arc<LocalTransport>) {
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
        });
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        let a_node = NodeId::new_v4();
        let b_node = NodeId::new_v4();
        let a = Arc::new(LocalTransport {
            node: a_node,
            peer: b_node,
            shared: shared.clone(),
            to_peer: b_tx,
            incoming: a_rx,
        });
        let b = Arc::new(LocalTransport {
            node: b_node,
            peer: a_node,
            shared,
            to_peer: a_tx,
            incoming: b_rx,
        });
        (a, b)
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl HaTransport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn peer_node(&self) -> Option<NodeId> {
        self.connected().then_some(self.peer)
    }

    fn open_channel(&self, channel: ChannelId) -> Result<Arc<dyn HaLink>> {
        if !self.connected() {
            return Err(TransportError::ConnectionBroke.into());
        }
        let (out_tx, out_rx) = unbounded();
        let (back_tx, back_rx) = unbounded();
        let mine = Arc::new(LocalLink {
            channel,
            tx: Mutex::new(Some(out_tx)),
            rx: back_rx,
            shared: self.shared.clone(),
        });
        let theirs = Arc::new(LocalLink {
            channel,
            tx: Mutex::new(Some(back_tx)),
            rx: out_rx,
            shared: self.shared.clone(),
        });
        self.to_peer
            .send(theirs)
            .map_err(|_| TransportError::ConnectionBroke)?;
        debug!(channel, "local channel opened");
        Ok(mine)
    }

    fn accept_channel(&self, timeout: Duration) -> Result<Option<Arc<dyn HaLink>>> {
        if !self.connected() {
            return Err(TransportError::ConnectionBroke.into());
        }
        match self.incoming.recv_timeout(timeout) {
            Ok(link) => Ok(Some(link)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::ConnectionBroke.into()),
        }
    }

    fn active_nodes(&self) -> usize {
        if self.connected() {
            2
        } else {
            1
        }
    }

    fn disconnect(&self) {
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            debug!(node = %self.node, "local transport disconnected");
        }
    }
}

struct LocalLink {
    channel: ChannelId,
    tx: Mutex<Option<Sender<Bytes>>>,
    rx: Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl HaLink for LocalLink {
    fn channel_id(&self) -> ChannelId {
        self.channel
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionBroke.into());
        }
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::ConnectionBroke.into()),
            None => Err(TransportError::Closed(self.channel).into()),
        }
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Bytes>> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionBroke.into());
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                trace!(channel = self.channel, "local channel peer gone");
                Err(TransportError::ConnectionBroke.into())
            }
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_open_accept_and_exchange() {
        let (a, b) = LocalTransport::pair();
        let la = a.open_channel(5).unwrap();
        let lb = b.accept_channel(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(lb.channel_id(), 5);

        la.send(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(lb.recv(Duration::from_secs(1)).unwrap().unwrap(), &b"ping"[..]);
        lb.send(Bytes::from_static(b"pong")).unwrap();
        assert_eq!(la.recv(Duration::from_secs(1)).unwrap().unwrap(), &b"pong"[..]);
        assert!(la.recv(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_close_and_disconnect() {
        let (a, b) = LocalTransport::pair();
        let la = a.open_channel(1).unwrap();
        let lb = b.accept_channel(Duration::from_secs(1)).unwrap().unwrap();
        la.close();
        assert!(matches!(
            lb.recv(Duration::from_millis(50)),
            Err(Error::Transport(TransportError::ConnectionBroke))
        ));

        assert_eq!(a.active_nodes(), 2);
        b.disconnect();
        assert_eq!(a.active_nodes(), 1);
        assert!(a.open_channel(2).err().unwrap().is_connection_broke());
        assert!(a.peer_node().is_none());
    }
}
