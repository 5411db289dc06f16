//! TCP replication transport.
//!
//! One connection carries every logical channel. Frames are length
//! prefixed:
//!
//! ```text
//! [len:4][kind:1][channel:4][payload]      len counts kind + channel + payload
//! kind: 1 open, 2 data, 3 close, 4 hello (payload = node id)
//! ```
//!
//! Socket I/O runs on a small tokio runtime owned by the transport; the HA
//! threads stay blocking and talk to it through channels. Channels are
//! opened by one side only (the primary).

use crate::error::{Error, Result, TransportError};
use crate::ha::transport::{HaLink, HaTransport};
use crate::types::{ChannelId, NodeId};
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// Largest frame accepted from the peer.
const MAX_FRAME: usize = 16 * 1024 * 1024;

const KIND_OPEN: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_CLOSE: u8 = 3;
const KIND_HELLO: u8 = 4;

fn encode_frame(kind: u8, channel: ChannelId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + payload.len());
    buf.put_u32((5 + payload.len()) as u32);
    buf.put_u8(kind);
    buf.put_i32(channel);
    buf.put_slice(payload);
    buf.freeze()
}

async fn read_frame(stream: &mut OwnedReadHalf) -> std::io::Result<Option<(u8, ChannelId, Bytes)>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(5..=MAX_FRAME).contains(&len) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad frame length {}", len),
        ));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    let kind = data[0];
    let channel = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Ok(Some((kind, channel, Bytes::from(data).slice(5..))))
}

struct Shared {
    connected: AtomicBool,
    links: Mutex<HashMap<ChannelId, Sender<Bytes>>>,
}

impl Shared {
    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            // Dropping the senders wakes every blocked receiver.
            self.links.lock().clear();
        }
    }
}

/// Replication transport over one TCP connection.
pub struct TcpTransport {
    node: NodeId,
    peer: NodeId,
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<Bytes>,
    incoming: Receiver<Arc<TcpLink>>,
    runtime: Mutex<Option<Runtime>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("node", &self.node)
            .field("peer", &self.peer)
            .field("connected", &self.shared.connected.load(Ordering::Relaxed))
            .finish()
    }
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ha-tcp")
        .enable_all()
        .build()
        .map_err(|e| TransportError::Io(e).into())
}

impl TcpTransport {
    /// Connect to a peer listening on `addr`.
    pub fn connect(addr: SocketAddr, node: NodeId) -> Result<Arc<Self>> {
        let rt = runtime()?;
        let stream = rt
            .block_on(TcpStream::connect(addr))
            .map_err(TransportError::Io)?;
        info!(peer_addr = %addr, "replication connection established");
        Self::establish(rt, stream, node)
    }

    /// Wait up to `timeout` for one peer on `listener`.
    pub fn accept(listener: std::net::TcpListener, node: NodeId, timeout: Duration) -> Result<Arc<Self>> {
        let rt = runtime()?;
        listener.set_nonblocking(true).map_err(TransportError::Io)?;
        let stream = rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            match tokio::time::timeout(timeout, listener.accept()).await {
                Ok(accepted) => accepted.map(|(stream, peer_addr)| {
                    debug!(peer = %peer_addr, "accepted replication connection");
                    Some(stream)
                }),
                Err(_) => Ok(None),
            }
        });
        match stream.map_err(TransportError::Io)? {
            Some(stream) => Self::establish(rt, stream, node),
            None => Err(Error::Timeout),
        }
    }

    fn establish(rt: Runtime, stream: TcpStream, node: NodeId) -> Result<Arc<Self>> {
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        let (mut reader, mut writer) = stream.into_split();
        let peer = rt
            .block_on(async {
                writer.write_all(&encode_frame(KIND_HELLO, 0, node.as_bytes())).await?;
                match read_frame(&mut reader).await? {
                    Some((KIND_HELLO, _, payload)) if payload.len() == 16 => {
                        let mut id = [0u8; 16];
                        id.copy_from_slice(&payload);
                        Ok(NodeId::from_bytes(id))
                    }
                    _ => Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "expected hello from peer",
                    )),
                }
            })
            .map_err(TransportError::Io)?;

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            links: Mutex::new(HashMap::new()),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = unbounded();
        rt.spawn(write_loop(writer, out_rx, shared.clone()));
        rt.spawn(read_loop(reader, shared.clone(), out_tx.clone(), accept_tx));
        info!(node = %node, peer = %peer, "replication transport ready");
        Ok(Arc::new(Self {
            node,
            peer,
            shared,
            out: out_tx,
            incoming: accept_rx,
            runtime: Mutex::new(Some(rt)),
        }))
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn register(&self, channel: ChannelId) -> Arc<TcpLink> {
        let (tx, rx) = unbounded();
        self.shared.links.lock().insert(channel, tx);
        Arc::new(TcpLink {
            channel,
            out: self.out.clone(),
            rx,
            shared: self.shared.clone(),
        })
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>, shared: Arc<Shared>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "replication write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
    shared.disconnect();
    trace!("replication writer done");
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<Bytes>,
    accept: Sender<Arc<TcpLink>>,
) {
    loop {
        let (kind, channel, payload) = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("replication peer closed the connection");
                break;
            }
            Err(e) => {
                error!(error = %e, "replication read failed");
                break;
            }
        };
        match kind {
            KIND_OPEN => {
                let (tx, rx) = unbounded();
                shared.links.lock().insert(channel, tx);
                let link = Arc::new(TcpLink {
                    channel,
                    out: out.clone(),
                    rx,
                    shared: shared.clone(),
                });
                if accept.send(link).is_err() {
                    break;
                }
            }
            KIND_DATA => {
                let tx = shared.links.lock().get(&channel).cloned();
                match tx {
                    Some(tx) => {
                        let _ = tx.send(payload);
                    }
                    None => trace!(channel, "data for unknown channel dropped"),
                }
            }
            KIND_CLOSE => {
                shared.links.lock().remove(&channel);
            }
            other => trace!(kind = other, "unknown frame kind ignored"),
        }
    }
    shared.disconnect();
}

impl HaTransport for TcpTransport {
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
        let link = self.register(channel);
        self.out
            .send(encode_frame(KIND_OPEN, channel, &[]))
            .map_err(|_| TransportError::ConnectionBroke)?;
        debug!(channel, "tcp channel opened");
        Ok(link)
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
        self.shared.disconnect();
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
        }
        info!(node = %self.node, "replication transport disconnected");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}

struct TcpLink {
    channel: ChannelId,
    out: mpsc::UnboundedSender<Bytes>,
    rx: Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl HaLink for TcpLink {
    fn channel_id(&self) -> ChannelId {
        self.channel
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionBroke.into());
        }
        self.out
            .send(encode_frame(KIND_DATA, self.channel, &frame))
            .map_err(|_| TransportError::ConnectionBroke.into())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Bytes>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::ConnectionBroke.into()),
        }
    }

    fn close(&self) {
        let _ = self.out.send(encode_frame(KIND_CLOSE, self.channel, &[]));
        self.shared.links.lock().remove(&self.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn connected_pair() -> (Arc<TcpTransport>, Arc<TcpTransport>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || TcpTransport::accept(listener, NodeId::new_v4(), Duration::from_secs(5)));
        let client = TcpTransport::connect(addr, NodeId::new_v4()).unwrap();
        let server = server.join().unwrap().unwrap();
        (client, server)
    }

    #[test]
    fn test_hello_exchanges_node_ids() {
        let (client, server) = connected_pair();
        assert_eq!(client.peer_node(), Some(server.local_node()));
        assert_eq!(server.peer_node(), Some(client.local_node()));
        assert_eq!(client.active_nodes(), 2);
    }

    #[test]
    fn test_channels_are_multiplexed() {
        let (client, server) = connected_pair();
        let a = client.open_channel(-2).unwrap();
        let b = client.open_channel(7).unwrap();
        let sa = server.accept_channel(Duration::from_secs(2)).unwrap().unwrap();
        let sb = server.accept_channel(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!((sa.channel_id(), sb.channel_id()), (-2, 7));

        b.send(Bytes::from_static(b"seven")).unwrap();
        a.send(Bytes::from_static(b"sync")).unwrap();
        assert_eq!(sa.recv(Duration::from_secs(2)).unwrap().unwrap(), &b"sync"[..]);
        assert_eq!(sb.recv(Duration::from_secs(2)).unwrap().unwrap(), &b"seven"[..]);

        sb.send(Bytes::from_static(b"ack")).unwrap();
        assert_eq!(b.recv(Duration::from_secs(2)).unwrap().unwrap(), &b"ack"[..]);
    }

    #[test]
    fn test_disconnect_breaks_links() {
        let (client, server) = connected_pair();
        let a = client.open_channel(1).unwrap();
        let sa = server.accept_channel(Duration::from_secs(2)).unwrap().unwrap();
        client.disconnect();
        assert!(a.send(Bytes::from_static(b"x")).unwrap_err().is_connection_broke());

        let mut broke = false;
        for _ in 0..50 {
            match sa.recv(Duration::from_millis(100)) {
                Err(e) => {
                    broke = e.is_connection_broke();
                    break;
                }
                Ok(_) => continue,
            }
        }
        assert!(broke);
        assert_eq!(client.active_nodes(), 1);
    }
}
