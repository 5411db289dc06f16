//! Admin round trips on the admin channel.
//!
//! The primary serializes requests through a single-owner busy flag; a caller
//! finding the channel busy polls until it frees up. The standby hands each
//! request to an [`AdminHandler`] and returns the response in the ack.

use crate::codec::wire::put_short_str;
use crate::codec::WireReader;
use crate::error::{Error, Result};
use crate::ha::channel::HaChannel;
use crate::ha::message::{Message, MsgType};
use crate::ha::ops::OpType;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Standby-side consumer of admin requests.
pub trait AdminHandler: Send + Sync {
    fn handle_admin(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// A file pushed by the primary's admin layer.
    fn handle_file(&self, path: &str, name: &str, data: &[u8]) -> Result<Vec<u8>>;
}

/// Primary-side sender of admin requests.
pub struct AdminClient {
    chan: Arc<HaChannel>,
    busy: AtomicBool,
    poll: Duration,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AdminClient {
    pub fn new(chan: Arc<HaChannel>, poll: Duration) -> Self {
        Self {
            chan,
            busy: AtomicBool::new(false),
            poll,
        }
    }

    fn acquire(&self) -> BusyGuard<'_> {
        while self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            thread::sleep(self.poll);
        }
        BusyGuard(&self.busy)
    }

    /// Send opaque admin bytes; returns the standby's response.
    pub fn send_admin(&self, data: &[u8]) -> Result<Vec<u8>> {
        let _busy = self.acquire();
        let mut head = BytesMut::with_capacity(8);
        head.put_u64(data.len() as u64);
        self.round_trip(MsgType::Admin, &head, data)
    }

    /// Push a file to the standby's admin layer.
    pub fn send_file(&self, path: &str, name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let _busy = self.acquire();
        let mut head = BytesMut::with_capacity(8 + 4 + path.len() + name.len());
        head.put_u64(data.len() as u64);
        put_short_str(&mut head, path);
        put_short_str(&mut head, name);
        self.round_trip(MsgType::AdminFile, &head, data)
    }

    fn round_trip(&self, msg_type: MsgType, head: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        debug!(msg_type = ?msg_type, len = data.len(), "admin request");
        let ack = self.chan.request(msg_type, |w| {
            w.put_op(OpType::Null.as_u16(), head)?;
            w.put_data(OpType::Null.as_u16(), 0, data)
        })?;
        ack.rc.into_result()?;
        Ok(ack.payload.unwrap_or_default())
    }
}

/// Serve one admin message on the standby.
pub fn handle(handler: Option<&dyn AdminHandler>, msg: &Message) -> Result<Vec<u8>> {
    let handler = handler.ok_or_else(|| Error::NotAvailable("no admin handler".into()))?;
    let head = msg.head().ok_or_else(|| Error::malformed("admin message without head"))?;
    let data = msg.data().unwrap_or_default();
    match msg.msg_type {
        MsgType::Admin => handler.handle_admin(data),
        MsgType::AdminFile => {
            let mut r = WireReader::new(head);
            r.skip(8)?;
            let path = r.short_str()?;
            let name = r.short_str()?;
            handler.handle_file(&path, &name, data)
        }
        other => Err(Error::malformed(format!("{:?} on the admin channel", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HaConfig;
    use crate::error::ReturnCode;
    use crate::ha::channel::AckingPolicy;
    use crate::ha::transport::{HaTransport, LocalTransport};
    use crate::metrics::StoreMetrics;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        files: Mutex<Vec<(String, String, usize)>>,
    }

    impl AdminHandler for Recorder {
        fn handle_admin(&self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().rev().copied().collect())
        }

        fn handle_file(&self, path: &str, name: &str, data: &[u8]) -> Result<Vec<u8>> {
            self.files.lock().push((path.into(), name.into(), data.len()));
            Ok(b"stored".to_vec())
        }
    }

    fn serve(chan: Arc<HaChannel>, handler: Arc<Recorder>, n: usize) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for _ in 0..n {
                let msg = chan.receive_message(Duration::from_secs(2)).unwrap().unwrap();
                let ack = match handle(Some(handler.as_ref()), &msg) {
                    Ok(resp) => msg.ack(ReturnCode::Ok).with_payload(resp),
                    Err(e) => msg.ack(e.return_code()),
                };
                chan.send_ack(&ack).unwrap();
            }
        })
    }

    #[test]
    fn test_admin_and_file_round_trips() {
        let (a, b) = LocalTransport::pair();
        let la = a.open_channel(-3).unwrap();
        let lb = b.accept_channel(Duration::from_secs(1)).unwrap().unwrap();
        let config = HaConfig::new().with_buffer_size(1024);
        let metrics = Arc::new(StoreMetrics::new());
        let tx = Arc::new(HaChannel::new(la, config.clone(), AckingPolicy::AfterProcessing, metrics.clone()));
        let rx = Arc::new(HaChannel::new(lb, config, AckingPolicy::AfterProcessing, metrics));

        let handler = Arc::new(Recorder::default());
        let server = serve(rx, handler.clone(), 2);
        let client = AdminClient::new(tx, Duration::from_millis(1));

        assert_eq!(client.send_admin(b"abc").unwrap(), b"cba");
        let big = vec![9u8; 5000];
        assert_eq!(client.send_file("/etc/store", "cfg.json", &big).unwrap(), b"stored");
        server.join().unwrap();
        assert_eq!(
            handler.files.lock().clone(),
            vec![("/etc/store".to_string(), "cfg.json".to_string(), 5000)]
        );
    }

    #[test]
    fn test_missing_handler_is_not_available() {
        let msg = Message::from_fragments(MsgType::Admin, 0, 0, 0, Vec::new());
        let err = handle(None, &msg).unwrap_err();
        assert_eq!(err.return_code(), ReturnCode::NotAvailable);
    }
}
