//! Generation lifecycle messages.
//!
//! ```text
//! op 0      Null [genId:2][genIndex:1]
//! op 'G'    Null ['G'][GenHeader]
//! op 'M'    Null ['M'][MgmtHeader]
//! op 'T'    Null ['T'][token:16]
//! bitmaps   AllocateGranulesMap [predictedSize:8][mapCount:1]
//!           CreateGranulesMap   [poolId:1][bitmapIdx:1][len:4]
//!           SetGranulesMap      [poolId:1][bitmapIdx:1][offset:4][bytes]
//! ```
//!
//! `WriteGen` ships free-granule maps (bitmap index 0), `CompactGen` live
//! maps (index 1). Maps longer than a fragment are split over several
//! `SetGranulesMap` ops.

use crate::codec::WireReader;
use crate::disk::{DiskGenInfo, TaskParams};
use crate::error::{Error, ProtocolError, Result, ReturnCode};
use crate::ha::channel::{HaChannel, MessageWriter};
use crate::ha::message::{Ack, Message, MsgType};
use crate::ha::ops::OpType;
use crate::ha::HaContext;
use crate::memory::{GenHeader, GenState, MgmtHeader};
use crate::types::{GenId, GenToken};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use tracing::{debug, error, info};

const TAG_GEN_HEADER: u8 = b'G';
const TAG_MGMT_HEADER: u8 = b'M';
const TAG_TOKEN: u8 = b'T';

/// Which granules a shipped bitmap marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Free = 0,
    Live = 1,
}

impl MapKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MapKind::Free),
            1 => Ok(MapKind::Live),
            other => Err(Error::malformed(format!("unknown bitmap index {}", other))),
        }
    }
}

/// Per-pool granule bitmaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranuleMaps {
    pub kind: MapKind,
    pub maps: Vec<Vec<u8>>,
}

/// A decoded generation message.
#[derive(Debug, Clone, Default)]
pub struct GenMessage {
    pub gen_id: GenId,
    pub gen_index: u8,
    pub gen_header: Option<GenHeader>,
    pub mgmt_header: Option<MgmtHeader>,
    pub token: Option<GenToken>,
    pub maps: Option<GranuleMaps>,
}

impl GenMessage {
    pub fn new(gen_id: GenId, gen_index: u8) -> Self {
        Self {
            gen_id,
            gen_index,
            ..Default::default()
        }
    }

    pub fn with_gen_header(mut self, h: GenHeader) -> Self {
        self.gen_header = Some(h);
        self
    }

    pub fn with_mgmt_header(mut self, h: MgmtHeader) -> Self {
        self.mgmt_header = Some(h);
        self
    }

    pub fn with_token(mut self, t: GenToken) -> Self {
        self.token = Some(t);
        self
    }

    pub fn with_maps(mut self, kind: MapKind, maps: Vec<Vec<u8>>) -> Self {
        self.maps = Some(GranuleMaps { kind, maps });
        self
    }

    /// Write every op of the message.
    pub fn write_to(&self, w: &mut MessageWriter<'_>) -> Result<()> {
        let null = OpType::Null.as_u16();
        let mut head = BytesMut::with_capacity(3);
        head.put_u16(self.gen_id);
        head.put_u8(self.gen_index);
        w.put_op(null, &head)?;
        if let Some(h) = &self.gen_header {
            w.put_op(null, &tagged(TAG_GEN_HEADER, &h.to_bytes()?))?;
        }
        if let Some(h) = &self.mgmt_header {
            w.put_op(null, &tagged(TAG_MGMT_HEADER, &h.to_bytes()?))?;
        }
        if let Some(t) = &self.token {
            w.put_op(null, &tagged(TAG_TOKEN, &t.to_bytes()))?;
        }
        if let Some(maps) = &self.maps {
            write_maps(w, maps)?;
        }
        Ok(())
    }

    pub fn parse(msg: &Message) -> Result<Self> {
        let mut ops = msg.ops();
        let first = ops
            .next()
            .ok_or_else(|| Error::malformed("generation message without ops"))??;
        let mut r = WireReader::new(first.payload);
        let mut out = GenMessage::new(r.u16()?, r.u8()?);
        let mut maps: Option<GranuleMaps> = None;
        for op in ops {
            let op = op?;
            match OpType::from_u16(op.op_type)? {
                OpType::Null => {
                    let (tag, body) = op
                        .payload
                        .split_first()
                        .ok_or_else(|| Error::malformed("empty tagged op"))?;
                    match *tag {
                        TAG_GEN_HEADER => out.gen_header = Some(GenHeader::from_bytes(body)?),
                        TAG_MGMT_HEADER => out.mgmt_header = Some(MgmtHeader::from_bytes(body)?),
                        TAG_TOKEN => {
                            let raw: &[u8; GenToken::SIZE] = body.try_into().map_err(|_| {
                                ProtocolError::BadLength {
                                    what: "generation token",
                                    len: body.len(),
                                }
                            })?;
                            out.token = Some(GenToken::from_bytes(raw));
                        }
                        other => return Err(Error::malformed(format!("unknown tag {:#x}", other))),
                    }
                }
                OpType::AllocateGranulesMap => {
                    let mut r = WireReader::new(op.payload);
                    let _predicted = r.u64()?;
                    let count = r.u8()? as usize;
                    maps = Some(GranuleMaps {
                        kind: MapKind::Free,
                        maps: vec![Vec::new(); count],
                    });
                }
                OpType::CreateGranulesMap => {
                    let mut r = WireReader::new(op.payload);
                    let pool = r.u8()? as usize;
                    let kind = MapKind::from_u8(r.u8()?)?;
                    let len = r.u32()? as usize;
                    let m = maps.as_mut().ok_or_else(|| Error::malformed("bitmap before allocation"))?;
                    m.kind = kind;
                    *m.maps
                        .get_mut(pool)
                        .ok_or_else(|| Error::malformed(format!("bitmap for unknown pool {}", pool)))? =
                        vec![0u8; len];
                }
                OpType::SetGranulesMap => {
                    let mut r = WireReader::new(op.payload);
                    let pool = r.u8()? as usize;
                    let _kind = r.u8()?;
                    let offset = r.u32()? as usize;
                    let bytes = r.rest();
                    let map = maps
                        .as_mut()
                        .and_then(|m| m.maps.get_mut(pool))
                        .ok_or_else(|| Error::malformed(format!("bitmap for unknown pool {}", pool)))?;
                    map.get_mut(offset..offset + bytes.len())
                        .ok_or(ProtocolError::BadLength {
                            what: "bitmap chunk",
                            len: offset + bytes.len(),
                        })?
                        .copy_from_slice(bytes);
                }
                other => return Err(ProtocolError::UnknownOperation(other.as_u16()).into()),
            }
        }
        out.maps = maps;
        Ok(out)
    }
}

fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(body.len() + 1);
    v.push(tag);
    v.extend_from_slice(body);
    v
}

fn write_maps(w: &mut MessageWriter<'_>, maps: &GranuleMaps) -> Result<()> {
    let predicted: usize = maps.maps.iter().map(|m| m.len()).sum();
    let mut head = BytesMut::with_capacity(9);
    head.put_u64(predicted as u64);
    head.put_u8(maps.maps.len() as u8);
    w.put_op(OpType::AllocateGranulesMap.as_u16(), &head)?;
    for (pool, map) in maps.maps.iter().enumerate() {
        let mut create = BytesMut::with_capacity(6);
        create.put_u8(pool as u8);
        create.put_u8(maps.kind as u8);
        create.put_u32(map.len() as u32);
        w.put_op(OpType::CreateGranulesMap.as_u16(), &create)?;

        let mut offset = 0;
        while offset < map.len() {
            if w.room() < 6 + 64 {
                w.break_fragment()?;
            }
            let n = w.room().saturating_sub(6).max(1).min(map.len() - offset);
            let mut set = BytesMut::with_capacity(6 + n);
            set.put_u8(pool as u8);
            set.put_u8(maps.kind as u8);
            set.put_u32(offset as u32);
            set.put_slice(&map[offset..offset + n]);
            w.put_op(OpType::SetGranulesMap.as_u16(), &set)?;
            offset += n;
        }
    }
    Ok(())
}

/// Send a generation message and wait for its ack.
pub fn send(chan: &HaChannel, msg_type: MsgType, msg: &GenMessage) -> Result<()> {
    debug!(msg_type = ?msg_type, gen_id = msg.gen_id, "sending generation message");
    let ack = chan.request(msg_type, |w| msg.write_to(w))?;
    ack.rc.into_result()
}

/// Send a generation message that is not acked.
pub fn post(chan: &HaChannel, msg_type: MsgType, msg: &GenMessage) -> Result<()> {
    let mut w = chan.writer(msg_type);
    w.no_ack();
    msg.write_to(&mut w)?;
    w.finish()?;
    Ok(())
}

/// Outcome of applying a generation message on the standby.
#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    /// Ack now.
    Done,
    /// The ack is sent when the disk task completes.
    Deferred,
    /// The primary asked the standby to terminate.
    Terminate,
}

/// Apply a generation message on the standby.
pub fn apply(ctx: &HaContext, chan: &Arc<HaChannel>, msg: &Message) -> Result<Applied> {
    let gm = GenMessage::parse(msg)?;
    let store = &ctx.store;
    debug!(msg_type = ?msg.msg_type, gen_id = gm.gen_id, index = gm.gen_index, "applying generation message");
    match msg.msg_type {
        MsgType::CreateGen => {
            let header = gm.gen_header.ok_or_else(|| Error::malformed("CreateGen without header"))?;
            store.create_generation(gm.gen_index, gm.gen_id)?;
            store.with_gen_mut(gm.gen_id, |g| {
                g.header_mut().token = header.token;
                Ok(())
            })?;
            if let Some(m) = gm.mgmt_header {
                store.apply_header(m);
            }
            if let Some(e) = store.header().gen_map.get_mut(&gm.gen_id) {
                e.token = header.token;
            }
            Ok(Applied::Done)
        }
        MsgType::ActivateGen => {
            store.activate_generation(gm.gen_id, gm.gen_index)?;
            if let Some(m) = gm.mgmt_header {
                store.apply_header(m);
            }
            Ok(Applied::Done)
        }
        MsgType::WriteGen => {
            let maps = gm.maps.ok_or_else(|| Error::malformed("WriteGen without bitmaps"))?;
            let gen_id = gm.gen_id;
            store.with_gen_mut(gen_id, |g| {
                for (pool, map) in maps.maps.iter().enumerate() {
                    g.apply_free_bitmap(pool as u8, map)?;
                }
                g.link_ref_chunks()?;
                Ok(())
            })?;
            if let Some(m) = gm.mgmt_header {
                store.apply_header(m);
            }
            store.set_gen_state(gen_id, GenState::WritePending)?;
            let image = store.compact(gen_id)?;
            let ack = msg.ack(ReturnCode::Ok);
            let (store2, chan2) = (ctx.store.clone(), chan.clone());
            ctx.disk.write_generation(
                TaskParams::new(gen_id).cancel_on_term(),
                image,
                Box::new(move |res: Result<DiskGenInfo>| {
                    let rc = match res.and_then(|info| store2.evict(gen_id, info.size)) {
                        Ok(()) => {
                            info!(gen_id, "standby generation written");
                            ReturnCode::Ok
                        }
                        Err(e) => {
                            error!(gen_id, error = %e, "standby generation write failed");
                            e.return_code()
                        }
                    };
                    send_deferred(&chan2, Ack { rc, ..ack });
                }),
            );
            Ok(Applied::Deferred)
        }
        MsgType::DeleteGen => {
            ctx.disk.delete_generation(gm.gen_id)?;
            store.delete_generation(gm.gen_id);
            Ok(Applied::Done)
        }
        MsgType::CompactGen => {
            let maps = gm.maps.ok_or_else(|| Error::malformed("CompactGen without bitmaps"))?;
            let ack = msg.ack(ReturnCode::Ok);
            let (store2, chan2) = (ctx.store.clone(), chan.clone());
            ctx.disk.compact_generation(
                TaskParams::new(gm.gen_id).cancel_on_term(),
                maps.maps,
                Box::new(move |res: Result<DiskGenInfo>| {
                    let rc = match res {
                        Ok(info) => {
                            store2.set_disk_size(info.gen_id, info.size);
                            ReturnCode::Ok
                        }
                        Err(e) => e.return_code(),
                    };
                    send_deferred(&chan2, Ack { rc, ..ack });
                }),
            );
            Ok(Applied::Deferred)
        }
        MsgType::AssignRsrvPool => {
            let m = gm
                .mgmt_header
                .ok_or_else(|| Error::malformed("AssignRsrvPool without management header"))?;
            store.apply_header(m);
            Ok(Applied::Done)
        }
        MsgType::Shutdown => {
            info!(token = ?gm.token, "primary requested shutdown");
            Ok(Applied::Terminate)
        }
        other => Err(ProtocolError::UnknownMessage(other.as_u16()).into()),
    }
}

fn send_deferred(chan: &HaChannel, ack: Ack) {
    if let Err(e) = chan.send_ack(&ack) {
        if e.is_connection_broke() {
            debug!(channel = chan.id(), "deferred ack dropped, connection broke");
        } else {
            error!(channel = chan.id(), error = %e, "failed to send deferred ack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HaConfig;
    use crate::ha::channel::AckingPolicy;
    use crate::ha::transport::{HaTransport, LocalTransport};
    use crate::metrics::StoreMetrics;
    use std::time::Duration;

    fn pair(buffer: usize) -> (HaChannel, HaChannel) {
        let (a, b) = LocalTransport::pair();
        let la = a.open_channel(-1).unwrap();
        let lb = b.accept_channel(Duration::from_secs(1)).unwrap().unwrap();
        let config = HaConfig::new().with_buffer_size(buffer);
        let metrics = Arc::new(StoreMetrics::new());
        (
            HaChannel::new(la, config.clone(), AckingPolicy::BeforeProcessing, metrics.clone()),
            HaChannel::new(lb, config, AckingPolicy::BeforeProcessing, metrics),
        )
    }

    #[test]
    fn test_bitmaps_span_fragments() {
        let (tx, rx) = pair(256);
        let maps = vec![(0..1000).map(|i| (i % 251) as u8).collect::<Vec<u8>>(), vec![0xff; 37]];
        let token = GenToken::generate();
        let sent = GenMessage::new(7, 1)
            .with_token(token)
            .with_maps(MapKind::Live, maps.clone());
        post(&tx, MsgType::CompactGen, &sent).unwrap();

        let msg = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        assert!(msg.last_frag_sqn > 2);
        let got = GenMessage::parse(&msg).unwrap();
        assert_eq!((got.gen_id, got.gen_index), (7, 1));
        assert_eq!(got.token, Some(token));
        let got_maps = got.maps.unwrap();
        assert_eq!(got_maps.kind, MapKind::Live);
        assert_eq!(got_maps.maps, maps);
    }

    #[test]
    fn test_headers_round_trip() {
        use crate::config::MemoryConfig;
        use crate::memory::{MemoryStore, NoWriteBack};

        let store = MemoryStore::new(MemoryConfig::small(), Arc::new(NoWriteBack)).unwrap();
        let gen_id = store.bootstrap().unwrap();
        let gh = store.with_gen(gen_id, |g| Ok(g.header().clone())).unwrap();
        let mh = store.header_snapshot();

        let (tx, rx) = pair(512);
        post(
            &tx,
            MsgType::CreateGen,
            &GenMessage::new(gen_id, 0).with_gen_header(gh.clone()).with_mgmt_header(mh.clone()),
        )
        .unwrap();
        let msg = rx.receive_message(Duration::from_secs(1)).unwrap().unwrap();
        let got = GenMessage::parse(&msg).unwrap();
        assert_eq!(got.gen_header, Some(gh));
        assert_eq!(got.mgmt_header, Some(mh));
        assert!(got.maps.is_none());
    }
}
