//! HA message types, acks and reassembled messages.

use crate::codec::{FragmentHeader, OpIter, OpenFragment, RawOp, WireReader, FLAG_FLOW_CTRL_ACK, FLAG_LAST, FLAG_NO_ACK};
use crate::error::{ProtocolError, Result, ReturnCode};
use crate::ha::ops::OpType;
use bytes::{BufMut, Bytes, BytesMut};

/// Message types on the HA wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    Ack = 1,
    StoreTran = 2,
    CloseChannel = 3,
    CreateGen = 4,
    ActivateGen = 5,
    WriteGen = 6,
    DeleteGen = 7,
    CompactGen = 8,
    AssignRsrvPool = 9,
    Shutdown = 10,
    UpdateActiveOid = 11,
    SyncList = 20,
    SyncListRes = 21,
    SyncDiskGen = 22,
    SyncMemGen = 23,
    SyncComplete = 24,
    SyncError = 25,
    Admin = 30,
    AdminFile = 31,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Result<Self> {
        use MsgType::*;
        Ok(match v {
            1 => Ack,
            2 => StoreTran,
            3 => CloseChannel,
            4 => CreateGen,
            5 => ActivateGen,
            6 => WriteGen,
            7 => DeleteGen,
            8 => CompactGen,
            9 => AssignRsrvPool,
            10 => Shutdown,
            11 => UpdateActiveOid,
            20 => SyncList,
            21 => SyncListRes,
            22 => SyncDiskGen,
            23 => SyncMemGen,
            24 => SyncComplete,
            25 => SyncError,
            30 => Admin,
            31 => AdminFile,
            other => return Err(ProtocolError::UnknownMessage(other).into()),
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Messages whose size is announced by their first op and whose data ops
    /// are copied by offset into one buffer.
    pub fn is_coalesced(self) -> bool {
        matches!(
            self,
            MsgType::Admin | MsgType::AdminFile | MsgType::SyncDiskGen | MsgType::SyncMemGen
        )
    }

    /// Generation lifecycle messages sent on the internal channel.
    pub fn is_generation(self) -> bool {
        matches!(
            self,
            MsgType::CreateGen
                | MsgType::ActivateGen
                | MsgType::WriteGen
                | MsgType::DeleteGen
                | MsgType::CompactGen
                | MsgType::AssignRsrvPool
                | MsgType::Shutdown
        )
    }
}

/// Acknowledgment of a message or, with `flow_ctrl`, of a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub ack_sqn: u64,
    pub frag_sqn: u32,
    pub src_msg_type: u16,
    pub rc: ReturnCode,
    pub payload: Option<Vec<u8>>,
    pub flow_ctrl: bool,
}

impl Ack {
    const BODY: usize = 18;

    pub fn new(ack_sqn: u64, frag_sqn: u32, src_msg_type: u16, rc: ReturnCode) -> Self {
        Self {
            ack_sqn,
            frag_sqn,
            src_msg_type,
            rc,
            payload: None,
            flow_ctrl: false,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Encode as one complete fragment.
    pub fn encode(&self, buf: &mut BytesMut, msg_sqn: u64) {
        let mut frag = OpenFragment::begin(buf, MsgType::Ack.as_u16(), msg_sqn, 0, 0);
        let pos = frag.begin_op(buf, OpType::Null.as_u16());
        buf.put_u64(self.ack_sqn);
        buf.put_u32(self.frag_sqn);
        buf.put_u16(self.src_msg_type);
        buf.put_u32(self.rc.as_u32());
        frag.end_op(buf, pos);
        if let Some(p) = &self.payload {
            frag.put_op(buf, OpType::Null.as_u16(), p);
        }
        let flags = if self.flow_ctrl { FLAG_LAST | FLAG_FLOW_CTRL_ACK } else { FLAG_LAST };
        frag.finish(buf, flags);
    }

    pub fn decode(header: &FragmentHeader, body: &[u8]) -> Result<Self> {
        let mut ops = OpIter::new(body, header.op_count);
        let first = ops
            .next()
            .ok_or_else(|| ProtocolError::Malformed("ack without body".into()))??;
        if first.payload.len() < Self::BODY {
            return Err(ProtocolError::BadLength {
                what: "ack",
                len: first.payload.len(),
            }
            .into());
        }
        let mut r = WireReader::new(first.payload);
        let mut ack = Ack::new(r.u64()?, r.u32()?, r.u16()?, ReturnCode::from_u32(r.u32()?));
        ack.flow_ctrl = header.wants_flow_ctrl_ack();
        if let Some(op) = ops.next() {
            ack.payload = Some(op?.payload.to_vec());
        }
        Ok(ack)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Body {
    /// Fragment bodies with their op counts, in arrival order.
    Fragments(Vec<(Bytes, u32)>),
    /// Head op payload and the data copied in by offset.
    Coalesced { head: Vec<u8>, data: Vec<u8> },
}

/// A complete message, reassembled from its fragments.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MsgType,
    pub msg_sqn: u64,
    /// Fragment sequence of the last fragment.
    pub last_frag_sqn: u32,
    /// Flags of the last fragment.
    pub flags: u8,
    pub(crate) body: Body,
}

impl Message {
    pub(crate) fn from_fragments(
        msg_type: MsgType,
        msg_sqn: u64,
        last_frag_sqn: u32,
        flags: u8,
        fragments: Vec<(Bytes, u32)>,
    ) -> Self {
        Self {
            msg_type,
            msg_sqn,
            last_frag_sqn,
            flags,
            body: Body::Fragments(fragments),
        }
    }

    pub fn no_ack(&self) -> bool {
        self.flags & FLAG_NO_ACK != 0
    }

    /// Operation records across every fragment.
    pub fn ops(&self) -> Box<dyn Iterator<Item = Result<RawOp<'_>>> + '_> {
        match &self.body {
            Body::Fragments(frags) => Box::new(frags.iter().flat_map(|(b, n)| OpIter::new(b, *n))),
            Body::Coalesced { head, .. } => Box::new(std::iter::once(Ok(RawOp {
                op_type: OpType::Null.as_u16(),
                payload: head.as_slice(),
            }))),
        }
    }

    /// Head op payload of a coalesced message.
    pub fn head(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Coalesced { head, .. } => Some(head),
            Body::Fragments(_) => None,
        }
    }

    /// Coalesced data of a coalesced message.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Coalesced { data, .. } => Some(data),
            Body::Fragments(_) => None,
        }
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        match self.body {
            Body::Coalesced { data, .. } => Some(data),
            Body::Fragments(_) => None,
        }
    }

    /// Ack answering this message.
    pub fn ack(&self, rc: ReturnCode) -> Ack {
        Ack::new(self.msg_sqn, self.last_frag_sqn, self.msg_type.as_u16(), rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::split_fragment;

    #[test]
    fn test_msg_type_values() {
        for t in [MsgType::Ack, MsgType::SyncMemGen, MsgType::AdminFile, MsgType::UpdateActiveOid] {
            assert_eq!(MsgType::from_u16(t.as_u16()).unwrap(), t);
        }
        assert!(MsgType::from_u16(99).is_err());
        assert!(MsgType::SyncDiskGen.is_coalesced());
        assert!(!MsgType::StoreTran.is_coalesced());
        assert!(MsgType::WriteGen.is_generation());
    }

    #[test]
    fn test_ack_encode_decode() {
        let ack = Ack::new(41, 3, MsgType::Admin.as_u16(), ReturnCode::DiskError).with_payload(b"resp".to_vec());
        let mut buf = BytesMut::new();
        ack.encode(&mut buf, 7);
        let (header, body) = split_fragment(&buf).unwrap();
        assert_eq!(header.msg_type, MsgType::Ack.as_u16());
        assert!(header.is_last());
        assert_eq!(Ack::decode(&header, body).unwrap(), ack);
    }

    #[test]
    fn test_flow_ctrl_ack_flag() {
        let mut ack = Ack::new(1, 0, MsgType::StoreTran.as_u16(), ReturnCode::Ok);
        ack.flow_ctrl = true;
        let mut buf = BytesMut::new();
        ack.encode(&mut buf, 0);
        let (header, body) = split_fragment(&buf).unwrap();
        assert!(header.wants_flow_ctrl_ack());
        assert!(Ack::decode(&header, body).unwrap().flow_ctrl);
    }
}
