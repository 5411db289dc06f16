//! Fragment header and operation record framing.

use crate::codec::wire::{patch_u32, WireReader};
use crate::error::{ProtocolError, Result};
use bytes::{BufMut, BytesMut};

/// Size of the fixed fragment header.
pub const FRAGMENT_HEADER_SIZE: usize = 27;

/// Size of an operation record header (`opType:2` + `opLength:4`).
pub const OP_HEADER_SIZE: usize = 6;

/// Last fragment of a message.
pub const FLAG_LAST: u8 = 0x1;
/// The sender waits for an ack of this fragment before sending more.
pub const FLAG_FLOW_CTRL_ACK: u8 = 0x2;
/// The receiver must not ack this message.
pub const FLAG_NO_ACK: u8 = 0x4;

const OFF_MSG_TYPE: usize = 4;
const OFF_FLAGS: usize = 18;
const OFF_RESERVED: usize = 19;
const OFF_OP_COUNT: usize = 23;

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Fragment length excluding this field.
    pub frag_length: u32,
    pub msg_type: u16,
    pub msg_sqn: u64,
    pub frag_sqn: u32,
    pub flags: u8,
    /// Unused on the HA wire; carries the stream id in persisted fragments.
    pub reserved: u32,
    pub op_count: u32,
}

impl FragmentHeader {
    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    pub fn wants_flow_ctrl_ack(&self) -> bool {
        self.flags & FLAG_FLOW_CTRL_ACK != 0
    }

    pub fn no_ack(&self) -> bool {
        self.flags & FLAG_NO_ACK != 0
    }

    /// Total bytes of the fragment on the wire.
    pub fn total_len(&self) -> usize {
        self.frag_length as usize + 4
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.frag_length);
        buf.put_u16(self.msg_type);
        buf.put_u64(self.msg_sqn);
        buf.put_u32(self.frag_sqn);
        buf.put_u8(self.flags);
        buf.put_u32(self.reserved);
        buf.put_u32(self.op_count);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(buf);
        let header = Self {
            frag_length: r.u32()?,
            msg_type: r.u16()?,
            msg_sqn: r.u64()?,
            frag_sqn: r.u32()?,
            flags: r.u8()?,
            reserved: r.u32()?,
            op_count: r.u32()?,
        };
        if header.total_len() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::BadLength {
                what: "fragment",
                len: header.total_len(),
            }
            .into());
        }
        Ok(header)
    }
}

/// Split one complete fragment into header and operation area.
pub fn split_fragment(buf: &[u8]) -> Result<(FragmentHeader, &[u8])> {
    let header = FragmentHeader::decode(buf)?;
    if buf.len() < header.total_len() {
        return Err(ProtocolError::Truncated {
            offset: 0,
            needed: header.total_len(),
            available: buf.len(),
        }
        .into());
    }
    Ok((header, &buf[FRAGMENT_HEADER_SIZE..header.total_len()]))
}

/// Clear the no-ack bit of a fragment already sitting in a buffer.
pub fn clear_no_ack(buf: &mut [u8], flags_pos: usize) {
    buf[flags_pos] &= !FLAG_NO_ACK;
}

/// One operation record borrowed from a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOp<'a> {
    pub op_type: u16,
    pub payload: &'a [u8],
}

/// Iterator over the operation records of one fragment.
pub struct OpIter<'a> {
    reader: WireReader<'a>,
    left: u32,
}

impl<'a> OpIter<'a> {
    pub fn new(body: &'a [u8], op_count: u32) -> Self {
        Self {
            reader: WireReader::new(body),
            left: op_count,
        }
    }

    fn next_op(&mut self) -> Result<RawOp<'a>> {
        let op_type = self.reader.u16()?;
        let len = self.reader.u32()? as usize;
        let payload = self.reader.bytes(len)?;
        Ok(RawOp { op_type, payload })
    }
}

impl<'a> Iterator for OpIter<'a> {
    type Item = Result<RawOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.left == 0 {
            return None;
        }
        self.left -= 1;
        match self.next_op() {
            Ok(op) => Some(Ok(op)),
            Err(e) => {
                self.left = 0;
                Some(Err(e))
            }
        }
    }
}

/// A fragment under construction at the tail of a buffer.
///
/// The header is written with placeholder length, flags and op count, and
/// patched by [`OpenFragment::finish`].
#[derive(Debug)]
pub struct OpenFragment {
    start: usize,
    op_count: u32,
}

impl OpenFragment {
    pub fn begin(buf: &mut BytesMut, msg_type: u16, msg_sqn: u64, frag_sqn: u32, reserved: u32) -> Self {
        let start = buf.len();
        FragmentHeader {
            frag_length: 0,
            msg_type,
            msg_sqn,
            frag_sqn,
            flags: 0,
            reserved,
            op_count: 0,
        }
        .encode(buf);
        Self { start, op_count: 0 }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn op_count(&self) -> u32 {
        self.op_count
    }

    /// Bytes used by this fragment so far.
    pub fn len(&self, buf: &BytesMut) -> usize {
        buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.op_count == 0
    }

    pub fn put_op(&mut self, buf: &mut BytesMut, op_type: u16, payload: &[u8]) {
        buf.put_u16(op_type);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        self.op_count += 1;
    }

    /// Start an op whose payload is appended by the caller; returns the
    /// position of its length field for [`OpenFragment::end_op`].
    pub fn begin_op(&mut self, buf: &mut BytesMut, op_type: u16) -> usize {
        buf.put_u16(op_type);
        let pos = buf.len();
        buf.put_u32(0);
        self.op_count += 1;
        pos
    }

    pub fn end_op(&self, buf: &mut BytesMut, len_pos: usize) {
        let len = buf.len() - len_pos - 4;
        patch_u32(buf, len_pos, len as u32);
    }

    /// Patch the header. Returns the position of the flags byte.
    pub fn finish(self, buf: &mut BytesMut, flags: u8) -> usize {
        let total = buf.len() - self.start;
        patch_u32(buf, self.start, (total - 4) as u32);
        buf[self.start + OFF_FLAGS] = flags;
        patch_u32(buf, self.start + OFF_OP_COUNT, self.op_count);
        self.start + OFF_FLAGS
    }

    /// Rewrite the message type of a fragment being built.
    pub fn set_msg_type(&self, buf: &mut BytesMut, msg_type: u16) {
        buf[self.start + OFF_MSG_TYPE..self.start + OFF_MSG_TYPE + 2]
            .copy_from_slice(&msg_type.to_be_bytes());
    }

    pub fn set_reserved(&self, buf: &mut BytesMut, reserved: u32) {
        patch_u32(buf, self.start + OFF_RESERVED, reserved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = FragmentHeader {
            frag_length: 23,
            msg_type: 2,
            msg_sqn: 99,
            frag_sqn: 3,
            flags: FLAG_LAST | FLAG_NO_ACK,
            reserved: 17,
            op_count: 0,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAGMENT_HEADER_SIZE);
        let decoded = FragmentHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_last());
        assert!(decoded.no_ack());
        assert!(!decoded.wants_flow_ctrl_ack());
    }

    #[test]
    fn test_open_fragment_builds_ops() {
        let mut buf = BytesMut::new();
        let mut frag = OpenFragment::begin(&mut buf, 5, 1, 0, 9);
        frag.put_op(&mut buf, 1, b"abc");
        let pos = frag.begin_op(&mut buf, 2);
        buf.put_u64(7);
        frag.end_op(&mut buf, pos);
        let flags_pos = frag.finish(&mut buf, FLAG_LAST | FLAG_NO_ACK);

        clear_no_ack(&mut buf, flags_pos);
        let (header, body) = split_fragment(&buf).unwrap();
        assert_eq!(header.total_len(), buf.len());
        assert_eq!(header.op_count, 2);
        assert_eq!(header.reserved, 9);
        assert_eq!(header.flags, FLAG_LAST);

        let ops: Vec<_> = OpIter::new(body, header.op_count)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ops[0], RawOp { op_type: 1, payload: b"abc" });
        assert_eq!(ops[1].op_type, 2);
        assert_eq!(ops[1].payload, &7u64.to_be_bytes());
    }

    #[test]
    fn test_op_iter_rejects_short_body() {
        let mut buf = BytesMut::new();
        let mut frag = OpenFragment::begin(&mut buf, 5, 1, 0, 0);
        frag.put_op(&mut buf, 1, b"abcdef");
        frag.finish(&mut buf, FLAG_LAST);
        let (header, body) = split_fragment(&buf).unwrap();
        let short = &body[..body.len() - 2];
        let result: Result<Vec<_>> = OpIter::new(short, header.op_count).collect();
        assert!(result.is_err());
    }

    #[test]
    fn test_split_rejects_truncated_fragment() {
        let mut buf = BytesMut::new();
        let mut frag = OpenFragment::begin(&mut buf, 5, 1, 0, 0);
        frag.put_op(&mut buf, 1, &[0u8; 32]);
        frag.finish(&mut buf, FLAG_LAST);
        assert!(split_fragment(&buf[..buf.len() - 1]).is_err());
    }
}
