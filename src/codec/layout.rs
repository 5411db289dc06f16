//! Versioned layouts of fragments stored in the write-ahead log.
//!
//! ```text
//! Current (format 2): [fragLength:4][msgType:2][msgSqn:8][fragSqn:4][flags:1][streamId:4][opcount:4]
//! Legacy  (format 1): [totalLength:4][streamId:4][msgType:2][msgSqn:8][fragSqn:4][flags:1][reserved:4][opcount:4]
//! ```
//!
//! `fragLength` excludes its own four bytes, `totalLength` includes them.
//! The layout is chosen once per store from the format byte in `PState`.

use crate::codec::frame::{split_fragment, FragmentHeader, FRAGMENT_HEADER_SIZE};
use crate::codec::wire::WireReader;
use crate::error::{ProtocolError, Result};
use crate::types::StreamId;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

const LEGACY_HEADER_SIZE: usize = FRAGMENT_HEADER_SIZE + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordLayout {
    #[default]
    Current,
    Legacy,
}

/// A fragment read back from the log.
#[derive(Debug, Clone, Copy)]
pub struct StoredFragment<'a> {
    pub stream: StreamId,
    pub header: FragmentHeader,
    pub body: &'a [u8],
    /// Bytes consumed from the input.
    pub consumed: usize,
}

impl RecordLayout {
    pub fn format(self) -> u8 {
        match self {
            RecordLayout::Legacy => 1,
            RecordLayout::Current => 2,
        }
    }

    pub fn from_format(format: u8) -> Result<Self> {
        match format {
            1 => Ok(RecordLayout::Legacy),
            2 => Ok(RecordLayout::Current),
            other => Err(ProtocolError::Malformed(format!("unknown record format {}", other)).into()),
        }
    }

    pub fn header_size(self) -> usize {
        match self {
            RecordLayout::Current => FRAGMENT_HEADER_SIZE,
            RecordLayout::Legacy => LEGACY_HEADER_SIZE,
        }
    }

    /// Parse the fragment at the start of `buf`.
    pub fn parse(self, buf: &[u8]) -> Result<StoredFragment<'_>> {
        match self {
            RecordLayout::Current => {
                let (header, body) = split_fragment(buf)?;
                Ok(StoredFragment {
                    stream: header.reserved,
                    header,
                    body,
                    consumed: header.total_len(),
                })
            }
            RecordLayout::Legacy => {
                let mut r = WireReader::new(buf);
                let total = r.u32()? as usize;
                let stream = r.u32()?;
                if total < LEGACY_HEADER_SIZE || buf.len() < total {
                    return Err(ProtocolError::BadLength {
                        what: "legacy fragment",
                        len: total,
                    }
                    .into());
                }
                let header = FragmentHeader {
                    frag_length: (total - LEGACY_HEADER_SIZE + FRAGMENT_HEADER_SIZE - 4) as u32,
                    msg_type: r.u16()?,
                    msg_sqn: r.u64()?,
                    frag_sqn: r.u32()?,
                    flags: r.u8()?,
                    reserved: r.u32()?,
                    op_count: r.u32()?,
                };
                Ok(StoredFragment {
                    stream,
                    header,
                    body: &buf[LEGACY_HEADER_SIZE..total],
                    consumed: total,
                })
            }
        }
    }

    /// Re-encode a fragment built in the current layout into this layout.
    pub fn convert(self, current: &[u8], out: &mut BytesMut) -> Result<()> {
        let (header, body) = split_fragment(current)?;
        match self {
            RecordLayout::Current => out.put_slice(&current[..header.total_len()]),
            RecordLayout::Legacy => {
                out.put_u32((LEGACY_HEADER_SIZE + body.len()) as u32);
                out.put_u32(header.reserved);
                out.put_u16(header.msg_type);
                out.put_u64(header.msg_sqn);
                out.put_u32(header.frag_sqn);
                out.put_u8(header.flags);
                out.put_u32(0);
                out.put_u32(header.op_count);
                out.put_slice(body);
            }
        }
        Ok(())
    }

    /// Iterate over every fragment in a run of stored fragments.
    pub fn fragments(self, buf: &[u8]) -> StoredIter<'_> {
        StoredIter {
            layout: self,
            buf,
            pos: 0,
        }
    }
}

pub struct StoredIter<'a> {
    layout: RecordLayout,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for StoredIter<'a> {
    type Item = Result<StoredFragment<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        match self.layout.parse(&self.buf[self.pos..]) {
            Ok(frag) => {
                self.pos += frag.consumed;
                Some(Ok(frag))
            }
            Err(e) => {
                self.pos = self.buf.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame::{OpIter, OpenFragment, FLAG_LAST};

    fn sample(stream: StreamId) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut frag = OpenFragment::begin(&mut buf, 2, 11, 0, stream);
        frag.put_op(&mut buf, 7, b"payload");
        frag.finish(&mut buf, FLAG_LAST);
        buf
    }

    #[test]
    fn test_current_layout_reads_stream_from_reserved() {
        let buf = sample(5);
        let frag = RecordLayout::Current.parse(&buf).unwrap();
        assert_eq!(frag.stream, 5);
        assert_eq!(frag.header.msg_sqn, 11);
        assert_eq!(frag.consumed, buf.len());
    }

    #[test]
    fn test_legacy_layout_matches_current_content() {
        let current = sample(3);
        let mut legacy = BytesMut::new();
        RecordLayout::Legacy.convert(&current, &mut legacy).unwrap();
        assert_eq!(legacy.len(), current.len() + 4);

        let frag = RecordLayout::Legacy.parse(&legacy).unwrap();
        assert_eq!(frag.stream, 3);
        assert_eq!(frag.header.msg_type, 2);
        assert!(frag.header.is_last());
        let ops: Vec<_> = OpIter::new(frag.body, frag.header.op_count)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ops[0].payload, b"payload");
    }

    #[test]
    fn test_iterate_run_of_fragments() {
        let mut run = sample(1);
        run.extend_from_slice(&sample(2));
        let streams: Vec<_> = RecordLayout::Current
            .fragments(&run)
            .map(|f| f.unwrap().stream)
            .collect();
        assert_eq!(streams, vec![1, 2]);
    }

    #[test]
    fn test_format_byte() {
        for layout in [RecordLayout::Current, RecordLayout::Legacy] {
            assert_eq!(RecordLayout::from_format(layout.format()).unwrap(), layout);
        }
        assert!(RecordLayout::from_format(9).is_err());
    }
}
