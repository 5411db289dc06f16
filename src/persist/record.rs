//! Write-ahead log records.
//!
//! ```text
//! ┌──────────────────────── head (24) ────────────────────────┐
//! │ ts:8 │ cycleId:4 │ payloadLen:4 │ stCount:4 │ hsz:2 │ tsz:2 │
//! └───────────────────────────────────────────────────────────┘
//!   payload: stored fragments of one persist batch
//! ┌──────── tail (16) ────────┐
//! │ ts:8 │ cycleId:4 │ len:4  │   zero padding to the block size
//! └───────────────────────────┘
//! ```
//!
//! Integers are little-endian. A record is valid when its head and tail
//! agree and its cycle id is the one the reader expects. A file is read up
//! to the first record that is not valid; stale records from an earlier
//! cycle of the same file end the file like a zero head does.

use bytes::{BufMut, BytesMut};

/// Size of a record head.
pub const HEAD_SIZE: usize = 24;

/// Size of a record tail.
pub const TAIL_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHead {
    pub timestamp: u64,
    pub cycle_id: u32,
    pub len: u32,
    /// Store-transactions (last fragments) carried by the payload.
    pub st_count: u32,
}

impl RecordHead {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.timestamp);
        buf.put_u32_le(self.cycle_id);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.st_count);
        buf.put_u16_le(HEAD_SIZE as u16);
        buf.put_u16_le(TAIL_SIZE as u16);
    }

    fn decode(buf: &[u8]) -> Option<(Self, u16, u16)> {
        if buf.len() < HEAD_SIZE {
            return None;
        }
        let head = Self {
            timestamp: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            cycle_id: u32::from_le_bytes(buf[8..12].try_into().ok()?),
            len: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            st_count: u32::from_le_bytes(buf[16..20].try_into().ok()?),
        };
        let hsz = u16::from_le_bytes(buf[20..22].try_into().ok()?);
        let tsz = u16::from_le_bytes(buf[22..24].try_into().ok()?);
        Some((head, hsz, tsz))
    }

    fn tail_matches(&self, tail: &[u8]) -> bool {
        tail.len() >= TAIL_SIZE
            && tail[0..8] == self.timestamp.to_le_bytes()
            && tail[8..12] == self.cycle_id.to_le_bytes()
            && tail[12..16] == self.len.to_le_bytes()
    }
}

/// Bytes a record with `payload_len` bytes of payload occupies on disk.
pub fn padded_len(payload_len: usize, block_size: usize) -> usize {
    let raw = HEAD_SIZE + payload_len + TAIL_SIZE;
    raw.div_ceil(block_size) * block_size
}

/// Append one framed record to `out`.
pub fn frame_record(out: &mut BytesMut, head: RecordHead, payload: &[u8], block_size: usize) {
    let start = out.len();
    let total = padded_len(payload.len(), block_size);
    out.reserve(total);
    head.encode(out);
    out.put_slice(payload);
    out.put_u64_le(head.timestamp);
    out.put_u32_le(head.cycle_id);
    out.put_u32_le(head.len);
    out.resize(start + total, 0);
}

/// Why reading a log file stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Zero head or end of file.
    End,
    /// A record of an earlier cycle.
    Stale { cycle_id: u32 },
    /// A record runs past the end of the file.
    Truncated,
    /// Head and tail disagree; the write was torn.
    TailMismatch,
    /// Head sizes are not the ones this reader understands.
    BadHead,
}

/// One valid record.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub offset: usize,
    pub head: RecordHead,
    pub payload: &'a [u8],
}

/// Iterates the valid prefix of a log file.
#[derive(Debug)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
    cycle_id: u32,
    block_size: usize,
    stop: Option<StopReason>,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8], cycle_id: u32, block_size: usize) -> Self {
        Self {
            buf,
            pos: 0,
            cycle_id,
            block_size,
            stop: None,
        }
    }

    /// Set once iteration ended.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    /// Offset just past the last valid record.
    pub fn valid_len(&self) -> usize {
        self.pos
    }

    fn halt(&mut self, reason: StopReason) -> Option<Record<'a>> {
        self.stop = Some(reason);
        None
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop.is_some() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        let Some((head, hsz, tsz)) = RecordHead::decode(rest) else {
            return self.halt(StopReason::End);
        };
        if rest[..HEAD_SIZE].iter().all(|b| *b == 0) {
            return self.halt(StopReason::End);
        }
        if hsz as usize != HEAD_SIZE || tsz as usize != TAIL_SIZE {
            return self.halt(StopReason::BadHead);
        }
        if head.cycle_id != self.cycle_id {
            return self.halt(StopReason::Stale {
                cycle_id: head.cycle_id,
            });
        }
        let len = head.len as usize;
        if rest.len() < HEAD_SIZE + len + TAIL_SIZE {
            return self.halt(StopReason::Truncated);
        }
        if !head.tail_matches(&rest[HEAD_SIZE + len..]) {
            return self.halt(StopReason::TailMismatch);
        }
        let record = Record {
            offset: self.pos,
            head,
            payload: &rest[HEAD_SIZE..HEAD_SIZE + len],
        };
        self.pos = (self.pos + padded_len(len, self.block_size)).min(self.buf.len());
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(ts: u64, cycle_id: u32, payload: &[u8]) -> RecordHead {
        RecordHead {
            timestamp: ts,
            cycle_id,
            len: payload.len() as u32,
            st_count: 1,
        }
    }

    #[test]
    fn test_records_are_block_aligned() {
        let mut out = BytesMut::new();
        frame_record(&mut out, head(1, 7, b"abc"), b"abc", 512);
        assert_eq!(out.len(), 512);
        frame_record(&mut out, head(2, 7, &[9u8; 600]), &[9u8; 600], 512);
        assert_eq!(out.len(), 512 + 1024);
    }

    #[test]
    fn test_reader_yields_payloads_in_order() {
        let mut out = BytesMut::new();
        frame_record(&mut out, head(1, 3, b"one"), b"one", 512);
        frame_record(&mut out, head(2, 3, b"two"), b"two", 512);
        out.resize(out.len() + 512, 0);

        let mut reader = RecordReader::new(&out, 3, 512);
        let payloads: Vec<&[u8]> = reader.by_ref().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![&b"one"[..], &b"two"[..]]);
        assert_eq!(reader.stop_reason(), Some(StopReason::End));
        assert_eq!(reader.valid_len(), 1024);
    }

    #[test]
    fn test_stale_cycle_ends_the_file() {
        let mut out = BytesMut::new();
        frame_record(&mut out, head(1, 4, b"new"), b"new", 512);
        frame_record(&mut out, head(1, 2, b"old"), b"old", 512);

        let mut reader = RecordReader::new(&out, 4, 512);
        assert_eq!(reader.by_ref().count(), 1);
        assert_eq!(reader.stop_reason(), Some(StopReason::Stale { cycle_id: 2 }));
    }

    #[test]
    fn test_torn_tail_is_rejected() {
        let mut out = BytesMut::new();
        frame_record(&mut out, head(1, 1, b"first"), b"first", 512);
        frame_record(&mut out, head(5, 1, b"second"), b"second", 512);
        // Corrupt the second record's tail timestamp.
        out[512 + HEAD_SIZE + 6] ^= 0xff;

        let mut reader = RecordReader::new(&out, 1, 512);
        assert_eq!(reader.by_ref().count(), 1);
        assert_eq!(reader.stop_reason(), Some(StopReason::TailMismatch));
    }

    #[test]
    fn test_truncated_record() {
        let mut out = BytesMut::new();
        frame_record(&mut out, head(1, 1, &[1u8; 100]), &[1u8; 100], 512);
        let cut = &out[..HEAD_SIZE + 50];
        let mut reader = RecordReader::new(cut, 1, 512);
        assert!(reader.next().is_none());
        assert_eq!(reader.stop_reason(), Some(StopReason::Truncated));
    }
}
