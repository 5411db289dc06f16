//! Bounds-checked big-endian primitive access.

use crate::error::{ProtocolError, Result};
use crate::types::{GenToken, Handle};

/// Cursor over a received buffer. Every read checks the remaining length and
/// fails with `ProtocolError::Truncated` instead of panicking.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            }
            .into());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Everything not consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn handle(&mut self) -> Result<Handle> {
        Ok(Handle::from_raw(self.u64()?))
    }

    pub fn token(&mut self) -> Result<GenToken> {
        Ok(GenToken::from_bytes(&self.array()?))
    }

    /// A `[len:2][bytes]` string.
    pub fn short_str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| ProtocolError::Malformed(format!("invalid utf-8: {}", e)).into())
    }

    /// Fail unless the whole buffer was consumed.
    pub fn finish(&self, what: &'static str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::BadLength {
                what,
                len: self.buf.len(),
            }
            .into());
        }
        Ok(())
    }
}

/// Overwrite a big-endian u32 at `pos`.
pub fn patch_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
}

/// Overwrite a big-endian u64 at `pos`.
pub fn patch_u64(buf: &mut [u8], pos: usize, v: u64) {
    buf[pos..pos + 8].copy_from_slice(&v.to_be_bytes());
}

/// Append a `[len:2][bytes]` string.
pub fn put_short_str(buf: &mut bytes::BytesMut, s: &str) {
    use bytes::BufMut;
    let raw = s.as_bytes();
    buf.put_u16(raw.len() as u16);
    buf.put_slice(raw);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_read_primitives() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_u16(0x0102);
        buf.put_u32(0x03040506);
        buf.put_u64(0x0708090a0b0c0d0e);
        put_short_str(&mut buf, "abc");

        let mut r = WireReader::new(&buf);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u16().unwrap(), 0x0102);
        assert_eq!(r.u32().unwrap(), 0x03040506);
        assert_eq!(r.u64().unwrap(), 0x0708090a0b0c0d0e);
        assert_eq!(r.short_str().unwrap(), "abc");
        assert!(r.finish("test").is_ok());
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let buf = [0u8; 3];
        let mut r = WireReader::new(&buf);
        assert!(r.u16().is_ok());
        let err = r.u32().unwrap_err();
        assert!(err.to_string().contains("truncated"));
        // The failed read consumes nothing.
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn test_patch() {
        let mut buf = vec![0u8; 12];
        patch_u32(&mut buf, 0, 0xdeadbeef);
        patch_u64(&mut buf, 4, 42);
        let mut r = WireReader::new(&buf);
        assert_eq!(r.u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.u64().unwrap(), 42);
    }
}
