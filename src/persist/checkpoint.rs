//! Checkpoint files with streaming LZ4 compression and CRC32 integrity.
//!
//! ```text
//! ┌──────────────────── header (64) ────────────────────┐
//! │ magic "GSCP" │ version:4 │ flags:4 │ cycleId:4 │ genId:2 │ pad:6 │
//! │ timestamp:8 │ dataSize:8 │ reserved:24                          │
//! └─────────────────────────────────────────────────────┘
//!   body: image, LZ4 frame when flag bit 0 is set
//!   crc:4  CRC32 of the body as stored
//! ```
//!
//! Header integers are little-endian. `cycleId` is the cycle of the ST file
//! that continues from this checkpoint; recovery replays that file with it.

use crate::error::{DiskError, Error, Result};
use crate::types::{now_millis, GenId};
use crc::{Crc, CRC_32_ISCSI};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const MAGIC: [u8; 4] = *b"GSCP";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;
const FLAG_LZ4: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub flags: u32,
    pub cycle_id: u32,
    pub gen_id: GenId,
    pub timestamp: u64,
    /// Uncompressed image size.
    pub data_size: u64,
}

impl CheckpointHeader {
    pub fn new(cycle_id: u32, gen_id: GenId, data_size: u64, compress: bool) -> Self {
        Self {
            version: VERSION,
            flags: if compress { FLAG_LZ4 } else { 0 },
            cycle_id,
            gen_id,
            timestamp: now_millis(),
            data_size,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_LZ4 != 0
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.cycle_id.to_le_bytes());
        buf[16..18].copy_from_slice(&self.gen_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[32..40].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE], file: &str) -> Result<Self> {
        let corrupt = |reason: String| -> Error {
            DiskError::Corrupt {
                file: file.to_string(),
                reason,
            }
            .into()
        };
        if buf[0..4] != MAGIC {
            return Err(corrupt(format!("bad magic {:?}", &buf[0..4])));
        }
        let u32_at = |pos: usize| u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        let u64_at = |pos: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[pos..pos + 8]);
            u64::from_le_bytes(b)
        };
        let header = Self {
            version: u32_at(4),
            flags: u32_at(8),
            cycle_id: u32_at(12),
            gen_id: u16::from_le_bytes([buf[16], buf[17]]),
            timestamp: u64_at(24),
            data_size: u64_at(32),
        };
        if header.version != VERSION {
            return Err(corrupt(format!("unsupported version {}", header.version)));
        }
        Ok(header)
    }
}

/// Wrapper that calculates CRC32 while writing.
struct CrcWriter<W: Write> {
    inner: W,
    digest: crc::Digest<'static, u32>,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn finalize_crc(self) -> (W, u32) {
        (self.inner, self.digest.finalize())
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Wrapper that calculates CRC32 while reading.
struct CrcReader<R: Read> {
    inner: R,
    digest: crc::Digest<'static, u32>,
}

impl<R: Read> CrcReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            digest: CRC32.digest(),
        }
    }

    fn finalize_crc(self) -> (R, u32) {
        (self.inner, self.digest.finalize())
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// What a finished checkpoint file looks like.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointInfo {
    pub header: CheckpointHeader,
    pub file_size: u64,
    pub checksum: u32,
}

/// Write an image as a checkpoint file and sync it.
pub fn write_checkpoint(
    path: &Path,
    cycle_id: u32,
    gen_id: GenId,
    image: &[u8],
    compress: bool,
) -> Result<CheckpointInfo> {
    write_inner(path, cycle_id, gen_id, image, compress).map_err(|e| Error::from(DiskError::Io(e)))
}

fn write_inner(path: &Path, cycle_id: u32, gen_id: GenId, image: &[u8], compress: bool) -> io::Result<CheckpointInfo> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    let header = CheckpointHeader::new(cycle_id, gen_id, image.len() as u64, compress);
    out.write_all(&header.to_bytes())?;

    let crc_writer = CrcWriter::new(out);
    let crc_writer = if compress {
        let mut encoder = FrameEncoder::new(crc_writer);
        encoder.write_all(image)?;
        encoder.finish().map_err(io::Error::other)?
    } else {
        let mut w = crc_writer;
        w.write_all(image)?;
        w
    };
    let (mut out, checksum) = crc_writer.finalize_crc();
    out.write_all(&checksum.to_le_bytes())?;
    out.flush()?;

    let file = out.into_inner().map_err(|e| io::Error::other(e.to_string()))?;
    file.sync_all()?;
    let file_size = file.metadata()?.len();
    Ok(CheckpointInfo {
        header,
        file_size,
        checksum,
    })
}

/// Read a checkpoint file, verifying its checksum.
pub fn read_checkpoint(path: &Path) -> Result<(CheckpointHeader, Vec<u8>)> {
    let name = path.display().to_string();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(DiskError::Missing(name).into()),
        Err(e) => return Err(DiskError::Io(e).into()),
    };
    let file_size = file.metadata().map_err(DiskError::Io)?.len();
    if file_size < (HEADER_SIZE + 4) as u64 {
        return Err(DiskError::Corrupt {
            file: name,
            reason: format!("only {} bytes", file_size),
        }
        .into());
    }
    let mut reader = BufReader::new(file);
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).map_err(DiskError::Io)?;
    let header = CheckpointHeader::from_bytes(&raw, &name)?;

    let body_len = file_size - HEADER_SIZE as u64 - 4;
    let crc_reader = CrcReader::new(reader.by_ref().take(body_len));
    let mut image = Vec::with_capacity(header.data_size as usize);
    let crc_reader = if header.is_compressed() {
        let mut decoder = FrameDecoder::new(crc_reader);
        decoder.read_to_end(&mut image).map_err(|e| corrupt(&name, e))?;
        let mut rest = decoder.into_inner();
        io::copy(&mut rest, &mut io::sink()).map_err(DiskError::Io)?;
        rest
    } else {
        let mut r = crc_reader;
        r.read_to_end(&mut image).map_err(DiskError::Io)?;
        r
    };
    let (_, actual) = crc_reader.finalize_crc();
    let mut stored = [0u8; 4];
    reader.read_exact(&mut stored).map_err(DiskError::Io)?;
    let expected = u32::from_le_bytes(stored);
    if expected != actual {
        return Err(DiskError::ChecksumMismatch { expected, actual }.into());
    }
    if image.len() as u64 != header.data_size {
        return Err(DiskError::Corrupt {
            file: name,
            reason: format!("image has {} bytes, header says {}", image.len(), header.data_size),
        }
        .into());
    }
    Ok((header, image))
}

fn corrupt(file: &str, e: io::Error) -> Error {
    DiskError::Corrupt {
        file: file.to_string(),
        reason: e.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn image() -> Vec<u8> {
        (0..20_000u32).flat_map(|i| (i % 97).to_le_bytes()).collect()
    }

    #[test]
    fn test_write_read_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CPG_0_0");
        let data = image();
        let info = write_checkpoint(&path, 9, 3, &data, true).unwrap();
        assert!(info.file_size < data.len() as u64);

        let (header, back) = read_checkpoint(&path).unwrap();
        assert_eq!(header.cycle_id, 9);
        assert_eq!(header.gen_id, 3);
        assert!(header.is_compressed());
        assert_eq!(back, data);
    }

    #[test]
    fn test_write_read_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CPM_1_0");
        let data = b"management image".to_vec();
        let info = write_checkpoint(&path, 1, 1, &data, false).unwrap();
        assert_eq!(info.file_size, (HEADER_SIZE + data.len() + 4) as u64);
        let (header, back) = read_checkpoint(&path).unwrap();
        assert!(!header.is_compressed());
        assert_eq!(back, data);
    }

    #[test]
    fn test_corrupt_body_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("CPM_0_1");
        write_checkpoint(&path, 1, 1, b"0123456789abcdef", false).unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        raw[HEADER_SIZE + 3] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();
        assert!(matches!(
            read_checkpoint(&path),
            Err(Error::Disk(DiskError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            read_checkpoint(&dir.path().join("CPG_1_1")),
            Err(Error::Disk(DiskError::Missing(_)))
        ));
    }
}
