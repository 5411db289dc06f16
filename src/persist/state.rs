//! `PState`: the small file that says which checkpoints and logs are current.
//!
//! Stored as a bincode image followed by a CRC32 (little-endian). It is
//! replaced atomically: written to a temporary file, synced, then renamed.

use crate::codec::RecordLayout;
use crate::error::{DiskError, Error, Result};
use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PState {
    /// Record layout format byte.
    pub format: u8,
    /// Cycle id of the current ST file.
    pub cycle_id: u32,
    /// Generation slot whose checkpoint set is current.
    pub start_gen: u8,
    /// A generation transition committed but the closed generation is not
    /// yet on disk.
    pub gen_tr: bool,
    /// Current file index (0 or 1) per generation slot.
    pub start_file: [u8; 2],
    pub clean_stop: bool,
    pub cold_start: bool,
    pub is_standby: bool,
    /// Random token written on a clean stop, cleared at start.
    pub stop_token: [u8; 8],
}

impl PState {
    pub fn new(layout: RecordLayout) -> Self {
        Self {
            format: layout.format(),
            cycle_id: 1,
            start_gen: 0,
            gen_tr: false,
            start_file: [0, 0],
            clean_stop: false,
            cold_start: true,
            is_standby: false,
            stop_token: [0; 8],
        }
    }

    pub fn layout(&self) -> Result<RecordLayout> {
        RecordLayout::from_format(self.format)
    }

    /// File index of the current generation slot.
    pub fn current_file(&self) -> u8 {
        self.start_file[self.start_gen as usize & 1]
    }

    /// Record that the store is running.
    pub fn mark_started(&mut self) {
        self.clean_stop = false;
        self.cold_start = false;
        self.stop_token = [0; 8];
    }

    /// Record a clean stop.
    pub fn mark_clean_stop(&mut self) {
        self.clean_stop = true;
        self.stop_token = rand::random();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = bincode::serialize(self)?;
        let crc = CRC32.checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(DiskError::Corrupt {
                file: "PState".into(),
                reason: format!("{} bytes", buf.len()),
            }
            .into());
        }
        let (body, trailer) = buf.split_at(buf.len() - 4);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(trailer);
        let expected = u32::from_le_bytes(crc);
        let actual = CRC32.checksum(body);
        if expected != actual {
            return Err(DiskError::ChecksumMismatch { expected, actual }.into());
        }
        Ok(bincode::deserialize(body)?)
    }

    /// Read the state file; `None` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(buf) => Self::decode(&buf).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DiskError::Io(e).into()),
        }
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let buf = self.encode()?;
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(DiskError::Io)?;
        file.write_all(&buf).map_err(DiskError::Io)?;
        file.sync_all().map_err(DiskError::Io)?;
        fs::rename(&tmp, path).map_err(|e| Error::from(DiskError::Io(e)))?;
        debug!(
            cycle_id = self.cycle_id,
            start_gen = self.start_gen,
            start_file = ?self.start_file,
            gen_tr = self.gen_tr,
            "PState written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("PState");
        assert!(PState::load(&path).unwrap().is_none());

        let mut state = PState::new(RecordLayout::Legacy);
        state.start_gen = 1;
        state.start_file = [0, 1];
        state.cycle_id = 42;
        state.store(&path).unwrap();

        let loaded = PState::load(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.layout().unwrap(), RecordLayout::Legacy);
        assert_eq!(loaded.current_file(), 1);
    }

    #[test]
    fn test_corruption_is_detected() {
        let state = PState::new(RecordLayout::Current);
        let mut buf = state.encode().unwrap();
        buf[2] ^= 0x40;
        assert!(matches!(
            PState::decode(&buf),
            Err(Error::Disk(DiskError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_stop_token() {
        let mut state = PState::new(RecordLayout::Current);
        state.mark_clean_stop();
        assert!(state.clean_stop);
        state.mark_started();
        assert!(!state.clean_stop);
        assert!(!state.cold_start);
        assert_eq!(state.stop_token, [0; 8]);
    }
}
