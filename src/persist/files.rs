//! Layout of the persistence directory and the ST log writer.
//!
//! ```text
//! <root>/PState          which slot and file index are current
//! <root>/ST_<g>_<f>      store-transaction log
//! <root>/CPM_<g>_<f>     management checkpoint
//! <root>/CPG_<g>_<f>     active generation checkpoint
//! <root>/generations/    generation files written by the disk tasks
//! ```
//!
//! `g` is the generation slot (0/1) and `f` the file index (0/1). A
//! checkpoint pair and the ST file with the same indices form one set.

use crate::error::{DiskError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Log,
    MgmtCheckpoint,
    GenCheckpoint,
}

impl FileKind {
    fn prefix(self) -> &'static str {
        match self {
            FileKind::Log => "ST",
            FileKind::MgmtCheckpoint => "CPM",
            FileKind::GenCheckpoint => "CPG",
        }
    }
}

pub fn file_name(kind: FileKind, slot: u8, file: u8) -> String {
    format!("{}_{}_{}", kind.prefix(), slot & 1, file & 1)
}

/// Root of the persisted state.
#[derive(Debug, Clone)]
pub struct PersistDir {
    root: PathBuf,
}

impl PersistDir {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(DiskError::Io)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, kind: FileKind, slot: u8, file: u8) -> PathBuf {
        self.root.join(file_name(kind, slot, file))
    }

    pub fn pstate(&self) -> PathBuf {
        self.root.join("PState")
    }

    pub fn generations(&self) -> PathBuf {
        self.root.join("generations")
    }

    /// Read a whole ST file; a missing file reads as empty.
    pub fn read_log(&self, slot: u8, file: u8) -> Result<Vec<u8>> {
        match fs::read(self.path(FileKind::Log, slot, file)) {
            Ok(buf) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(DiskError::Io(e).into()),
        }
    }
}

/// Appends block-aligned records to one ST file.
#[derive(Debug)]
pub struct LogWriter {
    file: File,
    path: PathBuf,
    slot: u8,
    index: u8,
    cycle_id: u32,
    len: u64,
}

impl LogWriter {
    /// Open an ST file for a new cycle, dropping its previous content.
    pub fn create(dir: &PersistDir, slot: u8, index: u8, cycle_id: u32) -> Result<Self> {
        let path = dir.path(FileKind::Log, slot, index);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(DiskError::Io)?;
        file.sync_all().map_err(DiskError::Io)?;
        debug!(path = %path.display(), cycle_id, "log file opened");
        Ok(Self {
            file,
            path,
            slot,
            index,
            cycle_id,
            len: 0,
        })
    }

    /// Write records and make them durable.
    pub fn append(&mut self, records: &[u8]) -> Result<()> {
        self.file.write_all(records).map_err(DiskError::Io)?;
        self.file.sync_data().map_err(DiskError::Io)?;
        self.len += records.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn cycle_id(&self) -> u32 {
        self.cycle_id
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_names() {
        assert_eq!(file_name(FileKind::Log, 0, 1), "ST_0_1");
        assert_eq!(file_name(FileKind::MgmtCheckpoint, 1, 0), "CPM_1_0");
        assert_eq!(file_name(FileKind::GenCheckpoint, 1, 1), "CPG_1_1");
    }

    #[test]
    fn test_create_truncates() {
        let tmp = TempDir::new().unwrap();
        let dir = PersistDir::open(tmp.path()).unwrap();

        let mut w = LogWriter::create(&dir, 0, 0, 1).unwrap();
        w.append(&[1u8; 512]).unwrap();
        w.append(&[2u8; 512]).unwrap();
        assert_eq!(w.len(), 1024);
        drop(w);

        assert_eq!(dir.read_log(0, 0).unwrap().len(), 1024);

        let w = LogWriter::create(&dir, 0, 0, 2).unwrap();
        assert!(w.is_empty());
        assert!(dir.read_log(0, 0).unwrap().is_empty());
        assert!(dir.read_log(1, 1).unwrap().is_empty());
    }
}
