//! File-backed disk tasks served by one worker thread.

use crate::disk::{DiskCallback, DiskGenInfo, DiskTasks, DiskWork, TaskParams};
use crate::error::{DiskError, Error, Result};
use crate::memory::Generation;
use crate::types::GenId;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

enum Job {
    Write {
        params: TaskParams,
        image: Vec<u8>,
        cb: DiskCallback,
    },
    Compact {
        params: TaskParams,
        bitmaps: Vec<Vec<u8>>,
        cb: DiskCallback,
    },
    Run {
        params: TaskParams,
        work: DiskWork,
        cb: DiskCallback,
    },
}

impl Job {
    fn params(&self) -> TaskParams {
        match self {
            Job::Write { params, .. } | Job::Compact { params, .. } | Job::Run { params, .. } => *params,
        }
    }

    fn cancel(self) {
        let gen_id = self.params().gen_id;
        debug!(gen_id, "disk task cancelled on termination");
        let cb = match self {
            Job::Write { cb, .. } | Job::Compact { cb, .. } | Job::Run { cb, .. } => cb,
        };
        cb(Err(DiskError::Cancelled.into()));
    }
}

/// Generation files in one directory, named `gen_<id>.dat`.
pub struct FileDiskTasks {
    dir: PathBuf,
    tx: Mutex<Option<Sender<Job>>>,
    terminating: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileDiskTasks {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(DiskError::Io)?;
        let (tx, rx) = unbounded();
        let terminating = Arc::new(AtomicBool::new(false));
        let worker_dir = dir.clone();
        let worker_term = terminating.clone();
        let worker = std::thread::Builder::new()
            .name("store-disk".into())
            .spawn(move || Self::worker_loop(worker_dir, rx, worker_term))
            .map_err(|e| Error::Allocate(format!("disk worker: {}", e)))?;
        info!(dir = %dir.display(), "disk tasks started");
        Ok(Self {
            dir,
            tx: Mutex::new(Some(tx)),
            terminating,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn gen_path(dir: &Path, gen_id: GenId) -> PathBuf {
        dir.join(format!("gen_{}.dat", gen_id))
    }

    fn submit(&self, job: Job) {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) if !self.terminating.load(Ordering::Acquire) || !job.params().cancel_on_term => {
                if let Err(e) = tx.send(job) {
                    e.into_inner().cancel();
                }
            }
            _ => job.cancel(),
        }
    }

    fn worker_loop(dir: PathBuf, rx: Receiver<Job>, terminating: Arc<AtomicBool>) {
        let mut pending: Vec<Job> = Vec::new();
        loop {
            if pending.is_empty() {
                match rx.recv() {
                    Ok(job) => pending.push(job),
                    Err(_) => break,
                }
            }
            pending.extend(rx.try_iter());
            // Highest priority first, FIFO among equals.
            let idx = pending
                .iter()
                .enumerate()
                .max_by_key(|(i, j)| (j.params().priority, std::cmp::Reverse(*i)))
                .map(|(i, _)| i)
                .unwrap_or(0);
            let job = pending.remove(idx);
            if terminating.load(Ordering::Acquire) && job.params().cancel_on_term {
                job.cancel();
                continue;
            }
            Self::execute(&dir, job);
        }
        for job in pending {
            if job.params().cancel_on_term {
                job.cancel();
            } else {
                Self::execute(&dir, job);
            }
        }
        debug!("disk worker stopped");
    }

    fn execute(dir: &Path, job: Job) {
        match job {
            Job::Write { params, image, cb } => {
                let result = Self::write_file(&Self::gen_path(dir, params.gen_id), &image).map(|size| DiskGenInfo {
                    gen_id: params.gen_id,
                    size,
                });
                if let Err(e) = &result {
                    error!(gen_id = params.gen_id, error = %e, "generation write failed");
                }
                cb(result);
            }
            Job::Compact { params, bitmaps, cb } => {
                let path = Self::gen_path(dir, params.gen_id);
                let result = fs::read(&path)
                    .map_err(|e| Error::from(DiskError::Io(e)))
                    .and_then(|image| Generation::expand(&image))
                    .and_then(|gen| gen.compact_with(bitmaps))
                    .and_then(|image| Self::write_file(&path, &image))
                    .map(|size| DiskGenInfo {
                        gen_id: params.gen_id,
                        size,
                    });
                if let Err(e) = &result {
                    error!(gen_id = params.gen_id, error = %e, "generation compaction failed");
                }
                cb(result);
            }
            Job::Run { params, work, cb } => {
                let result = work().map(|size| DiskGenInfo {
                    gen_id: params.gen_id,
                    size,
                });
                cb(result);
            }
        }
    }

    /// Write through a temporary file and rename, then sync.
    fn write_file(path: &Path, data: &[u8]) -> Result<u64> {
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(DiskError::Io)?;
        file.write_all(data).map_err(DiskError::Io)?;
        file.sync_all().map_err(DiskError::Io)?;
        fs::rename(&tmp, path).map_err(DiskError::Io)?;
        Ok(data.len() as u64)
    }
}

impl DiskTasks for FileDiskTasks {
    fn write_generation(&self, params: TaskParams, image: Vec<u8>, cb: DiskCallback) {
        self.submit(Job::Write { params, image, cb });
    }

    fn read_generation(&self, gen_id: GenId) -> Result<Vec<u8>> {
        let path = Self::gen_path(&self.dir, gen_id);
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DiskError::Missing(path.display().to_string()).into())
            }
            Err(e) => Err(DiskError::Io(e).into()),
        }
    }

    fn compact_generation(&self, params: TaskParams, bitmaps: Vec<Vec<u8>>, cb: DiskCallback) {
        self.submit(Job::Compact { params, bitmaps, cb });
    }

    fn delete_generation(&self, gen_id: GenId) -> Result<()> {
        match fs::remove_file(Self::gen_path(&self.dir, gen_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DiskError::Io(e).into()),
        }
    }

    fn generation_size(&self, gen_id: GenId) -> Result<Option<u64>> {
        match fs::metadata(Self::gen_path(&self.dir, gen_id)) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DiskError::Io(e).into()),
        }
    }

    fn list_generations(&self) -> Result<Vec<DiskGenInfo>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(DiskError::Io)? {
            let entry = entry.map_err(DiskError::Io)?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("gen_"))
                .and_then(|n| n.strip_suffix(".dat"))
                .and_then(|n| n.parse::<GenId>().ok())
            else {
                continue;
            };
            let size = entry.metadata().map_err(DiskError::Io)?.len();
            out.push(DiskGenInfo { gen_id: id, size });
        }
        out.sort_by_key(|i| i.gen_id);
        Ok(out)
    }

    fn run_task(&self, params: TaskParams, work: DiskWork, cb: DiskCallback) {
        self.submit(Job::Run { params, work, cb });
    }

    fn terminate(&self) {
        self.terminating.store(true, Ordering::Release);
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("disk worker panicked");
            }
        }
    }
}

impl Drop for FileDiskTasks {
    fn drop(&mut self) {
        self.terminate();
    }
}
