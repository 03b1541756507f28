//! Per-instance lock files.
//!
//! Each instance id owns `<lock_dir>/local-instance-<id>.lock`. A handle
//! holds an exclusive `flock` on it for as long as it lives; the file
//! content records whether the id belongs to a running group, which
//! outlives the handle.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InUseState {
    InUse,
    NotInUse,
}

impl InUseState {
    fn as_str(self) -> &'static str {
        match self {
            InUseState::InUse => "in_use",
            InUseState::NotInUse => "not_in_use",
        }
    }

    fn parse(content: &str) -> Result<Self> {
        match content.trim() {
            "in_use" => Ok(InUseState::InUse),
            "not_in_use" | "" => Ok(InUseState::NotInUse),
            other => bail!("unrecognized lock file content: {:?}", other),
        }
    }
}

impl std::fmt::Display for InUseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exclusively locked instance lock file.
#[derive(Debug)]
pub struct InstanceLockFile {
    instance_id: u32,
    path: PathBuf,
    file: File,
}

impl InstanceLockFile {
    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> Result<InUseState> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .with_context(|| format!("reading lock file: {}", self.path.display()))?;
        InUseState::parse(&content)
    }

    pub fn set_status(&self, state: InUseState) -> Result<()> {
        let mut file = &self.file;
        file.set_len(0)
            .with_context(|| format!("truncating lock file: {}", self.path.display()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(state.as_str().as_bytes())
            .with_context(|| format!("writing lock file: {}", self.path.display()))?;
        file.flush()?;
        debug!(id = self.instance_id, state = %state, "instance lock state updated");
        Ok(())
    }
}

pub struct InstanceLockFileManager {
    lock_dir: PathBuf,
    max_instance_id: u32,
}

impl InstanceLockFileManager {
    pub fn new(lock_dir: impl Into<PathBuf>, max_instance_id: u32) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            max_instance_id,
        }
    }

    pub fn max_instance_id(&self) -> u32 {
        self.max_instance_id
    }

    pub fn lock_path(&self, id: u32) -> PathBuf {
        self.lock_dir.join(format!("local-instance-{}.lock", id))
    }

    /// Lock instance `id`. Fails when another handle holds it or when a
    /// running group already owns it.
    pub fn acquire(&self, id: u32) -> Result<InstanceLockFile> {
        match self.try_acquire(id)? {
            Some(lock) => Ok(lock),
            None => bail!("instance {} is locked or in use", id),
        }
    }

    /// Like [`acquire`](Self::acquire) but returns `None` instead of an
    /// error when the id is taken.
    pub fn try_acquire(&self, id: u32) -> Result<Option<InstanceLockFile>> {
        let Some(lock) = self.lock(id)? else {
            return Ok(None);
        };
        if lock.status()? == InUseState::InUse {
            return Ok(None);
        }
        Ok(Some(lock))
    }

    /// Mark `id` as no longer owned by a running group.
    pub fn release(&self, id: u32) -> Result<()> {
        match self.lock(id)? {
            Some(lock) => lock.set_status(InUseState::NotInUse),
            None => bail!("instance {} is locked by another process", id),
        }
    }

    fn lock(&self, id: u32) -> Result<Option<InstanceLockFile>> {
        std::fs::create_dir_all(&self.lock_dir)
            .with_context(|| format!("creating lock dir: {}", self.lock_dir.display()))?;
        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file: {}", path.display()))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Ok(None);
            }
            return Err(err).with_context(|| format!("locking {}", path.display()));
        }

        Ok(Some(InstanceLockFile {
            instance_id: id,
            path,
            file,
        }))
    }

    /// Lock the `count` lowest free ids in `1..=max_instance_id`.
    pub fn try_acquire_unused(&self, count: usize) -> Result<Vec<InstanceLockFile>> {
        let mut acquired = Vec::with_capacity(count);
        for id in 1..=self.max_instance_id {
            if acquired.len() == count {
                break;
            }
            match self.try_acquire(id) {
                Ok(Some(lock)) => acquired.push(lock),
                Ok(None) => {}
                Err(e) => warn!(id, error = %e, "skipping instance id"),
            }
        }
        if acquired.len() < count {
            bail!(
                "only {} of {} requested instance ids are free (max id {})",
                acquired.len(),
                count,
                self.max_instance_id
            );
        }
        Ok(acquired)
    }

    /// Read the recorded state without taking the lock. A missing file
    /// means the id was never used.
    pub fn status(&self, id: u32) -> Result<InUseState> {
        let path = self.lock_path(id);
        match std::fs::read_to_string(&path) {
            Ok(content) => InUseState::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(InUseState::NotInUse),
            Err(e) => Err(e).with_context(|| format!("reading lock file: {}", path.display())),
        }
    }
}
