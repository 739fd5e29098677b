//! Persistent JSON store guarded by an advisory file lock.
//!
//! A [`Store`] binds one JSON document inside a directory together with the
//! `lock` file of that directory. The lock is an OS `flock(2)`, so it
//! serializes independent processes as well as separate handles inside one
//! process. Every mutation goes through [`Store::update`], which takes the
//! lock, reloads the document from disk, applies the change and persists the
//! result before the lock is released.

use crate::error::IpamError;
use crate::Result;
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Name of the lock file inside every store directory.
pub const LOCK_FILE: &str = "lock";

/// Held advisory lock on a store directory. Released on drop.
pub struct StoreLock {
    _flock: Flock<File>,
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock").finish_non_exhaustive()
    }
}

/// Handle to a single JSON document on disk.
#[derive(Debug)]
pub struct Store<T> {
    dir: PathBuf,
    path: PathBuf,
    lock_path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Opens the document `<dir>/<name>.json`, creating `dir` and its lock
    /// file when they are missing.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| IpamError::io(&dir, e))?;

        let lock_path = dir.join(LOCK_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)
            .map_err(|e| IpamError::io(&lock_path, e))?;

        Ok(Self {
            path: dir.join(format!("{name}.json")),
            dir,
            lock_path,
            _doc: PhantomData,
        })
    }

    /// Path of the JSON document
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the document and its lock live in
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Blocks until the exclusive lock on the store directory is held.
    ///
    /// There is no timeout: the kernel drops the lock when the holding
    /// process exits.
    pub fn lock(&self) -> Result<StoreLock> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)
            .map_err(|e| IpamError::io(&self.lock_path, e))?;

        let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            IpamError::Lock {
                path: self.lock_path.clone(),
                source: errno,
            }
        })?;
        trace!("Locked {}", self.lock_path.display());
        Ok(StoreLock { _flock: flock })
    }

    /// Reads the document. A missing or empty file yields `T::default()`.
    ///
    /// Callers that intend to write back must hold the lock.
    pub fn load(&self) -> Result<T> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(IpamError::io(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|source| IpamError::Serialization {
            path: self.path.clone(),
            source,
        })
    }

    /// Replaces the document on disk.
    ///
    /// The new content is written to a temporary file, flushed and renamed
    /// over the old document so readers never observe a partial write.
    pub fn store(&self, doc: &T) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(doc).map_err(|source| IpamError::Serialization {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| IpamError::io(&tmp, e))?;
        file.write_all(&encoded).map_err(|e| IpamError::io(&tmp, e))?;
        file.sync_all().map_err(|e| IpamError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| IpamError::io(&self.path, e))?;
        Ok(())
    }

    /// Lock, reload, mutate and persist.
    ///
    /// Nothing is written when `f` fails.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let _lock = self.lock()?;
        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        self.store(&doc)?;
        Ok(out)
    }

    /// Lock, reload and inspect without writing.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let _lock = self.lock()?;
        let doc = self.load()?;
        Ok(f(&doc))
    }

    /// Removes the store directory while holding its lock.
    pub fn destroy(self) -> Result<()> {
        let _lock = self.lock()?;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IpamError::io(&self.dir, e)),
        }
    }
}
