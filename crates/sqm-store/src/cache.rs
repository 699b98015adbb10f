//! Lock-arbitrated key/blob cache.
//!
//! A cache root is a directory shared by every process serving the same data.
//! Exactly one process at a time holds an exclusive advisory lock on the
//! sentinel file [`LOCK_FILE_NAME`]; that process may write, everyone else
//! reads. Failing to get the lock is never an error: the process simply
//! degrades to read-only.
//!
//! Each logical cache (one per station and purpose) is a subdirectory of the
//! root, and each key is one JSON blob inside it.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs4::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Name of the lock sentinel inside a cache root.
pub const LOCK_FILE_NAME: &str = ".sqm_cache_lock";

/// A cache root directory and this process's access to it.
#[derive(Debug)]
pub struct CacheRoot {
    root: PathBuf,
    /// Held for the lifetime of the root; dropping it releases the lock.
    lock: Option<File>,
    read_only: bool,
}

impl CacheRoot {
    /// Open a cache root, trying to become its writer.
    ///
    /// With `blocking` the call waits until the lock is free, which is what
    /// maintenance jobs want. Otherwise a single attempt is made and a busy lock
    /// leaves the process read-only. `read_only` skips the lock entirely.
    pub fn initialize<P: AsRef<Path>>(root: P, blocking: bool, read_only: bool) -> Self {
        let root = root.as_ref().to_path_buf();
        let lock = if read_only {
            None
        } else {
            acquire_lock(&root, blocking)
        };
        let read_only = lock.is_none();
        if read_only {
            debug!("Cache at {} opened read-only", root.display());
        }
        Self {
            root,
            lock,
            read_only,
        }
    }

    /// Root directory of the cache.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Returns true unless this process holds the write lock.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Open the logical cache `id`.
    ///
    /// The cache is writable only when this process holds the lock.
    pub fn create(&self, id: &str) -> Cache {
        let dir = self.root.join(escape_key(id));
        let writable = !self.read_only;
        if writable {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!("Failed to create cache directory {}: {}", dir.display(), e);
            }
        }
        Cache { dir, writable }
    }

    /// Delete everything under the root except the lock sentinel.
    ///
    /// Only the lock holder may clear; for anyone else this is a logged no-op.
    pub fn clear(&self) -> Result<()> {
        if self.read_only || self.lock.is_none() {
            warn!(
                "Refusing to clear cache at {}: write lock not held",
                self.root.display()
            );
            return Ok(());
        }

        info!("Clearing cache at {}", self.root.display());
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name() == LOCK_FILE_NAME {
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|source| Error::Remove { path, source })?;
        }
        Ok(())
    }
}

fn acquire_lock(root: &Path, blocking: bool) -> Option<File> {
    if let Err(e) = fs::create_dir_all(root) {
        warn!("Failed to create cache root {}: {}", root.display(), e);
        return None;
    }

    let path = root.join(LOCK_FILE_NAME);
    let file = match OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open cache lock {}: {}", path.display(), e);
            return None;
        }
    };

    let locked = if blocking {
        file.lock_exclusive()
    } else {
        file.try_lock_exclusive()
    };
    match locked {
        Ok(()) => {
            info!("Acquired cache write lock at {}", path.display());
            Some(file)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            debug!("Cache lock {} held by another process", path.display());
            None
        }
        Err(e) => {
            warn!("Failed to lock {}: {}", path.display(), e);
            None
        }
    }
}

/// One logical cache: a directory of JSON blobs keyed by string.
#[derive(Debug, Clone)]
pub struct Cache {
    dir: PathBuf,
    writable: bool,
}

impl Cache {
    /// Returns true if saves and removals take effect.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Directory holding this cache's blobs.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(escape_key(key))
    }

    /// Load the blob stored under `key`.
    ///
    /// A missing entry and an unreadable or corrupt one both come back as `None`;
    /// corruption is logged so the next save can replace it.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read cache entry {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring corrupt cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Store `value` under `key`.
    ///
    /// The blob is written to a temporary file and renamed into place, so
    /// readers never see a partial entry. Does nothing on a read-only cache.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|source| Error::CreateDirectory {
                path: self.dir.clone(),
                source,
            })?;
        }

        let bytes = serde_json::to_vec(value)?;
        let path = self.entry_path(key);
        let tmp = self.dir.join(format!(".{}.tmp", escape_key(key)));
        fs::write(&tmp, bytes).map_err(|source| Error::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| Error::Write { path, source })
    }

    /// Delete the entry under `key`. Does nothing on a read-only cache.
    pub fn remove(&self, key: &str) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Remove { path, source }),
        }
    }

    /// Returns true if an entry exists under `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.entry_path(key).is_file()
    }

    /// Modification time of the entry under `key`.
    pub fn modified(&self, key: &str) -> Option<SystemTime> {
        fs::metadata(self.entry_path(key))
            .and_then(|m| m.modified())
            .ok()
    }

    /// Every key currently stored, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .map(|name| unescape_key(&name))
            .collect()
    }
}

/// Map a key to a single flat file name.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, c) in key.chars().enumerate() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            '.' if i == 0 => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3);
        let decoded = match code {
            Some("25") => Some('%'),
            Some("2F") => Some('/'),
            Some("5C") => Some('\\'),
            Some("2E") => Some('.'),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[pos + 3..];
            }
            None => {
                out.push('%');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}
