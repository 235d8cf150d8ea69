//! Blob storage for picture bytes.
//!
//! The engines only see the [`BlobStore`] trait: bytes go in, a retrievable
//! URL comes out. [`FsBlobStore`] keeps files in a local directory;
//! [`MemoryBlobStore`] keeps them in memory and can be told to fail.

use crate::id::content_digest;
use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const FILE_URL_PREFIX: &str = "file://";
const MEMORY_URL_PREFIX: &str = "mem://";

/// Errors from blob store operations.
#[derive(Debug)]
pub enum BlobError {
    /// Underlying I/O failed.
    Io(std::io::Error),
    /// The URL does not belong to this store.
    ForeignUrl(String),
    /// The store refused or could not complete the request.
    Unavailable(String),
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::Io(e) => write!(f, "blob I/O error: {}", e),
            BlobError::ForeignUrl(url) => write!(f, "url not managed by this blob store: {}", url),
            BlobError::Unavailable(msg) => write!(f, "blob store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e)
    }
}

/// External content storage returning retrievable URLs.
pub trait BlobStore: Send + Sync {
    /// Store bytes and return a URL they can be fetched from.
    fn put(&self, bytes: &[u8], content_type: &str) -> Result<String, BlobError>;

    /// Delete the blob behind `url`. Deleting a missing blob succeeds.
    fn delete(&self, url: &str) -> Result<(), BlobError>;
}

/// Blob store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map a URL back to a file inside this store's directory.
    fn path_for(&self, url: &str) -> Result<PathBuf, BlobError> {
        let path = url
            .strip_prefix(FILE_URL_PREFIX)
            .map(PathBuf::from)
            .ok_or_else(|| BlobError::ForeignUrl(url.to_string()))?;

        // Only plain file names directly under our directory
        let name = path
            .file_name()
            .ok_or_else(|| BlobError::ForeignUrl(url.to_string()))?;
        if path.parent() != Some(self.dir.as_path()) {
            return Err(BlobError::ForeignUrl(url.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.to_ascii_lowercase().as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, bytes: &[u8], content_type: &str) -> Result<String, BlobError> {
        // Digest prefix plus entropy: identical uploads must not share a file
        let digest = content_digest(bytes);
        let suffix: u32 = rand::rng().random();
        let name = format!("{}-{:08x}.{}", &digest[..32], suffix, extension_for(content_type));

        let tmp_path = self.dir.join(format!(".{}.tmp", name));
        let final_path = self.dir.join(&name);

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;

        log::debug!("Stored blob {} ({} bytes)", final_path.display(), bytes.len());
        Ok(format!("{}{}", FILE_URL_PREFIX, final_path.display()))
    }

    fn delete(&self, url: &str) -> Result<(), BlobError> {
        let path = self.path_for(url)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Deleted blob {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}

/// In-memory blob store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    next: AtomicU64,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent `delete` fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Relaxed);
    }

    pub fn contains(&self, url: &str) -> bool {
        self.lock().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A panic while holding the lock cannot leave the map half-written
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: &[u8], content_type: &str) -> Result<String, BlobError> {
        if self.fail_puts.load(Ordering::Relaxed) {
            return Err(BlobError::Unavailable("put rejected".to_string()));
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let url = format!("{}{}.{}", MEMORY_URL_PREFIX, n, extension_for(content_type));
        self.lock().insert(url.clone(), bytes.to_vec());
        Ok(url)
    }

    fn delete(&self, url: &str) -> Result<(), BlobError> {
        if self.fail_deletes.load(Ordering::Relaxed) {
            return Err(BlobError::Unavailable("delete rejected".to_string()));
        }
        if !url.starts_with(MEMORY_URL_PREFIX) {
            return Err(BlobError::ForeignUrl(url.to_string()));
        }
        self.lock().remove(url);
        Ok(())
    }
}
