use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncWrite},
};

pub type AssetReader = Box<dyn AsyncRead + Send + Unpin>;
pub type AssetWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte-addressable file store the device serves from and writes into.
///
/// Paths are device-style absolute strings such as `/index.html`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, path: &str) -> bool;

    async fn open_read(&self, path: &str) -> io::Result<AssetReader>;

    /// Opens `path` for writing, truncating any existing content.
    async fn open_write(&self, path: &str) -> io::Result<AssetWriter>;
}

fn invalid_path(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid storage path {path:?}"),
    )
}

/// Storage backed by a directory on the host filesystem.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create storage root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a device path onto the root. Traversal segments never resolve.
    fn host_path(&self, path: &str) -> Option<PathBuf> {
        let mut host = self.root.clone();
        let mut named = false;
        for segment in path.split('/') {
            match segment {
                "" => continue,
                "." | ".." => return None,
                s if s.contains('\\') => return None,
                s => {
                    host.push(s);
                    named = true;
                }
            }
        }
        named.then_some(host)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn exists(&self, path: &str) -> bool {
        let Some(host) = self.host_path(path) else {
            return false;
        };
        fs::metadata(&host)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    async fn open_read(&self, path: &str) -> io::Result<AssetReader> {
        let host = self.host_path(path).ok_or_else(|| invalid_path(path))?;
        let file = File::open(&host).await?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> io::Result<AssetWriter> {
        let host = self.host_path(path).ok_or_else(|| invalid_path(path))?;
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&host)
            .await?;
        Ok(Box::new(file))
    }
}

#[derive(Default)]
struct MemoryInner {
    files: HashMap<String, Vec<u8>>,
    capacity: Option<usize>,
    faulty_reads: HashSet<String>,
}

impl MemoryInner {
    fn room(&self) -> usize {
        match self.capacity {
            Some(cap) => cap.saturating_sub(self.files.values().map(Vec::len).sum()),
            None => usize::MAX,
        }
    }
}

/// In-memory storage for tests and demos.
///
/// A byte capacity makes writes come up short once the store is full, and
/// paths registered with [`MemoryStorage::fail_reads`] exist but refuse to open.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        let storage = Self::default();
        storage.lock().capacity = Some(bytes);
        storage
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.lock().files.insert(path.into(), bytes.into());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn fail_reads(&self, path: impl Into<String>) {
        self.lock().faulty_reads.insert(path.into());
    }
}

struct MemoryWriter {
    inner: Arc<Mutex<MemoryInner>>,
    path: String,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let accepted = buf.len().min(inner.room());
        inner
            .files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(&buf[..accepted]);
        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, path: &str) -> bool {
        self.contains(path)
    }

    async fn open_read(&self, path: &str) -> io::Result<AssetReader> {
        let inner = self.lock();
        if inner.faulty_reads.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("read fault injected for {path}"),
            ));
        }
        let bytes = inner
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    async fn open_write(&self, path: &str) -> io::Result<AssetWriter> {
        if path.is_empty() || path.ends_with('/') {
            return Err(invalid_path(path));
        }
        self.lock().files.insert(path.to_string(), Vec::new());
        Ok(Box::new(MemoryWriter {
            inner: self.inner.clone(),
            path: path.to_string(),
        }))
    }
}
