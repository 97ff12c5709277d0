//! Local storage for downloaded content.
//!
//! Storage is an external collaborator: the orchestrator only ever writes a
//! complete download under the item id and deletes it again through the
//! returned [`StorageHandle`]. Two implementations are provided:
//!
//! * [`Fs`] stores content in a cache directory, writing through a temporary
//!   file so that a reader never observes a partial download. Rewriting an
//!   id replaces its content atomically.
//! * [`Memory`] keeps content in memory for the lifetime of the session

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use url::form_urlencoded;

use crate::error::Result;

/// Opaque reference to content written to storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StorageHandle {
    key: String,
    location: String,
    len: u64,
}

impl StorageHandle {
    #[must_use]
    pub fn new(key: impl Into<String>, location: impl Into<String>, len: u64) -> Self {
        Self {
            key: key.into(),
            location: location.into(),
            len,
        }
    }

    /// The id the content was written under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Implementation specific location, such as a file path.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Number of bytes stored.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.location, self.len)
    }
}

/// Local storage consumed by the download coordinator.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores `bytes` under `id`, replacing whatever was stored before.
    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<StorageHandle>;

    /// Removes previously written content. Deleting content that no longer
    /// exists is not an error.
    async fn delete(&self, handle: &StorageHandle) -> Result<()>;
}

/// Cache directory on the local file system.
#[derive(Clone, Debug)]
pub struct Fs {
    root: PathBuf,
}

impl Fs {
    /// Separates the file name from the random suffix of a file that is
    /// still being written. Never part of an encoded file name.
    const PARTIAL_MARKER: char = '~';

    /// Creates the storage, creating `root` when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!("caching downloads in {}", root.display());
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an item id onto a file name. Ids may be paths or URLs, so they
    /// are percent-encoded; distinct ids never share a file.
    fn file_name(id: &str) -> String {
        let name: String = form_urlencoded::byte_serialize(id.as_bytes()).collect();

        // `.` and `..` survive encoding but are not valid file names. A bare
        // `%` cannot come out of the encoder.
        if name.trim_matches('.').is_empty() {
            format!("%{name}")
        } else {
            name
        }
    }

    /// Unique name for a file being written, so that concurrent writes of
    /// the same id do not clobber each other.
    fn partial_name(name: &str) -> String {
        format!("{name}{}{:016x}", Self::PARTIAL_MARKER, fastrand::u64(..))
    }
}

#[async_trait]
impl Storage for Fs {
    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<StorageHandle> {
        let name = Self::file_name(id);
        let path = self.root.join(&name);
        let partial = self.root.join(Self::partial_name(&name));
        let len = bytes.len() as u64;

        trace!("writing {len} bytes to {}", partial.display());
        if let Err(e) = tokio::fs::write(&partial, bytes).await {
            // Best effort: the partial file is garbage either way.
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        Ok(StorageHandle::new(id, path.to_string_lossy(), len))
    }

    async fn delete(&self, handle: &StorageHandle) -> Result<()> {
        match tokio::fs::remove_file(handle.location()).await {
            Ok(()) => {
                trace!("deleted {handle}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory session cache.
#[derive(Debug, Default)]
pub struct Memory {
    content: Mutex<HashMap<String, Vec<u8>>>,
}

impl Memory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the content stored under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for Memory {
    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<StorageHandle> {
        let len = bytes.len() as u64;
        self.content.lock()?.insert(id.to_owned(), bytes);
        Ok(StorageHandle::new(id, format!("memory:{id}"), len))
    }

    async fn delete(&self, handle: &StorageHandle) -> Result<()> {
        self.content.lock()?.remove(handle.key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn file_names_are_encoded() {
        assert_eq!(Fs::file_name("466"), "466");
        assert_eq!(
            Fs::file_name("https://example.com/a b.mp3"),
            "https%3A%2F%2Fexample.com%2Fa+b.mp3"
        );
        assert_eq!(Fs::file_name("../etc/passwd"), "..%2Fetc%2Fpasswd");
        assert_eq!(Fs::file_name(".."), "%..");

        // Distinct ids that a lossy mapping would merge.
        assert_ne!(Fs::file_name("album/x.mp3"), Fs::file_name("album_x.mp3"));
        assert_ne!(Fs::file_name("a b"), Fs::file_name("a+b"));
        assert_ne!(Fs::file_name(".."), Fs::file_name("%.."));
    }

    #[tokio::test]
    async fn memory_round_trip() {
        let storage = Memory::new();
        let handle = storage.write("466", vec![1, 2, 3]).await.unwrap();

        assert_eq!(handle.key(), "466");
        assert_eq!(handle.len(), 3);
        assert_eq!(storage.get("466"), Some(vec![1, 2, 3]));

        storage.delete(&handle).await.unwrap();
        assert!(storage.is_empty());

        // Deleting twice is fine.
        storage.delete(&handle).await.unwrap();
    }

    async fn temp_fs() -> Fs {
        let root = std::env::temp_dir().join(format!("spool-fs-{}", fastrand::u64(..)));
        Fs::new(root).await.unwrap()
    }

    async fn files(root: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(root).await.unwrap();
        while let Some(entry) = dir.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn fs_writes_complete_files_only() {
        let storage = temp_fs().await;

        let handle = storage.write("a/b", b"hello".to_vec()).await.unwrap();
        assert_eq!(tokio::fs::read(handle.location()).await.unwrap(), b"hello");
        assert_eq!(files(storage.root()).await, ["a%2Fb"]);

        storage.delete(&handle).await.unwrap();
        assert!(!Path::new(handle.location()).exists());

        let _ = tokio::fs::remove_dir_all(storage.root()).await;
    }

    #[tokio::test]
    async fn fs_keeps_similar_ids_apart() {
        let storage = temp_fs().await;

        let first = storage.write("album/x.mp3", b"first".to_vec()).await.unwrap();
        let second = storage.write("album_x.mp3", b"second".to_vec()).await.unwrap();
        assert_ne!(first.location(), second.location());

        storage.delete(&second).await.unwrap();
        assert_eq!(tokio::fs::read(first.location()).await.unwrap(), b"first");

        let _ = tokio::fs::remove_dir_all(storage.root()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fs_concurrent_writes_of_one_id_succeed() {
        let storage = Arc::new(temp_fs().await);
        let content = vec![7u8; 4 << 20];

        for _ in 0..10 {
            let writes = [(); 2].map(|()| {
                let storage = Arc::clone(&storage);
                let content = content.clone();
                tokio::spawn(async move { storage.write("466", content).await })
            });

            for write in writes {
                let handle = write.await.unwrap().unwrap();
                assert_eq!(handle.len(), content.len() as u64);
            }
        }

        assert_eq!(files(storage.root()).await, ["466"]);
        let _ = tokio::fs::remove_dir_all(storage.root()).await;
    }
}
