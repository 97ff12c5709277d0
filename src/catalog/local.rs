use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

use super::{describe, ByteStream, Catalog};
use crate::{
    error::{Error, Result},
    item::{MediaItem, MediaKind},
};

/// Catalog of files below a library directory.
///
/// Ids are paths relative to the library root. Metadata is derived from the
/// file itself, and can be supplemented with a TOML sidecar next to it:
/// `Harmonies.mp3.toml` describes `Harmonies.mp3`.
#[derive(Clone, Debug)]
pub struct Local {
    root: PathBuf,
}

impl Local {
    const SIDECAR_SUFFIX: &'static str = "toml";

    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `id` below the library root, refusing to escape it.
    fn resolve(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::invalid_argument(format!(
                "{id} is not below the library root"
            )));
        }

        Ok(self.root.join(relative))
    }

    async fn sidecar(path: &Path) -> Result<Option<MediaItem>> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".");
        sidecar.push(Self::SIDECAR_SUFFIX);

        match tokio::fs::read_to_string(&sidecar).await {
            Ok(contents) => Ok(Some(toml::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Catalog for Local {
    async fn fetch_metadata(&self, id: &str) -> Result<MediaItem> {
        let path = self.resolve(id)?;
        let metadata = tokio::fs::metadata(&path).await?;

        let mut item = Self::sidecar(&path).await?.unwrap_or_default();
        item.id = id.to_owned();

        if item.title.is_empty() {
            item.title = path
                .file_stem()
                .map_or_else(|| id.to_owned(), |stem| stem.to_string_lossy().into_owned());
        }

        if item.parent.is_none() {
            item.parent = Path::new(id)
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(|parent| parent.to_string_lossy().into_owned());
        }

        if metadata.is_dir() {
            item.kind = MediaKind::Directory;
        } else {
            if item.suffix.is_none() {
                let file_name = path.file_name().unwrap_or_default().to_string_lossy();
                describe(&mut item, &file_name);
            }
            item.size = Some(metadata.len());
        }

        trace!("resolved {item}");
        Ok(item)
    }

    async fn open_stream(&self, item: &MediaItem) -> Result<ByteStream> {
        if !item.is_playable() {
            return Err(Error::invalid_argument(format!("{item} is a {}", item.kind)));
        }

        let path = self.resolve(&item.id)?;
        let file = tokio::fs::File::open(&path).await?;
        let stream = ReaderStream::new(file)
            .map_ok(|chunk| chunk.to_vec())
            .map_err(Error::from);

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn library() -> PathBuf {
        let root = std::env::temp_dir().join(format!("spool-local-{}", fastrand::u64(..)));
        tokio::fs::create_dir_all(root.join("album")).await.unwrap();
        tokio::fs::write(root.join("album/Harmonies.mp3"), b"ID3...")
            .await
            .unwrap();
        tokio::fs::write(
            root.join("album/Harmonies.mp3.toml"),
            "artist = \"The Dada Weatherman\"\nduration = 247\n",
        )
        .await
        .unwrap();
        root
    }

    #[tokio::test]
    async fn resolves_files_and_directories() {
        let root = library().await;
        let catalog = Local::new(&root);

        let item = catalog.fetch_metadata("album/Harmonies.mp3").await.unwrap();
        assert_eq!(item.title, "Harmonies");
        assert_eq!(item.artist.as_deref(), Some("The Dada Weatherman"));
        assert_eq!(item.duration, Duration::from_secs(247));
        assert_eq!(item.parent.as_deref(), Some("album"));
        assert_eq!(item.content_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(item.size, Some(6));

        let dir = catalog.fetch_metadata("album").await.unwrap();
        assert_eq!(dir.kind, MediaKind::Directory);
        assert!(catalog.open_stream(&dir).await.is_err());

        let bytes: Vec<Vec<u8>> = catalog
            .open_stream(&item)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(bytes.concat(), b"ID3...");

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn refuses_to_escape_the_root() {
        let catalog = Local::new(std::env::temp_dir());
        let err = catalog.fetch_metadata("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
        assert!(catalog.fetch_metadata("/etc/passwd").await.is_err());
    }
}
