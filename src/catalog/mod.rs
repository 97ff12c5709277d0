//! Remote catalogs that media items and their content are fetched from.
//!
//! The catalog protocol itself is out of scope: a [`Catalog`] only needs to
//! resolve an id into a [`MediaItem`] and open a byte stream of its content.
//! Two catalogs are provided for use by the binary:
//!
//! * [`Local`] serves files below a library directory
//! * [`Http`] serves plain HTTP(S) URLs

mod http;
mod local;

pub use http::Http;
pub use local::Local;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{
    error::Result,
    item::{MediaItem, MediaKind},
};

/// Stream of content chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Remote catalog consumed by the download service.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolves `id` into its metadata.
    async fn fetch_metadata(&self, id: &str) -> Result<MediaItem>;

    /// Opens the content of `item` as a stream of chunks.
    async fn open_stream(&self, item: &MediaItem) -> Result<ByteStream>;
}

/// Maps a file name suffix onto a kind and MIME type.
fn classify(suffix: &str) -> Option<(MediaKind, &'static str)> {
    let class = match suffix.to_ascii_lowercase().as_str() {
        "mp3" => (MediaKind::Track, "audio/mpeg"),
        "flac" => (MediaKind::Track, "audio/flac"),
        "ogg" | "oga" | "opus" => (MediaKind::Track, "audio/ogg"),
        "m4a" | "aac" => (MediaKind::Track, "audio/mp4"),
        "wav" => (MediaKind::Track, "audio/wav"),
        "m4b" => (MediaKind::Podcast, "audio/mp4"),
        "mp4" | "m4v" => (MediaKind::Video, "video/mp4"),
        "mkv" => (MediaKind::Video, "video/x-matroska"),
        "webm" => (MediaKind::Video, "video/webm"),
        _ => return None,
    };
    Some(class)
}

/// Fills in kind, content type and suffix from a file name.
fn describe(item: &mut MediaItem, file_name: &str) {
    let Some((_, suffix)) = file_name.rsplit_once('.') else {
        return;
    };

    if let Some((kind, content_type)) = classify(suffix) {
        item.kind = kind;
        item.content_type = Some(content_type.to_owned());
    }
    item.suffix = Some(suffix.to_ascii_lowercase());
}
