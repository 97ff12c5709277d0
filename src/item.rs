//! Media items as supplied by a catalog.
//!
//! A [`MediaItem`] describes one entry of a remote catalog: a track, podcast
//! episode, video or a directory containing those. Items are immutable once
//! fetched and are shared as `Arc<MediaItem>` between the catalog, the queue
//! and any caller holding on to them.
//!
//! Two items describe the same logical track if and only if their ids are
//! equal, regardless of any other metadata.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

/// Kind of a catalog entry.
///
/// Only non-directory kinds can be played or downloaded.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// A container of other entries, such as an album or a folder.
    Directory,

    /// A music track.
    #[default]
    Track,

    /// A podcast episode.
    Podcast,

    /// A video.
    Video,
}

impl MediaKind {
    /// Whether entries of this kind can be enqueued for playback.
    #[must_use]
    pub fn is_playable(self) -> bool {
        match self {
            Self::Directory => false,
            Self::Track | Self::Podcast | Self::Video => true,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory => write!(f, "directory"),
            Self::Track => write!(f, "track"),
            Self::Podcast => write!(f, "podcast"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Description of a playable or downloadable catalog entry.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaItem {
    /// Catalog-wide unique identifier.
    pub id: String,

    /// Identifier of the containing directory, if any.
    pub parent: Option<String>,

    /// Identifier of the directory containing the parent, if any.
    pub grandparent: Option<String>,

    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_id: Option<String>,
    pub artist_id: Option<String>,
    pub genre: Option<String>,

    /// Playback length. Zero when unknown.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration: Duration,

    /// Size of the content in bytes, if known up front.
    pub size: Option<u64>,

    /// MIME type, for example `audio/mpeg`.
    pub content_type: Option<String>,

    /// File name suffix, for example `mp3`.
    pub suffix: Option<String>,

    /// Bit rate in kbps, if known.
    pub bit_rate: Option<u32>,

    pub kind: MediaKind,
    pub starred: bool,
}

impl MediaItem {
    /// Creates a track with the given `id` and `title` and no further
    /// metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn is_playable(&self) -> bool {
        self.kind.is_playable()
    }
}

/// Items are the same logical track when their ids match.
impl PartialEq for MediaItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MediaItem {}

impl std::hash::Hash for MediaItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for MediaItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.artist {
            Some(artist) => write!(f, "{}: \"{} - {}\"", self.id, artist, self.title),
            None => write!(f, "{}: \"{}\"", self.id, self.title),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_id() {
        let a = MediaItem::new("466", "Harmonies").with_duration(Duration::from_secs(247));
        let b = MediaItem::new("466", "Harmonies (remaster)");
        let c = MediaItem::new("467", "Harmonies");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn directories_are_not_playable() {
        let dir = MediaItem::new("433", "Itchy Hitchhiker").with_kind(MediaKind::Directory);
        assert!(!dir.is_playable());
        assert!(MediaItem::new("466", "Harmonies").is_playable());
    }

    #[test]
    fn deserializes_with_defaults() {
        let item: MediaItem = toml::from_str(
            r#"
            id = "466"
            title = "Harmonies"
            artist = "The Dada Weatherman"
            duration = 247
            kind = "podcast"
            "#,
        )
        .unwrap();

        assert_eq!(item.duration, Duration::from_secs(247));
        assert_eq!(item.kind, MediaKind::Podcast);
        assert_eq!(item.size, None);
        assert_eq!(item.to_string(), "466: \"The Dada Weatherman - Harmonies\"");
    }
}
