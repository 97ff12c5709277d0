//! Events emitted by the download service.
//!
//! Events report significant state changes of the queue, its downloads and
//! playback. Subscribe with [`DownloadService::subscribe`] to receive them.
//!
//! # Example
//!
//! ```rust
//! use spool::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::TrackChanged(id) => println!("Now playing unit {id}"),
//!         Event::DownloadFailed(id) => println!("Giving up on unit {id}"),
//!         // ... handle other events ...
//!         _ => {}
//!     }
//! }
//! ```
//!
//! [`DownloadService::subscribe`]: crate::service::DownloadService::subscribe

use crate::unit::UnitId;

/// Events that can be emitted by the download service.
///
/// Events fall into two categories:
///
/// Playback events:
/// * [`Play`](Self::Play), [`Pause`](Self::Pause) and [`Stop`](Self::Stop)
/// * [`TrackChanged`](Self::TrackChanged) - Current unit changes
/// * [`QueueFinished`](Self::QueueFinished) - Last unit played to its end
/// * [`EngineFailed`](Self::EngineFailed) - Playback broke down
///
/// Download events:
/// * [`QueueChanged`](Self::QueueChanged) - Units were added or removed
/// * [`DownloadComplete`](Self::DownloadComplete) - Unit is ready to play
/// * [`DownloadFailed`](Self::DownloadFailed) - Unit's retries are exhausted
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Playback has started.
    Play,

    /// Playback has paused.
    Pause,

    /// Playback has stopped. Also emitted when the unit being played is
    /// removed from the queue.
    Stop,

    /// The current unit has changed.
    ///
    /// Emitted when moving to a different unit, whether through navigation,
    /// autoplay selection or natural progression.
    TrackChanged(UnitId),

    /// Units were enqueued or removed.
    QueueChanged,

    /// A unit finished downloading.
    DownloadComplete(UnitId),

    /// A unit failed to download and will not be retried.
    DownloadFailed(UnitId),

    /// The last unit of the queue played to its end.
    QueueFinished,

    /// The engine failed. The cause is available through
    /// [`DownloadService::player_error`](crate::service::DownloadService::player_error).
    EngineFailed,
}
