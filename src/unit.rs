//! Download units: one queued media item and its download lifecycle.
//!
//! A [`DownloadUnit`] moves through these states:
//!
//! ```text
//! Pending ──> Downloading ──> Completed
//!    ^             │
//!    └── Failed <──┘
//!
//! any non-terminal state ──> Cancelled
//! ```
//!
//! `Completed` and `Cancelled` are terminal. A unit that keeps failing stays
//! `Failed` once its retries are exhausted. A fetch interrupted by the
//! coordinator shutting down hands its unit back as `Pending`.
//!
//! State changes are published through a `watch` channel, so callers can
//! await a state instead of polling for it:
//!
//! ```rust,no_run
//! # async fn example(unit: std::sync::Arc<spool::unit::DownloadUnit>) {
//! use spool::unit::State;
//!
//! let state = unit.wait_until(|state| state.is_terminal()).await;
//! println!("{unit} finished as {state}");
//! # }
//! ```

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{item::MediaItem, storage::StorageHandle};

/// Download state of a unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum State {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl State {
    /// Whether no further transitions can happen.
    ///
    /// `Failed` is not terminal: the unit may still be retried.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Identifier of a unit, unique for the lifetime of a queue.
///
/// Identifiers are handed out in increasing order as units are enqueued, so
/// they double as enqueue timestamps when ordering by recency.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Record of the most recent fetch failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// Human readable cause of the last failure.
    pub cause: String,

    /// Number of failed attempts so far.
    pub attempts: u32,

    /// Whether retries are exhausted. An exhausted unit stays in the queue
    /// but cannot be played.
    pub exhausted: bool,
}

/// A media item admitted to the playback queue.
pub struct DownloadUnit {
    id: UnitId,
    item: Arc<MediaItem>,
    save: bool,
    state: watch::Sender<State>,
    storage: Mutex<Option<StorageHandle>>,
    failure: Mutex<Option<Failure>>,
    cancel: CancellationToken,
}

impl DownloadUnit {
    pub(crate) fn new(id: UnitId, item: Arc<MediaItem>, save: bool) -> Self {
        let (state, _) = watch::channel(State::Pending);
        Self {
            id,
            item,
            save,
            state,
            storage: Mutex::new(None),
            failure: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    #[must_use]
    pub fn item(&self) -> &Arc<MediaItem> {
        &self.item
    }

    /// Whether the content should be kept after the unit leaves the queue.
    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.save
    }

    #[must_use]
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == State::Completed
    }

    /// Whether the unit failed and will not be retried anymore.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.failure().is_some_and(|failure| failure.exhausted)
    }

    /// Handle to the downloaded content, present once completed.
    #[must_use]
    pub fn storage(&self) -> Option<StorageHandle> {
        self.storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn failure(&self) -> Option<Failure> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Waits until the state satisfies `predicate` and returns that state.
    pub async fn wait_until(&self, predicate: impl FnMut(&State) -> bool) -> State {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let state = match rx.wait_for(predicate).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Atomically claims the unit for fetching: `Pending` becomes
    /// `Downloading`. Returns `false` if the unit was not pending.
    pub(crate) fn claim(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == State::Pending {
                *state = State::Downloading;
                true
            } else {
                false
            }
        })
    }

    /// Stores the handle and moves to `Completed`. Ignored for units that
    /// already reached a terminal state.
    pub(crate) fn complete(&self, handle: StorageHandle) -> bool {
        if self.state().is_terminal() {
            return false;
        }

        *self.storage.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.transition(State::Completed)
    }

    /// Records a failed attempt and moves to `Failed`. Returns the number of
    /// attempts so far.
    pub(crate) fn fail(&self, cause: String, exhausted: bool) -> u32 {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        let attempts = failure.as_ref().map_or(0, |failure| failure.attempts) + 1;
        *failure = Some(Failure {
            cause,
            attempts,
            exhausted,
        });
        drop(failure);

        self.transition(State::Failed);
        attempts
    }

    /// Number of failed attempts so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.failure().map_or(0, |failure| failure.attempts)
    }

    /// Moves a failed unit back to `Pending` for another attempt.
    pub(crate) fn retry(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == State::Failed {
                *state = State::Pending;
                true
            } else {
                false
            }
        })
    }

    /// Signals any worker fetching this unit to abort.
    pub(crate) fn request_cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Hands a unit whose fetch was interrupted back: `Downloading` becomes
    /// `Pending`.
    pub(crate) fn release(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == State::Downloading {
                *state = State::Pending;
                true
            } else {
                false
            }
        })
    }

    /// Moves to `Cancelled` unless already terminal.
    pub(crate) fn cancelled(&self) -> bool {
        self.transition(State::Cancelled)
    }

    fn transition(&self, next: State) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                trace!("unit {} {}: {state} -> {next}", self.id, self.item.id);
                *state = next;
                true
            }
        })
    }
}

impl fmt::Debug for DownloadUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadUnit")
            .field("id", &self.id)
            .field("item", &self.item.id)
            .field("state", &self.state())
            .field("save", &self.save)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for DownloadUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.item)
    }
}
