//! Playback engine interface.
//!
//! Decoding and rendering are out of scope for this crate: the controller
//! hands the storage handle of a completed download to an [`Engine`] and
//! drives it with transport calls. The engine reports back through an
//! [`EngineNotifier`]:
//!
//! * [`EngineNotifier::finished`] when a unit played to its natural end,
//!   which advances the queue
//! * [`EngineNotifier::failed`] when playback broke down asynchronously
//!
//! [`Headless`] is an engine without audio output. It keeps a clock-driven
//! play head, which is enough to run the queue end to end.

use std::{
    sync::{Mutex, OnceLock, PoisonError},
    time::Duration,
};

use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle, time::Instant};

use crate::{
    error::{Error, Result},
    item::MediaItem,
    service::Message,
    storage::StorageHandle,
};

/// Media playback engine consumed by the controller.
///
/// Calls are made while the control plane is locked, so implementations must
/// not block for long and must not call back into the service synchronously.
pub trait Engine: Send + Sync {
    /// Gives the engine the notifier to report completion and failures on.
    /// Called once when the service is constructed.
    fn attach(&self, notifier: EngineNotifier);

    /// Loads content, replacing whatever was loaded before. Playback starts
    /// paused at position zero.
    fn load(&self, handle: &StorageHandle, item: &MediaItem) -> Result<()>;

    fn play(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;

    /// Stops playback and unloads the content.
    fn stop(&self) -> Result<()>;

    fn seek(&self, position: Duration) -> Result<()>;

    /// Play head of the loaded content; zero when nothing is loaded.
    fn position(&self) -> Duration;

    /// Length of the loaded content; zero when nothing is loaded or unknown.
    fn duration(&self) -> Duration;
}

/// Channel for an engine to report back to the service.
#[derive(Clone, Debug)]
pub struct EngineNotifier {
    tx: mpsc::UnboundedSender<Message>,
}

impl EngineNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    /// Reports that the content behind `handle` played to its end.
    pub fn finished(&self, handle: &StorageHandle) {
        if self.tx.send(Message::Finished(handle.clone())).is_err() {
            trace!("service gone, dropping completion of {handle}");
        }
    }

    /// Reports that playback failed.
    pub fn failed(&self, cause: impl Into<String>) {
        let cause = cause.into();
        if self.tx.send(Message::EngineFailed(cause)).is_err() {
            trace!("service gone, dropping engine failure");
        }
    }
}

#[derive(Debug, Default)]
struct PlayHead {
    loaded: Option<StorageHandle>,
    duration: Duration,
    offset: Duration,
    since: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl PlayHead {
    fn position(&self) -> Duration {
        let elapsed = self.since.map_or(Duration::ZERO, |since| since.elapsed());
        (self.offset + elapsed).min(self.duration)
    }

    fn halt(&mut self) {
        self.offset = self.position();
        self.since = None;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Engine without audio output.
///
/// Time passes for the loaded content while playing, and completion is
/// reported once the play head reaches the duration of the item.
#[derive(Debug)]
pub struct Headless {
    head: Mutex<PlayHead>,
    notifier: OnceLock<EngineNotifier>,
    runtime: Handle,
}

impl Headless {
    /// Creates the engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside of a tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::failed_precondition(e.to_string()))?;
        Ok(Self {
            head: Mutex::new(PlayHead::default()),
            notifier: OnceLock::new(),
            runtime,
        })
    }

    fn head(&self) -> std::sync::MutexGuard<'_, PlayHead> {
        self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_completion(&self, head: &mut PlayHead) {
        let (Some(handle), Some(notifier)) = (head.loaded.clone(), self.notifier.get().cloned())
        else {
            return;
        };

        let remaining = head.duration.saturating_sub(head.position());
        head.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(remaining).await;
            notifier.finished(&handle);
        }));
    }
}

impl Engine for Headless {
    fn attach(&self, notifier: EngineNotifier) {
        if self.notifier.set(notifier).is_err() {
            warn!("headless engine is already attached");
        }
    }

    fn load(&self, handle: &StorageHandle, item: &MediaItem) -> Result<()> {
        let mut head = self.head();
        head.halt();

        if item.duration.is_zero() {
            warn!("duration of {item} is unknown, it will finish immediately");
        }

        debug!("loading {handle}");
        *head = PlayHead {
            loaded: Some(handle.clone()),
            duration: item.duration,
            ..PlayHead::default()
        };
        Ok(())
    }

    fn play(&self) -> Result<()> {
        let mut head = self.head();
        if head.loaded.is_none() {
            return Err(Error::failed_precondition("nothing loaded"));
        }

        if head.since.is_none() {
            head.since = Some(Instant::now());
            self.schedule_completion(&mut head);
        }
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.head().halt();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut head = self.head();
        head.halt();
        *head = PlayHead::default();
        Ok(())
    }

    fn seek(&self, position: Duration) -> Result<()> {
        let mut head = self.head();
        if head.loaded.is_none() {
            return Err(Error::failed_precondition("nothing loaded"));
        }

        let playing = head.since.is_some();
        head.halt();
        head.offset = position.min(head.duration);
        if playing {
            head.since = Some(Instant::now());
            self.schedule_completion(&mut head);
        }
        Ok(())
    }

    fn position(&self) -> Duration {
        self.head().position()
    }

    fn duration(&self) -> Duration {
        self.head().duration
    }
}
