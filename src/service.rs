//! The download service: queue, downloads and playback behind one façade.
//!
//! [`DownloadService`] owns the control plane: the playback queue, the
//! playback controller and the download coordinator live behind a single
//! lock, so every cursor move and state change is observed in order.
//! Background activity never touches that state directly. Fetch workers,
//! retry timers and the engine report through a channel to a control loop,
//! which applies their messages under the same lock.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use spool::{
//!     catalog::Local,
//!     config::Config,
//!     engine::Headless,
//!     service::{DownloadService, Options},
//!     storage::Memory,
//! };
//!
//! # async fn example() -> spool::error::Result<()> {
//! let service = DownloadService::new(
//!     Config::default(),
//!     Arc::new(Local::new("/srv/music")),
//!     Arc::new(Memory::new()),
//!     Arc::new(Headless::new()?),
//! )?;
//!
//! let options = Options {
//!     autoplay: true,
//!     ..Options::default()
//! };
//! service.download_ids(["album/Harmonies.mp3"], options).await?;
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    catalog::Catalog,
    config::Config,
    controller::{Controller, PlayerState, RepeatMode},
    coordinator::{Coordinator, Outcome},
    engine::{Engine, EngineNotifier},
    error::{Error, Result},
    events::Event,
    item::MediaItem,
    queue::{InsertAt, PlaybackQueue},
    storage::{Storage, StorageHandle},
    unit::{DownloadUnit, UnitId},
};

/// Messages applied by the control loop.
#[derive(Debug)]
pub(crate) enum Message {
    /// A fetch worker finished, successfully or not.
    Fetched {
        unit: Arc<DownloadUnit>,
        result: Result<StorageHandle>,
    },

    /// The backoff of a failed unit elapsed.
    Retry(Arc<DownloadUnit>),

    /// The engine played the content to its end.
    Finished(StorageHandle),

    /// The engine failed asynchronously.
    EngineFailed(String),
}

/// How to enqueue a batch of items.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Options {
    /// Keep the content after the unit leaves the queue.
    pub save: bool,

    /// Start playing the target unit as soon as it is downloaded.
    pub autoplay: bool,

    /// Insert after the current unit instead of at the end.
    pub play_next: bool,

    /// Shuffle the batch before enqueuing it.
    pub shuffle: bool,

    /// Index within the batch of the unit to select.
    pub start_index: usize,

    /// Position to start the selected unit at.
    pub start_position: Duration,
}

struct Core {
    queue: PlaybackQueue,
    controller: Controller,
    coordinator: Coordinator,
    events: broadcast::Sender<Event>,
}

impl Core {
    fn apply(&mut self, message: Message) {
        match message {
            Message::Fetched { unit, result } => {
                match self.coordinator.finish(&unit, result, &self.queue) {
                    Outcome::Completed => {
                        self.emit(Event::DownloadComplete(unit.id()));
                        self.controller.on_unit_completed(&unit);
                    }
                    Outcome::Exhausted => {
                        self.emit(Event::DownloadFailed(unit.id()));
                        self.controller.on_unit_exhausted(&unit);
                    }
                    Outcome::Cancelled | Outcome::Halted | Outcome::Retrying => {}
                }
                self.coordinator.on_queue_changed(&self.queue);
            }

            Message::Retry(unit) => self.coordinator.retry(&unit, &self.queue),

            Message::Finished(handle) => {
                self.controller
                    .on_engine_finished(&mut self.queue, &handle);
                self.coordinator.on_queue_changed(&self.queue);
            }

            Message::EngineFailed(cause) => self.controller.on_engine_failed(cause),
        }
    }

    /// Cancels units that left the queue and deletes what they downloaded,
    /// unless the content was saved or is still queued under another unit.
    fn dispose(&mut self, removed: &[Arc<DownloadUnit>]) {
        for unit in removed {
            self.coordinator.cancel(unit);

            if unit.is_saved() || self.queue.contains_item(&unit.item().id) {
                continue;
            }
            if let Some(handle) = unit.storage() {
                debug!("deleting {handle}");
                self.coordinator.discard(handle);
            }
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

pub struct DownloadService {
    core: Arc<Mutex<Core>>,
    catalog: Arc<dyn Catalog>,
    events: broadcast::Sender<Event>,
    control: JoinHandle<()>,
}

impl DownloadService {
    /// Events buffered per subscriber before the oldest are dropped.
    const EVENT_CAPACITY: usize = 64;

    /// Creates the service and attaches it to `engine`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or when called
    /// outside of a tokio runtime.
    pub fn new(
        config: Config,
        catalog: Arc<dyn Catalog>,
        storage: Arc<dyn Storage>,
        engine: Arc<dyn Engine>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| Error::failed_precondition(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        engine.attach(EngineNotifier::new(tx.clone()));

        let core = Core {
            queue: PlaybackQueue::new(),
            controller: Controller::new(engine, events.clone(), config.repeat),
            coordinator: Coordinator::new(&config, Arc::clone(&catalog), storage, tx, runtime.clone()),
            events: events.clone(),
        };
        let core = Arc::new(Mutex::new(core));
        let control = runtime.spawn(Self::control_loop(Arc::downgrade(&core), rx));

        info!(
            "download service ready; concurrency {}, look-ahead {}, repeat {}",
            config.concurrency, config.look_ahead, config.repeat
        );

        Ok(Self {
            core,
            catalog,
            events,
            control,
        })
    }

    async fn control_loop(core: Weak<Mutex<Core>>, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            let Some(core) = core.upgrade() else {
                break;
            };

            trace!("applying {message:?}");
            core.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(message);
        }

        trace!("control loop stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `items` and starts downloading them. Returns the ids of the
    /// new units in queue order.
    ///
    /// Directories are skipped. The unit at `options.start_index` within the
    /// batch becomes current when `options.autoplay` is set or nothing was
    /// current yet.
    pub fn download<I>(&self, items: I, options: Options) -> Vec<UnitId>
    where
        I: IntoIterator<Item = Arc<MediaItem>>,
    {
        let mut items: Vec<_> = items
            .into_iter()
            .filter(|item| {
                let playable = item.is_playable();
                if !playable {
                    warn!("skipping {item}: {} cannot be played", item.kind);
                }
                playable
            })
            .collect();

        if options.shuffle {
            fastrand::shuffle(&mut items);
        }

        let at = if options.play_next {
            InsertAt::AfterCurrent
        } else {
            InsertAt::End
        };

        let mut guard = self.lock();
        let core = &mut *guard;

        let had_current = core.queue.current_index().is_some();
        let units = core.queue.append(items, at, options.save);
        let Some(target) = units.get(options.start_index).or_else(|| units.first()) else {
            return Vec::new();
        };
        core.emit(Event::QueueChanged);

        if options.autoplay || !had_current {
            if let Some(index) = core.queue.position(target.id()) {
                core.controller
                    .select(&mut core.queue, index, options.start_position);
            }
            if options.autoplay {
                core.controller.arm(target.id());
            }
        }

        core.coordinator.on_queue_changed(&core.queue);
        units.iter().map(|unit| unit.id()).collect()
    }

    /// Resolves `ids` through the catalog, then enqueues them like
    /// [`download`](Self::download).
    ///
    /// # Errors
    ///
    /// Returns the first error of the catalog; nothing is enqueued then.
    pub async fn download_ids<I, S>(&self, ids: I, options: Options) -> Result<Vec<UnitId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut items = Vec::new();
        for id in ids {
            let item = self.catalog.fetch_metadata(id.as_ref()).await?;
            items.push(Arc::new(item));
        }

        Ok(self.download(items, options))
    }

    /// Removes the units at `indices`, cancelling their downloads. Indices
    /// may come in any order; those out of range are ignored.
    pub fn remove(&self, indices: &[usize]) {
        let mut guard = self.lock();
        let core = &mut *guard;

        let removed = core.queue.remove_at(indices);
        if removed.is_empty() {
            return;
        }

        debug!("removing {} units", removed.len());
        core.dispose(&removed);
        core.controller.on_removed(&core.queue);
        core.emit(Event::QueueChanged);
        core.coordinator.on_queue_changed(&core.queue);
    }

    /// Cancels all downloads, empties the queue and resets the player.
    pub fn clear(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;

        let removed = core.queue.clear();
        core.dispose(&removed);
        core.controller.reset();
        if !removed.is_empty() {
            core.emit(Event::QueueChanged);
        }
    }

    /// Returns the units in queue order.
    #[must_use]
    pub fn downloads(&self) -> Vec<Arc<DownloadUnit>> {
        self.lock().queue.snapshot()
    }

    /// Returns the most recently enqueued distinct units, newest first.
    #[must_use]
    pub fn recent_downloads(&self, limit: usize) -> Vec<Arc<DownloadUnit>> {
        self.lock().queue.recent(limit)
    }

    pub fn play(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.controller.play(&mut core.queue);
        core.coordinator.on_queue_changed(&core.queue);
    }

    pub fn pause(&self) {
        self.lock().controller.pause();
    }

    pub fn stop(&self) {
        self.lock().controller.stop();
    }

    pub fn toggle_play_pause(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.controller.toggle(&mut core.queue);
        core.coordinator.on_queue_changed(&core.queue);
    }

    pub fn next(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.controller.next(&mut core.queue);
        core.coordinator.on_queue_changed(&core.queue);
    }

    pub fn previous(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.controller.previous(&mut core.queue);
        core.coordinator.on_queue_changed(&core.queue);
    }

    /// Seeks the current unit. Any value is accepted and clamped.
    pub fn seek_to(&self, position_ms: i64) {
        self.lock().controller.seek_to(position_ms);
    }

    #[must_use]
    pub fn player_state(&self) -> PlayerState {
        self.lock().controller.state()
    }

    #[must_use]
    pub fn player_position(&self) -> Duration {
        self.lock().controller.position()
    }

    #[must_use]
    pub fn player_duration(&self) -> Duration {
        self.lock().controller.duration()
    }

    /// Cause of the last playback failure.
    #[must_use]
    pub fn player_error(&self) -> Option<String> {
        self.lock().controller.error().map(ToOwned::to_owned)
    }

    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        self.lock().queue.current_index()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn set_repeat_mode(&self, repeat: RepeatMode) {
        self.lock().controller.set_repeat(repeat);
    }

    #[must_use]
    pub fn repeat_mode(&self) -> RepeatMode {
        self.lock().controller.repeat()
    }

    /// Subscribes to service events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Interrupts all downloads and stops playback. The queue is kept, but
    /// nothing is fetched or retried anymore: interrupted units are pending
    /// again and units enqueued later stay pending.
    pub fn shutdown(&self) {
        info!("shutting down download service");
        let mut core = self.lock();
        core.coordinator.shutdown();
        core.controller.stop();
    }
}

impl Drop for DownloadService {
    fn drop(&mut self) {
        self.control.abort();
    }
}
