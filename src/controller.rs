//! Playback controller: the player state machine.
//!
//! The controller binds to the unit at the queue cursor and drives the
//! [`Engine`] with it. Playback is committed before the content is there:
//! `play()` moves to [`PlayerState::Started`] at once, and the handoff to
//! the engine happens as soon as the bound unit finishes downloading.
//!
//! Navigation rules:
//!
//! * `next()` moves the cursor forward, and does nothing at the end of the
//!   queue unless repeating all
//! * `previous()` restarts the current unit when it has played for more
//!   than [`RESTART_THRESHOLD`], and moves the cursor back otherwise
//! * After either, playback continues only if it was started before
//!
//! An autoplay trigger can be armed for one unit. When that unit completes
//! while it is still current, playback starts without a call to `play()`.
//! Navigating away, stopping, or the unit failing for good disarms it.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    engine::Engine,
    error::Error,
    events::Event,
    queue::PlaybackQueue,
    storage::StorageHandle,
    unit::{DownloadUnit, UnitId},
};

/// Elapsed time after which `previous()` restarts the current unit instead
/// of moving back.
pub const RESTART_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PlayerState {
    /// Nothing has been played yet, or the queue was cleared.
    #[default]
    Idle,

    /// Committed to play. Audio may not flow yet when the current unit is
    /// still downloading.
    Started,

    Paused,

    /// Stopped by request, by removal of the unit being played, or by an
    /// engine failure.
    Stopped,

    /// The last unit of the queue played to its end.
    Completed,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// Stop at the end of the queue.
    #[default]
    None,

    /// Wrap around at either end of the queue.
    All,

    /// Replay the current unit when it finishes.
    One,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::All => "all",
            Self::One => "one",
        };
        f.write_str(s)
    }
}

impl FromStr for RepeatMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "all" => Ok(Self::All),
            "one" => Ok(Self::One),
            _ => Err(Error::invalid_argument(format!("unknown repeat mode: {s}"))),
        }
    }
}

pub struct Controller {
    engine: Arc<dyn Engine>,
    events: broadcast::Sender<Event>,
    state: PlayerState,
    repeat: RepeatMode,

    /// Unit at the cursor, if any.
    bound: Option<Arc<DownloadUnit>>,

    /// Whether the engine has the content of the bound unit.
    loaded: bool,

    /// Position to apply once the bound unit is loaded.
    pending_seek: Option<Duration>,

    autoplay: Option<UnitId>,
    error: Option<String>,
}

impl Controller {
    pub(crate) fn new(
        engine: Arc<dyn Engine>,
        events: broadcast::Sender<Event>,
        repeat: RepeatMode,
    ) -> Self {
        Self {
            engine,
            events,
            state: PlayerState::Idle,
            repeat,
            bound: None,
            loaded: false,
            pending_seek: None,
            autoplay: None,
            error: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> PlayerState {
        self.state
    }

    #[must_use]
    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: RepeatMode) {
        debug!("repeat mode: {repeat}");
        self.repeat = repeat;
    }

    /// Cause of the last engine failure, cleared by the next `play()`.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub fn bound(&self) -> Option<&Arc<DownloadUnit>> {
        self.bound.as_ref()
    }

    /// Unit the autoplay trigger is armed for.
    #[must_use]
    pub fn autoplay(&self) -> Option<UnitId> {
        self.autoplay
    }

    /// Play head of the bound unit; zero when nothing is bound.
    #[must_use]
    pub fn position(&self) -> Duration {
        if self.bound.is_none() {
            Duration::ZERO
        } else if self.loaded {
            self.engine.position()
        } else {
            self.pending_seek.unwrap_or_default()
        }
    }

    /// Length of the bound unit; zero when nothing is bound or unknown.
    #[must_use]
    pub fn duration(&self) -> Duration {
        match &self.bound {
            None => Duration::ZERO,
            Some(_) if self.loaded => self.engine.duration(),
            Some(unit) => unit.item().duration,
        }
    }

    pub fn play(&mut self, queue: &mut PlaybackQueue) {
        if queue.is_empty() {
            return;
        }

        if queue.current_index().is_none() {
            queue.set_current(Some(0));
        }
        self.bind(queue);

        if self.state == PlayerState::Completed {
            self.restart();
        }

        self.autoplay = None;
        self.error = None;
        self.start();
    }

    pub fn pause(&mut self) {
        if self.state != PlayerState::Started {
            return;
        }

        self.state = PlayerState::Paused;
        if self.loaded {
            if let Err(e) = self.engine.pause() {
                self.fail(e.to_string());
                return;
            }
        }
        self.emit(Event::Pause);
    }

    pub fn toggle(&mut self, queue: &mut PlaybackQueue) {
        if self.state == PlayerState::Started {
            self.pause();
        } else {
            self.play(queue);
        }
    }

    /// Stops playback and unloads the engine. A later `play()` starts the
    /// current unit from the beginning.
    pub fn stop(&mut self) {
        self.autoplay = None;
        if matches!(self.state, PlayerState::Idle | PlayerState::Stopped) {
            return;
        }

        self.unload();
        self.state = PlayerState::Stopped;
        self.emit(Event::Stop);
    }

    pub fn next(&mut self, queue: &mut PlaybackQueue) {
        let len = queue.len();
        let target = match queue.current_index() {
            _ if len == 0 => return,
            None => 0,
            Some(cursor) if cursor + 1 < len => cursor + 1,
            Some(_) if self.repeat == RepeatMode::All => 0,
            Some(_) => return,
        };

        self.move_to(queue, target);
        if self.state == PlayerState::Started {
            self.engage();
        }
    }

    pub fn previous(&mut self, queue: &mut PlaybackQueue) {
        if queue.is_empty() {
            return;
        }

        if self.position() > RESTART_THRESHOLD {
            debug!("restarting current unit");
            self.restart();
            return;
        }

        let target = match queue.current_index() {
            None => return,
            Some(0) if self.repeat == RepeatMode::All => queue.len() - 1,
            Some(0) => return,
            Some(cursor) => cursor - 1,
        };

        self.move_to(queue, target);
        if self.state == PlayerState::Started {
            self.engage();
        }
    }

    /// Seeks to `position_ms` milliseconds, clamped to the bounds of the
    /// bound unit. Does nothing when nothing is bound.
    ///
    /// Before the content is loaded, a position beyond an unknown duration
    /// is kept and clamped once the engine knows the duration. Loaded
    /// content of unknown duration cannot be seeked.
    pub fn seek_to(&mut self, position_ms: i64) {
        let position = Duration::from_millis(u64::try_from(position_ms).unwrap_or_default());
        self.seek(position);
    }

    pub(crate) fn seek(&mut self, position: Duration) {
        let Some(unit) = &self.bound else {
            return;
        };

        let duration = self.duration();
        if !self.loaded {
            self.pending_seek = Some(if duration.is_zero() {
                position
            } else {
                position.min(duration)
            });
            return;
        }

        if duration.is_zero() {
            debug!("duration of {unit} unknown, ignoring seek");
            return;
        }

        if let Err(e) = self.engine.seek(position.min(duration)) {
            self.fail(e.to_string());
        }
    }

    /// Makes the unit at `index` current without touching the player state,
    /// pre-seeked to `position`. Playback continues there if started.
    pub(crate) fn select(&mut self, queue: &mut PlaybackQueue, index: usize, position: Duration) {
        self.move_to(queue, index);
        if !position.is_zero() {
            self.seek(position);
        }
        if self.state == PlayerState::Started {
            self.engage();
        }
    }

    /// Arms the autoplay trigger for `id`. Fires at once when the unit is
    /// current and already downloaded.
    pub(crate) fn arm(&mut self, id: UnitId) {
        trace!("autoplay armed for {id}");
        self.autoplay = Some(id);
        if let Some(unit) = self.bound.clone() {
            if unit.is_completed() {
                self.on_unit_completed(&unit);
            }
        }
    }

    /// Follows the queue cursor. Rebinding unloads the engine.
    pub(crate) fn bind(&mut self, queue: &PlaybackQueue) {
        let current = queue.current();
        if current.map(|unit| unit.id()) == self.bound.as_ref().map(|unit| unit.id()) {
            return;
        }

        self.unload();
        self.bound = current.cloned();
        if let Some(unit) = &self.bound {
            debug!("current unit: {unit}");
            self.emit(Event::TrackChanged(unit.id()));
        }
    }

    /// Brings the controller in line with a queue that lost units.
    pub(crate) fn on_removed(&mut self, queue: &PlaybackQueue) {
        if self
            .autoplay
            .is_some_and(|id| queue.position(id).is_none())
        {
            self.autoplay = None;
        }

        let removed = self
            .bound
            .as_ref()
            .is_some_and(|unit| queue.position(unit.id()).is_none());
        if removed {
            self.unload();
            self.bound = None;

            if matches!(self.state, PlayerState::Started | PlayerState::Paused) {
                self.emit(Event::Stop);
            }
            if self.state != PlayerState::Idle {
                self.state = PlayerState::Stopped;
            }
        }

        if queue.is_empty() {
            self.state = PlayerState::Idle;
        }

        self.bind(queue);
    }

    /// Hands a unit that finished downloading to the engine, if it is the
    /// bound unit and playback is started or about to autoplay.
    pub(crate) fn on_unit_completed(&mut self, unit: &DownloadUnit) {
        if self.bound.as_ref().map(|bound| bound.id()) != Some(unit.id()) {
            return;
        }

        if self.autoplay == Some(unit.id()) {
            debug!("autoplaying {unit}");
            self.autoplay = None;
            self.error = None;
            self.start();
        } else if self.state == PlayerState::Started {
            self.engage();
        }
    }

    /// Disarms autoplay for a unit that will never complete.
    pub(crate) fn on_unit_exhausted(&mut self, unit: &DownloadUnit) {
        if self.autoplay == Some(unit.id()) {
            debug!("autoplay disarmed, {unit} failed");
            self.autoplay = None;
        }
    }

    /// Advances after the engine played `handle` to its end. Reports for
    /// content that is no longer loaded are ignored.
    pub(crate) fn on_engine_finished(&mut self, queue: &mut PlaybackQueue, handle: &StorageHandle) {
        let current = self.loaded
            && self
                .bound
                .as_ref()
                .and_then(|unit| unit.storage())
                .is_some_and(|loaded| loaded == *handle);
        if !current {
            trace!("ignoring completion of {handle}");
            return;
        }

        if self.repeat == RepeatMode::One {
            self.restart();
            self.engage();
            return;
        }

        let len = queue.len();
        match queue.current_index() {
            Some(cursor) if cursor + 1 < len => self.move_to(queue, cursor + 1),
            Some(_) if self.repeat == RepeatMode::All => self.move_to(queue, 0),
            _ => {
                info!("queue finished");
                if let Err(e) = self.engine.pause() {
                    warn!("failed to pause engine at end of queue: {e}");
                }
                self.state = PlayerState::Completed;
                self.emit(Event::QueueFinished);
                return;
            }
        }

        if self.state == PlayerState::Started {
            self.engage();
        }
    }

    pub(crate) fn on_engine_failed(&mut self, cause: String) {
        if self.bound.is_some() {
            self.fail(cause);
        }
    }

    /// Returns to `Idle` with nothing bound.
    pub(crate) fn reset(&mut self) {
        let was_playing = matches!(self.state, PlayerState::Started | PlayerState::Paused);

        self.unload();
        self.bound = None;
        self.autoplay = None;
        self.error = None;
        self.state = PlayerState::Idle;

        if was_playing {
            self.emit(Event::Stop);
        }
    }

    fn start(&mut self) {
        let was = self.state;
        self.state = PlayerState::Started;
        self.engage();

        if was != PlayerState::Started && self.state == PlayerState::Started {
            self.emit(Event::Play);
        }
    }

    /// Moves the cursor to `index`, restarting when it already points there.
    fn move_to(&mut self, queue: &mut PlaybackQueue, index: usize) {
        self.autoplay = None;
        if queue.current_index() == Some(index) {
            self.restart();
        } else {
            queue.set_current(Some(index));
            self.bind(queue);
        }
    }

    fn restart(&mut self) {
        if self.loaded {
            if let Err(e) = self.engine.seek(Duration::ZERO) {
                self.fail(e.to_string());
            }
        } else {
            self.pending_seek = None;
        }
    }

    /// Gets the engine playing the bound unit, loading it when it is ready.
    /// Suspends until the unit completed downloading otherwise.
    fn engage(&mut self) {
        let Some(unit) = self.bound.clone() else {
            return;
        };

        if !self.loaded {
            let Some(handle) = unit.storage() else {
                trace!("waiting for {unit} to download");
                return;
            };

            if let Err(e) = self.engine.load(&handle, unit.item()) {
                self.fail(e.to_string());
                return;
            }
            self.loaded = true;
        }

        if let Some(position) = self.pending_seek.take() {
            let duration = self.engine.duration();
            if duration.is_zero() {
                debug!("duration of {unit} unknown, ignoring seek");
            } else if let Err(e) = self.engine.seek(position.min(duration)) {
                self.fail(e.to_string());
                return;
            }
        }

        if let Err(e) = self.engine.play() {
            self.fail(e.to_string());
        }
    }

    fn unload(&mut self) {
        if self.loaded {
            if let Err(e) = self.engine.stop() {
                warn!("failed to stop engine: {e}");
            }
            self.loaded = false;
        }
        self.pending_seek = None;
    }

    fn fail(&mut self, cause: String) {
        error!("playback failed: {cause}");
        self.unload();
        self.state = PlayerState::Stopped;
        self.error = Some(cause);
        self.emit(Event::EngineFailed);
    }

    fn emit(&self, event: Event) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        engine::EngineNotifier,
        error::Result,
        item::MediaItem,
        queue::InsertAt,
    };

    /// Engine that records calls and reports a settable position.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        position: Mutex<Duration>,
        broken: Mutex<bool>,
    }

    impl Recorder {
        fn record(&self, call: impl Into<String>) -> Result<()> {
            self.calls.lock().unwrap().push(call.into());
            if *self.broken.lock().unwrap() {
                Err(Error::internal("device lost"))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl Engine for Recorder {
        fn attach(&self, _notifier: EngineNotifier) {}

        fn load(&self, handle: &StorageHandle, _item: &MediaItem) -> Result<()> {
            self.record(format!("load {}", handle.key()))
        }

        fn play(&self) -> Result<()> {
            self.record("play")
        }

        fn pause(&self) -> Result<()> {
            self.record("pause")
        }

        fn stop(&self) -> Result<()> {
            self.record("stop")
        }

        fn seek(&self, position: Duration) -> Result<()> {
            *self.position.lock().unwrap() = position;
            self.record(format!("seek {}", position.as_secs()))
        }

        fn position(&self) -> Duration {
            *self.position.lock().unwrap()
        }

        fn duration(&self) -> Duration {
            Duration::from_secs(200)
        }
    }

    fn setup(ids: &[&str]) -> (Controller, PlaybackQueue, Arc<Recorder>) {
        let engine = Arc::new(Recorder::default());
        let (events, _) = broadcast::channel(16);
        let controller = Controller::new(engine.clone(), events, RepeatMode::None);

        let mut queue = PlaybackQueue::new();
        let items = ids.iter().map(|id| {
            Arc::new(MediaItem::new(*id, *id).with_duration(Duration::from_secs(200)))
        });
        queue.append(items, InsertAt::End, false);

        (controller, queue, engine)
    }

    fn download(queue: &PlaybackQueue, index: usize) -> Arc<DownloadUnit> {
        let unit = Arc::clone(queue.get(index).unwrap());
        assert!(unit.claim());
        let key = unit.item().id.clone();
        assert!(unit.complete(StorageHandle::new(key.clone(), key, 1)));
        unit
    }

    #[test]
    fn empty_queue_stays_idle() {
        let (mut controller, mut queue, _) = setup(&[]);

        controller.toggle(&mut queue);
        assert_eq!(controller.state(), PlayerState::Idle);
        controller.toggle(&mut queue);
        assert_eq!(controller.state(), PlayerState::Idle);

        controller.next(&mut queue);
        controller.previous(&mut queue);
        assert_eq!(queue.current_index(), None);
        assert_eq!(controller.position(), Duration::ZERO);
        assert_eq!(controller.duration(), Duration::ZERO);
    }

    #[test]
    fn handoff_waits_for_download() {
        let (mut controller, mut queue, engine) = setup(&["a", "b"]);

        controller.play(&mut queue);
        assert_eq!(controller.state(), PlayerState::Started);
        assert_eq!(queue.current_index(), Some(0));
        assert!(engine.calls().is_empty());

        let unit = download(&queue, 0);
        controller.on_unit_completed(&unit);
        assert_eq!(engine.calls(), ["load a", "play"]);

        controller.toggle(&mut queue);
        assert_eq!(controller.state(), PlayerState::Paused);
        controller.toggle(&mut queue);
        assert_eq!(controller.state(), PlayerState::Started);
        assert_eq!(engine.calls(), ["pause", "play"]);
    }

    #[test]
    fn pending_seek_is_clamped_and_applied() {
        let (mut controller, mut queue, engine) = setup(&["a"]);
        controller.seek_to(1_000);
        assert_eq!(controller.position(), Duration::ZERO);

        queue.set_current(Some(0));
        controller.bind(&queue);
        controller.seek_to(i64::MAX);
        assert_eq!(controller.position(), Duration::from_secs(200));
        controller.seek_to(i64::MIN);
        assert_eq!(controller.position(), Duration::ZERO);
        controller.seek_to(42_000);

        download(&queue, 0);
        controller.play(&mut queue);
        assert_eq!(engine.calls(), ["load a", "seek 42", "play"]);
        assert_eq!(controller.position(), Duration::from_secs(42));
    }

    #[test]
    fn seek_beyond_unknown_duration_is_clamped_once_loaded() {
        let (mut controller, _, engine) = setup(&[]);
        let mut queue = PlaybackQueue::new();
        queue.append([Arc::new(MediaItem::new("a", "a"))], InsertAt::End, false);

        queue.set_current(Some(0));
        controller.bind(&queue);
        controller.seek_to(i64::MAX);

        download(&queue, 0);
        controller.play(&mut queue);
        assert_eq!(engine.calls(), ["load a", "seek 200", "play"]);
        assert_eq!(controller.position(), Duration::from_secs(200));
    }

    #[test]
    fn previous_restarts_after_threshold() {
        let (mut controller, mut queue, engine) = setup(&["a", "b"]);
        download(&queue, 0);
        download(&queue, 1);

        controller.play(&mut queue);
        controller.next(&mut queue);
        assert_eq!(queue.current_index(), Some(1));
        engine.calls();

        controller.seek_to(6_000);
        controller.previous(&mut queue);
        assert_eq!(queue.current_index(), Some(1));
        assert_eq!(controller.position(), Duration::ZERO);

        controller.previous(&mut queue);
        assert_eq!(queue.current_index(), Some(0));
        assert_eq!(controller.state(), PlayerState::Started);
    }

    #[test]
    fn next_stops_at_end_unless_repeating() {
        let (mut controller, mut queue, _) = setup(&["a", "b"]);
        controller.next(&mut queue);
        assert_eq!(queue.current_index(), Some(0));
        controller.next(&mut queue);
        assert_eq!(queue.current_index(), Some(1));
        controller.next(&mut queue);
        assert_eq!(queue.current_index(), Some(1));
        assert_eq!(controller.state(), PlayerState::Idle);

        controller.set_repeat(RepeatMode::All);
        controller.next(&mut queue);
        assert_eq!(queue.current_index(), Some(0));
        controller.previous(&mut queue);
        assert_eq!(queue.current_index(), Some(1));
    }

    #[test]
    fn natural_completion_advances_and_finishes() {
        let (mut controller, mut queue, _) = setup(&["a", "b"]);
        let a = download(&queue, 0);
        let b = download(&queue, 1);

        controller.play(&mut queue);
        controller.on_engine_finished(&mut queue, &a.storage().unwrap());
        assert_eq!(queue.current_index(), Some(1));
        assert_eq!(controller.state(), PlayerState::Started);

        // Stale report for the previous unit.
        controller.on_engine_finished(&mut queue, &a.storage().unwrap());
        assert_eq!(queue.current_index(), Some(1));

        controller.on_engine_finished(&mut queue, &b.storage().unwrap());
        assert_eq!(controller.state(), PlayerState::Completed);

        controller.play(&mut queue);
        assert_eq!(controller.state(), PlayerState::Started);
        assert_eq!(controller.position(), Duration::ZERO);
    }

    #[test]
    fn autoplay_fires_only_while_current() {
        let (mut controller, mut queue, engine) = setup(&["a", "b"]);
        controller.select(&mut queue, 0, Duration::ZERO);
        controller.arm(queue.get(0).unwrap().id());

        controller.next(&mut queue);
        assert_eq!(controller.autoplay(), None);
        let a = download(&queue, 0);
        controller.on_unit_completed(&a);
        assert_eq!(controller.state(), PlayerState::Idle);

        controller.arm(queue.get(1).unwrap().id());
        let b = download(&queue, 1);
        controller.on_unit_completed(&b);
        assert_eq!(controller.state(), PlayerState::Started);
        assert_eq!(engine.calls(), ["load b", "play"]);
    }

    #[test]
    fn engine_failure_stops() {
        let (mut controller, mut queue, engine) = setup(&["a"]);
        download(&queue, 0);
        *engine.broken.lock().unwrap() = true;

        controller.play(&mut queue);
        assert_eq!(controller.state(), PlayerState::Stopped);
        assert!(controller.error().unwrap().contains("device lost"));

        *engine.broken.lock().unwrap() = false;
        controller.play(&mut queue);
        assert_eq!(controller.state(), PlayerState::Started);
        assert_eq!(controller.error(), None);

        controller.on_engine_failed("underrun".to_owned());
        assert_eq!(controller.state(), PlayerState::Stopped);
        assert_eq!(controller.error(), Some("underrun"));
    }

    #[test]
    fn removing_bound_unit() {
        let (mut controller, mut queue, _) = setup(&["a", "b"]);
        download(&queue, 0);
        controller.play(&mut queue);

        queue.remove_at(&[0]);
        controller.on_removed(&queue);
        assert_eq!(controller.state(), PlayerState::Stopped);
        assert!(controller.bound().is_none());

        queue.remove_at(&[0]);
        controller.on_removed(&queue);
        assert_eq!(controller.state(), PlayerState::Idle);
    }

    #[test]
    fn parses_repeat_mode() {
        assert_eq!("ALL".parse::<RepeatMode>().unwrap(), RepeatMode::All);
        assert_eq!("off".parse::<RepeatMode>().unwrap(), RepeatMode::None);
        assert!("twice".parse::<RepeatMode>().is_err());
    }
}
