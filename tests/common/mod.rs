//! Fake collaborators shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{broadcast, watch};

use spool::{
    catalog::{ByteStream, Catalog},
    config::Config,
    engine::{Engine, EngineNotifier},
    error::{Error, Result},
    events::Event,
    item::MediaItem,
    service::DownloadService,
    storage::{Memory, StorageHandle},
};

pub const DURATION: Duration = Duration::from_secs(180);

pub fn item(id: &str) -> MediaItem {
    MediaItem::new(id, id.to_uppercase()).with_duration(DURATION)
}

pub fn items(ids: &[&str]) -> Vec<Arc<MediaItem>> {
    ids.iter().map(|id| Arc::new(item(id))).collect()
}

pub fn content(id: &str) -> Vec<u8> {
    format!("content of {id}").into_bytes()
}

/// Catalog serving every id, with scripted failures and a gate to hold
/// streams open.
pub struct FakeCatalog {
    failures: Mutex<HashMap<String, u32>>,
    missing: Mutex<HashSet<String>>,
    opened: Mutex<Vec<String>>,
    gate: watch::Sender<bool>,
}

impl FakeCatalog {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
            missing: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
            gate,
        })
    }

    /// Fails the next `times` streams of `id` with a transient error.
    pub fn fail(&self, id: &str, times: u32) {
        self.failures.lock().unwrap().insert(id.to_owned(), times);
    }

    /// Makes `id` unknown to the catalog.
    pub fn remove(&self, id: &str) {
        self.missing.lock().unwrap().insert(id.to_owned());
    }

    /// Holds all streams until released.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Ids in the order their streams were opened.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn fetch_metadata(&self, id: &str) -> Result<MediaItem> {
        if self.missing.lock().unwrap().contains(id) {
            return Err(Error::not_found(format!("{id} not in catalog")));
        }
        Ok(item(id))
    }

    async fn open_stream(&self, item: &MediaItem) -> Result<ByteStream> {
        let id = item.id.clone();
        self.opened.lock().unwrap().push(id.clone());

        if self.missing.lock().unwrap().contains(&id) {
            return Err(Error::not_found(format!("{id} not in catalog")));
        }

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::unavailable("catalog offline"));
            }
        }

        let mut gate = self.gate.subscribe();
        let stream = futures_util::stream::once(async move {
            let open = gate.wait_for(|open| *open).await.is_ok();
            if open {
                Ok(content(&id))
            } else {
                Err(Error::aborted("gate dropped"))
            }
        });
        Ok(stream.boxed())
    }
}

/// Engine that records calls and completes on request.
#[derive(Default)]
pub struct FakeEngine {
    notifier: OnceLock<EngineNotifier>,
    loaded: Mutex<Option<StorageHandle>>,
    position: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drains the recorded calls.
    pub fn calls(&self) -> Vec<String> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn loaded(&self) -> Option<String> {
        self.loaded
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.key().to_owned())
    }

    /// Reports the loaded content as played to its end.
    pub fn finish(&self) {
        let handle = self.loaded.lock().unwrap().clone();
        if let (Some(handle), Some(notifier)) = (handle, self.notifier.get()) {
            notifier.finished(&handle);
        }
    }

    pub fn break_down(&self, cause: &str) {
        if let Some(notifier) = self.notifier.get() {
            notifier.failed(cause);
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Engine for FakeEngine {
    fn attach(&self, notifier: EngineNotifier) {
        let _ = self.notifier.set(notifier);
    }

    fn load(&self, handle: &StorageHandle, _item: &MediaItem) -> Result<()> {
        self.record(format!("load {}", handle.key()));
        *self.loaded.lock().unwrap() = Some(handle.clone());
        *self.position.lock().unwrap() = Duration::ZERO;
        Ok(())
    }

    fn play(&self) -> Result<()> {
        self.record("play".to_owned());
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.record("pause".to_owned());
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.record("stop".to_owned());
        *self.loaded.lock().unwrap() = None;
        Ok(())
    }

    fn seek(&self, position: Duration) -> Result<()> {
        self.record(format!("seek {}", position.as_millis()));
        *self.position.lock().unwrap() = position;
        Ok(())
    }

    fn position(&self) -> Duration {
        *self.position.lock().unwrap()
    }

    fn duration(&self) -> Duration {
        if self.loaded.lock().unwrap().is_some() {
            DURATION
        } else {
            Duration::ZERO
        }
    }
}

pub struct Harness {
    pub service: DownloadService,
    pub catalog: Arc<FakeCatalog>,
    pub storage: Arc<Memory>,
    pub engine: Arc<FakeEngine>,
    pub events: broadcast::Receiver<Event>,
}

pub fn harness(config: Config) -> Harness {
    let catalog = FakeCatalog::new();
    let storage = Arc::new(Memory::new());
    let engine = FakeEngine::new();

    let service = DownloadService::new(
        config,
        catalog.clone(),
        storage.clone(),
        engine.clone(),
    )
    .unwrap();
    let events = service.subscribe();

    Harness {
        service,
        catalog,
        storage,
        engine,
        events,
    }
}

/// Waits for `wanted`, skipping other events.
pub async fn expect_event(events: &mut broadcast::Receiver<Event>, wanted: Event) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    };

    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .unwrap_or_else(|_| panic!("no {wanted:?} event"));
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}
