//! Download coordinator: a bounded pool of fetch workers.
//!
//! The coordinator decides which pending units to fetch next. Priority goes
//! to the unit at the cursor, then to the look-ahead window after it, then
//! to the rest of the queue after the window, and finally to the units
//! before the cursor. Without a cursor the queue is fetched in order.
//!
//! Priorities are recomputed whenever the queue changes or the cursor
//! moves. In-flight fetches are never pre-empted, but a unit that became
//! current is started before any lower priority unit that has not started
//! yet.
//!
//! Each worker fetches exactly one unit: it opens the content stream,
//! buffers it and writes it to storage. Workers check for cancellation when
//! opening the stream and on every chunk, and report their result to the
//! service control loop. Failed fetches are retried with exponential backoff
//! until the configured number of attempts is exhausted.
//!
//! Content is stored under the item id, so several units of the same item
//! share it. Content of a cancelled unit is only deleted when no queued unit
//! refers to the same item anymore.
//!
//! After [`Coordinator::shutdown`] no fetch is started or retried anymore.
//! Interrupted units go back to `Pending`; they are not cancelled, as they
//! are still queued.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use exponential_backoff::Backoff;
use futures_util::StreamExt;
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::Catalog,
    config::Config,
    error::{Error, ErrorKind, Result},
    queue::PlaybackQueue,
    service::Message,
    storage::{Storage, StorageHandle},
    unit::{DownloadUnit, UnitId},
};

/// How a fetch ended, as applied to its unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Completed,
    Cancelled,

    /// Interrupted by shutdown; the unit is pending again.
    Halted,

    /// Failed and scheduled for another attempt.
    Retrying,

    /// Failed for good.
    Exhausted,
}

pub struct Coordinator {
    catalog: Arc<dyn Catalog>,
    storage: Arc<dyn Storage>,
    concurrency: NonZeroUsize,
    look_ahead: usize,
    backoff: Backoff,
    in_flight: HashMap<UnitId, Arc<DownloadUnit>>,
    halt: CancellationToken,
    tx: mpsc::UnboundedSender<Message>,
    runtime: Handle,
}

impl Coordinator {
    /// Buffers are never pre-allocated beyond this size, whatever the
    /// catalog claims.
    const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

    pub(crate) fn new(
        config: &Config,
        catalog: Arc<dyn Catalog>,
        storage: Arc<dyn Storage>,
        tx: mpsc::UnboundedSender<Message>,
        runtime: Handle,
    ) -> Self {
        let retry = &config.retry;
        Self {
            catalog,
            storage,
            concurrency: config.concurrency,
            look_ahead: config.look_ahead,
            backoff: Backoff::new(retry.attempts, retry.min_delay, retry.max_delay),
            in_flight: HashMap::new(),
            halt: CancellationToken::new(),
            tx,
            runtime,
        }
    }

    /// Returns queue indices in the order they should be fetched.
    #[must_use]
    pub fn priority_order(len: usize, cursor: Option<usize>, look_ahead: usize) -> Vec<usize> {
        let Some(cursor) = cursor.filter(|&cursor| cursor < len) else {
            return (0..len).collect();
        };

        let window_end = cursor.saturating_add(1).saturating_add(look_ahead).min(len);
        std::iter::once(cursor)
            .chain(cursor + 1..window_end)
            .chain(window_end..len)
            .chain(0..cursor)
            .collect()
    }

    /// Number of fetches currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.halt.is_cancelled()
    }

    /// Re-evaluates priorities and starts pending units while capacity
    /// allows.
    pub fn on_queue_changed(&mut self, queue: &PlaybackQueue) {
        if self.is_shut_down() {
            return;
        }

        let mut capacity = self.concurrency.get().saturating_sub(self.in_flight.len());
        if capacity == 0 {
            return;
        }

        for index in Self::priority_order(queue.len(), queue.current_index(), self.look_ahead) {
            let Some(unit) = queue.get(index) else {
                continue;
            };

            if unit.is_cancel_requested() || !unit.claim() {
                continue;
            }

            self.start(Arc::clone(unit));
            capacity -= 1;
            if capacity == 0 {
                break;
            }
        }
    }

    fn start(&mut self, unit: Arc<DownloadUnit>) {
        debug!("fetching {unit}");
        self.in_flight.insert(unit.id(), Arc::clone(&unit));

        let catalog = Arc::clone(&self.catalog);
        let storage = Arc::clone(&self.storage);
        let halt = self.halt.clone();
        let tx = self.tx.clone();
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            let worker = runtime.spawn({
                let storage = Arc::clone(&storage);
                let unit = Arc::clone(&unit);
                async move { fetch(catalog.as_ref(), storage.as_ref(), &unit, &halt).await }
            });

            // A worker that panicked still has to give its slot back.
            let result = worker.await.unwrap_or_else(|e| {
                error!("worker fetching {unit} died: {e}");
                Err(Error::internal(format!("worker fetching {unit} died")))
            });

            if let Err(mpsc::error::SendError(Message::Fetched { unit, result })) =
                tx.send(Message::Fetched { unit, result })
            {
                // Nobody is left to own the content.
                if let Ok(handle) = result {
                    trace!("service gone, discarding {unit}");
                    let _ = storage.delete(&handle).await;
                }
            }
        });
    }

    /// Applies the result of a fetch to its unit and frees its slot.
    ///
    /// Content that arrives for a unit that was cancelled in the meantime is
    /// deleted instead of stored, unless `queue` still holds another unit of
    /// the same item.
    pub(crate) fn finish(
        &mut self,
        unit: &Arc<DownloadUnit>,
        result: Result<StorageHandle>,
        queue: &PlaybackQueue,
    ) -> Outcome {
        self.in_flight.remove(&unit.id());

        match result {
            Ok(handle) if unit.is_cancel_requested() => {
                if queue.contains_item(&unit.item().id) {
                    debug!("late download of {unit} still queued, keeping {handle}");
                } else {
                    debug!("discarding late download of {unit}");
                    self.discard(handle);
                }
                unit.cancelled();
                Outcome::Cancelled
            }

            Ok(handle) => {
                info!("downloaded {unit}: {handle}");
                if unit.complete(handle) {
                    Outcome::Completed
                } else {
                    Outcome::Cancelled
                }
            }

            Err(e) if e.kind == ErrorKind::Cancelled || unit.is_cancel_requested() => {
                if unit.is_cancel_requested() {
                    debug!("fetch of {unit} cancelled");
                    unit.cancelled();
                    Outcome::Cancelled
                } else {
                    debug!("fetch of {unit} interrupted");
                    unit.release();
                    Outcome::Halted
                }
            }

            Err(e) => {
                let attempt = unit.attempts().saturating_add(1);
                let delay = if e.is_transient() {
                    (&self.backoff)
                        .into_iter()
                        .nth(attempt.saturating_sub(1) as usize)
                        .flatten()
                } else {
                    None
                };

                unit.fail(e.to_string(), delay.is_none());
                match delay {
                    Some(delay) => {
                        warn!(
                            "fetching {unit} failed (attempt {attempt}), retrying in {:.1}s: {e}",
                            delay.as_secs_f32()
                        );

                        let tx = self.tx.clone();
                        let halt = self.halt.clone();
                        let unit = Arc::clone(unit);
                        self.runtime.spawn(async move {
                            tokio::select! {
                                () = halt.cancelled() => {}
                                () = tokio::time::sleep(delay) => {
                                    let _ = tx.send(Message::Retry(unit));
                                }
                            }
                        });
                        Outcome::Retrying
                    }
                    None => {
                        error!("fetching {unit} failed (attempt {attempt}), giving up: {e}");
                        Outcome::Exhausted
                    }
                }
            }
        }
    }

    /// Puts a failed unit back up for fetching, unless it was cancelled
    /// while waiting or the coordinator shut down.
    pub(crate) fn retry(&mut self, unit: &DownloadUnit, queue: &PlaybackQueue) {
        if unit.is_cancel_requested() {
            unit.cancelled();
            return;
        }
        if self.is_shut_down() {
            return;
        }

        if unit.retry() {
            trace!("retrying {unit}");
            self.on_queue_changed(queue);
        }
    }

    /// Cancels a unit. Units that are not being fetched are cancelled at
    /// once; in-flight units are cancelled when their worker acknowledges.
    pub fn cancel(&mut self, unit: &DownloadUnit) {
        unit.request_cancel();
        if !self.in_flight.contains_key(&unit.id()) {
            unit.cancelled();
        }
    }

    /// Deletes content in the background.
    pub(crate) fn discard(&self, handle: StorageHandle) {
        let storage = Arc::clone(&self.storage);
        self.runtime.spawn(async move {
            if let Err(e) = storage.delete(&handle).await {
                warn!("failed to delete {handle}: {e}");
            }
        });
    }

    /// Interrupts all in-flight fetches and pending retries, and stops
    /// starting new ones. Units keep their place in the queue.
    pub fn shutdown(&mut self) {
        if !self.in_flight.is_empty() {
            debug!("interrupting {} downloads", self.in_flight.len());
        }

        self.halt.cancel();
    }
}

/// Fetches the content of `unit` into storage, until either the unit is
/// cancelled or the coordinator halts.
async fn fetch(
    catalog: &dyn Catalog,
    storage: &dyn Storage,
    unit: &DownloadUnit,
    halt: &CancellationToken,
) -> Result<StorageHandle> {
    let token = unit.cancellation();
    let item = unit.item();
    let aborted = || Error::cancelled(format!("fetch of {unit} was cancelled"));

    let mut stream = tokio::select! {
        biased;
        () = token.cancelled() => return Err(aborted()),
        () = halt.cancelled() => return Err(aborted()),
        stream = catalog.open_stream(item) => stream?,
    };

    let capacity = item
        .size
        .and_then(|size| usize::try_from(size).ok())
        .unwrap_or_default()
        .min(Coordinator::MAX_PREALLOCATION);
    let mut bytes = Vec::with_capacity(capacity);

    loop {
        let chunk = tokio::select! {
            biased;
            () = token.cancelled() => return Err(aborted()),
            () = halt.cancelled() => return Err(aborted()),
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(chunk) => bytes.extend_from_slice(&chunk?),
            None => break,
        }
    }

    if let Some(size) = item.size {
        if (bytes.len() as u64) < size {
            return Err(Error::data_loss(format!(
                "stream of {unit} ended after {} of {size} bytes",
                bytes.len()
            )));
        }
    }

    storage.write(&item.id, bytes).await
}
