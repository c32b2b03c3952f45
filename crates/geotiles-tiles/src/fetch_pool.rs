//! Background fetch-and-decode workers.
//!
//! Tile requests are pushed onto a bounded channel consumed by a fixed set of
//! named worker threads. Each worker fetches the bytes, then either parses
//! them as an external tileset description or hands them to the content
//! decoder, and posts a [`FetchCompletion`] back on an unbounded result
//! channel. The main thread drains completions once per frame, so tile state
//! is only ever mutated on the thread that owns the tileset.
//!
//! With zero worker threads the pool runs tasks inline on submission; the
//! completion is still queued and only observed on the next drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use tracing::{trace, warn};

use crate::content::{ContentDecoder, DecodedContent, TileMetadata};
use crate::description::TilesetDescription;
use crate::error::ContentError;
use crate::fetch::Fetcher;
use crate::tile::TileId;

/// A single content request.
#[derive(Clone, Debug)]
pub struct FetchTask {
    pub id: TileId,
    /// Distinguishes repeated requests for the same tile.
    pub request_id: u64,
    pub url: String,
    pub metadata: TileMetadata,
    /// Parse the response as an external tileset instead of decoding it.
    pub is_tileset: bool,
}

/// What a successful request produced.
#[derive(Debug)]
pub enum LoadedContent {
    Decoded(DecodedContent),
    Tileset(Box<TilesetDescription>),
}

/// Outcome of a request, delivered to the main thread.
#[derive(Debug)]
pub struct FetchCompletion {
    pub id: TileId,
    pub request_id: u64,
    pub url: String,
    pub outcome: Result<LoadedContent, ContentError>,
    pub expire_after: Option<Duration>,
}

struct QueuedTask {
    task: FetchTask,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug)]
struct ActiveRequest {
    request_id: u64,
    cancelled: Arc<AtomicBool>,
}

/// Fetcher and decoder shared by all workers.
#[derive(Clone)]
struct Loader {
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn ContentDecoder>,
}

impl Loader {
    fn run(&self, task: FetchTask, cancelled: &AtomicBool) -> Option<FetchCompletion> {
        let fetched = match self.fetcher.fetch(&task.url) {
            Ok(fetched) => fetched,
            Err(e) => return Some(completion(task, Err(e.into()), None)),
        };
        if cancelled.load(Ordering::Relaxed) {
            return None;
        }

        let outcome = if task.is_tileset {
            TilesetDescription::from_slice(&fetched.bytes)
                .map(|d| LoadedContent::Tileset(Box::new(d)))
                .map_err(ContentError::from)
        } else {
            self.decoder
                .decode(&fetched.bytes, &task.metadata)
                .map(LoadedContent::Decoded)
                .map_err(ContentError::from)
        };
        Some(completion(task, outcome, fetched.expire_after))
    }
}

fn completion(
    task: FetchTask,
    outcome: Result<LoadedContent, ContentError>,
    expire_after: Option<Duration>,
) -> FetchCompletion {
    FetchCompletion {
        id: task.id,
        request_id: task.request_id,
        url: task.url,
        outcome,
        expire_after,
    }
}

/// Pool of fetch workers with a bound on in-flight requests.
pub struct FetchPool {
    task_sender: Option<Sender<QueuedTask>>,
    result_sender: Sender<FetchCompletion>,
    result_receiver: Receiver<FetchCompletion>,
    /// Cancellation flag of every outstanding request, keyed by tile.
    active: Arc<DashMap<TileId, ActiveRequest>>,
    in_flight: Arc<AtomicUsize>,
    worker_handles: Vec<JoinHandle<()>>,
    /// Set when no worker threads run; tasks execute on submission.
    inline: Option<Loader>,
    budget: usize,
}

impl FetchPool {
    /// Spawns `worker_count` threads. `budget` caps queued plus executing
    /// requests.
    pub fn new(
        worker_count: usize,
        budget: usize,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn ContentDecoder>,
    ) -> Self {
        let budget = budget.max(1);
        let loader = Loader { fetcher, decoder };
        let (task_tx, task_rx) = crossbeam_channel::bounded::<QueuedTask>(budget);
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let rx = task_rx.clone();
            let tx = result_tx.clone();
            let loader = loader.clone();
            let flight = Arc::clone(&in_flight);

            let spawned = std::thread::Builder::new()
                .name("tile-fetch-worker".into())
                .spawn(move || {
                    while let Ok(queued) = rx.recv() {
                        if queued.cancelled.load(Ordering::Relaxed) {
                            flight.fetch_sub(1, Ordering::Relaxed);
                            continue;
                        }
                        let id = queued.task.id;
                        if let Some(done) = loader.run(queued.task, &queued.cancelled)
                            && !queued.cancelled.load(Ordering::Relaxed)
                        {
                            let _ = tx.send(done);
                        } else {
                            trace!(%id, "Dropped cancelled request");
                        }
                        flight.fetch_sub(1, Ordering::Relaxed);
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(worker = index, error = %e, "Failed to spawn fetch worker"),
            }
        }

        let (task_sender, inline) = if handles.is_empty() {
            (None, Some(loader))
        } else {
            (Some(task_tx), None)
        };

        Self {
            task_sender,
            result_sender: result_tx,
            result_receiver: result_rx,
            active: Arc::new(DashMap::new()),
            in_flight,
            worker_handles: handles,
            inline,
            budget,
        }
    }

    /// Queues a request. Returns the task back when the budget is exhausted
    /// or the pool has shut down.
    #[allow(clippy::result_large_err)]
    pub fn submit(&self, task: FetchTask) -> Result<(), FetchTask> {
        if self.in_flight.load(Ordering::Relaxed) >= self.budget {
            return Err(task);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        self.active.insert(
            task.id,
            ActiveRequest {
                request_id: task.request_id,
                cancelled: Arc::clone(&cancelled),
            },
        );

        if let Some(loader) = &self.inline {
            if let Some(done) = loader.run(task, &cancelled) {
                let _ = self.result_sender.send(done);
            }
            return Ok(());
        }

        let Some(sender) = &self.task_sender else {
            self.active.remove(&task.id);
            return Err(task);
        };
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        sender.try_send(QueuedTask { task, cancelled }).map_err(|e| {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            let task = e.into_inner().task;
            self.active.remove(&task.id);
            task
        })
    }

    /// Cancels the outstanding request for `id`. No-op if none is active.
    pub fn cancel(&self, id: TileId) -> bool {
        match self.active.remove(&id) {
            Some((_, request)) => {
                request.cancelled.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Takes every completion whose request is still active. Completions of
    /// cancelled or superseded requests are discarded.
    pub fn drain_results(&self) -> Vec<FetchCompletion> {
        let mut results = Vec::new();
        while let Ok(done) = self.result_receiver.try_recv() {
            let current = self
                .active
                .remove_if(&done.id, |_, r| {
                    r.request_id == done.request_id && !r.cancelled.load(Ordering::Relaxed)
                })
                .is_some();
            if current {
                results.push(done);
            } else {
                trace!(id = %done.id, "Discarded stale completion");
            }
        }
        results
    }

    /// Whether a request for `id` is outstanding.
    pub fn is_pending(&self, id: TileId) -> bool {
        self.active.contains_key(&id)
    }

    /// Requests not yet drained, including completed-but-undrained ones.
    pub fn outstanding_count(&self) -> usize {
        self.active.len()
    }

    /// Tasks queued or executing on workers.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    /// Cancels everything, closes the task channel and joins the workers.
    pub fn shutdown(&mut self) {
        for entry in self.active.iter() {
            entry.cancelled.store(true, Ordering::Relaxed);
        }
        self.active.clear();
        self.task_sender.take();
        self.inline.take();
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
