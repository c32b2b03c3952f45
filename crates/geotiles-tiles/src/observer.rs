//! Lifecycle notifications and load statistics.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::error;

use crate::tile::{TileId, TileNode};

/// A content request that failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileLoadFailure {
    pub tile: TileId,
    pub url: String,
    pub message: String,
}

/// Counters describing the last update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TilesetStatistics {
    pub frame_number: u64,
    pub visited: usize,
    pub culled: usize,
    pub selected: usize,
    /// Tiles the traversal asked to load this frame.
    pub requested: usize,
    /// Wanted this frame but left unissued by the concurrency limit.
    pub pending_requests: usize,
    /// Issued and not yet completed.
    pub in_flight_requests: usize,
    pub resident_tiles: usize,
    pub resident_bytes: u64,
    pub failed_tiles: usize,
    pub total_tiles: usize,
}

/// Receives tileset lifecycle events on the thread that calls `update`.
///
/// Every method has an empty default except `on_tile_load_failed`, which
/// logs the failure.
pub trait TilesetObserver {
    /// Content became ready.
    fn on_tile_load(&mut self, _tile: &TileNode) {}

    /// Content was released by eviction, expiry, or subtree destruction.
    fn on_tile_unload(&mut self, _tile: &TileNode) {}

    fn on_tile_load_failed(&mut self, failure: &TileLoadFailure) {
        error!(
            tile = %failure.tile,
            url = %failure.url,
            "A 3D tile failed to load: {}",
            failure.message
        );
    }

    /// The tile is part of this frame's rendered selection.
    fn on_tile_visible(&mut self, _tile: &TileNode) {}

    /// Pending or in-flight request counts changed.
    fn on_load_progress(&mut self, _stats: &TilesetStatistics) {}

    /// Every desired tile is loaded and no requests remain.
    fn on_all_tiles_loaded(&mut self) {}

    /// Like `on_all_tiles_loaded`, but only the first time.
    fn on_initial_tiles_loaded(&mut self) {}
}

/// Observer that only logs failures.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingObserver;

impl TilesetObserver for LoggingObserver {}

/// One-shot latch resolved when the tileset root is available.
#[derive(Clone, Debug, Default)]
pub struct ReadySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the latch. Later calls do nothing.
    pub fn resolve(&self) {
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock().unwrap_or_else(|e| e.into_inner());
        if !*ready {
            *ready = true;
            cvar.notify_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until resolved.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut ready = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*ready {
            ready = cvar.wait(ready).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Blocks until resolved or `timeout` elapses. Returns readiness.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (ready, _) = cvar
            .wait_timeout_while(guard, timeout, |ready| !*ready)
            .unwrap_or_else(|e| e.into_inner());
        *ready
    }
}
