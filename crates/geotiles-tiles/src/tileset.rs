//! The tileset: owns the tile tree, cache, scheduler and traversal, and
//! advances them once per frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use geotiles_config::{Config, ConfigError, StreamingConfig, TilesetConfig};
use geotiles_math::{BoundingSphere, DMat4};
use rustc_hash::FxHashSet;
use tracing::{debug, info, trace, warn};

use crate::cache::TileCache;
use crate::content::{ContentDecoder, TileContent};
use crate::description::{Asset, TilesetDescription};
use crate::error::{ContentError, FetchError, TilesetError};
use crate::fetch::Fetcher;
use crate::fetch_pool::{FetchPool, LoadedContent};
use crate::frame::{FrameState, TraversalResult};
use crate::observer::{
    LoggingObserver, ReadySignal, TileLoadFailure, TilesetObserver, TilesetStatistics,
};
use crate::scheduler::RequestScheduler;
use crate::tile::{ContentState, TileId, TileNode};
use crate::traversal::{TraversalOutput, Traverser};
use crate::tree::TileTree;

/// Construction options beyond the description itself.
pub struct TilesetOptions {
    pub config: TilesetConfig,
    pub streaming: StreamingConfig,
    pub observer: Box<dyn TilesetObserver>,
}

impl Default for TilesetOptions {
    fn default() -> Self {
        Self {
            config: TilesetConfig::default(),
            streaming: StreamingConfig::default(),
            observer: Box::new(LoggingObserver),
        }
    }
}

impl TilesetOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            config: config.tileset.clone(),
            streaming: config.streaming.clone(),
            ..Default::default()
        }
    }

    pub fn with_observer(mut self, observer: impl TilesetObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }
}

pub struct Tileset3D {
    url: String,
    tree: TileTree,
    cache: TileCache,
    scheduler: RequestScheduler,
    traverser: Traverser,
    config: TilesetConfig,
    streaming: StreamingConfig,
    observer: Box<dyn TilesetObserver>,

    asset: Asset,
    geometric_error: f64,
    properties: Option<serde_json::Value>,
    extras: Option<serde_json::Value>,
    extensions_used: Vec<String>,

    ready: ReadySignal,
    selected: Vec<TileId>,
    /// Tiles with an expiry time.
    expiring: FxHashSet<TileId>,
    /// Unloads that happened outside `update`, reported by the next one.
    unloaded_since_update: Vec<TileId>,
    stats: TilesetStatistics,
    tiles_loaded: bool,
    initial_tiles_loaded: bool,
    last_frame: Option<u64>,
    created_at: Instant,
    destroyed: bool,
}

impl Tileset3D {
    /// Builds a tileset from a parsed description located at `url`.
    pub fn new(
        description: &TilesetDescription,
        url: &str,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn ContentDecoder>,
        options: TilesetOptions,
    ) -> Result<Self, TilesetError> {
        options.config.validate()?;
        options.streaming.validate()?;
        description.validate()?;

        let root_transform = DMat4::from_cols_array(&options.config.root_transform);
        let tree = TileTree::from_description(description, url, root_transform)?;
        let pool = FetchPool::new(
            options.streaming.worker_threads,
            options.streaming.max_concurrent_requests,
            fetcher,
            decoder,
        );
        let scheduler = RequestScheduler::new(pool, options.streaming.max_concurrent_requests);

        let ready = ReadySignal::new();
        ready.resolve();
        info!(url, tiles = tree.len(), "Tileset ready");

        Ok(Self {
            url: url.to_owned(),
            tree,
            cache: TileCache::new(),
            scheduler,
            traverser: Traverser::new(),
            config: options.config,
            streaming: options.streaming,
            observer: options.observer,
            asset: description.asset.clone().unwrap_or_default(),
            geometric_error: description.geometric_error,
            properties: description.properties.clone(),
            extras: description.extras.clone(),
            extensions_used: description.extensions_used.clone(),
            ready,
            selected: Vec::new(),
            expiring: FxHashSet::default(),
            unloaded_since_update: Vec::new(),
            stats: TilesetStatistics::default(),
            tiles_loaded: false,
            initial_tiles_loaded: false,
            last_frame: None,
            created_at: Instant::now(),
            destroyed: false,
        })
    }

    /// Parses `json` and builds the tileset.
    pub fn from_json(
        json: &[u8],
        url: &str,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn ContentDecoder>,
        options: TilesetOptions,
    ) -> Result<Self, TilesetError> {
        let description = TilesetDescription::from_slice(json)?;
        Self::new(&description, url, fetcher, decoder, options)
    }

    /// Fetches the description at `url` through `fetcher` and builds the tileset.
    pub fn load(
        url: &str,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn ContentDecoder>,
        options: TilesetOptions,
    ) -> Result<Self, TilesetError> {
        let fetched = fetcher.fetch(url)?;
        Self::from_json(&fetched.bytes, url, fetcher, decoder, options)
    }

    /// Advances the tileset by one frame: applies finished loads, expires
    /// stale content, selects tiles, issues requests and trims the cache.
    ///
    /// Calling it again with the same frame number selects against the
    /// content as it stood after the first call.
    pub fn update(&mut self, frame: &FrameState) -> TraversalResult {
        let frame_number = frame.frame_number;
        if self.destroyed {
            return TraversalResult::empty(frame_number);
        }
        if self.last_frame == Some(frame_number) {
            return self.reselect(frame);
        }

        let mut unloaded = std::mem::take(&mut self.unloaded_since_update);
        self.apply_completions(&mut unloaded);
        self.expire_due(Instant::now(), &mut unloaded);

        let output = self
            .traverser
            .traverse(&mut self.tree, &self.config, frame)
            .clone();
        self.mark_selected(&output.selected, frame_number);

        for &(id, priority) in &output.requests {
            self.prepare_request(id, &mut unloaded);
            if let Some(node) = self.tree.get(id) {
                self.scheduler.enqueue(node, priority);
            }
        }
        self.scheduler.flush(&mut self.tree, frame_number);
        self.scheduler.cancel_stale(
            &mut self.tree,
            frame_number,
            self.streaming.cancel_after_frames,
        );

        self.trim(self.config.maximum_memory_usage_bytes, frame_number, &mut unloaded);
        self.update_statistics(frame_number, &output);

        self.selected.clone_from(&output.selected);
        self.last_frame = Some(frame_number);
        TraversalResult {
            frame_number,
            selected: output.selected,
            requested: output.requests.iter().map(|(id, _)| *id).collect(),
            unloaded,
        }
    }

    /// Repeats the traversal of the current frame. Completions, expiry,
    /// requests and trimming wait for the next frame.
    fn reselect(&mut self, frame: &FrameState) -> TraversalResult {
        let frame_number = frame.frame_number;
        let output = self
            .traverser
            .traverse(&mut self.tree, &self.config, frame)
            .clone();
        self.mark_selected(&output.selected, frame_number);
        trace!(frame = frame_number, "Repeated update within a frame");

        self.selected.clone_from(&output.selected);
        TraversalResult {
            frame_number,
            selected: output.selected,
            requested: output.requests.iter().map(|(id, _)| *id).collect(),
            unloaded: std::mem::take(&mut self.unloaded_since_update),
        }
    }

    /// Stamps the selection as used. Each tile is reported visible once per frame.
    fn mark_selected(&mut self, selected: &[TileId], frame_number: u64) {
        for &id in selected {
            if let Some(node) = self.tree.get_mut(id) {
                let first_this_frame = node.last_selected_frame != Some(frame_number);
                node.last_selected_frame = Some(frame_number);
                self.cache.mark_used(id, frame_number);
                if first_this_frame {
                    self.observer.on_tile_visible(node);
                }
            }
        }
    }

    fn apply_completions(&mut self, unloaded: &mut Vec<TileId>) {
        for (done, record) in self.scheduler.drain() {
            let id = done.id;
            let expires_at = done.expire_after.map(|d| Instant::now() + d);
            match done.outcome {
                Ok(LoadedContent::Decoded(decoded)) => {
                    let Some(node) = self.tree.get_mut(id) else {
                        continue;
                    };
                    if node.content_state() != ContentState::Loading {
                        continue;
                    }
                    let bytes = decoded.byte_size;
                    node.set_ready(decoded.content, bytes, expires_at);
                    self.cache.insert(id, bytes, node.last_selected_frame);
                    if expires_at.is_some() {
                        self.expiring.insert(id);
                    }
                    debug!(%id, url = %record.url, bytes, "Tile loaded");
                    self.observer.on_tile_load(node);
                }
                Ok(LoadedContent::Tileset(description)) => {
                    if let Err(e) = self.tree.attach_subtree(id, &description) {
                        self.fail(id, &record.url, &ContentError::from(e));
                        continue;
                    }
                    let Some(node) = self.tree.get_mut(id) else {
                        continue;
                    };
                    let tile_count = description.tile_count();
                    node.set_ready(TileContent::Tileset { tile_count }, 0, expires_at);
                    if expires_at.is_some() {
                        self.expiring.insert(id);
                    }
                    debug!(%id, url = %record.url, tile_count, "External tileset loaded");
                    self.observer.on_tile_load(node);
                }
                Err(ContentError::Fetch(FetchError::Stale)) => {
                    if self.tree.get(id).is_some_and(TileNode::has_tileset_content) {
                        self.destroy_subtree(id, false, unloaded);
                    }
                    if let Some(node) = self.tree.get_mut(id) {
                        node.expire();
                    }
                    debug!(%id, url = %record.url, "Content stale, subtree discarded");
                }
                Err(ContentError::Fetch(FetchError::Cancelled)) => {
                    if let Some(node) = self.tree.get_mut(id) {
                        node.cancel_request();
                    }
                }
                Err(e) => self.fail(id, &record.url, &e),
            }
        }
    }

    fn fail(&mut self, id: TileId, url: &str, error: &ContentError) {
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        node.set_failed();
        warn!(%id, url, error = %error, "Tile load failed");
        self.observer.on_tile_load_failed(&TileLoadFailure {
            tile: id,
            url: url.to_owned(),
            message: error.to_string(),
        });
    }

    /// Readies a tile the traversal wants loaded.
    fn prepare_request(&mut self, id: TileId, unloaded: &mut Vec<TileId>) {
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        match node.content_state() {
            ContentState::Failed if self.config.retry_failed_tiles => {
                node.reset_failed();
            }
            ContentState::Expired if node.has_tileset_content() && !node.is_leaf() => {
                self.destroy_subtree(id, false, unloaded);
            }
            _ => {}
        }
    }

    fn expire_due(&mut self, now: Instant, unloaded: &mut Vec<TileId>) {
        let due: Vec<TileId> = self
            .expiring
            .iter()
            .copied()
            .filter(|&id| {
                self.tree
                    .get(id)
                    .and_then(TileNode::expires_at)
                    .is_none_or(|at| at <= now)
            })
            .collect();
        for id in due {
            self.expire(id, unloaded);
        }
    }

    fn expire(&mut self, id: TileId, unloaded: &mut Vec<TileId>) -> bool {
        self.expiring.remove(&id);
        let Some(node) = self.tree.get_mut(id) else {
            return false;
        };
        if !node.is_ready() {
            return false;
        }
        if self.cache.remove(id).is_some() {
            self.observer.on_tile_unload(node);
            unloaded.push(id);
        }
        node.expire();
        debug!(%id, "Tile content expired");
        true
    }

    /// Removes the descendants of `id` (and `id` itself with
    /// `include_root`), children before parents.
    fn destroy_subtree(&mut self, id: TileId, include_root: bool, unloaded: &mut Vec<TileId>) {
        for node in self.tree.destroy_subtree(id, include_root) {
            let removed = node.id();
            self.scheduler.cancel(removed);
            self.expiring.remove(&removed);
            if self.cache.remove(removed).is_some() {
                self.observer.on_tile_unload(&node);
                unloaded.push(removed);
            }
        }
    }

    fn trim(&mut self, budget: u64, frame_number: u64, unloaded: &mut Vec<TileId>) {
        let tree = &mut self.tree;
        let observer = &mut self.observer;
        let expiring = &mut self.expiring;
        self.cache.trim(budget, frame_number, |id| {
            if let Some(node) = tree.get_mut(id) {
                observer.on_tile_unload(node);
                node.unload_content();
            }
            expiring.remove(&id);
            unloaded.push(id);
        });
    }

    fn update_statistics(&mut self, frame_number: u64, output: &TraversalOutput) {
        let previous = self.stats;
        let pending = self.scheduler.deferred_count();
        let in_flight = self.scheduler.in_flight_count();
        self.stats = TilesetStatistics {
            frame_number,
            visited: output.visited,
            culled: output.culled,
            selected: output.selected.len(),
            requested: output.requests.len(),
            pending_requests: pending,
            in_flight_requests: in_flight,
            resident_tiles: self.cache.len(),
            resident_bytes: self.cache.total_bytes(),
            failed_tiles: self
                .tree
                .iter()
                .filter(|n| n.content_state() == ContentState::Failed)
                .count(),
            total_tiles: self.tree.len(),
        };
        trace!(stats = ?self.stats, "Frame statistics");

        if (previous.pending_requests, previous.in_flight_requests) != (pending, in_flight) {
            self.observer.on_load_progress(&self.stats);
        }

        let settled = output.desired.iter().all(|&id| {
            self.tree.get(id).is_some_and(|n| {
                matches!(n.content_state(), ContentState::Ready | ContentState::Failed)
            })
        });
        let loaded = settled && pending == 0 && in_flight == 0;
        if loaded && !self.tiles_loaded {
            self.observer.on_all_tiles_loaded();
            if !self.initial_tiles_loaded {
                self.initial_tiles_loaded = true;
                self.observer.on_initial_tiles_loaded();
            }
        }
        self.tiles_loaded = loaded;
    }

    /// Evicts every loaded tile not selected in the last frame.
    pub fn trim_loaded_tiles(&mut self) {
        let frame = self.last_frame.unwrap_or(u64::MAX);
        let mut unloaded = std::mem::take(&mut self.unloaded_since_update);
        self.trim(0, frame, &mut unloaded);
        self.unloaded_since_update = unloaded;
    }

    /// Drops a tile's content now, as if it had expired. Traversal requests
    /// it again when still wanted.
    pub fn expire_tile(&mut self, id: TileId) -> bool {
        let mut unloaded = std::mem::take(&mut self.unloaded_since_update);
        let expired = self.expire(id, &mut unloaded);
        self.unloaded_since_update = unloaded;
        expired
    }

    /// Makes a failed tile eligible for another request.
    pub fn retry_tile(&mut self, id: TileId) -> bool {
        self.tree.get_mut(id).is_some_and(TileNode::reset_failed)
    }

    /// Makes every failed tile eligible again. Returns how many were reset.
    pub fn retry_failed(&mut self) -> usize {
        let failed: Vec<TileId> = self
            .tree
            .iter()
            .filter(|n| n.content_state() == ContentState::Failed)
            .map(TileNode::id)
            .collect();
        failed.into_iter().filter(|&id| self.retry_tile(id)).count()
    }

    /// Releases every tile (children before parents) and stops the
    /// workers. Calling it again does nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.scheduler.shutdown();
        for node in self.tree.clear() {
            if self.cache.remove(node.id()).is_some() {
                self.observer.on_tile_unload(&node);
            }
        }
        self.cache.clear();
        self.selected.clear();
        self.expiring.clear();
        self.unloaded_since_update.clear();
        self.tiles_loaded = false;
        self.destroyed = true;
        info!(url = %self.url, "Tileset destroyed");
    }

    pub fn set_maximum_screen_space_error(&mut self, value: f64) -> Result<(), ConfigError> {
        self.config.set_maximum_screen_space_error(value)
    }

    pub fn set_maximum_memory_usage_bytes(&mut self, value: u64) -> Result<(), ConfigError> {
        self.config.set_maximum_memory_usage_bytes(value)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    pub fn ready_signal(&self) -> ReadySignal {
        self.ready.clone()
    }

    /// Every desired tile is settled and no requests are outstanding.
    pub fn tiles_loaded(&self) -> bool {
        self.tiles_loaded
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn root(&self) -> Option<&TileNode> {
        self.tree.get(self.tree.root()?)
    }

    pub fn tile(&self, id: TileId) -> Option<&TileNode> {
        self.tree.get(id)
    }

    pub fn tiles(&self) -> impl Iterator<Item = &TileNode> {
        self.tree.iter()
    }

    /// Tiles rendered by the last update.
    pub fn selected_tiles(&self) -> &[TileId] {
        &self.selected
    }

    pub fn bounding_sphere(&self) -> Option<BoundingSphere> {
        self.root().map(|r| r.bounding_volume().bounding_sphere())
    }

    pub fn config(&self) -> &TilesetConfig {
        &self.config
    }

    pub fn streaming(&self) -> &StreamingConfig {
        &self.streaming
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn geometric_error(&self) -> f64 {
        self.geometric_error
    }

    pub fn properties(&self) -> Option<&serde_json::Value> {
        self.properties.as_ref()
    }

    pub fn extras(&self) -> Option<&serde_json::Value> {
        self.extras.as_ref()
    }

    pub fn extensions_used(&self) -> &[String] {
        &self.extensions_used
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions_used.iter().any(|e| e == name)
    }

    pub fn total_memory_usage_bytes(&self) -> u64 {
        self.cache.total_bytes()
    }

    pub fn statistics(&self) -> &TilesetStatistics {
        &self.stats
    }

    pub fn time_since_load(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl Drop for Tileset3D {
    fn drop(&mut self) {
        self.destroy();
    }
}
