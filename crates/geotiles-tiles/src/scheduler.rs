//! Per-frame request prioritization, concurrency limiting and cancellation.
//!
//! Traversal enqueues tiles that need content; at the end of the frame the
//! queue is flushed in priority order (lowest value first, shallower tiles
//! first on ties) until the concurrency limit is hit. Whatever is left is
//! dropped and will be re-enqueued by the next traversal if still wanted,
//! so the queue never holds requests for tiles the camera moved away from.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::content::TileMetadata;
use crate::fetch_pool::{FetchCompletion, FetchPool, FetchTask};
use crate::tile::{ContentState, TileId, TileNode};
use crate::tree::TileTree;

#[derive(Clone, Debug)]
struct PendingRequest {
    id: TileId,
    priority: f64,
    depth: u32,
    seq: u64,
}

impl PartialEq for PendingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingRequest {}

impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingRequest {
    /// Max-heap order: the "greatest" entry is the one to issue next.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.depth.cmp(&self.depth))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// An issued request awaiting completion.
#[derive(Clone, Debug)]
pub struct RequestRecord {
    pub id: TileId,
    pub request_id: u64,
    pub priority: f64,
    pub url: String,
    pub issued_frame: u64,
}

pub struct RequestScheduler {
    pending: BinaryHeap<PendingRequest>,
    queued: FxHashSet<TileId>,
    records: FxHashMap<TileId, RequestRecord>,
    pool: FetchPool,
    max_concurrent: usize,
    next_request_id: u64,
    next_seq: u64,
    deferred: usize,
}

impl RequestScheduler {
    pub fn new(pool: FetchPool, max_concurrent: usize) -> Self {
        Self {
            pending: BinaryHeap::new(),
            queued: FxHashSet::default(),
            records: FxHashMap::default(),
            pool,
            max_concurrent: max_concurrent.max(1),
            next_request_id: 0,
            next_seq: 0,
            deferred: 0,
        }
    }

    /// Queues a content request for this frame. Tiles that are loading,
    /// ready, failed, empty, or already queued are skipped.
    pub fn enqueue(&mut self, node: &TileNode, priority: f64) -> bool {
        if node.is_empty()
            || !matches!(
                node.content_state(),
                ContentState::Unloaded | ContentState::Expired
            )
            || self.records.contains_key(&node.id())
            || !self.queued.insert(node.id())
        {
            return false;
        }
        self.pending.push(PendingRequest {
            id: node.id(),
            priority,
            depth: node.depth(),
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    /// Issues queued requests in priority order while capacity remains and
    /// clears the queue. Returns the tiles whose requests were issued.
    pub fn flush(&mut self, tree: &mut TileTree, frame: u64) -> Vec<TileId> {
        let mut issued = Vec::new();
        while let Some(request) = self.pending.pop() {
            if self.records.len() >= self.max_concurrent {
                self.pending.push(request);
                break;
            }
            let Some(node) = tree.get_mut(request.id) else {
                continue;
            };
            let Some(url) = node.content_url().map(str::to_owned) else {
                continue;
            };
            if !node.request_content() {
                continue;
            }

            let request_id = self.next_request_id;
            self.next_request_id += 1;
            let task = FetchTask {
                id: node.id(),
                request_id,
                url: url.clone(),
                metadata: TileMetadata {
                    id: node.id(),
                    url: url.clone(),
                    depth: node.depth(),
                    geometric_error: node.geometric_error(),
                    refine: node.refine(),
                    bounding_volume: *node.bounding_volume(),
                },
                is_tileset: node.has_tileset_content(),
            };
            match self.pool.submit(task) {
                Ok(()) => {
                    node.priority = request.priority;
                    self.records.insert(
                        request.id,
                        RequestRecord {
                            id: request.id,
                            request_id,
                            priority: request.priority,
                            url,
                            issued_frame: frame,
                        },
                    );
                    issued.push(request.id);
                }
                Err(_) => {
                    node.cancel_request();
                    break;
                }
            }
        }

        self.deferred = self.pending.len();
        if self.deferred > 0 {
            trace!(deferred = self.deferred, "Request limit reached");
        }
        self.pending.clear();
        self.queued.clear();
        issued
    }

    /// Completions of current requests, paired with their records.
    pub fn drain(&mut self) -> Vec<(FetchCompletion, RequestRecord)> {
        self.pool
            .drain_results()
            .into_iter()
            .filter_map(|done| {
                let current = self.records.get(&done.id)?.request_id == done.request_id;
                let record = if current { self.records.remove(&done.id) } else { None }?;
                Some((done, record))
            })
            .collect()
    }

    /// Cancels the outstanding request for `id`. The caller reverts the
    /// tile's state.
    pub fn cancel(&mut self, id: TileId) -> bool {
        self.pool.cancel(id);
        self.records.remove(&id).is_some()
    }

    /// Cancels requests for tiles not visited in the last `after_frames`
    /// frames, or no longer in the tree, reverting them to `Unloaded`.
    pub fn cancel_stale(&mut self, tree: &mut TileTree, frame: u64, after_frames: u64) -> Vec<TileId> {
        let stale: Vec<TileId> = self
            .records
            .keys()
            .copied()
            .filter(|&id| {
                tree.get(id).is_none_or(|node| {
                    node.last_visited_frame
                        .is_none_or(|visited| frame.saturating_sub(visited) > after_frames)
                })
            })
            .collect();
        for &id in &stale {
            self.cancel(id);
            if let Some(node) = tree.get_mut(id) {
                node.cancel_request();
            }
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "Cancelled requests for tiles out of view");
        }
        stale
    }

    pub fn is_requested(&self, id: TileId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn record(&self, id: TileId) -> Option<&RequestRecord> {
        self.records.get(&id)
    }

    /// Issued requests not yet completed.
    pub fn in_flight_count(&self) -> usize {
        self.records.len()
    }

    /// Requests left unissued by the last flush.
    pub fn deferred_count(&self) -> usize {
        self.deferred
    }

    pub fn set_max_concurrent(&mut self, max_concurrent: usize) {
        self.max_concurrent = max_concurrent.max(1);
    }

    /// Cancels everything and stops the workers.
    pub fn shutdown(&mut self) {
        for id in self.records.keys() {
            self.pool.cancel(*id);
        }
        self.records.clear();
        self.pending.clear();
        self.queued.clear();
        self.deferred = 0;
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use geotiles_math::DMat4;

    use super::*;
    use crate::content::{ContentDecoder, DecodedContent, PointCloudContent, TileContent};
    use crate::description::{
        Asset, BoundingVolumeDescription, ContentDescription, TileDescription, TilesetDescription,
    };
    use crate::error::FetchError;
    use crate::fetch::{FetchedContent, Fetcher};

    /// Records the order in which URLs are fetched.
    #[derive(Default)]
    struct RecordingFetcher {
        urls: Mutex<Vec<String>>,
    }

    impl Fetcher for RecordingFetcher {
        fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
            if let Ok(mut urls) = self.urls.lock() {
                urls.push(url.to_owned());
            }
            Ok(FetchedContent::new(vec![0; 10]))
        }
    }

    fn decoder() -> Arc<dyn ContentDecoder> {
        Arc::new(|bytes: &[u8], _: &TileMetadata| {
            Ok(DecodedContent::with_byte_size(
                TileContent::PointCloud(PointCloudContent::default()),
                bytes.len() as u64,
            ))
        })
    }

    fn tile(uri: &str, children: Vec<TileDescription>) -> TileDescription {
        TileDescription {
            bounding_volume: BoundingVolumeDescription {
                sphere: Some(vec![0.0, 0.0, 0.0, 1.0]),
                ..Default::default()
            },
            geometric_error: 1.0,
            content: Some(ContentDescription {
                uri: Some(uri.into()),
                url: None,
            }),
            children,
            ..Default::default()
        }
    }

    /// Root with four leaf children: ids 0 (root), 1..=4.
    fn tree() -> TileTree {
        let description = TilesetDescription {
            asset: Some(Asset {
                version: Some("1.0".into()),
                ..Default::default()
            }),
            root: Some(tile(
                "r",
                vec![tile("a", vec![]), tile("b", vec![]), tile("c", vec![]), tile("d", vec![])],
            )),
            ..Default::default()
        };
        TileTree::from_description(&description, "", DMat4::IDENTITY).unwrap()
    }

    fn scheduler(fetcher: Arc<RecordingFetcher>, max: usize) -> RequestScheduler {
        RequestScheduler::new(FetchPool::new(0, 64, fetcher, decoder()), max)
    }

    #[test]
    fn test_flush_orders_by_priority_then_depth() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let mut sched = scheduler(Arc::clone(&fetcher), 8);
        let mut tree = tree();
        for (id, priority) in [(1, 30.0), (2, 10.0), (0, 10.0), (3, 20.0)] {
            let node = tree.get(TileId(id)).unwrap();
            assert!(sched.enqueue(node, priority));
        }
        let issued = sched.flush(&mut tree, 1);
        assert_eq!(issued, vec![TileId(0), TileId(2), TileId(3), TileId(1)]);
        assert_eq!(*fetcher.urls.lock().unwrap(), vec!["r", "b", "c", "a"]);
        assert_eq!(tree.get(TileId(2)).unwrap().content_state(), ContentState::Loading);
    }

    /// Excess requests stay unloaded and are not remembered.
    #[test]
    fn test_limit_defers_lowest_priority() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let mut sched = scheduler(fetcher, 2);
        let mut tree = tree();
        for id in 1..=4 {
            let node = tree.get(TileId(id)).unwrap();
            sched.enqueue(node, f64::from(id));
        }
        let issued = sched.flush(&mut tree, 1);
        assert_eq!(issued, vec![TileId(1), TileId(2)]);
        assert_eq!(sched.deferred_count(), 2);
        assert_eq!(tree.get(TileId(4)).unwrap().content_state(), ContentState::Unloaded);
        assert_eq!(sched.in_flight_count(), 2);

        // Nothing is issued while the limit is reached.
        let node = tree.get(TileId(3)).unwrap();
        sched.enqueue(node, 0.0);
        assert!(sched.flush(&mut tree, 2).is_empty());
    }

    #[test]
    fn test_enqueue_rejects_duplicates_and_loading() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let mut sched = scheduler(fetcher, 8);
        let mut tree = tree();
        let node = tree.get(TileId(1)).unwrap();
        assert!(sched.enqueue(node, 1.0));
        assert!(!sched.enqueue(node, 1.0));
        sched.flush(&mut tree, 1);
        let node = tree.get(TileId(1)).unwrap();
        assert!(!sched.enqueue(node, 1.0), "already loading");
    }

    #[test]
    fn test_drain_pairs_records() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let mut sched = scheduler(fetcher, 8);
        let mut tree = tree();
        sched.enqueue(tree.get(TileId(1)).unwrap(), 5.0);
        sched.flush(&mut tree, 3);
        let done = sched.drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].1.priority, 5.0);
        assert_eq!(done[0].1.issued_frame, 3);
        assert_eq!(sched.in_flight_count(), 0);
    }

    #[test]
    fn test_cancel_stale_reverts_state() {
        let fetcher = Arc::new(RecordingFetcher::default());
        let mut sched = scheduler(fetcher, 8);
        let mut tree = tree();
        tree.get_mut(TileId(1)).unwrap().last_visited_frame = Some(1);
        tree.get_mut(TileId(2)).unwrap().last_visited_frame = Some(9);
        sched.enqueue(tree.get(TileId(1)).unwrap(), 1.0);
        sched.enqueue(tree.get(TileId(2)).unwrap(), 1.0);
        sched.flush(&mut tree, 1);

        let cancelled = sched.cancel_stale(&mut tree, 10, 4);
        assert_eq!(cancelled, vec![TileId(1)]);
        assert_eq!(tree.get(TileId(1)).unwrap().content_state(), ContentState::Unloaded);
        assert_eq!(tree.get(TileId(2)).unwrap().content_state(), ContentState::Loading);

        let done = sched.drain();
        assert_eq!(done.len(), 1, "cancelled completion is discarded");
        assert_eq!(done[0].0.id, TileId(2));
    }
}
