//! Hierarchical tileset streaming: tile tree, per-frame level-of-detail
//! traversal, content cache, and prioritized background loading.
//!
//! A [`Tileset3D`] is built from a tileset description and advanced once per
//! frame with [`Tileset3D::update`]. Content is fetched and decoded on worker
//! threads through the host-supplied [`Fetcher`] and [`ContentDecoder`];
//! results are applied on the calling thread, so observers and presenters
//! never see concurrent access.

mod cache;
mod content;
mod description;
mod error;
mod fetch;
mod fetch_pool;
mod frame;
mod observer;
mod presenter;
mod scheduler;
mod tile;
mod tileset;
mod traversal;
mod tree;


pub use cache::{TileCache, TrimOutcome};
pub use content::{
    ContentDecoder, ContentKind, DecodedContent, PointCloudContent, ScenegraphContent,
    SimpleMeshContent, TileContent, TileMetadata,
};
pub use description::{
    Asset, BoundingVolumeDescription, ContentDescription, LodSelection, SUPPORTED_VERSIONS,
    TileDescription, TilesetDescription, base_path, resolve_url,
};
pub use error::{ContentError, DecodeError, FetchError, TilesetError};
pub use fetch::{FetchedContent, Fetcher, FileFetcher};
pub use fetch_pool::{FetchCompletion, FetchPool, FetchTask, LoadedContent};
pub use frame::{FrameState, TraversalResult};
pub use observer::{
    LoggingObserver, ReadySignal, TileLoadFailure, TilesetObserver, TilesetStatistics,
};
pub use presenter::{PresentationSync, Presenter, SyncStats};
pub use scheduler::{RequestRecord, RequestScheduler};
pub use tile::{
    ContentState, LodMetric, Refinement, TileId, TileNode, TileSpec, is_tileset_url,
};
pub use tileset::{Tileset3D, TilesetOptions};
pub use traversal::{LodDecision, LodJudge, TraversalOutput, Traverser};
pub use tree::TileTree;
