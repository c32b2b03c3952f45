//! Per-frame inputs and outputs of a tileset update.

use geotiles_math::{HorizonOccluder, Viewport};

use crate::tile::TileId;

/// Everything the host supplies for one frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameState {
    /// Monotonically increasing frame counter.
    pub frame_number: u64,
    pub viewport: Viewport,
    /// Globe to cull against; `None` for local datasets.
    pub horizon: Option<HorizonOccluder>,
}

impl FrameState {
    pub fn new(frame_number: u64, viewport: Viewport) -> Self {
        Self {
            frame_number,
            viewport,
            horizon: None,
        }
    }

    pub fn with_horizon(mut self, occluder: HorizonOccluder) -> Self {
        self.horizon = Some(occluder);
        self
    }
}

/// What changed in one update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraversalResult {
    pub frame_number: u64,
    /// Tiles to render this frame, in traversal order. All are `Ready`.
    pub selected: Vec<TileId>,
    /// Tiles the traversal wanted loaded this frame.
    pub requested: Vec<TileId>,
    /// Tiles whose content was released during this update.
    pub unloaded: Vec<TileId>,
}

impl TraversalResult {
    pub fn empty(frame_number: u64) -> Self {
        Self {
            frame_number,
            ..Default::default()
        }
    }
}
