//! Logging stand-ins for a renderer and a host application.

use geotiles_tiles::{
    PointCloudContent, Presenter, ScenegraphContent, SimpleMeshContent, TileId, TileLoadFailure,
    TileNode, TilesetObserver, TilesetStatistics,
};
use tracing::{debug, info, warn};

/// Counts renderables instead of drawing them.
#[derive(Debug, Default)]
pub struct LoggingPresenter {
    created: usize,
    released: usize,
    points: usize,
}

impl LoggingPresenter {
    pub fn created(&self) -> usize {
        self.created
    }

    pub fn released(&self) -> usize {
        self.released
    }
}

impl Presenter for LoggingPresenter {
    fn create_point_cloud(&mut self, tile: &TileNode, content: &PointCloudContent) {
        self.created += 1;
        self.points += content.point_count();
        debug!(tile = %tile.id(), points = content.point_count(), "Create point cloud");
    }

    fn create_scenegraph(&mut self, tile: &TileNode, content: &ScenegraphContent) {
        self.created += 1;
        debug!(tile = %tile.id(), bytes = content.gltf.len(), "Create scenegraph");
    }

    fn create_simple_mesh(&mut self, tile: &TileNode, content: &SimpleMeshContent) {
        self.created += 1;
        debug!(tile = %tile.id(), triangles = content.triangle_count(), "Create mesh");
    }

    fn set_visible(&mut self, tile: TileId, visible: bool) {
        debug!(%tile, visible, "Set visibility");
    }

    fn release(&mut self, tile: TileId) {
        self.released += 1;
        debug!(%tile, total_points = self.points, "Release");
    }
}

/// Reports load milestones.
#[derive(Debug, Default)]
pub struct ProgressObserver {
    loads: usize,
    unloads: usize,
}

impl TilesetObserver for ProgressObserver {
    fn on_tile_load(&mut self, _tile: &TileNode) {
        self.loads += 1;
    }

    fn on_tile_unload(&mut self, _tile: &TileNode) {
        self.unloads += 1;
    }

    fn on_tile_load_failed(&mut self, failure: &TileLoadFailure) {
        warn!(tile = %failure.tile, url = %failure.url, "Tile failed: {}", failure.message);
    }

    fn on_load_progress(&mut self, stats: &TilesetStatistics) {
        debug!(
            pending = stats.pending_requests,
            in_flight = stats.in_flight_requests,
            "Load progress"
        );
    }

    fn on_all_tiles_loaded(&mut self) {
        debug!(loads = self.loads, unloads = self.unloads, "All tiles loaded");
    }

    fn on_initial_tiles_loaded(&mut self) {
        info!(loads = self.loads, "Initial tiles loaded");
    }
}
