//! Mirrors each frame's selection into a host renderer.
//!
//! [`PresentationSync`] keeps one renderable per resident tile: selected
//! tiles are created on first sight and shown, resident tiles that dropped
//! out of the selection are hidden (kept for a cheap re-show), and tiles
//! whose content was released are destroyed.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::content::{PointCloudContent, ScenegraphContent, SimpleMeshContent, TileContent};
use crate::frame::TraversalResult;
use crate::tile::{TileId, TileNode};
use crate::tileset::Tileset3D;

/// Host-side renderer of tile content, one create method per content kind.
pub trait Presenter {
    fn create_point_cloud(&mut self, tile: &TileNode, content: &PointCloudContent);
    fn create_scenegraph(&mut self, tile: &TileNode, content: &ScenegraphContent);
    fn create_simple_mesh(&mut self, tile: &TileNode, content: &SimpleMeshContent);
    fn set_visible(&mut self, tile: TileId, visible: bool);
    fn release(&mut self, tile: TileId);
}

/// Counts of presenter calls made by one sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub created: usize,
    pub shown: usize,
    pub hidden: usize,
    pub released: usize,
}

#[derive(Debug, Default)]
pub struct PresentationSync {
    /// Resident renderables and whether each is currently shown.
    entries: FxHashMap<TileId, bool>,
}

impl PresentationSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of renderables the presenter currently holds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_shown(&self, id: TileId) -> bool {
        self.entries.get(&id).copied().unwrap_or(false)
    }

    /// Applies one update's result to `presenter`.
    pub fn sync<P: Presenter + ?Sized>(
        &mut self,
        tileset: &Tileset3D,
        result: &TraversalResult,
        presenter: &mut P,
    ) -> SyncStats {
        let mut stats = SyncStats::default();

        for id in &result.unloaded {
            if self.entries.remove(id).is_some() {
                presenter.release(*id);
                stats.released += 1;
            }
        }

        for &id in &result.selected {
            if self.entries.contains_key(&id) {
                continue;
            }
            if let Some(node) = tileset.tile(id)
                && let Some(content) = node.content()
                && create(presenter, node, content)
            {
                self.entries.insert(id, true);
                stats.created += 1;
            }
        }

        let selected: FxHashSet<TileId> = result.selected.iter().copied().collect();
        self.entries.retain(|&id, shown| {
            if !tileset.tile(id).is_some_and(TileNode::is_ready) {
                presenter.release(id);
                stats.released += 1;
                return false;
            }
            let want = selected.contains(&id);
            if want != *shown {
                presenter.set_visible(id, want);
                *shown = want;
                if want {
                    stats.shown += 1;
                } else {
                    stats.hidden += 1;
                }
            }
            true
        });
        stats
    }

    /// Releases every renderable.
    pub fn clear<P: Presenter + ?Sized>(&mut self, presenter: &mut P) {
        for (id, _) in self.entries.drain() {
            presenter.release(id);
        }
    }
}

/// Dispatches on the content kind. Returns `false` for content that has
/// nothing to draw.
fn create<P: Presenter + ?Sized>(presenter: &mut P, tile: &TileNode, content: &TileContent) -> bool {
    match content {
        TileContent::PointCloud(points) => presenter.create_point_cloud(tile, points),
        TileContent::Scenegraph(scene) => presenter.create_scenegraph(tile, scene),
        TileContent::SimpleMesh(mesh) => presenter.create_simple_mesh(tile, mesh),
        TileContent::Tileset { .. } => return false,
    }
    true
}
