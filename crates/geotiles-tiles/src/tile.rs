//! A single node of the tile hierarchy: its static description plus the
//! runtime state the engine tracks for it.

use std::fmt;
use std::time::Instant;

use geotiles_math::{BoundingSphere, BoundingVolume, DMat4, Frustum, HorizonCuller, Viewport};
use serde::{Deserialize, Serialize};

use crate::content::{ContentKind, TileContent};

/// Arena handle of a tile. Ids are never reused within a tileset, so a
/// completion for a destroyed tile can always be told apart from a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(pub u32);

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile#{}", self.0)
    }
}

/// How children relate to their parent when refining.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refinement {
    /// Children are rendered in addition to the parent.
    #[serde(rename = "ADD", alias = "add", alias = "Add")]
    Add,
    /// Children replace the parent once refined.
    #[default]
    #[serde(rename = "REPLACE", alias = "replace", alias = "Replace")]
    Replace,
}

/// Lifecycle of a tile's payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContentState {
    #[default]
    Unloaded,
    Loading,
    Ready,
    Failed,
    /// Content was dropped because it outlived its expiry; eligible for refetch.
    Expired,
}

/// How a tile decides whether it is detailed enough.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LodMetric {
    /// Project the geometric error to pixels and compare against the
    /// maximum screen-space error.
    GeometricError,
    /// Draw once the projected diameter of the bounding sphere drops below
    /// this many pixels.
    MaxScreenThreshold(f64),
}

/// Static description of a tile as built from the tileset description.
#[derive(Clone, Debug)]
pub struct TileSpec {
    pub bounding_volume: BoundingVolume,
    pub geometric_error: f64,
    pub lod_metric: LodMetric,
    pub refine: Refinement,
    pub content_url: Option<String>,
    pub transform: DMat4,
}

/// A node in the tile tree.
#[derive(Debug)]
pub struct TileNode {
    id: TileId,
    parent: Option<TileId>,
    pub(crate) children: Vec<TileId>,
    depth: u32,
    spec: TileSpec,
    /// Sphere around every descendant's volume; `None` for leaves.
    pub(crate) descendant_bounds: Option<BoundingSphere>,

    state: ContentState,
    content: Option<TileContent>,
    byte_size: u64,
    expires_at: Option<Instant>,

    /// Frame in which the tile was last part of the rendered selection.
    pub last_selected_frame: Option<u64>,
    /// Frame in which traversal last reached the tile.
    pub last_visited_frame: Option<u64>,
    /// Request priority computed during the last traversal; lower loads first.
    pub priority: f64,
    pub distance_to_camera: f64,
    /// Screen-space error, or projected diameter for threshold-metric tiles.
    pub screen_space_error: f64,
}

impl TileNode {
    pub(crate) fn new(id: TileId, parent: Option<TileId>, depth: u32, spec: TileSpec) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            depth,
            spec,
            descendant_bounds: None,
            state: ContentState::Unloaded,
            content: None,
            byte_size: 0,
            expires_at: None,
            last_selected_frame: None,
            last_visited_frame: None,
            priority: 0.0,
            distance_to_camera: f64::INFINITY,
            screen_space_error: 0.0,
        }
    }

    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn parent(&self) -> Option<TileId> {
        self.parent
    }

    pub fn children(&self) -> &[TileId] {
        &self.children
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn bounding_volume(&self) -> &BoundingVolume {
        &self.spec.bounding_volume
    }

    pub fn geometric_error(&self) -> f64 {
        self.spec.geometric_error
    }

    pub fn lod_metric(&self) -> LodMetric {
        self.spec.lod_metric
    }

    pub fn refine(&self) -> Refinement {
        self.spec.refine
    }

    pub fn content_url(&self) -> Option<&str> {
        self.spec.content_url.as_deref()
    }

    /// World transform of the tile (root transform composed down the tree).
    pub fn transform(&self) -> &DMat4 {
        &self.spec.transform
    }

    pub fn content_state(&self) -> ContentState {
        self.state
    }

    pub fn content(&self) -> Option<&TileContent> {
        self.content.as_ref()
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn is_ready(&self) -> bool {
        self.state == ContentState::Ready
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// A tile without a content reference only organizes its children.
    pub fn is_empty(&self) -> bool {
        self.spec.content_url.is_none()
    }

    /// Whether the content reference points at another tileset description.
    pub fn has_tileset_content(&self) -> bool {
        self.spec
            .content_url
            .as_deref()
            .is_some_and(is_tileset_url)
    }

    /// Whether the tile carries drawable content (not empty, not a nested tileset).
    pub fn has_renderable_content(&self) -> bool {
        !self.is_empty() && !self.has_tileset_content()
    }

    pub fn content_kind(&self) -> Option<ContentKind> {
        self.content.as_ref().map(TileContent::kind)
    }

    /// Camera distance to the bounding volume, zero when inside it.
    pub fn distance_to(&self, viewport: &Viewport) -> f64 {
        self.spec.bounding_volume.distance_to(viewport.position)
    }

    /// Projects this tile's error metric to pixels.
    ///
    /// For [`LodMetric::GeometricError`] this is the classic screen-space
    /// error; for [`LodMetric::MaxScreenThreshold`] it is the projected
    /// diameter of the bounding sphere.
    pub fn compute_sse(&self, viewport: &Viewport) -> f64 {
        let distance = self.distance_to(viewport);
        match self.spec.lod_metric {
            LodMetric::GeometricError => {
                viewport.screen_space_error(self.spec.geometric_error, distance)
            }
            LodMetric::MaxScreenThreshold(_) => {
                let radius = self.spec.bounding_volume.bounding_sphere().radius;
                viewport.projected_diameter(radius, distance)
            }
        }
    }

    pub fn descendant_bounds(&self) -> Option<&BoundingSphere> {
        self.descendant_bounds.as_ref()
    }

    /// This tile's volume joined with its descendant bounds.
    pub fn subtree_bounds(&self) -> BoundingSphere {
        let own = self.spec.bounding_volume.bounding_sphere();
        match &self.descendant_bounds {
            Some(below) => own.union(below),
            None => own,
        }
    }

    /// Frustum (and optional horizon) test of this tile's own volume.
    pub fn is_visible(&self, frustum: &Frustum, horizon: Option<&HorizonCuller>) -> bool {
        volume_visible(&self.spec.bounding_volume, frustum, horizon)
    }

    /// Whether anything below this tile could be visible. Conservative: the
    /// test runs against a sphere around all descendants.
    pub fn descendants_visible(&self, frustum: &Frustum, horizon: Option<&HorizonCuller>) -> bool {
        self.descendant_bounds
            .is_some_and(|sphere| volume_visible(&BoundingVolume::Sphere(sphere), frustum, horizon))
    }

    /// Moves `Unloaded` or `Expired` content to `Loading`.
    ///
    /// Returns `false` (and changes nothing) when content is already
    /// loading, ready, or failed.
    pub fn request_content(&mut self) -> bool {
        match self.state {
            ContentState::Unloaded | ContentState::Expired => {
                self.state = ContentState::Loading;
                true
            }
            ContentState::Loading | ContentState::Ready | ContentState::Failed => false,
        }
    }

    /// Releases the payload and returns to `Unloaded`. Idempotent.
    pub fn unload_content(&mut self) {
        if matches!(self.state, ContentState::Ready | ContentState::Failed) {
            self.state = ContentState::Unloaded;
        }
        self.content = None;
        self.byte_size = 0;
        self.expires_at = None;
    }

    /// Drops ready content because it outlived its expiry.
    pub(crate) fn expire(&mut self) -> bool {
        if matches!(self.state, ContentState::Ready | ContentState::Loading) {
            self.state = ContentState::Expired;
            self.content = None;
            self.byte_size = 0;
            self.expires_at = None;
            true
        } else {
            false
        }
    }

    /// Reverts an outstanding request that will never complete.
    pub(crate) fn cancel_request(&mut self) {
        if self.state == ContentState::Loading {
            self.state = ContentState::Unloaded;
        }
    }

    /// Makes a failed tile eligible for another request.
    pub(crate) fn reset_failed(&mut self) -> bool {
        if self.state == ContentState::Failed {
            self.state = ContentState::Unloaded;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_ready(
        &mut self,
        content: TileContent,
        byte_size: u64,
        expires_at: Option<Instant>,
    ) {
        self.state = ContentState::Ready;
        self.content = Some(content);
        self.byte_size = byte_size;
        self.expires_at = expires_at;
    }

    pub(crate) fn set_failed(&mut self) {
        self.state = ContentState::Failed;
        self.content = None;
        self.byte_size = 0;
    }
}

/// URLs ending in `.json` (ignoring query and fragment) reference external tilesets.
pub fn is_tileset_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".json")
}

fn volume_visible(
    volume: &BoundingVolume,
    frustum: &Frustum,
    horizon: Option<&HorizonCuller>,
) -> bool {
    if !frustum.is_visible(volume) {
        return false;
    }
    match horizon {
        Some(culler) => {
            let sphere = volume.bounding_sphere();
            culler.is_above_horizon(sphere.center, sphere.radius)
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotiles_math::{BoundingSphere, DVec3};

    use crate::content::PointCloudContent;

    fn node(url: Option<&str>) -> TileNode {
        TileNode::new(
            TileId(0),
            None,
            0,
            TileSpec {
                bounding_volume: BoundingVolume::Sphere(BoundingSphere::new(DVec3::ZERO, 10.0)),
                geometric_error: 4.0,
                lod_metric: LodMetric::GeometricError,
                refine: Refinement::Replace,
                content_url: url.map(str::to_owned),
                transform: DMat4::IDENTITY,
            },
        )
    }

    fn points() -> TileContent {
        TileContent::PointCloud(PointCloudContent {
            positions: vec![[0.0; 3]; 4],
            colors: None,
            normals: None,
        })
    }

    #[test]
    fn test_request_only_from_unloaded_or_expired() {
        let mut tile = node(Some("a.pnts"));
        assert!(tile.request_content());
        assert_eq!(tile.content_state(), ContentState::Loading);
        assert!(!tile.request_content(), "second request must be refused");

        tile.set_ready(points(), 64, None);
        assert!(!tile.request_content());

        tile.set_failed();
        assert!(!tile.request_content());

        tile.reset_failed();
        assert!(tile.request_content());
    }

    #[test]
    fn test_unload_is_idempotent() {
        let mut tile = node(Some("a.pnts"));
        tile.request_content();
        tile.set_ready(points(), 64, None);
        tile.unload_content();
        assert_eq!(tile.content_state(), ContentState::Unloaded);
        assert_eq!(tile.byte_size(), 0);
        assert!(tile.content().is_none());
        tile.unload_content();
        assert_eq!(tile.content_state(), ContentState::Unloaded);
    }

    #[test]
    fn test_expire_drops_content() {
        let mut tile = node(Some("a.pnts"));
        tile.request_content();
        tile.set_ready(points(), 64, None);
        assert!(tile.expire());
        assert_eq!(tile.content_state(), ContentState::Expired);
        assert!(tile.content().is_none());
        assert!(tile.request_content());
    }

    #[test]
    fn test_content_classification() {
        assert!(node(None).is_empty());
        assert!(node(Some("sub/tileset.json?v=2")).has_tileset_content());
        assert!(!node(Some("sub/tileset.json?v=2")).has_renderable_content());
        assert!(node(Some("0/0.b3dm")).has_renderable_content());
    }

    /// Threshold-metric tiles report their projected diameter.
    #[test]
    fn test_threshold_metric_uses_projected_diameter() {
        let mut tile = node(None);
        tile.spec.lod_metric = LodMetric::MaxScreenThreshold(100.0);
        let viewport = Viewport::look_at(
            DVec3::new(0.0, 0.0, 60.0),
            DVec3::ZERO,
            DVec3::Y,
            std::f64::consts::FRAC_PI_3,
            1000,
            1000,
        );
        let expected = viewport.projected_diameter(10.0, 50.0);
        assert!((tile.compute_sse(&viewport) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_sse_zero_for_zero_error() {
        let mut tile = node(None);
        tile.spec.geometric_error = 0.0;
        let viewport = Viewport::look_at(
            DVec3::new(0.0, 0.0, 5.0),
            DVec3::ZERO,
            DVec3::Y,
            1.0,
            800,
            600,
        );
        assert_eq!(tile.compute_sse(&viewport), 0.0);
    }
}
