//! Per-frame tree traversal and level-of-detail selection.
//!
//! Starting at the root, every reached tile is judged once:
//!
//! - **Skip**: outside the frustum (or below the horizon). Nothing below it
//!   is visited.
//! - **Select**: detailed enough for this view, or a leaf. Its content is
//!   rendered when ready and requested otherwise.
//! - **Descend**: too coarse. Children are visited; with `REPLACE`
//!   refinement the tile is drawn as a fallback only when none of its
//!   descendants produced anything to draw, with `ADD` refinement it is
//!   drawn alongside them.
//!
//! Descent depends only on screen-space error and the presence of children,
//! never on whether content has arrived. Without skip-LOD every level on the
//! way down is visited and requested as a fallback. With skip-LOD
//! intermediate tiles are requested only when they are far enough (in
//! levels and in error) from the nearest loaded ancestor.

use geotiles_config::TilesetConfig;
use geotiles_math::{Frustum, HorizonCuller, Viewport};

use crate::frame::FrameState;
use crate::tile::{ContentState, LodMetric, Refinement, TileId, TileNode};
use crate::tree::TileTree;

/// Request priority multiplier for siblings loaded only to reduce popping.
const SIBLING_PRIORITY_SCALE: f64 = 8.0;

/// Classification of a visited tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LodDecision {
    Skip,
    Descend,
    Select,
}

/// What one traversal produced.
#[derive(Clone, Debug, Default)]
pub struct TraversalOutput {
    /// Ready tiles to render, in depth-first order.
    pub selected: Vec<TileId>,
    /// Tiles chosen as the right level of detail, ready or not.
    pub desired: Vec<TileId>,
    /// Tiles needing content with their priority (lower loads first).
    pub requests: Vec<(TileId, f64)>,
    pub visited: usize,
    pub culled: usize,
}

impl TraversalOutput {
    fn clear(&mut self) {
        self.selected.clear();
        self.desired.clear();
        self.requests.clear();
        self.visited = 0;
        self.culled = 0;
    }
}

/// Nearest ancestor whose content is loaded or being loaded as a fallback.
#[derive(Clone, Copy, Debug)]
struct LoadedAncestor {
    depth: u32,
    sse: f64,
}

#[derive(Clone, Copy, Debug)]
struct VisitResult {
    visible: bool,
    rendered: bool,
}

/// Frame constants shared by every node visit.
struct TraversalContext<'a> {
    config: &'a TilesetConfig,
    frame: u64,
    viewport: Viewport,
    frustum: Frustum,
    horizon: Option<HorizonCuller>,
    judge: LodJudge<'a>,
}

impl TraversalContext<'_> {
    fn is_visible(&self, node: &TileNode) -> bool {
        node.is_visible(&self.frustum, self.horizon.as_ref())
            || (self.config.cull_with_children_bounds
                && node.descendants_visible(&self.frustum, self.horizon.as_ref()))
    }
}

/// Reusable traversal state.
#[derive(Debug, Default)]
pub struct Traverser {
    output: TraversalOutput,
}

impl Traverser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks `tree` for one frame, updating per-node distance, error,
    /// priority and visit stamps.
    pub fn traverse(
        &mut self,
        tree: &mut TileTree,
        config: &TilesetConfig,
        frame: &FrameState,
    ) -> &TraversalOutput {
        self.output.clear();
        let Some(root) = tree.root() else {
            return &self.output;
        };

        let viewport = frame.viewport;
        let horizon = frame.horizon.map(|h| h.culler(viewport.position));
        let dynamic_density = if config.dynamic_screen_space_error {
            dynamic_density(config, tree, root, &viewport, horizon.as_ref())
        } else {
            0.0
        };
        let ctx = TraversalContext {
            config,
            frame: frame.frame_number,
            viewport,
            frustum: viewport.frustum(),
            horizon,
            judge: LodJudge::new(config, viewport).with_dynamic_density(dynamic_density),
        };
        self.visit(tree, &ctx, root, None);
        &self.output
    }

    pub fn output(&self) -> &TraversalOutput {
        &self.output
    }

    fn visit(
        &mut self,
        tree: &mut TileTree,
        ctx: &TraversalContext<'_>,
        id: TileId,
        ancestor: Option<LoadedAncestor>,
    ) -> VisitResult {
        let Some(node) = tree.get_mut(id) else {
            return VisitResult {
                visible: false,
                rendered: false,
            };
        };
        let visible = ctx.is_visible(node);
        node.last_visited_frame = Some(ctx.frame);
        node.distance_to_camera = node.distance_to(&ctx.viewport);
        node.screen_space_error = node.compute_sse(&ctx.viewport);
        node.priority = node.distance_to_camera;

        if !visible {
            self.output.culled += 1;
            return VisitResult {
                visible: false,
                rendered: false,
            };
        }
        self.output.visited += 1;

        let rendered = match ctx.judge.judge(node) {
            LodDecision::Skip => false,
            LodDecision::Select => self.select(node),
            LodDecision::Descend => self.descend(tree, ctx, id, ancestor),
        };
        VisitResult {
            visible: true,
            rendered,
        }
    }

    /// Renders or requests a terminal tile. Returns whether it was rendered.
    fn select(&mut self, node: &TileNode) -> bool {
        if node.is_empty() {
            return false;
        }
        if node.has_tileset_content() {
            if !node.is_ready() {
                self.request(node, node.priority);
            }
            return false;
        }
        self.output.desired.push(node.id());
        if node.is_ready() {
            self.output.selected.push(node.id());
            true
        } else {
            self.request(node, node.priority);
            false
        }
    }

    fn descend(
        &mut self,
        tree: &mut TileTree,
        ctx: &TraversalContext<'_>,
        id: TileId,
        ancestor: Option<LoadedAncestor>,
    ) -> bool {
        let Some(node) = tree.get(id) else {
            return false;
        };
        let renderable = node.has_renderable_content();
        let refine = node.refine();
        let ready = node.is_ready();
        let here = LoadedAncestor {
            depth: node.depth(),
            sse: node.screen_space_error,
        };

        let mut rendered = false;
        let mut load_fallback = false;
        let mut child_ancestor = ancestor;
        if renderable {
            match refine {
                Refinement::Add => {
                    if ready {
                        self.output.selected.push(id);
                        rendered = true;
                    } else {
                        self.request(node, node.priority);
                    }
                    child_ancestor = Some(here);
                }
                Refinement::Replace => {
                    load_fallback = !ready && should_load_fallback(node, ancestor, ctx.config);
                    if ready || load_fallback {
                        child_ancestor = Some(here);
                    }
                }
            }
        }

        let children = node.children().to_vec();
        let mut child_rendered = false;
        let mut culled_children = Vec::new();
        for &child in &children {
            let result = self.visit(tree, ctx, child, child_ancestor);
            child_rendered |= result.rendered;
            if !result.visible {
                culled_children.push(child);
            }
        }

        if ctx.config.load_siblings && !culled_children.is_empty() {
            for child in culled_children {
                if let Some(sibling) = tree.get(child)
                    && sibling.has_renderable_content()
                    && sibling.content_state() != ContentState::Loading
                {
                    let priority = SIBLING_PRIORITY_SCALE * (sibling.distance_to_camera + 1.0);
                    self.request(sibling, priority);
                }
            }
        }

        if renderable
            && refine == Refinement::Replace
            && !child_rendered
            && let Some(node) = tree.get(id)
        {
            if node.is_ready() {
                self.output.selected.push(id);
                rendered = true;
            } else if load_fallback {
                self.request(node, node.priority);
            }
        }
        rendered || child_rendered
    }

    fn request(&mut self, node: &TileNode, priority: f64) {
        if matches!(
            node.content_state(),
            ContentState::Loading | ContentState::Ready
        ) {
            return;
        }
        self.output.requests.push((node.id(), priority));
    }
}

/// The per-tile LOD decision for one frame.
#[derive(Clone, Copy, Debug)]
pub struct LodJudge<'a> {
    config: &'a TilesetConfig,
    viewport: Viewport,
    /// Fog density of the dynamic threshold; zero disables it.
    dynamic_density: f64,
}

impl<'a> LodJudge<'a> {
    pub fn new(config: &'a TilesetConfig, viewport: Viewport) -> Self {
        Self {
            config,
            viewport,
            dynamic_density: 0.0,
        }
    }

    pub fn with_dynamic_density(mut self, density: f64) -> Self {
        self.dynamic_density = density.max(0.0);
        self
    }

    /// Multiplier applied to the error threshold for content at `distance`.
    ///
    /// Always `>= 1`: distant content may be drawn coarser, never finer.
    pub fn threshold_scale(&self, distance: f64) -> f64 {
        if self.dynamic_density <= 0.0 {
            return 1.0;
        }
        let x = distance * self.dynamic_density;
        let fog = 1.0 - (-(x * x)).exp();
        1.0 + self.config.dynamic_screen_space_error_factor * fog
    }

    /// Classifies a tile already known to be visible.
    pub fn judge(&self, node: &TileNode) -> LodDecision {
        if node.has_tileset_content() {
            return if node.is_ready() && !node.is_leaf() {
                LodDecision::Descend
            } else {
                LodDecision::Select
            };
        }
        if node.is_leaf() {
            return LodDecision::Select;
        }

        let sse = node.compute_sse(&self.viewport);
        let scale = self.threshold_scale(node.distance_to(&self.viewport));
        let too_coarse = match node.lod_metric() {
            LodMetric::GeometricError => sse > self.config.maximum_screen_space_error * scale,
            LodMetric::MaxScreenThreshold(max) => sse >= max * scale,
        };
        if too_coarse {
            LodDecision::Descend
        } else {
            LodDecision::Select
        }
    }
}

/// Whether a `REPLACE` tile being refined past should still load as a
/// fallback for its subtree.
fn should_load_fallback(
    node: &TileNode,
    ancestor: Option<LoadedAncestor>,
    config: &TilesetConfig,
) -> bool {
    if config.immediately_load_desired_level_of_detail {
        return false;
    }
    if !config.skip_level_of_detail {
        return true;
    }
    if node.screen_space_error > config.base_screen_space_error {
        return true;
    }
    match ancestor {
        None => true,
        Some(a) => {
            node.depth().saturating_sub(a.depth) > config.skip_levels
                && node.screen_space_error * config.skip_screen_space_error_factor <= a.sse
        }
    }
}

/// Fog density for the dynamic threshold, reduced when looking down at
/// the data and when the camera is high above it.
fn dynamic_density(
    config: &TilesetConfig,
    tree: &TileTree,
    root: TileId,
    viewport: &Viewport,
    horizon: Option<&HorizonCuller>,
) -> f64 {
    let Some(root) = tree.get(root) else {
        return 0.0;
    };
    let sphere = root.bounding_volume().bounding_sphere();
    let up = match horizon {
        Some(culler) => (viewport.position - culler.center())
            .try_normalize()
            .unwrap_or(viewport.up),
        None => viewport.up,
    };
    let horizon_factor = 1.0 - viewport.direction.dot(up).abs();
    let height = match horizon {
        Some(culler) => culler.camera_altitude(),
        None => sphere.distance_to(viewport.position),
    };
    let t = (height / sphere.radius.max(1.0)).clamp(0.0, 1.0);
    let falloff = config.dynamic_screen_space_error_height_falloff.clamp(0.0, 1.0);
    config.dynamic_screen_space_error_density * horizon_factor * (1.0 - falloff * t)
}

#[cfg(test)]
mod tests {
    use geotiles_math::{DMat4, DVec3};

    use super::*;
    use crate::content::{PointCloudContent, TileContent};
    use crate::description::{
        Asset, BoundingVolumeDescription, ContentDescription, LodSelection, TileDescription,
        TilesetDescription,
    };

    fn sphere_tile(
        x: f64,
        radius: f64,
        error: f64,
        uri: Option<&str>,
        children: Vec<TileDescription>,
    ) -> TileDescription {
        TileDescription {
            bounding_volume: BoundingVolumeDescription {
                sphere: Some(vec![x, 0.0, 0.0, radius]),
                ..Default::default()
            },
            geometric_error: error,
            content: uri.map(|u| ContentDescription {
                uri: Some(u.into()),
                url: None,
            }),
            children,
            ..Default::default()
        }
    }

    /// Root (r=10, error 4) with two leaves (r=5, error 0.5).
    fn two_level(refine: Refinement) -> TileTree {
        let mut root = sphere_tile(
            0.0,
            10.0,
            4.0,
            Some("root.pnts"),
            vec![
                sphere_tile(-5.0, 5.0, 0.5, Some("a.pnts"), vec![]),
                sphere_tile(5.0, 5.0, 0.5, Some("b.pnts"), vec![]),
            ],
        );
        root.refine = Some(refine);
        let description = TilesetDescription {
            asset: Some(Asset {
                version: Some("1.0".into()),
                ..Default::default()
            }),
            root: Some(root),
            ..Default::default()
        };
        TileTree::from_description(&description, "", DMat4::IDENTITY).unwrap()
    }

    fn frame(number: u64, distance: f64) -> FrameState {
        FrameState::new(
            number,
            Viewport::look_at(
                DVec3::new(0.0, 0.0, distance),
                DVec3::ZERO,
                DVec3::Y,
                std::f64::consts::FRAC_PI_3,
                1000,
                1000,
            ),
        )
    }

    fn make_ready(tree: &mut TileTree, id: u32) {
        let node = tree.get_mut(TileId(id)).unwrap();
        node.request_content();
        node.set_ready(
            TileContent::PointCloud(PointCloudContent::default()),
            100,
            None,
        );
    }

    fn ids(requests: &[(TileId, f64)]) -> Vec<TileId> {
        requests.iter().map(|(id, _)| *id).collect()
    }

    /// A far camera selects the root; a near one wants the children.
    #[test]
    fn test_distance_drives_refinement() {
        let config = TilesetConfig::default();
        let mut tree = two_level(Refinement::Replace);
        let mut traverser = Traverser::new();

        let out = traverser.traverse(&mut tree, &config, &frame(1, 500.0));
        assert_eq!(out.desired, vec![TileId(0)]);
        assert_eq!(ids(&out.requests), vec![TileId(0)]);
        assert!(out.selected.is_empty());

        make_ready(&mut tree, 0);
        let out = traverser.traverse(&mut tree, &config, &frame(2, 500.0));
        assert_eq!(out.selected, vec![TileId(0)]);
        assert!(out.requests.is_empty());

        let out = traverser.traverse(&mut tree, &config, &frame(3, 50.0));
        assert_eq!(out.desired, vec![TileId(1), TileId(2)]);
        assert_eq!(ids(&out.requests), vec![TileId(1), TileId(2)]);
        assert_eq!(out.selected, vec![TileId(0)], "parent renders until a child is ready");

        make_ready(&mut tree, 1);
        make_ready(&mut tree, 2);
        let out = traverser.traverse(&mut tree, &config, &frame(4, 50.0));
        assert_eq!(out.selected, vec![TileId(1), TileId(2)]);
        assert_eq!(out.visited, 3);
    }

    /// A too-coarse parent descends before its own content arrives, and is
    /// requested alongside its children as the fallback.
    #[test]
    fn test_unloaded_parent_still_descends() {
        let config = TilesetConfig::default();
        let mut tree = two_level(Refinement::Replace);
        let root = tree.get(TileId(0)).unwrap();
        let near = frame(1, 50.0).viewport;
        assert_eq!(LodJudge::new(&config, near).judge(root), LodDecision::Descend);

        let out = Traverser::new()
            .traverse(&mut tree, &config, &frame(1, 50.0))
            .clone();
        assert_eq!(out.visited, 3);
        assert_eq!(out.desired, vec![TileId(1), TileId(2)]);
        assert_eq!(ids(&out.requests), vec![TileId(1), TileId(2), TileId(0)]);
        assert!(out.selected.is_empty());
    }

    /// Immediately-load-desired skips the intermediate root entirely.
    #[test]
    fn test_immediate_load_requests_only_leaves() {
        let config = TilesetConfig {
            skip_level_of_detail: true,
            immediately_load_desired_level_of_detail: true,
            ..Default::default()
        };
        let mut tree = two_level(Refinement::Replace);
        let out = Traverser::new()
            .traverse(&mut tree, &config, &frame(1, 50.0))
            .clone();
        assert_eq!(ids(&out.requests), vec![TileId(1), TileId(2)]);
        assert!(out.selected.is_empty());
    }

    /// ADD parents render together with their children.
    #[test]
    fn test_additive_parent_coexists() {
        let config = TilesetConfig::default();
        let mut tree = two_level(Refinement::Add);
        for id in 0..3 {
            make_ready(&mut tree, id);
        }
        let out = Traverser::new()
            .traverse(&mut tree, &config, &frame(1, 50.0))
            .clone();
        assert_eq!(out.selected, vec![TileId(0), TileId(1), TileId(2)]);
    }

    /// Once one child is ready the REPLACE parent is dropped.
    #[test]
    fn test_replace_parent_dropped_when_child_ready() {
        let config = TilesetConfig::default();
        let mut tree = two_level(Refinement::Replace);
        make_ready(&mut tree, 0);
        make_ready(&mut tree, 2);
        let out = Traverser::new()
            .traverse(&mut tree, &config, &frame(1, 50.0))
            .clone();
        assert_eq!(out.selected, vec![TileId(2)]);
        assert_eq!(ids(&out.requests), vec![TileId(1)]);
    }

    #[test]
    fn test_culled_tiles_are_skipped() {
        let config = TilesetConfig::default();
        let mut tree = two_level(Refinement::Replace);
        let mut state = frame(1, 50.0);
        state.viewport.direction = DVec3::Z;
        let out = Traverser::new().traverse(&mut tree, &config, &state).clone();
        assert!(out.selected.is_empty());
        assert!(out.requests.is_empty());
        assert_eq!(out.culled, 1);
        assert_eq!(
            tree.get(TileId(0)).unwrap().last_visited_frame,
            Some(1),
            "culled tiles are still stamped as visited"
        );
    }

    /// Traversal still reports a failed tile as wanted; the scheduler
    /// decides whether it is fetched again.
    #[test]
    fn test_failed_leaf_still_wanted() {
        let config = TilesetConfig::default();
        let mut tree = two_level(Refinement::Replace);
        make_ready(&mut tree, 0);
        tree.get_mut(TileId(1)).unwrap().set_failed();
        let out = Traverser::new()
            .traverse(&mut tree, &config, &frame(1, 50.0))
            .clone();
        assert_eq!(ids(&out.requests), vec![TileId(1), TileId(2)]);
        assert_eq!(
            tree.get(TileId(1)).unwrap().content_state(),
            ContentState::Failed
        );
    }

    #[test]
    fn test_threshold_metric_judge() {
        let config = TilesetConfig::default();
        let mut root = sphere_tile(
            0.0,
            10.0,
            0.0,
            Some("r"),
            vec![sphere_tile(0.0, 5.0, 0.0, None, vec![])],
        );
        root.lod_selection = vec![LodSelection {
            metric_type: "maxScreenThreshold".into(),
            max_error: 100.0,
        }];
        let description = TilesetDescription {
            asset: Some(Asset {
                version: Some("1.0".into()),
                ..Default::default()
            }),
            root: Some(root),
            ..Default::default()
        };
        let mut tree = TileTree::from_description(&description, "", DMat4::IDENTITY).unwrap();
        make_ready(&mut tree, 0);
        let root = tree.get(TileId(0)).unwrap();

        // Diameter 20 at distance 40 projects to ~433 px: dig.
        let near = frame(1, 50.0).viewport;
        assert_eq!(LodJudge::new(&config, near).judge(root), LodDecision::Descend);
        // At distance 990 it is ~17 px: draw.
        let far = frame(1, 1000.0).viewport;
        assert_eq!(LodJudge::new(&config, far).judge(root), LodDecision::Select);
    }

    /// The dynamic threshold only ever loosens.
    #[test]
    fn test_dynamic_scale_never_below_one() {
        let config = TilesetConfig {
            dynamic_screen_space_error: true,
            ..Default::default()
        };
        let judge = LodJudge::new(&config, frame(1, 10.0).viewport).with_dynamic_density(0.00278);
        let mut prev = 1.0;
        for d in [0.0, 10.0, 100.0, 1000.0, 10_000.0] {
            let scale = judge.threshold_scale(d);
            assert!(scale >= prev, "scale must grow with distance");
            prev = scale;
        }
        assert!(prev <= 1.0 + config.dynamic_screen_space_error_factor + 1e-9);
        let off = LodJudge::new(&config, frame(1, 10.0).viewport);
        assert_eq!(off.threshold_scale(1.0e6), 1.0);
    }

    /// Dynamic SSE can keep a tile coarse that the static threshold would refine.
    #[test]
    fn test_dynamic_sse_coarsens_distant_tiles() {
        let static_config = TilesetConfig::default();
        let dynamic_config = TilesetConfig {
            dynamic_screen_space_error: true,
            dynamic_screen_space_error_density: 0.05,
            ..Default::default()
        };
        let mut tree = two_level(Refinement::Replace);
        make_ready(&mut tree, 0);
        let mut state = frame(1, 90.0);
        state.viewport.up = DVec3::Y;

        let out = Traverser::new().traverse(&mut tree, &static_config, &state).clone();
        assert_eq!(out.desired, vec![TileId(1), TileId(2)]);
        let out = Traverser::new().traverse(&mut tree, &dynamic_config, &state).clone();
        assert_eq!(out.desired, vec![TileId(0)]);
    }

    #[test]
    fn test_load_siblings_requests_culled_children() {
        let config = TilesetConfig {
            load_siblings: true,
            cull_with_children_bounds: false,
            ..Default::default()
        };
        let mut tree = two_level(Refinement::Replace);
        make_ready(&mut tree, 0);
        // Look at the +x child only, from close by.
        let state = FrameState::new(
            1,
            Viewport::look_at(
                DVec3::new(5.0, 0.0, 12.0),
                DVec3::new(5.0, 0.0, 0.0),
                DVec3::Y,
                0.3,
                1000,
                1000,
            ),
        );
        let out = Traverser::new().traverse(&mut tree, &config, &state).clone();
        let requested = ids(&out.requests);
        assert!(requested.contains(&TileId(2)));
        assert!(requested.contains(&TileId(1)), "culled sibling is prefetched");
        let sibling = out.requests.iter().find(|(id, _)| *id == TileId(1)).unwrap();
        let visible = out.requests.iter().find(|(id, _)| *id == TileId(2)).unwrap();
        assert!(sibling.1 > visible.1);
    }

    /// A parent whose own bound is off-screen stays visible while a child's is on it.
    #[test]
    fn test_cull_with_children_bounds() {
        let mut root = sphere_tile(
            0.0,
            1.0,
            4.0,
            None,
            vec![sphere_tile(0.0, 1.0, 0.5, Some("c.pnts"), vec![])],
        );
        root.children[0].transform =
            Some(DMat4::from_translation(DVec3::new(100.0, 0.0, 0.0)).to_cols_array());
        let description = TilesetDescription {
            asset: Some(Asset {
                version: Some("1.0".into()),
                ..Default::default()
            }),
            root: Some(root),
            ..Default::default()
        };
        let state = FrameState::new(
            1,
            Viewport::look_at(
                DVec3::new(100.0, 0.0, 20.0),
                DVec3::new(100.0, 0.0, 0.0),
                DVec3::Y,
                0.5,
                1000,
                1000,
            ),
        );

        let mut tree = TileTree::from_description(&description, "", DMat4::IDENTITY).unwrap();
        let on = TilesetConfig::default();
        let out = Traverser::new().traverse(&mut tree, &on, &state).clone();
        assert_eq!(ids(&out.requests), vec![TileId(1)]);

        let off = TilesetConfig {
            cull_with_children_bounds: false,
            ..Default::default()
        };
        let out = Traverser::new().traverse(&mut tree, &off, &state).clone();
        assert!(out.requests.is_empty());
        assert_eq!(out.culled, 1);
    }
}
