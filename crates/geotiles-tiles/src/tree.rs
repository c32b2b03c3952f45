//! Arena-backed tile hierarchy.
//!
//! Nodes live in a `Vec<Option<TileNode>>` indexed by [`TileId`]. Children are
//! stored as ids, parents as an optional id, so the tree needs no reference
//! counting and a removed slot can never be mistaken for a live node: ids
//! are handed out monotonically and never reused.

use geotiles_math::DMat4;
use tracing::debug;

use crate::description::{TileDescription, TilesetDescription, base_path, resolve_url};
use crate::error::TilesetError;
use crate::tile::{Refinement, TileId, TileNode, TileSpec};

/// A node validated from the description but not yet inserted.
struct PlannedNode {
    /// Index into the plan of the parent; `None` for the subtree root.
    parent: Option<usize>,
    depth_offset: u32,
    spec: TileSpec,
}

#[derive(Debug, Default)]
pub struct TileTree {
    nodes: Vec<Option<TileNode>>,
    root: Option<TileId>,
    live: usize,
}

impl TileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the tree for a top-level description. `url` is the location
    /// of the description itself, used to resolve relative content URIs.
    pub fn from_description(
        description: &TilesetDescription,
        url: &str,
        root_transform: DMat4,
    ) -> Result<Self, TilesetError> {
        let root_desc = description.root.as_ref().ok_or(TilesetError::MissingRoot)?;
        let plan = plan_subtree(
            root_desc,
            base_path(url),
            description.tileset_version(),
            root_transform,
            Refinement::Replace,
        )?;
        let mut tree = Self::new();
        let root = tree.insert_plan(None, 0, plan);
        tree.root = Some(root);
        tree.refresh_bounds(root);
        debug!(tiles = tree.live, "Built tile tree");
        Ok(tree)
    }

    /// Hangs an external tileset below `parent`, inheriting its transform
    /// and refinement. Nothing is inserted if the description is invalid.
    pub fn attach_subtree(
        &mut self,
        parent: TileId,
        description: &TilesetDescription,
    ) -> Result<TileId, TilesetError> {
        let parent_node = self.get(parent).ok_or(TilesetError::UnknownTile(parent))?;
        let root_desc = description.root.as_ref().ok_or(TilesetError::MissingRoot)?;
        let base = parent_node.content_url().map(base_path).unwrap_or("");
        let plan = plan_subtree(
            root_desc,
            base,
            description.tileset_version(),
            *parent_node.transform(),
            parent_node.refine(),
        )?;
        let depth = parent_node.depth() + 1;
        let count = plan.len();
        let child = self.insert_plan(Some(parent), depth, plan);
        if let Some(node) = self.get_mut(parent) {
            node.children.push(child);
        }
        self.refresh_bounds(child);
        debug!(%parent, tiles = count, "Attached external tileset");
        Ok(child)
    }

    fn insert_plan(
        &mut self,
        parent: Option<TileId>,
        base_depth: u32,
        plan: Vec<PlannedNode>,
    ) -> TileId {
        let mut ids = Vec::with_capacity(plan.len());
        for planned in plan {
            let id = TileId(self.nodes.len() as u32);
            let parent_id = match planned.parent {
                Some(index) => Some(ids[index]),
                None => parent,
            };
            let node = TileNode::new(id, parent_id, base_depth + planned.depth_offset, planned.spec);
            self.nodes.push(Some(node));
            self.live += 1;
            if planned.parent.is_some()
                && let Some(parent_id) = parent_id
                && let Some(Some(parent_node)) = self.nodes.get_mut(parent_id.0 as usize)
            {
                parent_node.children.push(id);
            }
            ids.push(id);
        }
        ids[0]
    }

    pub fn root(&self) -> Option<TileId> {
        self.root
    }

    pub fn get(&self, id: TileId) -> Option<&TileNode> {
        self.nodes.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: TileId) -> Option<&mut TileNode> {
        self.nodes.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn contains(&self, id: TileId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &TileNode> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    pub fn children(&self, id: TileId) -> &[TileId] {
        self.get(id).map(TileNode::children).unwrap_or_default()
    }

    /// Recomputes descendant bounds below `id`, then for `id` and its ancestors.
    fn refresh_bounds(&mut self, id: TileId) {
        let mut order = self.post_order(id);
        order.pop();
        for current in order {
            self.recompute_bounds(current);
        }
        self.refresh_upward(Some(id));
    }

    fn refresh_upward(&mut self, mut next: Option<TileId>) {
        while let Some(current) = next {
            self.recompute_bounds(current);
            next = self.get(current).and_then(TileNode::parent);
        }
    }

    fn recompute_bounds(&mut self, id: TileId) {
        let bounds = self
            .children(id)
            .iter()
            .filter_map(|&child| self.get(child))
            .map(TileNode::subtree_bounds)
            .reduce(|a, b| a.union(&b));
        if let Some(node) = self.get_mut(id) {
            node.descendant_bounds = bounds;
        }
    }

    /// Post-order list of the subtree rooted at `id` (children before parents).
    pub fn post_order(&self, id: TileId) -> Vec<TileId> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            let Some(node) = self.get(current) else {
                continue;
            };
            stack.push((current, true));
            for &child in node.children().iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Removes the subtree below `id` in post-order and returns the removed
    /// nodes. With `include_root` the node itself goes too.
    pub fn destroy_subtree(&mut self, id: TileId, include_root: bool) -> Vec<TileNode> {
        let mut order = self.post_order(id);
        if !include_root {
            order.pop();
        }
        let mut removed = Vec::with_capacity(order.len());
        for current in order {
            if let Some(node) = self.nodes.get_mut(current.0 as usize).and_then(Option::take) {
                self.live -= 1;
                removed.push(node);
            }
        }

        if include_root {
            let parent = removed.last().and_then(TileNode::parent);
            if let Some(parent_node) = parent.and_then(|p| self.get_mut(p)) {
                parent_node.children.retain(|&c| c != id);
            }
            if self.root == Some(id) {
                self.root = None;
            }
            self.refresh_upward(parent);
        } else {
            if let Some(node) = self.get_mut(id) {
                node.children.clear();
            }
            self.refresh_upward(Some(id));
        }
        removed
    }

    /// Removes every node, children before parents.
    pub fn clear(&mut self) -> Vec<TileNode> {
        match self.root {
            Some(root) => self.destroy_subtree(root, true),
            None => Vec::new(),
        }
    }
}

/// Validates a description subtree into insertion order (parents first).
fn plan_subtree(
    root: &TileDescription,
    base: &str,
    tileset_version: Option<&str>,
    parent_transform: DMat4,
    parent_refine: Refinement,
) -> Result<Vec<PlannedNode>, TilesetError> {
    let mut plan = Vec::new();
    let mut stack = vec![(root, None::<usize>, 0u32, parent_transform, parent_refine)];
    while let Some((desc, parent, depth, parent_world, inherited)) = stack.pop() {
        if !desc.geometric_error.is_finite() || desc.geometric_error < 0.0 {
            return Err(TilesetError::InvalidGeometricError(desc.geometric_error));
        }
        let world = parent_world * desc.local_transform();
        let bounding_volume = desc.bounding_volume.to_volume(&world)?;
        let refine = desc.refine.unwrap_or(inherited);
        let content_url = desc
            .content
            .as_ref()
            .and_then(|c| c.uri())
            .map(|uri| resolve_url(base, uri, tileset_version));

        let index = plan.len();
        plan.push(PlannedNode {
            parent,
            depth_offset: depth,
            spec: TileSpec {
                bounding_volume,
                geometric_error: desc.geometric_error,
                lod_metric: desc.lod_metric(),
                refine,
                content_url,
                transform: world,
            },
        });
        for child in desc.children.iter().rev() {
            stack.push((child, Some(index), depth + 1, world, refine));
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::BoundingVolumeDescription;
    use crate::tile::LodMetric;
    use geotiles_math::DVec3;

    fn sphere(x: f64, r: f64) -> BoundingVolumeDescription {
        BoundingVolumeDescription {
            sphere: Some(vec![x, 0.0, 0.0, r]),
            ..Default::default()
        }
    }

    fn leaf(x: f64, uri: &str) -> TileDescription {
        TileDescription {
            bounding_volume: sphere(x, 5.0),
            geometric_error: 0.5,
            content: Some(crate::description::ContentDescription {
                uri: Some(uri.into()),
                url: None,
            }),
            ..Default::default()
        }
    }

    fn description() -> TilesetDescription {
        TilesetDescription {
            asset: Some(crate::description::Asset {
                version: Some("1.0".into()),
                tileset_version: Some("3".into()),
                gltf_up_axis: None,
            }),
            geometric_error: 10.0,
            root: Some(TileDescription {
                bounding_volume: sphere(0.0, 10.0),
                geometric_error: 4.0,
                refine: Some(Refinement::Add),
                transform: Some(DMat4::from_translation(DVec3::new(0.0, 100.0, 0.0)).to_cols_array()),
                children: vec![leaf(-5.0, "a.pnts"), leaf(5.0, "b.pnts")],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_links_parents_and_depths() {
        let tree = TileTree::from_description(&description(), "data/tileset.json", DMat4::IDENTITY)
            .unwrap();
        assert_eq!(tree.len(), 3);
        let root = tree.get(tree.root().unwrap()).unwrap();
        assert_eq!(root.depth(), 0);
        assert_eq!(root.children().len(), 2);
        for &child in root.children() {
            let node = tree.get(child).unwrap();
            assert_eq!(node.parent(), Some(root.id()));
            assert_eq!(node.depth(), 1);
            assert_eq!(node.refine(), Refinement::Add, "refinement is inherited");
            assert_eq!(node.lod_metric(), LodMetric::GeometricError);
        }
        let first = tree.get(root.children()[0]).unwrap();
        assert_eq!(first.content_url(), Some("data/a.pnts?v=3"));
    }

    /// Child volumes are moved by the composed ancestor transforms.
    #[test]
    fn test_transforms_compose() {
        let root_transform = DMat4::from_translation(DVec3::new(1000.0, 0.0, 0.0));
        let tree = TileTree::from_description(&description(), "tileset.json", root_transform).unwrap();
        let root = tree.get(tree.root().unwrap()).unwrap();
        let child = tree.get(root.children()[1]).unwrap();
        let center = child.bounding_volume().center();
        assert!((center - DVec3::new(1005.0, 100.0, 0.0)).length() < 1e-9);
    }

    #[test]
    fn test_invalid_geometric_error_rejected() {
        let mut d = description();
        d.root.as_mut().unwrap().children[0].geometric_error = -1.0;
        let err = TileTree::from_description(&d, "tileset.json", DMat4::IDENTITY).unwrap_err();
        assert!(matches!(err, TilesetError::InvalidGeometricError(_)));
    }

    #[test]
    fn test_destroy_subtree_is_post_order() {
        let mut tree =
            TileTree::from_description(&description(), "tileset.json", DMat4::IDENTITY).unwrap();
        let root = tree.root().unwrap();
        let children = tree.children(root).to_vec();
        let removed = tree.destroy_subtree(root, false);
        let ids: Vec<TileId> = removed.iter().map(TileNode::id).collect();
        assert_eq!(ids, children);
        assert_eq!(tree.len(), 1);
        assert!(tree.children(root).is_empty());

        let removed = tree.clear();
        assert_eq!(removed.len(), 1);
        assert!(tree.is_empty());
        assert!(tree.root().is_none());
        assert!(tree.clear().is_empty(), "clearing twice is a no-op");
    }

    #[test]
    fn test_attach_subtree_continues_ids_and_depth() {
        let mut tree =
            TileTree::from_description(&description(), "data/tileset.json", DMat4::IDENTITY)
                .unwrap();
        let root = tree.root().unwrap();
        let parent = tree.children(root)[0];

        let mut external = description();
        external.root.as_mut().unwrap().refine = None;
        let attached = tree.attach_subtree(parent, &external).unwrap();
        assert_eq!(attached, TileId(3));
        assert_eq!(tree.len(), 6);
        let node = tree.get(attached).unwrap();
        assert_eq!(node.depth(), 2);
        assert_eq!(node.parent(), Some(parent));
        assert_eq!(tree.children(parent), &[attached]);
        assert!(tree.post_order(root).contains(&TileId(5)));
    }

    /// Descendant bounds enclose the whole subtree and follow attach and destroy.
    #[test]
    fn test_descendant_bounds_follow_structure() {
        let mut tree =
            TileTree::from_description(&description(), "tileset.json", DMat4::IDENTITY).unwrap();
        let root = tree.root().unwrap();
        let bounds = *tree.get(root).unwrap().descendant_bounds().unwrap();
        assert!((bounds.center - DVec3::new(0.0, 100.0, 0.0)).length() < 1e-9);
        assert!((bounds.radius - 10.0).abs() < 1e-9);
        let leaf = tree.children(root)[0];
        assert!(tree.get(leaf).unwrap().descendant_bounds().is_none());

        // The external root sits 100 m further along y than its new parent.
        tree.attach_subtree(leaf, &description()).unwrap();
        let leaf_bounds = *tree.get(leaf).unwrap().descendant_bounds().unwrap();
        assert!(leaf_bounds.center.y > 150.0);
        let grown = *tree.get(root).unwrap().descendant_bounds().unwrap();
        assert!(grown.radius > bounds.radius);
        assert!(grown.distance_to(DVec3::new(0.0, 200.0, 0.0)) == 0.0);

        tree.destroy_subtree(leaf, false);
        assert!(tree.get(leaf).unwrap().descendant_bounds().is_none());
        let shrunk = *tree.get(root).unwrap().descendant_bounds().unwrap();
        assert!((shrunk.radius - 10.0).abs() < 1e-9);

        tree.destroy_subtree(root, false);
        assert!(tree.get(root).unwrap().descendant_bounds().is_none());
    }

    /// A failing subtree leaves the tree untouched.
    #[test]
    fn test_attach_invalid_subtree_is_atomic() {
        let mut tree =
            TileTree::from_description(&description(), "tileset.json", DMat4::IDENTITY).unwrap();
        let root = tree.root().unwrap();
        let mut external = description();
        external.root.as_mut().unwrap().children[1].bounding_volume = Default::default();
        assert!(tree.attach_subtree(root, &external).is_err());
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.children(root).len(), 2);
    }
}
