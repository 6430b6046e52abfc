//! Quadtree over the footprint of a point cloud.
//!
//! The tree partitions the XY footprint of a [PointSource] into axis-aligned tiles. It is built top-down by
//! counting the points of every node through the point source, and it only keeps structural information:
//! point buffers of a tile live outside of the tree (see [TileSlots](crate::loader::TileSlots)). Once the
//! provisional ground surface exists, its triangles are routed into the same tree so that the triangles
//! near a point or tile can be found by walking a single root-to-leaf path.

use ground_core::{
    math::{QueryRegion, AABB},
    nalgebra::Point3,
    source::PointSource,
};
use log::debug;

use crate::surface::Surface;

/// Index of a node in the arena of a [Quadtree]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// A single node of the [Quadtree]
#[derive(Debug, Clone)]
pub struct QuadNode {
    region: QueryRegion,
    pivot: Point3<f64>,
    depth: usize,
    parent: Option<NodeId>,
    children: Option<[NodeId; 4]>,
    point_count: usize,
    triangles: Vec<usize>,
}

impl QuadNode {
    fn new(region: QueryRegion, depth: usize, parent: Option<NodeId>) -> Self {
        Self {
            pivot: region.bounds().center(),
            region,
            depth,
            parent,
            children: None,
            point_count: 0,
            triangles: vec![],
        }
    }

    pub fn bounds(&self) -> &AABB<f64> {
        self.region.bounds()
    }

    /// The region to query the points of this node with
    pub fn region(&self) -> &QueryRegion {
        &self.region
    }

    /// Split point of this node, the center of its bounds
    pub fn pivot(&self) -> &Point3<f64> {
        &self.pivot
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> Option<&[NodeId; 4]> {
        self.children.as_ref()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Number of visible points inside this node
    pub fn point_count(&self) -> usize {
        self.point_count
    }

    /// Indices of the surface triangles stored at this node
    pub fn triangles(&self) -> &[usize] {
        &self.triangles
    }

    /// Index of the child quadrant that contains `x`/`y`. Coordinates on a split line belong to the upper side
    fn quadrant_of(&self, x: f64, y: f64) -> usize {
        let high_x = x >= self.pivot.x;
        let high_y = y >= self.pivot.y;
        high_x as usize + 2 * high_y as usize
    }
}

/// Limits that decide when a node stops being split
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitLimits {
    /// Nodes whose larger footprint edge is at most this length are not split
    pub tile_size: f64,
    /// Nodes with at most this many visible points are not split
    pub max_data_size: usize,
    pub max_depth: usize,
}

/// Arena based quadtree over the footprint of a point cloud
#[derive(Debug, Clone)]
pub struct Quadtree {
    nodes: Vec<QuadNode>,
    max_depth_reached: usize,
}

impl Quadtree {
    /// Builds the quadtree for all points of `source` inside `bounds`. Returns the tree together with the
    /// leaves that contain at least one visible point, in arena order. These are the tiles that get seeds.
    ///
    /// A node becomes a leaf if it holds no more than `limits.max_data_size` visible points, if its
    /// footprint is no larger than `limits.tile_size`, or if it reached `limits.max_depth`. Otherwise its
    /// footprint is split into four quadrants at the center of its bounds.
    pub fn build<S: PointSource + ?Sized>(
        bounds: AABB<f64>,
        source: &mut S,
        limits: SplitLimits,
    ) -> anyhow::Result<(Quadtree, Vec<NodeId>)> {
        let mut tree = Quadtree {
            nodes: vec![QuadNode::new(QueryRegion::closed(bounds), 0, None)],
            max_depth_reached: 0,
        };
        tree.subdivide(NodeId::ROOT, source, &limits)?;

        let seed_tiles: Vec<NodeId> = tree
            .leaves()
            .filter(|id| tree.node(*id).point_count > 0)
            .collect();
        debug!(
            "Quadtree with {} nodes, {} non-empty leaves, depth {}",
            tree.nodes.len(),
            seed_tiles.len(),
            tree.max_depth_reached
        );
        Ok((tree, seed_tiles))
    }

    fn subdivide<S: PointSource + ?Sized>(
        &mut self,
        id: NodeId,
        source: &mut S,
        limits: &SplitLimits,
    ) -> anyhow::Result<usize> {
        let (region, depth) = {
            let node = &self.nodes[id.0];
            (node.region, node.depth)
        };
        self.max_depth_reached = self.max_depth_reached.max(depth);

        let count = source.count_points(&region)?;
        self.nodes[id.0].point_count = count;

        let is_leaf = count <= limits.max_data_size
            || region.bounds().max_footprint_edge() <= limits.tile_size
            || depth >= limits.max_depth;
        if is_leaf {
            return Ok(count);
        }

        let pivot = self.nodes[id.0].pivot;
        let first_child = self.nodes.len();
        for quadrant in region.split_quadrants(&pivot) {
            self.nodes.push(QuadNode::new(quadrant, depth + 1, Some(id)));
        }
        let children = [
            NodeId(first_child),
            NodeId(first_child + 1),
            NodeId(first_child + 2),
            NodeId(first_child + 3),
        ];
        self.nodes[id.0].children = Some(children);

        let mut children_count = 0;
        for child in children {
            children_count += self.subdivide(child, source, limits)?;
        }
        // Points are counted again per quadrant, so keep the parent consistent with its children
        self.nodes[id.0].point_count = children_count;
        Ok(children_count)
    }

    pub fn node(&self, id: NodeId) -> &QuadNode {
        &self.nodes[id.0]
    }

    pub fn root(&self) -> &QuadNode {
        &self.nodes[NodeId::ROOT.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth of the deepest node
    pub fn max_depth(&self) -> usize {
        self.max_depth_reached
    }

    /// All leaf nodes, in arena order
    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_leaf())
            .map(|(idx, _)| NodeId(idx))
    }

    /// The ancestors of `id`, starting with its parent and ending with the root
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.node(id).parent, move |current| self.node(*current).parent)
    }

    /// All leaves in the subtree of `id` (including `id` itself if it is a leaf)
    pub fn leaves_below(&self, id: NodeId) -> Vec<NodeId> {
        let mut leaves = vec![];
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            match self.node(current).children {
                Some(children) => stack.extend(children.iter().rev()),
                None => leaves.push(current),
            }
        }
        leaves
    }

    /// The leaf whose footprint contains the XY position of `point`. Points outside of the root footprint
    /// are assigned to the nearest leaf along the split lines
    pub fn leaf_at(&self, point: &Point3<f64>) -> NodeId {
        let mut current = NodeId::ROOT;
        while let Some(children) = self.node(current).children {
            current = children[self.node(current).quadrant_of(point.x, point.y)];
        }
        current
    }

    /// Routes the triangles of `surface` into the tree. A triangle descends as long as its bounding box lies
    /// on one side of both split lines of a node, and is stored at the node where it straddles a split line
    /// or at the leaf it ends up in. Replaces all previously indexed triangles
    pub fn index_triangles(&mut self, surface: &Surface) {
        for node in &mut self.nodes {
            node.triangles.clear();
        }
        for triangle in 0..surface.triangle_count() {
            let bounds = surface.triangle_bounds(triangle);
            let mut current = NodeId::ROOT;
            loop {
                let node = &self.nodes[current.0];
                let children = match node.children {
                    Some(children) => children,
                    None => break,
                };
                let low = node.quadrant_of(bounds.min().x, bounds.min().y);
                let high = node.quadrant_of(bounds.max().x, bounds.max().y);
                if low != high {
                    break;
                }
                current = children[low];
            }
            self.nodes[current.0].triangles.push(triangle);
        }
    }

    /// Indices of all indexed triangles whose bounding box overlaps the XY `footprint`, in ascending order
    pub fn triangles_overlapping(&self, footprint: &AABB<f64>, surface: &Surface) -> Vec<usize> {
        let mut found = vec![];
        let mut stack = vec![NodeId::ROOT];
        while let Some(current) = stack.pop() {
            let node = self.node(current);
            found.extend(
                node.triangles
                    .iter()
                    .copied()
                    .filter(|t| surface.triangle_bounds(*t).intersects_footprint(footprint)),
            );
            if let Some(children) = node.children {
                let low = footprint.min();
                let high = footprint.max();
                let pivot = node.pivot;
                let take_low_x = low.x < pivot.x;
                let take_high_x = high.x >= pivot.x;
                let take_low_y = low.y < pivot.y;
                let take_high_y = high.y >= pivot.y;
                for (quadrant, child) in children.iter().enumerate() {
                    let x_ok = if quadrant % 2 == 0 { take_low_x } else { take_high_x };
                    let y_ok = if quadrant / 2 == 0 { take_low_y } else { take_high_y };
                    if x_ok && y_ok {
                        stack.push(*child);
                    }
                }
            }
        }
        found.sort_unstable();
        found
    }

    /// Finds the triangle to test `point` against by looking at the triangles stored on the path from the
    /// root to the leaf containing `point`. Returns `None` if no triangle is stored on that path
    pub fn find_triangle(&self, point: &Point3<f64>, surface: &Surface) -> Option<usize> {
        let mut candidates: Vec<usize> = self.root().triangles.clone();
        let mut current = NodeId::ROOT;
        while let Some(children) = self.node(current).children {
            current = children[self.node(current).quadrant_of(point.x, point.y)];
            candidates.extend_from_slice(&self.node(current).triangles);
        }
        surface.nearest_among(point, candidates)
    }
}
