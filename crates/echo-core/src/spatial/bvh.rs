//! Bulk-loaded bounding-volume hierarchy over feature bounding boxes.
//!
//! Built once per prepared layer with Sort-Tile-Recursive packing and then
//! only read, so the tree is a flat node vector with no rebalancing logic.

use geo::BoundingRect;
use geo_types::Geometry;

/// Entries per leaf and children per inner node.
pub const DEFAULT_NODE_CAPACITY: usize = 16;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn from_geometry(geom: &Geometry<f64>) -> Option<Self> {
        let rect = geom.bounding_rect()?;
        Some(Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y))
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    pub fn expanded(&self, dx: f64, dy: f64) -> BBox {
        BBox::new(self.min_x - dx, self.min_y - dy, self.max_x + dx, self.max_y + dy)
    }

    fn center(&self) -> (f64, f64) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }
}

#[derive(Debug)]
enum Node {
    Leaf { bbox: BBox, items: Vec<(BBox, usize)> },
    Inner { bbox: BBox, children: Vec<usize> },
}

impl Node {
    fn bbox(&self) -> &BBox {
        match self {
            Node::Leaf { bbox, .. } | Node::Inner { bbox, .. } => bbox,
        }
    }
}

#[derive(Debug, Default)]
pub struct Bvh {
    nodes: Vec<Node>,
    root: Option<usize>,
    len: usize,
}

/// Group entries into runs of at most `capacity` using STR tiling.
fn str_tiles<T>(mut entries: Vec<(BBox, T)>, capacity: usize) -> Vec<Vec<(BBox, T)>> {
    let capacity = capacity.max(2);
    let groups = entries.len().div_ceil(capacity);
    let slices = (groups as f64).sqrt().ceil().max(1.0) as usize;
    let per_slice = slices * capacity;

    entries.sort_by(|a, b| a.0.center().0.total_cmp(&b.0.center().0));
    let mut tiles = Vec::with_capacity(groups);
    let mut rest = entries;
    while !rest.is_empty() {
        let tail = rest.split_off(per_slice.min(rest.len()));
        let mut slice = rest;
        rest = tail;
        slice.sort_by(|a, b| a.0.center().1.total_cmp(&b.0.center().1));
        while !slice.is_empty() {
            let tail = slice.split_off(capacity.min(slice.len()));
            tiles.push(slice);
            slice = tail;
        }
    }
    tiles
}

fn enclosing(boxes: impl Iterator<Item = BBox>) -> Option<BBox> {
    boxes.reduce(|a, b| a.union(&b))
}

impl Bvh {
    /// Build from `(item, bbox)` pairs; items are caller-side indices.
    pub fn build(entries: Vec<(usize, BBox)>, capacity: usize) -> Self {
        let len = entries.len();
        let mut nodes: Vec<Node> = Vec::new();
        if entries.is_empty() {
            return Self::default();
        }

        let leaf_input: Vec<(BBox, usize)> = entries.into_iter().map(|(i, b)| (b, i)).collect();
        let mut level: Vec<(BBox, usize)> = Vec::new();
        for tile in str_tiles(leaf_input, capacity) {
            let Some(bbox) = enclosing(tile.iter().map(|(b, _)| *b)) else {
                continue;
            };
            nodes.push(Node::Leaf { bbox, items: tile });
            level.push((bbox, nodes.len() - 1));
        }

        while level.len() > 1 {
            let mut next = Vec::new();
            for tile in str_tiles(level, capacity) {
                let Some(bbox) = enclosing(tile.iter().map(|(b, _)| *b)) else {
                    continue;
                };
                nodes.push(Node::Inner {
                    bbox,
                    children: tile.into_iter().map(|(_, n)| n).collect(),
                });
                next.push((bbox, nodes.len() - 1));
            }
            level = next;
        }

        let root = level.first().map(|(_, n)| *n);
        Self { nodes, root, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bounds(&self) -> Option<BBox> {
        self.root.map(|r| *self.nodes[r].bbox())
    }

    /// Items whose boxes intersect `window`, in ascending item order.
    pub fn query(&self, window: &BBox) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if !node.bbox().intersects(window) {
                continue;
            }
            match node {
                Node::Leaf { items, .. } => out.extend(
                    items
                        .iter()
                        .filter(|(b, _)| b.intersects(window))
                        .map(|(_, i)| *i),
                ),
                Node::Inner { children, .. } => stack.extend(children.iter().copied()),
            }
        }
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<(usize, BBox)> {
        (0..n * n)
            .map(|i| {
                let (x, y) = ((i % n) as f64, (i / n) as f64);
                (i, BBox::new(x, y, x + 0.9, y + 0.9))
            })
            .collect()
    }

    #[test]
    fn test_empty_tree_returns_nothing() {
        let tree = Bvh::build(vec![], DEFAULT_NODE_CAPACITY);
        assert!(tree.is_empty());
        assert!(tree.query(&BBox::new(-1e9, -1e9, 1e9, 1e9)).is_empty());
        assert!(tree.bounds().is_none());
    }

    #[test]
    fn test_query_matches_linear_scan() {
        let entries = grid(40);
        let tree = Bvh::build(entries.clone(), 8);
        assert_eq!(tree.len(), 1600);
        let window = BBox::new(10.5, 3.2, 14.1, 7.95);
        let expected: Vec<usize> = entries
            .iter()
            .filter(|(_, b)| b.intersects(&window))
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(tree.query(&window), expected);
        assert_eq!(tree.bounds(), Some(BBox::new(0.0, 0.0, 39.9, 39.9)));
    }

    #[test]
    fn test_leaf_members_outside_the_window_are_dropped() {
        // Both entries share one leaf whose box spans the gap between them.
        let tree = Bvh::build(
            vec![(0, BBox::new(0.0, 0.0, 1.0, 1.0)), (1, BBox::new(9.0, 9.0, 10.0, 10.0))],
            DEFAULT_NODE_CAPACITY,
        );
        assert!(tree.query(&BBox::new(4.0, 4.0, 5.0, 5.0)).is_empty());
        assert_eq!(tree.query(&BBox::new(9.5, 9.5, 9.6, 9.6)), vec![1]);
    }

    #[test]
    fn test_single_entry_tree() {
        let tree = Bvh::build(vec![(7, BBox::new(1.0, 1.0, 2.0, 2.0))], 4);
        assert_eq!(tree.query(&BBox::new(1.5, 1.5, 1.6, 1.6)), vec![7]);
        assert!(tree.query(&BBox::new(3.0, 3.0, 4.0, 4.0)).is_empty());
    }
}
