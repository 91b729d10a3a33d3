//! Node pool and open list for polygon searches

use std::collections::HashMap;

use glam::Vec3;

use crate::PolyRef;

/// Index of a node in the pool
pub(crate) type NodeIndex = u32;

pub(crate) const NULL_NODE: NodeIndex = NodeIndex::MAX;

pub(crate) const NODE_OPEN: u8 = 0x01;
pub(crate) const NODE_CLOSED: u8 = 0x02;

/// Search node: one per visited polygon
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub poly: PolyRef,
    /// Point where the search entered the polygon
    pub pos: Vec3,
    /// Cost from the start
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    pub parent: NodeIndex,
    pub flags: u8,
}

/// Bounded pool of search nodes
#[derive(Debug)]
pub(crate) struct NodePool {
    nodes: Vec<Node>,
    lookup: HashMap<PolyRef, NodeIndex>,
    max_nodes: usize,
}

impl NodePool {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::new(),
            lookup: HashMap::new(),
            max_nodes,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
    }

    pub fn find(&self, poly: PolyRef) -> Option<NodeIndex> {
        self.lookup.get(&poly).copied()
    }

    /// Existing node for `poly`, or a fresh one. `None` once the pool is full.
    pub fn get_or_insert(&mut self, poly: PolyRef) -> Option<NodeIndex> {
        if let Some(&idx) = self.lookup.get(&poly) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let idx = self.nodes.len() as NodeIndex;
        self.nodes.push(Node {
            poly,
            pos: Vec3::ZERO,
            cost: 0.0,
            total: 0.0,
            parent: NULL_NODE,
            flags: 0,
        });
        self.lookup.insert(poly, idx);
        Some(idx)
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx as usize]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Polygons from the start to `idx`
    pub fn path_to(&self, mut idx: NodeIndex) -> Vec<PolyRef> {
        let mut path = Vec::new();
        while idx != NULL_NODE {
            let node = self.node(idx);
            path.push(node.poly);
            idx = node.parent;
        }
        path.reverse();
        path
    }
}

/// Binary min-heap of node indices ordered by node total cost
#[derive(Debug, Default)]
pub(crate) struct NodeQueue {
    heap: Vec<NodeIndex>,
    /// Heap position per node, `usize::MAX` when not queued
    position: Vec<usize>,
}

impl NodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.position.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn set_position(&mut self, node: NodeIndex, pos: usize) {
        let i = node as usize;
        if i >= self.position.len() {
            self.position.resize(i + 1, usize::MAX);
        }
        self.position[i] = pos;
    }

    pub fn push(&mut self, pool: &NodePool, node: NodeIndex) {
        self.heap.push(node);
        let i = self.heap.len() - 1;
        self.set_position(node, i);
        self.bubble_up(pool, i);
    }

    pub fn pop(&mut self, pool: &NodePool) -> Option<NodeIndex> {
        if self.heap.is_empty() {
            return None;
        }
        let top = self.heap.swap_remove(0);
        self.set_position(top, usize::MAX);
        if !self.heap.is_empty() {
            let moved = self.heap[0];
            self.set_position(moved, 0);
            self.trickle_down(pool, 0);
        }
        Some(top)
    }

    /// Restores the heap after the total of a queued node decreased
    pub fn modify(&mut self, pool: &NodePool, node: NodeIndex) {
        if let Some(&pos) = self.position.get(node as usize) {
            if pos != usize::MAX {
                self.bubble_up(pool, pos);
            }
        }
    }

    fn less(pool: &NodePool, a: NodeIndex, b: NodeIndex) -> bool {
        pool.node(a).total < pool.node(b).total
    }

    fn bubble_up(&mut self, pool: &NodePool, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !Self::less(pool, self.heap[i], self.heap[parent]) {
                break;
            }
            self.heap.swap(i, parent);
            self.set_position(self.heap[i], i);
            self.set_position(self.heap[parent], parent);
            i = parent;
        }
    }

    fn trickle_down(&mut self, pool: &NodePool, mut i: usize) {
        let n = self.heap.len();
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut smallest = i;
            if l < n && Self::less(pool, self.heap[l], self.heap[smallest]) {
                smallest = l;
            }
            if r < n && Self::less(pool, self.heap[r], self.heap[smallest]) {
                smallest = r;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            self.set_position(self.heap[i], i);
            self.set_position(self.heap[smallest], smallest);
            i = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_nodes_and_respects_capacity() {
        let mut pool = NodePool::new(2);
        let a = pool.get_or_insert(PolyRef::new(1)).unwrap();
        assert_eq!(pool.get_or_insert(PolyRef::new(1)), Some(a));
        pool.get_or_insert(PolyRef::new(2)).unwrap();
        assert!(pool.get_or_insert(PolyRef::new(3)).is_none());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_queue_orders_by_total_and_handles_decrease() {
        let mut pool = NodePool::new(8);
        let mut queue = NodeQueue::new();
        for (id, total) in [(1, 5.0), (2, 3.0), (3, 4.0)] {
            let idx = pool.get_or_insert(PolyRef::new(id)).unwrap();
            pool.node_mut(idx).total = total;
            queue.push(&pool, idx);
        }
        let idx = pool.find(PolyRef::new(1)).unwrap();
        pool.node_mut(idx).total = 1.0;
        queue.modify(&pool, idx);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop(&pool))
            .map(|i| pool.node(i).poly.id())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_path_to_follows_parents() {
        let mut pool = NodePool::new(8);
        let a = pool.get_or_insert(PolyRef::new(10)).unwrap();
        let b = pool.get_or_insert(PolyRef::new(11)).unwrap();
        pool.node_mut(b).parent = a;
        assert_eq!(pool.path_to(b), vec![PolyRef::new(10), PolyRef::new(11)]);
    }
}
