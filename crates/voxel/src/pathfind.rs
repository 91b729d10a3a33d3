//! Volumetric A* over the leaves of a [`VoxelMap`]
//!
//! Nodes are empty leaves of any level. A node is entered at the point of its
//! bounds closest to the node it was reached from, so paths through large coarse
//! cells stay short. With raycasting enabled a neighbour may take the current
//! node's parent as its own parent when the straight segment between them is
//! clear, which removes most of the grid staircase.

use std::collections::HashMap;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use navkit_common::{CancellationToken, Result};

use crate::map::{VoxelIndex, VoxelMap};
use crate::nearest::NearestEmpty;

const NULL_NODE: u32 = u32::MAX;
const NOT_IN_HEAP: u32 = u32::MAX;

/// Iterations between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Heuristic scale keeping the distance estimate below the true cost
const HEURISTIC_SCALE: f32 = 0.999;

/// Voxel search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Reparent through the grandparent when it has line of sight
    pub use_raycast: bool,
    /// Scale of the random cost added to each step
    pub random_multiplier: f32,
    /// Extra cost per unit of vertical movement
    pub vertical_penalty: f32,
    /// Node expansions before the search gives up
    pub max_steps: usize,
    /// Seed of the step jitter
    pub seed: u64,
    /// Report every voxel crossed instead of the kept waypoints only
    pub dense: bool,
    /// Enter voxels at their centers instead of the closest boundary point
    pub snap_to_centers: bool,
    /// Search radius, in finest voxels, for the empty voxels nearest to the endpoints
    pub nearest_radius: usize,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            use_raycast: true,
            random_multiplier: 0.05,
            vertical_penalty: 0.2,
            max_steps: 200_000,
            seed: 0x5eed,
            dense: false,
            snap_to_centers: false,
            nearest_radius: 16,
        }
    }
}

/// Path found through the voxel volume
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelPath {
    pub points: Vec<Vec3>,
    /// Voxels of the kept waypoints, or every voxel crossed for dense paths
    pub voxels: Vec<VoxelIndex>,
    /// Accumulated edge cost
    pub cost: f32,
    /// Node expansions used
    pub steps: usize,
}

#[derive(Debug, Clone)]
struct Node {
    index: VoxelIndex,
    pos: Vec3,
    g: f32,
    h: f32,
    parent: u32,
    heap_index: u32,
}

impl Node {
    #[inline]
    fn f(&self) -> f32 {
        self.g + self.h
    }
}

/// Binary min-heap of node indices ordered by F, ties going to the larger G
#[derive(Debug, Default)]
struct OpenList {
    heap: Vec<u32>,
}

impl OpenList {
    #[inline]
    fn before(nodes: &[Node], a: u32, b: u32) -> bool {
        let (na, nb) = (&nodes[a as usize], &nodes[b as usize]);
        let (fa, fb) = (na.f(), nb.f());
        fa < fb || (fa == fb && na.g > nb.g)
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn push(&mut self, nodes: &mut [Node], node: u32) {
        self.heap.push(node);
        let i = self.heap.len() - 1;
        nodes[node as usize].heap_index = i as u32;
        self.bubble_up(nodes, i);
    }

    fn pop(&mut self, nodes: &mut [Node]) -> Option<u32> {
        let top = *self.heap.first()?;
        let last = self.heap.pop()?;
        nodes[top as usize].heap_index = NOT_IN_HEAP;
        if !self.heap.is_empty() {
            self.heap[0] = last;
            nodes[last as usize].heap_index = 0;
            self.trickle_down(nodes, 0);
        }
        Some(top)
    }

    /// Restores the order after the node's cost decreased
    fn decrease(&mut self, nodes: &mut [Node], node: u32) {
        let i = nodes[node as usize].heap_index;
        if i != NOT_IN_HEAP {
            self.bubble_up(nodes, i as usize);
        }
    }

    fn bubble_up(&mut self, nodes: &mut [Node], mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !Self::before(nodes, self.heap[i], self.heap[parent]) {
                break;
            }
            self.swap(nodes, i, parent);
            i = parent;
        }
    }

    fn trickle_down(&mut self, nodes: &mut [Node], mut i: usize) {
        loop {
            let (left, right) = (2 * i + 1, 2 * i + 2);
            let mut best = i;
            if left < self.heap.len() && Self::before(nodes, self.heap[left], self.heap[best]) {
                best = left;
            }
            if right < self.heap.len() && Self::before(nodes, self.heap[right], self.heap[best]) {
                best = right;
            }
            if best == i {
                break;
            }
            self.swap(nodes, i, best);
            i = best;
        }
    }

    fn swap(&mut self, nodes: &mut [Node], a: usize, b: usize) {
        self.heap.swap(a, b);
        nodes[self.heap[a] as usize].heap_index = a as u32;
        nodes[self.heap[b] as usize].heap_index = b as u32;
    }
}

/// A* search over one voxel map
pub struct VoxelPathfinder<'a> {
    map: &'a VoxelMap,
    settings: PathSettings,
    cancel: CancellationToken,
}

impl<'a> VoxelPathfinder<'a> {
    pub fn new(map: &'a VoxelMap, settings: PathSettings) -> Self {
        Self {
            map,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to abort long searches
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn settings(&self) -> &PathSettings {
        &self.settings
    }

    /// Point where a path coming from `from` enters `index`
    fn entry_point(&self, index: VoxelIndex, from: Vec3, goal: VoxelIndex, goal_pos: Vec3) -> Option<Vec3> {
        if index == goal {
            return Some(goal_pos);
        }
        let bounds = self.map.voxel_bounds(index)?;
        if self.settings.snap_to_centers {
            Some(bounds.center())
        } else {
            Some(bounds.clamp(from))
        }
    }

    #[inline]
    fn step_cost(&self, a: Vec3, b: Vec3, jitter: f32) -> f32 {
        a.distance(b) + self.settings.vertical_penalty * (b.y - a.y).abs() + jitter
    }

    /// Finds a path between two world positions.
    ///
    /// Both endpoints are first moved to the nearest empty voxel. Returns `Ok(None)`
    /// when either endpoint has no empty voxel nearby, the goal is unreachable, or
    /// the step budget runs out.
    pub fn find_path(&self, start: Vec3, goal: Vec3) -> Result<Option<VoxelPath>> {
        let map = self.map;
        let radius = self.settings.nearest_radius;
        let Some(start_voxel) = map.find_nearest_empty(start, radius) else {
            log::debug!("No empty voxel near path start {:?}", start);
            return Ok(None);
        };
        let Some(goal_voxel) = map.find_nearest_empty(goal, radius) else {
            log::debug!("No empty voxel near path goal {:?}", goal);
            return Ok(None);
        };

        let center_of = |found: NearestEmpty| {
            if self.settings.snap_to_centers {
                map.voxel_center(found.index).unwrap_or(found.position)
            } else {
                found.position
            }
        };
        let start_pos = center_of(start_voxel);
        let goal_pos = center_of(goal_voxel);
        let goal_index = goal_voxel.index;

        let mut rng = fastrand::Rng::with_seed(self.settings.seed);
        let mut nodes: Vec<Node> = Vec::new();
        let mut lookup: HashMap<u64, u32> = HashMap::new();
        let mut open = OpenList::default();
        let mut neighbours: Vec<VoxelIndex> = Vec::with_capacity(32);

        nodes.push(Node {
            index: start_voxel.index,
            pos: start_pos,
            g: 0.0,
            h: start_pos.distance(goal_pos) * HEURISTIC_SCALE,
            parent: NULL_NODE,
            heap_index: NOT_IN_HEAP,
        });
        lookup.insert(start_voxel.index.0, 0);
        open.push(&mut nodes, 0);

        let mut steps = 0usize;
        while let Some(current) = open.pop(&mut nodes) {
            steps += 1;
            if steps % CANCEL_CHECK_INTERVAL == 0 {
                self.cancel.check()?;
            }
            if steps > self.settings.max_steps {
                log::warn!(
                    "Voxel path search gave up after {} steps ({} nodes)",
                    self.settings.max_steps,
                    nodes.len()
                );
                return Ok(None);
            }

            let cur = nodes[current as usize].clone();
            if cur.index == goal_index {
                let path = self.reconstruct(&nodes, current, steps);
                log::debug!(
                    "Voxel path with {} points, cost {:.2}, {} steps",
                    path.points.len(),
                    path.cost,
                    steps
                );
                return Ok(Some(path));
            }

            neighbours.clear();
            map.for_each_empty_neighbour(cur.index, |n| neighbours.push(n));

            for &n in &neighbours {
                let Some(pos) = self.entry_point(n, cur.pos, goal_index, goal_pos) else {
                    continue;
                };
                let jitter = if self.settings.random_multiplier > 0.0 {
                    rng.f32() * self.settings.random_multiplier
                } else {
                    0.0
                };

                let mut parent = current;
                let mut entry = pos;
                let mut g = cur.g + self.step_cost(cur.pos, pos, jitter);

                if self.settings.use_raycast && cur.parent != NULL_NODE {
                    let gp = &nodes[cur.parent as usize];
                    if let Some(gp_entry) = self.entry_point(n, gp.pos, goal_index, goal_pos) {
                        let gp_g = gp.g + self.step_cost(gp.pos, gp_entry, jitter);
                        if gp_g <= g && map.line_of_sight(gp.pos, gp_entry) {
                            parent = cur.parent;
                            entry = gp_entry;
                            g = gp_g;
                        }
                    }
                }

                match lookup.get(&n.0) {
                    Some(&existing) => {
                        let node = &mut nodes[existing as usize];
                        if g >= node.g {
                            continue;
                        }
                        node.g = g;
                        node.pos = entry;
                        node.h = entry.distance(goal_pos) * HEURISTIC_SCALE;
                        node.parent = parent;
                        if node.heap_index == NOT_IN_HEAP {
                            open.push(&mut nodes, existing);
                        } else {
                            open.decrease(&mut nodes, existing);
                        }
                    }
                    None => {
                        let id = nodes.len() as u32;
                        nodes.push(Node {
                            index: n,
                            pos: entry,
                            g,
                            h: entry.distance(goal_pos) * HEURISTIC_SCALE,
                            parent,
                            heap_index: NOT_IN_HEAP,
                        });
                        lookup.insert(n.0, id);
                        open.push(&mut nodes, id);
                    }
                }
            }
        }

        debug_assert!(open.is_empty());
        log::debug!("Voxel path search exhausted {} nodes without reaching the goal", nodes.len());
        Ok(None)
    }

    fn reconstruct(&self, nodes: &[Node], goal: u32, steps: usize) -> VoxelPath {
        let mut chain = Vec::new();
        let mut at = goal;
        while at != NULL_NODE {
            chain.push(at);
            at = nodes[at as usize].parent;
        }
        chain.reverse();

        let points: Vec<Vec3> = chain.iter().map(|&i| nodes[i as usize].pos).collect();
        let voxels = if self.settings.dense {
            let mut dense: Vec<VoxelIndex> = Vec::new();
            for pair in points.windows(2) {
                for v in self.map.voxels_in_line(pair[0], pair[1]) {
                    if dense.last() != Some(&v) {
                        dense.push(v);
                    }
                }
            }
            if dense.is_empty() {
                dense.push(nodes[goal as usize].index);
            }
            dense
        } else {
            chain.iter().map(|&i| nodes[i as usize].index).collect()
        };

        VoxelPath {
            points,
            voxels,
            cost: nodes[goal as usize].g,
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxelizer::Voxelizer;

    fn exact() -> PathSettings {
        PathSettings {
            use_raycast: false,
            random_multiplier: 0.0,
            vertical_penalty: 0.0,
            snap_to_centers: true,
            ..PathSettings::default()
        }
    }

    fn grid_map(solid: impl Fn(usize, usize, usize) -> bool) -> VoxelMap {
        let mut grid = Voxelizer::new(Vec3::ZERO, 1.0, [8, 8, 8]).unwrap();
        for y in 0..8 {
            for x in 0..8 {
                for z in 0..8 {
                    if solid(x, y, z) {
                        grid.set_solid(x, y, z);
                    }
                }
            }
        }
        VoxelMap::build(Vec3::ZERO, 1.0, &[8], &grid).unwrap()
    }

    #[test]
    fn test_open_list_order() {
        let mut nodes: Vec<Node> = [(3.0, 0.0), (1.0, 1.0), (1.0, 0.5), (2.0, 0.0)]
            .iter()
            .map(|&(g, h)| Node {
                index: VoxelIndex::NONE,
                pos: Vec3::ZERO,
                g,
                h,
                parent: NULL_NODE,
                heap_index: NOT_IN_HEAP,
            })
            .collect();
        let mut open = OpenList::default();
        for i in 0..4 {
            open.push(&mut nodes, i);
        }
        // F: 3, 2, 1.5, 2 with the tie at 2 going to the larger G
        assert_eq!(open.pop(&mut nodes), Some(2));
        assert_eq!(open.pop(&mut nodes), Some(3));
        assert_eq!(open.pop(&mut nodes), Some(1));

        nodes[0].g = 0.5;
        open.decrease(&mut nodes, 0);
        assert_eq!(open.pop(&mut nodes), Some(0));
        assert!(open.is_empty());
    }

    #[test]
    fn test_straight_corridor() {
        let map = grid_map(|_, _, _| false);
        let path = VoxelPathfinder::new(&map, exact())
            .find_path(Vec3::new(0.5, 0.5, 0.5), Vec3::new(7.5, 0.5, 0.5))
            .unwrap()
            .unwrap();
        assert_eq!(path.cost, 7.0);
        assert_eq!(path.points.len(), 8);
        assert_eq!(path.points[0], Vec3::new(0.5, 0.5, 0.5));
        assert_eq!(path.points[7], Vec3::new(7.5, 0.5, 0.5));
    }

    #[test]
    fn test_wall_forces_detour() {
        // Wall at x = 4 with a single opening at the top corner
        let map = grid_map(|x, y, z| x == 4 && !(y == 7 && z == 7));
        let path = VoxelPathfinder::new(&map, exact())
            .find_path(Vec3::new(0.5, 0.5, 0.5), Vec3::new(7.5, 0.5, 0.5))
            .unwrap()
            .unwrap();
        // 7 along x plus 7 up and back down plus 7 across z and back
        assert_eq!(path.cost, 7.0 + 14.0 + 14.0);
        assert!(path.voxels.iter().all(|&v| map.is_empty(v)));
    }

    #[test]
    fn test_unreachable_goal() {
        let map = grid_map(|x, _, _| x == 4);
        let found = VoxelPathfinder::new(&map, exact())
            .find_path(Vec3::new(0.5, 0.5, 0.5), Vec3::new(7.5, 0.5, 0.5))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_raycast_straightens_path() {
        let map = grid_map(|_, _, _| false);
        let settings = PathSettings {
            use_raycast: true,
            ..exact()
        };
        let path = VoxelPathfinder::new(&map, settings)
            .find_path(Vec3::new(0.5, 0.5, 0.5), Vec3::new(7.5, 0.5, 7.5))
            .unwrap()
            .unwrap();
        assert!(path.points.len() < 15);
        assert!(path.cost < 14.0);
        assert!(path.cost >= 7.0 * 2f32.sqrt() - 1e-3);
    }

    #[test]
    fn test_step_budget() {
        let map = grid_map(|_, _, _| false);
        let settings = PathSettings { max_steps: 3, ..exact() };
        let found = VoxelPathfinder::new(&map, settings)
            .find_path(Vec3::new(0.5, 0.5, 0.5), Vec3::new(7.5, 7.5, 7.5))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_dense_path_lists_crossed_voxels() {
        let map = grid_map(|_, _, _| false);
        let settings = PathSettings {
            use_raycast: true,
            dense: true,
            ..exact()
        };
        let path = VoxelPathfinder::new(&map, settings)
            .find_path(Vec3::new(0.5, 0.5, 0.5), Vec3::new(7.5, 0.5, 0.5))
            .unwrap()
            .unwrap();
        assert_eq!(path.voxels.len(), 8);
        assert_eq!(path.points.len(), 2);
    }
}
