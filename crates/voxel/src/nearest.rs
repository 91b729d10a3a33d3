//! Nearest empty voxel lookup used to seed flight paths

use glam::Vec3;

use crate::map::{VoxelIndex, VoxelMap, EMPTY_CELL};

/// Cost multiplier for horizontal displacement
pub const SIDEWAYS_PENALTY: f32 = 2.0;
/// Cost multiplier for moving down, where the point is likely underground
pub const DOWNWARD_PENALTY: f32 = 4.0;

/// Weighted squared displacement, in voxels
fn shell_cost(dx: i64, dy: i64, dz: i64) -> f32 {
    let horizontal = (dx * dx + dz * dz) as f32 * SIDEWAYS_PENALTY;
    let vertical = (dy * dy) as f32;
    if dy < 0 {
        horizontal + vertical * DOWNWARD_PENALTY
    } else {
        horizontal + vertical
    }
}

/// An empty voxel found near a query point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestEmpty {
    pub index: VoxelIndex,
    /// The query point when it was already empty, else the center of the
    /// finest voxel that was selected
    pub position: Vec3,
}

impl VoxelMap {
    /// Finds an empty voxel close to `p`, searching at most `max_radius` finest
    /// voxels away.
    ///
    /// Shells are scanned outward by Z, then X, then Y. Upward moves are the
    /// cheapest, sideways moves cost [`SIDEWAYS_PENALTY`] and downward moves
    /// [`DOWNWARD_PENALTY`], so points inside a wall or floor resolve to the space
    /// above it. Points outside the volume are clamped to its boundary first.
    pub fn find_nearest_empty(&self, p: Vec3, max_radius: usize) -> Option<NearestEmpty> {
        let nlevels = self.levels().len();
        if let Some(coords) = self.finest_coords(p) {
            let (index, _, code) = self.descend(coords, nlevels);
            if code == EMPTY_CELL {
                return Some(NearestEmpty { index, position: p });
            }
        }

        let total = self.resolution(nlevels) as i64;
        let rel = (p - self.origin()) / self.voxel_size();
        let center = [rel.x, rel.y, rel.z].map(|c| (c.floor() as i64).clamp(0, total - 1));
        let inside = |c: i64| (0..total).contains(&c);

        let mut best: Option<([i64; 3], f32)> = None;
        // Clamped points may land on an empty boundary voxel
        if self.finest_coords(p).is_none() {
            let (_, _, code) = self.descend(center.map(|c| c as usize), nlevels);
            if code == EMPTY_CELL {
                best = Some((center, 0.0));
            }
        }

        let max_radius = max_radius as i64;
        for r in 1..=max_radius {
            // Nothing on this shell can beat the current best
            if let Some((_, cost)) = best {
                if (r * r) as f32 >= cost {
                    break;
                }
            }

            for dz in -r..=r {
                let z = center[2] + dz;
                if !inside(z) {
                    continue;
                }
                for dx in -r..=r {
                    let x = center[0] + dx;
                    if !inside(x) {
                        continue;
                    }
                    let on_side = dz.abs() == r || dx.abs() == r;
                    for dy in -r..=r {
                        if !on_side && dy.abs() != r {
                            continue;
                        }
                        let y = center[1] + dy;
                        if !inside(y) {
                            continue;
                        }
                        let cost = shell_cost(dx, dy, dz);
                        if best.is_some_and(|(_, b)| cost >= b) {
                            continue;
                        }
                        let (_, _, code) = self.descend([x as usize, y as usize, z as usize], nlevels);
                        if code == EMPTY_CELL {
                            best = Some(([x, y, z], cost));
                        }
                    }
                }
            }
        }

        let ([x, y, z], _) = best?;
        let coords = [x as usize, y as usize, z as usize];
        let (index, _, _) = self.descend(coords, nlevels);
        let size = self.voxel_size();
        let position = self.origin() + (Vec3::new(x as f32, y as f32, z as f32) + Vec3::splat(0.5)) * size;
        Some(NearestEmpty { index, position })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxelizer::Voxelizer;

    /// Solid slab covering the bottom `floor` layers of an 8x8x8 volume
    fn slab(floor: usize) -> VoxelMap {
        let mut grid = Voxelizer::new(Vec3::ZERO, 1.0, [8, 8, 8]).unwrap();
        for y in 0..floor {
            for x in 0..8 {
                for z in 0..8 {
                    grid.set_solid(x, y, z);
                }
            }
        }
        VoxelMap::build(Vec3::ZERO, 1.0, &[2, 2, 2], &grid).unwrap()
    }

    #[test]
    fn test_empty_point_is_returned_unchanged() {
        let map = slab(2);
        let p = Vec3::new(3.3, 5.1, 2.7);
        let found = map.find_nearest_empty(p, 4).unwrap();
        assert_eq!(found.position, p);
        assert_eq!(Some(found.index), map.find_leaf(p));
    }

    #[test]
    fn test_buried_point_rises_to_the_surface() {
        let map = slab(3);
        let found = map.find_nearest_empty(Vec3::new(4.5, 1.5, 4.5), 4).unwrap();
        assert_eq!(found.position, Vec3::new(4.5, 3.5, 4.5));
        assert!(map.is_empty(found.index));
    }

    #[test]
    fn test_upward_preferred_over_sideways() {
        // Solid column at x = 4 plus a floor; the point sits in the column
        let mut grid = Voxelizer::new(Vec3::ZERO, 1.0, [8, 8, 8]).unwrap();
        for y in 0..4 {
            grid.set_solid(4, y, 4);
        }
        let map = VoxelMap::build(Vec3::ZERO, 1.0, &[2, 2, 2], &grid).unwrap();
        // One step sideways costs 2, one step up costs 1
        let found = map.find_nearest_empty(Vec3::new(4.5, 3.5, 4.5), 4).unwrap();
        assert_eq!(found.position, Vec3::new(4.5, 4.5, 4.5));
        // Deep in the column, two steps up (4) loses to one sideways (2)
        let found = map.find_nearest_empty(Vec3::new(4.5, 1.5, 4.5), 4).unwrap();
        assert_eq!(found.position.y, 1.5);
        assert_eq!(
            (found.position.x - 4.5).abs() + (found.position.z - 4.5).abs(),
            1.0
        );
    }

    #[test]
    fn test_radius_limits_the_search() {
        let map = slab(6);
        assert!(map.find_nearest_empty(Vec3::new(4.5, 0.5, 4.5), 2).is_none());
        assert!(map.find_nearest_empty(Vec3::new(4.5, 0.5, 4.5), 6).is_some());
    }

    #[test]
    fn test_outside_point_is_clamped() {
        let map = slab(1);
        let found = map.find_nearest_empty(Vec3::new(4.5, 20.0, 4.5), 2).unwrap();
        assert_eq!(found.position, Vec3::new(4.5, 7.5, 4.5));
    }
}
