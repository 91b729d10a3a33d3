//! Path queries against a built navmesh
//!
//! Walking paths run over the polygon mesh; flying paths over the voxel volume.
//! A point with no polygon or empty voxel nearby, or a goal that cannot be
//! reached, is an ordinary outcome: the query logs it and returns `Ok(None)`.

use glam::Vec3;

use navkit_common::Result;
use navkit_detour::{
    FindPathOptions, NavMeshQuery, PolyRef, QueryFilter, Status, StraightPathFlags, DEFAULT_QUERY_EXTENTS,
};
use navkit_voxel::{PathSettings, VoxelPath, VoxelPathfinder};

use crate::Navmesh;

/// Raycast ranges tried, in order, before falling back to a plain search
const ANY_ANGLE_RAYCAST_LIMITS: [f32; 2] = [25.0, 8.0];

/// How the polygon corridor becomes waypoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkPathMode {
    /// Taut path through the corridor
    #[default]
    Straight,
    /// Center of every corridor polygon
    PolyCenters,
}

/// Options for [`Navmesh::walk_path`]
#[derive(Debug, Clone)]
pub struct WalkPathOptions {
    pub mode: WalkPathMode,
    /// Let the search shortcut through polygons in line of sight
    pub any_angle: bool,
    /// Half extents of the box searched for the polygons under the endpoints
    pub extents: Vec3,
    /// Most waypoints a straight path may hold
    pub max_points: usize,
    pub filter: QueryFilter,
}

impl Default for WalkPathOptions {
    fn default() -> Self {
        Self {
            mode: WalkPathMode::Straight,
            any_angle: false,
            extents: DEFAULT_QUERY_EXTENTS,
            max_points: 256,
            filter: QueryFilter::default(),
        }
    }
}

/// Path over the walkable surface
#[derive(Debug, Clone, PartialEq)]
pub struct WalkPath {
    pub points: Vec<Vec3>,
    /// Polygon corridor from the start polygon
    pub polys: Vec<PolyRef>,
    /// Indices into `points` where an off-mesh connection starts
    pub off_mesh_points: Vec<usize>,
    /// The goal could not be reached and the path ends as close to it as possible
    pub partial: bool,
}

impl WalkPath {
    /// Sum of the segment lengths
    pub fn length(&self) -> f32 {
        self.points.windows(2).map(|w| w[0].distance(w[1])).sum()
    }
}

impl Navmesh {
    /// Finds a walking path from `from` to `to`.
    ///
    /// A complete path always ends exactly at `to`.
    pub fn walk_path(&self, from: Vec3, to: Vec3, options: &WalkPathOptions) -> Result<Option<WalkPath>> {
        let mut query = NavMeshQuery::new(&self.nav_mesh);
        let filter = &options.filter;

        let Some((start_ref, start_pos)) = query.find_nearest_poly(from, options.extents, filter)? else {
            log::error!("No walkable polygon near path start {}", from);
            return Ok(None);
        };
        let Some((end_ref, end_pos)) = query.find_nearest_poly(to, options.extents, filter)? else {
            log::error!("No walkable polygon near path end {}", to);
            return Ok(None);
        };

        let (polys, status) = Self::search(&mut query, start_ref, end_ref, start_pos, end_pos, options)?;
        let partial = status == Status::PartialResult;
        if partial {
            log::debug!("Path from {} to {} only reaches part of the way", from, to);
        }

        let mut off_mesh_points = Vec::new();
        let mut points = match options.mode {
            WalkPathMode::Straight => {
                let corridor_end = if partial { end_pos } else { to };
                let straight = query.find_straight_path(start_pos, corridor_end, &polys, options.max_points)?;
                if straight.status == Status::BufferTooSmall {
                    log::warn!("Straight path truncated at {} points", options.max_points);
                }
                off_mesh_points.extend(
                    straight
                        .flags
                        .iter()
                        .enumerate()
                        .filter(|(_, f)| f.contains(StraightPathFlags::OFFMESH_CONNECTION))
                        .map(|(i, _)| i),
                );
                straight.points
            }
            WalkPathMode::PolyCenters => {
                let mut points = query.poly_center_path(&polys, to)?;
                // Re-added below unless the path is partial
                points.pop();
                points
            }
        };

        if !partial {
            match points.last_mut() {
                Some(last) if last.distance_squared(to) < 1e-8 => *last = to,
                _ => points.push(to),
            }
        }

        Ok(Some(WalkPath {
            points,
            polys,
            off_mesh_points,
            partial,
        }))
    }

    /// Polygon search, trying any-angle shortcuts first when asked to
    fn search(
        query: &mut NavMeshQuery,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        options: &WalkPathOptions,
    ) -> Result<(Vec<PolyRef>, Status)> {
        let filter = &options.filter;
        if options.any_angle {
            for limit in ANY_ANGLE_RAYCAST_LIMITS {
                let attempt = FindPathOptions {
                    any_angle: true,
                    raycast_limit: limit,
                };
                match query.find_path_with_options(start_ref, end_ref, start_pos, end_pos, filter, attempt) {
                    Ok((path, Status::Success)) => return Ok((path, Status::Success)),
                    Ok(_) => log::debug!("Any-angle search with range {} did not reach the goal", limit),
                    Err(err) => log::debug!("Any-angle search with range {} failed: {}", limit, err),
                }
            }
        }
        query.find_path(start_ref, end_ref, start_pos, end_pos, filter)
    }

    /// Finds a flying path through the voxel volume
    pub fn fly_path(&self, from: Vec3, to: Vec3, settings: &PathSettings) -> Result<Option<VoxelPath>> {
        let Some(map) = self.voxel_map.as_ref() else {
            log::error!("Navmesh has no flight volume");
            return Ok(None);
        };
        let path = VoxelPathfinder::new(map, settings.clone()).find_path(from, to)?;
        if path.is_none() {
            log::error!("No flight path from {} to {}", from, to);
        }
        Ok(path)
    }

    /// Polygons connected to the polygon under `seed`, empty when there is none
    pub fn find_reachable_polys(&self, seed: Vec3, filter: &QueryFilter) -> Result<Vec<PolyRef>> {
        let query = NavMeshQuery::new(&self.nav_mesh);
        match query.find_nearest_poly(seed, DEFAULT_QUERY_EXTENTS, filter)? {
            Some((start, _)) => query.find_reachable_polys(start, filter),
            None => {
                log::error!("No polygon near reachability seed {}", seed);
                Ok(Vec::new())
            }
        }
    }

    /// Highest walkable point under `(x, z)` at or below `ref_y`
    pub fn find_point_on_floor(&self, x: f32, z: f32, ref_y: f32, max_depth: f32) -> Result<Option<Vec3>> {
        let query = NavMeshQuery::new(&self.nav_mesh);
        let hit = query.find_point_on_floor(x, z, ref_y, max_depth, &QueryFilter::default())?;
        Ok(hit.map(|(_, p)| p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BuildSettings, NavmeshBuilder};
    use glam::Affine3A;
    use navkit_common::{Mesh, MeshPart, MeshType, OffMeshLink, Scene, SceneBuilder};

    fn two_floors() -> Scene {
        // Two 8x8 floors 6 units apart along x with a jump link between them
        SceneBuilder::new()
            .add_mesh(Mesh::new("floor", MeshType::AnalyticPlane, vec![MeshPart::plane(4.0, 4.0)]))
            .place("floor", 1, Affine3A::from_translation(Vec3::new(-7.0, 0.0, 0.0)))
            .place("floor", 2, Affine3A::from_translation(Vec3::new(7.0, 0.0, 0.0)))
            .add_off_mesh_link(OffMeshLink {
                start: Vec3::new(-4.0, 0.0, 0.0),
                end: Vec3::new(4.0, 0.0, 0.0),
                radius: 0.5,
                bidirectional: true,
                area: 63,
                flags: 0x04,
                user_id: 11,
            })
            .build()
    }

    fn build(scene: &Scene) -> Navmesh {
        NavmeshBuilder::new(BuildSettings::default())
            .unwrap()
            .build(scene)
            .unwrap()
            .0
    }

    #[test]
    fn test_walk_path_crosses_off_mesh_link() {
        let navmesh = build(&two_floors());
        let to = Vec3::new(8.0, 0.0, 1.0);
        let path = navmesh
            .walk_path(Vec3::new(-8.0, 0.0, 1.0), to, &WalkPathOptions::default())
            .unwrap()
            .unwrap();
        assert!(!path.partial);
        assert_eq!(*path.points.last().unwrap(), to);
        assert_eq!(path.off_mesh_points.len(), 1);
        let jump = path.off_mesh_points[0];
        assert!((path.points[jump].x + 4.0).abs() < 0.6);
        assert!((path.points[jump + 1].x - 4.0).abs() < 0.6);
    }

    #[test]
    fn test_poly_center_path_ends_at_goal() {
        let navmesh = build(&two_floors());
        let to = Vec3::new(-6.0, 0.0, 2.0);
        let options = WalkPathOptions {
            mode: WalkPathMode::PolyCenters,
            ..WalkPathOptions::default()
        };
        let path = navmesh.walk_path(Vec3::new(-9.0, 0.0, -2.0), to, &options).unwrap().unwrap();
        assert_eq!(path.points.len(), path.polys.len() + 1);
        assert_eq!(*path.points.last().unwrap(), to);
    }

    #[test]
    fn test_any_angle_path_matches_plain_length() {
        let navmesh = build(&two_floors());
        let (from, to) = (Vec3::new(-9.5, 0.0, -3.0), Vec3::new(-4.5, 0.0, 3.0));
        let plain = navmesh.walk_path(from, to, &WalkPathOptions::default()).unwrap().unwrap();
        let options = WalkPathOptions {
            any_angle: true,
            ..WalkPathOptions::default()
        };
        let any = navmesh.walk_path(from, to, &options).unwrap().unwrap();
        assert!(!any.partial);
        assert_eq!(*any.points.last().unwrap(), to);
        assert!((any.length() - plain.length()).abs() < 1e-3);
    }

    #[test]
    fn test_query_misses_return_none() {
        let navmesh = build(&two_floors());
        let far = Vec3::new(0.0, 50.0, 40.0);
        let path = navmesh
            .walk_path(Vec3::new(-7.0, 0.0, 0.0), far, &WalkPathOptions::default())
            .unwrap();
        assert!(path.is_none());
        assert!(navmesh
            .fly_path(Vec3::ZERO, Vec3::ONE, &PathSettings::default())
            .unwrap()
            .is_none());
        assert!(navmesh
            .find_reachable_polys(far, &QueryFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_link_joins_reachable_regions() {
        let navmesh = build(&two_floors());
        let mut filter = QueryFilter::default();
        let all = navmesh.find_reachable_polys(Vec3::new(-7.0, 0.0, 0.0), &filter).unwrap();
        assert_eq!(all.len(), navmesh.poly_count() + 1);

        filter.exclude_flags |= navkit_detour::PolyFlags::JUMP;
        let left = navmesh.find_reachable_polys(Vec3::new(-7.0, 0.0, 0.0), &filter).unwrap();
        assert!(left.len() < all.len() - 1);
    }

    #[test]
    fn test_point_on_floor() {
        let navmesh = build(&two_floors());
        let p = navmesh.find_point_on_floor(7.0, 1.0, 10.0, 20.0).unwrap().unwrap();
        assert!(p.y.abs() < 0.3);
        assert!(navmesh.find_point_on_floor(7.0, 1.0, -1.0, 2.0).unwrap().is_none());
        assert!(navmesh.find_point_on_floor(0.0, 0.0, 10.0, 20.0).unwrap().is_none());
    }
}
