//! Search results checked against brute force over the same voxel graph

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use glam::Vec3;
use navkit_common::Aabb;
use navkit_voxel::{PathSettings, VoxelIndex, VoxelMap, VoxelPathfinder, Voxelizer};

#[derive(PartialEq)]
struct Entry(f32, VoxelIndex);

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.total_cmp(&self.0)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Face adjacency between empty leaves, derived from their bounds alone.
///
/// Two leaves are linked when one's max face on an axis lies on the other's min face
/// and the faces overlap with positive area.
fn leaf_graph(map: &VoxelMap) -> HashMap<VoxelIndex, Vec<(VoxelIndex, f32)>> {
    let mut leaves: Vec<(VoxelIndex, Aabb)> = Vec::new();
    map.for_each_leaf(|index, _| {
        if map.is_empty(index) {
            leaves.push((index, map.voxel_bounds(index).unwrap()));
        }
    });

    // Leaf faces grouped by axis and plane position
    let key = |axis: usize, coord: f32| (axis, (coord * 1024.0).round() as i64);
    let mut lower: HashMap<(usize, i64), Vec<usize>> = HashMap::new();
    let mut upper: HashMap<(usize, i64), Vec<usize>> = HashMap::new();
    for (i, (_, b)) in leaves.iter().enumerate() {
        for axis in 0..3 {
            lower.entry(key(axis, b.max[axis])).or_default().push(i);
            upper.entry(key(axis, b.min[axis])).or_default().push(i);
        }
    }

    let mut graph: HashMap<VoxelIndex, Vec<(VoxelIndex, f32)>> = HashMap::new();
    for (&(axis, plane), below) in &lower {
        let Some(above) = upper.get(&(axis, plane)) else {
            continue;
        };
        for &i in below {
            for &j in above {
                let (a, b) = (&leaves[i].1, &leaves[j].1);
                let touching = (0..3).filter(|&k| k != axis).all(|k| {
                    a.max[k].min(b.max[k]) - a.min[k].max(b.min[k]) > 1e-4
                });
                if touching {
                    let d = a.center().distance(b.center());
                    graph.entry(leaves[i].0).or_default().push((leaves[j].0, d));
                    graph.entry(leaves[j].0).or_default().push((leaves[i].0, d));
                }
            }
        }
    }
    graph
}

/// Dijkstra over empty leaves with center to center distances
fn dijkstra(map: &VoxelMap, start: VoxelIndex, goal: VoxelIndex) -> Option<f32> {
    let graph = leaf_graph(map);
    let mut dist: HashMap<VoxelIndex, f32> = HashMap::new();
    let mut heap = BinaryHeap::new();
    dist.insert(start, 0.0);
    heap.push(Entry(0.0, start));
    while let Some(Entry(d, v)) = heap.pop() {
        if v == goal {
            return Some(d);
        }
        if d > dist[&v] {
            continue;
        }
        for &(n, step) in graph.get(&v).map(Vec::as_slice).unwrap_or_default() {
            let nd = d + step;
            if dist.get(&n).map_or(true, |&old| nd < old) {
                dist.insert(n, nd);
                heap.push(Entry(nd, n));
            }
        }
    }
    None
}

fn exact() -> PathSettings {
    PathSettings {
        use_raycast: false,
        random_multiplier: 0.0,
        vertical_penalty: 0.0,
        snap_to_centers: true,
        ..PathSettings::default()
    }
}

/// Deterministic scatter of solid voxels plus a wall with a gap
fn obstacle_grid(size: usize) -> Voxelizer {
    let mut grid = Voxelizer::new(Vec3::ZERO, 1.0, [size; 3]).unwrap();
    let mut rng = fastrand::Rng::with_seed(7);
    for _ in 0..size * size * 2 {
        let (x, y, z) = (rng.usize(..size), rng.usize(..size), rng.usize(..size));
        grid.set_solid(x, y, z);
    }
    let wall = size / 2;
    for y in 0..size {
        for z in 0..size {
            if !(y >= size - 2 && z >= size - 2) {
                grid.set_solid(wall, y, z);
            }
        }
    }
    grid
}

#[test]
fn a_star_matches_dijkstra_on_uniform_grid() {
    let grid = obstacle_grid(16);
    let map = VoxelMap::build(Vec3::ZERO, 1.0, &[16], &grid).unwrap();
    let start = Vec3::new(0.5, 0.5, 0.5);
    let goal = Vec3::new(15.5, 0.5, 0.5);

    let finder = VoxelPathfinder::new(&map, exact());
    let path = finder.find_path(start, goal).unwrap();
    let s = map.find_nearest_empty(start, 16).unwrap().index;
    let g = map.find_nearest_empty(goal, 16).unwrap().index;
    let expected = dijkstra(&map, s, g);

    match (path, expected) {
        (Some(path), Some(expected)) => {
            assert!((path.cost - expected).abs() < 1e-3, "{} != {}", path.cost, expected);
            // Unit steps on a single level grid
            assert_eq!(path.cost.round() as usize, path.points.len() - 1);
        }
        (None, None) => {}
        (path, expected) => panic!("search disagrees: {:?} vs {:?}", path.map(|p| p.cost), expected),
    }
}

#[test]
fn a_star_matches_dijkstra_across_levels() {
    let grid = obstacle_grid(16);
    let map = VoxelMap::build(Vec3::ZERO, 1.0, &[4, 2, 2], &grid).unwrap();
    let finder = VoxelPathfinder::new(&map, exact());

    for (start, goal) in [
        (Vec3::new(0.5, 0.5, 0.5), Vec3::new(15.5, 0.5, 0.5)),
        (Vec3::new(2.5, 12.5, 3.5), Vec3::new(13.5, 1.5, 14.5)),
        (Vec3::new(15.5, 15.5, 15.5), Vec3::new(0.5, 8.5, 15.5)),
    ] {
        let s = map.find_nearest_empty(start, 16).unwrap().index;
        let g = map.find_nearest_empty(goal, 16).unwrap().index;
        let expected = dijkstra(&map, s, g);
        let found = finder.find_path(start, goal).unwrap().map(|p| p.cost);
        match (found, expected) {
            (Some(a), Some(b)) => assert!((a - b).abs() < 1e-3, "{} != {}", a, b),
            (None, None) => {}
            other => panic!("search disagrees: {:?}", other),
        }
    }
}

#[test]
fn raycast_paths_are_never_longer() {
    let mut grid = Voxelizer::new(Vec3::ZERO, 1.0, [16; 3]).unwrap();
    // A pillar in the middle of an otherwise open volume
    for y in 0..16 {
        for x in 6..10 {
            for z in 6..10 {
                grid.set_solid(x, y, z);
            }
        }
    }
    let map = VoxelMap::build(Vec3::ZERO, 1.0, &[4, 4], &grid).unwrap();
    let plain = VoxelPathfinder::new(&map, exact());
    let raycast = VoxelPathfinder::new(
        &map,
        PathSettings {
            use_raycast: true,
            ..exact()
        },
    );

    for (start, goal) in [
        (Vec3::new(0.5, 0.5, 0.5), Vec3::new(15.5, 15.5, 15.5)),
        (Vec3::new(0.5, 8.5, 8.0), Vec3::new(15.5, 8.5, 8.0)),
        (Vec3::new(3.0, 1.0, 14.0), Vec3::new(12.0, 4.0, 2.0)),
    ] {
        let a = plain.find_path(start, goal).unwrap().unwrap();
        let b = raycast.find_path(start, goal).unwrap().unwrap();
        assert!(b.cost <= a.cost + 1e-3, "raycast {} > plain {}", b.cost, a.cost);
        let (first, last) = (b.points[0], b.points[b.points.len() - 1]);
        assert!(b.cost >= first.distance(last) - 1e-3);
        for pair in b.points.windows(2) {
            assert!(map.line_of_sight(pair[0], pair[1]), "blocked segment {:?}", pair);
        }
    }
}

#[test]
fn jitter_is_reproducible_per_seed() {
    let grid = obstacle_grid(16);
    let map = VoxelMap::build(Vec3::ZERO, 1.0, &[4, 4], &grid).unwrap();
    let settings = PathSettings {
        random_multiplier: 0.5,
        ..PathSettings::default()
    };
    let start = Vec3::new(0.5, 0.5, 0.5);
    let goal = Vec3::new(15.5, 15.5, 15.5);
    let a = VoxelPathfinder::new(&map, settings.clone()).find_path(start, goal).unwrap();
    let b = VoxelPathfinder::new(&map, settings).find_path(start, goal).unwrap();
    assert_eq!(a, b);
}

/// Separating axis test between a triangle and a box
fn triangle_overlaps_box(tri: [Vec3; 3], min: Vec3, max: Vec3) -> bool {
    let center = (min + max) * 0.5;
    let half = (max - min) * 0.5;
    let v = tri.map(|p| p - center);
    let edges = [v[1] - v[0], v[2] - v[1], v[0] - v[2]];

    let mut axes = vec![Vec3::X, Vec3::Y, Vec3::Z, edges[0].cross(edges[1])];
    for e in edges {
        for a in [Vec3::X, Vec3::Y, Vec3::Z] {
            axes.push(a.cross(e));
        }
    }
    axes.into_iter().filter(|a| a.length_squared() > 1e-12).all(|axis| {
        let p = v.map(|x| x.dot(axis));
        let r = half.dot(axis.abs());
        let lo = p[0].min(p[1]).min(p[2]);
        let hi = p[0].max(p[1]).max(p[2]);
        lo <= r && hi >= -r
    })
}

#[test]
fn empty_voxels_never_touch_geometry() {
    use glam::{Affine3A, Quat};
    use navkit_common::{CancellationToken, Mesh, MeshPart, MeshType, MeshTypeMask, SceneBuilder};

    let transform = Affine3A::from_scale_rotation_translation(
        Vec3::new(3.0, 1.5, 2.0),
        Quat::from_euler(glam::EulerRot::YXZ, 0.6, 0.3, 0.2),
        Vec3::new(8.2, 7.7, 8.9),
    );
    let scene = SceneBuilder::new()
        .add_mesh(Mesh::new("rock", MeshType::AnalyticShape, vec![MeshPart::unit_sphere(6, 10)]))
        .place("rock", 1, transform)
        .supports_flight(true)
        .build();

    let mut map = VoxelMap::new(Vec3::ZERO, 0.5, &[4, 2, 4]).unwrap();
    let cancel = CancellationToken::new();
    for x in 0..4 {
        for y in 0..4 {
            for z in 0..4 {
                let subtree = navkit_voxel::build_root_cell(&map, [x, y, z], &scene, MeshTypeMask::all(), &cancel).unwrap();
                map.merge_subtree(subtree);
            }
        }
    }

    let mut triangles = Vec::new();
    for (mesh, instance) in scene.instances() {
        mesh.for_each_world_triangle(instance, |tri, _| triangles.push(tri));
    }

    let (mut empty, mut solid) = (0, 0);
    map.for_each_leaf(|index, _| {
        let bounds = map.voxel_bounds(index).unwrap();
        let shrink = Vec3::splat(1e-3);
        if map.is_empty(index) {
            empty += 1;
            for tri in &triangles {
                assert!(
                    !triangle_overlaps_box(*tri, bounds.min + shrink, bounds.max - shrink),
                    "empty voxel {:?} intersects the geometry",
                    bounds
                );
            }
        } else {
            solid += 1;
        }
    });
    assert!(empty > 0 && solid > 0);
}
