//! End to end builds of small scenes

use glam::{Affine3A, Vec3};
use navkit::{BuildSettings, Navmesh, NavmeshBuilder, PathSettings, WalkPathOptions};
use navkit_common::{Mesh, MeshPart, MeshType, OffMeshLink, Result, Scene, SceneBuilder};

fn plane_builder(with_box: bool, flight: bool) -> SceneBuilder {
    let mut builder = SceneBuilder::new();
    builder
        .add_mesh(Mesh::new("floor", MeshType::AnalyticPlane, vec![MeshPart::plane(5.0, 5.0)]))
        .add_mesh(Mesh::new("box", MeshType::AnalyticShape, vec![MeshPart::cuboid(Vec3::splat(1.0))]))
        .place("floor", 1, Affine3A::IDENTITY)
        .supports_flight(flight);
    if with_box {
        builder.place("box", 2, Affine3A::IDENTITY);
    }
    builder
}

fn plane_scene(with_box: bool, flight: bool) -> Scene {
    plane_builder(with_box, flight).build()
}

fn in_box_footprint(p: Vec3) -> bool {
    p.x.abs() < 1.0 && p.z.abs() < 1.0
}

#[test]
fn flat_plane_has_straight_path() -> Result<()> {
    let builder = NavmeshBuilder::new(BuildSettings::default())?;
    let (navmesh, report) = builder.build(&plane_scene(false, false))?;
    assert_eq!(report.built_tiles, 1);
    assert_eq!(navmesh.nav_mesh.tile_count(), 1);
    assert!(navmesh.poly_count() >= 1);

    let (from, to) = (Vec3::new(-4.0, 0.0, -4.0), Vec3::new(4.0, 0.0, 4.0));
    let path = navmesh
        .walk_path(from, to, &WalkPathOptions::default())?
        .expect("path on an open plane");
    assert_eq!(path.points.len(), 2);
    assert!((path.points[0] - from).length() < 0.3);
    assert_eq!(path.points[1], to);
    Ok(())
}

#[test]
fn box_forces_a_detour() -> Result<()> {
    let builder = NavmeshBuilder::new(BuildSettings::default())?;
    let (navmesh, _) = builder.build(&plane_scene(true, false))?;

    // Nothing walkable under or on top of the box
    assert!(navmesh.find_point_on_floor(0.0, 0.0, 5.0, 10.0)?.is_none());

    let (from, to) = (Vec3::new(-4.0, 0.0, 0.0), Vec3::new(4.0, 0.0, 0.0));
    let path = navmesh
        .walk_path(from, to, &WalkPathOptions::default())?
        .expect("path around the box");
    assert!(!path.partial);
    assert!(path.points.len() > 2);
    assert_eq!(*path.points.last().unwrap(), to);
    assert!(path.length() > from.distance(to) + 0.5);

    for segment in path.points.windows(2) {
        for step in 0..=20 {
            let p = segment[0].lerp(segment[1], step as f32 / 20.0);
            assert!(!in_box_footprint(p), "path enters the box at {}", p);
        }
    }
    Ok(())
}

#[test]
fn navmesh_round_trips_through_a_file() -> Result<()> {
    let mut settings = BuildSettings::default();
    settings.customization_version = 42;
    settings.flight.levels = vec![4, 4, 4];

    let link = OffMeshLink {
        start: Vec3::new(-3.0, 0.0, -3.0),
        end: Vec3::new(3.0, 0.0, 3.0),
        radius: 0.5,
        bidirectional: false,
        area: 63,
        flags: 0x04,
        user_id: 9,
    };
    let scene = plane_builder(true, true).add_off_mesh_link(link).build();

    let builder = NavmeshBuilder::new(settings)?;
    let (navmesh, _) = builder.build(&scene)?;
    let bytes = navmesh.to_bytes()?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("zone.nav");
    navmesh.save(&path)?;
    let loaded = Navmesh::load(&path, 42)?;
    assert!(Navmesh::load(&path, 41).is_err());

    assert_eq!(loaded.customization_version, 42);
    assert_eq!(loaded.nav_mesh.params(), navmesh.nav_mesh.params());
    assert_eq!(loaded.nav_mesh.tile_count(), navmesh.nav_mesh.tile_count());
    for ((ref_a, a), (ref_b, b)) in navmesh.nav_mesh.tiles_with_refs().zip(loaded.nav_mesh.tiles_with_refs()) {
        assert_eq!(ref_a, ref_b);
        assert_eq!(a.header, b.header);
        assert_eq!(a.verts, b.verts);
        assert_eq!(a.detail_meshes, b.detail_meshes);
        assert_eq!(a.detail_verts, b.detail_verts);
        assert_eq!(a.detail_tris, b.detail_tris);
        assert_eq!(a.bv_tree, b.bv_tree);
        assert_eq!(a.off_mesh_cons, b.off_mesh_cons);
        assert_eq!(a.polys.len(), b.polys.len());
        for (pa, pb) in a.polys.iter().zip(&b.polys) {
            assert_eq!(pa.vertex_indices(), pb.vertex_indices());
            assert_eq!(pa.neis, pb.neis);
            assert_eq!((pa.flags, pa.area, pa.poly_type), (pb.flags, pb.area, pb.poly_type));
            assert_eq!(pa.links.len(), pb.links.len());
        }
    }
    let off_mesh: usize = loaded.nav_mesh.tiles().map(|t| t.off_mesh_cons.len()).sum();
    assert_eq!(off_mesh, 1);

    let (map_a, map_b) = (navmesh.voxel_map.as_ref().unwrap(), loaded.voxel_map.as_ref().unwrap());
    assert_eq!(map_a.bounds(), map_b.bounds());
    let bounds = map_a.bounds();
    let steps = 24;
    for i in 0..steps {
        for j in 0..steps {
            for k in 0..steps {
                let t = Vec3::new(i as f32, j as f32, k as f32) / steps as f32;
                let p = bounds.min + (bounds.max - bounds.min) * (t + 0.5 / steps as f32);
                let a = map_a.find_leaf(p).map(|v| map_a.is_empty(v));
                let b = map_b.find_leaf(p).map(|v| map_b.is_empty(v));
                assert_eq!(a, b, "occupancy differs at {}", p);
            }
        }
    }

    assert_eq!(loaded.to_bytes()?, bytes);
    Ok(())
}

#[test]
fn unit_cube_fills_exactly_its_voxels() -> Result<()> {
    let mut settings = BuildSettings::default();
    settings.flight.levels = vec![2, 2, 2];
    settings.flight.voxel_size = Some(1.0);
    settings.flight.origin = Some(Vec3::ZERO);

    let scene = SceneBuilder::new()
        .add_mesh(Mesh::new("cube", MeshType::AnalyticShape, vec![MeshPart::unit_box()]))
        .place("cube", 1, Affine3A::from_translation(Vec3::splat(3.0)))
        .supports_flight(true)
        .build();
    let (navmesh, _) = NavmeshBuilder::new(settings)?.build(&scene)?;
    let map = navmesh.voxel_map.as_ref().expect("flight volume");

    for x in 0..8 {
        for y in 0..8 {
            for z in 0..8 {
                let p = Vec3::new(x as f32, y as f32, z as f32) + 0.5;
                let leaf = map.find_leaf(p).expect("inside the volume");
                let inside = [x, y, z].iter().all(|c| (2..4).contains(c));
                assert_eq!(!map.is_empty(leaf), inside, "voxel ({}, {}, {})", x, y, z);
            }
        }
    }

    // Root cells away from the cube stay single coarse leaves
    let far = map.find_leaf(Vec3::splat(6.0)).unwrap();
    assert_eq!(far.depth(map.levels().len()), 1);
    Ok(())
}

#[test]
fn flight_path_climbs_over_the_box() -> Result<()> {
    let mut settings = BuildSettings::default();
    settings.flight.levels = vec![8, 8];
    let builder = NavmeshBuilder::new(settings)?;
    let (navmesh, _) = builder.build(&plane_scene(true, true))?;

    let path = navmesh
        .fly_path(Vec3::new(-4.0, 0.5, 0.0), Vec3::new(4.0, 0.5, 0.0), &PathSettings::default())?
        .expect("flight path");
    let map = navmesh.voxel_map.as_ref().unwrap();
    for p in &path.points {
        let leaf = map.find_leaf(*p).unwrap();
        assert!(map.is_empty(leaf));
    }
    assert!(path.points.iter().any(|p| p.y > 1.0 || p.z.abs() > 1.0));
    Ok(())
}
