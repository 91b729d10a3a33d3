//! Triangle rasterization
//!
//! Triangles are scan-converted by clipping them against the grid: first into rows
//! along Z, then into cells along X. For the heightfield, the vertical extent of each
//! cell fragment becomes a span. For a solid voxel grid the fragment is further split
//! along Y and every non-empty layer is marked solid.

use glam::Vec3;

use navkit_common::{Aabb, CancellationToken, MeshTypeMask, PrimFlags, Result, Scene};

use crate::context::{BuildContext, TimerCategory};
use crate::heightfield::Heightfield;
use crate::{RC_NULL_AREA, RC_SPAN_MAX_HEIGHT, RC_UNLANDABLE_AREA, RC_WALKABLE_AREA};

const AXIS_X: usize = 0;
const AXIS_Y: usize = 1;
const AXIS_Z: usize = 2;

/// Triangles rasterized between two cancellation polls
const CANCEL_POLL_INTERVAL: usize = 256;

/// Splits a convex polygon along an axis aligned plane.
///
/// `below` receives the part with `coordinate <= axis_offset`, `above` the part with
/// `coordinate >= axis_offset`. Vertices exactly on the plane go to both outputs, so
/// the two fragments share their boundary and no gap can open between cells.
pub fn split_convex_poly(
    input: &[Vec3],
    axis_offset: f32,
    axis: usize,
    below: &mut Vec<Vec3>,
    above: &mut Vec<Vec3>,
) {
    below.clear();
    above.clear();
    let n = input.len();
    if n == 0 {
        return;
    }

    let delta = |v: Vec3| axis_offset - v[axis];

    let mut j = n - 1;
    for i in 0..n {
        let dj = delta(input[j]);
        let di = delta(input[i]);
        let in_a = dj >= 0.0;
        let in_b = di >= 0.0;
        if in_a != in_b {
            // Edge crosses the plane
            let s = dj / (dj - di);
            let p = input[j] + (input[i] - input[j]) * s;
            below.push(p);
            above.push(p);
            if di > 0.0 {
                below.push(input[i]);
            } else if di < 0.0 {
                above.push(input[i]);
            }
        } else {
            if di >= 0.0 {
                below.push(input[i]);
                if di != 0.0 {
                    j = i;
                    continue;
                }
            }
            above.push(input[i]);
        }
        j = i;
    }
}

/// Outcode of a point against a box, one bit per violated face
#[inline]
fn outcode(p: Vec3, bmin: Vec3, bmax: Vec3) -> u8 {
    let mut code = 0;
    if p.x < bmin.x {
        code |= 0x01;
    }
    if p.x > bmax.x {
        code |= 0x02;
    }
    if p.y < bmin.y {
        code |= 0x04;
    }
    if p.y > bmax.y {
        code |= 0x08;
    }
    if p.z < bmin.z {
        code |= 0x10;
    }
    if p.z > bmax.z {
        code |= 0x20;
    }
    code
}

/// Common outcode of a triangle; non-zero when all three vertices lie outside the
/// same face of the box and the triangle can be rejected without clipping
#[inline]
pub fn triangle_outcode(tri: &[Vec3; 3], bmin: Vec3, bmax: Vec3) -> u8 {
    outcode(tri[0], bmin, bmax) & outcode(tri[1], bmin, bmax) & outcode(tri[2], bmin, bmax)
}

/// Area id of a world space triangle with the given effective flags
pub fn classify_triangle(tri: &[Vec3; 3], flags: PrimFlags, walkable_slope_cos: f32) -> u8 {
    if flags.contains(PrimFlags::FORCE_UNWALKABLE) {
        return RC_NULL_AREA;
    }
    let normal = (tri[1] - tri[0]).cross(tri[2] - tri[0]).normalize_or_zero();
    if normal.y <= walkable_slope_cos {
        RC_NULL_AREA
    } else if flags.contains(PrimFlags::UNLANDABLE) {
        RC_UNLANDABLE_AREA
    } else {
        RC_WALKABLE_AREA
    }
}

/// Rasterizes a single triangle into the heightfield
pub fn rasterize_triangle(
    hf: &mut Heightfield,
    tri: &[Vec3; 3],
    area: u8,
    flag_merge_threshold: i32,
) -> Result<()> {
    let bmin = hf.bmin;
    let bmax = hf.bmax;
    if triangle_outcode(tri, bmin, bmax) != 0 {
        return Ok(());
    }

    let w = hf.width;
    let h = hf.height;
    let cs = hf.cs;
    let ics = 1.0 / hf.cs;
    let ich = 1.0 / hf.ch;
    let by = bmax.y - bmin.y;

    let tmin = tri[0].min(tri[1]).min(tri[2]);
    let tmax = tri[0].max(tri[1]).max(tri[2]);

    // Footprint rows, including the one row before the grid that is clipped away
    let z0 = (((tmin.z - bmin.z) * ics) as i32).clamp(-1, h - 1);
    let z1 = (((tmax.z - bmin.z) * ics) as i32).clamp(0, h - 1);

    let mut rest: Vec<Vec3> = tri.to_vec();
    let mut row = Vec::with_capacity(7);
    let mut next_rest = Vec::with_capacity(7);
    let mut cell = Vec::with_capacity(7);
    let mut row_rest = Vec::with_capacity(7);

    for z in z0..=z1 {
        let cell_z = bmin.z + z as f32 * cs;
        split_convex_poly(&rest, cell_z + cs, AXIS_Z, &mut row, &mut next_rest);
        std::mem::swap(&mut rest, &mut next_rest);
        if row.len() < 3 || z < 0 {
            continue;
        }

        let (min_x, max_x) = row
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v.x), hi.max(v.x)));
        let x0 = ((min_x - bmin.x) * ics) as i32;
        let x1 = ((max_x - bmin.x) * ics) as i32;
        if x1 < 0 || x0 >= w {
            continue;
        }
        let x0 = x0.clamp(-1, w - 1);
        let x1 = x1.clamp(0, w - 1);

        for x in x0..=x1 {
            let cell_x = bmin.x + x as f32 * cs;
            split_convex_poly(&row, cell_x + cs, AXIS_X, &mut cell, &mut row_rest);
            std::mem::swap(&mut row, &mut row_rest);
            if cell.len() < 3 || x < 0 {
                continue;
            }

            let (mut smin, mut smax) = cell
                .iter()
                .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v.y), hi.max(v.y)));
            smin -= bmin.y;
            smax -= bmin.y;
            // Skip the span if it is outside the heightfield bounds
            if smax < 0.0 || smin > by {
                continue;
            }
            smin = smin.max(0.0);
            smax = smax.min(by);

            let max_height = RC_SPAN_MAX_HEIGHT as i32;
            let ismin = ((smin * ich).floor() as i32).clamp(0, max_height);
            let ismax = ((smax * ich).ceil() as i32).clamp(ismin + 1, max_height);

            hf.add_span(x, z, ismin as u16, ismax as u16, area, flag_merge_threshold)?;
        }
    }

    Ok(())
}

/// Rasterizes every instance of `scene` overlapping the heightfield.
///
/// Each entry of `passes` selects the mesh types rasterized in that pass. Returns the
/// number of triangles that were considered.
pub fn rasterize_scene(
    ctx: &mut BuildContext,
    hf: &mut Heightfield,
    scene: &Scene,
    passes: &[MeshTypeMask],
    walkable_slope_cos: f32,
    walkable_climb: i32,
) -> Result<usize> {
    ctx.start_timer(TimerCategory::Rasterization);
    let bounds = Aabb::new(hf.bmin, hf.bmax);
    let cancel = ctx.cancellation().clone();
    let mut count = 0;
    let mut failure = None;

    'passes: for &mask in passes {
        for (mesh, instance) in scene.instances_overlapping(&bounds, mask) {
            mesh.for_each_world_triangle(instance, |tri, flags| {
                if failure.is_some() {
                    return;
                }
                if count % CANCEL_POLL_INTERVAL == 0 {
                    if let Err(e) = cancel.check() {
                        failure = Some(e);
                        return;
                    }
                }
                count += 1;
                let area = classify_triangle(&tri, flags, walkable_slope_cos);
                if let Err(e) = rasterize_triangle(hf, &tri, area, walkable_climb) {
                    failure = Some(e);
                }
            });
            if failure.is_some() {
                break 'passes;
            }
        }
    }

    ctx.stop_timer(TimerCategory::Rasterization);
    match failure {
        Some(e) => Err(e),
        None => Ok(count),
    }
}

/// Dense grid of solid cells fed by the rasterizer
pub trait SolidGrid {
    /// World position of the grid's minimum corner
    fn origin(&self) -> Vec3;
    /// Edge length of a cubic cell
    fn cell_size(&self) -> f32;
    /// Number of cells along x, y and z
    fn dims(&self) -> [usize; 3];
    /// Marks a cell as containing solid geometry
    fn mark_solid(&mut self, x: usize, y: usize, z: usize);
}

/// Marks every cell of `grid` touched by the triangle.
///
/// The triangle is clipped along Z, then X, then Y; cells on a shared boundary are
/// marked on both sides.
pub fn voxelize_triangle<G: SolidGrid + ?Sized>(grid: &mut G, tri: &[Vec3; 3]) {
    let [nx, ny, nz] = grid.dims();
    let cs = grid.cell_size();
    let ics = 1.0 / cs;
    let bmin = grid.origin();
    let bmax = bmin + Vec3::new(nx as f32, ny as f32, nz as f32) * cs;
    if triangle_outcode(tri, bmin, bmax) != 0 {
        return;
    }

    let cell_range = |lo: f32, hi: f32, origin: f32, n: usize| {
        let a = (((lo - origin) * ics).floor() as i64).clamp(-1, n as i64 - 1);
        let b = (((hi - origin) * ics).floor() as i64).clamp(0, n as i64 - 1);
        (a, b)
    };

    let tmin = tri[0].min(tri[1]).min(tri[2]);
    let tmax = tri[0].max(tri[1]).max(tri[2]);
    let (z0, z1) = cell_range(tmin.z, tmax.z, bmin.z, nz);

    let mut rest: Vec<Vec3> = tri.to_vec();
    let mut next_rest = Vec::with_capacity(7);
    let mut row = Vec::with_capacity(7);
    let mut row_rest = Vec::with_capacity(7);
    let mut column = Vec::with_capacity(7);
    let mut column_rest = Vec::with_capacity(7);
    let mut layer = Vec::with_capacity(7);

    for z in z0..=z1 {
        split_convex_poly(&rest, bmin.z + (z + 1) as f32 * cs, AXIS_Z, &mut row, &mut next_rest);
        std::mem::swap(&mut rest, &mut next_rest);
        if row.len() < 3 || z < 0 {
            continue;
        }

        let (min_x, max_x) = row
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v.x), hi.max(v.x)));
        let (x0, x1) = cell_range(min_x, max_x, bmin.x, nx);

        for x in x0..=x1 {
            split_convex_poly(&row, bmin.x + (x + 1) as f32 * cs, AXIS_X, &mut column, &mut row_rest);
            std::mem::swap(&mut row, &mut row_rest);
            if column.len() < 3 || x < 0 {
                continue;
            }

            let (min_y, max_y) = column
                .iter()
                .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v.y), hi.max(v.y)));
            let (y0, y1) = cell_range(min_y, max_y, bmin.y, ny);

            for y in y0..=y1 {
                split_convex_poly(
                    &column,
                    bmin.y + (y + 1) as f32 * cs,
                    AXIS_Y,
                    &mut layer,
                    &mut column_rest,
                );
                std::mem::swap(&mut column, &mut column_rest);
                if layer.len() < 3 || y < 0 {
                    continue;
                }
                grid.mark_solid(x as usize, y as usize, z as usize);
            }
        }
    }
}

/// Voxelizes every instance overlapping the grid.
///
/// Primitives flagged `FLY_THROUGH` are skipped: they are part of the walk mesh but
/// never block flight. Returns the number of triangles voxelized.
pub fn voxelize_scene<G: SolidGrid + ?Sized>(
    grid: &mut G,
    scene: &Scene,
    mask: MeshTypeMask,
    cancel: &CancellationToken,
) -> Result<usize> {
    let [nx, ny, nz] = grid.dims();
    let origin = grid.origin();
    let bounds = Aabb::new(
        origin,
        origin + Vec3::new(nx as f32, ny as f32, nz as f32) * grid.cell_size(),
    );
    let mut count = 0;
    let mut failure = None;
    for (mesh, instance) in scene.instances_overlapping(&bounds, mask) {
        mesh.for_each_world_triangle(instance, |tri, flags| {
            if failure.is_some() || flags.contains(PrimFlags::FLY_THROUGH) {
                return;
            }
            if count % CANCEL_POLL_INTERVAL == 0 {
                if let Err(e) = cancel.check() {
                    failure = Some(e);
                    return;
                }
            }
            count += 1;
            voxelize_triangle(grid, &tri);
        });
        if let Some(e) = failure.take() {
            return Err(e);
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Affine3A;
    use navkit_common::{Mesh, MeshPart, MeshType, SceneBuilder};

    fn polygon_area_xz(poly: &[Vec3]) -> f32 {
        let n = poly.len();
        let mut area = 0.0;
        for i in 0..n {
            let a = poly[i];
            let b = poly[(i + 1) % n];
            area += a.x * b.z - b.x * a.z;
        }
        area.abs() * 0.5
    }

    #[test]
    fn test_split_partitions_triangle() {
        let tri = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 0.0),
        ];
        for offset in [0.5f32, 1.0, 2.0, 3.7] {
            for axis in [AXIS_X, AXIS_Z] {
                let mut below = Vec::new();
                let mut above = Vec::new();
                split_convex_poly(&tri, offset, axis, &mut below, &mut above);
                assert!(below.iter().all(|v| v[axis] <= offset + 1e-5));
                assert!(above.iter().all(|v| v[axis] >= offset - 1e-5));
                let total = polygon_area_xz(&below) + polygon_area_xz(&above);
                assert!((total - polygon_area_xz(&tri)).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_split_vertex_on_plane_goes_to_both() {
        let tri = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 0.0),
        ];
        let mut below = Vec::new();
        let mut above = Vec::new();
        split_convex_poly(&tri, 1.0, AXIS_X, &mut below, &mut above);
        let apex = Vec3::new(1.0, 0.0, 2.0);
        assert!(below.contains(&apex));
        assert!(above.contains(&apex));
    }

    #[test]
    fn test_split_fully_on_one_side() {
        let tri = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        ];
        let mut below = Vec::new();
        let mut above = Vec::new();
        split_convex_poly(&tri, 5.0, AXIS_X, &mut below, &mut above);
        assert_eq!(below.len(), 3);
        assert!(above.is_empty());
    }

    #[test]
    fn test_outcode_rejects_triangles_outside() {
        let bmin = Vec3::ZERO;
        let bmax = Vec3::splat(10.0);
        let outside = [
            Vec3::new(-3.0, 1.0, 1.0),
            Vec3::new(-2.0, 5.0, 1.0),
            Vec3::new(-1.0, 1.0, 9.0),
        ];
        assert_ne!(triangle_outcode(&outside, bmin, bmax), 0);

        // Straddles the box: vertices outside different faces
        let straddle = [
            Vec3::new(-3.0, 1.0, 1.0),
            Vec3::new(13.0, 1.0, 1.0),
            Vec3::new(5.0, 1.0, 20.0),
        ];
        assert_eq!(triangle_outcode(&straddle, bmin, bmax), 0);
    }

    #[test]
    fn test_classify_triangle() {
        let floor = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 0.0),
        ];
        let cos = 55f32.to_radians().cos();
        assert_eq!(classify_triangle(&floor, PrimFlags::empty(), cos), RC_WALKABLE_AREA);
        assert_eq!(classify_triangle(&floor, PrimFlags::UNLANDABLE, cos), RC_UNLANDABLE_AREA);
        assert_eq!(classify_triangle(&floor, PrimFlags::FORCE_UNWALKABLE, cos), RC_NULL_AREA);

        let wall = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
        ];
        assert_eq!(classify_triangle(&wall, PrimFlags::empty(), cos), RC_NULL_AREA);
    }

    #[test]
    fn test_rasterize_floor_covers_cells() {
        let mut hf = Heightfield::new(4, 4, Vec3::ZERO, Vec3::new(4.0, 4.0, 4.0), 1.0, 0.5);
        let quad = [
            [Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 1.0, 4.0), Vec3::new(4.0, 1.0, 4.0)],
            [Vec3::new(0.0, 1.0, 0.0), Vec3::new(4.0, 1.0, 4.0), Vec3::new(4.0, 1.0, 0.0)],
        ];
        for tri in &quad {
            rasterize_triangle(&mut hf, tri, RC_WALKABLE_AREA, 1).unwrap();
        }
        for z in 0..4 {
            for x in 0..4 {
                let col = hf.column(x, z);
                assert_eq!(col.len(), 1, "cell {} {}", x, z);
                assert_eq!(col[0].smin, 2);
                assert_eq!(col[0].smax, 3);
                assert_eq!(col[0].area, RC_WALKABLE_AREA);
            }
        }
    }

    struct Grid {
        dims: [usize; 3],
        solid: Vec<bool>,
    }

    impl SolidGrid for Grid {
        fn origin(&self) -> Vec3 {
            Vec3::ZERO
        }
        fn cell_size(&self) -> f32 {
            1.0
        }
        fn dims(&self) -> [usize; 3] {
            self.dims
        }
        fn mark_solid(&mut self, x: usize, y: usize, z: usize) {
            let [nx, _, nz] = self.dims;
            self.solid[(y * nx + x) * nz + z] = true;
        }
    }

    #[test]
    fn test_voxelize_marks_only_touched_cells() {
        let mut grid = Grid {
            dims: [4, 4, 4],
            solid: vec![false; 64],
        };
        let tri = [
            Vec3::new(0.2, 1.5, 0.2),
            Vec3::new(0.2, 1.5, 1.5),
            Vec3::new(1.5, 1.5, 0.2),
        ];
        voxelize_triangle(&mut grid, &tri);
        let marked: Vec<usize> = (0..64).filter(|&i| grid.solid[i]).collect();
        // Layer y = 1, cells (0,0), (0,1) and (1,0); the hypotenuse stays clear of (1,1)
        let expected: Vec<usize> = [(0, 0), (0, 1), (1, 0)]
            .iter()
            .map(|&(x, z)| (4 + x) * 4 + z)
            .collect();
        assert_eq!(marked, expected);
    }

    #[test]
    fn test_voxelize_scene_skips_fly_through() {
        let mut builder = SceneBuilder::new();
        builder.add_mesh(Mesh::new(
            "ghost",
            MeshType::AnalyticShape,
            vec![MeshPart::unit_box().with_flags(PrimFlags::FLY_THROUGH)],
        ));
        builder.add_mesh(Mesh::new("box", MeshType::AnalyticShape, vec![MeshPart::unit_box()]));
        builder.place("ghost", 1, Affine3A::from_translation(Vec3::splat(1.5)));
        builder.place("box", 2, Affine3A::from_translation(Vec3::new(2.5, 2.5, 2.5)));
        let scene = builder.build();

        let mut grid = Grid {
            dims: [4, 4, 4],
            solid: vec![false; 64],
        };
        let n = voxelize_scene(&mut grid, &scene, MeshTypeMask::all(), &CancellationToken::new()).unwrap();
        assert_eq!(n, 12);
        // Ghost box cell stays empty, solid box cell is marked
        assert!(!grid.solid[(4 + 1) * 4 + 1]);
        assert!(grid.solid[(2 * 4 + 2) * 4 + 2]);
    }

    fn sphere_scene() -> Scene {
        let mut builder = SceneBuilder::new();
        builder
            .add_mesh(Mesh::new("ball", MeshType::AnalyticShape, vec![MeshPart::unit_sphere(16, 32)]))
            .place(
                "ball",
                1,
                Affine3A::from_translation(Vec3::splat(4.0)) * Affine3A::from_scale(Vec3::splat(6.0)),
            );
        builder.build()
    }

    /// Grid that cancels the build as soon as the first cell is marked
    struct CancellingGrid {
        grid: Grid,
        cancel: CancellationToken,
    }

    impl SolidGrid for CancellingGrid {
        fn origin(&self) -> Vec3 {
            self.grid.origin()
        }
        fn cell_size(&self) -> f32 {
            self.grid.cell_size()
        }
        fn dims(&self) -> [usize; 3] {
            self.grid.dims()
        }
        fn mark_solid(&mut self, x: usize, y: usize, z: usize) {
            self.grid.mark_solid(x, y, z);
            self.cancel.cancel();
        }
    }

    #[test]
    fn test_voxelize_stops_inside_an_instance() {
        let scene = sphere_scene();
        let mut uncancelled = Grid {
            dims: [8, 8, 8],
            solid: vec![false; 512],
        };
        let total = voxelize_scene(&mut uncancelled, &scene, MeshTypeMask::all(), &CancellationToken::new()).unwrap();
        assert!(total > 2 * CANCEL_POLL_INTERVAL);

        // A single instance, so only polls between triangles can notice
        let cancel = CancellationToken::new();
        let mut grid = CancellingGrid {
            grid: Grid {
                dims: [8, 8, 8],
                solid: vec![false; 512],
            },
            cancel: cancel.clone(),
        };
        let result = voxelize_scene(&mut grid, &scene, MeshTypeMask::all(), &cancel);
        assert!(matches!(result, Err(navkit_common::Error::Cancelled)));
        let marked = grid.grid.solid.iter().filter(|&&s| s).count();
        let full = uncancelled.solid.iter().filter(|&&s| s).count();
        assert!(marked < full, "{} of {} cells marked", marked, full);
    }

    #[test]
    fn test_rasterize_scene_honours_cancellation() {
        let scene = sphere_scene();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut ctx = BuildContext::with_cancellation(cancel);
        let mut hf = Heightfield::new(8, 8, Vec3::ZERO, Vec3::splat(8.0), 1.0, 0.5);
        let result = rasterize_scene(&mut ctx, &mut hf, &scene, &[MeshTypeMask::all()], 0.5, 1);
        assert!(matches!(result, Err(navkit_common::Error::Cancelled)));
        assert!((0..8).all(|z| (0..8).all(|x| hf.column(x, z).is_empty())));

        let mut ctx = BuildContext::new();
        let count = rasterize_scene(&mut ctx, &mut hf, &scene, &[MeshTypeMask::all()], 0.5, 1).unwrap();
        assert!(count > CANCEL_POLL_INTERVAL);
    }
}
