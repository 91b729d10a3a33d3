//! Analytic mesh builders
//!
//! Shapes are generated in local space, centered on the origin and fitting inside the
//! unit cube unless stated otherwise. Every triangle is wound so that
//! `(b - a) x (c - a)` points out of the solid, which is the orientation the
//! rasterizer uses to classify walkable faces.

use glam::Vec3;

use crate::scene::{MeshPart, PrimFlags, Primitive};

/// Appends triangle `(a, b, c)`, flipping it if needed so its normal agrees with `outward`
fn push_oriented(part: &mut MeshPart, a: u32, b: u32, c: u32, outward: Vec3) {
    let va = part.vertices[a as usize];
    let vb = part.vertices[b as usize];
    let vc = part.vertices[c as usize];
    let n = (vb - va).cross(vc - va);
    if n.dot(outward) >= 0.0 {
        part.primitives.push(Primitive::new(a, b, c, PrimFlags::empty()));
    } else {
        part.primitives.push(Primitive::new(a, c, b, PrimFlags::empty()));
    }
}

impl MeshPart {
    /// Axis aligned box with the given half extents
    pub fn cuboid(half_extents: Vec3) -> Self {
        let h = half_extents;
        let mut part = MeshPart::default();
        for i in 0..8 {
            part.vertices.push(Vec3::new(
                if i & 1 == 0 { -h.x } else { h.x },
                if i & 2 == 0 { -h.y } else { h.y },
                if i & 4 == 0 { -h.z } else { h.z },
            ));
        }

        // (corner indices of the face, outward normal)
        let faces: [([u32; 4], Vec3); 6] = [
            ([0, 2, 6, 4], Vec3::NEG_X),
            ([1, 3, 7, 5], Vec3::X),
            ([0, 1, 5, 4], Vec3::NEG_Y),
            ([2, 3, 7, 6], Vec3::Y),
            ([0, 1, 3, 2], Vec3::NEG_Z),
            ([4, 5, 7, 6], Vec3::Z),
        ];
        for (q, n) in faces {
            push_oriented(&mut part, q[0], q[1], q[2], n);
            push_oriented(&mut part, q[0], q[2], q[3], n);
        }
        part
    }

    /// Cube of side 1
    pub fn unit_box() -> Self {
        Self::cuboid(Vec3::splat(0.5))
    }

    /// Capped cylinder of radius 0.5 and height 1 around the Y axis
    pub fn unit_cylinder(segments: u32) -> Self {
        let segments = segments.max(3);
        let mut part = MeshPart::default();
        for i in 0..segments {
            let a = i as f32 / segments as f32 * std::f32::consts::TAU;
            let (s, c) = a.sin_cos();
            part.vertices.push(Vec3::new(c * 0.5, -0.5, s * 0.5));
            part.vertices.push(Vec3::new(c * 0.5, 0.5, s * 0.5));
        }
        let bottom = part.vertices.len() as u32;
        part.vertices.push(Vec3::new(0.0, -0.5, 0.0));
        part.vertices.push(Vec3::new(0.0, 0.5, 0.0));
        let top = bottom + 1;

        for i in 0..segments {
            let j = (i + 1) % segments;
            let (b0, t0, b1, t1) = (i * 2, i * 2 + 1, j * 2, j * 2 + 1);
            let mid = (part.vertices[b0 as usize] + part.vertices[b1 as usize]) * 0.5;
            let side = Vec3::new(mid.x, 0.0, mid.z);
            push_oriented(&mut part, b0, b1, t1, side);
            push_oriented(&mut part, b0, t1, t0, side);
            push_oriented(&mut part, bottom, b0, b1, Vec3::NEG_Y);
            push_oriented(&mut part, top, t0, t1, Vec3::Y);
        }
        part
    }

    /// UV sphere of radius 0.5
    pub fn unit_sphere(rings: u32, segments: u32) -> Self {
        let rings = rings.max(2);
        let segments = segments.max(3);
        let mut part = MeshPart::default();
        for r in 0..=rings {
            let phi = r as f32 / rings as f32 * std::f32::consts::PI;
            let (sp, cp) = phi.sin_cos();
            for s in 0..segments {
                let theta = s as f32 / segments as f32 * std::f32::consts::TAU;
                let (st, ct) = theta.sin_cos();
                part.vertices.push(Vec3::new(sp * ct, cp, sp * st) * 0.5);
            }
        }

        let idx = |r: u32, s: u32| r * segments + s % segments;
        for r in 0..rings {
            for s in 0..segments {
                let (a, b, c, d) = (idx(r, s), idx(r, s + 1), idx(r + 1, s + 1), idx(r + 1, s));
                let center = (part.vertices[a as usize]
                    + part.vertices[b as usize]
                    + part.vertices[c as usize]
                    + part.vertices[d as usize])
                    * 0.25;
                // Degenerate triangles at the poles are dropped
                if r != 0 {
                    push_oriented(&mut part, a, b, c, center);
                }
                if r + 1 != rings {
                    push_oriented(&mut part, a, c, d, center);
                }
            }
        }
        part
    }

    /// Flat upward facing rectangle at y = 0
    pub fn plane(half_x: f32, half_z: f32) -> Self {
        let mut part = MeshPart::new(
            vec![
                Vec3::new(-half_x, 0.0, -half_z),
                Vec3::new(-half_x, 0.0, half_z),
                Vec3::new(half_x, 0.0, half_z),
                Vec3::new(half_x, 0.0, -half_z),
            ],
            Vec::new(),
        );
        push_oriented(&mut part, 0, 1, 2, Vec3::Y);
        push_oriented(&mut part, 0, 2, 3, Vec3::Y);
        part
    }

    /// Heightmap grid. `heights` is row major with `nx` samples per row and `nz` rows.
    ///
    /// Returns an empty part when `heights` does not hold `nx * nz` samples.
    pub fn terrain(heights: &[f32], nx: usize, nz: usize, spacing: f32) -> Self {
        let mut part = MeshPart::default();
        if nx < 2 || nz < 2 || heights.len() != nx * nz {
            log::warn!(
                "Terrain needs {}x{} samples but got {}, skipping",
                nx,
                nz,
                heights.len()
            );
            return part;
        }
        for z in 0..nz {
            for x in 0..nx {
                part.vertices.push(Vec3::new(
                    x as f32 * spacing,
                    heights[z * nx + x],
                    z as f32 * spacing,
                ));
            }
        }
        for z in 0..nz - 1 {
            for x in 0..nx - 1 {
                let i0 = (z * nx + x) as u32;
                let i1 = i0 + 1;
                let i2 = i0 + nx as u32;
                let i3 = i2 + 1;
                push_oriented(&mut part, i0, i2, i3, Vec3::Y);
                push_oriented(&mut part, i0, i3, i1, Vec3::Y);
            }
        }
        part
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_outward(part: &MeshPart, center: Vec3) {
        for prim in &part.primitives {
            let [a, b, c] = prim.indices.map(|i| part.vertices[i as usize]);
            let n = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(n.dot(centroid - center) > 0.0, "inward facing triangle {:?}", prim);
        }
    }

    #[test]
    fn test_box_is_closed_and_outward() {
        let part = MeshPart::unit_box();
        assert_eq!(part.vertices.len(), 8);
        assert_eq!(part.primitives.len(), 12);
        assert_outward(&part, Vec3::ZERO);
        let bounds = part.bounds();
        assert_eq!(bounds.min, Vec3::splat(-0.5));
        assert_eq!(bounds.max, Vec3::splat(0.5));
    }

    #[test]
    fn test_cylinder_and_sphere_are_outward() {
        let cyl = MeshPart::unit_cylinder(12);
        assert_eq!(cyl.primitives.len(), 48);
        assert_outward(&cyl, Vec3::ZERO);

        let sphere = MeshPart::unit_sphere(6, 8);
        assert_outward(&sphere, Vec3::ZERO);
        assert!(sphere.bounds().max.y <= 0.5 + 1e-6);
    }

    #[test]
    fn test_plane_faces_up() {
        let part = MeshPart::plane(5.0, 5.0);
        for prim in &part.primitives {
            let [a, b, c] = prim.indices.map(|i| part.vertices[i as usize]);
            assert!((b - a).cross(c - a).y > 0.0);
        }
    }

    #[test]
    fn test_terrain_grid() {
        let heights = [0.0, 1.0, 0.0, 1.0, 2.0, 1.0];
        let part = MeshPart::terrain(&heights, 3, 2, 2.0);
        assert_eq!(part.vertices.len(), 6);
        assert_eq!(part.primitives.len(), 4);
        assert_eq!(part.vertices[5], Vec3::new(4.0, 1.0, 2.0));
        for prim in &part.primitives {
            let [a, b, c] = prim.indices.map(|i| part.vertices[i as usize]);
            assert!((b - a).cross(c - a).y > 0.0);
        }

        let bad = MeshPart::terrain(&heights, 4, 2, 1.0);
        assert!(bad.primitives.is_empty());
    }
}
