//! Geometry helpers shared by the builders and the queries
//!
//! Most 2D operations work on the XZ plane (Y-up coordinate system), matching the
//! convention used by the heightfield and the polygon mesh.

use glam::{Affine3A, Vec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box that any `grow` call will replace
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    /// Creates a box from its corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Bounds of a point cloud, `EMPTY` when there are no points
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Self {
        let mut bounds = Self::EMPTY;
        for p in points {
            bounds.grow(*p);
        }
        bounds
    }

    /// True when no point was ever added
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Extends the box to include `p`
    pub fn grow(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Union of two boxes
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Size along each axis
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Center of the box
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Inclusive overlap test
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Inclusive containment test
    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Closest point inside the box
    pub fn clamp(&self, p: Vec3) -> Vec3 {
        p.clamp(self.min, self.max)
    }

    /// Conservative world bounds of this box after an affine transform
    pub fn transformed(&self, transform: &Affine3A) -> Aabb {
        let mut out = Aabb::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.grow(transform.transform_point3(corner));
        }
        out
    }

    /// Returns the box expanded by `amount` on every side
    pub fn expanded(&self, amount: Vec3) -> Aabb {
        Aabb {
            min: self.min - amount,
            max: self.max + amount,
        }
    }
}

/// Twice the signed area of the XZ triangle `abc`.
///
/// Positive when the triangle winds clockwise looking down the Y axis.
#[inline]
pub fn tri_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

/// Squared XZ distance from `p` to segment `pq`, with the segment parameter of the closest point
#[inline]
pub fn dist_pt_seg_sqr_2d(p: Vec3, a: Vec3, b: Vec3) -> (f32, f32) {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    let d = dx * dx + dz * dz;
    let mut t = dx * (p.x - a.x) + dz * (p.z - a.z);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let ex = a.x + t * dx - p.x;
    let ez = a.z + t * dz - p.z;
    (ex * ex + ez * ez, t)
}

/// XZ point-in-polygon test (crossing number), inclusive of the polygon interior
pub fn point_in_polygon_2d(p: Vec3, verts: &[Vec3]) -> bool {
    let n = verts.len();
    let mut inside = false;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > p.z) != (vj.z > p.z))
            && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Closest point to `p` on triangle `abc` (Ericson, Real-Time Collision Detection 5.1.5)
pub fn closest_point_on_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(ap);
    let d2 = ac.dot(ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(bp);
    let d4 = ac.dot(bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(cp);
    let d6 = ac.dot(cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Height of triangle `abc` under `p` when `p` projects inside it on the XZ plane
pub fn closest_height_on_triangle(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    const EPS: f32 = 1e-6;
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    // Barycentric coordinates in the XZ plane
    let denom = v0.x * v1.z - v0.z * v1.x;
    if denom.abs() < EPS {
        return None;
    }
    let mut u = v1.z * v2.x - v1.x * v2.z;
    let mut v = v0.x * v2.z - v0.z * v2.x;
    if denom < 0.0 {
        u = -u;
        v = -v;
    }
    let denom = denom.abs();

    if u >= -EPS * denom && v >= -EPS * denom && (u + v) <= denom * (1.0 + EPS) {
        Some(a.y + (v0.y * u + v1.y * v) / denom)
    } else {
        None
    }
}

/// Intersects segment `p0..p1` against a convex XZ polygon.
///
/// Returns the entry/exit parameters and the edge indices crossed when entering and
/// leaving, or `None` when the segment misses the polygon.
pub fn intersect_segment_poly_2d(
    p0: Vec3,
    p1: Vec3,
    verts: &[Vec3],
) -> Option<(f32, f32, Option<usize>, Option<usize>)> {
    const EPS: f32 = 1e-8;
    let mut tmin = 0.0f32;
    let mut tmax = 1.0f32;
    let mut seg_min = None;
    let mut seg_max = None;

    let dir = p1 - p0;
    let n = verts.len();
    let mut j = n - 1;
    for i in 0..n {
        let edge = verts[i] - verts[j];
        let diff = p0 - verts[j];
        let num = edge.z * diff.x - edge.x * diff.z;
        let den = dir.z * edge.x - dir.x * edge.z;
        if den.abs() < EPS {
            // Parallel to the edge
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            if t > tmin {
                tmin = t;
                seg_min = Some(j);
                if tmin > tmax {
                    return None;
                }
            }
        } else if t < tmax {
            tmax = t;
            seg_max = Some(j);
            if tmax < tmin {
                return None;
            }
        }
        j = i;
    }

    Some((tmin, tmax, seg_min, seg_max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_grow_and_overlap() {
        let mut a = Aabb::EMPTY;
        assert!(a.is_empty());
        a.grow(Vec3::new(0.0, 0.0, 0.0));
        a.grow(Vec3::new(1.0, 2.0, 3.0));
        assert!(!a.is_empty());

        let b = Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::splat(5.0));
        assert!(a.overlaps(&b));
        let c = Aabb::new(Vec3::splat(1.5), Vec3::splat(5.0));
        assert!(!a.overlaps(&Aabb::new(Vec3::new(1.5, 0.0, 0.0), Vec3::splat(5.0))));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_transformed_bounds_are_conservative() {
        let unit = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let t = Affine3A::from_rotation_y(std::f32::consts::FRAC_PI_4);
        let out = unit.transformed(&t);
        let r = 2.0f32.sqrt();
        assert!((out.max.x - r).abs() < 1e-5);
        assert!((out.min.z + r).abs() < 1e-5);
        assert!((out.max.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tri_area_sign() {
        let a = Vec3::ZERO;
        let b = Vec3::new(0.0, 0.0, 1.0);
        let c = Vec3::new(1.0, 0.0, 0.0);
        assert!(tri_area_2d(a, b, c) > 0.0);
        assert!(tri_area_2d(a, c, b) < 0.0);
    }

    #[test]
    fn test_point_in_polygon() {
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 0.0),
        ];
        assert!(point_in_polygon_2d(Vec3::new(1.0, 5.0, 1.0), &square));
        assert!(!point_in_polygon_2d(Vec3::new(3.0, 0.0, 1.0), &square));
    }

    #[test]
    fn test_closest_height_on_triangle() {
        let a = Vec3::new(0.0, 1.0, 0.0);
        let b = Vec3::new(0.0, 1.0, 4.0);
        let c = Vec3::new(4.0, 1.0, 0.0);
        assert_eq!(closest_height_on_triangle(Vec3::new(1.0, 0.0, 1.0), a, b, c), Some(1.0));
        assert_eq!(closest_height_on_triangle(Vec3::new(5.0, 0.0, 5.0), a, b, c), None);
    }

    #[test]
    fn test_closest_point_on_triangle() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 0.0, 1.0);
        let p = closest_point_on_triangle(Vec3::new(0.25, 3.0, 0.25), a, b, c);
        assert!((p - Vec3::new(0.25, 0.0, 0.25)).length() < 1e-6);
        let p = closest_point_on_triangle(Vec3::new(-1.0, 0.0, -1.0), a, b, c);
        assert_eq!(p, a);
    }

    #[test]
    fn test_segment_poly_intersection() {
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(2.0, 0.0, 0.0),
        ];
        let hit = intersect_segment_poly_2d(Vec3::new(1.0, 0.0, 1.0), Vec3::new(5.0, 0.0, 1.0), &square);
        let (tmin, tmax, _, seg_max) = hit.unwrap();
        assert_eq!(tmin, 0.0);
        assert!((tmax - 0.25).abs() < 1e-6);
        assert!(seg_max.is_some());
    }
}
