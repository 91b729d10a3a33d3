//! Detail mesh generation for Recast
//!
//! The polygon mesh only carries vertex heights at polygon corners. The detail mesh
//! re-samples the compact heightfield along polygon edges and inside polygons and
//! Delaunay-triangulates the samples whose height error exceeds the limit, so that
//! queries can recover the true surface height.

use std::collections::VecDeque;

use glam::Vec3;

use navkit_common::Result;

use crate::compact_heightfield::CompactHeightfield;
use crate::context::{BuildContext, TimerCategory};
use crate::polymesh::PolyMesh;
use crate::{dir_for_offset, dir_offset_x, dir_offset_z, RC_MULTIPLE_REGS};

const UNSET_HEIGHT: u16 = 0xffff;

const MAX_VERTS: usize = 127;
// Delaunay produces at most 2n-2-k triangles for n points and k hull points
const MAX_TRIS: usize = 255;
const MAX_VERTS_PER_EDGE: usize = 32;

const EV_UNDEF: i32 = -1;
const EV_HULL: i32 = -2;

/// Sub-triangulation of every polygon of a [`PolyMesh`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolyMeshDetail {
    /// Per polygon: `[vert base, vert count, tri base, tri count]`
    pub meshes: Vec<[u32; 4]>,
    /// World space vertices. The first vertices of every sub-mesh are the polygon corners.
    pub verts: Vec<Vec3>,
    /// Triangles as three sub-mesh local vertex indices plus edge flags.
    ///
    /// Bits `2 * k` of the flags are set when edge `k` lies on the polygon boundary.
    pub tris: Vec<[u8; 4]>,
}

/// Heights sampled from the compact heightfield under one polygon
struct HeightPatch {
    data: Vec<u16>,
    xmin: i32,
    zmin: i32,
    width: i32,
    height: i32,
}

#[inline]
fn vdot2(a: Vec3, b: Vec3) -> f32 {
    a.x * b.x + a.z * b.z
}

#[inline]
fn vdist2(p: Vec3, q: Vec3) -> f32 {
    let dx = q.x - p.x;
    let dz = q.z - p.z;
    (dx * dx + dz * dz).sqrt()
}

#[inline]
fn vcross2(p1: Vec3, p2: Vec3, p3: Vec3) -> f32 {
    let u1 = p2.x - p1.x;
    let v1 = p2.z - p1.z;
    let u2 = p3.x - p1.x;
    let v2 = p3.z - p1.z;
    u1 * v2 - v1 * u2
}

fn circum_circle(p1: Vec3, p2: Vec3, p3: Vec3) -> Option<(Vec3, f32)> {
    const EPS: f32 = 1e-6;
    // Relative to p1 to limit precision loss
    let v1 = Vec3::ZERO;
    let v2 = p2 - p1;
    let v3 = p3 - p1;

    let cp = vcross2(v1, v2, v3);
    if cp.abs() <= EPS {
        return None;
    }
    let v1sq = vdot2(v1, v1);
    let v2sq = vdot2(v2, v2);
    let v3sq = vdot2(v3, v3);
    let c = Vec3::new(
        (v1sq * (v2.z - v3.z) + v2sq * (v3.z - v1.z) + v3sq * (v1.z - v2.z)) / (2.0 * cp),
        0.0,
        (v1sq * (v3.x - v2.x) + v2sq * (v1.x - v3.x) + v3sq * (v2.x - v1.x)) / (2.0 * cp),
    );
    let r = vdist2(c, v1);
    Some((c + p1, r))
}

fn dist_pt_tri(p: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let dot00 = vdot2(v0, v0);
    let dot01 = vdot2(v0, v1);
    let dot02 = vdot2(v0, v2);
    let dot11 = vdot2(v1, v1);
    let dot12 = vdot2(v1, v2);

    let inv_denom = 1.0 / (dot00 * dot11 - dot01 * dot01);
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    const EPS: f32 = 1e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a.y + v0.y * u + v1.y * v;
        return Some((y - p.y).abs());
    }
    None
}

/// Squared 3D distance from `pt` to segment `(p, q)`
fn distance_pt_seg(pt: Vec3, p: Vec3, q: Vec3) -> f32 {
    let pq = q - p;
    let d = pt - p;
    let len = pq.length_squared();
    let mut t = pq.dot(d);
    if len > 0.0 {
        t /= len;
    }
    let t = t.clamp(0.0, 1.0);
    (p + pq * t - pt).length_squared()
}

/// Squared xz distance from `pt` to segment `(p, q)`
fn distance_pt_seg_2d(pt: Vec3, p: Vec3, q: Vec3) -> f32 {
    let pqx = q.x - p.x;
    let pqz = q.z - p.z;
    let dx = pt.x - p.x;
    let dz = pt.z - p.z;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = p.x + t * pqx - pt.x;
    let dz = p.z + t * pqz - pt.z;
    dx * dx + dz * dz
}

fn dist_to_tri_mesh(p: Vec3, verts: &[Vec3], tris: &[[i32; 4]]) -> Option<f32> {
    tris.iter()
        .filter_map(|t| {
            dist_pt_tri(
                p,
                verts[t[0] as usize],
                verts[t[1] as usize],
                verts[t[2] as usize],
            )
        })
        .min_by(f32::total_cmp)
}

/// Signed xz distance to the polygon outline, negative inside
fn dist_to_poly(verts: &[Vec3], p: Vec3) -> f32 {
    let n = verts.len();
    let mut dmin = f32::MAX;
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let vi = verts[i];
        let vj = verts[j];
        if ((vi.z > p.z) != (vj.z > p.z)) && (p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x) {
            inside = !inside;
        }
        dmin = dmin.min(distance_pt_seg_2d(p, vj, vi));
        j = i;
    }
    if inside {
        -dmin
    } else {
        dmin
    }
}

fn poly_min_extent(verts: &[Vec3]) -> f32 {
    let n = verts.len();
    let mut min_dist = f32::MAX;
    for i in 0..n {
        let ni = (i + 1) % n;
        let p1 = verts[i];
        let p2 = verts[ni];
        let mut max_edge_dist: f32 = 0.0;
        for (j, &v) in verts.iter().enumerate() {
            if j == i || j == ni {
                continue;
            }
            max_edge_dist = max_edge_dist.max(distance_pt_seg_2d(v, p1, p2));
        }
        min_dist = min_dist.min(max_edge_dist);
    }
    min_dist.sqrt()
}

fn jitter_x(i: usize) -> f32 {
    ((i as u32).wrapping_mul(0x8da6_b343) & 0xffff) as f32 / 65535.0 * 2.0 - 1.0
}

fn jitter_z(i: usize) -> f32 {
    ((i as u32).wrapping_mul(0xd816_3841) & 0xffff) as f32 / 65535.0 * 2.0 - 1.0
}

/// Height of the patch at a position, searching outwards in a spiral when the
/// cell itself has no sample
fn get_height(f: Vec3, ics: f32, ch: f32, radius: i32, hp: &HeightPatch) -> u16 {
    let ix = ((f.x * ics + 0.01).floor() as i32 - hp.xmin).clamp(0, hp.width - 1);
    let iz = ((f.z * ics + 0.01).floor() as i32 - hp.zmin).clamp(0, hp.height - 1);
    let mut h = hp.data[(ix + iz * hp.width) as usize];
    if h != UNSET_HEIGHT {
        return h;
    }

    let (mut x, mut z, mut dx, mut dz) = (1i32, 0i32, 1i32, 0i32);
    let max_size = radius * 2 + 1;
    let max_iter = max_size * max_size - 1;
    let mut next_ring_iter_start = 8;
    let mut next_ring_iters = 16;
    let mut dmin = f32::MAX;

    for i in 0..max_iter {
        let nx = ix + x;
        let nz = iz + z;
        if nx >= 0 && nz >= 0 && nx < hp.width && nz < hp.height {
            let nh = hp.data[(nx + nz * hp.width) as usize];
            if nh != UNSET_HEIGHT {
                let d = (nh as f32 * ch - f.y).abs();
                if d < dmin {
                    h = nh;
                    dmin = d;
                }
            }
        }

        // Stop at the end of the first ring that produced a height
        if i + 1 == next_ring_iter_start {
            if h != UNSET_HEIGHT {
                break;
            }
            next_ring_iter_start += next_ring_iters;
            next_ring_iters += 8;
        }

        if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
            let tmp = dx;
            dx = -dz;
            dz = tmp;
        }
        x += dx;
        z += dz;
    }
    h
}

fn find_edge(edges: &[[i32; 4]], s: i32, t: i32) -> Option<usize> {
    edges
        .iter()
        .position(|e| (e[0] == s && e[1] == t) || (e[0] == t && e[1] == s))
}

fn add_edge(ctx: &BuildContext, edges: &mut Vec<[i32; 4]>, max_edges: usize, s: i32, t: i32, l: i32, r: i32) {
    if edges.len() >= max_edges {
        ctx.log_error(format!("Too many detail edges ({}/{})", edges.len(), max_edges));
        return;
    }
    if find_edge(edges, s, t).is_none() {
        edges.push([s, t, l, r]);
    }
}

fn update_left_face(e: &mut [i32; 4], s: i32, t: i32, f: i32) {
    if e[0] == s && e[1] == t && e[2] == EV_UNDEF {
        e[2] = f;
    } else if e[1] == s && e[0] == t && e[3] == EV_UNDEF {
        e[3] = f;
    }
}

fn overlap_seg_seg_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> bool {
    let a1 = vcross2(a, b, d);
    let a2 = vcross2(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = vcross2(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

fn overlap_edges(pts: &[Vec3], edges: &[[i32; 4]], s1: i32, t1: i32) -> bool {
    edges.iter().any(|e| {
        let (s0, t0) = (e[0], e[1]);
        if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
            return false;
        }
        overlap_seg_seg_2d(
            pts[s0 as usize],
            pts[t0 as usize],
            pts[s1 as usize],
            pts[t1 as usize],
        )
    })
}

fn complete_facet(
    ctx: &BuildContext,
    pts: &[Vec3],
    edges: &mut Vec<[i32; 4]>,
    max_edges: usize,
    nfaces: &mut i32,
    e: usize,
) {
    const EPS: f32 = 1e-5;
    const TOLERANCE: f32 = 0.001;

    let edge = edges[e];
    let (s, t) = if edge[2] == EV_UNDEF {
        (edge[0], edge[1])
    } else if edge[3] == EV_UNDEF {
        (edge[1], edge[0])
    } else {
        // Already completed
        return;
    };

    // Best point on the left of the edge
    let npts = pts.len();
    let mut pt = npts;
    let mut c = Vec3::ZERO;
    let mut r = -1.0f32;
    let ps = pts[s as usize];
    let pt_t = pts[t as usize];
    for (u, &pu) in pts.iter().enumerate() {
        let ui = u as i32;
        if ui == s || ui == t {
            continue;
        }
        if vcross2(ps, pt_t, pu) <= EPS {
            continue;
        }
        if r < 0.0 {
            pt = u;
            (c, r) = circum_circle(ps, pt_t, pu).unwrap_or((ps, 0.0));
            continue;
        }
        let d = vdist2(c, pu);
        if d > r * (1.0 + TOLERANCE) {
            continue;
        }
        if d >= r * (1.0 - TOLERANCE) {
            // On the circle: the new edges must not overlap existing ones
            if overlap_edges(pts, edges, s, ui) || overlap_edges(pts, edges, t, ui) {
                continue;
            }
        }
        pt = u;
        (c, r) = circum_circle(ps, pt_t, pu).unwrap_or((ps, 0.0));
    }

    if pt < npts {
        let p = pt as i32;
        update_left_face(&mut edges[e], s, t, *nfaces);

        match find_edge(edges, p, s) {
            None => add_edge(ctx, edges, max_edges, p, s, *nfaces, EV_UNDEF),
            Some(i) => update_left_face(&mut edges[i], p, s, *nfaces),
        }
        match find_edge(edges, t, p) {
            None => add_edge(ctx, edges, max_edges, t, p, *nfaces, EV_UNDEF),
            Some(i) => update_left_face(&mut edges[i], t, p, *nfaces),
        }
        *nfaces += 1;
    } else {
        update_left_face(&mut edges[e], s, t, EV_HULL);
    }
}

fn delaunay_hull(ctx: &BuildContext, pts: &[Vec3], hull: &[usize], tris: &mut Vec<[i32; 4]>, edges: &mut Vec<[i32; 4]>) {
    let max_edges = pts.len() * 10;
    let mut nfaces = 0i32;
    edges.clear();

    let mut j = hull.len() - 1;
    for i in 0..hull.len() {
        add_edge(ctx, edges, max_edges, hull[j] as i32, hull[i] as i32, EV_HULL, EV_UNDEF);
        j = i;
    }

    let mut current = 0;
    while current < edges.len() {
        if edges[current][2] == EV_UNDEF {
            complete_facet(ctx, pts, edges, max_edges, &mut nfaces, current);
        }
        if edges[current][3] == EV_UNDEF {
            complete_facet(ctx, pts, edges, max_edges, &mut nfaces, current);
        }
        current += 1;
    }

    tris.clear();
    tris.resize(nfaces as usize, [-1, -1, -1, 0]);
    for e in edges.iter() {
        if e[3] >= 0 {
            // Left face
            let t = &mut tris[e[3] as usize];
            if t[0] == -1 {
                t[0] = e[0];
                t[1] = e[1];
            } else if t[0] == e[1] {
                t[2] = e[0];
            } else if t[1] == e[0] {
                t[2] = e[1];
            }
        }
        if e[2] >= 0 {
            // Right face
            let t = &mut tris[e[2] as usize];
            if t[0] == -1 {
                t[0] = e[1];
                t[1] = e[0];
            } else if t[0] == e[0] {
                t[2] = e[1];
            } else if t[1] == e[1] {
                t[2] = e[0];
            }
        }
    }

    let mut i = 0;
    while i < tris.len() {
        let t = tris[i];
        if t[0] == -1 || t[1] == -1 || t[2] == -1 {
            ctx.log_warning(format!(
                "Removing dangling detail face {} [{},{},{}]",
                i, t[0], t[1], t[2]
            ));
            tris.swap_remove(i);
            continue;
        }
        i += 1;
    }
}

/// Fan-like triangulation of the hull that walks left or right, whichever closes
/// the shorter triangle
fn triangulate_hull(verts: &[Vec3], hull: &[usize], nin: usize, tris: &mut Vec<[i32; 4]>) {
    let nhull = hull.len();
    let next = |i: usize| (i + 1) % nhull;
    let prev = |i: usize| (i + nhull - 1) % nhull;

    // Start from the ear with the shortest perimeter
    let (mut start, mut left, mut right) = (0, 1, nhull - 1);
    let mut dmin = f32::MAX;
    for i in 0..nhull {
        // Only original vertices form ears
        if hull[i] >= nin {
            continue;
        }
        let pi = prev(i);
        let ni = next(i);
        let pv = verts[hull[pi]];
        let cv = verts[hull[i]];
        let nv = verts[hull[ni]];
        let d = vdist2(pv, cv) + vdist2(cv, nv) + vdist2(nv, pv);
        if d < dmin {
            start = i;
            left = ni;
            right = pi;
            dmin = d;
        }
    }

    tris.push([hull[start] as i32, hull[left] as i32, hull[right] as i32, 0]);

    while next(left) != right {
        let nleft = next(left);
        let nright = prev(right);

        let cvleft = verts[hull[left]];
        let nvleft = verts[hull[nleft]];
        let cvright = verts[hull[right]];
        let nvright = verts[hull[nright]];
        let dleft = vdist2(cvleft, nvleft) + vdist2(nvleft, cvright);
        let dright = vdist2(cvright, nvright) + vdist2(cvleft, nvright);

        if dleft < dright {
            tris.push([hull[left] as i32, hull[nleft] as i32, hull[right] as i32, 0]);
            left = nleft;
        } else {
            tris.push([hull[left] as i32, hull[nright] as i32, hull[right] as i32, 0]);
            right = nright;
        }
    }
}

fn edge_flag(va: Vec3, vb: Vec3, poly: &[Vec3]) -> u8 {
    const THR_SQR: f32 = 0.001 * 0.001;
    let n = poly.len();
    let mut j = n - 1;
    for i in 0..n {
        if distance_pt_seg_2d(va, poly[j], poly[i]) < THR_SQR && distance_pt_seg_2d(vb, poly[j], poly[i]) < THR_SQR {
            return 1;
        }
        j = i;
    }
    0
}

fn tri_flags(va: Vec3, vb: Vec3, vc: Vec3, poly: &[Vec3]) -> u8 {
    edge_flag(va, vb, poly) | (edge_flag(vb, vc, poly) << 2) | (edge_flag(vc, va, poly) << 4)
}

struct DetailParams {
    sample_dist: f32,
    sample_max_error: f32,
    height_search_radius: i32,
}

/// Detail triangulation of one polygon. `verts` receives the polygon corners
/// followed by the added samples, all relative to the mesh origin.
fn build_poly_detail(
    ctx: &BuildContext,
    input: &[Vec3],
    params: &DetailParams,
    chf: &CompactHeightfield,
    hp: &HeightPatch,
    verts: &mut Vec<Vec3>,
    tris: &mut Vec<[i32; 4]>,
) {
    let nin = input.len();
    let cs = chf.cs;
    let ics = 1.0 / cs;
    let sample_dist = params.sample_dist;
    let sample_max_error = params.sample_max_error;

    verts.clear();
    verts.extend_from_slice(input);
    tris.clear();
    let mut edges: Vec<[i32; 4]> = Vec::new();
    let mut hull: Vec<usize> = Vec::with_capacity(MAX_VERTS);

    let min_extent = poly_min_extent(verts);

    // Tessellate outlines first so that shared edges get identical samples in both
    // polygons
    if sample_dist > 0.0 {
        let mut edge = [Vec3::ZERO; MAX_VERTS_PER_EDGE + 1];
        let mut j = nin - 1;
        for i in 0..nin {
            let (mut vj, mut vi) = (input[j], input[i]);
            // Handle segments in lexicographic order to avoid seams
            let swapped = if (vj.x - vi.x).abs() < 1e-6 { vj.z > vi.z } else { vj.x > vi.x };
            if swapped {
                std::mem::swap(&mut vj, &mut vi);
            }

            let delta = vi - vj;
            let d = (delta.x * delta.x + delta.z * delta.z).sqrt();
            let mut nn = 1 + (d / sample_dist).floor() as usize;
            if nn >= MAX_VERTS_PER_EDGE {
                nn = MAX_VERTS_PER_EDGE - 1;
            }
            if verts.len() + nn >= MAX_VERTS {
                nn = (MAX_VERTS - 1).saturating_sub(verts.len());
            }

            for (k, pos) in edge.iter_mut().enumerate().take(nn + 1) {
                let u = if nn > 0 { k as f32 / nn as f32 } else { 0.0 };
                let mut p = vj + delta * u;
                p.y = get_height(p, ics, chf.ch, params.height_search_radius, hp) as f32 * chf.ch;
                *pos = p;
            }

            // Simplify samples
            let mut idx: Vec<usize> = vec![0, nn];
            let mut k = 0;
            while k + 1 < idx.len() {
                let a = idx[k];
                let b = idx[k + 1];
                let va = edge[a];
                let vb = edge[b];
                let mut maxd = 0.0;
                let mut maxi = None;
                for (m, &p) in edge.iter().enumerate().take(b).skip(a + 1) {
                    let dev = distance_pt_seg(p, va, vb);
                    if dev > maxd {
                        maxd = dev;
                        maxi = Some(m);
                    }
                }
                match maxi {
                    Some(m) if maxd > sample_max_error * sample_max_error => idx.insert(k + 1, m),
                    _ => k += 1,
                }
            }

            hull.push(j);
            let inner = &idx[1..idx.len() - 1];
            if swapped {
                for &k in inner.iter().rev() {
                    verts.push(edge[k]);
                    hull.push(verts.len() - 1);
                }
            } else {
                for &k in inner {
                    verts.push(edge[k]);
                    hull.push(verts.len() - 1);
                }
            }
            j = i;
        }
    } else {
        hull.extend(0..nin);
    }

    // Slivers and tiny polygons get no interior samples
    if min_extent < sample_dist * 2.0 {
        triangulate_hull(verts, &hull, nin, tris);
        return;
    }

    triangulate_hull(verts, &hull, nin, tris);
    if tris.is_empty() {
        ctx.log_warning(format!("Could not triangulate detail polygon ({} verts)", verts.len()));
        return;
    }

    if sample_dist > 0.0 {
        let (mut bmin, mut bmax) = (input[0], input[0]);
        for &v in &input[1..] {
            bmin = bmin.min(v);
            bmax = bmax.max(v);
        }
        let x0 = (bmin.x / sample_dist).floor() as i32;
        let x1 = (bmax.x / sample_dist).ceil() as i32;
        let z0 = (bmin.z / sample_dist).floor() as i32;
        let z1 = (bmax.z / sample_dist).ceil() as i32;

        // (x, height, z, added)
        let mut samples: Vec<(i32, u16, i32, bool)> = Vec::new();
        for z in z0..z1 {
            for x in x0..x1 {
                let pt = Vec3::new(x as f32 * sample_dist, (bmax.y + bmin.y) * 0.5, z as f32 * sample_dist);
                // Keep samples away from the edges
                if dist_to_poly(input, pt) > -sample_dist / 2.0 {
                    continue;
                }
                let h = get_height(pt, ics, chf.ch, params.height_search_radius, hp);
                samples.push((x, h, z, false));
            }
        }

        // Add the sample with the largest error until the error is within bounds
        for _ in 0..samples.len() {
            if verts.len() >= MAX_VERTS {
                break;
            }

            let mut best: Option<(usize, Vec3, f32)> = None;
            for (i, s) in samples.iter().enumerate() {
                if s.3 {
                    continue;
                }
                // Jitter breaks up the symmetry of the sample grid
                let pt = Vec3::new(
                    s.0 as f32 * sample_dist + jitter_x(i) * cs * 0.1,
                    s.1 as f32 * chf.ch,
                    s.2 as f32 * sample_dist + jitter_z(i) * cs * 0.1,
                );
                let Some(d) = dist_to_tri_mesh(pt, verts, tris) else {
                    continue;
                };
                if d > best.map_or(0.0, |b| b.2) {
                    best = Some((i, pt, d));
                }
            }

            let Some((besti, bestpt, bestd)) = best else {
                break;
            };
            if bestd <= sample_max_error {
                break;
            }

            samples[besti].3 = true;
            verts.push(bestpt);

            // TODO: insert the sample incrementally instead of rebuilding the triangulation
            delaunay_hull(ctx, verts, &hull, tris, &mut edges);
        }
    }

    if tris.len() > MAX_TRIS {
        ctx.log_error(format!(
            "Shrinking detail triangle count from {} to max {}",
            tris.len(),
            MAX_TRIS
        ));
        tris.truncate(MAX_TRIS);
    }
}

/// Seeds the height patch BFS with the span closest to the polygon center, reached by
/// walking from the corner span that best matches a corner height
fn seed_with_poly_center(
    ctx: &BuildContext,
    chf: &CompactHeightfield,
    poly: &[u16],
    mesh_verts: &[[u16; 3]],
    bs: i32,
    hp: &mut HeightPatch,
    queue: &mut VecDeque<(i32, i32, usize)>,
) {
    const OFFSET: [(i32, i32); 9] = [(0, 0), (-1, -1), (0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0)];

    let mut start: Option<(i32, i32, usize)> = None;
    let mut dmin = UNSET_HEIGHT as i32;
    'corners: for &v in poly {
        let v = mesh_verts[v as usize];
        for &(ox, oz) in &OFFSET {
            let ax = v[0] as i32 + ox;
            let ay = v[1] as i32;
            let az = v[2] as i32 + oz;
            if ax < hp.xmin || ax >= hp.xmin + hp.width || az < hp.zmin || az >= hp.zmin + hp.height {
                continue;
            }
            for i in chf.cell(ax + bs, az + bs).spans() {
                let d = (ay - chf.spans[i].y as i32).abs();
                if d < dmin {
                    start = Some((ax, az, i));
                    dmin = d;
                    if dmin == 0 {
                        break 'corners;
                    }
                }
            }
        }
    }
    let Some(start) = start else {
        ctx.log_warning("No span found under polygon corners");
        return;
    };

    let n = poly.len() as i32;
    let pcx = poly.iter().map(|&v| mesh_verts[v as usize][0] as i32).sum::<i32>() / n;
    let pcz = poly.iter().map(|&v| mesh_verts[v as usize][2] as i32).sum::<i32>() / n;

    // DFS towards the center. Recording visited cells keeps the walk from getting
    // stuck on simplified contours.
    let mut stack = vec![start];
    let mut dirs = [0usize, 1, 2, 3];
    hp.data.fill(0);
    let mut current = start;
    loop {
        let Some(c) = stack.pop() else {
            ctx.log_warning("Walk towards polygon center failed to reach center");
            break;
        };
        current = c;
        let (cx, cz, ci) = c;
        if cx == pcx && cz == pcz {
            break;
        }

        // Prefer the direction straight towards the center, it is pushed last
        let direct = if cx == pcx {
            dir_for_offset(0, if pcz > cz { 1 } else { -1 })
        } else {
            dir_for_offset(if pcx > cx { 1 } else { -1 }, 0)
        };
        dirs.swap(direct, 3);

        for &dir in &dirs {
            let Some((_, _, ni)) = chf.neighbour(cx + bs, cz + bs, ci, dir) else {
                continue;
            };
            let nx = cx + dir_offset_x(dir);
            let nz = cz + dir_offset_z(dir);
            let hx = nx - hp.xmin;
            let hz = nz - hp.zmin;
            if hx < 0 || hx >= hp.width || hz < 0 || hz >= hp.height {
                continue;
            }
            let cell = &mut hp.data[(hx + hz * hp.width) as usize];
            if *cell != 0 {
                continue;
            }
            *cell = 1;
            stack.push((nx, nz, ni));
        }

        dirs.swap(direct, 3);
    }

    let (cx, cz, ci) = current;
    queue.clear();
    queue.push_back((cx + bs, cz + bs, ci));
    hp.data.fill(UNSET_HEIGHT);
    hp.data[((cx - hp.xmin) + (cz - hp.zmin) * hp.width) as usize] = chf.spans[ci].y;
}

/// Fills the height patch of a polygon by flood filling from its own region
fn get_height_data(
    ctx: &BuildContext,
    chf: &CompactHeightfield,
    poly: &[u16],
    mesh_verts: &[[u16; 3]],
    bs: i32,
    hp: &mut HeightPatch,
    region: u16,
) {
    // Heightfield reads are offset by the border size, polygon vertices are not
    let mut queue: VecDeque<(i32, i32, usize)> = VecDeque::new();
    hp.data.fill(UNSET_HEIGHT);

    // Polygons merged from several regions may overlap polygons of those regions,
    // so their heights are not copied directly
    let mut empty = true;
    if region != RC_MULTIPLE_REGS {
        for hz in 0..hp.height {
            let z = hp.zmin + hz + bs;
            for hx in 0..hp.width {
                let x = hp.xmin + hx + bs;
                if x >= chf.width || z >= chf.height {
                    continue;
                }
                for i in chf.cell(x, z).spans() {
                    let s = &chf.spans[i];
                    if s.reg != region {
                        continue;
                    }
                    hp.data[(hx + hz * hp.width) as usize] = s.y;
                    empty = false;

                    // Region borders seed the fill of the rest of the patch
                    let border = (0..4)
                        .filter_map(|dir| chf.neighbour(x, z, i, dir))
                        .any(|(_, _, ai)| chf.spans[ai].reg != region);
                    if border {
                        queue.push_back((x, z, i));
                    }
                    break;
                }
            }
        }
    }

    if empty {
        seed_with_poly_center(ctx, chf, poly, mesh_verts, bs, hp, &mut queue);
    }

    // BFS from the seeds does not step onto overlapping polygons
    while let Some((cx, cz, ci)) = queue.pop_front() {
        for dir in 0..4 {
            let Some((ax, az, ai)) = chf.neighbour(cx, cz, ci, dir) else {
                continue;
            };
            let hx = ax - hp.xmin - bs;
            let hz = az - hp.zmin - bs;
            if hx < 0 || hx >= hp.width || hz < 0 || hz >= hp.height {
                continue;
            }
            let cell = &mut hp.data[(hx + hz * hp.width) as usize];
            if *cell != UNSET_HEIGHT {
                continue;
            }
            *cell = chf.spans[ai].y;
            queue.push_back((ax, az, ai));
        }
    }
}

impl PolyMeshDetail {
    /// Builds the detail mesh of `mesh` from the compact heightfield it was built from.
    ///
    /// `sample_dist` is the world space sampling distance (0 disables sampling) and
    /// `sample_max_error` the largest allowed height error in world units.
    pub fn build(
        ctx: &mut BuildContext,
        mesh: &PolyMesh,
        chf: &CompactHeightfield,
        sample_dist: f32,
        sample_max_error: f32,
    ) -> Result<Self> {
        let mut dmesh = PolyMeshDetail::default();
        if mesh.verts.is_empty() || mesh.npolys == 0 {
            return Ok(dmesh);
        }

        ctx.start_timer(TimerCategory::DetailMesh);

        let cs = mesh.cs;
        let ch = mesh.ch;
        let orig = mesh.bmin;
        let border_size = mesh.border_size;
        let params = DetailParams {
            sample_dist,
            sample_max_error,
            height_search_radius: 1.max(mesh.max_edge_error.ceil() as i32),
        };

        // Cell bounds of every polygon, padded by one cell
        let mut bounds: Vec<Option<[i32; 4]>> = Vec::with_capacity(mesh.npolys);
        let mut max_hw = 0;
        let mut max_hh = 0;
        for i in 0..mesh.npolys {
            let (mut xmin, mut xmax, mut zmin, mut zmax) = (chf.width, 0, chf.height, 0);
            for &v in mesh.poly(i) {
                let v = mesh.verts[v as usize];
                xmin = xmin.min(v[0] as i32);
                xmax = xmax.max(v[0] as i32);
                zmin = zmin.min(v[2] as i32);
                zmax = zmax.max(v[2] as i32);
            }
            let xmin = (xmin - 1).max(0);
            let xmax = (xmax + 1).min(chf.width);
            let zmin = (zmin - 1).max(0);
            let zmax = (zmax + 1).min(chf.height);
            if xmin >= xmax || zmin >= zmax {
                bounds.push(None);
                continue;
            }
            max_hw = max_hw.max(xmax - xmin);
            max_hh = max_hh.max(zmax - zmin);
            bounds.push(Some([xmin, xmax, zmin, zmax]));
        }

        let mut hp = HeightPatch {
            data: Vec::with_capacity((max_hw * max_hh) as usize),
            xmin: 0,
            zmin: 0,
            width: 0,
            height: 0,
        };
        let mut verts: Vec<Vec3> = Vec::with_capacity(MAX_VERTS);
        let mut tris: Vec<[i32; 4]> = Vec::new();

        for i in 0..mesh.npolys {
            if i % 64 == 0 {
                if let Err(e) = ctx.check_cancelled() {
                    ctx.stop_timer(TimerCategory::DetailMesh);
                    return Err(e);
                }
            }

            let p = mesh.poly(i);
            let poly: Vec<Vec3> = p
                .iter()
                .map(|&v| {
                    let v = mesh.verts[v as usize];
                    Vec3::new(v[0] as f32 * cs, v[1] as f32 * ch, v[2] as f32 * cs)
                })
                .collect();

            verts.clear();
            tris.clear();
            if let Some([xmin, xmax, zmin, zmax]) = bounds[i] {
                hp.xmin = xmin;
                hp.zmin = zmin;
                hp.width = xmax - xmin;
                hp.height = zmax - zmin;
                hp.data.clear();
                hp.data.resize((hp.width * hp.height) as usize, UNSET_HEIGHT);
                get_height_data(ctx, chf, p, &mesh.verts, border_size, &mut hp, mesh.regs[i]);
                build_poly_detail(ctx, &poly, &params, chf, &hp, &mut verts, &mut tris);
            } else {
                verts.extend_from_slice(&poly);
            }

            // To world space
            let offset = Vec3::new(orig.x, orig.y + chf.ch, orig.z);
            for v in verts.iter_mut() {
                *v += offset;
            }
            let poly_world: Vec<Vec3> = poly.iter().map(|&v| v + orig).collect();

            let vert_base = dmesh.verts.len() as u32;
            let tri_base = dmesh.tris.len() as u32;
            dmesh.meshes.push([vert_base, verts.len() as u32, tri_base, tris.len() as u32]);
            dmesh.verts.extend_from_slice(&verts);
            for t in &tris {
                let (a, b, c) = (verts[t[0] as usize], verts[t[1] as usize], verts[t[2] as usize]);
                dmesh.tris.push([t[0] as u8, t[1] as u8, t[2] as u8, tri_flags(a, b, c, &poly_world)]);
            }
        }

        ctx.stop_timer(TimerCategory::DetailMesh);
        Ok(dmesh)
    }

    /// Number of sub-meshes, one per polygon
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::{BuildContoursFlags, ContourSet};
    use crate::distance_field::build_distance_field;
    use crate::heightfield::Heightfield;
    use crate::region::build_regions_watershed;
    use crate::RC_WALKABLE_AREA;

    fn flat_pipeline(size: i32, sample_dist: f32) -> (PolyMesh, PolyMeshDetail) {
        let mut ctx = BuildContext::new();
        let mut hf = Heightfield::new(
            size,
            size,
            Vec3::ZERO,
            Vec3::new(size as f32, 10.0, size as f32),
            1.0,
            0.5,
        );
        for z in 0..size {
            for x in 0..size {
                hf.add_span(x, z, 0, 2, RC_WALKABLE_AREA, 1).unwrap();
            }
        }
        let mut chf = CompactHeightfield::build(&mut ctx, 4, 1, &hf).unwrap();
        build_distance_field(&mut ctx, &mut chf).unwrap();
        build_regions_watershed(&mut ctx, &mut chf, 0, 2, 20).unwrap();
        let cset = ContourSet::build(&mut ctx, &chf, 1.3, 12, BuildContoursFlags::default()).unwrap();
        let pmesh = PolyMesh::build(&mut ctx, &cset, 6).unwrap();
        let dmesh = PolyMeshDetail::build(&mut ctx, &pmesh, &chf, sample_dist, 1.0).unwrap();
        (pmesh, dmesh)
    }

    #[test]
    fn test_circum_circle() {
        let (c, r) = circum_circle(Vec3::new(0.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 2.0)).unwrap();
        assert!((c - Vec3::new(1.0, 0.0, 1.0)).length() < 1e-5);
        assert!((r - 2f32.sqrt()).abs() < 1e-5);
        assert!(circum_circle(Vec3::ZERO, Vec3::X, Vec3::X * 2.0).is_none());
    }

    #[test]
    fn test_dist_to_poly_sign() {
        let square = [
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 0.0),
        ];
        assert!((dist_to_poly(&square, Vec3::new(2.0, 0.0, 2.0)) + 4.0).abs() < 1e-5);
        assert!((dist_to_poly(&square, Vec3::new(6.0, 0.0, 2.0)) - 4.0).abs() < 1e-5);
        assert!((poly_min_extent(&square) - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_triangulate_hull_covers_polygon() {
        let verts = vec![
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 4.0),
        ];
        let hull = vec![0, 4, 1, 2, 3];
        let mut tris = Vec::new();
        triangulate_hull(&verts, &hull, 4, &mut tris);
        assert_eq!(tris.len(), 3);
    }

    #[test]
    fn test_delaunay_hull_with_interior_point() {
        let verts = vec![
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 1.0, 2.0),
        ];
        let hull = vec![0, 1, 2, 3];
        let mut tris = Vec::new();
        let mut edges = Vec::new();
        delaunay_hull(&BuildContext::new(), &verts, &hull, &mut tris, &mut edges);
        assert_eq!(tris.len(), 4);
        assert!(tris.iter().all(|t| t[..3].contains(&4)));
    }

    fn floor_with_hole(size: i32, hole: Option<(i32, i32)>) -> CompactHeightfield {
        let mut ctx = BuildContext::new();
        let mut hf = Heightfield::new(size, size, Vec3::ZERO, Vec3::new(size as f32, 10.0, size as f32), 1.0, 0.5);
        for z in 0..size {
            for x in 0..size {
                if Some((x, z)) != hole {
                    hf.add_span(x, z, 0, 2, RC_WALKABLE_AREA, 1).unwrap();
                }
            }
        }
        CompactHeightfield::build(&mut ctx, 4, 1, &hf).unwrap()
    }

    fn seed(chf: &CompactHeightfield) -> (HeightPatch, VecDeque<(i32, i32, usize)>) {
        let verts = [[0u16, 2, 0], [0, 2, 6], [6, 2, 6], [6, 2, 0]];
        let poly = [0u16, 1, 2, 3];
        let mut hp = HeightPatch {
            data: vec![0; 64],
            xmin: 0,
            zmin: 0,
            width: 8,
            height: 8,
        };
        let mut queue = VecDeque::new();
        seed_with_poly_center(&BuildContext::new(), chf, &poly, &verts, 0, &mut hp, &mut queue);
        (hp, queue)
    }

    #[test]
    fn test_center_seed_walks_to_polygon_center() {
        let chf = floor_with_hole(8, None);
        let (hp, queue) = seed(&chf);
        assert_eq!(queue.len(), 1);
        let (x, z, i) = queue[0];
        assert_eq!((x, z), (3, 3));
        assert_eq!(hp.data[(3 + 3 * 8) as usize], chf.spans[i].y);
    }

    #[test]
    fn test_center_seed_falls_back_to_last_visited_cell() {
        // No span at the center, so the walk runs out of cells
        let chf = floor_with_hole(8, Some((3, 3)));
        let (hp, queue) = seed(&chf);
        assert_eq!(queue.len(), 1);
        let (x, z, i) = queue[0];
        assert_ne!((x, z), (3, 3));
        assert_eq!(hp.data[(x + z * 8) as usize], chf.spans[i].y);
        assert_eq!(hp.data.iter().filter(|&&h| h != UNSET_HEIGHT).count(), 1);
    }

    #[test]
    fn test_flat_detail_mesh_matches_floor() {
        let (pmesh, dmesh) = flat_pipeline(12, 2.0);
        assert_eq!(dmesh.len(), pmesh.npolys);
        for (i, m) in dmesh.meshes.iter().enumerate() {
            assert!(m[1] as usize >= pmesh.poly(i).len());
            assert!(m[3] as usize >= pmesh.poly(i).len() - 2);
        }
        // Span tops at y = 2 cells of 0.5, plus one cell of offset
        for v in &dmesh.verts {
            assert!((v.y - 1.5).abs() < 1e-3, "vertex {:?}", v);
        }
    }

    #[test]
    fn test_without_sampling_only_corners_are_used() {
        let (pmesh, dmesh) = flat_pipeline(8, 0.0);
        for (i, m) in dmesh.meshes.iter().enumerate() {
            assert_eq!(m[1] as usize, pmesh.poly(i).len());
            assert_eq!(m[3] as usize, pmesh.poly(i).len() - 2);
        }
        // Every triangle of a quad has two boundary edges
        let boundary_edges: u32 = dmesh.tris.iter().map(|t| (t[3] & 0x15).count_ones()).sum();
        let poly_edges: usize = (0..pmesh.npolys).map(|i| pmesh.poly(i).len()).sum();
        assert_eq!(boundary_edges as usize, poly_edges);
    }
}
