//! Polygon mesh generation for Recast
//!
//! Each contour is ear-clipped into triangles which are then greedily merged into
//! convex polygons of at most `nvp` vertices. Vertices flagged as tile border vertices
//! are removed afterwards and the resulting holes retriangulated, so that neighbouring
//! tiles meet at identical edges. Finally polygon adjacency and tile portals are
//! computed.

use std::collections::HashMap;

use glam::Vec3;

use navkit_common::{Error, Result};

use crate::context::{BuildContext, TimerCategory};
use crate::contour::{collinear, intersect, left, left_on, vequal, ContourSet};
use crate::{MESH_NULL_IDX, RC_BORDER_VERTEX, RC_MULTIPLE_REGS};

const INDEX_MASK: u32 = 0x0fff_ffff;
const REMOVABLE: u32 = 0x8000_0000;

/// Polygon mesh of one tile.
///
/// `polys` holds `nvp` vertex indices followed by `nvp` neighbour entries per polygon.
/// Unused slots are `MESH_NULL_IDX`. A neighbour entry is either a polygon index, or
/// `0x8000 | side` for edges on the tile border (0 = -x, 1 = +z, 2 = +x, 3 = -z).
#[derive(Debug, Clone, PartialEq)]
pub struct PolyMesh {
    /// Vertices in cell coordinates
    pub verts: Vec<[u16; 3]>,
    /// Polygon vertex and neighbour data
    pub polys: Vec<u16>,
    /// Region id per polygon
    pub regs: Vec<u16>,
    /// User flags per polygon
    pub flags: Vec<u16>,
    /// Area id per polygon
    pub areas: Vec<u8>,
    /// Number of polygons
    pub npolys: usize,
    /// Maximum number of vertices per polygon
    pub nvp: usize,
    /// The minimum bounds
    pub bmin: Vec3,
    /// The maximum bounds
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    /// Border size the source contours were built with
    pub border_size: i32,
    /// Simplification error of the source contours
    pub max_edge_error: f32,
}

#[inline]
fn next(i: usize, n: usize) -> usize {
    if i + 1 < n {
        i + 1
    } else {
        0
    }
}

#[inline]
fn prev(i: usize, n: usize) -> usize {
    if i >= 1 {
        i - 1
    } else {
        n - 1
    }
}

#[inline]
fn vert(verts: &[[i32; 4]], index: u32) -> &[i32; 4] {
    &verts[(index & INDEX_MASK) as usize]
}

/// Segment (i, j) does not cross any polygon edge not incident to i or j
fn diagonalie(i: usize, j: usize, verts: &[[i32; 4]], indices: &[u32], loose: bool) -> bool {
    let n = indices.len();
    let d0 = vert(verts, indices[i]);
    let d1 = vert(verts, indices[j]);

    for k in 0..n {
        let k1 = next(k, n);
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = vert(verts, indices[k]);
        let p1 = vert(verts, indices[k1]);
        if vequal(d0, p0) || vequal(d1, p0) || vequal(d0, p1) || vequal(d1, p1) {
            continue;
        }
        let crosses = if loose {
            !collinear(d0, d1, p0)
                && !collinear(d0, d1, p1)
                && !collinear(p0, p1, d0)
                && !collinear(p0, p1, d1)
                && ((left(d0, d1, p0) ^ left(d0, d1, p1)) && (left(p0, p1, d0) ^ left(p0, p1, d1)))
        } else {
            intersect(d0, d1, p0, p1)
        };
        if crosses {
            return false;
        }
    }
    true
}

/// The diagonal (i, j) is strictly internal to the polygon near the endpoint i
fn in_cone(i: usize, j: usize, verts: &[[i32; 4]], indices: &[u32], loose: bool) -> bool {
    let n = indices.len();
    let pi = vert(verts, indices[i]);
    let pj = vert(verts, indices[j]);
    let pi1 = vert(verts, indices[next(i, n)]);
    let pin1 = vert(verts, indices[prev(i, n)]);

    // Convex vertex: pi1 left of or on (pin1, pi)
    if left_on(pin1, pi, pi1) {
        return if loose {
            left_on(pi, pj, pin1) && left_on(pj, pi, pi1)
        } else {
            left(pi, pj, pin1) && left(pj, pi, pi1)
        };
    }
    // Reflex vertex
    !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
}

fn diagonal(i: usize, j: usize, verts: &[[i32; 4]], indices: &[u32], loose: bool) -> bool {
    in_cone(i, j, verts, indices, loose) && diagonalie(i, j, verts, indices, loose)
}

/// Ear-clips the polygon `indices` into `tris`.
///
/// Returns false when the outline is self-overlapping and could only be partially
/// triangulated; `tris` then holds the triangles found so far.
fn triangulate(verts: &[[i32; 4]], indices: &mut Vec<u32>, tris: &mut Vec<[u32; 3]>) -> bool {
    tris.clear();

    // The top bit of an index marks vertices that are removable ears
    let n = indices.len();
    for i in 0..n {
        let i1 = next(i, n);
        let i2 = next(i1, n);
        if diagonal(i, i2, verts, indices, false) {
            indices[i1] |= REMOVABLE;
        }
    }

    while indices.len() > 3 {
        let n = indices.len();
        let edge_len = |a: u32, b: u32| {
            let p0 = vert(verts, a);
            let p2 = vert(verts, b);
            let dx = p2[0] - p0[0];
            let dz = p2[2] - p0[2];
            dx * dx + dz * dz
        };

        let mut best: Option<(i32, usize)> = None;
        for i in 0..n {
            let i1 = next(i, n);
            if indices[i1] & REMOVABLE != 0 {
                let len = edge_len(indices[i], indices[next(i1, n)]);
                if best.map_or(true, |(l, _)| len < l) {
                    best = Some((len, i));
                }
            }
        }

        if best.is_none() {
            // Overlapping segments: loosen the cone test and retry
            for i in 0..n {
                let i1 = next(i, n);
                let i2 = next(i1, n);
                if diagonal(i, i2, verts, indices, true) {
                    let len = edge_len(indices[i], indices[next(i2, n)]);
                    if best.map_or(true, |(l, _)| len < l) {
                        best = Some((len, i));
                    }
                }
            }
        }

        let Some((_, i)) = best else {
            // The contour is messed up, usually from too aggressive simplification
            return false;
        };

        let mut i1 = next(i, n);
        let i2 = next(i1, n);
        tris.push([
            indices[i] & INDEX_MASK,
            indices[i1] & INDEX_MASK,
            indices[i2] & INDEX_MASK,
        ]);

        // Remove the ear tip
        indices.remove(i1);
        let n = indices.len();
        if i1 >= n {
            i1 = 0;
        }
        let i = prev(i1, n);

        // Update diagonal flags
        if diagonal(prev(i, n), i1, verts, indices, false) {
            indices[i] |= REMOVABLE;
        } else {
            indices[i] &= INDEX_MASK;
        }
        if diagonal(i, next(i1, n), verts, indices, false) {
            indices[i1] |= REMOVABLE;
        } else {
            indices[i1] &= INDEX_MASK;
        }
    }

    tris.push([
        indices[0] & INDEX_MASK,
        indices[1] & INDEX_MASK,
        indices[2] & INDEX_MASK,
    ]);
    true
}

fn count_poly_verts(p: &[u16]) -> usize {
    p.iter().position(|&v| v == MESH_NULL_IDX).unwrap_or(p.len())
}

#[inline]
fn uleft(a: &[u16; 3], b: &[u16; 3], c: &[u16; 3]) -> bool {
    (b[0] as i32 - a[0] as i32) * (c[2] as i32 - a[2] as i32)
        - (c[0] as i32 - a[0] as i32) * (b[2] as i32 - a[2] as i32)
        < 0
}

/// Squared length of the shared edge when `pa` and `pb` can be merged into one
/// convex polygon, together with the edge indices in both polygons
fn get_poly_merge_value(pa: &[u16], pb: &[u16], verts: &[[u16; 3]], nvp: usize) -> Option<(i32, usize, usize)> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);
    if na + nb - 2 > nvp {
        return None;
    }

    // Polygons must share an edge
    let mut shared = None;
    'outer: for i in 0..na {
        let (mut va0, mut va1) = (pa[i], pa[(i + 1) % na]);
        if va0 > va1 {
            std::mem::swap(&mut va0, &mut va1);
        }
        for j in 0..nb {
            let (mut vb0, mut vb1) = (pb[j], pb[(j + 1) % nb]);
            if vb0 > vb1 {
                std::mem::swap(&mut vb0, &mut vb1);
            }
            if va0 == vb0 && va1 == vb1 {
                shared = Some((i, j));
                break 'outer;
            }
        }
    }
    let (ea, eb) = shared?;

    // The merged polygon must stay convex
    let v = |i: u16| &verts[i as usize];
    if !uleft(v(pa[(ea + na - 1) % na]), v(pa[ea]), v(pb[(eb + 2) % nb])) {
        return None;
    }
    if !uleft(v(pb[(eb + nb - 1) % nb]), v(pb[eb]), v(pa[(ea + 2) % na])) {
        return None;
    }

    let a = v(pa[ea]);
    let b = v(pa[(ea + 1) % na]);
    let dx = a[0] as i32 - b[0] as i32;
    let dz = a[2] as i32 - b[2] as i32;
    Some((dx * dx + dz * dz, ea, eb))
}

/// Joins `pb` into `pa` across their shared edge
fn merge_poly_verts(pa: &mut [u16], pb: &[u16], ea: usize, eb: usize) {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);
    let mut tmp = vec![MESH_NULL_IDX; pa.len()];
    let mut n = 0;
    for i in 0..na - 1 {
        tmp[n] = pa[(ea + 1 + i) % na];
        n += 1;
    }
    for i in 0..nb - 1 {
        tmp[n] = pb[(eb + 1 + i) % nb];
        n += 1;
    }
    pa.copy_from_slice(&tmp);
}

/// Greedily merges polygons (stored `nvp` apart in `polys`) along their longest
/// shared edges. `on_merge(a, b)` runs before polygon `b` is merged into `a` and the
/// last polygon moved into the slot of `b`.
fn merge_polygons(
    polys: &mut Vec<u16>,
    verts: &[[u16; 3]],
    nvp: usize,
    mut on_merge: impl FnMut(usize, usize, usize),
) {
    loop {
        let npolys = polys.len() / nvp;
        let mut best: Option<(i32, usize, usize, usize, usize)> = None;
        for j in 0..npolys.saturating_sub(1) {
            for k in j + 1..npolys {
                let pj = &polys[j * nvp..(j + 1) * nvp];
                let pk = &polys[k * nvp..(k + 1) * nvp];
                if let Some((value, ea, eb)) = get_poly_merge_value(pj, pk, verts, nvp) {
                    if value > best.map_or(0, |b| b.0) {
                        best = Some((value, j, k, ea, eb));
                    }
                }
            }
        }

        let Some((_, pa, pb, ea, eb)) = best else {
            break;
        };

        let pb_verts: Vec<u16> = polys[pb * nvp..(pb + 1) * nvp].to_vec();
        merge_poly_verts(&mut polys[pa * nvp..(pa + 1) * nvp], &pb_verts, ea, eb);
        on_merge(pa, pb, npolys - 1);

        let last = npolys - 1;
        if pb != last {
            polys.copy_within(last * nvp..(last + 1) * nvp, pb * nvp);
        }
        polys.truncate(last * nvp);
    }
}

/// Index of the vertex at `(x, y, z)`, adding it when no vertex within two cell
/// heights exists at the same `(x, z)`
fn add_vertex(x: u16, y: u16, z: u16, verts: &mut Vec<[u16; 3]>, lookup: &mut HashMap<(u16, u16), Vec<u16>>) -> u16 {
    let bucket = lookup.entry((x, z)).or_default();
    for &i in bucket.iter() {
        if (verts[i as usize][1] as i32 - y as i32).abs() <= 2 {
            return i;
        }
    }
    let i = verts.len() as u16;
    verts.push([x, y, z]);
    bucket.push(i);
    i
}

fn build_mesh_adjacency(polys: &mut [u16], npolys: usize, nverts: usize, nvp: usize) {
    #[derive(Clone, Copy)]
    struct Edge {
        vert: [u16; 2],
        poly_edge: [u16; 2],
        poly: [u16; 2],
    }

    const NONE: usize = usize::MAX;
    let mut first_edge = vec![NONE; nverts];
    let mut next_edge: Vec<usize> = Vec::with_capacity(npolys * nvp);
    let mut edges: Vec<Edge> = Vec::with_capacity(npolys * nvp);

    let edge_verts = |t: &[u16], j: usize| {
        let v0 = t[j];
        let v1 = if j + 1 >= nvp || t[j + 1] == MESH_NULL_IDX { t[0] } else { t[j + 1] };
        (v0, v1)
    };

    for i in 0..npolys {
        let t = &polys[i * nvp * 2..i * nvp * 2 + nvp];
        for j in 0..nvp {
            if t[j] == MESH_NULL_IDX {
                break;
            }
            let (v0, v1) = edge_verts(t, j);
            if v0 < v1 {
                edges.push(Edge {
                    vert: [v0, v1],
                    poly_edge: [j as u16, 0],
                    poly: [i as u16, i as u16],
                });
                next_edge.push(first_edge[v0 as usize]);
                first_edge[v0 as usize] = edges.len() - 1;
            }
        }
    }

    for i in 0..npolys {
        let t = &polys[i * nvp * 2..i * nvp * 2 + nvp];
        for j in 0..nvp {
            if t[j] == MESH_NULL_IDX {
                break;
            }
            let (v0, v1) = edge_verts(t, j);
            if v0 > v1 {
                let mut e = first_edge[v1 as usize];
                while e != NONE {
                    let edge = &mut edges[e];
                    if edge.vert[1] == v0 && edge.poly[0] == edge.poly[1] {
                        edge.poly[1] = i as u16;
                        edge.poly_edge[1] = j as u16;
                        break;
                    }
                    e = next_edge[e];
                }
            }
        }
    }

    for e in &edges {
        if e.poly[0] != e.poly[1] {
            let p0 = e.poly[0] as usize * nvp * 2;
            let p1 = e.poly[1] as usize * nvp * 2;
            polys[p0 + nvp + e.poly_edge[0] as usize] = e.poly[1];
            polys[p1 + nvp + e.poly_edge[1] as usize] = e.poly[0];
        }
    }
}

impl PolyMesh {
    fn poly_verts(&self, i: usize) -> &[u16] {
        &self.polys[i * self.nvp * 2..i * self.nvp * 2 + self.nvp]
    }

    /// Vertex indices of polygon `i`, without unused slots
    pub fn poly(&self, i: usize) -> &[u16] {
        let p = self.poly_verts(i);
        &p[..count_poly_verts(p)]
    }

    /// Neighbour entries of polygon `i`, one per vertex slot
    pub fn neighbours(&self, i: usize) -> &[u16] {
        &self.polys[i * self.nvp * 2 + self.nvp..(i + 1) * self.nvp * 2]
    }

    /// Appends a polygon with no neighbours
    fn push_poly(&mut self, verts: &[u16], reg: u16, area: u8) {
        let start = self.polys.len();
        self.polys.resize(start + self.nvp * 2, MESH_NULL_IDX);
        self.polys[start..start + verts.len()].copy_from_slice(verts);
        self.regs.push(reg);
        self.areas.push(area);
        self.npolys += 1;
    }

    /// Removes polygon `i` by moving the last polygon into its slot
    fn swap_remove_poly(&mut self, i: usize) {
        let nvp = self.nvp;
        let last = self.npolys - 1;
        if i != last {
            self.polys.copy_within(last * nvp * 2..last * nvp * 2 + nvp, i * nvp * 2);
        }
        self.polys[i * nvp * 2 + nvp..(i + 1) * nvp * 2].fill(MESH_NULL_IDX);
        self.polys.truncate(last * nvp * 2);
        self.regs.swap_remove(i);
        self.areas.swap_remove(i);
        self.npolys -= 1;
    }

    /// Whether removing vertex `rem` leaves a hole that can be retriangulated
    fn can_remove_vertex(&self, rem: u16) -> bool {
        let mut num_touched_verts = 0;
        let mut num_remaining_edges = 0;
        for i in 0..self.npolys {
            let p = self.poly(i);
            let num_removed = p.iter().filter(|&&v| v == rem).count();
            if num_removed > 0 {
                num_touched_verts += num_removed;
                num_remaining_edges += p.len() - (num_removed + 1);
            }
        }

        // A triangle tip without neighbours cannot be removed
        if num_remaining_edges <= 2 {
            return false;
        }

        // Edges touching the removed vertex, (other vertex, share count)
        let mut edges: Vec<(u16, i32)> = Vec::with_capacity(num_touched_verts * 2);
        for i in 0..self.npolys {
            let p = self.poly(i);
            let nv = p.len();
            let mut k = nv - 1;
            for j in 0..nv {
                if p[j] == rem || p[k] == rem {
                    let (mut a, mut b) = (p[j], p[k]);
                    if b == rem {
                        std::mem::swap(&mut a, &mut b);
                    }
                    debug_assert_eq!(a, rem);
                    match edges.iter_mut().find(|e| e.0 == b) {
                        Some(e) => e.1 += 1,
                        None => edges.push((b, 1)),
                    }
                }
                k = j;
            }
        }

        // Two non-adjacent polygons sharing the vertex leave more than two open edges
        edges.iter().filter(|e| e.1 < 2).count() <= 2
    }

    fn remove_vertex(&mut self, ctx: &BuildContext, rem: u16) -> Result<()> {
        let nvp = self.nvp;

        // Boundary edges of the polygons around the vertex: (a, b, reg, area)
        let mut edges: Vec<(u16, u16, u16, u8)> = Vec::new();
        let mut i = 0;
        while i < self.npolys {
            let p = self.poly(i).to_vec();
            if !p.contains(&rem) {
                i += 1;
                continue;
            }
            let nv = p.len();
            let mut k = nv - 1;
            for j in 0..nv {
                if p[j] != rem && p[k] != rem {
                    edges.push((p[k], p[j], self.regs[i], self.areas[i]));
                }
                k = j;
            }
            self.swap_remove_poly(i);
        }

        self.verts.remove(rem as usize);

        // Shift indices past the removed vertex
        for i in 0..self.npolys {
            let start = i * nvp * 2;
            for v in &mut self.polys[start..start + nvp] {
                if *v != MESH_NULL_IDX && *v > rem {
                    *v -= 1;
                }
            }
        }
        for e in &mut edges {
            if e.0 > rem {
                e.0 -= 1;
            }
            if e.1 > rem {
                e.1 -= 1;
            }
        }

        if edges.is_empty() {
            return Ok(());
        }

        // Chain the edges into the hole outline
        let mut hole: std::collections::VecDeque<(u16, u16, u8)> = std::collections::VecDeque::new();
        hole.push_back((edges[0].0, edges[0].2, edges[0].3));
        while !edges.is_empty() {
            let mut matched = false;
            let mut i = 0;
            while i < edges.len() {
                let (ea, eb, reg, area) = edges[i];
                let added = if hole.front().map(|h| h.0) == Some(eb) {
                    hole.push_front((ea, reg, area));
                    true
                } else if hole.back().map(|h| h.0) == Some(ea) {
                    hole.push_back((eb, reg, area));
                    true
                } else {
                    false
                };
                if added {
                    edges.swap_remove(i);
                    matched = true;
                } else {
                    i += 1;
                }
            }
            if !matched {
                break;
            }
        }

        let hole: Vec<(u16, u16, u8)> = hole.into_iter().collect();
        let tverts: Vec<[i32; 4]> = hole
            .iter()
            .map(|&(v, _, _)| {
                let p = self.verts[v as usize];
                [p[0] as i32, p[1] as i32, p[2] as i32, 0]
            })
            .collect();
        let mut thole: Vec<u32> = (0..hole.len() as u32).collect();
        let mut tris = Vec::new();
        if !triangulate(&tverts, &mut thole, &mut tris) {
            ctx.log_warning("Vertex removal produced a bad triangulation");
        }

        // Initial polygons from the hole triangles
        let mut polys: Vec<u16> = Vec::with_capacity((tris.len() + 1) * nvp);
        let mut pregs: Vec<u16> = Vec::new();
        let mut pareas: Vec<u8> = Vec::new();
        for t in &tris {
            let [t0, t1, t2] = t.map(|x| x as usize);
            if t0 == t1 || t0 == t2 || t1 == t2 {
                continue;
            }
            let start = polys.len();
            polys.resize(start + nvp, MESH_NULL_IDX);
            polys[start] = hole[t0].0;
            polys[start + 1] = hole[t1].0;
            polys[start + 2] = hole[t2].0;
            // Polygons covering several regions are marked as such
            if hole[t0].1 != hole[t1].1 || hole[t1].1 != hole[t2].1 {
                pregs.push(RC_MULTIPLE_REGS);
            } else {
                pregs.push(hole[t0].1);
            }
            pareas.push(hole[t0].2);
        }
        if polys.is_empty() {
            return Ok(());
        }

        if nvp > 3 {
            merge_polygons(&mut polys, &self.verts, nvp, |pa, pb, last| {
                if pregs[pa] != pregs[pb] {
                    pregs[pa] = RC_MULTIPLE_REGS;
                }
                pregs[pb] = pregs[last];
                pareas[pb] = pareas[last];
                pregs.truncate(last);
                pareas.truncate(last);
            });
        }

        for i in 0..polys.len() / nvp {
            let p = polys[i * nvp..(i + 1) * nvp].to_vec();
            self.push_poly(&p[..count_poly_verts(&p)], pregs[i], pareas[i]);
        }
        if self.npolys > 0xfffe {
            return Err(Error::NavMeshGeneration(format!(
                "Too many polygons {} (max: {})",
                self.npolys, 0xfffe
            )));
        }
        Ok(())
    }

    /// Builds the polygon mesh of a contour set with at most `nvp` vertices per polygon
    pub fn build(ctx: &mut BuildContext, cset: &ContourSet, nvp: usize) -> Result<Self> {
        ctx.start_timer(TimerCategory::PolyMesh);

        let mut mesh = PolyMesh {
            verts: Vec::new(),
            polys: Vec::new(),
            regs: Vec::new(),
            flags: Vec::new(),
            areas: Vec::new(),
            npolys: 0,
            nvp,
            bmin: cset.bmin,
            bmax: cset.bmax,
            cs: cset.cs,
            ch: cset.ch,
            border_size: cset.border_size,
            max_edge_error: cset.max_error,
        };

        let max_vertices: usize = cset.contours.iter().filter(|c| c.verts.len() >= 3).map(|c| c.verts.len()).sum();
        if max_vertices >= 0xfffe {
            ctx.stop_timer(TimerCategory::PolyMesh);
            return Err(Error::NavMeshGeneration(format!(
                "Too many vertices {} (max: {})",
                max_vertices, 0xfffe
            )));
        }

        let mut remove_flags: Vec<bool> = Vec::with_capacity(max_vertices);
        let mut lookup: HashMap<(u16, u16), Vec<u16>> = HashMap::new();
        let mut indices: Vec<u32> = Vec::new();
        let mut tris: Vec<[u32; 3]> = Vec::new();
        let mut polys: Vec<u16> = Vec::new();

        for (ci, contour) in cset.contours.iter().enumerate() {
            if contour.verts.len() < 3 {
                continue;
            }

            indices.clear();
            indices.extend(0..contour.verts.len() as u32);
            if !triangulate(&contour.verts, &mut indices, &mut tris) {
                ctx.log_warning(format!("Bad triangulation of contour {}", ci));
            }

            // Add and merge vertices
            let mesh_index: Vec<u16> = contour
                .verts
                .iter()
                .map(|v| {
                    let idx = add_vertex(
                        v[0].clamp(0, 0xffff) as u16,
                        v[1].clamp(0, 0xffff) as u16,
                        v[2].clamp(0, 0xffff) as u16,
                        &mut mesh.verts,
                        &mut lookup,
                    );
                    if remove_flags.len() < mesh.verts.len() {
                        remove_flags.resize(mesh.verts.len(), false);
                    }
                    if v[3] & RC_BORDER_VERTEX != 0 {
                        // Tile border vertex, removed below
                        remove_flags[idx as usize] = true;
                    }
                    idx
                })
                .collect();

            // Initial triangles
            polys.clear();
            for t in &tris {
                let [t0, t1, t2] = t.map(|x| x as usize);
                if t0 != t1 && t0 != t2 && t1 != t2 {
                    let start = polys.len();
                    polys.resize(start + nvp, MESH_NULL_IDX);
                    polys[start] = mesh_index[t0];
                    polys[start + 1] = mesh_index[t1];
                    polys[start + 2] = mesh_index[t2];
                }
            }
            if polys.is_empty() {
                continue;
            }

            if nvp > 3 {
                merge_polygons(&mut polys, &mesh.verts, nvp, |_, _, _| {});
            }

            for p in polys.chunks(nvp) {
                mesh.push_poly(&p[..count_poly_verts(p)], contour.reg, contour.area);
            }
        }

        ctx.check_cancelled()?;

        // Remove tile border vertices
        let mut i = 0;
        while i < mesh.verts.len() {
            if remove_flags[i] && mesh.can_remove_vertex(i as u16) {
                if let Err(e) = mesh.remove_vertex(ctx, i as u16) {
                    ctx.stop_timer(TimerCategory::PolyMesh);
                    return Err(e);
                }
                remove_flags.remove(i);
                continue;
            }
            i += 1;
        }

        build_mesh_adjacency(&mut mesh.polys, mesh.npolys, mesh.verts.len(), nvp);

        // Mark edges on the tile border as portals
        if mesh.border_size > 0 {
            let w = cset.width as u16;
            let h = cset.height as u16;
            for i in 0..mesh.npolys {
                let base = i * nvp * 2;
                for j in 0..nvp {
                    let va_idx = mesh.polys[base + j];
                    if va_idx == MESH_NULL_IDX {
                        break;
                    }
                    if mesh.polys[base + nvp + j] != MESH_NULL_IDX {
                        continue;
                    }
                    let mut nj = j + 1;
                    if nj >= nvp || mesh.polys[base + nj] == MESH_NULL_IDX {
                        nj = 0;
                    }
                    let va = mesh.verts[va_idx as usize];
                    let vb = mesh.verts[mesh.polys[base + nj] as usize];

                    let side = if va[0] == 0 && vb[0] == 0 {
                        Some(0)
                    } else if va[2] == h && vb[2] == h {
                        Some(1)
                    } else if va[0] == w && vb[0] == w {
                        Some(2)
                    } else if va[2] == 0 && vb[2] == 0 {
                        Some(3)
                    } else {
                        None
                    };
                    if let Some(side) = side {
                        mesh.polys[base + nvp + j] = 0x8000 | side;
                    }
                }
            }
        }

        mesh.flags = vec![0; mesh.npolys];

        if mesh.verts.len() > 0xffff {
            ctx.stop_timer(TimerCategory::PolyMesh);
            return Err(Error::NavMeshGeneration(format!(
                "Too many vertices {} (max: {})",
                mesh.verts.len(),
                0xffff
            )));
        }

        ctx.stop_timer(TimerCategory::PolyMesh);
        Ok(mesh)
    }

    /// Whether the mesh has no polygons
    pub fn is_empty(&self) -> bool {
        self.npolys == 0
    }

    /// World position of vertex `i`
    pub fn world_vertex(&self, i: usize) -> Vec3 {
        let v = self.verts[i];
        Vec3::new(
            self.bmin.x + v[0] as f32 * self.cs,
            self.bmin.y + v[1] as f32 * self.ch,
            self.bmin.z + v[2] as f32 * self.cs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::{area2, Contour};

    fn contour_set(contours: Vec<Contour>, width: i32, height: i32, border_size: i32) -> ContourSet {
        ContourSet {
            contours,
            width,
            height,
            bmin: Vec3::ZERO,
            bmax: Vec3::new(width as f32, 10.0, height as f32),
            cs: 1.0,
            ch: 1.0,
            border_size,
            max_error: 1.3,
        }
    }

    fn square(x0: i32, z0: i32, x1: i32, z1: i32, reg: u16) -> Contour {
        Contour {
            verts: vec![[x0, 0, z1, 0], [x1, 0, z1, 0], [x1, 0, z0, 0], [x0, 0, z0, 0]],
            reg,
            area: 63,
        }
    }

    #[test]
    fn test_triangulate_square() {
        let verts = vec![[0, 0, 4, 0], [4, 0, 4, 0], [4, 0, 0, 0], [0, 0, 0, 0]];
        let mut indices: Vec<u32> = (0..4).collect();
        let mut tris = Vec::new();
        assert!(triangulate(&verts, &mut indices, &mut tris));
        assert_eq!(tris.len(), 2);
        for t in &tris {
            let a = &verts[t[0] as usize];
            let b = &verts[t[1] as usize];
            let c = &verts[t[2] as usize];
            assert!(area2(a, b, c) != 0);
        }
    }

    #[test]
    fn test_triangulate_concave_outline() {
        // L shape
        let verts = vec![
            [0, 0, 4, 0],
            [2, 0, 4, 0],
            [2, 0, 2, 0],
            [4, 0, 2, 0],
            [4, 0, 0, 0],
            [0, 0, 0, 0],
        ];
        let mut indices: Vec<u32> = (0..6).collect();
        let mut tris = Vec::new();
        assert!(triangulate(&verts, &mut indices, &mut tris));
        assert_eq!(tris.len(), 4);
    }

    #[test]
    fn test_square_contour_becomes_single_quad() {
        let cset = contour_set(vec![square(0, 0, 4, 4, 1)], 4, 4, 0);
        let mesh = PolyMesh::build(&mut BuildContext::new(), &cset, 6).unwrap();
        assert_eq!(mesh.npolys, 1);
        assert_eq!(mesh.poly(0).len(), 4);
        assert_eq!(mesh.verts.len(), 4);
        assert_eq!(mesh.regs, vec![1]);
        assert!(mesh.neighbours(0).iter().all(|&n| n == MESH_NULL_IDX));
    }

    #[test]
    fn test_triangles_only_when_nvp_is_three() {
        let cset = contour_set(vec![square(0, 0, 4, 4, 1)], 4, 4, 0);
        let mesh = PolyMesh::build(&mut BuildContext::new(), &cset, 3).unwrap();
        assert_eq!(mesh.npolys, 2);
        // The two triangles are adjacent
        assert!(mesh.neighbours(0).contains(&1));
        assert!(mesh.neighbours(1).contains(&0));
    }

    #[test]
    fn test_adjacent_regions_share_vertices_and_link() {
        let cset = contour_set(vec![square(0, 0, 4, 4, 1), square(4, 0, 8, 4, 2)], 8, 4, 0);
        let mesh = PolyMesh::build(&mut BuildContext::new(), &cset, 6).unwrap();
        assert_eq!(mesh.npolys, 2);
        assert_eq!(mesh.verts.len(), 6);
        assert!(mesh.neighbours(0).contains(&1));
        assert!(mesh.neighbours(1).contains(&0));
    }

    #[test]
    fn test_portal_edges_on_tile_border() {
        let cset = contour_set(vec![square(0, 0, 4, 4, 1)], 4, 4, 2);
        let mesh = PolyMesh::build(&mut BuildContext::new(), &cset, 6).unwrap();
        let mut sides: Vec<u16> = mesh.neighbours(0)[..4].iter().map(|&n| n & 0x7fff).collect();
        assert!(mesh.neighbours(0)[..4].iter().all(|&n| n & 0x8000 != 0));
        sides.sort();
        assert_eq!(sides, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_merge_value_requires_shared_edge() {
        let verts = vec![[0, 0, 0], [1, 0, 0], [1, 0, 1], [0, 0, 1], [5, 0, 5], [6, 0, 5], [6, 0, 6]];
        let pa = [0u16, 3, 2, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX];
        let pb = [0u16, 2, 1, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX];
        let pc = [4u16, 6, 5, MESH_NULL_IDX, MESH_NULL_IDX, MESH_NULL_IDX];
        assert!(get_poly_merge_value(&pa, &pb, &verts, 6).is_some());
        assert!(get_poly_merge_value(&pa, &pc, &verts, 6).is_none());
    }
}
