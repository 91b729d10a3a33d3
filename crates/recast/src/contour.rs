//! Contour generation for Recast
//!
//! Traces the outline of every region in the compact heightfield, simplifies it with
//! a Douglas-Peucker style pass bounded by the maximum edge error, and splits long
//! wall edges. Holes are stitched into their region's outline so that every region
//! ends up with exactly one simple polygon.

use glam::Vec3;

use navkit_common::{Error, Result};

use crate::compact_heightfield::CompactHeightfield;
use crate::context::{BuildContext, TimerCategory};
use crate::{
    RC_AREA_BORDER, RC_BORDER_REG, RC_BORDER_VERTEX, RC_CONTOUR_REG_MASK, RC_NOT_CONNECTED,
};

/// Build flags for contour generation
#[derive(Debug, Clone, Copy)]
pub struct BuildContoursFlags {
    /// Whether to tessellate solid (impassable) edges during contour simplification
    pub tess_wall_edges: bool,
    /// Whether to tessellate edges between areas during contour simplification
    pub tess_area_edges: bool,
}

impl Default for BuildContoursFlags {
    fn default() -> Self {
        Self {
            tess_wall_edges: true,
            tess_area_edges: false,
        }
    }
}

/// Simplified outline of one region.
///
/// Vertices are `[x, y, z, flags]` in cells, relative to the unpadded tile origin.
/// The low 16 bits of `flags` hold the region on the other side of the edge starting at
/// the vertex; `RC_BORDER_VERTEX` and `RC_AREA_BORDER` mark tile border vertices and
/// edges between areas.
#[derive(Debug, Clone, Default)]
pub struct Contour {
    pub verts: Vec<[i32; 4]>,
    /// Region id
    pub reg: u16,
    /// Area id
    pub area: u8,
}

/// A set of contours
#[derive(Debug, Clone)]
pub struct ContourSet {
    /// Contours in the set
    pub contours: Vec<Contour>,
    /// Width without the border
    pub width: i32,
    /// Height without the border
    pub height: i32,
    /// The minimum bounds, without the border
    pub bmin: Vec3,
    /// The maximum bounds, without the border
    pub bmax: Vec3,
    /// Cell size (horizontal resolution)
    pub cs: f32,
    /// Cell height (vertical resolution)
    pub ch: f32,
    /// Border size used during generation
    pub border_size: i32,
    /// Maximum edge error during simplification
    pub max_error: f32,
}

// Integer geometry on the xz plane, shared with the polygon mesh triangulation

#[inline]
pub(crate) fn area2(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> i32 {
    (b[0] - a[0]) * (c[2] - a[2]) - (c[0] - a[0]) * (b[2] - a[2])
}

#[inline]
pub(crate) fn left(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) < 0
}

#[inline]
pub(crate) fn left_on(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
pub(crate) fn collinear(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    area2(a, b, c) == 0
}

#[inline]
pub(crate) fn vequal(a: &[i32; 4], b: &[i32; 4]) -> bool {
    a[0] == b[0] && a[2] == b[2]
}

/// Proper intersection: the segments share a point interior to both
fn intersect_prop(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4], d: &[i32; 4]) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }
    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// `c` lies on the closed segment `ab`
fn between(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4]) -> bool {
    if !collinear(a, b, c) {
        return false;
    }
    if a[0] != b[0] {
        (a[0] <= c[0] && c[0] <= b[0]) || (a[0] >= c[0] && c[0] >= b[0])
    } else {
        (a[2] <= c[2] && c[2] <= b[2]) || (a[2] >= c[2] && c[2] >= b[2])
    }
}

pub(crate) fn intersect(a: &[i32; 4], b: &[i32; 4], c: &[i32; 4], d: &[i32; 4]) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

/// Twice the signed area of the outline; positive for outlines, negative for holes
fn calc_area_of_polygon_2d(verts: &[[i32; 4]]) -> i32 {
    let n = verts.len();
    let mut area = 0;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = &verts[i];
        let vj = &verts[j];
        area += vi[0] * vj[2] - vj[0] * vi[2];
        j = i;
    }
    (area + 1) / 2
}

fn distance_pt_seg(x: i32, z: i32, px: i32, pz: i32, qx: i32, qz: i32) -> f32 {
    let pqx = (qx - px) as f32;
    let pqz = (qz - pz) as f32;
    let dx = (x - px) as f32;
    let dz = (z - pz) as f32;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = px as f32 + t * pqx - x as f32;
    let dz = pz as f32 + t * pqz - z as f32;
    dx * dx + dz * dz
}

/// Height of the corner at the start of edge `dir`, and whether the vertex lies on the
/// tile border between two border cells and two interior cells of the same area
fn get_corner_height(chf: &CompactHeightfield, x: i32, z: i32, i: usize, dir: usize) -> (i32, bool) {
    let s = chf.spans[i];
    let mut ch = s.y as i32;
    let dirp = (dir + 1) & 3;

    let tag = |idx: usize| chf.spans[idx].reg as u32 | ((chf.areas[idx] as u32) << 16);
    let mut regs = [0u32; 4];
    regs[0] = tag(i);

    if let Some((ax, az, ai)) = chf.neighbour(x, z, i, dir) {
        ch = ch.max(chf.spans[ai].y as i32);
        regs[1] = tag(ai);
        if let Some((_, _, ai2)) = chf.neighbour(ax, az, ai, dirp) {
            ch = ch.max(chf.spans[ai2].y as i32);
            regs[2] = tag(ai2);
        }
    }
    if let Some((ax, az, ai)) = chf.neighbour(x, z, i, dirp) {
        ch = ch.max(chf.spans[ai].y as i32);
        regs[3] = tag(ai);
        if let Some((_, _, ai2)) = chf.neighbour(ax, az, ai, dir) {
            ch = ch.max(chf.spans[ai2].y as i32);
            regs[2] = tag(ai2);
        }
    }

    let border = RC_BORDER_REG as u32;
    let mut is_border_vertex = false;
    for j in 0..4 {
        let a = j;
        let b = (j + 1) & 3;
        let c = (j + 2) & 3;
        let d = (j + 3) & 3;

        // Two same exterior cells in a row followed by two interior cells of one area
        let two_same_exts = (regs[a] & regs[b] & border) != 0 && regs[a] == regs[b];
        let two_ints = ((regs[c] | regs[d]) & border) == 0;
        let ints_same_area = (regs[c] >> 16) == (regs[d] >> 16);
        let no_zeros = regs.iter().all(|&r| r != 0);
        if two_same_exts && two_ints && ints_same_area && no_zeros {
            is_border_vertex = true;
            break;
        }
    }

    (ch, is_border_vertex)
}

/// Walks the boundary edges flagged in `flags` and returns the raw outline
fn walk_contour(
    chf: &CompactHeightfield,
    mut x: i32,
    mut z: i32,
    mut i: usize,
    flags: &mut [u8],
    points: &mut Vec<[i32; 4]>,
) {
    let mut dir = 0;
    while flags[i] & (1 << dir) == 0 {
        dir += 1;
    }

    let start_dir = dir;
    let start_i = i;
    let area = chf.areas[i];

    for _ in 0..40000 {
        if flags[i] & (1 << dir) != 0 {
            let (py, is_border_vertex) = get_corner_height(chf, x, z, i, dir);
            let (mut px, mut pz) = (x, z);
            match dir {
                0 => pz += 1,
                1 => {
                    px += 1;
                    pz += 1;
                }
                2 => px += 1,
                _ => {}
            }

            let mut r = 0i32;
            if let Some((_, _, ai)) = chf.neighbour(x, z, i, dir) {
                r = chf.spans[ai].reg as i32;
                if area != chf.areas[ai] {
                    r |= RC_AREA_BORDER;
                }
            }
            if is_border_vertex {
                r |= RC_BORDER_VERTEX;
            }
            points.push([px, py, pz, r]);

            // Remove visited edge and rotate clockwise
            flags[i] &= !(1 << dir);
            dir = (dir + 1) & 3;
        } else {
            let Some((nx, nz, ni)) = chf.neighbour(x, z, i, dir) else {
                return;
            };
            x = nx;
            z = nz;
            i = ni;
            // Rotate counter-clockwise
            dir = (dir + 3) & 3;
        }

        if start_i == i && start_dir == dir {
            break;
        }
    }
}

/// Simplifies a raw outline. The fourth component of each simplified vertex holds
/// the vertex flags and the neighbouring region of the edge starting there.
fn simplify_contour(
    points: &[[i32; 4]],
    simplified: &mut Vec<[i32; 4]>,
    max_error: f32,
    max_edge_len: i32,
    flags: BuildContoursFlags,
) {
    let pn = points.len();
    let reg_of = |p: &[i32; 4]| p[3] & RC_CONTOUR_REG_MASK;

    // Edges between regions or areas are fixed
    let has_connections = points.iter().any(|p| reg_of(p) != 0);
    if has_connections {
        for i in 0..pn {
            let ii = (i + 1) % pn;
            let different_regs = reg_of(&points[i]) != reg_of(&points[ii]);
            let area_borders = (points[i][3] & RC_AREA_BORDER) != (points[ii][3] & RC_AREA_BORDER);
            if different_regs || area_borders {
                let p = points[i];
                simplified.push([p[0], p[1], p[2], i as i32]);
            }
        }
    }

    if simplified.is_empty() {
        // No connections: seed with the lower-left and upper-right vertices
        let (mut ll, mut lli) = (points[0], 0);
        let (mut ur, mut uri) = (points[0], 0);
        for (i, p) in points.iter().enumerate() {
            if p[0] < ll[0] || (p[0] == ll[0] && p[2] < ll[2]) {
                ll = *p;
                lli = i;
            }
            if p[0] > ur[0] || (p[0] == ur[0] && p[2] > ur[2]) {
                ur = *p;
                uri = i;
            }
        }
        simplified.push([ll[0], ll[1], ll[2], lli as i32]);
        simplified.push([ur[0], ur[1], ur[2], uri as i32]);
    }

    // Add points until every raw point is within the error tolerance
    let max_error_sqr = max_error * max_error;
    let mut i = 0;
    while i < simplified.len() {
        let ii = (i + 1) % simplified.len();
        let [mut ax, _, mut az, ai] = simplified[i];
        let [mut bx, _, mut bz, bi] = simplified[ii];
        let (ai, bi) = (ai as usize, bi as usize);

        // Traverse the segment in lexicographic order so opposite segments match
        let (cinc, mut ci, endi) = if bx > ax || (bx == ax && bz > az) {
            (1, (ai + 1) % pn, bi)
        } else {
            std::mem::swap(&mut ax, &mut bx);
            std::mem::swap(&mut az, &mut bz);
            (pn - 1, (bi + pn - 1) % pn, ai)
        };

        let mut maxd = 0.0;
        let mut maxi = None;
        // Tessellate only outer edges or edges between areas
        if reg_of(&points[ci]) == 0 || points[ci][3] & RC_AREA_BORDER != 0 {
            while ci != endi {
                let d = distance_pt_seg(points[ci][0], points[ci][2], ax, az, bx, bz);
                if d > maxd {
                    maxd = d;
                    maxi = Some(ci);
                }
                ci = (ci + cinc) % pn;
            }
        }

        match maxi {
            Some(m) if maxd > max_error_sqr => {
                let p = points[m];
                simplified.insert(i + 1, [p[0], p[1], p[2], m as i32]);
            }
            _ => i += 1,
        }
    }

    // Split too long edges
    if max_edge_len > 0 && (flags.tess_wall_edges || flags.tess_area_edges) {
        let mut i = 0;
        while i < simplified.len() {
            let ii = (i + 1) % simplified.len();
            let [ax, _, az, ai] = simplified[i];
            let [bx, _, bz, bi] = simplified[ii];
            let (ai, bi) = (ai as usize, bi as usize);

            let ci = (ai + 1) % pn;
            let tess = (flags.tess_wall_edges && reg_of(&points[ci]) == 0)
                || (flags.tess_area_edges && points[ci][3] & RC_AREA_BORDER != 0);

            let mut maxi = None;
            if tess {
                let dx = bx - ax;
                let dz = bz - az;
                if dx * dx + dz * dz > max_edge_len * max_edge_len {
                    // Round based on the segment's lexicographic order
                    let n = if bi < ai { bi + pn - ai } else { bi - ai };
                    if n > 1 {
                        maxi = Some(if bx > ax || (bx == ax && bz > az) {
                            (ai + n / 2) % pn
                        } else {
                            (ai + (n + 1) / 2) % pn
                        });
                    }
                }
            }

            match maxi {
                Some(m) => {
                    let p = points[m];
                    simplified.insert(i + 1, [p[0], p[1], p[2], m as i32]);
                }
                None => i += 1,
            }
        }
    }

    for v in simplified.iter_mut() {
        // Edge vertex flag from the current raw point, neighbour region from the next
        let ai = (v[3] as usize + 1) % pn;
        let bi = v[3] as usize;
        v[3] = (points[ai][3] & (RC_CONTOUR_REG_MASK | RC_AREA_BORDER)) | (points[bi][3] & RC_BORDER_VERTEX);
    }
}

/// Removes zero length segments left over by simplification
fn remove_degenerate_segments(simplified: &mut Vec<[i32; 4]>) {
    let mut npts = simplified.len();
    let mut i = 0;
    while i < npts {
        let ni = (i + 1) % npts;
        if vequal(&simplified[i], &simplified[ni]) {
            simplified.remove(i);
            npts -= 1;
        }
        i += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct ContourHole {
    contour: usize,
    minx: i32,
    minz: i32,
    leftmost: usize,
}

#[derive(Debug, Default)]
struct ContourRegion {
    outline: Option<usize>,
    holes: Vec<ContourHole>,
}

fn find_left_most_vertex(contour: &Contour) -> (i32, i32, usize) {
    let mut minx = contour.verts[0][0];
    let mut minz = contour.verts[0][2];
    let mut leftmost = 0;
    for (i, v) in contour.verts.iter().enumerate().skip(1) {
        if v[0] < minx || (v[0] == minx && v[2] < minz) {
            minx = v[0];
            minz = v[2];
            leftmost = i;
        }
    }
    (minx, minz, leftmost)
}

/// `pj` lies inside the cone formed by the vertex `i` and its two neighbours
fn in_cone(i: usize, verts: &[[i32; 4]], pj: &[i32; 4]) -> bool {
    let n = verts.len();
    let pi = &verts[i];
    let pi1 = &verts[(i + 1) % n];
    let pin1 = &verts[(i + n - 1) % n];

    // Convex vertex: pi1 left of or on (pin1, pi)
    if left_on(pin1, pi, pi1) {
        return left(pi, pj, pin1) && left(pj, pi, pi1);
    }
    // Reflex vertex
    !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
}

/// Segment `d0 d1` crosses an edge of `verts`, ignoring edges incident to vertex `skip`
fn intersect_seg_contour(d0: &[i32; 4], d1: &[i32; 4], skip: Option<usize>, verts: &[[i32; 4]]) -> bool {
    let n = verts.len();
    for k in 0..n {
        let k1 = (k + 1) % n;
        if skip == Some(k) || skip == Some(k1) {
            continue;
        }
        let p0 = &verts[k];
        let p1 = &verts[k1];
        if vequal(d0, p0) || vequal(d1, p0) || vequal(d0, p1) || vequal(d1, p1) {
            continue;
        }
        if intersect(d0, d1, p0, p1) {
            return true;
        }
    }
    false
}

/// Splices contour `b` into contour `a` through the diagonal `a[ia]`-`b[ib]`
fn merge_contours(contours: &mut [Contour], a: usize, b: usize, ia: usize, ib: usize) {
    let cb = std::mem::take(&mut contours[b].verts);
    let ca = &mut contours[a];
    let na = ca.verts.len();
    let nb = cb.len();

    let mut verts = Vec::with_capacity(na + nb + 2);
    for i in 0..=na {
        verts.push(ca.verts[(ia + i) % na]);
    }
    for i in 0..=nb {
        verts.push(cb[(ib + i) % nb]);
    }
    ca.verts = verts;
}

fn merge_region_holes(ctx: &BuildContext, region: &mut ContourRegion, contours: &mut [Contour]) {
    let Some(outline) = region.outline else {
        return;
    };

    for hole in region.holes.iter_mut() {
        let (minx, minz, leftmost) = find_left_most_vertex(&contours[hole.contour]);
        hole.minx = minx;
        hole.minz = minz;
        hole.leftmost = leftmost;
    }
    region.holes.sort_by(|a, b| a.minx.cmp(&b.minx).then(a.minz.cmp(&b.minz)));

    let mut diags: Vec<(usize, i32)> = Vec::new();
    for h in 0..region.holes.len() {
        let hole = region.holes[h].contour;
        let hole_len = contours[hole].verts.len();
        let mut best_vertex = region.holes[h].leftmost;
        let mut index = None;

        for _ in 0..hole_len {
            // Diagonals must be in front of the hole vertex and not cross the outline
            diags.clear();
            let corner = contours[hole].verts[best_vertex];
            let outline_verts = &contours[outline].verts;
            for (j, v) in outline_verts.iter().enumerate() {
                if in_cone(j, outline_verts, &corner) {
                    let dx = v[0] - corner[0];
                    let dz = v[2] - corner[2];
                    diags.push((j, dx * dx + dz * dz));
                }
            }
            diags.sort_by_key(|&(_, d)| d);

            // Pick the shortest diagonal not crossing the outline or remaining holes
            for &(vert, _) in &diags {
                let pt = contours[outline].verts[vert];
                let mut crosses = intersect_seg_contour(&pt, &corner, Some(vert), &contours[outline].verts);
                for later in &region.holes[h..] {
                    if crosses {
                        break;
                    }
                    crosses |= intersect_seg_contour(&pt, &corner, None, &contours[later.contour].verts);
                }
                if !crosses {
                    index = Some(vert);
                    break;
                }
            }

            if index.is_some() {
                break;
            }
            // Every diagonal crosses something, try the next hole vertex
            best_vertex = (best_vertex + 1) % hole_len;
        }

        let Some(index) = index else {
            ctx.log_warning(format!(
                "Failed to find merge points for region {}",
                contours[outline].reg
            ));
            continue;
        };
        merge_contours(contours, outline, hole, index, best_vertex);
    }
}

impl ContourSet {
    /// Builds contours from a compact heightfield whose regions have been built
    pub fn build(
        ctx: &mut BuildContext,
        chf: &CompactHeightfield,
        max_error: f32,
        max_edge_len: i32,
        flags: BuildContoursFlags,
    ) -> Result<Self> {
        ctx.start_timer(TimerCategory::Contours);

        let w = chf.width;
        let h = chf.height;
        let border_size = chf.border_size;

        let mut bmin = chf.bmin;
        let mut bmax = chf.bmax;
        if border_size > 0 {
            // Remove the border from the bounds
            let pad = border_size as f32 * chf.cs;
            bmin.x += pad;
            bmin.z += pad;
            bmax.x -= pad;
            bmax.z -= pad;
        }

        let mut cset = ContourSet {
            contours: Vec::new(),
            width: w - border_size * 2,
            height: h - border_size * 2,
            bmin,
            bmax,
            cs: chf.cs,
            ch: chf.ch,
            border_size,
            max_error,
        };

        // Mark the edges of each span that do not lead to the same region
        let mut flags_per_span = vec![0u8; chf.spans.len()];
        for z in 0..h {
            for x in 0..w {
                for i in chf.cell(x, z).spans() {
                    let s = chf.spans[i];
                    if s.reg == 0 || s.reg & RC_BORDER_REG != 0 {
                        continue;
                    }
                    let mut res = 0u8;
                    for dir in 0..4 {
                        if s.get_con(dir) == RC_NOT_CONNECTED {
                            continue;
                        }
                        if let Some((_, _, ai)) = chf.neighbour(x, z, i, dir) {
                            if chf.spans[ai].reg == s.reg {
                                res |= 1 << dir;
                            }
                        }
                    }
                    flags_per_span[i] = res ^ 0xf;
                }
            }
        }

        ctx.check_cancelled()?;

        let mut verts: Vec<[i32; 4]> = Vec::with_capacity(256);
        let mut simplified: Vec<[i32; 4]> = Vec::with_capacity(64);
        for z in 0..h {
            for x in 0..w {
                for i in chf.cell(x, z).spans() {
                    if flags_per_span[i] == 0 || flags_per_span[i] == 0xf {
                        flags_per_span[i] = 0;
                        continue;
                    }
                    let reg = chf.spans[i].reg;
                    if reg == 0 || reg & RC_BORDER_REG != 0 {
                        continue;
                    }

                    verts.clear();
                    simplified.clear();
                    walk_contour(chf, x, z, i, &mut flags_per_span, &mut verts);
                    simplify_contour(&verts, &mut simplified, max_error, max_edge_len, flags);
                    remove_degenerate_segments(&mut simplified);

                    if simplified.len() >= 3 {
                        let mut contour = Contour {
                            verts: simplified.clone(),
                            reg,
                            area: chf.areas[i],
                        };
                        if border_size > 0 {
                            for v in &mut contour.verts {
                                v[0] -= border_size;
                                v[2] -= border_size;
                            }
                        }
                        cset.contours.push(contour);
                    }
                }
            }
        }

        // Merge holes into their region outline
        let winding: Vec<i32> = cset
            .contours
            .iter()
            .map(|c| if calc_area_of_polygon_2d(&c.verts) < 0 { -1 } else { 1 })
            .collect();
        if winding.iter().any(|&w| w < 0) {
            let mut regions: Vec<ContourRegion> = (0..chf.max_regions as usize + 1)
                .map(|_| ContourRegion::default())
                .collect();

            for (i, contour) in cset.contours.iter().enumerate() {
                let Some(region) = regions.get_mut(contour.reg as usize) else {
                    continue;
                };
                if winding[i] > 0 {
                    if region.outline.is_some() {
                        ctx.stop_timer(TimerCategory::Contours);
                        return Err(Error::NavMeshGeneration(format!(
                            "Multiple outlines for region {}",
                            contour.reg
                        )));
                    }
                    region.outline = Some(i);
                } else {
                    region.holes.push(ContourHole {
                        contour: i,
                        minx: 0,
                        minz: 0,
                        leftmost: 0,
                    });
                }
            }

            for (reg, region) in regions.iter_mut().enumerate() {
                if region.holes.is_empty() {
                    continue;
                }
                if region.outline.is_some() {
                    merge_region_holes(ctx, region, &mut cset.contours);
                } else {
                    // The region is all holes; happens when the outline was simplified away
                    ctx.log_warning(format!("Missing outline for region {}", reg));
                }
            }

            cset.contours.retain(|c| !c.verts.is_empty());
        }

        ctx.stop_timer(TimerCategory::Contours);
        Ok(cset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance_field::build_distance_field;
    use crate::heightfield::Heightfield;
    use crate::region::build_regions_watershed;
    use crate::{RC_NULL_AREA, RC_WALKABLE_AREA};

    fn regions_for(w: i32, h: i32, walkable: impl Fn(i32, i32) -> bool, border: i32) -> CompactHeightfield {
        let mut hf = Heightfield::new(w, h, Vec3::ZERO, Vec3::new(w as f32, 10.0, h as f32), 1.0, 0.5);
        for z in 0..h {
            for x in 0..w {
                let area = if walkable(x, z) { RC_WALKABLE_AREA } else { RC_NULL_AREA };
                hf.add_span(x, z, 0, 2, area, 1).unwrap();
            }
        }
        let mut ctx = BuildContext::new();
        let mut chf = CompactHeightfield::build(&mut ctx, 4, 1, &hf).unwrap();
        build_distance_field(&mut ctx, &mut chf).unwrap();
        build_regions_watershed(&mut ctx, &mut chf, border, 1, 0).unwrap();
        chf
    }

    #[test]
    fn test_polygon_area_winding() {
        let outline = [[0, 0, 2, 0], [2, 0, 2, 0], [2, 0, 0, 0], [0, 0, 0, 0]];
        assert_eq!(calc_area_of_polygon_2d(&outline), 4);
        let mut hole = outline;
        hole.reverse();
        assert!(calc_area_of_polygon_2d(&hole) < 0);
        // Rounding of a unit square's half area
        assert_eq!(calc_area_of_polygon_2d(&[[0, 0, 1, 0], [1, 0, 1, 0], [1, 0, 0, 0], [0, 0, 0, 0]]), 1);
    }

    #[test]
    fn test_square_region_simplifies_to_four_corners() {
        let chf = regions_for(8, 8, |_, _| true, 0);
        let cset = ContourSet::build(&mut BuildContext::new(), &chf, 1.3, 0, BuildContoursFlags::default()).unwrap();
        assert_eq!(cset.contours.len(), 1);
        let contour = &cset.contours[0];
        let mut corners: Vec<(i32, i32)> = contour.verts.iter().map(|v| (v[0], v[2])).collect();
        corners.sort();
        assert_eq!(corners, vec![(0, 0), (0, 8), (8, 0), (8, 8)]);
        assert!(calc_area_of_polygon_2d(&contour.verts) > 0);
    }

    #[test]
    fn test_long_wall_edges_are_split() {
        let chf = regions_for(16, 4, |_, _| true, 0);
        let cset = ContourSet::build(&mut BuildContext::new(), &chf, 1.3, 4, BuildContoursFlags::default()).unwrap();
        let contour = &cset.contours[0];
        let n = contour.verts.len();
        for i in 0..n {
            let a = contour.verts[i];
            let b = contour.verts[(i + 1) % n];
            let (dx, dz) = (b[0] - a[0], b[2] - a[2]);
            assert!(dx * dx + dz * dz <= 16, "edge {:?} -> {:?}", a, b);
        }
    }

    #[test]
    fn test_hole_is_merged_into_outline() {
        // Ring shaped walkable area around a blocked center
        let walkable = |x: i32, z: i32| !((4..8).contains(&x) && (4..8).contains(&z));
        let mut hf = Heightfield::new(12, 12, Vec3::ZERO, Vec3::new(12.0, 10.0, 12.0), 1.0, 0.5);
        for z in 0..12 {
            for x in 0..12 {
                let area = if walkable(x, z) { RC_WALKABLE_AREA } else { RC_NULL_AREA };
                hf.add_span(x, z, 0, 2, area, 1).unwrap();
            }
        }
        let mut ctx = BuildContext::new();
        let mut chf = CompactHeightfield::build(&mut ctx, 4, 1, &hf).unwrap();
        // One region wrapping around the blocked center
        for s in chf.spans.iter_mut() {
            s.reg = 1;
        }
        chf.max_regions = 1;

        let cset = ContourSet::build(&mut ctx, &chf, 1.3, 0, BuildContoursFlags::default()).unwrap();
        assert_eq!(cset.contours.len(), 1);
        let verts = &cset.contours[0].verts;
        // Outer square and hole square joined by a doubled diagonal
        assert_eq!(verts.len(), 4 + 4 + 2);
        for corner in [(0, 0), (12, 12), (4, 4), (8, 8)] {
            assert!(verts.iter().any(|v| (v[0], v[2]) == corner), "missing {:?}", corner);
        }
    }

    #[test]
    fn test_border_is_removed_from_vertices() {
        let chf = regions_for(12, 12, |_, _| true, 2);
        let cset = ContourSet::build(&mut BuildContext::new(), &chf, 1.3, 0, BuildContoursFlags::default()).unwrap();
        assert_eq!(cset.width, 8);
        assert_eq!(cset.bmin.x, 2.0);
        for c in &cset.contours {
            for v in &c.verts {
                assert!((0..=8).contains(&v[0]) && (0..=8).contains(&v[2]));
            }
        }
    }
}
