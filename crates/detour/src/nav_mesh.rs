//! Navigation mesh implementation
//!
//! A [`NavMesh`] owns a fixed number of tile slots. Tiles are addressed by their
//! grid location `(x, y, layer)`; adding a tile at an occupied location replaces
//! the old one. Every slot carries a salt that changes whenever its tile is
//! removed, so polygon references to a replaced tile stop resolving instead of
//! silently pointing into the new one.

use std::collections::HashMap;

use glam::Vec3;

use navkit_common::{closest_height_on_triangle, dist_pt_seg_sqr_2d, point_in_polygon_2d, Aabb, Result};

use crate::{
    NavMeshParams, PolyFlags, PolyRef, PolyType, QueryFilter, Status, DT_EXT_LINK, DT_LINK_INTERNAL,
    DT_OFFMESH_CON_BIDIR, MAX_VERTS_PER_POLY,
};

/// Number of bits for salt
const DT_SALT_BITS: u32 = 16;
/// Number of bits for tile slot
const DT_TILE_BITS: u32 = 28;
/// Number of bits for polygon index
const DT_POLY_BITS: u32 = 20;

const DT_SALT_MASK: u64 = (1 << DT_SALT_BITS) - 1;
const DT_TILE_MASK: u64 = (1 << DT_TILE_BITS) - 1;
const DT_POLY_MASK: u64 = (1 << DT_POLY_BITS) - 1;

/// Creates a PolyRef from salt, tile slot and polygon index
#[inline]
pub fn encode_poly_ref(salt: u32, tile: u32, poly: u32) -> PolyRef {
    PolyRef::new(
        ((salt as u64 & DT_SALT_MASK) << (DT_POLY_BITS + DT_TILE_BITS))
            | ((tile as u64 & DT_TILE_MASK) << DT_POLY_BITS)
            | (poly as u64 & DT_POLY_MASK),
    )
}

/// Decodes a PolyRef into salt, tile slot and polygon index
#[inline]
pub fn decode_poly_ref(reference: PolyRef) -> (u32, u32, u32) {
    let id = reference.id();
    (
        ((id >> (DT_POLY_BITS + DT_TILE_BITS)) & DT_SALT_MASK) as u32,
        ((id >> DT_POLY_BITS) & DT_TILE_MASK) as u32,
        (id & DT_POLY_MASK) as u32,
    )
}

/// Grid offset of the neighbouring tile on `side` (0 = +x, 2 = +z, 4 = -x, 6 = -z)
fn neighbour_tile(x: i32, y: i32, side: u8) -> (i32, i32) {
    match side & 7 {
        0 => (x + 1, y),
        1 => (x + 1, y + 1),
        2 => (x, y + 1),
        3 => (x - 1, y + 1),
        4 => (x - 1, y),
        5 => (x - 1, y - 1),
        6 => (x, y - 1),
        _ => (x + 1, y - 1),
    }
}

#[inline]
pub(crate) fn opposite_side(side: u8) -> u8 {
    (side + 4) & 7
}

/// Link between two polygons
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Link {
    /// Reference to the connected polygon
    pub reference: PolyRef,
    /// Edge of the owning polygon the link leaves through
    pub edge: u8,
    /// Tile side of portal links, [`DT_LINK_INTERNAL`] otherwise
    pub side: u8,
    /// Portal sub-range along the edge, 0..=255
    pub bmin: u8,
    pub bmax: u8,
}

/// Polygon in the navigation mesh
#[derive(Debug, Clone, PartialEq)]
pub struct Poly {
    /// Indices into the tile vertices
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Per edge: 0 for a wall, `1 + index` for a polygon of the same tile,
    /// `DT_EXT_LINK | side` for a tile portal
    pub neis: [u16; MAX_VERTS_PER_POLY],
    pub flags: PolyFlags,
    pub vert_count: u8,
    pub area: u8,
    pub poly_type: PolyType,
    /// Links built when the tile is added to a mesh
    pub links: Vec<Link>,
}

impl Poly {
    pub fn new(area: u8, poly_type: PolyType, flags: PolyFlags) -> Self {
        Self {
            verts: [0; MAX_VERTS_PER_POLY],
            neis: [0; MAX_VERTS_PER_POLY],
            flags,
            vert_count: 0,
            area,
            poly_type,
            links: Vec::new(),
        }
    }

    /// Vertex indices actually used
    pub fn vertex_indices(&self) -> &[u16] {
        &self.verts[..self.vert_count as usize]
    }
}

/// Detail sub-mesh of one polygon
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PolyDetail {
    /// First detail vertex, the polygon corners are not repeated
    pub vert_base: u32,
    pub tri_base: u32,
    pub vert_count: u8,
    pub tri_count: u8,
}

/// Bounding volume node with bounds quantized to the tile
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BVNode {
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    /// Polygon index for leaves, negated escape offset for inner nodes
    pub i: i32,
}

/// Off-mesh connection stored in the tile holding its start point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffMeshConnection {
    pub start: Vec3,
    pub end: Vec3,
    pub radius: f32,
    /// Index of the connection polygon in the tile
    pub poly: u16,
    /// [`DT_OFFMESH_CON_BIDIR`] when traversable both ways
    pub flags: u8,
    /// Tile side the end point lies beyond, 0xff when inside the tile
    pub side: u8,
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn is_bidirectional(&self) -> bool {
        self.flags & DT_OFFMESH_CON_BIDIR != 0
    }
}

/// Tile header information
#[derive(Debug, Clone, PartialEq)]
pub struct TileHeader {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    /// Scale from tile-relative world units to BV tree units
    pub bv_quant_factor: f32,
    /// Index of the first off-mesh connection polygon
    pub off_mesh_base: usize,
}

impl TileHeader {
    pub fn new(x: i32, y: i32, layer: i32) -> Self {
        Self {
            x,
            y,
            layer,
            user_id: 0,
            bmin: Vec3::ZERO,
            bmax: Vec3::ZERO,
            walkable_height: 0.0,
            walkable_radius: 0.0,
            walkable_climb: 0.0,
            bv_quant_factor: 0.0,
            off_mesh_base: 0,
        }
    }
}

/// Mesh tile in the navigation mesh
#[derive(Debug, Clone, PartialEq)]
pub struct MeshTile {
    /// Salt of the slot the tile lives in
    pub salt: u32,
    pub header: TileHeader,
    pub verts: Vec<Vec3>,
    pub polys: Vec<Poly>,
    pub detail_meshes: Vec<PolyDetail>,
    pub detail_verts: Vec<Vec3>,
    /// Three vertex indices plus edge flags per triangle
    pub detail_tris: Vec<[u8; 4]>,
    pub bv_tree: Vec<BVNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
}

impl MeshTile {
    pub fn new(header: TileHeader) -> Self {
        Self {
            salt: 0,
            header,
            verts: Vec::new(),
            polys: Vec::new(),
            detail_meshes: Vec::new(),
            detail_verts: Vec::new(),
            detail_tris: Vec::new(),
            bv_tree: Vec::new(),
            off_mesh_cons: Vec::new(),
        }
    }

    /// Number of ground polygons, off-mesh connection polygons follow them
    pub fn ground_poly_count(&self) -> usize {
        self.header.off_mesh_base.min(self.polys.len())
    }

    /// Copies the corners of a polygon into `out`, returning how many there are
    pub fn poly_corners(&self, poly: &Poly, out: &mut [Vec3; MAX_VERTS_PER_POLY]) -> usize {
        let n = poly.vert_count as usize;
        for (slot, &v) in out.iter_mut().zip(poly.vertex_indices()) {
            *slot = self.verts[v as usize];
        }
        n
    }

    pub fn poly_center(&self, index: usize) -> Vec3 {
        let poly = &self.polys[index];
        let sum: Vec3 = poly.vertex_indices().iter().map(|&v| self.verts[v as usize]).sum();
        sum / poly.vert_count.max(1) as f32
    }

    pub fn poly_bounds(&self, index: usize) -> Aabb {
        Aabb::from_points(self.polys[index].vertex_indices().iter().map(|&v| &self.verts[v as usize]))
    }

    #[inline]
    fn detail_vertex(&self, poly: &Poly, detail: &PolyDetail, index: u8) -> Vec3 {
        if index < poly.vert_count {
            self.verts[poly.verts[index as usize] as usize]
        } else {
            self.detail_verts[(detail.vert_base + (index - poly.vert_count) as u32) as usize]
        }
    }

    /// Detail triangles of a ground polygon in world space
    pub fn detail_triangles(&self, index: usize) -> impl Iterator<Item = ([Vec3; 3], u8)> + '_ {
        let poly = &self.polys[index];
        let detail = self.detail_meshes.get(index).copied().unwrap_or_default();
        let tris = if index < self.detail_meshes.len() {
            &self.detail_tris[detail.tri_base as usize..(detail.tri_base + detail.tri_count as u32) as usize]
        } else {
            &self.detail_tris[..0]
        };
        tris.iter().map(move |t| {
            (
                [
                    self.detail_vertex(poly, &detail, t[0]),
                    self.detail_vertex(poly, &detail, t[1]),
                    self.detail_vertex(poly, &detail, t[2]),
                ],
                t[3],
            )
        })
    }

    /// Height of the polygon surface under `pos`, `None` when `pos` is outside it
    pub fn poly_height(&self, index: usize, pos: Vec3) -> Option<f32> {
        let poly = &self.polys[index];
        if poly.poly_type == PolyType::OffMeshConnection {
            return None;
        }
        let mut corners = [Vec3::ZERO; MAX_VERTS_PER_POLY];
        let n = self.poly_corners(poly, &mut corners);
        if !point_in_polygon_2d(pos, &corners[..n]) {
            return None;
        }

        if index < self.detail_meshes.len() {
            for ([a, b, c], _) in self.detail_triangles(index) {
                if let Some(h) = closest_height_on_triangle(pos, a, b, c) {
                    return Some(h);
                }
            }
        }
        for k in 1..n.saturating_sub(1) {
            if let Some(h) = closest_height_on_triangle(pos, corners[0], corners[k], corners[k + 1]) {
                return Some(h);
            }
        }
        // Inside by the crossing test but on an edge numerically
        Some(self.closest_point_on_boundary(index, pos).y)
    }

    fn closest_point_on_boundary(&self, index: usize, pos: Vec3) -> Vec3 {
        let mut best = (f32::MAX, pos);
        let mut consider = |a: Vec3, b: Vec3| {
            let (d, t) = dist_pt_seg_sqr_2d(pos, a, b);
            if d < best.0 {
                best = (d, a.lerp(b, t));
            }
        };

        if index < self.detail_meshes.len() && self.detail_meshes[index].tri_count > 0 {
            for (tri, flags) in self.detail_triangles(index) {
                for k in 0..3 {
                    if (flags >> (k * 2)) & 0x3 == 0 {
                        continue;
                    }
                    consider(tri[k], tri[(k + 1) % 3]);
                }
            }
        } else {
            let mut corners = [Vec3::ZERO; MAX_VERTS_PER_POLY];
            let n = self.poly_corners(&self.polys[index], &mut corners);
            for j in 0..n {
                consider(corners[j], corners[(j + 1) % n]);
            }
        }
        best.1
    }

    /// Closest point on a polygon and whether `pos` lies over it
    pub fn closest_point_on_poly(&self, index: usize, pos: Vec3) -> (Vec3, bool) {
        let poly = &self.polys[index];
        if poly.poly_type == PolyType::OffMeshConnection {
            let a = self.verts[poly.verts[0] as usize];
            let b = self.verts[poly.verts[1] as usize];
            let ab = b - a;
            let t = if ab.length_squared() > 0.0 {
                ((pos - a).dot(ab) / ab.length_squared()).clamp(0.0, 1.0)
            } else {
                0.0
            };
            return (a + ab * t, false);
        }
        match self.poly_height(index, pos) {
            Some(h) => (Vec3::new(pos.x, h, pos.z), true),
            None => (self.closest_point_on_boundary(index, pos), false),
        }
    }

    /// Ground polygons whose bounds overlap the query box
    pub fn polys_overlapping(&self, qmin: Vec3, qmax: Vec3, out: &mut Vec<usize>) {
        let ground = self.ground_poly_count();
        if self.bv_tree.is_empty() {
            let query = Aabb::new(qmin, qmax);
            out.extend((0..ground).filter(|&i| self.poly_bounds(i).overlaps(&query)));
            return;
        }

        let tbmin = self.header.bmin;
        let tbmax = self.header.bmax;
        let qfac = self.header.bv_quant_factor;
        let lo = (qmin.clamp(tbmin, tbmax) - tbmin) * qfac;
        let hi = (qmax.clamp(tbmin, tbmax) - tbmin) * qfac;
        let bmin = [lo.x as u16 & 0xfffe, lo.y as u16 & 0xfffe, lo.z as u16 & 0xfffe];
        let bmax = [
            (hi.x + 1.0) as u16 | 1,
            (hi.y + 1.0) as u16 | 1,
            (hi.z + 1.0) as u16 | 1,
        ];

        let mut i = 0usize;
        while i < self.bv_tree.len() {
            let node = &self.bv_tree[i];
            let overlap = (0..3).all(|k| bmin[k] <= node.bmax[k] && bmax[k] >= node.bmin[k]);
            let leaf = node.i >= 0;
            if leaf && overlap && (node.i as usize) < ground {
                out.push(node.i as usize);
            }
            if overlap || leaf {
                i += 1;
            } else {
                i += (-node.i) as usize;
            }
        }
    }

    /// Nearest ground polygon to `center` within the box of `half_extents`
    pub fn find_nearest_poly(&self, center: Vec3, half_extents: Vec3) -> Option<(usize, Vec3)> {
        let mut candidates = Vec::new();
        self.polys_overlapping(center - half_extents, center + half_extents, &mut candidates);

        let mut best: Option<(usize, Vec3, f32)> = None;
        for i in candidates {
            let (pt, over) = self.closest_point_on_poly(i, center);
            let d = if over {
                // Directly above, only the height above climb range counts
                let dy = (center.y - pt.y).abs() - self.header.walkable_climb;
                if dy > 0.0 {
                    dy * dy
                } else {
                    0.0
                }
            } else {
                center.distance_squared(pt)
            };
            if best.map_or(true, |(_, _, bd)| d < bd) {
                best = Some((i, pt, d));
            }
        }
        best.map(|(i, pt, _)| (i, pt))
    }
}

/// Slab coordinate of a portal vertex for a tile side
#[inline]
fn slab_coord(v: Vec3, side: u8) -> f32 {
    if side == 0 || side == 4 {
        v.x
    } else {
        v.z
    }
}

/// Portal edge end points as (along, height) pairs ordered along the edge
fn slab_end_points(va: Vec3, vb: Vec3, side: u8) -> ([f32; 2], [f32; 2]) {
    if side == 0 || side == 4 {
        if va.z < vb.z {
            ([va.z, va.y], [vb.z, vb.y])
        } else {
            ([vb.z, vb.y], [va.z, va.y])
        }
    } else if va.x < vb.x {
        ([va.x, va.y], [vb.x, vb.y])
    } else {
        ([vb.x, vb.y], [va.x, va.y])
    }
}

fn overlap_slabs(amin: [f32; 2], amax: [f32; 2], bmin: [f32; 2], bmax: [f32; 2], px: f32, py: f32) -> bool {
    // Horizontal overlap, shrunk by the tolerance
    let minx = (amin[0] + px).max(bmin[0] + px);
    let maxx = (amax[0] - px).min(bmax[0] - px);
    if minx > maxx {
        return false;
    }

    // Vertical overlap at the ends of the shared range
    let ad = (amax[1] - amin[1]) / (amax[0] - amin[0]);
    let ak = amin[1] - ad * amin[0];
    let bd = (bmax[1] - bmin[1]) / (bmax[0] - bmin[0]);
    let bk = bmin[1] - bd * bmin[0];
    let aminy = ad * minx + ak;
    let amaxy = ad * maxx + ak;
    let bminy = bd * minx + bk;
    let bmaxy = bd * maxx + bk;
    let dmin = bminy - aminy;
    let dmax = bmaxy - amaxy;

    // Crossing segments always overlap
    if dmin * dmax < 0.0 {
        return true;
    }
    let thr = (py * 2.0) * (py * 2.0);
    dmin * dmin <= thr || dmax * dmax <= thr
}

/// Polygons of `tile` with a portal on `side` matching the edge `va..vb`, as
/// `(poly index, range start, range end)` along the edge
fn find_connecting_polys(va: Vec3, vb: Vec3, tile: &MeshTile, side: u8) -> Vec<(usize, f32, f32)> {
    const MAX_CONNECTIONS: usize = 4;
    let (amin, amax) = slab_end_points(va, vb, side);
    let apos = slab_coord(va, side);
    let marker = DT_EXT_LINK | side as u16;

    let mut out = Vec::new();
    for (i, poly) in tile.polys.iter().enumerate().take(tile.ground_poly_count()) {
        let nv = poly.vert_count as usize;
        for j in 0..nv {
            if poly.neis[j] != marker {
                continue;
            }
            let vc = tile.verts[poly.verts[j] as usize];
            let vd = tile.verts[poly.verts[(j + 1) % nv] as usize];
            if (apos - slab_coord(vc, side)).abs() > 0.01 {
                continue;
            }
            let (bmin, bmax) = slab_end_points(vc, vd, side);
            if !overlap_slabs(amin, amax, bmin, bmax, 0.01, tile.header.walkable_climb) {
                continue;
            }
            if out.len() < MAX_CONNECTIONS {
                out.push((i, amin[0].max(bmin[0]), amax[0].min(bmax[0])));
            }
            break;
        }
    }
    out
}

/// Tiled navigation mesh
#[derive(Debug, Clone)]
pub struct NavMesh {
    params: NavMeshParams,
    tiles: Vec<Option<MeshTile>>,
    salts: Vec<u32>,
    /// Free slots, lowest index on top
    free: Vec<u32>,
    pos_lookup: HashMap<(i32, i32, i32), usize>,
}

impl NavMesh {
    /// Creates an empty navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if !params.origin.is_finite() || !(params.tile_width > 0.0) || !(params.tile_height > 0.0) {
            return Err(Status::InvalidParam.into());
        }
        if params.max_tiles == 0 || params.max_tiles as u64 > DT_TILE_MASK {
            return Err(Status::InvalidParam.into());
        }
        if params.max_polys == 0 || params.max_polys as u64 > DT_POLY_MASK {
            return Err(Status::InvalidParam.into());
        }

        let n = params.max_tiles as usize;
        Ok(Self {
            params,
            tiles: vec![None; n],
            salts: vec![1; n],
            free: (0..params.max_tiles).rev().collect(),
            pos_lookup: HashMap::new(),
        })
    }

    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    /// Grid location of the tile containing `pos`
    pub fn calc_tile_loc(&self, pos: Vec3) -> (i32, i32) {
        (
            ((pos.x - self.params.origin.x) / self.params.tile_width).floor() as i32,
            ((pos.z - self.params.origin.z) / self.params.tile_height).floor() as i32,
        )
    }

    pub fn tile_count(&self) -> usize {
        self.pos_lookup.len()
    }

    /// Live tiles in slot order
    pub fn tiles(&self) -> impl Iterator<Item = &MeshTile> {
        self.tiles.iter().flatten()
    }

    /// Live tiles with the reference of their first polygon, in slot order
    pub fn tiles_with_refs(&self) -> impl Iterator<Item = (PolyRef, &MeshTile)> {
        self.tiles
            .iter()
            .enumerate()
            .filter_map(|(slot, t)| t.as_ref().map(|t| (self.poly_ref_base(slot), t)))
    }

    pub fn tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        let slot = *self.pos_lookup.get(&(x, y, layer))?;
        self.tiles[slot].as_ref()
    }

    /// Slots of every layer at a grid location
    fn slots_at(&self, x: i32, y: i32) -> Vec<usize> {
        let mut slots: Vec<usize> = self
            .pos_lookup
            .iter()
            .filter(|(&(tx, ty, _), _)| tx == x && ty == y)
            .map(|(_, &slot)| slot)
            .collect();
        slots.sort_unstable();
        slots
    }

    /// Reference of polygon 0 of the tile in `slot`
    fn poly_ref_base(&self, slot: usize) -> PolyRef {
        encode_poly_ref(self.salts[slot], slot as u32, 0)
    }

    #[inline]
    fn poly_ref(&self, slot: usize, poly: usize) -> PolyRef {
        PolyRef::new(self.poly_ref_base(slot).id() | poly as u64)
    }

    /// Reference of the first polygon of the tile at a location
    pub fn tile_ref_at(&self, x: i32, y: i32, layer: i32) -> Option<PolyRef> {
        let slot = *self.pos_lookup.get(&(x, y, layer))?;
        Some(self.poly_ref_base(slot))
    }

    /// References of all polygons of the tile at a location
    pub fn tile_poly_refs(&self, x: i32, y: i32, layer: i32) -> Vec<PolyRef> {
        let Some(&slot) = self.pos_lookup.get(&(x, y, layer)) else {
            return Vec::new();
        };
        let count = self.tiles[slot].as_ref().map_or(0, |t| t.polys.len());
        (0..count).map(|i| self.poly_ref(slot, i)).collect()
    }

    /// Adds a tile, replacing any tile at the same location, and links it with its
    /// neighbours. Returns the reference of the tile's first polygon.
    pub fn add_tile(&mut self, tile: MeshTile) -> Result<PolyRef> {
        let (x, y, layer) = (tile.header.x, tile.header.y, tile.header.layer);
        if tile.polys.len() as u64 > self.params.max_polys as u64 {
            return Err(Status::TileOutOfBounds.into());
        }
        if self.pos_lookup.contains_key(&(x, y, layer)) {
            self.remove_tile(x, y, layer);
        }
        let slot = self.free.pop().ok_or(Status::OutOfTiles)? as usize;
        Ok(self.insert_tile(slot, tile))
    }

    /// Adds a tile into the slot and salt encoded in `tile_ref`, as returned by an
    /// earlier [`NavMesh::add_tile`]. Used when loading saved meshes so polygon
    /// references stay stable across a save and load.
    pub fn restore_tile(&mut self, tile: MeshTile, tile_ref: PolyRef) -> Result<PolyRef> {
        let (salt, slot, poly) = decode_poly_ref(tile_ref);
        if poly != 0 || salt == 0 || tile.polys.len() as u64 > self.params.max_polys as u64 {
            return Err(Status::InvalidParam.into());
        }
        let (x, y, layer) = (tile.header.x, tile.header.y, tile.header.layer);
        if self.pos_lookup.contains_key(&(x, y, layer)) {
            return Err(Status::DataCorrupted.into());
        }
        let pos = self
            .free
            .iter()
            .position(|&s| s == slot)
            .ok_or(Status::DataCorrupted)?;
        self.free.remove(pos);
        self.salts[slot as usize] = salt;
        Ok(self.insert_tile(slot as usize, tile))
    }

    fn insert_tile(&mut self, slot: usize, mut tile: MeshTile) -> PolyRef {
        let (x, y, layer) = (tile.header.x, tile.header.y, tile.header.layer);
        tile.salt = self.salts[slot];
        for poly in &mut tile.polys {
            poly.links.clear();
        }
        self.tiles[slot] = Some(tile);
        self.pos_lookup.insert((x, y, layer), slot);

        self.connect_int_links(slot);
        self.base_off_mesh_links(slot);
        self.connect_ext_off_mesh_links(slot, slot, None);

        // Other layers at the same location
        for other in self.slots_at(x, y) {
            if other == slot {
                continue;
            }
            self.connect_ext_links(slot, other, None);
            self.connect_ext_links(other, slot, None);
            self.connect_ext_off_mesh_links(slot, other, None);
            self.connect_ext_off_mesh_links(other, slot, None);
        }

        for side in 0..8u8 {
            let (nx, ny) = neighbour_tile(x, y, side);
            for nei in self.slots_at(nx, ny) {
                self.connect_ext_links(slot, nei, Some(side));
                self.connect_ext_links(nei, slot, Some(opposite_side(side)));
                self.connect_ext_off_mesh_links(slot, nei, Some(side));
                self.connect_ext_off_mesh_links(nei, slot, Some(opposite_side(side)));
            }
        }

        log::trace!("Added tile ({}, {}, {}) in slot {}", x, y, layer, slot);
        self.poly_ref_base(slot)
    }

    /// Removes the tile at a location, unlinking it from its neighbours
    pub fn remove_tile(&mut self, x: i32, y: i32, layer: i32) -> Option<MeshTile> {
        let slot = self.pos_lookup.remove(&(x, y, layer))?;
        let tile = self.tiles[slot].take()?;

        let mut neighbours = self.slots_at(x, y);
        for side in 0..8u8 {
            let (nx, ny) = neighbour_tile(x, y, side);
            neighbours.extend(self.slots_at(nx, ny));
        }
        for nei in neighbours {
            if let Some(other) = self.tiles[nei].as_mut() {
                for poly in &mut other.polys {
                    poly.links.retain(|l| decode_poly_ref(l.reference).1 as usize != slot);
                }
            }
        }

        let salt = (self.salts[slot] + 1) & DT_SALT_MASK as u32;
        self.salts[slot] = salt.max(1);
        self.free.push(slot as u32);
        Some(tile)
    }

    fn resolve(&self, reference: PolyRef) -> Option<(usize, &MeshTile, usize)> {
        if !reference.is_valid() {
            return None;
        }
        let (salt, slot, poly) = decode_poly_ref(reference);
        let tile = self.tiles.get(slot as usize)?.as_ref()?;
        if tile.salt != salt || poly as usize >= tile.polys.len() {
            return None;
        }
        Some((slot as usize, tile, poly as usize))
    }

    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.resolve(reference).is_some()
    }

    /// Tile and polygon a reference points at
    pub fn get_tile_and_poly_by_ref(&self, reference: PolyRef) -> Result<(&MeshTile, &Poly)> {
        let (_, tile, poly) = self.resolve(reference).ok_or(Status::InvalidRef)?;
        Ok((tile, &tile.polys[poly]))
    }

    /// Tile, polygon index within it and polygon of a reference
    pub fn get_tile_poly_index(&self, reference: PolyRef) -> Result<(&MeshTile, usize)> {
        let (_, tile, poly) = self.resolve(reference).ok_or(Status::InvalidRef)?;
        Ok((tile, poly))
    }

    /// Polygons overlapping a box that pass the filter
    pub fn query_polygons(&self, bmin: Vec3, bmax: Vec3, filter: &QueryFilter) -> Vec<PolyRef> {
        let (minx, miny) = self.calc_tile_loc(bmin);
        let (maxx, maxy) = self.calc_tile_loc(bmax);
        let mut out = Vec::new();
        let mut candidates = Vec::new();
        for ty in miny..=maxy {
            for tx in minx..=maxx {
                for slot in self.slots_at(tx, ty) {
                    let Some(tile) = self.tiles[slot].as_ref() else {
                        continue;
                    };
                    candidates.clear();
                    tile.polys_overlapping(bmin, bmax, &mut candidates);
                    out.extend(
                        candidates
                            .iter()
                            .filter(|&&i| filter.pass_filter(&tile.polys[i]))
                            .map(|&i| self.poly_ref(slot, i)),
                    );
                }
            }
        }
        out
    }

    pub fn poly_height(&self, reference: PolyRef, pos: Vec3) -> Result<Option<f32>> {
        let (_, tile, poly) = self.resolve(reference).ok_or(Status::InvalidRef)?;
        Ok(tile.poly_height(poly, pos))
    }

    pub fn poly_center(&self, reference: PolyRef) -> Result<Vec3> {
        let (_, tile, poly) = self.resolve(reference).ok_or(Status::InvalidRef)?;
        Ok(tile.poly_center(poly))
    }

    fn connect_int_links(&mut self, slot: usize) {
        let base = self.poly_ref_base(slot);
        let Some(tile) = self.tiles[slot].as_mut() else {
            return;
        };
        for poly in &mut tile.polys {
            if poly.poly_type == PolyType::OffMeshConnection {
                continue;
            }
            for j in 0..poly.vert_count as usize {
                let nei = poly.neis[j];
                if nei == 0 || nei & DT_EXT_LINK != 0 {
                    continue;
                }
                poly.links.push(Link {
                    reference: PolyRef::new(base.id() | (nei - 1) as u64),
                    edge: j as u8,
                    side: DT_LINK_INTERNAL,
                    bmin: 0,
                    bmax: 0,
                });
            }
        }
    }

    /// Connects the start of every off-mesh connection to the ground polygon under it
    fn base_off_mesh_links(&mut self, slot: usize) {
        let base = self.poly_ref_base(slot);
        let Some(tile) = self.tiles[slot].as_ref() else {
            return;
        };

        let mut landings = Vec::new();
        for con in &tile.off_mesh_cons {
            let half = Vec3::new(con.radius, tile.header.walkable_climb, con.radius);
            let Some((land, nearest)) = tile.find_nearest_poly(con.start, half) else {
                continue;
            };
            let (dx, dz) = (nearest.x - con.start.x, nearest.z - con.start.z);
            if dx * dx + dz * dz > con.radius * con.radius {
                continue;
            }
            landings.push((con.poly as usize, land, nearest));
        }

        let Some(tile) = self.tiles[slot].as_mut() else {
            return;
        };
        for (con_poly, land, nearest) in landings {
            let v = tile.polys[con_poly].verts[0] as usize;
            tile.verts[v] = nearest;
            tile.polys[con_poly].links.push(Link {
                reference: PolyRef::new(base.id() | land as u64),
                edge: 0,
                side: DT_LINK_INTERNAL,
                bmin: 0,
                bmax: 0,
            });
            tile.polys[land].links.push(Link {
                reference: PolyRef::new(base.id() | con_poly as u64),
                edge: 0xff,
                side: DT_LINK_INTERNAL,
                bmin: 0,
                bmax: 0,
            });
        }
    }

    /// Lands the end points of `target`'s off-mesh connections on `slot`
    fn connect_ext_off_mesh_links(&mut self, slot: usize, target_slot: usize, side: Option<u8>) {
        let tile_base = self.poly_ref_base(slot);
        let target_base = self.poly_ref_base(target_slot);
        let (Some(tile), Some(target)) = (self.tiles[slot].as_ref(), self.tiles[target_slot].as_ref()) else {
            return;
        };
        let opposite = side.map_or(DT_LINK_INTERNAL, opposite_side);

        let mut landings = Vec::new();
        for con in &target.off_mesh_cons {
            if con.side != opposite {
                continue;
            }
            // Connections whose start could not be placed stay unlinked
            if target.polys[con.poly as usize].links.is_empty() {
                continue;
            }
            let half = Vec3::new(con.radius, target.header.walkable_climb, con.radius);
            let Some((land, nearest)) = tile.find_nearest_poly(con.end, half) else {
                continue;
            };
            let (dx, dz) = (nearest.x - con.end.x, nearest.z - con.end.z);
            if dx * dx + dz * dz > con.radius * con.radius {
                continue;
            }
            landings.push((con.poly as usize, land, nearest, con.is_bidirectional()));
        }

        for &(con_poly, land, nearest, _) in &landings {
            let Some(target) = self.tiles[target_slot].as_mut() else {
                return;
            };
            let v = target.polys[con_poly].verts[1] as usize;
            target.verts[v] = nearest;
            target.polys[con_poly].links.push(Link {
                reference: PolyRef::new(tile_base.id() | land as u64),
                edge: 1,
                side: opposite,
                bmin: 0,
                bmax: 0,
            });
        }
        for (con_poly, land, _, bidirectional) in landings {
            if !bidirectional {
                continue;
            }
            let Some(tile) = self.tiles[slot].as_mut() else {
                return;
            };
            tile.polys[land].links.push(Link {
                reference: PolyRef::new(target_base.id() | con_poly as u64),
                edge: 0xff,
                side: side.unwrap_or(DT_LINK_INTERNAL),
                bmin: 0,
                bmax: 0,
            });
        }
    }

    /// Links the portal edges of `slot` facing `side` to matching polygons of `target_slot`
    fn connect_ext_links(&mut self, slot: usize, target_slot: usize, side: Option<u8>) {
        let target_base = self.poly_ref_base(target_slot);
        let (Some(tile), Some(target)) = (self.tiles[slot].as_ref(), self.tiles[target_slot].as_ref()) else {
            return;
        };

        let mut links = Vec::new();
        for (i, poly) in tile.polys.iter().enumerate().take(tile.ground_poly_count()) {
            let nv = poly.vert_count as usize;
            for j in 0..nv {
                if poly.neis[j] & DT_EXT_LINK == 0 {
                    continue;
                }
                let dir = (poly.neis[j] & 0xff) as u8;
                if side.is_some_and(|s| s != dir) {
                    continue;
                }
                let va = tile.verts[poly.verts[j] as usize];
                let vb = tile.verts[poly.verts[(j + 1) % nv] as usize];

                for (nei, lo, hi) in find_connecting_polys(va, vb, target, opposite_side(dir)) {
                    let (a, b) = if dir == 0 || dir == 4 { (va.z, vb.z) } else { (va.x, vb.x) };
                    let mut tmin = (lo - a) / (b - a);
                    let mut tmax = (hi - a) / (b - a);
                    if tmin > tmax {
                        std::mem::swap(&mut tmin, &mut tmax);
                    }
                    links.push((
                        i,
                        Link {
                            reference: PolyRef::new(target_base.id() | nei as u64),
                            edge: j as u8,
                            side: dir,
                            bmin: (tmin.clamp(0.0, 1.0) * 255.0).round() as u8,
                            bmax: (tmax.clamp(0.0, 1.0) * 255.0).round() as u8,
                        },
                    ));
                }
            }
        }

        if let Some(tile) = self.tiles[slot].as_mut() {
            for (i, link) in links {
                tile.polys[i].links.push(link);
            }
        }
    }
}
