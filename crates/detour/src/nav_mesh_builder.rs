//! Conversion of Recast tile output into navigation mesh tiles

use glam::Vec3;

use navkit_common::{OffMeshLink, Result};
use navkit_recast::{PolyMesh, PolyMeshDetail, RecastConfig, TileMesh, MESH_NULL_IDX};

use crate::nav_mesh::{BVNode, MeshTile, OffMeshConnection, Poly, PolyDetail, TileHeader};
use crate::{PolyFlags, PolyType, Status, DT_EXT_LINK, DT_LINK_INTERNAL, DT_OFFMESH_CON_BIDIR, MAX_VERTS_PER_POLY};

/// Inputs for [`create_tile`]
#[derive(Debug, Clone)]
pub struct NavMeshCreateParams<'a> {
    pub poly_mesh: &'a PolyMesh,
    pub detail_mesh: Option<&'a PolyMeshDetail>,
    /// Candidate links; only those starting inside the tile are stored
    pub off_mesh_links: &'a [OffMeshLink],
    pub tile_x: i32,
    pub tile_y: i32,
    pub tile_layer: i32,
    pub user_id: u32,
    /// Tile bounds without border padding
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub build_bv_tree: bool,
}

impl<'a> NavMeshCreateParams<'a> {
    /// Parameters for a tile produced by the Recast pipeline
    pub fn from_tile_mesh(tile: &'a TileMesh, config: &RecastConfig, off_mesh_links: &'a [OffMeshLink]) -> Self {
        Self {
            poly_mesh: &tile.poly_mesh,
            detail_mesh: tile.detail_mesh.as_ref(),
            off_mesh_links,
            tile_x: tile.tile_x,
            tile_y: tile.tile_z,
            tile_layer: 0,
            user_id: 0,
            bmin: tile.bmin,
            bmax: tile.bmax,
            walkable_height: config.agent_height,
            walkable_radius: config.agent_radius,
            walkable_climb: config.agent_max_climb,
            build_bv_tree: true,
        }
    }
}

/// Tile side a point lies beyond, 0xff when inside the XZ bounds
pub(crate) fn classify_off_mesh_point(pt: Vec3, bmin: Vec3, bmax: Vec3) -> u8 {
    const XP: u8 = 1 << 0;
    const ZP: u8 = 1 << 1;
    const XM: u8 = 1 << 2;
    const ZM: u8 = 1 << 3;

    let mut outcode = 0;
    if pt.x >= bmax.x {
        outcode |= XP;
    }
    if pt.z >= bmax.z {
        outcode |= ZP;
    }
    if pt.x < bmin.x {
        outcode |= XM;
    }
    if pt.z < bmin.z {
        outcode |= ZM;
    }

    match outcode {
        XP => 0,
        o if o == XP | ZP => 1,
        ZP => 2,
        o if o == XM | ZP => 3,
        XM => 4,
        o if o == XM | ZM => 5,
        ZM => 6,
        o if o == XP | ZM => 7,
        _ => DT_LINK_INTERNAL,
    }
}

/// Maps a Recast border direction (0 = -x, 1 = +z, 2 = +x, 3 = -z) to a tile side
fn portal_side(dir: u16) -> Option<u16> {
    match dir {
        0 => Some(4),
        1 => Some(2),
        2 => Some(0),
        3 => Some(6),
        _ => None,
    }
}

/// Builds a navigation mesh tile.
///
/// Returns `Ok(None)` when there is nothing to navigate: no polygons and no
/// off-mesh connection starting in the tile.
pub fn create_tile(params: &NavMeshCreateParams) -> Result<Option<MeshTile>> {
    let pm = params.poly_mesh;
    if pm.nvp < 3 || pm.nvp > MAX_VERTS_PER_POLY {
        return Err(Status::InvalidParam.into());
    }
    if pm.verts.len() >= MESH_NULL_IDX as usize {
        return Err(Status::InvalidParam.into());
    }
    if let Some(dm) = params.detail_mesh {
        if dm.meshes.len() != pm.npolys {
            return Err(Status::DataCorrupted.into());
        }
    }

    // Vertical extent of the polygons, padded by the climb height
    let mut hmin = f32::MAX;
    let mut hmax = f32::MIN;
    for i in 0..pm.verts.len() {
        let y = pm.world_vertex(i).y;
        hmin = hmin.min(y);
        hmax = hmax.max(y);
    }
    if pm.verts.is_empty() {
        hmin = params.bmin.y;
        hmax = params.bmax.y;
    }
    let bmin = Vec3::new(params.bmin.x, hmin - params.walkable_climb, params.bmin.z);
    let bmax = Vec3::new(params.bmax.x, hmax + params.walkable_climb, params.bmax.z);

    let stored: Vec<(&OffMeshLink, u8)> = params
        .off_mesh_links
        .iter()
        .filter(|l| {
            classify_off_mesh_point(l.start, bmin, bmax) == DT_LINK_INTERNAL
                && l.start.y >= bmin.y
                && l.start.y <= bmax.y
        })
        .map(|l| (l, classify_off_mesh_point(l.end, bmin, bmax)))
        .collect();

    if pm.npolys == 0 && stored.is_empty() {
        return Ok(None);
    }

    let mut header = TileHeader::new(params.tile_x, params.tile_y, params.tile_layer);
    header.user_id = params.user_id;
    header.bmin = bmin;
    header.bmax = bmax;
    header.walkable_height = params.walkable_height;
    header.walkable_radius = params.walkable_radius;
    header.walkable_climb = params.walkable_climb;
    header.bv_quant_factor = 1.0 / pm.cs;
    header.off_mesh_base = pm.npolys;
    let mut tile = MeshTile::new(header);

    tile.verts.reserve(pm.verts.len() + stored.len() * 2);
    tile.verts.extend((0..pm.verts.len()).map(|i| pm.world_vertex(i)));
    for (link, _) in &stored {
        tile.verts.push(link.start);
        tile.verts.push(link.end);
    }

    for i in 0..pm.npolys {
        let mut poly = Poly::new(pm.areas[i], PolyType::Ground, PolyFlags::from_bits_truncate(pm.flags[i]));
        let verts = pm.poly(i);
        let neis = pm.neighbours(i);
        poly.vert_count = verts.len() as u8;
        for (j, &v) in verts.iter().enumerate() {
            poly.verts[j] = v;
            let nei = neis[j];
            poly.neis[j] = if nei == MESH_NULL_IDX {
                0
            } else if nei & 0x8000 != 0 {
                portal_side(nei & 0xf).map_or(0, |side| DT_EXT_LINK | side)
            } else {
                nei + 1
            };
        }
        tile.polys.push(poly);
    }

    let vbase = pm.verts.len();
    for (n, (link, end_side)) in stored.iter().enumerate() {
        let mut poly = Poly::new(link.area, PolyType::OffMeshConnection, PolyFlags::from_bits_truncate(link.flags));
        poly.vert_count = 2;
        poly.verts[0] = (vbase + n * 2) as u16;
        poly.verts[1] = (vbase + n * 2 + 1) as u16;
        tile.polys.push(poly);

        tile.off_mesh_cons.push(OffMeshConnection {
            start: link.start,
            end: link.end,
            radius: link.radius,
            poly: (pm.npolys + n) as u16,
            flags: if link.bidirectional { DT_OFFMESH_CON_BIDIR } else { 0 },
            side: *end_side,
            user_id: link.user_id,
        });
    }

    match params.detail_mesh {
        Some(dm) => {
            for (i, &[vb, nv, tb, tc]) in dm.meshes.iter().enumerate() {
                // The polygon corners are shared with the tile vertices
                let corners = tile.polys[i].vert_count as u32;
                let extra = nv.saturating_sub(corners);
                tile.detail_meshes.push(PolyDetail {
                    vert_base: tile.detail_verts.len() as u32,
                    tri_base: tile.detail_tris.len() as u32,
                    vert_count: extra as u8,
                    tri_count: tc as u8,
                });
                tile.detail_verts
                    .extend_from_slice(&dm.verts[(vb + corners) as usize..(vb + corners + extra) as usize]);
                tile.detail_tris
                    .extend_from_slice(&dm.tris[tb as usize..(tb + tc) as usize]);
            }
        }
        None => {
            // Fan triangulation with boundary edge flags
            for i in 0..pm.npolys {
                let nv = tile.polys[i].vert_count;
                tile.detail_meshes.push(PolyDetail {
                    vert_base: 0,
                    tri_base: tile.detail_tris.len() as u32,
                    vert_count: 0,
                    tri_count: nv.saturating_sub(2),
                });
                for j in 2..nv {
                    let mut flags = 1 << 2;
                    if j == 2 {
                        flags |= 1;
                    }
                    if j == nv - 1 {
                        flags |= 1 << 4;
                    }
                    tile.detail_tris.push([0, j - 1, j, flags]);
                }
            }
        }
    }

    if params.build_bv_tree {
        tile.bv_tree = build_bv_tree(&tile);
    }

    Ok(Some(tile))
}

struct BvItem {
    bmin: [u16; 3],
    bmax: [u16; 3],
    i: i32,
}

fn quantize(v: Vec3) -> [u16; 3] {
    [
        v.x.clamp(0.0, u16::MAX as f32) as u16,
        v.y.clamp(0.0, u16::MAX as f32) as u16,
        v.z.clamp(0.0, u16::MAX as f32) as u16,
    ]
}

fn build_bv_tree(tile: &MeshTile) -> Vec<BVNode> {
    let origin = tile.header.bmin;
    let quant = tile.header.bv_quant_factor;
    let mut items: Vec<BvItem> = (0..tile.ground_poly_count())
        .map(|i| {
            let mut bounds = tile.poly_bounds(i);
            for (tri, _) in tile.detail_triangles(i) {
                for v in tri {
                    bounds.grow(v);
                }
            }
            BvItem {
                bmin: quantize(((bounds.min - origin) * quant).floor()),
                bmax: quantize(((bounds.max - origin) * quant).ceil()),
                i: i as i32,
            }
        })
        .collect();

    let mut nodes = Vec::with_capacity(items.len() * 2);
    if !items.is_empty() {
        subdivide(&mut items, &mut nodes);
    }
    nodes
}

fn subdivide(items: &mut [BvItem], nodes: &mut Vec<BVNode>) {
    let icur = nodes.len();
    nodes.push(BVNode::default());

    if let [item] = items {
        nodes[icur] = BVNode {
            bmin: item.bmin,
            bmax: item.bmax,
            i: item.i,
        };
        return;
    }

    let mut bmin = [u16::MAX; 3];
    let mut bmax = [0u16; 3];
    for item in items.iter() {
        for k in 0..3 {
            bmin[k] = bmin[k].min(item.bmin[k]);
            bmax[k] = bmax[k].max(item.bmax[k]);
        }
    }
    nodes[icur].bmin = bmin;
    nodes[icur].bmax = bmax;

    let extent = [bmax[0] - bmin[0], bmax[1] - bmin[1], bmax[2] - bmin[2]];
    let axis = if extent[0] >= extent[1] && extent[0] >= extent[2] {
        0
    } else if extent[1] >= extent[2] {
        1
    } else {
        2
    };
    items.sort_by_key(|it| it.bmin[axis]);

    let split = items.len() / 2;
    let (left, right) = items.split_at_mut(split);
    subdivide(left, nodes);
    subdivide(right, nodes);

    nodes[icur].i = -((nodes.len() - icur) as i32);
}
