//! Binary navmesh persistence
//!
//! Layout, little endian:
//!
//! * header: magic `NVMD`, format version, customization version
//! * Brotli stream: navmesh params, tile count, then per tile its reference and
//!   content; afterwards the flight volume as level sizes, bounds and a
//!   run-length encoded walk over the octree tiles
//!
//! A wrong magic, version or customization version fails the load with
//! [`Error::Format`] so the caller rebuilds instead of trusting stale data.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::Vec3;

use navkit_common::{Error, Result};
use navkit_detour::{
    BVNode, MeshTile, NavMesh, NavMeshParams, OffMeshConnection, Poly, PolyDetail, PolyFlags, PolyRef, PolyType,
    TileHeader, MAX_VERTS_PER_POLY,
};
use navkit_voxel::{VoxelMap, VoxelTile, EMPTY_CELL, SOLID_CELL};

use crate::Navmesh;

/// Magic number of saved navmeshes ("NVMD")
pub const NAVMESH_MAGIC: u32 = 0x444D_564E;
/// Current format version
pub const NAVMESH_VERSION: u32 = 19;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 11;
const BROTLI_WINDOW: u32 = 22;

/// Counts above this are treated as corruption rather than allocated
const MAX_ELEMENT_COUNT: u32 = 1 << 24;

fn corrupt(what: impl std::fmt::Display) -> Error {
    Error::Format(format!("Corrupt navmesh data: {}", what))
}

fn read_count<R: Read>(r: &mut R) -> Result<usize> {
    let n = r.read_u32::<LittleEndian>()?;
    if n > MAX_ELEMENT_COUNT {
        return Err(corrupt(format!("element count {}", n)));
    }
    Ok(n as usize)
}

fn write_vec3<W: Write>(w: &mut W, v: Vec3) -> Result<()> {
    w.write_f32::<LittleEndian>(v.x)?;
    w.write_f32::<LittleEndian>(v.y)?;
    w.write_f32::<LittleEndian>(v.z)?;
    Ok(())
}

fn read_vec3<R: Read>(r: &mut R) -> Result<Vec3> {
    Ok(Vec3::new(
        r.read_f32::<LittleEndian>()?,
        r.read_f32::<LittleEndian>()?,
        r.read_f32::<LittleEndian>()?,
    ))
}

impl Navmesh {
    /// Writes the navmesh in the binary format
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_u32::<LittleEndian>(NAVMESH_MAGIC)?;
        w.write_u32::<LittleEndian>(NAVMESH_VERSION)?;
        w.write_i32::<LittleEndian>(self.customization_version)?;

        let mut body = brotli::CompressorWriter::new(w, BROTLI_BUFFER_SIZE, BROTLI_QUALITY, BROTLI_WINDOW);
        write_nav_mesh(&mut body, &self.nav_mesh)?;
        write_voxel_map(&mut body, self.voxel_map.as_ref())?;
        // Finishes the stream
        body.into_inner();
        Ok(())
    }

    /// Reads a navmesh written by [`Navmesh::write_to`].
    ///
    /// Fails with [`Error::Format`] unless the data was written by this format
    /// version under `customization_version`.
    pub fn read_from<R: Read>(mut r: R, customization_version: i32) -> Result<Self> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != NAVMESH_MAGIC {
            return Err(Error::Format(format!("Bad navmesh magic {:#010x}", magic)));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != NAVMESH_VERSION {
            return Err(Error::Format(format!(
                "Navmesh format version {} does not match {}",
                version, NAVMESH_VERSION
            )));
        }
        let customization = r.read_i32::<LittleEndian>()?;
        if customization != customization_version {
            return Err(Error::Format(format!(
                "Navmesh customization version {} does not match {}",
                customization, customization_version
            )));
        }

        let mut body = brotli::Decompressor::new(r, BROTLI_BUFFER_SIZE);
        let payload = read_nav_mesh(&mut body).and_then(|nav_mesh| {
            let voxel_map = read_voxel_map(&mut body)?;
            Ok((nav_mesh, voxel_map))
        });
        // Truncated or undecodable payloads mean the same as a bad header
        let (nav_mesh, voxel_map) = payload.map_err(|err| match err {
            Error::Io(io) => corrupt(io),
            other => other,
        })?;
        Ok(Navmesh::new(customization, nav_mesh, voxel_map))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8], customization_version: i32) -> Result<Self> {
        Self::read_from(bytes, customization_version)
    }

    /// Saves the navmesh to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        log::debug!("Saved navmesh to {}", path.as_ref().display());
        Ok(())
    }

    /// Loads a navmesh saved under `customization_version`
    pub fn load(path: impl AsRef<Path>, customization_version: i32) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let navmesh = Self::read_from(BufReader::new(file), customization_version)?;
        log::debug!(
            "Loaded navmesh with {} tiles from {}",
            navmesh.nav_mesh.tile_count(),
            path.as_ref().display()
        );
        Ok(navmesh)
    }
}

fn write_nav_mesh<W: Write>(w: &mut W, nav_mesh: &NavMesh) -> Result<()> {
    let params = nav_mesh.params();
    w.write_u32::<LittleEndian>(nav_mesh.tile_count() as u32)?;
    write_vec3(w, params.origin)?;
    w.write_f32::<LittleEndian>(params.tile_width)?;
    w.write_f32::<LittleEndian>(params.tile_height)?;
    w.write_u32::<LittleEndian>(params.max_tiles)?;
    w.write_u32::<LittleEndian>(params.max_polys)?;

    for (tile_ref, tile) in nav_mesh.tiles_with_refs() {
        w.write_u64::<LittleEndian>(tile_ref.id())?;
        write_tile(w, tile)?;
    }
    Ok(())
}

fn read_nav_mesh<R: Read>(r: &mut R) -> Result<NavMesh> {
    let tile_count = read_count(r)?;
    let params = NavMeshParams {
        origin: read_vec3(r)?,
        tile_width: r.read_f32::<LittleEndian>()?,
        tile_height: r.read_f32::<LittleEndian>()?,
        max_tiles: r.read_u32::<LittleEndian>()?,
        max_polys: r.read_u32::<LittleEndian>()?,
    };
    if tile_count > params.max_tiles as usize {
        return Err(corrupt(format!("{} tiles for {} slots", tile_count, params.max_tiles)));
    }
    let mut nav_mesh = NavMesh::new(params).map_err(corrupt)?;

    for _ in 0..tile_count {
        let tile_ref = PolyRef::new(r.read_u64::<LittleEndian>()?);
        let tile = read_tile(r)?;
        nav_mesh.restore_tile(tile, tile_ref).map_err(corrupt)?;
    }
    Ok(nav_mesh)
}

fn write_tile<W: Write>(w: &mut W, tile: &MeshTile) -> Result<()> {
    let h = &tile.header;
    w.write_i32::<LittleEndian>(h.x)?;
    w.write_i32::<LittleEndian>(h.y)?;
    w.write_i32::<LittleEndian>(h.layer)?;
    w.write_u32::<LittleEndian>(h.user_id)?;
    write_vec3(w, h.bmin)?;
    write_vec3(w, h.bmax)?;
    w.write_f32::<LittleEndian>(h.walkable_height)?;
    w.write_f32::<LittleEndian>(h.walkable_radius)?;
    w.write_f32::<LittleEndian>(h.walkable_climb)?;
    w.write_f32::<LittleEndian>(h.bv_quant_factor)?;
    w.write_u32::<LittleEndian>(h.off_mesh_base as u32)?;

    for len in [
        tile.verts.len(),
        tile.polys.len(),
        tile.detail_meshes.len(),
        tile.detail_verts.len(),
        tile.detail_tris.len(),
        tile.bv_tree.len(),
        tile.off_mesh_cons.len(),
    ] {
        w.write_u32::<LittleEndian>(len as u32)?;
    }

    for &v in &tile.verts {
        write_vec3(w, v)?;
    }
    for poly in &tile.polys {
        w.write_u8(poly.vert_count)?;
        w.write_u8(poly.area)?;
        w.write_u8(match poly.poly_type {
            PolyType::Ground => 0,
            PolyType::OffMeshConnection => 1,
        })?;
        w.write_u16::<LittleEndian>(poly.flags.bits())?;
        for &v in &poly.verts {
            w.write_u16::<LittleEndian>(v)?;
        }
        for &n in &poly.neis {
            w.write_u16::<LittleEndian>(n)?;
        }
    }
    for d in &tile.detail_meshes {
        w.write_u32::<LittleEndian>(d.vert_base)?;
        w.write_u32::<LittleEndian>(d.tri_base)?;
        w.write_u8(d.vert_count)?;
        w.write_u8(d.tri_count)?;
    }
    for &v in &tile.detail_verts {
        write_vec3(w, v)?;
    }
    for tri in &tile.detail_tris {
        w.write_all(tri)?;
    }
    for node in &tile.bv_tree {
        for v in node.bmin.iter().chain(&node.bmax) {
            w.write_i32::<LittleEndian>(*v as i32)?;
        }
        w.write_i32::<LittleEndian>(node.i)?;
    }
    for con in &tile.off_mesh_cons {
        write_vec3(w, con.start)?;
        write_vec3(w, con.end)?;
        w.write_f32::<LittleEndian>(con.radius)?;
        w.write_u16::<LittleEndian>(con.poly)?;
        w.write_u8(con.flags)?;
        w.write_u8(con.side)?;
        w.write_u32::<LittleEndian>(con.user_id)?;
    }
    Ok(())
}

fn read_tile<R: Read>(r: &mut R) -> Result<MeshTile> {
    let mut header = TileHeader::new(
        r.read_i32::<LittleEndian>()?,
        r.read_i32::<LittleEndian>()?,
        r.read_i32::<LittleEndian>()?,
    );
    header.user_id = r.read_u32::<LittleEndian>()?;
    header.bmin = read_vec3(r)?;
    header.bmax = read_vec3(r)?;
    header.walkable_height = r.read_f32::<LittleEndian>()?;
    header.walkable_radius = r.read_f32::<LittleEndian>()?;
    header.walkable_climb = r.read_f32::<LittleEndian>()?;
    header.bv_quant_factor = r.read_f32::<LittleEndian>()?;
    header.off_mesh_base = r.read_u32::<LittleEndian>()? as usize;

    let mut counts = [0usize; 7];
    for count in &mut counts {
        *count = read_count(r)?;
    }
    let [nverts, npolys, ndetail, ndetail_verts, ndetail_tris, nnodes, ncons] = counts;

    let mut tile = MeshTile::new(header);
    tile.verts = (0..nverts).map(|_| read_vec3(r)).collect::<Result<_>>()?;

    tile.polys.reserve(npolys.min(1 << 16));
    for _ in 0..npolys {
        let vert_count = r.read_u8()?;
        let area = r.read_u8()?;
        let poly_type = match r.read_u8()? {
            0 => PolyType::Ground,
            1 => PolyType::OffMeshConnection,
            other => return Err(corrupt(format!("polygon type {}", other))),
        };
        let flags = PolyFlags::from_bits_retain(r.read_u16::<LittleEndian>()?);
        let mut poly = Poly::new(area, poly_type, flags);
        poly.vert_count = vert_count;
        for v in &mut poly.verts {
            *v = r.read_u16::<LittleEndian>()?;
        }
        for n in &mut poly.neis {
            *n = r.read_u16::<LittleEndian>()?;
        }
        let bad_vertex = poly.vertex_indices().iter().any(|&v| v as usize >= nverts);
        if vert_count as usize > MAX_VERTS_PER_POLY || bad_vertex {
            return Err(corrupt("polygon vertices out of range"));
        }
        tile.polys.push(poly);
    }

    for _ in 0..ndetail {
        tile.detail_meshes.push(PolyDetail {
            vert_base: r.read_u32::<LittleEndian>()?,
            tri_base: r.read_u32::<LittleEndian>()?,
            vert_count: r.read_u8()?,
            tri_count: r.read_u8()?,
        });
    }
    tile.detail_verts = (0..ndetail_verts).map(|_| read_vec3(r)).collect::<Result<_>>()?;
    for _ in 0..ndetail_tris {
        let mut tri = [0u8; 4];
        r.read_exact(&mut tri)?;
        tile.detail_tris.push(tri);
    }
    for d in &tile.detail_meshes {
        let verts_ok = d.vert_base as usize + d.vert_count as usize <= ndetail_verts;
        let tris_ok = d.tri_base as usize + d.tri_count as usize <= ndetail_tris;
        if !verts_ok || !tris_ok {
            return Err(corrupt("detail mesh out of range"));
        }
    }

    for _ in 0..nnodes {
        let mut ext = [0u16; 6];
        for v in &mut ext {
            let raw = r.read_i32::<LittleEndian>()?;
            *v = u16::try_from(raw).map_err(|_| corrupt(format!("bounding volume extent {}", raw)))?;
        }
        tile.bv_tree.push(BVNode {
            bmin: [ext[0], ext[1], ext[2]],
            bmax: [ext[3], ext[4], ext[5]],
            i: r.read_i32::<LittleEndian>()?,
        });
    }

    for _ in 0..ncons {
        let con = OffMeshConnection {
            start: read_vec3(r)?,
            end: read_vec3(r)?,
            radius: r.read_f32::<LittleEndian>()?,
            poly: r.read_u16::<LittleEndian>()?,
            flags: r.read_u8()?,
            side: r.read_u8()?,
            user_id: r.read_u32::<LittleEndian>()?,
        };
        if con.poly as usize >= npolys {
            return Err(corrupt("off-mesh connection polygon out of range"));
        }
        tile.off_mesh_cons.push(con);
    }
    Ok(tile)
}

fn write_voxel_map<W: Write>(w: &mut W, map: Option<&VoxelMap>) -> Result<()> {
    let Some(map) = map else {
        w.write_u32::<LittleEndian>(0)?;
        return Ok(());
    };
    let levels = map.levels();
    w.write_u32::<LittleEndian>(levels.len() as u32)?;
    for &n in levels {
        w.write_u32::<LittleEndian>(n as u32)?;
    }
    let bounds = map.bounds();
    write_vec3(w, bounds.min)?;
    write_vec3(w, bounds.max)?;
    w.write_f32::<LittleEndian>(map.voxel_size())?;

    write_voxel_tile(w, map, 0, 0, bounds.min)
}

/// Writes a tile's cells, then its children in child order
fn write_voxel_tile<W: Write>(w: &mut W, map: &VoxelMap, level: usize, index: u32, min: Vec3) -> Result<()> {
    let tile = &map.tiles()[level][index as usize];
    let n = map.levels()[level];
    let cell = map.cell_size(level);
    write_vec3(w, min)?;
    w.write_f32::<LittleEndian>(cell * n as f32)?;

    let mut i = 0;
    while i < tile.cells.len() {
        let code = tile.cells[i];
        w.write_u16::<LittleEndian>(code)?;
        if code == EMPTY_CELL || code == SOLID_CELL {
            let run = tile.cells[i..]
                .iter()
                .take(u16::MAX as usize)
                .take_while(|&&c| c == code)
                .count();
            w.write_u16::<LittleEndian>(run as u16)?;
            i += run;
        } else {
            i += 1;
        }
    }

    // Child order is the order of the subdividing cells' child slots
    let mut corners = vec![None; tile.children.len()];
    for (local, &code) in tile.cells.iter().enumerate() {
        if code == EMPTY_CELL || code == SOLID_CELL {
            continue;
        }
        let slot = (code & 0x7fff) as usize;
        if let Some(corner) = corners.get_mut(slot) {
            let (y, x, z) = (local / (n * n), (local / n) % n, local % n);
            *corner = Some(min + Vec3::new(x as f32, y as f32, z as f32) * cell);
        }
    }
    w.write_u16::<LittleEndian>(tile.children.len() as u16)?;
    for (slot, &child) in tile.children.iter().enumerate() {
        let corner = corners[slot].ok_or_else(|| corrupt("voxel child without a cell"))?;
        write_voxel_tile(w, map, level + 1, child, corner)?;
    }
    Ok(())
}

fn read_voxel_map<R: Read>(r: &mut R) -> Result<Option<VoxelMap>> {
    let nlevels = read_count(r)?;
    if nlevels == 0 {
        return Ok(None);
    }
    if nlevels > navkit_voxel::MAX_LEVELS {
        return Err(corrupt(format!("{} voxel levels", nlevels)));
    }
    let mut levels = Vec::with_capacity(nlevels);
    for _ in 0..nlevels {
        let n = read_count(r)?;
        if n > navkit_voxel::MAX_LEVEL_SIZE {
            return Err(corrupt(format!("voxel level of {} cells", n)));
        }
        levels.push(n);
    }
    let origin = read_vec3(r)?;
    let _max = read_vec3(r)?;
    let voxel_size = r.read_f32::<LittleEndian>()?;

    let mut tiles = vec![Vec::new(); nlevels];
    read_voxel_tile(r, &levels, 0, &mut tiles)?;
    VoxelMap::from_parts(origin, voxel_size, levels, tiles).map(Some)
}

/// Reads a tile and its children, returning the tile's arena index
fn read_voxel_tile<R: Read>(r: &mut R, levels: &[usize], level: usize, arenas: &mut [Vec<VoxelTile>]) -> Result<u32> {
    let _min = read_vec3(r)?;
    let _size = r.read_f32::<LittleEndian>()?;

    let n = levels[level];
    let total = n * n * n;
    let mut cells = Vec::with_capacity(total);
    while cells.len() < total {
        let code = r.read_u16::<LittleEndian>()?;
        let run = if code == EMPTY_CELL || code == SOLID_CELL {
            r.read_u16::<LittleEndian>()? as usize
        } else {
            1
        };
        if run == 0 || cells.len() + run > total {
            return Err(corrupt("voxel run overflows its tile"));
        }
        cells.extend(std::iter::repeat(code).take(run));
    }

    let nchildren = r.read_u16::<LittleEndian>()? as usize;
    if nchildren > 0 && level + 1 >= levels.len() {
        return Err(corrupt("voxel tile at the finest level has children"));
    }
    let mut children = Vec::with_capacity(nchildren);
    for _ in 0..nchildren {
        children.push(read_voxel_tile(r, levels, level + 1, arenas)?);
    }

    let arena = &mut arenas[level];
    arena.push(VoxelTile { cells, children });
    Ok((arena.len() - 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use navkit_voxel::Voxelizer;

    fn empty_navmesh(customization_version: i32) -> Navmesh {
        let nav_mesh = NavMesh::new(NavMeshParams {
            origin: Vec3::new(-8.0, 0.0, -8.0),
            tile_width: 16.0,
            tile_height: 16.0,
            max_tiles: 4,
            max_polys: 256,
        })
        .unwrap();
        Navmesh::new(customization_version, nav_mesh, None)
    }

    fn sample_map() -> VoxelMap {
        let mut grid = Voxelizer::new(Vec3::ZERO, 1.0, [8, 8, 8]).unwrap();
        for (x, y, z) in [(0, 0, 0), (1, 0, 0), (5, 6, 7)] {
            grid.set_solid(x, y, z);
        }
        for x in 0..8 {
            for z in 0..8 {
                grid.set_solid(x, 3, z);
            }
        }
        VoxelMap::build(Vec3::new(-4.0, -4.0, -4.0), 1.0, &[2, 2, 2], &grid).unwrap()
    }

    #[test]
    fn test_header_checks() {
        let bytes = empty_navmesh(5).to_bytes().unwrap();
        assert_eq!(&bytes[..4], &NAVMESH_MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..8], &NAVMESH_VERSION.to_le_bytes());
        assert_eq!(&bytes[8..12], &5i32.to_le_bytes());

        assert!(Navmesh::from_bytes(&bytes, 5).is_ok());
        assert!(matches!(Navmesh::from_bytes(&bytes, 6), Err(Error::Format(_))));

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(Navmesh::from_bytes(&bad_magic, 5), Err(Error::Format(_))));

        let mut bad_version = bytes.clone();
        bad_version[4] = 18;
        assert!(matches!(Navmesh::from_bytes(&bad_version, 5), Err(Error::Format(_))));
    }

    #[test]
    fn test_truncated_payload_is_a_format_error() {
        let mut navmesh = empty_navmesh(0);
        navmesh.voxel_map = Some(sample_map());
        let bytes = navmesh.to_bytes().unwrap();
        let cut = &bytes[..12 + (bytes.len() - 12) / 2];
        assert!(matches!(Navmesh::from_bytes(cut, 0), Err(Error::Format(_))));
        assert!(matches!(Navmesh::from_bytes(&bytes[..6], 0), Err(Error::Io(_))));
    }

    #[test]
    fn test_voxel_map_round_trip() {
        let mut navmesh = empty_navmesh(1);
        let map = sample_map();
        navmesh.voxel_map = Some(map.clone());

        let bytes = navmesh.to_bytes().unwrap();
        let loaded = Navmesh::from_bytes(&bytes, 1).unwrap();
        let loaded_map = loaded.voxel_map.as_ref().unwrap();
        assert_eq!(loaded_map, &map);
        assert_eq!(loaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_cleared_root_cell_still_saves() {
        let mut map = sample_map();
        let cell = [0, 0, 0];
        let subtree = map.build_subtree(cell, &map.root_cell_voxelizer(cell).unwrap()).unwrap();
        assert!(subtree.is_empty());
        map.merge_subtree(subtree);

        let mut navmesh = empty_navmesh(1);
        navmesh.voxel_map = Some(map.clone());
        let before_compact = navmesh.to_bytes().unwrap();

        map.compact();
        assert_eq!(map.tiles().iter().map(Vec::len).sum::<usize>(), map.tile_count());
        navmesh.voxel_map = Some(map.clone());
        let bytes = navmesh.to_bytes().unwrap();
        assert_eq!(bytes, before_compact);

        let loaded = Navmesh::from_bytes(&bytes, 1).unwrap();
        let loaded_map = loaded.voxel_map.as_ref().unwrap();
        let leaf = loaded_map.find_leaf(Vec3::new(-3.5, -3.5, -3.5)).unwrap();
        assert!(loaded_map.is_empty(leaf));
        assert_eq!(leaf.depth(3), 1);
        let solid = loaded_map.find_leaf(Vec3::new(1.5, 2.5, 3.5)).unwrap();
        assert!(!loaded_map.is_empty(solid));
        assert_eq!(loaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_voxel_runs_are_collapsed() {
        let map = sample_map();
        let mut raw = Vec::new();
        write_voxel_map(&mut raw, Some(&map)).unwrap();
        // The root holds 8 codes; a fully empty root would be one run
        let empty = VoxelMap::new(Vec3::ZERO, 1.0, &[2, 2, 2]).unwrap();
        let mut small = Vec::new();
        write_voxel_map(&mut small, Some(&empty)).unwrap();
        // levels, sizes, bounds, voxel size, root bounds, one run, child count
        assert_eq!(small.len(), 4 + 3 * 4 + 24 + 4 + 16 + 4 + 2);
        assert!(raw.len() > small.len());
    }
}
