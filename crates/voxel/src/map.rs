//! Sparse hierarchical voxel volume
//!
//! The volume is a cube split into a fixed stack of levels. Level 0 is a single
//! tile of `levels[0]³` cells; every cell of a level-`l` tile is either a leaf
//! (empty or solid) or subdivided into a level-`l + 1` tile of `levels[l + 1]³`
//! cells. Tiles of each level live in an append-only arena and parents refer to
//! children by arena index, so the whole structure is plain data.
//!
//! Cell codes:
//!
//! * `0x0000`: empty leaf
//! * `0xFFFF`: solid leaf
//! * `0x8000 | i`: subdivided, `i` indexes the tile's `children`
//!
//! A [`VoxelIndex`] addresses a cell by packing one 16-bit tile-local index per
//! level, the finest level in the low bits. Levels below the addressed cell hold
//! `0xFFFF`.

use glam::Vec3;

use navkit_common::{Aabb, Error, Result};

use crate::voxelizer::{CellState, Voxelizer};

/// Code of an empty leaf cell
pub const EMPTY_CELL: u16 = 0x0000;
/// Code of a solid leaf cell
pub const SOLID_CELL: u16 = 0xFFFF;
const SUBDIVIDED: u16 = 0x8000;
const LEVEL_NONE: u16 = 0xFFFF;

/// Most levels a voxel index can address
pub const MAX_LEVELS: usize = 4;
/// Largest number of cells per axis of one tile
pub const MAX_LEVEL_SIZE: usize = 16;

#[inline]
fn is_subdivided(code: u16) -> bool {
    code != SOLID_CELL && code & SUBDIVIDED != 0
}

/// Packed address of one cell of a [`VoxelMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoxelIndex(pub u64);

impl VoxelIndex {
    /// Address of nothing
    pub const NONE: VoxelIndex = VoxelIndex(u64::MAX);

    #[inline]
    fn shift(level: usize, nlevels: usize) -> u32 {
        16 * (nlevels - 1 - level) as u32
    }

    /// Tile-local index at `level`, `None` when the address stops above it
    #[inline]
    pub fn level(self, level: usize, nlevels: usize) -> Option<u16> {
        let v = (self.0 >> Self::shift(level, nlevels)) as u16;
        (v != LEVEL_NONE).then_some(v)
    }

    #[inline]
    fn with_level(self, level: usize, nlevels: usize, local: u16) -> Self {
        let shift = Self::shift(level, nlevels);
        VoxelIndex((self.0 & !(0xffffu64 << shift)) | ((local as u64) << shift))
    }

    /// Number of levels the address spans
    pub fn depth(self, nlevels: usize) -> usize {
        (0..nlevels).take_while(|&l| self.level(l, nlevels).is_some()).count()
    }
}

/// One tile of cell codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelTile {
    /// Cell codes indexed `(y * n + x) * n + z`
    pub cells: Vec<u16>,
    /// Arena indices of the child tiles at the next level
    pub children: Vec<u32>,
}

impl VoxelTile {
    fn filled(n: usize, code: u16) -> Self {
        Self {
            cells: vec![code; n * n * n],
            children: Vec::new(),
        }
    }

    /// Drops a child slot, shifting the codes of the cells behind it
    fn remove_slot(&mut self, slot: u16) {
        if (slot as usize) >= self.children.len() {
            return;
        }
        self.children.remove(slot as usize);
        for code in &mut self.cells {
            if is_subdivided(*code) && (*code & !SUBDIVIDED) > slot {
                *code -= 1;
            }
        }
    }

    /// Arena index of the child tile of a subdivided cell code
    pub fn child(&self, code: u16) -> Option<u32> {
        if is_subdivided(code) {
            self.children.get((code & !SUBDIVIDED) as usize).copied()
        } else {
            None
        }
    }
}

/// Octree content below one root cell, built independently and merged later
#[derive(Debug, Clone)]
pub struct VoxelSubtree {
    cell: [usize; 3],
    code: u16,
    /// Tiles per level, level 0 unused
    tiles: Vec<Vec<VoxelTile>>,
}

impl VoxelSubtree {
    /// Root cell the subtree replaces
    pub fn cell(&self) -> [usize; 3] {
        self.cell
    }

    pub fn is_empty(&self) -> bool {
        self.code == EMPTY_CELL
    }
}

/// Sparse voxel volume
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelMap {
    origin: Vec3,
    voxel_size: f32,
    levels: Vec<usize>,
    tiles: Vec<Vec<VoxelTile>>,
}

fn validate_levels(levels: &[usize], voxel_size: f32) -> Result<()> {
    if levels.is_empty() || levels.len() > MAX_LEVELS {
        return Err(Error::InvalidMesh(format!(
            "Voxel map needs 1 to {} levels, got {}",
            MAX_LEVELS,
            levels.len()
        )));
    }
    if let Some(&bad) = levels
        .iter()
        .find(|&&n| n < 2 || n > MAX_LEVEL_SIZE || !n.is_power_of_two())
    {
        return Err(Error::InvalidMesh(format!(
            "Voxel level size {} must be a power of two between 2 and {}",
            bad, MAX_LEVEL_SIZE
        )));
    }
    if !(voxel_size > 0.0) {
        return Err(Error::InvalidMesh(format!("Invalid voxel size {}", voxel_size)));
    }
    Ok(())
}

/// Builds the tile for the cells of `mips[level - first]` starting at `base`,
/// recursing into mixed cells. Returns the arena index of the new tile.
fn build_tile(
    levels: &[usize],
    mips: &[&Voxelizer],
    first: usize,
    level: usize,
    base: [usize; 3],
    arenas: &mut [Vec<VoxelTile>],
) -> Result<u32> {
    let n = levels[level];
    let mip = mips[level - first];
    let mut tile = VoxelTile::filled(n, EMPTY_CELL);

    for y in 0..n {
        for x in 0..n {
            for z in 0..n {
                let (gx, gy, gz) = (base[0] + x, base[1] + y, base[2] + z);
                let code = match mip.cell_state(gx, gy, gz) {
                    CellState::Empty => EMPTY_CELL,
                    CellState::Solid => SOLID_CELL,
                    CellState::Mixed if level + 1 < levels.len() => {
                        let m = levels[level + 1];
                        let child = build_tile(levels, mips, first, level + 1, [gx * m, gy * m, gz * m], arenas)?;
                        tile.children.push(child);
                        SUBDIVIDED | (tile.children.len() - 1) as u16
                    }
                    // Finest grids never report mixed cells
                    CellState::Mixed => SOLID_CELL,
                };
                tile.cells[(y * n + x) * n + z] = code;
            }
        }
    }

    let arena = &mut arenas[level];
    arena.push(tile);
    Ok((arena.len() - 1) as u32)
}

/// Downsamples `finest` into one grid per level from `first` down to the finest
fn build_mips(levels: &[usize], first: usize, finest: &Voxelizer) -> Result<Vec<Voxelizer>> {
    let mut coarse: Vec<Voxelizer> = Vec::with_capacity(levels.len() - first);
    for level in (first..levels.len() - 1).rev() {
        let f = levels[level + 1];
        let finer = coarse.last().unwrap_or(finest);
        let mip = finer.downsample(f, f, f)?;
        coarse.push(mip);
    }
    coarse.reverse();
    Ok(coarse)
}

impl VoxelMap {
    /// Creates an all-empty volume with its minimum corner at `origin`
    pub fn new(origin: Vec3, voxel_size: f32, levels: &[usize]) -> Result<Self> {
        validate_levels(levels, voxel_size)?;
        let mut tiles = vec![Vec::new(); levels.len()];
        tiles[0].push(VoxelTile::filled(levels[0], EMPTY_CELL));
        Ok(Self {
            origin,
            voxel_size,
            levels: levels.to_vec(),
            tiles,
        })
    }

    /// Reassembles a volume from its parts, checking every child reference
    pub fn from_parts(origin: Vec3, voxel_size: f32, levels: Vec<usize>, tiles: Vec<Vec<VoxelTile>>) -> Result<Self> {
        validate_levels(&levels, voxel_size)?;
        if tiles.len() != levels.len() || tiles[0].len() != 1 {
            return Err(Error::Format("Voxel map needs exactly one root tile per volume".to_string()));
        }
        for (level, arena) in tiles.iter().enumerate() {
            let n = levels[level];
            for tile in arena {
                if tile.cells.len() != n * n * n {
                    return Err(Error::Format(format!("Voxel tile at level {} has {} cells", level, tile.cells.len())));
                }
                for &code in tile.cells.iter().filter(|&&c| is_subdivided(c)) {
                    let child = tile.child(code);
                    let valid = level + 1 < levels.len()
                        && child.is_some_and(|c| (c as usize) < tiles[level + 1].len());
                    if !valid {
                        return Err(Error::Format(format!(
                            "Voxel tile at level {} has a dangling subdivision {:#06x}",
                            level, code
                        )));
                    }
                }
            }
        }
        Ok(Self {
            origin,
            voxel_size,
            levels,
            tiles,
        })
    }

    /// Builds the volume from a grid covering all of it at the finest resolution
    pub fn build(origin: Vec3, voxel_size: f32, levels: &[usize], finest: &Voxelizer) -> Result<Self> {
        validate_levels(levels, voxel_size)?;
        let total: usize = levels.iter().product();
        if finest.dims() != [total; 3] {
            return Err(Error::InvalidMesh(format!(
                "Voxel grid {:?} does not match a volume of {} voxels per axis",
                finest.dims(),
                total
            )));
        }

        let coarse = build_mips(levels, 0, finest)?;
        let mips: Vec<&Voxelizer> = coarse.iter().chain(std::iter::once(finest)).collect();
        let mut tiles = vec![Vec::new(); levels.len()];
        build_tile(levels, &mips, 0, 0, [0; 3], &mut tiles)?;
        Ok(Self {
            origin,
            voxel_size,
            levels: levels.to_vec(),
            tiles,
        })
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    /// Edge length of a finest level voxel
    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    /// Cells per axis of the tiles of each level, coarsest first
    pub fn levels(&self) -> &[usize] {
        &self.levels
    }

    /// Tile arenas, one per level
    pub fn tiles(&self) -> &[Vec<VoxelTile>] {
        &self.tiles
    }

    pub fn root(&self) -> &VoxelTile {
        &self.tiles[0][0]
    }

    /// Number of voxels per axis at the given depth (1 = root level cells)
    pub fn resolution(&self, depth: usize) -> usize {
        self.levels[..depth].iter().product()
    }

    /// Edge length of a cell at `level`
    pub fn cell_size(&self, level: usize) -> f32 {
        self.voxel_size * self.levels[level + 1..].iter().product::<usize>() as f32
    }

    pub fn bounds(&self) -> Aabb {
        let size = self.voxel_size * self.resolution(self.levels.len()) as f32;
        Aabb::new(self.origin, self.origin + Vec3::splat(size))
    }

    /// Walks from the root towards the cell at `coords` (in units of cells at
    /// `depth`), stopping at the first leaf. Returns the address, its depth and the
    /// code of the cell reached.
    pub(crate) fn descend(&self, coords: [usize; 3], depth: usize) -> (VoxelIndex, usize, u16) {
        let nlevels = self.levels.len();
        let mut index = VoxelIndex::NONE;
        let mut tile = &self.tiles[0][0];
        let mut code = EMPTY_CELL;
        for level in 0..depth {
            let n = self.levels[level];
            let div: usize = self.levels[level + 1..depth].iter().product();
            let [x, y, z] = coords.map(|c| (c / div) % n);
            let local = (y * n + x) * n + z;
            index = index.with_level(level, nlevels, local as u16);
            code = tile.cells[local];
            let child = match tile.child(code) {
                Some(child) if level + 1 < depth => child,
                _ => return (index, level + 1, code),
            };
            tile = &self.tiles[level + 1][child as usize];
        }
        (index, depth, code)
    }

    /// Finest level voxel coordinates of a world position
    pub(crate) fn finest_coords(&self, p: Vec3) -> Option<[usize; 3]> {
        let total = self.resolution(self.levels.len()) as i64;
        let rel = (p - self.origin) / self.voxel_size;
        let coords = [rel.x, rel.y, rel.z].map(|c| c.floor() as i64);
        coords
            .iter()
            .all(|&c| (0..total).contains(&c))
            .then(|| coords.map(|c| c as usize))
    }

    /// Leaf containing a world position, `None` outside the volume
    pub fn find_leaf(&self, p: Vec3) -> Option<VoxelIndex> {
        let coords = self.finest_coords(p)?;
        Some(self.descend(coords, self.levels.len()).0)
    }

    /// Cell code at an address, `None` for malformed addresses
    pub fn code(&self, index: VoxelIndex) -> Option<u16> {
        let nlevels = self.levels.len();
        let mut tile = &self.tiles[0][0];
        let mut code = None;
        for level in 0..nlevels {
            let Some(local) = index.level(level, nlevels) else {
                break;
            };
            if let Some(prev) = code {
                tile = &self.tiles[level][tile.child(prev)? as usize];
            }
            code = Some(*tile.cells.get(local as usize)?);
        }
        code
    }

    /// Whether the addressed cell is an empty leaf.
    ///
    /// Addresses that stop at a subdivided cell or continue below a leaf are treated
    /// as not empty.
    pub fn is_empty(&self, index: VoxelIndex) -> bool {
        let nlevels = self.levels.len();
        let mut tile = &self.tiles[0][0];
        for level in 0..nlevels {
            let Some(local) = index.level(level, nlevels) else {
                return false;
            };
            let Some(&code) = tile.cells.get(local as usize) else {
                return false;
            };
            match tile.child(code) {
                Some(child) => tile = &self.tiles[level + 1][child as usize],
                None => {
                    let deeper = level + 1 < nlevels && index.level(level + 1, nlevels).is_some();
                    return code == EMPTY_CELL && !deeper;
                }
            }
        }
        false
    }

    /// Depth and coordinates (in cells of that depth) of an address
    pub fn index_coords(&self, index: VoxelIndex) -> Option<(usize, [usize; 3])> {
        let nlevels = self.levels.len();
        let depth = index.depth(nlevels);
        if depth == 0 {
            return None;
        }
        let mut coords = [0usize; 3];
        for level in 0..depth {
            let n = self.levels[level];
            let local = index.level(level, nlevels)? as usize;
            if local >= n * n * n {
                return None;
            }
            let (y, x, z) = (local / (n * n), (local / n) % n, local % n);
            coords = [coords[0] * n + x, coords[1] * n + y, coords[2] * n + z];
        }
        Some((depth, coords))
    }

    /// World bounds of an addressed cell
    pub fn voxel_bounds(&self, index: VoxelIndex) -> Option<Aabb> {
        let (depth, coords) = self.index_coords(index)?;
        let size = self.cell_size(depth - 1);
        let min = self.origin + Vec3::new(coords[0] as f32, coords[1] as f32, coords[2] as f32) * size;
        Some(Aabb::new(min, min + Vec3::splat(size)))
    }

    pub fn voxel_center(&self, index: VoxelIndex) -> Option<Vec3> {
        self.voxel_bounds(index).map(|b| b.center())
    }

    /// Calls `f` with every empty leaf sharing a face with the leaf at `index`.
    ///
    /// Moving along an axis may reach a cell at the same level, a coarser leaf when
    /// the neighbour was never subdivided, or every empty leaf on the facing side of
    /// a more finely subdivided neighbour.
    pub fn for_each_empty_neighbour(&self, index: VoxelIndex, mut f: impl FnMut(VoxelIndex)) {
        let Some((depth, coords)) = self.index_coords(index) else {
            return;
        };
        let res = self.resolution(depth) as i64;

        for axis in 0..3 {
            for step in [-1i64, 1] {
                let c = coords[axis] as i64 + step;
                if c < 0 || c >= res {
                    continue;
                }
                let mut n = coords;
                n[axis] = c as usize;

                let (nindex, ndepth, code) = self.descend(n, depth);
                if code == EMPTY_CELL {
                    f(nindex);
                    continue;
                }
                if ndepth < depth || !is_subdivided(code) {
                    continue;
                }
                // Same-level neighbour is subdivided: visit its facing side
                if let Some(tile) = self.tile_of(nindex, ndepth) {
                    let side = if step > 0 { 0 } else { usize::MAX };
                    self.visit_face(ndepth, tile, nindex, axis, side, &mut f);
                }
            }
        }
    }

    /// Arena index of the child tile below the subdivided cell at `index`
    fn tile_of(&self, index: VoxelIndex, depth: usize) -> Option<u32> {
        let nlevels = self.levels.len();
        let mut tile = &self.tiles[0][0];
        for level in 0..depth {
            let local = index.level(level, nlevels)? as usize;
            let child = tile.child(*tile.cells.get(local)?)?;
            if level + 1 == depth {
                return Some(child);
            }
            tile = &self.tiles[level + 1][child as usize];
        }
        None
    }

    fn visit_face(
        &self,
        level: usize,
        tile_index: u32,
        base: VoxelIndex,
        axis: usize,
        side: usize,
        f: &mut impl FnMut(VoxelIndex),
    ) {
        let nlevels = self.levels.len();
        let n = self.levels[level];
        let tile = &self.tiles[level][tile_index as usize];
        let fixed = side.min(n - 1);
        for a in 0..n {
            for b in 0..n {
                let mut xyz = [a, a, a];
                xyz[axis] = fixed;
                xyz[(axis + 1) % 3] = a;
                xyz[(axis + 2) % 3] = b;
                let local = (xyz[1] * n + xyz[0]) * n + xyz[2];
                let index = base.with_level(level, nlevels, local as u16);
                let code = tile.cells[local];
                if code == EMPTY_CELL {
                    f(index);
                } else if let Some(child) = tile.child(code) {
                    if level + 1 < nlevels {
                        self.visit_face(level + 1, child, index, axis, side, f);
                    }
                }
            }
        }
    }

    /// Walks the leaves crossed by the segment `from -> to` in order.
    ///
    /// `visit` receives every leaf address and whether it is empty, and stops the walk
    /// by returning false. Returns false when stopped or when the segment leaves the
    /// volume.
    pub fn walk_line(&self, from: Vec3, to: Vec3, mut visit: impl FnMut(VoxelIndex, bool) -> bool) -> bool {
        let nlevels = self.levels.len();
        let d = to - from;
        let len = d.length();
        let eps = if len > 0.0 { self.voxel_size * 1e-3 / len } else { 0.0 };

        let mut t = 0.0f32;
        loop {
            let p = from + d * t;
            let Some(coords) = self.finest_coords(p) else {
                return false;
            };
            let (index, depth, code) = self.descend(coords, nlevels);
            if !visit(index, code == EMPTY_CELL) {
                return false;
            }
            if len == 0.0 {
                return true;
            }

            let size = self.cell_size(depth - 1);
            let div = self.levels[depth..].iter().product::<usize>();
            let cell = coords.map(|c| (c / div) as f32);
            let min = self.origin + Vec3::new(cell[0], cell[1], cell[2]) * size;
            let max = min + Vec3::splat(size);

            let mut t_exit = f32::MAX;
            for axis in 0..3 {
                let (da, fa) = (d[axis], from[axis]);
                if da > 0.0 {
                    t_exit = t_exit.min((max[axis] - fa) / da);
                } else if da < 0.0 {
                    t_exit = t_exit.min((min[axis] - fa) / da);
                }
            }
            if t_exit >= 1.0 {
                return true;
            }
            t = t_exit.max(t) + eps;
            if t >= 1.0 {
                // Segment ends within a hair of the boundary; visit the last leaf
                let Some(coords) = self.finest_coords(to) else {
                    return false;
                };
                let (index, _, code) = self.descend(coords, nlevels);
                return visit(index, code == EMPTY_CELL);
            }
        }
    }

    /// Leaves crossed by the segment, consecutive duplicates removed
    pub fn voxels_in_line(&self, from: Vec3, to: Vec3) -> Vec<VoxelIndex> {
        let mut out: Vec<VoxelIndex> = Vec::new();
        self.walk_line(from, to, |index, _| {
            if out.last() != Some(&index) {
                out.push(index);
            }
            true
        });
        out
    }

    /// True when every leaf crossed by the segment is empty
    pub fn line_of_sight(&self, from: Vec3, to: Vec3) -> bool {
        self.walk_line(from, to, |_, empty| empty)
    }

    /// Calls `f` with every leaf of the volume
    pub fn for_each_leaf(&self, mut f: impl FnMut(VoxelIndex, u16)) {
        self.visit_leaves(0, 0, VoxelIndex::NONE, &mut f);
    }

    fn visit_leaves(&self, level: usize, tile_index: u32, base: VoxelIndex, f: &mut impl FnMut(VoxelIndex, u16)) {
        let nlevels = self.levels.len();
        let tile = &self.tiles[level][tile_index as usize];
        for (local, &code) in tile.cells.iter().enumerate() {
            let index = base.with_level(level, nlevels, local as u16);
            match tile.child(code) {
                Some(child) if level + 1 < nlevels => self.visit_leaves(level + 1, child, index, f),
                _ => f(index, code),
            }
        }
    }

    /// Number of tiles reachable from the root
    pub fn tile_count(&self) -> usize {
        fn count(map: &VoxelMap, level: usize, tile: u32) -> usize {
            let t = &map.tiles[level][tile as usize];
            1 + t
                .cells
                .iter()
                .filter_map(|&code| t.child(code))
                .map(|c| count(map, level + 1, c))
                .sum::<usize>()
        }
        count(self, 0, 0)
    }

    /// World bounds of a root level cell
    pub fn root_cell_bounds(&self, cell: [usize; 3]) -> Aabb {
        let size = self.cell_size(0);
        let min = self.origin + Vec3::new(cell[0] as f32, cell[1] as f32, cell[2] as f32) * size;
        Aabb::new(min, min + Vec3::splat(size))
    }

    /// Empty finest resolution grid covering one root level cell
    pub fn root_cell_voxelizer(&self, cell: [usize; 3]) -> Result<Voxelizer> {
        let n: usize = self.levels[1..].iter().product();
        Voxelizer::new(self.root_cell_bounds(cell).min, self.voxel_size, [n; 3])
    }

    /// Builds the content of one root level cell from its finest grid
    pub fn build_subtree(&self, cell: [usize; 3], finest: &Voxelizer) -> Result<VoxelSubtree> {
        let n: usize = self.levels[1..].iter().product();
        if finest.dims() != [n; 3] {
            return Err(Error::InvalidMesh(format!(
                "Voxel grid {:?} does not cover a root cell of {} voxels per axis",
                finest.dims(),
                n
            )));
        }

        let mut tiles = vec![Vec::new(); self.levels.len()];
        let coarse = build_mips(&self.levels, 1, finest)?;
        let mips: Vec<&Voxelizer> = coarse.iter().chain(std::iter::once(finest)).collect();
        let state = match mips.first() {
            Some(top) if self.levels.len() > 1 => {
                let m = self.levels[1];
                top.downsample(m, m, m)?.cell_state(0, 0, 0)
            }
            _ => finest.cell_state(0, 0, 0),
        };

        let code = match state {
            CellState::Empty => EMPTY_CELL,
            CellState::Solid => SOLID_CELL,
            CellState::Mixed => {
                build_tile(&self.levels, &mips, 1, 1, [0; 3], &mut tiles)?;
                SUBDIVIDED
            }
        };
        Ok(VoxelSubtree { cell, code, tiles })
    }

    /// Replaces the content of a root level cell. Tiles of a replaced subtree stay
    /// in the arenas until [`VoxelMap::compact`] runs.
    pub fn merge_subtree(&mut self, subtree: VoxelSubtree) {
        let n = self.levels[0];
        let [x, y, z] = subtree.cell;
        let local = (y * n + x) * n + z;

        if !is_subdivided(subtree.code) {
            let root = &mut self.tiles[0][0];
            let old = std::mem::replace(&mut root.cells[local], subtree.code);
            if is_subdivided(old) {
                root.remove_slot(old & !SUBDIVIDED);
            }
            return;
        }

        let offsets: Vec<u32> = self.tiles.iter().map(|a| a.len() as u32).collect();
        for (level, arena) in subtree.tiles.into_iter().enumerate().skip(1) {
            for mut tile in arena {
                if level + 1 < offsets.len() {
                    for child in &mut tile.children {
                        *child += offsets[level + 1];
                    }
                }
                self.tiles[level].push(tile);
            }
        }

        let root = &mut self.tiles[0][0];
        let child = offsets[1];
        let old = root.cells[local];
        if is_subdivided(old) {
            let slot = (old & !SUBDIVIDED) as usize;
            root.children[slot] = child;
        } else {
            root.children.push(child);
            root.cells[local] = SUBDIVIDED | (root.children.len() - 1) as u16;
        }
    }

    /// Drops tiles no longer reachable from the root.
    ///
    /// Child slots are renumbered in cell order, so a compacted map only holds
    /// children that some cell refers to.
    pub fn compact(&mut self) {
        fn copy(old: &[Vec<VoxelTile>], new: &mut [Vec<VoxelTile>], level: usize, index: u32) -> u32 {
            let source = &old[level][index as usize];
            let mut tile = VoxelTile {
                cells: source.cells.clone(),
                children: Vec::new(),
            };
            for code in &mut tile.cells {
                if let Some(child) = source.child(*code) {
                    let copied = copy(old, new, level + 1, child);
                    *code = SUBDIVIDED | tile.children.len() as u16;
                    tile.children.push(copied);
                }
            }
            new[level].push(tile);
            (new[level].len() - 1) as u32
        }
        let mut tiles = vec![Vec::new(); self.levels.len()];
        copy(&self.tiles, &mut tiles, 0, 0);
        self.tiles = tiles;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8 unit volume of levels [2, 2, 2] with the given finest voxels solid
    fn map_with(solid: &[[usize; 3]]) -> VoxelMap {
        let mut grid = Voxelizer::new(Vec3::ZERO, 1.0, [8, 8, 8]).unwrap();
        for &[x, y, z] in solid {
            grid.set_solid(x, y, z);
        }
        VoxelMap::build(Vec3::ZERO, 1.0, &[2, 2, 2], &grid).unwrap()
    }

    #[test]
    fn test_index_packing() {
        let index = VoxelIndex::NONE.with_level(0, 3, 5).with_level(1, 3, 7);
        assert_eq!(index.level(0, 3), Some(5));
        assert_eq!(index.level(1, 3), Some(7));
        assert_eq!(index.level(2, 3), None);
        assert_eq!(index.depth(3), 2);
        // Finest level in the low bits
        assert_eq!(index.0 & 0xffff, 0xffff);
    }

    #[test]
    fn test_empty_map_is_a_single_coarse_leaf_per_root_cell() {
        let map = map_with(&[]);
        assert_eq!(map.tile_count(), 1);
        let leaf = map.find_leaf(Vec3::new(1.0, 1.0, 1.0)).unwrap();
        assert_eq!(leaf.depth(3), 1);
        assert!(map.is_empty(leaf));
        let bounds = map.voxel_bounds(leaf).unwrap();
        assert_eq!(bounds.min, Vec3::ZERO);
        assert_eq!(bounds.max, Vec3::splat(4.0));
        assert!(map.find_leaf(Vec3::new(8.5, 1.0, 1.0)).is_none());
    }

    #[test]
    fn test_subdivides_only_mixed_cells() {
        let map = map_with(&[[5, 6, 1]]);
        // Root, one level 1 tile and one level 2 tile
        assert_eq!(map.tile_count(), 3);
        let solid = map.find_leaf(Vec3::new(5.5, 6.5, 1.5)).unwrap();
        assert_eq!(solid.depth(3), 3);
        assert!(!map.is_empty(solid));
        assert_eq!(map.code(solid), Some(SOLID_CELL));
        let b = map.voxel_bounds(solid).unwrap();
        assert_eq!(b.min, Vec3::new(5.0, 6.0, 1.0));

        let sibling = map.find_leaf(Vec3::new(4.5, 6.5, 1.5)).unwrap();
        assert_eq!(sibling.depth(3), 3);
        assert!(map.is_empty(sibling));

        let coarse = map.find_leaf(Vec3::new(1.0, 1.0, 1.0)).unwrap();
        assert_eq!(coarse.depth(3), 1);
    }

    #[test]
    fn test_is_empty_is_conservative_for_partial_addresses() {
        let map = map_with(&[[0, 0, 0]]);
        let fine = map.find_leaf(Vec3::new(0.5, 0.5, 0.5)).unwrap();
        // Stopping at the subdivided root cell is not empty
        let partial = VoxelIndex(fine.0 | 0xffff_ffff);
        assert_eq!(partial.depth(3), 1);
        assert!(!map.is_empty(partial));

        // Continuing below an empty leaf is not empty either
        let coarse = map.find_leaf(Vec3::new(7.0, 7.0, 7.0)).unwrap();
        let too_deep = coarse.with_level(1, 3, 0).with_level(2, 3, 0);
        assert!(map.is_empty(coarse));
        assert!(!map.is_empty(too_deep));
    }

    #[test]
    fn test_neighbours_cross_levels() {
        let map = map_with(&[[3, 0, 0]]);
        // Fine empty leaf next to the solid voxel, neighbours to +x are coarse
        let fine = map.find_leaf(Vec3::new(3.5, 1.5, 0.5)).unwrap();
        let mut found = Vec::new();
        map.for_each_empty_neighbour(fine, |n| found.push(n));
        let coarse = map.find_leaf(Vec3::new(5.0, 1.5, 0.5)).unwrap();
        assert_eq!(coarse.depth(3), 1);
        assert!(found.contains(&coarse));
        // The solid voxel below is never reported
        let solid = map.find_leaf(Vec3::new(3.5, 0.5, 0.5)).unwrap();
        assert!(!found.contains(&solid));

        // From the coarse leaf, -x reaches every empty fine leaf on the facing side
        let mut from_coarse = Vec::new();
        map.for_each_empty_neighbour(coarse, |n| from_coarse.push(n));
        let facing: Vec<VoxelIndex> = from_coarse
            .iter()
            .copied()
            .filter(|&n| map.voxel_bounds(n).map(|b| b.max.x) == Some(4.0))
            .collect();
        // x = 3 face of the subdivided root cell: 16 finest slots, one solid, three
        // 2x2 blocks stay at level 1
        assert!(facing.contains(&fine));
        assert!(!facing.contains(&solid));
        let area: f32 = facing
            .iter()
            .map(|&n| {
                let b = map.voxel_bounds(n).unwrap();
                (b.max.y - b.min.y) * (b.max.z - b.min.z)
            })
            .sum();
        assert_eq!(area, 15.0);
    }

    #[test]
    fn test_line_of_sight() {
        let map = map_with(&[[4, 4, 4]]);
        assert!(map.line_of_sight(Vec3::new(0.5, 0.5, 0.5), Vec3::new(7.5, 0.5, 7.5)));
        assert!(!map.line_of_sight(Vec3::new(0.5, 4.5, 4.5), Vec3::new(7.5, 4.5, 4.5)));
        // Leaving the volume blocks sight
        assert!(!map.line_of_sight(Vec3::new(0.5, 0.5, 0.5), Vec3::new(9.0, 0.5, 0.5)));

        let line = map.voxels_in_line(Vec3::new(0.5, 4.5, 4.5), Vec3::new(7.5, 4.5, 4.5));
        let solid = map.find_leaf(Vec3::new(4.5, 4.5, 4.5)).unwrap();
        assert!(line.contains(&solid));
        assert_eq!(line.first(), map.find_leaf(Vec3::new(0.5, 4.5, 4.5)).as_ref());
        assert_eq!(line.last(), map.find_leaf(Vec3::new(7.5, 4.5, 4.5)).as_ref());
    }

    #[test]
    fn test_subtree_merge_matches_full_build() {
        let solid = [[5, 6, 1], [0, 0, 0], [1, 0, 0]];
        let full = map_with(&solid);

        let mut merged = VoxelMap::new(Vec3::ZERO, 1.0, &[2, 2, 2]).unwrap();
        for y in 0..2 {
            for x in 0..2 {
                for z in 0..2 {
                    let cell = [x, y, z];
                    let mut grid = merged.root_cell_voxelizer(cell).unwrap();
                    for &[sx, sy, sz] in &solid {
                        if [sx / 4, sy / 4, sz / 4] == cell {
                            grid.set_solid(sx % 4, sy % 4, sz % 4);
                        }
                    }
                    let subtree = merged.build_subtree(cell, &grid).unwrap();
                    merged.merge_subtree(subtree);
                }
            }
        }

        let mut a = Vec::new();
        full.for_each_leaf(|i, c| a.push((i, c)));
        let mut b = Vec::new();
        merged.for_each_leaf(|i, c| b.push((i, c)));
        a.sort();
        b.sort();
        assert_eq!(a, b);

        // Replacing a cell orphans its old tiles until compaction
        let cell = [1, 1, 0];
        let grid = merged.root_cell_voxelizer(cell).unwrap();
        let subtree = merged.build_subtree(cell, &grid).unwrap();
        assert!(subtree.is_empty());
        let subdivided_before = merged.root().children.len();
        merged.merge_subtree(subtree);
        let root = merged.root();
        assert_eq!(root.children.len(), subdivided_before - 1);
        assert_eq!(root.cells.iter().filter(|&&c| root.child(c).is_some()).count(), root.children.len());
        assert!(merged.tiles().iter().map(Vec::len).sum::<usize>() > merged.tile_count());
        merged.compact();
        assert_eq!(merged.tiles().iter().map(Vec::len).sum::<usize>(), merged.tile_count());
        assert!(merged.is_empty(merged.find_leaf(Vec3::new(5.5, 6.5, 1.5)).unwrap()));
        assert!(!merged.is_empty(merged.find_leaf(Vec3::new(0.5, 0.5, 0.5)).unwrap()));
    }

    #[test]
    fn test_compact_renumbers_child_slots() {
        let mut map = map_with(&[[0, 0, 0], [5, 0, 0], [0, 5, 5]]);
        assert_eq!(map.root().children.len(), 3);

        // Clearing the first subdivided cell shifts the slots behind it
        let cell = [0, 0, 0];
        let cleared = map.build_subtree(cell, &map.root_cell_voxelizer(cell).unwrap()).unwrap();
        map.merge_subtree(cleared);
        let codes: Vec<u16> = map.root().cells.iter().copied().filter(|&c| is_subdivided(c)).collect();
        assert_eq!(codes, vec![SUBDIVIDED, SUBDIVIDED | 1]);

        let before = {
            let mut leaves = Vec::new();
            map.for_each_leaf(|i, c| leaves.push((i, c)));
            leaves
        };
        map.compact();
        let mut after = Vec::new();
        map.for_each_leaf(|i, c| after.push((i, c)));
        assert_eq!(before, after);
        assert_eq!(map.tiles()[1].len(), 2);
    }

    #[test]
    fn test_from_parts_rejects_dangling_children() {
        let map = map_with(&[[0, 0, 0]]);
        let mut tiles = map.tiles().to_vec();
        tiles[1].clear();
        assert!(VoxelMap::from_parts(map.origin(), 1.0, map.levels().to_vec(), tiles).is_err());
        let ok = VoxelMap::from_parts(map.origin(), 1.0, map.levels().to_vec(), map.tiles().to_vec()).unwrap();
        assert_eq!(ok, map);
    }
}
