//! Dense voxel grids fed by the rasterizer
//!
//! A [`Voxelizer`] is a bit grid over a box of cubic cells. The finest grid only
//! stores solid bits. Coarser grids are produced by [`Voxelizer::downsample`] and
//! carry both a solid bit (some child was solid) and an empty bit (some child was
//! empty), so a coarse cell can be fully empty, fully solid or mixed.

use glam::Vec3;

use navkit_common::{Aabb, Error, Result};
use navkit_recast::SolidGrid;

/// Occupancy of one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Empty,
    Solid,
    /// Partly solid; only coarse grids have mixed cells
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BitGrid {
    words: Vec<u64>,
}

impl BitGrid {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
        }
    }

    #[inline]
    fn get(&self, i: usize) -> bool {
        self.words[i >> 6] & (1u64 << (i & 63)) != 0
    }

    #[inline]
    fn set(&mut self, i: usize) {
        self.words[i >> 6] |= 1u64 << (i & 63);
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Dense occupancy grid indexed `(y, x, z)`
#[derive(Debug, Clone, PartialEq)]
pub struct Voxelizer {
    origin: Vec3,
    voxel_size: f32,
    dims: [usize; 3],
    solid: BitGrid,
    /// `None` for a finest grid, where empty is the complement of solid
    empty: Option<BitGrid>,
}

impl Voxelizer {
    /// Creates an all-empty grid of `dims` (x, y, z) cells
    pub fn new(origin: Vec3, voxel_size: f32, dims: [usize; 3]) -> Result<Self> {
        if !(voxel_size > 0.0) || dims.iter().any(|&d| d == 0) {
            return Err(Error::InvalidMesh(format!(
                "Invalid voxel grid {:?} with voxel size {}",
                dims, voxel_size
            )));
        }
        let len = dims[0] * dims[1] * dims[2];
        Ok(Self {
            origin,
            voxel_size,
            dims,
            solid: BitGrid::new(len),
            empty: None,
        })
    }

    #[inline]
    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (y * self.dims[0] + x) * self.dims[2] + z
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    /// Cells along x, y and z
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// World bounds of the grid
    pub fn bounds(&self) -> Aabb {
        let size = Vec3::new(self.dims[0] as f32, self.dims[1] as f32, self.dims[2] as f32) * self.voxel_size;
        Aabb::new(self.origin, self.origin + size)
    }

    /// Whether the grid was produced by downsampling
    pub fn is_mip(&self) -> bool {
        self.empty.is_some()
    }

    /// True when the cell contains any solid geometry
    pub fn is_solid(&self, x: usize, y: usize, z: usize) -> bool {
        self.solid.get(self.index(x, y, z))
    }

    /// True when the cell contains any empty space
    pub fn has_empty(&self, x: usize, y: usize, z: usize) -> bool {
        let i = self.index(x, y, z);
        match &self.empty {
            Some(empty) => empty.get(i),
            None => !self.solid.get(i),
        }
    }

    pub fn cell_state(&self, x: usize, y: usize, z: usize) -> CellState {
        match (self.is_solid(x, y, z), self.has_empty(x, y, z)) {
            (true, true) => CellState::Mixed,
            (true, false) => CellState::Solid,
            _ => CellState::Empty,
        }
    }

    /// Number of cells with a solid bit
    pub fn solid_count(&self) -> usize {
        self.solid.count_ones()
    }

    /// Marks a cell solid; out of range cells are ignored
    pub fn set_solid(&mut self, x: usize, y: usize, z: usize) {
        if x < self.dims[0] && y < self.dims[1] && z < self.dims[2] {
            let i = self.index(x, y, z);
            self.solid.set(i);
        }
    }

    /// Reduces the grid by power-of-two factors along x, y and z.
    ///
    /// A coarse cell is solid when any contributing cell is solid and has empty space
    /// when any contributing cell has empty space.
    pub fn downsample(&self, fx: usize, fy: usize, fz: usize) -> Result<Voxelizer> {
        let factors = [fx, fy, fz];
        for (axis, (&f, &d)) in factors.iter().zip(&self.dims).enumerate() {
            if f == 0 || !f.is_power_of_two() || d % f != 0 {
                return Err(Error::InvalidMesh(format!(
                    "Downsample factor {} on axis {} does not divide {} as a power of two",
                    f, axis, d
                )));
            }
        }

        let dims = [self.dims[0] / fx, self.dims[1] / fy, self.dims[2] / fz];
        let len = dims[0] * dims[1] * dims[2];
        let mut coarse = Voxelizer {
            origin: self.origin,
            voxel_size: self.voxel_size * fx as f32,
            dims,
            solid: BitGrid::new(len),
            empty: Some(BitGrid::new(len)),
        };

        for y in 0..self.dims[1] {
            for x in 0..self.dims[0] {
                for z in 0..self.dims[2] {
                    let ci = coarse.index(x / fx, y / fy, z / fz);
                    if self.is_solid(x, y, z) {
                        coarse.solid.set(ci);
                    }
                    if self.has_empty(x, y, z) {
                        if let Some(empty) = coarse.empty.as_mut() {
                            empty.set(ci);
                        }
                    }
                }
            }
        }
        Ok(coarse)
    }
}

impl SolidGrid for Voxelizer {
    fn origin(&self) -> Vec3 {
        self.origin
    }

    fn cell_size(&self) -> f32 {
        self.voxel_size
    }

    fn dims(&self) -> [usize; 3] {
        self.dims
    }

    fn mark_solid(&mut self, x: usize, y: usize, z: usize) {
        self.set_solid(x, y, z);
    }
}
