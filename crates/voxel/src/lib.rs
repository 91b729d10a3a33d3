//! Flight volume for navkit
//!
//! Scene geometry is voxelized into dense grids, folded into a sparse
//! multi-level [`VoxelMap`] and searched with [`VoxelPathfinder`], an A*
//! over the empty leaves of the map.

pub mod map;
pub mod nearest;
pub mod pathfind;
pub mod voxelizer;

pub use map::{VoxelIndex, VoxelMap, VoxelSubtree, VoxelTile, EMPTY_CELL, MAX_LEVELS, MAX_LEVEL_SIZE, SOLID_CELL};
pub use nearest::NearestEmpty;
pub use pathfind::{PathSettings, VoxelPath, VoxelPathfinder};
pub use voxelizer::{CellState, Voxelizer};

use navkit_common::{CancellationToken, MeshTypeMask, Result, Scene};

/// Voxelizes the scene geometry inside one root cell of `map` and folds it into
/// a subtree ready for [`VoxelMap::merge_subtree`].
///
/// Only reads `map`, so root cells can be built in parallel.
pub fn build_root_cell(
    map: &VoxelMap,
    cell: [usize; 3],
    scene: &Scene,
    mask: MeshTypeMask,
    cancel: &CancellationToken,
) -> Result<VoxelSubtree> {
    let mut grid = map.root_cell_voxelizer(cell)?;
    let triangles = navkit_recast::voxelize_scene(&mut grid, scene, mask, cancel)?;
    log::trace!(
        "Root cell {:?}: {} triangles, {} solid voxels",
        cell,
        triangles,
        grid.solid_count()
    );
    map.build_subtree(cell, &grid)
}
