//! Recast tile pipeline for navkit
//!
//! Turns scene geometry into per-tile polygon meshes: triangles are rasterized into a
//! heightfield, filtered, compacted, partitioned into regions, traced into contours and
//! finally triangulated into a convex polygon mesh with an optional detail mesh.

mod area;
mod builder;
mod compact_heightfield;
mod config;
mod context;
mod contour;
mod detail_mesh;
mod distance_field;
mod heightfield;
mod polymesh;
mod rasterization;
mod region;

pub use area::erode_walkable_area;
pub use builder::{TileBuilder, TileMesh, POLY_FLAG_WALK};
pub use compact_heightfield::{CompactCell, CompactHeightfield, CompactSpan};
pub use config::{PartitionType, RecastConfig, TileConfig};
pub use context::{BuildContext, TimerCategory};
pub use contour::{BuildContoursFlags, Contour, ContourSet};
pub use detail_mesh::PolyMeshDetail;
pub use distance_field::build_distance_field;
pub use heightfield::{Heightfield, Span};
pub use polymesh::PolyMesh;
pub use rasterization::{
    classify_triangle, rasterize_scene, rasterize_triangle, split_convex_poly,
    triangle_outcode, voxelize_scene, voxelize_triangle, SolidGrid,
};
pub use region::{build_layer_regions, build_regions_monotone, build_regions_watershed};

/// Area id of spans nothing can stand on
pub const RC_NULL_AREA: u8 = 0;
/// Area id of spans that can be walked on but are not valid landing spots
pub const RC_UNLANDABLE_AREA: u8 = 32;
/// Default area id of walkable spans
pub const RC_WALKABLE_AREA: u8 = 63;

/// Value of a compact span connection that leads nowhere
pub const RC_NOT_CONNECTED: u8 = 0x3f;
/// Largest height a heightfield span can store
pub const RC_SPAN_MAX_HEIGHT: u16 = u16::MAX;

/// Region id flag for spans in the tile border
pub const RC_BORDER_REG: u16 = 0x8000;
/// Region id of polygons built from more than one region
pub const RC_MULTIPLE_REGS: u16 = 0;
/// Contour vertex flag: vertex sits on the tile border and may be removed
pub const RC_BORDER_VERTEX: i32 = 0x10000;
/// Contour vertex flag: edge separates two areas
pub const RC_AREA_BORDER: i32 = 0x20000;
/// Mask of the neighbour region stored in a contour vertex
pub const RC_CONTOUR_REG_MASK: i32 = 0xffff;

/// Null index in polygon mesh vertex/neighbour arrays
pub const MESH_NULL_IDX: u16 = 0xffff;
/// Largest number of vertices a polygon can have
pub const MAX_VERTS_PER_POLY: usize = 6;

/// X offset of a direction (0 = -x, 1 = +z, 2 = +x, 3 = -z)
#[inline]
pub fn dir_offset_x(dir: usize) -> i32 {
    const OFFSET: [i32; 4] = [-1, 0, 1, 0];
    OFFSET[dir & 3]
}

/// Z offset of a direction (0 = -x, 1 = +z, 2 = +x, 3 = -z)
#[inline]
pub fn dir_offset_z(dir: usize) -> i32 {
    const OFFSET: [i32; 4] = [0, 1, 0, -1];
    OFFSET[dir & 3]
}

/// Direction of a unit offset along one axis
#[inline]
pub fn dir_for_offset(x: i32, z: i32) -> usize {
    const DIRS: [usize; 5] = [3, 0, usize::MAX, 2, 1];
    DIRS[(((z + 1) << 1) + x) as usize]
}
