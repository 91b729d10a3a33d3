//! Tiled navigation mesh and queries for navkit
//!
//! Tiles produced by the Recast pipeline are converted into [`MeshTile`]s and
//! stitched together by [`NavMesh`], which keeps a link graph between
//! neighbouring polygons, across tile borders and through off-mesh
//! connections. [`NavMeshQuery`] runs searches over that graph.

mod nav_mesh;
mod nav_mesh_builder;
mod nav_mesh_query;
mod node_pool;
mod status;

pub use nav_mesh::{
    decode_poly_ref, encode_poly_ref, BVNode, Link, MeshTile, NavMesh, OffMeshConnection, Poly,
    PolyDetail, TileHeader,
};
pub use nav_mesh_builder::{create_tile, NavMeshCreateParams};
pub use nav_mesh_query::{FindPathOptions, NavMeshQuery, RaycastHit, StraightPath, StraightPathFlags};
pub use status::Status;

use bitflags::bitflags;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Maximum number of vertices per navigation polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Neighbour marker for polygon edges that continue in another tile
pub const DT_EXT_LINK: u16 = 0x8000;
/// Link side of internal and off-mesh links
pub const DT_LINK_INTERNAL: u8 = 0xff;
/// Off-mesh connection flag: traversable both ways
pub const DT_OFFMESH_CON_BIDIR: u8 = 1;

/// Default half extents used to find the polygons under path endpoints
pub const DEFAULT_QUERY_EXTENTS: Vec3 = Vec3::new(5.0, 5.0, 5.0);

/// Reference to a polygon: salt, tile slot and polygon index packed in 64 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PolyRef(u64);

impl PolyRef {
    pub const NULL: PolyRef = PolyRef(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    /// Polygon flags used by query filters
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PolyFlags: u16 {
        /// Ground that can be walked on
        const WALK = 0x01;
        /// Water surface
        const SWIM = 0x02;
        /// Explicit link such as a jump or teleporter
        const JUMP = 0x04;
        /// Temporarily excluded from searches
        const DISABLED = 0x10;
        const ALL = 0xffff;
    }
}

/// Kind of navigation polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PolyType {
    /// Convex polygon on the walkable surface
    #[default]
    Ground,
    /// Two point polygon standing for an off-mesh connection
    OffMeshConnection,
}

/// Layout of the tile grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavMeshParams {
    /// World position of the corner of tile (0, 0)
    pub origin: Vec3,
    pub tile_width: f32,
    pub tile_height: f32,
    pub max_tiles: u32,
    pub max_polys: u32,
}

/// Polygon filter and traversal costs
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    /// Polygons need at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons with any of these flags are skipped
    pub exclude_flags: PolyFlags,
    /// Cost multiplier per area id
    pub area_cost: [f32; 64],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::DISABLED,
            area_cost: [1.0; 64],
        }
    }
}

impl QueryFilter {
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    /// Cost of moving from `pa` to `pb` across `poly`
    pub fn cost(&self, pa: Vec3, pb: Vec3, poly: &Poly) -> f32 {
        pa.distance(pb) * self.area_cost[(poly.area & 0x3f) as usize]
    }
}
