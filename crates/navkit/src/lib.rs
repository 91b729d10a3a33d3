//! Navigation data for 3D scenes
//!
//! `navkit` turns a [`Scene`] into a [`Navmesh`]: a tiled polygon mesh for
//! walking agents and, when the scene supports flight, a sparse voxel volume for
//! flying ones. Tiles are built in parallel by [`NavmeshBuilder`], published
//! through [`SharedNavmesh`] and persisted with [`Navmesh::save`].
//!
//! ```no_run
//! use glam::{Affine3A, Vec3};
//! use navkit::{BuildSettings, NavmeshBuilder, WalkPathOptions};
//! use navkit_common::{Mesh, MeshPart, MeshType, SceneBuilder};
//!
//! # fn main() -> navkit_common::Result<()> {
//! let scene = SceneBuilder::new()
//!     .add_mesh(Mesh::new("floor", MeshType::AnalyticPlane, vec![MeshPart::plane(5.0, 5.0)]))
//!     .place("floor", 1, Affine3A::IDENTITY)
//!     .build();
//!
//! let builder = NavmeshBuilder::new(BuildSettings::default())?;
//! let (navmesh, report) = builder.build(&scene)?;
//! println!("{} tiles built in {:?}", report.built_tiles, report.elapsed);
//!
//! let path = navmesh.walk_path(
//!     Vec3::new(-4.0, 0.0, -4.0),
//!     Vec3::new(4.0, 0.0, 4.0),
//!     &WalkPathOptions::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod io;
mod query;
mod settings;
mod shared;

pub use builder::{BuildReport, NavmeshBuilder, TileFailure, TileGrid};
pub use io::{NAVMESH_MAGIC, NAVMESH_VERSION};
pub use query::{WalkPath, WalkPathMode, WalkPathOptions};
pub use settings::{BuildSettings, FlightSettings};
pub use shared::SharedNavmesh;

pub use navkit_common::{Error, Result, Scene};
pub use navkit_detour::{NavMesh, PolyRef, QueryFilter};
pub use navkit_voxel::{PathSettings, VoxelMap, VoxelPath};

/// Navigation data of one scene
///
/// A published navmesh is never mutated; incremental rebuilds produce a new value.
#[derive(Debug, Clone)]
pub struct Navmesh {
    /// Customization version the data was built with
    pub customization_version: i32,
    /// Walkable surface
    pub nav_mesh: NavMesh,
    /// Flight volume, absent when the scene does not support flight
    pub voxel_map: Option<VoxelMap>,
}

impl Navmesh {
    pub fn new(customization_version: i32, nav_mesh: NavMesh, voxel_map: Option<VoxelMap>) -> Self {
        Self {
            customization_version,
            nav_mesh,
            voxel_map,
        }
    }

    pub fn supports_flight(&self) -> bool {
        self.voxel_map.is_some()
    }

    /// Number of walkable polygons over all tiles
    pub fn poly_count(&self) -> usize {
        self.nav_mesh.tiles().map(|t| t.ground_poly_count()).sum()
    }
}
