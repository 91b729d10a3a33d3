//! Common types shared by every stage of the navkit pipeline
//!
//! This crate holds the passive geometry model consumed by the builders
//! (`Scene`, `Mesh`, `MeshInstance`, `Primitive`), the error type used across
//! the workspace, and the small pieces of build plumbing (cancellation and
//! progress reporting) that the tile builders and searches poll.

mod cancel;
mod geometry;
mod obj;
mod primitives;
mod scene;

pub use cancel::{BuildProgress, CancellationToken};
pub use geometry::*;
pub use obj::{load_obj_mesh, parse_obj_mesh};
pub use scene::{
    Mesh, MeshInstance, MeshPart, MeshType, MeshTypeMask, OffMeshLink, PrimFlags, Primitive,
    Scene, SceneBuilder,
};

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the navkit crates
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input mesh: {0}")]
    InvalidMesh(String),

    #[error("navigation mesh generation failed: {0}")]
    NavMeshGeneration(String),

    #[error("pathfinding failed: {0}")]
    Pathfinding(String),

    #[error("detour error: {0}")]
    Detour(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid navmesh data: {0}")]
    Format(String),

    #[error("tile ({x}, {z}) failed to build: {reason}")]
    TileBuild { x: i32, z: i32, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// True when the error is the cooperative cancellation outcome rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type for navkit operations
pub type Result<T> = std::result::Result<T, Error>;
