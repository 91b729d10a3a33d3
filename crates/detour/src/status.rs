//! Status codes for navmesh operations

use navkit_common::Error;

/// Outcome of a navmesh operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Operation was successful
    #[default]
    Success,
    /// Operation failed due to an unknown reason
    Failure,
    /// Provided parameter was invalid
    InvalidParam,
    /// Polygon or tile reference is stale or out of range
    InvalidRef,
    /// No polygon found near the query point
    NotFound,
    /// Search ran out of nodes before reaching the goal
    OutOfNodes,
    /// Result did not fit the requested size and was truncated
    BufferTooSmall,
    /// Query did not reach the goal, returning the best guess
    PartialResult,
    /// Tile slots are exhausted
    OutOfTiles,
    /// Tile or polygon does not fit the mesh parameters
    TileOutOfBounds,
    /// Input data is corrupted or invalid
    DataCorrupted,
}

impl Status {
    /// Checks if the status is a failure
    pub fn is_failure(&self) -> bool {
        !matches!(self, Status::Success | Status::PartialResult | Status::BufferTooSmall)
    }

    /// Checks if the status is a success
    pub fn is_success(&self) -> bool {
        !self.is_failure()
    }
}

impl std::error::Error for Status {}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::Failure => write!(f, "Failure"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::InvalidRef => write!(f, "Invalid polygon reference"),
            Status::NotFound => write!(f, "Value not found"),
            Status::OutOfNodes => write!(f, "Out of search nodes"),
            Status::BufferTooSmall => write!(f, "Buffer too small"),
            Status::PartialResult => write!(f, "Partial result"),
            Status::OutOfTiles => write!(f, "Out of tile slots"),
            Status::TileOutOfBounds => write!(f, "Tile out of bounds"),
            Status::DataCorrupted => write!(f, "Data corrupted"),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Detour(status.to_string())
    }
}
