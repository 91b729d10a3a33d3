//! Configuration for the Recast tile pipeline

use glam::Vec3;
use navkit_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::MAX_VERTS_PER_POLY;

/// Region partitioning algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionType {
    /// Best tessellation, slowest; may leave holes on narrow spirals
    #[default]
    Watershed,
    /// Fastest; produces long thin polygons
    Monotone,
    /// Non-overlapping layers; middle ground between the two others
    Layers,
}

/// Configuration parameters for navigation mesh generation.
///
/// Agent dimensions are given in world units and converted to voxel units by the
/// accessor methods, so one configuration works for any cell size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecastConfig {
    /// The width/depth resolution of the field (cell size)
    pub cs: f32,
    /// The height resolution of the field (cell height)
    pub ch: f32,

    /// Minimum floor to ceiling height an agent needs
    pub agent_height: f32,
    /// Agent radius; walkable area is eroded by this much
    pub agent_radius: f32,
    /// Largest ledge an agent can step up or down
    pub agent_max_climb: f32,
    /// Steepest walkable slope in degrees
    pub agent_max_slope: f32,

    /// Regions with fewer cells than `region_min_size²` are removed
    pub region_min_size: i32,
    /// Regions with fewer cells than `region_merge_size²` are merged into neighbours
    pub region_merge_size: i32,
    /// Partitioning algorithm
    pub partition: PartitionType,

    /// Longest allowed contour edge along the mesh border, in world units
    pub edge_max_len: f32,
    /// Maximum distance a simplified contour may deviate from the raw contour, in cells
    pub edge_max_error: f32,
    /// Maximum number of vertices per polygon
    pub max_verts_per_poly: usize,

    /// Detail mesh sampling distance, in cells. Values below 0.9 disable sampling
    pub detail_sample_dist: f32,
    /// Maximum detail mesh height error, in cell heights
    pub detail_sample_max_error: f32,
    /// Build the detail mesh at all
    pub build_detail_mesh: bool,

    /// Let agents step onto obstacles lower than `agent_max_climb`
    pub filter_low_hanging_obstacles: bool,
    /// Mark spans next to drops higher than `agent_max_climb` unwalkable
    pub filter_ledge_spans: bool,
    /// Mark spans with less than `agent_height` clearance unwalkable
    pub filter_low_height_spans: bool,

    /// Tile edge length in cells
    pub tile_size: i32,
}

impl Default for RecastConfig {
    fn default() -> Self {
        Self {
            cs: 0.25,
            ch: 0.25,
            agent_height: 2.0,
            agent_radius: 0.5,
            agent_max_climb: 0.75,
            agent_max_slope: 55.0,
            region_min_size: 8,
            region_merge_size: 20,
            partition: PartitionType::Watershed,
            edge_max_len: 12.0,
            edge_max_error: 1.3,
            max_verts_per_poly: MAX_VERTS_PER_POLY,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
            build_detail_mesh: true,
            filter_low_hanging_obstacles: true,
            filter_ledge_spans: true,
            filter_low_height_spans: true,
            tile_size: 64,
        }
    }
}

impl RecastConfig {
    /// Creates a new RecastConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Agent height in cell heights
    pub fn walkable_height(&self) -> i32 {
        (self.agent_height / self.ch).ceil() as i32
    }

    /// Agent climb in cell heights
    pub fn walkable_climb(&self) -> i32 {
        (self.agent_max_climb / self.ch).floor() as i32
    }

    /// Agent radius in cells
    pub fn walkable_radius(&self) -> i32 {
        (self.agent_radius / self.cs).ceil() as i32
    }

    /// Cosine of the steepest walkable slope
    pub fn walkable_slope_cos(&self) -> f32 {
        self.agent_max_slope.to_radians().cos()
    }

    /// Border padding around each tile, in cells
    pub fn border_size(&self) -> i32 {
        self.walkable_radius() + 3
    }

    /// Longest contour edge, in cells
    pub fn max_edge_len(&self) -> i32 {
        (self.edge_max_len / self.cs) as i32
    }

    pub fn min_region_area(&self) -> i32 {
        self.region_min_size * self.region_min_size
    }

    pub fn merge_region_area(&self) -> i32 {
        self.region_merge_size * self.region_merge_size
    }

    /// Detail sampling distance in world units (0 disables sampling)
    pub fn detail_sample_dist_world(&self) -> f32 {
        if self.detail_sample_dist < 0.9 {
            0.0
        } else {
            self.cs * self.detail_sample_dist
        }
    }

    /// Detail height error in world units
    pub fn detail_sample_max_error_world(&self) -> f32 {
        self.ch * self.detail_sample_max_error
    }

    /// World size of one tile along x and z
    pub fn tile_world_size(&self) -> f32 {
        self.tile_size as f32 * self.cs
    }

    /// Validates the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.cs > 0.0 && self.ch > 0.0) {
            return Err(Error::InvalidMesh("Invalid cell size or height".to_string()));
        }

        if !(0.0..=90.0).contains(&self.agent_max_slope) {
            return Err(Error::InvalidMesh("Invalid walkable slope angle".to_string()));
        }

        if self.agent_height <= 0.0 || self.agent_radius < 0.0 || self.agent_max_climb < 0.0 {
            return Err(Error::InvalidMesh("Invalid agent dimensions".to_string()));
        }

        if self.max_verts_per_poly < 3 || self.max_verts_per_poly > MAX_VERTS_PER_POLY {
            return Err(Error::InvalidMesh(format!(
                "Vertices per polygon must be between 3 and {}",
                MAX_VERTS_PER_POLY
            )));
        }

        if self.tile_size <= 0 {
            return Err(Error::InvalidMesh("Tile size must be positive".to_string()));
        }

        Ok(())
    }

    /// Grid setup for tile `(tile_x, tile_z)` of a grid starting at `origin`.
    ///
    /// The tile bounds are padded by the border size so that region and erosion
    /// results match across tile seams; `y_min`/`y_max` bound the scene vertically.
    pub fn tile_config(&self, origin: Vec3, y_min: f32, y_max: f32, tile_x: i32, tile_z: i32) -> TileConfig {
        let tile_world = self.tile_world_size();
        let border_size = self.border_size();
        let pad = border_size as f32 * self.cs;

        let mut bmin = Vec3::new(
            origin.x + tile_x as f32 * tile_world,
            y_min,
            origin.z + tile_z as f32 * tile_world,
        );
        let mut bmax = Vec3::new(bmin.x + tile_world, y_max, bmin.z + tile_world);
        bmin.x -= pad;
        bmin.z -= pad;
        bmax.x += pad;
        bmax.z += pad;

        TileConfig {
            tile_x,
            tile_z,
            width: self.tile_size + border_size * 2,
            height: self.tile_size + border_size * 2,
            border_size,
            bmin,
            bmax,
        }
    }
}

/// Grid of a single tile
#[derive(Debug, Clone, PartialEq)]
pub struct TileConfig {
    pub tile_x: i32,
    pub tile_z: i32,
    /// Cells along x, including the border on both sides
    pub width: i32,
    /// Cells along z, including the border on both sides
    pub height: i32,
    /// Border padding in cells
    pub border_size: i32,
    /// Padded minimum bounds
    pub bmin: Vec3,
    /// Padded maximum bounds
    pub bmax: Vec3,
}

impl TileConfig {
    /// Bounds of the tile without the border padding
    pub fn inner_bounds(&self, cs: f32) -> (Vec3, Vec3) {
        let pad = self.border_size as f32 * cs;
        (
            Vec3::new(self.bmin.x + pad, self.bmin.y, self.bmin.z + pad),
            Vec3::new(self.bmax.x - pad, self.bmax.y, self.bmax.z - pad),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_agent_in_voxels() {
        let config = RecastConfig::default();
        assert_eq!(config.walkable_height(), 8);
        assert_eq!(config.walkable_climb(), 3);
        assert_eq!(config.walkable_radius(), 2);
        assert_eq!(config.border_size(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RecastConfig::default();
        config.max_verts_per_poly = 7;
        assert!(config.validate().is_err());

        let mut config = RecastConfig::default();
        config.cs = 0.0;
        assert!(config.validate().is_err());

        let mut config = RecastConfig::default();
        config.agent_max_slope = 95.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tile_config_is_padded() {
        let config = RecastConfig::default();
        let tile = config.tile_config(Vec3::ZERO, -1.0, 4.0, 1, 0);
        assert_eq!(tile.width, 64 + 10);
        assert_eq!(tile.bmin.x, 16.0 - 1.25);
        assert_eq!(tile.bmax.z, 16.0 + 1.25);
        let (inner_min, inner_max) = tile.inner_bounds(config.cs);
        assert_eq!(inner_min.x, 16.0);
        assert_eq!(inner_max.x, 32.0);
    }
}
