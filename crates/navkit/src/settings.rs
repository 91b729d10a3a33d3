//! Build settings
//!
//! Everything a build reads besides the scene lives in [`BuildSettings`], which
//! round-trips through JSON so hosts can keep per-zone overrides on disk.

use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use navkit_common::{Error, MeshTypeMask, Result};
use navkit_recast::RecastConfig;
use navkit_voxel::{MAX_LEVELS, MAX_LEVEL_SIZE};

/// Flight volume layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightSettings {
    /// Cells per axis of each octree level, coarsest first
    pub levels: Vec<usize>,
    /// Edge length of a finest voxel. `None` fits the volume to the scene bounds
    pub voxel_size: Option<f32>,
    /// Minimum corner of the volume. `None` places it at the scene bounds
    pub origin: Option<Vec3>,
    /// Extra space around the scene bounds, in world units
    pub padding: f32,
    /// Mesh types that block flight
    pub mask: MeshTypeMask,
}

impl Default for FlightSettings {
    fn default() -> Self {
        Self {
            levels: vec![16, 8, 8],
            voxel_size: None,
            origin: None,
            padding: 2.0,
            mask: MeshTypeMask::all(),
        }
    }
}

/// Settings for a full or incremental navmesh build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub recast: RecastConfig,
    /// Version of the host customization the navmesh was built with. Saved
    /// navmeshes only load under the same version.
    pub customization_version: i32,
    /// Mesh types rasterized per pass; solid obstacles first, then terrain and planes
    pub passes: Vec<MeshTypeMask>,
    pub flight: FlightSettings,
    /// Upper bound on tile slots in the navmesh
    pub max_tiles: u32,
    /// Upper bound on polygons per tile
    pub max_polys_per_tile: u32,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            recast: RecastConfig::default(),
            customization_version: 0,
            passes: vec![
                MeshTypeMask::FILE_MESH | MeshTypeMask::CYLINDER_MESH | MeshTypeMask::ANALYTIC_SHAPE,
                MeshTypeMask::TERRAIN | MeshTypeMask::ANALYTIC_PLANE,
            ],
            flight: FlightSettings::default(),
            max_tiles: 1 << 14,
            max_polys_per_tile: 1 << 16,
        }
    }
}

impl BuildSettings {
    /// Checks the settings before a build touches any geometry
    pub fn validate(&self) -> Result<()> {
        self.recast.validate()?;
        if self.passes.is_empty() {
            return Err(Error::InvalidMesh("At least one rasterization pass is required".to_string()));
        }
        if self.max_tiles == 0 || self.max_polys_per_tile == 0 {
            return Err(Error::InvalidMesh("Navmesh capacity must be positive".to_string()));
        }

        let levels = &self.flight.levels;
        if levels.is_empty() || levels.len() > MAX_LEVELS {
            return Err(Error::InvalidMesh(format!(
                "Flight volume needs 1 to {} levels, got {}",
                MAX_LEVELS,
                levels.len()
            )));
        }
        if let Some(&bad) = levels
            .iter()
            .find(|&&n| n < 2 || n > MAX_LEVEL_SIZE || !n.is_power_of_two())
        {
            return Err(Error::InvalidMesh(format!("Invalid flight level size {}", bad)));
        }
        if matches!(self.flight.voxel_size, Some(size) if !(size > 0.0)) {
            return Err(Error::InvalidMesh("Flight voxel size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| Error::Format(format!("Invalid build settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Format(e.to_string()))
    }

    /// Loads settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = BuildSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.flight.levels, vec![16, 8, 8]);
        assert_eq!(settings.recast.agent_radius, 0.5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = BuildSettings::from_json(
            r#"{ "customization_version": 7, "recast": { "cs": 0.5 }, "flight": { "levels": [4, 4] } }"#,
        )
        .unwrap();
        assert_eq!(settings.customization_version, 7);
        assert_eq!(settings.recast.cs, 0.5);
        assert_eq!(settings.recast.ch, 0.25);
        assert_eq!(settings.flight.levels, vec![4, 4]);
        assert_eq!(settings.passes.len(), 2);
    }

    #[test]
    fn test_rejects_bad_levels() {
        let err = BuildSettings::from_json(r#"{ "flight": { "levels": [3] } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidMesh(_)));
        assert!(matches!(BuildSettings::from_json("{ nope"), Err(Error::Format(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = BuildSettings::default();
        settings.customization_version = 3;
        settings.flight.voxel_size = Some(0.5);
        settings.save(&path).unwrap();
        assert_eq!(BuildSettings::load(&path).unwrap(), settings);
    }
}
