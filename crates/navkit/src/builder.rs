//! Parallel tiled navmesh builds
//!
//! The scene bounds are cut into a grid of square tiles. Every tile runs through
//! the Recast pipeline on the rayon pool as a pure function of the scene and the
//! settings; only the insert of the finished tile into the navmesh takes a lock.
//! The flight volume is built the same way, one root cell of the octree per task.
//!
//! A tile that fails, or panics, is logged and left out of the result. The
//! build only fails as a whole when it is cancelled or no tile survives.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use glam::Vec3;
use rayon::prelude::*;

use navkit_common::{Aabb, BuildProgress, CancellationToken, Error, Result, Scene};
use navkit_detour::{create_tile, MeshTile, NavMesh, NavMeshCreateParams, NavMeshParams};
use navkit_recast::{BuildContext, RecastConfig, TileBuilder};
use navkit_voxel::{build_root_cell, VoxelMap};

use crate::settings::BuildSettings;
use crate::Navmesh;

/// Square tiles covering the scene in the XZ plane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    /// Corner of tile (0, 0); its y is the bottom of the scene
    pub origin: Vec3,
    /// Edge length of a tile in world units
    pub tile_size: f32,
    /// Tiles along x
    pub width: i32,
    /// Tiles along z
    pub height: i32,
    /// Vertical range rasterized into every tile
    pub y_min: f32,
    pub y_max: f32,
}

impl TileGrid {
    /// Grid covering `bounds`
    pub fn for_bounds(bounds: &Aabb, config: &RecastConfig) -> Self {
        let tile_size = config.tile_world_size();
        let size = bounds.size();
        Self {
            origin: Vec3::new(bounds.min.x, bounds.min.y, bounds.min.z),
            tile_size,
            width: ((size.x / tile_size).ceil() as i32).max(1),
            height: ((size.z / tile_size).ceil() as i32).max(1),
            y_min: bounds.min.y - config.ch,
            y_max: bounds.max.y + config.agent_height,
        }
    }

    /// Grid of an existing navmesh, stretched over `bounds`.
    ///
    /// Tile coordinates match the ones the navmesh was built with.
    pub fn for_nav_mesh(params: &NavMeshParams, bounds: &Aabb, config: &RecastConfig) -> Self {
        let tile_size = params.tile_width;
        let extent = bounds.max - params.origin;
        Self {
            origin: params.origin,
            tile_size,
            width: ((extent.x / tile_size).ceil() as i32).max(1),
            height: ((extent.z / tile_size).ceil() as i32).max(1),
            y_min: bounds.min.y.min(params.origin.y) - config.ch,
            y_max: bounds.max.y + config.agent_height,
        }
    }

    pub fn tile_count(&self) -> usize {
        (self.width * self.height) as usize
    }

    /// Every tile coordinate, row by row
    pub fn tiles(&self) -> Vec<(i32, i32)> {
        (0..self.height)
            .flat_map(|z| (0..self.width).map(move |x| (x, z)))
            .collect()
    }

    /// Tiles whose XZ footprint overlaps `bounds`
    pub fn tiles_overlapping(&self, bounds: &Aabb) -> Vec<(i32, i32)> {
        let lo = |v: f32, o: f32| ((v - o) / self.tile_size).floor() as i32;
        let x0 = lo(bounds.min.x, self.origin.x).max(0);
        let x1 = lo(bounds.max.x, self.origin.x).min(self.width - 1);
        let z0 = lo(bounds.min.z, self.origin.z).max(0);
        let z1 = lo(bounds.max.z, self.origin.z).min(self.height - 1);
        (z0..=z1)
            .flat_map(|z| (x0..=x1).map(move |x| (x, z)))
            .collect()
    }

    /// World bounds of a tile over the rasterized vertical range
    pub fn tile_bounds(&self, x: i32, z: i32) -> Aabb {
        let min = Vec3::new(
            self.origin.x + x as f32 * self.tile_size,
            self.y_min,
            self.origin.z + z as f32 * self.tile_size,
        );
        Aabb::new(min, Vec3::new(min.x + self.tile_size, self.y_max, min.z + self.tile_size))
    }

    fn nav_mesh_params(&self, settings: &BuildSettings) -> NavMeshParams {
        let needed = (self.tile_count() as u32).max(1).next_power_of_two();
        NavMeshParams {
            origin: self.origin,
            tile_width: self.tile_size,
            tile_height: self.tile_size,
            max_tiles: needed.min(settings.max_tiles),
            max_polys: settings.max_polys_per_tile,
        }
    }
}

/// Tile that could not be built
#[derive(Debug, Clone, PartialEq)]
pub struct TileFailure {
    pub x: i32,
    pub z: i32,
    pub reason: String,
}

impl From<TileFailure> for Error {
    fn from(failure: TileFailure) -> Self {
        Error::TileBuild {
            x: failure.x,
            z: failure.z,
            reason: failure.reason,
        }
    }
}

/// Summary of a build
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    /// Tiles that produced navigation data
    pub built_tiles: usize,
    /// Tiles without walkable surface
    pub empty_tiles: usize,
    /// Tiles left out of the result
    pub failed_tiles: Vec<TileFailure>,
    /// Octree root cells voxelized for the flight volume
    pub voxel_cells: usize,
    pub elapsed: Duration,
}

impl BuildReport {
    /// True when every tile was built or found empty
    pub fn is_complete(&self) -> bool {
        self.failed_tiles.is_empty()
    }
}

enum TileOutcome {
    Built,
    Empty,
    Failed(TileFailure),
    Cancelled,
}

/// Builds navmeshes from scenes
#[derive(Debug, Clone)]
pub struct NavmeshBuilder {
    settings: BuildSettings,
    tiles: TileBuilder,
    cancel: CancellationToken,
    progress: BuildProgress,
}

impl NavmeshBuilder {
    /// Creates a builder, rejecting invalid settings
    pub fn new(settings: BuildSettings) -> Result<Self> {
        settings.validate()?;
        let tiles = TileBuilder::new(settings.recast.clone())?;
        Ok(Self {
            settings,
            tiles,
            cancel: CancellationToken::new(),
            progress: BuildProgress::new(),
        })
    }

    /// Uses `token` to cancel builds started by this builder
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Reports into `progress` instead of a private tracker
    pub fn with_progress(mut self, progress: BuildProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Completed fraction of the running build, `-1.0` when idle
    pub fn progress(&self) -> &BuildProgress {
        &self.progress
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Builds every tile of the scene and, if the scene supports flight, its
    /// flight volume
    pub fn build(&self, scene: &Scene) -> Result<(Navmesh, BuildReport)> {
        let start = Instant::now();
        let bounds = scene
            .bounds()
            .ok_or_else(|| Error::InvalidMesh("Scene has no geometry".to_string()))?;
        let grid = TileGrid::for_bounds(&bounds, &self.settings.recast);
        let nav_mesh = NavMesh::new(grid.nav_mesh_params(&self.settings))?;

        log::info!(
            "Building navmesh: {}x{} tiles of {} units, flight {}",
            grid.width,
            grid.height,
            grid.tile_size,
            if scene.supports_flight() { "enabled" } else { "disabled" }
        );

        let voxel_map = if scene.supports_flight() {
            Some(self.flight_layout(&bounds)?)
        } else {
            None
        };
        let voxel_cells = voxel_map
            .as_ref()
            .map(|map| Self::occupied_root_cells(map, scene, &map.bounds()))
            .unwrap_or_default();

        let result = self.run(scene, &grid, nav_mesh, &grid.tiles(), voxel_map, &voxel_cells);
        self.progress.reset();
        let (nav_mesh, voxel_map, mut report) = result?;

        report.elapsed = start.elapsed();
        log::info!(
            "Navmesh built in {:?}: {} tiles, {} empty, {} failed",
            report.elapsed,
            report.built_tiles,
            report.empty_tiles,
            report.failed_tiles.len()
        );
        Ok((Navmesh::new(self.settings.customization_version, nav_mesh, voxel_map), report))
    }

    /// Rebuilds the tiles overlapping `bounds` on a copy of `navmesh`.
    ///
    /// The input is left untouched; the caller publishes the returned navmesh.
    pub fn rebuild_region(&self, navmesh: &Navmesh, scene: &Scene, bounds: &Aabb) -> Result<(Navmesh, BuildReport)> {
        let scene_bounds = scene.bounds().unwrap_or(*bounds).union(bounds);
        let grid = TileGrid::for_nav_mesh(navmesh.nav_mesh.params(), &scene_bounds, &self.settings.recast);
        let tiles = grid.tiles_overlapping(bounds);
        self.rebuild(navmesh, scene, &grid, &tiles, bounds)
    }

    /// Rebuilds the given tiles on a copy of `navmesh`
    pub fn rebuild_tiles(&self, navmesh: &Navmesh, scene: &Scene, tiles: &[(i32, i32)]) -> Result<(Navmesh, BuildReport)> {
        let scene_bounds = scene
            .bounds()
            .ok_or_else(|| Error::InvalidMesh("Scene has no geometry".to_string()))?;
        let grid = TileGrid::for_nav_mesh(navmesh.nav_mesh.params(), &scene_bounds, &self.settings.recast);
        let region = tiles
            .iter()
            .fold(Aabb::EMPTY, |acc, &(x, z)| acc.union(&grid.tile_bounds(x, z)));
        self.rebuild(navmesh, scene, &grid, tiles, &region)
    }

    fn rebuild(
        &self,
        navmesh: &Navmesh,
        scene: &Scene,
        grid: &TileGrid,
        tiles: &[(i32, i32)],
        region: &Aabb,
    ) -> Result<(Navmesh, BuildReport)> {
        let start = Instant::now();
        if navmesh.customization_version != self.settings.customization_version {
            return Err(Error::Format(format!(
                "Navmesh was built with customization version {}, builder uses {}",
                navmesh.customization_version, self.settings.customization_version
            )));
        }
        if (grid.tile_size - self.settings.recast.tile_world_size()).abs() > 1e-4 {
            return Err(Error::InvalidMesh(format!(
                "Navmesh tiles are {} units wide, settings produce {}",
                grid.tile_size,
                self.settings.recast.tile_world_size()
            )));
        }

        let voxel_cells = navmesh
            .voxel_map
            .as_ref()
            .map(|map| Self::root_cells_overlapping(map, region))
            .unwrap_or_default();

        log::debug!("Rebuilding {} tiles and {} flight cells", tiles.len(), voxel_cells.len());
        let result = self.run(
            scene,
            grid,
            navmesh.nav_mesh.clone(),
            tiles,
            navmesh.voxel_map.clone(),
            &voxel_cells,
        );
        self.progress.reset();
        let (nav_mesh, mut voxel_map, mut report) = result?;

        if let Some(map) = voxel_map.as_mut() {
            map.compact();
        }
        report.elapsed = start.elapsed();
        Ok((Navmesh::new(navmesh.customization_version, nav_mesh, voxel_map), report))
    }

    /// Empty flight volume covering `bounds`
    fn flight_layout(&self, bounds: &Aabb) -> Result<VoxelMap> {
        let flight = &self.settings.flight;
        let resolution: usize = flight.levels.iter().product();
        let origin = flight.origin.unwrap_or(bounds.min - Vec3::splat(flight.padding));
        let voxel_size = match flight.voxel_size {
            Some(size) => size,
            None => {
                let extent = (bounds.max + Vec3::splat(flight.padding) - origin).max_element();
                extent / resolution as f32
            }
        };
        VoxelMap::new(origin, voxel_size, &flight.levels)
    }

    fn root_cells_overlapping(map: &VoxelMap, region: &Aabb) -> Vec<[usize; 3]> {
        let n = map.levels()[0];
        let mut cells = Vec::new();
        for y in 0..n {
            for x in 0..n {
                for z in 0..n {
                    if map.root_cell_bounds([x, y, z]).overlaps(region) {
                        cells.push([x, y, z]);
                    }
                }
            }
        }
        cells
    }

    /// Root cells inside `region` that some instance may touch
    fn occupied_root_cells(map: &VoxelMap, scene: &Scene, region: &Aabb) -> Vec<[usize; 3]> {
        Self::root_cells_overlapping(map, region)
            .into_iter()
            .filter(|&cell| {
                let bounds = map.root_cell_bounds(cell);
                scene.instances().any(|(_, inst)| inst.world_bounds.overlaps(&bounds))
            })
            .collect()
    }

    fn run(
        &self,
        scene: &Scene,
        grid: &TileGrid,
        nav_mesh: NavMesh,
        tiles: &[(i32, i32)],
        voxel_map: Option<VoxelMap>,
        voxel_cells: &[[usize; 3]],
    ) -> Result<(NavMesh, Option<VoxelMap>, BuildReport)> {
        self.cancel.check()?;
        let total = (tiles.len() + voxel_cells.len()).max(1);
        let completed = AtomicUsize::new(0);
        self.progress.reset();
        self.progress.set(0.0);
        let tick = || {
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            self.progress.set(done as f32 / total as f32);
        };

        let shared = Mutex::new(nav_mesh);
        let outcomes: Vec<TileOutcome> = tiles
            .par_iter()
            .map(|&(x, z)| {
                let outcome = self.build_and_merge(scene, grid, x, z, &shared);
                tick();
                outcome
            })
            .collect();

        let mut report = BuildReport::default();
        for outcome in outcomes {
            match outcome {
                TileOutcome::Built => report.built_tiles += 1,
                TileOutcome::Empty => report.empty_tiles += 1,
                TileOutcome::Failed(failure) => report.failed_tiles.push(failure),
                TileOutcome::Cancelled => return Err(Error::Cancelled),
            }
        }
        let nav_mesh = shared
            .into_inner()
            .map_err(|_| Error::NavMeshGeneration("Navmesh lock poisoned".to_string()))?;

        if report.built_tiles == 0 && !report.failed_tiles.is_empty() {
            return Err(Error::NavMeshGeneration(format!(
                "All {} tiles with geometry failed to build",
                report.failed_tiles.len()
            )));
        }

        let voxel_map = match voxel_map {
            Some(map) => {
                let map = self.build_flight(scene, map, voxel_cells, &tick)?;
                report.voxel_cells = voxel_cells.len();
                Some(map)
            }
            None => None,
        };

        Ok((nav_mesh, voxel_map, report))
    }

    fn build_and_merge(&self, scene: &Scene, grid: &TileGrid, x: i32, z: i32, shared: &Mutex<NavMesh>) -> TileOutcome {
        if self.cancel.is_cancelled() {
            return TileOutcome::Cancelled;
        }
        let fail = |reason: String| {
            log::error!("Tile ({}, {}) failed: {}", x, z, reason);
            TileOutcome::Failed(TileFailure { x, z, reason })
        };

        let built = panic::catch_unwind(AssertUnwindSafe(|| self.build_tile_data(scene, grid, x, z)));
        let tile = match built {
            Ok(Ok(Some(tile))) => tile,
            Ok(Ok(None)) => {
                // Drop stale content from an earlier build
                if let Ok(mut nav_mesh) = shared.lock() {
                    nav_mesh.remove_tile(x, z, 0);
                }
                return TileOutcome::Empty;
            }
            Ok(Err(err)) if err.is_cancelled() => return TileOutcome::Cancelled,
            Ok(Err(err)) => return fail(err.to_string()),
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                return fail(format!("panicked: {}", reason));
            }
        };

        match shared.lock() {
            Ok(mut nav_mesh) => match nav_mesh.add_tile(tile) {
                Ok(_) => TileOutcome::Built,
                Err(err) => fail(err.to_string()),
            },
            Err(_) => fail("navmesh lock poisoned".to_string()),
        }
    }

    /// Runs the Recast pipeline for one tile and converts the result
    fn build_tile_data(&self, scene: &Scene, grid: &TileGrid, x: i32, z: i32) -> Result<Option<MeshTile>> {
        let config = &self.settings.recast;
        let tile_config = config.tile_config(grid.origin, grid.y_min, grid.y_max, x, z);
        let mut ctx = BuildContext::with_cancellation(self.cancel.clone());
        let tile_mesh = self.tiles.build_tile(&mut ctx, scene, &tile_config, &self.settings.passes)?;
        ctx.log_timer_summary();

        let params = NavMeshCreateParams::from_tile_mesh(&tile_mesh, config, scene.off_mesh_links());
        create_tile(&params)
    }

    fn build_flight(
        &self,
        scene: &Scene,
        map: VoxelMap,
        cells: &[[usize; 3]],
        tick: &(dyn Fn() + Sync),
    ) -> Result<VoxelMap> {
        let mask = self.settings.flight.mask;
        let layout = map.clone();
        let shared = Mutex::new(map);

        cells.par_iter().try_for_each(|&cell| -> Result<()> {
            self.cancel.check()?;
            let subtree = build_root_cell(&layout, cell, scene, mask, &self.cancel)?;
            shared
                .lock()
                .map_err(|_| Error::NavMeshGeneration("Voxel map lock poisoned".to_string()))?
                .merge_subtree(subtree);
            tick();
            Ok(())
        })?;

        let map = shared
            .into_inner()
            .map_err(|_| Error::NavMeshGeneration("Voxel map lock poisoned".to_string()))?;
        log::debug!("Flight volume has {} tiles over {} cells", map.tile_count(), cells.len());
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Affine3A;
    use navkit_common::{Mesh, MeshPart, MeshType, SceneBuilder};

    fn floor_scene(half: f32) -> Scene {
        SceneBuilder::new()
            .add_mesh(Mesh::new("floor", MeshType::AnalyticPlane, vec![MeshPart::plane(half, half)]))
            .place("floor", 1, Affine3A::IDENTITY)
            .build()
    }

    #[test]
    fn test_grid_covers_bounds() {
        let config = RecastConfig::default();
        let bounds = Aabb::new(Vec3::new(-20.0, 0.0, -5.0), Vec3::new(20.0, 1.0, 5.0));
        let grid = TileGrid::for_bounds(&bounds, &config);
        assert_eq!(grid.tile_size, 16.0);
        assert_eq!((grid.width, grid.height), (3, 1));
        assert_eq!(grid.tiles(), vec![(0, 0), (1, 0), (2, 0)]);

        let hit = Aabb::new(Vec3::new(-4.0, 0.0, -1.0), Vec3::new(-3.0, 1.0, 1.0));
        assert_eq!(grid.tiles_overlapping(&hit), vec![(1, 0)]);
        let outside = Aabb::new(Vec3::new(100.0, 0.0, 0.0), Vec3::new(101.0, 1.0, 1.0));
        assert!(grid.tiles_overlapping(&outside).is_empty());
    }

    #[test]
    fn test_build_reports_tiles_and_resets_progress() {
        let scene = floor_scene(20.0);
        let shared = BuildProgress::new();
        let builder = NavmeshBuilder::new(BuildSettings::default())
            .unwrap()
            .with_progress(shared.clone());

        let done = std::sync::atomic::AtomicBool::new(false);
        let (navmesh, report, seen) = std::thread::scope(|scope| {
            let observer = scope.spawn(|| {
                let mut seen = Vec::new();
                while !done.load(Ordering::Acquire) {
                    seen.push(shared.get());
                }
                seen
            });
            let (navmesh, report) = builder.build(&scene).unwrap();
            done.store(true, Ordering::Release);
            (navmesh, report, observer.join().unwrap())
        });

        assert_eq!(report.built_tiles + report.empty_tiles, 9);
        assert!(report.built_tiles >= 4);
        assert!(report.is_complete());
        assert_eq!(navmesh.nav_mesh.tile_count(), report.built_tiles);
        assert!(navmesh.voxel_map.is_none());
        assert_eq!(shared.get(), -1.0);
        assert_eq!(builder.progress().get(), -1.0);
        // Readings only climb while the build runs
        let running: Vec<f32> = seen.into_iter().filter(|&p| p >= 0.0).collect();
        assert!(running.windows(2).all(|w| w[0] <= w[1]), "{:?}", running);
        assert!(running.iter().all(|&p| p <= 1.0));
    }

    #[test]
    fn test_empty_scene_is_rejected() {
        let builder = NavmeshBuilder::new(BuildSettings::default()).unwrap();
        let err = builder.build(&Scene::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidMesh(_)));
    }

    #[test]
    fn test_cancelled_build_publishes_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let builder = NavmeshBuilder::new(BuildSettings::default())
            .unwrap()
            .with_cancellation(token);
        let err = builder.build(&floor_scene(5.0)).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!builder.progress().is_running());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let scene = floor_scene(5.0);
        let builder = NavmeshBuilder::new(BuildSettings::default()).unwrap();
        let (navmesh, _) = builder.build(&scene).unwrap();
        let (rebuilt, report) = builder.rebuild_tiles(&navmesh, &scene, &[(0, 0)]).unwrap();
        assert_eq!(report.built_tiles, 1);

        let before = navmesh.nav_mesh.tile_at(0, 0, 0).unwrap();
        let after = rebuilt.nav_mesh.tile_at(0, 0, 0).unwrap();
        assert_eq!(before.verts, after.verts);
        assert_eq!(before.polys.len(), after.polys.len());
        for (a, b) in before.polys.iter().zip(&after.polys) {
            assert_eq!(a.verts, b.verts);
            assert_eq!(a.neis, b.neis);
        }
        assert_eq!(before.detail_tris, after.detail_tris);

        // The replaced tile gets fresh references
        let old_ref = navmesh.nav_mesh.tile_ref_at(0, 0, 0).unwrap();
        assert!(!rebuilt.nav_mesh.is_valid_poly_ref(old_ref));
        assert!(navmesh.nav_mesh.is_valid_poly_ref(old_ref));
    }

    #[test]
    fn test_rebuild_rejects_other_customization() {
        let scene = floor_scene(5.0);
        let builder = NavmeshBuilder::new(BuildSettings::default()).unwrap();
        let (mut navmesh, _) = builder.build(&scene).unwrap();
        navmesh.customization_version = 4;
        let err = builder.rebuild_tiles(&navmesh, &scene, &[(0, 0)]).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_flight_volume_is_built_when_supported() {
        let mut settings = BuildSettings::default();
        settings.flight.levels = vec![4, 4];
        let scene = SceneBuilder::new()
            .add_mesh(Mesh::new("floor", MeshType::AnalyticPlane, vec![MeshPart::plane(5.0, 5.0)]))
            .place("floor", 1, Affine3A::IDENTITY)
            .supports_flight(true)
            .build();
        let builder = NavmeshBuilder::new(settings).unwrap();
        let (navmesh, report) = builder.build(&scene).unwrap();
        let map = navmesh.voxel_map.as_ref().unwrap();
        assert!(report.voxel_cells > 0);
        assert!(map.bounds().contains(Vec3::ZERO));
        let above = map.find_leaf(Vec3::new(0.0, 3.0, 0.0)).unwrap();
        assert!(map.is_empty(above));
    }
}
