//! Tile build pipeline
//!
//! Runs one tile through every Recast stage: rasterization, span filters,
//! compaction, erosion, region partitioning, contours, polygon mesh and detail mesh.
//! A tile is a pure function of the scene and the configuration, so tiles can be
//! built on any thread in any order.

use glam::Vec3;

use navkit_common::{MeshTypeMask, Result, Scene};

use crate::area::erode_walkable_area;
use crate::compact_heightfield::CompactHeightfield;
use crate::config::{PartitionType, RecastConfig, TileConfig};
use crate::context::{BuildContext, TimerCategory};
use crate::contour::{BuildContoursFlags, ContourSet};
use crate::detail_mesh::PolyMeshDetail;
use crate::distance_field::build_distance_field;
use crate::heightfield::Heightfield;
use crate::polymesh::PolyMesh;
use crate::rasterization::rasterize_scene;
use crate::region::{build_layer_regions, build_regions_monotone, build_regions_watershed};
use crate::RC_NULL_AREA;

/// Polygon flag set on every walkable polygon
pub const POLY_FLAG_WALK: u16 = 0x01;

/// Result of building one tile
#[derive(Debug, Clone, PartialEq)]
pub struct TileMesh {
    pub tile_x: i32,
    pub tile_z: i32,
    /// Tile bounds without the border padding
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub poly_mesh: PolyMesh,
    pub detail_mesh: Option<PolyMeshDetail>,
    /// Number of triangles rasterized into the tile
    pub triangle_count: usize,
}

impl TileMesh {
    /// A tile without walkable surface is a valid, empty result
    pub fn is_empty(&self) -> bool {
        self.poly_mesh.npolys == 0
    }
}

/// Builds tiles with a fixed configuration
#[derive(Debug, Clone)]
pub struct TileBuilder {
    config: RecastConfig,
}

impl TileBuilder {
    /// Creates a builder, rejecting invalid configurations
    pub fn new(config: RecastConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RecastConfig {
        &self.config
    }

    /// Runs the full pipeline for one tile.
    ///
    /// Each entry of `passes` selects the mesh types rasterized in that pass.
    pub fn build_tile(
        &self,
        ctx: &mut BuildContext,
        scene: &Scene,
        tile: &TileConfig,
        passes: &[MeshTypeMask],
    ) -> Result<TileMesh> {
        let config = &self.config;
        ctx.set_label(format!("tile ({}, {})", tile.tile_x, tile.tile_z));
        ctx.start_timer(TimerCategory::Total);

        let result = self.run_pipeline(ctx, scene, tile, passes);

        ctx.stop_timer(TimerCategory::Total);
        let (poly_mesh, detail_mesh, triangle_count) = result?;

        if poly_mesh.npolys == 0 {
            ctx.log_debug("Tile has no walkable polygons");
        } else {
            ctx.log_debug(format!(
                "Built {} polygons with {} vertices",
                poly_mesh.npolys,
                poly_mesh.verts.len()
            ));
        }

        let (bmin, bmax) = tile.inner_bounds(config.cs);
        Ok(TileMesh {
            tile_x: tile.tile_x,
            tile_z: tile.tile_z,
            bmin,
            bmax,
            poly_mesh,
            detail_mesh,
            triangle_count,
        })
    }

    fn run_pipeline(
        &self,
        ctx: &mut BuildContext,
        scene: &Scene,
        tile: &TileConfig,
        passes: &[MeshTypeMask],
    ) -> Result<(PolyMesh, Option<PolyMeshDetail>, usize)> {
        let config = &self.config;
        let walkable_height = config.walkable_height();
        let walkable_climb = config.walkable_climb();

        // Step 1: rasterize the scene into the heightfield
        let mut hf = Heightfield::new(tile.width, tile.height, tile.bmin, tile.bmax, config.cs, config.ch);
        let triangle_count = rasterize_scene(
            ctx,
            &mut hf,
            scene,
            passes,
            config.walkable_slope_cos(),
            walkable_climb,
        )?;
        ctx.check_cancelled()?;

        // Step 2: span filters
        ctx.start_timer(TimerCategory::Filtering);
        if config.filter_low_hanging_obstacles {
            hf.filter_low_hanging_walkable_obstacles(walkable_climb);
        }
        if config.filter_ledge_spans {
            hf.filter_ledge_spans(walkable_height, walkable_climb);
        }
        if config.filter_low_height_spans {
            hf.filter_walkable_low_height_spans(walkable_height);
        }
        ctx.stop_timer(TimerCategory::Filtering);

        // Step 3: compact and erode
        let mut chf = CompactHeightfield::build(ctx, walkable_height, walkable_climb, &hf)?;
        drop(hf);
        erode_walkable_area(ctx, config.walkable_radius(), &mut chf)?;
        ctx.check_cancelled()?;

        if chf.areas.iter().all(|&a| a == RC_NULL_AREA) {
            let cset = ContourSet::build(ctx, &chf, config.edge_max_error, config.max_edge_len(), BuildContoursFlags::default())?;
            let mesh = PolyMesh::build(ctx, &cset, config.max_verts_per_poly)?;
            return Ok((mesh, None, triangle_count));
        }

        // Step 4: regions
        let border_size = tile.border_size;
        match config.partition {
            PartitionType::Watershed => {
                build_distance_field(ctx, &mut chf)?;
                build_regions_watershed(
                    ctx,
                    &mut chf,
                    border_size,
                    config.min_region_area(),
                    config.merge_region_area(),
                )?;
            }
            PartitionType::Monotone => {
                build_regions_monotone(
                    ctx,
                    &mut chf,
                    border_size,
                    config.min_region_area(),
                    config.merge_region_area(),
                )?;
            }
            PartitionType::Layers => {
                build_layer_regions(ctx, &mut chf, border_size, config.min_region_area())?;
            }
        }
        ctx.check_cancelled()?;

        // Step 5: contours and polygons
        let cset = ContourSet::build(
            ctx,
            &chf,
            config.edge_max_error,
            config.max_edge_len(),
            BuildContoursFlags::default(),
        )?;
        let mut mesh = PolyMesh::build(ctx, &cset, config.max_verts_per_poly)?;
        for (flags, &area) in mesh.flags.iter_mut().zip(&mesh.areas) {
            if area != RC_NULL_AREA {
                *flags = POLY_FLAG_WALK;
            }
        }

        // Step 6: detail mesh
        let detail = if config.build_detail_mesh && mesh.npolys > 0 {
            Some(PolyMeshDetail::build(
                ctx,
                &mesh,
                &chf,
                config.detail_sample_dist_world(),
                config.detail_sample_max_error_world(),
            )?)
        } else {
            None
        };

        Ok((mesh, detail, triangle_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Affine3A;
    use navkit_common::{Mesh, MeshPart, MeshType, PrimFlags, SceneBuilder};

    fn floor_scene(obstacle: bool) -> Scene {
        let mut builder = SceneBuilder::new();
        builder
            .add_mesh(Mesh::new("floor", MeshType::AnalyticPlane, vec![MeshPart::plane(5.0, 5.0)]))
            .place("floor", 1, Affine3A::IDENTITY);
        if obstacle {
            builder
                .add_mesh(Mesh::new("box", MeshType::AnalyticShape, vec![MeshPart::unit_box()]))
                .place("box", 2, Affine3A::from_scale(Vec3::splat(2.0)));
        }
        builder.build()
    }

    fn single_tile(config: &RecastConfig) -> TileConfig {
        // 64 cells of 0.25 cover the 10 unit floor
        config.tile_config(Vec3::new(-8.0, 0.0, -8.0), -1.0, 5.0, 0, 0)
    }

    fn build(scene: &Scene) -> TileMesh {
        let config = RecastConfig::default();
        let builder = TileBuilder::new(config.clone()).unwrap();
        builder
            .build_tile(&mut BuildContext::new(), scene, &single_tile(&config), &[MeshTypeMask::all()])
            .unwrap()
    }

    fn poly_center(mesh: &PolyMesh, i: usize) -> Vec3 {
        let p = mesh.poly(i);
        p.iter().map(|&v| mesh.world_vertex(v as usize)).sum::<Vec3>() / p.len() as f32
    }

    #[test]
    fn test_flat_floor_builds_polygons() {
        let tile = build(&floor_scene(false));
        assert!(!tile.is_empty());
        assert!(tile.triangle_count >= 2);
        let mesh = &tile.poly_mesh;
        assert!(mesh.flags.iter().all(|&f| f == POLY_FLAG_WALK));
        // Eroded by the agent radius
        for i in 0..mesh.verts.len() {
            let v = mesh.world_vertex(i);
            assert!(v.x >= -4.6 && v.x <= 4.6 && v.z >= -4.6 && v.z <= 4.6, "{:?}", v);
        }
        assert_eq!(tile.detail_mesh.as_ref().map(|d| d.len()), Some(mesh.npolys));
    }

    #[test]
    fn test_rebuild_is_identical() {
        let scene = floor_scene(true);
        assert_eq!(build(&scene), build(&scene));
    }

    #[test]
    fn test_box_footprint_is_not_walkable() {
        let tile = build(&floor_scene(true));
        let mesh = &tile.poly_mesh;
        assert!(mesh.npolys > 1);
        for i in 0..mesh.npolys {
            let c = poly_center(mesh, i);
            assert!(!(c.x.abs() < 1.0 && c.z.abs() < 1.0), "polygon {} centered at {:?}", i, c);
        }
    }

    #[test]
    fn test_unwalkable_scene_gives_empty_tile() {
        let mut builder = SceneBuilder::new();
        builder
            .add_mesh(Mesh::new(
                "floor",
                MeshType::AnalyticPlane,
                vec![MeshPart::plane(5.0, 5.0).with_flags(PrimFlags::FORCE_UNWALKABLE)],
            ))
            .place("floor", 1, Affine3A::IDENTITY);
        let tile = build(&builder.build());
        assert!(tile.is_empty());
        assert!(tile.detail_mesh.is_none());
    }

    #[test]
    fn test_pass_mask_excludes_mesh_types() {
        let config = RecastConfig::default();
        let builder = TileBuilder::new(config.clone()).unwrap();
        let tile = builder
            .build_tile(
                &mut BuildContext::new(),
                &floor_scene(false),
                &single_tile(&config),
                &[MeshTypeMask::TERRAIN],
            )
            .unwrap();
        assert_eq!(tile.triangle_count, 0);
        assert!(tile.is_empty());
    }

    #[test]
    fn test_cancelled_build_returns_cancelled() {
        let config = RecastConfig::default();
        let builder = TileBuilder::new(config.clone()).unwrap();
        let token = navkit_common::CancellationToken::new();
        token.cancel();
        let mut ctx = BuildContext::with_cancellation(token);
        let err = builder
            .build_tile(&mut ctx, &floor_scene(false), &single_tile(&config), &[MeshTypeMask::all()])
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
