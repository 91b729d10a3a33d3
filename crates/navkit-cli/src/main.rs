//! Command line tool for building and querying navmeshes

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use glam::{Affine3A, Vec3};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use navkit::{BuildSettings, Navmesh, NavmeshBuilder, PathSettings, WalkPathMode, WalkPathOptions};
use navkit_common::{load_obj_mesh, parse_obj_mesh, Mesh, MeshType, Scene, SceneBuilder};

/// Builds walk and flight navigation data from OBJ meshes and runs path queries on it
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a navmesh file from OBJ meshes
    Build {
        /// Obstacle meshes (OBJ format)
        #[clap(long, value_parser)]
        input: Vec<PathBuf>,

        /// Terrain meshes (OBJ format)
        #[clap(long, value_parser)]
        terrain: Vec<PathBuf>,

        /// Output navmesh file
        #[clap(long, value_parser)]
        output: PathBuf,

        /// Build settings (JSON); defaults are used when absent
        #[clap(long, value_parser)]
        settings: Option<PathBuf>,

        /// Also build the flight volume
        #[clap(long)]
        flight: bool,
    },

    /// Find a path on a navmesh file
    Path {
        /// Navmesh file
        #[clap(long, value_parser)]
        mesh: PathBuf,

        /// Start position (x,y,z)
        #[clap(long, value_parser = parse_vector)]
        start: Vec3,

        /// End position (x,y,z)
        #[clap(long, value_parser = parse_vector)]
        end: Vec3,

        /// Customization version the navmesh was built with
        #[clap(long, default_value = "0")]
        customization_version: i32,

        /// Search the flight volume instead of the walkable surface
        #[clap(long)]
        fly: bool,

        /// Allow any-angle shortcuts when walking
        #[clap(long)]
        any_angle: bool,

        /// Return polygon centers instead of a taut path when walking
        #[clap(long)]
        poly_centers: bool,

        /// Output path file
        #[clap(long, value_parser)]
        output: Option<PathBuf>,
    },

    /// Print a summary of a navmesh file
    Info {
        /// Navmesh file
        #[clap(long, value_parser)]
        mesh: PathBuf,

        /// Customization version the navmesh was built with
        #[clap(long, default_value = "0")]
        customization_version: i32,
    },
}

/// Parse a comma-separated vector
fn parse_vector(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').collect();

    if parts.len() != 3 {
        return Err(format!("Vector must have 3 components, got {}", parts.len()));
    }

    let x = parts[0].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let y = parts[1].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let z = parts[2].trim().parse::<f32>().map_err(|e| e.to_string())?;

    Ok(Vec3::new(x, y, z))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Commands::Build {
            input,
            terrain,
            output,
            settings,
            flight,
        } => build_navmesh(&input, &terrain, &output, settings.as_deref(), flight),
        Commands::Path {
            mesh,
            start,
            end,
            customization_version,
            fly,
            any_angle,
            poly_centers,
            output,
        } => {
            let navmesh = load_navmesh(&mesh, customization_version)?;
            let points = if fly {
                fly_path(&navmesh, start, end)?
            } else {
                walk_path(&navmesh, start, end, any_angle, poly_centers)?
            };
            write_path(&points, start, end, output.as_deref())
        }
        Commands::Info {
            mesh,
            customization_version,
        } => {
            let navmesh = load_navmesh(&mesh, customization_version)?;
            print!("{}", describe(&navmesh));
            Ok(())
        }
    }
}

/// Scene with every mesh placed once at the origin
fn load_scene(input: &[PathBuf], terrain: &[PathBuf], flight: bool) -> Result<Scene> {
    let mut builder = SceneBuilder::new();
    let mut id = 0;

    for path in input {
        let name = path.display().to_string();
        let mesh = load_obj_mesh(path, &name);
        if mesh.parts.is_empty() {
            bail!("No geometry could be read from {}", path.display());
        }
        id += 1;
        builder.add_mesh(mesh).place(&name, id, Affine3A::IDENTITY);
    }

    for path in terrain {
        let name = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read terrain: {}", path.display()))?;
        let part = parse_obj_mesh(&text).with_context(|| format!("Failed to parse terrain: {}", path.display()))?;
        id += 1;
        builder
            .add_mesh(Mesh::new(name.as_str(), MeshType::Terrain, vec![part]))
            .place(&name, id, Affine3A::IDENTITY);
    }

    if id == 0 {
        bail!("No input meshes given");
    }
    Ok(builder.supports_flight(flight).build())
}

/// Build a navmesh file from OBJ meshes
fn build_navmesh(
    input: &[PathBuf],
    terrain: &[PathBuf],
    output: &Path,
    settings: Option<&Path>,
    flight: bool,
) -> Result<()> {
    let settings = match settings {
        Some(path) => BuildSettings::load(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?,
        None => BuildSettings::default(),
    };
    let scene = load_scene(input, terrain, flight)?;
    log::info!("Loaded {} meshes", scene.meshes().len());

    let builder = NavmeshBuilder::new(settings).context("Invalid build settings")?;
    let (navmesh, report) = builder.build(&scene).context("Navmesh build failed")?;

    println!(
        "Built {} tiles ({} empty) in {:?}",
        report.built_tiles, report.empty_tiles, report.elapsed
    );
    for failure in &report.failed_tiles {
        println!("Tile ({}, {}) failed: {}", failure.x, failure.z, failure.reason);
    }
    if report.voxel_cells > 0 {
        println!("Voxelized {} flight cells", report.voxel_cells);
    }

    navmesh
        .save(output)
        .with_context(|| format!("Failed to save navmesh: {}", output.display()))?;
    println!("Saved navmesh to {}", output.display());
    Ok(())
}

fn load_navmesh(path: &Path, customization_version: i32) -> Result<Navmesh> {
    Navmesh::load(path, customization_version).with_context(|| format!("Failed to load navmesh: {}", path.display()))
}

fn walk_path(navmesh: &Navmesh, start: Vec3, end: Vec3, any_angle: bool, poly_centers: bool) -> Result<Vec<Vec3>> {
    let options = WalkPathOptions {
        mode: if poly_centers {
            WalkPathMode::PolyCenters
        } else {
            WalkPathMode::Straight
        },
        any_angle,
        ..WalkPathOptions::default()
    };
    let path = navmesh
        .walk_path(start, end, &options)?
        .ok_or_else(|| anyhow!("No walking path from {} to {}", start, end))?;
    if path.partial {
        println!("Goal is unreachable, path ends as close to it as possible");
    }
    if !path.off_mesh_points.is_empty() {
        println!("Path uses {} off-mesh connections", path.off_mesh_points.len());
    }
    Ok(path.points)
}

fn fly_path(navmesh: &Navmesh, start: Vec3, end: Vec3) -> Result<Vec<Vec3>> {
    if !navmesh.supports_flight() {
        bail!("Navmesh has no flight volume");
    }
    let path = navmesh
        .fly_path(start, end, &PathSettings::default())?
        .ok_or_else(|| anyhow!("No flight path from {} to {}", start, end))?;
    println!("Flight search took {} steps", path.steps);
    Ok(path.points)
}

fn write_path(points: &[Vec3], start: Vec3, end: Vec3, output: Option<&Path>) -> Result<()> {
    if let Some(output_path) = output {
        let mut file = File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;

        writeln!(file, "# Path from {} to {}", start, end)?;
        writeln!(file, "# {} waypoints", points.len())?;
        for p in points {
            writeln!(file, "{},{},{}", p.x, p.y, p.z)?;
        }
        println!("Saved {} waypoints to {}", points.len(), output_path.display());
    } else {
        println!("Path:");
        for (i, p) in points.iter().enumerate() {
            println!("{}: {},{},{}", i, p.x, p.y, p.z);
        }
    }
    Ok(())
}

fn describe(navmesh: &Navmesh) -> String {
    let params = navmesh.nav_mesh.params();
    let mut out = String::new();
    out += &format!("Customization version: {}\n", navmesh.customization_version);
    out += &format!(
        "Tiles: {} of {} ({} x {} units)\n",
        navmesh.nav_mesh.tile_count(),
        params.max_tiles,
        params.tile_width,
        params.tile_height
    );
    out += &format!("Polygons: {}\n", navmesh.poly_count());
    let links: usize = navmesh.nav_mesh.tiles().map(|t| t.off_mesh_cons.len()).sum();
    out += &format!("Off-mesh connections: {}\n", links);
    match &navmesh.voxel_map {
        Some(map) => {
            let bounds = map.bounds();
            out += &format!(
                "Flight volume: levels {:?}, voxel {} from {} to {}\n",
                map.levels(),
                map.voxel_size(),
                bounds.min,
                bounds.max
            );
        }
        None => out += "Flight volume: none\n",
    }
    out
}
