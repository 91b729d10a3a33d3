//! Scene description consumed by the navmesh builders
//!
//! A `Scene` is an immutable table of named meshes. Each mesh owns its local-space
//! geometry (one or more parts) and the list of placed instances. Builders only ever
//! read a scene, so it can be shared freely between tile jobs.

use bitflags::bitflags;
use glam::{Affine3A, Vec3};
use serde::{Deserialize, Serialize};

use crate::geometry::Aabb;

bitflags! {
    /// Per-primitive flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PrimFlags: u8 {
        /// Never walkable, regardless of slope
        const FORCE_UNWALKABLE = 0x01;
        /// Rasterized into the walk mesh but ignored by the flight volume
        const FLY_THROUGH = 0x02;
        /// Walkable but not a valid landing spot
        const UNLANDABLE = 0x04;
    }
}

impl PrimFlags {
    /// Applies instance overrides: `(base & !clear) | set`.
    ///
    /// This is the only place primitive and instance flags are combined.
    pub fn effective(self, set: PrimFlags, clear: PrimFlags) -> PrimFlags {
        (self & !clear) | set
    }
}

/// A triangle referencing three vertices of its part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primitive {
    /// Vertex indices into the owning part
    pub indices: [u32; 3],
    /// Material derived flags
    pub flags: PrimFlags,
}

impl Primitive {
    /// Creates a primitive with the given indices and flags
    pub fn new(v1: u32, v2: u32, v3: u32, flags: PrimFlags) -> Self {
        Self {
            indices: [v1, v2, v3],
            flags,
        }
    }
}

/// One vertex/triangle list of a mesh
#[derive(Debug, Clone, Default)]
pub struct MeshPart {
    /// Local-space vertices
    pub vertices: Vec<Vec3>,
    /// Triangles
    pub primitives: Vec<Primitive>,
}

impl MeshPart {
    /// Creates a part from raw vertices and triangles
    pub fn new(vertices: Vec<Vec3>, primitives: Vec<Primitive>) -> Self {
        Self {
            vertices,
            primitives,
        }
    }

    /// Local-space bounds of the part's vertices
    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(&self.vertices)
    }

    /// Sets `flags` on every primitive of the part
    pub fn with_flags(mut self, flags: PrimFlags) -> Self {
        for prim in &mut self.primitives {
            prim.flags |= flags;
        }
        self
    }
}

/// Geometry class of a mesh, used to include or exclude meshes per rasterization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeshType {
    /// Heightmap terrain
    Terrain,
    /// Arbitrary triangle soup loaded from a file
    FileMesh,
    /// Tessellated cylinder
    CylinderMesh,
    /// Box or sphere
    AnalyticShape,
    /// Infinite-ish flat plane
    AnalyticPlane,
}

bitflags! {
    /// Set of mesh types
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MeshTypeMask: u8 {
        const TERRAIN = 0x01;
        const FILE_MESH = 0x02;
        const CYLINDER_MESH = 0x04;
        const ANALYTIC_SHAPE = 0x08;
        const ANALYTIC_PLANE = 0x10;
    }
}

impl Default for MeshTypeMask {
    fn default() -> Self {
        Self::all()
    }
}

impl MeshType {
    /// The mask bit of this type
    pub fn mask(self) -> MeshTypeMask {
        match self {
            MeshType::Terrain => MeshTypeMask::TERRAIN,
            MeshType::FileMesh => MeshTypeMask::FILE_MESH,
            MeshType::CylinderMesh => MeshTypeMask::CYLINDER_MESH,
            MeshType::AnalyticShape => MeshTypeMask::ANALYTIC_SHAPE,
            MeshType::AnalyticPlane => MeshTypeMask::ANALYTIC_PLANE,
        }
    }
}

/// A placed copy of a mesh
#[derive(Debug, Clone)]
pub struct MeshInstance {
    /// Stable key supplied by the host
    pub id: u64,
    /// Local to world transform
    pub transform: Affine3A,
    /// Conservative world bounds of the transformed geometry
    pub world_bounds: Aabb,
    /// Flags forced on for every primitive
    pub force_set: PrimFlags,
    /// Flags forced off for every primitive
    pub force_clear: PrimFlags,
}

/// A named mesh with its geometry and instances
#[derive(Debug, Clone)]
pub struct Mesh {
    pub name: String,
    pub mesh_type: MeshType,
    pub parts: Vec<MeshPart>,
    pub instances: Vec<MeshInstance>,
}

impl Mesh {
    /// Creates a mesh without instances
    pub fn new(name: impl Into<String>, mesh_type: MeshType, parts: Vec<MeshPart>) -> Self {
        Self {
            name: name.into(),
            mesh_type,
            parts,
            instances: Vec::new(),
        }
    }

    /// Total number of triangles over all parts
    pub fn triangle_count(&self) -> usize {
        self.parts.iter().map(|p| p.primitives.len()).sum()
    }

    /// Exact world bounds of the mesh geometry under `transform`
    pub fn world_bounds(&self, transform: &Affine3A) -> Aabb {
        let mut bounds = Aabb::EMPTY;
        for part in &self.parts {
            for v in &part.vertices {
                bounds.grow(transform.transform_point3(*v));
            }
        }
        bounds
    }

    /// Visits every world-space triangle of `instance` with its effective flags.
    ///
    /// Triangles with out-of-range indices are skipped.
    pub fn for_each_world_triangle<F>(&self, instance: &MeshInstance, mut f: F)
    where
        F: FnMut([Vec3; 3], PrimFlags),
    {
        for part in &self.parts {
            let world: Vec<Vec3> = part
                .vertices
                .iter()
                .map(|v| instance.transform.transform_point3(*v))
                .collect();
            for prim in &part.primitives {
                let [a, b, c] = prim.indices.map(|i| world.get(i as usize).copied());
                if let (Some(a), Some(b), Some(c)) = (a, b, c) {
                    let flags = prim
                        .flags
                        .effective(instance.force_set, instance.force_clear);
                    f([a, b, c], flags);
                }
            }
        }
    }
}

/// Explicit point-to-point link, such as a teleporter pair or a jump
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffMeshLink {
    pub start: Vec3,
    pub end: Vec3,
    /// Snap radius at both endpoints
    pub radius: f32,
    /// Whether the link can be traversed from `end` to `start`
    pub bidirectional: bool,
    pub area: u8,
    pub flags: u16,
    /// Host supplied identifier
    pub user_id: u32,
}

/// Immutable scene description handed to the builders
#[derive(Debug, Clone, Default)]
pub struct Scene {
    meshes: Vec<Mesh>,
    supports_flight: bool,
    off_mesh_links: Vec<OffMeshLink>,
}

impl Scene {
    /// Meshes in insertion order
    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    /// Looks up a mesh by name
    pub fn mesh(&self, name: &str) -> Option<&Mesh> {
        self.meshes.iter().find(|m| m.name == name)
    }

    /// Whether a flight volume should be built for this scene
    pub fn supports_flight(&self) -> bool {
        self.supports_flight
    }

    /// Off-mesh links added by customization
    pub fn off_mesh_links(&self) -> &[OffMeshLink] {
        &self.off_mesh_links
    }

    /// Union of all instance bounds, `None` for a scene without instances
    pub fn bounds(&self) -> Option<Aabb> {
        let bounds = self
            .instances()
            .fold(Aabb::EMPTY, |acc, (_, inst)| acc.union(&inst.world_bounds));
        (!bounds.is_empty()).then_some(bounds)
    }

    /// Every instance together with its mesh
    pub fn instances(&self) -> impl Iterator<Item = (&Mesh, &MeshInstance)> {
        self.meshes
            .iter()
            .flat_map(|m| m.instances.iter().map(move |i| (m, i)))
    }

    /// Instances whose mesh type is in `mask` and whose world bounds overlap `bounds`
    pub fn instances_overlapping<'a>(
        &'a self,
        bounds: &'a Aabb,
        mask: MeshTypeMask,
    ) -> impl Iterator<Item = (&'a Mesh, &'a MeshInstance)> + 'a {
        self.instances().filter(move |(m, i)| {
            mask.contains(m.mesh_type.mask()) && i.world_bounds.overlaps(bounds)
        })
    }
}

/// Builds a `Scene` from meshes and instances
#[derive(Debug, Default)]
pub struct SceneBuilder {
    scene: Scene,
}

impl SceneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mesh, replacing any previous mesh with the same name
    pub fn add_mesh(&mut self, mesh: Mesh) -> &mut Self {
        if let Some(existing) = self.scene.meshes.iter_mut().find(|m| m.name == mesh.name) {
            *existing = mesh;
        } else {
            self.scene.meshes.push(mesh);
        }
        self
    }

    /// Places an instance of the named mesh.
    ///
    /// An unknown mesh name is logged and the instance contributes no geometry.
    pub fn add_instance(
        &mut self,
        mesh_name: &str,
        id: u64,
        transform: Affine3A,
        force_set: PrimFlags,
        force_clear: PrimFlags,
    ) -> &mut Self {
        match self.scene.meshes.iter_mut().find(|m| m.name == mesh_name) {
            Some(mesh) => {
                let world_bounds = mesh.world_bounds(&transform);
                mesh.instances.push(MeshInstance {
                    id,
                    transform,
                    world_bounds,
                    force_set,
                    force_clear,
                });
            }
            None => {
                log::warn!("Instance {} references unknown mesh '{}', skipping", id, mesh_name);
            }
        }
        self
    }

    /// Places an instance with no flag overrides
    pub fn place(&mut self, mesh_name: &str, id: u64, transform: Affine3A) -> &mut Self {
        self.add_instance(mesh_name, id, transform, PrimFlags::empty(), PrimFlags::empty())
    }

    pub fn supports_flight(&mut self, supports_flight: bool) -> &mut Self {
        self.scene.supports_flight = supports_flight;
        self
    }

    pub fn add_off_mesh_link(&mut self, link: OffMeshLink) -> &mut Self {
        self.scene.off_mesh_links.push(link);
        self
    }

    /// Finishes the scene
    pub fn build(&mut self) -> Scene {
        std::mem::take(&mut self.scene)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> MeshPart {
        MeshPart::new(
            vec![
                Vec3::new(-1.0, 0.0, -1.0),
                Vec3::new(-1.0, 0.0, 1.0),
                Vec3::new(1.0, 0.0, 1.0),
                Vec3::new(1.0, 0.0, -1.0),
            ],
            vec![
                Primitive::new(0, 1, 2, PrimFlags::UNLANDABLE),
                Primitive::new(0, 2, 3, PrimFlags::empty()),
            ],
        )
    }

    #[test]
    fn test_flag_merge() {
        let base = PrimFlags::UNLANDABLE | PrimFlags::FLY_THROUGH;
        let out = base.effective(PrimFlags::FORCE_UNWALKABLE, PrimFlags::FLY_THROUGH);
        assert_eq!(out, PrimFlags::UNLANDABLE | PrimFlags::FORCE_UNWALKABLE);

        // Set wins over clear
        let out = base.effective(PrimFlags::FLY_THROUGH, PrimFlags::FLY_THROUGH);
        assert!(out.contains(PrimFlags::FLY_THROUGH));
    }

    #[test]
    fn test_instance_bounds_are_world_space() {
        let mut builder = SceneBuilder::new();
        builder.add_mesh(Mesh::new("quad", MeshType::AnalyticPlane, vec![quad()]));
        builder.place("quad", 7, Affine3A::from_translation(Vec3::new(10.0, 2.0, 0.0)));
        let scene = builder.build();

        let (_, inst) = scene.instances().next().unwrap();
        assert_eq!(inst.id, 7);
        assert_eq!(inst.world_bounds.min, Vec3::new(9.0, 2.0, -1.0));
        assert_eq!(inst.world_bounds.max, Vec3::new(11.0, 2.0, 1.0));
        assert_eq!(scene.bounds(), Some(inst.world_bounds));
    }

    #[test]
    fn test_unknown_mesh_is_skipped() {
        let mut builder = SceneBuilder::new();
        builder.place("missing", 1, Affine3A::IDENTITY);
        let scene = builder.build();
        assert_eq!(scene.instances().count(), 0);
        assert!(scene.bounds().is_none());
    }

    #[test]
    fn test_world_triangles_apply_overrides() {
        let mut builder = SceneBuilder::new();
        builder.add_mesh(Mesh::new("quad", MeshType::FileMesh, vec![quad()]));
        builder.add_instance(
            "quad",
            1,
            Affine3A::IDENTITY,
            PrimFlags::FORCE_UNWALKABLE,
            PrimFlags::UNLANDABLE,
        );
        let scene = builder.build();
        let mesh = scene.mesh("quad").unwrap();

        let mut flags = Vec::new();
        mesh.for_each_world_triangle(&mesh.instances[0], |_, f| flags.push(f));
        assert_eq!(flags, vec![PrimFlags::FORCE_UNWALKABLE; 2]);
    }

    #[test]
    fn test_overlap_filter_respects_mask() {
        let mut builder = SceneBuilder::new();
        builder.add_mesh(Mesh::new("quad", MeshType::Terrain, vec![quad()]));
        builder.place("quad", 1, Affine3A::IDENTITY);
        let scene = builder.build();

        let bounds = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        assert_eq!(scene.instances_overlapping(&bounds, MeshTypeMask::TERRAIN).count(), 1);
        assert_eq!(scene.instances_overlapping(&bounds, MeshTypeMask::FILE_MESH).count(), 0);
    }
}
