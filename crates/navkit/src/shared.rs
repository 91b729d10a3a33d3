//! Published navmesh shared between query threads and the builder

use std::sync::{Arc, RwLock};

use navkit_common::{Aabb, Result, Scene};

use crate::builder::{BuildReport, NavmeshBuilder};
use crate::Navmesh;

/// Current navmesh of a scene.
///
/// Queries take a [`snapshot`](SharedNavmesh::snapshot) and keep using it for as
/// long as they like; publishing swaps in a new navmesh without touching the one
/// readers hold.
#[derive(Debug, Clone)]
pub struct SharedNavmesh {
    current: Arc<RwLock<Arc<Navmesh>>>,
}

impl SharedNavmesh {
    pub fn new(navmesh: Navmesh) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(navmesh))),
        }
    }

    /// The navmesh published last
    pub fn snapshot(&self) -> Arc<Navmesh> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Replaces the published navmesh, returning the previous one
    pub fn publish(&self, navmesh: Navmesh) -> Arc<Navmesh> {
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, Arc::new(navmesh))
    }

    /// Rebuilds the tiles overlapping `bounds` and publishes the result.
    ///
    /// Nothing is published when the rebuild fails or is cancelled.
    pub fn rebuild_region(&self, builder: &NavmeshBuilder, scene: &Scene, bounds: &Aabb) -> Result<BuildReport> {
        let base = self.snapshot();
        let (navmesh, report) = builder.rebuild_region(&base, scene, bounds)?;
        self.publish(navmesh);
        log::info!(
            "Published navmesh after rebuilding {} tiles in {:?}",
            report.built_tiles + report.empty_tiles,
            report.elapsed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuildSettings;
    use glam::{Affine3A, Vec3};
    use navkit_common::{CancellationToken, Mesh, MeshPart, MeshType, SceneBuilder};

    fn scene(with_box: bool) -> Scene {
        let mut builder = SceneBuilder::new();
        builder
            .add_mesh(Mesh::new("floor", MeshType::AnalyticPlane, vec![MeshPart::plane(5.0, 5.0)]))
            .add_mesh(Mesh::new("crate", MeshType::AnalyticShape, vec![MeshPart::cuboid(Vec3::splat(1.0))]))
            .place("floor", 1, Affine3A::IDENTITY);
        if with_box {
            builder.place("crate", 2, Affine3A::IDENTITY);
        }
        builder.build()
    }

    #[test]
    fn test_snapshots_survive_publish() {
        let builder = NavmeshBuilder::new(BuildSettings::default()).unwrap();
        let (navmesh, _) = builder.build(&scene(false)).unwrap();
        let shared = SharedNavmesh::new(navmesh);

        let before = shared.snapshot();
        let polys_before = before.poly_count();
        let bounds = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let report = shared.rebuild_region(&builder, &scene(true), &bounds).unwrap();
        assert_eq!(report.built_tiles, 1);

        let after = shared.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.poly_count(), polys_before);
        assert!(after.poly_count() > polys_before);
    }

    #[test]
    fn test_cancelled_rebuild_keeps_published_navmesh() {
        let token = CancellationToken::new();
        let builder = NavmeshBuilder::new(BuildSettings::default())
            .unwrap()
            .with_cancellation(token.clone());
        let (navmesh, _) = builder.build(&scene(false)).unwrap();
        let shared = SharedNavmesh::new(navmesh);
        let before = shared.snapshot();

        token.cancel();
        let bounds = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let err = shared.rebuild_region(&builder, &scene(true), &bounds).unwrap_err();
        assert!(err.is_cancelled());
        assert!(Arc::ptr_eq(&before, &shared.snapshot()));
    }
}
