//! Navigation mesh query implementation for Detour
//!
//! This module contains the NavMeshQuery structure, which runs polygon searches
//! over a [`NavMesh`]: nearest polygon lookup, A* over the link graph, string
//! pulling, raycasts along the surface and flood fills.

use bitflags::bitflags;
use glam::Vec3;

use navkit_common::{dist_pt_seg_sqr_2d, intersect_segment_poly_2d, point_in_polygon_2d, tri_area_2d, Result};

use crate::nav_mesh::MeshTile;
use crate::node_pool::{NodeIndex, NodePool, NodeQueue, NODE_CLOSED, NODE_OPEN, NULL_NODE};
use crate::{NavMesh, Poly, PolyRef, PolyType, QueryFilter, Status, DT_LINK_INTERNAL, MAX_VERTS_PER_POLY};

/// Maximum number of nodes in the search pool
const DT_MAX_NODES: usize = 4096;

/// Heuristic scale keeping A* admissible
const H_SCALE: f32 = 0.999;

/// Node flag: parent is not adjacent, the gap was crossed by a raycast
const NODE_PARENT_DETACHED: u8 = 0x04;

bitflags! {
    /// Vertex flags of a straight path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StraightPathFlags: u8 {
        /// The vertex is the start position
        const START = 0x01;
        /// The vertex is the end position
        const END = 0x02;
        /// The vertex is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// String-pulled path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StraightPath {
    pub points: Vec<Vec3>,
    pub flags: Vec<StraightPathFlags>,
    /// Polygon entered at each point, null for the end point
    pub polys: Vec<PolyRef>,
    /// `Success`, or `PartialResult`/`BufferTooSmall` when the path was cut short
    pub status: Status,
}

impl StraightPath {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Adds a vertex, merging it into the previous one when they coincide.
    /// Returns false once the path is complete.
    fn append(&mut self, pos: Vec3, flags: StraightPathFlags, poly: PolyRef, max_points: usize) -> bool {
        if let Some(last) = self.points.last() {
            if vequal(*last, pos) {
                let n = self.points.len() - 1;
                self.flags[n] = flags;
                self.polys[n] = poly;
                return !flags.contains(StraightPathFlags::END);
            }
        }
        self.points.push(pos);
        self.flags.push(flags);
        self.polys.push(poly);

        if self.points.len() >= max_points {
            if !flags.contains(StraightPathFlags::END) {
                self.status = Status::BufferTooSmall;
            }
            return false;
        }
        !flags.contains(StraightPathFlags::END)
    }
}

/// Result of a raycast along the mesh surface
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Fraction of the segment travelled before hitting a wall, `f32::MAX` when
    /// the end point was reached
    pub t: f32,
    /// Normal of the wall that was hit
    pub hit_normal: Vec3,
    /// Edge of the last polygon that was hit
    pub hit_edge: Option<usize>,
    /// Polygons visited
    pub path: Vec<PolyRef>,
    /// Cost of the visited part of the segment
    pub path_cost: f32,
}

impl RaycastHit {
    pub fn reached_end(&self) -> bool {
        self.t == f32::MAX
    }
}

/// Options for [`NavMeshQuery::find_path_with_options`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FindPathOptions {
    /// Try to reach each polygon straight from its grandparent with a raycast
    pub any_angle: bool,
    /// Raycasts are only attempted over shorter distances than this
    pub raycast_limit: f32,
}

impl Default for FindPathOptions {
    fn default() -> Self {
        Self {
            any_angle: false,
            raycast_limit: 25.0,
        }
    }
}

#[inline]
fn vequal(a: Vec3, b: Vec3) -> bool {
    const THR: f32 = 1.0 / 16384.0;
    a.distance_squared(b) < THR * THR
}

/// Navigation mesh query object
pub struct NavMeshQuery<'a> {
    nav_mesh: &'a NavMesh,
    node_pool: NodePool,
    open_list: NodeQueue,
}

impl<'a> NavMeshQuery<'a> {
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        Self {
            nav_mesh,
            node_pool: NodePool::new(DT_MAX_NODES),
            open_list: NodeQueue::new(),
        }
    }

    fn tile_and_poly(&self, reference: PolyRef) -> Result<(&'a MeshTile, usize, &'a Poly)> {
        let (tile, index) = self.nav_mesh.get_tile_poly_index(reference)?;
        Ok((tile, index, &tile.polys[index]))
    }

    /// Nearest polygon to `center` within the box of `half_extents`
    pub fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Result<Option<(PolyRef, Vec3)>> {
        if !center.is_finite() || !half_extents.is_finite() || half_extents.min_element() < 0.0 {
            return Err(Status::InvalidParam.into());
        }

        let candidates = self
            .nav_mesh
            .query_polygons(center - half_extents, center + half_extents, filter);

        let mut best: Option<(PolyRef, Vec3, f32)> = None;
        for reference in candidates {
            let (tile, index, _) = self.tile_and_poly(reference)?;
            let (pt, over) = tile.closest_point_on_poly(index, center);
            let d = if over {
                // Directly above, only the height above climb range counts
                let dy = (center.y - pt.y).abs() - tile.header.walkable_climb;
                if dy > 0.0 {
                    dy * dy
                } else {
                    0.0
                }
            } else {
                center.distance_squared(pt)
            };
            if best.map_or(true, |(_, _, bd)| d < bd) {
                best = Some((reference, pt, d));
            }
        }
        Ok(best.map(|(r, p, _)| (r, p)))
    }

    /// `pos` when it lies inside the polygon, otherwise the closest point on its edges
    fn closest_point_on_poly_boundary(&self, reference: PolyRef, pos: Vec3) -> Result<Vec3> {
        let (tile, _, poly) = self.tile_and_poly(reference)?;
        let mut corners = [Vec3::ZERO; MAX_VERTS_PER_POLY];
        let n = tile.poly_corners(poly, &mut corners);
        let corners = &corners[..n];

        if n > 2 && point_in_polygon_2d(pos, corners) {
            return Ok(pos);
        }

        let mut best = (f32::MAX, corners.first().copied().unwrap_or(pos));
        for j in 0..n {
            let (a, b) = (corners[j], corners[(j + 1) % n]);
            let (d, t) = dist_pt_seg_sqr_2d(pos, a, b);
            if d < best.0 {
                best = (d, a.lerp(b, t));
            }
        }
        Ok(best.1)
    }

    /// Left and right end points of the portal from `from` to `to`, with the
    /// polygon types on both sides
    fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<(Vec3, Vec3, PolyType, PolyType)> {
        let (from_tile, _, from_poly) = self.tile_and_poly(from)?;
        let (to_tile, _, to_poly) = self.tile_and_poly(to)?;
        let link = from_poly
            .links
            .iter()
            .find(|l| l.reference == to)
            .ok_or(Status::InvalidParam)?;

        if from_poly.poly_type == PolyType::OffMeshConnection {
            let v = from_tile.verts[from_poly.verts[link.edge as usize] as usize];
            return Ok((v, v, from_poly.poly_type, to_poly.poly_type));
        }
        if to_poly.poly_type == PolyType::OffMeshConnection {
            let back = to_poly
                .links
                .iter()
                .find(|l| l.reference == from)
                .ok_or(Status::InvalidParam)?;
            let v = to_tile.verts[to_poly.verts[back.edge as usize] as usize];
            return Ok((v, v, from_poly.poly_type, to_poly.poly_type));
        }

        let nv = from_poly.vert_count as usize;
        let edge = link.edge as usize;
        let v0 = from_tile.verts[from_poly.verts[edge] as usize];
        let v1 = from_tile.verts[from_poly.verts[(edge + 1) % nv] as usize];
        let (mut left, mut right) = (v0, v1);

        // Tile portals may cover only part of the edge
        if link.side != DT_LINK_INTERNAL && (link.bmin != 0 || link.bmax != 255) {
            let s = 1.0 / 255.0;
            left = v0.lerp(v1, link.bmin as f32 * s);
            right = v0.lerp(v1, link.bmax as f32 * s);
        }
        Ok((left, right, from_poly.poly_type, to_poly.poly_type))
    }

    /// Midpoint of the portal between two polygons
    fn get_edge_mid_point(&self, from: PolyRef, to: PolyRef) -> Result<Vec3> {
        let (left, right, _, _) = self.get_portal_points(from, to)?;
        Ok((left + right) * 0.5)
    }

    /// Finds a polygon corridor from `start_ref` to `end_ref`.
    ///
    /// The status is `PartialResult` when the goal was not reached, in which case
    /// the corridor leads to the polygon closest to the goal.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<(Vec<PolyRef>, Status)> {
        self.find_path_with_options(start_ref, end_ref, start_pos, end_pos, filter, FindPathOptions::default())
    }

    pub fn find_path_with_options(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        options: FindPathOptions,
    ) -> Result<(Vec<PolyRef>, Status)> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) || !self.nav_mesh.is_valid_poly_ref(end_ref) {
            return Err(Status::InvalidRef.into());
        }
        if !start_pos.is_finite() || !end_pos.is_finite() {
            return Err(Status::InvalidParam.into());
        }
        if start_ref == end_ref {
            return Ok((vec![start_ref], Status::Success));
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start = self.node_pool.get_or_insert(start_ref).ok_or(Status::OutOfNodes)?;
        {
            let node = self.node_pool.node_mut(start);
            node.pos = start_pos;
            node.cost = 0.0;
            node.total = start_pos.distance(end_pos) * H_SCALE;
            node.flags = NODE_OPEN;
        }
        self.open_list.push(&self.node_pool, start);

        let mut last_best = start;
        let mut last_best_cost = self.node_pool.node(start).total;
        let mut out_of_nodes = false;
        let limit_sqr = options.raycast_limit * options.raycast_limit;

        while let Some(best) = self.open_list.pop(&self.node_pool) {
            {
                let node = self.node_pool.node_mut(best);
                node.flags &= !NODE_OPEN;
                node.flags |= NODE_CLOSED;
            }
            let best_node = self.node_pool.node(best).clone();
            if best_node.poly == end_ref {
                last_best = best;
                break;
            }

            let (_, _, best_poly) = self.tile_and_poly(best_node.poly)?;
            let parent_ref = (best_node.parent != NULL_NODE).then(|| self.node_pool.node(best_node.parent).poly);
            let grandparent = best_node.parent;

            for link in &best_poly.links {
                let neighbour = link.reference;
                if !neighbour.is_valid() || Some(neighbour) == parent_ref {
                    continue;
                }
                let Ok((_, _, neighbour_poly)) = self.tile_and_poly(neighbour) else {
                    continue;
                };
                if !filter.pass_filter(neighbour_poly) {
                    continue;
                }

                let Some(idx) = self.node_pool.get_or_insert(neighbour) else {
                    out_of_nodes = true;
                    continue;
                };

                let neighbour_pos = if self.node_pool.node(idx).flags == 0 {
                    let mid = self.get_edge_mid_point(best_node.poly, neighbour)?;
                    self.node_pool.node_mut(idx).pos = mid;
                    mid
                } else {
                    self.node_pool.node(idx).pos
                };

                // Shortcut from the grandparent when the surface between is clear
                let mut shortcut_cost = None;
                if options.any_angle && grandparent != NULL_NODE {
                    let gp = self.node_pool.node(grandparent).clone();
                    if gp.pos.distance_squared(neighbour_pos) < limit_sqr {
                        if let Ok(hit) = self.raycast(gp.poly, gp.pos, neighbour_pos, filter) {
                            let ends_here = hit
                                .path
                                .last()
                                .is_some_and(|&last| last == neighbour || last == best_node.poly);
                            if hit.reached_end() && ends_here {
                                shortcut_cost = Some(gp.cost + hit.path_cost);
                            }
                        }
                    }
                }

                let (cost, heuristic) = if neighbour == end_ref {
                    let step = match shortcut_cost {
                        Some(c) => c,
                        None => best_node.cost + filter.cost(best_node.pos, neighbour_pos, best_poly),
                    };
                    (step + filter.cost(neighbour_pos, end_pos, neighbour_poly), 0.0)
                } else {
                    let step = match shortcut_cost {
                        Some(c) => c,
                        None => best_node.cost + filter.cost(best_node.pos, neighbour_pos, best_poly),
                    };
                    (step, neighbour_pos.distance(end_pos) * H_SCALE)
                };
                let total = cost + heuristic;

                let node = self.node_pool.node(idx);
                if node.flags & (NODE_OPEN | NODE_CLOSED) != 0 && total >= node.total {
                    continue;
                }
                let was_open = node.flags & NODE_OPEN != 0;

                let node = self.node_pool.node_mut(idx);
                node.cost = cost;
                node.total = total;
                node.flags &= !(NODE_CLOSED | NODE_PARENT_DETACHED);
                if shortcut_cost.is_some() {
                    node.parent = grandparent;
                    node.flags |= NODE_PARENT_DETACHED;
                } else {
                    node.parent = best;
                }

                if was_open {
                    self.open_list.modify(&self.node_pool, idx);
                } else {
                    self.node_pool.node_mut(idx).flags |= NODE_OPEN;
                    self.open_list.push(&self.node_pool, idx);
                }

                if heuristic < last_best_cost {
                    last_best_cost = heuristic;
                    last_best = idx;
                }
            }
        }

        let path = self.reconstruct(last_best, filter)?;
        let reached = path.last() == Some(&end_ref);
        if out_of_nodes {
            log::debug!("Polygon search ran out of nodes after {} nodes", self.node_pool.len());
        }
        Ok((path, if reached { Status::Success } else { Status::PartialResult }))
    }

    /// Walks the parent chain, filling gaps left by raycast shortcuts
    fn reconstruct(&self, end: NodeIndex, filter: &QueryFilter) -> Result<Vec<PolyRef>> {
        let mut chain = Vec::new();
        let mut idx = end;
        while idx != NULL_NODE {
            chain.push(idx);
            idx = self.node_pool.node(idx).parent;
        }
        chain.reverse();

        let mut path = Vec::with_capacity(chain.len());
        for (i, &idx) in chain.iter().enumerate() {
            let node = self.node_pool.node(idx);
            if i > 0 && node.flags & NODE_PARENT_DETACHED != 0 {
                let prev = self.node_pool.node(chain[i - 1]);
                let hit = self.raycast(prev.poly, prev.pos, node.pos, filter)?;
                path.extend(hit.path.iter().skip(1).copied());
            }
            if path.last() != Some(&node.poly) {
                path.push(node.poly);
            }
        }
        Ok(path)
    }

    /// String-pulls a polygon corridor into straight segments
    pub fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<StraightPath> {
        if path.is_empty() || max_points == 0 {
            return Err(Status::InvalidParam.into());
        }

        let mut out = StraightPath {
            status: Status::Success,
            ..StraightPath::default()
        };
        let start = self.closest_point_on_poly_boundary(path[0], start_pos)?;
        let mut closest_end = self.closest_point_on_poly_boundary(path[path.len() - 1], end_pos)?;

        if !out.append(start, StraightPathFlags::START, path[0], max_points) {
            return Ok(out);
        }

        if path.len() > 1 {
            let mut apex = start;
            let mut portal_left = start;
            let mut portal_right = start;
            let (mut apex_index, mut left_index, mut right_index) = (0usize, 0usize, 0usize);
            let mut left_type = PolyType::Ground;
            let mut right_type = PolyType::Ground;
            let mut left_ref = path[0];
            let mut right_ref = path[0];

            let mut i = 0;
            while i < path.len() {
                let (left, right, to_type) = if i + 1 < path.len() {
                    match self.get_portal_points(path[i], path[i + 1]) {
                        Ok((l, r, _, to)) => {
                            // Starting on the first portal, skip it
                            if i == 0 && dist_pt_seg_sqr_2d(apex, l, r).0 < 0.001 * 0.001 {
                                i += 1;
                                continue;
                            }
                            (l, r, to)
                        }
                        Err(_) => {
                            // The corridor is broken, end at the last valid polygon
                            closest_end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                            out.append(closest_end, StraightPathFlags::empty(), path[i], max_points);
                            out.status = Status::PartialResult;
                            return Ok(out);
                        }
                    }
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };
                let next_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);

                // Right vertex
                if tri_area_2d(apex, portal_right, right) <= 0.0 {
                    if vequal(apex, portal_right) || tri_area_2d(apex, portal_left, right) > 0.0 {
                        portal_right = right;
                        right_ref = next_ref;
                        right_type = to_type;
                        right_index = i;
                    } else {
                        apex = portal_left;
                        apex_index = left_index;
                        let flags = corner_flags(left_ref, left_type);
                        if !out.append(apex, flags, left_ref, max_points) {
                            return Ok(out);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex
                if tri_area_2d(apex, portal_left, left) >= 0.0 {
                    if vequal(apex, portal_left) || tri_area_2d(apex, portal_right, left) < 0.0 {
                        portal_left = left;
                        left_ref = next_ref;
                        left_type = to_type;
                        left_index = i;
                    } else {
                        apex = portal_right;
                        apex_index = right_index;
                        let flags = corner_flags(right_ref, right_type);
                        if !out.append(apex, flags, right_ref, max_points) {
                            return Ok(out);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        out.append(closest_end, StraightPathFlags::END, PolyRef::NULL, max_points);
        Ok(out)
    }

    /// Centers of the corridor polygons followed by `end_pos`
    pub fn poly_center_path(&self, path: &[PolyRef], end_pos: Vec3) -> Result<Vec<Vec3>> {
        let mut points = path
            .iter()
            .map(|&r| self.nav_mesh.poly_center(r))
            .collect::<Result<Vec<_>>>()?;
        points.push(end_pos);
        Ok(points)
    }

    /// Casts a ray along the surface from `start_pos` inside `start_ref` towards `end_pos`
    pub fn raycast(&self, start_ref: PolyRef, start_pos: Vec3, end_pos: Vec3, filter: &QueryFilter) -> Result<RaycastHit> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Status::InvalidRef.into());
        }
        if !start_pos.is_finite() || !end_pos.is_finite() {
            return Err(Status::InvalidParam.into());
        }

        let mut hit = RaycastHit {
            t: 0.0,
            hit_normal: Vec3::ZERO,
            hit_edge: None,
            path: Vec::new(),
            path_cost: 0.0,
        };
        let dir = end_pos - start_pos;
        let mut cur_ref = start_ref;
        let mut last_pos = start_pos;

        loop {
            let (tile, _, poly) = self.tile_and_poly(cur_ref)?;
            let mut corners = [Vec3::ZERO; MAX_VERTS_PER_POLY];
            let n = tile.poly_corners(poly, &mut corners);

            let Some((_, tmax, _, seg_max)) = intersect_segment_poly_2d(start_pos, end_pos, &corners[..n]) else {
                // The ray left the corridor through a vertex
                return Ok(hit);
            };
            hit.hit_edge = seg_max;
            if tmax > hit.t {
                hit.t = tmax;
            }
            hit.path.push(cur_ref);

            let Some(edge) = seg_max else {
                // Reached the end point inside this polygon
                hit.t = f32::MAX;
                hit.path_cost += filter.cost(last_pos, end_pos, poly);
                return Ok(hit);
            };

            let mut next_ref = PolyRef::NULL;
            for link in poly.links.iter().filter(|l| l.edge as usize == edge) {
                let Ok((_, _, next_poly)) = self.tile_and_poly(link.reference) else {
                    continue;
                };
                if next_poly.poly_type == PolyType::OffMeshConnection || !filter.pass_filter(next_poly) {
                    continue;
                }
                if link.side == DT_LINK_INTERNAL || (link.bmin == 0 && link.bmax == 255) {
                    next_ref = link.reference;
                    break;
                }

                // Partial portal, check the crossing point lies inside the link range
                let v0 = corners[edge];
                let v1 = corners[(edge + 1) % n];
                let s = 1.0 / 255.0;
                let (a, b, c) = if link.side == 0 || link.side == 4 {
                    (v0.z, v1.z, start_pos.z + dir.z * tmax)
                } else {
                    (v0.x, v1.x, start_pos.x + dir.x * tmax)
                };
                let mut lmin = a + (b - a) * (link.bmin as f32 * s);
                let mut lmax = a + (b - a) * (link.bmax as f32 * s);
                if lmin > lmax {
                    std::mem::swap(&mut lmin, &mut lmax);
                }
                if c >= lmin && c <= lmax {
                    next_ref = link.reference;
                    break;
                }
            }

            let cur_pos = start_pos + dir * hit.t;
            hit.path_cost += filter.cost(last_pos, cur_pos, poly);
            last_pos = cur_pos;

            if !next_ref.is_valid() {
                let va = corners[edge];
                let vb = corners[(edge + 1) % n];
                hit.hit_normal = Vec3::new(vb.z - va.z, 0.0, -(vb.x - va.x)).normalize_or_zero();
                return Ok(hit);
            }
            cur_ref = next_ref;
        }
    }

    /// Polygons connected to `start_ref`, in depth-first order
    pub fn find_reachable_polys(&self, start_ref: PolyRef, filter: &QueryFilter) -> Result<Vec<PolyRef>> {
        let (_, _, start_poly) = self.tile_and_poly(start_ref)?;
        if !filter.pass_filter(start_poly) {
            return Ok(Vec::new());
        }

        let mut visited = std::collections::HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![start_ref];
        visited.insert(start_ref);

        while let Some(cur) = stack.pop() {
            order.push(cur);
            let (_, _, poly) = self.tile_and_poly(cur)?;
            for link in &poly.links {
                let next = link.reference;
                if visited.contains(&next) {
                    continue;
                }
                let Ok((_, _, next_poly)) = self.tile_and_poly(next) else {
                    continue;
                };
                if filter.pass_filter(next_poly) {
                    visited.insert(next);
                    stack.push(next);
                }
            }
        }
        Ok(order)
    }

    /// Highest surface point under `(x, z)` at or below `ref_y`, searching at most
    /// `max_depth` downwards
    pub fn find_point_on_floor(
        &self,
        x: f32,
        z: f32,
        ref_y: f32,
        max_depth: f32,
        filter: &QueryFilter,
    ) -> Result<Option<(PolyRef, Vec3)>> {
        const PRISM_HALF_WIDTH: f32 = 0.01;
        let bmin = Vec3::new(x - PRISM_HALF_WIDTH, ref_y - max_depth, z - PRISM_HALF_WIDTH);
        let bmax = Vec3::new(x + PRISM_HALF_WIDTH, ref_y, z + PRISM_HALF_WIDTH);

        let probe = Vec3::new(x, ref_y, z);
        let mut best: Option<(PolyRef, Vec3)> = None;
        for reference in self.nav_mesh.query_polygons(bmin, bmax, filter) {
            let Some(h) = self.nav_mesh.poly_height(reference, probe)? else {
                continue;
            };
            if h > ref_y || h < ref_y - max_depth {
                continue;
            }
            if best.map_or(true, |(_, p)| h > p.y) {
                best = Some((reference, Vec3::new(x, h, z)));
            }
        }
        Ok(best)
    }
}

fn corner_flags(reference: PolyRef, poly_type: PolyType) -> StraightPathFlags {
    if !reference.is_valid() {
        StraightPathFlags::END
    } else if poly_type == PolyType::OffMeshConnection {
        StraightPathFlags::OFFMESH_CONNECTION
    } else {
        StraightPathFlags::empty()
    }
}
