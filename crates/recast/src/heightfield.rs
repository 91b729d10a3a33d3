//! Heightfield representation for Recast
//!
//! The heightfield is the first data structure in the Recast pipeline.
//! It's a 2D grid of columns, each holding the solid spans rasterized into that cell,
//! sorted bottom to top and never overlapping.

use glam::Vec3;

use navkit_common::{Error, Result};

use crate::{dir_offset_x, dir_offset_z, RC_NULL_AREA, RC_SPAN_MAX_HEIGHT};

/// A span in the heightfield, representing a vertical segment of solid space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// The lower limit of the span, in cell heights
    pub smin: u16,
    /// The upper limit of the span, in cell heights
    pub smax: u16,
    /// Area ID (0 = not walkable)
    pub area: u8,
}

impl Span {
    /// Creates a new span
    pub fn new(smin: u16, smax: u16, area: u8) -> Self {
        Self { smin, smax, area }
    }
}

/// Heightfield structure holding a grid of span columns
#[derive(Debug, Clone)]
pub struct Heightfield {
    /// Width of the heightfield along the x-axis
    pub width: i32,
    /// Height (depth) of the heightfield along the z-axis
    pub height: i32,

    /// The minimum bounds of the heightfield's AABB
    pub bmin: Vec3,
    /// The maximum bounds of the heightfield's AABB
    pub bmax: Vec3,

    /// Cell size (horizontal resolution)
    pub cs: f32,
    /// Cell height (vertical resolution)
    pub ch: f32,

    /// Span columns, indexed `x + z * width`
    columns: Vec<Vec<Span>>,
}

impl Heightfield {
    /// Creates a new empty heightfield
    pub fn new(width: i32, height: i32, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) -> Self {
        let cells = (width.max(0) * height.max(0)) as usize;
        Self {
            width,
            height,
            bmin,
            bmax,
            cs,
            ch,
            columns: vec![Vec::new(); cells],
        }
    }

    /// Spans of the column at `(x, z)`, bottom to top
    pub fn column(&self, x: i32, z: i32) -> &[Span] {
        &self.columns[(x + z * self.width) as usize]
    }

    fn column_mut(&mut self, x: i32, z: i32) -> &mut Vec<Span> {
        &mut self.columns[(x + z * self.width) as usize]
    }

    /// Total number of spans
    pub fn span_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    /// Number of spans carrying a walkable area
    pub fn walkable_span_count(&self) -> usize {
        self.columns
            .iter()
            .flatten()
            .filter(|s| s.area != RC_NULL_AREA)
            .count()
    }

    /// Adds a span, merging it with every span it overlaps.
    ///
    /// When the merged top lies within `flag_merge_threshold` of an existing span top,
    /// the larger area id wins, so a walkable floor is not hidden by a thin obstacle
    /// rasterized into the same cell.
    pub fn add_span(
        &mut self,
        x: i32,
        z: i32,
        smin: u16,
        smax: u16,
        area: u8,
        flag_merge_threshold: i32,
    ) -> Result<()> {
        if x < 0 || x >= self.width || z < 0 || z >= self.height {
            return Err(Error::NavMeshGeneration(format!(
                "Span position out of bounds: ({}, {})",
                x, z
            )));
        }

        if smin > smax {
            return Err(Error::NavMeshGeneration(format!(
                "Invalid span height: min ({}) > max ({})",
                smin, smax
            )));
        }

        let mut new_span = Span::new(smin, smax, area);
        let column = self.column_mut(x, z);

        let mut insert_at = column.len();
        let mut i = 0;
        while i < column.len() {
            let cur = column[i];
            if cur.smin > new_span.smax {
                // Current span is above the new span
                insert_at = i;
                break;
            }
            if cur.smax < new_span.smin {
                // Current span is below the new span
                i += 1;
                continue;
            }

            // Overlap, merge
            new_span.smin = new_span.smin.min(cur.smin);
            new_span.smax = new_span.smax.max(cur.smax);
            if (new_span.smax as i32 - cur.smax as i32).abs() <= flag_merge_threshold {
                new_span.area = new_span.area.max(cur.area);
            }
            column.remove(i);
        }
        column.insert(insert_at.min(column.len()), new_span);

        Ok(())
    }

    /// Marks non-walkable spans as walkable when their top is within `walkable_climb`
    /// of a walkable span directly below, allowing agents to step onto curbs and stairs.
    pub fn filter_low_hanging_walkable_obstacles(&mut self, walkable_climb: i32) {
        for column in &mut self.columns {
            let mut previous: Option<(bool, u8, u16)> = None;
            for span in column.iter_mut() {
                let walkable = span.area != RC_NULL_AREA;
                if let Some((prev_walkable, prev_area, prev_smax)) = previous {
                    if !walkable
                        && prev_walkable
                        && (span.smax as i32 - prev_smax as i32).abs() <= walkable_climb
                    {
                        span.area = prev_area;
                    }
                }
                previous = Some((walkable, span.area, span.smax));
            }
        }
    }

    /// Marks spans that are ledges as unwalkable.
    ///
    /// A ledge is a span with a neighbour whose floor is more than `walkable_climb`
    /// below it, or whose accessible neighbours differ in height by more than
    /// `walkable_climb` (steep slopes that voxelization made look walkable).
    pub fn filter_ledge_spans(&mut self, walkable_height: i32, walkable_climb: i32) {
        let max_height = RC_SPAN_MAX_HEIGHT as i32;
        let w = self.width;
        let h = self.height;
        let mut unwalkable = Vec::new();

        for z in 0..h {
            for x in 0..w {
                let column = self.column(x, z);
                for (si, span) in column.iter().enumerate() {
                    if span.area == RC_NULL_AREA {
                        continue;
                    }

                    let bot = span.smax as i32;
                    let top = column.get(si + 1).map_or(max_height, |n| n.smin as i32);

                    let mut min_neighbor_height = max_height;
                    let mut accessible_min = span.smax as i32;
                    let mut accessible_max = span.smax as i32;

                    for dir in 0..4 {
                        let dx = x + dir_offset_x(dir);
                        let dz = z + dir_offset_z(dir);
                        if dx < 0 || dz < 0 || dx >= w || dz >= h {
                            min_neighbor_height = min_neighbor_height.min(-walkable_climb - bot);
                            continue;
                        }

                        let neighbor = self.column(dx, dz);

                        // From minus infinity to the first span
                        let nbot = -walkable_climb;
                        let ntop = neighbor.first().map_or(max_height, |n| n.smin as i32);
                        if top.min(ntop) - bot.max(nbot) > walkable_height {
                            min_neighbor_height = min_neighbor_height.min(nbot - bot);
                        }

                        for (ni, ns) in neighbor.iter().enumerate() {
                            let nbot = ns.smax as i32;
                            let ntop = neighbor.get(ni + 1).map_or(max_height, |n| n.smin as i32);
                            if top.min(ntop) - bot.max(nbot) > walkable_height {
                                min_neighbor_height = min_neighbor_height.min(nbot - bot);
                                if (nbot - bot).abs() <= walkable_climb {
                                    accessible_min = accessible_min.min(nbot);
                                    accessible_max = accessible_max.max(nbot);
                                }
                            }
                        }
                    }

                    if min_neighbor_height < -walkable_climb
                        || accessible_max - accessible_min > walkable_climb
                    {
                        unwalkable.push((x, z, si));
                    }
                }
            }
        }

        for (x, z, si) in unwalkable {
            self.column_mut(x, z)[si].area = RC_NULL_AREA;
        }
    }

    /// Marks walkable spans with less than `walkable_height` free space above as unwalkable
    pub fn filter_walkable_low_height_spans(&mut self, walkable_height: i32) {
        let max_height = RC_SPAN_MAX_HEIGHT as i32;
        for column in &mut self.columns {
            for si in 0..column.len() {
                let bot = column[si].smax as i32;
                let top = column.get(si + 1).map_or(max_height, |n| n.smin as i32);
                if top - bot < walkable_height {
                    column[si].area = RC_NULL_AREA;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RC_WALKABLE_AREA;

    fn field(w: i32, h: i32) -> Heightfield {
        Heightfield::new(
            w,
            h,
            Vec3::ZERO,
            Vec3::new(w as f32, 10.0, h as f32),
            1.0,
            0.1,
        )
    }

    #[test]
    fn test_add_span_sorted_and_merged() {
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 10, 12, 1, 1).unwrap();
        hf.add_span(0, 0, 0, 2, 1, 1).unwrap();
        hf.add_span(0, 0, 5, 6, 1, 1).unwrap();
        assert_eq!(hf.column(0, 0).len(), 3);
        assert!(hf.column(0, 0).windows(2).all(|w| w[0].smax < w[1].smin));

        // Bridges all three
        hf.add_span(0, 0, 1, 11, 1, 1).unwrap();
        assert_eq!(hf.column(0, 0), &[Span::new(0, 12, 1)]);
    }

    #[test]
    fn test_add_span_area_merge_threshold() {
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 0, 10, RC_WALKABLE_AREA, 1).unwrap();
        // Obstacle top close to the floor top keeps the walkable area
        hf.add_span(0, 0, 5, 11, RC_NULL_AREA, 1).unwrap();
        assert_eq!(hf.column(0, 0)[0].area, RC_WALKABLE_AREA);

        // Obstacle well above the floor replaces it
        hf.add_span(0, 0, 5, 20, RC_NULL_AREA, 1).unwrap();
        assert_eq!(hf.column(0, 0)[0], Span::new(0, 20, RC_NULL_AREA));
    }

    #[test]
    fn test_add_span_out_of_bounds() {
        let mut hf = field(2, 2);
        assert!(hf.add_span(2, 0, 0, 1, 1, 1).is_err());
        assert!(hf.add_span(0, 0, 3, 1, 1, 1).is_err());
    }

    #[test]
    fn test_low_hanging_obstacle_becomes_walkable() {
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 0, 2, RC_WALKABLE_AREA, 0).unwrap();
        hf.add_span(0, 0, 3, 4, RC_NULL_AREA, 0).unwrap();
        hf.add_span(0, 0, 20, 30, RC_NULL_AREA, 0).unwrap();
        hf.filter_low_hanging_walkable_obstacles(2);
        let col = hf.column(0, 0);
        assert_eq!(col[1].area, RC_WALKABLE_AREA);
        assert_eq!(col[2].area, RC_NULL_AREA);
    }

    #[test]
    fn test_low_height_spans_removed() {
        let mut hf = field(1, 1);
        hf.add_span(0, 0, 0, 2, RC_WALKABLE_AREA, 0).unwrap();
        hf.add_span(0, 0, 5, 6, RC_WALKABLE_AREA, 0).unwrap();
        hf.filter_walkable_low_height_spans(10);
        let col = hf.column(0, 0);
        assert_eq!(col[0].area, RC_NULL_AREA);
        assert_eq!(col[1].area, RC_WALKABLE_AREA);
    }

    #[test]
    fn test_ledge_spans_removed() {
        let mut hf = field(5, 5);
        for z in 0..5 {
            for x in 0..5 {
                // Raised platform in the middle column x = 2
                let top = if x == 2 { 20 } else { 2 };
                hf.add_span(x, z, 0, top, RC_WALKABLE_AREA, 0).unwrap();
            }
        }
        hf.filter_ledge_spans(10, 3);
        assert_eq!(hf.column(2, 2)[0].area, RC_NULL_AREA);
        // Interior floor next to the wall keeps its area: the drop is downward from the wall only
        assert_eq!(hf.column(1, 2)[0].area, RC_WALKABLE_AREA);
        // Grid border cells are always ledges
        assert_eq!(hf.column(0, 2)[0].area, RC_NULL_AREA);
    }
}
