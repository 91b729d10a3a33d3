//! Compact heightfield representation for Recast
//!
//! The compact heightfield stores the open space above walkable spans rather than the
//! solid spans themselves. Every column is a contiguous run in a single span array and
//! each span knows which span it connects to in its four neighbouring columns.

use glam::Vec3;

use navkit_common::{Error, Result};

use crate::context::{BuildContext, TimerCategory};
use crate::heightfield::Heightfield;
use crate::{dir_offset_x, dir_offset_z, RC_NOT_CONNECTED, RC_NULL_AREA};

const MAX_HEIGHT: i32 = 0xffff;
/// Largest number of layers a column can connect to
const MAX_LAYERS: usize = RC_NOT_CONNECTED as usize - 1;

/// A column of the compact heightfield
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactCell {
    /// Index of the first span of the column
    pub index: u32,
    /// Number of spans in the column
    pub count: u32,
}

impl CompactCell {
    /// Span indices of the column
    #[inline]
    pub fn spans(&self) -> std::ops::Range<usize> {
        self.index as usize..(self.index + self.count) as usize
    }
}

/// Open space above a walkable span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactSpan {
    /// Floor height, in cell heights
    pub y: u16,
    /// Region id (0 = none)
    pub reg: u16,
    /// Packed neighbour layers, 6 bits per direction
    pub con: u32,
    /// Free space above the floor, in cell heights
    pub h: u8,
}

impl CompactSpan {
    fn new(y: u16, h: u8) -> Self {
        let mut span = Self { y, reg: 0, con: 0, h };
        for dir in 0..4 {
            span.set_con(dir, RC_NOT_CONNECTED);
        }
        span
    }

    /// Layer index of the connected span in the neighbouring column, or
    /// `RC_NOT_CONNECTED`
    #[inline]
    pub fn get_con(&self, dir: usize) -> u8 {
        ((self.con >> (dir * 6)) & 0x3f) as u8
    }

    #[inline]
    pub fn set_con(&mut self, dir: usize, layer: u8) {
        let shift = dir * 6;
        self.con = (self.con & !(0x3f << shift)) | (((layer as u32) & 0x3f) << shift);
    }
}

/// Compact heightfield structure
#[derive(Debug, Clone)]
pub struct CompactHeightfield {
    /// Width of the heightfield along the x-axis
    pub width: i32,
    /// Height (depth) of the heightfield along the z-axis
    pub height: i32,
    /// Border padding excluded from the final mesh
    pub border_size: i32,
    /// Agent height the connections were built for
    pub walkable_height: i32,
    /// Agent climb the connections were built for
    pub walkable_climb: i32,
    /// Largest value in the distance field
    pub max_distance: u16,
    /// Largest region id in use, region ids run from 1 to this value
    pub max_regions: u16,

    /// The minimum bounds of the heightfield's AABB
    pub bmin: Vec3,
    /// The maximum bounds of the heightfield's AABB
    pub bmax: Vec3,
    /// Cell size (horizontal resolution)
    pub cs: f32,
    /// Cell height (vertical resolution)
    pub ch: f32,

    /// Columns, indexed `x + z * width`
    pub cells: Vec<CompactCell>,
    /// Spans of all columns
    pub spans: Vec<CompactSpan>,
    /// Distance to the border per span, filled by the distance field pass
    pub dist: Vec<u16>,
    /// Area id per span
    pub areas: Vec<u8>,
}

impl CompactHeightfield {
    /// Builds the compact heightfield from the walkable spans of `hf` and connects
    /// neighbours an agent of the given height and climb can move between.
    pub fn build(
        ctx: &mut BuildContext,
        walkable_height: i32,
        walkable_climb: i32,
        hf: &Heightfield,
    ) -> Result<Self> {
        ctx.start_timer(TimerCategory::CompactHeightfield);

        let w = hf.width;
        let h = hf.height;
        let span_count = hf.walkable_span_count();

        let mut bmax = hf.bmax;
        bmax.y += walkable_height as f32 * hf.ch;

        let mut chf = CompactHeightfield {
            width: w,
            height: h,
            border_size: 0,
            walkable_height,
            walkable_climb,
            max_distance: 0,
            max_regions: 0,
            bmin: hf.bmin,
            bmax,
            cs: hf.cs,
            ch: hf.ch,
            cells: vec![CompactCell::default(); (w.max(0) * h.max(0)) as usize],
            spans: Vec::with_capacity(span_count),
            dist: Vec::new(),
            areas: Vec::with_capacity(span_count),
        };

        for z in 0..h {
            for x in 0..w {
                let column = hf.column(x, z);
                let cell = &mut chf.cells[(x + z * w) as usize];
                cell.index = chf.spans.len() as u32;
                for (i, span) in column.iter().enumerate() {
                    if span.area == RC_NULL_AREA {
                        continue;
                    }
                    let bot = span.smax as i32;
                    let top = column.get(i + 1).map_or(MAX_HEIGHT, |n| n.smin as i32);
                    chf.spans.push(CompactSpan::new(
                        bot.clamp(0, 0xffff) as u16,
                        (top - bot).clamp(0, 0xff) as u8,
                    ));
                    chf.areas.push(span.area);
                }
                cell.count = chf.spans.len() as u32 - cell.index;
            }
        }

        let mut too_high_neighbour = 0usize;
        for z in 0..h {
            for x in 0..w {
                let cell = chf.cells[(x + z * w) as usize];
                for i in cell.spans() {
                    for dir in 0..4 {
                        chf.spans[i].set_con(dir, RC_NOT_CONNECTED);
                        let nx = x + dir_offset_x(dir);
                        let nz = z + dir_offset_z(dir);
                        if nx < 0 || nz < 0 || nx >= w || nz >= h {
                            continue;
                        }

                        let span = chf.spans[i];
                        let ncell = chf.cells[(nx + nz * w) as usize];
                        for (layer, k) in ncell.spans().enumerate() {
                            let ns = chf.spans[k];
                            let bot = span.y.max(ns.y) as i32;
                            let top = (span.y as i32 + span.h as i32).min(ns.y as i32 + ns.h as i32);

                            // The gap between the spans must fit the agent and the step must be climbable
                            if top - bot >= walkable_height
                                && (ns.y as i32 - span.y as i32).abs() <= walkable_climb
                            {
                                if layer >= MAX_LAYERS {
                                    too_high_neighbour = too_high_neighbour.max(layer);
                                    continue;
                                }
                                chf.spans[i].set_con(dir, layer as u8);
                                break;
                            }
                        }
                    }
                }
            }
        }

        if too_high_neighbour >= MAX_LAYERS {
            ctx.log_warning(format!(
                "Heightfield has too many layers {} (max: {})",
                too_high_neighbour, MAX_LAYERS
            ));
        }

        ctx.stop_timer(TimerCategory::CompactHeightfield);
        Ok(chf)
    }

    /// Number of spans
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Column at `(x, z)`
    #[inline]
    pub fn cell(&self, x: i32, z: i32) -> CompactCell {
        self.cells[(x + z * self.width) as usize]
    }

    /// Index of the span connected to span `i` of column `(x, z)` in direction `dir`
    #[inline]
    pub fn neighbour(&self, x: i32, z: i32, i: usize, dir: usize) -> Option<(i32, i32, usize)> {
        let con = self.spans[i].get_con(dir);
        if con == RC_NOT_CONNECTED {
            return None;
        }
        let nx = x + dir_offset_x(dir);
        let nz = z + dir_offset_z(dir);
        Some((nx, nz, self.cell(nx, nz).index as usize + con as usize))
    }

    /// Finds the span in column `(x, z)` whose floor is nearest below `y`
    /// (in cell heights), falling back to the lowest span above it
    pub fn span_at(&self, x: i32, z: i32, y: i32) -> Option<usize> {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return None;
        }
        let mut best: Option<(i32, usize)> = None;
        for i in self.cell(x, z).spans() {
            let d = (y - self.spans[i].y as i32).abs();
            if best.map_or(true, |(bd, _)| d < bd) {
                best = Some((d, i));
            }
        }
        best.map(|(_, i)| i)
    }

    /// Ensures the distance field was built
    pub(crate) fn require_distance_field(&self) -> Result<()> {
        if self.dist.len() != self.spans.len() {
            return Err(Error::NavMeshGeneration(
                "Distance field has not been built".to_string(),
            ));
        }
        Ok(())
    }
}
