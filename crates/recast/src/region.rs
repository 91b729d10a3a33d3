//! Region partitioning
//!
//! Three partitioners assign region ids to the spans of a compact heightfield:
//! watershed flooding of the distance field, monotone row sweeps, and row sweeps merged
//! into non-overlapping layers. All three share the border painting and end with a pass
//! that removes tiny islands and renumbers ids compactly.

use std::collections::HashSet;

use navkit_common::{Error, Result};

use crate::compact_heightfield::CompactHeightfield;
use crate::context::{BuildContext, TimerCategory};
use crate::{RC_BORDER_REG, RC_NULL_AREA};

const NB_STACKS: usize = 8;
const EXPAND_ITERS: i32 = 8;
const NULL_NEIGHBOUR: u16 = 0xffff;

#[derive(Debug, Clone, Copy)]
struct LevelStackEntry {
    x: i32,
    z: i32,
    /// Span index, or -1 once the span got a region
    index: i32,
}

#[derive(Debug, Clone)]
struct Region {
    span_count: i32,
    id: u16,
    area_type: u8,
    remap: bool,
    visited: bool,
    overlap: bool,
    connects_to_border: bool,
    ymin: u16,
    ymax: u16,
    connections: Vec<u16>,
    floors: Vec<u16>,
}

impl Region {
    fn new(id: u16) -> Self {
        Self {
            span_count: 0,
            id,
            area_type: 0,
            remap: false,
            visited: false,
            overlap: false,
            connects_to_border: false,
            ymin: 0xffff,
            ymax: 0,
            connections: Vec::new(),
            floors: Vec::new(),
        }
    }

    fn remove_adjacent_neighbours(&mut self) {
        let mut i = 0;
        while i < self.connections.len() && self.connections.len() > 1 {
            let ni = (i + 1) % self.connections.len();
            if self.connections[i] == self.connections[ni] {
                self.connections.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn replace_neighbour(&mut self, old_id: u16, new_id: u16) {
        let mut changed = false;
        for c in &mut self.connections {
            if *c == old_id {
                *c = new_id;
                changed = true;
            }
        }
        for f in &mut self.floors {
            if *f == old_id {
                *f = new_id;
            }
        }
        if changed {
            self.remove_adjacent_neighbours();
        }
    }

    fn add_unique_floor(&mut self, id: u16) {
        if !self.floors.contains(&id) {
            self.floors.push(id);
        }
    }

    fn add_unique_connection(&mut self, id: u16) {
        if !self.connections.contains(&id) {
            self.connections.push(id);
        }
    }

    fn is_connected_to_border(&self) -> bool {
        // Connection to the null region means the region touches the outside
        self.connections.contains(&0)
    }

    fn can_merge_with(&self, other: &Region) -> bool {
        if self.area_type != other.area_type {
            return false;
        }
        let n = self.connections.iter().filter(|&&c| c == other.id).count();
        if n > 1 {
            return false;
        }
        !self.floors.contains(&other.id)
    }
}

fn paint_rect_region(
    chf: &CompactHeightfield,
    (min_x, max_x): (i32, i32),
    (min_z, max_z): (i32, i32),
    reg_id: u16,
    src_reg: &mut [u16],
) {
    for z in min_z..max_z {
        for x in min_x..max_x {
            for i in chf.cell(x, z).spans() {
                if chf.areas[i] != RC_NULL_AREA {
                    src_reg[i] = reg_id;
                }
            }
        }
    }
}

/// Paints the tile border with four border regions and returns the next free id
fn paint_border(chf: &mut CompactHeightfield, border_size: i32, src_reg: &mut [u16]) -> u16 {
    let w = chf.width;
    let h = chf.height;
    let mut id = 1u16;
    if border_size > 0 {
        let bw = w.min(border_size);
        let bh = h.min(border_size);
        paint_rect_region(chf, (0, bw), (0, h), id | RC_BORDER_REG, src_reg);
        id += 1;
        paint_rect_region(chf, (w - bw, w), (0, h), id | RC_BORDER_REG, src_reg);
        id += 1;
        paint_rect_region(chf, (0, w), (0, bh), id | RC_BORDER_REG, src_reg);
        id += 1;
        paint_rect_region(chf, (0, w), (h - bh, h), id | RC_BORDER_REG, src_reg);
        id += 1;
    }
    chf.border_size = border_size;
    id
}

fn sort_cells_by_level(
    start_level: u16,
    chf: &CompactHeightfield,
    src_reg: &[u16],
    stacks: &mut [Vec<LevelStackEntry>],
) {
    let start_level = (start_level >> 1) as i32;
    for stack in stacks.iter_mut() {
        stack.clear();
    }

    for z in 0..chf.height {
        for x in 0..chf.width {
            for i in chf.cell(x, z).spans() {
                if chf.areas[i] == RC_NULL_AREA || src_reg[i] != 0 {
                    continue;
                }
                let level = (chf.dist[i] >> 1) as i32;
                let s_id = (start_level - level).max(0) as usize;
                if s_id >= stacks.len() {
                    continue;
                }
                stacks[s_id].push(LevelStackEntry {
                    x,
                    z,
                    index: i as i32,
                });
            }
        }
    }
}

fn append_stacks(src: &[LevelStackEntry], dst: &mut Vec<LevelStackEntry>, src_reg: &[u16]) {
    dst.extend(
        src.iter()
            .filter(|e| e.index >= 0 && src_reg[e.index as usize] == 0)
            .copied(),
    );
}

fn expand_regions(
    max_iter: i32,
    level: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
    src_dist: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
    fill_stack: bool,
) {
    if fill_stack {
        stack.clear();
        for z in 0..chf.height {
            for x in 0..chf.width {
                for i in chf.cell(x, z).spans() {
                    if chf.dist[i] >= level && src_reg[i] == 0 && chf.areas[i] != RC_NULL_AREA {
                        stack.push(LevelStackEntry {
                            x,
                            z,
                            index: i as i32,
                        });
                    }
                }
            }
        }
    } else {
        // Mark spans that already got a region
        for entry in stack.iter_mut() {
            if entry.index >= 0 && src_reg[entry.index as usize] != 0 {
                entry.index = -1;
            }
        }
    }

    let mut dirty: Vec<(usize, u16, u16)> = Vec::new();
    let mut iter = 0;
    while !stack.is_empty() {
        let mut failed = 0;
        dirty.clear();

        for entry in stack.iter_mut() {
            if entry.index < 0 {
                failed += 1;
                continue;
            }
            let i = entry.index as usize;
            let mut r = src_reg[i];
            let mut d2 = 0xffffu16;
            let area = chf.areas[i];
            for dir in 0..4 {
                let Some((_, _, ai)) = chf.neighbour(entry.x, entry.z, i, dir) else {
                    continue;
                };
                if chf.areas[ai] != area {
                    continue;
                }
                if src_reg[ai] > 0 && (src_reg[ai] & RC_BORDER_REG) == 0 {
                    let d = src_dist[ai].saturating_add(2);
                    if d < d2 {
                        r = src_reg[ai];
                        d2 = d;
                    }
                }
            }
            if r != 0 {
                // Do not take the span again
                entry.index = -1;
                dirty.push((i, r, d2));
            } else {
                failed += 1;
            }
        }

        // Copy entries that differ between src and dst to keep them in sync
        for &(i, r, d) in &dirty {
            src_reg[i] = r;
            src_dist[i] = d;
        }

        if failed == stack.len() {
            break;
        }
        if level > 0 {
            iter += 1;
            if iter >= max_iter {
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn flood_region(
    x: i32,
    z: i32,
    i: usize,
    level: u16,
    r: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
    src_dist: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
) -> bool {
    let area = chf.areas[i];

    stack.clear();
    stack.push(LevelStackEntry {
        x,
        z,
        index: i as i32,
    });
    src_reg[i] = r;
    src_dist[i] = 0;

    let lev = level.saturating_sub(2);
    let mut count = 0;

    while let Some(back) = stack.pop() {
        let (cx, cz, ci) = (back.x, back.z, back.index as usize);

        // Stop when touching another region of the same area
        let mut ar = 0u16;
        'dirs: for dir in 0..4 {
            let Some((ax, az, ai)) = chf.neighbour(cx, cz, ci, dir) else {
                continue;
            };
            if chf.areas[ai] != area {
                continue;
            }
            let nr = src_reg[ai];
            if nr & RC_BORDER_REG != 0 {
                continue;
            }
            if nr != 0 && nr != r {
                ar = nr;
                break;
            }

            let dir2 = (dir + 1) & 3;
            if let Some((_, _, ai2)) = chf.neighbour(ax, az, ai, dir2) {
                if chf.areas[ai2] != area {
                    continue;
                }
                let nr2 = src_reg[ai2];
                if nr2 != 0 && nr2 != r {
                    ar = nr2;
                    break 'dirs;
                }
            }
        }
        if ar != 0 {
            src_reg[ci] = 0;
            continue;
        }

        count += 1;

        for dir in 0..4 {
            let Some((ax, az, ai)) = chf.neighbour(cx, cz, ci, dir) else {
                continue;
            };
            if chf.areas[ai] != area {
                continue;
            }
            if chf.dist[ai] >= lev && src_reg[ai] == 0 {
                src_reg[ai] = r;
                src_dist[ai] = 0;
                stack.push(LevelStackEntry {
                    x: ax,
                    z: az,
                    index: ai as i32,
                });
            }
        }
    }

    count > 0
}

fn is_solid_edge(chf: &CompactHeightfield, src_reg: &[u16], x: i32, z: i32, i: usize, dir: usize) -> bool {
    let r = chf
        .neighbour(x, z, i, dir)
        .map_or(0, |(_, _, ai)| src_reg[ai]);
    r != src_reg[i]
}

/// Walks the outline of a region and records the sequence of neighbouring regions
fn walk_contour(
    mut x: i32,
    mut z: i32,
    mut i: usize,
    mut dir: usize,
    chf: &CompactHeightfield,
    src_reg: &[u16],
    cont: &mut Vec<u16>,
) {
    let start_dir = dir;
    let start_i = i;

    let mut cur_reg = chf.neighbour(x, z, i, dir).map_or(0, |(_, _, ai)| src_reg[ai]);
    cont.push(cur_reg);

    let mut iter = 0;
    loop {
        iter += 1;
        if iter >= 40000 {
            break;
        }

        if is_solid_edge(chf, src_reg, x, z, i, dir) {
            let r = chf.neighbour(x, z, i, dir).map_or(0, |(_, _, ai)| src_reg[ai]);
            if r != cur_reg {
                cur_reg = r;
                cont.push(cur_reg);
            }
            // Rotate clockwise
            dir = (dir + 1) & 3;
        } else {
            let Some((nx, nz, ni)) = chf.neighbour(x, z, i, dir) else {
                // A connected edge without a neighbour cannot happen
                return;
            };
            x = nx;
            z = nz;
            i = ni;
            // Rotate counter-clockwise
            dir = (dir + 3) & 3;
        }

        if start_i == i && start_dir == dir {
            break;
        }
    }

    // Remove adjacent duplicates
    if cont.len() > 1 {
        let mut j = 0;
        while j < cont.len() {
            let nj = (j + 1) % cont.len();
            if cont[j] == cont[nj] {
                cont.remove(j);
            } else {
                j += 1;
            }
        }
    }
}

/// Merges region `b` into region `a`, splicing their neighbour rings
fn merge_regions(regions: &mut [Region], a: usize, b: usize) -> bool {
    let aid = regions[a].id;
    let bid = regions[b].id;

    let acon = regions[a].connections.clone();
    let bcon = regions[b].connections.clone();

    let Some(insa) = acon.iter().position(|&c| c == bid) else {
        return false;
    };
    let Some(insb) = bcon.iter().position(|&c| c == aid) else {
        return false;
    };

    let mut merged = Vec::with_capacity(acon.len() + bcon.len());
    for k in 0..acon.len() - 1 {
        merged.push(acon[(insa + 1 + k) % acon.len()]);
    }
    for k in 0..bcon.len() - 1 {
        merged.push(bcon[(insb + 1 + k) % bcon.len()]);
    }

    let b_floors = std::mem::take(&mut regions[b].floors);
    let b_spans = regions[b].span_count;
    regions[b].span_count = 0;
    regions[b].connections.clear();

    let reg_a = &mut regions[a];
    reg_a.connections = merged;
    reg_a.remove_adjacent_neighbours();
    for f in b_floors {
        reg_a.add_unique_floor(f);
    }
    reg_a.span_count += b_spans;
    true
}

/// Renumbers the remaining non-border regions from 1 and returns the largest id,
/// which is also the number of regions holding spans.
///
/// Ids no span carries, such as the unused id the flood fill ends on, are not
/// counted.
fn compress_region_ids(regions: &mut [Region]) -> u16 {
    let live: HashSet<u16> = regions.iter().filter(|r| r.span_count > 0).map(|r| r.id).collect();
    for reg in regions.iter_mut() {
        reg.remap = reg.id != 0 && reg.id & RC_BORDER_REG == 0 && live.contains(&reg.id);
    }

    let mut reg_id_gen = 0u16;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        let old_id = regions[i].id;
        reg_id_gen += 1;
        for reg in regions[i..].iter_mut() {
            if reg.id == old_id {
                reg.id = reg_id_gen;
                reg.remap = false;
            }
        }
    }
    reg_id_gen
}

fn remap_regions(regions: &[Region], src_reg: &mut [u16]) {
    for r in src_reg.iter_mut() {
        if *r & RC_BORDER_REG == 0 {
            *r = regions[*r as usize].id;
        }
    }
}

fn merge_and_filter_regions(
    ctx: &BuildContext,
    min_region_area: i32,
    merge_region_size: i32,
    max_region_id: &mut u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
) -> Result<Vec<u16>> {
    let nreg = *max_region_id as usize + 1;
    let mut regions: Vec<Region> = (0..nreg).map(|i| Region::new(i as u16)).collect();

    // Find the outline of each region and its connections to other regions
    for z in 0..chf.height {
        for x in 0..chf.width {
            let cell = chf.cell(x, z);
            for i in cell.spans() {
                let r = src_reg[i] as usize;
                if r == 0 || r >= nreg {
                    continue;
                }

                regions[r].span_count += 1;

                // Regions stacked in the same column are floors of each other
                for j in cell.spans() {
                    if i == j {
                        continue;
                    }
                    let floor_id = src_reg[j];
                    if floor_id == 0 || floor_id as usize >= nreg {
                        continue;
                    }
                    if floor_id as usize == r {
                        regions[r].overlap = true;
                    }
                    regions[r].add_unique_floor(floor_id);
                }

                if !regions[r].connections.is_empty() {
                    continue;
                }
                regions[r].area_type = chf.areas[i];

                if let Some(dir) = (0..4).find(|&d| is_solid_edge(chf, src_reg, x, z, i, d)) {
                    let mut connections = Vec::new();
                    walk_contour(x, z, i, dir, chf, src_reg, &mut connections);
                    regions[r].connections = connections;
                }
            }
        }
    }

    // Remove regions smaller than the minimum that do not touch the border
    let mut stack: Vec<usize> = Vec::new();
    let mut trace: Vec<usize> = Vec::new();
    for i in 0..nreg {
        let reg = &regions[i];
        if reg.id == 0 || reg.id & RC_BORDER_REG != 0 || reg.span_count == 0 || reg.visited {
            continue;
        }

        let mut connects_to_border = false;
        let mut span_count = 0;
        stack.clear();
        trace.clear();

        regions[i].visited = true;
        stack.push(i);

        while let Some(ri) = stack.pop() {
            span_count += regions[ri].span_count;
            trace.push(ri);

            for k in 0..regions[ri].connections.len() {
                let c = regions[ri].connections[k];
                if c & RC_BORDER_REG != 0 {
                    connects_to_border = true;
                    continue;
                }
                let nei = &mut regions[c as usize];
                if nei.visited || nei.id == 0 || nei.id & RC_BORDER_REG != 0 {
                    continue;
                }
                nei.visited = true;
                stack.push(nei.id as usize);
            }
        }

        if span_count < min_region_area && !connects_to_border {
            for &t in &trace {
                regions[t].span_count = 0;
                regions[t].id = 0;
            }
        }
    }

    // Merge too small regions into their smallest neighbour
    loop {
        let mut merge_count = 0;
        for i in 0..nreg {
            let reg = &regions[i];
            if reg.id == 0 || reg.id & RC_BORDER_REG != 0 || reg.overlap || reg.span_count == 0 {
                continue;
            }
            if reg.span_count > merge_region_size && reg.is_connected_to_border() {
                continue;
            }

            let mut smallest = i32::MAX;
            let mut merge_id = reg.id;
            for &c in &reg.connections {
                if c & RC_BORDER_REG != 0 {
                    continue;
                }
                let mreg = &regions[c as usize];
                if mreg.id == 0 || mreg.id & RC_BORDER_REG != 0 || mreg.overlap {
                    continue;
                }
                if mreg.span_count < smallest && reg.can_merge_with(mreg) && mreg.can_merge_with(reg) {
                    smallest = mreg.span_count;
                    merge_id = mreg.id;
                }
            }

            if merge_id != reg.id {
                let old_id = reg.id;
                if merge_regions(&mut regions, merge_id as usize, i) {
                    for other in regions.iter_mut() {
                        if other.id == 0 || other.id & RC_BORDER_REG != 0 {
                            continue;
                        }
                        if other.id == old_id {
                            other.id = merge_id;
                        }
                        other.replace_neighbour(old_id, merge_id);
                    }
                    merge_count += 1;
                }
            }
        }
        if merge_count == 0 {
            break;
        }
    }

    *max_region_id = compress_region_ids(&mut regions);
    remap_regions(&regions, src_reg);

    let overlaps: Vec<u16> = regions.iter().filter(|r| r.overlap).map(|r| r.id).collect();
    if !overlaps.is_empty() {
        ctx.log_warning(format!("{} overlapping regions", overlaps.len()));
    }
    Ok(overlaps)
}

fn merge_and_filter_layer_regions(
    min_region_area: i32,
    max_region_id: &mut u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
) {
    let nreg = *max_region_id as usize + 1;
    let mut regions: Vec<Region> = (0..nreg).map(|i| Region::new(i as u16)).collect();

    // Find region neighbours and overlapping regions
    let mut column_regs: Vec<u16> = Vec::with_capacity(32);
    for z in 0..chf.height {
        for x in 0..chf.width {
            column_regs.clear();
            for i in chf.cell(x, z).spans() {
                let ri = src_reg[i];
                if ri == 0 || ri as usize >= nreg {
                    continue;
                }
                let y = chf.spans[i].y;
                let reg = &mut regions[ri as usize];
                reg.span_count += 1;
                reg.area_type = chf.areas[i];
                reg.ymin = reg.ymin.min(y);
                reg.ymax = reg.ymax.max(y);
                column_regs.push(ri);

                for dir in 0..4 {
                    let Some((_, _, ai)) = chf.neighbour(x, z, i, dir) else {
                        continue;
                    };
                    let rai = src_reg[ai];
                    if rai > 0 && (rai as usize) < nreg && rai != ri {
                        reg.add_unique_connection(rai);
                    }
                    if rai & RC_BORDER_REG != 0 {
                        reg.connects_to_border = true;
                    }
                }
            }

            for a in 0..column_regs.len() {
                for b in a + 1..column_regs.len() {
                    let (ra, rb) = (column_regs[a], column_regs[b]);
                    if ra != rb {
                        regions[ra as usize].add_unique_floor(rb);
                        regions[rb as usize].add_unique_floor(ra);
                    }
                }
            }
        }
    }

    // Flood monotone regions into layers that never overlap themselves
    for reg in regions.iter_mut() {
        reg.id = 0;
    }
    let mut layer_id = 1u16;
    let mut queue: std::collections::VecDeque<usize> = std::collections::VecDeque::new();
    for i in 1..nreg {
        if regions[i].id != 0 {
            continue;
        }
        regions[i].id = layer_id;
        queue.clear();
        queue.push_back(i);

        while let Some(ri) = queue.pop_front() {
            for k in 0..regions[ri].connections.len() {
                let nei = regions[ri].connections[k] as usize;
                if regions[nei].id != 0 || regions[ri].area_type != regions[nei].area_type {
                    continue;
                }
                // Skip neighbours overlapping the root
                if regions[i].floors.contains(&(nei as u16)) {
                    continue;
                }

                queue.push_back(nei);
                regions[nei].id = layer_id;

                let floors = regions[nei].floors.clone();
                let (ymin, ymax, span_count, border) = {
                    let n = &mut regions[nei];
                    let spans = n.span_count;
                    n.span_count = 0;
                    (n.ymin, n.ymax, spans, n.connects_to_border)
                };
                let root = &mut regions[i];
                for f in floors {
                    root.add_unique_floor(f);
                }
                root.ymin = root.ymin.min(ymin);
                root.ymax = root.ymax.max(ymax);
                root.span_count += span_count;
                root.connects_to_border |= border;
            }
        }

        layer_id = layer_id.wrapping_add(1);
    }

    // Remove small regions
    for i in 0..nreg {
        let reg = &regions[i];
        if reg.span_count > 0 && reg.span_count < min_region_area && !reg.connects_to_border {
            let id = reg.id;
            for other in regions.iter_mut() {
                if other.id == id {
                    other.id = 0;
                }
            }
        }
    }

    *max_region_id = compress_region_ids(&mut regions);
    remap_regions(&regions, src_reg);
}

/// Builds regions by flooding the distance field from its peaks.
///
/// Requires [`crate::build_distance_field`] to have run. Regions smaller than
/// `min_region_area` spans are removed unless they touch the tile border; regions
/// smaller than `merge_region_area` are merged into neighbours.
pub fn build_regions_watershed(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
    border_size: i32,
    min_region_area: i32,
    merge_region_area: i32,
) -> Result<()> {
    chf.require_distance_field()?;
    ctx.start_timer(TimerCategory::Regions);

    let span_count = chf.spans.len();
    let mut src_reg = vec![0u16; span_count];
    let mut src_dist = vec![0u16; span_count];

    let mut region_id = paint_border(chf, border_size, &mut src_reg);

    let mut lvl_stacks: Vec<Vec<LevelStackEntry>> = (0..NB_STACKS).map(|_| Vec::with_capacity(256)).collect();
    let mut stack: Vec<LevelStackEntry> = Vec::with_capacity(256);

    let mut level = (chf.max_distance.saturating_add(1)) & !1u16;
    let mut s_id: usize = NB_STACKS - 1;

    while level > 0 {
        ctx.check_cancelled()?;
        level = level.saturating_sub(2);
        s_id = (s_id + 1) & (NB_STACKS - 1);

        if s_id == 0 {
            sort_cells_by_level(level, chf, &src_reg, &mut lvl_stacks);
        } else {
            let (lower, upper) = lvl_stacks.split_at_mut(s_id);
            append_stacks(&lower[s_id - 1], &mut upper[0], &src_reg);
        }

        expand_regions(
            EXPAND_ITERS,
            level,
            chf,
            &mut src_reg,
            &mut src_dist,
            &mut lvl_stacks[s_id],
            false,
        );

        for j in 0..lvl_stacks[s_id].len() {
            let entry = lvl_stacks[s_id][j];
            if entry.index < 0 || src_reg[entry.index as usize] != 0 {
                continue;
            }
            if flood_region(
                entry.x,
                entry.z,
                entry.index as usize,
                level,
                region_id,
                chf,
                &mut src_reg,
                &mut src_dist,
                &mut stack,
            ) {
                if region_id == 0xffff {
                    ctx.stop_timer(TimerCategory::Regions);
                    return Err(Error::NavMeshGeneration("Region id overflow".to_string()));
                }
                region_id += 1;
            }
        }
    }

    // Expand current regions until no empty connected cells are found
    expand_regions(
        EXPAND_ITERS * 8,
        0,
        chf,
        &mut src_reg,
        &mut src_dist,
        &mut stack,
        true,
    );

    let mut max_region_id = region_id;
    merge_and_filter_regions(
        ctx,
        min_region_area,
        merge_region_area,
        &mut max_region_id,
        chf,
        &mut src_reg,
    )?;
    chf.max_regions = max_region_id;

    for (span, reg) in chf.spans.iter_mut().zip(src_reg) {
        span.reg = reg;
    }

    ctx.stop_timer(TimerCategory::Regions);
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
struct SweepSpan {
    /// Row id
    rid: u16,
    /// Region id
    id: u16,
    /// Number of samples
    ns: u16,
    /// Neighbour id
    nei: u16,
}

/// Partitions the walkable spans into row-monotone pieces, returning the next free id
fn sweep_regions(chf: &mut CompactHeightfield, border_size: i32, src_reg: &mut [u16]) -> Result<u16> {
    let w = chf.width;
    let h = chf.height;
    let mut id = paint_border(chf, border_size, src_reg);

    let mut sweeps: Vec<SweepSpan> = vec![SweepSpan::default(); w.max(h) as usize + 1];
    let mut prev: Vec<u16> = Vec::new();

    for z in border_size..h - border_size {
        prev.clear();
        prev.resize(id as usize + 1, 0);
        let mut rid = 1u16;

        for x in border_size..w - border_size {
            for i in chf.cell(x, z).spans() {
                if chf.areas[i] == RC_NULL_AREA {
                    continue;
                }

                // -x
                let mut previd = 0u16;
                if let Some((_, _, ai)) = chf.neighbour(x, z, i, 0) {
                    if src_reg[ai] & RC_BORDER_REG == 0 && chf.areas[i] == chf.areas[ai] {
                        previd = src_reg[ai];
                    }
                }
                if previd == 0 {
                    previd = rid;
                    rid += 1;
                    if previd as usize >= sweeps.len() {
                        sweeps.resize(previd as usize + 1, SweepSpan::default());
                    }
                    sweeps[previd as usize] = SweepSpan {
                        rid: previd,
                        id: 0,
                        ns: 0,
                        nei: 0,
                    };
                }

                // -z
                if let Some((_, _, ai)) = chf.neighbour(x, z, i, 3) {
                    let nr = src_reg[ai];
                    if nr != 0 && nr & RC_BORDER_REG == 0 && chf.areas[i] == chf.areas[ai] {
                        let sweep = &mut sweeps[previd as usize];
                        if sweep.nei == 0 || sweep.nei == nr {
                            sweep.nei = nr;
                            sweep.ns += 1;
                            if nr as usize >= prev.len() {
                                prev.resize(nr as usize + 1, 0);
                            }
                            prev[nr as usize] += 1;
                        } else {
                            sweep.nei = NULL_NEIGHBOUR;
                        }
                    }
                }

                src_reg[i] = previd;
            }
        }

        // Create unique ids
        for s in 1..rid as usize {
            let nei = sweeps[s].nei;
            if nei != NULL_NEIGHBOUR && nei != 0 && prev.get(nei as usize) == Some(&sweeps[s].ns) {
                sweeps[s].id = nei;
            } else {
                if id == 0xffff {
                    return Err(Error::NavMeshGeneration("Region id overflow".to_string()));
                }
                sweeps[s].id = id;
                id += 1;
            }
        }

        // Remap row local ids to region ids
        for x in border_size..w - border_size {
            for i in chf.cell(x, z).spans() {
                if src_reg[i] > 0 && src_reg[i] < rid {
                    src_reg[i] = sweeps[src_reg[i] as usize].id;
                }
            }
        }
    }

    Ok(id)
}

/// Builds row-monotone regions. Fast, but produces long thin polygons.
pub fn build_regions_monotone(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
    border_size: i32,
    min_region_area: i32,
    merge_region_area: i32,
) -> Result<()> {
    ctx.start_timer(TimerCategory::Regions);

    let mut src_reg = vec![0u16; chf.spans.len()];
    let mut max_region_id = sweep_regions(chf, border_size, &mut src_reg)?;
    ctx.check_cancelled()?;

    merge_and_filter_regions(
        ctx,
        min_region_area,
        merge_region_area,
        &mut max_region_id,
        chf,
        &mut src_reg,
    )?;
    chf.max_regions = max_region_id;

    for (span, reg) in chf.spans.iter_mut().zip(src_reg) {
        span.reg = reg;
    }

    ctx.stop_timer(TimerCategory::Regions);
    Ok(())
}

/// Builds monotone regions and merges them into layers without vertical overlap
pub fn build_layer_regions(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
    border_size: i32,
    min_region_area: i32,
) -> Result<()> {
    ctx.start_timer(TimerCategory::Regions);

    let mut src_reg = vec![0u16; chf.spans.len()];
    let mut max_region_id = sweep_regions(chf, border_size, &mut src_reg)?;
    ctx.check_cancelled()?;

    merge_and_filter_layer_regions(min_region_area, &mut max_region_id, chf, &mut src_reg);
    chf.max_regions = max_region_id;

    for (span, reg) in chf.spans.iter_mut().zip(src_reg) {
        span.reg = reg;
    }

    ctx.stop_timer(TimerCategory::Regions);
    Ok(())
}
