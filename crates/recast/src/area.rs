//! Walkable area erosion
//!
//! Shrinks the walkable area so that agent centers keep at least the agent radius away
//! from walls and drops. Distances are approximated with a two pass chamfer transform
//! (2 for straight steps, 3 for diagonal steps), so the threshold is `radius * 2`.

use navkit_common::Result;

use crate::compact_heightfield::CompactHeightfield;
use crate::context::{BuildContext, TimerCategory};
use crate::RC_NULL_AREA;

/// Relaxes `dist[i]` through the straight neighbour in `dir` and then the diagonal
/// neighbour reached by turning into `diag_dir`.
fn relax(
    chf: &CompactHeightfield,
    dist: &mut [u8],
    x: i32,
    z: i32,
    i: usize,
    dir: usize,
    diag_dir: usize,
) {
    let Some((ax, az, ai)) = chf.neighbour(x, z, i, dir) else {
        return;
    };
    let nd = dist[ai].saturating_add(2);
    if nd < dist[i] {
        dist[i] = nd;
    }

    if let Some((_, _, aai)) = chf.neighbour(ax, az, ai, diag_dir) {
        let nd = dist[aai].saturating_add(3);
        if nd < dist[i] {
            dist[i] = nd;
        }
    }
}

/// Erodes the walkable area by `radius` cells.
///
/// Spans next to unwalkable spans or without connections on all four sides count as
/// boundary. Erosion only ever turns walkable spans into `RC_NULL_AREA`.
pub fn erode_walkable_area(
    ctx: &mut BuildContext,
    radius: i32,
    chf: &mut CompactHeightfield,
) -> Result<()> {
    ctx.start_timer(TimerCategory::Erosion);

    let w = chf.width;
    let h = chf.height;
    let mut dist = vec![0xffu8; chf.spans.len()];

    // Mark boundary cells
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell(x, z).spans() {
                if chf.areas[i] == RC_NULL_AREA {
                    dist[i] = 0;
                    continue;
                }
                let walkable_neighbours = (0..4)
                    .filter_map(|dir| chf.neighbour(x, z, i, dir))
                    .filter(|&(_, _, ai)| chf.areas[ai] != RC_NULL_AREA)
                    .count();
                if walkable_neighbours != 4 {
                    dist[i] = 0;
                }
            }
        }
    }

    ctx.check_cancelled()?;

    // Pass 1: (-1,0), (-1,-1), (0,-1), (1,-1)
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell(x, z).spans() {
                relax(chf, &mut dist, x, z, i, 0, 3);
                relax(chf, &mut dist, x, z, i, 3, 2);
            }
        }
    }

    // Pass 2: (1,0), (1,1), (0,1), (-1,1)
    for z in (0..h).rev() {
        for x in (0..w).rev() {
            for i in chf.cell(x, z).spans() {
                relax(chf, &mut dist, x, z, i, 2, 1);
                relax(chf, &mut dist, x, z, i, 1, 0);
            }
        }
    }

    let threshold = (radius * 2).clamp(0, 255) as u8;
    for (area, &d) in chf.areas.iter_mut().zip(&dist) {
        if d < threshold {
            *area = RC_NULL_AREA;
        }
    }

    ctx.stop_timer(TimerCategory::Erosion);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heightfield::Heightfield;
    use crate::RC_WALKABLE_AREA;
    use glam::Vec3;

    fn flat_chf(size: i32) -> CompactHeightfield {
        let mut hf = Heightfield::new(
            size,
            size,
            Vec3::ZERO,
            Vec3::new(size as f32, 10.0, size as f32),
            1.0,
            0.5,
        );
        for z in 0..size {
            for x in 0..size {
                hf.add_span(x, z, 0, 2, RC_WALKABLE_AREA, 1).unwrap();
            }
        }
        CompactHeightfield::build(&mut BuildContext::new(), 4, 1, &hf).unwrap()
    }

    fn walkable_cells(chf: &CompactHeightfield) -> Vec<(i32, i32)> {
        let mut cells = Vec::new();
        for z in 0..chf.height {
            for x in 0..chf.width {
                if chf.cell(x, z).spans().any(|i| chf.areas[i] != RC_NULL_AREA) {
                    cells.push((x, z));
                }
            }
        }
        cells
    }

    #[test]
    fn test_erode_removes_border_ring() {
        let mut chf = flat_chf(10);
        erode_walkable_area(&mut BuildContext::new(), 2, &mut chf).unwrap();
        let cells = walkable_cells(&chf);
        // Boundary cells have distance 0 and the next ring 2, both below 4
        assert!(cells.iter().all(|&(x, z)| (2..8).contains(&x) && (2..8).contains(&z)));
        assert_eq!(cells.len(), 36);
    }

    #[test]
    fn test_erode_zero_radius_keeps_area() {
        let mut chf = flat_chf(6);
        erode_walkable_area(&mut BuildContext::new(), 0, &mut chf).unwrap();
        assert_eq!(walkable_cells(&chf).len(), 36);
    }

    #[test]
    fn test_erode_never_grows() {
        let mut chf = flat_chf(8);
        let center = chf.cell(4, 4).index as usize;
        chf.areas[center] = RC_NULL_AREA;
        let before = walkable_cells(&chf);
        erode_walkable_area(&mut BuildContext::new(), 1, &mut chf).unwrap();
        let after = walkable_cells(&chf);
        assert!(after.iter().all(|c| before.contains(c)));
        assert!(!after.contains(&(4, 5)));
        assert!(!after.contains(&(4, 4)));
    }
}
