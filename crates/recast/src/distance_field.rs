//! Distance field used by watershed partitioning
//!
//! Every span gets its chamfer distance (2 straight, 3 diagonal) to the nearest area
//! boundary. The field is box blurred once to get rid of single cell ridges that would
//! otherwise seed tiny regions.

use navkit_common::Result;

use crate::compact_heightfield::CompactHeightfield;
use crate::context::{BuildContext, TimerCategory};

fn relax(
    chf: &CompactHeightfield,
    dist: &mut [u16],
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

fn calculate_distance_field(chf: &CompactHeightfield) -> (Vec<u16>, u16) {
    let w = chf.width;
    let h = chf.height;
    let mut dist = vec![0xffffu16; chf.spans.len()];

    // Boundary: a missing connection or a neighbour of another area
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell(x, z).spans() {
                let area = chf.areas[i];
                let same_area = (0..4)
                    .filter_map(|dir| chf.neighbour(x, z, i, dir))
                    .filter(|&(_, _, ai)| chf.areas[ai] == area)
                    .count();
                if same_area != 4 {
                    dist[i] = 0;
                }
            }
        }
    }

    for z in 0..h {
        for x in 0..w {
            for i in chf.cell(x, z).spans() {
                relax(chf, &mut dist, x, z, i, 0, 3);
                relax(chf, &mut dist, x, z, i, 3, 2);
            }
        }
    }

    for z in (0..h).rev() {
        for x in (0..w).rev() {
            for i in chf.cell(x, z).spans() {
                relax(chf, &mut dist, x, z, i, 2, 1);
                relax(chf, &mut dist, x, z, i, 1, 0);
            }
        }
    }

    let max_dist = dist.iter().copied().max().unwrap_or(0);
    (dist, max_dist)
}

fn box_blur(chf: &CompactHeightfield, threshold: u16, src: &[u16]) -> Vec<u16> {
    let threshold = threshold * 2;
    let mut dst = vec![0u16; src.len()];

    for z in 0..chf.height {
        for x in 0..chf.width {
            for i in chf.cell(x, z).spans() {
                let cd = src[i];
                if cd <= threshold {
                    dst[i] = cd;
                    continue;
                }

                let mut d = cd as u32;
                for dir in 0..4 {
                    match chf.neighbour(x, z, i, dir) {
                        Some((ax, az, ai)) => {
                            d += src[ai] as u32;
                            let dir2 = (dir + 1) & 3;
                            match chf.neighbour(ax, az, ai, dir2) {
                                Some((_, _, a2)) => d += src[a2] as u32,
                                None => d += cd as u32,
                            }
                        }
                        None => d += cd as u32 * 2,
                    }
                }
                dst[i] = ((d + 5) / 9) as u16;
            }
        }
    }

    dst
}

/// Builds the blurred distance field into `chf.dist` and records `chf.max_distance`
pub fn build_distance_field(ctx: &mut BuildContext, chf: &mut CompactHeightfield) -> Result<()> {
    ctx.start_timer(TimerCategory::Regions);

    let (dist, max_dist) = calculate_distance_field(chf);
    chf.max_distance = max_dist;
    ctx.check_cancelled()?;
    chf.dist = box_blur(chf, 1, &dist);

    ctx.stop_timer(TimerCategory::Regions);
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

    #[test]
    fn test_distance_grows_towards_center() {
        let chf = flat_chf(9);
        let (dist, max_dist) = calculate_distance_field(&chf);
        let at = |x: i32, z: i32| dist[chf.cell(x, z).index as usize];
        assert_eq!(at(0, 0), 0);
        assert_eq!(at(0, 4), 0);
        assert_eq!(at(1, 4), 2);
        assert_eq!(at(2, 4), 4);
        assert_eq!(at(4, 4), 8);
        assert_eq!(max_dist, 8);
    }

    #[test]
    fn test_build_distance_field_fills_every_span() {
        let mut chf = flat_chf(7);
        build_distance_field(&mut BuildContext::new(), &mut chf).unwrap();
        assert_eq!(chf.dist.len(), chf.spans.len());
        assert!(chf.require_distance_field().is_ok());
        // Blur keeps the boundary at zero and the peak in the middle
        assert_eq!(chf.dist[chf.cell(0, 3).index as usize], 0);
        let center = chf.dist[chf.cell(3, 3).index as usize];
        assert!(chf.dist.iter().all(|&d| d <= center));
    }
}
