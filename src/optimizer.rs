//! Point-stream optimizer for sparse vector content.
//!
//! Low-point-count shapes render poorly on real galvanometer hardware: the
//! beam overshoots corners after long jumps and smears color across blanking
//! transitions. This pass inserts dwell points at blanking boundaries and
//! interpolates long jumps so such shapes draw cleanly. Dense pre-rendered
//! animation data is assumed to be optimized already and passes through
//! unchanged.

use crate::types::LaserPoint;

/// Inputs above this size are treated as pre-rendered and passed through.
const PASSTHROUGH_POINT_COUNT: usize = 500;

/// Maximum step between consecutive points before interpolation kicks in,
/// in normalized coordinate space.
const MAX_STEP_DISTANCE: f32 = 0.08;

/// Dwell points inserted at each blanking transition.
const BLANKING_DWELL_POINTS: usize = 3;

/// Optimizes a point sequence for galvanometer output.
///
/// Pure function, no state. Whenever the blanking flag transitions, a fixed
/// number of dwell duplicates is inserted at the boundary with color forced
/// to zero, so the beam settles before and after a blank. Whenever the
/// distance between consecutive points exceeds [`MAX_STEP_DISTANCE`],
/// intermediate points are linearly interpolated, carrying the destination's
/// color unless the destination is blanked.
pub fn optimize(points: &[LaserPoint]) -> Vec<LaserPoint> {
    if points.len() > PASSTHROUGH_POINT_COUNT {
        return points.to_vec();
    }
    let Some(&first) = points.first() else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(points.len() * 2);
    let mut prev = first;

    for &curr in points {
        if prev.blanking != curr.blanking {
            if curr.blanking {
                // Going dark: hold the previous position blanked.
                for _ in 0..BLANKING_DWELL_POINTS {
                    out.push(LaserPoint::blanked(prev.x, prev.y));
                }
            } else {
                // Going lit: settle on the new position before lighting up.
                for _ in 0..=BLANKING_DWELL_POINTS {
                    out.push(LaserPoint::blanked(curr.x, curr.y));
                }
            }
        }

        let dx = curr.x - prev.x;
        let dy = curr.y - prev.y;
        let dist = (dx * dx + dy * dy).sqrt();

        if dist > MAX_STEP_DISTANCE {
            let steps = (dist / MAX_STEP_DISTANCE) as usize;
            for s in 1..steps {
                let t = s as f32 / steps as f32;
                let (r, g, b) = if curr.blanking {
                    (0, 0, 0)
                } else {
                    (curr.r, curr.g, curr.b)
                };
                out.push(LaserPoint {
                    x: prev.x + dx * t,
                    y: prev.y + dy * t,
                    r,
                    g,
                    b,
                    blanking: curr.blanking,
                });
            }
        }

        out.push(curr);
        prev = curr;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(x: f32, y: f32) -> LaserPoint {
        LaserPoint::new(x, y, 255, 128, 64)
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(optimize(&[]).is_empty());
    }

    #[test]
    fn large_input_passes_through_unchanged() {
        let points: Vec<LaserPoint> = (0..600)
            .map(|i| lit(i as f32 / 600.0, -(i as f32) / 600.0))
            .collect();
        assert_eq!(optimize(&points), points);
    }

    #[test]
    fn short_steps_pass_through() {
        let points = vec![lit(0.0, 0.0), lit(0.05, 0.0), lit(0.05, 0.05)];
        assert_eq!(optimize(&points), points);
    }

    #[test]
    fn long_jump_is_interpolated() {
        let points = vec![lit(0.0, 0.0), lit(0.8, 0.0)];
        let optimized = optimize(&points);

        // 0.8 / 0.08 = 10 steps, 9 interpolated points between the endpoints
        assert_eq!(optimized.len(), 2 + 9);
        assert_eq!(optimized[0], points[0]);
        assert_eq!(*optimized.last().unwrap(), points[1]);

        // Interpolated points carry the destination color and ascend in x.
        for pair in optimized.windows(2) {
            assert!(pair[0].x < pair[1].x);
        }
        for p in &optimized[1..optimized.len() - 1] {
            assert_eq!((p.r, p.g, p.b), (255, 128, 64));
            assert!(!p.blanking);
        }
    }

    #[test]
    fn jump_to_blanked_point_interpolates_dark() {
        let points = vec![
            LaserPoint::blanked(0.0, 0.0),
            LaserPoint::blanked(0.5, 0.0),
        ];
        let optimized = optimize(&points);
        assert!(optimized.len() > 2);
        assert!(optimized.iter().all(|p| p.blanking && p.is_dark()));
    }

    #[test]
    fn blanking_transition_inserts_dwell() {
        let points = vec![lit(0.1, 0.1), LaserPoint::blanked(0.1, 0.1)];
        let optimized = optimize(&points);

        // lit point, 3 dwell points at the previous position, blanked point
        assert_eq!(optimized.len(), 2 + BLANKING_DWELL_POINTS);
        for p in &optimized[1..1 + BLANKING_DWELL_POINTS] {
            assert!(p.blanking);
            assert!(p.is_dark());
            assert_eq!((p.x, p.y), (0.1, 0.1));
        }
    }

    #[test]
    fn unblanking_dwells_before_lighting_up() {
        let points = vec![LaserPoint::blanked(0.0, 0.0), lit(0.0, 0.0)];
        let optimized = optimize(&points);

        assert_eq!(optimized.len(), 2 + BLANKING_DWELL_POINTS + 1);
        // Everything before the final lit point is blanked at the target position.
        for p in &optimized[..optimized.len() - 1] {
            assert!(p.blanking);
        }
        assert!(!optimized.last().unwrap().blanking);
    }

    #[test]
    fn never_invents_lit_all_zero_points() {
        // A lit point whose source color is non-zero must never come out as
        // a lit point with all-zero color.
        let points = vec![
            lit(0.0, 0.0),
            LaserPoint::blanked(0.9, 0.9),
            lit(-0.9, 0.4),
        ];
        for p in optimize(&points) {
            if !p.blanking {
                assert!(!p.is_dark());
            }
        }
    }
}
