//! Frame padding policy.
//!
//! Streamed devices consume a fixed number of points per refresh; frames
//! shorter than that must be stretched. How depends on the content: generator
//! shapes (closed loops) are repeated so the beam stays bright and
//! continuously moving, while animation paths get blanked copies of their
//! final point appended, because redrawing an open path visibly doubles it.
//!
//! The closed-loop test below is a heuristic over geometry and point count,
//! not a declared frame property, and is re-evaluated for every frame. The
//! thresholds are tuned to how the reference hardware looks in practice;
//! they can misclassify large but genuinely closed shapes, and that is
//! accepted.

use crate::types::LaserPoint;

/// Maximum start/end distance for a sequence to count as a closed loop.
const CLOSED_LOOP_EPSILON: f32 = 0.01;

/// Sequences longer than this are never treated as closed loops.
const CLOSED_LOOP_MAX_POINTS: usize = 256;

/// Pads `points` up to at least `target` points.
///
/// Inputs already at or above the target are returned as-is. Closed loops
/// are padded by repeating the whole sequence until the target is met; open
/// paths by appending blanked copies of the final point.
pub fn pad(points: &[LaserPoint], target: usize) -> Vec<LaserPoint> {
    if points.is_empty() || points.len() >= target {
        return points.to_vec();
    }

    if is_closed_loop(points) {
        let mut out = Vec::with_capacity(target + points.len());
        while out.len() < target {
            out.extend_from_slice(points);
        }
        out
    } else {
        let mut out = points.to_vec();
        let last = points[points.len() - 1];
        out.resize(target, LaserPoint::blanked(last.x, last.y));
        out
    }
}

/// Closed-loop heuristic: small point count, no blanking anywhere in the
/// sequence, and first/last point geometrically coincident.
fn is_closed_loop(points: &[LaserPoint]) -> bool {
    if points.len() < 3 || points.len() > CLOSED_LOOP_MAX_POINTS {
        return false;
    }
    if points.iter().any(|p| p.blanking) {
        return false;
    }
    let first = points[0];
    let last = points[points.len() - 1];
    let dx = first.x - last.x;
    let dy = first.y - last.y;
    (dx * dx + dy * dy).sqrt() <= CLOSED_LOOP_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A lit circle whose last point lands back on the first.
    fn circle(n: usize) -> Vec<LaserPoint> {
        (0..n)
            .map(|i| {
                let a = i as f32 / n as f32 * std::f32::consts::TAU;
                LaserPoint::new(a.cos() * 0.5, a.sin() * 0.5, 0, 255, 0)
            })
            .chain(std::iter::once(LaserPoint::new(0.5, 0.0, 0, 255, 0)))
            .collect()
    }

    fn open_path(n: usize) -> Vec<LaserPoint> {
        (0..n)
            .map(|i| LaserPoint::new(i as f32 / n as f32, 0.0, 255, 0, 0))
            .collect()
    }

    #[test]
    fn already_long_enough_is_returned_as_is() {
        let points = open_path(100);
        assert_eq!(pad(&points, 50), points);
        assert_eq!(pad(&points, 100), points);
    }

    #[test]
    fn empty_input_stays_empty() {
        assert!(pad(&[], 100).is_empty());
    }

    #[test]
    fn closed_loop_is_repeated() {
        let points = circle(49);
        let padded = pad(&points, 400);

        assert!(padded.len() >= 400);
        // The output is the original sequence repeated whole.
        assert_eq!(padded.len() % points.len(), 0);
        for (i, p) in padded.iter().enumerate() {
            assert_eq!(*p, points[i % points.len()]);
        }
    }

    #[test]
    fn open_path_gets_blanked_tail() {
        let points = open_path(20);
        let padded = pad(&points, 100);

        assert_eq!(padded.len(), 100);
        assert_eq!(&padded[..20], &points[..]);
        let last = points[19];
        for p in &padded[20..] {
            assert!(p.blanking);
            assert!(p.is_dark());
            assert_eq!((p.x, p.y), (last.x, last.y));
        }
    }

    #[test]
    fn internal_blanking_disqualifies_closed_loop() {
        let mut points = circle(30);
        points[10].blanking = true;
        let padded = pad(&points, 200);

        // Padded as an open path: original points then blanked tail.
        assert_eq!(padded.len(), 200);
        assert!(padded[points.len()..].iter().all(|p| p.blanking));
    }

    #[test]
    fn large_shape_is_not_classified_closed() {
        let points = circle(300);
        let padded = pad(&points, 800);
        assert_eq!(padded.len(), 800);
        assert!(padded[points.len()..].iter().all(|p| p.blanking));
    }

    #[test]
    fn gaping_path_is_open() {
        let points = open_path(10);
        assert!(!is_closed_loop(&points));
    }
}
