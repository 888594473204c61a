//! Point correspondence via nearest-neighbour matching.
//!
//! Used to link detections of the same object across overlapping exposures
//! and to attach reference stars to associated objects.

use nalgebra::Vector2;

/// Index and distance of the target closest to `point`, if any target lies
/// within `radius`.
pub fn nearest_within(
    point: &Vector2<f64>,
    targets: &[Vector2<f64>],
    radius: f64,
) -> Option<(usize, f64)> {
    nearest(point, targets).filter(|&(_, dist)| dist <= radius)
}

/// For every source point, the index of the closest target within `radius`.
pub fn match_within_radius(
    source_points: &[Vector2<f64>],
    target_points: &[Vector2<f64>],
    radius: f64,
) -> Vec<Option<usize>> {
    source_points
        .iter()
        .map(|p| nearest_within(p, target_points, radius).map(|(j, _)| j))
        .collect()
}

/// Brute-force search, O(m) per query over m targets.
// TODO: accelerate with a KD-tree for large point sets
fn nearest(point: &Vector2<f64>, targets: &[Vector2<f64>]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;

    for (j, target) in targets.iter().enumerate() {
        let dist_sq = (point - target).norm_squared();
        match best {
            Some((_, d)) if d <= dist_sq => {}
            _ => best = Some((j, dist_sq)),
        }
    }

    best.map(|(j, d)| (j, d.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_equidistant_targets_keep_first() {
        let source = vec![Vector2::new(0.0, 0.0)];
        let target = vec![
            Vector2::new(2.0, 0.0),
            Vector2::new(-1.0, 0.0),
            Vector2::new(0.0, 1.0),
        ];
        assert_eq!(match_within_radius(&source, &target, 1.0), vec![Some(1)]);
    }

    #[test]
    fn test_empty_targets() {
        let source = vec![Vector2::new(0.0, 0.0)];
        assert!(nearest_within(&source[0], &[], f64::INFINITY).is_none());
        assert_eq!(match_within_radius(&source, &[], 1.0), vec![None]);
    }

    #[test]
    fn test_radius_limits_matches() {
        let source = vec![Vector2::new(0.0, 0.0), Vector2::new(5.0, 5.0)];
        let target = vec![Vector2::new(0.05, 0.0), Vector2::new(6.0, 5.0)];
        let matches = match_within_radius(&source, &target, 0.1);
        assert_eq!(matches, vec![Some(0), None]);
    }

    #[test]
    fn test_jittered_shuffle_is_recovered() {
        let mut rng = StdRng::seed_from_u64(42);
        let source: Vec<Vector2<f64>> = (0..200)
            .map(|i| Vector2::new((i % 20) as f64 * 10.0, (i / 20) as f64 * 10.0))
            .collect();

        // Shift every point by less than the radius and reverse the order
        let target: Vec<Vector2<f64>> = source
            .iter()
            .rev()
            .map(|p| p + Vector2::new(rng.random_range(-0.5..0.5), rng.random_range(-0.5..0.5)))
            .collect();

        let matches = match_within_radius(&source, &target, 1.0);
        for (i, m) in matches.iter().enumerate() {
            assert_eq!(*m, Some(199 - i));
        }
    }

    #[test]
    fn test_nearest_within_reports_distance() {
        let target = vec![Vector2::new(3.0, 4.0)];
        let (idx, dist) = nearest_within(&Vector2::new(0.0, 0.0), &target, 5.0).unwrap();
        assert_eq!(idx, 0);
        assert!((dist - 5.0).abs() < 1e-12);
    }
}
