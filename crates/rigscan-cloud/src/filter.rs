use kiddo::{KdTree, SquaredEuclidean};
use rayon::prelude::*;
use rigscan_core::{Point3f, Rgb};

/// Statistical outlier removal based on k-nearest-neighbour distance.
///
/// Builds a k-d tree over `vertices` and drops every point whose k-th
/// nearest neighbour (the query point itself is indexed and counts) lies
/// farther than `max_dist`. Survivors are compacted in place, in order,
/// with `colors` kept parallel. A non-positive `k` or `max_dist` makes the
/// call a no-op.
pub fn remove_outliers(vertices: &mut Vec<Point3f>, colors: &mut Vec<Rgb>, k: i32, max_dist: f32) {
    if k <= 0 || max_dist <= 0.0 || vertices.is_empty() {
        return;
    }

    let coords: Vec<[f32; 3]> = vertices.iter().map(|p| [p.x, p.y, p.z]).collect();
    let tree: KdTree<f32, 3> = (&coords).into();

    let k = k as usize;
    let threshold_sq = max_dist * max_dist;

    // Pure reads against the built index; queried in parallel.
    let kth_distance_sq: Vec<f32> = coords
        .par_iter()
        .map(|p| {
            tree.nearest_n::<SquaredEuclidean>(p, k)
                .last()
                .map(|n| n.distance)
                .unwrap_or(0.0)
        })
        .collect();

    let mut write = 0;
    for read in 0..vertices.len() {
        if kth_distance_sq[read] > threshold_sq {
            continue;
        }
        vertices[write] = vertices[read];
        colors[write] = colors[read];
        write += 1;
    }
    vertices.truncate(write);
    colors.truncate(write);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_outlier() -> (Vec<Point3f>, Vec<Rgb>) {
        let mut vertices: Vec<Point3f> = (0..12)
            .map(|i| Point3f::new(0.001 * i as f32, 0.0, 1.0))
            .collect();
        vertices.push(Point3f::new(5.0, 5.0, 5.0));

        let colors: Vec<Rgb> = (0..vertices.len()).map(|i| Rgb::new(i as u8, 0, 0)).collect();
        (vertices, colors)
    }

    #[test]
    fn isolated_point_is_removed() {
        let (mut vertices, mut colors) = cluster_with_outlier();
        remove_outliers(&mut vertices, &mut colors, 10, 0.05);

        assert_eq!(vertices.len(), 12);
        assert_eq!(colors.len(), 12);
        assert!(vertices.iter().all(|p| p.z == 1.0));
    }

    #[test]
    fn survivor_order_is_preserved() {
        let (mut vertices, mut colors) = cluster_with_outlier();
        remove_outliers(&mut vertices, &mut colors, 10, 0.05);

        for (i, c) in colors.iter().enumerate() {
            assert_eq!(c.r as usize, i);
        }
    }

    #[test]
    fn non_positive_parameters_disable_the_filter() {
        let (mut vertices, mut colors) = cluster_with_outlier();
        let before = vertices.len();

        remove_outliers(&mut vertices, &mut colors, 0, 0.05);
        assert_eq!(vertices.len(), before);

        remove_outliers(&mut vertices, &mut colors, 10, 0.0);
        assert_eq!(vertices.len(), before);
        assert_eq!(colors.len(), before);
    }

    #[test]
    fn dense_cloud_is_untouched() {
        let mut vertices: Vec<Point3f> = (0..50)
            .map(|i| Point3f::new(0.001 * (i % 10) as f32, 0.001 * (i / 10) as f32, 1.0))
            .collect();
        let mut colors = vec![Rgb::BLACK; 50];

        remove_outliers(&mut vertices, &mut colors, 10, 0.01);
        assert_eq!(vertices.len(), 50);
    }
}
