use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Matrix3, Vector3};
use rigscan_core::{rotation_from_cross_covariance, Point3f};

/// Iterative closest point: rigid alignment of `source` onto `target`.
///
/// `source` is transformed in place; `rotation` and `translation` are
/// composed on top of whatever the caller initialized them to (identity
/// and zero for a fresh alignment), so an alignment can be continued
/// across calls. Vertices compose with the result in row-vector form:
/// `aligned = (p + translation) * rotation`.
///
/// The caller owns termination: exactly `max_iterations` iterations run,
/// there is no convergence test. Returns the mean nearest-neighbour
/// distance of the matches that survived outlier rejection in the last
/// iteration.
pub fn align(
    target: &[Point3f],
    source: &mut [Point3f],
    rotation: &mut Matrix3<f32>,
    translation: &mut Vector3<f32>,
    max_iterations: usize,
) -> f32 {
    let mut error = 1.0f32;
    if target.is_empty() || source.is_empty() {
        return error;
    }

    let coords: Vec<[f32; 3]> = target.iter().map(|p| [p.x, p.y, p.z]).collect();
    let tree: KdTree<f32, 3> = (&coords).into();

    for _ in 0..max_iterations {
        // Match every source point to its nearest target, then keep at most
        // one source per target. A later source claiming an already-matched
        // target replaces the stored match unless the stored squared
        // distance is strictly smaller; ties overwrite.
        let mut claimed: Vec<i32> = vec![-1; target.len()];
        let mut matched_target: Vec<Vector3<f32>> = Vec::new();
        let mut matched_source: Vec<Vector3<f32>> = Vec::new();
        let mut match_distances: Vec<f32> = Vec::new();

        for p in source.iter() {
            let nn = tree.nearest_one::<SquaredEuclidean>(&[p.x, p.y, p.z]);
            let target_idx = nn.item as usize;
            let distance = nn.distance;

            let existing = claimed[target_idx];
            if existing >= 0 && match_distances[existing as usize] < distance {
                continue;
            }

            if existing < 0 {
                matched_target.push(target[target_idx].coords());
                matched_source.push(p.coords());
                match_distances.push(distance);
                claimed[target_idx] = (matched_source.len() - 1) as i32;
            } else {
                matched_source[existing as usize] = p.coords();
                match_distances[existing as usize] = distance;
            }
        }

        // Reject matches farther than 2.5 standard deviations.
        let sigma = standard_deviation(&match_distances);
        let mut kept_target = Vec::with_capacity(matched_target.len());
        let mut kept_source = Vec::with_capacity(matched_source.len());
        let mut kept_distances = Vec::with_capacity(match_distances.len());
        for i in 0..match_distances.len() {
            if match_distances[i] > 2.5 * sigma {
                continue;
            }
            kept_target.push(matched_target[i]);
            kept_source.push(matched_source[i]);
            kept_distances.push(match_distances[i]);
        }

        if kept_source.is_empty() {
            break;
        }

        // Translation step: centroid shift, applied to the whole source
        // array and to the kept pairs.
        let mut shift = Vector3::zeros();
        for (t, s) in kept_target.iter().zip(&kept_source) {
            shift += t - s;
        }
        shift /= kept_source.len() as f32;

        for p in source.iter_mut() {
            p.x += shift.x;
            p.y += shift.y;
            p.z += shift.z;
        }
        for s in kept_source.iter_mut() {
            *s += shift;
        }

        // Rotation step: SVD of the source-target cross covariance.
        let mut h = Matrix3::<f64>::zeros();
        for (t, s) in kept_target.iter().zip(&kept_source) {
            h += s.map(|v| v as f64) * t.map(|v| v as f64).transpose();
        }
        let Some(update) = rotation_from_cross_covariance(h) else {
            break;
        };
        let update = update.map(|v| v as f32);

        // source <- source * update (row-vector form).
        let update_t = update.transpose();
        for p in source.iter_mut() {
            let v = update_t * p.coords();
            p.x = v.x;
            p.y = v.y;
            p.z = v.z;
        }

        // T <- T + shift * R^T, then R <- R * update.
        *translation += *rotation * shift;
        *rotation *= update;

        error = kept_distances.iter().map(|d| d.sqrt()).sum::<f32>()
            / kept_distances.len() as f32;
    }

    error
}

fn standard_deviation(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }

    let mean = data.iter().sum::<f32>() / data.len() as f32;
    let variance = data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / data.len() as f32;
    variance.sqrt()
}
