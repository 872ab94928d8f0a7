use crate::Point3f;
use nalgebra::{Matrix3, Vector3};

/// Best rotation (det = +1) from a 3x3 cross-covariance matrix, via SVD.
///
/// Computes `U * V^T`; when the determinant comes out negative the last
/// singular direction is flipped (`U * diag(1, 1, -1) * V^T`) so a
/// reflection can never be returned.
pub fn rotation_from_cross_covariance(m: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let r = u * v_t;
    if r.determinant() >= 0.0 {
        return Some(r);
    }

    let flip = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0));
    Some(u * flip * v_t)
}

/// Solve the orthogonal Procrustes problem between two point sets with
/// known correspondences.
///
/// `observed` are measured points (camera space); `canonical` is the model
/// they correspond to. Returns `(rotation, translation)` where
/// `translation = -centroid(observed)` and `rotation` maps the centered
/// canonical cloud onto the centered observed cloud: when
/// `observed = R * canonical + t`, the recovered rotation is `R`. Returns
/// `None` when the sets are empty, of different length, or degenerate.
pub fn procrustes(canonical: &[Point3f], observed: &[Point3f]) -> Option<(Matrix3<f32>, Vector3<f32>)> {
    if canonical.is_empty() || canonical.len() != observed.len() {
        return None;
    }

    let n = canonical.len() as f64;
    let mut centroid_obs = Vector3::<f64>::zeros();
    let mut centroid_can = Vector3::<f64>::zeros();

    for (c, o) in canonical.iter().zip(observed) {
        centroid_can += Vector3::new(c.x as f64, c.y as f64, c.z as f64);
        centroid_obs += Vector3::new(o.x as f64, o.y as f64, o.z as f64);
    }
    centroid_can /= n;
    centroid_obs /= n;

    // Cross-covariance of the centered clouds: M = sum(a_i * b_i^T) with
    // a = observed - centroid(observed), b = canonical - centroid(canonical).
    let mut m = Matrix3::<f64>::zeros();
    for (c, o) in canonical.iter().zip(observed) {
        let a = Vector3::new(o.x as f64, o.y as f64, o.z as f64) - centroid_obs;
        let b = Vector3::new(c.x as f64, c.y as f64, c.z as f64) - centroid_can;
        m += a * b.transpose();
    }

    let r = rotation_from_cross_covariance(m)?;
    let rotation = r.map(|v| v as f32);
    let translation = Vector3::new(
        -centroid_obs.x as f32,
        -centroid_obs.y as f32,
        -centroid_obs.z as f32,
    );

    Some((rotation, translation))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation_z(angle: f64) -> Matrix3<f64> {
        let (s, c) = angle.sin_cos();
        Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
    }

    fn pentagon() -> Vec<Point3f> {
        vec![
            Point3f::new(0.0, -1.0, 0.0),
            Point3f::new(-1.0, -1.6667, 0.0),
            Point3f::new(-1.0, 1.0, 0.0),
            Point3f::new(1.0, 1.0, 0.0),
            Point3f::new(1.0, -1.6667, 0.0),
        ]
    }

    fn centroid(points: &[Point3f]) -> Vector3<f32> {
        let mut c = Vector3::zeros();
        for p in points {
            c += p.coords();
        }
        c / points.len() as f32
    }

    #[test]
    fn recovers_known_rigid_transform() {
        let canonical = pentagon();
        let r_true = rotation_z(0.7);
        let t_true = Vector3::new(0.3, -0.2, 1.5);

        let observed: Vec<Point3f> = canonical
            .iter()
            .map(|p| {
                let v = r_true * Vector3::new(p.x as f64, p.y as f64, p.z as f64)
                    + t_true.map(|x| x as f64);
                Point3f::new(v.x as f32, v.y as f32, v.z as f32)
            })
            .collect();

        let (r, t) = procrustes(&canonical, &observed).expect("procrustes");

        let expected_t = -centroid(&observed);
        assert!((t - expected_t).norm() < 1e-5);

        let r_expected = r_true.map(|v| v as f32);
        assert!((r - r_expected).norm() < 1e-4);
        assert!((r.determinant() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn reflection_input_still_yields_proper_rotation() {
        let canonical = pentagon();
        // Mirror the observation about the XY plane plus a twist so the
        // naive U*V^T solution would be a reflection.
        let observed: Vec<Point3f> = canonical
            .iter()
            .map(|p| Point3f::new(p.x, p.y, -p.z + 0.001 * p.x))
            .collect();

        let (r, _) = procrustes(&canonical, &observed).expect("procrustes");
        assert!(r.determinant() > 0.0);
    }

    #[test]
    fn empty_and_mismatched_inputs_fail() {
        assert!(procrustes(&[], &[]).is_none());
        assert!(procrustes(&pentagon(), &pentagon()[..3]).is_none());
    }
}
