use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// 2D point in image pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2f {
    pub x: f32,
    pub y: f32,
}

impl Point2f {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// 3D point in meters.
///
/// The `invalid` flag is a tombstone used while a frame is being filtered:
/// rejected vertices are overwritten with `Point3f::invalid()` and removed
/// in a single compaction pass at the end. No invalid point ever leaves the
/// frame pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub invalid: bool,
}

impl Point3f {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            invalid: false,
        }
    }

    /// The tombstone value written over rejected vertices.
    pub fn invalid() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            invalid: true,
        }
    }

    /// Convert to packed millimeter coordinates.
    ///
    /// Matches the wire conversion: multiply by 1000, truncate toward zero
    /// and saturate at the `i16` range.
    pub fn to_millimeters(self) -> Point3s {
        Point3s {
            x: (1000.0 * self.x) as i16,
            y: (1000.0 * self.y) as i16,
            z: (1000.0 * self.z) as i16,
        }
    }

    pub fn coords(self) -> Vector3<f32> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn from_coords(v: Vector3<f32>) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

/// Packed 16-bit point in millimeters, as sent over the wire and written to
/// recording files (three little-endian `i16`, six bytes total).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Point3s {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Point3s {
    pub fn new(x: i16, y: i16, z: i16) -> Self {
        Self { x, y, z }
    }
}

/// 8-bit color sample. Recording files serialize channels in B, G, R order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Rigid transform: a 3x3 rotation and a translation.
///
/// The calibration convention is translate-then-rotate: a camera-space
/// point `p` maps to world space as `R * (p + T)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransform {
    pub rotation: Matrix3<f32>,
    pub translation: Vector3<f32>,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: Matrix3<f32>, translation: Vector3<f32>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Apply the rotation only: `R * p`.
    pub fn rotate(&self, p: Point3f) -> Point3f {
        let v = self.rotation * p.coords();
        Point3f {
            x: v.x,
            y: v.y,
            z: v.z,
            invalid: p.invalid,
        }
    }

    /// Apply the inverse rotation: `R^T * p`. For rotation matrices the
    /// transpose is the inverse.
    pub fn inverse_rotate(&self, v: Vector3<f32>) -> Vector3<f32> {
        self.rotation.transpose() * v
    }

    /// Map a camera-space point into world space.
    pub fn apply(&self, p: Point3f) -> Point3f {
        let v = self.rotation * (p.coords() + self.translation);
        Point3f {
            x: v.x,
            y: v.y,
            z: v.z,
            invalid: p.invalid,
        }
    }

    /// Row-major copy of the rotation, as handed to host callbacks.
    pub fn rotation_row_major(&self) -> [f32; 9] {
        let r = &self.rotation;
        [
            r[(0, 0)],
            r[(0, 1)],
            r[(0, 2)],
            r[(1, 0)],
            r[(1, 1)],
            r[(1, 2)],
            r[(2, 0)],
            r[(2, 1)],
            r[(2, 2)],
        ]
    }

    pub fn translation_array(&self) -> [f32; 3] {
        [self.translation.x, self.translation.y, self.translation.z]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    #[test]
    fn millimeter_conversion_truncates_toward_zero() {
        let p = Point3f::new(0.0101, -0.0015, 1.9996);
        let s = p.to_millimeters();
        assert_eq!(s, Point3s::new(10, -1, 1999));
    }

    #[test]
    fn millimeter_conversion_saturates() {
        let p = Point3f::new(1000.0, -1000.0, 0.0);
        let s = p.to_millimeters();
        assert_eq!(s.x, i16::MAX);
        assert_eq!(s.y, i16::MIN);
        assert_eq!(s.z, 0);
    }

    #[test]
    fn apply_translates_then_rotates() {
        // 90 degrees about Z.
        let r = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let t = AffineTransform::new(r, Vector3::new(1.0, 0.0, 0.0));
        let p = t.apply(Point3f::new(1.0, 0.0, 0.0));
        assert!((p.x - 0.0).abs() < 1e-6);
        assert!((p.y - 2.0).abs() < 1e-6);
    }

    #[test]
    fn inverse_rotate_is_transpose() {
        let r = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let t = AffineTransform::new(r, Vector3::zeros());
        let v = Vector3::new(0.0, 1.0, 0.0);
        let back = t.inverse_rotate(t.rotation * v);
        assert!((back - v).norm() < 1e-6);
    }
}
