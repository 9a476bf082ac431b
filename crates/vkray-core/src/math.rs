//! Math utilities and helpers.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Align a 64-bit value up to the given power-of-two alignment.
#[inline]
pub const fn align_up_u64(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Row-major 3x4 affine transform (the top three rows of a 4x4 matrix).
///
/// This is the layout ray tracing instances expect: 12 floats, row by row,
/// with the translation in the last column.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Transform3x4 {
    pub rows: [[f32; 4]; 3],
}

impl Transform3x4 {
    /// Identity transform.
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Convert a column-major `glam` matrix. The projective row is dropped.
    pub fn from_mat4(m: &Mat4) -> Self {
        let r0: Vec4 = m.row(0);
        let r1: Vec4 = m.row(1);
        let r2: Vec4 = m.row(2);
        Self {
            rows: [r0.to_array(), r1.to_array(), r2.to_array()],
        }
    }

    /// Expand back into a 4x4 matrix with `[0, 0, 0, 1]` as the last row.
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&[
            [self.rows[0][0], self.rows[1][0], self.rows[2][0], 0.0],
            [self.rows[0][1], self.rows[1][1], self.rows[2][1], 0.0],
            [self.rows[0][2], self.rows[1][2], self.rows[2][2], 0.0],
            [self.rows[0][3], self.rows[1][3], self.rows[2][3], 1.0],
        ])
    }

    /// Flatten to the 12-float array used by `VkTransformMatrixKHR`.
    pub fn to_array(&self) -> [f32; 12] {
        bytemuck::cast(self.rows)
    }
}

impl Default for Transform3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Mat4> for Transform3x4 {
    fn from(m: Mat4) -> Self {
        Self::from_mat4(&m)
    }
}

/// Rotation about the Y axis, in degrees.
#[inline]
pub fn rotate_y_degrees(degrees: f32) -> Mat4 {
    Mat4::from_rotation_y(degrees.to_radians())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec3;

    #[test]
    fn align_up_values() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up_u64(1, 256), 256);
    }

    #[test]
    fn identity_roundtrip() {
        assert_eq!(Transform3x4::from_mat4(&Mat4::IDENTITY), Transform3x4::IDENTITY);
        assert_eq!(Transform3x4::IDENTITY.to_mat4(), Mat4::IDENTITY);
    }

    #[test]
    fn translation_lands_in_last_column() {
        let t = Transform3x4::from(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        let flat = t.to_array();
        assert_eq!(flat[3], 1.0);
        assert_eq!(flat[7], 2.0);
        assert_eq!(flat[11], 3.0);
    }

    #[test]
    fn rotation_is_row_major() {
        let m = rotate_y_degrees(30.0);
        let t = Transform3x4::from_mat4(&m);
        let (s, c) = 30f32.to_radians().sin_cos();
        // Row 0 of a Y rotation is [cos, 0, sin].
        assert_relative_eq!(t.rows[0][0], c, epsilon = 1e-6);
        assert_relative_eq!(t.rows[0][2], s, epsilon = 1e-6);
        assert_relative_eq!(t.rows[2][0], -s, epsilon = 1e-6);
        assert!(t.to_mat4().abs_diff_eq(m, 1e-6));
    }
}
