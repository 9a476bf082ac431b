//! Procedural scene content.

use glam::{Mat4, Vec3, Vec4};
use std::f32::consts::TAU;

/// Triangle mesh with tightly packed positions and 32-bit indices.
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.positions)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

/// Axis-aligned box centred on the origin.
pub fn cuboid(half_extents: Vec3) -> MeshData {
    let Vec3 { x, y, z } = half_extents;
    let positions = vec![
        [-x, -y, -z],
        [x, -y, -z],
        [x, y, -z],
        [-x, y, -z],
        [-x, -y, z],
        [x, -y, z],
        [x, y, z],
        [-x, y, z],
    ];
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 0, 3, 2, // -z
        4, 5, 6, 4, 6, 7, // +z
        0, 1, 5, 0, 5, 4, // -y
        3, 7, 6, 3, 6, 2, // +y
        0, 4, 7, 0, 7, 3, // -x
        1, 2, 6, 1, 6, 5, // +x
    ];
    MeshData { positions, indices }
}

/// Flat square in the XZ plane.
pub fn ground(half_size: f32) -> MeshData {
    let s = half_size;
    MeshData {
        positions: vec![[-s, 0.0, -s], [s, 0.0, -s], [s, 0.0, s], [-s, 0.0, s]],
        indices: vec![0, 2, 1, 0, 3, 2],
    }
}

/// Per-mesh shader data: base colour.
pub fn mesh_uniform(index: usize, count: usize) -> Vec4 {
    let hue = index as f32 / count.max(1) as f32;
    Vec4::new(
        0.5 + 0.5 * (TAU * hue).cos(),
        0.5 + 0.5 * (TAU * (hue + 1.0 / 3.0)).cos(),
        0.5 + 0.5 * (TAU * (hue + 2.0 / 3.0)).cos(),
        1.0,
    )
}

/// Transform of mesh `index` out of `count` boxes orbiting the origin.
pub fn orbit(index: usize, count: usize, radius: f32, spin_degrees: f32) -> Mat4 {
    let angle = TAU * index as f32 / count.max(1) as f32;
    Mat4::from_translation(Vec3::new(radius * angle.cos(), 1.0, radius * angle.sin()))
        * vkray_core::rotate_y_degrees(spin_degrees)
}

/// Camera uniform: inverse view and inverse projection.
pub fn camera(width: u32, height: u32) -> [Mat4; 2] {
    let view = Mat4::look_at_rh(Vec3::new(0.0, 6.0, 12.0), Vec3::ZERO, Vec3::Y);
    let aspect = width as f32 / height.max(1) as f32;
    let projection = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 100.0);
    [view.inverse(), projection.inverse()]
}

/// Light uniform: direction and intensity.
pub fn light() -> Vec4 {
    Vec3::new(-0.4, -1.0, -0.3).normalize().extend(3.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuboid_indices_are_in_range() {
        let mesh = cuboid(Vec3::ONE);
        assert_eq!(mesh.positions.len(), 8);
        assert_eq!(mesh.indices.len(), 36);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.positions.len()));
        assert_eq!(mesh.vertex_bytes().len(), 8 * 12);
        assert_eq!(mesh.index_bytes().len(), 36 * 4);
    }

    #[test]
    fn orbit_places_boxes_on_a_circle() {
        for i in 0..4 {
            let position = orbit(i, 4, 5.0, 0.0).w_axis.truncate();
            let flat = Vec3::new(position.x, 0.0, position.z);
            assert!((flat.length() - 5.0).abs() < 1e-5);
        }
    }
}
