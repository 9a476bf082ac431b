//! Core math helpers for the vkray ray tracing core.
//!
//! This crate provides the foundational helpers shared by the GPU layer and
//! the acceleration-structure builders:
//! - Power-of-two alignment helpers used by the shader binding table layout
//! - Conversion from column-major `glam` matrices to the row-major 3x4
//!   transforms consumed by ray tracing instances

pub mod math;

pub use math::{align_up, align_up_u64, rotate_y_degrees, Transform3x4};

/// Crate-wide constants.
pub mod constants {
    /// Size in bytes of one index in a ray-traced mesh (32-bit indices only).
    pub const INDEX_STRIDE: u32 = 4;
    /// Size in bytes of the position attribute at the start of each vertex (3 x f32).
    pub const POSITION_SIZE: u32 = 12;
    /// Instance mask used for visible instances.
    pub const MASK_VISIBLE: u8 = 0xFF;
    /// Instance mask used for culled instances.
    pub const MASK_HIDDEN: u8 = 0x00;
}
