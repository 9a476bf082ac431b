//! Hardware ray tracing on top of `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline`.
//!
//! This crate provides:
//! - Bottom-level structures per triangle mesh, with optional compaction
//! - A top-level structure over per-mesh instances, rebuilt once and refit afterwards
//! - Ray tracing pipelines and their shader binding tables
//! - The descriptor set the ray tracing shaders read
//! - [`RayTracer`], which drives all of the above for one scene
//!
//! Everything talks to the GPU through a borrowed
//! [`RayTracingDevice`](vkray_gpu::RayTracingDevice), and every build is a
//! synchronous one-shot submission.
//!
//! # Example
//!
//! ```ignore
//! use vkray_accel::{MeshGeometry, RayTracer, RayTracerConfig};
//!
//! let mut tracer = RayTracer::new(&device, queue_family)?;
//! tracer.add_mesh(MeshGeometry::new(vbo, vertex_count, 32, ibo, index_count, ubo));
//! tracer.build_acceleration_structures(true, false)?;
//! tracer.set_render_target(target_view);
//! tracer.create_descriptor_set(&camera, &light)?;
//! tracer.create_pipeline(&RayTracerConfig::default())?;
//!
//! tracer.bind_descriptor_set(cmd)?;
//! tracer.trace_rays(cmd, extent)?;
//! ```

pub mod blas;
pub mod config;
pub mod descriptor_set;
pub mod geometry;
pub mod pipeline;
pub mod sbt;
pub mod structure;
pub mod tlas;
pub mod tracer;

pub use blas::{BlasBuilder, BottomStructure, BLAS_BUILD_FLAGS};
pub use config::{HitGroupConfig, RayTracerConfig};
pub use descriptor_set::{Bindings, RayDescriptorSet, StagedWrite};
pub use geometry::{MeshGeometry, MeshIndex};
pub use pipeline::{RayPipeline, RayPipelineBuilder, ShaderSource};
pub use sbt::{
    GroupCounts, SbtBuilder, SbtLayout, SbtRegionLayout, SbtStage, ShaderBindingTable,
    ShaderGroupKind,
};
pub use structure::{AccelerationStructure, QueryPoolGuard};
pub use tlas::{BuildMode, Instance, InstanceRecord, TlasBuilder, TopStructure, TLAS_BUILD_FLAGS};
pub use tracer::{RayTracer, Texture};
