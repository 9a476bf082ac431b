//! Vulkan abstraction layer for the vkray ray tracing core.
//!
//! This crate provides:
//! - The [`RayTracingDevice`] interface every builder is handed
//! - Its ash-backed implementation, [`VulkanDevice`]
//! - Vulkan instance and device management with ray tracing extensions
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - One-shot command submission

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod sync;
pub mod vulkan;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities, RayTracingProperties};
pub use command::{OneShotCommands, ScopedCommands};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{BindingDecl, DescriptorSetLayoutBuilder};
pub use device::{BufferDesc, DeviceBuffer, RayTracingDevice};
pub use error::{check, check_call, GpuError, ResultSeverity, Result};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use vulkan::VulkanDevice;

// Re-exported so dependents name the same versions.
pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
