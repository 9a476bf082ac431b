//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Driver-reported ray tracing constants.
///
/// These drive the shader binding table layout and scratch buffer placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size in bytes of one shader group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of each handle inside a region.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of the start of each region.
    pub shader_group_base_alignment: u32,
    /// Maximum ray recursion depth a pipeline may request.
    pub max_ray_recursion_depth: u32,
    /// Required alignment of acceleration structure scratch addresses.
    pub min_scratch_offset_alignment: u32,
}

impl RayTracingProperties {
    /// Read the properties from the two extension property structs.
    pub fn from_vk(
        pipeline: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>,
        acceleration: &vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'_>,
    ) -> Self {
        Self {
            shader_group_handle_size: pipeline.shader_group_handle_size,
            shader_group_handle_alignment: pipeline.shader_group_handle_alignment,
            shader_group_base_alignment: pipeline.shader_group_base_alignment,
            max_ray_recursion_depth: pipeline.max_ray_recursion_depth,
            min_scratch_offset_alignment: acceleration
                .min_acceleration_structure_scratch_offset_alignment,
        }
    }
}

/// Ray tracing support reported by the physical device.
#[derive(Debug, Clone, Default)]
pub struct RayTracingCapabilities {
    /// `VK_KHR_acceleration_structure` present and `accelerationStructure` enabled.
    pub acceleration_structure: bool,
    /// `VK_KHR_ray_tracing_pipeline` present and `rayTracingPipeline` enabled.
    pub ray_tracing_pipeline: bool,
    /// `VK_KHR_deferred_host_operations` present (required by the AS extension).
    pub deferred_host_operations: bool,
    /// `accelerationStructureHostCommands` feature.
    pub host_commands: bool,
    /// Driver constants, if the pipeline extension is present.
    pub properties: Option<RayTracingProperties>,
}

impl RayTracingCapabilities {
    /// Whether hardware ray tracing can be used at all.
    ///
    /// Logs the missing piece so the caller can fall back to rasterization.
    pub fn is_supported(&self) -> bool {
        let missing = [
            (!self.acceleration_structure, "VK_KHR_acceleration_structure"),
            (!self.ray_tracing_pipeline, "VK_KHR_ray_tracing_pipeline"),
            (!self.deferred_host_operations, "VK_KHR_deferred_host_operations"),
        ];
        let mut supported = true;
        for (absent, name) in missing {
            if absent {
                tracing::warn!("Ray tracing unavailable: {} not supported", name);
                supported = false;
            }
        }
        supported && self.properties.is_some()
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Buffer device address support
    pub supports_buffer_device_address: bool,
    /// Descriptor indexing support (partially bound texture arrays)
    pub supports_descriptor_indexing: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Ray tracing extension support and constants
    pub ray_tracing: RayTracingCapabilities,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // Get basic properties
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        // Get available extensions
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 = supports_vulkan_1_3(api_version);

        let has_ext = |name: &CStr| {
            name.to_str()
                .map(|n| available_extensions.contains(n))
                .unwrap_or(false)
        };
        let has_as_ext = has_ext(ash::khr::acceleration_structure::NAME);
        let has_rt_ext = has_ext(ash::khr::ray_tracing_pipeline::NAME);
        let has_deferred_ext = has_ext(ash::khr::deferred_host_operations::NAME);

        // Extension features
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut as_features)
            .push_next(&mut rt_features);
        instance.get_physical_device_features2(physical_device, &mut features2);

        // Extension properties
        let properties_rt = if has_rt_ext && has_as_ext {
            let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut rt_props)
                .push_next(&mut as_props);
            instance.get_physical_device_properties2(physical_device, &mut properties2);
            Some(RayTracingProperties::from_vk(&rt_props, &as_props))
        } else {
            None
        };

        let ray_tracing = RayTracingCapabilities {
            acceleration_structure: has_as_ext && as_features.acceleration_structure == vk::TRUE,
            ray_tracing_pipeline: has_rt_ext && rt_features.ray_tracing_pipeline == vk::TRUE,
            deferred_host_operations: has_deferred_ext,
            host_commands: has_as_ext
                && as_features.acceleration_structure_host_commands == vk::TRUE,
            properties: properties_rt,
        };

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_synchronization2: has_vulkan_1_3,
            supports_buffer_device_address: has_vulkan_1_3
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_descriptor_indexing: has_vulkan_1_3
                || available_extensions.contains("VK_EXT_descriptor_indexing"),

            device_local_memory_mb,
            ray_tracing,
            available_extensions,
        }
    }

    /// Check if the GPU meets the minimum requirements of the ray tracing core.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        // Instances reference bottom structures by device address
        if !self.supports_buffer_device_address {
            return false;
        }

        self.ray_tracing.is_supported()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.ray_tracing.properties.is_some() {
                "yes"
            } else {
                "no"
            },
        )
    }
}

/// Whether a packed `apiVersion` is Vulkan 1.3 or newer.
fn supports_vulkan_1_3(api_version: u32) -> bool {
    (
        vk::api_version_major(api_version),
        vk::api_version_minor(api_version),
    ) >= (1, 3)
}
