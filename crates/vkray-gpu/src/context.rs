//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use crate::vulkan::VulkanDevice;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Arc<Mutex<GpuAllocator>>,
    pub(crate) ray_tracing_enabled: bool,

    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The queue family used for all submissions (graphics + compute).
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get the queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Whether the ray tracing extensions were enabled on the device.
    pub fn ray_tracing_enabled(&self) -> bool {
        self.ray_tracing_enabled
    }

    /// Create the device interface used by the ray tracing core.
    ///
    /// The returned device must be dropped before this context.
    pub fn ray_tracing_device(&self) -> Result<VulkanDevice> {
        if !self.ray_tracing_enabled {
            return Err(GpuError::ExtensionNotSupported(
                ash::khr::ray_tracing_pipeline::NAME
                    .to_string_lossy()
                    .into_owned(),
            ));
        }
        let properties = self.capabilities.ray_tracing.properties.ok_or_else(|| {
            GpuError::ExtensionNotSupported("ray tracing properties".to_string())
        })?;

        Ok(VulkanDevice::new(
            &self.instance,
            self.device.clone(),
            self.allocator.clone(),
            properties,
            self.capabilities.ray_tracing.host_commands,
        ))
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    require_ray_tracing: bool,
    extra_instance_extensions: Vec<CString>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "vkray".to_string(),
            enable_validation: cfg!(debug_assertions),
            require_ray_tracing: false,
            extra_instance_extensions: Vec::new(),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Fail with [`GpuError::NoSuitableDevice`] instead of creating a device
    /// without ray tracing.
    pub fn require_ray_tracing(mut self, require: bool) -> Self {
        self.require_ray_tracing = require;
        self
    }

    /// Enable an additional instance extension.
    pub fn instance_extension(mut self, name: &CStr) -> Self {
        self.extra_instance_extensions.push(name.to_owned());
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                &self.extra_instance_extensions,
            )
        }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        let ray_tracing_enabled = capabilities.meets_requirements();
        if !ray_tracing_enabled {
            if self.require_ray_tracing {
                return Err(GpuError::NoSuitableDevice);
            }
            tracing::warn!("Hardware ray tracing unavailable on {}", capabilities.device_name);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_family = unsafe { find_queue_family(&instance, physical_device) }?;

        let (device, queue) = unsafe {
            create_device(
                &instance,
                physical_device,
                queue_family,
                ray_tracing_enabled,
                capabilities.ray_tracing.host_commands,
            )?
        };

        let device = Arc::new(device);
        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Arc::new(Mutex::new(allocator)),
            ray_tracing_enabled,
            queue_family,
            queue,
        })
    }
}

/// Find a queue family with graphics and compute support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Device extensions for ray tracing.
fn ray_tracing_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::deferred_host_operations::NAME,
    ]
}

/// Create the logical device and retrieve its queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    ray_tracing: bool,
    host_commands: bool,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority));

    let extensions = if ray_tracing {
        ray_tracing_device_extensions()
    } else {
        Vec::new()
    };
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    // Partially bound texture arrays and device addresses
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true);

    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        .acceleration_structure(true)
        .acceleration_structure_host_commands(host_commands);
    let mut rt_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let features = vk::PhysicalDeviceFeatures::default().shader_int64(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);
    if ray_tracing {
        features2 = features2
            .push_next(&mut as_features)
            .push_next(&mut rt_features);
    }

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance.create_device(physical_device, &device_create_info, None)?;
    let queue = device.get_device_queue(queue_family, 0);

    Ok((device, queue))
}
