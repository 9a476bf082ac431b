//! The device interface consumed by the ray tracing core.
//!
//! Every builder receives a `&dyn RayTracingDevice` instead of reaching for
//! loader function pointers, so the whole core can run against a recording
//! mock in tests.

use crate::capabilities::RayTracingProperties;
use crate::error::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Parameters for a buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Debug name passed to the allocator.
    pub name: &'a str,
}

impl<'a> BufferDesc<'a> {
    pub fn new(
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &'a str,
    ) -> Self {
        Self {
            size,
            usage,
            location,
            name,
        }
    }
}

/// A buffer owned by the device.
///
/// This is a plain handle: the allocation stays with the device until
/// [`RayTracingDevice::destroy_buffer`] is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    /// Zero unless the buffer was created with `SHADER_DEVICE_ADDRESS`.
    pub device_address: vk::DeviceAddress,
    pub location: MemoryLocation,
}

impl DeviceBuffer {
    /// Descriptor info covering the whole buffer.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
    }
}

/// Driver calls needed to build acceleration structures, ray tracing
/// pipelines, shader binding tables and their descriptor sets.
///
/// Command recording methods take a command buffer that is in the recording
/// state. Methods that return a `Result` surface driver failures; recording
/// methods cannot fail.
pub trait RayTracingDevice {
    /// Driver constants for the shader binding table and scratch alignment.
    fn ray_tracing_properties(&self) -> RayTracingProperties;

    /// Whether `accelerationStructureHostCommands` is enabled.
    fn supports_host_build(&self) -> bool;

    // Buffers

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<DeviceBuffer>;

    /// Copy bytes into a host-visible buffer.
    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()>;

    fn destroy_buffer(&self, buffer: DeviceBuffer);

    // Acceleration structures

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: &DeviceBuffer,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR>;

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR);

    fn acceleration_structure_address(
        &self,
        accel: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress;

    fn acceleration_structure_build_sizes(
        &self,
        build_type: vk::AccelerationStructureBuildTypeKHR,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static>;

    fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    );

    /// Build on the host without a command buffer.
    fn build_acceleration_structures_on_host(
        &self,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) -> Result<()>;

    fn cmd_copy_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    );

    fn cmd_write_acceleration_structure_properties(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        query_type: vk::QueryType,
        pool: vk::QueryPool,
        first_query: u32,
    );

    // Queries

    fn create_query_pool(&self, ty: vk::QueryType, count: u32) -> Result<vk::QueryPool>;

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);

    /// Read 64-bit results, blocking until they are available.
    fn query_results(&self, pool: vk::QueryPool, first: u32, results: &mut [u64]) -> Result<()>;

    fn destroy_query_pool(&self, pool: vk::QueryPool);

    // Commands and submission

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn queue(&self, queue_family: u32) -> vk::Queue;

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn queue_submit(&self, queue: vk::Queue, cmd: vk::CommandBuffer, fence: vk::Fence) -> Result<()>;

    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer);

    fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    );

    // Fences

    fn create_fence(&self) -> Result<vk::Fence>;

    /// Wait with an infinite timeout.
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn destroy_fence(&self, fence: vk::Fence);

    // Shaders and pipelines

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;

    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Opaque handles of `group_count` groups, tightly packed in registration order.
    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>>;

    // Descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        binding_flags: &[vk::DescriptorBindingFlags],
    ) -> Result<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    // Dispatch

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );

    #[allow(clippy::too_many_arguments)]
    fn cmd_trace_rays(
        &self,
        cmd: vk::CommandBuffer,
        raygen: &vk::StridedDeviceAddressRegionKHR,
        miss: &vk::StridedDeviceAddressRegionKHR,
        hit: &vk::StridedDeviceAddressRegionKHR,
        callable: &vk::StridedDeviceAddressRegionKHR,
        width: u32,
        height: u32,
        depth: u32,
    );
}
