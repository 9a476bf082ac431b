//! ash-backed implementation of [`RayTracingDevice`].

use crate::capabilities::RayTracingProperties;
use crate::device::{BufferDesc, DeviceBuffer, RayTracingDevice};
use crate::error::{check_call, GpuError, Result};
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use crate::sync;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// The real device: extension loaders, the shared allocator and the
/// allocations behind every [`DeviceBuffer`] it handed out.
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    accel: ash::khr::acceleration_structure::Device,
    pipelines: ash::khr::ray_tracing_pipeline::Device,
    allocator: Arc<Mutex<GpuAllocator>>,
    buffers: Mutex<HashMap<vk::Buffer, GpuBuffer>>,
    properties: RayTracingProperties,
    host_commands: bool,
}

impl VulkanDevice {
    /// Load the ray tracing extension entry points.
    pub fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<GpuAllocator>>,
        properties: RayTracingProperties,
        host_commands: bool,
    ) -> Self {
        let accel = ash::khr::acceleration_structure::Device::new(instance, &device);
        let pipelines = ash::khr::ray_tracing_pipeline::Device::new(instance, &device);
        Self {
            device,
            accel,
            pipelines,
            allocator,
            buffers: Mutex::new(HashMap::new()),
            properties,
            host_commands,
        }
    }

    /// Get the Vulkan device handle.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// Allocate a 2D image usable as a storage target or sampled texture.
    pub fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<GpuImage> {
        self.allocator
            .lock()
            .create_image(extent, format, usage, name)
    }

    /// Free an image created by [`Self::create_image`].
    pub fn destroy_image(&self, image: &mut GpuImage) -> Result<()> {
        self.allocator.lock().free_image(image)
    }

    /// Record a layout transition for a whole color image.
    pub fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .image(image)
            .subresource_range(crate::memory::COLOR_RANGE);
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    /// Create a linear-filtering sampler.
    pub fn create_sampler(&self) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT);
        Ok(unsafe { self.device.create_sampler(&info, None)? })
    }

    /// Destroy a sampler.
    pub fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let leaked: Vec<GpuBuffer> = self.buffers.lock().drain().map(|(_, b)| b).collect();
        if !leaked.is_empty() {
            tracing::warn!("{} buffers still alive when the device was dropped", leaked.len());
        }
        let mut allocator = self.allocator.lock();
        for mut buffer in leaked {
            if let Err(e) = allocator.free_buffer(&mut buffer) {
                tracing::error!("Failed to free buffer: {e}");
            }
        }
    }
}

impl RayTracingDevice for VulkanDevice {
    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.properties
    }

    fn supports_host_build(&self) -> bool {
        self.host_commands
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<DeviceBuffer> {
        let buffer = self.allocator.lock().create_buffer(desc)?;
        let handle = buffer.handle();
        self.buffers.lock().insert(handle.buffer, buffer);
        Ok(handle)
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let buffers = self.buffers.lock();
        let owned = buffers
            .get(&buffer.buffer)
            .ok_or_else(|| GpuError::InvalidState("Unknown buffer".to_string()))?;
        owned.write_bytes(offset, data)
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        let Some(mut owned) = self.buffers.lock().remove(&buffer.buffer) else {
            tracing::warn!("destroy_buffer called on an unknown buffer");
            return;
        };
        if let Err(e) = self.allocator.lock().free_buffer(&mut owned) {
            tracing::error!("Failed to free buffer: {e}");
        }
    }

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: &DeviceBuffer,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(size)
            .ty(ty);
        Ok(unsafe { self.accel.create_acceleration_structure(&create_info, None)? })
    }

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        unsafe { self.accel.destroy_acceleration_structure(accel, None) };
    }

    fn acceleration_structure_address(
        &self,
        accel: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel);
        unsafe { self.accel.get_acceleration_structure_device_address(&info) }
    }

    fn acceleration_structure_build_sizes(
        &self,
        build_type: vk::AccelerationStructureBuildTypeKHR,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.accel.get_acceleration_structure_build_sizes(
                build_type,
                info,
                max_primitive_counts,
                &mut sizes,
            );
        }
        sizes
    }

    fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        unsafe { self.accel.cmd_build_acceleration_structures(cmd, infos, ranges) };
    }

    fn build_acceleration_structures_on_host(
        &self,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) -> Result<()> {
        check_call(
            unsafe {
                self.accel.build_acceleration_structures(
                    vk::DeferredOperationKHR::null(),
                    infos,
                    ranges,
                )
            },
            "vkBuildAccelerationStructuresKHR",
        )
    }

    fn cmd_copy_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    ) {
        unsafe { self.accel.cmd_copy_acceleration_structure(cmd, info) };
    }

    fn cmd_write_acceleration_structure_properties(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        query_type: vk::QueryType,
        pool: vk::QueryPool,
        first_query: u32,
    ) {
        unsafe {
            self.accel.cmd_write_acceleration_structures_properties(
                cmd,
                structures,
                query_type,
                pool,
                first_query,
            );
        }
    }

    fn create_query_pool(&self, ty: vk::QueryType, count: u32) -> Result<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(ty)
            .query_count(count);
        Ok(unsafe { self.device.create_query_pool(&info, None)? })
    }

    fn cmd_reset_query_pool(
        &self,
        cmd: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        unsafe { self.device.cmd_reset_query_pool(cmd, pool, first, count) };
    }

    fn query_results(&self, pool: vk::QueryPool, first: u32, results: &mut [u64]) -> Result<()> {
        check_call(
            unsafe {
                self.device.get_query_pool_results(
                    pool,
                    first,
                    results,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
            },
            "vkGetQueryPoolResults",
        )
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    fn create_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn queue(&self, queue_family: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(queue_family, 0) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("Driver returned no command buffer".to_string()))
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info)? };
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, cmd: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        check_call(
            unsafe { self.device.queue_submit(queue, &[submit_info], fence) },
            "vkQueueSubmit",
        )
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[cmd]) };
    }

    fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    ) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src.0)
            .src_access_mask(src.1)
            .dst_stage_mask(dst.0)
            .dst_access_mask(dst.1);
        let dependency_info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        unsafe { sync::create_fence(&self.device) }
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { sync::wait_for_fence(&self.device, fence) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { sync::reset_fence(&self.device, fence) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { sync::destroy_fence(&self.device, fence) };
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| GpuError::ShaderLoad(format!("Failed to create shader module: {e}")))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        Ok(unsafe { self.device.create_pipeline_layout(&info, None)? })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline> {
        let pipelines = unsafe {
            self.pipelines.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            )
        }
        .map_err(|(_, e)| GpuError::PipelineCreation(format!("Ray tracing pipeline: {e:?}")))?;

        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("Driver returned no pipeline".to_string()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>> {
        let data_size = (self.properties.shader_group_handle_size * group_count) as usize;
        Ok(unsafe {
            self.pipelines.get_ray_tracing_shader_group_handles(
                pipeline,
                first_group,
                group_count,
                data_size,
            )?
        })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        binding_flags: &[vk::DescriptorBindingFlags],
    ) -> Result<vk::DescriptorSetLayout> {
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(binding_flags);
        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(bindings)
            .push_next(&mut flags_info);
        Ok(unsafe { self.device.create_descriptor_set_layout(&info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("Driver returned no descriptor set".to_string()))
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        unsafe { self.device.update_descriptor_sets(writes, &[]) };
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cmd, bind_point, layout, first_set, sets, &[]);
        }
    }

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
    ) {
        unsafe {
            self.pipelines
                .cmd_trace_rays(cmd, raygen, miss, hit, callable, width, height, depth);
        }
    }
}
