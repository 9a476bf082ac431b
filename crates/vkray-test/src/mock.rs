//! Recording implementation of [`RayTracingDevice`].
//!
//! Handles come from a counter, device addresses from a bump allocator, and
//! every buffer keeps a host copy of its bytes so tests can decode what the
//! core uploaded. Build sizes, compacted sizes and shader group handles are
//! deterministic functions of their inputs.

use parking_lot::Mutex;
use std::collections::HashMap;
use vkray_gpu::vk::{self, Handle};
use vkray_gpu::{
    BufferDesc, DeviceBuffer, GpuError, MemoryLocation, RayTracingDevice, RayTracingProperties,
    Result,
};

/// Base of the fake device address space.
pub const ADDRESS_BASE: u64 = 0x1_0000_0000;
/// Alignment of fake device addresses.
pub const ADDRESS_ALIGNMENT: u64 = 256;

/// Acceleration structure size reported for `primitives` primitives.
pub const fn structure_size(primitives: u64) -> u64 {
    256 + primitives * 64
}

/// Build scratch size reported for `primitives` primitives.
pub const fn build_scratch_size(primitives: u64) -> u64 {
    128 + primitives * 32
}

/// Update scratch size reported for `primitives` primitives.
pub const fn update_scratch_size(primitives: u64) -> u64 {
    64 + primitives * 16
}

/// Compacted size reported for a structure of `size` bytes.
pub const fn compacted_size(size: u64) -> u64 {
    (size * 3 / 5 + 7) & !7
}

/// Byte each handle of shader group `group` is filled with.
pub const fn handle_byte(group: u32) -> u8 {
    (group as u8).wrapping_add(1)
}

/// Geometry details captured from a build call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBuild {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub primitive_count: u32,
    pub geometry_type: vk::GeometryTypeKHR,
    pub vertex_format: vk::Format,
    pub vertex_stride: u64,
    pub index_type: vk::IndexType,
    pub max_vertex: u32,
    /// Device address of the scratch memory. Zero for host builds.
    pub scratch_address: u64,
    /// Structure references read from the instance data.
    pub instance_references: Vec<u64>,
    /// `None` for host builds.
    pub cmd: Option<vk::CommandBuffer>,
}

/// One descriptor write as seen by `update_descriptor_sets`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedWrite {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
}

/// Every call the core made that is interesting to assert on.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    BuildSizes {
        build_type: vk::AccelerationStructureBuildTypeKHR,
        mode: vk::BuildAccelerationStructureModeKHR,
        primitives: u32,
    },
    Build(RecordedBuild),
    Copy {
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    },
    ResetQueryPool {
        pool: vk::QueryPool,
    },
    WriteProperties {
        structure: vk::AccelerationStructureKHR,
        pool: vk::QueryPool,
    },
    Barrier {
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    },
    Submit {
        cmd: vk::CommandBuffer,
    },
    WaitFence,
    CreatePipeline {
        stages: Vec<vk::ShaderStageFlags>,
        groups: Vec<vk::RayTracingShaderGroupTypeKHR>,
        max_recursion_depth: u32,
    },
    UpdateDescriptorSets(Vec<RecordedWrite>),
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        sets: Vec<vk::DescriptorSet>,
    },
    TraceRays {
        /// `(device_address, stride, size)` of the raygen, miss, hit and callable regions.
        regions: [(u64, u64, u64); 4],
        extent: (u32, u32, u32),
    },
}

struct MockBuffer {
    data: Vec<u8>,
    address: u64,
    location: MemoryLocation,
}

struct MockStructure {
    size: u64,
    address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    next_address: u64,
    buffers: HashMap<vk::Buffer, MockBuffer>,
    structures: HashMap<vk::AccelerationStructureKHR, MockStructure>,
    query_pools: HashMap<vk::QueryPool, Vec<u64>>,
    command_buffers: HashMap<vk::CommandBuffer, RecordingState>,
    command_pools: usize,
    fences: HashMap<vk::Fence, bool>,
    shader_modules: usize,
    pipeline_layouts: usize,
    pipelines: HashMap<vk::Pipeline, u32>,
    set_layouts: usize,
    descriptor_pools: usize,
    calls: Vec<Call>,
    fail_pipeline_creation: bool,
    fail_next_submit: bool,
}

impl MockState {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn address(&mut self, size: u64) -> u64 {
        let address = ADDRESS_BASE + self.next_address;
        self.next_address += size.div_ceil(ADDRESS_ALIGNMENT).max(1) * ADDRESS_ALIGNMENT;
        address
    }

    fn assert_recording(&self, cmd: vk::CommandBuffer) {
        assert_eq!(
            self.command_buffers.get(&cmd),
            Some(&RecordingState::Recording),
            "command recorded into a buffer that is not recording"
        );
    }

    /// Find the buffer containing a device address.
    fn read_at_address(&self, address: u64, len: usize) -> Option<&[u8]> {
        self.buffers.values().find_map(|b| {
            let start = address.checked_sub(b.address)? as usize;
            b.data.get(start..start + len)
        })
    }
}

/// A [`RayTracingDevice`] that never touches a GPU.
pub struct MockDevice {
    properties: RayTracingProperties,
    host_build: bool,
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Default properties: 32-byte handles, 32-byte handle alignment,
    /// 64-byte base alignment.
    pub fn new() -> Self {
        Self {
            properties: RayTracingProperties {
                shader_group_handle_size: 32,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
                max_ray_recursion_depth: 31,
                min_scratch_offset_alignment: 128,
            },
            host_build: false,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Replace the reported driver constants.
    pub fn with_properties(mut self, properties: RayTracingProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Report `accelerationStructureHostCommands` support.
    pub fn with_host_build(mut self, supported: bool) -> Self {
        self.host_build = supported;
        self
    }

    /// Make the next ray tracing pipeline creation fail.
    pub fn fail_pipeline_creation(&self) {
        self.state.lock().fail_pipeline_creation = true;
    }

    /// Make the next queue submission fail with `ERROR_DEVICE_LOST`.
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    /// Snapshot of the recorded calls.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Recorded build calls, in order.
    pub fn builds(&self) -> Vec<RecordedBuild> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Build(build) => Some(build),
                _ => None,
            })
            .collect()
    }

    /// Number of queue submissions.
    pub fn submit_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Submit { .. }))
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Host copy of a buffer's contents.
    pub fn buffer_data(&self, buffer: &DeviceBuffer) -> Vec<u8> {
        self.state
            .lock()
            .buffers
            .get(&buffer.buffer)
            .map(|b| b.data.clone())
            .unwrap_or_default()
    }

    /// Backing size of a live acceleration structure.
    pub fn structure_size(&self, accel: vk::AccelerationStructureKHR) -> Option<u64> {
        self.state.lock().structures.get(&accel).map(|s| s.size)
    }

    /// Whether an acceleration structure is still alive.
    pub fn structure_alive(&self, accel: vk::AccelerationStructureKHR) -> bool {
        self.state.lock().structures.contains_key(&accel)
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_structures(&self) -> usize {
        self.state.lock().structures.len()
    }

    pub fn live_query_pools(&self) -> usize {
        self.state.lock().query_pools.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_shader_modules(&self) -> usize {
        self.state.lock().shader_modules
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    /// Pipelines, layouts, set layouts, pools, fences and command pools
    /// that have not been destroyed.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.buffers.len()
            + state.structures.len()
            + state.query_pools.len()
            + state.command_buffers.len()
            + state.command_pools
            + state.fences.len()
            + state.shader_modules
            + state.pipeline_layouts
            + state.pipelines.len()
            + state.set_layouts
            + state.descriptor_pools
    }
}

impl RayTracingDevice for MockDevice {
    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.properties
    }

    fn supports_host_build(&self) -> bool {
        self.host_build
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<DeviceBuffer> {
        let mut state = self.state.lock();
        let buffer: vk::Buffer = state.handle();
        let address = state.address(desc.size);
        state.buffers.insert(
            buffer,
            MockBuffer {
                data: vec![0; desc.size as usize],
                address,
                location: desc.location,
            },
        );
        let device_address = if desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        {
            address
        } else {
            0
        };
        Ok(DeviceBuffer {
            buffer,
            size: desc.size,
            device_address,
            location: desc.location,
        })
    }

    fn write_buffer(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let owned = state
            .buffers
            .get_mut(&buffer.buffer)
            .ok_or_else(|| GpuError::InvalidState("Unknown buffer".to_string()))?;
        if owned.location == MemoryLocation::GpuOnly {
            return Err(GpuError::InvalidState("Buffer not mapped".to_string()));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > owned.data.len() {
            return Err(GpuError::InvalidState(format!(
                "Write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                owned.data.len()
            )));
        }
        owned.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: DeviceBuffer) {
        let removed = self.state.lock().buffers.remove(&buffer.buffer);
        assert!(removed.is_some(), "double free of buffer {:?}", buffer.buffer);
    }

    fn create_acceleration_structure(
        &self,
        _ty: vk::AccelerationStructureTypeKHR,
        buffer: &DeviceBuffer,
        size: u64,
    ) -> Result<vk::AccelerationStructureKHR> {
        let mut state = self.state.lock();
        let backing = state
            .buffers
            .get(&buffer.buffer)
            .ok_or_else(|| GpuError::InvalidState("Unknown backing buffer".to_string()))?;
        assert!(
            backing.data.len() as u64 >= size,
            "backing buffer smaller than the structure"
        );
        let address = backing.address;
        let accel: vk::AccelerationStructureKHR = state.handle();
        state
            .structures
            .insert(accel, MockStructure { size, address });
        Ok(accel)
    }

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        let removed = self.state.lock().structures.remove(&accel);
        assert!(removed.is_some(), "double free of structure {accel:?}");
    }

    fn acceleration_structure_address(
        &self,
        accel: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        self.state
            .lock()
            .structures
            .get(&accel)
            .map_or(0, |s| s.address)
    }

    fn acceleration_structure_build_sizes(
        &self,
        build_type: vk::AccelerationStructureBuildTypeKHR,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let primitives: u32 = max_primitive_counts.iter().sum();
        self.state.lock().calls.push(Call::BuildSizes {
            build_type,
            mode: info.mode,
            primitives,
        });
        let p = u64::from(primitives);
        vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(structure_size(p))
            .build_scratch_size(build_scratch_size(p))
            .update_scratch_size(update_scratch_size(p))
    }

    fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        for (info, range) in infos.iter().zip(ranges) {
            let build = record_build(&state, info, range, Some(cmd));
            state.calls.push(Call::Build(build));
        }
    }

    fn build_acceleration_structures_on_host(
        &self,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) -> Result<()> {
        if !self.host_build {
            return Err(GpuError::ExtensionNotSupported(
                "accelerationStructureHostCommands".to_string(),
            ));
        }
        let mut state = self.state.lock();
        for (info, range) in infos.iter().zip(ranges) {
            let build = record_build(&state, info, range, None);
            state.calls.push(Call::Build(build));
        }
        Ok(())
    }

    fn cmd_copy_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    ) {
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        assert!(state.structures.contains_key(&info.src), "copy from dead structure");
        assert!(state.structures.contains_key(&info.dst), "copy into dead structure");
        state.calls.push(Call::Copy {
            src: info.src,
            dst: info.dst,
            mode: info.mode,
        });
    }

    fn cmd_write_acceleration_structure_properties(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        query_type: vk::QueryType,
        pool: vk::QueryPool,
        first_query: u32,
    ) {
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        assert_eq!(
            query_type,
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR
        );
        let sizes: Vec<u64> = structures
            .iter()
            .map(|s| state.structures.get(s).map_or(0, |s| compacted_size(s.size)))
            .collect();
        let results = state
            .query_pools
            .get_mut(&pool)
            .expect("query pool must exist");
        for (i, size) in sizes.into_iter().enumerate() {
            results[first_query as usize + i] = size;
        }
        for structure in structures {
            state.calls.push(Call::WriteProperties {
                structure: *structure,
                pool,
            });
        }
    }

    fn create_query_pool(&self, _ty: vk::QueryType, count: u32) -> Result<vk::QueryPool> {
        let mut state = self.state.lock();
        let pool: vk::QueryPool = state.handle();
        state.query_pools.insert(pool, vec![0; count as usize]);
        Ok(pool)
    }

    fn cmd_reset_query_pool(
        &self,
        cmd: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        if let Some(results) = state.query_pools.get_mut(&pool) {
            for r in &mut results[first as usize..(first + count) as usize] {
                *r = 0;
            }
        }
        state.calls.push(Call::ResetQueryPool { pool });
    }

    fn query_results(&self, pool: vk::QueryPool, first: u32, results: &mut [u64]) -> Result<()> {
        let state = self.state.lock();
        let stored = state
            .query_pools
            .get(&pool)
            .ok_or_else(|| GpuError::InvalidState("Unknown query pool".to_string()))?;
        let start = first as usize;
        results.copy_from_slice(&stored[start..start + results.len()]);
        Ok(())
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        let removed = self.state.lock().query_pools.remove(&pool);
        assert!(removed.is_some(), "double free of query pool");
    }

    fn create_command_pool(&self, _queue_family: u32) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        state.command_pools += 1;
        Ok(state.handle())
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.state.lock().command_pools -= 1;
    }

    fn queue(&self, queue_family: u32) -> vk::Queue {
        vk::Queue::from_raw(0xC0DE_0000 + u64::from(queue_family))
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let cmd: vk::CommandBuffer = state.handle();
        state.command_buffers.insert(cmd, RecordingState::Initial);
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.state
            .lock()
            .command_buffers
            .insert(cmd, RecordingState::Recording);
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        state
            .command_buffers
            .insert(cmd, RecordingState::Executable);
        Ok(())
    }

    fn queue_submit(&self, _queue: vk::Queue, cmd: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        if state.command_buffers.get(&cmd) != Some(&RecordingState::Executable) {
            return Err(GpuError::InvalidState(
                "Submitted a command buffer that is not executable".to_string(),
            ));
        }
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = true;
        }
        state.calls.push(Call::Submit { cmd });
        Ok(())
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        self.state.lock().command_buffers.remove(&cmd);
    }

    fn cmd_memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
    ) {
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        state.calls.push(Call::Barrier { src, dst });
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence: vk::Fence = state.handle();
        state.fences.insert(fence, false);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence) {
            Some(true) => {
                state.calls.push(Call::WaitFence);
                Ok(())
            }
            // Nothing will ever signal it: the real device would hang here.
            _ => Err(GpuError::Vulkan(vk::Result::TIMEOUT)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        if let Some(signaled) = self.state.lock().fences.get_mut(&fence) {
            *signaled = false;
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.first() != Some(&0x0723_0203) {
            return Err(GpuError::ShaderLoad("Missing SPIR-V magic".to_string()));
        }
        let mut state = self.state.lock();
        state.shader_modules += 1;
        Ok(state.handle())
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.state.lock().shader_modules -= 1;
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let mut state = self.state.lock();
        state.pipeline_layouts += 1;
        Ok(state.handle())
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.state.lock().pipeline_layouts -= 1;
    }

    fn create_ray_tracing_pipeline(
        &self,
        info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_pipeline_creation) {
            return Err(GpuError::PipelineCreation(
                "Ray tracing pipeline: ERROR_OUT_OF_DEVICE_MEMORY".to_string(),
            ));
        }
        // SAFETY: the pointers in `info` are valid for the duration of the call.
        let (stages, groups) = unsafe {
            (
                slice_or_empty(info.p_stages, info.stage_count),
                slice_or_empty(info.p_groups, info.group_count),
            )
        };
        state.calls.push(Call::CreatePipeline {
            stages: stages.iter().map(|s| s.stage).collect(),
            groups: groups.iter().map(|g| g.ty).collect(),
            max_recursion_depth: info.max_pipeline_ray_recursion_depth,
        });
        let pipeline: vk::Pipeline = state.handle();
        state.pipelines.insert(pipeline, info.group_count);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let removed = self.state.lock().pipelines.remove(&pipeline);
        assert!(removed.is_some(), "double free of pipeline");
    }

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let total = *state
            .pipelines
            .get(&pipeline)
            .ok_or_else(|| GpuError::InvalidState("Unknown pipeline".to_string()))?;
        if first_group + group_count > total {
            return Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN));
        }
        let size = self.properties.shader_group_handle_size as usize;
        Ok((first_group..first_group + group_count)
            .flat_map(|group| std::iter::repeat(handle_byte(group)).take(size))
            .collect())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        binding_flags: &[vk::DescriptorBindingFlags],
    ) -> Result<vk::DescriptorSetLayout> {
        assert_eq!(bindings.len(), binding_flags.len(), "one flag per binding");
        let mut state = self.state.lock();
        state.set_layouts += 1;
        Ok(state.handle())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state.lock().set_layouts -= 1;
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let mut state = self.state.lock();
        state.descriptor_pools += 1;
        Ok(state.handle())
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {
        self.state.lock().descriptor_pools -= 1;
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        Ok(self.state.lock().handle())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let recorded = writes
            .iter()
            .map(|w| RecordedWrite {
                binding: w.dst_binding,
                descriptor_type: w.descriptor_type,
                count: w.descriptor_count,
            })
            .collect();
        self.state
            .lock()
            .calls
            .push(Call::UpdateDescriptorSets(recorded));
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        state.calls.push(Call::BindPipeline {
            bind_point,
            pipeline,
        });
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        state.calls.push(Call::BindDescriptorSets {
            sets: sets.to_vec(),
        });
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
        let mut state = self.state.lock();
        state.assert_recording(cmd);
        let region = |r: &vk::StridedDeviceAddressRegionKHR| (r.device_address, r.stride, r.size);
        state.calls.push(Call::TraceRays {
            regions: [region(raygen), region(miss), region(hit), region(callable)],
            extent: (width, height, depth),
        });
    }
}

unsafe fn slice_or_empty<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len as usize)
    }
}

fn record_build(
    state: &MockState,
    info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
    ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    cmd: Option<vk::CommandBuffer>,
) -> RecordedBuild {
    assert!(
        state.structures.contains_key(&info.dst_acceleration_structure),
        "build into a structure that does not exist"
    );
    let primitive_count = ranges.iter().map(|r| r.primitive_count).sum();

    let mut build = RecordedBuild {
        ty: info.ty,
        mode: info.mode,
        flags: info.flags,
        src: info.src_acceleration_structure,
        dst: info.dst_acceleration_structure,
        primitive_count,
        geometry_type: vk::GeometryTypeKHR::default(),
        vertex_format: vk::Format::UNDEFINED,
        vertex_stride: 0,
        index_type: vk::IndexType::default(),
        max_vertex: 0,
        // SAFETY: device builds always fill the device address member.
        scratch_address: if cmd.is_some() {
            unsafe { info.scratch_data.device_address }
        } else {
            0
        },
        instance_references: Vec::new(),
        cmd,
    };

    // SAFETY: the geometry pointer is valid for the duration of the call.
    let geometries = unsafe { slice_or_empty(info.p_geometries, info.geometry_count) };
    let Some(geometry) = geometries.first() else {
        return build;
    };
    build.geometry_type = geometry.geometry_type;

    if geometry.geometry_type == vk::GeometryTypeKHR::TRIANGLES {
        // SAFETY: the union member matches `geometry_type`.
        let triangles = unsafe { geometry.geometry.triangles };
        build.vertex_format = triangles.vertex_format;
        build.vertex_stride = triangles.vertex_stride;
        build.index_type = triangles.index_type;
        build.max_vertex = triangles.max_vertex;
    } else if geometry.geometry_type == vk::GeometryTypeKHR::INSTANCES {
        // SAFETY: the union member matches `geometry_type`.
        let instances = unsafe { geometry.geometry.instances };
        let count = primitive_count as usize;
        let stride = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();
        let raw: Vec<vk::AccelerationStructureInstanceKHR> = if cmd.is_some() {
            // SAFETY: device builds fill the device address member.
            let address = unsafe { instances.data.device_address };
            state
                .read_at_address(address, count * stride)
                .map(|bytes| {
                    bytes
                        .chunks_exact(stride)
                        // SAFETY: the chunk holds exactly one instance record.
                        .map(|chunk| unsafe {
                            std::ptr::read_unaligned(
                                chunk.as_ptr().cast::<vk::AccelerationStructureInstanceKHR>(),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default()
        } else {
            // SAFETY: host builds fill the host address member with a live pointer.
            unsafe {
                let ptr = instances
                    .data
                    .host_address
                    .cast::<vk::AccelerationStructureInstanceKHR>();
                (0..count).map(|i| std::ptr::read_unaligned(ptr.add(i))).collect()
            }
        };
        build.instance_references = raw
            .iter()
            // SAFETY: both union members are a plain 64-bit value.
            .map(|inst| unsafe { inst.acceleration_structure_reference.device_handle })
            .collect();
    }

    build
}
