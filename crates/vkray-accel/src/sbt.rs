//! Shader binding table layout and packing.
//!
//! Shader groups are registered in a fixed order: one ray generation shader,
//! then miss shaders, then hit groups, then callable shaders. Each kind gets
//! its own region in a single buffer:
//! - Ray generation: one record, region size equal to its stride
//! - Miss, hit and callable: `count` records each, region size rounded up to
//!   `shaderGroupBaseAlignment`
//!
//! Empty regions are passed to the driver as null regions.

use ash::vk;
use gpu_allocator::MemoryLocation;
use serde::Serialize;
use vkray_core::{align_up, align_up_u64};
use vkray_gpu::{BufferDesc, DeviceBuffer, GpuError, RayTracingDevice, RayTracingProperties, Result};

/// Kind of a shader group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderGroupKind {
    RayGen,
    Miss,
    HitGroup,
    Callable,
}

/// How far shader group registration has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SbtStage {
    #[default]
    Empty,
    HasRayGen,
    HasMiss,
    HasHitGroup,
    /// At least one callable shader was added.
    Ready,
}

/// Number of shader groups of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
    pub callable: u32,
}

impl GroupCounts {
    pub fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit + self.callable
    }
}

/// Tracks shader group registration order and counts.
#[derive(Debug, Clone, Default)]
pub struct SbtBuilder {
    stage: SbtStage,
    counts: GroupCounts,
}

impl SbtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that a group of `kind` may be added next.
    ///
    /// # Panics
    /// If adding it would break the raygen, miss, hit, callable order.
    pub fn assert_can_add(&self, kind: ShaderGroupKind) {
        match kind {
            ShaderGroupKind::RayGen => assert!(
                self.stage == SbtStage::Empty,
                "Only one raygen shader is allowed, and it must be added first"
            ),
            _ if self.stage == SbtStage::Empty => {
                panic!("The first shader must be the raygen shader")
            }
            ShaderGroupKind::Miss => assert!(
                self.stage <= SbtStage::HasMiss,
                "Miss shaders must be added before hit groups"
            ),
            ShaderGroupKind::HitGroup => assert!(
                self.stage <= SbtStage::HasHitGroup,
                "Hit groups must be added before callable shaders"
            ),
            ShaderGroupKind::Callable => assert!(
                self.stage >= SbtStage::HasHitGroup,
                "Callable shaders must be added after at least one hit group"
            ),
        }
    }

    /// Register a group of `kind` and return its group index.
    pub fn add(&mut self, kind: ShaderGroupKind) -> u32 {
        self.assert_can_add(kind);
        let index = self.counts.total();
        match kind {
            ShaderGroupKind::RayGen => {
                self.counts.raygen += 1;
                self.stage = SbtStage::HasRayGen;
            }
            ShaderGroupKind::Miss => {
                self.counts.miss += 1;
                self.stage = SbtStage::HasMiss;
            }
            ShaderGroupKind::HitGroup => {
                self.counts.hit += 1;
                self.stage = SbtStage::HasHitGroup;
            }
            ShaderGroupKind::Callable => {
                self.counts.callable += 1;
                self.stage = SbtStage::Ready;
            }
        }
        index
    }

    pub fn add_raygen(&mut self) -> u32 {
        self.add(ShaderGroupKind::RayGen)
    }

    pub fn add_miss(&mut self) -> u32 {
        self.add(ShaderGroupKind::Miss)
    }

    pub fn add_hit_group(&mut self) -> u32 {
        self.add(ShaderGroupKind::HitGroup)
    }

    pub fn add_callable(&mut self) -> u32 {
        self.add(ShaderGroupKind::Callable)
    }

    pub fn stage(&self) -> SbtStage {
        self.stage
    }

    pub fn counts(&self) -> GroupCounts {
        self.counts
    }

    /// Pack the handles of `pipeline` into a new table.
    ///
    /// # Panics
    /// If there is no raygen shader or no hit group.
    pub fn create(
        &self,
        device: &dyn RayTracingDevice,
        pipeline: vk::Pipeline,
    ) -> Result<ShaderBindingTable> {
        assert_eq!(self.counts.raygen, 1, "No raygen shader was added");
        assert!(self.counts.hit >= 1, "No hit groups were added");
        ShaderBindingTable::new(device, pipeline, &self.counts)
    }
}

/// Placement of one region inside the table buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SbtRegionLayout {
    /// Byte offset from the start of the buffer.
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
    pub count: u32,
}

impl SbtRegionLayout {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Offset of record `slot` inside the buffer.
    pub fn record_offset(&self, slot: u32) -> u64 {
        self.offset + u64::from(slot) * self.stride
    }

    fn region(&self, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        if self.is_empty() {
            return vk::StridedDeviceAddressRegionKHR::default();
        }
        vk::StridedDeviceAddressRegionKHR::default()
            .device_address(base_address + self.offset)
            .stride(self.stride)
            .size(self.size)
    }
}

/// Byte layout of a whole table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SbtLayout {
    /// Bytes copied per record.
    pub handle_size: u32,
    pub raygen: SbtRegionLayout,
    pub miss: SbtRegionLayout,
    pub hit: SbtRegionLayout,
    pub callable: SbtRegionLayout,
    pub total_size: u64,
}

impl SbtLayout {
    /// Lay out regions for `counts` under the device's alignment rules.
    pub fn compute(properties: &RayTracingProperties, counts: &GroupCounts) -> Self {
        let handle_size = properties.shader_group_handle_size;
        let base = u64::from(properties.shader_group_base_alignment.max(1));
        let stride = u64::from(align_up(
            handle_size,
            properties.shader_group_handle_alignment.max(1),
        ));

        let mut offset = 0u64;
        let mut place = |count: u32, raygen: bool| {
            if count == 0 {
                return SbtRegionLayout::default();
            }
            let (stride, size) = if raygen {
                let stride = align_up_u64(stride, base);
                (stride, stride)
            } else {
                (stride, align_up_u64(stride * u64::from(count), base))
            };
            let region = SbtRegionLayout {
                offset,
                stride,
                size,
                count,
            };
            offset += size;
            region
        };

        let raygen = place(counts.raygen, true);
        let miss = place(counts.miss, false);
        let hit = place(counts.hit, false);
        let callable = place(counts.callable, false);

        Self {
            handle_size,
            raygen,
            miss,
            hit,
            callable,
            total_size: offset,
        }
    }

    /// Regions in group registration order.
    fn regions(&self) -> [&SbtRegionLayout; 4] {
        [&self.raygen, &self.miss, &self.hit, &self.callable]
    }
}

/// Shader group handles packed into a host-visible buffer.
#[derive(Debug)]
pub struct ShaderBindingTable {
    buffer: DeviceBuffer,
    layout: SbtLayout,
    pipeline: vk::Pipeline,
    raygen_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,
    callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Fetch the handles of `pipeline` and copy each into its record.
    pub fn new(
        device: &dyn RayTracingDevice,
        pipeline: vk::Pipeline,
        counts: &GroupCounts,
    ) -> Result<Self> {
        let layout = SbtLayout::compute(&device.ray_tracing_properties(), counts);
        let handle_size = layout.handle_size as usize;
        let group_count = counts.total();

        let handles = device.shader_group_handles(pipeline, 0, group_count)?;
        if handles.len() < handle_size * group_count as usize {
            return Err(GpuError::InvalidState(format!(
                "Expected {} bytes of shader group handles, got {}",
                handle_size * group_count as usize,
                handles.len()
            )));
        }

        let mut data = vec![0u8; layout.total_size as usize];
        let mut group = 0usize;
        for region in layout.regions() {
            for slot in 0..region.count {
                let dst = region.record_offset(slot) as usize;
                let src = group * handle_size;
                data[dst..dst + handle_size].copy_from_slice(&handles[src..src + handle_size]);
                group += 1;
            }
        }

        let buffer = device.create_buffer(&BufferDesc::new(
            layout.total_size,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "shader_binding_table",
        ))?;
        if let Err(e) = device.write_buffer(&buffer, 0, &data) {
            device.destroy_buffer(buffer);
            return Err(e);
        }

        tracing::debug!(
            "SBT: {} groups in {} bytes (raygen {}, miss {}, hit {}, callable {})",
            group_count,
            layout.total_size,
            counts.raygen,
            counts.miss,
            counts.hit,
            counts.callable
        );

        let address = buffer.device_address;
        Ok(Self {
            raygen_region: layout.raygen.region(address),
            miss_region: layout.miss.region(address),
            hit_region: layout.hit.region(address),
            callable_region: layout.callable.region(address),
            buffer,
            layout,
            pipeline,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// Raygen, miss, hit and callable regions, as passed to `vkCmdTraceRaysKHR`.
    pub fn regions(&self) -> [vk::StridedDeviceAddressRegionKHR; 4] {
        [
            self.raygen_region,
            self.miss_region,
            self.hit_region,
            self.callable_region,
        ]
    }

    /// Bind the pipeline and trace one ray per pixel of `extent`.
    pub fn dispatch(&self, device: &dyn RayTracingDevice, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline);
        device.cmd_trace_rays(
            cmd,
            &self.raygen_region,
            &self.miss_region,
            &self.hit_region,
            &self.callable_region,
            extent.width,
            extent.height,
            1,
        );
    }

    pub fn destroy(self, device: &dyn RayTracingDevice) {
        device.destroy_buffer(self.buffer);
    }
}
