//! Acceleration structure storage shared by the bottom and top level builders.

use ash::vk;
use gpu_allocator::MemoryLocation;
use vkray_core::align_up_u64;
use vkray_gpu::{BufferDesc, DeviceBuffer, GpuError, RayTracingDevice, Result};

/// An acceleration structure and the buffer backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: DeviceBuffer,
    /// Size the structure was created with.
    pub size: u64,
}

impl AccelerationStructure {
    /// Allocate a backing buffer of exactly `size` bytes and create the structure in it.
    pub fn new(
        device: &dyn RayTracingDevice,
        ty: vk::AccelerationStructureTypeKHR,
        size: u64,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        let buffer = device.create_buffer(&BufferDesc::new(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location,
            name,
        ))?;

        match device.create_acceleration_structure(ty, &buffer, size) {
            Ok(handle) => Ok(Self {
                handle,
                buffer,
                size,
            }),
            Err(e) => {
                device.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// Device address used by instances to reference this structure.
    ///
    /// Changes whenever the structure is reallocated, e.g. by compaction.
    pub fn device_address(&self, device: &dyn RayTracingDevice) -> vk::DeviceAddress {
        device.acceleration_structure_address(self.handle)
    }

    /// Destroy the structure, then its backing buffer.
    pub fn destroy(self, device: &dyn RayTracingDevice) {
        device.destroy_acceleration_structure(self.handle);
        device.destroy_buffer(self.buffer);
    }
}

/// Device-local scratch memory for one build.
pub(crate) struct ScratchBuffer {
    buffer: DeviceBuffer,
    address: vk::DeviceAddress,
}

impl ScratchBuffer {
    /// Allocate `size` usable bytes starting at an address aligned to
    /// `minAccelerationStructureScratchOffsetAlignment`.
    pub fn new(device: &dyn RayTracingDevice, size: u64) -> Result<Self> {
        let alignment = u64::from(
            device
                .ray_tracing_properties()
                .min_scratch_offset_alignment
                .max(1),
        );
        let buffer = device.create_buffer(&BufferDesc::new(
            size + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "as_scratch_buffer",
        ))?;

        Ok(Self {
            address: align_up_u64(buffer.device_address, alignment),
            buffer,
        })
    }

    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn destroy(self, device: &dyn RayTracingDevice) {
        device.destroy_buffer(self.buffer);
    }
}

/// A query pool destroyed when the guard goes out of scope.
pub struct QueryPoolGuard<'a> {
    device: &'a dyn RayTracingDevice,
    pool: vk::QueryPool,
}

impl<'a> QueryPoolGuard<'a> {
    /// Create a pool with a single query of type `ty`.
    pub fn new(device: &'a dyn RayTracingDevice, ty: vk::QueryType) -> Result<Self> {
        let pool = device.create_query_pool(ty, 1)?;
        Ok(Self { device, pool })
    }

    pub fn pool(&self) -> vk::QueryPool {
        self.pool
    }

    /// Block until the query result is available and return it.
    pub fn result(&self) -> Result<u64> {
        let mut results = [0u64];
        self.device.query_results(self.pool, 0, &mut results)?;
        Ok(results[0])
    }
}

impl Drop for QueryPoolGuard<'_> {
    fn drop(&mut self) {
        self.device.destroy_query_pool(self.pool);
    }
}

/// Make acceleration structure writes visible to later structure reads.
pub(crate) fn structure_write_barrier(device: &dyn RayTracingDevice, cmd: vk::CommandBuffer) {
    device.cmd_memory_barrier(
        cmd,
        (
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        ),
        (
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        ),
    );
}

/// Error for a structure that has to exist before the requested operation.
pub(crate) fn not_built(what: &str) -> GpuError {
    GpuError::InvalidState(format!("{what} has not been built"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkray_test::MockDevice;

    #[test]
    fn structure_owns_exactly_sized_buffer() {
        let device = MockDevice::new();
        let structure = AccelerationStructure::new(
            &device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            1024,
            MemoryLocation::GpuOnly,
            "blas",
        )
        .unwrap();

        assert_eq!(structure.buffer.size, 1024);
        assert_eq!(device.structure_size(structure.handle), Some(1024));
        assert_eq!(
            structure.device_address(&device),
            structure.buffer.device_address
        );

        structure.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn scratch_address_is_aligned() {
        let device = MockDevice::new();
        let alignment = u64::from(device.ray_tracing_properties().min_scratch_offset_alignment);

        let scratch = ScratchBuffer::new(&device, 300).unwrap();
        assert_eq!(scratch.address() % alignment, 0);
        assert!(scratch.address() >= scratch.buffer.device_address);
        assert!(scratch.address() + 300 <= scratch.buffer.device_address + scratch.buffer.size);

        scratch.destroy(&device);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn query_pool_released_on_drop() {
        let device = MockDevice::new();
        {
            let guard = QueryPoolGuard::new(
                &device,
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
            )
            .unwrap();
            assert_eq!(guard.result().unwrap(), 0);
            assert_eq!(device.live_query_pools(), 1);
        }
        assert_eq!(device.live_query_pools(), 0);
    }
}
