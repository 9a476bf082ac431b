//! Mesh geometry handed to the bottom-level builder.

use ash::vk;
use vkray_core::constants::INDEX_STRIDE;
use vkray_gpu::DeviceBuffer;

/// Position of a mesh in registration order.
///
/// The same index addresses the mesh, its bottom-level structure and the
/// instance created for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshIndex(pub(crate) u32);

impl MeshIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Caller-owned vertex, index and uniform buffers of one mesh.
///
/// Vertices start with three 32-bit float positions; indices are 32-bit.
/// The buffers must stay alive until the bottom-level structure is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshGeometry {
    pub vertex_buffer: DeviceBuffer,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub vertex_offset: u64,
    pub index_buffer: DeviceBuffer,
    pub index_count: u32,
    /// Must be 4.
    pub index_stride: u32,
    pub index_offset: u64,
    /// Per-mesh uniforms bound next to the vertex and index buffers.
    pub uniform_buffer: DeviceBuffer,
    pub uniform_offset: u64,
    pub opaque: bool,
}

impl MeshGeometry {
    /// Opaque mesh with 32-bit indices and no buffer offsets.
    pub fn new(
        vertex_buffer: DeviceBuffer,
        vertex_count: u32,
        vertex_stride: u32,
        index_buffer: DeviceBuffer,
        index_count: u32,
        uniform_buffer: DeviceBuffer,
    ) -> Self {
        Self {
            vertex_buffer,
            vertex_count,
            vertex_stride,
            vertex_offset: 0,
            index_buffer,
            index_count,
            index_stride: INDEX_STRIDE,
            index_offset: 0,
            uniform_buffer,
            uniform_offset: 0,
            opaque: true,
        }
    }

    pub fn with_opacity(mut self, opaque: bool) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_offsets(mut self, vertex_offset: u64, index_offset: u64) -> Self {
        self.vertex_offset = vertex_offset;
        self.index_offset = index_offset;
        self
    }

    /// Number of triangles.
    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }

    /// Why this mesh cannot be built, if it cannot.
    pub(crate) fn authoring_error(&self) -> Option<&'static str> {
        if self.vertex_count == 0 {
            Some("vertex buffer is empty")
        } else if self.index_count == 0 {
            Some("index buffer is empty")
        } else if self.primitive_count() == 0 {
            Some("fewer than three indices")
        } else if self.vertex_buffer.device_address == 0 || self.index_buffer.device_address == 0 {
            Some("geometry buffers have no device address")
        } else {
            None
        }
    }

    /// Triangle geometry description for the build and size query.
    pub(crate) fn triangles(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let flags = if self.opaque {
            vk::GeometryFlagsKHR::OPAQUE
        } else {
            vk::GeometryFlagsKHR::empty()
        };

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(flags)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.vertex_buffer.device_address + self.vertex_offset,
                    })
                    .vertex_stride(u64::from(self.vertex_stride))
                    .max_vertex(self.vertex_count - 1)
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: self.index_buffer.device_address + self.index_offset,
                    }),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkray_gpu::MemoryLocation;

    fn buffer(address: u64) -> DeviceBuffer {
        DeviceBuffer {
            buffer: vk::Buffer::null(),
            size: 256,
            device_address: address,
            location: MemoryLocation::CpuToGpu,
        }
    }

    #[test]
    fn primitive_count_truncates() {
        let mesh = MeshGeometry::new(buffer(0x100), 4, 12, buffer(0x200), 7, buffer(0));
        assert_eq!(mesh.primitive_count(), 2);
    }

    #[test]
    fn authoring_errors() {
        let ok = MeshGeometry::new(buffer(0x100), 4, 12, buffer(0x200), 6, buffer(0));
        assert_eq!(ok.authoring_error(), None);

        let no_vertices = MeshGeometry { vertex_count: 0, ..ok };
        assert!(no_vertices.authoring_error().is_some());

        let two_indices = MeshGeometry { index_count: 2, ..ok };
        assert!(two_indices.authoring_error().is_some());

        let no_address = MeshGeometry {
            index_buffer: buffer(0),
            ..ok
        };
        assert!(no_address.authoring_error().is_some());
    }

    #[test]
    fn triangles_use_offsets_and_last_vertex() {
        let mesh = MeshGeometry::new(buffer(0x1000), 8, 24, buffer(0x2000), 12, buffer(0))
            .with_offsets(48, 16)
            .with_opacity(false);

        let geometry = mesh.triangles();
        assert_eq!(geometry.geometry_type, vk::GeometryTypeKHR::TRIANGLES);
        assert!(geometry.flags.is_empty());

        // SAFETY: the geometry type is TRIANGLES.
        let triangles = unsafe { geometry.geometry.triangles };
        assert_eq!(triangles.max_vertex, 7);
        assert_eq!(triangles.vertex_stride, 24);
        assert_eq!(triangles.index_type, vk::IndexType::UINT32);
        // SAFETY: both addresses were written as device addresses.
        unsafe {
            assert_eq!(triangles.vertex_data.device_address, 0x1030);
            assert_eq!(triangles.index_data.device_address, 0x2010);
        }
    }
}
