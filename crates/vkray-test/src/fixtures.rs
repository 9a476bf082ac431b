//! Geometry and shader inputs for tests.

use vkray_gpu::vk;
use vkray_gpu::{BufferDesc, DeviceBuffer, MemoryLocation, RayTracingDevice};

/// Smallest module that passes the SPIR-V magic check.
pub fn spirv_stub() -> Vec<u32> {
    vec![0x0723_0203, 0x0001_0000, 0, 1, 0]
}

/// Usage of buffers that feed acceleration structure builds and shaders.
pub fn geometry_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::STORAGE_BUFFER
}

/// Create a host-visible buffer holding `data`.
pub fn upload(
    device: &dyn RayTracingDevice,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> DeviceBuffer {
    let buffer = device
        .create_buffer(&BufferDesc::new(
            data.len().max(4) as u64,
            usage,
            MemoryLocation::CpuToGpu,
            name,
        ))
        .expect("mock buffer creation");
    device
        .write_buffer(&buffer, 0, data)
        .expect("mock buffer write");
    buffer
}

/// Positions and indices of an axis-aligned quad made of two triangles.
pub fn quad() -> (Vec<[f32; 3]>, Vec<u32>) {
    (
        vec![
            [-1.0, -1.0, 0.0],
            [1.0, -1.0, 0.0],
            [1.0, 1.0, 0.0],
            [-1.0, 1.0, 0.0],
        ],
        vec![0, 1, 2, 0, 2, 3],
    )
}

/// Vertex and index buffers for a quad, uploaded to `device`.
pub fn quad_buffers(device: &dyn RayTracingDevice) -> (DeviceBuffer, DeviceBuffer) {
    let (positions, indices) = quad();
    let vertex_bytes: Vec<u8> = positions
        .iter()
        .flat_map(|p| p.iter().flat_map(|c| c.to_le_bytes()))
        .collect();
    let index_bytes: Vec<u8> = indices.iter().flat_map(|i| i.to_le_bytes()).collect();
    (
        upload(device, &vertex_bytes, geometry_usage(), "quad_vertices"),
        upload(device, &index_bytes, geometry_usage(), "quad_indices"),
    )
}

/// A ray tracing pipeline with `group_count` general groups and no stages.
pub fn pipeline_with_groups(device: &dyn RayTracingDevice, group_count: u32) -> vk::Pipeline {
    let groups = vec![
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL);
        group_count as usize
    ];
    device
        .create_ray_tracing_pipeline(&vk::RayTracingPipelineCreateInfoKHR::default().groups(&groups))
        .expect("mock pipeline creation")
}
