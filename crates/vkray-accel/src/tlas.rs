//! Top-level acceleration structure over per-mesh instances.

use crate::blas::BlasBuilder;
use crate::geometry::MeshIndex;
use crate::structure::{
    not_built, structure_write_barrier, AccelerationStructure, ScratchBuffer,
};
use ash::vk;
use ash::vk::Handle;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use vkray_core::constants::{MASK_HIDDEN, MASK_VISIBLE};
use vkray_core::Transform3x4;
use vkray_gpu::{BufferDesc, DeviceBuffer, GpuError, OneShotCommands, RayTracingDevice, Result};

/// Build flags of the top-level structure.
pub const TLAS_BUILD_FLAGS: vk::BuildAccelerationStructureFlagsKHR =
    vk::BuildAccelerationStructureFlagsKHR::from_raw(
        vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw(),
    );

/// Flags given to every new instance.
pub const INSTANCE_FLAGS: vk::GeometryInstanceFlagsKHR =
    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;

/// One placement of a bottom-level structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance {
    pub transform: Transform3x4,
    /// Exposed to shaders as `gl_InstanceCustomIndexEXT`. 24 bits.
    pub custom_index: u32,
    pub mask: u8,
    /// Shader binding table record offset selecting the hit group. 24 bits.
    pub hit_group: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    /// Bottom-level structure this instance places.
    pub mesh: MeshIndex,
}

impl Instance {
    /// Visible instance with the identity transform and the first hit group.
    pub fn new(custom_index: u32, mesh: MeshIndex) -> Self {
        Self {
            transform: Transform3x4::IDENTITY,
            custom_index,
            mask: MASK_VISIBLE,
            hit_group: 0,
            flags: INSTANCE_FLAGS,
            mesh,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.mask != MASK_HIDDEN
    }

    /// Device record for this instance referencing `structure_reference`.
    pub fn to_record(&self, structure_reference: u64) -> InstanceRecord {
        InstanceRecord {
            transform: self.transform.to_array(),
            custom_index_and_mask: (self.custom_index & 0x00FF_FFFF)
                | (u32::from(self.mask) << 24),
            hit_group_and_flags: (self.hit_group & 0x00FF_FFFF)
                | ((self.flags.as_raw() & 0xFF) << 24),
            structure_reference,
        }
    }
}

/// Binary layout of `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8.
    pub hit_group_and_flags: u32,
    /// Device address (device builds) or host handle (host builds) of a bottom-level structure.
    pub structure_reference: u64,
}

impl InstanceRecord {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Mode selected by [`TlasBuilder::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Full build into a new structure.
    Build,
    /// Refit of the existing structure in place.
    Update,
}

impl BuildMode {
    pub fn to_vk(self) -> vk::BuildAccelerationStructureModeKHR {
        match self {
            Self::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
            Self::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
        }
    }
}

/// Build state of the top-level structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopStructure {
    #[default]
    Unbuilt,
    Built {
        structure: AccelerationStructure,
        /// Whether the structure lives in host memory and is built on the host.
        host: bool,
    },
}

/// Instances of the scene and the top-level structure built over them.
#[derive(Debug, Default)]
pub struct TlasBuilder {
    instances: Vec<Instance>,
    state: TopStructure,
    /// Device builds only. Sized for the current instance count.
    instance_buffer: Option<DeviceBuffer>,
}

impl TlasBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the instance list with one identity instance per built bottom-level structure.
    ///
    /// If the instance count changes, the existing top-level structure is
    /// destroyed and the next build is a full build.
    pub fn register_instances_from_bottom_structures(
        &mut self,
        device: &dyn RayTracingDevice,
        blas: &BlasBuilder,
    ) {
        let instances: Vec<Instance> = blas
            .structures()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_built())
            .enumerate()
            .map(|(custom_index, (mesh, _))| {
                Instance::new(custom_index as u32, MeshIndex(mesh as u32))
            })
            .collect();

        if instances.len() != self.instances.len() {
            if self.is_built() {
                tracing::debug!(
                    "Instance count changed from {} to {}, rebuilding TLAS",
                    self.instances.len(),
                    instances.len()
                );
            }
            // The instance buffer is sized for the old count even if no build succeeded.
            self.teardown(device);
        }
        self.instances = instances;
    }

    /// Set the transform and visibility of one instance.
    ///
    /// # Panics
    /// If `index` is not a registered instance.
    pub fn update_instance(&mut self, index: usize, transform: &Mat4, visible: bool) {
        let count = self.instances.len();
        let instance = self
            .instances
            .get_mut(index)
            .unwrap_or_else(|| panic!("Instance {index} out of range ({count} instances)"));
        instance.transform = Transform3x4::from_mat4(transform);
        instance.mask = if visible { MASK_VISIBLE } else { MASK_HIDDEN };
    }

    /// Select the hit group record used by one instance.
    ///
    /// # Panics
    /// If `index` is not a registered instance or `offset` does not fit in 24 bits.
    pub fn set_hit_group(&mut self, index: usize, offset: u32) {
        assert!(offset <= 0x00FF_FFFF, "Hit group offset {offset} exceeds 24 bits");
        let count = self.instances.len();
        let instance = self
            .instances
            .get_mut(index)
            .unwrap_or_else(|| panic!("Instance {index} out of range ({count} instances)"));
        instance.hit_group = offset;
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn state(&self) -> &TopStructure {
        &self.state
    }

    /// The next build is a full build.
    pub fn is_first_build(&self) -> bool {
        matches!(self.state, TopStructure::Unbuilt)
    }

    pub fn is_built(&self) -> bool {
        !self.is_first_build()
    }

    pub fn structure(&self) -> Option<&AccelerationStructure> {
        match &self.state {
            TopStructure::Unbuilt => None,
            TopStructure::Built { structure, .. } => Some(structure),
        }
    }

    /// Handle for descriptor binding, if built.
    pub fn handle(&self) -> Option<vk::AccelerationStructureKHR> {
        self.structure().map(|s| s.handle)
    }

    /// Resolve every instance's bottom-level reference into its device record.
    ///
    /// References are resolved fresh on every call, so structures moved by
    /// compaction are picked up. Host builds reference structures by handle,
    /// and those structures must live in host-visible memory.
    pub fn resolve_instances(
        &self,
        device: &dyn RayTracingDevice,
        blas: &BlasBuilder,
        host: bool,
    ) -> Result<Vec<InstanceRecord>> {
        self.instances
            .iter()
            .map(|instance| {
                let structure = blas
                    .structures()
                    .get(instance.mesh.as_usize())
                    .and_then(|slot| slot.structure())
                    .ok_or_else(|| {
                        not_built(&format!("BLAS of mesh {}", instance.mesh.as_u32()))
                    })?;
                let reference = if host {
                    if structure.buffer.location == MemoryLocation::GpuOnly {
                        return Err(GpuError::InvalidState(format!(
                            "Host builds need host-visible BLAS memory (mesh {})",
                            instance.mesh.as_u32()
                        )));
                    }
                    structure.handle.as_raw()
                } else {
                    structure.device_address(device)
                };
                Ok(instance.to_record(reference))
            })
            .collect()
    }

    /// Build the structure on first use, refit it afterwards.
    ///
    /// The instance list is uploaded before every call. Host builds run
    /// without a command buffer and need `accelerationStructureHostCommands`.
    /// A structure must always be built the same way.
    pub fn build(
        &mut self,
        device: &dyn RayTracingDevice,
        commands: &OneShotCommands,
        blas: &BlasBuilder,
        use_host_build: bool,
    ) -> Result<BuildMode> {
        if self.instances.is_empty() {
            return Err(GpuError::InvalidState(
                "TLAS build requested with no instances".to_string(),
            ));
        }
        if use_host_build && !device.supports_host_build() {
            return Err(GpuError::ExtensionNotSupported(
                "accelerationStructureHostCommands".to_string(),
            ));
        }

        let existing = match self.state {
            TopStructure::Unbuilt => None,
            TopStructure::Built { structure, host } if host == use_host_build => Some(structure),
            TopStructure::Built { host, .. } => {
                let side = |host: bool| if host { "host" } else { "device" };
                return Err(GpuError::InvalidState(format!(
                    "TLAS was built on the {}, cannot update it on the {}",
                    side(host),
                    side(use_host_build),
                )));
            }
        };
        let mode = if existing.is_some() {
            BuildMode::Update
        } else {
            BuildMode::Build
        };

        let records = self.resolve_instances(device, blas, use_host_build)?;
        let count = self.instance_count();
        let build_type = if use_host_build {
            vk::AccelerationStructureBuildTypeKHR::HOST
        } else {
            vk::AccelerationStructureBuildTypeKHR::DEVICE
        };

        let size_geometry = instances_geometry(vk::DeviceOrHostAddressConstKHR::default());
        let size_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(TLAS_BUILD_FLAGS)
            .mode(mode.to_vk())
            .geometries(std::slice::from_ref(&size_geometry));
        let sizes = device.acceleration_structure_build_sizes(build_type, &size_info, &[count]);

        let structure = match existing {
            Some(structure) => structure,
            None => {
                let location = if use_host_build {
                    MemoryLocation::CpuToGpu
                } else {
                    MemoryLocation::GpuOnly
                };
                let structure = AccelerationStructure::new(
                    device,
                    vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    sizes.acceleration_structure_size,
                    location,
                    "tlas_buffer",
                )?;
                tracing::info!("TLAS size: {} bytes for {count} instances", structure.size);
                structure
            }
        };

        let scratch_size = match mode {
            BuildMode::Build => sizes.build_scratch_size,
            BuildMode::Update => sizes.update_scratch_size,
        };

        let built = if use_host_build {
            build_on_host(device, &structure, mode, &records, scratch_size)
        } else {
            self.build_on_device(device, commands, &structure, mode, &records, scratch_size)
        };

        if let Err(e) = built {
            if mode == BuildMode::Build {
                structure.destroy(device);
            }
            return Err(e);
        }

        self.state = TopStructure::Built {
            structure,
            host: use_host_build,
        };
        Ok(mode)
    }

    fn build_on_device(
        &mut self,
        device: &dyn RayTracingDevice,
        commands: &OneShotCommands,
        structure: &AccelerationStructure,
        mode: BuildMode,
        records: &[InstanceRecord],
        scratch_size: u64,
    ) -> Result<()> {
        let instance_buffer = match self.instance_buffer {
            Some(buffer) => buffer,
            None => {
                let buffer = device.create_buffer(&BufferDesc::new(
                    InstanceRecord::SIZE * records.len() as u64,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::CpuToGpu,
                    "tlas_instance_buffer",
                ))?;
                self.instance_buffer = Some(buffer);
                buffer
            }
        };
        device.write_buffer(&instance_buffer, 0, bytemuck::cast_slice(records))?;

        let scratch = ScratchBuffer::new(device, scratch_size)?;
        let submitted = commands.run(device, |cmd| {
            let geometry = instances_geometry(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.device_address,
            });
            let build_info = build_info(&geometry, structure, mode).scratch_data(
                vk::DeviceOrHostAddressKHR {
                    device_address: scratch.address(),
                },
            );
            let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(records.len() as u32);

            // Bottom-level builds and compaction copies must land before they are referenced.
            structure_write_barrier(device, cmd);
            device.cmd_build_acceleration_structures(
                cmd,
                &[build_info],
                &[std::slice::from_ref(&range)],
            );
            Ok(())
        });
        scratch.destroy(device);
        submitted
    }

    /// Destroy the structure and instance buffer; instances are kept.
    fn teardown(&mut self, device: &dyn RayTracingDevice) {
        if let TopStructure::Built { structure, .. } = std::mem::take(&mut self.state) {
            structure.destroy(device);
        }
        if let Some(buffer) = self.instance_buffer.take() {
            device.destroy_buffer(buffer);
        }
    }

    /// Release all GPU resources and forget the instances.
    pub fn destroy(&mut self, device: &dyn RayTracingDevice) {
        self.teardown(device);
        self.instances.clear();
    }
}

fn instances_geometry(
    data: vk::DeviceOrHostAddressConstKHR,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(data),
        })
}

fn build_info<'a>(
    geometry: &'a vk::AccelerationStructureGeometryKHR<'a>,
    structure: &AccelerationStructure,
    mode: BuildMode,
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    let src = match mode {
        BuildMode::Build => vk::AccelerationStructureKHR::null(),
        BuildMode::Update => structure.handle,
    };
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(TLAS_BUILD_FLAGS)
        .mode(mode.to_vk())
        .src_acceleration_structure(src)
        .dst_acceleration_structure(structure.handle)
        .geometries(std::slice::from_ref(geometry))
}

fn build_on_host(
    device: &dyn RayTracingDevice,
    structure: &AccelerationStructure,
    mode: BuildMode,
    records: &[InstanceRecord],
    scratch_size: u64,
) -> Result<()> {
    let mut scratch = vec![0u8; scratch_size as usize];
    let geometry = instances_geometry(vk::DeviceOrHostAddressConstKHR {
        host_address: records.as_ptr().cast(),
    });
    let build_info = build_info(&geometry, structure, mode).scratch_data(
        vk::DeviceOrHostAddressKHR {
            host_address: scratch.as_mut_ptr().cast(),
        },
    );
    let range =
        vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(records.len() as u32);

    device.build_acceleration_structures_on_host(&[build_info], &[std::slice::from_ref(&range)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MeshGeometry;
    use approx::assert_relative_eq;
    use vkray_core::rotate_y_degrees;
    use vkray_test::fixtures::quad_buffers;
    use vkray_test::mock::structure_size;
    use vkray_test::{Call, MockDevice};

    fn built_scene(device: &MockDevice, commands: &OneShotCommands, meshes: usize) -> BlasBuilder {
        scene_in(device, commands, meshes, false)
    }

    fn host_scene(device: &MockDevice, commands: &OneShotCommands, meshes: usize) -> BlasBuilder {
        scene_in(device, commands, meshes, true)
    }

    fn scene_in(
        device: &MockDevice,
        commands: &OneShotCommands,
        meshes: usize,
        host_accessible: bool,
    ) -> BlasBuilder {
        let mut blas = BlasBuilder::new();
        blas.set_host_accessible(host_accessible);
        for _ in 0..meshes {
            let (vbo, ibo) = quad_buffers(device);
            blas.register(MeshGeometry::new(vbo, 4, 12, ibo, 6, vbo));
        }
        blas.build_all(device, commands, true).unwrap();
        blas
    }

    #[test]
    fn record_matches_vulkan_layout() {
        assert_eq!(
            InstanceRecord::SIZE as usize,
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );

        let mut instance = Instance::new(5, MeshIndex(0));
        instance.hit_group = 2;
        let record = instance.to_record(0xABCD);
        let packed = vk::Packed24_8::new(5, 0xFF);
        assert_eq!(record.custom_index_and_mask & 0x00FF_FFFF, packed.low_24());
        assert_eq!((record.custom_index_and_mask >> 24) as u8, packed.high_8());
        assert_eq!(record.hit_group_and_flags & 0x00FF_FFFF, 2);
        assert_eq!(
            record.hit_group_and_flags >> 24,
            INSTANCE_FLAGS.as_raw()
        );
        assert_eq!(record.structure_reference, 0xABCD);
    }

    #[test]
    fn registration_follows_bottom_structures() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = built_scene(&device, &commands, 3);
        let mut tlas = TlasBuilder::new();

        tlas.register_instances_from_bottom_structures(&device, &blas);

        assert_eq!(tlas.instance_count(), 3);
        for (i, instance) in tlas.instances().iter().enumerate() {
            assert_eq!(instance.custom_index, i as u32);
            assert_eq!(instance.mesh, MeshIndex(i as u32));
            assert_eq!(instance.transform, Transform3x4::IDENTITY);
            assert!(instance.is_visible());
        }
        commands.destroy(&device);
    }

    #[test]
    fn references_resolve_to_compacted_addresses() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = built_scene(&device, &commands, 2);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);

        let records = tlas.resolve_instances(&device, &blas, false).unwrap();

        for (record, slot) in records.iter().zip(blas.structures()) {
            let structure = slot.structure().unwrap();
            assert!(device.structure_alive(structure.handle));
            assert_eq!(record.structure_reference, structure.buffer.device_address);
        }
        commands.destroy(&device);
    }

    #[test]
    fn update_instance_touches_one_slot() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = built_scene(&device, &commands, 3);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);
        let before = tlas.resolve_instances(&device, &blas, false).unwrap();

        tlas.update_instance(1, &rotate_y_degrees(30.0), false);

        let after = tlas.resolve_instances(&device, &blas, false).unwrap();
        assert_eq!(bytemuck::bytes_of(&before[0]), bytemuck::bytes_of(&after[0]));
        assert_eq!(bytemuck::bytes_of(&before[2]), bytemuck::bytes_of(&after[2]));
        assert_eq!(before[1].structure_reference, after[1].structure_reference);
        assert_eq!(before[1].hit_group_and_flags, after[1].hit_group_and_flags);
        assert_eq!(after[1].custom_index_and_mask, 1);

        let rotated = tlas.instances()[1].transform.to_mat4();
        assert_relative_eq!(rotated.x_axis.z, -(30f32.to_radians().sin()), epsilon = 1e-6);
        commands.destroy(&device);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn update_out_of_range_panics() {
        let mut tlas = TlasBuilder::new();
        tlas.update_instance(0, &Mat4::IDENTITY, true);
    }

    #[test]
    fn first_build_then_refit() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = built_scene(&device, &commands, 2);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);
        device.clear_calls();

        assert!(tlas.is_first_build());
        assert_eq!(tlas.build(&device, &commands, &blas, false).unwrap(), BuildMode::Build);
        assert!(!tlas.is_first_build());
        let handle = tlas.handle().unwrap();
        assert_eq!(device.structure_size(handle), Some(structure_size(2)));

        tlas.update_instance(0, &Mat4::from_translation(glam::Vec3::X), true);
        assert_eq!(tlas.build(&device, &commands, &blas, false).unwrap(), BuildMode::Update);
        assert_eq!(tlas.handle(), Some(handle));

        let builds = device.builds();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0].mode, vk::BuildAccelerationStructureModeKHR::BUILD);
        assert_eq!(builds[0].src, vk::AccelerationStructureKHR::null());
        assert_eq!(builds[1].mode, vk::BuildAccelerationStructureModeKHR::UPDATE);
        assert_eq!(builds[1].src, handle);
        assert_eq!(builds[1].dst, handle);
        assert_eq!(builds[1].flags, TLAS_BUILD_FLAGS);

        // Size queries follow the selected mode.
        let modes: Vec<_> = device
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BuildSizes { mode, primitives, .. } => Some((mode, primitives)),
                _ => None,
            })
            .collect();
        assert_eq!(
            modes,
            vec![
                (vk::BuildAccelerationStructureModeKHR::BUILD, 2),
                (vk::BuildAccelerationStructureModeKHR::UPDATE, 2),
            ]
        );

        // Both builds read the uploaded instances.
        let expected: Vec<u64> = blas
            .structures()
            .iter()
            .map(|s| s.structure().unwrap().buffer.device_address)
            .collect();
        assert_eq!(builds[1].instance_references, expected);

        tlas.destroy(&device);
        assert_eq!(tlas.instance_count(), 0);
        commands.destroy(&device);
    }

    #[test]
    fn instance_buffer_allocated_once() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = built_scene(&device, &commands, 2);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);

        tlas.build(&device, &commands, &blas, false).unwrap();
        let buffers = device.live_buffers();
        tlas.build(&device, &commands, &blas, false).unwrap();
        tlas.build(&device, &commands, &blas, false).unwrap();

        assert_eq!(device.live_buffers(), buffers);
        commands.destroy(&device);
    }

    #[test]
    fn changed_instance_count_forces_full_build() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let mut blas = built_scene(&device, &commands, 2);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);
        tlas.build(&device, &commands, &blas, false).unwrap();

        // Same count keeps the structure for refits.
        tlas.register_instances_from_bottom_structures(&device, &blas);
        assert!(!tlas.is_first_build());

        let (vbo, ibo) = quad_buffers(&device);
        blas.register(MeshGeometry::new(vbo, 4, 12, ibo, 6, vbo));
        blas.build_all(&device, &commands, true).unwrap();
        tlas.register_instances_from_bottom_structures(&device, &blas);

        assert!(tlas.is_first_build());
        assert_eq!(tlas.build(&device, &commands, &blas, false).unwrap(), BuildMode::Build);
        assert_eq!(tlas.instance_count(), 3);
        commands.destroy(&device);
    }

    #[test]
    fn build_without_instances_is_an_error() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let mut tlas = TlasBuilder::new();

        let result = tlas.build(&device, &commands, &BlasBuilder::new(), false);

        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        commands.destroy(&device);
    }

    #[test]
    fn host_build_requires_capability() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = built_scene(&device, &commands, 1);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);

        let result = tlas.build(&device, &commands, &blas, true);

        assert!(matches!(result, Err(GpuError::ExtensionNotSupported(_))));
        assert!(tlas.is_first_build());
        commands.destroy(&device);
    }

    #[test]
    fn host_build_references_handles() {
        let device = MockDevice::new().with_host_build(true);
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = host_scene(&device, &commands, 2);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);
        let submits = device.submit_count();

        assert_eq!(tlas.build(&device, &commands, &blas, true).unwrap(), BuildMode::Build);

        assert_eq!(device.submit_count(), submits);
        let build = device.builds().pop().unwrap();
        assert_eq!(build.cmd, None);
        let handles: Vec<u64> = blas
            .structures()
            .iter()
            .map(|s| s.structure().unwrap().handle.as_raw())
            .collect();
        assert_eq!(build.instance_references, handles);

        // The same structure cannot switch to device refits.
        let mixed = tlas.build(&device, &commands, &blas, false);
        assert!(matches!(mixed, Err(GpuError::InvalidState(_))));
        commands.destroy(&device);
    }

    #[test]
    fn host_build_rejects_device_local_structures() {
        let device = MockDevice::new().with_host_build(true);
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = built_scene(&device, &commands, 2);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);
        let structures = device.live_structures();

        let result = tlas.build(&device, &commands, &blas, true);

        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        assert!(tlas.is_first_build());
        assert_eq!(device.live_structures(), structures);
        commands.destroy(&device);
    }

    #[test]
    fn bottom_writes_are_visible_to_the_top_build() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let blas = built_scene(&device, &commands, 2);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);

        tlas.build(&device, &commands, &blas, false).unwrap();

        let calls = device.calls();
        let last_copy = calls
            .iter()
            .rposition(|c| matches!(c, Call::Copy { .. }))
            .unwrap();
        let top_build = calls
            .iter()
            .position(|c| {
                matches!(c, Call::Build(build)
                    if build.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            })
            .unwrap();
        assert!(last_copy < top_build);
        assert!(matches!(
            calls[top_build - 1],
            Call::Barrier { src, dst }
                if src.1 == vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR
                    && dst.1 == vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
        ));
        commands.destroy(&device);
    }

    #[test]
    fn failed_first_build_does_not_keep_a_short_instance_buffer() {
        let device = MockDevice::new();
        let commands = OneShotCommands::new(&device, 0).unwrap();
        let mut blas = built_scene(&device, &commands, 1);
        let mut tlas = TlasBuilder::new();
        tlas.register_instances_from_bottom_structures(&device, &blas);

        device.fail_next_submit();
        assert!(tlas.build(&device, &commands, &blas, false).is_err());
        assert!(tlas.is_first_build());

        let (vbo, ibo) = quad_buffers(&device);
        blas.register(MeshGeometry::new(vbo, 4, 12, ibo, 6, vbo));
        blas.build_all(&device, &commands, true).unwrap();
        tlas.register_instances_from_bottom_structures(&device, &blas);

        assert_eq!(tlas.build(&device, &commands, &blas, false).unwrap(), BuildMode::Build);
        assert_eq!(tlas.instance_count(), 2);
        commands.destroy(&device);
    }
}
