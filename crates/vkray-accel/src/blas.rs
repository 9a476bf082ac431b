//! Bottom-level acceleration structures, one per mesh.

use crate::geometry::{MeshGeometry, MeshIndex};
use crate::structure::{
    structure_write_barrier, AccelerationStructure, QueryPoolGuard, ScratchBuffer,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use vkray_core::constants::INDEX_STRIDE;
use vkray_gpu::{GpuError, OneShotCommands, RayTracingDevice, Result};

/// Build flags of every bottom-level structure.
pub const BLAS_BUILD_FLAGS: vk::BuildAccelerationStructureFlagsKHR =
    vk::BuildAccelerationStructureFlagsKHR::from_raw(
        vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw()
            | vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY.as_raw(),
    );

/// Build state of one mesh slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BottomStructure {
    #[default]
    Unbuilt,
    Built {
        structure: AccelerationStructure,
        /// Size reported by the compacted-size query.
        compacted_size: u64,
    },
    Compacted {
        structure: AccelerationStructure,
        /// Size of the structure before compaction.
        original_size: u64,
    },
}

impl BottomStructure {
    /// The live structure, if any.
    pub fn structure(&self) -> Option<&AccelerationStructure> {
        match self {
            Self::Unbuilt => None,
            Self::Built { structure, .. } | Self::Compacted { structure, .. } => Some(structure),
        }
    }

    pub fn is_built(&self) -> bool {
        !matches!(self, Self::Unbuilt)
    }
}

/// Registers meshes and turns each one into a bottom-level structure.
#[derive(Debug, Default)]
pub struct BlasBuilder {
    meshes: Vec<MeshGeometry>,
    structures: Vec<BottomStructure>,
    /// Back new structures with host-visible memory so host builds can reference them.
    host_accessible: bool,
}

impl BlasBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mesh for the next [`BlasBuilder::build_all`].
    ///
    /// Meshes without usable geometry are skipped with a warning.
    ///
    /// # Panics
    /// If the mesh does not use 32-bit indices.
    pub fn register(&mut self, geometry: MeshGeometry) -> Option<MeshIndex> {
        assert_eq!(
            geometry.index_stride, INDEX_STRIDE,
            "Ray traced meshes must use 32-bit indices"
        );

        if let Some(reason) = geometry.authoring_error() {
            tracing::warn!("Skipping mesh {}: {reason}", self.meshes.len());
            return None;
        }

        let index = MeshIndex(self.meshes.len() as u32);
        self.meshes.push(geometry);
        self.structures.push(BottomStructure::Unbuilt);
        Some(index)
    }

    /// Allocate structures built from now on in host-visible memory.
    ///
    /// Instances of a host-built top-level structure may only reference
    /// structures in host-visible memory. Already built slots keep their memory.
    pub fn set_host_accessible(&mut self, host_accessible: bool) {
        self.host_accessible = host_accessible;
    }

    pub fn is_host_accessible(&self) -> bool {
        self.host_accessible
    }

    fn memory_location(&self) -> MemoryLocation {
        if self.host_accessible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        }
    }

    /// Number of registered meshes.
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    pub fn meshes(&self) -> &[MeshGeometry] {
        &self.meshes
    }

    /// Slots in registration order.
    pub fn structures(&self) -> &[BottomStructure] {
        &self.structures
    }

    pub fn structure(&self, index: MeshIndex) -> &BottomStructure {
        &self.structures[index.as_usize()]
    }

    /// Build every unbuilt slot in registration order, compacting each one if `compact` is set.
    ///
    /// Each build is a synchronous submission. Slots that are already built
    /// are left alone.
    pub fn build_all(
        &mut self,
        device: &dyn RayTracingDevice,
        commands: &OneShotCommands,
        compact: bool,
    ) -> Result<()> {
        let mut built = 0;
        for i in 0..self.meshes.len() {
            if self.structures[i].is_built() {
                continue;
            }
            self.structures[i] =
                build_mesh(device, commands, &self.meshes[i], self.memory_location())?;
            built += 1;

            if compact {
                self.compact(device, commands, MeshIndex(i as u32))?;
            }
        }

        tracing::debug!("Built {built} bottom-level structures ({} total)", self.len());
        Ok(())
    }

    /// Copy a built structure into a buffer of its compacted size and destroy the original.
    ///
    /// Compacting an already compacted slot does nothing.
    pub fn compact(
        &mut self,
        device: &dyn RayTracingDevice,
        commands: &OneShotCommands,
        index: MeshIndex,
    ) -> Result<()> {
        let slot = index.as_usize();
        let (original, compacted_size) = match self.structures[slot] {
            BottomStructure::Built {
                structure,
                compacted_size,
            } => (structure, compacted_size),
            BottomStructure::Compacted { .. } => return Ok(()),
            BottomStructure::Unbuilt => {
                return Err(GpuError::InvalidState(format!(
                    "Cannot compact mesh {slot}: it has not been built"
                )))
            }
        };

        if compacted_size == 0 {
            tracing::warn!("Mesh {slot} reported no compacted size; keeping the original");
            return Ok(());
        }

        tracing::info!(
            "BLAS compaction: {compacted_size}/{} bytes ({}%)",
            original.size,
            compacted_size * 100 / original.size.max(1)
        );

        let compacted = AccelerationStructure::new(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            compacted_size,
            self.memory_location(),
            "blas_compacted",
        )?;

        let copied = commands.run(device, |cmd| {
            let info = vk::CopyAccelerationStructureInfoKHR::default()
                .src(original.handle)
                .dst(compacted.handle)
                .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
            device.cmd_copy_acceleration_structure(cmd, &info);
            structure_write_barrier(device, cmd);
            Ok(())
        });
        if let Err(e) = copied {
            compacted.destroy(device);
            return Err(e);
        }

        // The copy has completed, the original is no longer referenced.
        original.destroy(device);
        self.structures[slot] = BottomStructure::Compacted {
            structure: compacted,
            original_size: original.size,
        };
        Ok(())
    }

    /// Destroy every structure and forget all meshes.
    pub fn destroy(&mut self, device: &dyn RayTracingDevice) {
        for slot in self.structures.drain(..) {
            if let Some(structure) = slot.structure() {
                structure.destroy(device);
            }
        }
        self.meshes.clear();
    }
}

/// Build one mesh and read back its compacted size.
fn build_mesh(
    device: &dyn RayTracingDevice,
    commands: &OneShotCommands,
    mesh: &MeshGeometry,
    location: MemoryLocation,
) -> Result<BottomStructure> {
    let geometry = mesh.triangles();
    let primitive_count = mesh.primitive_count();

    let size_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(BLAS_BUILD_FLAGS)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(&geometry));
    let sizes = device.acceleration_structure_build_sizes(
        vk::AccelerationStructureBuildTypeKHR::DEVICE,
        &size_info,
        &[primitive_count],
    );

    let structure = AccelerationStructure::new(
        device,
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        sizes.acceleration_structure_size,
        location,
        "blas_buffer",
    )?;

    let recorded = record_build(
        device,
        commands,
        &geometry,
        primitive_count,
        &structure,
        sizes.build_scratch_size,
    );
    match recorded {
        Ok(compacted_size) => Ok(BottomStructure::Built {
            structure,
            compacted_size,
        }),
        Err(e) => {
            structure.destroy(device);
            Err(e)
        }
    }
}

fn record_build(
    device: &dyn RayTracingDevice,
    commands: &OneShotCommands,
    geometry: &vk::AccelerationStructureGeometryKHR<'_>,
    primitive_count: u32,
    structure: &AccelerationStructure,
    scratch_size: u64,
) -> Result<u64> {
    let scratch = ScratchBuffer::new(device, scratch_size)?;
    let query = match QueryPoolGuard::new(
        device,
        vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
    ) {
        Ok(query) => query,
        Err(e) => {
            scratch.destroy(device);
            return Err(e);
        }
    };

    let submitted = commands.run(device, |cmd| {
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(BLAS_BUILD_FLAGS)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(structure.handle)
            .geometries(std::slice::from_ref(geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.address(),
            });
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        device.cmd_reset_query_pool(cmd, query.pool(), 0, 1);
        device.cmd_build_acceleration_structures(
            cmd,
            &[build_info],
            &[std::slice::from_ref(&range)],
        );
        structure_write_barrier(device, cmd);
        device.cmd_write_acceleration_structure_properties(
            cmd,
            &[structure.handle],
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
            query.pool(),
            0,
        );
        Ok(())
    });

    scratch.destroy(device);
    submitted?;
    query.result()
}
