//! The descriptor set handed to ray tracing shaders.
//!
//! Bindings are declared up front, then one pool, one layout and one set
//! are created from the declaration. Resources are bound by staging a write
//! per binding; binding the same slot again replaces the staged write.
//! [`RayDescriptorSet::update_set_contents`] flushes every staged write in a
//! single `vkUpdateDescriptorSets` call.

use crate::geometry::MeshGeometry;
use ash::vk;
use std::collections::BTreeMap;
use vkray_gpu::{BindingDecl, DescriptorSetLayoutBuilder, DeviceBuffer, GpuError, RayTracingDevice, Result};

/// Binding numbers used by the ray tracing shaders.
pub struct Bindings;

impl Bindings {
    pub const TLAS: u32 = 0;
    pub const RENDER_TARGET: u32 = 1;
    pub const CAMERA: u32 = 2;
    /// One storage buffer per mesh.
    pub const MESH_UNIFORMS: u32 = 3;
    /// One storage buffer per mesh.
    pub const MESH_VERTICES: u32 = 4;
    /// One storage buffer per mesh.
    pub const MESH_INDICES: u32 = 5;
    /// Partially bound array of combined image samplers.
    pub const TEXTURES: u32 = 6;
    pub const LIGHT: u32 = 7;
}

/// Resources staged for one binding.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    Buffers(Vec<vk::DescriptorBufferInfo>),
    Images(Vec<vk::DescriptorImageInfo>),
    AccelerationStructures(Vec<vk::AccelerationStructureKHR>),
}

impl StagedWrite {
    pub fn len(&self) -> usize {
        match self {
            Self::Buffers(infos) => infos.len(),
            Self::Images(infos) => infos.len(),
            Self::AccelerationStructures(handles) => handles.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct SetHandles {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}

/// One descriptor set with its own pool and layout.
#[derive(Debug, Default)]
pub struct RayDescriptorSet {
    declarations: DescriptorSetLayoutBuilder,
    staged: BTreeMap<u32, StagedWrite>,
    handles: Option<SetHandles>,
}

impl RayDescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a binding of `count` descriptors.
    ///
    /// Zero-count bindings are skipped. Combined image sampler arrays are
    /// partially bound, so fewer images than `count` may be bound.
    ///
    /// # Panics
    /// If the set was already built.
    pub fn declare(
        &mut self,
        binding: u32,
        count: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) {
        assert!(
            self.handles.is_none(),
            "Bindings must be declared before the descriptor set is built"
        );
        if count == 0 {
            tracing::debug!("Skipping binding {binding}: zero descriptors");
            return;
        }

        let flags = if descriptor_type == vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
        } else {
            vk::DescriptorBindingFlags::empty()
        };
        let replaced = self.declarations.insert(BindingDecl {
            binding,
            descriptor_type,
            count,
            stages,
            flags,
        });
        if let Some(old) = replaced {
            tracing::error!(
                "Binding {binding} declared twice ({:?} x{} replaced by {:?} x{count})",
                old.descriptor_type,
                old.count,
                descriptor_type
            );
        }
    }

    pub fn declaration(&self, binding: u32) -> Option<&BindingDecl> {
        self.declarations.get(binding)
    }

    /// Create the pool, the layout and the set.
    pub fn build(&mut self, device: &dyn RayTracingDevice) -> Result<()> {
        if self.handles.is_some() {
            return Err(GpuError::InvalidState(
                "Descriptor set has already been built".to_string(),
            ));
        }
        if self.declarations.declarations().is_empty() {
            return Err(GpuError::InvalidState(
                "Descriptor set has no bindings".to_string(),
            ));
        }

        let layout = self.declarations.build(device)?;
        let pool = match device.create_descriptor_pool(1, &self.declarations.pool_sizes()) {
            Ok(pool) => pool,
            Err(e) => {
                device.destroy_descriptor_set_layout(layout);
                return Err(e);
            }
        };
        let set = match device.allocate_descriptor_set(pool, layout) {
            Ok(set) => set,
            Err(e) => {
                device.destroy_descriptor_pool(pool);
                device.destroy_descriptor_set_layout(layout);
                return Err(e);
            }
        };

        tracing::debug!(
            "Descriptor set built with {} bindings",
            self.declarations.declarations().len()
        );
        self.handles = Some(SetHandles { pool, layout, set });
        Ok(())
    }

    /// Stage `write` for `binding`, replacing anything staged before.
    ///
    /// # Panics
    /// If `binding` was not declared or `write` holds more descriptors than declared.
    pub fn bind(&mut self, binding: u32, write: StagedWrite) {
        let decl = self
            .declarations
            .get(binding)
            .unwrap_or_else(|| panic!("Binding {binding} was not declared"));
        assert!(
            write.len() <= decl.count as usize,
            "Binding {binding} holds {} descriptors, {} were bound",
            decl.count,
            write.len()
        );
        self.staged.insert(binding, write);
    }

    pub fn bind_buffers(&mut self, binding: u32, infos: Vec<vk::DescriptorBufferInfo>) {
        self.bind(binding, StagedWrite::Buffers(infos));
    }

    pub fn bind_images(&mut self, binding: u32, infos: Vec<vk::DescriptorImageInfo>) {
        self.bind(binding, StagedWrite::Images(infos));
    }

    pub fn bind_acceleration_structure(
        &mut self,
        binding: u32,
        structure: vk::AccelerationStructureKHR,
    ) {
        self.bind(binding, StagedWrite::AccelerationStructures(vec![structure]));
    }

    /// Bind a storage image in `GENERAL` layout.
    pub fn bind_storage_image(&mut self, binding: u32, view: vk::ImageView) {
        self.bind_images(
            binding,
            vec![vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL)],
        );
    }

    pub fn bind_uniform_buffer(&mut self, binding: u32, buffer: &DeviceBuffer) {
        self.bind_buffers(binding, vec![buffer.descriptor_info()]);
    }

    /// Bind the uniform, vertex and index buffers of every mesh, one array
    /// element per mesh in registration order.
    pub fn bind_meshes(&mut self, ubo: u32, vbo: u32, ibo: u32, meshes: &[MeshGeometry]) {
        let view = |buffer: &DeviceBuffer, offset: u64| {
            vk::DescriptorBufferInfo::default()
                .buffer(buffer.buffer)
                .offset(offset)
                .range(vk::WHOLE_SIZE)
        };
        self.bind_buffers(
            ubo,
            meshes
                .iter()
                .map(|m| view(&m.uniform_buffer, m.uniform_offset))
                .collect(),
        );
        self.bind_buffers(
            vbo,
            meshes
                .iter()
                .map(|m| view(&m.vertex_buffer, m.vertex_offset))
                .collect(),
        );
        self.bind_buffers(
            ibo,
            meshes
                .iter()
                .map(|m| view(&m.index_buffer, m.index_offset))
                .collect(),
        );
    }

    /// Bind a texture array. An empty list leaves the binding untouched.
    pub fn bind_textures(&mut self, binding: u32, infos: Vec<vk::DescriptorImageInfo>) {
        if infos.is_empty() {
            tracing::debug!("No textures to bind at {binding}");
            return;
        }
        self.bind_images(binding, infos);
    }

    pub fn staged(&self, binding: u32) -> Option<&StagedWrite> {
        self.staged.get(&binding)
    }

    /// Write every staged resource to the set in one call.
    ///
    /// Staged writes are kept, so a later rebind of one slot followed by
    /// another update rewrites the whole set.
    ///
    /// # Panics
    /// If the set has not been built.
    pub fn update_set_contents(&self, device: &dyn RayTracingDevice) {
        let Some(handles) = self.handles else {
            panic!("Descriptor set must be built before it can be updated");
        };

        let mut structure_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR<'_>> = self
            .staged
            .values()
            .filter_map(|staged| match staged {
                StagedWrite::AccelerationStructures(handles) => Some(
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(handles),
                ),
                _ => None,
            })
            .collect();
        let mut structure_infos = structure_infos.iter_mut();

        let mut writes = Vec::with_capacity(self.staged.len());
        for (&binding, staged) in &self.staged {
            let Some(decl) = self.declarations.get(binding) else {
                continue;
            };
            let write = vk::WriteDescriptorSet::default()
                .dst_set(handles.set)
                .dst_binding(binding)
                .dst_array_element(0)
                .descriptor_type(decl.descriptor_type);
            let write = match staged {
                StagedWrite::Buffers(infos) => write.buffer_info(infos),
                StagedWrite::Images(infos) => write.image_info(infos),
                StagedWrite::AccelerationStructures(structures) => {
                    let Some(info) = structure_infos.next() else {
                        continue;
                    };
                    write
                        .descriptor_count(structures.len() as u32)
                        .push_next(info)
                }
            };
            writes.push(write);
        }

        if writes.is_empty() {
            return;
        }
        device.update_descriptor_sets(&writes);
    }

    pub fn is_built(&self) -> bool {
        self.handles.is_some()
    }

    pub fn layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.handles.map(|h| h.layout)
    }

    pub fn set(&self) -> Option<vk::DescriptorSet> {
        self.handles.map(|h| h.set)
    }

    /// Release the pool and layout. The set is freed with its pool.
    pub fn destroy(&mut self, device: &dyn RayTracingDevice) {
        if let Some(handles) = self.handles.take() {
            device.destroy_descriptor_pool(handles.pool);
            device.destroy_descriptor_set_layout(handles.layout);
        }
        self.staged.clear();
    }
}
