//! The ray tracer: meshes in, a traced image out.
//!
//! [`RayTracer`] wires the builders together in the order a renderer uses
//! them:
//! 1. Register meshes and textures
//! 2. Build the bottom-level structures, then the top-level structure
//! 3. Create the descriptor set and the pipeline
//! 4. Every frame: update instances, refit, bind and trace

use crate::blas::BlasBuilder;
use crate::config::RayTracerConfig;
use crate::descriptor_set::{Bindings, RayDescriptorSet};
use crate::geometry::{MeshGeometry, MeshIndex};
use crate::pipeline::{RayPipeline, RayPipelineBuilder, ShaderSource};
use crate::structure::not_built;
use crate::tlas::{BuildMode, TlasBuilder};
use ash::vk;
use glam::Mat4;
use vkray_gpu::{DeviceBuffer, GpuError, OneShotCommands, RayTracingDevice, Result};

const RGEN: vk::ShaderStageFlags = vk::ShaderStageFlags::RAYGEN_KHR;
const CHIT: vk::ShaderStageFlags = vk::ShaderStageFlags::CLOSEST_HIT_KHR;
const MISS: vk::ShaderStageFlags = vk::ShaderStageFlags::MISS_KHR;

/// A sampled texture bound into the texture array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub layout: vk::ImageLayout,
}

impl Texture {
    /// A texture in `SHADER_READ_ONLY_OPTIMAL` layout.
    pub fn new(view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self {
            view,
            sampler,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .image_view(self.view)
            .sampler(self.sampler)
            .image_layout(self.layout)
    }
}

/// Acceleration structures, descriptor set and pipeline of one scene.
pub struct RayTracer<'d> {
    device: &'d dyn RayTracingDevice,
    commands: OneShotCommands,
    blas: BlasBuilder,
    tlas: TlasBuilder,
    descriptors: RayDescriptorSet,
    pipeline: Option<RayPipeline>,
    textures: Vec<Texture>,
    render_target: Option<vk::ImageView>,
    /// Camera and light uniforms of the current descriptor set.
    uniforms: Option<(DeviceBuffer, DeviceBuffer)>,
    /// Configuration of the current pipeline.
    pipeline_config: Option<RayTracerConfig>,
    host_build: bool,
    texture_capacity: u32,
}

impl<'d> RayTracer<'d> {
    /// Create a ray tracer submitting to `queue_family`.
    pub fn new(device: &'d dyn RayTracingDevice, queue_family: u32) -> Result<Self> {
        Ok(Self {
            device,
            commands: OneShotCommands::new(device, queue_family)?,
            blas: BlasBuilder::new(),
            tlas: TlasBuilder::new(),
            descriptors: RayDescriptorSet::new(),
            pipeline: None,
            textures: Vec::new(),
            render_target: None,
            uniforms: None,
            pipeline_config: None,
            host_build: false,
            texture_capacity: 0,
        })
    }

    /// Register a mesh. Empty meshes are skipped with a warning.
    pub fn add_mesh(&mut self, geometry: MeshGeometry) -> Option<MeshIndex> {
        self.blas.register(geometry)
    }

    /// Append a texture and return its array index.
    pub fn add_texture(&mut self, texture: Texture) -> u32 {
        self.textures.push(texture);
        self.textures.len() as u32 - 1
    }

    /// Replace a texture, rewriting the descriptor set if it exists.
    ///
    /// # Panics
    /// If `index` was not returned by [`Self::add_texture`].
    pub fn update_texture(&mut self, index: u32, texture: Texture) {
        let count = self.textures.len();
        let slot = self
            .textures
            .get_mut(index as usize)
            .unwrap_or_else(|| panic!("Texture {index} out of range ({count} textures)"));
        *slot = texture;

        if self.descriptors.is_built() {
            let infos = self.texture_infos();
            self.descriptors.bind_textures(Bindings::TEXTURES, infos);
            self.descriptors.update_set_contents(self.device);
        }
    }

    /// Minimum size of the texture array, so textures can be added after
    /// the descriptor set exists.
    pub fn set_texture_capacity(&mut self, capacity: u32) {
        self.texture_capacity = capacity;
    }

    /// Build every bottom-level structure, register one instance per mesh
    /// and build the top-level structure.
    ///
    /// Host builds allocate the bottom-level structures in host-visible memory.
    /// An existing descriptor set is pointed at the new top-level structure,
    /// and recreated together with the pipeline if the mesh count changed.
    pub fn build_acceleration_structures(
        &mut self,
        compact: bool,
        use_host_build: bool,
    ) -> Result<BuildMode> {
        self.blas.set_host_accessible(use_host_build);
        self.blas.build_all(self.device, &self.commands, compact)?;
        self.tlas
            .register_instances_from_bottom_structures(self.device, &self.blas);
        self.host_build = use_host_build;
        let mode = self
            .tlas
            .build(self.device, &self.commands, &self.blas, use_host_build)?;
        self.refresh_descriptor_set(mode)?;
        Ok(mode)
    }

    /// Move or hide one instance. Takes effect on the next [`Self::update_tlas`].
    pub fn update_instance(&mut self, index: usize, transform: &Mat4, visible: bool) {
        self.tlas.update_instance(index, transform, visible);
    }

    /// Refit the top-level structure after instance updates.
    pub fn update_tlas(&mut self) -> Result<BuildMode> {
        let mode = self
            .tlas
            .build(self.device, &self.commands, &self.blas, self.host_build)?;
        self.refresh_descriptor_set(mode)?;
        Ok(mode)
    }

    /// Keep a built descriptor set in step with the acceleration structures.
    fn refresh_descriptor_set(&mut self, mode: BuildMode) -> Result<()> {
        if mode == BuildMode::Update || !self.descriptors.is_built() {
            return Ok(());
        }
        let Some((camera, light)) = self.uniforms else {
            return Ok(());
        };

        let declared_meshes = self
            .descriptors
            .declaration(Bindings::MESH_UNIFORMS)
            .map_or(0, |decl| decl.count);
        if declared_meshes as usize == self.blas.len() {
            let tlas = self.tlas.handle().ok_or_else(|| not_built("TLAS"))?;
            self.descriptors
                .bind_acceleration_structure(Bindings::TLAS, tlas);
            self.descriptors.update_set_contents(self.device);
            return Ok(());
        }

        tracing::debug!(
            "Mesh count changed from {declared_meshes} to {}, recreating the descriptor set",
            self.blas.len()
        );
        self.create_descriptor_set(&camera, &light)?;
        if let Some(config) = self.pipeline_config.clone() {
            self.create_pipeline(&config)?;
        }
        Ok(())
    }

    /// Declare, create and fill the descriptor set, replacing any previous one.
    ///
    /// Needs a built top-level structure. A pipeline created for the previous
    /// set has to be recreated.
    pub fn create_descriptor_set(
        &mut self,
        camera: &DeviceBuffer,
        light: &DeviceBuffer,
    ) -> Result<()> {
        let tlas = self.tlas.handle().ok_or_else(|| not_built("TLAS"))?;
        std::mem::take(&mut self.descriptors).destroy(self.device);
        self.uniforms = Some((*camera, *light));
        let mesh_count = self.blas.len() as u32;
        let texture_count = self.texture_capacity.max(self.textures.len() as u32);

        let set = &mut self.descriptors;
        set.declare(
            Bindings::TLAS,
            1,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            RGEN | CHIT,
        );
        set.declare(
            Bindings::RENDER_TARGET,
            1,
            vk::DescriptorType::STORAGE_IMAGE,
            RGEN,
        );
        set.declare(
            Bindings::CAMERA,
            1,
            vk::DescriptorType::UNIFORM_BUFFER,
            RGEN | CHIT | MISS,
        );
        set.declare(
            Bindings::MESH_UNIFORMS,
            mesh_count,
            vk::DescriptorType::STORAGE_BUFFER,
            RGEN | CHIT,
        );
        set.declare(
            Bindings::MESH_VERTICES,
            mesh_count,
            vk::DescriptorType::STORAGE_BUFFER,
            RGEN | CHIT,
        );
        set.declare(
            Bindings::MESH_INDICES,
            mesh_count,
            vk::DescriptorType::STORAGE_BUFFER,
            CHIT,
        );
        set.declare(
            Bindings::TEXTURES,
            texture_count,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            RGEN | CHIT | MISS,
        );
        set.declare(
            Bindings::LIGHT,
            1,
            vk::DescriptorType::UNIFORM_BUFFER,
            RGEN | CHIT | MISS,
        );
        set.build(self.device)?;

        set.bind_acceleration_structure(Bindings::TLAS, tlas);
        if let Some(view) = self.render_target {
            set.bind_storage_image(Bindings::RENDER_TARGET, view);
        }
        set.bind_uniform_buffer(Bindings::CAMERA, camera);
        if mesh_count > 0 {
            set.bind_meshes(
                Bindings::MESH_UNIFORMS,
                Bindings::MESH_VERTICES,
                Bindings::MESH_INDICES,
                self.blas.meshes(),
            );
        }
        if texture_count > 0 {
            set.bind_textures(
                Bindings::TEXTURES,
                self.textures.iter().map(Texture::descriptor_info).collect(),
            );
        }
        set.bind_uniform_buffer(Bindings::LIGHT, light);
        set.update_set_contents(self.device);

        tracing::info!(
            "Ray tracing descriptor set created: {mesh_count} meshes, {texture_count} texture slots"
        );
        Ok(())
    }

    /// Point the storage image binding at `view`, e.g. after a resize.
    ///
    /// The caller must make sure no submitted frame still uses the set.
    pub fn set_render_target(&mut self, view: vk::ImageView) {
        self.render_target = Some(view);
        if self.descriptors.is_built() {
            self.descriptors
                .bind_storage_image(Bindings::RENDER_TARGET, view);
            self.descriptors.update_set_contents(self.device);
        }
    }

    /// Load the shaders named by `config` and create the pipeline and its
    /// shader binding table. Replaces any previous pipeline.
    pub fn create_pipeline(&mut self, config: &RayTracerConfig) -> Result<()> {
        let layout = self
            .descriptors
            .layout()
            .ok_or_else(|| not_built("Descriptor set"))?;

        let mut builder = RayPipelineBuilder::new(self.device);
        builder.add_raygen_shader(config.raygen_shader.clone())?;
        for miss in &config.miss_shaders {
            builder.add_miss_shader(miss.clone())?;
        }
        for group in &config.hit_groups {
            builder.add_hit_group(
                group.closest_hit.clone(),
                group.any_hit.clone().map(ShaderSource::File),
                group.intersection.clone().map(ShaderSource::File),
            )?;
        }
        for callable in &config.callable_shaders {
            builder.add_callable_shader(callable.clone())?;
        }
        let pipeline = builder.create(&[layout], &[], config.max_recursion_depth)?;

        if let Some(old) = self.pipeline.replace(pipeline) {
            old.destroy(self.device);
        }
        self.pipeline_config = Some(config.clone());
        Ok(())
    }

    /// Bind the descriptor set for ray tracing on `cmd`.
    pub fn bind_descriptor_set(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let pipeline = self.pipeline()?;
        let set = self
            .descriptors
            .set()
            .ok_or_else(|| not_built("Descriptor set"))?;
        self.device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline.layout(),
            0,
            &[set],
        );
        Ok(())
    }

    /// Bind the pipeline and trace one ray per pixel of `extent`.
    pub fn trace_rays(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) -> Result<()> {
        self.pipeline()?.trace_rays(self.device, cmd, extent);
        Ok(())
    }

    fn pipeline(&self) -> Result<&RayPipeline> {
        self.pipeline.as_ref().ok_or_else(|| {
            GpuError::InvalidState("Ray tracing pipeline has not been created".to_string())
        })
    }

    fn texture_infos(&self) -> Vec<vk::DescriptorImageInfo> {
        self.textures.iter().map(Texture::descriptor_info).collect()
    }

    pub fn blas(&self) -> &BlasBuilder {
        &self.blas
    }

    pub fn tlas(&self) -> &TlasBuilder {
        &self.tlas
    }

    pub fn descriptors(&self) -> &RayDescriptorSet {
        &self.descriptors
    }

    pub fn ray_pipeline(&self) -> Option<&RayPipeline> {
        self.pipeline.as_ref()
    }

    /// The one-shot submission helper, for work recorded around a trace.
    pub fn commands(&self) -> &OneShotCommands {
        &self.commands
    }

    /// Release everything. The device must be idle.
    pub fn destroy(mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(self.device);
        }
        self.descriptors.destroy(self.device);
        self.tlas.destroy(self.device);
        self.blas.destroy(self.device);
        self.commands.destroy(self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HitGroupConfig;
    use ash::vk::Handle;
    use vkray_test::MockDevice;

    #[test]
    fn descriptor_set_needs_a_tlas() {
        let device = MockDevice::new();
        let mut tracer = RayTracer::new(&device, 0).unwrap();
        let buffer = DeviceBuffer {
            buffer: vk::Buffer::null(),
            size: 0,
            device_address: 0,
            location: vkray_gpu::MemoryLocation::CpuToGpu,
        };

        let result = tracer.create_descriptor_set(&buffer, &buffer);

        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        tracer.destroy();
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn pipeline_needs_a_descriptor_set() {
        let device = MockDevice::new();
        let mut tracer = RayTracer::new(&device, 0).unwrap();
        let config = RayTracerConfig::default().with_hit_groups([HitGroupConfig::new("x.spv")]);

        let result = tracer.create_pipeline(&config);

        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        assert_eq!(device.live_shader_modules(), 0);
        tracer.destroy();
    }

    #[test]
    fn tracing_without_pipeline_is_an_error() {
        let device = MockDevice::new();
        let tracer = RayTracer::new(&device, 0).unwrap();

        let result = tracer.trace_rays(vk::CommandBuffer::null(), vk::Extent2D::default());

        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        tracer.destroy();
    }

    #[test]
    fn texture_indices_are_sequential() {
        let device = MockDevice::new();
        let mut tracer = RayTracer::new(&device, 0).unwrap();
        let texture = Texture::new(vk::ImageView::null(), vk::Sampler::null());

        assert_eq!(tracer.add_texture(texture), 0);
        assert_eq!(tracer.add_texture(texture), 1);
        tracer.update_texture(1, texture);
        tracer.destroy();
    }

    #[test]
    #[should_panic(expected = "Texture 3 out of range")]
    fn updating_unknown_texture_panics() {
        let device = MockDevice::new();
        let mut tracer = RayTracer::new(&device, 0).unwrap();
        tracer.update_texture(3, Texture::new(vk::ImageView::null(), vk::Sampler::null()));
    }
}
