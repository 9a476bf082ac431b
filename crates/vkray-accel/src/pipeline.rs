//! Ray tracing pipeline creation.

use crate::sbt::{SbtBuilder, ShaderBindingTable, ShaderGroupKind};
use ash::vk;
use std::path::PathBuf;
use vkray_gpu::{GpuError, RayTracingDevice, Result};

/// Entry point of every stage.
const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Where a shader's SPIR-V comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    /// A compiled `.spv` file on disk.
    File(PathBuf),
    /// SPIR-V words already in memory.
    Spirv(Vec<u32>),
}

impl ShaderSource {
    /// Read the SPIR-V words.
    pub fn load(&self) -> Result<Vec<u32>> {
        match self {
            Self::Spirv(words) => Ok(words.clone()),
            Self::File(path) => {
                let mut file = std::fs::File::open(path)
                    .map_err(|e| GpuError::ShaderLoad(format!("{}: {e}", path.display())))?;
                ash::util::read_spv(&mut file)
                    .map_err(|e| GpuError::ShaderLoad(format!("{}: {e}", path.display())))
            }
        }
    }
}

impl From<PathBuf> for ShaderSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&str> for ShaderSource {
    fn from(path: &str) -> Self {
        Self::File(PathBuf::from(path))
    }
}

impl From<Vec<u32>> for ShaderSource {
    fn from(words: Vec<u32>) -> Self {
        Self::Spirv(words)
    }
}

/// Collects shader stages and groups for one ray tracing pipeline.
///
/// Groups must be added in shader binding table order. Shader modules are
/// released when the builder is dropped, whether or not a pipeline was created.
pub struct RayPipelineBuilder<'a> {
    device: &'a dyn RayTracingDevice,
    stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>>,
    sbt: SbtBuilder,
}

impl<'a> RayPipelineBuilder<'a> {
    pub fn new(device: &'a dyn RayTracingDevice) -> Self {
        Self {
            device,
            stages: Vec::new(),
            groups: Vec::new(),
            sbt: SbtBuilder::new(),
        }
    }

    /// Add the ray generation shader. Must be the first group.
    pub fn add_raygen_shader(&mut self, source: impl Into<ShaderSource>) -> Result<u32> {
        self.add_general(ShaderGroupKind::RayGen, vk::ShaderStageFlags::RAYGEN_KHR, source.into())
    }

    /// Add a miss shader. Miss shaders come after the raygen shader and before any hit group.
    pub fn add_miss_shader(&mut self, source: impl Into<ShaderSource>) -> Result<u32> {
        self.add_general(ShaderGroupKind::Miss, vk::ShaderStageFlags::MISS_KHR, source.into())
    }

    /// Add a callable shader. Callables come after at least one hit group.
    pub fn add_callable_shader(&mut self, source: impl Into<ShaderSource>) -> Result<u32> {
        self.add_general(
            ShaderGroupKind::Callable,
            vk::ShaderStageFlags::CALLABLE_KHR,
            source.into(),
        )
    }

    /// Add a hit group.
    ///
    /// Groups with an intersection shader are procedural, all others are
    /// triangle hit groups.
    pub fn add_hit_group(
        &mut self,
        closest_hit: impl Into<ShaderSource>,
        any_hit: Option<ShaderSource>,
        intersection: Option<ShaderSource>,
    ) -> Result<u32> {
        self.sbt.assert_can_add(ShaderGroupKind::HitGroup);

        let closest = self.add_stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, &closest_hit.into())?;
        let any = any_hit
            .map(|s| self.add_stage(vk::ShaderStageFlags::ANY_HIT_KHR, &s))
            .transpose()?;
        let ty = if intersection.is_some() {
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
        } else {
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        };
        let intersection = intersection
            .map(|s| self.add_stage(vk::ShaderStageFlags::INTERSECTION_KHR, &s))
            .transpose()?;

        self.groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(ty)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(closest)
                .any_hit_shader(any.unwrap_or(vk::SHADER_UNUSED_KHR))
                .intersection_shader(intersection.unwrap_or(vk::SHADER_UNUSED_KHR)),
        );
        Ok(self.sbt.add(ShaderGroupKind::HitGroup))
    }

    /// Shader binding table bookkeeping for the groups added so far.
    pub fn sbt(&self) -> &SbtBuilder {
        &self.sbt
    }

    fn add_general(
        &mut self,
        kind: ShaderGroupKind,
        stage: vk::ShaderStageFlags,
        source: ShaderSource,
    ) -> Result<u32> {
        self.sbt.assert_can_add(kind);
        let index = self.add_stage(stage, &source)?;
        self.groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(index)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        );
        Ok(self.sbt.add(kind))
    }

    fn add_stage(&mut self, stage: vk::ShaderStageFlags, source: &ShaderSource) -> Result<u32> {
        let code = source.load()?;
        let module = self.device.create_shader_module(&code)?;
        self.stages.push((stage, module));
        Ok(self.stages.len() as u32 - 1)
    }

    /// Create the pipeline layout, the pipeline and its shader binding table.
    ///
    /// `max_recursion_depth` is clamped to the device limit.
    ///
    /// # Panics
    /// Unless exactly one raygen shader, at least one miss shader and at
    /// least one hit group were added.
    pub fn create(
        self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
        max_recursion_depth: u32,
    ) -> Result<RayPipeline> {
        let counts = self.sbt.counts();
        assert_eq!(counts.raygen, 1, "No raygen shader was added");
        assert!(counts.miss >= 1, "No miss shaders were added");
        assert!(counts.hit >= 1, "No hit groups were added");

        let device_max = self.device.ray_tracing_properties().max_ray_recursion_depth;
        let depth = if max_recursion_depth > device_max {
            tracing::warn!(
                "Requested ray recursion depth {max_recursion_depth} exceeds device limit {device_max}, clamping"
            );
            device_max
        } else {
            max_recursion_depth
        };

        let layout = self
            .device
            .create_pipeline_layout(set_layouts, push_constant_ranges)?;

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = self
            .stages
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
            })
            .collect();
        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stage_infos)
            .groups(&self.groups)
            .max_pipeline_ray_recursion_depth(depth)
            .layout(layout);

        let pipeline = match self.device.create_ray_tracing_pipeline(&create_info) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };

        let sbt = match self.sbt.create(self.device, pipeline) {
            Ok(sbt) => sbt,
            Err(e) => {
                self.device.destroy_pipeline(pipeline);
                self.device.destroy_pipeline_layout(layout);
                return Err(e);
            }
        };

        tracing::info!(
            "Ray tracing pipeline created: {} stages, {} groups, recursion depth {depth}",
            self.stages.len(),
            self.groups.len()
        );

        Ok(RayPipeline {
            pipeline,
            layout,
            sbt,
            max_recursion_depth: depth,
        })
    }
}

impl Drop for RayPipelineBuilder<'_> {
    fn drop(&mut self) {
        for (_, module) in self.stages.drain(..) {
            self.device.destroy_shader_module(module);
        }
    }
}

/// A ray tracing pipeline, its layout and its shader binding table.
#[derive(Debug)]
pub struct RayPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    sbt: ShaderBindingTable,
    max_recursion_depth: u32,
}

impl RayPipeline {
    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    /// Recursion depth the pipeline was created with, after clamping.
    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    /// Bind the pipeline and trace `extent` rays.
    pub fn trace_rays(
        &self,
        device: &dyn RayTracingDevice,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
    ) {
        self.sbt.dispatch(device, cmd, extent);
    }

    pub fn destroy(self, device: &dyn RayTracingDevice) {
        self.sbt.destroy(device);
        device.destroy_pipeline(self.pipeline);
        device.destroy_pipeline_layout(self.layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkray_test::fixtures::spirv_stub;
    use vkray_test::{Call, MockDevice};

    fn stub() -> ShaderSource {
        ShaderSource::Spirv(spirv_stub())
    }

    type RecordedPipeline = (
        Vec<vk::ShaderStageFlags>,
        Vec<vk::RayTracingShaderGroupTypeKHR>,
        u32,
    );

    fn recorded_pipeline(device: &MockDevice) -> RecordedPipeline {
        device
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::CreatePipeline {
                    stages,
                    groups,
                    max_recursion_depth,
                } => Some((stages, groups, max_recursion_depth)),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn stages_and_groups_follow_registration_order() {
        let device = MockDevice::new();
        let mut builder = RayPipelineBuilder::new(&device);
        assert_eq!(builder.add_raygen_shader(stub()).unwrap(), 0);
        assert_eq!(builder.add_miss_shader(stub()).unwrap(), 1);
        assert_eq!(builder.add_hit_group(stub(), Some(stub()), None).unwrap(), 2);
        assert_eq!(builder.add_hit_group(stub(), None, Some(stub())).unwrap(), 3);
        assert_eq!(builder.add_callable_shader(stub()).unwrap(), 4);

        let pipeline = builder.create(&[], &[], 2).unwrap();

        let (stages, groups, depth) = recorded_pipeline(&device);
        assert_eq!(
            stages,
            vec![
                vk::ShaderStageFlags::RAYGEN_KHR,
                vk::ShaderStageFlags::MISS_KHR,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                vk::ShaderStageFlags::ANY_HIT_KHR,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                vk::ShaderStageFlags::INTERSECTION_KHR,
                vk::ShaderStageFlags::CALLABLE_KHR,
            ]
        );
        assert_eq!(
            groups,
            vec![
                vk::RayTracingShaderGroupTypeKHR::GENERAL,
                vk::RayTracingShaderGroupTypeKHR::GENERAL,
                vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
                vk::RayTracingShaderGroupTypeKHR::GENERAL,
            ]
        );
        assert_eq!(depth, 2);
        assert_eq!(pipeline.sbt().layout().callable.count, 1);

        // Modules are released once the pipeline exists.
        assert_eq!(device.live_shader_modules(), 0);
        pipeline.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn recursion_depth_is_clamped() {
        let device = MockDevice::new();
        let mut builder = RayPipelineBuilder::new(&device);
        builder.add_raygen_shader(stub()).unwrap();
        builder.add_miss_shader(stub()).unwrap();
        builder.add_hit_group(stub(), None, None).unwrap();

        let pipeline = builder.create(&[], &[], 100).unwrap();

        let limit = device.ray_tracing_properties().max_ray_recursion_depth;
        assert_eq!(pipeline.max_recursion_depth(), limit);
        assert_eq!(recorded_pipeline(&device).2, limit);
        pipeline.destroy(&device);
    }

    #[test]
    fn failed_creation_releases_everything() {
        let device = MockDevice::new();
        device.fail_pipeline_creation();
        let mut builder = RayPipelineBuilder::new(&device);
        builder.add_raygen_shader(stub()).unwrap();
        builder.add_miss_shader(stub()).unwrap();
        builder.add_hit_group(stub(), None, None).unwrap();

        let result = builder.create(&[], &[], 1);

        assert!(matches!(result, Err(GpuError::PipelineCreation(_))));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn missing_file_is_a_shader_load_error() {
        let device = MockDevice::new();
        let mut builder = RayPipelineBuilder::new(&device);

        let result = builder.add_raygen_shader("does/not/exist.rgen.spv");

        match result {
            Err(GpuError::ShaderLoad(message)) => assert!(message.contains("exist.rgen.spv")),
            other => panic!("expected a shader load error, got {other:?}"),
        }
        assert_eq!(builder.sbt().counts().total(), 0);
    }

    #[test]
    fn spirv_file_is_loaded() {
        let path = std::env::temp_dir().join(format!("vkray-pipeline-{}.spv", std::process::id()));
        let bytes: Vec<u8> = spirv_stub().iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(&path, bytes).unwrap();

        let words = ShaderSource::from(path.clone()).load().unwrap();

        assert_eq!(words, spirv_stub());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    #[should_panic(expected = "The first shader must be the raygen shader")]
    fn order_is_checked_before_loading() {
        let device = MockDevice::new();
        let mut builder = RayPipelineBuilder::new(&device);
        let _ = builder.add_miss_shader("does/not/exist.rmiss.spv");
    }

    #[test]
    #[should_panic(expected = "No miss shaders were added")]
    fn pipeline_without_miss_shader_panics() {
        let device = MockDevice::new();
        let mut builder = RayPipelineBuilder::new(&device);
        builder.add_raygen_shader(stub()).unwrap();
        builder.add_hit_group(stub(), None, None).unwrap();
        let _ = builder.create(&[], &[], 1);
    }
}
