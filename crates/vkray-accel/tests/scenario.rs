//! End-to-end scenarios against the recording device.

use std::path::PathBuf;

use vkray_accel::{
    Bindings, BottomStructure, BuildMode, HitGroupConfig, MeshGeometry, RayPipelineBuilder,
    RayTracer, RayTracerConfig, ShaderSource, StagedWrite,
};
use vkray_core::rotate_y_degrees;
use vkray_gpu::vk::{self, Handle};
use vkray_gpu::{BufferDesc, DeviceBuffer, GpuError, MemoryLocation, RayTracingDevice};
use vkray_test::fixtures::{quad_buffers, spirv_stub};
use vkray_test::mock::{handle_byte, structure_size};
use vkray_test::{Call, MockDevice};

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 640,
    height: 480,
};

/// Buffers created by a scene, destroyed together at the end of a test.
struct Scene {
    buffers: Vec<DeviceBuffer>,
}

impl Scene {
    fn new() -> Self {
        Self {
            buffers: Vec::new(),
        }
    }

    fn add_quads(&mut self, device: &MockDevice, tracer: &mut RayTracer<'_>, count: usize) {
        for _ in 0..count {
            let (vbo, ibo) = quad_buffers(device);
            tracer
                .add_mesh(MeshGeometry::new(vbo, 4, 12, ibo, 6, vbo))
                .unwrap();
            self.buffers.extend([vbo, ibo]);
        }
    }

    fn uniform(&mut self, device: &MockDevice, name: &str) -> DeviceBuffer {
        let buffer = device
            .create_buffer(&BufferDesc::new(
                256,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                name,
            ))
            .unwrap();
        self.buffers.push(buffer);
        buffer
    }

    fn destroy(self, device: &MockDevice) {
        for buffer in self.buffers {
            device.destroy_buffer(buffer);
        }
    }
}

/// Write stub SPIR-V files for one raygen, two miss and two closest-hit
/// shaders and return a config pointing at them.
fn shader_config(test: &str) -> (RayTracerConfig, PathBuf) {
    let root = std::env::temp_dir().join(format!("vkray-{test}-{}", std::process::id()));
    std::fs::create_dir_all(&root).unwrap();
    let bytes: Vec<u8> = spirv_stub().iter().flat_map(|w| w.to_le_bytes()).collect();
    let names = [
        "rt.rgen.spv",
        "rt.rmiss.spv",
        "rt.shadow.rmiss.spv",
        "rt.rchit.spv",
        "rt.2.rchit.spv",
    ];
    for name in names {
        std::fs::write(root.join(name), &bytes).unwrap();
    }

    let config = RayTracerConfig::default()
        .with_raygen_shader("rt.rgen.spv")
        .with_miss_shaders(["rt.rmiss.spv", "rt.shadow.rmiss.spv"])
        .with_hit_groups([
            HitGroupConfig::new("rt.rchit.spv"),
            HitGroupConfig::new("rt.2.rchit.spv"),
        ])
        .with_shader_root(&root);
    (config, root)
}

#[test]
fn three_meshes_build_compact_and_refit() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 3);

    assert!(tracer.tlas().structure().is_none());
    assert!(tracer.tlas().is_first_build());

    assert_eq!(
        tracer.build_acceleration_structures(true, false).unwrap(),
        BuildMode::Build
    );

    assert!(tracer.tlas().structure().is_some());
    assert!(!tracer.tlas().is_first_build());
    assert_eq!(tracer.tlas().instance_count(), 3);
    for (i, instance) in tracer.tlas().instances().iter().enumerate() {
        assert_eq!(instance.custom_index, i as u32);
    }
    for slot in tracer.blas().structures() {
        match slot {
            BottomStructure::Compacted {
                structure,
                original_size,
            } => {
                assert_eq!(*original_size, structure_size(2));
                assert!(structure.size <= *original_size);
            }
            other => panic!("expected a compacted structure, got {other:?}"),
        }
    }

    tracer.update_instance(1, &rotate_y_degrees(30.0), true);
    assert_eq!(tracer.update_tlas().unwrap(), BuildMode::Update);
    assert!(!tracer.tlas().is_first_build());

    let tlas_builds: Vec<_> = device
        .builds()
        .into_iter()
        .filter(|b| b.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .collect();
    assert_eq!(tlas_builds.len(), 2);
    assert_eq!(tlas_builds[1].src, tlas_builds[1].dst);

    tracer.destroy();
    scene.destroy(&device);
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn instance_references_follow_compaction() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 2);

    tracer.build_acceleration_structures(true, false).unwrap();

    let expected: Vec<u64> = tracer
        .blas()
        .structures()
        .iter()
        .map(|s| s.structure().unwrap().buffer.device_address)
        .collect();
    let build = device.builds().pop().unwrap();
    assert_eq!(build.ty, vk::AccelerationStructureTypeKHR::TOP_LEVEL);
    assert_eq!(build.instance_references, expected);

    tracer.destroy();
    scene.destroy(&device);
}

#[test]
fn sbt_decodes_to_registered_handles() {
    let device = MockDevice::new();
    let stub = || ShaderSource::Spirv(spirv_stub());
    let mut builder = RayPipelineBuilder::new(&device);
    builder.add_raygen_shader(stub()).unwrap();
    for _ in 0..3 {
        builder.add_miss_shader(stub()).unwrap();
    }
    builder.add_hit_group(stub(), None, None).unwrap();
    builder.add_hit_group(stub(), Some(stub()), None).unwrap();
    builder.add_callable_shader(stub()).unwrap();
    let pipeline = builder.create(&[], &[], 1).unwrap();

    let sbt = pipeline.sbt();
    let data = device.buffer_data(sbt.buffer());
    let base = sbt.buffer().device_address;
    let handle_size = device.ray_tracing_properties().shader_group_handle_size as usize;
    let counts = [1u32, 3, 2, 1];

    let mut group = 0u32;
    for (region, count) in sbt.regions().iter().zip(counts) {
        assert_ne!(region.device_address, 0);
        for n in 0..count {
            let at = (region.device_address - base + u64::from(n) * region.stride) as usize;
            let record = &data[at..at + handle_size];
            assert!(
                record.iter().all(|&b| b == handle_byte(group)),
                "record {n} of region at {:#x} does not hold group {group}",
                region.device_address
            );
            group += 1;
        }
    }
    assert_eq!(group, 7);

    pipeline.destroy(&device);
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn instance_update_leaves_other_instances_untouched() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 3);
    tracer.build_acceleration_structures(false, false).unwrap();
    let before = tracer.tlas().instances().to_vec();

    tracer.update_instance(1, &rotate_y_degrees(30.0), false);

    let after = tracer.tlas().instances();
    assert_eq!(before[0], after[0]);
    assert_eq!(before[2], after[2]);
    assert_eq!(before[1].custom_index, after[1].custom_index);
    assert_eq!(before[1].hit_group, after[1].hit_group);
    assert_eq!(before[1].mesh, after[1].mesh);
    assert_ne!(before[1].transform, after[1].transform);
    assert!(!after[1].is_visible());

    tracer.destroy();
    scene.destroy(&device);
}

#[test]
fn host_build_without_support_is_reported() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 1);

    let result = tracer.build_acceleration_structures(true, true);

    assert!(matches!(result, Err(GpuError::ExtensionNotSupported(_))));
    assert!(tracer.tlas().structure().is_none());
    tracer.destroy();
    scene.destroy(&device);
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn host_build_refits_on_the_host() {
    let device = MockDevice::new().with_host_build(true);
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 2);

    assert_eq!(
        tracer.build_acceleration_structures(true, true).unwrap(),
        BuildMode::Build
    );
    let submits = device.submit_count();
    tracer.update_instance(0, &rotate_y_degrees(90.0), true);
    assert_eq!(tracer.update_tlas().unwrap(), BuildMode::Update);

    assert_eq!(device.submit_count(), submits);
    let build = device.builds().pop().unwrap();
    assert_eq!(build.cmd, None);
    assert_eq!(build.mode, vk::BuildAccelerationStructureModeKHR::UPDATE);

    // Instances of a host build may only reference host-visible structures.
    for slot in tracer.blas().structures() {
        let structure = slot.structure().unwrap();
        assert_eq!(structure.buffer.location, MemoryLocation::CpuToGpu);
    }

    tracer.destroy();
    scene.destroy(&device);
}

#[test]
fn compacted_structures_are_visible_to_the_tlas_build() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 2);

    tracer.build_acceleration_structures(true, false).unwrap();

    let calls = device.calls();
    let last_copy = calls
        .iter()
        .rposition(|c| matches!(c, Call::Copy { .. }))
        .unwrap();
    let tlas_build = calls
        .iter()
        .position(|c| {
            matches!(c, Call::Build(build)
                if build.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        })
        .unwrap();
    let barriers = calls[last_copy..tlas_build]
        .iter()
        .filter(|c| {
            matches!(c, Call::Barrier { src, dst }
                if src.1 == vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR
                    && dst.1 == vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR)
        })
        .count();
    assert!(barriers >= 1);

    tracer.destroy();
    scene.destroy(&device);
}

#[test]
fn growing_the_scene_rebinds_the_descriptor_set() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 2);
    let camera = scene.uniform(&device, "camera");
    let light = scene.uniform(&device, "light");
    let (config, root) = shader_config("grow");

    tracer.build_acceleration_structures(true, false).unwrap();
    tracer.set_render_target(vk::ImageView::from_raw(0x77));
    tracer.create_descriptor_set(&camera, &light).unwrap();
    tracer.create_pipeline(&config).unwrap();

    scene.add_quads(&device, &mut tracer, 1);
    assert_eq!(
        tracer.build_acceleration_structures(true, false).unwrap(),
        BuildMode::Build
    );

    let live_tlas = tracer.tlas().handle().unwrap();
    let Some(StagedWrite::AccelerationStructures(staged)) =
        tracer.descriptors().staged(Bindings::TLAS)
    else {
        panic!("binding 0 should hold the TLAS");
    };
    assert_eq!(staged, &vec![live_tlas]);
    assert!(device.structure_alive(staged[0]));
    let meshes = tracer.descriptors().declaration(Bindings::MESH_UNIFORMS).unwrap();
    assert_eq!(meshes.count, 3);
    assert_eq!(device.live_pipelines(), 1);

    // The new pipeline is laid out for the new set.
    device.clear_calls();
    tracer
        .commands()
        .run(&device, |cmd| {
            tracer.bind_descriptor_set(cmd)?;
            tracer.trace_rays(cmd, EXTENT)
        })
        .unwrap();
    let set = tracer.descriptors().set().unwrap();
    assert!(device
        .calls()
        .contains(&Call::BindDescriptorSets { sets: vec![set] }));

    tracer.destroy();
    scene.destroy(&device);
    assert_eq!(device.live_objects(), 0);
    std::fs::remove_dir_all(root).unwrap();
}

#[test]
fn frame_is_traced_end_to_end() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 3);
    let camera = scene.uniform(&device, "camera");
    let light = scene.uniform(&device, "light");
    let (config, root) = shader_config("frame");

    tracer.build_acceleration_structures(true, false).unwrap();
    tracer.set_render_target(vk::ImageView::from_raw(0x77));
    tracer.create_descriptor_set(&camera, &light).unwrap();
    tracer.create_pipeline(&config).unwrap();
    device.clear_calls();

    tracer
        .commands()
        .run(&device, |cmd| {
            tracer.bind_descriptor_set(cmd)?;
            tracer.trace_rays(cmd, EXTENT)
        })
        .unwrap();

    let calls = device.calls();
    let set = tracer.descriptors().set().unwrap();
    assert!(calls.contains(&Call::BindDescriptorSets { sets: vec![set] }));
    assert!(calls.contains(&Call::BindPipeline {
        bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
        pipeline: tracer.ray_pipeline().unwrap().pipeline(),
    }));
    let trace = calls
        .iter()
        .find_map(|c| match c {
            Call::TraceRays { regions, extent } => Some((*regions, *extent)),
            _ => None,
        })
        .unwrap();
    assert_eq!(trace.1, (640, 480, 1));
    let [raygen, miss, hit, callable] = trace.0;
    assert_eq!(raygen.1, raygen.2);
    assert_ne!(miss.0, 0);
    assert_ne!(hit.0, 0);
    assert_eq!(callable, (0, 0, 0));

    tracer.destroy();
    scene.destroy(&device);
    assert_eq!(device.live_objects(), 0);
    std::fs::remove_dir_all(root).unwrap();
}

#[test]
fn descriptor_set_holds_the_scene() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 3);
    let camera = scene.uniform(&device, "camera");
    let light = scene.uniform(&device, "light");
    tracer.build_acceleration_structures(true, false).unwrap();
    tracer.set_texture_capacity(4);
    tracer.set_render_target(vk::ImageView::from_raw(1));

    tracer.create_descriptor_set(&camera, &light).unwrap();

    let updates: Vec<_> = device
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::UpdateDescriptorSets(writes) => Some(writes),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 1);
    let bound: Vec<(u32, u32)> = updates[0].iter().map(|w| (w.binding, w.count)).collect();
    // No textures were added, so the texture array stays unbound.
    assert_eq!(bound, vec![(0, 1), (1, 1), (2, 1), (3, 3), (4, 3), (5, 3), (7, 1)]);

    // Swapping the render target rewrites the set once, without duplicates.
    device.clear_calls();
    tracer.set_render_target(vk::ImageView::from_raw(2));
    let updates: Vec<_> = device
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::UpdateDescriptorSets(writes) => Some(writes),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].iter().filter(|w| w.binding == 1).count(), 1);

    tracer.destroy();
    scene.destroy(&device);
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn failed_pipeline_releases_shader_modules() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 1);
    let camera = scene.uniform(&device, "camera");
    let (config, root) = shader_config("failed-pipeline");
    tracer.build_acceleration_structures(false, false).unwrap();
    tracer.create_descriptor_set(&camera, &camera).unwrap();

    device.fail_pipeline_creation();
    let result = tracer.create_pipeline(&config);

    assert!(matches!(result, Err(GpuError::PipelineCreation(_))));
    assert_eq!(device.live_shader_modules(), 0);
    assert!(tracer.ray_pipeline().is_none());

    tracer.destroy();
    scene.destroy(&device);
    assert_eq!(device.live_objects(), 0);
    std::fs::remove_dir_all(root).unwrap();
}

#[test]
#[should_panic(expected = "No miss shaders were added")]
fn pipeline_without_miss_shaders_panics() {
    let device = MockDevice::new();
    let mut tracer = RayTracer::new(&device, 0).unwrap();
    let mut scene = Scene::new();
    scene.add_quads(&device, &mut tracer, 1);
    let camera = scene.uniform(&device, "camera");
    let (config, _root) = shader_config("no-miss");
    tracer.build_acceleration_structures(false, false).unwrap();
    tracer.create_descriptor_set(&camera, &camera).unwrap();

    let config = config.with_miss_shaders(Vec::<PathBuf>::new());
    let _ = tracer.create_pipeline(&config);
}
