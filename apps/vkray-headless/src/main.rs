//! Headless ray tracing driver.
//!
//! Builds a ring of boxes over a ground plane, builds and compacts their
//! acceleration structures, then animates the boxes for a few frames,
//! refitting the top-level structure and tracing into an off-screen image
//! each frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vkray-headless -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--shaders <DIR>`: Directory containing `shaders/spirv/*.spv` (default: `$VKRAY_SHADER_DIR` or `.`)
//! - `--boxes <N>`: Number of boxes (default: 6)
//! - `--frames <N>`: Number of frames to trace (default: 4)
//! - `--size <W>x<H>`: Render target size (default: 1280x720)
//! - `--host-build`: Build the top-level structure on the host
//! - `--no-compact`: Skip bottom-level compaction
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `VKRAY_SHADER_DIR`: Default shader directory

mod scene;

use std::path::PathBuf;

use anyhow::Context;
use glam::Vec3;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vkray_accel::{MeshGeometry, RayTracer, RayTracerConfig};
use vkray_gpu::{
    vk, BufferDesc, DeviceBuffer, GpuContextBuilder, MemoryLocation, RayTracingDevice,
    VulkanDevice,
};

use crate::scene::MeshData;

/// Command line options.
#[derive(Debug, Clone)]
struct Options {
    shader_dir: PathBuf,
    boxes: usize,
    frames: u32,
    extent: vk::Extent2D,
    host_build: bool,
    compact: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            shader_dir: std::env::var_os("VKRAY_SHADER_DIR")
                .map_or_else(|| PathBuf::from("."), PathBuf::from),
            boxes: 6,
            frames: 4,
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            host_build: false,
            compact: true,
        }
    }
}

impl Options {
    fn from_args() -> Self {
        let mut options = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1);
            match args[i].as_str() {
                "--shaders" => {
                    if let Some(dir) = value {
                        options.shader_dir = PathBuf::from(dir);
                        i += 1;
                    }
                }
                "--boxes" => {
                    if let Some(Ok(n)) = value.map(|v| v.parse()) {
                        options.boxes = n;
                        i += 1;
                    }
                }
                "--frames" => {
                    if let Some(Ok(n)) = value.map(|v| v.parse()) {
                        options.frames = n;
                        i += 1;
                    }
                }
                "--size" => {
                    if let Some(extent) = value.and_then(|v| parse_size(v)) {
                        options.extent = extent;
                        i += 1;
                    }
                }
                "--host-build" => options.host_build = true,
                "--no-compact" => options.compact = false,
                other => warn!("Ignoring unknown argument {other}"),
            }
            i += 1;
        }

        options
    }
}

fn parse_size(value: &str) -> Option<vk::Extent2D> {
    let (width, height) = value.split_once('x')?;
    Some(vk::Extent2D {
        width: width.parse().ok()?,
        height: height.parse().ok()?,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let options = Options::from_args();
    info!("Options: {options:?}");

    let ctx = GpuContextBuilder::new()
        .app_name("vkray-headless")
        .validation(cfg!(debug_assertions))
        .build()
        .context("Failed to create GPU context")?;
    info!("{}", ctx.capabilities().summary());

    if !ctx.ray_tracing_enabled() {
        warn!("Hardware ray tracing is not available on this device; nothing to trace");
        return Ok(());
    }

    let device = ctx.ray_tracing_device()?;
    let result = run(&device, ctx.queue_family(), &options);
    ctx.wait_idle()?;
    result
}

fn run(device: &VulkanDevice, queue_family: u32, options: &Options) -> anyhow::Result<()> {
    let config = RayTracerConfig::default()
        .with_compaction(options.compact)
        .with_host_build(options.host_build)
        .with_shader_root(&options.shader_dir);

    let mut buffers = Vec::new();
    let mut tracer = RayTracer::new(device, queue_family)?;
    // Every submission waits on its fence, so nothing is in flight here.
    let traced = trace_scene(device, &mut tracer, &mut buffers, &config, options);

    tracer.destroy();
    for buffer in buffers {
        device.destroy_buffer(buffer);
    }
    traced
}

fn trace_scene(
    device: &VulkanDevice,
    tracer: &mut RayTracer<'_>,
    buffers: &mut Vec<DeviceBuffer>,
    config: &RayTracerConfig,
    options: &Options,
) -> anyhow::Result<()> {
    let extent = options.extent;

    let meshes: Vec<MeshData> = std::iter::once(scene::ground(20.0))
        .chain((0..options.boxes).map(|_| scene::cuboid(Vec3::splat(0.75))))
        .collect();
    for (i, mesh) in meshes.iter().enumerate() {
        let geometry = upload_mesh(device, buffers, mesh, i, meshes.len())?;
        tracer.add_mesh(geometry);
    }

    tracer.build_acceleration_structures(config.compact, config.host_build)?;
    info!(
        "Acceleration structures built: {} instances",
        tracer.tlas().instance_count()
    );

    let camera = upload(
        device,
        buffers,
        bytemuck::cast_slice(&scene::camera(extent.width, extent.height)),
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        "camera",
    )?;
    let light = upload(
        device,
        buffers,
        bytemuck::bytes_of(&scene::light()),
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        "light",
    )?;

    let mut target = device.create_image(
        extent,
        vk::Format::R8G8B8A8_UNORM,
        vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        "render_target",
    )?;
    tracer.set_render_target(target.view);

    let traced = (|| -> anyhow::Result<()> {
        tracer.create_descriptor_set(&camera, &light)?;
        tracer.create_pipeline(config)?;

        for frame in 0..options.frames {
            let spin = frame as f32 * 15.0;
            for b in 0..options.boxes {
                // Instance 0 is the ground plane.
                let transform = scene::orbit(b, options.boxes, 5.0, spin);
                tracer.update_instance(b + 1, &transform, true);
            }
            tracer.update_tlas()?;

            tracer.commands().run(device, |cmd| {
                let old_layout = if frame == 0 {
                    vk::ImageLayout::UNDEFINED
                } else {
                    vk::ImageLayout::GENERAL
                };
                device.cmd_transition_image(
                    cmd,
                    target.image,
                    old_layout,
                    vk::ImageLayout::GENERAL,
                );
                tracer.bind_descriptor_set(cmd)?;
                tracer.trace_rays(cmd, extent)
            })?;
            info!("Traced frame {frame} at {}x{}", extent.width, extent.height);
        }
        Ok(())
    })();

    device.destroy_image(&mut target)?;
    traced
}

fn upload_mesh(
    device: &VulkanDevice,
    buffers: &mut Vec<DeviceBuffer>,
    mesh: &MeshData,
    index: usize,
    count: usize,
) -> anyhow::Result<MeshGeometry> {
    let usage = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::STORAGE_BUFFER;
    let vertices = upload(device, buffers, mesh.vertex_bytes(), usage, "mesh_vertices")?;
    let indices = upload(device, buffers, mesh.index_bytes(), usage, "mesh_indices")?;
    let uniform = upload(
        device,
        buffers,
        bytemuck::bytes_of(&scene::mesh_uniform(index, count)),
        vk::BufferUsageFlags::STORAGE_BUFFER,
        "mesh_uniform",
    )?;

    Ok(MeshGeometry::new(
        vertices,
        mesh.positions.len() as u32,
        12,
        indices,
        mesh.indices.len() as u32,
        uniform,
    ))
}

fn upload(
    device: &VulkanDevice,
    buffers: &mut Vec<DeviceBuffer>,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> anyhow::Result<DeviceBuffer> {
    let buffer = device.create_buffer(&BufferDesc::new(
        data.len() as u64,
        usage,
        MemoryLocation::CpuToGpu,
        name,
    ))?;
    buffers.push(buffer);
    device
        .write_buffer(&buffer, 0, data)
        .with_context(|| format!("Failed to upload {name}"))?;
    Ok(buffer)
}

fn print_help() {
    eprintln!(
        "vkray headless ray tracer

USAGE:
    cargo run -p vkray-headless -- [OPTIONS]

OPTIONS:
    --shaders <DIR>     Directory containing shaders/spirv/*.spv
                        Default: $VKRAY_SHADER_DIR or .
    --boxes <N>         Number of boxes (default: 6)
    --frames <N>        Number of frames to trace (default: 4)
    --size <W>x<H>      Render target size (default: 1280x720)
    --host-build        Build the top-level structure on the host
    --no-compact        Skip bottom-level compaction
    -h, --help          Print this help message

ENVIRONMENT:
    RUST_LOG            Log level (e.g., info, debug, trace)
    VKRAY_SHADER_DIR    Default shader directory"
    );
}
