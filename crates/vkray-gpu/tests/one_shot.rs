//! One-shot submission against the mock device.

use vkray_gpu::{vk, GpuError, OneShotCommands, RayTracingDevice};
use vkray_test::{Call, MockDevice};

#[test]
fn submit_waits_and_frees() {
    let device = MockDevice::new();
    let commands = OneShotCommands::new(&device, 0).unwrap();

    let scoped = commands.begin(&device).unwrap();
    assert_eq!(device.live_command_buffers(), 1);
    scoped.submit().unwrap();

    assert_eq!(device.submit_count(), 1);
    assert_eq!(device.count(|c| matches!(c, Call::WaitFence)), 1);
    assert_eq!(device.live_command_buffers(), 0);

    commands.destroy(&device);
    assert_eq!(device.live_objects(), 0);
}

#[test]
fn dropped_guard_still_submits() {
    let device = MockDevice::new();
    let commands = OneShotCommands::new(&device, 0).unwrap();

    {
        let _scoped = commands.begin(&device).unwrap();
    }

    assert_eq!(device.submit_count(), 1);
    assert_eq!(device.live_command_buffers(), 0);
    commands.destroy(&device);
}

#[test]
fn run_submits_on_the_error_path() {
    let device = MockDevice::new();
    let commands = OneShotCommands::new(&device, 0).unwrap();

    let pool = device
        .create_query_pool(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR, 1)
        .unwrap();
    let result: vkray_gpu::Result<()> = commands.run(&device, |cmd| {
        device.cmd_reset_query_pool(cmd, pool, 0, 1);
        Err(GpuError::InvalidState("recording aborted".to_string()))
    });

    assert!(matches!(result, Err(GpuError::InvalidState(_))));
    assert_eq!(device.submit_count(), 1);
    assert_eq!(device.live_command_buffers(), 0);
    device.destroy_query_pool(pool);
    commands.destroy(&device);
}

#[test]
fn run_returns_the_closure_value() {
    let device = MockDevice::new();
    let commands = OneShotCommands::new(&device, 0).unwrap();

    let value = commands.run(&device, |_| Ok(42)).unwrap();

    assert_eq!(value, 42);
    assert_eq!(device.submit_count(), 1);
    commands.destroy(&device);
}

#[test]
fn consecutive_submissions_reuse_the_fence() {
    let device = MockDevice::new();
    let commands = OneShotCommands::new(&device, 0).unwrap();

    for _ in 0..3 {
        commands.run(&device, |_| Ok(())).unwrap();
    }

    assert_eq!(device.submit_count(), 3);
    assert_eq!(device.count(|c| matches!(c, Call::WaitFence)), 3);
    commands.destroy(&device);
}
