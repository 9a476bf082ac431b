//! Fence helpers.
//!
//! The ray tracing core only ever blocks on one fence at a time, so these are
//! the whole synchronization surface.

use crate::error::{check_call, Result};
use ash::vk;

/// Create an unsignaled fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device) -> Result<vk::Fence> {
    let create_info = vk::FenceCreateInfo::default();
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence without a timeout.
///
/// A hung build is treated as fatal rather than retried.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    check_call(device.wait_for_fences(&[fence], true, u64::MAX), "vkWaitForFences")
}

/// Reset a fence to the unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Destroy a fence.
///
/// # Safety
/// The fence must not be in use.
pub unsafe fn destroy_fence(device: &ash::Device, fence: vk::Fence) {
    device.destroy_fence(fence, None);
}
