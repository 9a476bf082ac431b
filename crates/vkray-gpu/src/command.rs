//! One-shot command submission.
//!
//! Every synchronous GPU operation in the ray tracing core goes through
//! [`OneShotCommands`]: record into a transient command buffer, submit with a
//! fence, block until the fence signals.

use crate::device::RayTracingDevice;
use crate::error::Result;
use ash::vk;
use std::ops::Deref;

/// Transient command pool, completion fence and queue for one-shot work.
pub struct OneShotCommands {
    pool: vk::CommandPool,
    fence: vk::Fence,
    queue: vk::Queue,
    queue_family: u32,
}

impl OneShotCommands {
    /// Create the pool and fence on the given queue family.
    pub fn new(device: &dyn RayTracingDevice, queue_family: u32) -> Result<Self> {
        let pool = device.create_command_pool(queue_family)?;
        let fence = match device.create_fence() {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_command_pool(pool);
                return Err(e);
            }
        };

        Ok(Self {
            pool,
            fence,
            queue: device.queue(queue_family),
            queue_family,
        })
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a command buffer and begin recording.
    ///
    /// The returned guard submits and waits when it is consumed by
    /// [`ScopedCommands::submit`] or, failing that, when it is dropped.
    pub fn begin<'a>(&'a self, device: &'a dyn RayTracingDevice) -> Result<ScopedCommands<'a>> {
        let cmd = device.allocate_command_buffer(self.pool)?;
        if let Err(e) = device.begin_command_buffer(cmd) {
            device.free_command_buffer(self.pool, cmd);
            return Err(e);
        }

        Ok(ScopedCommands {
            device,
            owner: self,
            cmd,
            finished: false,
        })
    }

    /// Record with `f`, then submit and wait.
    ///
    /// The commands are submitted even if `f` fails; the error from `f` wins.
    pub fn run<T>(
        &self,
        device: &dyn RayTracingDevice,
        f: impl FnOnce(vk::CommandBuffer) -> Result<T>,
    ) -> Result<T> {
        let scoped = self.begin(device)?;
        match f(*scoped) {
            Ok(value) => {
                scoped.submit()?;
                Ok(value)
            }
            Err(e) => {
                drop(scoped);
                Err(e)
            }
        }
    }

    /// Destroy the pool and fence.
    pub fn destroy(&self, device: &dyn RayTracingDevice) {
        device.destroy_fence(self.fence);
        device.destroy_command_pool(self.pool);
    }
}

/// A command buffer in the recording state.
///
/// Dereferences to the raw `vk::CommandBuffer`.
pub struct ScopedCommands<'a> {
    device: &'a dyn RayTracingDevice,
    owner: &'a OneShotCommands,
    cmd: vk::CommandBuffer,
    finished: bool,
}

impl ScopedCommands<'_> {
    /// End recording, submit, wait for completion and free the buffer.
    pub fn submit(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let device = self.device;
        let owner = self.owner;
        let cmd = self.cmd;

        let result = device
            .end_command_buffer(cmd)
            .and_then(|()| device.queue_submit(owner.queue, cmd, owner.fence))
            .and_then(|()| device.wait_for_fence(owner.fence))
            .and_then(|()| device.reset_fence(owner.fence));

        device.free_command_buffer(owner.pool, cmd);
        result
    }
}

impl Deref for ScopedCommands<'_> {
    type Target = vk::CommandBuffer;

    fn deref(&self) -> &Self::Target {
        &self.cmd
    }
}

impl Drop for ScopedCommands<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                tracing::error!("One-shot submission failed during unwind: {e}");
            }
        }
    }
}
