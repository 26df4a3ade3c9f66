//! One-time-submit command buffers.

use std::time::Duration;

use ash::vk;

use crate::device::DeviceContext;
use crate::error::{BenchError, Result};

/// A primary command buffer allocated from the context's pool, recorded once
/// and submitted once.
///
/// Freed on drop unless a submission may still be executing, in which case
/// the pool reclaims it at teardown.
pub(crate) struct OneTimeCommands<'a> {
    ctx: &'a DeviceContext,
    handle: vk::CommandBuffer,
    in_flight: bool,
}

impl<'a> OneTimeCommands<'a> {
    /// Allocate a command buffer and begin one-time-submit recording.
    pub(crate) fn begin(ctx: &'a DeviceContext) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(ctx.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let handle = unsafe { ctx.device.allocate_command_buffers(&alloc_info) }
            .map_err(BenchError::Recording)?[0];
        let commands = Self {
            ctx,
            handle,
            in_flight: false,
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { ctx.device.begin_command_buffer(handle, &begin_info) }
            .map_err(BenchError::Recording)?;
        Ok(commands)
    }

    pub(crate) fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// End recording, submit, and block until the fence signals.
    ///
    /// Returns the submission-to-signal time.
    pub(crate) fn submit(mut self) -> Result<Duration> {
        unsafe { self.ctx.device.end_command_buffer(self.handle) }
            .map_err(BenchError::Recording)?;
        self.in_flight = true;
        let elapsed = self.ctx.submit_and_wait(self.handle);
        if !matches!(elapsed, Err(BenchError::FenceTimeout { .. })) {
            self.in_flight = false;
        }
        elapsed
    }
}

impl Drop for OneTimeCommands<'_> {
    fn drop(&mut self) {
        if self.in_flight {
            return;
        }
        unsafe {
            self.ctx
                .device
                .free_command_buffers(self.ctx.command_pool, &[self.handle]);
        }
    }
}
