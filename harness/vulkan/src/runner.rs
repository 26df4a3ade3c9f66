//! Batched, fence-timed benchmark runs.

use ash::vk;
use tracing::debug;

use crate::commands::OneTimeCommands;
use crate::device::DeviceContext;
use crate::error::{BenchError, Result};
use crate::pipeline::{ComputePipeline, PushConstants};

/// Append one dispatch of `pipeline` to `cmd`, followed by a barrier that
/// makes its shader writes visible to the next dispatch's reads.
pub(crate) fn record_dispatch(
    ctx: &DeviceContext,
    cmd: vk::CommandBuffer,
    pipeline: &ComputePipeline<'_>,
) {
    let device = &ctx.device;
    let push = PushConstants::default();
    let [x, y, z] = pipeline.dispatch_grid();
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ);
    unsafe {
        device.cmd_push_constants(
            cmd,
            pipeline.layout(),
            vk::ShaderStageFlags::COMPUTE,
            0,
            bytemuck::bytes_of(&push),
        );
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.handle());
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::COMPUTE,
            pipeline.layout(),
            0,
            &[pipeline.descriptor_set()],
            &[],
        );
        device.cmd_dispatch(cmd, x, y, z);
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Record `batch` dispatches into one command buffer, submit once, and
/// return the average milliseconds per dispatch measured from submission to
/// fence signal.
pub fn run(ctx: &DeviceContext, pipeline: &ComputePipeline<'_>, batch: u32) -> Result<f64> {
    if batch == 0 {
        return Err(BenchError::InvalidConfig("batch must be positive".into()));
    }
    let cmd = OneTimeCommands::begin(ctx)?;
    for _ in 0..batch {
        record_dispatch(ctx, cmd.handle(), pipeline);
    }
    let elapsed = cmd.submit()?;
    let average_ms = elapsed.as_secs_f64() * 1000.0 / batch as f64;
    debug!(
        "{}: {} dispatches in {:?} ({:.4} ms each)",
        pipeline.variant().label(),
        batch,
        elapsed,
        average_ms
    );
    Ok(average_ms)
}
