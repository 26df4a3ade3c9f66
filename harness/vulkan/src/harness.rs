//! End-to-end benchmark sequence.

use tracing::info;

use crate::config::{resolve_coalesced_memory, BenchConfig};
use crate::device::DeviceContext;
use crate::error::{Stage, StageContext, StageError};
use crate::memory::BufferPair;
use crate::pipeline::{ComputePipeline, SpecializationLayout};
use crate::report::{self, Report};
use crate::runner;
use crate::shader::KernelVariant;

/// Run all three variants against one device and collect the report.
///
/// Each run is submitted only after the previous one's fence has signaled
/// and been reset. The output buffer is downloaded after the first run, when
/// it holds the no-bank-conflict transpose.
pub fn run(config: &BenchConfig) -> Result<Report, StageError> {
    config.validate().stage(Stage::Config)?;

    let ctx = DeviceContext::new(config.device_index, config.diagnostics).stage(Stage::Device)?;

    let system_size = config.system_size();
    let coalesced_memory = resolve_coalesced_memory(config.coalesced_memory, ctx.vendor_id());
    SpecializationLayout::new(coalesced_memory, system_size).stage(Stage::Config)?;
    info!(
        "System {}x{}, coalesced memory {} bytes, batch {}",
        system_size.width, system_size.height, coalesced_memory, config.batch
    );

    let buffers = BufferPair::new(&ctx, system_size).stage(Stage::BufferAllocation)?;
    let input: Vec<f32> = (0..system_size.element_count()).map(|i| i as f32).collect();
    ctx.upload_f32(&input, &buffers.input).stage(Stage::Upload)?;
    info!("Uploaded {} KB of input", buffers.size() / 1024);

    let mut pipelines = Vec::with_capacity(KernelVariant::ALL.len());
    for variant in KernelVariant::ALL {
        let pipeline = ComputePipeline::build(
            &ctx,
            variant,
            &buffers,
            system_size,
            coalesced_memory,
            &config.shader_dir,
        )
        .stage(Stage::Pipeline(variant.label()))?;
        pipelines.push(pipeline);
    }
    info!("Built {} pipelines", pipelines.len());

    let mut latencies = [0.0f64; 3];
    for (slot, pipeline) in latencies.iter_mut().zip(&pipelines) {
        let variant = pipeline.variant();
        *slot = runner::run(&ctx, pipeline, config.batch).stage(Stage::Run(variant.label()))?;
        info!("{}: {:.3} ms per dispatch", variant.label(), *slot);

        if variant == KernelVariant::NoBankConflictTranspose {
            let output = ctx
                .download_f32(&buffers.output, input.len())
                .stage(Stage::Download)?;
            if config.verify {
                report::verify_transpose(&input, &output, system_size).stage(Stage::Verify)?;
                info!("Output verified as the transpose of the input");
            }
        }
    }

    Ok(Report {
        device_name: ctx.device_name(),
        no_bank_conflict_ms: latencies[0],
        bank_conflict_ms: latencies[1],
        transfer_ms: latencies[2],
        coalesced_memory,
        system_size,
        buffer_bytes: system_size.buffer_bytes(),
        batch: config.batch,
    })
}
