//! vk-transpose: measure how coalesced-memory width and shared-memory bank
//! conflicts affect a Vulkan matrix-transposition kernel.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::error;
use transpose_vulkan::config::{DEFAULT_BATCH, DEFAULT_SHADER_DIR, DEFAULT_SIZE};
use transpose_vulkan::{harness, BenchConfig, DiagnosticsMode, Report};

#[derive(Parser, Debug)]
#[command(
    name = "vk-transpose",
    version,
    about = "Benchmark a Vulkan transpose kernel with and without shared-memory bank conflicts"
)]
struct Args {
    /// Physical device index
    #[arg(long, env = "VK_TRANSPOSE_DEVICE", default_value_t = 0)]
    device: usize,

    /// Coalesced memory width in bytes (0 = vendor default)
    #[arg(long, default_value_t = 0)]
    coalesced_memory: u32,

    /// Square system dimension
    #[arg(long, default_value_t = DEFAULT_SIZE)]
    size: u32,

    /// Dispatches per timed submission
    #[arg(long, default_value_t = DEFAULT_BATCH)]
    batch: u32,

    /// Directory containing the kernel .spv files
    #[arg(long, env = "VK_TRANSPOSE_SHADER_DIR", default_value = DEFAULT_SHADER_DIR)]
    shader_dir: PathBuf,

    /// Enable the Khronos validation layer
    #[arg(long)]
    validation: bool,

    /// Check that the output is the transpose of the input
    #[arg(long)]
    verify: bool,

    /// Report format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Text,
    Json,
}

impl Args {
    fn config(&self) -> BenchConfig {
        BenchConfig {
            device_index: self.device,
            coalesced_memory: self.coalesced_memory,
            size: self.size,
            batch: self.batch,
            shader_dir: self.shader_dir.clone(),
            diagnostics: if self.validation {
                DiagnosticsMode::Validation
            } else {
                DiagnosticsMode::Disabled
            },
            verify: self.verify,
        }
    }
}

fn setup_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &Report, format: Format) -> Result<(), serde_json::Error> {
    match format {
        Format::Text => println!("{report}"),
        Format::Json => println!("{}", report.to_json()?),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(&args.log_level);

    let report = match harness::run(&args.config()) {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    if let Err(e) = print_report(&report, args.format) {
        error!("failed to serialize report: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
