//! Error taxonomy for the benchmark runtime.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// Errors raised by the Vulkan runtime.
///
/// None of these are retried: a failed GPU operation aborts the current
/// benchmark invocation.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Loader, instance, validation layer or debug extension setup failed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// The requested physical device index does not exist.
    #[error("physical device {index} not found ({count} device(s) available)")]
    DeviceNotFound { index: usize, count: usize },

    /// The selected physical device exposes no compute-capable queue family.
    #[error("no compute queue family found")]
    NoComputeQueue,

    /// No memory type satisfies the buffer's requirements.
    #[error("no suitable memory type (type bits {type_bits:#x}, flags {flags:?})")]
    NoSuitableMemory {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// A kernel bytecode file could not be read.
    #[error("failed to load shader {}: {source}", .path.display())]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A backend call failed while building a compute pipeline.
    #[error("pipeline creation failed at {stage}: {source}{}", vk_hint(.source))]
    PipelineCreation {
        stage: &'static str,
        #[source]
        source: vk::Result,
    },

    /// Queue submission, fence wait or fence reset failed.
    #[error("queue submission failed: {0}{}", vk_hint(.0))]
    Submission(#[source] vk::Result),

    /// The fence did not signal within the wait bound.
    #[error("fence wait timed out after {}s", .timeout.as_secs())]
    FenceTimeout { timeout: Duration },

    /// Buffer creation, memory allocation or binding failed.
    #[error("{what} failed: {source}{}", vk_hint(.source))]
    Allocation {
        what: &'static str,
        #[source]
        source: vk::Result,
    },

    /// Mapping host-visible memory failed.
    #[error("failed to map device memory: {0}")]
    MemoryMap(#[source] vk::Result),

    /// Command buffer allocation or recording failed.
    #[error("command buffer recording failed: {0}{}", vk_hint(.0))]
    Recording(#[source] vk::Result),

    /// A transfer asked for more bytes than the device buffer holds.
    #[error("transfer of {requested} bytes exceeds buffer capacity of {capacity} bytes")]
    TransferSize { requested: u64, capacity: u64 },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Downloaded output is not the transpose of the input.
    #[error("output mismatch at element {index}: expected {expected}, got {actual}")]
    Verification {
        index: usize,
        expected: f32,
        actual: f32,
    },
}

impl BenchError {
    /// Process exit code for this error. Success is 0; codes are stable.
    pub fn exit_code(&self) -> i32 {
        match self {
            BenchError::Initialization(_) => 2,
            BenchError::DeviceNotFound { .. } => 3,
            BenchError::NoComputeQueue => 4,
            BenchError::NoSuitableMemory { .. } => 5,
            BenchError::ShaderLoad { .. } => 6,
            BenchError::PipelineCreation { .. } => 7,
            BenchError::Submission(_) => 8,
            BenchError::FenceTimeout { .. } => 9,
            BenchError::Allocation { .. } => 10,
            BenchError::MemoryMap(_) => 11,
            BenchError::Recording(_) => 12,
            BenchError::TransferSize { .. } => 13,
            BenchError::InvalidConfig(_) => 14,
            BenchError::Verification { .. } => 15,
        }
    }
}

/// Operator hint appended to results that usually need action outside the process.
fn vk_hint(result: &vk::Result) -> &'static str {
    match *result {
        vk::Result::ERROR_DEVICE_LOST => " (GPU device lost, restart may be required)",
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => " (GPU out of memory, reduce --size)",
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => " (host out of memory)",
        _ => "",
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;

/// Benchmark stage that produced a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Device,
    BufferAllocation,
    Upload,
    Pipeline(&'static str),
    Run(&'static str),
    Download,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Config => write!(f, "configuration"),
            Stage::Device => write!(f, "device setup"),
            Stage::BufferAllocation => write!(f, "buffer allocation"),
            Stage::Upload => write!(f, "input upload"),
            Stage::Pipeline(label) => write!(f, "{label} pipeline creation"),
            Stage::Run(label) => write!(f, "{label} run"),
            Stage::Download => write!(f, "output download"),
            Stage::Verify => write!(f, "output verification"),
        }
    }
}

/// The first unrecoverable error of a benchmark invocation, tagged with its stage.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: BenchError,
}

impl StageError {
    pub fn exit_code(&self) -> i32 {
        self.source.exit_code()
    }
}

/// Attaches a [`Stage`] to a runtime error.
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> std::result::Result<T, StageError>;
}

impl<T> StageContext<T> for Result<T> {
    fn stage(self, stage: Stage) -> std::result::Result<T, StageError> {
        self.map_err(|source| StageError { stage, source })
    }
}
