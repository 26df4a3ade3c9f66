//! Vulkan runtime for the matrix-transposition benchmark.
//!
//! Provides [`DeviceContext`] for device, queue and fence management,
//! [`ComputePipeline`] for the three kernel variants, and [`harness::run`]
//! for the full timed sequence that produces a [`Report`].

mod commands;
pub mod config;
pub mod device;
pub mod error;
pub mod harness;
pub mod memory;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod shader;
mod transfer;

pub use config::{resolve_coalesced_memory, BenchConfig, SystemSize};
pub use device::{DeviceContext, DiagnosticsMode, FENCE_TIMEOUT};
pub use error::{BenchError, Result, Stage, StageError};
pub use memory::{Buffer, BufferPair, BufferUsage, MemoryRequest};
pub use pipeline::{ComputePipeline, PushConstants, SpecializationLayout};
pub use report::Report;
pub use shader::KernelVariant;
