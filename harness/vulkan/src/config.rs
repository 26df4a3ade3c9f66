//! Benchmark configuration and system-size arithmetic.

use std::path::PathBuf;

use serde::Serialize;

use crate::device::DiagnosticsMode;
use crate::error::{BenchError, Result};

/// PCI vendor id for NVIDIA.
pub const VENDOR_NVIDIA: u32 = 0x10DE;

/// Largest coalesced-memory width the kernels support, in bytes.
pub const MAX_COALESCED_MEMORY: u32 = 128;

/// Largest element count whose indices are all exact as `f32`.
pub const MAX_EXACT_F32_ELEMENTS: u64 = 1 << 24;

pub const DEFAULT_SIZE: u32 = 2048;
pub const DEFAULT_BATCH: u32 = 1000;
pub const DEFAULT_SHADER_DIR: &str = "shaders";

/// Dimensions of the transposition system, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemSize {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl SystemSize {
    /// An `n x n x 1` system.
    pub fn square(n: u32) -> Self {
        Self {
            width: n,
            height: n,
            depth: 1,
        }
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    pub fn element_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Bytes of one single-precision buffer holding the whole system.
    pub fn buffer_bytes(&self) -> u64 {
        self.element_count() * std::mem::size_of::<f32>() as u64
    }
}

/// Coalesced-memory width to use: `requested` unless it is 0, in which case
/// the vendor default (32 bytes on NVIDIA, 64 bytes elsewhere).
pub fn resolve_coalesced_memory(requested: u32, vendor_id: u32) -> u32 {
    if requested != 0 {
        return requested;
    }
    match vendor_id {
        VENDOR_NVIDIA => 32,
        _ => 64,
    }
}

/// Everything one benchmark invocation needs.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Index into the enumerated physical devices.
    pub device_index: usize,
    /// Coalesced-memory width in bytes; 0 selects the vendor default.
    pub coalesced_memory: u32,
    /// Square system dimension.
    pub size: u32,
    /// Dispatches recorded per timed submission.
    pub batch: u32,
    /// Directory holding the three kernel `.spv` files.
    pub shader_dir: PathBuf,
    pub diagnostics: DiagnosticsMode,
    /// Check the downloaded output against the transposed input.
    pub verify: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            coalesced_memory: 0,
            size: DEFAULT_SIZE,
            batch: DEFAULT_BATCH,
            shader_dir: PathBuf::from(DEFAULT_SHADER_DIR),
            diagnostics: DiagnosticsMode::Disabled,
            verify: false,
        }
    }
}

impl BenchConfig {
    pub fn system_size(&self) -> SystemSize {
        SystemSize::square(self.size)
    }

    /// Reject values that can never produce a valid run. Workgroup
    /// divisibility and stride range are checked once the coalesced width is
    /// resolved.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(BenchError::InvalidConfig("size must be positive".into()));
        }
        if self.batch == 0 {
            return Err(BenchError::InvalidConfig("batch must be positive".into()));
        }
        if self.coalesced_memory > MAX_COALESCED_MEMORY {
            return Err(BenchError::InvalidConfig(format!(
                "coalesced memory {} exceeds {} bytes",
                self.coalesced_memory, MAX_COALESCED_MEMORY
            )));
        }
        let elements = self.system_size().element_count();
        if self.verify && elements > MAX_EXACT_F32_ELEMENTS {
            // Verification compares element indices stored as f32 values.
            return Err(BenchError::InvalidConfig(format!(
                "size {} has {} elements, more than f32 can index exactly for --verify",
                self.size, elements
            )));
        }
        Ok(())
    }
}
