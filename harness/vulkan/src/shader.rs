//! Kernel variants and SPIR-V loading.
//!
//! The kernels are precompiled outside this crate. Each variant maps to a
//! fixed file name under the configured shader directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{BenchError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// The three benchmarked kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelVariant {
    /// Transpose through padded shared memory.
    NoBankConflictTranspose,
    /// Transpose through unpadded shared memory.
    BankConflictTranspose,
    /// Straight copy with the same access pattern, used as the bandwidth reference.
    PureTransfer,
}

impl KernelVariant {
    /// Run order of the benchmark.
    pub const ALL: [KernelVariant; 3] = [
        KernelVariant::NoBankConflictTranspose,
        KernelVariant::BankConflictTranspose,
        KernelVariant::PureTransfer,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            KernelVariant::NoBankConflictTranspose => "transposition_no_bank_conflicts.spv",
            KernelVariant::BankConflictTranspose => "transposition_bank_conflicts.spv",
            KernelVariant::PureTransfer => "transfer.spv",
        }
    }

    /// Short human-readable name used in logs and stage errors.
    pub fn label(self) -> &'static str {
        match self {
            KernelVariant::NoBankConflictTranspose => "no-bank-conflict transpose",
            KernelVariant::BankConflictTranspose => "bank-conflict transpose",
            KernelVariant::PureTransfer => "pure transfer",
        }
    }

    pub fn path(self, shader_dir: &Path) -> PathBuf {
        shader_dir.join(self.file_name())
    }
}

/// Read a kernel file, zero-padding its length up to a multiple of 4.
pub fn read_padded(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = fs::read(path).map_err(|source| BenchError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    })?;
    let raw_len = bytes.len();
    bytes.resize(raw_len.next_multiple_of(4), 0);
    debug!(
        "Loaded {} ({} bytes, padded to {})",
        path.display(),
        raw_len,
        bytes.len()
    );
    Ok(bytes)
}

/// Reinterpret padded bytecode as little-endian SPIR-V words.
pub fn spirv_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Load a variant's kernel from `shader_dir` as SPIR-V words.
pub fn load_kernel(variant: KernelVariant, shader_dir: &Path) -> Result<Vec<u32>> {
    let path = variant.path(shader_dir);
    let words = spirv_words(&read_padded(&path)?);
    if words.first() != Some(&SPIRV_MAGIC) {
        warn!("{} does not start with the SPIR-V magic number", path.display());
    }
    Ok(words)
}
