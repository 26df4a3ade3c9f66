//! Host ↔ device transfers through transient staging buffers.
//!
//! Device-local memory is usually not host-visible, so every transfer goes
//! through a host-coherent staging buffer and a one-shot copy command. Both
//! directions block until the copy has completed and the fence is reset.

use std::ptr;
use std::time::Duration;

use ash::vk;
use tracing::debug;

use crate::commands::OneTimeCommands;
use crate::device::DeviceContext;
use crate::error::{BenchError, Result};
use crate::memory::{Buffer, BufferUsage, MemoryRequest};

impl DeviceContext {
    /// Copy `data` into the start of `dst`.
    pub fn upload(&self, data: &[u8], dst: &Buffer<'_>) -> Result<()> {
        let size = data.len() as vk::DeviceSize;
        if size == 0 {
            return Ok(());
        }
        check_capacity(size, dst)?;

        let staging =
            self.allocate_buffer(size, BufferUsage::StagingUpload, MemoryRequest::HOST_COHERENT)?;
        unsafe {
            let mapped = self
                .device
                .map_memory(staging.memory(), 0, size, vk::MemoryMapFlags::empty())
                .map_err(BenchError::MemoryMap)?;
            ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
            self.device.unmap_memory(staging.memory());
        }

        let cmd = OneTimeCommands::begin(self)?;
        record_copy(self, cmd.handle(), staging.handle(), dst.handle(), size);
        let (elapsed, _staging) = submit_keeping_staging(cmd, staging)?;
        debug!("Uploaded {} bytes in {:?}", size, elapsed);
        Ok(())
    }

    /// Read the first `size` bytes of `src` back to the host.
    pub fn download(&self, src: &Buffer<'_>, size: vk::DeviceSize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        check_capacity(size, src)?;

        let staging = self.allocate_buffer(
            size,
            BufferUsage::StagingDownload,
            MemoryRequest::HOST_COHERENT,
        )?;

        let cmd = OneTimeCommands::begin(self)?;
        record_copy(self, cmd.handle(), src.handle(), staging.handle(), size);
        let (elapsed, staging) = submit_keeping_staging(cmd, staging)?;

        let mut data = vec![0u8; size as usize];
        unsafe {
            let mapped = self
                .device
                .map_memory(staging.memory(), 0, size, vk::MemoryMapFlags::empty())
                .map_err(BenchError::MemoryMap)?;
            ptr::copy_nonoverlapping(mapped.cast::<u8>(), data.as_mut_ptr(), data.len());
            self.device.unmap_memory(staging.memory());
        }
        debug!("Downloaded {} bytes in {:?}", size, elapsed);
        Ok(data)
    }

    /// Upload f32 data into `dst`.
    pub fn upload_f32(&self, data: &[f32], dst: &Buffer<'_>) -> Result<()> {
        self.upload(bytemuck::cast_slice(data), dst)
    }

    /// Download `count` f32 elements from `src`.
    pub fn download_f32(&self, src: &Buffer<'_>, count: usize) -> Result<Vec<f32>> {
        let bytes = self.download(src, (count * std::mem::size_of::<f32>()) as vk::DeviceSize)?;
        Ok(f32_from_bytes(&bytes))
    }
}

/// Submit a staging copy and hand the staging buffer back once the copy has
/// completed. On fence timeout the copy may still be using it, so it is
/// leaked instead of freed.
fn submit_keeping_staging<'a>(
    cmd: OneTimeCommands<'_>,
    staging: Buffer<'a>,
) -> Result<(Duration, Buffer<'a>)> {
    match cmd.submit() {
        Ok(elapsed) => Ok((elapsed, staging)),
        Err(e @ BenchError::FenceTimeout { .. }) => {
            std::mem::forget(staging);
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Decode native-endian f32 values; `bytes` need not be 4-byte aligned.
fn f32_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytemuck::pod_collect_to_vec(bytes)
}

fn check_capacity(requested: vk::DeviceSize, buffer: &Buffer<'_>) -> Result<()> {
    if requested > buffer.size() {
        return Err(BenchError::TransferSize {
            requested,
            capacity: buffer.size(),
        });
    }
    Ok(())
}

fn record_copy(
    ctx: &DeviceContext,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) {
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size,
    };
    unsafe { ctx.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_unaligned_f32_bytes() {
        let values = [1.5f32, -2.0, 1024.0];
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(bytemuck::cast_slice(&values));
        // Offset by one so the slice cannot be 4-byte aligned.
        assert_eq!(f32_from_bytes(&bytes[1..]), values);
    }

    #[test]
    fn decodes_empty_bytes() {
        assert!(f32_from_bytes(&[]).is_empty());
    }
}
