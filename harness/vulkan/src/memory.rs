//! Buffer allocation and memory type selection.

use ash::vk;
use tracing::debug;

use crate::config::SystemSize;
use crate::device::DeviceContext;
use crate::error::{BenchError, Result};

/// What a buffer is used for; determines its Vulkan usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Shader-visible storage that can also be a copy source or destination.
    Storage,
    /// Host-written staging buffer copied into a device buffer.
    StagingUpload,
    /// Staging buffer a device buffer is copied into for host readback.
    StagingDownload,
}

impl BufferUsage {
    pub fn flags(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::StagingUpload => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::StagingDownload => vk::BufferUsageFlags::TRANSFER_DST,
        }
    }
}

/// Memory property flags a buffer must have, plus flags it should have if any
/// compatible memory type offers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequest {
    pub required: vk::MemoryPropertyFlags,
    pub preferred: vk::MemoryPropertyFlags,
}

impl MemoryRequest {
    /// Device-local if available, otherwise any memory the buffer accepts.
    pub const DEVICE_LOCAL: Self = Self {
        required: vk::MemoryPropertyFlags::empty(),
        preferred: vk::MemoryPropertyFlags::DEVICE_LOCAL,
    };

    /// Host-visible and host-coherent, for staging.
    pub const HOST_COHERENT: Self = Self {
        required: vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
                | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
        ),
        preferred: vk::MemoryPropertyFlags::empty(),
    };
}

/// First memory type, in table order, allowed by `type_bits` whose property
/// flags contain `wanted`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    wanted: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = (memory_properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(i, ty)| type_bits & (1 << i) != 0 && ty.property_flags.contains(wanted))
        .map(|(i, _)| i as u32)
}

/// Select a memory type for `request`: first fit on `required | preferred`,
/// falling back to first fit on `required` alone.
pub fn select_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    request: MemoryRequest,
) -> Result<u32> {
    if !request.preferred.is_empty() {
        if let Some(index) =
            find_memory_type(memory_properties, type_bits, request.required | request.preferred)
        {
            return Ok(index);
        }
        debug!(
            "No memory type with preferred flags {:?}, falling back to {:?}",
            request.preferred, request.required
        );
    }
    find_memory_type(memory_properties, type_bits, request.required).ok_or(
        BenchError::NoSuitableMemory {
            type_bits,
            flags: request.required | request.preferred,
        },
    )
}

/// A buffer with its own dedicated memory allocation, bound at offset 0.
///
/// Destroyed together with its memory when dropped.
pub struct Buffer<'a> {
    ctx: &'a DeviceContext,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
}

impl<'a> Buffer<'a> {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub(crate) fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// True if the bound memory type has all of `flags`.
    pub fn has_memory_flags(&self, flags: vk::MemoryPropertyFlags) -> bool {
        self.ctx.memory_properties().memory_types[self.memory_type_index as usize]
            .property_flags
            .contains(flags)
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_buffer(self.handle, None);
            self.ctx.device.free_memory(self.memory, None);
        }
    }
}

impl DeviceContext {
    /// Create a buffer of `size` bytes and bind it to memory chosen by
    /// [`select_memory_type`].
    pub fn allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: BufferUsage,
        request: MemoryRequest,
    ) -> Result<Buffer<'_>> {
        if size == 0 {
            return Err(BenchError::InvalidConfig(
                "buffer size must be non-zero".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| {
            BenchError::Allocation {
                what: "vkCreateBuffer",
                source: e,
            }
        })?;

        // Null memory until allocated; dropping early releases only the buffer.
        let mut buffer = Buffer {
            ctx: self,
            handle,
            memory: vk::DeviceMemory::null(),
            size,
            memory_type_index: 0,
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };
        buffer.memory_type_index = select_memory_type(
            self.memory_properties(),
            requirements.memory_type_bits,
            request,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(buffer.memory_type_index);
        buffer.memory = unsafe { self.device.allocate_memory(&alloc_info, None) }.map_err(|e| {
            BenchError::Allocation {
                what: "vkAllocateMemory",
                source: e,
            }
        })?;

        unsafe { self.device.bind_buffer_memory(handle, buffer.memory, 0) }.map_err(|e| {
            BenchError::Allocation {
                what: "vkBindBufferMemory",
                source: e,
            }
        })?;

        debug!(
            "Allocated {:?} buffer ({} bytes, memory type {})",
            usage, size, buffer.memory_type_index
        );
        Ok(buffer)
    }
}

/// The input/output storage buffers shared by every pipeline variant.
pub struct BufferPair<'a> {
    pub input: Buffer<'a>,
    pub output: Buffer<'a>,
}

impl<'a> BufferPair<'a> {
    /// Allocate two equal-size storage buffers for `size`, preferring
    /// device-local memory.
    pub fn new(ctx: &'a DeviceContext, size: SystemSize) -> Result<Self> {
        let bytes = size.buffer_bytes();
        let input = ctx.allocate_buffer(bytes, BufferUsage::Storage, MemoryRequest::DEVICE_LOCAL)?;
        let output =
            ctx.allocate_buffer(bytes, BufferUsage::Storage, MemoryRequest::DEVICE_LOCAL)?;
        Ok(Self { input, output })
    }

    /// Size of each buffer in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.input.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    fn table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    /// Typical discrete GPU layout.
    fn discrete() -> vk::PhysicalDeviceMemoryProperties {
        table(&[
            DEVICE_LOCAL,
            HOST_VISIBLE | HOST_COHERENT,
            HOST_VISIBLE | HOST_COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
            DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT,
        ])
    }

    #[test]
    fn usage_flags() {
        assert!(BufferUsage::Storage
            .flags()
            .contains(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST));
        assert_eq!(
            BufferUsage::StagingUpload.flags(),
            vk::BufferUsageFlags::TRANSFER_SRC
        );
        assert_eq!(
            BufferUsage::StagingDownload.flags(),
            vk::BufferUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn host_coherent_request_flags() {
        assert_eq!(
            MemoryRequest::HOST_COHERENT.required,
            HOST_VISIBLE | HOST_COHERENT
        );
    }

    #[test]
    fn first_fit_in_table_order() {
        let props = discrete();
        assert_eq!(
            select_memory_type(&props, u32::MAX, MemoryRequest::HOST_COHERENT).unwrap(),
            1
        );
        assert_eq!(
            select_memory_type(&props, u32::MAX, MemoryRequest::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_type_bits() {
        let props = discrete();
        // Buffer only accepts types 2 and 3.
        assert_eq!(
            select_memory_type(&props, 0b1100, MemoryRequest::HOST_COHERENT).unwrap(),
            2
        );
        assert_eq!(
            select_memory_type(&props, 0b1100, MemoryRequest::DEVICE_LOCAL).unwrap(),
            3
        );
    }

    #[test]
    fn device_local_falls_back_to_any_compatible_type() {
        // Integrated GPU without a device-local type the buffer accepts.
        let props = table(&[HOST_VISIBLE | HOST_COHERENT, DEVICE_LOCAL]);
        assert_eq!(
            select_memory_type(&props, 0b01, MemoryRequest::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let props = discrete();
        let first = select_memory_type(&props, 0b1011, MemoryRequest::DEVICE_LOCAL).unwrap();
        for _ in 0..16 {
            assert_eq!(
                select_memory_type(&props, 0b1011, MemoryRequest::DEVICE_LOCAL).unwrap(),
                first
            );
        }
    }

    #[test]
    fn no_match_is_an_error() {
        let props = table(&[DEVICE_LOCAL]);
        let err = select_memory_type(&props, u32::MAX, MemoryRequest::HOST_COHERENT).unwrap_err();
        assert!(matches!(err, BenchError::NoSuitableMemory { type_bits, .. } if type_bits == u32::MAX));
    }

    #[test]
    fn empty_table_has_no_match() {
        let props = vk::PhysicalDeviceMemoryProperties::default();
        assert_eq!(find_memory_type(&props, u32::MAX, DEVICE_LOCAL), None);
        assert!(select_memory_type(&props, u32::MAX, MemoryRequest::DEVICE_LOCAL).is_err());
    }

    #[test]
    fn entries_past_count_are_ignored() {
        let mut props = table(&[HOST_VISIBLE]);
        props.memory_types[1] = vk::MemoryType {
            property_flags: DEVICE_LOCAL,
            heap_index: 0,
        };
        assert_eq!(find_memory_type(&props, u32::MAX, DEVICE_LOCAL), None);
    }
}
