//! Compute pipelines for the three kernel variants.

use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::config::{SystemSize, MAX_COALESCED_MEMORY};
use crate::device::DeviceContext;
use crate::error::{BenchError, Result};
use crate::memory::BufferPair;
use crate::shader::{self, KernelVariant};

/// Specialization constants baked into every pipeline.
///
/// Laid out exactly as the kernels declare them: constant ids 1..=3 are the
/// workgroup size, 4..=6 the input strides.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SpecializationLayout {
    pub local_size: [u32; 3],
    pub input_stride: [u32; 3],
}

impl SpecializationLayout {
    pub fn new(coalesced_memory: u32, size: SystemSize) -> Result<Self> {
        if coalesced_memory == 0
            || coalesced_memory % 4 != 0
            || coalesced_memory > MAX_COALESCED_MEMORY
        {
            return Err(BenchError::InvalidConfig(format!(
                "coalesced memory must be a non-zero multiple of 4 up to {} bytes, got {}",
                MAX_COALESCED_MEMORY, coalesced_memory
            )));
        }
        let edge = coalesced_memory / size_of::<f32>() as u32;
        let plane = size.width.checked_mul(size.height).ok_or_else(|| {
            BenchError::InvalidConfig(format!(
                "system size {}x{} overflows the 32-bit input stride",
                size.width, size.height
            ))
        })?;
        let layout = Self {
            local_size: [edge, edge, 1],
            input_stride: [1, size.width, plane],
        };
        for (dim, local) in size.as_array().iter().zip(layout.local_size) {
            if dim % local != 0 {
                return Err(BenchError::InvalidConfig(format!(
                    "workgroup {:?} does not divide system size {}x{}x{}",
                    layout.local_size, size.width, size.height, size.depth
                )));
            }
        }
        Ok(layout)
    }

    /// Workgroup counts per dimension for a dispatch over `size`.
    pub fn dispatch_grid(&self, size: SystemSize) -> [u32; 3] {
        let dims = size.as_array();
        [
            dims[0] / self.local_size[0],
            dims[1] / self.local_size[1],
            dims[2] / self.local_size[2],
        ]
    }

    pub fn map_entries() -> [vk::SpecializationMapEntry; 6] {
        let word = size_of::<u32>();
        std::array::from_fn(|i| vk::SpecializationMapEntry {
            constant_id: i as u32 + 1,
            offset: (i * word) as u32,
            size: word,
        })
    }
}

/// Per-dispatch push constant. Always zero for now.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PushConstants {
    pub push_id: u32,
}

/// One kernel variant's pipeline and descriptor state, bound to a shared
/// [`BufferPair`].
pub struct ComputePipeline<'a> {
    ctx: &'a DeviceContext,
    variant: KernelVariant,
    system_size: SystemSize,
    specialization: SpecializationLayout,
    descriptor_pool: vk::DescriptorPool,
    set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    // The descriptor set points at these buffers.
    _buffers: PhantomData<&'a BufferPair<'a>>,
}

impl<'a> ComputePipeline<'a> {
    pub fn build(
        ctx: &'a DeviceContext,
        variant: KernelVariant,
        buffers: &'a BufferPair<'a>,
        system_size: SystemSize,
        coalesced_memory: u32,
        shader_dir: &Path,
    ) -> Result<Self> {
        let device = &ctx.device;
        // Dropped with null handles on early return, releasing whatever
        // was created so far.
        let mut built = Self {
            ctx,
            variant,
            system_size,
            specialization: SpecializationLayout::zeroed(),
            descriptor_pool: vk::DescriptorPool::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_set: vk::DescriptorSet::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            _buffers: PhantomData,
        };

        // 1. Descriptor pool
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 2,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        built.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(pipeline_err("descriptor pool"))?;

        // 2. Descriptor set layout: input at 0, output at 1
        let bindings = [0u32, 1].map(|binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
        });
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        built.set_layout = unsafe { device.create_descriptor_set_layout(&set_layout_info, None) }
            .map_err(pipeline_err("descriptor set layout"))?;

        // 3. Descriptor set
        let set_layouts = [built.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(built.descriptor_pool)
            .set_layouts(&set_layouts);
        built.descriptor_set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(pipeline_err("descriptor set allocation"))?[0];

        let input_info = [vk::DescriptorBufferInfo::default()
            .buffer(buffers.input.handle())
            .offset(0)
            .range(vk::WHOLE_SIZE)];
        let output_info = [vk::DescriptorBufferInfo::default()
            .buffer(buffers.output.handle())
            .offset(0)
            .range(vk::WHOLE_SIZE)];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(built.descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&input_info),
            vk::WriteDescriptorSet::default()
                .dst_set(built.descriptor_set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&output_info),
        ];
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        // 4. Pipeline layout
        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(size_of::<PushConstants>() as u32)];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        built.layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(pipeline_err("pipeline layout"))?;

        // 5. Specialization constants
        built.specialization = SpecializationLayout::new(coalesced_memory, system_size)?;
        let map_entries = SpecializationLayout::map_entries();
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(bytemuck::bytes_of(&built.specialization));

        // 6. Kernel bytecode
        let code = shader::load_kernel(variant, shader_dir)?;

        // 7. Shader module and pipeline
        let module = ShaderModule::new(device, &code)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module.handle)
            .name(c"main")
            .specialization_info(&spec_info);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(built.layout);
        built.pipeline = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, e)| BenchError::PipelineCreation {
            stage: "compute pipeline",
            source: e,
        })?[0];

        debug!(
            "Built {} pipeline (workgroup {:?}, grid {:?})",
            variant.label(),
            built.specialization.local_size,
            built.dispatch_grid()
        );
        Ok(built)
    }

    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    pub fn specialization(&self) -> &SpecializationLayout {
        &self.specialization
    }

    pub fn dispatch_grid(&self) -> [u32; 3] {
        self.specialization.dispatch_grid(self.system_size)
    }

    pub(crate) fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub(crate) fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub(crate) fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }
}

impl Drop for ComputePipeline<'_> {
    fn drop(&mut self) {
        let device = &self.ctx.device;
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            // Frees the descriptor set with it.
            device.destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}

/// Shader module that lives only until the pipeline is created.
struct ShaderModule<'d> {
    device: &'d ash::Device,
    handle: vk::ShaderModule,
}

impl<'d> ShaderModule<'d> {
    fn new(device: &'d ash::Device, code: &[u32]) -> Result<Self> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        let handle = unsafe { device.create_shader_module(&info, None) }
            .map_err(pipeline_err("shader module"))?;
        Ok(Self { device, handle })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle, None) };
    }
}

fn pipeline_err(stage: &'static str) -> impl Fn(vk::Result) -> BenchError {
    move |source| BenchError::PipelineCreation { stage, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_size_on_nvidia() {
        let size = SystemSize::square(2048);
        let layout = SpecializationLayout::new(32, size).unwrap();
        assert_eq!(layout.local_size, [8, 8, 1]);
        assert_eq!(layout.dispatch_grid(size), [256, 256, 1]);
    }

    #[test]
    fn default_size_elsewhere() {
        let size = SystemSize::square(2048);
        let layout = SpecializationLayout::new(64, size).unwrap();
        assert_eq!(layout.local_size, [16, 16, 1]);
        assert_eq!(layout.dispatch_grid(size), [128, 128, 1]);
    }

    #[test]
    fn rejects_bad_coalesced_memory() {
        let size = SystemSize::square(2048);
        for c in [0, 6, 132, 256] {
            assert!(
                matches!(SpecializationLayout::new(c, size), Err(BenchError::InvalidConfig(_))),
                "{c} accepted"
            );
        }
    }

    #[test]
    fn rejects_non_dividing_size() {
        assert!(SpecializationLayout::new(32, SystemSize::square(100)).is_err());
        assert!(SpecializationLayout::new(16, SystemSize::square(100)).is_ok());
    }

    #[test]
    fn rejects_stride_overflow() {
        assert!(matches!(
            SpecializationLayout::new(4, SystemSize::square(70000)),
            Err(BenchError::InvalidConfig(_))
        ));
        let layout = SpecializationLayout::new(4, SystemSize::square(65535)).unwrap();
        assert_eq!(layout.input_stride[2], 65535 * 65535);
    }

    #[test]
    fn map_entries_cover_ids_one_to_six() {
        let entries = SpecializationLayout::map_entries();
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.constant_id, i as u32 + 1);
            assert_eq!(entry.offset, 4 * i as u32);
            assert_eq!(entry.size, 4);
        }
        assert_eq!(size_of::<SpecializationLayout>(), 24);
    }

    #[test]
    fn specialization_bytes_follow_declaration_order() {
        let layout = SpecializationLayout::new(32, SystemSize::square(64)).unwrap();
        let words: &[u32] = bytemuck::cast_slice(bytemuck::bytes_of(&layout));
        assert_eq!(words, &[8, 8, 1, 1, 64, 64 * 64]);
    }

    #[test]
    fn push_constants_are_zero() {
        assert_eq!(PushConstants::default().push_id, 0);
        assert_eq!(size_of::<PushConstants>(), 4);
    }

    proptest! {
        #[test]
        fn strides_follow_width_and_height(w in 1u32..=64, h in 1u32..=64, c in 1u32..=4) {
            let edge = [1u32, 2, 4, 8][c as usize - 1];
            let size = SystemSize { width: w * edge, height: h * edge, depth: 1 };
            let layout = SpecializationLayout::new(edge * 4, size).unwrap();
            prop_assert_eq!(layout.input_stride, [1, size.width, size.width * size.height]);
        }

        #[test]
        fn grid_times_workgroup_covers_system(n in 1u32..=128, c in 1u32..=32) {
            let coalesced = c * 4;
            let size = SystemSize::square(n * c);
            let layout = SpecializationLayout::new(coalesced, size).unwrap();
            let grid = layout.dispatch_grid(size);
            for d in 0..3 {
                prop_assert_eq!(grid[d] * layout.local_size[d], size.as_array()[d]);
            }
        }
    }
}
