use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};
pub use gpu_allocator::MemoryLocation;
use smallvec::SmallVec;
use tracing::warn;

pub(crate) mod commands;
pub mod descriptors;
pub(crate) mod double_buffered;
pub mod pipeline;
pub mod sampler;
pub(crate) mod sync;
#[cfg(test)]
pub(crate) mod test_device;
pub mod vulkan;

pub(crate) use self::{commands::CommandAllocator, double_buffered::DoubleBuffered, sync::SemaphorePool};
use self::{
    descriptors::DescriptorBinding,
    pipeline::{RasterState, RenderTargetFormats},
    sampler::SamplerDesc,
};

/// Upper bound for the number of frame slots, matches the inline capacity of [`DoubleBuffered`].
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Transfer,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceProperties {
    pub graphics_queue_family: u32,
    pub transfer_queue_family: u32,
    pub min_acceleration_structure_scratch_offset_alignment: vk::DeviceSize,
}

pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

#[derive(Clone, Copy, Debug)]
pub struct NativeBuffer {
    pub buffer: vk::Buffer,
    pub address: vk::DeviceAddress,
}

pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

#[derive(Clone, Copy, Debug)]
pub struct NativeImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

pub struct AccelerationStructureDesc<'a> {
    pub name: &'a str,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug)]
pub struct NativeAccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
}

/// Triangle geometry of one bottom-level build, by device address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub max_vertex: u32,
    pub index_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
    pub primitive_count: u32,
    pub opaque: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlasBuild {
    pub destination: vk::AccelerationStructureKHR,
    pub geometry: TriangleGeometry,
    pub scratch_address: vk::DeviceAddress,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// Queue family ownership transfer of an exclusive image. The same barrier is recorded twice, once
/// on a queue of `src_family` to release and once on a queue of `dst_family` to acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOwnership {
    pub src_family: u32,
    pub dst_family: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub range: vk::ImageSubresourceRange,
    pub ownership: Option<QueueOwnership>,
}

/// One dependency operation.
#[derive(Clone, Debug, Default)]
pub struct BarrierBatch {
    pub buffers: SmallVec<[BufferBarrier; 8]>,
    pub images: SmallVec<[ImageBarrier; 8]>,
}

impl BarrierBatch {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
}

pub struct SubmitDesc<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait: &'a [SemaphoreWait],
    pub signal: &'a [vk::Semaphore],
}

#[derive(Clone, Copy)]
pub struct AttachmentInfo {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
}

pub struct RenderingDesc<'a> {
    pub area: vk::Rect2D,
    pub layer_count: u32,
    pub view_mask: u32,
    pub color: &'a [AttachmentInfo],
    pub depth: Option<AttachmentInfo>,
    pub shading_rate: Option<(vk::ImageView, vk::Extent2D)>,
}

#[derive(Clone, Copy, Debug)]
pub enum DescriptorWrite {
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Image {
        binding: u32,
        /// Element of an arrayed binding.
        array_element: u32,
        ty: vk::DescriptorType,
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
    AccelerationStructure {
        binding: u32,
        handle: vk::AccelerationStructureKHR,
    },
}

#[derive(Clone, Copy)]
pub struct ShaderStage<'a> {
    pub stage: vk::ShaderStageFlags,
    pub spirv: &'a [u32],
    pub entry_point: &'a str,
}

pub struct GraphicsPipelineInfo<'a> {
    pub name: &'a str,
    pub layout: vk::PipelineLayout,
    pub stages: &'a [ShaderStage<'a>],
    pub state: &'a RasterState,
    pub formats: &'a RenderTargetFormats,
}

pub struct RayTracingPipelineInfo<'a> {
    pub name: &'a str,
    pub layout: vk::PipelineLayout,
    pub raygen: ShaderStage<'a>,
    pub miss: &'a [ShaderStage<'a>],
    pub closest_hit: &'a [ShaderStage<'a>],
    pub max_recursion_depth: u32,
}

#[derive(Clone, Debug)]
pub struct SwapchainInfo {
    pub images: Vec<NativeImage>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Everything the backend needs from the native graphics API. Implementations are internally
/// synchronized; the backend itself records from one thread.
pub trait GpuDevice: Send + Sync {
    fn properties(&self) -> DeviceProperties;
    fn swapchain(&self) -> SwapchainInfo;
    fn set_object_name(&self, ty: vk::ObjectType, handle: u64, name: &str) -> VkResult<()>;
    fn wait_idle(&self) -> VkResult<()>;

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<NativeBuffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Writes into a host-visible buffer.
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()>;
    fn create_image(&self, desc: &ImageDesc) -> VkResult<NativeImage>;
    fn destroy_image(&self, image: NativeImage);
    fn create_acceleration_structure(&self, desc: &AccelerationStructureDesc) -> VkResult<NativeAccelerationStructure>;
    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);
    fn blas_build_sizes(&self, geometry: &TriangleGeometry) -> BuildSizes;
    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&self, info: &GraphicsPipelineInfo) -> VkResult<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        name: &str,
        layout: vk::PipelineLayout,
        stage: &ShaderStage,
    ) -> VkResult<vk::Pipeline>;
    fn create_ray_tracing_pipeline(&self, info: &RayTracingPipelineInfo) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(&self, queue: QueueType) -> VkResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn submit(&self, queue: QueueType, submit: &SubmitDesc, fence: vk::Fence) -> VkResult<()>;

    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(&self, semaphore: vk::Semaphore) -> VkResult<(u32, bool)>;
    /// Returns whether the swapchain is suboptimal.
    fn present(&self, image_index: u32, wait: &[vk::Semaphore]) -> VkResult<bool>;

    fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barriers: &BarrierBatch);
    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_copy_image(&self, command_buffer: vk::CommandBuffer, src: vk::Image, dst: vk::Image, regions: &[vk::ImageCopy]);
    fn cmd_build_acceleration_structures(&self, command_buffer: vk::CommandBuffer, builds: &[BlasBuild]);
    fn cmd_begin_rendering(&self, command_buffer: vk::CommandBuffer, rendering: &RenderingDesc);
    fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer);
    fn cmd_set_viewport_and_scissor(&self, command_buffer: vk::CommandBuffer, area: vk::Rect2D);
    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>);
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        indices: std::ops::Range<u32>,
        vertex_offset: i32,
        instances: std::ops::Range<u32>,
    );
    fn cmd_draw_indexed_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    );
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, workgroups: [u32; 3]);
    fn cmd_dispatch_indirect(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize);
    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]);
    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer);
}

impl<'a> dyn GpuDevice + 'a {
    /// Debug naming is cosmetic, failures are only logged.
    pub fn name_object<H: Handle>(&self, handle: H, name: &str) {
        let raw = handle.as_raw();
        if let Err(result) = self.set_object_name(H::TYPE, raw, name) {
            warn!(%result, name, raw, "failed to set object name");
        }
    }
}
