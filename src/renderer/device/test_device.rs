//! In-memory [`GpuDevice`] for unit tests. Records every call in order, keeps host copies of
//! buffer and image contents and replays recorded copies when their command buffer is submitted.

use std::{ops::Range, sync::Arc};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{
    descriptors::DescriptorBinding, sampler::SamplerDesc, AccelerationStructureDesc, BarrierBatch, BlasBuild,
    BufferDesc, BuildSizes, DescriptorWrite, DeviceProperties, GpuDevice, GraphicsPipelineInfo, ImageDesc,
    NativeAccelerationStructure, NativeBuffer, NativeImage, QueueType, RayTracingPipelineInfo, RenderingDesc,
    ShaderStage, SubmitDesc, SwapchainInfo, TriangleGeometry,
};

pub(crate) const SCRATCH_BYTES_PER_TRIANGLE: vk::DeviceSize = 100;
const SWAPCHAIN_IMAGES: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    CreateBuffer {
        name: String,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        address: vk::DeviceAddress,
    },
    DestroyBuffer(vk::Buffer),
    CreateImage(vk::Image),
    DestroyImage(vk::Image),
    CreateAccelerationStructure(vk::AccelerationStructureKHR),
    DestroyAccelerationStructure(vk::AccelerationStructureKHR),
    CreateSampler(vk::Sampler),
    DestroySampler(vk::Sampler),
    CreateDescriptorSetLayout(vk::DescriptorSetLayout),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreateDescriptorPool(vk::DescriptorPool),
    ResetDescriptorPool(vk::DescriptorPool),
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSet(vk::DescriptorSet),
    /// Set and number of writes.
    UpdateDescriptorSet(vk::DescriptorSet, usize),
    CreatePipelineLayout(vk::PipelineLayout),
    DestroyPipelineLayout(vk::PipelineLayout),
    CreateGraphicsPipeline(vk::Pipeline),
    CreateComputePipeline(vk::Pipeline),
    CreateRayTracingPipeline(vk::Pipeline),
    DestroyPipeline(vk::Pipeline),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitForFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandPool(vk::CommandPool),
    ResetCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandBuffer),
    Submit {
        queue: QueueType,
        command_buffers: usize,
        waits: Vec<vk::Semaphore>,
        signals: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    AcquireNextImage(u32),
    Present {
        image_index: u32,
        waits: Vec<vk::Semaphore>,
    },
    PipelineBarrier {
        buffers: usize,
        images: usize,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: usize,
    },
    /// One per region.
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        src_offset: vk::DeviceSize,
        mip: u32,
    },
    CopyImage {
        src: vk::Image,
        dst: vk::Image,
    },
    BuildAccelerationStructures(Vec<BlasBuild>),
    BeginRendering {
        color: usize,
        depth: bool,
        view_mask: u32,
    },
    EndRendering,
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        first_set: u32,
        count: usize,
    },
    PushConstants(Vec<u8>),
    BindIndexBuffer(vk::Buffer),
    Draw,
    DrawIndexed,
    DrawIndexedIndirect(vk::Buffer),
    Dispatch([u32; 3]),
    DispatchIndirect(vk::Buffer),
    BeginLabel(String),
    EndLabel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    /// Submitted, completes as soon as someone waits on it.
    Pending,
}

/// Copies replayed at submission.
enum Recorded {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        regions: Vec<vk::BufferImageCopy>,
    },
}

struct ImageMemory {
    format: vk::Format,
    extent: vk::Extent2D,
    array_layers: u32,
    mips: HashMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    calls: Vec<Call>,
    barriers: Vec<BarrierBatch>,
    fail_next: Option<vk::Result>,
    stall_fences: bool,
    device_lost: bool,
    fences: HashMap<vk::Fence, FenceState>,
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    images: HashMap<vk::Image, ImageMemory>,
    recorded: HashMap<vk::CommandBuffer, Vec<Recorded>>,
    names: HashMap<u64, String>,
    image_descriptors: HashMap<(vk::DescriptorSet, u32, u32), vk::ImageView>,
    swapchain: Vec<NativeImage>,
    next_image: u32,
    address_offset: vk::DeviceSize,
}

impl State {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn creation(&mut self) -> VkResult<()> {
        match self.fail_next.take() {
            Some(result) => Err(result),
            None => Ok(()),
        }
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, recorded: Recorded) {
        self.recorded.entry(command_buffer).or_default().push(recorded);
    }

    fn execute(&mut self, command_buffer: vk::CommandBuffer) {
        for recorded in self.recorded.remove(&command_buffer).unwrap_or_default() {
            match recorded {
                Recorded::CopyBuffer { src, dst, regions } => {
                    for region in regions {
                        let bytes = self.buffers[&src]
                            [region.src_offset as usize..(region.src_offset + region.size) as usize]
                            .to_vec();
                        let dst = self.buffers.entry(dst).or_default();
                        write_at(dst, region.dst_offset as usize, &bytes);
                    }
                }
                Recorded::CopyBufferToImage { src, dst, regions } => {
                    for region in regions {
                        let image = match self.images.get(&dst) {
                            Some(image) => image,
                            None => continue,
                        };
                        let width = (image.extent.width >> region.image_subresource.mip_level).max(1);
                        let height = (image.extent.height >> region.image_subresource.mip_level).max(1);
                        let len = (width * height * image.array_layers) as usize * texel_size(image.format);
                        let start = region.buffer_offset as usize;
                        let bytes = self.buffers[&src][start..start + len].to_vec();
                        if let Some(image) = self.images.get_mut(&dst) {
                            image.mips.insert(region.image_subresource.mip_level, bytes);
                        }
                    }
                }
            }
        }
    }
}

fn write_at(memory: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if memory.len() < offset + data.len() {
        memory.resize(offset + data.len(), 0);
    }
    memory[offset..offset + data.len()].copy_from_slice(data);
}

fn texel_size(format: vk::Format) -> usize {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT => 2,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

pub(crate) struct TestDevice {
    state: Mutex<State>,
}

impl TestDevice {
    pub(crate) fn new() -> Arc<TestDevice> {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();

        let mut state = State::default();
        state.swapchain = (0..SWAPCHAIN_IMAGES)
            .map(|_| NativeImage {
                image: state.handle(),
                view: state.handle(),
            })
            .collect();
        Arc::new(TestDevice {
            state: Mutex::new(state),
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Every barrier batch recorded so far, in order.
    pub(crate) fn barriers(&self) -> Vec<BarrierBatch> {
        self.state.lock().barriers.clone()
    }

    /// The next creation or allocation call of any kind fails with `result`.
    pub(crate) fn fail_next_creation(&self, result: vk::Result) {
        self.state.lock().fail_next = Some(result);
    }

    /// Buffers created from now on report device addresses `offset` bytes past their usual,
    /// 4 GiB aligned, value.
    pub(crate) fn offset_buffer_addresses(&self, offset: vk::DeviceSize) {
        self.state.lock().address_offset = offset;
    }

    /// Submitted fences never signal, waiting on them times out.
    pub(crate) fn stall_fences(&self) {
        self.state.lock().stall_fences = true;
    }

    /// Every following submission reports a lost device.
    pub(crate) fn lose_device(&self) {
        self.state.lock().device_lost = true;
    }

    pub(crate) fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.lock().buffers.get(&buffer).cloned().unwrap_or_default()
    }

    pub(crate) fn image_contents(&self, image: vk::Image, mip: u32) -> Vec<u8> {
        self.state
            .lock()
            .images
            .get(&image)
            .and_then(|image| image.mips.get(&mip).cloned())
            .unwrap_or_default()
    }

    /// View written to `element` of image `binding` of `set`, if any.
    pub(crate) fn image_descriptor(&self, set: vk::DescriptorSet, binding: u32, element: u32) -> Option<vk::ImageView> {
        self.state
            .lock()
            .image_descriptors
            .get(&(set, binding, element))
            .copied()
    }

    pub(crate) fn object_name(&self, raw: u64) -> Option<String> {
        self.state.lock().names.get(&raw).cloned()
    }

    fn push(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
}

impl GpuDevice for TestDevice {
    fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            graphics_queue_family: 0,
            transfer_queue_family: 1,
            min_acceleration_structure_scratch_offset_alignment: 128,
        }
    }

    fn swapchain(&self) -> SwapchainInfo {
        SwapchainInfo {
            images: self.state.lock().swapchain.clone(),
            format: vk::Format::B8G8R8A8_SRGB,
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
        }
    }

    fn set_object_name(&self, _ty: vk::ObjectType, handle: u64, name: &str) -> VkResult<()> {
        self.state.lock().names.insert(handle, name.to_string());
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if *fence == FenceState::Pending {
                *fence = FenceState::Signaled;
            }
        }
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<NativeBuffer> {
        let mut state = self.state.lock();
        state.creation()?;
        let buffer: vk::Buffer = state.handle();
        let address = (buffer.as_raw() << 32) + state.address_offset;
        state.buffers.insert(buffer, vec![0; desc.size as usize]);
        state.calls.push(Call::CreateBuffer {
            name: desc.name.to_string(),
            buffer,
            size: desc.size,
            address,
        });
        Ok(NativeBuffer { buffer, address })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.calls.push(Call::DestroyBuffer(buffer));
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        let mut state = self.state.lock();
        let memory = state
            .buffers
            .get_mut(&buffer)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        write_at(memory, offset as usize, data);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<NativeImage> {
        let mut state = self.state.lock();
        state.creation()?;
        let image = state.handle();
        let view = state.handle();
        state.images.insert(
            image,
            ImageMemory {
                format: desc.format,
                extent: desc.extent,
                array_layers: desc.array_layers,
                mips: HashMap::new(),
            },
        );
        state.calls.push(Call::CreateImage(image));
        Ok(NativeImage { image, view })
    }

    fn destroy_image(&self, image: NativeImage) {
        let mut state = self.state.lock();
        state.images.remove(&image.image);
        state.calls.push(Call::DestroyImage(image.image));
    }

    fn create_acceleration_structure(&self, desc: &AccelerationStructureDesc) -> VkResult<NativeAccelerationStructure> {
        let mut state = self.state.lock();
        state.creation()?;
        debug_assert!(state.buffers.contains_key(&desc.buffer));
        let handle: vk::AccelerationStructureKHR = state.handle();
        state.calls.push(Call::CreateAccelerationStructure(handle));
        Ok(NativeAccelerationStructure {
            handle,
            address: handle.as_raw() << 32,
        })
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        self.push(Call::DestroyAccelerationStructure(handle));
    }

    fn blas_build_sizes(&self, geometry: &TriangleGeometry) -> BuildSizes {
        let triangles = geometry.primitive_count as vk::DeviceSize;
        BuildSizes {
            acceleration_structure_size: triangles * 64,
            build_scratch_size: triangles * SCRATCH_BYTES_PER_TRIANGLE,
        }
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        let mut state = self.state.lock();
        state.creation()?;
        let sampler = state.handle();
        state.calls.push(Call::CreateSampler(sampler));
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.push(Call::DestroySampler(sampler));
    }

    fn create_descriptor_set_layout(&self, _bindings: &[DescriptorBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        state.creation()?;
        let layout = state.handle();
        state.calls.push(Call::CreateDescriptorSetLayout(layout));
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.push(Call::DestroyDescriptorSetLayout(layout));
    }

    fn create_descriptor_pool(&self, _max_sets: u32, _sizes: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        state.creation()?;
        let pool = state.handle();
        state.calls.push(Call::CreateDescriptorPool(pool));
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        self.push(Call::ResetDescriptorPool(pool));
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.push(Call::DestroyDescriptorPool(pool));
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        state.creation()?;
        let set = state.handle();
        state.calls.push(Call::AllocateDescriptorSet(set));
        Ok(set)
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        for write in writes {
            if let DescriptorWrite::Image {
                binding,
                array_element,
                view,
                ..
            } = *write
            {
                state.image_descriptors.insert((set, binding, array_element), view);
            }
        }
        state.calls.push(Call::UpdateDescriptorSet(set, writes.len()));
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let mut state = self.state.lock();
        state.creation()?;
        let layout = state.handle();
        state.calls.push(Call::CreatePipelineLayout(layout));
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.push(Call::DestroyPipelineLayout(layout));
    }

    fn create_graphics_pipeline(&self, _info: &GraphicsPipelineInfo) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        state.creation()?;
        let pipeline = state.handle();
        state.calls.push(Call::CreateGraphicsPipeline(pipeline));
        Ok(pipeline)
    }

    fn create_compute_pipeline(
        &self,
        _name: &str,
        _layout: vk::PipelineLayout,
        _stage: &ShaderStage,
    ) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        state.creation()?;
        let pipeline = state.handle();
        state.calls.push(Call::CreateComputePipeline(pipeline));
        Ok(pipeline)
    }

    fn create_ray_tracing_pipeline(&self, _info: &RayTracingPipelineInfo) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        state.creation()?;
        let pipeline = state.handle();
        state.calls.push(Call::CreateRayTracingPipeline(pipeline));
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.push(Call::DestroyPipeline(pipeline));
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        state.creation()?;
        let fence = state.handle();
        let fence_state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, fence_state);
        state.calls.push(Call::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.calls.push(Call::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitForFence(fence));
        let fence_state = state
            .fences
            .get_mut(&fence)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        match *fence_state {
            FenceState::Signaled => Ok(()),
            FenceState::Pending => {
                *fence_state = FenceState::Signaled;
                Ok(())
            }
            FenceState::Unsignaled => Err(vk::Result::TIMEOUT),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::ResetFence(fence));
        let fence_state = state
            .fences
            .get_mut(&fence)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        debug_assert_ne!(*fence_state, FenceState::Pending, "resetting a fence that is still in use");
        *fence_state = FenceState::Unsignaled;
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        state.creation()?;
        let semaphore = state.handle();
        state.calls.push(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.push(Call::DestroySemaphore(semaphore));
    }

    fn create_command_pool(&self, _queue: QueueType) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        state.creation()?;
        let pool = state.handle();
        state.calls.push(Call::CreateCommandPool(pool));
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        self.push(Call::ResetCommandPool(pool));
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.push(Call::DestroyCommandPool(pool));
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        state.creation()?;
        let command_buffer = state.handle();
        state.calls.push(Call::AllocateCommandBuffer(command_buffer));
        Ok(command_buffer)
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.state.lock().recorded.remove(&command_buffer);
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn submit(&self, queue: QueueType, submit: &SubmitDesc, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Submit {
            queue,
            command_buffers: submit.command_buffers.len(),
            waits: submit.wait.iter().map(|wait| wait.semaphore).collect(),
            signals: submit.signal.to_vec(),
            fence,
        });
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        for &command_buffer in submit.command_buffers {
            state.execute(command_buffer);
        }
        if fence != vk::Fence::null() && !state.stall_fences {
            state.fences.insert(fence, FenceState::Pending);
        }
        Ok(())
    }

    fn acquire_next_image(&self, _semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        let index = state.next_image;
        state.next_image = (index + 1) % SWAPCHAIN_IMAGES as u32;
        state.calls.push(Call::AcquireNextImage(index));
        Ok((index, false))
    }

    fn present(&self, image_index: u32, wait: &[vk::Semaphore]) -> VkResult<bool> {
        self.push(Call::Present {
            image_index,
            waits: wait.to_vec(),
        });
        Ok(false)
    }

    fn cmd_pipeline_barrier(&self, _command_buffer: vk::CommandBuffer, barriers: &BarrierBatch) {
        let mut state = self.state.lock();
        state.calls.push(Call::PipelineBarrier {
            buffers: barriers.buffers.len(),
            images: barriers.images.len(),
        });
        state.barriers.push(barriers.clone());
    }

    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        let mut state = self.state.lock();
        state.calls.push(Call::CopyBuffer {
            src,
            dst,
            regions: regions.len(),
        });
        state.record(
            command_buffer,
            Recorded::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        let mut state = self.state.lock();
        for region in regions {
            state.calls.push(Call::CopyBufferToImage {
                src,
                dst,
                src_offset: region.buffer_offset,
                mip: region.image_subresource.mip_level,
            });
        }
        state.record(
            command_buffer,
            Recorded::CopyBufferToImage {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image(&self, _command_buffer: vk::CommandBuffer, src: vk::Image, dst: vk::Image, _regions: &[vk::ImageCopy]) {
        self.push(Call::CopyImage { src, dst });
    }

    fn cmd_build_acceleration_structures(&self, _command_buffer: vk::CommandBuffer, builds: &[BlasBuild]) {
        self.push(Call::BuildAccelerationStructures(builds.to_vec()));
    }

    fn cmd_begin_rendering(&self, _command_buffer: vk::CommandBuffer, rendering: &RenderingDesc) {
        self.push(Call::BeginRendering {
            color: rendering.color.len(),
            depth: rendering.depth.is_some(),
            view_mask: rendering.view_mask,
        });
    }

    fn cmd_end_rendering(&self, _command_buffer: vk::CommandBuffer) {
        self.push(Call::EndRendering);
    }

    fn cmd_set_viewport_and_scissor(&self, _command_buffer: vk::CommandBuffer, _area: vk::Rect2D) {}

    fn cmd_bind_pipeline(&self, _command_buffer: vk::CommandBuffer, _bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.push(Call::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.push(Call::BindDescriptorSets {
            first_set,
            count: sets.len(),
        });
    }

    fn cmd_push_constants(
        &self,
        _command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        data: &[u8],
    ) {
        self.push(Call::PushConstants(data.to_vec()));
    }

    fn cmd_bind_index_buffer(
        &self,
        _command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _index_type: vk::IndexType,
    ) {
        self.push(Call::BindIndexBuffer(buffer));
    }

    fn cmd_draw(&self, _command_buffer: vk::CommandBuffer, _vertices: Range<u32>, _instances: Range<u32>) {
        self.push(Call::Draw);
    }

    fn cmd_draw_indexed(
        &self,
        _command_buffer: vk::CommandBuffer,
        _indices: Range<u32>,
        _vertex_offset: i32,
        _instances: Range<u32>,
    ) {
        self.push(Call::DrawIndexed);
    }

    fn cmd_draw_indexed_indirect(
        &self,
        _command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _draw_count: u32,
        _stride: u32,
    ) {
        self.push(Call::DrawIndexedIndirect(buffer));
    }

    fn cmd_dispatch(&self, _command_buffer: vk::CommandBuffer, workgroups: [u32; 3]) {
        self.push(Call::Dispatch(workgroups));
    }

    fn cmd_dispatch_indirect(&self, _command_buffer: vk::CommandBuffer, buffer: vk::Buffer, _offset: vk::DeviceSize) {
        self.push(Call::DispatchIndirect(buffer));
    }

    fn cmd_begin_label(&self, _command_buffer: vk::CommandBuffer, name: &str, _color: [f32; 4]) {
        self.push(Call::BeginLabel(name.to_string()));
    }

    fn cmd_end_label(&self, _command_buffer: vk::CommandBuffer) {
        self.push(Call::EndLabel);
    }
}
