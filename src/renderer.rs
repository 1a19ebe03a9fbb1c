//! Frame-scheduled GPU resource and command submission core. [`RenderBackend`] owns K frame
//! slots; everything destroyed or handed out during a frame is only reclaimed once that frame's
//! slot fence has been waited on again.

pub mod alloc;
pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod helpers;
pub mod pool;
pub mod resources;
pub mod upload;
pub mod systems {
    pub mod acceleration_structures;
    pub mod mesh_storage;
    pub mod scatter_upload;
    pub mod texture_descriptor_pool;
}

use std::sync::Arc;

use ash::vk;
use profiling::scope;
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use self::{
    config::BackendConfig,
    device::{
        descriptors::{DescriptorSet, DescriptorSetAllocator, DescriptorSetBuilder},
        pipeline::PipelineCache,
        BarrierBatch, CommandAllocator, DoubleBuffered, GpuDevice, QueueType, SemaphorePool, SemaphoreWait,
        SubmitDesc, MAX_FRAMES_IN_FLIGHT,
    },
    error::{fatal, BackendError},
    graph::{barriers::BarrierTracker, RenderGraph},
    resources::{ResourceAllocator, TextureHandle},
    systems::acceleration_structures::BlasBuildQueue,
    upload::{BufferUploadJob, TextureUploadJob, UploadQueue},
};

/// Which allocator a descriptor set comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorLifetime {
    /// Lives until the persistent pools are destroyed.
    Persistent,
    /// Invalidated when the current frame slot comes around again.
    Frame,
}

struct FrameSlot {
    fence: vk::Fence,
    graphics_commands: CommandAllocator,
    transfer_commands: CommandAllocator,
    /// Semaphores used by this slot's submissions, recycled after its fence was waited.
    zombie_semaphores: Vec<vk::Semaphore>,
    descriptors: DescriptorSetAllocator,
}

impl FrameSlot {
    fn new(device: &dyn GpuDevice, config: &BackendConfig, ix: usize) -> Result<FrameSlot, BackendError> {
        let fence = device
            .create_fence(true)
            .map_err(|result| BackendError::creation("fence", &format!("Frame fence {ix}"), "signaled", result))?;
        device.name_object(fence, &format!("Frame fence {ix}"));

        Ok(FrameSlot {
            fence,
            graphics_commands: CommandAllocator::new(device, QueueType::Graphics, &format!("Graphics commands {ix}"))?,
            transfer_commands: CommandAllocator::new(device, QueueType::Transfer, &format!("Transfer commands {ix}"))?,
            zombie_semaphores: vec![],
            descriptors: DescriptorSetAllocator::new(&format!("Frame descriptors {ix}"), config.descriptor_sets_per_pool),
        })
    }
}

pub struct RenderBackend {
    device: Arc<dyn GpuDevice>,
    config: BackendConfig,
    frames: DoubleBuffered<FrameSlot>,
    semaphores: SemaphorePool,
    resources: ResourceAllocator,
    pipelines: PipelineCache,
    persistent_descriptors: DescriptorSetAllocator,
    uploads: UploadQueue,
    blas_builds: BlasBuildQueue,
    /// Access state of every graph recorded since the last graphics submission.
    access_tracker: BarrierTracker,
    swapchain_textures: Vec<TextureHandle>,
    swapchain_image_index: u32,
    /// Signaled by the acquire, consumed by the first graphics submission that waits on it.
    swapchain_semaphore: Option<vk::Semaphore>,
    last_submission_semaphores: SmallVec<[vk::Semaphore; 2]>,
    queued_graphics: Vec<vk::CommandBuffer>,
    queued_transfer: Vec<vk::CommandBuffer>,
    frame_number: u64,
    first_frame: bool,
    /// The current slot's fence was reset and nothing signaling it has been submitted yet.
    fence_unsubmitted: bool,
}

impl RenderBackend {
    pub fn new(device: Arc<dyn GpuDevice>, config: BackendConfig) -> Result<RenderBackend, BackendError> {
        scope!("backend", "new");

        let mut config = config;
        config.frames_in_flight = config.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);

        let frames = DoubleBuffered::try_new(config.frames_in_flight, |ix| FrameSlot::new(&*device, &config, ix))?;
        let mut resources = ResourceAllocator::new(device.clone(), &config);

        let swapchain = device.swapchain();
        let swapchain_textures = swapchain
            .images
            .iter()
            .enumerate()
            .map(|(ix, &image)| {
                resources.import_swapchain_image(
                    &format!("Swapchain image {ix}"),
                    image,
                    swapchain.format,
                    swapchain.extent,
                )
            })
            .collect::<Vec<_>>();

        info!(
            frames_in_flight = config.frames_in_flight,
            swapchain_images = swapchain_textures.len(),
            format = ?swapchain.format,
            "render backend ready"
        );

        Ok(RenderBackend {
            pipelines: PipelineCache::new(device.clone()),
            persistent_descriptors: DescriptorSetAllocator::new("Persistent descriptors", config.descriptor_sets_per_pool),
            uploads: UploadQueue::default(),
            blas_builds: BlasBuildQueue::new(&config),
            access_tracker: BarrierTracker::default(),
            semaphores: SemaphorePool::default(),
            swapchain_textures,
            swapchain_image_index: 0,
            swapchain_semaphore: None,
            last_submission_semaphores: SmallVec::new(),
            queued_graphics: vec![],
            queued_transfer: vec![],
            frame_number: 0,
            first_frame: true,
            fence_unsubmitted: false,
            frames,
            resources,
            device,
            config,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn resources(&self) -> &ResourceAllocator {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceAllocator {
        &mut self.resources
    }

    pub fn pipelines(&mut self) -> &mut PipelineCache {
        &mut self.pipelines
    }

    pub fn upload_queue(&mut self) -> &mut UploadQueue {
        &mut self.uploads
    }

    /// Queues `job` for the next flush. Graphs recorded afterwards see the texture in
    /// `SHADER_READ_ONLY_OPTIMAL`. If a graph waiting for the flush already used the texture, the
    /// queued work is flushed first so the copy lands after it.
    pub fn enqueue_texture_upload(&mut self, job: TextureUploadJob) {
        if self.access_tracker.touches_texture(job.destination) {
            debug!(
                texture = %self.resources.texture(job.destination).name,
                "upload to a texture used by queued graphs, flushing first"
            );
            self.flush_batched_command_buffers();
        }
        self.uploads.enqueue_texture(&mut self.resources, job);
    }

    pub fn enqueue_buffer_upload(&mut self, job: BufferUploadJob) {
        self.uploads.enqueue_buffer(job);
    }

    pub fn blas_build_queue(&mut self) -> &mut BlasBuildQueue {
        &mut self.blas_builds
    }

    /// Texture wrapping the swapchain image acquired by the last [`RenderBackend::advance_frame`].
    pub fn swapchain_texture(&self) -> TextureHandle {
        self.swapchain_textures[self.swapchain_image_index as usize]
    }

    pub fn swapchain_image_index(&self) -> u32 {
        self.swapchain_image_index
    }

    /// Hands out a semaphore that stays parked on the current slot until its fence is waited.
    fn transient_semaphore(&mut self) -> vk::Semaphore {
        let semaphore = match self.semaphores.get(&*self.device) {
            Ok(semaphore) => semaphore,
            Err(error) => fatal("transient semaphore creation", error),
        };
        self.frames
            .current_mut(self.frame_number)
            .zombie_semaphores
            .push(semaphore);
        semaphore
    }

    fn submit(&self, queue: QueueType, submit: &SubmitDesc, fence: vk::Fence) {
        scope!("vk", "vkQueueSubmit");

        match self.device.submit(queue, submit, fence) {
            Ok(()) => {}
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                error!(frame = self.frame_number, ?queue, "device lost during submission");
                fatal("queue submission", vk::Result::ERROR_DEVICE_LOST)
            }
            Err(result) => fatal("queue submission", result),
        }
    }

    fn take_submission_waits(&mut self) -> SmallVec<[SemaphoreWait; 4]> {
        self.last_submission_semaphores
            .drain(..)
            .map(|semaphore| SemaphoreWait {
                semaphore,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            })
            .collect()
    }

    /// Everything still pending a wait this frame: the chain of the last flush and an
    /// unconsumed acquire.
    fn take_pending_waits(&mut self) -> SmallVec<[SemaphoreWait; 4]> {
        let mut waits = self.take_submission_waits();
        if let Some(semaphore) = self.swapchain_semaphore.take() {
            waits.push(SemaphoreWait {
                semaphore,
                stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            });
        }
        waits
    }

    /// Signals the current slot's fence once everything submitted before has finished.
    fn submit_frame_fence(&mut self, signal: &[vk::Semaphore]) {
        let waits = self.take_pending_waits();
        let fence = self.frames.current(self.frame_number).fence;
        self.submit(
            QueueType::Graphics,
            &SubmitDesc {
                command_buffers: &[],
                wait: &waits,
                signal,
            },
            fence,
        );
        self.fence_unsubmitted = false;
    }

    /// Moves on to the next frame slot, blocking until the GPU is done with its previous use.
    pub fn advance_frame(&mut self) {
        scope!("backend", "advance_frame");

        if self.fence_unsubmitted {
            warn!(frame = self.frame_number, "frame ended without present, signaling its fence");
            if self.has_unflushed_work() {
                self.flush_batched_command_buffers();
            }
            self.submit_frame_fence(&[]);
        }
        self.access_tracker.reset();

        if !self.first_frame {
            self.frame_number += 1;
        }
        let slot_ix = (self.frame_number % self.frames.len() as u64) as usize;
        trace!(frame = self.frame_number, slot = slot_ix, "beginning frame");

        let fence = self.frames[slot_ix].fence;
        {
            scope!("backend", "wait for previous frame");
            if let Err(result) = self.device.wait_for_fence(fence, self.config.fence_timeout_ns) {
                fatal("frame fence wait", result);
            }
        }

        self.resources.begin_frame(self.frame_number);
        if !self.first_frame {
            let device = &*self.device;
            let slot = &mut self.frames[slot_ix];
            slot.graphics_commands.reset(device);
            slot.transfer_commands.reset(device);
            self.semaphores.recycle(slot.zombie_semaphores.drain(..));
            self.resources.free_resources_for_frame(slot_ix);
            slot.descriptors.reset_pools(device);
        }

        let semaphore = self.transient_semaphore();
        let image_index = {
            scope!("backend", "acquire swapchain image");
            match self.device.acquire_next_image(semaphore) {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        warn!(index, "swapchain is suboptimal");
                    }
                    index
                }
                Err(result) => fatal("swapchain image acquisition", result),
            }
        };
        self.swapchain_image_index = image_index;
        self.swapchain_semaphore = Some(semaphore);
        // The presentation engine does not preserve contents between acquires.
        let swapchain_texture = self.swapchain_texture();
        self.resources
            .set_texture_layout(swapchain_texture, vk::ImageLayout::UNDEFINED);

        if let Err(result) = self.device.reset_fence(fence) {
            fatal("frame fence reset", result);
        }
        self.fence_unsubmitted = true;
        self.first_frame = false;
    }

    /// Records `graph` into a graphics command buffer of the current slot and queues it for the
    /// next flush. The graph's finish tasks run once it is queued.
    pub fn execute_graph(&mut self, graph: RenderGraph<'_>) {
        scope!("backend", "execute_graph");

        let device = &*self.device;
        let slot = self.frames.current_mut(self.frame_number);
        let command_buffer = match slot.graphics_commands.begin(device, graph.name()) {
            Ok(command_buffer) => command_buffer,
            Err(error) => fatal("graph command buffer allocation", error),
        };

        let finish_tasks = graph.record(
            command_buffer,
            &mut self.resources,
            &mut self.pipelines,
            &mut self.access_tracker,
        );

        if let Err(result) = device.end_command_buffer(command_buffer) {
            fatal("graph command buffer recording", result);
        }
        self.queued_graphics.push(command_buffer);

        for task in finish_tasks {
            task(&mut self.resources);
        }
    }

    /// Adds the pending BLAS builds to `graph`, see [`BlasBuildQueue::flush_pending_builds`].
    pub fn flush_pending_builds(&mut self, graph: &mut RenderGraph<'_>) -> Result<usize, BackendError> {
        self.blas_builds.flush_pending_builds(graph, &mut self.resources)
    }

    fn has_unflushed_work(&self) -> bool {
        !self.queued_graphics.is_empty() || !self.queued_transfer.is_empty() || !self.uploads.is_empty()
    }

    /// Records `barriers` alone into a graphics command buffer of the current slot.
    fn record_graphics_barriers(&mut self, name: &str, barriers: &BarrierBatch) -> vk::CommandBuffer {
        let device = &*self.device;
        let slot = self.frames.current_mut(self.frame_number);
        let command_buffer = match slot.graphics_commands.begin(device, name) {
            Ok(command_buffer) => command_buffer,
            Err(error) => fatal("barrier command buffer allocation", error),
        };
        device.cmd_pipeline_barrier(command_buffer, barriers);
        if let Err(result) = device.end_command_buffer(command_buffer) {
            fatal("barrier command buffer recording", result);
        }
        command_buffer
    }

    /// Submits pending uploads and queued graphs. Transfer work runs first, each submission
    /// waits on the previous one. Textures with live contents are released by the graphics
    /// queue before the copies and every uploaded texture is acquired back ahead of the graphs.
    pub fn flush_batched_command_buffers(&mut self) {
        scope!("backend", "flush_batched_command_buffers");

        let slot = self.frames.current_mut(self.frame_number);
        let batch = match self
            .uploads
            .flush_pending_uploads(&mut self.resources, &mut slot.transfer_commands)
        {
            Ok(batch) => batch,
            Err(error) => fatal("upload flush", error),
        };
        if let Some(batch) = batch {
            if !batch.graphics_release.is_empty() {
                let command_buffer = self.record_graphics_barriers("Upload release", &batch.graphics_release);
                let signal = self.transient_semaphore();
                let waits = self.take_submission_waits();
                self.submit(
                    QueueType::Graphics,
                    &SubmitDesc {
                        command_buffers: &[command_buffer],
                        wait: &waits,
                        signal: &[signal],
                    },
                    vk::Fence::null(),
                );
                self.frames
                    .current_mut(self.frame_number)
                    .graphics_commands
                    .return_command_buffer(command_buffer);
                self.last_submission_semaphores.push(signal);
            }
            self.queued_transfer.push(batch.command_buffer);
            if !batch.graphics_acquire.is_empty() {
                let command_buffer = self.record_graphics_barriers("Upload acquire", &batch.graphics_acquire);
                self.queued_graphics.insert(0, command_buffer);
            }
        }

        if self.queued_transfer.is_empty() && self.queued_graphics.is_empty() {
            warn!(frame = self.frame_number, "flush with no queued command buffers");
            return;
        }

        if !self.queued_transfer.is_empty() {
            let signal = self.transient_semaphore();
            let waits = self.take_submission_waits();
            let command_buffers = std::mem::take(&mut self.queued_transfer);
            self.submit(
                QueueType::Transfer,
                &SubmitDesc {
                    command_buffers: &command_buffers,
                    wait: &waits,
                    signal: &[signal],
                },
                vk::Fence::null(),
            );
            let slot = self.frames.current_mut(self.frame_number);
            for command_buffer in command_buffers {
                slot.transfer_commands.return_command_buffer(command_buffer);
            }
            self.last_submission_semaphores.push(signal);
        }

        if !self.queued_graphics.is_empty() {
            let signal = self.transient_semaphore();
            let waits = self.take_pending_waits();
            let command_buffers = std::mem::take(&mut self.queued_graphics);
            self.submit(
                QueueType::Graphics,
                &SubmitDesc {
                    command_buffers: &command_buffers,
                    wait: &waits,
                    signal: &[signal],
                },
                vk::Fence::null(),
            );
            let slot = self.frames.current_mut(self.frame_number);
            for command_buffer in command_buffers {
                slot.graphics_commands.return_command_buffer(command_buffer);
            }
            self.last_submission_semaphores.push(signal);
        }
        self.access_tracker.reset();
    }

    /// Signals the frame fence and presents the acquired swapchain image. The caller makes sure
    /// the image is in the presentable layout, see [`RenderGraph::add_present_pass`].
    pub fn present(&mut self) {
        scope!("backend", "present");

        if self.has_unflushed_work() {
            self.flush_batched_command_buffers();
        }

        let present_semaphore = self.transient_semaphore();
        self.submit_frame_fence(&[present_semaphore]);

        match self.device.present(self.swapchain_image_index, &[present_semaphore]) {
            Ok(false) => {}
            Ok(true) => warn!(index = self.swapchain_image_index, "swapchain is suboptimal"),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                warn!(index = self.swapchain_image_index, "swapchain is out of date")
            }
            Err(result) => fatal("present", result),
        }
        self.last_submission_semaphores.clear();
    }

    pub fn build_descriptor_set(
        &mut self,
        builder: DescriptorSetBuilder,
        lifetime: DescriptorLifetime,
    ) -> Result<DescriptorSet, BackendError> {
        let allocator = match lifetime {
            DescriptorLifetime::Persistent => &mut self.persistent_descriptors,
            DescriptorLifetime::Frame => &mut self.frames.current_mut(self.frame_number).descriptors,
        };
        builder.build(allocator, &self.resources)
    }

    pub fn wait_idle(&self) {
        if let Err(result) = self.device.wait_idle() {
            fatal("device wait idle", result);
        }
    }

    /// Waits for every frame slot and tears everything down.
    pub fn destroy(mut self) {
        scope!("backend", "destroy");

        if self.fence_unsubmitted {
            self.submit_frame_fence(&[]);
        }
        for slot in self.frames.iter() {
            if let Err(result) = self.device.wait_for_fence(slot.fence, self.config.fence_timeout_ns) {
                fatal("frame fence wait", result);
            }
        }
        self.wait_idle();

        let device = &*self.device;
        self.resources.destroy_all();
        self.pipelines.destroy();
        self.persistent_descriptors.destroy(device);
        for mut slot in self.frames.into_iter() {
            slot.graphics_commands.destroy(device);
            slot.transfer_commands.destroy(device);
            slot.descriptors.destroy(device);
            self.semaphores.recycle(slot.zombie_semaphores.drain(..));
            device.destroy_fence(slot.fence);
        }
        self.semaphores.destroy(device);
        info!(frames = self.frame_number + 1, "render backend destroyed");
    }
}
