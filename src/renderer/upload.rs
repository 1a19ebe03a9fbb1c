use ash::vk;
use indexmap::IndexMap;
use profiling::scope;
use smallvec::SmallVec;
use tracing::debug;

use super::{
    device::{BarrierBatch, BufferBarrier, CommandAllocator, ImageBarrier, QueueOwnership},
    error::BackendError,
    resources::{format_size, BufferHandle, BufferUsage, ResourceAllocator, TextureHandle},
};

/// Full contents of one mip level, tightly packed.
pub struct TextureUploadJob {
    pub destination: TextureHandle,
    pub mip: u32,
    pub data: Vec<u8>,
}

pub struct BufferUploadJob {
    pub buffer: BufferHandle,
    pub dest_offset: vk::DeviceSize,
    pub data: Vec<u8>,
}

/// Everything one flush produced.
pub(crate) struct UploadBatch {
    /// Transfer queue work: the copies bracketed by their barriers.
    pub(crate) command_buffer: vk::CommandBuffer,
    /// Hands destinations with live contents over to the transfer queue. Has to run on the
    /// graphics queue before `command_buffer` is submitted.
    pub(crate) graphics_release: BarrierBatch,
    /// Takes the uploaded textures back on the graphics queue, ahead of any graphics work that
    /// waits on the transfer submission.
    pub(crate) graphics_acquire: BarrierBatch,
}

/// Batches small host-to-device copies into a single staging buffer and a single transfer
/// command buffer per flush.
///
/// A texture's persistent layout becomes `SHADER_READ_ONLY_OPTIMAL` as soon as a job is queued
/// for it, so render graphs recorded before the flush already see the layout the copy leaves
/// behind.
#[derive(Default)]
pub struct UploadQueue {
    textures: Vec<TextureUploadJob>,
    buffers: Vec<BufferUploadJob>,
    /// Destination textures in first enqueue order, with the layout each had before its first job.
    destinations: IndexMap<TextureHandle, vk::ImageLayout>,
}

impl UploadQueue {
    pub fn enqueue_texture(&mut self, resources: &mut ResourceAllocator, job: TextureUploadJob) {
        let layout = resources.texture(job.destination).layout();
        self.destinations.entry(job.destination).or_insert(layout);
        resources.set_texture_layout(job.destination, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        self.textures.push(job);
    }

    pub fn enqueue_buffer(&mut self, job: BufferUploadJob) {
        self.buffers.push(job);
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty() && self.buffers.is_empty()
    }

    pub fn pending_bytes(&self) -> vk::DeviceSize {
        self.textures.iter().map(|job| job.data.len()).sum::<usize>() as vk::DeviceSize
            + self.buffers.iter().map(|job| job.data.len()).sum::<usize>() as vk::DeviceSize
    }

    /// Whether `texture` has contents waiting for the next flush.
    pub fn has_pending_texture(&self, texture: TextureHandle) -> bool {
        self.destinations.contains_key(&texture)
    }

    /// Records every queued job into one transfer command buffer. Each destination texture is
    /// transitioned once over its full subresource range, from the layout it had when its first
    /// job was queued.
    pub(crate) fn flush_pending_uploads(
        &mut self,
        resources: &mut ResourceAllocator,
        commands: &mut CommandAllocator,
    ) -> Result<Option<UploadBatch>, BackendError> {
        if self.is_empty() {
            return Ok(None);
        }
        scope!("upload", "flush_pending_uploads");

        let device = resources.device().clone();
        let properties = device.properties();
        let handoff = (properties.transfer_queue_family != properties.graphics_queue_family).then(|| {
            QueueOwnership {
                src_family: properties.graphics_queue_family,
                dst_family: properties.transfer_queue_family,
            }
        });

        let total = self.pending_bytes();
        let staging = resources.create_buffer("Upload staging", total, BufferUsage::Staging)?;
        let staging_buffer = resources.buffer(staging).buffer;

        let mut offset: vk::DeviceSize = 0;
        let mut texture_offsets = SmallVec::<[vk::DeviceSize; 16]>::with_capacity(self.textures.len());
        for job in &self.textures {
            resources.write_buffer(staging, offset, &job.data)?;
            texture_offsets.push(offset);
            offset += job.data.len() as vk::DeviceSize;
        }
        let mut buffer_offsets = SmallVec::<[vk::DeviceSize; 16]>::with_capacity(self.buffers.len());
        for job in &self.buffers {
            resources.write_buffer(staging, offset, &job.data)?;
            buffer_offsets.push(offset);
            offset += job.data.len() as vk::DeviceSize;
        }
        debug_assert_eq!(offset, total);

        let command_buffer = commands.begin(&*device, "Upload")?;

        let mut graphics_release = BarrierBatch::default();
        let mut before = BarrierBatch::default();
        let mut after = BarrierBatch::default();
        let mut graphics_acquire = BarrierBatch::default();
        for (&destination, &old_layout) in &self.destinations {
            let texture = resources.texture(destination);
            let range = texture.full_range();
            let transfer_dst = ImageBarrier {
                image: texture.image,
                src_stage: vk::PipelineStageFlags2::NONE,
                src_access: vk::AccessFlags2::NONE,
                dst_stage: vk::PipelineStageFlags2::TRANSFER,
                dst_access: vk::AccessFlags2::TRANSFER_WRITE,
                old_layout,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                range,
                ownership: None,
            };
            match handoff {
                // Undefined contents need no release, the acquire side alone is enough.
                Some(ownership) if old_layout != vk::ImageLayout::UNDEFINED => {
                    graphics_release.images.push(ImageBarrier {
                        src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                        src_access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                        dst_stage: vk::PipelineStageFlags2::NONE,
                        dst_access: vk::AccessFlags2::NONE,
                        ownership: Some(ownership),
                        ..transfer_dst
                    });
                    before.images.push(ImageBarrier {
                        ownership: Some(ownership),
                        ..transfer_dst
                    });
                }
                _ => before.images.push(transfer_dst),
            }

            let shader_read = ImageBarrier {
                image: texture.image,
                src_stage: vk::PipelineStageFlags2::TRANSFER,
                src_access: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                dst_access: vk::AccessFlags2::MEMORY_READ,
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                range,
                ownership: None,
            };
            match handoff {
                Some(ownership) => {
                    let ownership = QueueOwnership {
                        src_family: ownership.dst_family,
                        dst_family: ownership.src_family,
                    };
                    after.images.push(ImageBarrier {
                        dst_stage: vk::PipelineStageFlags2::NONE,
                        dst_access: vk::AccessFlags2::NONE,
                        ownership: Some(ownership),
                        ..shader_read
                    });
                    graphics_acquire.images.push(ImageBarrier {
                        src_stage: vk::PipelineStageFlags2::NONE,
                        src_access: vk::AccessFlags2::NONE,
                        ownership: Some(ownership),
                        ..shader_read
                    });
                }
                None => after.images.push(shader_read),
            }
        }
        for job in &self.buffers {
            let buffer = resources.buffer(job.buffer).buffer;
            let size = job.data.len() as vk::DeviceSize;
            before.buffers.push(BufferBarrier {
                buffer,
                src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                src_access: vk::AccessFlags2::MEMORY_READ,
                dst_stage: vk::PipelineStageFlags2::TRANSFER,
                dst_access: vk::AccessFlags2::TRANSFER_WRITE,
                offset: job.dest_offset,
                size,
            });
            after.buffers.push(BufferBarrier {
                buffer,
                src_stage: vk::PipelineStageFlags2::TRANSFER,
                src_access: vk::AccessFlags2::TRANSFER_WRITE,
                dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                dst_access: vk::AccessFlags2::MEMORY_READ,
                offset: job.dest_offset,
                size,
            });
        }

        device.cmd_begin_label(command_buffer, "Upload", [0.9, 0.7, 0.1, 1.0]);
        device.cmd_pipeline_barrier(command_buffer, &before);
        for (job, &src_offset) in self.textures.iter().zip(&texture_offsets) {
            let texture = resources.texture(job.destination);
            let extent = texture.mip_extent(job.mip);
            device.cmd_copy_buffer_to_image(
                command_buffer,
                staging_buffer,
                texture.image,
                &[vk::BufferImageCopy {
                    buffer_offset: src_offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: texture.aspect,
                        mip_level: job.mip,
                        base_array_layer: 0,
                        layer_count: texture.array_layers,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    },
                }],
            );
        }
        for (job, &src_offset) in self.buffers.iter().zip(&buffer_offsets) {
            device.cmd_copy_buffer(
                command_buffer,
                staging_buffer,
                resources.buffer(job.buffer).buffer,
                &[vk::BufferCopy {
                    src_offset,
                    dst_offset: job.dest_offset,
                    size: job.data.len() as vk::DeviceSize,
                }],
            );
        }
        device.cmd_pipeline_barrier(command_buffer, &after);
        device.cmd_end_label(command_buffer);
        device
            .end_command_buffer(command_buffer)
            .map_err(|result| BackendError::creation("command buffer", "Upload", "end", result))?;

        // Still read by the copies above, released once this frame slot comes around again.
        resources.destroy_buffer(staging);

        debug!(
            textures = self.destinations.len(),
            texture_jobs = self.textures.len(),
            buffers = self.buffers.len(),
            handoffs = graphics_release.images.len(),
            size = %format_size(total),
            "flushed uploads"
        );
        self.textures.clear();
        self.buffers.clear();
        self.destinations.clear();

        Ok(Some(UploadBatch {
            command_buffer,
            graphics_release,
            graphics_acquire,
        }))
    }
}
