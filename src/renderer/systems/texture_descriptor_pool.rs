//! A single bindless descriptor set holding one big array of sampled textures. Shaders index
//! into the array with the slot numbers handed out here.

use ash::vk;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::renderer::{
    device::{
        descriptors::{DescriptorBinding, DescriptorSet, DescriptorSetLayoutInfo},
        pipeline::PipelineCache,
        DescriptorWrite, DoubleBuffered, GpuDevice,
    },
    error::BackendError,
    graph::TextureUsageToken,
    resources::{ResourceAllocator, TextureHandle},
};

const TEXTURE_BINDING: u32 = 0;

struct PendingWrite {
    slot: u32,
    texture: TextureHandle,
    sampler: vk::Sampler,
}

pub struct TextureDescriptorPool {
    name: String,
    layout: DescriptorSetLayoutInfo,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    slots: Vec<Option<TextureHandle>>,
    available: Vec<u32>,
    pending_writes: Vec<PendingWrite>,
    pending_frees: DoubleBuffered<Vec<u32>>,
    frame_number: u64,
}

impl TextureDescriptorPool {
    pub fn new(
        device: &dyn GpuDevice,
        pipelines: &mut PipelineCache,
        name: &str,
        capacity: u32,
        frames_in_flight: usize,
        stages: vk::ShaderStageFlags,
    ) -> Result<TextureDescriptorPool, BackendError> {
        let layout = pipelines.set_layout(&[DescriptorBinding {
            binding: TEXTURE_BINDING,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: capacity,
            stages,
            writable: false,
        }])?;
        let size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: capacity,
        };
        let pool = device
            .create_descriptor_pool(1, &[size])
            .map_err(|result| BackendError::creation("descriptor pool", name, format!("{capacity} textures"), result))?;
        let set = match device.allocate_descriptor_set(pool, layout.layout) {
            Ok(set) => set,
            Err(result) => {
                device.destroy_descriptor_pool(pool);
                return Err(BackendError::creation("descriptor set", name, format!("{capacity} textures"), result));
            }
        };
        device.name_object(pool, name);
        device.name_object(set, name);
        debug!(name, capacity, "created texture descriptor pool");

        Ok(TextureDescriptorPool {
            name: name.to_string(),
            layout,
            pool,
            set,
            slots: vec![None; capacity as usize],
            available: (0..capacity).rev().collect(),
            pending_writes: vec![],
            pending_frees: DoubleBuffered::new(frames_in_flight, |_| vec![]),
            frame_number: 0,
        })
    }

    pub fn layout(&self) -> &DescriptorSetLayoutInfo {
        &self.layout
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn live_descriptors(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn texture_at(&self, slot: u32) -> Option<TextureHandle> {
        self.slots.get(slot as usize).copied().flatten()
    }

    /// Reserves a slot for `texture`. The descriptor itself is written by the next
    /// `commit_descriptors`.
    pub fn create_texture_srv(&mut self, texture: TextureHandle, sampler: vk::Sampler) -> Result<u32, BackendError> {
        let slot = self.available.pop().ok_or_else(|| BackendError::DescriptorsExhausted {
            name: self.name.clone(),
            capacity: self.capacity(),
        })?;
        self.slots[slot as usize] = Some(texture);
        self.pending_writes.push(PendingWrite { slot, texture, sampler });
        trace!(name = %self.name, slot, "reserved texture descriptor");
        Ok(slot)
    }

    /// In-flight frames may still sample through the slot, so it is handed out again only once
    /// this frame slot comes around.
    pub fn free_descriptor(&mut self, slot: u32) {
        let Some(texture) = self.slots.get_mut(slot as usize) else {
            warn!(name = %self.name, slot, "freeing a descriptor outside of the table");
            return;
        };
        if texture.take().is_none() {
            warn!(name = %self.name, slot, "freeing a descriptor that is not in use");
            return;
        }
        self.pending_writes.retain(|write| write.slot != slot);
        self.pending_frees.current_mut(self.frame_number).push(slot);
    }

    /// Call once per frame after the frame's fence was waited on.
    pub fn begin_frame(&mut self, frame_number: u64) {
        self.frame_number = frame_number;
        let recycled = std::mem::take(self.pending_frees.current_mut(frame_number));
        self.available.extend(recycled);
    }

    /// Writes every descriptor reserved since the last commit. Call before recording work that
    /// samples through the table.
    pub fn commit_descriptors(&mut self, resources: &ResourceAllocator) -> usize {
        if self.pending_writes.is_empty() {
            return 0;
        }

        let writes = self
            .pending_writes
            .drain(..)
            .filter_map(|write| match resources.get_texture(write.texture) {
                Some(texture) => Some(DescriptorWrite::Image {
                    binding: TEXTURE_BINDING,
                    array_element: write.slot,
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    view: texture.view,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    sampler: write.sampler,
                }),
                None => {
                    warn!(slot = write.slot, "texture destroyed before its descriptor was written");
                    None
                }
            })
            .collect::<Vec<_>>();
        resources.device().update_descriptor_set(self.set, &writes);
        trace!(name = %self.name, count = writes.len(), "committed texture descriptors");
        writes.len()
    }

    /// The table together with a sampled read of every texture it currently holds.
    pub fn descriptor_set(&self, stage: vk::PipelineStageFlags2) -> DescriptorSet {
        DescriptorSet {
            handle: self.set,
            buffers: SmallVec::new(),
            textures: self
                .slots
                .iter()
                .flatten()
                .map(|&texture| TextureUsageToken::sampled(texture, stage))
                .collect(),
        }
    }

    /// The layout belongs to the pipeline cache and is destroyed with it.
    pub fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_descriptor_pool(self.pool);
    }
}
