//! Barrier synthesis. Every resource starts untouched after a submission; its first usage token
//! establishes a last known state, every following token is compared against it. The state
//! carries over between graphs recorded into the same submission.

use ash::vk;
use indexmap::IndexMap;
use profiling::scope;
use smallvec::SmallVec;

use super::{BufferUsageToken, TextureUsageToken};
use crate::renderer::resources::{BufferHandle, TextureHandle};

const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
);

pub(crate) fn is_write(access: vk::AccessFlags2) -> bool {
    access.intersects(WRITE_ACCESS)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ResourceState {
    stage: vk::PipelineStageFlags2,
    access: vk::AccessFlags2,
    layout: vk::ImageLayout,
}

impl ResourceState {
    const UNTOUCHED: ResourceState = ResourceState {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
        layout: vk::ImageLayout::UNDEFINED,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PlannedBufferBarrier {
    pub(crate) buffer: BufferHandle,
    pub(crate) src_stage: vk::PipelineStageFlags2,
    pub(crate) src_access: vk::AccessFlags2,
    pub(crate) dst_stage: vk::PipelineStageFlags2,
    pub(crate) dst_access: vk::AccessFlags2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PlannedTextureBarrier {
    pub(crate) texture: TextureHandle,
    pub(crate) src_stage: vk::PipelineStageFlags2,
    pub(crate) src_access: vk::AccessFlags2,
    pub(crate) dst_stage: vk::PipelineStageFlags2,
    pub(crate) dst_access: vk::AccessFlags2,
    pub(crate) old_layout: vk::ImageLayout,
    pub(crate) new_layout: vk::ImageLayout,
}

/// Barriers to insert as a single dependency right before one pass.
#[derive(Debug, Default)]
pub(crate) struct PassBarriers {
    pub(crate) buffers: SmallVec<[PlannedBufferBarrier; 8]>,
    pub(crate) textures: SmallVec<[PlannedTextureBarrier; 8]>,
}

impl PassBarriers {
    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len() + self.textures.len()
    }
}

#[derive(Default)]
pub(crate) struct BarrierTracker {
    buffers: IndexMap<BufferHandle, ResourceState>,
    textures: IndexMap<TextureHandle, ResourceState>,
}

impl BarrierTracker {
    /// Forgets every resource. Called once recorded work is submitted, the semaphore chain
    /// between submissions orders everything that came before.
    pub(crate) fn reset(&mut self) {
        self.buffers.clear();
        self.textures.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty()
    }

    /// Whether a pass recorded since the last reset used `texture`.
    pub(crate) fn touches_texture(&self, texture: TextureHandle) -> bool {
        self.textures.contains_key(&texture)
    }

    /// `initial_layout` supplies the layout a texture is in before its first token since the
    /// last reset.
    pub(crate) fn plan_pass(
        &mut self,
        buffers: &[BufferUsageToken],
        textures: &[TextureUsageToken],
        initial_layout: impl Fn(TextureHandle) -> vk::ImageLayout,
    ) -> PassBarriers {
        scope!("graph", "plan_pass");

        let mut barriers = PassBarriers::default();

        // Tokens for the same resource within one pass collapse into one.
        let mut pass_buffers = IndexMap::<BufferHandle, ResourceState>::new();
        for token in buffers {
            let merged = pass_buffers.entry(token.buffer).or_insert(ResourceState::UNTOUCHED);
            merged.stage |= token.stage;
            merged.access |= token.access;
        }
        let mut pass_textures = IndexMap::<TextureHandle, ResourceState>::new();
        for token in textures {
            let merged = pass_textures.entry(token.texture).or_insert(ResourceState::UNTOUCHED);
            merged.stage |= token.stage;
            merged.access |= token.access;
            if merged.layout == vk::ImageLayout::UNDEFINED {
                merged.layout = token.layout;
            } else {
                debug_assert!(
                    token.layout == vk::ImageLayout::UNDEFINED || token.layout == merged.layout,
                    "{:?} is used in both {:?} and {:?} within one pass",
                    token.texture,
                    merged.layout,
                    token.layout
                );
            }
        }

        for (buffer, next) in pass_buffers {
            match self.buffers.get_mut(&buffer) {
                None => {
                    self.buffers.insert(buffer, next);
                }
                Some(last) if is_write(last.access) || is_write(next.access) => {
                    barriers.buffers.push(PlannedBufferBarrier {
                        buffer,
                        src_stage: last.stage,
                        src_access: last.access,
                        dst_stage: next.stage,
                        dst_access: next.access,
                    });
                    *last = next;
                }
                Some(last) => {
                    // Read after read, a later writer has to wait on every reader.
                    last.stage |= next.stage;
                    last.access |= next.access;
                }
            }
        }

        for (texture, mut next) in pass_textures {
            let (last, first_use) = match self.textures.get(&texture) {
                Some(last) => (*last, false),
                None => (
                    ResourceState {
                        layout: initial_layout(texture),
                        ..ResourceState::UNTOUCHED
                    },
                    true,
                ),
            };
            if next.layout == vk::ImageLayout::UNDEFINED {
                next.layout = last.layout;
            }
            let transition = next.layout != last.layout;
            let hazard = !first_use && (is_write(last.access) || is_write(next.access));

            if transition || hazard {
                barriers.textures.push(PlannedTextureBarrier {
                    texture,
                    src_stage: last.stage,
                    src_access: last.access,
                    dst_stage: next.stage,
                    dst_access: next.access,
                    old_layout: last.layout,
                    new_layout: next.layout,
                });
                self.textures.insert(texture, next);
            } else if first_use {
                self.textures.insert(texture, next);
            } else if let Some(last) = self.textures.get_mut(&texture) {
                last.stage |= next.stage;
                last.access |= next.access;
            }
        }

        barriers
    }

    /// Layout every touched texture is left in once the graph finished.
    pub(crate) fn final_layouts(&self) -> impl Iterator<Item = (TextureHandle, vk::ImageLayout)> + '_ {
        self.textures.iter().map(|(&texture, state)| (texture, state.layout))
    }
}
