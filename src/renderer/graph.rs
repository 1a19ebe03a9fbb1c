//! Per-frame pass list. Passes declare the resources they touch as usage tokens, the graph turns
//! consecutive tokens into barriers and records everything into one command buffer in
//! declaration order.

use arrayvec::ArrayVec;
use ash::vk;
use bytemuck::Pod;
use itertools::Itertools;
use profiling::scope;
use smallvec::SmallVec;
use tracing::{debug, trace};

use self::barriers::{BarrierTracker, PassBarriers};
pub use self::recorder::CommandRecorder;
use super::{
    device::{
        descriptors::DescriptorSet,
        pipeline::{ComputePipelineHandle, PipelineCache, RenderTargetFormats},
        AttachmentInfo, BarrierBatch, BufferBarrier, GpuDevice, ImageBarrier, RenderingDesc,
    },
    resources::{BufferHandle, ResourceAllocator, TextureHandle},
};

pub(crate) mod barriers;
mod recorder;

/// Intent to access a buffer from `stage` with `access`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferUsageToken {
    pub buffer: BufferHandle,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl BufferUsageToken {
    pub fn new(buffer: BufferHandle, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        BufferUsageToken { buffer, stage, access }
    }

    pub fn vertex_read(buffer: BufferHandle) -> Self {
        Self::new(
            buffer,
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        )
    }

    pub fn index_read(buffer: BufferHandle) -> Self {
        Self::new(buffer, vk::PipelineStageFlags2::INDEX_INPUT, vk::AccessFlags2::INDEX_READ)
    }

    pub fn indirect_read(buffer: BufferHandle) -> Self {
        Self::new(
            buffer,
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::INDIRECT_COMMAND_READ,
        )
    }

    pub fn transfer_read(buffer: BufferHandle) -> Self {
        Self::new(buffer, vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)
    }

    pub fn transfer_write(buffer: BufferHandle) -> Self {
        Self::new(buffer, vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
    }
}

/// Intent to access a texture in `layout`. `UNDEFINED` means "whatever layout it is in".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureUsageToken {
    pub texture: TextureHandle,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl TextureUsageToken {
    pub fn new(
        texture: TextureHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        TextureUsageToken {
            texture,
            stage,
            access,
            layout,
        }
    }

    pub fn sampled(texture: TextureHandle, stage: vk::PipelineStageFlags2) -> Self {
        Self::new(
            texture,
            stage,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }

    pub fn storage_write(texture: TextureHandle, stage: vk::PipelineStageFlags2) -> Self {
        Self::new(
            texture,
            stage,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::ImageLayout::GENERAL,
        )
    }
}

pub type ExecuteFn<'g> = Box<dyn FnOnce(&mut CommandRecorder<'_>) + 'g>;
pub type FinishTask<'g> = Box<dyn FnOnce(&mut ResourceAllocator) + 'g>;

pub struct ComputePass<'g> {
    pub name: &'g str,
    pub buffers: Vec<BufferUsageToken>,
    pub textures: Vec<TextureUsageToken>,
    pub descriptor_sets: Vec<&'g DescriptorSet>,
    pub execute: ExecuteFn<'g>,
}

/// One direct dispatch with a push constant payload, bound against set 0 onwards.
pub struct ComputeDispatch<'g, P> {
    pub name: &'g str,
    pub pipeline: ComputePipelineHandle,
    pub descriptor_sets: Vec<&'g DescriptorSet>,
    pub push_constants: P,
    pub workgroups: [u32; 3],
    pub buffers: Vec<BufferUsageToken>,
    pub textures: Vec<TextureUsageToken>,
}

pub struct IndirectComputeDispatch<'g, P> {
    pub name: &'g str,
    pub pipeline: ComputePipelineHandle,
    pub descriptor_sets: Vec<&'g DescriptorSet>,
    pub push_constants: P,
    pub indirect_buffer: BufferHandle,
    pub indirect_offset: vk::DeviceSize,
    pub buffers: Vec<BufferUsageToken>,
    pub textures: Vec<TextureUsageToken>,
}

/// Records nothing but the barriers its tokens imply.
pub struct TransitionPass<'g> {
    pub name: &'g str,
    pub buffers: Vec<BufferUsageToken>,
    pub textures: Vec<TextureUsageToken>,
}

pub struct BufferCopyPass<'g> {
    pub name: &'g str,
    pub src: BufferHandle,
    pub dst: BufferHandle,
    pub regions: SmallVec<[vk::BufferCopy; 1]>,
}

pub struct ImageCopyPass<'g> {
    pub name: &'g str,
    pub src: TextureHandle,
    pub dst: TextureHandle,
    pub regions: SmallVec<[vk::ImageCopy; 1]>,
}

#[derive(Clone, Copy)]
pub struct RenderingAttachment {
    pub texture: TextureHandle,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
}

impl RenderingAttachment {
    pub fn clear(texture: TextureHandle, clear_value: vk::ClearValue) -> Self {
        RenderingAttachment {
            texture,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value,
        }
    }

    pub fn load(texture: TextureHandle) -> Self {
        RenderingAttachment {
            texture,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: vk::ClearValue::default(),
        }
    }
}

pub struct DynamicRenderingPass<'g> {
    pub name: &'g str,
    pub color_attachments: ArrayVec<RenderingAttachment, 8>,
    pub depth_attachment: Option<RenderingAttachment>,
    /// Shading rate image and the size of the area each of its texels covers.
    pub shading_rate_image: Option<(TextureHandle, vk::Extent2D)>,
    pub view_mask: u32,
    pub buffers: Vec<BufferUsageToken>,
    pub textures: Vec<TextureUsageToken>,
    pub descriptor_sets: Vec<&'g DescriptorSet>,
    pub execute: ExecuteFn<'g>,
}

struct RenderingState {
    color: ArrayVec<RenderingAttachment, 8>,
    depth: Option<RenderingAttachment>,
    shading_rate: Option<(TextureHandle, vk::Extent2D)>,
    view_mask: u32,
}

enum PassKind<'g> {
    Execute(ExecuteFn<'g>),
    Rendering(RenderingState, ExecuteFn<'g>),
    BufferCopy {
        src: BufferHandle,
        dst: BufferHandle,
        regions: SmallVec<[vk::BufferCopy; 1]>,
    },
    ImageCopy {
        src: TextureHandle,
        dst: TextureHandle,
        regions: SmallVec<[vk::ImageCopy; 1]>,
    },
    Transition,
    BeginLabel([f32; 4]),
    EndLabel,
}

struct Pass<'g> {
    name: String,
    buffers: SmallVec<[BufferUsageToken; 8]>,
    textures: SmallVec<[TextureUsageToken; 8]>,
    kind: PassKind<'g>,
}

const PASS_LABEL_COLOR: [f32; 4] = [0.3, 0.5, 0.9, 1.0];

/// Passes of one frame. Rebuilt every frame, callbacks may borrow anything that outlives `'g`.
pub struct RenderGraph<'g> {
    name: String,
    passes: Vec<Pass<'g>>,
    finish_tasks: Vec<FinishTask<'g>>,
}

fn with_descriptor_tokens(
    buffers: Vec<BufferUsageToken>,
    textures: Vec<TextureUsageToken>,
    descriptor_sets: &[&DescriptorSet],
) -> (SmallVec<[BufferUsageToken; 8]>, SmallVec<[TextureUsageToken; 8]>) {
    let mut buffers = SmallVec::from_vec(buffers);
    let mut textures = SmallVec::from_vec(textures);
    for set in descriptor_sets {
        buffers.extend_from_slice(set.buffer_tokens());
        textures.extend_from_slice(set.texture_tokens());
    }
    (buffers, textures)
}

impl<'g> RenderGraph<'g> {
    pub fn new(name: &str) -> RenderGraph<'g> {
        RenderGraph {
            name: name.to_string(),
            passes: vec![],
            finish_tasks: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn add_pass(&mut self, pass: ComputePass<'g>) {
        let (buffers, textures) = with_descriptor_tokens(pass.buffers, pass.textures, &pass.descriptor_sets);
        self.passes.push(Pass {
            name: pass.name.to_string(),
            buffers,
            textures,
            kind: PassKind::Execute(pass.execute),
        });
    }

    pub fn add_compute_dispatch<P: Pod>(&mut self, dispatch: ComputeDispatch<'g, P>) {
        let sets = dispatch.descriptor_sets.iter().map(|set| set.handle).collect::<SmallVec<[_; 4]>>();
        let ComputeDispatch {
            pipeline,
            push_constants,
            workgroups,
            ..
        } = dispatch;
        self.add_pass(ComputePass {
            name: dispatch.name,
            buffers: dispatch.buffers,
            textures: dispatch.textures,
            descriptor_sets: dispatch.descriptor_sets,
            execute: Box::new(move |recorder: &mut CommandRecorder<'_>| {
                recorder.bind_compute_pipeline(pipeline);
                recorder.bind_raw_descriptor_sets(0, &sets);
                recorder.set_push_constants(&push_constants);
                recorder.dispatch(workgroups);
            }),
        });
    }

    pub fn add_indirect_dispatch<P: Pod>(&mut self, dispatch: IndirectComputeDispatch<'g, P>) {
        let sets = dispatch.descriptor_sets.iter().map(|set| set.handle).collect::<SmallVec<[_; 4]>>();
        let IndirectComputeDispatch {
            pipeline,
            push_constants,
            indirect_buffer,
            indirect_offset,
            ..
        } = dispatch;
        let mut buffers = dispatch.buffers;
        buffers.push(BufferUsageToken::indirect_read(indirect_buffer));
        self.add_pass(ComputePass {
            name: dispatch.name,
            buffers,
            textures: dispatch.textures,
            descriptor_sets: dispatch.descriptor_sets,
            execute: Box::new(move |recorder: &mut CommandRecorder<'_>| {
                recorder.bind_compute_pipeline(pipeline);
                recorder.bind_raw_descriptor_sets(0, &sets);
                recorder.set_push_constants(&push_constants);
                recorder.dispatch_indirect(indirect_buffer, indirect_offset);
            }),
        });
    }

    pub fn add_transition_pass(&mut self, pass: TransitionPass<'g>) {
        self.passes.push(Pass {
            name: pass.name.to_string(),
            buffers: SmallVec::from_vec(pass.buffers),
            textures: SmallVec::from_vec(pass.textures),
            kind: PassKind::Transition,
        });
    }

    pub fn add_buffer_copy_pass(&mut self, pass: BufferCopyPass<'g>) {
        self.passes.push(Pass {
            name: pass.name.to_string(),
            buffers: smallvec::smallvec![
                BufferUsageToken::transfer_read(pass.src),
                BufferUsageToken::transfer_write(pass.dst),
            ],
            textures: SmallVec::new(),
            kind: PassKind::BufferCopy {
                src: pass.src,
                dst: pass.dst,
                regions: pass.regions,
            },
        });
    }

    pub fn add_image_copy_pass(&mut self, pass: ImageCopyPass<'g>) {
        self.passes.push(Pass {
            name: pass.name.to_string(),
            buffers: SmallVec::new(),
            textures: smallvec::smallvec![
                TextureUsageToken::new(
                    pass.src,
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_READ,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                ),
                TextureUsageToken::new(
                    pass.dst,
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                ),
            ],
            kind: PassKind::ImageCopy {
                src: pass.src,
                dst: pass.dst,
                regions: pass.regions,
            },
        });
    }

    pub fn add_render_pass(&mut self, pass: DynamicRenderingPass<'g>) {
        let (buffers, mut textures) = with_descriptor_tokens(pass.buffers, pass.textures, &pass.descriptor_sets);

        for attachment in &pass.color_attachments {
            let mut access = vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
            if attachment.load_op == vk::AttachmentLoadOp::LOAD {
                access |= vk::AccessFlags2::COLOR_ATTACHMENT_READ;
            }
            textures.push(TextureUsageToken::new(
                attachment.texture,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                access,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ));
        }
        if let Some(depth) = &pass.depth_attachment {
            // Depth writes happen whatever the load op.
            textures.push(TextureUsageToken::new(
                depth.texture,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            ));
        }
        if let Some((shading_rate, _)) = pass.shading_rate_image {
            textures.push(TextureUsageToken::new(
                shading_rate,
                vk::PipelineStageFlags2::FRAGMENT_SHADING_RATE_ATTACHMENT_KHR,
                vk::AccessFlags2::FRAGMENT_SHADING_RATE_ATTACHMENT_READ_KHR,
                vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR,
            ));
        }

        self.passes.push(Pass {
            name: pass.name.to_string(),
            buffers,
            textures,
            kind: PassKind::Rendering(
                RenderingState {
                    color: pass.color_attachments,
                    depth: pass.depth_attachment,
                    shading_rate: pass.shading_rate_image,
                    view_mask: pass.view_mask,
                },
                pass.execute,
            ),
        });
    }

    /// Moves `texture` into the presentable layout. Must be the last use of the swapchain image.
    pub fn add_present_pass(&mut self, texture: TextureHandle) {
        self.add_transition_pass(TransitionPass {
            name: "Present",
            buffers: vec![],
            textures: vec![TextureUsageToken::new(
                texture,
                vk::PipelineStageFlags2::NONE,
                vk::AccessFlags2::NONE,
                vk::ImageLayout::PRESENT_SRC_KHR,
            )],
        });
    }

    pub fn begin_label(&mut self, name: &str, color: [f32; 4]) {
        self.passes.push(Pass {
            name: name.to_string(),
            buffers: SmallVec::new(),
            textures: SmallVec::new(),
            kind: PassKind::BeginLabel(color),
        });
    }

    pub fn end_label(&mut self) {
        self.passes.push(Pass {
            name: String::new(),
            buffers: SmallVec::new(),
            textures: SmallVec::new(),
            kind: PassKind::EndLabel,
        });
    }

    /// Runs once the recorded command buffer was queued for submission.
    pub fn add_finish_task(&mut self, task: impl FnOnce(&mut ResourceAllocator) + 'g) {
        self.finish_tasks.push(Box::new(task));
    }

    /// Records every pass into `command_buffer`, writes the final texture layouts back and hands
    /// out the finish tasks. `tracker` holds the access state left by graphs recorded earlier
    /// into the same submission.
    pub(crate) fn record(
        self,
        command_buffer: vk::CommandBuffer,
        resources: &mut ResourceAllocator,
        pipelines: &mut PipelineCache,
        tracker: &mut BarrierTracker,
    ) -> Vec<FinishTask<'g>> {
        scope!("graph", "record");

        let device = resources.device().clone();
        let device = &*device;
        let mut barrier_count = 0;

        {
            let resources = &*resources;
            for pass in self.passes {
                let planned = tracker.plan_pass(&pass.buffers, &pass.textures, |texture| {
                    resources.texture(texture).layout()
                });
                if !planned.is_empty() {
                    barrier_count += planned.len();
                    device.cmd_pipeline_barrier(command_buffer, &resolve_barriers(resources, &planned));
                }

                match pass.kind {
                    PassKind::BeginLabel(color) => device.cmd_begin_label(command_buffer, &pass.name, color),
                    PassKind::EndLabel => device.cmd_end_label(command_buffer),
                    PassKind::Transition => {}
                    PassKind::BufferCopy { src, dst, regions } => {
                        let _label = recorder::LabelGuard::new(device, command_buffer, &pass.name, PASS_LABEL_COLOR);
                        device.cmd_copy_buffer(
                            command_buffer,
                            resources.buffer(src).buffer,
                            resources.buffer(dst).buffer,
                            &regions,
                        );
                    }
                    PassKind::ImageCopy { src, dst, regions } => {
                        let _label = recorder::LabelGuard::new(device, command_buffer, &pass.name, PASS_LABEL_COLOR);
                        device.cmd_copy_image(
                            command_buffer,
                            resources.texture(src).image,
                            resources.texture(dst).image,
                            &regions,
                        );
                    }
                    PassKind::Execute(execute) => {
                        let _label = recorder::LabelGuard::new(device, command_buffer, &pass.name, PASS_LABEL_COLOR);
                        let mut recorder = CommandRecorder::new(
                            device,
                            command_buffer,
                            resources,
                            pipelines,
                            None,
                            &pass.buffers,
                            &pass.textures,
                        );
                        execute(&mut recorder);
                    }
                    PassKind::Rendering(state, execute) => {
                        let _label = recorder::LabelGuard::new(device, command_buffer, &pass.name, PASS_LABEL_COLOR);
                        let formats = record_begin_rendering(device, command_buffer, resources, &state);
                        let mut recorder = CommandRecorder::new(
                            device,
                            command_buffer,
                            resources,
                            pipelines,
                            Some(&formats),
                            &pass.buffers,
                            &pass.textures,
                        );
                        execute(&mut recorder);
                        device.cmd_end_rendering(command_buffer);
                    }
                }
            }
        }

        let mut written_back = 0;
        for (texture, layout) in tracker.final_layouts().collect_vec() {
            resources.set_texture_layout(texture, layout);
            written_back += 1;
        }
        debug!(
            graph = %self.name,
            barriers = barrier_count,
            textures = written_back,
            "recorded render graph"
        );

        self.finish_tasks
    }
}

fn resolve_barriers(resources: &ResourceAllocator, planned: &PassBarriers) -> BarrierBatch {
    let mut batch = BarrierBatch::default();
    for barrier in &planned.buffers {
        batch.buffers.push(BufferBarrier {
            buffer: resources.buffer(barrier.buffer).buffer,
            src_stage: barrier.src_stage,
            src_access: barrier.src_access,
            dst_stage: barrier.dst_stage,
            dst_access: barrier.dst_access,
            offset: 0,
            size: vk::WHOLE_SIZE,
        });
    }
    for barrier in &planned.textures {
        let texture = resources.texture(barrier.texture);
        trace!(
            texture = %texture.name,
            old = ?barrier.old_layout,
            new = ?barrier.new_layout,
            "image barrier"
        );
        batch.images.push(ImageBarrier {
            image: texture.image,
            src_stage: barrier.src_stage,
            src_access: barrier.src_access,
            dst_stage: barrier.dst_stage,
            dst_access: barrier.dst_access,
            old_layout: barrier.old_layout,
            new_layout: barrier.new_layout,
            range: texture.full_range(),
            ownership: None,
        });
    }
    batch
}

fn record_begin_rendering(
    device: &dyn GpuDevice,
    command_buffer: vk::CommandBuffer,
    resources: &ResourceAllocator,
    state: &RenderingState,
) -> RenderTargetFormats {
    let attachment = |attachment: &RenderingAttachment, layout| {
        let texture = resources.texture(attachment.texture);
        AttachmentInfo {
            view: texture.view,
            layout,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
            clear_value: attachment.clear_value,
        }
    };
    let color = state
        .color
        .iter()
        .map(|color| attachment(color, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
        .collect::<ArrayVec<_, 8>>();
    let depth = state
        .depth
        .as_ref()
        .map(|depth| attachment(depth, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL));
    let extent = state
        .color
        .first()
        .or(state.depth.as_ref())
        .map(|attachment| resources.texture(attachment.texture).extent)
        .unwrap_or_default();
    let area = vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent,
    };

    device.cmd_begin_rendering(
        command_buffer,
        &RenderingDesc {
            area,
            layer_count: 1,
            view_mask: state.view_mask,
            color: &color,
            depth,
            shading_rate: state
                .shading_rate
                .map(|(texture, texel_size)| (resources.texture(texture).view, texel_size)),
        },
    );
    device.cmd_set_viewport_and_scissor(command_buffer, area);

    RenderTargetFormats {
        color: state
            .color
            .iter()
            .map(|color| resources.texture(color.texture).format)
            .collect(),
        depth: state.depth.map(|depth| resources.texture(depth.texture).format),
        view_mask: state.view_mask,
        shading_rate: state.shading_rate.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::renderer::{
        config::BackendConfig,
        device::test_device::{Call, TestDevice},
        resources::{BufferUsage, TextureDesc, TextureUsage},
    };

    struct Harness {
        device: Arc<TestDevice>,
        resources: ResourceAllocator,
        pipelines: PipelineCache,
        tracker: BarrierTracker,
    }

    impl Harness {
        fn new() -> Harness {
            let device = TestDevice::new();
            Harness {
                resources: ResourceAllocator::new(device.clone(), &BackendConfig::default()),
                pipelines: PipelineCache::new(device.clone()),
                tracker: BarrierTracker::default(),
                device,
            }
        }

        /// Records `graph` after whatever was recorded since the last `submit`.
        fn record(&mut self, graph: RenderGraph<'_>) {
            let command_buffer = vk::CommandBuffer::null();
            let tasks = graph.record(
                command_buffer,
                &mut self.resources,
                &mut self.pipelines,
                &mut self.tracker,
            );
            for task in tasks {
                task(&mut self.resources);
            }
        }

        fn submit(&mut self) {
            self.tracker.reset();
        }
    }

    fn storage_pass<'g>(
        name: &'g str,
        buffer: BufferHandle,
        access: vk::AccessFlags2,
    ) -> ComputePass<'g> {
        ComputePass {
            name,
            buffers: vec![BufferUsageToken::new(buffer, vk::PipelineStageFlags2::COMPUTE_SHADER, access)],
            textures: vec![],
            descriptor_sets: vec![],
            execute: Box::new(|recorder: &mut CommandRecorder<'_>| recorder.dispatch([1, 1, 1])),
        }
    }

    fn color_target(resources: &mut ResourceAllocator, name: &str) -> TextureHandle {
        resources
            .create_texture(
                name,
                &TextureDesc::new_2d(
                    vk::Format::R16G16B16A16_SFLOAT,
                    vk::Extent2D { width: 128, height: 64 },
                    TextureUsage::RenderTarget,
                ),
            )
            .unwrap()
    }

    #[test]
    fn barriers_are_inserted_right_before_the_consuming_pass() {
        let mut harness = Harness::new();
        let buffer = harness.resources.create_buffer("particles", 4096, BufferUsage::Storage).unwrap();
        let native = harness.resources.buffer(buffer).buffer;

        let mut graph = RenderGraph::new("simulation");
        for (name, access) in [
            ("integrate", vk::AccessFlags2::SHADER_STORAGE_WRITE),
            ("gather a", vk::AccessFlags2::SHADER_STORAGE_READ),
            ("gather b", vk::AccessFlags2::SHADER_STORAGE_READ),
            ("scatter", vk::AccessFlags2::SHADER_STORAGE_WRITE),
        ] {
            graph.add_pass(storage_pass(name, buffer, access));
        }
        harness.record(graph);

        let barriers = harness.device.barriers();
        assert_eq!(barriers.len(), 2);
        assert!(barriers.iter().all(|batch| batch.buffers[0].buffer == native));
        assert_eq!(barriers[0].buffers[0].src_access, vk::AccessFlags2::SHADER_STORAGE_WRITE);
        assert_eq!(barriers[1].buffers[0].src_access, vk::AccessFlags2::SHADER_STORAGE_READ);

        // Barrier, then the label and dispatch of the pass it protects.
        let calls = harness.device.calls();
        let first_barrier = calls
            .iter()
            .position(|call| matches!(call, Call::PipelineBarrier { .. }))
            .unwrap();
        assert_eq!(calls[first_barrier + 1], Call::BeginLabel("gather a".to_string()));
        assert_eq!(harness.device.count(|call| matches!(call, Call::Dispatch(_))), 4);
    }

    #[test]
    fn render_passes_transition_attachments_and_persist_layouts() {
        let mut harness = Harness::new();
        let color = color_target(&mut harness.resources, "hdr");

        let mut graph = RenderGraph::new("frame");
        let mut color_attachments = ArrayVec::new();
        color_attachments.push(RenderingAttachment::clear(color, vk::ClearValue::default()));
        graph.add_render_pass(DynamicRenderingPass {
            name: "Main",
            color_attachments,
            depth_attachment: None,
            shading_rate_image: None,
            view_mask: 0,
            buffers: vec![],
            textures: vec![],
            descriptor_sets: vec![],
            execute: Box::new(|recorder: &mut CommandRecorder<'_>| recorder.draw(0..3, 0..1)),
        });
        graph.add_transition_pass(TransitionPass {
            name: "Sample",
            buffers: vec![],
            textures: vec![TextureUsageToken::sampled(color, vk::PipelineStageFlags2::FRAGMENT_SHADER)],
        });
        harness.record(graph);

        let barriers = harness.device.barriers();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].images[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barriers[0].images[0].new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barriers[0].images[0].src_stage, vk::PipelineStageFlags2::NONE);
        assert_eq!(barriers[1].images[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(
            harness.resources.texture(color).layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(harness.device.count(|call| matches!(call, Call::BeginRendering { .. })), 1);
        assert_eq!(harness.device.count(|call| *call == Call::EndRendering), 1);

        // The next graph starts from the persisted layout.
        let mut graph = RenderGraph::new("next frame");
        graph.add_transition_pass(TransitionPass {
            name: "Sample again",
            buffers: vec![],
            textures: vec![TextureUsageToken::sampled(color, vk::PipelineStageFlags2::COMPUTE_SHADER)],
        });
        harness.record(graph);
        assert_eq!(harness.device.barriers().len(), 2);

        harness.resources.destroy_all();
    }

    #[test]
    fn descriptor_sets_contribute_their_tokens() {
        let mut harness = Harness::new();
        let buffer = harness.resources.create_buffer("lights", 1024, BufferUsage::Storage).unwrap();
        let set = DescriptorSet {
            handle: vk::DescriptorSet::null(),
            buffers: smallvec::smallvec![BufferUsageToken::new(
                buffer,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_READ,
            )],
            textures: SmallVec::new(),
        };

        let mut graph = RenderGraph::new("lighting");
        graph.add_buffer_copy_pass(BufferCopyPass {
            name: "Reset lights",
            src: buffer,
            dst: buffer,
            regions: smallvec::smallvec![vk::BufferCopy {
                src_offset: 0,
                dst_offset: 512,
                size: 512,
            }],
        });
        graph.add_pass(ComputePass {
            name: "Shade",
            buffers: vec![],
            textures: vec![],
            descriptor_sets: vec![&set],
            execute: Box::new(|_: &mut CommandRecorder<'_>| {}),
        });
        harness.record(graph);

        let barriers = harness.device.barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(
            barriers[0].buffers[0].src_access,
            vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE
        );
        assert_eq!(barriers[0].buffers[0].dst_stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    }

    #[test]
    fn labels_and_finish_tasks() {
        let mut harness = Harness::new();
        let scratch = harness.resources.create_buffer("scratch", 64, BufferUsage::Storage).unwrap();

        let mut graph = RenderGraph::new("labels");
        graph.begin_label("Shadows", [1.0, 0.0, 0.0, 1.0]);
        graph.end_label();
        graph.add_finish_task(move |resources| resources.destroy_buffer(scratch));
        assert_eq!(graph.pass_count(), 2);
        harness.record(graph);

        assert_eq!(
            harness.device.calls().iter().filter(|call| matches!(call, Call::BeginLabel(_))).count(),
            1
        );
        assert_eq!(harness.device.count(|call| *call == Call::EndLabel), 1);
        assert!(harness.device.barriers().is_empty());

        harness.resources.begin_frame(2);
        harness.resources.free_resources_for_frame(0);
        assert!(harness.resources.get_buffer(scratch).is_none());
    }

    #[test]
    fn graphs_in_one_submission_share_access_state() {
        let mut harness = Harness::new();
        let buffer = harness.resources.create_buffer("histogram", 1024, BufferUsage::Storage).unwrap();

        let mut graph = RenderGraph::new("build");
        graph.add_pass(storage_pass("Build", buffer, vk::AccessFlags2::SHADER_STORAGE_WRITE));
        harness.record(graph);
        assert!(harness.device.barriers().is_empty());

        // The write of the previous graph is still unsynchronized.
        let mut graph = RenderGraph::new("consume");
        graph.add_pass(storage_pass("Consume", buffer, vk::AccessFlags2::SHADER_STORAGE_READ));
        harness.record(graph);
        let barriers = harness.device.barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].buffers[0].src_access, vk::AccessFlags2::SHADER_STORAGE_WRITE);
        assert_eq!(barriers[0].buffers[0].dst_access, vk::AccessFlags2::SHADER_STORAGE_READ);

        // Submission boundaries order everything before them.
        harness.submit();
        let mut graph = RenderGraph::new("rebuild");
        graph.add_pass(storage_pass("Rebuild", buffer, vk::AccessFlags2::SHADER_STORAGE_WRITE));
        harness.record(graph);
        assert_eq!(harness.device.barriers().len(), 1);
    }

    #[test]
    fn loaded_depth_attachments_are_still_written() {
        let mut harness = Harness::new();
        let depth = harness
            .resources
            .create_texture(
                "depth",
                &TextureDesc::new_2d(
                    vk::Format::D32_SFLOAT,
                    vk::Extent2D { width: 128, height: 64 },
                    TextureUsage::RenderTarget,
                ),
            )
            .unwrap();

        let mut graph = RenderGraph::new("forward");
        for name in ["Opaque", "Transparent"] {
            graph.add_render_pass(DynamicRenderingPass {
                name,
                color_attachments: ArrayVec::new(),
                depth_attachment: Some(RenderingAttachment {
                    store_op: vk::AttachmentStoreOp::DONT_CARE,
                    ..RenderingAttachment::load(depth)
                }),
                shading_rate_image: None,
                view_mask: 0,
                buffers: vec![],
                textures: vec![],
                descriptor_sets: vec![],
                execute: Box::new(|recorder: &mut CommandRecorder<'_>| recorder.draw(0..3, 0..1)),
            });
        }
        harness.record(graph);

        let barriers = harness.device.barriers();
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].images[0].new_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
        // Same layout, but the second pass has to wait on the depth writes of the first.
        let between = barriers[1].images[0];
        assert_eq!(between.old_layout, between.new_layout);
        assert!(between
            .src_access
            .contains(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE));

        harness.resources.destroy_all();
    }
}
