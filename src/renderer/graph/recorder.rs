use std::ops::Range;

use ash::vk;
use bytemuck::Pod;

use super::{BufferUsageToken, TextureUsageToken};
use crate::renderer::{
    device::{
        descriptors::DescriptorSet,
        pipeline::{
            BoundPipeline, ComputePipelineHandle, GraphicsPipelineHandle, PipelineCache, RayTracingPipelineHandle,
            RenderTargetFormats,
        },
        BlasBuild, GpuDevice,
    },
    error::fatal,
    resources::{BufferHandle, ResourceAllocator, TextureHandle},
};

/// Closes a command buffer label when dropped.
pub(super) struct LabelGuard<'a> {
    device: &'a dyn GpuDevice,
    command_buffer: vk::CommandBuffer,
}

impl<'a> LabelGuard<'a> {
    pub(super) fn new(device: &'a dyn GpuDevice, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) -> Self {
        device.cmd_begin_label(command_buffer, name, color);
        LabelGuard { device, command_buffer }
    }
}

impl Drop for LabelGuard<'_> {
    fn drop(&mut self) {
        self.device.cmd_end_label(self.command_buffer);
    }
}

/// Handed to pass callbacks. Resolves resource and pipeline handles to native objects and only
/// allows touching resources the pass declared.
pub struct CommandRecorder<'r> {
    device: &'r dyn GpuDevice,
    command_buffer: vk::CommandBuffer,
    resources: &'r ResourceAllocator,
    pipelines: &'r mut PipelineCache,
    formats: Option<&'r RenderTargetFormats>,
    bound: Option<BoundPipeline>,
    declared_buffers: &'r [BufferUsageToken],
    declared_textures: &'r [TextureUsageToken],
}

impl<'r> CommandRecorder<'r> {
    pub(super) fn new(
        device: &'r dyn GpuDevice,
        command_buffer: vk::CommandBuffer,
        resources: &'r ResourceAllocator,
        pipelines: &'r mut PipelineCache,
        formats: Option<&'r RenderTargetFormats>,
        declared_buffers: &'r [BufferUsageToken],
        declared_textures: &'r [TextureUsageToken],
    ) -> Self {
        CommandRecorder {
            device,
            command_buffer,
            resources,
            pipelines,
            formats,
            bound: None,
            declared_buffers,
            declared_textures,
        }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn resources(&self) -> &ResourceAllocator {
        self.resources
    }

    /// Attachment formats of the enclosing render pass, if any.
    pub fn formats(&self) -> Option<&RenderTargetFormats> {
        self.formats
    }

    fn debug_assert_declared_buffer(&self, buffer: BufferHandle) {
        debug_assert!(
            self.declared_buffers.iter().any(|token| token.buffer == buffer),
            "{} is used by a pass that did not declare it",
            self.resources.buffer(buffer).name
        );
    }

    fn debug_assert_declared_texture(&self, texture: TextureHandle) {
        debug_assert!(
            self.declared_textures.iter().any(|token| token.texture == texture),
            "{} is used by a pass that did not declare it",
            self.resources.texture(texture).name
        );
    }

    /// View of a declared texture, for callers writing their own descriptors.
    pub fn texture_view(&self, texture: TextureHandle) -> vk::ImageView {
        self.debug_assert_declared_texture(texture);
        self.resources.texture(texture).view
    }

    fn bind(&mut self, bound: BoundPipeline) {
        self.device
            .cmd_bind_pipeline(self.command_buffer, bound.bind_point, bound.pipeline);
        self.bound = Some(bound);
    }

    fn bound(&self) -> BoundPipeline {
        match self.bound {
            Some(bound) => bound,
            None => fatal("descriptor or push constant binding", "no pipeline bound in this pass"),
        }
    }

    /// Compiles the variant for the current attachment formats on first use.
    pub fn bind_graphics_pipeline(&mut self, handle: GraphicsPipelineHandle) {
        let formats = match self.formats {
            Some(formats) => formats,
            None => fatal("graphics pipeline binding", "not inside a render pass"),
        };
        match self.pipelines.graphics_variant(handle, formats) {
            Ok(bound) => self.bind(bound),
            Err(error) => fatal("graphics pipeline compilation", error),
        }
    }

    pub fn bind_compute_pipeline(&mut self, handle: ComputePipelineHandle) {
        match self.pipelines.compute_pipeline(handle) {
            Ok(bound) => self.bind(bound),
            Err(error) => fatal("compute pipeline compilation", error),
        }
    }

    pub fn bind_ray_tracing_pipeline(&mut self, handle: RayTracingPipelineHandle) {
        match self.pipelines.ray_tracing_pipeline(handle) {
            Ok(bound) => self.bind(bound),
            Err(error) => fatal("ray tracing pipeline compilation", error),
        }
    }

    pub fn bind_descriptor_set(&mut self, index: u32, set: &DescriptorSet) {
        self.bind_raw_descriptor_sets(index, &[set.handle]);
    }

    pub fn bind_descriptor_sets(&mut self, first_set: u32, sets: &[&DescriptorSet]) {
        let handles = sets.iter().map(|set| set.handle).collect::<smallvec::SmallVec<[_; 4]>>();
        self.bind_raw_descriptor_sets(first_set, &handles);
    }

    pub(super) fn bind_raw_descriptor_sets(&mut self, first_set: u32, sets: &[vk::DescriptorSet]) {
        if sets.is_empty() {
            return;
        }
        let bound = self.bound();
        self.device
            .cmd_bind_descriptor_sets(self.command_buffer, bound.bind_point, bound.layout, first_set, sets);
    }

    pub fn set_push_constants<P: Pod>(&mut self, push_constants: &P) {
        let bytes = bytemuck::bytes_of(push_constants);
        if bytes.is_empty() {
            return;
        }
        let bound = self.bound();
        self.device
            .cmd_push_constants(self.command_buffer, bound.layout, bound.push_stages, 0, bytes);
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: vk::DeviceSize, index_type: vk::IndexType) {
        self.debug_assert_declared_buffer(buffer);
        self.device.cmd_bind_index_buffer(
            self.command_buffer,
            self.resources.buffer(buffer).buffer,
            offset,
            index_type,
        );
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.device.cmd_draw(self.command_buffer, vertices, instances);
    }

    pub fn draw_indexed(&mut self, indices: Range<u32>, vertex_offset: i32, instances: Range<u32>) {
        self.device
            .cmd_draw_indexed(self.command_buffer, indices, vertex_offset, instances);
    }

    pub fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        self.debug_assert_declared_buffer(buffer);
        self.device.cmd_draw_indexed_indirect(
            self.command_buffer,
            self.resources.buffer(buffer).buffer,
            offset,
            draw_count,
            stride,
        );
    }

    pub fn dispatch(&mut self, workgroups: [u32; 3]) {
        self.device.cmd_dispatch(self.command_buffer, workgroups);
    }

    pub fn dispatch_indirect(&mut self, buffer: BufferHandle, offset: vk::DeviceSize) {
        self.debug_assert_declared_buffer(buffer);
        self.device
            .cmd_dispatch_indirect(self.command_buffer, self.resources.buffer(buffer).buffer, offset);
    }

    /// Builds are independent of each other, they may not share scratch ranges.
    pub fn build_acceleration_structures(&mut self, builds: &[BlasBuild]) {
        if !builds.is_empty() {
            self.device
                .cmd_build_acceleration_structures(self.command_buffer, builds);
        }
    }
}
