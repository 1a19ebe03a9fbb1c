use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use profiling::scope;
use smallvec::SmallVec;
use tracing::{debug, info};

use super::{
    descriptors::{
        merge_reflection, DescriptorBinding, DescriptorLayoutCache, DescriptorSetLayoutInfo, ShaderReflection,
    },
    GpuDevice, GraphicsPipelineInfo, RayTracingPipelineInfo, ShaderStage,
};
use crate::renderer::error::BackendError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderModule {
    pub spirv: Vec<u32>,
    pub entry_point: String,
    pub reflection: ShaderReflection,
}

impl ShaderModule {
    pub fn new(spirv: Vec<u32>, reflection: ShaderReflection) -> ShaderModule {
        ShaderModule {
            spirv,
            entry_point: "main".to_string(),
            reflection,
        }
    }

    fn stage(&self) -> ShaderStage<'_> {
        ShaderStage {
            stage: self.reflection.stage,
            spirv: &self.spirv,
            entry_point: &self.entry_point,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    AlphaBlend,
    Additive,
}

/// Fixed-function state of a graphics pipeline. Viewport and scissor are always dynamic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: Option<vk::CompareOp>,
    pub depth_write: bool,
    pub blend: BlendMode,
}

impl Default for RasterState {
    fn default() -> Self {
        RasterState {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: Some(vk::CompareOp::GREATER_OR_EQUAL),
            depth_write: true,
            blend: BlendMode::Opaque,
        }
    }
}

/// Attachment formats a graphics pipeline gets compiled against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderTargetFormats {
    pub color: SmallVec<[vk::Format; 8]>,
    pub depth: Option<vk::Format>,
    pub view_mask: u32,
    pub shading_rate: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDesc {
    pub name: String,
    pub vertex: ShaderModule,
    pub fragment: Option<ShaderModule>,
    pub state: RasterState,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComputePipelineDesc {
    pub name: String,
    pub shader: ShaderModule,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RayTracingPipelineDesc {
    pub name: String,
    pub raygen: ShaderModule,
    pub miss: Vec<ShaderModule>,
    pub closest_hit: Vec<ShaderModule>,
    pub max_recursion_depth: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineHandle(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComputePipelineHandle(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RayTracingPipelineHandle(u32);

/// Descriptor set layouts and push constant ranges of one pipeline.
#[derive(Clone, Debug)]
pub struct PipelineInterface {
    pub name: String,
    pub layout: vk::PipelineLayout,
    pub sets: Vec<DescriptorSetLayoutInfo>,
    pub push_constant_ranges: SmallVec<[vk::PushConstantRange; 2]>,
    pub push_stages: vk::ShaderStageFlags,
}

impl PipelineInterface {
    pub fn set(&self, index: u32) -> Result<&DescriptorSetLayoutInfo, BackendError> {
        self.sets.get(index as usize).ok_or_else(|| BackendError::MissingDescriptorSet {
            name: self.name.clone(),
            set: index,
        })
    }
}

/// What a command buffer needs to bind a compiled pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub push_stages: vk::ShaderStageFlags,
}

struct Entry<D> {
    desc: D,
    interface: PipelineInterface,
}

type PipelineLayoutKey = (SmallVec<[vk::DescriptorSetLayout; 4]>, SmallVec<[(vk::ShaderStageFlags, u32, u32); 2]>);

/// Deduplicates pipeline descriptions into handles and compiles native pipelines lazily, on
/// first bind.
pub struct PipelineCache {
    device: Arc<dyn GpuDevice>,
    set_layouts: DescriptorLayoutCache,
    pipeline_layouts: HashMap<PipelineLayoutKey, vk::PipelineLayout>,
    graphics: Vec<Entry<GraphicsPipelineDesc>>,
    graphics_lookup: HashMap<GraphicsPipelineDesc, GraphicsPipelineHandle>,
    graphics_variants: HashMap<(GraphicsPipelineHandle, RenderTargetFormats), vk::Pipeline>,
    compute: Vec<(Entry<ComputePipelineDesc>, Option<vk::Pipeline>)>,
    compute_lookup: HashMap<ComputePipelineDesc, ComputePipelineHandle>,
    ray_tracing: Vec<(Entry<RayTracingPipelineDesc>, Option<vk::Pipeline>)>,
    ray_tracing_lookup: HashMap<RayTracingPipelineDesc, RayTracingPipelineHandle>,
}

impl PipelineCache {
    pub fn new(device: Arc<dyn GpuDevice>) -> PipelineCache {
        PipelineCache {
            device,
            set_layouts: DescriptorLayoutCache::default(),
            pipeline_layouts: HashMap::new(),
            graphics: vec![],
            graphics_lookup: HashMap::new(),
            graphics_variants: HashMap::new(),
            compute: vec![],
            compute_lookup: HashMap::new(),
            ray_tracing: vec![],
            ray_tracing_lookup: HashMap::new(),
        }
    }

    fn interface(&mut self, name: &str, stages: &[&ShaderReflection]) -> Result<PipelineInterface, BackendError> {
        let merged = merge_reflection(name, stages)?;

        let mut sets = Vec::with_capacity(merged.sets.len());
        for bindings in merged.sets {
            let layout = self.set_layouts.get_or_create(&*self.device, &bindings)?;
            sets.push(DescriptorSetLayoutInfo { layout, bindings });
        }

        let key: PipelineLayoutKey = (
            sets.iter().map(|set| set.layout).collect(),
            merged
                .push_constants
                .iter()
                .map(|range| (range.stage_flags, range.offset, range.size))
                .collect(),
        );
        let layout = match self.pipeline_layouts.get(&key) {
            Some(&layout) => layout,
            None => {
                let layout = self
                    .device
                    .create_pipeline_layout(&key.0, &merged.push_constants)
                    .map_err(|result| {
                        BackendError::creation("pipeline layout", name, format!("{} sets", key.0.len()), result)
                    })?;
                self.device.name_object(layout, name);
                debug!(name, sets = key.0.len(), "created pipeline layout");
                self.pipeline_layouts.insert(key, layout);
                layout
            }
        };

        let push_stages = merged
            .push_constants
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |stages, range| stages | range.stage_flags);

        Ok(PipelineInterface {
            name: name.to_string(),
            layout,
            sets,
            push_constant_ranges: merged.push_constants,
            push_stages,
        })
    }

    pub fn create_graphics_pipeline(&mut self, desc: GraphicsPipelineDesc) -> Result<GraphicsPipelineHandle, BackendError> {
        if let Some(&handle) = self.graphics_lookup.get(&desc) {
            return Ok(handle);
        }
        let mut stages = vec![&desc.vertex.reflection];
        stages.extend(desc.fragment.as_ref().map(|fragment| &fragment.reflection));
        let interface = self.interface(&desc.name, &stages)?;

        let handle = GraphicsPipelineHandle(self.graphics.len() as u32);
        self.graphics_lookup.insert(desc.clone(), handle);
        self.graphics.push(Entry { desc, interface });
        Ok(handle)
    }

    pub fn create_compute_pipeline(&mut self, desc: ComputePipelineDesc) -> Result<ComputePipelineHandle, BackendError> {
        if let Some(&handle) = self.compute_lookup.get(&desc) {
            return Ok(handle);
        }
        let interface = self.interface(&desc.name, &[&desc.shader.reflection])?;

        let handle = ComputePipelineHandle(self.compute.len() as u32);
        self.compute_lookup.insert(desc.clone(), handle);
        self.compute.push((Entry { desc, interface }, None));
        Ok(handle)
    }

    pub fn create_ray_tracing_pipeline(
        &mut self,
        desc: RayTracingPipelineDesc,
    ) -> Result<RayTracingPipelineHandle, BackendError> {
        if let Some(&handle) = self.ray_tracing_lookup.get(&desc) {
            return Ok(handle);
        }
        let stages = std::iter::once(&desc.raygen)
            .chain(&desc.miss)
            .chain(&desc.closest_hit)
            .map(|shader| &shader.reflection)
            .collect::<Vec<_>>();
        let interface = self.interface(&desc.name, &stages)?;

        let handle = RayTracingPipelineHandle(self.ray_tracing.len() as u32);
        self.ray_tracing_lookup.insert(desc.clone(), handle);
        self.ray_tracing.push((Entry { desc, interface }, None));
        Ok(handle)
    }

    pub fn graphics_interface(&self, handle: GraphicsPipelineHandle) -> &PipelineInterface {
        &self.graphics[handle.0 as usize].interface
    }

    pub fn compute_interface(&self, handle: ComputePipelineHandle) -> &PipelineInterface {
        &self.compute[handle.0 as usize].0.interface
    }

    pub fn ray_tracing_interface(&self, handle: RayTracingPipelineHandle) -> &PipelineInterface {
        &self.ray_tracing[handle.0 as usize].0.interface
    }

    /// Compiles the variant for `formats` on first use.
    pub fn graphics_variant(
        &mut self,
        handle: GraphicsPipelineHandle,
        formats: &RenderTargetFormats,
    ) -> Result<BoundPipeline, BackendError> {
        let entry = &self.graphics[handle.0 as usize];
        let bound = |pipeline| BoundPipeline {
            pipeline,
            layout: entry.interface.layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_stages: entry.interface.push_stages,
        };
        if let Some(&pipeline) = self.graphics_variants.get(&(handle, formats.clone())) {
            return Ok(bound(pipeline));
        }

        scope!("pipelines", "compile_graphics");
        let mut stages = SmallVec::<[ShaderStage; 2]>::new();
        stages.push(entry.desc.vertex.stage());
        stages.extend(entry.desc.fragment.as_ref().map(ShaderModule::stage));
        let pipeline = self
            .device
            .create_graphics_pipeline(&GraphicsPipelineInfo {
                name: &entry.desc.name,
                layout: entry.interface.layout,
                stages: &stages,
                state: &entry.desc.state,
                formats,
            })
            .map_err(|result| BackendError::creation("graphics pipeline", &entry.desc.name, format!("{formats:?}"), result))?;
        self.device.name_object(pipeline, &entry.desc.name);
        info!(name = %entry.desc.name, ?formats, "compiled graphics pipeline");

        let bound = bound(pipeline);
        self.graphics_variants.insert((handle, formats.clone()), pipeline);
        Ok(bound)
    }

    pub fn compute_pipeline(&mut self, handle: ComputePipelineHandle) -> Result<BoundPipeline, BackendError> {
        let (entry, compiled) = &mut self.compute[handle.0 as usize];
        let pipeline = match *compiled {
            Some(pipeline) => pipeline,
            None => {
                scope!("pipelines", "compile_compute");
                let pipeline = self
                    .device
                    .create_compute_pipeline(&entry.desc.name, entry.interface.layout, &entry.desc.shader.stage())
                    .map_err(|result| BackendError::creation("compute pipeline", &entry.desc.name, "", result))?;
                self.device.name_object(pipeline, &entry.desc.name);
                info!(name = %entry.desc.name, "compiled compute pipeline");
                *compiled = Some(pipeline);
                pipeline
            }
        };
        Ok(BoundPipeline {
            pipeline,
            layout: entry.interface.layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            push_stages: entry.interface.push_stages,
        })
    }

    pub fn ray_tracing_pipeline(&mut self, handle: RayTracingPipelineHandle) -> Result<BoundPipeline, BackendError> {
        let (entry, compiled) = &mut self.ray_tracing[handle.0 as usize];
        let pipeline = match *compiled {
            Some(pipeline) => pipeline,
            None => {
                scope!("pipelines", "compile_ray_tracing");
                let miss = entry.desc.miss.iter().map(ShaderModule::stage).collect::<Vec<_>>();
                let closest_hit = entry.desc.closest_hit.iter().map(ShaderModule::stage).collect::<Vec<_>>();
                let pipeline = self
                    .device
                    .create_ray_tracing_pipeline(&RayTracingPipelineInfo {
                        name: &entry.desc.name,
                        layout: entry.interface.layout,
                        raygen: entry.desc.raygen.stage(),
                        miss: &miss,
                        closest_hit: &closest_hit,
                        max_recursion_depth: entry.desc.max_recursion_depth,
                    })
                    .map_err(|result| {
                        BackendError::creation(
                            "ray tracing pipeline",
                            &entry.desc.name,
                            format!("recursion {}", entry.desc.max_recursion_depth),
                            result,
                        )
                    })?;
                self.device.name_object(pipeline, &entry.desc.name);
                info!(name = %entry.desc.name, "compiled ray tracing pipeline");
                *compiled = Some(pipeline);
                pipeline
            }
        };
        Ok(BoundPipeline {
            pipeline,
            layout: entry.interface.layout,
            bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
            push_stages: entry.interface.push_stages,
        })
    }

    /// Cached layout for a set built outside of any pipeline's reflection, such as a bindless
    /// texture table. Pipelines reflecting the same bindings get the same layout.
    pub fn set_layout(&mut self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetLayoutInfo, BackendError> {
        let layout = self.set_layouts.get_or_create(&*self.device, bindings)?;
        Ok(DescriptorSetLayoutInfo {
            layout,
            bindings: bindings.to_vec(),
        })
    }

    pub fn set_layout_count(&self) -> usize {
        self.set_layouts.len()
    }

    pub fn compiled_pipeline_count(&self) -> usize {
        self.graphics_variants.len()
            + self.compute.iter().filter(|(_, pipeline)| pipeline.is_some()).count()
            + self.ray_tracing.iter().filter(|(_, pipeline)| pipeline.is_some()).count()
    }

    pub(crate) fn destroy(&mut self) {
        let device = &*self.device;
        for (_, pipeline) in self.graphics_variants.drain() {
            device.destroy_pipeline(pipeline);
        }
        for pipeline in self
            .compute
            .drain(..)
            .filter_map(|(_, pipeline)| pipeline)
            .chain(self.ray_tracing.drain(..).filter_map(|(_, pipeline)| pipeline))
        {
            device.destroy_pipeline(pipeline);
        }
        self.graphics.clear();
        self.graphics_lookup.clear();
        self.compute_lookup.clear();
        self.ray_tracing_lookup.clear();
        for (_, layout) in self.pipeline_layouts.drain() {
            device.destroy_pipeline_layout(layout);
        }
        self.set_layouts.destroy(device);
    }
}
