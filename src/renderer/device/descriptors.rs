use std::collections::BTreeMap;

use ash::vk;
use hashbrown::HashMap;
use profiling::scope;
use smallvec::SmallVec;
use tracing::{debug, error, trace};

use super::{DescriptorWrite, GpuDevice};
use crate::renderer::{
    error::{fatal, BackendError},
    graph::{BufferUsageToken, TextureUsageToken},
    resources::{AccelerationStructureHandle, BufferHandle, ResourceAllocator, TextureHandle},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    /// Whether any stage writes through this binding. Only affects usage tokens, never the
    /// native layout.
    pub writable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub writable: bool,
}

/// Interface of one shader stage as reported by reflection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderReflection {
    pub stage: vk::ShaderStageFlags,
    pub bindings: Vec<ReflectedBinding>,
    /// `(offset, size)` of the push constant block, if any.
    pub push_constants: Option<(u32, u32)>,
}

/// Interface of a whole pipeline. Set indices are dense, sets no stage uses are empty.
#[derive(Clone, Debug, Default)]
pub struct MergedReflection {
    pub sets: Vec<Vec<DescriptorBinding>>,
    pub push_constants: SmallVec<[vk::PushConstantRange; 2]>,
}

pub fn merge_reflection(name: &str, stages: &[&ShaderReflection]) -> Result<MergedReflection, BackendError> {
    let mut bindings = BTreeMap::<(u32, u32), DescriptorBinding>::new();
    let mut push_constants = BTreeMap::<u32, vk::PushConstantRange>::new();

    for reflection in stages {
        for reflected in &reflection.bindings {
            let key = (reflected.set, reflected.binding);
            match bindings.get_mut(&key) {
                None => {
                    bindings.insert(
                        key,
                        DescriptorBinding {
                            binding: reflected.binding,
                            ty: reflected.ty,
                            count: reflected.count,
                            stages: reflection.stage,
                            writable: reflected.writable,
                        },
                    );
                }
                Some(existing) if existing.ty != reflected.ty => {
                    return Err(BackendError::BindingTypeMismatch {
                        set: reflected.set,
                        binding: reflected.binding,
                        first: existing.ty,
                        second: reflected.ty,
                    });
                }
                Some(existing) if existing.count != reflected.count => {
                    return Err(BackendError::BindingCountMismatch {
                        set: reflected.set,
                        binding: reflected.binding,
                        first: existing.count,
                        second: reflected.count,
                    });
                }
                Some(existing) => {
                    existing.stages |= reflection.stage;
                    existing.writable |= reflected.writable;
                }
            }
        }

        if let Some((offset, size)) = reflection.push_constants {
            let range = push_constants.entry(offset).or_insert(vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::empty(),
                offset,
                size,
            });
            if range.size != size {
                error!(
                    name,
                    offset,
                    first = range.size,
                    second = size,
                    "push constant block size differs between stages, keeping the larger one"
                );
                range.size = range.size.max(size);
            }
            range.stage_flags |= reflection.stage;
        }
    }

    let set_count = bindings.keys().map(|&(set, _)| set + 1).max().unwrap_or(0);
    let mut sets = vec![vec![]; set_count as usize];
    for ((set, _), binding) in bindings {
        sets[set as usize].push(binding);
    }

    Ok(MergedReflection {
        sets,
        push_constants: push_constants.into_values().collect(),
    })
}

/// Layout of one descriptor set together with the bindings it was derived from.
#[derive(Clone, Debug)]
pub struct DescriptorSetLayoutInfo {
    pub layout: vk::DescriptorSetLayout,
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutInfo {
    fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|candidate| candidate.binding == binding)
    }
}

type LayoutKey = SmallVec<[DescriptorBinding; 8]>;

#[derive(Default)]
pub(crate) struct DescriptorLayoutCache {
    layouts: HashMap<LayoutKey, vk::DescriptorSetLayout>,
}

impl DescriptorLayoutCache {
    pub(crate) fn get_or_create(
        &mut self,
        device: &dyn GpuDevice,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, BackendError> {
        let mut key: LayoutKey = bindings
            .iter()
            .map(|binding| DescriptorBinding {
                writable: false,
                ..*binding
            })
            .collect();
        key.sort_unstable_by_key(|binding| binding.binding);

        if let Some(&layout) = self.layouts.get(&key) {
            return Ok(layout);
        }

        let layout = device
            .create_descriptor_set_layout(&key)
            .map_err(|result| BackendError::creation("descriptor set layout", "cached layout", format!("{key:?}"), result))?;
        device.name_object(layout, &format!("Descriptor set layout {}", self.layouts.len()));
        debug!(bindings = key.len(), "created descriptor set layout");
        self.layouts.insert(key, layout);

        Ok(layout)
    }

    pub(crate) fn len(&self) -> usize {
        self.layouts.len()
    }

    pub(crate) fn destroy(&mut self, device: &dyn GpuDevice) {
        for (_, layout) in self.layouts.drain() {
            device.destroy_descriptor_set_layout(layout);
        }
    }
}

const POOL_SIZE_MULTIPLIERS: [(vk::DescriptorType, f32); 8] = [
    (vk::DescriptorType::SAMPLER, 0.5),
    (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
    (vk::DescriptorType::SAMPLED_IMAGE, 4.0),
    (vk::DescriptorType::STORAGE_IMAGE, 1.0),
    (vk::DescriptorType::UNIFORM_BUFFER, 2.0),
    (vk::DescriptorType::STORAGE_BUFFER, 2.0),
    (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1.0),
    (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1.0),
];

/// Grows by whole pools. Sets are never freed individually, only all at once through
/// [`DescriptorSetAllocator::reset_pools`].
pub struct DescriptorSetAllocator {
    name: String,
    sets_per_pool: u32,
    current: Option<vk::DescriptorPool>,
    used: Vec<vk::DescriptorPool>,
    free: Vec<vk::DescriptorPool>,
}

impl DescriptorSetAllocator {
    pub(crate) fn new(name: &str, sets_per_pool: u32) -> DescriptorSetAllocator {
        DescriptorSetAllocator {
            name: name.to_string(),
            sets_per_pool,
            current: None,
            used: vec![],
            free: vec![],
        }
    }

    fn grab_pool(&mut self, device: &dyn GpuDevice) -> Result<vk::DescriptorPool, BackendError> {
        if let Some(current) = self.current.take() {
            self.used.push(current);
        }
        let pool = match self.free.pop() {
            Some(pool) => pool,
            None => {
                let sizes = POOL_SIZE_MULTIPLIERS
                    .iter()
                    .map(|&(ty, multiplier)| vk::DescriptorPoolSize {
                        ty,
                        descriptor_count: ((self.sets_per_pool as f32 * multiplier) as u32).max(1),
                    })
                    .collect::<SmallVec<[_; 8]>>();
                let pool = device.create_descriptor_pool(self.sets_per_pool, &sizes).map_err(|result| {
                    BackendError::creation("descriptor pool", &self.name, format!("{} sets", self.sets_per_pool), result)
                })?;
                let pool_count = self.used.len() + self.free.len() + 1;
                device.name_object(pool, &format!("{} pool {}", self.name, pool_count));
                debug!(name = %self.name, pools = pool_count, "created descriptor pool");
                pool
            }
        };
        self.current = Some(pool);
        Ok(pool)
    }

    pub fn allocate(
        &mut self,
        device: &dyn GpuDevice,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, BackendError> {
        let pool = match self.current {
            Some(pool) => pool,
            None => self.grab_pool(device)?,
        };
        match device.allocate_descriptor_set(pool, layout) {
            Ok(set) => Ok(set),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                trace!(name = %self.name, "descriptor pool exhausted, moving on to the next one");
                let pool = self.grab_pool(device)?;
                device
                    .allocate_descriptor_set(pool, layout)
                    .map_err(|result| BackendError::creation("descriptor set", &self.name, "fresh pool", result))
            }
            Err(result) => Err(BackendError::creation("descriptor set", &self.name, "", result)),
        }
    }

    /// Invalidates every set allocated so far.
    pub fn reset_pools(&mut self, device: &dyn GpuDevice) {
        scope!("descriptors", "reset_pools");

        for pool in self.current.take().into_iter().chain(self.used.drain(..)) {
            if let Err(result) = device.reset_descriptor_pool(pool) {
                fatal("descriptor pool reset", result);
            }
            self.free.push(pool);
        }
    }

    pub(crate) fn destroy(&mut self, device: &dyn GpuDevice) {
        for pool in self
            .current
            .take()
            .into_iter()
            .chain(self.used.drain(..))
            .chain(self.free.drain(..))
        {
            device.destroy_descriptor_pool(pool);
        }
    }
}

/// Native set plus the usage tokens of every resource bound to it. Passes that list the set
/// inherit the tokens.
#[derive(Clone, Debug)]
pub struct DescriptorSet {
    pub handle: vk::DescriptorSet,
    pub(crate) buffers: SmallVec<[BufferUsageToken; 4]>,
    pub(crate) textures: SmallVec<[TextureUsageToken; 4]>,
}

impl DescriptorSet {
    pub fn buffer_tokens(&self) -> &[BufferUsageToken] {
        &self.buffers
    }

    pub fn texture_tokens(&self) -> &[TextureUsageToken] {
        &self.textures
    }
}

pub(crate) fn shader_stages_to_pipeline_stages(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags2 {
    use vk::{PipelineStageFlags2 as P, ShaderStageFlags as S};

    let mut flags = P::NONE;
    for (shader, pipeline) in [
        (S::VERTEX, P::VERTEX_SHADER),
        (S::TESSELLATION_CONTROL, P::TESSELLATION_CONTROL_SHADER),
        (S::TESSELLATION_EVALUATION, P::TESSELLATION_EVALUATION_SHADER),
        (S::GEOMETRY, P::GEOMETRY_SHADER),
        (S::FRAGMENT, P::FRAGMENT_SHADER),
        (S::COMPUTE, P::COMPUTE_SHADER),
        (
            S::RAYGEN_KHR | S::MISS_KHR | S::CLOSEST_HIT_KHR | S::ANY_HIT_KHR | S::INTERSECTION_KHR | S::CALLABLE_KHR,
            P::RAY_TRACING_SHADER_KHR,
        ),
    ] {
        if stages.intersects(shader) {
            flags |= pipeline;
        }
    }
    flags
}

#[derive(Clone, Copy, Debug)]
enum Bound {
    Buffer {
        binding: u32,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Texture {
        binding: u32,
        texture: TextureHandle,
        sampler: vk::Sampler,
    },
    AccelerationStructure {
        binding: u32,
        handle: AccelerationStructureHandle,
    },
}

/// Collects resources for one set of a layout, then allocates and writes it in one go.
pub struct DescriptorSetBuilder<'a> {
    name: &'a str,
    layout: &'a DescriptorSetLayoutInfo,
    bound: SmallVec<[Bound; 8]>,
}

impl<'a> DescriptorSetBuilder<'a> {
    pub fn new(name: &'a str, layout: &'a DescriptorSetLayoutInfo) -> Self {
        DescriptorSetBuilder {
            name,
            layout,
            bound: SmallVec::new(),
        }
    }

    /// Binds the whole buffer.
    pub fn bind_buffer(self, binding: u32, buffer: BufferHandle) -> Self {
        self.bind_buffer_range(binding, buffer, 0, vk::WHOLE_SIZE)
    }

    pub fn bind_buffer_range(
        mut self,
        binding: u32,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Self {
        self.bound.push(Bound::Buffer {
            binding,
            buffer,
            offset,
            range,
        });
        self
    }

    /// Storage or sampled image without an immutable sampler.
    pub fn bind_texture(mut self, binding: u32, texture: TextureHandle) -> Self {
        self.bound.push(Bound::Texture {
            binding,
            texture,
            sampler: vk::Sampler::null(),
        });
        self
    }

    pub fn bind_sampled_texture(mut self, binding: u32, texture: TextureHandle, sampler: vk::Sampler) -> Self {
        self.bound.push(Bound::Texture {
            binding,
            texture,
            sampler,
        });
        self
    }

    pub fn bind_acceleration_structure(mut self, binding: u32, handle: AccelerationStructureHandle) -> Self {
        self.bound.push(Bound::AccelerationStructure { binding, handle });
        self
    }

    pub fn build(
        self,
        allocator: &mut DescriptorSetAllocator,
        resources: &ResourceAllocator,
    ) -> Result<DescriptorSet, BackendError> {
        scope!("descriptors", "build_descriptor_set");

        let mut writes = SmallVec::<[DescriptorWrite; 8]>::new();
        let mut buffers = SmallVec::new();
        let mut textures = SmallVec::new();

        for bound in &self.bound {
            let binding_index = match *bound {
                Bound::Buffer { binding, .. }
                | Bound::Texture { binding, .. }
                | Bound::AccelerationStructure { binding, .. } => binding,
            };
            let binding = self
                .layout
                .binding(binding_index)
                .ok_or_else(|| BackendError::UnknownBinding {
                    name: self.name.to_string(),
                    binding: binding_index,
                })?;
            let stage = shader_stages_to_pipeline_stages(binding.stages);

            match *bound {
                Bound::Buffer {
                    binding: index,
                    buffer,
                    offset,
                    range,
                } => {
                    let access = match binding.ty {
                        vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
                            vk::AccessFlags2::UNIFORM_READ
                        }
                        _ if binding.writable => {
                            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
                        }
                        _ => vk::AccessFlags2::SHADER_STORAGE_READ,
                    };
                    writes.push(DescriptorWrite::Buffer {
                        binding: index,
                        ty: binding.ty,
                        buffer: resources.buffer(buffer).buffer,
                        offset,
                        range,
                    });
                    buffers.push(BufferUsageToken { buffer, stage, access });
                }
                Bound::Texture {
                    binding: index,
                    texture,
                    sampler,
                } => {
                    let (access, layout) = match binding.ty {
                        vk::DescriptorType::STORAGE_IMAGE if binding.writable => (
                            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                            vk::ImageLayout::GENERAL,
                        ),
                        vk::DescriptorType::STORAGE_IMAGE => {
                            (vk::AccessFlags2::SHADER_STORAGE_READ, vk::ImageLayout::GENERAL)
                        }
                        _ => (
                            vk::AccessFlags2::SHADER_SAMPLED_READ,
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        ),
                    };
                    writes.push(DescriptorWrite::Image {
                        binding: index,
                        array_element: 0,
                        ty: binding.ty,
                        view: resources.texture(texture).view,
                        layout,
                        sampler,
                    });
                    textures.push(TextureUsageToken {
                        texture,
                        stage,
                        access,
                        layout,
                    });
                }
                Bound::AccelerationStructure { binding: index, handle } => {
                    let structure = resources.acceleration_structure(handle);
                    writes.push(DescriptorWrite::AccelerationStructure {
                        binding: index,
                        handle: structure.handle,
                    });
                    buffers.push(BufferUsageToken {
                        buffer: structure.buffer,
                        stage,
                        access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
                    });
                }
            }
        }

        let device = &**resources.device();
        let handle = allocator.allocate(device, self.layout.layout)?;
        device.name_object(handle, self.name);
        device.update_descriptor_set(handle, &writes);

        Ok(DescriptorSet {
            handle,
            buffers,
            textures,
        })
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

    fn reflected(set: u32, binding: u32, ty: vk::DescriptorType, writable: bool) -> ReflectedBinding {
        ReflectedBinding {
            set,
            binding,
            ty,
            count: 1,
            writable,
        }
    }

    #[test]
    fn stages_are_merged_per_binding() {
        let vertex = ShaderReflection {
            stage: vk::ShaderStageFlags::VERTEX,
            bindings: vec![
                reflected(0, 0, vk::DescriptorType::UNIFORM_BUFFER, false),
                reflected(2, 1, vk::DescriptorType::STORAGE_BUFFER, false),
            ],
            push_constants: Some((0, 16)),
        };
        let fragment = ShaderReflection {
            stage: vk::ShaderStageFlags::FRAGMENT,
            bindings: vec![
                reflected(0, 0, vk::DescriptorType::UNIFORM_BUFFER, false),
                reflected(2, 1, vk::DescriptorType::STORAGE_BUFFER, true),
            ],
            push_constants: Some((0, 32)),
        };

        let merged = merge_reflection("forward", &[&vertex, &fragment]).unwrap();
        assert_eq!(merged.sets.len(), 3);
        assert!(merged.sets[1].is_empty());
        assert_eq!(
            merged.sets[0][0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert!(merged.sets[2][0].writable);
        assert_eq!(merged.push_constants.len(), 1);
        let push = merged.push_constants[0];
        assert_eq!(push.stage_flags, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);
        assert_eq!((push.offset, push.size), (0, 32));
    }

    #[test]
    fn mismatched_declarations_are_configuration_errors() {
        let vertex = ShaderReflection {
            stage: vk::ShaderStageFlags::VERTEX,
            bindings: vec![reflected(0, 3, vk::DescriptorType::STORAGE_BUFFER, false)],
            push_constants: None,
        };
        let mut fragment = ShaderReflection {
            stage: vk::ShaderStageFlags::FRAGMENT,
            bindings: vec![ReflectedBinding {
                count: 4,
                ..reflected(0, 3, vk::DescriptorType::STORAGE_BUFFER, false)
            }],
            push_constants: None,
        };
        assert!(matches!(
            merge_reflection("counts", &[&vertex, &fragment]),
            Err(BackendError::BindingCountMismatch {
                set: 0,
                binding: 3,
                first: 1,
                second: 4
            })
        ));

        fragment.bindings[0] = reflected(0, 3, vk::DescriptorType::UNIFORM_BUFFER, false);
        assert!(matches!(
            merge_reflection("types", &[&vertex, &fragment]),
            Err(BackendError::BindingTypeMismatch { .. })
        ));
    }

    fn binding(binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags, writable: bool) -> DescriptorBinding {
        DescriptorBinding {
            binding,
            ty,
            count: 1,
            stages,
            writable,
        }
    }

    #[test]
    fn identical_layouts_are_created_once() {
        let device = TestDevice::new();
        let mut cache = DescriptorLayoutCache::default();
        let compute = vk::ShaderStageFlags::COMPUTE;

        let first = cache
            .get_or_create(
                &*device,
                &[
                    binding(0, vk::DescriptorType::STORAGE_BUFFER, compute, true),
                    binding(1, vk::DescriptorType::UNIFORM_BUFFER, compute, false),
                ],
            )
            .unwrap();
        let second = cache
            .get_or_create(
                &*device,
                &[
                    binding(1, vk::DescriptorType::UNIFORM_BUFFER, compute, false),
                    binding(0, vk::DescriptorType::STORAGE_BUFFER, compute, false),
                ],
            )
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        let other = cache
            .get_or_create(&*device, &[binding(0, vk::DescriptorType::STORAGE_BUFFER, compute, false)])
            .unwrap();
        assert_ne!(first, other);
        assert_eq!(
            device.count(|call| matches!(call, Call::CreateDescriptorSetLayout(_))),
            2
        );
        cache.destroy(&*device);
    }

    #[test]
    fn exhausted_pools_are_replaced_and_recycled() {
        let device = TestDevice::new();
        let mut cache = DescriptorLayoutCache::default();
        let layout = cache
            .get_or_create(
                &*device,
                &[binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::ALL, false)],
            )
            .unwrap();
        let mut allocator = DescriptorSetAllocator::new("transient", 4);

        allocator.allocate(&*device, layout).unwrap();
        device.fail_next_creation(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        allocator.allocate(&*device, layout).unwrap();
        assert_eq!(device.count(|call| matches!(call, Call::CreateDescriptorPool(_))), 2);

        allocator.reset_pools(&*device);
        assert_eq!(device.count(|call| matches!(call, Call::ResetDescriptorPool(_))), 2);
        allocator.allocate(&*device, layout).unwrap();
        assert_eq!(device.count(|call| matches!(call, Call::CreateDescriptorPool(_))), 2);

        allocator.destroy(&*device);
        cache.destroy(&*device);
        assert_eq!(device.count(|call| matches!(call, Call::DestroyDescriptorPool(_))), 2);
    }

    #[test]
    fn bound_resources_turn_into_usage_tokens() {
        let device = TestDevice::new();
        let mut resources = ResourceAllocator::new(device.clone() as Arc<dyn GpuDevice>, &BackendConfig::default());
        let mut cache = DescriptorLayoutCache::default();
        let mut allocator = DescriptorSetAllocator::new("persistent", 16);

        let compute = vk::ShaderStageFlags::COMPUTE;
        let bindings = vec![
            binding(0, vk::DescriptorType::STORAGE_BUFFER, compute, true),
            binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, compute | vk::ShaderStageFlags::FRAGMENT, false),
        ];
        let layout = DescriptorSetLayoutInfo {
            layout: cache.get_or_create(&*device, &bindings).unwrap(),
            bindings,
        };

        let buffer = resources.create_buffer("culled", 1024, BufferUsage::Storage).unwrap();
        let texture = resources
            .create_texture(
                "albedo",
                &TextureDesc::new_2d(
                    vk::Format::R8G8B8A8_SRGB,
                    vk::Extent2D { width: 4, height: 4 },
                    TextureUsage::StaticImage,
                ),
            )
            .unwrap();
        let sampler = resources.get_sampler(&Default::default()).unwrap();

        let set = DescriptorSetBuilder::new("cull set", &layout)
            .bind_buffer(0, buffer)
            .bind_sampled_texture(1, texture, sampler)
            .build(&mut allocator, &resources)
            .unwrap();

        assert_eq!(
            set.buffer_tokens(),
            &[BufferUsageToken {
                buffer,
                stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                access: vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            }]
        );
        assert_eq!(
            set.texture_tokens(),
            &[TextureUsageToken {
                texture,
                stage: vk::PipelineStageFlags2::COMPUTE_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                access: vk::AccessFlags2::SHADER_SAMPLED_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }]
        );
        assert!(device.calls().contains(&Call::UpdateDescriptorSet(set.handle, 2)));

        let unknown = DescriptorSetBuilder::new("broken", &layout)
            .bind_buffer(7, buffer)
            .build(&mut allocator, &resources);
        assert!(matches!(unknown, Err(BackendError::UnknownBinding { binding: 7, .. })));

        allocator.destroy(&*device);
        cache.destroy(&*device);
        resources.destroy_all();
    }
}
