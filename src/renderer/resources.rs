use std::sync::Arc;

use ash::vk;
use humansize::{file_size_opts, FileSize};
use profiling::scope;
use tracing::{debug, trace};

use super::{
    config::BackendConfig,
    device::{
        sampler::{SamplerCache, SamplerDesc},
        AccelerationStructureDesc, BufferDesc, DoubleBuffered, GpuDevice, ImageDesc, MemoryLocation, NativeImage,
    },
    error::BackendError,
    pool::{Handle, Pool},
};

pub type BufferHandle = Handle<GpuBuffer>;
pub type TextureHandle = Handle<GpuTexture>;
pub type AccelerationStructureHandle = Handle<GpuAccelerationStructure>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Staging,
    Vertex,
    Index,
    Indirect,
    Uniform,
    Storage,
    AccelerationStructure,
    AccelerationStructureScratch,
    ShaderBindingTable,
}

impl BufferUsage {
    fn native(self) -> (vk::BufferUsageFlags, MemoryLocation) {
        use vk::BufferUsageFlags as F;

        let (usage, location) = match self {
            BufferUsage::Staging => (F::TRANSFER_SRC, MemoryLocation::CpuToGpu),
            BufferUsage::Vertex => (
                F::VERTEX_BUFFER
                    | F::STORAGE_BUFFER
                    | F::TRANSFER_DST
                    | F::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                MemoryLocation::GpuOnly,
            ),
            BufferUsage::Index => (
                F::INDEX_BUFFER
                    | F::STORAGE_BUFFER
                    | F::TRANSFER_DST
                    | F::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                MemoryLocation::GpuOnly,
            ),
            BufferUsage::Indirect => (
                F::INDIRECT_BUFFER | F::STORAGE_BUFFER | F::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            ),
            BufferUsage::Uniform => (F::UNIFORM_BUFFER | F::TRANSFER_DST, MemoryLocation::CpuToGpu),
            BufferUsage::Storage => (
                F::STORAGE_BUFFER | F::TRANSFER_DST | F::TRANSFER_SRC,
                MemoryLocation::GpuOnly,
            ),
            BufferUsage::AccelerationStructure => (F::ACCELERATION_STRUCTURE_STORAGE_KHR, MemoryLocation::GpuOnly),
            BufferUsage::AccelerationStructureScratch => (F::STORAGE_BUFFER, MemoryLocation::GpuOnly),
            BufferUsage::ShaderBindingTable => (
                F::SHADER_BINDING_TABLE_KHR | F::TRANSFER_DST,
                MemoryLocation::CpuToGpu,
            ),
        };
        (usage | F::SHADER_DEVICE_ADDRESS, location)
    }

    pub fn is_host_visible(self) -> bool {
        self.native().1 != MemoryLocation::GpuOnly
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    RenderTarget,
    StaticImage,
    StorageImage,
    ShadingRateImage,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new_2d(format: vk::Format, extent: vk::Extent2D, usage: TextureUsage) -> TextureDesc {
        TextureDesc {
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            usage,
        }
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

#[derive(Debug)]
pub struct GpuBuffer {
    pub name: String,
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: BufferUsage,
    pub address: vk::DeviceAddress,
    zombie: bool,
}

#[derive(Debug)]
pub struct GpuTexture {
    pub name: String,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: TextureUsage,
    pub aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
    swapchain: bool,
    zombie: bool,
}

impl GpuTexture {
    /// Layout the image was left in by the last recorded graph.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    pub fn mip_extent(&self, mip: u32) -> vk::Extent2D {
        vk::Extent2D {
            width: (self.extent.width >> mip).max(1),
            height: (self.extent.height >> mip).max(1),
        }
    }
}

#[derive(Debug)]
pub struct GpuAccelerationStructure {
    pub name: String,
    pub handle: vk::AccelerationStructureKHR,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub buffer: BufferHandle,
    pub address: vk::DeviceAddress,
    pub size: vk::DeviceSize,
    zombie: bool,
}

/// Resources destroyed during one frame, tagged with that frame's number.
#[derive(Default)]
struct ZombieList {
    buffers: Vec<(u64, BufferHandle)>,
    textures: Vec<(u64, TextureHandle)>,
    acceleration_structures: Vec<(u64, AccelerationStructureHandle)>,
}

impl ZombieList {
    fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.textures.is_empty() && self.acceleration_structures.is_empty()
    }
}

pub(crate) fn format_size(size: vk::DeviceSize) -> String {
    size.file_size(file_size_opts::BINARY)
        .unwrap_or_else(|_| format!("{size} B"))
}

/// Owns every native buffer, image and acceleration structure. Destruction is deferred until the
/// frame slot that requested it comes around again.
pub struct ResourceAllocator {
    device: Arc<dyn GpuDevice>,
    min_buffer_size: vk::DeviceSize,
    buffers: Pool<GpuBuffer>,
    textures: Pool<GpuTexture>,
    acceleration_structures: Pool<GpuAccelerationStructure>,
    zombie_lists: DoubleBuffered<ZombieList>,
    frame_number: u64,
    samplers: SamplerCache,
}

impl ResourceAllocator {
    pub fn new(device: Arc<dyn GpuDevice>, config: &BackendConfig) -> ResourceAllocator {
        ResourceAllocator {
            device,
            min_buffer_size: config.min_buffer_size,
            buffers: Pool::default(),
            textures: Pool::default(),
            acceleration_structures: Pool::default(),
            zombie_lists: DoubleBuffered::new(config.frames_in_flight, |_| ZombieList::default()),
            frame_number: 0,
            samplers: SamplerCache::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub(crate) fn begin_frame(&mut self, frame_number: u64) {
        self.frame_number = frame_number;
    }

    pub fn create_buffer(
        &mut self,
        name: &str,
        size: vk::DeviceSize,
        usage: BufferUsage,
    ) -> Result<BufferHandle, BackendError> {
        scope!("resources", "create_buffer");

        let (usage_flags, location) = usage.native();
        let size = if usage == BufferUsage::Staging {
            size
        } else {
            size.max(self.min_buffer_size)
        };
        let native = self
            .device
            .create_buffer(&BufferDesc {
                name,
                size,
                usage: usage_flags,
                location,
            })
            .map_err(|result| {
                BackendError::creation("buffer", name, format!("{} {:?}", format_size(size), usage), result)
            })?;
        self.device.name_object(native.buffer, name);
        debug!(name, size = %format_size(size), ?usage, "created buffer");

        Ok(self.buffers.insert(GpuBuffer {
            name: name.to_string(),
            buffer: native.buffer,
            size,
            usage,
            address: native.address,
            zombie: false,
        }))
    }

    pub fn create_texture(&mut self, name: &str, desc: &TextureDesc) -> Result<TextureHandle, BackendError> {
        scope!("resources", "create_texture");
        use vk::ImageUsageFlags as F;

        let depth = is_depth_format(desc.format);
        let usage = match desc.usage {
            TextureUsage::RenderTarget if depth => F::DEPTH_STENCIL_ATTACHMENT | F::SAMPLED | F::TRANSFER_SRC,
            TextureUsage::RenderTarget => F::COLOR_ATTACHMENT | F::SAMPLED | F::TRANSFER_SRC | F::TRANSFER_DST,
            TextureUsage::StaticImage => F::SAMPLED | F::TRANSFER_DST,
            TextureUsage::StorageImage => F::STORAGE | F::SAMPLED | F::TRANSFER_SRC | F::TRANSFER_DST,
            TextureUsage::ShadingRateImage => F::FRAGMENT_SHADING_RATE_ATTACHMENT_KHR | F::STORAGE | F::TRANSFER_DST,
        };
        let aspect = if depth {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let native = self
            .device
            .create_image(&ImageDesc {
                name,
                format: desc.format,
                extent: desc.extent,
                mip_levels: desc.mip_levels.max(1),
                array_layers: desc.array_layers.max(1),
                usage,
                aspect,
            })
            .map_err(|result| BackendError::creation("texture", name, format!("{desc:?}"), result))?;
        self.device.name_object(native.image, name);
        self.device.name_object(native.view, name);
        debug!(name, ?desc, "created texture");

        Ok(self.textures.insert(GpuTexture {
            name: name.to_string(),
            image: native.image,
            view: native.view,
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels.max(1),
            array_layers: desc.array_layers.max(1),
            usage: desc.usage,
            aspect,
            layout: vk::ImageLayout::UNDEFINED,
            swapchain: false,
            zombie: false,
        }))
    }

    /// Registers an image owned by the swapchain. It can be used in graphs like any texture but
    /// is never destroyed here.
    pub(crate) fn import_swapchain_image(
        &mut self,
        name: &str,
        native: NativeImage,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> TextureHandle {
        self.textures.insert(GpuTexture {
            name: name.to_string(),
            image: native.image,
            view: native.view,
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            usage: TextureUsage::RenderTarget,
            aspect: vk::ImageAspectFlags::COLOR,
            layout: vk::ImageLayout::UNDEFINED,
            swapchain: true,
            zombie: false,
        })
    }

    pub fn create_acceleration_structure(
        &mut self,
        name: &str,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<AccelerationStructureHandle, BackendError> {
        scope!("resources", "create_acceleration_structure");

        let buffer = self.create_buffer(name, size, BufferUsage::AccelerationStructure)?;
        let native = self.device.create_acceleration_structure(&AccelerationStructureDesc {
            name,
            ty,
            buffer: self.buffers[buffer].buffer,
            size,
        });
        let native = match native {
            Ok(native) => native,
            Err(result) => {
                self.destroy_buffer(buffer);
                return Err(BackendError::creation(
                    "acceleration structure",
                    name,
                    format!("{:?} {}", ty, format_size(size)),
                    result,
                ));
            }
        };
        self.device.name_object(native.handle, name);
        debug!(name, ?ty, size = %format_size(size), "created acceleration structure");

        Ok(self.acceleration_structures.insert(GpuAccelerationStructure {
            name: name.to_string(),
            handle: native.handle,
            ty,
            buffer,
            address: native.address,
            size,
            zombie: false,
        }))
    }

    pub fn get_sampler(&mut self, desc: &SamplerDesc) -> Result<vk::Sampler, BackendError> {
        self.samplers.get_or_create(&*self.device, desc)
    }

    /// Copies `data` into a host-visible buffer at `offset`.
    pub fn write_buffer(&self, handle: BufferHandle, offset: vk::DeviceSize, data: &[u8]) -> Result<(), BackendError> {
        let buffer = &self.buffers[handle];
        debug_assert!(buffer.usage.is_host_visible(), "{} is not host visible", buffer.name);
        debug_assert!(offset + data.len() as vk::DeviceSize <= buffer.size, "write past the end of {}", buffer.name);
        self.device.write_buffer(buffer.buffer, offset, data).map_err(|result| {
            BackendError::creation("buffer mapping", &buffer.name, format!("{} at {offset}", data.len()), result)
        })
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        let buffer = &mut self.buffers[handle];
        debug_assert!(!buffer.zombie, "buffer {} destroyed twice", buffer.name);
        buffer.zombie = true;
        trace!(name = %buffer.name, frame = self.frame_number, "deferring buffer destruction");
        self.zombie_lists
            .current_mut(self.frame_number)
            .buffers
            .push((self.frame_number, handle));
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        let texture = &mut self.textures[handle];
        debug_assert!(!texture.zombie, "texture {} destroyed twice", texture.name);
        debug_assert!(!texture.swapchain, "swapchain image {} cannot be destroyed", texture.name);
        texture.zombie = true;
        trace!(name = %texture.name, frame = self.frame_number, "deferring texture destruction");
        self.zombie_lists
            .current_mut(self.frame_number)
            .textures
            .push((self.frame_number, handle));
    }

    /// Also defers destruction of the backing buffer.
    pub fn destroy_acceleration_structure(&mut self, handle: AccelerationStructureHandle) {
        let structure = &mut self.acceleration_structures[handle];
        debug_assert!(!structure.zombie, "acceleration structure {} destroyed twice", structure.name);
        structure.zombie = true;
        let buffer = structure.buffer;
        trace!(name = %structure.name, frame = self.frame_number, "deferring acceleration structure destruction");
        self.zombie_lists
            .current_mut(self.frame_number)
            .acceleration_structures
            .push((self.frame_number, handle));
        self.destroy_buffer(buffer);
    }

    /// Only valid for a slot whose fence has been waited on since its zombies were queued.
    pub(crate) fn free_resources_for_frame(&mut self, slot: usize) {
        scope!("resources", "free_resources_for_frame");

        let zombies = std::mem::take(&mut self.zombie_lists[slot]);
        if zombies.is_empty() {
            return;
        }
        let retired = self.frame_number.checked_sub(self.zombie_lists.len() as u64);

        for (epoch, handle) in zombies.acceleration_structures {
            debug_assert!(retired.map_or(false, |retired| epoch <= retired));
            if let Some(structure) = self.acceleration_structures.remove(handle) {
                trace!(name = %structure.name, epoch, "destroying acceleration structure");
                self.device.destroy_acceleration_structure(structure.handle);
            }
        }
        for (epoch, handle) in zombies.buffers {
            debug_assert!(retired.map_or(false, |retired| epoch <= retired));
            if let Some(buffer) = self.buffers.remove(handle) {
                trace!(name = %buffer.name, epoch, "destroying buffer");
                self.device.destroy_buffer(buffer.buffer);
            }
        }
        for (epoch, handle) in zombies.textures {
            debug_assert!(retired.map_or(false, |retired| epoch <= retired));
            if let Some(texture) = self.textures.remove(handle) {
                trace!(name = %texture.name, epoch, "destroying texture");
                self.device.destroy_image(NativeImage {
                    image: texture.image,
                    view: texture.view,
                });
            }
        }
    }

    pub fn get_buffer(&self, handle: BufferHandle) -> Option<&GpuBuffer> {
        self.buffers.get(handle)
    }

    pub fn buffer(&self, handle: BufferHandle) -> &GpuBuffer {
        &self.buffers[handle]
    }

    pub fn texture(&self, handle: TextureHandle) -> &GpuTexture {
        &self.textures[handle]
    }

    pub fn get_texture(&self, handle: TextureHandle) -> Option<&GpuTexture> {
        self.textures.get(handle)
    }

    pub fn acceleration_structure(&self, handle: AccelerationStructureHandle) -> &GpuAccelerationStructure {
        &self.acceleration_structures[handle]
    }

    pub(crate) fn set_texture_layout(&mut self, handle: TextureHandle, layout: vk::ImageLayout) {
        if let Some(texture) = self.textures.get_mut(handle) {
            texture.layout = layout;
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    /// Destroys everything immediately. The device must be idle.
    pub(crate) fn destroy_all(&mut self) {
        for slot in 0..self.zombie_lists.len() {
            self.zombie_lists[slot] = ZombieList::default();
        }
        for structure in self.acceleration_structures.drain() {
            self.device.destroy_acceleration_structure(structure.handle);
        }
        for buffer in self.buffers.drain() {
            self.device.destroy_buffer(buffer.buffer);
        }
        for texture in self.textures.drain() {
            if !texture.swapchain {
                self.device.destroy_image(NativeImage {
                    image: texture.image,
                    view: texture.view,
                });
            }
        }
        self.samplers.destroy(&*self.device);
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle as _;

    use super::*;
    use crate::renderer::device::test_device::{Call, TestDevice};

    fn allocator(device: &Arc<TestDevice>) -> ResourceAllocator {
        ResourceAllocator::new(device.clone(), &BackendConfig::default())
    }

    #[test]
    fn destruction_waits_for_the_slot_to_come_around() {
        let device = TestDevice::new();
        let mut resources = allocator(&device);
        resources.begin_frame(0);

        let buffer = resources.create_buffer("vertices", 64, BufferUsage::Vertex).unwrap();
        let native = resources.buffer(buffer).buffer;
        resources.destroy_buffer(buffer);
        assert!(resources.get_buffer(buffer).is_some());

        resources.begin_frame(1);
        resources.free_resources_for_frame(1);
        assert_eq!(device.count(|call| matches!(call, Call::DestroyBuffer(_))), 0);

        resources.begin_frame(2);
        resources.free_resources_for_frame(0);
        assert!(device.calls().contains(&Call::DestroyBuffer(native)));
        assert!(resources.get_buffer(buffer).is_none());
    }

    #[test]
    fn minimum_size_applies_to_device_buffers_only() {
        let device = TestDevice::new();
        let mut resources = allocator(&device);

        let uniform = resources.create_buffer("constants", 16, BufferUsage::Uniform).unwrap();
        let staging = resources.create_buffer("staging", 16, BufferUsage::Staging).unwrap();
        assert_eq!(resources.buffer(uniform).size, 256);
        assert_eq!(resources.buffer(staging).size, 16);
        assert_ne!(resources.buffer(uniform).address, 0);
        assert_eq!(
            device.object_name(resources.buffer(uniform).buffer.as_raw()).as_deref(),
            Some("constants")
        );
    }

    #[test]
    fn acceleration_structures_take_their_buffer_with_them() {
        let device = TestDevice::new();
        let mut resources = allocator(&device);
        resources.begin_frame(0);

        let blas = resources
            .create_acceleration_structure("blas", vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, 4096)
            .unwrap();
        let native = resources.acceleration_structure(blas).handle;
        let backing = resources.buffer(resources.acceleration_structure(blas).buffer).buffer;
        resources.destroy_acceleration_structure(blas);

        resources.begin_frame(2);
        resources.free_resources_for_frame(0);

        let calls = device.calls();
        let destroy_as = calls
            .iter()
            .position(|call| *call == Call::DestroyAccelerationStructure(native))
            .unwrap();
        let destroy_buffer = calls.iter().position(|call| *call == Call::DestroyBuffer(backing)).unwrap();
        assert!(destroy_as < destroy_buffer);
        assert_eq!(resources.live_buffers(), 0);
    }

    #[test]
    fn depth_render_targets_get_the_depth_aspect() {
        let device = TestDevice::new();
        let mut resources = allocator(&device);
        let extent = vk::Extent2D { width: 64, height: 32 };

        let depth = resources
            .create_texture(
                "depth",
                &TextureDesc::new_2d(vk::Format::D32_SFLOAT, extent, TextureUsage::RenderTarget),
            )
            .unwrap();
        let color = resources
            .create_texture(
                "color",
                &TextureDesc::new_2d(vk::Format::R8G8B8A8_UNORM, extent, TextureUsage::RenderTarget),
            )
            .unwrap();
        assert_eq!(resources.texture(depth).aspect, vk::ImageAspectFlags::DEPTH);
        assert_eq!(resources.texture(color).aspect, vk::ImageAspectFlags::COLOR);
        assert_eq!(resources.texture(color).mip_extent(3), vk::Extent2D { width: 8, height: 4 });
    }

    #[test]
    fn creation_failures_are_returned() {
        let device = TestDevice::new();
        device.fail_next_creation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let mut resources = allocator(&device);

        let error = resources
            .create_buffer("too big", 1 << 40, BufferUsage::Storage)
            .unwrap_err();
        assert!(matches!(
            error,
            BackendError::Creation {
                kind: "buffer",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                ..
            }
        ));
        assert_eq!(resources.live_buffers(), 0);
    }

    #[test]
    #[should_panic(expected = "destroyed twice")]
    #[cfg(debug_assertions)]
    fn double_destroy_is_caught() {
        let device = TestDevice::new();
        let mut resources = allocator(&device);
        let buffer = resources.create_buffer("once", 64, BufferUsage::Storage).unwrap();
        resources.destroy_buffer(buffer);
        resources.destroy_buffer(buffer);
    }
}
