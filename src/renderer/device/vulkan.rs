use std::{
    ffi::{CStr, CString},
    mem::ManuallyDrop,
    ops::Range,
};

use anyhow::Context;
#[cfg(feature = "vk_names")]
use ash::extensions::ext::DebugUtils;
use ash::{
    extensions::khr::{AccelerationStructure, DynamicRendering, RayTracingPipeline, Surface, Swapchain, Synchronization2},
    prelude::VkResult,
    vk::{self, Handle},
};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
    AllocationError,
};
use hashbrown::HashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{error, info, warn};

use super::{
    descriptors::DescriptorBinding, pipeline::BlendMode, sampler::SamplerDesc, AccelerationStructureDesc,
    AttachmentInfo, BarrierBatch, BlasBuild, BufferDesc, BuildSizes, DescriptorWrite, DeviceProperties, GpuDevice,
    GraphicsPipelineInfo, ImageDesc, NativeAccelerationStructure, NativeBuffer, NativeImage, QueueType,
    RayTracingPipelineInfo, RenderingDesc, ShaderStage, SubmitDesc, SwapchainInfo, TriangleGeometry,
};

/// [`GpuDevice`] on top of Vulkan 1.3 with sync2, dynamic rendering and hardware ray tracing.
///
/// Owns the instance and the surface it was created with and destroys them on drop.
pub struct VulkanDevice {
    instance: ash::Instance,
    device: ash::Device,
    allocator: Mutex<ManuallyDrop<Allocator>>,
    properties: DeviceProperties,
    graphics_queue: Mutex<vk::Queue>,
    /// `None` when the device has no dedicated transfer family.
    transfer_queue: Option<Mutex<vk::Queue>>,
    surface_ext: Surface,
    surface: vk::SurfaceKHR,
    swapchain_ext: Swapchain,
    swapchain: vk::SwapchainKHR,
    swapchain_info: SwapchainInfo,
    synchronization2: Synchronization2,
    dynamic_rendering: DynamicRendering,
    acceleration_structure: AccelerationStructure,
    ray_tracing: RayTracingPipeline,
    #[cfg(feature = "vk_names")]
    debug_utils: DebugUtils,
    buffers: Mutex<HashMap<vk::Buffer, Allocation>>,
    images: Mutex<HashMap<vk::Image, Allocation>>,
}

fn pick_family(
    queue_families: &[vk::QueueFamilyProperties],
    f: impl Fn(u32, vk::QueueFlags) -> bool,
) -> Option<u32> {
    queue_families
        .iter()
        .enumerate()
        .find(|(ix, info)| f(*ix as u32, info.queue_flags))
        .map(|(ix, _)| ix as u32)
}

fn allocation_error(name: &str, error: AllocationError) -> vk::Result {
    error!(name, %error, "memory allocation failed");
    match error {
        AllocationError::OutOfMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        _ => vk::Result::ERROR_UNKNOWN,
    }
}

impl VulkanDevice {
    /// `instance` must target Vulkan 1.3 with the surface extension enabled, plus debug utils when
    /// built with `vk_names`. `window_extent` is used when the surface leaves the extent up to the
    /// swapchain.
    pub fn new(
        entry: &ash::Entry,
        instance: ash::Instance,
        surface: vk::SurfaceKHR,
        window_extent: vk::Extent2D,
    ) -> anyhow::Result<VulkanDevice> {
        let surface_ext = Surface::new(entry, &instance);

        let physical_device = unsafe { instance.enumerate_physical_devices() }
            .context("enumerating physical devices")?
            .into_iter()
            .next()
            .context("no Vulkan physical device available")?;
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let mut acceleration_structure_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::builder().push_next(&mut acceleration_structure_properties);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        let device_name = unsafe { CStr::from_ptr(properties2.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let graphics_queue_family = pick_family(&queue_families, |ix, flags| {
            flags.contains(vk::QueueFlags::GRAPHICS)
                && unsafe { surface_ext.get_physical_device_surface_support(physical_device, ix, surface) }
                    .unwrap_or(false)
        })
        .context("could not find a graphics queue that can present")?;
        let transfer_queue_family = pick_family(&queue_families, |_ix, flags| {
            flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.contains(vk::QueueFlags::GRAPHICS)
                && !flags.contains(vk::QueueFlags::COMPUTE)
        });

        let device = {
            let extension_names = [
                Swapchain::name().as_ptr(),
                Synchronization2::name().as_ptr(),
                DynamicRendering::name().as_ptr(),
                AccelerationStructure::name().as_ptr(),
                RayTracingPipeline::name().as_ptr(),
                vk::KhrDeferredHostOperationsFn::name().as_ptr(),
                vk::KhrFragmentShadingRateFn::name().as_ptr(),
            ];
            let features = vk::PhysicalDeviceFeatures {
                sampler_anisotropy: 1,
                multi_draw_indirect: 1,
                fill_mode_non_solid: 1,
                draw_indirect_first_instance: 1,
                shader_int64: 1,
                ..Default::default()
            };
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().features(features);
            let mut features11 = vk::PhysicalDeviceVulkan11Features::builder().multiview(true);
            let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
                .buffer_device_address(true)
                .descriptor_indexing(true)
                .runtime_descriptor_array(true)
                .descriptor_binding_partially_bound(true)
                .descriptor_binding_update_unused_while_pending(true)
                .scalar_block_layout(true)
                .separate_depth_stencil_layouts(true);
            let mut features_synchronization =
                vk::PhysicalDeviceSynchronization2FeaturesKHR::builder().synchronization2(true);
            let mut features_dynamic_rendering =
                vk::PhysicalDeviceDynamicRenderingFeaturesKHR::builder().dynamic_rendering(true);
            let mut features_acceleration_structure =
                vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
            let mut features_ray_tracing =
                vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);
            let mut features_shading_rate = vk::PhysicalDeviceFragmentShadingRateFeaturesKHR::builder()
                .pipeline_fragment_shading_rate(true)
                .attachment_fragment_shading_rate(true);

            let priorities = [1.0];
            let queue_infos = std::iter::once(graphics_queue_family)
                .chain(transfer_queue_family)
                .map(|family| {
                    vk::DeviceQueueCreateInfo::builder()
                        .queue_family_index(family)
                        .queue_priorities(&priorities)
                        .build()
                })
                .collect_vec();

            let device_create_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&extension_names)
                .push_next(&mut features2)
                .push_next(&mut features11)
                .push_next(&mut features12)
                .push_next(&mut features_synchronization)
                .push_next(&mut features_dynamic_rendering)
                .push_next(&mut features_acceleration_structure)
                .push_next(&mut features_ray_tracing)
                .push_next(&mut features_shading_rate);

            unsafe { instance.create_device(physical_device, &device_create_info, None) }
                .with_context(|| format!("creating logical device on {device_name}"))?
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
        })
        .context("creating the memory allocator")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let transfer_queue = transfer_queue_family.map(|family| unsafe { device.get_device_queue(family, 0) });

        let swapchain_ext = Swapchain::new(&instance, &device);
        let (swapchain, format, extent) = unsafe {
            let capabilities = surface_ext
                .get_physical_device_surface_capabilities(physical_device, surface)
                .context("querying surface capabilities")?;
            let formats = surface_ext
                .get_physical_device_surface_formats(physical_device, surface)
                .context("querying surface formats")?;
            let surface_format = formats
                .iter()
                .find(|format| format.format == vk::Format::B8G8R8A8_SRGB)
                .or_else(|| formats.first())
                .copied()
                .context("surface reports no formats")?;
            let extent = if capabilities.current_extent.width == u32::MAX {
                window_extent
            } else {
                capabilities.current_extent
            };
            let mut image_count = capabilities.min_image_count + 1;
            if capabilities.max_image_count > 0 {
                image_count = image_count.min(capabilities.max_image_count);
            }

            let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
                .surface(surface)
                .min_image_count(image_count)
                .image_color_space(surface_format.color_space)
                .image_format(surface_format.format)
                .image_extent(extent)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(vk::PresentModeKHR::FIFO)
                .clipped(true)
                .image_array_layers(1);
            let swapchain = swapchain_ext
                .create_swapchain(&swapchain_create_info, None)
                .context("creating the swapchain")?;
            (swapchain, surface_format.format, extent)
        };

        let images = unsafe { swapchain_ext.get_swapchain_images(swapchain) }.context("listing swapchain images")?;
        let images = images
            .into_iter()
            .map(|image| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                let view = unsafe { device.create_image_view(&view_info, None) }
                    .context("creating swapchain image view")?;
                Ok(NativeImage { image, view })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        info!(
            device = %device_name,
            graphics_queue_family,
            ?transfer_queue_family,
            width = extent.width,
            height = extent.height,
            ?format,
            images = images.len(),
            "created Vulkan device"
        );

        let vulkan = VulkanDevice {
            properties: DeviceProperties {
                graphics_queue_family,
                transfer_queue_family: transfer_queue_family.unwrap_or(graphics_queue_family),
                min_acceleration_structure_scratch_offset_alignment: acceleration_structure_properties
                    .min_acceleration_structure_scratch_offset_alignment
                    .into(),
            },
            graphics_queue: Mutex::new(graphics_queue),
            transfer_queue: transfer_queue.map(Mutex::new),
            surface_ext,
            surface,
            swapchain_ext,
            swapchain,
            swapchain_info: SwapchainInfo { images, format, extent },
            synchronization2: Synchronization2::new(&instance, &device),
            dynamic_rendering: DynamicRendering::new(&instance, &device),
            acceleration_structure: AccelerationStructure::new(&instance, &device),
            ray_tracing: RayTracingPipeline::new(&instance, &device),
            #[cfg(feature = "vk_names")]
            debug_utils: DebugUtils::new(entry, &instance),
            allocator: Mutex::new(ManuallyDrop::new(allocator)),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            instance,
            device,
        };

        let dyn_device: &dyn GpuDevice = &vulkan;
        dyn_device.name_object(graphics_queue, "Graphics queue");
        if let Some(transfer_queue) = transfer_queue {
            dyn_device.name_object(transfer_queue, "Transfer queue");
        }
        for (ix, image) in vulkan.swapchain_info.images.iter().enumerate() {
            dyn_device.name_object(image.image, &format!("Swapchain image {ix}"));
            dyn_device.name_object(image.view, &format!("Swapchain image view {ix}"));
        }

        Ok(vulkan)
    }

    fn queue(&self, queue: QueueType) -> &Mutex<vk::Queue> {
        match (queue, &self.transfer_queue) {
            (QueueType::Transfer, Some(transfer)) => transfer,
            _ => &self.graphics_queue,
        }
    }

    fn shader_module(&self, spirv: &[u32]) -> VkResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(spirv);
        unsafe { self.device.create_shader_module(&create_info, None) }
    }

    fn triangles(geometry: &TriangleGeometry) -> vk::AccelerationStructureGeometryKHR {
        vk::AccelerationStructureGeometryKHR::builder()
            .flags(if geometry.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            })
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(geometry.vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: geometry.vertex_address,
                    })
                    .vertex_stride(geometry.vertex_stride)
                    .max_vertex(geometry.max_vertex)
                    .index_type(geometry.index_type)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: geometry.index_address,
                    })
                    .build(),
            })
            .build()
    }
}

fn blend_attachment(blend: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let builder = vk::PipelineColorBlendAttachmentState::builder().color_write_mask(vk::ColorComponentFlags::RGBA);
    match blend {
        BlendMode::Opaque => builder.blend_enable(false),
        BlendMode::AlphaBlend => builder
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => builder
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
    .build()
}

fn attachment(info: &AttachmentInfo) -> vk::RenderingAttachmentInfo {
    vk::RenderingAttachmentInfo::builder()
        .image_view(info.view)
        .image_layout(info.layout)
        .load_op(info.load_op)
        .store_op(info.store_op)
        .clear_value(info.clear_value)
        .build()
}

fn entry_points(stages: &[ShaderStage]) -> VkResult<SmallVec<[CString; 4]>> {
    stages
        .iter()
        .map(|stage| CString::new(stage.entry_point).map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED))
        .collect()
}

impl GpuDevice for VulkanDevice {
    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn swapchain(&self) -> SwapchainInfo {
        self.swapchain_info.clone()
    }

    #[cfg(feature = "vk_names")]
    fn set_object_name(&self, ty: vk::ObjectType, handle: u64, name: &str) -> VkResult<()> {
        let name = CString::new(name).map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(ty)
            .object_handle(handle)
            .object_name(&name);
        unsafe {
            self.debug_utils
                .set_debug_utils_object_name(self.device.handle(), &name_info)
        }
    }

    #[cfg(not(feature = "vk_names"))]
    fn set_object_name(&self, _ty: vk::ObjectType, _handle: u64, _name: &str) -> VkResult<()> {
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<NativeBuffer> {
        // Buffers are shared by both queues without ownership transfers.
        let families = [
            self.properties.graphics_queue_family,
            self.properties.transfer_queue_family,
        ];
        let mut create_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        if families[0] != families[1] {
            create_info = create_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families);
        }
        let buffer = unsafe { self.device.create_buffer(&create_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(error) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(allocation_error(desc.name, error));
            }
        };
        if let Err(result) = unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            if let Err(error) = self.allocator.lock().free(allocation) {
                warn!(%error, "failed to free buffer memory");
            }
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(result);
        }
        let address = unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::builder().buffer(buffer))
        };
        self.buffers.lock().insert(buffer, allocation);

        Ok(NativeBuffer { buffer, address })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let allocation = self.buffers.lock().remove(&buffer);
        debug_assert!(allocation.is_some(), "destroying an unknown buffer");
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = allocation {
            if let Err(error) = self.allocator.lock().free(allocation) {
                warn!(%error, "failed to free buffer memory");
            }
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        let mut buffers = self.buffers.lock();
        let mapped = buffers
            .get_mut(&buffer)
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let range = offset as usize..offset as usize + data.len();
        match mapped.get_mut(range) {
            Some(destination) => {
                destination.copy_from_slice(data);
                Ok(())
            }
            None => {
                error!(offset, len = data.len(), capacity = mapped.len(), "write past the end of a buffer");
                Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
            }
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<NativeImage> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(error) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(allocation_error(desc.name, error));
            }
        };
        let release = |allocation: Allocation| {
            if let Err(error) = self.allocator.lock().free(allocation) {
                warn!(%error, "failed to free image memory");
            }
            unsafe { self.device.destroy_image(image, None) };
        };
        if let Err(result) = unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            release(allocation);
            return Err(result);
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(if desc.array_layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: desc.array_layers,
            });
        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(result) => {
                release(allocation);
                return Err(result);
            }
        };
        self.images.lock().insert(image, allocation);

        Ok(NativeImage { image, view })
    }

    fn destroy_image(&self, image: NativeImage) {
        let allocation = self.images.lock().remove(&image.image);
        debug_assert!(allocation.is_some(), "destroying an unknown image");
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        if let Some(allocation) = allocation {
            if let Err(error) = self.allocator.lock().free(allocation) {
                warn!(%error, "failed to free image memory");
            }
        }
    }

    fn create_acceleration_structure(&self, desc: &AccelerationStructureDesc) -> VkResult<NativeAccelerationStructure> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(desc.buffer)
            .size(desc.size)
            .ty(desc.ty);
        let handle = unsafe {
            self.acceleration_structure
                .create_acceleration_structure(&create_info, None)?
        };
        let address = unsafe {
            self.acceleration_structure.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle),
            )
        };

        Ok(NativeAccelerationStructure { handle, address })
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        unsafe {
            self.acceleration_structure
                .destroy_acceleration_structure(handle, None)
        }
    }

    fn blas_build_sizes(&self, geometry: &TriangleGeometry) -> BuildSizes {
        let geometries = [Self::triangles(geometry)];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .geometries(&geometries);
        let sizes = unsafe {
            self.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[geometry.primitive_count],
            )
        };

        BuildSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode_u)
            .address_mode_v(desc.address_mode_v)
            .address_mode_w(desc.address_mode_w)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::NEVER))
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(desc.border_color)
            .unnormalized_coordinates(desc.unnormalized_coordinates);
        unsafe { self.device.create_sampler(&create_info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let bindings = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.ty)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
                    .build()
            })
            .collect::<SmallVec<[_; 8]>>();
        // Arrays are bindless tables, filled slot by slot while other frames still use them.
        let binding_flags = bindings
            .iter()
            .map(|binding| {
                if binding.descriptor_count > 1 {
                    vk::DescriptorBindingFlags::PARTIALLY_BOUND
                        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
                } else {
                    vk::DescriptorBindingFlags::empty()
                }
            })
            .collect::<SmallVec<[_; 8]>>();
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .push_next(&mut flags_info);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(&self, max_sets: u32, sizes: &[vk::DescriptorPoolSize]) -> VkResult<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&create_info, None) }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let mut sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info)? };
        sets.pop().ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let buffer_infos = writes
            .iter()
            .filter_map(|write| match *write {
                DescriptorWrite::Buffer {
                    buffer, offset, range, ..
                } => Some(vk::DescriptorBufferInfo { buffer, offset, range }),
                _ => None,
            })
            .collect::<SmallVec<[_; 8]>>();
        let image_infos = writes
            .iter()
            .filter_map(|write| match *write {
                DescriptorWrite::Image {
                    view, layout, sampler, ..
                } => Some(vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }),
                _ => None,
            })
            .collect::<SmallVec<[_; 8]>>();
        let structures = writes
            .iter()
            .filter_map(|write| match *write {
                DescriptorWrite::AccelerationStructure { handle, .. } => Some(handle),
                _ => None,
            })
            .collect::<SmallVec<[_; 2]>>();
        let mut structure_writes = structures
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                    .acceleration_structures(std::slice::from_ref(handle))
                    .build()
            })
            .collect::<SmallVec<[_; 2]>>();

        let (mut buffer_ix, mut image_ix, mut structure_ix) = (0, 0, 0);
        let mut native = SmallVec::<[vk::WriteDescriptorSet; 8]>::new();
        for write in writes {
            match *write {
                DescriptorWrite::Buffer { binding, ty, .. } => {
                    native.push(
                        vk::WriteDescriptorSet::builder()
                            .dst_set(set)
                            .dst_binding(binding)
                            .descriptor_type(ty)
                            .buffer_info(std::slice::from_ref(&buffer_infos[buffer_ix]))
                            .build(),
                    );
                    buffer_ix += 1;
                }
                DescriptorWrite::Image {
                    binding,
                    array_element,
                    ty,
                    ..
                } => {
                    native.push(
                        vk::WriteDescriptorSet::builder()
                            .dst_set(set)
                            .dst_binding(binding)
                            .dst_array_element(array_element)
                            .descriptor_type(ty)
                            .image_info(std::slice::from_ref(&image_infos[image_ix]))
                            .build(),
                    );
                    image_ix += 1;
                }
                DescriptorWrite::AccelerationStructure { binding, .. } => {
                    let mut native_write = vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                        .push_next(&mut structure_writes[structure_ix])
                        .build();
                    native_write.descriptor_count = 1;
                    native.push(native_write);
                    structure_ix += 1;
                }
            }
        }

        unsafe { self.device.update_descriptor_sets(&native, &[]) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);
        unsafe { self.device.create_pipeline_layout(&create_info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(&self, info: &GraphicsPipelineInfo) -> VkResult<vk::Pipeline> {
        let mut modules = scopeguard::guard(SmallVec::<[vk::ShaderModule; 4]>::new(), |modules| {
            for module in modules {
                unsafe { self.device.destroy_shader_module(module, None) };
            }
        });
        for stage in info.stages {
            modules.push(self.shader_module(stage.spirv)?);
        }
        let names = entry_points(info.stages)?;
        let stages = info
            .stages
            .iter()
            .zip(modules.iter())
            .zip(names.iter())
            .map(|((stage, &module), name)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(module)
                    .name(name)
                    .build()
            })
            .collect::<SmallVec<[_; 4]>>();

        let state = info.state;
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder().topology(state.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(state.polygon_mode)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face)
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(state.depth_test.is_some())
            .depth_write_enable(state.depth_write)
            .depth_compare_op(state.depth_test.unwrap_or(vk::CompareOp::ALWAYS));
        let blend_attachments = info
            .formats
            .color
            .iter()
            .map(|_| blend_attachment(state.blend))
            .collect::<SmallVec<[_; 8]>>();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);
        let mut rendering = vk::PipelineRenderingCreateInfo::builder()
            .view_mask(info.formats.view_mask)
            .color_attachment_formats(&info.formats.color)
            .depth_attachment_format(info.formats.depth.unwrap_or(vk::Format::UNDEFINED));
        let mut shading_rate = vk::PipelineFragmentShadingRateStateCreateInfoKHR::builder()
            .fragment_size(vk::Extent2D { width: 1, height: 1 })
            .combiner_ops([
                vk::FragmentShadingRateCombinerOpKHR::KEEP,
                vk::FragmentShadingRateCombinerOpKHR::REPLACE,
            ]);

        let mut create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(info.layout)
            .push_next(&mut rendering);
        if info.formats.shading_rate {
            create_info = create_info.push_next(&mut shading_rate);
        }

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
        }
        .map_err(|(_, result)| result)?;
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_compute_pipeline(
        &self,
        _name: &str,
        layout: vk::PipelineLayout,
        stage: &ShaderStage,
    ) -> VkResult<vk::Pipeline> {
        let module = scopeguard::guard(self.shader_module(stage.spirv)?, |module| unsafe {
            self.device.destroy_shader_module(module, None)
        });
        let name = CString::new(stage.entry_point).map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let stage_info = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(*module)
            .name(&name);
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage_info.build())
            .layout(layout);

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
        }
        .map_err(|(_, result)| result)?;
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_ray_tracing_pipeline(&self, info: &RayTracingPipelineInfo) -> VkResult<vk::Pipeline> {
        let all_stages = std::iter::once(info.raygen)
            .chain(info.miss.iter().copied())
            .chain(info.closest_hit.iter().copied())
            .collect::<SmallVec<[ShaderStage; 8]>>();
        let mut modules = scopeguard::guard(SmallVec::<[vk::ShaderModule; 8]>::new(), |modules| {
            for module in modules {
                unsafe { self.device.destroy_shader_module(module, None) };
            }
        });
        for stage in &all_stages {
            modules.push(self.shader_module(stage.spirv)?);
        }
        let names = entry_points(&all_stages)?;
        let stages = all_stages
            .iter()
            .zip(modules.iter())
            .zip(names.iter())
            .map(|((stage, &module), name)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(module)
                    .name(name)
                    .build()
            })
            .collect::<SmallVec<[_; 8]>>();

        let general = |ix: usize| {
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(ix as u32)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build()
        };
        let hit_base = 1 + info.miss.len();
        let groups = std::iter::once(general(0))
            .chain((1..hit_base).map(general))
            .chain((hit_base..all_stages.len()).map(|ix| {
                vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(ix as u32)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
                    .build()
            }))
            .collect::<SmallVec<[_; 8]>>();

        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(info.max_recursion_depth)
            .layout(info.layout);
        let pipelines = unsafe {
            self.ray_tracing.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info.build()],
                None,
            )?
        };
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::builder().flags(flags), None)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(&self, queue: QueueType) -> VkResult<vk::CommandPool> {
        let family = match queue {
            QueueType::Graphics => self.properties.graphics_queue_family,
            QueueType::Transfer => self.properties.transfer_queue_family,
        };
        let create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family);
        unsafe { self.device.create_command_pool(&create_info, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let mut command_buffers = unsafe { self.device.allocate_command_buffers(&allocate_info)? };
        command_buffers.pop().ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn submit(&self, queue: QueueType, submit: &SubmitDesc, fence: vk::Fence) -> VkResult<()> {
        let command_buffers = submit
            .command_buffers
            .iter()
            .map(|&command_buffer| {
                vk::CommandBufferSubmitInfo::builder()
                    .command_buffer(command_buffer)
                    .build()
            })
            .collect::<SmallVec<[_; 8]>>();
        let waits = submit
            .wait
            .iter()
            .map(|wait| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(wait.semaphore)
                    .stage_mask(wait.stage)
                    .build()
            })
            .collect::<SmallVec<[_; 4]>>();
        let signals = submit
            .signal
            .iter()
            .map(|&semaphore| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build()
            })
            .collect::<SmallVec<[_; 4]>>();
        let submit_info = vk::SubmitInfo2::builder()
            .command_buffer_infos(&command_buffers)
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);

        let queue = self.queue(queue).lock();
        unsafe {
            self.synchronization2
                .queue_submit2(*queue, &[submit_info.build()], fence)
        }
    }

    fn acquire_next_image(&self, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_ext
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        }
    }

    fn present(&self, image_index: u32, wait: &[vk::Semaphore]) -> VkResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let queue = self.graphics_queue.lock();
        unsafe { self.swapchain_ext.queue_present(*queue, &present_info) }
    }

    fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barriers: &BarrierBatch) {
        let buffers = barriers
            .buffers
            .iter()
            .map(|barrier| {
                vk::BufferMemoryBarrier2::builder()
                    .src_stage_mask(barrier.src_stage)
                    .src_access_mask(barrier.src_access)
                    .dst_stage_mask(barrier.dst_stage)
                    .dst_access_mask(barrier.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(barrier.buffer)
                    .offset(barrier.offset)
                    .size(barrier.size)
                    .build()
            })
            .collect::<SmallVec<[_; 8]>>();
        let images = barriers
            .images
            .iter()
            .map(|barrier| {
                vk::ImageMemoryBarrier2::builder()
                    .src_stage_mask(barrier.src_stage)
                    .src_access_mask(barrier.src_access)
                    .dst_stage_mask(barrier.dst_stage)
                    .dst_access_mask(barrier.dst_access)
                    .old_layout(barrier.old_layout)
                    .new_layout(barrier.new_layout)
                    .src_queue_family_index(
                        barrier
                            .ownership
                            .map_or(vk::QUEUE_FAMILY_IGNORED, |ownership| ownership.src_family),
                    )
                    .dst_queue_family_index(
                        barrier
                            .ownership
                            .map_or(vk::QUEUE_FAMILY_IGNORED, |ownership| ownership.dst_family),
                    )
                    .image(barrier.image)
                    .subresource_range(barrier.range)
                    .build()
            })
            .collect::<SmallVec<[_; 8]>>();
        let dependency_info = vk::DependencyInfo::builder()
            .buffer_memory_barriers(&buffers)
            .image_memory_barriers(&images);
        unsafe {
            self.synchronization2
                .cmd_pipeline_barrier2(command_buffer, &dependency_info)
        }
    }

    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    fn cmd_copy_image(&self, command_buffer: vk::CommandBuffer, src: vk::Image, dst: vk::Image, regions: &[vk::ImageCopy]) {
        unsafe {
            self.device.cmd_copy_image(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    fn cmd_build_acceleration_structures(&self, command_buffer: vk::CommandBuffer, builds: &[BlasBuild]) {
        let geometries = builds
            .iter()
            .map(|build| Self::triangles(&build.geometry))
            .collect_vec();
        let infos = builds
            .iter()
            .zip(geometries.iter())
            .map(|(build, geometry)| {
                vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                    .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(build.destination)
                    .geometries(std::slice::from_ref(geometry))
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: build.scratch_address,
                    })
                    .build()
            })
            .collect_vec();
        let ranges = builds
            .iter()
            .map(|build| {
                [vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(build.geometry.primitive_count)
                    .build()]
            })
            .collect_vec();
        let ranges = ranges.iter().map(|range| range.as_slice()).collect_vec();

        unsafe {
            self.acceleration_structure
                .cmd_build_acceleration_structures(command_buffer, &infos, &ranges)
        }
    }

    fn cmd_begin_rendering(&self, command_buffer: vk::CommandBuffer, rendering: &RenderingDesc) {
        let color = rendering.color.iter().map(attachment).collect::<SmallVec<[_; 8]>>();
        let depth = rendering.depth.as_ref().map(attachment);
        let mut shading_rate = rendering.shading_rate.map(|(view, texel_size)| {
            vk::RenderingFragmentShadingRateAttachmentInfoKHR::builder()
                .image_view(view)
                .image_layout(vk::ImageLayout::FRAGMENT_SHADING_RATE_ATTACHMENT_OPTIMAL_KHR)
                .shading_rate_attachment_texel_size(texel_size)
                .build()
        });

        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(rendering.area)
            .layer_count(rendering.layer_count)
            .view_mask(rendering.view_mask)
            .color_attachments(&color);
        if let Some(depth) = depth.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        if let Some(shading_rate) = shading_rate.as_mut() {
            rendering_info = rendering_info.push_next(shading_rate);
        }

        unsafe {
            self.dynamic_rendering
                .cmd_begin_rendering(command_buffer, &rendering_info)
        }
    }

    fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.dynamic_rendering.cmd_end_rendering(command_buffer) }
    }

    fn cmd_set_viewport_and_scissor(&self, command_buffer: vk::CommandBuffer, area: vk::Rect2D) {
        let viewport = vk::Viewport {
            x: area.offset.x as f32,
            y: area.offset.y as f32,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(command_buffer, 0, &[area]);
        }
    }

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(command_buffer, bind_point, pipeline) }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(command_buffer, bind_point, layout, first_set, sets, &[])
        }
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(command_buffer, layout, stages, offset, data)
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        }
    }

    fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertices: Range<u32>, instances: Range<u32>) {
        unsafe {
            self.device.cmd_draw(
                command_buffer,
                vertices.end - vertices.start,
                instances.end - instances.start,
                vertices.start,
                instances.start,
            )
        }
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        indices: Range<u32>,
        vertex_offset: i32,
        instances: Range<u32>,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                command_buffer,
                indices.end - indices.start,
                instances.end - instances.start,
                indices.start,
                vertex_offset,
                instances.start,
            )
        }
    }

    fn cmd_draw_indexed_indirect(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed_indirect(command_buffer, buffer, offset, draw_count, stride)
        }
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, [x, y, z]: [u32; 3]) {
        unsafe { self.device.cmd_dispatch(command_buffer, x, y, z) }
    }

    fn cmd_dispatch_indirect(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe { self.device.cmd_dispatch_indirect(command_buffer, buffer, offset) }
    }

    #[cfg(feature = "vk_names")]
    fn cmd_begin_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        let name = match CString::new(name) {
            Ok(name) => name,
            Err(_) => return,
        };
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name).color(color);
        unsafe {
            self.debug_utils
                .cmd_begin_debug_utils_label(command_buffer, &label)
        }
    }

    #[cfg(not(feature = "vk_names"))]
    fn cmd_begin_label(&self, _command_buffer: vk::CommandBuffer, _name: &str, _color: [f32; 4]) {}

    #[cfg(feature = "vk_names")]
    fn cmd_end_label(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.debug_utils.cmd_end_debug_utils_label(command_buffer) }
    }

    #[cfg(not(feature = "vk_names"))]
    fn cmd_end_label(&self, _command_buffer: vk::CommandBuffer) {}
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(result) = self.device.device_wait_idle() {
                error!(%result, "device wait idle failed during teardown");
            }

            let allocator = self.allocator.get_mut();
            for (buffer, allocation) in self.buffers.get_mut().drain() {
                warn!(buffer = buffer.as_raw(), "buffer leaked until device teardown");
                self.device.destroy_buffer(buffer, None);
                let _ = allocator.free(allocation);
            }
            for (image, allocation) in self.images.get_mut().drain() {
                warn!(image = image.as_raw(), "image leaked until device teardown");
                self.device.destroy_image(image, None);
                let _ = allocator.free(allocation);
            }
            ManuallyDrop::drop(allocator);

            for image in &self.swapchain_info.images {
                self.device.destroy_image_view(image.view, None);
            }
            self.swapchain_ext.destroy_swapchain(self.swapchain, None);
            self.device.destroy_device(None);
            self.surface_ext.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
