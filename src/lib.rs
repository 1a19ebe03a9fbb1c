pub mod renderer;

pub use renderer::{
    config::BackendConfig,
    device::{vulkan::VulkanDevice, GpuDevice},
    error::BackendError,
    graph::RenderGraph,
    resources::{BufferHandle, ResourceAllocator, TextureHandle},
    DescriptorLifetime, RenderBackend,
};
