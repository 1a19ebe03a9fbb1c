use std::{marker::PhantomData, mem::size_of};

use ash::vk;
use bytemuck::Pod;
use smallvec::smallvec;

use super::{
    error::BackendError,
    graph::{BufferCopyPass, RenderGraph},
    resources::{BufferHandle, BufferUsage, ResourceAllocator},
};

/// Device-local storage buffer that can be reset to the value it was created with, e.g. atomic
/// counters that start every frame at zero.
pub struct ResettableBuffer<T> {
    pub buffer: BufferHandle,
    initial_value: BufferHandle,
    _marker: PhantomData<T>,
}

impl<T: Pod> ResettableBuffer<T> {
    pub fn new(resources: &mut ResourceAllocator, name: &str, initial: &T) -> Result<Self, BackendError> {
        let size = size_of::<T>() as vk::DeviceSize;
        let buffer = resources.create_buffer(name, size, BufferUsage::Storage)?;
        let initial_value = match resources.create_buffer(&format!("{name} initial value"), size, BufferUsage::Staging) {
            Ok(initial_value) => initial_value,
            Err(error) => {
                resources.destroy_buffer(buffer);
                return Err(error);
            }
        };
        resources.write_buffer(initial_value, 0, bytemuck::bytes_of(initial))?;

        Ok(ResettableBuffer {
            buffer,
            initial_value,
            _marker: PhantomData,
        })
    }

    /// Adds a pass that copies the initial value over the buffer.
    pub fn reset(&self, graph: &mut RenderGraph) {
        graph.add_buffer_copy_pass(BufferCopyPass {
            name: "Reset buffer",
            src: self.initial_value,
            dst: self.buffer,
            regions: smallvec![vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: size_of::<T>() as vk::DeviceSize,
            }],
        });
    }

    pub fn destroy(self, resources: &mut ResourceAllocator) {
        resources.destroy_buffer(self.buffer);
        resources.destroy_buffer(self.initial_value);
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::renderer::{
        config::BackendConfig,
        device::{pipeline::PipelineCache, test_device::TestDevice, GpuDevice, QueueType, SubmitDesc},
        graph::barriers::BarrierTracker,
    };

    #[test]
    fn reset_copies_the_initial_value() {
        let device = TestDevice::new();
        let mut resources = ResourceAllocator::new(device.clone(), &BackendConfig::default());
        let mut pipelines = PipelineCache::new(device.clone());
        let counters = ResettableBuffer::new(&mut resources, "counters", &[7u32, 0, 0, 1]).unwrap();

        let mut graph = RenderGraph::new("reset");
        counters.reset(&mut graph);
        assert_eq!(graph.pass_count(), 1);

        let command_buffer = vk::CommandBuffer::from_raw(0xc0ffee);
        graph.record(
            command_buffer,
            &mut resources,
            &mut pipelines,
            &mut BarrierTracker::default(),
        );
        device
            .submit(
                QueueType::Graphics,
                &SubmitDesc {
                    command_buffers: &[command_buffer],
                    wait: &[],
                    signal: &[],
                },
                vk::Fence::null(),
            )
            .unwrap();

        let contents = device.buffer_contents(resources.buffer(counters.buffer).buffer);
        assert_eq!(&contents[..16], bytemuck::bytes_of(&[7u32, 0, 0, 1]));
        counters.destroy(&mut resources);
        pipelines.destroy();
    }
}
