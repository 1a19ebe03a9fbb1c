//! Batches sparse element updates of a GPU buffer. Each flush stages the pending `(index, value)`
//! pairs and lets a compute shader scatter them into the destination, so a handful of changed
//! elements never costs a copy of the whole buffer.

use std::mem::size_of;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use tracing::trace;

use crate::renderer::{
    device::pipeline::ComputePipelineHandle,
    error::BackendError,
    graph::{BufferUsageToken, ComputeDispatch, RenderGraph},
    resources::{BufferHandle, BufferUsage, ResourceAllocator},
};

/// Most elements one flush carries.
pub const SCATTER_BUFFER_SIZE: usize = 1024;

const WORKGROUP_SIZE: u32 = 64;

/// Push constant block of the scatter shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ScatterConstants {
    pub indices: vk::DeviceAddress,
    pub data: vk::DeviceAddress,
    pub destination: vk::DeviceAddress,
    pub count: u32,
    /// Size of one element in 32 bit words.
    pub element_words: u32,
}

pub struct ScatterUploadBuffer<T> {
    indices: Vec<u32>,
    data: Vec<T>,
    positions: HashMap<u32, usize>,
}

impl<T> Default for ScatterUploadBuffer<T> {
    fn default() -> Self {
        ScatterUploadBuffer {
            indices: vec![],
            data: vec![],
            positions: HashMap::new(),
        }
    }
}

impl<T: Pod> ScatterUploadBuffer<T> {
    /// Queues `value` for element `destination_index`. A later value for the same element
    /// replaces the earlier one.
    pub fn add_data(&mut self, destination_index: u32, value: T) -> Result<(), BackendError> {
        debug_assert_eq!(size_of::<T>() % 4, 0, "scatter elements are copied in whole words");

        if let Some(&position) = self.positions.get(&destination_index) {
            self.data[position] = value;
            return Ok(());
        }
        if self.is_full() {
            return Err(BackendError::CapacityExhausted {
                requested: size_of::<T>() as u64,
                alignment: 4,
                free: 0,
                capacity: (SCATTER_BUFFER_SIZE * size_of::<T>()) as u64,
            });
        }
        self.positions.insert(destination_index, self.indices.len());
        self.indices.push(destination_index);
        self.data.push(value);
        Ok(())
    }

    pub fn get_size(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.indices.len() >= SCATTER_BUFFER_SIZE
    }

    /// Adds a pass scattering everything queued so far into `destination` and starts over. The
    /// staging buffers are destroyed once the graph was submitted.
    pub fn flush_to_buffer<'g>(
        &mut self,
        graph: &mut RenderGraph<'g>,
        resources: &mut ResourceAllocator,
        pipeline: ComputePipelineHandle,
        destination: BufferHandle,
    ) -> Result<(), BackendError> {
        if self.is_empty() {
            return Ok(());
        }

        let count = self.get_size();
        let indices = stage(resources, "Scatter indices", bytemuck::cast_slice(&self.indices))?;
        let data = match stage(resources, "Scatter data", bytemuck::cast_slice(&self.data)) {
            Ok(data) => data,
            Err(error) => {
                resources.destroy_buffer(indices);
                return Err(error);
            }
        };

        graph.add_compute_dispatch(ComputeDispatch {
            name: "Flush scatter buffer",
            pipeline,
            descriptor_sets: vec![],
            push_constants: ScatterConstants {
                indices: resources.buffer(indices).address,
                data: resources.buffer(data).address,
                destination: resources.buffer(destination).address,
                count,
                element_words: (size_of::<T>() / 4) as u32,
            },
            workgroups: [(count + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE, 1, 1],
            buffers: vec![
                BufferUsageToken::new(
                    indices,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ,
                ),
                BufferUsageToken::new(
                    data,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_READ,
                ),
                BufferUsageToken::new(
                    destination,
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            ],
            textures: vec![],
        });
        graph.add_finish_task(move |resources: &mut ResourceAllocator| {
            resources.destroy_buffer(indices);
            resources.destroy_buffer(data);
        });
        trace!(count, "flushed scatter buffer");

        self.indices.clear();
        self.data.clear();
        self.positions.clear();
        Ok(())
    }
}

fn stage(resources: &mut ResourceAllocator, name: &str, bytes: &[u8]) -> Result<BufferHandle, BackendError> {
    let buffer = resources.create_buffer(name, bytes.len() as vk::DeviceSize, BufferUsage::Staging)?;
    if let Err(error) = resources.write_buffer(buffer, 0, bytes) {
        resources.destroy_buffer(buffer);
        return Err(error);
    }
    Ok(buffer)
}
