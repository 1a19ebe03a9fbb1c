use ash::vk;
#[cfg(debug_assertions)]
use hashbrown::HashSet;
use profiling::scope;
use tracing::trace;

use super::{GpuDevice, QueueType};
use crate::renderer::error::{fatal, BackendError};

/// Command pool of one queue in one frame slot. Command buffers handed back after submission
/// are only recycled once the pool is reset, which happens after the slot's fence was waited.
pub(crate) struct CommandAllocator {
    handle: vk::CommandPool,
    queue: QueueType,
    available: Vec<vk::CommandBuffer>,
    submitted: Vec<vk::CommandBuffer>,
    #[cfg(debug_assertions)]
    allocated_command_buffers: HashSet<vk::CommandBuffer>,
}

impl CommandAllocator {
    pub(crate) fn new(device: &dyn GpuDevice, queue: QueueType, name: &str) -> Result<CommandAllocator, BackendError> {
        let handle = device
            .create_command_pool(queue)
            .map_err(|result| BackendError::creation("command pool", name, format!("{queue:?}"), result))?;
        device.name_object(handle, name);

        Ok(CommandAllocator {
            handle,
            queue,
            available: vec![],
            submitted: vec![],
            #[cfg(debug_assertions)]
            allocated_command_buffers: HashSet::new(),
        })
    }

    /// Hands out a command buffer in the recording state.
    pub(crate) fn begin(&mut self, device: &dyn GpuDevice, name: &str) -> Result<vk::CommandBuffer, BackendError> {
        scope!("vk", "begin_command_buffer");

        let command_buffer = match self.available.pop() {
            Some(command_buffer) => command_buffer,
            None => {
                let command_buffer = device
                    .allocate_command_buffer(self.handle)
                    .map_err(|result| BackendError::creation("command buffer", name, format!("{:?}", self.queue), result))?;
                #[cfg(debug_assertions)]
                self.allocated_command_buffers.insert(command_buffer);
                command_buffer
            }
        };
        device.name_object(command_buffer, name);
        device
            .begin_command_buffer(command_buffer)
            .map_err(|result| BackendError::creation("command buffer", name, "begin", result))?;

        Ok(command_buffer)
    }

    /// Must only be called once the command buffer was submitted.
    pub(crate) fn return_command_buffer(&mut self, command_buffer: vk::CommandBuffer) {
        #[cfg(debug_assertions)]
        debug_assert!(
            self.allocated_command_buffers.contains(&command_buffer),
            "command buffer returned to a pool that did not allocate it"
        );
        self.submitted.push(command_buffer);
    }

    pub(crate) fn reset(&mut self, device: &dyn GpuDevice) {
        scope!("vk", "vkResetCommandPool");

        if let Err(result) = device.reset_command_pool(self.handle) {
            fatal("command pool reset", result);
        }
        trace!(queue = ?self.queue, recycled = self.submitted.len(), "reset command pool");
        self.available.append(&mut self.submitted);
    }

    pub(crate) fn destroy(mut self, device: &dyn GpuDevice) {
        device.destroy_command_pool(self.handle);
        self.handle = vk::CommandPool::null();
    }

    #[cfg(test)]
    pub(crate) fn handle(&self) -> vk::CommandPool {
        self.handle
    }
}

#[cfg(debug_assertions)]
impl Drop for CommandAllocator {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        debug_assert_eq!(
            self.handle,
            vk::CommandPool::null(),
            "CommandAllocator not destroyed before Drop"
        );
    }
}
