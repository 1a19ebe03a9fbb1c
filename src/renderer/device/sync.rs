use ash::vk;

use super::GpuDevice;
use crate::renderer::error::BackendError;

/// Binary semaphores used for one submission chain. Every semaphore handed out is parked on
/// the frame slot that used it and only comes back once that slot's fence was waited.
#[derive(Default)]
pub(crate) struct SemaphorePool {
    available: Vec<vk::Semaphore>,
    created: usize,
}

impl SemaphorePool {
    pub(crate) fn get(&mut self, device: &dyn GpuDevice) -> Result<vk::Semaphore, BackendError> {
        if let Some(semaphore) = self.available.pop() {
            return Ok(semaphore);
        }
        let semaphore = device
            .create_semaphore()
            .map_err(|result| BackendError::creation("semaphore", "transient semaphore", "binary", result))?;
        self.created += 1;
        device.name_object(semaphore, &format!("Transient semaphore {}", self.created));
        Ok(semaphore)
    }

    pub(crate) fn recycle(&mut self, semaphores: impl IntoIterator<Item = vk::Semaphore>) {
        self.available.extend(semaphores);
    }

    pub(crate) fn destroy(&mut self, device: &dyn GpuDevice) {
        debug_assert_eq!(self.available.len(), self.created, "semaphores still parked on frame slots");
        for semaphore in self.available.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        self.created = 0;
    }

    #[cfg(test)]
    pub(crate) fn created(&self) -> usize {
        self.created
    }
}
