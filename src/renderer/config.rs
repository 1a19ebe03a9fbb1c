use std::{env, str::FromStr};

use ash::vk;
use static_assertions::const_assert;
use tracing::warn;

use super::device::MAX_FRAMES_IN_FLIGHT;

pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
pub const DEFAULT_BLAS_BATCH_SIZE: usize = 8;
pub const DEFAULT_MAX_BLAS_SCRATCH_SIZE: vk::DeviceSize = 256 * 1024 * 1024;

const_assert!(DEFAULT_FRAMES_IN_FLIGHT <= MAX_FRAMES_IN_FLIGHT);

#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Number of frame slots the CPU may record ahead of GPU completion.
    pub frames_in_flight: usize,
    /// Upper bound for the per-slot fence wait, in nanoseconds. Expiry is fatal.
    pub fence_timeout_ns: u64,
    pub blas_batch_size: usize,
    /// Upper bound for the scratch buffer shared by one batch of BLAS builds. A single build
    /// that needs more than this still runs, alone in its batch.
    pub max_blas_scratch_size: vk::DeviceSize,
    pub descriptor_sets_per_pool: u32,
    pub min_buffer_size: vk::DeviceSize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout_ns: u64::MAX,
            blas_batch_size: DEFAULT_BLAS_BATCH_SIZE,
            max_blas_scratch_size: DEFAULT_MAX_BLAS_SCRATCH_SIZE,
            descriptor_sets_per_pool: 1000,
            min_buffer_size: 256,
        }
    }
}

impl BackendConfig {
    /// Defaults with overrides from `RENDERER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    pub(crate) fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut config = BackendConfig::default();
        for (key, value) in vars {
            match key.as_str() {
                "RENDERER_FRAMES_IN_FLIGHT" => {
                    if let Some(frames) = parse_var::<usize>(&key, &value) {
                        config.frames_in_flight = frames.clamp(1, MAX_FRAMES_IN_FLIGHT);
                    }
                }
                "RENDERER_FENCE_TIMEOUT_NS" => {
                    if let Some(timeout) = parse_var(&key, &value) {
                        config.fence_timeout_ns = timeout;
                    }
                }
                "RENDERER_BLAS_BATCH_SIZE" => {
                    if let Some(batch) = parse_var::<usize>(&key, &value) {
                        config.blas_batch_size = batch.max(1);
                    }
                }
                "RENDERER_MAX_BLAS_SCRATCH_SIZE" => {
                    if let Some(size) = parse_var(&key, &value) {
                        config.max_blas_scratch_size = size;
                    }
                }
                _ => {}
            }
        }
        config
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value, "ignoring unparseable renderer setting");
            None
        }
    }
}
