use std::hash::{Hash, Hasher};

use ash::vk;
use hashbrown::HashMap;
use tracing::debug;

use super::GpuDevice;
use crate::renderer::error::BackendError;

/// Filtering, addressing and comparison state of a sampler. Two descriptions that compare equal
/// share one native sampler.
#[derive(Clone, Copy, Debug)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        SamplerDesc {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            unnormalized_coordinates: false,
        }
    }
}

impl SamplerDesc {
    fn bit_pattern(&self) -> [u32; 4] {
        [
            self.mip_lod_bias.to_bits(),
            self.max_anisotropy.map_or(u32::MAX, f32::to_bits),
            self.min_lod.to_bits(),
            self.max_lod.to_bits(),
        ]
    }
}

// Floats are compared by bit pattern so the description can key a map.
impl PartialEq for SamplerDesc {
    fn eq(&self, other: &Self) -> bool {
        self.mag_filter == other.mag_filter
            && self.min_filter == other.min_filter
            && self.mipmap_mode == other.mipmap_mode
            && self.address_mode_u == other.address_mode_u
            && self.address_mode_v == other.address_mode_v
            && self.address_mode_w == other.address_mode_w
            && self.compare_op == other.compare_op
            && self.border_color == other.border_color
            && self.unnormalized_coordinates == other.unnormalized_coordinates
            && self.bit_pattern() == other.bit_pattern()
    }
}

impl Eq for SamplerDesc {}

impl Hash for SamplerDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mag_filter.hash(state);
        self.min_filter.hash(state);
        self.mipmap_mode.hash(state);
        self.address_mode_u.hash(state);
        self.address_mode_v.hash(state);
        self.address_mode_w.hash(state);
        self.compare_op.hash(state);
        self.border_color.hash(state);
        self.unnormalized_coordinates.hash(state);
        self.bit_pattern().hash(state);
    }
}

#[derive(Default)]
pub(crate) struct SamplerCache {
    samplers: HashMap<SamplerDesc, vk::Sampler>,
}

impl SamplerCache {
    pub(crate) fn get_or_create(&mut self, device: &dyn GpuDevice, desc: &SamplerDesc) -> Result<vk::Sampler, BackendError> {
        if let Some(&sampler) = self.samplers.get(desc) {
            return Ok(sampler);
        }

        let sampler = device
            .create_sampler(desc)
            .map_err(|result| BackendError::creation("sampler", "cached sampler", format!("{desc:?}"), result))?;
        debug!(?desc, "created sampler");
        device.name_object(sampler, &format!("Sampler {}", self.samplers.len()));
        self.samplers.insert(*desc, sampler);

        Ok(sampler)
    }

    pub(crate) fn len(&self) -> usize {
        self.samplers.len()
    }

    pub(crate) fn destroy(&mut self, device: &dyn GpuDevice) {
        for (_, sampler) in self.samplers.drain() {
            device.destroy_sampler(sampler);
        }
    }
}
