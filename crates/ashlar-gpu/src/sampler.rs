//! Sampler creation.

use crate::context::DeviceContext;
use crate::error::{Result, VkResultExt};
use ash::vk;

/// Filtering and addressing for [`Sampler::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
        }
    }
}

impl SamplerDesc {
    /// Nearest filtering for both magnification and minification.
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            ..Self::default()
        }
    }

    /// Use `mode` on all three axes.
    pub fn address_mode(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_mode_u = mode;
        self.address_mode_v = mode;
        self.address_mode_w = mode;
        self
    }

    /// Create info with the fixed parts filled in.
    ///
    /// `max_anisotropy` of `None` leaves anisotropic filtering disabled.
    pub fn create_info(&self, max_anisotropy: Option<f32>) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode_u)
            .address_mode_v(self.address_mode_v)
            .address_mode_w(self.address_mode_w)
            .anisotropy_enable(max_anisotropy.is_some())
            .max_anisotropy(max_anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(1000.0)
    }
}

/// An owned `vk::Sampler`.
#[derive(Debug, Default)]
pub struct Sampler {
    pub sampler: vk::Sampler,
}

impl Sampler {
    /// Create a sampler from `desc`, with maximum anisotropy when the device
    /// feature is enabled.
    pub fn new(ctx: &DeviceContext, desc: &SamplerDesc) -> Result<Self> {
        let max_anisotropy = ctx
            .features()
            .sampler_anisotropy
            .then(|| ctx.properties().limits().max_sampler_anisotropy);
        let create_info = desc.create_info(max_anisotropy);

        let sampler = unsafe { ctx.device().create_sampler(&create_info, None) }
            .vk_context("vkCreateSampler")?;
        Ok(Self { sampler })
    }

    /// Destroy the sampler. No-op once destroyed.
    pub fn destroy(&mut self, ctx: &DeviceContext) -> Result<()> {
        if self.sampler == vk::Sampler::null() {
            return Ok(());
        }
        ctx.wait_idle()?;
        unsafe { ctx.device().destroy_sampler(self.sampler, None) };
        self.sampler = vk::Sampler::null();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_linear_repeat() {
        let desc = SamplerDesc::default();
        assert_eq!(desc.mag_filter, vk::Filter::LINEAR);
        assert_eq!(desc.min_filter, vk::Filter::LINEAR);
        assert_eq!(desc.mipmap_mode, vk::SamplerMipmapMode::LINEAR);
        assert_eq!(desc.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(desc.address_mode_w, vk::SamplerAddressMode::REPEAT);
    }

    #[test]
    fn create_info_fixed_fields() {
        let info = SamplerDesc::default().create_info(None);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
        assert_eq!(info.compare_enable, vk::FALSE);
        assert_eq!(info.compare_op, vk::CompareOp::ALWAYS);
        assert_eq!(info.border_color, vk::BorderColor::INT_OPAQUE_BLACK);
        assert_eq!(info.min_lod, 0.0);
        assert_eq!(info.max_lod, 1000.0);
    }

    #[test]
    fn anisotropy_uses_given_limit() {
        let info = SamplerDesc::nearest()
            .address_mode(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .create_info(Some(16.0));
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 16.0);
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.address_mode_v, vk::SamplerAddressMode::CLAMP_TO_EDGE);
    }
}
