//! Image layout transitions as explicit dependency descriptors.
//!
//! An [`ImageTransition`] names both sides of a dependency (stage and access)
//! together with the layout change and subresource range. The presets below
//! cover every transition this crate records itself.

use ash::vk;

/// Subresource range covering `level_count` mips from `base_mip_level` of one layer.
pub const fn subresource_range(
    aspect_mask: vk::ImageAspectFlags,
    base_mip_level: u32,
    level_count: u32,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Whether a depth format also carries a stencil component.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

/// Aspect mask for a depth attachment of `format`.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// A single image memory dependency.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransition {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub range: vk::ImageSubresourceRange,
}

impl ImageTransition {
    /// A layout change with full (all commands) execution dependencies and
    /// no memory accesses on either side. Refine with the builder methods.
    pub const fn new(old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        Self {
            src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::NONE,
            old_layout,
            new_layout,
            range: subresource_range(vk::ImageAspectFlags::COLOR, 0, 1),
        }
    }

    /// Set the source scope.
    #[must_use]
    pub const fn src(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.src_stage = stage;
        self.src_access = access;
        self
    }

    /// Set the destination scope.
    #[must_use]
    pub const fn dst(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.dst_stage = stage;
        self.dst_access = access;
        self
    }

    /// Set the subresource range.
    #[must_use]
    pub const fn range(mut self, range: vk::ImageSubresourceRange) -> Self {
        self.range = range;
        self
    }

    /// Restrict to `level_count` mips starting at `base_mip_level`.
    #[must_use]
    pub const fn mips(mut self, base_mip_level: u32, level_count: u32) -> Self {
        self.range.base_mip_level = base_mip_level;
        self.range.level_count = level_count;
        self
    }

    /// Undefined contents to color attachment, ready for a render pass to write.
    pub const fn for_color_attachment() -> Self {
        Self::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
        .src(
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::NONE,
        )
        .dst(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        )
    }

    /// Rendered color attachment to blit source.
    pub const fn for_blitting() -> Self {
        Self::new(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .src(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        )
        .dst(vk::PipelineStageFlags2::BLIT, vk::AccessFlags2::TRANSFER_READ)
    }

    /// Undefined contents to depth/stencil attachment.
    pub fn for_depth_attachment(format: vk::Format) -> Self {
        Self::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
        .src(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE)
        .dst(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .range(subresource_range(depth_aspect(format), 0, 1))
    }

    /// Presentable image, contents discarded, to blit destination.
    ///
    /// The source scope is the transfer stage the acquire semaphore waits on.
    pub const fn undefined_to_transfer_dst() -> Self {
        Self::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .src(vk::PipelineStageFlags2::ALL_TRANSFER, vk::AccessFlags2::NONE)
        .dst(
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        )
    }

    /// Blit destination to presentable.
    pub const fn transfer_dst_to_present() -> Self {
        Self::new(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .src(vk::PipelineStageFlags2::BLIT, vk::AccessFlags2::TRANSFER_WRITE)
        .dst(vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::NONE)
    }

    /// Freshly uploaded data to sampled in fragment shaders.
    pub const fn transfer_dst_to_shader_read() -> Self {
        Self::new(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .src(
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        )
        .dst(
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_READ,
        )
    }

    /// Mip `level` just written, about to be read as the next blit's source.
    pub const fn mip_to_transfer_src(level: u32) -> Self {
        Self::new(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .src(
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        )
        .dst(vk::PipelineStageFlags2::BLIT, vk::AccessFlags2::TRANSFER_READ)
        .mips(level, 1)
    }

    /// Mip `level` fully consumed as a blit source, final for sampling.
    pub const fn mip_to_shader_read(level: u32) -> Self {
        Self::new(
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .src(vk::PipelineStageFlags2::BLIT, vk::AccessFlags2::TRANSFER_READ)
        .dst(
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_READ,
        )
        .mips(level, 1)
    }

    /// Build the barrier struct for `image`.
    pub fn barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(self.range)
    }

    /// Record the transition into `cmd`.
    ///
    /// # Safety
    /// The command buffer must be recording and `image` must be valid.
    pub unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
        let barrier = self.barrier(image);
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn default_range_is_first_color_mip() {
        let t = ImageTransition::new(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        );
        assert_eq!(t.range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(t.range.base_mip_level, 0);
        assert_eq!(t.range.level_count, 1);
        assert_eq!(t.range.layer_count, 1);
    }

    #[test]
    fn presentation_transitions_chain() {
        let acquire = ImageTransition::undefined_to_transfer_dst();
        let present = ImageTransition::transfer_dst_to_present();
        assert_eq!(acquire.new_layout, present.old_layout);
        assert_eq!(present.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(acquire.dst_access.contains(vk::AccessFlags2::TRANSFER_WRITE));
    }

    #[test]
    fn attachment_then_blit_chain() {
        let attach = ImageTransition::for_color_attachment();
        let blit = ImageTransition::for_blitting();
        assert_eq!(attach.new_layout, blit.old_layout);
        assert_eq!(blit.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    }

    #[test]
    fn mip_transitions_target_single_level() {
        let to_src = ImageTransition::mip_to_transfer_src(3);
        let to_read = ImageTransition::mip_to_shader_read(3);
        assert_eq!(to_src.range.base_mip_level, 3);
        assert_eq!(to_src.range.level_count, 1);
        assert_eq!(to_src.new_layout, to_read.old_layout);
        assert_eq!(to_read.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn depth_aspect_includes_stencil_when_present() {
        assert_eq!(
            depth_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        let t = ImageTransition::for_depth_attachment(vk::Format::D32_SFLOAT_S8_UINT);
        assert!(t.range.aspect_mask.contains(vk::ImageAspectFlags::STENCIL));
    }

    #[test]
    fn barrier_carries_descriptor_fields() {
        let image = vk::Image::from_raw(0x42);
        let barrier = ImageTransition::for_blitting().barrier(image);
        assert_eq!(barrier.image, image);
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barrier.src_stage_mask, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::TRANSFER_READ);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }
}
