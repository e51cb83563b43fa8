//! Dynamic rendering passes over owned images.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::image::Image;
use ash::vk;

/// Attachment set for one `vkCmdBeginRendering` scope.
///
/// Holds no GPU objects, only the attachment descriptions derived from the
/// images it was built from. Those images must outlive every recorded pass.
pub struct Pass {
    color_attachments: Vec<vk::RenderingAttachmentInfo<'static>>,
    depth_attachment: Option<vk::RenderingAttachmentInfo<'static>>,
    color_formats: Vec<vk::Format>,
    depth_format: vk::Format,
    extent: vk::Extent2D,
}

impl Pass {
    /// Derive attachments from `color_images`, an optional depth image and an
    /// optional multisample resolve target applied to every color attachment.
    pub fn new(color_images: &[&Image], depth: Option<&Image>, resolve: Option<&Image>) -> Result<Self> {
        let extent = color_images
            .first()
            .copied()
            .or(depth)
            .map(Image::extent)
            .ok_or_else(|| GpuError::InvalidArgument("pass needs at least one attachment".into()))?;

        let color_attachments = color_images
            .iter()
            .map(|image| {
                let attachment = vk::RenderingAttachmentInfo::default()
                    .image_view(image.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .store_op(vk::AttachmentStoreOp::STORE);
                match resolve {
                    Some(target) => attachment
                        .resolve_mode(vk::ResolveModeFlags::AVERAGE)
                        .resolve_image_view(target.view)
                        .resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                    None => attachment,
                }
            })
            .collect();

        let depth_attachment = depth.map(|image| {
            vk::RenderingAttachmentInfo::default()
                .image_view(image.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .store_op(vk::AttachmentStoreOp::STORE)
        });

        Ok(Self {
            color_attachments,
            depth_attachment,
            color_formats: color_images.iter().map(|image| image.format).collect(),
            depth_format: depth.map_or(vk::Format::UNDEFINED, |image| image.format),
            extent,
        })
    }

    /// Rebuild the attachments, e.g. after the images were resized.
    pub fn recreate(&mut self, color_images: &[&Image], depth: Option<&Image>, resolve: Option<&Image>) -> Result<()> {
        *self = Self::new(color_images, depth, resolve)?;
        Ok(())
    }

    /// Begin rendering into every attachment over the full extent.
    ///
    /// Color attachments use `load_op` and `clear_value`. Depth uses the same
    /// `load_op` and clears to 1.0.
    ///
    /// # Safety
    /// `cmd` must be recording outside any rendering scope and the attachment
    /// images must be in their attachment layouts.
    pub unsafe fn begin(
        &mut self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        clear_value: vk::ClearValue,
        load_op: vk::AttachmentLoadOp,
    ) {
        for attachment in &mut self.color_attachments {
            attachment.load_op = load_op;
            attachment.clear_value = clear_value;
        }
        if let Some(depth) = &mut self.depth_attachment {
            depth.load_op = load_op;
            depth.clear_value = vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            };
        }

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(self.render_area())
            .layer_count(1)
            .color_attachments(&self.color_attachments);
        if let Some(depth) = &self.depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        unsafe { ctx.device().cmd_begin_rendering(cmd, &rendering_info) };
    }

    /// # Safety
    /// `cmd` must be inside a scope opened by [`Pass::begin`].
    pub unsafe fn end(&self, ctx: &DeviceContext, cmd: vk::CommandBuffer) {
        unsafe { ctx.device().cmd_end_rendering(cmd) };
    }

    /// Attachment formats for building a pipeline compatible with this pass.
    pub fn rendering_create_info(&self) -> vk::PipelineRenderingCreateInfo<'_> {
        vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&self.color_formats)
            .depth_attachment_format(self.depth_format)
    }

    /// Get the full-extent render area.
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self.extent,
        }
    }

    /// Get the color attachment formats.
    pub fn color_formats(&self) -> &[vk::Format] {
        &self.color_formats
    }

    /// Get the depth format, `UNDEFINED` without a depth attachment.
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Get the pass extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Get the color attachment infos.
    pub fn color_attachments(&self) -> &[vk::RenderingAttachmentInfo<'static>] {
        &self.color_attachments
    }

    /// Get the depth attachment info.
    pub fn depth_attachment(&self) -> Option<&vk::RenderingAttachmentInfo<'static>> {
        self.depth_attachment.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn fake_image(view: u64, width: u32, height: u32, format: vk::Format) -> Image {
        Image {
            view: vk::ImageView::from_raw(view),
            width,
            height,
            format,
            mip_levels: 1,
            ..Default::default()
        }
    }

    #[test]
    fn empty_pass_is_rejected() {
        assert!(matches!(
            Pass::new(&[], None, None),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn color_attachments_follow_images() {
        let albedo = fake_image(1, 800, 600, vk::Format::R8G8B8A8_UNORM);
        let normal = fake_image(2, 800, 600, vk::Format::R16G16B16A16_SFLOAT);
        let pass = Pass::new(&[&albedo, &normal], None, None).unwrap();

        assert_eq!(
            pass.color_formats(),
            &[vk::Format::R8G8B8A8_UNORM, vk::Format::R16G16B16A16_SFLOAT]
        );
        assert_eq!(pass.depth_format(), vk::Format::UNDEFINED);
        assert!(pass.depth_attachment().is_none());
        assert_eq!(pass.extent(), vk::Extent2D { width: 800, height: 600 });

        let attachments = pass.color_attachments();
        assert_eq!(attachments[0].image_view, albedo.view);
        assert_eq!(attachments[1].image_view, normal.view);
        for attachment in attachments {
            assert_eq!(attachment.image_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
            assert_eq!(attachment.resolve_mode, vk::ResolveModeFlags::NONE);
        }
    }

    #[test]
    fn resolve_target_applies_to_every_color() {
        let msaa = fake_image(1, 640, 480, vk::Format::B8G8R8A8_UNORM);
        let resolved = fake_image(5, 640, 480, vk::Format::B8G8R8A8_UNORM);
        let pass = Pass::new(&[&msaa], None, Some(&resolved)).unwrap();

        let attachment = &pass.color_attachments()[0];
        assert_eq!(attachment.resolve_mode, vk::ResolveModeFlags::AVERAGE);
        assert_eq!(attachment.resolve_image_view, resolved.view);
        assert_eq!(
            attachment.resolve_image_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn depth_only_pass_takes_depth_extent() {
        let depth = fake_image(3, 1024, 1024, vk::Format::D32_SFLOAT);
        let pass = Pass::new(&[], Some(&depth), None).unwrap();

        assert_eq!(pass.extent(), vk::Extent2D { width: 1024, height: 1024 });
        assert_eq!(pass.depth_format(), vk::Format::D32_SFLOAT);
        assert!(pass.color_formats().is_empty());

        let attachment = pass.depth_attachment().unwrap();
        assert_eq!(attachment.image_view, depth.view);
        assert_eq!(
            attachment.image_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn pipeline_info_lists_formats() {
        let color = fake_image(1, 16, 16, vk::Format::R8G8B8A8_SRGB);
        let depth = fake_image(2, 16, 16, vk::Format::D24_UNORM_S8_UINT);
        let pass = Pass::new(&[&color], Some(&depth), None).unwrap();

        let info = pass.rendering_create_info();
        assert_eq!(info.color_attachment_count, 1);
        assert_eq!(info.depth_attachment_format, vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(info.stencil_attachment_format, vk::Format::UNDEFINED);
    }

    #[test]
    fn recreate_replaces_attachments() {
        let small = fake_image(1, 16, 16, vk::Format::R8G8B8A8_UNORM);
        let large = fake_image(2, 64, 32, vk::Format::R8G8B8A8_UNORM);
        let mut pass = Pass::new(&[&small], None, None).unwrap();

        pass.recreate(&[&large], None, None).unwrap();
        assert_eq!(pass.extent(), vk::Extent2D { width: 64, height: 32 });
        assert_eq!(pass.color_attachments()[0].image_view, large.view);
    }
}
