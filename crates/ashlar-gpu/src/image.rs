//! 2D images with dedicated memory.

use crate::barrier::{depth_aspect, subresource_range, ImageTransition};
use crate::context::DeviceContext;
use crate::error::{GpuError, Result, VkResultExt};
use crate::memory;
use ash::vk;

/// Parameters for [`Image::new`].
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub memory_properties: vk::MemoryPropertyFlags,
}

impl ImageDesc {
    /// Single-mip, single-sample, optimally tiled, device-local image.
    pub fn new(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// Set the mip level count.
    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Set the sample count.
    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// Set the tiling.
    pub fn tiling(mut self, tiling: vk::ImageTiling) -> Self {
        self.tiling = tiling;
        self
    }

    /// Set the memory properties.
    pub fn memory_properties(mut self, properties: vk::MemoryPropertyFlags) -> Self {
        self.memory_properties = properties;
        self
    }
}

/// A 2D image, its optional view and the memory backing it.
#[derive(Debug, Default)]
pub struct Image {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
}

impl Image {
    /// Create an image in `UNDEFINED` layout with memory bound at offset 0.
    pub fn new(ctx: &DeviceContext, desc: &ImageDesc) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "image {}x{} with {} mips",
                desc.width, desc.height, desc.mip_levels
            )));
        }

        let device = ctx.device();
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.create_image(&create_info, None) }.vk_context("vkCreateImage")?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory = match memory::allocate(ctx, &requirements, desc.memory_properties, false) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) }.vk_context("vkBindImageMemory") {
            unsafe {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
            }
            return Err(e);
        }

        Ok(Self {
            image,
            view: vk::ImageView::null(),
            memory,
            width: desc.width,
            height: desc.height,
            mip_levels: desc.mip_levels,
            samples: desc.samples,
            format: desc.format,
            tiling: desc.tiling,
        })
    }

    /// Color render target usable as a blit source for presentation.
    pub fn color_attachment(
        ctx: &DeviceContext,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<Self> {
        let desc = ImageDesc::new(
            width,
            height,
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
        );
        let mut image = Self::new(ctx, &desc)?;
        if let Err(e) = image.create_view(ctx, vk::ImageAspectFlags::COLOR) {
            image.destroy(ctx)?;
            return Err(e);
        }
        Ok(image)
    }

    /// Depth attachment in the best supported depth format, already in
    /// `DEPTH_STENCIL_ATTACHMENT_OPTIMAL`.
    pub fn depth_attachment(ctx: &DeviceContext, width: u32, height: u32) -> Result<Self> {
        let format = ctx.find_depth_format()?;
        let desc = ImageDesc::new(
            width,
            height,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        );
        let mut image = Self::new(ctx, &desc)?;

        let result = image.create_view(ctx, depth_aspect(format)).and_then(|()| {
            ctx.one_shot(|cmd| unsafe {
                ImageTransition::for_depth_attachment(format).record(ctx.device(), cmd, image.image);
            })
        });
        if let Err(e) = result {
            image.destroy(ctx)?;
            return Err(e);
        }
        Ok(image)
    }

    /// Create a 2D view over every mip level. Replaces any existing view.
    pub fn create_view(&mut self, ctx: &DeviceContext, aspect: vk::ImageAspectFlags) -> Result<()> {
        let device = ctx.device();
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(subresource_range(aspect, 0, self.mip_levels));

        let view =
            unsafe { device.create_image_view(&view_info, None) }.vk_context("vkCreateImageView")?;
        if self.view != vk::ImageView::null() {
            unsafe { device.destroy_image_view(self.view, None) };
        }
        self.view = view;
        Ok(())
    }

    /// Image size as a 2D extent.
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// Wait for the device to go idle, then free the memory and destroy the view and image.
    ///
    /// Leaves `self` in its default (all-null) state.
    pub fn destroy(&mut self, ctx: &DeviceContext) -> Result<()> {
        if self.image == vk::Image::null() {
            return Ok(());
        }
        ctx.wait_idle()?;

        let device = ctx.device();
        unsafe {
            device.free_memory(self.memory, None);
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
            device.destroy_image(self.image, None);
        }
        *self = Self::default();
        Ok(())
    }
}

/// Record [`ImageTransition::for_color_attachment`] for `image`.
///
/// # Safety
/// `cmd` must be recording and `image` must be alive.
pub unsafe fn transition_for_color_attachment(device: &ash::Device, cmd: vk::CommandBuffer, image: &Image) {
    unsafe {
        ImageTransition::for_color_attachment()
            .mips(0, image.mip_levels)
            .record(device, cmd, image.image);
    }
}

/// Record [`ImageTransition::for_blitting`] for `image`.
///
/// # Safety
/// `cmd` must be recording and `image` must be alive.
pub unsafe fn transition_for_blitting(device: &ash::Device, cmd: vk::CommandBuffer, image: &Image) {
    unsafe {
        ImageTransition::for_blitting()
            .mips(0, image.mip_levels)
            .record(device, cmd, image.image);
    }
}
