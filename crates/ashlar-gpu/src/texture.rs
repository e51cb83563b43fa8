//! Sampled textures with optional mip chains, and the RGBA8 pixel source feeding them.

use crate::barrier::ImageTransition;
use crate::buffer::Buffer;
use crate::context::DeviceContext;
use crate::descriptor::image_descriptor_write;
use crate::error::{GpuError, Result};
use crate::image::{Image, ImageDesc};
use crate::sampler::Sampler;
use ash::vk;
use std::path::Path;

/// Number of mip levels in a full chain down to 1x1.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Extents of every level of a full mip chain, starting with the base level.
pub fn mip_extents(width: u32, height: u32) -> impl Iterator<Item = (u32, u32)> {
    let levels = mip_level_count(width, height);
    (0..levels).map(move |level| ((width >> level).max(1), (height >> level).max(1)))
}

/// Parameters for [`Texture::new`].
#[derive(Debug, Clone, Copy)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    /// Bytes per pixel of the uploaded data.
    pub channels: u32,
    pub mipmaps: bool,
}

impl TextureDesc {
    /// RGBA8 data, no mipmaps.
    pub fn new(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            channels: 4,
            mipmaps: false,
        }
    }

    pub fn channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    pub fn mipmaps(mut self, mipmaps: bool) -> Self {
        self.mipmaps = mipmaps;
        self
    }

    /// Levels the image is created with.
    pub fn mip_levels(&self) -> u32 {
        if self.mipmaps {
            mip_level_count(self.width, self.height)
        } else {
            1
        }
    }

    /// Byte length the pixel data must have.
    pub fn data_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// An image in `SHADER_READ_ONLY_OPTIMAL` plus the descriptor info used to bind it.
#[derive(Debug, Default)]
pub struct Texture {
    pub image: Image,
    pub image_info: vk::DescriptorImageInfo,
}

impl Texture {
    /// Create the texture and, when `pixels` is given, upload it and build the mip chain.
    pub fn new(ctx: &DeviceContext, desc: &TextureDesc, pixels: Option<&[u8]>) -> Result<Self> {
        if let Some(pixels) = pixels {
            if pixels.len() != desc.data_len() {
                return Err(GpuError::InvalidArgument(format!(
                    "texture {}x{}x{} expects {} bytes, got {}",
                    desc.width,
                    desc.height,
                    desc.channels,
                    desc.data_len(),
                    pixels.len()
                )));
            }
        }

        let image_desc = ImageDesc::new(
            desc.width,
            desc.height,
            desc.format,
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
        )
        .mip_levels(desc.mip_levels());
        let mut image = Image::new(ctx, &image_desc)?;

        let result = match pixels {
            Some(pixels) => upload(ctx, &image, pixels),
            None => ctx.one_shot(|cmd| unsafe {
                ImageTransition::new(
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
                .dst(
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_READ,
                )
                .mips(0, image.mip_levels)
                .record(ctx.device(), cmd, image.image);
            }),
        }
        .and_then(|()| image.create_view(ctx, vk::ImageAspectFlags::COLOR));

        if let Err(e) = result {
            image.destroy(ctx)?;
            return Err(e);
        }

        let image_info = vk::DescriptorImageInfo::default()
            .image_view(image.view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(Self { image, image_info })
    }

    /// Upload decoded RGBA8 pixels.
    pub fn from_image_data(
        ctx: &DeviceContext,
        format: vk::Format,
        data: &ImageData,
        mipmaps: bool,
    ) -> Result<Self> {
        let desc = TextureDesc::new(data.width, data.height, format).mipmaps(mipmaps);
        Self::new(ctx, &desc, Some(&data.pixels))
    }

    /// Bind `sampler` into the descriptor info.
    pub fn set_sampler(&mut self, sampler: &Sampler) {
        self.image_info.sampler = sampler.sampler;
    }

    /// Combined image sampler write for `binding`.
    pub fn descriptor_write(&self, binding: u32) -> vk::WriteDescriptorSet<'_> {
        image_descriptor_write(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            &self.image_info,
        )
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels
    }

    /// Destroy the image. The sampler is not owned and is left alone.
    pub fn destroy(&mut self, ctx: &DeviceContext) -> Result<()> {
        self.image.destroy(ctx)?;
        self.image_info = vk::DescriptorImageInfo::default();
        Ok(())
    }
}

fn upload(ctx: &DeviceContext, image: &Image, pixels: &[u8]) -> Result<()> {
    if image.mip_levels > 1 {
        let features = ctx.format_properties(image.format).optimal_tiling_features;
        if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
            return Err(GpuError::FormatNotSupported(format!(
                "{:?} does not support linear blitting",
                image.format
            )));
        }
    }

    let mut staging = Buffer::new(
        ctx,
        pixels.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    let result = staging.copy_from_host(ctx, pixels, 0).and_then(|()| {
        ctx.one_shot(|cmd| unsafe {
            let device = ctx.device();
            ImageTransition::undefined_to_transfer_dst()
                .mips(0, image.mip_levels)
                .record(device, cmd, image.image);

            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: image.width,
                    height: image.height,
                    depth: 1,
                });
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            if image.mip_levels > 1 {
                record_mipmaps(device, cmd, image);
            } else {
                ImageTransition::transfer_dst_to_shader_read().record(device, cmd, image.image);
            }
        })
    });

    staging.destroy(ctx)?;
    result
}

/// Blit each level from the previous one and leave every level shader-readable.
///
/// # Safety
/// `cmd` must be recording and every level of `image` must be in `TRANSFER_DST_OPTIMAL`.
unsafe fn record_mipmaps(device: &ash::Device, cmd: vk::CommandBuffer, image: &Image) {
    tracing::debug!(
        "Generating {} mips for {}x{} image",
        image.mip_levels,
        image.width,
        image.height
    );

    let extents: Vec<_> = mip_extents(image.width, image.height)
        .take(image.mip_levels as usize)
        .collect();

    for (level, window) in (1u32..).zip(extents.windows(2)) {
        let (src_w, src_h) = window[0];
        let (dst_w, dst_h) = window[1];

        unsafe {
            ImageTransition::mip_to_transfer_src(level - 1).record(device, cmd, image.image);

            let blit = vk::ImageBlit2::default()
                .src_subresource(color_layer(level - 1))
                .src_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: src_w as i32,
                        y: src_h as i32,
                        z: 1,
                    },
                ])
                .dst_subresource(color_layer(level))
                .dst_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst_w as i32,
                        y: dst_h as i32,
                        z: 1,
                    },
                ]);
            let blit_info = vk::BlitImageInfo2::default()
                .src_image(image.image)
                .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .dst_image(image.image)
                .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .regions(std::slice::from_ref(&blit))
                .filter(vk::Filter::LINEAR);
            device.cmd_blit_image2(cmd, &blit_info);

            ImageTransition::mip_to_shader_read(level - 1).record(device, cmd, image.image);
        }
    }

    unsafe {
        ImageTransition::transfer_dst_to_shader_read()
            .mips(image.mip_levels - 1, 1)
            .record(device, cmd, image.image);
    }
}

fn color_layer(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Tightly packed RGBA8 pixels, bottom row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl ImageData {
    /// Wrap already-prepared pixels.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(GpuError::InvalidArgument(format!(
                "{width}x{height} RGBA expects {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decode an encoded image (PNG, JPEG, ...) held in memory.
    pub fn from_memory(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_dynamic(image::load_from_memory(bytes)?))
    }

    /// Decode an image file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_dynamic(image::open(path)?))
    }

    fn from_dynamic(decoded: image::DynamicImage) -> Self {
        let rgba = decoded.flipv().to_rgba8();
        Self {
            width: rgba.width(),
            height: rgba.height(),
            pixels: rgba.into_raw(),
        }
    }
}
