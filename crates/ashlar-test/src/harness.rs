//! Headless device and readback helpers.
//!
//! Everything here needs a Vulkan 1.3 capable GPU, so the tests in this
//! module are ignored by default. Run them with `cargo test -- --ignored`.

use ash::vk;
use ashlar_gpu::{Buffer, DeviceContext, Image, ImageTransition, Instance};
use image::{ImageBuffer, Rgba, RgbaImage};
use std::ops::Deref;

use crate::{init_logging, Result, TestError};

/// Device context without a surface, for off-screen tests.
pub struct HeadlessDevice {
    context: DeviceContext,
}

impl HeadlessDevice {
    /// Create an instance with validation and a device on the first GPU.
    pub fn new() -> Result<Self> {
        init_logging();

        let instance = Instance::builder()
            .app_name("ashlar-test")
            .validation(true)
            .build()?;
        let context = DeviceContext::builder(instance).build()?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }
}

impl Deref for HeadlessDevice {
    type Target = DeviceContext;

    fn deref(&self) -> &DeviceContext {
        &self.context
    }
}

/// Copy mip 0 of an 8-bit RGBA or BGRA color image back to the host.
///
/// `layout` is the image's current layout. The image is left in
/// `TRANSFER_SRC_OPTIMAL` and must have been created with `TRANSFER_SRC` usage.
pub fn read_image_rgba(ctx: &DeviceContext, image: &Image, layout: vk::ImageLayout) -> Result<RgbaImage> {
    let swap_red_blue = match image.format {
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => false,
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => true,
        other => return Err(TestError::UnsupportedFormat(other)),
    };

    let len = image.width as usize * image.height as usize * 4;
    let mut readback = Buffer::new(
        ctx,
        len as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    let copied = ctx.one_shot(|cmd| unsafe {
        let device = ctx.device();
        ImageTransition::new(layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_WRITE,
            )
            .dst(
                vk::PipelineStageFlags2::ALL_TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            )
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
        device.cmd_copy_image_to_buffer(
            cmd,
            image.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            readback.buffer,
            &[region],
        );
    });
    let pixels = copied.and_then(|()| readback.read_to_host(ctx, 0, len));
    readback.destroy(ctx)?;

    let mut pixels = pixels?;
    if swap_red_blue {
        for pixel in pixels.chunks_exact_mut(4) {
            pixel.swap(0, 2);
        }
    }

    ImageBuffer::from_raw(image.width, image.height, pixels)
        .ok_or_else(|| TestError::ImageComparison("readback size mismatch".to_string()))
}

/// Normalized RGB difference between two images of equal size (0.0-1.0).
pub fn image_difference(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();

    let max_diff = u64::from(a.width()) * u64::from(a.height()) * 3 * 255;
    if max_diff == 0 {
        return Ok(0.0);
    }
    Ok(total_diff as f64 / max_diff as f64)
}

/// Fill an image with a single color.
pub fn solid_image(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
    ImageBuffer::from_pixel(width, height, Rgba(color))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ashlar_gpu::image::{transition_for_blitting, transition_for_color_attachment};
    use ashlar_gpu::{mip_level_count, Pass, Sampler, SamplerDesc, Texture, TextureDesc};

    #[test]
    fn identical_images_have_no_difference() {
        let a = solid_image(4, 4, [10, 20, 30, 255]);
        assert_eq!(image_difference(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn opposite_images_differ_fully() {
        let black = solid_image(2, 2, [0, 0, 0, 255]);
        let white = solid_image(2, 2, [255, 255, 255, 0]);
        assert!((image_difference(&black, &white).unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let a = solid_image(2, 2, [0; 4]);
        let b = solid_image(3, 2, [0; 4]);
        assert!(matches!(
            image_difference(&a, &b),
            Err(TestError::ImageComparison(_))
        ));
    }

    // These tests require a GPU and will be skipped in CI without GPU support

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_device_creation() {
        let gpu = HeadlessDevice::new().unwrap();
        assert!(gpu.surface().is_none());
        assert!(gpu.swapchain_loader().is_err());
        tracing::info!("{}", gpu.properties().summary());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffer_destroy_zeroes_state() {
        let gpu = HeadlessDevice::new().unwrap();
        let mut buffer = Buffer::new(
            &gpu,
            1024,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert!(buffer.is_mapped());
        assert_eq!(buffer.size, 1024);

        buffer.destroy(&gpu).unwrap();
        assert_eq!(buffer.buffer, vk::Buffer::null());
        assert_eq!(buffer.memory, vk::DeviceMemory::null());
        assert_eq!(buffer.size, 0);
        assert!(buffer.usage.is_empty());
        assert!(!buffer.is_mapped());

        buffer.destroy(&gpu).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn device_local_upload_reads_back_at_offset() {
        let gpu = HeadlessDevice::new().unwrap();
        let mut buffer = Buffer::new(
            &gpu,
            256,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        assert!(!buffer.is_mapped());

        let data: Vec<u8> = (0..100).collect();
        buffer.copy_from_host(&gpu, &data, 64).unwrap();
        assert_eq!(buffer.read_to_host(&gpu, 64, data.len()).unwrap(), data);

        let words = [0xdead_beef_u32, 0x0bad_f00d];
        buffer.write_pod(&gpu, &words, 200).unwrap();
        let bytes = buffer.read_to_host(&gpu, 200, 8).unwrap();
        assert_eq!(&bytes[..4], &0xdead_beef_u32.to_ne_bytes());

        assert!(buffer.copy_from_host(&gpu, &data, 200).is_err());
        buffer.destroy(&gpu).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn mipmapped_texture_has_full_chain() {
        let gpu = HeadlessDevice::new().unwrap();
        let desc = TextureDesc::new(257, 257, vk::Format::R8G8B8A8_UNORM).mipmaps(true);
        let pixels = vec![200u8; desc.data_len()];

        let mut texture = Texture::new(&gpu, &desc, Some(&pixels)).unwrap();
        assert_eq!(texture.mip_levels(), 9);
        assert_eq!(texture.mip_levels(), mip_level_count(257, 257));
        assert_eq!(
            texture.image_info.image_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        texture.destroy(&gpu).unwrap();
        assert_eq!(texture.image.image, vk::Image::null());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn texture_upload_reads_back() {
        let gpu = HeadlessDevice::new().unwrap();
        let (width, height) = (8, 4);
        let pixels: Vec<u8> = (0..width * height * 4).map(|i| (i * 7 % 251) as u8).collect();
        let desc = TextureDesc::new(width, height, vk::Format::R8G8B8A8_UNORM);

        let mut texture = Texture::new(&gpu, &desc, Some(&pixels)).unwrap();
        let readback = read_image_rgba(
            &gpu,
            &texture.image,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(readback.into_raw(), pixels);
        texture.destroy(&gpu).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn empty_texture_is_shader_readable() {
        let gpu = HeadlessDevice::new().unwrap();
        let desc = TextureDesc::new(16, 16, vk::Format::R8G8B8A8_SRGB);
        let mut texture = Texture::new(&gpu, &desc, None).unwrap();
        assert_ne!(texture.image.view, vk::ImageView::null());
        texture.destroy(&gpu).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn pass_clear_reads_back() {
        let gpu = HeadlessDevice::new().unwrap();
        let mut target = Image::color_attachment(&gpu, 32, 16, vk::Format::R8G8B8A8_UNORM).unwrap();
        let mut depth = Image::depth_attachment(&gpu, 32, 16).unwrap();
        let mut pass = Pass::new(&[&target], Some(&depth), None).unwrap();

        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [1.0, 0.0, 0.0, 1.0],
            },
        };
        gpu.one_shot(|cmd| unsafe {
            transition_for_color_attachment(gpu.device(), cmd, &target);
            pass.begin(&gpu, cmd, clear, vk::AttachmentLoadOp::CLEAR);
            pass.end(&gpu, cmd);
            transition_for_blitting(gpu.device(), cmd, &target);
        })
        .unwrap();

        let readback =
            read_image_rgba(&gpu, &target, vk::ImageLayout::TRANSFER_SRC_OPTIMAL).unwrap();
        let expected = solid_image(32, 16, [255, 0, 0, 255]);
        assert!(image_difference(&readback, &expected).unwrap() < 0.001);

        depth.destroy(&gpu).unwrap();
        target.destroy(&gpu).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn sampler_lifecycle() {
        let gpu = HeadlessDevice::new().unwrap();
        let mut sampler = Sampler::new(&gpu, &SamplerDesc::default()).unwrap();
        assert_ne!(sampler.sampler, vk::Sampler::null());

        let mut texture = Texture::new(
            &gpu,
            &TextureDesc::new(4, 4, vk::Format::R8G8B8A8_UNORM),
            None,
        )
        .unwrap();
        texture.set_sampler(&sampler);
        assert_eq!(texture.image_info.sampler, sampler.sampler);

        texture.destroy(&gpu).unwrap();
        sampler.destroy(&gpu).unwrap();
        assert_eq!(sampler.sampler, vk::Sampler::null());
        sampler.destroy(&gpu).unwrap();
    }
}
