//! Swapchain management.
//!
//! [`Swapchain`] owns the presentable images and one [`FrameSlot`] per frame
//! in flight. A frame is:
//!
//! 1. [`Swapchain::acquire_next_image`] returns the slot's command buffer, recording.
//! 2. The caller renders into its own image and leaves it in `TRANSFER_SRC_OPTIMAL`.
//! 3. [`Swapchain::present`] blits that image onto the swapchain image, submits and presents.
//!
//! Out-of-date and suboptimal surfaces are handled by recreating in place;
//! [`Swapchain::recreated`] reports it until the next present begins.

use crate::barrier::ImageTransition;
use crate::command::{begin_command_buffer, end_command_buffer, submit_command_buffers};
use crate::context::DeviceContext;
use crate::error::{GpuError, Result, VkResultExt};
use crate::frame::{Acquire, FrameLoop, SwapchainState};
use crate::image::Image;
use crate::surface::SurfaceSupport;
use crate::sync::{FrameSlot, FrameSlots};
use ash::vk;

/// Usage requested for swapchain images, reduced to what the surface supports.
pub const SWAPCHAIN_IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::STORAGE.as_raw()
        | vk::ImageUsageFlags::TRANSFER_SRC.as_raw()
        | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// Usage the surface must support for presenting through a blit.
pub const REQUIRED_IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// Source of the window's framebuffer size, consulted whenever the swapchain
/// is (re)created.
///
/// Implementations must not return until the size is non-zero (a minimized
/// window has to be waited out) and must not recreate the swapchain
/// themselves.
pub trait FrameSize {
    fn frame_size(&mut self) -> (u32, u32);
}

impl<F> FrameSize for F
where
    F: FnMut() -> (u32, u32),
{
    fn frame_size(&mut self) -> (u32, u32) {
        self()
    }
}

/// Prefer `B8G8R8A8_UNORM` in sRGB color space, else the first listed format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_UNORM
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".into()))
}

/// FIFO with vsync. Without it the lowest-latency available mode:
/// immediate, then mailbox, then FIFO which is always supported.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's fixed extent, or the desired size clamped to the allowed range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    vk::Extent2D {
        width: desired_width.max(min.width).min(max.width),
        height: desired_height.max(min.height).min(max.height),
    }
}

/// One image more than the minimum, capped by the maximum when there is one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Requested usage intersected with `supported`. Fails without
/// [`REQUIRED_IMAGE_USAGE`].
pub fn select_image_usage(supported: vk::ImageUsageFlags) -> Result<vk::ImageUsageFlags> {
    if !supported.contains(REQUIRED_IMAGE_USAGE) {
        return Err(GpuError::SwapchainCreation(format!(
            "surface image usage {supported:?} lacks {REQUIRED_IMAGE_USAGE:?}"
        )));
    }
    Ok(SWAPCHAIN_IMAGE_USAGE & supported)
}

/// Presentable images plus the per-frame command buffers and sync objects.
///
/// Not dropped automatically: call [`Swapchain::destroy`] before the
/// [`DeviceContext`] goes away.
pub struct Swapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    image_index: u32,
    support: Option<SurfaceSupport>,
    slots: FrameSlots,
    frames: FrameLoop,
    frame_size: Box<dyn FrameSize>,
}

impl Swapchain {
    /// Create the swapchain for the context's surface.
    pub fn new(
        ctx: &DeviceContext,
        frames_in_flight: usize,
        frame_size: impl FrameSize + 'static,
    ) -> Result<Self> {
        if ctx.surface().is_none() {
            return Err(GpuError::NotInitialized("surface"));
        }
        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            image_index: 0,
            support: None,
            slots: FrameSlots::default(),
            frames: FrameLoop::new(frames_in_flight)?,
            frame_size: Box::new(frame_size),
        };

        if let Err(e) = swapchain.build(ctx) {
            unsafe { swapchain.release(ctx) };
            return Err(e);
        }
        Ok(swapchain)
    }

    /// Wait for the current slot, acquire the next image and begin the slot's
    /// command buffer.
    ///
    /// An out-of-date swapchain is recreated and the acquire retried.
    pub fn acquire_next_image(&mut self, ctx: &DeviceContext) -> Result<vk::CommandBuffer> {
        let frame = self.frames.begin_acquire()?;
        match self.acquire(ctx, frame) {
            Ok(cmd) => {
                self.frames.finish_acquire()?;
                Ok(cmd)
            }
            Err(e) => {
                if self.frames.state() == SwapchainState::Acquiring {
                    self.frames.cancel_acquire()?;
                }
                Err(e)
            }
        }
    }

    fn acquire(&mut self, ctx: &DeviceContext, frame: Acquire) -> Result<vk::CommandBuffer> {
        let device = ctx.device();
        let loader = ctx.swapchain_loader()?;

        let mut awaited = frame.awaited_frame;
        let image_index = loop {
            let image_available = {
                let slot = self.slot(frame.slot)?;
                tracing::trace!(
                    "Frame {} waits on slot {} fence (frame {:?})",
                    frame.frame,
                    frame.slot,
                    awaited
                );
                unsafe { slot.sync.wait(device) }?;
                slot.sync.image_available
            };

            let acquired = unsafe {
                loader.acquire_next_image(self.swapchain, u64::MAX, image_available, vk::Fence::null())
            };
            match acquired {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        tracing::debug!("Acquired image {index} from a suboptimal swapchain");
                    }
                    break index;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    tracing::debug!("Swapchain out of date during acquire");
                    self.recreate(ctx)?;
                    // Rebuilt slots start with signaled fences.
                    awaited = self.frames.last_submitted(frame.slot);
                }
                Err(e) => return Err(GpuError::vulkan("vkAcquireNextImageKHR", e)),
            }
        };

        let slot = self.slot(frame.slot)?;
        let cmd = slot.command_buffer;
        unsafe {
            slot.sync.reset(device)?;
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .vk_context("vkResetCommandBuffer")?;
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }
        self.image_index = image_index;
        Ok(cmd)
    }

    /// Blit `source` onto the acquired image, submit `cmd` and present.
    ///
    /// `cmd` must be the command buffer returned by the matching
    /// [`Swapchain::acquire_next_image`], and `source` must be in
    /// `TRANSFER_SRC_OPTIMAL` by the end of it. The slot advances even when
    /// the submit fails or presenting triggers a recreate.
    pub fn present(&mut self, ctx: &DeviceContext, cmd: vk::CommandBuffer, source: &Image) -> Result<()> {
        if self.frames.state() == SwapchainState::Recording {
            let expected = self.current_slot()?.command_buffer;
            if cmd != expected {
                return Err(GpuError::InvalidArgument(
                    "command buffer was not returned by the last acquire".into(),
                ));
            }
        }
        self.frames.begin_present()?;
        let presented = self.submit_and_present(ctx, cmd, source);
        self.frames.complete_present(presented)
    }

    /// Record the blit, submit `cmd` and queue the present. Recreates on a
    /// suboptimal or out-of-date surface.
    fn submit_and_present(
        &mut self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        source: &Image,
    ) -> Result<()> {
        let device = ctx.device();
        let loader = ctx.swapchain_loader()?;
        let slot = self.current_slot()?;
        let (image_available, render_finished, in_flight) = (
            slot.sync.image_available,
            slot.sync.render_finished,
            slot.sync.in_flight,
        );
        let target = self
            .images
            .get(self.image_index as usize)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("no swapchain image {}", self.image_index)))?;

        unsafe {
            ImageTransition::undefined_to_transfer_dst().record(device, cmd, target);
            self.record_blit(device, cmd, source, target);
            ImageTransition::transfer_dst_to_present().record(device, cmd, target);
            end_command_buffer(device, cmd)?;

            submit_command_buffers(
                device,
                ctx.queue(),
                &[cmd],
                &[image_available],
                &[vk::PipelineStageFlags::TRANSFER],
                &[render_finished],
                in_flight,
            )?;
        }
        self.frames.mark_submitted()?;

        let wait_semaphores = [render_finished];
        let swapchains = [self.swapchain];
        let image_indices = [self.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(ctx.queue(), &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::debug!("Swapchain suboptimal or out of date after present");
                self.recreate(ctx)
            }
            Err(e) => Err(GpuError::vulkan("vkQueuePresentKHR", e)),
        }
    }

    /// # Safety
    /// `cmd` must be recording, `source` in `TRANSFER_SRC_OPTIMAL` and `target`
    /// in `TRANSFER_DST_OPTIMAL`.
    unsafe fn record_blit(&self, device: &ash::Device, cmd: vk::CommandBuffer, source: &Image, target: vk::Image) {
        let layer = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let corner = |extent: vk::Extent2D| vk::Offset3D {
            x: i32::try_from(extent.width).unwrap_or(i32::MAX),
            y: i32::try_from(extent.height).unwrap_or(i32::MAX),
            z: 1,
        };
        let region = vk::ImageBlit2::default()
            .src_subresource(layer)
            .src_offsets([vk::Offset3D::default(), corner(source.extent())])
            .dst_subresource(layer)
            .dst_offsets([vk::Offset3D::default(), corner(self.extent)]);
        let blit_info = vk::BlitImageInfo2::default()
            .src_image(source.image)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(target)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(std::slice::from_ref(&region))
            .filter(vk::Filter::NEAREST);
        unsafe { device.cmd_blit_image2(cmd, &blit_info) };
    }

    /// Rebuild the swapchain and frame slots at the current frame size.
    pub fn recreate(&mut self, ctx: &DeviceContext) -> Result<()> {
        let resume = self.frames.begin_recreate()?;
        tracing::debug!("Recreating swapchain");

        if let Err(e) = ctx.wait_idle() {
            // Objects may still be in use; leave them for `destroy`.
            tracing::error!("Device wait failed before swapchain recreate: {e}");
            self.frames.destroy();
            return Err(e);
        }
        unsafe { self.release(ctx) };
        match self.build(ctx) {
            Ok(()) => self.frames.finish_recreate(resume),
            Err(e) => {
                unsafe { self.release(ctx) };
                self.frames.destroy();
                Err(e)
            }
        }
    }

    /// Release every swapchain object. Safe to call more than once.
    pub fn destroy(&mut self, ctx: &DeviceContext) -> Result<()> {
        if !self.holds_objects() {
            self.frames.destroy();
            return Ok(());
        }
        ctx.wait_idle()?;
        unsafe { self.release(ctx) };
        self.frames.destroy();
        Ok(())
    }

    /// Query support and create the swapchain, its views and the frame slots.
    fn build(&mut self, ctx: &DeviceContext) -> Result<()> {
        let (width, height) = self.frame_size.frame_size();
        let surface = ctx.surface().ok_or(GpuError::NotInitialized("surface"))?;
        let loader = ctx.swapchain_loader()?;
        let device = ctx.device();

        let support = SurfaceSupport::query(ctx)?;
        let capabilities = &support.capabilities;
        let format = select_surface_format(&support.formats)?;
        let present_mode = select_present_mode(&support.present_modes, ctx.vsync());
        let extent = choose_extent(capabilities, width, height);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SwapchainCreation(format!(
                "zero extent {}x{}",
                extent.width, extent.height
            )));
        }
        let image_count = choose_image_count(capabilities);
        let usage = select_image_usage(capabilities.supported_usage_flags)?;

        let queue_families = [ctx.queue_family_index()];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        self.swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(crate::error::result_name(e).into()))?;
        self.images = unsafe { loader.get_swapchain_images(self.swapchain) }
            .vk_context("vkGetSwapchainImagesKHR")?;

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(crate::barrier::subresource_range(
                    vk::ImageAspectFlags::COLOR,
                    0,
                    1,
                ));
            let view = unsafe { device.create_image_view(&view_info, None) }
                .vk_context("vkCreateImageView")?;
            self.image_views.push(view);
        }

        self.slots =
            unsafe { FrameSlots::new(device, ctx.command_pool(), self.frames.frames_in_flight()) }?;

        tracing::info!(
            "Swapchain created: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            self.images.len()
        );

        self.format = format;
        self.present_mode = present_mode;
        self.extent = extent;
        self.image_index = 0;
        self.support = Some(support);
        Ok(())
    }

    /// Destroy slots, views and the swapchain handle, leaving empty fields.
    ///
    /// # Safety
    /// The device must be idle with respect to the swapchain and its slots.
    unsafe fn release(&mut self, ctx: &DeviceContext) {
        let device = ctx.device();
        unsafe {
            self.slots.destroy(device, ctx.command_pool());
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                if let Ok(loader) = ctx.swapchain_loader() {
                    loader.destroy_swapchain(self.swapchain, None);
                }
            }
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
        self.support = None;
    }

    /// Whether anything is left for [`Self::release`] to destroy.
    fn holds_objects(&self) -> bool {
        self.swapchain != vk::SwapchainKHR::null()
            || !self.image_views.is_empty()
            || !self.slots.is_empty()
    }

    fn slot(&self, index: usize) -> Result<&FrameSlot> {
        self.slots
            .get(index)
            .ok_or(GpuError::NotInitialized("frame slots"))
    }

    fn current_slot(&self) -> Result<&FrameSlot> {
        self.slot(self.frames.slot())
    }

    /// Whether the swapchain was recreated since the last present began.
    pub fn recreated(&self) -> bool {
        self.frames.recreated()
    }

    /// Get the frame loop state.
    pub fn state(&self) -> SwapchainState {
        self.frames.state()
    }

    /// Get the raw swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Get the swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Get the swapchain image format.
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Get the surface format including color space.
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Get the present mode in use.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Get the number of swapchain images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Get the swapchain images.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Get the swapchain image views.
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Index of the most recently acquired image.
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Index of the current frame slot.
    pub fn frame_slot(&self) -> usize {
        self.frames.slot()
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.frames_in_flight()
    }

    /// Surface support captured at the last (re)creation.
    pub fn support(&self) -> Option<&SurfaceSupport> {
        self.support.as_ref()
    }
}
