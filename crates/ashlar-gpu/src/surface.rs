//! Surface creation and capability queries.
//!
//! Surfaces are created from anything exposing raw window handles, so the
//! crate stays independent of a particular windowing library.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::Instance;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Create a surface for `window`.
///
/// The instance must have been built with
/// [`InstanceBuilder::display_extensions`](crate::InstanceBuilder::display_extensions)
/// for the same display. Pass the surface to
/// [`DeviceContextBuilder::surface`](crate::DeviceContextBuilder::surface),
/// which takes ownership of it.
pub fn create_surface<W>(instance: &Instance, window: &W) -> Result<vk::SurfaceKHR>
where
    W: HasDisplayHandle + HasWindowHandle,
{
    let display = window
        .display_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
    let window_handle = window
        .window_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

    unsafe {
        ash_window::create_surface(
            instance.entry(),
            instance.handle(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
    }
    .map_err(|e| GpuError::SurfaceCreation(format!("{e} ({})", crate::error::result_name(e))))
}

/// What the device supports presenting to the context's surface.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Query support for the context's surface.
    pub fn query(ctx: &DeviceContext) -> Result<Self> {
        let surface = ctx
            .surface()
            .ok_or(GpuError::NotInitialized("surface"))?;
        let loader = ctx.instance().surface_loader();
        let physical_device = ctx.physical_device();

        unsafe {
            let capabilities = loader
                .get_physical_device_surface_capabilities(physical_device, surface)
                .vk_context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
            let formats = loader
                .get_physical_device_surface_formats(physical_device, surface)
                .vk_context("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
            let present_modes = loader
                .get_physical_device_surface_present_modes(physical_device, surface)
                .vk_context("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

            Ok(Self {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}
