//! Device context management.
//!
//! A [`DeviceContext`] owns everything created once per process: the
//! [`Instance`], the logical device with its single queue, the command pool for
//! transient command buffers, the presentation surface and the extension
//! loaders. Every other object in this crate borrows it explicitly.

use crate::capabilities::{supports_vulkan_1_3, DeviceProperties};
use crate::command::{self, CommandPool};
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::{version_string, Instance};
use crate::memory::find_memory_type;
use ash::vk;
use std::ffi::{c_char, CStr};

/// Device features enabled at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// Vulkan 1.3 dynamic rendering (required by [`crate::Pass`])
    pub dynamic_rendering: bool,
    /// Vulkan 1.3 synchronization2 (required by the barrier helpers)
    pub synchronization2: bool,
    /// Vulkan 1.2 buffer device address
    pub buffer_device_address: bool,
    /// Vulkan 1.2 descriptor indexing
    pub descriptor_indexing: bool,
    /// Anisotropic filtering in samplers
    pub sampler_anisotropy: bool,
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        Self {
            dynamic_rendering: true,
            synchronization2: true,
            buffer_device_address: true,
            descriptor_indexing: true,
            sampler_anisotropy: true,
        }
    }
}

/// Extension entry points resolved once at device creation.
pub struct DeviceLoaders {
    /// `VK_KHR_swapchain`, present whenever the device was built with a surface
    pub swapchain: Option<ash::khr::swapchain::Device>,
    /// `VK_KHR_push_descriptor`, when requested
    pub push_descriptor: Option<ash::khr::push_descriptor::Device>,
}

/// Main device context holding the Vulkan device and its queue.
pub struct DeviceContext {
    pub(crate) instance: Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) surface: Option<vk::SurfaceKHR>,
    pub(crate) properties: DeviceProperties,
    pub(crate) features: DeviceFeatures,
    pub(crate) queue_family_index: u32,
    pub(crate) queue: vk::Queue,
    pub(crate) command_pool: CommandPool,
    pub(crate) loaders: DeviceLoaders,
    pub(crate) vsync: bool,
}

impl DeviceContext {
    /// Start configuring a device on top of `instance`.
    pub fn builder(instance: Instance) -> DeviceContextBuilder {
        DeviceContextBuilder::new(instance)
    }

    /// Get the owning instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the presentation surface, if the device was built with one.
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    /// Get the device properties.
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Get the features enabled at creation.
    pub fn features(&self) -> &DeviceFeatures {
        &self.features
    }

    /// Get the queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Get the queue family index.
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Get the command pool for transient command buffers.
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    /// Get the extension loaders.
    pub fn loaders(&self) -> &DeviceLoaders {
        &self.loaders
    }

    /// Get the swapchain loader.
    pub fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.loaders
            .swapchain
            .as_ref()
            .ok_or(GpuError::NotInitialized("swapchain extension"))
    }

    /// Whether presentation should wait for vertical blank.
    pub fn vsync(&self) -> bool {
        self.vsync
    }

    /// Change the vsync preference. Takes effect on the next swapchain (re)creation.
    pub fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.vk_context("vkDeviceWaitIdle")
    }

    /// Allocate and begin a one-time-submit command buffer.
    pub fn begin_one_shot(&self) -> Result<vk::CommandBuffer> {
        unsafe { command::begin_one_shot(&self.device, &self.command_pool) }
    }

    /// Submit a command buffer from [`Self::begin_one_shot`] and block until the queue is idle.
    pub fn end_one_shot(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { command::end_one_shot(&self.device, &self.command_pool, self.queue, cmd) }
    }

    /// Record `f` into a one-shot command buffer, submit it and wait.
    pub fn one_shot<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        unsafe {
            command::execute_single_time_commands(&self.device, &self.command_pool, self.queue, f)
        }
    }

    /// Find a memory type index for an allocation.
    pub fn memory_type_index(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        find_memory_type(&self.properties.memory, type_bits, properties).ok_or(
            GpuError::NoSuitableMemoryType {
                type_bits,
                properties,
            },
        )
    }

    /// Query format properties on the physical device.
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// First candidate supporting `features` with the given tiling.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        select_supported_format(candidates, tiling, features, |format| {
            self.format_properties(format)
        })
    }

    /// Best depth format usable as an optimal-tiling depth/stencil attachment.
    pub fn find_depth_format(&self) -> Result<vk::Format> {
        self.find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .ok_or_else(|| GpuError::FormatNotSupported("no depth attachment format".into()))
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.command_pool.destroy(&self.device);
            self.device.destroy_device(None);
            if let Some(surface) = self.surface.take() {
                self.instance.surface_loader.destroy_surface(surface, None);
            }
        }
        tracing::debug!("Device context destroyed");
    }
}

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Pick the first format whose properties include `features` for `tiling`.
pub fn select_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    query: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = query(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// Queue capabilities every command in this crate may need.
pub const REQUIRED_QUEUE_FLAGS: vk::QueueFlags = vk::QueueFlags::from_raw(
    vk::QueueFlags::GRAPHICS.as_raw()
        | vk::QueueFlags::COMPUTE.as_raw()
        | vk::QueueFlags::TRANSFER.as_raw(),
);

/// Index of the first queue family supporting graphics, compute and transfer together.
///
/// Transfer support is implied by graphics or compute even when a driver
/// omits the bit.
pub fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| {
            let mut flags = family.queue_flags;
            if flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE) {
                flags |= vk::QueueFlags::TRANSFER;
            }
            family.queue_count > 0 && flags.contains(REQUIRED_QUEUE_FLAGS)
        })
        .and_then(|index| u32::try_from(index).ok())
}

/// Builder for creating a [`DeviceContext`].
pub struct DeviceContextBuilder {
    instance: Instance,
    physical_device_index: usize,
    extensions: Vec<&'static CStr>,
    features: DeviceFeatures,
    surface: Option<vk::SurfaceKHR>,
    vsync: bool,
}

impl DeviceContextBuilder {
    /// Create a new builder.
    pub fn new(instance: Instance) -> Self {
        Self {
            instance,
            physical_device_index: 0,
            extensions: Vec::new(),
            features: DeviceFeatures::default(),
            surface: None,
            vsync: true,
        }
    }

    /// Select the physical device by enumeration index.
    pub fn physical_device_index(mut self, index: usize) -> Self {
        self.physical_device_index = index;
        self
    }

    /// Add device extensions.
    pub fn extensions(mut self, extensions: &[&'static CStr]) -> Self {
        self.extensions.extend_from_slice(extensions);
        self
    }

    /// Set the features to enable.
    pub fn features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Attach a presentation surface. The context takes ownership of it.
    pub fn surface(mut self, surface: vk::SurfaceKHR) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Enable or disable vsync.
    pub fn vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Build the device context.
    ///
    /// On failure the surface and the instance are released.
    pub fn build(self) -> Result<DeviceContext> {
        let Self {
            instance,
            physical_device_index,
            mut extensions,
            features,
            surface,
            vsync,
        } = self;

        if surface.is_some() {
            extensions.push(ash::khr::swapchain::NAME);
        }
        extensions.sort_unstable();
        extensions.dedup();

        let parts =
            match unsafe { create_device(&instance, physical_device_index, &extensions, features, surface) } {
                Ok(parts) => parts,
                Err(e) => {
                    if let Some(surface) = surface {
                        unsafe { instance.surface_loader.destroy_surface(surface, None) };
                    }
                    return Err(e);
                }
            };

        let loaders = DeviceLoaders {
            swapchain: extensions
                .contains(&ash::khr::swapchain::NAME)
                .then(|| ash::khr::swapchain::Device::new(&instance.instance, &parts.device)),
            push_descriptor: extensions
                .contains(&ash::khr::push_descriptor::NAME)
                .then(|| ash::khr::push_descriptor::Device::new(&instance.instance, &parts.device)),
        };

        Ok(DeviceContext {
            instance,
            physical_device: parts.physical_device,
            device: parts.device,
            surface,
            properties: parts.properties,
            features,
            queue_family_index: parts.queue_family_index,
            queue: parts.queue,
            command_pool: parts.command_pool,
            loaders,
            vsync,
        })
    }
}

struct DeviceParts {
    physical_device: vk::PhysicalDevice,
    properties: DeviceProperties,
    device: ash::Device,
    queue_family_index: u32,
    queue: vk::Queue,
    command_pool: CommandPool,
}

/// Select the physical device, then create the logical device, queue and command pool.
///
/// # Safety
/// The instance and surface must be valid.
unsafe fn create_device(
    instance: &Instance,
    physical_device_index: usize,
    extensions: &[&'static CStr],
    features: DeviceFeatures,
    surface: Option<vk::SurfaceKHR>,
) -> Result<DeviceParts> {
    let physical_devices = unsafe { instance.instance.enumerate_physical_devices() }
        .vk_context("vkEnumeratePhysicalDevices")?;

    tracing::info!("Physical devices:");
    let mut chosen = None;
    for (i, &physical_device) in physical_devices.iter().enumerate() {
        let properties = unsafe { DeviceProperties::query(&instance.instance, physical_device) }?;
        if i == physical_device_index {
            tracing::info!(" * {} (chosen)", properties.summary());
            chosen = Some((physical_device, properties));
        } else {
            tracing::info!(" * {}", properties.summary());
        }
    }

    let (physical_device, properties) = chosen.ok_or(GpuError::NoSuitableDevice {
        index: physical_device_index,
        count: physical_devices.len(),
    })?;

    if !supports_vulkan_1_3(properties.api_version()) {
        return Err(GpuError::UnsupportedApiVersion {
            device: properties.device_name.clone(),
            major: vk::api_version_major(properties.api_version()),
            minor: vk::api_version_minor(properties.api_version()),
        });
    }

    if let Some(missing) = extensions
        .iter()
        .find(|ext| !properties.supports_extension(ext))
    {
        return Err(GpuError::ExtensionNotSupported(
            missing.to_string_lossy().into_owned(),
        ));
    }

    let families = unsafe {
        instance
            .instance
            .get_physical_device_queue_family_properties(physical_device)
    };
    let queue_family_index = select_queue_family(&families).ok_or(GpuError::NoQueueFamily)?;

    if let Some(surface) = surface {
        let supported = unsafe {
            instance.surface_loader.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .vk_context("vkGetPhysicalDeviceSurfaceSupportKHR")?;
        if !supported {
            return Err(GpuError::PresentNotSupported(queue_family_index));
        }
    }

    let queue_priority = [1.0_f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priority);

    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(features.dynamic_rendering)
        .synchronization2(features.synchronization2);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(features.buffer_device_address)
        .descriptor_indexing(features.descriptor_indexing);

    let base_features =
        vk::PhysicalDeviceFeatures::default().sampler_anisotropy(features.sampler_anisotropy);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(base_features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe {
        instance
            .instance
            .create_device(physical_device, &device_create_info, None)
    }
    .vk_context("vkCreateDevice")?;

    let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

    let command_pool = match unsafe {
        CommandPool::new(
            &device,
            queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    } {
        Ok(pool) => pool,
        Err(e) => {
            unsafe { device.destroy_device(None) };
            return Err(e);
        }
    };

    tracing::info!(
        "Selected GPU: {} ({:?}, Vulkan {}, {} MB VRAM), queue family {}",
        properties.device_name,
        properties.vendor,
        version_string(properties.api_version()),
        properties.device_local_memory_mb(),
        queue_family_index,
    );

    Ok(DeviceParts {
        physical_device,
        properties,
        device,
        queue_family_index,
        queue,
        command_pool,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn queue_family_needs_all_capabilities() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_family(&families), Some(2));
    }

    #[test]
    fn queue_family_graphics_only_is_rejected() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(select_queue_family(&families), None);
    }

    #[test]
    fn queue_family_transfer_is_implied() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        assert_eq!(select_queue_family(&families), Some(0));
    }

    #[test]
    fn queue_family_with_no_queues_is_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        assert_eq!(select_queue_family(&families), Some(1));
    }

    #[test]
    fn required_flags_are_the_union() {
        assert!(REQUIRED_QUEUE_FLAGS.contains(vk::QueueFlags::GRAPHICS));
        assert!(REQUIRED_QUEUE_FLAGS.contains(vk::QueueFlags::COMPUTE));
        assert!(REQUIRED_QUEUE_FLAGS.contains(vk::QueueFlags::TRANSFER));
    }

    #[test]
    fn supported_format_respects_tiling() {
        let query = |format: vk::Format| match format {
            vk::Format::D32_SFLOAT => vk::FormatProperties {
                linear_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            },
            vk::Format::D24_UNORM_S8_UINT => vk::FormatProperties {
                optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            },
            _ => vk::FormatProperties::default(),
        };

        let optimal = select_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            query,
        );
        assert_eq!(optimal, Some(vk::Format::D24_UNORM_S8_UINT));

        let linear = select_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::LINEAR,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            query,
        );
        assert_eq!(linear, Some(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn supported_format_none_when_unsupported() {
        let found = select_supported_format(
            &[vk::Format::R8G8B8A8_UNORM],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
            |_| vk::FormatProperties::default(),
        );
        assert_eq!(found, None);
    }

    #[test]
    fn default_features_enable_everything() {
        let features = DeviceFeatures::default();
        assert!(features.dynamic_rendering);
        assert!(features.synchronization2);
        assert!(features.sampler_anisotropy);
    }
}
