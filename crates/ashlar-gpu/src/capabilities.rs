//! Physical device properties.

use crate::error::{Result, VkResultExt};
use crate::instance::version_string;
use ash::vk;
use std::collections::HashSet;
use std::ffi::{c_char, CStr};

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Check that a packed API version is at least 1.3.
pub fn supports_vulkan_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    major > 1 || (major == 1 && minor >= 3)
}

/// Properties of the selected physical device, queried once at device creation.
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Driver name reported by the ICD
    pub driver_name: String,
    /// Driver version string reported by the ICD
    pub driver_info: String,
    /// Core properties, including limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory: vk::PhysicalDeviceMemoryProperties,
    /// Ray tracing pipeline properties, if the extension is available
    pub ray_tracing_pipeline: Option<vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static>>,
    /// Device extensions the driver exposes
    pub available_extensions: HashSet<String>,
}

impl DeviceProperties {
    /// Query properties from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .vk_context("vkEnumerateDeviceExtensionProperties")?;
        let available_extensions: HashSet<String> = extensions
            .iter()
            .map(|ext| unsafe { c_string(&ext.extension_name) })
            .collect();

        let has_ray_tracing = available_extensions
            .contains(&ash::khr::ray_tracing_pipeline::NAME.to_string_lossy().into_owned());

        let mut driver = vk::PhysicalDeviceDriverProperties::default();
        let mut ray_tracing = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut driver);
        if has_ray_tracing {
            properties2 = properties2.push_next(&mut ray_tracing);
        }
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        let properties = properties2.properties;

        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        // The chain pointers refer to locals; drop them before storing.
        ray_tracing.p_next = std::ptr::null_mut();

        Ok(Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: unsafe { c_string(&properties.device_name) },
            driver_name: unsafe { c_string(&driver.driver_name) },
            driver_info: unsafe { c_string(&driver.driver_info) },
            properties,
            memory,
            ray_tracing_pipeline: has_ray_tracing.then_some(ray_tracing),
            available_extensions,
        })
    }

    /// Vulkan API version the device supports.
    pub fn api_version(&self) -> u32 {
        self.properties.api_version
    }

    /// Device limits.
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    /// Check whether a device extension is available.
    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.available_extensions
            .contains(name.to_string_lossy().as_ref())
    }

    /// Total device-local memory in MB.
    pub fn device_local_memory_mb(&self) -> u64 {
        self.memory
            .memory_heaps
            .iter()
            .take(self.memory.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum()
    }

    /// One-line description used when listing devices.
    pub fn summary(&self) -> String {
        format!(
            "{}, driver: {} {}, Vulkan {}",
            self.device_name,
            self.driver_name,
            self.driver_info,
            version_string(self.api_version()),
        )
    }
}

/// Read a fixed-size, NUL-terminated name array.
///
/// # Safety
/// The array must contain a NUL terminator.
unsafe fn c_string(raw: &[c_char]) -> String {
    unsafe { CStr::from_ptr(raw.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> [c_char; vk::MAX_PHYSICAL_DEVICE_NAME_SIZE] {
        let mut raw = [0; vk::MAX_PHYSICAL_DEVICE_NAME_SIZE];
        for (dst, src) in raw.iter_mut().zip(name.bytes()) {
            *dst = src as c_char;
        }
        raw
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn api_version_gate() {
        assert!(supports_vulkan_1_3(vk::API_VERSION_1_3));
        assert!(supports_vulkan_1_3(vk::make_api_version(0, 1, 4, 0)));
        assert!(supports_vulkan_1_3(vk::make_api_version(0, 2, 0, 0)));
        assert!(!supports_vulkan_1_3(vk::API_VERSION_1_2));
    }

    #[test]
    fn fixed_name_arrays() {
        let raw = named("llvmpipe");
        assert_eq!(unsafe { c_string(&raw) }, "llvmpipe");
    }

    #[test]
    fn summary_lists_driver_and_version() {
        let mut memory = vk::PhysicalDeviceMemoryProperties::default();
        memory.memory_heap_count = 2;
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 4096 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_heaps[1] = vk::MemoryHeap {
            size: 1024 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::empty(),
        };

        let props = DeviceProperties {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            driver_name: "radv".to_string(),
            driver_info: "Mesa 24.0".to_string(),
            properties: vk::PhysicalDeviceProperties {
                api_version: vk::make_api_version(0, 1, 3, 275),
                ..Default::default()
            },
            memory,
            ray_tracing_pipeline: None,
            available_extensions: HashSet::from(["VK_KHR_swapchain".to_string()]),
        };

        assert_eq!(props.summary(), "Test GPU, driver: radv Mesa 24.0, Vulkan 1.3.275");
        assert_eq!(props.device_local_memory_mb(), 4096);
        assert!(props.supports_extension(ash::khr::swapchain::NAME));
        assert!(!props.supports_extension(ash::khr::push_descriptor::NAME));
    }
}
