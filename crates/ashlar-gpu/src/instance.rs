//! Vulkan instance creation.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr, CString};

/// Validation layers to enable when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Format a packed Vulkan version as `major.minor.patch`.
pub fn version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

/// Connection to the Vulkan runtime.
///
/// Owns the loader entry, the instance and, when validation is enabled,
/// the debug messenger that forwards layer output to `tracing`.
pub struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) surface_loader: ash::khr::surface::Instance,
    debug: Option<DebugMessenger>,
    api_version: u32,
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    /// Start configuring a new instance.
    pub fn builder() -> InstanceBuilder {
        InstanceBuilder::default()
    }

    /// Get the loader entry.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the surface extension loader.
    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    /// API version requested at creation.
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Whether the debug messenger is installed.
    pub fn validation_enabled(&self) -> bool {
        self.debug.is_some()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating an [`Instance`].
pub struct InstanceBuilder {
    app_name: String,
    api_version: u32,
    extensions: Vec<&'static CStr>,
    enable_validation: bool,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Ashlar".to_string(),
            api_version: vk::API_VERSION_1_3,
            extensions: Vec::new(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl InstanceBuilder {
    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Set the requested API version.
    pub fn api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    /// Add instance extensions.
    pub fn extensions(mut self, extensions: &[&'static CStr]) -> Self {
        self.extensions.extend_from_slice(extensions);
        self
    }

    /// Add the surface extensions a display needs.
    pub fn display_extensions(mut self, display: RawDisplayHandle) -> Result<Self> {
        let names = ash_window::enumerate_required_extensions(display)
            .vk_context("vkEnumerateInstanceExtensionProperties")?;
        for &name in names {
            // SAFETY: ash-window hands out pointers to static, NUL-terminated names.
            self.extensions.push(unsafe { CStr::from_ptr(name) });
        }
        Ok(self)
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the instance.
    pub fn build(self) -> Result<Instance> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::LoaderUnavailable(e.to_string()))?;

        let version = unsafe { entry.try_enumerate_instance_version() }
            .vk_context("vkEnumerateInstanceVersion")?
            .unwrap_or(vk::API_VERSION_1_0);
        tracing::info!("Vulkan instance version {}", version_string(version));

        let app_name = CString::new(self.app_name)
            .map_err(|_| GpuError::InvalidArgument("application name contains NUL".into()))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"Ashlar")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(self.api_version);

        let mut extensions = self.extensions;
        let mut layers = Vec::new();
        if self.enable_validation {
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .vk_context("vkEnumerateInstanceLayerProperties")?;
            for layer in validation_layers() {
                let found = available
                    .iter()
                    .any(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) } == layer);
                if found {
                    layers.push(layer);
                } else {
                    tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
                }
            }
            extensions.push(ash::ext::debug_utils::NAME);
        }

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        let create_flags = {
            extensions.push(ash::khr::portability_enumeration::NAME);
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        };
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        extensions.sort_unstable();
        extensions.dedup();

        let extension_names: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.vk_context("vkCreateInstance")?;

        let debug = if self.enable_validation {
            match unsafe { DebugMessenger::new(&entry, &instance) } {
                Ok(debug) => Some(debug),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        Ok(Instance {
            entry,
            instance,
            surface_loader,
            debug,
            api_version: self.api_version,
        })
    }
}

impl DebugMessenger {
    unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .vk_context("vkCreateDebugUtilsMessengerEXT")?;

        Ok(Self { loader, messenger })
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the layer passes either null or a valid callback data struct.
    let message = unsafe {
        match callback_data.as_ref() {
            Some(data) if !data.p_message.is_null() => CStr::from_ptr(data.p_message).to_string_lossy(),
            _ => Cow::Borrowed("<no message>"),
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "ashlar::validation", ?message_type, "{message}");
    } else {
        tracing::warn!(target: "ashlar::validation", ?message_type, "{message}");
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_formatting() {
        assert_eq!(version_string(vk::API_VERSION_1_3), "1.3.0");
        assert_eq!(version_string(vk::make_api_version(0, 1, 2, 198)), "1.2.198");
    }

    #[test]
    fn builder_defaults() {
        let builder = InstanceBuilder::default();
        assert_eq!(builder.api_version, vk::API_VERSION_1_3);
        assert_eq!(builder.enable_validation, cfg!(debug_assertions));
        assert!(builder.extensions.is_empty());
    }

    #[test]
    fn builder_accumulates_extensions() {
        let builder = Instance::builder()
            .extensions(&[ash::khr::surface::NAME])
            .extensions(&[ash::ext::debug_utils::NAME])
            .validation(false);
        assert_eq!(builder.extensions.len(), 2);
        assert!(!builder.enable_validation);
    }
}
