//! GPU error types.

use ash::prelude::VkResult;
use ash::vk;
use std::panic::Location;
use thiserror::Error;

/// GPU-related errors.
///
/// Every variant is fatal for the object being built. Presentation staleness
/// (out-of-date or suboptimal surfaces) never shows up here; the swapchain
/// recovers from it internally.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A Vulkan call returned a failure code.
    #[error("{call} failed with {name} at {location}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
        name: &'static str,
        location: &'static Location<'static>,
    },

    /// The Vulkan loader could not be opened.
    #[error("Vulkan loader unavailable: {0}")]
    LoaderUnavailable(String),

    /// No physical device at the requested index.
    #[error("No suitable GPU found (index {index}, {count} device(s) present)")]
    NoSuitableDevice { index: usize, count: usize },

    /// The selected device does not support Vulkan 1.3.
    #[error("Device {device} only supports Vulkan {major}.{minor}, 1.3 is required")]
    UnsupportedApiVersion {
        device: String,
        major: u32,
        minor: u32,
    },

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// No queue family supports graphics, compute and transfer together.
    #[error("No queue family supports graphics, compute and transfer")]
    NoQueueFamily,

    /// The chosen queue family cannot present to the surface.
    #[error("Queue family {0} cannot present to the surface")]
    PresentNotSupported(u32),

    /// No memory type satisfies the requirement mask and property flags.
    #[error("No memory type matches bits {type_bits:#x} with {properties:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// Format lacks the requested features.
    #[error("Format not supported: {0}")]
    FormatNotSupported(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// A prerequisite object has not been created.
    #[error("Not initialized: {0}")]
    NotInitialized(&'static str),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Image decoding failed.
    #[error("Image decoding failed: {0}")]
    Image(#[from] image::ImageError),
}

impl GpuError {
    /// Build a [`GpuError::Vulkan`] tagged with the caller's location.
    #[track_caller]
    pub fn vulkan(call: &'static str, result: vk::Result) -> Self {
        Self::Vulkan {
            call,
            result,
            name: result_name(result),
            location: Location::caller(),
        }
    }

    /// The raw Vulkan result, if this error came from a Vulkan call.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan { result, .. } => Some(*result),
            _ => None,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Attach the failing call name to a raw [`VkResult`].
pub(crate) trait VkResultExt<T> {
    fn vk_context(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    #[track_caller]
    fn vk_context(self, call: &'static str) -> Result<T> {
        let location = Location::caller();
        self.map_err(|result| GpuError::Vulkan {
            call,
            result,
            name: result_name(result),
            location,
        })
    }
}

const RESULT_NAMES: &[(vk::Result, &str)] = &[
    (vk::Result::SUCCESS, "VK_SUCCESS"),
    (vk::Result::NOT_READY, "VK_NOT_READY"),
    (vk::Result::TIMEOUT, "VK_TIMEOUT"),
    (vk::Result::EVENT_SET, "VK_EVENT_SET"),
    (vk::Result::EVENT_RESET, "VK_EVENT_RESET"),
    (vk::Result::INCOMPLETE, "VK_INCOMPLETE"),
    (vk::Result::ERROR_OUT_OF_HOST_MEMORY, "VK_ERROR_OUT_OF_HOST_MEMORY"),
    (vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, "VK_ERROR_OUT_OF_DEVICE_MEMORY"),
    (vk::Result::ERROR_INITIALIZATION_FAILED, "VK_ERROR_INITIALIZATION_FAILED"),
    (vk::Result::ERROR_DEVICE_LOST, "VK_ERROR_DEVICE_LOST"),
    (vk::Result::ERROR_MEMORY_MAP_FAILED, "VK_ERROR_MEMORY_MAP_FAILED"),
    (vk::Result::ERROR_LAYER_NOT_PRESENT, "VK_ERROR_LAYER_NOT_PRESENT"),
    (vk::Result::ERROR_EXTENSION_NOT_PRESENT, "VK_ERROR_EXTENSION_NOT_PRESENT"),
    (vk::Result::ERROR_FEATURE_NOT_PRESENT, "VK_ERROR_FEATURE_NOT_PRESENT"),
    (vk::Result::ERROR_INCOMPATIBLE_DRIVER, "VK_ERROR_INCOMPATIBLE_DRIVER"),
    (vk::Result::ERROR_TOO_MANY_OBJECTS, "VK_ERROR_TOO_MANY_OBJECTS"),
    (vk::Result::ERROR_FORMAT_NOT_SUPPORTED, "VK_ERROR_FORMAT_NOT_SUPPORTED"),
    (vk::Result::ERROR_FRAGMENTED_POOL, "VK_ERROR_FRAGMENTED_POOL"),
    (vk::Result::ERROR_UNKNOWN, "VK_ERROR_UNKNOWN"),
    (vk::Result::ERROR_OUT_OF_POOL_MEMORY, "VK_ERROR_OUT_OF_POOL_MEMORY"),
    (vk::Result::ERROR_INVALID_EXTERNAL_HANDLE, "VK_ERROR_INVALID_EXTERNAL_HANDLE"),
    (vk::Result::ERROR_FRAGMENTATION, "VK_ERROR_FRAGMENTATION"),
    (
        vk::Result::ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS,
        "VK_ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS",
    ),
    (vk::Result::PIPELINE_COMPILE_REQUIRED, "VK_PIPELINE_COMPILE_REQUIRED"),
    (vk::Result::ERROR_SURFACE_LOST_KHR, "VK_ERROR_SURFACE_LOST_KHR"),
    (
        vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR,
        "VK_ERROR_NATIVE_WINDOW_IN_USE_KHR",
    ),
    (vk::Result::SUBOPTIMAL_KHR, "VK_SUBOPTIMAL_KHR"),
    (vk::Result::ERROR_OUT_OF_DATE_KHR, "VK_ERROR_OUT_OF_DATE_KHR"),
    (
        vk::Result::ERROR_INCOMPATIBLE_DISPLAY_KHR,
        "VK_ERROR_INCOMPATIBLE_DISPLAY_KHR",
    ),
    (vk::Result::ERROR_VALIDATION_FAILED_EXT, "VK_ERROR_VALIDATION_FAILED_EXT"),
    (vk::Result::ERROR_INVALID_SHADER_NV, "VK_ERROR_INVALID_SHADER_NV"),
    (
        vk::Result::ERROR_INVALID_DRM_FORMAT_MODIFIER_PLANE_LAYOUT_EXT,
        "VK_ERROR_INVALID_DRM_FORMAT_MODIFIER_PLANE_LAYOUT_EXT",
    ),
    (
        vk::Result::ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT,
        "VK_ERROR_FULL_SCREEN_EXCLUSIVE_MODE_LOST_EXT",
    ),
    (vk::Result::THREAD_IDLE_KHR, "VK_THREAD_IDLE_KHR"),
    (vk::Result::THREAD_DONE_KHR, "VK_THREAD_DONE_KHR"),
    (vk::Result::OPERATION_DEFERRED_KHR, "VK_OPERATION_DEFERRED_KHR"),
    (vk::Result::OPERATION_NOT_DEFERRED_KHR, "VK_OPERATION_NOT_DEFERRED_KHR"),
];

/// Symbolic name of a Vulkan result code, for diagnostics only.
pub fn result_name(result: vk::Result) -> &'static str {
    RESULT_NAMES
        .iter()
        .find(|(code, _)| *code == result)
        .map_or("VK_UNKNOWN_RESULT", |&(_, name)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_results_have_names() {
        assert_eq!(result_name(vk::Result::SUCCESS), "VK_SUCCESS");
        assert_eq!(
            result_name(vk::Result::ERROR_OUT_OF_DATE_KHR),
            "VK_ERROR_OUT_OF_DATE_KHR"
        );
        assert_eq!(result_name(vk::Result::SUBOPTIMAL_KHR), "VK_SUBOPTIMAL_KHR");
    }

    #[test]
    fn unknown_result_falls_back() {
        assert_eq!(
            result_name(vk::Result::from_raw(-123_456)),
            "VK_UNKNOWN_RESULT"
        );
    }

    #[test]
    fn name_table_has_no_duplicate_codes() {
        for (i, (code, _)) in RESULT_NAMES.iter().enumerate() {
            assert!(
                RESULT_NAMES[i + 1..].iter().all(|(other, _)| other != code),
                "duplicate entry for {code:?}"
            );
        }
    }

    #[test]
    fn vulkan_error_reports_call_and_name() {
        let err = Err::<(), _>(vk::Result::ERROR_DEVICE_LOST)
            .vk_context("vkQueueSubmit")
            .unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));

        let message = err.to_string();
        assert!(message.starts_with("vkQueueSubmit failed with VK_ERROR_DEVICE_LOST at "));
        assert!(message.contains("error.rs"));
    }

    #[test]
    fn memory_type_error_message() {
        let err = GpuError::NoSuitableMemoryType {
            type_bits: 0b1010,
            properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        insta::assert_snapshot!(err.to_string(), @"No memory type matches bits 0xa with HOST_VISIBLE");
    }
}
