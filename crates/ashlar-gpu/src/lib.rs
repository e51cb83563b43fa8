//! Vulkan convenience layer over ash.
//!
//! This crate provides:
//! - Instance and device context creation with a single combined queue
//! - Buffer, image, sampler and texture factories with dedicated memory
//! - Dynamic rendering passes
//! - Synchronization2 barrier presets
//! - A swapchain manager handling frames in flight and recreation

pub mod barrier;
pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pass;
pub mod sampler;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use barrier::ImageTransition;
pub use buffer::Buffer;
pub use capabilities::{DeviceProperties, GpuVendor};
pub use context::{DeviceContext, DeviceContextBuilder, DeviceFeatures};
pub use descriptor::{buffer_descriptor_write, image_descriptor_write, update_descriptor_set};
pub use error::{result_name, GpuError, Result};
pub use frame::{FrameLoop, SwapchainState};
pub use image::{Image, ImageDesc};
pub use instance::{Instance, InstanceBuilder};
pub use pass::Pass;
pub use sampler::{Sampler, SamplerDesc};
pub use surface::{create_surface, SurfaceSupport};
pub use swapchain::{FrameSize, Swapchain};
pub use sync::{FrameSlot, FrameSlots, FrameSync};
pub use texture::{mip_level_count, ImageData, Texture, TextureDesc};

pub use ash;
pub use ash::vk;
