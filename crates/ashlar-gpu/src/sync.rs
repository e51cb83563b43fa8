//! Synchronization primitives.

use crate::command::CommandPool;
use crate::error::{Result, VkResultExt};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    unsafe { device.create_semaphore(&create_info, None) }.vk_context("vkCreateSemaphore")
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    unsafe { device.create_fence(&create_info, None) }.vk_context("vkCreateFence")
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    unsafe { device.wait_for_fences(&[fence], true, timeout_ns) }.vk_context("vkWaitForFences")
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence]) }.vk_context("vkResetFences")
}

/// Synchronization objects of one frame slot.
pub struct FrameSync {
    /// Semaphore signaled when the acquired image is available
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when the slot's commands have finished
    pub render_finished: vk::Semaphore,
    /// Fence signaled when the slot's submission completes
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    ///
    /// The fence starts signaled so the first wait on a fresh slot returns at once.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        unsafe {
            Ok(Self {
                image_available: create_semaphore(device)?,
                render_finished: create_semaphore(device)?,
                in_flight: create_fence(device, true)?,
            })
        }
    }

    /// Wait until the slot's previous submission has completed.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe { wait_for_fence(device, self.in_flight, u64::MAX) }
    }

    /// Reset the fence for the next submission.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe { reset_fence(device, self.in_flight) }
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

/// One frame-in-flight slot: a command buffer plus its sync objects.
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
}

/// The full frame synchronization set, one entry per frame in flight.
#[derive(Default)]
pub struct FrameSlots {
    slots: Vec<FrameSlot>,
}

impl FrameSlots {
    /// Create `count` slots.
    ///
    /// # Safety
    /// The device must be valid and the pool must belong to it.
    pub unsafe fn new(device: &ash::Device, pool: &CommandPool, count: usize) -> Result<Self> {
        let count_u32 = u32::try_from(count).unwrap_or(u32::MAX);
        let command_buffers = unsafe { pool.allocate_command_buffers(device, count_u32) }?;

        let mut slots = Self {
            slots: Vec::with_capacity(count),
        };
        for (i, &command_buffer) in command_buffers.iter().enumerate() {
            match unsafe { FrameSync::new(device) } {
                Ok(sync) => slots.slots.push(FrameSlot {
                    command_buffer,
                    sync,
                }),
                Err(e) => {
                    unsafe {
                        slots.destroy(device, pool);
                        pool.free_command_buffers(device, &command_buffers[i..]);
                    }
                    return Err(e);
                }
            }
        }

        Ok(slots)
    }

    /// Get a slot by index.
    pub fn get(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slots exist.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Command buffers of all slots, in slot order.
    pub fn command_buffers(&self) -> Vec<vk::CommandBuffer> {
        self.slots.iter().map(|slot| slot.command_buffer).collect()
    }

    /// Destroy all slots and return their command buffers to the pool.
    ///
    /// # Safety
    /// The device must be idle with respect to these slots.
    pub unsafe fn destroy(&mut self, device: &ash::Device, pool: &CommandPool) {
        let command_buffers = self.command_buffers();
        unsafe {
            for slot in &self.slots {
                slot.sync.destroy(device);
            }
            pool.free_command_buffers(device, &command_buffers);
        }
        self.slots.clear();
    }
}
