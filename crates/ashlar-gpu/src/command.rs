//! Command buffer management.

use crate::error::{Result, VkResultExt};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None) }
            .vk_context("vkCreateCommandPool")?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffer(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let buffers = unsafe { self.allocate_command_buffers(device, 1) }?;
        Ok(buffers[0])
    }

    /// Allocate multiple primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { device.allocate_command_buffers(&alloc_info) }
            .vk_context("vkAllocateCommandBuffers")
    }

    /// Return command buffers to the pool.
    ///
    /// # Safety
    /// The buffers must come from this pool and must not be pending execution.
    pub unsafe fn free_command_buffers(&self, device: &ash::Device, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { device.free_command_buffers(self.pool, buffers) };
        }
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    unsafe { device.begin_command_buffer(cmd, &begin_info) }.vk_context("vkBeginCommandBuffer")
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd) }.vk_context("vkEndCommandBuffer")
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    unsafe { device.queue_submit(queue, &[submit_info], fence) }.vk_context("vkQueueSubmit")
}

/// Allocate a command buffer and begin it for one-time submission.
///
/// Pair with [`end_one_shot`].
///
/// # Safety
/// The device must be valid.
pub unsafe fn begin_one_shot(device: &ash::Device, pool: &CommandPool) -> Result<vk::CommandBuffer> {
    let cmd = unsafe { pool.allocate_command_buffer(device) }?;
    if let Err(e) = unsafe {
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    } {
        unsafe { pool.free_command_buffers(device, &[cmd]) };
        return Err(e);
    }
    Ok(cmd)
}

/// End, submit and free a command buffer from [`begin_one_shot`].
///
/// Blocks until the queue is idle. Not meant for per-frame work.
///
/// # Safety
/// All handles must be valid and `cmd` must come from `pool`.
pub unsafe fn end_one_shot(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
) -> Result<()> {
    let result = unsafe {
        end_command_buffer(device, cmd).and_then(|()| {
            submit_command_buffers(device, queue, &[cmd], &[], &[], &[], vk::Fence::null())
        })
    }
    .and_then(|()| unsafe { device.queue_wait_idle(queue) }.vk_context("vkQueueWaitIdle"));

    unsafe { pool.free_command_buffers(device, &[cmd]) };
    result
}

/// Record and execute a one-shot command buffer, waiting for completion.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn execute_single_time_commands<F>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let cmd = unsafe { begin_one_shot(device, pool) }?;
    f(cmd);
    unsafe { end_one_shot(device, pool, queue, cmd) }
}
