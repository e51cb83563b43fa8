//! Descriptor write helpers.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use ash::vk;

/// Write of a single buffer descriptor. `dst_set` is left null for push descriptors.
pub fn buffer_descriptor_write(
    binding: u32,
    descriptor_type: vk::DescriptorType,
    info: &vk::DescriptorBufferInfo,
) -> vk::WriteDescriptorSet<'_> {
    vk::WriteDescriptorSet::default()
        .dst_binding(binding)
        .descriptor_type(descriptor_type)
        .buffer_info(std::slice::from_ref(info))
}

/// Write of a single image descriptor. `dst_set` is left null for push descriptors.
pub fn image_descriptor_write(
    binding: u32,
    descriptor_type: vk::DescriptorType,
    info: &vk::DescriptorImageInfo,
) -> vk::WriteDescriptorSet<'_> {
    vk::WriteDescriptorSet::default()
        .dst_binding(binding)
        .descriptor_type(descriptor_type)
        .image_info(std::slice::from_ref(info))
}

/// Point every write at `set` and apply them.
pub fn update_descriptor_set(
    ctx: &DeviceContext,
    set: vk::DescriptorSet,
    writes: &[vk::WriteDescriptorSet<'_>],
) {
    let writes: Vec<_> = writes.iter().map(|w| w.dst_set(set)).collect();
    unsafe { ctx.device().update_descriptor_sets(&writes, &[]) };
}

/// Record the writes as push descriptors for `set` of `layout`.
///
/// Needs the device to be built with `VK_KHR_push_descriptor`.
///
/// # Safety
/// `cmd` must be recording and the written resources must outlive its execution.
pub unsafe fn push_descriptor_set(
    ctx: &DeviceContext,
    cmd: vk::CommandBuffer,
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
    set: u32,
    writes: &[vk::WriteDescriptorSet<'_>],
) -> Result<()> {
    let loader = ctx
        .loaders()
        .push_descriptor
        .as_ref()
        .ok_or(GpuError::NotInitialized("push descriptor extension"))?;
    unsafe { loader.cmd_push_descriptor_set(cmd, bind_point, layout, set, writes) };
    Ok(())
}
