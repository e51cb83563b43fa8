//! Device memory helpers shared by the resource factories.

use crate::context::DeviceContext;
use crate::error::{Result, VkResultExt};
use ash::vk;

/// First memory type allowed by `type_bits` whose flags include `properties`.
///
/// No scoring: the lowest matching index wins.
pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = memory.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count).find(|&i| {
        type_bits & (1 << i) != 0
            && memory.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

/// Round `value` up to a multiple of `alignment`, which must be a power of two.
pub const fn align_to(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Allocate memory satisfying `requirements`.
///
/// `device_address` chains the allocate flag needed by buffers created with
/// `SHADER_DEVICE_ADDRESS` usage.
pub(crate) fn allocate(
    ctx: &DeviceContext,
    requirements: &vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
    device_address: bool,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = ctx.memory_type_index(requirements.memory_type_bits, properties)?;

    let mut flags_info =
        vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let mut alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    if device_address {
        alloc_info = alloc_info.push_next(&mut flags_info);
    }

    unsafe { ctx.device().allocate_memory(&alloc_info, None) }.vk_context("vkAllocateMemory")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in memory.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        memory
    }

    #[test]
    fn first_matching_type_wins() {
        let memory = memory_with(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&memory, 0b111, host), Some(1));
        assert_eq!(
            find_memory_type(&memory, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn type_bits_filter_candidates() {
        let memory = memory_with(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&memory, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&memory, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn missing_properties_yield_none() {
        let memory = memory_with(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            find_memory_type(&memory, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_to(0, 256), 0);
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 64), 320);
    }
}
