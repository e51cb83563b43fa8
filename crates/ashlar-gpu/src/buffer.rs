//! Buffers with dedicated memory and host upload paths.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result, VkResultExt};
use crate::memory;
use ash::vk;
use std::ptr::NonNull;

/// A buffer owning exactly one memory allocation.
///
/// Host-coherent buffers stay persistently mapped for their whole lifetime.
/// A default `Buffer` holds only null handles, which is also the state
/// [`Buffer::destroy`] leaves behind.
#[derive(Debug, Default)]
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub usage: vk::BufferUsageFlags,
    pub properties: vk::MemoryPropertyFlags,
    pub size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

impl Buffer {
    /// Create a buffer and bind freshly allocated memory at offset 0.
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(GpuError::InvalidArgument("buffer size must be non-zero".into()));
        }

        let device = ctx.device();
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer =
            unsafe { device.create_buffer(&create_info, None) }.vk_context("vkCreateBuffer")?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = match memory::allocate(
            ctx,
            &requirements,
            properties,
            usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut this = Self {
            buffer,
            memory,
            usage,
            properties,
            size,
            mapped: None,
        };

        let bound = unsafe { device.bind_buffer_memory(buffer, memory, 0) }
            .vk_context("vkBindBufferMemory")
            .and_then(|()| {
                if properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
                    let ptr = unsafe {
                        device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    }
                    .vk_context("vkMapMemory")?;
                    this.mapped = NonNull::new(ptr.cast::<u8>());
                }
                Ok(())
            });

        if let Err(e) = bound {
            unsafe { this.release(device) };
            return Err(e);
        }

        Ok(this)
    }

    /// Whether the buffer is persistently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Start of the persistent mapping, for host-coherent buffers.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Copy host bytes into the buffer at `offset`.
    ///
    /// Host-coherent buffers are written through their mapping. Anything else
    /// goes through a temporary staging buffer and a one-shot copy, which
    /// blocks until the queue is idle.
    pub fn copy_from_host(&self, ctx: &DeviceContext, data: &[u8], offset: vk::DeviceSize) -> Result<()> {
        check_range(self.size, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        if let Some(mapped) = self.mapped {
            // SAFETY: the mapping covers `size` bytes and the range was checked above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    mapped.as_ptr().add(offset as usize),
                    data.len(),
                );
            }
            return Ok(());
        }

        if !self.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(GpuError::InvalidArgument(
                "non-coherent upload target needs TRANSFER_DST usage".into(),
            ));
        }

        let size = data.len() as vk::DeviceSize;
        let mut staging = Self::new(
            ctx,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let result = staging.copy_from_host(ctx, data, 0).and_then(|()| {
            ctx.one_shot(|cmd| {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: offset,
                    size,
                };
                unsafe {
                    ctx.device()
                        .cmd_copy_buffer(cmd, staging.buffer, self.buffer, &[region]);
                }
            })
        });

        staging.destroy(ctx)?;
        result
    }

    /// Copy a slice of plain-old-data values into the buffer at `offset` bytes.
    pub fn write_pod<T: bytemuck::Pod>(
        &self,
        ctx: &DeviceContext,
        data: &[T],
        offset: vk::DeviceSize,
    ) -> Result<()> {
        self.copy_from_host(ctx, bytemuck::cast_slice(data), offset)
    }

    /// Read `len` bytes starting at `offset` back to the host.
    ///
    /// Non-coherent buffers are read through a host-coherent staging buffer.
    pub fn read_to_host(&self, ctx: &DeviceContext, offset: vk::DeviceSize, len: usize) -> Result<Vec<u8>> {
        check_range(self.size, offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        if let Some(mapped) = self.mapped {
            let mut out = vec![0; len];
            // SAFETY: the mapping covers `size` bytes and the range was checked above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    mapped.as_ptr().add(offset as usize),
                    out.as_mut_ptr(),
                    len,
                );
            }
            return Ok(out);
        }

        if !self.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            return Err(GpuError::InvalidArgument(
                "non-coherent readback source needs TRANSFER_SRC usage".into(),
            ));
        }

        let size = len as vk::DeviceSize;
        let mut staging = Self::new(
            ctx,
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let result = ctx
            .one_shot(|cmd| {
                let region = vk::BufferCopy {
                    src_offset: offset,
                    dst_offset: 0,
                    size,
                };
                unsafe {
                    ctx.device()
                        .cmd_copy_buffer(cmd, self.buffer, staging.buffer, &[region]);
                }
            })
            .and_then(|()| staging.read_to_host(ctx, 0, len));

        staging.destroy(ctx)?;
        result
    }

    /// GPU virtual address, for buffers created with `SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self, ctx: &DeviceContext) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { ctx.device().get_buffer_device_address(&info) }
    }

    /// Descriptor info covering `range` bytes from `offset`.
    pub fn descriptor_info(
        &self,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(offset)
            .range(range)
    }

    /// Wait for the device to go idle, then unmap, free and destroy the buffer.
    ///
    /// Leaves `self` in its default (all-null) state. Destroying an already
    /// destroyed buffer is a no-op.
    pub fn destroy(&mut self, ctx: &DeviceContext) -> Result<()> {
        if self.buffer == vk::Buffer::null() && self.memory == vk::DeviceMemory::null() {
            return Ok(());
        }
        ctx.wait_idle()?;
        unsafe { self.release(ctx.device()) };
        Ok(())
    }

    /// # Safety
    /// No pending GPU work may reference the buffer.
    unsafe fn release(&mut self, device: &ash::Device) {
        unsafe {
            if self.mapped.take().is_some() {
                device.unmap_memory(self.memory);
            }
            device.free_memory(self.memory, None);
            device.destroy_buffer(self.buffer, None);
        }
        *self = Self::default();
    }
}

/// Check that `len` bytes at `offset` fit inside a buffer of `size` bytes.
pub(crate) fn check_range(size: vk::DeviceSize, offset: vk::DeviceSize, len: usize) -> Result<()> {
    let end = offset.checked_add(len as vk::DeviceSize);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(GpuError::InvalidArgument(format!(
            "range {offset}..+{len} exceeds buffer size {size}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_buffer_is_null() {
        let buffer = Buffer::default();
        assert_eq!(buffer.buffer, vk::Buffer::null());
        assert_eq!(buffer.memory, vk::DeviceMemory::null());
        assert_eq!(buffer.size, 0);
        assert!(buffer.usage.is_empty());
        assert!(!buffer.is_mapped());
    }

    #[test]
    fn range_inside_buffer() {
        assert!(check_range(256, 0, 256).is_ok());
        assert!(check_range(256, 128, 128).is_ok());
        assert!(check_range(256, 256, 0).is_ok());
    }

    #[test]
    fn range_past_end_is_rejected() {
        assert!(check_range(256, 129, 128).is_err());
        assert!(check_range(256, 0, 257).is_err());
        assert!(check_range(256, u64::MAX, 1).is_err());
    }

    #[test]
    fn descriptor_info_covers_range() {
        let buffer = Buffer {
            size: 1024,
            ..Default::default()
        };
        let info = buffer.descriptor_info(64, 128);
        assert_eq!(info.offset, 64);
        assert_eq!(info.range, 128);
    }
}
