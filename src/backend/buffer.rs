// Host-visible buffers
//
// Each Buffer is a fixed-capacity block of HOST_VISIBLE | HOST_COHERENT
// memory mapped once at creation. Writes go straight through the mapped
// pointer; coherent memory needs no flush. Nothing here synchronizes with
// the GPU, callers write only while the device is idle.

use anyhow::Result;
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

use super::VulkanContext;
use crate::error::{RendererError, VkResultExt};

const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// First memory type allowed by `type_bits` whose flags contain `flags`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32, RendererError> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let allowed = type_bits & (1 << i) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
        .ok_or(RendererError::NoSuitableMemoryType { type_bits, flags })
}

/// A mapped byte range. Bounds are enforced on every access; the pointer is
/// never handed out.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    capacity: usize,
}

impl MappedRegion {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `capacity` bytes for as
    /// long as the region exists, and nothing else may alias it.
    pub unsafe fn new(ptr: *mut u8, capacity: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `bytes` to `offset`. Writing past the end is a caller bug and
    /// panics instead of corrupting neighbouring memory.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.capacity);
        assert!(
            end.is_some(),
            "write of {} bytes at offset {} exceeds capacity {}",
            bytes.len(),
            offset,
            self.capacity
        );

        // SAFETY: the range was bounds-checked above and `new` guarantees the
        // mapping covers `capacity` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
    }

    #[cfg(test)]
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        let end = offset.checked_add(len).filter(|&end| end <= self.capacity);
        assert!(
            end.is_some(),
            "read of {} bytes at offset {} exceeds capacity {}",
            len,
            offset,
            self.capacity
        );

        // SAFETY: bounds-checked above, mapping outlives `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }
}

/// GPU buffer with its own persistently mapped allocation
pub struct Buffer {
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    region: MappedRegion,
    context: Arc<VulkanContext>,
}

impl Buffer {
    /// Create a buffer of exactly `size` bytes for `usage` and map it
    pub fn allocate(
        context: Arc<VulkanContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let device = &context.device;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.create_buffer(&buffer_info, None) }.vk("vkCreateBuffer")?;

        // From here on a failure must release what was already created
        let memory = match Self::allocate_and_bind(&context, handle) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        let mapped = unsafe { device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) }
            .vk("vkMapMemory");

        // SAFETY: the mapping spans `size` bytes and stays valid until the
        // memory is freed in Drop.
        let region = mapped
            .map_err(anyhow::Error::from)
            .and_then(|ptr| {
                unsafe { MappedRegion::new(ptr.cast(), size as usize) }
                    .ok_or_else(|| anyhow::anyhow!("vkMapMemory returned a null pointer"))
            });

        let region = match region {
            Ok(region) => region,
            Err(e) => {
                unsafe {
                    device.free_memory(memory, None);
                    device.destroy_buffer(handle, None);
                }
                return Err(e);
            }
        };

        log::debug!("Allocated {} byte buffer ({:?})", size, usage);

        Ok(Self {
            handle,
            memory,
            region,
            context,
        })
    }

    fn allocate_and_bind(context: &VulkanContext, buffer: vk::Buffer) -> Result<vk::DeviceMemory> {
        let device = &context.device;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = find_memory_type(
            &context.memory_properties,
            requirements.memory_type_bits,
            HOST_MEMORY,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.allocate_memory(&alloc_info, None) }.vk("vkAllocateMemory")?;

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) }.vk("vkBindBufferMemory") {
            unsafe { device.free_memory(memory, None) };
            return Err(e.into());
        }

        Ok(memory)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.region.write(offset, bytes);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Freeing the memory implicitly unmaps it
        unsafe {
            self.context.device.free_memory(self.memory, None);
            self.context.device.destroy_buffer(self.handle, None);
        }
    }
}
