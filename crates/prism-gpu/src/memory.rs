//! GPU memory management.
//!
//! Buffers are backed by dedicated host-visible, host-coherent allocations.
//! That keeps uploads to a single map/copy/unmap and is fine for the handful
//! of small buffers a frame needs; it is not meant for large device-resident
//! data.

use crate::error::{GpuError, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::c_void;
use std::ptr::NonNull;

/// Memory properties every buffer allocation must have.
pub const HOST_MEMORY_FLAGS: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// The subset of device calls used to create, fill and destroy buffers.
///
/// Implemented for [`ash::Device`]; tests substitute a host-memory fake.
pub trait MemoryDevice {
    /// # Safety
    /// Same contract as `vkCreateBuffer`.
    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer>;

    /// # Safety
    /// `buffer` must be a live buffer of this device.
    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    /// # Safety
    /// Same contract as `vkAllocateMemory`.
    unsafe fn allocate_memory(
        &self,
        info: &vk::MemoryAllocateInfo<'_>,
    ) -> VkResult<vk::DeviceMemory>;

    /// # Safety
    /// Both handles must belong to this device and `buffer` must be unbound.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// # Safety
    /// `memory` must be host-visible and not currently mapped.
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void>;

    /// # Safety
    /// `memory` must be currently mapped.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// # Safety
    /// `buffer` must not be in use by the device.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// # Safety
    /// `memory` must not be in use by the device or mapped.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);
}

impl MemoryDevice for ash::Device {
    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        ash::Device::create_buffer(self, info, None)
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        self.get_buffer_memory_requirements(buffer)
    }

    unsafe fn allocate_memory(
        &self,
        info: &vk::MemoryAllocateInfo<'_>,
    ) -> VkResult<vk::DeviceMemory> {
        ash::Device::allocate_memory(self, info, None)
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        ash::Device::bind_buffer_memory(self, buffer, memory, offset)
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        ash::Device::map_memory(self, memory, offset, size, vk::MemoryMapFlags::empty())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        ash::Device::unmap_memory(self, memory);
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        ash::Device::destroy_buffer(self, buffer, None);
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        ash::Device::free_memory(self, memory, None);
    }
}

/// Find the first memory type allowed by `type_filter` that has all `required` flags.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    memory_properties
        .memory_types
        .iter()
        .take(memory_properties.memory_type_count as usize)
        .zip(0u32..)
        .find(|&(memory_type, index)| {
            type_filter & (1 << index) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(_, index)| index)
        .ok_or(GpuError::NoSuitableMemoryType {
            type_filter,
            required,
        })
}

/// Create a buffer backed by its own host-visible, host-coherent allocation.
///
/// When `initial_data` is given it is copied into the start of the buffer
/// with a single map/unmap. If no compatible memory type exists the buffer is
/// destroyed before anything is allocated.
///
/// # Safety
/// `device` must be valid and `memory_properties` must describe its physical device.
pub unsafe fn create_buffer<D: MemoryDevice + ?Sized>(
    device: &D,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    initial_data: Option<&[u8]>,
) -> Result<GpuBuffer> {
    if let Some(data) = initial_data {
        if data.len() as u64 > size {
            return Err(GpuError::InvalidState(format!(
                "Initial data ({} bytes) larger than buffer ({size} bytes)",
                data.len()
            )));
        }
    }

    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = device.create_buffer(&buffer_info)?;
    let requirements = device.buffer_memory_requirements(buffer);

    let memory_type_index = match find_memory_type(
        memory_properties,
        requirements.memory_type_bits,
        HOST_MEMORY_FLAGS,
    ) {
        Ok(index) => index,
        Err(e) => {
            device.destroy_buffer(buffer);
            return Err(e);
        }
    };

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = match device.allocate_memory(&alloc_info) {
        Ok(memory) => memory,
        Err(e) => {
            device.destroy_buffer(buffer);
            return Err(GpuError::from(e));
        }
    };

    let gpu_buffer = GpuBuffer {
        buffer,
        memory,
        size,
        allocation_size: requirements.size,
        usage,
    };

    let filled = device
        .bind_buffer_memory(buffer, memory, 0)
        .map_err(GpuError::from)
        .and_then(|()| match initial_data {
            Some(data) => gpu_buffer.map(device)?.write_bytes(0, data),
            None => Ok(()),
        });

    if let Err(e) = filled {
        gpu_buffer.destroy(device);
        return Err(e);
    }

    tracing::debug!(
        "Created buffer: {size} bytes, usage {usage:?}, memory type {memory_type_index}"
    );

    Ok(gpu_buffer)
}

/// A buffer and the memory bound to it at offset 0.
#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    /// Size requested for the buffer.
    pub size: vk::DeviceSize,
    /// Size of the backing allocation (may exceed `size`).
    pub allocation_size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

impl GpuBuffer {
    /// Map the whole allocation. The mapping is released when the guard drops.
    ///
    /// # Safety
    /// `device` must own this buffer and the memory must not already be mapped.
    pub unsafe fn map<'a, D: MemoryDevice + ?Sized>(
        &self,
        device: &'a D,
    ) -> Result<MappedMemory<'a, D>> {
        MappedMemory::new(device, self.memory, self.allocation_size)
    }

    /// Copy `data` to the start of the buffer.
    ///
    /// # Safety
    /// `device` must own this buffer and the device must not be reading it.
    pub unsafe fn write<T: bytemuck::Pod, D: MemoryDevice + ?Sized>(
        &self,
        device: &D,
        data: &[T],
    ) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > self.size {
            return Err(GpuError::InvalidState(format!(
                "Data ({} bytes) too large for buffer ({} bytes)",
                bytes.len(),
                self.size
            )));
        }
        self.map(device)?.write_bytes(0, bytes)
    }

    /// Read the buffer's `size` bytes back to the host.
    ///
    /// # Safety
    /// `device` must own this buffer and the device must not be writing it.
    pub unsafe fn read_bytes<D: MemoryDevice + ?Sized>(&self, device: &D) -> Result<Vec<u8>> {
        let mapped = self.map(device)?;
        Ok(mapped.as_slice()[..self.size as usize].to_vec())
    }

    /// Destroy the buffer and free its memory.
    ///
    /// # Safety
    /// `device` must own this buffer and it must not be in use.
    pub unsafe fn destroy<D: MemoryDevice + ?Sized>(&self, device: &D) {
        device.destroy_buffer(self.buffer);
        device.free_memory(self.memory);
    }
}

/// A live host mapping of device memory, unmapped on drop.
pub struct MappedMemory<'a, D: MemoryDevice + ?Sized> {
    device: &'a D,
    memory: vk::DeviceMemory,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a, D: MemoryDevice + ?Sized> MappedMemory<'a, D> {
    /// # Safety
    /// `memory` must be host-visible, at least `len` bytes, and not mapped.
    unsafe fn new(device: &'a D, memory: vk::DeviceMemory, len: vk::DeviceSize) -> Result<Self> {
        let ptr = device.map_memory(memory, 0, len)?;
        let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
            device.unmap_memory(memory);
            return Err(GpuError::InvalidState(
                "Memory mapping returned null".to_string(),
            ));
        };

        Ok(Self {
            device,
            memory,
            ptr,
            len: len as usize,
        })
    }

    /// Length of the mapped range in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping covers `len` bytes and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The mapped bytes, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping covers `len` bytes and `&mut self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Write raw bytes at the given offset.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.len {
            return Err(GpuError::InvalidState(
                "Data range too large for mapping".to_string(),
            ));
        }
        self.as_mut_slice()[offset..end].copy_from_slice(data);
        Ok(())
    }
}

impl<D: MemoryDevice + ?Sized> Drop for MappedMemory<'_, D> {
    fn drop(&mut self) {
        // SAFETY: `new` mapped this memory and nothing else unmaps it.
        unsafe { self.device.unmap_memory(self.memory) };
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Host-memory stand-in for a Vulkan device.

    use super::MemoryDevice;
    use ash::prelude::VkResult;
    use ash::vk::{self, Handle};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::ffi::c_void;

    pub struct FakeDevice {
        pub alignment: u64,
        pub memory_type_bits: u32,
        allocations: RefCell<HashMap<u64, Box<[u8]>>>,
        next_handle: Cell<u64>,
        pub buffers_created: Cell<u32>,
        pub buffers_destroyed: Cell<u32>,
        pub allocation_count: Cell<u32>,
        pub frees: Cell<u32>,
        pub maps: Cell<u32>,
        pub unmaps: Cell<u32>,
        pub bound: RefCell<Vec<(u64, u64, u64)>>,
        pub last_type_index: Cell<Option<u32>>,
        sizes: RefCell<HashMap<u64, u64>>,
    }

    impl FakeDevice {
        pub fn new(memory_type_bits: u32) -> Self {
            Self {
                alignment: 256,
                memory_type_bits,
                allocations: RefCell::default(),
                next_handle: Cell::new(1),
                buffers_created: Cell::new(0),
                buffers_destroyed: Cell::new(0),
                allocation_count: Cell::new(0),
                frees: Cell::new(0),
                maps: Cell::new(0),
                unmaps: Cell::new(0),
                bound: RefCell::default(),
                last_type_index: Cell::new(None),
                sizes: RefCell::default(),
            }
        }

        fn next(&self) -> u64 {
            let handle = self.next_handle.get();
            self.next_handle.set(handle + 1);
            handle
        }

        /// Contents of an allocation, independent of any mapping.
        pub fn contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
            self.allocations.borrow()[&memory.as_raw()].to_vec()
        }
    }

    impl MemoryDevice for FakeDevice {
        unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
            let handle = self.next();
            self.sizes.borrow_mut().insert(handle, info.size);
            self.buffers_created.set(self.buffers_created.get() + 1);
            Ok(vk::Buffer::from_raw(handle))
        }

        unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
            let size = self.sizes.borrow()[&buffer.as_raw()];
            vk::MemoryRequirements {
                size: size.div_ceil(self.alignment) * self.alignment,
                alignment: self.alignment,
                memory_type_bits: self.memory_type_bits,
            }
        }

        unsafe fn allocate_memory(
            &self,
            info: &vk::MemoryAllocateInfo<'_>,
        ) -> VkResult<vk::DeviceMemory> {
            let handle = self.next();
            self.allocations
                .borrow_mut()
                .insert(handle, vec![0xAB; info.allocation_size as usize].into_boxed_slice());
            self.allocation_count.set(self.allocation_count.get() + 1);
            self.last_type_index.set(Some(info.memory_type_index));
            Ok(vk::DeviceMemory::from_raw(handle))
        }

        unsafe fn bind_buffer_memory(
            &self,
            buffer: vk::Buffer,
            memory: vk::DeviceMemory,
            offset: vk::DeviceSize,
        ) -> VkResult<()> {
            self.bound
                .borrow_mut()
                .push((buffer.as_raw(), memory.as_raw(), offset));
            Ok(())
        }

        unsafe fn map_memory(
            &self,
            memory: vk::DeviceMemory,
            offset: vk::DeviceSize,
            _size: vk::DeviceSize,
        ) -> VkResult<*mut c_void> {
            self.maps.set(self.maps.get() + 1);
            let mut allocations = self.allocations.borrow_mut();
            let bytes = allocations
                .get_mut(&memory.as_raw())
                .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
            // Boxed slices never move, so the pointer outlives the borrow.
            Ok(bytes.as_mut_ptr().add(offset as usize).cast())
        }

        unsafe fn unmap_memory(&self, _memory: vk::DeviceMemory) {
            self.unmaps.set(self.unmaps.get() + 1);
        }

        unsafe fn destroy_buffer(&self, _buffer: vk::Buffer) {
            self.buffers_destroyed.set(self.buffers_destroyed.get() + 1);
        }

        unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
            self.allocations.borrow_mut().remove(&memory.as_raw());
            self.frees.set(self.frees.get() + 1);
        }
    }

    /// Memory table with the given property flags, one entry per type.
    pub fn memory_table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        for (slot, &flags) in properties.memory_types.iter_mut().zip(types) {
            *slot = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        properties
    }
}
