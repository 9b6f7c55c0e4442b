// Resource allocator - buffers and their backing memory
//
// Buffers and memory are created and destroyed explicitly. Handles are opaque
// tokens: only the allocator that issued them can release them, and release
// consumes the handle.

use anyhow::{Context, Result};
use ash::vk;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::device::GpuDevice;

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the allocator a handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorId(u64);

impl AllocatorId {
    fn next() -> Self {
        Self(NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Requested buffer shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

/// Requested memory properties for a buffer's backing allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub properties: vk::MemoryPropertyFlags,
}

impl MemoryInfo {
    /// CPU-writable memory that needs no explicit flushes.
    pub const HOST_COHERENT: Self = Self {
        properties: vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
                | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
        ),
    };

    pub const DEVICE_LOCAL: Self = Self {
        properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
    };
}

/// A buffer without (or not yet with) bound memory.
#[derive(Debug)]
#[must_use = "buffers must be released with ResourceAllocator::destroy_buffer"]
pub struct BufferHandle {
    raw: vk::Buffer,
    size: vk::DeviceSize,
    owner: AllocatorId,
}

impl BufferHandle {
    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn owner(&self) -> AllocatorId {
        self.owner
    }
}

/// An opaque device memory allocation.
#[derive(Debug)]
#[must_use = "memory must be released with ResourceAllocator::free_memory"]
pub struct MemoryHandle {
    raw: vk::DeviceMemory,
    size: vk::DeviceSize,
    owner: AllocatorId,
}

impl MemoryHandle {
    pub fn raw(&self) -> vk::DeviceMemory {
        self.raw
    }

    /// Allocation size, which may exceed the buffer size.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn owner(&self) -> AllocatorId {
        self.owner
    }
}

/// A buffer and the memory bound to it, released together.
#[derive(Debug)]
#[must_use = "release with ResourceAllocator::destroy_buffer_with_memory"]
pub struct BufferWithMemory {
    buffer: BufferHandle,
    memory: MemoryHandle,
}

impl BufferWithMemory {
    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    pub fn memory(&self) -> &MemoryHandle {
        &self.memory
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer.raw
    }
}

/// Lowest memory type index allowed by `type_filter` whose flags contain
/// `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);
        has_type && has_properties
    })
}

/// Creates and releases buffers and memory on one device.
///
/// Not thread-safe. Every handle must be released exactly once through the
/// allocator that created it.
pub struct ResourceAllocator<D: GpuDevice> {
    device: Arc<D>,
    id: AllocatorId,
    live_buffers: Cell<usize>,
    live_allocations: Cell<usize>,
}

impl<D: GpuDevice> ResourceAllocator<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            id: AllocatorId::next(),
            live_buffers: Cell::new(0),
            live_allocations: Cell::new(0),
        }
    }

    pub fn id(&self) -> AllocatorId {
        self.id
    }

    /// Buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.get()
    }

    /// Memory allocations made and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.get()
    }

    /// Create a buffer object. No memory is allocated.
    ///
    /// Zero-sized buffers are rejected before reaching the driver.
    pub fn create_buffer(&self, info: BufferInfo) -> Result<BufferHandle> {
        anyhow::ensure!(info.size > 0, "Buffer size must be non-zero");

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let raw = unsafe { self.device.create_buffer(&buffer_info) }
            .context("Failed to create buffer")?;
        self.live_buffers.set(self.live_buffers.get() + 1);

        log::debug!("Created buffer {:?} ({} bytes, {:?})", raw, info.size, info.usage);

        Ok(BufferHandle {
            raw,
            size: info.size,
            owner: self.id,
        })
    }

    /// Allocate memory matching `info` for `buffer` and bind it at offset 0.
    ///
    /// Fails if the device exposes no compatible memory type.
    pub fn allocate_memory(&self, buffer: &BufferHandle, info: MemoryInfo) -> Result<MemoryHandle> {
        self.check_owner(buffer.owner);

        let requirements = unsafe { self.device.buffer_memory_requirements(buffer.raw) };

        let memory_type_index = find_memory_type(
            self.device.memory_properties(),
            requirements.memory_type_bits,
            info.properties,
        )
        .with_context(|| {
            format!(
                "No memory type with {:?} (allowed types {:#b})",
                info.properties, requirements.memory_type_bits
            )
        })?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let raw = unsafe { self.device.allocate_memory(&alloc_info) }
            .context("Failed to allocate buffer memory")?;

        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer.raw, raw, 0) } {
            unsafe { self.device.free_memory(raw) };
            return Err(e).context("Failed to bind buffer memory");
        }

        self.live_allocations.set(self.live_allocations.get() + 1);

        Ok(MemoryHandle {
            raw,
            size: requirements.size,
            owner: self.id,
        })
    }

    /// `create_buffer` followed by `allocate_memory`; nothing leaks on failure.
    pub fn create_buffer_with_memory(
        &self,
        buffer_info: BufferInfo,
        memory_info: MemoryInfo,
    ) -> Result<BufferWithMemory> {
        let buffer = self.create_buffer(buffer_info)?;

        match self.allocate_memory(&buffer, memory_info) {
            Ok(memory) => Ok(BufferWithMemory { buffer, memory }),
            Err(e) => {
                self.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// Copy `data` into the start of `memory`.
    ///
    /// `memory` must have been allocated `HOST_VISIBLE`; without
    /// `HOST_COHERENT` the caller is responsible for flushing.
    pub fn map_memory(&self, memory: &MemoryHandle, data: &[u8]) -> Result<()> {
        self.check_owner(memory.owner);

        let len = data.len() as vk::DeviceSize;
        anyhow::ensure!(
            len <= memory.size,
            "Write of {} bytes exceeds allocation of {} bytes",
            len,
            memory.size
        );
        if data.is_empty() {
            return Ok(());
        }

        unsafe {
            let ptr = self
                .device
                .map_memory(memory.raw, 0, len)
                .context("Failed to map memory")? as *mut u8;

            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.unmap_memory(memory.raw);
        }

        Ok(())
    }

    /// Typed wrapper over [`map_memory`](Self::map_memory).
    pub fn upload<T: bytemuck::Pod>(&self, memory: &MemoryHandle, data: &[T]) -> Result<()> {
        self.map_memory(memory, bytemuck::cast_slice(data))
    }

    /// Host-coherent buffer filled with `data`.
    pub fn create_buffer_with_data<T: bytemuck::Pod>(
        &self,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<BufferWithMemory> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let buffer = self.create_buffer_with_memory(
            BufferInfo { size, usage },
            MemoryInfo::HOST_COHERENT,
        )?;

        if let Err(e) = self.upload(buffer.memory(), data) {
            self.destroy_buffer_with_memory(buffer);
            return Err(e);
        }

        Ok(buffer)
    }

    /// The GPU must no longer be using `buffer`.
    pub fn destroy_buffer(&self, buffer: BufferHandle) {
        self.check_owner(buffer.owner);
        unsafe { self.device.destroy_buffer(buffer.raw) };
        self.live_buffers.set(self.live_buffers.get() - 1);
    }

    /// Any buffer bound to `memory` must be destroyed first or not in use.
    pub fn free_memory(&self, memory: MemoryHandle) {
        self.check_owner(memory.owner);
        unsafe { self.device.free_memory(memory.raw) };
        self.live_allocations.set(self.live_allocations.get() - 1);
    }

    pub fn destroy_buffer_with_memory(&self, buffer: BufferWithMemory) {
        let BufferWithMemory { buffer, memory } = buffer;
        self.destroy_buffer(buffer);
        self.free_memory(memory);
    }

    fn check_owner(&self, owner: AllocatorId) {
        debug_assert_eq!(owner, self.id, "handle released through a foreign allocator");
    }
}

impl<D: GpuDevice> Drop for ResourceAllocator<D> {
    fn drop(&mut self) {
        let (buffers, allocations) = (self.live_buffers.get(), self.live_allocations.get());
        if buffers > 0 || allocations > 0 {
            log::warn!(
                "Resource allocator dropped with {} buffers and {} allocations outstanding",
                buffers,
                allocations
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockDevice;

    fn allocator() -> (Arc<MockDevice>, ResourceAllocator<MockDevice>) {
        let device = Arc::new(MockDevice::new());
        let allocator = ResourceAllocator::new(device.clone());
        (device, allocator)
    }

    fn vertex_buffer(size: vk::DeviceSize) -> BufferInfo {
        BufferInfo {
            size,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
        }
    }

    #[test]
    fn memory_type_lowest_matching_index_wins() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED;

        let host = MemoryInfo::HOST_COHERENT.properties;
        assert_eq!(find_memory_type(&props, 0b111, host), Some(1));
        // type 1 excluded by the buffer's requirements
        assert_eq!(find_memory_type(&props, 0b101, host), Some(2));
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::empty()),
            Some(0)
        );
        assert_eq!(find_memory_type(&props, 0b001, host), None);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::LAZILY_ALLOCATED),
            None
        );
    }

    #[test]
    fn create_then_destroy_with_memory_leaves_nothing() {
        let (device, allocator) = allocator();

        let buffer = allocator
            .create_buffer_with_memory(vertex_buffer(256), MemoryInfo::HOST_COHERENT)
            .unwrap();
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(device.live_allocations(), 1);
        assert_eq!(allocator.live_allocations(), 1);

        allocator.destroy_buffer_with_memory(buffer);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(allocator.live_allocations(), 0);
    }

    #[test]
    fn standalone_buffer_then_explicit_memory() {
        let (device, allocator) = allocator();

        let buffer = allocator.create_buffer(vertex_buffer(64)).unwrap();
        assert_eq!(device.live_allocations(), 0);

        let memory = allocator
            .allocate_memory(&buffer, MemoryInfo::DEVICE_LOCAL)
            .unwrap();
        assert_eq!(device.bound_memory(buffer.raw()), Some(memory.raw()));
        assert!(memory.size() >= buffer.size());

        allocator.destroy_buffer(buffer);
        allocator.free_memory(memory);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn unsatisfiable_memory_does_not_leak_buffer() {
        let (device, allocator) = allocator();

        let result = allocator.create_buffer_with_memory(
            vertex_buffer(64),
            MemoryInfo {
                properties: vk::MemoryPropertyFlags::PROTECTED,
            },
        );

        assert!(result.is_err());
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn mapped_write_reads_back_identical() {
        let (device, allocator) = allocator();
        let buffer = allocator
            .create_buffer_with_memory(vertex_buffer(16), MemoryInfo::HOST_COHERENT)
            .unwrap();

        let data: Vec<u8> = (0u8..16).map(|b| b.wrapping_mul(37)).collect();
        allocator.map_memory(buffer.memory(), &data).unwrap();

        let contents = device.memory_contents(buffer.memory().raw()).unwrap();
        assert_eq!(&contents[..data.len()], &data[..]);
        assert!(!device.is_mapped(buffer.memory().raw()));

        allocator.destroy_buffer_with_memory(buffer);
    }

    #[test]
    fn typed_upload_matches_byte_layout() {
        let (device, allocator) = allocator();
        let floats = [1.0f32, -2.5, 0.125];
        let buffer = allocator
            .create_buffer_with_data(vk::BufferUsageFlags::VERTEX_BUFFER, &floats)
            .unwrap();

        assert_eq!(buffer.buffer().size(), 12);
        let contents = device.memory_contents(buffer.memory().raw()).unwrap();
        assert_eq!(&contents[..12], bytemuck::cast_slice::<f32, u8>(&floats));

        allocator.destroy_buffer_with_memory(buffer);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let (_device, allocator) = allocator();
        let buffer = allocator
            .create_buffer_with_memory(vertex_buffer(4), MemoryInfo::HOST_COHERENT)
            .unwrap();

        let too_big = vec![0u8; buffer.memory().size() as usize + 1];
        assert!(allocator.map_memory(buffer.memory(), &too_big).is_err());

        allocator.destroy_buffer_with_memory(buffer);
    }

    #[test]
    fn zero_sized_buffers_are_rejected() {
        let (device, allocator) = allocator();

        assert!(allocator.create_buffer(vertex_buffer(0)).is_err());
        let empty: [f32; 0] = [];
        assert!(allocator
            .create_buffer_with_data(vk::BufferUsageFlags::VERTEX_BUFFER, &empty)
            .is_err());

        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_allocations(), 0);
        assert_eq!(allocator.live_buffers(), 0);
    }

    #[test]
    fn handles_carry_their_allocator_id() {
        let (device, first) = allocator();
        let second = ResourceAllocator::new(device);
        assert_ne!(first.id(), second.id());

        let buffer = first.create_buffer(vertex_buffer(8)).unwrap();
        assert_eq!(buffer.owner(), first.id());
        first.destroy_buffer(buffer);
    }
}
