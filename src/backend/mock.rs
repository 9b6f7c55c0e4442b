// Mock device for tests (no GPU required)
//
// Counts live objects, backs memory with host vectors, and models the
// graphics queue: each submission leaves its fence unsignaled until the test
// (or a helper thread) completes it.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_void;
use std::sync::Arc;

use super::device::{GpuDevice, SubmitBatch};
use super::swapchain::PresentTarget;

/// Calls observed by the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    Acquire { signal: vk::Semaphore },
    ResetCommands(vk::CommandBuffer),
    BeginCommands(vk::CommandBuffer),
    EndCommands(vk::CommandBuffer),
    Submit {
        wait: Vec<vk::Semaphore>,
        stages: Vec<vk::PipelineStageFlags>,
        commands: Vec<vk::CommandBuffer>,
        signal: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Present { image_index: u32, wait: vk::Semaphore },
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    WaitIdle,
    /// A swapchain-generation object was destroyed.
    Destroy { kind: vk::ObjectType, raw: u64 },
}

#[derive(Default)]
struct State {
    next_handle: u64,
    buffers: HashMap<vk::Buffer, vk::DeviceSize>,
    bindings: HashMap<vk::Buffer, vk::DeviceMemory>,
    memory: HashMap<vk::DeviceMemory, Box<[u8]>>,
    mapped: HashSet<vk::DeviceMemory>,
    semaphores: HashSet<vk::Semaphore>,
    /// Fence -> signaled.
    fences: HashMap<vk::Fence, bool>,
    /// Fences of submissions the "GPU" has not finished, oldest first.
    pending: VecDeque<vk::Fence>,
    pools: HashSet<vk::CommandPool>,
    recording: HashSet<vk::CommandBuffer>,
    events: Vec<Event>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct MockDevice {
    state: Mutex<State>,
    fence_signaled: Condvar,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

/// Allocation granularity reported by the mock.
pub const MOCK_ALIGNMENT: vk::DeviceSize = 64;

impl MockDevice {
    /// Two memory types: 0 device-local, 1 host-visible + coherent.
    pub fn new() -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        memory_properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory_properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        Self {
            state: Mutex::new(State::default()),
            fence_signaled: Condvar::new(),
            memory_properties,
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn bound_memory(&self, buffer: vk::Buffer) -> Option<vk::DeviceMemory> {
        self.state.lock().bindings.get(&buffer).copied()
    }

    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Option<Vec<u8>> {
        self.state.lock().memory.get(&memory).map(|bytes| bytes.to_vec())
    }

    pub fn is_mapped(&self, memory: vk::DeviceMemory) -> bool {
        self.state.lock().mapped.contains(&memory)
    }

    pub fn is_recording(&self, cmd: vk::CommandBuffer) -> bool {
        self.state.lock().recording.contains(&cmd)
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Finish the oldest outstanding submission. Returns false if none.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        match state.pending.pop_front() {
            Some(fence) => {
                state.fences.insert(fence, true);
                self.fence_signaled.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub(crate) fn record(&self, event: Event) {
        self.state.lock().events.push(event);
    }

    /// Null handles are ignored, as the driver does.
    fn record_destroy(&self, kind: vk::ObjectType, handle: impl Handle) {
        let raw = handle.as_raw();
        if raw != 0 {
            self.record(Event::Destroy { kind, raw });
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for MockDevice {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        let buffer = vk::Buffer::from_raw(state.handle());
        state.buffers.insert(buffer, info.size);
        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        assert!(state.buffers.remove(&buffer).is_some(), "double destroy of {buffer:?}");
        state.bindings.remove(&buffer);
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.lock().buffers[&buffer];
        vk::MemoryRequirements {
            size: size.div_ceil(MOCK_ALIGNMENT).max(1) * MOCK_ALIGNMENT,
            alignment: MOCK_ALIGNMENT,
            memory_type_bits: 0b11,
        }
    }

    unsafe fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory> {
        if info.memory_type_index >= self.memory_properties.memory_type_count {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let mut state = self.state.lock();
        let memory = vk::DeviceMemory::from_raw(state.handle());
        state
            .memory
            .insert(memory, vec![0u8; info.allocation_size as usize].into_boxed_slice());
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        assert!(state.memory.remove(&memory).is_some(), "double free of {memory:?}");
        state.mapped.remove(&memory);
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.state.lock().bindings.insert(buffer, memory);
        Ok(())
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        let mut state = self.state.lock();
        let len = state.memory.get(&memory).map(|bytes| bytes.len() as vk::DeviceSize);
        match len {
            Some(len) if offset + size <= len => {}
            _ => return Err(vk::Result::ERROR_MEMORY_MAP_FAILED),
        }
        state.mapped.insert(memory);
        // The boxed slice never moves while the allocation lives.
        let bytes = state.memory.get_mut(&memory).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        Ok(bytes.as_mut_ptr().add(offset as usize) as *mut c_void)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.state.lock().mapped.remove(&memory);
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.semaphores.insert(semaphore);
        state.events.push(Event::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        assert!(state.semaphores.remove(&semaphore), "double destroy of {semaphore:?}");
        state.events.push(Event::DestroySemaphore(semaphore));
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.handle());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.events.push(Event::WaitFence(fence));
        loop {
            match state.fences.get(&fence) {
                Some(true) => return Ok(()),
                Some(false) if !state.pending.contains(&fence) => {
                    // Nothing will ever signal it: the real driver would hang.
                    return Err(vk::Result::ERROR_DEVICE_LOST);
                }
                Some(false) => self.fence_signaled.wait(&mut state),
                None => return Err(vk::Result::ERROR_UNKNOWN),
            }
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.fences.insert(fence, false);
        state.events.push(Event::ResetFence(fence));
        Ok(())
    }

    unsafe fn create_command_pool(&self) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = vk::CommandPool::from_raw(state.handle());
        state.pools.insert(pool);
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().pools.remove(&pool);
    }

    unsafe fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        Ok(vk::CommandBuffer::from_raw(state.handle()))
    }

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.recording.remove(&cmd);
        state.events.push(Event::ResetCommands(cmd));
        Ok(())
    }

    unsafe fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        state.recording.insert(cmd);
        state.events.push(Event::BeginCommands(cmd));
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        if !state.recording.remove(&cmd) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        state.events.push(Event::EndCommands(cmd));
        Ok(())
    }

    unsafe fn submit_graphics(&self, batch: &SubmitBatch<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if batch.command_buffers.iter().any(|cmd| state.recording.contains(cmd)) {
            // Submitting a buffer still in the recording state is invalid.
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        state.fences.insert(fence, false);
        state.pending.push_back(fence);
        state.events.push(Event::Submit {
            wait: batch.wait_semaphores.to_vec(),
            stages: batch.wait_stages.to_vec(),
            commands: batch.command_buffers.to_vec(),
            signal: batch.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        while let Some(fence) = state.pending.pop_front() {
            state.fences.insert(fence, true);
        }
        self.fence_signaled.notify_all();
        state.events.push(Event::WaitIdle);
        Ok(())
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.record_destroy(vk::ObjectType::FRAMEBUFFER, framebuffer);
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.record_destroy(vk::ObjectType::PIPELINE, pipeline);
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.record_destroy(vk::ObjectType::PIPELINE_LAYOUT, layout);
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.record_destroy(vk::ObjectType::RENDER_PASS, render_pass);
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.record_destroy(vk::ObjectType::IMAGE_VIEW, view);
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.record_destroy(vk::ObjectType::SWAPCHAIN_KHR, swapchain);
    }
}

/// Scripted swapchain: results are consumed front to back, defaulting to a
/// plain success once the script runs out.
///
/// Tracks which images are acquired and not yet presented. Acquire hands out
/// the next free image in order; with none free it fails with `TIMEOUT`
/// where a driver waiting without a timeout would block forever.
pub struct MockSwapchain {
    device: Arc<MockDevice>,
    image_count: u32,
    next_image: Mutex<u32>,
    held: Mutex<HashSet<u32>>,
    acquire_results: Mutex<VecDeque<VkResult<bool>>>,
    present_results: Mutex<VecDeque<VkResult<bool>>>,
}

impl MockSwapchain {
    pub fn new(device: Arc<MockDevice>, image_count: u32) -> Self {
        Self {
            device,
            image_count,
            next_image: Mutex::new(0),
            held: Mutex::new(HashSet::new()),
            acquire_results: Mutex::new(VecDeque::new()),
            present_results: Mutex::new(VecDeque::new()),
        }
    }

    /// `Ok(suboptimal)` or an error for the next acquire.
    pub fn script_acquire(&self, result: VkResult<bool>) {
        self.acquire_results.lock().push_back(result);
    }

    pub fn script_present(&self, result: VkResult<bool>) {
        self.present_results.lock().push_back(result);
    }

    /// Images acquired and never presented.
    pub fn held_images(&self) -> usize {
        self.held.lock().len()
    }
}

impl PresentTarget for MockSwapchain {
    unsafe fn acquire_next_image(&self, _timeout: u64, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        self.device.record(Event::Acquire { signal });
        let suboptimal = self.acquire_results.lock().pop_front().unwrap_or(Ok(false))?;

        let mut held = self.held.lock();
        let mut next = self.next_image.lock();
        let index = (0..self.image_count)
            .map(|offset| (*next + offset) % self.image_count)
            .find(|index| !held.contains(index))
            .ok_or(vk::Result::TIMEOUT)?;
        held.insert(index);
        *next = (index + 1) % self.image_count;
        Ok((index, suboptimal))
    }

    unsafe fn present(&self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        self.device.record(Event::Present { image_index, wait });
        self.held.lock().remove(&image_index);
        self.present_results.lock().pop_front().unwrap_or(Ok(false))
    }
}
