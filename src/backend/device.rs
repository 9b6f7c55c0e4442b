// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Presentation surface for the target window
// - Physical device selection (explicit, configurable policy)
// - Logical device + graphics/present queue creation

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

use super::surface;

/// Queue families used by the renderer. Graphics and present may be the
/// same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// How to choose among the adapters the driver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterPreference {
    /// First suitable adapter in enumeration order.
    #[default]
    FirstSuitable,
    /// Discrete over integrated over anything else; ties keep enumeration order.
    PreferDiscrete,
}

/// What we learned about one adapter while probing it.
#[derive(Debug, Clone)]
pub struct AdapterCandidate {
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Option<QueueFamilies>,
    pub supports_swapchain: bool,
}

impl AdapterCandidate {
    pub fn is_suitable(&self) -> bool {
        self.queue_families.is_some() && self.supports_swapchain
    }
}

fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    }
}

/// Pick an adapter index out of `candidates`, or `None` if none is suitable.
pub fn select_adapter(
    candidates: &[AdapterCandidate],
    preference: AdapterPreference,
) -> Option<usize> {
    let mut suitable = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.is_suitable());

    match preference {
        AdapterPreference::FirstSuitable => suitable.next().map(|(i, _)| i),
        AdapterPreference::PreferDiscrete => {
            let mut best: Option<(usize, u32)> = None;
            for (i, candidate) in suitable {
                let score = device_type_score(candidate.device_type);
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((i, score));
                }
            }
            best.map(|(i, _)| i)
        }
    }
}

/// Whether `VK_KHR_swapchain` is among the reported device extensions.
pub fn has_swapchain_extension(extensions: &[vk::ExtensionProperties]) -> bool {
    extensions.iter().any(|ext| {
        let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        name == khr::Swapchain::name()
    })
}

/// Destroy steps for a partially built object. Runs them newest first when
/// dropped, unless [`disarm`](Self::disarm)ed once construction succeeds.
#[derive(Default)]
pub(crate) struct Teardown<'a> {
    steps: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Teardown<'a> {
    pub fn push(&mut self, step: impl FnOnce() + 'a) {
        self.steps.push(Box::new(step));
    }

    pub fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

/// Find a graphics family and a family that can present to the surface.
///
/// A single family doing both wins over a split pair.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_count == 0 {
            continue;
        }
        let has_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let has_present = supports_present(index);

        if has_graphics && has_present {
            return Some(QueueFamilies { graphics: index, present: index });
        }
        if has_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if has_present && present.is_none() {
            present = Some(index);
        }
    }

    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

/// One graphics-queue submission. The default is an empty batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Device calls made by the resource allocator, the frame loop and
/// swapchain generation teardown.
///
/// `VulkanDevice` forwards these to the driver; tests substitute a mock.
///
/// # Safety
///
/// Every handle passed to a method must have been created by the same
/// implementor and must not have been destroyed yet. Destroy methods must be
/// called at most once per handle, after the GPU stopped using it. As in
/// Vulkan, destroying a null handle does nothing.
pub trait GpuDevice {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer>;
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);
    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    unsafe fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory>;
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void>;
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// Resettable pool on the graphics family.
    unsafe fn create_command_pool(&self) -> VkResult<vk::CommandPool>;
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    /// Begin one-time-submit recording.
    unsafe fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    unsafe fn submit_graphics(&self, batch: &SubmitBatch<'_>, fence: vk::Fence) -> VkResult<()>;

    fn device_wait_idle(&self) -> VkResult<()>;

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    unsafe fn destroy_image_view(&self, view: vk::ImageView);
    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
}

/// Settings consumed by [`VulkanDevice::new`].
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub app_name: String,
    pub enable_validation: bool,
    pub adapter: AdapterPreference,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Presentation
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    pub swapchain_loader: khr::Swapchain,

    // Queue handles
    queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    /// Queues are externally synchronized and may alias each other.
    queue_lock: Mutex<()>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create the device context for `window`.
    ///
    /// Fails if the driver cannot be loaded, no adapter can render and
    /// present to the window's surface, or device creation fails.
    pub fn new<W>(window: &W, options: &DeviceOptions) -> Result<Arc<Self>>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        log::info!("Creating Vulkan device: {}", options.app_name);

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let surface_extensions = surface::required_extensions(display_handle)?;
        let instance = Self::create_instance(
            &entry,
            &options.app_name,
            options.enable_validation,
            &surface_extensions,
        )?;

        let surface_loader = khr::Surface::new(&entry, &instance);

        // Anything created below is released again if a later step fails.
        let mut teardown = Teardown::default();
        teardown.push(|| unsafe { instance.destroy_instance(None) });

        let debug_utils = if options.enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };
        if let Some((utils, messenger)) = debug_utils.clone() {
            teardown.push(move || unsafe { utils.destroy_debug_utils_messenger(messenger, None) });
        }

        let surface = unsafe {
            surface::create_surface(&entry, &instance, display_handle, window_handle)
        }?;
        let loader = &surface_loader;
        teardown.push(move || unsafe { loader.destroy_surface(surface, None) });

        let (physical_device, queue_families) = Self::pick_physical_device(
            &instance,
            &surface_loader,
            surface,
            options.adapter,
        )?;

        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, queue_families)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}",
            queue_families.graphics,
            queue_families.present
        );

        let swapchain_loader = khr::Swapchain::new(&instance, &device);
        teardown.disarm();

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            swapchain_loader,
            queue_families,
            graphics_queue,
            present_queue,
            queue_lock: Mutex::new(()),
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        surface_extensions: &[&'static CStr],
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("frame-pipeline")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions: Vec<*const c_char> =
            surface_extensions.iter().map(|name| name.as_ptr()).collect();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        preference: AdapterPreference,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let candidates: Vec<AdapterCandidate> = devices
            .iter()
            .map(|&device| Self::probe_adapter(instance, surface_loader, surface, device))
            .collect();

        for (device, candidate) in devices.iter().zip(&candidates) {
            let props = unsafe { instance.get_physical_device_properties(*device) };
            log::debug!(
                "Adapter {}: {:?} suitable={}",
                unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy(),
                candidate.device_type,
                candidate.is_suitable()
            );
        }

        let index = select_adapter(&candidates, preference).with_context(|| {
            format!(
                "No GPU with graphics and presentation support found ({} adapters probed)",
                devices.len()
            )
        })?;
        let families = candidates[index]
            .queue_families
            .context("Selected adapter lost its queue families")?;

        Ok((devices[index], families))
    }

    fn probe_adapter(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> AdapterCandidate {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let queue_families = find_queue_families(&families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        });

        let supports_swapchain = unsafe { instance.enumerate_device_extension_properties(device) }
            .map(|extensions| has_swapchain_extension(&extensions))
            .unwrap_or(false);

        AdapterCandidate {
            device_type: props.device_type,
            queue_families,
            supports_swapchain,
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Held for the duration of any submit or present.
    pub(crate) fn lock_queues(&self) -> MutexGuard<'_, ()> {
        self.queue_lock.lock()
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl GpuDevice for VulkanDevice {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        self.device.create_buffer(info, None)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.device.destroy_buffer(buffer, None);
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        self.device.get_buffer_memory_requirements(buffer)
    }

    unsafe fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory> {
        self.device.allocate_memory(info, None)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.device.free_memory(memory, None);
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.device.bind_buffer_memory(buffer, memory, offset)
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        self.device
            .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.device.unmap_memory(memory);
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.device
            .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.device.destroy_semaphore(semaphore, None);
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        self.device
            .create_fence(&vk::FenceCreateInfo::builder().flags(flags), None)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, None);
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        self.device.wait_for_fences(&[fence], true, timeout)
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.device.reset_fences(&[fence])
    }

    unsafe fn create_command_pool(&self) -> VkResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.queue_families.graphics)
            // RESET: the single frame command buffer is re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        self.device.create_command_pool(&pool_info, None)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.device.destroy_command_pool(pool, None);
    }

    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.device
            .allocate_command_buffers(&alloc_info)
            .map(|buffers| buffers[0])
    }

    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
    }

    unsafe fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device.begin_command_buffer(cmd, &begin_info)
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.device.end_command_buffer(cmd)
    }

    unsafe fn submit_graphics(&self, batch: &SubmitBatch<'_>, fence: vk::Fence) -> VkResult<()> {
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .command_buffers(batch.command_buffers)
            .signal_semaphores(batch.signal_semaphores);

        let _queue = self.lock_queues();
        self.device
            .queue_submit(self.graphics_queue, &[submit_info.build()], fence)
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.device.destroy_framebuffer(framebuffer, None);
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.device.destroy_pipeline(pipeline, None);
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.device.destroy_pipeline_layout(layout, None);
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.device.destroy_render_pass(render_pass, None);
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.device.destroy_image_view(view, None);
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.swapchain_loader.destroy_swapchain(swapchain, None);
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(
        device_type: vk::PhysicalDeviceType,
        suitable: bool,
    ) -> AdapterCandidate {
        AdapterCandidate {
            device_type,
            queue_families: suitable.then_some(QueueFamilies { graphics: 0, present: 0 }),
            supports_swapchain: true,
        }
    }

    #[test]
    fn shared_family_preferred_over_split() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let found = find_queue_families(&families, |i| i != 0).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 2, present: 2 });
        assert!(found.is_shared());
        assert_eq!(found.unique(), vec![2]);
    }

    #[test]
    fn split_families_when_no_single_family_does_both() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let found = find_queue_families(&families, |i| i == 1).unwrap();
        assert_eq!(found, QueueFamilies { graphics: 0, present: 1 });
        assert_eq!(found.unique(), vec![0, 1]);
    }

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, &src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as c_char;
        }
        props
    }

    #[test]
    fn swapchain_extension_is_detected_by_name() {
        let maintenance = extension(CStr::from_bytes_with_nul(b"VK_KHR_maintenance1\0").unwrap());
        let swapchain = extension(khr::Swapchain::name());

        assert!(has_swapchain_extension(&[maintenance, swapchain]));
        assert!(!has_swapchain_extension(&[maintenance]));
        assert!(!has_swapchain_extension(&[]));
    }

    #[test]
    fn teardown_runs_newest_first_unless_disarmed() {
        let log = std::cell::RefCell::new(Vec::new());

        {
            let mut teardown = Teardown::default();
            teardown.push(|| log.borrow_mut().push("instance"));
            teardown.push(|| log.borrow_mut().push("surface"));
        }
        assert_eq!(*log.borrow(), ["surface", "instance"]);

        log.borrow_mut().clear();
        let mut teardown = Teardown::default();
        teardown.push(|| log.borrow_mut().push("instance"));
        teardown.disarm();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn no_present_family_is_none() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(find_queue_families(&families, |_| false).is_none());
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        let found = find_queue_families(&families, |_| true).unwrap();
        assert_eq!(found.graphics, 1);
    }

    #[test]
    fn first_suitable_keeps_enumeration_order() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, false),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(select_adapter(&candidates, AdapterPreference::FirstSuitable), Some(1));
    }

    #[test]
    fn prefer_discrete_scores_adapters() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::CPU, true),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(select_adapter(&candidates, AdapterPreference::PreferDiscrete), Some(2));
    }

    #[test]
    fn adapter_without_swapchain_is_rejected() {
        let mut only = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, true);
        only.supports_swapchain = false;
        assert_eq!(select_adapter(&[only], AdapterPreference::FirstSuitable), None);
        assert_eq!(select_adapter(&[], AdapterPreference::PreferDiscrete), None);
    }
}
