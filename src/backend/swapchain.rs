// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Creation is split into a pure planning step (what to ask the driver for)
// and the Vulkan calls that carry the plan out.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use super::device::GpuDevice;
use super::VulkanDevice;

/// Format used when the surface offers it.
pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// What to do when the surface lacks [`PREFERRED_FORMAT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatFallback {
    /// Use the first format the surface reports.
    #[default]
    FirstReported,
    /// Refuse to build the swapchain.
    Fail,
}

/// Caller preferences for the presentable image queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub format_fallback: FormatFallback,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            format_fallback: FormatFallback::FirstReported,
        }
    }
}

/// Surface properties reported by the driver for one adapter.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(device: &VulkanDevice) -> Result<Self> {
        let loader = &device.surface_loader;
        let (physical_device, surface) = (device.physical_device, device.surface);

        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .context("Failed to query surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .context("Failed to query surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .context("Failed to query present modes")?,
            })
        }
    }
}

/// Everything needed to create a swapchain, decided up front.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl SwapchainPlan {
    /// A zero-area extent (minimized window) cannot back a swapchain.
    pub fn is_degenerate(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// Decide swapchain parameters from caller preferences and surface support.
pub fn plan(config: &SwapchainConfig, support: &SurfaceSupport) -> Result<SwapchainPlan> {
    let caps = &support.capabilities;

    Ok(SwapchainPlan {
        surface_format: choose_surface_format(&support.formats, config.format_fallback)?,
        present_mode: choose_present_mode(&support.present_modes, config.vsync),
        extent: choose_extent(caps, config.width, config.height),
        image_count: choose_image_count(caps),
        pre_transform: caps.current_transform,
        composite_alpha: choose_composite_alpha(caps),
    })
}

pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    fallback: FormatFallback,
) -> Result<vk::SurfaceFormatKHR> {
    // A lone UNDEFINED entry means the surface takes any format.
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Ok(PREFERRED_FORMAT);
        }
    }

    if let Some(found) = formats.iter().copied().find(|f| {
        f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
    }) {
        return Ok(found);
    }

    let first = formats
        .first()
        .copied()
        .context("Surface reports no supported formats")?;

    match fallback {
        FormatFallback::FirstReported => {
            log::warn!(
                "Surface lacks {:?}/{:?}, falling back to {:?}/{:?}",
                PREFERRED_FORMAT.format,
                PREFERRED_FORMAT.color_space,
                first.format,
                first.color_space
            );
            Ok(first)
        }
        FormatFallback::Fail => anyhow::bail!(
            "Surface lacks {:?}/{:?} and format fallback is disabled",
            PREFERRED_FORMAT.format,
            PREFERRED_FORMAT.color_space
        ),
    }
}

/// FIFO when vsync is requested; otherwise IMMEDIATE, then MAILBOX.
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    // IMMEDIATE: No vsync, lowest latency, may tear
    // MAILBOX: No vsync, no tearing, triple buffered
    // FIFO: Vsync enabled, guaranteed available
    [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| present_modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Requested size clamped into the surface's supported range.
///
/// Some platforms report a zero maximum below the minimum while minimized;
/// the maximum wins so the plan comes out degenerate.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    let (min, max) = (caps.min_image_extent, caps.max_image_extent);
    vk::Extent2D {
        width: width.max(min.width).min(max.width),
        height: height.max(min.height).min(max.height),
    }
}

/// One more than the minimum so acquisition does not stall on the driver,
/// capped by the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count.saturating_add(1);
    if caps.max_image_count > 0 {
        image_count.min(caps.max_image_count)
    } else {
        image_count
    }
}

pub fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&flag| caps.supported_composite_alpha.contains(flag))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Image acquisition and presentation, the two calls the frame loop makes on
/// a swapchain.
///
/// # Safety
///
/// Semaphores must be valid and follow the binary-semaphore signal/wait
/// pairing rules; `image_index` must come from a prior acquire.
pub trait PresentTarget {
    /// `Ok((index, suboptimal))`, or `ERROR_OUT_OF_DATE_KHR`.
    unsafe fn acquire_next_image(&self, timeout: u64, signal: vk::Semaphore) -> VkResult<(u32, bool)>;

    /// `Ok(suboptimal)`, or `ERROR_OUT_OF_DATE_KHR`.
    unsafe fn present(&self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool>;
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(device: Arc<VulkanDevice>, plan: &SwapchainPlan) -> Result<Self> {
        log::info!(
            "Creating swapchain: {}x{} {:?} {:?} ({} images requested)",
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            plan.present_mode,
            plan.image_count
        );

        let families = device.queue_families();
        let family_indices = families.unique();

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(plan.pre_transform)
            .composite_alpha(plan.composite_alpha)
            .present_mode(plan.present_mode)
            .clipped(true);

        create_info = if families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let loader = &device.swapchain_loader;
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match Self::create_image_view(&device, image, plan.surface_format.format) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    unsafe {
                        for view in image_views {
                            device.device.destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: plan.surface_format.format,
            extent: plan.extent,
            present_mode: plan.present_mode,
            device,
        })
    }

    fn create_image_view(
        device: &VulkanDevice,
        image: vk::Image,
        format: vk::Format,
    ) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe {
            device
                .device
                .create_image_view(&create_info, None)
                .context("Failed to create image view")
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl PresentTarget for Swapchain {
    unsafe fn acquire_next_image(&self, timeout: u64, signal: vk::Semaphore) -> VkResult<(u32, bool)> {
        self.device.swapchain_loader.acquire_next_image(
            self.swapchain,
            timeout,
            signal,
            vk::Fence::null(),
        )
    }

    unsafe fn present(&self, image_index: u32, wait: vk::Semaphore) -> VkResult<bool> {
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _queue = self.device.lock_queues();
        self.device
            .swapchain_loader
            .queue_present(self.device.present_queue(), &present_info)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain {:?}", self.swapchain);
        release(&*self.device, &mut self.swapchain, &mut self.image_views);
    }
}

/// Image views, then the swapchain they view. Both are left empty, so a
/// second call does nothing.
pub fn release<D: GpuDevice>(
    device: &D,
    swapchain: &mut vk::SwapchainKHR,
    image_views: &mut Vec<vk::ImageView>,
) {
    unsafe {
        for view in image_views.drain(..) {
            device.destroy_image_view(view);
        }
        device.destroy_swapchain(*swapchain);
    }
    *swapchain = vk::SwapchainKHR::null();
}
