// Synchronization primitives
//
// One set per frame in flight; this renderer keeps a single frame in flight,
// so exactly one set exists for the renderer's lifetime.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;

use super::device::GpuDevice;

/// Frame synchronization objects
pub struct FrameSync {
    /// Signaled by image acquisition, waited on by the graphics submit.
    pub image_available: vk::Semaphore,
    /// Signaled by the graphics submit, waited on by presentation.
    pub render_finished: vk::Semaphore,
    /// Signaled when the frame's GPU work completes. Starts signaled.
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new<D: GpuDevice>(device: &D) -> Result<Self> {
        unsafe {
            let image_available = device
                .create_semaphore()
                .context("Failed to create image-available semaphore")?;
            let render_finished = match device.create_semaphore() {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available);
                    return Err(e).context("Failed to create render-finished semaphore");
                }
            };
            let in_flight_fence = match device.create_fence(true) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available);
                    device.destroy_semaphore(render_finished);
                    return Err(e).context("Failed to create in-flight fence");
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    /// Replace the image-available semaphore, e.g. after an acquire whose
    /// signal was never waited on. The device must be idle.
    pub fn recycle_image_available<D: GpuDevice>(&mut self, device: &D) -> VkResult<()> {
        unsafe {
            let fresh = device.create_semaphore()?;
            device.destroy_semaphore(self.image_available);
            self.image_available = fresh;
        }
        Ok(())
    }

    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        unsafe {
            device.destroy_semaphore(self.image_available);
            device.destroy_semaphore(self.render_finished);
            device.destroy_fence(self.in_flight_fence);
        }
    }
}
