// Frame orchestration
//
// One frame in flight. A frame is: wait for the previous frame's fence,
// acquire an image, record, submit, present. The fence is reset right before
// submit, so any early exit (stale surface, abandoned frame) leaves it
// signaled and the next wait returns immediately.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

use super::device::{GpuDevice, SubmitBatch};
use super::swapchain::PresentTarget;
use super::sync::FrameSync;

/// Why a frame could not be started or finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The surface changed; rebuild the swapchain and its dependents.
    #[error("swapchain is out of date with its surface")]
    SurfaceStale,
    /// The window has zero extent; nothing can be presented.
    #[error("surface has zero extent")]
    Minimized,
    #[error("device error: {0}")]
    Device(vk::Result),
}

/// Where the frame loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
    SurfaceStale,
}

/// Drives begin/end of frames over a [`PresentTarget`].
///
/// Only one [`DrawContext`] can exist at a time; it mutably borrows the loop.
///
/// ```compile_fail
/// use frame_pipeline::backend::{FrameLoop, GpuDevice, PresentTarget};
///
/// fn nested<D: GpuDevice, T: PresentTarget>(frames: &mut FrameLoop<D>, target: &T) {
///     let outer = frames.begin(target);
///     let inner = frames.begin(target);
///     drop((outer, inner));
/// }
/// ```
pub struct FrameLoop<D: GpuDevice> {
    device: Arc<D>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    sync: FrameSync,
    state: FrameState,
    /// `image_available` was signaled by an acquire nobody waited on.
    image_available_stale: bool,
    /// An acquired image was never presented; only a new target frees it.
    image_held: bool,
}

impl<D: GpuDevice> FrameLoop<D> {
    pub fn new(device: Arc<D>) -> Result<Self> {
        let sync = FrameSync::new(&*device)?;

        let command_pool = match unsafe { device.create_command_pool() } {
            Ok(pool) => pool,
            Err(e) => {
                sync.destroy(&*device);
                return Err(e).context("Failed to create command pool");
            }
        };
        let command_buffer = match unsafe { device.allocate_command_buffer(command_pool) } {
            Ok(cmd) => cmd,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool) };
                sync.destroy(&*device);
                return Err(e).context("Failed to allocate command buffer");
            }
        };

        Ok(Self {
            device,
            command_pool,
            command_buffer,
            sync,
            state: FrameState::Idle,
            image_available_stale: false,
            image_held: false,
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn sync(&self) -> &FrameSync {
        &self.sync
    }

    /// The target was rebuilt. Images held by abandoned frames went away
    /// with the old one, so [`begin`](Self::begin) may acquire again.
    pub fn target_rebuilt(&mut self) {
        self.image_held = false;
        self.state = FrameState::Idle;
    }

    /// Wait for the previous frame, acquire an image and start recording.
    ///
    /// Returns [`FrameError::SurfaceStale`] if the target reports it is out
    /// of date; no GPU work is queued in that case. After a frame was
    /// abandoned it keeps returning `SurfaceStale` without acquiring until
    /// [`target_rebuilt`](Self::target_rebuilt) is called.
    pub fn begin<'a, T: PresentTarget>(
        &'a mut self,
        target: &'a T,
    ) -> Result<DrawContext<'a, D, T>, FrameError> {
        if self.image_held {
            // Acquiring past the images the target can hand out never returns.
            log::debug!("Previous image was never presented, target must be rebuilt");
            self.state = FrameState::SurfaceStale;
            return Err(FrameError::SurfaceStale);
        }

        if self.image_available_stale {
            // A signaled semaphore must not be signaled again by acquire.
            self.device.device_wait_idle().map_err(FrameError::Device)?;
            self.sync
                .recycle_image_available(&*self.device)
                .map_err(FrameError::Device)?;
            self.image_available_stale = false;
        }

        // ─────────────────────────────────────────────────────────────────
        // STEP 1: Wait for the previous frame's GPU work
        // ─────────────────────────────────────────────────────────────────
        unsafe {
            self.device
                .wait_for_fence(self.sync.in_flight_fence, u64::MAX)
                .map_err(FrameError::Device)?;
        }

        // ─────────────────────────────────────────────────────────────────
        // STEP 2: Acquire the next image
        // ─────────────────────────────────────────────────────────────────
        let acquired = unsafe { target.acquire_next_image(u64::MAX, self.sync.image_available) };
        let (image_index, suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date at acquire");
                self.state = FrameState::SurfaceStale;
                return Err(FrameError::SurfaceStale);
            }
            Err(e) => return Err(FrameError::Device(e)),
        };
        if suboptimal {
            log::debug!("Swapchain suboptimal at acquire, finishing frame first");
        }

        // ─────────────────────────────────────────────────────────────────
        // STEP 3: Start recording
        // ─────────────────────────────────────────────────────────────────
        if let Err(e) = self.start_recording() {
            self.image_available_stale = true;
            self.image_held = true;
            self.state = FrameState::SurfaceStale;
            return Err(FrameError::Device(e));
        }
        self.state = FrameState::Recording;

        Ok(DrawContext {
            frames: self,
            target,
            image_index,
            suboptimal,
            finished: false,
        })
    }

    fn start_recording(&self) -> VkResult<()> {
        unsafe {
            self.device.reset_command_buffer(self.command_buffer)?;
            self.device.begin_command_buffer(self.command_buffer)
        }
    }

    /// End recording, submit, present.
    fn finish<T: PresentTarget>(
        &mut self,
        target: &T,
        image_index: u32,
        acquire_suboptimal: bool,
    ) -> Result<(), FrameError> {
        let device = Arc::clone(&self.device);
        let FrameSync {
            image_available,
            render_finished,
            in_flight_fence,
        } = self.sync;

        if let Err(e) = unsafe { device.end_command_buffer(self.command_buffer) } {
            self.abandon();
            return Err(FrameError::Device(e));
        }

        // ─────────────────────────────────────────────────────────────────
        // STEP 4: Submit
        // ─────────────────────────────────────────────────────────────────
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffer];
        let signal_semaphores = [render_finished];
        let batch = SubmitBatch {
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            command_buffers: &command_buffers,
            signal_semaphores: &signal_semaphores,
        };

        let submitted = unsafe {
            device.reset_fence(in_flight_fence).and_then(|()| {
                device.submit_graphics(&batch, in_flight_fence).map_err(|e| {
                    // Keep the fence signalable so the next wait cannot hang.
                    let empty = SubmitBatch::default();
                    if let Err(e) = device.submit_graphics(&empty, in_flight_fence) {
                        log::error!("Failed to restore in-flight fence: {}", e);
                    }
                    e
                })
            })
        };
        if let Err(e) = submitted {
            self.image_available_stale = true;
            self.image_held = true;
            self.state = FrameState::SurfaceStale;
            return Err(FrameError::Device(e));
        }
        self.state = FrameState::Submitted;

        // ─────────────────────────────────────────────────────────────────
        // STEP 5: Present
        // ─────────────────────────────────────────────────────────────────
        let presented = unsafe { target.present(image_index, render_finished) };
        match presented {
            Ok(false) if !acquire_suboptimal => {
                self.state = FrameState::Idle;
                Ok(())
            }
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain stale after present");
                self.state = FrameState::SurfaceStale;
                Err(FrameError::SurfaceStale)
            }
            Err(e) => {
                self.state = FrameState::Idle;
                Err(FrameError::Device(e))
            }
        }
    }

    /// Drop an in-progress recording without submitting. The acquired image
    /// stays with the target until it is rebuilt.
    fn abandon(&mut self) {
        unsafe {
            if let Err(e) = self.device.end_command_buffer(self.command_buffer) {
                log::trace!("end_command_buffer on abandoned frame: {}", e);
            }
            if let Err(e) = self.device.reset_command_buffer(self.command_buffer) {
                log::error!("Failed to reset abandoned command buffer: {}", e);
            }
        }
        self.image_available_stale = true;
        self.image_held = true;
        self.state = FrameState::SurfaceStale;
    }
}

impl<D: GpuDevice> Drop for FrameLoop<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.device_wait_idle() {
            log::error!("Failed to wait for device idle: {}", e);
        }
        unsafe { self.device.destroy_command_pool(self.command_pool) };
        self.sync.destroy(&*self.device);
    }
}

/// An open frame: the command buffer is recording into `image_index`.
///
/// Finish with [`end`](Self::end). Dropping it instead discards the
/// recording and nothing is submitted or presented; the next
/// [`FrameLoop::begin`] then reports [`FrameError::SurfaceStale`].
pub struct DrawContext<'a, D: GpuDevice, T: PresentTarget> {
    frames: &'a mut FrameLoop<D>,
    target: &'a T,
    image_index: u32,
    suboptimal: bool,
    finished: bool,
}

impl<'a, D: GpuDevice, T: PresentTarget> DrawContext<'a, D, T> {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.frames.command_buffer
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Acquire reported the swapchain as suboptimal; `end` will report
    /// [`FrameError::SurfaceStale`] after presenting.
    pub fn is_suboptimal(&self) -> bool {
        self.suboptimal
    }

    pub fn end(mut self) -> Result<(), FrameError> {
        self.finished = true;
        let (target, image_index, suboptimal) = (self.target, self.image_index, self.suboptimal);
        self.frames.finish(target, image_index, suboptimal)
    }
}

impl<D: GpuDevice, T: PresentTarget> Drop for DrawContext<'_, D, T> {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("Frame for image {} dropped without end(), discarding", self.image_index);
            self.frames.abandon();
        }
    }
}
