// Renderer - one device, one pipeline, one frame loop
//
// Everything sized by the swapchain lives in a `Generation` and is rebuilt
// wholesale when the surface changes. Shaders, the frame loop and the
// allocator outlive generations.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use crate::backend::device::{AdapterPreference, DeviceOptions, GpuDevice, VulkanDevice};
use crate::backend::frame::{DrawContext, FrameError, FrameLoop, FrameState};
use crate::backend::memory::ResourceAllocator;
use crate::backend::pipeline::{full_scissor, full_viewport, Assembly, PipelineDesc};
use crate::backend::shader::{ShaderModule, ShaderStage};
use crate::backend::swapchain::{self, SurfaceSupport, Swapchain, SwapchainConfig, SwapchainPlan};

/// Everything needed to bring up a [`Renderer`].
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub app_name: String,
    pub validation: bool,
    pub adapter: AdapterPreference,
    pub swapchain: SwapchainConfig,
    pub pipeline: PipelineDesc,
    pub vertex_shader: ShaderStage,
    pub fragment_shader: ShaderStage,
}

/// Swapchain plus the objects that depend on its images and format.
struct Generation {
    version: u64,
    assembly: Assembly,
    swapchain: Swapchain,
    device: Arc<VulkanDevice>,
}

impl Drop for Generation {
    fn drop(&mut self) {
        log::debug!("Tearing down generation {}", self.version);
        release_generation(
            &*self.device,
            &mut self.assembly,
            &mut self.swapchain.swapchain,
            &mut self.swapchain.image_views,
        );
    }
}

/// Framebuffers, pipeline, layout and render pass go before the image views
/// and swapchain they were built on.
fn release_generation<D: GpuDevice>(
    device: &D,
    assembly: &mut Assembly,
    raw_swapchain: &mut vk::SwapchainKHR,
    image_views: &mut Vec<vk::ImageView>,
) {
    assembly.destroy(device);
    swapchain::release(device, raw_swapchain, image_views);
}

/// Plan for the next generation, or `None` while the window or surface has
/// zero extent. Surface support is only queried for a non-zero window.
fn next_plan(
    config: &SwapchainConfig,
    query_support: impl FnOnce() -> Result<SurfaceSupport>,
) -> Result<Option<SwapchainPlan>> {
    if config.width == 0 || config.height == 0 {
        log::info!("Window has zero size, deferring swapchain creation");
        return Ok(None);
    }

    let plan = swapchain::plan(config, &query_support()?)?;
    if plan.is_degenerate() {
        log::info!("Surface has zero extent, deferring swapchain creation");
        return Ok(None);
    }
    Ok(Some(plan))
}

pub struct Renderer {
    generation: Option<Generation>,
    frames: FrameLoop<VulkanDevice>,
    allocator: ResourceAllocator<VulkanDevice>,
    vertex_shader: ShaderModule,
    fragment_shader: ShaderModule,
    desc: PipelineDesc,
    swapchain_config: SwapchainConfig,
    versions_built: u64,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    /// Bring up the device for `window`, load shaders and build the first
    /// swapchain generation.
    ///
    /// A zero-sized window is not an error: no generation is built and
    /// [`begin_draw`](Self::begin_draw) reports [`FrameError::Minimized`].
    pub fn new<W>(window: &W, config: RendererConfig) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle,
    {
        let device = VulkanDevice::new(
            window,
            &DeviceOptions {
                app_name: config.app_name.clone(),
                enable_validation: config.validation,
                adapter: config.adapter,
            },
        )?;

        let vertex_shader = ShaderModule::new(&device, &config.vertex_shader)
            .context("Failed to load vertex shader")?;
        let fragment_shader = match ShaderModule::new(&device, &config.fragment_shader) {
            Ok(module) => module,
            Err(e) => {
                vertex_shader.destroy(&device.device);
                return Err(e.context("Failed to load fragment shader"));
            }
        };

        let frames = match FrameLoop::new(device.clone()) {
            Ok(frames) => frames,
            Err(e) => {
                vertex_shader.destroy(&device.device);
                fragment_shader.destroy(&device.device);
                return Err(e);
            }
        };
        let allocator = ResourceAllocator::new(device.clone());

        // From here on Drop releases whatever was built.
        let mut renderer = Self {
            generation: None,
            frames,
            allocator,
            vertex_shader,
            fragment_shader,
            desc: config.pipeline,
            swapchain_config: config.swapchain,
            versions_built: 0,
            device,
        };
        renderer.rebuild()?;

        log::info!("Renderer initialized");
        Ok(renderer)
    }

    /// Start a frame: acquire an image, begin the render pass with the clear
    /// color, bind the pipeline and set a full-extent viewport and scissor.
    pub fn begin_draw(&mut self) -> Result<Frame<'_>, FrameError> {
        let generation = self.generation.as_ref().ok_or(FrameError::Minimized)?;
        let ctx = self.frames.begin(&generation.swapchain)?;

        let cmd = ctx.command_buffer();
        let extent = generation.swapchain.extent;
        let assembly = &generation.assembly;
        let Some(&framebuffer) = assembly.framebuffers.get(ctx.image_index() as usize) else {
            log::warn!("Acquired image {} has no framebuffer", ctx.image_index());
            return Err(FrameError::SurfaceStale);
        };

        let device = &self.device.device;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.desc.clear_color,
            },
        }];
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(assembly.render_pass)
            .framebuffer(framebuffer)
            .render_area(full_scissor(extent))
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, assembly.pipeline);
            device.cmd_set_viewport(cmd, 0, &[full_viewport(extent)]);
            device.cmd_set_scissor(cmd, 0, &[full_scissor(extent)]);
        }

        Ok(Frame {
            ctx: Some(ctx),
            device,
            extent,
            render_pass: assembly.render_pass,
            pipeline_layout: assembly.pipeline_layout,
        })
    }

    /// Buffer and memory management for vertex/uniform data.
    pub fn resources(&self) -> &ResourceAllocator<VulkanDevice> {
        &self.allocator
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn frame_state(&self) -> FrameState {
        self.frames.state()
    }

    /// Current generation number; `None` while minimized.
    pub fn generation(&self) -> Option<u64> {
        self.generation.as_ref().map(|g| g.version)
    }

    pub fn render_pass(&self) -> Option<vk::RenderPass> {
        self.generation.as_ref().map(|g| g.assembly.render_pass)
    }

    pub fn pipeline_layout(&self) -> Option<vk::PipelineLayout> {
        self.generation.as_ref().map(|g| g.assembly.pipeline_layout)
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.generation.as_ref().map(|g| g.swapchain.extent)
    }

    pub fn format(&self) -> Option<vk::Format> {
        self.generation.as_ref().map(|g| g.swapchain.format)
    }

    /// Replace the swapchain and everything built on it.
    ///
    /// Waits for the device to go idle first. If the surface currently has
    /// zero extent the old generation is released and none is built.
    pub fn rebuild(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.generation = None;
        self.frames.target_rebuilt();

        let device = &self.device;
        let Some(plan) = next_plan(&self.swapchain_config, || SurfaceSupport::query(device))? else {
            return Ok(());
        };

        let swapchain = Swapchain::new(self.device.clone(), &plan)?;
        let assembly = Assembly::new(
            &self.device,
            &swapchain,
            &self.desc,
            &[&self.vertex_shader, &self.fragment_shader],
        )?;

        self.versions_built += 1;
        log::info!(
            "Built generation {}: {}x{} {:?}, {} images",
            self.versions_built,
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.present_mode,
            swapchain.image_count()
        );

        self.generation = Some(Generation {
            version: self.versions_built,
            assembly,
            swapchain,
            device: self.device.clone(),
        });
        Ok(())
    }

    /// Record the new window size and rebuild.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.swapchain_config.width = width;
        self.swapchain_config.height = height;
        self.rebuild()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer");
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }
        self.generation = None;
        self.vertex_shader.destroy(&self.device.device);
        self.fragment_shader.destroy(&self.device.device);
        // Remaining fields drop in declaration order: frame loop, allocator,
        // then the last reference to the device.
    }
}

/// A frame being recorded inside the render pass.
pub struct Frame<'a> {
    ctx: Option<DrawContext<'a, VulkanDevice, Swapchain>>,
    device: &'a ash::Device,
    extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
}

impl<'a> Frame<'a> {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.ctx.as_ref().map_or(vk::CommandBuffer::null(), |ctx| ctx.command_buffer())
    }

    /// For recording draw commands into [`command_buffer`](Self::command_buffer).
    pub fn device(&self) -> &'a ash::Device {
        self.device
    }

    pub fn image_index(&self) -> u32 {
        self.ctx.as_ref().map_or(0, |ctx| ctx.image_index())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    /// Close the render pass, submit and present.
    pub fn end(mut self) -> Result<(), FrameError> {
        match self.ctx.take() {
            Some(ctx) => {
                unsafe { self.device.cmd_end_render_pass(ctx.command_buffer()) };
                ctx.end()
            }
            None => Ok(()),
        }
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            unsafe { self.device.cmd_end_render_pass(ctx.command_buffer()) };
            // Dropping the context discards the recording.
            drop(ctx);
        }
    }
}
