// =============================================================================
// FRAME PIPELINE DEMO - a spinning triangle
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── Renderer                                                 │
// │          ├── VulkanDevice (instance, surface, queues)           │
// │          ├── Generation (swapchain + render pass + pipeline)    │
// │          ├── FrameLoop (command buffer, semaphores, fence)      │
// │          └── ResourceAllocator (vertex buffer)                  │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the previous frame's fence
// 2. Acquire swapchain image
// 3. Record: render pass, pipeline, push constants, draw
// 4. Submit and present
// 5. On a stale surface, rebuild the generation and carry on
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_pipeline::backend::memory::BufferWithMemory;
use frame_pipeline::backend::{PipelineDesc, ShaderSource, ShaderStage};
use frame_pipeline::{Config, FrameError, Renderer, RendererConfig};
use glam::{Mat4, Vec3};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame pipeline demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("VSync: {}", config.graphics.vsync);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Level from config.toml unless RUST_LOG says otherwise.
fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&config.debug.log_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

// =============================================================================
// GEOMETRY
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex { position: [0.0, -0.6], color: [1.0, 0.2, 0.2] },
    Vertex { position: [0.6, 0.5], color: [0.2, 1.0, 0.2] },
    Vertex { position: [-0.6, 0.5], color: [0.2, 0.2, 1.0] },
];

impl Vertex {
    fn binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    fn attributes() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
        ]
    }
}

fn shader_path(name: &str) -> ShaderSource {
    ShaderSource::Path(
        [env!("CARGO_MANIFEST_DIR"), "shaders", name]
            .iter()
            .collect(),
    )
}

fn renderer_config(config: &Config, width: u32, height: u32) -> RendererConfig {
    let mut swapchain = config.swapchain_config();
    swapchain.width = width;
    swapchain.height = height;

    RendererConfig {
        app_name: config.window.title.clone(),
        validation: config.debug.validation_layers,
        adapter: config.adapter_preference(),
        swapchain,
        pipeline: PipelineDesc {
            vertex_bindings: vec![Vertex::binding()],
            vertex_attributes: Vertex::attributes().to_vec(),
            push_constant_ranges: vec![vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: std::mem::size_of::<Mat4>() as u32,
            }],
            clear_color: config.graphics.clear_color,
            ..PipelineDesc::default()
        },
        vertex_shader: ShaderStage::vertex(shader_path("triangle.vert.spv")),
        fragment_shader: ShaderStage::fragment(shader_path("triangle.frag.spv")),
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Drop order matters: the vertex buffer goes before the renderer, and the
/// renderer before the window its surface was created from.
struct App {
    config: Config,

    vertex_buffer: Option<BufferWithMemory>,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// Set on resize or a stale surface; handled before the next frame.
    needs_rebuild: bool,
    started: Instant,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            vertex_buffer: None,
            renderer: None,
            window: None,
            is_fullscreen,
            needs_rebuild: false,
            started: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let renderer = Renderer::new(window, renderer_config(&self.config, size.width, size.height))?;

        let vertex_buffer = renderer
            .resources()
            .create_buffer_with_data(vk::BufferUsageFlags::VERTEX_BUFFER, &TRIANGLE)
            .context("Failed to upload triangle")?;

        self.vertex_buffer = Some(vertex_buffer);
        self.renderer = Some(renderer);
        Ok(())
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Returns whether a frame reached the screen.
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(renderer), Some(vertex_buffer)) = (self.renderer.as_mut(), &self.vertex_buffer) else {
            return Ok(false);
        };

        if self.needs_rebuild {
            let size = self.window.as_ref().map(|w| w.inner_size()).unwrap_or_default();
            renderer.resize(size.width, size.height)?;
            self.needs_rebuild = false;
        }

        let angle = self.started.elapsed().as_secs_f32();
        let vertex_buffer = vertex_buffer.raw();

        let drawn = match renderer.begin_draw() {
            Ok(frame) => {
                let extent = frame.extent();
                let aspect = extent.height as f32 / extent.width.max(1) as f32;
                let transform =
                    Mat4::from_scale(Vec3::new(aspect, 1.0, 1.0)) * Mat4::from_rotation_z(angle);

                let device = frame.device();
                let cmd = frame.command_buffer();
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        frame.pipeline_layout(),
                        vk::ShaderStageFlags::VERTEX,
                        0,
                        bytemuck::bytes_of(&transform),
                    );
                    device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[0]);
                    device.cmd_draw(cmd, TRIANGLE.len() as u32, 1, 0, 0);
                }
                frame.end()
            }
            Err(e) => Err(e),
        };

        match drawn {
            Ok(()) => Ok(true),
            Err(FrameError::Minimized) => Ok(false),
            Err(FrameError::SurfaceStale) => {
                self.needs_rebuild = true;
                Ok(false)
            }
            Err(e) => Err(e).context("Frame failed"),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_rebuild = true;
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let generation = self
                    .renderer
                    .as_ref()
                    .and_then(|r| r.generation())
                    .unwrap_or(0);
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [gen {}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    generation
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn shutdown(&mut self) {
        if let (Some(renderer), Some(buffer)) = (&self.renderer, self.vertex_buffer.take()) {
            if let Err(e) = renderer.device().wait_idle() {
                log::error!("{:#}", e);
            }
            renderer.resources().destroy_buffer_with_memory(buffer);
        }
        self.renderer = None;
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize renderer: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.needs_rebuild = true;
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:#}", e);
                    self.shutdown();
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws, except while minimized.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        let generation = self.renderer.as_ref().and_then(|r| r.generation());
        if !wants_redraw(self.renderer.is_some(), generation, self.needs_rebuild) {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

/// With no generation there is nothing to draw until a resize arrives.
fn wants_redraw(has_renderer: bool, generation: Option<u64>, needs_rebuild: bool) -> bool {
    !has_renderer || generation.is_some() || needs_rebuild
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
