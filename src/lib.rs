//! Vulkan frame pipeline: device bring-up, explicit buffer management,
//! swapchain lifecycle, a single graphics pipeline and a one-frame-in-flight
//! draw loop.
//!
//! ```no_run
//! # fn demo(window: &winit::window::Window, config: frame_pipeline::RendererConfig) -> anyhow::Result<()> {
//! use frame_pipeline::{FrameError, Renderer};
//!
//! let mut renderer = Renderer::new(window, config)?;
//! let drawn = match renderer.begin_draw() {
//!     Ok(frame) => {
//!         unsafe { frame.device().cmd_draw(frame.command_buffer(), 3, 1, 0, 0) };
//!         frame.end()
//!     }
//!     Err(e) => Err(e),
//! };
//! match drawn {
//!     Ok(()) | Err(FrameError::Minimized) => {}
//!     Err(FrameError::SurfaceStale) => renderer.rebuild()?,
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod renderer;

pub use backend::frame::{FrameError, FrameState};
pub use config::Config;
pub use renderer::{Frame, Renderer, RendererConfig};
