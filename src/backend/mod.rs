// Vulkan backend
//
// Device bring-up, buffers, swapchain, pipeline assembly and the frame loop.

pub mod device;
pub mod frame;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod mock;

pub use device::{AdapterPreference, DeviceOptions, GpuDevice, QueueFamilies, VulkanDevice};
pub use frame::{DrawContext, FrameError, FrameLoop, FrameState};
pub use memory::{BufferHandle, BufferInfo, BufferWithMemory, MemoryHandle, MemoryInfo, ResourceAllocator};
pub use pipeline::{Assembly, PipelineDesc};
pub use shader::{ShaderModule, ShaderSource, ShaderStage};
pub use swapchain::{FormatFallback, PresentTarget, Swapchain, SwapchainConfig, SwapchainPlan};
