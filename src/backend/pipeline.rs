// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// Everything here is bound to a swapchain's format and image views, so the
// whole set is rebuilt together with the swapchain.

use anyhow::{Context, Result};
use ash::vk;

use super::device::GpuDevice;
use super::shader::ShaderModule;
use super::swapchain::Swapchain;
use super::VulkanDevice;

/// Viewport and scissor are set per frame, so resizing never needs them baked in.
pub const DYNAMIC_STATES: [vk::DynamicState; 2] =
    [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

/// Fixed-function and layout description of the one pipeline a renderer owns.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Owned by the caller; must outlive the renderer.
    pub descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub alpha_blending: bool,
    pub clear_color: [f32; 4],
}

impl Default for PipelineDesc {
    fn default() -> Self {
        Self {
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            descriptor_set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            alpha_blending: false,
            clear_color: [0.1, 0.2, 0.8, 1.0],
        }
    }
}

/// The single color attachment: cleared on load, stored, handed to present.
pub fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build()
}

pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

fn blend_attachment(alpha_blending: bool) -> vk::PipelineColorBlendAttachmentState {
    let builder = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA);

    if alpha_blending {
        builder
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build()
    } else {
        builder.blend_enable(false).build()
    }
}

/// Render pass, layout, pipeline and framebuffers for one swapchain.
pub struct Assembly {
    pub render_pass: vk::RenderPass,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    /// Indexed by swapchain image index.
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl Assembly {
    pub fn new(
        device: &VulkanDevice,
        swapchain: &Swapchain,
        desc: &PipelineDesc,
        shaders: &[&ShaderModule],
    ) -> Result<Self> {
        let mut assembly = Self {
            render_pass: vk::RenderPass::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            framebuffers: Vec::new(),
        };

        // Destroying null handles is a no-op, so a partial assembly can be
        // torn down the same way as a complete one.
        if let Err(e) = assembly.build(device, swapchain, desc, shaders) {
            assembly.destroy(device);
            return Err(e);
        }

        log::info!(
            "Assembled pipeline for {:?} {}x{} ({} framebuffers)",
            swapchain.format,
            swapchain.extent.width,
            swapchain.extent.height,
            assembly.framebuffers.len()
        );

        Ok(assembly)
    }

    fn build(
        &mut self,
        device: &VulkanDevice,
        swapchain: &Swapchain,
        desc: &PipelineDesc,
        shaders: &[&ShaderModule],
    ) -> Result<()> {
        self.render_pass = create_render_pass(device, swapchain.format)?;
        self.pipeline_layout = create_pipeline_layout(device, desc)?;
        self.pipeline =
            create_graphics_pipeline(device, self.render_pass, self.pipeline_layout, desc, shaders)?;

        for &image_view in &swapchain.image_views {
            let framebuffer =
                create_framebuffer(device, image_view, self.render_pass, swapchain.extent)?;
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    /// Framebuffers, pipeline, layout, render pass - in that order.
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                device.destroy_framebuffer(framebuffer);
            }
            device.destroy_pipeline(self.pipeline);
            device.destroy_pipeline_layout(self.pipeline_layout);
            device.destroy_render_pass(self.render_pass);
        }
        self.pipeline = vk::Pipeline::null();
        self.pipeline_layout = vk::PipelineLayout::null();
        self.render_pass = vk::RenderPass::null();
    }
}

/// Create a render pass with a single color attachment
pub fn create_render_pass(device: &VulkanDevice, format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    // Color writes wait for the acquire semaphore's stage
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let attachments = &[color_attachment(format)];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    unsafe {
        device
            .device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

pub fn create_pipeline_layout(
    device: &VulkanDevice,
    desc: &PipelineDesc,
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&desc.descriptor_set_layouts)
        .push_constant_ranges(&desc.push_constant_ranges);

    unsafe {
        device
            .device
            .create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")
    }
}

/// Framebuffer for one swapchain image view
pub fn create_framebuffer(
    device: &VulkanDevice,
    image_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let attachments = &[image_view];
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    unsafe {
        device
            .device
            .create_framebuffer(&framebuffer_info, None)
            .context("Failed to create framebuffer")
    }
}

pub fn create_graphics_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    desc: &PipelineDesc,
    shaders: &[&ShaderModule],
) -> Result<vk::Pipeline> {
    let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> =
        shaders.iter().map(|shader| shader.stage_info()).collect();

    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&desc.vertex_bindings)
        .vertex_attribute_descriptions(&desc.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    // Counts only; the values come from cmd_set_viewport / cmd_set_scissor
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&DYNAMIC_STATES);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(desc.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachments = &[blend_attachment(desc.alpha_blending)];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| e)
            .context("Failed to create graphics pipeline")?
    };

    pipelines
        .into_iter()
        .next()
        .context("Driver returned no pipeline")
}
