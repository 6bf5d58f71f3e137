// Graphics pipeline creation
//
// One render pass with a single color attachment and one pipeline drawing
// interleaved mesh vertices. Viewport and scissor are dynamic so resizes do
// not rebuild the pipeline.

use anyhow::Result;
use ash::vk;
use std::mem::{offset_of, size_of};
use std::path::Path;
use std::sync::Arc;

use super::shader::ShaderModule;
use super::VulkanContext;
use crate::error::{RendererError, VkResultExt};
use crate::mesh::Vertex;

/// Render pass for basic color attachment rendering.
///
/// The frame records its own layout barriers, so the attachment stays in
/// COLOR_ATTACHMENT_OPTIMAL on both ends of the pass.
fn create_render_pass(context: &VulkanContext, format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .build();

    let attachments = [color_attachment];
    let subpasses = [subpass];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses);

    let render_pass =
        unsafe { context.device.create_render_pass(&render_pass_info, None) }.vk("vkCreateRenderPass")?;
    Ok(render_pass)
}

/// Vertex input description matching `mesh::Vertex`
pub fn vertex_input_info() -> (
    [vk::VertexInputBindingDescription; 1],
    [vk::VertexInputAttributeDescription; 3],
) {
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };

    let attribute = |location: u32, format: vk::Format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    };

    (
        [binding],
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, normal)),
            attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, texcoord)),
        ],
    )
}

/// Render pass, layout and pipeline, destroyed together
pub struct MeshPipeline {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    context: Arc<VulkanContext>,
}

impl MeshPipeline {
    pub fn new(context: Arc<VulkanContext>, format: vk::Format, vertex_shader: &Path, fragment_shader: &Path) -> Result<Self> {
        let vert = ShaderModule::load(&context, vertex_shader)?;
        let frag = ShaderModule::load(&context, fragment_shader)?;

        let render_pass = create_render_pass(&context, format)?;

        let layout_info = vk::PipelineLayoutCreateInfo::builder();
        let layout = match unsafe { context.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(result) => {
                unsafe { context.device.destroy_render_pass(render_pass, None) };
                return Err(RendererError::Vulkan {
                    call: "vkCreatePipelineLayout",
                    result,
                }
                .into());
            }
        };

        let pipeline = match Self::create_pipeline(&context, render_pass, layout, &vert, &frag) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe {
                    context.device.destroy_pipeline_layout(layout, None);
                    context.device.destroy_render_pass(render_pass, None);
                }
                return Err(e);
            }
        };

        log::info!("Created mesh pipeline for {:?}", format);

        drop(vert);
        drop(frag);

        Ok(Self {
            render_pass,
            layout,
            pipeline,
            context,
        })
    }

    fn create_pipeline(
        context: &VulkanContext,
        render_pass: vk::RenderPass,
        layout: vk::PipelineLayout,
        vert: &ShaderModule<'_>,
        frag: &ShaderModule<'_>,
    ) -> Result<vk::Pipeline> {
        let entry_point = c"main";

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert.handle)
                .name(entry_point)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag.handle)
                .name(entry_point)
                .build(),
        ];

        let (bindings, attributes) = vertex_input_info();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::builder().topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        // Counts only; the actual rectangles are set per frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisampling =
            vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder();

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            context
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, result)| result)
        .vk("vkCreateGraphicsPipelines")?;

        Ok(pipelines[0])
    }
}

impl Drop for MeshPipeline {
    fn drop(&mut self) {
        unsafe {
            self.context.device.destroy_pipeline(self.pipeline, None);
            self.context.device.destroy_pipeline_layout(self.layout, None);
            self.context.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_attributes_match_interleaved_layout() {
        let (bindings, attributes) = vertex_input_info();
        assert_eq!(bindings[0].stride, 32);

        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);

        let locations: Vec<u32> = attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, vec![0, 1, 2]);
        assert_eq!(attributes[2].format, vk::Format::R32G32_SFLOAT);
    }
}
