// Renderer - wires the backend objects into a running frame loop
//
// IMPORTANT: field order is drop order. The frame loop goes first (it waits
// for the device and tears down the swapchain), the buffers and pipeline
// next, and the context last.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::buffer::Buffer;
use crate::backend::command::CommandContext;
use crate::backend::pipeline::MeshPipeline;
use crate::backend::swapchain::{choose_surface_format, SwapchainManager};
use crate::backend::VulkanContext;
use crate::config::Config;
use crate::frame::{FrameLoop, FrameOutcome, MeshBinding};
use crate::mesh::Mesh;

pub struct Renderer {
    frame_loop: FrameLoop<VulkanContext, CommandContext>,
    _index_buffer: Buffer,
    _vertex_buffer: Buffer,
    _pipeline: MeshPipeline,
    _context: Arc<VulkanContext>,
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

impl Renderer {
    pub fn new(window: &Window, config: &Config, mesh: &Mesh) -> Result<Self> {
        let context = Arc::new(VulkanContext::new(
            window,
            &config.window.title,
            config.validation_enabled(),
        )?);

        let surface_format = choose_surface_format(&context.surface_formats()?)
            .context("Surface reports no formats")?;
        log::info!("Surface format: {:?}", surface_format);

        let pipeline = MeshPipeline::new(
            Arc::clone(&context),
            surface_format.format,
            &config.shaders.vertex,
            &config.shaders.fragment,
        )?;

        let mut vertex_buffer = Buffer::allocate(
            Arc::clone(&context),
            config.graphics.vertex_buffer_bytes,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let mut index_buffer = Buffer::allocate(
            Arc::clone(&context),
            config.graphics.index_buffer_bytes,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        mesh.upload(&mut vertex_buffer, &mut index_buffer)?;

        let commands = Arc::new(CommandContext::new(Arc::clone(&context))?);

        let swapchain = SwapchainManager::create(
            Arc::clone(&context),
            surface_format,
            pipeline.render_pass,
            config.present_mode(),
            window_extent(window),
        )?;

        let binding = MeshBinding {
            pipeline: pipeline.pipeline,
            render_pass: pipeline.render_pass,
            vertex_buffer: vertex_buffer.handle(),
            index_buffer: index_buffer.handle(),
            index_count: mesh.index_count(),
            vertex_count: mesh.vertex_count(),
        };

        let frame_loop = FrameLoop::new(swapchain, commands, binding, config.graphics.clear_color)?;

        Ok(Self {
            frame_loop,
            _index_buffer: index_buffer,
            _vertex_buffer: vertex_buffer,
            _pipeline: pipeline,
            _context: context,
        })
    }

    /// Picked up by the next frame's resize check
    pub fn resize(&mut self, width: u32, height: u32) {
        self.frame_loop
            .swapchain_mut()
            .set_window_extent(vk::Extent2D { width, height });
    }

    pub fn render_frame(&mut self, close_requested: bool) -> Result<FrameOutcome> {
        self.frame_loop.run_iteration(close_requested)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frame_loop.frames_presented()
    }
}
