// Command recording and submission
//
// A single transient pool with one primary command buffer. The whole pool
// is reset at the start of each frame, which is only legal because the
// frame loop waits for the device to go idle at the end of the previous one.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanContext;
use crate::error::{RendererError, VkResultExt};
use crate::frame::{Acquired, FrameBackend, FrameCommands, LayoutTransition};

pub struct CommandContext {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    context: Arc<VulkanContext>,
}

impl CommandContext {
    pub fn new(context: Arc<VulkanContext>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.queue_family)
            // TRANSIENT: re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe { context.device.create_command_pool(&pool_info, None) }.vk("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = match unsafe { context.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(result) => {
                unsafe { context.device.destroy_command_pool(pool, None) };
                return Err(RendererError::Vulkan {
                    call: "vkAllocateCommandBuffers",
                    result,
                }
                .into());
            }
        };

        Ok(Self {
            pool,
            command_buffer,
            context,
        })
    }

    fn barrier(&self, image: vk::Image, transition: &LayoutTransition) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
            .build();

        unsafe {
            self.context.device.cmd_pipeline_barrier(
                self.command_buffer,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::BY_REGION,
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl FrameBackend for CommandContext {
    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let semaphore =
            unsafe { self.context.device.create_semaphore(&semaphore_info, None) }.vk("vkCreateSemaphore")?;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.context.device.destroy_semaphore(semaphore, None) };
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> Result<Acquired> {
        let result = unsafe {
            self.context
                .swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        };

        match result {
            // Suboptimal still signals the semaphore, so the frame goes ahead
            Ok((index, _suboptimal)) => Ok(Acquired::Image(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(result) => Err(RendererError::Vulkan {
                call: "vkAcquireNextImageKHR",
                result,
            }
            .into()),
        }
    }

    fn reset_command_pool(&self) -> Result<()> {
        unsafe {
            self.context
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
        }
        .vk("vkResetCommandPool")?;
        Ok(())
    }

    fn record(&self, commands: &FrameCommands) -> Result<()> {
        let device = &self.context.device;
        let cmd = self.command_buffer;

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }.vk("vkBeginCommandBuffer")?;

        self.barrier(commands.image, &commands.pre_pass);

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: commands.clear_color,
            },
        }];

        let pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(commands.render_pass)
            .framebuffer(commands.framebuffer)
            .render_area(commands.render_area)
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);

            device.cmd_set_viewport(cmd, 0, &[commands.viewport]);
            device.cmd_set_scissor(cmd, 0, &[commands.scissor]);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, commands.pipeline);
            device.cmd_bind_vertex_buffers(cmd, 0, &[commands.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, commands.index_buffer, 0, vk::IndexType::UINT32);

            for draw in &commands.draws {
                device.cmd_draw_indexed(
                    cmd,
                    draw.index_count,
                    draw.instance_count,
                    draw.first_index,
                    draw.vertex_offset,
                    draw.first_instance,
                );
            }

            device.cmd_end_render_pass(cmd);
        }

        self.barrier(commands.image, &commands.post_pass);

        unsafe { device.end_command_buffer(cmd) }.vk("vkEndCommandBuffer")?;
        Ok(())
    }

    fn submit(&self, wait: vk::Semaphore, wait_stage: vk::PipelineStageFlags, signal: vk::Semaphore) -> Result<()> {
        let wait_semaphores = [wait];
        let wait_stages = [wait_stage];
        let command_buffers = [self.command_buffer];
        let signal_semaphores = [signal];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.context
                .device
                .queue_submit(self.context.queue, &[submit_info], vk::Fence::null())
        }
        .vk("vkQueueSubmit")?;
        Ok(())
    }

    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.context
                .swapchain_loader
                .queue_present(self.context.queue, &present_info)
        };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(result) => Err(RendererError::Vulkan {
                call: "vkQueuePresentKHR",
                result,
            }
            .into()),
        }
    }

    fn wait_idle(&self) -> Result<()> {
        self.context.wait_idle()
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        // Also frees the command buffer
        unsafe { self.context.device.destroy_command_pool(self.pool, None) };
    }
}
