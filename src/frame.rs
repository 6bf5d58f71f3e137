// Frame loop
//
// FRAME FLOW (one frame at a time, never overlapping):
// 1. Resize swapchain if the surface changed
// 2. Acquire image         (signals acquire semaphore)
// 3. Reset command pool    (previous frame finished at step 7)
// 4. Record the draw
// 5. Submit                (waits acquire, signals release)
// 6. Present               (waits release)
// 7. Wait for device idle

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use crate::backend::swapchain::{SwapchainBackend, SwapchainManager};
use crate::backend::sync::FrameSync;

/// Where the loop is within the current iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

/// Result of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { image_index: u32 },
    /// The swapchain went stale before an image could be acquired
    Skipped,
    /// Close was requested; nothing was submitted
    Closed,
}

/// Result of asking the presentation engine for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image(u32),
    OutOfDate,
}

/// Image layout change recorded as a pipeline barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl LayoutTransition {
    /// Contents are discarded; the render pass clears the image anyway
    pub const TO_COLOR_ATTACHMENT: Self = Self {
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access: vk::AccessFlags::empty(),
        dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    };

    pub const TO_PRESENT: Self = Self {
        old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dst_access: vk::AccessFlags::empty(),
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIndexed {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// GPU objects a frame draws with. Counts come from the uploaded mesh.
#[derive(Debug, Clone, Copy)]
pub struct MeshBinding {
    pub pipeline: vk::Pipeline,
    pub render_pass: vk::RenderPass,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub vertex_count: u32,
}

/// Everything recorded into one frame's command buffer, in recording order
#[derive(Debug, Clone)]
pub struct FrameCommands {
    pub image: vk::Image,
    pub framebuffer: vk::Framebuffer,
    pub pre_pass: LayoutTransition,
    pub render_pass: vk::RenderPass,
    pub render_area: vk::Rect2D,
    pub clear_color: [f32; 4],
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub pipeline: vk::Pipeline,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub draws: Vec<DrawIndexed>,
    pub post_pass: LayoutTransition,
}

impl FrameCommands {
    pub fn new(
        binding: &MeshBinding,
        image: vk::Image,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    ) -> Self {
        let full = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        Self {
            image,
            framebuffer,
            pre_pass: LayoutTransition::TO_COLOR_ATTACHMENT,
            render_pass: binding.render_pass,
            render_area: full,
            clear_color,
            viewport: flipped_viewport(extent),
            scissor: full,
            pipeline: binding.pipeline,
            vertex_buffer: binding.vertex_buffer,
            index_buffer: binding.index_buffer,
            draws: vec![DrawIndexed {
                index_count: binding.index_count,
                instance_count: 1,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            }],
            post_pass: LayoutTransition::TO_PRESENT,
        }
    }
}

/// Viewport with negative height so +Y points up in clip space
pub fn flipped_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: extent.height as f32,
        width: extent.width as f32,
        height: -(extent.height as f32),
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Graphics API calls made once per frame
pub trait FrameBackend {
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Waits without timeout
    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> Result<Acquired>;
    fn reset_command_pool(&self) -> Result<()>;
    fn record(&self, commands: &FrameCommands) -> Result<()>;
    fn submit(&self, wait: vk::Semaphore, wait_stage: vk::PipelineStageFlags, signal: vk::Semaphore) -> Result<()>;
    /// Returns true when the swapchain no longer matches the surface
    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> Result<bool>;
    fn wait_idle(&self) -> Result<()>;
}

/// Drives acquire → record → submit → present, one frame in flight
pub struct FrameLoop<S: SwapchainBackend, F: FrameBackend> {
    // Dropped first: swapchain teardown waits for the device
    swapchain: SwapchainManager<S>,
    sync: FrameSync,
    backend: Arc<F>,
    binding: MeshBinding,
    clear_color: [f32; 4],
    state: FrameState,
    frames_presented: u64,
}

impl<S: SwapchainBackend, F: FrameBackend> FrameLoop<S, F> {
    pub fn new(
        swapchain: SwapchainManager<S>,
        backend: Arc<F>,
        binding: MeshBinding,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let sync = FrameSync::new(backend.as_ref())?;

        log::info!(
            "Frame loop ready: {} vertices, {} indices",
            binding.vertex_count,
            binding.index_count
        );

        Ok(Self {
            swapchain,
            sync,
            backend,
            binding,
            clear_color,
            state: FrameState::Idle,
            frames_presented: 0,
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn swapchain(&self) -> &SwapchainManager<S> {
        &self.swapchain
    }

    pub fn swapchain_mut(&mut self) -> &mut SwapchainManager<S> {
        &mut self.swapchain
    }

    /// Run iterations until `should_close` reports true at the top of one
    pub fn run(&mut self, mut should_close: impl FnMut() -> bool) -> Result<()> {
        while self.run_iteration(should_close())? != FrameOutcome::Closed {}
        Ok(())
    }

    /// One full frame. The close signal is only looked at here, before any
    /// GPU work, so a frame is never abandoned halfway.
    pub fn run_iteration(&mut self, close_requested: bool) -> Result<FrameOutcome> {
        debug_assert_eq!(self.state, FrameState::Idle);

        if close_requested {
            return Ok(FrameOutcome::Closed);
        }

        self.swapchain.resize()?;

        self.state = FrameState::Acquiring;
        let swapchain = self.swapchain.current();
        let image_index = match self.backend.acquire_next_image(swapchain.handle, self.sync.acquire)? {
            Acquired::Image(index) => index,
            Acquired::OutOfDate => {
                // Acquire semaphore was not signalled, nothing to unwind
                log::debug!("Swapchain out of date on acquire, skipping frame");
                self.swapchain.mark_out_of_date();
                self.state = FrameState::Idle;
                return Ok(FrameOutcome::Skipped);
            }
        };

        // Safe unconditionally: the previous iteration ended with a full idle wait
        self.backend.reset_command_pool()?;

        self.state = FrameState::Recording;
        let index = image_index as usize;
        let commands = FrameCommands::new(
            &self.binding,
            swapchain.images[index],
            swapchain.framebuffers[index],
            swapchain.extent,
            self.clear_color,
        );
        self.backend.record(&commands)?;

        self.backend.submit(
            self.sync.acquire,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            self.sync.release,
        )?;
        self.state = FrameState::Submitted;

        self.state = FrameState::Presenting;
        let stale = self
            .backend
            .present(swapchain.handle, image_index, self.sync.release)?;
        if stale {
            self.swapchain.mark_out_of_date();
        }

        // Single frame in flight: the next iteration may reuse everything
        self.backend.wait_idle()?;
        self.state = FrameState::Idle;
        self.frames_presented += 1;

        log::trace!("Presented frame {} (image {})", self.frames_presented, image_index);

        Ok(FrameOutcome::Presented { image_index })
    }
}

impl<S: SwapchainBackend, F: FrameBackend> Drop for FrameLoop<S, F> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Device did not go idle before frame loop teardown: {}", e);
        }
        self.sync.destroy(self.backend.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Mesh;
    use crate::testing::{Call, FakeGpu};
    use ash::vk::Handle;
    use std::path::Path;

    const CLEAR: [f32; 4] = [0.1, 0.2, 0.3, 1.0];

    fn binding(index_count: u32, vertex_count: u32) -> MeshBinding {
        MeshBinding {
            pipeline: vk::Pipeline::from_raw(0xB0),
            render_pass: vk::RenderPass::from_raw(0xB1),
            vertex_buffer: vk::Buffer::from_raw(0xB2),
            index_buffer: vk::Buffer::from_raw(0xB3),
            index_count,
            vertex_count,
        }
    }

    fn frame_loop(gpu: &Arc<FakeGpu>, binding: MeshBinding) -> FrameLoop<FakeGpu, FakeGpu> {
        let swapchain = SwapchainManager::create(
            Arc::clone(gpu),
            FakeGpu::SURFACE_FORMAT,
            binding.render_pass,
            vk::PresentModeKHR::FIFO,
            vk::Extent2D { width: 640, height: 480 },
        )
        .unwrap();
        FrameLoop::new(swapchain, Arc::clone(gpu), binding, CLEAR).unwrap()
    }

    fn per_frame(calls: &[Call]) -> Vec<&'static str> {
        calls.iter().map(Call::name).collect()
    }

    #[test]
    fn iteration_runs_steps_in_order() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));
        gpu.clear_calls();

        let outcome = frames.run_iteration(false).unwrap();
        assert_eq!(outcome, FrameOutcome::Presented { image_index: 0 });
        assert_eq!(frames.state(), FrameState::Idle);
        assert_eq!(
            per_frame(&gpu.calls()),
            vec![
                "surface_capabilities",
                "acquire",
                "reset_command_pool",
                "record",
                "submit",
                "present",
                "wait_idle",
            ]
        );
    }

    #[test]
    fn semaphores_chain_acquire_submit_present() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));
        gpu.clear_calls();
        frames.run_iteration(false).unwrap();

        let calls = gpu.calls();
        let acquire = calls.iter().find_map(|c| match c {
            Call::Acquire { signal, .. } => Some(*signal),
            _ => None,
        });
        let (wait, stage, signal) = calls
            .iter()
            .find_map(|c| match c {
                Call::Submit { wait, stage, signal } => Some((*wait, *stage, *signal)),
                _ => None,
            })
            .unwrap();
        let present_wait = calls.iter().find_map(|c| match c {
            Call::Present { wait, .. } => Some(*wait),
            _ => None,
        });

        assert_eq!(acquire, Some(wait));
        assert_eq!(stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(present_wait, Some(signal));
        assert_ne!(wait, signal);
    }

    #[test]
    fn close_signal_stops_before_any_gpu_work() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));
        gpu.clear_calls();

        assert_eq!(frames.run_iteration(true).unwrap(), FrameOutcome::Closed);
        assert!(gpu.calls().is_empty());
        assert_eq!(frames.frames_presented(), 0);
    }

    #[test]
    fn run_stops_when_close_is_observed() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));

        let mut checks = 0;
        frames
            .run(|| {
                checks += 1;
                checks > 4
            })
            .unwrap();

        assert_eq!(frames.frames_presented(), 4);
        assert_eq!(checks, 5);
    }

    #[test]
    fn recorded_frame_flips_viewport_and_covers_extent() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(36, 24));
        frames.run_iteration(false).unwrap();

        let recorded = gpu.recorded();
        let commands = recorded.last().unwrap();
        assert_eq!(commands.pre_pass.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(commands.pre_pass.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(commands.post_pass.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(commands.post_pass.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);

        assert_eq!(commands.viewport.y, 480.0);
        assert_eq!(commands.viewport.height, -480.0);
        assert_eq!(commands.viewport.width, 640.0);
        assert_eq!(commands.scissor.extent, vk::Extent2D { width: 640, height: 480 });
        assert_eq!(commands.clear_color, CLEAR);
        assert_eq!(commands.draws.len(), 1);
        assert_eq!(commands.draws[0].index_count, 36);
    }

    #[test]
    fn resize_between_frames_changes_recorded_extent() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));
        frames.run_iteration(false).unwrap();

        gpu.set_extent(1920, 1080);
        frames.run_iteration(false).unwrap();

        let recorded = gpu.recorded();
        let commands = recorded.last().unwrap();
        assert_eq!(commands.scissor.extent, vk::Extent2D { width: 1920, height: 1080 });
        assert_eq!(commands.framebuffer, frames.swapchain().current().framebuffers[0]);
        assert_eq!(frames.swapchain().generation(), 1);
    }

    #[test]
    fn out_of_date_acquire_skips_frame_and_forces_rebuild() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));

        gpu.fail_next_acquire();
        assert_eq!(frames.run_iteration(false).unwrap(), FrameOutcome::Skipped);
        assert_eq!(frames.state(), FrameState::Idle);
        assert!(gpu.recorded().is_empty());

        assert!(matches!(frames.run_iteration(false).unwrap(), FrameOutcome::Presented { .. }));
        assert_eq!(frames.swapchain().generation(), 1);
    }

    #[test]
    fn stale_present_rebuilds_swapchain_on_next_iteration() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));
        let original = frames.swapchain().current().handle;

        gpu.stale_next_present();
        assert!(matches!(frames.run_iteration(false).unwrap(), FrameOutcome::Presented { .. }));
        assert_eq!(frames.swapchain().generation(), 0);

        gpu.clear_calls();
        frames.run_iteration(false).unwrap();
        assert_eq!(frames.swapchain().generation(), 1);
        assert_ne!(frames.swapchain().current().handle, original);
        assert_eq!(frames.swapchain().current().extent, vk::Extent2D { width: 640, height: 480 });
        assert!(gpu.calls().contains(&Call::DestroySwapchain(original)));

        // A healthy present leaves the new chain alone
        frames.run_iteration(false).unwrap();
        assert_eq!(frames.swapchain().generation(), 1);
    }

    #[test]
    fn acquired_index_selects_image_and_framebuffer() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));
        gpu.set_next_image(2);

        assert_eq!(frames.run_iteration(false).unwrap(), FrameOutcome::Presented { image_index: 2 });
        let recorded = gpu.recorded();
        let swapchain = frames.swapchain().current();
        assert_eq!(recorded[0].image, swapchain.images[2]);
        assert_eq!(recorded[0].framebuffer, swapchain.framebuffers[2]);
    }

    #[test]
    fn failed_submit_is_fatal() {
        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(3, 3));
        gpu.fail_submit();

        assert!(frames.run_iteration(false).is_err());
        assert_eq!(frames.state(), FrameState::Recording);
    }

    #[test]
    fn drop_releases_both_semaphores() {
        let gpu = FakeGpu::new(640, 480);
        let frames = frame_loop(&gpu, binding(3, 3));
        gpu.clear_calls();
        drop(frames);

        let destroyed = gpu
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::DestroySemaphore(_)))
            .count();
        assert_eq!(destroyed, 2);
    }

    #[test]
    fn triangle_model_draws_once_with_three_indices() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/triangle.obj");
        let mesh = Mesh::load(path).unwrap();

        let gpu = FakeGpu::new(640, 480);
        let mut frames = frame_loop(&gpu, binding(mesh.index_count(), mesh.vertex_count()));
        frames.run_iteration(false).unwrap();

        let recorded = gpu.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].draws.len(), 1);
        assert_eq!(recorded[0].draws[0].index_count, 3);
        assert_eq!(recorded[0].draws[0].instance_count, 1);
        assert_eq!(mesh.vertex_count(), 3);
    }
}
