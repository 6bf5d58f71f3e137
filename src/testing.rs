// Recording stand-in for the GPU, shared by the swapchain and frame tests

use anyhow::{bail, Result};
use ash::vk::{self, Handle};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::backend::swapchain::{SwapchainBackend, SwapchainRequest};
use crate::frame::{Acquired, FrameBackend, FrameCommands};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SurfaceCapabilities,
    PresentModes,
    CreateSwapchain(vk::SwapchainKHR),
    SwapchainImages(vk::SwapchainKHR),
    CreateImageView(vk::ImageView),
    CreateFramebuffer(vk::Framebuffer),
    WaitIdle,
    DestroyImageView(vk::ImageView),
    DestroyFramebuffer(vk::Framebuffer),
    DestroySwapchain(vk::SwapchainKHR),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    Acquire {
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    },
    ResetCommandPool,
    Record,
    Submit {
        wait: vk::Semaphore,
        stage: vk::PipelineStageFlags,
        signal: vk::Semaphore,
    },
    Present {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::SurfaceCapabilities => "surface_capabilities",
            Call::PresentModes => "present_modes",
            Call::CreateSwapchain(_) => "create_swapchain",
            Call::SwapchainImages(_) => "swapchain_images",
            Call::CreateImageView(_) => "create_image_view",
            Call::CreateFramebuffer(_) => "create_framebuffer",
            Call::WaitIdle => "wait_idle",
            Call::DestroyImageView(_) => "destroy_image_view",
            Call::DestroyFramebuffer(_) => "destroy_framebuffer",
            Call::DestroySwapchain(_) => "destroy_swapchain",
            Call::CreateSemaphore(_) => "create_semaphore",
            Call::DestroySemaphore(_) => "destroy_semaphore",
            Call::Acquire { .. } => "acquire",
            Call::ResetCommandPool => "reset_command_pool",
            Call::Record => "record",
            Call::Submit { .. } => "submit",
            Call::Present { .. } => "present",
        }
    }
}

/// Surface with a settable extent, three swapchain images and unique handles
pub struct FakeGpu {
    extent: Cell<vk::Extent2D>,
    next_handle: Cell<u64>,
    next_image: Cell<u32>,
    views_before_failure: Cell<Option<usize>>,
    acquire_out_of_date: Cell<bool>,
    present_stale: Cell<bool>,
    submit_fails: Cell<bool>,
    calls: RefCell<Vec<Call>>,
    requests: RefCell<Vec<SwapchainRequest>>,
    recorded: RefCell<Vec<FrameCommands>>,
}

impl FakeGpu {
    pub const SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    #[allow(clippy::arc_with_non_send_sync)]
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            extent: Cell::new(vk::Extent2D { width, height }),
            next_handle: Cell::new(1),
            next_image: Cell::new(0),
            views_before_failure: Cell::new(None),
            acquire_out_of_date: Cell::new(false),
            present_stale: Cell::new(false),
            submit_fails: Cell::new(false),
            calls: RefCell::new(Vec::new()),
            requests: RefCell::new(Vec::new()),
            recorded: RefCell::new(Vec::new()),
        })
    }

    pub fn set_extent(&self, width: u32, height: u32) {
        self.extent.set(vk::Extent2D { width, height });
    }

    pub fn set_next_image(&self, index: u32) {
        self.next_image.set(index);
    }

    pub fn fail_view_creation_after(&self, count: usize) {
        self.views_before_failure.set(Some(count));
    }

    pub fn fail_next_acquire(&self) {
        self.acquire_out_of_date.set(true);
    }

    /// Next present reports the swapchain as out of date or suboptimal
    pub fn stale_next_present(&self) {
        self.present_stale.set(true);
    }

    pub fn fail_submit(&self) {
        self.submit_fails.set(true);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn last_request(&self) -> Option<SwapchainRequest> {
        self.requests.borrow().last().copied()
    }

    pub fn recorded(&self) -> Vec<FrameCommands> {
        self.recorded.borrow().clone()
    }

    fn handle<H: Handle>(&self) -> H {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        H::from_raw(raw)
    }

    fn log(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl SwapchainBackend for FakeGpu {
    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        self.log(Call::SurfaceCapabilities);
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: self.extent.get(),
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::INHERIT,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        })
    }

    fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        self.log(Call::PresentModes);
        Ok(vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX])
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> Result<vk::SwapchainKHR> {
        let swapchain = self.handle();
        self.requests.borrow_mut().push(*request);
        self.log(Call::CreateSwapchain(swapchain));
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        self.log(Call::SwapchainImages(swapchain));
        let count = self.last_request().map_or(0, |r| r.min_image_count);
        Ok((0..count).map(|_| self.handle()).collect())
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        if let Some(remaining) = self.views_before_failure.get() {
            if remaining == 0 {
                bail!("image view creation failed");
            }
            self.views_before_failure.set(Some(remaining - 1));
        }
        let view = self.handle();
        self.log(Call::CreateImageView(view));
        Ok(view)
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _view: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let framebuffer = self.handle();
        self.log(Call::CreateFramebuffer(framebuffer));
        Ok(framebuffer)
    }

    fn wait_idle(&self) -> Result<()> {
        self.log(Call::WaitIdle);
        Ok(())
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.log(Call::DestroyImageView(view));
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.log(Call::DestroyFramebuffer(framebuffer));
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.log(Call::DestroySwapchain(swapchain));
    }
}

impl FrameBackend for FakeGpu {
    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore = self.handle();
        self.log(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.log(Call::DestroySemaphore(semaphore));
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> Result<Acquired> {
        self.log(Call::Acquire { swapchain, signal });
        if self.acquire_out_of_date.replace(false) {
            return Ok(Acquired::OutOfDate);
        }
        Ok(Acquired::Image(self.next_image.get()))
    }

    fn reset_command_pool(&self) -> Result<()> {
        self.log(Call::ResetCommandPool);
        Ok(())
    }

    fn record(&self, commands: &FrameCommands) -> Result<()> {
        self.log(Call::Record);
        self.recorded.borrow_mut().push(commands.clone());
        Ok(())
    }

    fn submit(&self, wait: vk::Semaphore, stage: vk::PipelineStageFlags, signal: vk::Semaphore) -> Result<()> {
        if self.submit_fails.get() {
            bail!("vkQueueSubmit failed: ERROR_DEVICE_LOST");
        }
        self.log(Call::Submit { wait, stage, signal });
        Ok(())
    }

    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        self.log(Call::Present {
            swapchain,
            image_index,
            wait,
        });
        Ok(self.present_stale.replace(false))
    }

    fn wait_idle(&self) -> Result<()> {
        SwapchainBackend::wait_idle(self)
    }
}
