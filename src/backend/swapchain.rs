// Swapchain - Window presentation
//
// The manager owns the presentable image chain plus one view and one
// framebuffer per image. Resizing builds a complete replacement first,
// passing the old handle to the driver for recycling, and only then waits
// for the device and tears the old chain down.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanContext;
use crate::error::VkResultExt;

/// Composite alpha modes in order of preference
const COMPOSITE_ALPHA_PRIORITY: [vk::CompositeAlphaFlagsKHR; 3] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
];

/// First supported of OPAQUE, PRE_MULTIPLIED, POST_MULTIPLIED, else INHERIT
pub fn select_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    COMPOSITE_ALPHA_PRIORITY
        .into_iter()
        .find(|&mode| supported.contains(mode))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT)
}

/// Mailbox only when asked for and available, FIFO otherwise
pub fn select_present_mode(preferred: vk::PresentModeKHR, supported: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if preferred == vk::PresentModeKHR::MAILBOX && supported.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Prefer SRGB, else whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// Surface extent, or the window size clamped to the surface limits when the
/// surface leaves the choice to us
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: window.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, within the maximum when there is one
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let requested = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        requested.min(capabilities.max_image_count)
    } else {
        requested
    }
}

/// Everything needed to create one swapchain instance
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Retiring swapchain, or null
    pub old_swapchain: vk::SwapchainKHR,
}

/// Graphics API calls the swapchain lifecycle depends on
pub trait SwapchainBackend {
    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR>;
    fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>>;
    fn create_swapchain(&self, request: &SwapchainRequest) -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn wait_idle(&self) -> Result<()>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
}

/// One swapchain instance and the per-image objects built on it.
/// `image_views` and `framebuffers` always have one entry per image.
#[derive(Debug)]
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl Swapchain {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    fn build<B: SwapchainBackend + ?Sized>(
        backend: &B,
        request: &SwapchainRequest,
        render_pass: vk::RenderPass,
    ) -> Result<Self> {
        let handle = backend.create_swapchain(request)?;

        let mut swapchain = Self {
            handle,
            extent: request.extent,
            format: request.surface_format.format,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
        };

        // A half-built chain is released before the error goes up
        if let Err(e) = swapchain.populate(backend, render_pass) {
            swapchain.destroy(backend);
            return Err(e);
        }

        Ok(swapchain)
    }

    fn populate<B: SwapchainBackend + ?Sized>(&mut self, backend: &B, render_pass: vk::RenderPass) -> Result<()> {
        let images = backend.swapchain_images(self.handle)?;

        self.image_views.reserve(images.len());
        for &image in &images {
            self.image_views.push(backend.create_image_view(image, self.format)?);
        }

        self.framebuffers.reserve(images.len());
        for &view in &self.image_views {
            self.framebuffers
                .push(backend.create_framebuffer(render_pass, view, self.extent)?);
        }

        self.images = images;
        Ok(())
    }

    /// Views, then framebuffers, then the swapchain itself
    fn destroy<B: SwapchainBackend + ?Sized>(&mut self, backend: &B) {
        for view in self.image_views.drain(..) {
            backend.destroy_image_view(view);
        }
        for framebuffer in self.framebuffers.drain(..) {
            backend.destroy_framebuffer(framebuffer);
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            backend.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }
}

/// Owns the active swapchain and replaces it when the surface changes size
pub struct SwapchainManager<B: SwapchainBackend> {
    backend: Arc<B>,
    surface_format: vk::SurfaceFormatKHR,
    render_pass: vk::RenderPass,
    preferred_present_mode: vk::PresentModeKHR,
    window_extent: vk::Extent2D,
    current: Swapchain,
    /// Bumped on every successful recreation
    generation: u64,
    out_of_date: bool,
}

impl<B: SwapchainBackend> SwapchainManager<B> {
    pub fn create(
        backend: Arc<B>,
        surface_format: vk::SurfaceFormatKHR,
        render_pass: vk::RenderPass,
        preferred_present_mode: vk::PresentModeKHR,
        window_extent: vk::Extent2D,
    ) -> Result<Self> {
        let capabilities = backend.surface_capabilities()?;
        let request = Self::request(
            backend.as_ref(),
            &capabilities,
            surface_format,
            preferred_present_mode,
            window_extent,
            vk::SwapchainKHR::null(),
        )?;

        let current = Swapchain::build(backend.as_ref(), &request, render_pass)?;

        log::info!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            current.extent.width,
            current.extent.height,
            current.image_count(),
            request.present_mode,
            request.composite_alpha
        );

        Ok(Self {
            backend,
            surface_format,
            render_pass,
            preferred_present_mode,
            window_extent,
            current,
            generation: 0,
            out_of_date: false,
        })
    }

    fn request(
        backend: &B,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        preferred_present_mode: vk::PresentModeKHR,
        window_extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainRequest> {
        let present_modes = backend.present_modes()?;

        Ok(SwapchainRequest {
            extent: choose_extent(capabilities, window_extent),
            min_image_count: choose_image_count(capabilities),
            surface_format,
            composite_alpha: select_composite_alpha(capabilities.supported_composite_alpha),
            present_mode: select_present_mode(preferred_present_mode, &present_modes),
            pre_transform: capabilities.current_transform,
            old_swapchain,
        })
    }

    pub fn current(&self) -> &Swapchain {
        &self.current
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Window size used when the surface does not dictate an extent
    pub fn set_window_extent(&mut self, extent: vk::Extent2D) {
        self.window_extent = extent;
    }

    /// Force the next `resize` to rebuild even at the same extent
    pub fn mark_out_of_date(&mut self) {
        self.out_of_date = true;
    }

    /// Rebuild the swapchain if the surface extent changed. Returns whether a
    /// new swapchain was created.
    pub fn resize(&mut self) -> Result<bool> {
        let capabilities = self.backend.surface_capabilities()?;
        let extent = choose_extent(&capabilities, self.window_extent);

        // Minimised windows report 0x0; keep the old chain until they come back
        if extent.width == 0 || extent.height == 0 {
            return Ok(false);
        }

        if extent == self.current.extent && !self.out_of_date {
            return Ok(false);
        }

        let request = Self::request(
            self.backend.as_ref(),
            &capabilities,
            self.surface_format,
            self.preferred_present_mode,
            self.window_extent,
            self.current.handle,
        )?;

        let replacement = Swapchain::build(self.backend.as_ref(), &request, self.render_pass)?;
        let mut retired = std::mem::replace(&mut self.current, replacement);

        // Nothing may still reference the retired views when they go away
        self.backend.wait_idle()?;
        retired.destroy(self.backend.as_ref());

        self.generation += 1;
        self.out_of_date = false;

        log::info!(
            "Recreated swapchain {}x{} with {} images (generation {})",
            self.current.extent.width,
            self.current.extent.height,
            self.current.image_count(),
            self.generation
        );

        Ok(true)
    }

    /// Wait for the device, then release the current chain
    pub fn destroy(mut self) {
        self.teardown();
    }

    /// Runs once; later calls find the handle already null
    fn teardown(&mut self) {
        if self.current.handle == vk::SwapchainKHR::null() {
            return;
        }
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Device did not go idle before swapchain teardown: {}", e);
        }
        self.current.destroy(self.backend.as_ref());
        log::debug!("Destroyed swapchain");
    }
}

impl<B: SwapchainBackend> Drop for SwapchainManager<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl SwapchainBackend for VulkanContext {
    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
        .vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        Ok(capabilities)
    }

    fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }
        .vk("vkGetPhysicalDeviceSurfacePresentModesKHR")?;
        Ok(modes)
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> Result<vk::SwapchainKHR> {
        let queue_families = [self.queue_family];

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(request.min_image_count)
            .image_format(request.surface_format.format)
            .image_color_space(request.surface_format.color_space)
            .image_extent(request.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(request.pre_transform)
            .composite_alpha(request.composite_alpha)
            .present_mode(request.present_mode)
            .clipped(true)
            .old_swapchain(request.old_swapchain);

        let swapchain =
            unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }.vk("vkCreateSwapchainKHR")?;
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let images =
            unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }.vk("vkGetSwapchainImagesKHR")?;
        Ok(images)
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.device.create_image_view(&create_info, None) }.vk("vkCreateImageView")?;
        Ok(view)
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let attachments = [view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer =
            unsafe { self.device.create_framebuffer(&framebuffer_info, None) }.vk("vkCreateFramebuffer")?;
        Ok(framebuffer)
    }

    fn wait_idle(&self) -> Result<()> {
        VulkanContext::wait_idle(self)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }
}
