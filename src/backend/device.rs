// Vulkan Context - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation
// - Physical device selection (prefer discrete GPU)
// - Logical device + queue creation
//
// Shared by Arc with every other GPU object, so it is destroyed last.

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use winit::window::Window;

use crate::error::{RendererError, VkResultExt};

/// What device selection needs to know about one physical device
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    /// First queue family with graphics support that can present to the surface
    pub queue_family: Option<u32>,
}

/// Prefer the first discrete GPU, else the first capable device of any kind.
/// Devices without a graphics + present queue family never qualify.
pub fn select_physical_device(candidates: &[DeviceCandidate]) -> Result<&DeviceCandidate, RendererError> {
    let capable = || candidates.iter().filter(|c| c.queue_family.is_some());

    capable()
        .find(|c| c.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| capable().next())
        .ok_or(RendererError::NoCapableDevice)
}

struct PickedDevice {
    handle: vk::PhysicalDevice,
    queue_family: u32,
}

/// Vulkan objects that live for the whole program
pub struct VulkanContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    pub swapchain_loader: khr::Swapchain,

    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    _entry: Entry,
}

impl VulkanContext {
    /// Create everything up to and including the logical device for `window`
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> Result<Self> {
        log::info!("Creating Vulkan context: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();
        let instance = Self::create_instance(&entry, app_name, display_handle, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Surface
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = match unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        } {
            Ok(surface) => surface,
            Err(result) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(RendererError::Vulkan {
                    call: "vkCreateSurfaceKHR",
                    result,
                }
                .into());
            }
        };

        // Step 5 + 6: Pick physical device (GPU) and create the logical device.
        // The instance-level objects are not owned by anything yet, so a
        // failure here has to release them by hand.
        let picked = Self::pick_physical_device(&instance, &surface_loader, surface).and_then(|chosen| {
            let (device, queue) = Self::create_logical_device(&instance, chosen.handle, chosen.queue_family)?;
            Ok((chosen, device, queue))
        });

        let (chosen, device, queue) = match picked {
            Ok(picked) => picked,
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                    if let Some((debug_utils, messenger)) = &debug_utils {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(chosen.handle) };
        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        Ok(Self {
            device,
            physical_device: chosen.handle,
            queue,
            queue_family: chosen.queue_family,
            memory_properties,
            surface,
            surface_loader,
            swapchain_loader,
            debug_utils,
            instance,
            _entry: entry,
        })
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        // Surface extensions for whatever platform the window lives on
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .vk("vkEnumerateInstanceExtensionProperties")?
            .to_vec();

        if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }.vk("vkCreateInstance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .vk("vkCreateDebugUtilsMessengerEXT")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<PickedDevice> {
        let candidates = Self::enumerate_candidates(instance, surface_loader, surface)?;
        let chosen = select_physical_device(&candidates)?;
        let queue_family = chosen.queue_family.ok_or(RendererError::NoCapableDevice)?;

        if chosen.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            log::info!("Picking discrete GPU: {}", chosen.name);
        } else {
            log::info!("Picking fallback GPU: {}", chosen.name);
        }

        Ok(PickedDevice {
            handle: chosen.handle,
            queue_family,
        })
    }

    fn enumerate_candidates(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<DeviceCandidate>> {
        let devices = unsafe { instance.enumerate_physical_devices() }.vk("vkEnumeratePhysicalDevices")?;

        devices
            .into_iter()
            .map(|handle| -> Result<DeviceCandidate> {
                let props = unsafe { instance.get_physical_device_properties(handle) };
                let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned();

                let families = unsafe { instance.get_physical_device_queue_family_properties(handle) };
                let mut queue_family = None;
                for (index, family) in families.iter().enumerate() {
                    if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                        continue;
                    }
                    let presents = unsafe {
                        surface_loader.get_physical_device_surface_support(handle, index as u32, surface)
                    }
                    .vk("vkGetPhysicalDeviceSurfaceSupportKHR")?;
                    if presents {
                        queue_family = Some(index as u32);
                        break;
                    }
                }

                log::debug!("Found GPU {} ({:?}), queue family {:?}", name, props.device_type, queue_family);

                Ok(DeviceCandidate {
                    handle,
                    name,
                    device_type: props.device_type,
                    queue_family,
                })
            })
            .collect()
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        let device =
            unsafe { instance.create_device(physical_device, &create_info, None) }.vk("vkCreateDevice")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    /// Formats the surface accepts, in driver order
    pub fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }
        .vk("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        Ok(formats)
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.vk("vkDeviceWaitIdle")?;
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan context...");

        if let Err(e) = self.wait_idle() {
            log::error!("Device did not go idle before teardown: {}", e);
        }

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
