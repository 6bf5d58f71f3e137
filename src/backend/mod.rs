// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Each type owns its Vulkan objects and releases
// them on Drop; the swapchain and frame paths go through traits so they can
// run against a recording fake.

pub mod buffer;
pub mod command;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanContext;
