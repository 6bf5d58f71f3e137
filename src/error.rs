// Error classification
//
// Everything here aborts startup or the frame loop except NoCapableDevice,
// which is an expected outcome on machines without a usable GPU.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendererError {
    /// A graphics API call returned something other than success
    #[error("{call} failed: {result:?}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no memory type matches bits {type_bits:#b} with flags {flags:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("no GPU with a graphics queue that can present to the window")]
    NoCapableDevice,

    #[error("{pool} pool needs {needed} bytes but its buffer holds {capacity}")]
    BufferTooSmall {
        pool: &'static str,
        needed: usize,
        capacity: usize,
    },

    #[error("failed to load model {path:?}: {reason}")]
    Model { path: PathBuf, reason: String },

    #[error("failed to load shader {path:?}")]
    Shader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RendererError {
    /// Fatal errors terminate the process with a diagnostic. The only
    /// non-fatal outcome is a failed device selection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RendererError::NoCapableDevice)
    }
}

/// Tags a raw `vk::Result` with the name of the call that produced it
pub trait VkResultExt<T> {
    fn vk(self, call: &'static str) -> Result<T, RendererError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn vk(self, call: &'static str) -> Result<T, RendererError> {
        self.map_err(|result| RendererError::Vulkan { call, result })
    }
}
