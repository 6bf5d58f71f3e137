// Shader module loading
//
// SPIR-V is read from disk at startup; a missing or malformed file is a
// startup error.

use anyhow::Result;
use ash::vk;
use std::fs::File;
use std::path::Path;

use super::VulkanContext;
use crate::error::{RendererError, VkResultExt};

/// Shader module destroyed when it goes out of scope. Modules are only
/// needed until the pipeline is built.
pub struct ShaderModule<'a> {
    pub handle: vk::ShaderModule,
    context: &'a VulkanContext,
}

impl<'a> ShaderModule<'a> {
    pub fn load(context: &'a VulkanContext, path: &Path) -> Result<Self> {
        let shader_error = |source| RendererError::Shader {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).map_err(shader_error)?;
        // read_spv rejects partial words and fixes up alignment and endianness
        let code = ash::util::read_spv(&mut file).map_err(shader_error)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let handle =
            unsafe { context.device.create_shader_module(&create_info, None) }.vk("vkCreateShaderModule")?;

        log::debug!("Loaded shader {:?} ({} words)", path, code.len());

        Ok(Self { handle, context })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_shader_module(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    // The loader leans on read_spv for validation; pin down what it rejects
    #[test]
    fn truncated_bytecode_is_rejected() {
        let mut bytes = Cursor::new(vec![0x03, 0x02, 0x23, 0x07, 0x00]);
        assert!(ash::util::read_spv(&mut bytes).is_err());
    }

    #[test]
    fn word_aligned_bytecode_is_accepted() {
        let mut bytes = Cursor::new(vec![0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00]);
        let words = ash::util::read_spv(&mut bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }
}
