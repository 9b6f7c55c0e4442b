// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. Stages are a closed set, so they
// are a plain enum rather than a trait.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;
use std::io::Cursor;
use std::path::PathBuf;

use super::VulkanDevice;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Where compiled SPIR-V comes from.
#[derive(Debug, Clone)]
pub enum ShaderSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// A shader stage the pipeline consumes, with its entry point.
#[derive(Debug, Clone)]
pub enum ShaderStage {
    Vertex { source: ShaderSource, entry_point: String },
    Fragment { source: ShaderSource, entry_point: String },
}

impl ShaderStage {
    /// Vertex stage with a `main` entry point.
    pub fn vertex(source: ShaderSource) -> Self {
        Self::Vertex {
            source,
            entry_point: "main".to_string(),
        }
    }

    /// Fragment stage with a `main` entry point.
    pub fn fragment(source: ShaderSource) -> Self {
        Self::Fragment {
            source,
            entry_point: "main".to_string(),
        }
    }

    pub fn flags(&self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex { .. } => vk::ShaderStageFlags::VERTEX,
            Self::Fragment { .. } => vk::ShaderStageFlags::FRAGMENT,
        }
    }

    pub fn source(&self) -> &ShaderSource {
        match self {
            Self::Vertex { source, .. } | Self::Fragment { source, .. } => source,
        }
    }

    pub fn entry_point(&self) -> &str {
        match self {
            Self::Vertex { entry_point, .. } | Self::Fragment { entry_point, .. } => entry_point,
        }
    }
}

/// Read SPIR-V words, checking length alignment and the magic number.
pub fn load_spirv(source: &ShaderSource) -> Result<Vec<u32>> {
    let bytes = match source {
        ShaderSource::Path(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read shader: {:?}", path))?,
        ShaderSource::Bytes(bytes) => bytes.clone(),
    };

    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .with_context(|| format!("Invalid SPIR-V from {}", source_label(source)))?;
    anyhow::ensure!(
        words.first() == Some(&SPIRV_MAGIC),
        "Missing SPIR-V magic number in {}",
        source_label(source)
    );

    Ok(words)
}

fn source_label(source: &ShaderSource) -> String {
    match source {
        ShaderSource::Path(path) => path.display().to_string(),
        ShaderSource::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
    }
}

/// A created `VkShaderModule` plus what pipeline creation needs to use it.
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: CString,
}

impl ShaderModule {
    pub fn new(device: &VulkanDevice, stage: &ShaderStage) -> Result<Self> {
        let code = load_spirv(stage.source())?;
        let entry_point = CString::new(stage.entry_point())
            .context("Shader entry point contains a NUL byte")?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        log::debug!(
            "Loaded {:?} shader {} ({} words)",
            stage.flags(),
            source_label(stage.source()),
            code.len()
        );

        Ok(Self {
            module,
            stage: stage.flags(),
            entry_point,
        })
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Borrows `self` for the entry point name.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage)
            .module(self.module)
            .name(&self.entry_point)
            .build()
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = SPIRV_MAGIC;

    #[test]
    fn stage_maps_to_vulkan_flags() {
        let vert = ShaderStage::vertex(ShaderSource::Bytes(vec![]));
        let frag = ShaderStage::fragment(ShaderSource::Path("a.spv".into()));
        assert_eq!(vert.flags(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(frag.flags(), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(vert.entry_point(), "main");

        let custom = ShaderStage::Fragment {
            source: ShaderSource::Bytes(vec![]),
            entry_point: "shade".to_string(),
        };
        assert_eq!(custom.entry_point(), "shade");
    }

    #[test]
    fn spirv_words_are_read_from_bytes() {
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = load_spirv(&ShaderSource::Bytes(bytes)).unwrap();
        assert_eq!(words, vec![MAGIC, 0x0001_0000]);
    }

    #[test]
    fn misaligned_spirv_is_rejected() {
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(load_spirv(&ShaderSource::Bytes(bytes)).is_err());
    }

    #[test]
    fn missing_magic_is_rejected() {
        let bytes = 0xdead_beefu32.to_le_bytes().to_vec();
        assert!(load_spirv(&ShaderSource::Bytes(bytes)).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let source = ShaderSource::Path("does/not/exist.spv".into());
        assert!(load_spirv(&source).is_err());
    }
}
