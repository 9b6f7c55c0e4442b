// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional. A missing file means defaults; a broken file is
// reported and also means defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::backend::device::AdapterPreference;
use crate::backend::swapchain::{FormatFallback, SwapchainConfig};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Pipeline".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// FIFO when on; otherwise the lowest-latency mode available.
    pub vsync: bool,
    pub clear_color: [f32; 4],
    /// "first" or "discrete".
    pub adapter: String,
    /// Accept the first reported surface format when sRGB BGRA is missing.
    pub srgb_fallback: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            adapter: "first".to_string(),
            srgb_fallback: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Default log filter; `RUST_LOG` takes precedence.
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Swapchain request for the configured window size.
    pub fn swapchain_config(&self) -> SwapchainConfig {
        SwapchainConfig {
            width: self.window.width,
            height: self.window.height,
            vsync: self.graphics.vsync,
            format_fallback: if self.graphics.srgb_fallback {
                FormatFallback::FirstReported
            } else {
                FormatFallback::Fail
            },
        }
    }

    pub fn adapter_preference(&self) -> AdapterPreference {
        match self.graphics.adapter.to_lowercase().as_str() {
            "first" => AdapterPreference::FirstSuitable,
            "discrete" => AdapterPreference::PreferDiscrete,
            _ => {
                log::warn!(
                    "Unknown adapter preference '{}', using the first suitable adapter",
                    self.graphics.adapter
                );
                AdapterPreference::FirstSuitable
            }
        }
    }
}
