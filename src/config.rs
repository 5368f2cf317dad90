// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub raytracing: RaytracingConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Raytracing Demo".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub surface_format: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            surface_format: "bgra8_srgb".to_string(),
        }
    }
}

/// Acceleration structure build settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RaytracingConfig {
    /// Build the BLAS with PREFER_FAST_TRACE
    pub prefer_fast_trace: bool,
    /// Build the TLAS with ALLOW_UPDATE so instances can be refit later
    pub allow_update: bool,
}

impl Default for RaytracingConfig {
    fn default() -> Self {
        Self {
            prefer_fast_trace: true,
            allow_update: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
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

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Get preferred surface format as Vulkan enum
    pub fn get_surface_format(&self) -> ash::vk::Format {
        match self.graphics.surface_format.to_lowercase().as_str() {
            "bgra8_srgb" => ash::vk::Format::B8G8R8A8_SRGB,
            "bgra8_unorm" => ash::vk::Format::B8G8R8A8_UNORM,
            "rgba8_srgb" => ash::vk::Format::R8G8B8A8_SRGB,
            "rgba8_unorm" => ash::vk::Format::R8G8B8A8_UNORM,
            _ => {
                log::warn!(
                    "Unknown surface format '{}', defaulting to BGRA8 SRGB",
                    self.graphics.surface_format
                );
                ash::vk::Format::B8G8R8A8_SRGB
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert!(config.raytracing.prefer_fast_trace);
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 1920
            height = 1080
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1920);
        assert_eq!(config.window.title, "Raytracing Demo");
        assert_eq!(config.graphics.present_mode, "fifo");
        assert!(config.raytracing.allow_update);
    }

    #[test]
    fn present_mode_strings_map_to_vulkan_enums() {
        let mut config = Config::default();

        config.graphics.present_mode = "immediate".to_string();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::IMMEDIATE);

        config.graphics.present_mode = "MAILBOX".to_string();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::MAILBOX);

        config.graphics.present_mode = "fifo_relaxed".to_string();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO_RELAXED);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let mut config = Config::default();
        config.graphics.present_mode = "vsync but fast".to_string();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_strings_map_to_vulkan_enums() {
        let mut config = Config::default();
        assert_eq!(config.get_surface_format(), vk::Format::B8G8R8A8_SRGB);

        config.graphics.surface_format = "rgba8_unorm".to_string();
        assert_eq!(config.get_surface_format(), vk::Format::R8G8B8A8_UNORM);

        config.graphics.surface_format = "BGRA8_UNORM".to_string();
        assert_eq!(config.get_surface_format(), vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn unknown_surface_format_falls_back_to_bgra8_srgb() {
        let mut config = Config::default();
        config.graphics.surface_format = "hdr10".to_string();
        assert_eq!(config.get_surface_format(), vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.window.width, 800);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = std::env::temp_dir().join("raytrace-demo-malformed-config.toml");
        std::fs::write(&path, "[window\nwidth = \"oops").unwrap();

        let result = Config::load_from_path(&path);
        assert!(result.is_err());

        std::fs::remove_file(&path).ok();
    }
}
