//! # Surface Configuration
//!
//! Loaded once at startup, from TOML. Every field has a default, so an
//! empty file is a valid configuration for the primary display.
//!
//! ```toml
//! name = "FramebufferSurface"
//! display = 0
//! format = "rgbx8888"        # optional, native format otherwise
//! width = 1280               # optional, native size otherwise
//! height = 720
//! max_buffer_count = 2
//! usage = "HW_RENDER | HW_FB | HW_COMPOSER"
//! synchronous = true
//! ```

use std::path::Path;

use framelatch_core::{BufferUsage, ConsumerSettings, PixelFormat, MIN_BUFFER_COUNT, NUM_BUFFER_SLOTS};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::poster::{DisplayId, DisplayMode};

/// Number of framebuffers a surface uses unless told otherwise.
pub const DEFAULT_BUFFER_COUNT: usize = 2;

/// Configuration of one hand-off surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SurfaceConfig {
    /// Consumer name used in logs and dumps.
    pub name: String,
    /// Display the surface posts to.
    pub display: DisplayId,
    /// Buffer format. Uses the display's native format when absent.
    pub format: Option<PixelFormat>,
    /// Buffer width. Uses the display's native width when absent.
    pub width: Option<u32>,
    /// Buffer height. Uses the display's native height when absent.
    pub height: Option<u32>,
    /// Number of buffers cycled between producer and display.
    pub max_buffer_count: usize,
    /// Usage bits requested for every buffer.
    pub usage: BufferUsage,
    /// Keep every queued frame (`true`) or only the newest (`false`).
    pub synchronous: bool,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            name: String::from("FramebufferSurface"),
            display: DisplayId::PRIMARY,
            format: None,
            width: None,
            height: None,
            max_buffer_count: DEFAULT_BUFFER_COUNT,
            usage: BufferUsage::HW_RENDER | BufferUsage::HW_FB | BufferUsage::HW_COMPOSER,
            synchronous: true,
        }
    }
}

impl SurfaceConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file can't be read, otherwise as
    /// [`SurfaceConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid(String::from("name must not be empty")));
        }
        if !(MIN_BUFFER_COUNT..=NUM_BUFFER_SLOTS).contains(&self.max_buffer_count) {
            return Err(ConfigError::Invalid(format!(
                "max_buffer_count {} outside {}..={}",
                self.max_buffer_count, MIN_BUFFER_COUNT, NUM_BUFFER_SLOTS
            )));
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(ConfigError::Invalid(String::from(
                "width and height must be non-zero",
            )));
        }
        if self.usage.is_empty() {
            return Err(ConfigError::Invalid(String::from("usage must not be empty")));
        }
        Ok(())
    }

    /// Consumer settings for a display running in `mode`.
    ///
    /// Explicit format and size win over the native mode.
    #[must_use]
    pub fn resolve(&self, mode: &DisplayMode) -> ConsumerSettings {
        ConsumerSettings {
            name: self.name.clone(),
            usage: self.usage,
            default_format: self.format.unwrap_or(mode.format),
            default_width: self.width.unwrap_or(mode.width),
            default_height: self.height.unwrap_or(mode.height),
            max_buffer_count: self.max_buffer_count,
            synchronous: self.synchronous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode() -> DisplayMode {
        DisplayMode {
            width: 1920,
            height: 1080,
            format: PixelFormat::Rgbx8888,
            refresh_hz: 60,
        }
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = SurfaceConfig::from_toml_str("").unwrap();
        assert_eq!(config, SurfaceConfig::default());
        assert_eq!(config.name, "FramebufferSurface");
        assert_eq!(config.max_buffer_count, 2);
        assert!(config.usage.contains(BufferUsage::HW_FB | BufferUsage::HW_RENDER | BufferUsage::HW_COMPOSER));
        assert!(config.synchronous);
    }

    #[test]
    fn test_parse_overrides() {
        let config = SurfaceConfig::from_toml_str(
            r#"
            name = "secondary"
            display = 1
            format = "rgb565"
            width = 640
            height = 480
            max_buffer_count = 3
            usage = "HW_FB"
            synchronous = false
            "#,
        )
        .unwrap();

        assert_eq!(config.display, DisplayId(1));
        assert_eq!(config.format, Some(PixelFormat::Rgb565));
        assert_eq!(config.max_buffer_count, 3);
        assert_eq!(config.usage, BufferUsage::HW_FB);
        assert!(!config.synchronous);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = SurfaceConfig::from_toml_str("buffers = 3");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for text in [
            "max_buffer_count = 1",
            "max_buffer_count = 33",
            "width = 0",
            "name = \"  \"",
            "usage = \"\"",
        ] {
            let result = SurfaceConfig::from_toml_str(text);
            assert!(
                matches!(result, Err(ConfigError::Invalid(_))),
                "{text} should be invalid, got {result:?}"
            );
        }
    }

    #[test]
    fn test_missing_file() {
        let result = SurfaceConfig::load("/nonexistent/framelatch.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_resolve_prefers_explicit_values() {
        let native = SurfaceConfig::default().resolve(&mode());
        assert_eq!(native.default_width, 1920);
        assert_eq!(native.default_height, 1080);
        assert_eq!(native.default_format, PixelFormat::Rgbx8888);

        let config = SurfaceConfig {
            width: Some(800),
            format: Some(PixelFormat::Rgba8888),
            ..SurfaceConfig::default()
        };
        let settings = config.resolve(&mode());
        assert_eq!(settings.default_width, 800);
        assert_eq!(settings.default_height, 1080);
        assert_eq!(settings.default_format, PixelFormat::Rgba8888);
        assert_eq!(settings.name, "FramebufferSurface");
        assert!(settings.synchronous);
    }
}
