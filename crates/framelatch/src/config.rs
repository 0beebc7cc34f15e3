//! # Demo Configuration
//!
//! One TOML file with a table per component:
//!
//! ```toml
//! [surface]
//! max_buffer_count = 3
//!
//! [compositor]
//! vsync_interval_us = 16666
//!
//! [producer]
//! frames = 240
//! resize_every = 60
//! ```

use std::path::Path;

use framelatch_display::{ConfigError, SurfaceConfig};
use serde::{Deserialize, Serialize};

use crate::compositor::CompositorConfig;
use crate::producer::ProducerConfig;

/// Everything the demo binary reads from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FramelatchConfig {
    /// Hand-off surface settings.
    pub surface: SurfaceConfig,
    /// Compositor loop settings.
    pub compositor: CompositorConfig,
    /// Demo producer settings.
    pub producer: ProducerConfig,
}

impl FramelatchConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Malformed TOML, unknown keys or out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// As [`FramelatchConfig::from_toml_str`], plus I/O failures.
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
        self.surface.validate()?;
        // Two notifications per slot must always fit.
        let min_capacity = self.surface.max_buffer_count * 2;
        if self.compositor.event_capacity < min_capacity {
            return Err(ConfigError::Invalid(format!(
                "compositor.event_capacity {} below {} for {} buffers",
                self.compositor.event_capacity, min_capacity, self.surface.max_buffer_count
            )));
        }
        if self.producer.dequeue_timeout_ms == 0 {
            return Err(ConfigError::Invalid(String::from(
                "producer.dequeue_timeout_ms must be non-zero",
            )));
        }
        if self.producer.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(String::from(
                "producer.max_consecutive_failures must be non-zero",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FramelatchConfig::from_toml_str("").unwrap();
        assert_eq!(config, FramelatchConfig::default());
    }

    #[test]
    fn test_sections_parse() {
        let config = FramelatchConfig::from_toml_str(
            r#"
            [surface]
            name = "demo"
            max_buffer_count = 3

            [compositor]
            vsync_interval_us = 0
            event_capacity = 16

            [producer]
            frames = 10
            resize_every = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.surface.name, "demo");
        assert_eq!(config.surface.max_buffer_count, 3);
        assert_eq!(config.compositor.vsync_interval(), None);
        assert_eq!(config.producer.frames, 10);
        assert_eq!(config.producer.resize_every, 4);
    }

    #[test]
    fn test_small_event_capacity_rejected() {
        let result = FramelatchConfig::from_toml_str(
            r#"
            [surface]
            max_buffer_count = 8

            [compositor]
            event_capacity = 4
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_failure_budget_rejected() {
        let result = FramelatchConfig::from_toml_str("[producer]\nmax_consecutive_failures = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let result = FramelatchConfig::from_toml_str("[display]\nwidth = 3");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_surface_errors_surface() {
        let result = FramelatchConfig::from_toml_str("[surface]\nmax_buffer_count = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
