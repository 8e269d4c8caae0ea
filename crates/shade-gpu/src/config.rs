//! Caller-supplied overrides for an effect compile.
//!
//! Usually built in code, but deserializable so they can live next to an
//! effect as YAML:
//!
//! ```yaml
//! defines:
//!   INPUT_WIDTH: 1920
//!   INPUT_HEIGHT: 1080
//! textures:
//!   OUTPUT: { width: 3840, height: 2160 }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use shade_core::TextureFormat;

use crate::error::EffectError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExternalResources {
    /// Named constants visible to texture size expressions.
    #[serde(default)]
    pub defines: HashMap<String, f64>,
    /// Size (and optionally format) overrides keyed by texture name.
    #[serde(default)]
    pub textures: HashMap<String, TextureDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: Option<String>,
}

impl TextureDescriptor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: None,
        }
    }

    /// Parsed `format`, if one was given.
    pub fn texture_format(&self, name: &str) -> Result<Option<TextureFormat>, EffectError> {
        match &self.format {
            None => Ok(None),
            Some(raw) => TextureFormat::parse(raw).map(Some).ok_or_else(|| {
                EffectError::Resource(format!(
                    "override for texture '{}' has unknown format '{}'",
                    name, raw
                ))
            }),
        }
    }
}

impl ExternalResources {
    pub fn with_define(mut self, name: impl Into<String>, value: f64) -> Self {
        self.defines.insert(name.into(), value);
        self
    }

    pub fn with_texture(mut self, name: impl Into<String>, descriptor: TextureDescriptor) -> Self {
        self.textures.insert(name.into(), descriptor);
        self
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, EffectError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, EffectError> {
        let contents = std::fs::read_to_string(path)?;
        let overrides = Self::from_yaml_str(&contents)?;
        tracing::info!(
            "Loaded overrides from {:?}: {} defines, {} textures",
            path,
            overrides.defines.len(),
            overrides.textures.len()
        );
        Ok(overrides)
    }
}
