//! Validated intermediate representation of a parsed effect.
//!
//! A `ShaderIr` is only ever produced by [`crate::parser::parse`] after every
//! structural invariant has been checked, so downstream stages (code
//! generation, resource allocation, pipeline building) can rely on it without
//! re-validating.

use std::collections::BTreeSet;

use serde::Serialize;

/// Reserved name of the externally supplied source texture.
pub const INPUT: &str = "INPUT";
/// Reserved name of the externally visible result texture.
pub const OUTPUT: &str = "OUTPUT";

/// Upper bound on the number of textures a single pass may write.
pub const MAX_PASS_OUTPUTS: usize = 8;

pub fn is_reserved_texture(name: &str) -> bool {
    name == INPUT || name == OUTPUT
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderIr {
    pub metadata: EffectMetadata,
    pub parameters: Vec<Parameter>,
    pub textures: Vec<Texture>,
    pub samplers: Vec<Sampler>,
    /// Sorted by index, contiguous from 1.
    pub passes: Vec<Pass>,
    pub common_code: String,
}

impl ShaderIr {
    pub fn texture(&self, name: &str) -> Option<&Texture> {
        self.textures.iter().find(|t| t.name == name)
    }

    pub fn sampler(&self, name: &str) -> Option<&Sampler> {
        self.samplers.iter().find(|s| s.name == name)
    }

    /// Look up a pass by its canonical `PASS_{index}` name.
    pub fn pass_by_name(&self, name: &str) -> Option<&Pass> {
        self.passes.iter().find(|p| p.name() == name)
    }

    /// Format the `OUTPUT` texture is created with and declared as in
    /// generated shaders.
    pub fn output_format(&self) -> TextureFormat {
        self.texture(OUTPUT)
            .and_then(|t| t.format)
            .unwrap_or(TextureFormat::Rgba8Unorm)
    }

    /// Textures that are not supplied externally, in declaration order.
    pub fn owned_textures(&self) -> impl Iterator<Item = &Texture> {
        self.textures.iter().filter(|t| !is_reserved_texture(&t.name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EffectMetadata {
    pub version: u32,
    #[serde(rename = "sortName", skip_serializing_if = "Option::is_none")]
    pub sort_name: Option<String>,
    /// Lower-cased `USE` flags.
    #[serde(rename = "use")]
    pub uses: BTreeSet<String>,
    /// Lower-cased `CAPABILITY` flags.
    pub capabilities: BTreeSet<String>,
}

impl EffectMetadata {
    pub fn uses_flag(&self, flag: &str) -> bool {
        self.uses.contains(&flag.to_ascii_lowercase())
    }

    pub fn has_capability(&self, flag: &str) -> bool {
        self.capabilities.contains(&flag.to_ascii_lowercase())
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Float,
    Int,
}

impl ParamType {
    /// Scalar type used for the uniform struct field.
    pub fn wgsl_type(self) -> &'static str {
        match self {
            Self::Float => "f32",
            Self::Int => "i32",
        }
    }

    /// Classify a declaration type such as `f32` or `i32`.
    pub fn from_declared_type(ty: &str) -> Self {
        match ty.trim() {
            "i32" | "u32" | "int" | "uint" => Self::Int,
            _ => Self::Float,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Parameter {
    /// Clamp a requested value into `[min, max]`, rounding for int parameters.
    pub fn clamp(&self, value: f64) -> f64 {
        let v = value.clamp(self.min, self.max);
        match self.ty {
            ParamType::Float => v,
            ParamType::Int => v.round(),
        }
    }
}

// ---------------------------------------------------------------------------
// Textures and samplers
// ---------------------------------------------------------------------------

/// Texture formats an effect may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Snorm,
    Bgra8Unorm,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    R32Sint,
}

impl TextureFormat {
    /// Accepts both DXGI-style (`R16G16B16A16_FLOAT`) and WGSL-style
    /// (`rgba16float`) spellings.
    pub fn parse(s: &str) -> Option<Self> {
        let format = match s.trim().to_ascii_uppercase().as_str() {
            "R8_UNORM" | "R8UNORM" => Self::R8Unorm,
            "R8G8_UNORM" | "RG8UNORM" => Self::Rg8Unorm,
            "R8G8B8A8_UNORM" | "RGBA8UNORM" => Self::Rgba8Unorm,
            "R8G8B8A8_SNORM" | "RGBA8SNORM" => Self::Rgba8Snorm,
            "B8G8R8A8_UNORM" | "BGRA8UNORM" => Self::Bgra8Unorm,
            "R16_FLOAT" | "R16FLOAT" => Self::R16Float,
            "R16G16_FLOAT" | "RG16FLOAT" => Self::Rg16Float,
            "R16G16B16A16_FLOAT" | "RGBA16FLOAT" => Self::Rgba16Float,
            "R32_FLOAT" | "R32FLOAT" => Self::R32Float,
            "R32G32_FLOAT" | "RG32FLOAT" => Self::Rg32Float,
            "R32G32B32A32_FLOAT" | "RGBA32FLOAT" => Self::Rgba32Float,
            "R32_UINT" | "R32UINT" => Self::R32Uint,
            "R32_SINT" | "R32SINT" => Self::R32Sint,
            _ => return None,
        };
        Some(format)
    }

    /// Texel format name as written in `texture_storage_2d<...>`.
    pub fn wgsl_name(self) -> &'static str {
        match self {
            Self::R8Unorm => "r8unorm",
            Self::Rg8Unorm => "rg8unorm",
            Self::Rgba8Unorm => "rgba8unorm",
            Self::Rgba8Snorm => "rgba8snorm",
            Self::Bgra8Unorm => "bgra8unorm",
            Self::R16Float => "r16float",
            Self::Rg16Float => "rg16float",
            Self::Rgba16Float => "rgba16float",
            Self::R32Float => "r32float",
            Self::Rg32Float => "rg32float",
            Self::Rgba32Float => "rgba32float",
            Self::R32Uint => "r32uint",
            Self::R32Sint => "r32sint",
        }
    }

    /// Whether core WGSL allows this format as a write-only storage texture.
    pub fn is_storage_capable(self) -> bool {
        matches!(
            self,
            Self::Rgba8Unorm
                | Self::Rgba8Snorm
                | Self::Rgba16Float
                | Self::R32Float
                | Self::Rg32Float
                | Self::Rgba32Float
                | Self::R32Uint
                | Self::R32Sint
        )
    }

    /// Sampled type parameter for `texture_2d<...>`.
    pub fn sampled_wgsl_type(self) -> &'static str {
        match self {
            Self::R32Uint => "u32",
            Self::R32Sint => "i32",
            _ => "f32",
        }
    }
}

/// Width or height of a texture: a literal or an expression over named
/// constants such as `INPUT_WIDTH / 2`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SizeExpr {
    Literal(u32),
    Expr(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Texture {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<TextureFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<SizeExpr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<SizeExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterMode {
    Linear,
    Point,
}

impl FilterMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LINEAR" => Some(Self::Linear),
            "POINT" => Some(Self::Point),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AddressMode {
    #[default]
    Clamp,
    Wrap,
}

impl AddressMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLAMP" => Some(Self::Clamp),
            "WRAP" => Some(Self::Wrap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sampler {
    pub name: String,
    pub filter: FilterMode,
    pub address: AddressMode,
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PassStyle {
    /// Pixel-shader style: the body computes one texel per output.
    #[serde(rename = "PS")]
    Pixel,
    #[default]
    #[serde(rename = "CS")]
    Compute,
}

impl PassStyle {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PS" => Some(Self::Pixel),
            "CS" => Some(Self::Compute),
            _ => None,
        }
    }
}

/// Workgroup size used by pixel-style passes that omit `NUM_THREADS`.
pub const PIXEL_STYLE_NUM_THREADS: [u32; 3] = [8, 8, 1];
/// Workgroup size used when nothing else applies.
pub const DEFAULT_NUM_THREADS: [u32; 3] = [1, 1, 1];

#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    pub index: u32,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub block_size: Option<[u32; 3]>,
    pub num_threads: Option<[u32; 3]>,
    pub style: PassStyle,
    pub desc: Option<String>,
    pub code: String,
}

impl Pass {
    /// Canonical pass name used by the runtime API, e.g. `PASS_1`.
    pub fn name(&self) -> String {
        format!("PASS_{}", self.index)
    }

    pub fn effective_num_threads(&self) -> [u32; 3] {
        match (self.num_threads, self.style) {
            (Some(n), _) => n,
            (None, PassStyle::Pixel) => PIXEL_STYLE_NUM_THREADS,
            (None, PassStyle::Compute) => DEFAULT_NUM_THREADS,
        }
    }

    pub fn effective_block_size(&self) -> [u32; 3] {
        self.block_size.unwrap_or_else(|| {
            let [x, y, _] = self.effective_num_threads();
            [x, y, 1]
        })
    }

    /// The texture whose size drives dispatch counts.
    pub fn primary_output(&self) -> &str {
        self.outputs.first().map(String::as_str).unwrap_or(OUTPUT)
    }

    pub fn reads(&self, texture: &str) -> bool {
        self.inputs.iter().any(|n| n == texture)
    }

    pub fn writes(&self, texture: &str) -> bool {
        self.outputs.iter().any(|n| n == texture)
    }

    pub fn references(&self, texture: &str) -> bool {
        self.reads(texture) || self.writes(texture)
    }
}
