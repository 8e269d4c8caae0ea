//! Live GPU objects for one compiled effect, looked up by name.
//!
//! Textures are created in a fixed order so size expressions can see the
//! sizes before them: `INPUT`, then `OUTPUT`, then declared textures in
//! declaration order. The `params` and `scene` uniforms and every sampler
//! the generated modules reference are created alongside.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use shade_core::codegen::{DEFAULT_SAMPLER, PARAMS_UNIFORM, PARAM_FIELD_STRIDE, SCENE_UNIFORM};
use shade_core::ir::{AddressMode, FilterMode, ParamType, Parameter, SizeExpr, Texture};
use shade_core::{Expr, ShaderIr, TextureFormat, INPUT, OUTPUT};

use crate::config::{ExternalResources, TextureDescriptor};
use crate::error::EffectError;

/// Map an effect texture format to its wgpu counterpart.
pub fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8Snorm => wgpu::TextureFormat::Rgba8Snorm,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        TextureFormat::R32Sint => wgpu::TextureFormat::R32Sint,
    }
}

// ---------------------------------------------------------------------------
// Uniform data
// ---------------------------------------------------------------------------

/// Layout of the `scene` uniform; mirrors `SceneInfo` in generated WGSL.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SceneInfo {
    pub input_size: [u32; 2],
    pub output_size: [u32; 2],
    pub input_pt: [f32; 2],
    pub output_pt: [f32; 2],
    pub scale: [f32; 2],
}

impl SceneInfo {
    pub fn new(input: [u32; 2], output: [u32; 2]) -> Self {
        let [iw, ih] = [input[0].max(1) as f32, input[1].max(1) as f32];
        let [ow, oh] = [output[0].max(1) as f32, output[1].max(1) as f32];
        Self {
            input_size: input,
            output_size: output,
            input_pt: [1.0 / iw, 1.0 / ih],
            output_pt: [1.0 / ow, 1.0 / oh],
            scale: [ow / iw, oh / ih],
        }
    }
}

/// Value pushed into a parameter slot.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl UniformValue {
    fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Vector(v) if v.len() == 1 => Some(v[0]),
            Self::Vector(_) => None,
        }
    }
}

impl From<f64> for UniformValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        Self::Scalar(v as f64)
    }
}

impl From<i32> for UniformValue {
    fn from(v: i32) -> Self {
        Self::Scalar(v as f64)
    }
}

impl From<Vec<f64>> for UniformValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

/// Byte image of the `params` uniform: one 16-byte slot per parameter.
pub fn pack_parameters(parameters: &[Parameter], values: &[f64]) -> Vec<u8> {
    let mut bytes = vec![0u8; parameters.len() * PARAM_FIELD_STRIDE as usize];
    for (i, (param, value)) in parameters.iter().zip(values).enumerate() {
        let offset = i * PARAM_FIELD_STRIDE as usize;
        bytes[offset..offset + 4].copy_from_slice(&encode_parameter(param.ty, *value));
    }
    bytes
}

fn encode_parameter(ty: ParamType, value: f64) -> [u8; 4] {
    match ty {
        ParamType::Float => (value as f32).to_le_bytes(),
        ParamType::Int => (value.round() as i32).to_le_bytes(),
    }
}

// ---------------------------------------------------------------------------
// Texel conversion
// ---------------------------------------------------------------------------

fn bytes_per_texel(format: wgpu::TextureFormat) -> Option<u32> {
    match format {
        wgpu::TextureFormat::Rgba8Unorm | wgpu::TextureFormat::Bgra8Unorm => Some(4),
        wgpu::TextureFormat::Rgba16Float => Some(8),
        wgpu::TextureFormat::Rgba32Float => Some(16),
        _ => None,
    }
}

/// Encode an image as tightly packed texels of `format`.
pub fn encode_texels(format: wgpu::TextureFormat, image: &image::DynamicImage) -> Result<Vec<u8>, EffectError> {
    match format {
        wgpu::TextureFormat::Rgba8Unorm => Ok(image.to_rgba8().into_raw()),
        wgpu::TextureFormat::Bgra8Unorm => {
            let mut raw = image.to_rgba8().into_raw();
            for px in raw.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
            Ok(raw)
        }
        wgpu::TextureFormat::Rgba16Float => {
            let halves: Vec<u16> = image
                .to_rgba32f()
                .into_raw()
                .into_iter()
                .map(|v| half::f16::from_f32(v).to_bits())
                .collect();
            Ok(bytemuck::cast_slice(&halves).to_vec())
        }
        wgpu::TextureFormat::Rgba32Float => {
            let floats = image.to_rgba32f().into_raw();
            Ok(bytemuck::cast_slice(&floats).to_vec())
        }
        other => Err(EffectError::Resource(format!(
            "cannot upload images into a {:?} texture",
            other
        ))),
    }
}

fn unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Decode tightly packed texels of `format` into RGBA8.
pub fn decode_rgba8(format: wgpu::TextureFormat, texels: &[u8]) -> Result<Vec<u8>, EffectError> {
    match format {
        wgpu::TextureFormat::Rgba8Unorm => Ok(texels.to_vec()),
        wgpu::TextureFormat::Bgra8Unorm => {
            let mut out = texels.to_vec();
            for px in out.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
            Ok(out)
        }
        wgpu::TextureFormat::Rgba16Float => Ok(texels
            .chunks_exact(2)
            .map(|b| unorm8(half::f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32()))
            .collect()),
        wgpu::TextureFormat::Rgba32Float => Ok(texels
            .chunks_exact(4)
            .map(|b| unorm8(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            .collect()),
        other => Err(EffectError::Resource(format!(
            "cannot read back a {:?} texture as RGBA8",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Resource manager
// ---------------------------------------------------------------------------

/// A texture owned by the resource manager.
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
}

impl GpuTexture {
    pub fn size(&self) -> [u32; 2] {
        [self.width, self.height]
    }
}

pub struct ResourceManager {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    asset_root: PathBuf,
    textures: HashMap<String, GpuTexture>,
    samplers: HashMap<String, wgpu::Sampler>,
    uniforms: HashMap<String, wgpu::Buffer>,
    parameters: Vec<Parameter>,
    values: Vec<f64>,
}

impl ResourceManager {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            asset_root: PathBuf::from("."),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            uniforms: HashMap::new(),
            parameters: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Directory `SOURCE` texture paths are resolved against.
    pub fn set_asset_root(&mut self, root: impl Into<PathBuf>) {
        self.asset_root = root.into();
    }

    /// Create every object the effect's generated modules bind. Whatever a
    /// previous call created is destroyed first.
    pub fn initialize(&mut self, ir: &ShaderIr, external: &ExternalResources) -> Result<(), EffectError> {
        self.dispose();

        let input_size = input_size(external)?;
        let input_format = match external.textures.get(INPUT) {
            Some(desc) => desc.texture_format(INPUT)?.unwrap_or(TextureFormat::Rgba8Unorm),
            None => TextureFormat::Rgba8Unorm,
        };
        if input_format.sampled_wgsl_type() != "f32" {
            return Err(EffectError::Resource(format!(
                "INPUT must have a float format, got {}",
                input_format.wgsl_name()
            )));
        }
        self.create_texture(INPUT, wgpu_format(input_format), input_size, false);
        let context = size_context(&external.defines, input_size, None);

        let output_format = ir.output_format();
        let output_size = match (external.textures.get(OUTPUT), ir.texture(OUTPUT)) {
            (Some(desc), _) => override_size(OUTPUT, output_format, desc)?,
            (None, Some(declared)) if declared.width.is_some() => resolve_size(declared, &context)?,
            _ => input_size,
        };
        self.create_texture(OUTPUT, wgpu_format(output_format), output_size, true);
        let context = size_context(&external.defines, input_size, Some(output_size));

        for texture in ir.owned_textures() {
            match &texture.source {
                Some(source) => {
                    if external.textures.contains_key(&texture.name) {
                        tracing::warn!(
                            "Ignoring override for '{}': it is loaded from {}",
                            texture.name,
                            source
                        );
                    }
                    self.load_source_texture(&texture.name, source)?
                }
                None => {
                    let format = texture.format.ok_or_else(|| {
                        EffectError::Resource(format!("texture '{}' has no format", texture.name))
                    })?;
                    let size = match external.textures.get(&texture.name) {
                        Some(desc) => override_size(&texture.name, format, desc)?,
                        None => resolve_size(texture, &context)?,
                    };
                    self.create_texture(
                        &texture.name,
                        wgpu_format(format),
                        size,
                        format.is_storage_capable(),
                    );
                }
            }
        }

        self.create_sampler(DEFAULT_SAMPLER, FilterMode::Linear, AddressMode::Clamp);
        for sampler in &ir.samplers {
            self.create_sampler(&sampler.name, sampler.filter, sampler.address);
        }

        self.parameters = ir.parameters.clone();
        self.values = ir.parameters.iter().map(|p| p.default).collect();
        if !self.parameters.is_empty() {
            let bytes = pack_parameters(&self.parameters, &self.values);
            self.create_uniform(PARAMS_UNIFORM, &bytes);
        }
        let scene = SceneInfo::new(input_size, output_size);
        self.create_uniform(SCENE_UNIFORM, bytemuck::bytes_of(&scene));

        tracing::info!(
            "Allocated {} textures, {} samplers, {} uniforms (input {}x{}, output {}x{})",
            self.textures.len(),
            self.samplers.len(),
            self.uniforms.len(),
            input_size[0],
            input_size[1],
            output_size[0],
            output_size[1]
        );
        Ok(())
    }

    pub fn get_texture(&self, name: &str) -> Option<&GpuTexture> {
        self.textures.get(name)
    }

    pub fn get_sampler(&self, name: &str) -> Option<&wgpu::Sampler> {
        self.samplers.get(name)
    }

    pub fn get_uniform(&self, name: &str) -> Option<&wgpu::Buffer> {
        self.uniforms.get(name)
    }

    pub fn texture_names(&self) -> impl Iterator<Item = &str> {
        self.textures.keys().map(String::as_str)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Current value of a parameter, after clamping.
    pub fn uniform_value(&self, name: &str) -> Option<f64> {
        let i = self.parameters.iter().position(|p| p.name == name)?;
        self.values.get(i).copied()
    }

    /// Upload an image into a named texture. The image must match the
    /// texture's size; uploading into `INPUT` refreshes the `scene` uniform.
    pub fn update_texture_from_image(&mut self, name: &str, image: &image::DynamicImage) -> Result<(), EffectError> {
        let target = self
            .textures
            .get(name)
            .ok_or_else(|| EffectError::Resource(format!("texture '{}' not found", name)))?;
        if [image.width(), image.height()] != target.size() {
            return Err(EffectError::Resource(format!(
                "image is {}x{} but texture '{}' is {}x{}",
                image.width(),
                image.height(),
                name,
                target.width,
                target.height
            )));
        }
        let texels = encode_texels(target.format, image)?;
        self.write_texels(target, &texels)?;
        tracing::debug!("Uploaded {}x{} image into '{}'", target.width, target.height, name);

        if name == INPUT {
            self.refresh_scene()?;
        }
        Ok(())
    }

    /// Write a parameter into the `params` uniform, clamped to its range.
    pub fn update_uniform(&mut self, name: &str, value: &UniformValue) -> Result<(), EffectError> {
        let index = self
            .parameters
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| EffectError::Resource(format!("unknown parameter '{}'", name)))?;
        let param = &self.parameters[index];
        let raw = value.as_scalar().ok_or_else(|| {
            EffectError::Resource(format!("parameter '{}' takes a single value, got {:?}", name, value))
        })?;
        let clamped = param.clamp(raw);
        if clamped != raw {
            tracing::debug!("Clamped '{}' from {} to {}", name, raw, clamped);
        }
        let buffer = self
            .uniforms
            .get(PARAMS_UNIFORM)
            .ok_or_else(|| EffectError::Resource("params uniform not allocated".to_string()))?;
        self.queue.write_buffer(
            buffer,
            index as u64 * PARAM_FIELD_STRIDE,
            &encode_parameter(param.ty, clamped),
        );
        self.values[index] = clamped;
        Ok(())
    }

    /// Copy a texture back to the CPU as RGBA8. Blocks until the GPU is done.
    pub fn read_texture_rgba8(&self, name: &str) -> Result<image::RgbaImage, EffectError> {
        let source = self
            .textures
            .get(name)
            .ok_or_else(|| EffectError::Resource(format!("texture '{}' not found", name)))?;
        let bpp = bytes_per_texel(source.format).ok_or_else(|| {
            EffectError::Resource(format!(
                "cannot read back texture '{}' with format {:?}",
                name, source.format
            ))
        })?;
        let unpadded = source.width * bpp;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let buffer_size = padded as u64 * source.height as u64;

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("shade.readback"),
            size: buffer_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("shade.readback.encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(source.height),
                },
            },
            extent(source.size()),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EffectError::Resource(format!("readback of '{}' failed: {}", name, e))),
            Err(_) => return Err(EffectError::Resource(format!("readback of '{}' was cancelled", name))),
        }

        let mut texels = Vec::with_capacity((unpadded * source.height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks_exact(padded as usize) {
                texels.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        readback.unmap();

        let rgba = decode_rgba8(source.format, &texels)?;
        image::RgbaImage::from_raw(source.width, source.height, rgba)
            .ok_or_else(|| EffectError::Resource(format!("readback of '{}' has the wrong size", name)))
    }

    /// Destroy everything this manager owns.
    pub fn dispose(&mut self) {
        for (name, tex) in self.textures.drain() {
            tracing::debug!("Destroying texture '{}'", name);
            tex.texture.destroy();
        }
        for (_, buffer) in self.uniforms.drain() {
            buffer.destroy();
        }
        self.samplers.clear();
        self.parameters.clear();
        self.values.clear();
    }

    // --- internal ---

    /// Insert a texture, destroying any previous texture with the same name.
    fn insert_texture(&mut self, name: &str, texture: GpuTexture) {
        if let Some(old) = self.textures.insert(name.to_string(), texture) {
            tracing::debug!("Replaced texture '{}'", name);
            old.texture.destroy();
        }
    }

    fn create_texture(&mut self, name: &str, format: wgpu::TextureFormat, size: [u32; 2], storage: bool) {
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC;
        if storage {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        let [width, height] = [size[0].max(1), size[1].max(1)];
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(name),
            size: extent([width, height]),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        tracing::debug!("Allocated texture '{}': {:?} {}x{}", name, format, width, height);
        self.insert_texture(
            name,
            GpuTexture {
                texture,
                view,
                format,
                width,
                height,
            },
        );
    }

    fn load_source_texture(&mut self, name: &str, source: &str) -> Result<(), EffectError> {
        let path = self.asset_root.join(source);
        let image = image::open(&path)?;
        tracing::debug!("Loaded '{}' from {:?}", name, path);
        self.create_texture(
            name,
            wgpu::TextureFormat::Rgba8Unorm,
            [image.width(), image.height()],
            false,
        );
        self.update_texture_from_image(name, &image)
    }

    fn write_texels(&self, target: &GpuTexture, texels: &[u8]) -> Result<(), EffectError> {
        let bpp = bytes_per_texel(target.format).ok_or_else(|| {
            EffectError::Resource(format!("cannot upload into format {:?}", target.format))
        })?;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            texels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(target.width * bpp),
                rows_per_image: Some(target.height),
            },
            extent(target.size()),
        );
        Ok(())
    }

    fn refresh_scene(&self) -> Result<(), EffectError> {
        let input = self.textures.get(INPUT).map(GpuTexture::size);
        let output = self.textures.get(OUTPUT).map(GpuTexture::size);
        let (Some(input), Some(output), Some(buffer)) = (input, output, self.uniforms.get(SCENE_UNIFORM)) else {
            return Err(EffectError::Resource("scene uniform not allocated".to_string()));
        };
        let scene = SceneInfo::new(input, output);
        self.queue.write_buffer(buffer, 0, bytemuck::bytes_of(&scene));
        Ok(())
    }

    fn create_sampler(&mut self, name: &str, filter: FilterMode, address: AddressMode) {
        let filter_mode = match filter {
            FilterMode::Linear => wgpu::FilterMode::Linear,
            FilterMode::Point => wgpu::FilterMode::Nearest,
        };
        let address_mode = match address {
            AddressMode::Clamp => wgpu::AddressMode::ClampToEdge,
            AddressMode::Wrap => wgpu::AddressMode::Repeat,
        };
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(name),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: filter_mode,
            min_filter: filter_mode,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        self.samplers.insert(name.to_string(), sampler);
    }

    fn create_uniform(&mut self, name: &str, contents: &[u8]) {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(name),
            size: contents.len() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.write_buffer(&buffer, 0, contents);
        tracing::debug!("Allocated uniform '{}' ({} bytes)", name, contents.len());
        if let Some(old) = self.uniforms.insert(name.to_string(), buffer) {
            old.destroy();
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn extent(size: [u32; 2]) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size[0],
        height: size[1],
        depth_or_array_layers: 1,
    }
}

/// Size of `INPUT`: an explicit texture override wins over the
/// `INPUT_WIDTH`/`INPUT_HEIGHT` defines.
pub fn input_size(external: &ExternalResources) -> Result<[u32; 2], EffectError> {
    if let Some(desc) = external.textures.get(INPUT) {
        return Ok([desc.width, desc.height]);
    }
    match (
        external.defines.get("INPUT_WIDTH"),
        external.defines.get("INPUT_HEIGHT"),
    ) {
        (Some(w), Some(h)) if *w >= 1.0 && *h >= 1.0 => Ok([w.round() as u32, h.round() as u32]),
        _ => Err(EffectError::Resource(
            "INPUT size unknown: supply textures.INPUT or define INPUT_WIDTH and INPUT_HEIGHT".to_string(),
        )),
    }
}

/// Named constants visible to size expressions. Caller defines win over the
/// `INPUT_*` and `OUTPUT_*` values derived from the created textures.
pub fn size_context(
    defines: &HashMap<String, f64>,
    input: [u32; 2],
    output: Option<[u32; 2]>,
) -> HashMap<String, f64> {
    let mut context = defines.clone();
    let mut fallback = |name: &str, value: u32| {
        context.entry(name.to_string()).or_insert(value as f64);
    };
    fallback("INPUT_WIDTH", input[0]);
    fallback("INPUT_HEIGHT", input[1]);
    if let Some([width, height]) = output {
        fallback("OUTPUT_WIDTH", width);
        fallback("OUTPUT_HEIGHT", height);
    }
    context
}

/// Size from an `external.textures` entry. A format in the entry must agree
/// with the one the effect declares.
pub fn override_size(
    name: &str,
    declared: TextureFormat,
    desc: &TextureDescriptor,
) -> Result<[u32; 2], EffectError> {
    if let Some(format) = desc.texture_format(name)? {
        if format != declared {
            return Err(EffectError::Resource(format!(
                "override format {} for texture '{}' does not match the declared {}",
                format.wgsl_name(),
                name,
                declared.wgsl_name()
            )));
        }
    }
    if desc.width == 0 || desc.height == 0 {
        return Err(EffectError::Resource(format!(
            "override for texture '{}' has a zero size",
            name
        )));
    }
    Ok([desc.width, desc.height])
}

/// Evaluate a texture's `WIDTH`/`HEIGHT` against the named constants.
pub fn resolve_size(texture: &Texture, context: &HashMap<String, f64>) -> Result<[u32; 2], EffectError> {
    let dim = |expr: &Option<SizeExpr>, axis: &str| -> Result<u32, EffectError> {
        let value = match expr {
            Some(SizeExpr::Literal(v)) => *v as f64,
            Some(SizeExpr::Expr(src)) => Expr::parse(src)
                .and_then(|e| e.eval(context))
                .map_err(|error| EffectError::Expr {
                    texture: texture.name.clone(),
                    error,
                })?,
            None => {
                return Err(EffectError::Resource(format!(
                    "texture '{}' has no {}",
                    texture.name, axis
                )))
            }
        };
        let rounded = value.round();
        if !rounded.is_finite() || rounded < 1.0 {
            return Err(EffectError::Resource(format!(
                "texture '{}' {} evaluates to {}, which is not a positive size",
                texture.name, axis, value
            )));
        }
        Ok(rounded as u32)
    };
    Ok([dim(&texture.width, "WIDTH")?, dim(&texture.height, "HEIGHT")?])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(width: SizeExpr, height: SizeExpr) -> Texture {
        Texture {
            name: "half_res".to_string(),
            source: None,
            format: Some(TextureFormat::Rgba16Float),
            width: Some(width),
            height: Some(height),
        }
    }

    fn context() -> HashMap<String, f64> {
        [("INPUT_WIDTH", 1920.0), ("INPUT_HEIGHT", 1080.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_resolve_expression_sizes() {
        let tex = texture(
            SizeExpr::Expr("INPUT_WIDTH/2".to_string()),
            SizeExpr::Expr("INPUT_HEIGHT / 3".to_string()),
        );
        assert_eq!(resolve_size(&tex, &context()).unwrap(), [960, 360]);

        let tex = texture(SizeExpr::Literal(64), SizeExpr::Expr("INPUT_HEIGHT / 7".to_string()));
        assert_eq!(resolve_size(&tex, &context()).unwrap(), [64, 154]);
    }

    #[test]
    fn test_resolve_undefined_variable() {
        let tex = texture(SizeExpr::Expr("OUTPUT_WIDTH".to_string()), SizeExpr::Literal(1));
        match resolve_size(&tex, &context()) {
            Err(EffectError::Expr { texture, error }) => {
                assert_eq!(texture, "half_res");
                assert_eq!(error, shade_core::ExprError::UndefinedVariable("OUTPUT_WIDTH".to_string()));
            }
            other => panic!("Expected expression error, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_resolve_rejects_zero() {
        let tex = texture(SizeExpr::Expr("INPUT_WIDTH - 1920".to_string()), SizeExpr::Literal(1));
        assert!(matches!(resolve_size(&tex, &context()), Err(EffectError::Resource(_))));
    }

    #[test]
    fn test_input_size_sources() {
        let from_texture = ExternalResources::default().with_texture(INPUT, TextureDescriptor::new(640, 480));
        assert_eq!(input_size(&from_texture).unwrap(), [640, 480]);

        let from_defines = ExternalResources::default()
            .with_define("INPUT_WIDTH", 1920.0)
            .with_define("INPUT_HEIGHT", 1080.0);
        assert_eq!(input_size(&from_defines).unwrap(), [1920, 1080]);

        assert!(input_size(&ExternalResources::default()).is_err());
    }

    #[test]
    fn test_defines_win_over_derived_sizes() {
        let defines: HashMap<String, f64> = [("INPUT_WIDTH".to_string(), 1920.0)].into_iter().collect();
        let context = size_context(&defines, [640, 480], None);
        assert_eq!(context["INPUT_WIDTH"], 1920.0);
        assert_eq!(context["INPUT_HEIGHT"], 480.0);
        assert!(!context.contains_key("OUTPUT_WIDTH"));

        let tex = texture(SizeExpr::Expr("INPUT_WIDTH/2".to_string()), SizeExpr::Literal(1));
        assert_eq!(resolve_size(&tex, &context).unwrap(), [960, 1]);

        let context = size_context(&defines, [640, 480], Some([320, 240]));
        assert_eq!(context["OUTPUT_WIDTH"], 320.0);
        assert_eq!(context["OUTPUT_HEIGHT"], 240.0);
    }

    #[test]
    fn test_override_size_checks_format() {
        let plain = TextureDescriptor::new(256, 16);
        assert_eq!(override_size("lut", TextureFormat::Rgba16Float, &plain).unwrap(), [256, 16]);

        let matching = TextureDescriptor {
            format: Some("R16G16B16A16_FLOAT".to_string()),
            ..TextureDescriptor::new(256, 16)
        };
        assert_eq!(override_size("lut", TextureFormat::Rgba16Float, &matching).unwrap(), [256, 16]);

        let mismatched = TextureDescriptor {
            format: Some("rgba8unorm".to_string()),
            ..TextureDescriptor::new(256, 16)
        };
        match override_size("lut", TextureFormat::Rgba16Float, &mismatched) {
            Err(EffectError::Resource(msg)) => assert!(msg.contains("'lut'")),
            other => panic!("Expected format mismatch, got: {:?}", other),
        }

        let unknown = TextureDescriptor {
            format: Some("rgb565".to_string()),
            ..TextureDescriptor::new(256, 16)
        };
        match override_size("lut", TextureFormat::Rgba16Float, &unknown) {
            Err(EffectError::Resource(msg)) => assert!(msg.contains("unknown format 'rgb565'")),
            other => panic!("Expected unknown format, got: {:?}", other),
        }

        assert!(override_size("lut", TextureFormat::Rgba16Float, &TextureDescriptor::new(0, 16)).is_err());
    }

    #[test]
    fn test_scene_info_layout() {
        assert_eq!(std::mem::size_of::<SceneInfo>(), 40);
        let scene = SceneInfo::new([960, 540], [1920, 1080]);
        assert_eq!(scene.scale, [2.0, 2.0]);
        assert_eq!(scene.output_pt, [1.0 / 1920.0, 1.0 / 1080.0]);
    }

    #[test]
    fn test_pack_parameters() {
        let params = vec![
            Parameter {
                name: "strength".to_string(),
                ty: ParamType::Float,
                default: 0.5,
                min: 0.0,
                max: 1.0,
                step: 0.01,
                label: None,
            },
            Parameter {
                name: "radius".to_string(),
                ty: ParamType::Int,
                default: 2.0,
                min: 1.0,
                max: 4.0,
                step: 1.0,
                label: None,
            },
        ];
        let bytes = pack_parameters(&params, &[0.5, 3.0]);
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..4], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[4..16], &[0u8; 12]);
        assert_eq!(&bytes[16..20], &3i32.to_le_bytes());
    }

    #[test]
    fn test_texel_encoding() {
        let mut img = image::RgbaImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        img.put_pixel(1, 0, image::Rgba([0, 0, 255, 128]));
        let img = image::DynamicImage::ImageRgba8(img);

        let bgra = encode_texels(wgpu::TextureFormat::Bgra8Unorm, &img).unwrap();
        assert_eq!(bgra, vec![0, 0, 255, 255, 255, 0, 0, 128]);

        let halves = encode_texels(wgpu::TextureFormat::Rgba16Float, &img).unwrap();
        assert_eq!(halves.len(), 16);
        assert_eq!(decode_rgba8(wgpu::TextureFormat::Rgba16Float, &halves).unwrap(), img.to_rgba8().into_raw());

        let floats = encode_texels(wgpu::TextureFormat::Rgba32Float, &img).unwrap();
        assert_eq!(floats.len(), 32);
        assert_eq!(decode_rgba8(wgpu::TextureFormat::Rgba32Float, &floats).unwrap(), img.to_rgba8().into_raw());

        assert!(encode_texels(wgpu::TextureFormat::R32Float, &img).is_err());
    }

    #[test]
    fn test_uniform_value_arity() {
        assert_eq!(UniformValue::from(0.25f32).as_scalar(), Some(0.25));
        assert_eq!(UniformValue::Vector(vec![2.0]).as_scalar(), Some(2.0));
        assert_eq!(UniformValue::Vector(vec![1.0, 2.0]).as_scalar(), None);
    }
}
