//! WGSL code generation: one self-contained compute module per pass.
//!
//! Binding layout for every module, all in `@group(0)`:
//!
//! | binding | resource                                        |
//! |---------|-------------------------------------------------|
//! | 0       | `default_sampler` (linear, clamp)               |
//! | 1       | `params` uniform (only when parameters exist)   |
//! | 2       | `scene` uniform                                 |
//! | 3..     | pass textures, then every declared sampler      |
//!
//! [`allocate_bindings`] is a pure function of the IR and the pass, so the
//! GPU side can rebuild the same layout from a [`GeneratedModule`] alone.

use std::fmt::Write as _;

use serde::Serialize;

use crate::compat::{apply_compat_fixes, function_decls, identifiers, strip_entry_attributes};
use crate::ir::{
    is_reserved_texture, FilterMode, Pass, PassStyle, ShaderIr, TextureFormat, INPUT, OUTPUT,
};

pub const DEFAULT_SAMPLER_BINDING: u32 = 0;
pub const PARAMS_BINDING: u32 = 1;
pub const SCENE_BINDING: u32 = 2;
pub const FIRST_RESOURCE_BINDING: u32 = 3;

pub const DEFAULT_SAMPLER: &str = "default_sampler";
pub const PARAMS_UNIFORM: &str = "params";
pub const SCENE_UNIFORM: &str = "scene";
pub const ENTRY_POINT: &str = "main";

/// Byte stride of one parameter inside the `params` uniform.
pub const PARAM_FIELD_STRIDE: u64 = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum GenerateError {
    EntryPointNotFound { pass: u32, expected: String },
    NotStorageCapable { pass: u32, texture: String, format: TextureFormat },
    UnknownTexture { pass: u32, texture: String },
}

impl std::fmt::Display for GenerateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntryPointNotFound { pass, expected } => write!(
                f,
                "PASS {}: no entry function found (expected 'fn {}(...)')",
                pass, expected
            ),
            Self::NotStorageCapable { pass, texture, format } => write!(
                f,
                "PASS {}: texture '{}' is written but format {} cannot be a storage texture",
                pass,
                texture,
                format.wgsl_name()
            ),
            Self::UnknownTexture { pass, texture } => {
                write!(f, "PASS {}: unknown texture '{}'", pass, texture)
            }
        }
    }
}

impl std::error::Error for GenerateError {}

// ---------------------------------------------------------------------------
// Binding model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingKind {
    Sampler {
        filter: FilterMode,
    },
    Uniform,
    /// Read-only texture. `format` is `None` for externally supplied or
    /// file-backed textures.
    SampledTexture {
        #[serde(skip_serializing_if = "Option::is_none")]
        format: Option<TextureFormat>,
    },
    StorageTexture {
        format: TextureFormat,
    },
}

impl BindingKind {
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageTexture { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceBinding {
    pub binding: u32,
    pub name: String,
    #[serde(flatten)]
    pub kind: BindingKind,
}

/// Output of the generator for one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedModule {
    pub pass_index: u32,
    pub wgsl_code: String,
    /// Every binding the module declares, ordered by binding index.
    pub resources: Vec<ResourceBinding>,
    /// Workgroup size attached to the entry point.
    pub workgroup_size: [u32; 3],
}

impl GeneratedModule {
    pub fn pass_name(&self) -> String {
        format!("PASS_{}", self.pass_index)
    }

    pub fn binding(&self, name: &str) -> Option<&ResourceBinding> {
        self.resources.iter().find(|r| r.name == name)
    }
}

/// Texture names a pass binds, in binding order: `INPUT`, then declared
/// textures in declaration order, then `OUTPUT`.
fn pass_textures<'a>(ir: &'a ShaderIr, pass: &Pass) -> Vec<&'a str> {
    std::iter::once(INPUT)
        .chain(ir.owned_textures().map(|t| t.name.as_str()))
        .chain(std::iter::once(OUTPUT))
        .filter(|name| pass.references(name))
        .collect()
}

/// Deterministic binding table for one pass.
pub fn allocate_bindings(ir: &ShaderIr, pass: &Pass) -> Result<Vec<ResourceBinding>, GenerateError> {
    let mut bindings = vec![ResourceBinding {
        binding: DEFAULT_SAMPLER_BINDING,
        name: DEFAULT_SAMPLER.to_string(),
        kind: BindingKind::Sampler {
            filter: FilterMode::Linear,
        },
    }];
    if !ir.parameters.is_empty() {
        bindings.push(ResourceBinding {
            binding: PARAMS_BINDING,
            name: PARAMS_UNIFORM.to_string(),
            kind: BindingKind::Uniform,
        });
    }
    bindings.push(ResourceBinding {
        binding: SCENE_BINDING,
        name: SCENE_UNIFORM.to_string(),
        kind: BindingKind::Uniform,
    });

    if let Some(unknown) = pass
        .inputs
        .iter()
        .chain(&pass.outputs)
        .find(|n| !is_reserved_texture(n) && ir.texture(n).is_none())
    {
        return Err(GenerateError::UnknownTexture {
            pass: pass.index,
            texture: unknown.clone(),
        });
    }

    let mut next = FIRST_RESOURCE_BINDING;
    for name in pass_textures(ir, pass) {
        let declared = ir.texture(name);
        let kind = if name == OUTPUT || pass.writes(name) {
            let format = if name == OUTPUT {
                ir.output_format()
            } else {
                declared.and_then(|t| t.format).unwrap_or(TextureFormat::Rgba8Unorm)
            };
            if !format.is_storage_capable() {
                return Err(GenerateError::NotStorageCapable {
                    pass: pass.index,
                    texture: name.to_string(),
                    format,
                });
            }
            BindingKind::StorageTexture { format }
        } else {
            BindingKind::SampledTexture {
                format: declared.and_then(|t| t.format),
            }
        };
        bindings.push(ResourceBinding {
            binding: next,
            name: name.to_string(),
            kind,
        });
        next += 1;
    }

    for sampler in &ir.samplers {
        bindings.push(ResourceBinding {
            binding: next,
            name: sampler.name.clone(),
            kind: BindingKind::Sampler {
                filter: sampler.filter,
            },
        });
        next += 1;
    }

    Ok(bindings)
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Generate one module per pass, in pass order.
pub fn generate(ir: &ShaderIr) -> Result<Vec<GeneratedModule>, GenerateError> {
    let common = apply_compat_fixes(&ir.common_code);
    let mut modules = Vec::with_capacity(ir.passes.len());
    for pass in &ir.passes {
        let module = generate_pass(ir, pass, &common)?;
        tracing::debug!(
            "Generated {} ({} bindings): {}",
            module.pass_name(),
            module.resources.len(),
            module
                .resources
                .iter()
                .map(|r| format!("{}={}", r.binding, r.name))
                .collect::<Vec<_>>()
                .join(", ")
        );
        modules.push(module);
    }
    Ok(modules)
}

fn generate_pass(ir: &ShaderIr, pass: &Pass, common: &str) -> Result<GeneratedModule, GenerateError> {
    let resources = allocate_bindings(ir, pass)?;
    let workgroup_size = pass.effective_num_threads();

    let mut out = String::new();
    let _ = writeln!(out, "// PASS_{} generated by shade. Do not edit.", pass.index);
    if let Some(desc) = &pass.desc {
        let _ = writeln!(out, "// {}", desc);
    }
    out.push('\n');

    write_declarations(&mut out, ir, &resources, common);

    if !common.trim().is_empty() {
        out.push_str(common.trim_end());
        out.push_str("\n\n");
    }

    let body = apply_compat_fixes(&pass.code);
    match pass.style {
        PassStyle::Compute => {
            out.push_str(rewrite_compute_entry(pass.index, &body, workgroup_size)?.trim_end());
            out.push('\n');
        }
        PassStyle::Pixel => {
            let entry = find_entry_name(pass.index, &body).ok_or_else(|| {
                GenerateError::EntryPointNotFound {
                    pass: pass.index,
                    expected: format!("Pass{}", pass.index),
                }
            })?;
            out.push_str(body.trim_end());
            out.push_str("\n\n");
            write_pixel_wrapper(&mut out, pass, &entry, workgroup_size);
        }
    }

    Ok(GeneratedModule {
        pass_index: pass.index,
        wgsl_code: out,
        resources,
        workgroup_size,
    })
}

fn declares(code: &str, name: &str) -> bool {
    identifiers(code)
        .windows(2)
        .any(|w| w[0].text == "var" && w[1].text == name)
}

fn write_declarations(out: &mut String, ir: &ShaderIr, resources: &[ResourceBinding], common: &str) {
    for res in resources {
        match (res.name.as_str(), &res.kind) {
            (DEFAULT_SAMPLER, _) => {
                if !declares(common, DEFAULT_SAMPLER) {
                    let _ = writeln!(
                        out,
                        "@group(0) @binding({}) var {}: sampler;",
                        res.binding, DEFAULT_SAMPLER
                    );
                }
            }
            (PARAMS_UNIFORM, BindingKind::Uniform) => {
                out.push_str("\nstruct EffectParams {\n");
                for p in &ir.parameters {
                    let _ = writeln!(
                        out,
                        "    @size({}) {}: {},",
                        PARAM_FIELD_STRIDE,
                        p.name,
                        p.ty.wgsl_type()
                    );
                }
                out.push_str("}\n");
                let _ = writeln!(
                    out,
                    "@group(0) @binding({}) var<uniform> {}: EffectParams;",
                    res.binding, PARAMS_UNIFORM
                );
            }
            (SCENE_UNIFORM, BindingKind::Uniform) => {
                out.push_str(SCENE_INFO_STRUCT);
                let _ = writeln!(
                    out,
                    "@group(0) @binding({}) var<uniform> {}: SceneInfo;\n",
                    res.binding, SCENE_UNIFORM
                );
            }
            (name, BindingKind::Sampler { .. }) => {
                let _ = writeln!(out, "@group(0) @binding({}) var {}: sampler;", res.binding, name);
            }
            (name, BindingKind::SampledTexture { format }) => {
                let sampled = format.map_or("f32", |f| f.sampled_wgsl_type());
                let _ = writeln!(
                    out,
                    "@group(0) @binding({}) var {}: texture_2d<{}>;",
                    res.binding, name, sampled
                );
            }
            (name, BindingKind::StorageTexture { format }) => {
                let _ = writeln!(
                    out,
                    "@group(0) @binding({}) var {}: texture_storage_2d<{}, write>;",
                    res.binding,
                    name,
                    format.wgsl_name()
                );
            }
            (_, BindingKind::Uniform) => {}
        }
    }
    out.push('\n');
}

const SCENE_INFO_STRUCT: &str = "
struct SceneInfo {
    input_size: vec2<u32>,
    output_size: vec2<u32>,
    input_pt: vec2<f32>,
    output_pt: vec2<f32>,
    scale: vec2<f32>,
}
";

/// Pick the entry function of a pass body: `Pass<index>` by name (any case),
/// else one marked `@compute`, else the last function declared.
fn find_entry_name(index: u32, body: &str) -> Option<String> {
    let decls = function_decls(body);
    let wanted = format!("pass{}", index);
    if let Some(d) = decls.iter().find(|d| d.name.eq_ignore_ascii_case(&wanted)) {
        return Some(d.name.clone());
    }
    let marked = decls.iter().find(|d| {
        let before = &body[..d.keyword];
        let attrs_start = before.rfind(['}', ';']).map_or(0, |p| p + 1);
        before[attrs_start..].contains("@compute")
    });
    marked.or(decls.last()).map(|d| d.name.clone())
}

fn rewrite_compute_entry(index: u32, body: &str, workgroup_size: [u32; 3]) -> Result<String, GenerateError> {
    let not_found = || GenerateError::EntryPointNotFound {
        pass: index,
        expected: format!("Pass{}", index),
    };
    let entry = find_entry_name(index, body).ok_or_else(not_found)?;
    let stripped = strip_entry_attributes(body);
    let decl = function_decls(&stripped)
        .into_iter()
        .find(|d| d.name == entry)
        .ok_or_else(not_found)?;

    let [x, y, z] = workgroup_size;
    let mut out = String::with_capacity(stripped.len() + 48);
    out.push_str(&stripped[..decl.keyword]);
    let _ = write!(out, "@compute @workgroup_size({}, {}, {})\nfn {}", x, y, z, ENTRY_POINT);
    out.push_str(&stripped[decl.name_end..]);
    Ok(out)
}

fn write_pixel_wrapper(out: &mut String, pass: &Pass, entry: &str, workgroup_size: [u32; 3]) {
    let [x, y, z] = workgroup_size;
    let primary = pass.primary_output();
    let _ = writeln!(out, "@compute @workgroup_size({}, {}, {})", x, y, z);
    let _ = writeln!(
        out,
        "fn {}(@builtin(global_invocation_id) gid: vec3<u32>) {{",
        ENTRY_POINT
    );
    let _ = writeln!(out, "    let dims = textureDimensions({});", primary);
    out.push_str("    if (gid.x >= dims.x || gid.y >= dims.y) {\n        return;\n    }\n");
    out.push_str("    let pos = (vec2<f32>(gid.xy) + vec2<f32>(0.5)) / vec2<f32>(dims);\n");
    if pass.outputs.len() == 1 {
        let _ = writeln!(out, "    textureStore({}, gid.xy, {}(pos));", primary, entry);
    } else {
        for i in 0..pass.outputs.len() {
            let _ = writeln!(out, "    var o{}: vec4<f32>;", i);
        }
        let args: Vec<String> = (0..pass.outputs.len()).map(|i| format!("&o{}", i)).collect();
        let _ = writeln!(out, "    {}(pos, {});", entry, args.join(", "));
        for (i, name) in pass.outputs.iter().enumerate() {
            let _ = writeln!(out, "    textureStore({}, gid.xy, o{});", name, i);
        }
    }
    out.push_str("}\n");
}
