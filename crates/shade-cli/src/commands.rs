use std::path::Path;

use shade_core::artifact::{build_artifacts, PipelineDescription};
use shade_core::codegen::BindingKind;
use shade_gpu::{Effect, EffectError, ExternalResources, TextureDescriptor};

use crate::cli::{OverrideArgs, ReportFormat};

fn effect_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "effect".to_string())
}

fn read_source(path: &Path) -> Result<String, EffectError> {
    std::fs::read_to_string(path).map_err(|e| {
        EffectError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot read {}: {}", path.display(), e),
        ))
    })
}

/// Parse, generate, and write the artifact set into `out`.
pub fn build(effect: &Path, out: &Path) -> Result<(), EffectError> {
    let source = read_source(effect)?;
    let ir = shade_core::parse(&source)?;
    let modules = shade_core::generate(&ir)?;
    let artifacts = build_artifacts(&effect_name(effect), &ir, &modules)
        .map_err(|e| EffectError::Resource(format!("cannot serialize artifacts: {}", e)))?;

    std::fs::create_dir_all(out)?;
    for (name, contents) in &artifacts.files {
        std::fs::write(out.join(name), contents)?;
    }
    tracing::info!(
        "Built {:?} into {:?} ({} files)",
        effect,
        out,
        artifacts.files.len()
    );
    Ok(())
}

/// Build once, then again on every change until the process is stopped.
pub fn build_watch(effect: &Path, out: &Path) -> Result<(), EffectError> {
    if let Err(e) = build(effect, out) {
        tracing::error!("{}", e);
    }
    let (_watcher, rx) = crate::watcher::watch_effect(effect)
        .map_err(|e| EffectError::Resource(format!("cannot watch {:?}: {}", effect, e)))?;
    while rx.recv().is_ok() {
        // Editors emit bursts of events for one save.
        while rx.try_recv().is_ok() {}
        match build(effect, out) {
            Ok(()) => {}
            Err(e) => tracing::error!("{}", e),
        }
    }
    Ok(())
}

/// Parse and generate, then print a summary of passes and bindings.
pub fn check(effect: &Path, format: ReportFormat) -> Result<(), EffectError> {
    let source = read_source(effect)?;
    let ir = shade_core::parse(&source)?;
    let modules = shade_core::generate(&ir)?;

    match format {
        ReportFormat::Json => {
            let json = serde_json::to_string_pretty(&PipelineDescription::new(&ir, &modules))
                .map_err(|e| EffectError::Resource(format!("cannot serialize report: {}", e)))?;
            println!("{}", json);
        }
        ReportFormat::Text => {
            println!(
                "{}: version {}, {} parameters, {} textures, {} samplers",
                effect.display(),
                ir.metadata.version,
                ir.parameters.len(),
                ir.textures.len(),
                ir.samplers.len()
            );
            for (pass, module) in ir.passes.iter().zip(&modules) {
                let [x, y, z] = module.workgroup_size;
                println!(
                    "  {} [{:?}] {} -> {}  workgroup {}x{}x{}",
                    pass.name(),
                    pass.style,
                    pass.inputs.join(", "),
                    pass.outputs.join(", "),
                    x,
                    y,
                    z
                );
                for res in &module.resources {
                    let kind = match res.kind {
                        BindingKind::Sampler { .. } => "sampler",
                        BindingKind::Uniform => "uniform",
                        BindingKind::SampledTexture { .. } => "sampled",
                        BindingKind::StorageTexture { .. } => "storage",
                    };
                    println!("    @binding({}) {} ({})", res.binding, res.name, kind);
                }
            }
        }
    }
    Ok(())
}

pub struct RunOptions<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub output_size: Option<[u32; 2]>,
    pub parameters: &'a [(String, f64)],
    pub overrides: &'a OverrideArgs,
}

fn collect_overrides(args: &OverrideArgs) -> Result<ExternalResources, EffectError> {
    let mut external = match &args.overrides {
        Some(path) => ExternalResources::load(path)?,
        None => ExternalResources::default(),
    };
    for (name, value) in &args.defines {
        external.defines.insert(name.clone(), *value);
    }
    Ok(external)
}

/// Apply an effect to one image on a headless device.
pub fn run(effect_path: &Path, opts: &RunOptions<'_>) -> Result<(), EffectError> {
    let source = read_source(effect_path)?;
    let input = image::open(opts.input)?;

    let mut external = collect_overrides(opts.overrides)?;
    external
        .textures
        .insert("INPUT".to_string(), TextureDescriptor::new(input.width(), input.height()));
    if let Some([width, height]) = opts.output_size {
        external
            .textures
            .insert("OUTPUT".to_string(), TextureDescriptor::new(width, height));
    }

    let (device, queue) = pollster::block_on(shade_gpu::request_device())
        .ok_or_else(|| EffectError::Resource("no GPU adapter available".to_string()))?;

    let asset_root = effect_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mut effect = Effect::new(device.clone(), queue.clone()).with_asset_root(asset_root);
    pollster::block_on(effect.compile(&source, &external))?;

    for (name, value) in opts.parameters {
        effect.update_uniform(name, *value)?;
    }
    effect.update_texture_from_image("INPUT", &input)?;

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("shade.run"),
    });
    effect.dispatch_all(&mut encoder)?;
    queue.submit(std::iter::once(encoder.finish()));

    let result = effect.read_output()?;
    result.save(opts.output)?;
    tracing::info!(
        "Wrote {}x{} result to {:?}",
        result.width(),
        result.height(),
        opts.output
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EFFECT: &str = "//! VERSION 4\n//! PASS 1\n//! STYLE PS\n//! IN INPUT\n//! OUT OUTPUT\n\
                          fn Pass1(pos: vec2<f32>) -> vec4<f32> {\n    return textureSampleLevel(INPUT, default_sampler, pos, 0.0);\n}\n";

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("shade-cli-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_build_writes_artifacts() {
        let dir = scratch_dir("build");
        let effect = dir.join("passthrough.wgsl");
        std::fs::write(&effect, EFFECT).unwrap();

        let out = dir.join("out");
        build(&effect, &out).unwrap();

        assert!(out.join("pass_1.wgsl").exists());
        let metadata = std::fs::read_to_string(out.join("metadata.json")).unwrap();
        assert!(metadata.contains("\"name\": \"passthrough\""));
        assert!(out.join("pipeline.json").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_build_reports_parse_error() {
        let dir = scratch_dir("bad");
        let effect = dir.join("bad.wgsl");
        std::fs::write(&effect, EFFECT.replace("//! VERSION 4\n", "")).unwrap();
        match build(&effect, &dir.join("out")) {
            Err(EffectError::Parse(_)) => {}
            other => panic!("Expected parse error, got: {:?}", other),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_defines_override_yaml() {
        let dir = scratch_dir("overrides");
        let yaml = dir.join("overrides.yaml");
        std::fs::write(&yaml, "defines:\n  SCALE: 2\n  INPUT_WIDTH: 10\n").unwrap();
        let args = OverrideArgs {
            overrides: Some(yaml),
            defines: vec![("SCALE".to_string(), 3.0)],
        };
        let external = collect_overrides(&args).unwrap();
        assert_eq!(external.defines["SCALE"], 3.0);
        assert_eq!(external.defines["INPUT_WIDTH"], 10.0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_effect_name() {
        assert_eq!(effect_name(Path::new("fx/Sharpen.wgsl")), "Sharpen");
    }
}
