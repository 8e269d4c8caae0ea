//! One compute pipeline per pass, with bind-group layouts rebuilt from the
//! generator's binding table.

use std::sync::Arc;

use shade_core::codegen::{BindingKind, GeneratedModule, ResourceBinding, ENTRY_POINT};
use shade_core::ir::FilterMode;
use shade_core::ShaderIr;

use crate::error::EffectError;
use crate::resources::{wgpu_format, ResourceManager};

/// Workgroup counts covering `output_size` with groups of `num_threads`.
pub fn dispatch_counts(output_size: [u32; 2], num_threads: [u32; 3]) -> [u32; 3] {
    [
        output_size[0].div_ceil(num_threads[0].max(1)),
        output_size[1].div_ceil(num_threads[1].max(1)),
        1,
    ]
}

/// Bind-group layout entries mirroring a module's binding table.
///
/// Sampled textures the generator left without a format (`INPUT`, file-backed
/// textures) take theirs from `resolve_format`.
pub fn layout_entries(
    resources: &[ResourceBinding],
    resolve_format: impl Fn(&str) -> Option<wgpu::TextureFormat>,
) -> Vec<wgpu::BindGroupLayoutEntry> {
    resources
        .iter()
        .map(|res| {
            let ty = match res.kind {
                BindingKind::Sampler {
                    filter: FilterMode::Linear,
                } => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                BindingKind::Sampler {
                    filter: FilterMode::Point,
                } => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                BindingKind::Uniform => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                BindingKind::SampledTexture { format } => {
                    let format = format
                        .map(wgpu_format)
                        .or_else(|| resolve_format(&res.name))
                        .unwrap_or(wgpu::TextureFormat::Rgba8Unorm);
                    wgpu::BindingType::Texture {
                        sample_type: format
                            .sample_type(None, None)
                            .unwrap_or(wgpu::TextureSampleType::Float { filterable: true }),
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    }
                }
                BindingKind::StorageTexture { format } => wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: wgpu_format(format),
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
            };
            wgpu::BindGroupLayoutEntry {
                binding: res.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty,
                count: None,
            }
        })
        .collect()
}

/// Compiled state for one pass.
pub struct PassPipeline {
    pub index: u32,
    pub pipeline: wgpu::ComputePipeline,
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub resources: Vec<ResourceBinding>,
    pub num_threads: [u32; 3],
    /// Texture whose size drives the dispatch.
    pub primary_output: String,
}

pub struct PipelineManager {
    device: Arc<wgpu::Device>,
    passes: Vec<PassPipeline>,
}

impl PipelineManager {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            passes: Vec::new(),
        }
    }

    /// Build every pass pipeline. Existing pipelines are dropped first, and
    /// nothing is kept if any pass fails.
    pub async fn create_pipelines(
        &mut self,
        ir: &ShaderIr,
        modules: &[GeneratedModule],
        resources: &ResourceManager,
    ) -> Result<(), EffectError> {
        self.dispose();

        let mut built = Vec::with_capacity(modules.len());
        for (pass, module) in ir.passes.iter().zip(modules) {
            let label = pass.name();
            self.device.push_error_scope(wgpu::ErrorFilter::Validation);

            let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(module.wgsl_code.as_str().into()),
            });
            let entries = layout_entries(&module.resources, |name| {
                resources.get_texture(name).map(|t| t.format)
            });
            let bind_group_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&label),
                entries: &entries,
            });
            let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
            let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(ENTRY_POINT),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

            if let Some(err) = self.device.pop_error_scope().await {
                tracing::error!("{} failed to compile: {}", label, err);
                return Err(EffectError::Pipeline {
                    pass: pass.index,
                    message: err.to_string(),
                });
            }
            tracing::debug!("Built pipeline for {} ({} bindings)", label, entries.len());

            built.push(PassPipeline {
                index: pass.index,
                pipeline,
                bind_group_layout,
                resources: module.resources.clone(),
                num_threads: module.workgroup_size,
                primary_output: pass.primary_output().to_string(),
            });
        }

        self.passes = built;
        Ok(())
    }

    pub fn pass(&self, index: u32) -> Option<&PassPipeline> {
        self.passes.iter().find(|p| p.index == index)
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Encode one pass. Every referenced resource must be live in `resources`.
    pub fn dispatch_pass(
        &self,
        index: u32,
        resources: &ResourceManager,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<(), EffectError> {
        let pass = self
            .pass(index)
            .ok_or_else(|| EffectError::Resource(format!("no pipeline built for PASS_{}", index)))?;
        let missing = |name: &str| {
            EffectError::Resource(format!("PASS_{}: resource '{}' not found", index, name))
        };

        let mut entries = Vec::with_capacity(pass.resources.len());
        for res in &pass.resources {
            let resource = match res.kind {
                BindingKind::Sampler { .. } => wgpu::BindingResource::Sampler(
                    resources.get_sampler(&res.name).ok_or_else(|| missing(&res.name))?,
                ),
                BindingKind::Uniform => resources
                    .get_uniform(&res.name)
                    .ok_or_else(|| missing(&res.name))?
                    .as_entire_binding(),
                BindingKind::SampledTexture { .. } | BindingKind::StorageTexture { .. } => {
                    wgpu::BindingResource::TextureView(
                        &resources.get_texture(&res.name).ok_or_else(|| missing(&res.name))?.view,
                    )
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: res.binding,
                resource,
            });
        }

        let label = format!("PASS_{}", index);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&label),
            layout: &pass.bind_group_layout,
            entries: &entries,
        });

        let output = resources
            .get_texture(&pass.primary_output)
            .ok_or_else(|| missing(&pass.primary_output))?;
        let [x, y, z] = dispatch_counts(output.size(), pass.num_threads);

        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&label),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&pass.pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(x, y, z);
        }
        tracing::debug!("Dispatched {} with {}x{}x{} workgroups", label, x, y, z);
        Ok(())
    }

    /// Forget every pipeline. The device owns the underlying objects.
    pub fn dispose(&mut self) {
        self.passes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shade_core::TextureFormat;

    #[test]
    fn test_dispatch_counts() {
        assert_eq!(dispatch_counts([1920, 1080], [8, 8, 1]), [240, 135, 1]);
        assert_eq!(dispatch_counts([1921, 1], [16, 16, 1]), [121, 1, 1]);
        assert_eq!(dispatch_counts([7, 7], [8, 8, 1]), [1, 1, 1]);
    }

    #[test]
    fn test_layout_entries_mirror_bindings() {
        let resources = vec![
            ResourceBinding {
                binding: 0,
                name: "default_sampler".to_string(),
                kind: BindingKind::Sampler {
                    filter: FilterMode::Linear,
                },
            },
            ResourceBinding {
                binding: 2,
                name: "scene".to_string(),
                kind: BindingKind::Uniform,
            },
            ResourceBinding {
                binding: 3,
                name: "INPUT".to_string(),
                kind: BindingKind::SampledTexture { format: None },
            },
            ResourceBinding {
                binding: 4,
                name: "depth".to_string(),
                kind: BindingKind::SampledTexture {
                    format: Some(TextureFormat::R32Float),
                },
            },
            ResourceBinding {
                binding: 5,
                name: "OUTPUT".to_string(),
                kind: BindingKind::StorageTexture {
                    format: TextureFormat::Rgba8Unorm,
                },
            },
            ResourceBinding {
                binding: 6,
                name: "sam".to_string(),
                kind: BindingKind::Sampler {
                    filter: FilterMode::Point,
                },
            },
        ];
        let entries = layout_entries(&resources, |name| {
            (name == "INPUT").then_some(wgpu::TextureFormat::Rgba16Float)
        });

        let bindings: Vec<u32> = entries.iter().map(|e| e.binding).collect();
        assert_eq!(bindings, vec![0, 2, 3, 4, 5, 6]);
        assert!(entries.iter().all(|e| e.visibility == wgpu::ShaderStages::COMPUTE));

        match entries[0].ty {
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering) => {}
            other => panic!("Expected filtering sampler, got: {:?}", other),
        }
        match entries[1].ty {
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                ..
            } => {}
            other => panic!("Expected uniform buffer, got: {:?}", other),
        }
        match entries[2].ty {
            wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                ..
            } => {}
            other => panic!("Expected filterable texture, got: {:?}", other),
        }
        match entries[3].ty {
            wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                ..
            } => {}
            other => panic!("Expected unfilterable texture, got: {:?}", other),
        }
        match entries[4].ty {
            wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: wgpu::TextureFormat::Rgba8Unorm,
                ..
            } => {}
            other => panic!("Expected write-only storage texture, got: {:?}", other),
        }
        match entries[5].ty {
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering) => {}
            other => panic!("Expected non-filtering sampler, got: {:?}", other),
        }
    }
}
