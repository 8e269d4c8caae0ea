//! A compiled effect: parse, generate, allocate, build, then dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use shade_core::ir::Parameter;
use shade_core::{ShaderIr, OUTPUT};

use crate::config::ExternalResources;
use crate::error::EffectError;
use crate::pipeline::PipelineManager;
use crate::resources::{ResourceManager, UniformValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectState {
    Uncompiled,
    Compiling,
    Ready,
}

pub struct Effect {
    state: EffectState,
    ir: Option<ShaderIr>,
    resources: ResourceManager,
    pipelines: PipelineManager,
}

impl Effect {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            state: EffectState::Uncompiled,
            ir: None,
            resources: ResourceManager::new(device.clone(), queue),
            pipelines: PipelineManager::new(device),
        }
    }

    /// Directory that `SOURCE` texture paths are relative to.
    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.resources.set_asset_root(root);
        self
    }

    /// Compile `source` from scratch, replacing whatever was compiled before.
    /// On failure the effect is left `Uncompiled` with nothing allocated.
    pub async fn compile(&mut self, source: &str, external: &ExternalResources) -> Result<(), EffectError> {
        self.state = EffectState::Compiling;
        match self.build(source, external).await {
            Ok(ir) => {
                tracing::info!("Compiled effect with {} passes", ir.passes.len());
                self.ir = Some(ir);
                self.state = EffectState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Effect compile failed: {}", e);
                self.reset();
                Err(e)
            }
        }
    }

    async fn build(
        &mut self,
        source: &str,
        external: &ExternalResources,
    ) -> Result<ShaderIr, EffectError> {
        let ir = shade_core::parse(source)?;
        let modules = shade_core::generate(&ir)?;
        self.resources.initialize(&ir, external)?;
        self.pipelines.create_pipelines(&ir, &modules, &self.resources).await?;
        Ok(ir)
    }

    fn reset(&mut self) {
        self.pipelines.dispose();
        self.resources.dispose();
        self.ir = None;
        self.state = EffectState::Uncompiled;
    }

    fn ready_ir(&self, operation: &str) -> Result<&ShaderIr, EffectError> {
        match (&self.ir, self.state) {
            (Some(ir), EffectState::Ready) => Ok(ir),
            (_, state) => Err(EffectError::State(format!(
                "{} requires a compiled effect, but the effect is {:?}",
                operation, state
            ))),
        }
    }

    /// Encode the pass named `PASS_{index}`.
    pub fn dispatch_pass(&self, name: &str, encoder: &mut wgpu::CommandEncoder) -> Result<(), EffectError> {
        let ir = self.ready_ir("dispatch_pass")?;
        let pass = ir
            .pass_by_name(name)
            .ok_or_else(|| EffectError::Resource(format!("unknown pass '{}'", name)))?;
        self.pipelines.dispatch_pass(pass.index, &self.resources, encoder)
    }

    /// Encode every pass in ascending index order.
    pub fn dispatch_all(&self, encoder: &mut wgpu::CommandEncoder) -> Result<(), EffectError> {
        let ir = self.ready_ir("dispatch_all")?;
        for pass in &ir.passes {
            self.pipelines.dispatch_pass(pass.index, &self.resources, encoder)?;
        }
        Ok(())
    }

    pub fn update_uniform(&mut self, name: &str, value: impl Into<UniformValue>) -> Result<(), EffectError> {
        self.ready_ir("update_uniform")?;
        self.resources.update_uniform(name, &value.into())
    }

    pub fn update_texture_from_image(&mut self, name: &str, image: &image::DynamicImage) -> Result<(), EffectError> {
        self.ready_ir("update_texture_from_image")?;
        self.resources.update_texture_from_image(name, image)
    }

    pub fn output_view(&self) -> Result<&wgpu::TextureView, EffectError> {
        self.ready_ir("output_view")?;
        self.resources
            .get_texture(OUTPUT)
            .map(|t| &t.view)
            .ok_or_else(|| EffectError::Resource("OUTPUT texture not allocated".to_string()))
    }

    /// Read `OUTPUT` back as RGBA8.
    pub fn read_output(&self) -> Result<image::RgbaImage, EffectError> {
        self.ready_ir("read_output")?;
        self.resources.read_texture_rgba8(OUTPUT)
    }

    pub fn state(&self) -> EffectState {
        self.state
    }

    pub fn ir(&self) -> Option<&ShaderIr> {
        self.ir.as_ref()
    }

    pub fn parameters(&self) -> &[Parameter] {
        match &self.ir {
            Some(ir) => &ir.parameters,
            None => &[],
        }
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn pipelines(&self) -> &PipelineManager {
        &self.pipelines
    }
}
