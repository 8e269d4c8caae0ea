//! wgpu runtime for shade effects.

use std::sync::Arc;

pub mod config;
pub mod effect;
pub mod error;
pub mod pipeline;
pub mod resources;

pub use config::{ExternalResources, TextureDescriptor};
pub use effect::{Effect, EffectState};
pub use error::EffectError;
pub use pipeline::{dispatch_counts, PipelineManager};
pub use resources::{ResourceManager, UniformValue};

/// Request a headless adapter and device for compute work.
///
/// Returns `None` when no adapter is available.
pub async fn request_device() -> Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await?;

    let info = adapter.get_info();
    tracing::info!("GPU adapter: {} ({:?})", info.name, info.backend);

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("shade device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        )
        .await
        .map_err(|e| tracing::error!("Failed to create device: {}", e))
        .ok()?;
    Some((Arc::new(device), Arc::new(queue)))
}
