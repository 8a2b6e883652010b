//! Headless GPU bootstrap: instance, adapter, device, queue.

use crate::error::{PipelineError, PipelineResult};

pub const NO_ADAPTER: &str = "no suitable gpu adapter found";

/// Device handles shared by every pipeline.
pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Acquire a headless device, preferring a hardware adapter and falling
    /// back to a software one.
    pub fn new() -> PipelineResult<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> PipelineResult<Self> {
        let instance = wgpu::Instance::default();
        let adapter = match instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
        {
            Ok(adapter) => adapter,
            Err(_) => instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::LowPower,
                    compatible_surface: None,
                    force_fallback_adapter: true,
                })
                .await
                .map_err(|e| PipelineError::Gpu(format!("{NO_ADAPTER}: {e}")))?,
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("sdfgen device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::default(),
            })
            .await
            .map_err(|e| PipelineError::Gpu(format!("request_device failed: {e}")))?;

        Ok(GpuContext {
            adapter,
            device,
            queue,
        })
    }

    /// Whether the adapter can render into `Rgba32Float` targets. Software
    /// fallback adapters often cannot.
    pub fn supports_float_targets(&self) -> bool {
        self.adapter
            .get_texture_format_features(wgpu::TextureFormat::Rgba32Float)
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
    }
}
