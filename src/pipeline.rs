//! GPU resource management, input binding and the draw/readback loop.
//!
//! One `Pipeline` owns a program (assembled WGSL), a slot per declared input,
//! an offscreen canvas texture and the quad geometry. All GPU objects are
//! created and mutated from the orchestration thread; decode workers only
//! ever talk to it through the loader channel.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc;

use serde::Deserialize;
use wgpu::util::DeviceExt;

use crate::error::{PipelineError, PipelineResult};
use crate::gpu::GpuContext;
use crate::loader::{ImageLoader, ReadinessCoordinator, WatchOutcome};
use crate::source::ProgramSource;
use crate::value::{
    classify, pixel_allocation, uniform_bytes, ImageRef, InputKind, InputValue, PixelRecord,
    UniformInit,
};

pub const DEFAULT_SPREAD: u32 = 10;
const QUAD_VERTICES: u32 = 6;

/// Standard texture coordinates of the two-triangle quad.
const TEX_COORDS: [f32; 12] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl Default for CanvasSize {
    fn default() -> Self {
        CanvasSize {
            width: 512,
            height: 512,
        }
    }
}

/// JSON-facing pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input_image: Option<PathBuf>,
    pub canvas: CanvasSize,
    /// Raw JSON so that lenient coercion can be applied; see [`Config::spread`].
    pub spread: Option<serde_json::Value>,
    pub uniforms: BTreeMap<String, UniformInit>,
    pub float_textures: bool,
    pub vertex_shader: Option<String>,
    pub fragment_shader: Option<String>,
}

impl Config {
    /// Distance spread in texels. Anything that does not coerce to a
    /// positive integer falls back to [`DEFAULT_SPREAD`].
    pub fn spread(&self) -> u32 {
        self.spread
            .as_ref()
            .map(coerce_spread)
            .unwrap_or(DEFAULT_SPREAD)
    }
}

fn coerce_spread(value: &serde_json::Value) -> u32 {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v >= 1.0 => v as u32,
        _ => DEFAULT_SPREAD,
    }
}

/// Where draws land: the canvas texture or a texture input's backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderTarget {
    Canvas,
    Input(String),
}

/// Readback result for the active render target.
pub struct Readback {
    pub width: u32,
    pub height: u32,
    pub pixels: PixelBuffer,
}

pub enum PixelBuffer {
    Float(Vec<f32>),
    Byte(Vec<u8>),
}

impl PixelBuffer {
    /// Convert to 8-bit RGBA, clamping float channels into [0, 1].
    pub fn to_rgba8(&self) -> Vec<u8> {
        match self {
            PixelBuffer::Byte(bytes) => bytes.clone(),
            PixelBuffer::Float(floats) => floats
                .iter()
                .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Globals {
    resolution: [f32; 2],
    texture_size: [f32; 2],
    flip_y: f32,
    _pad0: f32,
    _pad1: [f32; 2],
}

struct TargetTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

enum TextureState {
    /// Declared, decode in flight, GPU objects not yet allocated.
    Loading,
    Ready(TargetTexture),
}

enum Backing {
    Uniform { buffer: wgpu::Buffer },
    Texture(TextureState),
}

struct InputSlot {
    backing: Backing,
}

struct CompiledProgram {
    pipeline: wgpu::RenderPipeline,
    globals_layout: wgpu::BindGroupLayout,
    uniforms_layout: wgpu::BindGroupLayout,
    textures_layout: wgpu::BindGroupLayout,
}

pub struct Pipeline {
    gpu: GpuContext,
    format: wgpu::TextureFormat,
    source: ProgramSource,
    compiled: Option<CompiledProgram>,
    dirty: bool,
    inputs: BTreeMap<String, InputSlot>,
    loader: ImageLoader,
    readiness: ReadinessCoordinator,
    canvas: TargetTexture,
    active_target: RenderTarget,
    globals: Globals,
    globals_buffer: wgpu::Buffer,
    position_buffer: wgpu::Buffer,
    texcoord_buffer: wgpu::Buffer,
    placeholder: TargetTexture,
    sampler: wgpu::Sampler,
}

impl Pipeline {
    pub fn new(gpu: GpuContext, config: &Config) -> PipelineResult<Self> {
        if config.float_textures && !gpu.supports_float_targets() {
            return Err(PipelineError::Gpu(
                "adapter cannot render to Rgba32Float targets; disable float_textures"
                    .to_string(),
            ));
        }
        let format = if config.float_textures {
            wgpu::TextureFormat::Rgba32Float
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };

        let source = ProgramSource::new(
            config.vertex_shader.as_deref(),
            config.fragment_shader.as_deref(),
        );

        let canvas = create_target(
            &gpu.device,
            format,
            config.canvas.width.max(1),
            config.canvas.height.max(1),
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            Some("canvas"),
        );

        let placeholder = create_target(
            &gpu.device,
            format,
            1,
            1,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            Some("placeholder"),
        );
        // Magenta, so an accidentally-sampled placeholder is visible.
        let magenta = texel_bytes(format, &[1.0, 0.0, 1.0, 1.0]);
        write_whole_texture(&gpu.queue, &placeholder, format, &magenta);

        // The primary texture unit is reported at canvas size for the whole
        // pipeline lifetime, whatever the image's natural size turns out to be.
        let globals = Globals {
            resolution: [canvas.width as f32, canvas.height as f32],
            texture_size: [canvas.width as f32, canvas.height as f32],
            flip_y: -1.0,
            _pad0: 0.0,
            _pad1: [0.0; 2],
        };
        let globals_buffer = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("globals"),
                contents: bytemuck::bytes_of(&globals),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });

        let position_buffer = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("quad positions"),
                contents: bytemuck::cast_slice(&[0.0f32; 12]),
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            });
        let texcoord_buffer = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("quad texcoords"),
                contents: bytemuck::cast_slice(&TEX_COORDS),
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            });

        let sampler = gpu.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("input sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let mut pipeline = Pipeline {
            gpu,
            format,
            source,
            compiled: None,
            dirty: false,
            inputs: BTreeMap::new(),
            loader: ImageLoader::new(),
            readiness: ReadinessCoordinator::new(),
            canvas,
            active_target: RenderTarget::Canvas,
            globals,
            globals_buffer,
            position_buffer,
            texcoord_buffer,
            placeholder,
            sampler,
        };

        if let Some(path) = &config.input_image {
            pipeline.set(
                "u_image",
                InputValue::Image(ImageRef::Path(path.clone())),
                false,
            )?;
        }
        for (name, init) in &config.uniforms {
            pipeline.set(name, InputValue::from(init.clone()), false)?;
        }
        pipeline.rebuild()?;
        Ok(pipeline)
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.canvas.width, self.canvas.height)
    }

    /// Set (or create) an input. Creating an input adds its declaration to
    /// the program and marks the program dirty; updating an existing input
    /// with a value of the same kind touches only its GPU resource. Returns
    /// whether the declaration was new (a rebuild is now needed).
    pub fn set(&mut self, name: &str, value: InputValue, force_array: bool) -> PipelineResult<bool> {
        let kind = classify(&value, force_array)?;
        let declared = self.source.declare(name, kind)?;
        if declared {
            self.dirty = true;
        }

        match &value {
            InputValue::Image(ImageRef::Path(path)) => {
                self.readiness.reset(name);
                self.inputs.insert(
                    name.to_string(),
                    InputSlot {
                        backing: Backing::Texture(TextureState::Loading),
                    },
                );
                self.loader.request(name.to_string(), path.clone());
            }
            InputValue::Image(ImageRef::Decoded(img)) => {
                self.install_image(name, img)?;
            }
            InputValue::Pixels(record) => {
                self.install_pixels(name, record)?;
            }
            _ => {
                let bytes = uniform_bytes(&value, force_array)?;
                let has_buffer = matches!(
                    self.inputs.get(name).map(|s| &s.backing),
                    Some(Backing::Uniform { .. })
                );
                if !has_buffer {
                    let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some(name),
                        size: uniform_buffer_size(kind),
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    });
                    self.inputs.insert(
                        name.to_string(),
                        InputSlot {
                            backing: Backing::Uniform { buffer },
                        },
                    );
                }
                if let Some(Backing::Uniform { buffer }) =
                    self.inputs.get(name).map(|s| &s.backing)
                {
                    self.gpu.queue.write_buffer(buffer, 0, &bytes);
                }
            }
        }
        Ok(declared)
    }

    /// Sampling unit of a texture input. The unit is assigned at declaration
    /// and stays stable for the input's lifetime.
    pub fn bind_texture(&self, name: &str) -> PipelineResult<u32> {
        let slot = self
            .inputs
            .get(name)
            .ok_or_else(|| PipelineError::InputNotFound(name.to_string()))?;
        if !matches!(slot.backing, Backing::Texture(_)) {
            return Err(PipelineError::TypeConflict {
                name: name.to_string(),
                detail: "not a texture input".to_string(),
            });
        }
        self.source
            .texture_unit(name)
            .ok_or_else(|| PipelineError::InputNotFound(name.to_string()))
    }

    /// Switch the draw destination. Viewport, resolution uniform and flip
    /// sign are reapplied on every switch: canvas flips vertically, offscreen
    /// targets do not.
    pub fn select_render_target(&mut self, target: RenderTarget) -> PipelineResult<()> {
        let (width, height, flip) = match &target {
            RenderTarget::Canvas => (self.canvas.width, self.canvas.height, -1.0),
            RenderTarget::Input(name) => {
                let slot = self
                    .inputs
                    .get(name)
                    .ok_or_else(|| PipelineError::InputNotFound(name.clone()))?;
                match &slot.backing {
                    Backing::Texture(TextureState::Ready(t)) => (t.width, t.height, 1.0),
                    Backing::Texture(TextureState::Loading) => {
                        return Err(PipelineError::ResourceLoad {
                            name: name.clone(),
                            detail: "texture has not finished loading".to_string(),
                        });
                    }
                    Backing::Uniform { .. } => {
                        return Err(PipelineError::TypeConflict {
                            name: name.clone(),
                            detail: "not a texture input, cannot be a render target".to_string(),
                        });
                    }
                }
            }
        };
        self.active_target = target;
        self.globals.resolution = [width as f32, height as f32];
        self.globals.flip_y = flip;
        self.write_globals();
        Ok(())
    }

    /// Update the quad geometry in target pixel coordinates.
    pub fn set_rectangle(&mut self, x: f32, y: f32, width: f32, height: f32) {
        let positions = quad_positions(x, y, width, height);
        self.gpu
            .queue
            .write_buffer(&self.position_buffer, 0, bytemuck::cast_slice(&positions));
    }

    /// Recompile the program from its current declarations. On failure the
    /// program is left uncompiled and the diagnostic (with numbered source)
    /// is printed.
    pub fn rebuild(&mut self) -> PipelineResult<()> {
        let (source_text, _module) = match self.source.compile() {
            Ok(ok) => ok,
            Err(err) => {
                eprintln!("{err}");
                self.compiled = None;
                return Err(err);
            }
        };

        let device = &self.gpu.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("program"),
            source: wgpu::ShaderSource::Wgsl(source_text.into()),
        });

        let globals_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("globals layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let uniform_entries: Vec<wgpu::BindGroupLayoutEntry> = self
            .source
            .uniform_inputs()
            .enumerate()
            .map(|(i, _)| wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let uniforms_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("input uniforms layout"),
            entries: &uniform_entries,
        });

        let mut texture_entries = Vec::new();
        for (unit, _) in self.source.texture_inputs().enumerate() {
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: (2 * unit) as u32,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: (2 * unit + 1) as u32,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                count: None,
            });
        }
        let textures_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("input textures layout"),
            entries: &texture_entries,
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("program layout"),
            bind_group_layouts: &[&globals_layout, &uniforms_layout, &textures_layout],
            push_constant_ranges: &[],
        });

        let position_attrs = wgpu::vertex_attr_array![0 => Float32x2];
        let texcoord_attrs = wgpu::vertex_attr_array![1 => Float32x2];
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("program pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[
                    wgpu::VertexBufferLayout {
                        array_stride: 8,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &position_attrs,
                    },
                    wgpu::VertexBufferLayout {
                        array_stride: 8,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &texcoord_attrs,
                    },
                ],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        self.compiled = Some(CompiledProgram {
            pipeline,
            globals_layout,
            uniforms_layout,
            textures_layout,
        });
        self.dirty = false;
        Ok(())
    }

    /// Draw the quad with the current program and bindings into the active
    /// target. While an input's texture is itself the active target, its
    /// sampler binding is substituted with the placeholder texture.
    pub fn draw(&mut self) -> PipelineResult<()> {
        if self.dirty {
            return Err(PipelineError::CompileLink(
                "input declarations changed since the last rebuild; call rebuild() first"
                    .to_string(),
            ));
        }
        let compiled = self.compiled.as_ref().ok_or_else(|| {
            PipelineError::CompileLink("program is not compiled".to_string())
        })?;
        let device = &self.gpu.device;

        let globals_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("globals"),
            layout: &compiled.globals_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: self.globals_buffer.as_entire_binding(),
            }],
        });

        let mut uniform_entries = Vec::new();
        for (i, (name, _)) in self.source.uniform_inputs().enumerate() {
            let slot = self
                .inputs
                .get(name)
                .ok_or_else(|| PipelineError::InputNotFound(name.to_string()))?;
            let Backing::Uniform { buffer } = &slot.backing else {
                return Err(PipelineError::TypeConflict {
                    name: name.to_string(),
                    detail: "declared as a uniform but backed by a texture".to_string(),
                });
            };
            uniform_entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        let uniforms_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("input uniforms"),
            layout: &compiled.uniforms_layout,
            entries: &uniform_entries,
        });

        let mut texture_entries = Vec::new();
        for (unit, name) in self.source.texture_inputs().enumerate() {
            let is_active_target =
                matches!(&self.active_target, RenderTarget::Input(t) if t == name);
            let view = match self.inputs.get(name).map(|s| &s.backing) {
                Some(Backing::Texture(TextureState::Ready(t))) if !is_active_target => &t.view,
                _ => &self.placeholder.view,
            };
            texture_entries.push(wgpu::BindGroupEntry {
                binding: (2 * unit) as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
            texture_entries.push(wgpu::BindGroupEntry {
                binding: (2 * unit + 1) as u32,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            });
        }
        let textures_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("input textures"),
            layout: &compiled.textures_layout,
            entries: &texture_entries,
        });

        let target_view = self.target_view()?;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("draw"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("quad pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &globals_group, &[]);
            pass.set_bind_group(1, &uniforms_group, &[]);
            pass.set_bind_group(2, &textures_group, &[]);
            pass.set_vertex_buffer(0, self.position_buffer.slice(..));
            pass.set_vertex_buffer(1, self.texcoord_buffer.slice(..));
            pass.draw(0..QUAD_VERTICES, 0..1);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Clear the active target to a constant color.
    pub fn clear(&mut self, color: [f64; 4]) -> PipelineResult<()> {
        let target_view = self.target_view()?;
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("clear"),
            });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target_view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: color[0],
                        g: color[1],
                        b: color[2],
                        a: color[3],
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Read the whole active target back to host memory.
    pub fn readback(&self) -> PipelineResult<Readback> {
        let (_, width, height) = self.resolve_target(None)?;
        self.readback_area(0, 0, width, height, None)
    }

    /// Read a rectangle of a target back to host memory. `target` names a
    /// texture input, or `None` for the currently selected target.
    pub fn readback_area(
        &self,
        left: u32,
        top: u32,
        width: u32,
        height: u32,
        target: Option<&str>,
    ) -> PipelineResult<Readback> {
        let (texture, full_width, full_height) = self.resolve_target(target)?;
        if width == 0
            || height == 0
            || left.checked_add(width).map_or(true, |r| r > full_width)
            || top.checked_add(height).map_or(true, |b| b > full_height)
        {
            return Err(PipelineError::Gpu(format!(
                "readback rectangle {width}x{height}+{left}+{top} exceeds target {full_width}x{full_height}"
            )));
        }
        let bytes_per_pixel = bytes_per_texel(self.format);
        let unpadded = width * bytes_per_pixel;
        let padded = align_to(unpadded, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (padded * height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: left,
                    y: top,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.gpu.device.poll(wgpu::PollType::wait_indefinitely());
        rx.recv()
            .map_err(|e| PipelineError::Gpu(format!("readback channel closed: {e}")))?
            .map_err(|e| PipelineError::Gpu(format!("readback map failed: {e:?}")))?;

        let mapped = slice.get_mapped_range();
        let mut tight = Vec::with_capacity((unpadded * height) as usize);
        for row in 0..height as usize {
            let start = row * padded as usize;
            tight.extend_from_slice(&mapped[start..start + unpadded as usize]);
        }
        drop(mapped);
        buffer.unmap();

        let pixels = match self.format {
            wgpu::TextureFormat::Rgba32Float => {
                PixelBuffer::Float(bytemuck::cast_slice(&tight).to_vec())
            }
            _ => PixelBuffer::Byte(tight),
        };
        Ok(Readback {
            width,
            height,
            pixels,
        })
    }

    /// Block until every texture input has decoded and uploaded. A decode
    /// failure is fatal for the wait.
    pub fn wait_until_loaded(&mut self) -> PipelineResult<()> {
        let names: Vec<String> = self
            .inputs
            .iter()
            .filter(|(_, slot)| matches!(slot.backing, Backing::Texture(_)))
            .map(|(name, _)| name.clone())
            .collect();
        self.wait_for(names)
    }

    /// Block until the named inputs are ready. Non-texture inputs have no
    /// load step and count as ready, so a list of plain uniforms (or an
    /// empty list) returns synchronously.
    pub fn wait_for(&mut self, names: Vec<String>) -> PipelineResult<()> {
        let mut textures = Vec::new();
        for name in names {
            let slot = self
                .inputs
                .get(&name)
                .ok_or_else(|| PipelineError::InputNotFound(name.clone()))?;
            if matches!(slot.backing, Backing::Texture(_)) {
                textures.push(name);
            }
        }
        let key = match self.readiness.watch(textures) {
            WatchOutcome::AlreadyReady(_) => return Ok(()),
            WatchOutcome::Pending(key) => key,
        };

        loop {
            let completion = self.loader.completions().recv().map_err(|e| {
                PipelineError::ResourceLoad {
                    name: "<loader>".to_string(),
                    detail: format!("loader channel closed: {e}"),
                }
            })?;
            let name = completion.name;
            let img = completion
                .result
                .map_err(|detail| PipelineError::ResourceLoad {
                    name: name.clone(),
                    detail,
                })?;
            self.install_image(&name, &img)?;
            if self.readiness.mark_ready(&name).contains(&key) {
                return Ok(());
            }
        }
    }

    fn install_image(&mut self, name: &str, img: &image::DynamicImage) -> PipelineResult<()> {
        let (width, height) = (img.width().max(1), img.height().max(1));
        let data = match self.format {
            wgpu::TextureFormat::Rgba32Float => {
                bytemuck::cast_slice::<f32, u8>(img.to_rgba32f().as_raw()).to_vec()
            }
            _ => img.to_rgba8().into_raw(),
        };
        self.install_texture(name, width, height, Some(&data));
        self.readiness.mark_ready(name);
        Ok(())
    }

    fn install_pixels(&mut self, name: &str, record: &PixelRecord) -> PipelineResult<()> {
        let floats = record.pixels.clone().unwrap_or_default();
        let (width, height, floats) = match (record.width, record.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => {
                let needed = (w * h * 4) as usize;
                if !floats.is_empty() && floats.len() != needed {
                    return Err(PipelineError::ResourceLoad {
                        name: name.to_string(),
                        detail: format!(
                            "pixel buffer holds {} floats, {}x{} needs {}",
                            floats.len(),
                            w,
                            h,
                            needed
                        ),
                    });
                }
                let mut floats = floats;
                floats.resize(needed, 0.0);
                (w, h, floats)
            }
            _ => {
                // No explicit size: smallest square that fits, zero padded.
                let (side, capacity) = pixel_allocation(floats.len().max(1));
                let mut floats = floats;
                floats.resize(capacity, 0.0);
                (side, side, floats)
            }
        };
        let data = match self.format {
            wgpu::TextureFormat::Rgba32Float => bytemuck::cast_slice(&floats).to_vec(),
            _ => floats
                .iter()
                .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect(),
        };
        self.install_texture(name, width, height, Some(&data));
        self.readiness.mark_ready(name);
        Ok(())
    }

    fn install_texture(&mut self, name: &str, width: u32, height: u32, data: Option<&[u8]>) {
        // Same-size updates write into the existing texture; only a size
        // change reallocates.
        if let Some(Backing::Texture(TextureState::Ready(existing))) =
            self.inputs.get(name).map(|s| &s.backing)
        {
            if existing.width == width && existing.height == height {
                if let Some(data) = data {
                    write_whole_texture(&self.gpu.queue, existing, self.format, data);
                }
                return;
            }
        }
        let target = create_target(
            &self.gpu.device,
            self.format,
            width,
            height,
            wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
            Some(name),
        );
        if let Some(data) = data {
            write_whole_texture(&self.gpu.queue, &target, self.format, data);
        }
        self.inputs.insert(
            name.to_string(),
            InputSlot {
                backing: Backing::Texture(TextureState::Ready(target)),
            },
        );
    }

    fn write_globals(&self) {
        self.gpu
            .queue
            .write_buffer(&self.globals_buffer, 0, bytemuck::bytes_of(&self.globals));
    }

    fn target_view(&self) -> PipelineResult<&wgpu::TextureView> {
        match &self.active_target {
            RenderTarget::Canvas => Ok(&self.canvas.view),
            RenderTarget::Input(name) => {
                let slot = self
                    .inputs
                    .get(name)
                    .ok_or_else(|| PipelineError::InputNotFound(name.clone()))?;
                match &slot.backing {
                    Backing::Texture(TextureState::Ready(t)) => Ok(&t.view),
                    _ => Err(PipelineError::ResourceLoad {
                        name: name.clone(),
                        detail: "render target texture is not ready".to_string(),
                    }),
                }
            }
        }
    }

    fn resolve_target(&self, target: Option<&str>) -> PipelineResult<(&wgpu::Texture, u32, u32)> {
        let name = match target {
            Some(name) => name,
            None => match &self.active_target {
                RenderTarget::Canvas => {
                    return Ok((&self.canvas.texture, self.canvas.width, self.canvas.height));
                }
                RenderTarget::Input(name) => name.as_str(),
            },
        };
        let slot = self
            .inputs
            .get(name)
            .ok_or_else(|| PipelineError::InputNotFound(name.to_string()))?;
        match &slot.backing {
            Backing::Texture(TextureState::Ready(t)) => Ok((&t.texture, t.width, t.height)),
            _ => Err(PipelineError::ResourceLoad {
                name: name.to_string(),
                detail: "render target texture is not ready".to_string(),
            }),
        }
    }
}

/// Two-triangle quad covering the rectangle, first triangle
/// (x1,y1)(x2,y1)(x1,y2), second (x1,y2)(x2,y1)(x2,y2).
fn quad_positions(x: f32, y: f32, width: f32, height: f32) -> [f32; 12] {
    let (x1, y1) = (x, y);
    let (x2, y2) = (x + width, y + height);
    [x1, y1, x2, y1, x1, y2, x1, y2, x2, y1, x2, y2]
}

fn uniform_buffer_size(kind: InputKind) -> u64 {
    match kind {
        InputKind::FloatArray(len) => (crate::value::array_slot_count(len) * 16) as u64,
        _ => 16,
    }
}

fn bytes_per_texel(format: wgpu::TextureFormat) -> u32 {
    match format {
        wgpu::TextureFormat::Rgba32Float => 16,
        _ => 4,
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

fn texel_bytes(format: wgpu::TextureFormat, rgba: &[f32; 4]) -> Vec<u8> {
    match format {
        wgpu::TextureFormat::Rgba32Float => bytemuck::cast_slice(rgba).to_vec(),
        _ => rgba
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
    }
}

fn create_target(
    device: &wgpu::Device,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    usage: wgpu::TextureUsages,
    label: Option<&str>,
) -> TargetTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label,
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    TargetTexture {
        texture,
        view,
        width,
        height,
    }
}

fn write_whole_texture(
    queue: &wgpu::Queue,
    target: &TargetTexture,
    format: wgpu::TextureFormat,
    data: &[u8],
) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &target.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(target.width * bytes_per_texel(format)),
            rows_per_image: Some(target.height),
        },
        wgpu::Extent3d {
            width: target.width,
            height: target.height,
            depth_or_array_layers: 1,
        },
    );
}
