//! Assembly of the WGSL program module from a structured declaration list.
//!
//! Input declarations are never discovered by scanning shader text; they live
//! in an ordered list keyed by name, and `render` splices them into the module
//! template at a well-known marker. Binding locations are a pure function of
//! declaration order: group 0 holds the globals block, group 1 one uniform
//! variable per non-texture input, group 2 texture/sampler pairs with
//! `u_image` fixed at bindings 0 and 1.

use crate::error::{PipelineError, PipelineResult};
use crate::value::{array_slot_count, InputKind};

/// Marker at which input declarations are spliced into the module.
pub const INPUTS_MARKER: &str = "/*__inputs__*/";

/// Name of the primary source texture, bound by the module header itself.
pub const PRIMARY_TEXTURE: &str = "u_image";

/// Globals block and primary texture bindings shared by every module.
pub const MODULE_HEADER: &str = r#"struct Globals {
    resolution: vec2f,
    texture_size: vec2f,
    flip_y: f32,
    _pad0: f32,
    _pad1: vec2f,
};

@group(0) @binding(0) var<uniform> globals: Globals;

@group(2) @binding(0) var u_image: texture_2d<f32>;
@group(2) @binding(1) var u_image_sampler: sampler;
"#;

/// Vertex stage shared by every program: pixel-space positions to clip space,
/// with the vertical flip sign taken from the globals block.
pub const DEFAULT_VERTEX_STAGE: &str = r#"struct VertexOutput {
    @builtin(position) position: vec4f,
    @location(0) tex_coord: vec2f,
};

@vertex
fn vs_main(@location(0) position: vec2f, @location(1) tex_coord: vec2f) -> VertexOutput {
    let zero_to_one = position / globals.resolution;
    let clip = zero_to_one * 2.0 - vec2f(1.0, 1.0);
    var out: VertexOutput;
    out.position = vec4f(clip * vec2f(1.0, globals.flip_y), 0.0, 1.0);
    out.tex_coord = tex_coord;
    return out;
}
"#;

/// Fragment stage used when the caller supplies none: sample the primary
/// texture unchanged.
pub const DEFAULT_FRAGMENT_STAGE: &str = r#"@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4f {
    return textureSampleLevel(u_image, u_image_sampler, in.tex_coord, 0.0);
}
"#;

#[derive(Debug, Clone)]
struct Declaration {
    name: String,
    kind: InputKind,
    /// Bound by the module header rather than the spliced block.
    builtin: bool,
}

/// Ordered input declarations plus the module template they render into.
pub struct ProgramSource {
    template: String,
    decls: Vec<Declaration>,
}

impl ProgramSource {
    /// Build a program from optional custom stage bodies. Stage bodies see the
    /// globals block, `u_image` and every declared input.
    pub fn new(vertex_stage: Option<&str>, fragment_stage: Option<&str>) -> Self {
        let template = format!(
            "{}\n{}\n\n{}\n{}",
            MODULE_HEADER,
            INPUTS_MARKER,
            vertex_stage.unwrap_or(DEFAULT_VERTEX_STAGE),
            fragment_stage.unwrap_or(DEFAULT_FRAGMENT_STAGE),
        );
        let decls = vec![Declaration {
            name: PRIMARY_TEXTURE.to_string(),
            kind: InputKind::Texture,
            builtin: true,
        }];
        ProgramSource { template, decls }
    }

    /// Declare an input. Returns `Ok(true)` if the declaration is new,
    /// `Ok(false)` if an identical declaration already exists; a second
    /// declaration under the same name with a different kind is a conflict.
    pub fn declare(&mut self, name: &str, kind: InputKind) -> PipelineResult<bool> {
        if let Some(existing) = self.decls.iter().find(|d| d.name == name) {
            if existing.kind == kind {
                return Ok(false);
            }
            return Err(PipelineError::TypeConflict {
                name: name.to_string(),
                detail: format!(
                    "already declared as {:?}, cannot redeclare as {:?}",
                    existing.kind, kind
                ),
            });
        }
        self.decls.push(Declaration {
            name: name.to_string(),
            kind,
            builtin: false,
        });
        Ok(true)
    }

    pub fn kind_of(&self, name: &str) -> Option<InputKind> {
        self.decls.iter().find(|d| d.name == name).map(|d| d.kind)
    }

    /// Group-1 binding index of a non-texture input.
    pub fn uniform_binding(&self, name: &str) -> Option<u32> {
        self.decls
            .iter()
            .filter(|d| !d.kind.is_texture())
            .position(|d| d.name == name)
            .map(|i| i as u32)
    }

    /// Sampling unit of a texture input; `u_image` is unit 0. The unit maps
    /// to group-2 bindings `(2 * unit, 2 * unit + 1)`.
    pub fn texture_unit(&self, name: &str) -> Option<u32> {
        self.decls
            .iter()
            .filter(|d| d.kind.is_texture())
            .position(|d| d.name == name)
            .map(|i| i as u32)
    }

    /// Non-texture declarations in binding order.
    pub fn uniform_inputs(&self) -> impl Iterator<Item = (&str, InputKind)> {
        self.decls
            .iter()
            .filter(|d| !d.kind.is_texture())
            .map(|d| (d.name.as_str(), d.kind))
    }

    /// Texture declarations in unit order, `u_image` first.
    pub fn texture_inputs(&self) -> impl Iterator<Item = &str> {
        self.decls
            .iter()
            .filter(|d| d.kind.is_texture())
            .map(|d| d.name.as_str())
    }

    /// Render the complete WGSL module. The marker survives in the output so
    /// the rendered source stays recognizable next to its template.
    pub fn render(&self) -> String {
        let mut block = String::new();
        let mut uniform_slot = 0u32;
        let mut texture_unit = 0u32;
        for decl in &self.decls {
            if decl.kind.is_texture() {
                if !decl.builtin {
                    block.push_str(&format!(
                        "@group(2) @binding({}) var {}: texture_2d<f32>;\n",
                        2 * texture_unit,
                        decl.name
                    ));
                    block.push_str(&format!(
                        "@group(2) @binding({}) var {}_sampler: sampler;\n",
                        2 * texture_unit + 1,
                        decl.name
                    ));
                }
                texture_unit += 1;
            } else {
                block.push_str(&format!(
                    "@group(1) @binding({}) var<uniform> {}: {};\n",
                    uniform_slot,
                    decl.name,
                    wgsl_type(decl.kind)
                ));
                uniform_slot += 1;
            }
        }
        block.push_str(INPUTS_MARKER);
        self.template.replacen(INPUTS_MARKER, &block, 1)
    }

    /// Render and parse the module, mapping naga failures to a diagnostic
    /// that includes the numbered generated source.
    pub fn compile(&self) -> PipelineResult<(String, naga::Module)> {
        let source = self.render();
        match naga::front::wgsl::parse_str(&source) {
            Ok(module) => Ok((source, module)),
            Err(err) => Err(PipelineError::CompileLink(format_module_error(
                &source,
                &err.to_string(),
            ))),
        }
    }
}

fn wgsl_type(kind: InputKind) -> String {
    match kind {
        InputKind::Float => "f32".to_string(),
        InputKind::Int => "i32".to_string(),
        InputKind::Vec2 => "vec2f".to_string(),
        InputKind::Vec3 => "vec3f".to_string(),
        InputKind::Vec4 => "vec4f".to_string(),
        InputKind::FloatArray(len) => format!("array<vec4f, {}>", array_slot_count(len)),
        InputKind::Texture => unreachable!("textures render as binding pairs"),
    }
}

/// Attach the numbered generated source to a shader diagnostic.
pub fn format_module_error(source: &str, message: &str) -> String {
    let mut output = String::new();
    output.push_str(&format!("  {}\n", message));
    output.push_str("\nGenerated WGSL:\n---\n");
    for (line_num, line) in source.lines().enumerate() {
        output.push_str(&format!("{:4} | {}\n", line_num + 1, line));
    }
    output.push_str("---\n");
    output
}
