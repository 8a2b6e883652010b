//! Host-side input values and their GPU-input classification.
//!
//! The caller picks the value shape up front via the `InputValue` tagged
//! union; `classify` is then a pure exhaustive match, never runtime type
//! probing. The byte encodings produced here are exactly what the pipeline
//! writes into each input's uniform buffer.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

/// Reference to pixel data that arrives as an image.
#[derive(Clone)]
pub enum ImageRef {
    /// A file path; decoded asynchronously by the loader.
    Path(PathBuf),
    /// An already-decoded image handle.
    Decoded(Arc<image::DynamicImage>),
}

impl std::fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::Path(p) => write!(f, "ImageRef::Path({})", p.display()),
            ImageRef::Decoded(img) => {
                write!(f, "ImageRef::Decoded({}x{})", img.width(), img.height())
            }
        }
    }
}

/// A raw pixel-buffer texture description with optional explicit size.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PixelRecord {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixels: Option<Vec<f32>>,
}

/// One program input's host-side value.
#[derive(Debug, Clone)]
pub enum InputValue {
    Float(f64),
    Int(i64),
    Vector(Vec<f64>),
    Image(ImageRef),
    Pixels(PixelRecord),
}

/// Initial uniform value as it appears in a JSON config.
///
/// Anything that deserializes into none of these shapes is rejected by serde,
/// which is the config-level face of a classification error.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum UniformInit {
    Number(f64),
    Array(Vec<f64>),
    Path(String),
    Pixels(PixelRecord),
}

impl From<UniformInit> for InputValue {
    fn from(init: UniformInit) -> Self {
        match init {
            UniformInit::Number(v) => InputValue::Float(v),
            UniformInit::Array(vs) => InputValue::Vector(vs),
            UniformInit::Path(p) => InputValue::Image(ImageRef::Path(PathBuf::from(p))),
            UniformInit::Pixels(rec) => InputValue::Pixels(rec),
        }
    }
}

/// Declared GPU-input kind of a program input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    Float,
    Int,
    Vec2,
    Vec3,
    Vec4,
    FloatArray(usize),
    Texture,
}

impl InputKind {
    pub fn is_texture(self) -> bool {
        matches!(self, InputKind::Texture)
    }
}

/// Classify a host value into its declared GPU-input kind.
///
/// A 1-element vector is declared `f32` but pushed to the GPU as two
/// components (see [`uniform_bytes`]); that asymmetry is part of the
/// observable contract and must not be "fixed" here.
pub fn classify(value: &InputValue, force_array: bool) -> PipelineResult<InputKind> {
    match value {
        InputValue::Float(_) => Ok(InputKind::Float),
        InputValue::Int(_) => Ok(InputKind::Int),
        InputValue::Vector(vs) => {
            if vs.is_empty() {
                return Err(PipelineError::Classification(
                    "numeric array value must not be empty".to_string(),
                ));
            }
            if force_array || vs.len() > 4 {
                return Ok(InputKind::FloatArray(vs.len()));
            }
            Ok(match vs.len() {
                1 => InputKind::Float,
                2 => InputKind::Vec2,
                3 => InputKind::Vec3,
                _ => InputKind::Vec4,
            })
        }
        InputValue::Image(_) | InputValue::Pixels(_) => Ok(InputKind::Texture),
    }
}

/// Number of 16-byte `vec4f` slots a float array of `len` elements occupies
/// in a uniform buffer.
pub fn array_slot_count(len: usize) -> usize {
    len.div_ceil(4)
}

/// Encode a non-texture value into the exact bytes pushed to its uniform
/// buffer.
///
/// Length-1 vectors emit the value twice (two components) even though they
/// declare as `f32`; arrays are zero-padded to whole `vec4f` slots.
pub fn uniform_bytes(value: &InputValue, force_array: bool) -> PipelineResult<Vec<u8>> {
    match value {
        InputValue::Float(v) => Ok((*v as f32).to_ne_bytes().to_vec()),
        InputValue::Int(v) => Ok((*v as i32).to_ne_bytes().to_vec()),
        InputValue::Vector(vs) => {
            if vs.is_empty() {
                return Err(PipelineError::Classification(
                    "numeric array value must not be empty".to_string(),
                ));
            }
            let mut floats: Vec<f32> = vs.iter().map(|v| *v as f32).collect();
            if force_array || floats.len() > 4 {
                floats.resize(array_slot_count(floats.len()) * 4, 0.0);
            } else if floats.len() == 1 {
                // Pushed as a 2-vector padded with itself.
                floats.push(floats[0]);
            }
            let mut bytes = Vec::with_capacity(floats.len() * 4);
            for v in floats {
                bytes.extend_from_slice(&v.to_ne_bytes());
            }
            Ok(bytes)
        }
        InputValue::Image(_) | InputValue::Pixels(_) => Err(PipelineError::Classification(
            "texture values are uploaded as pixels, not pushed as uniform bytes".to_string(),
        )),
    }
}

/// Resolve the allocation for a pixel-record texture without an explicit
/// size: the smallest square whose RGBA capacity covers the buffer.
///
/// Returns `(side, capacity_in_floats)`; the buffer is right-zero-padded up
/// to the capacity before upload.
pub fn pixel_allocation(len: usize) -> (u32, usize) {
    let side = ((len as f64 / 4.0).sqrt().ceil() as u32).max(1);
    (side, side as usize * side as usize * 4)
}
