//! Per-pixel distance field rendering on the GPU.
//!
//! An ink image (black pixels on any background) is turned into a grayscale
//! field where each non-ink pixel's brightness encodes its distance to the
//! nearest ink, normalized by a configurable spread. The fragment program is
//! assembled from a structured list of input declarations, inputs bind as
//! uniform buffers or textures, and draws land on an offscreen canvas or on
//! any texture input.

pub mod error;
pub mod gpu;
pub mod kernel;
pub mod loader;
pub mod pipeline;
pub mod source;
pub mod value;

pub use error::{PipelineError, PipelineResult};
pub use gpu::GpuContext;
pub use pipeline::{Config, Pipeline, PixelBuffer, Readback, RenderTarget};
pub use value::{ImageRef, InputValue};
