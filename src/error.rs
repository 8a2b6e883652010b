//! Error taxonomy for the pipeline core.
//!
//! Every error here is local, synchronous and non-recoverable at the point of
//! detection; retries are the caller's business.

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug)]
pub enum PipelineError {
    /// A host value's shape cannot be mapped to a GPU-input kind.
    Classification(String),
    /// An input was used in a way inconsistent with its declared kind.
    TypeConflict { name: String, detail: String },
    /// Shader source failed to parse or validate; the program is unusable.
    CompileLink(String),
    /// An image failed to decode; fatal for this pipeline instance.
    ResourceLoad { name: String, detail: String },
    /// A named input does not exist in the binding store.
    InputNotFound(String),
    /// A GPU-side operation failed (device loss, mapping failure, ...).
    Gpu(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Classification(msg) => write!(f, "classification error: {msg}"),
            PipelineError::TypeConflict { name, detail } => {
                write!(f, "type conflict on input '{name}': {detail}")
            }
            PipelineError::CompileLink(msg) => write!(f, "shader compile/link failed: {msg}"),
            PipelineError::ResourceLoad { name, detail } => {
                write!(f, "resource load failed for '{name}': {detail}")
            }
            PipelineError::InputNotFound(name) => write!(f, "input '{name}' does not exist"),
            PipelineError::Gpu(msg) => write!(f, "gpu error: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_input_name() {
        let err = PipelineError::TypeConflict {
            name: "u_mask".to_string(),
            detail: "expected texture".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("u_mask"));
        assert!(msg.contains("expected texture"));
    }
}
