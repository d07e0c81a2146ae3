//! Renderer error types

use crate::backend::BackendError;
use thiserror::Error;

/// Errors raised by the render core
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Unknown uniform '{name}' in program '{program}'")]
    UnknownUniform { program: String, name: String },
    #[error("Uniform '{name}' expects {expected} bytes, got {actual}")]
    UniformSizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Shader '{label}' failed to compile: {message}")]
    ShaderCompilation { label: String, message: String },
    #[error("Program '{program}' has nothing bound at binding {binding}")]
    UnboundResource { program: String, binding: u32 },
    #[error("Program '{0}' is not a compute program")]
    NotAComputeProgram(String),
    #[error("Read of {requested} elements at offset {offset} exceeds buffer length {len}")]
    ReadOutOfBounds {
        offset: usize,
        requested: usize,
        len: usize,
    },
    #[error("Render target '{0}' has no attachment named '{1}'")]
    MissingAttachment(String, String),
    #[error("Render target binding stack is empty")]
    NoBoundTarget,
    #[error("GPU task queue is closed")]
    TaskQueueClosed,
    #[error("execute_and_wait called on the GPU thread would deadlock")]
    WouldDeadlock,
    #[error("Texture decode failed: {0}")]
    TextureDecode(String),
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::UnknownUniform {
            program: "combine".into(),
            name: "exposure".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown uniform 'exposure' in program 'combine'"
        );

        let err: RenderError = BackendError::OutOfMemory.into();
        assert_eq!(err.to_string(), "device ran out of memory");
    }
}
