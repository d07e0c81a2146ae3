//! Backend abstraction layer
//!
//! Provides the [`GraphicsBackend`] trait and the types both backends share.

pub mod recording;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use recording::RecordingBackend;
pub use traits::*;
pub use types::*;
pub use wgpu_backend::WgpuBackend;
