//! Frame state extraction and the threads it crosses
//!
//! The simulation thread extracts a [`RenderState`] every cycle and offers it
//! through a [`FrameProducer`]. The render thread picks it up with a
//! [`FrameConsumer`], draws it and calls `finish`. Work that must run on the GPU
//! thread travels through a [`GpuTaskSender`].

mod handoff;
mod state;
mod tasks;

pub use handoff::{FrameConsumer, FrameHandoff, FrameProducer, TripleBuffer};
pub use state::RenderState;
pub use tasks::{GpuTask, GpuTaskQueue, GpuTaskSender};
