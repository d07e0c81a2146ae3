//! The injected owner of all GPU state
//!
//! A [`RenderContext`] is built once at startup and passed by reference to
//! everything that issues GPU calls. It is `!Send`: the only way to reach the GPU
//! from another thread is a [`GpuTaskSender`].

use std::marker::PhantomData;

use crate::backend::{GraphicsBackend, RenderPassDescriptor};
use crate::error::RenderResult;
use crate::frame::{GpuTaskQueue, GpuTaskSender};
use crate::resources::TargetStack;
use crate::RenderConfig;

pub struct RenderContext<B> {
    backend: B,
    config: RenderConfig,
    frame_index: u64,
    targets: TargetStack,
    tasks: GpuTaskQueue<B>,
    _not_send: PhantomData<*const ()>,
}

impl<B: GraphicsBackend + 'static> RenderContext<B> {
    pub fn new(backend: B, config: RenderConfig) -> Self {
        log::info!(
            "Render context on '{}' backend, {}x{}",
            backend.name(),
            config.width,
            config.height
        );
        Self {
            backend,
            config,
            frame_index: 0,
            targets: TargetStack::new(),
            tasks: GpuTaskQueue::new(),
            _not_send: PhantomData,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Handle for queueing work on this context from other threads
    pub fn task_sender(&self) -> GpuTaskSender<B> {
        self.tasks.sender()
    }

    /// Run every queued task. Returns how many ran.
    pub fn run_gpu_tasks(&mut self) -> usize {
        let mut executed = 0;
        while let Some(task) = self.tasks.try_next() {
            task(self);
            executed += 1;
        }
        if executed > 0 {
            log::trace!("Ran {executed} GPU tasks");
        }
        executed
    }

    /// Bind a target and start its pass, suspending the current one
    pub fn use_target(&mut self, desc: RenderPassDescriptor) {
        self.targets.push(&mut self.backend, desc);
    }

    /// End the current pass and go back to the previous target
    pub fn unuse_target(&mut self) -> RenderResult<()> {
        self.targets.pop(&mut self.backend)
    }

    pub fn target_depth(&self) -> usize {
        self.targets.depth()
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.config.width, self.config.height) {
            return;
        }
        log::info!("Resizing render context to {width}x{height}");
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.backend.resize(self.config.width, self.config.height);
    }

    /// Count a finished frame
    pub fn end_frame(&mut self) {
        self.frame_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingBackend;
    use crate::error::RenderError;

    fn context() -> RenderContext<RecordingBackend> {
        RenderContext::new(RecordingBackend::new(64, 64), RenderConfig::default())
    }

    #[test]
    fn test_fire_and_forget_runs_on_drain() {
        let mut ctx = context();
        let sender = ctx.task_sender();
        sender.execute(|ctx| ctx.resize(32, 16)).unwrap();
        assert_eq!(ctx.config().width, 1280);
        assert_eq!(ctx.run_gpu_tasks(), 1);
        assert_eq!((ctx.config().width, ctx.config().height), (32, 16));
    }

    #[test]
    fn test_execute_and_wait_from_gpu_thread_fails() {
        let ctx = context();
        let result = ctx.task_sender().execute_and_wait(|ctx| ctx.frame_index());
        assert!(matches!(result, Err(RenderError::WouldDeadlock)));
    }

    #[test]
    fn test_execute_and_wait_from_worker() {
        let mut ctx = context();
        let sender = ctx.task_sender();
        let worker = std::thread::spawn(move || sender.execute_and_wait(|ctx| ctx.backend().name()));
        while !worker.is_finished() {
            ctx.run_gpu_tasks();
            std::thread::yield_now();
        }
        assert_eq!(worker.join().unwrap().unwrap(), "Recording Backend");
    }
}
