//! Marshalling work onto the GPU thread

use std::sync::mpsc;
use std::thread::{self, ThreadId};

use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};

/// Work queued for the GPU thread
pub type GpuTask<B> = Box<dyn FnOnce(&mut RenderContext<B>) + Send>;

/// Single-consumer end of the GPU task queue
///
/// Owned by the [`RenderContext`] and drained on the thread that created it.
pub struct GpuTaskQueue<B> {
    receiver: mpsc::Receiver<GpuTask<B>>,
    sender: mpsc::Sender<GpuTask<B>>,
    gpu_thread: ThreadId,
}

impl<B> GpuTaskQueue<B> {
    /// Queue consumed by the calling thread
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            receiver,
            sender,
            gpu_thread: thread::current().id(),
        }
    }

    pub fn sender(&self) -> GpuTaskSender<B> {
        GpuTaskSender {
            sender: self.sender.clone(),
            gpu_thread: self.gpu_thread,
        }
    }

    pub fn gpu_thread(&self) -> ThreadId {
        self.gpu_thread
    }

    /// Next queued task without blocking
    pub fn try_next(&self) -> Option<GpuTask<B>> {
        self.receiver.try_recv().ok()
    }
}

impl<B> Default for GpuTaskQueue<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer handle for the GPU task queue, usable from any thread
pub struct GpuTaskSender<B> {
    sender: mpsc::Sender<GpuTask<B>>,
    gpu_thread: ThreadId,
}

impl<B> Clone for GpuTaskSender<B> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            gpu_thread: self.gpu_thread,
        }
    }
}

impl<B: 'static> GpuTaskSender<B> {
    /// Queue `task` and return immediately
    pub fn execute(
        &self,
        task: impl FnOnce(&mut RenderContext<B>) + Send + 'static,
    ) -> RenderResult<()> {
        self.sender
            .send(Box::new(task))
            .map_err(|_| RenderError::TaskQueueClosed)
    }

    /// Queue `task` and block until the GPU thread has run it.
    ///
    /// Fails with [`RenderError::WouldDeadlock`] when called from the GPU thread,
    /// which would otherwise wait on itself.
    pub fn execute_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut RenderContext<B>) -> R + Send + 'static,
    ) -> RenderResult<R> {
        if thread::current().id() == self.gpu_thread {
            return Err(RenderError::WouldDeadlock);
        }
        let (result_sender, result_receiver) = mpsc::sync_channel(1);
        self.execute(move |ctx| {
            // The waiter may have given up; nothing to report then
            let _ = result_sender.send(task(ctx));
        })?;
        result_receiver.recv().map_err(|_| RenderError::TaskQueueClosed)
    }
}
