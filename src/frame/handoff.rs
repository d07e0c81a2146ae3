//! Render-state hand-off between the simulation and render threads

use std::sync::Arc;

use parking_lot::Mutex;

struct Slots<T> {
    ready: T,
    fresh: bool,
    published: u64,
    finished: u64,
}

/// Three rotating values shared by one writer and one reader
///
/// The writer holds the write slot, the reader holds the read slot and the ready
/// slot sits behind a single mutex. Publishing swaps write and ready; acquiring
/// swaps ready and read. Nothing is copied and no slot is ever touched by both
/// threads at once.
pub struct TripleBuffer<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T> Clone for TripleBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T: Default> Default for TripleBuffer<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> TripleBuffer<T> {
    pub fn new(ready: T) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                ready,
                fresh: false,
                published: 0,
                finished: 0,
            })),
        }
    }

    /// Swap `write` into the ready slot. Returns the publish number.
    pub fn publish(&self, write: &mut T) -> u64 {
        let mut slots = self.slots.lock();
        std::mem::swap(write, &mut slots.ready);
        slots.fresh = true;
        slots.published += 1;
        slots.published
    }

    /// Swap a freshly published value into `read`. Returns its publish number,
    /// or `None` when nothing new was published.
    pub fn acquire(&self, read: &mut T) -> Option<u64> {
        let mut slots = self.slots.lock();
        if !slots.fresh {
            return None;
        }
        std::mem::swap(read, &mut slots.ready);
        slots.fresh = false;
        Some(slots.published)
    }

    pub fn published(&self) -> u64 {
        self.slots.lock().published
    }

    fn mark_finished(&self, frame: u64) {
        let mut slots = self.slots.lock();
        slots.finished = slots.finished.max(frame);
    }

    fn is_finished(&self) -> bool {
        let slots = self.slots.lock();
        slots.finished == slots.published
    }
}

/// Constructor for the two ends of a frame hand-off
pub struct FrameHandoff;

impl FrameHandoff {
    /// Producer and consumer ends sharing one triple buffer
    #[allow(clippy::new_ret_no_self)]
    pub fn new<T: Default>() -> (FrameProducer<T>, FrameConsumer<T>) {
        let buffer = TripleBuffer::default();
        (
            FrameProducer {
                buffer: buffer.clone(),
                recycled: Some(T::default()),
            },
            FrameConsumer {
                buffer,
                read: T::default(),
                current: None,
            },
        )
    }
}

/// Simulation end: hands finished states to the renderer
pub struct FrameProducer<T> {
    buffer: TripleBuffer<T>,
    recycled: Option<T>,
}

impl<T> FrameProducer<T> {
    /// True when the renderer has finished every frame handed over so far
    pub fn is_frame_finished(&self) -> bool {
        self.buffer.is_finished()
    }

    /// A state from an earlier frame to refill instead of allocating a new one
    pub fn take_recycled(&mut self) -> Option<T> {
        self.recycled.take()
    }

    /// Hand `state` over if the renderer is idle.
    ///
    /// Never blocks. While the previous frame is still being drawn the state comes
    /// back as `Err` so the caller can keep updating it.
    pub fn try_submit(&mut self, mut state: T) -> Result<(), T> {
        if !self.is_frame_finished() {
            return Err(state);
        }
        let frame = self.buffer.publish(&mut state);
        log::trace!("Submitted frame {frame}");
        self.recycled = Some(state);
        Ok(())
    }
}

/// Render end: takes the latest state and reports when it is done with it
pub struct FrameConsumer<T> {
    buffer: TripleBuffer<T>,
    read: T,
    current: Option<u64>,
}

impl<T> FrameConsumer<T> {
    /// The newest submitted state, if one arrived since the last call
    pub fn acquire(&mut self) -> Option<&T> {
        let frame = self.buffer.acquire(&mut self.read)?;
        self.current = Some(frame);
        Some(&self.read)
    }

    /// State of the frame being drawn
    pub fn current(&self) -> Option<&T> {
        self.current.map(|_| &self.read)
    }

    /// Report the acquired frame as drawn, letting the producer submit again
    pub fn finish(&mut self) {
        if let Some(frame) = self.current {
            self.buffer.mark_finished(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_waits_for_finish() {
        let (mut producer, mut consumer) = FrameHandoff::new::<Vec<u32>>();
        assert!(producer.is_frame_finished());
        assert!(producer.try_submit(vec![1]).is_ok());
        assert!(!producer.is_frame_finished());

        // The renderer is busy; the update comes back untouched
        assert_eq!(producer.try_submit(vec![2]), Err(vec![2]));

        assert_eq!(consumer.acquire(), Some(&vec![1]));
        assert!(consumer.acquire().is_none());
        assert!(!producer.is_frame_finished());
        consumer.finish();
        assert!(producer.is_frame_finished());

        assert!(producer.try_submit(vec![2, 3]).is_ok());
        assert_eq!(consumer.acquire(), Some(&vec![2, 3]));
    }

    #[test]
    fn test_states_rotate_through_three_slots() {
        let (mut producer, mut consumer) = FrameHandoff::new::<Vec<u32>>();
        let mut state = producer.take_recycled().unwrap();
        for frame in 0..4u32 {
            state.clear();
            state.push(frame);
            producer.try_submit(state).unwrap();
            assert_eq!(consumer.acquire(), Some(&vec![frame]));
            consumer.finish();
            state = producer.take_recycled().unwrap();
        }
        assert_eq!(consumer.current(), Some(&vec![3]));
    }

    #[test]
    fn test_handoff_across_threads() {
        let (mut producer, mut consumer) = FrameHandoff::new::<u64>();
        let simulation = std::thread::spawn(move || {
            let mut submitted = 0;
            let mut pending = 1u64;
            while submitted < 50 {
                match producer.try_submit(pending) {
                    Ok(()) => {
                        submitted += 1;
                        pending += 1;
                    }
                    Err(back) => {
                        pending = back;
                        std::thread::yield_now();
                    }
                }
            }
        });

        let mut last = 0;
        while last < 50 {
            if let Some(&frame) = consumer.acquire() {
                // Backpressure keeps frames from being skipped
                assert_eq!(frame, last + 1);
                last = frame;
                consumer.finish();
            } else {
                std::thread::yield_now();
            }
        }
        simulation.join().unwrap();
    }
}
