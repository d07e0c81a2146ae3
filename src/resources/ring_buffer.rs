//! Ring buffer for per-draw uniform data
//!
//! Each draw that needs its own uniform values takes a slot from the ring and
//! binds it with a dynamic offset, so many draws in one pass can each see
//! different values. The ring is reset at the start of every frame.

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend};
use crate::error::RenderResult;

/// A sub-allocation from a ring buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingAllocation {
    /// Byte offset into the ring buffer
    pub offset: u64,
    /// Size of the allocation in bytes
    pub size: u64,
}

impl RingAllocation {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

pub struct RingBuffer {
    buffer: BufferHandle,
    capacity: u64,
    write_offset: u64,
    alignment: u64,
    wrap_count: u64,
}

impl RingBuffer {
    /// Minimum uniform buffer offset alignment on every wgpu backend
    pub const DEFAULT_ALIGNMENT: u64 = 256;

    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        label: &str,
        capacity: u64,
        usage: BufferUsage,
    ) -> RenderResult<Self> {
        let capacity = align_up(capacity.max(1), Self::DEFAULT_ALIGNMENT);
        let buffer = backend.create_buffer(&BufferDescriptor::new(
            label,
            capacity,
            usage | BufferUsage::COPY_DST,
        ))?;
        Ok(Self {
            buffer,
            capacity,
            write_offset: 0,
            alignment: Self::DEFAULT_ALIGNMENT,
            wrap_count: 0,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.write_offset
    }

    pub fn wrap_count(&self) -> u64 {
        self.wrap_count
    }

    /// Reserve `size` bytes at the next aligned offset.
    ///
    /// Returns `None` when the allocation would run past the end.
    pub fn allocate(&mut self, size: u64) -> Option<RingAllocation> {
        let offset = align_up(self.write_offset, self.alignment);
        if offset + size > self.capacity {
            return None;
        }
        self.write_offset = offset + size;
        Some(RingAllocation { offset, size })
    }

    /// Allocate and upload `data`, wrapping to the start when the ring is full
    pub fn push<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        data: &[u8],
    ) -> Option<RingAllocation> {
        let size = data.len() as u64;
        let allocation = match self.allocate(size) {
            Some(allocation) => allocation,
            None => {
                log::warn!(
                    "Ring buffer full ({} bytes), wrapping within the frame",
                    self.capacity
                );
                self.write_offset = 0;
                self.wrap_count += 1;
                self.allocate(size)?
            }
        };
        backend.write_buffer(self.buffer, allocation.offset, data);
        Some(allocation)
    }

    /// Start a new frame
    pub fn reset(&mut self) {
        if self.write_offset > 0 {
            self.wrap_count += 1;
            self.write_offset = 0;
        }
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        backend.destroy_buffer(self.buffer);
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("write_offset", &self.write_offset)
            .field("wrap_count", &self.wrap_count)
            .finish()
    }
}

#[inline]
fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    fn ring(capacity: u64) -> (RecordingBackend, RingBuffer) {
        let mut backend = RecordingBackend::new(4, 4);
        let ring = RingBuffer::new(&mut backend, "test", capacity, BufferUsage::UNIFORM).unwrap();
        (backend, ring)
    }

    #[test]
    fn test_allocations_are_aligned() {
        let (_, mut ring) = ring(1024);
        let a = ring.allocate(100).unwrap();
        let b = ring.allocate(50).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(b.end(), 306);
    }

    #[test]
    fn test_overflow_returns_none() {
        let (_, mut ring) = ring(512);
        assert!(ring.allocate(400).is_some());
        assert!(ring.allocate(200).is_none());
    }

    #[test]
    fn test_push_wraps_and_writes() {
        let (mut backend, mut ring) = ring(1024);
        ring.push(&mut backend, &[1u8; 300]).unwrap();
        ring.push(&mut backend, &[2u8; 200]).unwrap();
        // Third push no longer fits and wraps to the start
        let wrapped = ring.push(&mut backend, &[3u8; 300]).unwrap();
        assert_eq!(wrapped.offset, 0);
        assert_eq!(ring.wrap_count(), 1);

        let bytes = backend.read_buffer(ring.buffer(), 0, 4).unwrap();
        assert_eq!(bytes, vec![3u8; 4]);
    }

    #[test]
    fn test_reset_counts_frames() {
        let (_, mut ring) = ring(512);
        ring.reset();
        assert_eq!(ring.wrap_count(), 0);
        ring.allocate(10).unwrap();
        ring.reset();
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.wrap_count(), 1);
    }
}
