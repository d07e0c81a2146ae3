//! Typed GPU buffers that grow by reallocation

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend};
use crate::error::{RenderError, RenderResult};
use bytemuck::Pod;
use std::marker::PhantomData;
use std::ops::Range;

/// A GPU buffer holding a flat array of `T` records
///
/// Capacity only ever grows. Growing creates a larger buffer, copies the old
/// contents across on the GPU and releases the old buffer.
pub struct PersistentBuffer<T: Pod> {
    label: String,
    buffer: BufferHandle,
    usage: BufferUsage,
    capacity: usize,
    len: usize,
    reallocations: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> PersistentBuffer<T> {
    /// Size of one record in bytes
    pub const STRIDE: u64 = std::mem::size_of::<T>() as u64;

    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        label: &str,
        capacity: usize,
        usage: BufferUsage,
    ) -> RenderResult<Self> {
        let capacity = capacity.max(1);
        let usage = usage | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let buffer = backend.create_buffer(&BufferDescriptor::new(
            label,
            capacity as u64 * Self::STRIDE,
            usage,
        ))?;
        Ok(Self {
            label: label.to_string(),
            buffer,
            usage,
            capacity,
            len: 0,
            reallocations: 0,
            _marker: PhantomData,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Capacity in records
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One past the highest record written so far
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.capacity as u64 * Self::STRIDE
    }

    /// How many times the buffer has been reallocated
    pub fn reallocation_count(&self) -> usize {
        self.reallocations
    }

    /// Make room for at least `required` records.
    ///
    /// Returns true when the buffer was reallocated, in which case every bind
    /// group referencing the old handle must be rebuilt.
    pub fn ensure_capacity<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        required: usize,
    ) -> RenderResult<bool> {
        if required <= self.capacity {
            return Ok(false);
        }

        let new_capacity = required.max(self.capacity * 2);
        let new_buffer = backend.create_buffer(&BufferDescriptor::new(
            &self.label,
            new_capacity as u64 * Self::STRIDE,
            self.usage,
        ))?;
        backend.copy_buffer_to_buffer(self.buffer, 0, new_buffer, 0, self.size_bytes());
        backend.destroy_buffer(self.buffer);

        log::debug!(
            "Grew buffer '{}' from {} to {} records",
            self.label,
            self.capacity,
            new_capacity
        );
        self.buffer = new_buffer;
        self.capacity = new_capacity;
        self.reallocations += 1;
        Ok(true)
    }

    /// Write `records` starting at record index `offset`, growing first if needed.
    ///
    /// Returns whether the buffer was reallocated.
    pub fn put<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        offset: usize,
        records: &[T],
    ) -> RenderResult<bool> {
        let end = offset + records.len();
        let grew = self.ensure_capacity(backend, end)?;
        if !records.is_empty() {
            backend.write_buffer(
                self.buffer,
                offset as u64 * Self::STRIDE,
                bytemuck::cast_slice(records),
            );
        }
        self.len = self.len.max(end);
        Ok(grew)
    }

    /// Read records back from the GPU.
    ///
    /// The caller must make sure every write to this range has been submitted.
    pub fn get_values<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        range: Range<usize>,
    ) -> RenderResult<Vec<T>> {
        if range.end > self.capacity || range.start > range.end {
            return Err(RenderError::ReadOutOfBounds {
                offset: range.start,
                requested: range.end.saturating_sub(range.start),
                len: self.capacity,
            });
        }
        let bytes = backend.read_buffer(
            self.buffer,
            range.start as u64 * Self::STRIDE,
            (range.end - range.start) as u64 * Self::STRIDE,
        )?;
        Ok(bytes
            .chunks_exact(Self::STRIDE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Forget the written length without touching GPU memory
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        backend.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    struct Record {
        id: u32,
        value: f32,
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record {
                id: i as u32,
                value: i as f32 * 0.5,
            })
            .collect()
    }

    #[test]
    fn test_write_then_read_is_identical() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut buffer =
            PersistentBuffer::<Record>::new(&mut backend, "records", 16, BufferUsage::STORAGE)
                .unwrap();
        let data = records(16);
        assert!(!buffer.put(&mut backend, 0, &data).unwrap());
        assert_eq!(buffer.get_values(&mut backend, 0..16).unwrap(), data);
        assert_eq!(buffer.reallocation_count(), 0);
    }

    #[test]
    fn test_growth_reallocates_once_and_keeps_contents() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut buffer =
            PersistentBuffer::<Record>::new(&mut backend, "records", 4, BufferUsage::STORAGE)
                .unwrap();
        let first = records(4);
        buffer.put(&mut backend, 0, &first).unwrap();

        let second = records(7);
        assert!(buffer.put(&mut backend, 4, &second).unwrap());
        assert_eq!(buffer.reallocation_count(), 1);
        assert_eq!(buffer.capacity(), 11);
        assert_eq!(backend.live_buffers(), 1);

        let all = buffer.get_values(&mut backend, 0..11).unwrap();
        assert_eq!(&all[..4], first.as_slice());
        assert_eq!(&all[4..], second.as_slice());
    }

    #[test]
    fn test_growth_doubles_for_small_overflow() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut buffer =
            PersistentBuffer::<u32>::new(&mut backend, "small", 8, BufferUsage::STORAGE).unwrap();
        buffer.put(&mut backend, 8, &[1]).unwrap();
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.len(), 9);
    }

    #[test]
    fn test_read_past_capacity_is_an_error() {
        let mut backend = RecordingBackend::new(4, 4);
        let buffer =
            PersistentBuffer::<u32>::new(&mut backend, "small", 8, BufferUsage::STORAGE).unwrap();
        let err = buffer.get_values(&mut backend, 4..12).unwrap_err();
        assert!(matches!(err, RenderError::ReadOutOfBounds { len: 8, .. }));
    }
}
