//! GPU copies of the light arrays

use super::manager::ExtractedLights;
use super::types::{GpuAreaLight, GpuPointLight, GpuTubeLight};
use crate::backend::{BufferHandle, BufferUsage, GraphicsBackend};
use crate::error::RenderResult;
use crate::resources::PersistentBuffer;

/// Storage buffers read by the lighting passes
///
/// Uploads happen in [`LightBuffers::flush`] and only when the snapshot generation
/// differs from the one last uploaded.
pub struct LightBuffers {
    point: PersistentBuffer<GpuPointLight>,
    area: PersistentBuffer<GpuAreaLight>,
    tube: PersistentBuffer<GpuTubeLight>,
    point_count: u32,
    area_count: u32,
    tube_count: u32,
    uploaded_generation: Option<u64>,
}

impl LightBuffers {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B, max_point_lights: usize) -> RenderResult<Self> {
        Ok(Self {
            point: PersistentBuffer::new(backend, "Point Lights", max_point_lights, BufferUsage::STORAGE)?,
            area: PersistentBuffer::new(backend, "Area Lights", crate::MAX_AREALIGHT_SHADOWMAPS, BufferUsage::STORAGE)?,
            tube: PersistentBuffer::new(backend, "Tube Lights", 16, BufferUsage::STORAGE)?,
            point_count: 0,
            area_count: 0,
            tube_count: 0,
            uploaded_generation: None,
        })
    }

    /// Upload again on the next flush regardless of generation
    pub fn mark_dirty(&mut self) {
        self.uploaded_generation = None;
    }

    pub fn is_current(&self, lights: &ExtractedLights) -> bool {
        self.uploaded_generation == Some(lights.generation)
    }

    /// Upload `lights` if they changed. Returns true when a buffer was reallocated,
    /// which invalidates bind groups holding the old handles.
    pub fn flush<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        lights: &ExtractedLights,
    ) -> RenderResult<bool> {
        if self.is_current(lights) {
            return Ok(false);
        }

        let point = lights.point_records();
        let area = lights.area_records();
        let tube = lights.tube_records();
        let mut reallocated = self.point.put(backend, 0, &point)?;
        reallocated |= self.area.put(backend, 0, &area)?;
        reallocated |= self.tube.put(backend, 0, &tube)?;

        self.point_count = point.len() as u32;
        self.area_count = area.len() as u32;
        self.tube_count = tube.len() as u32;
        self.uploaded_generation = Some(lights.generation);
        log::trace!("Uploaded light generation {}", lights.generation);
        Ok(reallocated)
    }

    pub fn point_buffer(&self) -> BufferHandle {
        self.point.buffer()
    }

    pub fn area_buffer(&self) -> BufferHandle {
        self.area.buffer()
    }

    pub fn tube_buffer(&self) -> BufferHandle {
        self.tube.buffer()
    }

    pub fn point_count(&self) -> u32 {
        self.point_count
    }

    pub fn area_count(&self) -> u32 {
        self.area_count
    }

    pub fn tube_count(&self) -> u32 {
        self.tube_count
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.point.destroy(backend);
        self.area.destroy(backend);
        self.tube.destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{RecordedCommand, RecordingBackend};
    use crate::camera::ExtractedCamera;
    use crate::light::{LightManager, PointLight};
    use crate::scene::{Scene, Transform};
    use glam::Vec3;

    fn writes(backend: &RecordingBackend) -> usize {
        backend
            .commands()
            .iter()
            .filter(|command| matches!(command, RecordedCommand::WriteBuffer { .. }))
            .count()
    }

    #[test]
    fn test_flush_uploads_once_per_generation() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut buffers = LightBuffers::new(&mut backend, 2).unwrap();
        let mut scene = Scene::new();
        for i in 0..5 {
            scene.spawn_point_light(
                Transform::from_position(Vec3::new(i as f32, 0.0, -5.0)),
                PointLight::default(),
            );
        }
        let mut manager = LightManager::default();
        manager.update(&mut scene, 1);
        let lights = manager.extract(&ExtractedCamera::default());

        assert!(buffers.flush(&mut backend, &lights).unwrap());
        assert_eq!(buffers.point_count(), 5);
        let uploaded = writes(&backend);
        assert!(uploaded > 0);

        assert!(!buffers.flush(&mut backend, &lights).unwrap());
        assert_eq!(writes(&backend), uploaded);

        buffers.mark_dirty();
        buffers.flush(&mut backend, &lights).unwrap();
        assert!(writes(&backend) > uploaded);
    }
}
