//! The immutable per-frame snapshot handed to the render thread

use glam::{Mat4, Vec3};

use crate::batch::RenderBatch;
use crate::camera::ExtractedCamera;
use crate::light::{ExtractedLights, LightManager};
use crate::scene::{EntityRecord, Scene, SceneSource};

/// Everything one draw needs, frozen at extraction time
#[derive(Debug, Clone, Default)]
pub struct RenderState {
    pub cycle: u64,
    pub camera: ExtractedCamera,
    pub batches: Vec<RenderBatch>,
    /// Indexed by [`RenderBatch::entity_buffer_index`]
    pub entity_records: Vec<EntityRecord>,
    pub entity_moved_in_cycle: u64,
    pub lights: ExtractedLights,
    /// Identity without a directional light
    pub directional_shadow_matrix: Mat4,
    pub sky_color: Vec3,
}

impl RenderState {
    /// Run the light update for `cycle` and capture the scene
    pub fn extract(scene: &mut Scene, lights: &mut LightManager, cycle: u64) -> Self {
        let mut state = Self::default();
        state.extract_into(scene, lights, cycle);
        state
    }

    /// Refill a recycled state, keeping its allocations
    pub fn extract_into(&mut self, scene: &mut Scene, lights: &mut LightManager, cycle: u64) {
        lights.update(scene, cycle);

        let camera = scene.camera_mut().extract();
        scene.camera_mut().end_frame();

        self.cycle = cycle;
        self.camera = camera;
        self.batches.clear();
        self.batches.extend(scene.visible_batches(&camera));
        self.entity_records.clear();
        self.entity_records.extend_from_slice(scene.entity_records());
        self.entity_moved_in_cycle = scene.entity_moved_in_cycle();
        self.lights = lights.extract(&camera);
        self.directional_shadow_matrix = self
            .lights
            .directional
            .map_or(Mat4::IDENTITY, |light| light.gpu.view_projection);
        self.sky_color = scene.sky_color();

        log::trace!(
            "Extracted cycle {cycle}: {} batches, {} records",
            self.batches.len(),
            self.entity_records.len()
        );
    }

    /// Batches passing both visibility gates
    pub fn visible_batch_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|batch| batch.is_visible() && batch.is_visible_for_camera())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::DirectionalLight;
    use crate::resources::{GeometryRange, Mesh};
    use crate::scene::{Model, Transform};

    #[test]
    fn test_extract_captures_scene() {
        let mut scene = Scene::new();
        let mesh = Mesh::cube();
        let model = Model {
            geometry: GeometryRange {
                first_index: 0,
                index_count: mesh.indices.len() as u32,
                base_vertex: 0,
            },
            material_index: 3,
            local_bounds: mesh.bounds().unwrap_or_default(),
        };
        scene.spawn_model(Transform::from_position(Vec3::new(0.0, 0.0, -5.0)), model);
        scene.spawn_model(Transform::from_position(Vec3::new(0.0, 0.0, 5.0)), model);
        scene.spawn_directional_light(Transform::default(), DirectionalLight::default());
        let mut lights = LightManager::default();

        let state = RenderState::extract(&mut scene, &mut lights, 7);
        assert_eq!(state.cycle, 7);
        assert_eq!(state.batches.len(), 2);
        assert_eq!(state.visible_batch_count(), 1);
        assert_eq!(state.entity_records.len(), 2);
        assert_eq!(state.entity_moved_in_cycle, 7);
        assert_eq!(state.lights.cycles.directional_light_moved_in_cycle, 7);
        assert_ne!(state.directional_shadow_matrix, Mat4::IDENTITY);
    }
}
