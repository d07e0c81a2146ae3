//! Simulation-side light bookkeeping

use bevy_ecs::prelude::*;
use glam::{Mat4, Vec3};

use super::packing::ForwardLights;
use super::shadow::{pack_shadow_index, ShadowSlots};
use super::types::{
    AreaLight, DirectionalLight, GpuAreaLight, GpuDirectionalLight, GpuPointLight, GpuTubeLight,
    PointLight, TubeLight,
};
use super::CastsShadow;
use crate::camera::ExtractedCamera;
use crate::frustum::Aabb;
use crate::scene::{Scene, SceneLight, SceneSource};
use crate::{PointLightShadowTechnique, MAX_AREALIGHT_SHADOWMAPS, MAX_POINTLIGHT_SHADOWMAPS};

/// Last cycle in which something of each kind moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LightCycles {
    pub entity_moved_in_cycle: u64,
    pub directional_light_moved_in_cycle: u64,
    pub point_light_moved_in_cycle: u64,
    pub area_light_moved_in_cycle: u64,
    pub tube_light_moved_in_cycle: u64,
}

/// One light frozen for a frame
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedLight<G> {
    pub entity: Entity,
    pub gpu: G,
    pub moved_in_cycle: u64,
    pub shadow_slot: Option<usize>,
    /// One matrix per shadow layer; empty without a slot
    pub shadow_matrices: Vec<Mat4>,
    pub world_aabb: Aabb,
    /// Whether the light volume touches the camera frustum
    pub visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractedDirectionalLight {
    pub entity: Entity,
    pub gpu: GpuDirectionalLight,
    pub moved_in_cycle: u64,
    pub casts_shadow: bool,
}

/// Every light of a frame, ready for upload
#[derive(Debug, Clone, Default)]
pub struct ExtractedLights {
    pub directional: Option<ExtractedDirectionalLight>,
    pub point: Vec<ExtractedLight<GpuPointLight>>,
    pub area: Vec<ExtractedLight<GpuAreaLight>>,
    pub tube: Vec<ExtractedLight<GpuTubeLight>>,
    pub forward: ForwardLights,
    pub cycles: LightCycles,
    /// Bumped on every flush; an unchanged value means uploaded copies are current
    pub generation: u64,
}

impl ExtractedLights {
    pub fn point_records(&self) -> Vec<GpuPointLight> {
        self.point.iter().map(|light| light.gpu).collect()
    }

    pub fn area_records(&self) -> Vec<GpuAreaLight> {
        self.area.iter().map(|light| light.gpu).collect()
    }

    pub fn tube_records(&self) -> Vec<GpuTubeLight> {
        self.tube.iter().map(|light| light.gpu).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    entity: Entity,
    world: Mat4,
    moved_in_cycle: u64,
}

impl<L> From<&SceneLight<'_, L>> for Tracked {
    fn from(light: &SceneLight<'_, L>) -> Self {
        Self {
            entity: light.entity,
            world: light.world.matrix,
            moved_in_cycle: light.moved_in_cycle(),
        }
    }
}

fn tracked<L>(lights: Vec<SceneLight<'_, L>>) -> Vec<Tracked> {
    lights.iter().map(Tracked::from).collect()
}

/// Move the cameras of lights whose entity moved this cycle
fn sync_cameras<L: Component>(
    scene: &mut Scene,
    lights: &[Tracked],
    cycle: u64,
    update: impl Fn(&mut L, &Mat4),
) -> bool {
    let mut moved = false;
    for light in lights.iter().filter(|light| light.moved_in_cycle == cycle) {
        if let Some(mut component) = scene.component_mut::<L>(light.entity) {
            update(&mut *component, &light.world);
            moved = true;
        }
    }
    moved
}

/// Reassign slots to `shadowed`, keeping existing holders. Returns whether the table changed.
fn assign_slots(slots: &mut ShadowSlots, shadowed: &[Entity], kind: &str) -> bool {
    let before = slots.clone();
    slots.retain(|entity| shadowed.contains(&entity));
    let unassigned = shadowed
        .iter()
        .filter(|&&entity| slots.assign(entity).is_none())
        .count();
    let changed = *slots != before;
    if changed && unassigned > 0 {
        log::debug!(
            "{unassigned} {kind} lights are over the cap of {} shadow maps and get none",
            slots.capacity()
        );
    }
    changed
}

/// Tracks light movement, shadow slots and the packed light arrays
///
/// Call [`LightManager::update`] once per simulation cycle. Light parameter edits
/// that do not move the entity need [`LightManager::mark_dirty`] to reach the GPU.
pub struct LightManager {
    technique: PointLightShadowTechnique,
    cycles: LightCycles,
    area_slots: ShadowSlots,
    point_slots: ShadowSlots,
    directional_center: Option<Vec3>,
    light_counts: [usize; 4],
    dirty: bool,
    snapshot: ExtractedLights,
}

impl Default for LightManager {
    fn default() -> Self {
        Self::new(PointLightShadowTechnique::default())
    }
}

impl LightManager {
    pub fn new(technique: PointLightShadowTechnique) -> Self {
        Self {
            technique,
            cycles: LightCycles::default(),
            area_slots: ShadowSlots::new(MAX_AREALIGHT_SHADOWMAPS),
            point_slots: ShadowSlots::new(MAX_POINTLIGHT_SHADOWMAPS),
            directional_center: None,
            light_counts: [0; 4],
            dirty: true,
            snapshot: ExtractedLights::default(),
        }
    }

    pub fn technique(&self) -> PointLightShadowTechnique {
        self.technique
    }

    pub fn cycles(&self) -> LightCycles {
        self.cycles
    }

    pub fn directional_light_moved_in_cycle(&self) -> u64 {
        self.cycles.directional_light_moved_in_cycle
    }

    pub fn point_light_moved_in_cycle(&self) -> u64 {
        self.cycles.point_light_moved_in_cycle
    }

    pub fn area_light_moved_in_cycle(&self) -> u64 {
        self.cycles.area_light_moved_in_cycle
    }

    pub fn tube_light_moved_in_cycle(&self) -> u64 {
        self.cycles.tube_light_moved_in_cycle
    }

    /// Shadow layer of an area light, `None` when it is over the cap
    pub fn depth_map_index_for_area_light(&self, entity: Entity) -> Option<usize> {
        self.area_slots.index_of(entity)
    }

    pub fn depth_map_index_for_point_light(&self, entity: Entity) -> Option<usize> {
        self.point_slots.index_of(entity)
    }

    /// Repack the light arrays on the next update
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Propagate transforms, move light cameras and flush the packed arrays if anything changed
    pub fn update(&mut self, scene: &mut Scene, cycle: u64) {
        scene.recalculate(cycle);
        self.cycles.entity_moved_in_cycle = scene.entity_moved_in_cycle();

        let directional = scene.directional_light().as_ref().map(Tracked::from);
        let points = tracked(scene.point_lights());
        let areas = tracked(scene.area_lights());
        let tubes = tracked(scene.tube_lights());

        let counts = [
            usize::from(directional.is_some()),
            points.len(),
            areas.len(),
            tubes.len(),
        ];
        if counts != self.light_counts {
            self.light_counts = counts;
            self.dirty = true;
        }

        if let Some(light) = &directional {
            let center = DirectionalLight::snapped_center(scene.camera().position());
            let recentred = self.directional_center != Some(center);
            if light.moved_in_cycle == cycle || recentred {
                if let Some(mut component) = scene.component_mut::<DirectionalLight>(light.entity) {
                    component.update_camera(&light.world, center);
                }
                self.directional_center = Some(center);
                self.cycles.directional_light_moved_in_cycle = cycle;
                self.dirty = true;
            }
        }

        if sync_cameras::<PointLight>(scene, &points, cycle, PointLight::update_camera) {
            self.cycles.point_light_moved_in_cycle = cycle;
            self.dirty = true;
        }
        if sync_cameras::<AreaLight>(scene, &areas, cycle, AreaLight::update_camera) {
            self.cycles.area_light_moved_in_cycle = cycle;
            self.dirty = true;
        }
        if sync_cameras::<TubeLight>(scene, &tubes, cycle, TubeLight::update_camera) {
            self.cycles.tube_light_moved_in_cycle = cycle;
            self.dirty = true;
        }

        let shadowed_points: Vec<Entity> = points
            .iter()
            .map(|light| light.entity)
            .filter(|&entity| scene.component::<PointLight>(entity).is_some_and(|l| l.casts_shadow))
            .collect();
        let shadowed_areas: Vec<Entity> = areas
            .iter()
            .map(|light| light.entity)
            .filter(|&entity| scene.component::<AreaLight>(entity).is_some_and(|l| l.casts_shadow))
            .collect();
        self.dirty |= assign_slots(&mut self.point_slots, &shadowed_points, "point");
        self.dirty |= assign_slots(&mut self.area_slots, &shadowed_areas, "area");

        if self.dirty {
            self.flush(scene, directional.as_ref(), &points, &areas, &tubes);
        }
    }

    fn flush(
        &mut self,
        scene: &mut Scene,
        directional: Option<&Tracked>,
        points: &[Tracked],
        areas: &[Tracked],
        tubes: &[Tracked],
    ) {
        let technique = self.technique;
        let directional_moved = self.cycles.directional_light_moved_in_cycle;
        let directional = directional.and_then(|tracked| {
            let mut light = scene.component_mut::<DirectionalLight>(tracked.entity)?;
            Some(ExtractedDirectionalLight {
                entity: tracked.entity,
                gpu: light.to_gpu(),
                moved_in_cycle: directional_moved,
                casts_shadow: light.casts_shadow,
            })
        });

        let mut point = Vec::with_capacity(points.len());
        for tracked in points {
            let Some(mut light) = scene.component_mut::<PointLight>(tracked.entity) else {
                continue;
            };
            let slot = self.point_slots.index_of(tracked.entity);
            let shadow_matrices = match slot {
                Some(_) => light.shadow_view_projections(technique),
                None => Vec::new(),
            };
            point.push(ExtractedLight {
                entity: tracked.entity,
                gpu: light.to_gpu(pack_shadow_index(slot)),
                moved_in_cycle: tracked.moved_in_cycle,
                shadow_slot: slot,
                shadow_matrices,
                world_aabb: light.world_aabb(),
                visible: true,
            });
        }

        let mut area = Vec::with_capacity(areas.len());
        for tracked in areas {
            let Some(mut light) = scene.component_mut::<AreaLight>(tracked.entity) else {
                continue;
            };
            let slot = self.area_slots.index_of(tracked.entity);
            let shadow_matrices = match slot {
                Some(_) => light.shadow_view_projections(technique),
                None => Vec::new(),
            };
            area.push(ExtractedLight {
                entity: tracked.entity,
                gpu: light.to_gpu(&tracked.world, pack_shadow_index(slot)),
                moved_in_cycle: tracked.moved_in_cycle,
                shadow_slot: slot,
                shadow_matrices,
                world_aabb: light.world_aabb(&tracked.world),
                visible: true,
            });
        }

        let tube: Vec<_> = tubes
            .iter()
            .filter_map(|tracked| {
                let light = scene.component::<TubeLight>(tracked.entity)?;
                Some(ExtractedLight {
                    entity: tracked.entity,
                    gpu: light.to_gpu(&tracked.world),
                    moved_in_cycle: tracked.moved_in_cycle,
                    shadow_slot: None,
                    shadow_matrices: Vec::new(),
                    world_aabb: light.world_aabb(&tracked.world),
                    visible: true,
                })
            })
            .collect();

        let mut lights = ExtractedLights {
            directional,
            point,
            area,
            tube,
            forward: ForwardLights::default(),
            cycles: self.cycles,
            generation: self.snapshot.generation + 1,
        };
        lights.forward = ForwardLights::pack(
            &lights.point_records(),
            &lights.area_records(),
            &lights.tube_records(),
        );
        log::trace!(
            "Flushed lights: {} point, {} area, {} tube",
            lights.point.len(),
            lights.area.len(),
            lights.tube.len()
        );
        self.snapshot = lights;
        self.dirty = false;
    }

    /// Snapshot of the last flush with visibility evaluated for `camera`
    pub fn extract(&self, camera: &ExtractedCamera) -> ExtractedLights {
        let mut lights = self.snapshot.clone();
        lights.cycles = self.cycles;
        for light in &mut lights.point {
            light.visible = camera.frustum.aabb_in_frustum(&light.world_aabb);
        }
        for light in &mut lights.area {
            light.visible = camera.frustum.aabb_in_frustum(&light.world_aabb);
        }
        for light in &mut lights.tube {
            light.visible = camera.frustum.aabb_in_frustum(&light.world_aabb);
        }
        lights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Projection;
    use crate::light::HasFrustum;
    use crate::scene::Transform;
    use glam::Quat;

    #[test]
    fn test_moving_directional_light_sets_its_cycle() {
        let mut scene = Scene::new();
        let sun = scene.spawn_directional_light(Transform::default(), DirectionalLight::default());
        let mut manager = LightManager::default();

        manager.update(&mut scene, 1);
        assert_eq!(manager.directional_light_moved_in_cycle(), 1);

        manager.update(&mut scene, 2);
        assert_eq!(manager.directional_light_moved_in_cycle(), 1);

        let tilted = Transform::from_position_rotation(Vec3::ZERO, Quat::from_rotation_x(-0.8));
        assert!(scene.set_transform(sun, tilted));
        manager.update(&mut scene, 3);
        assert_eq!(manager.directional_light_moved_in_cycle(), 3);

        let light = scene.component::<DirectionalLight>(sun).unwrap();
        assert_eq!(
            light.camera().projection(),
            Projection::Orthographic {
                width: 2000.0,
                height: 2000.0,
                near: -2500.0,
                far: 2500.0,
            }
        );
        assert!(light.direction().abs_diff_eq(tilted.forward(), 1e-5));
    }

    #[test]
    fn test_camera_crossing_snap_grid_moves_directional_light() {
        let mut scene = Scene::new();
        scene.spawn_directional_light(Transform::default(), DirectionalLight::default());
        let mut manager = LightManager::default();
        manager.update(&mut scene, 1);

        scene.camera_mut().set_position(Vec3::new(20.0, 0.0, 0.0));
        manager.update(&mut scene, 2);
        assert_eq!(manager.directional_light_moved_in_cycle(), 1);

        scene.camera_mut().set_position(Vec3::new(400.0, 0.0, 0.0));
        manager.update(&mut scene, 3);
        assert_eq!(manager.directional_light_moved_in_cycle(), 3);
    }

    #[test]
    fn test_area_shadow_cap() {
        let mut scene = Scene::new();
        let lights: Vec<Entity> = (0..MAX_AREALIGHT_SHADOWMAPS + 2)
            .map(|i| {
                scene.spawn_area_light(
                    Transform::from_position(Vec3::new(i as f32, 0.0, 0.0)),
                    AreaLight::default(),
                )
            })
            .collect();
        let mut manager = LightManager::default();
        manager.update(&mut scene, 1);

        for (i, &light) in lights.iter().enumerate().take(MAX_AREALIGHT_SHADOWMAPS) {
            assert_eq!(manager.depth_map_index_for_area_light(light), Some(i));
        }
        let over_cap = lights[MAX_AREALIGHT_SHADOWMAPS];
        assert_eq!(manager.depth_map_index_for_area_light(over_cap), None);

        let extracted = manager.extract(&ExtractedCamera::default());
        let packed = extracted.area.iter().find(|light| light.entity == over_cap).unwrap();
        assert_eq!(packed.gpu.shadow_index, -1);
        assert!(packed.shadow_matrices.is_empty());

        // A despawned light frees its slot for the first light waiting
        assert!(scene.despawn(lights[0]));
        manager.update(&mut scene, 2);
        assert_eq!(manager.depth_map_index_for_area_light(over_cap), Some(0));
        assert_eq!(
            manager.depth_map_index_for_area_light(lights[MAX_AREALIGHT_SHADOWMAPS + 1]),
            None
        );
    }

    #[test]
    fn test_static_lights_keep_generation() {
        let mut scene = Scene::new();
        scene.spawn_point_light(
            Transform::from_position(Vec3::new(0.0, 0.0, -10.0)),
            PointLight::new(Vec3::ONE, 1.0, 1.0),
        );
        scene.spawn_point_light(
            Transform::from_position(Vec3::new(0.0, 0.0, 10.0)),
            PointLight::new(Vec3::ONE, 1.0, 1.0).with_shadow(false),
        );
        let mut manager = LightManager::default();
        manager.update(&mut scene, 1);
        let camera = scene.camera_mut().extract();
        let first = manager.extract(&camera);
        assert_eq!(first.cycles.point_light_moved_in_cycle, 1);
        assert_eq!(first.point.len(), 2);
        assert!(first.point[0].visible);
        assert!(!first.point[1].visible);
        assert_eq!(first.point[0].shadow_matrices.len(), 6);
        assert_eq!(first.point[1].gpu.shadow_index, -1);
        assert_eq!(first.forward.point_count(), 2);

        manager.update(&mut scene, 2);
        assert!(!manager.is_dirty());
        assert_eq!(manager.extract(&camera).generation, first.generation);

        manager.mark_dirty();
        manager.update(&mut scene, 3);
        assert_eq!(manager.extract(&camera).generation, first.generation + 1);
    }
}
