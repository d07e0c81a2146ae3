//! Scene collaborator
//!
//! A thin typed store of entities on top of `bevy_ecs`. The renderer only sees it
//! through [`SceneSource`]: visible batches for a camera, the light lists and the
//! per-instance entity records.

mod model;
mod transform;

pub use model::{EntityRecord, Instances, Model, RenderFlags, WorldBounds};
pub use transform::{Parent, Transform, WorldTransform};

use std::collections::HashMap;

use bevy_ecs::prelude::*;
use bevy_ecs::world::Mut;
use glam::{Mat4, Vec3};

use crate::batch::RenderBatch;
use crate::camera::{Camera, ExtractedCamera};
use crate::frustum::Aabb;
use crate::light::{AreaLight, DirectionalLight, PointLight, TubeLight};

/// A light entity as seen by the renderer
#[derive(Debug, Clone, Copy)]
pub struct SceneLight<'a, L> {
    pub entity: Entity,
    pub light: &'a L,
    pub world: &'a WorldTransform,
}

impl<L> SceneLight<'_, L> {
    pub fn moved_in_cycle(&self) -> u64 {
        self.world.moved_in_cycle
    }
}

/// What the render core reads from a scene
pub trait SceneSource {
    /// Cycle passed to the last `recalculate`
    fn cycle(&self) -> u64;

    /// Last cycle in which any model moved
    fn entity_moved_in_cycle(&self) -> u64;

    /// Every model as a batch, with both visibility gates evaluated for `camera`
    fn visible_batches(&self, camera: &ExtractedCamera) -> Vec<RenderBatch>;

    /// Per-instance records; [`RenderBatch::entity_buffer_index`] points into this
    fn entity_records(&self) -> &[EntityRecord];

    fn point_lights(&self) -> Vec<SceneLight<'_, PointLight>>;

    fn area_lights(&self) -> Vec<SceneLight<'_, AreaLight>>;

    fn tube_lights(&self) -> Vec<SceneLight<'_, TubeLight>>;

    /// The first directional light, if any
    fn directional_light(&self) -> Option<SceneLight<'_, DirectionalLight>>;
}

struct Node {
    local: Mat4,
    parent: Option<Entity>,
    dirty: bool,
}

pub struct Scene {
    world: World,
    camera: Camera,
    cycle: u64,
    entity_moved_in_cycle: u64,
    models: Vec<Entity>,
    point_lights: Vec<Entity>,
    area_lights: Vec<Entity>,
    tube_lights: Vec<Entity>,
    directional_lights: Vec<Entity>,
    records: Vec<EntityRecord>,
    record_index: HashMap<Entity, u32>,
    records_dirty: bool,
    /// A model was removed or hidden since the last `recalculate`
    geometry_changed: bool,
    /// Records still carry last cycle's previous matrices
    moved_last_cycle: bool,
    sky_color: Vec3,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            world: World::new(),
            camera: Camera::default(),
            cycle: 0,
            entity_moved_in_cycle: 0,
            models: Vec::new(),
            point_lights: Vec::new(),
            area_lights: Vec::new(),
            tube_lights: Vec::new(),
            directional_lights: Vec::new(),
            records: Vec::new(),
            record_index: HashMap::new(),
            records_dirty: true,
            geometry_changed: false,
            moved_last_cycle: false,
            sky_color: Vec3::new(0.45, 0.6, 0.85),
        }
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn sky_color(&self) -> Vec3 {
        self.sky_color
    }

    pub fn set_sky_color(&mut self, color: Vec3) {
        self.sky_color = color;
    }

    pub fn entity_count(&self) -> usize {
        self.world.entities().len() as usize
    }

    pub fn spawn_entity(&mut self, transform: Transform) -> Entity {
        self.world
            .spawn((transform, WorldTransform::default()))
            .id()
    }

    pub fn spawn_model(&mut self, transform: Transform, model: Model) -> Entity {
        let entity = self
            .world
            .spawn((
                transform,
                WorldTransform::default(),
                model,
                RenderFlags::default(),
                WorldBounds::default(),
            ))
            .id();
        self.models.push(entity);
        self.records_dirty = true;
        entity
    }

    pub fn spawn_point_light(&mut self, transform: Transform, light: PointLight) -> Entity {
        let entity = self.world.spawn((transform, WorldTransform::default(), light)).id();
        self.point_lights.push(entity);
        entity
    }

    pub fn spawn_area_light(&mut self, transform: Transform, light: AreaLight) -> Entity {
        let entity = self.world.spawn((transform, WorldTransform::default(), light)).id();
        self.area_lights.push(entity);
        entity
    }

    pub fn spawn_tube_light(&mut self, transform: Transform, light: TubeLight) -> Entity {
        let entity = self.world.spawn((transform, WorldTransform::default(), light)).id();
        self.tube_lights.push(entity);
        entity
    }

    pub fn spawn_directional_light(&mut self, transform: Transform, light: DirectionalLight) -> Entity {
        let entity = self.world.spawn((transform, WorldTransform::default(), light)).id();
        self.directional_lights.push(entity);
        entity
    }

    /// Remove an entity; its children become roots at their current local transform
    pub fn despawn(&mut self, entity: Entity) -> bool {
        let children: Vec<Entity> = self
            .world
            .query::<(Entity, &Parent)>()
            .iter(&self.world)
            .filter(|(_, parent)| parent.0 == entity)
            .map(|(child, _)| child)
            .collect();
        for child in children {
            self.world.entity_mut(child).remove::<Parent>();
            self.mark_dirty(child);
        }

        if self.models.contains(&entity) {
            self.geometry_changed = true;
        }
        for list in [
            &mut self.models,
            &mut self.point_lights,
            &mut self.area_lights,
            &mut self.tube_lights,
            &mut self.directional_lights,
        ] {
            list.retain(|e| *e != entity);
        }
        self.records_dirty = true;
        self.world.despawn(entity)
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.world.entities().contains(entity)
    }

    pub fn component<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.world.get::<T>(entity)
    }

    pub fn component_mut<T: Component>(&mut self, entity: Entity) -> Option<Mut<'_, T>> {
        self.world.get_mut::<T>(entity)
    }

    pub fn transform(&self, entity: Entity) -> Option<Transform> {
        self.world.get::<Transform>(entity).copied()
    }

    pub fn world_transform(&self, entity: Entity) -> Option<&WorldTransform> {
        self.world.get::<WorldTransform>(entity)
    }

    fn mark_dirty(&mut self, entity: Entity) {
        if let Some(mut world) = self.world.get_mut::<WorldTransform>(entity) {
            world.dirty = true;
        }
    }

    /// Replace the local transform and flag the entity as moved
    pub fn set_transform(&mut self, entity: Entity, transform: Transform) -> bool {
        let Some(mut current) = self.world.get_mut::<Transform>(entity) else {
            return false;
        };
        *current = transform;
        self.mark_dirty(entity);
        true
    }

    /// Attach `child` to `parent`, or detach it with `None`.
    ///
    /// Returns false, changing nothing, when either entity is missing or the
    /// link would create a cycle.
    pub fn set_parent(&mut self, child: Entity, parent: Option<Entity>) -> bool {
        if !self.contains(child) {
            return false;
        }
        match parent {
            Some(parent) => {
                if !self.contains(parent) || self.is_ancestor_or_self(child, parent) {
                    return false;
                }
                self.world.entity_mut(child).insert(Parent(parent));
            }
            None => {
                self.world.entity_mut(child).remove::<Parent>();
            }
        }
        self.mark_dirty(child);
        true
    }

    /// Whether `ancestor` is `entity` or one of its ancestors
    fn is_ancestor_or_self(&self, ancestor: Entity, entity: Entity) -> bool {
        let mut current = Some(entity);
        while let Some(e) = current {
            if e == ancestor {
                return true;
            }
            current = self.world.get::<Parent>(e).map(|p| p.0);
        }
        false
    }

    pub fn set_instances(&mut self, entity: Entity, instances: Vec<Transform>) -> bool {
        if self.world.get::<Model>(entity).is_none() {
            return false;
        }
        self.world.entity_mut(entity).insert(Instances(instances));
        self.mark_dirty(entity);
        self.records_dirty = true;
        true
    }

    fn update_flags(&mut self, entity: Entity, update: impl FnOnce(&mut RenderFlags)) -> bool {
        let Some(mut flags) = self.world.get_mut::<RenderFlags>(entity) else {
            return false;
        };
        update(&mut flags);
        self.records_dirty = true;
        true
    }

    pub fn set_visible(&mut self, entity: Entity, visible: bool) -> bool {
        let mut changed = false;
        let found = self.update_flags(entity, |f| {
            changed = f.visible != visible;
            f.visible = visible;
        });
        self.geometry_changed |= changed;
        found
    }

    pub fn set_selected(&mut self, entity: Entity, selected: bool) -> bool {
        self.update_flags(entity, |f| f.selected = selected)
    }

    pub fn set_draw_lines(&mut self, entity: Entity, draw_lines: bool) -> bool {
        self.update_flags(entity, |f| f.draw_lines = draw_lines)
    }

    /// Propagate dirty transforms down the hierarchy for simulation cycle `cycle`.
    ///
    /// Every entity whose own or inherited transform changed gets a new world
    /// matrix and `moved_in_cycle = cycle`. World bounds and entity records are
    /// rebuilt afterwards.
    pub fn recalculate(&mut self, cycle: u64) {
        self.cycle = cycle;

        let nodes: HashMap<Entity, Node> = self
            .world
            .query::<(Entity, &Transform, Option<&Parent>, &WorldTransform)>()
            .iter(&self.world)
            .map(|(entity, transform, parent, world)| {
                (
                    entity,
                    Node {
                        local: transform.matrix(),
                        parent: parent.map(|p| p.0),
                        dirty: world.dirty,
                    },
                )
            })
            .collect();

        let mut resolved = HashMap::with_capacity(nodes.len());
        for entity in nodes.keys() {
            resolve(*entity, &nodes, &mut resolved);
        }

        let mut any_moved = false;
        for (entity, (matrix, dirty)) in &resolved {
            let is_model = self.world.get::<Model>(*entity).is_some();
            let Some(mut world) = self.world.get_mut::<WorldTransform>(*entity) else {
                continue;
            };
            world.previous = world.matrix;
            if *dirty {
                world.matrix = *matrix;
                world.dirty = false;
                world.moved_in_cycle = cycle;
                if is_model {
                    self.entity_moved_in_cycle = cycle;
                }
                any_moved = true;
            }
        }

        // Shadow maps must not keep casters that are gone or hidden
        if self.geometry_changed {
            self.entity_moved_in_cycle = cycle;
            self.geometry_changed = false;
        }

        if any_moved || self.records_dirty || self.moved_last_cycle {
            self.rebuild_records();
        }
        self.moved_last_cycle = any_moved;
    }

    fn rebuild_records(&mut self) {
        self.records.clear();
        self.record_index.clear();
        for &entity in &self.models {
            let (Some(model), Some(world), Some(flags)) = (
                self.world.get::<Model>(entity),
                self.world.get::<WorldTransform>(entity),
                self.world.get::<RenderFlags>(entity),
            ) else {
                continue;
            };
            self.record_index.insert(entity, self.records.len() as u32);

            let mut bounds: Option<Aabb> = None;
            let mut push = |local: Mat4| {
                let matrix = world.matrix * local;
                let previous = world.previous * local;
                let instance_bounds = model.local_bounds.transformed(&matrix);
                bounds = Some(bounds.map_or(instance_bounds, |b| b.union(&instance_bounds)));
                EntityRecord::new(matrix, previous, model.material_index, flags)
            };
            match self.world.get::<Instances>(entity) {
                Some(instances) if !instances.0.is_empty() => {
                    for instance in &instances.0 {
                        self.records.push(push(instance.matrix()));
                    }
                }
                _ => self.records.push(push(Mat4::IDENTITY)),
            }

            if let Some(bounds) = bounds {
                if let Some(mut world_bounds) = self.world.get_mut::<WorldBounds>(entity) {
                    world_bounds.0 = bounds;
                }
            }
        }
        self.records_dirty = false;
    }

    fn lights<L: Component>(&self, list: &[Entity]) -> Vec<SceneLight<'_, L>> {
        list.iter()
            .filter_map(|&entity| {
                Some(SceneLight {
                    entity,
                    light: self.world.get::<L>(entity)?,
                    world: self.world.get::<WorldTransform>(entity)?,
                })
            })
            .collect()
    }
}

fn resolve(
    entity: Entity,
    nodes: &HashMap<Entity, Node>,
    resolved: &mut HashMap<Entity, (Mat4, bool)>,
) -> (Mat4, bool) {
    if let Some(result) = resolved.get(&entity) {
        return *result;
    }
    let Some(node) = nodes.get(&entity) else {
        return (Mat4::IDENTITY, false);
    };
    let (parent_matrix, parent_dirty) = match node.parent {
        Some(parent) if nodes.contains_key(&parent) => resolve(parent, nodes, resolved),
        _ => (Mat4::IDENTITY, false),
    };
    let result = (parent_matrix * node.local, parent_dirty || node.dirty);
    resolved.insert(entity, result);
    result
}

impl SceneSource for Scene {
    fn cycle(&self) -> u64 {
        self.cycle
    }

    fn entity_moved_in_cycle(&self) -> u64 {
        self.entity_moved_in_cycle
    }

    fn visible_batches(&self, camera: &ExtractedCamera) -> Vec<RenderBatch> {
        self.models
            .iter()
            .filter_map(|&entity| {
                let model = self.world.get::<Model>(entity)?;
                let flags = self.world.get::<RenderFlags>(entity)?;
                let bounds = self.world.get::<WorldBounds>(entity)?.0;
                let first_record = *self.record_index.get(&entity)?;
                let instance_count = self
                    .world
                    .get::<Instances>(entity)
                    .map_or(1, |i| i.0.len().max(1)) as u32;

                let center = bounds.center();
                let radius = bounds.bounding_radius();
                Some(RenderBatch {
                    material_index: model.material_index,
                    entity_buffer_index: first_record,
                    visible: flags.visible,
                    visible_for_camera: camera.sphere_in_frustum(center, radius),
                    selected: flags.selected,
                    draw_lines: flags.draw_lines,
                    camera_relative_position: center - camera.position,
                    instance_count,
                    index_count: model.geometry.index_count,
                    first_index: model.geometry.first_index,
                    base_vertex: model.geometry.base_vertex,
                    world_aabb: bounds,
                    sphere_center: center,
                    sphere_radius: radius,
                })
            })
            .collect()
    }

    fn entity_records(&self) -> &[EntityRecord] {
        &self.records
    }

    fn point_lights(&self) -> Vec<SceneLight<'_, PointLight>> {
        self.lights(&self.point_lights)
    }

    fn area_lights(&self) -> Vec<SceneLight<'_, AreaLight>> {
        self.lights(&self.area_lights)
    }

    fn tube_lights(&self) -> Vec<SceneLight<'_, TubeLight>> {
        self.lights(&self.tube_lights)
    }

    fn directional_light(&self) -> Option<SceneLight<'_, DirectionalLight>> {
        self.lights(&self.directional_lights).into_iter().next()
    }
}
