//! Transform components

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};

/// Local transform, relative to the parent when there is one
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn from_position_rotation(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            ..Default::default()
        }
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Local -Z
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    pub fn translate(&mut self, offset: Vec3) {
        self.position += offset;
    }

    pub fn rotate_axis(&mut self, axis: Vec3, angle: f32) {
        self.rotation = Quat::from_axis_angle(axis, angle) * self.rotation;
    }

    /// Turn so that local -Z points at `target`
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = (target - self.position).normalize_or_zero();
        if forward == Vec3::ZERO {
            return;
        }
        let right = forward.cross(up).normalize_or_zero();
        if right == Vec3::ZERO {
            return;
        }
        let up = right.cross(forward);
        self.rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));
    }
}

/// Non-owning link to the parent entity
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parent(pub Entity);

/// Cached world matrix
///
/// Only valid after [`Scene::recalculate`](super::Scene::recalculate). Setting
/// `dirty` invalidates this entity and every descendant.
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct WorldTransform {
    pub matrix: Mat4,
    /// Matrix of the previous cycle, used for motion vectors
    pub previous: Mat4,
    pub dirty: bool,
    /// Last cycle in which the world matrix changed
    pub moved_in_cycle: u64,
}

impl Default for WorldTransform {
    fn default() -> Self {
        Self {
            matrix: Mat4::IDENTITY,
            previous: Mat4::IDENTITY,
            dirty: true,
            moved_in_cycle: 0,
        }
    }
}

impl WorldTransform {
    pub fn position(&self) -> Vec3 {
        self.matrix.w_axis.truncate()
    }
}
