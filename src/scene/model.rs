//! Renderable model components and the per-instance GPU record

use bevy_ecs::prelude::*;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::transform::Transform;
use crate::frustum::Aabb;
use crate::resources::GeometryRange;

/// Mesh and material of a renderable entity
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Model {
    pub geometry: GeometryRange,
    pub material_index: u32,
    pub local_bounds: Aabb,
}

/// Extra copies of the model drawn in one instanced call
///
/// Instance `i` ends up at `entity_world * instances[i].matrix()`; instances do
/// not nest.
#[derive(Component, Debug, Clone, Default, PartialEq)]
pub struct Instances(pub Vec<Transform>);

/// Draw flags
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFlags {
    pub visible: bool,
    pub selected: bool,
    pub draw_lines: bool,
}

impl Default for RenderFlags {
    fn default() -> Self {
        Self {
            visible: true,
            selected: false,
            draw_lines: false,
        }
    }
}

/// World-space bounds covering every instance
#[derive(Component, Debug, Clone, Copy, Default, PartialEq)]
pub struct WorldBounds(pub Aabb);

/// One instance as the shaders read it from the entity buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct EntityRecord {
    pub model: Mat4,
    pub previous_model: Mat4,
    pub material_index: u32,
    /// Bit 0 selected, bit 1 draw lines
    pub flags: u32,
    pub _padding: [u32; 2],
}

impl EntityRecord {
    pub const SELECTED: u32 = 1 << 0;
    pub const DRAW_LINES: u32 = 1 << 1;

    pub fn new(model: Mat4, previous_model: Mat4, material_index: u32, flags: &RenderFlags) -> Self {
        let mut bits = 0;
        if flags.selected {
            bits |= Self::SELECTED;
        }
        if flags.draw_lines {
            bits |= Self::DRAW_LINES;
        }
        Self {
            model,
            previous_model,
            material_index,
            flags: bits,
            _padding: [0; 2],
        }
    }
}
