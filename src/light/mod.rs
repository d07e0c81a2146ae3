//! Lights, shadow bookkeeping and light-array packing
//!
//! Light components live on scene entities and each hold a [`Camera`]. The
//! [`LightManager`] runs on the simulation side: it moves the light cameras with
//! their entities, tracks the per-type "moved in cycle" counters, hands out shadow
//! map slots and packs everything into an [`ExtractedLights`] snapshot. The render
//! side uploads that snapshot through [`LightBuffers`].

mod buffers;
mod manager;
mod packing;
mod shadow;
mod types;

pub use buffers::LightBuffers;
pub use manager::{
    ExtractedDirectionalLight, ExtractedLight, ExtractedLights, LightCycles, LightManager,
};
pub use packing::{ForwardLights, AREA_LIGHT_FLOATS, POINT_LIGHT_FLOATS, TUBE_LIGHT_FLOATS};
pub use shadow::{pack_shadow_index, ShadowSlots, ShadowState, ShadowTracker};
pub use types::{
    AreaLight, DirectionalLight, GpuAreaLight, GpuDirectionalLight, GpuPointLight, GpuTubeLight,
    PointLight, TubeLight, AREA_LIGHT_FOV_DEGREES, SHADOW_NEAR_PLANE,
};

use glam::{Mat4, Vec3};

use crate::camera::Camera;
use crate::frustum::Frustum;
use crate::PointLightShadowTechnique;

/// A light that can be culled against
pub trait HasFrustum {
    fn camera(&self) -> &Camera;

    fn camera_mut(&mut self) -> &mut Camera;

    fn frustum(&mut self) -> Frustum {
        self.camera_mut().frustum()
    }

    /// Whether a sphere can receive light from this light
    fn sphere_in_light_frustum(&mut self, center: Vec3, radius: f32) -> bool {
        self.camera_mut().sphere_in_frustum(center, radius)
    }
}

/// A light that renders a shadow map
pub trait CastsShadow: HasFrustum {
    fn casts_shadow(&self) -> bool;

    /// Layers of the shadow texture this light fills
    fn shadow_layers(&self, technique: PointLightShadowTechnique) -> u32;

    /// One matrix per layer, in layer order
    fn shadow_view_projections(&mut self, technique: PointLightShadowTechnique) -> Vec<Mat4>;
}
