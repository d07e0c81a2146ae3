//! Deferred Renderer - a deferred-shading frame pipeline on top of wgpu
//!
//! The renderer draws a frame in a fixed order of stages:
//! - G-Buffer (first) pass writing position, normal, albedo and motion
//! - Shadow passes, redrawn only when a light or the geometry moved
//! - Lighting (second) pass accumulating directional, tiled point, tube and area lights
//! - Ambient occlusion / scattering at half resolution
//! - Screen-space reflections
//! - Combine and post-process (auto exposure, motion blur, tone mapping)
//!
//! # Threads
//! Simulation state is extracted into an immutable [`frame::RenderState`] and handed
//! to the render thread through a [`frame::FrameHandoff`] triple buffer. All GPU calls
//! go through a [`context::RenderContext`], which never leaves the thread that created
//! it; other threads reach it through a [`frame::GpuTaskSender`].
//!
//! # Backends
//! - **wgpu**: real GPU rendering, either to a window surface or headless
//! - **recording**: a CPU-side backend that keeps buffer contents in host memory and
//!   records every command, used by tests and tools

pub mod backend;
pub mod batch;
pub mod camera;
pub mod context;
pub mod error;
pub mod frame;
pub mod frustum;
pub mod light;
pub mod pipeline;
pub mod profiling;
pub mod program;
pub mod resources;
pub mod scene;

pub use backend::{GraphicsBackend, RecordingBackend, WgpuBackend};
pub use batch::{DrawElementsIndirectCommand, RenderBatch};
pub use camera::{Camera, ExtractedCamera, Projection};
pub use context::RenderContext;
pub use error::{RenderError, RenderResult};
pub use frame::{FrameHandoff, GpuTaskQueue, GpuTaskSender, RenderState};
pub use frustum::{Aabb, Frustum};
pub use light::LightManager;
pub use pipeline::{DrawResult, DrawStrategy};
pub use scene::Scene;

/// Maximum number of area lights that receive a shadow map.
pub const MAX_AREALIGHT_SHADOWMAPS: usize = 8;
/// Resolution (width and height) of each area light shadow map.
pub const AREALIGHT_SHADOWMAP_RESOLUTION: u32 = 512;
/// Maximum number of point lights with a shadow cube (or paraboloid pair).
pub const MAX_POINTLIGHT_SHADOWMAPS: usize = 16;
/// Point lights packed into the forward light arrays.
pub const POINT_LIGHTS_FORWARD_MAX_COUNT: usize = 20;
/// Area lights packed into the forward light arrays.
pub const AREA_LIGHTS_FORWARD_MAX_COUNT: usize = 5;
/// Tube lights packed into the forward light arrays.
pub const TUBE_LIGHTS_FORWARD_MAX_COUNT: usize = 20;

/// Technique used to render point light shadows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointLightShadowTechnique {
    /// One six-layer cube map per light, stored in a cube map array
    #[default]
    CubeMapArray,
    /// Front and back paraboloid layers per light, stored in a 2D array
    DualParaboloid,
}

/// Configuration for the renderer
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Initial render width
    pub width: u32,
    /// Initial render height
    pub height: u32,
    /// Enable vsync on surface backends
    pub vsync: bool,
    /// Tile size for the tiled point light pass (in pixels)
    pub tile_size: u32,
    /// Capacity of the GPU point light buffer before it has to grow
    pub max_point_lights: u32,
    /// Show the G-Buffer albedo directly and skip shadow rendering
    pub use_direct_texture_output: bool,
    /// Enable reflections / global illumination
    pub use_gi: bool,
    /// Enable screen-space ambient occlusion
    pub use_ambient_occlusion: bool,
    /// Enable directional light volumetric scattering
    pub scattering: bool,
    /// Adapt exposure from the scene luminance
    pub auto_exposure: bool,
    /// Enable camera motion blur
    pub motion_blur: bool,
    /// Point light shadow technique
    pub point_light_shadow_technique: PointLightShadowTechnique,
    /// Directional shadow map resolution
    pub directional_shadow_resolution: u32,
    /// Point light shadow map resolution (per face)
    pub point_shadow_resolution: u32,
    /// Use a single multi-draw indirect call when the backend supports it
    pub multi_draw_indirect: bool,
    /// Collect per-stage timings into the draw result
    pub profiling: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            tile_size: 16,
            max_point_lights: 1024,
            use_direct_texture_output: false,
            use_gi: true,
            use_ambient_occlusion: true,
            scattering: true,
            auto_exposure: true,
            motion_blur: true,
            point_light_shadow_technique: PointLightShadowTechnique::CubeMapArray,
            directional_shadow_resolution: 2048,
            point_shadow_resolution: 256,
            multi_draw_indirect: true,
            profiling: false,
        }
    }
}

impl RenderConfig {
    /// Number of tiles covering the render target, with the tile size clamped to 1..=16
    pub fn tile_count(&self) -> (u32, u32) {
        let tile = self.tile_size.clamp(1, 16);
        (self.width.div_ceil(tile), self.height.div_ceil(tile))
    }

    /// Half resolution used by the ambient occlusion / scattering pass
    pub fn half_resolution(&self) -> (u32, u32) {
        ((self.width / 2).max(1), (self.height / 2).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_count_rounds_up() {
        let config = RenderConfig {
            width: 1281,
            height: 720,
            ..Default::default()
        };
        assert_eq!(config.tile_count(), (81, 45));
    }

    #[test]
    fn test_half_resolution_never_zero() {
        let config = RenderConfig {
            width: 1,
            height: 1,
            ..Default::default()
        };
        assert_eq!(config.half_resolution(), (1, 1));
    }
}
