//! Shared setup for the frame pipeline integration tests.

use deferred_renderer::backend::GraphicsBackend;
use deferred_renderer::light::{DirectionalLight, LightManager};
use deferred_renderer::resources::Mesh;
use deferred_renderer::scene::{Model, Transform};
use deferred_renderer::{
    DrawResult, DrawStrategy, RecordingBackend, RenderConfig, RenderContext, RenderState, Scene,
    WgpuBackend,
};
use bevy_ecs::entity::Entity;
use glam::Vec3;

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 32;

/// Backends the integration tests can run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Records commands without touching a GPU, always available
    Recording,
    /// Headless wgpu, skipped when no adapter is found
    Wgpu,
}

/// Small targets so the tests stay fast on real hardware
pub fn test_config() -> RenderConfig {
    RenderConfig {
        width: WIDTH,
        height: HEIGHT,
        directional_shadow_resolution: 64,
        point_shadow_resolution: 16,
        max_point_lights: 16,
        ..Default::default()
    }
}

/// A renderer plus a scene holding one cube in front of the camera and a sun
pub struct Harness<B: GraphicsBackend + 'static> {
    pub ctx: RenderContext<B>,
    pub strategy: DrawStrategy,
    pub scene: Scene,
    pub lights: LightManager,
    pub cube: Entity,
    pub cycle: u64,
}

impl<B: GraphicsBackend + 'static> Harness<B> {
    pub fn new(backend: B, config: RenderConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let technique = config.point_light_shadow_technique;
        let mut ctx = RenderContext::new(backend, config);
        let mut strategy = DrawStrategy::new(&mut ctx).expect("draw strategy");

        let mesh = Mesh::cube();
        let geometry = strategy.upload_mesh(&mut ctx, &mesh).expect("cube upload");
        let mut scene = Scene::new();
        let cube = scene.spawn_model(
            Transform::from_position(Vec3::new(0.0, 0.0, -5.0)),
            Model {
                geometry,
                material_index: 0,
                local_bounds: mesh.bounds().unwrap_or_default(),
            },
        );
        scene.spawn_directional_light(Transform::default(), DirectionalLight::default());

        Self {
            ctx,
            strategy,
            scene,
            lights: LightManager::new(technique),
            cube,
            cycle: 0,
        }
    }

    /// Snapshot the scene for the next cycle
    pub fn extract(&mut self) -> RenderState {
        self.cycle += 1;
        RenderState::extract(&mut self.scene, &mut self.lights, self.cycle)
    }

    pub fn draw(&mut self, state: &RenderState) -> DrawResult {
        self.strategy
            .draw(&mut self.ctx, None, state)
            .expect("frame draw")
    }

    pub fn frame(&mut self) -> DrawResult {
        let state = self.extract();
        self.draw(&state)
    }
}

pub fn recording_harness(config: RenderConfig) -> Harness<RecordingBackend> {
    Harness::new(RecordingBackend::new(WIDTH, HEIGHT), config)
}

/// Run `frames` frames on `backend`, `None` when it is unavailable here
pub fn run_frames(backend: Backend, frames: usize) -> Option<Vec<DrawResult>> {
    match backend {
        Backend::Recording => {
            let mut harness = recording_harness(test_config());
            Some((0..frames).map(|_| harness.frame()).collect())
        }
        Backend::Wgpu => {
            let wgpu = match WgpuBackend::new_headless(WIDTH, HEIGHT) {
                Ok(wgpu) => wgpu,
                Err(err) => {
                    eprintln!("No wgpu adapter ({err}), skipping");
                    return None;
                }
            };
            let mut harness = Harness::new(wgpu, test_config());
            Some((0..frames).map(|_| harness.frame()).collect())
        }
    }
}
