//! End-to-end frame tests for the deferred pipeline.
//!
//! Parameterized with `rstest` over the recording backend and headless wgpu.
//! The wgpu cases skip themselves on machines without an adapter.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use deferred_renderer::light::PointLight;
use deferred_renderer::scene::Transform;
use deferred_renderer::{FrameHandoff, RenderConfig, RenderError, RenderState};
use glam::Vec3;
use rstest::rstest;

use common::{recording_harness, run_frames, test_config, Backend};

#[rstest]
#[case::recording(Backend::Recording)]
#[case::wgpu(Backend::Wgpu)]
fn test_static_scene_reuses_shadow_maps(#[case] backend: Backend) {
    let Some(results) = run_frames(backend, 3) else {
        return;
    };
    assert_eq!(results[0].shadow_maps_rendered, 1);
    for result in &results {
        assert_eq!(result.entities_drawn, 1);
        assert_eq!(result.vertices_drawn, 36);
    }
    assert_eq!(results[1].shadow_maps_rendered, 0);
    assert_eq!(results[2].shadow_maps_rendered, 0);
}

#[rstest]
#[case::everything(test_config(), &["Ambient", "Reflections"])]
#[case::no_gi(
    RenderConfig { use_gi: false, ..test_config() },
    &["Ambient", "Reflection Clear"]
)]
#[case::no_ambient(
    RenderConfig { use_ambient_occlusion: false, scattering: false, ..test_config() },
    &["Ambient Clear", "Reflections"]
)]
fn test_disabled_stages_clear_their_targets(
    #[case] config: RenderConfig,
    #[case] expected: &[&str],
) {
    let mut harness = recording_harness(config);
    harness.frame();
    let labels = harness.ctx.backend().render_pass_labels();
    for label in expected {
        assert!(labels.contains(label), "{label} missing from {labels:?}");
    }
    assert_eq!(labels.last(), Some(&"Post Process"));
}

#[test]
fn test_moving_the_cube_redraws_its_shadow() {
    let mut harness = recording_harness(test_config());
    harness.frame();
    assert_eq!(harness.frame().shadow_maps_rendered, 0);

    let cube = harness.cube;
    harness
        .scene
        .set_transform(cube, Transform::from_position(Vec3::new(1.0, 0.0, -5.0)));
    assert_eq!(harness.frame().shadow_maps_rendered, 1);
}

#[test]
fn test_point_light_shadows_render_once() {
    let mut harness = recording_harness(test_config());
    harness.scene.spawn_point_light(
        Transform::from_position(Vec3::new(0.0, 2.0, -5.0)),
        PointLight::new(Vec3::ONE, 4.0, 10.0),
    );
    // Sun plus one cube map
    assert_eq!(harness.frame().shadow_maps_rendered, 2);
    assert_eq!(harness.frame().shadow_maps_rendered, 0);
}

#[test]
fn test_handoff_applies_backpressure() {
    let mut harness = recording_harness(test_config());
    let (mut producer, mut consumer) = FrameHandoff::new::<RenderState>();

    let first = harness.extract();
    assert!(producer.try_submit(first).is_ok());
    // The renderer has not drawn the first state yet
    let second = harness.extract();
    let second = producer.try_submit(second).unwrap_err();
    assert_eq!(second.cycle, 2);

    let state = consumer.acquire().expect("submitted state").clone();
    assert_eq!(state.cycle, 1);
    harness.draw(&state);
    consumer.finish();

    assert!(producer.try_submit(second).is_ok());
    assert_eq!(consumer.acquire().map(|state| state.cycle), Some(2));
}

#[test]
fn test_gpu_tasks_run_before_the_frame() {
    let mut harness = recording_harness(test_config());
    let sender = harness.ctx.task_sender();
    let ran = Arc::new(AtomicUsize::new(0));

    let worker = {
        let ran = ran.clone();
        thread::spawn(move || {
            for _ in 0..3 {
                let ran = ran.clone();
                sender
                    .execute(move |_ctx| {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
        })
    };
    worker.join().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    harness.frame();
    assert_eq!(ran.load(Ordering::SeqCst), 3);
}

#[test]
fn test_waiting_on_the_gpu_thread_is_refused() {
    let harness = recording_harness(test_config());
    let err = harness
        .ctx
        .task_sender()
        .execute_and_wait(|_ctx| ())
        .unwrap_err();
    assert!(matches!(err, RenderError::WouldDeadlock));
}
