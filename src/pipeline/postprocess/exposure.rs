//! Eye adaptation
//!
//! The running exposure lives in a one-element storage buffer that stays on the
//! GPU between frames. Each frame a single invocation reads the average
//! luminance from the smallest HDR mip and moves the exposure towards its
//! target.

use bytemuck::{Pod, Zeroable};

use crate::backend::{BufferHandle, BufferUsage, GraphicsBackend};
use crate::error::RenderResult;
use crate::profiling::profile_scope;
use crate::program::Program;
use crate::resources::{PersistentBuffer, RenderTarget};
use crate::pipeline::targets::HDR;

const KEY_VALUE: f32 = 0.18;
const ADAPTATION_RATE: f32 = 0.05;
const MIN_EXPOSURE: f32 = 0.05;
const MAX_EXPOSURE: f32 = 8.0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ExposureParams {
    key_value: f32,
    adaptation_rate: f32,
    min_exposure: f32,
    max_exposure: f32,
}

pub struct AutoExposure {
    program: Program,
    exposure: PersistentBuffer<f32>,
    /// Whether the buffer currently holds the fixed exposure of 1
    fixed: bool,
}

impl AutoExposure {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B) -> RenderResult<Self> {
        let program = Program::compute(backend, "auto_exposure", EXPOSURE_SHADER, "cs_main")?;
        let mut exposure = PersistentBuffer::new(backend, "exposure", 1, BufferUsage::STORAGE)?;
        exposure.put(backend, 0, &[1.0])?;
        Ok(Self {
            program,
            exposure,
            fixed: true,
        })
    }

    /// Storage buffer holding the current exposure
    pub fn buffer(&self) -> BufferHandle {
        self.exposure.buffer()
    }

    pub fn begin_frame(&mut self) {
        self.program.begin_frame();
    }

    pub fn update<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        hdr: &RenderTarget,
        enabled: bool,
    ) -> RenderResult<()> {
        profile_scope!("auto_exposure");
        if !enabled {
            if !self.fixed {
                log::debug!("Auto exposure off, resetting exposure to 1");
                self.exposure.put(backend, 0, &[1.0])?;
                self.fixed = true;
            }
            return Ok(());
        }

        self.program.set_uniform_block(&ExposureParams {
            key_value: KEY_VALUE,
            adaptation_rate: ADAPTATION_RATE,
            min_exposure: MIN_EXPOSURE,
            max_exposure: MAX_EXPOSURE,
        })?;
        self.program.bind_texture(1, hdr.view(HDR)?);
        self.program.bind_storage_buffer(2, self.exposure.buffer());

        backend.begin_compute_pass(Some("Auto Exposure"));
        let result = self
            .program
            .use_program(backend)
            .and_then(|_| self.program.dispatch_compute(backend, 1, 1, 1));
        backend.end_compute_pass();
        result?;
        self.fixed = false;
        Ok(())
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.program.destroy(backend);
        self.exposure.destroy(backend);
    }
}

pub const EXPOSURE_SHADER: &str = r#"
struct ExposureParams {
    key_value: f32,
    adaptation_rate: f32,
    min_exposure: f32,
    max_exposure: f32,
}

@group(0) @binding(0) var<uniform> params: ExposureParams;
@group(0) @binding(1) var hdr: texture_2d<f32>;
@group(0) @binding(2) var<storage, read_write> exposure: array<f32>;

@compute @workgroup_size(1, 1, 1)
fn cs_main() {
    let level = i32(textureNumLevels(hdr)) - 1;
    let size = vec2<i32>(textureDimensions(hdr, level));
    var luminance = 0.0;
    for (var y = 0; y < size.y; y++) {
        for (var x = 0; x < size.x; x++) {
            let color = textureLoad(hdr, vec2<i32>(x, y), level).rgb;
            luminance += dot(color, vec3<f32>(0.2126, 0.7152, 0.0722));
        }
    }
    luminance = max(luminance / f32(size.x * size.y), 0.0001);
    let target_exposure = clamp(params.key_value / luminance, params.min_exposure, params.max_exposure);
    exposure[0] = mix(exposure[0], target_exposure, params.adaptation_rate);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordedCommand;
    use crate::backend::RecordingBackend;
    use crate::pipeline::FrameTargets;
    use crate::program::reflect;

    #[test]
    fn test_shader_validates() {
        let reflection = reflect("auto_exposure", EXPOSURE_SHADER).unwrap();
        assert_eq!(reflection.workgroup_size, Some([1, 1, 1]));
        assert_eq!(reflection.uniform_size, std::mem::size_of::<ExposureParams>());
    }

    #[test]
    fn test_disabled_exposure_stays_at_one() {
        let mut backend = RecordingBackend::new(8, 8);
        let targets = FrameTargets::new(&mut backend, 8, 8).unwrap();
        let mut exposure = AutoExposure::new(&mut backend).unwrap();

        exposure.update(&mut backend, &targets.hdr, true).unwrap();
        assert_eq!(backend.compute_pass_labels(), ["Auto Exposure"]);
        assert!(backend
            .commands()
            .contains(&RecordedCommand::Dispatch { x: 1, y: 1, z: 1 }));

        backend.clear_commands();
        exposure.update(&mut backend, &targets.hdr, false).unwrap();
        assert!(backend.compute_pass_labels().is_empty());
        assert_eq!(exposure.exposure.get_values(&mut backend, 0..1).unwrap(), [1.0]);
    }
}
