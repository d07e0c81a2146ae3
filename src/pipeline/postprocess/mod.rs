//! Post-processing of the combined HDR image

mod exposure;
mod tonemapping;

pub use exposure::{AutoExposure, EXPOSURE_SHADER};
pub use tonemapping::{Tonemapping, TONEMAP_SHADER};

use crate::backend::{GraphicsBackend, TextureFormat, TextureViewHandle};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::RenderConfig;

use super::targets::FrameTargets;

/// Auto exposure followed by tone mapping into the frame output
pub struct PostProcess {
    exposure: AutoExposure,
    tonemapping: Tonemapping,
}

impl PostProcess {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B) -> RenderResult<Self> {
        Ok(Self {
            exposure: AutoExposure::new(backend)?,
            tonemapping: Tonemapping::new(backend)?,
        })
    }

    pub fn begin_frame(&mut self) {
        self.exposure.begin_frame();
        self.tonemapping.begin_frame();
    }

    /// Write the final image into `output`
    pub fn execute<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        targets: &FrameTargets,
        output: (TextureViewHandle, TextureFormat),
        state: &RenderState,
        config: &RenderConfig,
    ) -> RenderResult<()> {
        self.exposure
            .update(ctx.backend_mut(), &targets.hdr, config.auto_exposure)?;
        self.tonemapping.execute(
            ctx,
            targets,
            output,
            self.exposure.buffer(),
            state,
            config,
        )
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.exposure.destroy(backend);
        self.tonemapping.destroy(backend);
    }
}
