//! Render targets written and read by the frame stages

use crate::backend::{FilterMode, GraphicsBackend, TextureFormat};
use crate::error::RenderResult;
use crate::resources::RenderTarget;

pub const GBUFFER_POSITION: &str = "position";
pub const GBUFFER_NORMAL: &str = "normal";
pub const GBUFFER_ALBEDO: &str = "albedo";
pub const GBUFFER_MOTION: &str = "motion";
pub const LIGHT: &str = "light";
pub const TILED: &str = "tiled";
pub const AMBIENT: &str = "ambient";
pub const REFLECTION: &str = "reflection";
pub const HDR: &str = "hdr";

/// Every screen-sized target of the pipeline
///
/// The G-Buffer stores world position (w = 0 marks sky), world normal, albedo and
/// motion. The ambient target runs at half resolution and holds
/// (occlusion, scattering).
pub struct FrameTargets {
    pub gbuffer: RenderTarget,
    pub light: RenderTarget,
    pub tiled: RenderTarget,
    pub ambient: RenderTarget,
    pub reflection: RenderTarget,
    pub reflection_snapshot: RenderTarget,
    pub hdr: RenderTarget,
    width: u32,
    height: u32,
}

impl FrameTargets {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let (width, height) = (width.max(1), height.max(1));
        let (half_width, half_height) = half_size(width, height);
        Ok(Self {
            gbuffer: RenderTarget::builder("gbuffer", width, height)
                .color(GBUFFER_POSITION, TextureFormat::Rgba16Float, FilterMode::Nearest)
                .color(GBUFFER_NORMAL, TextureFormat::Rgba16Float, FilterMode::Nearest)
                .color(GBUFFER_ALBEDO, TextureFormat::Rgba8Unorm, FilterMode::Linear)
                .color(GBUFFER_MOTION, TextureFormat::Rgba16Float, FilterMode::Nearest)
                .depth(TextureFormat::Depth32Float)
                .build(backend)?,
            light: RenderTarget::builder("light_accumulation", width, height)
                .color(LIGHT, TextureFormat::Rgba16Float, FilterMode::Nearest)
                .build(backend)?,
            tiled: RenderTarget::builder("tiled_point_lights", width, height)
                .storage_color(TILED, TextureFormat::Rgba16Float)
                .build(backend)?,
            ambient: RenderTarget::builder("ambient", half_width, half_height)
                .color(AMBIENT, TextureFormat::Rg16Float, FilterMode::Linear)
                .build(backend)?,
            reflection: RenderTarget::builder("reflection", width, height)
                .color(REFLECTION, TextureFormat::Rgba16Float, FilterMode::Nearest)
                .build(backend)?,
            reflection_snapshot: RenderTarget::builder("reflection_snapshot", width, height)
                .color(REFLECTION, TextureFormat::Rgba16Float, FilterMode::Nearest)
                .build(backend)?,
            hdr: RenderTarget::builder("hdr", width, height)
                .color(HDR, TextureFormat::Rgba16Float, FilterMode::Linear)
                .mipmapped()
                .build(backend)?,
            width,
            height,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn resize<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let (width, height) = (width.max(1), height.max(1));
        let (half_width, half_height) = half_size(width, height);
        self.gbuffer.resize(backend, width, height)?;
        self.light.resize(backend, width, height)?;
        self.tiled.resize(backend, width, height)?;
        self.ambient.resize(backend, half_width, half_height)?;
        self.reflection.resize(backend, width, height)?;
        self.reflection_snapshot.resize(backend, width, height)?;
        self.hdr.resize(backend, width, height)?;
        self.width = width;
        self.height = height;
        log::debug!("Frame targets resized to {width}x{height}");
        Ok(())
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.gbuffer.destroy(backend);
        self.light.destroy(backend);
        self.tiled.destroy(backend);
        self.ambient.destroy(backend);
        self.reflection.destroy(backend);
        self.reflection_snapshot.destroy(backend);
        self.hdr.destroy(backend);
    }
}

fn half_size(width: u32, height: u32) -> (u32, u32) {
    ((width / 2).max(1), (height / 2).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    #[test]
    fn test_targets_follow_resize() {
        let mut backend = RecordingBackend::new(64, 32);
        let mut targets = FrameTargets::new(&mut backend, 64, 32).unwrap();
        assert_eq!(targets.ambient.size(), (32, 16));
        assert_eq!(targets.gbuffer.color_attachments().len(), 4);
        assert!(targets.gbuffer.depth_view().is_ok());

        targets.resize(&mut backend, 10, 7).unwrap();
        assert_eq!(targets.size(), (10, 7));
        assert_eq!(targets.hdr.size(), (10, 7));
        assert_eq!(targets.ambient.size(), (5, 3));
    }

    #[test]
    fn test_hdr_target_has_full_mip_chain() {
        let mut backend = RecordingBackend::new(64, 32);
        let targets = FrameTargets::new(&mut backend, 64, 32).unwrap();
        let hdr = targets.hdr.texture(HDR).unwrap();
        assert_eq!(backend.texture_descriptor(hdr).unwrap().mip_levels, 7);
    }
}
