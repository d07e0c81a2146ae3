//! Flat float arrays for forward-lit materials

use super::types::{GpuAreaLight, GpuPointLight, GpuTubeLight};
use crate::{AREA_LIGHTS_FORWARD_MAX_COUNT, POINT_LIGHTS_FORWARD_MAX_COUNT, TUBE_LIGHTS_FORWARD_MAX_COUNT};

/// Floats per point light: position, radius, color, intensity
pub const POINT_LIGHT_FLOATS: usize = 8;
/// Floats per area light: position, range, forward, width, right, height, color, intensity
pub const AREA_LIGHT_FLOATS: usize = 16;
/// Floats per tube light: start, radius, end, length, color, intensity
pub const TUBE_LIGHT_FLOATS: usize = 12;

/// Light parameters packed for the forward path
///
/// Lights past the per-type cap are left out; they still reach the deferred path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardLights {
    pub point: Vec<f32>,
    pub area: Vec<f32>,
    pub tube: Vec<f32>,
}

impl ForwardLights {
    pub fn pack(point: &[GpuPointLight], area: &[GpuAreaLight], tube: &[GpuTubeLight]) -> Self {
        let dropped = point.len().saturating_sub(POINT_LIGHTS_FORWARD_MAX_COUNT)
            + area.len().saturating_sub(AREA_LIGHTS_FORWARD_MAX_COUNT)
            + tube.len().saturating_sub(TUBE_LIGHTS_FORWARD_MAX_COUNT);
        if dropped > 0 {
            log::debug!("{dropped} lights exceed the forward caps and were left out");
        }

        let mut packed = Self {
            point: Vec::with_capacity(point.len().min(POINT_LIGHTS_FORWARD_MAX_COUNT) * POINT_LIGHT_FLOATS),
            area: Vec::with_capacity(area.len().min(AREA_LIGHTS_FORWARD_MAX_COUNT) * AREA_LIGHT_FLOATS),
            tube: Vec::with_capacity(tube.len().min(TUBE_LIGHTS_FORWARD_MAX_COUNT) * TUBE_LIGHT_FLOATS),
        };
        for light in point.iter().take(POINT_LIGHTS_FORWARD_MAX_COUNT) {
            packed.point.extend_from_slice(&light.position_radius.to_array());
            packed.point.extend_from_slice(&light.color_intensity.to_array());
        }
        for light in area.iter().take(AREA_LIGHTS_FORWARD_MAX_COUNT) {
            packed.area.extend_from_slice(&light.position_range.to_array());
            packed.area.extend_from_slice(&light.forward_width.to_array());
            packed.area.extend_from_slice(&light.right_height.to_array());
            packed.area.extend_from_slice(&light.color_intensity.to_array());
        }
        for light in tube.iter().take(TUBE_LIGHTS_FORWARD_MAX_COUNT) {
            packed.tube.extend_from_slice(&light.start_radius.to_array());
            packed.tube.extend_from_slice(&light.end_length.to_array());
            packed.tube.extend_from_slice(&light.color_intensity.to_array());
        }
        packed
    }

    pub fn point_count(&self) -> usize {
        self.point.len() / POINT_LIGHT_FLOATS
    }

    pub fn area_count(&self) -> usize {
        self.area.len() / AREA_LIGHT_FLOATS
    }

    pub fn tube_count(&self) -> usize {
        self.tube.len() / TUBE_LIGHT_FLOATS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use glam::Vec4;

    #[test]
    fn test_excess_lights_are_dropped() {
        let points = vec![GpuPointLight::zeroed(); POINT_LIGHTS_FORWARD_MAX_COUNT + 3];
        let areas = vec![GpuAreaLight::zeroed(); AREA_LIGHTS_FORWARD_MAX_COUNT + 1];
        let packed = ForwardLights::pack(&points, &areas, &[]);
        assert_eq!(packed.point_count(), POINT_LIGHTS_FORWARD_MAX_COUNT);
        assert_eq!(packed.area_count(), AREA_LIGHTS_FORWARD_MAX_COUNT);
        assert_eq!(packed.tube_count(), 0);
    }

    #[test]
    fn test_point_layout() {
        let mut light = GpuPointLight::zeroed();
        light.position_radius = Vec4::new(1.0, 2.0, 3.0, 4.0);
        light.color_intensity = Vec4::new(0.5, 0.6, 0.7, 8.0);
        let packed = ForwardLights::pack(&[light], &[], &[]);
        assert_eq!(packed.point, vec![1.0, 2.0, 3.0, 4.0, 0.5, 0.6, 0.7, 8.0]);
    }
}
