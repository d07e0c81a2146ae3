//! Light components
//!
//! Every light holds a [`Camera`] by value. The camera follows the owning entity's
//! world transform and supplies the frustum and the shadow view-projection.

use bevy_ecs::prelude::*;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use super::{CastsShadow, HasFrustum};
use crate::camera::Camera;
use crate::frustum::Aabb;
use crate::PointLightShadowTechnique;

/// Near plane of point and area light shadow cameras
pub const SHADOW_NEAR_PLANE: f32 = 0.05;

/// Field of view of area light shadow cameras, in degrees
pub const AREA_LIGHT_FOV_DEGREES: f32 = 90.0;

/// Unit cube centred on the origin, scaled by the volume matrices
fn unit_cube() -> Aabb {
    Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))
}

fn rigid(world: &Mat4) -> Mat4 {
    let (_, rotation, translation) = world.to_scale_rotation_translation();
    Mat4::from_rotation_translation(rotation, translation)
}

/// Directional light (the sun)
///
/// Shines along the owning entity's -Z axis. The shadow camera is an orthographic
/// box that follows the main camera on a coarse grid.
#[derive(Component, Debug, Clone)]
pub struct DirectionalLight {
    pub color: Vec3,
    pub intensity: f32,
    pub scatter: f32,
    pub casts_shadow: bool,
    camera: Camera,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self::new(Vec3::ONE, 1.0)
    }
}

impl DirectionalLight {
    /// Half width and half height of the shadow box
    pub const SHADOW_HALF_EXTENT: f32 = 1000.0;
    /// Half depth of the shadow box
    pub const SHADOW_HALF_DEPTH: f32 = 2500.0;
    /// Shadow box centre snaps to multiples of this, so small camera moves keep the map
    pub const SHADOW_SNAP: f32 = 100.0;

    pub fn new(color: Vec3, intensity: f32) -> Self {
        Self {
            color,
            intensity,
            scatter: 1.0,
            casts_shadow: true,
            camera: Camera::orthographic(
                2.0 * Self::SHADOW_HALF_EXTENT,
                2.0 * Self::SHADOW_HALF_EXTENT,
                -Self::SHADOW_HALF_DEPTH,
                Self::SHADOW_HALF_DEPTH,
            ),
        }
    }

    pub fn with_scatter(mut self, scatter: f32) -> Self {
        self.scatter = scatter;
        self
    }

    pub fn direction(&self) -> Vec3 {
        self.camera.forward()
    }

    /// Snapped shadow box centre for a viewer at `eye`
    pub fn snapped_center(eye: Vec3) -> Vec3 {
        (eye / Self::SHADOW_SNAP).round() * Self::SHADOW_SNAP
    }

    /// Take the rotation from `world` and centre the shadow box on `center`
    pub fn update_camera(&mut self, world: &Mat4, center: Vec3) {
        let (_, rotation, _) = world.to_scale_rotation_translation();
        self.camera.set_rotation(rotation);
        self.camera.set_position(center);
    }

    pub fn view_projection(&mut self) -> Mat4 {
        self.camera.view_projection_matrix()
    }

    pub fn to_gpu(&mut self) -> GpuDirectionalLight {
        GpuDirectionalLight {
            view_projection: self.view_projection(),
            direction_scatter: self.direction().extend(self.scatter),
            color_intensity: self.color.extend(self.intensity),
        }
    }
}

/// Directions and up vectors of the six cube faces, in layer order
const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
];

/// Point light
#[derive(Component, Debug, Clone)]
pub struct PointLight {
    pub color: Vec3,
    pub intensity: f32,
    pub scatter: f32,
    pub casts_shadow: bool,
    radius: f32,
    camera: Camera,
}

impl Default for PointLight {
    fn default() -> Self {
        Self::new(Vec3::ONE, 1.0, 10.0)
    }
}

impl PointLight {
    pub fn new(color: Vec3, intensity: f32, radius: f32) -> Self {
        Self {
            color,
            intensity,
            scatter: 0.0,
            casts_shadow: true,
            radius,
            camera: Camera::perspective(90.0, 1.0, SHADOW_NEAR_PLANE, radius),
        }
    }

    pub fn with_shadow(mut self, casts_shadow: bool) -> Self {
        self.casts_shadow = casts_shadow;
        self
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn set_radius(&mut self, radius: f32) {
        self.radius = radius;
        self.camera.set_near_far(SHADOW_NEAR_PLANE, radius);
    }

    pub fn position(&self) -> Vec3 {
        self.camera.position()
    }

    pub fn update_camera(&mut self, world: &Mat4) {
        self.camera.set_position(world.w_axis.truncate());
    }

    /// View-projection of each cube face, in +X, -X, +Y, -Y, +Z, -Z order
    pub fn cube_face_view_projections(&mut self) -> [Mat4; 6] {
        let projection = self.camera.projection_matrix();
        let eye = self.camera.position();
        CUBE_FACES.map(|(dir, up)| projection * Mat4::look_to_rh(eye, dir, up))
    }

    /// Front (-Z) and back (+Z) paraboloid views; the paraboloid warp happens in the shader
    pub fn paraboloid_views(&self) -> [Mat4; 2] {
        let eye = self.camera.position();
        [
            Mat4::look_to_rh(eye, Vec3::NEG_Z, Vec3::Y),
            Mat4::look_to_rh(eye, Vec3::Z, Vec3::Y),
        ]
    }

    pub fn world_aabb(&self) -> Aabb {
        Aabb::from_center_half_extents(self.position(), Vec3::splat(self.radius))
    }

    pub fn to_gpu(&self, shadow_index: i32) -> GpuPointLight {
        GpuPointLight {
            position_radius: self.position().extend(self.radius),
            color_intensity: self.color.extend(self.intensity),
            shadow_index,
            scatter: self.scatter,
            _padding: [0.0; 2],
        }
    }
}

/// Capsule-shaped light along the entity's local X axis
#[derive(Component, Debug, Clone)]
pub struct TubeLight {
    pub color: Vec3,
    pub intensity: f32,
    pub scatter: f32,
    length: f32,
    radius: f32,
    camera: Camera,
}

impl Default for TubeLight {
    fn default() -> Self {
        Self::new(Vec3::ONE, 1.0, 4.0, 1.0)
    }
}

impl TubeLight {
    pub fn new(color: Vec3, intensity: f32, length: f32, radius: f32) -> Self {
        let mut light = Self {
            color,
            intensity,
            scatter: 0.0,
            length,
            radius,
            camera: Camera::default(),
        };
        light.sync_camera_extents();
        light
    }

    // The camera box is the light volume itself
    fn sync_camera_extents(&mut self) {
        let (width, height) = self.volume_extents();
        self.camera.set_projection(crate::camera::Projection::orthographic(
            width,
            height,
            -self.radius,
            self.radius,
        ));
    }

    fn volume_extents(&self) -> (f32, f32) {
        (self.length + 2.0 * self.radius, 2.0 * self.radius)
    }

    pub fn length(&self) -> f32 {
        self.length
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn set_size(&mut self, length: f32, radius: f32) {
        self.length = length;
        self.radius = radius;
        self.sync_camera_extents();
    }

    pub fn update_camera(&mut self, world: &Mat4) {
        self.camera.set_world_matrix(world);
    }

    /// Start and end of the tube axis
    pub fn endpoints(&self) -> (Vec3, Vec3) {
        let half = self.camera.right() * (self.length * 0.5);
        let center = self.camera.position();
        (center - half, center + half)
    }

    /// Maps the unit cube onto the capsule's bounding box
    pub fn volume_matrix(&self, world: &Mat4) -> Mat4 {
        let (width, height) = self.volume_extents();
        rigid(world) * Mat4::from_scale(Vec3::new(width, height, height))
    }

    pub fn world_aabb(&self, world: &Mat4) -> Aabb {
        unit_cube().transformed(&self.volume_matrix(world))
    }

    pub fn to_gpu(&self, world: &Mat4) -> GpuTubeLight {
        let (start, end) = self.endpoints();
        GpuTubeLight {
            volume: self.volume_matrix(world),
            start_radius: start.extend(self.radius),
            end_length: end.extend(self.length),
            color_intensity: self.color.extend(self.intensity),
            scatter: self.scatter,
            _padding: [0.0; 3],
        }
    }
}

/// Rectangular light emitting along the entity's -Z axis
#[derive(Component, Debug, Clone)]
pub struct AreaLight {
    pub color: Vec3,
    pub intensity: f32,
    pub scatter: f32,
    pub casts_shadow: bool,
    width: f32,
    height: f32,
    range: f32,
    camera: Camera,
}

impl Default for AreaLight {
    fn default() -> Self {
        Self::new(Vec3::ONE, 1.0, 2.0, 2.0, 20.0)
    }
}

impl AreaLight {
    pub fn new(color: Vec3, intensity: f32, width: f32, height: f32, range: f32) -> Self {
        Self {
            color,
            intensity,
            scatter: 0.0,
            casts_shadow: true,
            width,
            height,
            range,
            camera: Camera::perspective(AREA_LIGHT_FOV_DEGREES, 1.0, SHADOW_NEAR_PLANE, range),
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn range(&self) -> f32 {
        self.range
    }

    pub fn set_size(&mut self, width: f32, height: f32) {
        self.width = width;
        self.height = height;
    }

    pub fn set_range(&mut self, range: f32) {
        self.range = range;
        self.camera.set_near_far(SHADOW_NEAR_PLANE, range);
    }

    pub fn update_camera(&mut self, world: &Mat4) {
        self.camera.set_world_matrix(world);
    }

    /// Maps the unit cube onto the box the light reaches: its rectangle swept `range` along -Z
    pub fn volume_matrix(&self, world: &Mat4) -> Mat4 {
        rigid(world)
            * Mat4::from_translation(Vec3::new(0.0, 0.0, -self.range * 0.5))
            * Mat4::from_scale(Vec3::new(self.width, self.height, self.range))
    }

    pub fn world_aabb(&self, world: &Mat4) -> Aabb {
        unit_cube().transformed(&self.volume_matrix(world))
    }

    pub fn to_gpu(&mut self, world: &Mat4, shadow_index: i32) -> GpuAreaLight {
        GpuAreaLight {
            volume: self.volume_matrix(world),
            view_projection: self.camera.view_projection_matrix(),
            position_range: self.camera.position().extend(self.range),
            forward_width: self.camera.forward().extend(self.width),
            right_height: self.camera.right().extend(self.height),
            color_intensity: self.color.extend(self.intensity),
            shadow_index,
            scatter: self.scatter,
            _padding: [0.0; 2],
        }
    }
}

impl HasFrustum for DirectionalLight {
    fn camera(&self) -> &Camera {
        &self.camera
    }

    fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }
}

impl HasFrustum for PointLight {
    fn camera(&self) -> &Camera {
        &self.camera
    }

    fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    // The 90 degree camera covers one face only
    fn sphere_in_light_frustum(&mut self, center: Vec3, radius: f32) -> bool {
        center.distance(self.position()) <= self.radius + radius
    }
}

impl HasFrustum for TubeLight {
    fn camera(&self) -> &Camera {
        &self.camera
    }

    fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }
}

impl HasFrustum for AreaLight {
    fn camera(&self) -> &Camera {
        &self.camera
    }

    fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }
}

impl CastsShadow for DirectionalLight {
    fn casts_shadow(&self) -> bool {
        self.casts_shadow
    }

    fn shadow_layers(&self, _technique: PointLightShadowTechnique) -> u32 {
        1
    }

    fn shadow_view_projections(&mut self, _technique: PointLightShadowTechnique) -> Vec<Mat4> {
        vec![self.view_projection()]
    }
}

impl CastsShadow for PointLight {
    fn casts_shadow(&self) -> bool {
        self.casts_shadow
    }

    fn shadow_layers(&self, technique: PointLightShadowTechnique) -> u32 {
        match technique {
            PointLightShadowTechnique::CubeMapArray => 6,
            PointLightShadowTechnique::DualParaboloid => 2,
        }
    }

    fn shadow_view_projections(&mut self, technique: PointLightShadowTechnique) -> Vec<Mat4> {
        match technique {
            PointLightShadowTechnique::CubeMapArray => self.cube_face_view_projections().to_vec(),
            PointLightShadowTechnique::DualParaboloid => self.paraboloid_views().to_vec(),
        }
    }
}

impl CastsShadow for AreaLight {
    fn casts_shadow(&self) -> bool {
        self.casts_shadow
    }

    fn shadow_layers(&self, _technique: PointLightShadowTechnique) -> u32 {
        1
    }

    fn shadow_view_projections(&mut self, _technique: PointLightShadowTechnique) -> Vec<Mat4> {
        vec![self.camera.view_projection_matrix()]
    }
}

/// Directional light as the lighting shaders read it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuDirectionalLight {
    pub view_projection: Mat4,
    /// xyz = direction, w = scatter
    pub direction_scatter: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
}

/// Point light entry of the tiled lighting buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuPointLight {
    /// xyz = position, w = radius
    pub position_radius: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// Layer in the shadow array, -1 for none
    pub shadow_index: i32,
    pub scatter: f32,
    pub _padding: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuTubeLight {
    pub volume: Mat4,
    /// xyz = start, w = radius
    pub start_radius: Vec4,
    /// xyz = end, w = length
    pub end_length: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    pub scatter: f32,
    pub _padding: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuAreaLight {
    pub volume: Mat4,
    pub view_projection: Mat4,
    /// xyz = position, w = range
    pub position_range: Vec4,
    /// xyz = forward, w = width
    pub forward_width: Vec4,
    /// xyz = right, w = height
    pub right_height: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// Layer in the shadow array, -1 for none
    pub shadow_index: i32,
    pub scatter: f32,
    pub _padding: [f32; 2],
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_cube_faces_look_along_axes() {
        let mut light = PointLight::new(Vec3::ONE, 1.0, 10.0);
        light.update_camera(&Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        let faces = light.cube_face_view_projections();
        for (matrix, (dir, _)) in faces.iter().zip(CUBE_FACES) {
            // A point five units along the face direction lands in the middle of the face
            let clip = *matrix * (Vec3::new(1.0, 2.0, 3.0) + dir * 5.0).extend(1.0);
            let ndc = clip.truncate() / clip.w;
            assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4, "{dir:?} -> {ndc:?}");
            assert!((0.0..=1.0).contains(&ndc.z));
        }
    }

    #[test]
    fn test_area_light_volume_extends_forward() {
        let light = AreaLight::new(Vec3::ONE, 1.0, 2.0, 4.0, 10.0);
        let aabb = light.world_aabb(&Mat4::IDENTITY);
        assert!(aabb.min.abs_diff_eq(Vec3::new(-1.0, -2.0, -10.0), 1e-5));
        assert!(aabb.max.abs_diff_eq(Vec3::new(1.0, 2.0, 0.0), 1e-5));
    }

    #[test]
    fn test_tube_endpoints_follow_rotation() {
        let mut light = TubeLight::new(Vec3::ONE, 1.0, 4.0, 0.5);
        let world = Mat4::from_rotation_translation(
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            Vec3::new(0.0, 0.0, -3.0),
        );
        light.update_camera(&world);
        let (start, end) = light.endpoints();
        assert!(start.abs_diff_eq(Vec3::new(0.0, -2.0, -3.0), 1e-5));
        assert!(end.abs_diff_eq(Vec3::new(0.0, 2.0, -3.0), 1e-5));
        let aabb = light.world_aabb(&world);
        assert!(aabb.contains_point(Vec3::new(0.0, 2.4, -3.0)));
        assert!(!aabb.contains_point(Vec3::new(0.0, 2.6, -3.0)));
    }

    #[test]
    fn test_directional_snap_ignores_small_moves() {
        let a = DirectionalLight::snapped_center(Vec3::new(10.0, 0.0, 20.0));
        let b = DirectionalLight::snapped_center(Vec3::new(30.0, 0.0, -40.0));
        assert_eq!(a, b);
        assert_ne!(a, DirectionalLight::snapped_center(Vec3::new(160.0, 0.0, 0.0)));
    }

    #[test]
    fn test_point_light_shadow_layers_per_technique() {
        let mut light = PointLight::default();
        assert_eq!(light.shadow_layers(PointLightShadowTechnique::CubeMapArray), 6);
        assert_eq!(
            light.shadow_view_projections(PointLightShadowTechnique::DualParaboloid).len(),
            2
        );
    }
}
