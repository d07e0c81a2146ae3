//! Camera with lazily derived matrices and frustum
//!
//! All derived state (view, projection, their product and the frustum planes) sits
//! behind one dirty bit and is rebuilt in a single step on the next read, so a
//! reader never sees a projection that disagrees with the frustum.

use crate::frustum::{self, Frustum};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3, Vec4};

/// Camera projection type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        width: f32,
        height: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: 60f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    /// Symmetric orthographic volume `width` by `height` around the view axis
    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        Projection::Orthographic {
            width,
            height,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                width,
                height,
                near,
                far,
            } => {
                let (half_w, half_h) = (width * 0.5, height * 0.5);
                Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, near, far)
            }
        }
    }

    pub fn near(&self) -> f32 {
        match self {
            Projection::Perspective { near, .. } | Projection::Orthographic { near, .. } => *near,
        }
    }

    pub fn far(&self) -> f32 {
        match self {
            Projection::Perspective { far, .. } | Projection::Orthographic { far, .. } => *far,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Derived {
    view: Mat4,
    projection: Mat4,
    view_projection: Mat4,
    frustum: Frustum,
}

/// Camera for viewing the scene
///
/// Looks down its local -Z axis. Perspective and orthographic parameters are kept
/// side by side so switching between the two keeps both sets.
#[derive(Debug, Clone)]
pub struct Camera {
    position: Vec3,
    rotation: Quat,

    fov_y: f32,
    aspect: f32,
    ortho_width: f32,
    ortho_height: f32,
    near: f32,
    far: f32,
    orthographic: bool,

    dirty: bool,
    derived: Derived,
    last_view: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Projection::default())
    }
}

impl Camera {
    pub fn new(projection: Projection) -> Self {
        let mut camera = Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            fov_y: 60f32.to_radians(),
            aspect: 16.0 / 9.0,
            ortho_width: 2.0,
            ortho_height: 2.0,
            near: 0.1,
            far: 1000.0,
            orthographic: false,
            dirty: true,
            derived: Derived {
                view: Mat4::IDENTITY,
                projection: Mat4::IDENTITY,
                view_projection: Mat4::IDENTITY,
                frustum: Frustum::default(),
            },
            last_view: Mat4::IDENTITY,
        };
        camera.set_projection(projection);
        camera.last_view = camera.view_matrix();
        camera
    }

    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self::new(Projection::perspective(fov_y_degrees, aspect, near, far))
    }

    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        Self::new(Projection::orthographic(width, height, near, far))
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.set_position(position);
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.set_rotation(rotation);
        self
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.dirty = true;
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation.normalize();
        self.dirty = true;
    }

    /// Position and orientation from a world matrix (scale is dropped)
    pub fn set_world_matrix(&mut self, world: &Mat4) {
        let (_, rotation, translation) = world.to_scale_rotation_translation();
        self.position = translation;
        self.rotation = rotation.normalize();
        self.dirty = true;
    }

    /// Orient the camera towards `target`. Does nothing when `target` is the position.
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = target - self.position;
        if forward.length_squared() <= f32::EPSILON {
            return;
        }
        let view = Mat4::look_at_rh(self.position, target, up);
        let (_, rotation, _) = view.inverse().to_scale_rotation_translation();
        self.set_rotation(rotation);
    }

    pub fn projection(&self) -> Projection {
        if self.orthographic {
            Projection::Orthographic {
                width: self.ortho_width,
                height: self.ortho_height,
                near: self.near,
                far: self.far,
            }
        } else {
            Projection::Perspective {
                fov_y: self.fov_y,
                aspect: self.aspect,
                near: self.near,
                far: self.far,
            }
        }
    }

    pub fn set_projection(&mut self, projection: Projection) {
        match projection {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => {
                self.fov_y = fov_y;
                self.aspect = aspect;
                self.near = near;
                self.far = far;
                self.orthographic = false;
            }
            Projection::Orthographic {
                width,
                height,
                near,
                far,
            } => {
                self.ortho_width = width;
                self.ortho_height = height;
                self.near = near;
                self.far = far;
                self.orthographic = true;
            }
        }
        self.dirty = true;
    }

    pub fn is_orthographic(&self) -> bool {
        self.orthographic
    }

    pub fn set_orthographic(&mut self, orthographic: bool) {
        if self.orthographic != orthographic {
            self.orthographic = orthographic;
            self.dirty = true;
        }
    }

    pub fn fov_y(&self) -> f32 {
        self.fov_y
    }

    pub fn set_fov_y_degrees(&mut self, degrees: f32) {
        self.fov_y = degrees.to_radians();
        self.dirty = true;
    }

    pub fn set_aspect(&mut self, width: f32, height: f32) {
        if height > 0.0 {
            self.aspect = width / height;
            self.dirty = true;
        }
    }

    pub fn set_ortho_extents(&mut self, width: f32, height: f32) {
        self.ortho_width = width;
        self.ortho_height = height;
        self.dirty = true;
    }

    pub fn near(&self) -> f32 {
        self.near
    }

    pub fn far(&self) -> f32 {
        self.far
    }

    pub fn set_near_far(&mut self, near: f32, far: f32) {
        self.near = near;
        self.far = far;
        self.dirty = true;
    }

    /// Whether the next read will rebuild the derived matrices
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    fn derived(&mut self) -> &Derived {
        if self.dirty {
            let view = Mat4::from_rotation_translation(self.rotation, self.position).inverse();
            let projection = self.projection().matrix();
            let view_projection = projection * view;
            self.derived = Derived {
                view,
                projection,
                view_projection,
                frustum: Frustum::from_matrix(&view_projection),
            };
            self.dirty = false;
        }
        &self.derived
    }

    pub fn view_matrix(&mut self) -> Mat4 {
        self.derived().view
    }

    pub fn projection_matrix(&mut self) -> Mat4 {
        self.derived().projection
    }

    pub fn view_projection_matrix(&mut self) -> Mat4 {
        self.derived().view_projection
    }

    pub fn frustum(&mut self) -> Frustum {
        self.derived().frustum
    }

    /// Column-major view matrix
    pub fn view_matrix_as_buffer(&mut self) -> [f32; 16] {
        self.derived().view.to_cols_array()
    }

    /// Column-major projection matrix
    pub fn projection_matrix_as_buffer(&mut self) -> [f32; 16] {
        self.derived().projection.to_cols_array()
    }

    pub fn frustum_corners(&mut self) -> [Vec3; 8] {
        frustum::frustum_corners(&self.derived().view_projection)
    }

    pub fn sphere_in_frustum(&mut self, center: Vec3, radius: f32) -> bool {
        self.derived().frustum.sphere_in_frustum(center, radius)
    }

    /// View matrix as it was when [`Camera::end_frame`] was last called
    pub fn last_view_matrix(&self) -> Mat4 {
        self.last_view
    }

    pub fn end_frame(&mut self) {
        self.last_view = self.view_matrix();
    }

    /// Immutable snapshot for a frame state
    pub fn extract(&mut self) -> ExtractedCamera {
        let derived = *self.derived();
        ExtractedCamera {
            position: self.position,
            forward: self.forward(),
            view: derived.view,
            projection: derived.projection,
            view_projection: derived.view_projection,
            last_view: self.last_view,
            frustum: derived.frustum,
            near: self.near,
            far: self.far,
            orthographic: self.orthographic,
        }
    }
}

/// Camera state frozen for one frame
#[derive(Debug, Clone, Copy)]
pub struct ExtractedCamera {
    pub position: Vec3,
    pub forward: Vec3,
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub last_view: Mat4,
    pub frustum: Frustum,
    pub near: f32,
    pub far: f32,
    pub orthographic: bool,
}

impl Default for ExtractedCamera {
    fn default() -> Self {
        Camera::default().extract()
    }
}

impl ExtractedCamera {
    pub fn sphere_in_frustum(&self, center: Vec3, radius: f32) -> bool {
        self.frustum.sphere_in_frustum(center, radius)
    }

    pub fn frustum_corners(&self) -> [Vec3; 8] {
        frustum::frustum_corners(&self.view_projection)
    }

    /// Build camera uniform data for shaders
    pub fn uniform_data(&self) -> CameraUniformData {
        CameraUniformData {
            view: self.view,
            proj: self.projection,
            view_proj: self.view_projection,
            inv_view: self.view.inverse(),
            inv_proj: self.projection.inverse(),
            prev_view_proj: self.projection * self.last_view,
            position: self.position.extend(1.0),
            near_far: Vec4::new(self.near, self.far, 0.0, 0.0),
        }
    }
}

/// Camera uniform data for GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniformData {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
    pub inv_view: Mat4,
    pub inv_proj: Mat4,
    /// Previous frame's view with this frame's projection, for motion vectors
    pub prev_view_proj: Mat4,
    pub position: Vec4,
    pub near_far: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn scenario_camera() -> Camera {
        Camera::perspective(60.0, 1.0, 0.1, 100.0)
    }

    #[test]
    fn test_spheres_in_front_and_behind() {
        let mut camera = scenario_camera();
        assert!(camera.sphere_in_frustum(Vec3::new(0.0, 0.0, -1.0), 1.0));
        assert!(!camera.sphere_in_frustum(Vec3::new(0.0, 0.0, 1.0), 1.0));
    }

    #[test]
    fn test_half_turn_inverts_visibility() {
        let mut camera = scenario_camera();
        camera.set_rotation(Quat::from_rotation_y(PI));
        assert!(!camera.sphere_in_frustum(Vec3::new(0.0, 0.0, -1.0), 1.0));
        assert!(camera.sphere_in_frustum(Vec3::new(0.0, 0.0, 1.0), 1.0));
    }

    #[test]
    fn test_cache_rebuilt_only_when_dirty() {
        let mut camera = scenario_camera();
        let before = camera.projection_matrix_as_buffer();
        assert!(!camera.is_dirty());

        camera.set_fov_y_degrees(90.0);
        assert!(camera.is_dirty());
        let after = camera.projection_matrix_as_buffer();
        assert_ne!(before, after);
        assert!(!camera.is_dirty());
    }

    #[test]
    fn test_projection_switch_keeps_frustum_consistent() {
        let mut camera = scenario_camera();
        camera.set_ortho_extents(4.0, 4.0);
        camera.set_orthographic(true);

        let vp = camera.view_projection_matrix();
        assert_eq!(camera.frustum(), Frustum::from_matrix(&vp));
        // Outside the 4x4 ortho box even though a 60 degree cone would see it far away
        assert!(!camera.sphere_in_frustum(Vec3::new(10.0, 0.0, -50.0), 1.0));

        camera.set_orthographic(false);
        assert!(camera.sphere_in_frustum(Vec3::new(10.0, 0.0, -50.0), 1.0));
    }

    #[test]
    fn test_view_buffer_is_column_major() {
        let mut camera = scenario_camera().with_position(Vec3::new(1.0, 2.0, 3.0));
        let buffer = camera.view_matrix_as_buffer();
        // Translation lives in the last column
        let translation = Vec3::new(buffer[12], buffer[13], buffer[14]);
        assert!(translation.abs_diff_eq(Vec3::new(-1.0, -2.0, -3.0), 1e-5));
    }

    #[test]
    fn test_end_frame_stores_last_view() {
        let mut camera = scenario_camera();
        let first = camera.view_matrix();
        camera.set_position(Vec3::new(0.0, 0.0, 5.0));
        assert_eq!(camera.last_view_matrix(), first);

        camera.end_frame();
        assert_eq!(camera.last_view_matrix(), camera.view_matrix());
    }

    #[test]
    fn test_look_at_faces_target() {
        let mut camera = scenario_camera().with_position(Vec3::new(0.0, 0.0, 10.0));
        camera.look_at(Vec3::new(10.0, 0.0, 10.0), Vec3::Y);
        assert!(camera.forward().abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn test_frustum_corners_span_near_and_far() {
        let mut camera = scenario_camera();
        let corners = camera.frustum_corners();
        assert!((corners[0].z + 0.1).abs() < 1e-4);
        assert!((corners[4].z + 100.0).abs() < 0.5);
    }
}
