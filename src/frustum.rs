//! View frustum planes and bounding volume tests
//!
//! Planes are extracted from a combined `projection * view` matrix with the
//! Gribb/Hartmann method, adjusted for the `[0, 1]` clip depth range wgpu uses.
//! Every plane normal points into the frustum, so a point is inside a plane when
//! its signed distance is non-negative.

use glam::{Mat4, Vec3, Vec4};

/// A plane in Hessian normal form: `dot(normal, p) + distance = 0`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    fn from_vec4(v: Vec4) -> Self {
        let normal = v.truncate();
        let length = normal.length();
        if length <= f32::EPSILON {
            return Self {
                normal: Vec3::ZERO,
                distance: v.w,
            };
        }
        Self {
            normal: normal / length,
            distance: v.w / length,
        }
    }

    /// Positive on the inner side of the plane
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// Indices into [`Frustum::planes`]
pub mod plane_index {
    pub const NEAR: usize = 0;
    pub const FAR: usize = 1;
    pub const LEFT: usize = 2;
    pub const RIGHT: usize = 3;
    pub const TOP: usize = 4;
    pub const BOTTOM: usize = 5;
}

/// Six clipping planes: near, far, left, right, top, bottom
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Default for Frustum {
    fn default() -> Self {
        Self::from_matrix(&Mat4::IDENTITY)
    }
}

impl Frustum {
    /// Extract normalized planes from `projection * view`
    pub fn from_matrix(view_projection: &Mat4) -> Self {
        let r0 = view_projection.row(0);
        let r1 = view_projection.row(1);
        let r2 = view_projection.row(2);
        let r3 = view_projection.row(3);

        Self {
            planes: [
                Plane::from_vec4(r2),
                Plane::from_vec4(r3 - r2),
                Plane::from_vec4(r3 + r0),
                Plane::from_vec4(r3 - r0),
                Plane::from_vec4(r3 - r1),
                Plane::from_vec4(r3 + r1),
            ],
        }
    }

    pub fn point_in_frustum(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.signed_distance(point) >= 0.0)
    }

    /// False only when the sphere lies entirely outside one of the planes.
    /// A sphere touching a plane from outside counts as inside.
    pub fn sphere_in_frustum(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.signed_distance(center) >= -radius)
    }

    /// Conservative box test using the corner furthest along each plane normal
    pub fn aabb_in_frustum(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let positive = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            plane.signed_distance(positive) >= 0.0
        })
    }
}

/// Eight world-space corners of the volume described by `view_projection`.
///
/// Near corners come first, ordered `(-x,-y) (x,-y) (x,y) (-x,y)`, then the far
/// corners in the same order.
pub fn frustum_corners(view_projection: &Mat4) -> [Vec3; 8] {
    let inverse = view_projection.inverse();
    let mut corners = [Vec3::ZERO; 8];
    let ndc = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
    for (depth_index, depth) in [0.0f32, 1.0].iter().enumerate() {
        for (i, (x, y)) in ndc.iter().enumerate() {
            let clip = inverse * Vec4::new(*x, *y, *depth, 1.0);
            corners[depth_index * 4 + i] = clip.truncate() / clip.w;
        }
    }
    corners
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self {
            min: Vec3::ZERO,
            max: Vec3::ZERO,
        }
    }
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn from_center_half_extents(center: Vec3, half_extents: Vec3) -> Self {
        Self::new(center - half_extents, center + half_extents)
    }

    /// Tightest box around the given points; `None` for an empty slice
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let (min, max) = rest
            .iter()
            .fold((*first, *first), |(min, max), p| (min.min(*p), max.max(*p)));
        Some(Self { min, max })
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Radius of the sphere centered at [`Aabb::center`] enclosing the box
    pub fn bounding_radius(&self) -> f32 {
        self.half_extents().length()
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// World-space box enclosing this box after `matrix` is applied
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        let corners = self.corners().map(|c| matrix.transform_point3(c));
        // Eight corners, never empty
        Self::from_points(&corners).unwrap_or(*self)
    }

    /// Inclusive on the faces
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    pub fn union(&self, other: &Aabb) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_ortho() -> Frustum {
        // x, y in [-1, 1], view-space z in [-2, 0]
        Frustum::from_matrix(&Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.0, 2.0))
    }

    #[test]
    fn test_planes_are_normalized() {
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.5, 0.1, 100.0);
        let frustum = Frustum::from_matrix(&proj);
        for plane in frustum.planes {
            assert!((plane.normal.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sphere_fully_inside_and_outside() {
        let frustum = unit_ortho();
        assert!(frustum.sphere_in_frustum(Vec3::new(0.0, 0.0, -1.0), 0.5));
        assert!(!frustum.sphere_in_frustum(Vec3::new(5.0, 0.0, -1.0), 1.0));
        assert!(!frustum.sphere_in_frustum(Vec3::new(0.0, 0.0, 3.0), 1.0));
    }

    #[test]
    fn test_tangent_sphere_is_inside() {
        let frustum = unit_ortho();
        // Touches the right plane x = 1 from outside
        assert!(frustum.sphere_in_frustum(Vec3::new(2.0, 0.0, -1.0), 1.0));
        // Touches the near plane z = 0 from behind
        assert!(frustum.sphere_in_frustum(Vec3::new(0.0, 0.0, 1.0), 1.0));
        // Just beyond tangency
        assert!(!frustum.sphere_in_frustum(Vec3::new(2.01, 0.0, -1.0), 1.0));
    }

    #[test]
    fn test_point_in_frustum() {
        let frustum = unit_ortho();
        assert!(frustum.point_in_frustum(Vec3::new(0.5, -0.5, -1.5)));
        assert!(frustum.point_in_frustum(Vec3::new(1.0, 0.0, -1.0)));
        assert!(!frustum.point_in_frustum(Vec3::new(0.0, 0.0, -2.5)));
    }

    #[test]
    fn test_aabb_in_frustum() {
        let frustum = unit_ortho();
        let straddling = Aabb::new(Vec3::new(0.5, 0.5, -1.0), Vec3::new(3.0, 3.0, -0.5));
        assert!(frustum.aabb_in_frustum(&straddling));
        let outside = Aabb::new(Vec3::new(1.5, -1.0, -1.0), Vec3::new(3.0, 1.0, -0.5));
        assert!(!frustum.aabb_in_frustum(&outside));
    }

    #[test]
    fn test_frustum_corners_of_ortho_volume() {
        let vp = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.0, 2.0);
        let corners = frustum_corners(&vp);
        assert!(corners[0].abs_diff_eq(Vec3::new(-1.0, -1.0, 0.0), 1e-5));
        assert!(corners[6].abs_diff_eq(Vec3::new(1.0, 1.0, -2.0), 1e-5));
    }

    #[test]
    fn test_aabb_helpers() {
        assert!(Aabb::from_points(&[]).is_none());
        let aabb = Aabb::from_points(&[Vec3::new(1.0, -1.0, 0.0), Vec3::new(-1.0, 2.0, 3.0)])
            .unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -1.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 2.0, 3.0));
        assert!(aabb.contains_point(Vec3::new(1.0, 2.0, 3.0)));
        assert!(!aabb.contains_point(Vec3::new(1.1, 0.0, 0.0)));

        let moved = aabb.transformed(&Mat4::from_translation(Vec3::X * 10.0));
        assert_eq!(moved.min, Vec3::new(9.0, -1.0, 0.0));

        let both = aabb.union(&moved);
        assert_eq!(both.max.x, 11.0);
    }
}
