//! CPU-side mesh data and procedural shapes

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use crate::frustum::Aabb;

/// Interleaved vertex matching [`ChannelLayout::standard`](super::ChannelLayout::standard)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl MeshVertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            uv: uv.to_array(),
        }
    }
}

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Vertex data as flat floats
    pub fn vertex_floats(&self) -> &[f32] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Local-space bounds, `None` for an empty mesh
    pub fn bounds(&self) -> Option<Aabb> {
        let points: Vec<Vec3> = self
            .vertices
            .iter()
            .map(|v| Vec3::from_array(v.position))
            .collect();
        Aabb::from_points(&points)
    }

    /// Unit cube centered at the origin, also used as light volume geometry
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];

        for (face, (normal, right, up)) in faces.iter().enumerate() {
            let center = *normal * 0.5;
            let corners = [
                (center - *right * 0.5 - *up * 0.5, Vec2::new(0.0, 1.0)),
                (center + *right * 0.5 - *up * 0.5, Vec2::new(1.0, 1.0)),
                (center + *right * 0.5 + *up * 0.5, Vec2::new(1.0, 0.0)),
                (center - *right * 0.5 + *up * 0.5, Vec2::new(0.0, 0.0)),
            ];
            for (position, uv) in corners {
                mesh.vertices.push(MeshVertex::new(position, *normal, uv));
            }

            // Two counter-clockwise triangles per face
            let base = face as u32 * 4;
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// UV sphere with radius 0.5
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");
        let segments = segments.max(3);
        let rings = rings.max(2);

        let segment_angle = 2.0 * std::f32::consts::PI / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(ring_radius * theta.cos(), y, ring_radius * theta.sin());
                let uv = Vec2::new(
                    segment as f32 / segments as f32,
                    ring as f32 / rings as f32,
                );
                mesh.vertices.push(MeshVertex::new(normal * 0.5, normal, uv));
            }
        }

        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }

        mesh
    }

    /// Plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");
        let steps = subdivisions + 1;

        for z in 0..=steps {
            for x in 0..=steps {
                let u = x as f32 / steps as f32;
                let v = z as f32 / steps as f32;
                let position = Vec3::new((u - 0.5) * width, 0.0, (v - 0.5) * depth);
                mesh.vertices
                    .push(MeshVertex::new(position, Vec3::Y, Vec2::new(u, v)));
            }
        }

        for z in 0..steps {
            for x in 0..steps {
                let i = z * (steps + 1) + x;
                let below = i + steps + 1;
                mesh.indices
                    .extend_from_slice(&[i, below, i + 1, i + 1, below, below + 1]);
            }
        }

        mesh
    }
}
