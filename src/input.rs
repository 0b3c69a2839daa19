use crate::{error::LightmapGenerationError, math, EntityId};
use nalgebra::{Matrix3, Matrix4, Point3, Vector2, Vector3};

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct WorldVertex {
    pub world_normal: Vector3<f32>,
    pub world_position: Vector3<f32>,
    /// Existing texture coordinates of the surface, carried through unwrapping unchanged.
    pub tex_coord: Vector2<f32>,
    /// Atlas coordinates, written by [`crate::atlas::generate_atlas`].
    pub second_tex_coord: Vector2<f32>,
}

impl WorldVertex {
    pub fn new(position: Vector3<f32>, normal: Vector3<f32>, tex_coord: Vector2<f32>) -> Self {
        Self {
            world_normal: normal,
            world_position: position,
            tex_coord,
            second_tex_coord: Vector2::default(),
        }
    }
}

pub struct Mesh<Id: EntityId> {
    /// A handle of the mesh in the scene.
    pub owner: Id,
    /// World-space vertices.
    pub vertices: Vec<WorldVertex>,
    pub triangles: Vec<[u32; 3]>,
}

impl<Id: EntityId> Mesh<Id> {
    pub fn new(
        owner: Id,
        vertices: Vec<WorldVertex>,
        triangles: Vec<[u32; 3]>,
    ) -> Result<Self, LightmapGenerationError> {
        for triangle in triangles.iter() {
            if triangle.iter().any(|&i| i as usize >= vertices.len()) {
                return Err(LightmapGenerationError::InvalidIndex);
            }
        }

        Ok(Self {
            owner,
            vertices,
            triangles,
        })
    }

    /// Creates a mesh from local-space vertices, moving them into world space with
    /// given transform. Normals are transformed with the inverse transpose.
    pub fn from_local(
        owner: Id,
        mut vertices: Vec<WorldVertex>,
        triangles: Vec<[u32; 3]>,
        transform: &Matrix4<f32>,
    ) -> Result<Self, LightmapGenerationError> {
        let basis: Matrix3<f32> = transform.fixed_view::<3, 3>(0, 0).into_owned();
        let normal_matrix = basis
            .try_inverse()
            .map(|inv| inv.transpose())
            .unwrap_or(basis);

        for vertex in vertices.iter_mut() {
            vertex.world_position = transform
                .transform_point(&Point3::from(vertex.world_position))
                .coords;
            vertex.world_normal = (normal_matrix * vertex.world_normal)
                .try_normalize(f32::EPSILON)
                .unwrap_or_default();
        }

        Self::new(owner, vertices, triangles)
    }

    pub fn world_triangle(&self, index: usize) -> [Vector3<f32>; 3] {
        let triangle = &self.triangles[index];
        [
            self.vertices[triangle[0] as usize].world_position,
            self.vertices[triangle[1] as usize].world_position,
            self.vertices[triangle[2] as usize].world_position,
        ]
    }

    /// Total world-space area of the mesh.
    pub fn area(&self) -> f32 {
        (0..self.triangles.len())
            .map(|i| {
                let [a, b, c] = self.world_triangle(i);
                math::triangle_area(a, b, c)
            })
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Axis-aligned quad in XZ plane at height `y`, facing +Y, with UV covering [0; 1].
    pub fn quad(owner: u32, min: Vector2<f32>, size: f32, y: f32) -> Mesh<u32> {
        let up = Vector3::y();
        let vertices = vec![
            WorldVertex::new(Vector3::new(min.x, y, min.y), up, Vector2::new(0.0, 0.0)),
            WorldVertex::new(
                Vector3::new(min.x + size, y, min.y),
                up,
                Vector2::new(1.0, 0.0),
            ),
            WorldVertex::new(
                Vector3::new(min.x + size, y, min.y + size),
                up,
                Vector2::new(1.0, 1.0),
            ),
            WorldVertex::new(
                Vector3::new(min.x, y, min.y + size),
                up,
                Vector2::new(0.0, 1.0),
            ),
        ];
        Mesh::new(owner, vertices, vec![[0, 2, 1], [0, 3, 2]]).unwrap()
    }

    #[test]
    fn test_invalid_index() {
        let vertices = vec![WorldVertex::default(); 2];
        assert!(matches!(
            Mesh::new(0u32, vertices, vec![[0, 1, 2]]),
            Err(LightmapGenerationError::InvalidIndex)
        ));
    }

    #[test]
    fn test_area() {
        let mesh = quad(0, Vector2::new(-1.0, -1.0), 2.0, 0.0);
        assert!((mesh.area() - 4.0).abs() < 1.0e-5);
    }

    #[test]
    fn test_from_local() {
        let up = Vector3::y();
        let vertices = vec![
            WorldVertex::new(Vector3::new(0.0, 0.0, 0.0), up, Vector2::new(0.0, 0.0)),
            WorldVertex::new(Vector3::new(1.0, 0.0, 0.0), up, Vector2::new(1.0, 0.0)),
            WorldVertex::new(Vector3::new(0.0, 0.0, 1.0), up, Vector2::new(0.0, 1.0)),
        ];
        let transform = Matrix4::new_translation(&Vector3::new(0.0, 2.0, 0.0))
            * Matrix4::new_nonuniform_scaling(&Vector3::new(2.0, 1.0, 2.0));
        let mesh = Mesh::from_local(7u32, vertices, vec![[0, 2, 1]], &transform).unwrap();
        assert_eq!(mesh.vertices[1].world_position, Vector3::new(2.0, 2.0, 0.0));
        assert!((mesh.vertices[1].world_normal - up).norm() < 1.0e-6);
        assert!((mesh.area() - 2.0).abs() < 1.0e-5);
    }
}
