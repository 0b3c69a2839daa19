//! Bounding volume hierarchy over world-space triangles of every mesh in the scene.
//!
//! The hierarchy is stored as a flat array of nodes. Internal nodes reference their
//! left child (the right child is stored right after it), leaves reference a
//! contiguous range of triangles. The structure is immutable once built and can be
//! queried from any number of threads.

use crate::{
    error::{GeometryError, GeometryErrorKind, StructureQueryError},
    input::Mesh,
    math::{self, ray::Ray},
    EntityId,
};
use arrayvec::ArrayVec;
use nalgebra::{Vector2, Vector3};

const MAX_LEAF_TRIANGLES: usize = 4;
const STACK_CAPACITY: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vector3<f32>,
    pub max: Vector3<f32>,
}

impl Default for Aabb {
    fn default() -> Self {
        Self {
            min: Vector3::repeat(f32::MAX),
            max: Vector3::repeat(-f32::MAX),
        }
    }
}

impl Aabb {
    pub fn add_point(&mut self, p: Vector3<f32>) {
        self.min = self.min.inf(&p);
        self.max = self.max.sup(&p);
    }

    pub fn extend(&mut self, other: &Aabb) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    pub fn longest_axis(&self) -> usize {
        let d = self.max - self.min;
        if d.x >= d.y && d.x >= d.z {
            0
        } else if d.y >= d.z {
            1
        } else {
            2
        }
    }

    /// Slab test, returns entry distance if the ray hits the box before `t_max`.
    fn ray_entry(&self, origin: &Vector3<f32>, inv_dir: &Vector3<f32>, t_max: f32) -> Option<f32> {
        let t1 = (self.min - origin).component_mul(inv_dir);
        let t2 = (self.max - origin).component_mul(inv_dir);
        let t_near = t1.inf(&t2);
        let t_far = t1.sup(&t2);
        let enter = t_near.x.max(t_near.y).max(t_near.z).max(0.0);
        let exit = t_far.x.min(t_far.y).min(t_far.z).min(t_max);
        if enter <= exit {
            Some(enter)
        } else {
            None
        }
    }
}

/// Identifies a triangle of an input mesh.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TriangleId {
    pub mesh: u32,
    pub triangle: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Hit {
    pub triangle: TriangleId,
    /// Distance from ray origin to the hit point in world units.
    pub distance: f32,
    /// Weights of triangle vertices at the hit point.
    pub barycentric: Vector3<f32>,
    /// Interpolated unit normal at the hit point.
    pub normal: Vector3<f32>,
    /// Interpolated atlas coordinates at the hit point.
    pub second_tex_coord: Vector2<f32>,
}

struct BvhTriangle {
    id: TriangleId,
    positions: [Vector3<f32>; 3],
    normals: [Vector3<f32>; 3],
    second_tex_coords: [Vector2<f32>; 3],
}

impl BvhTriangle {
    fn bounds(&self) -> Aabb {
        let mut aabb = Aabb::default();
        for p in self.positions.iter() {
            aabb.add_point(*p);
        }
        aabb
    }

    fn centroid(&self) -> Vector3<f32> {
        (self.positions[0] + self.positions[1] + self.positions[2]).scale(1.0 / 3.0)
    }

    /// Möller–Trumbore, `dir` must be normalized. Returns (distance, u, v).
    fn intersect(&self, origin: &Vector3<f32>, dir: &Vector3<f32>) -> Option<(f32, f32, f32)> {
        let [a, b, c] = self.positions;
        let e1 = b - a;
        let e2 = c - a;
        let p = dir.cross(&e2);
        let det = e1.dot(&p);
        if det.abs() < 1.0e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = origin - a;
        let u = s.dot(&p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(&e1);
        let v = dir.dot(&q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = e2.dot(&q) * inv_det;
        if t > 0.0 {
            Some((t, u, v))
        } else {
            None
        }
    }

    fn make_hit(&self, distance: f32, u: f32, v: f32) -> Hit {
        let w = 1.0 - u - v;
        let [na, nb, nc] = self.normals;
        let [ta, tb, tc] = self.second_tex_coords;
        let geometric = (self.positions[1] - self.positions[0])
            .cross(&(self.positions[2] - self.positions[0]))
            .normalize();
        Hit {
            triangle: self.id,
            distance,
            barycentric: Vector3::new(w, u, v),
            normal: (na.scale(w) + nb.scale(u) + nc.scale(v))
                .try_normalize(f32::EPSILON)
                .unwrap_or(geometric),
            second_tex_coord: ta.scale(w) + tb.scale(u) + tc.scale(v),
        }
    }
}

struct BvhNode {
    bounds: Aabb,
    /// Index of left child for internal nodes, index of first triangle for leaves.
    left_or_first: u32,
    /// Amount of triangles, zero for internal nodes.
    count: u32,
}

pub struct AccelerationStructure {
    nodes: Vec<BvhNode>,
    triangles: Vec<BvhTriangle>,
    skipped: Vec<GeometryError>,
}

fn classify<Id: EntityId>(mesh: &Mesh<Id>, index: usize) -> Option<GeometryErrorKind> {
    let [a, b, c] = mesh.world_triangle(index);
    if [a, b, c].iter().any(|p| p.iter().any(|v| !v.is_finite())) {
        Some(GeometryErrorKind::NonFinite)
    } else if math::triangle_area(a, b, c) <= f32::EPSILON * f32::EPSILON {
        Some(GeometryErrorKind::ZeroArea)
    } else {
        None
    }
}

impl AccelerationStructure {
    /// Builds hierarchy over triangles of every mesh. Degenerate triangles are skipped.
    pub fn new<Id: EntityId>(meshes: &[Mesh<Id>]) -> Self {
        let mut triangles = Vec::new();
        let mut skipped = Vec::new();

        for (mesh_index, mesh) in meshes.iter().enumerate() {
            for (triangle_index, triangle) in mesh.triangles.iter().enumerate() {
                if let Some(kind) = classify(mesh, triangle_index) {
                    let error = GeometryError {
                        mesh: mesh_index,
                        triangle: triangle_index,
                        kind,
                    };
                    log::warn!("{}", error);
                    skipped.push(error);
                    continue;
                }

                let vertex = |i: usize| &mesh.vertices[triangle[i] as usize];
                triangles.push(BvhTriangle {
                    id: TriangleId {
                        mesh: mesh_index as u32,
                        triangle: triangle_index as u32,
                    },
                    positions: [
                        vertex(0).world_position,
                        vertex(1).world_position,
                        vertex(2).world_position,
                    ],
                    normals: [
                        vertex(0).world_normal,
                        vertex(1).world_normal,
                        vertex(2).world_normal,
                    ],
                    second_tex_coords: [
                        vertex(0).second_tex_coord,
                        vertex(1).second_tex_coord,
                        vertex(2).second_tex_coord,
                    ],
                });
            }
        }

        let mut nodes = Vec::with_capacity((2 * triangles.len()).max(1));
        nodes.push(placeholder());
        if !triangles.is_empty() {
            let count = triangles.len();
            build_recursive(&mut nodes, &mut triangles, 0, 0, count);
        }

        log::info!(
            "Built BVH with {} nodes over {} triangles ({} skipped).",
            nodes.len(),
            triangles.len(),
            skipped.len()
        );

        Self {
            nodes,
            triangles,
            skipped,
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Triangles that were left out during build.
    pub fn skipped(&self) -> &[GeometryError] {
        &self.skipped
    }

    pub fn bounds(&self) -> Aabb {
        self.nodes[0].bounds
    }

    /// Finds the nearest hit along the ray closer than `max_distance`.
    pub fn intersect(&self, ray: &Ray, max_distance: f32) -> Result<Option<Hit>, StructureQueryError> {
        let mut nearest = None;
        self.traverse(ray, max_distance, |triangle, distance, u, v| {
            nearest = Some(triangle.make_hit(distance, u, v));
            false
        })?;
        Ok(nearest)
    }

    /// Checks whether anything is hit by the ray closer than `max_distance`.
    pub fn occluded(&self, ray: &Ray, max_distance: f32) -> Result<bool, StructureQueryError> {
        let mut occluded = false;
        self.traverse(ray, max_distance, |_, _, _, _| {
            occluded = true;
            true
        })?;
        Ok(occluded)
    }

    /// Walks the hierarchy calling `on_hit` for every hit closer than the closest hit
    /// found so far. Traversal stops as soon as `on_hit` returns `true`.
    fn traverse<F>(&self, ray: &Ray, max_distance: f32, mut on_hit: F) -> Result<(), StructureQueryError>
    where
        F: FnMut(&BvhTriangle, f32, f32, f32) -> bool,
    {
        if self.triangles.is_empty() {
            return Ok(());
        }
        let dir = match ray.dir.try_normalize(f32::EPSILON) {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let origin = ray.origin;
        let inv_dir = dir.map(|d| 1.0 / d);
        let mut closest = max_distance;

        let mut stack = ArrayVec::<u32, STACK_CAPACITY>::new();
        stack.push(0);

        while let Some(index) = stack.pop() {
            let node = self
                .nodes
                .get(index as usize)
                .ok_or(StructureQueryError::InvalidNode { index })?;

            if node.bounds.ray_entry(&origin, &inv_dir, closest).is_none() {
                continue;
            }

            if node.count > 0 {
                let first = node.left_or_first as usize;
                for triangle in &self.triangles[first..first + node.count as usize] {
                    if let Some((t, u, v)) = triangle.intersect(&origin, &dir) {
                        if t < closest {
                            closest = t;
                            if on_hit(triangle, t, u, v) {
                                return Ok(());
                            }
                        }
                    }
                }
            } else {
                let left = node.left_or_first;
                let right = left + 1;
                let left_entry = self.node_entry(left, &origin, &inv_dir, closest)?;
                let right_entry = self.node_entry(right, &origin, &inv_dir, closest)?;

                // Push far child first, so near child is popped first.
                let mut children = [(left, left_entry), (right, right_entry)];
                if left_entry.unwrap_or(f32::MAX) < right_entry.unwrap_or(f32::MAX) {
                    children.swap(0, 1);
                }
                for (child, entry) in children {
                    if entry.is_some() {
                        stack
                            .try_push(child)
                            .map_err(|_| StructureQueryError::StackOverflow {
                                capacity: STACK_CAPACITY,
                            })?;
                    }
                }
            }
        }

        Ok(())
    }

    fn node_entry(
        &self,
        index: u32,
        origin: &Vector3<f32>,
        inv_dir: &Vector3<f32>,
        t_max: f32,
    ) -> Result<Option<f32>, StructureQueryError> {
        self.nodes
            .get(index as usize)
            .map(|node| node.bounds.ray_entry(origin, inv_dir, t_max))
            .ok_or(StructureQueryError::InvalidNode { index })
    }
}

fn placeholder() -> BvhNode {
    BvhNode {
        bounds: Aabb::default(),
        left_or_first: 0,
        count: 0,
    }
}

/// Fills node at `index` with triangles `first..first + count`. Children of a node are
/// always allocated as a pair, so the right child is `left + 1`.
fn build_recursive(
    nodes: &mut Vec<BvhNode>,
    triangles: &mut [BvhTriangle],
    index: usize,
    first: usize,
    count: usize,
) {
    let slice = &mut triangles[first..first + count];
    let mut bounds = Aabb::default();
    let mut centroid_bounds = Aabb::default();
    for triangle in slice.iter() {
        bounds.extend(&triangle.bounds());
        centroid_bounds.add_point(triangle.centroid());
    }

    nodes[index] = BvhNode {
        bounds,
        left_or_first: first as u32,
        count: count as u32,
    };

    let axis = centroid_bounds.longest_axis();
    let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
    if count <= MAX_LEAF_TRIANGLES || extent <= f32::EPSILON {
        return;
    }

    let mid = count / 2;
    slice.select_nth_unstable_by(mid, |a, b| {
        a.centroid()[axis].total_cmp(&b.centroid()[axis])
    });

    let left = nodes.len();
    nodes.push(placeholder());
    nodes.push(placeholder());
    nodes[index].left_or_first = left as u32;
    nodes[index].count = 0;

    build_recursive(nodes, triangles, left, first, mid);
    build_recursive(nodes, triangles, left + 1, first + mid, count - mid);
}
