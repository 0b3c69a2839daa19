//! Splits a mesh into planar charts and lays the charts out inside a square, so no two
//! triangles of a mesh share lightmap texels regardless of what texture coordinates the
//! mesh came with.
//!
//! A chart is a set of edge-connected triangles whose normals share the same dominant
//! axis and direction. Triangles of a chart are projected onto the plane of that axis,
//! charts are then packed with a rectangle packer.

use crate::{
    input::Mesh,
    math::{self, pack::RectPacker, PlaneClass},
    EntityId,
};
use fxhash::FxHashMap;
use nalgebra::{Vector2, Vector3};

pub struct Chart {
    /// Indices of mesh triangles.
    pub triangles: Vec<usize>,
    /// Minimal corner of projected triangles in world units.
    pub min: Vector2<f32>,
    /// Size of projected triangles in world units.
    pub extent: Vector2<f32>,
}

pub struct MeshCharts {
    charts: Vec<Chart>,
    /// Projected corners of every triangle of the mesh.
    projected: Vec<[Vector2<f32>; 3]>,
}

/// Placement of charts of a single mesh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartLayout {
    /// Side of the square in texels.
    pub side: u32,
    /// Top-left corner of every chart rectangle (margin included) in texels.
    pub offsets: Vec<(u32, u32)>,
}

fn face_key(normal: &Vector3<f32>) -> (u8, bool) {
    match math::classify_plane(*normal) {
        PlaneClass::YZ => (0, normal.x >= 0.0),
        PlaneClass::XZ => (1, normal.y >= 0.0),
        PlaneClass::XY => (2, normal.z >= 0.0),
    }
}

fn edge_key(a: u32, b: u32) -> (u32, u32) {
    (a.min(b), a.max(b))
}

impl MeshCharts {
    pub fn new<Id: EntityId>(mesh: &Mesh<Id>) -> Self {
        let count = mesh.triangles.len();

        // Vertices are welded by position, meshes with split normals still get
        // connected charts.
        let mut welded: FxHashMap<[u32; 3], u32> = FxHashMap::default();
        let mut weld = |p: Vector3<f32>| {
            let key = [
                (p.x + 0.0).to_bits(),
                (p.y + 0.0).to_bits(),
                (p.z + 0.0).to_bits(),
            ];
            let next = welded.len() as u32;
            *welded.entry(key).or_insert(next)
        };

        let mut normals = Vec::with_capacity(count);
        let mut corners = Vec::with_capacity(count);
        let mut edges: FxHashMap<(u32, u32), Vec<usize>> = FxHashMap::default();
        for index in 0..count {
            let [a, b, c] = mesh.world_triangle(index);
            normals.push(
                (b - a)
                    .cross(&(c - a))
                    .try_normalize(f32::EPSILON)
                    .unwrap_or_else(Vector3::y),
            );
            let ids = [weld(a), weld(b), weld(c)];
            for k in 0..3 {
                edges
                    .entry(edge_key(ids[k], ids[(k + 1) % 3]))
                    .or_default()
                    .push(index);
            }
            corners.push(ids);
        }

        let mut chart_of = vec![usize::MAX; count];
        let mut charts = Vec::new();
        let mut projected = vec![[Vector2::default(); 3]; count];

        for seed in 0..count {
            if chart_of[seed] != usize::MAX {
                continue;
            }

            let key = face_key(&normals[seed]);
            let chart_index = charts.len();
            chart_of[seed] = chart_index;
            let mut triangles = vec![seed];
            let mut cursor = 0;
            while let Some(&current) = triangles.get(cursor) {
                cursor += 1;
                let ids = corners[current];
                for k in 0..3 {
                    let Some(neighbours) = edges.get(&edge_key(ids[k], ids[(k + 1) % 3])) else {
                        continue;
                    };
                    for &neighbour in neighbours {
                        if chart_of[neighbour] == usize::MAX && face_key(&normals[neighbour]) == key
                        {
                            chart_of[neighbour] = chart_index;
                            triangles.push(neighbour);
                        }
                    }
                }
            }

            let class = math::classify_plane(normals[seed]);
            let mut min = Vector2::repeat(f32::MAX);
            let mut max = Vector2::repeat(-f32::MAX);
            for &triangle in triangles.iter() {
                for (k, point) in mesh.world_triangle(triangle).into_iter().enumerate() {
                    let p = math::vec3_to_vec2_by_plane(class, normals[seed], point);
                    projected[triangle][k] = p;
                    if p.x.is_finite() && p.y.is_finite() {
                        min = min.inf(&p);
                        max = max.sup(&p);
                    }
                }
            }
            if min.x > max.x {
                min = Vector2::default();
                max = Vector2::default();
            }

            charts.push(Chart {
                triangles,
                min,
                extent: max - min,
            });
        }

        Self { charts, projected }
    }

    pub fn charts(&self) -> &[Chart] {
        &self.charts
    }

    /// Rough amount of texels the charts need, used for error reporting only.
    pub fn requested_texels(&self, density: f32, margin: u32) -> u64 {
        let border = 2.0 * margin as f64;
        self.charts
            .iter()
            .map(|chart| {
                let w = (chart.extent.x as f64 * density as f64).ceil().max(1.0) + border;
                let h = (chart.extent.y as f64 * density as f64).ceil().max(1.0) + border;
                (w * h) as u64
            })
            .fold(0u64, u64::saturating_add)
    }

    /// Packs charts into the smallest square found, with `margin` empty texels around
    /// every chart. Returns `None` if the square would be larger than `limit` texels.
    pub fn layout(&self, density: f32, margin: u32, limit: u32) -> Option<ChartLayout> {
        let border = margin.checked_mul(2)?;
        let size = |extent: f32| {
            let texels = (extent * density).ceil().max(1.0);
            if texels.is_finite() && texels <= limit as f32 {
                (texels as u32).checked_add(border)
            } else {
                None
            }
        };
        let sizes = self
            .charts
            .iter()
            .map(|chart| Some((size(chart.extent.x)?, size(chart.extent.y)?)))
            .collect::<Option<Vec<_>>>()?;

        if sizes.is_empty() {
            let side = border.max(1);
            return (side <= limit).then(|| ChartLayout {
                side,
                offsets: Vec::new(),
            });
        }

        // Stable sort keeps triangle order for equal sizes.
        let mut order: Vec<usize> = (0..sizes.len()).collect();
        order.sort_by(|&a, &b| {
            let (wa, ha) = sizes[a];
            let (wb, hb) = sizes[b];
            hb.cmp(&ha).then(wb.cmp(&wa))
        });

        let area = sizes
            .iter()
            .map(|&(w, h)| w as u64 * h as u64)
            .fold(0u64, u64::saturating_add);
        let widest = sizes.iter().map(|&(w, h)| w.max(h)).max().unwrap_or(1) as u64;
        let mut side = ((area as f64).sqrt().ceil() as u64).max(widest);

        while side <= limit as u64 {
            let mut packer = RectPacker::new(side as u32, side as u32);
            let mut offsets = vec![(0, 0); sizes.len()];
            let fitted = order.iter().all(|&i| {
                let (w, h) = sizes[i];
                match packer.find_free(w, h) {
                    Some(rect) => {
                        offsets[i] = (rect.x(), rect.y());
                        true
                    }
                    None => false,
                }
            });
            if fitted {
                return Some(ChartLayout {
                    side: side as u32,
                    offsets,
                });
            }
            side += (side / 16).max(1);
        }

        None
    }

    /// Gives every chart its own copy of the vertices it uses and writes atlas
    /// coordinates into them. `corner` is the top-left texel of the layout square.
    /// Triangle order is kept. Returns the source vertex index of every new vertex.
    pub fn apply<Id: EntityId>(
        &self,
        mesh: &mut Mesh<Id>,
        layout: &ChartLayout,
        corner: Vector2<f32>,
        density: f32,
        margin: u32,
        resolution: u32,
    ) -> Vec<u32> {
        let scale = 1.0 / resolution as f32;
        let mut vertices = Vec::with_capacity(mesh.vertices.len());
        let mut sources = Vec::with_capacity(mesh.vertices.len());
        let mut remap: FxHashMap<(usize, u32), u32> = FxHashMap::default();

        for (chart_index, (chart, &(x, y))) in
            self.charts.iter().zip(layout.offsets.iter()).enumerate()
        {
            let origin = corner + Vector2::new((x + margin) as f32, (y + margin) as f32);
            for &triangle in chart.triangles.iter() {
                for k in 0..3 {
                    let source = mesh.triangles[triangle][k];
                    let index = *remap.entry((chart_index, source)).or_insert_with(|| {
                        let mut vertex = mesh.vertices[source as usize];
                        let local = (self.projected[triangle][k] - chart.min).scale(density);
                        let local = if local.x.is_finite() && local.y.is_finite() {
                            local
                        } else {
                            Vector2::default()
                        };
                        vertex.second_tex_coord = (origin + local).scale(scale);
                        vertices.push(vertex);
                        sources.push(source);
                        (vertices.len() - 1) as u32
                    });
                    mesh.triangles[triangle][k] = index;
                }
            }
        }

        mesh.vertices = vertices;
        sources
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::input::{test::quad, WorldVertex};

    /// Closed unit box with shared corner vertices and zero texture coordinates.
    pub fn cube(owner: u32, min: Vector3<f32>, size: f32) -> Mesh<u32> {
        let vertices = (0..8)
            .map(|i| {
                let corner = Vector3::new((i & 1) as f32, ((i >> 1) & 1) as f32, (i >> 2) as f32);
                let normal = (corner - Vector3::repeat(0.5)).normalize();
                WorldVertex::new(min + corner.scale(size), normal, Vector2::default())
            })
            .collect();
        let triangles = vec![
            // -X, +X
            [0, 4, 6],
            [0, 6, 2],
            [1, 3, 7],
            [1, 7, 5],
            // -Y, +Y
            [0, 1, 5],
            [0, 5, 4],
            [2, 6, 7],
            [2, 7, 3],
            // -Z, +Z
            [0, 2, 3],
            [0, 3, 1],
            [4, 5, 7],
            [4, 7, 6],
        ];
        Mesh::new(owner, vertices, triangles).unwrap()
    }

    #[test]
    fn test_cube_has_six_charts() {
        let mesh = cube(0, Vector3::default(), 2.0);
        let charts = MeshCharts::new(&mesh);
        assert_eq!(charts.charts().len(), 6);
        for chart in charts.charts() {
            assert_eq!(chart.triangles.len(), 2);
            assert!((chart.extent - Vector2::new(2.0, 2.0)).norm() < 1.0e-5);
        }
    }

    #[test]
    fn test_connected_quad_is_one_chart() {
        let mesh = quad(0, Vector2::new(1.0, 2.0), 3.0, 0.5);
        let charts = MeshCharts::new(&mesh);
        assert_eq!(charts.charts().len(), 1);
        assert_eq!(charts.charts()[0].triangles, vec![0, 1]);
    }

    #[test]
    fn test_layout_does_not_overlap() {
        let mesh = cube(0, Vector3::default(), 1.0);
        let charts = MeshCharts::new(&mesh);
        let layout = charts.layout(4.0, 1, 64).unwrap();
        assert_eq!(layout.offsets.len(), 6);
        for (i, a) in layout.offsets.iter().enumerate() {
            assert!(a.0 + 6 <= layout.side && a.1 + 6 <= layout.side);
            for b in layout.offsets.iter().skip(i + 1) {
                let apart = a.0 + 6 <= b.0 || b.0 + 6 <= a.0 || a.1 + 6 <= b.1 || b.1 + 6 <= a.1;
                assert!(apart, "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_layout_limit() {
        let charts = MeshCharts::new(&quad(0, Vector2::default(), 1.0, 0.0));
        assert_eq!(charts.layout(4.0, 0, 4).unwrap().side, 4);
        assert!(charts.layout(4.0, 1, 4).is_none());
        assert!(charts.layout(f32::MAX, 0, 1024).is_none());
        assert!(charts.layout(1.0, u32::MAX, u32::MAX).is_none());
    }

    #[test]
    fn test_apply_splits_shared_vertices() {
        let mut mesh = cube(0, Vector3::default(), 1.0);
        let charts = MeshCharts::new(&mesh);
        let layout = charts.layout(4.0, 1, 64).unwrap();
        let sources = charts.apply(&mut mesh, &layout, Vector2::default(), 4.0, 1, 64);
        // Every face gets its own four corners.
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(sources.len(), 24);
        assert!(sources.iter().all(|&s| s < 8));
        for (vertex, &source) in mesh.vertices.iter().zip(sources.iter()) {
            let corner = Vector3::new(
                (source & 1) as f32,
                ((source >> 1) & 1) as f32,
                (source >> 2) as f32,
            );
            assert_eq!(vertex.world_position, corner);
        }
        assert!((mesh.area() - 6.0).abs() < 1.0e-5);
    }
}
