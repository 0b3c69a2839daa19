//! Rasterization of world-space surface attributes into the lightmap atlas.

use crate::{input::Mesh, math, EntityId};
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Coverage {
    /// Texel is not owned by any surface, it must never be sampled.
    #[default]
    Empty,
    /// Texel center maps to a surface triangle.
    Covered,
    /// Texel was filled from a neighbour to prevent seams under bilinear filtration.
    Dilated,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct GBufferTexel {
    pub position: Vector3<f32>,
    pub normal: Vector3<f32>,
    pub coverage: Coverage,
}

impl GBufferTexel {
    pub fn is_valid(&self) -> bool {
        self.coverage != Coverage::Empty
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RasterSettings {
    /// Normals are averaged over `supersampling x supersampling` samples per texel.
    pub supersampling: u32,
    /// Amount of dilation passes over empty texels.
    pub dilation: u32,
}

impl Default for RasterSettings {
    fn default() -> Self {
        Self {
            supersampling: 2,
            dilation: 1,
        }
    }
}

/// Dense position and normal buffers of the atlas.
pub struct GBuffer {
    resolution: u32,
    texels: Vec<GBufferTexel>,
}

impl GBuffer {
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn texels(&self) -> &[GBufferTexel] {
        &self.texels
    }

    pub fn texel(&self, x: u32, y: u32) -> Option<&GBufferTexel> {
        if x < self.resolution && y < self.resolution {
            self.texels
                .get(y as usize * self.resolution as usize + x as usize)
        } else {
            None
        }
    }

    /// Index of the texel that contains given atlas coordinates.
    pub fn texel_index(&self, uv: Vector2<f32>) -> usize {
        let max = self.resolution as i64 - 1;
        let x = ((uv.x * self.resolution as f32).floor() as i64).clamp(0, max);
        let y = ((uv.y * self.resolution as f32).floor() as i64).clamp(0, max);
        (y * self.resolution as i64 + x) as usize
    }

    pub fn valid_count(&self) -> usize {
        self.texels.iter().filter(|t| t.is_valid()).count()
    }

    pub fn positions(&self) -> Vec<Vector3<f32>> {
        self.texels.iter().map(|t| t.position).collect()
    }

    /// Normals of every texel, empty texels have zero normal.
    pub fn normals(&self) -> Vec<Vector3<f32>> {
        self.texels.iter().map(|t| t.normal).collect()
    }
}

struct GridCell {
    // Pairs of mesh and triangle indices.
    triangles: Vec<(usize, usize)>,
}

struct Grid {
    cells: Vec<GridCell>,
    size: usize,
    fsize: f32,
}

impl Grid {
    /// Creates uniform grid where each cell contains list of triangles whose second
    /// texture coordinates (expanded by `margin`) intersect with it.
    fn new<Id: EntityId>(meshes: &[Mesh<Id>], size: usize, margin: f32) -> Self {
        let fsize = size as f32;
        let mut cells: Vec<GridCell> = (0..size * size)
            .map(|_| GridCell {
                triangles: Vec::new(),
            })
            .collect();

        let to_cell = |v: f32| ((v * fsize).floor().max(0.0) as usize).min(size - 1);

        for (mesh_index, mesh) in meshes.iter().enumerate() {
            for (triangle_index, triangle) in mesh.triangles.iter().enumerate() {
                let uv_a = mesh.vertices[triangle[0] as usize].second_tex_coord;
                let uv_b = mesh.vertices[triangle[1] as usize].second_tex_coord;
                let uv_c = mesh.vertices[triangle[2] as usize].second_tex_coord;
                let uv_min = uv_a.inf(&uv_b).inf(&uv_c).add_scalar(-margin);
                let uv_max = uv_a.sup(&uv_b).sup(&uv_c).add_scalar(margin);

                for y in to_cell(uv_min.y)..=to_cell(uv_max.y) {
                    for x in to_cell(uv_min.x)..=to_cell(uv_max.x) {
                        cells[y * size + x]
                            .triangles
                            .push((mesh_index, triangle_index));
                    }
                }
            }
        }

        Self { cells, size, fsize }
    }

    fn pick(&self, v: Vector2<f32>) -> Option<&GridCell> {
        if v.x < 0.0 || v.y < 0.0 {
            return None;
        }
        let ix = (v.x * self.fsize) as usize;
        let iy = (v.y * self.fsize) as usize;
        if ix >= self.size || iy >= self.size {
            return None;
        }
        self.cells.get(iy * self.size + ix)
    }
}

/// Interpolates world position and normal of a triangle at given atlas coordinates,
/// if the coordinates lie inside of it.
fn sample_triangle<Id: EntityId>(
    uv: Vector2<f32>,
    mesh: &Mesh<Id>,
    triangle_index: usize,
) -> Option<(Vector3<f32>, Vector3<f32>)> {
    let triangle = &mesh.triangles[triangle_index];
    let a = &mesh.vertices[triangle[0] as usize];
    let b = &mesh.vertices[triangle[1] as usize];
    let c = &mesh.vertices[triangle[2] as usize];

    let barycentric = math::get_barycentric_coords_2d(
        uv,
        a.second_tex_coord,
        b.second_tex_coord,
        c.second_tex_coord,
    );

    if !math::barycentric_is_inside(barycentric) {
        return None;
    }

    let position =
        math::barycentric_to_world(barycentric, a.world_position, b.world_position, c.world_position);
    let normal =
        math::barycentric_to_world(barycentric, a.world_normal, b.world_normal, c.world_normal)
            .try_normalize(f32::EPSILON)?;

    if position.iter().all(|v| v.is_finite()) {
        Some((position, normal))
    } else {
        None
    }
}

/// Calculates properties of pixel (world position, normal) at given position.
fn pick<Id: EntityId>(
    uv: Vector2<f32>,
    grid: &Grid,
    meshes: &[Mesh<Id>],
    scale: f32,
) -> Option<(Vector3<f32>, Vector3<f32>)> {
    let cell = grid.pick(uv)?;

    for &(mesh_index, triangle_index) in cell.triangles.iter() {
        if let Some(sample) = sample_triangle(uv, &meshes[mesh_index], triangle_index) {
            return Some(sample);
        }
    }

    // Nothing covers texel center, try conservative rasterization. Offsets stay inside
    // of the texel footprint so neighbouring regions never steal texels.
    for &(mesh_index, triangle_index) in cell.triangles.iter() {
        let mesh = &meshes[mesh_index];
        let triangle = &mesh.triangles[triangle_index];
        let uv_a = mesh.vertices[triangle[0] as usize].second_tex_coord;
        let uv_b = mesh.vertices[triangle[1] as usize].second_tex_coord;
        let uv_c = mesh.vertices[triangle[2] as usize].second_tex_coord;

        let center = (uv_a + uv_b + uv_c).scale(1.0 / 3.0);
        let to_center = (center - uv)
            .try_normalize(f32::EPSILON)
            .unwrap_or_default()
            .scale(scale * 0.2);

        let mut current_uv = uv + to_center;
        for _ in 0..2 {
            if let Some(sample) = sample_triangle(current_uv, mesh, triangle_index) {
                return Some(sample);
            }
            current_uv += to_center;
        }
    }

    None
}

/// Averages normals over a regular grid of sub-texel samples.
fn supersample_normal<Id: EntityId>(
    x: u32,
    y: u32,
    grid: &Grid,
    meshes: &[Mesh<Id>],
    scale: f32,
    samples: u32,
) -> Option<Vector3<f32>> {
    let step = scale / samples as f32;
    let mut sum = Vector3::default();
    for sy in 0..samples {
        for sx in 0..samples {
            let uv = Vector2::new(
                x as f32 * scale + (sx as f32 + 0.5) * step,
                y as f32 * scale + (sy as f32 + 0.5) * step,
            );
            if let Some(cell) = grid.pick(uv) {
                if let Some((_, normal)) = cell
                    .triangles
                    .iter()
                    .find_map(|&(m, t)| sample_triangle(uv, &meshes[m], t))
                {
                    sum += normal;
                }
            }
        }
    }
    sum.try_normalize(f32::EPSILON)
}

/// Fills empty texels from their first valid neighbour, one ring per pass.
fn dilate(texels: &mut [GBufferTexel], resolution: u32, passes: u32) {
    let size = resolution as i64;
    for _ in 0..passes {
        let source = texels.to_vec();
        let fetch = |x: i64, y: i64| {
            if x < 0 || y < 0 || x >= size || y >= size {
                return None;
            }
            source
                .get((y * size + x) as usize)
                .filter(|texel| texel.is_valid())
        };

        let mut changed = false;
        for y in 0..size {
            for x in 0..size {
                let index = (y * size + x) as usize;
                if source[index].is_valid() {
                    continue;
                }
                let neighbour = [
                    (-1, 0),
                    (1, 0),
                    (0, -1),
                    (0, 1),
                    (-1, -1),
                    (1, -1),
                    (1, 1),
                    (-1, 1),
                ]
                .iter()
                .find_map(|&(dx, dy)| fetch(x + dx, y + dy));

                if let Some(neighbour) = neighbour {
                    texels[index] = GBufferTexel {
                        coverage: Coverage::Dilated,
                        ..*neighbour
                    };
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }
}

/// Rasterizes world-space positions and normals of meshes into the atlas. Meshes must
/// already have atlas coordinates, see [`crate::atlas::generate_atlas`].
pub fn rasterize<Id: EntityId>(
    meshes: &[Mesh<Id>],
    resolution: u32,
    settings: &RasterSettings,
) -> GBuffer {
    let scale = 1.0 / resolution as f32;
    let half_pixel = scale * 0.5;
    let grid = Grid::new(meshes, (resolution / 16).clamp(1, 256) as usize, scale);
    let samples = settings.supersampling.max(1);

    let mut texels = vec![GBufferTexel::default(); resolution as usize * resolution as usize];

    texels
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, texel): (usize, &mut GBufferTexel)| {
            let x = (i % resolution as usize) as u32;
            let y = (i / resolution as usize) as u32;

            let uv = Vector2::new(x as f32 * scale + half_pixel, y as f32 * scale + half_pixel);

            if let Some((position, mut normal)) = pick(uv, &grid, meshes, scale) {
                if samples > 1 {
                    if let Some(averaged) =
                        supersample_normal(x, y, &grid, meshes, scale, samples)
                    {
                        normal = averaged;
                    }
                }
                *texel = GBufferTexel {
                    position,
                    normal,
                    coverage: Coverage::Covered,
                };
            }
        });

    dilate(&mut texels, resolution, settings.dilation);

    let gbuffer = GBuffer { resolution, texels };

    log::info!(
        "Rasterized {} of {} lightmap texels.",
        gbuffer.valid_count(),
        gbuffer.texels.len()
    );

    gbuffer
}
