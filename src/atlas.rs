//! Packs every mesh into its own square region of a shared lightmap atlas and writes
//! atlas coordinates into the second texture coordinates of mesh vertices.

use crate::{
    chart::{ChartLayout, MeshCharts},
    error::PackingError,
    input::Mesh,
    math::Rect,
    EntityId,
};
use fxhash::FxHashMap;
use nalgebra::Vector2;
use rayon::prelude::*;

/// How many texels a world unit of surface gets.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TexelDensity {
    /// Fixed amount of texels per world unit.
    Fixed(f32),
    /// Density is picked so padded regions occupy about a half of the atlas.
    Fit,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AtlasSettings {
    /// Width and height of the atlas in texels.
    pub resolution: u32,
    /// Amount of empty texels around each chart, prevents filter bleeding.
    pub padding: u32,
    pub texel_density: TexelDensity,
}

impl Default for AtlasSettings {
    fn default() -> Self {
        Self {
            resolution: 1024,
            padding: 2,
            texel_density: TexelDensity::Fit,
        }
    }
}

/// Texel-space rectangle occupied by a single mesh, padding included.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AtlasRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub padding: u32,
}

impl AtlasRegion {
    pub fn intersects(&self, other: &AtlasRegion) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    /// Normalized rectangle of region interior (without padding).
    pub fn interior_uv_rect(&self, resolution: u32) -> Rect<f32> {
        let scale = 1.0 / resolution as f32;
        Rect::new(
            (self.x + self.padding) as f32 * scale,
            (self.y + self.padding) as f32 * scale,
            self.width.saturating_sub(self.padding.saturating_mul(2)) as f32 * scale,
            self.height.saturating_sub(self.padding.saturating_mul(2)) as f32 * scale,
        )
    }
}

pub struct Atlas<Id: EntityId> {
    resolution: u32,
    texels_per_unit: f32,
    /// Regions in the same order as meshes.
    regions: Vec<AtlasRegion>,
    source_vertices: Vec<Vec<u32>>,
    by_owner: FxHashMap<Id, Vec<usize>>,
}

impl<Id: EntityId> Atlas<Id> {
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Texel density that was used for the layout.
    pub fn texels_per_unit(&self) -> f32 {
        self.texels_per_unit
    }

    pub fn regions(&self) -> &[AtlasRegion] {
        &self.regions
    }

    /// Returns regions of every mesh with given owner.
    pub fn regions_of(&self, owner: Id) -> impl Iterator<Item = &AtlasRegion> + '_ {
        self.by_owner
            .get(&owner)
            .into_iter()
            .flatten()
            .map(|&i| &self.regions[i])
    }

    /// Unwrapping duplicates vertices along chart seams. For every vertex of the mesh
    /// returns the index it had before unwrapping.
    pub fn source_vertices(&self, mesh: usize) -> Option<&[u32]> {
        self.source_vertices.get(mesh).map(Vec::as_slice)
    }

    /// Returns the index of the mesh whose region contains the texel.
    pub fn mesh_of_texel(&self, x: u32, y: u32) -> Option<usize> {
        self.regions.iter().position(|r| r.contains(x, y))
    }
}

struct FreeRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

/// Best short side fit.
fn find_free_rect(free_rects: &[FreeRect], w: u32, h: u32) -> Option<usize> {
    let mut best = None;
    let mut best_short_side = u32::MAX;
    for (i, rect) in free_rects.iter().enumerate() {
        if rect.w >= w && rect.h >= h {
            let short_side = (rect.w - w).min(rect.h - h);
            if short_side < best_short_side {
                best_short_side = short_side;
                best = Some(i);
            }
        }
    }
    best
}

fn split_free_rect(free_rects: &mut Vec<FreeRect>, rect: &FreeRect, w: u32, h: u32) {
    let right_w = rect.w - w;
    let below_h = rect.h - h;

    // Split along the shorter leftover axis so the bigger leftover stays in one piece.
    if right_w < below_h {
        if right_w > 0 {
            free_rects.push(FreeRect {
                x: rect.x + w,
                y: rect.y,
                w: right_w,
                h,
            });
        }
        if below_h > 0 {
            free_rects.push(FreeRect {
                x: rect.x,
                y: rect.y + h,
                w: rect.w,
                h: below_h,
            });
        }
    } else {
        if right_w > 0 {
            free_rects.push(FreeRect {
                x: rect.x + w,
                y: rect.y,
                w: right_w,
                h: rect.h,
            });
        }
        if below_h > 0 {
            free_rects.push(FreeRect {
                x: rect.x,
                y: rect.y + h,
                w,
                h: below_h,
            });
        }
    }
}

/// Guillotine packing of squares with given sides into a square atlas. Returns
/// top-left corners in the same order as `sides`.
fn pack(sides: &[u32], resolution: u32) -> Option<Vec<(u32, u32)>> {
    let mut order: Vec<usize> = (0..sides.len()).collect();
    // Stable sort keeps input order for equal sizes, layout is reproducible.
    order.sort_by(|&a, &b| sides[b].cmp(&sides[a]));

    let mut free_rects = vec![FreeRect {
        x: 0,
        y: 0,
        w: resolution,
        h: resolution,
    }];
    let mut positions = vec![(0, 0); sides.len()];

    for index in order {
        let side = sides[index];
        let rect = free_rects.remove(find_free_rect(&free_rects, side, side)?);
        positions[index] = (rect.x, rect.y);
        split_free_rect(&mut free_rects, &rect, side, side);
    }

    Some(positions)
}

fn fit_density<Id: EntityId>(meshes: &[Mesh<Id>], settings: &AtlasSettings) -> f32 {
    let total_area: f32 = meshes.iter().map(|m| m.area()).sum();
    let padding_area = meshes.len() as f32 * (2.0 * settings.padding as f32).powi(2);
    let available = 0.5 * (settings.resolution as f32).powi(2) - padding_area;
    if !total_area.is_finite() || total_area <= f32::EPSILON || available <= 0.0 {
        1.0
    } else {
        (available / total_area).sqrt()
    }
}

struct Placement {
    layouts: Vec<ChartLayout>,
    positions: Vec<(u32, u32)>,
}

fn place(charts: &[MeshCharts], density: f32, settings: &AtlasSettings) -> Option<Placement> {
    let layouts = charts
        .iter()
        .map(|c| c.layout(density, settings.padding, settings.resolution))
        .collect::<Option<Vec<_>>>()?;
    let sides: Vec<u32> = layouts.iter().map(|l| l.side).collect();
    let positions = pack(&sides, settings.resolution)?;
    Some(Placement { layouts, positions })
}

/// Unwraps every mesh into planar charts, packs charts of each mesh into a square
/// region and packs the regions into the atlas. Vertices along chart seams are
/// duplicated, atlas coordinates are written into `second_tex_coord` of every vertex.
/// Packing is deterministic for the same input order.
///
/// With [`TexelDensity::Fit`] density is lowered step by step until regions fit, with
/// [`TexelDensity::Fixed`] there is only one attempt.
pub fn generate_atlas<Id: EntityId>(
    meshes: &mut [Mesh<Id>],
    settings: &AtlasSettings,
) -> Result<Atlas<Id>, PackingError> {
    const FIT_ATTEMPTS: usize = 32;

    let resolution = settings.resolution;
    let (mut density, attempts) = match settings.texel_density {
        TexelDensity::Fixed(density) => (density, 1),
        TexelDensity::Fit => (fit_density(meshes, settings), FIT_ATTEMPTS),
    };

    let charts: Vec<MeshCharts> = meshes.par_iter().map(|m| MeshCharts::new(m)).collect();

    let mut placement = None;
    for attempt in 0..attempts {
        if attempt > 0 {
            density *= 0.9;
        }
        placement = place(&charts, density, settings);
        if placement.is_some() {
            break;
        }
    }

    let placement = placement.ok_or_else(|| PackingError {
        regions: meshes.len(),
        requested: charts
            .iter()
            .map(|c| c.requested_texels(density, settings.padding))
            .fold(0u64, u64::saturating_add),
        resolution,
    })?;

    let mut regions = Vec::with_capacity(meshes.len());
    let mut source_vertices = Vec::with_capacity(meshes.len());
    let mut by_owner: FxHashMap<Id, Vec<usize>> = FxHashMap::default();

    for (index, ((mesh, mesh_charts), (layout, &(x, y)))) in meshes
        .iter_mut()
        .zip(charts.iter())
        .zip(placement.layouts.iter().zip(placement.positions.iter()))
        .enumerate()
    {
        source_vertices.push(mesh_charts.apply(
            mesh,
            layout,
            Vector2::new(x as f32, y as f32),
            density,
            settings.padding,
            resolution,
        ));
        regions.push(AtlasRegion {
            x,
            y,
            width: layout.side,
            height: layout.side,
            padding: settings.padding,
        });
        by_owner.entry(mesh.owner).or_default().push(index);
    }

    log::info!(
        "Packed {} meshes ({} charts) into {}x{} lightmap atlas at {:.3} texels per unit.",
        regions.len(),
        charts.iter().map(|c| c.charts().len()).sum::<usize>(),
        resolution,
        resolution,
        density
    );

    Ok(Atlas {
        resolution,
        texels_per_unit: density,
        regions,
        source_vertices,
        by_owner,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::input::test::quad;

    fn scene() -> Vec<Mesh<u32>> {
        vec![
            quad(0, Vector2::new(0.0, 0.0), 4.0, 0.0),
            quad(1, Vector2::new(5.0, 0.0), 1.0, 0.0),
            quad(2, Vector2::new(0.0, 5.0), 2.0, 1.0),
            quad(1, Vector2::new(9.0, 9.0), 1.0, 0.0),
            quad(3, Vector2::new(-3.0, 0.0), 3.0, 2.0),
        ]
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let mut meshes = scene();
        let settings = AtlasSettings {
            resolution: 64,
            padding: 1,
            texel_density: TexelDensity::Fixed(4.0),
        };
        let atlas = generate_atlas(&mut meshes, &settings).unwrap();
        let regions = atlas.regions();
        assert_eq!(regions.len(), meshes.len());
        for (i, a) in regions.iter().enumerate() {
            assert!(a.x + a.width <= 64 && a.y + a.height <= 64);
            for b in regions.iter().skip(i + 1) {
                assert!(!a.intersects(b), "{:?} overlaps {:?}", a, b);
            }
        }
        assert_eq!(regions[0].width, 16 + 2);
        assert_eq!(atlas.regions_of(1).count(), 2);
    }

    #[test]
    fn test_second_tex_coords_inside_region() {
        let mut meshes = scene();
        let settings = AtlasSettings {
            resolution: 128,
            padding: 2,
            texel_density: TexelDensity::Fit,
        };
        let atlas = generate_atlas(&mut meshes, &settings).unwrap();
        for (mesh, region) in meshes.iter().zip(atlas.regions()) {
            for vertex in mesh.vertices.iter() {
                let texel = vertex.second_tex_coord.scale(128.0);
                assert!(texel.x >= (region.x + region.padding) as f32 - 1.0e-3);
                assert!(texel.y >= (region.y + region.padding) as f32 - 1.0e-3);
                assert!(texel.x <= (region.x + region.width - region.padding) as f32 + 1.0e-3);
                assert!(texel.y <= (region.y + region.height - region.padding) as f32 + 1.0e-3);
            }
        }
    }

    #[test]
    fn test_layout_is_deterministic() {
        let settings = AtlasSettings {
            resolution: 64,
            padding: 1,
            texel_density: TexelDensity::Fixed(3.0),
        };
        let mut first = scene();
        let mut second = scene();
        let a = generate_atlas(&mut first, &settings).unwrap();
        let b = generate_atlas(&mut second, &settings).unwrap();
        assert_eq!(a.regions(), b.regions());
        for (ma, mb) in first.iter().zip(second.iter()) {
            for (va, vb) in ma.vertices.iter().zip(mb.vertices.iter()) {
                assert_eq!(va.second_tex_coord, vb.second_tex_coord);
            }
        }
    }

    #[test]
    fn test_packing_error() {
        let mut meshes = scene();
        let settings = AtlasSettings {
            resolution: 16,
            padding: 1,
            texel_density: TexelDensity::Fixed(4.0),
        };
        let err = generate_atlas(&mut meshes, &settings).err().unwrap();
        assert_eq!(err.resolution, 16);
        assert_eq!(err.regions, 5);
    }

    #[test]
    fn test_extreme_layout_is_packing_error() {
        for (padding, texel_density) in [
            (1, TexelDensity::Fixed(f32::MAX)),
            (1, TexelDensity::Fixed(1.0e30)),
            (u32::MAX, TexelDensity::Fixed(1.0)),
            (u32::MAX, TexelDensity::Fit),
            (u32::MAX / 2 + 1, TexelDensity::Fit),
        ] {
            let mut meshes = scene();
            let settings = AtlasSettings {
                resolution: 1024,
                padding,
                texel_density,
            };
            let err = generate_atlas(&mut meshes, &settings).err().unwrap();
            assert_eq!(err.regions, 5);
            assert!(err.requested > 1024 * 1024);
        }

        let mut meshes = scene();
        let settings = AtlasSettings {
            resolution: 1024,
            padding: 1,
            texel_density: TexelDensity::Fixed(f32::MAX),
        };
        let err = generate_atlas(&mut meshes, &settings).err().unwrap();
        assert_eq!(err.requested, u64::MAX);
    }

    #[test]
    fn test_exact_fit() {
        let mut meshes = vec![
            quad(0, Vector2::new(0.0, 0.0), 1.0, 0.0),
            quad(1, Vector2::new(0.0, 0.0), 1.0, 1.0),
            quad(2, Vector2::new(0.0, 0.0), 1.0, 2.0),
            quad(3, Vector2::new(0.0, 0.0), 1.0, 3.0),
        ];
        let settings = AtlasSettings {
            resolution: 4,
            padding: 0,
            texel_density: TexelDensity::Fixed(2.0),
        };
        let atlas = generate_atlas(&mut meshes, &settings).unwrap();
        let covered: u32 = atlas.regions().iter().map(|r| r.width * r.height).sum();
        assert_eq!(covered, 16);
        assert_eq!(atlas.mesh_of_texel(0, 0), Some(0));
        assert_eq!(atlas.mesh_of_texel(3, 3), Some(3));
    }
}
