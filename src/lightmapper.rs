//! Progressive lightmapper.
//!
//! Every [`Lightmapper::render`] call is a single accumulation pass over all valid
//! texels of the atlas. Texels are independent within a pass and are processed in
//! parallel. Indirect lighting reads the result of the previous pass, so accumulation is
//! double buffered: a pass reads the front buffer, writes the back buffer and the
//! buffers are swapped only when the whole pass has succeeded.

use crate::{
    bvh::AccelerationStructure,
    error::{ConfigError, StructureQueryError},
    light::{cosine_hemisphere, AreaLight},
    math::ray::Ray,
    raster::{GBuffer, GBufferTexel},
    Texture,
};
use nalgebra::{Vector2, Vector3, Vector4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;

/// Defines how the consuming renderer samples the lightmap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum AccumulationPolicy {
    /// Lightmap holds the mean of every pass since the last reset.
    #[default]
    RunningAverage,
    /// Lightmap holds the result of the latest pass only.
    Overwrite,
}

/// What indirect rays gather from surfaces they hit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum IndirectSource {
    /// Accumulated direct light only, a single bounce.
    #[default]
    Direct,
    /// Everything accumulated so far, bounces add up over passes.
    Full,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BakeConfig {
    /// Width and height of the lightmap in texels.
    pub resolution: u32,
    /// Amount of rays per texel per pass for each enabled term.
    pub casts: u32,
    pub light: AreaLight,
    /// Max distance at which geometry occludes ambient light.
    pub ambient_distance: f32,
    pub filter: FilterMode,
    pub direct_light_enabled: bool,
    pub indirect_light_enabled: bool,
    pub ambient_light_enabled: bool,
    pub accumulation: AccumulationPolicy,
    pub indirect_source: IndirectSource,
    /// Offset of ray origins along surface normal, prevents self-intersection.
    pub surface_bias: f32,
    pub seed: u64,
}

impl Default for BakeConfig {
    fn default() -> Self {
        Self {
            resolution: 1024,
            casts: 1,
            light: AreaLight::default(),
            ambient_distance: 0.3,
            filter: FilterMode::Linear,
            direct_light_enabled: true,
            indirect_light_enabled: false,
            ambient_light_enabled: false,
            accumulation: AccumulationPolicy::RunningAverage,
            indirect_source: IndirectSource::Direct,
            surface_bias: 0.001,
            seed: 0,
        }
    }
}

/// Largest supported lightmap side in texels.
pub const MAX_RESOLUTION: u32 = 16384;

fn check_parameter(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter { name, value })
    }
}

impl BakeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolution == 0 {
            return Err(ConfigError::ZeroResolution);
        }
        if self.resolution > MAX_RESOLUTION {
            return Err(ConfigError::ResolutionTooLarge {
                resolution: self.resolution,
                max: MAX_RESOLUTION,
            });
        }
        if self.casts == 0 {
            return Err(ConfigError::ZeroCasts);
        }
        check_parameter("light.size", self.light.size)?;
        check_parameter("light.intensity", self.light.intensity)?;
        check_parameter("ambient_distance", self.ambient_distance)?;
        check_parameter("surface_bias", self.surface_bias)?;
        if let Some(&value) = self.light.position.iter().find(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidParameter {
                name: "light.position",
                value,
            });
        }
        Ok(())
    }

    fn any_term_enabled(&self) -> bool {
        self.direct_light_enabled || self.indirect_light_enabled || self.ambient_light_enabled
    }
}

/// Statistics of a single pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Number of passes accumulated after this one.
    pub passes: u32,
    pub texels: u64,
    pub rays: u64,
}

#[derive(Clone)]
struct Accumulation {
    radiance: Vec<Vector4<f32>>,
    /// Direct part of radiance, gathered by single-bounce indirect rays.
    direct: Vec<Vector3<f32>>,
}

impl Accumulation {
    fn new(len: usize) -> Self {
        Self {
            radiance: vec![Vector4::default(); len],
            direct: vec![Vector3::default(); len],
        }
    }

    fn clear(&mut self) {
        self.radiance.fill(Vector4::default());
        self.direct.fill(Vector3::default());
    }
}

struct TexelSample {
    direct: Vector3<f32>,
    radiance: Vector3<f32>,
    rays: u64,
}

pub struct Lightmapper {
    gbuffer: Arc<GBuffer>,
    bvh: Arc<AccelerationStructure>,
    config: BakeConfig,
    front: Accumulation,
    back: Accumulation,
    passes: u32,
}

impl Lightmapper {
    /// Creates lightmapper in ready state. Lightmap resolution is taken from the
    /// G-buffer, `config.resolution` is not used here. Zero casts are allowed and make
    /// passes no-op.
    pub fn new(gbuffer: Arc<GBuffer>, bvh: Arc<AccelerationStructure>, config: BakeConfig) -> Self {
        let len = gbuffer.texels().len();
        Self {
            gbuffer,
            bvh,
            config,
            front: Accumulation::new(len),
            back: Accumulation::new(len),
            passes: 0,
        }
    }

    pub fn config(&self) -> &BakeConfig {
        &self.config
    }

    /// New config is used starting from the next pass. Accumulated light is kept.
    pub fn set_config(&mut self, config: BakeConfig) {
        self.config = config;
    }

    pub fn set_light(&mut self, light: AreaLight) {
        self.config.light = light;
    }

    pub fn gbuffer(&self) -> &GBuffer {
        &self.gbuffer
    }

    pub fn acceleration_structure(&self) -> &AccelerationStructure {
        &self.bvh
    }

    pub fn resolution(&self) -> u32 {
        self.gbuffer.resolution()
    }

    pub fn filter(&self) -> FilterMode {
        self.config.filter
    }

    /// Amount of passes accumulated since last reset.
    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Accumulated radiance, row by row. Alpha is 1 for valid texels and 0 otherwise.
    pub fn lightmap(&self) -> &[Vector4<f32>] {
        &self.front.radiance
    }

    /// Clears accumulated light. Atlas and acceleration structure are kept.
    pub fn reset(&mut self) {
        self.front.clear();
        self.back.clear();
        self.passes = 0;
    }

    /// Performs one accumulation pass. On error accumulated light stays as it was
    /// before the pass.
    pub fn render(&mut self) -> Result<PassStats, StructureQueryError> {
        let config = self.config;

        if config.casts == 0 {
            log::debug!("Skipping lightmap pass with zero casts.");
            return Ok(PassStats {
                passes: self.passes,
                ..Default::default()
            });
        }

        let pass = self.passes;
        let gbuffer = &*self.gbuffer;
        let bvh = &*self.bvh;
        let front = &self.front;

        let result = self
            .back
            .radiance
            .par_iter_mut()
            .zip(self.back.direct.par_iter_mut())
            .enumerate()
            .map(|(i, (radiance, direct))| -> Result<(u64, u64), StructureQueryError> {
                let texel = &gbuffer.texels()[i];
                if !texel.is_valid() {
                    *radiance = Vector4::default();
                    *direct = Vector3::default();
                    return Ok((0, 0));
                }

                let mut rng = texel_rng(config.seed, pass, i);
                let sample = shade_texel(texel, &config, bvh, gbuffer, front, &mut rng)?;

                match config.accumulation {
                    AccumulationPolicy::RunningAverage => {
                        let k = 1.0 / (pass + 1) as f32;
                        let previous = front.radiance[i].xyz();
                        let mean = previous + (sample.radiance - previous).scale(k);
                        *radiance = Vector4::new(mean.x, mean.y, mean.z, 1.0);
                        *direct = front.direct[i] + (sample.direct - front.direct[i]).scale(k);
                    }
                    AccumulationPolicy::Overwrite => {
                        let r = sample.radiance;
                        *radiance = Vector4::new(r.x, r.y, r.z, 1.0);
                        *direct = sample.direct;
                    }
                }

                Ok((1, sample.rays))
            })
            .try_reduce(|| (0, 0), |a, b| Ok((a.0 + b.0, a.1 + b.1)));

        let (texels, rays) = match result {
            Ok(totals) => totals,
            Err(err) => {
                log::error!("Lightmap pass {} was discarded: {}", pass, err);
                return Err(err);
            }
        };

        std::mem::swap(&mut self.front, &mut self.back);
        self.passes += 1;

        log::debug!(
            "Lightmap pass {} done: {} texels, {} rays.",
            pass,
            texels,
            rays
        );

        Ok(PassStats {
            passes: self.passes,
            texels,
            rays,
        })
    }

    /// Converts accumulated light into 8-bit RGB texture.
    pub fn to_texture<Tex: Texture>(&self) -> Tex {
        let mut bytes = Vec::with_capacity(self.front.radiance.len() * 3);
        for pixel in self.front.radiance.iter() {
            bytes.push((pixel.x.clamp(0.0, 1.0) * 255.0) as u8);
            bytes.push((pixel.y.clamp(0.0, 1.0) * 255.0) as u8);
            bytes.push((pixel.z.clamp(0.0, 1.0) * 255.0) as u8);
        }
        let resolution = self.resolution();
        Tex::from_rgb8(resolution, resolution, self.config.filter, bytes)
    }
}

/// Every texel of every pass has its own random sequence, so results do not depend on
/// the order in which texels are processed.
fn texel_rng(seed: u64, pass: u32, texel: usize) -> StdRng {
    let key = seed
        ^ (pass as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (texel as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    StdRng::seed_from_u64(key)
}

fn random_uv(rng: &mut StdRng) -> Vector2<f32> {
    Vector2::new(rng.gen(), rng.gen())
}

fn shade_texel(
    texel: &GBufferTexel,
    config: &BakeConfig,
    bvh: &AccelerationStructure,
    gbuffer: &GBuffer,
    previous: &Accumulation,
    rng: &mut StdRng,
) -> Result<TexelSample, StructureQueryError> {
    let normal = texel.normal;
    let origin = texel.position + normal.scale(config.surface_bias);
    let inv_casts = 1.0 / config.casts as f32;
    let mut rays = 0;

    let mut direct = Vector3::default();
    if config.direct_light_enabled {
        let mut visible = 0;
        for _ in 0..config.casts {
            let target = config.light.sample_point(texel.position, random_uv(rng));
            let to_light = target - origin;
            let distance = to_light.norm();
            // Light behind the surface is blocked by the surface itself.
            if to_light.dot(&normal) <= 0.0 {
                continue;
            }
            rays += 1;
            let max_distance = distance - config.surface_bias;
            if max_distance <= 0.0 || !bvh.occluded(&Ray::new(origin, to_light), max_distance)? {
                visible += 1;
            }
        }
        direct = config.light.radiance().scale(visible as f32 * inv_casts);
    }

    let mut indirect = Vector3::default();
    if config.indirect_light_enabled {
        for _ in 0..config.casts {
            let dir = cosine_hemisphere(normal, random_uv(rng));
            rays += 1;
            if let Some(hit) = bvh.intersect(&Ray::new(origin, dir), f32::MAX)? {
                // Back faces do not emit anything.
                if hit.normal.dot(&dir) < 0.0 {
                    let index = gbuffer.texel_index(hit.second_tex_coord);
                    indirect += match config.indirect_source {
                        IndirectSource::Direct => previous.direct[index],
                        IndirectSource::Full => previous.radiance[index].xyz(),
                    };
                }
            }
        }
        indirect = indirect.scale(inv_casts);
    }

    let mut ambient = 1.0;
    if config.ambient_light_enabled {
        let mut occluded = 0;
        for _ in 0..config.casts {
            let dir = cosine_hemisphere(normal, random_uv(rng));
            rays += 1;
            if bvh.occluded(&Ray::new(origin, dir), config.ambient_distance)? {
                occluded += 1;
            }
        }
        ambient = 1.0 - occluded as f32 * inv_casts;
    }

    let base = if config.direct_light_enabled || config.indirect_light_enabled {
        direct + indirect
    } else if config.any_term_enabled() {
        // Ambient alone darkens white, which gives an ambient occlusion map.
        Vector3::repeat(1.0)
    } else {
        Vector3::default()
    };

    Ok(TexelSample {
        direct,
        radiance: base.scale(ambient),
        rays,
    })
}
