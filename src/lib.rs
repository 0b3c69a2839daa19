//! Progressive light map baker.
//!
//! Surfaces of every mesh are unwrapped into planar charts and packed into a shared
//! atlas, world-space positions and normals are rasterized into it and then each texel
//! gathers direct, indirect and ambient light by casting rays against a bounding volume
//! hierarchy of the scene. Light is accumulated over repeated passes, so the result
//! improves the longer you render.
//!
//! ```no_run
//! use lightbake::{
//!     baker::LightBaker, input::Mesh, lightmapper::BakeConfig, progress::CancellationToken,
//! };
//!
//! fn bake(meshes: &mut [Mesh<u32>]) -> Result<(), lightbake::error::LightmapGenerationError> {
//!     let mut baker = LightBaker::new(BakeConfig::default())?;
//!     baker.rebuild(meshes, &CancellationToken::new())?;
//!     for _ in 0..16 {
//!         baker.render()?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Performance
//!
//! This is CPU lightmapper, its performance is linear with core count of your CPU.

#![forbid(unsafe_code)]

pub use fyrox_math as math;

pub mod atlas;
pub mod baker;
pub mod bvh;
pub mod chart;
pub mod error;
pub mod input;
pub mod light;
pub mod lightmapper;
pub mod progress;
pub mod raster;

use crate::lightmapper::FilterMode;
use std::hash::Hash;

pub trait EntityId: Hash + Copy + Clone + Eq + PartialEq + Send + Sync {}

impl<T: Hash + Copy + Clone + Eq + PartialEq + Send + Sync> EntityId for T {}

/// Texture of the consuming renderer.
pub trait Texture: Sized {
    fn from_rgb8(width: u32, height: u32, filter: FilterMode, bytes: Vec<u8>) -> Self;
}
