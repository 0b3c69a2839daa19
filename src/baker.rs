//! Bake session: keeps atlas, G-buffer, acceleration structure and lightmapper of a
//! scene together and drives them through `rebuild`, `configure`, `render` and `reset`.

use crate::{
    atlas::{generate_atlas, Atlas, AtlasSettings, TexelDensity},
    bvh::AccelerationStructure,
    error::LightmapGenerationError,
    input::Mesh,
    lightmapper::{BakeConfig, Lightmapper, PassStats},
    progress::{CancellationToken, ProgressIndicator, ProgressStage},
    raster::{rasterize, GBuffer, RasterSettings},
    EntityId,
};
use std::sync::Arc;

/// Scene-dependent part of a bake session.
struct BakeState<Id: EntityId> {
    atlas: Atlas<Id>,
    lightmapper: Lightmapper,
}

pub struct LightBaker<Id: EntityId> {
    config: BakeConfig,
    padding: u32,
    texel_density: TexelDensity,
    raster: RasterSettings,
    progress: ProgressIndicator,
    state: Option<BakeState<Id>>,
}

impl<Id: EntityId> Default for LightBaker<Id> {
    fn default() -> Self {
        Self {
            config: BakeConfig::default(),
            padding: 2,
            texel_density: TexelDensity::Fit,
            raster: RasterSettings::default(),
            progress: ProgressIndicator::new(),
            state: None,
        }
    }
}

impl<Id: EntityId> LightBaker<Id> {
    /// Creates a baker with given configuration. Nothing is allocated until the first
    /// [`Self::rebuild`].
    pub fn new(config: BakeConfig) -> Result<Self, LightmapGenerationError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Default::default()
        })
    }

    pub fn with_atlas_layout(mut self, padding: u32, texel_density: TexelDensity) -> Self {
        self.padding = padding;
        self.texel_density = texel_density;
        self
    }

    pub fn with_raster_settings(mut self, raster: RasterSettings) -> Self {
        self.raster = raster;
        self
    }

    pub fn with_progress_indicator(mut self, progress: ProgressIndicator) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &BakeConfig {
        &self.config
    }

    /// Validates and applies new configuration, it affects the next pass only. Changing
    /// resolution drops the atlas, so the scene must be rebuilt before next render.
    pub fn configure(&mut self, config: BakeConfig) -> Result<(), LightmapGenerationError> {
        config.validate()?;

        if config.resolution != self.config.resolution && self.state.take().is_some() {
            log::info!(
                "Lightmap resolution changed to {}, scene must be rebuilt.",
                config.resolution
            );
        }

        self.config = config;
        if let Some(state) = self.state.as_mut() {
            state.lightmapper.set_config(config);
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_some()
    }

    /// Generates atlas, G-buffer and acceleration structure for the meshes and starts a
    /// fresh accumulation. Atlas coordinates are written into the meshes. Previous
    /// session is dropped even if rebuild fails.
    pub fn rebuild(
        &mut self,
        meshes: &mut [Mesh<Id>],
        cancellation_token: &CancellationToken,
    ) -> Result<(), LightmapGenerationError> {
        self.state = None;

        let check_cancelled = || {
            if cancellation_token.is_cancelled() {
                Err(LightmapGenerationError::Cancelled)
            } else {
                Ok(())
            }
        };

        check_cancelled()?;
        self.progress.set_stage(ProgressStage::GeneratingAtlas, 1);
        let atlas = generate_atlas(
            meshes,
            &AtlasSettings {
                resolution: self.config.resolution,
                padding: self.padding,
                texel_density: self.texel_density,
            },
        )?;
        self.progress.advance_progress();

        check_cancelled()?;
        self.progress.set_stage(ProgressStage::RasterizingAtlas, 1);
        let gbuffer = rasterize(meshes, self.config.resolution, &self.raster);
        self.progress.advance_progress();

        check_cancelled()?;
        self.progress
            .set_stage(ProgressStage::BuildingAccelerationStructure, 1);
        let bvh = AccelerationStructure::new(meshes);
        self.progress.advance_progress();

        check_cancelled()?;
        self.state = Some(BakeState {
            atlas,
            lightmapper: Lightmapper::new(Arc::new(gbuffer), Arc::new(bvh), self.config),
        });

        Ok(())
    }

    /// Performs one accumulation pass.
    pub fn render(&mut self) -> Result<PassStats, LightmapGenerationError> {
        let state = self
            .state
            .as_mut()
            .ok_or(LightmapGenerationError::NotReady)?;
        self.progress.set_stage(ProgressStage::CalculatingLight, 1);
        let stats = state.lightmapper.render()?;
        self.progress.advance_progress();
        Ok(stats)
    }

    /// Clears accumulated light, keeps atlas and acceleration structure.
    pub fn reset(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.lightmapper.reset();
        }
    }

    pub fn atlas(&self) -> Option<&Atlas<Id>> {
        self.state.as_ref().map(|s| &s.atlas)
    }

    pub fn gbuffer(&self) -> Option<&GBuffer> {
        self.state.as_ref().map(|s| s.lightmapper.gbuffer())
    }

    pub fn acceleration_structure(&self) -> Option<&AccelerationStructure> {
        self.state
            .as_ref()
            .map(|s| s.lightmapper.acceleration_structure())
    }

    pub fn lightmapper(&self) -> Option<&Lightmapper> {
        self.state.as_ref().map(|s| &s.lightmapper)
    }
}
