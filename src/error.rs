use thiserror::Error;

/// An error that may occur during lightmap generation.
#[derive(Debug, Error)]
pub enum LightmapGenerationError {
    /// Generation was cancelled by user.
    #[error("Lightmap generation was cancelled by the user.")]
    Cancelled,
    /// An index of a vertex in a triangle is out of bounds.
    #[error("An index of a vertex in a triangle is out of bounds.")]
    InvalidIndex,
    /// Render was requested before atlas, G-buffer and acceleration structure were built.
    #[error("Lightmapper is not ready, the scene must be rebuilt first.")]
    NotReady,
    #[error(transparent)]
    Packing(#[from] PackingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Query(#[from] StructureQueryError),
}

/// Meshes cannot be packed into the atlas at the requested resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Unable to pack {regions} atlas regions ({requested} texels requested) \
     into a {resolution}x{resolution} atlas."
)]
pub struct PackingError {
    pub regions: usize,
    /// Sum of padded region areas in texels.
    pub requested: u64,
    pub resolution: u32,
}

/// Invalid bake configuration, rejected before any buffer is allocated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Lightmap resolution must be greater than zero.")]
    ZeroResolution,
    #[error("Lightmap resolution {resolution} exceeds the maximum of {max}.")]
    ResolutionTooLarge { resolution: u32, max: u32 },
    #[error("Amount of casts per pass must be greater than zero.")]
    ZeroCasts,
    #[error("Parameter `{name}` must be a finite non-negative number, got {value}.")]
    InvalidParameter { name: &'static str, value: f32 },
}

/// A query against a successfully built acceleration structure failed. This is an
/// internal invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureQueryError {
    #[error("BVH traversal stack overflow (capacity {capacity}).")]
    StackOverflow { capacity: usize },
    #[error("BVH node {index} is out of bounds.")]
    InvalidNode { index: u32 },
}

/// Why a triangle was left out of the acceleration structure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GeometryErrorKind {
    ZeroArea,
    NonFinite,
}

/// Bad input triangle. Never returned, offending triangles are logged and skipped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[error("Triangle {triangle} of mesh {mesh} was skipped: {kind:?}.")]
pub struct GeometryError {
    pub mesh: usize,
    pub triangle: usize,
    pub kind: GeometryErrorKind,
}
