//! Search space for ahead-of-time kernel generation: which input shapes to
//! compile for, which mapping options to try on each, and which compiled
//! results are worth keeping.

pub mod catalog;
pub mod policy;
pub mod sampler;
pub mod shapes;

pub use catalog::{
    IssuerConfig, OptionIssuer, Reservation, SearchError, ShapeOptionCatalog, ShapeProgress,
    StripedShapeOptionCatalog,
};
pub use policy::{AcceptancePolicy, RejectReason, Verdict};
pub use sampler::{OptionSampler, SamplerLimits};
pub use shapes::{
    FixedShapes, GroupConvolutionRanges, GroupNormalizationRanges, IntRange, Mlp3Ranges,
    ShapeRanges, ShapeSampler, TileLayout, WaveNetRanges, WorkloadFamily,
};
