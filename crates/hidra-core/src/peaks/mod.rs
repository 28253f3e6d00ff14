//! Peak and background shape catalog, the least-squares peak fitter, and
//! per-sub-run storage of fitted parameters.

pub mod collection;
pub mod fitting;
pub mod shapes;

pub use collection::{EffectiveParameterTable, Measurement, NativeFit, PeakCollection};
pub use fitting::{FitFailure, FitSettings, FitStatus, FitWindow, PeakFitResult, PeakFittingEngine};
pub use shapes::{
    BackgroundShape, EFFECTIVE_PARAMETER_COUNT, EffectiveParameter, EffectiveRow, PeakShape,
    ShapeModel,
};
