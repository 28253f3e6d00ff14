//! Powder-diffraction reduction and peak fitting for an area-detector
//! diffractometer.
//!
//! Pixel geometry is built from motor positions plus a rigid-body calibration,
//! per-pixel counts are histogrammed into a pattern, and a chosen peak is fitted
//! in every sub-run. Nothing here performs I/O or logs.

pub mod common;
pub mod domain;
pub mod geometry;
pub mod numerics;
pub mod peaks;
pub mod pipeline;
pub mod reduction;

pub use domain::{HidraError, HidraErrorCategory, HidraResult, MotorLog, SubRunId};
pub use geometry::{CalibrationCorrection, GeometryModel, InstrumentGeometryEngine, PixelGeometry};
pub use peaks::{
    BackgroundShape, EffectiveParameter, FitStatus, FitWindow, PeakCollection, PeakFitResult,
    PeakFittingEngine, PeakShape,
};
pub use reduction::{BinAngle, BinEdges, Pattern, PixelMask, PowderPatternReducer};
