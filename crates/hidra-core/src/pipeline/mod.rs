//! Batch drivers over the sub-runs of one acquisition.
//!
//! Contract errors abort the whole batch. Fit failures do not: each sub-run
//! gets its own outcome and a row in the resulting [`PeakCollection`].

use crate::domain::{HidraResult, MotorLog, SubRunId, validate_sub_run_sequence};
use crate::geometry::{CalibrationCorrection, InstrumentGeometryEngine, PixelGeometry};
use crate::peaks::{
    BackgroundShape, FitFailure, FitStatus, FitWindow, NativeFit, PeakCollection, PeakFitResult,
    PeakFittingEngine, PeakShape,
};
use crate::reduction::{BinEdges, Pattern, PixelMask, PowderPatternReducer};
use serde::{Deserialize, Serialize};

/// Raw counts and motor readings of one sub-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubRunData {
    pub sub_run: SubRunId,
    #[serde(flatten)]
    pub motor_log: MotorLog,
    pub counts: Vec<f64>,
}

/// Inputs shared by every sub-run of a reduction batch.
#[derive(Debug, Clone, Copy)]
pub struct ReductionSetup<'a> {
    pub engine: &'a InstrumentGeometryEngine,
    pub calibration: &'a CalibrationCorrection,
    pub reducer: PowderPatternReducer,
    pub bin_edges: &'a BinEdges,
    pub mask: Option<&'a PixelMask>,
    pub vanadium: Option<&'a [f64]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducedSubRun {
    pub sub_run: SubRunId,
    pub two_theta: f64,
    pub l2: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wavelength: Option<f64>,
    pub pattern: Pattern,
}

/// Reduces every sub-run in order. Consecutive sub-runs at the same arm
/// position share one pixel geometry.
pub fn reduce_sub_runs(
    setup: &ReductionSetup<'_>,
    sub_runs: &[SubRunData],
) -> HidraResult<Vec<ReducedSubRun>> {
    let ids: Vec<SubRunId> = sub_runs.iter().map(|data| data.sub_run).collect();
    validate_sub_run_sequence("PIPELINE.SUB_RUNS", &ids)?;

    let mut cached: Option<(MotorLog, PixelGeometry)> = None;
    let mut reduced = Vec::with_capacity(sub_runs.len());
    for data in sub_runs {
        let geometry = match cached.take() {
            Some((motor_log, geometry)) if motor_log == data.motor_log => geometry,
            _ => setup
                .engine
                .build_for_motor_log(&data.motor_log, setup.calibration)?,
        };

        let pattern = setup.reducer.reduce(
            geometry.scattering_angles(),
            &data.counts,
            setup.bin_edges.edges(),
            setup.mask,
            setup.vanadium,
        )?;
        reduced.push(ReducedSubRun {
            sub_run: data.sub_run,
            two_theta: geometry.two_theta(),
            l2: geometry.l2(),
            wavelength: geometry.wavelength(),
            pattern,
        });
        cached = Some((data.motor_log, geometry));
    }

    Ok(reduced)
}

/// One peak to fit across a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeakFitSetup {
    pub tag: String,
    /// Initial peak center in degrees; the window's center of mass when absent.
    #[serde(default)]
    pub center: Option<f64>,
    pub left: f64,
    pub right: f64,
    pub peak_shape: PeakShape,
    pub background_shape: BackgroundShape,
    #[serde(default)]
    pub reference_d_spacing: Option<f64>,
}

impl PeakFitSetup {
    pub fn window(&self) -> HidraResult<FitWindow> {
        FitWindow::new(self.left, self.right)
    }

    /// Empty collection for this peak, carrying the reference d-spacing when set.
    pub fn collection(&self) -> HidraResult<PeakCollection> {
        let mut collection =
            PeakCollection::new(self.tag.clone(), self.peak_shape, self.background_shape);
        if let Some(d_spacing) = self.reference_d_spacing {
            collection.set_d_reference(d_spacing)?;
        }
        Ok(collection)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubRunFitOutcome {
    pub sub_run: SubRunId,
    pub result: PeakFitResult,
}

impl SubRunFitOutcome {
    pub fn status(&self) -> FitStatus {
        self.result.status()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFitReport {
    pub outcomes: Vec<SubRunFitOutcome>,
    pub collection: PeakCollection,
}

impl BatchFitReport {
    pub fn converged_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status().is_converged())
            .count()
    }

    pub fn failed_sub_runs(&self) -> Vec<(SubRunId, FitFailure)> {
        self.outcomes
            .iter()
            .filter_map(|outcome| Some((outcome.sub_run, outcome.status().failure()?)))
            .collect()
    }
}

/// Fits one peak in every reduced sub-run and stores the rows in a collection.
pub fn fit_sub_runs(
    engine: &PeakFittingEngine,
    setup: &PeakFitSetup,
    sub_runs: &[ReducedSubRun],
) -> HidraResult<BatchFitReport> {
    let window = setup.window()?;
    let ids: Vec<SubRunId> = sub_runs.iter().map(|reduced| reduced.sub_run).collect();
    validate_sub_run_sequence("PIPELINE.SUB_RUNS", &ids)?;

    let mut outcomes = Vec::with_capacity(sub_runs.len());
    for reduced in sub_runs {
        let result = engine.fit(
            &reduced.pattern,
            window,
            setup.center,
            setup.peak_shape,
            setup.background_shape,
        )?;
        outcomes.push(SubRunFitOutcome {
            sub_run: reduced.sub_run,
            result,
        });
    }

    let rows: Vec<Option<NativeFit>> = outcomes
        .iter()
        .map(|outcome| NativeFit::from_result(&outcome.result))
        .collect();
    let mut collection = setup.collection()?;
    collection.set_peak_fitting_values(
        ids,
        rows.iter()
            .map(|row| row.as_ref().map(|fit| fit.values.clone()))
            .collect(),
        rows.iter()
            .map(|row| row.as_ref().map(|fit| fit.errors.clone()))
            .collect(),
        rows.iter()
            .map(|row| row.as_ref().map(|fit| fit.chi_squared))
            .collect(),
    )?;

    Ok(BatchFitReport {
        outcomes,
        collection,
    })
}

/// Fitted curves of a batch, one entry per sub-run; `None` where the fit failed.
pub fn modeled_patterns(
    engine: &PeakFittingEngine,
    sub_runs: &[ReducedSubRun],
    report: &BatchFitReport,
) -> HidraResult<Vec<Option<Pattern>>> {
    sub_runs
        .iter()
        .zip(&report.outcomes)
        .map(|(reduced, outcome)| engine.modeled_pattern(&reduced.pattern, &outcome.result))
        .collect()
}
