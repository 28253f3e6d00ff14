use super::CliError;
use super::helpers::{
    FitReport, PeakSetupFile, ReducedFile, ReductionConfig, SubRunFile, build_peak_report,
    load_calibration, read_json, sub_run_angle_extremes, write_json,
};
use clap::Args;
use hidra_core::geometry::InstrumentGeometryEngine;
use hidra_core::peaks::PeakFittingEngine;
use hidra_core::pipeline::{ReductionSetup, fit_sub_runs, reduce_sub_runs};
use hidra_core::reduction::PowderPatternReducer;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Args)]
pub(super) struct ReductionInputArgs {
    /// Reduction configuration (geometry, bins, bin angle convention)
    #[arg(long)]
    config: PathBuf,

    /// Sub-run counts with optional mask and vanadium arrays
    #[arg(long)]
    data: PathBuf,

    /// Calibration file; overrides the configuration, identity when the file is missing
    #[arg(long)]
    calibration: Option<PathBuf>,
}

#[derive(Args)]
pub(super) struct ReduceArgs {
    #[command(flatten)]
    input: ReductionInputArgs,

    /// Where to write the reduced patterns
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
pub(super) struct FitArgs {
    /// Reduced patterns written by `reduce`
    #[arg(long)]
    input: PathBuf,

    /// Peak setup file
    #[arg(long)]
    peaks: PathBuf,

    /// Wavelength in angstroms for d-spacing and strain
    #[arg(long)]
    wavelength: Option<f64>,

    /// Where to write the fit report
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
pub(super) struct RunArgs {
    #[command(flatten)]
    input: ReductionInputArgs,

    /// Peak setup file
    #[arg(long)]
    peaks: PathBuf,

    /// Wavelength in angstroms for d-spacing and strain
    #[arg(long)]
    wavelength: Option<f64>,

    /// Also keep the reduced patterns
    #[arg(long)]
    reduced_output: Option<PathBuf>,

    /// Where to write the fit report
    #[arg(long)]
    output: PathBuf,
}

pub(super) fn run_reduce_command(args: ReduceArgs) -> Result<i32, CliError> {
    let reduced = reduce_inputs(&args.input)?;
    write_json(&args.output, &reduced)?;
    info!(
        sub_runs = reduced.sub_runs.len(),
        output = %args.output.display(),
        "wrote reduced patterns"
    );
    Ok(0)
}

pub(super) fn run_fit_command(args: FitArgs) -> Result<i32, CliError> {
    let reduced: ReducedFile = read_json(&args.input, "reduced patterns")?;
    let peaks: PeakSetupFile = read_json(&args.peaks, "peak setup file")?;
    let report = fit_reduced(&reduced, &peaks, args.wavelength.or(reduced.wavelength))?;
    write_json(&args.output, &report)?;
    info!(output = %args.output.display(), "wrote fit report");
    Ok(0)
}

pub(super) fn run_run_command(args: RunArgs) -> Result<i32, CliError> {
    let peaks: PeakSetupFile = read_json(&args.peaks, "peak setup file")?;
    peaks.validate()?;

    let reduced = reduce_inputs(&args.input)?;
    if let Some(path) = &args.reduced_output {
        write_json(path, &reduced)?;
        info!(output = %path.display(), "wrote reduced patterns");
    }

    let report = fit_reduced(&reduced, &peaks, args.wavelength.or(reduced.wavelength))?;
    write_json(&args.output, &report)?;
    info!(output = %args.output.display(), "wrote fit report");
    Ok(0)
}

fn reduce_inputs(input: &ReductionInputArgs) -> Result<ReducedFile, CliError> {
    let config: ReductionConfig = read_json(&input.config, "reduction configuration")?;
    let calibration = match &input.calibration {
        Some(path) => load_calibration(path)?,
        None => config.calibration.unwrap_or_default(),
    };
    let data: SubRunFile = read_json(&input.data, "sub-run data")?;

    let engine = InstrumentGeometryEngine::new(config.geometry);
    let bin_edges = config
        .bins
        .to_edges(|| sub_run_angle_extremes(&engine, &calibration, &data.sub_runs))?;
    let mask = data.pixel_mask();
    let setup = ReductionSetup {
        engine: &engine,
        calibration: &calibration,
        reducer: PowderPatternReducer::new(config.bin_angle),
        bin_edges: &bin_edges,
        mask: mask.as_ref(),
        vanadium: data.vanadium.as_deref(),
    };

    info!(
        sub_runs = data.sub_runs.len(),
        pixels = config.geometry.pixel_count(),
        bins = bin_edges.bin_count(),
        masked = mask.as_ref().map_or(0, |mask| mask.excluded_count()),
        vanadium = data.vanadium.is_some(),
        "reducing sub-runs"
    );
    let sub_runs = reduce_sub_runs(&setup, &data.sub_runs).map_err(CliError::Core)?;
    for reduced in &sub_runs {
        debug!(
            sub_run = reduced.sub_run,
            two_theta = reduced.two_theta,
            l2 = reduced.l2,
            "reduced sub-run"
        );
    }

    Ok(ReducedFile {
        wavelength: config.wavelength.or(calibration.wavelength_override),
        sub_runs,
    })
}

fn fit_reduced(
    reduced: &ReducedFile,
    peaks: &PeakSetupFile,
    wavelength: Option<f64>,
) -> Result<FitReport, CliError> {
    peaks.validate()?;
    let engine = PeakFittingEngine::default();
    let mut reports = Vec::with_capacity(peaks.peaks.len());

    for setup in &peaks.peaks {
        info!(
            peak = %setup.tag,
            shape = setup.peak_shape.as_str(),
            background = setup.background_shape.as_str(),
            left = setup.left,
            right = setup.right,
            "fitting peak"
        );
        let batch = fit_sub_runs(&engine, setup, &reduced.sub_runs).map_err(CliError::Core)?;
        for outcome in &batch.outcomes {
            match outcome.status().failure() {
                Some(failure) => warn!(
                    peak = %setup.tag,
                    sub_run = outcome.sub_run,
                    reason = failure.as_str(),
                    "peak fit failed"
                ),
                None => debug!(
                    peak = %setup.tag,
                    sub_run = outcome.sub_run,
                    iterations = outcome.result.iterations(),
                    chi_squared = ?outcome.result.reduced_chi_squared(),
                    "peak fit converged"
                ),
            }
        }
        info!(
            peak = %setup.tag,
            converged = batch.converged_count(),
            total = batch.outcomes.len(),
            "peak fitted"
        );
        reports.push(build_peak_report(&batch, wavelength)?);
    }

    Ok(FitReport {
        wavelength,
        peaks: reports,
    })
}
