use super::CliError;
use anyhow::Context;
use hidra_core::domain::{HidraError, HidraResult, SubRunId};
use hidra_core::geometry::{CalibrationCorrection, GeometryModel, InstrumentGeometryEngine};
use hidra_core::peaks::{EffectiveParameter, EffectiveRow, Measurement, NativeFit};
use hidra_core::pipeline::{BatchFitReport, PeakFitSetup, ReducedSubRun, SubRunData};
use hidra_core::reduction::{BinAngle, BinEdges, PixelMask};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReductionConfig {
    pub(super) geometry: GeometryModel,
    #[serde(default)]
    pub(super) calibration: Option<CalibrationCorrection>,
    #[serde(default)]
    pub(super) bins: BinSpec,
    #[serde(default)]
    pub(super) bin_angle: BinAngle,
    #[serde(default)]
    pub(super) wavelength: Option<f64>,
}

const DEFAULT_BIN_COUNT: usize = 1000;

/// Explicit edges, a uniform grid, or `count` bins spanning every pixel angle.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(super) enum BinSpec {
    Edges { edges: Vec<f64> },
    Uniform { min: f64, max: f64, count: usize },
    Auto(AutoBins),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct AutoBins {
    count: usize,
}

impl Default for BinSpec {
    fn default() -> Self {
        Self::Auto(AutoBins {
            count: DEFAULT_BIN_COUNT,
        })
    }
}

impl BinSpec {
    /// `pixel_angles` is only consulted for automatic binning.
    pub(super) fn to_edges(
        &self,
        pixel_angles: impl FnOnce() -> HidraResult<Vec<f64>>,
    ) -> Result<BinEdges, CliError> {
        match self {
            Self::Edges { edges } => BinEdges::new(edges.clone()),
            Self::Uniform { min, max, count } => BinEdges::uniform(*min, *max, *count),
            Self::Auto(AutoBins { count }) => {
                pixel_angles().and_then(|angles| BinEdges::from_pixel_range(&angles, *count))
            }
        }
        .map_err(CliError::Core)
    }
}

/// Smallest and largest scattering angle of each sub-run's detector position.
pub(super) fn sub_run_angle_extremes(
    engine: &InstrumentGeometryEngine,
    calibration: &CalibrationCorrection,
    sub_runs: &[SubRunData],
) -> HidraResult<Vec<f64>> {
    let mut extremes = Vec::with_capacity(2 * sub_runs.len());
    for data in sub_runs {
        let geometry = engine.build_for_motor_log(&data.motor_log, calibration)?;
        if let Some((low, high)) = geometry.scattering_angle_range() {
            extremes.extend([low, high]);
        }
    }
    Ok(extremes)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SubRunFile {
    pub(super) sub_runs: Vec<SubRunData>,
    /// `true` marks an excluded pixel.
    #[serde(default)]
    pub(super) mask: Option<Vec<bool>>,
    #[serde(default)]
    pub(super) vanadium: Option<Vec<f64>>,
}

impl SubRunFile {
    pub(super) fn pixel_mask(&self) -> Option<PixelMask> {
        self.mask.clone().map(PixelMask::from_excluded)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct PeakSetupFile {
    pub(super) peaks: Vec<PeakFitSetup>,
}

impl PeakSetupFile {
    pub(super) fn validate(&self) -> Result<(), CliError> {
        if self.peaks.is_empty() {
            return Err(CliError::Core(HidraError::configuration(
                "INPUT.PEAKS",
                "peak setup file lists no peaks",
            )));
        }
        Ok(())
    }
}

/// Output of `reduce`, input of `fit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReducedFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) wavelength: Option<f64>,
    pub(super) sub_runs: Vec<ReducedSubRun>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FitReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) wavelength: Option<f64>,
    pub(super) peaks: Vec<PeakReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PeakReport {
    pub(super) tag: String,
    pub(super) peak_shape: &'static str,
    pub(super) background_shape: &'static str,
    pub(super) native_parameter_names: Vec<&'static str>,
    pub(super) effective_parameter_names: Vec<&'static str>,
    /// Effective columns the shapes actually fit; the others are always zero.
    pub(super) supplied_parameter_names: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) reference_d_spacing: Option<f64>,
    pub(super) converged: usize,
    pub(super) rows: Vec<SubRunRow>,
}

/// One sub-run of one peak. Every value field is `null` when the fit failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SubRunRow {
    pub(super) sub_run: SubRunId,
    pub(super) status: &'static str,
    pub(super) failure: Option<&'static str>,
    pub(super) iterations: usize,
    pub(super) chi_squared: Option<f64>,
    pub(super) native: Option<NativeFit>,
    pub(super) effective: Option<EffectiveReport>,
    pub(super) d_spacing: Option<Measurement>,
    pub(super) strain: Option<Measurement>,
}

#[derive(Debug, Clone, Serialize)]
pub(super) struct EffectiveReport {
    pub(super) values: EffectiveRow,
    pub(super) errors: EffectiveRow,
}

pub(super) fn build_peak_report(
    report: &BatchFitReport,
    wavelength: Option<f64>,
) -> Result<PeakReport, CliError> {
    let collection = &report.collection;
    let table = collection
        .get_effective_parameters_values()
        .map_err(CliError::Core)?;
    let d_spacing = wavelength
        .map(|wavelength| collection.get_dspacing_center(wavelength))
        .transpose()
        .map_err(CliError::Core)?;
    let strain = match (wavelength, collection.reference_d_spacing()) {
        (Some(wavelength), Some(_)) => {
            Some(collection.get_strain(wavelength).map_err(CliError::Core)?)
        }
        _ => None,
    };

    let rows = report
        .outcomes
        .iter()
        .enumerate()
        .map(|(index, outcome)| {
            let status = outcome.status();
            SubRunRow {
                sub_run: outcome.sub_run,
                status: status.as_str(),
                failure: status.failure().map(|failure| failure.as_str()),
                iterations: outcome.result.iterations(),
                chi_squared: table.chi_squared[index],
                native: collection.native_fits()[index].clone(),
                effective: table.values[index]
                    .zip(table.errors[index])
                    .map(|(values, errors)| EffectiveReport { values, errors }),
                d_spacing: d_spacing.as_ref().and_then(|column| column[index]),
                strain: strain.as_ref().and_then(|column| column[index]),
            }
        })
        .collect();

    Ok(PeakReport {
        tag: collection.tag().to_string(),
        peak_shape: collection.peak_shape().as_str(),
        background_shape: collection.background_shape().as_str(),
        native_parameter_names: collection.native_parameter_names(),
        effective_parameter_names: EffectiveParameter::names(),
        supplied_parameter_names: collection
            .effective_names()
            .into_iter()
            .map(EffectiveParameter::as_str)
            .collect(),
        reference_d_spacing: collection.reference_d_spacing(),
        converged: report.converged_count(),
        rows,
    })
}

pub(super) fn read_json<T: DeserializeOwned>(path: &Path, label: &str) -> Result<T, CliError> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("failed to read {label} '{}'", path.display()))?;
    let value = serde_json::from_str(&source)
        .with_context(|| format!("failed to parse {label} '{}'", path.display()))?;
    Ok(value)
}

/// Missing path means the identity correction.
pub(super) fn load_calibration(path: &Path) -> Result<CalibrationCorrection, CliError> {
    if !path.is_file() {
        return Ok(CalibrationCorrection::identity());
    }
    read_json(path, "calibration file")
}

pub(super) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory '{}'", parent.display())
            })?;
        }
    }

    let rendered = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize '{}'", path.display()))?;
    fs::write(path, format!("{rendered}\n"))
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{BinSpec, ReductionConfig, load_calibration, sub_run_angle_extremes};
    use hidra_core::domain::MotorLog;
    use hidra_core::geometry::{CalibrationCorrection, InstrumentGeometryEngine};
    use hidra_core::pipeline::SubRunData;
    use hidra_core::reduction::BinAngle;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn reduction_config_accepts_uniform_bins_and_defaults_to_center() {
        let config: ReductionConfig = serde_json::from_str(
            r#"{
                "geometry": {"rows": 4, "columns": 8, "pixelSizeX": 0.001,
                             "pixelSizeY": 0.001, "nominalDistance": 1.0},
                "bins": {"min": 10.0, "max": 20.0, "count": 5}
            }"#,
        )
        .expect("config");

        assert_eq!(config.bin_angle, BinAngle::Center);
        assert!(config.calibration.is_none());
        let edges = config
            .bins
            .to_edges(|| unreachable!("explicit grid needs no pixel angles"))
            .expect("edges");
        assert_eq!(edges.bin_count(), 5);
        assert_eq!(edges.lower(), 10.0);
    }

    #[test]
    fn explicit_edges_are_validated() {
        let bins: BinSpec = serde_json::from_str(r#"{"edges": [1.0, 3.0, 2.0]}"#).expect("bins");
        let error = bins
            .to_edges(|| Ok(Vec::new()))
            .expect_err("descending edges");
        assert_eq!(error.as_hidra_error().exit_code(), 5);
    }

    #[test]
    fn bins_default_to_the_pixel_angle_range_of_every_sub_run() {
        let config: ReductionConfig = serde_json::from_str(
            r#"{"geometry": {"rows": 2, "columns": 5, "pixelSizeX": 0.01,
                             "pixelSizeY": 0.01, "nominalDistance": 1.0}}"#,
        )
        .expect("config");
        let engine = InstrumentGeometryEngine::new(config.geometry);
        let calibration = CalibrationCorrection::identity();
        let sub_runs: Vec<SubRunData> = [(1, 40.0), (2, 60.0)]
            .into_iter()
            .map(|(sub_run, two_theta)| SubRunData {
                sub_run,
                motor_log: MotorLog::new(two_theta, None),
                counts: vec![1.0; 10],
            })
            .collect();

        let edges = config
            .bins
            .to_edges(|| sub_run_angle_extremes(&engine, &calibration, &sub_runs))
            .expect("edges");
        assert_eq!(edges.bin_count(), 1000);
        assert!(edges.lower() < 40.0 && edges.lower() > 38.0);
        assert!(edges.upper() > 60.0 && edges.upper() < 62.0);

        let bins: BinSpec = serde_json::from_str(r#"{"count": 50}"#).expect("auto");
        let edges = bins
            .to_edges(|| Ok(vec![30.0, 31.0]))
            .expect("auto edges");
        assert_eq!(edges.bin_count(), 50);
        assert!(serde_json::from_str::<BinSpec>(r#"{"min": 1.0, "count": 5}"#).is_err());
    }

    #[test]
    fn missing_calibration_file_is_identity() {
        let temp = TempDir::new().expect("tempdir");
        let calibration = load_calibration(&temp.path().join("absent.json")).expect("identity");
        assert!(calibration.is_identity());

        let path = temp.path().join("calibration.json");
        fs::write(&path, r#"{"Shift_x": 0.002, "Rot_y": 0.5, "Lambda": 1.54}"#)
            .expect("write calibration");
        let calibration = load_calibration(&path).expect("calibration");
        assert_eq!(calibration.shift_x, 0.002);
        assert_eq!(calibration.rotation_y, 0.5);
        assert_eq!(calibration.wavelength_override, Some(1.54));
    }
}
