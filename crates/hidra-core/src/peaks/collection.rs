use super::fitting::PeakFitResult;
use super::shapes::{BackgroundShape, EffectiveParameter, EffectiveRow, PeakShape, ShapeModel};
use crate::domain::{HidraError, HidraResult, SubRunId, validate_sub_run_sequence};
use serde::Serialize;

/// Native fit values of one sub-run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeFit {
    pub values: Vec<f64>,
    pub errors: Vec<f64>,
    pub chi_squared: f64,
}

impl NativeFit {
    pub fn new(values: Vec<f64>, errors: Vec<f64>, chi_squared: f64) -> Self {
        Self {
            values,
            errors,
            chi_squared,
        }
    }

    /// Native record of a converged fit; `None` for a failed one.
    pub fn from_result(result: &PeakFitResult) -> Option<Self> {
        Some(Self::new(
            result.parameters()?.to_vec(),
            result.errors()?.to_vec(),
            result.reduced_chi_squared()?,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub value: f64,
    pub error: f64,
}

/// Effective parameters for every stored sub-run; `None` rows are failed fits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveParameterTable {
    pub parameter_names: Vec<&'static str>,
    pub sub_runs: Vec<SubRunId>,
    pub chi_squared: Vec<Option<f64>>,
    pub values: Vec<Option<EffectiveRow>>,
    pub errors: Vec<Option<EffectiveRow>>,
}

impl EffectiveParameterTable {
    pub fn len(&self) -> usize {
        self.sub_runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_runs.is_empty()
    }

    /// One parameter across all sub-runs.
    pub fn column(&self, parameter: EffectiveParameter) -> Vec<Option<f64>> {
        self.values
            .iter()
            .map(|row| row.map(|row| row[parameter.index()]))
            .collect()
    }
}

/// Per-sub-run fit results of one named peak.
///
/// Rows are stored in sub-run order. A `None` row is a sub-run whose fit
/// failed; it stays in place through every derived quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakCollection {
    tag: String,
    model: ShapeModel,
    sub_runs: Vec<SubRunId>,
    fits: Vec<Option<NativeFit>>,
    reference_d_spacing: Option<f64>,
}

impl PeakCollection {
    pub fn new(
        tag: impl Into<String>,
        peak_shape: PeakShape,
        background_shape: BackgroundShape,
    ) -> Self {
        Self {
            tag: tag.into(),
            model: ShapeModel::new(peak_shape, background_shape),
            sub_runs: Vec::new(),
            fits: Vec::new(),
            reference_d_spacing: None,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn peak_shape(&self) -> PeakShape {
        self.model.peak
    }

    pub fn background_shape(&self) -> BackgroundShape {
        self.model.background
    }

    pub fn sub_runs(&self) -> &[SubRunId] {
        &self.sub_runs
    }

    pub fn len(&self) -> usize {
        self.sub_runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_runs.is_empty()
    }

    pub fn native_parameter_names(&self) -> Vec<&'static str> {
        self.model.native_parameter_names()
    }

    pub fn effective_names(&self) -> Vec<EffectiveParameter> {
        self.model.effective_names()
    }

    pub fn native_fits(&self) -> &[Option<NativeFit>] {
        &self.fits
    }

    pub fn reference_d_spacing(&self) -> Option<f64> {
        self.reference_d_spacing
    }

    /// Replaces every stored row at once.
    ///
    /// All arrays must have one entry per sub-run; a row is either fully
    /// present (values, errors and chi-squared) or fully absent. Once sub-runs
    /// are stored, later writes must use the same sub-runs. Nothing is changed
    /// when any check fails.
    pub fn set_peak_fitting_values(
        &mut self,
        sub_runs: Vec<SubRunId>,
        native_params: Vec<Option<Vec<f64>>>,
        native_errors: Vec<Option<Vec<f64>>>,
        chi_squared: Vec<Option<f64>>,
    ) -> HidraResult<()> {
        let expected = sub_runs.len();
        for (name, actual) in [
            ("native parameters", native_params.len()),
            ("native errors", native_errors.len()),
            ("chi-squared", chi_squared.len()),
        ] {
            if actual != expected {
                return Err(HidraError::shape_mismatch(
                    "PEAKS.ROW_COUNT",
                    format!("{name} has {actual} rows for {expected} sub-runs"),
                ));
            }
        }
        if !self.sub_runs.is_empty() && self.sub_runs != sub_runs {
            return Err(HidraError::shape_mismatch(
                "PEAKS.SUB_RUNS",
                format!(
                    "peak '{}' already holds {} sub-runs; writes must use the same sub-runs",
                    self.tag,
                    self.sub_runs.len()
                ),
            ));
        }
        validate_sub_run_sequence("PEAKS.SUB_RUNS", &sub_runs)?;

        let fits = native_params
            .into_iter()
            .zip(native_errors)
            .zip(chi_squared)
            .zip(&sub_runs)
            .map(|(((values, errors), chi_squared), sub_run)| {
                self.build_row(*sub_run, values, errors, chi_squared)
            })
            .collect::<HidraResult<Vec<_>>>()?;

        self.sub_runs = sub_runs;
        self.fits = fits;
        Ok(())
    }

    /// Overwrites the row of one stored sub-run.
    pub fn record_fit(&mut self, sub_run: SubRunId, fit: Option<NativeFit>) -> HidraResult<()> {
        let index = self.sub_runs.binary_search(&sub_run).map_err(|_| {
            HidraError::shape_mismatch(
                "PEAKS.SUB_RUNS",
                format!("sub-run {sub_run} is not stored for peak '{}'", self.tag),
            )
        })?;
        if let Some(fit) = &fit {
            self.check_native_lengths(sub_run, &fit.values, &fit.errors)?;
        }
        self.fits[index] = fit;
        Ok(())
    }

    pub fn fit_for(&self, sub_run: SubRunId) -> Option<&NativeFit> {
        let index = self.sub_runs.binary_search(&sub_run).ok()?;
        self.fits[index].as_ref()
    }

    pub fn get_effective_parameters_values(&self) -> HidraResult<EffectiveParameterTable> {
        let mut values = Vec::with_capacity(self.fits.len());
        let mut errors = Vec::with_capacity(self.fits.len());
        for fit in &self.fits {
            match fit {
                Some(fit) => {
                    values.push(Some(self.model.effective_values(&fit.values)?));
                    errors.push(Some(self.model.effective_errors(&fit.values, &fit.errors)?));
                }
                None => {
                    values.push(None);
                    errors.push(None);
                }
            }
        }

        Ok(EffectiveParameterTable {
            parameter_names: EffectiveParameter::names(),
            sub_runs: self.sub_runs.clone(),
            chi_squared: self
                .fits
                .iter()
                .map(|fit| fit.as_ref().map(|fit| fit.chi_squared))
                .collect(),
            values,
            errors,
        })
    }

    /// Peak position as lattice spacing in angstroms, `d = lambda / (2 sin(theta))`.
    pub fn get_dspacing_center(&self, wavelength: f64) -> HidraResult<Vec<Option<Measurement>>> {
        if !wavelength.is_finite() || wavelength <= 0.0 {
            return Err(HidraError::configuration(
                "PEAKS.WAVELENGTH",
                format!("wavelength must be finite and > 0, got {wavelength}"),
            ));
        }

        let center_index = self.model.center_index();
        Ok(self
            .fits
            .iter()
            .map(|fit| {
                let fit = fit.as_ref()?;
                let two_theta = fit.values[center_index];
                let theta = 0.5 * two_theta.to_radians();
                let sin_theta = theta.sin();
                if sin_theta <= 0.0 {
                    return None;
                }
                let d_spacing = wavelength / (2.0 * sin_theta);
                let slope = 0.5 * d_spacing * theta.cos() / sin_theta;
                Some(Measurement {
                    value: d_spacing,
                    error: (slope * fit.errors[center_index].to_radians()).abs(),
                })
            })
            .collect())
    }

    pub fn set_d_reference(&mut self, d_spacing: f64) -> HidraResult<()> {
        if !d_spacing.is_finite() || d_spacing <= 0.0 {
            return Err(HidraError::configuration(
                "PEAKS.D_REFERENCE",
                format!("reference d-spacing must be finite and > 0, got {d_spacing}"),
            ));
        }
        self.reference_d_spacing = Some(d_spacing);
        Ok(())
    }

    /// Lattice strain `(d - d0) / d0` against the reference d-spacing.
    pub fn get_strain(&self, wavelength: f64) -> HidraResult<Vec<Option<Measurement>>> {
        let reference = self.reference_d_spacing.ok_or_else(|| {
            HidraError::configuration(
                "PEAKS.D_REFERENCE",
                format!("peak '{}' has no reference d-spacing", self.tag),
            )
        })?;

        Ok(self
            .get_dspacing_center(wavelength)?
            .into_iter()
            .map(|d_spacing| {
                d_spacing.map(|d_spacing| Measurement {
                    value: (d_spacing.value - reference) / reference,
                    error: d_spacing.error / reference,
                })
            })
            .collect())
    }

    fn build_row(
        &self,
        sub_run: SubRunId,
        values: Option<Vec<f64>>,
        errors: Option<Vec<f64>>,
        chi_squared: Option<f64>,
    ) -> HidraResult<Option<NativeFit>> {
        match (values, errors, chi_squared) {
            (None, None, None) => Ok(None),
            (Some(values), Some(errors), Some(chi_squared)) => {
                self.check_native_lengths(sub_run, &values, &errors)?;
                Ok(Some(NativeFit::new(values, errors, chi_squared)))
            }
            _ => Err(HidraError::shape_mismatch(
                "PEAKS.ROW",
                format!("sub-run {sub_run} mixes fitted and missing values"),
            )),
        }
    }

    fn check_native_lengths(
        &self,
        sub_run: SubRunId,
        values: &[f64],
        errors: &[f64],
    ) -> HidraResult<()> {
        let expected = self.model.parameter_count();
        if values.len() != expected || errors.len() != expected {
            return Err(HidraError::shape_mismatch(
                "PEAKS.NATIVE_LENGTH",
                format!(
                    "sub-run {sub_run} has {} values and {} errors, {}+{} needs {expected}",
                    values.len(),
                    errors.len(),
                    self.model.peak,
                    self.model.background
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Measurement, NativeFit, PeakCollection};
    use crate::domain::HidraErrorCategory;
    use crate::peaks::shapes::{BackgroundShape, EffectiveParameter, PeakShape};

    fn gaussian_collection() -> PeakCollection {
        let mut collection =
            PeakCollection::new("Fe 211", PeakShape::Gaussian, BackgroundShape::Linear);
        collection
            .set_peak_fitting_values(
                vec![1, 2, 3],
                vec![
                    Some(vec![100.0, 82.0, 0.2, 1.0, 0.0]),
                    None,
                    Some(vec![90.0, 82.1, 0.25, 1.5, 0.0]),
                ],
                vec![
                    Some(vec![1.0, 0.001, 0.002, 0.1, 0.01]),
                    None,
                    Some(vec![1.0, 0.002, 0.002, 0.1, 0.01]),
                ],
                vec![Some(1.1), None, Some(0.9)],
            )
            .expect("store");
        collection
    }

    #[test]
    fn failed_rows_stay_in_effective_table() {
        let table = gaussian_collection()
            .get_effective_parameters_values()
            .expect("table");

        assert_eq!(table.len(), 3);
        assert_eq!(table.parameter_names[2], "FWHM");
        assert_eq!(table.sub_runs, vec![1, 2, 3]);
        assert_eq!(table.chi_squared, vec![Some(1.1), None, Some(0.9)]);
        assert!(table.values[1].is_none());
        assert!(table.errors[1].is_none());

        let centers = table.column(EffectiveParameter::Center);
        assert_eq!(centers, vec![Some(82.0), None, Some(82.1)]);
        let fwhm = table.values[0].expect("row")[EffectiveParameter::Fwhm.index()];
        assert!((fwhm - 2.3548 * 0.2).abs() < 1.0e-4);
    }

    #[test]
    fn mismatched_lengths_leave_previous_rows_untouched() {
        let mut collection = gaussian_collection();
        let before = collection.clone();

        let error = collection
            .set_peak_fitting_values(
                vec![1, 2, 3],
                vec![None, None],
                vec![None, None, None],
                vec![None, None, None],
            )
            .expect_err("short parameter array");
        assert_eq!(error.category(), HidraErrorCategory::ShapeMismatch);
        assert_eq!(collection, before);

        let error = collection
            .set_peak_fitting_values(vec![1, 2], vec![None; 2], vec![None; 2], vec![None; 2])
            .expect_err("different sub-runs");
        assert_eq!(error.category(), HidraErrorCategory::ShapeMismatch);

        let error = collection
            .set_peak_fitting_values(
                vec![1, 2, 3],
                vec![None, Some(vec![1.0; 4]), None],
                vec![None, Some(vec![1.0; 4]), None],
                vec![None, Some(1.0), None],
            )
            .expect_err("wrong native length");
        assert_eq!(error.category(), HidraErrorCategory::ShapeMismatch);

        let error = collection
            .set_peak_fitting_values(
                vec![1, 2, 3],
                vec![None, None, None],
                vec![None, None, None],
                vec![None, Some(1.0), None],
            )
            .expect_err("partial row");
        assert_eq!(error.category(), HidraErrorCategory::ShapeMismatch);
        assert_eq!(collection, before);
    }

    #[test]
    fn sub_runs_must_ascend() {
        let mut collection =
            PeakCollection::new("peak", PeakShape::Gaussian, BackgroundShape::Linear);
        let error = collection
            .set_peak_fitting_values(vec![3, 1], vec![None; 2], vec![None; 2], vec![None; 2])
            .expect_err("descending sub-runs");
        assert_eq!(error.category(), HidraErrorCategory::InvalidRange);
        assert!(collection.is_empty());
    }

    #[test]
    fn record_fit_overwrites_one_row() {
        let mut collection = gaussian_collection();
        let refit = NativeFit::new(vec![95.0, 82.05, 0.22, 1.2, 0.0], vec![0.5; 5], 1.0);
        collection.record_fit(2, Some(refit.clone())).expect("record");

        assert_eq!(collection.fit_for(2), Some(&refit));
        assert_eq!(collection.fit_for(1).expect("row 1").values[1], 82.0);

        collection.record_fit(3, None).expect("clear");
        assert_eq!(collection.fit_for(3), None);

        let error = collection.record_fit(7, None).expect_err("unknown sub-run");
        assert_eq!(error.category(), HidraErrorCategory::ShapeMismatch);
    }

    #[test]
    fn d_spacing_and_strain_follow_bragg_law() {
        let mut collection = gaussian_collection();
        let wavelength = 1.5;
        let d_spacing = collection.get_dspacing_center(wavelength).expect("d-spacing");

        let expected = wavelength / (2.0 * 41.0_f64.to_radians().sin());
        let Some(Measurement { value, error }) = d_spacing[0] else {
            panic!("sub-run 1 was fitted");
        };
        assert!((value - expected).abs() < 1.0e-12);
        assert!(error > 0.0);
        assert_eq!(d_spacing[1], None);

        assert!(collection.get_strain(wavelength).is_err());
        collection.set_d_reference(expected).expect("reference");
        let strain = collection.get_strain(wavelength).expect("strain");
        assert!(strain[0].expect("strain 1").value.abs() < 1.0e-12);
        assert!(strain[2].expect("strain 3").value < 0.0);
        assert_eq!(strain[1], None);

        assert!(collection.get_dspacing_center(0.0).is_err());
        assert!(collection.set_d_reference(-1.0).is_err());
    }
}
