use crate::common::constants::{GAUSSIAN_SIGMA_TO_FWHM, SQRT_LN2_OVER_PI, SQRT_TWO_PI};
use crate::domain::{HidraError, HidraResult};
use serde::{Deserialize, Serialize};
use std::f64::consts::{LN_2, PI};
use std::fmt::{Display, Formatter};

pub const EFFECTIVE_PARAMETER_COUNT: usize = 8;

/// One row of the shape-independent parameter set, ordered as [`EffectiveParameter::ALL`].
pub type EffectiveRow = [f64; EFFECTIVE_PARAMETER_COUNT];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectiveParameter {
    Center,
    Height,
    Fwhm,
    Mixing,
    Intensity,
    A0,
    A1,
    A2,
}

impl EffectiveParameter {
    pub const ALL: [Self; EFFECTIVE_PARAMETER_COUNT] = [
        Self::Center,
        Self::Height,
        Self::Fwhm,
        Self::Mixing,
        Self::Intensity,
        Self::A0,
        Self::A1,
        Self::A2,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Center => "Center",
            Self::Height => "Height",
            Self::Fwhm => "FWHM",
            Self::Mixing => "Mixing",
            Self::Intensity => "Intensity",
            Self::A0 => "A0",
            Self::A1 => "A1",
            Self::A2 => "A2",
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|parameter| parameter.as_str()).collect()
    }
}

impl Display for EffectiveParameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peak-only slice of the effective parameter set.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PeakEffective {
    center: f64,
    height: f64,
    fwhm: f64,
    mixing: f64,
    intensity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeakShape {
    #[serde(alias = "gaussian")]
    Gaussian,
    #[serde(alias = "lorentzian")]
    Lorentzian,
    #[serde(alias = "pseudoVoigt", alias = "pseudovoigt")]
    PseudoVoigt,
}

impl PeakShape {
    pub const ALL: [Self; 3] = [Self::Gaussian, Self::Lorentzian, Self::PseudoVoigt];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gaussian => "Gaussian",
            Self::Lorentzian => "Lorentzian",
            Self::PseudoVoigt => "PseudoVoigt",
        }
    }

    pub const fn native_parameter_names(self) -> &'static [&'static str] {
        match self {
            Self::Gaussian => &["Height", "PeakCentre", "Sigma"],
            Self::Lorentzian => &["Amplitude", "PeakCentre", "FWHM"],
            Self::PseudoVoigt => &["Mixing", "Intensity", "PeakCentre", "FWHM"],
        }
    }

    pub const fn parameter_count(self) -> usize {
        self.native_parameter_names().len()
    }

    /// Effective parameters derived from the native ones, in table order.
    pub const fn effective_names(self) -> &'static [EffectiveParameter] {
        &[
            EffectiveParameter::Center,
            EffectiveParameter::Height,
            EffectiveParameter::Fwhm,
            EffectiveParameter::Mixing,
            EffectiveParameter::Intensity,
        ]
    }

    pub const fn center_index(self) -> usize {
        match self {
            Self::Gaussian | Self::Lorentzian => 1,
            Self::PseudoVoigt => 2,
        }
    }

    /// Native parameters reproducing the given center, peak height and FWHM.
    pub fn from_height_and_width(self, center: f64, height: f64, fwhm: f64) -> Vec<f64> {
        match self {
            Self::Gaussian => vec![height, center, fwhm / GAUSSIAN_SIGMA_TO_FWHM],
            Self::Lorentzian => vec![height * PI * fwhm * 0.5, center, fwhm],
            Self::PseudoVoigt => {
                let mixing = 0.5;
                vec![mixing, height * fwhm / pseudo_voigt_peak_factor(mixing), center, fwhm]
            }
        }
    }

    pub fn evaluate(self, params: &[f64], x: f64) -> f64 {
        match self {
            Self::Gaussian => {
                let (height, center, sigma) = (params[0], params[1], params[2]);
                let dx = x - center;
                height * (-dx * dx / (2.0 * sigma * sigma)).exp()
            }
            Self::Lorentzian => {
                let (amplitude, center, fwhm) = (params[0], params[1], params[2]);
                amplitude * lorentzian_profile(x - center, fwhm)
            }
            Self::PseudoVoigt => {
                let (mixing, intensity, center, fwhm) =
                    (params[0], params[1], params[2], params[3]);
                let dx = x - center;
                intensity
                    * (mixing * lorentzian_profile(dx, fwhm)
                        + (1.0 - mixing) * normalized_gaussian(dx, fwhm))
            }
        }
    }

    /// Writes `d f / d param` for each native parameter into `out`.
    pub fn gradient(self, params: &[f64], x: f64, out: &mut [f64]) {
        match self {
            Self::Gaussian => {
                let (height, center, sigma) = (params[0], params[1], params[2]);
                let dx = x - center;
                let sigma2 = sigma * sigma;
                let exponential = (-dx * dx / (2.0 * sigma2)).exp();
                out[0] = exponential;
                out[1] = height * exponential * dx / sigma2;
                out[2] = height * exponential * dx * dx / (sigma2 * sigma);
            }
            Self::Lorentzian => {
                let (amplitude, center, fwhm) = (params[0], params[1], params[2]);
                let dx = x - center;
                let (d_center, d_fwhm) = lorentzian_profile_derivatives(dx, fwhm);
                out[0] = lorentzian_profile(dx, fwhm);
                out[1] = amplitude * d_center;
                out[2] = amplitude * d_fwhm;
            }
            Self::PseudoVoigt => {
                let (mixing, intensity, center, fwhm) =
                    (params[0], params[1], params[2], params[3]);
                let dx = x - center;
                let lorentzian = lorentzian_profile(dx, fwhm);
                let gaussian = normalized_gaussian(dx, fwhm);
                let (l_center, l_fwhm) = lorentzian_profile_derivatives(dx, fwhm);
                let four_ln2 = 4.0 * LN_2;
                let g_center = gaussian * 2.0 * four_ln2 * dx / (fwhm * fwhm);
                let g_fwhm =
                    gaussian * (2.0 * four_ln2 * dx * dx / (fwhm * fwhm * fwhm) - 1.0 / fwhm);

                out[0] = intensity * (lorentzian - gaussian);
                out[1] = mixing * lorentzian + (1.0 - mixing) * gaussian;
                out[2] = intensity * (mixing * l_center + (1.0 - mixing) * g_center);
                out[3] = intensity * (mixing * l_fwhm + (1.0 - mixing) * g_fwhm);
            }
        }
    }

    /// Makes sign-symmetric width parameters positive without changing the curve.
    pub fn canonicalize(self, params: &mut [f64]) {
        if self == Self::Gaussian {
            params[2] = params[2].abs();
        }
    }

    fn effective_values(self, params: &[f64]) -> PeakEffective {
        match self {
            Self::Gaussian => {
                let (height, center, sigma) = (params[0], params[1], params[2]);
                PeakEffective {
                    center,
                    height,
                    fwhm: GAUSSIAN_SIGMA_TO_FWHM * sigma,
                    mixing: 0.0,
                    intensity: height * sigma * SQRT_TWO_PI,
                }
            }
            Self::Lorentzian => {
                let (amplitude, center, fwhm) = (params[0], params[1], params[2]);
                PeakEffective {
                    center,
                    height: 2.0 * amplitude / (PI * fwhm),
                    fwhm,
                    mixing: 1.0,
                    intensity: amplitude,
                }
            }
            Self::PseudoVoigt => {
                let (mixing, intensity, center, fwhm) =
                    (params[0], params[1], params[2], params[3]);
                PeakEffective {
                    center,
                    height: intensity * pseudo_voigt_peak_factor(mixing) / fwhm,
                    fwhm,
                    mixing,
                    intensity,
                }
            }
        }
    }

    /// First-order propagation of independent native errors.
    fn effective_errors(self, params: &[f64], errors: &[f64]) -> PeakEffective {
        match self {
            Self::Gaussian => {
                let (height, sigma) = (params[0], params[2]);
                let (e_height, e_center, e_sigma) = (errors[0], errors[1], errors[2]);
                PeakEffective {
                    center: e_center,
                    height: e_height,
                    fwhm: GAUSSIAN_SIGMA_TO_FWHM * e_sigma,
                    mixing: 0.0,
                    intensity: SQRT_TWO_PI * (sigma * e_height).hypot(height * e_sigma),
                }
            }
            Self::Lorentzian => {
                let (amplitude, fwhm) = (params[0], params[2]);
                let (e_amplitude, e_center, e_fwhm) = (errors[0], errors[1], errors[2]);
                PeakEffective {
                    center: e_center,
                    height: 2.0 / PI
                        * (e_amplitude / fwhm).hypot(amplitude * e_fwhm / (fwhm * fwhm)),
                    fwhm: e_fwhm,
                    mixing: 0.0,
                    intensity: e_amplitude,
                }
            }
            Self::PseudoVoigt => {
                let (mixing, intensity, fwhm) = (params[0], params[1], params[3]);
                let (e_mixing, e_intensity, e_center, e_fwhm) =
                    (errors[0], errors[1], errors[2], errors[3]);
                let factor = pseudo_voigt_peak_factor(mixing);
                let height = intensity * factor / fwhm;
                let d_mixing = intensity * (2.0 / PI - 2.0 * SQRT_LN2_OVER_PI) / fwhm;
                let d_intensity = factor / fwhm;
                let d_fwhm = -height / fwhm;
                PeakEffective {
                    center: e_center,
                    height: ((d_mixing * e_mixing).powi(2)
                        + (d_intensity * e_intensity).powi(2)
                        + (d_fwhm * e_fwhm).powi(2))
                    .sqrt(),
                    fwhm: e_fwhm,
                    mixing: e_mixing,
                    intensity: e_intensity,
                }
            }
        }
    }
}

impl Display for PeakShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit-area Lorentzian with full width `fwhm`.
fn lorentzian_profile(dx: f64, fwhm: f64) -> f64 {
    let half = 0.5 * fwhm;
    half / (PI * (dx * dx + half * half))
}

/// Derivatives of [`lorentzian_profile`] with respect to center and FWHM.
fn lorentzian_profile_derivatives(dx: f64, fwhm: f64) -> (f64, f64) {
    let half = 0.5 * fwhm;
    let denominator = dx * dx + half * half;
    let squared = denominator * denominator;
    let d_center = half * 2.0 * dx / (PI * squared);
    let d_fwhm = 0.5 * (dx * dx - half * half) / (PI * squared);
    (d_center, d_fwhm)
}

/// Unit-area Gaussian parameterized by its FWHM.
fn normalized_gaussian(dx: f64, fwhm: f64) -> f64 {
    2.0 / fwhm * SQRT_LN2_OVER_PI * (-4.0 * LN_2 * dx * dx / (fwhm * fwhm)).exp()
}

/// Peak height of a unit-intensity pseudo-Voigt, times its FWHM.
fn pseudo_voigt_peak_factor(mixing: f64) -> f64 {
    mixing * 2.0 / PI + (1.0 - mixing) * 2.0 * SQRT_LN2_OVER_PI
}

/// Polynomial background in the scattering angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackgroundShape {
    #[serde(alias = "linear")]
    Linear,
    #[serde(alias = "quadratic")]
    Quadratic,
}

impl BackgroundShape {
    pub const ALL: [Self; 2] = [Self::Linear, Self::Quadratic];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "Linear",
            Self::Quadratic => "Quadratic",
        }
    }

    pub const fn native_parameter_names(self) -> &'static [&'static str] {
        match self {
            Self::Linear => &["A0", "A1"],
            Self::Quadratic => &["A0", "A1", "A2"],
        }
    }

    pub const fn parameter_count(self) -> usize {
        self.native_parameter_names().len()
    }

    pub const fn effective_names(self) -> &'static [EffectiveParameter] {
        match self {
            Self::Linear => &[EffectiveParameter::A0, EffectiveParameter::A1],
            Self::Quadratic => &[
                EffectiveParameter::A0,
                EffectiveParameter::A1,
                EffectiveParameter::A2,
            ],
        }
    }

    /// Native coefficients for the line `intercept + slope * x`.
    pub fn from_line(self, intercept: f64, slope: f64) -> Vec<f64> {
        match self {
            Self::Linear => vec![intercept, slope],
            Self::Quadratic => vec![intercept, slope, 0.0],
        }
    }

    pub fn evaluate(self, params: &[f64], x: f64) -> f64 {
        params.iter().rev().fold(0.0, |acc, coefficient| acc * x + coefficient)
    }

    pub fn gradient(self, x: f64, out: &mut [f64]) {
        let mut power = 1.0;
        for value in out.iter_mut().take(self.parameter_count()) {
            *value = power;
            power *= x;
        }
    }

    /// Re-expresses coefficients of a polynomial in `x - origin` as coefficients in `x`.
    pub fn shift_origin_matrix(self, origin: f64) -> Vec<Vec<f64>> {
        let count = self.parameter_count();
        let mut matrix = vec![vec![0.0; count]; count];
        for (row, matrix_row) in matrix.iter_mut().enumerate() {
            for (col, value) in matrix_row.iter_mut().enumerate().skip(row) {
                *value = binomial(col, row) * (-origin).powi((col - row) as i32);
            }
        }
        matrix
    }
}

impl Display for BackgroundShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// Peak plus background; native parameters are the peak's followed by the background's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeModel {
    pub peak: PeakShape,
    pub background: BackgroundShape,
}

impl ShapeModel {
    pub fn new(peak: PeakShape, background: BackgroundShape) -> Self {
        Self { peak, background }
    }

    pub fn parameter_count(&self) -> usize {
        self.peak.parameter_count() + self.background.parameter_count()
    }

    pub fn native_parameter_names(&self) -> Vec<&'static str> {
        self.peak
            .native_parameter_names()
            .iter()
            .chain(self.background.native_parameter_names())
            .copied()
            .collect()
    }

    /// Effective parameters this model actually fits; the rest of a row stays zero.
    pub fn effective_names(&self) -> Vec<EffectiveParameter> {
        self.peak
            .effective_names()
            .iter()
            .chain(self.background.effective_names())
            .copied()
            .collect()
    }

    pub fn center_index(&self) -> usize {
        self.peak.center_index()
    }

    pub fn evaluate(&self, params: &[f64], x: f64) -> f64 {
        debug_assert_eq!(
            params.len(),
            self.parameter_count(),
            "{}+{} takes {} native parameters",
            self.peak,
            self.background,
            self.parameter_count()
        );
        let (peak, background) = params.split_at(self.peak.parameter_count());
        self.peak.evaluate(peak, x) + self.background.evaluate(background, x)
    }

    pub fn gradient(&self, params: &[f64], x: f64, out: &mut [f64]) {
        debug_assert_eq!(
            params.len(),
            self.parameter_count(),
            "{}+{} takes {} native parameters",
            self.peak,
            self.background,
            self.parameter_count()
        );
        debug_assert_eq!(out.len(), params.len(), "gradient buffer length");
        let split = self.peak.parameter_count();
        let (peak, _) = params.split_at(split);
        let (peak_out, background_out) = out.split_at_mut(split);
        self.peak.gradient(peak, x, peak_out);
        self.background.gradient(x, background_out);
    }

    pub fn effective_values(&self, native: &[f64]) -> HidraResult<EffectiveRow> {
        self.check_length("native parameters", native.len())?;
        let (peak, background) = native.split_at(self.peak.parameter_count());
        Ok(assemble_row(self.peak.effective_values(peak), background))
    }

    pub fn effective_errors(&self, native: &[f64], errors: &[f64]) -> HidraResult<EffectiveRow> {
        self.check_length("native parameters", native.len())?;
        self.check_length("native errors", errors.len())?;
        let split = self.peak.parameter_count();
        let peak = self.peak.effective_errors(&native[..split], &errors[..split]);
        Ok(assemble_row(peak, &errors[split..]))
    }

    fn check_length(&self, name: &str, actual: usize) -> HidraResult<()> {
        let expected = self.parameter_count();
        if actual != expected {
            return Err(HidraError::shape_mismatch(
                "PEAKS.NATIVE_LENGTH",
                format!(
                    "{name} for {}+{} need {expected} values, got {actual}",
                    self.peak, self.background
                ),
            ));
        }
        Ok(())
    }
}

fn assemble_row(peak: PeakEffective, background: &[f64]) -> EffectiveRow {
    let mut row = [0.0; EFFECTIVE_PARAMETER_COUNT];
    row[EffectiveParameter::Center.index()] = peak.center;
    row[EffectiveParameter::Height.index()] = peak.height;
    row[EffectiveParameter::Fwhm.index()] = peak.fwhm;
    row[EffectiveParameter::Mixing.index()] = peak.mixing;
    row[EffectiveParameter::Intensity.index()] = peak.intensity;
    for (slot, value) in row[EffectiveParameter::A0.index()..].iter_mut().zip(background) {
        *slot = *value;
    }
    row
}
