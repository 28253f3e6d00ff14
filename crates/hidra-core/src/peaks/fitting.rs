use super::shapes::{BackgroundShape, EffectiveParameter, EffectiveRow, PeakShape, ShapeModel};
use crate::domain::{HidraError, HidraResult};
use crate::numerics::{DenseMatrix, invert_symmetric, mean, solve_symmetric};
use crate::reduction::Pattern;
use std::fmt::{Display, Formatter};

/// Points averaged at each end of the window for the initial background line.
const BACKGROUND_EDGE_POINTS: usize = 3;
/// Peak excess below this fraction of the largest intensity counts as no signal.
const SIGNAL_FLOOR: f64 = 1.0e-9;
/// A fitted height must exceed this many of its standard errors.
const HEIGHT_SIGNIFICANCE: f64 = 3.0;
const MIN_LAMBDA: f64 = 1.0e-15;

/// Closed angular interval `[left, right]` in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitWindow {
    left: f64,
    right: f64,
}

impl FitWindow {
    pub fn new(left: f64, right: f64) -> HidraResult<Self> {
        if !left.is_finite() || !right.is_finite() || right <= left {
            return Err(HidraError::invalid_range(
                "FIT.WINDOW",
                format!("fit window must be finite with right > left, got [{left}, {right}]"),
            ));
        }
        Ok(Self { left, right })
    }

    pub fn left(&self) -> f64 {
        self.left
    }

    pub fn right(&self) -> f64 {
        self.right
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.left + self.right)
    }

    pub fn contains(&self, angle: f64) -> bool {
        angle >= self.left && angle <= self.right
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum FitFailure {
    #[error("no more usable points than free parameters")]
    InsufficientData,
    #[error("no significant peak above the background")]
    NoPeakSignal,
    #[error("iteration cap reached before convergence")]
    NotConverged,
    #[error("normal matrix is singular")]
    SingularCovariance,
    #[error("fit produced non-finite values")]
    NonFiniteResult,
    #[error("fitted center left the window")]
    OutsideWindow,
    #[error("fitted width is narrower than one bin or exceeds the window")]
    UnphysicalWidth,
    #[error("fitted mixing fraction lies outside [0, 1]")]
    UnphysicalMixing,
}

impl FitFailure {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientData => "InsufficientData",
            Self::NoPeakSignal => "NoPeakSignal",
            Self::NotConverged => "NotConverged",
            Self::SingularCovariance => "SingularCovariance",
            Self::NonFiniteResult => "NonFiniteResult",
            Self::OutsideWindow => "OutsideWindow",
            Self::UnphysicalWidth => "UnphysicalWidth",
            Self::UnphysicalMixing => "UnphysicalMixing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FitStatus {
    Converged,
    Failed(FitFailure),
}

impl FitStatus {
    pub fn is_converged(self) -> bool {
        self == Self::Converged
    }

    pub fn failure(self) -> Option<FitFailure> {
        match self {
            Self::Converged => None,
            Self::Failed(reason) => Some(reason),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Converged => "Converged",
            Self::Failed(_) => "Failed",
        }
    }
}

impl Display for FitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => f.write_str("Converged"),
            Self::Failed(reason) => write!(f, "Failed ({})", reason.as_str()),
        }
    }
}

/// Levenberg-Marquardt controls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSettings {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub lambda_factor: f64,
    pub chi_squared_tolerance: f64,
    pub step_tolerance: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            initial_lambda: 1.0e-3,
            lambda_factor: 10.0,
            chi_squared_tolerance: 1.0e-10,
            step_tolerance: 1.0e-10,
        }
    }
}

/// Outcome of one peak fit. Native values and errors are absent, never zeroed,
/// when the fit failed.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakFitResult {
    model: ShapeModel,
    window: FitWindow,
    status: FitStatus,
    parameters: Option<Vec<f64>>,
    errors: Option<Vec<f64>>,
    reduced_chi_squared: Option<f64>,
    iterations: usize,
    points: usize,
}

impl PeakFitResult {
    fn failed(
        model: ShapeModel,
        window: FitWindow,
        reason: FitFailure,
        iterations: usize,
        points: usize,
    ) -> Self {
        Self {
            model,
            window,
            status: FitStatus::Failed(reason),
            parameters: None,
            errors: None,
            reduced_chi_squared: None,
            iterations,
            points,
        }
    }

    pub fn model(&self) -> ShapeModel {
        self.model
    }

    pub fn peak_shape(&self) -> PeakShape {
        self.model.peak
    }

    pub fn background_shape(&self) -> BackgroundShape {
        self.model.background
    }

    pub fn window(&self) -> FitWindow {
        self.window
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }

    pub fn parameters(&self) -> Option<&[f64]> {
        self.parameters.as_deref()
    }

    pub fn errors(&self) -> Option<&[f64]> {
        self.errors.as_deref()
    }

    pub fn reduced_chi_squared(&self) -> Option<f64> {
        self.reduced_chi_squared
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Data points that entered the fit.
    pub fn points(&self) -> usize {
        self.points
    }

    pub fn effective_values(&self) -> Option<EffectiveRow> {
        self.model.effective_values(self.parameters.as_deref()?).ok()
    }

    pub fn effective_errors(&self) -> Option<EffectiveRow> {
        let parameters = self.parameters.as_deref()?;
        let errors = self.errors.as_deref()?;
        self.model.effective_errors(parameters, errors).ok()
    }

    /// Fitted peak plus background at each angle; `None` for a failed fit.
    pub fn evaluate(&self, angles: &[f64]) -> Option<Vec<f64>> {
        let parameters = self.parameters.as_deref()?;
        Some(
            angles
                .iter()
                .map(|angle| self.model.evaluate(parameters, *angle))
                .collect(),
        )
    }
}

/// Fits one peak plus background inside a window of a reduced pattern.
///
/// Numerical trouble is reported through [`FitStatus::Failed`]; only malformed
/// inputs (window, initial center) return an error.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PeakFittingEngine {
    settings: FitSettings,
}

impl PeakFittingEngine {
    pub fn new(settings: FitSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FitSettings {
        &self.settings
    }

    /// Without an `initial_center` the search starts from the window's center of
    /// mass, or its midpoint when nothing in it is positive.
    pub fn fit(
        &self,
        pattern: &Pattern,
        window: FitWindow,
        initial_center: Option<f64>,
        peak_shape: PeakShape,
        background_shape: BackgroundShape,
    ) -> HidraResult<PeakFitResult> {
        let model = ShapeModel::new(peak_shape, background_shape);
        let initial_center = initial_center.unwrap_or_else(|| {
            pattern
                .center_of_mass(window.left, window.right)
                .unwrap_or_else(|| window.midpoint())
        });
        if !initial_center.is_finite() || !window.contains(initial_center) {
            return Err(HidraError::invalid_range(
                "FIT.INITIAL_CENTER",
                format!(
                    "initial center {initial_center} must lie inside [{}, {}]",
                    window.left, window.right
                ),
            ));
        }

        // Fit in angles relative to the window midpoint so the background
        // columns of the Jacobian stay well conditioned.
        let origin = window.midpoint();
        let data = FitData::collect(pattern, window, origin);
        let points = data.len();
        let parameter_count = model.parameter_count();
        // At least one degree of freedom is needed for the reduced chi-squared.
        if points <= parameter_count {
            return Ok(PeakFitResult::failed(
                model,
                window,
                FitFailure::InsufficientData,
                0,
                points,
            ));
        }

        let Some(initial) = initial_guess(&model, &data, initial_center - origin, window.width())
        else {
            return Ok(PeakFitResult::failed(
                model,
                window,
                FitFailure::NoPeakSignal,
                0,
                points,
            ));
        };

        let minimization = match self.minimize(&model, &data, initial) {
            Ok(minimization) => minimization,
            Err(failure) => {
                return Ok(PeakFitResult::failed(
                    model,
                    window,
                    failure.reason,
                    failure.iterations,
                    points,
                ));
            }
        };
        let iterations = minimization.iterations;

        let degrees_of_freedom = (points - parameter_count) as f64;
        let reduced_chi_squared = minimization.chi_squared / degrees_of_freedom;
        let covariance =
            match NormalEquations::assemble(&model, &data, &minimization.params).covariance() {
                Ok(covariance) => covariance,
                Err(reason) => {
                    return Ok(PeakFitResult::failed(
                        model, window, reason, iterations, points,
                    ));
                }
            };

        let (mut parameters, errors) = to_absolute_angles(
            &model,
            &minimization.params,
            &covariance,
            origin,
            reduced_chi_squared,
        );
        model.peak.canonicalize(&mut parameters);

        if parameters.iter().chain(&errors).any(|value| !value.is_finite())
            || !reduced_chi_squared.is_finite()
        {
            return Ok(PeakFitResult::failed(
                model,
                window,
                FitFailure::NonFiniteResult,
                iterations,
                points,
            ));
        }

        let (effective, effective_errors) = model
            .effective_values(&parameters)
            .and_then(|values| Ok((values, model.effective_errors(&parameters, &errors)?)))
            .map_err(|error| HidraError::internal("FIT.EFFECTIVE", error.message()))?;
        let limits = PhysicalLimits {
            window,
            min_width: bin_spacing(pattern, window),
        };
        if let Some(reason) = limits.check(&effective, &effective_errors) {
            return Ok(PeakFitResult::failed(
                model, window, reason, iterations, points,
            ));
        }

        Ok(PeakFitResult {
            model,
            window,
            status: FitStatus::Converged,
            parameters: Some(parameters),
            errors: Some(errors),
            reduced_chi_squared: Some(reduced_chi_squared),
            iterations,
            points,
        })
    }

    /// The fitted curve sampled at the pattern's angles inside the fit window.
    pub fn modeled_pattern(
        &self,
        pattern: &Pattern,
        result: &PeakFitResult,
    ) -> HidraResult<Option<Pattern>> {
        let window = result.window();
        let range = pattern.window_indices(window.left, window.right);
        let angles = pattern.angles()[range].to_vec();
        let Some(intensities) = result.evaluate(&angles) else {
            return Ok(None);
        };
        Pattern::new(angles, intensities, None, pattern.angle_convention()).map(Some)
    }

    fn minimize(
        &self,
        model: &ShapeModel,
        data: &FitData,
        initial: Vec<f64>,
    ) -> Result<Minimization, SolveFailure> {
        let settings = &self.settings;
        let mut params = initial;
        let mut chi_squared = data.chi_squared(model, &params);
        if !chi_squared.is_finite() {
            return Err(SolveFailure::new(FitFailure::NonFiniteResult, 0));
        }

        let mut lambda = settings.initial_lambda;
        let mut normal = NormalEquations::assemble(model, data, &params);
        for iteration in 1..=settings.max_iterations {
            if chi_squared == 0.0 {
                return Ok(Minimization::new(params, chi_squared, iteration - 1));
            }

            let step = normal
                .damped_step(lambda)
                .map_err(|reason| SolveFailure::new(reason, iteration))?;
            let trial: Vec<f64> = params.iter().zip(&step).map(|(p, s)| p + s).collect();
            let trial_chi_squared = data.chi_squared(model, &trial);
            let small_step = euclidean_norm(&step)
                <= settings.step_tolerance * (euclidean_norm(&params) + settings.step_tolerance);

            if trial_chi_squared.is_finite() && trial_chi_squared < chi_squared {
                let relative_drop = (chi_squared - trial_chi_squared) / chi_squared;
                params = trial;
                chi_squared = trial_chi_squared;
                lambda = (lambda / settings.lambda_factor).max(MIN_LAMBDA);
                if relative_drop <= settings.chi_squared_tolerance || small_step {
                    return Ok(Minimization::new(params, chi_squared, iteration));
                }
                normal = NormalEquations::assemble(model, data, &params);
            } else {
                lambda *= settings.lambda_factor;
                if small_step {
                    return Ok(Minimization::new(params, chi_squared, iteration));
                }
            }
        }

        Err(SolveFailure::new(
            FitFailure::NotConverged,
            settings.max_iterations,
        ))
    }
}

struct Minimization {
    params: Vec<f64>,
    chi_squared: f64,
    iterations: usize,
}

impl Minimization {
    fn new(params: Vec<f64>, chi_squared: f64, iterations: usize) -> Self {
        Self {
            params,
            chi_squared,
            iterations,
        }
    }
}

struct SolveFailure {
    reason: FitFailure,
    iterations: usize,
}

impl SolveFailure {
    fn new(reason: FitFailure, iterations: usize) -> Self {
        Self { reason, iterations }
    }
}

/// In-window points with usable weights; `x` is relative to the window midpoint.
struct FitData {
    x: Vec<f64>,
    y: Vec<f64>,
    weights: Vec<f64>,
}

impl FitData {
    fn collect(pattern: &Pattern, window: FitWindow, origin: f64) -> Self {
        let range = pattern.window_indices(window.left, window.right);
        let mut data = Self {
            x: Vec::with_capacity(range.len()),
            y: Vec::with_capacity(range.len()),
            weights: Vec::with_capacity(range.len()),
        };

        for index in range {
            let intensity = pattern.intensities()[index];
            let weight = match pattern.uncertainties() {
                Some(uncertainties) => {
                    let sigma = uncertainties[index];
                    if !(sigma.is_finite() && sigma > 0.0) {
                        continue;
                    }
                    1.0 / (sigma * sigma)
                }
                None => 1.0,
            };
            if !intensity.is_finite() {
                continue;
            }
            data.x.push(pattern.angles()[index] - origin);
            data.y.push(intensity);
            data.weights.push(weight);
        }
        data
    }

    fn len(&self) -> usize {
        self.x.len()
    }

    fn chi_squared(&self, model: &ShapeModel, params: &[f64]) -> f64 {
        self.x
            .iter()
            .zip(&self.y)
            .zip(&self.weights)
            .map(|((x, y), weight)| {
                let residual = y - model.evaluate(params, *x);
                weight * residual * residual
            })
            .sum()
    }
}

/// `J^T W J` and `J^T W r` together with the Marquardt column scales.
struct NormalEquations {
    matrix: DenseMatrix,
    gradient: Vec<f64>,
    scale: Vec<f64>,
}

impl NormalEquations {
    fn assemble(model: &ShapeModel, data: &FitData, params: &[f64]) -> Self {
        let count = params.len();
        let mut matrix = DenseMatrix::zeros(count, count);
        let mut gradient = vec![0.0; count];
        let mut row = vec![0.0; count];

        for ((x, y), weight) in data.x.iter().zip(&data.y).zip(&data.weights) {
            model.gradient(params, *x, &mut row);
            let residual = y - model.evaluate(params, *x);
            for i in 0..count {
                gradient[i] += weight * residual * row[i];
                for j in 0..=i {
                    matrix[(i, j)] += weight * row[i] * row[j];
                }
            }
        }
        for i in 0..count {
            for j in 0..i {
                matrix[(j, i)] = matrix[(i, j)];
            }
        }

        let scale = (0..count).map(|index| matrix[(index, index)].sqrt()).collect();
        Self {
            matrix,
            gradient,
            scale,
        }
    }

    /// Unit-diagonal form of the normal matrix with `lambda` added to the diagonal.
    fn scaled(&self, lambda: f64) -> Result<DenseMatrix, FitFailure> {
        if self
            .scale
            .iter()
            .any(|scale| !scale.is_finite() || *scale <= 0.0)
        {
            return Err(FitFailure::SingularCovariance);
        }

        let count = self.scale.len();
        let mut scaled = DenseMatrix::zeros(count, count);
        for i in 0..count {
            for j in 0..count {
                scaled[(i, j)] = self.matrix[(i, j)] / (self.scale[i] * self.scale[j]);
            }
            scaled[(i, i)] += lambda;
        }
        Ok(scaled)
    }

    fn damped_step(&self, lambda: f64) -> Result<Vec<f64>, FitFailure> {
        let scaled = self.scaled(lambda)?;
        let rhs: Vec<f64> = self
            .gradient
            .iter()
            .zip(&self.scale)
            .map(|(gradient, scale)| gradient / scale)
            .collect();
        let solution =
            solve_symmetric(&scaled, &rhs).map_err(|_| FitFailure::SingularCovariance)?;
        Ok(solution
            .iter()
            .zip(&self.scale)
            .map(|(value, scale)| value / scale)
            .collect())
    }

    /// `(J^T W J)^-1`, before scaling by the reduced chi-squared.
    fn covariance(&self) -> Result<DenseMatrix, FitFailure> {
        let inverse =
            invert_symmetric(&self.scaled(0.0)?).map_err(|_| FitFailure::SingularCovariance)?;
        let count = self.scale.len();
        let mut covariance = DenseMatrix::zeros(count, count);
        for i in 0..count {
            for j in 0..count {
                covariance[(i, j)] = inverse[(i, j)] / (self.scale[i] * self.scale[j]);
            }
        }
        Ok(covariance)
    }
}

fn initial_guess(
    model: &ShapeModel,
    data: &FitData,
    center: f64,
    window_width: f64,
) -> Option<Vec<f64>> {
    let count = data.len();
    let edge = BACKGROUND_EDGE_POINTS.min(count);
    let x_low = mean(&data.x[..edge])?;
    let y_low = mean(&data.y[..edge])?;
    let x_high = mean(&data.x[count - edge..])?;
    let y_high = mean(&data.y[count - edge..])?;
    let slope = if x_high > x_low {
        (y_high - y_low) / (x_high - x_low)
    } else {
        0.0
    };
    let intercept = y_low - slope * x_low;

    let excess: Vec<f64> = data
        .x
        .iter()
        .zip(&data.y)
        .map(|(x, y)| y - (intercept + slope * x))
        .collect();
    let (peak_index, height) = excess
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (index, value)| {
            if value > best.1 { (index, value) } else { best }
        });
    let magnitude = data.y.iter().fold(0.0_f64, |acc, y| acc.max(y.abs()));
    if !(height > SIGNAL_FLOOR * magnitude.max(f64::MIN_POSITIVE)) {
        return None;
    }

    let half = 0.5 * height;
    let mut low = peak_index;
    while low > 0 && excess[low - 1] >= half {
        low -= 1;
    }
    let mut high = peak_index;
    while high + 1 < count && excess[high + 1] >= half {
        high += 1;
    }
    let span = data.x[high] - data.x[low];
    let fwhm = if span > 0.0 { span } else { window_width / 6.0 };

    let mut params = model.peak.from_height_and_width(center, height, fwhm);
    params.extend(model.background.from_line(intercept, slope));
    Some(params)
}

/// Undoes the window-midpoint shift on values and propagates the covariance
/// through the background re-expansion.
fn to_absolute_angles(
    model: &ShapeModel,
    params: &[f64],
    covariance: &DenseMatrix,
    origin: f64,
    reduced_chi_squared: f64,
) -> (Vec<f64>, Vec<f64>) {
    let split = model.peak.parameter_count();
    let mut values = params.to_vec();
    values[model.center_index()] += origin;

    let mut errors: Vec<f64> = (0..split)
        .map(|index| (covariance[(index, index)] * reduced_chi_squared).sqrt())
        .collect();

    let shift = model.background.shift_origin_matrix(origin);
    for (row, coefficients) in shift.iter().enumerate() {
        values[split + row] = coefficients
            .iter()
            .zip(&params[split..])
            .map(|(m, b)| m * b)
            .sum();

        let mut variance = 0.0;
        for (k, m_k) in coefficients.iter().enumerate() {
            for (l, m_l) in coefficients.iter().enumerate() {
                variance += m_k * m_l * covariance[(split + k, split + l)];
            }
        }
        errors.push((variance.max(0.0) * reduced_chi_squared).sqrt());
    }

    (values, errors)
}

/// Bounds a converged solution must satisfy to count as a peak.
struct PhysicalLimits {
    window: FitWindow,
    /// Narrowest bin spacing inside the window.
    min_width: f64,
}

impl PhysicalLimits {
    fn check(&self, effective: &EffectiveRow, errors: &EffectiveRow) -> Option<FitFailure> {
        let center = effective[EffectiveParameter::Center.index()];
        let height = effective[EffectiveParameter::Height.index()];
        let fwhm = effective[EffectiveParameter::Fwhm.index()];
        let mixing = effective[EffectiveParameter::Mixing.index()];

        if !self.window.contains(center) {
            return Some(FitFailure::OutsideWindow);
        }
        if !(fwhm >= self.min_width && fwhm > 0.0 && fwhm < self.window.width()) {
            return Some(FitFailure::UnphysicalWidth);
        }
        if !(0.0..=1.0).contains(&mixing) {
            return Some(FitFailure::UnphysicalMixing);
        }
        let height_error = errors[EffectiveParameter::Height.index()];
        if height <= 0.0 || height <= HEIGHT_SIGNIFICANCE * height_error {
            return Some(FitFailure::NoPeakSignal);
        }
        None
    }
}

fn bin_spacing(pattern: &Pattern, window: FitWindow) -> f64 {
    let range = pattern.window_indices(window.left, window.right);
    pattern.angles()[range]
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold(None, |narrowest: Option<f64>, step| {
            Some(narrowest.map_or(step, |narrowest| narrowest.min(step)))
        })
        .unwrap_or(0.0)
}

fn euclidean_norm(values: &[f64]) -> f64 {
    values.iter().map(|value| value * value).sum::<f64>().sqrt()
}
