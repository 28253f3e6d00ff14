use super::{CalibrationCorrection, GeometryModel, Matrix3, Vector3, norm3, rotate, rotation_y};
use crate::domain::{HidraError, HidraResult, MotorLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AngleDimension {
    /// One value per pixel in row-major order.
    Flat,
    /// `rows` vectors of `columns` values.
    RowColumn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScatteringAngles {
    Flat(Vec<f64>),
    RowColumn(Vec<Vec<f64>>),
}

impl ScatteringAngles {
    pub fn into_flat(self) -> Vec<f64> {
        match self {
            Self::Flat(values) => values,
            Self::RowColumn(rows) => rows.into_iter().flatten().collect(),
        }
    }
}

/// Converts motor positions plus calibration into per-pixel positions and
/// scattering angles.
///
/// The engine holds only the immutable geometry model. Every `build` returns a
/// fresh [`PixelGeometry`], so one engine serves any number of arm positions.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentGeometryEngine {
    geometry: GeometryModel,
}

impl InstrumentGeometryEngine {
    pub fn new(geometry: GeometryModel) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> &GeometryModel {
        &self.geometry
    }

    /// Places every pixel for the given arm angle (degrees) and distance.
    ///
    /// Correction order: calibration rotation about the detector center, then
    /// the calibration shift, then the arm offset along the beam, then the
    /// two-theta swing about the vertical axis through the sample.
    pub fn build(
        &self,
        two_theta: f64,
        l2: Option<f64>,
        calibration: &CalibrationCorrection,
    ) -> HidraResult<PixelGeometry> {
        self.geometry.validate()?;
        calibration.validate()?;

        if !two_theta.is_finite() {
            return Err(HidraError::configuration(
                "GEOMETRY.TWO_THETA",
                format!("two-theta must be finite, got {two_theta}"),
            ));
        }

        let l2 = l2.unwrap_or(self.geometry.nominal_distance);
        if !l2.is_finite() || l2 <= 0.0 {
            return Err(HidraError::configuration(
                "GEOMETRY.L2",
                format!("L2 must be finite and > 0, got {l2}"),
            ));
        }

        let calibration_rotation = calibration.rotation_matrix();
        let shift = calibration.translation();
        let arm = [shift[0], shift[1], l2 + shift[2]];
        let swing = arm_rotation(two_theta);

        let mut positions = self.geometry.nominal_pixel_positions();
        let mut scattering_angles = Vec::with_capacity(positions.len());
        for position in &mut positions {
            let rotated = rotate(&calibration_rotation, *position);
            let placed = [rotated[0] + arm[0], rotated[1] + arm[1], rotated[2] + arm[2]];
            *position = rotate(&swing, placed);
            scattering_angles.push(scattering_angle(*position));
        }

        Ok(PixelGeometry {
            rows: self.geometry.rows,
            columns: self.geometry.columns,
            two_theta,
            l2,
            wavelength: calibration.wavelength_override,
            positions,
            scattering_angles,
        })
    }

    pub fn build_for_motor_log(
        &self,
        motor_log: &MotorLog,
        calibration: &CalibrationCorrection,
    ) -> HidraResult<PixelGeometry> {
        self.build(motor_log.two_theta, motor_log.l2, calibration)
    }
}

/// Pixel layout for one arm position; immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelGeometry {
    rows: usize,
    columns: usize,
    two_theta: f64,
    l2: f64,
    wavelength: Option<f64>,
    positions: Vec<Vector3>,
    scattering_angles: Vec<f64>,
}

impl PixelGeometry {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn pixel_count(&self) -> usize {
        self.positions.len()
    }

    pub fn two_theta(&self) -> f64 {
        self.two_theta
    }

    pub fn l2(&self) -> f64 {
        self.l2
    }

    /// Calibrated wavelength in angstroms, when the calibration carried one.
    pub fn wavelength(&self) -> Option<f64> {
        self.wavelength
    }

    pub fn get_pixel_positions(&self) -> &[Vector3] {
        &self.positions
    }

    /// Scattering angle of each pixel in degrees, row-major.
    pub fn scattering_angles(&self) -> &[f64] {
        &self.scattering_angles
    }

    pub fn get_pixel_scattering_angles(&self, dimension: AngleDimension) -> ScatteringAngles {
        match dimension {
            AngleDimension::Flat => ScatteringAngles::Flat(self.scattering_angles.clone()),
            AngleDimension::RowColumn => ScatteringAngles::RowColumn(
                self.scattering_angles
                    .chunks(self.columns)
                    .map(<[f64]>::to_vec)
                    .collect(),
            ),
        }
    }

    pub fn scattering_angle_range(&self) -> Option<(f64, f64)> {
        self.scattering_angles
            .iter()
            .filter(|angle| angle.is_finite())
            .fold(None, |range, &angle| match range {
                None => Some((angle, angle)),
                Some((low, high)) => Some((f64::min(low, angle), f64::max(high, angle))),
            })
    }
}

/// Swing of the detector arm; positive two-theta moves the detector toward `-x`.
fn arm_rotation(two_theta: f64) -> Matrix3 {
    rotation_y(-two_theta.to_radians())
}

/// Angle in degrees between the incident beam (`+z`) and the sample-to-pixel vector.
fn scattering_angle(position: Vector3) -> f64 {
    let distance = norm3(position);
    if distance == 0.0 {
        return f64::NAN;
    }
    (position[2] / distance).clamp(-1.0, 1.0).acos().to_degrees()
}
