//! Detector geometry description and the rigid-body calibration applied to it.
//!
//! Frame convention: the incident beam travels along `+z`, `+y` points up and
//! the sample sits at the origin. Before the arm rotation the detector face is
//! perpendicular to the beam, centred on the `z` axis.

pub mod engine;

pub use engine::{AngleDimension, InstrumentGeometryEngine, PixelGeometry, ScatteringAngles};

use crate::domain::{HidraError, HidraResult};
use serde::{Deserialize, Serialize};

pub type Vector3 = [f64; 3];
pub type Matrix3 = [[f64; 3]; 3];

/// Flat (or horizontally curved) rectangular pixel array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryModel {
    pub rows: usize,
    pub columns: usize,
    /// Horizontal pixel pitch in meters.
    pub pixel_size_x: f64,
    /// Vertical pixel pitch in meters.
    pub pixel_size_y: f64,
    /// Nominal sample-to-detector distance in meters.
    pub nominal_distance: f64,
    /// Columns lie on an arc of radius `nominal_distance` instead of a plane.
    #[serde(default)]
    pub is_curved: bool,
}

impl GeometryModel {
    pub fn new(
        rows: usize,
        columns: usize,
        pixel_size_x: f64,
        pixel_size_y: f64,
        nominal_distance: f64,
        is_curved: bool,
    ) -> Self {
        Self {
            rows,
            columns,
            pixel_size_x,
            pixel_size_y,
            nominal_distance,
            is_curved,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.rows * self.columns
    }

    pub fn validate(&self) -> HidraResult<()> {
        if self.rows == 0 || self.columns == 0 {
            return Err(HidraError::configuration(
                "GEOMETRY.DETECTOR_SIZE",
                format!(
                    "detector must have at least one row and column, got {}x{}",
                    self.rows, self.columns
                ),
            ));
        }

        for (name, value) in [
            ("pixel_size_x", self.pixel_size_x),
            ("pixel_size_y", self.pixel_size_y),
            ("nominal_distance", self.nominal_distance),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(HidraError::configuration(
                    "GEOMETRY.DIMENSION",
                    format!("{name} must be finite and > 0, got {value}"),
                ));
            }
        }

        Ok(())
    }

    /// Pixel positions relative to the detector center, row-major, before any
    /// calibration or arm motion.
    pub fn nominal_pixel_positions(&self) -> Vec<Vector3> {
        let start_y = -(self.rows as f64 * 0.5 - 0.5) * self.pixel_size_y;
        let start_x = (self.columns as f64 * 0.5 - 0.5) * self.pixel_size_x;
        let radius = self.nominal_distance;

        let mut positions = Vec::with_capacity(self.pixel_count());
        for row in 0..self.rows {
            let y = start_y + row as f64 * self.pixel_size_y;
            for column in 0..self.columns {
                let x = start_x - column as f64 * self.pixel_size_x;
                if self.is_curved {
                    let phi = x / radius;
                    positions.push([radius * phi.sin(), y, radius * phi.cos() - radius]);
                } else {
                    positions.push([x, y, 0.0]);
                }
            }
        }
        positions
    }
}

/// Six-parameter rigid-body correction; shifts in meters, rotations in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationCorrection {
    #[serde(rename = "Shift_x", alias = "shift_x", alias = "shiftX", default)]
    pub shift_x: f64,
    #[serde(rename = "Shift_y", alias = "shift_y", alias = "shiftY", default)]
    pub shift_y: f64,
    #[serde(rename = "Shift_z", alias = "shift_z", alias = "shiftZ", default)]
    pub shift_z: f64,
    #[serde(rename = "Rot_x", alias = "rotation_x", alias = "rotationX", default)]
    pub rotation_x: f64,
    #[serde(rename = "Rot_y", alias = "rotation_y", alias = "rotationY", default)]
    pub rotation_y: f64,
    #[serde(rename = "Rot_z", alias = "rotation_z", alias = "rotationZ", default)]
    pub rotation_z: f64,
    /// Wavelength in angstroms overriding the instrument setting.
    #[serde(
        rename = "Lambda",
        alias = "wavelength",
        alias = "wavelength_override",
        default
    )]
    pub wavelength_override: Option<f64>,
}

impl CalibrationCorrection {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn is_identity(&self) -> bool {
        self.shift_x == 0.0
            && self.shift_y == 0.0
            && self.shift_z == 0.0
            && self.rotation_x == 0.0
            && self.rotation_y == 0.0
            && self.rotation_z == 0.0
    }

    pub fn validate(&self) -> HidraResult<()> {
        for (name, value) in [
            ("shift_x", self.shift_x),
            ("shift_y", self.shift_y),
            ("shift_z", self.shift_z),
            ("rotation_x", self.rotation_x),
            ("rotation_y", self.rotation_y),
            ("rotation_z", self.rotation_z),
        ] {
            if !value.is_finite() {
                return Err(HidraError::configuration(
                    "GEOMETRY.CALIBRATION",
                    format!("calibration {name} must be finite, got {value}"),
                ));
            }
        }

        if let Some(wavelength) = self.wavelength_override {
            if !wavelength.is_finite() || wavelength <= 0.0 {
                return Err(HidraError::configuration(
                    "GEOMETRY.CALIBRATION",
                    format!("calibration wavelength must be finite and > 0, got {wavelength}"),
                ));
            }
        }

        Ok(())
    }

    /// `Rx * Ry * Rz` for the calibration flip/spin angles.
    pub fn rotation_matrix(&self) -> Matrix3 {
        let rx = rotation_x(self.rotation_x.to_radians());
        let ry = rotation_y(self.rotation_y.to_radians());
        let rz = rotation_z(self.rotation_z.to_radians());
        matmul3(&matmul3(&rx, &ry), &rz)
    }

    pub fn translation(&self) -> Vector3 {
        [self.shift_x, self.shift_y, self.shift_z]
    }
}

pub fn rotation_x(angle: f64) -> Matrix3 {
    let (sin, cos) = angle.sin_cos();
    [[1.0, 0.0, 0.0], [0.0, cos, -sin], [0.0, sin, cos]]
}

pub fn rotation_y(angle: f64) -> Matrix3 {
    let (sin, cos) = angle.sin_cos();
    [[cos, 0.0, sin], [0.0, 1.0, 0.0], [-sin, 0.0, cos]]
}

pub fn rotation_z(angle: f64) -> Matrix3 {
    let (sin, cos) = angle.sin_cos();
    [[cos, -sin, 0.0], [sin, cos, 0.0], [0.0, 0.0, 1.0]]
}

pub fn matmul3(lhs: &Matrix3, rhs: &Matrix3) -> Matrix3 {
    let mut product = [[0.0; 3]; 3];
    for (row, product_row) in product.iter_mut().enumerate() {
        for (col, value) in product_row.iter_mut().enumerate() {
            *value = lhs[row][0] * rhs[0][col]
                + lhs[row][1] * rhs[1][col]
                + lhs[row][2] * rhs[2][col];
        }
    }
    product
}

pub fn rotate(matrix: &Matrix3, vector: Vector3) -> Vector3 {
    [
        matrix[0][0] * vector[0] + matrix[0][1] * vector[1] + matrix[0][2] * vector[2],
        matrix[1][0] * vector[0] + matrix[1][1] * vector[1] + matrix[1][2] * vector[2],
        matrix[2][0] * vector[0] + matrix[2][1] * vector[1] + matrix[2][2] * vector[2],
    ]
}

pub fn norm3(vector: Vector3) -> f64 {
    (vector[0] * vector[0] + vector[1] * vector[1] + vector[2] * vector[2]).sqrt()
}
