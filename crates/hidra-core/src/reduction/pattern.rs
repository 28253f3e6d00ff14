use crate::domain::{HidraError, HidraResult};
use crate::numerics::stable_weighted_mean;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Which angle labels each histogram bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinAngle {
    LeftEdge,
    #[default]
    Center,
}

impl BinAngle {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LeftEdge => "leftEdge",
            Self::Center => "center",
        }
    }
}

/// Validated, strictly increasing histogram boundaries in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct BinEdges {
    edges: Vec<f64>,
}

impl BinEdges {
    pub fn new(edges: Vec<f64>) -> HidraResult<Self> {
        validate_bin_edges(&edges)?;
        Ok(Self { edges })
    }

    /// `count` equal-width bins spanning `[min, max)`.
    pub fn uniform(min: f64, max: f64, count: usize) -> HidraResult<Self> {
        if count == 0 {
            return Err(HidraError::invalid_range(
                "REDUCE.BIN_COUNT",
                "at least one bin is required",
            ));
        }
        if !min.is_finite() || !max.is_finite() || max <= min {
            return Err(HidraError::invalid_range(
                "REDUCE.BIN_RANGE",
                format!("bin range must be finite with max > min, got [{min}, {max})"),
            ));
        }

        let step = (max - min) / count as f64;
        let mut edges: Vec<f64> = (0..=count).map(|index| min + step * index as f64).collect();
        if let Some(last) = edges.last_mut() {
            *last = max;
        }
        Self::new(edges)
    }

    /// `count` equal-width bins covering every finite pixel angle; the upper
    /// edge is nudged so the largest angle still lands in the last bin.
    pub fn from_pixel_range(pixel_angles: &[f64], count: usize) -> HidraResult<Self> {
        let (min, max) = pixel_angles
            .iter()
            .filter(|angle| angle.is_finite())
            .fold(None, |range, &angle| match range {
                None => Some((angle, angle)),
                Some((low, high)) => Some((f64::min(low, angle), f64::max(high, angle))),
            })
            .ok_or_else(|| {
                HidraError::invalid_range(
                    "REDUCE.BIN_RANGE",
                    "no finite pixel angle to derive bins from",
                )
            })?;

        let width = (max - min).max(f64::EPSILON * max.abs().max(1.0));
        Self::uniform(min, max + width * 1.0e-9, count)
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn bin_count(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn lower(&self) -> f64 {
        self.edges[0]
    }

    pub fn upper(&self) -> f64 {
        self.edges[self.edges.len() - 1]
    }

    /// Half-open bin lookup: `angle` belongs to bin `k` when
    /// `edges[k] <= angle < edges[k + 1]`.
    pub fn bin_index(&self, angle: f64) -> Option<usize> {
        bin_index_in(&self.edges, angle)
    }

    pub fn bin_angles(&self, convention: BinAngle) -> Vec<f64> {
        bin_angles_for(&self.edges, convention)
    }
}

impl TryFrom<Vec<f64>> for BinEdges {
    type Error = HidraError;

    fn try_from(edges: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(edges)
    }
}

impl From<BinEdges> for Vec<f64> {
    fn from(edges: BinEdges) -> Self {
        edges.edges
    }
}

pub(crate) fn validate_bin_edges(edges: &[f64]) -> HidraResult<()> {
    if edges.len() < 2 {
        return Err(HidraError::invalid_range(
            "REDUCE.BIN_EDGES",
            format!("at least 2 bin edges are required, got {}", edges.len()),
        ));
    }

    for (index, edge) in edges.iter().enumerate() {
        if !edge.is_finite() {
            return Err(HidraError::invalid_range(
                "REDUCE.BIN_EDGES",
                format!("bin edge must be finite at index {index}, got {edge}"),
            ));
        }
    }

    for (index, window) in edges.windows(2).enumerate() {
        if window[1] <= window[0] {
            return Err(HidraError::invalid_range(
                "REDUCE.BIN_EDGES",
                format!(
                    "bin edges must be strictly increasing, index {} has {} after {}",
                    index + 1,
                    window[1],
                    window[0]
                ),
            ));
        }
    }

    Ok(())
}

pub(crate) fn bin_index_in(edges: &[f64], angle: f64) -> Option<usize> {
    let last = edges.len().checked_sub(1)?;
    if !(angle >= edges[0] && angle < edges[last]) {
        return None;
    }
    let upper = edges.partition_point(|edge| *edge <= angle);
    Some(upper - 1)
}

pub(crate) fn bin_angles_for(edges: &[f64], convention: BinAngle) -> Vec<f64> {
    edges
        .windows(2)
        .map(|window| match convention {
            BinAngle::LeftEdge => window[0],
            BinAngle::Center => 0.5 * (window[0] + window[1]),
        })
        .collect()
}

/// One-dimensional diffraction pattern: intensity against scattering angle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "PatternRecord")]
pub struct Pattern {
    angles: Vec<f64>,
    intensities: Vec<f64>,
    #[serde(default)]
    uncertainties: Option<Vec<f64>>,
    #[serde(default)]
    angle_convention: BinAngle,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatternRecord {
    angles: Vec<f64>,
    intensities: Vec<f64>,
    #[serde(default)]
    uncertainties: Option<Vec<f64>>,
    #[serde(default)]
    angle_convention: BinAngle,
}

impl TryFrom<PatternRecord> for Pattern {
    type Error = HidraError;

    fn try_from(record: PatternRecord) -> Result<Self, Self::Error> {
        Self::new(
            record.angles,
            record.intensities,
            record.uncertainties,
            record.angle_convention,
        )
    }
}

impl Pattern {
    pub fn new(
        angles: Vec<f64>,
        intensities: Vec<f64>,
        uncertainties: Option<Vec<f64>>,
        angle_convention: BinAngle,
    ) -> HidraResult<Self> {
        if angles.len() != intensities.len() {
            return Err(HidraError::dimension_mismatch(
                "PATTERN.LENGTH",
                format!(
                    "pattern angles and intensities differ in length: {} vs {}",
                    angles.len(),
                    intensities.len()
                ),
            ));
        }
        if let Some(uncertainties) = &uncertainties {
            if uncertainties.len() != angles.len() {
                return Err(HidraError::dimension_mismatch(
                    "PATTERN.LENGTH",
                    format!(
                        "pattern uncertainties length {} does not match {} angles",
                        uncertainties.len(),
                        angles.len()
                    ),
                ));
            }
        }
        for (index, window) in angles.windows(2).enumerate() {
            if !(window[1] > window[0]) {
                return Err(HidraError::invalid_range(
                    "PATTERN.ANGLES",
                    format!(
                        "pattern angles must be strictly increasing, index {} has {} after {}",
                        index + 1,
                        window[1],
                        window[0]
                    ),
                ));
            }
        }

        Ok(Self {
            angles,
            intensities,
            uncertainties,
            angle_convention,
        })
    }

    pub fn len(&self) -> usize {
        self.angles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }

    pub fn angles(&self) -> &[f64] {
        &self.angles
    }

    pub fn intensities(&self) -> &[f64] {
        &self.intensities
    }

    pub fn uncertainties(&self) -> Option<&[f64]> {
        self.uncertainties.as_deref()
    }

    pub fn angle_convention(&self) -> BinAngle {
        self.angle_convention
    }

    /// Index range of the points with `left <= angle <= right`.
    pub fn window_indices(&self, left: f64, right: f64) -> Range<usize> {
        let start = self.angles.partition_point(|angle| *angle < left);
        let end = self.angles.partition_point(|angle| *angle <= right);
        start..end.max(start)
    }

    /// Intensity-weighted mean angle inside `[left, right]`, ignoring
    /// non-positive intensities.
    pub fn center_of_mass(&self, left: f64, right: f64) -> Option<f64> {
        let range = self.window_indices(left, right);
        let (angles, weights): (Vec<f64>, Vec<f64>) = self.angles[range.clone()]
            .iter()
            .zip(&self.intensities[range])
            .filter(|(_, intensity)| intensity.is_finite() && **intensity > 0.0)
            .map(|(angle, intensity)| (*angle, *intensity))
            .unzip();
        stable_weighted_mean(&angles, &weights)
    }
}

#[cfg(test)]
mod tests {
    use super::{BinAngle, BinEdges, Pattern};
    use crate::domain::HidraErrorCategory;

    #[test]
    fn uniform_edges_are_inclusive_of_bounds() {
        let edges = BinEdges::uniform(10.0, 12.0, 4).expect("edges");
        assert_eq!(edges.edges(), &[10.0, 10.5, 11.0, 11.5, 12.0]);
        assert_eq!(edges.bin_count(), 4);
        assert_eq!(edges.bin_angles(BinAngle::LeftEdge), vec![10.0, 10.5, 11.0, 11.5]);
        assert_eq!(
            edges.bin_angles(BinAngle::Center),
            vec![10.25, 10.75, 11.25, 11.75]
        );
    }

    #[test]
    fn bin_lookup_is_half_open() {
        let edges = BinEdges::new(vec![0.0, 1.0, 2.0]).expect("edges");
        assert_eq!(edges.bin_index(0.0), Some(0));
        assert_eq!(edges.bin_index(0.999), Some(0));
        assert_eq!(edges.bin_index(1.0), Some(1));
        assert_eq!(edges.bin_index(2.0), None);
        assert_eq!(edges.bin_index(-0.1), None);
        assert_eq!(edges.bin_index(f64::NAN), None);
    }

    #[test]
    fn malformed_edges_are_invalid_range() {
        for edges in [vec![1.0], vec![0.0, 1.0, 1.0], vec![0.0, 2.0, 1.0], vec![0.0, f64::NAN]] {
            let error = BinEdges::new(edges).expect_err("edges should be rejected");
            assert_eq!(error.category(), HidraErrorCategory::InvalidRange);
        }
        assert!(BinEdges::uniform(5.0, 5.0, 10).is_err());
        assert!(BinEdges::uniform(0.0, 5.0, 0).is_err());
    }

    #[test]
    fn pixel_range_edges_keep_maximum_angle() {
        let angles = [80.0, 85.0, f64::NAN, 90.0];
        let edges = BinEdges::from_pixel_range(&angles, 10).expect("edges");
        assert_eq!(edges.lower(), 80.0);
        assert_eq!(edges.bin_index(90.0), Some(9));
        assert!(BinEdges::from_pixel_range(&[f64::NAN], 10).is_err());
    }

    #[test]
    fn edges_deserialize_through_validation() {
        let edges: BinEdges = serde_json::from_str("[1.0, 2.0, 3.5]").expect("edges");
        assert_eq!(edges.upper(), 3.5);
        assert!(serde_json::from_str::<BinEdges>("[2.0, 1.0]").is_err());
    }

    #[test]
    fn pattern_rejects_mismatched_or_unsorted_angles() {
        let error = Pattern::new(vec![1.0, 2.0], vec![1.0], None, BinAngle::Center)
            .expect_err("length mismatch");
        assert_eq!(error.category(), HidraErrorCategory::DimensionMismatch);

        let error = Pattern::new(vec![2.0, 1.0], vec![1.0, 1.0], None, BinAngle::Center)
            .expect_err("unsorted");
        assert_eq!(error.category(), HidraErrorCategory::InvalidRange);

        assert!(
            Pattern::new(vec![1.0, 2.0], vec![1.0, 1.0], Some(vec![1.0]), BinAngle::Center)
                .is_err()
        );
    }

    #[test]
    fn window_and_center_of_mass() {
        let pattern = Pattern::new(
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            vec![0.0, 1.0, 2.0, 1.0, -3.0],
            None,
            BinAngle::LeftEdge,
        )
        .expect("pattern");

        assert_eq!(pattern.window_indices(1.5, 4.0), 1..4);
        assert_eq!(pattern.window_indices(6.0, 7.0).len(), 0);
        assert_eq!(pattern.center_of_mass(0.0, 10.0), Some(3.0));
        assert_eq!(pattern.center_of_mass(4.5, 5.5), None);
    }
}
