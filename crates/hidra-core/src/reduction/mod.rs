//! Histogramming of per-pixel counts into a one-dimensional powder pattern.

mod pattern;

pub use pattern::{BinAngle, BinEdges, Pattern};

use crate::domain::{HidraError, HidraResult};
use pattern::{bin_angles_for, bin_index_in, validate_bin_edges};

/// Per-pixel exclusion flags; `true` removes the pixel from every bin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelMask {
    excluded: Vec<bool>,
}

impl PixelMask {
    pub fn from_excluded(excluded: Vec<bool>) -> Self {
        Self { excluded }
    }

    /// Region-of-interest style flags where non-zero keeps the pixel.
    pub fn from_keep_flags(keep: &[u8]) -> Self {
        Self {
            excluded: keep.iter().map(|flag| *flag == 0).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.excluded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
    }

    pub fn is_excluded(&self, pixel: usize) -> bool {
        self.excluded.get(pixel).copied().unwrap_or(false)
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded.iter().filter(|flag| **flag).count()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.excluded
    }
}

/// Raw per-bin accumulators behind a reduced pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct BinStatistics {
    pub counts: Vec<f64>,
    pub vanadium: Option<Vec<f64>>,
    pub pixels: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub pattern: Pattern,
    pub statistics: BinStatistics,
}

/// Bins masked, optionally flat-field normalized counts by scattering angle.
///
/// Empty-vanadium bins report zero intensity and zero uncertainty; a zero
/// uncertainty marks a bin that carries no information for fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowderPatternReducer {
    angle_convention: BinAngle,
}

impl PowderPatternReducer {
    pub fn new(angle_convention: BinAngle) -> Self {
        Self { angle_convention }
    }

    pub fn angle_convention(&self) -> BinAngle {
        self.angle_convention
    }

    pub fn reduce(
        &self,
        pixel_angles: &[f64],
        raw_counts: &[f64],
        bin_edges: &[f64],
        mask: Option<&PixelMask>,
        vanadium_counts: Option<&[f64]>,
    ) -> HidraResult<Pattern> {
        self.reduce_detailed(pixel_angles, raw_counts, bin_edges, mask, vanadium_counts)
            .map(|reduction| reduction.pattern)
    }

    pub fn reduce_detailed(
        &self,
        pixel_angles: &[f64],
        raw_counts: &[f64],
        bin_edges: &[f64],
        mask: Option<&PixelMask>,
        vanadium_counts: Option<&[f64]>,
    ) -> HidraResult<Reduction> {
        check_pixel_length("raw counts", pixel_angles.len(), raw_counts.len())?;
        if let Some(mask) = mask {
            check_pixel_length("mask", pixel_angles.len(), mask.len())?;
        }
        if let Some(vanadium) = vanadium_counts {
            check_pixel_length("vanadium counts", pixel_angles.len(), vanadium.len())?;
        }
        validate_bin_edges(bin_edges)?;
        check_finite("raw counts", raw_counts, mask)?;
        if let Some(vanadium) = vanadium_counts {
            check_finite("vanadium counts", vanadium, mask)?;
        }

        let bin_count = bin_edges.len() - 1;
        let mut counts = vec![0.0; bin_count];
        let mut pixels = vec![0_usize; bin_count];
        let mut vanadium = vanadium_counts.map(|_| vec![0.0; bin_count]);

        for (pixel, (&angle, &count)) in pixel_angles.iter().zip(raw_counts).enumerate() {
            if mask.is_some_and(|mask| mask.is_excluded(pixel)) {
                continue;
            }
            let Some(bin) = bin_index_in(bin_edges, angle) else {
                continue;
            };

            counts[bin] += count;
            pixels[bin] += 1;
            if let (Some(accumulated), Some(source)) = (vanadium.as_mut(), vanadium_counts) {
                accumulated[bin] += source[pixel];
            }
        }

        let mut intensities = Vec::with_capacity(bin_count);
        let mut uncertainties = Vec::with_capacity(bin_count);
        for bin in 0..bin_count {
            let scale = match &vanadium {
                Some(vanadium) if vanadium[bin] > 0.0 => Some(vanadium[bin]),
                Some(_) => None,
                None => Some(1.0),
            };

            match scale {
                Some(scale) if pixels[bin] > 0 => {
                    intensities.push(counts[bin] / scale);
                    uncertainties.push(counts[bin].abs().max(1.0).sqrt() / scale);
                }
                _ => {
                    intensities.push(0.0);
                    uncertainties.push(0.0);
                }
            }
        }

        let pattern = Pattern::new(
            bin_angles_for(bin_edges, self.angle_convention),
            intensities,
            Some(uncertainties),
            self.angle_convention,
        )?;

        Ok(Reduction {
            pattern,
            statistics: BinStatistics {
                counts,
                vanadium,
                pixels,
            },
        })
    }
}

fn check_pixel_length(name: &str, expected: usize, actual: usize) -> HidraResult<()> {
    if expected != actual {
        return Err(HidraError::dimension_mismatch(
            "REDUCE.PIXEL_COUNT",
            format!("{name} length {actual} does not match {expected} pixel angles"),
        ));
    }
    Ok(())
}

/// Masked pixels may hold any value; every other pixel must be finite.
fn check_finite(name: &str, values: &[f64], mask: Option<&PixelMask>) -> HidraResult<()> {
    let offending = values.iter().enumerate().find(|(pixel, value)| {
        !value.is_finite() && !mask.is_some_and(|mask| mask.is_excluded(*pixel))
    });
    match offending {
        Some((pixel, value)) => Err(HidraError::invalid_range(
            "REDUCE.NON_FINITE",
            format!("{name} of pixel {pixel} is {value}"),
        )),
        None => Ok(()),
    }
}
