//! Shared physical and numerical constants.

/// FWHM of a Gaussian in units of its standard deviation, `2 * sqrt(2 * ln 2)`.
pub const GAUSSIAN_SIGMA_TO_FWHM: f64 = 2.354_820_045_030_949_3;

/// `sqrt(2 * pi)`, the Gaussian area factor.
pub const SQRT_TWO_PI: f64 = 2.506_628_274_631_000_7;

/// `sqrt(ln 2 / pi)`.
pub const SQRT_LN2_OVER_PI: f64 = 0.469_718_639_349_826_2;

#[cfg(test)]
mod tests {
    use super::{GAUSSIAN_SIGMA_TO_FWHM, SQRT_LN2_OVER_PI, SQRT_TWO_PI};
    use std::f64::consts::{LN_2, PI};

    #[test]
    fn constants_match_closed_forms() {
        assert!((GAUSSIAN_SIGMA_TO_FWHM - 2.0 * (2.0 * LN_2).sqrt()).abs() < 1.0e-15);
        assert!((SQRT_TWO_PI - (2.0 * PI).sqrt()).abs() < 1.0e-15);
        assert!((SQRT_LN2_OVER_PI - (LN_2 / PI).sqrt()).abs() < 1.0e-15);
    }
}
