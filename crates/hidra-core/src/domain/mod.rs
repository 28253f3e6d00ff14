pub mod errors;

pub use errors::{HidraError, HidraErrorCategory, HidraResult};

use serde::{Deserialize, Serialize};

/// Acquisition step identifier, strictly increasing within one batch.
pub type SubRunId = u32;

/// Motor readings recorded for one sub-run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotorLog {
    /// Detector arm angle in degrees.
    pub two_theta: f64,
    /// Sample-to-detector distance in meters; `None` uses the nominal distance.
    #[serde(default)]
    pub l2: Option<f64>,
}

impl MotorLog {
    pub fn new(two_theta: f64, l2: Option<f64>) -> Self {
        Self { two_theta, l2 }
    }
}

pub fn validate_sub_run_sequence(
    placeholder: &'static str,
    sub_runs: &[SubRunId],
) -> HidraResult<()> {
    for (index, window) in sub_runs.windows(2).enumerate() {
        if window[1] <= window[0] {
            return Err(HidraError::invalid_range(
                placeholder,
                format!(
                    "sub-runs must be unique and strictly increasing, index {} has {} after {}",
                    index + 1,
                    window[1],
                    window[0]
                ),
            ));
        }
    }
    Ok(())
}
