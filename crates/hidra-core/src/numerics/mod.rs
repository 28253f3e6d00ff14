pub mod linalg;

pub use linalg::{
    CholeskyFactor, DenseMatrix, LinearSolveError, cholesky_factorize, invert_symmetric,
    solve_symmetric,
};

fn kahan_add(sum: &mut f64, correction: &mut f64, value: f64) {
    let corrected = value - *correction;
    let next = *sum + corrected;
    *correction = (next - *sum) - corrected;
    *sum = next;
}

pub fn stable_sum(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut correction = 0.0;

    for &value in values {
        kahan_add(&mut sum, &mut correction, value);
    }

    sum
}

pub fn stable_weighted_mean(values: &[f64], weights: &[f64]) -> Option<f64> {
    if values.len() != weights.len() {
        return None;
    }

    let total_weight = stable_sum(weights);
    if total_weight == 0.0 || !total_weight.is_finite() {
        return None;
    }

    let mut sum = 0.0;
    let mut correction = 0.0;
    for (&value, &weight) in values.iter().zip(weights) {
        kahan_add(&mut sum, &mut correction, value * weight);
    }

    Some(sum / total_weight)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(stable_sum(values) / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::{mean, stable_sum, stable_weighted_mean};

    #[test]
    fn stable_sum_reduces_order_loss_for_large_and_small_values() {
        let input = [1.0e16, 1.0, -1.0e16];
        assert_eq!(stable_sum(&input), 0.0);
    }

    #[test]
    fn stable_weighted_mean_requires_non_zero_total_weight() {
        assert_eq!(stable_weighted_mean(&[1.0, 2.0], &[0.0, 0.0]), None);
        assert_eq!(stable_weighted_mean(&[1.0, 2.0], &[1.0]), None);
        let weighted = stable_weighted_mean(&[10.0, 20.0, 40.0], &[1.0, 2.0, 1.0]).expect("mean");
        assert!((weighted - 22.5).abs() < 1.0e-12);
    }

    #[test]
    fn mean_of_empty_slice_is_none() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 2.0, 6.0]), Some(3.0));
    }
}
