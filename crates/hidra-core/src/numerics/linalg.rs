use faer::Mat;

const RELATIVE_PIVOT_EPSILON: f64 = 1.0e-14;

pub type DenseMatrix = Mat<f64>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinearSolveError {
    #[error("normal matrix must be square, got {rows}x{cols}")]
    NonSquareMatrix { rows: usize, cols: usize },
    #[error("normal matrix must be non-empty")]
    EmptyMatrix,
    #[error("normal matrix entry must be finite at ({row}, {col}), got {value}")]
    NonFiniteEntry { row: usize, col: usize, value: f64 },
    #[error("normal matrix is not positive definite at pivot index {pivot_index}")]
    NotPositiveDefinite { pivot_index: usize },
    #[error("right-hand side length mismatch: expected {expected}, got {actual}")]
    RhsLengthMismatch { expected: usize, actual: usize },
}

/// Lower-triangular Cholesky factor `L` with `A = L * L^T`.
#[derive(Debug, Clone, PartialEq)]
pub struct CholeskyFactor {
    lower: DenseMatrix,
}

impl CholeskyFactor {
    pub fn dimension(&self) -> usize {
        self.lower.nrows()
    }

    pub fn lower(&self) -> &DenseMatrix {
        &self.lower
    }

    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, LinearSolveError> {
        let dimension = self.dimension();
        if rhs.len() != dimension {
            return Err(LinearSolveError::RhsLengthMismatch {
                expected: dimension,
                actual: rhs.len(),
            });
        }

        let mut forward = vec![0.0; dimension];
        for row in 0..dimension {
            let mut value = rhs[row];
            for col in 0..row {
                value -= self.lower[(row, col)] * forward[col];
            }
            forward[row] = value / self.lower[(row, row)];
        }

        let mut solution = vec![0.0; dimension];
        for row in (0..dimension).rev() {
            let mut value = forward[row];
            for col in (row + 1)..dimension {
                value -= self.lower[(col, row)] * solution[col];
            }
            solution[row] = value / self.lower[(row, row)];
        }

        Ok(solution)
    }

    pub fn invert(&self) -> Result<DenseMatrix, LinearSolveError> {
        let dimension = self.dimension();
        let mut inverse = DenseMatrix::zeros(dimension, dimension);
        let mut basis = vec![0.0; dimension];

        for col in 0..dimension {
            basis.fill(0.0);
            basis[col] = 1.0;
            let solution = self.solve(&basis)?;
            for row in 0..dimension {
                inverse[(row, col)] = solution[row];
            }
        }

        Ok(inverse)
    }
}

/// Factorizes a symmetric positive definite matrix; only the lower triangle is read.
///
/// Pivots below `RELATIVE_PIVOT_EPSILON` times the largest diagonal entry are
/// reported as rank deficiency.
pub fn cholesky_factorize(matrix: &DenseMatrix) -> Result<CholeskyFactor, LinearSolveError> {
    let dimension = validate_square_shape(matrix)?;
    let scale = (0..dimension)
        .map(|index| matrix[(index, index)].abs())
        .fold(0.0_f64, f64::max);
    let pivot_floor = RELATIVE_PIVOT_EPSILON * scale.max(f64::MIN_POSITIVE);

    let mut lower = DenseMatrix::zeros(dimension, dimension);
    for col in 0..dimension {
        let mut diagonal = matrix[(col, col)];
        for k in 0..col {
            diagonal -= lower[(col, k)] * lower[(col, k)];
        }
        if !diagonal.is_finite() || diagonal <= pivot_floor {
            return Err(LinearSolveError::NotPositiveDefinite { pivot_index: col });
        }
        let pivot = diagonal.sqrt();
        lower[(col, col)] = pivot;

        for row in (col + 1)..dimension {
            let mut value = matrix[(row, col)];
            for k in 0..col {
                value -= lower[(row, k)] * lower[(col, k)];
            }
            lower[(row, col)] = value / pivot;
        }
    }

    Ok(CholeskyFactor { lower })
}

pub fn solve_symmetric(matrix: &DenseMatrix, rhs: &[f64]) -> Result<Vec<f64>, LinearSolveError> {
    cholesky_factorize(matrix)?.solve(rhs)
}

pub fn invert_symmetric(matrix: &DenseMatrix) -> Result<DenseMatrix, LinearSolveError> {
    cholesky_factorize(matrix)?.invert()
}

fn validate_square_shape(matrix: &DenseMatrix) -> Result<usize, LinearSolveError> {
    let rows = matrix.nrows();
    let cols = matrix.ncols();
    if rows != cols {
        return Err(LinearSolveError::NonSquareMatrix { rows, cols });
    }
    if rows == 0 {
        return Err(LinearSolveError::EmptyMatrix);
    }

    for row in 0..rows {
        for col in 0..=row {
            let value = matrix[(row, col)];
            if !value.is_finite() {
                return Err(LinearSolveError::NonFiniteEntry { row, col, value });
            }
        }
    }

    Ok(rows)
}
