// ========================================================================================
//                             Shared Data Contracts
// ========================================================================================

// Only types used by more than one module belong here.

use std::fmt;
use thiserror::Error;

/// The failure taxonomy for every fallible operation in the crate.
///
/// A matrix that loses positive definiteness during factorization is not an error
/// at factorization time. It is recorded on the factor and only surfaces as
/// `NonPositiveDefiniteMatrix` when something tries to solve against it, so that
/// iterative callers can test definiteness and react cheaply.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GramError {
    #[error("matrix is not positive definite; add ridge regularization and refactorize")]
    NonPositiveDefiniteMatrix,
    #[error("invalid dimensions: {0}")]
    InvalidDimension(String),
    #[error("parallel task failed during {stage}: {message}")]
    TaskFailed {
        stage: &'static str,
        message: String,
    },
    #[error("task graph stalled after {completed} of {total} tasks; dependency bookkeeping is inconsistent")]
    IncompleteSchedule { completed: usize, total: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Dimensions of a Gram matrix.
///
/// `n` counts every expanded column except the intercept. The leading
/// `diag_count` columns form the diagonal-only block, the trailing `dense_count`
/// columns (before the intercept) are the numeric predictors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GramShape {
    pub n: usize,
    pub diag_count: usize,
    pub dense_count: usize,
    pub has_intercept: bool,
}

impl GramShape {
    pub fn new(n: usize, diag_count: usize, dense_count: usize, has_intercept: bool) -> Self {
        Self {
            n,
            diag_count,
            dense_count,
            has_intercept,
        }
    }

    /// A shape with no diagonal block: every column is dense.
    pub fn dense(n: usize, has_intercept: bool) -> Self {
        Self::new(n, 0, n, has_intercept)
    }

    #[inline]
    pub fn full_n(&self) -> usize {
        self.n + usize::from(self.has_intercept)
    }

    /// Number of rows stored in the ragged dense region.
    #[inline]
    pub fn dense_rows(&self) -> usize {
        self.full_n() - self.diag_count
    }

    pub fn validate(&self) -> Result<(), GramError> {
        if self.diag_count > self.n {
            return Err(GramError::InvalidDimension(format!(
                "diagonal block of {} columns does not fit in {} columns",
                self.diag_count, self.n
            )));
        }
        if self.diag_count + self.dense_count > self.n {
            return Err(GramError::InvalidDimension(format!(
                "{} diagonal plus {} dense columns exceed {} columns",
                self.diag_count, self.dense_count, self.n
            )));
        }
        Ok(())
    }
}

impl fmt::Display for GramShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Gram({} = {} diag + {} dense rows{})",
            self.full_n(),
            self.diag_count,
            self.dense_rows(),
            if self.has_intercept { ", intercept" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_n_counts_the_intercept() {
        let shape = GramShape::new(5, 2, 3, true);
        assert_eq!(shape.full_n(), 6);
        assert_eq!(shape.dense_rows(), 4);
        assert!(shape.validate().is_ok());
    }

    #[test]
    fn oversized_blocks_are_rejected() {
        assert!(matches!(
            GramShape::new(3, 4, 0, false).validate(),
            Err(GramError::InvalidDimension(_))
        ));
        assert!(matches!(
            GramShape::new(3, 2, 2, false).validate(),
            Err(GramError::InvalidDimension(_))
        ));
    }
}
