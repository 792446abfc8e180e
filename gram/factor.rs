// ========================================================================================
//
//                 Three-stage Cholesky of a diagonal+dense Gram matrix
//
// ========================================================================================
//
// For A = [[D, B'], [B, M]] with D diagonal:
//   1. L_D = sqrt(D) and the coupling rows L_B = B * L_D^-1,
//   2. the Schur complement S = M - L_B * L_B', using the non-zero pattern of
//      each coupling row so one-hot blocks cost only their overlap,
//   3. the blocked in-place factorization of S, copied back after the coupling
//      columns.
// Loss of positive definiteness is recorded on the factor and reported by the
// first solve against it.

use crate::blocked::InPlaceCholesky;
use crate::config::{BacksolveStrategy, FactorConfig, SolveConfig};
use crate::layout::TriangularRows;
use crate::matrix::SymmetricBlockMatrix;
use crate::solve::solve_in_place;
use crate::types::GramError;
use ndarray::Array2;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::time::Instant;

const MAX_RIDGE_ATTEMPTS: usize = 10;
const FIRST_RIDGE: f64 = 1e-5;

/// Lower-triangular `L` with `A = L * L'`, stored like the Gram matrix it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CholeskyFactor {
    diag: Vec<f64>,
    dense: TriangularRows,
    is_spd: bool,
    /// Rows and columns are ordered with the intercept first; solves rotate
    /// their right-hand side to match.
    intercept_first: bool,
    /// Solve settings of the configuration the factor was built with.
    solve: SolveConfig,
}

impl CholeskyFactor {
    pub(crate) fn from_parts(
        diag: Vec<f64>,
        dense: TriangularRows,
        is_spd: bool,
        intercept_first: bool,
        solve: SolveConfig,
    ) -> Self {
        Self {
            diag,
            dense,
            is_spd,
            intercept_first,
            solve,
        }
    }

    #[inline]
    pub fn is_spd(&self) -> bool {
        self.is_spd
    }

    #[inline]
    pub fn full_n(&self) -> usize {
        self.diag.len() + self.dense.rows()
    }

    #[inline]
    pub fn diag(&self) -> &[f64] {
        &self.diag
    }

    #[inline]
    pub fn dense(&self) -> &TriangularRows {
        &self.dense
    }

    #[inline]
    pub fn intercept_first(&self) -> bool {
        self.intercept_first
    }

    /// The settings `solve` uses.
    #[inline]
    pub fn solve_config(&self) -> &SolveConfig {
        &self.solve
    }

    /// `L[i][j]` in storage order; zero above the diagonal.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        if j > i {
            return 0.0;
        }
        let d = self.diag.len();
        if i < d {
            return if i == j { self.diag[i] } else { 0.0 };
        }
        self.dense.get(i - d, j)
    }

    /// The materialized factor in storage order.
    pub fn lower(&self) -> Array2<f64> {
        let n = self.full_n();
        Array2::from_shape_fn((n, n), |(i, j)| self.get(i, j))
    }

    /// Overwrites `y` with `x` such that `A * x = y`, using the solve settings
    /// of the `FactorConfig` the factor was built with.
    pub fn solve(&self, y: &mut [f64]) -> Result<(), GramError> {
        self.solve_with(y, &self.solve)
    }

    pub fn solve_with(&self, y: &mut [f64], config: &SolveConfig) -> Result<(), GramError> {
        if !self.is_spd {
            return Err(GramError::NonPositiveDefiniteMatrix);
        }
        if y.len() != self.full_n() {
            return Err(GramError::InvalidDimension(format!(
                "right-hand side has length {}, factor has {} rows",
                y.len(),
                self.full_n()
            )));
        }
        if self.intercept_first && !y.is_empty() {
            y.rotate_right(1);
            let solved = solve_in_place(&self.diag, &self.dense, y, config);
            y.rotate_left(1);
            solved
        } else {
            solve_in_place(&self.diag, &self.dense, y, config)
        }
    }

    /// Solves every right-hand side in parallel.
    pub fn solve_many(&self, rhs: &mut [Vec<f64>], config: &SolveConfig) -> Result<(), GramError> {
        rhs.par_iter_mut().try_for_each(|y| self.solve_with(y, config))
    }

    fn unit_solve(&self, j: usize) -> Result<Vec<f64>, GramError> {
        let mut e = vec![0.0; self.full_n()];
        e[j] = 1.0;
        let config = SolveConfig {
            strategy: BacksolveStrategy::Sequential,
            ..self.solve
        };
        self.solve_with(&mut e, &config)?;
        Ok(e)
    }

    /// `A^-1`, one parallel solve per column.
    pub fn inverse(&self) -> Result<Array2<f64>, GramError> {
        let n = self.full_n();
        let columns: Vec<Vec<f64>> = (0..n)
            .into_par_iter()
            .map(|j| self.unit_solve(j))
            .collect::<Result<_, _>>()?;
        Ok(Array2::from_shape_fn((n, n), |(i, j)| columns[j][i]))
    }

    /// The diagonal of `A^-1` without materializing the whole inverse.
    pub fn inverse_diagonal(&self) -> Result<Vec<f64>, GramError> {
        (0..self.full_n())
            .into_par_iter()
            .map(|j| self.unit_solve(j).map(|e| e[j]))
            .collect()
    }
}

/// Merge-join dot product over two ascending non-zero index lists.
fn sparse_dot(a_idx: &[usize], a: &[f64], b_idx: &[usize], b: &[f64]) -> f64 {
    let (mut p, mut q) = (0, 0);
    let mut s = 0.0;
    while p < a_idx.len() && q < b_idx.len() {
        match a_idx[p].cmp(&b_idx[q]) {
            Ordering::Less => p += 1,
            Ordering::Greater => q += 1,
            Ordering::Equal => {
                s += a[a_idx[p]] * b[b_idx[q]];
                p += 1;
                q += 1;
            }
        }
    }
    s
}

/// Factorizes `gram`. A non-positive pivot does not fail here; it clears
/// `is_spd` on the returned factor.
pub fn cholesky(gram: &SymmetricBlockMatrix, config: &FactorConfig) -> Result<CholeskyFactor, GramError> {
    config.validate()?;
    let d = gram.diag_count();
    let rows = gram.dense().rows();
    let start = Instant::now();

    let diag: Vec<f64> = gram.diag().iter().map(|v| v.sqrt()).collect();
    let diag_ok = gram.diag().iter().all(|&v| v > 0.0);
    let inv: Vec<f64> = diag.iter().map(|v| 1.0 / v).collect();
    let mut dense = gram.dense().clone();
    dense.rows_mut().into_par_iter().for_each(|row| {
        for (v, s) in row[..d].iter_mut().zip(&inv) {
            *v *= s;
        }
    });
    let diagonal_done = start.elapsed();

    let nonzero: Vec<Vec<usize>> = (0..rows)
        .into_par_iter()
        .map(|i| {
            let row = dense.row(i);
            (0..d).filter(|&k| row[k] != 0.0).collect()
        })
        .collect();
    let mut schur = TriangularRows::new(0, rows);
    schur
        .rows_mut()
        .into_par_iter()
        .enumerate()
        .for_each(|(i, out)| {
            let row_i = dense.row(i);
            for (j, v) in out.iter_mut().enumerate() {
                let s = sparse_dot(&nonzero[i], row_i, &nonzero[j], dense.row(j));
                *v = row_i[j + d] - s;
            }
        });
    let schur_done = start.elapsed();

    let chol = InPlaceCholesky::decompose(schur, &config.block_params())?;
    let lower = chol.lower();
    dense
        .rows_mut()
        .into_par_iter()
        .enumerate()
        .for_each(|(i, row)| row[d..].copy_from_slice(lower.row(i)));
    let is_spd = diag_ok && chol.is_spd();

    log::debug!(
        "Cholesky of {}: diagonal {:.2?}, schur {:.2?}, total {:.2?}",
        gram.shape(),
        diagonal_done,
        schur_done - diagonal_done,
        start.elapsed()
    );
    if !is_spd {
        log::warn!("Gram matrix {} is not positive definite", gram.shape());
    }
    Ok(CholeskyFactor::from_parts(
        diag,
        dense,
        is_spd,
        false,
        config.solve,
    ))
}

/// A factor obtained after adding ridge to the diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizedCholesky {
    pub factor: CholeskyFactor,
    /// Total ridge added to every non-intercept diagonal entry.
    pub ridge: f64,
    pub attempts: usize,
}

/// Factorizes `gram`, adding an escalating ridge (1e-5, then ten times more each
/// time) until the factor is positive definite. The ridge stays in `gram`.
pub fn regularized_cholesky(
    gram: &mut SymmetricBlockMatrix,
    config: &FactorConfig,
) -> Result<RegularizedCholesky, GramError> {
    let mut factor = cholesky(gram, config)?;
    let mut ridge = 0.0;
    let mut step = FIRST_RIDGE;
    let mut attempts = 0;
    while !factor.is_spd() && attempts < MAX_RIDGE_ATTEMPTS {
        gram.add_ridge(step, false);
        ridge += step;
        attempts += 1;
        log::warn!("Added ridge {step:e} to the diagonal of {} (attempt {attempts})", gram.shape());
        factor = cholesky(gram, config)?;
        step *= 10.0;
    }
    if !factor.is_spd() {
        return Err(GramError::NonPositiveDefiniteMatrix);
    }
    Ok(RegularizedCholesky {
        factor,
        ridge,
        attempts,
    })
}
