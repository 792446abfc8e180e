// ========================================================================================
//
//             Cholesky by Gram-Schmidt on the Gram matrix, dropping collinear columns
//
// ========================================================================================
//
// Columns are orthogonalized one at a time, directly on `X'X`, with the intercept
// moved to the front. Column `j` keeps only its squared residual against the
// columns before it. When that residual is a negligible share of the column's
// total sum of squares (1 - R^2 below `R2_EPS`), the column is collinear: it is
// zeroed out of every later step and removed from the returned factor.
//
// The result is the Cholesky factor of the Gram matrix restricted to the kept
// columns. It is positive definite by construction.

use crate::config::FactorConfig;
use crate::factor::CholeskyFactor;
use crate::layout::TriangularRows;
use crate::matrix::SymmetricBlockMatrix;
use crate::types::GramError;
use rayon::prelude::*;
use std::time::Instant;

const R2_EPS: f64 = 1e-7;
/// Row-times-column products worth one parallel chunk of a column update.
const MIN_PARALLEL_WORK: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct CollinearCholesky {
    /// Factor of the Gram matrix without the dropped columns, solving in the
    /// original column order.
    pub factor: CholeskyFactor,
    /// Dropped columns, ascending, in the Gram matrix's own numbering.
    pub dropped: Vec<usize>,
}

/// Factorizes `gram`, removing columns that are linear combinations of earlier
/// ones. With `standardized` the columns are assumed centered, so the total sum
/// of squares is the diagonal entry itself.
pub fn qr_cholesky(
    gram: &SymmetricBlockMatrix,
    standardized: bool,
    config: &FactorConfig,
) -> Result<CollinearCholesky, GramError> {
    config.validate()?;
    let start = Instant::now();
    let icpt = gram.has_intercept();
    let mut z = gram.to_lower_rows(true);
    let n = z.rows();
    let zdiag: Vec<f64> = (0..n).map(|i| z.get(i, i)).collect();
    let mut inv: Vec<f64> = zdiag.iter().map(|v| 1.0 / v).collect();
    let mut r = TriangularRows::new(0, n);
    let mut keep = vec![true; n];

    for j in 0..n {
        let zj = z.row(j);
        let gamma = r.row_mut(j);
        for (l, g) in gamma.iter_mut().enumerate() {
            *g = zj[l] * inv[l];
        }
        let mut zjj = zj[j];
        for k in 0..j {
            zjj += gamma[k] * (gamma[k] * z.get(k, k) - 2.0 * zj[k]);
        }
        let rs_tot = if standardized || !icpt {
            inv[j]
        } else {
            1.0 / (zdiag[j] - zj[0] * inv[0] * zj[0])
        };
        // NaN ratios come from all-zero or constant columns and drop as well.
        let protected = icpt && j == 0;
        if protected || zjj * rs_tot >= R2_EPS {
            inv[j] = 1.0 / zjj;
        } else {
            keep[j] = false;
            zjj = 0.0;
            inv[j] = 0.0;
        }
        z.row_mut(j)[j] = zjj;

        if j + 1 < n {
            let gamma = &r.row(j)[..j];
            let min_len = (MIN_PARALLEL_WORK / (n - j)).max(1);
            let (_, tail) = z.split_at_row_mut(j + 1);
            tail.into_rows()
                .into_par_iter()
                .with_min_len(min_len)
                .for_each(|row| {
                    let mut zij = row[j];
                    for (g, zik) in gamma.iter().zip(&row[..j]) {
                        zij -= g * zik;
                    }
                    row[j] = zij;
                });
        }
    }

    let scale: Vec<f64> = (0..n).map(|j| z.get(j, j).sqrt()).collect();
    r.rows_mut().into_par_iter().for_each(|row| {
        for (v, s) in row.iter_mut().zip(&scale) {
            *v *= s;
        }
    });

    let kept: Vec<usize> = (0..n).filter(|&i| keep[i]).collect();
    let mut l = TriangularRows::new(0, kept.len());
    for (ni, &oi) in kept.iter().enumerate() {
        let src = r.row(oi);
        for (out, &oj) in l.row_mut(ni).iter_mut().zip(&kept[..=ni]) {
            *out = src[oj];
        }
    }
    let dropped: Vec<usize> = (0..n)
        .filter(|&j| !keep[j])
        .map(|j| if icpt { j - 1 } else { j })
        .collect();

    log::debug!(
        "Collinear-aware Cholesky of {}: dropped {:?} in {:.2?}",
        gram.shape(),
        dropped,
        start.elapsed()
    );
    Ok(CollinearCholesky {
        factor: CholeskyFactor::from_parts(Vec::new(), l, true, icpt, config.solve),
        dropped,
    })
}
