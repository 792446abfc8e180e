// ========================================================================================
//
//                       In-place blocked Cholesky on a packed lower triangle
//
// ========================================================================================
//
// Columns are processed in blocks of `block_size`. Inside a block the rows that
// own the block's diagonal are finished one after another. The rows below the
// block then receive the block's columns in one sweep, which is the only part
// that runs in parallel: disjoint row ranges go to separate rayon tasks and the
// block waits for all of them before the next block starts.
//
// A pivot `a_ii - sum(l_ik^2)` that is not strictly positive is clamped to zero
// and clears the SPD flag. The factorization always runs to completion.

use crate::layout::{RowBlock, RowBlockMut, TriangularRows};
use crate::schedule::FailureSlot;
use crate::types::GramError;
use std::ops::Range;

/// Tuning knobs for the blocked factorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockParams {
    pub block_size: usize,
    pub concurrency: usize,
    /// Smallest rows-times-columns product worth handing to its own task.
    pub min_task_size: usize,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            block_size: 10,
            concurrency: num_cpus::get(),
            min_task_size: 10_000,
        }
    }
}

impl BlockParams {
    /// Number of row chunks for a trailing update of `rows` rows against
    /// `cols` finished columns.
    fn chunks_for(&self, rows: usize, cols: usize) -> usize {
        let mut p = self.concurrency.max(1);
        while p > 1 && cols * (rows / p) < self.min_task_size {
            p -= 1;
        }
        p
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Applies finished columns `cols` to every row of `rows`.
fn update_rows(head: RowBlock<'_>, mut rows: RowBlockMut<'_>, cols: Range<usize>) {
    for i in rows.range() {
        let row_i = rows.row_mut(i);
        for k in cols.clone() {
            let row_k = head.row(k);
            row_i[k] = (row_i[k] - dot(&row_k[..k], &row_i[..k])) / row_k[k];
        }
    }
}

#[derive(Debug, Clone)]
pub struct InPlaceCholesky {
    l: TriangularRows,
    is_spd: bool,
}

impl InPlaceCholesky {
    /// Factorizes `a` (a plain packed lower triangle) in place.
    pub fn decompose(a: TriangularRows, params: &BlockParams) -> Result<Self, GramError> {
        Self::decompose_with(a, params, &update_rows)
    }

    /// `decompose` with the trailing update supplied by the caller.
    fn decompose_with<U>(
        mut a: TriangularRows,
        params: &BlockParams,
        update: &U,
    ) -> Result<Self, GramError>
    where
        U: Fn(RowBlock<'_>, RowBlockMut<'_>, Range<usize>) + Sync,
    {
        if a.lead() != 0 {
            return Err(GramError::InvalidDimension(format!(
                "blocked factorization expects a plain lower triangle, got {} leading columns",
                a.lead()
            )));
        }
        if params.block_size == 0 {
            return Err(GramError::InvalidConfig(
                "block size must be positive".to_string(),
            ));
        }
        let n = a.rows();
        let mut is_spd = true;
        let mut j = 0;
        while j < n {
            let end = (j + params.block_size).min(n);
            for i in j..end {
                let (head, mut tail) = a.split_at_row_mut(i);
                let row_i = tail.row_mut(i);
                for k in j..i {
                    let row_k = head.row(k);
                    row_i[k] = (row_i[k] - dot(&row_k[..k], &row_i[..k])) / row_k[k];
                }
                let pivot = row_i[i] - dot(&row_i[..i], &row_i[..i]);
                is_spd &= pivot > 0.0;
                row_i[i] = pivot.max(0.0).sqrt();
            }
            if end == n {
                break;
            }

            let p = params.chunks_for(n - end, end);
            let (head, tail) = a.split_at_row_mut(end);
            if p == 1 {
                update(head, tail, j..end);
            } else {
                let rows_per_chunk = (n - end) / p;
                log::trace!(
                    "Columns {j}..{end}: {p} chunks of {rows_per_chunk} rows below row {end}"
                );
                let failure = FailureSlot::new();
                let failure_ref = &failure;
                rayon::scope(move |s| {
                    let mut rest = tail;
                    for _ in 1..p {
                        let at = rest.range().start + rows_per_chunk;
                        let (chunk, remaining) = rest.split_at(at);
                        rest = remaining;
                        s.spawn(move |_| {
                            failure_ref.guard(|| update(head, chunk, j..end));
                        });
                    }
                    failure_ref.guard(|| update(head, rest, j..end));
                });
                failure.into_result("blocked trailing update")?;
            }
            j = end;
        }
        if !is_spd {
            log::trace!("Blocked factorization of {n} rows lost positive definiteness");
        }
        Ok(Self { l: a, is_spd })
    }

    #[inline]
    pub fn lower(&self) -> &TriangularRows {
        &self.l
    }

    pub fn into_lower(self) -> TriangularRows {
        self.l
    }

    #[inline]
    pub fn is_spd(&self) -> bool {
        self.is_spd
    }
}
