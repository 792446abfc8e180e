// ========================================================================================
//
//                    The Gram matrix: a diagonal block plus ragged dense rows
//
// ========================================================================================
//
// A symmetric `full_n x full_n` matrix stored as two regions. The leading
// `diag_count` columns couple only with themselves, so they keep a single scalar
// each. Every remaining row keeps columns `[0, diag_count + i]` in a packed ragged
// buffer. Only the lower triangle is ever stored. When an intercept is present it
// owns the last dense row.

use crate::layout::TriangularRows;
use crate::types::{GramError, GramShape};
use ndarray::Array2;
use std::fmt;

#[derive(Clone, PartialEq)]
pub struct SymmetricBlockMatrix {
    shape: GramShape,
    diag: Vec<f64>,
    dense: TriangularRows,
    diag_added: f64,
}

impl SymmetricBlockMatrix {
    /// Allocates a zeroed matrix. `n` excludes the intercept.
    pub fn new(
        n: usize,
        diag_count: usize,
        dense_count: usize,
        has_intercept: bool,
    ) -> Result<Self, GramError> {
        Self::with_shape(GramShape::new(n, diag_count, dense_count, has_intercept))
    }

    pub fn with_shape(shape: GramShape) -> Result<Self, GramError> {
        shape.validate()?;
        Ok(Self {
            shape,
            diag: vec![0.0; shape.diag_count],
            dense: TriangularRows::new(shape.diag_count, shape.dense_rows()),
            diag_added: 0.0,
        })
    }

    /// Wraps existing regions. The dense rows must lead with `diag.len()` columns.
    pub fn from_parts(
        diag: Vec<f64>,
        dense: TriangularRows,
        dense_count: usize,
        has_intercept: bool,
    ) -> Result<Self, GramError> {
        if dense.lead() != diag.len() {
            return Err(GramError::InvalidDimension(format!(
                "dense rows lead with {} columns but the diagonal block has {}",
                dense.lead(),
                diag.len()
            )));
        }
        let full_n = diag.len() + dense.rows();
        if has_intercept && full_n == 0 {
            return Err(GramError::InvalidDimension(
                "an intercept needs at least one dense row".to_string(),
            ));
        }
        let shape = GramShape::new(
            full_n - usize::from(has_intercept),
            diag.len(),
            dense_count,
            has_intercept,
        );
        shape.validate()?;
        Ok(Self {
            shape,
            diag,
            dense,
            diag_added: 0.0,
        })
    }

    #[inline]
    pub fn shape(&self) -> GramShape {
        self.shape
    }

    #[inline]
    pub fn full_n(&self) -> usize {
        self.shape.full_n()
    }

    #[inline]
    pub fn diag_count(&self) -> usize {
        self.shape.diag_count
    }

    #[inline]
    pub fn dense_count(&self) -> usize {
        self.shape.dense_count
    }

    #[inline]
    pub fn has_intercept(&self) -> bool {
        self.shape.has_intercept
    }

    #[inline]
    pub fn diag(&self) -> &[f64] {
        &self.diag
    }

    #[inline]
    pub fn dense(&self) -> &TriangularRows {
        &self.dense
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut [f64], &mut TriangularRows) {
        (&mut self.diag, &mut self.dense)
    }

    /// Total ridge added through `add_ridge` since construction.
    #[inline]
    pub fn diag_added(&self) -> f64 {
        self.diag_added
    }

    /// `A[i][j]`, symmetric in its arguments.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let (i, j) = if j > i { (j, i) } else { (i, j) };
        let d = self.shape.diag_count;
        if i < d {
            return if i == j { self.diag[i] } else { 0.0 };
        }
        self.dense.get(i - d, j)
    }

    /// Adds `values[k]` to the k-th diagonal entry, whichever region owns it.
    pub fn add_diagonal(&mut self, values: &[f64]) -> Result<(), GramError> {
        if values.len() > self.full_n() {
            return Err(GramError::InvalidDimension(format!(
                "{} diagonal values for a {}-column matrix",
                values.len(),
                self.full_n()
            )));
        }
        let d = self.shape.diag_count;
        for (k, &v) in values.iter().enumerate() {
            if k < d {
                self.diag[k] += v;
            } else {
                let row = self.dense.row_mut(k - d);
                let last = row.len() - 1;
                row[last] += v;
            }
        }
        Ok(())
    }

    /// Adds `lambda` to every diagonal entry, skipping the intercept unless
    /// `include_intercept` is set.
    pub fn add_ridge(&mut self, lambda: f64, include_intercept: bool) {
        self.diag_added += lambda;
        for v in &mut self.diag {
            *v += lambda;
        }
        let skip = usize::from(self.shape.has_intercept && !include_intercept);
        let rows = self.dense.rows().saturating_sub(skip);
        for i in 0..rows {
            let row = self.dense.row_mut(i);
            let last = row.len() - 1;
            row[last] += lambda;
        }
    }

    /// Multiplies every stored entry by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.diag {
            *v *= factor;
        }
        for v in self.dense.as_mut_slice() {
            *v *= factor;
        }
    }

    /// Elementwise sum with a matrix of identical shape.
    pub fn accumulate(&mut self, other: &SymmetricBlockMatrix) -> Result<(), GramError> {
        if self.shape != other.shape {
            return Err(GramError::InvalidDimension(format!(
                "cannot accumulate {} into {}",
                other.shape, self.shape
            )));
        }
        for (a, b) in self.diag.iter_mut().zip(&other.diag) {
            *a += *b;
        }
        for (a, b) in self
            .dense
            .as_mut_slice()
            .iter_mut()
            .zip(other.dense.as_slice())
        {
            *a += *b;
        }
        Ok(())
    }

    /// True when any stored entry is NaN or infinite. Factorization does not run
    /// this check itself; non-finite input silently poisons the factor.
    pub fn has_non_finite_entries(&self) -> bool {
        self.diag.iter().any(|v| !v.is_finite())
            || self.dense.as_slice().iter().any(|v| !v.is_finite())
    }

    /// The full symmetric matrix.
    pub fn to_symmetric_array(&self) -> Array2<f64> {
        let n = self.full_n();
        Array2::from_shape_fn((n, n), |(i, j)| self.get(i, j))
    }

    /// The lower triangle, zeros above the diagonal.
    pub fn to_lower_array(&self) -> Array2<f64> {
        let n = self.full_n();
        Array2::from_shape_fn((n, n), |(i, j)| if j > i { 0.0 } else { self.get(i, j) })
    }

    /// Packed lower triangle with no diagonal block. With `intercept_first` the
    /// intercept is rotated to index 0 and every other column shifts up by one.
    pub fn to_lower_rows(&self, intercept_first: bool) -> TriangularRows {
        let n = self.full_n();
        let rotate = intercept_first && self.shape.has_intercept;
        let original = |k: usize| -> usize {
            if !rotate {
                k
            } else if k == 0 {
                n - 1
            } else {
                k - 1
            }
        };
        let mut out = TriangularRows::new(0, n);
        for i in 0..n {
            let oi = original(i);
            for (j, v) in out.row_mut(i).iter_mut().enumerate() {
                *v = self.get(oi, original(j));
            }
        }
        out
    }

    /// `A * x` using only the stored lower triangle.
    pub fn mul_vec(&self, x: &[f64]) -> Result<Vec<f64>, GramError> {
        let n = self.full_n();
        if x.len() != n {
            return Err(GramError::InvalidDimension(format!(
                "vector of length {} for a {n}-column matrix",
                x.len()
            )));
        }
        let d = self.shape.diag_count;
        let mut res = vec![0.0; n];
        for k in 0..d {
            res[k] = self.diag[k] * x[k];
        }
        for (ii, row) in self.dense.iter_rows().enumerate() {
            let i = d + ii;
            let last = row.len() - 1;
            for (j, &e) in row[..last].iter().enumerate() {
                res[i] += x[j] * e;
                res[j] += x[i] * e;
            }
            res[i] += row[last] * x[i];
        }
        Ok(res)
    }

    pub fn diag_sum(&self) -> f64 {
        self.diag.iter().sum::<f64>()
            + self
                .dense
                .iter_rows()
                .map(|row| row[row.len() - 1])
                .sum::<f64>()
    }

    /// Fraction of non-zero entries in the full symmetric matrix.
    pub fn sparseness(&self) -> f64 {
        let n = self.full_n();
        if n == 0 {
            return 0.0;
        }
        let diag_nz = self.diag.iter().filter(|v| **v != 0.0).count();
        let mut dense_nz = 0usize;
        for row in self.dense.iter_rows() {
            let last = row.len() - 1;
            dense_nz += 2 * row[..last].iter().filter(|v| **v != 0.0).count();
            dense_nz += usize::from(row[last] != 0.0);
        }
        (diag_nz + dense_nz) as f64 / (n * n) as f64
    }

    /// Columns whose diagonal entry is exactly zero, in ascending order.
    pub fn find_zero_cols(&self) -> Vec<usize> {
        let d = self.shape.diag_count;
        let mut zeros: Vec<usize> = (0..d).filter(|&k| self.diag[k] == 0.0).collect();
        zeros.extend(
            self.dense
                .iter_rows()
                .enumerate()
                .filter(|(_, row)| row[row.len() - 1] == 0.0)
                .map(|(i, _)| d + i),
        );
        zeros
    }

    /// Removes the intercept row and column.
    pub fn drop_intercept(&mut self) -> Result<(), GramError> {
        if !self.shape.has_intercept {
            return Err(GramError::InvalidDimension(
                "matrix has no intercept to drop".to_string(),
            ));
        }
        let rows = self.dense.rows();
        self.dense.truncate_rows(rows - 1);
        self.shape.has_intercept = false;
        Ok(())
    }

    /// Removes the given columns (ascending, unique) and their rows.
    pub fn drop_cols(&mut self, cols: &[usize]) -> Result<(), GramError> {
        if cols.windows(2).any(|w| w[0] >= w[1]) {
            return Err(GramError::InvalidDimension(
                "columns to drop must be strictly ascending".to_string(),
            ));
        }
        let n = self.full_n();
        if cols.last().is_some_and(|&c| c >= n) {
            return Err(GramError::InvalidDimension(format!(
                "column {:?} out of range for a {n}-column matrix",
                cols.last()
            )));
        }
        if self.shape.has_intercept && cols.last() == Some(&(n - 1)) {
            return Err(GramError::InvalidDimension(
                "use drop_intercept to remove the intercept".to_string(),
            ));
        }
        let d = self.shape.diag_count;
        let keep: Vec<usize> = (0..n).filter(|c| cols.binary_search(c).is_err()).collect();
        let diag: Vec<f64> = keep
            .iter()
            .filter(|&&c| c < d)
            .map(|&c| self.diag[c])
            .collect();
        let dense_keep: Vec<usize> = keep.iter().copied().filter(|&c| c >= d).collect();
        let lead = diag.len();
        let mut dense = TriangularRows::new(lead, dense_keep.len());
        for (ni, &oi) in dense_keep.iter().enumerate() {
            let out = dense.row_mut(ni);
            for (nj, &oj) in keep.iter().take(lead + ni + 1).enumerate() {
                out[nj] = self.get(oi, oj);
            }
        }
        let numeric_end = n - usize::from(self.shape.has_intercept);
        let numeric = (numeric_end - self.shape.dense_count)..numeric_end;
        let dropped_dense = cols.iter().filter(|&&c| numeric.contains(&c)).count();
        let dense_count = self.shape.dense_count - dropped_dense;
        let diag_added = self.diag_added;
        *self = Self::from_parts(diag, dense, dense_count, self.shape.has_intercept)?;
        self.diag_added = diag_added;
        Ok(())
    }
}

impl fmt::Debug for SymmetricBlockMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.full_n() >= 32 {
            return write!(f, "{}", self.shape);
        }
        writeln!(f, "{}", self.shape)?;
        for i in 0..self.full_n() {
            let row: Vec<String> = (0..=i).map(|j| format!("{:.4}", self.get(i, j))).collect();
            writeln!(f, "  [{}]", row.join(", "))?;
        }
        Ok(())
    }
}
