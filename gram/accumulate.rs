// ========================================================================================
//
//                 Row accumulation and the scale-then-add shard reduce
//
// ========================================================================================
//
// Column order inside a Gram matrix: the categorical bins come first (the bins of
// the first categorical form the diagonal block), the numeric predictors follow,
// and the intercept is last. A row contributes `w * x * x'` restricted to the
// stored lower triangle. Categorical bins are given as absolute column ids in
// ascending order; at most the first of them may fall inside the diagonal block.
//
// Shards are accumulated independently and merged pairwise. With standardization
// every partial is a per-row average, so a merge rescales each side by its share
// of the combined row count before summing. No full N x N matrix is ever built.

use crate::matrix::SymmetricBlockMatrix;
use crate::types::{GramError, GramShape};
use rayon::prelude::*;
use std::time::Instant;

/// Numeric part of a data row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// One value per numeric predictor, in column order.
    Dense(Vec<f64>),
    /// Ascending absolute column ids with their values.
    Sparse { ids: Vec<usize>, values: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GramRow {
    pub values: RowValues,
    pub categorical: Vec<usize>,
    pub weight: f64,
}

impl GramRow {
    pub fn dense(values: Vec<f64>, categorical: Vec<usize>, weight: f64) -> Self {
        Self {
            values: RowValues::Dense(values),
            categorical,
            weight,
        }
    }

    pub fn sparse(ids: Vec<usize>, values: Vec<f64>, categorical: Vec<usize>, weight: f64) -> Self {
        Self {
            values: RowValues::Sparse { ids, values },
            categorical,
            weight,
        }
    }
}

impl SymmetricBlockMatrix {
    fn check_bins(&self, bins: &[usize]) -> Result<(), GramError> {
        let shape = self.shape();
        let cat_end = shape.full_n() - shape.dense_count - usize::from(shape.has_intercept);
        if bins.windows(2).any(|w| w[0] >= w[1]) {
            return Err(GramError::InvalidDimension(
                "categorical bins must be strictly ascending".to_string(),
            ));
        }
        if bins.last().is_some_and(|&b| b >= cat_end) {
            return Err(GramError::InvalidDimension(format!(
                "categorical bin {:?} outside the {cat_end} categorical columns",
                bins.last()
            )));
        }
        if bins.len() > 1 && bins[1] < shape.diag_count {
            return Err(GramError::InvalidDimension(
                "only one categorical bin per row may fall in the diagonal block".to_string(),
            ));
        }
        Ok(())
    }

    /// Intercept and categorical-by-categorical contributions shared by both row forms.
    fn add_categorical_terms(&mut self, bins: &[usize], w: f64) {
        let shape = self.shape();
        let d = shape.diag_count;
        let (diag, dense) = self.parts_mut();
        if shape.has_intercept {
            let icpt = dense.rows() - 1;
            let row = dense.row_mut(icpt);
            let last = row.len() - 1;
            row[last] += w;
            for &b in bins {
                row[b] += w;
            }
        }
        let has_diag = d > 0 && bins.first().is_some_and(|&b| b < d);
        for i in usize::from(has_diag)..bins.len() {
            let row = dense.row_mut(bins[i] - d);
            for &b in &bins[..=i] {
                row[b] += w;
            }
        }
        if has_diag {
            diag[bins[0]] += w;
        }
    }

    /// Adds `w * x * x'` for a row given as one value per numeric predictor.
    pub fn add_row_dense(&mut self, numeric: &[f64], bins: &[usize], w: f64) -> Result<(), GramError> {
        let shape = self.shape();
        if numeric.len() != shape.dense_count {
            return Err(GramError::InvalidDimension(format!(
                "row has {} numeric values, matrix expects {}",
                numeric.len(),
                shape.dense_count
            )));
        }
        self.check_bins(bins)?;
        let icpt = usize::from(shape.has_intercept);
        let d = shape.diag_count;
        let col_start = shape.full_n() - shape.dense_count - icpt;
        let row_start = col_start - d;
        let (_, dense) = self.parts_mut();
        let icpt_row = dense.rows().wrapping_sub(1);
        for (i, &xi) in numeric.iter().enumerate() {
            if xi == 0.0 {
                continue;
            }
            let dw = w * xi;
            let row = dense.row_mut(row_start + i);
            for (j, &xj) in numeric[..=i].iter().enumerate() {
                if xj != 0.0 {
                    row[col_start + j] += dw * xj;
                }
            }
            for &b in bins {
                row[b] += dw;
            }
            if icpt == 1 {
                dense.row_mut(icpt_row)[col_start + i] += dw;
            }
        }
        self.add_categorical_terms(bins, w);
        Ok(())
    }

    /// Adds `w * x * x'` for a row given as ascending absolute column ids.
    pub fn add_row_sparse(
        &mut self,
        ids: &[usize],
        values: &[f64],
        bins: &[usize],
        w: f64,
    ) -> Result<(), GramError> {
        let shape = self.shape();
        if ids.len() != values.len() {
            return Err(GramError::InvalidDimension(format!(
                "{} sparse ids but {} values",
                ids.len(),
                values.len()
            )));
        }
        let icpt = usize::from(shape.has_intercept);
        let d = shape.diag_count;
        let numeric_end = shape.full_n() - icpt;
        if ids.windows(2).any(|p| p[0] >= p[1])
            || ids.first().is_some_and(|&c| c < d)
            || ids.last().is_some_and(|&c| c >= numeric_end)
        {
            return Err(GramError::InvalidDimension(format!(
                "sparse ids must be strictly ascending within [{d}, {numeric_end})"
            )));
        }
        self.check_bins(bins)?;
        let (_, dense) = self.parts_mut();
        let icpt_row = dense.rows().wrapping_sub(1);
        for (i, (&cid, &xi)) in ids.iter().zip(values).enumerate() {
            let dw = w * xi;
            let row = dense.row_mut(cid - d);
            for (&cj, &xj) in ids[..=i].iter().zip(&values[..=i]) {
                row[cj] += dw * xj;
            }
            for &b in bins {
                row[b] += dw;
            }
            if icpt == 1 {
                dense.row_mut(icpt_row)[cid] += dw;
            }
        }
        self.add_categorical_terms(bins, w);
        Ok(())
    }

    pub fn add_row(&mut self, row: &GramRow) -> Result<(), GramError> {
        match &row.values {
            RowValues::Dense(values) => self.add_row_dense(values, &row.categorical, row.weight),
            RowValues::Sparse { ids, values } => {
                self.add_row_sparse(ids, values, &row.categorical, row.weight)
            }
        }
    }
}

/// A partial Gram matrix together with the number of rows folded into it.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedGram {
    pub gram: SymmetricBlockMatrix,
    pub nobs: u64,
}

impl WeightedGram {
    pub fn new(shape: GramShape) -> Result<Self, GramError> {
        Ok(Self {
            gram: SymmetricBlockMatrix::with_shape(shape)?,
            nobs: 0,
        })
    }

    pub fn add_row(&mut self, row: &GramRow) -> Result<(), GramError> {
        self.gram.add_row(row)?;
        self.nobs += 1;
        Ok(())
    }

    /// Turns the accumulated sum into a per-row average.
    pub fn finish(&mut self, standardize: bool) {
        if standardize && self.nobs > 0 {
            self.gram.scale(1.0 / self.nobs as f64);
        }
    }

    /// Merges two finished partials. Averages are reweighted by row counts; a
    /// side with no rows is merged as-is.
    pub fn reduce(mut self, mut other: WeightedGram, standardize: bool) -> Result<Self, GramError> {
        if standardize && self.nobs > 0 && other.nobs > 0 {
            let total = (self.nobs + other.nobs) as f64;
            self.gram.scale(self.nobs as f64 / total);
            other.gram.scale(other.nobs as f64 / total);
        }
        self.gram.accumulate(&other.gram)?;
        self.nobs += other.nobs;
        Ok(self)
    }
}

/// Accumulates `rows` in parallel shards of `shard_rows` rows and merges them.
pub fn accumulate_gram(
    shape: GramShape,
    rows: &[GramRow],
    shard_rows: usize,
    standardize: bool,
) -> Result<WeightedGram, GramError> {
    if shard_rows == 0 {
        return Err(GramError::InvalidConfig(
            "shard size must be positive".to_string(),
        ));
    }
    let start = Instant::now();
    let zero = WeightedGram::new(shape)?;
    let merged = rows
        .par_chunks(shard_rows)
        .map(|shard| {
            let mut part = zero.clone();
            for row in shard {
                part.add_row(row)?;
            }
            part.finish(standardize);
            Ok(part)
        })
        .try_reduce(|| zero.clone(), |a, b| a.reduce(b, standardize))?;
    log::debug!(
        "Accumulated {} rows into {} in {:.2?}",
        merged.nobs,
        shape,
        start.elapsed()
    );
    Ok(merged)
}
