// ========================================================================================
//
//                      Packed ragged lower-triangular row storage
//
// ========================================================================================
//
// Row `i` holds `lead + i + 1` values: columns `[0, lead + i]` of global row
// `lead + i`. All rows live back to back in one flat buffer, so the offset of a
// row is a closed-form expression and `get(i, j)` stays O(1). A zero `lead`
// gives an ordinary packed lower triangle.
//
// Parallel writers never share a row. `split_at_row_mut` hands out a read-only
// view of the finished rows above a boundary and a mutable view of the rows at
// and below it, which can be split again into disjoint row ranges.

use crate::types::GramError;
use std::ops::Range;

#[inline(always)]
fn row_offset(lead: usize, i: usize) -> usize {
    i * lead + i * (i + 1) / 2
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriangularRows {
    lead: usize,
    rows: usize,
    data: Vec<f64>,
}

impl TriangularRows {
    /// Allocates `rows` zeroed rows after `lead` leading columns.
    pub fn new(lead: usize, rows: usize) -> Self {
        Self {
            lead,
            rows,
            data: vec![0.0; row_offset(lead, rows)],
        }
    }

    /// Builds storage from explicit rows, checking every row length.
    pub fn from_rows(lead: usize, rows: &[Vec<f64>]) -> Result<Self, GramError> {
        let mut out = Self::new(lead, rows.len());
        for (i, row) in rows.iter().enumerate() {
            if row.len() != lead + i + 1 {
                return Err(GramError::InvalidDimension(format!(
                    "row {i} has {} entries, expected {}",
                    row.len(),
                    lead + i + 1
                )));
            }
            out.row_mut(i).copy_from_slice(row);
        }
        Ok(out)
    }

    #[inline]
    pub fn lead(&self) -> usize {
        self.lead
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns spanned by the last row.
    #[inline]
    pub fn width(&self) -> usize {
        self.lead + self.rows
    }

    #[inline]
    pub fn row_len(&self, i: usize) -> usize {
        self.lead + i + 1
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        let start = row_offset(self.lead, i);
        &self.data[start..start + self.lead + i + 1]
    }

    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        let start = row_offset(self.lead, i);
        &mut self.data[start..start + self.lead + i + 1]
    }

    /// Entry at column `j` of stored row `i`; `j` must not exceed `lead + i`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        debug_assert!(j <= self.lead + i);
        self.data[row_offset(self.lead, i) + j]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.rows).map(move |i| self.row(i))
    }

    /// Every row as an independent mutable slice, ready for `par_iter_mut`.
    pub fn rows_mut(&mut self) -> Vec<&mut [f64]> {
        let (_, tail) = self.split_at_row_mut(0);
        tail.into_rows()
    }

    /// Splits into the finished rows `[0, at)` and the mutable rows `[at, rows)`.
    pub fn split_at_row_mut(&mut self, at: usize) -> (RowBlock<'_>, RowBlockMut<'_>) {
        debug_assert!(at <= self.rows);
        let (head, tail) = self.data.split_at_mut(row_offset(self.lead, at));
        (
            RowBlock {
                lead: self.lead,
                data: head,
            },
            RowBlockMut {
                lead: self.lead,
                first: at,
                end: self.rows,
                data: tail,
            },
        )
    }

    /// Keeps the first `rows` rows and releases the rest.
    pub fn truncate_rows(&mut self, rows: usize) {
        if rows < self.rows {
            self.rows = rows;
            self.data.truncate(row_offset(self.lead, rows));
        }
    }
}

/// Read-only view of the rows `[0, at)` above a split point.
#[derive(Clone, Copy)]
pub struct RowBlock<'a> {
    lead: usize,
    data: &'a [f64],
}

impl<'a> RowBlock<'a> {
    #[inline]
    pub fn row(&self, i: usize) -> &'a [f64] {
        let start = row_offset(self.lead, i);
        &self.data[start..start + self.lead + i + 1]
    }
}

/// Mutable view of a contiguous range of rows.
pub struct RowBlockMut<'a> {
    lead: usize,
    first: usize,
    end: usize,
    data: &'a mut [f64],
}

impl<'a> RowBlockMut<'a> {
    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.first..self.end
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first == self.end
    }

    /// Row `i` in global numbering; `i` must fall inside `range()`.
    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        debug_assert!(self.range().contains(&i));
        let start = row_offset(self.lead, i) - row_offset(self.lead, self.first);
        &mut self.data[start..start + self.lead + i + 1]
    }

    /// Splits into rows `[first, at)` and `[at, end)`.
    pub fn split_at(self, at: usize) -> (RowBlockMut<'a>, RowBlockMut<'a>) {
        let at = at.clamp(self.first, self.end);
        let mid = row_offset(self.lead, at) - row_offset(self.lead, self.first);
        let (left, right) = self.data.split_at_mut(mid);
        (
            RowBlockMut {
                lead: self.lead,
                first: self.first,
                end: at,
                data: left,
            },
            RowBlockMut {
                lead: self.lead,
                first: at,
                end: self.end,
                data: right,
            },
        )
    }

    pub fn into_rows(self) -> Vec<&'a mut [f64]> {
        let mut out = Vec::with_capacity(self.end - self.first);
        let mut rest = self.data;
        for i in self.first..self.end {
            let (row, tail) = rest.split_at_mut(self.lead + i + 1);
            out.push(row);
            rest = tail;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_have_ragged_lengths_after_the_lead() {
        let rows = TriangularRows::new(3, 4);
        assert_eq!(rows.as_slice().len(), 4 + 5 + 6 + 7);
        for i in 0..4 {
            assert_eq!(rows.row(i).len(), 3 + i + 1);
        }
        assert_eq!(rows.width(), 7);
    }

    #[test]
    fn split_views_address_the_same_entries() {
        let mut rows = TriangularRows::new(2, 5);
        for i in 0..5 {
            for (j, v) in rows.row_mut(i).iter_mut().enumerate() {
                *v = (10 * i + j) as f64;
            }
        }
        let (head, tail) = rows.split_at_row_mut(2);
        assert_eq!(head.row(1), &[10.0, 11.0, 12.0, 13.0]);
        let (mut left, mut right) = tail.split_at(4);
        assert_eq!(left.range(), 2..4);
        assert_eq!(right.range(), 4..5);
        assert_eq!(left.row_mut(3)[5], 35.0);
        right.row_mut(4)[0] = -1.0;
        assert_eq!(rows.get(4, 0), -1.0);
    }

    #[test]
    fn rows_mut_covers_every_row_once() {
        let mut rows = TriangularRows::new(1, 3);
        for (i, row) in rows.rows_mut().into_iter().enumerate() {
            row.fill(i as f64 + 1.0);
        }
        assert_eq!(rows.as_slice(), &[1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn from_rows_rejects_bad_lengths() {
        assert!(TriangularRows::from_rows(0, &[vec![1.0], vec![2.0]]).is_err());
        let ok = TriangularRows::from_rows(0, &[vec![1.0], vec![2.0, 3.0]]).unwrap();
        assert_eq!(ok.get(1, 0), 2.0);
    }

    #[test]
    fn truncate_drops_trailing_rows() {
        let mut rows = TriangularRows::new(0, 4);
        rows.truncate_rows(2);
        assert_eq!(rows.rows(), 2);
        assert_eq!(rows.as_slice().len(), 3);
    }
}
