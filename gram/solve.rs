// ========================================================================================
//
//                  Triangular solves against a diagonal+dense Cholesky factor
//
// ========================================================================================
//
// `L * L' * x = b` is solved in place in four phases:
//   1. y[k] /= l_kk for the diagonal block,
//   2. forward substitution over the dense rows,
//   3. backward substitution over the dense rows, from the last row up,
//   4. y[k] /= l_kk for the diagonal block again.
//
// Only phase 3 runs in parallel. Dense rows are cut into row groups of
// `row_block` rows, starting from the bottom, and columns into blocks of
// `column_block` aligned at zero. Within a group the "diagonal tile" covers the
// columns from the block holding the group's first row up to the rows
// themselves; it divides each `y[k]` and pushes it into those columns. Every
// column block left of the diagonal tile is an "inner tile" that only pushes the
// group's finished `y[k]` into its own columns.
//
// Each `y[i]` receives its updates in the same order as the sequential sweep
// (groups bottom-up, rows descending within a group), so every strategy gives
// bit-identical results.

use crate::config::{BacksolveStrategy, SolveConfig};
use crate::layout::TriangularRows;
use crate::schedule::{FailureSlot, TaskGraph};
use crate::types::GramError;
use rayon::Scope;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Solves `L * L' * x = y` in place. `diag` holds the diagonal block of `L`,
/// `dense` its remaining rows (leading with `diag.len()` columns).
pub(crate) fn solve_in_place(
    diag: &[f64],
    dense: &TriangularRows,
    y: &mut [f64],
    config: &SolveConfig,
) -> Result<(), GramError> {
    let d = diag.len();
    let n = d + dense.rows();
    if y.len() != n {
        return Err(GramError::InvalidDimension(format!(
            "right-hand side has length {}, factor has {n} rows",
            y.len()
        )));
    }
    config.validate()?;
    let start = Instant::now();

    for (yk, lk) in y[..d].iter_mut().zip(diag) {
        *yk /= lk;
    }
    forward_dense(d, dense, y);
    let forward_done = start.elapsed();

    let strategy = config.resolve(dense.rows());
    log::trace!("Backward phase over {} dense rows: {strategy:?}", dense.rows());
    match strategy {
        BacksolveStrategy::Wavefront => backward_wavefront(d, dense, y, config)?,
        BacksolveStrategy::ProgressPointer => backward_progress_pointer(d, dense, y, config)?,
        BacksolveStrategy::Sequential | BacksolveStrategy::Auto => backward_sequential(d, dense, y),
    }
    for (yk, lk) in y[..d].iter_mut().zip(diag) {
        *yk /= lk;
    }
    log::debug!(
        "Solved {n} rows: forward {:.2?}, total {:.2?}",
        forward_done,
        start.elapsed()
    );
    Ok(())
}

fn forward_dense(d: usize, dense: &TriangularRows, y: &mut [f64]) {
    for (ii, row) in dense.iter_rows().enumerate() {
        let k = d + ii;
        let s: f64 = row[..k].iter().zip(&y[..k]).map(|(l, v)| l * v).sum();
        y[k] = (y[k] - s) / row[k];
    }
}

fn backward_sequential(d: usize, dense: &TriangularRows, y: &mut [f64]) {
    for ii in (0..dense.rows()).rev() {
        let k = d + ii;
        let row = dense.row(ii);
        y[k] /= row[k];
        let yk = y[k];
        for (yi, li) in y[..k].iter_mut().zip(&row[..k]) {
            *yi -= yk * li;
        }
    }
}

/// Dense rows `[lo, hi)` processed as one unit of the backward sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowGroup {
    lo: usize,
    hi: usize,
    /// Column blocks strictly left of the diagonal tile.
    inner_blocks: usize,
}

impl RowGroup {
    fn diagonal_start(&self, column_block: usize) -> usize {
        self.inner_blocks * column_block
    }
}

/// Row groups from the bottom of the factor up, covering rows `[d, n)`.
fn row_groups(d: usize, n: usize, row_block: usize, column_block: usize) -> Vec<RowGroup> {
    let mut groups = Vec::with_capacity((n - d).div_ceil(row_block));
    let mut hi = n;
    while hi > d {
        let lo = hi.saturating_sub(row_block).max(d);
        groups.push(RowGroup {
            lo,
            hi,
            inner_blocks: lo / column_block,
        });
        hi = lo;
    }
    groups
}

/// The right-hand side shared by concurrently running tiles.
///
/// Tiles only ever touch disjoint index ranges at the same time; the task
/// dependencies establish that. All access goes through the methods so that
/// closures capture the wrapper, never the raw pointer.
struct SharedRhs<'a> {
    ptr: *mut f64,
    len: usize,
    marker: PhantomData<&'a mut [f64]>,
}

// SAFETY: the pointer is derived from a `&mut [f64]` that outlives the wrapper,
// and callers of the unsafe accessors guarantee disjoint concurrent access.
unsafe impl Send for SharedRhs<'_> {}
unsafe impl Sync for SharedRhs<'_> {}

impl<'a> SharedRhs<'a> {
    fn new(y: &'a mut [f64]) -> Self {
        Self {
            ptr: y.as_mut_ptr(),
            len: y.len(),
            marker: PhantomData,
        }
    }

    /// # Safety
    /// No other task may write `y[k]` concurrently.
    #[inline]
    unsafe fn get(&self, k: usize) -> f64 {
        debug_assert!(k < self.len);
        unsafe { *self.ptr.add(k) }
    }

    /// `y[k] /= by`, returning the new value.
    ///
    /// # Safety
    /// The caller has exclusive access to `y[k]`.
    #[inline]
    unsafe fn divide(&self, k: usize, by: f64) -> f64 {
        debug_assert!(k < self.len);
        unsafe {
            let slot = self.ptr.add(k);
            *slot /= by;
            *slot
        }
    }

    /// `y[cols] -= scale * coeffs`.
    ///
    /// # Safety
    /// The caller has exclusive access to `y[cols]`.
    #[inline]
    unsafe fn sub_scaled(&self, cols: Range<usize>, scale: f64, coeffs: &[f64]) {
        debug_assert!(cols.end <= self.len && coeffs.len() == cols.len());
        let target = unsafe { std::slice::from_raw_parts_mut(self.ptr.add(cols.start), cols.len()) };
        for (yi, li) in target.iter_mut().zip(coeffs) {
            *yi -= scale * li;
        }
    }
}

/// Read-only inputs shared by every tile of one backward sweep.
struct Sweep<'a> {
    d: usize,
    dense: &'a TriangularRows,
    rhs: SharedRhs<'a>,
    column_block: usize,
}

impl Sweep<'_> {
    /// Divides the group's rows and pushes them into the diagonal tile.
    ///
    /// # Safety
    /// Every earlier group has finished with columns `[diagonal_start, hi)`, and
    /// no concurrent tile touches them.
    unsafe fn diagonal_tile(&self, group: RowGroup) {
        let start = group.diagonal_start(self.column_block);
        for k in (group.lo..group.hi).rev() {
            let row = self.dense.row(k - self.d);
            unsafe {
                let yk = self.rhs.divide(k, row[k]);
                self.rhs.sub_scaled(start..k, yk, &row[start..k]);
            }
        }
    }

    /// Pushes the group's finished rows into column block `block`.
    ///
    /// # Safety
    /// The group's diagonal tile is done, every earlier group has finished with
    /// the block, and no concurrent tile touches it.
    unsafe fn inner_tile(&self, group: RowGroup, block: usize) {
        let cols = block * self.column_block..(block + 1) * self.column_block;
        for k in (group.lo..group.hi).rev() {
            let row = self.dense.row(k - self.d);
            unsafe {
                let yk = self.rhs.get(k);
                self.rhs.sub_scaled(cols.clone(), yk, &row[cols.clone()]);
            }
        }
    }

    /// # Safety
    /// The tile's ordering requirements, as for `diagonal_tile` and `inner_tile`.
    unsafe fn run_tile(&self, groups: &[RowGroup], tile: Tile) {
        match tile {
            Tile::Diagonal { group } => unsafe { self.diagonal_tile(groups[group]) },
            Tile::Inner { group, block } => unsafe { self.inner_tile(groups[group], block) },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tile {
    Diagonal { group: usize },
    Inner { group: usize, block: usize },
}

/// Builds the tile graph: the diagonal tile of a group waits for whichever
/// tiles of the previous group last wrote its columns; an inner tile waits for
/// its group's diagonal tile and the same block of the previous group.
fn wavefront_graph(groups: &[RowGroup], column_block: usize) -> (TaskGraph, Vec<Tile>) {
    let mut first = Vec::with_capacity(groups.len());
    let mut tiles = Vec::new();
    for (g, group) in groups.iter().enumerate() {
        first.push(tiles.len());
        tiles.push(Tile::Diagonal { group: g });
        tiles.extend((0..group.inner_blocks).map(|block| Tile::Inner { group: g, block }));
    }
    let owner = |g: usize, block: usize| -> usize {
        if block >= groups[g].inner_blocks {
            first[g]
        } else {
            first[g] + 1 + block
        }
    };

    let mut graph = TaskGraph::new(tiles.len());
    for (g, group) in groups.iter().enumerate() {
        let diagonal = first[g];
        if g > 0 {
            let mut before: Vec<usize> = (group.inner_blocks..=(group.hi - 1) / column_block)
                .map(|block| owner(g - 1, block))
                .collect();
            before.sort_unstable();
            before.dedup();
            for b in before {
                graph.add_edge(b, diagonal);
            }
        }
        for block in 0..group.inner_blocks {
            let tile = first[g] + 1 + block;
            graph.add_edge(diagonal, tile);
            if g > 0 {
                graph.add_edge(owner(g - 1, block), tile);
            }
        }
    }
    (graph, tiles)
}

fn backward_wavefront(
    d: usize,
    dense: &TriangularRows,
    y: &mut [f64],
    config: &SolveConfig,
) -> Result<(), GramError> {
    let n = y.len();
    let groups = row_groups(d, n, config.row_block, config.column_block);
    let (graph, tiles) = wavefront_graph(&groups, config.column_block);
    log::trace!("Wavefront: {} row groups, {} tiles", groups.len(), tiles.len());
    let sweep = Sweep {
        d,
        dense,
        rhs: SharedRhs::new(y),
        column_block: config.column_block,
    };
    // SAFETY: the graph orders every pair of tiles that share columns.
    graph.run("wavefront backward solve", |t| unsafe {
        sweep.run_tile(&groups, tiles[t])
    })
}

/// Row groups publish the lowest column they may still touch; the next group
/// spins until that pointer has moved past the columns it wants.
struct ProgressSweep<'a, F> {
    groups: &'a [RowGroup],
    column_block: usize,
    body: &'a F,
    progress: Vec<AtomicUsize>,
    failure: FailureSlot,
    completed: AtomicUsize,
}

impl<F> ProgressSweep<'_, F>
where
    F: Fn(Tile) + Sync,
{
    /// Blocks until group `g - 1` is done with every column `>= column`.
    /// Returns false when the sweep was cancelled meanwhile.
    fn wait_for_predecessor(&self, g: usize, column: usize) -> bool {
        if g == 0 {
            return true;
        }
        let mut spins = 0u32;
        while self.progress[g - 1].load(Ordering::Acquire) > column {
            if self.failure.is_cancelled() {
                return false;
            }
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
        true
    }

    fn spawn<'s>(&'s self, s: &Scope<'s>, g: usize) {
        s.spawn(move |s| self.run_group(s, g));
    }

    fn run_group<'s>(&'s self, s: &Scope<'s>, g: usize) {
        let group = self.groups[g];
        let block = self.column_block;
        let diagonal_start = group.diagonal_start(block);
        let diagonal_done = self.failure.guard(|| {
            if !self.wait_for_predecessor(g, diagonal_start) {
                return false;
            }
            (self.body)(Tile::Diagonal { group: g });
            self.progress[g].store(diagonal_start, Ordering::Release);
            true
        });
        if diagonal_done != Some(true) {
            return;
        }
        if g + 1 < self.groups.len() {
            self.spawn(s, g + 1);
        }
        let inner_done = self.failure.guard(|| {
            for c in (0..group.inner_blocks).rev() {
                if !self.wait_for_predecessor(g, c * block) {
                    return false;
                }
                (self.body)(Tile::Inner { group: g, block: c });
                self.progress[g].store(c * block, Ordering::Release);
            }
            true
        });
        if inner_done == Some(true) {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Runs every tile of `groups` in progress-pointer order: a group's tile starts
/// once the previous group has published that it is done with the tile's
/// columns, and a group is spawned once its predecessor's diagonal tile is done.
fn run_progress_pointer<F>(
    groups: &[RowGroup],
    column_block: usize,
    body: F,
) -> Result<(), GramError>
where
    F: Fn(Tile) + Sync,
{
    if groups.is_empty() {
        return Ok(());
    }
    let total = groups.len();
    let state = ProgressSweep {
        groups,
        column_block,
        body: &body,
        progress: groups.iter().map(|g| AtomicUsize::new(g.hi)).collect(),
        failure: FailureSlot::new(),
        completed: AtomicUsize::new(0),
    };
    log::trace!("Progress-pointer sweep over {total} row groups");
    rayon::scope(|s| state.spawn(s, 0));
    let completed = state.completed.load(Ordering::Acquire);
    state.failure.into_result("progress-pointer backward solve")?;
    if completed != total {
        return Err(GramError::IncompleteSchedule { completed, total });
    }
    Ok(())
}

fn backward_progress_pointer(
    d: usize,
    dense: &TriangularRows,
    y: &mut [f64],
    config: &SolveConfig,
) -> Result<(), GramError> {
    let n = y.len();
    let groups = row_groups(d, n, config.row_block, config.column_block);
    let sweep = Sweep {
        d,
        dense,
        rhs: SharedRhs::new(y),
        column_block: config.column_block,
    };
    // SAFETY: group g - 1, and transitively every earlier group, has published
    // that it no longer touches a tile's columns before that tile runs.
    run_progress_pointer(&groups, config.column_block, |tile| unsafe {
        sweep.run_tile(&groups, tile)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    fn random_factor(d: usize, rows: usize, seed: u64) -> (Vec<f64>, TriangularRows) {
        let mut rng = StdRng::seed_from_u64(seed);
        let diag = (0..d).map(|_| rng.gen_range(1.0..2.0)).collect();
        let mut dense = TriangularRows::new(d, rows);
        for i in 0..rows {
            let row = dense.row_mut(i);
            let last = row.len() - 1;
            for v in &mut row[..last] {
                *v = rng.gen_range(-0.2..0.2);
            }
            row[last] = rng.gen_range(1.0..2.0);
        }
        (diag, dense)
    }

    fn config(strategy: BacksolveStrategy, column_block: usize, row_block: usize) -> SolveConfig {
        SolveConfig {
            strategy,
            column_block,
            row_block,
            parallel_threshold: 0,
        }
    }

    #[test]
    fn row_groups_cover_the_dense_rows_bottom_up() {
        let groups = row_groups(3, 13, 4, 5);
        assert_eq!(
            groups,
            vec![
                RowGroup { lo: 9, hi: 13, inner_blocks: 1 },
                RowGroup { lo: 5, hi: 9, inner_blocks: 1 },
                RowGroup { lo: 3, hi: 5, inner_blocks: 0 },
            ]
        );
        assert!(row_groups(4, 4, 8, 8).is_empty());
    }

    #[test]
    fn parallel_strategies_match_the_sequential_sweep_bit_for_bit() {
        for d in [0, 3] {
            for rows in 0..=21 {
                let (diag, dense) = random_factor(d, rows, (31 * d + rows) as u64);
                let mut rng = StdRng::seed_from_u64(rows as u64);
                let b: Vec<f64> = (0..d + rows).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let mut expected = b.clone();
                solve_in_place(
                    &diag,
                    &dense,
                    &mut expected,
                    &config(BacksolveStrategy::Sequential, 1, 1),
                )
                .unwrap();
                for strategy in [BacksolveStrategy::Wavefront, BacksolveStrategy::ProgressPointer] {
                    for column_block in [1, 4, 7] {
                        for row_block in [1, 3, 5] {
                            let mut got = b.clone();
                            solve_in_place(
                                &diag,
                                &dense,
                                &mut got,
                                &config(strategy, column_block, row_block),
                            )
                            .unwrap();
                            assert_eq!(
                                got, expected,
                                "{strategy:?} d={d} rows={rows} cb={column_block} rb={row_block}"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn wavefront_graph_has_a_single_root() {
        let groups = row_groups(0, 20, 3, 4);
        let (mut graph, tiles) = wavefront_graph(&groups, 4);
        assert_eq!(graph.len(), tiles.len());
        let roots = (0..graph.len())
            .filter(|&t| graph.dependencies(t) == 0)
            .count();
        assert_eq!(roots, 1);
    }

    fn group_of(tile: Tile) -> usize {
        match tile {
            Tile::Diagonal { group } | Tile::Inner { group, .. } => group,
        }
    }

    #[test]
    fn failed_diagonal_tile_stops_the_groups_below() {
        let groups = row_groups(0, 40, 4, 4);
        let ran = Mutex::new(Vec::new());
        let result = run_progress_pointer(&groups, 4, |tile| {
            if tile == (Tile::Diagonal { group: 2 }) {
                panic!("diagonal tile of group 2 failed");
            }
            ran.lock().unwrap().push(tile);
        });
        assert_eq!(
            result,
            Err(GramError::TaskFailed {
                stage: "progress-pointer backward solve",
                message: "diagonal tile of group 2 failed".to_string(),
            })
        );
        let ran = ran.into_inner().unwrap();
        assert!(ran.contains(&Tile::Diagonal { group: 1 }));
        assert!(ran.iter().all(|&t| group_of(t) < 2), "{ran:?}");
    }

    #[test]
    fn spinning_group_gives_up_when_its_predecessor_fails() {
        // Group 1 publishes progress down to column 4 and then fails on block 0,
        // so group 2 can never be cleared for its own block 0.
        let groups = row_groups(0, 40, 4, 4);
        let ran = Mutex::new(Vec::new());
        let result = run_progress_pointer(&groups, 4, |tile| {
            if tile == (Tile::Inner { group: 1, block: 0 }) {
                panic!("inner tile failed");
            }
            ran.lock().unwrap().push(tile);
        });
        assert_eq!(
            result,
            Err(GramError::TaskFailed {
                stage: "progress-pointer backward solve",
                message: "inner tile failed".to_string(),
            })
        );
        let ran = ran.into_inner().unwrap();
        assert!(ran.contains(&Tile::Inner { group: 0, block: 0 }));
        assert!(
            ran.iter()
                .all(|&t| !matches!(t, Tile::Inner { group, block: 0 } if group >= 1)),
            "{ran:?}"
        );
    }

    #[test]
    fn progress_pointer_runs_every_tile_once() {
        let groups = row_groups(2, 23, 3, 4);
        let ran = Mutex::new(Vec::new());
        run_progress_pointer(&groups, 4, |tile| ran.lock().unwrap().push(tile)).unwrap();
        let (_, mut expected) = wavefront_graph(&groups, 4);
        let mut ran = ran.into_inner().unwrap();
        let key = |t: &Tile| match *t {
            Tile::Diagonal { group } => (group, 0),
            Tile::Inner { group, block } => (group, block + 1),
        };
        ran.sort_by_key(key);
        expected.sort_by_key(key);
        assert_eq!(ran, expected);
    }

    #[test]
    fn mismatched_rhs_is_rejected() {
        let (diag, dense) = random_factor(2, 3, 1);
        let mut y = vec![0.0; 4];
        assert!(matches!(
            solve_in_place(&diag, &dense, &mut y, &SolveConfig::default()),
            Err(GramError::InvalidDimension(_))
        ));
    }

    #[test]
    fn zero_blocks_are_a_config_error() {
        let (diag, dense) = random_factor(0, 3, 1);
        let mut y = vec![1.0; 3];
        assert!(matches!(
            solve_in_place(&diag, &dense, &mut y, &config(BacksolveStrategy::Wavefront, 0, 2)),
            Err(GramError::InvalidConfig(_))
        ));
    }
}
