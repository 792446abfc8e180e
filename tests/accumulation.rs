use approx::assert_abs_diff_eq;
use gramchol::{GramRow, GramShape, SymmetricBlockMatrix, WeightedGram, accumulate_gram};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Columns: 4 levels of a diagonal categorical, 2 levels of a second
// categorical, 3 numerics, intercept.
fn shape() -> GramShape {
    GramShape::new(9, 4, 3, true)
}

fn synthetic_rows(count: usize, seed: u64) -> Vec<GramRow> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|r| {
            let bins = vec![rng.gen_range(0..4), 4 + rng.gen_range(0..2)];
            let weight = rng.gen_range(0.5..2.0);
            if r % 3 == 0 {
                // Sparse rows only carry the numerics that are non-zero.
                let ids = vec![6, 8];
                let values = vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
                GramRow::sparse(ids, values, bins, weight)
            } else {
                let values = (0..3).map(|_| rng.gen_range(-1.0..1.0)).collect();
                GramRow::dense(values, bins, weight)
            }
        })
        .collect()
}

#[test]
fn split_accumulation_is_a_row_weighted_average() {
    init_logging();
    let rows = synthetic_rows(100, 42);
    let full = accumulate_gram(shape(), &rows, 7, true).unwrap();
    let first = accumulate_gram(shape(), &rows[..60], 60, true).unwrap();
    let second = accumulate_gram(shape(), &rows[60..], 40, true).unwrap();
    assert_eq!(full.nobs, 100);

    let n = full.gram.full_n();
    for i in 0..n {
        for j in 0..n {
            let expected = (60.0 * first.gram.get(i, j) + 40.0 * second.gram.get(i, j)) / 100.0;
            assert_abs_diff_eq!(full.gram.get(i, j), expected, epsilon = 1e-12);
        }
    }

    let merged = first.reduce(second, true).unwrap();
    for i in 0..n {
        for j in 0..=i {
            assert_abs_diff_eq!(merged.gram.get(i, j), full.gram.get(i, j), epsilon = 1e-12);
        }
    }
}

#[test]
fn unstandardized_shards_sum() {
    init_logging();
    let rows = synthetic_rows(30, 7);
    let sharded = accumulate_gram(shape(), &rows, 4, false).unwrap();
    let mut serial = WeightedGram::new(shape()).unwrap();
    for row in &rows {
        serial.add_row(row).unwrap();
    }
    serial.finish(false);
    for (a, b) in sharded
        .gram
        .to_symmetric_array()
        .iter()
        .zip(serial.gram.to_symmetric_array().iter())
    {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
}

#[test]
fn accumulated_gram_matches_the_explicit_outer_products() {
    init_logging();
    let rows = synthetic_rows(25, 3);
    let acc = accumulate_gram(shape(), &rows, 5, false).unwrap();
    let n = shape().full_n();
    let mut expected = vec![vec![0.0; n]; n];
    for row in &rows {
        let mut x = vec![0.0; n];
        for &b in &row.categorical {
            x[b] = 1.0;
        }
        match &row.values {
            gramchol::RowValues::Dense(values) => {
                for (k, v) in values.iter().enumerate() {
                    x[6 + k] = *v;
                }
            }
            gramchol::RowValues::Sparse { ids, values } => {
                for (id, v) in ids.iter().zip(values) {
                    x[*id] = *v;
                }
            }
        }
        x[n - 1] = 1.0;
        for i in 0..n {
            for j in 0..n {
                expected[i][j] += row.weight * x[i] * x[j];
            }
        }
    }
    for i in 0..n {
        for j in 0..n {
            let stored = acc.gram.get(i, j);
            if i < 4 && j < 4 && i != j {
                // The diagonal block never stores couplings between its levels,
                // and a row holds exactly one of them.
                assert_eq!(stored, 0.0);
                assert_eq!(expected[i][j], 0.0);
            } else {
                assert_abs_diff_eq!(stored, expected[i][j], epsilon = 1e-10);
            }
        }
    }
}

#[test]
fn every_operation_keeps_the_matrix_symmetric() {
    init_logging();
    let rows = synthetic_rows(20, 11);
    let mut gram = accumulate_gram(shape(), &rows, 20, true).unwrap().gram;
    gram.add_diagonal(&[0.5; 10]).unwrap();
    gram.scale(3.0);
    let copy = gram.clone();
    gram.accumulate(&copy).unwrap();
    let n = gram.full_n();
    for i in 0..n {
        for j in 0..n {
            assert_eq!(gram.get(i, j), gram.get(j, i));
        }
    }
}

#[test]
fn scale_by_one_and_adding_zero_change_nothing() {
    init_logging();
    let rows = synthetic_rows(10, 5);
    let gram = accumulate_gram(shape(), &rows, 3, false).unwrap().gram;
    let mut scaled = gram.clone();
    scaled.scale(1.0);
    assert_eq!(scaled, gram);
    let mut summed = gram.clone();
    summed
        .accumulate(&SymmetricBlockMatrix::with_shape(shape()).unwrap())
        .unwrap();
    assert_eq!(summed, gram);
}

#[test]
fn non_finite_rows_are_caught_by_the_guard() {
    init_logging();
    let mut gram = SymmetricBlockMatrix::with_shape(shape()).unwrap();
    gram.add_row_dense(&[1.0, f64::NAN, 0.0], &[0, 4], 1.0).unwrap();
    assert!(gram.has_non_finite_entries());
}
