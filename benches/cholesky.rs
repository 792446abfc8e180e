use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gramchol::{
    BacksolveStrategy, FactorConfig, GramRow, GramShape, SolveConfig, SymmetricBlockMatrix,
    accumulate_gram, cholesky,
};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_gram(numeric: usize, levels: usize) -> SymmetricBlockMatrix {
    let mut rng = StdRng::seed_from_u64(0x5EED + numeric as u64);
    let shape = GramShape::new(numeric + levels, levels, numeric, true);
    let rows: Vec<GramRow> = (0..2 * (numeric + levels))
        .map(|_| {
            let values = (0..numeric).map(|_| rng.sample(Standard)).collect();
            GramRow::dense(values, vec![rng.gen_range(0..levels)], 1.0)
        })
        .collect();
    let mut gram = accumulate_gram(shape, &rows, 256, true)
        .map(|acc| acc.gram)
        .unwrap_or_else(|e| panic!("benchmark Gram: {e}"));
    gram.add_ridge(1e-3, false);
    gram
}

fn benchmark_factorize(c: &mut Criterion) {
    let mut group = c.benchmark_group("factorize");
    group.sample_size(20);
    for numeric in [100_usize, 400] {
        let gram = random_gram(numeric, 50);
        group.throughput(Throughput::Elements((numeric * numeric) as u64));
        for block_size in [10_usize, 32] {
            let config = FactorConfig {
                block_size,
                ..FactorConfig::default()
            };
            group.bench_with_input(
                BenchmarkId::new(format!("block{block_size}"), numeric),
                &gram,
                |b, input| {
                    b.iter(|| black_box(cholesky(black_box(input), &config).map(|f| f.is_spd())));
                },
            );
        }
    }
    group.finish();
}

fn benchmark_solve(c: &mut Criterion) {
    let gram = random_gram(800, 50);
    let factor = cholesky(&gram, &FactorConfig::default())
        .unwrap_or_else(|e| panic!("benchmark factor: {e}"));
    let rhs: Vec<f64> = (0..gram.full_n()).map(|i| (i % 7) as f64 - 3.0).collect();

    let mut group = c.benchmark_group("backward_solve");
    group.sample_size(20);
    for strategy in [
        BacksolveStrategy::Sequential,
        BacksolveStrategy::Wavefront,
        BacksolveStrategy::ProgressPointer,
    ] {
        let config = SolveConfig {
            strategy,
            ..SolveConfig::default()
        };
        group.bench_function(format!("{strategy:?}"), |b| {
            b.iter(|| {
                let mut y = rhs.clone();
                black_box(factor.solve_with(&mut y, &config).map(|_| y[0]))
            });
        });
    }
    group.finish();
}

criterion_group!(cholesky_benches, benchmark_factorize, benchmark_solve);
criterion_main!(cholesky_benches);
