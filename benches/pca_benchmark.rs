use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{Array, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use scpca::{ExpressionMatrix, Pca, PcaConfig, Solver};

fn generate_data(n_samples: usize, n_features: usize) -> Array2<f64> {
    Array::random((n_samples, n_features), Uniform::new(0., 10.))
}

/// Zeroes about 80% of the entries to mimic count matrices.
fn generate_sparse(n_samples: usize, n_features: usize) -> ExpressionMatrix {
    let mask = Array::random((n_samples, n_features), Uniform::new(0., 1.));
    let data = generate_data(n_samples, n_features) * mask.mapv(|m: f64| if m < 0.2 { 1.0 } else { 0.0 });
    let dense = ExpressionMatrix::from(data);
    ExpressionMatrix::from(dense.to_sparse().unwrap())
}

fn bench_solvers(c: &mut Criterion) {
    let mut group = c.benchmark_group("PCA_solvers");
    let n_comps = 10;

    for &(n_samples, n_features) in [(500, 100), (1000, 200), (200, 1000)].iter() {
        let x = ExpressionMatrix::from(generate_data(n_samples, n_features));
        group.throughput(Throughput::Elements((n_samples * n_features) as u64));
        for (name, solver) in [
            ("covariance", Solver::Covariance),
            ("gram", Solver::Gram),
            ("randomized", Solver::randomized()),
        ] {
            let pca = Pca::new(PcaConfig::default().with_n_comps(n_comps).with_solver(solver));
            group.bench_with_input(
                BenchmarkId::new(name, format!("{}x{}", n_samples, n_features)),
                &x,
                |b, x| b.iter(|| pca.compute(x).unwrap()),
            );
        }
    }
    group.finish();
}

fn bench_chunked_sparse(c: &mut Criterion) {
    let mut group = c.benchmark_group("PCA_chunked_sparse");
    let (n_samples, n_features) = (5000, 300);
    let x = generate_sparse(n_samples, n_features);
    group.throughput(Throughput::Elements(x.nnz() as u64));

    for chunk_size in [250usize, 1000, n_samples] {
        let pca = Pca::new(PcaConfig::default().with_n_comps(20).with_chunk_size(chunk_size));
        group.bench_with_input(BenchmarkId::new("chunk", chunk_size), &x, |b, x| {
            b.iter(|| pca.compute(x).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_solvers, bench_chunked_sparse);
criterion_main!(benches);
