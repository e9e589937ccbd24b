use std::hint::black_box;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use frontier_rs::config::OptimizerConfig;
use frontier_rs::portfolio::Moments;
use frontier_rs::portfolio::MultiObjectiveOptimizer;
use frontier_rs::portfolio::PortfolioOptimizer;
use frontier_rs::portfolio::SolverKind;
use nalgebra::DMatrix;
use nalgebra::DVector;

/// Deterministic `n`-asset universe with a one-factor covariance.
fn universe(n: usize) -> Moments {
  let mean = DVector::from_fn(n, |i, _| 0.04 + 0.10 * i as f64 / n as f64);
  let vols = DVector::from_fn(n, |i, _| 0.10 + 0.25 * i as f64 / n as f64);
  let cov = DMatrix::from_fn(n, n, |i, j| {
    let rho = if i == j { 1.0 } else { 0.3 };
    rho * vols[i] * vols[j]
  });
  Moments::new(mean, cov, 252).unwrap()
}

fn optimizer(backend: SolverKind) -> PortfolioOptimizer {
  PortfolioOptimizer::new(OptimizerConfig {
    backend,
    ..Default::default()
  })
  .unwrap()
}

fn bench_max_sharpe(c: &mut Criterion) {
  let mut group = c.benchmark_group("MaxSharpe");
  for n in [5, 10, 20] {
    let moments = universe(n);
    for backend in [SolverKind::Convex, SolverKind::NelderMead] {
      let opt = optimizer(backend);
      group.bench_with_input(BenchmarkId::new(backend.name(), n), &moments, |b, m| {
        b.iter(|| black_box(opt.maximize_sharpe(m)))
      });
    }
  }
  group.finish();
}

fn bench_frontier(c: &mut Criterion) {
  let mut group = c.benchmark_group("Frontier");
  group.sample_size(10);
  let moments = universe(10);
  for backend in [SolverKind::Convex, SolverKind::NelderMead] {
    let opt = optimizer(backend);
    group.bench_function(backend.name(), |b| {
      b.iter(|| black_box(opt.build_frontier(&moments, 25).unwrap()))
    });
  }
  group.finish();
}

fn bench_strategies(c: &mut Criterion) {
  let moments = universe(10);
  let multi = MultiObjectiveOptimizer::new(OptimizerConfig::default()).unwrap();
  c.bench_function("AllStrategies", |b| {
    b.iter(|| black_box(multi.optimize_all(&moments).unwrap()))
  });
}

criterion_group!(benches, bench_max_sharpe, bench_frontier, bench_strategies);
criterion_main!(benches);
