//! # Efficient Frontier
//!
//! $$
//! \sigma^\*(t)=\min_{\mathbf{w}\in\Delta^{n-1},\ \mathbf{w}^\top\mu=t}\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}},
//! \qquad t\in[\mu_{\mathrm{mv}},\max_i\mu_i]
//! $$
//!
//! Sweeps return targets from the global minimum-variance portfolio up to the
//! best single asset, solving each point independently.

use rayon::prelude::*;
use tracing::info;
use tracing::warn;

use super::moments::Moments;
use super::optimizer::PortfolioOptimizer;
use super::types::FrontierCurve;
use super::types::FrontierPoint;
use crate::error::PortfolioError;
use crate::error::Result;

fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
  match num {
    0 => Vec::new(),
    1 => vec![start],
    _ => {
      let step = (end - start) / (num - 1) as f64;
      (0..num)
        .map(|i| if i == num - 1 { end } else { start + step * i as f64 })
        .collect()
    }
  }
}

impl PortfolioOptimizer {
  /// Frontier with the configured number of points.
  pub fn efficient_frontier(&self, moments: &Moments) -> Result<FrontierCurve> {
    self.build_frontier(moments, self.config().num_frontier_points)
  }

  /// Efficient frontier over `num_points` linearly spaced targets.
  ///
  /// Infeasible targets are skipped; so are points whose solve fails for
  /// another reason, with a warning. Only a failure of the anchoring
  /// minimum-variance solve is fatal.
  pub fn build_frontier(&self, moments: &Moments, num_points: usize) -> Result<FrontierCurve> {
    if num_points == 0 {
      return Err(PortfolioError::invalid(
        "num_points",
        0.0,
        "must be at least 1",
      ));
    }

    let anchor = self.min_variance_portfolio(moments)?;
    let max_return = moments.mean().max();
    let start = anchor.metrics.expected_return.min(max_return);
    let targets = linspace(start, max_return, num_points);

    let solved: Vec<Option<FrontierPoint>> = targets
      .par_iter()
      .map(|&target| match self.minimize_variance(moments, target) {
        Ok((weights, volatility)) => Some(FrontierPoint::new(target, volatility, weights)),
        Err(PortfolioError::InfeasibleTarget { .. }) => None,
        Err(err) => {
          warn!(target_return = target, error = %err, "frontier point skipped");
          None
        }
      })
      .collect();

    let skipped = solved.iter().filter(|p| p.is_none()).count();
    let points: Vec<FrontierPoint> = solved.into_iter().flatten().collect();
    info!(
      points = points.len(),
      skipped,
      start,
      end = max_return,
      "efficient frontier built"
    );

    Ok(FrontierCurve { points, skipped })
  }
}

/// Frontier on annualized moments with the default configuration.
pub fn build_frontier(moments: &Moments, num_points: usize) -> Result<FrontierCurve> {
  PortfolioOptimizer::new(Default::default())?.build_frontier(moments, num_points)
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  use approx::assert_abs_diff_eq;
  use nalgebra::DVector;
  use nalgebra::dmatrix;
  use nalgebra::dvector;

  use super::*;
  use crate::config::OptimizerConfig;
  use crate::portfolio::solver::ConvexBackend;
  use crate::portfolio::solver::SolverBackend;
  use crate::portfolio::solver::SolverKind;
  use crate::portfolio::solver::SolverSettings;

  /// Convex backend that refuses targets strictly inside `(lo, hi)`.
  #[derive(Debug)]
  struct FailingBand {
    inner: ConvexBackend,
    lo: f64,
    hi: f64,
    failures: Arc<AtomicUsize>,
  }

  impl SolverBackend for FailingBand {
    fn name(&self) -> &'static str {
      "failing-band"
    }

    fn max_sharpe(&self, moments: &Moments, risk_free: f64) -> Result<DVector<f64>> {
      self.inner.max_sharpe(moments, risk_free)
    }

    fn min_variance(&self, moments: &Moments, target: Option<f64>) -> Result<DVector<f64>> {
      match target {
        Some(t) if t > self.lo && t < self.hi => {
          self.failures.fetch_add(1, Ordering::SeqCst);
          Err(PortfolioError::Solver(format!("refused target {t}")))
        }
        _ => self.inner.min_variance(moments, target),
      }
    }
  }

  fn three_assets() -> Moments {
    Moments::new(
      dvector![0.08, 0.10, 0.12],
      dmatrix![
        0.04, 0.01, 0.0;
        0.01, 0.09, 0.02;
        0.0, 0.02, 0.16
      ],
      252,
    )
    .unwrap()
  }

  #[test]
  fn linspace_hits_both_ends() {
    let xs = linspace(0.1, 0.2, 5);
    assert_eq!(xs.len(), 5);
    assert_eq!(xs[0], 0.1);
    assert_eq!(xs[4], 0.2);
    assert_eq!(linspace(0.3, 0.5, 1), vec![0.3]);
  }

  #[test]
  fn frontier_is_sorted_and_spans_the_range() {
    let moments = three_assets();
    let curve = build_frontier(&moments, 12).unwrap();

    assert_eq!(curve.len(), 12);
    assert_eq!(curve.skipped, 0);
    assert!(curve.returns().windows(2).all(|w| w[0] <= w[1]));
    assert_abs_diff_eq!(curve.points[0].target_return, 0.09005, epsilon = 1e-4);
    assert_abs_diff_eq!(curve.points[11].target_return, 0.12, epsilon = 1e-15);
    assert_abs_diff_eq!(curve.points[11].volatility, 0.4, epsilon = 1e-6);
  }

  #[test]
  fn frontier_points_match_independent_solves() {
    let moments = three_assets();
    let opt = PortfolioOptimizer::new(OptimizerConfig::default()).unwrap();
    let curve = opt.build_frontier(&moments, 8).unwrap();

    for point in &curve.points {
      let (weights, volatility) = opt.minimize_variance(&moments, point.target_return).unwrap();
      assert_abs_diff_eq!(point.volatility, volatility, epsilon = 1e-8);
      assert_abs_diff_eq!(
        moments.portfolio_return(&point.weights),
        point.target_return,
        epsilon = 1e-4
      );
      assert_eq!(point.weights, weights);
    }
  }

  #[test]
  fn nonlinear_frontier_agrees_with_convex() {
    let moments = three_assets();
    let convex = PortfolioOptimizer::new(OptimizerConfig::default())
      .unwrap()
      .build_frontier(&moments, 5)
      .unwrap();
    let nonlinear = PortfolioOptimizer::new(OptimizerConfig {
      backend: SolverKind::NelderMead,
      ..Default::default()
    })
    .unwrap()
    .build_frontier(&moments, 5)
    .unwrap();

    assert_eq!(convex.len(), nonlinear.len());
    for (a, b) in convex.points.iter().zip(nonlinear.points.iter()) {
      assert_abs_diff_eq!(a.volatility, b.volatility, epsilon = 1e-4);
    }
  }

  #[test]
  fn frontier_max_sharpe_point_is_near_tangency() {
    let moments = three_assets();
    let curve = build_frontier(&moments, 60).unwrap();
    let best = curve.max_sharpe_point(0.02).unwrap();
    let sharpe = (best.target_return - 0.02) / best.volatility;
    assert!(sharpe <= 0.43003 + 1e-4);
    assert!(sharpe > 0.42);
  }

  #[test]
  fn failed_points_are_skipped_without_failing_the_curve() {
    let failures = Arc::new(AtomicUsize::new(0));
    let backend = FailingBand {
      inner: ConvexBackend::new(SolverSettings::default()),
      lo: 0.10,
      hi: 0.11,
      failures: Arc::clone(&failures),
    };
    let opt =
      PortfolioOptimizer::with_backend(OptimizerConfig::default(), Box::new(backend)).unwrap();
    assert_eq!(opt.backend_name(), "failing-band");

    let moments = three_assets();
    let curve = opt.build_frontier(&moments, 12).unwrap();

    // targets step by about 0.0027 from 0.09005, four of them land in the band
    assert_eq!(failures.load(Ordering::SeqCst), 4);
    assert_eq!(curve.skipped, 4);
    assert_eq!(curve.len(), 12 - 4);
    assert!(curve.returns().windows(2).all(|w| w[0] <= w[1]));
    assert!(curve.volatilities().windows(2).all(|w| w[0] <= w[1] + 1e-6));
    assert!(
      curve
        .points
        .iter()
        .all(|p| p.target_return <= 0.10 || p.target_return >= 0.11)
    );
  }

  #[test]
  fn zero_points_is_rejected() {
    assert!(matches!(
      build_frontier(&three_assets(), 0),
      Err(PortfolioError::InvalidParameter { .. })
    ));
  }
}
