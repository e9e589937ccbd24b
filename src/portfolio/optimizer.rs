//! # Single-Objective Optimizer
//!
//! $$
//! \max_{\mathbf{w}\in\Delta^{n-1}} \frac{\mathbf{w}^\top\mu-r_f}{\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}}
//! \qquad
//! \min_{\mathbf{w}\in\Delta^{n-1},\ \mathbf{w}^\top\mu=t} \mathbf{w}^\top\Sigma\mathbf{w}
//! $$
//!
//! Max-Sharpe with an equal-weight fallback policy, and the
//! minimum-variance-for-target primitive used to trace the frontier.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::data::ReturnSeries;
use super::moments::Moments;
use super::moments::compute_moments;
use super::solver::SolverBackend;
use super::solver::build_backend;
use super::solver::equal_weights;
use super::types::FallbackReason;
use super::types::PortfolioResult;
use super::types::SolveStatus;
use crate::config::OptimizerConfig;
use crate::error::PortfolioError;
use crate::error::Result;

/// Absolute slack allowed when checking a return target against `[min μ, max μ]`.
const TARGET_SLACK: f64 = 1e-12;

pub(crate) fn optimal_result(
  moments: &Moments,
  weights: DVector<f64>,
  risk_free: f64,
  solver: &'static str,
) -> PortfolioResult {
  PortfolioResult {
    metrics: moments.metrics(&weights, risk_free),
    weights,
    status: SolveStatus::Optimal,
    solver,
  }
}

/// Equal-weight result tagged with `reason`; logs the substitution.
pub(crate) fn fallback_result(
  moments: &Moments,
  risk_free: f64,
  solver: &'static str,
  reason: FallbackReason,
) -> PortfolioResult {
  warn!(solver, %reason, "falling back to equal weights");
  let weights = equal_weights(moments.n_assets());
  PortfolioResult {
    metrics: moments.metrics(&weights, risk_free),
    weights,
    status: SolveStatus::Fallback { reason },
    solver,
  }
}

/// Max-Sharpe and min-variance solver bound to one configuration and backend.
#[derive(Debug)]
pub struct PortfolioOptimizer {
  config: OptimizerConfig,
  backend: Box<dyn SolverBackend>,
}

impl PortfolioOptimizer {
  /// Validate `config` and instantiate its backend.
  pub fn new(config: OptimizerConfig) -> Result<Self> {
    config.validate()?;
    let backend = build_backend(config.backend, config.solver_settings());
    info!(backend = backend.name(), "portfolio optimizer ready");
    Ok(Self { config, backend })
  }

  /// Use a caller-supplied backend instead of the configured one.
  pub fn with_backend(config: OptimizerConfig, backend: Box<dyn SolverBackend>) -> Result<Self> {
    config.validate()?;
    Ok(Self { config, backend })
  }

  pub fn config(&self) -> &OptimizerConfig {
    &self.config
  }

  pub fn backend_name(&self) -> &'static str {
    self.backend.name()
  }

  /// Moments of `returns` annualized with the configured trading days.
  pub fn compute_moments(&self, returns: &ReturnSeries) -> Result<Moments> {
    compute_moments(returns, self.config.trading_days)
  }

  /// Tangency portfolio under the configured risk-free rate.
  ///
  /// Never fails: degenerate inputs and backend failures yield the
  /// equal-weight portfolio with [`SolveStatus::Fallback`].
  pub fn maximize_sharpe(&self, moments: &Moments) -> PortfolioResult {
    let rf = self.config.risk_free_rate;
    let solver = self.backend.name();

    if moments.n_assets() == 1 {
      return optimal_result(moments, DVector::from_element(1, 1.0), rf, solver);
    }
    if moments.is_singular() {
      return fallback_result(moments, rf, solver, FallbackReason::SingularCovariance);
    }
    if moments.mean().max() <= rf {
      return fallback_result(moments, rf, solver, FallbackReason::NoPositiveExcessReturn);
    }

    match self.backend.max_sharpe(moments, rf) {
      Ok(weights) => {
        let result = optimal_result(moments, weights, rf, solver);
        debug!(
          solver,
          sharpe = result.metrics.sharpe_ratio,
          volatility = result.metrics.volatility,
          "max-Sharpe converged"
        );
        result
      }
      Err(err) => fallback_result(moments, rf, solver, err.into()),
    }
  }

  /// Minimum-variance weights earning exactly `target`, with their volatility.
  pub fn minimize_variance(&self, moments: &Moments, target: f64) -> Result<(DVector<f64>, f64)> {
    if !target.is_finite() {
      return Err(PortfolioError::invalid(
        "target_return",
        target,
        "must be finite",
      ));
    }
    let min = moments.mean().min();
    let max = moments.mean().max();
    if target < min - TARGET_SLACK || target > max + TARGET_SLACK {
      return Err(PortfolioError::InfeasibleTarget { target, min, max });
    }

    let weights = if moments.n_assets() == 1 {
      DVector::from_element(1, 1.0)
    } else if max - min < TARGET_SLACK {
      // every portfolio earns the target
      self.backend.min_variance(moments, None)?
    } else {
      self
        .backend
        .min_variance(moments, Some(target.clamp(min, max)))?
    };
    let volatility = moments.portfolio_volatility(&weights);
    Ok((weights, volatility))
  }

  /// Global minimum-variance portfolio (no return target).
  pub fn min_variance_portfolio(&self, moments: &Moments) -> Result<PortfolioResult> {
    let rf = self.config.risk_free_rate;
    let solver = self.backend.name();
    let weights = if moments.n_assets() == 1 {
      DVector::from_element(1, 1.0)
    } else {
      self.backend.min_variance(moments, None)?
    };
    Ok(optimal_result(moments, weights, rf, solver))
  }
}

fn default_optimizer(risk_free_rate: f64) -> Result<PortfolioOptimizer> {
  PortfolioOptimizer::new(OptimizerConfig {
    risk_free_rate,
    ..Default::default()
  })
}

/// Max-Sharpe on annualized moments with the default configuration.
pub fn maximize_sharpe(
  mean: &DVector<f64>,
  cov: &DMatrix<f64>,
  risk_free_rate: f64,
) -> Result<PortfolioResult> {
  let optimizer = default_optimizer(risk_free_rate)?;
  let moments = Moments::new(mean.clone(), cov.clone(), optimizer.config().trading_days)?;
  Ok(optimizer.maximize_sharpe(&moments))
}

/// Minimum variance at `target_return` with the default configuration.
pub fn minimize_variance(
  mean: &DVector<f64>,
  cov: &DMatrix<f64>,
  target_return: f64,
) -> Result<(DVector<f64>, f64)> {
  let optimizer = default_optimizer(OptimizerConfig::default().risk_free_rate)?;
  let moments = Moments::new(mean.clone(), cov.clone(), optimizer.config().trading_days)?;
  optimizer.minimize_variance(&moments, target_return)
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use nalgebra::dmatrix;
  use nalgebra::dvector;
  use tracing_test::traced_test;

  use super::*;
  use crate::portfolio::solver::SolverKind;

  fn optimizer(backend: SolverKind) -> PortfolioOptimizer {
    PortfolioOptimizer::new(OptimizerConfig {
      backend,
      ..Default::default()
    })
    .unwrap()
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

  fn two_assets() -> Moments {
    Moments::new(
      dvector![0.10, 0.05],
      dmatrix![0.04, 0.01; 0.01, 0.02],
      252,
    )
    .unwrap()
  }

  #[test]
  fn weights_are_long_only_and_fully_invested() {
    for backend in [SolverKind::Convex, SolverKind::NelderMead] {
      let result = optimizer(backend).maximize_sharpe(&three_assets());
      assert!(!result.is_fallback());
      assert_abs_diff_eq!(result.weights.sum(), 1.0, epsilon = 1e-6);
      assert!(result.weights.min() >= -1e-8);
    }
  }

  #[test]
  fn two_asset_scenario_beats_both_pure_allocations() {
    let moments = two_assets();
    let pure_a = moments.metrics(&dvector![1.0, 0.0], 0.02).sharpe_ratio;
    let pure_b = moments.metrics(&dvector![0.0, 1.0], 0.02).sharpe_ratio;

    for backend in [SolverKind::Convex, SolverKind::NelderMead] {
      let result = optimizer(backend).maximize_sharpe(&moments);
      assert_abs_diff_eq!(result.weights.sum(), 1.0, epsilon = 1e-6);
      assert!(result.metrics.sharpe_ratio >= pure_a);
      assert!(result.metrics.sharpe_ratio >= pure_b);
      assert_abs_diff_eq!(result.metrics.sharpe_ratio, 0.40708, epsilon = 1e-4);
      assert_abs_diff_eq!(result.weights[0], 0.7647, epsilon = 2e-3);
    }
  }

  #[test]
  fn backends_agree_on_sharpe() {
    let moments = three_assets();
    let convex = optimizer(SolverKind::Convex).maximize_sharpe(&moments);
    let nonlinear = optimizer(SolverKind::NelderMead).maximize_sharpe(&moments);
    assert_abs_diff_eq!(
      convex.metrics.sharpe_ratio,
      nonlinear.metrics.sharpe_ratio,
      epsilon = 1e-4
    );
  }

  #[test]
  fn backends_agree_on_tiny_excess_returns() {
    for base in [1e-4, 2e-4] {
      let moments = Moments::new(
        dvector![1.0, 1.5, 2.0] * base + DVector::from_element(3, 0.02),
        three_assets().cov().clone(),
        252,
      )
      .unwrap();
      let convex = optimizer(SolverKind::Convex).maximize_sharpe(&moments);
      let nonlinear = optimizer(SolverKind::NelderMead).maximize_sharpe(&moments);
      assert!(!convex.is_fallback(), "{:?}", convex.fallback_reason());
      assert!(!nonlinear.is_fallback(), "{:?}", nonlinear.fallback_reason());
      assert_abs_diff_eq!(
        convex.metrics.sharpe_ratio,
        nonlinear.metrics.sharpe_ratio,
        epsilon = 1e-4
      );
    }
  }

  #[test]
  fn maximize_sharpe_is_deterministic() {
    let opt = optimizer(SolverKind::Convex);
    let first = opt.maximize_sharpe(&three_assets());
    let second = opt.maximize_sharpe(&three_assets());
    assert_eq!(first.weights, second.weights);

    let opt = optimizer(SolverKind::NelderMead);
    assert_eq!(
      opt.maximize_sharpe(&three_assets()).weights,
      opt.maximize_sharpe(&three_assets()).weights
    );
  }

  #[test]
  fn single_asset_is_fully_allocated() {
    let moments = Moments::new(dvector![0.07], dmatrix![0.03], 252).unwrap();
    let result = optimizer(SolverKind::Convex).maximize_sharpe(&moments);
    assert_eq!(result.weights.as_slice(), &[1.0]);
    assert!(!result.is_fallback());
  }

  #[test]
  #[traced_test]
  fn singular_covariance_falls_back_to_equal_weights() {
    let moments = Moments::new(
      dvector![0.08, 0.08],
      dmatrix![0.04, 0.04; 0.04, 0.04],
      252,
    )
    .unwrap();

    for backend in [SolverKind::Convex, SolverKind::NelderMead] {
      let result = optimizer(backend).maximize_sharpe(&moments);
      assert_eq!(
        result.fallback_reason(),
        Some(&FallbackReason::SingularCovariance)
      );
      assert_eq!(result.weights.as_slice(), &[0.5, 0.5]);
    }
    assert!(logs_contain("falling back to equal weights"));
  }

  #[test]
  fn no_positive_excess_return_falls_back() {
    let moments = Moments::new(
      dvector![0.01, 0.015],
      dmatrix![0.04, 0.01; 0.01, 0.02],
      252,
    )
    .unwrap();
    let result = optimizer(SolverKind::Convex).maximize_sharpe(&moments);
    assert_eq!(
      result.fallback_reason(),
      Some(&FallbackReason::NoPositiveExcessReturn)
    );
  }

  #[test]
  fn exhausted_iterations_fall_back() {
    let opt = PortfolioOptimizer::new(OptimizerConfig {
      max_iters: 5,
      ..Default::default()
    })
    .unwrap();
    let result = opt.maximize_sharpe(&three_assets());
    assert!(matches!(
      result.fallback_reason(),
      Some(FallbackReason::NotConverged { .. })
    ));
    assert_abs_diff_eq!(result.weights[0], 1.0 / 3.0, epsilon = 1e-15);
  }

  #[test]
  fn minimize_variance_hits_targets_across_the_range() {
    let moments = three_assets();
    for backend in [SolverKind::Convex, SolverKind::NelderMead] {
      let opt = optimizer(backend);
      for target in [0.08, 0.09, 0.10, 0.11, 0.12] {
        let (w, vol) = opt.minimize_variance(&moments, target).unwrap();
        assert_abs_diff_eq!(moments.portfolio_return(&w), target, epsilon = 1e-4);
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-6);
        assert!(w.min() >= -1e-8);
        assert_abs_diff_eq!(vol, moments.portfolio_volatility(&w), epsilon = 1e-15);
      }
    }
  }

  #[test]
  fn backends_agree_on_min_variance() {
    let moments = three_assets();
    let (_, convex) = optimizer(SolverKind::Convex)
      .minimize_variance(&moments, 0.10)
      .unwrap();
    let (_, nonlinear) = optimizer(SolverKind::NelderMead)
      .minimize_variance(&moments, 0.10)
      .unwrap();
    assert_abs_diff_eq!(convex, nonlinear, epsilon = 1e-4);
  }

  #[test]
  fn target_outside_asset_returns_is_infeasible() {
    let opt = optimizer(SolverKind::Convex);
    let err = opt.minimize_variance(&three_assets(), 0.13).unwrap_err();
    assert!(matches!(err, PortfolioError::InfeasibleTarget { .. }));
    assert!(opt.minimize_variance(&three_assets(), 0.05).is_err());
  }

  #[test]
  fn global_min_variance_portfolio() {
    let result = optimizer(SolverKind::Convex)
      .min_variance_portfolio(&three_assets())
      .unwrap();
    assert_abs_diff_eq!(result.metrics.expected_return, 0.09005, epsilon = 1e-4);
    assert_abs_diff_eq!(result.metrics.volatility, 0.16703, epsilon = 1e-4);
  }

  #[test]
  fn free_functions_validate_inputs() {
    let mean = dvector![0.10, 0.05];
    let cov = dmatrix![0.04, 0.01; 0.01, 0.02];

    let result = maximize_sharpe(&mean, &cov, 0.02).unwrap();
    assert_eq!(result.solver, "convex");
    assert!(matches!(
      maximize_sharpe(&mean, &cov, 1.5),
      Err(PortfolioError::InvalidParameter { .. })
    ));

    let (w, _) = minimize_variance(&mean, &cov, 0.07).unwrap();
    assert_abs_diff_eq!(w.dot(&mean), 0.07, epsilon = 1e-10);
  }
}
