//! # Multi-Objective Optimizer
//!
//! $$
//! \mathrm{RC}_i=\frac{w_i(\Sigma\mathbf{w})_i}{\mathbf{w}^\top\Sigma\mathbf{w}},\qquad
//! J_{\mathrm{stab}}=s\,\Big(-\sum_i w_i\sigma_i^{d}\Big)+(1-s)\,\mathrm{SR}(\mathbf{w})
//! $$
//!
//! Runs max-Sharpe, risk parity, stability and HRP side by side on the same
//! moments, plus an opt-in risk parity that also rewards expected return.
//! A failing strategy is reported, not propagated.

use std::collections::BTreeMap;

use argmin::core::CostFunction;
use nalgebra::DMatrix;
use nalgebra::DVector;
use rayon::prelude::*;
use tracing::info;
use tracing::warn;

use super::hrp::hrp_weights;
use super::moments::Moments;
use super::moments::sharpe_ratio;
use super::optimizer::PortfolioOptimizer;
use super::optimizer::fallback_result;
use super::optimizer::optimal_result;
use super::solver::SolverSettings;
use super::solver::nelder_mead::minimize_on_simplex;
use super::solver::softmax;
use super::types::PortfolioResult;
use super::types::Strategy;
use super::types::StrategyReport;
use crate::config::OptimizerConfig;
use crate::error::PortfolioError;
use crate::error::Result;

const INFEASIBLE_COST: f64 = 1e10;

/// Squared deviation from equal risk contributions, minus
/// `return_boost · wᵀμ`.
struct RiskParityCost {
  cov: DMatrix<f64>,
  mean: DVector<f64>,
  return_boost: f64,
}

impl CostFunction for RiskParityCost {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let w = softmax(x);
    let sigma_w = &self.cov * &w;
    let port_var = w.dot(&sigma_w);
    if !(port_var > 1e-30) {
      return Ok(INFEASIBLE_COST);
    }

    let target_rc = 1.0 / w.len() as f64;
    let err: f64 = w
      .iter()
      .zip(sigma_w.iter())
      .map(|(wi, swi)| (wi * swi / port_var - target_rc).powi(2))
      .sum();
    Ok(err - self.return_boost * w.dot(&self.mean))
  }
}

/// Negative blend of stability score and Sharpe ratio.
struct StabilityCost {
  mean: DVector<f64>,
  cov: DMatrix<f64>,
  daily_vols: DVector<f64>,
  risk_free: f64,
  stability_weight: f64,
}

impl StabilityCost {
  fn objective(&self, w: &DVector<f64>) -> f64 {
    let vol = w.dot(&(&self.cov * w)).max(0.0).sqrt();
    let stability = -w.dot(&self.daily_vols);
    let sharpe = sharpe_ratio(w.dot(&self.mean), vol, self.risk_free);
    self.stability_weight * stability + (1.0 - self.stability_weight) * sharpe
  }
}

impl CostFunction for StabilityCost {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let value = self.objective(&softmax(x));
    if value.is_finite() {
      Ok(-value)
    } else {
      Ok(INFEASIBLE_COST)
    }
  }
}

/// Strategy runner sharing one configuration and max-Sharpe backend.
#[derive(Debug)]
pub struct MultiObjectiveOptimizer {
  optimizer: PortfolioOptimizer,
}

impl MultiObjectiveOptimizer {
  pub fn new(config: OptimizerConfig) -> Result<Self> {
    Ok(Self::with_optimizer(PortfolioOptimizer::new(config)?))
  }

  pub fn with_optimizer(optimizer: PortfolioOptimizer) -> Self {
    Self { optimizer }
  }

  pub fn optimizer(&self) -> &PortfolioOptimizer {
    &self.optimizer
  }

  fn config(&self) -> &OptimizerConfig {
    self.optimizer.config()
  }

  fn settings(&self) -> SolverSettings {
    self.config().solver_settings()
  }

  /// Nelder–Mead on a strategy cost; iteration exhaustion degrades to the
  /// equal-weight fallback like the max-Sharpe path.
  fn solve_nonlinear<C>(
    &self,
    strategy: Strategy,
    moments: &Moments,
    cost: C,
  ) -> Result<PortfolioResult>
  where
    C: CostFunction<Param = Vec<f64>, Output = f64>,
  {
    let rf = self.config().risk_free_rate;
    let n = moments.n_assets();
    if n == 1 {
      return Ok(optimal_result(moments, DVector::from_element(1, 1.0), rf, strategy.name()));
    }

    match minimize_on_simplex(cost, vec![0.0; n], &self.settings()) {
      Ok((best, _)) => Ok(optimal_result(moments, softmax(&best), rf, strategy.name())),
      Err(err @ PortfolioError::NotConverged { .. }) => {
        Ok(fallback_result(moments, rf, strategy.name(), err.into()))
      }
      Err(err) => Err(PortfolioError::Strategy {
        strategy: strategy.name(),
        reason: err.to_string(),
      }),
    }
  }

  /// Equal risk contributions `w_i (Σw)_i`.
  pub fn risk_parity(&self, moments: &Moments) -> Result<PortfolioResult> {
    let cost = RiskParityCost {
      cov: moments.cov().clone(),
      mean: moments.mean().clone(),
      return_boost: 0.0,
    };
    self.solve_nonlinear(Strategy::RiskParity, moments, cost)
  }

  /// Risk parity tilted toward expected return by the configured
  /// `return_boost`; zero boost is plain risk parity.
  pub fn return_boosted_risk_parity(&self, moments: &Moments) -> Result<PortfolioResult> {
    let cost = RiskParityCost {
      cov: moments.cov().clone(),
      mean: moments.mean().clone(),
      return_boost: self.config().return_boost,
    };
    self.solve_nonlinear(Strategy::ReturnBoostedRiskParity, moments, cost)
  }

  /// Maximizes `s · stability + (1 − s) · Sharpe`, `s` = configured
  /// `stability_weight`.
  pub fn stability(&self, moments: &Moments) -> Result<PortfolioResult> {
    let cost = StabilityCost {
      mean: moments.mean().clone(),
      cov: moments.cov().clone(),
      daily_vols: moments.daily_volatilities(),
      risk_free: self.config().risk_free_rate,
      stability_weight: self.config().stability_weight,
    };
    self.solve_nonlinear(Strategy::Stability, moments, cost)
  }

  pub fn hierarchical_risk_parity(&self, moments: &Moments) -> Result<PortfolioResult> {
    let strategy = Strategy::HierarchicalRiskParity;
    let weights = hrp_weights(moments)?;
    Ok(optimal_result(
      moments,
      weights,
      self.config().risk_free_rate,
      strategy.name(),
    ))
  }

  pub fn run_strategy(&self, strategy: Strategy, moments: &Moments) -> Result<PortfolioResult> {
    match strategy {
      Strategy::MaxSharpe => Ok(self.optimizer.maximize_sharpe(moments)),
      Strategy::RiskParity => self.risk_parity(moments),
      Strategy::Stability => self.stability(moments),
      Strategy::HierarchicalRiskParity => self.hierarchical_risk_parity(moments),
      Strategy::ReturnBoostedRiskParity => self.return_boosted_risk_parity(moments),
    }
  }

  /// Run `strategies` in parallel; errors only when every one of them failed.
  pub fn optimize_strategies(
    &self,
    strategies: &[Strategy],
    moments: &Moments,
  ) -> Result<StrategyReport> {
    let results: BTreeMap<Strategy, Result<PortfolioResult>> = strategies
      .par_iter()
      .map(|&strategy| (strategy, self.run_strategy(strategy, moments)))
      .collect();
    let report = StrategyReport { results };

    for (strategy, err) in report.failed() {
      warn!(%strategy, error = %err, "strategy failed");
    }
    let succeeded = report.succeeded().count();
    if succeeded == 0 {
      return Err(PortfolioError::AllStrategiesFailed);
    }
    info!(
      succeeded,
      failed = report.results.len() - succeeded,
      "strategy comparison finished"
    );
    Ok(report)
  }

  /// All four strategies.
  pub fn optimize_all(&self, moments: &Moments) -> Result<StrategyReport> {
    self.optimize_strategies(&Strategy::ALL, moments)
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use nalgebra::dmatrix;
  use nalgebra::dvector;

  use super::*;

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

  fn runner() -> MultiObjectiveOptimizer {
    MultiObjectiveOptimizer::new(OptimizerConfig::default()).unwrap()
  }

  #[test]
  fn risk_parity_on_diagonal_covariance_is_inverse_volatility() {
    let moments = Moments::new(dvector![0.05, 0.05], dmatrix![0.04, 0.0; 0.0, 0.01], 252).unwrap();
    let result = runner().risk_parity(&moments).unwrap();
    assert!(!result.is_fallback());
    assert_abs_diff_eq!(result.weights[0], 1.0 / 3.0, epsilon = 1e-3);
    assert_abs_diff_eq!(result.weights[1], 2.0 / 3.0, epsilon = 1e-3);
  }

  #[test]
  fn risk_contributions_are_equalized() {
    let moments = three_assets();
    let w = runner().risk_parity(&moments).unwrap().weights;
    let sigma_w = moments.cov() * &w;
    let var = moments.portfolio_variance(&w);
    for i in 0..3 {
      assert_abs_diff_eq!(w[i] * sigma_w[i] / var, 1.0 / 3.0, epsilon = 1e-3);
    }
  }

  #[test]
  fn return_boost_tilts_risk_parity_toward_return() {
    let moments = three_assets();
    let plain = runner().risk_parity(&moments).unwrap();
    let boosted = runner().return_boosted_risk_parity(&moments).unwrap();
    assert!(!boosted.is_fallback());
    assert_eq!(boosted.solver, "return_boosted_risk_parity");
    assert!(boosted.metrics.expected_return > plain.metrics.expected_return);
    assert_abs_diff_eq!(boosted.weights.sum(), 1.0, epsilon = 1e-6);

    let unboosted = MultiObjectiveOptimizer::new(OptimizerConfig {
      return_boost: 0.0,
      ..Default::default()
    })
    .unwrap()
    .return_boosted_risk_parity(&moments)
    .unwrap();
    assert_abs_diff_eq!(unboosted.weights, plain.weights, epsilon = 1e-9);
  }

  #[test]
  fn boosted_risk_parity_is_opt_in() {
    assert!(!Strategy::ALL.contains(&Strategy::ReturnBoostedRiskParity));
    let report = runner()
      .optimize_strategies(
        &[Strategy::RiskParity, Strategy::ReturnBoostedRiskParity],
        &three_assets(),
      )
      .unwrap();
    assert_eq!(report.succeeded().count(), 2);
  }

  #[test]
  fn stability_weight_trades_sharpe_for_lower_volatility() {
    let moments = three_assets();
    let sharpe_only = MultiObjectiveOptimizer::new(OptimizerConfig {
      stability_weight: 0.0,
      ..Default::default()
    })
    .unwrap()
    .stability(&moments)
    .unwrap();
    let blended = runner().stability(&moments).unwrap();

    assert_abs_diff_eq!(sharpe_only.metrics.sharpe_ratio, 0.43003, epsilon = 1e-4);
    assert!(blended.metrics.sharpe_ratio <= sharpe_only.metrics.sharpe_ratio + 1e-9);
    let daily = moments.daily_volatilities();
    assert!(blended.weights.dot(&daily) <= sharpe_only.weights.dot(&daily) + 1e-9);
  }

  #[test]
  fn all_strategies_produce_simplex_weights() {
    let report = runner().optimize_all(&three_assets()).unwrap();
    assert_eq!(report.results.len(), 4);
    for (strategy, result) in report.succeeded() {
      assert_abs_diff_eq!(result.weights.sum(), 1.0, epsilon = 1e-6);
      assert!(result.weights.min() >= -1e-8, "{strategy}");
    }
    let (best, _) = report.best_by_sharpe().unwrap();
    assert_eq!(best, Strategy::MaxSharpe);
  }

  #[test]
  fn failing_strategy_is_isolated() {
    // zero-variance asset: HRP is undefined, max-Sharpe falls back
    let moments = Moments::new(dvector![0.1, 0.02], dmatrix![0.04, 0.0; 0.0, 0.0], 252).unwrap();
    let report = runner().optimize_all(&moments).unwrap();

    assert!(matches!(
      report.get(Strategy::HierarchicalRiskParity),
      Some(Err(PortfolioError::Strategy { .. }))
    ));
    assert!(matches!(report.get(Strategy::MaxSharpe), Some(Ok(_))));
    assert_eq!(report.failed().count(), 1);
  }

  #[test]
  fn every_strategy_failing_is_an_error() {
    let moments = Moments::new(dvector![0.1, 0.02], dmatrix![0.04, 0.0; 0.0, 0.0], 252).unwrap();
    let err = runner()
      .optimize_strategies(&[Strategy::HierarchicalRiskParity], &moments)
      .unwrap_err();
    assert_eq!(err, PortfolioError::AllStrategiesFailed);
  }
}
