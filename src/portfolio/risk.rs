//! # Risk-Constrained Max-Sharpe
//!
//! $$
//! \max_{\mathbf{w}\in\Delta^{n-1}} \frac{\mathbf{w}^\top\mu-r_f}{\sigma_p(\mathbf{w})}
//! \quad\text{s.t.}\quad \sigma_p(\mathbf{w})\le\bar\sigma
//! $$
//!
//! The volatility cap is solved on the efficient frontier. The drawdown
//! ceiling is path dependent: it is checked by back-testing the weights and
//! the cap is tightened on breach.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::data::ReturnSeries;
use super::moments::Moments;
use super::optimizer::PortfolioOptimizer;
use super::optimizer::optimal_result;
use super::types::PortfolioResult;
use super::types::RiskConstrainedResult;
use crate::config::OptimizerConfig;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::evaluation::max_drawdown;

const BISECTION_STEPS: usize = 60;
const BISECTION_TOL: f64 = 1e-10;

/// Capped solve plus whether the cap could be met at all.
#[derive(Clone, Debug)]
pub struct CappedSolve {
  pub result: PortfolioResult,
  pub cap_met: bool,
}

impl PortfolioOptimizer {
  /// Highest-Sharpe portfolio with volatility at most `max_volatility`.
  ///
  /// When even the global minimum-variance portfolio exceeds the cap, that
  /// portfolio is returned with `cap_met = false`.
  pub fn maximize_sharpe_with_volatility_cap(
    &self,
    moments: &Moments,
    max_volatility: f64,
  ) -> Result<CappedSolve> {
    if !max_volatility.is_finite() || max_volatility <= 0.0 {
      return Err(PortfolioError::invalid(
        "max_volatility",
        max_volatility,
        "must be positive",
      ));
    }

    let tangency = self.maximize_sharpe(moments);
    if tangency.metrics.volatility <= max_volatility {
      return Ok(CappedSolve {
        result: tangency,
        cap_met: true,
      });
    }

    let anchor = self.min_variance_portfolio(moments)?;
    if anchor.metrics.volatility > max_volatility {
      warn!(
        max_volatility,
        min_volatility = anchor.metrics.volatility,
        "volatility cap below the minimum-variance portfolio"
      );
      return Ok(CappedSolve {
        result: anchor,
        cap_met: false,
      });
    }

    // Sharpe rises along the frontier up to the tangency return
    let mut lo = anchor.metrics.expected_return;
    let mut hi = if tangency.is_fallback() {
      moments.mean().max()
    } else {
      tangency.metrics.expected_return
    };
    let mut best: DVector<f64> = anchor.weights.clone();

    for _ in 0..BISECTION_STEPS {
      if hi - lo <= BISECTION_TOL {
        break;
      }
      let mid = 0.5 * (lo + hi);
      match self.minimize_variance(moments, mid) {
        Ok((weights, volatility)) if volatility <= max_volatility => {
          lo = mid;
          best = weights;
        }
        Ok(_) => hi = mid,
        Err(err) => {
          debug!(target_return = mid, error = %err, "bisection step failed");
          hi = mid;
        }
      }
    }

    let result = optimal_result(
      moments,
      best,
      self.config().risk_free_rate,
      self.backend_name(),
    );
    debug!(
      max_volatility,
      volatility = result.metrics.volatility,
      sharpe = result.metrics.sharpe_ratio,
      "volatility cap enforced"
    );
    Ok(CappedSolve {
      result,
      cap_met: true,
    })
  }

  /// Risk-constrained max-Sharpe with the configured caps.
  pub fn maximize_sharpe_with_risk_constraint(
    &self,
    moments: &Moments,
    returns: &ReturnSeries,
  ) -> Result<RiskConstrainedResult> {
    self.maximize_sharpe_with_limits(
      moments,
      returns,
      self.config().max_volatility,
      self.config().max_drawdown,
    )
  }

  /// Max-Sharpe under `max_volatility`, re-solved with a tighter cap while
  /// the back-tested drawdown on `returns` exceeds `max_drawdown`.
  ///
  /// Exhausting the retries is not an error: the attempt with the smallest
  /// drawdown is returned with `drawdown_met = false`.
  pub fn maximize_sharpe_with_limits(
    &self,
    moments: &Moments,
    returns: &ReturnSeries,
    max_volatility: f64,
    max_drawdown_limit: f64,
  ) -> Result<RiskConstrainedResult> {
    if !(max_drawdown_limit > 0.0 && max_drawdown_limit <= 1.0) {
      return Err(PortfolioError::invalid(
        "max_drawdown",
        max_drawdown_limit,
        "must lie in (0, 1]",
      ));
    }
    if returns.n_assets() != moments.n_assets() {
      return Err(PortfolioError::DimensionMismatch {
        context: "return series vs moments",
        expected: moments.n_assets(),
        found: returns.n_assets(),
      });
    }

    let retries = self.config().drawdown_retries;
    let shrink = self.config().volatility_shrink;
    let mut cap = max_volatility;
    let mut best: Option<(PortfolioResult, f64, f64)> = None;
    let mut volatility_caps = Vec::with_capacity(retries + 1);

    for attempt in 0..=retries {
      volatility_caps.push(cap);
      let solve = self.maximize_sharpe_with_volatility_cap(moments, cap)?;
      let path = returns.portfolio_returns(&solve.result.weights)?;
      let drawdown = max_drawdown(path.view());
      debug!(attempt, cap, drawdown, "drawdown back-test");

      let volatility = solve.result.metrics.volatility;
      if best.as_ref().map_or(true, |(_, dd, _)| drawdown < *dd) {
        best = Some((solve.result, drawdown, cap));
      }

      if drawdown <= max_drawdown_limit {
        break;
      }
      if !solve.cap_met {
        // already at minimum variance; a tighter cap changes nothing
        break;
      }
      cap = cap.min(volatility) * shrink;
    }

    let Some((result, realized_drawdown, final_volatility_cap)) = best else {
      return Err(PortfolioError::Solver("no risk-constrained attempt was made".into()));
    };
    let drawdown_met = realized_drawdown <= max_drawdown_limit;
    let attempts = volatility_caps.len();
    if drawdown_met {
      info!(
        attempts,
        realized_drawdown,
        final_volatility_cap,
        "risk-constrained portfolio found"
      );
    } else {
      warn!(
        attempts,
        realized_drawdown,
        max_drawdown = max_drawdown_limit,
        "drawdown target not met, returning best effort"
      );
    }

    Ok(RiskConstrainedResult {
      volatility_cap_met: result.metrics.volatility <= max_volatility,
      drawdown_met,
      realized_drawdown,
      final_volatility_cap,
      attempts,
      volatility_caps,
      result,
    })
  }
}

/// Risk-constrained max-Sharpe on annualized moments, back-tested on `returns`.
pub fn maximize_sharpe_with_risk_constraint(
  mean: &DVector<f64>,
  cov: &DMatrix<f64>,
  risk_free_rate: f64,
  max_volatility: f64,
  max_drawdown: f64,
  returns: &ReturnSeries,
) -> Result<RiskConstrainedResult> {
  let optimizer = PortfolioOptimizer::new(OptimizerConfig {
    risk_free_rate,
    max_volatility,
    max_drawdown,
    ..Default::default()
  })?;
  let moments = Moments::new(mean.clone(), cov.clone(), optimizer.config().trading_days)?;
  optimizer.maximize_sharpe_with_risk_constraint(&moments, returns)
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use nalgebra::dmatrix;
  use nalgebra::dvector;
  use ndarray::Array2;

  use super::*;
  use crate::portfolio::moments::compute_moments;

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

  /// Deterministic cyclical daily returns for three assets.
  fn synthetic_series(days: usize) -> ReturnSeries {
    let drift = [0.0003, 0.0004, 0.0006];
    let amp = [0.008, 0.012, 0.02];
    let freq = [0.31, 0.17, 0.23];
    let values = Array2::from_shape_fn((days, 3), |(t, i)| {
      let t = t as f64;
      drift[i] + amp[i] * (freq[i] * t + i as f64).sin() + 0.002 * (1.3 * t).cos()
    });
    ReturnSeries::from_matrix(vec!["A".into(), "B".into(), "C".into()], values).unwrap()
  }

  fn optimizer() -> PortfolioOptimizer {
    PortfolioOptimizer::new(OptimizerConfig::default()).unwrap()
  }

  #[test]
  fn binding_cap_is_respected() {
    let opt = optimizer();
    let moments = three_assets();
    let unconstrained = opt.maximize_sharpe(&moments);
    assert!(unconstrained.metrics.volatility > 0.169);

    let capped = opt.maximize_sharpe_with_volatility_cap(&moments, 0.169).unwrap();
    assert!(capped.cap_met);
    assert!(capped.result.metrics.volatility <= 0.169 + 1e-4);
    assert_abs_diff_eq!(capped.result.metrics.volatility, 0.169, epsilon = 1e-4);
    assert!(capped.result.metrics.sharpe_ratio <= unconstrained.metrics.sharpe_ratio);
    assert_abs_diff_eq!(capped.result.weights.sum(), 1.0, epsilon = 1e-6);
  }

  #[test]
  fn slack_cap_returns_tangency() {
    let opt = optimizer();
    let moments = three_assets();
    let capped = opt.maximize_sharpe_with_volatility_cap(&moments, 0.5).unwrap();
    assert_eq!(capped.result.weights, opt.maximize_sharpe(&moments).weights);
  }

  #[test]
  fn unattainable_cap_returns_min_variance() {
    let opt = optimizer();
    let capped = opt.maximize_sharpe_with_volatility_cap(&three_assets(), 0.10).unwrap();
    assert!(!capped.cap_met);
    assert_abs_diff_eq!(capped.result.metrics.volatility, 0.16703, epsilon = 1e-4);
  }

  #[test]
  fn loose_drawdown_target_needs_one_attempt() {
    let series = synthetic_series(500);
    let opt = optimizer();
    let moments = compute_moments(&series, 252).unwrap();

    let result = opt
      .maximize_sharpe_with_limits(&moments, &series, 1.0, 1.0)
      .unwrap();
    assert!(result.drawdown_met);
    assert!(result.volatility_cap_met);
    assert_eq!(result.attempts, 1);
  }

  /// Calm low-return asset next to a volatile high-return one.
  fn calm_and_volatile() -> (Moments, ReturnSeries) {
    let moments = Moments::new(
      dvector![0.03, 0.30],
      dmatrix![0.0025, 0.0; 0.0, 0.16],
      252,
    )
    .unwrap();
    let values = Array2::from_shape_fn((500, 2), |(t, i)| {
      let t = t as f64;
      match i {
        0 => 0.0002 + 0.003 * (0.31 * t).sin(),
        _ => 0.001 + 0.025 * (0.17 * t + 1.0).sin(),
      }
    });
    let series = ReturnSeries::from_matrix(vec!["CALM".into(), "WILD".into()], values).unwrap();
    (moments, series)
  }

  #[test]
  fn impossible_drawdown_target_returns_best_effort() {
    let (moments, series) = calm_and_volatile();
    let opt = optimizer();
    let config = opt.config().clone();
    let tangency = opt.maximize_sharpe(&moments).metrics.volatility;
    let floor = opt.min_variance_portfolio(&moments).unwrap().metrics.volatility;
    // every shrunken cap stays above the minimum-variance volatility
    assert!(floor < tangency * config.volatility_shrink.powi(config.drawdown_retries as i32));

    let result = opt
      .maximize_sharpe_with_limits(&moments, &series, 1.0, 1e-9)
      .unwrap();
    assert!(!result.drawdown_met);
    assert_eq!(result.attempts, config.drawdown_retries + 1);
    assert_eq!(result.attempts, 6);
    assert_eq!(result.volatility_caps.len(), 6);
    assert_eq!(result.volatility_caps[0], 1.0);
    assert_abs_diff_eq!(
      result.volatility_caps[1],
      tangency * config.volatility_shrink,
      epsilon = 1e-12
    );
    for pair in result.volatility_caps.windows(2).skip(1) {
      assert!(pair[1] <= pair[0] * config.volatility_shrink + 1e-12);
      assert!(pair[1] >= pair[0] * config.volatility_shrink - 1e-4);
    }
    assert!(result.final_volatility_cap < 1.0);
    assert!(result.volatility_caps.contains(&result.final_volatility_cap));
    assert!(result.realized_drawdown > 0.0);
    assert_abs_diff_eq!(result.result.weights.sum(), 1.0, epsilon = 1e-6);

    let path = series.portfolio_returns(&result.result.weights).unwrap();
    assert_abs_diff_eq!(
      max_drawdown(path.view()),
      result.realized_drawdown,
      epsilon = 1e-15
    );
  }

  #[test]
  fn unattainable_cap_stops_the_retries() {
    let series = synthetic_series(500);
    let opt = optimizer();
    let moments = compute_moments(&series, 252).unwrap();
    let floor = opt.min_variance_portfolio(&moments).unwrap().metrics.volatility;

    let result = opt
      .maximize_sharpe_with_limits(&moments, &series, 0.5 * floor, 1e-9)
      .unwrap();
    assert_eq!(result.attempts, 1);
    assert!(!result.volatility_cap_met);
    assert!(!result.drawdown_met);
  }

  #[test]
  fn free_function_applies_the_volatility_cap() {
    let series = synthetic_series(300);
    let moments = compute_moments(&series, 252).unwrap();
    let opt = optimizer();
    let tangency = opt.maximize_sharpe(&moments).metrics.volatility;
    let floor = opt.min_variance_portfolio(&moments).unwrap().metrics.volatility;
    let cap = 0.5 * (tangency + floor);

    let result = maximize_sharpe_with_risk_constraint(
      moments.mean(),
      moments.cov(),
      0.02,
      cap,
      1.0,
      &series,
    )
    .unwrap();
    assert!(result.volatility_cap_met);
    assert!(result.result.metrics.volatility <= cap + 1e-4);
    assert_eq!(result.attempts, 1);
  }

  #[test]
  fn invalid_limits_are_rejected() {
    let series = synthetic_series(50);
    let opt = optimizer();
    let moments = compute_moments(&series, 252).unwrap();
    assert!(matches!(
      opt.maximize_sharpe_with_limits(&moments, &series, 0.15, 0.0),
      Err(PortfolioError::InvalidParameter { .. })
    ));
    assert!(matches!(
      opt.maximize_sharpe_with_limits(&moments, &series, -0.1, 0.2),
      Err(PortfolioError::InvalidParameter { .. })
    ));
  }
}
