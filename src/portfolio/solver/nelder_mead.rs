//! # Nelder–Mead Backend
//!
//! $$
//! \mathbf{w}=\operatorname{softmax}(\mathbf{x}),\qquad
//! \mathcal{L}_\rho(\mathbf{x},\lambda)=\mathbf{w}^\top\Sigma\mathbf{w}
//! +\lambda g(\mathbf{w})+\tfrac{\rho}{2}g(\mathbf{w})^2
//! $$
//!
//! Derivative-free backend on unconstrained softmax parameters. Return
//! targets are handled by an augmented-Lagrangian outer loop.

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::core::State;
use argmin::core::TerminationReason;
use argmin::solver::neldermead::NelderMead;
use impl_new_derive::ImplNew;
use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use super::SolverBackend;
use super::SolverSettings;
use super::clean_weights;
use super::repair_target;
use super::softmax;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::portfolio::moments::Moments;

pub(crate) const NAME: &str = "nonlinear";

/// Cost returned for parameters the objective cannot evaluate.
const INFEASIBLE_COST: f64 = 1e10;
const AL_MAX_OUTER: usize = 25;
const AL_RHO_INIT: f64 = 100.0;
const AL_RHO_GROWTH: f64 = 5.0;
const AL_RHO_MAX: f64 = 1e9;
const AL_FEASIBILITY_TOL: f64 = 1e-8;

/// Simplex of `n + 1` vertices: `x0` and `x0 + e_i`.
fn initial_simplex(x0: &[f64]) -> Vec<Vec<f64>> {
  let mut simplex = Vec::with_capacity(x0.len() + 1);
  simplex.push(x0.to_vec());
  for i in 0..x0.len() {
    let mut point = x0.to_vec();
    point[i] += 1.0;
    simplex.push(point);
  }
  simplex
}

/// Run Nelder–Mead from `x0` and return the best parameters and the
/// iteration count.
///
/// Hitting `settings.max_iters` is an error: the simplex never shrank below
/// the tolerance.
pub(crate) fn minimize_on_simplex<C>(
  cost: C,
  x0: Vec<f64>,
  settings: &SolverSettings,
) -> Result<(Vec<f64>, u64)>
where
  C: CostFunction<Param = Vec<f64>, Output = f64>,
{
  let solver = NelderMead::new(initial_simplex(&x0))
    .with_sd_tolerance(settings.tolerance)
    .map_err(|e| PortfolioError::Solver(e.to_string()))?;

  let res = Executor::new(cost, solver)
    .configure(|state| state.max_iters(settings.max_iters))
    .run()
    .map_err(|e| PortfolioError::Solver(e.to_string()))?;

  let iterations = res.state.get_iter();
  if let Some(TerminationReason::MaxItersReached) = res.state.get_termination_reason() {
    return Err(PortfolioError::NotConverged {
      backend: NAME,
      iterations,
    });
  }

  let best = res
    .state
    .best_param
    .ok_or_else(|| PortfolioError::Solver("Nelder-Mead returned no parameters".into()))?;
  Ok((best, iterations))
}

fn quad_form(cov: &DMatrix<f64>, w: &DVector<f64>) -> f64 {
  w.dot(&(cov * w))
}

/// Negative Sharpe ratio of `softmax(x)`.
struct NegativeSharpeCost {
  excess: DVector<f64>,
  cov: DMatrix<f64>,
}

impl CostFunction for NegativeSharpeCost {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let w = softmax(x);
    let var = quad_form(&self.cov, &w);
    if !var.is_finite() || var < 1e-30 {
      return Ok(INFEASIBLE_COST);
    }
    Ok(-w.dot(&self.excess) / var.sqrt())
  }
}

/// Portfolio variance with an augmented-Lagrangian return penalty.
struct VarianceCost {
  mean: DVector<f64>,
  cov: DMatrix<f64>,
  target: Option<f64>,
  lambda: f64,
  rho: f64,
}

impl CostFunction for VarianceCost {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let w = softmax(x);
    let mut value = quad_form(&self.cov, &w);
    if let Some(target) = self.target {
      let g = w.dot(&self.mean) - target;
      value += self.lambda * g + 0.5 * self.rho * g * g;
    }
    if value.is_finite() {
      Ok(value)
    } else {
      Ok(INFEASIBLE_COST)
    }
  }
}

/// General nonlinear backend seeded from the equal-weight portfolio.
#[derive(ImplNew, Debug, Clone)]
pub struct NelderMeadBackend {
  pub settings: SolverSettings,
}

impl SolverBackend for NelderMeadBackend {
  fn name(&self) -> &'static str {
    NAME
  }

  fn max_sharpe(&self, moments: &Moments, risk_free: f64) -> Result<DVector<f64>> {
    let n = moments.n_assets();
    let cost = NegativeSharpeCost {
      excess: moments.mean().add_scalar(-risk_free),
      cov: moments.cov().clone(),
    };

    let (best, iterations) = minimize_on_simplex(cost, vec![0.0; n], &self.settings)?;
    debug!(backend = NAME, iterations, "max-Sharpe solve finished");
    clean_weights(&softmax(&best))
  }

  fn min_variance(&self, moments: &Moments, target: Option<f64>) -> Result<DVector<f64>> {
    let n = moments.n_assets();
    let mut cost = VarianceCost {
      mean: moments.mean().clone(),
      cov: moments.cov().clone(),
      target,
      lambda: 0.0,
      rho: AL_RHO_INIT,
    };

    let Some(target) = target else {
      let (best, iterations) = minimize_on_simplex(cost, vec![0.0; n], &self.settings)?;
      debug!(backend = NAME, iterations, "min-variance solve finished");
      return clean_weights(&softmax(&best));
    };

    let mut x = vec![0.0; n];
    let mut total_iterations = 0;
    let mut last_violation = f64::INFINITY;

    for outer in 0..AL_MAX_OUTER {
      let lambda = cost.lambda;
      let rho = cost.rho;
      let (best, iterations) = minimize_on_simplex(cost, x, &self.settings)?;
      total_iterations += iterations;
      x = best;

      let g = softmax(&x).dot(moments.mean()) - target;
      debug!(outer, violation = g, lambda, rho, "augmented Lagrangian step");
      if g.abs() <= AL_FEASIBILITY_TOL {
        break;
      }

      let next_rho = if g.abs() > 0.25 * last_violation {
        (rho * AL_RHO_GROWTH).min(AL_RHO_MAX)
      } else {
        rho
      };
      last_violation = g.abs();
      cost = VarianceCost {
        mean: moments.mean().clone(),
        cov: moments.cov().clone(),
        target: Some(target),
        lambda: lambda + rho * g,
        rho: next_rho,
      };
    }

    debug!(
      backend = NAME,
      iterations = total_iterations,
      target_return = target,
      "targeted min-variance solve finished"
    );
    let w = clean_weights(&softmax(&x))?;
    Ok(repair_target(&w, moments.mean(), target))
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

  #[test]
  fn max_sharpe_matches_tangency_portfolio() {
    let backend = NelderMeadBackend::new(SolverSettings::default());
    let moments = three_assets();
    let w = backend.max_sharpe(&moments, 0.02).unwrap();

    assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
    let sharpe = (moments.portfolio_return(&w) - 0.02) / moments.portfolio_volatility(&w);
    assert_abs_diff_eq!(sharpe, 0.43003, epsilon = 1e-4);
    assert_abs_diff_eq!(w[0], 0.5359, epsilon = 2e-3);
  }

  #[test]
  fn targeted_min_variance_meets_return_exactly() {
    let backend = NelderMeadBackend::new(SolverSettings::default());
    let moments = three_assets();
    let w = backend.min_variance(&moments, Some(0.10)).unwrap();

    assert_abs_diff_eq!(moments.portfolio_return(&w), 0.10, epsilon = 1e-12);
    assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
    assert!(w.min() >= 0.0);
  }

  #[test]
  fn hitting_iteration_cap_is_not_converged() {
    let backend = NelderMeadBackend::new(SolverSettings::new(3, 1e-12));
    let err = backend.max_sharpe(&three_assets(), 0.02).unwrap_err();
    assert_eq!(
      err,
      PortfolioError::NotConverged {
        backend: NAME,
        iterations: 3
      }
    );
  }
}
