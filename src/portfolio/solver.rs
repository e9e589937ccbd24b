//! # Solver Backends
//!
//! $$
//! \min_{\mathbf{w}\in\Delta^{n-1}} f(\mathbf{w}),\qquad
//! \Delta^{n-1}=\{\mathbf{w}\ge 0,\ \mathbf{1}^\top\mathbf{w}=1\}
//! $$
//!
//! Strategy interface over the numerical engines used by the optimizer, plus
//! the weight post-processing shared by every engine.

pub mod admm;
pub mod nelder_mead;

use std::fmt::Debug;

use impl_new_derive::ImplNew;
use nalgebra::DVector;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::portfolio::moments::Moments;

pub use admm::ConvexBackend;
pub use nelder_mead::NelderMeadBackend;

/// Which numerical backend an optimizer should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolverKind {
  /// General nonlinear solver (Nelder–Mead over a softmax parametrisation).
  #[serde(rename = "nonlinear", alias = "nelder_mead")]
  NelderMead,
  /// Convex QP solver (ADMM operator splitting).
  #[serde(rename = "convex", alias = "admm")]
  Convex,
}

impl SolverKind {
  pub fn name(self) -> &'static str {
    match self {
      SolverKind::NelderMead => nelder_mead::NAME,
      SolverKind::Convex => admm::NAME,
    }
  }
}

/// Iteration cap and tolerance handed to a backend.
#[derive(ImplNew, Debug, Clone, Copy, PartialEq)]
pub struct SolverSettings {
  /// Hard iteration cap; doubles as a deterministic timeout.
  pub max_iters: u64,
  /// Convergence tolerance.
  pub tolerance: f64,
}

impl Default for SolverSettings {
  fn default() -> Self {
    Self {
      max_iters: 50_000,
      tolerance: 1e-9,
    }
  }
}

/// Numerical engine behind the max-Sharpe and min-variance problems.
///
/// Implementations receive validated, non-singular moments with at least two
/// assets and, for `max_sharpe`, at least one asset above the risk-free rate.
/// Return targets passed to `min_variance` lie inside `[min μ, max μ]`.
pub trait SolverBackend: Send + Sync + Debug {
  /// Short identifier used in logs and results.
  fn name(&self) -> &'static str;

  /// Long-only, fully invested weights maximizing the Sharpe ratio.
  fn max_sharpe(&self, moments: &Moments, risk_free: f64) -> Result<DVector<f64>>;

  /// Long-only, fully invested minimum-variance weights, optionally at an
  /// exact expected return.
  fn min_variance(&self, moments: &Moments, target: Option<f64>) -> Result<DVector<f64>>;
}

/// Instantiate the backend selected in configuration.
pub fn build_backend(kind: SolverKind, settings: SolverSettings) -> Box<dyn SolverBackend> {
  match kind {
    SolverKind::NelderMead => Box::new(NelderMeadBackend::new(settings)),
    SolverKind::Convex => Box::new(ConvexBackend::new(settings)),
  }
}

/// Equal-weight portfolio, the universal fallback.
pub fn equal_weights(n: usize) -> DVector<f64> {
  DVector::from_element(n, 1.0 / n.max(1) as f64)
}

/// Map unconstrained parameters onto the simplex.
pub(crate) fn softmax(x: &[f64]) -> DVector<f64> {
  let x = DVector::from_column_slice(x);
  if x.is_empty() {
    return x;
  }

  let shifted = x.add_scalar(-x.max()).map(f64::exp);
  let total = shifted.sum();
  if total.is_finite() && total >= 1e-15 {
    shifted / total
  } else {
    equal_weights(x.len())
  }
}

/// Clip round-off negatives and renormalise onto the simplex.
pub(crate) fn clean_weights(raw: &DVector<f64>) -> Result<DVector<f64>> {
  if raw.iter().any(|v| !v.is_finite()) {
    return Err(PortfolioError::Solver("solver returned non-finite weights".into()));
  }
  let clipped = raw.map(|v| v.max(0.0));
  let total = clipped.sum();
  if total < 1e-15 {
    return Err(PortfolioError::Solver("solver returned an all-zero weight vector".into()));
  }
  Ok(clipped / total)
}

/// Blend `w` with the highest (or lowest) return asset so that `wᵀμ = target`.
///
/// The blend stays on the simplex and moves the weights by the size of the
/// residual only.
pub(crate) fn repair_target(w: &DVector<f64>, mean: &DVector<f64>, target: f64) -> DVector<f64> {
  let achieved = w.dot(mean);
  let gap = target - achieved;
  if gap.abs() <= 1e-14 {
    return w.clone();
  }

  let k = if gap > 0.0 { mean.imax() } else { mean.imin() };
  let denom = mean[k] - achieved;
  if denom.abs() < 1e-15 {
    return w.clone();
  }

  let theta = (gap / denom).clamp(0.0, 1.0);
  let mut repaired = w * (1.0 - theta);
  repaired[k] += theta;
  repaired
}
