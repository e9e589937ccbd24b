//! # Convex Backend
//!
//! $$
//! \min_{\mathbf{x}} \tfrac12\mathbf{x}^\top P\mathbf{x}+\mathbf{q}^\top\mathbf{x}
//! \quad\text{s.t.}\quad \mathbf{l}\le C\mathbf{x}\le\mathbf{u}
//! $$
//!
//! Operator-splitting (ADMM) QP solver with a cached Cholesky factor of the
//! regularised KKT system and residual-balanced step size.

use impl_new_derive::ImplNew;
use nalgebra::Cholesky;
use nalgebra::DMatrix;
use nalgebra::DVector;
use nalgebra::Dyn;
use tracing::debug;

use super::SolverBackend;
use super::SolverSettings;
use super::clean_weights;
use super::repair_target;
use crate::error::PortfolioError;
use crate::error::Result;
use crate::portfolio::moments::Moments;

pub(crate) const NAME: &str = "convex";

const SIGMA: f64 = 1e-6;
const ALPHA: f64 = 1.6;
const RHO_INIT: f64 = 0.1;
const RHO_MIN: f64 = 1e-6;
const RHO_MAX: f64 = 1e6;
/// Step-size multiplier on equality rows.
const RHO_EQ_SCALE: f64 = 1e3;
const CHECK_EVERY: u64 = 10;
const ADAPT_EVERY: u64 = 50;
/// Refactor only when the step size moves by more than this factor.
const ADAPT_THRESHOLD: f64 = 5.0;

/// `min ½xᵀPx + qᵀx` subject to `l ≤ Cx ≤ u`.
#[derive(ImplNew, Clone, Debug)]
pub struct QuadraticProgram {
  pub p: DMatrix<f64>,
  pub q: DVector<f64>,
  pub c: DMatrix<f64>,
  pub lower: DVector<f64>,
  pub upper: DVector<f64>,
}

/// Primal solution and the iteration at which it satisfied the tolerances.
#[derive(Clone, Debug)]
pub struct QpSolution {
  pub x: DVector<f64>,
  pub iterations: u64,
}

impl QuadraticProgram {
  fn check(&self) -> Result<()> {
    let n = self.p.nrows();
    let m = self.c.nrows();
    if self.p.ncols() != n || self.q.len() != n || self.c.ncols() != n {
      return Err(PortfolioError::DimensionMismatch {
        context: "quadratic program variables",
        expected: n,
        found: self.c.ncols(),
      });
    }
    if self.lower.len() != m || self.upper.len() != m {
      return Err(PortfolioError::DimensionMismatch {
        context: "quadratic program bounds",
        expected: m,
        found: self.lower.len(),
      });
    }
    if self.lower.iter().zip(self.upper.iter()).any(|(l, u)| l > u) {
      return Err(PortfolioError::Solver("lower bound above upper bound".into()));
    }
    Ok(())
  }

  fn step_sizes(&self, rho: f64) -> DVector<f64> {
    DVector::from_iterator(
      self.lower.len(),
      self
        .lower
        .iter()
        .zip(self.upper.iter())
        .map(|(l, u)| if (u - l).abs() < 1e-12 { rho * RHO_EQ_SCALE } else { rho }),
    )
  }

  fn factor(&self, rho_vec: &DVector<f64>) -> Result<Cholesky<f64, Dyn>> {
    let n = self.p.nrows();
    let kkt = &self.p
      + DMatrix::<f64>::identity(n, n) * SIGMA
      + self.c.transpose() * DMatrix::from_diagonal(rho_vec) * &self.c;
    Cholesky::new(kkt).ok_or_else(|| {
      PortfolioError::Solver("regularised KKT matrix is not positive definite".into())
    })
  }

  /// Solve with ADMM; `NotConverged` once `settings.max_iters` is spent.
  pub fn solve(&self, settings: &SolverSettings) -> Result<QpSolution> {
    self.check()?;
    let n = self.p.nrows();
    let m = self.c.nrows();
    let eps_abs = settings.tolerance;
    let eps_rel = settings.tolerance;

    let mut x = DVector::<f64>::zeros(n);
    let mut z = DVector::<f64>::zeros(m);
    let mut y = DVector::<f64>::zeros(m);
    let mut rho = RHO_INIT;
    let mut rho_vec = self.step_sizes(rho);
    let mut chol = self.factor(&rho_vec)?;
    let ct = self.c.transpose();

    for k in 1..=settings.max_iters {
      let rhs = &x * SIGMA - &self.q + &ct * (rho_vec.component_mul(&z) - &y);
      let x_tilde = chol.solve(&rhs);
      let z_tilde = &self.c * &x_tilde;

      let x_next = &x_tilde * ALPHA + &x * (1.0 - ALPHA);
      let z_relaxed = &z_tilde * ALPHA + &z * (1.0 - ALPHA);
      let z_next = (&z_relaxed + y.component_div(&rho_vec))
        .zip_zip_map(&self.lower, &self.upper, |v, l, u| v.clamp(l, u));
      y += rho_vec.component_mul(&(&z_relaxed - &z_next));
      x = x_next;
      z = z_next;

      if k % CHECK_EVERY != 0 {
        continue;
      }

      let cx = &self.c * &x;
      let px = &self.p * &x;
      let cty = &ct * &y;
      let prim = (&cx - &z).amax();
      let dual = (&px + &self.q + &cty).amax();
      let prim_scale = cx.amax().max(z.amax());
      let dual_scale = px.amax().max(cty.amax()).max(self.q.amax());

      if prim <= eps_abs + eps_rel * prim_scale && dual <= eps_abs + eps_rel * dual_scale {
        return Ok(QpSolution { x, iterations: k });
      }

      if k % ADAPT_EVERY == 0 {
        let prim_norm = prim / prim_scale.max(1e-30);
        let dual_norm = dual / dual_scale.max(1e-30);
        let proposed = (rho * (prim_norm / dual_norm.max(1e-30)).sqrt()).clamp(RHO_MIN, RHO_MAX);
        if proposed > rho * ADAPT_THRESHOLD || proposed < rho / ADAPT_THRESHOLD {
          debug!(iteration = k, from = rho, to = proposed, "ADMM step size adapted");
          rho = proposed;
          rho_vec = self.step_sizes(rho);
          chol = self.factor(&rho_vec)?;
        }
      }
    }

    Err(PortfolioError::NotConverged {
      backend: NAME,
      iterations: settings.max_iters,
    })
  }
}

/// Convex-programming backend.
#[derive(ImplNew, Debug, Clone)]
pub struct ConvexBackend {
  pub settings: SolverSettings,
}

impl SolverBackend for ConvexBackend {
  fn name(&self) -> &'static str {
    NAME
  }

  /// Homogenised tangency problem `min yᵀΣy s.t. (μ − r_f)ᵀy / e = 1, y ≥ 0`
  /// with `e = max(μ − r_f)`, scaled back with `w = y / 1ᵀy`.
  ///
  /// Dividing the constraint row by `e` keeps `y` of unit order however small
  /// the excess returns are; `w` does not depend on the row scale.
  fn max_sharpe(&self, moments: &Moments, risk_free: f64) -> Result<DVector<f64>> {
    let n = moments.n_assets();
    let excess = moments.mean().add_scalar(-risk_free);
    if excess.max() <= 0.0 {
      return Err(PortfolioError::Solver(
        "tangency problem infeasible: no positive excess return".into(),
      ));
    }

    let scaled = &excess / excess.max();
    let mut c = DMatrix::<f64>::zeros(n + 1, n);
    c.row_mut(0).copy_from(&scaled.transpose());
    c.view_mut((1, 0), (n, n)).fill_with_identity();
    let mut lower = DVector::<f64>::zeros(n + 1);
    let mut upper = DVector::<f64>::from_element(n + 1, f64::INFINITY);
    lower[0] = 1.0;
    upper[0] = 1.0;

    let qp = QuadraticProgram::new(moments.cov() * 2.0, DVector::zeros(n), c, lower, upper);
    let solution = qp.solve(&self.settings)?;
    debug!(
      backend = NAME,
      iterations = solution.iterations,
      "max-Sharpe solve finished"
    );
    clean_weights(&solution.x)
  }

  fn min_variance(&self, moments: &Moments, target: Option<f64>) -> Result<DVector<f64>> {
    let n = moments.n_assets();
    let offset = if target.is_some() { 2 } else { 1 };
    let m = offset + n;

    let mut c = DMatrix::<f64>::zeros(m, n);
    let mut lower = DVector::<f64>::zeros(m);
    let mut upper = DVector::<f64>::from_element(m, 1.0);
    c.row_mut(0).fill(1.0);
    lower[0] = 1.0;
    if let Some(target) = target {
      c.row_mut(1).copy_from(&moments.mean().transpose());
      lower[1] = target;
      upper[1] = target;
    }
    c.view_mut((offset, 0), (n, n)).fill_with_identity();

    let qp = QuadraticProgram::new(moments.cov() * 2.0, DVector::zeros(n), c, lower, upper);
    let solution = qp.solve(&self.settings)?;
    debug!(
      backend = NAME,
      iterations = solution.iterations,
      target_return = ?target,
      "min-variance solve finished"
    );

    let w = clean_weights(&solution.x)?;
    Ok(match target {
      Some(target) => repair_target(&w, moments.mean(), target),
      None => w,
    })
  }
}
