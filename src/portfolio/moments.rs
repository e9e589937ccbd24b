//! # Moments
//!
//! $$
//! \mu_i = T\,\bar r_i,\qquad
//! \Sigma_{ij} = \frac{T}{N-1}\sum_{t}(r_{t,i}-\bar r_i)(r_{t,j}-\bar r_j)
//! $$
//!
//! Annualized mean vector and covariance matrix of daily returns, plus the
//! portfolio-level quantities derived from them.

use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray::ArrayView2;
use ndarray::Axis;
use ndarray_stats::CorrelationExt;
use tracing::info;

use super::data::ReturnSeries;
use super::types::PortfolioMetrics;
use crate::error::PortfolioError;
use crate::error::Result;

/// Relative eigenvalue floor below which a covariance matrix is singular.
const SINGULAR_RTOL: f64 = 1e-10;

/// Sharpe ratio with the zero-volatility convention.
pub(crate) fn sharpe_ratio(expected_return: f64, volatility: f64, risk_free: f64) -> f64 {
  if volatility > 1e-15 {
    (expected_return - risk_free) / volatility
  } else {
    0.0
  }
}

/// Annualized first and second moments of a return series.
#[derive(Clone, Debug, PartialEq)]
pub struct Moments {
  mean: DVector<f64>,
  cov: DMatrix<f64>,
  trading_days: u32,
}

impl Moments {
  /// Wrap already annualized moments.
  ///
  /// The covariance must be square, finite, symmetric (up to round-off) and
  /// have a non-negative diagonal. It is symmetrised exactly.
  pub fn new(mean: DVector<f64>, cov: DMatrix<f64>, trading_days: u32) -> Result<Self> {
    if trading_days == 0 {
      return Err(PortfolioError::invalid(
        "trading_days",
        0.0,
        "must be positive",
      ));
    }
    let n = mean.len();
    if n == 0 {
      return Err(PortfolioError::DimensionMismatch {
        context: "asset count",
        expected: 1,
        found: 0,
      });
    }
    if cov.nrows() != n || cov.ncols() != n {
      return Err(PortfolioError::DimensionMismatch {
        context: "covariance vs mean vector",
        expected: n,
        found: cov.nrows().max(cov.ncols()),
      });
    }
    if mean.iter().chain(cov.iter()).any(|v| !v.is_finite()) {
      return Err(PortfolioError::InvalidData(
        "moments contain non-finite values".into(),
      ));
    }
    let scale = cov.amax().max(1e-300);
    if (&cov - cov.transpose()).amax() > 1e-8 * scale {
      return Err(PortfolioError::InvalidData(
        "covariance matrix is not symmetric".into(),
      ));
    }
    if cov.diagonal().iter().any(|&v| v < 0.0) {
      return Err(PortfolioError::InvalidData(
        "covariance matrix has a negative variance".into(),
      ));
    }

    let cov = (&cov + cov.transpose()) * 0.5;
    Ok(Self {
      mean,
      cov,
      trading_days,
    })
  }

  /// Statistics engine on a raw `dates × assets` matrix.
  pub fn from_returns(values: ArrayView2<f64>, trading_days: u32) -> Result<Self> {
    let (observations, n) = values.dim();
    if observations < 2 {
      return Err(PortfolioError::InsufficientData {
        observations,
        required: 2,
      });
    }
    if n == 0 {
      return Err(PortfolioError::DimensionMismatch {
        context: "asset count",
        expected: 1,
        found: 0,
      });
    }

    let td = f64::from(trading_days);
    let daily_mean = values
      .mean_axis(Axis(0))
      .ok_or(PortfolioError::InsufficientData {
        observations,
        required: 2,
      })?;
    // `cov` treats rows as variables
    let daily_cov = values
      .t()
      .cov(1.0)
      .map_err(|e| PortfolioError::InvalidData(e.to_string()))?;

    let mean = DVector::from_iterator(n, daily_mean.iter().map(|m| m * td));
    let cov = DMatrix::from_fn(n, n, |i, j| daily_cov[[i, j]] * td);
    Self::new(mean, cov, trading_days)
  }

  pub fn n_assets(&self) -> usize {
    self.mean.len()
  }

  pub fn mean(&self) -> &DVector<f64> {
    &self.mean
  }

  pub fn cov(&self) -> &DMatrix<f64> {
    &self.cov
  }

  pub fn trading_days(&self) -> u32 {
    self.trading_days
  }

  pub fn portfolio_return(&self, weights: &DVector<f64>) -> f64 {
    weights.dot(&self.mean)
  }

  pub fn portfolio_variance(&self, weights: &DVector<f64>) -> f64 {
    weights.dot(&(&self.cov * weights)).max(0.0)
  }

  pub fn portfolio_volatility(&self, weights: &DVector<f64>) -> f64 {
    self.portfolio_variance(weights).sqrt()
  }

  /// Annualized per-asset volatilities.
  pub fn asset_volatilities(&self) -> DVector<f64> {
    self.cov.diagonal().map(|v| v.max(0.0).sqrt())
  }

  /// Per-asset volatilities on the daily scale.
  pub fn daily_volatilities(&self) -> DVector<f64> {
    self.asset_volatilities() / f64::from(self.trading_days).sqrt()
  }

  /// Correlation matrix with unit diagonal; zero-variance assets are
  /// uncorrelated with everything.
  pub fn correlation(&self) -> DMatrix<f64> {
    let sigmas = self.asset_volatilities();
    let n = self.n_assets();
    DMatrix::from_fn(n, n, |i, j| {
      let denom = sigmas[i] * sigmas[j];
      if i == j {
        1.0
      } else if denom > 1e-15 {
        (self.cov[(i, j)] / denom).clamp(-1.0, 1.0)
      } else {
        0.0
      }
    })
  }

  /// Weighted average asset volatility over portfolio volatility.
  pub fn diversification_ratio(&self, weights: &DVector<f64>) -> f64 {
    let vol = self.portfolio_volatility(weights);
    if vol > 1e-15 {
      weights.dot(&self.asset_volatilities()) / vol
    } else {
      0.0
    }
  }

  pub fn metrics(&self, weights: &DVector<f64>, risk_free: f64) -> PortfolioMetrics {
    let expected_return = self.portfolio_return(weights);
    let volatility = self.portfolio_volatility(weights);
    PortfolioMetrics {
      expected_return,
      volatility,
      sharpe_ratio: sharpe_ratio(expected_return, volatility, risk_free),
      diversification_ratio: self.diversification_ratio(weights),
    }
  }

  /// Numerically singular covariance: `λ_min ≤ 1e-10 λ_max`.
  pub fn is_singular(&self) -> bool {
    let eigenvalues = self.cov.clone().symmetric_eigen().eigenvalues;
    let max = eigenvalues.max();
    let min = eigenvalues.min();
    !(max > 0.0) || min <= SINGULAR_RTOL * max
  }
}

/// Annualized moments of a return series.
pub fn compute_moments(returns: &ReturnSeries, trading_days: u32) -> Result<Moments> {
  let moments = Moments::from_returns(returns.values(), trading_days)?;
  info!(
    assets = moments.n_assets(),
    observations = returns.n_observations(),
    trading_days,
    "moments computed"
  );
  Ok(moments)
}
