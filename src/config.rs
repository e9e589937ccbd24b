//! # Configuration
//!
//! Scalar parameters of an optimization run, loadable from TOML.
//!
//! ```toml
//! risk_free_rate = 0.02
//! trading_days = 252
//! backend = "convex"
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::portfolio::solver::SolverKind;
use crate::portfolio::solver::SolverSettings;

/// Parameters shared by every optimizer in the crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
  /// Annual risk-free rate used in every Sharpe computation.
  pub risk_free_rate: f64,
  /// Trading days per year used to annualize daily moments.
  pub trading_days: u32,
  /// Volatility ceiling of the risk-constrained variant.
  pub max_volatility: f64,
  /// Drawdown target of the risk-constrained variant (positive fraction).
  pub max_drawdown: f64,
  /// Number of target returns swept by the efficient frontier.
  pub num_frontier_points: usize,
  /// Numerical backend for max-Sharpe and min-variance solves.
  pub backend: SolverKind,
  /// Iteration cap of every numerical solve.
  pub max_iters: u64,
  /// Convergence tolerance of every numerical solve.
  pub tolerance: f64,
  /// Weight of the stability score in the stability strategy.
  pub stability_weight: f64,
  /// Reward per unit of expected return in the return-boosted risk parity.
  pub return_boost: f64,
  /// Re-solves allowed when the realized drawdown breaches `max_drawdown`.
  pub drawdown_retries: usize,
  /// Factor applied to the volatility cap on each drawdown retry.
  pub volatility_shrink: f64,
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    Self {
      risk_free_rate: 0.02,
      trading_days: 252,
      max_volatility: 0.15,
      max_drawdown: 0.20,
      num_frontier_points: 50,
      backend: SolverKind::Convex,
      max_iters: 50_000,
      tolerance: 1e-9,
      stability_weight: 0.3,
      return_boost: 0.1,
      drawdown_retries: 5,
      volatility_shrink: 0.9,
    }
  }
}

impl OptimizerConfig {
  /// Parse a TOML document; absent keys keep their defaults.
  pub fn from_toml_str(s: &str) -> Result<Self> {
    let config: Self = toml::from_str(s)?;
    config.validate()?;
    Ok(config)
  }

  /// Load and validate a TOML configuration file.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let config = Self::from_toml_str(&content)?;
    info!(path = %path.display(), backend = ?config.backend, "loaded optimizer config");
    Ok(config)
  }

  /// Check every scalar against its admissible range.
  pub fn validate(&self) -> Result<()> {
    let rf = self.risk_free_rate;
    if !rf.is_finite() || !(0.0..1.0).contains(&rf) {
      return Err(PortfolioError::invalid(
        "risk_free_rate",
        rf,
        "must lie in [0, 1)",
      ));
    }
    if self.trading_days == 0 {
      return Err(PortfolioError::invalid(
        "trading_days",
        0.0,
        "must be positive",
      ));
    }
    if !self.max_volatility.is_finite() || self.max_volatility <= 0.0 {
      return Err(PortfolioError::invalid(
        "max_volatility",
        self.max_volatility,
        "must be positive",
      ));
    }
    if !self.max_drawdown.is_finite() || self.max_drawdown <= 0.0 || self.max_drawdown > 1.0 {
      return Err(PortfolioError::invalid(
        "max_drawdown",
        self.max_drawdown,
        "must lie in (0, 1]",
      ));
    }
    if self.num_frontier_points == 0 {
      return Err(PortfolioError::invalid(
        "num_frontier_points",
        0.0,
        "must be at least 1",
      ));
    }
    if self.max_iters == 0 {
      return Err(PortfolioError::invalid(
        "max_iters",
        0.0,
        "must be positive",
      ));
    }
    if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
      return Err(PortfolioError::invalid(
        "tolerance",
        self.tolerance,
        "must be positive",
      ));
    }
    if !(0.0..=1.0).contains(&self.stability_weight) {
      return Err(PortfolioError::invalid(
        "stability_weight",
        self.stability_weight,
        "must lie in [0, 1]",
      ));
    }
    if !self.return_boost.is_finite() || self.return_boost < 0.0 {
      return Err(PortfolioError::invalid(
        "return_boost",
        self.return_boost,
        "must be finite and non-negative",
      ));
    }
    if !(self.volatility_shrink > 0.0 && self.volatility_shrink < 1.0) {
      return Err(PortfolioError::invalid(
        "volatility_shrink",
        self.volatility_shrink,
        "must lie in (0, 1)",
      ));
    }
    Ok(())
  }

  /// Solver limits derived from this configuration.
  pub fn solver_settings(&self) -> SolverSettings {
    SolverSettings::new(self.max_iters, self.tolerance)
  }
}
