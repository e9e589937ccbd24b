//! # Errors
//!
//! Failure taxonomy shared by every optimizer entry point.

use thiserror::Error;

/// Errors surfaced by the optimization core and its data layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortfolioError {
  #[error("insufficient data: {observations} observations, at least {required} required")]
  InsufficientData { observations: usize, required: usize },

  #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
  DimensionMismatch {
    context: &'static str,
    expected: usize,
    found: usize,
  },

  #[error("target return {target} is outside the long-only range [{min}, {max}]")]
  InfeasibleTarget { target: f64, min: f64, max: f64 },

  #[error("invalid parameter `{name}` = {value}: {reason}")]
  InvalidParameter {
    name: &'static str,
    value: f64,
    reason: &'static str,
  },

  #[error("invalid data: {0}")]
  InvalidData(String),

  #[error("{backend} solver did not converge within {iterations} iterations")]
  NotConverged {
    backend: &'static str,
    iterations: u64,
  },

  #[error("solver error: {0}")]
  Solver(String),

  #[error("strategy `{strategy}` failed: {reason}")]
  Strategy {
    strategy: &'static str,
    reason: String,
  },

  #[error("every optimization strategy failed")]
  AllStrategiesFailed,

  #[error("io error: {0}")]
  Io(String),

  #[error("csv error: {0}")]
  Csv(String),

  #[error("config error: {0}")]
  Config(String),

  #[error("date parsing error: {0}")]
  DateParse(#[from] chrono::ParseError),
}

impl From<std::io::Error> for PortfolioError {
  fn from(err: std::io::Error) -> Self {
    Self::Io(err.to_string())
  }
}

impl From<csv::Error> for PortfolioError {
  fn from(err: csv::Error) -> Self {
    Self::Csv(err.to_string())
  }
}

impl From<toml::de::Error> for PortfolioError {
  fn from(err: toml::de::Error) -> Self {
    Self::Config(err.to_string())
  }
}

impl PortfolioError {
  pub(crate) fn invalid(name: &'static str, value: f64, reason: &'static str) -> Self {
    Self::InvalidParameter {
      name,
      value,
      reason,
    }
  }
}

/// Result alias for optimizer operations.
pub type Result<T> = std::result::Result<T, PortfolioError>;
