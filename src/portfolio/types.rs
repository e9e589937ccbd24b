//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}} \frac{\mathbb E[R_p]-r_f}{\sigma_p}
//! $$
//!
//! Shared enums and result containers for portfolio optimization.

use std::collections::BTreeMap;
use std::fmt::Display;

use impl_new_derive::ImplNew;
use nalgebra::DVector;

use crate::error::PortfolioError;

/// Scalar summary of a weight vector under a set of moments.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PortfolioMetrics {
  /// Model expected portfolio return (annualized).
  pub expected_return: f64,
  /// Model portfolio volatility (annualized).
  pub volatility: f64,
  /// `(expected_return - risk_free) / volatility`, zero for a riskless portfolio.
  pub sharpe_ratio: f64,
  /// Weighted average asset volatility over portfolio volatility.
  pub diversification_ratio: f64,
}

/// Why a solve substituted the equal-weight portfolio.
#[derive(Clone, Debug, PartialEq)]
pub enum FallbackReason {
  /// The covariance matrix is (numerically) singular.
  SingularCovariance,
  /// No asset earns more than the risk-free rate.
  NoPositiveExcessReturn,
  /// The backend hit its iteration cap.
  NotConverged { backend: &'static str, iterations: u64 },
  /// The backend failed for another reason.
  Solver(String),
}

impl Display for FallbackReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FallbackReason::SingularCovariance => write!(f, "singular covariance matrix"),
      FallbackReason::NoPositiveExcessReturn => write!(f, "no asset beats the risk-free rate"),
      FallbackReason::NotConverged {
        backend,
        iterations,
      } => write!(f, "{backend} did not converge in {iterations} iterations"),
      FallbackReason::Solver(msg) => write!(f, "solver error: {msg}"),
    }
  }
}

impl From<PortfolioError> for FallbackReason {
  fn from(err: PortfolioError) -> Self {
    match err {
      PortfolioError::NotConverged {
        backend,
        iterations,
      } => FallbackReason::NotConverged {
        backend,
        iterations,
      },
      other => FallbackReason::Solver(other.to_string()),
    }
  }
}

/// Whether a result is the solver optimum or the equal-weight substitute.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum SolveStatus {
  #[default]
  Optimal,
  Fallback { reason: FallbackReason },
}

/// Output of a portfolio optimization run.
#[derive(Clone, Debug, PartialEq)]
pub struct PortfolioResult {
  /// Long-only, fully invested weights.
  pub weights: DVector<f64>,
  /// Metrics of `weights` under the moments that produced them.
  pub metrics: PortfolioMetrics,
  /// Optimal or fallback.
  pub status: SolveStatus,
  /// Name of the routine that produced the weights.
  pub solver: &'static str,
}

impl PortfolioResult {
  /// True when the equal-weight fallback was substituted.
  pub fn is_fallback(&self) -> bool {
    matches!(self.status, SolveStatus::Fallback { .. })
  }

  /// Fallback reason, if any.
  pub fn fallback_reason(&self) -> Option<&FallbackReason> {
    match &self.status {
      SolveStatus::Fallback { reason } => Some(reason),
      SolveStatus::Optimal => None,
    }
  }
}

/// One point of the efficient frontier.
#[derive(ImplNew, Clone, Debug, PartialEq)]
pub struct FrontierPoint {
  /// Expected return the point was solved for.
  pub target_return: f64,
  /// Minimum volatility attainable at `target_return`.
  pub volatility: f64,
  /// Weights attaining `volatility`.
  pub weights: DVector<f64>,
}

/// Efficient frontier ordered by non-decreasing target return.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrontierCurve {
  pub points: Vec<FrontierPoint>,
  /// Targets that could not be solved and were left out.
  pub skipped: usize,
}

impl FrontierCurve {
  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  pub fn returns(&self) -> Vec<f64> {
    self.points.iter().map(|p| p.target_return).collect()
  }

  pub fn volatilities(&self) -> Vec<f64> {
    self.points.iter().map(|p| p.volatility).collect()
  }

  /// Frontier point with the highest Sharpe ratio at `risk_free`.
  pub fn max_sharpe_point(&self, risk_free: f64) -> Option<&FrontierPoint> {
    self
      .points
      .iter()
      .filter(|p| p.volatility > 1e-15)
      .max_by(|a, b| {
        let sa = (a.target_return - risk_free) / a.volatility;
        let sb = (b.target_return - risk_free) / b.volatility;
        sa.total_cmp(&sb)
      })
  }
}

/// Allocation strategies run by the multi-objective optimizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strategy {
  /// Tangency portfolio.
  MaxSharpe,
  /// Equalized risk contributions.
  RiskParity,
  /// Blend of return stability and Sharpe ratio.
  Stability,
  /// Hierarchical Risk Parity (Lopez de Prado).
  HierarchicalRiskParity,
  /// Risk parity rewarded for expected return; opt-in, not part of `ALL`.
  ReturnBoostedRiskParity,
}

impl Strategy {
  pub const ALL: [Strategy; 4] = [
    Strategy::MaxSharpe,
    Strategy::RiskParity,
    Strategy::Stability,
    Strategy::HierarchicalRiskParity,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Strategy::MaxSharpe => "max_sharpe",
      Strategy::RiskParity => "risk_parity",
      Strategy::Stability => "stability",
      Strategy::HierarchicalRiskParity => "hierarchical_risk_parity",
      Strategy::ReturnBoostedRiskParity => "return_boosted_risk_parity",
    }
  }
}

impl Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Per-strategy outcome of a multi-objective run.
#[derive(Clone, Debug, Default)]
pub struct StrategyReport {
  pub results: BTreeMap<Strategy, Result<PortfolioResult, PortfolioError>>,
}

impl StrategyReport {
  pub fn get(&self, strategy: Strategy) -> Option<&Result<PortfolioResult, PortfolioError>> {
    self.results.get(&strategy)
  }

  pub fn succeeded(&self) -> impl Iterator<Item = (Strategy, &PortfolioResult)> {
    self
      .results
      .iter()
      .filter_map(|(s, r)| r.as_ref().ok().map(|res| (*s, res)))
  }

  pub fn failed(&self) -> impl Iterator<Item = (Strategy, &PortfolioError)> {
    self
      .results
      .iter()
      .filter_map(|(s, r)| r.as_ref().err().map(|err| (*s, err)))
  }

  /// Successful strategy with the highest model Sharpe ratio.
  pub fn best_by_sharpe(&self) -> Option<(Strategy, &PortfolioResult)> {
    self.succeeded().max_by(|(_, a), (_, b)| {
      a.metrics
        .sharpe_ratio
        .total_cmp(&b.metrics.sharpe_ratio)
    })
  }
}

/// Output of the volatility/drawdown constrained max-Sharpe solve.
#[derive(Clone, Debug, PartialEq)]
pub struct RiskConstrainedResult {
  /// Best-effort portfolio.
  pub result: PortfolioResult,
  /// Whether `result` respects the volatility cap that was requested.
  pub volatility_cap_met: bool,
  /// Whether the back-tested drawdown stayed within the target.
  pub drawdown_met: bool,
  /// Back-tested maximum drawdown of `result` (positive fraction).
  pub realized_drawdown: f64,
  /// Volatility cap used for the returned solve.
  pub final_volatility_cap: f64,
  /// Number of solves performed.
  pub attempts: usize,
  /// Volatility cap of every solve, in order.
  pub volatility_caps: Vec<f64>,
}
