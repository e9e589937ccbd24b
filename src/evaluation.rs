//! # Evaluation
//!
//! $$
//! \mathrm{MDD}=\max_t\Big(1-\frac{W_t}{\max_{s\le t}W_s}\Big),\qquad
//! W_t=\prod_{s\le t}(1+r_s)
//! $$
//!
//! Back-test statistics of a daily portfolio return path, plus the risk
//! report around a weight vector: concentration, drawdown episodes, stress
//! scenarios and correlated pairs. VaR and CVaR are reported as daily
//! returns, so losses are negative; drawdowns are positive fractions.

use impl_new_derive::ImplNew;
use nalgebra::DVector;
use ndarray::Array1;
use ndarray::ArrayView1;
use statrs::distribution::Continuous;
use statrs::distribution::ContinuousCDF;
use statrs::distribution::Normal;
use statrs::statistics::Statistics;
use tracing::debug;
use tracing::warn;

use crate::error::PortfolioError;
use crate::error::Result;
use crate::portfolio::data::ReturnSeries;
use crate::portfolio::moments::Moments;
use crate::portfolio::moments::sharpe_ratio;

/// Confidence level of the reported tail measures.
pub const CONFIDENCE: f64 = 0.95;

/// Summary statistics of a daily return path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformanceSummary {
  pub observations: usize,
  /// Geometric annualized return.
  pub annual_return: f64,
  pub annual_volatility: f64,
  pub sharpe_ratio: f64,
  /// Maximum peak-to-trough loss, positive fraction.
  pub max_drawdown: f64,
  pub calmar_ratio: f64,
  /// Infinite when no daily return is negative.
  pub sortino_ratio: f64,
  pub skewness: f64,
  pub excess_kurtosis: f64,
  pub var_95: f64,
  pub cvar_95: f64,
  pub parametric_var_95: f64,
}

/// Compounded return since the start, per day.
pub fn cumulative_returns(daily: ArrayView1<f64>) -> Array1<f64> {
  let mut wealth = 1.0;
  Array1::from_iter(daily.iter().map(|r| {
    wealth *= 1.0 + r;
    wealth - 1.0
  }))
}

/// Per-day decline from the running peak of compounded wealth.
///
/// The peak starts at the first day's wealth, so a loss on day one is not a
/// drawdown.
pub fn drawdown_series(daily: ArrayView1<f64>) -> Array1<f64> {
  let mut wealth = 1.0_f64;
  let mut peak = f64::NEG_INFINITY;
  Array1::from_iter(daily.iter().map(|r| {
    wealth *= 1.0 + r;
    peak = peak.max(wealth);
    if peak > 0.0 { 1.0 - wealth / peak } else { 0.0 }
  }))
}

/// Largest relative decline from a running peak.
pub fn max_drawdown(daily: ArrayView1<f64>) -> f64 {
  drawdown_series(daily).fold(0.0_f64, |worst, &dd| worst.max(dd))
}

fn check_confidence(confidence: f64) -> Result<()> {
  if confidence > 0.0 && confidence < 1.0 {
    Ok(())
  } else {
    Err(PortfolioError::invalid(
      "confidence",
      confidence,
      "must lie in (0, 1)",
    ))
  }
}

fn check_len(daily: ArrayView1<f64>, required: usize) -> Result<()> {
  if daily.len() < required {
    Err(PortfolioError::InsufficientData {
      observations: daily.len(),
      required,
    })
  } else {
    Ok(())
  }
}

/// Linear-interpolated percentile of a sorted slice, `p` in `[0, 1]`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
  let pos = p * (sorted.len() - 1) as f64;
  let lo = pos.floor() as usize;
  let hi = pos.ceil() as usize;
  sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn sorted(daily: ArrayView1<f64>) -> Vec<f64> {
  let mut xs = daily.to_vec();
  xs.sort_by(|a, b| a.total_cmp(b));
  xs
}

/// Historical VaR: the `1 − confidence` percentile of daily returns.
pub fn historical_var(daily: ArrayView1<f64>, confidence: f64) -> Result<f64> {
  check_confidence(confidence)?;
  check_len(daily, 1)?;
  Ok(percentile(&sorted(daily), 1.0 - confidence))
}

/// Historical CVaR: mean of the returns at or below the historical VaR.
pub fn historical_cvar(daily: ArrayView1<f64>, confidence: f64) -> Result<f64> {
  let var = historical_var(daily, confidence)?;
  let tail: Vec<f64> = daily.iter().copied().filter(|&r| r <= var).collect();
  if tail.is_empty() {
    Ok(var)
  } else {
    Ok(tail.mean())
  }
}

/// Normal VaR `m + z_{1−c} s` from the sample mean and deviation.
pub fn parametric_var(daily: ArrayView1<f64>, confidence: f64) -> Result<f64> {
  check_confidence(confidence)?;
  check_len(daily, 2)?;
  let normal = Normal::new(0.0, 1.0).map_err(|e| PortfolioError::InvalidData(e.to_string()))?;
  let z = normal.inverse_cdf(1.0 - confidence);
  Ok(daily.iter().mean() + z * daily.iter().std_dev())
}

/// Normal CVaR `m − s φ(z) / (1 − c)`.
pub fn parametric_cvar(daily: ArrayView1<f64>, confidence: f64) -> Result<f64> {
  check_confidence(confidence)?;
  check_len(daily, 2)?;
  let normal = Normal::new(0.0, 1.0).map_err(|e| PortfolioError::InvalidData(e.to_string()))?;
  let z = normal.inverse_cdf(1.0 - confidence);
  Ok(daily.iter().mean() - daily.iter().std_dev() * normal.pdf(z) / (1.0 - confidence))
}

/// Bias-corrected sample skewness and excess kurtosis.
fn shape_statistics(daily: ArrayView1<f64>) -> (f64, f64) {
  let n = daily.len() as f64;
  let m = daily.iter().mean();
  let s = daily.iter().std_dev();
  if !(s > 0.0) {
    return (0.0, 0.0);
  }
  let (m3, m4) = daily.iter().fold((0.0, 0.0), |(a3, a4), &r| {
    let z = (r - m) / s;
    (a3 + z.powi(3), a4 + z.powi(4))
  });

  let skew = if n >= 3.0 {
    n / ((n - 1.0) * (n - 2.0)) * m3
  } else {
    0.0
  };
  let kurt = if n >= 4.0 {
    n * (n + 1.0) / ((n - 1.0) * (n - 2.0) * (n - 3.0)) * m4
      - 3.0 * (n - 1.0).powi(2) / ((n - 2.0) * (n - 3.0))
  } else {
    0.0
  };
  (skew, kurt)
}

/// Full performance summary of a daily return path.
pub fn evaluate(
  daily: ArrayView1<f64>,
  trading_days: u32,
  risk_free_rate: f64,
) -> Result<PerformanceSummary> {
  check_len(daily, 2)?;
  if daily.iter().any(|r| !r.is_finite()) {
    return Err(PortfolioError::InvalidData(
      "return path contains non-finite values".into(),
    ));
  }
  if daily.len() < 10 {
    warn!(observations = daily.len(), "few observations, statistics are unreliable");
  }

  let td = f64::from(trading_days);
  let n = daily.len() as f64;
  let growth: f64 = daily.iter().map(|r| 1.0 + r).product();
  let annual_return = growth.max(0.0).powf(td / n) - 1.0;
  let annual_volatility = daily.iter().std_dev() * td.sqrt();
  let max_dd = max_drawdown(daily);

  let downside: Vec<f64> = daily.iter().copied().filter(|&r| r < 0.0).collect();
  let downside_vol = if downside.len() >= 2 {
    downside.iter().std_dev() * td.sqrt()
  } else {
    0.0
  };
  let sortino_ratio = if downside_vol > 0.0 {
    (annual_return - risk_free_rate) / downside_vol
  } else {
    f64::INFINITY
  };
  let (skewness, excess_kurtosis) = shape_statistics(daily);

  Ok(PerformanceSummary {
    observations: daily.len(),
    annual_return,
    annual_volatility,
    sharpe_ratio: sharpe_ratio(annual_return, annual_volatility, risk_free_rate),
    max_drawdown: max_dd,
    calmar_ratio: if max_dd > 0.0 {
      annual_return / max_dd
    } else {
      0.0
    },
    sortino_ratio,
    skewness,
    excess_kurtosis,
    var_95: historical_var(daily, CONFIDENCE)?,
    cvar_95: historical_cvar(daily, CONFIDENCE)?,
    parametric_var_95: parametric_var(daily, CONFIDENCE)?,
  })
}

/// Performance summary of every asset held alone.
///
/// Assets whose statistics cannot be computed are logged and left out.
pub fn asset_summaries(
  returns: &ReturnSeries,
  trading_days: u32,
  risk_free_rate: f64,
) -> Vec<(String, PerformanceSummary)> {
  let values = returns.values();
  returns
    .assets()
    .iter()
    .zip(values.columns())
    .filter_map(
      |(asset, column)| match evaluate(column, trading_days, risk_free_rate) {
        Ok(summary) => Some((asset.clone(), summary)),
        Err(err) => {
          warn!(asset = %asset, error = %err, "asset statistics skipped");
          None
        }
      },
    )
    .collect()
}

/// How concentrated a weight vector is.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConcentrationRisk {
  /// Sum of the three largest weights (all weights when fewer).
  pub top_3_weight: f64,
  /// Sum of the five largest weights (all weights when fewer).
  pub top_5_weight: f64,
  /// Herfindahl–Hirschman index `10⁴ Σ w²`.
  pub hhi: f64,
  /// `1 / Σ w²`.
  pub effective_holdings: f64,
  pub max_weight: f64,
  /// Smallest weight above [`ACTIVE_WEIGHT`], zero when none is.
  pub min_active_weight: f64,
}

/// Weights at or below this are treated as not held.
pub const ACTIVE_WEIGHT: f64 = 1e-3;

pub fn concentration_risk(weights: &DVector<f64>) -> Result<ConcentrationRisk> {
  if weights.is_empty() {
    return Err(PortfolioError::DimensionMismatch {
      context: "portfolio weights",
      expected: 1,
      found: 0,
    });
  }
  let sum_sq = weights.norm_squared();
  if weights.iter().any(|w| !w.is_finite()) || !(sum_sq > 0.0) {
    return Err(PortfolioError::InvalidData(
      "weights must be finite and not all zero".into(),
    ));
  }

  let mut ranked = weights.as_slice().to_vec();
  ranked.sort_by(|a, b| b.total_cmp(a));
  let top = |k: usize| ranked.iter().take(k).sum::<f64>();

  Ok(ConcentrationRisk {
    top_3_weight: top(3),
    top_5_weight: top(5),
    hhi: sum_sq * 1e4,
    effective_holdings: 1.0 / sum_sq,
    max_weight: ranked[0],
    min_active_weight: ranked
      .iter()
      .copied()
      .filter(|&w| w > ACTIVE_WEIGHT)
      .last()
      .unwrap_or(0.0),
  })
}

/// Depth, length and frequency of the drawdown episodes of a return path.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DrawdownProfile {
  pub max_drawdown: f64,
  /// Mean drawdown over the days spent below a peak.
  pub average_drawdown: f64,
  /// Longest run of consecutive days below a peak.
  pub max_duration: usize,
  pub average_duration: f64,
  /// Number of episodes, an unfinished one included.
  pub episodes: usize,
  /// Episodes per observation.
  pub frequency: f64,
}

pub fn drawdown_profile(daily: ArrayView1<f64>) -> DrawdownProfile {
  let drawdowns = drawdown_series(daily);
  let mut durations = Vec::new();
  let mut run = 0usize;
  for &dd in drawdowns.iter() {
    if dd > 0.0 {
      run += 1;
    } else if run > 0 {
      durations.push(run);
      run = 0;
    }
  }
  if run > 0 {
    durations.push(run);
  }

  let underwater: Vec<f64> = drawdowns.iter().copied().filter(|&dd| dd > 0.0).collect();
  let episodes = durations.len();
  DrawdownProfile {
    max_drawdown: underwater.iter().copied().fold(0.0, f64::max),
    average_drawdown: if underwater.is_empty() {
      0.0
    } else {
      underwater.iter().mean()
    },
    max_duration: durations.iter().copied().max().unwrap_or(0),
    average_duration: if episodes == 0 {
      0.0
    } else {
      durations.iter().sum::<usize>() as f64 / episodes as f64
    },
    episodes,
    frequency: if drawdowns.is_empty() {
      0.0
    } else {
      episodes as f64 / drawdowns.len() as f64
    },
  }
}

/// Instantaneous price shock applied to the portfolio.
#[derive(ImplNew, Clone, Debug, PartialEq)]
pub struct StressScenario {
  pub name: String,
  /// Relative price move, negative for a fall.
  pub shock: f64,
  /// Days over which the shock is assumed to unfold.
  pub duration_days: u32,
}

/// Crash, moderate decline, flash crash and bear market.
pub fn default_stress_scenarios() -> Vec<StressScenario> {
  vec![
    StressScenario::new("market_crash".into(), -0.30, 22),
    StressScenario::new("moderate_decline".into(), -0.15, 15),
    StressScenario::new("flash_crash".into(), -0.10, 1),
    StressScenario::new("bear_market".into(), -0.40, 126),
  ]
}

#[derive(Clone, Debug, PartialEq)]
pub struct StressOutcome {
  pub name: String,
  pub portfolio_return: f64,
  /// Percentile rank (0–100) of the shock among the historical daily returns.
  pub historical_percentile: f64,
  pub duration_days: u32,
}

/// Percentile rank of `score` in `values`, ties counted half.
fn percentile_of_score(values: ArrayView1<f64>, score: f64) -> f64 {
  let below = values.iter().filter(|&&v| v < score).count();
  let at_or_below = values.iter().filter(|&&v| v <= score).count();
  let tie = usize::from(below < at_or_below);
  (below + at_or_below + tie) as f64 * 50.0 / values.len() as f64
}

/// Rank each scenario's loss against the portfolio's daily history.
pub fn stress_test(
  daily: ArrayView1<f64>,
  scenarios: &[StressScenario],
) -> Result<Vec<StressOutcome>> {
  check_len(daily, 1)?;
  scenarios
    .iter()
    .map(|scenario| {
      if !scenario.shock.is_finite() || scenario.shock <= -1.0 {
        return Err(PortfolioError::invalid(
          "shock",
          scenario.shock,
          "must be finite and above -1",
        ));
      }
      let outcome = StressOutcome {
        name: scenario.name.clone(),
        portfolio_return: scenario.shock,
        historical_percentile: percentile_of_score(daily, scenario.shock),
        duration_days: scenario.duration_days,
      };
      debug!(
        scenario = %outcome.name,
        percentile = outcome.historical_percentile,
        "stress scenario evaluated"
      );
      Ok(outcome)
    })
    .collect()
}

pub const HIGH_CORRELATION: f64 = 0.7;
pub const MODERATE_CORRELATION: f64 = 0.5;

#[derive(Clone, Debug, PartialEq)]
pub struct CorrelatedPair {
  pub first: String,
  pub second: String,
  pub correlation: f64,
}

/// Asset pairs whose absolute correlation crosses the thresholds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CorrelationRisk {
  /// `|ρ| ≥ high`.
  pub high: Vec<CorrelatedPair>,
  /// `moderate ≤ |ρ| < high`.
  pub moderate: Vec<CorrelatedPair>,
  /// Mean off-diagonal correlation, signed.
  pub average_correlation: f64,
  pub max_abs_correlation: f64,
  pub pairs: usize,
}

pub fn correlation_risks(
  moments: &Moments,
  assets: &[String],
  high: f64,
  moderate: f64,
) -> Result<CorrelationRisk> {
  if assets.len() != moments.n_assets() {
    return Err(PortfolioError::DimensionMismatch {
      context: "asset names vs moments",
      expected: moments.n_assets(),
      found: assets.len(),
    });
  }
  if !(0.0..=1.0).contains(&moderate) || !(moderate..=1.0).contains(&high) {
    return Err(PortfolioError::invalid(
      "high",
      high,
      "thresholds must satisfy 0 <= moderate <= high <= 1",
    ));
  }

  let corr = moments.correlation();
  let n = moments.n_assets();
  let mut risk = CorrelationRisk::default();
  let mut total = 0.0;
  for i in 0..n {
    for j in (i + 1)..n {
      let rho = corr[(i, j)];
      total += rho;
      risk.pairs += 1;
      risk.max_abs_correlation = risk.max_abs_correlation.max(rho.abs());
      let pair = || CorrelatedPair {
        first: assets[i].clone(),
        second: assets[j].clone(),
        correlation: rho,
      };
      if rho.abs() >= high {
        risk.high.push(pair());
      } else if rho.abs() >= moderate {
        risk.moderate.push(pair());
      }
    }
  }
  if risk.pairs > 0 {
    risk.average_correlation = total / risk.pairs as f64;
  }
  if !risk.high.is_empty() {
    warn!(
      pairs = risk.high.len(),
      threshold = high,
      "highly correlated assets"
    );
  }
  Ok(risk)
}
