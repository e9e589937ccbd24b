use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use frontier_rs::config::OptimizerConfig;
use frontier_rs::evaluation::HIGH_CORRELATION;
use frontier_rs::evaluation::MODERATE_CORRELATION;
use frontier_rs::evaluation::PerformanceSummary;
use frontier_rs::evaluation::asset_summaries;
use frontier_rs::evaluation::concentration_risk;
use frontier_rs::evaluation::correlation_risks;
use frontier_rs::evaluation::default_stress_scenarios;
use frontier_rs::evaluation::drawdown_profile;
use frontier_rs::evaluation::evaluate;
use frontier_rs::evaluation::stress_test;
use frontier_rs::portfolio::Moments;
use frontier_rs::portfolio::MultiObjectiveOptimizer;
use frontier_rs::portfolio::PortfolioOptimizer;
use frontier_rs::portfolio::PortfolioResult;
use frontier_rs::portfolio::PriceTable;
use frontier_rs::portfolio::ReturnSeries;
use frontier_rs::portfolio::SolverKind;
use frontier_rs::portfolio::Strategy;
use prettytable::Cell;
use prettytable::Table;
use prettytable::row;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "frontier", version, about = "Long-only ETF portfolio optimizer")]
struct Cli {
  #[command(subcommand)]
  command: Commands,

  /// TOML configuration file
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the configured numerical backend
  #[arg(short, long, value_enum)]
  backend: Option<Backend>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
  Nonlinear,
  Convex,
}

impl From<Backend> for SolverKind {
  fn from(backend: Backend) -> Self {
    match backend {
      Backend::Nonlinear => SolverKind::NelderMead,
      Backend::Convex => SolverKind::Convex,
    }
  }
}

#[derive(Subcommand)]
enum Commands {
  /// Maximum-Sharpe portfolio with a back-test of its daily returns
  Optimize {
    /// CSV of daily closes: a date column followed by one column per ETF
    #[arg(short, long)]
    prices: PathBuf,
    /// Also print concentration, drawdown episodes, stress scenarios,
    /// correlated pairs and per-asset statistics
    #[arg(long)]
    risk_report: bool,
  },
  /// Efficient frontier from the minimum-variance portfolio upward
  Frontier {
    #[arg(short, long)]
    prices: PathBuf,
    /// Number of target returns; defaults to the configured value
    #[arg(short = 'n', long)]
    points: Option<usize>,
  },
  /// Run every allocation strategy side by side
  Compare {
    #[arg(short, long)]
    prices: PathBuf,
    /// Include the return-boosted risk parity
    #[arg(long)]
    return_boost: bool,
  },
  /// Maximum-Sharpe under volatility and drawdown limits
  Constrained {
    #[arg(short, long)]
    prices: PathBuf,
    #[arg(long)]
    max_volatility: Option<f64>,
    #[arg(long)]
    max_drawdown: Option<f64>,
  },
}

fn load_config(cli: &Cli) -> Result<OptimizerConfig> {
  let mut config = match &cli.config {
    Some(path) => OptimizerConfig::from_file(path)
      .with_context(|| format!("failed to load config from {}", path.display()))?,
    None => OptimizerConfig::default(),
  };
  if let Some(backend) = cli.backend {
    config.backend = backend.into();
  }
  Ok(config)
}

fn load_returns(path: &Path) -> Result<ReturnSeries> {
  let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
  let prices = PriceTable::from_csv(file)
    .with_context(|| format!("failed to parse prices from {}", path.display()))?;
  info!(
    assets = prices.assets.len(),
    rows = prices.dates.len(),
    "price history loaded"
  );
  Ok(prices.to_returns()?)
}

fn weights_table(assets: &[String], result: &PortfolioResult) -> Table {
  let mut table = Table::new();
  table.set_titles(row!["asset", "weight"]);
  for (asset, weight) in assets.iter().zip(result.weights.iter()) {
    table.add_row(row![asset, format!("{:.4}", weight)]);
  }
  table
}

fn print_result(assets: &[String], result: &PortfolioResult) {
  weights_table(assets, result).printstd();
  println!(
    "return {:.4}  volatility {:.4}  sharpe {:.4}  diversification {:.3}  solver {}",
    result.metrics.expected_return,
    result.metrics.volatility,
    result.metrics.sharpe_ratio,
    result.metrics.diversification_ratio,
    result.solver,
  );
  if let Some(reason) = result.fallback_reason() {
    println!("equal-weight fallback: {reason}");
  }
}

fn print_summary(summary: &PerformanceSummary) {
  let mut table = Table::new();
  table.set_titles(row!["back-test", "value"]);
  table.add_row(row!["observations", summary.observations]);
  table.add_row(row!["annual return", format!("{:.4}", summary.annual_return)]);
  table.add_row(row!["annual volatility", format!("{:.4}", summary.annual_volatility)]);
  table.add_row(row!["sharpe", format!("{:.4}", summary.sharpe_ratio)]);
  table.add_row(row!["sortino", format!("{:.4}", summary.sortino_ratio)]);
  table.add_row(row!["max drawdown", format!("{:.4}", summary.max_drawdown)]);
  table.add_row(row!["calmar", format!("{:.4}", summary.calmar_ratio)]);
  table.add_row(row!["VaR 95%", format!("{:.5}", summary.var_95)]);
  table.add_row(row!["CVaR 95%", format!("{:.5}", summary.cvar_95)]);
  table.add_row(row!["parametric VaR 95%", format!("{:.5}", summary.parametric_var_95)]);
  table.add_row(row!["skewness", format!("{:.3}", summary.skewness)]);
  table.add_row(row!["excess kurtosis", format!("{:.3}", summary.excess_kurtosis)]);
  table.printstd();
}

fn print_risk_report(
  optimizer: &PortfolioOptimizer,
  moments: &Moments,
  returns: &ReturnSeries,
  result: &PortfolioResult,
) -> Result<()> {
  let config = optimizer.config();
  let path = returns.portfolio_returns(&result.weights)?;

  let concentration = concentration_risk(&result.weights)?;
  println!(
    "top-3 {:.3}  top-5 {:.3}  HHI {:.0}  effective holdings {:.2}  max weight {:.3}",
    concentration.top_3_weight,
    concentration.top_5_weight,
    concentration.hhi,
    concentration.effective_holdings,
    concentration.max_weight,
  );

  let drawdowns = drawdown_profile(path.view());
  println!(
    "drawdown episodes {}  longest {} days  mean length {:.1}  mean depth {:.4}",
    drawdowns.episodes,
    drawdowns.max_duration,
    drawdowns.average_duration,
    drawdowns.average_drawdown,
  );

  let mut table = Table::new();
  table.set_titles(row!["scenario", "shock", "percentile", "days"]);
  for outcome in stress_test(path.view(), &default_stress_scenarios())? {
    table.add_row(row![
      outcome.name,
      format!("{:.1}%", outcome.portfolio_return * 100.0),
      format!("{:.2}", outcome.historical_percentile),
      outcome.duration_days
    ]);
  }
  table.printstd();

  let correlation = correlation_risks(
    moments,
    returns.assets(),
    HIGH_CORRELATION,
    MODERATE_CORRELATION,
  )?;
  for pair in &correlation.high {
    println!(
      "high correlation {} / {}: {:.3}",
      pair.first, pair.second, pair.correlation
    );
  }
  println!(
    "average correlation {:.3}  max |correlation| {:.3}",
    correlation.average_correlation, correlation.max_abs_correlation,
  );

  let mut table = Table::new();
  table.set_titles(row!["asset", "return", "volatility", "sharpe", "max drawdown"]);
  for (asset, summary) in asset_summaries(returns, config.trading_days, config.risk_free_rate) {
    table.add_row(row![
      asset,
      format!("{:.4}", summary.annual_return),
      format!("{:.4}", summary.annual_volatility),
      format!("{:.4}", summary.sharpe_ratio),
      format!("{:.4}", summary.max_drawdown)
    ]);
  }
  table.printstd();
  Ok(())
}

fn run_optimize(
  optimizer: &PortfolioOptimizer,
  moments: &Moments,
  returns: &ReturnSeries,
  risk_report: bool,
) -> Result<()> {
  let result = optimizer.maximize_sharpe(moments);
  print_result(returns.assets(), &result);

  let path = returns.portfolio_returns(&result.weights)?;
  let config = optimizer.config();
  let summary = evaluate(path.view(), config.trading_days, config.risk_free_rate)?;
  print_summary(&summary);
  if risk_report {
    print_risk_report(optimizer, moments, returns, &result)?;
  }
  Ok(())
}

fn run_frontier(
  optimizer: &PortfolioOptimizer,
  moments: &Moments,
  points: Option<usize>,
) -> Result<()> {
  let points = points.unwrap_or(optimizer.config().num_frontier_points);
  let curve = optimizer.build_frontier(moments, points)?;

  let mut table = Table::new();
  table.set_titles(row!["target return", "volatility", "sharpe"]);
  let rf = optimizer.config().risk_free_rate;
  for point in &curve.points {
    let sharpe = if point.volatility > 0.0 {
      (point.target_return - rf) / point.volatility
    } else {
      0.0
    };
    table.add_row(row![
      format!("{:.4}", point.target_return),
      format!("{:.4}", point.volatility),
      format!("{:.4}", sharpe)
    ]);
  }
  table.printstd();
  if curve.skipped > 0 {
    println!("{} target(s) skipped", curve.skipped);
  }
  Ok(())
}

fn run_compare(
  optimizer: PortfolioOptimizer,
  moments: &Moments,
  assets: &[String],
  return_boost: bool,
) -> Result<()> {
  let multi = MultiObjectiveOptimizer::with_optimizer(optimizer);
  let mut strategies = Strategy::ALL.to_vec();
  if return_boost {
    strategies.push(Strategy::ReturnBoostedRiskParity);
  }
  let report = multi.optimize_strategies(&strategies, moments)?;

  let mut table = Table::new();
  let mut titles = row!["strategy", "return", "volatility", "sharpe"];
  for asset in assets {
    titles.add_cell(Cell::new(asset));
  }
  table.set_titles(titles);
  for (strategy, result) in report.succeeded() {
    let mut line = row![
      strategy,
      format!("{:.4}", result.metrics.expected_return),
      format!("{:.4}", result.metrics.volatility),
      format!("{:.4}", result.metrics.sharpe_ratio)
    ];
    for weight in result.weights.iter() {
      line.add_cell(Cell::new(&format!("{:.3}", weight)));
    }
    table.add_row(line);
  }
  table.printstd();

  for (strategy, err) in report.failed() {
    println!("{strategy} failed: {err}");
  }
  if let Some((strategy, _)) = report.best_by_sharpe() {
    println!("best by sharpe: {strategy}");
  }
  Ok(())
}

fn run_constrained(
  optimizer: &PortfolioOptimizer,
  moments: &Moments,
  returns: &ReturnSeries,
  max_volatility: Option<f64>,
  max_drawdown: Option<f64>,
) -> Result<()> {
  let config = optimizer.config();
  let outcome = optimizer.maximize_sharpe_with_limits(
    moments,
    returns,
    max_volatility.unwrap_or(config.max_volatility),
    max_drawdown.unwrap_or(config.max_drawdown),
  )?;
  print_result(returns.assets(), &outcome.result);
  println!(
    "volatility cap met: {}  drawdown met: {}  realized drawdown {:.4}",
    outcome.volatility_cap_met, outcome.drawdown_met, outcome.realized_drawdown,
  );
  println!(
    "final cap {:.4}  attempts {}",
    outcome.final_volatility_cap, outcome.attempts,
  );
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();
  let config = load_config(&cli)?;
  let optimizer = PortfolioOptimizer::new(config).context("invalid optimizer configuration")?;
  info!(backend = optimizer.backend_name(), "optimizer ready");

  match &cli.command {
    Commands::Optimize {
      prices,
      risk_report,
    } => {
      let returns = load_returns(prices)?;
      let moments = optimizer.compute_moments(&returns)?;
      run_optimize(&optimizer, &moments, &returns, *risk_report)
    }
    Commands::Frontier { prices, points } => {
      let returns = load_returns(prices)?;
      let moments = optimizer.compute_moments(&returns)?;
      run_frontier(&optimizer, &moments, *points)
    }
    Commands::Compare {
      prices,
      return_boost,
    } => {
      let returns = load_returns(prices)?;
      let moments = optimizer.compute_moments(&returns)?;
      run_compare(optimizer, &moments, returns.assets(), *return_boost)
    }
    Commands::Constrained {
      prices,
      max_volatility,
      max_drawdown,
    } => {
      let returns = load_returns(prices)?;
      let moments = optimizer.compute_moments(&returns)?;
      run_constrained(&optimizer, &moments, &returns, *max_volatility, *max_drawdown)
    }
  }
}
