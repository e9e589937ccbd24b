//! # frontier-rs
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}\ge 0,\ \mathbf{1}^\top\mathbf{w}=1}
//! \frac{\mathbf{w}^\top\mu-r_f}{\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}}
//! $$
//!
//! Long-only ETF portfolio optimization on daily return histories.
//!
//! ```ignore
//! use frontier_rs::config::OptimizerConfig;
//! use frontier_rs::portfolio::PortfolioOptimizer;
//! use frontier_rs::portfolio::PriceTable;
//!
//! let prices = PriceTable::from_csv(std::fs::File::open("prices.csv")?)?;
//! let returns = prices.to_returns()?;
//! let optimizer = PortfolioOptimizer::new(OptimizerConfig::default())?;
//! let moments = optimizer.compute_moments(&returns)?;
//! let tangency = optimizer.maximize_sharpe(&moments);
//! let frontier = optimizer.efficient_frontier(&moments)?;
//! ```

pub mod config;
pub mod error;
pub mod evaluation;
pub mod portfolio;

pub use config::OptimizerConfig;
pub use error::PortfolioError;
pub use error::Result;
