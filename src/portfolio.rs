//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Long-only portfolio optimization: statistics engine, max-Sharpe and
//! min-variance solves, efficient frontier, multi-strategy comparison and the
//! risk-constrained variant.

pub mod data;
pub mod frontier;
pub mod hrp;
pub mod moments;
pub mod optimizer;
pub mod risk;
pub mod solver;
pub mod strategies;
pub mod types;

pub use data::PriceTable;
pub use data::ReturnSeries;
pub use frontier::build_frontier;
pub use hrp::hrp_weights;
pub use moments::Moments;
pub use moments::compute_moments;
pub use optimizer::PortfolioOptimizer;
pub use optimizer::maximize_sharpe;
pub use optimizer::minimize_variance;
pub use risk::CappedSolve;
pub use risk::maximize_sharpe_with_risk_constraint;
pub use solver::ConvexBackend;
pub use solver::NelderMeadBackend;
pub use solver::SolverBackend;
pub use solver::SolverKind;
pub use solver::SolverSettings;
pub use solver::build_backend;
pub use solver::equal_weights;
pub use strategies::MultiObjectiveOptimizer;
pub use types::FallbackReason;
pub use types::FrontierCurve;
pub use types::FrontierPoint;
pub use types::PortfolioMetrics;
pub use types::PortfolioResult;
pub use types::RiskConstrainedResult;
pub use types::SolveStatus;
pub use types::Strategy;
pub use types::StrategyReport;
