//! # Hierarchical Risk Parity
//!
//! $$
//! d_{ij}=\sqrt{\tfrac12(1-\rho_{ij})},\qquad
//! \alpha=1-\frac{V_L}{V_L+V_R}
//! $$
//!
//! Single-linkage seriation of the correlation distance followed by recursive
//! bisection with inverse-variance cluster variances (Lopez de Prado).

use nalgebra::DMatrix;
use nalgebra::DVector;
use ordered_float::OrderedFloat;

use super::moments::Moments;
use crate::error::PortfolioError;
use crate::error::Result;

const STRATEGY: &str = "hierarchical_risk_parity";

/// Correlation distance matrix.
pub fn correlation_distance(corr: &DMatrix<f64>) -> DMatrix<f64> {
  corr.map(|rho| (0.5 * (1.0 - rho)).max(0.0).sqrt())
}

/// Leaf order of the single-linkage dendrogram.
///
/// At each merge the active pair with the smallest distance wins; equal
/// distances go to the lexicographically smallest `(i, j)` slot pair, so the
/// order is fully deterministic.
pub fn seriation(dist: &DMatrix<f64>) -> Vec<usize> {
  let n = dist.nrows();
  if n <= 1 {
    return (0..n).collect();
  }

  // merges[k] joins two nodes into node `n + k`
  let mut merges: Vec<(usize, usize)> = Vec::with_capacity(n - 1);
  let mut slot_node: Vec<usize> = (0..n).collect();
  let mut active = vec![true; n];
  let mut d = dist.clone();

  while merges.len() < n - 1 {
    let closest = (0..n)
      .filter(|&i| active[i])
      .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
      .filter(|&(_, j)| active[j])
      .min_by_key(|&(i, j)| (OrderedFloat(d[(i, j)]), i, j));
    let Some((keep, absorbed)) = closest else {
      break;
    };

    merges.push((slot_node[keep], slot_node[absorbed]));
    slot_node[keep] = n + merges.len() - 1;
    active[absorbed] = false;

    for k in (0..n).filter(|&k| active[k] && k != keep) {
      let linked = d[(keep, k)].min(d[(absorbed, k)]);
      d[(keep, k)] = linked;
      d[(k, keep)] = linked;
    }
  }

  // depth-first walk, left subtree first
  let mut order = Vec::with_capacity(n);
  let mut stack = vec![n + merges.len() - 1];
  while let Some(node) = stack.pop() {
    match node.checked_sub(n) {
      None => order.push(node),
      Some(k) => {
        let (left, right) = merges[k];
        stack.push(right);
        stack.push(left);
      }
    }
  }
  order
}

/// Variance of the inverse-variance portfolio over `indices`.
fn cluster_variance(indices: &[usize], cov: &DMatrix<f64>) -> f64 {
  let sub = cov.select_rows(indices).select_columns(indices);
  let inv_vars = sub.diagonal().map(|v| 1.0 / v);
  let w = &inv_vars / inv_vars.sum();
  w.dot(&(sub * &w))
}

/// Top-down bisection of the seriated order; each split gives the
/// lower-variance half the larger share.
fn bisect_allocate(order: &[usize], cov: &DMatrix<f64>) -> DVector<f64> {
  let mut weights = DVector::from_element(cov.nrows(), 1.0);
  let mut pending: Vec<&[usize]> = vec![order];

  while let Some(cluster) = pending.pop() {
    if cluster.len() < 2 {
      continue;
    }
    let (left, right) = cluster.split_at(cluster.len() / 2);
    let v_left = cluster_variance(left, cov);
    let v_right = cluster_variance(right, cov);
    let total = v_left + v_right;
    let alpha = if total > 1e-30 { v_right / total } else { 0.5 };

    left.iter().for_each(|&i| weights[i] *= alpha);
    right.iter().for_each(|&i| weights[i] *= 1.0 - alpha);
    pending.push(right);
    pending.push(left);
  }
  weights
}

/// HRP weights for the given moments.
///
/// Fails when an asset has zero or non-finite variance, since inverse-variance
/// allocation is undefined there.
pub fn hrp_weights(moments: &Moments) -> Result<DVector<f64>> {
  let n = moments.n_assets();
  let cov = moments.cov();
  if let Some(i) = (0..n).find(|&i| !(cov[(i, i)] > 1e-15) || !cov[(i, i)].is_finite()) {
    return Err(PortfolioError::Strategy {
      strategy: STRATEGY,
      reason: format!("asset {i} has zero or non-finite variance"),
    });
  }
  if n == 1 {
    return Ok(DVector::from_element(1, 1.0));
  }

  let order = seriation(&correlation_distance(&moments.correlation()));
  let weights = bisect_allocate(&order, cov);

  let total = weights.sum();
  if !(total > 1e-15) {
    return Err(PortfolioError::Strategy {
      strategy: STRATEGY,
      reason: "bisection produced a degenerate weight vector".into(),
    });
  }
  Ok(weights / total)
}
