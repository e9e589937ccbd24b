//! # Portfolio Data
//!
//! $$
//! r_{t,i} = \frac{p_{t,i}}{p_{t-1,i}} - 1
//! $$
//!
//! Price tables, daily return matrices and their validation.

use std::io::Read;

use chrono::NaiveDate;
use csv::ReaderBuilder;
use nalgebra::DVector;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView2;
use ndarray::s;
use tracing::debug;
use tracing::warn;

use crate::error::PortfolioError;
use crate::error::Result;

/// Daily returns threshold above which a move is logged as suspicious.
const EXTREME_DAILY_RETURN: f64 = 0.5;

fn parse_date(raw: &str) -> Result<NaiveDate> {
  let raw = raw.trim();
  match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
    Ok(date) => Ok(date),
    Err(_) => Ok(NaiveDate::parse_from_str(raw, "%Y%m%d")?),
  }
}

/// Closing prices, dates × assets, chronologically sorted.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceTable {
  pub dates: Vec<NaiveDate>,
  pub assets: Vec<String>,
  pub prices: Array2<f64>,
}

impl PriceTable {
  /// Read a `date,<asset>,...` CSV with a header row.
  ///
  /// Rows may come in any order; they are sorted by date.
  pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = rdr.headers()?.clone();
    if headers.len() < 2 {
      return Err(PortfolioError::InvalidData(
        "price file needs a date column and at least one asset column".into(),
      ));
    }
    let assets: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut rows: Vec<(NaiveDate, Vec<f64>)> = Vec::new();
    for (line, record) in rdr.records().enumerate() {
      let record = record?;
      if record.len() != headers.len() {
        return Err(PortfolioError::DimensionMismatch {
          context: "price row width",
          expected: headers.len(),
          found: record.len(),
        });
      }
      let date = parse_date(&record[0])?;
      let mut prices = Vec::with_capacity(assets.len());
      for (col, cell) in record.iter().skip(1).enumerate() {
        let price: f64 = cell.trim().parse().map_err(|_| {
          PortfolioError::InvalidData(format!(
            "row {} column {}: missing or non-numeric price `{cell}`",
            line + 2,
            assets[col]
          ))
        })?;
        prices.push(price);
      }
      rows.push((date, prices));
    }

    rows.sort_by_key(|(date, _)| *date);

    let n = rows.len();
    let m = assets.len();
    let mut prices = Array2::<f64>::zeros((n, m));
    let mut dates = Vec::with_capacity(n);
    for (t, (date, row)) in rows.into_iter().enumerate() {
      for (i, p) in row.into_iter().enumerate() {
        prices[[t, i]] = p;
      }
      dates.push(date);
    }

    Self::new(dates, assets, prices)
  }

  /// Validate and wrap an in-memory price table.
  pub fn new(dates: Vec<NaiveDate>, assets: Vec<String>, prices: Array2<f64>) -> Result<Self> {
    check_shape(&dates, &assets, prices.view())?;
    check_chronological(&dates)?;
    if let Some(((t, i), p)) = prices
      .indexed_iter()
      .find(|(_, p)| !p.is_finite() || **p <= 0.0)
    {
      return Err(PortfolioError::InvalidData(format!(
        "non-positive or non-finite price {p} for {} on {}",
        assets[i], dates[t]
      )));
    }
    Ok(Self {
      dates,
      assets,
      prices,
    })
  }

  /// Simple daily returns; the first date has no return and is dropped.
  pub fn to_returns(&self) -> Result<ReturnSeries> {
    let n = self.prices.nrows();
    if n < 2 {
      return Err(PortfolioError::InsufficientData {
        observations: n,
        required: 2,
      });
    }
    let prev = self.prices.slice(s![..n - 1, ..]);
    let next = self.prices.slice(s![1.., ..]);
    let returns = &next / &prev - 1.0;

    for (i, asset) in self.assets.iter().enumerate() {
      let extreme = returns
        .column(i)
        .iter()
        .filter(|r| r.abs() > EXTREME_DAILY_RETURN)
        .count();
      if extreme > 0 {
        warn!(asset = %asset, count = extreme, "daily returns beyond 50%");
      }
    }

    ReturnSeries::new(self.dates[1..].to_vec(), self.assets.clone(), returns)
  }
}

/// Daily fractional returns, dates × assets, gap-free and chronological.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnSeries {
  dates: Vec<NaiveDate>,
  assets: Vec<String>,
  values: Array2<f64>,
}

impl ReturnSeries {
  pub fn new(dates: Vec<NaiveDate>, assets: Vec<String>, values: Array2<f64>) -> Result<Self> {
    check_shape(&dates, &assets, values.view())?;
    check_chronological(&dates)?;
    if let Some(((t, i), v)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
      return Err(PortfolioError::InvalidData(format!(
        "missing or non-finite return {v} for {} on {}",
        assets[i], dates[t]
      )));
    }
    debug!(
      observations = values.nrows(),
      assets = values.ncols(),
      "return series constructed"
    );
    Ok(Self {
      dates,
      assets,
      values,
    })
  }

  /// Build a series on consecutive calendar days starting at 2000-01-03.
  ///
  /// Convenient when only the matrix matters.
  pub fn from_matrix(assets: Vec<String>, values: Array2<f64>) -> Result<Self> {
    let start = NaiveDate::from_ymd_opt(2000, 1, 3)
      .ok_or_else(|| PortfolioError::InvalidData("invalid start date".into()))?;
    let dates = start.iter_days().take(values.nrows()).collect();
    Self::new(dates, assets, values)
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn assets(&self) -> &[String] {
    &self.assets
  }

  pub fn values(&self) -> ArrayView2<'_, f64> {
    self.values.view()
  }

  pub fn n_observations(&self) -> usize {
    self.values.nrows()
  }

  pub fn n_assets(&self) -> usize {
    self.values.ncols()
  }

  /// Most recent `n` observations (all of them when `n` exceeds the length).
  pub fn tail(&self, n: usize) -> Self {
    let start = self.n_observations().saturating_sub(n);
    Self {
      dates: self.dates[start..].to_vec(),
      assets: self.assets.clone(),
      values: self.values.slice(s![start.., ..]).to_owned(),
    }
  }

  /// Daily return path of a constant-weight portfolio.
  pub fn portfolio_returns(&self, weights: &DVector<f64>) -> Result<Array1<f64>> {
    if weights.len() != self.n_assets() {
      return Err(PortfolioError::DimensionMismatch {
        context: "portfolio weights",
        expected: self.n_assets(),
        found: weights.len(),
      });
    }
    let w = Array1::from_iter(weights.iter().copied());
    Ok(self.values.dot(&w))
  }
}

fn check_shape(dates: &[NaiveDate], assets: &[String], values: ArrayView2<f64>) -> Result<()> {
  if values.nrows() != dates.len() {
    return Err(PortfolioError::DimensionMismatch {
      context: "dates vs matrix rows",
      expected: dates.len(),
      found: values.nrows(),
    });
  }
  if values.ncols() != assets.len() {
    return Err(PortfolioError::DimensionMismatch {
      context: "assets vs matrix columns",
      expected: assets.len(),
      found: values.ncols(),
    });
  }
  if assets.is_empty() {
    return Err(PortfolioError::DimensionMismatch {
      context: "asset count",
      expected: 1,
      found: 0,
    });
  }
  Ok(())
}

fn check_chronological(dates: &[NaiveDate]) -> Result<()> {
  match dates.windows(2).find(|w| w[1] <= w[0]) {
    Some(w) => Err(PortfolioError::InvalidData(format!(
      "dates must be strictly increasing: {} followed by {}",
      w[0], w[1]
    ))),
    None => Ok(()),
  }
}
