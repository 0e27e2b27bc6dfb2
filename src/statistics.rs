use crate::config::RiskThresholds;
use crate::error::InstrumentError;
use crate::predictor::ForecastSeries;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskLabel {
    Low,
    Medium,
    High,
}

impl RiskLabel {
    /// Step function of annualized volatility (%): Low below `low_below`,
    /// High at or above `high_at`, Medium in between.
    pub fn from_volatility(volatility: f64, thresholds: RiskThresholds) -> Self {
        if volatility < thresholds.low_below {
            Self::Low
        } else if volatility < thresholds.high_at {
            Self::Medium
        } else {
            Self::High
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

impl fmt::Display for RiskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstrumentStatistics {
    pub identifier: String,
    /// Annualized return, percent.
    pub annual_return: f64,
    /// Annualized volatility, percent.
    pub volatility: f64,
    pub beta: f64,
    /// annual_return / volatility, 0 when volatility is 0.
    pub sharpe_ratio: f64,
    pub risk: RiskLabel,
}

/// Percentage change between consecutive defined forecast values.
pub fn period_returns(forecast: &ForecastSeries) -> Vec<f64> {
    forecast
        .defined()
        .windows(2)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

fn mean_and_sample_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

pub fn compute_statistics(
    identifier: &str,
    forecast: &ForecastSeries,
    beta: Option<f64>,
    thresholds: RiskThresholds,
    periods_per_year: f64,
) -> Result<InstrumentStatistics, InstrumentError> {
    let undefined = |reason: String| InstrumentError::Statistics {
        identifier: identifier.to_string(),
        reason,
    };

    let returns = period_returns(forecast);
    if returns.len() < 2 {
        return Err(undefined(format!(
            "{} period returns, need at least 2",
            returns.len()
        )));
    }

    let (mean, std) = mean_and_sample_std(&returns);
    let annual_return = mean * periods_per_year * 100.0;
    let volatility = std * periods_per_year.sqrt() * 100.0;

    if !annual_return.is_finite() || !volatility.is_finite() {
        return Err(undefined(format!(
            "non-finite return {} or volatility {}",
            annual_return, volatility
        )));
    }

    let sharpe_ratio = if volatility == 0.0 { 0.0 } else { annual_return / volatility };

    Ok(InstrumentStatistics {
        identifier: identifier.to_string(),
        annual_return,
        volatility,
        beta: beta.filter(|b| b.is_finite()).unwrap_or(1.0),
        sharpe_ratio,
        risk: RiskLabel::from_volatility(volatility, thresholds),
    })
}
