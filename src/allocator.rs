use crate::error::PipelineError;
use crate::fleet::InstrumentTable;
use crate::statistics::{InstrumentStatistics, RiskLabel};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

impl RiskTolerance {
    /// Cumulative filter: a lower tolerance admits every label a higher one does, plus more.
    pub fn admits(self, label: RiskLabel) -> bool {
        match self {
            Self::High => label == RiskLabel::High,
            Self::Medium => matches!(label, RiskLabel::Medium | RiskLabel::High),
            Self::Low => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTolerance {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(PipelineError::InvalidInput(format!(
                "unrecognized risk tolerance '{}' (expected low, medium or high)",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AllocationPlan {
    /// (identifier, weight %), heaviest first. Weights sum to 100.
    pub allocations: Vec<(String, f64)>,
    /// Expected annual return of the portfolio, percent.
    pub expected_return: f64,
    /// Expected annual volatility of the portfolio, percent.
    pub expected_volatility: f64,
}

pub fn filter_by_tolerance(table: &InstrumentTable, tolerance: RiskTolerance) -> Vec<&InstrumentStatistics> {
    table.values().filter(|s| tolerance.admits(s.risk)).collect()
}

/// Weights proportional to each survivor's risk-adjusted return. Negative
/// ratios get no weight; if nothing positive remains, weights are equal.
pub fn allocation_weights(rows: &[&InstrumentStatistics]) -> Vec<f64> {
    let n = rows.len();
    if n == 0 {
        return Vec::new();
    }

    let scores: Vec<f64> = rows.iter().map(|s| s.sharpe_ratio.max(0.0)).collect();
    let total: f64 = scores.iter().sum();

    if total > 0.0 && total.is_finite() {
        scores.iter().map(|s| s / total).collect()
    } else {
        debug!("Risk-adjusted returns sum to {}; falling back to equal weights", total);
        vec![1.0 / n as f64; n]
    }
}

/// Return is the weighted mean of instrument returns. Volatility treats
/// instruments as uncorrelated: sqrt(sum w^2 * sigma^2).
fn portfolio_moments(rows: &[&InstrumentStatistics], weights: &[f64]) -> (f64, f64) {
    let expected_return = rows
        .iter()
        .zip(weights)
        .map(|(s, w)| w * s.annual_return)
        .sum();
    let variance: f64 = rows
        .iter()
        .zip(weights)
        .map(|(s, w)| (w * s.volatility).powi(2))
        .sum();
    (expected_return, variance.sqrt())
}

pub fn allocate(table: &InstrumentTable, tolerance: RiskTolerance) -> Result<AllocationPlan, PipelineError> {
    let rows = filter_by_tolerance(table, tolerance);
    if rows.is_empty() {
        return Err(PipelineError::EmptyFilterResult {
            tolerance: tolerance.to_string(),
        });
    }

    let weights = allocation_weights(&rows);
    let (expected_return, expected_volatility) = portfolio_moments(&rows, &weights);

    let mut allocations: Vec<(String, f64)> = rows
        .iter()
        .zip(&weights)
        .map(|(s, w)| (s.identifier.clone(), w * 100.0))
        .collect();
    allocations.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    info!(
        "Allocated across {} of {} instruments ({} tolerance): E[r]={:.2}%, vol={:.2}%",
        allocations.len(),
        table.len(),
        tolerance,
        expected_return,
        expected_volatility
    );

    Ok(AllocationPlan {
        allocations,
        expected_return,
        expected_volatility,
    })
}
