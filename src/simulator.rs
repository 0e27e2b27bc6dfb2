use crate::error::PipelineError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

/// Paths simulated by one rayon task. Each chunk owns a seeded generator so
/// the result depends only on the caller's RNG, not on thread scheduling.
const PATHS_PER_CHUNK: usize = 512;

#[derive(Clone, Debug)]
pub struct SimulationParams {
    /// Expected annual portfolio return, percent.
    pub annual_return_pct: f64,
    /// Expected annual portfolio volatility, percent.
    pub annual_volatility_pct: f64,
    pub horizon_years: u32,
    pub monthly_contribution: f64,
    pub paths: usize,
    /// Lower and upper percentile of the confidence interval, 0..=100.
    pub confidence: (f64, f64),
    /// Goal amount; when set, the share of paths reaching it is reported.
    pub target: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulationOutcome {
    pub mean: f64,
    pub std_dev: f64,
    pub confidence_interval: (f64, f64),
    #[serde(skip)]
    pub total_invested: f64,
    #[serde(skip)]
    pub target_probability: Option<f64>,
}

/// Monte Carlo projection of a fixed monthly contribution. Every month draws
/// a normal growth rate; a path's value is the contribution times the sum of
/// its cumulative growth factors.
pub fn simulate<R: Rng>(params: &SimulationParams, rng: &mut R) -> Result<SimulationOutcome, PipelineError> {
    let months = params.horizon_years as usize * 12;
    if months == 0 {
        return Err(PipelineError::InvalidInput("investment horizon must be at least one year".to_string()));
    }
    if params.paths == 0 {
        return Err(PipelineError::InvalidInput("simulation needs at least one path".to_string()));
    }
    if !params.monthly_contribution.is_finite() || params.monthly_contribution < 0.0 {
        return Err(PipelineError::InvalidInput(format!(
            "monthly contribution must be a non-negative amount, got {}",
            params.monthly_contribution
        )));
    }

    let monthly_mean = params.annual_return_pct / 100.0 / 12.0;
    let monthly_std = params.annual_volatility_pct / 100.0 / 12f64.sqrt();
    let growth = Normal::new(monthly_mean, monthly_std).map_err(|e| {
        PipelineError::InvalidInput(format!(
            "cannot sample growth with mean {} and std {}: {}",
            monthly_mean, monthly_std, e
        ))
    })?;

    let chunk_count = params.paths.div_ceil(PATHS_PER_CHUNK);
    let seeds: Vec<u64> = (0..chunk_count).map(|_| rng.r#gen()).collect();
    let contribution = params.monthly_contribution;

    let mut finals: Vec<f64> = seeds
        .into_par_iter()
        .enumerate()
        .flat_map_iter(|(chunk, seed)| {
            let mut chunk_rng = StdRng::seed_from_u64(seed);
            let start = chunk * PATHS_PER_CHUNK;
            let len = PATHS_PER_CHUNK.min(params.paths - start);
            (0..len)
                .map(|_| simulate_path(&growth, months, contribution, &mut chunk_rng))
                .collect::<Vec<_>>()
        })
        .collect();

    let n = finals.len() as f64;
    let target_probability = params
        .target
        .map(|goal| finals.iter().filter(|&&v| v >= goal).count() as f64 / n);

    finals.sort_by(|a, b| a.total_cmp(b));
    let (mean, std_dev) = mean_and_population_std(&finals);
    let confidence_interval = (
        percentile(&finals, params.confidence.0),
        percentile(&finals, params.confidence.1),
    );

    let total_invested = contribution * months as f64;

    info!(
        "Simulated {} paths over {} months: mean={:.2}, std={:.2}, CI=[{:.2}, {:.2}]",
        params.paths, months, mean, std_dev, confidence_interval.0, confidence_interval.1
    );

    Ok(SimulationOutcome {
        mean,
        std_dev,
        confidence_interval,
        total_invested,
        target_probability,
    })
}

fn simulate_path(growth: &Normal<f64>, months: usize, contribution: f64, rng: &mut StdRng) -> f64 {
    let mut factor = 1.0;
    let mut total = 0.0;
    for _ in 0..months {
        factor *= 1.0 + growth.sample(rng);
        total += factor;
    }
    contribution * total
}

/// Over sorted values. A collapsed distribution reports its single value and
/// exactly zero spread instead of accumulated rounding.
fn mean_and_population_std(sorted: &[f64]) -> (f64, f64) {
    match (sorted.first(), sorted.last()) {
        (Some(&lo), Some(&hi)) if lo == hi => (lo, 0.0),
        (Some(_), Some(_)) => {
            let n = sorted.len() as f64;
            let mean = sorted.iter().sum::<f64>() / n;
            let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            (mean, variance.sqrt())
        }
        _ => (f64::NAN, f64::NAN),
    }
}

/// Linear interpolation between closest ranks over sorted values.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = (pct.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}
