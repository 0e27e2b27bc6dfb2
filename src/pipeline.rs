use crate::allocator::{allocate, RiskTolerance};
use crate::artifacts::ArtifactStore;
use crate::config::{PipelineConfig, MAX_HORIZON_YEARS};
use crate::data::PriceSource;
use crate::error::PipelineError;
use crate::fleet::FleetAggregator;
use crate::predictor::SequencePredictor;
use crate::simulator::{simulate, SimulationOutcome, SimulationParams};
use candle_core::Device;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Clone, Debug)]
pub struct InvestmentRequest {
    pub identifiers: Vec<String>,
    pub risk_tolerance: String,
    pub horizon_years: i64,
    pub monthly_contribution: f64,
    pub target_fund: Option<f64>,
}

/// Request fields after validation, in the types the stages consume.
#[derive(Clone, Copy, Debug, PartialEq)]
struct ValidatedRequest {
    tolerance: RiskTolerance,
    horizon_years: u32,
}

impl InvestmentRequest {
    pub fn new(
        identifiers: Vec<String>,
        risk_tolerance: impl Into<String>,
        horizon_years: i64,
        monthly_contribution: f64,
    ) -> Self {
        Self {
            identifiers,
            risk_tolerance: risk_tolerance.into(),
            horizon_years,
            monthly_contribution,
            target_fund: None,
        }
    }

    pub fn with_target(mut self, target_fund: f64) -> Self {
        self.target_fund = Some(target_fund);
        self
    }

    /// Horizon is the number of years until retirement.
    pub fn from_ages(
        identifiers: Vec<String>,
        risk_tolerance: impl Into<String>,
        current_age: i64,
        retirement_age: i64,
        monthly_contribution: f64,
    ) -> Result<Self, PipelineError> {
        let years = retirement_age - current_age;
        if current_age < 0 || years <= 0 {
            return Err(PipelineError::InvalidInput(
                "Invalid retirement age or current age".to_string(),
            ));
        }
        Ok(Self::new(identifiers, risk_tolerance, years, monthly_contribution))
    }

    fn validate(&self) -> Result<ValidatedRequest, PipelineError> {
        if self.horizon_years <= 0 {
            return Err(PipelineError::InvalidInput(format!(
                "horizon must be a positive number of years, got {}",
                self.horizon_years
            )));
        }
        if self.horizon_years > MAX_HORIZON_YEARS {
            return Err(PipelineError::InvalidInput(format!(
                "horizon of {} years exceeds the {}-year limit",
                self.horizon_years, MAX_HORIZON_YEARS
            )));
        }
        if !self.monthly_contribution.is_finite() || self.monthly_contribution < 0.0 {
            return Err(PipelineError::InvalidInput(format!(
                "monthly contribution must be a non-negative amount, got {}",
                self.monthly_contribution
            )));
        }
        if let Some(target) = self.target_fund {
            if !target.is_finite() || target <= 0.0 {
                return Err(PipelineError::InvalidInput(format!(
                    "target fund must be positive, got {}",
                    target
                )));
            }
        }
        if self.identifiers.iter().all(|s| s.trim().is_empty()) {
            return Err(PipelineError::InvalidInput("no instruments requested".to_string()));
        }

        let tolerance: RiskTolerance = self.risk_tolerance.parse()?;
        let horizon_years = u32::try_from(self.horizon_years)
            .map_err(|_| PipelineError::InvalidInput(format!("horizon {} out of range", self.horizon_years)))?;

        Ok(ValidatedRequest { tolerance, horizon_years })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct InvestmentStrategy {
    /// (identifier, weight %), heaviest first.
    pub allocations: Vec<(String, f64)>,
    pub total_future_value: f64,
    pub average_annual_return_percentage: f64,
    pub expected_volatility_percentage: f64,
    pub total_invested: f64,
    pub risk_estimate: SimulationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_fund: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_probability: Option<f64>,
    #[serde(skip)]
    pub risk_tolerance: Option<RiskTolerance>,
    #[serde(skip)]
    pub horizon_years: u32,
    /// Identifiers dropped by the fleet, with the reason.
    #[serde(skip)]
    pub skipped: Vec<(String, String)>,
}

/// Fleet, allocator and simulator wired together behind one entry point.
pub struct Pipeline {
    fleet: FleetAggregator,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn PriceSource>,
        store: Arc<dyn ArtifactStore>,
        config: PipelineConfig,
        device: Device,
    ) -> Self {
        let predictor = Arc::new(SequencePredictor::new(store, config.training.clone(), device));
        let fleet = FleetAggregator::new(
            source,
            predictor,
            config.lookback_range.clone(),
            config.thresholds,
            config.periods_per_year,
            config.concurrency,
        );
        Self { fleet, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validates before any data is fetched or any model is touched.
    pub async fn run<R: Rng>(
        &self,
        request: &InvestmentRequest,
        rng: &mut R,
    ) -> Result<InvestmentStrategy, PipelineError> {
        let started = Instant::now();
        let validated = request.validate()?;
        info!(
            "Planning for {} instruments: tolerance={}, horizon={}y, monthly={:.2}",
            request.identifiers.len(),
            validated.tolerance,
            validated.horizon_years,
            request.monthly_contribution
        );

        let report = self.fleet.collect(&request.identifiers).await;
        if report.table.is_empty() {
            return Err(PipelineError::UpstreamUnavailable {
                attempted: report.attempted,
            });
        }

        let plan = allocate(&report.table, validated.tolerance)?;

        let params = SimulationParams {
            annual_return_pct: plan.expected_return,
            annual_volatility_pct: plan.expected_volatility,
            horizon_years: validated.horizon_years,
            monthly_contribution: request.monthly_contribution,
            paths: self.config.simulation_paths,
            confidence: self.config.confidence,
            target: request.target_fund,
        };
        let outcome = simulate(&params, rng)?;

        info!(
            "Plan ready in {:.1}s: {} holdings, expected value {:.2} on {:.2} invested",
            started.elapsed().as_secs_f64(),
            plan.allocations.len(),
            outcome.mean,
            outcome.total_invested
        );

        Ok(InvestmentStrategy {
            total_future_value: outcome.mean,
            average_annual_return_percentage: plan.expected_return,
            expected_volatility_percentage: plan.expected_volatility,
            total_invested: outcome.total_invested,
            target_fund: request.target_fund,
            target_probability: outcome.target_probability,
            risk_tolerance: Some(validated.tolerance),
            horizon_years: validated.horizon_years,
            skipped: report
                .failures
                .iter()
                .map(|e| (e.identifier().to_string(), e.to_string()))
                .collect(),
            allocations: plan.allocations,
            risk_estimate: outcome,
        })
    }
}

pub fn print_report(strategy: &InvestmentStrategy) {
    let tolerance = strategy
        .risk_tolerance
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║              Portfolio Forecast Investment Plan            ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  Risk Tolerance         : {:<10}                       ║",
        tolerance
    );
    println!(
        "║  Horizon                : {:>4} years                       ║",
        strategy.horizon_years
    );
    println!(
        "║  Expected Annual Return : {:>+7.2}%                        ║",
        strategy.average_annual_return_percentage
    );
    println!(
        "║  Expected Annual Vol    : {:>7.2}%                        ║",
        strategy.expected_volatility_percentage
    );
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Instrument          Weight                                ║");
    println!("╠════════════════════════════════════════════════════════════╣");

    for (id, weight) in &strategy.allocations {
        println!("║  {:<18} {:>7.2}%                                ║", id, weight);
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Simulated Outcome:                                        ║");
    println!(
        "║    Total Invested     : {:>16.2}                   ║",
        strategy.total_invested
    );
    println!(
        "║    Expected Value     : {:>16.2}                   ║",
        strategy.total_future_value
    );
    println!(
        "║    Std Dev            : {:>16.2}                   ║",
        strategy.risk_estimate.std_dev
    );
    println!(
        "║    Confidence Range   : {:>14.2} .. {:<14.2}     ║",
        strategy.risk_estimate.confidence_interval.0,
        strategy.risk_estimate.confidence_interval.1
    );
    if let (Some(target), Some(p)) = (strategy.target_fund, strategy.target_probability) {
        println!(
            "║    P(value >= {:>12.2}) : {:>6.1}%                     ║",
            target,
            p * 100.0
        );
    }

    if !strategy.skipped.is_empty() {
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Skipped Instruments:                                      ║");
        for (id, _) in &strategy.skipped {
            println!("║    {:<56}║", id);
        }
    }

    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::config::RiskThresholds;
    use crate::data::testing::StaticPriceSource;
    use crate::data::PriceSeries;
    use crate::predictor::tests::small_config;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            training: small_config(),
            simulation_paths: 500,
            concurrency: 2,
            ..PipelineConfig::default()
        }
    }

    fn source() -> Arc<StaticPriceSource> {
        Arc::new(
            StaticPriceSource::default()
                .with_series(PriceSeries::new_mock("AAA", 70, 0.01, 11))
                .with_series(PriceSeries::new_mock("BBB", 70, 0.03, 12))
                .with_series(PriceSeries::new_mock("CCC", 70, 0.02, 13)),
        )
    }

    fn pipeline(source: Arc<StaticPriceSource>, config: PipelineConfig) -> Pipeline {
        Pipeline::new(source, Arc::new(MemoryArtifactStore::new()), config, Device::Cpu)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_produces_complete_strategy() {
        let src = source();
        let p = pipeline(src.clone(), test_config());
        let request = InvestmentRequest::new(ids(&["AAA", "BBB", "CCC", "NOPE"]), "low", 10, 1_000.0)
            .with_target(50_000.0);

        let strategy = p.run(&request, &mut StdRng::seed_from_u64(9)).await.unwrap();

        assert_eq!(strategy.allocations.len(), 3);
        let sum: f64 = strategy.allocations.iter().map(|(_, w)| w).sum();
        assert!((sum - 100.0).abs() < 1e-6);
        assert_eq!(strategy.total_invested, 120_000.0);
        assert_eq!(strategy.total_future_value, strategy.risk_estimate.mean);
        assert!(strategy.risk_estimate.confidence_interval.0 <= strategy.risk_estimate.confidence_interval.1);
        let p_target = strategy.target_probability.unwrap();
        assert!((0.0..=1.0).contains(&p_target));
        assert_eq!(strategy.skipped.len(), 1);
        assert_eq!(strategy.skipped[0].0, "NOPE");
        assert_eq!(src.fetch_count(), 4);
    }

    #[tokio::test]
    async fn test_result_json_shape() {
        let p = pipeline(source(), test_config());
        let request = InvestmentRequest::new(ids(&["AAA", "BBB"]), "Low", 5, 500.0);
        let strategy = p.run(&request, &mut StdRng::seed_from_u64(1)).await.unwrap();

        let json = serde_json::to_value(&strategy).unwrap();
        for key in [
            "allocations",
            "total_future_value",
            "average_annual_return_percentage",
            "expected_volatility_percentage",
            "total_invested",
            "risk_estimate",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert!(json.get("target_probability").is_none());
        assert!(json["allocations"][0][0].is_string());
        assert!(json["allocations"][0][1].is_number());
        assert_eq!(json["risk_estimate"]["confidence_interval"].as_array().unwrap().len(), 2);
        assert!(json["risk_estimate"].get("total_invested").is_none());
    }

    #[tokio::test]
    async fn test_invalid_horizon_rejected_before_any_fetch() {
        let src = source();
        let p = pipeline(src.clone(), test_config());
        let mut rng = StdRng::seed_from_u64(0);

        for years in [0, -3] {
            let request = InvestmentRequest::new(ids(&["AAA"]), "low", years, 100.0);
            let err = p.run(&request, &mut rng).await.unwrap_err();
            assert!(matches!(err, PipelineError::InvalidInput(_)));
        }
        assert_eq!(src.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected_before_any_fetch() {
        let src = source();
        let p = pipeline(src.clone(), test_config());
        let mut rng = StdRng::seed_from_u64(0);

        let bad = [
            InvestmentRequest::new(ids(&["AAA"]), "reckless", 5, 100.0),
            InvestmentRequest::new(ids(&["AAA"]), "low", 5, -1.0),
            InvestmentRequest::new(ids(&["AAA"]), "low", 5, 100.0).with_target(0.0),
            InvestmentRequest::new(Vec::new(), "low", 5, 100.0),
        ];
        for request in &bad {
            assert!(matches!(
                p.run(request, &mut rng).await,
                Err(PipelineError::InvalidInput(_))
            ));
        }
        assert_eq!(src.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_all_instruments_failing_is_upstream_unavailable() {
        let p = pipeline(source(), test_config());
        let request = InvestmentRequest::new(ids(&["X", "Y", "Z"]), "low", 5, 100.0);
        let err = p.run(&request, &mut StdRng::seed_from_u64(0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamUnavailable { attempted: 3 }));
    }

    #[tokio::test]
    async fn test_nothing_matching_tolerance_is_empty_filter_result() {
        // Thresholds no realistic volatility reaches: every instrument is Low.
        let config = PipelineConfig {
            thresholds: RiskThresholds { low_below: 1e9, high_at: 2e9 },
            ..test_config()
        };
        let p = pipeline(source(), config);
        let request = InvestmentRequest::new(ids(&["AAA", "BBB"]), "high", 5, 100.0);
        let err = p.run(&request, &mut StdRng::seed_from_u64(0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyFilterResult { .. }));
        assert!(err.to_string().contains("no instruments match"));
    }

    #[test]
    fn test_from_ages() {
        let request = InvestmentRequest::from_ages(ids(&["AAA"]), "medium", 30, 60, 100.0).unwrap();
        assert_eq!(request.horizon_years, 30);

        for (current, retirement) in [(60, 60), (65, 60), (-1, 60)] {
            match InvestmentRequest::from_ages(ids(&["AAA"]), "medium", current, retirement, 100.0) {
                Err(PipelineError::InvalidInput(msg)) => {
                    assert_eq!(msg, "Invalid retirement age or current age")
                }
                other => panic!("expected InvalidInput, got {:?}", other.map(|r| r.horizon_years)),
            }
        }
    }
}
