use crate::config::RiskThresholds;
use crate::data::PriceSource;
use crate::error::InstrumentError;
use crate::predictor::{ArtifactOrigin, SequencePredictor};
use crate::statistics::{compute_statistics, InstrumentStatistics};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// One row per successfully processed instrument. Row order carries no meaning.
pub type InstrumentTable = BTreeMap<String, InstrumentStatistics>;

#[derive(Debug, Default)]
pub struct FleetReport {
    pub table: InstrumentTable,
    pub failures: Vec<InstrumentError>,
    pub attempted: usize,
}

/// Fans the predictor and statistics engine out over a basket with a
/// bounded number of instruments in flight.
pub struct FleetAggregator {
    source: Arc<dyn PriceSource>,
    predictor: Arc<SequencePredictor>,
    lookback_range: String,
    thresholds: RiskThresholds,
    periods_per_year: f64,
    concurrency: usize,
}

impl FleetAggregator {
    pub fn new(
        source: Arc<dyn PriceSource>,
        predictor: Arc<SequencePredictor>,
        lookback_range: impl Into<String>,
        thresholds: RiskThresholds,
        periods_per_year: f64,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            predictor,
            lookback_range: lookback_range.into(),
            thresholds,
            periods_per_year,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn collect(&self, identifiers: &[String]) -> FleetReport {
        let symbols = dedup_identifiers(identifiers);
        let total = symbols.len();
        info!(
            "Processing {} instruments with up to {} concurrent workers",
            total, self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(total);

        for symbol in symbols {
            let source = Arc::clone(&self.source);
            let predictor = Arc::clone(&self.predictor);
            let semaphore = Arc::clone(&semaphore);
            let range = self.lookback_range.clone();
            let thresholds = self.thresholds;
            let periods_per_year = self.periods_per_year;
            let task_symbol = symbol.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| InstrumentError::Model {
                    identifier: task_symbol.clone(),
                    reason: format!("worker pool closed: {}", e),
                })?;
                process_instrument(
                    source.as_ref(),
                    predictor,
                    &task_symbol,
                    &range,
                    thresholds,
                    periods_per_year,
                )
                .await
            });
            handles.push((symbol, handle));
        }

        let mut report = FleetReport {
            attempted: total,
            ..Default::default()
        };

        for (symbol, handle) in handles {
            match handle.await {
                Ok(Ok(stats)) => {
                    info!(
                        "[{}/{}] {} => return {:.2}%, vol {:.2}%, sharpe {:.2}, risk {}",
                        report.table.len() + report.failures.len() + 1,
                        total,
                        symbol,
                        stats.annual_return,
                        stats.volatility,
                        stats.sharpe_ratio,
                        stats.risk
                    );
                    report.table.insert(symbol, stats);
                }
                Ok(Err(e)) => {
                    warn!("Skipping {}: {}", symbol, e);
                    report.failures.push(e);
                }
                Err(join_err) => {
                    error!("Worker for {} aborted: {}", symbol, join_err);
                    report.failures.push(InstrumentError::Model {
                        identifier: symbol,
                        reason: format!("worker aborted: {}", join_err),
                    });
                }
            }
        }

        info!(
            "Fleet finished: {} instruments processed, {} skipped",
            report.table.len(),
            report.failures.len()
        );
        report
    }
}

async fn process_instrument(
    source: &dyn PriceSource,
    predictor: Arc<SequencePredictor>,
    symbol: &str,
    range: &str,
    thresholds: RiskThresholds,
    periods_per_year: f64,
) -> Result<InstrumentStatistics, InstrumentError> {
    let mut series = source
        .fetch(symbol, range)
        .await
        .map_err(|e| InstrumentError::Upstream {
            identifier: symbol.to_string(),
            reason: format!("{:#}", e),
        })?;

    if series.is_empty() {
        return Err(InstrumentError::DataUnavailable {
            identifier: symbol.to_string(),
            observations: 0,
            required: predictor.window() + 1,
        });
    }

    // Artifacts are keyed by the requested identifier, not the provider's spelling.
    series.symbol = symbol.to_string();

    if let Some((first, last)) = series.span() {
        debug!(
            "{}: {} observations from {} to {}",
            symbol,
            series.len(),
            first.format("%Y-%m-%d"),
            last.format("%Y-%m-%d")
        );
    }

    let beta = source.sensitivity(symbol).await.unwrap_or(None);

    let forecast = tokio::task::spawn_blocking(move || predictor.forecast(&series))
        .await
        .map_err(|e| InstrumentError::Model {
            identifier: symbol.to_string(),
            reason: format!("forecast worker aborted: {}", e),
        })??;

    let origin = match forecast.origin {
        ArtifactOrigin::Cached => "cached",
        ArtifactOrigin::Trained => "freshly trained",
    };
    debug!(
        "{}: forecast from {} model, price scale [{:.2}, {:.2}]",
        symbol, origin, forecast.scaler.data_min, forecast.scaler.data_max
    );

    compute_statistics(symbol, &forecast.series, beta, thresholds, periods_per_year)
}

/// Trimmed, non-empty, first occurrence wins. Duplicates would write the same artifact key twice.
fn dedup_identifiers(identifiers: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    identifiers
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
