use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration as StdDuration, SystemTime};
use tracing::{debug, info, warn};

/// A single periodic observation.
#[derive(Clone, Debug)]
pub struct Candle {
    pub date: DateTime<Utc>,
    pub close: f64,
}

/// Time-ordered closing prices for one instrument over the lookback window.
#[derive(Clone, Debug)]
pub struct PriceSeries {
    pub symbol: String,
    pub history: Vec<Candle>,
}

impl PriceSeries {
    pub fn closes(&self) -> Vec<f64> {
        self.history.iter().map(|c| c.close).collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// First and last observation dates.
    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.history.first()?.date, self.history.last()?.date))
    }
}

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Market-data provider consumed by the fleet.
pub trait PriceSource: Send + Sync {
    /// Returns the price history of `symbol` over `range`. An empty series
    /// means the provider has nothing for that window.
    fn fetch<'a>(&'a self, symbol: &'a str, range: &'a str) -> SourceFuture<'a, PriceSeries>;

    /// Market-sensitivity coefficient, when the provider publishes one.
    fn sensitivity<'a>(&'a self, _symbol: &'a str) -> SourceFuture<'a, Option<f64>> {
        Box::pin(async { Ok(None) })
    }
}

/// Sliding-window pairs: each input window of normalized prices paired with
/// the value that immediately follows it.
#[derive(Clone, Debug, Default)]
pub struct WindowedDataset {
    pub inputs: Vec<Vec<f32>>,
    pub targets: Vec<f32>,
}

impl WindowedDataset {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Builds one sample per index `i` in `window..values.len()`: input
/// `values[i - window..i]`, target `values[i]`.
pub fn build_windows(values: &[f64], window: usize) -> WindowedDataset {
    if window == 0 || values.len() <= window {
        return WindowedDataset::default();
    }

    let mut inputs = Vec::with_capacity(values.len() - window);
    let mut targets = Vec::with_capacity(values.len() - window);
    for i in window..values.len() {
        inputs.push(values[i - window..i].iter().map(|&v| v as f32).collect());
        targets.push(values[i] as f32);
    }

    WindowedDataset { inputs, targets }
}

// ──────────────────────────────────────────────────────────────────────────────
// Yahoo Finance provider
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

#[derive(Deserialize, Debug)]
struct YahooSummaryResponse {
    #[serde(rename = "quoteSummary")]
    quote_summary: YahooSummary,
}

#[derive(Deserialize, Debug)]
struct YahooSummary {
    result: Option<Vec<YahooSummaryResult>>,
}

#[derive(Deserialize, Debug)]
struct YahooSummaryResult {
    #[serde(rename = "summaryDetail")]
    summary_detail: Option<YahooSummaryDetail>,
}

#[derive(Deserialize, Debug)]
struct YahooSummaryDetail {
    beta: Option<YahooRawValue>,
}

#[derive(Deserialize, Debug)]
struct YahooRawValue {
    raw: Option<f64>,
}

const CACHE_TTL: StdDuration = StdDuration::from_secs(24 * 60 * 60);
const RETRY_BACKOFF: StdDuration = StdDuration::from_secs(2);
const USER_AGENT: &str = "Mozilla/5.0";

/// Daily closes from the Yahoo chart API, cached on disk for a day.
pub struct YahooPriceSource {
    client: reqwest::Client,
    cache_dir: PathBuf,
    max_attempts: usize,
}

impl YahooPriceSource {
    pub fn new() -> Self {
        Self::with_cache_dir(".cache")
    }

    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir: cache_dir.into(),
            max_attempts: 3,
        }
    }

    fn cache_path(&self, symbol: &str, range: &str) -> PathBuf {
        self.cache_dir.join(format!("{}_{}.json", symbol.replace(['/', '\\'], "_"), range))
    }

    /// A cached chart younger than `CACHE_TTL`, if one is on disk and parses.
    fn read_cached_chart(&self, path: &Path) -> Option<YahooChartResponse> {
        let age = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())?;
        if age >= CACHE_TTL {
            return None;
        }
        let file = std::fs::File::open(path).ok()?;
        match serde_json::from_reader(std::io::BufReader::new(file)) {
            Ok(chart) => Some(chart),
            Err(e) => {
                warn!("Ignoring unreadable response cache {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write_cached_chart(&self, path: &Path, chart: &YahooChartResponse) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let writer = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(writer, chart)?;
        Ok(())
    }

    async fn fetch_range(&self, symbol: &str, range: &str) -> Result<PriceSeries> {
        let path = self.cache_path(symbol, range);

        let chart = match self.read_cached_chart(&path) {
            Some(chart) => {
                debug!("{}: using cached {} chart", symbol, range);
                chart
            }
            None => {
                info!("{}: requesting {} of daily closes", symbol, range);
                let chart = self.request_chart(symbol, range).await?;
                if let Err(e) = self.write_cached_chart(&path, &chart) {
                    warn!("{}: could not cache chart response: {}", symbol, e);
                }
                chart
            }
        };

        Ok(chart_to_series(symbol, &chart))
    }

    async fn request_chart(&self, symbol: &str, range: &str) -> Result<YahooChartResponse> {
        let url = format!(
            "https://query1.finance.yahoo.com/v8/finance/chart/{}?range={}&interval=1d",
            encode_symbol(symbol),
            range
        );

        let mut attempt = 1;
        loop {
            let outcome = async {
                let resp = self
                    .client
                    .get(&url)
                    .header("User-Agent", USER_AGENT)
                    .timeout(StdDuration::from_secs(15))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<_, reqwest::Error>(resp.json::<YahooChartResponse>().await?)
            }
            .await;

            match outcome {
                Ok(chart) => return Ok(chart),
                Err(e) if attempt < self.max_attempts => {
                    warn!("{}: chart request failed (attempt {}/{}): {}", symbol, attempt, self.max_attempts, e);
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("chart request for {} failed after {} attempts", symbol, attempt)));
                }
            }
        }
    }

    async fn fetch_beta(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!(
            "https://query2.finance.yahoo.com/v10/finance/quoteSummary/{}?modules=summaryDetail",
            encode_symbol(symbol)
        );
        let resp = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .timeout(StdDuration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        let parsed = resp.json::<YahooSummaryResponse>().await?;

        Ok(parsed
            .quote_summary
            .result
            .and_then(|r| r.into_iter().next())
            .and_then(|r| r.summary_detail)
            .and_then(|d| d.beta)
            .and_then(|b| b.raw)
            .filter(|b| b.is_finite()))
    }
}

impl Default for YahooPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceSource for YahooPriceSource {
    fn fetch<'a>(&'a self, symbol: &'a str, range: &'a str) -> SourceFuture<'a, PriceSeries> {
        Box::pin(self.fetch_range(symbol, range))
    }

    fn sensitivity<'a>(&'a self, symbol: &'a str) -> SourceFuture<'a, Option<f64>> {
        Box::pin(async move {
            match self.fetch_beta(symbol).await {
                Ok(beta) => Ok(beta),
                Err(e) => {
                    debug!("Beta unavailable for {}: {}", symbol, e);
                    Ok(None)
                }
            }
        })
    }
}

fn encode_symbol(symbol: &str) -> String {
    symbol.replace('&', "%26")
}

/// Keeps only observations with both a timestamp and a close.
fn chart_to_series(symbol: &str, response: &YahooChartResponse) -> PriceSeries {
    let mut history = Vec::new();

    if let Some(result) = response.chart.result.as_ref().and_then(|r| r.first()) {
        if let Some(quote) = result.indicators.quote.first() {
            for (i, &timestamp) in result.timestamp.iter().enumerate() {
                let close = quote.close.get(i).copied().flatten();
                let date = Utc.timestamp_opt(timestamp, 0).single();
                if let (Some(close), Some(date)) = (close, date) {
                    if close.is_finite() {
                        history.push(Candle { date, close });
                    }
                }
            }
        }
    }

    PriceSeries {
        symbol: symbol.to_uppercase(),
        history,
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use chrono::Duration;
    use rand::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    impl PriceSeries {
        /// Seeded random walk with a slight upward drift.
        pub fn new_mock(symbol: &str, days: usize, daily_volatility: f64, seed: u64) -> Self {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut history = Vec::with_capacity(days);
            let mut price: f64 = 100.0;
            let mut date = Utc::now() - Duration::days(days as i64);

            for _ in 0..days {
                let change: f64 = if daily_volatility > 0.0 {
                    rng.gen_range(-daily_volatility..daily_volatility)
                } else {
                    0.0
                };
                price *= 1.0 + change + 0.0004;
                history.push(Candle { date, close: price });
                date += Duration::days(1);
            }

            Self {
                symbol: symbol.to_string(),
                history,
            }
        }
    }

    /// In-memory provider. Symbols without an entry fail like an unreachable upstream.
    #[derive(Default)]
    pub struct StaticPriceSource {
        pub series: HashMap<String, PriceSeries>,
        pub betas: HashMap<String, f64>,
        pub fetches: AtomicUsize,
    }

    impl StaticPriceSource {
        pub fn with_series(mut self, series: PriceSeries) -> Self {
            self.series.insert(series.symbol.clone(), series);
            self
        }

        pub fn with_beta(mut self, symbol: &str, beta: f64) -> Self {
            self.betas.insert(symbol.to_string(), beta);
            self
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl PriceSource for StaticPriceSource {
        fn fetch<'a>(&'a self, symbol: &'a str, _range: &'a str) -> SourceFuture<'a, PriceSeries> {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                self.series
                    .get(symbol)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("unknown symbol {}", symbol))
            })
        }

        fn sensitivity<'a>(&'a self, symbol: &'a str) -> SourceFuture<'a, Option<f64>> {
            Box::pin(async move { Ok(self.betas.get(symbol).copied()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_windows_pairs_each_window_with_next_value() {
        let values: Vec<f64> = (0..10).map(|v| v as f64).collect();
        let dataset = build_windows(&values, 3);

        assert_eq!(dataset.len(), 7);
        assert_eq!(dataset.inputs[0], vec![0.0, 1.0, 2.0]);
        assert_eq!(dataset.targets[0], 3.0);
        assert_eq!(dataset.inputs[6], vec![6.0, 7.0, 8.0]);
        assert_eq!(dataset.targets[6], 9.0);
    }

    #[test]
    fn test_build_windows_too_short() {
        let values = vec![1.0; 60];
        assert!(build_windows(&values, 60).is_empty());
        assert_eq!(build_windows(&[1.0; 61], 60).len(), 1);
    }

    #[test]
    fn test_mock_series_is_deterministic_per_seed() {
        let a = PriceSeries::new_mock("AAA", 50, 0.02, 7);
        let b = PriceSeries::new_mock("AAA", 50, 0.02, 7);
        assert_eq!(a.closes(), b.closes());
        assert_eq!(a.len(), 50);
        assert!(a.closes().iter().all(|&p| p > 0.0));
    }

    #[test]
    fn test_span_covers_first_and_last_dates() {
        let series = PriceSeries::new_mock("AAA", 30, 0.02, 1);
        let (first, last) = series.span().unwrap();
        assert_eq!(first, series.history[0].date);
        assert_eq!((last - first).num_days(), 29);

        let empty = PriceSeries { symbol: "AAA".to_string(), history: Vec::new() };
        assert!(empty.span().is_none());
    }

    #[test]
    fn test_chart_to_series_skips_null_closes() {
        let body = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1700000000, 1700086400, 1700172800],
                    "indicators": { "quote": [{ "close": [101.5, null, 103.0] }] }
                }]
            }
        }"#;
        let response: YahooChartResponse = serde_json::from_str(body).unwrap();
        let series = chart_to_series("gld", &response);

        assert_eq!(series.symbol, "GLD");
        assert_eq!(series.closes(), vec![101.5, 103.0]);
    }

    #[test]
    fn test_chart_without_result_is_empty_series() {
        let body = r#"{ "chart": { "result": null } }"#;
        let response: YahooChartResponse = serde_json::from_str(body).unwrap();
        assert!(chart_to_series("BAD", &response).is_empty());
    }

    #[test]
    fn test_response_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = YahooPriceSource::with_cache_dir(dir.path().join("charts"));
        let path = source.cache_path("M&M.NS", "5y");
        assert!(source.read_cached_chart(&path).is_none());

        let body = r#"{ "chart": { "result": [{ "timestamp": [1700000000], "indicators": { "quote": [{ "close": [10.0] }] } }] } }"#;
        let chart: YahooChartResponse = serde_json::from_str(body).unwrap();
        source.write_cached_chart(&path, &chart).unwrap();

        let cached = source.read_cached_chart(&path).unwrap();
        assert_eq!(chart_to_series("M&M.NS", &cached).closes(), vec![10.0]);

        std::fs::write(&path, "not json").unwrap();
        assert!(source.read_cached_chart(&path).is_none());
    }

    #[test]
    fn test_symbol_encoding() {
        assert_eq!(encode_symbol("M&M.NS"), "M%26M.NS");
        assert_eq!(encode_symbol("TCS.NS"), "TCS.NS");
    }
}
