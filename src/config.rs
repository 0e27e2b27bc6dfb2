use candle_core::Device;
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }

    #[cfg(feature = "mkl")]
    info!("Using CPU device with Intel MKL BLAS acceleration");

    #[cfg(not(feature = "mkl"))]
    info!("Using CPU device (tip: compile with --features mkl for faster matrix ops)");

    Device::Cpu
}

/// Range of price history fetched per instrument (Yahoo range syntax).
pub const LOOKBACK_RANGE: &str = "5y";
/// Number of consecutive normalized prices the sequence model consumes.
pub const SEQUENCE_WINDOW: usize = 60;
pub const LSTM_HIDDEN: usize = 50;
pub const LSTM_LAYERS: usize = 2;
pub const TRAIN_EPOCHS: usize = 10;
pub const TRAIN_BATCH_SIZE: usize = 32;
pub const LEARNING_RATE: f64 = 1e-3;

/// Annualized volatility (%) below which an instrument is labelled Low risk.
pub const LOW_RISK_THRESHOLD: f64 = 15.0;
/// Annualized volatility (%) at or above which an instrument is labelled High risk.
pub const HIGH_RISK_THRESHOLD: f64 = 25.0;

pub const TRADING_PERIODS_PER_YEAR: f64 = 252.0;

pub const SIMULATION_PATHS: usize = 10_000;
/// Accepted range for a configured path count, from any source.
pub const MIN_SIMULATION_PATHS: usize = 100;
pub const MAX_SIMULATION_PATHS: usize = 1_000_000;
pub const CONFIDENCE_LOW: f64 = 5.0;
pub const CONFIDENCE_HIGH: f64 = 95.0;
/// Longest accepted investment horizon, in years.
pub const MAX_HORIZON_YEARS: i64 = 100;

/// Upper bound on instruments processed at the same time.
pub const FLEET_CONCURRENCY: usize = 10;

pub const MODEL_DIR: &str = "saved_models";

/// Indian large caps, three mutual funds, a gold proxy and a bond proxy.
pub const INSTRUMENT_BASKET: &[&str] = &[
    "RELIANCE.NS", "TCS.NS", "HDFCBANK.NS", "INFY.NS", "ICICIBANK.NS",
    "KOTAKBANK.NS", "LT.NS", "SBIN.NS", "BHARTIARTL.NS", "ITC.NS",
    "HINDUNILVR.NS", "ASIANPAINT.NS", "AXISBANK.NS", "BAJFINANCE.NS",
    "MARUTI.NS", "M&M.NS", "SUNPHARMA.NS", "HCLTECH.NS", "ONGC.NS",
    "TITAN.NS", "ULTRACEMCO.NS", "WIPRO.NS", "ADANIGREEN.NS", "DMART.NS",
    // Mutual funds
    "0P0000YENW.BO", "0P0000ZG0G.BO", "0P0000YIV3.BO",
    // Gold
    "GLD",
    // Bonds
    "TLT",
];

pub fn default_basket() -> Vec<String> {
    INSTRUMENT_BASKET.iter().map(|s| s.to_string()).collect()
}

/// Hyperparameters for the per-instrument sequence model.
#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub window: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Seed for the mini-batch shuffle.
    pub shuffle_seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            window: SEQUENCE_WINDOW,
            hidden_dim: LSTM_HIDDEN,
            num_layers: LSTM_LAYERS,
            epochs: TRAIN_EPOCHS,
            batch_size: TRAIN_BATCH_SIZE,
            learning_rate: LEARNING_RATE,
            shuffle_seed: 42,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RiskThresholds {
    pub low_below: f64,
    pub high_at: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low_below: LOW_RISK_THRESHOLD,
            high_at: HIGH_RISK_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub basket: Vec<String>,
    pub lookback_range: String,
    pub training: TrainingConfig,
    pub thresholds: RiskThresholds,
    pub periods_per_year: f64,
    pub simulation_paths: usize,
    /// Percentile pair reported as the confidence interval, in [0, 100].
    pub confidence: (f64, f64),
    pub concurrency: usize,
    pub model_dir: PathBuf,
    pub use_cuda: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            basket: default_basket(),
            lookback_range: LOOKBACK_RANGE.to_string(),
            training: TrainingConfig::default(),
            thresholds: RiskThresholds::default(),
            periods_per_year: TRADING_PERIODS_PER_YEAR,
            simulation_paths: SIMULATION_PATHS,
            confidence: (CONFIDENCE_LOW, CONFIDENCE_HIGH),
            concurrency: FLEET_CONCURRENCY,
            model_dir: PathBuf::from(MODEL_DIR),
            use_cuda: false,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `PORTFOLIO_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(basket) = env_string("PORTFOLIO_BASKET") {
            let symbols: Vec<String> = basket
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if symbols.is_empty() {
                warn!("PORTFOLIO_BASKET is set but contains no symbols; keeping default basket");
            } else {
                cfg.basket = symbols;
            }
        }
        if let Some(range) = env_string("PORTFOLIO_LOOKBACK_RANGE") {
            cfg.lookback_range = range;
        }
        if let Some(window) = env_parse::<usize>("PORTFOLIO_SEQUENCE_WINDOW") {
            cfg.training.window = window.clamp(2, 512);
        }
        if let Some(epochs) = env_parse::<usize>("PORTFOLIO_TRAIN_EPOCHS") {
            cfg.training.epochs = epochs.clamp(1, 1_000);
        }
        if let Some(paths) = env_parse::<usize>("PORTFOLIO_SIMULATION_PATHS") {
            cfg.simulation_paths = clamp_simulation_paths(paths);
        }
        if let Some(concurrency) = env_parse::<usize>("PORTFOLIO_CONCURRENCY") {
            cfg.concurrency = concurrency.clamp(1, 64);
        }
        if let (Some(low), Some(high)) = (
            env_parse::<f64>("PORTFOLIO_LOW_RISK_THRESHOLD"),
            env_parse::<f64>("PORTFOLIO_HIGH_RISK_THRESHOLD"),
        ) {
            if low > 0.0 && low < high {
                cfg.thresholds = RiskThresholds { low_below: low, high_at: high };
            } else {
                warn!(
                    "Ignoring risk thresholds low={} high={}: need 0 < low < high",
                    low, high
                );
            }
        }
        if let (Some(low), Some(high)) = (
            env_parse::<f64>("PORTFOLIO_CONFIDENCE_LOW"),
            env_parse::<f64>("PORTFOLIO_CONFIDENCE_HIGH"),
        ) {
            if (0.0..=100.0).contains(&low) && (0.0..=100.0).contains(&high) && low < high {
                cfg.confidence = (low, high);
            } else {
                warn!("Ignoring confidence percentiles low={} high={}", low, high);
            }
        }
        if let Some(dir) = env_string("PORTFOLIO_MODEL_DIR") {
            cfg.model_dir = PathBuf::from(dir);
        }

        cfg
    }
}

pub fn clamp_simulation_paths(paths: usize) -> usize {
    let clamped = paths.clamp(MIN_SIMULATION_PATHS, MAX_SIMULATION_PATHS);
    if clamped != paths {
        warn!("Simulation path count {} out of range; using {}", paths, clamped);
    }
    clamped
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={}: not a valid value", key, raw);
            None
        }
    }
}
