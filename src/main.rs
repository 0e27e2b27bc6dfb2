mod allocator;
mod artifacts;
mod config;
mod data;
mod error;
mod fleet;
mod models;
mod pipeline;
mod predictor;
mod scaler;
mod simulator;
mod statistics;

use artifacts::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
use clap::Parser;
use config::PipelineConfig;
use data::YahooPriceSource;
use pipeline::{print_report, InvestmentRequest, Pipeline};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Portfolio Forecast: per-instrument LSTM forecasts, risk-filtered allocation and Monte Carlo projection",
    after_help = "EXAMPLES:
    # Medium-risk plan over the default basket for 10 years
    cargo run --release -- --risk medium --years 10 --monthly 10000

    # Horizon from ages, with a target fund
    cargo run --release -- --risk low --current-age 30 --retirement-age 60 --monthly 5000 --target 10000000

    # Custom basket, machine-readable output
    cargo run --release -- --symbols GLD,TLT,INFY.NS --risk low --years 5 --monthly 1000 --json"
)]
struct Args {
    /// Comma-separated instrument identifiers (default: built-in basket or PORTFOLIO_BASKET)
    #[arg(long)]
    symbols: Option<String>,

    /// Risk tolerance: low, medium or high
    #[arg(long, default_value = "medium")]
    risk: String,

    /// Investment horizon in years
    #[arg(long, conflicts_with_all = ["current_age", "retirement_age"])]
    years: Option<i64>,

    /// Current age; with --retirement-age, sets the horizon
    #[arg(long, requires = "retirement_age")]
    current_age: Option<i64>,

    /// Retirement age; with --current-age, sets the horizon
    #[arg(long, requires = "current_age")]
    retirement_age: Option<i64>,

    /// Fixed monthly contribution
    #[arg(long)]
    monthly: f64,

    /// Desired final fund; reports the probability of reaching it
    #[arg(long)]
    target: Option<f64>,

    /// Number of Monte Carlo paths, 100..=1000000 (default: 10000)
    #[arg(long)]
    paths: Option<usize>,

    /// Seed for the Monte Carlo simulation (default: OS entropy)
    #[arg(long)]
    seed: Option<u64>,

    /// Instruments processed concurrently (default: 10)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Directory holding per-instrument model artifacts (default: saved_models)
    #[arg(long)]
    model_dir: Option<String>,

    /// Training epochs for instruments without cached artifacts (default: 10)
    #[arg(long)]
    epochs: Option<usize>,

    /// Keep trained models in memory only; nothing is read from or written to disk
    #[arg(long)]
    no_cache: bool,

    /// Print the plan as JSON instead of the report box
    #[arg(long)]
    json: bool,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,
}

fn apply_overrides(cfg: &mut PipelineConfig, args: &Args) {
    if let Some(symbols) = &args.symbols {
        let basket: Vec<String> = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !basket.is_empty() {
            cfg.basket = basket;
        }
    }
    if let Some(paths) = args.paths {
        cfg.simulation_paths = config::clamp_simulation_paths(paths);
    }
    if let Some(concurrency) = args.concurrency {
        cfg.concurrency = concurrency.max(1);
    }
    if let Some(dir) = &args.model_dir {
        cfg.model_dir = dir.into();
    }
    if let Some(epochs) = args.epochs {
        cfg.training.epochs = epochs.max(1);
    }
    cfg.use_cuda |= args.cuda;
}

fn build_request(args: &Args, basket: Vec<String>) -> Result<InvestmentRequest, error::PipelineError> {
    let request = match (args.years, args.current_age, args.retirement_age) {
        (_, Some(current), Some(retirement)) => {
            InvestmentRequest::from_ages(basket, args.risk.clone(), current, retirement, args.monthly)?
        }
        (Some(years), _, _) => InvestmentRequest::new(basket, args.risk.clone(), years, args.monthly),
        _ => {
            return Err(error::PipelineError::InvalidInput(
                "pass --years or both --current-age and --retirement-age".to_string(),
            ))
        }
    };
    Ok(match args.target {
        Some(target) => request.with_target(target),
        None => request,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    config::init_cpu_parallelism();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("portfolio_forecast=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();
    let args = Args::parse();

    if args.cuda && !cfg!(feature = "cuda") {
        error!(
            "--cuda was requested, but this binary was compiled without CUDA support. Re-run with: cargo run --release --features cuda -- --cuda ..."
        );
        return Ok(());
    }

    let mut cfg = PipelineConfig::from_env();
    apply_overrides(&mut cfg, &args);

    let request = build_request(&args, cfg.basket.clone())?;

    let store: Arc<dyn ArtifactStore> = if args.no_cache {
        info!("Artifact cache disabled; every instrument will be trained from scratch");
        Arc::new(MemoryArtifactStore::new())
    } else {
        let store = FileArtifactStore::new(&cfg.model_dir)?;
        info!("Model artifacts under {}", store.dir().display());
        Arc::new(store)
    };

    let device = config::get_device(cfg.use_cuda);
    let pipeline = Pipeline::new(Arc::new(YahooPriceSource::new()), store, cfg, device);

    info!(
        "Lookback {} with a {}-step sequence window, {} simulation paths",
        pipeline.config().lookback_range,
        pipeline.config().training.window,
        pipeline.config().simulation_paths
    );

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    match pipeline.run(&request, &mut rng).await {
        Ok(strategy) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&strategy)?);
            } else {
                print_report(&strategy);
            }
            Ok(())
        }
        Err(e) => {
            error!("Planning failed: {}", e);
            if args.json {
                println!("{}", serde_json::json!({ "error": e.to_string() }));
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_paths_use_config_range() {
        let args = Args::parse_from(["portfolio-forecast", "--years", "5", "--monthly", "100", "--paths", "1"]);
        let mut cfg = PipelineConfig::default();
        apply_overrides(&mut cfg, &args);
        assert_eq!(cfg.simulation_paths, config::MIN_SIMULATION_PATHS);
    }
}
