use thiserror::Error;

/// Failure while processing a single instrument. Logged and dropped by the
/// fleet; never fatal to a request on its own.
#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("{identifier}: insufficient price history ({observations} observations, need {required})")]
    DataUnavailable {
        identifier: String,
        observations: usize,
        required: usize,
    },

    #[error("{identifier}: market data provider failed: {reason}")]
    Upstream { identifier: String, reason: String },

    #[error("{identifier}: sequence model failed: {reason}")]
    Model { identifier: String, reason: String },

    #[error("{identifier}: statistics undefined: {reason}")]
    Statistics { identifier: String, reason: String },
}

impl InstrumentError {
    pub fn identifier(&self) -> &str {
        match self {
            Self::DataUnavailable { identifier, .. }
            | Self::Upstream { identifier, .. }
            | Self::Model { identifier, .. }
            | Self::Statistics { identifier, .. } => identifier,
        }
    }
}

/// Request-level failure surfaced to whoever called the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no instruments match the requested risk tolerance ({tolerance})")]
    EmptyFilterResult { tolerance: String },

    #[error("market data unavailable: none of {attempted} instruments could be processed")]
    UpstreamUnavailable { attempted: usize },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
