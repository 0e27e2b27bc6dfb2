use crate::artifacts::{ArtifactBundle, ArtifactStore, ModelMeta};
use crate::config::TrainingConfig;
use crate::data::{build_windows, PriceSeries, WindowedDataset};
use crate::error::InstrumentError;
use crate::models::lstm::SequenceRegressor;
use crate::scaler::MinMaxScaler;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Forecast aligned to the input series: the first `window` positions carry
/// no prediction, every later position holds the one-step-ahead prediction
/// in price units.
#[derive(Clone, Debug)]
pub struct ForecastSeries {
    pub values: Vec<Option<f64>>,
}

impl ForecastSeries {
    pub fn defined(&self) -> Vec<f64> {
        self.values.iter().filter_map(|v| *v).collect()
    }
}

#[cfg(test)]
impl ForecastSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn undefined_prefix(&self) -> usize {
        self.values.iter().take_while(|v| v.is_none()).count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactOrigin {
    Cached,
    Trained,
}

#[derive(Clone, Debug)]
pub struct Forecast {
    pub series: ForecastSeries,
    pub scaler: MinMaxScaler,
    pub origin: ArtifactOrigin,
}

/// Trains or reuses one sequence model per instrument and reconstructs the
/// forecast series over that instrument's history.
pub struct SequencePredictor {
    store: Arc<dyn ArtifactStore>,
    config: TrainingConfig,
    device: Device,
}

impl SequencePredictor {
    pub fn new(store: Arc<dyn ArtifactStore>, config: TrainingConfig, device: Device) -> Self {
        Self { store, config, device }
    }

    pub fn window(&self) -> usize {
        self.config.window
    }

    pub fn forecast(&self, series: &PriceSeries) -> Result<Forecast, InstrumentError> {
        let identifier = series.symbol.as_str();
        let window = self.config.window;
        let required = window + 1;

        if series.len() < required {
            return Err(InstrumentError::DataUnavailable {
                identifier: identifier.to_string(),
                observations: series.len(),
                required,
            });
        }

        let closes = series.closes();
        let model_err = |e: anyhow::Error| InstrumentError::Model {
            identifier: identifier.to_string(),
            reason: format!("{:#}", e),
        };

        let (bundle, origin) = match self.load_cached(identifier) {
            Some(bundle) => (bundle, ArtifactOrigin::Cached),
            None => {
                let bundle = self.train(identifier, &closes).map_err(model_err)?;
                if let Err(e) = self.store.save(identifier, &bundle) {
                    warn!("{}: failed to persist artifacts ({}); continuing with in-memory model", identifier, e);
                }
                (bundle, ArtifactOrigin::Trained)
            }
        };

        let values = self.infer(&bundle, &closes).map_err(model_err)?;
        debug!("{}: {} predictions over {} observations ({:?})", identifier, values.len() - window, values.len(), origin);

        Ok(Forecast {
            series: ForecastSeries { values },
            scaler: bundle.meta.scaler,
            origin,
        })
    }

    /// Read failures and shape mismatches count as misses.
    fn load_cached(&self, identifier: &str) -> Option<ArtifactBundle> {
        match self.store.load(identifier, &self.device) {
            Ok(Some(bundle)) => {
                let meta = &bundle.meta;
                if meta.window == self.config.window
                    && meta.hidden_dim == self.config.hidden_dim
                    && meta.num_layers == self.config.num_layers
                {
                    info!("{}: reusing cached model (trained on {} observations)", identifier, meta.observations);
                    Some(bundle)
                } else {
                    warn!(
                        "{}: cached model shape (window={}, hidden={}, layers={}) does not match configuration; retraining",
                        identifier, meta.window, meta.hidden_dim, meta.num_layers
                    );
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!("{}: cached artifacts unreadable ({}); retraining", identifier, e);
                None
            }
        }
    }

    fn build_model(&self, vb: VarBuilder) -> Result<SequenceRegressor> {
        Ok(SequenceRegressor::new(
            1,
            self.config.hidden_dim,
            self.config.num_layers,
            vb.pp("model"),
        )?)
    }

    fn train(&self, identifier: &str, closes: &[f64]) -> Result<ArtifactBundle> {
        let started = Instant::now();
        let scaler = MinMaxScaler::fit(closes)?;
        let normalized = scaler.transform_all(closes);
        let dataset = build_windows(&normalized, self.config.window);
        if dataset.is_empty() {
            anyhow::bail!("no training windows");
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let model = self.build_model(vb)?;

        let params = candle_nn::ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt = candle_nn::AdamW::new(varmap.all_vars(), params)?;

        let batch_size = self.config.batch_size.max(1);
        let epochs = self.config.epochs.max(1);
        let mut rng = StdRng::seed_from_u64(self.config.shuffle_seed ^ identifier_seed(identifier));
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        let mut last_loss = f64::NAN;

        info!(
            "{}: training on {} windows (window={}, epochs={}, batch_size={})",
            identifier,
            dataset.len(),
            self.config.window,
            epochs,
            batch_size
        );

        for epoch in 0..epochs {
            indices.shuffle(&mut rng);
            let mut total_loss = 0.0;
            let mut batches = 0usize;

            for batch in indices.chunks(batch_size) {
                let (x, y) = self.batch_tensors(&dataset, batch)?;
                let pred = model.forward(&x)?;
                let loss = (pred - y)?.sqr()?.mean_all()?;
                opt.backward_step(&loss)?;
                total_loss += loss.to_scalar::<f32>()? as f64;
                batches += 1;
            }

            last_loss = total_loss / batches.max(1) as f64;
            info!("{}: epoch {}/{} loss={:.6}", identifier, epoch + 1, epochs, last_loss);
        }

        let weights: HashMap<String, Tensor> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };

        info!(
            "{}: training finished in {:.1}s, final loss {:.6}",
            identifier,
            started.elapsed().as_secs_f64(),
            last_loss
        );

        Ok(ArtifactBundle {
            meta: ModelMeta {
                scaler,
                window: self.config.window,
                hidden_dim: self.config.hidden_dim,
                num_layers: self.config.num_layers,
                observations: closes.len(),
                final_loss: last_loss,
            },
            weights,
        })
    }

    fn batch_tensors(&self, dataset: &WindowedDataset, batch: &[usize]) -> Result<(Tensor, Tensor)> {
        let window = self.config.window;
        let mut inputs = Vec::with_capacity(batch.len() * window);
        let mut targets = Vec::with_capacity(batch.len());
        for &idx in batch {
            inputs.extend_from_slice(&dataset.inputs[idx]);
            targets.push(dataset.targets[idx]);
        }
        let x = Tensor::from_vec(inputs, (batch.len(), window, 1), &self.device)?;
        let y = Tensor::from_vec(targets, (batch.len(), 1), &self.device)?;
        Ok((x, y))
    }

    /// Runs every window through the model in one batch and right-aligns the
    /// inverse-transformed outputs onto the series.
    fn infer(&self, bundle: &ArtifactBundle, closes: &[f64]) -> Result<Vec<Option<f64>>> {
        let window = self.config.window;
        let scaler = &bundle.meta.scaler;
        let normalized = scaler.transform_all(closes);
        let dataset = build_windows(&normalized, window);
        let n = dataset.len();
        if n == 0 {
            anyhow::bail!("no inference windows");
        }

        let vb = VarBuilder::from_tensors(bundle.weights.clone(), DType::F32, &self.device);
        let model = self.build_model(vb)?;

        let flat: Vec<f32> = dataset.inputs.into_iter().flatten().collect();
        let x = Tensor::from_vec(flat, (n, window, 1), &self.device)?;
        let predicted = model.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;

        let mut values: Vec<Option<f64>> = vec![None; window];
        values.extend(predicted.into_iter().map(|p| Some(scaler.inverse(p as f64))));
        Ok(values)
    }
}

/// Stable per-identifier seed so instruments shuffle independently.
fn identifier_seed(identifier: &str) -> u64 {
    identifier
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3))
}
