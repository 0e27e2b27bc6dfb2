use candle_core::{Error, Module, Result, Tensor};
use candle_nn::{LSTMConfig, Linear, VarBuilder, LSTM, RNN};

/// Stacked LSTM over a window of normalized prices, followed by a linear
/// head that emits the next normalized price.
pub struct SequenceRegressor {
    lstm_layers: Vec<LSTM>,
    head: Linear,
}

impl SequenceRegressor {
    pub fn new(input_dim: usize, hidden_dim: usize, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        if num_layers == 0 {
            return Err(Error::Msg("SequenceRegressor needs at least one LSTM layer".into()));
        }
        let lstm_layers = (0..num_layers)
            .map(|layer_idx| {
                let in_dim = if layer_idx == 0 { input_dim } else { hidden_dim };
                let cfg = LSTMConfig { layer_idx, ..Default::default() };
                candle_nn::lstm(in_dim, hidden_dim, cfg, vb.pp(format!("lstm_{}", layer_idx)))
            })
            .collect::<Result<Vec<_>>>()?;
        let head = candle_nn::linear(hidden_dim, 1, vb.pp("head"))?;
        Ok(Self { lstm_layers, head })
    }

    /// x: [batch, window, input_dim] -> [batch, 1]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (top, lower) = self
            .lstm_layers
            .split_last()
            .ok_or_else(|| Error::Msg("SequenceRegressor has no layers".into()))?;

        // Lower layers hand their full hidden sequence upward.
        let mut seq = x.clone();
        for layer in lower {
            let states = layer.seq(&seq)?;
            seq = layer.states_to_tensor(&states)?;
        }

        let states = top.seq(&seq)?;
        let last = states
            .last()
            .ok_or_else(|| Error::Msg("empty input window".into()))?;
        self.head.forward(last.h())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_forward_emits_one_value_per_window() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = SequenceRegressor::new(1, 8, 2, vb).unwrap();

        let x = Tensor::zeros((4, 12, 1), DType::F32, &device).unwrap();
        let y = model.forward(&x).unwrap();
        assert_eq!(y.dims(), &[4, 1]);
    }

    #[test]
    fn test_zero_layers_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(SequenceRegressor::new(1, 8, 0, vb).is_err());
    }
}
