use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Affine map of a series' closing prices onto [0, 1], fitted once per instrument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub data_min: f64,
    pub data_max: f64,
}

impl MinMaxScaler {
    pub fn fit(values: &[f64]) -> Result<Self> {
        if values.is_empty() {
            anyhow::bail!("cannot fit scaler on an empty series");
        }
        let data_min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let data_max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !data_min.is_finite() || !data_max.is_finite() {
            anyhow::bail!("cannot fit scaler on non-finite prices");
        }
        Ok(Self { data_min, data_max })
    }

    /// A flat series maps to 0 everywhere.
    fn scale(&self) -> f64 {
        let range = self.data_max - self.data_min;
        if range == 0.0 { 1.0 } else { range }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.data_min) / self.scale()
    }

    pub fn inverse(&self, value: f64) -> f64 {
        value * self.scale() + self.data_min
    }

    pub fn transform_all(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|&v| self.transform(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_then_inverse_recovers_prices() {
        let prices = [1520.25, 1498.0, 1610.75, 1587.5, 1433.1];
        let scaler = MinMaxScaler::fit(&prices).unwrap();
        for &p in &prices {
            let back = scaler.inverse(scaler.transform(p));
            assert!((back - p).abs() < 1e-9, "{} -> {}", p, back);
        }
    }

    #[test]
    fn test_transform_bounds() {
        let prices = [10.0, 20.0, 15.0];
        let scaler = MinMaxScaler::fit(&prices).unwrap();
        assert_eq!(scaler.transform(10.0), 0.0);
        assert_eq!(scaler.transform(20.0), 1.0);
        assert_eq!(scaler.transform(15.0), 0.5);
    }

    #[test]
    fn test_flat_series_is_invertible() {
        let scaler = MinMaxScaler::fit(&[42.0, 42.0, 42.0]).unwrap();
        assert_eq!(scaler.transform(42.0), 0.0);
        assert_eq!(scaler.inverse(0.0), 42.0);
    }

    #[test]
    fn test_fit_rejects_empty() {
        assert!(MinMaxScaler::fit(&[]).is_err());
    }
}
