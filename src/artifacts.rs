use crate::scaler::MinMaxScaler;
use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Everything needed to reproduce one instrument's forecasts without retraining.
#[derive(Clone, Debug)]
pub struct ArtifactBundle {
    pub meta: ModelMeta,
    pub weights: HashMap<String, Tensor>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub scaler: MinMaxScaler,
    pub window: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub observations: usize,
    pub final_loss: f64,
}

/// Per-instrument artifact cache. Each identifier's entries are disjoint
/// from every other identifier's, so concurrent callers never contend on a key.
pub trait ArtifactStore: Send + Sync {
    /// `Ok(None)` on a miss. `Err` means an entry exists but could not be read.
    fn load(&self, identifier: &str, device: &Device) -> Result<Option<ArtifactBundle>>;

    fn save(&self, identifier: &str, bundle: &ArtifactBundle) -> Result<()>;
}

pub const WEIGHTS_SUFFIX: &str = "_lstm.safetensors";
pub const META_SUFFIX: &str = "_scaler.json";

/// Weights as safetensors plus a JSON sidecar with the scaler, under one directory.
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, identifier: &str) -> (PathBuf, PathBuf) {
        let stem = file_stem(identifier);
        (
            self.dir.join(format!("{}{}", stem, WEIGHTS_SUFFIX)),
            self.dir.join(format!("{}{}", stem, META_SUFFIX)),
        )
    }
}

impl ArtifactStore for FileArtifactStore {
    fn load(&self, identifier: &str, device: &Device) -> Result<Option<ArtifactBundle>> {
        let (weights_path, meta_path) = self.paths(identifier);
        if !weights_path.exists() || !meta_path.exists() {
            return Ok(None);
        }

        let file = std::fs::File::open(&meta_path)?;
        let meta: ModelMeta = serde_json::from_reader(std::io::BufReader::new(file))?;
        let weights = candle_core::safetensors::load(&weights_path, device)?;
        if weights.is_empty() {
            anyhow::bail!("{} holds no tensors", weights_path.display());
        }

        Ok(Some(ArtifactBundle { meta, weights }))
    }

    fn save(&self, identifier: &str, bundle: &ArtifactBundle) -> Result<()> {
        let (weights_path, meta_path) = self.paths(identifier);

        // Sidecar last: a bundle without its sidecar reads as a miss.
        candle_core::safetensors::save(&bundle.weights, &weights_path)?;
        let file = std::fs::File::create(&meta_path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &bundle.meta)?;

        info!("Saved artifacts for {} to {}", identifier, weights_path.display());
        Ok(())
    }
}

/// Percent-escapes every byte outside `[A-Za-z0-9.-]`. Injective, so two
/// identifiers never share files, and `_` stays free for the suffixes.
fn file_stem(identifier: &str) -> String {
    let mut stem = String::with_capacity(identifier.len());
    for byte in identifier.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

/// Process-local store, used for `--no-cache` runs and in tests.
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: Mutex<HashMap<String, ArtifactBundle>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryArtifactStore {
    pub fn contains(&self, identifier: &str) -> bool {
        self.entries
            .lock()
            .map(|m| m.contains_key(identifier))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn load(&self, identifier: &str, _device: &Device) -> Result<Option<ArtifactBundle>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("artifact store lock poisoned"))?;
        Ok(entries.get(identifier).cloned())
    }

    fn save(&self, identifier: &str, bundle: &ArtifactBundle) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("artifact store lock poisoned"))?;
        entries.insert(identifier.to_string(), bundle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn sample_bundle() -> ArtifactBundle {
        let device = Device::Cpu;
        let mut weights = HashMap::new();
        weights.insert(
            "head.weight".to_string(),
            Tensor::ones((1, 4), DType::F32, &device).unwrap(),
        );
        ArtifactBundle {
            meta: ModelMeta {
                scaler: MinMaxScaler { data_min: 10.0, data_max: 20.0 },
                window: 60,
                hidden_dim: 4,
                num_layers: 1,
                observations: 300,
                final_loss: 0.01,
            },
            weights,
        }
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path()).unwrap();
        let device = Device::Cpu;

        assert!(store.load("M&M.NS", &device).unwrap().is_none());
        store.save("M&M.NS", &sample_bundle()).unwrap();

        let loaded = store.load("M&M.NS", &device).unwrap().expect("bundle present");
        assert_eq!(loaded.meta, sample_bundle().meta);
        let head = loaded.weights.get("head.weight").unwrap();
        assert_eq!(head.dims(), &[1, 4]);
    }

    #[test]
    fn test_file_store_keys_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path()).unwrap();
        store.save("GLD", &sample_bundle()).unwrap();
        assert!(store.load("TLT", &Device::Cpu).unwrap().is_none());
    }

    #[test]
    fn test_similar_identifiers_do_not_share_files() {
        let ids = ["A/B", "A_B", "A:B", "A B", "A%2FB", "M&M.NS"];
        let stems: std::collections::HashSet<String> = ids.iter().map(|id| file_stem(id)).collect();
        assert_eq!(stems.len(), ids.len());
        assert_eq!(file_stem("RELIANCE.NS"), "RELIANCE.NS");
        assert_eq!(file_stem("A/B"), "A%2FB");

        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path()).unwrap();
        store.save("A/B", &sample_bundle()).unwrap();
        assert!(store.load("A_B", &Device::Cpu).unwrap().is_none());
        assert!(store.load("A/B", &Device::Cpu).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_weights_surface_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path()).unwrap();
        store.save("GLD", &sample_bundle()).unwrap();
        std::fs::write(dir.path().join(format!("GLD{}", WEIGHTS_SUFFIX)), b"not a tensor file").unwrap();
        assert!(store.load("GLD", &Device::Cpu).is_err());
    }

    #[test]
    fn test_missing_sidecar_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path()).unwrap();
        store.save("GLD", &sample_bundle()).unwrap();
        std::fs::remove_file(dir.path().join(format!("GLD{}", META_SUFFIX))).unwrap();
        assert!(store.load("GLD", &Device::Cpu).unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryArtifactStore::new();
        assert!(!store.contains("TLT"));
        store.save("TLT", &sample_bundle()).unwrap();
        assert!(store.contains("TLT"));
        assert_eq!(store.len(), 1);
        assert!(store.load("TLT", &Device::Cpu).unwrap().is_some());
    }
}
