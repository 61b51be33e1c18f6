//! Latent → image decoders and the model-loading entry point.
//!
//! A [`Decoder`] is shared read-only across every generation in the process, so
//! implementations must be `Send + Sync`. Backends that cannot tolerate
//! interleaved calls are wrapped in [`SerializedDecoder`].

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use ndarray::{Array1, Array2, Array4, Axis};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::latent::{ImageTensor, Latent, LatentShape};

pub const CONFIG_FILE: &str = "configs/model.json";
pub const WEIGHTS_FILE: &str = "checkpoints/weights.json";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("latent shape mismatch: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        expected: LatentShape,
        actual: (usize, usize, usize, usize),
    },
    #[error("image gradient shape mismatch: expected {expected:?}, got {actual:?}")]
    GradientShapeMismatch {
        expected: (usize, usize, usize, usize),
        actual: (usize, usize, usize, usize),
    },
    #[error("decoder backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("missing model file {}", .0.display())]
    MissingFile(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid model: {0}")]
    Invalid(String),
}

/// Pre-trained, differentiable map from a latent to an image.
pub trait Decoder: Send + Sync {
    fn latent_shape(&self) -> LatentShape;

    /// Expands `latent` into an image tensor. Deterministic for fixed weights.
    fn decode(&self, latent: &Latent) -> Result<ImageTensor, DecodeError>;

    /// Vector-Jacobian product: pulls `grad_image` (∂loss/∂image at `decode(latent)`)
    /// back to ∂loss/∂latent.
    fn backward(&self, latent: &Latent, grad_image: &ImageTensor) -> Result<Latent, DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub latent_channels: usize,
    pub latent_height: usize,
    pub latent_width: usize,
    pub image_channels: usize,
    pub upsample_factor: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: 256,
            latent_height: 16,
            latent_width: 16,
            image_channels: 3,
            upsample_factor: 16,
        }
    }
}

impl DecoderConfig {
    fn validate(&self) -> Result<(), ModelLoadError> {
        let fields = [
            ("latent_channels", self.latent_channels),
            ("latent_height", self.latent_height),
            ("latent_width", self.latent_width),
            ("image_channels", self.image_channels),
            ("upsample_factor", self.upsample_factor),
        ];
        match fields.iter().find(|(_, v)| *v == 0) {
            Some((name, _)) => Err(ModelLoadError::Invalid(format!("{name} must be positive"))),
            None => Ok(()),
        }
    }
}

/// Serialized weights of a [`LinearDecoder`]; `projection` is `image_channels` rows
/// of `latent_channels` columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderWeights {
    pub projection: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

/// Reference decoder: per-cell linear projection from latent channels to image
/// channels, `tanh`, then nearest-neighbour upsampling by `upsample_factor`.
#[derive(Debug, Clone)]
pub struct LinearDecoder {
    config: DecoderConfig,
    projection: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearDecoder {
    pub fn new(config: DecoderConfig, weights: DecoderWeights) -> Result<Self, ModelLoadError> {
        config.validate()?;
        let rows = weights.projection.len();
        if rows != config.image_channels {
            return Err(ModelLoadError::Invalid(format!(
                "projection has {rows} rows, expected {}",
                config.image_channels
            )));
        }
        if let Some(row) = weights.projection.iter().find(|r| r.len() != config.latent_channels) {
            return Err(ModelLoadError::Invalid(format!(
                "projection row has {} columns, expected {}",
                row.len(),
                config.latent_channels
            )));
        }
        if weights.bias.len() != config.image_channels {
            return Err(ModelLoadError::Invalid(format!(
                "bias has {} entries, expected {}",
                weights.bias.len(),
                config.image_channels
            )));
        }
        if weights.projection.iter().flatten().chain(&weights.bias).any(|w| !w.is_finite()) {
            return Err(ModelLoadError::Invalid("weights contain non-finite values".into()));
        }

        let flat: Vec<f32> = weights.projection.into_iter().flatten().collect();
        let projection = Array2::from_shape_vec((config.image_channels, config.latent_channels), flat)
            .map_err(|e| ModelLoadError::Invalid(e.to_string()))?;

        Ok(Self {
            config,
            projection,
            bias: Array1::from(weights.bias),
        })
    }

    /// Randomly initialised decoder, used where no trained checkpoint is needed.
    pub fn seeded(config: DecoderConfig, seed: u64) -> Result<Self, ModelLoadError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = (config.latent_channels as f32).sqrt().recip();
        let projection = (0..config.image_channels)
            .map(|_| {
                (0..config.latent_channels)
                    .map(|_| rng.sample::<f32, _>(StandardNormal) * scale)
                    .collect()
            })
            .collect();
        let bias = vec![0.0; config.image_channels];
        Self::new(config, DecoderWeights { projection, bias })
    }

    pub fn config(&self) -> DecoderConfig {
        self.config
    }

    fn image_dims(&self) -> (usize, usize, usize, usize) {
        let c = &self.config;
        (
            1,
            c.image_channels,
            c.latent_height * c.upsample_factor,
            c.latent_width * c.upsample_factor,
        )
    }

    fn check_latent(&self, latent: &Latent) -> Result<(), DecodeError> {
        let expected = self.latent_shape();
        if expected.matches(latent) {
            Ok(())
        } else {
            Err(DecodeError::ShapeMismatch {
                expected,
                actual: latent.dim(),
            })
        }
    }

    /// `tanh(P·z + b)` per latent cell, as `image_channels × (H·W)`.
    fn activations(&self, latent: &Latent) -> Result<Array2<f32>, DecodeError> {
        let cells = self.config.latent_height * self.config.latent_width;
        let z = Array2::from_shape_vec((self.config.latent_channels, cells), latent.iter().copied().collect())
            .map_err(|e| DecodeError::Backend(e.to_string()))?;
        let mut pre = self.projection.dot(&z);
        pre += &self.bias.view().insert_axis(Axis(1));
        Ok(pre.mapv(f32::tanh))
    }
}

impl Decoder for LinearDecoder {
    fn latent_shape(&self) -> LatentShape {
        LatentShape::new(
            self.config.latent_channels,
            self.config.latent_height,
            self.config.latent_width,
        )
    }

    fn decode(&self, latent: &Latent) -> Result<ImageTensor, DecodeError> {
        self.check_latent(latent)?;
        let act = self.activations(latent)?;
        let f = self.config.upsample_factor;
        let w = self.config.latent_width;
        Ok(Array4::from_shape_fn(self.image_dims(), |(_, k, i, j)| {
            act[[k, (i / f) * w + j / f]]
        }))
    }

    fn backward(&self, latent: &Latent, grad_image: &ImageTensor) -> Result<Latent, DecodeError> {
        self.check_latent(latent)?;
        let expected = self.image_dims();
        if grad_image.dim() != expected {
            return Err(DecodeError::GradientShapeMismatch {
                expected,
                actual: grad_image.dim(),
            });
        }

        let act = self.activations(latent)?;
        let f = self.config.upsample_factor;
        let w = self.config.latent_width;

        let mut grad_pre = Array2::<f32>::zeros(act.dim());
        for ((_, k, i, j), g) in grad_image.indexed_iter() {
            grad_pre[[k, (i / f) * w + j / f]] += g;
        }
        grad_pre.zip_mut_with(&act, |g, y| *g *= 1.0 - y * y);

        let grad_z = self.projection.t().dot(&grad_pre);
        Array4::from_shape_vec(self.latent_shape().dims(), grad_z.iter().copied().collect())
            .map_err(|e| DecodeError::Backend(e.to_string()))
    }
}

/// Funnels every call through one lock, for numeric backends that are not safe
/// under concurrent access. Costs throughput across sessions.
pub struct SerializedDecoder {
    inner: Arc<dyn Decoder>,
    lock: Mutex<()>,
}

impl SerializedDecoder {
    pub fn new(inner: Arc<dyn Decoder>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

impl Decoder for SerializedDecoder {
    fn latent_shape(&self) -> LatentShape {
        self.inner.latent_shape()
    }

    fn decode(&self, latent: &Latent) -> Result<ImageTensor, DecodeError> {
        let _guard = self.lock.lock();
        self.inner.decode(latent)
    }

    fn backward(&self, latent: &Latent, grad_image: &ImageTensor) -> Result<Latent, DecodeError> {
        let _guard = self.lock.lock();
        self.inner.backward(latent, grad_image)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: PathBuf) -> Result<T, ModelLoadError> {
    if !path.is_file() {
        return Err(ModelLoadError::MissingFile(path));
    }
    let raw = fs::read_to_string(&path).map_err(|source| ModelLoadError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ModelLoadError::Parse { path, source })
}

/// Loads the decoder stored under `model_dir` (`configs/model.json` and
/// `checkpoints/weights.json`). Any failure here is fatal for the service.
pub fn load_decoder(model_dir: &Path) -> Result<LinearDecoder, ModelLoadError> {
    let config: DecoderConfig = read_json(model_dir.join(CONFIG_FILE))?;
    let weights: DecoderWeights = read_json(model_dir.join(WEIGHTS_FILE))?;
    let decoder = LinearDecoder::new(config, weights)?;
    info!(
        "🧠 Loaded decoder from {} (latent {}, {} image channels, x{} upsampling)",
        model_dir.display(),
        decoder.latent_shape(),
        config.image_channels,
        config.upsample_factor
    );
    Ok(decoder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latent::random_latent;
    use pretty_assertions::assert_eq;

    fn small_config() -> DecoderConfig {
        DecoderConfig {
            latent_channels: 4,
            latent_height: 3,
            latent_width: 2,
            image_channels: 3,
            upsample_factor: 2,
        }
    }

    #[test]
    fn decode_produces_upsampled_image_in_range() {
        let decoder = LinearDecoder::seeded(small_config(), 1).unwrap();
        let image = decoder.decode(&random_latent(decoder.latent_shape(), 2)).unwrap();
        assert_eq!(image.dim(), (1, 3, 6, 4));
        assert!(image.iter().all(|v| (-1.0..=1.0).contains(v)));
        // Nearest upsampling repeats each cell over its block.
        assert_eq!(image[[0, 1, 2, 0]], image[[0, 1, 3, 1]]);
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let decoder = LinearDecoder::seeded(small_config(), 1).unwrap();
        let wrong = random_latent(LatentShape::new(5, 3, 2), 0);
        assert!(matches!(decoder.decode(&wrong), Err(DecodeError::ShapeMismatch { .. })));
    }

    #[test]
    fn backward_matches_finite_differences() {
        let decoder = LinearDecoder::seeded(small_config(), 3).unwrap();
        let z = random_latent(decoder.latent_shape(), 4).mapv(|v| v * 0.3);
        // loss = sum(image * weights) so ∂loss/∂image = weights.
        let weights = random_latent(LatentShape::new(3, 6, 4), 5);
        let loss = |z: &Latent| (decoder.decode(z).unwrap() * &weights).sum();

        let analytic = decoder.backward(&z, &weights).unwrap();
        let eps = 1e-2;
        for idx in [(0, 0, 0, 0), (0, 3, 2, 1), (0, 1, 1, 0)] {
            let mut plus = z.clone();
            plus[idx] += eps;
            let mut minus = z.clone();
            minus[idx] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!((numeric - analytic[idx]).abs() < 1e-2, "{idx:?}: {numeric} vs {}", analytic[idx]);
        }
    }

    #[test]
    fn new_rejects_mismatched_weights() {
        let weights = DecoderWeights {
            projection: vec![vec![0.0; 4]; 2],
            bias: vec![0.0; 3],
        };
        assert!(matches!(
            LinearDecoder::new(small_config(), weights),
            Err(ModelLoadError::Invalid(_))
        ));
    }

    #[test]
    fn load_decoder_reads_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config();
        let weights = DecoderWeights {
            projection: vec![vec![0.5; 4]; 3],
            bias: vec![0.1, 0.0, -0.1],
        };
        fs::create_dir_all(dir.path().join("configs")).unwrap();
        fs::create_dir_all(dir.path().join("checkpoints")).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), serde_json::to_string(&config).unwrap()).unwrap();
        fs::write(dir.path().join(WEIGHTS_FILE), serde_json::to_string(&weights).unwrap()).unwrap();

        let decoder = load_decoder(dir.path()).unwrap();
        assert_eq!(decoder.config(), config);
        assert_eq!(decoder.latent_shape(), LatentShape::new(4, 3, 2));
    }

    #[test]
    fn load_decoder_fails_on_missing_or_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_decoder(dir.path()), Err(ModelLoadError::MissingFile(_))));

        fs::create_dir_all(dir.path().join("configs")).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(load_decoder(dir.path()), Err(ModelLoadError::Parse { .. })));
    }

    #[test]
    fn serialized_decoder_delegates() {
        let inner = LinearDecoder::seeded(small_config(), 9).unwrap();
        let z = random_latent(inner.latent_shape(), 1);
        let expected = inner.decode(&z).unwrap();
        let serialized = SerializedDecoder::new(Arc::new(inner));
        assert_eq!(serialized.decode(&z).unwrap(), expected);
        assert_eq!(serialized.latent_shape(), LatentShape::new(4, 3, 2));
    }
}
