use ndarray::Array4;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Point being optimized, laid out as `1 × C × H × W`.
pub type Latent = Array4<f32>;

/// Decoder output, laid out as `1 × channels × height × width` with values in `[-1, 1]`.
pub type ImageTensor = Array4<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl LatentShape {
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width }
    }

    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (1, self.channels, self.height, self.width)
    }

    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn matches(&self, latent: &Latent) -> bool {
        latent.dim() == self.dims()
    }
}

impl std::fmt::Display for LatentShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "1x{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// Draws a standard-normal latent from a seeded generator, so equal seeds give equal latents.
pub fn random_latent(shape: LatentShape, seed: u64) -> Latent {
    let mut rng = StdRng::seed_from_u64(seed);
    Array4::from_shape_simple_fn(shape.dims(), || rng.sample::<f32, _>(StandardNormal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_gives_same_latent() {
        let shape = LatentShape::new(4, 3, 3);
        assert_eq!(random_latent(shape, 7), random_latent(shape, 7));
        assert_ne!(random_latent(shape, 7), random_latent(shape, 8));
    }

    #[test]
    fn latent_has_requested_shape() {
        let shape = LatentShape::new(256, 16, 16);
        let z = random_latent(shape, 1);
        assert!(shape.matches(&z));
        assert_eq!(z.len(), shape.len());
        assert_eq!(shape.to_string(), "1x256x16x16");
    }
}
