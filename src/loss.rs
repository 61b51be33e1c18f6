//! Composite loss over a latent and its decoded image, with analytic gradients.
//!
//! The exclude and extras hints only switch terms on by their presence; their
//! text is never interpreted.

use ndarray::{s, Array2, Zip};

use crate::latent::{ImageTensor, Latent};

pub const SMOOTHNESS_WEIGHT: f32 = 0.1;
pub const DIVERSITY_WEIGHT: f32 = 0.05;
pub const SCALE_WEIGHT: f32 = 0.1;
pub const SCALE_TARGET: f32 = 1.0;
pub const EXCLUDE_WEIGHT: f32 = 0.5;
pub const EXTRAS_WEIGHT: f32 = 0.3;

/// Unweighted value of every term that went into a composite loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossTerms {
    pub fidelity: f32,
    pub smoothness: f32,
    pub mean_magnitude: f32,
    pub exclusion: Option<f32>,
}

/// Loss value plus its gradients. `grad_image` still has to be pulled back
/// through the decoder and added to `grad_latent`.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: f32,
    pub terms: LossTerms,
    pub grad_latent: Latent,
    pub grad_image: ImageTensor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossComposer {
    pub exclude_present: bool,
    pub extras_present: bool,
}

impl LossComposer {
    pub fn new(exclude_present: bool, extras_present: bool) -> Self {
        Self {
            exclude_present,
            extras_present,
        }
    }

    fn fidelity_weight(&self) -> f32 {
        if self.extras_present {
            1.0 + EXTRAS_WEIGHT
        } else {
            1.0
        }
    }

    /// Scalar loss only.
    pub fn compose_loss(&self, latent: &Latent, image: &ImageTensor) -> f32 {
        self.evaluate(latent, image).value
    }

    pub fn evaluate(&self, latent: &Latent, image: &ImageTensor) -> Evaluation {
        let mut grad_latent = Latent::zeros(latent.raw_dim());
        let mut grad_image = ImageTensor::zeros(image.raw_dim());

        let fidelity = fidelity(latent, image, self.fidelity_weight(), &mut grad_latent, &mut grad_image);
        let smoothness = smoothness(latent, SMOOTHNESS_WEIGHT, &mut grad_latent);
        let mean_magnitude = magnitude_terms(latent, &mut grad_latent);
        let exclusion = self
            .exclude_present
            .then(|| exclusion(image, EXCLUDE_WEIGHT, &mut grad_image));

        let diversity = -DIVERSITY_WEIGHT * mean_magnitude;
        let scale = SCALE_WEIGHT * (mean_magnitude - SCALE_TARGET).powi(2);
        let value = self.fidelity_weight() * fidelity
            + SMOOTHNESS_WEIGHT * smoothness
            + diversity
            + scale
            + exclusion.map_or(0.0, |e| EXCLUDE_WEIGHT * e);

        Evaluation {
            value,
            terms: LossTerms {
                fidelity,
                smoothness,
                mean_magnitude,
                exclusion,
            },
            grad_latent,
            grad_image,
        }
    }
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Latent cell that image row/column `i` falls in.
fn cell(i: usize, image_len: usize, latent_len: usize) -> usize {
    (i * latent_len / image_len).min(latent_len - 1)
}

/// MSE between the image average-pooled onto the latent grid and the latent's
/// channel mean. Accumulates `weight`-scaled gradients.
fn fidelity(latent: &Latent, image: &ImageTensor, weight: f32, grad_latent: &mut Latent, grad_image: &mut ImageTensor) -> f32 {
    let (_, channels, height, width) = latent.dim();
    let (_, _, image_h, image_w) = image.dim();
    let cells = (height * width) as f32;

    let mut pooled = Array2::<f32>::zeros((height, width));
    let mut counts = Array2::<f32>::zeros((height, width));
    for ((_, _, i, j), v) in image.indexed_iter() {
        let at = (cell(i, image_h, height), cell(j, image_w, width));
        pooled[at] += v;
        counts[at] += 1.0;
    }
    counts.mapv_inplace(|c| c.max(1.0));
    pooled /= &counts;

    let channel_mean = latent.slice(s![0, .., .., ..]).mean_axis(ndarray::Axis(0)).unwrap_or_else(|| Array2::zeros((height, width)));
    let diff = &pooled - &channel_mean;
    let value = diff.mapv(|d| d * d).sum() / cells;

    let d_cell = diff.mapv(|d| weight * 2.0 * d / cells);
    for ((_, _, i, j), g) in grad_image.indexed_iter_mut() {
        let at = (cell(i, image_h, height), cell(j, image_w, width));
        *g += d_cell[at] / counts[at];
    }
    for ((_, _, h, w), g) in grad_latent.indexed_iter_mut() {
        *g -= d_cell[[h, w]] / channels as f32;
    }
    value
}

/// Mean absolute difference between vertically adjacent cells plus the same
/// horizontally. An axis of length one contributes nothing.
fn smoothness(latent: &Latent, weight: f32, grad_latent: &mut Latent) -> f32 {
    let (_, _, height, width) = latent.dim();
    let mut value = 0.0;

    if height > 1 {
        let upper = latent.slice(s![.., .., 1.., ..]);
        let lower = latent.slice(s![.., .., ..-1, ..]);
        let n = upper.len() as f32;
        let diff = &upper - &lower;
        value += diff.mapv(f32::abs).sum() / n;
        let d = diff.mapv(|v| weight * sign(v) / n);
        Zip::from(grad_latent.slice_mut(s![.., .., 1.., ..])).and(&d).for_each(|g, d| *g += d);
        Zip::from(grad_latent.slice_mut(s![.., .., ..-1, ..])).and(&d).for_each(|g, d| *g -= d);
    }
    if width > 1 {
        let right = latent.slice(s![.., .., .., 1..]);
        let left = latent.slice(s![.., .., .., ..-1]);
        let n = right.len() as f32;
        let diff = &right - &left;
        value += diff.mapv(f32::abs).sum() / n;
        let d = diff.mapv(|v| weight * sign(v) / n);
        Zip::from(grad_latent.slice_mut(s![.., .., .., 1..])).and(&d).for_each(|g, d| *g += d);
        Zip::from(grad_latent.slice_mut(s![.., .., .., ..-1])).and(&d).for_each(|g, d| *g -= d);
    }
    value
}

/// Mean absolute latent value `A`, with gradients of both the diversity bonus
/// `-0.05·A` and the scale pull `0.1·(A − 1)²`.
fn magnitude_terms(latent: &Latent, grad_latent: &mut Latent) -> f32 {
    let n = latent.len() as f32;
    let mean_abs = latent.mapv(f32::abs).sum() / n;
    let d_mean = -DIVERSITY_WEIGHT + SCALE_WEIGHT * 2.0 * (mean_abs - SCALE_TARGET);
    Zip::from(grad_latent).and(latent).for_each(|g, &z| *g += d_mean * sign(z) / n);
    mean_abs
}

/// Mean squared deviation of the image from zero.
fn exclusion(image: &ImageTensor, weight: f32, grad_image: &mut ImageTensor) -> f32 {
    let n = image.len() as f32;
    Zip::from(grad_image).and(image).for_each(|g, &x| *g += weight * 2.0 * x / n);
    image.mapv(|x| x * x).sum() / n
}
