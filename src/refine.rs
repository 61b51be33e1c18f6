//! Iterative latent refinement: decode, score, step, remember the best image.

use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    decoder::{DecodeError, Decoder},
    latent::{ImageTensor, Latent},
    loss::LossComposer,
    optimizer::{Adam, Optimizer, SizeMismatch},
};

pub const DEFAULT_LEARNING_RATE: f32 = 0.1;

#[derive(Debug, Error)]
pub enum RefinementError {
    #[error("decoder failed at step {step}: {source}")]
    Decode {
        step: usize,
        #[source]
        source: DecodeError,
    },
    #[error("loss became non-finite ({value}) at step {step}")]
    NonFiniteLoss { step: usize, value: f32 },
    #[error("no improvement found")]
    NoImprovement,
    #[error("run cancelled before step {step}")]
    Cancelled { step: usize },
    #[error("run exceeded its {limit:?} time limit before step {step}")]
    DeadlineExceeded { step: usize, limit: Duration },
    #[error("optimizer update failed: {0}")]
    Optimizer(#[from] SizeMismatch),
    #[error("latent storage is not contiguous")]
    Layout,
}

#[derive(Debug, Clone, Copy)]
pub struct RefinementConfig {
    pub total_iterations: usize,
    pub show_steps: NonZeroUsize,
    pub learning_rate: f32,
    /// Wall-clock ceiling for the whole run; `None` leaves `total_iterations` as the only bound.
    pub max_duration: Option<Duration>,
}

impl RefinementConfig {
    pub fn new(total_iterations: usize, show_steps: NonZeroUsize) -> Self {
        Self {
            total_iterations,
            show_steps,
            learning_rate: DEFAULT_LEARNING_RATE,
            max_duration: None,
        }
    }
}

/// Observational decode of the latent right after a step. Never feeds back
/// into the optimization.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub step: usize,
    pub total: usize,
    pub image: ImageTensor,
}

/// Lowest-loss image seen in a run.
#[derive(Debug, Clone)]
pub struct BestResult {
    pub loss: f32,
    pub step: usize,
    pub image: ImageTensor,
}

/// Keeps the best result, replacing it only on a strictly lower loss.
#[derive(Debug, Default)]
pub struct BestTracker {
    best: Option<BestResult>,
}

impl BestTracker {
    pub fn best_loss(&self) -> f32 {
        self.best.as_ref().map_or(f32::INFINITY, |b| b.loss)
    }

    pub fn improves(&self, loss: f32) -> bool {
        loss < self.best_loss()
    }

    /// Stores the result if it improves on the current best; returns whether it did.
    pub fn offer(&mut self, loss: f32, step: usize, image: ImageTensor) -> bool {
        if !self.improves(loss) {
            return false;
        }
        self.best = Some(BestResult { loss, step, image });
        true
    }

    pub fn into_result(self) -> Result<BestResult, RefinementError> {
        self.best.ok_or(RefinementError::NoImprovement)
    }
}

/// Runs `config.total_iterations` optimization steps starting from `initial`.
///
/// `on_snapshot` is called after every step whose index is a multiple of
/// `config.show_steps`. The latent, the optimizer moments and every decoded
/// tensor are owned by this call and released when it returns, on success or
/// failure.
///
/// # Errors
/// Decoder failures, a non-finite loss, cancellation through `cancel`, and the
/// optional time limit all end the run with a [`RefinementError`].
pub fn run<D, F>(
    initial: &Latent,
    config: &RefinementConfig,
    composer: &LossComposer,
    decoder: &D,
    cancel: &CancellationToken,
    mut on_snapshot: F,
) -> Result<BestResult, RefinementError>
where
    D: Decoder + ?Sized,
    F: FnMut(&ProgressSnapshot),
{
    let started = Instant::now();
    let mut latent = initial.as_standard_layout().into_owned();
    let mut optimizer = Adam::with_learning_rate(latent.len(), config.learning_rate);
    let mut best = BestTracker::default();
    let total = config.total_iterations;

    for step in 0..total {
        if cancel.is_cancelled() {
            return Err(RefinementError::Cancelled { step });
        }
        if let Some(limit) = config.max_duration {
            if started.elapsed() >= limit {
                return Err(RefinementError::DeadlineExceeded { step, limit });
            }
        }
        let decode_err = |source| RefinementError::Decode { step, source };

        let image = decoder.decode(&latent).map_err(decode_err)?;
        let eval = composer.evaluate(&latent, &image);
        if !eval.value.is_finite() {
            return Err(RefinementError::NonFiniteLoss { step, value: eval.value });
        }
        trace!(step, loss = eval.value, "refinement step");

        let mut grad = decoder.backward(&latent, &eval.grad_image).map_err(decode_err)?;
        grad += &eval.grad_latent;
        let grad = grad.as_standard_layout();
        let (Some(grad), Some(params)) = (grad.as_slice(), latent.as_slice_mut()) else {
            return Err(RefinementError::Layout);
        };
        optimizer.update_params(grad, params)?;

        // Both the snapshot and the best-result image come from the post-step
        // latent, so one decode can serve both.
        let mut decoded = None;
        if step % config.show_steps.get() == 0 {
            let snapshot = ProgressSnapshot {
                step,
                total,
                image: decoder.decode(&latent).map_err(decode_err)?,
            };
            on_snapshot(&snapshot);
            decoded = Some(snapshot.image);
        }

        if best.improves(eval.value) {
            let image = match decoded {
                Some(image) => image,
                None => decoder.decode(&latent).map_err(decode_err)?,
            };
            best.offer(eval.value, step, image);
            debug!(step, loss = eval.value, "new best result");
        }
    }

    best.into_result()
}
