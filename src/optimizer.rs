use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("gradient has {grad} entries but there are {params} parameters")]
pub struct SizeMismatch {
    pub grad: usize,
    pub params: usize,
}

/// Defines the strategy for updating parameters from their gradient.
pub trait Optimizer {
    /// Applies one update to `params` in place.
    ///
    /// # Errors
    /// [`SizeMismatch`] if `grad` and `params` differ in length.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<(), SizeMismatch>;
}

/// Adam with bias-corrected first and second moment estimates.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Box<[f32]>,
    v: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    pub const BETA1: f32 = 0.9;
    pub const BETA2: f32 = 0.999;
    pub const EPSILON: f32 = 1e-8;

    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of change per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }

    /// Adam with the usual betas and epsilon.
    pub fn with_learning_rate(len: usize, learning_rate: f32) -> Self {
        Self::new(len, learning_rate, Self::BETA1, Self::BETA2, Self::EPSILON)
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<(), SizeMismatch> {
        if grad.len() != params.len() || params.len() != self.m.len() {
            return Err(SizeMismatch {
                grad: grad.len(),
                params: params.len(),
            });
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr / bc1;
        let bc2_sqrt = bc2.sqrt();

        params
            .iter_mut()
            .zip(grad)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
            .for_each(|(((p, g), m), v)| {
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g.powi(2);
                *p -= step_size * *m / (v.sqrt() / bc2_sqrt + eps);
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_learning_rate_against_gradient() {
        let mut adam = Adam::with_learning_rate(3, 0.1);
        let mut params = [1.0, -2.0, 0.5];
        adam.update_params(&[0.3, -4.0, 0.0], &mut params).unwrap();
        assert!((params[0] - 0.9).abs() < 1e-5);
        assert!((params[1] + 1.9).abs() < 1e-5);
        assert_eq!(params[2], 0.5);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut adam = Adam::with_learning_rate(1, 0.1);
        let mut x = [5.0f32];
        for _ in 0..500 {
            let grad = [2.0 * x[0]];
            adam.update_params(&grad, &mut x).unwrap();
        }
        assert!(x[0].abs() < 0.1);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let mut adam = Adam::with_learning_rate(2, 0.1);
        let mut params = [0.0; 2];
        assert_eq!(
            adam.update_params(&[1.0], &mut params),
            Err(SizeMismatch { grad: 1, params: 2 })
        );
    }
}
