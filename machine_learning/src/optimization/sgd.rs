use serde::{Deserialize, Serialize};

use super::Optimizer;
use crate::{MlErr, Result};

/// The scalar settings of an `Sgd` optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdHyper {
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

/// Everything an `Sgd` optimizer needs to resume exactly where it left off.
#[derive(Debug, Clone, PartialEq)]
pub struct SgdState {
    pub hyper: SgdHyper,
    pub velocity: Vec<f32>,
}

/// Stochastic gradient descent with momentum and L2 weight decay.
///
/// Each step computes `d = g + weight_decay * p`, `v = momentum * v + d` and `p -= lr * v`.
#[derive(Debug, Clone)]
pub struct Sgd {
    hyper: SgdHyper,
    velocity: Box<[f32]>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - The velocity decay.
    /// * `weight_decay` - The L2 penalty coefficient.
    ///
    /// # Returns
    /// A new `Sgd` instance.
    pub fn new(len: usize, learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            hyper: SgdHyper {
                learning_rate,
                momentum,
                weight_decay,
            },
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }

    pub fn hyper(&self) -> SgdHyper {
        self.hyper
    }

    pub fn velocity(&self) -> &[f32] {
        &self.velocity
    }

    /// Exports the optimizer state.
    pub fn state_dict(&self) -> SgdState {
        SgdState {
            hyper: self.hyper,
            velocity: self.velocity.to_vec(),
        }
    }

    /// Overwrites the optimizer state, the velocity must match the amount of parameters.
    pub fn load_state_dict(&mut self, state: &SgdState) -> Result<()> {
        if state.velocity.len() != self.velocity.len() {
            return Err(MlErr::SizeMismatch {
                what: "optimizer velocity",
                got: state.velocity.len(),
                expected: self.velocity.len(),
            });
        }

        self.hyper = state.hyper;
        self.velocity.copy_from_slice(&state.velocity);
        Ok(())
    }
}

impl Optimizer for Sgd {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        if grad.len() != params.len() || params.len() != self.velocity.len() {
            return Err(MlErr::SizeMismatch {
                what: "gradient",
                got: grad.len(),
                expected: self.velocity.len(),
            });
        }

        let SgdHyper {
            learning_rate: lr,
            momentum: mu,
            weight_decay: wd,
        } = self.hyper;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                let d = g + wd * *p;
                *v = (mu * *v) + d;
                *p -= lr * *v;
            });

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.hyper.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.hyper.learning_rate = learning_rate;
    }
}
