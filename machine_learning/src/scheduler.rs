use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::optimization::Optimizer;

/// The exportable state of a `StepLr` schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepLrState {
    pub base_lr: f32,
    pub step_size: NonZeroUsize,
    pub gamma: f32,
    pub last_epoch: usize,
}

/// Decays the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    base_lr: f32,
    step_size: NonZeroUsize,
    gamma: f32,
    last_epoch: usize,
}

impl StepLr {
    /// Creates a new `StepLr` anchored at the optimizer's current learning rate.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer whose learning rate will be driven.
    /// * `step_size` - The amount of epochs between decays.
    /// * `gamma` - The multiplicative decay factor.
    pub fn new<O: Optimizer>(optimizer: &O, step_size: NonZeroUsize, gamma: f32) -> Self {
        Self {
            base_lr: optimizer.learning_rate(),
            step_size,
            gamma,
            last_epoch: 0,
        }
    }

    /// The learning rate the schedule assigns to `epoch`.
    pub fn lr_at(&self, epoch: usize) -> f32 {
        let decays = (epoch / self.step_size.get()) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Moves the schedule to `epoch` and applies the matching learning rate to the optimizer.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O, epoch: usize) {
        self.last_epoch = epoch;
        optimizer.set_learning_rate(self.lr_at(epoch));
    }

    pub fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    pub fn state_dict(&self) -> StepLrState {
        StepLrState {
            base_lr: self.base_lr,
            step_size: self.step_size,
            gamma: self.gamma,
            last_epoch: self.last_epoch,
        }
    }

    pub fn load_state_dict(&mut self, state: &StepLrState) {
        self.base_lr = state.base_lr;
        self.step_size = state.step_size;
        self.gamma = state.gamma;
        self.last_epoch = state.last_epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::GradientDescent;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= 1e-6 * b.abs().max(1.)
    }

    #[test]
    fn decays_every_step_size_epochs() {
        let mut optimizer = GradientDescent::new(0.4);
        let mut schedule = StepLr::new(&optimizer, NonZeroUsize::new(30).unwrap(), 0.1);

        schedule.step(&mut optimizer, 0);
        assert!(close(optimizer.learning_rate(), 0.4));

        schedule.step(&mut optimizer, 29);
        assert!(close(optimizer.learning_rate(), 0.4));

        schedule.step(&mut optimizer, 30);
        assert!(close(optimizer.learning_rate(), 0.04));

        schedule.step(&mut optimizer, 65);
        assert!(close(optimizer.learning_rate(), 0.004));
        assert_eq!(schedule.last_epoch(), 65);
    }

    #[test]
    fn jumping_back_restores_the_earlier_rate() {
        let mut optimizer = GradientDescent::new(1.0);
        let mut schedule = StepLr::new(&optimizer, NonZeroUsize::new(2).unwrap(), 0.5);

        schedule.step(&mut optimizer, 5);
        schedule.step(&mut optimizer, 1);
        assert!(close(optimizer.learning_rate(), 1.0));
    }

    #[test]
    fn state_survives_a_reload() {
        let optimizer = GradientDescent::new(0.1);
        let mut a = StepLr::new(&optimizer, NonZeroUsize::new(3).unwrap(), 0.5);
        a.last_epoch = 7;

        let mut b = StepLr::new(&GradientDescent::new(9.0), NonZeroUsize::new(1).unwrap(), 0.9);
        b.load_state_dict(&a.state_dict());

        assert_eq!(b.state_dict(), a.state_dict());
        assert!(close(b.lr_at(7), a.lr_at(7)));
    }
}
