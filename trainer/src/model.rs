use std::sync::Arc;

use distributed::ProcessGroup;
use machine_learning::{
    amp::LossScaler,
    arch::{Mode, Model, Sequential},
    optimization::Optimizer,
};
use ndarray::{Array2, ArrayView2};

use crate::Result;

/// A model replica whose gradients are averaged across the process group before every step.
pub struct DistributedModel {
    module: Sequential,
    scaler: LossScaler,
    group: Arc<dyn ProcessGroup>,
}

impl DistributedModel {
    pub fn new(module: Sequential, scaler: LossScaler, group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            module,
            scaler,
            group,
        }
    }

    pub fn module(&self) -> &Sequential {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Sequential {
        &mut self.module
    }

    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }

    pub fn scaler_mut(&mut self) -> &mut LossScaler {
        &mut self.scaler
    }

    pub fn train(&mut self) {
        self.module.set_mode(Mode::Train);
    }

    pub fn eval(&mut self) {
        self.module.set_mode(Mode::Eval);
    }

    pub fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        Ok(self.module.forward(x)?)
    }

    pub fn zero_grad(&mut self) {
        self.module.zero_grad();
    }

    /// Backpropagates the scaled loss derivative and averages the gradient over every rank.
    ///
    /// Blocks until every rank of the group has finished its own backward pass.
    ///
    /// # Arguments
    /// * `d` - The derivative of the loss with respect to the last forward output.
    ///
    /// # Returns
    /// Whether the averaged gradient overflowed. Every rank sees the same gradient and so
    /// reaches the same verdict.
    pub fn backward_and_sync(&mut self, mut d: Array2<f32>) -> Result<bool> {
        self.scaler.scale(&mut d);
        self.module.backward(d)?;

        let grad = self.module.grad_mut();
        self.scaler.store(grad);
        self.group.all_reduce_mean(grad)?;

        Ok(self.scaler.unscale(grad))
    }

    /// Steps `optimizer` unless the gradient overflowed, then adjusts the loss scale.
    ///
    /// # Returns
    /// Whether the parameters were updated.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O, found_inf: bool) -> Result<bool> {
        if !found_inf {
            let (params, grad) = self.module.params_and_grad();
            optimizer.update_params(params, grad)?;
        }

        self.scaler.update(found_inf);
        Ok(!found_inf)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use distributed::{LocalGroup, Rendezvous};
    use machine_learning::{
        amp::{LossScaleConfig, Precision},
        arch::layers::Dense,
        optimization::GradientDescent,
    };
    use ndarray::array;

    use super::*;

    fn single_rank(name: &str) -> Arc<dyn ProcessGroup> {
        let rendezvous = Rendezvous::Local(name.into());
        Arc::new(LocalGroup::join(&rendezvous, 1, 0, Duration::from_secs(1)).unwrap())
    }

    fn model(scaler: LossScaler, name: &str) -> DistributedModel {
        let mut module = Sequential::new([Dense::new((2, 1), None)]);
        module.params_mut().copy_from_slice(&[1.0, 1.0, 0.0]);
        DistributedModel::new(module, scaler, single_rank(name))
    }

    #[test]
    fn scaled_backward_yields_the_unscaled_gradient() {
        let scaler = LossScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                ..LossScaleConfig::default()
            },
            Precision::Half,
        );
        let mut model = model(scaler, "dm-scaled");

        model.forward(array![[1.0f32, 2.0]].view()).unwrap();
        model.zero_grad();
        let found_inf = model.backward_and_sync(array![[0.5f32]]).unwrap();

        assert!(!found_inf);
        assert_eq!(model.module().grad(), &[0.5, 1.0, 0.5]);

        let mut sgd = GradientDescent::new(1.0);
        assert!(model.step(&mut sgd, found_inf).unwrap());
        assert_eq!(model.module().params(), &[0.5, 0.0, -0.5]);
    }

    #[test]
    fn overflow_skips_the_step_and_backs_off() {
        let mut model = model(LossScaler::new(Precision::Half), "dm-overflow");

        model.forward(array![[1.0f32, 2.0]].view()).unwrap();
        model.zero_grad();
        let found_inf = model.backward_and_sync(array![[4.0f32]]).unwrap();
        assert!(found_inf);

        let mut sgd = GradientDescent::new(1.0);
        assert!(!model.step(&mut sgd, found_inf).unwrap());
        assert_eq!(model.module().params(), &[1.0, 1.0, 0.0]);
        assert_eq!(model.scaler().loss_scale(), 32768.0);
    }
}
